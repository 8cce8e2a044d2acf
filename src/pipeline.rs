//! Stage-by-stage training and query pipeline.
//!
//! ```text
//! training:  libraries ─► build_features ─► profile_distances ─► select_eps
//!                               │                                    │
//!                               ▼                                    ▼
//!                        train_classifier ◄── merge_signatures ◄── cluster
//!
//! query:     library ─► classify (trained model)
//!            library ─► recommend (merged signatures + member libraries)
//! ```
//!
//! Each stage takes only the outputs of earlier stages and returns an
//! owned, serializable value, so any stage can be rerun from a saved
//! checkpoint. [`Pipeline::train`] chains the training stages.

use serde::{Deserialize, Serialize};

use crate::catalog::{GameTagMap, UserLibraries, UserLibrary};
use crate::classify::{KnnClassifier, TrainedClassifier};
use crate::cluster::{ClusterLabel, Dbscan, KDistanceProfile, NeighborDistanceProfiler, NOISE};
use crate::config::PipelineConfig;
use crate::error::{Error, Result};
use crate::features::{FeatureMatrix, FeatureMatrixBuilder};
use crate::metrics::ClusteringScores;
use crate::recommend::{top_user_tags, Recommendation, RecommendationScorer};
use crate::signature::{ClusterSignatureMerger, MergedClusters};

/// DBSCAN labels for a feature matrix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterAssignment {
    /// Neighborhood radius used.
    pub eps: f32,
    /// Core point threshold used.
    pub min_samples: usize,
    /// DBSCAN label per feature matrix row.
    pub labels: Vec<ClusterLabel>,
    /// Core-point mask per row.
    pub core: Vec<bool>,
    /// Members per cluster id.
    pub sizes: Vec<usize>,
}

impl ClusterAssignment {
    pub fn n_clusters(&self) -> usize {
        self.sizes.len()
    }

    pub fn n_noise(&self) -> usize {
        self.labels.iter().filter(|&&l| l == NOISE).count()
    }

    pub fn noise_fraction(&self) -> f64 {
        if self.labels.is_empty() {
            return 0.0;
        }
        self.n_noise() as f64 / self.labels.len() as f64
    }
}

/// Every artifact of one training run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingRun {
    /// One row per user with visible playtime.
    pub features: FeatureMatrix,
    /// Absent when eps was configured explicitly.
    pub profile: Option<KDistanceProfile>,
    /// Labels before merging.
    pub assignment: ClusterAssignment,
    /// Merged signatures, labels and members.
    pub merged: MergedClusters,
    /// Router trained on the merged labels.
    pub classifier: TrainedClassifier,
}

impl TrainingRun {
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| Error::InputData(format!("failed to serialize training run: {e}")))
    }

    /// Restore a saved run. The embedded classifier is re-verified.
    pub fn from_json(json: &str) -> Result<Self> {
        let run: Self = serde_json::from_str(json)
            .map_err(|e| Error::InputData(format!("malformed training run: {e}")))?;
        let classifier = TrainedClassifier::from_json(&run.classifier.to_json()?)?;
        Ok(Self { classifier, ..run })
    }
}

/// The behavioral clustering pipeline.
#[derive(Debug, Clone, Default)]
pub struct Pipeline {
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Builder over the catalog vocabulary minus the excluded tags.
    pub fn feature_builder(&self, tags: &GameTagMap) -> Result<FeatureMatrixBuilder> {
        FeatureMatrixBuilder::new(tags, &self.config.exclude_tags, self.config.normalization)
    }

    /// Vectorize every library with visible playtime, trimmed to its top-N games.
    pub fn build_features(&self, tags: &GameTagMap, libraries: &UserLibraries) -> Result<FeatureMatrix> {
        let (visible, _hidden) = libraries.without_hidden();
        let trimmed = visible.trimmed(self.config.library_top_n);
        self.feature_builder(tags)?.build(&trimmed)
    }

    pub fn profile_distances(&self, features: &FeatureMatrix) -> Result<KDistanceProfile> {
        NeighborDistanceProfiler::new(self.config.profile.k)
            .with_sensitivity(self.config.profile.sensitivity)
            .with_interpolation(self.config.profile.interpolation)
            .profile(&features.rows())
    }

    /// Configured eps if set, otherwise the profile's elbow.
    ///
    /// # Errors
    ///
    /// [`Error::EpsRequired`] when neither is available.
    pub fn select_eps(&self, profile: Option<&KDistanceProfile>) -> Result<f32> {
        if let Some(eps) = self.config.cluster.eps {
            return Ok(eps);
        }
        profile
            .and_then(KDistanceProfile::suggested_eps)
            .ok_or(Error::EpsRequired {
                points: profile.map_or(0, |p| p.distances.len()),
            })
    }

    /// Run DBSCAN.
    ///
    /// # Errors
    ///
    /// [`Error::DegenerateClustering`] when fewer than two clusters emerge.
    pub fn cluster(&self, features: &FeatureMatrix, eps: f32) -> Result<ClusterAssignment> {
        let min_samples = self.config.cluster.min_samples;
        let fit = Dbscan::new(eps, min_samples).fit(&features.rows())?;

        let n_clusters = fit.n_clusters();
        let mut sizes = vec![0usize; n_clusters];
        for &label in fit.labels.iter().filter(|&&l| l != NOISE) {
            sizes[label as usize] += 1;
        }
        let assignment = ClusterAssignment {
            eps,
            min_samples,
            labels: fit.labels,
            core: fit.core,
            sizes,
        };

        if n_clusters < 2 {
            tracing::warn!(
                eps,
                min_samples,
                clusters = n_clusters,
                noise = assignment.n_noise(),
                "degenerate clustering"
            );
            return Err(Error::DegenerateClustering {
                clusters: n_clusters,
                noise: assignment.n_noise(),
                total: assignment.labels.len(),
            });
        }

        tracing::info!(
            eps,
            min_samples,
            clusters = n_clusters,
            sizes = ?assignment.sizes,
            noise_fraction = assignment.noise_fraction(),
            "clustered users"
        );
        Ok(assignment)
    }

    pub fn merge_signatures(
        &self,
        features: &FeatureMatrix,
        assignment: &ClusterAssignment,
    ) -> Result<MergedClusters> {
        ClusterSignatureMerger::new(self.config.merge.threshold)
            .with_strategy(self.config.merge.strategy)
            .merge(features, &assignment.labels)
    }

    pub fn train_classifier(
        &self,
        features: &FeatureMatrix,
        merged: &MergedClusters,
    ) -> Result<TrainedClassifier> {
        let classifier = &self.config.classifier;
        KnnClassifier::new()
            .with_k_candidates(classifier.k_candidates.clone())
            .with_folds(classifier.folds)
            .with_shuffle_seed(classifier.shuffle_seed)
            .fit(features, &merged.labels)
    }

    /// Every training stage in order.
    pub fn train(&self, tags: &GameTagMap, libraries: &UserLibraries) -> Result<TrainingRun> {
        let features = self.build_features(tags, libraries)?;
        let profile = match self.config.cluster.eps {
            Some(_) => None,
            None => Some(self.profile_distances(&features)?),
        };
        let eps = self.select_eps(profile.as_ref())?;
        let assignment = self.cluster(&features, eps)?;
        let merged = self.merge_signatures(&features, &assignment)?;
        let classifier = self.train_classifier(&features, &merged)?;
        Ok(TrainingRun {
            features,
            profile,
            assignment,
            merged,
            classifier,
        })
    }

    /// Route a new user to a merged cluster with a trained model.
    ///
    /// The library is vectorized over the model's own vocabulary and
    /// normalization.
    pub fn classify(
        &self,
        tags: &GameTagMap,
        classifier: &TrainedClassifier,
        library: &UserLibrary,
    ) -> Result<usize> {
        let builder = FeatureMatrixBuilder::with_vocabulary(
            tags,
            classifier.vocabulary().clone(),
            classifier.normalization(),
        );
        classifier.predict(&builder.vectorize(&library.top_n(self.config.library_top_n)))
    }

    /// Recommend games to `user` from the merged clusters.
    ///
    /// The user's tag profile uses their top-N games; ownership uses the
    /// whole library.
    pub fn recommend(
        &self,
        tags: &GameTagMap,
        user: &UserLibrary,
        merged: &MergedClusters,
        libraries: &UserLibraries,
    ) -> Result<Recommendation> {
        let recommend = &self.config.recommend;
        let user_tags = top_user_tags(
            &user.top_n(self.config.library_top_n),
            tags,
            &recommend.blacklist,
            recommend.top_tags,
        );
        RecommendationScorer::new(recommend.cutoff)
            .with_games_per_cluster(recommend.games_per_cluster)
            .recommend(&user_tags, user, merged, libraries)
    }

    /// Score a run's merged labels against ground truth, one label per
    /// feature matrix row.
    pub fn evaluate<T>(&self, run: &TrainingRun, truth: &[T]) -> Result<ClusteringScores>
    where
        T: Copy + Eq + std::hash::Hash,
    {
        if truth.len() != run.merged.labels.len() {
            return Err(Error::DimensionMismatch {
                expected: run.merged.labels.len(),
                found: truth.len(),
            });
        }
        let scores = ClusteringScores::compute(&run.merged.labels, truth);
        tracing::info!(
            ari = scores.ari,
            nmi = scores.nmi,
            agreement = scores.agreement,
            noise_fraction = scores.noise_fraction,
            "evaluated clustering"
        );
        Ok(scores)
    }
}

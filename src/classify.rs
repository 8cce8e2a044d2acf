//! k-nearest-neighbor routing of new users into merged clusters.
//!
//! Training keeps every non-noise user's vector with its merged cluster id.
//! The neighbor count is chosen from a candidate list by stratified k-fold
//! cross-validation, and the fitted model is bound to the vocabulary and
//! normalization of the matrix it was trained on.
//!
//! # Fold allocation
//!
//! Classes are ordered by first appearance. Sorting the encoded labels and
//! dealing them round-robin over the folds fixes how many members of each
//! class land in each fold; each class's members are then assigned to folds
//! in input order (or in a seeded shuffled order). Every fold receives
//! `⌊n_c / folds⌋` or `⌈n_c / folds⌉` members of class `c`.
//!
//! # Voting
//!
//! Uniform weights over Euclidean neighbors. Equal distances keep the lower
//! training index; equal vote counts go to the smallest cluster id.

use std::collections::{BTreeMap, HashMap};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::cluster::{euclidean, ClusterLabel, NOISE};
use crate::error::{Error, Result};
use crate::features::{FeatureMatrix, FeatureVector, Normalization, Vocabulary};

/// Odd neighbor counts 1 through 21.
pub fn default_k_candidates() -> Vec<usize> {
    (1..=21).step_by(2).collect()
}

/// Stratified k-fold assignment.
#[derive(Debug, Clone)]
pub struct StratifiedKFold {
    n_splits: usize,
    shuffle_seed: Option<u64>,
}

impl StratifiedKFold {
    pub fn new(n_splits: usize) -> Self {
        Self {
            n_splits,
            shuffle_seed: None,
        }
    }

    /// Shuffle each class's fold order with a seeded RNG.
    pub fn with_shuffle_seed(mut self, seed: Option<u64>) -> Self {
        self.shuffle_seed = seed;
        self
    }

    pub fn n_splits(&self) -> usize {
        self.n_splits
    }

    /// Test fold of every sample.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidParameter`] for fewer than two splits,
    /// [`Error::InsufficientSamples`] when a class has fewer members than
    /// there are splits.
    pub fn assign(&self, labels: &[usize]) -> Result<Vec<usize>> {
        if self.n_splits < 2 {
            return Err(Error::invalid("folds", "need at least 2 folds"));
        }
        if labels.is_empty() {
            return Err(Error::EmptyInput);
        }

        // Encode classes by first appearance.
        let mut codes: HashMap<usize, usize> = HashMap::new();
        let mut classes: Vec<usize> = Vec::new();
        let encoded: Vec<usize> = labels
            .iter()
            .map(|&label| {
                *codes.entry(label).or_insert_with(|| {
                    classes.push(label);
                    classes.len() - 1
                })
            })
            .collect();
        let n_classes = classes.len();

        let mut counts = vec![0usize; n_classes];
        for &c in &encoded {
            counts[c] += 1;
        }
        for (code, &count) in counts.iter().enumerate() {
            if count < self.n_splits {
                return Err(Error::InsufficientSamples {
                    context: format!(
                        "stratified {}-fold split (cluster {})",
                        self.n_splits, classes[code]
                    ),
                    required: self.n_splits,
                    found: count,
                });
            }
        }

        // allocation[f][c]: members of class c in fold f.
        let mut order = encoded.clone();
        order.sort_unstable();
        let mut allocation = vec![vec![0usize; n_classes]; self.n_splits];
        for (position, &c) in order.iter().enumerate() {
            allocation[position % self.n_splits][c] += 1;
        }

        let mut rng = self.shuffle_seed.map(StdRng::seed_from_u64);
        let mut folds = vec![0usize; labels.len()];
        for c in 0..n_classes {
            let mut folds_for_class: Vec<usize> = (0..self.n_splits)
                .flat_map(|f| std::iter::repeat(f).take(allocation[f][c]))
                .collect();
            if let Some(rng) = rng.as_mut() {
                folds_for_class.shuffle(rng);
            }
            let members = encoded.iter().enumerate().filter(|&(_, &e)| e == c);
            for ((sample, _), fold) in members.zip(folds_for_class) {
                folds[sample] = fold;
            }
        }
        Ok(folds)
    }

    /// `(train, test)` index lists per fold.
    pub fn splits(&self, labels: &[usize]) -> Result<Vec<(Vec<usize>, Vec<usize>)>> {
        let folds = self.assign(labels)?;
        Ok((0..self.n_splits)
            .map(|f| {
                (0..labels.len()).partition::<Vec<usize>, _>(|&i| folds[i] != f)
            })
            .collect())
    }
}

/// Cross-validated accuracy of one candidate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CvScore {
    /// Candidate neighbor count.
    pub k: usize,
    /// Mean fold accuracy; `None` when `k` exceeds the smallest training fold.
    pub mean_accuracy: Option<f64>,
}

/// Grid search over neighbor counts.
#[derive(Debug, Clone)]
pub struct KnnClassifier {
    k_candidates: Vec<usize>,
    folds: usize,
    shuffle_seed: Option<u64>,
}

impl Default for KnnClassifier {
    fn default() -> Self {
        Self {
            k_candidates: default_k_candidates(),
            folds: 5,
            shuffle_seed: None,
        }
    }
}

impl KnnClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_k_candidates(mut self, k_candidates: Vec<usize>) -> Self {
        self.k_candidates = k_candidates;
        self
    }

    pub fn with_folds(mut self, folds: usize) -> Self {
        self.folds = folds;
        self
    }

    pub fn with_shuffle_seed(mut self, seed: Option<u64>) -> Self {
        self.shuffle_seed = seed;
        self
    }

    /// Fit on the non-noise rows of `features`.
    ///
    /// # Errors
    ///
    /// - [`Error::DimensionMismatch`] if `labels` and `features` disagree in length.
    /// - [`Error::DegenerateClustering`] with fewer than two clusters.
    /// - [`Error::InsufficientSamples`] if a cluster is smaller than the fold count.
    pub fn fit(&self, features: &FeatureMatrix, labels: &[ClusterLabel]) -> Result<TrainedClassifier> {
        if labels.len() != features.n_users() {
            return Err(Error::DimensionMismatch {
                expected: features.n_users(),
                found: labels.len(),
            });
        }
        if self.k_candidates.is_empty() || self.k_candidates.contains(&0) {
            return Err(Error::invalid(
                "k_candidates",
                "need at least one candidate, all positive",
            ));
        }

        let mut points = Vec::new();
        let mut classes = Vec::new();
        for (i, &label) in labels.iter().enumerate() {
            if label == NOISE {
                continue;
            }
            let class = usize::try_from(label)
                .map_err(|_| Error::InputData(format!("invalid cluster label {label}")))?;
            points.push(features.row(i).to_vec());
            classes.push(class);
        }

        let mut distinct = classes.clone();
        distinct.sort_unstable();
        distinct.dedup();
        if distinct.len() < 2 {
            return Err(Error::DegenerateClustering {
                clusters: distinct.len(),
                noise: labels.len() - points.len(),
                total: labels.len(),
            });
        }

        let folds = StratifiedKFold::new(self.folds)
            .with_shuffle_seed(self.shuffle_seed)
            .splits(&classes)?;
        let cv_scores = self.cross_validate(&points, &classes, &folds);

        let mut best: Option<CvScore> = None;
        for score in &cv_scores {
            tracing::debug!(k = score.k, accuracy = ?score.mean_accuracy, "cv candidate");
            let Some(accuracy) = score.mean_accuracy else {
                continue;
            };
            if best
                .and_then(|b| b.mean_accuracy)
                .map_or(true, |best_accuracy| accuracy > best_accuracy)
            {
                best = Some(*score);
            }
        }
        let best = best.ok_or_else(|| Error::InsufficientSamples {
            context: "k-nearest-neighbor search (every candidate exceeds the training fold size)"
                .to_string(),
            required: self.k_candidates.iter().copied().min().unwrap_or(1),
            found: folds.iter().map(|(train, _)| train.len()).min().unwrap_or(0),
        })?;

        tracing::info!(
            samples = points.len(),
            clusters = distinct.len(),
            k = best.k,
            accuracy = best.mean_accuracy,
            "trained cluster classifier"
        );

        let vocabulary = features.vocabulary().clone();
        Ok(TrainedClassifier {
            vocabulary_fingerprint: vocabulary.fingerprint(),
            vocabulary,
            normalization: features.normalization(),
            k: best.k,
            cv_scores,
            points,
            labels: classes,
        })
    }

    fn cross_validate(
        &self,
        points: &[Vec<f32>],
        classes: &[usize],
        folds: &[(Vec<usize>, Vec<usize>)],
    ) -> Vec<CvScore> {
        let min_train = folds.iter().map(|(train, _)| train.len()).min().unwrap_or(0);
        let max_k = self
            .k_candidates
            .iter()
            .copied()
            .filter(|&k| k <= min_train)
            .max()
            .unwrap_or(0);

        // Per fold, per test point: classes of its max_k nearest training points.
        let ranked: Vec<Vec<(usize, Vec<usize>)>> = folds
            .iter()
            .map(|(train, test)| {
                test.iter()
                    .map(|&t| {
                        let neighbors = nearest(points, train, &points[t], max_k)
                            .into_iter()
                            .map(|idx| classes[idx])
                            .collect();
                        (classes[t], neighbors)
                    })
                    .collect()
            })
            .collect();

        self.k_candidates
            .iter()
            .map(|&k| {
                if k > min_train {
                    return CvScore {
                        k,
                        mean_accuracy: None,
                    };
                }
                let total: f64 = ranked
                    .iter()
                    .map(|fold| {
                        let correct = fold
                            .iter()
                            .filter(|(truth, neighbors)| vote(&neighbors[..k]) == Some(*truth))
                            .count();
                        correct as f64 / fold.len().max(1) as f64
                    })
                    .sum();
                CvScore {
                    k,
                    mean_accuracy: Some(total / ranked.len() as f64),
                }
            })
            .collect()
    }
}

/// Indices (into `points`) of the `k` members of `candidates` closest to `query`.
fn nearest(points: &[Vec<f32>], candidates: &[usize], query: &[f32], k: usize) -> Vec<usize> {
    let mut by_distance: Vec<(f32, usize)> = candidates
        .iter()
        .map(|&idx| (euclidean(query, &points[idx]), idx))
        .collect();
    // Stable: equal distances keep candidate (index) order.
    by_distance.sort_by(|a, b| a.0.total_cmp(&b.0));
    by_distance.into_iter().take(k).map(|(_, idx)| idx).collect()
}

/// Majority class; ties go to the smallest class.
fn vote(neighbor_classes: &[usize]) -> Option<usize> {
    let mut counts: BTreeMap<usize, usize> = BTreeMap::new();
    for &class in neighbor_classes {
        *counts.entry(class).or_default() += 1;
    }
    let mut best: Option<(usize, usize)> = None;
    for (class, count) in counts {
        if best.map_or(true, |(_, c)| count > c) {
            best = Some((class, count));
        }
    }
    best.map(|(class, _)| class)
}

/// A fitted classifier bound to its training vocabulary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainedClassifier {
    vocabulary: Vocabulary,
    vocabulary_fingerprint: u64,
    normalization: Normalization,
    k: usize,
    cv_scores: Vec<CvScore>,
    points: Vec<Vec<f32>>,
    labels: Vec<usize>,
}

impl TrainedClassifier {
    /// Chosen neighbor count.
    pub fn k(&self) -> usize {
        self.k
    }

    pub fn vocabulary(&self) -> &Vocabulary {
        &self.vocabulary
    }

    pub fn normalization(&self) -> Normalization {
        self.normalization
    }

    pub fn cv_scores(&self) -> &[CvScore] {
        &self.cv_scores
    }

    /// Cross-validated accuracy of the chosen `k`.
    pub fn cv_accuracy(&self) -> Option<f64> {
        self.cv_scores
            .iter()
            .find(|s| s.k == self.k)
            .and_then(|s| s.mean_accuracy)
    }

    pub fn n_samples(&self) -> usize {
        self.points.len()
    }

    /// Predict the merged cluster of a vector.
    ///
    /// # Errors
    ///
    /// [`Error::VocabularyMismatch`] if the vector was built over another
    /// vocabulary, has another length, or used another normalization.
    pub fn predict(&self, vector: &FeatureVector) -> Result<usize> {
        if vector.vocabulary_fingerprint() != self.vocabulary_fingerprint
            || vector.len() != self.vocabulary.len()
            || vector.normalization() != self.normalization
        {
            return Err(Error::VocabularyMismatch {
                expected_fingerprint: self.vocabulary_fingerprint,
                found_fingerprint: vector.vocabulary_fingerprint(),
                expected_len: self.vocabulary.len(),
                found_len: vector.len(),
            });
        }
        let all: Vec<usize> = (0..self.points.len()).collect();
        let neighbors: Vec<usize> = nearest(&self.points, &all, vector.weights(), self.k)
            .into_iter()
            .map(|idx| self.labels[idx])
            .collect();
        vote(&neighbors).ok_or(Error::EmptyInput)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| Error::InputData(format!("failed to serialize classifier: {e}")))
    }

    /// Load a classifier saved with [`to_json`](Self::to_json).
    ///
    /// # Errors
    ///
    /// [`Error::InputData`] on malformed JSON or an inconsistent artifact,
    /// [`Error::VocabularyMismatch`] when the stored fingerprint does not
    /// match the stored vocabulary.
    pub fn from_json(json: &str) -> Result<Self> {
        let model: Self = serde_json::from_str(json)
            .map_err(|e| Error::InputData(format!("malformed classifier artifact: {e}")))?;
        let actual = model.vocabulary.fingerprint();
        if actual != model.vocabulary_fingerprint {
            return Err(Error::VocabularyMismatch {
                expected_fingerprint: model.vocabulary_fingerprint,
                found_fingerprint: actual,
                expected_len: model.vocabulary.len(),
                found_len: model.vocabulary.len(),
            });
        }
        if model.points.len() != model.labels.len()
            || model.points.iter().any(|p| p.len() != model.vocabulary.len())
        {
            return Err(Error::InputData(
                "classifier artifact has inconsistent training data".to_string(),
            ));
        }
        if model.k == 0 || model.k > model.points.len() {
            return Err(Error::InputData(format!(
                "classifier artifact has k = {} for {} samples",
                model.k,
                model.points.len()
            )));
        }
        Ok(model)
    }
}

//! Pipeline configuration.
//!
//! Every knob has a default matching the reference deployment (row-max
//! normalization, 4-neighbor knee profile, `min_samples = 3`, merge
//! threshold 0.5, odd k from 1 to 21 under 5-fold CV, 10% affinity cutoff).
//! Values can be overridden with builders, deserialized from YAML, or read
//! from `PLAYSTYLE_*` environment variables.

use std::collections::BTreeSet;
use std::env;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cluster::Interpolation;
use crate::features::Normalization;
use crate::signature::MergeStrategy;

/// Tags so common across the catalog that they carry no behavioral signal.
pub const GENERIC_TAGS: [&str; 10] = [
    "Action",
    "RPG",
    "Adventure",
    "Indie",
    "Strategy",
    "Open World",
    "Simulation",
    "Singleplayer",
    "Casual",
    "FPS",
];

/// Tags ignored when ranking a querying user's own tags.
pub const QUERY_BLACKLIST_EXTRA: [&str; 3] = ["Free to Play", "Multiplayer", "Early Access"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {name}: {source}")]
    Invalid {
        name: &'static str,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("{name} out of range: {message}")]
    OutOfRange { name: &'static str, message: String },
    #[error("malformed YAML configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// k-distance profiling parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileConfig {
    /// Neighbor count, counting the point itself.
    pub k: usize,
    /// Kneedle sensitivity `S`.
    pub sensitivity: f64,
    /// Smoothing of the k-distance curve before knee detection.
    pub interpolation: Interpolation,
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self {
            k: 4,
            sensitivity: 1.0,
            interpolation: Interpolation::default(),
        }
    }
}

/// Density clustering parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Explicit eps. `None` means use the profiled elbow.
    pub eps: Option<f32>,
    /// Points within eps, the point itself included, that make a core point.
    pub min_samples: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            eps: None,
            min_samples: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    /// Minimum Jaccard similarity of two signatures for a merge.
    pub threshold: f64,
    /// One pass over the pairs, or transitive closure.
    pub strategy: MergeStrategy,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            threshold: 0.5,
            strategy: MergeStrategy::SinglePass,
        }
    }
}

/// Cross-validated kNN search parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Candidate neighbor counts, searched in order.
    pub k_candidates: Vec<usize>,
    /// Stratified cross-validation folds.
    pub folds: usize,
    /// Shuffle each class's fold assignment with this seed.
    pub shuffle_seed: Option<u64>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            k_candidates: (1..=21).step_by(2).collect(),
            folds: 5,
            shuffle_seed: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecommendConfig {
    /// Clusters at or below this normalized affinity are dropped.
    pub cutoff: f64,
    /// Games taken from each kept cluster before deduplication.
    pub games_per_cluster: usize,
    /// How many of the user's tags are compared against signatures.
    pub top_tags: usize,
    /// Tags ignored when ranking the user's tags.
    pub blacklist: BTreeSet<String>,
}

impl Default for RecommendConfig {
    fn default() -> Self {
        Self {
            cutoff: 0.10,
            games_per_cluster: 3,
            top_tags: 10,
            blacklist: GENERIC_TAGS
                .iter()
                .chain(QUERY_BLACKLIST_EXTRA.iter())
                .map(|t| (*t).to_string())
                .collect(),
        }
    }
}

/// Full pipeline configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub normalization: Normalization,
    /// Tags dropped from the feature vocabulary.
    pub exclude_tags: BTreeSet<String>,
    /// Libraries are trimmed to this many games by playtime before vectorizing.
    pub library_top_n: usize,
    pub profile: ProfileConfig,
    pub cluster: ClusterConfig,
    pub merge: MergeConfig,
    pub classifier: ClassifierConfig,
    pub recommend: RecommendConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            normalization: Normalization::RowMax,
            exclude_tags: GENERIC_TAGS.iter().map(|t| (*t).to_string()).collect(),
            library_top_n: 25,
            profile: ProfileConfig::default(),
            cluster: ClusterConfig::default(),
            merge: MergeConfig::default(),
            classifier: ClassifierConfig::default(),
            recommend: RecommendConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn with_normalization(mut self, normalization: Normalization) -> Self {
        self.normalization = normalization;
        self
    }

    pub fn with_exclude_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude_tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_blacklist<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.recommend.blacklist = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_library_top_n(mut self, n: usize) -> Self {
        self.library_top_n = n;
        self
    }

    pub fn with_eps(mut self, eps: f32) -> Self {
        self.cluster.eps = Some(eps);
        self
    }

    pub fn with_min_samples(mut self, min_samples: usize) -> Self {
        self.cluster.min_samples = min_samples;
        self
    }

    pub fn with_profile_k(mut self, k: usize) -> Self {
        self.profile.k = k;
        self
    }

    pub fn with_merge_threshold(mut self, threshold: f64) -> Self {
        self.merge.threshold = threshold;
        self
    }

    pub fn with_merge_strategy(mut self, strategy: MergeStrategy) -> Self {
        self.merge.strategy = strategy;
        self
    }

    pub fn with_k_candidates(mut self, candidates: Vec<usize>) -> Self {
        self.classifier.k_candidates = candidates;
        self
    }

    pub fn with_folds(mut self, folds: usize) -> Self {
        self.classifier.folds = folds;
        self
    }

    pub fn with_shuffle_seed(mut self, seed: u64) -> Self {
        self.classifier.shuffle_seed = Some(seed);
        self
    }

    pub fn with_cutoff(mut self, cutoff: f64) -> Self {
        self.recommend.cutoff = cutoff;
        self
    }

    /// Parse a YAML document. Missing fields keep their defaults.
    ///
    /// # Errors
    /// Returns [`ConfigError::Yaml`] on malformed input and
    /// [`ConfigError::OutOfRange`] if a value fails [`Self::validate`].
    pub fn from_yaml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Read overrides from `PLAYSTYLE_*` environment variables on top of the defaults.
    ///
    /// List-valued variables are comma separated. An empty list variable clears the list.
    ///
    /// # Errors
    /// Returns [`ConfigError`] when a variable fails to parse or a value is out of range.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            normalization: parse_or("PLAYSTYLE_NORMALIZATION", defaults.normalization)?,
            exclude_tags: parse_tag_list("PLAYSTYLE_EXCLUDE_TAGS", defaults.exclude_tags),
            library_top_n: parse_or("PLAYSTYLE_LIBRARY_TOP_N", defaults.library_top_n)?,
            profile: ProfileConfig {
                k: parse_or("PLAYSTYLE_KNEE_NEIGHBORS", defaults.profile.k)?,
                sensitivity: parse_or("PLAYSTYLE_KNEE_SENSITIVITY", defaults.profile.sensitivity)?,
                interpolation: parse_or(
                    "PLAYSTYLE_KNEE_INTERPOLATION",
                    defaults.profile.interpolation,
                )?,
            },
            cluster: ClusterConfig {
                eps: parse_optional("PLAYSTYLE_EPS")?.or(defaults.cluster.eps),
                min_samples: parse_or("PLAYSTYLE_MIN_SAMPLES", defaults.cluster.min_samples)?,
            },
            merge: MergeConfig {
                threshold: parse_or("PLAYSTYLE_MERGE_THRESHOLD", defaults.merge.threshold)?,
                strategy: parse_or("PLAYSTYLE_MERGE_STRATEGY", defaults.merge.strategy)?,
            },
            classifier: ClassifierConfig {
                k_candidates: parse_usize_list(
                    "PLAYSTYLE_K_CANDIDATES",
                    defaults.classifier.k_candidates,
                )?,
                folds: parse_or("PLAYSTYLE_CV_FOLDS", defaults.classifier.folds)?,
                shuffle_seed: parse_optional("PLAYSTYLE_CV_SHUFFLE_SEED")?
                    .or(defaults.classifier.shuffle_seed),
            },
            recommend: RecommendConfig {
                cutoff: parse_or("PLAYSTYLE_RECOMMEND_CUTOFF", defaults.recommend.cutoff)?,
                games_per_cluster: parse_or(
                    "PLAYSTYLE_GAMES_PER_CLUSTER",
                    defaults.recommend.games_per_cluster,
                )?,
                top_tags: parse_or("PLAYSTYLE_QUERY_TOP_TAGS", defaults.recommend.top_tags)?,
                blacklist: parse_tag_list("PLAYSTYLE_BLACKLIST_TAGS", defaults.recommend.blacklist),
            },
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject values no stage can run with.
    ///
    /// # Errors
    /// Returns [`ConfigError::OutOfRange`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure(self.library_top_n >= 1, "library_top_n", "must be at least 1")?;
        ensure(
            self.profile.k >= 2,
            "profile.k",
            "must be at least 2 (the point itself plus one neighbor)",
        )?;
        ensure(
            self.profile.sensitivity.is_finite() && self.profile.sensitivity > 0.0,
            "profile.sensitivity",
            "must be positive",
        )?;
        ensure(
            self.profile.interpolation != (Interpolation::Polynomial { degree: 0 }),
            "profile.interpolation",
            "polynomial degree must be at least 1",
        )?;
        if let Some(eps) = self.cluster.eps {
            ensure(eps.is_finite() && eps > 0.0, "cluster.eps", "must be positive")?;
        }
        ensure(self.cluster.min_samples >= 1, "cluster.min_samples", "must be at least 1")?;
        ensure(
            self.merge.threshold > 0.0 && self.merge.threshold <= 1.0,
            "merge.threshold",
            "must lie in (0, 1]",
        )?;
        ensure(
            !self.classifier.k_candidates.is_empty(),
            "classifier.k_candidates",
            "must not be empty",
        )?;
        ensure(
            self.classifier.k_candidates.iter().all(|&k| k >= 1),
            "classifier.k_candidates",
            "every candidate must be at least 1",
        )?;
        ensure(self.classifier.folds >= 2, "classifier.folds", "must be at least 2")?;
        ensure(
            (0.0..1.0).contains(&self.recommend.cutoff),
            "recommend.cutoff",
            "must lie in [0, 1)",
        )?;
        ensure(
            self.recommend.games_per_cluster >= 1,
            "recommend.games_per_cluster",
            "must be at least 1",
        )?;
        ensure(self.recommend.top_tags >= 1, "recommend.top_tags", "must be at least 1")?;
        Ok(())
    }
}

fn ensure(condition: bool, name: &'static str, message: &str) -> Result<(), ConfigError> {
    if condition {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange {
            name,
            message: message.to_string(),
        })
    }
}

fn parse_or<T>(name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) => raw.trim().parse::<T>().map_err(|error| ConfigError::Invalid {
            name,
            source: Box::new(error),
        }),
        Err(_) => Ok(default),
    }
}

fn parse_optional<T>(name: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|error| ConfigError::Invalid {
                name,
                source: Box::new(error),
            }),
        _ => Ok(None),
    }
}

fn parse_tag_list(name: &'static str, default: BTreeSet<String>) -> BTreeSet<String> {
    match env::var(name) {
        Ok(raw) => raw
            .split(',')
            .map(str::trim)
            .filter(|tag| !tag.is_empty())
            .map(str::to_string)
            .collect(),
        Err(_) => default,
    }
}

fn parse_usize_list(name: &'static str, default: Vec<usize>) -> Result<Vec<usize>, ConfigError> {
    let Ok(raw) = env::var(name) else {
        return Ok(default);
    };
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| {
            item.parse::<usize>().map_err(|error| ConfigError::Invalid {
                name,
                source: Box::new(error),
            })
        })
        .collect()
}

use thiserror::Error;

/// Result alias for `playstyle`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by the clustering, classification and recommendation stages.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    /// Input was empty.
    #[error("empty input provided")]
    EmptyInput,

    /// Malformed or missing tag/library entries, or a corrupt persisted artifact.
    #[error("invalid input data: {0}")]
    InputData(String),

    /// Matrix dimension mismatch.
    #[error("dimension mismatch: expected {expected}, found {found}")]
    DimensionMismatch {
        /// Expected dimension.
        expected: usize,
        /// Found dimension.
        found: usize,
    },

    /// Clustering produced no usable partition (all noise, or a single cluster).
    #[error(
        "degenerate clustering: {clusters} cluster(s) and {noise} noise point(s) out of {total}"
    )]
    DegenerateClustering {
        /// Number of non-noise clusters found.
        clusters: usize,
        /// Number of noise points.
        noise: usize,
        /// Total number of points.
        total: usize,
    },

    /// Too few labeled points, or a class too small to stratify.
    #[error("insufficient samples for {context}: need at least {required}, found {found}")]
    InsufficientSamples {
        /// What was being attempted, including the offending class if any.
        context: String,
        /// Minimum count required.
        required: usize,
        /// Count actually available.
        found: usize,
    },

    /// Inference vector does not match the vocabulary the model was trained on.
    #[error(
        "vocabulary mismatch: model expects {expected_len} tags (fingerprint {expected_fingerprint:016x}), \
         vector has {found_len} tags (fingerprint {found_fingerprint:016x})"
    )]
    VocabularyMismatch {
        /// Fingerprint of the training vocabulary.
        expected_fingerprint: u64,
        /// Fingerprint of the offered vector's vocabulary.
        found_fingerprint: u64,
        /// Training vocabulary size.
        expected_len: usize,
        /// Offered vector length.
        found_len: usize,
    },

    /// The k-distance curve has no knee and no explicit eps was configured.
    #[error("no elbow found in the {points}-point k-distance curve; supply eps explicitly")]
    EpsRequired {
        /// Length of the profiled curve.
        points: usize,
    },

    /// Invalid parameter value.
    #[error("invalid parameter '{name}': {message}")]
    InvalidParameter {
        /// Parameter name.
        name: &'static str,
        /// Error message.
        message: String,
    },
}

/// A configuration string did not name any known variant.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind} '{value}'")]
pub struct UnknownVariant {
    /// What was being parsed.
    pub kind: &'static str,
    /// The rejected input.
    pub value: String,
}

impl Error {
    /// Whether this error is a valid terminal outcome of a run rather than a fault.
    ///
    /// A degenerate clustering means the data has no usable structure at the
    /// chosen density; callers should report it, not treat it as a crash.
    pub fn is_terminal_outcome(&self) -> bool {
        matches!(self, Error::DegenerateClustering { .. })
    }

    pub(crate) fn invalid(name: &'static str, message: impl Into<String>) -> Self {
        Error::InvalidParameter {
            name,
            message: message.into(),
        }
    }
}

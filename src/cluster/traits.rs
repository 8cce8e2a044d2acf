//! Clustering traits.

use crate::error::Result;

/// Cluster label: a non-negative cluster id, or [`NOISE`](super::NOISE).
pub type ClusterLabel = i32;

/// Trait for clustering algorithms.
pub trait Clustering {
    /// Fit the model to data and return cluster assignments.
    ///
    /// Returns a vector of cluster labels, one per input point.
    fn fit_predict(&self, data: &[Vec<f32>]) -> Result<Vec<ClusterLabel>>;
}

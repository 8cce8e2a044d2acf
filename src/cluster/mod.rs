//! Density clustering and density-threshold selection.
//!
//! ## DBSCAN
//!
//! Groups users whose tag profiles sit in dense regions of feature space.
//! Unlike k-means it needs no cluster count, tolerates arbitrary cluster
//! shapes and labels sparse users as noise instead of forcing them into a
//! group. That matters here: a profile mixing three unrelated genres should
//! not distort the signature of any cluster.
//!
//! ## Choosing ε
//!
//! DBSCAN is sensitive to ε. The standard heuristic sorts every point's
//! distance to its k-th nearest neighbor and takes the knee of that curve:
//! below it points sit in dense regions, above it distances blow up.
//! [`NeighborDistanceProfiler`] computes the curve and finds the knee with
//! Kneedle (Satopää et al., 2011).
//!
//! ```text
//! distance
//!    │                                  ╭
//!    │                                 ╱
//!    │                              ╭─╯   ← sparse / noise
//!    │        ╭─────────────────────●       ← knee = ε
//!    │────────╯                             ← dense
//!    └──────────────────────────────────── points (sorted)
//! ```
//!
//! ## Usage
//!
//! ```rust
//! use playstyle::cluster::{Clustering, Dbscan, NOISE};
//!
//! let data = vec![
//!     vec![0.0, 0.0],
//!     vec![0.1, 0.0],
//!     vec![0.0, 0.1],
//!     vec![5.0, 5.0],
//!     vec![5.1, 5.0],
//!     vec![5.0, 5.1],
//!     vec![50.0, 50.0],
//! ];
//! let labels = Dbscan::new(0.3, 3).fit_predict(&data).unwrap();
//! assert_eq!(labels, vec![0, 0, 0, 1, 1, 1, NOISE]);
//! ```

mod dbscan;
mod knee;
mod traits;

pub use dbscan::{Dbscan, DbscanFit, NOISE};
pub use knee::{Elbow, Interpolation, KDistanceProfile, NeighborDistanceProfiler};
pub use traits::{ClusterLabel, Clustering};

use crate::error::{Error, Result};

/// Euclidean distance between two points of equal length.
#[inline]
pub(crate) fn euclidean(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y).powi(2))
        .sum::<f32>()
        .sqrt()
}

/// Reject empty input and ragged rows. Returns the shared dimension.
pub(crate) fn check_rows(data: &[Vec<f32>]) -> Result<usize> {
    let Some(first) = data.first() else {
        return Err(Error::EmptyInput);
    };
    let dim = first.len();
    if let Some(row) = data.iter().find(|row| row.len() != dim) {
        return Err(Error::DimensionMismatch {
            expected: dim,
            found: row.len(),
        });
    }
    Ok(dim)
}

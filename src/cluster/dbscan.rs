//! DBSCAN: Density-Based Spatial Clustering of Applications with Noise.
//!
//! # The Algorithm (Ester et al., 1996)
//!
//! - **Epsilon (ε)**: maximum distance between two points to be neighbors (inclusive).
//! - **MinPts**: minimum neighborhood size, counting the point itself, for a
//!   point to be **core**.
//! - **Border point**: not core, but within ε of a core point.
//! - **Noise point**: neither; labeled [`NOISE`].
//!
//! Clusters are the connected components of core points under the
//! "within ε" relation, plus every border point reachable from them.
//!
//! ## Determinism
//!
//! Points are scanned in input order. The first unlabeled core point opens
//! the next cluster id, and that cluster is expanded to completion before
//! the scan resumes. A border point reachable from two clusters therefore
//! belongs to the one discovered first. Identical input and parameters
//! always give identical labels.
//!
//! ## Complexity
//!
//! O(n²) distance evaluations; neighborhoods are computed once up front.

use std::collections::VecDeque;

use super::traits::{ClusterLabel, Clustering};
use super::{check_rows, euclidean};
use crate::error::{Error, Result};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// Label of points that belong to no cluster.
pub const NOISE: ClusterLabel = -1;

/// DBSCAN clustering algorithm.
#[derive(Debug, Clone)]
pub struct Dbscan {
    /// Epsilon: maximum distance for neighborhood.
    epsilon: f32,
    /// Minimum points for core point classification.
    min_pts: usize,
}

/// Labels plus the core-point mask of a fit.
#[derive(Debug, Clone, PartialEq)]
pub struct DbscanFit {
    /// Cluster id per input point, or [`NOISE`].
    pub labels: Vec<ClusterLabel>,
    /// Whether each point has at least `min_pts` points within epsilon.
    pub core: Vec<bool>,
}

impl DbscanFit {
    /// Number of clusters found (noise excluded).
    pub fn n_clusters(&self) -> usize {
        self.labels
            .iter()
            .copied()
            .max()
            .map_or(0, |max| (max + 1).max(0) as usize)
    }

    pub fn n_noise(&self) -> usize {
        self.labels.iter().filter(|&&l| l == NOISE).count()
    }
}

impl Dbscan {
    /// Create a new DBSCAN clusterer.
    ///
    /// # Arguments
    ///
    /// * `epsilon` - Maximum distance between two points to be neighbors.
    /// * `min_pts` - Minimum number of points, the point itself included, to form a dense region.
    pub fn new(epsilon: f32, min_pts: usize) -> Self {
        Self { epsilon, min_pts }
    }

    /// Set epsilon (neighborhood radius).
    pub fn with_epsilon(mut self, epsilon: f32) -> Self {
        self.epsilon = epsilon;
        self
    }

    /// Set minimum points for core classification.
    pub fn with_min_pts(mut self, min_pts: usize) -> Self {
        self.min_pts = min_pts;
        self
    }

    pub fn epsilon(&self) -> f32 {
        self.epsilon
    }

    pub fn min_pts(&self) -> usize {
        self.min_pts
    }

    /// All points within epsilon of `point_idx`, itself included, in index order.
    fn region_query(&self, data: &[Vec<f32>], point_idx: usize) -> Vec<usize> {
        let point = &data[point_idx];
        data.iter()
            .enumerate()
            .filter(|(_, other)| euclidean(point, other) <= self.epsilon)
            .map(|(idx, _)| idx)
            .collect()
    }

    fn neighborhoods(&self, data: &[Vec<f32>]) -> Vec<Vec<usize>> {
        #[cfg(feature = "parallel")]
        {
            (0..data.len())
                .into_par_iter()
                .map(|i| self.region_query(data, i))
                .collect()
        }

        #[cfg(not(feature = "parallel"))]
        {
            (0..data.len()).map(|i| self.region_query(data, i)).collect()
        }
    }

    fn check_params(&self) -> Result<()> {
        if !(self.epsilon.is_finite() && self.epsilon > 0.0) {
            return Err(Error::invalid("epsilon", "must be positive"));
        }
        if self.min_pts == 0 {
            return Err(Error::invalid("min_pts", "must be at least 1"));
        }
        Ok(())
    }

    /// Fit and return labels together with the core-point mask.
    pub fn fit(&self, data: &[Vec<f32>]) -> Result<DbscanFit> {
        check_rows(data)?;
        self.check_params()?;

        let n = data.len();
        let neighborhoods = self.neighborhoods(data);
        let core: Vec<bool> = neighborhoods
            .iter()
            .map(|hood| hood.len() >= self.min_pts)
            .collect();

        let mut labels = vec![NOISE; n];
        let mut cluster_id: ClusterLabel = 0;
        let mut queue = VecDeque::new();

        for point_idx in 0..n {
            if labels[point_idx] != NOISE || !core[point_idx] {
                continue;
            }

            labels[point_idx] = cluster_id;
            queue.push_back(point_idx);

            // Only core points are expanded; border points are labeled and left.
            while let Some(current) = queue.pop_front() {
                for &neighbor in &neighborhoods[current] {
                    if labels[neighbor] != NOISE {
                        continue;
                    }
                    labels[neighbor] = cluster_id;
                    if core[neighbor] {
                        queue.push_back(neighbor);
                    }
                }
            }

            cluster_id += 1;
        }

        Ok(DbscanFit { labels, core })
    }
}

impl Default for Dbscan {
    fn default() -> Self {
        Self::new(0.5, 3)
    }
}

impl Clustering for Dbscan {
    fn fit_predict(&self, data: &[Vec<f32>]) -> Result<Vec<ClusterLabel>> {
        self.fit(data).map(|fit| fit.labels)
    }
}

//! Clustering evaluation metrics.
//!
//! Compare a clustering to ground truth labels, typically on synthetic data
//! where the true taste groups are known.
//!
//! # Metrics Overview
//!
//! | Metric | Range | Best | Properties |
//! |--------|-------|------|------------|
//! | [`nmi`] | [0, 1] | 1 | Normalized mutual information |
//! | [`ari`] | [-1, 1] | 1 | Adjusted for chance |
//! | [`purity`] | [0, 1] | 1 | Simple, biased toward many clusters |
//! | [`label_agreement`] | [0, 1] | 1 | Purity with noise counted as wrong |
//!
//! Functions that take plain labels treat noise (`-1`) as one more cluster.
//! Only [`label_agreement`] gives noise special meaning.
//!
//! # Example
//!
//! ```rust
//! use playstyle::metrics::{ari, label_agreement, nmi, purity};
//!
//! let pred = [0, 0, 1, 1, 2, -1];
//! let truth = [0, 0, 0, 1, 1, 1];
//!
//! let nmi_score = nmi(&pred, &truth);
//! let ari_score = ari(&pred, &truth);
//! let purity_score = purity(&pred, &truth);
//! assert!(label_agreement(&pred, &truth) < purity_score);
//! ```
//!
//! # References
//!
//! - Hubert & Arabie (1985). "Comparing partitions" (ARI)
//! - Strehl & Ghosh (2002). "Cluster ensembles" (NMI)

use std::collections::HashMap;
use std::hash::Hash;

use serde::{Deserialize, Serialize};

use crate::cluster::{ClusterLabel, NOISE};

/// Scores of one clustering against ground truth.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClusteringScores {
    /// See [`ari`].
    pub ari: f64,
    /// See [`nmi`].
    pub nmi: f64,
    /// See [`purity`].
    pub purity: f64,
    /// See [`label_agreement`].
    pub agreement: f64,
    /// Share of points labeled noise.
    pub noise_fraction: f64,
}

impl ClusteringScores {
    pub fn compute<T: Copy + Eq + Hash>(pred: &[ClusterLabel], truth: &[T]) -> Self {
        let noise = pred.iter().filter(|&&p| p == NOISE).count();
        Self {
            ari: ari(pred, truth),
            nmi: nmi(pred, truth),
            purity: purity(pred, truth),
            agreement: label_agreement(pred, truth),
            noise_fraction: if pred.is_empty() {
                0.0
            } else {
                noise as f64 / pred.len() as f64
            },
        }
    }
}

/// Normalized Mutual Information between two clusterings.
///
/// ```text
/// NMI(U, V) = 2 * I(U; V) / (H(U) + H(V))
/// ```
///
/// # Example
///
/// ```rust
/// use playstyle::metrics::nmi;
///
/// // Perfect clustering
/// let pred = [0, 0, 1, 1];
/// let truth = [0, 0, 1, 1];
/// assert!((nmi(&pred, &truth) - 1.0).abs() < 0.01);
///
/// // Random clustering has low NMI
/// let pred = [0, 1, 0, 1];
/// let truth = [0, 0, 1, 1];
/// assert!(nmi(&pred, &truth) < 0.5);
/// ```
pub fn nmi<P, T>(pred: &[P], truth: &[T]) -> f64
where
    P: Copy + Eq + Hash,
    T: Copy + Eq + Hash,
{
    if pred.len() != truth.len() || pred.is_empty() {
        return 0.0;
    }

    let n_f = pred.len() as f64;
    let joint = build_contingency_table(pred, truth);
    let p_pred = counts(pred);
    let p_truth = counts(truth);

    let h_pred = entropy(p_pred.values().copied(), n_f);
    let h_truth = entropy(p_truth.values().copied(), n_f);

    let mut mi = 0.0;
    for (&(p, t), &count) in &joint {
        let p_joint = count as f64 / n_f;
        let p_p = p_pred.get(&p).copied().unwrap_or(0) as f64 / n_f;
        let p_t = p_truth.get(&t).copied().unwrap_or(0) as f64 / n_f;
        if p_p > 0.0 && p_t > 0.0 {
            mi += p_joint * (p_joint / (p_p * p_t)).ln();
        }
    }

    let denom = h_pred + h_truth;
    if denom > 0.0 {
        2.0 * mi / denom
    } else {
        1.0 // Both are constant
    }
}

/// Adjusted Rand Index between two clusterings.
///
/// 0 indicates chance-level agreement, 1 perfect agreement.
///
/// ```rust
/// use playstyle::metrics::ari;
///
/// let pred = [0, 0, 1, 1];
/// let truth = [0, 0, 1, 1];
/// assert!((ari(&pred, &truth) - 1.0).abs() < 0.01);
/// ```
pub fn ari<P, T>(pred: &[P], truth: &[T]) -> f64
where
    P: Copy + Eq + Hash,
    T: Copy + Eq + Hash,
{
    if pred.len() != truth.len() || pred.is_empty() {
        return 0.0;
    }

    let joint = build_contingency_table(pred, truth);

    // Sum of C(n_ij, 2)
    let sum_comb_ij: f64 = joint.values().map(|&c| comb2(c) as f64).sum();

    // Sum of C(a_i, 2) and C(b_j, 2)
    let sum_comb_a: f64 = counts(pred).values().map(|&a| comb2(a) as f64).sum();
    let sum_comb_b: f64 = counts(truth).values().map(|&b| comb2(b) as f64).sum();

    let comb_n = comb2(pred.len()) as f64;
    if comb_n == 0.0 {
        return 1.0;
    }

    // ARI = (index - expected) / (max - expected)
    let expected = sum_comb_a * sum_comb_b / comb_n;
    let max_index = (sum_comb_a + sum_comb_b) / 2.0;

    let denom = max_index - expected;
    if denom.abs() < 1e-10 {
        return 1.0; // Perfect agreement when both clusterings are identical
    }

    (sum_comb_ij - expected) / denom
}

/// Purity of clustering with respect to ground truth.
///
/// For each cluster, find the most common ground truth label.
/// Purity is the fraction of correctly assigned points.
///
/// Note: Purity increases with more clusters and is 1.0 when each point
/// is its own cluster.
pub fn purity<P, T>(pred: &[P], truth: &[T]) -> f64
where
    P: Copy + Eq + Hash,
    T: Copy + Eq + Hash,
{
    if pred.len() != truth.len() || pred.is_empty() {
        return 0.0;
    }
    let correct: usize = cluster_majorities(&build_contingency_table(pred, truth))
        .values()
        .sum();
    correct as f64 / pred.len() as f64
}

/// Fraction of points whose cluster's majority truth label is their own.
///
/// Like [`purity`], except that noise points never agree.
pub fn label_agreement<T: Copy + Eq + Hash>(pred: &[ClusterLabel], truth: &[T]) -> f64 {
    if pred.len() != truth.len() || pred.is_empty() {
        return 0.0;
    }
    let correct: usize = cluster_majorities(&build_contingency_table(pred, truth))
        .iter()
        .filter(|(&cluster, _)| cluster != NOISE)
        .map(|(_, &count)| count)
        .sum();
    correct as f64 / pred.len() as f64
}

// Helper functions

fn build_contingency_table<P, T>(pred: &[P], truth: &[T]) -> HashMap<(P, T), usize>
where
    P: Copy + Eq + Hash,
    T: Copy + Eq + Hash,
{
    let mut table = HashMap::new();
    for (&p, &t) in pred.iter().zip(truth.iter()) {
        *table.entry((p, t)).or_insert(0) += 1;
    }
    table
}

/// Largest overlap of each predicted cluster with any true class.
fn cluster_majorities<P, T>(joint: &HashMap<(P, T), usize>) -> HashMap<P, usize>
where
    P: Copy + Eq + Hash,
{
    let mut maxes: HashMap<P, usize> = HashMap::new();
    for (&(p, _), &count) in joint {
        let current = maxes.entry(p).or_insert(0);
        *current = (*current).max(count);
    }
    maxes
}

fn counts<L: Copy + Eq + Hash>(labels: &[L]) -> HashMap<L, usize> {
    let mut counts = HashMap::new();
    for &l in labels {
        *counts.entry(l).or_insert(0) += 1;
    }
    counts
}

fn entropy(counts: impl Iterator<Item = usize>, n: f64) -> f64 {
    counts
        .map(|c| {
            let p = c as f64 / n;
            if p > 0.0 {
                -p * p.ln()
            } else {
                0.0
            }
        })
        .sum()
}

fn comb2(n: usize) -> usize {
    if n < 2 {
        0
    } else {
        n * (n - 1) / 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nmi_perfect() {
        let pred = [0, 0, 1, 1, 2, 2];
        let truth = [0, 0, 1, 1, 2, 2];
        assert!((nmi(&pred, &truth) - 1.0).abs() < 0.01);
    }

    #[test]
    fn test_nmi_permuted() {
        // Same clustering, different labels
        let pred = [1, 1, 0, 0, 2, 2];
        let truth = ["a", "a", "b", "b", "c", "c"];
        assert!((nmi(&pred, &truth) - 1.0).abs() < 0.01);
    }

    #[test]
    fn test_ari_perfect() {
        let pred = [0, 0, 1, 1];
        let truth = [0, 0, 1, 1];
        assert!((ari(&pred, &truth) - 1.0).abs() < 0.01);
    }

    #[test]
    fn test_ari_penalizes_split() {
        let pred = [0, 0, 1, 1, 2, 2];
        let truth = [0, 0, 0, 0, 1, 1];
        let score = ari(&pred, &truth);
        assert!(score > 0.0 && score < 1.0);
    }

    #[test]
    fn test_purity_overclustering() {
        // Each point is its own cluster
        let pred = [0, 1, 2, 3];
        let truth = [0, 0, 1, 1];
        assert!((purity(&pred, &truth) - 1.0).abs() < 0.01);
    }

    #[test]
    fn test_label_agreement_counts_noise_as_wrong() {
        let pred = [0, 0, 0, 1, 1, NOISE, NOISE, 1];
        let truth = [7, 7, 7, 9, 9, 9, 9, 9];
        assert!((label_agreement(&pred, &truth) - 6.0 / 8.0).abs() < 1e-12);
        // Purity treats the two noise points as one pure cluster.
        assert!((purity(&pred, &truth) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_label_agreement_after_split() {
        // Truth group 9 split over clusters 1 and 2 still agrees.
        let pred = [0, 0, 1, 1, 2, 2];
        let truth = [7, 7, 9, 9, 9, 9];
        assert!((label_agreement(&pred, &truth) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_mismatched_lengths_score_zero() {
        assert_eq!(ari(&[0, 1], &[0]), 0.0);
        assert_eq!(label_agreement(&[], &[0u8; 0]), 0.0);
    }

    #[test]
    fn test_scores_summary() {
        let pred = [0, 0, 1, NOISE];
        let truth = [0, 0, 1, 1];
        let scores = ClusteringScores::compute(&pred, &truth);
        assert!((scores.noise_fraction - 0.25).abs() < 1e-12);
        assert!((scores.agreement - 0.75).abs() < 1e-12);
    }
}

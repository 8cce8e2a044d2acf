//! k-distance profiling and knee detection for choosing DBSCAN's ε.
//!
//! Each point's distance to its k-th nearest neighbor, sorted ascending,
//! forms a convex increasing curve. Its knee is found with Kneedle
//! (Satopää, Albrecht, Irwin, Raghavan, 2011):
//!
//! 0. Optionally smooth the curve with a least-squares polynomial
//!    ([`Interpolation`], degree 7 by default).
//! 1. Normalize x (rank) and y (distance) to [0, 1].
//! 2. Rotate the convex increasing curve into a concave one:
//!    `y'[i] = 1 - y[n-1-i]`.
//! 3. Take the difference curve `d = y' - x`.
//! 4. Walk the local maxima of `d`. After each maximum the threshold is
//!    `d_max - S * mean(Δx)`; the first point falling under it ends the
//!    search and the preceding maximum is the knee.
//!
//! Curves with no bulge above the diagonal (flat, linear, concave) have no
//! knee. The elbow distance is always read from the unsmoothed curve.

use std::fmt;
use std::str::FromStr;

use ndarray::{s, Array1, Array2};
use serde::{Deserialize, Serialize};

use super::{check_rows, euclidean};
use crate::error::{Error, Result, UnknownVariant};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// The knee of a k-distance curve.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Elbow {
    /// Position in the sorted distance curve.
    pub index: usize,
    /// k-distance at that position; the suggested ε.
    pub distance: f32,
}

/// Sorted k-distances and the detected elbow, if any.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KDistanceProfile {
    /// Neighbor count used, the point itself included.
    pub k: usize,
    /// Every point's k-distance, sorted ascending.
    pub distances: Vec<f32>,
    /// Knee of `distances`, if the curve has one.
    pub elbow: Option<Elbow>,
}

impl KDistanceProfile {
    /// Suggested ε, when an elbow was found.
    pub fn suggested_eps(&self) -> Option<f32> {
        self.elbow.map(|e| e.distance)
    }
}

/// Smoothing applied to the k-distance curve before knee detection.
///
/// Sampling noise in the sparse tail can put a small step there that raw
/// Kneedle takes for the knee. A low-degree polynomial fit irons such
/// steps out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Interpolation {
    /// Use the sorted distances as they are.
    Raw,
    /// Least-squares polynomial fit of the given degree.
    Polynomial {
        /// Degree of the fitted polynomial, at least 1.
        degree: usize,
    },
}

impl Interpolation {
    pub const DEFAULT_DEGREE: usize = 7;
}

impl Default for Interpolation {
    fn default() -> Self {
        Interpolation::Polynomial {
            degree: Self::DEFAULT_DEGREE,
        }
    }
}

impl fmt::Display for Interpolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Interpolation::Raw => write!(f, "raw"),
            Interpolation::Polynomial { degree } => write!(f, "polynomial:{degree}"),
        }
    }
}

/// Parses `raw`, `polynomial` (degree 7) or `polynomial:<degree>`.
impl FromStr for Interpolation {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let unknown = || UnknownVariant {
            kind: "interpolation",
            value: s.to_string(),
        };
        let lower = s.trim().to_ascii_lowercase();
        let (name, degree) = match lower.split_once(':') {
            Some((name, degree)) => (name, Some(degree.trim())),
            None => (lower.as_str(), None),
        };
        match (name.trim(), degree) {
            ("raw", None) => Ok(Interpolation::Raw),
            ("polynomial" | "poly", None) => Ok(Interpolation::default()),
            ("polynomial" | "poly", Some(degree)) => degree
                .parse()
                .map(|degree| Interpolation::Polynomial { degree })
                .map_err(|_| unknown()),
            _ => Err(unknown()),
        }
    }
}

/// Computes the k-distance curve of a point set and locates its knee.
///
/// `k` counts the point itself: with `k = 4` the distance reported for a
/// point is the one to its third-nearest other point.
#[derive(Debug, Clone)]
pub struct NeighborDistanceProfiler {
    k: usize,
    sensitivity: f64,
    interpolation: Interpolation,
}

impl Default for NeighborDistanceProfiler {
    fn default() -> Self {
        Self::new(4)
    }
}

impl NeighborDistanceProfiler {
    pub fn new(k: usize) -> Self {
        Self {
            k,
            sensitivity: 1.0,
            interpolation: Interpolation::default(),
        }
    }

    /// Kneedle sensitivity `S`. Larger values make detection more conservative.
    pub fn with_sensitivity(mut self, sensitivity: f64) -> Self {
        self.sensitivity = sensitivity;
        self
    }

    pub fn with_interpolation(mut self, interpolation: Interpolation) -> Self {
        self.interpolation = interpolation;
        self
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn sensitivity(&self) -> f64 {
        self.sensitivity
    }

    pub fn interpolation(&self) -> Interpolation {
        self.interpolation
    }

    /// Build the sorted k-distance curve and detect its elbow.
    pub fn profile(&self, data: &[Vec<f32>]) -> Result<KDistanceProfile> {
        check_rows(data)?;
        if self.k == 0 {
            return Err(Error::invalid("k", "must be at least 1"));
        }
        if !(self.sensitivity.is_finite() && self.sensitivity >= 0.0) {
            return Err(Error::invalid("sensitivity", "must be non-negative"));
        }
        if self.interpolation == (Interpolation::Polynomial { degree: 0 }) {
            return Err(Error::invalid("interpolation", "polynomial degree must be at least 1"));
        }
        if data.len() < self.k {
            return Err(Error::InsufficientSamples {
                context: "k-distance profile".to_string(),
                required: self.k,
                found: data.len(),
            });
        }

        let mut distances = self.k_distances(data);
        distances.sort_by(f32::total_cmp);

        let elbow = self.elbow_of(&distances);
        match elbow {
            Some(e) => tracing::debug!(
                k = self.k,
                points = data.len(),
                index = e.index,
                distance = e.distance,
                interpolation = %self.interpolation,
                "k-distance elbow found"
            ),
            None => tracing::debug!(k = self.k, points = data.len(), "no k-distance elbow"),
        }

        Ok(KDistanceProfile {
            k: self.k,
            distances,
            elbow,
        })
    }

    /// Locate the elbow of an already sorted (ascending) curve.
    ///
    /// Returns `None` when the curve has no convex knee or the knee sits at
    /// distance zero.
    pub fn elbow_of(&self, sorted: &[f32]) -> Option<Elbow> {
        // Smoothing a flat curve would only surface rounding noise.
        match (sorted.first(), sorted.last()) {
            (Some(&lo), Some(&hi)) if hi > lo => {}
            _ => return None,
        }
        let raw: Vec<f64> = sorted.iter().map(|&d| f64::from(d)).collect();
        let curve = match self.interpolation {
            Interpolation::Polynomial { degree } if degree >= 1 && raw.len() > degree + 1 => {
                polynomial_fit(&raw, degree).unwrap_or(raw)
            }
            // Too few points to smooth: a full-degree fit reproduces them.
            _ => raw,
        };
        let index = kneedle_convex_increasing(&curve, self.sensitivity)?;
        let distance = sorted[index];
        (distance > 0.0).then_some(Elbow { index, distance })
    }

    fn k_distances(&self, data: &[Vec<f32>]) -> Vec<f32> {
        #[cfg(feature = "parallel")]
        {
            data.par_iter()
                .map(|point| k_distance(data, point, self.k))
                .collect()
        }

        #[cfg(not(feature = "parallel"))]
        {
            data.iter()
                .map(|point| k_distance(data, point, self.k))
                .collect()
        }
    }
}

/// Distance from `point` to its k-th nearest member of `data`, itself included.
fn k_distance(data: &[Vec<f32>], point: &[f32], k: usize) -> f32 {
    let mut dists: Vec<f32> = data.iter().map(|other| euclidean(point, other)).collect();
    let (_, kth, _) = dists.select_nth_unstable_by(k - 1, f32::total_cmp);
    *kth
}

/// Least-squares polynomial of `degree` through `y` sampled at evenly
/// spaced x, evaluated back at the same x.
///
/// Solved by Householder QR on the Vandermonde matrix with x mapped to
/// [-1, 1]. Returns `None` if the system is rank deficient.
fn polynomial_fit(y: &[f64], degree: usize) -> Option<Vec<f64>> {
    let n = y.len();
    let m = degree + 1;
    if n < m {
        return None;
    }
    let x = Array1::<f64>::linspace(-1.0, 1.0, n);
    let mut a = Array2::from_shape_fn((n, m), |(i, p)| x[i].powi(p as i32));
    let mut b = Array1::from(y.to_vec());

    for j in 0..m {
        let column = a.slice(s![j.., j]);
        let norm = column.dot(&column).sqrt();
        if norm == 0.0 {
            return None;
        }
        let alpha = if a[[j, j]] >= 0.0 { -norm } else { norm };
        let mut v = a.slice(s![j.., j]).to_owned();
        v[0] -= alpha;
        let vv = v.dot(&v);
        if vv == 0.0 {
            continue;
        }
        for c in j..m {
            let mut col = a.slice_mut(s![j.., c]);
            let scale = 2.0 * v.dot(&col) / vv;
            col.scaled_add(-scale, &v);
        }
        let mut rhs = b.slice_mut(s![j..]);
        let scale = 2.0 * v.dot(&rhs) / vv;
        rhs.scaled_add(-scale, &v);
    }

    let mut coef = Array1::<f64>::zeros(m);
    for j in (0..m).rev() {
        let pivot = a[[j, j]];
        if pivot == 0.0 {
            return None;
        }
        let tail = a.slice(s![j, j + 1..]).dot(&coef.slice(s![j + 1..]));
        coef[j] = (b[j] - tail) / pivot;
    }

    Some(
        x.iter()
            .map(|&xi| coef.iter().rev().fold(0.0, |acc, &c| acc * xi + c))
            .collect(),
    )
}

/// Index of the knee of a sorted convex increasing curve, or `None`.
fn kneedle_convex_increasing(y: &[f64], sensitivity: f64) -> Option<usize> {
    let n = y.len();
    if n < 3 {
        return None;
    }

    let (min, max) = y
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });
    let range = max - min;
    if !range.is_finite() || range <= 0.0 {
        return None;
    }

    let last = (n - 1) as f64;
    let x_norm: Vec<f64> = (0..n).map(|i| i as f64 / last).collect();
    let diff: Vec<f64> = (0..n)
        .map(|i| {
            let flipped = 1.0 - (y[n - 1 - i] - min) / range;
            flipped - x_norm[i]
        })
        .collect();

    // Nothing above the diagonal: linear or concave.
    if diff.iter().all(|&d| d <= 1e-9) {
        return None;
    }

    let maxima = relative_extrema(&diff, |a, b| a >= b);
    let minima = relative_extrema(&diff, |a, b| a <= b);
    let first_max = *maxima.first()?;

    let step = 1.0 / last;
    let mut threshold = f64::NEG_INFINITY;
    let mut threshold_index = first_max;

    for i in first_max..n - 1 {
        if maxima.binary_search(&i).is_ok() {
            threshold = diff[i] - sensitivity * step;
            threshold_index = i;
        }
        if minima.binary_search(&i).is_ok() {
            threshold = 0.0;
        }
        if diff[i + 1] < threshold {
            return Some(n - 1 - threshold_index);
        }
    }
    None
}

/// Indices where `cmp(d[i], neighbor)` holds for both neighbors; endpoints
/// compare against themselves.
fn relative_extrema(d: &[f64], cmp: impl Fn(f64, f64) -> bool) -> Vec<usize> {
    let n = d.len();
    (0..n)
        .filter(|&i| {
            let prev = d[i.saturating_sub(1)];
            let next = d[(i + 1).min(n - 1)];
            cmp(d[i], prev) && cmp(d[i], next)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dense_then_sparse() -> Vec<f32> {
        let mut curve: Vec<f32> = (0..20).map(|i| 0.1 + i as f32 * 0.001).collect();
        curve.extend([1.0, 2.0, 3.0]);
        curve
    }

    fn raw() -> NeighborDistanceProfiler {
        NeighborDistanceProfiler::new(4).with_interpolation(Interpolation::Raw)
    }

    /// A dense plateau of 300 points, then a tail with a short shelf
    /// (eight close points) before the sparse outliers.
    fn plateau_then_shelf() -> Vec<f32> {
        let mut curve: Vec<f32> = (0..300).map(|i| 0.25 + 0.06 * i as f32 / 299.0).collect();
        curve.extend((0..8).map(|i| 0.7 + 0.005 * i as f32));
        curve.extend((0..7).map(|i| 1.5 + 0.5 * i as f32));
        curve
    }

    #[test]
    fn test_knee_is_last_dense_point() {
        let curve = dense_then_sparse();
        let elbow = raw().elbow_of(&curve).unwrap();
        assert_eq!(elbow.index, 19);
        assert!((elbow.distance - 0.119).abs() < 1e-6);
    }

    #[test]
    fn test_smoothed_knee_stays_in_dense_part() {
        let curve = dense_then_sparse();
        let elbow = NeighborDistanceProfiler::new(4).elbow_of(&curve).unwrap();
        assert!(elbow.index < 20);
        // Read from the raw curve, not the fitted one.
        assert_eq!(elbow.distance, curve[elbow.index]);
    }

    #[test]
    fn test_tail_shelf_fools_raw_but_not_polynomial() {
        let curve = plateau_then_shelf();

        let shelf = raw().elbow_of(&curve).unwrap();
        assert!(shelf.index >= 300, "raw knee {} should sit on the shelf", shelf.index);
        assert!(shelf.distance >= 0.7);

        let elbow = NeighborDistanceProfiler::new(4).elbow_of(&curve).unwrap();
        assert!(elbow.index < 300, "smoothed knee {} left the plateau", elbow.index);
        assert!(elbow.distance <= 0.31);
    }

    #[test]
    fn test_polynomial_fit_reproduces_low_degree_curves() {
        let y: Vec<f64> = (0..50).map(|i| 2.0 + 0.5 * i as f64 + 0.01 * (i * i) as f64).collect();
        let fitted = polynomial_fit(&y, 7).unwrap();
        for (a, b) in y.iter().zip(&fitted) {
            assert!((a - b).abs() < 1e-8, "{a} vs {b}");
        }
        assert_eq!(polynomial_fit(&y[..5], 7), None);
    }

    #[test]
    fn test_interpolation_parses() {
        assert_eq!("raw".parse::<Interpolation>(), Ok(Interpolation::Raw));
        assert_eq!("polynomial".parse::<Interpolation>(), Ok(Interpolation::default()));
        assert_eq!(
            "Polynomial:3".parse::<Interpolation>(),
            Ok(Interpolation::Polynomial { degree: 3 })
        );
        assert!("spline".parse::<Interpolation>().is_err());
        assert!("raw:2".parse::<Interpolation>().is_err());
        let default = Interpolation::default();
        assert_eq!(default.to_string().parse::<Interpolation>(), Ok(default));
    }

    #[test]
    fn test_no_knee_on_linear_curve() {
        let curve: Vec<f32> = (0..20).map(|i| i as f32).collect();
        assert_eq!(raw().elbow_of(&curve), None);
        assert_eq!(NeighborDistanceProfiler::new(4).elbow_of(&curve), None);
    }

    #[test]
    fn test_no_knee_on_concave_curve() {
        let curve: Vec<f32> = (0..30).map(|i| (i as f32).sqrt()).collect();
        assert_eq!(raw().elbow_of(&curve), None);
        assert_eq!(NeighborDistanceProfiler::new(4).elbow_of(&curve), None);
    }

    #[test]
    fn test_no_knee_on_flat_or_short_curve() {
        for profiler in [raw(), NeighborDistanceProfiler::new(4)] {
            assert_eq!(profiler.elbow_of(&[0.5; 10]), None);
            assert_eq!(profiler.elbow_of(&[0.1, 5.0]), None);
            assert_eq!(profiler.elbow_of(&[]), None);
        }
    }

    #[test]
    fn test_zero_distance_knee_is_rejected() {
        // Duplicates put the knee at distance 0.
        let mut curve = vec![0.0f32; 20];
        curve.extend([1.0, 2.0, 3.0]);
        assert_eq!(raw().elbow_of(&curve), None);
        assert_eq!(NeighborDistanceProfiler::new(4).elbow_of(&curve), None);
    }

    #[test]
    fn test_k_counts_the_point_itself() {
        let data = vec![vec![0.0], vec![1.0], vec![3.0], vec![6.0]];

        let profile = NeighborDistanceProfiler::new(1).profile(&data).unwrap();
        assert_eq!(profile.distances, vec![0.0; 4]);

        let profile = NeighborDistanceProfiler::new(2).profile(&data).unwrap();
        assert_eq!(profile.distances, vec![1.0, 1.0, 2.0, 3.0]);

        let profile = NeighborDistanceProfiler::new(3).profile(&data).unwrap();
        assert_eq!(profile.distances, vec![2.0, 3.0, 3.0, 5.0]);
    }

    #[test]
    fn test_profile_finds_eps_separating_outliers() {
        let mut data: Vec<Vec<f32>> = (0..30)
            .map(|i| vec![(i % 10) as f32 * 0.05, (i / 10) as f32 * 0.05])
            .collect();
        data.push(vec![5.0, 5.0]);
        data.push(vec![-6.0, 4.0]);
        data.push(vec![3.0, -7.0]);

        let profile = NeighborDistanceProfiler::new(4).profile(&data).unwrap();
        let elbow = profile.elbow.unwrap();
        assert!(elbow.index < 30);
        assert!(elbow.distance < 0.1, "eps {} should sit below the outliers", elbow.distance);
    }

    #[test]
    fn test_profile_rejects_bad_input() {
        let data = vec![vec![0.0], vec![1.0]];
        assert!(matches!(
            NeighborDistanceProfiler::new(4).profile(&data),
            Err(Error::InsufficientSamples { required: 4, found: 2, .. })
        ));
        assert!(NeighborDistanceProfiler::new(0).profile(&data).is_err());
        assert!(NeighborDistanceProfiler::new(1)
            .with_sensitivity(-1.0)
            .profile(&data)
            .is_err());
        assert!(NeighborDistanceProfiler::new(1)
            .with_interpolation(Interpolation::Polynomial { degree: 0 })
            .profile(&data)
            .is_err());
        assert_eq!(
            NeighborDistanceProfiler::new(1).profile(&[]),
            Err(Error::EmptyInput)
        );
    }
}

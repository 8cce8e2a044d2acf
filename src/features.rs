//! Tag-weight feature vectors built from playtime.
//!
//! Each game's playtime is split evenly across its tags and accumulated per
//! tag, giving one row per user over a frozen tag vocabulary. Rows are then
//! normalized:
//!
//! | Scheme | Row after normalization |
//! |--------|-------------------------|
//! | [`Normalization::RowSum`] | weights sum to 1 |
//! | [`Normalization::RowMax`] | weights in [0, 1], largest is 1 |
//!
//! A user with no trackable playtime gets the all-zero row under either scheme.
//!
//! The vocabulary and the scheme are part of every [`FeatureVector`] and of
//! every trained classifier; vectors from a different vocabulary are
//! rejected downstream rather than realigned.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;

use ndarray::{Array1, Array2, ArrayView1, Axis};
use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::xxh3_64;

use crate::catalog::{GameTagMap, UserLibraries, UserLibrary};
use crate::error::{Error, Result, UnknownVariant};

/// Row normalization scheme, fixed per deployment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Normalization {
    /// Divide by the row sum.
    RowSum,
    /// Divide by the row maximum.
    #[default]
    RowMax,
}

impl Normalization {
    fn apply(self, row: &mut [f64]) {
        let scale = match self {
            Normalization::RowSum => row.iter().sum::<f64>(),
            Normalization::RowMax => row.iter().copied().fold(0.0, f64::max),
        };
        if scale > 0.0 {
            for w in row.iter_mut() {
                *w /= scale;
            }
        }
    }
}

impl fmt::Display for Normalization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Normalization::RowSum => write!(f, "row_sum"),
            Normalization::RowMax => write!(f, "row_max"),
        }
    }
}

impl FromStr for Normalization {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "row_sum" | "sum" => Ok(Normalization::RowSum),
            "row_max" | "max" => Ok(Normalization::RowMax),
            _ => Err(UnknownVariant {
                kind: "normalization",
                value: s.to_string(),
            }),
        }
    }
}

/// Frozen, sorted tag list. A tag's position is its stable id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct Vocabulary {
    tags: Vec<String>,
    index: HashMap<String, usize>,
    fingerprint: u64,
}

impl Vocabulary {
    /// Build from any tag collection; duplicates collapse and order is sorted.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EmptyInput`] if no tags remain.
    pub fn new<I, S>(tags: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let sorted: BTreeSet<String> = tags.into_iter().map(Into::into).collect();
        if sorted.is_empty() {
            return Err(Error::EmptyInput);
        }
        let tags: Vec<String> = sorted.into_iter().collect();
        let index = tags
            .iter()
            .enumerate()
            .map(|(id, tag)| (tag.clone(), id))
            .collect();
        let fingerprint = fingerprint(&tags);
        Ok(Self {
            tags,
            index,
            fingerprint,
        })
    }

    /// Union of all tags in the map minus `exclude`.
    pub fn from_tag_map(map: &GameTagMap, exclude: &BTreeSet<String>) -> Result<Self> {
        let tags = map
            .all_tags()
            .into_iter()
            .filter(|tag| !exclude.contains(*tag));
        Self::new(tags).map_err(|_| {
            Error::InputData(format!(
                "no tags left after excluding {} tag(s) from {} game(s)",
                exclude.len(),
                map.len()
            ))
        })
    }

    pub fn id(&self, tag: &str) -> Option<usize> {
        self.index.get(tag).copied()
    }

    pub fn tag(&self, id: usize) -> Option<&str> {
        self.tags.get(id).map(String::as_str)
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    /// xxh3 hash of the ordered tag list.
    pub fn fingerprint(&self) -> u64 {
        self.fingerprint
    }
}

fn fingerprint(tags: &[String]) -> u64 {
    // Unit separator keeps ["ab","c"] and ["a","bc"] apart.
    xxh3_64(tags.join("\u{1f}").as_bytes())
}

impl TryFrom<Vec<String>> for Vocabulary {
    type Error = Error;

    fn try_from(tags: Vec<String>) -> Result<Self> {
        Self::new(tags)
    }
}

impl From<Vocabulary> for Vec<String> {
    fn from(vocabulary: Vocabulary) -> Self {
        vocabulary.tags
    }
}

/// One user's normalized tag weights, tagged with the vocabulary that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    weights: Vec<f32>,
    vocabulary_fingerprint: u64,
    normalization: Normalization,
}

impl FeatureVector {
    pub fn weights(&self) -> &[f32] {
        &self.weights
    }

    pub fn vocabulary_fingerprint(&self) -> u64 {
        self.vocabulary_fingerprint
    }

    pub fn normalization(&self) -> Normalization {
        self.normalization
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    pub fn is_zero(&self) -> bool {
        self.weights.iter().all(|&w| w == 0.0)
    }
}

/// Users × tags weight matrix, rows in input order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureMatrix {
    user_ids: Vec<String>,
    vocabulary: Vocabulary,
    normalization: Normalization,
    data: Array2<f32>,
}

impl FeatureMatrix {
    pub fn n_users(&self) -> usize {
        self.data.nrows()
    }

    pub fn n_tags(&self) -> usize {
        self.data.ncols()
    }

    pub fn user_ids(&self) -> &[String] {
        &self.user_ids
    }

    pub fn vocabulary(&self) -> &Vocabulary {
        &self.vocabulary
    }

    pub fn normalization(&self) -> Normalization {
        self.normalization
    }

    pub fn row(&self, i: usize) -> ArrayView1<'_, f32> {
        self.data.row(i)
    }

    pub fn data(&self) -> &Array2<f32> {
        &self.data
    }

    /// Rows as owned vectors, the shape the clustering algorithms consume.
    pub fn rows(&self) -> Vec<Vec<f32>> {
        self.data.outer_iter().map(|r| r.to_vec()).collect()
    }

    pub fn vector(&self, i: usize) -> FeatureVector {
        FeatureVector {
            weights: self.data.row(i).to_vec(),
            vocabulary_fingerprint: self.vocabulary.fingerprint(),
            normalization: self.normalization,
        }
    }

    /// Column means over the given rows, or `None` if `rows` is empty.
    pub fn mean_of(&self, rows: &[usize]) -> Option<Array1<f32>> {
        self.data.select(Axis(0), rows).mean_axis(Axis(0))
    }

    /// Sample variance of each tag's weight across users, highest first.
    ///
    /// High-variance tags are the ones that discriminate between users;
    /// near-zero variance tags are candidates for the exclude list.
    pub fn tag_variance(&self) -> Vec<(String, f32)> {
        let variances = if self.n_users() < 2 {
            Array1::zeros(self.n_tags())
        } else {
            self.data.var_axis(Axis(0), 1.0)
        };
        let mut ranked: Vec<(String, f32)> = self
            .vocabulary
            .tags()
            .iter()
            .cloned()
            .zip(variances.iter().copied())
            .collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        ranked
    }
}

/// Turns libraries into feature rows over a frozen vocabulary.
#[derive(Debug, Clone)]
pub struct FeatureMatrixBuilder {
    vocabulary: Vocabulary,
    normalization: Normalization,
    /// Game → vocabulary ids of its surviving tags.
    game_tags: HashMap<String, Vec<usize>>,
}

impl FeatureMatrixBuilder {
    /// Derive the vocabulary from `tags` minus `exclude`.
    pub fn new(
        tags: &GameTagMap,
        exclude: &BTreeSet<String>,
        normalization: Normalization,
    ) -> Result<Self> {
        let vocabulary = Vocabulary::from_tag_map(tags, exclude)?;
        Ok(Self::with_vocabulary(tags, vocabulary, normalization))
    }

    /// Reuse an existing vocabulary, e.g. the one a classifier was trained on.
    /// Tags outside it are ignored.
    pub fn with_vocabulary(
        tags: &GameTagMap,
        vocabulary: Vocabulary,
        normalization: Normalization,
    ) -> Self {
        let game_tags = tags
            .iter()
            .filter_map(|(game, game_tags)| {
                let ids: Vec<usize> = game_tags.iter().filter_map(|t| vocabulary.id(t)).collect();
                (!ids.is_empty()).then(|| (game.to_string(), ids))
            })
            .collect();
        Self {
            vocabulary,
            normalization,
            game_tags,
        }
    }

    pub fn vocabulary(&self) -> &Vocabulary {
        &self.vocabulary
    }

    pub fn normalization(&self) -> Normalization {
        self.normalization
    }

    fn accumulate(&self, library: &UserLibrary) -> Vec<f64> {
        let mut row = vec![0.0f64; self.vocabulary.len()];
        for (game, minutes) in library.games() {
            if minutes == 0 {
                continue;
            }
            let Some(ids) = self.game_tags.get(game) else {
                continue;
            };
            let share = minutes as f64 / ids.len() as f64;
            for &id in ids {
                row[id] += share;
            }
        }
        self.normalization.apply(&mut row);
        row
    }

    /// Vectorize a single library for inference.
    pub fn vectorize(&self, library: &UserLibrary) -> FeatureVector {
        FeatureVector {
            weights: self.accumulate(library).into_iter().map(|w| w as f32).collect(),
            vocabulary_fingerprint: self.vocabulary.fingerprint(),
            normalization: self.normalization,
        }
    }

    /// Build the full matrix, one row per library in input order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EmptyInput`] if there are no libraries.
    pub fn build(&self, libraries: &UserLibraries) -> Result<FeatureMatrix> {
        if libraries.is_empty() {
            return Err(Error::EmptyInput);
        }
        let n = libraries.len();
        let d = self.vocabulary.len();
        let mut data = Array2::<f32>::zeros((n, d));
        let mut zero_rows = 0usize;
        for (i, library) in libraries.iter().enumerate() {
            let row = self.accumulate(library);
            if row.iter().all(|&w| w == 0.0) {
                zero_rows += 1;
            }
            for (j, w) in row.into_iter().enumerate() {
                data[(i, j)] = w as f32;
            }
        }
        tracing::info!(
            users = n,
            tags = d,
            zero_rows,
            normalization = %self.normalization,
            "built feature matrix"
        );
        Ok(FeatureMatrix {
            user_ids: libraries.iter().map(|l| l.user_id().to_string()).collect(),
            vocabulary: self.vocabulary.clone(),
            normalization: self.normalization,
            data,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn tag_map() -> GameTagMap {
        GameTagMap::new([
            ("Stardew", vec!["Farming", "Cozy", "Pixel"]),
            ("Factorio", vec!["Automation", "Base Building"]),
            ("Doom", vec!["Shooter", "Action"]),
        ])
        .unwrap()
    }

    fn builder(normalization: Normalization) -> FeatureMatrixBuilder {
        let exclude: BTreeSet<String> = ["Action".to_string()].into_iter().collect();
        FeatureMatrixBuilder::new(&tag_map(), &exclude, normalization).unwrap()
    }

    #[test]
    fn test_vocabulary_excludes_and_sorts() {
        let b = builder(Normalization::RowMax);
        let tags = b.vocabulary().tags();
        assert!(!tags.contains(&"Action".to_string()));
        assert!(tags.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(tags.len(), 6);
    }

    #[test]
    fn test_playtime_split_across_tags_row_sum() {
        let b = builder(Normalization::RowSum);
        // 300 minutes over 3 tags, 200 over 2 tags; Doom keeps only "Shooter".
        let lib = UserLibrary::new("u", [("Stardew", 300), ("Factorio", 200), ("Doom", 500)]);
        let v = b.vectorize(&lib);
        let vocab = b.vocabulary();
        let w = |t: &str| v.weights()[vocab.id(t).unwrap()];
        assert!((w("Farming") - 100.0 / 1000.0).abs() < 1e-6);
        assert!((w("Automation") - 100.0 / 1000.0).abs() < 1e-6);
        assert!((w("Shooter") - 500.0 / 1000.0).abs() < 1e-6);
        assert!((v.weights().iter().sum::<f32>() - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_row_max_peaks_at_one() {
        let b = builder(Normalization::RowMax);
        let lib = UserLibrary::new("u", [("Stardew", 300), ("Factorio", 200)]);
        let v = b.vectorize(&lib);
        let max = v.weights().iter().copied().fold(0.0f32, f32::max);
        assert!((max - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_zero_playtime_user_is_zero_vector() {
        let b = builder(Normalization::RowSum);
        let unknown_only = UserLibrary::new("u", [("Unlisted Game", 900), ("Stardew", 0)]);
        assert!(b.vectorize(&unknown_only).is_zero());
        let empty = UserLibrary::new("v", Vec::<(String, u64)>::new());
        assert!(b.vectorize(&empty).is_zero());
    }

    #[test]
    fn test_build_keeps_input_order_and_fingerprint() {
        let b = builder(Normalization::RowMax);
        let libs = UserLibraries::new(vec![
            UserLibrary::new("b", [("Doom", 10)]),
            UserLibrary::new("a", [("Stardew", 10)]),
        ])
        .unwrap();
        let m = b.build(&libs).unwrap();
        assert_eq!(m.user_ids(), &["b".to_string(), "a".to_string()]);
        assert_eq!(m.vector(0).vocabulary_fingerprint(), b.vocabulary().fingerprint());
        assert_eq!(m.n_tags(), 6);
    }

    #[test]
    fn test_fingerprint_depends_on_tag_list() {
        let a = Vocabulary::new(["ab", "c"]).unwrap();
        let b = Vocabulary::new(["a", "bc"]).unwrap();
        let c = Vocabulary::new(["c", "ab", "ab"]).unwrap();
        assert_ne!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint(), c.fingerprint());
    }

    #[test]
    fn test_tag_variance_ranks_discriminating_tags_first() {
        let b = builder(Normalization::RowSum);
        let libs = UserLibraries::new(vec![
            UserLibrary::new("x", [("Doom", 100), ("Stardew", 100)]),
            UserLibrary::new("y", [("Factorio", 100), ("Stardew", 100)]),
        ])
        .unwrap();
        let ranked = b.build(&libs).unwrap().tag_variance();
        // Stardew's tags get the same share for both users.
        let last = &ranked[ranked.len() - 1];
        assert!(last.1.abs() < 1e-9);
        assert!(ranked[0].1 > 0.0);
        assert!(["Automation", "Base Building", "Shooter"].contains(&ranked[0].0.as_str()));
    }

    #[test]
    fn test_parses_normalization_names() {
        assert_eq!("row_sum".parse::<Normalization>().unwrap(), Normalization::RowSum);
        assert_eq!("Row-Max".parse::<Normalization>().unwrap(), Normalization::RowMax);
        assert!("zscore".parse::<Normalization>().is_err());
    }

    proptest! {
        #[test]
        fn test_weights_stay_within_bounds(
            playtimes in proptest::collection::vec(0u64..100_000, 3),
            row_sum in any::<bool>(),
        ) {
            let normalization = if row_sum { Normalization::RowSum } else { Normalization::RowMax };
            let b = builder(normalization);
            let lib = UserLibrary::new(
                "p",
                [("Stardew", playtimes[0]), ("Factorio", playtimes[1]), ("Doom", playtimes[2])],
            );
            let v = b.vectorize(&lib);
            for &w in v.weights() {
                prop_assert!((0.0..=1.0 + 1e-6).contains(&w));
            }
            let total: f32 = v.weights().iter().sum();
            if playtimes.iter().all(|&m| m == 0) {
                prop_assert!(v.is_zero());
            } else if row_sum {
                prop_assert!((total - 1.0).abs() < 1e-4);
            } else {
                let max = v.weights().iter().copied().fold(0.0f32, f32::max);
                prop_assert!((max - 1.0).abs() < 1e-6);
            }
        }
    }
}

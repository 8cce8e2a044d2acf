//! Cluster tag signatures and signature-overlap merging.
//!
//! A cluster's [`TagSignature`] is the (at most) three tags with the highest
//! mean weight across its members. DBSCAN often splits one taste into
//! several dense pockets; clusters whose signatures overlap by Jaccard
//! similarity ≥ threshold are collapsed into one.
//!
//! Two merge strategies exist:
//!
//! - [`MergeStrategy::SinglePass`] scans pairs `(i, j)`, `i < j`, once in
//!   ascending order and folds `j` into `i` when neither was merged away.
//!   `A~B` and `B~C` does not imply `A` absorbs `C`.
//! - [`MergeStrategy::Transitive`] merges connected components of the
//!   similarity graph; the lowest id of each component survives.
//!
//! Survivors are renumbered `0..M` in ascending original id order and keep
//! their own signatures, so merging an already-merged table changes nothing.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use ndarray::ArrayView1;
use petgraph::unionfind::UnionFind;
use serde::{Deserialize, Serialize};

use crate::cluster::{ClusterLabel, NOISE};
use crate::error::{Error, Result, UnknownVariant};
use crate::features::{FeatureMatrix, Vocabulary};

/// Jaccard similarity of two sets. Two empty sets have similarity 0.
pub fn jaccard<T: Ord>(a: &BTreeSet<T>, b: &BTreeSet<T>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f64 / union as f64
}

/// Top tags of a cluster, strongest first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct TagSignature {
    tags: Vec<String>,
}

impl TagSignature {
    pub const MAX_TAGS: usize = 3;

    /// # Errors
    ///
    /// Returns [`Error::InputData`] for more than three tags or a repeated tag.
    pub fn new<I, S>(tags: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let tags: Vec<String> = tags.into_iter().map(Into::into).collect();
        if tags.len() > Self::MAX_TAGS {
            return Err(Error::InputData(format!(
                "signature has {} tags, at most {} allowed",
                tags.len(),
                Self::MAX_TAGS
            )));
        }
        let distinct: BTreeSet<&str> = tags.iter().map(String::as_str).collect();
        if distinct.len() != tags.len() {
            return Err(Error::InputData(format!("signature {tags:?} repeats a tag")));
        }
        Ok(Self { tags })
    }

    /// Highest-weight tags of a mean weight row. Zero-weight tags never
    /// qualify; equal weights keep vocabulary order.
    pub fn from_weights(weights: ArrayView1<'_, f32>, vocabulary: &Vocabulary) -> Self {
        let mut ranked: Vec<(usize, f32)> = weights
            .iter()
            .copied()
            .enumerate()
            .filter(|&(_, w)| w > 0.0)
            .collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        let tags = ranked
            .into_iter()
            .take(Self::MAX_TAGS)
            .filter_map(|(id, _)| vocabulary.tag(id).map(str::to_string))
            .collect();
        Self { tags }
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    pub fn tag_set(&self) -> BTreeSet<&str> {
        self.tags.iter().map(String::as_str).collect()
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    pub fn jaccard(&self, other: &TagSignature) -> f64 {
        jaccard(&self.tag_set(), &other.tag_set())
    }
}

impl TryFrom<Vec<String>> for TagSignature {
    type Error = Error;

    fn try_from(tags: Vec<String>) -> Result<Self> {
        Self::new(tags)
    }
}

impl From<TagSignature> for Vec<String> {
    fn from(signature: TagSignature) -> Self {
        signature.tags
    }
}

impl fmt::Display for TagSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.tags.join(", "))
    }
}

/// How overlapping clusters are collapsed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    /// One ascending pass over pairs; not transitively closed.
    #[default]
    SinglePass,
    /// Connected components of the similarity graph.
    Transitive,
}

impl fmt::Display for MergeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MergeStrategy::SinglePass => write!(f, "single_pass"),
            MergeStrategy::Transitive => write!(f, "transitive"),
        }
    }
}

impl FromStr for MergeStrategy {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "single_pass" | "single" => Ok(MergeStrategy::SinglePass),
            "transitive" => Ok(MergeStrategy::Transitive),
            _ => Err(UnknownVariant {
                kind: "merge strategy",
                value: s.to_string(),
            }),
        }
    }
}

/// Original cluster id → merged id, for every original id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergedClusterMap {
    mapping: Vec<usize>,
    n_merged: usize,
}

impl MergedClusterMap {
    /// Merged id of an original cluster.
    pub fn get(&self, original: usize) -> Option<usize> {
        self.mapping.get(original).copied()
    }

    /// Number of original clusters.
    pub fn len(&self) -> usize {
        self.mapping.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mapping.is_empty()
    }

    /// Number of surviving clusters.
    pub fn n_merged(&self) -> usize {
        self.n_merged
    }

    /// True when no cluster was merged away.
    pub fn is_identity(&self) -> bool {
        self.mapping.iter().enumerate().all(|(i, &m)| i == m)
    }

    /// `(original, merged)` pairs in original id order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.mapping.iter().copied().enumerate()
    }

    /// Map DBSCAN labels to merged labels. Noise stays noise.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InputData`] for a label outside the map.
    pub fn relabel(&self, labels: &[ClusterLabel]) -> Result<Vec<ClusterLabel>> {
        labels
            .iter()
            .map(|&label| {
                if label == NOISE {
                    return Ok(NOISE);
                }
                usize::try_from(label)
                    .ok()
                    .and_then(|l| self.get(l))
                    .map(|m| m as ClusterLabel)
                    .ok_or_else(|| {
                        Error::InputData(format!(
                            "label {label} is not covered by a {}-cluster merge map",
                            self.len()
                        ))
                    })
            })
            .collect()
    }
}

/// Result of merging: labels, signatures and members per merged cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergedClusters {
    /// Signature of each original cluster.
    pub original_signatures: Vec<TagSignature>,
    /// Original id → merged id.
    pub map: MergedClusterMap,
    /// Signature of each merged cluster (its surviving original's).
    pub signatures: Vec<TagSignature>,
    /// Merged label per user, noise kept as [`NOISE`].
    pub labels: Vec<ClusterLabel>,
    /// User ids per merged cluster, in feature matrix order.
    pub members: Vec<Vec<String>>,
}

impl MergedClusters {
    pub fn n_clusters(&self) -> usize {
        self.signatures.len()
    }

    /// `(merged id, signature)` pairs.
    pub fn signature_table(&self) -> impl Iterator<Item = (usize, &TagSignature)> {
        self.signatures.iter().enumerate()
    }
}

/// Builds signatures from DBSCAN output and merges overlapping clusters.
#[derive(Debug, Clone)]
pub struct ClusterSignatureMerger {
    threshold: f64,
    strategy: MergeStrategy,
}

impl Default for ClusterSignatureMerger {
    fn default() -> Self {
        Self::new(0.5)
    }
}

impl ClusterSignatureMerger {
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold,
            strategy: MergeStrategy::SinglePass,
        }
    }

    pub fn with_strategy(mut self, strategy: MergeStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn strategy(&self) -> MergeStrategy {
        self.strategy
    }

    /// Signature of every cluster id `0..=max(label)`.
    ///
    /// # Errors
    ///
    /// [`Error::DimensionMismatch`] if `labels` and `features` disagree on
    /// the number of users, [`Error::InputData`] for a label below -1.
    pub fn signatures(
        &self,
        features: &FeatureMatrix,
        labels: &[ClusterLabel],
    ) -> Result<Vec<TagSignature>> {
        Ok(cluster_rows(features, labels)?
            .iter()
            .map(|rows| match features.mean_of(rows) {
                Some(mean) => TagSignature::from_weights(mean.view(), features.vocabulary()),
                None => TagSignature::default(),
            })
            .collect())
    }

    /// Decide which clusters survive.
    pub fn merge_map(&self, signatures: &[TagSignature]) -> Result<MergedClusterMap> {
        if !(self.threshold > 0.0 && self.threshold <= 1.0) {
            return Err(Error::invalid("merge threshold", "must lie in (0, 1]"));
        }
        let n = signatures.len();
        let sets: Vec<BTreeSet<&str>> = signatures.iter().map(TagSignature::tag_set).collect();

        // target[i]: original id that i collapses into (itself for survivors).
        let target: Vec<usize> = match self.strategy {
            MergeStrategy::SinglePass => {
                let mut target: Vec<usize> = (0..n).collect();
                for i in 0..n {
                    if target[i] != i {
                        continue;
                    }
                    for j in i + 1..n {
                        if target[j] == j && jaccard(&sets[i], &sets[j]) >= self.threshold {
                            target[j] = i;
                        }
                    }
                }
                target
            }
            MergeStrategy::Transitive => {
                let mut components = UnionFind::<usize>::new(n);
                for i in 0..n {
                    for j in i + 1..n {
                        if jaccard(&sets[i], &sets[j]) >= self.threshold {
                            components.union(i, j);
                        }
                    }
                }
                // Lowest id in each component represents it.
                let mut lowest = vec![usize::MAX; n];
                (0..n)
                    .map(|i| {
                        let root = components.find(i);
                        if lowest[root] == usize::MAX {
                            lowest[root] = i;
                        }
                        lowest[root]
                    })
                    .collect()
            }
        };

        let mut renumbered = vec![0usize; n];
        let mut n_merged = 0;
        for i in 0..n {
            if target[i] == i {
                renumbered[i] = n_merged;
                n_merged += 1;
            }
        }
        let mapping = target.iter().map(|&t| renumbered[t]).collect();
        Ok(MergedClusterMap { mapping, n_merged })
    }

    /// Full merge stage: signatures, map, merged labels and member lists.
    pub fn merge(&self, features: &FeatureMatrix, labels: &[ClusterLabel]) -> Result<MergedClusters> {
        let original_signatures = self.signatures(features, labels)?;
        let map = self.merge_map(&original_signatures)?;

        // The lowest original id in each group is its survivor.
        let mut survivors: Vec<Option<TagSignature>> = vec![None; map.n_merged()];
        for (original, merged) in map.iter() {
            survivors[merged].get_or_insert_with(|| original_signatures[original].clone());
        }
        let signatures: Vec<TagSignature> = survivors.into_iter().flatten().collect();

        let merged_labels = map.relabel(labels)?;
        let mut members = vec![Vec::new(); map.n_merged()];
        for (user, &label) in features.user_ids().iter().zip(&merged_labels) {
            if label != NOISE {
                members[label as usize].push(user.clone());
            }
        }

        for (original, merged) in map.iter().filter(|&(o, m)| o != m) {
            tracing::debug!(
                original,
                merged,
                signature = %original_signatures[original],
                "cluster merged"
            );
        }
        tracing::info!(
            clusters = map.len(),
            merged = map.n_merged(),
            threshold = self.threshold,
            strategy = %self.strategy,
            "merged cluster signatures"
        );

        Ok(MergedClusters {
            original_signatures,
            map,
            signatures,
            labels: merged_labels,
            members,
        })
    }
}

/// Row indices of each cluster id `0..=max(label)`.
fn cluster_rows(features: &FeatureMatrix, labels: &[ClusterLabel]) -> Result<Vec<Vec<usize>>> {
    if labels.len() != features.n_users() {
        return Err(Error::DimensionMismatch {
            expected: features.n_users(),
            found: labels.len(),
        });
    }
    if let Some(&bad) = labels.iter().find(|&&l| l < NOISE) {
        return Err(Error::InputData(format!("invalid cluster label {bad}")));
    }
    let n_clusters = labels.iter().map(|&l| l + 1).max().unwrap_or(0) as usize;
    let mut rows = vec![Vec::new(); n_clusters];
    for (i, &label) in labels.iter().enumerate() {
        if label != NOISE {
            rows[label as usize].push(i);
        }
    }
    Ok(rows)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::catalog::{GameTagMap, UserLibraries, UserLibrary};
    use crate::features::{FeatureMatrixBuilder, Normalization};
    use proptest::prelude::*;
    use rstest::rstest;

    fn sig(tags: &[&str]) -> TagSignature {
        TagSignature::new(tags.iter().copied()).unwrap()
    }

    #[rstest]
    #[case(0.5, 1)]
    #[case(0.51, 2)]
    fn test_half_overlap_merges_only_at_half(#[case] threshold: f64, #[case] survivors: usize) {
        let a = sig(&["RPG", "Open World", "Fantasy"]);
        let b = sig(&["RPG", "Fantasy", "Indie"]);
        assert!((a.jaccard(&b) - 0.5).abs() < 1e-12);

        let map = ClusterSignatureMerger::new(threshold).merge_map(&[a, b]).unwrap();
        assert_eq!(map.n_merged(), survivors);
    }

    #[test]
    fn test_empty_sets_have_zero_similarity() {
        assert_eq!(TagSignature::default().jaccard(&TagSignature::default()), 0.0);
        let empty: BTreeSet<&str> = BTreeSet::new();
        assert_eq!(jaccard(&empty, &empty), 0.0);
    }

    fn chain() -> Vec<TagSignature> {
        vec![
            sig(&["a", "b", "c"]),
            sig(&["b", "c", "d"]),
            sig(&["c", "d", "e"]),
            sig(&["x", "y", "z"]),
        ]
    }

    #[test]
    fn test_single_pass_does_not_close_chains() {
        let map = ClusterSignatureMerger::new(0.5).merge_map(&chain()).unwrap();
        let pairs: Vec<(usize, usize)> = map.iter().collect();
        assert_eq!(pairs, vec![(0, 0), (1, 0), (2, 1), (3, 2)]);
        assert_eq!(map.n_merged(), 3);
    }

    #[test]
    fn test_transitive_merges_whole_component() {
        let map = ClusterSignatureMerger::new(0.5)
            .with_strategy(MergeStrategy::Transitive)
            .merge_map(&chain())
            .unwrap();
        let pairs: Vec<(usize, usize)> = map.iter().collect();
        assert_eq!(pairs, vec![(0, 0), (1, 0), (2, 0), (3, 1)]);
    }

    #[test]
    fn test_relabel_keeps_noise_and_rejects_unknown_ids() {
        let map = ClusterSignatureMerger::new(0.5).merge_map(&chain()).unwrap();
        assert_eq!(map.relabel(&[3, -1, 1, 0]).unwrap(), vec![2, -1, 0, 0]);
        assert!(map.relabel(&[4]).is_err());
        assert!(!map.is_identity());
    }

    #[test]
    fn test_rejects_out_of_range_threshold() {
        assert!(ClusterSignatureMerger::new(1.5).merge_map(&chain()).is_err());
        // Zero would merge clusters sharing no tag at all.
        assert!(ClusterSignatureMerger::new(0.0).merge_map(&chain()).is_err());
        assert!(ClusterSignatureMerger::new(1.0).merge_map(&chain()).is_ok());
        assert!(ClusterSignatureMerger::new(f64::NAN).merge_map(&chain()).is_err());
    }

    #[test]
    fn test_signature_limits() {
        assert!(TagSignature::new(["a", "b", "c", "d"]).is_err());
        assert!(TagSignature::new(["a", "a"]).is_err());
        let json = serde_json::to_string(&sig(&["b", "a"])).unwrap();
        assert_eq!(json, r#"["b","a"]"#);
        assert!(serde_json::from_str::<TagSignature>(r#"["a","b","c","d"]"#).is_err());
    }

    #[test]
    fn test_strategy_names() {
        assert_eq!("transitive".parse::<MergeStrategy>().unwrap(), MergeStrategy::Transitive);
        assert_eq!("Single-Pass".parse::<MergeStrategy>().unwrap(), MergeStrategy::SinglePass);
        assert!("closure".parse::<MergeStrategy>().is_err());
        assert_eq!(MergeStrategy::SinglePass.to_string(), "single_pass");
    }

    fn features() -> FeatureMatrix {
        let tags = GameTagMap::new([
            ("Civ", vec!["Strategy", "Turn-Based", "Historical"]),
            ("Stellaris", vec!["Strategy", "Space", "Turn-Based"]),
            ("Doom", vec!["FPS", "Action"]),
            ("Quake", vec!["FPS", "Action", "Retro"]),
        ])
        .unwrap();
        let builder =
            FeatureMatrixBuilder::new(&tags, &BTreeSet::new(), Normalization::RowMax).unwrap();
        let libraries = UserLibraries::new(vec![
            UserLibrary::new("s1", [("Civ", 600)]),
            UserLibrary::new("f1", [("Doom", 600)]),
            UserLibrary::new("s2", [("Stellaris", 600)]),
            UserLibrary::new("n", [("Quake", 10)]),
            UserLibrary::new("f2", [("Quake", 600)]),
        ])
        .unwrap();
        builder.build(&libraries).unwrap()
    }

    #[test]
    fn test_signatures_rank_by_mean_weight() {
        let features = features();
        let labels = vec![0, 1, 0, NOISE, 1];
        let signatures = ClusterSignatureMerger::default()
            .signatures(&features, &labels)
            .unwrap();
        // Strategy and Turn-Based appear for both members; Historical and
        // Space tie on mean weight and break by vocabulary order.
        assert_eq!(signatures[0].tags(), &["Strategy", "Turn-Based", "Historical"]);
        assert_eq!(signatures[1].tags(), &["Action", "FPS", "Retro"]);
    }

    #[test]
    fn test_zero_weight_tags_never_enter_signatures() {
        let features = features();
        let labels = vec![NOISE, 0, NOISE, NOISE, NOISE];
        let signatures = ClusterSignatureMerger::default()
            .signatures(&features, &labels)
            .unwrap();
        assert_eq!(signatures[0].tags(), &["Action", "FPS"]);
    }

    #[test]
    fn test_merge_produces_members_and_labels() {
        let features = features();
        // Split the strategy players across two clusters; their signatures
        // share two of three tags and collapse.
        let labels = vec![0, 1, 2, NOISE, 1];
        let merged = ClusterSignatureMerger::new(0.5).merge(&features, &labels).unwrap();
        assert_eq!(merged.n_clusters(), 2);
        assert_eq!(merged.labels, vec![0, 1, 0, NOISE, 1]);
        assert_eq!(merged.members, vec![vec!["s1", "s2"], vec!["f1", "f2"]]);
        assert_eq!(merged.signatures[0], merged.original_signatures[0]);
    }

    #[test]
    fn test_merge_rejects_mismatched_labels() {
        let features = features();
        assert!(matches!(
            ClusterSignatureMerger::default().merge(&features, &[0, 1]),
            Err(Error::DimensionMismatch { expected: 5, found: 2 })
        ));
        assert!(ClusterSignatureMerger::default()
            .merge(&features, &[0, 0, 0, -2, 0])
            .is_err());
    }

    fn arb_signature() -> impl Strategy<Value = TagSignature> {
        proptest::sample::subsequence(vec!["a", "b", "c", "d", "e", "f"], 0..=3)
            .prop_map(|tags| TagSignature::new(tags).unwrap())
    }

    proptest! {
        #[test]
        fn test_merging_merged_signatures_is_a_no_op(
            signatures in proptest::collection::vec(arb_signature(), 0..12),
            threshold in 0.05f64..1.0,
            transitive in any::<bool>(),
        ) {
            let strategy = if transitive { MergeStrategy::Transitive } else { MergeStrategy::SinglePass };
            let merger = ClusterSignatureMerger::new(threshold).with_strategy(strategy);
            let map = merger.merge_map(&signatures).unwrap();

            prop_assert_eq!(map.len(), signatures.len());
            prop_assert!(map.iter().all(|(_, m)| m < map.n_merged()));

            let mut seen = BTreeSet::new();
            let survivors: Vec<TagSignature> = map
                .iter()
                .filter(|&(_, m)| seen.insert(m))
                .map(|(o, _)| signatures[o].clone())
                .collect();
            prop_assert_eq!(survivors.len(), map.n_merged());

            let again = merger.merge_map(&survivors).unwrap();
            prop_assert!(again.is_identity());
        }
    }
}

//! Cluster affinity scoring and game recommendations for a single user.
//!
//! A user's top tags (playtime-ranked, generic tags removed) are compared
//! with every merged cluster's signature by Jaccard similarity. Scores are
//! normalized to sum to one; clusters above the cutoff are visited in
//! descending affinity, and each contributes its most-played games that the
//! user does not already own.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use serde::{Deserialize, Serialize};

use crate::catalog::{GameTagMap, UserLibraries, UserLibrary};
use crate::error::{Error, Result};
use crate::signature::{jaccard, MergedClusters, TagSignature};

/// The user's `n` highest tags by credited playtime.
///
/// Every non-blacklisted tag of a game is credited with the game's full
/// playtime. Equal totals keep tag name order.
pub fn top_user_tags(
    library: &UserLibrary,
    tags: &GameTagMap,
    blacklist: &BTreeSet<String>,
    n: usize,
) -> Vec<String> {
    let mut totals: BTreeMap<&str, u64> = BTreeMap::new();
    for (game, minutes) in library.games() {
        let Some(game_tags) = tags.tags(game) else {
            continue;
        };
        for tag in game_tags.iter().filter(|t| !blacklist.contains(*t)) {
            *totals.entry(tag.as_str()).or_default() += minutes;
        }
    }
    let mut ranked: Vec<(&str, u64)> = totals.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1));
    ranked
        .into_iter()
        .take(n)
        .map(|(tag, _)| tag.to_string())
        .collect()
}

/// Normalized affinity of a user to one merged cluster.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClusterAffinity {
    /// Merged cluster id.
    pub cluster: usize,
    /// Jaccard score divided by the sum over all clusters.
    pub affinity: f64,
}

/// Outcome of a recommendation query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Recommendation {
    /// At least one cluster cleared the cutoff. `games` may still be empty
    /// when the user owns everything those clusters play.
    Matched {
        /// Clusters above the cutoff, strongest first.
        affinities: Vec<ClusterAffinity>,
        games: Vec<String>,
    },
    /// The user's tags overlap no cluster signature.
    NoConfidentMatch,
}

impl Recommendation {
    pub fn games(&self) -> &[String] {
        match self {
            Recommendation::Matched { games, .. } => games,
            Recommendation::NoConfidentMatch => &[],
        }
    }

    pub fn is_match(&self) -> bool {
        matches!(self, Recommendation::Matched { .. })
    }
}

/// Scores cluster affinity and picks unplayed games.
#[derive(Debug, Clone)]
pub struct RecommendationScorer {
    cutoff: f64,
    games_per_cluster: usize,
}

impl Default for RecommendationScorer {
    fn default() -> Self {
        Self::new(0.10)
    }
}

impl RecommendationScorer {
    pub fn new(cutoff: f64) -> Self {
        Self {
            cutoff,
            games_per_cluster: 3,
        }
    }

    pub fn with_games_per_cluster(mut self, games_per_cluster: usize) -> Self {
        self.games_per_cluster = games_per_cluster;
        self
    }

    /// Affinity to every cluster, normalized to sum to one.
    ///
    /// Returns `None` when every raw Jaccard score is zero.
    pub fn affinities(
        &self,
        user_tags: &[String],
        signatures: &[TagSignature],
    ) -> Option<Vec<ClusterAffinity>> {
        let user: BTreeSet<&str> = user_tags.iter().map(String::as_str).collect();
        let raw: Vec<f64> = signatures
            .iter()
            .map(|signature| jaccard(&user, &signature.tag_set()))
            .collect();
        let total: f64 = raw.iter().sum();
        if total <= 0.0 {
            return None;
        }
        Some(
            raw.into_iter()
                .enumerate()
                .map(|(cluster, score)| ClusterAffinity {
                    cluster,
                    affinity: score / total,
                })
                .collect(),
        )
    }

    /// Recommend games for a user.
    ///
    /// `user_tags` come from [`top_user_tags`]; `owned` is the user's full
    /// library, so nothing the user owns is recommended even if it fell
    /// outside their top-N profile.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidParameter`] for a cutoff outside [0, 1),
    /// [`Error::InputData`] when a cluster member has no library.
    pub fn recommend(
        &self,
        user_tags: &[String],
        owned: &UserLibrary,
        clusters: &MergedClusters,
        libraries: &UserLibraries,
    ) -> Result<Recommendation> {
        if !(0.0..1.0).contains(&self.cutoff) {
            return Err(Error::invalid("cutoff", "must lie in [0, 1)"));
        }
        let Some(all) = self.affinities(user_tags, &clusters.signatures) else {
            tracing::info!(user = owned.user_id(), "no cluster affinity");
            return Ok(Recommendation::NoConfidentMatch);
        };

        let mut kept: Vec<ClusterAffinity> = all
            .into_iter()
            .filter(|a| a.affinity > self.cutoff)
            .collect();
        kept.sort_by(|a, b| {
            b.affinity
                .total_cmp(&a.affinity)
                .then(a.cluster.cmp(&b.cluster))
        });

        let mut emitted: HashSet<String> = HashSet::new();
        let mut games = Vec::new();
        for affinity in &kept {
            let members = clusters
                .members
                .get(affinity.cluster)
                .map(Vec::as_slice)
                .unwrap_or_default();
            for game in self.cluster_top_games(members, owned, libraries)? {
                if emitted.insert(game.clone()) {
                    games.push(game);
                }
            }
        }

        tracing::info!(
            user = owned.user_id(),
            clusters = kept.len(),
            games = games.len(),
            "scored recommendation"
        );
        Ok(Recommendation::Matched {
            affinities: kept,
            games,
        })
    }

    /// Most-played games across `members` that `owned` lacks.
    fn cluster_top_games(
        &self,
        members: &[String],
        owned: &UserLibrary,
        libraries: &UserLibraries,
    ) -> Result<Vec<String>> {
        let mut totals: BTreeMap<&str, u64> = BTreeMap::new();
        for member in members {
            let library = libraries
                .get(member)
                .ok_or_else(|| Error::InputData(format!("no library for cluster member '{member}'")))?;
            for (game, minutes) in library.games() {
                if !owned.owns(game) {
                    *totals.entry(game).or_default() += minutes;
                }
            }
        }
        let mut ranked: Vec<(&str, u64)> = totals.into_iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1));
        Ok(ranked
            .into_iter()
            .take(self.games_per_cluster)
            .map(|(game, _)| game.to_string())
            .collect())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::cluster::NOISE;
    use crate::signature::ClusterSignatureMerger;

    fn sig(tags: &[&str]) -> TagSignature {
        TagSignature::new(tags.iter().copied()).unwrap()
    }

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    /// Two merged clusters with hand-written signatures and members.
    fn clusters(signatures: Vec<TagSignature>, members: Vec<Vec<&str>>) -> MergedClusters {
        let map = ClusterSignatureMerger::new(1.0)
            .merge_map(&signatures)
            .unwrap();
        MergedClusters {
            original_signatures: signatures.clone(),
            map,
            signatures,
            labels: vec![NOISE],
            members: members.into_iter().map(|m| strings(&m)).collect(),
        }
    }

    fn libraries() -> UserLibraries {
        UserLibraries::new(vec![
            UserLibrary::new("a", [("Civ", 900), ("Factorio", 600), ("Stardew", 50)]),
            UserLibrary::new("b", [("Civ", 300), ("Rimworld", 800), ("Oxygen", 100)]),
            UserLibrary::new("c", [("Doom", 1000), ("Quake", 400), ("Factorio", 10)]),
            UserLibrary::new("d", [("Doom", 200), ("Halo", 500), ("Rimworld", 5)]),
        ])
        .unwrap()
    }

    #[test]
    fn test_strategy_user_matches_strategy_cluster_only() {
        let merged = clusters(
            vec![
                sig(&["Strategy", "Indie", "Simulation"]),
                sig(&["FPS", "Action", "Multiplayer"]),
            ],
            vec![vec!["a", "b"], vec!["c", "d"]],
        );
        let scorer = RecommendationScorer::default();
        let user_tags = strings(&["Strategy", "Indie"]);

        let all = scorer.affinities(&user_tags, &merged.signatures).unwrap();
        assert!(all[0].affinity > all[1].affinity);
        assert_eq!(all[1].affinity, 0.0);

        let user = UserLibrary::new("u", [("Civ", 100)]);
        let rec = scorer
            .recommend(&user_tags, &user, &merged, &libraries())
            .unwrap();
        let Recommendation::Matched { affinities, games } = rec else {
            panic!("expected a match");
        };
        assert_eq!(affinities.len(), 1);
        assert_eq!(affinities[0].cluster, 0);
        assert!((affinities[0].affinity - 1.0).abs() < 1e-12);
        // Civ is owned; Rimworld 800, Factorio 600, Oxygen 100.
        assert_eq!(games, strings(&["Rimworld", "Factorio", "Oxygen"]));
    }

    #[test]
    fn test_no_overlap_is_no_confident_match() {
        let merged = clusters(vec![sig(&["FPS"]), sig(&["Racing"])], vec![vec!["c"], vec!["d"]]);
        let rec = RecommendationScorer::default()
            .recommend(
                &strings(&["Farming"]),
                &UserLibrary::new("u", [("Stardew", 10)]),
                &merged,
                &libraries(),
            )
            .unwrap();
        assert_eq!(rec, Recommendation::NoConfidentMatch);
        assert!(rec.games().is_empty());
        assert!(!rec.is_match());
    }

    #[test]
    fn test_games_are_deduplicated_in_affinity_order() {
        // Cluster 1 matches better and is visited first.
        let merged = clusters(
            vec![sig(&["Strategy", "Base Building"]), sig(&["Strategy", "Automation"])],
            vec![vec!["b"], vec!["a", "b"]],
        );
        let user_tags = strings(&["Strategy", "Automation"]);
        let user = UserLibrary::new("u", [("Halo", 10)]);
        let rec = RecommendationScorer::default()
            .recommend(&user_tags, &user, &merged, &libraries())
            .unwrap();
        let Recommendation::Matched { affinities, games } = rec else {
            panic!("expected a match");
        };
        assert_eq!(
            affinities.iter().map(|a| a.cluster).collect::<Vec<_>>(),
            vec![1, 0]
        );
        // Cluster 1: Civ 1200, Rimworld 800, Factorio 600.
        // Cluster 0: Rimworld, Civ and Oxygen; only Oxygen is new.
        assert_eq!(games, strings(&["Civ", "Rimworld", "Factorio", "Oxygen"]));
    }

    #[test]
    fn test_owned_games_never_recommended() {
        let merged = clusters(
            vec![sig(&["Strategy"]), sig(&["FPS"])],
            vec![vec!["a", "b"], vec!["c", "d"]],
        );
        let user = UserLibrary::new(
            "u",
            [("Rimworld", 0), ("Doom", 3), ("Factorio", 1), ("Halo", 7)],
        );
        let rec = RecommendationScorer::new(0.0)
            .with_games_per_cluster(10)
            .recommend(&strings(&["Strategy", "FPS"]), &user, &merged, &libraries())
            .unwrap();
        let recommended: BTreeSet<&str> = rec.games().iter().map(String::as_str).collect();
        for (game, _) in user.games() {
            assert!(!recommended.contains(game), "{game} is owned");
        }
        assert!(!recommended.is_empty());
    }

    #[test]
    fn test_cutoff_must_lie_below_one() {
        let merged = clusters(vec![sig(&["Strategy"])], vec![vec!["a"]]);
        let user = UserLibrary::new("u", [("Doom", 1)]);
        let tags = strings(&["Strategy"]);
        // No affinity can exceed 1, so a cutoff of 1 could never match.
        for cutoff in [1.0, -0.1, f64::NAN] {
            assert!(matches!(
                RecommendationScorer::new(cutoff).recommend(&tags, &user, &merged, &libraries()),
                Err(Error::InvalidParameter { name: "cutoff", .. })
            ));
        }
        assert!(RecommendationScorer::new(0.0)
            .recommend(&tags, &user, &merged, &libraries())
            .unwrap()
            .is_match());
    }

    #[test]
    fn test_missing_member_library_is_an_error() {
        let merged = clusters(vec![sig(&["Strategy"])], vec![vec!["ghost"]]);
        let result = RecommendationScorer::default().recommend(
            &strings(&["Strategy"]),
            &UserLibrary::new("u", [("Civ", 1)]),
            &merged,
            &libraries(),
        );
        assert!(matches!(result, Err(Error::InputData(msg)) if msg.contains("ghost")));
    }

    #[test]
    fn test_top_tags_credit_full_playtime_and_skip_blacklist() {
        let tags = GameTagMap::new([
            ("Civ", vec!["Strategy", "Turn-Based", "Historical"]),
            ("Factorio", vec!["Automation", "Strategy"]),
            ("Doom", vec!["FPS", "Action"]),
        ])
        .unwrap();
        let library = UserLibrary::new(
            "u",
            [("Civ", 100), ("Factorio", 300), ("Doom", 50), ("Unknown", 999)],
        );
        let blacklist: BTreeSet<String> = ["Action".to_string()].into_iter().collect();

        let top = top_user_tags(&library, &tags, &blacklist, 10);
        assert_eq!(
            top,
            strings(&["Strategy", "Automation", "Historical", "Turn-Based", "FPS"])
        );
        assert_eq!(top_user_tags(&library, &tags, &blacklist, 2).len(), 2);
    }
}

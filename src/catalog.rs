//! Input records: game tags and user libraries.
//!
//! Both are supplied by external collaborators (store scrapers, profile
//! fetchers). This module only validates them and offers the two
//! reductions the pipeline relies on:
//!
//! - **Tag frequency filtering**: rare tags are noise; a game keeps at most
//!   [`GameTagMap::MAX_TAGS_PER_GAME`] of its surviving tags, in store order.
//! - **Top-N trimming**: a library is reduced to its N most-played games so
//!   that a long tail of idle purchases does not dilute the profile.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Game name → ordered list of at most three tags.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "BTreeMap<String, Vec<String>>", into = "BTreeMap<String, Vec<String>>")]
pub struct GameTagMap {
    games: BTreeMap<String, Vec<String>>,
}

impl GameTagMap {
    /// Upper bound on tags kept per game.
    pub const MAX_TAGS_PER_GAME: usize = 3;

    /// Build a validated tag map.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InputData`] if a game name or tag is blank, a game lists
    /// the same tag twice, or a game carries more than three tags.
    pub fn new<I, G, T>(games: I) -> Result<Self>
    where
        I: IntoIterator<Item = (G, Vec<T>)>,
        G: Into<String>,
        T: Into<String>,
    {
        let mut map = BTreeMap::new();
        for (game, tags) in games {
            let game = game.into();
            let tags: Vec<String> = tags.into_iter().map(Into::into).collect();
            validate_game(&game, &tags)?;
            if map.insert(game.clone(), tags).is_some() {
                return Err(Error::InputData(format!("game '{game}' listed twice")));
            }
        }
        Ok(Self { games: map })
    }

    /// Build from raw scraped tags, dropping tags seen on fewer than
    /// `min_frequency` games and truncating each game to three tags.
    ///
    /// Games left with no tags are kept with an empty list, so they are
    /// recognised but contribute nothing.
    pub fn from_raw(raw: &BTreeMap<String, Vec<String>>, min_frequency: usize) -> Result<Self> {
        let frequencies = Self::tag_frequencies(raw);
        let kept = frequencies.iter().filter(|(_, &count)| count >= min_frequency).count();
        tracing::info!(
            total_tags = frequencies.len(),
            kept_tags = kept,
            min_frequency,
            "filtered raw game tags by frequency"
        );

        let games = raw.iter().map(|(game, tags)| {
            let mut seen = BTreeSet::new();
            let filtered: Vec<String> = tags
                .iter()
                .filter(|tag| frequencies.get(tag.as_str()).copied().unwrap_or(0) >= min_frequency)
                .filter(|tag| seen.insert(tag.as_str()))
                .take(Self::MAX_TAGS_PER_GAME)
                .cloned()
                .collect();
            (game.clone(), filtered)
        });
        Self::new(games)
    }

    /// Number of games carrying each tag.
    pub fn tag_frequencies(raw: &BTreeMap<String, Vec<String>>) -> BTreeMap<String, usize> {
        let mut frequencies = BTreeMap::new();
        for tags in raw.values() {
            let unique: BTreeSet<&String> = tags.iter().collect();
            for tag in unique {
                *frequencies.entry(tag.clone()).or_insert(0) += 1;
            }
        }
        frequencies
    }

    /// Tags of a game, or `None` if the game is unknown.
    pub fn tags(&self, game: &str) -> Option<&[String]> {
        self.games.get(game).map(Vec::as_slice)
    }

    /// Every distinct tag, sorted.
    pub fn all_tags(&self) -> BTreeSet<&str> {
        self.games.values().flatten().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.games.len()
    }

    pub fn is_empty(&self) -> bool {
        self.games.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.games.iter().map(|(g, t)| (g.as_str(), t.as_slice()))
    }
}

impl TryFrom<BTreeMap<String, Vec<String>>> for GameTagMap {
    type Error = Error;

    fn try_from(games: BTreeMap<String, Vec<String>>) -> Result<Self> {
        Self::new(games)
    }
}

impl From<GameTagMap> for BTreeMap<String, Vec<String>> {
    fn from(map: GameTagMap) -> Self {
        map.games
    }
}

fn validate_game(game: &str, tags: &[String]) -> Result<()> {
    if game.trim().is_empty() {
        return Err(Error::InputData("blank game name in tag map".to_string()));
    }
    if tags.len() > GameTagMap::MAX_TAGS_PER_GAME {
        return Err(Error::InputData(format!(
            "game '{game}' has {} tags, at most {} allowed",
            tags.len(),
            GameTagMap::MAX_TAGS_PER_GAME
        )));
    }
    let mut seen = BTreeSet::new();
    for tag in tags {
        if tag.trim().is_empty() {
            return Err(Error::InputData(format!("game '{game}' has a blank tag")));
        }
        if !seen.insert(tag.as_str()) {
            return Err(Error::InputData(format!("game '{game}' repeats tag '{tag}'")));
        }
    }
    Ok(())
}

/// One user's games with playtime in minutes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserLibrary {
    user_id: String,
    playtimes: BTreeMap<String, u64>,
}

impl UserLibrary {
    pub fn new<I, G>(user_id: impl Into<String>, playtimes: I) -> Self
    where
        I: IntoIterator<Item = (G, u64)>,
        G: Into<String>,
    {
        Self {
            user_id: user_id.into(),
            playtimes: playtimes.into_iter().map(|(g, m)| (g.into(), m)).collect(),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn playtime(&self, game: &str) -> Option<u64> {
        self.playtimes.get(game).copied()
    }

    pub fn owns(&self, game: &str) -> bool {
        self.playtimes.contains_key(game)
    }

    /// Games in name order with their playtime.
    pub fn games(&self) -> impl Iterator<Item = (&str, u64)> {
        self.playtimes.iter().map(|(g, &m)| (g.as_str(), m))
    }

    pub fn len(&self) -> usize {
        self.playtimes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.playtimes.is_empty()
    }

    pub fn total_playtime(&self) -> u64 {
        self.playtimes.values().sum()
    }

    /// A non-empty library whose playtimes are all zero: the profile hides playtime.
    pub fn has_hidden_playtime(&self) -> bool {
        !self.playtimes.is_empty() && self.playtimes.values().all(|&m| m == 0)
    }

    /// The `n` most-played games. Equal playtimes keep name order.
    pub fn top_n(&self, n: usize) -> Self {
        let mut ranked: Vec<(&String, &u64)> = self.playtimes.iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(a.1));
        Self {
            user_id: self.user_id.clone(),
            playtimes: ranked
                .into_iter()
                .take(n)
                .map(|(g, &m)| (g.clone(), m))
                .collect(),
        }
    }
}

/// Libraries of many users, kept in input order.
///
/// Input order is significant: density clustering assigns cluster ids in
/// first-discovery order over it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<UserLibrary>", into = "Vec<UserLibrary>")]
pub struct UserLibraries {
    libraries: Vec<UserLibrary>,
    index: HashMap<String, usize>,
}

impl UserLibraries {
    /// # Errors
    ///
    /// Returns [`Error::InputData`] on a blank or duplicated user id.
    pub fn new(libraries: Vec<UserLibrary>) -> Result<Self> {
        let mut index = HashMap::with_capacity(libraries.len());
        for (row, library) in libraries.iter().enumerate() {
            if library.user_id.trim().is_empty() {
                return Err(Error::InputData(format!("blank user id at position {row}")));
            }
            if let Some(first) = index.insert(library.user_id.clone(), row) {
                return Err(Error::InputData(format!(
                    "user '{}' appears at positions {first} and {row}",
                    library.user_id
                )));
            }
        }
        Ok(Self { libraries, index })
    }

    pub fn get(&self, user_id: &str) -> Option<&UserLibrary> {
        self.index.get(user_id).map(|&row| &self.libraries[row])
    }

    pub fn iter(&self) -> impl Iterator<Item = &UserLibrary> {
        self.libraries.iter()
    }

    pub fn as_slice(&self) -> &[UserLibrary] {
        &self.libraries
    }

    pub fn len(&self) -> usize {
        self.libraries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.libraries.is_empty()
    }

    /// Every library trimmed to its `n` most-played games.
    pub fn trimmed(&self, n: usize) -> Self {
        Self {
            libraries: self.libraries.iter().map(|l| l.top_n(n)).collect(),
            index: self.index.clone(),
        }
    }

    /// Drop libraries with hidden playtime. Returns the kept set and the dropped user ids.
    pub fn without_hidden(&self) -> (Self, Vec<String>) {
        let (kept, dropped): (Vec<&UserLibrary>, Vec<&UserLibrary>) =
            self.libraries.iter().partition(|l| !l.has_hidden_playtime());
        let dropped: Vec<String> = dropped.into_iter().map(|l| l.user_id.clone()).collect();
        if !dropped.is_empty() {
            tracing::warn!(dropped = dropped.len(), "dropping libraries with hidden playtime");
        }
        let libraries: Vec<UserLibrary> = kept.into_iter().cloned().collect();
        let index = libraries
            .iter()
            .enumerate()
            .map(|(row, l)| (l.user_id.clone(), row))
            .collect();
        (Self { libraries, index }, dropped)
    }
}

impl TryFrom<Vec<UserLibrary>> for UserLibraries {
    type Error = Error;

    fn try_from(libraries: Vec<UserLibrary>) -> Result<Self> {
        Self::new(libraries)
    }
}

impl From<UserLibraries> for Vec<UserLibrary> {
    fn from(libraries: UserLibraries) -> Self {
        libraries.libraries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(entries: &[(&str, &[&str])]) -> BTreeMap<String, Vec<String>> {
        entries
            .iter()
            .map(|(g, tags)| (g.to_string(), tags.iter().map(|t| t.to_string()).collect()))
            .collect()
    }

    #[test]
    fn test_rejects_more_than_three_tags() {
        let result = GameTagMap::new([("Too Many", vec!["A", "B", "C", "D"])]);
        assert!(matches!(result, Err(Error::InputData(msg)) if msg.contains("Too Many")));
    }

    #[test]
    fn test_rejects_repeated_and_blank_tags() {
        assert!(GameTagMap::new([("Game", vec!["A", "A"])]).is_err());
        assert!(GameTagMap::new([("Game", vec!["A", " "])]).is_err());
        assert!(GameTagMap::new([(" ", vec!["A"])]).is_err());
    }

    #[test]
    fn test_from_raw_filters_rare_tags_and_truncates() {
        let raw = raw(&[
            ("Alpha", &["Roguelike", "Rare", "Deckbuilder", "Pixel Graphics", "Difficult"]),
            ("Beta", &["Roguelike", "Deckbuilder", "Pixel Graphics", "Difficult"]),
            ("Gamma", &["Roguelike", "Sandbox"]),
        ]);
        let map = GameTagMap::from_raw(&raw, 2).unwrap();

        // "Rare" and "Sandbox" appear once; the rest are capped at three.
        assert_eq!(
            map.tags("Alpha").unwrap(),
            &["Roguelike", "Deckbuilder", "Pixel Graphics"]
        );
        assert_eq!(map.tags("Gamma").unwrap(), &["Roguelike"]);
        assert!(!map.all_tags().contains("Rare"));
    }

    #[test]
    fn test_tag_frequencies_count_games_not_mentions() {
        let raw = raw(&[("A", &["X", "X", "Y"]), ("B", &["X"])]);
        let freq = GameTagMap::tag_frequencies(&raw);
        assert_eq!(freq["X"], 2);
        assert_eq!(freq["Y"], 1);
    }

    #[test]
    fn test_top_n_keeps_most_played() {
        let lib = UserLibrary::new("u1", [("a", 10), ("b", 500), ("c", 30), ("d", 30)]);
        let top = lib.top_n(2);
        assert_eq!(top.len(), 2);
        assert!(top.owns("b"));
        assert!(top.owns("c"));
        assert_eq!(top.user_id(), "u1");
    }

    #[test]
    fn test_hidden_playtime_detection() {
        assert!(UserLibrary::new("u", [("a", 0), ("b", 0)]).has_hidden_playtime());
        assert!(!UserLibrary::new("u", [("a", 0), ("b", 5)]).has_hidden_playtime());
        assert!(!UserLibrary::new("u", Vec::<(String, u64)>::new()).has_hidden_playtime());
    }

    #[test]
    fn test_duplicate_users_rejected() {
        let libs = vec![
            UserLibrary::new("same", [("a", 1)]),
            UserLibrary::new("same", [("b", 1)]),
        ];
        let err = UserLibraries::new(libs).unwrap_err();
        assert!(matches!(err, Error::InputData(msg) if msg.contains("same")));
    }

    #[test]
    fn test_without_hidden_reindexes() {
        let libs = UserLibraries::new(vec![
            UserLibrary::new("hidden", [("a", 0)]),
            UserLibrary::new("visible", [("a", 60)]),
        ])
        .unwrap();
        let (kept, dropped) = libs.without_hidden();
        assert_eq!(dropped, vec!["hidden".to_string()]);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept.get("visible").unwrap().playtime("a"), Some(60));
        assert!(kept.get("hidden").is_none());
    }

    #[test]
    fn test_serde_round_trip_validates() {
        let json = r#"{"Portal": ["Puzzle", "First-Person"], "Celeste": ["Platformer"]}"#;
        let map: GameTagMap = serde_json::from_str(json).unwrap();
        assert_eq!(map.len(), 2);

        let bad = r#"{"X": ["A", "B", "C", "D"]}"#;
        assert!(serde_json::from_str::<GameTagMap>(bad).is_err());
    }
}

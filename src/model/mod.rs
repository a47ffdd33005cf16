//! Core data models for the comic library.
//!
//! Defines the watched entries ([`Folder`], [`Comic`], [`FailedImport`]),
//! the four-level group chain, and the simple named relations.
//! Row types derive SQLx's `FromRow` for database mapping.
//!
//! # Database Schema
//!
//! - `libraries` - Watched library roots
//! - `folders`, `comics`, `failed_imports` - Watched entries, unique per (library, path)
//! - `publishers` → `imprints` → `series` → `volumes` - Group chain
//! - `tags`, `characters`, ... `credits` - Named relations linked through `comic_*` tables

mod stat;

pub use stat::StatTuple;

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A library root being kept in sync.
#[derive(Debug, Clone, FromRow)]
pub struct Library {
    pub id: i64,
    /// Absolute root path
    pub path: String,
    /// Subscribe to live OS events
    pub events: bool,
    /// Poll on a timer
    pub poll: bool,
    pub poll_every_secs: i64,
    /// RFC 3339 timestamp of the last completed poll
    pub last_poll: Option<String>,
    pub update_in_progress: bool,
}

/// A directory inside a library.
#[derive(Debug, Clone, FromRow)]
pub struct Folder {
    pub id: i64,
    pub library_id: i64,
    pub path: String,
    pub name: String,
    /// None for top-level folders directly under the library root
    pub parent_folder_id: Option<i64>,
    pub stat: Option<String>,
}

/// A comic archive.
#[derive(Debug, Clone, FromRow)]
pub struct Comic {
    pub id: i64,
    pub library_id: i64,
    pub path: String,
    pub name: String,
    pub parent_folder_id: Option<i64>,
    pub stat: Option<String>,
    pub publisher_id: i64,
    pub imprint_id: i64,
    pub series_id: i64,
    pub volume_id: i64,
    /// Earlier copy of the same issue, if any
    pub variant_of_id: Option<i64>,
    pub title: Option<String>,
    pub issue_number: Option<f64>,
    pub issue_suffix: Option<String>,
    pub year: Option<i64>,
    pub month: Option<i64>,
    pub day: Option<i64>,
    pub summary: Option<String>,
    pub age_rating: Option<String>,
    pub language: Option<String>,
    pub page_count: Option<i64>,
    pub file_type: Option<String>,
    pub size: i64,
}

/// A path that could not be imported.
#[derive(Debug, Clone, FromRow)]
pub struct FailedImport {
    pub id: i64,
    pub library_id: i64,
    pub path: String,
    pub name: String,
    pub parent_folder_id: Option<i64>,
    pub stat: Option<String>,
    /// Short human readable reason
    pub reason: String,
    pub updated_at: String,
}

/// A publisher, imprint, series or volume row.
#[derive(Debug, Clone, FromRow)]
pub struct GroupRow {
    pub id: i64,
    /// Parent group id (None for publishers)
    pub parent_id: Option<i64>,
    pub name: String,
    pub is_default: bool,
    /// Expected child count (series and volumes only)
    pub count: Option<i64>,
}

/// One level of the fixed four-level group chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum GroupLevel {
    Publisher,
    Imprint,
    Series,
    Volume,
}

impl GroupLevel {
    pub const ALL: [GroupLevel; 4] = [
        GroupLevel::Publisher,
        GroupLevel::Imprint,
        GroupLevel::Series,
        GroupLevel::Volume,
    ];

    /// Reserved name of the default member at this level.
    pub fn default_name(self) -> &'static str {
        match self {
            GroupLevel::Publisher => "No Publisher",
            GroupLevel::Imprint => "No Imprint",
            GroupLevel::Series => "No Series",
            GroupLevel::Volume => "No Volume",
        }
    }

    pub fn table(self) -> &'static str {
        match self {
            GroupLevel::Publisher => "publishers",
            GroupLevel::Imprint => "imprints",
            GroupLevel::Series => "series",
            GroupLevel::Volume => "volumes",
        }
    }

    /// Column on the level's own table pointing at its parent.
    pub fn parent_column(self) -> Option<&'static str> {
        match self {
            GroupLevel::Publisher => None,
            GroupLevel::Imprint => Some("publisher_id"),
            GroupLevel::Series => Some("imprint_id"),
            GroupLevel::Volume => Some("series_id"),
        }
    }

    /// Column holding the forward-looking child count, if the level has one.
    pub fn count_column(self) -> Option<&'static str> {
        match self {
            GroupLevel::Series => Some("volume_count"),
            GroupLevel::Volume => Some("issue_count"),
            _ => None,
        }
    }

    /// Column on `comics` referencing this level.
    pub fn comic_column(self) -> &'static str {
        match self {
            GroupLevel::Publisher => "publisher_id",
            GroupLevel::Imprint => "imprint_id",
            GroupLevel::Series => "series_id",
            GroupLevel::Volume => "volume_id",
        }
    }
}

/// A group's identity within its parent.
///
/// Default members are flagged explicitly rather than inferred from the
/// name, so a real imprint literally called "No Imprint" stays distinct
/// from the placeholder one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupName {
    pub name: String,
    pub is_default: bool,
}

impl GroupName {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_default: false,
        }
    }

    pub fn default_for(level: GroupLevel) -> Self {
        Self {
            name: level.default_name().to_string(),
            is_default: true,
        }
    }

    /// Use the level's default member when metadata omits the name.
    pub fn from_metadata(level: GroupLevel, name: Option<&str>) -> Self {
        match name.map(str::trim).filter(|n| !n.is_empty()) {
            Some(name) => Self::named(name),
            None => Self::default_for(level),
        }
    }
}

/// Simple unique-by-name entities linked many-to-many to comics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum NamedKind {
    Tag,
    Character,
    Genre,
    Location,
    Team,
    StoryArc,
    SeriesGroup,
}

impl NamedKind {
    pub const ALL: [NamedKind; 7] = [
        NamedKind::Tag,
        NamedKind::Character,
        NamedKind::Genre,
        NamedKind::Location,
        NamedKind::Team,
        NamedKind::StoryArc,
        NamedKind::SeriesGroup,
    ];

    pub fn table(self) -> &'static str {
        match self {
            NamedKind::Tag => "tags",
            NamedKind::Character => "characters",
            NamedKind::Genre => "genres",
            NamedKind::Location => "locations",
            NamedKind::Team => "teams",
            NamedKind::StoryArc => "story_arcs",
            NamedKind::SeriesGroup => "series_groups",
        }
    }

    pub fn link_table(self) -> &'static str {
        match self {
            NamedKind::Tag => "comic_tags",
            NamedKind::Character => "comic_characters",
            NamedKind::Genre => "comic_genres",
            NamedKind::Location => "comic_locations",
            NamedKind::Team => "comic_teams",
            NamedKind::StoryArc => "comic_story_arcs",
            NamedKind::SeriesGroup => "comic_series_groups",
        }
    }

    pub fn link_column(self) -> &'static str {
        match self {
            NamedKind::Tag => "tag_id",
            NamedKind::Character => "character_id",
            NamedKind::Genre => "genre_id",
            NamedKind::Location => "location_id",
            NamedKind::Team => "team_id",
            NamedKind::StoryArc => "story_arc_id",
            NamedKind::SeriesGroup => "series_group_id",
        }
    }
}

/// A credit identity: person plus optional role.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CreditKey {
    pub role: Option<String>,
    pub person: String,
}

impl CreditKey {
    pub fn new(person: impl Into<String>, role: Option<impl Into<String>>) -> Self {
        Self {
            role: role.map(Into::into),
            person: person.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_group_name_uses_default() {
        let imprint = GroupName::from_metadata(GroupLevel::Imprint, None);
        assert!(imprint.is_default);
        assert_eq!(imprint.name, "No Imprint");

        let blank = GroupName::from_metadata(GroupLevel::Series, Some("   "));
        assert!(blank.is_default);
    }

    #[test]
    fn test_literal_default_name_is_not_default() {
        let literal = GroupName::from_metadata(GroupLevel::Imprint, Some("No Imprint"));
        assert!(!literal.is_default);
        assert_ne!(literal, GroupName::default_for(GroupLevel::Imprint));
    }

    #[test]
    fn test_level_columns() {
        assert_eq!(GroupLevel::Publisher.parent_column(), None);
        assert_eq!(GroupLevel::Volume.parent_column(), Some("series_id"));
        assert_eq!(GroupLevel::Series.count_column(), Some("volume_count"));
        assert_eq!(GroupLevel::Imprint.count_column(), None);
    }
}

//! Comic metadata decoding.
//!
//! The sync engine never parses archives itself. It calls a
//! [`MetadataDecoder`], which turns a path into a [`ComicMetadata`] record
//! or a typed [`DecodeError`]. Decoders must not touch the database.
//!
//! [`DefaultDecoder`] is the decoder the binary ships with: it checks the
//! archive signature, then reads a JSON sidecar or falls back to parsing
//! the file name.

mod decoder;

pub use decoder::{DefaultDecoder, parse_file_name};

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Scalar fields stored directly on the comic row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComicFields {
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
}

/// A credited person and their role.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditName {
    pub person: String,
    #[serde(default)]
    pub role: Option<String>,
}

/// Everything a decoder knows about one comic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComicMetadata {
    #[serde(flatten)]
    pub fields: ComicFields,

    pub publisher: Option<String>,
    pub imprint: Option<String>,
    pub series: Option<String>,
    pub volume: Option<String>,
    /// Number of volumes the series is expected to have
    pub series_volume_count: Option<i64>,
    /// Number of issues the volume is expected to have
    pub volume_issue_count: Option<i64>,

    pub tags: Vec<String>,
    pub characters: Vec<String>,
    pub genres: Vec<String>,
    pub locations: Vec<String>,
    pub teams: Vec<String>,
    pub story_arcs: Vec<String>,
    pub series_groups: Vec<String>,
    pub credits: Vec<CreditName>,
}

/// Why a file could not be decoded.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("Cannot read {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Empty file")]
    Empty,

    #[error("Not a comic archive: {0}")]
    UnsupportedFormat(String),

    #[error("Archive signature does not match .{0}")]
    SignatureMismatch(String),

    #[error("Malformed metadata: {0}")]
    Malformed(String),
}

impl DecodeError {
    pub fn unreadable(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Unreadable {
            path: path.into(),
            source,
        }
    }

    /// Short reason stored on the failed import row.
    pub fn reason(&self) -> String {
        match self {
            // The path is already on the row
            Self::Unreadable { source, .. } => format!("Cannot read file: {source}"),
            other => other.to_string(),
        }
    }
}

/// External metadata decoder.
///
/// Called from a rayon pool, so implementations must be thread safe.
pub trait MetadataDecoder: Send + Sync {
    /// Decode the comic at `path`.
    fn decode(&self, path: &Path) -> Result<ComicMetadata, DecodeError>;

    /// Extract cover image bytes, if this decoder can.
    fn cover(&self, _path: &Path) -> Result<Option<Vec<u8>>, DecodeError> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unreadable_reason_omits_path() {
        let err = DecodeError::unreadable(
            "/secret/path/a.cbz",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        let reason = err.reason();
        assert!(reason.contains("denied"));
        assert!(!reason.contains("/secret/path"));
    }

    #[test]
    fn test_metadata_deserializes_flattened_fields() {
        let json = r#"{
            "title": "Days of Future Past",
            "issue_number": 141,
            "publisher": "Marvel",
            "series": "Uncanny X-Men",
            "tags": ["classic"],
            "credits": [{"person": "Chris Claremont", "role": "Writer"}, {"person": "Anon"}]
        }"#;
        let meta: ComicMetadata = serde_json::from_str(json).unwrap();
        assert_eq!(meta.fields.title.as_deref(), Some("Days of Future Past"));
        assert_eq!(meta.fields.issue_number, Some(141.0));
        assert_eq!(meta.imprint, None);
        assert_eq!(meta.credits.len(), 2);
        assert_eq!(meta.credits[1].role, None);
    }
}

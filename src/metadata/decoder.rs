//! The decoder shipped with the binary.
//!
//! It does not open archives. It verifies that the file's signature matches
//! its extension, then takes metadata from a `<file>.json` sidecar when one
//! exists, or from the file name otherwise
//! (`Uncanny X-Men v1980 #141a (1981).cbz`).

use std::ffi::OsString;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use super::{ComicMetadata, DecodeError, MetadataDecoder};

/// Bytes needed to see every supported signature (tar's sits at 257).
const HEADER_LEN: usize = 262;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArchiveFormat {
    Zip,
    Rar,
    SevenZip,
    Tar,
    Pdf,
}

impl ArchiveFormat {
    fn from_extension(ext: &str) -> Option<Self> {
        match ext {
            "cbz" | "zip" => Some(Self::Zip),
            "cbr" | "rar" => Some(Self::Rar),
            "cb7" | "7z" => Some(Self::SevenZip),
            "cbt" | "tar" => Some(Self::Tar),
            "pdf" => Some(Self::Pdf),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Zip => "cbz",
            Self::Rar => "cbr",
            Self::SevenZip => "cb7",
            Self::Tar => "cbt",
            Self::Pdf => "pdf",
        }
    }

    fn matches(self, header: &[u8]) -> bool {
        match self {
            Self::Zip => header.starts_with(b"PK\x03\x04") || header.starts_with(b"PK\x05\x06"),
            Self::Rar => header.starts_with(b"Rar!\x1a\x07"),
            Self::SevenZip => header.starts_with(b"7z\xbc\xaf\x27\x1c"),
            Self::Tar => header.len() >= 262 && &header[257..262] == b"ustar",
            Self::Pdf => header.starts_with(b"%PDF"),
        }
    }
}

/// Signature check plus sidecar or file-name metadata.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultDecoder;

impl DefaultDecoder {
    fn sidecar_path(path: &Path) -> PathBuf {
        let mut os: OsString = path.as_os_str().to_owned();
        os.push(".json");
        PathBuf::from(os)
    }

    fn read_header(path: &Path) -> Result<Vec<u8>, DecodeError> {
        let file = File::open(path).map_err(|e| DecodeError::unreadable(path, e))?;
        let mut header = Vec::with_capacity(HEADER_LEN);
        file.take(HEADER_LEN as u64)
            .read_to_end(&mut header)
            .map_err(|e| DecodeError::unreadable(path, e))?;
        Ok(header)
    }
}

impl MetadataDecoder for DefaultDecoder {
    fn decode(&self, path: &Path) -> Result<ComicMetadata, DecodeError> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_lowercase)
            .unwrap_or_default();
        let format = ArchiveFormat::from_extension(&ext)
            .ok_or_else(|| DecodeError::UnsupportedFormat(format!(".{ext}")))?;

        let header = Self::read_header(path)?;
        if header.is_empty() {
            return Err(DecodeError::Empty);
        }
        if !format.matches(&header) {
            return Err(DecodeError::SignatureMismatch(ext));
        }

        let sidecar = Self::sidecar_path(path);
        let mut meta = if sidecar.is_file() {
            let contents = std::fs::read_to_string(&sidecar)
                .map_err(|e| DecodeError::unreadable(&sidecar, e))?;
            serde_json::from_str::<ComicMetadata>(&contents)
                .map_err(|e| DecodeError::Malformed(e.to_string()))?
        } else {
            let stem = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            parse_file_name(&stem)
        };

        meta.fields.file_type = Some(format.name().to_string());
        Ok(meta)
    }
}

/// Pull series, volume, issue and year out of a conventional file name.
pub fn parse_file_name(stem: &str) -> ComicMetadata {
    let mut meta = ComicMetadata::default();

    // Parenthesised groups: the first plausible year wins, the rest is noise
    let mut cleaned = String::with_capacity(stem.len());
    let mut depth = 0usize;
    let mut group = String::new();
    for c in stem.chars() {
        match c {
            '(' | '[' => {
                depth += 1;
                group.clear();
            }
            ')' | ']' if depth > 0 => {
                depth -= 1;
                if meta.fields.year.is_none()
                    && let Ok(year) = group.trim().parse::<i64>()
                    && (1900..=2100).contains(&year)
                {
                    meta.fields.year = Some(year);
                }
                cleaned.push(' ');
            }
            _ if depth > 0 => group.push(c),
            '_' => cleaned.push(' '),
            _ => cleaned.push(c),
        }
    }

    let tokens: Vec<&str> = cleaned.split_whitespace().collect();
    let mut series_words = Vec::new();
    let mut in_series = true;
    for (i, token) in tokens.iter().enumerate() {
        if let Some(issue) = token.strip_prefix('#') {
            in_series = false;
            set_issue(&mut meta, issue);
        } else if let Some(volume) = volume_token(token) {
            in_series = false;
            meta.volume = Some(volume);
        } else if in_series
            && i == tokens.len() - 1
            && i > 0
            && token.chars().next().is_some_and(|c| c.is_ascii_digit())
        {
            // "Saga 012" style trailing issue number
            set_issue(&mut meta, token);
        } else if in_series {
            series_words.push(*token);
        }
    }

    let series = series_words.join(" ");
    let series = series.trim_matches(|c: char| c == '-' || c.is_whitespace());
    if !series.is_empty() {
        meta.series = Some(series.to_string());
    }
    meta
}

fn volume_token(token: &str) -> Option<String> {
    let rest = token.strip_prefix('v').or_else(|| token.strip_prefix('V'))?;
    if rest.is_empty() || !rest.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let trimmed = rest.trim_start_matches('0');
    Some(if trimmed.is_empty() { "0" } else { trimmed }.to_string())
}

fn set_issue(meta: &mut ComicMetadata, raw: &str) {
    let split = raw
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(raw.len());
    let (number, suffix) = raw.split_at(split);
    meta.fields.issue_number = number.parse::<f64>().ok();
    if !suffix.is_empty() {
        meta.fields.issue_suffix = Some(suffix.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_parse_full_file_name() {
        let meta = parse_file_name("Uncanny X-Men v1980 #141a (1981) (digital)");
        assert_eq!(meta.series.as_deref(), Some("Uncanny X-Men"));
        assert_eq!(meta.volume.as_deref(), Some("1980"));
        assert_eq!(meta.fields.issue_number, Some(141.0));
        assert_eq!(meta.fields.issue_suffix.as_deref(), Some("a"));
        assert_eq!(meta.fields.year, Some(1981));
    }

    #[test]
    fn test_parse_trailing_issue_and_underscores() {
        let meta = parse_file_name("Saga_012");
        assert_eq!(meta.series.as_deref(), Some("Saga"));
        assert_eq!(meta.fields.issue_number, Some(12.0));
        assert_eq!(meta.volume, None);
    }

    #[test]
    fn test_parse_bare_name() {
        let meta = parse_file_name("Watchmen");
        assert_eq!(meta.series.as_deref(), Some("Watchmen"));
        assert_eq!(meta.fields.issue_number, None);
        assert_eq!(meta.fields.year, None);
    }

    #[test]
    fn test_decode_checks_signature() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("Saga v01 #001.cbz");
        let bad = dir.path().join("Saga v01 #002.cbz");
        let empty = dir.path().join("Saga v01 #003.cbz");
        fs::write(&good, b"PK\x03\x04rest").unwrap();
        fs::write(&bad, b"<html>oops</html>").unwrap();
        fs::write(&empty, b"").unwrap();

        let meta = DefaultDecoder.decode(&good).unwrap();
        assert_eq!(meta.fields.file_type.as_deref(), Some("cbz"));
        assert_eq!(meta.volume.as_deref(), Some("1"));

        assert!(matches!(
            DefaultDecoder.decode(&bad),
            Err(DecodeError::SignatureMismatch(_))
        ));
        assert!(matches!(DefaultDecoder.decode(&empty), Err(DecodeError::Empty)));
    }

    #[test]
    fn test_decode_prefers_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("whatever.cbr");
        fs::write(&path, b"Rar!\x1a\x07\x00").unwrap();
        fs::write(
            dir.path().join("whatever.cbr.json"),
            r#"{"publisher": "Image", "series": "Saga", "tags": ["space"]}"#,
        )
        .unwrap();

        let meta = DefaultDecoder.decode(&path).unwrap();
        assert_eq!(meta.publisher.as_deref(), Some("Image"));
        assert_eq!(meta.series.as_deref(), Some("Saga"));
        assert_eq!(meta.tags, vec!["space".to_string()]);
        assert_eq!(meta.fields.file_type.as_deref(), Some("cbr"));
    }

    #[test]
    fn test_decode_malformed_sidecar_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.cbz");
        fs::write(&path, b"PK\x03\x04").unwrap();
        fs::write(dir.path().join("a.cbz.json"), "{not json").unwrap();

        assert!(matches!(
            DefaultDecoder.decode(&path),
            Err(DecodeError::Malformed(_))
        ));
    }

    #[test]
    fn test_decode_missing_file_is_unreadable() {
        let result = DefaultDecoder.decode(Path::new("/definitely/not/here.cbz"));
        assert!(matches!(result, Err(DecodeError::Unreadable { .. })));
    }
}

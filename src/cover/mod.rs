//! Cover thumbnail storage.
//!
//! The cover worker fills this cache from decoder output or from bytes
//! handed over in a task. Rendering and resizing are not done here; the
//! bytes are stored as given, keyed by the comic's path.

mod cache;

pub use cache::{CoverCache, cache_key};

/// File extension for an image, sniffed from its magic bytes.
pub fn image_extension(data: &[u8]) -> &'static str {
    if data.starts_with(b"\x89PNG\r\n\x1a\n") {
        "png"
    } else if data.starts_with(b"GIF8") {
        "gif"
    } else if data.len() >= 12 && &data[0..4] == b"RIFF" && &data[8..12] == b"WEBP" {
        "webp"
    } else {
        "jpg"
    }
}

//! Cover disk cache.
//!
//! Caches cover images so they are extracted once per comic.
//! Uses a SHA-256 of the comic's path as the cache key.

use std::fs;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use super::image_extension;
use crate::config::CoverConfig;

const EXTENSIONS: [&str; 4] = ["jpg", "png", "gif", "webp"];

/// Cache key for a comic path.
pub fn cache_key(comic_path: &Path) -> String {
    let digest = Sha256::digest(comic_path.to_string_lossy().as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Cover disk cache.
pub struct CoverCache {
    cache_dir: PathBuf,
}

impl CoverCache {
    /// A cache rooted at `cache_dir`, which is created if missing.
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        let cache_dir = cache_dir.into();
        if let Err(e) = fs::create_dir_all(&cache_dir) {
            tracing::warn!(target: "cover", path = %cache_dir.display(), error = %e, "Cannot create cover cache");
        }
        Self { cache_dir }
    }

    /// `comic-minder/covers` under the OS cache directory.
    pub fn default_location() -> Self {
        let base = dirs::cache_dir().unwrap_or_else(|| PathBuf::from(".cache"));
        Self::new(base.join("comic-minder").join("covers"))
    }

    /// Use the configured directory, or the default location.
    pub fn from_config(config: &CoverConfig) -> Self {
        match &config.cache_dir {
            Some(dir) => Self::new(dir),
            None => Self::default_location(),
        }
    }

    /// Get the cached cover of a comic.
    pub fn get(&self, comic_path: &Path) -> Option<Vec<u8>> {
        let path = self.find(comic_path)?;
        fs::read(path).ok()
    }

    /// Store a cover, replacing any previous one for the same comic.
    pub fn put(&self, comic_path: &Path, data: &[u8]) -> Result<PathBuf, std::io::Error> {
        self.remove(comic_path)?;
        let path = self
            .cache_dir
            .join(format!("{}.{}", cache_key(comic_path), image_extension(data)));
        fs::write(&path, data)?;
        Ok(path)
    }

    /// Check if a comic's cover is cached.
    pub fn contains(&self, comic_path: &Path) -> bool {
        self.find(comic_path).is_some()
    }

    /// Remove a comic's cover. Returns false if there was none.
    pub fn remove(&self, comic_path: &Path) -> Result<bool, std::io::Error> {
        match self.find(comic_path) {
            Some(path) => {
                fs::remove_file(path)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn find(&self, comic_path: &Path) -> Option<PathBuf> {
        let key = cache_key(comic_path);
        EXTENSIONS
            .iter()
            .map(|ext| self.cache_dir.join(format!("{key}.{ext}")))
            .find(|p| p.exists())
    }

    /// Bytes used by cached covers; unreadable entries count as zero.
    pub fn size_bytes(&self) -> u64 {
        let Ok(entries) = fs::read_dir(&self.cache_dir) else {
            return 0;
        };
        entries
            .flatten()
            .filter_map(|entry| entry.metadata().ok())
            .filter(|md| md.is_file())
            .map(|md| md.len())
            .sum()
    }
}

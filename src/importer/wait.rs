//! Waiting for in-flight copies.
//!
//! A file being copied into a library shows up before its bytes do. Before
//! decoding, the importer re-measures the total size of the files it is
//! about to read until two consecutive measurements agree.

use std::path::PathBuf;
use std::time::{Duration, Instant};

/// Total size of `paths`; missing files count as zero.
fn total_size(paths: &[PathBuf]) -> u64 {
    paths
        .iter()
        .filter_map(|p| std::fs::metadata(p).ok())
        .map(|md| md.len())
        .sum()
}

async fn measure(paths: &[PathBuf]) -> u64 {
    let paths = paths.to_vec();
    tokio::task::spawn_blocking(move || total_size(&paths))
        .await
        .unwrap_or(0)
}

/// Wait until the total size of `paths` stops changing.
///
/// Returns false if `expiry` elapsed first; the caller proceeds anyway.
pub async fn wait_for_copies(paths: &[PathBuf], poll: Duration, expiry: Duration) -> bool {
    if paths.is_empty() {
        return true;
    }
    let started = Instant::now();
    let mut last = measure(paths).await;
    loop {
        tokio::time::sleep(poll).await;
        let current = measure(paths).await;
        if current == last {
            return true;
        }
        if started.elapsed() >= expiry {
            tracing::warn!(
                target: "importer::wait",
                files = paths.len(),
                waited_secs = started.elapsed().as_secs(),
                "Files still growing, importing anyway"
            );
            return false;
        }
        tracing::debug!(target: "importer::wait", previous = last, current, "Waiting for copies to settle");
        last = current;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stable_files_return_quickly() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.cbz");
        std::fs::write(&path, b"PK\x03\x04data").unwrap();

        let settled = wait_for_copies(&[path], Duration::from_millis(10), Duration::from_secs(5)).await;
        assert!(settled);
    }

    #[tokio::test]
    async fn test_growing_file_expires() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("growing.cbz");
        std::fs::write(&path, b"PK").unwrap();

        let writer_path = path.clone();
        let writer = tokio::spawn(async move {
            for i in 0..50 {
                let data = vec![0u8; 16 * (i + 2)];
                let _ = std::fs::write(&writer_path, data);
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });

        let settled = wait_for_copies(&[path], Duration::from_millis(20), Duration::from_millis(60)).await;
        writer.abort();
        assert!(!settled);
    }
}

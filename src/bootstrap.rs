//! Bootstrap accelerator.
//!
//! A fresh tor instance must download the full consensus and relay
//! descriptors through its bridges before it is usable, which takes minutes.
//! A long-lived reference instance already has those files; copying them into
//! a new instance's data directory before launch cuts bootstrap to tens of
//! seconds. The copy is refreshed periodically so seeds stay current.

use log::{debug, warn};
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use tokio::time::Instant;

/// Network-state files worth carrying over from the reference instance.
const SNAPSHOT_FILES: &[&str] = &[
    "cached-certs",
    "cached-microdesc-consensus",
    "cached-microdescs",
    "cached-microdescs.new",
    "cached-descriptors",
    "cached-descriptors.new",
];

/// Holds the latest network-state snapshot taken from the reference
/// instance's data directory.
pub struct SnapshotStore {
    /// Source of truth; `None` disables acceleration entirely.
    reference_dir: Option<PathBuf>,
    /// Staging directory the snapshot is copied into.
    snapshot_dir: PathBuf,
    last_refresh: RwLock<Option<Instant>>,
}

impl SnapshotStore {
    pub fn new(reference_dir: Option<PathBuf>, pool_data_dir: &Path) -> Self {
        Self {
            reference_dir,
            snapshot_dir: pool_data_dir.join("base-snapshot"),
            last_refresh: RwLock::new(None),
        }
    }

    /// Whether a snapshot has been captured since startup.
    pub fn has_snapshot(&self) -> bool {
        self.last_refresh.read().is_some()
    }

    /// Copy the reference instance's current network-state files into the
    /// staging directory. Errors are non-fatal: the previous snapshot (or
    /// nothing, on cold start) keeps being served.
    pub async fn refresh(&self) {
        let Some(reference) = &self.reference_dir else {
            return;
        };
        match copy_snapshot_files(reference, &self.snapshot_dir).await {
            Ok(0) => debug!("snapshot refresh: reference instance has no cache files yet"),
            Ok(n) => {
                debug!("snapshot refresh: captured {n} file(s) from reference instance");
                *self.last_refresh.write() = Some(Instant::now());
            }
            Err(e) => warn!("snapshot refresh failed: {e}"),
        }
    }

    /// Seed a new instance's data directory from the staged snapshot.
    /// Returns how many files were copied; zero on cold start.
    pub async fn seed(&self, instance_dir: &Path) -> Result<usize, std::io::Error> {
        if !self.has_snapshot() {
            return Ok(0);
        }
        copy_snapshot_files(&self.snapshot_dir, instance_dir).await
    }
}

/// Copy the known cache files from `src` to `dst`, newest wins. Missing
/// source files are skipped, not errors.
async fn copy_snapshot_files(src: &Path, dst: &Path) -> Result<usize, std::io::Error> {
    tokio::fs::create_dir_all(dst).await?;
    let mut copied = 0usize;
    for name in SNAPSHOT_FILES {
        let from = src.join(name);
        let to = dst.join(name);
        if !tokio::fs::try_exists(&from).await.unwrap_or(false) {
            continue;
        }
        if let (Ok(src_meta), Ok(dst_meta)) =
            (tokio::fs::metadata(&from).await, tokio::fs::metadata(&to).await)
        {
            // Only overwrite a seed that is older than the source.
            if let (Ok(src_m), Ok(dst_m)) = (src_meta.modified(), dst_meta.modified()) {
                if src_m <= dst_m {
                    continue;
                }
            }
        }
        tokio::fs::copy(&from, &to).await?;
        copied += 1;
    }
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn refresh_then_seed_copies_cache_files() {
        let reference = tempdir().unwrap();
        let pool = tempdir().unwrap();
        let instance = tempdir().unwrap();

        for name in ["cached-certs", "cached-microdesc-consensus"] {
            tokio::fs::write(reference.path().join(name), b"state")
                .await
                .unwrap();
        }

        let store = SnapshotStore::new(Some(reference.path().to_path_buf()), pool.path());
        assert!(!store.has_snapshot());
        store.refresh().await;
        assert!(store.has_snapshot());

        let seeded = store.seed(instance.path()).await.unwrap();
        assert_eq!(seeded, 2);
        assert!(instance.path().join("cached-certs").exists());
    }

    #[test]
    fn cold_start_seeds_nothing() {
        tokio_test::block_on(async {
            let pool = tempdir().unwrap();
            let instance = tempdir().unwrap();
            let store = SnapshotStore::new(None, pool.path());
            store.refresh().await;
            assert!(!store.has_snapshot());
            assert_eq!(store.seed(instance.path()).await.unwrap(), 0);
        });
    }

    #[tokio::test]
    async fn missing_reference_files_are_skipped() {
        let reference = tempdir().unwrap();
        let pool = tempdir().unwrap();
        tokio::fs::write(reference.path().join("cached-certs"), b"x")
            .await
            .unwrap();

        let store = SnapshotStore::new(Some(reference.path().to_path_buf()), pool.path());
        store.refresh().await;

        let instance = tempdir().unwrap();
        assert_eq!(store.seed(instance.path()).await.unwrap(), 1);
    }
}

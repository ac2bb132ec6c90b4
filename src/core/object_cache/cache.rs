// src/core/object_cache/cache.rs

use super::client::ObjectServerClient;
use crate::core::hash::{Hash, Object};
use dashmap::DashMap;
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::HashMap;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// The ephemeral set of content-addressed blobs available on this machine,
/// populated by a local filesystem scan and/or a remote pull.
#[derive(Default)]
pub struct ObjectCache {
    objects: DashMap<Hash, Arc<Object>>,
}

impl ObjectCache {
    pub fn new() -> Self {
        ObjectCache::default()
    }

    pub fn get(&self, hash: &Hash) -> Option<Arc<Object>> {
        self.objects.get(hash).map(|r| Arc::clone(&r))
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.objects.contains_key(hash)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Inserts a blob after verifying it hashes to `hash`. Returns false
    /// (and inserts nothing) on mismatch, upholding the cache's only
    /// invariant.
    pub fn insert_verified(&self, hash: Hash, bytes: bytes::Bytes) -> bool {
        match Object::verified(hash, bytes) {
            Some(object) => {
                self.objects.insert(hash, Arc::new(object));
                true
            }
            None => false,
        }
    }

    /// Scans `root` for regular files whose content hash is in
    /// `required`, caching any not already present. Single-device only:
    /// subdirectories on a different filesystem are skipped, and inodes
    /// already visited (hardlinks) are hashed once. Zero-length files are
    /// skipped; they trivially hash but carry no useful data.
    pub async fn scan_filesystem(&self, root: &Path, required: &HashSet<Hash>) -> std::io::Result<ScanStats> {
        let root_dev = std::fs::metadata(root)?.dev();
        let mut visited_inodes = HashSet::new();
        let mut stats = ScanStats::default();
        self.scan_dir(root, root_dev, &mut visited_inodes, required, &mut stats).await?;
        Ok(stats)
    }

    fn scan_dir<'a>(
        &'a self,
        dir: &'a Path,
        root_dev: u64,
        visited_inodes: &'a mut HashSet<u64>,
        required: &'a HashSet<Hash>,
        stats: &'a mut ScanStats,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = std::io::Result<()>> + 'a>> {
        Box::pin(async move {
            let mut entries = tokio::fs::read_dir(dir).await?;
            let mut files = Vec::new();
            let mut subdirs = Vec::new();

            while let Some(entry) = entries.next_entry().await? {
                let file_type = entry.file_type().await?;
                let path = entry.path();
                if file_type.is_symlink() {
                    continue;
                } else if file_type.is_dir() {
                    subdirs.push(path);
                } else if file_type.is_file() {
                    files.push(path);
                }
                // sockets/devices are ignored implicitly: neither branch matches.
            }

            let mut hashing = FuturesUnordered::new();
            for path in files {
                hashing.push(async move {
                    let meta = tokio::fs::metadata(&path).await?;
                    Ok::<_, std::io::Error>((path, meta))
                });
            }

            while let Some(result) = hashing.next().await {
                let (path, meta) = result?;
                if meta.len() == 0 {
                    continue;
                }
                let inode = meta.ino();
                if !visited_inodes.insert(inode) {
                    continue;
                }
                let bytes = tokio::fs::read(&path).await?;
                stats.files_hashed += 1;
                let hash = Hash::of(&bytes);
                if required.contains(&hash) && !self.objects.contains_key(&hash) {
                    self.objects.insert(hash, Arc::new(Object(bytes::Bytes::from(bytes))));
                    stats.files_cached += 1;
                }
            }

            for subdir in subdirs {
                let dev = match tokio::fs::metadata(&subdir).await {
                    Ok(meta) => meta.dev(),
                    Err(_) => continue,
                };
                if dev != root_dev {
                    continue;
                }
                self.scan_dir(&subdir, root_dev, visited_inodes, required, stats).await?;
            }
            Ok(())
        })
    }

    /// Hashes not yet satisfied by `required`.
    pub fn missing(&self, required: &HashMap<Hash, u64>) -> HashSet<Hash> {
        required
            .keys()
            .filter(|h| !self.objects.contains_key(h))
            .copied()
            .collect()
    }

    /// `required` minus what's cached, plus a count and total byte size of
    /// the missing set. An empty `required` trivially returns an empty set
    /// with zero count and zero size.
    pub fn compute_missing(&self, required: &HashMap<Hash, u64>) -> (HashSet<Hash>, usize, u64) {
        let missing = self.missing(required);
        let total_size: u64 = missing.iter().map(|h| required[h]).sum();
        let count = missing.len();
        (missing, count, total_size)
    }

    /// Fetches still-missing objects from the remote server in one
    /// streaming call. Any fetch error aborts the whole build; a partial
    /// cache from the earlier scan steps is still left in place.
    pub async fn fetch_missing(
        &self,
        client: &dyn ObjectServerClient,
        missing: &HashSet<Hash>,
    ) -> anyhow::Result<()> {
        if missing.is_empty() {
            return Ok(());
        }
        let hashes: Vec<Hash> = missing.iter().copied().collect();
        let fetched = client.get_objects(&hashes).await?;
        for (hash, bytes) in fetched {
            if !self.insert_verified(hash, bytes) {
                anyhow::bail!("object server returned bytes not matching hash {hash}");
            }
        }
        Ok(())
    }

    /// Mounts and scans the "untrusted" old root filesystem at
    /// `mount_point` for objects the primary scan missed. Mount failure is
    /// non-fatal: it's the expected case when no old root exists, so it's
    /// logged at info rather than silently ignored. The mount is always
    /// released on the way out, success or failure.
    pub async fn scan_untrusted_old_root(
        &self,
        mounter: &dyn OldRootMounter,
        mount_point: &Path,
        required: &HashSet<Hash>,
    ) -> std::io::Result<ScanStats> {
        if let Err(e) = mounter.mount(mount_point).await {
            info!(error = %e, mount_point = %mount_point.display(), "old root mount unavailable, skipping untrusted scan");
            return Ok(ScanStats::default());
        }
        let result = self.scan_filesystem(mount_point, required).await;
        if let Err(e) = mounter.unmount(mount_point).await {
            warn!(error = %e, mount_point = %mount_point.display(), "failed to unmount old root");
        }
        result
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ScanStats {
    pub files_hashed: u64,
    pub files_cached: u64,
}

/// Mounts and unmounts the old-root filesystem used by
/// `scan_untrusted_old_root`. Abstracted so tests can exercise the
/// "mount fails, scan is skipped" path without touching `mount(8)`.
#[async_trait::async_trait]
pub trait OldRootMounter: Send + Sync {
    async fn mount(&self, mount_point: &Path) -> std::io::Result<()>;
    async fn unmount(&self, mount_point: &Path) -> std::io::Result<()>;
}

/// Shells out to `mount`/`umount` for an ext4 device configured at
/// construction time.
pub struct ExternalOldRootMounter {
    pub device: PathBuf,
}

#[async_trait::async_trait]
impl OldRootMounter for ExternalOldRootMounter {
    async fn mount(&self, mount_point: &Path) -> std::io::Result<()> {
        let status = tokio::process::Command::new("mount")
            .args(["-t", "ext4", "-o", "ro"])
            .arg(&self.device)
            .arg(mount_point)
            .status()
            .await?;
        if status.success() {
            Ok(())
        } else {
            Err(std::io::Error::other(format!("mount exited with {status}")))
        }
    }

    async fn unmount(&self, mount_point: &Path) -> std::io::Result<()> {
        let status = tokio::process::Command::new("umount").arg(mount_point).status().await?;
        if status.success() {
            Ok(())
        } else {
            Err(std::io::Error::other(format!("umount exited with {status}")))
        }
    }
}

#[cfg(unix)]
use std::os::unix::fs::MetadataExt;

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    #[test]
    fn insert_verified_rejects_mismatched_bytes() {
        let cache = ObjectCache::new();
        let real_hash = Hash::of(b"abc");
        assert!(!cache.insert_verified(real_hash, bytes::Bytes::from_static(b"xyz")));
        assert!(cache.is_empty());
    }

    #[test]
    fn insert_verified_accepts_matching_bytes() {
        let cache = ObjectCache::new();
        let hash = Hash::of(b"abc");
        assert!(cache.insert_verified(hash, bytes::Bytes::from_static(b"abc")));
        assert!(cache.contains(&hash));
    }

    #[tokio::test]
    async fn scan_filesystem_caches_only_required_hashes() {
        let dir = tempdir().unwrap();
        let wanted_path = dir.path().join("wanted.txt");
        let unwanted_path = dir.path().join("unwanted.txt");
        tokio::fs::write(&wanted_path, b"wanted-bytes").await.unwrap();
        tokio::fs::write(&unwanted_path, b"unwanted-bytes").await.unwrap();

        let wanted_hash = Hash::of(b"wanted-bytes");
        let mut required = HashSet::new();
        required.insert(wanted_hash);

        let cache = ObjectCache::new();
        let stats = cache.scan_filesystem(dir.path(), &required).await.unwrap();

        assert!(cache.contains(&wanted_hash));
        assert_eq!(cache.len(), 1);
        assert_eq!(stats.files_cached, 1);
        assert_eq!(stats.files_hashed, 2);
    }

    #[tokio::test]
    async fn scan_filesystem_skips_zero_length_files() {
        let dir = tempdir().unwrap();
        let empty_path = dir.path().join("empty.txt");
        tokio::fs::write(&empty_path, b"").await.unwrap();
        let empty_hash = Hash::of(b"");

        let mut required = HashSet::new();
        required.insert(empty_hash);

        let cache = ObjectCache::new();
        cache.scan_filesystem(dir.path(), &required).await.unwrap();
        assert!(!cache.contains(&empty_hash));
    }

    #[test]
    fn missing_reports_unsatisfied_hashes() {
        let cache = ObjectCache::new();
        let present = Hash::of(b"present");
        cache.insert_verified(present, bytes::Bytes::from_static(b"present"));
        let absent = Hash::of(b"absent");

        let mut required = HashMap::new();
        required.insert(present, 7u64);
        required.insert(absent, 6u64);

        let missing = cache.missing(&required);
        assert_eq!(missing, HashSet::from([absent]));
    }

    // Testable property: compute_missing on an empty required set returns
    // (empty, 0, 0).
    #[test]
    fn compute_missing_on_empty_required_set_is_all_zero() {
        let cache = ObjectCache::new();
        let (missing, count, size) = cache.compute_missing(&HashMap::new());
        assert!(missing.is_empty());
        assert_eq!(count, 0);
        assert_eq!(size, 0);
    }

    #[test]
    fn compute_missing_sums_sizes_of_missing_hashes() {
        let cache = ObjectCache::new();
        let present = Hash::of(b"present");
        cache.insert_verified(present, bytes::Bytes::from_static(b"present"));
        let absent = Hash::of(b"absent");

        let mut required = HashMap::new();
        required.insert(present, 100u64);
        required.insert(absent, 42u64);

        let (missing, count, size) = cache.compute_missing(&required);
        assert_eq!(missing, HashSet::from([absent]));
        assert_eq!(count, 1);
        assert_eq!(size, 42);
    }

    struct AlwaysFailsMounter;
    #[async_trait::async_trait]
    impl OldRootMounter for AlwaysFailsMounter {
        async fn mount(&self, _mount_point: &Path) -> std::io::Result<()> {
            Err(std::io::Error::other("no such device"))
        }
        async fn unmount(&self, _mount_point: &Path) -> std::io::Result<()> {
            Ok(())
        }
    }

    // Old root unavailable is a no-op, not an error.
    #[tokio::test]
    async fn untrusted_scan_is_noop_when_mount_fails() {
        let cache = ObjectCache::new();
        let mounter = AlwaysFailsMounter;
        let required = HashSet::new();
        let stats = cache
            .scan_untrusted_old_root(&mounter, Path::new("/mnt/oldroot"), &required)
            .await
            .unwrap();
        assert_eq!(stats.files_hashed, 0);
    }
}

//! Bounded, mtime-validated caches keyed by canonical real path (§4.5).
//! Both caches are internally synchronized `Mutex`-guarded `lru::LruCache`
//! instances (§5's "Shared resource policy"); callers never observe a
//! partial update, and a lookup miss always falls back to a real `stat`.

use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;

use lru::LruCache;

use crate::source_resolver::VirtualKind;

const DEFAULT_CAPACITY: usize = 4096;

/// §3's AttrRecord, always synthesized rather than `libc::stat`-returned
/// verbatim so that synthetic and archive-hosted nodes can report
/// consistent, plausible attributes.
#[derive(Debug, Clone, Copy)]
pub struct AttrRecord {
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
}

const MODE_DIR: u32 = 0o040_755;
const MODE_RO_FILE: u32 = 0o100_444;

impl AttrRecord {
    pub fn synthetic_directory() -> Self {
        let now = SystemTime::now();
        AttrRecord {
            mode: MODE_DIR,
            nlink: 2,
            uid: current_uid(),
            gid: current_gid(),
            size: 4096,
            atime: now,
            mtime: now,
            ctime: now,
        }
    }

    pub fn read_only_file(size: u64, mtime: SystemTime) -> Self {
        AttrRecord {
            mode: MODE_RO_FILE,
            nlink: 1,
            uid: current_uid(),
            gid: current_gid(),
            size,
            atime: mtime,
            mtime,
            ctime: mtime,
        }
    }

    pub fn from_real_metadata(meta: &std::fs::Metadata, force_kind: Option<VirtualKind>) -> Self {
        use std::os::unix::fs::MetadataExt;
        let forced_mode = match force_kind {
            Some(VirtualKind::Directory) => Some(MODE_DIR),
            Some(VirtualKind::File) => Some(MODE_RO_FILE),
            None => None,
        };
        AttrRecord {
            mode: forced_mode.unwrap_or(meta.mode()),
            nlink: meta.nlink() as u32,
            uid: meta.uid(),
            gid: meta.gid(),
            size: if force_kind == Some(VirtualKind::Directory) {
                4096
            } else {
                meta.size()
            },
            atime: meta.accessed().unwrap_or(SystemTime::UNIX_EPOCH),
            mtime: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            ctime: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
        }
    }

    pub fn is_dir(&self) -> bool {
        self.mode & 0o170_000 == 0o040_000
    }
}

#[cfg(unix)]
fn current_uid() -> u32 {
    unsafe { libc::getuid() }
}
#[cfg(unix)]
fn current_gid() -> u32 {
    unsafe { libc::getgid() }
}
#[cfg(not(unix))]
fn current_uid() -> u32 {
    0
}
#[cfg(not(unix))]
fn current_gid() -> u32 {
    0
}

fn real_mtime(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).ok()?.modified().ok()
}

struct DirSnapshot {
    mtime: SystemTime,
    entries: Vec<String>,
}

pub struct DirCache {
    inner: Mutex<LruCache<PathBuf, DirSnapshot>>,
}

impl DirCache {
    pub fn new() -> Self {
        DirCache {
            inner: Mutex::new(LruCache::new(NonZeroUsize::new(DEFAULT_CAPACITY).unwrap())),
        }
    }

    /// A hit only if `dir`'s current mtime equals the snapshot's (§4.5).
    pub fn get(&self, dir: &Path) -> Option<Vec<String>> {
        let current = real_mtime(dir)?;
        let mut guard = self.inner.lock().unwrap();
        let snapshot = guard.get(dir)?;
        if snapshot.mtime == current {
            Some(snapshot.entries.clone())
        } else {
            None
        }
    }

    pub fn put(&self, dir: PathBuf, entries: Vec<String>) {
        let Some(mtime) = real_mtime(&dir) else {
            return;
        };
        self.inner.lock().unwrap().put(dir, DirSnapshot { mtime, entries });
    }

    /// The snapshot mtime recorded for `dir`, if cached — used by
    /// `AttrCache` to avoid a second `stat` of the parent directory.
    pub fn snapshot_mtime(&self, dir: &Path) -> Option<SystemTime> {
        self.inner.lock().unwrap().peek(dir).map(|s| s.mtime)
    }
}

impl Default for DirCache {
    fn default() -> Self {
        Self::new()
    }
}

struct AttrSnapshot {
    parent_mtime: SystemTime,
    record: AttrRecord,
}

pub struct AttrCache {
    inner: Mutex<LruCache<PathBuf, AttrSnapshot>>,
}

impl AttrCache {
    pub fn new() -> Self {
        AttrCache {
            inner: Mutex::new(LruCache::new(NonZeroUsize::new(DEFAULT_CAPACITY).unwrap())),
        }
    }

    /// A hit only if the real path's parent directory's current snapshot
    /// mtime matches the one recorded at insertion (§4.5).
    pub fn get(&self, real_path: &Path, dir_cache: &DirCache) -> Option<AttrRecord> {
        let parent = real_path.parent()?;
        let current_parent_mtime = dir_cache
            .snapshot_mtime(parent)
            .or_else(|| real_mtime(parent))?;
        let mut guard = self.inner.lock().unwrap();
        let snapshot = guard.get(real_path)?;
        if snapshot.parent_mtime == current_parent_mtime {
            Some(snapshot.record)
        } else {
            None
        }
    }

    pub fn put(&self, real_path: PathBuf, record: AttrRecord, dir_cache: &DirCache) {
        let Some(parent) = real_path.parent() else {
            return;
        };
        let Some(parent_mtime) = dir_cache
            .snapshot_mtime(parent)
            .or_else(|| real_mtime(parent))
        else {
            return;
        };
        self.inner.lock().unwrap().put(
            real_path,
            AttrSnapshot {
                parent_mtime,
                record,
            },
        );
    }
}

impl Default for AttrCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Context shared by every façade operation: one `DirCache`/`AttrCache`
/// pair per process (§9's "replace module-level globals" design note —
/// these are owned values threaded explicitly rather than statics).
pub struct FsContext {
    pub dir_cache: DirCache,
    pub attr_cache: AttrCache,
}

impl FsContext {
    pub fn new() -> Self {
        FsContext {
            dir_cache: DirCache::new(),
            attr_cache: AttrCache::new(),
        }
    }
}

impl Default for FsContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn dir_cache_hit_requires_matching_mtime() {
        let dir = tempdir().unwrap();
        let cache = DirCache::new();
        cache.put(dir.path().to_path_buf(), vec!["a".into()]);
        assert_eq!(cache.get(dir.path()), Some(vec!["a".into()]));

        // Touch the directory so its mtime changes.
        std::fs::write(dir.path().join("new_file"), b"x").unwrap();
        assert_eq!(cache.get(dir.path()), None);
    }

    #[test]
    fn attr_cache_hit_requires_matching_parent_mtime() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("f.txt");
        std::fs::write(&file, b"hi").unwrap();

        let dir_cache = DirCache::new();
        let attr_cache = AttrCache::new();
        let record = AttrRecord::read_only_file(2, SystemTime::now());
        attr_cache.put(file.clone(), record, &dir_cache);
        assert!(attr_cache.get(&file, &dir_cache).is_some());

        std::fs::write(dir.path().join("sibling"), b"y").unwrap();
        assert!(attr_cache.get(&file, &dir_cache).is_none());
    }
}

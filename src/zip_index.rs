//! Per-archive lazy index answering `exists/isdir/isfile/listdir/getinfo`
//! over `(zip_path, inner_path)` (§4.4). Grounded on the teacher's
//! `fs::zip_fs::ZipFs` construction pattern (open the archive once, build
//! flat name -> entry maps), generalized here to metadata-only answers
//! instead of content reads, plus a process-wide cache with mtime-based
//! invalidation that `ZipFs` never needed.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant, SystemTime};

use log::warn;
use lru::LruCache;
use zip::ZipArchive;

use crate::error::{FsError, FsResult};

/// §4.4: "A max age (e.g., 1 hour) ... are the invalidation predicates."
const MAX_AGE: Duration = Duration::from_secs(3600);
const REGISTRY_CAPACITY: usize = 128;
const THREAD_LOCAL_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy)]
pub struct EntryInfo {
    pub size: u64,
    pub is_dir: bool,
}

/// One archive's materialized metadata. Immutable once built; readers need
/// no lock once they hold an `Arc<ZipIndex>` (§4.4 concurrency note).
pub struct ZipIndex {
    pub zip_path: PathBuf,
    mtime: SystemTime,
    built_at: Instant,
    file_sizes: HashMap<String, u64>,
    dir_set: HashSet<String>,
    children_cache: Mutex<HashMap<String, Arc<Vec<String>>>>,
}

fn normalize_inner(inner: &str) -> String {
    inner.trim_matches('/').to_string()
}

fn parent_of(path: &str) -> Option<&str> {
    path.rfind('/').map(|i| &path[..i])
}

impl ZipIndex {
    fn build(zip_path: &Path, mtime: SystemTime) -> FsResult<Self> {
        let file = std::fs::File::open(zip_path)?;
        let mut archive = ZipArchive::new(file)?;

        let mut file_sizes: HashMap<String, u64> = HashMap::new();
        let mut dir_set: HashSet<String> = HashSet::new();

        for i in 0..archive.len() {
            let entry = archive.by_index(i)?;
            let raw_name = entry.name();
            let is_dir = raw_name.ends_with('/');
            let name = normalize_inner(raw_name);
            if name.is_empty() {
                continue;
            }
            if is_dir {
                dir_set.insert(name);
            } else {
                file_sizes.insert(name, entry.size());
            }
        }

        // Implicit directories: every ancestor prefix of a file or explicit
        // directory must itself exist in `dir_set` (§3's ZipIndex model).
        let mut ancestors = Vec::new();
        for name in file_sizes.keys().chain(dir_set.iter()) {
            let mut cur = name.as_str();
            while let Some(parent) = parent_of(cur) {
                if !parent.is_empty() {
                    ancestors.push(parent.to_string());
                }
                cur = parent;
            }
        }
        dir_set.extend(ancestors);

        Ok(ZipIndex {
            zip_path: zip_path.to_path_buf(),
            mtime,
            built_at: Instant::now(),
            file_sizes,
            dir_set,
            children_cache: Mutex::new(HashMap::new()),
        })
    }

    fn is_stale(&self, current_mtime: SystemTime) -> bool {
        self.mtime != current_mtime || self.built_at.elapsed() > MAX_AGE
    }

    pub fn isfile(&self, inner: &str) -> bool {
        self.file_sizes.contains_key(&normalize_inner(inner))
    }

    pub fn isdir(&self, inner: &str) -> bool {
        let inner = normalize_inner(inner);
        inner.is_empty() || self.dir_set.contains(&inner)
    }

    pub fn exists(&self, inner: &str) -> bool {
        self.isfile(inner) || self.isdir(inner)
    }

    pub fn getinfo(&self, inner: &str) -> Option<EntryInfo> {
        let inner = normalize_inner(inner);
        if let Some(size) = self.file_sizes.get(&inner) {
            return Some(EntryInfo { size: *size, is_dir: false });
        }
        if inner.is_empty() || self.dir_set.contains(&inner) {
            return Some(EntryInfo { size: 0, is_dir: true });
        }
        None
    }

    /// Sorted, deduplicated first components of every proper descendant of
    /// `inner` (§4.4). Cached per prefix for the lifetime of this index.
    pub fn listdir(&self, inner: &str) -> FsResult<Vec<String>> {
        let prefix = normalize_inner(inner);
        if !prefix.is_empty() && !self.dir_set.contains(&prefix) {
            return Err(FsError::NotFound);
        }
        if let Some(cached) = self.children_cache.lock().unwrap().get(&prefix) {
            return Ok(cached.as_ref().clone());
        }
        let mut children: HashSet<&str> = HashSet::new();
        let candidates = self.file_sizes.keys().chain(self.dir_set.iter());
        for name in candidates {
            let rest = if prefix.is_empty() {
                Some(name.as_str())
            } else {
                name.strip_prefix(&prefix)
                    .and_then(|r| r.strip_prefix('/'))
            };
            if let Some(rest) = rest {
                if rest.is_empty() {
                    continue;
                }
                let first = rest.split('/').next().unwrap();
                children.insert(first);
            }
        }
        let mut out: Vec<String> = children.into_iter().map(str::to_owned).collect();
        out.sort();
        let out = Arc::new(out);
        self.children_cache
            .lock()
            .unwrap()
            .insert(prefix, out.clone());
        Ok(out.as_ref().clone())
    }

    /// Every file whose basename (final `/`-separated component) equals
    /// `basename`, sorted for deterministic tie-break.
    pub fn files_with_basename(&self, basename: &str) -> Vec<&str> {
        let mut out: Vec<&str> = self
            .file_sizes
            .keys()
            .filter(|name| name.rsplit('/').next() == Some(basename))
            .map(String::as_str)
            .collect();
        out.sort();
        out
    }
}

struct Registry {
    global: RwLock<LruCache<PathBuf, Arc<ZipIndex>>>,
}

static REGISTRY: std::sync::OnceLock<Registry> = std::sync::OnceLock::new();

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(|| Registry {
        global: RwLock::new(LruCache::new(
            std::num::NonZeroUsize::new(REGISTRY_CAPACITY).unwrap(),
        )),
    })
}

thread_local! {
    static LOCAL_CACHE: std::cell::RefCell<LruCache<PathBuf, Arc<ZipIndex>>> =
        std::cell::RefCell::new(LruCache::new(std::num::NonZeroUsize::new(THREAD_LOCAL_CAPACITY).unwrap()));
}

/// Returns a cached or freshly built index for `zip_path`. Mirrors §4.4's
/// two-tier cache: a thread-local fast path backed by a process-wide
/// single-writer/multi-reader registry.
pub fn get_or_build(zip_path: &Path) -> FsResult<Arc<ZipIndex>> {
    let metadata = std::fs::metadata(zip_path)?;
    let mtime = metadata.modified()?;

    if let Some(hit) = LOCAL_CACHE.with(|c| {
        c.borrow_mut()
            .get(zip_path)
            .filter(|idx| !idx.is_stale(mtime))
            .cloned()
    }) {
        return Ok(hit);
    }

    if let Some(hit) = registry()
        .global
        .read()
        .unwrap()
        .peek(zip_path)
        .filter(|idx| !idx.is_stale(mtime))
        .cloned()
    {
        LOCAL_CACHE.with(|c| c.borrow_mut().put(zip_path.to_path_buf(), hit.clone()));
        return Ok(hit);
    }

    let built = match ZipIndex::build(zip_path, mtime) {
        Ok(idx) => Arc::new(idx),
        Err(e) => {
            warn!("zip index build failed for {}: {e}", zip_path.display());
            return Err(e);
        }
    };
    registry()
        .global
        .write()
        .unwrap()
        .put(zip_path.to_path_buf(), built.clone());
    LOCAL_CACHE.with(|c| c.borrow_mut().put(zip_path.to_path_buf(), built.clone()));
    Ok(built)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::{SimpleFileOptions, ZipWriter};

    fn make_zip(path: &Path) {
        let file = std::fs::File::create(path).unwrap();
        let mut zw = ZipWriter::new(file);
        let opts = SimpleFileOptions::default();
        zw.start_file("Games/1942.cdt", opts).unwrap();
        zw.write_all(b"ZXTape!\x1a-rest-of-file").unwrap();
        zw.start_file("Games/chuckie.cdt", opts).unwrap();
        zw.write_all(b"DATA").unwrap();
        zw.start_file("Readme.txt", opts).unwrap();
        zw.write_all(b"hello").unwrap();
        zw.finish().unwrap();
    }

    #[test]
    fn listdir_returns_sorted_first_components() {
        let dir = tempfile::tempdir().unwrap();
        let zip_path = dir.path().join("Collection.zip");
        make_zip(&zip_path);

        let idx = get_or_build(&zip_path).unwrap();
        assert_eq!(idx.listdir("").unwrap(), vec!["Games", "Readme.txt"]);
        assert_eq!(
            idx.listdir("Games").unwrap(),
            vec!["1942.cdt", "chuckie.cdt"]
        );
        assert!(idx.isdir("Games"));
        assert!(idx.isfile("Games/1942.cdt"));
        assert_eq!(idx.getinfo("Readme.txt").unwrap().size, 5);
    }

    #[test]
    fn repeated_listdir_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let zip_path = dir.path().join("Collection.zip");
        make_zip(&zip_path);
        let idx = get_or_build(&zip_path).unwrap();
        assert_eq!(idx.listdir("Games").unwrap(), idx.listdir("Games").unwrap());
    }

    #[test]
    fn corrupt_archive_is_an_error_not_cached() {
        let dir = tempfile::tempdir().unwrap();
        let zip_path = dir.path().join("bad.zip");
        std::fs::write(&zip_path, b"not a zip file").unwrap();
        assert!(get_or_build(&zip_path).is_err());
    }

    #[test]
    fn files_with_basename_is_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let zip_path = dir.path().join("Collection.zip");
        make_zip(&zip_path);
        let idx = get_or_build(&zip_path).unwrap();
        assert_eq!(idx.files_with_basename("1942.cdt"), vec!["Games/1942.cdt"]);
        assert!(idx.files_with_basename("missing.cdt").is_empty());
    }
}

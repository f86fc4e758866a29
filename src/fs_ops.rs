//! The narrow operation surface an external kernel FUSE bridge drives
//! (§4.6). This crate stops at `Facade`: it never speaks the `fuser` or
//! `pyfuse3` protocol itself, it only answers the questions a bridge needs
//! answered — lookup, attributes, directory contents, file I/O — in terms
//! of inode numbers and virtual paths.
//!
//! Grounded on `transfs_pyfuse3.py`'s `TransFS` for the operation shapes
//! (hash-based synthetic inodes, zip-entry materialization via a temp file
//! on `open`) and on `wvffle-fuse-zipfs`'s `Filesystem` impl for the
//! idiomatic Rust side of offset-based reads (`FileExt::read_at`) — without
//! adopting its literal `fuser::Filesystem` trait, which is out of scope
//! here.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tempfile::NamedTempFile;

use crate::caches::{AttrRecord, FsContext};
use crate::config::{Config, ZipMode};
use crate::dir_synth;
use crate::error::{FsError, FsResult};
use crate::source_resolver::{self, ResolvedNode, VirtualKind};
use crate::write_gate;
use crate::zip_index;

/// The inode FUSE reserves for the mountpoint root.
pub const ROOT_INODE: u64 = 1;

/// One entry in a directory snapshot (§4.6's "opendir takes a full
/// snapshot; readdir paginates over it" contract).
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub inode: u64,
    pub attr: AttrRecord,
}

struct DirHandle {
    entries: Vec<DirEntry>,
}

enum OpenFile {
    Real(std::fs::File),
    /// A ZIP entry materialized to a scratch file on `open`; the temp file
    /// is deleted the moment this variant (and its `NamedTempFile`) drops,
    /// which `release` triggers by dropping the handle (§9's "temp file
    /// lifetime equals the file-handle lifetime").
    ZipMaterialized {
        file: std::fs::File,
        _scratch: NamedTempFile,
    },
}

impl OpenFile {
    fn as_file(&self) -> &std::fs::File {
        match self {
            OpenFile::Real(f) => f,
            OpenFile::ZipMaterialized { file, .. } => file,
        }
    }
}

/// Deterministic synthetic inode assignment: `hash(path) & 0x7FFFFFFF`,
/// falling back to a salted rehash on collision with a different path
/// already holding that number (§3, grounded on `transfs_pyfuse3.py`'s
/// `lookup`: `abs(hash(path)) & 0x7FFFFFFF`, retried away from 0 and the
/// root inode).
struct InodeTable {
    path_to_inode: HashMap<String, u64>,
    inode_to_path: HashMap<u64, String>,
}

impl InodeTable {
    fn new() -> Self {
        let mut t = InodeTable {
            path_to_inode: HashMap::new(),
            inode_to_path: HashMap::new(),
        };
        t.path_to_inode.insert(String::new(), ROOT_INODE);
        t.inode_to_path.insert(ROOT_INODE, String::new());
        t
    }

    fn assign(&mut self, path: &str) -> u64 {
        if let Some(existing) = self.path_to_inode.get(path) {
            return *existing;
        }
        let mut salt: u64 = 0;
        let inode = loop {
            let candidate = hash_path(path, salt);
            match self.inode_to_path.get(&candidate) {
                Some(existing_path) if existing_path != path => {
                    salt += 1;
                    continue;
                }
                _ => break candidate,
            }
        };
        self.path_to_inode.insert(path.to_string(), inode);
        self.inode_to_path.insert(inode, path.to_string());
        inode
    }

    fn path_of(&self, inode: u64) -> Option<&str> {
        self.inode_to_path.get(&inode).map(String::as_str)
    }
}

fn hash_path(path: &str, salt: u64) -> u64 {
    use std::collections::hash_map::DefaultHasher;
    let mut hasher = DefaultHasher::new();
    path.hash(&mut hasher);
    salt.hash(&mut hasher);
    let raw = (hasher.finish() as u32 & 0x7FFF_FFFF) as u64;
    if raw == 0 || raw == ROOT_INODE { raw.wrapping_add(2) } else { raw }
}

fn join_virtual(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{parent}/{name}")
    }
}

pub struct Facade {
    config: Arc<Config>,
    ctx: FsContext,
    inodes: Mutex<InodeTable>,
    dir_handles: Mutex<HashMap<u64, DirHandle>>,
    open_files: Mutex<HashMap<u64, OpenFile>>,
    next_dir_handle: Mutex<u64>,
    next_file_handle: Mutex<u64>,
}

impl Facade {
    pub fn new(config: Arc<Config>) -> Self {
        Facade {
            config,
            ctx: FsContext::new(),
            inodes: Mutex::new(InodeTable::new()),
            dir_handles: Mutex::new(HashMap::new()),
            open_files: Mutex::new(HashMap::new()),
            next_dir_handle: Mutex::new(1),
            next_file_handle: Mutex::new(1),
        }
    }

    fn path_for(&self, inode: u64) -> FsResult<String> {
        self.inodes
            .lock()
            .unwrap()
            .path_of(inode)
            .map(str::to_string)
            .ok_or(FsError::NotFound)
    }

    /// §4.6: for a `.zip` real path reached beneath a
    /// `...SoftwareArchives...` folder, the reported mode depends on that
    /// folder's `zip_mode` rather than the archive's own filesystem type —
    /// `hierarchical` presents it as a directory, `file`/`flatten` as a
    /// regular file. Real paths outside any SA folder report their true
    /// filesystem type unchanged.
    fn attr_for_resolved(&self, virtual_path: &str, node: &ResolvedNode) -> FsResult<AttrRecord> {
        match node {
            ResolvedNode::RealPath(real) => {
                let is_zip = real
                    .file_name()
                    .map(|n| n.to_string_lossy().to_lowercase().ends_with(".zip"))
                    .unwrap_or(false);
                let force_kind = if is_zip {
                    source_resolver::sa_zip_mode_at(&self.config, virtual_path).map(|mode| {
                        match mode {
                            ZipMode::Hierarchical => VirtualKind::Directory,
                            ZipMode::File | ZipMode::Flatten => VirtualKind::File,
                        }
                    })
                } else {
                    None
                };
                if force_kind.is_none() {
                    if let Some(cached) = self.ctx.attr_cache.get(real, &self.ctx.dir_cache) {
                        return Ok(cached);
                    }
                }
                let meta = std::fs::symlink_metadata(real)?;
                let record = AttrRecord::from_real_metadata(&meta, force_kind);
                if force_kind.is_none() {
                    self.ctx.attr_cache.put(real.clone(), record, &self.ctx.dir_cache);
                }
                Ok(record)
            }
            ResolvedNode::ZipEntry { zip_path, inner_path } => {
                let idx = zip_index::get_or_build(zip_path)?;
                let archive_mtime = std::fs::metadata(zip_path)
                    .and_then(|m| m.modified())
                    .unwrap_or(std::time::SystemTime::UNIX_EPOCH);
                match idx.getinfo(inner_path) {
                    Some(info) if info.is_dir => Ok(AttrRecord::synthetic_directory()),
                    Some(info) => Ok(AttrRecord::read_only_file(info.size, archive_mtime)),
                    None => Err(FsError::NotFound),
                }
            }
            ResolvedNode::Virtual(VirtualKind::Directory) => Ok(AttrRecord::synthetic_directory()),
            ResolvedNode::Virtual(VirtualKind::File) => {
                Ok(AttrRecord::read_only_file(0, std::time::SystemTime::now()))
            }
            ResolvedNode::NotFound => Err(FsError::NotFound),
        }
    }

    /// §4.6: resolve `name` under the directory at `parent_inode`, assigning
    /// it an inode if this is the first time it's been seen.
    pub fn lookup(&self, parent_inode: u64, name: &str) -> FsResult<(u64, AttrRecord)> {
        let parent_path = self.path_for(parent_inode)?;
        let child_path = join_virtual(&parent_path, name);
        let node = source_resolver::resolve(&self.config, &child_path);
        if node == ResolvedNode::NotFound {
            return Err(FsError::NotFound);
        }
        let attr = self.attr_for_resolved(&child_path, &node)?;
        let inode = self.inodes.lock().unwrap().assign(&child_path);
        Ok((inode, attr))
    }

    pub fn getattr(&self, inode: u64) -> FsResult<AttrRecord> {
        let path = self.path_for(inode)?;
        if inode == ROOT_INODE {
            return Ok(AttrRecord::synthetic_directory());
        }
        let node = source_resolver::resolve(&self.config, &path);
        self.attr_for_resolved(&path, &node)
    }

    /// §4.6: `opendir` snapshots the full listing once; `readdir` paginates
    /// the snapshot by `offset` so entries returned across separate calls
    /// stay consistent even if the backing content changes mid-listing.
    pub fn opendir(&self, inode: u64) -> FsResult<u64> {
        let path = self.path_for(inode)?;
        let names = dir_synth::list_dir(&self.config, &self.ctx.dir_cache, &path)?;
        let mut entries = Vec::with_capacity(names.len());
        for name in names {
            let child_path = join_virtual(&path, &name);
            let node = source_resolver::resolve(&self.config, &child_path);
            let attr = self
                .attr_for_resolved(&child_path, &node)
                .unwrap_or_else(|_| AttrRecord::synthetic_directory());
            let child_inode = self.inodes.lock().unwrap().assign(&child_path);
            entries.push(DirEntry { name, inode: child_inode, attr });
        }

        let handle = {
            let mut next = self.next_dir_handle.lock().unwrap();
            let h = *next;
            *next += 1;
            h
        };
        self.dir_handles.lock().unwrap().insert(handle, DirHandle { entries });
        Ok(handle)
    }

    pub fn readdir(&self, handle: u64, offset: u64) -> FsResult<Vec<DirEntry>> {
        let handles = self.dir_handles.lock().unwrap();
        let dh = handles.get(&handle).ok_or(FsError::InvalidArgument)?;
        let offset = offset as usize;
        if offset >= dh.entries.len() {
            return Ok(Vec::new());
        }
        Ok(dh.entries[offset..].to_vec())
    }

    pub fn releasedir(&self, handle: u64) -> FsResult<()> {
        self.dir_handles.lock().unwrap().remove(&handle);
        Ok(())
    }

    /// Opens an existing node for reading (and, for a real file, writing).
    /// `O_CREAT` on a missing path is the caller's job via [`Self::create`].
    pub fn open(&self, inode: u64, write: bool) -> FsResult<u64> {
        let path = self.path_for(inode)?;
        let node = source_resolver::resolve(&self.config, &path);
        let open_file = match node {
            ResolvedNode::RealPath(real) => {
                let file = std::fs::OpenOptions::new()
                    .read(true)
                    .write(write)
                    .open(&real)?;
                OpenFile::Real(file)
            }
            ResolvedNode::ZipEntry { zip_path, inner_path } => {
                if write {
                    return Err(FsError::ReadOnlyFilesystem);
                }
                let (scratch, file) = extract_to_scratch(&zip_path, &inner_path)?;
                OpenFile::ZipMaterialized { file, _scratch: scratch }
            }
            ResolvedNode::Virtual(_) => return Err(FsError::PermissionDenied),
            ResolvedNode::NotFound => return Err(FsError::NotFound),
        };
        let handle = {
            let mut next = self.next_file_handle.lock().unwrap();
            let h = *next;
            *next += 1;
            h
        };
        self.open_files.lock().unwrap().insert(handle, open_file);
        Ok(handle)
    }

    pub fn read(&self, handle: u64, offset: u64, size: u32) -> FsResult<Vec<u8>> {
        let files = self.open_files.lock().unwrap();
        let of = files.get(&handle).ok_or(FsError::InvalidArgument)?;
        let mut buf = vec![0u8; size as usize];
        let n = read_at_best_effort(of.as_file(), offset, &mut buf)?;
        buf.truncate(n);
        Ok(buf)
    }

    pub fn write(&self, handle: u64, offset: u64, data: &[u8]) -> FsResult<usize> {
        let files = self.open_files.lock().unwrap();
        let of = files.get(&handle).ok_or(FsError::InvalidArgument)?;
        match of {
            OpenFile::Real(file) => {
                file.write_at(data, offset)?;
                Ok(data.len())
            }
            OpenFile::ZipMaterialized { .. } => Err(FsError::ReadOnlyFilesystem),
        }
    }

    pub fn release(&self, handle: u64) -> FsResult<()> {
        self.open_files.lock().unwrap().remove(&handle);
        Ok(())
    }

    pub fn create(&self, parent_inode: u64, name: &str) -> FsResult<(u64, u64, AttrRecord)> {
        let parent_path = self.path_for(parent_inode)?;
        let child_path = join_virtual(&parent_path, name);
        let target = write_gate::resolve_for_write(&self.config, &child_path)?;
        if target.real_path.exists() {
            return Err(FsError::AlreadyExists);
        }
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&target.real_path)?;
        let meta = file.metadata()?;
        let attr = AttrRecord::from_real_metadata(&meta, None);
        let inode = self.inodes.lock().unwrap().assign(&child_path);
        let handle = {
            let mut next = self.next_file_handle.lock().unwrap();
            let h = *next;
            *next += 1;
            h
        };
        self.open_files.lock().unwrap().insert(handle, OpenFile::Real(file));
        Ok((inode, handle, attr))
    }

    pub fn mkdir(&self, parent_inode: u64, name: &str) -> FsResult<(u64, AttrRecord)> {
        let parent_path = self.path_for(parent_inode)?;
        let child_path = join_virtual(&parent_path, name);
        let target = write_gate::resolve_for_write(&self.config, &child_path)?;
        if target.real_path.exists() {
            return Err(FsError::AlreadyExists);
        }
        std::fs::create_dir_all(&target.real_path)?;
        let meta = std::fs::symlink_metadata(&target.real_path)?;
        let attr = AttrRecord::from_real_metadata(&meta, None);
        let inode = self.inodes.lock().unwrap().assign(&child_path);
        Ok((inode, attr))
    }

    pub fn unlink(&self, parent_inode: u64, name: &str) -> FsResult<()> {
        let parent_path = self.path_for(parent_inode)?;
        let child_path = join_virtual(&parent_path, name);
        let node = source_resolver::resolve(&self.config, &child_path);
        match node {
            ResolvedNode::RealPath(real) if real.is_file() => {
                std::fs::remove_file(&real)?;
                Ok(())
            }
            ResolvedNode::RealPath(_) => Err(FsError::InvalidArgument),
            ResolvedNode::ZipEntry { .. } => Err(FsError::ReadOnlyFilesystem),
            ResolvedNode::Virtual(_) => Err(FsError::PermissionDenied),
            ResolvedNode::NotFound => Err(FsError::NotFound),
        }
    }

    /// No node this crate synthesizes carries extended attributes; every
    /// name reported absent via `ENODATA`, mirroring the original's
    /// `raise FUSEError(errno.ENODATA)` (§4.6), distinct from `ENOENT` for a
    /// missing node.
    pub fn getxattr(&self, inode: u64, _name: &str) -> FsResult<Vec<u8>> {
        self.getattr(inode)?;
        Err(FsError::NoAttribute)
    }

    pub fn listxattr(&self, inode: u64) -> FsResult<Vec<String>> {
        self.getattr(inode)?;
        Ok(Vec::new())
    }
}

fn extract_to_scratch(zip_path: &PathBuf, inner_path: &str) -> FsResult<(NamedTempFile, std::fs::File)> {
    let mut archive = zip::ZipArchive::new(std::fs::File::open(zip_path)?)?;
    let mut entry = archive.by_name(inner_path)?;
    let scratch = NamedTempFile::new()?;
    let mut handle = scratch.reopen()?;
    std::io::copy(&mut entry, &mut handle)?;
    use std::io::Seek;
    handle.seek(std::io::SeekFrom::Start(0))?;
    Ok((scratch, handle))
}

fn read_at_best_effort(file: &std::fs::File, offset: u64, buf: &mut [u8]) -> FsResult<usize> {
    let mut total = 0;
    loop {
        match file.read_at(&mut buf[total..], offset + total as u64) {
            Ok(0) => break,
            Ok(n) => {
                total += n;
                if total == buf.len() {
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use tempfile::tempdir;
    use zip::write::{SimpleFileOptions, ZipWriter};

    fn sample_config(filestore: &std::path::Path) -> Config {
        let yaml = format!(
            r#"
mountpoint: /mnt/viewfs
filestore: {fs}
clients:
  - name: MiSTer
    default_target_path: "{{system_name}}/{{maps}}"
    systems:
      - name: BBCMicro
        manufacturer: Acorn
        cananonical_system_name: bbc_micro
        local_base_path: Acorn/BBCMicro
        maps:
          - Saves:
              source_dir: Software/Saves
"#,
            fs = filestore.display()
        );
        Config::from_yaml_str(&yaml).unwrap()
    }

    #[test]
    fn lookup_and_read_round_trip_a_real_file() {
        let root = tempdir().unwrap();
        let saves = root.path().join("Native/Acorn/BBCMicro/Software/Saves");
        std::fs::create_dir_all(&saves).unwrap();
        std::fs::write(saves.join("game.sav"), b"hello-world").unwrap();

        let facade = Facade::new(Arc::new(sample_config(root.path())));
        let (client_inode, _) = facade.lookup(ROOT_INODE, "MiSTer").unwrap();
        let (system_inode, _) = facade.lookup(client_inode, "BBCMicro").unwrap();
        let (saves_inode, _) = facade.lookup(system_inode, "Saves").unwrap();
        let (file_inode, attr) = facade.lookup(saves_inode, "game.sav").unwrap();
        assert_eq!(attr.size, 11);

        let handle = facade.open(file_inode, false).unwrap();
        let data = facade.read(handle, 0, 64).unwrap();
        assert_eq!(data, b"hello-world");
        facade.release(handle).unwrap();
    }

    #[test]
    fn getxattr_is_always_enodata() {
        let root = tempdir().unwrap();
        let saves = root.path().join("Native/Acorn/BBCMicro/Software/Saves");
        std::fs::create_dir_all(&saves).unwrap();
        std::fs::write(saves.join("game.sav"), b"x").unwrap();

        let facade = Facade::new(Arc::new(sample_config(root.path())));
        let (client_inode, _) = facade.lookup(ROOT_INODE, "MiSTer").unwrap();
        let (system_inode, _) = facade.lookup(client_inode, "BBCMicro").unwrap();
        let (saves_inode, _) = facade.lookup(system_inode, "Saves").unwrap();
        let (file_inode, _) = facade.lookup(saves_inode, "game.sav").unwrap();

        assert!(matches!(
            facade.getxattr(file_inode, "user.whatever"),
            Err(FsError::NoAttribute)
        ));
        assert_eq!(facade.listxattr(file_inode).unwrap(), Vec::<String>::new());
    }

    #[test]
    fn reading_a_zip_entry_materializes_a_scratch_file() {
        let root = tempdir().unwrap();
        let tapes = root.path().join("Native/Acorn/BBCMicro/Software/Tapes");
        std::fs::create_dir_all(&tapes).unwrap();
        let zip_path = tapes.join("PACK.zip");
        {
            let file = std::fs::File::create(&zip_path).unwrap();
            let mut zw = ZipWriter::new(file);
            zw.start_file("PACK/Elite.uef", SimpleFileOptions::default()).unwrap();
            zw.write_all(b"elite-bytes").unwrap();
            zw.finish().unwrap();
        }

        let yaml = format!(
            r#"
mountpoint: /mnt/viewfs
filestore: {fs}
clients:
  - name: MiSTer
    default_target_path: "{{system_name}}/{{maps}}"
    systems:
      - name: BBCMicro
        manufacturer: Acorn
        cananonical_system_name: bbc_micro
        local_base_path: Acorn/BBCMicro
        maps:
          - Tape:
              source_filename: Software/Tapes/PACK.zip
              unzip: true
              zip_internal_file: PACK/Elite.uef
"#,
            fs = root.path().display()
        );
        let facade = Facade::new(Arc::new(Config::from_yaml_str(&yaml).unwrap()));
        let (client_inode, _) = facade.lookup(ROOT_INODE, "MiSTer").unwrap();
        let (system_inode, _) = facade.lookup(client_inode, "BBCMicro").unwrap();
        let (tape_inode, attr) = facade.lookup(system_inode, "Tape").unwrap();
        assert_eq!(attr.size, 11);

        let handle = facade.open(tape_inode, false).unwrap();
        let data = facade.read(handle, 0, 64).unwrap();
        assert_eq!(data, b"elite-bytes");
    }
}

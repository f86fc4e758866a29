//! Produces the entry set for a virtual directory listing (§4.3), by
//! merging declared map entries, dynamic `...SoftwareArchives...` content,
//! and passthrough real-filesystem entries.
//!
//! Split per §9's design note into a pure **planner** (`plan`, over
//! `Config` + [`source_resolver::Location`]) and an **executor**
//! (`list_dir`, which drives `scandir`/`ZipIndex`), so the planner half can
//! be exercised without touching a real filesystem.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use log::warn;

use crate::caches::DirCache;
use crate::config::{Config, MapVariant, SoftwareArchivesMap, System, ZipMode, filetype_maps};
use crate::error::{FsError, FsResult};
use crate::path_parser;
use crate::source_resolver::{self, Location, ResolvedNode};
use crate::zip_index;

/// What `list_dir` needs to produce a listing, decided purely from
/// `Config` (the planner half of DirSynthesizer).
enum Plan<'a> {
    Root,
    ClientRoot { client: &'a str },
    SystemRoot { system: &'a System },
    NestedMapChildren { system: &'a System, prefix: Vec<String> },
    RealDir(PathBuf),
    SoftwareArchivesEntry {
        system: &'a System,
        sa: &'a SoftwareArchivesMap,
        folder: String,
        tail: Vec<String>,
    },
    NotADirectory,
}

fn plan<'a>(config: &'a Config, virtual_path: &str) -> Plan<'a> {
    let trimmed = virtual_path.trim_matches('/');
    if let Some(rest) = source_resolver::strip_native_prefix(trimmed) {
        let real = if rest.is_empty() {
            config.native_root()
        } else {
            config.native_root().join(rest)
        };
        return Plan::RealDir(real);
    }

    match source_resolver::locate(config, trimmed) {
        Location::Root => Plan::Root,
        Location::ClientRoot { client } => Plan::ClientRoot { client: &client.name },
        Location::SystemRoot { system, .. } => Plan::SystemRoot { system },
        Location::NestedMapDir { system, remainder } => {
            Plan::NestedMapChildren { system, prefix: remainder }
        }
        Location::SoftwareArchives { system, sa, remainder } => Plan::SoftwareArchivesEntry {
            system,
            sa,
            folder: remainder[0].clone(),
            tail: remainder[1..].to_vec(),
        },
        Location::Map {
            system,
            variant,
            remainder,
            ..
        } => match variant {
            MapVariant::Directory(dm) => {
                let base = config.system_base(system).join(&dm.source_dir);
                Plan::RealDir(source_resolver::join_components(&base, &remainder))
            }
            MapVariant::File(_) => Plan::NotADirectory,
            MapVariant::SoftwareArchives(sa) => {
                if remainder.is_empty() {
                    Plan::SystemRoot { system }
                } else {
                    Plan::SoftwareArchivesEntry {
                        system,
                        sa,
                        folder: remainder[0].clone(),
                        tail: remainder[1..].to_vec(),
                    }
                }
            }
        },
        Location::Unknown => match source_resolver::fallback_real_path(config, trimmed) {
            ResolvedNode::RealPath(p) => Plan::RealDir(p),
            _ => Plan::NotADirectory,
        },
    }
}

fn hide_dotfiles(name: &str) -> bool {
    !name.starts_with('.')
}

/// §6.3: `FLATTEN_ZIPS` is a further gate on `flatten`-mode zip expansion,
/// defaulting to enabled when unset. Any value other than `0`/`false`/`no`
/// (case-insensitive) counts as enabled.
fn flatten_zips_enabled() -> bool {
    match std::env::var("FLATTEN_ZIPS") {
        Ok(v) => !matches!(v.to_lowercase().as_str(), "0" | "false" | "no"),
        Err(_) => true,
    }
}

fn scandir_names(dir: &Path, dir_cache: &DirCache) -> Vec<String> {
    if let Some(cached) = dir_cache.get(dir) {
        return cached;
    }
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut names: Vec<String> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|n| hide_dotfiles(n))
        .collect();
    names.sort();
    dir_cache.put(dir.to_path_buf(), names.clone());
    names
}

/// Top-level map names exposed at a system root: plain map keys and the
/// leading segment of nested (`/`-containing) keys, excluding the literal
/// `...SoftwareArchives...` entry (its virtual folders stand in for it).
fn map_root_names(system: &System) -> Vec<String> {
    let mut names: HashSet<String> = HashSet::new();
    for entry in system.named_maps() {
        let first = entry.name.split('/').next().unwrap_or(&entry.name);
        names.insert(first.to_string());
    }
    names.into_iter().collect()
}

/// The declared virtual folder names under a system's SA entry, in their
/// original declared case (§3's extension-spec keys).
fn sa_folder_names(sa: &SoftwareArchivesMap) -> Vec<String> {
    let mut names: HashSet<String> = HashSet::new();
    for filetype in &sa.filetypes {
        for folder in filetype.keys() {
            names.insert(folder.clone());
        }
    }
    names.into_iter().collect()
}

/// First path segment of each map's backing source, used to exclude
/// already-covered real entries from a system root's passthrough set.
fn excluded_top_segments(system: &System) -> HashSet<String> {
    let mut excluded = HashSet::new();
    for entry in &system.maps {
        let source = match &entry.variant {
            MapVariant::Directory(dm) => dm.source_dir.as_str(),
            MapVariant::File(fm) => fm.source_filename.as_str(),
            MapVariant::SoftwareArchives(sa) => sa.source_dir.as_str(),
        };
        if let Some(first) = source.split('/').next() {
            excluded.insert(first.to_string());
        }
    }
    excluded
}

fn list_system_root(config: &Config, system: &System, dir_cache: &DirCache) -> Vec<String> {
    let mut names: HashSet<String> = HashSet::new();
    names.extend(map_root_names(system));
    if let Some(sa) = system.software_archives() {
        names.extend(sa_folder_names(sa));
    }

    let excluded = excluded_top_segments(system);
    let base = config.system_base(system);
    if base.is_dir() {
        for real in scandir_names(&base, dir_cache) {
            if !excluded.contains(&real) {
                names.insert(real);
            }
        }
    }

    let mut out: Vec<String> = names.into_iter().collect();
    out.sort();
    out
}

fn nested_map_children(system: &System, prefix: &[String]) -> Vec<String> {
    let mut names: HashSet<String> = HashSet::new();
    for entry in &system.maps {
        let parts: Vec<&str> = entry.name.split('/').collect();
        if parts.len() > prefix.len() && parts[..prefix.len()] == prefix.iter().map(String::as_str).collect::<Vec<_>>()[..] {
            names.insert(parts[prefix.len()].to_string());
        }
    }
    let mut out: Vec<String> = names.into_iter().collect();
    out.sort();
    out
}

fn split_ext(name: &str) -> Option<(&str, &str)> {
    let dot = name.rfind('.')?;
    if dot == 0 {
        return None;
    }
    Some((&name[..dot], &name[dot + 1..]))
}

fn rewrite_ext(name: &str, real_ext: &str, reverse_map: &BTreeMap<String, String>) -> Option<String> {
    let (stem, ext) = split_ext(name)?;
    if !ext.eq_ignore_ascii_case(real_ext) {
        return None;
    }
    let virt_ext = reverse_map.get(real_ext).map(String::as_str).unwrap_or(real_ext);
    Some(format!("{stem}.{virt_ext}"))
}

/// An explicit `files:` entry is subject to the same extension rewrite as
/// any other real file in the folder (§4.3.1), falling back to the raw
/// basename when its extension matches none of the folder's `real_ext`s.
fn rewrite_explicit_name(
    name: &str,
    real_exts: &[String],
    reverse_map: &BTreeMap<String, String>,
) -> String {
    for real_ext in real_exts {
        if let Some(renamed) = rewrite_ext(name, real_ext, reverse_map) {
            return renamed;
        }
    }
    name.to_string()
}

/// If `tail` (beneath `folder`'s real-extension subtrees) crosses a `.zip`
/// boundary, returns the archive and the inner path to list within it.
/// Mirrors `source_resolver::resolve_software_archives`'s own boundary
/// check so a listing and a lookup never disagree about where an archive
/// starts (§4.1's shared `find_zip_boundary`). `file` mode keeps archives
/// opaque, so it never reports a boundary here.
fn sa_zip_boundary(
    config: &Config,
    system: &System,
    sa: &SoftwareArchivesMap,
    folder: &str,
    tail: &[String],
) -> Option<(PathBuf, String)> {
    if sa.zip_mode == ZipMode::File || tail.is_empty() {
        return None;
    }
    let (folder_map, _) = filetype_maps(sa);
    let real_exts = folder_map.get(&folder.to_uppercase())?;
    let base = config.system_base(system).join(&sa.source_dir);
    for real_ext in real_exts {
        let candidate = source_resolver::join_components(&base.join(real_ext), tail);
        if let Some(boundary) = path_parser::find_zip_boundary(&candidate) {
            return Some((boundary.zip_real_path, boundary.inner_posix_path));
        }
    }
    None
}

/// §4.3.1: the dynamic directory synthesizer for one `...SoftwareArchives...`
/// virtual folder (`folder`), at `tail` levels beneath its root.
fn list_software_archives_entry(
    config: &Config,
    system: &System,
    sa: &SoftwareArchivesMap,
    folder: &str,
    tail: &[String],
) -> Vec<String> {
    let (folder_map, reverse_map) = filetype_maps(sa);
    let Some(real_exts) = folder_map.get(&folder.to_uppercase()) else {
        return Vec::new();
    };
    let base = config.system_base(system).join(&sa.source_dir);
    let is_root = tail.is_empty();
    let mut names: HashSet<String> = HashSet::new();

    for real_ext in real_exts {
        let dir = source_resolver::join_components(&base.join(real_ext), tail);
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.filter_map(|e| e.ok()) {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !hide_dotfiles(&name) {
                continue;
            }
            let Ok(file_type) = entry.file_type() else {
                continue;
            };
            if file_type.is_dir() {
                names.insert(name);
                continue;
            }
            let is_zip = name.to_lowercase().ends_with(".zip");
            if is_zip {
                match sa.zip_mode {
                    ZipMode::File => {
                        if let Some(renamed) = rewrite_ext(&name, real_ext, &reverse_map) {
                            names.insert(renamed);
                        } else {
                            // `file` mode keeps archives opaque but still
                            // lists them verbatim even when their own
                            // extension isn't a declared real_ext (§4.3.1:
                            // "Listings return directories and files
                            // (including .zip files)").
                            names.insert(name);
                        }
                    }
                    ZipMode::Hierarchical => {
                        names.insert(name);
                    }
                    ZipMode::Flatten if is_root && sa.supports_zip && flatten_zips_enabled() => {
                        match zip_index::get_or_build(&dir.join(&name)) {
                            Ok(idx) => match idx.listdir("") {
                                Ok(children) => {
                                    for child in children {
                                        if let Some(renamed) =
                                            rewrite_ext(&child, real_ext, &reverse_map)
                                        {
                                            names.insert(renamed);
                                        }
                                    }
                                }
                                Err(e) => warn!("listdir on {} failed: {e}", name),
                            },
                            Err(e) => warn!("skipping unreadable archive {name}: {e}"),
                        }
                    }
                    ZipMode::Flatten => {
                        names.insert(name);
                    }
                }
                continue;
            }
            if let Some(renamed) = rewrite_ext(&name, real_ext, &reverse_map) {
                names.insert(renamed);
            }
        }
    }

    if is_root {
        for explicit in &sa.files {
            names.insert(rewrite_explicit_name(explicit, real_exts, &reverse_map));
        }
    }

    let mut out: Vec<String> = names.into_iter().collect();
    out.sort();
    out
}

/// Produces the listing for a virtual directory, applying the zip-handling
/// mode and tolerating unreadable backing sources (§4.3.1's failure
/// policy: a listing never fails wholesale because of one bad component).
pub fn list_dir(config: &Config, dir_cache: &DirCache, virtual_path: &str) -> FsResult<Vec<String>> {
    match plan(config, virtual_path) {
        Plan::Root => {
            let mut names: Vec<String> = vec!["Native".to_string()];
            names.extend(config.clients.iter().map(|c| c.name.clone()));
            names.sort();
            Ok(names)
        }
        Plan::ClientRoot { client } => {
            let Some(client) = config.client(client) else {
                return Err(FsError::NotFound);
            };
            let mut names: Vec<String> = client.systems.iter().map(|s| s.name.clone()).collect();
            names.sort();
            Ok(names)
        }
        Plan::SystemRoot { system } => Ok(list_system_root(config, system, dir_cache)),
        Plan::NestedMapChildren { system, prefix } => Ok(nested_map_children(system, &prefix)),
        Plan::SoftwareArchivesEntry {
            system,
            sa,
            folder,
            tail,
        } => match sa_zip_boundary(config, system, sa, &folder, &tail) {
            Some((zip_path, inner)) => list_zip_dir(&zip_path, &inner),
            None => Ok(list_software_archives_entry(config, system, sa, &folder, &tail)),
        },
        Plan::RealDir(path) => {
            if !path.is_dir() {
                return if path.exists() {
                    Err(FsError::NotFound)
                } else {
                    Ok(Vec::new())
                };
            }
            Ok(scandir_names(&path, dir_cache))
        }
        Plan::NotADirectory => Err(FsError::NotFound),
    }
}

/// Listing for a path already known to resolve inside a ZIP (used by the
/// façade once `SourceResolver` has returned a `ZipEntry` directory).
pub fn list_zip_dir(zip_path: &Path, inner: &str) -> FsResult<Vec<String>> {
    let idx = zip_index::get_or_build(zip_path)?;
    idx.listdir(inner)
}

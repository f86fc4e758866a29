//! Decides what a virtual path maps to (§4.2): a real file or directory, a
//! `(zip_path, inner)` pair, or a synthetic node with no backing file.
//!
//! `resolve` is a pure function of `Config` modulo backing-filesystem state
//! and the `ZipIndex` cache (§3's purity invariant). It shares its
//! path-classification logic with [`crate::write_gate`] via [`locate`], so
//! the two components can never disagree about which map entry a virtual
//! path belongs to.

use std::path::{Path, PathBuf};

use crate::config::{
    Client, Config, DirectoryMap, FileMap, MapVariant, SoftwareArchivesMap, System, ZipMode,
    filetype_maps,
};
use crate::path_parser::{self, ParsedPath};
use crate::zip_index;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VirtualKind {
    Directory,
    File,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedNode {
    RealPath(PathBuf),
    ZipEntry { zip_path: PathBuf, inner_path: String },
    Virtual(VirtualKind),
    NotFound,
}

/// The outcome of classifying a virtual path against `Config` alone, before
/// any existence checks are applied. Shared between [`resolve`] (which
/// existence-checks it) and the write gate (which does not).
pub(crate) enum Location<'a> {
    /// The mountpoint root: `Native` plus one entry per client.
    Root,
    /// A client root: its systems.
    ClientRoot { client: &'a Client },
    /// A system root: declared map names, nested-key leading segments, SA
    /// virtual folders, and uncovered real entries under `local_base_path`.
    SystemRoot { client: &'a Client, system: &'a System },
    /// `remainder` is a strict prefix of a declared nested map key: an
    /// always-present virtual directory one level short of a `Map`.
    NestedMapDir {
        system: &'a System,
        remainder: Vec<String>,
    },
    /// A declared map entry matched; `remainder` is what's left beneath it.
    Map {
        system: &'a System,
        variant: &'a MapVariant,
        map_name: &'a str,
        remainder: Vec<String>,
    },
    /// No declared map matched `remainder[0]` directly, but it names a
    /// folder declared under the system's `...SoftwareArchives...` entry.
    SoftwareArchives {
        system: &'a System,
        sa: &'a SoftwareArchivesMap,
        remainder: Vec<String>,
    },
    Unknown,
}

pub(crate) fn locate<'a>(config: &'a Config, virtual_path: &str) -> Location<'a> {
    let trimmed = virtual_path.trim_start_matches('/');
    match path_parser::parse(config, trimmed) {
        ParsedPath::TopLevel => Location::Root,
        ParsedPath::InClient { client } => match config.client(&client) {
            Some(client) => Location::ClientRoot { client },
            None => Location::Unknown,
        },
        ParsedPath::InSystem { client, system } => {
            let Some(client) = config.client(&client) else {
                return Location::Unknown;
            };
            let Some(system) = client.system(&system) else {
                return Location::Unknown;
            };
            Location::SystemRoot { client, system }
        }
        ParsedPath::InMap {
            client,
            system,
            map_name,
            remainder,
        } => {
            let Some(client) = config.client(&client) else {
                return Location::Unknown;
            };
            let Some(system) = client.system(&system) else {
                return Location::Unknown;
            };
            let Some(entry) = system.map(&map_name) else {
                return Location::Unknown;
            };
            Location::Map {
                system,
                variant: &entry.variant,
                map_name: &entry.name,
                remainder,
            }
        }
        ParsedPath::InSystemUnmapped {
            client,
            system,
            remainder,
        } => {
            let Some(client) = config.client(&client) else {
                return Location::Unknown;
            };
            let Some(system) = client.system(&system) else {
                return Location::Unknown;
            };
            if path_parser::is_nested_map_prefix(system, &remainder) {
                return Location::NestedMapDir { system, remainder };
            }
            if let Some(sa) = system.software_archives() {
                let (folder_map, _) = filetype_maps(sa);
                if let Some(first) = remainder.first() {
                    if folder_map.contains_key(&first.to_uppercase()) {
                        return Location::SoftwareArchives {
                            system,
                            sa,
                            remainder,
                        };
                    }
                }
            }
            Location::Unknown
        }
        ParsedPath::Unknown => Location::Unknown,
    }
}

pub fn resolve(config: &Config, virtual_path: &str) -> ResolvedNode {
    let trimmed = virtual_path.trim_start_matches('/');
    if let Some(rest) = strip_native_prefix(trimmed) {
        return resolve_native(config, rest);
    }

    match locate(config, trimmed) {
        Location::Root
        | Location::ClientRoot { .. }
        | Location::SystemRoot { .. }
        | Location::NestedMapDir { .. } => ResolvedNode::Virtual(VirtualKind::Directory),
        Location::Map {
            system,
            variant,
            map_name,
            remainder,
        } => match variant {
            MapVariant::Directory(dm) => resolve_directory_map(config, system, dm, &remainder),
            MapVariant::File(fm) => resolve_file_map(config, system, fm, map_name, &remainder),
            MapVariant::SoftwareArchives(sa) => {
                resolve_software_archives(config, system, sa, &remainder)
            }
        },
        Location::SoftwareArchives {
            system,
            sa,
            remainder,
        } => resolve_software_archives(config, system, sa, &remainder),
        Location::Unknown => fallback_real_path(config, virtual_path),
    }
}

pub(crate) fn strip_native_prefix(trimmed: &str) -> Option<&str> {
    if trimmed == "Native" {
        Some("")
    } else {
        trimmed.strip_prefix("Native/")
    }
}

/// `Native/...` is a pass-through gateway straight onto `filestore/Native`
/// (§4.3's "Native as pass-through gateway to the raw filestore").
fn resolve_native(config: &Config, rest: &str) -> ResolvedNode {
    let real = if rest.is_empty() {
        config.native_root()
    } else {
        config.native_root().join(rest)
    };
    if real.is_dir() {
        ResolvedNode::RealPath(real)
    } else if real.is_file() {
        ResolvedNode::RealPath(real)
    } else if rest.is_empty() {
        ResolvedNode::Virtual(VirtualKind::Directory)
    } else {
        ResolvedNode::NotFound
    }
}

pub(crate) fn join_components(base: &Path, remainder: &[String]) -> PathBuf {
    let mut out = base.to_path_buf();
    for c in remainder {
        out.push(c);
    }
    out
}

fn resolve_directory_map(
    config: &Config,
    system: &System,
    dm: &DirectoryMap,
    remainder: &[String],
) -> ResolvedNode {
    let base = config.system_base(system).join(&dm.source_dir);
    if remainder.is_empty() && base.exists() {
        return ResolvedNode::RealPath(base);
    }
    let candidate = join_components(&base, remainder);
    if candidate.exists() {
        return ResolvedNode::RealPath(candidate);
    }
    if remainder.is_empty() {
        return ResolvedNode::Virtual(VirtualKind::Directory);
    }
    ResolvedNode::NotFound
}

/// Splits `source_filename` on the first component ending in `.zip`
/// (case-insensitive) that has components after it, i.e. the inline
/// `…zip/inner/…` notation (§4.2).
fn split_inline_zip(path: &str) -> Option<(String, String)> {
    let parts: Vec<&str> = path.split('/').collect();
    for (i, part) in parts.iter().enumerate() {
        if part.to_lowercase().ends_with(".zip") && i + 1 < parts.len() {
            return Some((parts[..=i].join("/"), parts[i + 1..].join("/")));
        }
    }
    None
}

fn is_zip_named(name: &str) -> bool {
    name.to_lowercase().ends_with(".zip")
}

fn zip_entry_if_present(zip_path: &Path, inner: &str) -> ResolvedNode {
    match zip_index::get_or_build(zip_path) {
        Ok(idx) => {
            let inner = inner.trim_matches('/');
            if inner.is_empty() || idx.exists(inner) {
                ResolvedNode::ZipEntry {
                    zip_path: zip_path.to_path_buf(),
                    inner_path: inner.to_string(),
                }
            } else {
                ResolvedNode::NotFound
            }
        }
        Err(_) => ResolvedNode::NotFound,
    }
}

fn resolve_file_map(
    config: &Config,
    system: &System,
    fm: &FileMap,
    map_name: &str,
    remainder: &[String],
) -> ResolvedNode {
    if !remainder.is_empty() {
        // A FileMap names a single leaf; it has no children.
        return ResolvedNode::NotFound;
    }
    let base = config.system_base(system);

    if let Some((zip_rel, inner)) = split_inline_zip(&fm.source_filename) {
        let zip_path = base.join(zip_rel);
        return zip_entry_if_present(&zip_path, &inner);
    }

    if is_zip_named(&fm.source_filename) && fm.effective_unzip() {
        let zip_path = base.join(&fm.source_filename);
        if let Some(inner) = &fm.zip_internal_file {
            return zip_entry_if_present(&zip_path, inner);
        }
        let target_basename = map_name.rsplit('/').next().unwrap_or(map_name);
        return match zip_index::get_or_build(&zip_path) {
            Ok(idx) => match idx.files_with_basename(target_basename).first() {
                Some(inner) => ResolvedNode::ZipEntry {
                    zip_path,
                    inner_path: (*inner).to_string(),
                },
                None => ResolvedNode::NotFound,
            },
            Err(_) => ResolvedNode::NotFound,
        };
    }

    let real = base.join(&fm.source_filename);
    if real.exists() {
        ResolvedNode::RealPath(real)
    } else {
        ResolvedNode::NotFound
    }
}

fn split_ext(name: &str) -> Option<(&str, &str)> {
    let dot = name.rfind('.')?;
    if dot == 0 {
        return None;
    }
    Some((&name[..dot], &name[dot + 1..]))
}

/// §4.2.1: the dynamic resolver for `...SoftwareArchives...` entries.
/// `remainder[0]` is the virtual folder name; the rest is the path beneath
/// it (reshaped real-extension content).
fn resolve_software_archives(
    config: &Config,
    system: &System,
    sa: &SoftwareArchivesMap,
    remainder: &[String],
) -> ResolvedNode {
    let Some(folder) = remainder.first() else {
        return ResolvedNode::Virtual(VirtualKind::Directory);
    };
    let (folder_map, reverse_map) = filetype_maps(sa);
    let Some(real_exts) = folder_map.get(&folder.to_uppercase()) else {
        return ResolvedNode::NotFound;
    };
    if remainder.len() == 1 {
        return ResolvedNode::Virtual(VirtualKind::Directory);
    }
    let tail = &remainder[1..];
    let base = config.system_base(system).join(&sa.source_dir);

    // A zip boundary anywhere in `tail` takes priority over the extension
    // rewrite below: `file` mode keeps archives opaque (no descending past
    // the archive itself), `hierarchical`/`flatten` treat them as browsable
    // directories at any depth (§4.3.1: flatten's non-root behavior is
    // identical to hierarchical).
    for real_ext in real_exts {
        let candidate = join_components(&base.join(real_ext), tail);
        if let Some(boundary) = path_parser::find_zip_boundary(&candidate) {
            if sa.zip_mode == ZipMode::File {
                return if boundary.inner_posix_path.is_empty() {
                    ResolvedNode::RealPath(boundary.zip_real_path)
                } else {
                    ResolvedNode::NotFound
                };
            }
            return zip_entry_if_present(&boundary.zip_real_path, &boundary.inner_posix_path);
        }
    }

    let last = tail.last().unwrap();

    let Some((stem, virt_ext)) = split_ext(last) else {
        // Directory-shaped remainder: find the first real_ext subtree that
        // actually contains it.
        for real_ext in real_exts {
            let candidate = join_components(&base.join(real_ext), tail);
            if candidate.is_dir() {
                return ResolvedNode::RealPath(candidate);
            }
        }
        return ResolvedNode::Virtual(VirtualKind::Directory);
    };

    let parent_tail = &tail[..tail.len() - 1];
    for real_ext in real_exts {
        let declared_virt_ext = reverse_map.get(real_ext).unwrap_or(real_ext);
        if !virt_ext.eq_ignore_ascii_case(declared_virt_ext) {
            continue;
        }
        let real_name = format!("{stem}.{real_ext}");
        let candidate = join_components(&base.join(real_ext), parent_tail).join(&real_name);
        if candidate.is_file() {
            return ResolvedNode::RealPath(candidate);
        }
    }

    if sa.supports_zip {
        for real_ext in real_exts {
            let declared_virt_ext = reverse_map.get(real_ext).unwrap_or(real_ext);
            if !virt_ext.eq_ignore_ascii_case(declared_virt_ext) {
                continue;
            }
            let real_name = format!("{stem}.{real_ext}");
            let parent_dir = join_components(&base.join(real_ext), parent_tail);
            if let Some(hit) = scan_sibling_zips(&parent_dir, &real_name) {
                return hit;
            }
        }
    }

    ResolvedNode::NotFound
}

fn scan_sibling_zips(parent_dir: &Path, basename: &str) -> Option<ResolvedNode> {
    let entries = std::fs::read_dir(parent_dir).ok()?;
    let mut zip_paths: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("zip")))
        .collect();
    zip_paths.sort();
    for zip_path in zip_paths {
        if let Ok(idx) = zip_index::get_or_build(&zip_path) {
            if let Some(inner) = idx.files_with_basename(basename).first() {
                return Some(ResolvedNode::ZipEntry {
                    zip_path,
                    inner_path: (*inner).to_string(),
                });
            }
        }
    }
    None
}

/// The `zip_mode` governing `virtual_path`, if it names a location beneath
/// a `...SoftwareArchives...` entry — used by the façade (§4.6) to decide
/// whether a `.zip` real path should be reported as a directory
/// (`hierarchical`) or a regular file (`file`/`flatten`).
pub fn sa_zip_mode_at(config: &Config, virtual_path: &str) -> Option<ZipMode> {
    let trimmed = virtual_path.trim_start_matches('/');
    if strip_native_prefix(trimmed).is_some() {
        return None;
    }
    match locate(config, trimmed) {
        Location::Map {
            variant: MapVariant::SoftwareArchives(sa),
            ..
        } => Some(sa.zip_mode),
        Location::SoftwareArchives { sa, .. } => Some(sa.zip_mode),
        _ => None,
    }
}

/// §4.2 step 4: no declared map matched at all; fall back to a direct real
/// path under the system's `local_base_path`.
pub(crate) fn fallback_real_path(config: &Config, virtual_path: &str) -> ResolvedNode {
    let trimmed = virtual_path.trim_start_matches('/');
    let parts: Vec<&str> = trimmed.split('/').filter(|p| !p.is_empty()).collect();
    let [client_name, system_name, rest @ ..] = parts.as_slice() else {
        return ResolvedNode::NotFound;
    };
    let Some(client) = config.client(client_name) else {
        return ResolvedNode::NotFound;
    };
    let Some(system) = client.system(system_name) else {
        return ResolvedNode::NotFound;
    };
    let candidate = join_components(
        &config.system_base(system),
        &rest.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
    );
    if candidate.exists() {
        ResolvedNode::RealPath(candidate)
    } else {
        ResolvedNode::NotFound
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;
    use zip::write::{SimpleFileOptions, ZipWriter};

    fn sample_config(filestore: &Path) -> Config {
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
          - Tape:
              source_filename: Software/Tapes/PACK.zip
              unzip: true
              zip_internal_file: PACK/Elite.uef
          - MMBs/beeb1_mmb.VHD:
              source_filename: HDs/beeb1.mmb
          - "...SoftwareArchives...":
              source_dir: Software
              filetypes:
                - HDs: "MMB:VHD,VHD"
              zip_mode: file
"#,
            fs = filestore.display()
        );
        Config::from_yaml_str(&yaml).unwrap()
    }

    #[test]
    fn directory_map_resolves_real_subpath() {
        let root = tempdir().unwrap();
        let saves = root
            .path()
            .join("Native/Acorn/BBCMicro/Software/Saves");
        std::fs::create_dir_all(&saves).unwrap();
        std::fs::write(saves.join("game.sav"), b"data").unwrap();

        let cfg = sample_config(root.path());
        let node = resolve(&cfg, "MiSTer/BBCMicro/Saves/game.sav");
        assert_eq!(node, ResolvedNode::RealPath(saves.join("game.sav")));

        let missing = resolve(&cfg, "MiSTer/BBCMicro/Saves/missing.sav");
        assert_eq!(missing, ResolvedNode::NotFound);
    }

    #[test]
    fn nested_map_key_intermediate_is_virtual_directory() {
        let root = tempdir().unwrap();
        let hd_dir = root.path().join("Native/Acorn/BBCMicro/HDs");
        std::fs::create_dir_all(&hd_dir).unwrap();
        std::fs::write(hd_dir.join("beeb1.mmb"), b"disk").unwrap();

        let cfg = sample_config(root.path());
        assert_eq!(
            resolve(&cfg, "MiSTer/BBCMicro/MMBs"),
            ResolvedNode::Virtual(VirtualKind::Directory)
        );
        assert_eq!(
            resolve(&cfg, "MiSTer/BBCMicro/MMBs/beeb1_mmb.VHD"),
            ResolvedNode::RealPath(hd_dir.join("beeb1.mmb"))
        );
    }

    #[test]
    fn filemap_explicit_zip_internal_file() {
        let root = tempdir().unwrap();
        let tapes = root.path().join("Native/Acorn/BBCMicro/Software/Tapes");
        std::fs::create_dir_all(&tapes).unwrap();
        let zip_path = tapes.join("PACK.zip");
        {
            let file = std::fs::File::create(&zip_path).unwrap();
            let mut zw = ZipWriter::new(file);
            zw.start_file("PACK/Elite.uef", SimpleFileOptions::default())
                .unwrap();
            zw.write_all(b"elite-bytes").unwrap();
            zw.finish().unwrap();
        }

        let cfg = sample_config(root.path());
        let node = resolve(&cfg, "MiSTer/BBCMicro/Tape");
        assert_eq!(
            node,
            ResolvedNode::ZipEntry {
                zip_path,
                inner_path: "PACK/Elite.uef".to_string(),
            }
        );
    }

    #[test]
    fn software_archives_extension_rewrite() {
        let root = tempdir().unwrap();
        let mmb_dir = root.path().join("Native/Acorn/BBCMicro/Software/MMB");
        std::fs::create_dir_all(&mmb_dir).unwrap();
        std::fs::write(mmb_dir.join("GAMES.MMB"), vec![0u8; 10_485_760]).unwrap();

        let cfg = sample_config(root.path());
        let node = resolve(&cfg, "MiSTer/BBCMicro/HDs/GAMES.VHD");
        assert_eq!(node, ResolvedNode::RealPath(mmb_dir.join("GAMES.MMB")));
    }

    #[test]
    fn native_passthrough_reaches_filestore_directly() {
        let root = tempdir().unwrap();
        let deep = root.path().join("Native/Acorn/BBCMicro/Software/Saves");
        std::fs::create_dir_all(&deep).unwrap();
        std::fs::write(deep.join("x.sav"), b"y").unwrap();

        let cfg = sample_config(root.path());
        let node = resolve(&cfg, "Native/Acorn/BBCMicro/Software/Saves/x.sav");
        assert_eq!(node, ResolvedNode::RealPath(deep.join("x.sav")));
    }

    #[test]
    fn software_archives_descends_into_nested_archive() {
        let root = tempdir().unwrap();
        let cdt_dir = root.path().join("Native/Acorn/BBCMicro/Software/CDT");
        std::fs::create_dir_all(&cdt_dir).unwrap();
        let zip_path = cdt_dir.join("Collection.zip");
        {
            let file = std::fs::File::create(&zip_path).unwrap();
            let mut zw = ZipWriter::new(file);
            zw.start_file("Games/1942.cdt", SimpleFileOptions::default())
                .unwrap();
            zw.write_all(b"cdt-bytes").unwrap();
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
          - "...SoftwareArchives...":
              source_dir: Software
              filetypes:
                - CDT: "CDT"
              zip_mode: hierarchical
"#,
            fs = root.path().display()
        );
        let cfg = Config::from_yaml_str(&yaml).unwrap();

        assert_eq!(
            resolve(&cfg, "MiSTer/BBCMicro/CDT/Collection.zip"),
            ResolvedNode::ZipEntry {
                zip_path: zip_path.clone(),
                inner_path: String::new(),
            }
        );
        assert_eq!(
            resolve(&cfg, "MiSTer/BBCMicro/CDT/Collection.zip/Games/1942.cdt"),
            ResolvedNode::ZipEntry {
                zip_path,
                inner_path: "Games/1942.cdt".to_string(),
            }
        );
    }

    #[test]
    fn unknown_client_and_system_are_not_found() {
        let root = tempdir().unwrap();
        let cfg = sample_config(root.path());
        assert_eq!(resolve(&cfg, "NoSuchClient"), ResolvedNode::NotFound);
        assert_eq!(
            resolve(&cfg, "MiSTer/NoSuchSystem"),
            ResolvedNode::NotFound
        );
    }
}

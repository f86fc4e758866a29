//! Resolves a virtual path to a writable real target (§4.7), or rejects the
//! write outright. Shares [`source_resolver::locate`]'s classification so a
//! write can never land somewhere a read would disagree about, but — unlike
//! `resolve` — never existence-checks the target: callers (`create`,
//! `open` with `O_CREAT`, `mkdir`) are responsible for deciding whether the
//! target already being present is an error.

use std::path::{Path, PathBuf};

use crate::config::{Config, FileMap, MapVariant, SoftwareArchivesMap, System, filetype_maps};
use crate::error::{FsError, FsResult};
use crate::path_parser;
use crate::source_resolver::{self, Location};

/// A real path a write may land on, plus whether its parent directories
/// still need to be created before the write itself proceeds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteTarget {
    pub real_path: PathBuf,
}

fn split_ext(name: &str) -> Option<(&str, &str)> {
    let dot = name.rfind('.')?;
    if dot == 0 {
        return None;
    }
    Some((&name[..dot], &name[dot + 1..]))
}

/// Resolves `virtual_path` to a real path a caller may create or open for
/// writing, creating any missing intermediate directories along the way.
/// Rejects with `ReadOnlyFilesystem` whenever the target would land inside
/// a ZIP archive (§4.7's "never lands inside a ZIP" invariant).
pub fn resolve_for_write(config: &Config, virtual_path: &str) -> FsResult<WriteTarget> {
    let trimmed = virtual_path.trim_start_matches('/');
    if let Some(rest) = source_resolver::strip_native_prefix(trimmed) {
        let real = if rest.is_empty() {
            config.native_root()
        } else {
            config.native_root().join(rest)
        };
        return finish(real);
    }

    match source_resolver::locate(config, trimmed) {
        Location::Root | Location::ClientRoot { .. } | Location::SystemRoot { .. } => {
            Err(FsError::PermissionDenied)
        }
        Location::NestedMapDir { .. } => Err(FsError::PermissionDenied),
        Location::Map {
            system,
            variant,
            remainder,
            ..
        } => match variant {
            MapVariant::Directory(dm) => {
                let base = config.system_base(system).join(&dm.source_dir);
                finish(source_resolver::join_components(&base, &remainder))
            }
            MapVariant::File(fm) => write_target_for_file_map(config, system, fm),
            MapVariant::SoftwareArchives(sa) => {
                write_target_for_software_archives(config, system, sa, &remainder)
            }
        },
        Location::SoftwareArchives { system, sa, remainder } => {
            write_target_for_software_archives(config, system, sa, &remainder)
        }
        Location::Unknown => {
            let parts: Vec<&str> = trimmed.split('/').filter(|p| !p.is_empty()).collect();
            let [client_name, system_name, rest @ ..] = parts.as_slice() else {
                return Err(FsError::PermissionDenied);
            };
            let Some(client) = config.client(client_name) else {
                return Err(FsError::PermissionDenied);
            };
            let Some(system) = client.system(system_name) else {
                return Err(FsError::PermissionDenied);
            };
            let candidate = source_resolver::join_components(
                &config.system_base(system),
                &rest.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
            );
            finish(candidate)
        }
    }
}

fn write_target_for_file_map(config: &Config, system: &System, fm: &FileMap) -> FsResult<WriteTarget> {
    if fm.effective_unzip() || fm.source_filename.to_lowercase().ends_with(".zip") {
        // The declared target lives inside (or is) an archive; archives are
        // never write targets.
        return Err(FsError::ReadOnlyFilesystem);
    }
    let real = config.system_base(system).join(&fm.source_filename);
    finish(real)
}

/// §4.7: a write under a `...SoftwareArchives...` folder always lands in the
/// first declared `real_ext` for that folder (declaration order), with the
/// virtual extension rewritten back to the real one.
fn write_target_for_software_archives(
    config: &Config,
    system: &System,
    sa: &SoftwareArchivesMap,
    remainder: &[String],
) -> FsResult<WriteTarget> {
    let Some(folder) = remainder.first() else {
        return Err(FsError::PermissionDenied);
    };
    let (folder_map, _reverse_map) = filetype_maps(sa);
    let Some(real_exts) = folder_map.get(&folder.to_uppercase()) else {
        return Err(FsError::PermissionDenied);
    };
    let Some(real_ext) = real_exts.first() else {
        return Err(FsError::PermissionDenied);
    };
    if remainder.len() < 2 {
        return Err(FsError::PermissionDenied);
    }
    let tail = &remainder[1..];
    let base = config.system_base(system).join(&sa.source_dir);

    // A write descending into an already-existing archive is rejected
    // outright rather than silently writing alongside it.
    let probe = source_resolver::join_components(&base.join(real_ext), tail);
    if path_parser::find_zip_boundary(&probe).is_some() {
        return Err(FsError::ReadOnlyFilesystem);
    }

    let parent_tail = &tail[..tail.len() - 1];
    let last = &tail[tail.len() - 1];
    let real_name = match split_ext(last) {
        Some((stem, _virt_ext)) => format!("{stem}.{real_ext}"),
        None => last.clone(),
    };
    let dir = source_resolver::join_components(&base.join(real_ext), parent_tail);
    finish(dir.join(real_name))
}

fn finish(real_path: PathBuf) -> FsResult<WriteTarget> {
    if let Some(parent) = real_path.parent() {
        create_parent_dirs(parent)?;
    }
    Ok(WriteTarget { real_path })
}

fn create_parent_dirs(dir: &Path) -> FsResult<()> {
    if dir.is_dir() {
        return Ok(());
    }
    std::fs::create_dir_all(dir)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

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
          - "...SoftwareArchives...":
              source_dir: Software
              filetypes:
                - HDs: "MMB:VHD,VHD"
              zip_mode: hierarchical
"#,
            fs = filestore.display()
        );
        Config::from_yaml_str(&yaml).unwrap()
    }

    #[test]
    fn directory_map_creates_parent_and_resolves() {
        let root = tempdir().unwrap();
        let cfg = sample_config(root.path());
        let target = resolve_for_write(&cfg, "MiSTer/BBCMicro/Saves/new.sav").unwrap();
        assert_eq!(
            target.real_path,
            root.path().join("Native/Acorn/BBCMicro/Software/Saves/new.sav")
        );
        assert!(target.real_path.parent().unwrap().is_dir());
    }

    #[test]
    fn file_map_inside_zip_is_read_only() {
        let root = tempdir().unwrap();
        let cfg = sample_config(root.path());
        assert!(matches!(
            resolve_for_write(&cfg, "MiSTer/BBCMicro/Tape"),
            Err(FsError::ReadOnlyFilesystem)
        ));
    }

    #[test]
    fn software_archives_write_picks_first_real_ext() {
        let root = tempdir().unwrap();
        let cfg = sample_config(root.path());
        let target = resolve_for_write(&cfg, "MiSTer/BBCMicro/HDs/GAMES.VHD").unwrap();
        assert_eq!(
            target.real_path,
            root.path().join("Native/Acorn/BBCMicro/Software/MMB/GAMES.MMB")
        );
    }

    #[test]
    fn system_root_is_not_writable() {
        let root = tempdir().unwrap();
        let cfg = sample_config(root.path());
        assert!(matches!(
            resolve_for_write(&cfg, "MiSTer/BBCMicro"),
            Err(FsError::PermissionDenied)
        ));
    }
}

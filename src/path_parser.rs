//! Pure classification of a virtual path against a [`Config`], with no
//! backing-store I/O except the single `.zip`-boundary probe described in
//! §4.1 (a regular-file existence check is unavoidable there).

use std::path::{Path, PathBuf};

use crate::config::{Client, Config, MapEntry, System};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedPath {
    TopLevel,
    InClient {
        client: String,
    },
    InSystem {
        client: String,
        system: String,
    },
    InMap {
        client: String,
        system: String,
        map_name: String,
        remainder: Vec<String>,
    },
    /// `rest` matched no declared map key by longest-prefix, but the system
    /// was resolved. Callers decide whether `rest` is a directory implied by
    /// a nested map key, a `...SoftwareArchives...` virtual folder, or truly
    /// unknown (§4.2 step 2 onward; §4.3's nested-key directory duty).
    InSystemUnmapped {
        client: String,
        system: String,
        remainder: Vec<String>,
    },
    Unknown,
}

/// Information about a `.zip` boundary crossed while walking a virtual path,
/// found by probing candidate real paths on the backing filesystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZipBoundary {
    pub zip_real_path: PathBuf,
    pub inner_posix_path: String,
}

fn components_of(path: &str) -> Vec<String> {
    path.split('/')
        .filter(|c| !c.is_empty() && *c != ".")
        .map(str::to_owned)
        .collect()
}

/// Splits an absolute virtual path (relative to `mountpoint`, i.e. already
/// stripped of any mount prefix by the caller) into client/system/map
/// components.
pub fn parse(config: &Config, virtual_path: &str) -> ParsedPath {
    let parts = components_of(virtual_path);
    let Some(client_name) = parts.first() else {
        return ParsedPath::TopLevel;
    };
    let Some(client) = config.client(client_name) else {
        return ParsedPath::Unknown;
    };
    let Some(system_name) = parts.get(1) else {
        return ParsedPath::InClient {
            client: client.name.clone(),
        };
    };
    let Some(system) = client.system(system_name) else {
        return ParsedPath::Unknown;
    };
    let rest = &parts[2..];
    if rest.is_empty() {
        return ParsedPath::InSystem {
            client: client.name.clone(),
            system: system.name.clone(),
        };
    }
    match longest_prefix_map(system, rest) {
        Some((map_name, remainder)) => ParsedPath::InMap {
            client: client.name.clone(),
            system: system.name.clone(),
            map_name,
            remainder,
        },
        None => ParsedPath::InSystemUnmapped {
            client: client.name.clone(),
            system: system.name.clone(),
            remainder: rest.to_vec(),
        },
    }
}

/// True if `rest` is a strict, proper prefix of some declared map key's
/// components (e.g. `rest = ["MMBs"]` against a key `MMBs/beeb1_mmb.VHD`).
/// Used to recognize the intermediate directories a nested map key implies
/// (§3: "Nested keys must be exposed as virtual directories at each
/// intermediate segment").
pub fn is_nested_map_prefix(system: &System, rest: &[String]) -> bool {
    system.maps.iter().any(|entry| {
        let key_parts = components_of(&entry.name);
        key_parts.len() > rest.len() && key_parts[..rest.len()] == *rest
    })
}

/// Finds the declared [`MapEntry`] whose (possibly `/`-separated) name is the
/// longest prefix of `rest`, per §4.1's longest-prefix-match requirement for
/// nested map keys.
fn longest_prefix_map(system: &System, rest: &[String]) -> Option<(String, Vec<String>)> {
    let mut best: Option<(&MapEntry, usize)> = None;
    for entry in &system.maps {
        let key_parts = components_of(&entry.name);
        if key_parts.is_empty() || key_parts.len() > rest.len() {
            continue;
        }
        if key_parts == rest[..key_parts.len()] {
            let better = match best {
                Some((_, len)) => key_parts.len() > len,
                None => true,
            };
            if better {
                best = Some((entry, key_parts.len()));
            }
        }
    }
    best.map(|(entry, len)| (entry.name.clone(), rest[len..].to_vec()))
}

/// Searches leftward through the components of `candidate_real_path` for the
/// first segment whose on-disk analogue is a regular file named `*.zip`
/// (case-insensitive) while the same-named real directory does not exist.
/// Returns the split point if found.
pub fn find_zip_boundary(candidate_real_path: &Path) -> Option<ZipBoundary> {
    let mut probe = PathBuf::new();
    let mut components = candidate_real_path.components();
    while let Some(component) = components.next() {
        probe.push(component);
        let name = match probe.file_name() {
            Some(n) => n.to_string_lossy(),
            None => continue,
        };
        if !name.to_lowercase().ends_with(".zip") {
            continue;
        }
        let is_file = std::fs::symlink_metadata(&probe)
            .map(|m| m.is_file())
            .unwrap_or(false);
        if !is_file {
            continue;
        }
        let remaining: Vec<String> = components
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        return Some(ZipBoundary {
            zip_real_path: probe,
            inner_posix_path: remaining.join("/"),
        });
    }
    None
}

pub fn client_names(config: &Config) -> Vec<&str> {
    config.clients.iter().map(|c: &Client| c.name.as_str()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    const SAMPLE: &str = r#"
mountpoint: /mnt/viewfs
filestore: /mnt/filestorefs
clients:
  - name: MiSTer
    default_target_path: "{system_name}/{maps}"
    systems:
      - name: BBCMicro
        manufacturer: Acorn
        cananonical_system_name: bbc_micro
        local_base_path: Acorn/BBCMicro
        maps:
          - Saves:
              source_dir: Software/Saves
          - MMBs/beeb1_mmb.VHD:
              source_filename: HDs/beeb1.mmb
"#;

    fn config() -> Config {
        Config::from_yaml_str(SAMPLE).unwrap()
    }

    #[test]
    fn classifies_each_level() {
        let cfg = config();
        assert_eq!(parse(&cfg, ""), ParsedPath::TopLevel);
        assert_eq!(
            parse(&cfg, "MiSTer"),
            ParsedPath::InClient { client: "MiSTer".into() }
        );
        assert_eq!(
            parse(&cfg, "MiSTer/BBCMicro"),
            ParsedPath::InSystem {
                client: "MiSTer".into(),
                system: "BBCMicro".into(),
            }
        );
        assert_eq!(parse(&cfg, "NoSuchClient"), ParsedPath::Unknown);
        assert_eq!(parse(&cfg, "MiSTer/NoSuchSystem"), ParsedPath::Unknown);
    }

    #[test]
    fn nested_map_key_longest_prefix_wins() {
        let cfg = config();
        let parsed = parse(&cfg, "MiSTer/BBCMicro/MMBs/beeb1_mmb.VHD");
        match parsed {
            ParsedPath::InMap { map_name, remainder, .. } => {
                assert_eq!(map_name, "MMBs/beeb1_mmb.VHD");
                assert!(remainder.is_empty());
            }
            other => panic!("expected InMap, got {other:?}"),
        }

        let parsed = parse(&cfg, "MiSTer/BBCMicro/Saves/foo.ssd");
        match parsed {
            ParsedPath::InMap { map_name, remainder, .. } => {
                assert_eq!(map_name, "Saves");
                assert_eq!(remainder, vec!["foo.ssd".to_string()]);
            }
            other => panic!("expected InMap, got {other:?}"),
        }
    }
}

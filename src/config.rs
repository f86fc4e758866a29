//! Immutable typed view of the configuration document every other component
//! reads from. The canonical text form is YAML; parsing a full multi-file,
//! hot-reloading configuration tree is an external concern (a control-plane
//! reader), so this module only owns the shape and a single-document parse.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

pub const SOFTWARE_ARCHIVES_KEY: &str = "...SoftwareArchives...";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub mountpoint: PathBuf,
    #[serde(rename = "filestore")]
    pub filestore_root: PathBuf,
    #[serde(default)]
    pub clients: Vec<Client>,

    // Consumed only by the external control service; retained so a full
    // document round-trips without data loss, never inspected by the core.
    #[serde(default)]
    pub ssl_ignore_hosts: serde_yaml::Value,
    #[serde(default)]
    pub web_api: serde_yaml::Value,
    #[serde(default)]
    pub archive_sources: serde_yaml::Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Client {
    pub name: String,
    pub default_target_path: String,
    #[serde(default)]
    pub systems: Vec<System>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct System {
    pub name: String,
    pub manufacturer: String,
    #[serde(rename = "cananonical_system_name")]
    pub canonical_name: String,
    pub local_base_path: String,
    #[serde(default)]
    pub maps: Vec<MapEntry>,
}

#[derive(Debug, Clone)]
pub struct MapEntry {
    /// The virtual name this entry is declared under. May contain `/` to
    /// declare a nested map (e.g. `MMBs/beeb1_mmb.VHD`).
    pub name: String,
    pub variant: MapVariant,
}

#[derive(Debug, Clone)]
pub enum MapVariant {
    Directory(DirectoryMap),
    File(FileMap),
    SoftwareArchives(SoftwareArchivesMap),
}

#[derive(Debug, Clone, Deserialize)]
pub struct DirectoryMap {
    pub source_dir: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FileMap {
    pub source_filename: String,
    #[serde(default)]
    pub unzip: bool,
    #[serde(default)]
    pub zip_internal_file: Option<String>,
}

impl FileMap {
    /// §9 open question: presence of `zip_internal_file` is sufficient to
    /// imply `unzip = true`, regardless of the declared flag.
    pub fn effective_unzip(&self) -> bool {
        self.unzip || self.zip_internal_file.is_some()
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ZipMode {
    #[default]
    Hierarchical,
    File,
    Flatten,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SoftwareArchivesMap {
    pub source_dir: String,
    #[serde(default)]
    pub filetypes: Vec<BTreeMap<String, String>>,
    #[serde(default = "default_true")]
    pub supports_zip: bool,
    #[serde(default)]
    pub zip_mode: ZipMode,
    #[serde(default)]
    pub files: Vec<String>,
}

impl<'de> Deserialize<'de> for MapEntry {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw: BTreeMap<String, serde_yaml::Value> = BTreeMap::deserialize(deserializer)?;
        let mut iter = raw.into_iter();
        let (name, value) = iter
            .next()
            .ok_or_else(|| serde::de::Error::custom("map entry has no key"))?;
        if iter.next().is_some() {
            return Err(serde::de::Error::custom(format!(
                "map entry {name} has more than one key"
            )));
        }
        let variant = MapVariant::from_value(&name, value).map_err(serde::de::Error::custom)?;
        Ok(MapEntry { name, variant })
    }
}

impl MapVariant {
    fn from_value(name: &str, value: serde_yaml::Value) -> Result<Self, String> {
        if name == SOFTWARE_ARCHIVES_KEY {
            let sa: SoftwareArchivesMap = serde_yaml::from_value(value)
                .map_err(|e| format!("invalid {SOFTWARE_ARCHIVES_KEY} entry: {e}"))?;
            return Ok(MapVariant::SoftwareArchives(sa));
        }
        let has_key = |k: &str| value.as_mapping().is_some_and(|m| m.contains_key(k));
        if has_key("source_filename") {
            let fm: FileMap = serde_yaml::from_value(value)
                .map_err(|e| format!("invalid map entry {name}: {e}"))?;
            Ok(MapVariant::File(fm))
        } else if has_key("source_dir") {
            let dm: DirectoryMap = serde_yaml::from_value(value)
                .map_err(|e| format!("invalid map entry {name}: {e}"))?;
            Ok(MapVariant::Directory(dm))
        } else {
            Err(format!(
                "map entry {name} has neither source_dir nor source_filename"
            ))
        }
    }
}

#[derive(Debug)]
pub struct ConfigError(String);

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "viewfs: config error: {}", self.0)
    }
}
impl std::error::Error for ConfigError {}

impl Config {
    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(text).map_err(|e| ConfigError(e.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError(format!("reading {}: {e}", path.display())))?;
        Self::from_yaml_str(&text)
    }

    /// `filestore_root/Native`, the root of per-system content.
    pub fn native_root(&self) -> PathBuf {
        self.filestore_root.join("Native")
    }

    pub fn system_base(&self, system: &System) -> PathBuf {
        self.native_root().join(&system.local_base_path)
    }

    pub fn client(&self, name: &str) -> Option<&Client> {
        self.clients.iter().find(|c| c.name == name)
    }
}

impl Client {
    pub fn system(&self, name: &str) -> Option<&System> {
        self.systems.iter().find(|s| s.name == name)
    }
}

impl System {
    pub fn software_archives(&self) -> Option<&SoftwareArchivesMap> {
        self.maps.iter().find_map(|m| match &m.variant {
            MapVariant::SoftwareArchives(sa) => Some(sa),
            _ => None,
        })
    }

    pub fn map(&self, name: &str) -> Option<&MapEntry> {
        self.maps.iter().find(|m| m.name == name)
    }

    /// Declared maps other than the `...SoftwareArchives...` entry, in
    /// declaration order (used by the system-root listing, §4.3).
    pub fn named_maps(&self) -> impl Iterator<Item = &MapEntry> {
        self.maps
            .iter()
            .filter(|m| m.name != SOFTWARE_ARCHIVES_KEY)
    }
}

/// Parsed form of a `filetypes` extension-spec: comma-separated tokens that
/// are either a bare extension (`VHD`) or a `REAL:VIRTUAL` rewrite rule.
///
/// Returns `(virtual_folder -> [real_ext, ...], real_ext -> virt_ext)`. Only
/// colon-form entries populate the reverse map; bare-token entries pass the
/// extension through unchanged.
pub fn filetype_maps(
    sa: &SoftwareArchivesMap,
) -> (BTreeMap<String, Vec<String>>, BTreeMap<String, String>) {
    let mut mapping: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut reverse: BTreeMap<String, String> = BTreeMap::new();
    for filetype in &sa.filetypes {
        for (virtual_folder, exts) in filetype {
            let folder = virtual_folder.to_uppercase();
            let entry = mapping.entry(folder).or_default();
            for raw in exts.split(',') {
                let tok = raw.trim();
                if tok.is_empty() {
                    continue;
                }
                if let Some((real_ext, virt_ext)) = tok.split_once(':') {
                    let real_ext = real_ext.trim().to_uppercase();
                    reverse.insert(real_ext.clone(), virt_ext.trim().to_uppercase());
                    entry.push(real_ext);
                } else {
                    entry.push(tok.to_uppercase());
                }
            }
        }
    }
    (mapping, reverse)
}

#[cfg(test)]
mod tests {
    use super::*;

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
"#;

    #[test]
    fn parses_all_three_variants() {
        let cfg = Config::from_yaml_str(SAMPLE).expect("parses");
        let client = cfg.client("MiSTer").expect("client");
        let system = client.system("BBCMicro").expect("system");
        assert_eq!(system.canonical_name, "bbc_micro");
        assert_eq!(system.maps.len(), 4);

        let saves = &system.maps[0];
        assert!(matches!(saves.variant, MapVariant::Directory(_)));

        let tape = &system.maps[1];
        match &tape.variant {
            MapVariant::File(fm) => {
                assert!(fm.effective_unzip());
                assert_eq!(fm.zip_internal_file.as_deref(), Some("PACK/Elite.uef"));
            }
            _ => panic!("expected FileMap"),
        }

        let nested = &system.maps[2];
        assert_eq!(nested.name, "MMBs/beeb1_mmb.VHD");

        let sa = system.software_archives().expect("software archives");
        assert_eq!(sa.zip_mode, ZipMode::File);
    }

    #[test]
    fn filetype_spec_parses_colon_and_bare_forms() {
        let sa = SoftwareArchivesMap {
            source_dir: "Software".into(),
            filetypes: vec![BTreeMap::from([("HDs".to_string(), "MMB:VHD,VHD".to_string())])],
            supports_zip: true,
            zip_mode: ZipMode::Hierarchical,
            files: vec![],
        };
        let (mapping, reverse) = filetype_maps(&sa);
        assert_eq!(mapping.get("HDS").unwrap(), &vec!["MMB".to_string(), "VHD".to_string()]);
        assert_eq!(reverse.get("MMB").unwrap(), "VHD");
        assert!(!reverse.contains_key("VHD"));
    }
}

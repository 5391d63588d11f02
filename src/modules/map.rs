//! Automount maps and the collaborator that loads them.
//!
//! A map is a named, ordered list of `key -> target` entries. In an indirect
//! map each key names a directory directly below the map's directory; in a
//! direct map each key is a path below it. The map loader is opaque to the
//! controller: it only ever asks for a map by name.

use anyhow::{Context, Result};
use log::debug;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use super::constants::{KEY_SUBSTITUTION, WILDCARD_KEY};
use super::host::HostInfo;

/// Mount directory semantics of a map.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MapKind {
    /// Every entry is mounted at a fixed path
    Direct,
    /// Entries are directories created on first lookup
    #[default]
    Indirect,
}

/// What a map entry mounts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MapTarget {
    /// An NFS export
    Nfs {
        /// Server hostname
        server: String,
        /// Exported path
        path: String,
        /// Mount options
        #[serde(default)]
        options: Vec<String>,
    },
    /// Another map, mounted at the entry's directory
    Map {
        /// Name of the nested map
        name: String,
    },
}

/// A single `key -> target` line of a map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapEntry {
    /// Directory name (indirect) or relative path (direct); `*` matches any key
    pub key: String,
    /// What to mount there
    #[serde(flatten)]
    pub target: MapTarget,
}

impl MapEntry {
    /// Creates an NFS entry.
    pub fn nfs(key: &str, server: &str, path: &str) -> Self {
        Self {
            key: key.to_string(),
            target: MapTarget::Nfs {
                server: server.to_string(),
                path: path.to_string(),
                options: Vec::new(),
            },
        }
    }

    /// Creates an entry that mounts another map.
    pub fn map(key: &str, name: &str) -> Self {
        Self {
            key: key.to_string(),
            target: MapTarget::Map {
                name: name.to_string(),
            },
        }
    }

    /// Produces the target for a lookup of `key`.
    ///
    /// `&` is replaced with the looked-up key and host variables are expanded.
    pub fn resolve(&self, key: &str, host: &HostInfo) -> MapTarget {
        let substitute = |text: &str| host.expand(&text.replace(KEY_SUBSTITUTION, key));
        match &self.target {
            MapTarget::Nfs {
                server,
                path,
                options,
            } => MapTarget::Nfs {
                server: substitute(server.as_str()),
                path: substitute(path.as_str()),
                options: options.iter().map(|o| substitute(o.as_str())).collect(),
            },
            MapTarget::Map { name } => MapTarget::Map {
                name: substitute(name.as_str()),
            },
        }
    }
}

/// A named automount map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutomountMap {
    /// Map name
    pub name: String,
    /// Direct or indirect semantics
    #[serde(default)]
    pub kind: MapKind,
    /// Entries in map order
    #[serde(default)]
    pub entries: Vec<MapEntry>,
}

impl AutomountMap {
    /// Creates an empty map.
    pub fn new(name: impl Into<String>, kind: MapKind) -> Self {
        Self {
            name: name.into(),
            kind,
            entries: Vec::new(),
        }
    }

    /// Builder-style entry append.
    pub fn with_entry(mut self, entry: MapEntry) -> Self {
        self.entries.push(entry);
        self
    }

    /// Finds the entry for `key`: an exact match wins over the wildcard.
    pub fn lookup(&self, key: &str) -> Option<&MapEntry> {
        self.entries
            .iter()
            .find(|entry| entry.key == key)
            .or_else(|| self.entries.iter().find(|entry| entry.key == WILDCARD_KEY))
    }

    /// Whether entries are full paths below the mount directory.
    pub fn is_direct(&self) -> bool {
        self.kind == MapKind::Direct
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the map has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Source of automount maps.
pub trait MapLoader {
    /// Loads the map called `name`; `Ok(None)` means no such map.
    fn load(&self, name: &str) -> Result<Option<AutomountMap>>;
}

/// In-memory map loader.
///
/// Clones share the same maps, so a caller can keep a handle and change the
/// maps after the loader was handed to a controller.
#[derive(Debug, Clone, Default)]
pub struct StaticMapLoader {
    maps: Arc<RwLock<HashMap<String, AutomountMap>>>,
}

impl StaticMapLoader {
    /// An empty loader.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a map.
    pub fn insert(&self, map: AutomountMap) {
        self.maps.write().insert(map.name.clone(), map);
    }

    /// Removes a map by name.
    pub fn remove(&self, name: &str) -> Option<AutomountMap> {
        self.maps.write().remove(name)
    }
}

impl MapLoader for StaticMapLoader {
    fn load(&self, name: &str) -> Result<Option<AutomountMap>> {
        Ok(self.maps.read().get(name).cloned())
    }
}

/// Loads `<directory>/<name>.json`.
#[derive(Debug, Clone)]
pub struct JsonMapLoader {
    directory: PathBuf,
}

impl JsonMapLoader {
    /// A loader reading map files from `directory`.
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    fn map_path(&self, name: &str) -> PathBuf {
        // Leading '-' marks built-in style names ("-static"); keep it out of file names.
        self.directory
            .join(format!("{}.json", name.trim_start_matches('-')))
    }
}

impl MapLoader for JsonMapLoader {
    fn load(&self, name: &str) -> Result<Option<AutomountMap>> {
        if name.contains('/') {
            return Ok(None);
        }
        let path = self.map_path(name);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("No map file at {}", path.display());
                return Ok(None);
            }
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read map {}", path.display()))
            }
        };
        let mut map: AutomountMap = serde_json::from_str(&content)
            .with_context(|| format!("malformed map {}", path.display()))?;
        map.name = name.to_string();
        Ok(Some(map))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn host() -> HostInfo {
        HostInfo::new("ws1.lab.net", "x86_64", "Linux", "6.8.0")
    }

    #[test]
    fn test_lookup_prefers_exact_key() {
        let map = AutomountMap::new("auto_home", MapKind::Indirect)
            .with_entry(MapEntry::nfs("*", "fs1", "/export/home/&"))
            .with_entry(MapEntry::nfs("alice", "fs2", "/vol/alice"));

        assert_eq!(map.lookup("alice"), Some(&map.entries[1]));
        assert_eq!(map.lookup("bob"), Some(&map.entries[0]));
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn test_lookup_without_wildcard() {
        let map = AutomountMap::new("auto_data", MapKind::Indirect)
            .with_entry(MapEntry::nfs("data", "fs1", "/data"));
        assert!(map.lookup("other").is_none());
    }

    #[test]
    fn test_resolve_substitutes_key_and_host() {
        let mut entry = MapEntry::nfs("*", "&-nfs", "/export/${ARCH}/&");
        if let MapTarget::Nfs { options, .. } = &mut entry.target {
            options.push("ro".to_string());
        }

        let target = entry.resolve("tools", &host());
        assert_eq!(
            target,
            MapTarget::Nfs {
                server: "tools-nfs".into(),
                path: "/export/x86_64/tools".into(),
                options: vec!["ro".into()],
            }
        );
    }

    #[test]
    fn test_resolve_nested_map_name() {
        let entry = MapEntry::map("*", "auto_&");
        assert_eq!(
            entry.resolve("proj", &host()),
            MapTarget::Map {
                name: "auto_proj".into()
            }
        );
    }

    #[test]
    fn test_map_json_shape() -> Result<()> {
        let json = r#"{
            "name": "ignored",
            "kind": "direct",
            "entries": [
                {"key": "usr/share/man", "type": "nfs", "server": "fs1", "path": "/man", "options": ["ro"]},
                {"key": "projects", "type": "map", "name": "auto_projects"}
            ]
        }"#;
        let map: AutomountMap = serde_json::from_str(json)?;

        assert!(map.is_direct());
        assert_eq!(map.entries[1], MapEntry::map("projects", "auto_projects"));
        Ok(())
    }

    #[test]
    fn test_static_loader_shares_maps() -> Result<()> {
        let loader = StaticMapLoader::new();
        let handle = loader.clone();
        handle.insert(AutomountMap::new("auto_home", MapKind::Indirect));

        assert!(loader.load("auto_home")?.is_some());
        assert!(loader.load("auto_missing")?.is_none());
        handle.remove("auto_home");
        assert!(loader.load("auto_home")?.is_none());
        Ok(())
    }

    #[test]
    fn test_json_loader() -> Result<()> {
        let dir = TempDir::new()?;
        let map = AutomountMap::new("on-disk", MapKind::Indirect)
            .with_entry(MapEntry::nfs("*", "fs1", "/export/&"));
        fs::write(dir.path().join("auto_home.json"), serde_json::to_string(&map)?)?;
        fs::write(dir.path().join("broken.json"), "{ not json")?;

        let loader = JsonMapLoader::new(dir.path());
        let loaded = loader.load("auto_home")?.expect("map should load");
        assert_eq!(loaded.name, "auto_home");
        assert_eq!(loaded.entries, map.entries);

        assert!(loader.load("auto_missing")?.is_none());
        assert!(loader.load("broken").is_err());
        assert!(loader.load("../etc").map(|m| m.is_none())?);
        Ok(())
    }
}

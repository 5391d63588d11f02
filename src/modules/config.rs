use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::constants::*;

/// A master map line: mount map `map` at namespace directory `directory`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterEntry {
    /// Namespace directory, e.g. `/net` or `/home`
    pub directory: String,
    /// Map to mount there
    pub map: String,
}

/// Daemon configuration.
///
/// Every field has a default, so a configuration file only needs the values
/// it changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root of the automounted namespace on disk
    pub mount_directory: PathBuf,
    /// Where `JsonMapLoader` looks for map files
    pub map_directory: PathBuf,
    /// Master entries mounted at start-up and on re-initialisation
    pub maps: Vec<MasterEntry>,
    /// Seconds a mount may stay unused before the idle sweep unmounts it
    pub idle_timeout_secs: u64,
    /// Seconds between idle sweeps
    pub sweep_interval_secs: u64,
    /// Seconds an unmount helper may run before it is killed
    pub helper_timeout_secs: u64,
    /// Mount helper binary
    pub mount_command: PathBuf,
    /// Unmount helper binary
    pub umount_command: PathBuf,
    /// Options added to every NFS mount
    pub default_options: Vec<String>,
    /// Pid file written when running as a daemon
    pub pid_file: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mount_directory: PathBuf::from(DEFAULT_MOUNT_DIRECTORY),
            map_directory: PathBuf::from(DEFAULT_MAP_DIRECTORY),
            maps: Vec::new(),
            idle_timeout_secs: DEFAULT_IDLE_TIMEOUT.as_secs(),
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL.as_secs(),
            helper_timeout_secs: DEFAULT_HELPER_TIMEOUT.as_secs(),
            mount_command: PathBuf::from(DEFAULT_MOUNT_COMMAND),
            umount_command: PathBuf::from(DEFAULT_UMOUNT_COMMAND),
            default_options: Vec::new(),
            pid_file: PathBuf::from(DEFAULT_PID_FILE),
        }
    }
}

impl Config {
    /// Reads a JSON configuration file.
    ///
    /// # Arguments
    ///
    /// * `path` - Location of the configuration file
    ///
    /// # Returns
    ///
    /// * `Ok(Config)` with defaults filled in for absent fields
    /// * `Err` if the file cannot be read or is not valid JSON
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("invalid config {}", path.display()))
    }

    /// Adds a master entry.
    pub fn add_map(&mut self, directory: &str, map: &str) {
        self.maps.push(MasterEntry {
            directory: directory.to_string(),
            map: map.to_string(),
        });
    }

    /// How long a mount may sit unused before the sweep unmounts it.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// Never zero, so a timer built from it always makes progress.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    /// How long a mount or unmount helper may run.
    pub fn helper_timeout(&self) -> Duration {
        Duration::from_secs(self.helper_timeout_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.mount_directory, PathBuf::from(DEFAULT_MOUNT_DIRECTORY));
        assert_eq!(config.idle_timeout(), DEFAULT_IDLE_TIMEOUT);
        assert!(config.maps.is_empty());
    }

    #[test]
    fn test_load_partial_file() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("automountd.json");
        fs::write(
            &path,
            r#"{
                "mount_directory": "/srv/auto",
                "idle_timeout_secs": 30,
                "maps": [{"directory": "/home", "map": "auto_home"}]
            }"#,
        )?;

        let config = Config::load(&path)?;
        assert_eq!(config.mount_directory, PathBuf::from("/srv/auto"));
        assert_eq!(config.idle_timeout(), Duration::from_secs(30));
        assert_eq!(config.maps[0].map, "auto_home");
        assert_eq!(config.umount_command, PathBuf::from(DEFAULT_UMOUNT_COMMAND));
        Ok(())
    }

    #[test]
    fn test_load_rejects_garbage() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("bad.json");
        fs::write(&path, "maps = nope")?;
        assert!(Config::load(&path).is_err());
        assert!(Config::load(&dir.path().join("missing.json")).is_err());
        Ok(())
    }

    #[test]
    fn test_intervals_never_zero() {
        let config = Config {
            sweep_interval_secs: 0,
            helper_timeout_secs: 0,
            ..Config::default()
        };
        assert_eq!(config.sweep_interval(), Duration::from_secs(1));
        assert_eq!(config.helper_timeout(), Duration::from_secs(1));
    }

    #[test]
    fn test_add_map() {
        let mut config = Config::default();
        config.add_map("/net", "auto_net");
        assert_eq!(
            config.maps,
            vec![MasterEntry {
                directory: "/net".into(),
                map: "auto_net".into()
            }]
        );
    }
}

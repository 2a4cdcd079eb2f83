//! Agent configuration.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use otad_common::partitions::PartitionsConfig;

/// Default path of the agent configuration file.
pub const CONFIG_PATH: &str = "/etc/otad/agent.toml";

/// Structure of the agent configuration file.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AgentConfig {
    /// Root partition devices.
    #[serde(default)]
    pub partitions: PartitionsConfig,
    /// Path of the boot selection environment file.
    #[serde(default = "default_boot_env")]
    pub boot_env: PathBuf,
    /// Directory where partitions are temporarily mounted.
    #[serde(default = "default_mount_root")]
    pub mount_root: PathBuf,
    /// Directory where uploaded bundles are stored.
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
    /// File expected to exist on a freshly written root filesystem, relative
    /// to its root.
    #[serde(default = "default_marker_file")]
    pub marker_file: PathBuf,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            partitions: PartitionsConfig::default(),
            boot_env: default_boot_env(),
            mount_root: default_mount_root(),
            download_dir: default_download_dir(),
            marker_file: default_marker_file(),
        }
    }
}

fn default_boot_env() -> PathBuf {
    "/run/otad/mounts/config/bootpart.default.env".into()
}

fn default_mount_root() -> PathBuf {
    "/run/otad/mounts".into()
}

fn default_download_dir() -> PathBuf {
    "/var/lib/otad/downloads".into()
}

fn default_marker_file() -> PathBuf {
    "etc/os-release".into()
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unable to read config from {path:?}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("unable to parse config from {path:?}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Loads the agent configuration, falling back to defaults if absent.
pub fn load_config(path: impl AsRef<Path>) -> Result<AgentConfig, ConfigError> {
    let path = path.as_ref();
    if path.exists() {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    } else {
        Ok(AgentConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AgentConfig::default();
        assert_eq!(config.download_dir, PathBuf::from("/var/lib/otad/downloads"));
        assert_eq!(config.marker_file, PathBuf::from("etc/os-release"));
    }

    #[test]
    fn test_parse() {
        let config: AgentConfig = toml::from_str(
            r#"
            boot-env = "/boot/env"
            download-dir = "/data/downloads"

            [partitions]
            system-a = "/dev/sda2"
            system-b = "/dev/sda3"
            "#,
        )
        .unwrap();
        assert_eq!(config.boot_env, PathBuf::from("/boot/env"));
        assert_eq!(config.download_dir, PathBuf::from("/data/downloads"));
        assert_eq!(config.partitions.system_a, Some(PathBuf::from("/dev/sda2")));
        // Unset keys keep their defaults.
        assert_eq!(config.mount_root, PathBuf::from("/run/otad/mounts"));
    }

    #[test]
    fn test_load_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(dir.path().join("agent.toml")).unwrap();
        assert_eq!(config.boot_env, default_boot_env());
    }
}

//! Configuration consumed when constructing the core's collaborators.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// This device's identity and the paths/ports the core needs at startup.
///
/// Round-trips through TOML the same way the daemon's own configuration
/// does; every field with a sensible default tolerates a missing key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub device_name: String,
    pub device_type: String,
    #[serde(default)]
    pub device_id: Option<String>,

    #[serde(default = "default_tcp_port")]
    pub tcp_port: u16,

    #[serde(default = "default_pair_timeout_secs")]
    pub pair_timeout_secs: u64,

    pub cert_dir: PathBuf,
    pub cache_path: PathBuf,
}

fn default_tcp_port() -> u16 {
    1714
}

fn default_pair_timeout_secs() -> u64 {
    30
}

impl Default for Config {
    fn default() -> Self {
        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from(".config"))
            .join("kdeconnect-core");

        Self {
            device_name: "This Device".to_string(),
            device_type: "desktop".to_string(),
            device_id: None,
            tcp_port: default_tcp_port(),
            pair_timeout_secs: default_pair_timeout_secs(),
            cert_dir: config_dir.join("certs"),
            cache_path: config_dir.join("devices.toml"),
        }
    }
}

impl Config {
    /// Load configuration from `path`, failing if the file does not parse.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Write configuration to `path`, creating parent directories as needed.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }
}

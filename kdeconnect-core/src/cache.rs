//! DeviceCache: durable per-device state, one TOML table per device_id.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::Result;

/// The persisted fields for one known peer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceCacheEntry {
    #[serde(rename = "deviceId")]
    pub device_id: String,
    #[serde(rename = "deviceName")]
    pub device_name: String,
    #[serde(rename = "deviceType")]
    pub device_type: String,
    #[serde(rename = "protocolVersion")]
    pub protocol_version: u32,
    #[serde(rename = "tcpPort")]
    pub tcp_port: u16,
    #[serde(rename = "lastIPAddress")]
    pub last_ip_address: String,
    pub allowed: bool,
    pub paired: bool,
    #[serde(default)]
    pub certificate: String,
    #[serde(default)]
    pub outgoing_capabilities: Vec<String>,
    #[serde(default)]
    pub incoming_capabilities: Vec<String>,
}

/// Known-peer state keyed by device_id, persisted as one TOML table per
/// group.
#[derive(Debug, Default)]
pub struct DeviceCache {
    entries: HashMap<String, DeviceCacheEntry>,
}

impl DeviceCache {
    /// Load the cache from `path`. A missing file is treated as "no
    /// known devices yet" rather than an error. A group that fails to
    /// deserialize is skipped with a warning; the rest of the file still
    /// loads.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)?;
        let raw: toml::Table = toml::from_str(&contents)?;

        let mut entries = HashMap::new();
        for (group, value) in raw {
            let as_toml = toml::to_string(&value)?;
            match toml::from_str::<DeviceCacheEntry>(&as_toml) {
                Ok(entry) => {
                    entries.insert(group, entry);
                }
                Err(e) => {
                    warn!(group = %group, error = %e, "skipping device cache group that failed to load");
                }
            }
        }

        Ok(Self { entries })
    }

    /// Write every group back to `path`, creating parent directories as
    /// needed. Each group is written as a full overwrite of its prior
    /// contents.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut table = toml::Table::new();
        for (group, entry) in &self.entries {
            let as_toml = toml::to_string(entry)?;
            table.insert(group.clone(), as_toml.parse::<toml::Value>()?);
        }

        fs::write(path, toml::to_string_pretty(&table)?)?;
        Ok(())
    }

    pub fn get(&self, device_id: &str) -> Option<&DeviceCacheEntry> {
        self.entries.get(device_id)
    }

    pub fn insert(&mut self, entry: DeviceCacheEntry) {
        self.entries.insert(entry.device_id.clone(), entry);
    }

    pub fn remove(&mut self, device_id: &str) -> Option<DeviceCacheEntry> {
        self.entries.remove(device_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &DeviceCacheEntry> {
        self.entries.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_entry(device_id: &str) -> DeviceCacheEntry {
        DeviceCacheEntry {
            device_id: device_id.to_string(),
            device_name: "Test Phone".to_string(),
            device_type: "phone".to_string(),
            protocol_version: 7,
            tcp_port: 1714,
            last_ip_address: "192.168.1.10".to_string(),
            allowed: true,
            paired: true,
            certificate: "-----BEGIN CERTIFICATE-----".to_string(),
            outgoing_capabilities: vec!["kdeconnect.battery".to_string()],
            incoming_capabilities: vec![],
        }
    }

    #[test]
    fn missing_file_loads_as_empty() {
        let dir = tempdir().unwrap();
        let cache = DeviceCache::load(&dir.path().join("devices.toml")).unwrap();
        assert_eq!(cache.iter().count(), 0);
    }

    #[test]
    fn round_trips_through_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("devices.toml");

        let mut cache = DeviceCache::default();
        cache.insert(sample_entry("dev-1"));
        cache.save(&path).unwrap();

        let loaded = DeviceCache::load(&path).unwrap();
        assert_eq!(loaded.get("dev-1"), cache.get("dev-1"));
    }

    #[test]
    fn missing_certificate_field_tolerated() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("devices.toml");
        fs::write(
            &path,
            r#"
            [dev-1]
            deviceId = "dev-1"
            deviceName = "Old Phone"
            deviceType = "phone"
            protocolVersion = 7
            tcpPort = 1714
            lastIPAddress = "192.168.1.10"
            allowed = true
            paired = true
            "#,
        )
        .unwrap();

        let cache = DeviceCache::load(&path).unwrap();
        let entry = cache.get("dev-1").unwrap();
        assert_eq!(entry.certificate, "");
    }

    #[test]
    fn group_missing_required_field_is_skipped_not_fatal() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("devices.toml");
        fs::write(
            &path,
            r#"
            [broken]
            deviceId = "broken"

            [dev-1]
            deviceId = "dev-1"
            deviceName = "Good Phone"
            deviceType = "phone"
            protocolVersion = 7
            tcpPort = 1714
            lastIPAddress = "192.168.1.10"
            allowed = true
            paired = true
            "#,
        )
        .unwrap();

        let cache = DeviceCache::load(&path).unwrap();
        assert!(cache.get("broken").is_none());
        assert!(cache.get("dev-1").is_some());
    }
}

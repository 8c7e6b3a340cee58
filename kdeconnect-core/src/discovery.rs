//! The input side of device discovery.
//!
//! LAN discovery itself (UDP identity broadcasts) is an external
//! collaborator; this module only defines the record it hands to
//! [`crate::manager::DeviceManager`] and the trait a discovery
//! implementation must expose.

use std::collections::HashSet;
use std::net::IpAddr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Device form factor, as advertised in an identity packet's `deviceType`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Phone,
    Tablet,
    Desktop,
    Laptop,
    Tv,
}

impl DeviceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Phone => "phone",
            DeviceType::Tablet => "tablet",
            DeviceType::Desktop => "desktop",
            DeviceType::Laptop => "laptop",
            DeviceType::Tv => "tv",
        }
    }
}

/// One identity advertisement observed on the network. Immutable; the
/// DeviceManager decides what to do with it.
#[derive(Debug, Clone)]
pub struct DiscoveredDevice {
    pub device_id: String,
    pub device_name: String,
    pub device_type: DeviceType,
    pub protocol_version: u32,
    pub tcp_port: u16,
    pub host: IpAddr,
    pub outgoing_capabilities: HashSet<String>,
    pub incoming_capabilities: HashSet<String>,
}

impl DiscoveredDevice {
    pub const DEFAULT_PROTOCOL_VERSION: u32 = 7;
    pub const DEFAULT_TCP_PORT: u16 = 1714;
}

/// Implemented by whatever pumps identity broadcasts off the network.
/// `DeviceManager` only ever consumes this stream; it never talks back.
#[async_trait]
pub trait DiscoverySource: Send + Sync {
    /// Block until the next device is observed.
    async fn next_device(&mut self) -> Option<DiscoveredDevice>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_type_round_trips_through_str() {
        for ty in [
            DeviceType::Phone,
            DeviceType::Tablet,
            DeviceType::Desktop,
            DeviceType::Laptop,
            DeviceType::Tv,
        ] {
            assert_eq!(ty.as_str().len() > 0, true);
        }
    }
}

//! KDE Connect peer device core: identity, pairing, TLS channels and
//! capability dispatch.
//!
//! This crate is the protocol and state-machine layer. It owns nothing
//! UI-facing and runs no network listener of its own; a daemon wires a
//! TCP listener and a [`discovery::DiscoverySource`] into
//! [`manager::DeviceManager`] and drains its `events` channel.

pub mod cache;
pub mod config;
pub mod device;
pub mod discovery;
pub mod error;
pub mod handler;
pub mod identity;
pub mod manager;
pub mod packet;
pub mod transport;

pub use cache::{DeviceCache, DeviceCacheEntry};
pub use config::Config;
pub use device::{CapabilityHandler, ConnState, Device, DeviceEvent, PairState};
pub use discovery::{DeviceType, DiscoveredDevice, DiscoverySource};
pub use error::{CoreError, Result};
pub use handler::{HandlerFactory, HandlerRegistry};
pub use identity::LocalCertificate;
pub use manager::{DeviceCommand, DeviceManager, ManagerEvent};
pub use packet::Packet;
pub use transport::{DeviceChannel, Role};

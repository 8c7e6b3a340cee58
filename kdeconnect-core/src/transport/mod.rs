//! TCP+TLS transport for a single peer connection.

mod channel;
mod tls_config;

pub use channel::{DeviceChannel, Role};

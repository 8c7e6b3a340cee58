//! Error handling for the device core.
//!
//! `CoreError` covers every failure mode the core surfaces: transport
//! failures during channel activation, trust failures during the TLS
//! upgrade, pairing protocol failures, and the cache/config I/O errors
//! that sit around them.

use thiserror::Error;

/// Result type used throughout the core.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors that can occur while operating the device core.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Generic I/O error (cache file, certificate file, socket).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Packet or cache JSON (de)serialization failure.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Config or cache TOML deserialization failure.
    #[error("TOML decode error: {0}")]
    TomlDecode(#[from] toml::de::Error),

    /// Config or cache TOML serialization failure.
    #[error("TOML encode error: {0}")]
    TomlEncode(#[from] toml::ser::Error),

    /// TLS handshake or record-layer error.
    #[error("TLS error: {0}")]
    Tls(#[from] openssl::ssl::Error),

    /// Certificate generation or encoding failure.
    #[error("Certificate error: {0}")]
    Certificate(#[from] openssl::error::ErrorStack),

    /// The network is unreachable (no route to host).
    #[error("Network unreachable: {0}")]
    NetworkUnreachable(String),

    /// The peer actively refused the connection.
    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    /// The channel was closed while a send or receive was suspended on it.
    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    /// The TLS handshake completed but did not meet KDE Connect's trust
    /// requirements.
    #[error("TLS handshake failed: {0}")]
    TlsHandshakeFailed(String),

    /// The peer's identity packet did not match the device_id we expected
    /// to connect to.
    #[error("Identity mismatch: expected {expected}, got {actual}")]
    IdentityMismatch { expected: String, actual: String },

    /// A remembered certificate did not match the peer's leaf certificate
    /// during a secured re-connect.
    #[error("Certificate pinning failed for device {0}")]
    CertificatePinningFailed(String),

    /// The 30-second pairing timer elapsed with no response from the peer.
    #[error("Pair timeout for device {0}")]
    PairTimeout(String),

    /// The peer explicitly rejected a pair request.
    #[error("Pair rejected by device {0}")]
    PairRejected(String),

    /// A line on the wire was not valid framed JSON, lacked a `type`
    /// field, or had a non-object `body`.
    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    /// A cache group failed to load; the caller skips that device and
    /// continues with the rest of the file.
    #[error("Cache load error for group {group}: {reason}")]
    CacheLoadError { group: String, reason: String },

    /// No device is known under the requested device_id.
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// A capability handler was registered twice for the same capability
    /// on the same device. This is a checked contract violation, not a
    /// recoverable runtime condition.
    #[error("Duplicate handler for capability {capability} on device {device_id}")]
    DuplicateHandler {
        device_id: String,
        capability: String,
    },

    /// The configuration file was present but invalid.
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl CoreError {
    /// Classify a raw I/O error into the closest domain-specific variant.
    pub fn from_io_error(error: std::io::Error, context: &str) -> Self {
        use std::io::ErrorKind;

        match error.kind() {
            ErrorKind::ConnectionRefused => {
                CoreError::ConnectionRefused(format!("{context}: {error}"))
            }
            ErrorKind::NetworkUnreachable => {
                CoreError::NetworkUnreachable(format!("{context}: {error}"))
            }
            ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe => {
                CoreError::ChannelClosed(format!("{context}: {error}"))
            }
            _ => CoreError::Io(error),
        }
    }

    /// Whether retrying the operation that produced this error later,
    /// unmodified, might succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            CoreError::NetworkUnreachable(_)
                | CoreError::ConnectionRefused(_)
                | CoreError::ChannelClosed(_)
                | CoreError::Io(_)
                | CoreError::MalformedPacket(_)
                | CoreError::PairTimeout(_)
                | CoreError::PairRejected(_)
        )
    }

    /// Whether this error requires the operator to act (re-pair, fix
    /// configuration) before the condition can clear on its own.
    pub fn requires_user_action(&self) -> bool {
        matches!(
            self,
            CoreError::CertificatePinningFailed(_)
                | CoreError::IdentityMismatch { .. }
                | CoreError::Configuration(_)
        )
    }

    /// A short, user-facing description suitable for a notification.
    pub fn user_message(&self) -> String {
        match self {
            CoreError::NetworkUnreachable(_) => {
                "Network unreachable. Check that both devices are on the same network.".into()
            }
            CoreError::ConnectionRefused(_) => {
                "Connection refused. The device may be offline.".into()
            }
            CoreError::ChannelClosed(_) => "Connection closed unexpectedly.".into(),
            CoreError::TlsHandshakeFailed(_) => "Secure connection failed.".into(),
            CoreError::IdentityMismatch { expected, actual } => format!(
                "Connected to the wrong device: expected {expected}, got {actual}."
            ),
            CoreError::CertificatePinningFailed(id) => format!(
                "Certificate for device {id} changed. Re-pair the device if this is expected."
            ),
            CoreError::PairTimeout(id) => format!("Device {id} did not respond to pairing."),
            CoreError::PairRejected(id) => format!("Device {id} rejected the pairing request."),
            CoreError::MalformedPacket(msg) => format!("Received malformed data: {msg}"),
            CoreError::CacheLoadError { group, reason } => {
                format!("Could not load cached device {group}: {reason}")
            }
            CoreError::DeviceNotFound(id) => format!("Device {id} is not known."),
            CoreError::DuplicateHandler {
                device_id,
                capability,
            } => format!("Handler for {capability} already registered on {device_id}."),
            CoreError::Configuration(msg) => format!("Configuration error: {msg}"),
            CoreError::Io(e) => format!("I/O error: {e}"),
            CoreError::Json(e) => format!("Data format error: {e}"),
            CoreError::TomlDecode(e) => format!("Configuration format error: {e}"),
            CoreError::TomlEncode(e) => format!("Configuration format error: {e}"),
            CoreError::Tls(e) => format!("Secure connection error: {e}"),
            CoreError::Certificate(e) => format!("Certificate error: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let error = CoreError::DeviceNotFound("abc123".to_string());
        assert_eq!(error.to_string(), "Device not found: abc123");

        let error = CoreError::PairTimeout("abc123".to_string());
        assert_eq!(error.to_string(), "Pair timeout for device abc123");
    }

    #[test]
    fn recoverable_classification() {
        assert!(CoreError::ConnectionRefused("x".into()).is_recoverable());
        assert!(!CoreError::IdentityMismatch {
            expected: "a".into(),
            actual: "b".into()
        }
        .is_recoverable());
    }

    #[test]
    fn io_error_conversion_classifies_by_kind() {
        use std::io::{Error, ErrorKind};

        let io_error = Error::new(ErrorKind::ConnectionRefused, "refused");
        let error = CoreError::from_io_error(io_error, "connecting");
        assert!(matches!(error, CoreError::ConnectionRefused(_)));
    }
}

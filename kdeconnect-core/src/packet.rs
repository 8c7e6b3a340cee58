//! KDE Connect wire packets: a JSON object per line, newline-terminated.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CoreError, Result};

/// One KDE Connect packet: `{"id": <ms timestamp>, "type": "<string>", "body": {...}}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Packet {
    pub id: i64,
    #[serde(rename = "type")]
    pub packet_type: String,
    pub body: Value,
}

impl Packet {
    /// Build a packet of the given type with the current time as id.
    pub fn new(packet_type: impl Into<String>, body: Value) -> Self {
        Self {
            id: chrono::Utc::now().timestamp_millis(),
            packet_type: packet_type.into(),
            body,
        }
    }

    /// `kdeconnect.identity` packet advertising this device's metadata and
    /// capabilities.
    #[allow(clippy::too_many_arguments)]
    pub fn identity(
        device_id: &str,
        device_name: &str,
        protocol_version: u32,
        tcp_port: u16,
        device_type: &str,
        incoming: &[String],
        outgoing: &[String],
    ) -> Self {
        Self::new(
            "kdeconnect.identity",
            serde_json::json!({
                "deviceId": device_id,
                "deviceName": device_name,
                "deviceType": device_type,
                "protocolVersion": protocol_version,
                "tcpPort": tcp_port,
                "incomingCapabilities": incoming,
                "outgoingCapabilities": outgoing,
            }),
        )
    }

    /// `kdeconnect.pair` packet requesting or rejecting pairing.
    pub fn pair(pair: bool) -> Self {
        Self::new("kdeconnect.pair", serde_json::json!({ "pair": pair }))
    }

    /// True if this packet's `type` matches `packet_type` exactly.
    pub fn is_type(&self, packet_type: &str) -> bool {
        self.packet_type == packet_type
    }

    /// Fetch and deserialize a field out of `body`, returning `None` if
    /// absent or of the wrong shape.
    pub fn get_body_field<T: serde::de::DeserializeOwned>(&self, field: &str) -> Option<T> {
        self.body.get(field).and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Encode as a single newline-terminated JSON line.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut bytes = serde_json::to_vec(self)?;
        bytes.push(b'\n');
        Ok(bytes)
    }

    /// Decode one packet from a buffer (without the trailing newline).
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(data)
            .map_err(|e| CoreError::MalformedPacket(e.to_string()))?;

        let obj = value
            .as_object()
            .ok_or_else(|| CoreError::MalformedPacket("packet is not a JSON object".to_string()))?;

        let packet_type = obj
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| CoreError::MalformedPacket("missing type field".to_string()))?
            .to_string();

        let body = obj.get("body").cloned().unwrap_or(Value::Null);
        if !body.is_object() {
            return Err(CoreError::MalformedPacket("body is not a JSON object".to_string()));
        }

        let id = obj.get("id").and_then(Value::as_i64).unwrap_or(0);

        Ok(Self {
            id,
            packet_type,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_packet_has_expected_fields() {
        let packet = Packet::identity(
            "dev-1",
            "My Phone",
            7,
            1716,
            "phone",
            &["kdeconnect.battery".to_string()],
            &["kdeconnect.ping".to_string()],
        );
        assert!(packet.is_type("kdeconnect.identity"));
        assert_eq!(packet.get_body_field::<String>("deviceId"), Some("dev-1".to_string()));
        assert_eq!(packet.get_body_field::<u16>("tcpPort"), Some(1716));
    }

    #[test]
    fn pair_packet_round_trips() {
        let packet = Packet::pair(true);
        let bytes = packet.to_bytes().unwrap();
        assert_eq!(*bytes.last().unwrap(), b'\n');

        let decoded = Packet::from_bytes(&bytes[..bytes.len() - 1]).unwrap();
        assert!(decoded.is_type("kdeconnect.pair"));
        assert_eq!(decoded.get_body_field::<bool>("pair"), Some(true));
    }

    #[test]
    fn decoding_rejects_non_json() {
        let err = Packet::from_bytes(b"not json").unwrap_err();
        assert!(matches!(err, CoreError::MalformedPacket(_)));
    }

    #[test]
    fn decoding_rejects_missing_type() {
        let err = Packet::from_bytes(br#"{"id":1,"body":{}}"#).unwrap_err();
        assert!(matches!(err, CoreError::MalformedPacket(_)));
    }

    #[test]
    fn decoding_rejects_non_object_body() {
        let err = Packet::from_bytes(br#"{"id":1,"type":"x","body":5}"#).unwrap_err();
        assert!(matches!(err, CoreError::MalformedPacket(_)));
    }
}

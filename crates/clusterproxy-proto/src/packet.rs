//! Packet model

use serde::{Deserialize, Serialize};

/// Logical connection identifier, unique within one tunnel
pub type ConnectionId = i64;

/// Control code of a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ControlCode {
    /// Payload transfer, or connection establishment when sent first
    Data = 0,
    /// Terminal failure of one logical connection
    Error = 1,
}

/// The framed unit exchanged over a tunnel's physical stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Packet {
    pub conn_id: ConnectionId,
    pub code: ControlCode,
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
    pub error_message: String,
    /// Only ever meaningful on a packet that establishes a connection
    pub target_address: Option<String>,
}

impl Packet {
    pub fn data(conn_id: ConnectionId, data: impl Into<Vec<u8>>) -> Self {
        Self {
            conn_id,
            code: ControlCode::Data,
            data: data.into(),
            error_message: String::new(),
            target_address: None,
        }
    }

    pub fn error(conn_id: ConnectionId, message: impl Into<String>) -> Self {
        Self {
            conn_id,
            code: ControlCode::Error,
            data: Vec::new(),
            error_message: message.into(),
            target_address: None,
        }
    }

    pub fn with_target_address(mut self, target_address: impl Into<String>) -> Self {
        self.target_address = Some(target_address.into());
        self
    }

    pub fn is_error(&self) -> bool {
        self.code == ControlCode::Error
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_packet_has_no_target() {
        let packet = Packet::data(7, b"hello".to_vec());
        assert_eq!(packet.code, ControlCode::Data);
        assert_eq!(packet.target_address, None);
        assert!(packet.error_message.is_empty());
        assert!(!packet.is_error());
    }

    #[test]
    fn test_error_packet() {
        let packet = Packet::error(3, "upstream unreachable");
        assert!(packet.is_error());
        assert!(packet.data.is_empty());
        assert_eq!(packet.error_message, "upstream unreachable");
    }

    #[test]
    fn test_with_target_address() {
        let packet = Packet::data(1, Vec::new()).with_target_address("10.0.0.1:6443");
        assert_eq!(packet.target_address.as_deref(), Some("10.0.0.1:6443"));
    }

    #[test]
    fn test_payload_encodes_as_byte_string() {
        let packet = Packet::data(1, vec![0xffu8; 300]).with_target_address("a:1");
        let encoded = bincode::serialize(&packet).unwrap();

        // id, code, length-prefixed payload, empty message, tagged target
        assert_eq!(encoded.len(), 8 + 4 + (8 + 300) + 8 + (1 + 8 + 3));

        let decoded: Packet = bincode::deserialize(&encoded).unwrap();
        assert_eq!(decoded, packet);
    }
}

//! Binary framing for document synchronization.
//!
//! Messages are bincode-encoded and carried in binary WebSocket frames:
//! ```text
//! ┌──────────┬───────────┬─────────────┬──────────┐
//! │ msg_type │ peer_id   │ room        │ payload  │
//! │ 1 byte   │ 16 bytes  │ len-prefixed│ variable │
//! └──────────┴───────────┴─────────────┴──────────┘
//! ```
//!
//! The payload carries Yrs v1 encodings: a state vector for `SyncStep1`,
//! a state diff for `SyncStep2`, and an incremental update for `Update`.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Message types for the sync relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Client state vector; server answers with a diff
    SyncStep1 = 1,
    /// State diff response
    SyncStep2 = 2,
    /// Incremental CRDT update
    Update = 3,
    /// Heartbeat ping
    Ping = 4,
    /// Heartbeat pong
    Pong = 5,
}

/// Top-level relay message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    /// Originating peer (server-originated frames use the nil UUID)
    pub peer_id: Uuid,
    /// Room this frame belongs to
    pub room: String,
    /// Yrs-encoded payload (varies by msg_type)
    pub payload: Vec<u8>,
}

impl SyncMessage {
    /// Create a sync step 1 (state vector request).
    pub fn sync_step1(peer_id: Uuid, room: impl Into<String>, state_vector: Vec<u8>) -> Self {
        Self {
            msg_type: MessageType::SyncStep1,
            peer_id,
            room: room.into(),
            payload: state_vector,
        }
    }

    /// Create a sync step 2 (state diff response).
    pub fn sync_step2(peer_id: Uuid, room: impl Into<String>, state_diff: Vec<u8>) -> Self {
        Self {
            msg_type: MessageType::SyncStep2,
            peer_id,
            room: room.into(),
            payload: state_diff,
        }
    }

    /// Create an incremental update message.
    pub fn update(peer_id: Uuid, room: impl Into<String>, yrs_update: Vec<u8>) -> Self {
        Self {
            msg_type: MessageType::Update,
            peer_id,
            room: room.into(),
            payload: yrs_update,
        }
    }

    /// Create a heartbeat ping.
    pub fn ping(peer_id: Uuid, room: impl Into<String>) -> Self {
        Self {
            msg_type: MessageType::Ping,
            peer_id,
            room: room.into(),
            payload: Vec::new(),
        }
    }

    /// Create a heartbeat pong.
    pub fn pong(peer_id: Uuid, room: impl Into<String>) -> Self {
        Self {
            msg_type: MessageType::Pong,
            peer_id,
            room: room.into(),
            payload: Vec::new(),
        }
    }

    /// Encode to bytes for the wire.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    /// Decode from wire bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Decode(e.to_string()))?;
        Ok(msg)
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    Encode(String),
    Decode(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolError::Encode(e) => write!(f, "Encode error: {e}"),
            ProtocolError::Decode(e) => write!(f, "Decode error: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_roundtrip() {
        let peer = Uuid::new_v4();
        let msg = SyncMessage::update(peer, "alpha", vec![1, 2, 3, 4]);
        let encoded = msg.encode().unwrap();
        let decoded = SyncMessage::decode(&encoded).unwrap();

        assert_eq!(decoded.msg_type, MessageType::Update);
        assert_eq!(decoded.peer_id, peer);
        assert_eq!(decoded.room, "alpha");
        assert_eq!(decoded.payload, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_sync_steps_carry_payloads() {
        let peer = Uuid::new_v4();
        let step1 = SyncMessage::sync_step1(peer, "beta", vec![9]);
        assert_eq!(step1.msg_type, MessageType::SyncStep1);

        let step2 = SyncMessage::sync_step2(Uuid::nil(), "beta", vec![7, 8]);
        assert_eq!(step2.msg_type, MessageType::SyncStep2);
        assert_eq!(step2.peer_id, Uuid::nil());
        assert_eq!(step2.payload, vec![7, 8]);
    }

    #[test]
    fn test_ping_pong_empty_payload() {
        let peer = Uuid::new_v4();
        let ping = SyncMessage::ping(peer, "alpha");
        let pong = SyncMessage::pong(peer, "alpha");
        assert!(ping.payload.is_empty());
        assert!(pong.payload.is_empty());
        assert_eq!(ping.msg_type, MessageType::Ping);
        assert_eq!(pong.msg_type, MessageType::Pong);
    }

    #[test]
    fn test_decode_garbage_fails() {
        let result = SyncMessage::decode(&[0xFF; 3]);
        assert!(result.is_err());
    }
}

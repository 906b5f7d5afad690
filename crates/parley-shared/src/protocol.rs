//! JSON envelopes for the two channels a participant speaks on.
//!
//! The signaling channel (client <-> relay) carries membership and opaque
//! negotiation payloads. The peer-direct channel carries key agreement,
//! name announcements and, once a shared key exists, ciphertext under
//! `data`. Every envelope is an object discriminated by its `type` field.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;
use crate::types::{Member, RoomId, SessionId};

// ---------------------------------------------------------------------------
// Signaling channel
// ---------------------------------------------------------------------------

/// Envelopes sent by a participant to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Enter a room. Missing fields decode as empty and are rejected by the relay.
    #[serde(rename_all = "camelCase")]
    Join {
        #[serde(default)]
        username: String,
        #[serde(default)]
        room_id: String,
    },

    /// Forward an opaque negotiation payload to one member of the same room.
    #[serde(rename_all = "camelCase")]
    Signal { target_id: SessionId, signal: Value },

    /// Leave the current room.
    Leave,
}

/// Envelopes sent by the relay to a participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// Reply to `join`: the caller's id and everyone already in the room.
    #[serde(rename_all = "camelCase")]
    RoomJoined {
        room_id: RoomId,
        user_id: SessionId,
        users: Vec<Member>,
    },

    #[serde(rename_all = "camelCase")]
    UserJoined { user_id: SessionId, username: String },

    #[serde(rename_all = "camelCase")]
    UserLeft { user_id: SessionId, username: String },

    /// Full member list, rebroadcast after every join and leave.
    UserList { users: Vec<Member> },

    #[serde(rename_all = "camelCase")]
    Signal { from_id: SessionId, signal: Value },
}

impl ClientMessage {
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }
}

impl ServerMessage {
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }
}

// ---------------------------------------------------------------------------
// Peer-direct channel
// ---------------------------------------------------------------------------

/// Envelopes exchanged directly between two peers over their transport link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum PeerEnvelope {
    /// Sender's X25519 public key, base64.
    #[serde(rename_all = "camelCase")]
    KeyExchange { public_key: String },

    DisplayNameShare { name: String },

    /// `data` is base64(nonce || ciphertext) of the UTF-8 message body.
    #[serde(rename_all = "camelCase")]
    EncryptedMessage {
        data: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
        timestamp: i64,
    },

    /// Reactions travel in the clear; they only reference a message id.
    #[serde(rename_all = "camelCase")]
    EmojiReaction {
        message_id: String,
        emoji: String,
        username: String,
    },

    /// Decrypts to [`FileMetadata`] JSON.
    EncryptedFileMetadata { data: String },

    /// Decrypts to [`FileChunkPayload`] JSON.
    EncryptedFileChunk { data: String },
}

impl PeerEnvelope {
    pub fn kind(&self) -> &'static str {
        match self {
            PeerEnvelope::KeyExchange { .. } => "key-exchange",
            PeerEnvelope::DisplayNameShare { .. } => "display-name-share",
            PeerEnvelope::EncryptedMessage { .. } => "encrypted-message",
            PeerEnvelope::EmojiReaction { .. } => "emoji-reaction",
            PeerEnvelope::EncryptedFileMetadata { .. } => "encrypted-file-metadata",
            PeerEnvelope::EncryptedFileChunk { .. } => "encrypted-file-chunk",
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        let text = std::str::from_utf8(data).map_err(|_| ProtocolError::NotUtf8)?;
        Ok(serde_json::from_str(text)?)
    }
}

/// Plaintext of an `encrypted-file-metadata` envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    pub file_id: String,
    pub file_name: String,
    pub file_size: u64,
    pub file_type: String,
    pub total_chunks: u32,
    /// BLAKE3 of the whole file, lower-case hex.
    pub hash: String,
}

/// Plaintext of an `encrypted-file-chunk` envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileChunkPayload {
    pub file_id: String,
    pub chunk_index: u32,
    /// Chunk bytes, base64.
    pub data: String,
}

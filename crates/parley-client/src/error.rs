use thiserror::Error;

use parley_shared::error::{CryptoError, ProtocolError};

/// Misuse or failure of one pairwise secure channel.
#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("No local key material generated yet")]
    NoLocalKey,

    #[error("Channel not established: no shared key with this peer")]
    NotEstablished,

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Chunk payload is not valid base64")]
    ChunkEncoding,

    #[error("File too large: {0} chunks")]
    TooLarge(u64),

    #[error("File read failed: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum SessionError {
    /// Local key material could not be acquired; the session cannot start.
    #[error("Failed to acquire local key material: {0}")]
    KeyMaterial(CryptoError),

    #[error("Not joined to a room yet")]
    NotJoined,

    #[error("No peers connected")]
    NoPeers,

    #[error("Unknown message: {0}")]
    UnknownMessage(String),

    #[error("Signaling connection closed")]
    SignalingClosed,

    #[error("Session loop has stopped")]
    SessionClosed,

    #[error("Signaling connection failed: {0}")]
    Signaling(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Transfer error: {0}")]
    Transfer(#[from] TransferError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ParleyError {
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Decryption failed: invalid ciphertext or wrong key")]
    DecryptionFailed,

    #[error("Invalid key length")]
    InvalidKeyLength,

    #[error("Failed to acquire key material: {0}")]
    KeyGeneration(String),

    #[error("Invalid base64 payload: {0}")]
    Encoding(#[from] base64::DecodeError),
}

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Envelope is not valid UTF-8")]
    NotUtf8,

    #[error("Missing field: {0}")]
    MissingField(&'static str),
}

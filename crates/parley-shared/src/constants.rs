/// Application name
pub const APP_NAME: &str = "Parley";

/// XChaCha20-Poly1305 nonce size in bytes
pub const NONCE_SIZE: usize = 24;

/// X25519 public key size in bytes
pub const PUBKEY_SIZE: usize = 32;

/// Symmetric key size in bytes (for XChaCha20-Poly1305)
pub const SYMMETRIC_KEY_SIZE: usize = 32;

/// File chunk size in bytes (16 KiB, safe for message-oriented data channels)
pub const CHUNK_SIZE: usize = 16 * 1024;

/// A short pause is inserted after every this many chunks
pub const PACE_EVERY_CHUNKS: u32 = 10;

/// Length of the pacing pause in milliseconds
pub const PACE_DELAY_MS: u64 = 10;

/// Display-name announcements sent after a link opens
pub const NAME_ANNOUNCE_ATTEMPTS: u32 = 3;

/// Spacing between display-name announcements in milliseconds
pub const NAME_ANNOUNCE_INTERVAL_MS: u64 = 300;

/// Advisory mesh size; the relay does not enforce it
pub const RECOMMENDED_ROOM_SIZE: usize = 4;

/// Default signaling port
pub const DEFAULT_SIGNALING_PORT: u16 = 3001;

/// MIME type used when the sender declares none
pub const DEFAULT_FILE_TYPE: &str = "application/octet-stream";

/// Key derivation context (BLAKE3)
pub const KDF_CONTEXT_PEER_KEY: &str = "parley-peer-key-v1";

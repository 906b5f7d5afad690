//! Client configuration loaded from environment variables.

use std::time::Duration;

use parley_shared::constants::{
    CHUNK_SIZE, DEFAULT_SIGNALING_PORT, PACE_DELAY_MS, PACE_EVERY_CHUNKS, RECOMMENDED_ROOM_SIZE,
};

use crate::retry::RetryPolicy;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// WebSocket URL of the signaling relay.
    /// Env: `PARLEY_SIGNALING_URL`
    /// Default: `ws://127.0.0.1:3001/ws`
    pub signaling_url: String,

    /// Plaintext bytes per file chunk.
    /// Env: `PARLEY_CHUNK_SIZE`
    /// Default: `16384`
    pub chunk_size: usize,

    /// Pause after every `pace_every` chunks sent to one peer.
    pub pace_every: u32,
    pub pace_delay: Duration,

    /// Repetition of the display-name announcement after a link opens.
    pub name_announce: RetryPolicy,

    /// Member count above which a notice warns that the mesh may degrade.
    /// Nothing is refused.
    pub room_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            signaling_url: format!("ws://127.0.0.1:{DEFAULT_SIGNALING_PORT}/ws"),
            chunk_size: CHUNK_SIZE,
            pace_every: PACE_EVERY_CHUNKS,
            pace_delay: Duration::from_millis(PACE_DELAY_MS),
            name_announce: RetryPolicy::default(),
            room_capacity: RECOMMENDED_ROOM_SIZE,
        }
    }
}

impl ClientConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(url) = lookup("PARLEY_SIGNALING_URL") {
            if url.starts_with("ws://") || url.starts_with("wss://") {
                config.signaling_url = url;
            } else {
                tracing::warn!(value = %url, "PARLEY_SIGNALING_URL is not a ws:// URL, using default");
            }
        }

        if let Some(val) = lookup("PARLEY_CHUNK_SIZE") {
            match val.parse::<usize>() {
                Ok(n) if n > 0 => config.chunk_size = n,
                _ => tracing::warn!(value = %val, "Invalid PARLEY_CHUNK_SIZE, using default"),
            }
        }

        config
    }
}

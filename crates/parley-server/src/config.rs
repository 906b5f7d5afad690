//! Server configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the relay can start with zero
//! configuration for local development.

use std::net::SocketAddr;

use parley_shared::constants::DEFAULT_SIGNALING_PORT;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP + WebSocket listener.
    /// Env: `BIND_ADDR`
    /// Default: `0.0.0.0:3001`
    pub bind_addr: SocketAddr,

    /// Outbound envelopes buffered per session before new ones are dropped.
    /// Env: `SESSION_QUEUE_DEPTH`
    /// Default: `64`
    pub session_queue_depth: usize,

    /// Largest inbound WebSocket frame accepted, in bytes.
    /// Env: `MAX_ENVELOPE_BYTES`
    /// Default: `65536`
    pub max_envelope_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: ([0, 0, 0, 0], DEFAULT_SIGNALING_PORT).into(),
            session_queue_depth: 64,
            max_envelope_bytes: 64 * 1024,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(addr) = lookup("BIND_ADDR") {
            match addr.parse::<SocketAddr>() {
                Ok(parsed) => config.bind_addr = parsed,
                Err(_) => tracing::warn!(value = %addr, "Invalid BIND_ADDR, using default"),
            }
        }

        if let Some(val) = lookup("SESSION_QUEUE_DEPTH") {
            match val.parse::<usize>() {
                Ok(n) if n > 0 => config.session_queue_depth = n,
                _ => tracing::warn!(value = %val, "Invalid SESSION_QUEUE_DEPTH, using default"),
            }
        }

        if let Some(val) = lookup("MAX_ENVELOPE_BYTES") {
            match val.parse::<usize>() {
                Ok(n) if n > 0 => config.max_envelope_bytes = n,
                _ => tracing::warn!(value = %val, "Invalid MAX_ENVELOPE_BYTES, using default"),
            }
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so we do not store it here.

        config
    }
}

//! Per-peer secure channel.
//!
//! Every remote participant gets its own key pair and, once their public
//! key arrives, its own shared key. Nothing here is shared between peers,
//! so one compromised link exposes nothing about another.

use tracing::debug;

use parley_shared::crypto::{self, KeyPair, SymmetricKey};

use crate::error::ChannelError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Our public key has not been transmitted yet.
    NoKey,
    /// Our public key is on the wire; waiting for the peer's.
    KeySent,
    /// Shared key derived; encrypt/decrypt available.
    Established,
}

pub struct SecureChannel {
    state: ChannelState,
    local: Option<KeyPair>,
    peer_public: Option<Vec<u8>>,
    shared_key: Option<SymmetricKey>,
}

impl SecureChannel {
    pub fn new() -> Self {
        Self {
            state: ChannelState::NoKey,
            local: None,
            peer_public: None,
            shared_key: None,
        }
    }

    /// Generate local key material. Keeps an existing key pair, since
    /// replacing it would invalidate a key the peer may already hold.
    pub fn generate_key_pair(&mut self) -> Result<(), ChannelError> {
        if self.local.is_none() {
            self.local = Some(KeyPair::generate()?);
        }
        Ok(())
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn is_established(&self) -> bool {
        self.state == ChannelState::Established
    }

    /// Base64 public key for a `key-exchange` envelope.
    pub fn export_public_key(&self) -> Result<String, ChannelError> {
        let local = self.local.as_ref().ok_or(ChannelError::NoLocalKey)?;
        Ok(crypto::to_base64(&local.public_key_bytes()))
    }

    pub fn mark_key_sent(&mut self) {
        if self.state == ChannelState::NoKey {
            self.state = ChannelState::KeySent;
        }
    }

    /// Derive the shared key from the peer's base64 public key.
    ///
    /// Repeating the call with the same key is harmless; a different key
    /// (the peer rebuilt its channel) replaces the old shared key.
    pub fn derive_shared_key(&mut self, peer_public_b64: &str) -> Result<(), ChannelError> {
        let local = self.local.as_ref().ok_or(ChannelError::NoLocalKey)?;
        let peer_public = crypto::from_base64(peer_public_b64)?;

        if self.is_established() && self.peer_public.as_deref() == Some(peer_public.as_slice()) {
            return Ok(());
        }
        if self.peer_public.is_some() {
            debug!("Peer presented a new public key, re-deriving");
        }

        let key = local.derive_shared_key(&peer_public)?;
        self.shared_key = Some(key);
        self.peer_public = Some(peer_public);
        self.state = ChannelState::Established;
        Ok(())
    }

    /// Encrypt and base64-encode for a `data` field.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<String, ChannelError> {
        let key = self.shared_key.as_ref().ok_or(ChannelError::NotEstablished)?;
        let sealed = crypto::encrypt(key, plaintext)?;
        Ok(crypto::to_base64(&sealed))
    }

    pub fn decrypt(&self, data: &str) -> Result<Vec<u8>, ChannelError> {
        let key = self.shared_key.as_ref().ok_or(ChannelError::NotEstablished)?;
        let sealed = crypto::from_base64(data)?;
        Ok(crypto::decrypt(key, &sealed)?)
    }
}

impl Default for SecureChannel {
    fn default() -> Self {
        Self::new()
    }
}

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use rand::RngCore;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::constants::{KDF_CONTEXT_PEER_KEY, NONCE_SIZE, PUBKEY_SIZE, SYMMETRIC_KEY_SIZE};
use crate::error::CryptoError;

pub type SymmetricKey = [u8; SYMMETRIC_KEY_SIZE];

/// X25519 key pair owned by exactly one pairwise channel.
#[derive(Clone)]
pub struct KeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl KeyPair {
    /// Draw a fresh key pair from the OS RNG, reporting entropy failure
    /// instead of panicking.
    pub fn generate() -> Result<Self, CryptoError> {
        let mut seed = [0u8; 32];
        rand::rngs::OsRng
            .try_fill_bytes(&mut seed)
            .map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;
        let secret = StaticSecret::from(seed);
        let public = PublicKey::from(&secret);
        Ok(Self { secret, public })
    }

    pub fn public_key_bytes(&self) -> [u8; PUBKEY_SIZE] {
        self.public.to_bytes()
    }

    /// Both sides arrive at the same key from their own secret and the
    /// other's public key.
    pub fn derive_shared_key(&self, peer_public: &[u8]) -> Result<SymmetricKey, CryptoError> {
        let bytes: [u8; PUBKEY_SIZE] = peer_public
            .try_into()
            .map_err(|_| CryptoError::InvalidKeyLength)?;
        let shared = self.secret.diffie_hellman(&PublicKey::from(bytes));
        // Low-order points yield an all-zero secret.
        if !shared.was_contributory() {
            return Err(CryptoError::InvalidKeyLength);
        }
        let mut hasher = blake3::Hasher::new_derive_key(KDF_CONTEXT_PEER_KEY);
        hasher.update(shared.as_bytes());
        Ok(*hasher.finalize().as_bytes())
    }
}

pub fn generate_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    nonce
}

// Returns nonce || ciphertext (24 bytes nonce prepended)
pub fn encrypt(key: &SymmetricKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new(key.into());
    let nonce_bytes = generate_nonce();
    let nonce = XNonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| CryptoError::EncryptionFailed)?;

    let mut output = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    output.extend_from_slice(&nonce_bytes);
    output.extend_from_slice(&ciphertext);
    Ok(output)
}

pub fn decrypt(key: &SymmetricKey, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if data.len() < NONCE_SIZE {
        return Err(CryptoError::DecryptionFailed);
    }

    let (nonce_bytes, ciphertext) = data.split_at(NONCE_SIZE);
    let cipher = XChaCha20Poly1305::new(key.into());
    let nonce = XNonce::from_slice(nonce_bytes);

    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| CryptoError::DecryptionFailed)
}

/// BLAKE3 content hash, lower-case hex.
pub fn content_hash(data: &[u8]) -> String {
    hex::encode(blake3::hash(data).as_bytes())
}

pub fn to_base64(data: &[u8]) -> String {
    BASE64.encode(data)
}

pub fn from_base64(text: &str) -> Result<Vec<u8>, CryptoError> {
    Ok(BASE64.decode(text)?)
}

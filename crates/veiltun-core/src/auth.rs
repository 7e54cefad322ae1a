//! Authentication Payload
//!
//! The first frame of every session: client identity serialized to JSON,
//! encrypted with AES in ECB mode with PKCS7 padding under a fixed key, then
//! wrapped by the obfuscation codec.
//!
//! # Security
//!
//! ECB under a static key is deterministic: identical identities produce
//! identical ciphertext and there is no forward secrecy. The relay expects
//! exactly this encoding, so it is kept for wire compatibility.

use crate::codec::{CodecError, Obfuscator};
use crate::config::Identity;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::{Aes128, Aes192, Aes256, Block};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// AES block size
const BLOCK_LEN: usize = 16;

/// Action sent with every new connection
pub const ACTION_NEW_CONNECT: &str = "new_connect";

/// Auth errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("Failed to serialize auth payload: {0}")]
    Serialize(String),

    #[error("Invalid AES key length: {0} (expected 16, 24 or 32)")]
    InvalidKeyLength(usize),

    #[error("Ciphertext is not a whole number of blocks ({0} bytes)")]
    Decrypt(usize),

    #[error("Invalid PKCS7 padding")]
    Padding,

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
}

/// JSON body of the auth frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthPayload {
    pub package: String,
    pub version: String,
    #[serde(rename = "SDK")]
    pub sdk: String,
    pub country: String,
    pub language: String,
    pub action: String,
}

impl AuthPayload {
    /// Payload for a new connection
    pub fn new_connect(identity: &Identity) -> Self {
        Self {
            package: identity.package.clone(),
            version: identity.version.clone(),
            sdk: identity.sdk.clone(),
            country: identity.country.clone(),
            language: identity.language.clone(),
            action: ACTION_NEW_CONNECT.to_string(),
        }
    }

    /// Serialize to JSON bytes
    pub fn to_json(&self) -> Result<Vec<u8>, AuthError> {
        serde_json::to_vec(self).map_err(|e| AuthError::Serialize(e.to_string()))
    }
}

/// AES-ECB cipher keyed by raw key bytes
#[derive(Clone)]
pub enum AuthCipher {
    Aes128(Aes128),
    Aes192(Aes192),
    Aes256(Aes256),
}

impl AuthCipher {
    /// Create from raw key bytes; key length selects the AES variant
    pub fn new(key: &[u8]) -> Result<Self, AuthError> {
        let cipher = match key.len() {
            16 => Aes128::new_from_slice(key).map(AuthCipher::Aes128),
            24 => Aes192::new_from_slice(key).map(AuthCipher::Aes192),
            32 => Aes256::new_from_slice(key).map(AuthCipher::Aes256),
            n => return Err(AuthError::InvalidKeyLength(n)),
        };
        cipher.map_err(|_| AuthError::InvalidKeyLength(key.len()))
    }

    /// PKCS7-pad and encrypt each block independently
    pub fn seal(&self, plaintext: &[u8]) -> Vec<u8> {
        let pad = BLOCK_LEN - plaintext.len() % BLOCK_LEN;
        let mut buf = Vec::with_capacity(plaintext.len() + pad);
        buf.extend_from_slice(plaintext);
        buf.resize(plaintext.len() + pad, pad as u8);

        for chunk in buf.chunks_exact_mut(BLOCK_LEN) {
            let block = Block::from_mut_slice(chunk);
            match self {
                AuthCipher::Aes128(c) => c.encrypt_block(block),
                AuthCipher::Aes192(c) => c.encrypt_block(block),
                AuthCipher::Aes256(c) => c.encrypt_block(block),
            }
        }
        buf
    }

    /// Decrypt each block and strip PKCS7 padding
    pub fn open(&self, ciphertext: &[u8]) -> Result<Vec<u8>, AuthError> {
        if ciphertext.is_empty() || ciphertext.len() % BLOCK_LEN != 0 {
            return Err(AuthError::Decrypt(ciphertext.len()));
        }

        let mut buf = ciphertext.to_vec();
        for chunk in buf.chunks_exact_mut(BLOCK_LEN) {
            let block = Block::from_mut_slice(chunk);
            match self {
                AuthCipher::Aes128(c) => c.decrypt_block(block),
                AuthCipher::Aes192(c) => c.decrypt_block(block),
                AuthCipher::Aes256(c) => c.decrypt_block(block),
            }
        }

        let pad = buf[buf.len() - 1] as usize;
        if pad == 0 || pad > BLOCK_LEN || buf[buf.len() - pad..].iter().any(|&b| b as usize != pad) {
            return Err(AuthError::Padding);
        }
        buf.truncate(buf.len() - pad);
        Ok(buf)
    }
}

impl std::fmt::Debug for AuthCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let bits = match self {
            AuthCipher::Aes128(_) => 128,
            AuthCipher::Aes192(_) => 192,
            AuthCipher::Aes256(_) => 256,
        };
        write!(f, "AuthCipher(AES-{}-ECB, [redacted])", bits)
    }
}

/// Build the wire-ready auth frame (length prefix + obfuscated ciphertext)
pub fn build_auth_frame(
    identity: &Identity,
    aes_key: &[u8],
    obfuscator: &Obfuscator,
) -> Result<Bytes, AuthError> {
    let cipher = AuthCipher::new(aes_key)?;
    let json = AuthPayload::new_connect(identity).to_json()?;
    let sealed = cipher.seal(&json);
    Ok(obfuscator.encode(&sealed)?)
}

/// Recover the auth payload from a frame body (without length prefix)
///
/// The relay-side inverse of [`build_auth_frame`].
pub fn open_auth_payload(
    body: &[u8],
    aes_key: &[u8],
    obfuscator: &Obfuscator,
) -> Result<AuthPayload, AuthError> {
    let cipher = AuthCipher::new(aes_key)?;
    let sealed = obfuscator.decode(body)?;
    let json = cipher.open(&sealed)?;
    serde_json::from_slice(&json).map_err(|e| AuthError::Serialize(e.to_string()))
}

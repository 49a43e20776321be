//! Credential vault: AES-256-GCM encryption of OAuth tokens at rest.
//!
//! Ciphertext is encoded as three hex fields separated by `:`
//! (`nonce:tag:ciphertext`) so structure can be validated before the
//! cryptographic check runs. Each call draws a fresh 128-bit nonce.

use std::fmt;

use aes_gcm::{
    AesGcm,
    aead::{AeadCore, AeadInPlace, KeyInit, OsRng, consts::U16},
    aes::Aes256,
};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// AES-256-GCM with a 128-bit nonce.
type VaultCipher = AesGcm<Aes256, U16>;

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 16;
pub const TAG_LEN: usize = 16;

const FIELD_SEPARATOR: char = ':';

/// Vault error types
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VaultError {
    #[error("invalid key length: expected {KEY_LEN} bytes, got {length}")]
    InvalidKeyLength { length: usize },
    #[error("key is not valid hex")]
    InvalidKeyEncoding,
    #[error("ciphertext must contain exactly three hex fields")]
    InvalidFormat,
    #[error("nonce must be {NONCE_LEN} bytes, got {length}")]
    InvalidNonceLength { length: usize },
    #[error("authentication tag must be {TAG_LEN} bytes, got {length}")]
    InvalidTagLength { length: usize },
    #[error("authentication failed: wrong key or tampered ciphertext")]
    AuthenticationFailure,
    #[error("encryption failed")]
    EncryptionFailed,
    #[error("decrypted payload is not valid UTF-8")]
    InvalidUtf8,
}

/// 256-bit vault key, wiped from memory on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct CryptoKey(Vec<u8>);

impl CryptoKey {
    /// Create a key from raw bytes; must be exactly 32 bytes.
    pub fn new(bytes: Vec<u8>) -> Result<Self, VaultError> {
        if bytes.len() != KEY_LEN {
            return Err(VaultError::InvalidKeyLength {
                length: bytes.len(),
            });
        }
        Ok(CryptoKey(bytes))
    }

    /// Parse a key from its 64-character hex form.
    pub fn from_hex(encoded: &str) -> Result<Self, VaultError> {
        let bytes = hex::decode(encoded.trim()).map_err(|_| VaultError::InvalidKeyEncoding)?;
        Self::new(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for CryptoKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CryptoKey([REDACTED])")
    }
}

fn cipher(key: &CryptoKey) -> Result<VaultCipher, VaultError> {
    VaultCipher::new_from_slice(key.as_bytes()).map_err(|_| VaultError::InvalidKeyLength {
        length: key.as_bytes().len(),
    })
}

/// Encrypt `plaintext` under `key`. Empty input yields empty output.
pub fn encrypt(plaintext: &str, key: &CryptoKey) -> Result<String, VaultError> {
    if plaintext.is_empty() {
        return Ok(String::new());
    }

    let cipher = cipher(key)?;
    let nonce = VaultCipher::generate_nonce(&mut OsRng);

    let mut buffer = plaintext.as_bytes().to_vec();
    let tag = cipher
        .encrypt_in_place_detached(&nonce, b"", &mut buffer)
        .map_err(|_| VaultError::EncryptionFailed)?;

    let encoded = format!(
        "{}{sep}{}{sep}{}",
        hex::encode(nonce),
        hex::encode(tag),
        hex::encode(&buffer),
        sep = FIELD_SEPARATOR
    );
    buffer.zeroize();
    Ok(encoded)
}

/// Decrypt a value produced by [`encrypt`].
pub fn decrypt(ciphertext: &str, key: &CryptoKey) -> Result<String, VaultError> {
    if ciphertext.is_empty() {
        return Ok(String::new());
    }

    let fields: Vec<&str> = ciphertext.split(FIELD_SEPARATOR).collect();
    let [nonce_hex, tag_hex, body_hex] = fields.as_slice() else {
        return Err(VaultError::InvalidFormat);
    };

    let nonce_bytes = hex::decode(nonce_hex).map_err(|_| VaultError::InvalidFormat)?;
    let tag_bytes = hex::decode(tag_hex).map_err(|_| VaultError::InvalidFormat)?;
    let mut body = hex::decode(body_hex).map_err(|_| VaultError::InvalidFormat)?;

    let nonce: [u8; NONCE_LEN] =
        nonce_bytes
            .as_slice()
            .try_into()
            .map_err(|_| VaultError::InvalidNonceLength {
                length: nonce_bytes.len(),
            })?;
    let tag: [u8; TAG_LEN] =
        tag_bytes
            .as_slice()
            .try_into()
            .map_err(|_| VaultError::InvalidTagLength {
                length: tag_bytes.len(),
            })?;

    let cipher = cipher(key)?;
    cipher
        .decrypt_in_place_detached(&nonce.into(), b"", &mut body, &tag.into())
        .map_err(|_| VaultError::AuthenticationFailure)?;

    String::from_utf8(body).map_err(|_| VaultError::InvalidUtf8)
}

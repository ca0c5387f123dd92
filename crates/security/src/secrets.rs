//! Secrets encryption using AES-256-GCM.
//!
//! The key is the SHA-256 digest of a passphrase. Sealed values are stored
//! as base64 of `nonce || ciphertext` so they fit in a text column.

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit},
};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use sha2::{Digest, Sha256};

const NONCE_LEN: usize = 12;

/// An encrypted value with its nonce.
#[derive(Debug, Clone, PartialEq)]
pub struct EncryptedValue {
    /// Random nonce used for encryption
    pub nonce: Vec<u8>,
    /// The encrypted ciphertext, including the GCM tag
    pub ciphertext: Vec<u8>,
}

impl EncryptedValue {
    /// Base64 of `nonce || ciphertext`.
    pub fn encode(&self) -> String {
        let mut raw = Vec::with_capacity(self.nonce.len() + self.ciphertext.len());
        raw.extend_from_slice(&self.nonce);
        raw.extend_from_slice(&self.ciphertext);
        BASE64.encode(raw)
    }

    pub fn decode(sealed: &str) -> Result<Self, SecretError> {
        let raw = BASE64
            .decode(sealed.trim())
            .map_err(|e| SecretError::MalformedValue(e.to_string()))?;
        if raw.len() <= NONCE_LEN {
            return Err(SecretError::MalformedValue(format!(
                "sealed value is {} bytes, expected more than {NONCE_LEN}",
                raw.len()
            )));
        }
        let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
        Ok(Self {
            nonce: nonce.to_vec(),
            ciphertext: ciphertext.to_vec(),
        })
    }
}

/// Manages encryption/decryption of secrets.
pub struct SecretsManager {
    key: [u8; 32],
}

impl SecretsManager {
    /// Create a new SecretsManager from a passphrase.
    pub fn new(passphrase: &str) -> Self {
        Self {
            key: derive_key(passphrase),
        }
    }

    /// Create a SecretsManager from raw key bytes.
    pub fn from_key(key: [u8; 32]) -> Self {
        Self { key }
    }

    fn cipher(&self) -> Result<Aes256Gcm, SecretError> {
        Aes256Gcm::new_from_slice(&self.key).map_err(|e| SecretError::InvalidKey(e.to_string()))
    }

    /// Encrypt a plaintext string.
    pub fn encrypt(&self, plaintext: &str) -> Result<EncryptedValue, SecretError> {
        let nonce = generate_nonce();
        let ciphertext = self
            .cipher()?
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|e| SecretError::EncryptionFailed(e.to_string()))?;
        Ok(EncryptedValue {
            nonce: nonce.to_vec(),
            ciphertext,
        })
    }

    /// Decrypt an encrypted value back to plaintext.
    ///
    /// A wrong key fails tag verification.
    pub fn decrypt(&self, encrypted: &EncryptedValue) -> Result<String, SecretError> {
        if encrypted.nonce.len() != NONCE_LEN {
            return Err(SecretError::MalformedValue(format!(
                "nonce is {} bytes, expected {NONCE_LEN}",
                encrypted.nonce.len()
            )));
        }
        let plaintext = self
            .cipher()?
            .decrypt(
                Nonce::from_slice(&encrypted.nonce),
                encrypted.ciphertext.as_ref(),
            )
            .map_err(|e| SecretError::DecryptionFailed(e.to_string()))?;
        String::from_utf8(plaintext)
            .map_err(|_| SecretError::DecryptionFailed("Invalid UTF-8 after decryption".into()))
    }

    /// Encrypt and encode for storage.
    pub fn seal(&self, plaintext: &str) -> Result<String, SecretError> {
        Ok(self.encrypt(plaintext)?.encode())
    }

    /// Decode and decrypt a stored value.
    pub fn open(&self, sealed: &str) -> Result<String, SecretError> {
        self.decrypt(&EncryptedValue::decode(sealed)?)
    }
}

impl std::fmt::Debug for SecretsManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretsManager")
            .field("key", &"[REDACTED]")
            .finish()
    }
}

/// Errors from secrets operations.
#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Malformed sealed value: {0}")]
    MalformedValue(String),
}

fn derive_key(passphrase: &str) -> [u8; 32] {
    Sha256::digest(passphrase.as_bytes()).into()
}

/// Generate a random nonce.
fn generate_nonce() -> [u8; NONCE_LEN] {
    use rand::Rng;
    let mut rng = rand::rng();
    let mut nonce = [0u8; NONCE_LEN];
    rng.fill(&mut nonce[..]);
    nonce
}

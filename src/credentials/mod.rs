//! Library token storage
//!
//! Plex/Jellyfin tokens are stored encrypted at rest in the `libraries`
//! table. Encryption is AES-256-GCM with a key derived via HKDF-SHA256 from
//! a per-installation salt file, so a copied database is useless without the
//! data directory it came from.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use std::fs;
use std::path::PathBuf;
use thiserror::Error;

/// Salt filename inside the data directory
const SALT_FILENAME: &str = "credential_salt";

/// Length of the installation salt
const SALT_LENGTH: usize = 32;

/// Nonce length for AES-256-GCM
const NONCE_LENGTH: usize = 12;

/// HKDF info string binding derived keys to this use
const HKDF_INFO: &[u8] = b"telecast-library-token";

/// Errors that can occur during credential operations
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("Encryption error: {0}")]
    EncryptionError(String),

    #[error("Decryption error: {0}")]
    DecryptionError(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid data: {0}")]
    InvalidData(String),
}

/// Result type for credential operations
pub type Result<T> = std::result::Result<T, CredentialError>;

/// Encrypts and decrypts library tokens against an installation salt
pub struct CredentialManager {
    salt: [u8; SALT_LENGTH],
}

impl CredentialManager {
    /// Create a manager, generating the salt file on first use.
    ///
    /// The salt is stored base64-encoded so the file survives tools that
    /// mangle binary content (editors, config sync).
    pub fn new(data_dir: PathBuf) -> Result<Self> {
        let salt_path = data_dir.join(SALT_FILENAME);
        let salt = if salt_path.exists() {
            let encoded = fs::read_to_string(&salt_path)?;
            let bytes = BASE64
                .decode(encoded.trim())
                .map_err(|e| CredentialError::InvalidData(format!("salt file corrupt: {}", e)))?;
            if bytes.len() != SALT_LENGTH {
                return Err(CredentialError::InvalidData(format!(
                    "salt file has {} bytes, expected {}",
                    bytes.len(),
                    SALT_LENGTH
                )));
            }
            let mut salt = [0u8; SALT_LENGTH];
            salt.copy_from_slice(&bytes);
            salt
        } else {
            fs::create_dir_all(&data_dir)?;
            let mut salt = [0u8; SALT_LENGTH];
            rand::thread_rng().fill_bytes(&mut salt);
            fs::write(&salt_path, BASE64.encode(salt))?;
            salt
        };

        Ok(Self { salt })
    }

    /// Construct directly from salt bytes (test hook)
    #[cfg(test)]
    fn from_salt(salt: [u8; SALT_LENGTH]) -> Self {
        Self { salt }
    }

    fn derive_key(&self) -> [u8; 32] {
        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "telecast".to_string());

        let hk = Hkdf::<Sha256>::new(Some(&self.salt), hostname.as_bytes());
        let mut key = [0u8; 32];
        // 32-byte output cannot exceed HKDF-SHA256's limit
        hk.expand(HKDF_INFO, &mut key)
            .expect("HKDF expand with valid length");
        key
    }

    /// Encrypt a token. Output layout: nonce || ciphertext.
    pub fn encrypt(&self, plaintext: &str) -> Result<Vec<u8>> {
        let key = self.derive_key();
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| CredentialError::EncryptionError(e.to_string()))?;

        let mut nonce_bytes = [0u8; NONCE_LENGTH];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| CredentialError::EncryptionError(e.to_string()))?;

        let mut blob = Vec::with_capacity(NONCE_LENGTH + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    /// Decrypt a blob produced by [`encrypt`](Self::encrypt)
    pub fn decrypt(&self, blob: &[u8]) -> Result<String> {
        if blob.len() <= NONCE_LENGTH {
            return Err(CredentialError::InvalidData(
                "blob shorter than nonce".to_string(),
            ));
        }

        let key = self.derive_key();
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| CredentialError::DecryptionError(e.to_string()))?;

        let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LENGTH);
        let nonce = Nonce::from_slice(nonce_bytes);

        let plaintext = cipher
            .decrypt(nonce, ciphertext)
            .map_err(|e| CredentialError::DecryptionError(e.to_string()))?;

        String::from_utf8(plaintext)
            .map_err(|e| CredentialError::InvalidData(format!("token is not UTF-8: {}", e)))
    }
}

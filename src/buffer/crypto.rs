//! At-rest encryption for the disk spool.
//!
//! AES-256-GCM with a per-install key generated on first start. Spooled
//! payloads are `nonce || ciphertext`; an authentication failure on read
//! means the file is quarantined, never returned as-if-valid.

use aes_gcm::aead::{Aead, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Key, KeyInit, Nonce};
use std::io;
use std::path::Path;
use thiserror::Error;

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("spool payload shorter than the nonce prefix")]
    TooShort,
    #[error("authenticated decryption failed")]
    Aead,
    #[error("encryption failed")]
    Seal,
}

/// The spool's symmetric cipher.
#[derive(Clone)]
pub struct SpoolCipher {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for SpoolCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpoolCipher").finish_non_exhaustive()
    }
}

impl SpoolCipher {
    pub fn from_key(key: &[u8; KEY_LEN]) -> Self {
        let key = Key::<Aes256Gcm>::from_slice(key);
        Self { cipher: Aes256Gcm::new(key) }
    }

    /// Load the install key, generating one with `0600` permissions (and a
    /// `0700` parent directory) if it does not exist yet.
    pub fn load_or_generate(key_path: &Path) -> io::Result<Self> {
        if key_path.exists() {
            let bytes = std::fs::read(key_path)?;
            let key: [u8; KEY_LEN] = bytes.as_slice().try_into().map_err(|_| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!(
                        "spool key {} has {} bytes, expected {KEY_LEN}",
                        key_path.display(),
                        bytes.len()
                    ),
                )
            })?;
            return Ok(Self::from_key(&key));
        }

        let key = Aes256Gcm::generate_key(&mut OsRng);
        if let Some(parent) = key_path.parent() {
            std::fs::create_dir_all(parent)?;
            restrict_dir(parent)?;
        }
        std::fs::write(key_path, key.as_slice())?;
        restrict_file(key_path)?;
        tracing::info!(path = %key_path.display(), "generated new spool encryption key");
        Ok(Self { cipher: Aes256Gcm::new(&key) })
    }

    /// `nonce || ciphertext` for one serialized record.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| CryptoError::Seal)?;
        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(nonce.as_slice());
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    pub fn open(&self, payload: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if payload.len() < NONCE_LEN {
            return Err(CryptoError::TooShort);
        }
        let (nonce, ciphertext) = payload.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::Aead)
    }
}

#[cfg(unix)]
fn restrict_file(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
}

#[cfg(unix)]
fn restrict_dir(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
}

#[cfg(not(unix))]
fn restrict_file(_path: &Path) -> io::Result<()> {
    Ok(())
}

#[cfg(not(unix))]
fn restrict_dir(_path: &Path) -> io::Result<()> {
    Ok(())
}

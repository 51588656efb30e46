//! Encrypted ticket-system credentials.
//!
//! At rest: `salt (16) || nonce (12) || AES-256-GCM ciphertext`, with the key
//! derived from a passphrase by Argon2. The plaintext is the two-line
//! `username\npassword` record. In memory only the ciphertext and the cipher
//! are kept; `with_plaintext` decrypts into a scratch buffer that is zeroed
//! before returning.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use argon2::Argon2;
use rand::rngs::OsRng;
use rand::RngCore;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const SALT_SIZE: usize = 16;
pub const NONCE_SIZE: usize = 12;
const KEY_SIZE: usize = 32;

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("failed to access credentials at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("credential record is {0} bytes, shorter than salt and nonce")]
    Truncated(usize),

    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("decryption failed (wrong passphrase or corrupted record)")]
    Decrypt,

    #[error("encryption failed")]
    Encrypt,

    #[error("credential record must be two lines: username and password")]
    Malformed,
}

pub struct Credentials {
    salt: [u8; SALT_SIZE],
    nonce: [u8; NONCE_SIZE],
    ciphertext: Vec<u8>,
    cipher: Aes256Gcm,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials").field("ciphertext_len", &self.ciphertext.len()).finish_non_exhaustive()
    }
}

fn derive_cipher(passphrase: &str, salt: &[u8; SALT_SIZE]) -> Result<Aes256Gcm, CredentialError> {
    let mut key = [0u8; KEY_SIZE];
    Argon2::default()
        .hash_password_into(passphrase.as_bytes(), salt, &mut key)
        .map_err(|e| CredentialError::KeyDerivation(e.to_string()))?;
    let cipher = Aes256Gcm::new_from_slice(&key).map_err(|e| CredentialError::KeyDerivation(e.to_string()));
    key.fill(0);
    cipher
}

fn split_record(plain: &[u8]) -> Result<(&str, &str), CredentialError> {
    let text = std::str::from_utf8(plain).map_err(|_| CredentialError::Malformed)?;
    let mut lines = text.lines();
    match (lines.next(), lines.next()) {
        (Some(user), Some(pass)) if !user.is_empty() => Ok((user, pass)),
        _ => Err(CredentialError::Malformed),
    }
}

impl Credentials {
    /// Encrypt a fresh record under `passphrase` with a random salt and nonce.
    pub fn seal(username: &str, password: &str, passphrase: &str) -> Result<Self, CredentialError> {
        if username.is_empty() || password.is_empty() || username.contains('\n') || password.contains('\n') {
            return Err(CredentialError::Malformed);
        }
        let mut salt = [0u8; SALT_SIZE];
        let mut nonce = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut salt);
        OsRng.fill_bytes(&mut nonce);

        let cipher = derive_cipher(passphrase, &salt)?;
        let mut plain = format!("{}\n{}", username, password).into_bytes();
        let ciphertext = cipher.encrypt(Nonce::from_slice(&nonce), plain.as_ref());
        plain.fill(0);
        let ciphertext = ciphertext.map_err(|_| CredentialError::Encrypt)?;
        Ok(Self { salt, nonce, ciphertext, cipher })
    }

    /// Parse an at-rest record. The passphrase is checked immediately.
    pub fn from_bytes(data: &[u8], passphrase: &str) -> Result<Self, CredentialError> {
        if data.len() < SALT_SIZE + NONCE_SIZE {
            return Err(CredentialError::Truncated(data.len()));
        }
        let mut salt = [0u8; SALT_SIZE];
        let mut nonce = [0u8; NONCE_SIZE];
        salt.copy_from_slice(&data[..SALT_SIZE]);
        nonce.copy_from_slice(&data[SALT_SIZE..SALT_SIZE + NONCE_SIZE]);
        let cipher = derive_cipher(passphrase, &salt)?;
        let creds = Self { salt, nonce, ciphertext: data[SALT_SIZE + NONCE_SIZE..].to_vec(), cipher };
        creds.with_plaintext(|_, _| ())?;
        Ok(creds)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(SALT_SIZE + NONCE_SIZE + self.ciphertext.len());
        out.extend_from_slice(&self.salt);
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.ciphertext);
        out
    }

    pub fn open(path: &Path, passphrase: &str) -> Result<Self, CredentialError> {
        let data = std::fs::read(path).map_err(|source| CredentialError::Io { path: path.to_path_buf(), source })?;
        Self::from_bytes(&data, passphrase)
    }

    pub fn save(&self, path: &Path) -> Result<(), CredentialError> {
        std::fs::write(path, self.to_bytes()).map_err(|source| CredentialError::Io { path: path.to_path_buf(), source })
    }

    /// Run `f` with the decrypted username and password.
    pub fn with_plaintext<R>(&self, f: impl FnOnce(&str, &str) -> R) -> Result<R, CredentialError> {
        let mut plain = self
            .cipher
            .decrypt(Nonce::from_slice(&self.nonce), self.ciphertext.as_ref())
            .map_err(|_| CredentialError::Decrypt)?;
        let result = split_record(&plain).map(|(user, pass)| f(user, pass));
        plain.fill(0);
        result
    }
}

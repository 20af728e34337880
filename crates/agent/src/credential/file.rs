// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Encrypted-file credential backend.
//!
//! AES-256-GCM with a per-install random key. The key file is created with
//! mode 0600 inside a 0700 directory; writes are atomic (tmp + rename).

use std::path::{Path, PathBuf};

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

use super::{CredentialBackend, StoredCredentials};

const KEY_FILE: &str = "credentials.key";
const DATA_FILE: &str = "credentials.enc";

/// On-disk shape of the encrypted payload.
#[derive(Debug, Serialize, Deserialize)]
struct EncryptedPayload {
    nonce: String,
    ciphertext: String,
}

pub struct EncryptedFileBackend {
    dir: PathBuf,
}

impl EncryptedFileBackend {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn key_path(&self) -> PathBuf {
        self.dir.join(KEY_FILE)
    }

    fn data_path(&self) -> PathBuf {
        self.dir.join(DATA_FILE)
    }

    /// Load the install key, generating it on first use.
    fn load_or_create_key(&self) -> anyhow::Result<Key<Aes256Gcm>> {
        let path = self.key_path();
        if path.exists() {
            let encoded = std::fs::read_to_string(&path)?;
            let bytes = BASE64.decode(encoded.trim())?;
            anyhow::ensure!(bytes.len() == 32, "key file corrupt");
            return Ok(*Key::<Aes256Gcm>::from_slice(&bytes));
        }

        std::fs::create_dir_all(&self.dir)?;
        set_mode(&self.dir, 0o700)?;
        let key = Aes256Gcm::generate_key(OsRng);
        write_atomic(&path, BASE64.encode(key).as_bytes())?;
        set_mode(&path, 0o600)?;
        Ok(key)
    }
}

impl CredentialBackend for EncryptedFileBackend {
    fn name(&self) -> &'static str {
        "encrypted_file"
    }

    fn store(&self, credentials: &StoredCredentials) -> anyhow::Result<()> {
        let key = self.load_or_create_key()?;
        let cipher = Aes256Gcm::new(&key);
        let nonce = Aes256Gcm::generate_nonce(OsRng);
        let plaintext = serde_json::to_vec(credentials)?;
        let ciphertext = cipher
            .encrypt(&nonce, plaintext.as_slice())
            .map_err(|_| anyhow::anyhow!("encryption failed"))?;

        let payload = EncryptedPayload {
            nonce: BASE64.encode(nonce),
            ciphertext: BASE64.encode(ciphertext),
        };
        write_atomic(&self.data_path(), serde_json::to_string(&payload)?.as_bytes())?;
        set_mode(&self.data_path(), 0o600)?;
        Ok(())
    }

    fn retrieve(&self) -> anyhow::Result<Option<StoredCredentials>> {
        let path = self.data_path();
        if !path.exists() {
            return Ok(None);
        }
        let key = self.load_or_create_key()?;
        let cipher = Aes256Gcm::new(&key);

        let payload: EncryptedPayload = serde_json::from_str(&std::fs::read_to_string(&path)?)?;
        let nonce_bytes = BASE64.decode(&payload.nonce)?;
        anyhow::ensure!(nonce_bytes.len() == 12, "credential file corrupt");
        let ciphertext = BASE64.decode(&payload.ciphertext)?;
        let plaintext = cipher
            .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_slice())
            .map_err(|_| anyhow::anyhow!("decryption failed: wrong key or corrupt file"))?;

        Ok(Some(serde_json::from_slice(&plaintext)?))
    }

    fn delete(&self) -> anyhow::Result<()> {
        let path = self.data_path();
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        Ok(())
    }

    fn exists(&self) -> bool {
        self.data_path().exists()
    }
}

/// Write via tmp + rename so readers never see a partial file.
fn write_atomic(path: &Path, contents: &[u8]) -> anyhow::Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, contents)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> anyhow::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_mode(mode);
    std::fs::set_permissions(path, perms)?;
    Ok(())
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> anyhow::Result<()> {
    Ok(())
}

#[cfg(test)]
#[path = "file_tests.rs"]
mod tests;

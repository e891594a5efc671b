//! Credential and keyring manager.
//!
//! Key material lives in three places with different owners: encrypted bytes
//! in the state map (for peer propagation), a 0600 file per key on every
//! gateway that needs it, and the engine's keyring referencing that file
//! under a deterministic name. This module owns the full lifecycle; nothing
//! here ever logs plaintext and the plaintext containers zero themselves on
//! drop.

use crate::{
    state::records::{KeyKind, KeyRecord},
    tgt::{TgtClient, TgtError},
};
use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm,
    Nonce,
};
use rand::RngCore;
use sha2::{Digest, Sha256};
use snafu::{ResultExt, Snafu};
use std::{
    io::Write,
    path::{Path, PathBuf},
};
use tracing::{debug, info, warn};
use zeroize::Zeroize;

/// Nonce length of AES-256-GCM.
const NONCE_LEN: usize = 12;

#[derive(Debug, Snafu)]
pub enum KeyringError {
    #[snafu(display("Key file io failure on '{}': {}", path, source))]
    FileIo {
        path: String,
        source: std::io::Error,
    },
    #[snafu(display("Failed to seal key material"))]
    Seal {},
    #[snafu(display("Failed to open sealed key material"))]
    Open {},
    #[snafu(display("Malformed sealed key record: {}", details))]
    Malformed { details: String },
    #[snafu(display("{}", source))]
    EngineKeyring { source: TgtError },
}

/// Plaintext key material. Redacted in Debug output and zeroed on drop so it
/// can neither leak through logs nor linger in freed memory.
pub struct KeySecret(String);

impl KeySecret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl Drop for KeySecret {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl std::fmt::Debug for KeySecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("KeySecret(<hidden>)")
    }
}

/// Static shape check of a key presented over the API. Only the framing is
/// checked here, the engine rejects bad key bytes itself.
pub fn validate_key(kind: KeyKind, secret: &KeySecret) -> Result<(), String> {
    let value = secret.expose();
    let prefix = match kind {
        KeyKind::Psk => "NVMeTLSkey-1:",
        KeyKind::Dhchap | KeyKind::DhchapCtrlr => "DHHC-1:",
    };
    if !value.starts_with(prefix) {
        return Err(format!("{} key must start with '{}'", kind, prefix));
    }
    if !value.ends_with(':') {
        return Err(format!("{} key must end with ':'", kind));
    }
    // prefix, two digit hash id, base64 body
    let body: Vec<&str> = value.split(':').collect();
    if body.len() != 4 || body[1].len() != 2 || body[2].is_empty() {
        return Err(format!("{} key is not in the expected format", kind));
    }
    Ok(())
}

fn digest8(input: &str) -> String {
    hex::encode(&md5::compute(input.as_bytes())[.. 4])
}

/// Deterministic name of a key inside the engine's keyring; identical on
/// every gateway so peers converge on the same configuration.
pub fn engine_key_name(kind: KeyKind, nqn: &str, host_nqn: &str) -> String {
    format!("{}_{}_{}", kind, digest8(nqn), digest8(host_nqn))
}

pub struct Keyring {
    base_dir: PathBuf,
    cipher: Aes256Gcm,
}

impl Keyring {
    /// `group_secret` is the gateway-group shared secret the state map copies
    /// are sealed under; it is folded to the AEAD key size by hashing.
    pub fn new(base_dir: impl Into<PathBuf>, group_secret: &[u8]) -> Self {
        let key = Sha256::digest(group_secret);
        let cipher = Aes256Gcm::new_from_slice(&key)
            .expect("SHA-256 digest always matches the AES-256 key size");
        Self {
            base_dir: base_dir.into(),
            cipher,
        }
    }

    /// Per subsystem key directory, `<base>/<kind>_<nqn>`.
    pub fn subsystem_dir(&self, kind: KeyKind, nqn: &str) -> PathBuf {
        self.base_dir.join(format!("{}_{}", kind, nqn))
    }

    /// Path of one key file.
    pub fn key_file(&self, kind: KeyKind, nqn: &str, host_nqn: &str) -> PathBuf {
        self.subsystem_dir(kind, nqn)
            .join(format!("{}.key", digest8(host_nqn)))
    }

    /// Seal plaintext for the state map.
    pub fn seal(
        &self,
        nqn: &str,
        host_nqn: &str,
        kind: KeyKind,
        secret: &KeySecret,
    ) -> Result<KeyRecord, KeyringError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(nonce, secret.expose().as_bytes())
            .map_err(|_| KeyringError::Seal {})?;
        Ok(KeyRecord {
            nqn: nqn.to_string(),
            host_nqn: host_nqn.to_string(),
            kind,
            nonce: hex::encode(nonce_bytes),
            ciphertext: hex::encode(ciphertext),
        })
    }

    /// Open a sealed record back into plaintext.
    pub fn open(&self, record: &KeyRecord) -> Result<KeySecret, KeyringError> {
        let nonce_bytes =
            hex::decode(&record.nonce).map_err(|e| KeyringError::Malformed {
                details: e.to_string(),
            })?;
        if nonce_bytes.len() != NONCE_LEN {
            return Err(KeyringError::Malformed {
                details: format!("nonce length {}", nonce_bytes.len()),
            });
        }
        let ciphertext = hex::decode(&record.ciphertext).map_err(|e| {
            KeyringError::Malformed {
                details: e.to_string(),
            }
        })?;
        let mut plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_ref())
            .map_err(|_| KeyringError::Open {})?;
        let secret = KeySecret::new(
            String::from_utf8(plaintext.clone()).map_err(|_| {
                KeyringError::Malformed {
                    details: "key is not utf-8".to_string(),
                }
            })?,
        );
        plaintext.zeroize();
        Ok(secret)
    }

    /// Write the key file (0600) and register it with the engine keyring.
    /// Returns the deterministic engine key name.
    pub async fn install(
        &self,
        tgt: &TgtClient,
        nqn: &str,
        host_nqn: &str,
        kind: KeyKind,
        secret: &KeySecret,
    ) -> Result<String, KeyringError> {
        let path = self.key_file(kind, nqn, host_nqn);
        self.write_key_file(&path, secret)?;

        let name = engine_key_name(kind, nqn, host_nqn);
        tgt.keyring_add_key(&name, &path.display().to_string())
            .await
            .context(EngineKeyringSnafu)?;
        debug!("Installed {} key for host on subsystem {}", kind, nqn);
        Ok(name)
    }

    fn write_key_file(
        &self,
        path: &Path,
        secret: &KeySecret,
    ) -> Result<(), KeyringError> {
        use std::os::unix::fs::OpenOptionsExt;

        let dir = path.parent().expect("key file always has a directory");
        std::fs::create_dir_all(dir).context(FileIoSnafu {
            path: dir.display().to_string(),
        })?;
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .context(FileIoSnafu {
                path: path.display().to_string(),
            })?;
        file.write_all(secret.expose().as_bytes())
            .context(FileIoSnafu {
                path: path.display().to_string(),
            })?;
        Ok(())
    }

    /// Revoke the engine keyring entry, unlink the file and drop the
    /// subsystem directory when it became empty. Removal of a key that was
    /// never installed is a no-op.
    pub async fn remove(
        &self,
        tgt: &TgtClient,
        nqn: &str,
        host_nqn: &str,
        kind: KeyKind,
    ) -> Result<(), KeyringError> {
        let name = engine_key_name(kind, nqn, host_nqn);
        if let Err(err) = tgt.keyring_remove_key(&name).await {
            // the engine forgets keys on restart, a missing entry is fine
            if !matches!(
                err.source,
                jsonrpc::error::Error::RpcError {
                    code: jsonrpc::error::RpcCode::NotFound,
                    ..
                }
            ) {
                return Err(KeyringError::EngineKeyring { source: err });
            }
        }

        let path = self.key_file(kind, nqn, host_nqn);
        match std::fs::remove_file(&path) {
            Ok(()) => info!("Removed key file {}", path.display()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(KeyringError::FileIo {
                    path: path.display().to_string(),
                    source,
                })
            }
        }

        let dir = self.subsystem_dir(kind, nqn);
        if let Ok(mut entries) = std::fs::read_dir(&dir) {
            if entries.next().is_none() {
                if let Err(err) = std::fs::remove_dir(&dir) {
                    warn!(
                        "Could not remove empty key directory {}: {}",
                        dir.display(),
                        err
                    );
                }
            }
        }
        Ok(())
    }
}

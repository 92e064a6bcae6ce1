// Persistent access credentials for the embedded server

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// File name of the persisted record, scoped to the embedded service.
const STORE_NAME: &str = "embedded-service.json";

/// Errors from the credential store's persistence backend.
///
/// These are fatal to the calling operation; the store never retries.
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("credential store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("credential store is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// The persisted record. Field names are the wire names used on disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CredentialRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    secret: Option<String>,

    #[serde(rename = "nodePath", skip_serializing_if = "Option::is_none")]
    node_path: Option<PathBuf>,

    #[serde(rename = "autoStart", default)]
    auto_start: bool,
}

/// Persisted key-value store holding the generated access secret, the
/// node data path, and the auto-start preference.
///
/// The secret is generated once on first access and is stable across
/// restarts until [`CredentialStore::reset`] is called. No network or
/// process side effects.
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    /// Open (or create) the store inside the given data directory.
    pub fn open(data_dir: &Path) -> Result<Self, CredentialError> {
        fs::create_dir_all(data_dir)?;

        Ok(Self {
            path: data_dir.join(STORE_NAME),
        })
    }

    /// Return the stored secret, generating and persisting a fresh one on
    /// the first call. Idempotent: every later call returns the same value.
    pub fn get_or_create_secret(&self) -> Result<String, CredentialError> {
        let mut record = self.load()?;

        if let Some(secret) = record.secret {
            return Ok(secret);
        }

        let secret = generate_secret();
        debug!("generated new access secret");
        record.secret = Some(secret.clone());
        self.save(&record)?;

        Ok(secret)
    }

    /// The stored node data path, if any.
    pub fn node_path(&self) -> Result<Option<PathBuf>, CredentialError> {
        Ok(self.load()?.node_path)
    }

    pub fn set_node_path(&self, node_path: &Path) -> Result<(), CredentialError> {
        let mut record = self.load()?;
        record.node_path = Some(node_path.to_path_buf());
        self.save(&record)
    }

    /// Whether the embedded server should start with the application.
    pub fn auto_start(&self) -> Result<bool, CredentialError> {
        Ok(self.load()?.auto_start)
    }

    pub fn set_auto_start(&self, auto_start: bool) -> Result<(), CredentialError> {
        let mut record = self.load()?;
        record.auto_start = auto_start;
        self.save(&record)
    }

    /// Remove the persisted record entirely. The next
    /// [`CredentialStore::get_or_create_secret`] generates a fresh value.
    pub fn reset(&self) -> Result<(), CredentialError> {
        if self.path.exists() {
            fs::remove_file(&self.path)?;
        }
        Ok(())
    }

    fn load(&self) -> Result<CredentialRecord, CredentialError> {
        if !self.path.exists() {
            return Ok(CredentialRecord::default());
        }

        let raw = fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    fn save(&self, record: &CredentialRecord) -> Result<(), CredentialError> {
        let raw = serde_json::to_string_pretty(record)?;
        fs::write(&self.path, raw)?;
        Ok(())
    }
}

/// Generate a 32-byte cryptographically random secret, hex encoded.
fn generate_secret() -> String {
    use rand::RngCore;

    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

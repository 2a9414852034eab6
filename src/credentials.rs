//! Device credentials
//!
//! The token, device id and client id issued when the device was paired.
//! They are read once at service start and cleared when the bus rejects
//! them.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::CredentialError;
use crate::util::lock;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Credentials {
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub device_id: String,
    /// Operator client that receives the logout notice.
    #[serde(default)]
    pub client_id: String,
}

impl Credentials {
    pub fn is_empty(&self) -> bool {
        self.token.is_empty() && self.device_id.is_empty() && self.client_id.is_empty()
    }
}

pub trait CredentialStore: Send + Sync {
    /// Missing credentials load as empty strings, not as an error.
    fn load(&self) -> Result<Credentials, CredentialError>;

    fn save(&self, credentials: &Credentials) -> Result<(), CredentialError>;

    fn clear(&self) -> Result<(), CredentialError>;
}

/// Credentials kept as a JSON document on disk.
#[derive(Debug, Clone)]
pub struct FileCredentialStore {
    path: PathBuf,
}

impl FileCredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CredentialStore for FileCredentialStore {
    fn load(&self) -> Result<Credentials, CredentialError> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Credentials::default()),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, credentials: &Credentials) -> Result<(), CredentialError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, serde_json::to_vec_pretty(credentials)?)?;
        Ok(())
    }

    fn clear(&self) -> Result<(), CredentialError> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                info!(path = %self.path.display(), "credentials cleared");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    credentials: Mutex<Credentials>,
}

impl MemoryCredentialStore {
    pub fn new(credentials: Credentials) -> Self {
        Self {
            credentials: Mutex::new(credentials),
        }
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn load(&self) -> Result<Credentials, CredentialError> {
        Ok(lock(&self.credentials).clone())
    }

    fn save(&self, credentials: &Credentials) -> Result<(), CredentialError> {
        *lock(&self.credentials) = credentials.clone();
        Ok(())
    }

    fn clear(&self) -> Result<(), CredentialError> {
        *lock(&self.credentials) = Credentials::default();
        Ok(())
    }
}

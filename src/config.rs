//! Connection configuration.

use crate::error::{Result, StoreError};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};

/// Required length of an encryption key, in bytes.
pub const ENCRYPTION_KEY_LEN: usize = 64;

/// What to do when the stored schema version differs from the requested one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum MigrationPolicy {
    /// Refuse to open; the caller decides how to proceed.
    #[default]
    Reject,
    /// Drop stored entity types that left the schema and stamp the new version.
    Migrate,
    /// Wipe all stored data and start over.
    DeleteIfNeeded,
}

/// Store configuration.
#[derive(Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// Directory for the store files. `None` keeps everything in memory.
    pub path: Option<PathBuf>,

    /// Version of the schema the caller expects.
    pub schema_version: u64,

    /// Optional 64-byte key. Its fingerprint is bound to the store on creation.
    pub encryption_key: Option<Vec<u8>>,

    /// Behavior on schema version mismatch.
    pub migration: MigrationPolicy,

    /// Maximum encoded data size accepted on commit.
    pub max_file_size: Option<u64>,

    /// Max buffered raw events per subscription before it is dropped.
    /// Default: 1000
    pub subscription_buffer: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: None,
            schema_version: 0,
            encryption_key: None,
            migration: MigrationPolicy::Reject,
            max_file_size: None,
            subscription_buffer: 1000,
        }
    }
}

impl fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreConfig")
            .field("path", &self.path)
            .field("schema_version", &self.schema_version)
            .field("encryption_key", &self.encryption_key.as_ref().map(|_| "<redacted>"))
            .field("migration", &self.migration)
            .field("max_file_size", &self.max_file_size)
            .field("subscription_buffer", &self.subscription_buffer)
            .finish()
    }
}

impl StoreConfig {
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn at_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            ..Default::default()
        }
    }

    pub fn with_schema_version(mut self, version: u64) -> Self {
        self.schema_version = version;
        self
    }

    pub fn with_encryption_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.encryption_key = Some(key.into());
        self
    }

    pub fn with_migration(mut self, policy: MigrationPolicy) -> Self {
        self.migration = policy;
        self
    }

    pub fn with_max_file_size(mut self, bytes: u64) -> Self {
        self.max_file_size = Some(bytes);
        self
    }

    pub fn with_subscription_buffer(mut self, size: usize) -> Self {
        self.subscription_buffer = size;
        self
    }

    pub fn is_in_memory(&self) -> bool {
        self.path.is_none()
    }

    /// Location of the store, if path-backed.
    pub fn location(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Reject configurations no connection could be opened with.
    pub fn validate(&self) -> Result<()> {
        if let Some(key) = &self.encryption_key {
            if key.len() != ENCRYPTION_KEY_LEN {
                return Err(StoreError::Configuration(format!(
                    "encryption key must be {} bytes, got {}",
                    ENCRYPTION_KEY_LEN,
                    key.len()
                )));
            }
        }
        if self.max_file_size == Some(0) {
            return Err(StoreError::Configuration(
                "max_file_size must be greater than zero".into(),
            ));
        }
        if self.subscription_buffer == 0 {
            return Err(StoreError::Configuration(
                "subscription_buffer must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    /// Hex SHA-256 fingerprint of the encryption key, if any.
    pub(crate) fn key_fingerprint(&self) -> Option<String> {
        self.encryption_key.as_ref().map(|key| {
            let mut hasher = Sha256::new();
            hasher.update(key);
            hex::encode(hasher.finalize())
        })
    }
}

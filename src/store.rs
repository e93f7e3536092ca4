//! Durable storage seam for the sync engine.
//!
//! The engine persists an opaque byte blob through [`DurableStorage`];
//! transport and medium are the embedder's business. What this module does
//! own is the sealed envelope: magic bytes, schema version, and a blake3
//! payload checksum, so a torn or bit-rotted store is detected at load
//! instead of silently replaying garbage.

use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::warn;

pub const CURRENT_SCHEMA_VERSION: u32 = 1;
pub const STORE_MAGIC: &[u8; 4] = b"SGRD";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupted store: {reason}")]
    Corrupted { reason: &'static str },

    #[error("integrity check failed: expected {expected}, got {actual}")]
    IntegrityCheckFailed { expected: String, actual: String },

    #[error("schema version {found} is newer than supported {max}")]
    FutureSchema { found: u32, max: u32 },

    #[error("store too large: {size} bytes, max {max}")]
    StoreTooLarge { size: usize, max: usize },
}

impl From<ciborium::de::Error<std::io::Error>> for StoreError {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for StoreError {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

#[derive(Serialize, Deserialize, Debug)]
struct StoreEnvelope {
    magic: [u8; 4],
    schema_version: u32,
    checksum: [u8; 32],
    payload: Vec<u8>,
}

/// Wrap raw payload bytes in the integrity envelope.
pub fn seal(payload: &[u8]) -> Result<Vec<u8>, StoreError> {
    let checksum = blake3::hash(payload);
    let envelope = StoreEnvelope {
        magic: *STORE_MAGIC,
        schema_version: CURRENT_SCHEMA_VERSION,
        checksum: *checksum.as_bytes(),
        payload: payload.to_vec(),
    };
    let mut bytes = Vec::new();
    ciborium::into_writer(&envelope, &mut bytes)?;
    Ok(bytes)
}

/// Verify and strip the envelope, returning the payload bytes.
pub fn open(bytes: &[u8], max_bytes: usize) -> Result<Vec<u8>, StoreError> {
    if bytes.is_empty() {
        return Err(StoreError::Corrupted {
            reason: "empty store",
        });
    }
    if bytes.len() > max_bytes {
        return Err(StoreError::StoreTooLarge {
            size: bytes.len(),
            max: max_bytes,
        });
    }

    let envelope: StoreEnvelope = ciborium::from_reader(bytes)?;

    if envelope.magic != *STORE_MAGIC {
        return Err(StoreError::Corrupted {
            reason: "invalid magic bytes",
        });
    }
    if envelope.schema_version > CURRENT_SCHEMA_VERSION {
        return Err(StoreError::FutureSchema {
            found: envelope.schema_version,
            max: CURRENT_SCHEMA_VERSION,
        });
    }

    let actual = blake3::hash(&envelope.payload);
    if actual.as_bytes() != &envelope.checksum {
        return Err(StoreError::IntegrityCheckFailed {
            expected: hex::encode(envelope.checksum),
            actual: hex::encode(actual.as_bytes()),
        });
    }

    Ok(envelope.payload)
}

/// Key-addressed durable byte storage. Implementations must make `save`
/// atomic per key: a crash mid-save leaves either the old or the new value,
/// never a torn mix.
#[async_trait::async_trait]
pub trait DurableStorage: Send + Sync {
    async fn save(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError>;
    async fn load(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;
}

/// Filesystem-backed storage: one file per key under a root directory,
/// written tmp-then-rename with fsync so saves are atomic.
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        // Keys are caller-chosen identifiers, not paths.
        let safe: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.root.join(format!("{safe}.bin"))
    }

    fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
        let tmp_path = path.with_extension("tmp");

        let mut file = File::create(&tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;

        std::fs::rename(&tmp_path, path)?;

        // Best effort: the rename itself already happened.
        if let Some(parent) = path.parent() {
            match File::open(parent) {
                Ok(dir) => {
                    if let Err(e) = dir.sync_all() {
                        warn!("directory sync after rename failed: {e}");
                    }
                }
                Err(e) => warn!("could not open parent directory for sync: {e}"),
            }
        }

        Ok(())
    }
}

#[async_trait::async_trait]
impl DurableStorage for FileStorage {
    async fn save(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        Self::write_atomic(&self.path_for(key), bytes)
    }

    async fn load(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.path_for(key);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(std::fs::read(path)?))
    }
}

/// In-memory storage for tests and embedders without a filesystem.
#[derive(Default)]
pub struct MemoryStorage {
    entries: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl DurableStorage for MemoryStorage {
    async fn save(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        self.entries
            .write()
            .await
            .insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn load(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.entries.read().await.get(key).cloned())
    }
}

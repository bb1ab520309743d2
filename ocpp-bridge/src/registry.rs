//! Charge point registry
//!
//! A charge point may only open a session if the registry holds an entry for
//! its id. The gateway only reads; the router worker keeps the registry in
//! step with device lifecycle events.

use std::collections::{BTreeMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::ocpp::DeviceId;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("registry file {path} is corrupt: {source}")]
    Corrupt {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("registry write task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

pub type RegistryResult<T> = Result<T, RegistryError>;

/// Read access: is this charge point allowed to connect?
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Registry: Send + Sync {
    async fn exists(&self, id: &DeviceId) -> RegistryResult<bool>;
}

/// Write access used by lifecycle handling
#[async_trait]
pub trait RegistryWriter: Registry {
    /// Insert or refresh an entry
    async fn register(&self, id: &DeviceId, registered_at: DateTime<Utc>) -> RegistryResult<()>;

    /// Remove an entry; returns whether one existed
    async fn deregister(&self, id: &DeviceId) -> RegistryResult<bool>;
}

// ============================================================================
// In-memory registry
// ============================================================================

#[derive(Debug, Default)]
pub struct MemoryRegistry {
    ids: RwLock<HashSet<DeviceId>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_devices<I>(ids: I) -> Self
    where
        I: IntoIterator<Item = DeviceId>,
    {
        Self {
            ids: RwLock::new(ids.into_iter().collect()),
        }
    }

    pub fn len(&self) -> usize {
        self.ids.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.read().is_empty()
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    async fn exists(&self, id: &DeviceId) -> RegistryResult<bool> {
        Ok(self.ids.read().contains(id))
    }
}

#[async_trait]
impl RegistryWriter for MemoryRegistry {
    async fn register(&self, id: &DeviceId, _registered_at: DateTime<Utc>) -> RegistryResult<()> {
        self.ids.write().insert(id.clone());
        Ok(())
    }

    async fn deregister(&self, id: &DeviceId) -> RegistryResult<bool> {
        Ok(self.ids.write().remove(id))
    }
}

// ============================================================================
// File-backed registry
// ============================================================================

/// One registry record as stored on disk
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryEntry {
    pub registered_at: DateTime<Utc>,
}

type RegistryDocument = BTreeMap<String, RegistryEntry>;

/// Registry kept as a JSON document `{"<id>": {"registeredAt": ...}}`
///
/// Lookups read the file every time so that entries written by another
/// process are visible to the next connection attempt. Writes replace the file
/// atomically. A missing file is an empty registry.
#[derive(Debug)]
pub struct FileRegistry {
    path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl FileRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> RegistryResult<RegistryDocument> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Registry file {} does not exist yet", self.path.display());
                return Ok(RegistryDocument::new());
            }
            Err(source) => {
                return Err(RegistryError::Io {
                    path: self.path.display().to_string(),
                    source,
                })
            }
        };

        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(RegistryDocument::new());
        }

        serde_json::from_slice(&bytes).map_err(|source| RegistryError::Corrupt {
            path: self.path.display().to_string(),
            source,
        })
    }

    async fn store(&self, document: RegistryDocument) -> RegistryResult<()> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_atomically(&path, &document)).await?
    }
}

fn write_atomically(path: &Path, document: &RegistryDocument) -> RegistryResult<()> {
    let io_error = |source| RegistryError::Io {
        path: path.display().to_string(),
        source,
    };

    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir).map_err(io_error)?;

    let mut file = tempfile::NamedTempFile::new_in(dir).map_err(io_error)?;
    let bytes = serde_json::to_vec_pretty(document).map_err(|source| RegistryError::Corrupt {
        path: path.display().to_string(),
        source,
    })?;
    file.write_all(&bytes).map_err(io_error)?;
    file.as_file().sync_all().map_err(io_error)?;
    file.persist(path).map_err(|e| io_error(e.error))?;
    Ok(())
}

#[async_trait]
impl Registry for FileRegistry {
    async fn exists(&self, id: &DeviceId) -> RegistryResult<bool> {
        Ok(self.load().await?.contains_key(id.as_str()))
    }
}

#[async_trait]
impl RegistryWriter for FileRegistry {
    async fn register(&self, id: &DeviceId, registered_at: DateTime<Utc>) -> RegistryResult<()> {
        let _guard = self.write_lock.lock().await;
        let mut document = self.load().await?;
        document.insert(id.to_string(), RegistryEntry { registered_at });
        self.store(document).await
    }

    async fn deregister(&self, id: &DeviceId) -> RegistryResult<bool> {
        let _guard = self.write_lock.lock().await;
        let mut document = self.load().await?;
        if document.remove(id.as_str()).is_none() {
            return Ok(false);
        }
        self.store(document).await?;
        Ok(true)
    }
}

// ============================================================================
// Lifecycle events
// ============================================================================

/// Which lifecycle topic a record arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleKind {
    Created,
    Deleted,
}

/// Body of a device lifecycle event
///
/// Raw broker lifecycle events name the device `thingName`; rule-projected
/// records call it `chargePointId`. Both are accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleRecord {
    #[serde(alias = "thingName")]
    pub charge_point_id: DeviceId,

    /// Event time in epoch milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl LifecycleRecord {
    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.timestamp
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .unwrap_or_else(Utc::now)
    }
}

/// Apply one lifecycle record. Deleting an absent entry is not an error.
pub async fn apply_lifecycle(
    registry: &dyn RegistryWriter,
    kind: LifecycleKind,
    record: &LifecycleRecord,
) -> RegistryResult<()> {
    match kind {
        LifecycleKind::Created => {
            registry
                .register(&record.charge_point_id, record.occurred_at())
                .await?;
            info!("Registered charge point {}", record.charge_point_id);
        }
        LifecycleKind::Deleted => {
            if registry.deregister(&record.charge_point_id).await? {
                info!("Deregistered charge point {}", record.charge_point_id);
            } else {
                debug!(
                    "Charge point {} was not registered, nothing to delete",
                    record.charge_point_id
                );
            }
        }
    }
    Ok(())
}

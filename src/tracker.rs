//! Operation tracking: one record per operation, sealed exactly once.
//!
//! ```text
//!              ┌──▶ completed  (result file + duration)
//! processing ──┤
//!              └──▶ failed     (error message + duration)
//! ```
//!
//! A record is inserted before any work starts and updated once when the
//! operation ends. [`OperationRecord`] refuses a second transition, and
//! [`TrackedOperation`] is consumed by sealing, so callers cannot reopen a
//! finished operation.
//!
//! Persistence goes through [`OperationStore`], selected once at startup by
//! [`select_store`]. Store failures are logged and never fail an operation.

use crate::config::ToolkitConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// What an operation does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Merge,
    Split,
    Compress,
    Convert,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OperationKind::Merge => "merge",
            OperationKind::Split => "split",
            OperationKind::Compress => "compress",
            OperationKind::Convert => "convert",
        })
    }
}

/// Lifecycle state of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Processing,
    Completed,
    Failed,
}

impl OperationStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, OperationStatus::Processing)
    }
}

/// Declared properties of one input file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDescriptor {
    pub name: String,
    pub size: u64,
    pub media_type: String,
}

/// The artifact a completed operation points at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultFile {
    pub name: String,
    pub size: u64,
    pub url: String,
}

/// Persisted metadata for one operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationRecord {
    pub id: Uuid,
    pub kind: OperationKind,
    pub input_files: Vec<FileDescriptor>,
    /// Present iff `status == Completed`.
    #[serde(default)]
    pub result_file: Option<ResultFile>,
    pub status: OperationStatus,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub processing_time_ms: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Rejected state-machine transition.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("operation {id} is already {status:?}")]
    AlreadySealed { id: Uuid, status: OperationStatus },
}

impl OperationRecord {
    pub fn new(kind: OperationKind, input_files: Vec<FileDescriptor>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            kind,
            input_files,
            result_file: None,
            status: OperationStatus::Processing,
            error_message: None,
            processing_time_ms: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn complete(&mut self, result: ResultFile, elapsed: Duration) -> Result<(), TransitionError> {
        self.ensure_open()?;
        self.status = OperationStatus::Completed;
        self.result_file = Some(result);
        self.seal(elapsed);
        Ok(())
    }

    pub fn fail(&mut self, message: impl Into<String>, elapsed: Duration) -> Result<(), TransitionError> {
        self.ensure_open()?;
        self.status = OperationStatus::Failed;
        self.error_message = Some(message.into());
        self.seal(elapsed);
        Ok(())
    }

    fn ensure_open(&self) -> Result<(), TransitionError> {
        if self.status.is_terminal() {
            return Err(TransitionError::AlreadySealed {
                id: self.id,
                status: self.status,
            });
        }
        Ok(())
    }

    fn seal(&mut self, elapsed: Duration) {
        self.processing_time_ms = Some(elapsed.as_millis() as u64);
        self.updated_at = Utc::now();
    }
}

// ── Stores ───────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
    #[error("operation `{0}` already exists")]
    AlreadyExists(Uuid),
    #[error("operation `{0}` not found")]
    NotFound(Uuid),
}

/// Repository for operation records.
///
/// Implementations are synchronous; the tracker calls them from the
/// blocking pool.
pub trait OperationStore: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether records survive a restart.
    fn is_persistent(&self) -> bool {
        false
    }

    fn insert(&self, record: &OperationRecord) -> Result<(), StoreError>;

    fn update(&self, record: &OperationRecord) -> Result<(), StoreError>;

    fn get(&self, id: Uuid) -> Result<Option<OperationRecord>, StoreError>;
}

/// One pretty-printed JSON document per operation: `<dir>/<id>.json`.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|source| StoreError::Io {
            path: dir.clone(),
            source,
        })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: Uuid) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

impl OperationStore for JsonFileStore {
    fn name(&self) -> &'static str {
        "json-file"
    }

    fn is_persistent(&self) -> bool {
        true
    }

    fn insert(&self, record: &OperationRecord) -> Result<(), StoreError> {
        let path = self.path_for(record.id);
        let json = serde_json::to_vec_pretty(record)?;
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|source| match source.kind() {
                std::io::ErrorKind::AlreadyExists => StoreError::AlreadyExists(record.id),
                _ => StoreError::Io {
                    path: path.clone(),
                    source,
                },
            })?;
        file.write_all(&json).map_err(io_err(&path))?;
        Ok(())
    }

    fn update(&self, record: &OperationRecord) -> Result<(), StoreError> {
        let path = self.path_for(record.id);
        if !path.exists() {
            return Err(StoreError::NotFound(record.id));
        }
        // Atomic replace: write a sibling temp file then rename over.
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(record)?).map_err(io_err(&tmp))?;
        std::fs::rename(&tmp, &path).map_err(io_err(&path))?;
        Ok(())
    }

    fn get(&self, id: Uuid) -> Result<Option<OperationRecord>, StoreError> {
        let path = self.path_for(id);
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StoreError::Io { path, source }),
        }
    }
}

/// In-process store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<Uuid, OperationRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every record, oldest first.
    pub fn all(&self) -> Vec<OperationRecord> {
        let map = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let mut records: Vec<OperationRecord> = map.values().cloned().collect();
        records.sort_by_key(|r| r.created_at);
        records
    }
}

impl OperationStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn insert(&self, record: &OperationRecord) -> Result<(), StoreError> {
        let mut map = self.records.lock().unwrap_or_else(|e| e.into_inner());
        if map.contains_key(&record.id) {
            return Err(StoreError::AlreadyExists(record.id));
        }
        map.insert(record.id, record.clone());
        Ok(())
    }

    fn update(&self, record: &OperationRecord) -> Result<(), StoreError> {
        let mut map = self.records.lock().unwrap_or_else(|e| e.into_inner());
        match map.get_mut(&record.id) {
            Some(slot) => {
                *slot = record.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(record.id)),
        }
    }

    fn get(&self, id: Uuid) -> Result<Option<OperationRecord>, StoreError> {
        let map = self.records.lock().unwrap_or_else(|e| e.into_inner());
        Ok(map.get(&id).cloned())
    }
}

/// Tracking disabled: accepts everything, remembers nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStore;

impl OperationStore for NoopStore {
    fn name(&self) -> &'static str {
        "noop"
    }

    fn insert(&self, _record: &OperationRecord) -> Result<(), StoreError> {
        Ok(())
    }

    fn update(&self, _record: &OperationRecord) -> Result<(), StoreError> {
        Ok(())
    }

    fn get(&self, _id: Uuid) -> Result<Option<OperationRecord>, StoreError> {
        Ok(None)
    }
}

/// Pick the store for this process.
///
/// Disabled tracking → [`NoopStore`]; a tracking directory → [`JsonFileStore`]
/// (or [`NoopStore`] if the directory cannot be created); otherwise
/// [`MemoryStore`].
pub fn select_store(config: &ToolkitConfig) -> Arc<dyn OperationStore> {
    if config.tracking_disabled {
        info!("Operation tracking disabled");
        return Arc::new(NoopStore);
    }
    match &config.tracking_dir {
        Some(dir) => match JsonFileStore::open(dir) {
            Ok(store) => {
                info!("Tracking operations in {}", dir.display());
                Arc::new(store)
            }
            Err(e) => {
                warn!("Operation store unavailable, tracking disabled: {}", e);
                Arc::new(NoopStore)
            }
        },
        None => Arc::new(MemoryStore::new()),
    }
}

// ── Tracker ──────────────────────────────────────────────────────────────

/// Opens tracked operations against a store.
#[derive(Clone)]
pub struct OperationTracker {
    store: Arc<dyn OperationStore>,
}

impl fmt::Debug for OperationTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationTracker")
            .field("store", &self.store.name())
            .finish()
    }
}

impl OperationTracker {
    pub fn new(store: Arc<dyn OperationStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn OperationStore> {
        &self.store
    }

    /// Insert a `processing` record and start the clock.
    pub async fn open(&self, kind: OperationKind, inputs: Vec<FileDescriptor>) -> TrackedOperation {
        let record = OperationRecord::new(kind, inputs);
        debug!("Opened {} operation {}", kind, record.id);
        persist(&self.store, record.clone(), StoreWrite::Insert).await;
        TrackedOperation {
            record,
            store: self.store.clone(),
            started: Instant::now(),
        }
    }
}

/// A live operation. Sealing consumes it.
pub struct TrackedOperation {
    record: OperationRecord,
    store: Arc<dyn OperationStore>,
    started: Instant,
}

impl TrackedOperation {
    pub fn id(&self) -> Uuid {
        self.record.id
    }

    pub fn kind(&self) -> OperationKind {
        self.record.kind
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Seal as completed and persist.
    pub async fn complete(mut self, result: ResultFile) -> OperationRecord {
        let elapsed = self.elapsed();
        if let Err(e) = self.record.complete(result, elapsed) {
            warn!("{}", e);
        }
        info!(
            "{} operation {} completed in {}ms",
            self.record.kind,
            self.record.id,
            elapsed.as_millis()
        );
        persist(&self.store, self.record.clone(), StoreWrite::Update).await;
        self.record
    }

    /// Seal as failed and persist.
    pub async fn fail(mut self, message: impl Into<String>) -> OperationRecord {
        let elapsed = self.elapsed();
        let message = message.into();
        if let Err(e) = self.record.fail(message.clone(), elapsed) {
            warn!("{}", e);
        }
        warn!(
            "{} operation {} failed after {}ms: {}",
            self.record.kind,
            self.record.id,
            elapsed.as_millis(),
            message
        );
        persist(&self.store, self.record.clone(), StoreWrite::Update).await;
        self.record
    }
}

#[derive(Debug, Clone, Copy)]
enum StoreWrite {
    Insert,
    Update,
}

async fn persist(store: &Arc<dyn OperationStore>, record: OperationRecord, write: StoreWrite) {
    let store = store.clone();
    let id = record.id;
    let result = tokio::task::spawn_blocking(move || match write {
        StoreWrite::Insert => store.insert(&record),
        StoreWrite::Update => store.update(&record),
    })
    .await;

    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Failed to persist operation {} ({:?}): {}", id, write, e),
        Err(e) => warn!("Operation store task for {} panicked: {}", id, e),
    }
}

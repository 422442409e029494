//! Deferred, idempotent artifact removal.
//!
//! A single worker task owns a min-heap of [`CleanupEntry`]s ordered by due
//! time and is fed through an unbounded channel, so scheduling never blocks
//! and never fails the caller. The worker outlives the request that
//! scheduled an entry.
//!
//! ```text
//! schedule(paths, delay) ──▶ channel ──▶ worker ──(due)──▶ remove_path
//!                                          │
//!                     shutdown(Persist) ───┴──▶ manifest ──▶ next start()
//! ```
//!
//! Removal checks existence first and treats "already gone" as success, so
//! overlapping or repeated paths are harmless. Errors are logged only.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

/// Wake-up interval when nothing is pending.
const IDLE_TICK: Duration = Duration::from_secs(3600);

/// A path and the wall-clock time it becomes eligible for removal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupEntry {
    pub path: PathBuf,
    pub due_at: DateTime<Utc>,
}

/// What to do with entries still pending at shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShutdownMode {
    /// Remove everything now.
    Drain,
    /// Write pending entries to the manifest for the next start.
    #[default]
    Persist,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownReport {
    pub removed: usize,
    pub persisted: usize,
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct Pending {
    due: Instant,
    seq: u64,
    path: PathBuf,
    due_at: DateTime<Utc>,
}

enum Command {
    Schedule {
        paths: Vec<PathBuf>,
        delay: Duration,
    },
    Pending(oneshot::Sender<usize>),
    Shutdown {
        mode: ShutdownMode,
        reply: oneshot::Sender<ShutdownReport>,
    },
}

/// Handle to the process-wide cleanup worker.
///
/// Await [`CleanupScheduler::shutdown`] before the runtime stops. Dropping
/// the handle still persists pending entries, but only if the runtime keeps
/// running long enough for the worker to write the manifest. A runtime that
/// shuts down first cancels the worker and those entries are lost.
pub struct CleanupScheduler {
    tx: mpsc::UnboundedSender<Command>,
    worker: Mutex<Option<JoinHandle<()>>>,
    manifest: PathBuf,
}

impl std::fmt::Debug for CleanupScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CleanupScheduler")
            .field("manifest", &self.manifest)
            .finish()
    }
}

impl CleanupScheduler {
    /// Spawn the worker. Entries persisted in `manifest` by a previous
    /// shutdown are re-scheduled before anything else.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(manifest: impl Into<PathBuf>) -> Self {
        let manifest = manifest.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(run_worker(rx, manifest.clone()));
        Self {
            tx,
            worker: Mutex::new(Some(worker)),
            manifest,
        }
    }

    pub fn manifest_path(&self) -> &Path {
        &self.manifest
    }

    /// Remove `paths` once `delay` has elapsed. Returns immediately.
    pub fn schedule<I>(&self, paths: I, delay: Duration)
    where
        I: IntoIterator<Item = PathBuf>,
    {
        let paths: Vec<PathBuf> = paths.into_iter().collect();
        if paths.is_empty() {
            return;
        }
        debug!("Scheduling {} paths for cleanup in {:?}", paths.len(), delay);
        if self.tx.send(Command::Schedule { paths, delay }).is_err() {
            warn!("Cleanup worker is not running; paths will not be removed");
        }
    }

    /// Number of entries waiting for their due time.
    pub async fn pending(&self) -> usize {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::Pending(reply)).is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Stop the worker, draining or persisting whatever is still pending.
    pub async fn shutdown(&self, mode: ShutdownMode) -> ShutdownReport {
        let (reply, rx) = oneshot::channel();
        let report = if self.tx.send(Command::Shutdown { mode, reply }).is_ok() {
            rx.await.unwrap_or_default()
        } else {
            ShutdownReport::default()
        };

        let handle = self
            .worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Cleanup worker ended abnormally: {}", e);
            }
        }
        report
    }
}

impl Drop for CleanupScheduler {
    fn drop(&mut self) {
        let running = match self.worker.get_mut() {
            Ok(worker) => worker.is_some(),
            Err(poisoned) => poisoned.into_inner().is_some(),
        };
        if running {
            warn!(
                "Cleanup scheduler dropped without shutdown; pending entries are persisted to {} only if the runtime outlives the worker",
                self.manifest.display()
            );
        }
    }
}

async fn run_worker(mut rx: mpsc::UnboundedReceiver<Command>, manifest: PathBuf) {
    let mut heap: BinaryHeap<Reverse<Pending>> = BinaryHeap::new();
    let mut seq: u64 = 0;

    // ── Step 1: reload entries persisted by the previous process ──
    let restored = load_manifest(&manifest).await;
    if !restored.is_empty() {
        info!(
            "Restored {} pending cleanup entries from {}",
            restored.len(),
            manifest.display()
        );
    }
    let now_wall = Utc::now();
    let now = Instant::now();
    for entry in restored {
        let remaining = (entry.due_at - now_wall).to_std().unwrap_or(Duration::ZERO);
        heap.push(Reverse(Pending {
            due: now + remaining,
            seq,
            path: entry.path,
            due_at: entry.due_at,
        }));
        seq += 1;
    }

    // ── Step 2: serve commands and fire due entries ──
    loop {
        let deadline = heap
            .peek()
            .map(|Reverse(p)| p.due)
            .unwrap_or_else(|| Instant::now() + IDLE_TICK);

        tokio::select! {
            cmd = rx.recv() => match cmd {
                Some(Command::Schedule { paths, delay }) => {
                    let due = Instant::now() + delay;
                    let due_at = Utc::now()
                        + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
                    for path in paths {
                        heap.push(Reverse(Pending { due, seq, path, due_at }));
                        seq += 1;
                    }
                }
                Some(Command::Pending(reply)) => {
                    let _ = reply.send(heap.len());
                }
                Some(Command::Shutdown { mode, reply }) => {
                    let report = finish(heap, mode, &manifest).await;
                    let _ = reply.send(report);
                    return;
                }
                None => {
                    // Every handle dropped without an explicit shutdown.
                    finish(heap, ShutdownMode::Persist, &manifest).await;
                    return;
                }
            },
            _ = sleep_until(deadline) => {
                let now = Instant::now();
                let mut due = Vec::new();
                while heap.peek().is_some_and(|Reverse(p)| p.due <= now) {
                    if let Some(Reverse(p)) = heap.pop() {
                        due.push(p.path);
                    }
                }
                if !due.is_empty() {
                    let removed = remove_all(&due).await;
                    debug!("Cleanup tick removed {}/{} paths", removed, due.len());
                }
            }
        }
    }
}

async fn finish(heap: BinaryHeap<Reverse<Pending>>, mode: ShutdownMode, manifest: &Path) -> ShutdownReport {
    let entries: Vec<CleanupEntry> = heap
        .into_sorted_vec()
        .into_iter()
        .rev()
        .map(|Reverse(p)| CleanupEntry {
            path: p.path,
            due_at: p.due_at,
        })
        .collect();

    match mode {
        ShutdownMode::Drain => {
            let paths: Vec<PathBuf> = entries.into_iter().map(|e| e.path).collect();
            let removed = remove_all(&paths).await;
            info!("Cleanup drained: removed {} of {} pending paths", removed, paths.len());
            ShutdownReport {
                removed,
                persisted: 0,
            }
        }
        ShutdownMode::Persist => {
            let persisted = entries.len();
            match save_manifest(manifest, &entries).await {
                Ok(()) => {
                    if persisted > 0 {
                        info!("Persisted {} pending cleanup entries to {}", persisted, manifest.display());
                    }
                    ShutdownReport {
                        removed: 0,
                        persisted,
                    }
                }
                Err(e) => {
                    warn!(
                        "Could not persist cleanup manifest {} ({}); draining instead",
                        manifest.display(),
                        e
                    );
                    let paths: Vec<PathBuf> = entries.into_iter().map(|e| e.path).collect();
                    ShutdownReport {
                        removed: remove_all(&paths).await,
                        persisted: 0,
                    }
                }
            }
        }
    }
}

async fn load_manifest(path: &Path) -> Vec<CleanupEntry> {
    let bytes = match tokio::fs::read(path).await {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
        Err(e) => {
            warn!("Cannot read cleanup manifest {}: {}", path.display(), e);
            return Vec::new();
        }
    };
    let entries = match serde_json::from_slice::<Vec<CleanupEntry>>(&bytes) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("Ignoring malformed cleanup manifest {}: {}", path.display(), e);
            Vec::new()
        }
    };
    if let Err(e) = tokio::fs::remove_file(path).await {
        warn!("Cannot remove cleanup manifest {}: {}", path.display(), e);
    }
    entries
}

async fn save_manifest(path: &Path, entries: &[CleanupEntry]) -> std::io::Result<()> {
    if entries.is_empty() {
        return match tokio::fs::remove_file(path).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        };
    }
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let json = serde_json::to_vec_pretty(entries)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, json).await?;
    tokio::fs::rename(&tmp, path).await
}

async fn remove_all(paths: &[PathBuf]) -> usize {
    join_all(paths.iter().map(|p| remove_path(p)))
        .await
        .into_iter()
        .filter(|removed| *removed)
        .count()
}

/// Remove a file or directory tree if it exists.
///
/// Returns true when something was removed. A missing path is not an error.
pub async fn remove_path(path: &Path) -> bool {
    let meta = match tokio::fs::symlink_metadata(path).await {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("Cleanup: {} already gone", path.display());
            return false;
        }
        Err(e) => {
            warn!("Cleanup: cannot stat {}: {}", path.display(), e);
            return false;
        }
    };

    let result = if meta.is_dir() {
        tokio::fs::remove_dir_all(path).await
    } else {
        tokio::fs::remove_file(path).await
    };
    match result {
        Ok(()) => {
            debug!("Cleanup: removed {}", path.display());
            true
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
        Err(e) => {
            warn!("Cleanup: failed to remove {}: {}", path.display(), e);
            false
        }
    }
}

/// Remove every entry directly under `root` except those in `keep`.
///
/// Used at startup to clear artifacts a crashed process left behind.
pub async fn sweep_directory(root: &Path, keep: &[PathBuf]) -> usize {
    let mut dir = match tokio::fs::read_dir(root).await {
        Ok(d) => d,
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Sweep: cannot read {}: {}", root.display(), e);
            }
            return 0;
        }
    };

    let mut victims = Vec::new();
    loop {
        match dir.next_entry().await {
            Ok(Some(entry)) => {
                let path = entry.path();
                if !keep.iter().any(|k| k == &path) {
                    victims.push(path);
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!("Sweep: error listing {}: {}", root.display(), e);
                break;
            }
        }
    }

    let removed = remove_all(&victims).await;
    if removed > 0 {
        info!("Swept {} leftover entries from {}", removed, root.display());
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn removes_after_delay() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("artifact.pdf");
        std::fs::write(&file, b"x").unwrap();

        let scheduler = CleanupScheduler::start(dir.path().join("manifest.json"));
        scheduler.schedule([file.clone()], Duration::from_millis(150));
        settle().await;
        assert!(file.exists());
        assert_eq!(scheduler.pending().await, 1);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(!file.exists());
        assert_eq!(scheduler.pending().await, 0);
        scheduler.shutdown(ShutdownMode::Drain).await;
    }

    #[tokio::test]
    async fn missing_and_overlapping_paths_are_harmless() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("split_1");
        std::fs::create_dir(&nested).unwrap();
        let inner = nested.join("page_1.pdf");
        std::fs::write(&inner, b"x").unwrap();

        let scheduler = CleanupScheduler::start(dir.path().join("manifest.json"));
        scheduler.schedule(
            [
                dir.path().join("never-existed.pdf"),
                inner.clone(),
                nested.clone(),
                nested.clone(),
            ],
            Duration::from_millis(20),
        );
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert!(!nested.exists());
        assert_eq!(scheduler.pending().await, 0);
        scheduler.shutdown(ShutdownMode::Drain).await;
    }

    #[tokio::test]
    async fn drain_removes_pending_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("late.pdf");
        std::fs::write(&file, b"x").unwrap();

        let scheduler = CleanupScheduler::start(dir.path().join("manifest.json"));
        scheduler.schedule([file.clone()], Duration::from_secs(3600));
        let report = scheduler.shutdown(ShutdownMode::Drain).await;

        assert_eq!(report.removed, 1);
        assert!(!file.exists());
    }

    #[tokio::test]
    async fn persisted_entries_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = dir.path().join("manifest.json");
        let file = dir.path().join("keep-for-now.pdf");
        std::fs::write(&file, b"x").unwrap();

        let first = CleanupScheduler::start(&manifest);
        first.schedule([file.clone()], Duration::from_millis(200));
        let report = first.shutdown(ShutdownMode::Persist).await;
        assert_eq!(report.persisted, 1);
        assert!(manifest.exists());
        assert!(file.exists());

        let second = CleanupScheduler::start(&manifest);
        settle().await;
        assert!(!manifest.exists());
        assert_eq!(second.pending().await, 1);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!file.exists());
        second.shutdown(ShutdownMode::Persist).await;
        assert!(!manifest.exists());
    }

    #[tokio::test]
    async fn dropped_handle_persists_while_runtime_runs() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = dir.path().join("manifest.json");
        let file = dir.path().join("orphan.pdf");
        std::fs::write(&file, b"x").unwrap();

        let scheduler = CleanupScheduler::start(&manifest);
        scheduler.schedule([file.clone()], Duration::from_secs(3600));
        assert_eq!(scheduler.pending().await, 1);
        drop(scheduler);

        for _ in 0..40 {
            if manifest.exists() {
                break;
            }
            settle().await;
        }
        assert!(manifest.exists());
        assert!(file.exists());

        let restored = CleanupScheduler::start(&manifest);
        assert_eq!(restored.pending().await, 1);
        restored.shutdown(ShutdownMode::Drain).await;
        assert!(!file.exists());
    }

    #[tokio::test]
    async fn sweep_keeps_listed_entries() {
        let dir = tempfile::tempdir().unwrap();
        let keep = dir.path().join(".pending-cleanup.json");
        std::fs::write(&keep, b"[]").unwrap();
        std::fs::write(dir.path().join("old.pdf"), b"x").unwrap();
        std::fs::create_dir(dir.path().join("convert_old")).unwrap();

        let removed = sweep_directory(dir.path(), &[keep.clone()]).await;
        assert_eq!(removed, 2);
        assert!(keep.exists());
        assert_eq!(sweep_directory(&dir.path().join("absent"), &[]).await, 0);
    }
}

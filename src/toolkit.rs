//! Tracked operation entry points.
//!
//! Every operation follows the same shape:
//!
//! ```text
//! validate ──▶ tracker.open ──▶ stage inputs ──▶ transform ──▶ seal record
//!    │                                                            │
//!    └─ Err(Validation), nothing tracked          cleanup.schedule(all touched paths)
//! ```
//!
//! Validation failures return before a record exists. Once a record is open
//! it is sealed exactly once, and every path the operation created (staged
//! uploads, results, per-operation directories) is handed to the cleanup
//! scheduler whether the operation succeeded, failed or timed out.

use crate::cleanup::{sweep_directory, CleanupScheduler, ShutdownMode, ShutdownReport};
use crate::config::{ImageFormat, PageSelection, ToolkitConfig};
use crate::error::{OperationError, ToolkitError};
use crate::output::{
    format_file_size, ArtifactItem, CompressOutput, InspectOutput, ItemsOutput, MergeOutput,
};
use crate::pipeline::assemble;
use crate::pipeline::backends::default_backends;
use crate::pipeline::compress::{self, normalize_quality};
use crate::pipeline::input::{generate_unique_filename, InputFile, StagedInput};
use crate::pipeline::render::{RasterBackend, RasterEngine, RenderOptions};
use crate::progress::ProgressCallback;
use crate::tracker::{select_store, FileDescriptor, OperationKind, OperationTracker, ResultFile};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, error, info};
use uuid::Uuid;

/// Whether a rasterization backend can run in this environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendStatus {
    pub name: String,
    pub available: bool,
}

/// Health-check data: the raster chain and the tracking store in use.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capabilities {
    /// In fallback order.
    pub backends: Vec<BackendStatus>,
    pub tracking_store: String,
    pub tracking_persistent: bool,
}

/// Paths an operation touched. Shared with the tracked body so paths
/// registered before a failure or timeout are still cleaned up.
#[derive(Debug, Clone, Default)]
struct ArtifactSet(Arc<Mutex<Vec<PathBuf>>>);

impl ArtifactSet {
    fn add(&self, path: impl Into<PathBuf>) {
        self.0
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(path.into());
    }

    fn take(&self) -> Vec<PathBuf> {
        std::mem::take(&mut *self.0.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

/// Per-operation context handed to the tracked body.
struct Scope {
    id: Uuid,
    kind: OperationKind,
    started: Instant,
    artifacts: ArtifactSet,
}

impl Scope {
    fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    /// `{kind}_{id}`, the directory holding split/convert outputs.
    fn dir_name(&self) -> String {
        format!("{}_{}", self.kind, self.id.simple())
    }

    fn track_input(&self, staged: &StagedInput) {
        if staged.owned {
            self.artifacts.add(&staged.path);
        }
    }
}

/// The document operation pipeline: merge, split, compress, convert.
///
/// Owns the rasterization chain, the operation tracker and the cleanup
/// worker. Create one per process with [`Toolkit::start`] and call
/// [`Toolkit::shutdown`] before exit.
pub struct Toolkit {
    config: Arc<ToolkitConfig>,
    engine: RasterEngine,
    tracker: OperationTracker,
    cleanup: CleanupScheduler,
}

impl std::fmt::Debug for Toolkit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Toolkit")
            .field("upload_root", &self.config.upload_root)
            .field("engine", &self.engine)
            .field("tracker", &self.tracker)
            .finish()
    }
}

impl Toolkit {
    /// Start with the default pdfium → canvas → poppler chain.
    pub async fn start(config: ToolkitConfig) -> Result<Self, ToolkitError> {
        let backends = default_backends(&config);
        Self::with_raster_backends(config, backends).await
    }

    /// Start with an explicit raster fallback chain.
    pub async fn with_raster_backends(
        config: ToolkitConfig,
        backends: Vec<Arc<dyn RasterBackend>>,
    ) -> Result<Self, ToolkitError> {
        let root = config.upload_root.clone();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| ToolkitError::io(&root, e))?;

        let manifest = config.manifest_path();
        if config.sweep_on_start {
            let mut keep = vec![manifest.clone()];
            keep.extend(config.tracking_dir.clone());
            sweep_directory(&root, &keep).await;
        }

        let store = select_store(&config);
        let engine = RasterEngine::new(backends);
        info!(
            "pdf-toolkit ready: root={}, backends={:?}, store={}",
            root.display(),
            engine.backend_names(),
            store.name()
        );

        Ok(Self {
            engine,
            tracker: OperationTracker::new(store),
            cleanup: CleanupScheduler::start(manifest),
            config: Arc::new(config),
        })
    }

    /// Receive per-backend and per-page render events.
    pub fn with_progress(mut self, progress: ProgressCallback) -> Self {
        self.engine = self.engine.with_progress(progress);
        self
    }

    pub fn config(&self) -> &ToolkitConfig {
        &self.config
    }

    pub fn engine(&self) -> &RasterEngine {
        &self.engine
    }

    pub fn tracker(&self) -> &OperationTracker {
        &self.tracker
    }

    pub fn cleanup(&self) -> &CleanupScheduler {
        &self.cleanup
    }

    // ── Operations ───────────────────────────────────────────────────────

    /// Concatenate at least two PDFs in the given order.
    pub async fn merge(&self, inputs: Vec<InputFile>) -> Result<MergeOutput, OperationError> {
        let kind = OperationKind::Merge;
        if inputs.len() < 2 {
            return Err(OperationError::validation(
                "Please upload at least 2 PDF files to merge",
            ));
        }
        self.validate_all(kind, &inputs)?;
        let descriptors = inputs.iter().map(InputFile::descriptor).collect();

        self.tracked(kind, descriptors, |scope| async move {
            let root = &self.config.upload_root;
            let mut staged = Vec::with_capacity(inputs.len());
            for input in &inputs {
                let s = input.stage(root).await?;
                scope.track_input(&s);
                staged.push(s);
            }

            let (bytes, page_count) = blocking(move || {
                let documents = staged
                    .iter()
                    .map(StagedInput::load)
                    .collect::<Result<Vec<_>, _>>()?;
                let mut merged = assemble::merge(documents)?;
                let page_count = merged.get_pages().len() as u32;
                let bytes = assemble::save_to_bytes(&mut merged, "merged.pdf")?;
                Ok((bytes, page_count))
            })
            .await?;

            let result_name = generate_unique_filename("merged.pdf", "");
            let path = root.join(&result_name);
            scope.artifacts.add(&path);
            write_artifact(&path, &bytes).await?;
            info!("Merged {} files into {} ({} pages)", inputs.len(), result_name, page_count);

            let download_locator = self.config.locator(&result_name);
            let output = MergeOutput {
                operation_id: scope.id.to_string(),
                result_name: result_name.clone(),
                result_size: bytes.len() as u64,
                download_locator: download_locator.clone(),
                page_count,
                processing_duration_ms: scope.elapsed_ms(),
            };
            let result = ResultFile {
                name: result_name,
                size: bytes.len() as u64,
                url: download_locator,
            };
            Ok((output, result))
        })
        .await
    }

    /// Extract the selected pages into single-page PDFs.
    pub async fn split(
        &self,
        input: InputFile,
        selection: PageSelection,
    ) -> Result<ItemsOutput, OperationError> {
        let kind = OperationKind::Split;
        self.validate_all(kind, std::slice::from_ref(&input))?;

        self.tracked(kind, vec![input.descriptor()], |scope| async move {
            let root = &self.config.upload_root;
            let staged = input.stage(root).await?;
            scope.track_input(&staged);

            let dir_name = scope.dir_name();
            let out_dir = root.join(&dir_name);
            scope.artifacts.add(&out_dir);

            let dir = out_dir.clone();
            let written = blocking(move || {
                let document = staged.load()?;
                let pages = assemble::split(&document, &selection)?;
                std::fs::create_dir_all(&dir).map_err(|e| ToolkitError::io(&dir, e))?;

                let mut written = Vec::with_capacity(pages.len());
                for mut page in pages {
                    let name = page.file_name();
                    let bytes = assemble::save_to_bytes(&mut page.document, &name)?;
                    let path = dir.join(&name);
                    std::fs::write(&path, &bytes).map_err(|e| ToolkitError::io(&path, e))?;
                    written.push((name, bytes.len() as u64));
                }
                Ok(written)
            })
            .await?;
            info!("Split {} into {} files", input.name, written.len());

            let items = self.items_in(&dir_name, written);
            let result = self.directory_result(&dir_name, &items);
            let output = ItemsOutput {
                operation_id: scope.id.to_string(),
                items,
                processing_duration_ms: scope.elapsed_ms(),
                backend: None,
                format: None,
                skipped_pages: Vec::new(),
            };
            Ok((output, result))
        })
        .await
    }

    /// Reduce file size. `quality` in `[0, 1]`; None uses the configured default.
    ///
    /// The result is never larger than the input. When no strategy helps the
    /// original bytes are returned unchanged.
    pub async fn compress(
        &self,
        input: InputFile,
        quality: Option<f64>,
    ) -> Result<CompressOutput, OperationError> {
        let kind = OperationKind::Compress;
        self.validate_all(kind, std::slice::from_ref(&input))?;
        let default = self.config.default_quality;
        let quality = normalize_quality(quality.unwrap_or(default), default);

        self.tracked(kind, vec![input.descriptor()], |scope| async move {
            let root = &self.config.upload_root;
            let staged = input.stage(root).await?;
            scope.track_input(&staged);

            let outcome =
                compress::compress(&staged, quality, &self.engine, &self.config, root).await;

            let result_name = generate_unique_filename(&input.name, "_compressed");
            let path = root.join(&result_name);
            scope.artifacts.add(&path);
            write_artifact(&path, &outcome.bytes).await?;

            let download_locator = self.config.locator(&result_name);
            let output = CompressOutput {
                operation_id: scope.id.to_string(),
                result_name: result_name.clone(),
                original_size: outcome.original_size,
                compressed_size: outcome.compressed_size,
                compression_ratio_percent: outcome.ratio_percent(),
                download_locator: download_locator.clone(),
                processing_duration_ms: scope.elapsed_ms(),
                strategy: outcome.strategy.to_string(),
                message: outcome.message().to_string(),
            };
            let result = ResultFile {
                name: result_name,
                size: outcome.compressed_size,
                url: download_locator,
            };
            Ok((output, result))
        })
        .await
    }

    /// Rasterize every page to `png` or `jpg`/`jpeg`.
    pub async fn convert(&self, input: InputFile, format: &str) -> Result<ItemsOutput, OperationError> {
        let kind = OperationKind::Convert;
        let format: ImageFormat = format
            .parse()
            .map_err(|e| OperationError::from_toolkit(kind, &e, self.config.diagnostics))?;
        self.validate_all(kind, std::slice::from_ref(&input))?;

        self.tracked(kind, vec![input.descriptor()], |scope| async move {
            let root = &self.config.upload_root;
            let staged = input.stage(root).await?;
            scope.track_input(&staged);

            let dir_name = scope.dir_name();
            let out_dir = root.join(&dir_name);
            scope.artifacts.add(&out_dir);

            let options = RenderOptions::for_convert(&self.config, format);
            let raster = self.engine.rasterize(&staged.path, &out_dir, options).await?;
            info!(
                "Converted {} to {} {} images with '{}'",
                input.name,
                raster.pages.len(),
                format,
                raster.backend
            );

            let written = raster
                .pages
                .iter()
                .filter_map(|p| {
                    p.path
                        .file_name()
                        .map(|n| (n.to_string_lossy().into_owned(), p.size))
                })
                .collect();
            let items = self.items_in(&dir_name, written);
            let result = self.directory_result(&dir_name, &items);
            let output = ItemsOutput {
                operation_id: scope.id.to_string(),
                items,
                processing_duration_ms: scope.elapsed_ms(),
                backend: Some(raster.backend),
                format: Some(format.to_string()),
                skipped_pages: raster.skipped.iter().map(|e| e.page()).collect(),
            };
            Ok((output, result))
        })
        .await
    }

    /// Read descriptive metadata. Not tracked; a staged upload is still
    /// scheduled for cleanup.
    pub async fn inspect(&self, input: InputFile) -> Result<InspectOutput, OperationError> {
        let diagnostics = self.config.diagnostics;
        input
            .validate()
            .map_err(|e| OperationError::from_inspect(&e, diagnostics))?;

        let staged = input
            .stage(&self.config.upload_root)
            .await
            .map_err(|e| OperationError::from_inspect(&e, diagnostics))?;
        if staged.owned {
            self.cleanup
                .schedule([staged.path.clone()], self.config.cleanup_delay);
        }

        let metadata = blocking(move || staged.load().map(|doc| assemble::metadata(&doc)))
            .await
            .map_err(|e| OperationError::from_inspect(&e, diagnostics))?;

        Ok(InspectOutput {
            name: input.name,
            size: input.size,
            size_human: format_file_size(input.size),
            metadata,
        })
    }

    /// Probe every backend and report the tracking store.
    pub async fn capabilities(&self) -> Capabilities {
        let backends = self.engine.backends().to_vec();
        let statuses = tokio::task::spawn_blocking(move || {
            backends
                .iter()
                .map(|b| BackendStatus {
                    name: b.name().to_string(),
                    available: b.is_available(),
                })
                .collect::<Vec<_>>()
        })
        .await
        .unwrap_or_default();

        let store = self.tracker.store();
        Capabilities {
            backends: statuses,
            tracking_store: store.name().to_string(),
            tracking_persistent: store.is_persistent(),
        }
    }

    /// Stop the cleanup worker.
    pub async fn shutdown(&self, mode: ShutdownMode) -> ShutdownReport {
        let report = self.cleanup.shutdown(mode).await;
        info!(
            "pdf-toolkit shut down: {} removed, {} persisted",
            report.removed, report.persisted
        );
        report
    }

    // ── Internals ────────────────────────────────────────────────────────

    fn validate_all(&self, kind: OperationKind, inputs: &[InputFile]) -> Result<(), OperationError> {
        for input in inputs {
            input
                .validate()
                .map_err(|e| OperationError::from_toolkit(kind, &e, self.config.diagnostics))?;
        }
        Ok(())
    }

    /// Run `body` under a tracked record, then schedule cleanup.
    async fn tracked<T, F, Fut>(
        &self,
        kind: OperationKind,
        inputs: Vec<FileDescriptor>,
        body: F,
    ) -> Result<T, OperationError>
    where
        F: FnOnce(Scope) -> Fut,
        Fut: Future<Output = Result<(T, ResultFile), ToolkitError>>,
    {
        let operation = self.tracker.open(kind, inputs).await;
        let artifacts = ArtifactSet::default();
        let scope = Scope {
            id: operation.id(),
            kind,
            started: Instant::now(),
            artifacts: artifacts.clone(),
        };

        let work = body(scope);
        let result = match self.config.operation_timeout {
            Some(limit) => match tokio::time::timeout(limit, work).await {
                Ok(r) => r,
                Err(_) => Err(ToolkitError::Timeout {
                    elapsed_ms: limit.as_millis() as u64,
                }),
            },
            None => work.await,
        };

        let outcome = match result {
            Ok((value, result_file)) => {
                operation.complete(result_file).await;
                Ok(value)
            }
            Err(e) => {
                error!("{} operation {} failed: {}", kind, operation.id(), e);
                let surfaced = OperationError::from_toolkit(kind, &e, self.config.diagnostics);
                operation.fail(surfaced.message.clone()).await;
                Err(surfaced)
            }
        };

        let paths = artifacts.take();
        debug!("Scheduling {} artifacts for cleanup", paths.len());
        self.cleanup.schedule(paths, self.config.cleanup_delay);
        outcome
    }

    fn items_in(&self, dir_name: &str, written: Vec<(String, u64)>) -> Vec<ArtifactItem> {
        written
            .into_iter()
            .map(|(name, size)| ArtifactItem {
                download_locator: self.config.locator(&format!("{}/{}", dir_name, name)),
                name,
                size,
            })
            .collect()
    }

    fn directory_result(&self, dir_name: &str, items: &[ArtifactItem]) -> ResultFile {
        ResultFile {
            name: dir_name.to_string(),
            size: items.iter().map(|i| i.size).sum(),
            url: self.config.locator(dir_name),
        }
    }
}

async fn write_artifact(path: &Path, bytes: &[u8]) -> Result<(), ToolkitError> {
    tokio::fs::write(path, bytes)
        .await
        .map_err(|e| ToolkitError::io(path, e))
}

/// Run lopdf work on the blocking pool.
async fn blocking<T, F>(f: F) -> Result<T, ToolkitError>
where
    F: FnOnce() -> Result<T, ToolkitError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ToolkitError::Internal(format!("Blocking task panicked: {}", e)))?
}

//! Rasterization engine: render a PDF to page images through an ordered
//! list of independent backends.
//!
//! ## Failure containment
//!
//! * A page that fails inside a backend is recorded as a [`PageError`] and
//!   skipped; the backend carries on with the next page.
//! * A backend that cannot run, panics, or renders nothing is recorded as a
//!   [`BackendFailure`] and the engine moves on to the next backend.
//! * Only when every backend failed does the engine return
//!   [`ToolkitError::ConversionExhausted`].
//!
//! Each attempt writes into its own hidden staging directory under the output
//! directory. Only the winning attempt's images are moved into place, so
//! results are never mixed across backends.
//!
//! ## spawn_blocking
//!
//! pdfium, lopdf and the `pdftoppm` subprocess are all blocking, so
//! [`RasterEngine::rasterize`] runs the whole fallback chain on the blocking
//! pool.

use crate::config::{ImageFormat, ToolkitConfig};
use crate::error::{BackendError, BackendFailure, FailureCategory, PageError, ToolkitError};
use crate::progress::{NoopProgressCallback, ProgressCallback, RasterProgressCallback};
use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// How pages should be rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderOptions {
    pub format: ImageFormat,
    /// Longest rendered edge in pixels.
    pub max_pixels: u32,
    /// JPEG quality (1–100); ignored for PNG.
    pub jpeg_quality: u8,
}

impl RenderOptions {
    /// Convert options: configured pixel cap and JPEG quality.
    pub fn for_convert(config: &ToolkitConfig, format: ImageFormat) -> Self {
        Self {
            format,
            max_pixels: config.max_rendered_pixels,
            jpeg_quality: config.jpeg_quality,
        }
    }

    /// Artifact name for a page: `page-{n}.{ext}`.
    pub fn page_file_name(&self, page: u32) -> String {
        format!("page-{}.{}", page, self.format.extension())
    }
}

/// One image on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedPage {
    /// 1-indexed.
    pub page_number: u32,
    pub path: PathBuf,
    pub size: u64,
}

/// What a single backend produced.
#[derive(Debug, Default)]
pub struct BackendOutput {
    pub pages: Vec<RenderedPage>,
    pub page_errors: Vec<PageError>,
}

/// Everything a backend needs for one attempt.
pub struct AttemptContext<'a> {
    pub pdf_path: &'a Path,
    pub options: &'a RenderOptions,
    /// Fresh, empty directory owned by this attempt.
    pub staging_dir: &'a Path,
    pub progress: &'a dyn RasterProgressCallback,
}

impl AttemptContext<'_> {
    pub fn page_path(&self, page: u32) -> PathBuf {
        self.staging_dir.join(self.options.page_file_name(page))
    }
}

/// A rasterization strategy the engine can fall back through.
pub trait RasterBackend: Send + Sync {
    /// Stable short name used in logs and results.
    fn name(&self) -> &str;

    /// Cheap probe: can this backend run in the current environment?
    fn is_available(&self) -> bool {
        true
    }

    /// Render the whole document into `ctx.staging_dir`.
    ///
    /// Page-level failures belong in [`BackendOutput::page_errors`]; return
    /// `Err` only when the backend as a whole cannot proceed.
    fn attempt(&self, ctx: &AttemptContext<'_>) -> Result<BackendOutput, BackendError>;
}

/// Render pages `1..=total` one by one, tolerating individual failures.
///
/// `render` writes page `n` to the given path. Successful pages are sized
/// from disk; failed pages are logged and collected.
pub fn drive_pages<F>(ctx: &AttemptContext<'_>, total: u32, mut render: F) -> BackendOutput
where
    F: FnMut(u32, &Path) -> Result<(), PageError>,
{
    let mut out = BackendOutput::default();
    for page in 1..=total {
        let target = ctx.page_path(page);
        let result = render(page, &target).and_then(|()| {
            std::fs::metadata(&target)
                .map(|m| m.len())
                .map_err(|e| PageError::EncodeFailed {
                    page,
                    detail: e.to_string(),
                })
        });

        match result {
            Ok(size) => {
                debug!("Rendered page {}/{} ({} bytes)", page, total, size);
                ctx.progress.on_page_complete(page, total);
                out.pages.push(RenderedPage {
                    page_number: page,
                    path: target,
                    size,
                });
            }
            Err(e) => {
                warn!("{}", e);
                ctx.progress.on_page_error(page, total, &e.to_string());
                out.page_errors.push(e);
            }
        }
    }
    out
}

/// The winning backend's result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RasterOutput {
    pub backend: String,
    /// Ascending by page number.
    pub pages: Vec<RenderedPage>,
    /// Pages the winning backend skipped.
    pub skipped: Vec<PageError>,
}

/// Ordered fallback chain of [`RasterBackend`]s.
#[derive(Clone)]
pub struct RasterEngine {
    backends: Vec<Arc<dyn RasterBackend>>,
    progress: ProgressCallback,
}

impl std::fmt::Debug for RasterEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RasterEngine")
            .field("backends", &self.backend_names())
            .finish()
    }
}

impl RasterEngine {
    pub fn new(backends: Vec<Arc<dyn RasterBackend>>) -> Self {
        Self {
            backends,
            progress: Arc::new(NoopProgressCallback),
        }
    }

    /// pdfium → canvas → poppler, configured from `config`.
    pub fn with_default_backends(config: &ToolkitConfig) -> Self {
        Self::new(crate::pipeline::backends::default_backends(config))
    }

    pub fn with_progress(mut self, progress: ProgressCallback) -> Self {
        self.progress = progress;
        self
    }

    /// Backend names in fallback order.
    pub fn backend_names(&self) -> Vec<String> {
        self.backends.iter().map(|b| b.name().to_string()).collect()
    }

    pub fn backends(&self) -> &[Arc<dyn RasterBackend>] {
        &self.backends
    }

    /// Rasterize `pdf_path` into `out_dir` on the blocking pool.
    pub async fn rasterize(
        &self,
        pdf_path: &Path,
        out_dir: &Path,
        options: RenderOptions,
    ) -> Result<RasterOutput, ToolkitError> {
        let engine = self.clone();
        let pdf = pdf_path.to_path_buf();
        let out = out_dir.to_path_buf();

        tokio::task::spawn_blocking(move || engine.rasterize_blocking(&pdf, &out, &options))
            .await
            .map_err(|e| ToolkitError::Internal(format!("Render task panicked: {}", e)))?
    }

    /// Blocking implementation of [`RasterEngine::rasterize`].
    pub fn rasterize_blocking(
        &self,
        pdf_path: &Path,
        out_dir: &Path,
        options: &RenderOptions,
    ) -> Result<RasterOutput, ToolkitError> {
        std::fs::create_dir_all(out_dir).map_err(|e| ToolkitError::io(out_dir, e))?;

        let mut failures: Vec<BackendFailure> = Vec::new();

        for backend in &self.backends {
            let name = backend.name().to_string();
            let staging = tempfile::Builder::new()
                .prefix(".raster-")
                .tempdir_in(out_dir)
                .map_err(|e| ToolkitError::io(out_dir, e))?;

            info!("Rasterizing {} with backend '{}'", pdf_path.display(), name);
            self.progress.on_backend_start(&name);

            let ctx = AttemptContext {
                pdf_path,
                options,
                staging_dir: staging.path(),
                progress: self.progress.as_ref(),
            };

            let attempt = catch_unwind(AssertUnwindSafe(|| backend.attempt(&ctx)))
                .unwrap_or_else(|_| Err(BackendError::Failed("backend panicked".into())))
                .and_then(|out| {
                    if out.pages.is_empty() {
                        Err(BackendError::NoPages {
                            page_errors: out.page_errors.len(),
                        })
                    } else {
                        Ok(out)
                    }
                });

            match attempt {
                Ok(mut out) => {
                    out.pages.sort_by_key(|p| p.page_number);
                    for page in &mut out.pages {
                        let dest = out_dir.join(options.page_file_name(page.page_number));
                        std::fs::rename(&page.path, &dest)
                            .map_err(|e| ToolkitError::io(&page.path, e))?;
                        page.path = dest;
                    }
                    info!(
                        "Backend '{}' rendered {} pages ({} skipped)",
                        name,
                        out.pages.len(),
                        out.page_errors.len()
                    );
                    return Ok(RasterOutput {
                        backend: name,
                        pages: out.pages,
                        skipped: out.page_errors,
                    });
                }
                Err(e) => {
                    warn!("Backend '{}' failed: {}", name, e);
                    self.progress.on_backend_failed(&name, &e.to_string());
                    failures.push(BackendFailure {
                        backend: name,
                        category: e.category(),
                        message: e.to_string(),
                    });
                }
            }
            // `staging` drops here and takes any partial output with it.
        }

        let category = FailureCategory::dominant(&failures);
        error!(
            "All {} rasterization backends failed for {} ({})",
            failures.len(),
            pdf_path.display(),
            category
        );
        Err(ToolkitError::ConversionExhausted {
            category,
            attempts: failures,
        })
    }
}

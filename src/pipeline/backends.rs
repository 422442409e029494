//! Concrete rasterization backends, in default fallback order.
//!
//! | Backend   | Engine                                   | Unavailable when                     |
//! |-----------|------------------------------------------|--------------------------------------|
//! | `pdfium`  | pdfium bound from the configured path    | no library at the configured path    |
//! | `canvas`  | pdfium from the system search path, each page drawn into a pre-allocated bitmap | no system pdfium |
//! | `poppler` | `pdftoppm` subprocess, one call per page | program not on `PATH`                |
//!
//! None of them use `Pdfium::default()`: it panics when the library is
//! missing, and a missing library must surface as
//! [`BackendError::Unavailable`] so the engine can fall back.

use crate::config::{ImageFormat, ToolkitConfig};
use crate::error::{BackendError, PageError};
use crate::pipeline::encode::write_page_image;
use crate::pipeline::render::{drive_pages, AttemptContext, BackendOutput, RasterBackend};
use pdfium_render::prelude::*;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use tracing::debug;

/// The default chain: pdfium → canvas → poppler.
pub fn default_backends(config: &ToolkitConfig) -> Vec<Arc<dyn RasterBackend>> {
    vec![
        Arc::new(PdfiumBackend::new(config.resolved_pdfium_path())),
        Arc::new(CanvasBackend),
        Arc::new(PopplerBackend::new(config.poppler_program.clone())),
    ]
}

fn pdfium_error(e: PdfiumError) -> String {
    format!("{:?}", e)
}

fn page_index(page: u32) -> Result<u16, PageError> {
    u16::try_from(page - 1).map_err(|_| PageError::RenderFailed {
        page,
        detail: "page index exceeds pdfium limits".into(),
    })
}

// ── pdfium ───────────────────────────────────────────────────────────────

/// Native rasterizer bound from an explicit library location.
#[derive(Debug, Clone)]
pub struct PdfiumBackend {
    library_path: Option<PathBuf>,
}

impl PdfiumBackend {
    /// `library_path` may name the shared library itself or its directory.
    /// None looks in the working directory.
    pub fn new(library_path: Option<PathBuf>) -> Self {
        Self { library_path }
    }

    fn bind(&self) -> Result<Pdfium, BackendError> {
        let dir_or_file = self
            .library_path
            .clone()
            .unwrap_or_else(|| PathBuf::from("./"));
        let lib = if dir_or_file.is_dir() {
            Pdfium::pdfium_platform_library_name_at_path(&dir_or_file)
        } else {
            dir_or_file
        };
        Pdfium::bind_to_library(&lib)
            .map(Pdfium::new)
            .map_err(|e| BackendError::Unavailable(format!("{}: {}", lib.display(), pdfium_error(e))))
    }
}

impl RasterBackend for PdfiumBackend {
    fn name(&self) -> &str {
        "pdfium"
    }

    fn is_available(&self) -> bool {
        self.bind().is_ok()
    }

    fn attempt(&self, ctx: &AttemptContext<'_>) -> Result<BackendOutput, BackendError> {
        let pdfium = self.bind()?;
        let document = pdfium
            .load_pdf_from_file(ctx.pdf_path, None)
            .map_err(|e| BackendError::Failed(pdfium_error(e)))?;
        let pages = document.pages();
        let total = pages.len() as u32;

        let max = ctx.options.max_pixels as i32;
        let render_config = PdfRenderConfig::new()
            .set_target_width(max)
            .set_maximum_height(max);

        Ok(drive_pages(ctx, total, |page, target| {
            let pdf_page = pages
                .get(page_index(page)?)
                .map_err(|e| PageError::RenderFailed {
                    page,
                    detail: pdfium_error(e),
                })?;
            let bitmap = pdf_page
                .render_with_config(&render_config)
                .map_err(|e| PageError::RenderFailed {
                    page,
                    detail: pdfium_error(e),
                })?;
            let image = bitmap.as_image();
            write_page_image(&image, ctx.options.format, ctx.options.jpeg_quality, target)
                .map(|_| ())
                .map_err(|detail| PageError::EncodeFailed { page, detail })
        }))
    }
}

// ── canvas ───────────────────────────────────────────────────────────────

/// Software renderer: sizes a blank canvas from the page geometry and has
/// the system pdfium draw the page into it.
#[derive(Debug, Clone, Copy, Default)]
pub struct CanvasBackend;

impl CanvasBackend {
    fn bind() -> Result<Pdfium, BackendError> {
        Pdfium::bind_to_system_library()
            .map(Pdfium::new)
            .map_err(|e| BackendError::Unavailable(format!("system pdfium: {}", pdfium_error(e))))
    }
}

/// Fit a `width × height` point box into a `max × max` pixel square.
pub(crate) fn canvas_size(width_pt: f32, height_pt: f32, max: u32) -> Option<(i32, i32)> {
    if !width_pt.is_finite() || !height_pt.is_finite() || width_pt <= 0.0 || height_pt <= 0.0 {
        return None;
    }
    let scale = max as f32 / width_pt.max(height_pt);
    let w = (width_pt * scale).round().max(1.0) as i32;
    let h = (height_pt * scale).round().max(1.0) as i32;
    Some((w, h))
}

impl RasterBackend for CanvasBackend {
    fn name(&self) -> &str {
        "canvas"
    }

    fn is_available(&self) -> bool {
        Self::bind().is_ok()
    }

    fn attempt(&self, ctx: &AttemptContext<'_>) -> Result<BackendOutput, BackendError> {
        let pdfium = Self::bind()?;
        let document = pdfium
            .load_pdf_from_file(ctx.pdf_path, None)
            .map_err(|e| BackendError::Failed(pdfium_error(e)))?;
        let pages = document.pages();
        let total = pages.len() as u32;

        Ok(drive_pages(ctx, total, |page, target| {
            let render_failed = |detail: String| PageError::RenderFailed { page, detail };

            let pdf_page = pages
                .get(page_index(page)?)
                .map_err(|e| render_failed(pdfium_error(e)))?;
            let (w, h) = canvas_size(
                pdf_page.width().value,
                pdf_page.height().value,
                ctx.options.max_pixels,
            )
            .ok_or_else(|| render_failed("page has non-positive dimensions".into()))?;

            let mut canvas =
                PdfBitmap::empty(w, h, PdfBitmapFormat::default(), pdfium.bindings())
                    .map_err(|e| render_failed(pdfium_error(e)))?;
            let config = PdfRenderConfig::new().set_target_size(w, h);
            pdf_page
                .render_into_bitmap_with_config(&mut canvas, &config)
                .map_err(|e| render_failed(pdfium_error(e)))?;

            let image = canvas.as_image();
            write_page_image(&image, ctx.options.format, ctx.options.jpeg_quality, target)
                .map(|_| ())
                .map_err(|detail| PageError::EncodeFailed { page, detail })
        }))
    }
}

// ── poppler ──────────────────────────────────────────────────────────────

/// Alternative native rasterizer driven through `pdftoppm`.
#[derive(Debug, Clone)]
pub struct PopplerBackend {
    program: String,
}

impl PopplerBackend {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn render_page(&self, ctx: &AttemptContext<'_>, page: u32, target: &Path) -> Result<(), PageError> {
        // pdftoppm appends the extension itself.
        let root = target.with_extension("");
        let mut command = Command::new(&self.program);
        command
            .arg("-f")
            .arg(page.to_string())
            .arg("-l")
            .arg(page.to_string())
            .arg("-singlefile")
            .arg("-scale-to")
            .arg(ctx.options.max_pixels.to_string());
        match ctx.options.format {
            ImageFormat::Png => {
                command.arg("-png");
            }
            ImageFormat::Jpeg => {
                command
                    .arg("-jpeg")
                    .arg("-jpegopt")
                    .arg(format!("quality={}", ctx.options.jpeg_quality));
            }
        }
        command.arg(ctx.pdf_path).arg(&root);

        let output = command.output().map_err(|e| PageError::RenderFailed {
            page,
            detail: format!("failed to execute {}: {}", self.program, e),
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PageError::RenderFailed {
                page,
                detail: format!("{} exited with {}: {}", self.program, output.status, stderr.trim()),
            });
        }
        if !target.exists() {
            return Err(PageError::EncodeFailed {
                page,
                detail: format!("{} did not produce {}", self.program, target.display()),
            });
        }
        Ok(())
    }
}

impl RasterBackend for PopplerBackend {
    fn name(&self) -> &str {
        "poppler"
    }

    fn is_available(&self) -> bool {
        Command::new(&self.program).arg("-v").output().is_ok()
    }

    fn attempt(&self, ctx: &AttemptContext<'_>) -> Result<BackendOutput, BackendError> {
        if !self.is_available() {
            return Err(BackendError::Unavailable(format!(
                "'{}' is not installed",
                self.program
            )));
        }

        let total = lopdf::Document::load(ctx.pdf_path)
            .map(|doc| doc.get_pages().len() as u32)
            .map_err(|e| BackendError::Failed(format!("cannot count pages: {}", e)))?;
        debug!("{} rendering {} pages", self.program, total);

        Ok(drive_pages(ctx, total, |page, target| {
            self.render_page(ctx, page, target)
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::render::RenderOptions;
    use crate::progress::NoopProgressCallback;

    #[test]
    fn canvas_size_fits_longest_edge() {
        assert_eq!(canvas_size(612.0, 792.0, 792), Some((612, 792)));
        assert_eq!(canvas_size(842.0, 595.0, 1000), Some((1000, 707)));
        assert_eq!(canvas_size(0.0, 100.0, 1000), None);
        assert_eq!(canvas_size(f32::NAN, 100.0, 1000), None);
    }

    #[test]
    fn default_chain_order() {
        let names: Vec<String> = default_backends(&ToolkitConfig::default())
            .iter()
            .map(|b| b.name().to_string())
            .collect();
        assert_eq!(names, ["pdfium", "canvas", "poppler"]);
    }

    #[test]
    fn missing_pdfium_library_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let backend = PdfiumBackend::new(Some(dir.path().join("libnothing.so")));
        assert!(!backend.is_available());

        let options = RenderOptions {
            format: ImageFormat::Png,
            max_pixels: 100,
            jpeg_quality: 80,
        };
        let ctx = AttemptContext {
            pdf_path: Path::new("in.pdf"),
            options: &options,
            staging_dir: dir.path(),
            progress: &NoopProgressCallback,
        };
        assert!(matches!(
            backend.attempt(&ctx),
            Err(BackendError::Unavailable(_))
        ));
    }

    #[test]
    fn missing_poppler_program_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let backend = PopplerBackend::new("pdftoppm-definitely-not-installed");
        let options = RenderOptions {
            format: ImageFormat::Jpeg,
            max_pixels: 100,
            jpeg_quality: 80,
        };
        let ctx = AttemptContext {
            pdf_path: Path::new("in.pdf"),
            options: &options,
            staging_dir: dir.path(),
            progress: &NoopProgressCallback,
        };
        assert!(matches!(
            backend.attempt(&ctx),
            Err(BackendError::Unavailable(_))
        ));
    }
}

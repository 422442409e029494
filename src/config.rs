//! Configuration types for the operation pipeline.
//!
//! Everything the toolkit needs at runtime lives in [`ToolkitConfig`], built
//! via [`ToolkitConfigBuilder`]. The upload root is injected here; nothing in
//! the crate reaches for a process-global directory.
//!
//! Request-scoped parameters ([`ImageFormat`], [`PageSelection`]) are parsed
//! here too so that the CLI and any serving layer share one parser.

use crate::error::ToolkitError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Environment variable consulted when no pdfium library path is configured.
pub const PDFIUM_LIB_PATH_ENV: &str = "PDFIUM_LIB_PATH";

/// Runtime configuration for a [`crate::toolkit::Toolkit`].
///
/// # Example
/// ```rust
/// use pdf_toolkit::ToolkitConfig;
/// use std::time::Duration;
///
/// let config = ToolkitConfig::builder()
///     .upload_root("/var/lib/pdf-toolkit/uploads")
///     .cleanup_delay(Duration::from_secs(600))
///     .build()
///     .unwrap();
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolkitConfig {
    /// Directory holding staged inputs and every produced artifact.
    /// Default: `uploads`.
    pub upload_root: PathBuf,

    /// Prefix joined with an artifact's relative path to form its download
    /// locator. Default: `/api/pdf/download`.
    pub download_prefix: String,

    /// How long artifacts stay on disk after their operation ends.
    /// Default: 30 minutes.
    pub cleanup_delay: Duration,

    /// Where pending cleanup entries are persisted on shutdown.
    /// If None, `<upload_root>/.pending-cleanup.json` is used.
    pub cleanup_manifest: Option<PathBuf>,

    /// Remove everything left in the upload root at startup. Default: false.
    pub sweep_on_start: bool,

    /// Longest rendered edge in pixels for convert. Range: 100–10000. Default: 2000.
    pub max_rendered_pixels: u32,

    /// JPEG quality for convert output (1–100). Default: 80.
    pub jpeg_quality: u8,

    /// Longest rendered edge for the aggressive compression tier. Default: 1200.
    pub aggressive_max_pixels: u32,

    /// Compression quality used when the caller supplies none. Default: 0.7.
    pub default_quality: f64,

    /// Directory for persisted operation records. None keeps records in memory.
    pub tracking_dir: Option<PathBuf>,

    /// Disable operation tracking entirely. Default: false.
    pub tracking_disabled: bool,

    /// Explicit pdfium shared library path for the primary backend.
    /// Falls back to `PDFIUM_LIB_PATH`, then the working directory.
    pub pdfium_library_path: Option<PathBuf>,

    /// Program invoked by the poppler backend. Default: `pdftoppm`.
    pub poppler_program: String,

    /// Attach original error text to surfaced failures. Default: false.
    pub diagnostics: bool,

    /// Optional wall-clock limit for a single operation.
    pub operation_timeout: Option<Duration>,
}

impl Default for ToolkitConfig {
    fn default() -> Self {
        Self {
            upload_root: PathBuf::from("uploads"),
            download_prefix: "/api/pdf/download".to_string(),
            cleanup_delay: Duration::from_secs(30 * 60),
            cleanup_manifest: None,
            sweep_on_start: false,
            max_rendered_pixels: 2000,
            jpeg_quality: 80,
            aggressive_max_pixels: 1200,
            default_quality: 0.7,
            tracking_dir: None,
            tracking_disabled: false,
            pdfium_library_path: None,
            poppler_program: "pdftoppm".to_string(),
            diagnostics: false,
            operation_timeout: None,
        }
    }
}

impl ToolkitConfig {
    pub fn builder() -> ToolkitConfigBuilder {
        ToolkitConfigBuilder {
            config: Self::default(),
        }
    }

    /// The manifest path actually used by the cleanup scheduler.
    pub fn manifest_path(&self) -> PathBuf {
        self.cleanup_manifest
            .clone()
            .unwrap_or_else(|| self.upload_root.join(".pending-cleanup.json"))
    }

    /// The pdfium library path for the primary backend, if one is known.
    pub fn resolved_pdfium_path(&self) -> Option<PathBuf> {
        self.pdfium_library_path
            .clone()
            .or_else(|| std::env::var_os(PDFIUM_LIB_PATH_ENV).map(PathBuf::from))
    }

    /// Join the download prefix with a path relative to the upload root.
    pub fn locator(&self, relative: &str) -> String {
        format!(
            "{}/{}",
            self.download_prefix.trim_end_matches('/'),
            relative.trim_start_matches('/')
        )
    }

    /// Map a download locator back to the artifact path under the upload
    /// root. None for locators outside the prefix or with `..` components.
    pub fn resolve_locator(&self, locator: &str) -> Option<PathBuf> {
        let prefix = self.download_prefix.trim_end_matches('/');
        let relative = locator.strip_prefix(prefix)?.strip_prefix('/')?;
        if relative.is_empty()
            || relative
                .split('/')
                .any(|part| part.is_empty() || part == "." || part == "..")
        {
            return None;
        }
        Some(self.upload_root.join(relative))
    }
}

/// Builder for [`ToolkitConfig`].
#[derive(Debug)]
pub struct ToolkitConfigBuilder {
    config: ToolkitConfig,
}

impl ToolkitConfigBuilder {
    pub fn upload_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.config.upload_root = root.into();
        self
    }

    pub fn download_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.download_prefix = prefix.into();
        self
    }

    pub fn cleanup_delay(mut self, delay: Duration) -> Self {
        self.config.cleanup_delay = delay;
        self
    }

    pub fn cleanup_manifest(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.cleanup_manifest = Some(path.into());
        self
    }

    pub fn sweep_on_start(mut self, v: bool) -> Self {
        self.config.sweep_on_start = v;
        self
    }

    pub fn max_rendered_pixels(mut self, px: u32) -> Self {
        self.config.max_rendered_pixels = px.clamp(100, 10_000);
        self
    }

    pub fn jpeg_quality(mut self, q: u8) -> Self {
        self.config.jpeg_quality = q.clamp(1, 100);
        self
    }

    pub fn aggressive_max_pixels(mut self, px: u32) -> Self {
        self.config.aggressive_max_pixels = px.clamp(100, 10_000);
        self
    }

    pub fn default_quality(mut self, q: f64) -> Self {
        self.config.default_quality = q;
        self
    }

    pub fn tracking_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.tracking_dir = Some(dir.into());
        self
    }

    pub fn tracking_disabled(mut self, v: bool) -> Self {
        self.config.tracking_disabled = v;
        self
    }

    pub fn pdfium_library_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.pdfium_library_path = Some(path.into());
        self
    }

    pub fn poppler_program(mut self, program: impl Into<String>) -> Self {
        self.config.poppler_program = program.into();
        self
    }

    pub fn diagnostics(mut self, v: bool) -> Self {
        self.config.diagnostics = v;
        self
    }

    pub fn operation_timeout(mut self, timeout: Duration) -> Self {
        self.config.operation_timeout = Some(timeout);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ToolkitConfig, ToolkitError> {
        let c = &self.config;
        if c.upload_root.as_os_str().is_empty() {
            return Err(ToolkitError::InvalidConfig(
                "upload root must not be empty".into(),
            ));
        }
        if !c.default_quality.is_finite() || !(0.0..=1.0).contains(&c.default_quality) {
            return Err(ToolkitError::InvalidConfig(format!(
                "default quality must be within 0.0–1.0, got {}",
                c.default_quality
            )));
        }
        if c.poppler_program.trim().is_empty() {
            return Err(ToolkitError::InvalidConfig(
                "poppler program must not be empty".into(),
            ));
        }
        if matches!(c.operation_timeout, Some(t) if t.is_zero()) {
            return Err(ToolkitError::InvalidConfig(
                "operation timeout must be non-zero".into(),
            ));
        }
        Ok(self.config)
    }
}

// ── Request parameters ───────────────────────────────────────────────────

/// Raster output format for convert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    #[default]
    Png,
    Jpeg,
}

impl ImageFormat {
    /// File extension used for artifacts (`png` or `jpg`).
    pub fn extension(self) -> &'static str {
        match self {
            ImageFormat::Png => "png",
            ImageFormat::Jpeg => "jpg",
        }
    }

    pub fn mime_type(self) -> &'static str {
        match self {
            ImageFormat::Png => "image/png",
            ImageFormat::Jpeg => "image/jpeg",
        }
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for ImageFormat {
    type Err = ToolkitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "png" => Ok(ImageFormat::Png),
            "jpg" | "jpeg" => Ok(ImageFormat::Jpeg),
            other => Err(ToolkitError::Validation(format!(
                "Unsupported image format '{other}'. Use png, jpg or jpeg"
            ))),
        }
    }
}

/// Which pages a split produces.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PageSelection {
    /// Every page, in ascending order (default).
    #[default]
    All,
    /// Explicit 1-indexed page numbers, in request order.
    Pages(Vec<u32>),
}

impl PageSelection {
    /// Expand the selection into the 1-indexed pages to emit.
    ///
    /// Request order is kept. Out-of-range numbers and repeats of an already
    /// emitted page are dropped. An empty explicit list means all pages.
    pub fn resolve(&self, total_pages: u32) -> Vec<u32> {
        match self {
            PageSelection::All => (1..=total_pages).collect(),
            PageSelection::Pages(pages) if pages.is_empty() => (1..=total_pages).collect(),
            PageSelection::Pages(pages) => {
                let mut seen = std::collections::HashSet::new();
                pages
                    .iter()
                    .copied()
                    .filter(|&p| p >= 1 && p <= total_pages)
                    .filter(|&p| seen.insert(p))
                    .collect()
            }
        }
    }

    /// Parse a selection from a JSON array (`[2, 1]`) or a comma list (`2,1`).
    ///
    /// Blank input means all pages. Tokens that are not positive integers
    /// are ignored, as are non-numeric JSON elements.
    pub fn parse(input: &str) -> Result<Self, ToolkitError> {
        let trimmed = input.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("all") {
            return Ok(PageSelection::All);
        }

        let pages: Vec<u32> = if trimmed.starts_with('[') {
            let values: Vec<serde_json::Value> = serde_json::from_str(trimmed).map_err(|e| {
                ToolkitError::Validation(format!("Invalid page list '{trimmed}': {e}"))
            })?;
            values
                .iter()
                .filter_map(|v| match v {
                    serde_json::Value::Number(n) => n.as_u64(),
                    serde_json::Value::String(s) => s.trim().parse().ok(),
                    _ => None,
                })
                .filter_map(|n| u32::try_from(n).ok())
                .collect()
        } else {
            trimmed
                .split(',')
                .filter_map(|tok| tok.trim().parse::<u32>().ok())
                .collect()
        };

        Ok(PageSelection::Pages(pages))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documentation() {
        let c = ToolkitConfig::default();
        assert_eq!(c.cleanup_delay, Duration::from_secs(1800));
        assert_eq!(c.max_rendered_pixels, 2000);
        assert_eq!(c.jpeg_quality, 80);
        assert_eq!(c.manifest_path(), PathBuf::from("uploads/.pending-cleanup.json"));
    }

    #[test]
    fn builder_clamps_and_validates() {
        let c = ToolkitConfig::builder()
            .max_rendered_pixels(5)
            .jpeg_quality(0)
            .build()
            .unwrap();
        assert_eq!(c.max_rendered_pixels, 100);
        assert_eq!(c.jpeg_quality, 1);

        assert!(ToolkitConfig::builder().default_quality(1.5).build().is_err());
        assert!(ToolkitConfig::builder().upload_root("").build().is_err());
        assert!(ToolkitConfig::builder()
            .operation_timeout(Duration::ZERO)
            .build()
            .is_err());
    }

    #[test]
    fn locator_joins_without_double_slash() {
        let c = ToolkitConfig::builder()
            .download_prefix("/dl/")
            .build()
            .unwrap();
        assert_eq!(c.locator("/split_x/page_1.pdf"), "/dl/split_x/page_1.pdf");
    }

    #[test]
    fn resolve_locator_stays_under_root() {
        let c = ToolkitConfig::builder()
            .upload_root("/srv/up")
            .build()
            .unwrap();
        assert_eq!(
            c.resolve_locator("/api/pdf/download/split_x/page_1.pdf"),
            Some(PathBuf::from("/srv/up/split_x/page_1.pdf"))
        );
        assert_eq!(c.resolve_locator("/api/pdf/download/../etc/passwd"), None);
        assert_eq!(c.resolve_locator("/elsewhere/a.pdf"), None);
        assert_eq!(c.resolve_locator("/api/pdf/download/"), None);
        assert_eq!(c.resolve_locator("/api/pdf/downloadx/a.pdf"), None);
    }

    #[test]
    fn image_format_parsing() {
        assert_eq!("PNG".parse::<ImageFormat>().unwrap(), ImageFormat::Png);
        assert_eq!("jpg".parse::<ImageFormat>().unwrap(), ImageFormat::Jpeg);
        assert_eq!(" JPEG ".parse::<ImageFormat>().unwrap(), ImageFormat::Jpeg);
        assert!("gif".parse::<ImageFormat>().is_err());
        assert_eq!(ImageFormat::Jpeg.extension(), "jpg");
    }

    #[test]
    fn resolve_keeps_request_order_and_drops_invalid() {
        let sel = PageSelection::Pages(vec![2, 999, 1, 2, 0]);
        assert_eq!(sel.resolve(3), vec![2, 1]);
        assert_eq!(PageSelection::All.resolve(3), vec![1, 2, 3]);
        assert_eq!(PageSelection::Pages(vec![]).resolve(2), vec![1, 2]);
    }

    #[test]
    fn parse_json_and_comma_lists() {
        assert_eq!(
            PageSelection::parse("[3, 1]").unwrap(),
            PageSelection::Pages(vec![3, 1])
        );
        assert_eq!(
            PageSelection::parse("2, x, 4").unwrap(),
            PageSelection::Pages(vec![2, 4])
        );
        assert_eq!(PageSelection::parse("  ").unwrap(), PageSelection::All);
        assert!(PageSelection::parse("[1,").is_err());
    }
}

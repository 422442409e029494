//! # pdf-toolkit
//!
//! Merge, split, compress and rasterize PDF documents as tracked operations
//! with deferred artifact cleanup.
//!
//! ## Pipeline Overview
//!
//! ```text
//! InputFile(s)
//!  │
//!  ├─ 1. Validate  %PDF magic, parameters (nothing tracked on failure)
//!  ├─ 2. Track     OperationRecord opened as `processing`
//!  ├─ 3. Stage     uploads written under the upload root
//!  ├─ 4. Transform merge / split (lopdf), compress (tiered), convert (raster chain)
//!  ├─ 5. Seal      record → `completed` or `failed`, exactly once
//!  └─ 6. Cleanup   every touched path removed after the configured delay
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pdf_toolkit::{InputFile, PageSelection, Toolkit, ToolkitConfig};
//! use pdf_toolkit::cleanup::ShutdownMode;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let toolkit = Toolkit::start(ToolkitConfig::default()).await?;
//!
//!     let merged = toolkit
//!         .merge(vec![
//!             InputFile::from_path("a.pdf")?,
//!             InputFile::from_path("b.pdf")?,
//!         ])
//!         .await?;
//!     println!("{} ({} pages)", merged.download_locator, merged.page_count);
//!
//!     let pages = toolkit
//!         .split(InputFile::from_path("a.pdf")?, PageSelection::Pages(vec![2, 1]))
//!         .await?;
//!     for item in pages.items {
//!         println!("{} → {}", item.name, item.download_locator);
//!     }
//!
//!     toolkit.shutdown(ShutdownMode::Persist).await;
//!     Ok(())
//! }
//! ```
//!
//! ## Rasterization backends
//!
//! Convert and the aggressive compression tier walk an ordered fallback
//! chain (see [`pipeline::backends`]). A backend that cannot run or renders
//! nothing hands over to the next; a page that fails is skipped.
//!
//! | Backend   | Needs                                      |
//! |-----------|--------------------------------------------|
//! | `pdfium`  | pdfium library at `PDFIUM_LIB_PATH` or `./` |
//! | `canvas`  | pdfium on the system library path          |
//! | `poppler` | `pdftoppm` on `PATH`                       |
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `pdf-toolkit` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! pdf-toolkit = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod cleanup;
pub mod config;
pub mod error;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod toolkit;
pub mod tracker;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{ImageFormat, PageSelection, ToolkitConfig, ToolkitConfigBuilder};
pub use error::{ErrorKind, OperationError, PageError, ToolkitError};
pub use output::{
    ArtifactItem, CompressOutput, DocumentMetadata, InspectOutput, ItemsOutput, MergeOutput,
};
pub use pipeline::input::InputFile;
pub use progress::{NoopProgressCallback, RasterProgressCallback};
pub use toolkit::{Capabilities, Toolkit};
pub use tracker::{OperationKind, OperationRecord, OperationStatus};

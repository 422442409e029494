//! Progress-callback trait for rasterization events.
//!
//! Pass an [`Arc<dyn RasterProgressCallback>`] to
//! [`crate::pipeline::render::RasterEngine::with_progress`] to observe each
//! backend attempt and each page as it is rendered. The CLI uses this to
//! drive its spinner.
//!
//! # Example
//!
//! ```rust
//! use pdf_toolkit::RasterProgressCallback;
//! use std::sync::atomic::{AtomicU32, Ordering};
//!
//! struct Counter(AtomicU32);
//!
//! impl RasterProgressCallback for Counter {
//!     fn on_page_complete(&self, _page: u32, _total: u32) {
//!         self.0.fetch_add(1, Ordering::SeqCst);
//!     }
//! }
//! ```

use std::sync::Arc;

/// Called by the rasterization engine while it works through its backends.
///
/// Engines run inside `spawn_blocking`, so implementations must be
/// `Send + Sync`. Every method has a no-op default.
pub trait RasterProgressCallback: Send + Sync {
    /// A backend is about to attempt the document.
    fn on_backend_start(&self, backend: &str) {
        let _ = backend;
    }

    /// One page was rendered and written.
    ///
    /// # Arguments
    /// * `page` : 1-indexed page number
    /// * `total`: pages in the document
    fn on_page_complete(&self, page: u32, total: u32) {
        let _ = (page, total);
    }

    /// One page failed and was skipped.
    fn on_page_error(&self, page: u32, total: u32, error: &str) {
        let _ = (page, total, error);
    }

    /// A backend gave up; the engine moves on to the next one.
    fn on_backend_failed(&self, backend: &str, error: &str) {
        let _ = (backend, error);
    }
}

/// No-op implementation, the engine's default.
pub struct NoopProgressCallback;

impl RasterProgressCallback for NoopProgressCallback {}

/// Shared handle stored by the engine.
pub type ProgressCallback = Arc<dyn RasterProgressCallback>;

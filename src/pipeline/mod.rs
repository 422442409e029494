//! Pipeline stages for document operations.
//!
//! Each submodule implements one transformation step and knows nothing about
//! tracking or cleanup; [`crate::toolkit`] wraps them into operations.
//!
//! ## Data Flow
//!
//! ```text
//!            ┌──▶ assemble ─────────────────────────┐   merge / split
//! input ─────┼──▶ compress ──┬─ light / medium ─────┼──▶ artifacts
//! (validate, │               └─ aggressive ──┐      │   compress
//!  stage)    └──▶ render ◀───────────────────┘      │
//!                 (backends: pdfium → canvas → poppler)  convert
//! ```
//!
//! 1. [`input`]   : `%PDF` check, staging under the upload root, lopdf load
//! 2. [`assemble`]: page-level merge, split and metadata over lopdf documents
//! 3. [`compress`]: quality → strategy selection with a never-larger guarantee
//! 4. [`render`]  : ordered backend fallback with per-page error tolerance
//! 5. [`backends`]: the concrete rasterizers the engine falls back through
//! 6. [`encode`]  : PNG / JPEG encoding of rendered pages

pub mod assemble;
pub mod backends;
pub mod compress;
pub mod encode;
pub mod input;
pub mod render;

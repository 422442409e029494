//! Tiered size reduction with a never-larger guarantee.
//!
//! | quality        | strategy     | what happens |
//! |----------------|--------------|--------------|
//! | `q ≤ 0.3`      | aggressive   | every page rasterized to JPEG, rebuilt as an image-only PDF |
//! | `0.3 < q ≤ 0.6`| medium       | prune unreferenced objects, drop empty streams, renumber, Flate |
//! | `q > 0.6`      | light        | Flate-compress streams and re-save |
//!
//! Whatever the strategy produces, the caller gets the smaller of the result
//! and the original. A strategy that fails is logged and the original bytes
//! are returned; compression itself never fails an operation.

use crate::config::{ImageFormat, ToolkitConfig};
use crate::error::ToolkitError;
use crate::pipeline::assemble::{page_with_inherited_attributes, save_to_bytes};
use crate::pipeline::input::{load_document, StagedInput};
use crate::pipeline::render::{RasterEngine, RenderOptions, RenderedPage};
use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Document, Object, Stream};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use tracing::{debug, info, warn};

/// US Letter, used when a page has no resolvable `MediaBox`.
const FALLBACK_PAGE_SIZE: (f32, f32) = (612.0, 792.0);

/// Re-encoding strategy selected from the quality factor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionStrategy {
    Aggressive,
    Medium,
    Light,
}

impl CompressionStrategy {
    /// Total mapping from a normalised quality to a strategy.
    pub fn for_quality(quality: f64) -> Self {
        if quality <= 0.3 {
            CompressionStrategy::Aggressive
        } else if quality <= 0.6 {
            CompressionStrategy::Medium
        } else {
            CompressionStrategy::Light
        }
    }
}

impl fmt::Display for CompressionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CompressionStrategy::Aggressive => "aggressive",
            CompressionStrategy::Medium => "medium",
            CompressionStrategy::Light => "light",
        })
    }
}

/// Clamp into `[0, 1]`; NaN becomes `default`.
pub fn normalize_quality(quality: f64, default: f64) -> f64 {
    if quality.is_nan() {
        default
    } else {
        quality.clamp(0.0, 1.0)
    }
}

/// Result of [`compress`]. `bytes` is never longer than the input.
#[derive(Debug, Clone)]
pub struct CompressionOutcome {
    pub bytes: Vec<u8>,
    pub strategy: CompressionStrategy,
    pub original_size: u64,
    pub compressed_size: u64,
    /// True when the original bytes were kept.
    pub kept_original: bool,
}

impl CompressionOutcome {
    /// Percentage saved, rounded to one decimal place.
    pub fn ratio_percent(&self) -> f64 {
        if self.original_size == 0 {
            return 0.0;
        }
        let saved = self.original_size.saturating_sub(self.compressed_size) as f64;
        (saved / self.original_size as f64 * 1000.0).round() / 10.0
    }

    /// Human summary tiered by the achieved ratio.
    pub fn message(&self) -> &'static str {
        let ratio = self.ratio_percent();
        if ratio <= 0.0 {
            "PDF optimized (no size reduction achieved - file was already optimized)"
        } else if ratio < 5.0 {
            "PDF compressed with minimal size reduction"
        } else if ratio < 20.0 {
            "PDF compressed with moderate size reduction"
        } else {
            "PDF compressed with significant size reduction"
        }
    }
}

/// Compress a staged document at `quality` (already normalised).
///
/// `scratch_dir` hosts the temporary page images of the aggressive tier.
pub async fn compress(
    input: &StagedInput,
    quality: f64,
    engine: &RasterEngine,
    config: &ToolkitConfig,
    scratch_dir: &Path,
) -> CompressionOutcome {
    let strategy = CompressionStrategy::for_quality(quality);
    let original_size = input.bytes.len() as u64;
    info!(
        "Compressing '{}' ({} bytes) with {} strategy (q={:.2})",
        input.name, original_size, strategy, quality
    );

    let attempt = match strategy {
        CompressionStrategy::Aggressive => {
            rasterize_to_images(input, quality, engine, config, scratch_dir).await
        }
        CompressionStrategy::Medium | CompressionStrategy::Light => {
            let name = input.name.clone();
            let bytes = input.bytes.clone();
            tokio::task::spawn_blocking(move || restructure(&name, &bytes, strategy))
                .await
                .map_err(|e| ToolkitError::Internal(format!("Compress task panicked: {}", e)))
                .and_then(|r| r)
        }
    };

    let keep_original = |bytes: &[u8]| CompressionOutcome {
        bytes: bytes.to_vec(),
        strategy,
        original_size,
        compressed_size: original_size,
        kept_original: true,
    };

    match attempt {
        Ok(candidate) if (candidate.len() as u64) < original_size => {
            debug!("Compression {} → {} bytes", original_size, candidate.len());
            CompressionOutcome {
                compressed_size: candidate.len() as u64,
                bytes: candidate,
                strategy,
                original_size,
                kept_original: false,
            }
        }
        Ok(candidate) => {
            info!(
                "No compression benefit ({} ≥ {} bytes), keeping original",
                candidate.len(),
                original_size
            );
            keep_original(&input.bytes)
        }
        Err(e) => {
            warn!("{} compression of '{}' failed, keeping original: {}", strategy, input.name, e);
            keep_original(&input.bytes)
        }
    }
}

// ── Light / medium ───────────────────────────────────────────────────────

fn restructure(name: &str, bytes: &[u8], strategy: CompressionStrategy) -> Result<Vec<u8>, ToolkitError> {
    let mut doc = load_document(name, bytes)?;
    if strategy == CompressionStrategy::Medium {
        let pruned = doc.prune_objects();
        let emptied = doc.delete_zero_length_streams();
        doc.renumber_objects();
        debug!(
            "Pruned {} unreferenced objects and {} empty streams",
            pruned.len(),
            emptied.len()
        );
    }
    doc.compress();
    save_to_bytes(&mut doc, name)
}

// ── Aggressive ───────────────────────────────────────────────────────────

/// JPEG quality for the aggressive tier: 30 + q·100, kept within 20–60.
pub(crate) fn aggressive_jpeg_quality(quality: f64) -> u8 {
    (30.0 + quality * 100.0).round().clamp(20.0, 60.0) as u8
}

async fn rasterize_to_images(
    input: &StagedInput,
    quality: f64,
    engine: &RasterEngine,
    config: &ToolkitConfig,
    scratch_dir: &Path,
) -> Result<Vec<u8>, ToolkitError> {
    let page_sizes: Vec<(f32, f32)> = {
        let source = load_document(&input.name, &input.bytes)?;
        source
            .get_pages()
            .values()
            .map(|&id| displayed_page_size(&source, id))
            .collect()
    };

    let scratch = tempfile::Builder::new()
        .prefix(".compress-")
        .tempdir_in(scratch_dir)
        .map_err(|e| ToolkitError::io(scratch_dir, e))?;

    let options = RenderOptions {
        format: ImageFormat::Jpeg,
        max_pixels: config.aggressive_max_pixels,
        jpeg_quality: aggressive_jpeg_quality(quality),
    };
    let raster = engine.rasterize(&input.path, scratch.path(), options).await?;

    if !raster.skipped.is_empty() || raster.pages.len() != page_sizes.len() {
        return Err(ToolkitError::Internal(format!(
            "backend '{}' rendered {} of {} pages",
            raster.backend,
            raster.pages.len(),
            page_sizes.len()
        )));
    }

    let name = input.name.clone();
    let pages = raster.pages;
    tokio::task::spawn_blocking(move || build_image_document(&name, &pages, &page_sizes))
        .await
        .map_err(|e| ToolkitError::Internal(format!("Compress task panicked: {}", e)))?
}

/// Page size in points as displayed, i.e. with `Rotate` applied.
fn displayed_page_size(doc: &Document, page_id: lopdf::ObjectId) -> (f32, f32) {
    let Ok(page) = page_with_inherited_attributes(doc, page_id) else {
        return FALLBACK_PAGE_SIZE;
    };
    let number = |o: &Object| match o {
        Object::Integer(i) => Some(*i as f32),
        Object::Real(r) => Some(*r),
        _ => None,
    };
    let size = page
        .get(b"MediaBox")
        .and_then(Object::as_array)
        .ok()
        .and_then(|b| {
            let v: Vec<f32> = b.iter().filter_map(number).collect();
            (v.len() == 4).then(|| ((v[2] - v[0]).abs(), (v[3] - v[1]).abs()))
        })
        .filter(|(w, h)| *w > 0.0 && *h > 0.0)
        .unwrap_or(FALLBACK_PAGE_SIZE);

    let rotate = page.get(b"Rotate").and_then(Object::as_i64).unwrap_or(0);
    if rotate.rem_euclid(180) == 90 {
        (size.1, size.0)
    } else {
        size
    }
}

/// Assemble a PDF with one full-page DCT image per page.
fn build_image_document(
    name: &str,
    pages: &[RenderedPage],
    page_sizes: &[(f32, f32)],
) -> Result<Vec<u8>, ToolkitError> {
    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let mut kids: Vec<Object> = Vec::with_capacity(pages.len());

    for (page, &(width, height)) in pages.iter().zip(page_sizes) {
        let jpeg = std::fs::read(&page.path).map_err(|e| ToolkitError::io(&page.path, e))?;
        let (px_w, px_h) = image::image_dimensions(&page.path).map_err(|e| {
            ToolkitError::Internal(format!("{}: {}", page.path.display(), e))
        })?;

        let image_id = doc.add_object(Object::Stream(
            Stream::new(
                dictionary! {
                    "Type" => "XObject",
                    "Subtype" => "Image",
                    "Width" => px_w as i64,
                    "Height" => px_h as i64,
                    "ColorSpace" => "DeviceRGB",
                    "BitsPerComponent" => 8i64,
                    "Filter" => "DCTDecode",
                },
                jpeg,
            )
            .with_compression(false),
        ));

        let content = Content {
            operations: vec![
                Operation::new("q", vec![]),
                Operation::new(
                    "cm",
                    vec![
                        Object::Real(width),
                        Object::Integer(0),
                        Object::Integer(0),
                        Object::Real(height),
                        Object::Integer(0),
                        Object::Integer(0),
                    ],
                ),
                Operation::new("Do", vec![Object::Name(b"Im0".to_vec())]),
                Operation::new("Q", vec![]),
            ],
        };
        let encoded = content.encode().map_err(|e| ToolkitError::SaveFailed {
            name: name.to_string(),
            detail: e.to_string(),
        })?;
        let content_id = doc.add_object(Stream::new(dictionary! {}, encoded));

        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "MediaBox" => vec![
                Object::Integer(0),
                Object::Integer(0),
                Object::Real(width),
                Object::Real(height),
            ],
            "Contents" => content_id,
            "Resources" => dictionary! {
                "XObject" => dictionary! { "Im0" => image_id },
            },
        });
        kids.push(Object::Reference(page_id));
    }

    let count = kids.len() as i64;
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => count,
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);

    save_to_bytes(&mut doc, name)
}

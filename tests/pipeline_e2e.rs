//! End-to-end tests for the tracked operation pipeline.
//!
//! PDFs are generated in memory with lopdf and rasterization goes through
//! mock backends, so no pdfium library or poppler install is needed.
//!
//! Run with:
//!   cargo test --test pipeline_e2e

use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Document, Object, Stream};
use pdf_toolkit::cleanup::ShutdownMode;
use pdf_toolkit::error::{BackendError, ErrorKind};
use pdf_toolkit::pipeline::render::{drive_pages, AttemptContext, BackendOutput, RasterBackend};
use pdf_toolkit::{
    InputFile, OperationRecord, OperationStatus, PageError, PageSelection, Toolkit, ToolkitConfig,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

// ── Test helpers ─────────────────────────────────────────────────────────────

/// Route library logs to the test harness. `RUST_LOG=pdf_toolkit=debug` to see them.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A document whose page `i` draws the text `labels[i]`.
fn labelled_pdf(labels: &[&str]) -> Vec<u8> {
    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Helvetica",
    });
    let resources_id = doc.add_object(dictionary! {
        "Font" => dictionary! { "F1" => font_id },
    });

    let mut kids: Vec<Object> = Vec::new();
    for label in labels {
        let content = Content {
            operations: vec![
                Operation::new("BT", vec![]),
                Operation::new("Tf", vec!["F1".into(), 24.into()]),
                Operation::new("Td", vec![72.into(), 700.into()]),
                Operation::new("Tj", vec![Object::string_literal(*label)]),
                Operation::new("ET", vec![]),
            ],
        };
        let content_id = doc.add_object(Stream::new(dictionary! {}, content.encode().unwrap()));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
            "Resources" => resources_id,
            "MediaBox" => vec![
                Object::Integer(0),
                Object::Integer(0),
                Object::Integer(612),
                Object::Integer(792),
            ],
        });
        kids.push(page_id.into());
    }

    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => labels.len() as i64,
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);

    let mut bytes = Vec::new();
    doc.save_to(&mut bytes).unwrap();
    bytes
}

fn page_labels(path: &Path) -> Vec<String> {
    let doc = Document::load(path).unwrap();
    doc.get_pages()
        .values()
        .map(|&id| {
            let content = doc.get_page_content(id).unwrap();
            Content::decode(&content)
                .unwrap()
                .operations
                .iter()
                .find(|op| op.operator == "Tj")
                .and_then(|op| op.operands.first())
                .and_then(|o| o.as_str().ok())
                .map(|b| String::from_utf8_lossy(b).into_owned())
                .unwrap_or_default()
        })
        .collect()
}

/// Renders `pages` pages, failing on those in `fail_on`. Writes a real
/// 8×8 image so the output is decodable.
struct MockBackend {
    name: &'static str,
    pages: u32,
    fail_on: Vec<u32>,
}

impl RasterBackend for MockBackend {
    fn name(&self) -> &str {
        self.name
    }

    fn attempt(&self, ctx: &AttemptContext<'_>) -> Result<BackendOutput, BackendError> {
        Ok(drive_pages(ctx, self.pages, |page, target| {
            if self.fail_on.contains(&page) {
                return Err(PageError::RenderFailed {
                    page,
                    detail: "synthetic failure".into(),
                });
            }
            image::RgbImage::from_pixel(8, 8, image::Rgb([200, 200, 200]))
                .save(target)
                .map_err(|e| PageError::EncodeFailed {
                    page,
                    detail: e.to_string(),
                })
        }))
    }
}

struct Throws;

impl RasterBackend for Throws {
    fn name(&self) -> &str {
        "throws"
    }

    fn attempt(&self, _ctx: &AttemptContext<'_>) -> Result<BackendOutput, BackendError> {
        Err(BackendError::Failed("renderer crashed".into()))
    }
}

struct Missing;

impl RasterBackend for Missing {
    fn name(&self) -> &str {
        "missing"
    }

    fn is_available(&self) -> bool {
        false
    }

    fn attempt(&self, _ctx: &AttemptContext<'_>) -> Result<BackendOutput, BackendError> {
        Err(BackendError::Unavailable("library not installed".into()))
    }
}

struct Slow;

impl RasterBackend for Slow {
    fn name(&self) -> &str {
        "slow"
    }

    fn attempt(&self, _ctx: &AttemptContext<'_>) -> Result<BackendOutput, BackendError> {
        std::thread::sleep(Duration::from_millis(500));
        Err(BackendError::Failed("too slow".into()))
    }
}

fn mock(name: &'static str, pages: u32, fail_on: Vec<u32>) -> Arc<dyn RasterBackend> {
    Arc::new(MockBackend {
        name,
        pages,
        fail_on,
    })
}

struct Fixture {
    toolkit: Toolkit,
    root: TempDir,
    tracking: TempDir,
}

impl Fixture {
    async fn new(backends: Vec<Arc<dyn RasterBackend>>) -> Self {
        Self::with_config(backends, |b| b).await
    }

    async fn with_config(
        backends: Vec<Arc<dyn RasterBackend>>,
        tweak: impl FnOnce(pdf_toolkit::ToolkitConfigBuilder) -> pdf_toolkit::ToolkitConfigBuilder,
    ) -> Self {
        init_tracing();
        let root = tempfile::tempdir().unwrap();
        let tracking = tempfile::tempdir().unwrap();
        let builder = ToolkitConfig::builder()
            .upload_root(root.path())
            .tracking_dir(tracking.path())
            .cleanup_delay(Duration::from_secs(3600));
        let config = tweak(builder).build().unwrap();
        let toolkit = Toolkit::with_raster_backends(config, backends).await.unwrap();
        Self {
            toolkit,
            root,
            tracking,
        }
    }

    fn path_of(&self, locator: &str) -> PathBuf {
        self.toolkit.config().resolve_locator(locator).unwrap()
    }

    fn records(&self) -> Vec<OperationRecord> {
        std::fs::read_dir(self.tracking.path())
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| p.extension().is_some_and(|x| x == "json"))
            .map(|p| serde_json::from_slice(&std::fs::read(p).unwrap()).unwrap())
            .collect()
    }
}

// ── Merge ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn merge_preserves_order_and_page_count() {
    let fx = Fixture::new(vec![]).await;
    let out = fx
        .toolkit
        .merge(vec![
            InputFile::from_bytes("a.pdf", labelled_pdf(&["A1", "A2"])),
            InputFile::from_bytes("b.pdf", labelled_pdf(&["B1", "B2", "B3"])),
        ])
        .await
        .unwrap();

    assert_eq!(out.page_count, 5);
    let merged = fx.path_of(&out.download_locator);
    assert_eq!(std::fs::metadata(&merged).unwrap().len(), out.result_size);
    assert_eq!(page_labels(&merged), ["A1", "A2", "B1", "B2", "B3"]);

    let records = fx.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, OperationStatus::Completed);
    assert_eq!(records[0].input_files.len(), 2);
    assert_eq!(
        records[0].result_file.as_ref().map(|r| r.name.as_str()),
        Some(out.result_name.as_str())
    );
}

#[tokio::test]
async fn merge_of_one_file_is_rejected_before_tracking() {
    let fx = Fixture::new(vec![]).await;
    let err = fx
        .toolkit
        .merge(vec![InputFile::from_bytes("a.pdf", labelled_pdf(&["A"]))])
        .await
        .unwrap_err();

    assert_eq!(err.kind, ErrorKind::Validation);
    assert_eq!(err.message, "Please upload at least 2 PDF files to merge");
    assert!(fx.records().is_empty());
}

#[tokio::test]
async fn non_pdf_input_is_rejected_before_tracking() {
    let fx = Fixture::new(vec![]).await;
    let err = fx
        .toolkit
        .split(
            InputFile::from_bytes("notes.txt", b"hello world".to_vec()),
            PageSelection::All,
        )
        .await
        .unwrap_err();

    assert_eq!(err.kind, ErrorKind::Validation);
    assert!(fx.records().is_empty());
}

// ── Split ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn split_all_yields_one_file_per_page() {
    let fx = Fixture::new(vec![]).await;
    let out = fx
        .toolkit
        .split(
            InputFile::from_bytes("doc.pdf", labelled_pdf(&["P1", "P2", "P3"])),
            PageSelection::All,
        )
        .await
        .unwrap();

    let names: Vec<&str> = out.items.iter().map(|i| i.name.as_str()).collect();
    assert_eq!(names, ["page_1.pdf", "page_2.pdf", "page_3.pdf"]);
    for (item, label) in out.items.iter().zip(["P1", "P2", "P3"]) {
        assert_eq!(page_labels(&fx.path_of(&item.download_locator)), [label]);
    }
}

#[tokio::test]
async fn split_keeps_requested_order_and_drops_out_of_range() {
    let fx = Fixture::new(vec![]).await;
    let out = fx
        .toolkit
        .split(
            InputFile::from_bytes("doc.pdf", labelled_pdf(&["P1", "P2", "P3"])),
            PageSelection::Pages(vec![2, 999, 1]),
        )
        .await
        .unwrap();

    let names: Vec<&str> = out.items.iter().map(|i| i.name.as_str()).collect();
    assert_eq!(names, ["page_2.pdf", "page_1.pdf"]);
    assert_eq!(page_labels(&fx.path_of(&out.items[0].download_locator)), ["P2"]);
    assert!(out.items[0]
        .download_locator
        .starts_with("/api/pdf/download/split_"));
}

// ── Compress ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn compress_never_grows_the_file() {
    let fx = Fixture::new(vec![mock("mock", 3, vec![])]).await;
    let original = labelled_pdf(&["C1", "C2", "C3"]);

    for quality in [0.9, 0.5, 0.1] {
        let out = fx
            .toolkit
            .compress(InputFile::from_bytes("doc.pdf", original.clone()), Some(quality))
            .await
            .unwrap();

        assert_eq!(out.original_size, original.len() as u64);
        assert!(out.compressed_size <= out.original_size, "q={quality}");
        let bytes = std::fs::read(fx.path_of(&out.download_locator)).unwrap();
        assert_eq!(bytes.len() as u64, out.compressed_size);
        if out.compressed_size == out.original_size {
            assert_eq!(bytes, original);
            assert_eq!(out.compression_ratio_percent, 0.0);
        }
    }
}

#[tokio::test]
async fn aggressive_compression_rebuilds_heavy_pages_as_images() {
    let fx = Fixture::new(vec![mock("mock", 3, vec![])]).await;
    let heavy: Vec<String> = ["H1", "H2", "H3"]
        .iter()
        .map(|tag| format!("{tag} {}", "lorem ipsum ".repeat(1700)))
        .collect();
    let labels: Vec<&str> = heavy.iter().map(String::as_str).collect();
    let original = labelled_pdf(&labels);

    let out = fx
        .toolkit
        .compress(InputFile::from_bytes("heavy.pdf", original.clone()), Some(0.1))
        .await
        .unwrap();

    assert_eq!(out.strategy, "aggressive");
    assert_eq!(out.original_size, original.len() as u64);
    assert!(
        out.compressed_size < out.original_size,
        "{} >= {}",
        out.compressed_size,
        out.original_size
    );
    assert!(out.compression_ratio_percent > 0.0);

    let rebuilt = Document::load(fx.path_of(&out.download_locator)).unwrap();
    assert_eq!(rebuilt.get_pages().len(), 3);
    for (_, page_id) in rebuilt.get_pages() {
        let page = rebuilt.get_dictionary(page_id).unwrap();
        assert!(page.has(b"MediaBox"));
    }
}

#[tokio::test]
async fn compression_without_gain_returns_original_bytes() {
    let fx = Fixture::new(vec![mock("mock", 3, vec![])]).await;
    let original = labelled_pdf(&["C1", "C2", "C3"]);

    let out = fx
        .toolkit
        .compress(InputFile::from_bytes("small.pdf", original.clone()), Some(0.1))
        .await
        .unwrap();

    assert_eq!(out.strategy, "aggressive");
    assert_eq!(out.compressed_size, out.original_size);
    assert_eq!(out.compression_ratio_percent, 0.0);
    assert_eq!(std::fs::read(fx.path_of(&out.download_locator)).unwrap(), original);
}

#[tokio::test]
async fn aggressive_compression_keeps_original_when_rasterization_fails() {
    let fx = Fixture::new(vec![Arc::new(Throws)]).await;
    let original = labelled_pdf(&["X"]);
    let out = fx
        .toolkit
        .compress(InputFile::from_bytes("doc.pdf", original.clone()), Some(0.2))
        .await
        .unwrap();

    assert_eq!(out.strategy, "aggressive");
    assert_eq!(out.compressed_size, out.original_size);
    assert_eq!(std::fs::read(fx.path_of(&out.download_locator)).unwrap(), original);
    assert_eq!(
        out.message,
        "PDF optimized (no size reduction achieved - file was already optimized)"
    );
}

// ── Convert ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn convert_falls_back_to_the_next_backend() {
    let fx = Fixture::new(vec![Arc::new(Throws), mock("second", 3, vec![])]).await;
    let out = fx
        .toolkit
        .convert(InputFile::from_bytes("doc.pdf", labelled_pdf(&["1", "2", "3"])), "png")
        .await
        .unwrap();

    assert_eq!(out.backend.as_deref(), Some("second"));
    assert_eq!(out.format.as_deref(), Some("png"));
    let names: Vec<&str> = out.items.iter().map(|i| i.name.as_str()).collect();
    assert_eq!(names, ["page-1.png", "page-2.png", "page-3.png"]);
    for item in &out.items {
        assert!(fx.path_of(&item.download_locator).is_file());
    }
}

#[tokio::test]
async fn convert_skips_pages_that_fail() {
    let fx = Fixture::new(vec![mock("partial", 3, vec![2])]).await;
    let out = fx
        .toolkit
        .convert(InputFile::from_bytes("doc.pdf", labelled_pdf(&["1", "2", "3"])), "JPEG")
        .await
        .unwrap();

    let names: Vec<&str> = out.items.iter().map(|i| i.name.as_str()).collect();
    assert_eq!(names, ["page-1.jpg", "page-3.jpg"]);
    assert_eq!(out.skipped_pages, [2]);
}

#[tokio::test]
async fn convert_with_every_backend_failing_seals_a_failed_record() {
    let fx = Fixture::new(vec![Arc::new(Missing), Arc::new(Missing), Arc::new(Throws)]).await;
    let err = fx
        .toolkit
        .convert(InputFile::from_bytes("doc.pdf", labelled_pdf(&["1"])), "png")
        .await
        .unwrap_err();

    assert_eq!(err.kind, ErrorKind::ConversionExhausted);
    assert!(err.message.contains("missing system dependencies"), "{}", err.message);

    let records = fx.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, OperationStatus::Failed);
    assert_eq!(records[0].error_message.as_deref(), Some(err.message.as_str()));
    assert!(records[0].result_file.is_none());
}

#[tokio::test]
async fn convert_rejects_unknown_format_before_tracking() {
    let fx = Fixture::new(vec![mock("mock", 1, vec![])]).await;
    let err = fx
        .toolkit
        .convert(InputFile::from_bytes("doc.pdf", labelled_pdf(&["1"])), "gif")
        .await
        .unwrap_err();

    assert_eq!(err.kind, ErrorKind::Validation);
    assert!(fx.records().is_empty());
}

// ── Timeouts and cleanup ─────────────────────────────────────────────────────

#[tokio::test]
async fn timeout_fails_the_operation() {
    let fx = Fixture::with_config(vec![Arc::new(Slow)], |b| {
        b.operation_timeout(Duration::from_millis(50))
    })
    .await;
    let err = fx
        .toolkit
        .convert(InputFile::from_bytes("doc.pdf", labelled_pdf(&["1"])), "png")
        .await
        .unwrap_err();

    assert_eq!(err.kind, ErrorKind::Timeout);
    assert_eq!(fx.records()[0].status, OperationStatus::Failed);
    assert_eq!(fx.toolkit.cleanup().pending().await, 2);
}

#[tokio::test]
async fn artifacts_are_removed_after_the_cleanup_delay() {
    let fx = Fixture::with_config(vec![], |b| {
        b.cleanup_delay(Duration::from_millis(200))
    })
    .await;
    let out = fx
        .toolkit
        .merge(vec![
            InputFile::from_bytes("a.pdf", labelled_pdf(&["A"])),
            InputFile::from_bytes("b.pdf", labelled_pdf(&["B"])),
        ])
        .await
        .unwrap();

    let merged = fx.path_of(&out.download_locator);
    assert!(merged.exists());

    tokio::time::sleep(Duration::from_millis(700)).await;
    assert!(!merged.exists());
    let leftovers = std::fs::read_dir(fx.root.path()).unwrap().count();
    assert_eq!(leftovers, 0);
}

#[tokio::test]
async fn persist_shutdown_records_pending_artifacts() {
    let fx = Fixture::new(vec![]).await;
    fx.toolkit
        .merge(vec![
            InputFile::from_bytes("a.pdf", labelled_pdf(&["A"])),
            InputFile::from_bytes("b.pdf", labelled_pdf(&["B"])),
        ])
        .await
        .unwrap();

    let report = fx.toolkit.shutdown(ShutdownMode::Persist).await;
    // Two staged uploads plus the merged result.
    assert_eq!(report.persisted, 3);
    assert!(fx.toolkit.config().manifest_path().exists());
}

#[tokio::test]
async fn path_inputs_are_never_scheduled_for_removal() {
    let fx = Fixture::new(vec![]).await;
    let src = tempfile::tempdir().unwrap();
    let input = src.path().join("keep.pdf");
    std::fs::write(&input, labelled_pdf(&["K1", "K2"])).unwrap();

    fx.toolkit
        .split(InputFile::from_path(&input).unwrap(), PageSelection::All)
        .await
        .unwrap();

    // Only the per-operation output directory.
    assert_eq!(fx.toolkit.cleanup().pending().await, 1);
    fx.toolkit.shutdown(ShutdownMode::Drain).await;
    assert!(input.exists());
}

// ── Inspect and capabilities ─────────────────────────────────────────────────

#[tokio::test]
async fn inspect_reports_metadata_without_tracking() {
    let fx = Fixture::new(vec![]).await;
    let bytes = labelled_pdf(&["1", "2", "3"]);
    let size = bytes.len() as u64;
    let info = fx
        .toolkit
        .inspect(InputFile::from_bytes("doc.pdf", bytes))
        .await
        .unwrap();

    assert_eq!(info.metadata.page_count, 3);
    assert_eq!(info.metadata.title, "Untitled");
    assert_eq!(info.size, size);
    assert!(info.size_human.ends_with("KB") || info.size_human.ends_with("Bytes"));
    assert!(fx.records().is_empty());
}

#[tokio::test]
async fn capabilities_list_backends_in_fallback_order() {
    let fx = Fixture::new(vec![Arc::new(Missing), mock("mock", 1, vec![])]).await;
    let caps = fx.toolkit.capabilities().await;

    let listed: Vec<(&str, bool)> = caps
        .backends
        .iter()
        .map(|b| (b.name.as_str(), b.available))
        .collect();
    assert_eq!(listed, [("missing", false), ("mock", true)]);
    assert_eq!(caps.tracking_store, "json-file");
    assert!(caps.tracking_persistent);
}

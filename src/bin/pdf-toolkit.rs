//! CLI binary for pdf-toolkit.
//!
//! A thin shim over the library crate that maps CLI flags to
//! `ToolkitConfig`, runs one operation and copies its artifacts out of the
//! upload root.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use pdf_toolkit::cleanup::ShutdownMode;
use pdf_toolkit::output::format_file_size;
use pdf_toolkit::{
    ArtifactItem, InputFile, PageSelection, RasterProgressCallback, Toolkit, ToolkitConfig,
};
use serde::Serialize;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Spinner showing the active raster backend and the last rendered page.
struct CliProgress {
    bar: ProgressBar,
}

impl CliProgress {
    fn new(prefix: &str) -> Arc<Self> {
        let bar = ProgressBar::new_spinner();
        let style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}  {elapsed:.dim}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);
        bar.set_style(style);
        bar.set_prefix(prefix.to_string());
        bar.set_message("Working…");
        bar.enable_steady_tick(Duration::from_millis(80));
        Arc::new(Self { bar })
    }
}

impl RasterProgressCallback for CliProgress {
    fn on_backend_start(&self, backend: &str) {
        self.bar.set_message(format!("rendering with {backend}"));
    }

    fn on_page_complete(&self, page: u32, total: u32) {
        self.bar.set_message(format!("page {page}/{total}"));
    }

    fn on_page_error(&self, page: u32, total: u32, error: &str) {
        let msg = if error.chars().count() > 80 {
            format!("{}\u{2026}", error.chars().take(79).collect::<String>())
        } else {
            error.to_string()
        };
        self.bar.println(format!(
            "  {} Page {:>3}/{:<3}  {}",
            red("✗"),
            page,
            total,
            red(&msg)
        ));
    }

    fn on_backend_failed(&self, backend: &str, error: &str) {
        self.bar
            .println(format!("  {} {} gave up: {}", cyan("⚠"), bold(backend), dim(error)));
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Merge in order
  pdf-toolkit merge a.pdf b.pdf c.pdf -o merged.pdf

  # Extract pages 3 and 1 (in that order) into ./pages/
  pdf-toolkit split report.pdf --pages 3,1 -o pages

  # Aggressive compression
  pdf-toolkit compress scan.pdf --quality 0.2 -o small.pdf

  # Rasterize every page to JPEG
  pdf-toolkit convert slides.pdf --format jpg -o images

  # Metadata as JSON
  pdf-toolkit --json info report.pdf

  # Which rasterizers can run here
  pdf-toolkit capabilities

RASTERIZATION BACKENDS (tried in order):
  pdfium    pdfium at --pdfium-lib / PDFIUM_LIB_PATH, or ./
  canvas    pdfium on the system library path
  poppler   pdftoppm (poppler-utils) on PATH

ENVIRONMENT VARIABLES:
  PDF_TOOLKIT_UPLOAD_ROOT    Working directory for staged inputs and artifacts
  PDF_TOOLKIT_CLEANUP_DELAY  Seconds before artifacts are removed
  PDF_TOOLKIT_TRACKING_DIR   Persist operation records as JSON here
  PDFIUM_LIB_PATH            pdfium shared library (file or directory)
  RUST_LOG                   Override log filter (e.g. pdf_toolkit=debug)

Artifacts left in the upload root are recorded in a cleanup manifest on exit
and removed by the next run once their delay has passed.
"#;

/// Merge, split, compress and rasterize PDF files.
#[derive(Parser, Debug)]
#[command(
    name = "pdf-toolkit",
    version,
    about = "Merge, split, compress and rasterize PDF files",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[command(flatten)]
    global: GlobalArgs,
}

#[derive(Args, Debug)]
struct GlobalArgs {
    /// Directory for staged inputs and produced artifacts.
    #[arg(long, global = true, env = "PDF_TOOLKIT_UPLOAD_ROOT")]
    upload_root: Option<PathBuf>,

    /// Seconds before artifacts in the upload root are removed.
    #[arg(long, global = true, env = "PDF_TOOLKIT_CLEANUP_DELAY", default_value_t = 1800)]
    cleanup_delay: u64,

    /// Persist operation records as JSON files in this directory.
    #[arg(long, global = true, env = "PDF_TOOLKIT_TRACKING_DIR")]
    tracking_dir: Option<PathBuf>,

    /// Disable operation tracking.
    #[arg(long, global = true, env = "PDF_TOOLKIT_NO_TRACKING")]
    no_tracking: bool,

    /// pdfium shared library (file or directory) for the primary backend.
    #[arg(long, global = true, env = "PDFIUM_LIB_PATH")]
    pdfium_lib: Option<PathBuf>,

    /// Program used by the poppler backend.
    #[arg(long, global = true, env = "PDF_TOOLKIT_POPPLER", default_value = "pdftoppm")]
    poppler: String,

    /// Longest rendered edge in pixels (100–10000).
    #[arg(long, global = true, env = "PDF_TOOLKIT_MAX_PIXELS", default_value_t = 2000,
          value_parser = clap::value_parser!(u32).range(100..=10000))]
    max_pixels: u32,

    /// JPEG quality for convert (1–100).
    #[arg(long, global = true, env = "PDF_TOOLKIT_JPEG_QUALITY", default_value_t = 80,
          value_parser = clap::value_parser!(u8).range(1..=100))]
    jpeg_quality: u8,

    /// Fail an operation that runs longer than this many seconds.
    #[arg(long, global = true, env = "PDF_TOOLKIT_TIMEOUT")]
    timeout: Option<u64>,

    /// Remove leftovers in the upload root before running.
    #[arg(long, global = true)]
    sweep: bool,

    /// Include original error text in failures.
    #[arg(long, global = true, env = "PDF_TOOLKIT_DIAGNOSTICS")]
    diagnostics: bool,

    /// Output structured JSON instead of a summary.
    #[arg(long, global = true, env = "PDF_TOOLKIT_JSON")]
    json: bool,

    /// Disable the progress spinner.
    #[arg(long, global = true)]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "PDF_TOOLKIT_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true, env = "PDF_TOOLKIT_QUIET")]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Concatenate PDFs in the given order.
    Merge {
        /// At least two PDF files.
        #[arg(required = true, num_args = 2..)]
        inputs: Vec<PathBuf>,
        /// Copy the merged PDF here.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Extract pages into single-page PDFs.
    Split {
        input: PathBuf,
        /// all, 1,3,5 or [1,3,5]. Order is kept; out-of-range pages are ignored.
        #[arg(long, default_value = "all")]
        pages: String,
        /// Copy the page files into this directory.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Reduce file size. The result is never larger than the input.
    Compress {
        input: PathBuf,
        /// 0.0–1.0: ≤0.3 aggressive (rasterized), ≤0.6 medium, otherwise light.
        #[arg(long)]
        quality: Option<f64>,
        /// Copy the compressed PDF here.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Rasterize every page to PNG or JPEG.
    Convert {
        input: PathBuf,
        /// png, jpg or jpeg.
        #[arg(long, default_value = "png")]
        format: String,
        /// Copy the images into this directory.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Print document metadata.
    Info { input: PathBuf },
    /// Report which rasterization backends can run here.
    Capabilities,
}

impl Command {
    fn label(&self) -> &'static str {
        match self {
            Command::Merge { .. } => "Merging",
            Command::Split { .. } => "Splitting",
            Command::Compress { .. } => "Compressing",
            Command::Convert { .. } => "Converting",
            Command::Info { .. } => "Reading",
            Command::Capabilities => "Probing",
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let g = &cli.global;

    // ── Logging setup ────────────────────────────────────────────────────
    let show_progress = !g.quiet && !g.no_progress && !g.json;
    let filter = if g.verbose {
        "debug"
    } else if g.quiet || show_progress {
        "error"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    // ── Build toolkit ────────────────────────────────────────────────────
    let config = build_config(g)?;
    let mut toolkit = Toolkit::start(config)
        .await
        .context("Failed to start pdf-toolkit")?;

    let progress = show_progress.then(|| CliProgress::new(cli.command.label()));
    if let Some(ref p) = progress {
        toolkit = toolkit.with_progress(p.clone());
    }

    let result = run(&toolkit, cli.command, g).await;

    if let Some(p) = progress {
        p.bar.finish_and_clear();
    }
    toolkit.shutdown(ShutdownMode::Persist).await;
    result
}

/// Map CLI args to `ToolkitConfig`.
fn build_config(g: &GlobalArgs) -> Result<ToolkitConfig> {
    let root = g
        .upload_root
        .clone()
        .unwrap_or_else(|| std::env::temp_dir().join("pdf-toolkit"));

    let mut builder = ToolkitConfig::builder()
        .upload_root(root)
        .cleanup_delay(Duration::from_secs(g.cleanup_delay))
        .sweep_on_start(g.sweep)
        .tracking_disabled(g.no_tracking)
        .poppler_program(g.poppler.clone())
        .max_rendered_pixels(g.max_pixels)
        .jpeg_quality(g.jpeg_quality)
        .diagnostics(g.diagnostics);

    if let Some(ref dir) = g.tracking_dir {
        builder = builder.tracking_dir(dir);
    }
    if let Some(ref lib) = g.pdfium_lib {
        builder = builder.pdfium_library_path(lib);
    }
    if let Some(secs) = g.timeout {
        builder = builder.operation_timeout(Duration::from_secs(secs));
    }

    builder.build().context("Invalid configuration")
}

async fn run(toolkit: &Toolkit, command: Command, g: &GlobalArgs) -> Result<()> {
    match command {
        Command::Merge { inputs, output } => {
            let files = inputs
                .iter()
                .map(InputFile::from_path)
                .collect::<Result<Vec<_>, _>>()
                .context("Failed to read inputs")?;
            let out = toolkit.merge(files).await.context("Merge failed")?;
            let copied = match output {
                Some(dest) => Some(copy_artifact(toolkit, &out.download_locator, &dest).await?),
                None => None,
            };
            if g.json {
                return print_json(&out);
            }
            if !g.quiet {
                eprintln!(
                    "{} merged {} pages  {}  {}ms",
                    green("✔"),
                    bold(&out.page_count.to_string()),
                    format_file_size(out.result_size),
                    out.processing_duration_ms
                );
                print_location(toolkit, &out.download_locator, copied.as_deref());
            }
        }
        Command::Split {
            input,
            pages,
            output,
        } => {
            let selection = PageSelection::parse(&pages).context("Invalid --pages")?;
            let file = InputFile::from_path(&input).context("Failed to read input")?;
            let out = toolkit.split(file, selection).await.context("Split failed")?;
            let copied = copy_items(toolkit, &out.items, output.as_deref()).await?;
            if g.json {
                return print_json(&out);
            }
            if !g.quiet {
                eprintln!(
                    "{} {} pages extracted  {}ms",
                    green("✔"),
                    bold(&out.items.len().to_string()),
                    out.processing_duration_ms
                );
                print_items(toolkit, &out.items, copied.as_deref());
            }
        }
        Command::Compress {
            input,
            quality,
            output,
        } => {
            let file = InputFile::from_path(&input).context("Failed to read input")?;
            let out = toolkit
                .compress(file, quality)
                .await
                .context("Compression failed")?;
            let copied = match output {
                Some(dest) => Some(copy_artifact(toolkit, &out.download_locator, &dest).await?),
                None => None,
            };
            if g.json {
                return print_json(&out);
            }
            if !g.quiet {
                eprintln!(
                    "{} {}  {} → {}  ({}%, {} strategy)",
                    green("✔"),
                    out.message,
                    format_file_size(out.original_size),
                    bold(&format_file_size(out.compressed_size)),
                    out.compression_ratio_percent,
                    out.strategy
                );
                print_location(toolkit, &out.download_locator, copied.as_deref());
            }
        }
        Command::Convert {
            input,
            format,
            output,
        } => {
            let file = InputFile::from_path(&input).context("Failed to read input")?;
            let out = toolkit
                .convert(file, &format)
                .await
                .context("Conversion failed")?;
            let copied = copy_items(toolkit, &out.items, output.as_deref()).await?;
            if g.json {
                return print_json(&out);
            }
            if !g.quiet {
                eprintln!(
                    "{} {} {} images via {}  {}ms",
                    green("✔"),
                    bold(&out.items.len().to_string()),
                    out.format.as_deref().unwrap_or("").to_uppercase(),
                    out.backend.as_deref().unwrap_or("?"),
                    out.processing_duration_ms
                );
                if !out.skipped_pages.is_empty() {
                    eprintln!("  {} skipped pages: {:?}", cyan("⚠"), out.skipped_pages);
                }
                print_items(toolkit, &out.items, copied.as_deref());
            }
        }
        Command::Info { input } => {
            let file = InputFile::from_path(&input).context("Failed to read input")?;
            let info = toolkit.inspect(file).await.context("Failed to inspect PDF")?;
            if g.json {
                return print_json(&info);
            }
            let m = &info.metadata;
            println!("File:         {}", info.name);
            println!("Size:         {}", info.size_human);
            println!("Pages:        {}", m.page_count);
            println!("Title:        {}", m.title);
            println!("Author:       {}", m.author);
            println!("Creator:      {}", m.creator);
            println!("Producer:     {}", m.producer);
            if let Some(ts) = m.creation_date {
                println!("Created:      {}", ts.to_rfc3339());
            }
            if let Some(ts) = m.modification_date {
                println!("Modified:     {}", ts.to_rfc3339());
            }
        }
        Command::Capabilities => {
            let caps = toolkit.capabilities().await;
            if g.json {
                return print_json(&caps);
            }
            for b in &caps.backends {
                let mark = if b.available { green("✓") } else { red("✗") };
                println!("{} {}", mark, b.name);
            }
            println!(
                "tracking: {}{}",
                caps.tracking_store,
                if caps.tracking_persistent { " (persistent)" } else { "" }
            );
            if !caps.backends.iter().any(|b| b.available) {
                bail!("No rasterization backend is available");
            }
        }
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("Failed to serialise output")?;
    println!("{json}");
    Ok(())
}

fn artifact_path(toolkit: &Toolkit, locator: &str) -> Result<PathBuf> {
    toolkit
        .config()
        .resolve_locator(locator)
        .with_context(|| format!("Locator '{locator}' is outside the upload root"))
}

async fn copy_artifact(toolkit: &Toolkit, locator: &str, dest: &Path) -> Result<PathBuf> {
    let src = artifact_path(toolkit, locator)?;
    if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    tokio::fs::copy(&src, dest)
        .await
        .with_context(|| format!("Failed to copy {} to {}", src.display(), dest.display()))?;
    Ok(dest.to_path_buf())
}

async fn copy_items(
    toolkit: &Toolkit,
    items: &[ArtifactItem],
    dest_dir: Option<&Path>,
) -> Result<Option<PathBuf>> {
    let Some(dir) = dest_dir else {
        return Ok(None);
    };
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("Failed to create {}", dir.display()))?;
    for item in items {
        copy_artifact(toolkit, &item.download_locator, &dir.join(&item.name)).await?;
    }
    Ok(Some(dir.to_path_buf()))
}

fn print_location(toolkit: &Toolkit, locator: &str, copied: Option<&Path>) {
    match copied {
        Some(dest) => eprintln!("   → {}", bold(&dest.display().to_string())),
        None => {
            if let Ok(path) = artifact_path(toolkit, locator) {
                eprintln!(
                    "   → {}  {}",
                    bold(&path.display().to_string()),
                    dim("(removed after the cleanup delay)")
                );
            }
        }
    }
}

fn print_items(toolkit: &Toolkit, items: &[ArtifactItem], copied: Option<&Path>) {
    if let Some(dir) = copied {
        eprintln!("   → {}", bold(&dir.display().to_string()));
        return;
    }
    for item in items {
        if let Ok(path) = artifact_path(toolkit, &item.download_locator) {
            eprintln!(
                "   {} {}  {}",
                dim("·"),
                path.display(),
                dim(&format_file_size(item.size))
            );
        }
    }
}

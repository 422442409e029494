//! Input handling: validate caller-supplied documents and stage them under
//! the upload root.
//!
//! Inputs arrive either as bytes (an upload already parsed by the serving
//! layer) or as a path on disk (the CLI). Byte inputs are written into the
//! upload root under a unique name and belong to the operation; path inputs
//! are read in place and never scheduled for removal.
//!
//! The `%PDF` magic is checked before anything touches lopdf or pdfium so
//! callers get a validation error instead of a parser failure.

use crate::error::ToolkitError;
use crate::tracker::FileDescriptor;
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Media type recorded for path inputs and assumed for byte inputs.
pub const PDF_MEDIA_TYPE: &str = "application/pdf";

static UNSAFE_NAME_CHARS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^A-Za-z0-9._-]+").expect("static regex"));

/// Where an input document's bytes come from.
#[derive(Debug, Clone)]
pub enum InputSource {
    Bytes(Vec<u8>),
    Path(PathBuf),
}

/// One caller-supplied document plus its declared descriptors.
#[derive(Debug, Clone)]
pub struct InputFile {
    pub name: String,
    pub size: u64,
    pub media_type: String,
    pub source: InputSource,
}

impl InputFile {
    pub fn from_bytes(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            size: bytes.len() as u64,
            media_type: PDF_MEDIA_TYPE.to_string(),
            source: InputSource::Bytes(bytes),
        }
    }

    /// Describe a file on disk. The size is read from its metadata.
    pub fn from_path(path: impl Into<PathBuf>) -> Result<Self, ToolkitError> {
        let path = path.into();
        let meta = std::fs::metadata(&path).map_err(|e| ToolkitError::io(&path, e))?;
        if !meta.is_file() {
            return Err(ToolkitError::Validation(format!(
                "'{}' is not a regular file",
                path.display()
            )));
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "document.pdf".to_string());
        Ok(Self {
            name,
            size: meta.len(),
            media_type: PDF_MEDIA_TYPE.to_string(),
            source: InputSource::Path(path),
        })
    }

    pub fn with_media_type(mut self, media_type: impl Into<String>) -> Self {
        self.media_type = media_type.into();
        self
    }

    pub fn descriptor(&self) -> FileDescriptor {
        FileDescriptor {
            name: self.name.clone(),
            size: self.size,
            media_type: self.media_type.clone(),
        }
    }

    /// Check the `%PDF` marker without reading the whole file.
    pub fn validate(&self) -> Result<(), ToolkitError> {
        let head = match &self.source {
            InputSource::Bytes(b) => b.iter().take(4).copied().collect::<Vec<u8>>(),
            InputSource::Path(p) => read_head(p)?,
        };
        check_magic(&self.name, &head)
    }

    /// Bring the input under `root` and load its bytes.
    pub async fn stage(&self, root: &Path) -> Result<StagedInput, ToolkitError> {
        match &self.source {
            InputSource::Bytes(bytes) => {
                let path = root.join(generate_unique_filename(&self.name, ""));
                tokio::fs::write(&path, bytes)
                    .await
                    .map_err(|e| ToolkitError::io(&path, e))?;
                debug!("Staged upload '{}' → {}", self.name, path.display());
                Ok(StagedInput {
                    name: self.name.clone(),
                    path,
                    bytes: bytes.clone(),
                    owned: true,
                })
            }
            InputSource::Path(path) => {
                let bytes = tokio::fs::read(path)
                    .await
                    .map_err(|e| ToolkitError::io(path, e))?;
                Ok(StagedInput {
                    name: self.name.clone(),
                    path: path.clone(),
                    bytes,
                    owned: false,
                })
            }
        }
    }
}

/// An input that is readable from disk for the rest of the operation.
#[derive(Debug, Clone)]
pub struct StagedInput {
    pub name: String,
    pub path: PathBuf,
    pub bytes: Vec<u8>,
    /// True when the file was written by the toolkit and must be cleaned up.
    pub owned: bool,
}

impl StagedInput {
    pub fn load(&self) -> Result<lopdf::Document, ToolkitError> {
        load_document(&self.name, &self.bytes)
    }
}

/// Parse a document from memory, mapping parser failures to `CorruptPdf`.
pub fn load_document(name: &str, bytes: &[u8]) -> Result<lopdf::Document, ToolkitError> {
    lopdf::Document::load_mem(bytes).map_err(|e| ToolkitError::CorruptPdf {
        name: name.to_string(),
        detail: e.to_string(),
    })
}

/// Reject anything that does not start with `%PDF`.
pub fn check_magic(name: &str, head: &[u8]) -> Result<(), ToolkitError> {
    if head.len() >= 4 && &head[..4] == b"%PDF" {
        Ok(())
    } else {
        Err(ToolkitError::NotAPdf {
            name: name.to_string(),
            magic: head.iter().take(4).copied().collect(),
        })
    }
}

fn read_head(path: &Path) -> Result<Vec<u8>, ToolkitError> {
    use std::io::Read;
    let file = std::fs::File::open(path).map_err(|e| ToolkitError::io(path, e))?;
    let mut head = Vec::with_capacity(4);
    file.take(4)
        .read_to_end(&mut head)
        .map_err(|e| ToolkitError::io(path, e))?;
    Ok(head)
}

/// Build a collision-resistant artifact name:
/// `{stem}{suffix}_{unix_millis}_{random}{ext}`.
///
/// Characters outside `[A-Za-z0-9._-]` in the stem are replaced by `_`,
/// then leading and trailing `_` are trimmed.
pub fn generate_unique_filename(original: &str, suffix: &str) -> String {
    let path = Path::new(original);
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = path
        .extension()
        .map(|e| format!(".{}", UNSAFE_NAME_CHARS.replace_all(&e.to_string_lossy(), "")))
        .unwrap_or_default();

    let mut stem = UNSAFE_NAME_CHARS
        .replace_all(&stem, "_")
        .trim_matches('_')
        .to_string();
    if stem.is_empty() {
        stem.push_str("file");
    }

    let millis = chrono::Utc::now().timestamp_millis();
    let random = uuid::Uuid::new_v4().simple().to_string();
    format!("{stem}{suffix}_{millis}_{}{ext}", &random[..9])
}

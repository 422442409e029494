//! Output types returned by [`crate::toolkit::Toolkit`] operations.
//!
//! All outputs are plain serde structs so a serving layer can return them
//! as JSON verbatim. Sizes are bytes, durations milliseconds.

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};

/// Descriptive metadata read from a document's Info dictionary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub page_count: u32,
    /// "Untitled" when absent.
    pub title: String,
    /// "Unknown" when absent, as are `creator` and `producer`.
    pub author: String,
    pub creator: String,
    pub producer: String,
    pub creation_date: Option<DateTime<FixedOffset>>,
    pub modification_date: Option<DateTime<FixedOffset>>,
}

impl Default for DocumentMetadata {
    fn default() -> Self {
        Self {
            page_count: 0,
            title: "Untitled".to_string(),
            author: "Unknown".to_string(),
            creator: "Unknown".to_string(),
            producer: "Unknown".to_string(),
            creation_date: None,
            modification_date: None,
        }
    }
}

/// Result of a merge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeOutput {
    pub operation_id: String,
    pub result_name: String,
    pub result_size: u64,
    pub download_locator: String,
    pub page_count: u32,
    pub processing_duration_ms: u64,
}

/// One downloadable artifact of a multi-file result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactItem {
    pub name: String,
    pub size: u64,
    pub download_locator: String,
}

/// Result of a split or convert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemsOutput {
    pub operation_id: String,
    pub items: Vec<ArtifactItem>,
    pub processing_duration_ms: u64,
    /// Winning rasterization backend (convert only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
    /// Image format produced (convert only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    /// Pages a convert backend could not render.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skipped_pages: Vec<u32>,
}

/// Result of a compress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressOutput {
    pub operation_id: String,
    pub result_name: String,
    pub original_size: u64,
    pub compressed_size: u64,
    /// Percentage saved, rounded to one decimal. 0.0 when nothing was gained.
    pub compression_ratio_percent: f64,
    pub download_locator: String,
    pub processing_duration_ms: u64,
    pub strategy: String,
    pub message: String,
}

/// Result of an inspect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InspectOutput {
    pub name: String,
    pub size: u64,
    pub size_human: String,
    pub metadata: DocumentMetadata,
}

/// Render a byte count as "Bytes", "KB", "MB" or "GB" with up to two decimals.
pub fn format_file_size(bytes: u64) -> String {
    if bytes == 0 {
        return "0 Bytes".to_string();
    }
    const UNITS: [&str; 4] = ["Bytes", "KB", "MB", "GB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    let rounded = (value * 100.0).round() / 100.0;
    format!("{} {}", rounded, UNITS[unit])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_size_units() {
        assert_eq!(format_file_size(0), "0 Bytes");
        assert_eq!(format_file_size(512), "512 Bytes");
        assert_eq!(format_file_size(1536), "1.5 KB");
        assert_eq!(format_file_size(1024 * 1024), "1 MB");
        assert_eq!(format_file_size(3 * 1024 * 1024 * 1024), "3 GB");
    }

    #[test]
    fn metadata_defaults() {
        let m = DocumentMetadata::default();
        assert_eq!(m.title, "Untitled");
        assert_eq!(m.producer, "Unknown");
        assert!(m.creation_date.is_none());
    }

    #[test]
    fn items_output_omits_convert_fields_for_split() {
        let out = ItemsOutput {
            operation_id: "x".into(),
            items: vec![],
            processing_duration_ms: 3,
            backend: None,
            format: None,
            skipped_pages: vec![],
        };
        let json = serde_json::to_string(&out).unwrap();
        assert!(!json.contains("backend"));
        assert!(!json.contains("skipped_pages"));
    }
}

//! Page-level document assembly over lopdf documents.
//!
//! [`merge`] and [`split`] never touch their inputs: merge consumes owned
//! documents, split works on clones. Inheritable page attributes are copied
//! onto each page before it leaves its original page tree, so a page that
//! relied on a `MediaBox` or `Resources` entry of an ancestor `Pages` node
//! keeps its appearance.

use crate::config::PageSelection;
use crate::error::ToolkitError;
use crate::output::DocumentMetadata;
use chrono::{DateTime, FixedOffset, NaiveDate, TimeZone, Utc};
use lopdf::{Dictionary, Document, Object, ObjectId, StringFormat};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Page attributes a page may inherit from its ancestors.
const INHERITABLE: [&[u8]; 4] = [b"Resources", b"MediaBox", b"CropBox", b"Rotate"];

/// Guard against cyclic `Parent` chains in malformed files.
const MAX_TREE_DEPTH: usize = 64;

/// Catalog entries that reference pages across the whole document.
const DOCUMENT_LEVEL_KEYS: [&[u8]; 4] = [b"Outlines", b"AcroForm", b"Names", b"Dests"];

static PDF_DATE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(?:D:)?(\d{4})(\d{2})?(\d{2})?(\d{2})?(\d{2})?(\d{2})?(?:([+\-Z])(?:(\d{2})'?(?:(\d{2})'?)?)?)?",
    )
    .expect("static regex")
});

/// One page extracted by [`split`].
#[derive(Debug, Clone)]
pub struct SplitPage {
    /// 1-indexed page number in the source document.
    pub page_number: u32,
    pub document: Document,
}

impl SplitPage {
    /// Artifact name: `page_{n}.pdf`.
    pub fn file_name(&self) -> String {
        format!("page_{}.pdf", self.page_number)
    }
}

// ── Merge ────────────────────────────────────────────────────────────────

/// Concatenate documents into one, preserving input order and page order.
///
/// Object ids of each input are shifted past the previous input's so nothing
/// collides; every page is re-parented under a fresh `Pages` node.
pub fn merge(documents: Vec<Document>) -> Result<Document, ToolkitError> {
    if documents.is_empty() {
        return Err(ToolkitError::InvalidInput("no documents to merge".into()));
    }

    let version = documents
        .iter()
        .map(|d| d.version.clone())
        .max()
        .unwrap_or_else(|| "1.5".to_string());

    let mut max_id: u32 = 1;
    let mut page_order: Vec<ObjectId> = Vec::new();
    let mut page_dicts: BTreeMap<ObjectId, Dictionary> = BTreeMap::new();
    let mut objects: BTreeMap<ObjectId, Object> = BTreeMap::new();

    for (index, mut doc) in documents.into_iter().enumerate() {
        doc.renumber_objects_with(max_id);
        max_id = doc.max_id + 1;

        for (_, page_id) in doc.get_pages() {
            let dict = page_with_inherited_attributes(&doc, page_id).map_err(|e| {
                ToolkitError::CorruptPdf {
                    name: format!("input #{}", index + 1),
                    detail: e.to_string(),
                }
            })?;
            page_order.push(page_id);
            page_dicts.insert(page_id, dict);
        }

        for (object_id, object) in doc.objects {
            match object.type_name().unwrap_or_default() {
                "Catalog" | "Pages" | "Page" | "Outlines" | "Outline" => {}
                _ => {
                    objects.insert(object_id, object);
                }
            }
        }
    }

    let mut merged = Document::with_version(version);
    merged.objects.extend(objects);
    merged.max_id = max_id;

    let pages_id = merged.new_object_id();
    for (page_id, mut dict) in page_dicts {
        dict.set("Parent", Object::Reference(pages_id));
        merged.objects.insert(page_id, Object::Dictionary(dict));
    }

    let kids: Vec<Object> = page_order.iter().map(|&id| Object::Reference(id)).collect();
    let page_count = kids.len();
    merged.objects.insert(
        pages_id,
        Object::Dictionary(Dictionary::from_iter([
            ("Type", Object::Name(b"Pages".to_vec())),
            ("Kids", Object::Array(kids)),
            ("Count", Object::Integer(page_count as i64)),
        ])),
    );

    let catalog_id = merged.add_object(Dictionary::from_iter([
        ("Type", Object::Name(b"Catalog".to_vec())),
        ("Pages", Object::Reference(pages_id)),
    ]));
    merged.trailer.set("Root", Object::Reference(catalog_id));

    let info_id = merged.add_object(producer_info(Utc::now().fixed_offset()));
    merged.trailer.set("Info", Object::Reference(info_id));

    // Source Info dictionaries and outline leftovers are now unreachable.
    let _ = merged.prune_objects();
    merged.renumber_objects();

    info!("Merged {} pages", page_count);
    Ok(merged)
}

// ── Split ────────────────────────────────────────────────────────────────

/// Extract one single-page document per selected page.
///
/// See [`PageSelection::resolve`] for ordering and filtering rules.
pub fn split(doc: &Document, selection: &PageSelection) -> Result<Vec<SplitPage>, ToolkitError> {
    let pages = doc.get_pages();
    let total = pages.len() as u32;
    let wanted = selection.resolve(total);
    debug!("Splitting {} of {} pages", wanted.len(), total);

    let mut out = Vec::with_capacity(wanted.len());
    for page_number in wanted {
        let Some(&page_id) = pages.get(&page_number) else {
            continue;
        };

        let mut single = doc.clone();
        let dict = page_with_inherited_attributes(&single, page_id).map_err(|e| {
            ToolkitError::CorruptPdf {
                name: format!("page {page_number}"),
                detail: e.to_string(),
            }
        })?;
        single.objects.insert(page_id, Object::Dictionary(dict));
        strip_document_level_references(&mut single);

        let others: Vec<u32> = (1..=total).filter(|&p| p != page_number).collect();
        single.delete_pages(&others);
        let _ = single.prune_objects();
        single.renumber_objects();

        out.push(SplitPage {
            page_number,
            document: single,
        });
    }
    Ok(out)
}

/// Drop catalog entries that can reach pages other than the kept one.
fn strip_document_level_references(doc: &mut Document) {
    let Ok(root_id) = doc.trailer.get(b"Root").and_then(Object::as_reference) else {
        return;
    };
    if let Ok(catalog) = doc.get_object_mut(root_id).and_then(Object::as_dict_mut) {
        for key in DOCUMENT_LEVEL_KEYS {
            catalog.remove(key);
        }
    }
}

/// Clone a page dictionary with every inheritable attribute made explicit.
pub(crate) fn page_with_inherited_attributes(
    doc: &Document,
    page_id: ObjectId,
) -> lopdf::Result<Dictionary> {
    let mut dict = doc.get_dictionary(page_id)?.clone();
    for key in INHERITABLE {
        if dict.has(key) {
            continue;
        }
        if let Some(value) = inherited_attribute(doc, &dict, key) {
            dict.set(key.to_vec(), value);
        }
    }
    Ok(dict)
}

fn inherited_attribute(doc: &Document, page: &Dictionary, key: &[u8]) -> Option<Object> {
    let mut parent_id = page.get(b"Parent").and_then(Object::as_reference).ok()?;
    for _ in 0..MAX_TREE_DEPTH {
        let parent = doc.get_dictionary(parent_id).ok()?;
        if let Ok(value) = parent.get(key) {
            return Some(value.clone());
        }
        parent_id = parent.get(b"Parent").and_then(Object::as_reference).ok()?;
    }
    None
}

// ── Metadata ─────────────────────────────────────────────────────────────

/// Read page count and the Info dictionary. Missing entries get defaults.
pub fn metadata(doc: &Document) -> DocumentMetadata {
    let mut meta = DocumentMetadata {
        page_count: doc.get_pages().len() as u32,
        ..DocumentMetadata::default()
    };

    let Some(info) = info_dictionary(doc) else {
        return meta;
    };

    let text = |key: &[u8]| -> Option<String> {
        let value = info.get(key).ok().map(|v| resolve(doc, v))?;
        match value {
            Object::String(bytes, _) => {
                let s = decode_text_string(bytes);
                let s = s.trim();
                (!s.is_empty()).then(|| s.to_string())
            }
            _ => None,
        }
    };

    if let Some(v) = text(b"Title") {
        meta.title = v;
    }
    if let Some(v) = text(b"Author") {
        meta.author = v;
    }
    if let Some(v) = text(b"Creator") {
        meta.creator = v;
    }
    if let Some(v) = text(b"Producer") {
        meta.producer = v;
    }
    meta.creation_date = text(b"CreationDate").and_then(|s| parse_pdf_date(&s));
    meta.modification_date = text(b"ModDate").and_then(|s| parse_pdf_date(&s));
    meta
}

fn info_dictionary(doc: &Document) -> Option<&Dictionary> {
    match doc.trailer.get(b"Info").ok()? {
        Object::Reference(id) => doc.get_dictionary(*id).ok(),
        Object::Dictionary(d) => Some(d),
        _ => None,
    }
}

fn resolve<'a>(doc: &'a Document, obj: &'a Object) -> &'a Object {
    match obj {
        Object::Reference(id) => doc.get_object(*id).unwrap_or(obj),
        _ => obj,
    }
}

/// Decode a PDF text string: UTF-16BE with BOM, UTF-8, else Latin-1.
fn decode_text_string(bytes: &[u8]) -> String {
    if let Some(rest) = bytes.strip_prefix(&[0xFE, 0xFF]) {
        let units: Vec<u16> = rest
            .chunks_exact(2)
            .map(|c| u16::from_be_bytes([c[0], c[1]]))
            .collect();
        return String::from_utf16_lossy(&units);
    }
    let bytes = bytes.strip_prefix(&[0xEF, 0xBB, 0xBF]).unwrap_or(bytes);
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => bytes.iter().map(|&b| b as char).collect(),
    }
}

/// Parse `D:YYYYMMDDHHmmSSOHH'mm'`. Every field after the year is optional.
pub fn parse_pdf_date(raw: &str) -> Option<DateTime<FixedOffset>> {
    let caps = PDF_DATE.captures(raw.trim())?;
    let num = |i: usize, default: u32| -> u32 {
        caps.get(i)
            .and_then(|m| m.as_str().parse().ok())
            .unwrap_or(default)
    };

    let year: i32 = caps.get(1)?.as_str().parse().ok()?;
    let date = NaiveDate::from_ymd_opt(year, num(2, 1), num(3, 1))?;
    let naive = date.and_hms_opt(num(4, 0), num(5, 0), num(6, 0))?;

    let offset_secs = match caps.get(7).map(|m| m.as_str()) {
        Some("+") => (num(8, 0) * 3600 + num(9, 0) * 60) as i32,
        Some("-") => -((num(8, 0) * 3600 + num(9, 0) * 60) as i32),
        _ => 0,
    };
    FixedOffset::east_opt(offset_secs)?
        .from_local_datetime(&naive)
        .single()
}

/// Format a timestamp as a PDF date string.
pub fn format_pdf_date(ts: DateTime<FixedOffset>) -> String {
    let offset = ts.offset().local_minus_utc();
    let sign = if offset < 0 { '-' } else { '+' };
    let abs = offset.abs();
    format!(
        "D:{}{}{:02}'{:02}'",
        ts.format("%Y%m%d%H%M%S"),
        sign,
        abs / 3600,
        (abs % 3600) / 60
    )
}

fn producer_info(now: DateTime<FixedOffset>) -> Dictionary {
    let date = Object::String(format_pdf_date(now).into_bytes(), StringFormat::Literal);
    let name = Object::String(b"pdf-toolkit".to_vec(), StringFormat::Literal);
    Dictionary::from_iter([
        ("Producer", name.clone()),
        ("Creator", name),
        ("CreationDate", date.clone()),
        ("ModDate", date),
    ])
}

// ── Serialisation ────────────────────────────────────────────────────────

/// Serialise a document to bytes.
pub fn save_to_bytes(doc: &mut Document, name: &str) -> Result<Vec<u8>, ToolkitError> {
    let mut buf = Vec::new();
    doc.save_to(&mut buf).map_err(|e| ToolkitError::SaveFailed {
        name: name.to_string(),
        detail: e.to_string(),
    })?;
    Ok(buf)
}

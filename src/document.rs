// src/document.rs

use crate::error::DocumentError;
use crate::llm_extract::Content;
use calamine::{Reader, open_workbook_auto};
use lopdf::{Dictionary, Document};
use quick_xml::events::Event;
use std::fs;
use std::io::{Cursor, Read};
use std::path::Path;
use tracing::{debug, info, warn};

/// Extensions accepted for single-shot extraction.
pub const SUPPORTED_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "pdf", "docx", "xlsx", "txt"];

/// Read a file into something the model can take, dispatching on extension.
pub fn load(path: &Path) -> Result<Content, DocumentError> {
    let ext = extension(path);
    if !SUPPORTED_EXTENSIONS.contains(&ext.as_str()) {
        return Err(DocumentError::Unsupported(ext));
    }
    let bytes = fs::read(path).map_err(|source| DocumentError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    info!(file = %path.display(), ext = %ext, bytes = bytes.len(), "Reading document");

    let text = match ext.as_str() {
        "png" | "jpg" | "jpeg" => {
            let mime_type = if ext == "png" { "image/png" } else { "image/jpeg" };
            return Ok(Content::Image {
                mime_type: mime_type.to_string(),
                bytes,
            });
        }
        "pdf" => extract_text_from_pdf(&bytes)?,
        "docx" => extract_text_from_docx(&bytes)?,
        "xlsx" => extract_text_from_xlsx(path)?,
        "txt" => String::from_utf8(bytes).map_err(|_| DocumentError::NotUtf8)?,
        other => return Err(DocumentError::Unsupported(other.to_string())),
    };

    text_content(text)
}

/// Wrap pasted or piped text, rejecting blank input.
pub fn text_content(text: String) -> Result<Content, DocumentError> {
    if text.trim().is_empty() {
        return Err(DocumentError::Empty);
    }
    Ok(Content::Text(text))
}

/// Lower-cased extension, or an empty string.
pub fn extension(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase()
}

/// Minimum number of non-whitespace characters we expect from a
/// "real" text PDF. Below this threshold we treat it as scanned.
const MIN_TEXT_CHARS: usize = 30;

pub fn extract_text_from_pdf(pdf_bytes: &[u8]) -> Result<String, DocumentError> {
    let doc = Document::load_mem(pdf_bytes)
        .map_err(|e| DocumentError::Pdf(format!("failed to parse PDF: {e}")))?;

    if looks_like_scanned(&doc) {
        info!("PDF structural check: likely scanned / image-only");
        return Err(DocumentError::ScannedPdf);
    }

    let text = pdf_extract::extract_text_from_mem(pdf_bytes).map_err(|e| {
        warn!(error = %e, "pdf-extract failed");
        DocumentError::Pdf(e.to_string())
    })?;

    let meaningful = text.chars().filter(|c| !c.is_whitespace()).count();
    if meaningful < MIN_TEXT_CHARS {
        info!(chars = meaningful, "Extracted text too short, treating as scanned");
        return Err(DocumentError::ScannedPdf);
    }
    debug!(chars = meaningful, "Text extracted from PDF");
    Ok(text)
}

/// A page with XObject images but no Font resources is almost certainly a
/// scanned page. If at least 80% of pages look like that, the PDF is scanned.
fn looks_like_scanned(doc: &Document) -> bool {
    let pages = doc.get_pages();
    if pages.is_empty() {
        return false;
    }

    let image_only_pages = pages
        .values()
        .filter_map(|id| doc.get_object(*id).ok())
        .filter_map(|obj| obj.as_dict().ok())
        .filter(|page| has_resource(doc, page, b"XObject") && !has_resource(doc, page, b"Font"))
        .count();

    let ratio = image_only_pages as f64 / pages.len() as f64;
    debug!(
        total_pages = pages.len(),
        image_only = image_only_pages,
        ratio = format!("{ratio:.2}"),
        "Scanned-page analysis"
    );
    ratio >= 0.8
}

/// Whether the page's `Resources` has a non-empty `key` dictionary.
fn has_resource(doc: &Document, page: &Dictionary, key: &[u8]) -> bool {
    page.get(b"Resources")
        .ok()
        .and_then(|r| doc.dereference(r).ok())
        .and_then(|(_, resolved)| resolved.as_dict().ok())
        .and_then(|res| res.get(key).ok())
        .and_then(|f| doc.dereference(f).ok())
        .and_then(|(_, resolved)| resolved.as_dict().ok())
        .is_some_and(|d| !d.is_empty())
}

/// Paragraph text of a `.docx`, one paragraph per line.
pub fn extract_text_from_docx(bytes: &[u8]) -> Result<String, DocumentError> {
    let mut archive =
        zip::ZipArchive::new(Cursor::new(bytes)).map_err(|e| DocumentError::Word(e.to_string()))?;
    let mut xml = String::new();
    archive
        .by_name("word/document.xml")
        .map_err(|e| DocumentError::Word(e.to_string()))?
        .read_to_string(&mut xml)
        .map_err(|e| DocumentError::Word(e.to_string()))?;

    let mut reader = quick_xml::Reader::from_str(&xml);
    let mut paragraphs = Vec::new();
    let mut current = String::new();
    let mut in_text = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) if e.name().as_ref() == b"w:t" => in_text = true,
            Ok(Event::End(e)) if e.name().as_ref() == b"w:t" => in_text = false,
            Ok(Event::End(e)) if e.name().as_ref() == b"w:p" => {
                paragraphs.push(std::mem::take(&mut current));
            }
            Ok(Event::Empty(e)) if e.name().as_ref() == b"w:p" => paragraphs.push(String::new()),
            Ok(Event::Empty(e)) if e.name().as_ref() == b"w:tab" => current.push('\t'),
            Ok(Event::Empty(e)) if e.name().as_ref() == b"w:br" => current.push('\n'),
            Ok(Event::Text(t)) if in_text => {
                let text = t.unescape().map_err(|e| DocumentError::Word(e.to_string()))?;
                current.push_str(&text);
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(DocumentError::Word(e.to_string())),
            _ => {}
        }
    }
    if !current.is_empty() {
        paragraphs.push(current);
    }

    Ok(paragraphs.join("\n"))
}

/// Every sheet rendered as a plain-text table.
pub fn extract_text_from_xlsx(path: &Path) -> Result<String, DocumentError> {
    let mut workbook = open_workbook_auto(path).map_err(|e| DocumentError::Excel(e.to_string()))?;
    let mut out = String::new();

    for name in workbook.sheet_names().to_vec() {
        let range = workbook
            .worksheet_range(&name)
            .map_err(|e| DocumentError::Excel(e.to_string()))?;
        if range.is_empty() {
            continue;
        }
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str(&format!("[{name}]\n"));
        for row in range.rows() {
            let cells: Vec<String> = row.iter().map(|c| c.to_string()).collect();
            out.push_str(cells.join("\t").trim_end());
            out.push('\n');
        }
    }
    Ok(out)
}

//! Text extraction for library documents (PDF, OOXML, plain text).
//!
//! The format is picked once from the declared MIME type, falling back to
//! the file extension when the MIME type is generic, and dispatched to one
//! handler per [`DocumentFormat`]. Every handler's output goes through
//! [`normalize_text`], so extracting the same bytes twice yields the same
//! string.
//!
//! Layout conventions:
//! - Word: one paragraph per block, separated by a blank line.
//! - PowerPoint: each slide starts with `--- Slide N ---`.
//! - Excel: each sheet starts with `--- Sheet: <name> ---`, one row per
//!   line with cells joined by ` | `.

use std::io::Read;

use chrono::{DateTime, Utc};
use quick_xml::events::Event;
use thiserror::Error;

use corpus_sync_core::error::SyncError;

pub const MIME_PDF: &str = "application/pdf";
pub const MIME_DOCX: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";
pub const MIME_PPTX: &str =
    "application/vnd.openxmlformats-officedocument.presentationml.presentation";
pub const MIME_XLSX: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";
pub const MIME_TEXT: &str = "text/plain";
pub const MIME_MARKDOWN: &str = "text/markdown";
pub const MIME_OCTET_STREAM: &str = "application/octet-stream";

/// Maximum sheets to process in an xlsx.
const XLSX_MAX_SHEETS: usize = 100;
/// Maximum cells to process per sheet (avoids unbounded memory).
const XLSX_MAX_CELLS_PER_SHEET: usize = 100_000;
/// Maximum decompressed bytes to read from a single ZIP entry (zip-bomb protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ExtractError {
    #[error("unsupported format: {0}")]
    Unsupported(String),
    #[error("PDF extraction failed: {0}")]
    Pdf(String),
    #[error("OOXML extraction failed: {0}")]
    Ooxml(String),
    #[error("extractor crashed: {0}")]
    Crashed(String),
}

impl From<ExtractError> for SyncError {
    fn from(e: ExtractError) -> Self {
        match e {
            ExtractError::Unsupported(what) => SyncError::UnsupportedFormat(what),
            other => SyncError::Extraction(other.to_string()),
        }
    }
}

/// Closed set of formats the extractor recognizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    Pdf,
    Word,
    Excel,
    PowerPoint,
    PlainText,
    Unsupported,
}

impl DocumentFormat {
    /// Pick the format from a MIME type, consulting the file name's
    /// extension only when the MIME type says nothing useful.
    pub fn detect(mime_type: &str, file_name: &str) -> Self {
        let mime = mime_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        match mime.as_str() {
            MIME_PDF => DocumentFormat::Pdf,
            MIME_DOCX => DocumentFormat::Word,
            MIME_XLSX => DocumentFormat::Excel,
            MIME_PPTX => DocumentFormat::PowerPoint,
            MIME_TEXT | MIME_MARKDOWN | "text/x-markdown" | "text/csv" => DocumentFormat::PlainText,
            "" | MIME_OCTET_STREAM | "binary/octet-stream" | "application/zip" => {
                Self::from_extension(file_name)
            }
            _ => DocumentFormat::Unsupported,
        }
    }

    pub fn from_extension(file_name: &str) -> Self {
        let ext = file_name
            .rsplit_once('.')
            .map(|(_, e)| e.to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "pdf" => DocumentFormat::Pdf,
            "docx" => DocumentFormat::Word,
            "xlsx" => DocumentFormat::Excel,
            "pptx" => DocumentFormat::PowerPoint,
            "txt" | "md" | "markdown" | "csv" | "log" => DocumentFormat::PlainText,
            _ => DocumentFormat::Unsupported,
        }
    }

    pub fn is_ooxml(&self) -> bool {
        matches!(
            self,
            DocumentFormat::Word | DocumentFormat::Excel | DocumentFormat::PowerPoint
        )
    }
}

/// MIME type for a file name, as a local library would report it.
pub fn mime_for_path(file_name: &str) -> &'static str {
    let ext = file_name
        .rsplit_once('.')
        .map(|(_, e)| e.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "pdf" => MIME_PDF,
        "docx" => MIME_DOCX,
        "xlsx" => MIME_XLSX,
        "pptx" => MIME_PPTX,
        "txt" | "log" => MIME_TEXT,
        "md" | "markdown" => MIME_MARKDOWN,
        "csv" => "text/csv",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "zip" => "application/zip",
        _ => MIME_OCTET_STREAM,
    }
}

/// OOXML `docProps/core.xml` properties.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CoreProperties {
    pub title: Option<String>,
    pub creator: Option<String>,
    pub created: Option<DateTime<Utc>>,
    pub modified: Option<DateTime<Utc>>,
}

/// Normalized text plus whatever document properties the format carries.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extraction {
    pub text: String,
    pub properties: CoreProperties,
}

/// Extract normalized text from `bytes` in `format`.
pub fn extract(bytes: &[u8], format: DocumentFormat) -> Result<Extraction, ExtractError> {
    let raw = match format {
        DocumentFormat::Pdf => extract_pdf(bytes)?,
        DocumentFormat::Word => extract_docx(bytes)?,
        DocumentFormat::Excel => extract_xlsx(bytes)?,
        DocumentFormat::PowerPoint => extract_pptx(bytes)?,
        DocumentFormat::PlainText => decode_text(bytes),
        DocumentFormat::Unsupported => {
            return Err(ExtractError::Unsupported("no extractor for format".to_string()))
        }
    };
    let properties = if format.is_ooxml() {
        read_core_properties(bytes)
    } else {
        CoreProperties::default()
    };
    Ok(Extraction {
        text: normalize_text(&raw),
        properties,
    })
}

/// Canonical text form: LF line ends, no BOM, single spaces, trimmed lines,
/// at most one blank line in a row, no outer whitespace.
pub fn normalize_text(raw: &str) -> String {
    let unified = raw
        .trim_start_matches('\u{feff}')
        .replace("\r\n", "\n")
        .replace('\r', "\n");

    let mut out = String::with_capacity(unified.len());
    let mut blank_run = 0usize;
    for line in unified.split('\n') {
        let collapsed = line.split_whitespace().collect::<Vec<_>>().join(" ");
        if collapsed.is_empty() {
            blank_run += 1;
            continue;
        }
        if !out.is_empty() {
            out.push('\n');
            if blank_run > 0 {
                out.push('\n');
            }
        }
        out.push_str(&collapsed);
        blank_run = 0;
    }
    out
}

fn decode_text(bytes: &[u8]) -> String {
    let bytes = bytes.strip_prefix(&[0xEF, 0xBB, 0xBF]).unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}

fn extract_pdf(bytes: &[u8]) -> Result<String, ExtractError> {
    pdf_extract::extract_text_from_mem(bytes).map_err(|e| ExtractError::Pdf(e.to_string()))
}

type Archive<'a> = zip::ZipArchive<std::io::Cursor<&'a [u8]>>;

fn open_archive(bytes: &[u8]) -> Result<Archive<'_>, ExtractError> {
    zip::ZipArchive::new(std::io::Cursor::new(bytes)).map_err(|e| ExtractError::Ooxml(e.to_string()))
}

fn read_zip_entry_bounded(
    archive: &mut Archive<'_>,
    name: &str,
    max_bytes: u64,
) -> Result<Vec<u8>, ExtractError> {
    let entry = archive
        .by_name(name)
        .map_err(|e| ExtractError::Ooxml(format!("{}: {}", name, e)))?;
    let mut out = Vec::new();
    entry
        .take(max_bytes)
        .read_to_end(&mut out)
        .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
    if out.len() as u64 >= max_bytes {
        return Err(ExtractError::Ooxml(format!(
            "ZIP entry {} exceeds size limit ({} bytes)",
            name, max_bytes
        )));
    }
    Ok(out)
}

/// Part names under `prefix` numbered like `slide12.xml`, in numeric order.
fn numbered_parts(archive: &Archive<'_>, prefix: &str) -> Vec<String> {
    let mut names: Vec<String> = archive
        .file_names()
        .filter(|n| n.starts_with(prefix) && n.ends_with(".xml"))
        .filter(|n| !n[prefix.len()..].contains('/'))
        .map(|s| s.to_string())
        .collect();
    names.sort_by_key(|name| {
        name.trim_start_matches(prefix)
            .trim_end_matches(".xml")
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });
    names
}

/// Text of every `<p>` element, with `<t>` runs concatenated and `<tab/>`
/// / `<br/>` kept as whitespace. Works for both WordprocessingML and
/// DrawingML paragraphs.
fn collect_paragraphs(xml: &[u8]) -> Result<Vec<String>, ExtractError> {
    let mut paragraphs = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut current: Option<String> = None;
    let mut in_t = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"p" => current = Some(String::new()),
                b"t" => in_t = true,
                _ => {}
            },
            Ok(Event::Empty(e)) => {
                if let Some(p) = current.as_mut() {
                    match e.local_name().as_ref() {
                        b"tab" => p.push('\t'),
                        b"br" | b"cr" => p.push('\n'),
                        _ => {}
                    }
                }
            }
            Ok(Event::Text(te)) if in_t => {
                if let Some(p) = current.as_mut() {
                    p.push_str(&te.unescape().unwrap_or_default());
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_t = false,
                b"p" => {
                    if let Some(p) = current.take() {
                        if !p.trim().is_empty() {
                            paragraphs.push(p);
                        }
                    }
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(paragraphs)
}

fn extract_docx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = open_archive(bytes)?;
    let doc_xml = read_zip_entry_bounded(&mut archive, "word/document.xml", MAX_XML_ENTRY_BYTES)?;
    Ok(collect_paragraphs(&doc_xml)?.join("\n\n"))
}

fn extract_pptx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = open_archive(bytes)?;
    let slide_names = numbered_parts(&archive, "ppt/slides/slide");
    let mut slides = Vec::with_capacity(slide_names.len());
    for (idx, name) in slide_names.iter().enumerate() {
        let xml = read_zip_entry_bounded(&mut archive, name, MAX_XML_ENTRY_BYTES)?;
        let paragraphs = collect_paragraphs(&xml)?;
        if paragraphs.is_empty() {
            continue;
        }
        slides.push(format!("--- Slide {} ---\n{}", idx + 1, paragraphs.join("\n")));
    }
    Ok(slides.join("\n\n"))
}

fn extract_xlsx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = open_archive(bytes)?;
    let shared_strings = if archive.by_name("xl/sharedStrings.xml").is_ok() {
        read_shared_strings(&mut archive)?
    } else {
        Vec::new()
    };
    let titles = if archive.by_name("xl/workbook.xml").is_ok() {
        let xml = read_zip_entry_bounded(&mut archive, "xl/workbook.xml", MAX_XML_ENTRY_BYTES)?;
        read_sheet_titles(&xml)?
    } else {
        Vec::new()
    };

    let sheet_names = numbered_parts(&archive, "xl/worksheets/sheet");
    let mut sheets = Vec::new();
    for (idx, name) in sheet_names.into_iter().take(XLSX_MAX_SHEETS).enumerate() {
        let sheet_xml = read_zip_entry_bounded(&mut archive, &name, MAX_XML_ENTRY_BYTES)?;
        let rows = extract_xlsx_rows(&sheet_xml, &shared_strings)?;
        if rows.is_empty() {
            continue;
        }
        let title = titles
            .get(idx)
            .cloned()
            .unwrap_or_else(|| format!("Sheet{}", idx + 1));
        sheets.push(format!("--- Sheet: {} ---\n{}", title, rows.join("\n")));
    }
    Ok(sheets.join("\n\n"))
}

fn read_sheet_titles(xml: &[u8]) -> Result<Vec<String>, ExtractError> {
    let mut titles = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) if e.local_name().as_ref() == b"sheet" => {
                let name = e
                    .try_get_attribute("name")
                    .ok()
                    .flatten()
                    .and_then(|a| a.unescape_value().ok().map(|v| v.into_owned()));
                titles.push(name.unwrap_or_default());
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(titles)
}

fn read_shared_strings(archive: &mut Archive<'_>) -> Result<Vec<String>, ExtractError> {
    let xml = read_zip_entry_bounded(archive, "xl/sharedStrings.xml", MAX_XML_ENTRY_BYTES)?;
    let mut strings = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml.as_slice());
    let mut buf = Vec::new();
    let mut current: Option<String> = None;
    let mut in_t = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"si" => current = Some(String::new()),
                b"t" => in_t = true,
                _ => {}
            },
            Ok(Event::Text(te)) if in_t => {
                if let Some(s) = current.as_mut() {
                    s.push_str(&te.unescape().unwrap_or_default());
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_t = false,
                b"si" => strings.push(current.take().unwrap_or_default()),
                _ => {}
            },
            Ok(Event::Empty(e)) if e.local_name().as_ref() == b"si" => strings.push(String::new()),
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(strings)
}

#[derive(Clone, Copy, PartialEq)]
enum CellKind {
    Shared,
    Inline,
    Boolean,
    Value,
}

/// Rows of one worksheet as `cell | cell` lines, skipping empty rows.
fn extract_xlsx_rows(xml: &[u8], shared_strings: &[String]) -> Result<Vec<String>, ExtractError> {
    let mut rows = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut row: Vec<String> = Vec::new();
    let mut cell = String::new();
    let mut kind = CellKind::Value;
    let mut in_value = false;
    let mut cell_count = 0usize;
    loop {
        if cell_count >= XLSX_MAX_CELLS_PER_SHEET {
            break;
        }
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"row" => row.clear(),
                b"c" => {
                    cell.clear();
                    kind = match e
                        .try_get_attribute("t")
                        .ok()
                        .flatten()
                        .map(|a| a.value.into_owned())
                        .as_deref()
                    {
                        Some(b"s") => CellKind::Shared,
                        Some(b"inlineStr") => CellKind::Inline,
                        Some(b"b") => CellKind::Boolean,
                        _ => CellKind::Value,
                    };
                }
                b"v" | b"t" => in_value = true,
                _ => {}
            },
            Ok(Event::Text(te)) if in_value => {
                cell.push_str(&te.unescape().unwrap_or_default());
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"v" | b"t" => in_value = false,
                b"c" => {
                    let value = match kind {
                        CellKind::Shared => cell
                            .trim()
                            .parse::<usize>()
                            .ok()
                            .and_then(|i| shared_strings.get(i).cloned())
                            .unwrap_or_default(),
                        CellKind::Boolean => match cell.trim() {
                            "1" => "TRUE".to_string(),
                            "0" => "FALSE".to_string(),
                            other => other.to_string(),
                        },
                        CellKind::Inline | CellKind::Value => cell.clone(),
                    };
                    let value = value.trim().to_string();
                    if !value.is_empty() {
                        row.push(value);
                        cell_count += 1;
                    }
                }
                b"row" => {
                    if !row.is_empty() {
                        rows.push(row.join(" | "));
                    }
                    row.clear();
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    if !row.is_empty() {
        rows.push(row.join(" | "));
    }
    Ok(rows)
}

/// Best-effort read of `docProps/core.xml`. Missing or malformed parts
/// yield empty properties.
fn read_core_properties(bytes: &[u8]) -> CoreProperties {
    let Ok(mut archive) = open_archive(bytes) else {
        return CoreProperties::default();
    };
    let Ok(xml) = read_zip_entry_bounded(&mut archive, "docProps/core.xml", MAX_XML_ENTRY_BYTES)
    else {
        return CoreProperties::default();
    };

    let mut props = CoreProperties::default();
    let mut reader = quick_xml::Reader::from_reader(xml.as_slice());
    let mut buf = Vec::new();
    let mut field: Option<Vec<u8>> = None;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => field = Some(e.local_name().as_ref().to_vec()),
            Ok(Event::Text(te)) => {
                let value = te.unescape().unwrap_or_default().trim().to_string();
                match field.as_deref() {
                    _ if value.is_empty() => {}
                    Some(b"title") => props.title = Some(value),
                    Some(b"creator") => props.creator = Some(value),
                    Some(b"created") => props.created = parse_w3c_date(&value),
                    Some(b"modified") => props.modified = parse_w3c_date(&value),
                    _ => {}
                }
            }
            Ok(Event::End(_)) => field = None,
            Ok(Event::Eof) | Err(_) => break,
            _ => {}
        }
        buf.clear();
    }
    props
}

fn parse_w3c_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

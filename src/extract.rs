//! Plain-text extraction for the document formats found in exports.
//!
//! Text formats are decoded as UTF-8 (lossily). PDF goes through
//! `pdf-extract`; DOCX, PPTX, and XLSX are ZIP containers whose XML parts are
//! walked with `quick-xml`. Every ZIP entry read is bounded.

use std::io::Read;
use std::path::Path;

use scraper::{Html, Selector};
use thiserror::Error;

use crate::models::extension_of;

pub const MIME_PDF: &str = "application/pdf";
pub const MIME_DOCX: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";
pub const MIME_PPTX: &str =
    "application/vnd.openxmlformats-officedocument.presentationml.presentation";
pub const MIME_XLSX: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";

const XLSX_MAX_SHEETS: usize = 100;
const XLSX_MAX_CELLS_PER_SHEET: usize = 100_000;
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("unsupported content-type: {0}")]
    UnsupportedContentType(String),
    #[error("PDF extraction failed: {0}")]
    Pdf(String),
    #[error("OOXML extraction failed: {0}")]
    Ooxml(String),
}

/// MIME type for a file extension; `text/plain` for anything unrecognised.
pub fn content_type_for(path: &Path) -> &'static str {
    match extension_of(path).as_deref() {
        Some("pdf") => MIME_PDF,
        Some("docx") => MIME_DOCX,
        Some("pptx") => MIME_PPTX,
        Some("xlsx") => MIME_XLSX,
        Some("md") | Some("markdown") => "text/markdown",
        Some("html") | Some("htm") => "text/html",
        Some("csv") => "text/csv",
        Some("json") => "application/json",
        Some("js") | Some("jsx") => "text/javascript",
        Some("ts") | Some("tsx") => "text/typescript",
        Some("py") => "text/x-python",
        Some("css") => "text/css",
        Some("svg") => "image/svg+xml",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("heic") => "image/heic",
        Some("mp3") | Some("mpga") => "audio/mpeg",
        Some("m4a") => "audio/mp4",
        Some("wav") => "audio/wav",
        Some("ogg") => "audio/ogg",
        Some("flac") => "audio/flac",
        Some("mp4") | Some("m4v") => "video/mp4",
        Some("mov") => "video/quicktime",
        Some("webm") => "video/webm",
        _ => "text/plain",
    }
}

/// Whether the content type needs [`extract_text`] rather than a UTF-8 decode.
pub fn is_binary_document(content_type: &str) -> bool {
    matches!(content_type, MIME_PDF | MIME_DOCX | MIME_PPTX | MIME_XLSX)
}

/// Turn file bytes into text, choosing the decoder from `content_type`.
pub fn bytes_to_text(bytes: &[u8], content_type: &str) -> Result<String, ExtractError> {
    if is_binary_document(content_type) {
        extract_text(bytes, content_type)
    } else {
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }
}

pub fn extract_text(bytes: &[u8], content_type: &str) -> Result<String, ExtractError> {
    match content_type {
        MIME_PDF => extract_pdf(bytes),
        MIME_DOCX => extract_docx(bytes),
        MIME_PPTX => extract_pptx(bytes),
        MIME_XLSX => extract_xlsx(bytes),
        _ => Err(ExtractError::UnsupportedContentType(
            content_type.to_string(),
        )),
    }
}

fn extract_pdf(bytes: &[u8]) -> Result<String, ExtractError> {
    pdf_extract::extract_text_from_mem(bytes).map_err(|e| ExtractError::Pdf(e.to_string()))
}

type Archive<'a> = zip::ZipArchive<std::io::Cursor<&'a [u8]>>;

fn open_archive(bytes: &[u8]) -> Result<Archive<'_>, ExtractError> {
    zip::ZipArchive::new(std::io::Cursor::new(bytes)).map_err(|e| ExtractError::Ooxml(e.to_string()))
}

fn read_entry_bounded(archive: &mut Archive<'_>, name: &str) -> Result<Vec<u8>, ExtractError> {
    let entry = archive
        .by_name(name)
        .map_err(|e| ExtractError::Ooxml(format!("{}: {}", name, e)))?;
    let mut out = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut out)
        .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
    if out.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(ExtractError::Ooxml(format!(
            "ZIP entry {} exceeds size limit ({} bytes)",
            name, MAX_XML_ENTRY_BYTES
        )));
    }
    Ok(out)
}

/// Entries under `prefix` ending in `.xml`, ordered by their numeric suffix.
fn numbered_parts(archive: &Archive<'_>, prefix: &str) -> Vec<String> {
    let mut names: Vec<String> = archive
        .file_names()
        .filter(|n| n.starts_with(prefix) && n.ends_with(".xml"))
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

fn extract_docx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = open_archive(bytes)?;
    let xml = read_entry_bounded(&mut archive, "word/document.xml")?;
    collect_text_elements(&xml, "\n")
}

fn extract_pptx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = open_archive(bytes)?;
    let mut slides = Vec::new();
    for name in numbered_parts(&archive, "ppt/slides/slide") {
        let xml = read_entry_bounded(&mut archive, &name)?;
        let text = collect_text_elements(&xml, " ")?;
        if !text.is_empty() {
            slides.push(text);
        }
    }
    Ok(slides.join("\n\n"))
}

/// Concatenate every `<*:t>` text run; `para_sep` is inserted at paragraph ends.
fn collect_text_elements(xml: &[u8], para_sep: &str) -> Result<String, ExtractError> {
    use quick_xml::events::Event;

    let mut out = String::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut in_t = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"t" => in_t = true,
            Ok(Event::Text(te)) if in_t => {
                if !out.is_empty() && !out.ends_with(para_sep) && !out.ends_with(' ') {
                    out.push(' ');
                }
                out.push_str(te.unescape().unwrap_or_default().as_ref());
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_t = false,
                b"p" if !out.is_empty() && !out.ends_with(para_sep) => out.push_str(para_sep),
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(out.trim().to_string())
}

fn extract_xlsx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = open_archive(bytes)?;
    let shared = if archive.file_names().any(|n| n == "xl/sharedStrings.xml") {
        read_shared_strings(&mut archive)?
    } else {
        Vec::new()
    };
    let mut sheets = Vec::new();
    for name in numbered_parts(&archive, "xl/worksheets/sheet")
        .into_iter()
        .take(XLSX_MAX_SHEETS)
    {
        let xml = read_entry_bounded(&mut archive, &name)?;
        let cells = sheet_cells(&xml, &shared)?;
        if !cells.is_empty() {
            sheets.push(cells);
        }
    }
    Ok(sheets.join("\n\n"))
}

fn read_shared_strings(archive: &mut Archive<'_>) -> Result<Vec<String>, ExtractError> {
    use quick_xml::events::Event;

    let xml = read_entry_bounded(archive, "xl/sharedStrings.xml")?;
    let mut strings = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml.as_slice());
    reader.config_mut().trim_text(true);
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
                    s.push_str(te.unescape().unwrap_or_default().as_ref());
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_t = false,
                b"si" => {
                    if let Some(s) = current.take() {
                        strings.push(s);
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
    Ok(strings)
}

fn sheet_cells(xml: &[u8], shared: &[String]) -> Result<String, ExtractError> {
    use quick_xml::events::Event;

    let mut cells: Vec<String> = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut in_v = false;
    let mut shared_cell = false;
    loop {
        if cells.len() >= XLSX_MAX_CELLS_PER_SHEET {
            break;
        }
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"c" => {
                    shared_cell = e.attributes().flatten().any(|a| {
                        a.key.as_ref() == b"t" && a.value.as_ref() == b"s"
                    })
                }
                b"v" => in_v = true,
                _ => {}
            },
            Ok(Event::Text(te)) if in_v => {
                let raw = te.unescape().unwrap_or_default();
                let value = raw.trim();
                if shared_cell {
                    if let Some(s) = value.parse::<usize>().ok().and_then(|i| shared.get(i)) {
                        cells.push(s.clone());
                    }
                } else if !value.is_empty() {
                    cells.push(value.to_string());
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"v" => in_v = false,
                b"c" => shared_cell = false,
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(cells.join(" "))
}

/// Visible text of an HTML page, one text node per line. Script, style,
/// and head content are dropped.
pub fn html_to_text(html: &str) -> String {
    let document = Html::parse_document(html);
    let mut out = String::new();
    for node in document.root_element().descendants() {
        let Some(text) = node.value().as_text() else {
            continue;
        };
        let hidden = node
            .parent()
            .and_then(|p| p.value().as_element().map(|e| e.name().to_string()))
            .map(|name| matches!(name.as_str(), "script" | "style" | "title" | "head"))
            .unwrap_or(false);
        let text = text.trim();
        if hidden || text.is_empty() {
            continue;
        }
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str(text);
    }
    out
}

/// Contents of the `<title>` element, if present and non-empty.
pub fn html_title(html: &str) -> Option<String> {
    let selector = Selector::parse("title").ok()?;
    let document = Html::parse_document(html);
    document
        .select(&selector)
        .next()
        .map(|el| el.text().collect::<String>().trim().to_string())
        .filter(|t| !t.is_empty())
}

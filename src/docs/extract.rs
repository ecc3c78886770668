use regex::Regex;
use std::path::Path;
use std::sync::LazyLock;

use super::schema::{ContentMetadata, DocumentType};
use crate::error::{DocError, Result};

/// Default cap on extracted text (1 MiB) to avoid bloating the index.
pub const DEFAULT_MAX_TEXT_LEN: usize = 1_048_576;

static SCRIPT_STYLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<(script|style)\b[^>]*>.*?</(script|style)\s*>").expect("valid regex literal")
});
static TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)<[^>]*>").expect("valid regex literal"));
static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[ \t\r\f]+").expect("valid regex literal"));
static BLANK_LINES: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n\s*\n+").expect("valid regex literal"));
static HTML_TITLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<title[^>]*>(.*?)</title\s*>").expect("valid regex literal"));
static HTML_HEADING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<h[1-3][^>]*>(.*?)</h[1-3]\s*>").expect("valid regex literal"));
static YAML_TITLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s+title:\s*['\x22]?([^'\x22\n]+)").expect("valid regex literal"));

const MAX_HEADINGS: usize = 50;

fn extension(filename: &str) -> String {
    Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase()
}

/// Guess the document type from a filename, peeking at the bytes to tell
/// Swagger from OpenAPI.
pub fn guess_document_type(filename: &str, data: &[u8]) -> Option<DocumentType> {
    match extension(filename).as_str() {
        "md" | "markdown" => Some(DocumentType::Markdown),
        "pdf" => Some(DocumentType::Pdf),
        "docx" | "doc" => Some(DocumentType::Docx),
        "json" | "yaml" | "yml" => {
            let head = String::from_utf8_lossy(&data[..data.len().min(4096)]);
            if head.contains("\"swagger\"") || head.contains("swagger:") {
                Some(DocumentType::Swagger)
            } else {
                Some(DocumentType::Openapi)
            }
        }
        "html" | "htm" => Some(DocumentType::JavaDoc),
        _ => None,
    }
}

/// Reject a filename whose extension does not belong to `doc_type`.
pub fn validate_filename(filename: &str, doc_type: DocumentType) -> Result<()> {
    let ext = extension(filename);
    let ok = match doc_type {
        DocumentType::Markdown => matches!(ext.as_str(), "md" | "markdown"),
        DocumentType::Pdf => ext == "pdf",
        DocumentType::Docx => matches!(ext.as_str(), "docx" | "doc"),
        DocumentType::Swagger | DocumentType::Openapi => {
            matches!(ext.as_str(), "json" | "yaml" | "yml")
        }
        DocumentType::JavaDoc => matches!(ext.as_str(), "html" | "htm"),
    };
    if ok {
        Ok(())
    } else {
        Err(DocError::validation(format!(
            "file '{filename}' does not match document type {doc_type}"
        )))
    }
}

/// Extract searchable text from version bytes.
///
/// Fails with a validation error when the bytes are malformed for their type
/// or carry no text at all.
pub fn extract_text(data: &[u8], doc_type: DocumentType, max_len: usize) -> Result<String> {
    if data.is_empty() {
        return Err(DocError::validation("content is empty"));
    }
    let text = match doc_type {
        DocumentType::Markdown => decode_utf8(data)?,
        DocumentType::Swagger | DocumentType::Openapi => extract_api_spec(data)?,
        DocumentType::JavaDoc => strip_html(&decode_utf8(data)?),
        DocumentType::Pdf => extract_pdf(data)?,
        DocumentType::Docx => extract_docx(data)?,
    };
    truncate_text(text, max_len).ok_or_else(|| DocError::validation("no extractable text"))
}

fn decode_utf8(data: &[u8]) -> Result<String> {
    String::from_utf8(data.to_vec()).map_err(|e| {
        DocError::validation(format!(
            "content is not valid UTF-8 (at byte {})",
            e.utf8_error().valid_up_to()
        ))
    })
}

fn extract_api_spec(data: &[u8]) -> Result<String> {
    let text = decode_utf8(data)?;
    let trimmed = text.trim_start();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        serde_json::from_str::<serde_json::Value>(trimmed)
            .map_err(|e| DocError::validation(format!("malformed JSON API spec: {e}")))?;
    }
    Ok(text)
}

fn strip_html(html: &str) -> String {
    let without_code = SCRIPT_STYLE.replace_all(html, " ");
    let without_tags = TAG.replace_all(&without_code, " ");
    let decoded = without_tags
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&");
    let collapsed = WHITESPACE.replace_all(&decoded, " ");
    BLANK_LINES.replace_all(collapsed.trim(), "\n").into_owned()
}

fn extract_pdf(data: &[u8]) -> Result<String> {
    if !data.starts_with(b"%PDF-") {
        return Err(DocError::validation("content is not a PDF file"));
    }
    #[cfg(feature = "pdf")]
    {
        pdf_extract::extract_text_from_mem(data)
            .map_err(|e| DocError::validation(format!("failed to extract PDF text: {e}")))
    }
    #[cfg(not(feature = "pdf"))]
    {
        Ok("[PDF document: enable the pdf feature for text extraction]".to_string())
    }
}

fn extract_docx(data: &[u8]) -> Result<String> {
    if !data.starts_with(b"PK\x03\x04") {
        return Err(DocError::validation("content is not a DOCX archive"));
    }
    Ok("[DOCX document: text is produced by the external parser service]".to_string())
}

fn truncate_text(text: String, max_len: usize) -> Option<String> {
    if text.trim().is_empty() {
        return None;
    }
    if text.len() <= max_len {
        return Some(text);
    }
    let mut end = max_len;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    Some(text[..end].to_string())
}

/// Summarize extracted text: title, headings, word and code block counts.
///
/// `data` is the raw upload; HTML and API specs are read from it because
/// extraction drops their structure.
pub fn describe(data: &[u8], text: &str, doc_type: DocumentType) -> ContentMetadata {
    let (title, headings) = match doc_type {
        DocumentType::Markdown => markdown_outline(text),
        DocumentType::JavaDoc => html_outline(&String::from_utf8_lossy(data)),
        DocumentType::Swagger | DocumentType::Openapi => api_spec_outline(text),
        DocumentType::Pdf | DocumentType::Docx => (None, Vec::new()),
    };
    ContentMetadata {
        title,
        headings,
        word_count: text.split_whitespace().count(),
        code_blocks: text.lines().filter(|l| l.trim_start().starts_with("```")).count() / 2,
        size_bytes: data.len() as u64,
        doc_type,
    }
}

fn markdown_outline(text: &str) -> (Option<String>, Vec<String>) {
    let mut in_code = false;
    let mut title = None;
    let mut headings = Vec::new();
    for line in text.lines() {
        let trimmed = line.trim_start();
        if trimmed.starts_with("```") {
            in_code = !in_code;
            continue;
        }
        if in_code || !trimmed.starts_with('#') {
            continue;
        }
        let heading = trimmed.trim_start_matches('#');
        if !heading.starts_with(' ') {
            continue;
        }
        let heading = heading.trim().to_string();
        if heading.is_empty() {
            continue;
        }
        if title.is_none() && trimmed.starts_with("# ") {
            title = Some(heading.clone());
        }
        if headings.len() < MAX_HEADINGS {
            headings.push(heading);
        }
    }
    (title, headings)
}

fn html_outline(html: &str) -> (Option<String>, Vec<String>) {
    let clean = |raw: &str| strip_html(raw).trim().to_string();
    let title = HTML_TITLE
        .captures(html)
        .map(|c| clean(&c[1]))
        .filter(|t| !t.is_empty());
    let headings = HTML_HEADING
        .captures_iter(html)
        .map(|c| clean(&c[1]))
        .filter(|h| !h.is_empty())
        .take(MAX_HEADINGS)
        .collect();
    (title, headings)
}

fn api_spec_outline(text: &str) -> (Option<String>, Vec<String>) {
    match serde_json::from_str::<serde_json::Value>(text.trim_start()) {
        Ok(spec) => {
            let title = spec
                .pointer("/info/title")
                .and_then(|t| t.as_str())
                .map(str::to_string);
            let paths = spec
                .get("paths")
                .and_then(|p| p.as_object())
                .map(|p| p.keys().take(MAX_HEADINGS).cloned().collect())
                .unwrap_or_default();
            (title, paths)
        }
        Err(_) => {
            let title = YAML_TITLE.captures(text).map(|c| c[1].trim().to_string());
            (title, Vec::new())
        }
    }
}

/// First `max_chars` characters of `text`, with `...` when cut.
pub fn snippet(text: &str, max_chars: usize) -> String {
    let trimmed = text.trim();
    match trimmed.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}...", &trimmed[..cut]),
        None => trimmed.to_string(),
    }
}

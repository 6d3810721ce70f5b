//! Text extraction for uploaded documents.
//!
//! Converts a raw blob plus its declared media type into plain UTF-8 text.
//! Supported types: PDF, DOCX (OOXML word processing), plain text, and
//! Markdown. Legacy `.doc` uploads are routed through the OOXML path —
//! most circulating ".doc" files are OOXML with the wrong extension — and
//! fail permanently otherwise.
//!
//! Extraction failures are never retryable: corrupt bytes stay corrupt on
//! redelivery, so the worker treats every [`ExtractError`] as poison.

use std::io::Read;

use thiserror::Error;

pub const MIME_PDF: &str = "application/pdf";
pub const MIME_TXT: &str = "text/plain";
pub const MIME_MD: &str = "text/markdown";
pub const MIME_DOCX: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";
pub const MIME_DOC: &str = "application/msword";

/// Decompressed-byte cap for a single ZIP entry (zip-bomb protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("unsupported media type: {0}")]
    Unsupported(String),
    #[error("corrupt {kind} content: {message}")]
    Corrupt { kind: &'static str, message: String },
}

impl ExtractError {
    fn corrupt(kind: &'static str, message: impl ToString) -> Self {
        ExtractError::Corrupt {
            kind,
            message: message.to_string(),
        }
    }
}

/// Extract plain text from `bytes` according to the declared media type.
pub fn extract_text(bytes: &[u8], media_type: &str) -> Result<String, ExtractError> {
    match media_type {
        MIME_PDF => extract_pdf(bytes),
        MIME_TXT | MIME_MD => extract_plain(bytes),
        MIME_DOCX | MIME_DOC => extract_docx(bytes),
        other => Err(ExtractError::Unsupported(other.to_string())),
    }
}

/// Map an upload's file extension to the media type the pipeline stores.
/// Returns `None` for extensions outside the accepted upload set.
pub fn media_type_for_extension(extension: &str) -> Option<&'static str> {
    match extension.to_ascii_lowercase().as_str() {
        "pdf" => Some(MIME_PDF),
        "txt" => Some(MIME_TXT),
        "md" => Some(MIME_MD),
        "docx" => Some(MIME_DOCX),
        "doc" => Some(MIME_DOC),
        _ => None,
    }
}

fn extract_plain(bytes: &[u8]) -> Result<String, ExtractError> {
    String::from_utf8(bytes.to_vec()).map_err(|e| ExtractError::corrupt("text", e))
}

fn extract_pdf(bytes: &[u8]) -> Result<String, ExtractError> {
    pdf_extract::extract_text_from_mem(bytes).map_err(|e| ExtractError::corrupt("pdf", e))
}

/// Pull the document body out of an OOXML archive by walking `w:t` text
/// runs in `word/document.xml`, inserting paragraph breaks at `w:p` ends.
fn extract_docx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| ExtractError::corrupt("docx", e))?;

    let mut xml = Vec::new();
    {
        let entry = archive
            .by_name("word/document.xml")
            .map_err(|_| ExtractError::corrupt("docx", "word/document.xml not found"))?;
        entry
            .take(MAX_XML_ENTRY_BYTES)
            .read_to_end(&mut xml)
            .map_err(|e| ExtractError::corrupt("docx", e))?;
        if xml.len() as u64 >= MAX_XML_ENTRY_BYTES {
            return Err(ExtractError::corrupt(
                "docx",
                "word/document.xml exceeds size limit",
            ));
        }
    }

    walk_text_runs(&xml)
}

fn walk_text_runs(xml: &[u8]) -> Result<String, ExtractError> {
    let mut out = String::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(false);
    let mut buf = Vec::new();
    let mut in_text_run = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => {
                if e.local_name().as_ref() == b"t" {
                    in_text_run = true;
                }
            }
            Ok(quick_xml::events::Event::Text(t)) if in_text_run => {
                out.push_str(t.unescape().unwrap_or_default().as_ref());
            }
            Ok(quick_xml::events::Event::End(e)) => {
                match e.local_name().as_ref() {
                    b"t" => in_text_run = false,
                    // Paragraph end becomes a chunker-visible boundary.
                    b"p" => out.push_str("\n\n"),
                    _ => {}
                }
            }
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => return Err(ExtractError::corrupt("docx", e)),
            _ => {}
        }
        buf.clear();
    }

    Ok(out.trim_end().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn docx_fixture(paragraphs: &[&str]) -> Vec<u8> {
        let body: String = paragraphs
            .iter()
            .map(|p| format!("<w:p><w:r><w:t>{}</w:t></w:r></w:p>", p))
            .collect();
        let xml = format!(
            r#"<?xml version="1.0"?><w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main"><w:body>{}</w:body></w:document>"#,
            body
        );

        let mut cursor = std::io::Cursor::new(Vec::new());
        {
            let mut zip = zip::ZipWriter::new(&mut cursor);
            zip.start_file(
                "word/document.xml",
                zip::write::SimpleFileOptions::default(),
            )
            .unwrap();
            zip.write_all(xml.as_bytes()).unwrap();
            zip.finish().unwrap();
        }
        cursor.into_inner()
    }

    #[test]
    fn plain_text_passes_through() {
        let text = extract_text(b"hello world", MIME_TXT).unwrap();
        assert_eq!(text, "hello world");
    }

    #[test]
    fn invalid_utf8_is_corrupt() {
        let err = extract_text(&[0xff, 0xfe, 0x00], MIME_TXT).unwrap_err();
        assert!(matches!(err, ExtractError::Corrupt { kind: "text", .. }));
    }

    #[test]
    fn unknown_media_type_rejected() {
        let err = extract_text(b"data", "application/octet-stream").unwrap_err();
        assert!(matches!(err, ExtractError::Unsupported(_)));
    }

    #[test]
    fn docx_paragraphs_become_blank_line_boundaries() {
        let bytes = docx_fixture(&["First paragraph.", "Second paragraph."]);
        let text = extract_text(&bytes, MIME_DOCX).unwrap();
        assert_eq!(text, "First paragraph.\n\nSecond paragraph.");
    }

    #[test]
    fn doc_extension_attempts_ooxml_path() {
        let bytes = docx_fixture(&["Legacy name, modern format."]);
        let text = extract_text(&bytes, MIME_DOC).unwrap();
        assert_eq!(text, "Legacy name, modern format.");
    }

    #[test]
    fn garbage_docx_is_corrupt() {
        let err = extract_text(b"not a zip archive", MIME_DOCX).unwrap_err();
        assert!(matches!(err, ExtractError::Corrupt { kind: "docx", .. }));
    }

    #[test]
    fn extension_mapping_covers_upload_set() {
        assert_eq!(media_type_for_extension("PDF"), Some(MIME_PDF));
        assert_eq!(media_type_for_extension("md"), Some(MIME_MD));
        assert_eq!(media_type_for_extension("doc"), Some(MIME_DOC));
        assert_eq!(media_type_for_extension("exe"), None);
    }
}

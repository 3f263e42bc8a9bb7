//! Text extraction for uploaded binary documents (PDF, Word).
//!
//! The coordinator supplies bytes plus the declared file name; this module
//! selects the format from the extension and returns plain UTF-8 text.
//! Library failures are wrapped as [`PipelineError::CorruptDocument`].

use std::io::Read;

use crate::error::PipelineError;

/// Supported upload formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    Pdf,
    Docx,
    /// Legacy Word. Accepted at the boundary; extraction succeeds only when
    /// the payload is actually OOXML (mislabeled files are common), otherwise
    /// it surfaces as a corrupt document.
    Doc,
}

impl DocumentFormat {
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext {
            "pdf" => Some(DocumentFormat::Pdf),
            "docx" => Some(DocumentFormat::Docx),
            "doc" => Some(DocumentFormat::Doc),
            _ => None,
        }
    }
}

/// Maximum decompressed bytes to read from a single ZIP entry (zip-bomb
/// protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

/// Selects the format from the file name's extension.
pub fn detect_format(file_name: &str) -> Result<DocumentFormat, PipelineError> {
    let ext = file_name
        .rsplit_once('.')
        .map(|(_, e)| e.to_ascii_lowercase())
        .unwrap_or_default();
    DocumentFormat::from_extension(&ext)
        .ok_or_else(|| PipelineError::UnsupportedFormat(format!(".{}", ext)))
}

/// Extracts plain text from document bytes.
pub fn extract_text(bytes: &[u8], format: DocumentFormat) -> Result<String, PipelineError> {
    match format {
        DocumentFormat::Pdf => extract_pdf(bytes),
        DocumentFormat::Docx | DocumentFormat::Doc => extract_word(bytes),
    }
}

fn extract_pdf(bytes: &[u8]) -> Result<String, PipelineError> {
    pdf_extract::extract_text_from_mem(bytes)
        .map_err(|e| PipelineError::CorruptDocument(format!("PDF extraction failed: {}", e)))
}

fn extract_word(bytes: &[u8]) -> Result<String, PipelineError> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| PipelineError::CorruptDocument(format!("not an OOXML archive: {}", e)))?;

    let mut doc_xml = Vec::new();
    {
        let entry = archive.by_name("word/document.xml").map_err(|e| {
            PipelineError::CorruptDocument(format!("word/document.xml not found: {}", e))
        })?;
        entry
            .take(MAX_XML_ENTRY_BYTES)
            .read_to_end(&mut doc_xml)
            .map_err(|e| PipelineError::CorruptDocument(e.to_string()))?;
        if doc_xml.len() as u64 >= MAX_XML_ENTRY_BYTES {
            return Err(PipelineError::CorruptDocument(
                "word/document.xml exceeds size limit".to_string(),
            ));
        }
    }

    extract_paragraph_text(&doc_xml)
}

/// Walks `w:t` runs, emitting a newline at each paragraph end so the
/// normalizer sees paragraph structure.
fn extract_paragraph_text(xml: &[u8]) -> Result<String, PipelineError> {
    let mut out = String::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut in_text_run = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => {
                if e.local_name().as_ref() == b"t" {
                    in_text_run = true;
                }
            }
            Ok(quick_xml::events::Event::Text(te)) if in_text_run => {
                out.push_str(te.unescape().unwrap_or_default().as_ref());
            }
            Ok(quick_xml::events::Event::End(e)) => {
                let name = e.local_name();
                if name.as_ref() == b"t" {
                    in_text_run = false;
                } else if name.as_ref() == b"p" && !out.ends_with('\n') {
                    out.push('\n');
                }
            }
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => return Err(PipelineError::CorruptDocument(e.to_string())),
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
    use zip::write::SimpleFileOptions;

    fn make_docx(paragraphs: &[&str]) -> Vec<u8> {
        let mut body = String::new();
        for p in paragraphs {
            body.push_str(&format!("<w:p><w:r><w:t>{}</w:t></w:r></w:p>", p));
        }
        let xml = format!(
            "<?xml version=\"1.0\"?><w:document xmlns:w=\"http://schemas.openxmlformats.org/wordprocessingml/2006/main\"><w:body>{}</w:body></w:document>",
            body
        );

        let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
        writer
            .start_file("word/document.xml", SimpleFileOptions::default())
            .unwrap();
        writer.write_all(xml.as_bytes()).unwrap();
        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn detect_format_by_extension() {
        assert_eq!(detect_format("a.pdf").unwrap(), DocumentFormat::Pdf);
        assert_eq!(detect_format("A.DOCX").unwrap(), DocumentFormat::Docx);
        assert_eq!(detect_format("old.doc").unwrap(), DocumentFormat::Doc);
        assert!(matches!(
            detect_format("notes.txt"),
            Err(PipelineError::UnsupportedFormat(_))
        ));
        assert!(matches!(
            detect_format("no_extension"),
            Err(PipelineError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn invalid_pdf_is_corrupt() {
        let err = extract_text(b"not a pdf", DocumentFormat::Pdf).unwrap_err();
        assert!(matches!(err, PipelineError::CorruptDocument(_)));
    }

    #[test]
    fn invalid_zip_is_corrupt_for_word() {
        let err = extract_text(b"not a zip", DocumentFormat::Docx).unwrap_err();
        assert!(matches!(err, PipelineError::CorruptDocument(_)));

        // Legacy binary .doc takes the same path.
        let err = extract_text(b"\xd0\xcf\x11\xe0junk", DocumentFormat::Doc).unwrap_err();
        assert!(matches!(err, PipelineError::CorruptDocument(_)));
    }

    #[test]
    fn docx_paragraphs_become_lines() {
        let bytes = make_docx(&["First paragraph.", "Second paragraph."]);
        let text = extract_text(&bytes, DocumentFormat::Docx).unwrap();
        assert_eq!(text, "First paragraph.\nSecond paragraph.");
    }

    #[test]
    fn docx_without_document_xml_is_corrupt() {
        let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
        writer
            .start_file("something_else.xml", SimpleFileOptions::default())
            .unwrap();
        writer.write_all(b"<x/>").unwrap();
        let bytes = writer.finish().unwrap().into_inner();

        let err = extract_text(&bytes, DocumentFormat::Docx).unwrap_err();
        assert!(matches!(err, PipelineError::CorruptDocument(_)));
    }
}

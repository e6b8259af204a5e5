//! File loading for ingestion.
//!
//! Free text (`.txt`, `.md`) becomes a plain document. Structured inputs
//! (`.json` arrays, `.csv` files) become record documents so the chunker can
//! keep each record whole. Binary guideline formats (`.pdf`, `.docx`) are
//! converted to text with kreuzberg. A file that cannot be decoded is rejected with
//! [`GraphRagError::MalformedDocument`] without affecting its siblings.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::{GraphRagError, Result};
use crate::graphrag::domain::{Document, DocumentSource};

/// File extensions the loader understands.
pub const SUPPORTED_EXTENSIONS: [&str; 7] = ["txt", "md", "markdown", "json", "csv", "pdf", "docx"];

/// Extensions routed through document conversion instead of a UTF-8 read.
const CONVERTED_EXTENSIONS: [&str; 2] = ["pdf", "docx"];

/// Outcome of scanning a path.
#[derive(Debug, Default)]
pub struct LoadReport {
    pub documents: Vec<Document>,
    pub rejected: Vec<(PathBuf, GraphRagError)>,
}

/// Load one file into a document.
pub async fn load_file(path: &Path) -> Result<Document> {
    let document_id = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("unknown")
        .to_string();
    let extension = path
        .extension()
        .and_then(|s| s.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();

    let malformed = |reason: String| GraphRagError::MalformedDocument {
        document_id: document_id.clone(),
        reason,
    };

    if !SUPPORTED_EXTENSIONS.contains(&extension.as_str()) {
        return Err(malformed(format!("unsupported file type '.{extension}'")));
    }

    let content = if CONVERTED_EXTENSIONS.contains(&extension.as_str()) {
        extract_text(path).await.map_err(malformed)?
    } else {
        let bytes = tokio::fs::read(path).await?;
        String::from_utf8(bytes).map_err(|e| malformed(format!("invalid UTF-8: {e}")))?
    };
    if content.trim().is_empty() {
        return Err(malformed("file is empty".to_string()));
    }

    let document = match extension.as_str() {
        "json" => parse_json(&document_id, &content).map_err(malformed)?,
        "csv" => parse_csv(&document_id, &content).map_err(malformed)?,
        _ => Document::new(&document_id, content),
    };

    let source = DocumentSource {
        title: path
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or(&document_id)
            .to_string(),
        origin_path: Some(path.to_string_lossy().to_string()),
        file_type: Some(format!(".{extension}")),
        date_added: Some(chrono::Utc::now().to_rfc3339()),
    };
    debug!(document_id = %document_id, path = %path.display(), "Loaded document");
    Ok(document.with_source(source))
}

/// Load a single file, or recursively scan a directory for supported files.
pub async fn load_path(path: &Path) -> Result<LoadReport> {
    let mut report = LoadReport::default();

    if path.is_file() {
        match load_file(path).await {
            Ok(doc) => report.documents.push(doc),
            Err(e) => report.rejected.push((path.to_path_buf(), e)),
        }
        return Ok(report);
    }
    if !path.is_dir() {
        return Err(GraphRagError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("{} does not exist", path.display()),
        )));
    }

    let mut files: Vec<PathBuf> = WalkDir::new(path)
        .follow_links(true)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| {
            p.extension()
                .and_then(|s| s.to_str())
                .is_some_and(|ext| SUPPORTED_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        })
        .collect();
    files.sort();

    for file in files {
        match load_file(&file).await {
            Ok(doc) => report.documents.push(doc),
            Err(e) => {
                warn!(path = %file.display(), error = %e, "Rejected document");
                report.rejected.push((file, e));
            }
        }
    }
    Ok(report)
}

/// Convert a PDF or DOCX file to plain text.
async fn extract_text(path: &Path) -> std::result::Result<String, String> {
    let path_buf = path.to_path_buf();
    let result = tokio::task::spawn_blocking(move || {
        kreuzberg::extract_file_sync(path_buf, None, &kreuzberg::ExtractionConfig::default())
    })
    .await
    .map_err(|e| format!("conversion task failed: {e}"))?
    .map_err(|e| format!("document conversion failed: {e}"))?;
    Ok(result.content)
}

fn parse_json(document_id: &str, content: &str) -> std::result::Result<Document, String> {
    let value: serde_json::Value =
        serde_json::from_str(content).map_err(|e| format!("invalid JSON: {e}"))?;
    match value {
        serde_json::Value::Array(items) => {
            let records = items
                .iter()
                .map(serde_json::to_string)
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| e.to_string())?;
            if records.is_empty() {
                return Err("JSON array has no records".to_string());
            }
            Ok(Document::from_records(document_id, records))
        }
        serde_json::Value::Object(_) => {
            let text = serde_json::to_string_pretty(&value).map_err(|e| e.to_string())?;
            Ok(Document::new(document_id, text))
        }
        _ => Err("JSON document must be an object or an array".to_string()),
    }
}

/// Rows become `column: value` pairs; empty cells are skipped.
fn parse_csv(document_id: &str, content: &str) -> std::result::Result<Document, String> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(content.as_bytes());
    let headers = reader
        .headers()
        .map_err(|e| format!("invalid CSV header: {e}"))?
        .clone();

    let mut records = Vec::new();
    for row in reader.records() {
        let row = row.map_err(|e| format!("invalid CSV row: {e}"))?;
        let line = headers
            .iter()
            .zip(row.iter())
            .filter(|(_, value)| !value.trim().is_empty())
            .map(|(column, value)| format!("{column}: {}", value.trim()))
            .collect::<Vec<_>>()
            .join(", ");
        if !line.is_empty() {
            records.push(line);
        }
    }
    if records.is_empty() {
        return Err("CSV file has no data rows".to_string());
    }
    Ok(Document::from_records(document_id, records))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_load_text_and_structured_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("guideline.txt"), "Dr. Smith treats diabetes.").unwrap();
        std::fs::write(
            dir.path().join("drugs.json"),
            r#"[{"name": "metformin"}, {"name": "insulin"}]"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("sites.csv"), "site,city\nToronto General,Toronto\n,\n")
            .unwrap();
        std::fs::write(dir.path().join("ignored.bin"), [0u8, 1, 2]).unwrap();

        let report = load_path(dir.path()).await.unwrap();
        assert!(report.rejected.is_empty());
        assert_eq!(report.documents.len(), 3);

        let csv_doc = report.documents.iter().find(|d| d.id == "sites").unwrap();
        assert_eq!(
            csv_doc.records.as_deref(),
            Some(&["site: Toronto General, city: Toronto".to_string()][..])
        );
        let json_doc = report.documents.iter().find(|d| d.id == "drugs").unwrap();
        assert_eq!(json_doc.records.as_ref().map(Vec::len), Some(2));
        let txt = report.documents.iter().find(|d| d.id == "guideline").unwrap();
        assert_eq!(txt.source.file_type.as_deref(), Some(".txt"));
        assert!(txt.records.is_none());
    }

    #[tokio::test]
    async fn test_malformed_files_are_rejected_individually() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("broken.json"), "{not json").unwrap();
        std::fs::write(dir.path().join("empty.txt"), "  \n").unwrap();
        std::fs::write(dir.path().join("latin1.txt"), [0xffu8, 0xfe, 0x41]).unwrap();
        std::fs::write(dir.path().join("ok.md"), "# Screening\nScreen every 3 years.").unwrap();

        let report = load_path(dir.path()).await.unwrap();
        assert_eq!(report.documents.len(), 1);
        assert_eq!(report.rejected.len(), 3);
        assert!(
            report
                .rejected
                .iter()
                .all(|(_, e)| e.kind() == "malformed_document")
        );
    }

    fn fixture(name: &str) -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("tests/fixtures")
            .join(name)
    }

    #[tokio::test]
    async fn test_load_pdf_guideline() {
        let doc = load_file(&fixture("guideline.pdf")).await.unwrap();
        assert_eq!(doc.id, "guideline");
        assert!(doc.text.contains("Metformin"));
        assert_eq!(doc.source.file_type.as_deref(), Some(".pdf"));
        assert!(doc.records.is_none());
    }

    #[tokio::test]
    async fn test_load_docx_guideline() {
        let doc = load_file(&fixture("screening.docx")).await.unwrap();
        assert_eq!(doc.id, "screening");
        assert!(doc.text.contains("Screen adults every three years"));
        assert_eq!(doc.source.file_type.as_deref(), Some(".docx"));
    }

    #[tokio::test]
    async fn test_corrupt_pdf_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corrupt.pdf");
        std::fs::write(&path, b"this is not a pdf").unwrap();

        let err = load_file(&path).await.unwrap_err();
        assert_eq!(err.kind(), "malformed_document");
    }
}

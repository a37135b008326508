//! File ingestion: classify an uploaded blob and produce exactly one
//! canonical content block for the target provider.
//!
//! Strategy per input:
//!   native   — image/PDF the provider accepts as a binary block
//!   text     — text family decoded straight into a text block
//!   extract  — PDF/Office formats routed to a pluggable extractor
//!   error    — clear message as a text block (video, executables, ...)

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::llm::types::ContentBlock;

const NATIVE_IMAGE_TYPES: &[&str] = &[
    "image/jpeg",
    "image/jpg",
    "image/png",
    "image/gif",
    "image/webp",
];

const TEXT_MIME_TYPES: &[&str] = &[
    "text/plain",
    "text/html",
    "text/markdown",
    "text/csv",
    "text/xml",
    "application/xml",
    "application/json",
    "application/javascript",
    "application/x-yaml",
    "text/yaml",
    "text/x-python",
    "text/x-java-source",
    "text/x-c",
    "text/x-c++",
    "text/x-shellscript",
    "application/x-sh",
    "text/x-sql",
];

const TEXT_EXTENSIONS: &[&str] = &[
    "txt", "md", "markdown", "rst", "json", "yaml", "yml", "toml", "ini", "cfg", "conf", "xml",
    "html", "htm", "svg", "csv", "tsv", "py", "js", "ts", "jsx", "tsx", "vue", "java", "c", "cpp",
    "h", "cs", "go", "rs", "rb", "php", "sh", "bash", "zsh", "fish", "sql", "graphql", "log",
    "env",
];

const UNSUPPORTED_PREFIXES: &[&str] = &[
    "video/",
    "audio/",
    "application/octet-stream",
    "application/x-executable",
];

const DOCX_MIMES: &[&str] = &[
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
    "application/msword",
];

const XLSX_MIMES: &[&str] = &[
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
    "application/vnd.ms-excel",
];

const PPTX_MIMES: &[&str] = &[
    "application/vnd.openxmlformats-officedocument.presentationml.presentation",
    "application/vnd.ms-powerpoint",
];

/// Does this provider accept PDFs as a native document block?
pub fn native_pdf_support(provider: &str) -> bool {
    matches!(provider, "anthropic" | "google")
}

/// Out-of-core text extractor: `(bytes, filename) → text`.
///
/// Implementations must be infallible — on a missing dependency or parse
/// failure they return the error message as text, never fail the request.
pub trait TextExtractor: Send + Sync {
    fn extract(&self, data: &[u8], filename: &str) -> String;
}

/// Placeholder extractor used when no real implementation is plugged in.
pub struct UnavailableExtractor {
    kind: &'static str,
}

impl UnavailableExtractor {
    pub fn new(kind: &'static str) -> Self {
        Self { kind }
    }
}

impl TextExtractor for UnavailableExtractor {
    fn extract(&self, _data: &[u8], filename: &str) -> String {
        format!(
            "[{filename}] {} extraction is not available in this build.",
            self.kind
        )
    }
}

/// Registry of format extractors. Defaults are placeholders; deployments
/// slot in real PDF/DOCX/XLSX/PPTX implementations.
pub struct Extractors {
    pub pdf: Box<dyn TextExtractor>,
    pub docx: Box<dyn TextExtractor>,
    pub xlsx: Box<dyn TextExtractor>,
    pub pptx: Box<dyn TextExtractor>,
}

impl Default for Extractors {
    fn default() -> Self {
        Self {
            pdf: Box::new(UnavailableExtractor::new("PDF")),
            docx: Box::new(UnavailableExtractor::new("Word")),
            xlsx: Box::new(UnavailableExtractor::new("Excel")),
            pptx: Box::new(UnavailableExtractor::new("PowerPoint")),
        }
    }
}

/// Convert one uploaded file into the content block best suited to the
/// target provider.
pub fn process_file(
    data: &[u8],
    filename: &str,
    mime_type: &str,
    provider: &str,
    extractors: &Extractors,
) -> ContentBlock {
    let mime = normalize_mime(mime_type);

    // 1. Images are native for every shipped provider
    if NATIVE_IMAGE_TYPES.contains(&mime.as_str()) {
        let media_type = if mime == "image/jpg" { "image/jpeg" } else { &mime };
        return ContentBlock::image(media_type, BASE64.encode(data));
    }

    // 2. PDF as a native document block when the provider supports it
    if mime == "application/pdf" && native_pdf_support(provider) {
        return ContentBlock::document(BASE64.encode(data));
    }

    // 3. Text family goes straight through
    if TEXT_MIME_TYPES.contains(&mime.as_str()) || has_text_extension(filename) {
        let text = String::from_utf8_lossy(data);
        return ContentBlock::text(format!("[{filename}]\n{text}"));
    }

    // 4. PDF without native support, Office formats: extract
    if mime == "application/pdf" {
        return ContentBlock::text(extractors.pdf.extract(data, filename));
    }
    if DOCX_MIMES.contains(&mime.as_str()) {
        return ContentBlock::text(extractors.docx.extract(data, filename));
    }
    if XLSX_MIMES.contains(&mime.as_str()) {
        return ContentBlock::text(extractors.xlsx.extract(data, filename));
    }
    if PPTX_MIMES.contains(&mime.as_str()) {
        return ContentBlock::text(extractors.pptx.extract(data, filename));
    }

    // 5. Known-unsupported families
    if UNSUPPORTED_PREFIXES.iter().any(|p| mime.starts_with(p)) {
        return ContentBlock::text(format!(
            "[{filename}] This file type ({mime}) is not supported by any provider."
        ));
    }

    // 6. Unknown type: best-effort strict decode, else a clear error
    match std::str::from_utf8(data) {
        Ok(text) => ContentBlock::text(format!("[{filename}]\n{text}")),
        Err(_) => ContentBlock::text(format!(
            "[{filename}] Unknown file type ({mime}). Size: {} bytes. \
             This type cannot be processed.",
            data.len()
        )),
    }
}

/// Replace document blocks with extracted text for providers without
/// native PDF support. All other blocks pass through untouched.
pub fn adapt_blocks_for_provider(
    blocks: Vec<ContentBlock>,
    provider: &str,
    extractors: &Extractors,
) -> Vec<ContentBlock> {
    if native_pdf_support(provider) {
        return blocks;
    }
    blocks
        .into_iter()
        .map(|block| match block {
            ContentBlock::Document { data, .. } => match BASE64.decode(&data) {
                Ok(raw) => ContentBlock::text(extractors.pdf.extract(&raw, "document.pdf")),
                Err(e) => ContentBlock::text(format!("[PDF extraction failed: {e}]")),
            },
            other => other,
        })
        .collect()
}

fn normalize_mime(mime_type: &str) -> String {
    let mime = if mime_type.is_empty() {
        "application/octet-stream"
    } else {
        mime_type
    };
    mime.split(';').next().unwrap_or(mime).trim().to_lowercase()
}

fn has_text_extension(filename: &str) -> bool {
    filename
        .rsplit_once('.')
        .map(|(_, ext)| TEXT_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn jpg_is_normalized_to_jpeg_with_verbatim_data() {
        let data = b"\xff\xd8\xff\xe0fakejpeg";
        let block = process_file(data, "photo.jpg", "image/jpg", "openai", &Extractors::default());
        match block {
            ContentBlock::Image { media_type, data: b64 } => {
                assert_eq!(media_type, "image/jpeg");
                assert_eq!(BASE64.decode(b64).unwrap(), data);
            }
            other => panic!("expected image block, got {other:?}"),
        }
    }

    #[test]
    fn mime_parameters_are_stripped() {
        let block = process_file(
            b"hello",
            "note.txt",
            "Text/Plain; charset=UTF-8",
            "anthropic",
            &Extractors::default(),
        );
        assert_eq!(block, ContentBlock::text("[note.txt]\nhello"));
    }

    #[test]
    fn pdf_is_native_for_claude_style_target() {
        let data = b"%PDF-1.4 fake";
        let block = process_file(
            data,
            "report.pdf",
            "application/pdf",
            "anthropic",
            &Extractors::default(),
        );
        match block {
            ContentBlock::Document { media_type, data: b64 } => {
                assert_eq!(media_type, "application/pdf");
                assert_eq!(BASE64.decode(b64).unwrap(), data);
            }
            other => panic!("expected document block, got {other:?}"),
        }
    }

    #[test]
    fn pdf_becomes_text_for_openai_style_target() {
        struct FakePdf;
        impl TextExtractor for FakePdf {
            fn extract(&self, _data: &[u8], filename: &str) -> String {
                format!("[{filename} — PDF content]\n\nextracted text")
            }
        }
        let extractors = Extractors {
            pdf: Box::new(FakePdf),
            ..Extractors::default()
        };
        let block = process_file(
            b"%PDF-1.4",
            "report.pdf",
            "application/pdf",
            "openai",
            &extractors,
        );
        assert_eq!(
            block,
            ContentBlock::text("[report.pdf — PDF content]\n\nextracted text")
        );
    }

    #[test]
    fn text_extension_wins_over_unknown_mime() {
        let block = process_file(
            b"fn main() {}",
            "main.rs",
            "application/x-unknown",
            "openai",
            &Extractors::default(),
        );
        assert_eq!(block, ContentBlock::text("[main.rs]\nfn main() {}"));
    }

    #[test]
    fn video_is_rejected_with_explanation() {
        let block = process_file(
            b"\x00\x00movie",
            "clip.mp4",
            "video/mp4",
            "anthropic",
            &Extractors::default(),
        );
        match block {
            ContentBlock::Text { text } => {
                assert!(text.contains("clip.mp4"));
                assert!(text.contains("video/mp4"));
                assert!(text.contains("not supported"));
            }
            other => panic!("expected text block, got {other:?}"),
        }
    }

    #[test]
    fn unknown_binary_reports_size_and_mime() {
        let block = process_file(
            &[0u8, 159, 146, 150],
            "blob.bin",
            "application/x-custom",
            "google",
            &Extractors::default(),
        );
        match block {
            ContentBlock::Text { text } => {
                assert!(text.contains("4 bytes"));
                assert!(text.contains("application/x-custom"));
            }
            other => panic!("expected text block, got {other:?}"),
        }
    }

    #[test]
    fn unknown_type_with_valid_utf8_passes_through() {
        let block = process_file(
            "plain enough".as_bytes(),
            "mystery",
            "application/x-custom",
            "google",
            &Extractors::default(),
        );
        assert_eq!(block, ContentBlock::text("[mystery]\nplain enough"));
    }

    #[test]
    fn docx_routes_to_its_extractor() {
        let block = process_file(
            b"PK\x03\x04",
            "letter.docx",
            "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
            "anthropic",
            &Extractors::default(),
        );
        match block {
            ContentBlock::Text { text } => assert!(text.contains("Word extraction")),
            other => panic!("expected text block, got {other:?}"),
        }
    }

    #[test]
    fn adapt_replaces_documents_only_without_native_pdf() {
        let blocks = vec![
            ContentBlock::text("hi"),
            ContentBlock::document(BASE64.encode(b"%PDF")),
        ];

        let kept = adapt_blocks_for_provider(blocks.clone(), "google", &Extractors::default());
        assert_eq!(kept, blocks);

        let adapted = adapt_blocks_for_provider(blocks, "openai", &Extractors::default());
        assert_eq!(adapted[0], ContentBlock::text("hi"));
        match &adapted[1] {
            ContentBlock::Text { text } => assert!(text.contains("PDF extraction")),
            other => panic!("expected text block, got {other:?}"),
        }
    }
}

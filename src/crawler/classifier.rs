//! File role classification
//!
//! Decides whether a downloaded document is the article's main text, a
//! supplemental file, or something that cannot be told apart.

use regex::Regex;
use scraper::{Html, Selector};
use std::sync::{Arc, OnceLock};

use crate::models::FileRole;

/// Assigns a [`FileRole`] to a successful download
pub trait FileClassifier: Send + Sync {
    fn classify(&self, url: &str, content_type: &str, body: &[u8]) -> FileRole;
}

pub type SharedClassifier = Arc<dyn FileClassifier>;

// Parse selectors once; the patterns are constant
macro_rules! parse_selector {
    ($s:expr) => {
        Selector::parse($s).expect(concat!("Invalid CSS selector: ", $s))
    };
}

/// Markers of a fulltext article page
fn article_selectors() -> &'static [Selector] {
    static SELECTORS: OnceLock<Vec<Selector>> = OnceLock::new();
    SELECTORS.get_or_init(|| {
        vec![
            parse_selector!(r#"meta[name="citation_title"]"#),
            parse_selector!(r#"meta[name="citation_pdf_url"]"#),
            parse_selector!(r#"meta[name="dc.identifier"]"#),
            parse_selector!("article"),
            parse_selector!("#article-body"),
            parse_selector!(".article-body"),
            parse_selector!("section.abstract"),
            parse_selector!("#abstract"),
        ]
    })
}

fn supplement_url_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(supp(l|lement(al|ary)?)?[_\-/.]|/suppl/|/si/|appendix|mmc\d+|_esm\d*|moesm)")
            .expect("Invalid regex pattern")
    })
}

/// Default classifier based on MIME type, URL shape and HTML markers
#[derive(Debug, Clone, Default)]
pub struct HeuristicClassifier;

impl HeuristicClassifier {
    pub fn new() -> Self {
        Self
    }

    fn sniff_mime(content_type: &str, body: &[u8]) -> String {
        let declared = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();

        let generic = declared.is_empty()
            || declared == "application/octet-stream"
            || declared == "binary/octet-stream";
        if !generic {
            return declared;
        }

        let head = &body[..body.len().min(512)];
        if head.starts_with(b"%PDF") {
            "application/pdf".to_string()
        } else if head.starts_with(b"PK\x03\x04") {
            "application/zip".to_string()
        } else {
            let text = String::from_utf8_lossy(head).trim_start().to_ascii_lowercase();
            if text.starts_with("<!doctype html") || text.starts_with("<html") {
                "text/html".to_string()
            } else {
                declared
            }
        }
    }

    fn is_supplemental_mime(mime: &str) -> bool {
        matches!(
            mime,
            "text/csv"
                | "text/plain"
                | "text/tab-separated-values"
                | "application/zip"
                | "application/gzip"
                | "application/x-gzip"
                | "application/x-tar"
                | "application/x-7z-compressed"
                | "application/msword"
                | "application/vnd.ms-excel"
                | "application/vnd.ms-powerpoint"
                | "application/rtf"
        ) || mime.starts_with("application/vnd.openxmlformats-officedocument")
            || mime.starts_with("application/vnd.oasis.opendocument")
            || mime.starts_with("video/")
    }

    fn html_role(body: &[u8]) -> FileRole {
        let html = String::from_utf8_lossy(body);
        let document = Html::parse_document(&html);
        if article_selectors()
            .iter()
            .any(|selector| document.select(selector).next().is_some())
        {
            FileRole::Main
        } else {
            FileRole::Unknown
        }
    }
}

impl FileClassifier for HeuristicClassifier {
    fn classify(&self, url: &str, content_type: &str, body: &[u8]) -> FileRole {
        let mime = Self::sniff_mime(content_type, body);
        let supplement_url = supplement_url_pattern().is_match(url);

        match mime.as_str() {
            "application/pdf" if supplement_url => FileRole::Supplemental,
            "application/pdf" => FileRole::Main,
            "text/html" | "application/xhtml+xml" => Self::html_role(body),
            "application/xml" | "text/xml" | "application/jats+xml" => {
                if String::from_utf8_lossy(&body[..body.len().min(4096)]).contains("<article") {
                    FileRole::Main
                } else {
                    FileRole::Unknown
                }
            }
            m if Self::is_supplemental_mime(m) => FileRole::Supplemental,
            _ if supplement_url => FileRole::Supplemental,
            _ => FileRole::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(url: &str, content_type: &str, body: &[u8]) -> FileRole {
        HeuristicClassifier::new().classify(url, content_type, body)
    }

    #[test]
    fn test_pdf_roles() {
        assert_eq!(classify("https://x.org/a.pdf", "application/pdf", b"%PDF-1.7"), FileRole::Main);
        assert_eq!(
            classify("https://x.org/doi/suppl/10.1/abc/suppl_file/data.pdf", "application/pdf", b"%PDF"),
            FileRole::Supplemental
        );
        assert_eq!(
            classify("https://x.org/download", "application/octet-stream", b"%PDF-1.4 ..."),
            FileRole::Main
        );
    }

    #[test]
    fn test_html_roles() {
        let article = br#"<html><head><meta name="citation_title" content="Yeast"></head><body></body></html>"#;
        assert_eq!(classify("https://x.org/a", "text/html; charset=utf-8", article), FileRole::Main);

        let landing = b"<html><head><title>Redirecting</title></head><body>Please wait</body></html>";
        assert_eq!(classify("https://x.org/a", "text/html", landing), FileRole::Unknown);
    }

    #[test]
    fn test_supplemental_types() {
        assert_eq!(classify("https://x.org/t1.csv", "text/csv", b"a,b\n1,2"), FileRole::Supplemental);
        assert_eq!(
            classify(
                "https://x.org/mmc1.xlsx",
                "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
                b"PK\x03\x04"
            ),
            FileRole::Supplemental
        );
        assert_eq!(classify("https://x.org/img.png", "image/png", b"\x89PNG"), FileRole::Unknown);
    }
}

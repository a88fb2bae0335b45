//! Bot-challenge page detection
//!
//! Publishers behind Cloudflare, Akamai, PerimeterX and similar filters often
//! answer with a 403/503 (sometimes even a 200) carrying an interstitial page
//! instead of the requested document. Such responses must count as `Blocked`,
//! not as content.

use regex::Regex;
use scraper::{Html, Selector};
use std::collections::BTreeMap;
use std::sync::OnceLock;

use crate::models::ChallengeType;

/// Only the head of a page is inspected
const SCAN_LIMIT: usize = 64 * 1024;

/// Interstitials are small; large pages mentioning "captcha" are usually real content
const MAX_INTERSTITIAL_BYTES: usize = 256 * 1024;

fn captcha_markers() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?i)g-recaptcha|h-captcha|hcaptcha\.com|px-captcha|captcha-delivery\.com|id="captcha"|class="captcha"#)
            .expect("Invalid regex pattern")
    })
}

fn script_markers() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)/cdn-cgi/challenge-platform|cf-browser-verification|checking your browser|_incapsula_resource|enable javascript and cookies to continue|pardon our interruption")
            .expect("Invalid regex pattern")
    })
}

fn denied_markers() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)access denied|request unsuccessful|you have been blocked|attention required!?\s*\|\s*cloudflare|bot detection")
            .expect("Invalid regex pattern")
    })
}

fn page_title(html: &str) -> Option<String> {
    static TITLE: OnceLock<Selector> = OnceLock::new();
    let selector = TITLE.get_or_init(|| Selector::parse("title").expect("Invalid selector"));

    Html::parse_document(html)
        .select(selector)
        .next()
        .map(|t| t.text().collect::<String>().trim().to_string())
}

fn looks_like_html(content_type: &str, body: &[u8]) -> bool {
    if content_type.to_ascii_lowercase().contains("html") {
        return true;
    }
    let head = String::from_utf8_lossy(&body[..body.len().min(512)])
        .trim_start()
        .to_ascii_lowercase();
    head.starts_with("<!doctype html") || head.starts_with("<html")
}

/// Classify a response as a bot challenge
///
/// `headers` keys are expected lowercase.
pub fn detect_challenge(
    status: u16,
    headers: &BTreeMap<String, String>,
    content_type: &str,
    body: &[u8],
) -> Option<ChallengeType> {
    if status == 429 {
        return Some(ChallengeType::TooManyRequests);
    }

    if headers
        .get("cf-mitigated")
        .is_some_and(|v| v.eq_ignore_ascii_case("challenge"))
    {
        return Some(ChallengeType::ScriptChallenge);
    }

    let relevant_status = (200..300).contains(&status) || status == 403 || status == 503;
    if !relevant_status || body.len() > MAX_INTERSTITIAL_BYTES || !looks_like_html(content_type, body) {
        return None;
    }

    let text = String::from_utf8_lossy(&body[..body.len().min(SCAN_LIMIT)]);

    if captcha_markers().is_match(&text) {
        return Some(ChallengeType::Captcha);
    }
    if script_markers().is_match(&text) {
        return Some(ChallengeType::ScriptChallenge);
    }

    let title = page_title(&text).unwrap_or_default();
    if title.eq_ignore_ascii_case("just a moment...") {
        return Some(ChallengeType::ScriptChallenge);
    }

    // Denial wording only counts in the title or on an error status
    if denied_markers().is_match(&title) || (status == 403 && denied_markers().is_match(&text)) {
        return Some(ChallengeType::AccessDenied);
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detect(status: u16, body: &str) -> Option<ChallengeType> {
        detect_challenge(status, &BTreeMap::new(), "text/html; charset=utf-8", body.as_bytes())
    }

    #[test]
    fn test_rate_limit_status() {
        assert_eq!(detect(429, ""), Some(ChallengeType::TooManyRequests));
    }

    #[test]
    fn test_cloudflare_interstitial() {
        let body = r#"<!DOCTYPE html><html><head><title>Just a moment...</title></head>
            <body><script src="/cdn-cgi/challenge-platform/h/b/orchestrate/jsch/v1"></script></body></html>"#;
        assert_eq!(detect(503, body), Some(ChallengeType::ScriptChallenge));
        assert_eq!(detect(200, body), Some(ChallengeType::ScriptChallenge));
    }

    #[test]
    fn test_mitigated_header() {
        let mut headers = BTreeMap::new();
        headers.insert("cf-mitigated".to_string(), "challenge".to_string());
        assert_eq!(
            detect_challenge(403, &headers, "text/html", b"<html></html>"),
            Some(ChallengeType::ScriptChallenge)
        );
    }

    #[test]
    fn test_captcha_form() {
        let body = r#"<html><body><div class="g-recaptcha" data-sitekey="x"></div></body></html>"#;
        assert_eq!(detect(200, body), Some(ChallengeType::Captcha));
    }

    #[test]
    fn test_access_denied() {
        let body = "<html><head><title>Access Denied</title></head><body>Reference #18.abc</body></html>";
        assert_eq!(detect(403, body), Some(ChallengeType::AccessDenied));
    }

    #[test]
    fn test_regular_pages_pass() {
        let article = r#"<html><head><title>Protein folding in yeast</title>
            <meta name="citation_title" content="Protein folding in yeast"></head>
            <body><article>Access to this dataset is denied to nobody.</article></body></html>"#;
        assert_eq!(detect(200, article), None);
        assert_eq!(detect(404, "<html><title>Not found</title></html>"), None);
        assert_eq!(
            detect_challenge(200, &BTreeMap::new(), "application/pdf", b"%PDF-1.7 captcha"),
            None
        );
    }
}

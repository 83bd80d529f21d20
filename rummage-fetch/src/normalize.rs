//! Converts raw fetch results into canonical text, titles, and outbound links.

use async_trait::async_trait;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;
use url::Url;

use crate::error::Result;
use crate::result::FetchResult;

/// Coarse content classification driving normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    Html,
    Json,
    Image,
    Other,
}

impl ContentKind {
    /// Header wins; otherwise sniff the payload.
    pub fn detect(content_type: Option<&str>, body: &[u8]) -> Self {
        if let Some(ct) = content_type {
            let ct = ct.to_ascii_lowercase();
            if ct.contains("text/html") || ct.contains("application/xhtml") {
                return ContentKind::Html;
            }
            if ct.contains("json") {
                return ContentKind::Json;
            }
            if ct.starts_with("image/") {
                return ContentKind::Image;
            }
        }

        let head = &body[..body.len().min(512)];
        let text = String::from_utf8_lossy(head);
        let trimmed = text.trim_start().to_ascii_lowercase();
        if trimmed.starts_with("<!doctype html") || trimmed.starts_with("<html") {
            return ContentKind::Html;
        }
        if trimmed.starts_with('{') || trimmed.starts_with('[') {
            return ContentKind::Json;
        }
        if body.starts_with(&[0x89, b'P', b'N', b'G'])
            || body.starts_with(&[0xFF, 0xD8, 0xFF])
            || body.starts_with(b"GIF8")
        {
            return ContentKind::Image;
        }
        ContentKind::Other
    }
}

/// External OCR capability: image bytes in, ordered text lines out.
#[async_trait]
pub trait OcrEngine: Send + Sync {
    async fn recognize(&self, bytes: &[u8]) -> Result<Vec<String>>;
}

/// One normalized page; what the traversal engine and retrieval callers consume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page {
    pub url: String,
    pub depth: usize,
    pub title: String,
    pub content: String,
    /// Absolute outbound links in discovery order, deduplicated.
    pub links: Vec<String>,
    pub fetched_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Clone, Default)]
pub struct Normalizer {
    ocr: Option<Arc<dyn OcrEngine>>,
}

impl Normalizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ocr(mut self, ocr: Arc<dyn OcrEngine>) -> Self {
        self.ocr = Some(ocr);
        self
    }

    pub async fn normalize(&self, fetch: &FetchResult, depth: usize) -> Page {
        let kind = ContentKind::detect(fetch.content_type.as_deref(), fetch.content.as_bytes());
        let (title, content, links) = match kind {
            ContentKind::Html => parse_html(&fetch.content, &fetch.url),
            ContentKind::Json => ("Untitled".to_string(), format_json(&fetch.content), Vec::new()),
            ContentKind::Image => {
                let bytes = fetch.raw.as_deref().unwrap_or(fetch.content.as_bytes());
                let lines = match &self.ocr {
                    Some(engine) => match engine.recognize(bytes).await {
                        Ok(lines) => lines,
                        Err(e) => {
                            debug!("OCR failed for {}: {e}", fetch.url);
                            Vec::new()
                        }
                    },
                    None => Vec::new(),
                };
                ("Untitled".to_string(), lines.join("\n"), Vec::new())
            }
            ContentKind::Other => ("Untitled".to_string(), fetch.content.clone(), Vec::new()),
        };

        Page {
            url: fetch.url.clone(),
            depth,
            title,
            content,
            links,
            fetched_at: fetch.fetched_at,
        }
    }
}

fn parse_html(html: &str, base_url: &str) -> (String, String, Vec<String>) {
    let document = Html::parse_document(html);
    let title = extract_title(&document);
    let content = extract_text(&document);
    let links = extract_links(&document, base_url);
    (title, content, links)
}

fn extract_title(document: &Html) -> String {
    let title_selector = Selector::parse("title").unwrap();
    if let Some(element) = document.select(&title_selector).next() {
        let text = element.text().collect::<String>().trim().to_string();
        if !text.is_empty() {
            return text;
        }
    }
    let h1_selector = Selector::parse("h1").unwrap();
    if let Some(element) = document.select(&h1_selector).next() {
        let text = element.text().collect::<String>().trim().to_string();
        if !text.is_empty() {
            return text;
        }
    }
    "Untitled".to_string()
}

/// Main text from content elements; page chrome is skipped.
fn extract_text(document: &Html) -> String {
    let content_selector =
        Selector::parse("h1, h2, h3, h4, h5, h6, p, li, pre, blockquote").unwrap();

    let mut parts = Vec::new();
    for element in document.select(&content_selector) {
        if inside_chrome(&element) {
            continue;
        }
        let text = element
            .text()
            .collect::<Vec<_>>()
            .join(" ")
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ");
        if !text.is_empty() {
            parts.push(text);
        }
    }
    parts.join("\n")
}

fn inside_chrome(element: &ElementRef) -> bool {
    element
        .ancestors()
        .filter_map(ElementRef::wrap)
        .any(|a| {
            matches!(
                a.value().name(),
                "nav" | "header" | "footer" | "aside" | "menu" | "script" | "style" | "noscript"
            )
        })
}

fn extract_links(document: &Html, base_url: &str) -> Vec<String> {
    let link_selector = Selector::parse("a[href]").unwrap();
    let base = Url::parse(base_url).ok();

    let mut seen = HashSet::new();
    let mut links = Vec::new();
    for element in document.select(&link_selector) {
        if let Some(href) = element.value().attr("href")
            && let Some(absolute) = resolve_link(base.as_ref(), href)
            && seen.insert(absolute.clone())
        {
            links.push(absolute);
        }
    }
    links
}

fn resolve_link(base: Option<&Url>, href: &str) -> Option<String> {
    let href = href.trim();
    // Skip empty, javascript:, mailto:, tel:, and fragment-only links
    if href.is_empty()
        || href.starts_with('#')
        || href.starts_with("javascript:")
        || href.starts_with("mailto:")
        || href.starts_with("tel:")
    {
        return None;
    }

    let mut resolved = match base {
        Some(base) => base.join(href).ok()?,
        None => Url::parse(href).ok()?,
    };
    if !matches!(resolved.scheme(), "http" | "https") {
        return None;
    }
    resolved.set_fragment(None);
    Some(resolved.to_string())
}

fn format_json(raw: &str) -> String {
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(value) => serde_json::to_string_pretty(&value).unwrap_or_else(|_| raw.to_string()),
        Err(_) => raw.to_string(),
    }
}

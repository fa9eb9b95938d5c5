//! Local page extractor: fetches a URL and reduces the HTML to readable text.

use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use serde_json::{json, Value};

use super::{Provider, ProviderError, ProviderReply, ProviderRequest};

static RE_TITLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<title[^>]*>(.*?)</title>").unwrap());
static RE_DESCRIPTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?is)<meta[^>]+(?:name|property)\s*=\s*["'](?:og:)?description["'][^>]*content\s*=\s*["']([^"']*)["']"#,
    )
    .unwrap()
});
static RE_NON_CONTENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<(script|style|noscript|svg|head)\b[^>]*>.*?</(script|style|noscript|svg|head)>")
        .unwrap()
});
static RE_COMMENT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)<!--.*?-->").unwrap());
static RE_TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]+>").unwrap());
static RE_WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

/// Readable content of an HTML page.
#[derive(Debug, Clone, PartialEq)]
pub struct PageText {
    pub title: Option<String>,
    pub text: String,
}

fn decode_entities(s: &str) -> String {
    s.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

fn collapse(s: &str) -> String {
    RE_WHITESPACE.replace_all(s, " ").trim().to_string()
}

/// Strips markup from `html`. When the body has no text the meta
/// description is used instead.
pub fn extract_page_text(html: &str) -> PageText {
    let title = RE_TITLE
        .captures(html)
        .map(|c| collapse(&decode_entities(&c[1])))
        .filter(|t| !t.is_empty());

    let body = RE_NON_CONTENT.replace_all(html, " ");
    let body = RE_COMMENT.replace_all(&body, " ");
    let body = RE_TAG.replace_all(&body, " ");
    let mut text = collapse(&decode_entities(&body));

    if text.is_empty() {
        if let Some(c) = RE_DESCRIPTION.captures(html) {
            text = collapse(&decode_entities(&c[1]));
        }
    }

    PageText { title, text }
}

pub struct PageScraper {
    client: Client,
    max_chars: usize,
}

impl PageScraper {
    pub fn new(timeout: Duration, max_chars: usize) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(timeout)
            .user_agent(concat!("distill/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client, max_chars })
    }
}

#[async_trait]
impl Provider for PageScraper {
    async fn invoke(&self, request: &ProviderRequest) -> Result<ProviderReply, ProviderError> {
        let url = request
            .input
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| ProviderError::InvalidInput("missing url".to_string()))?;

        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ProviderError::Status {
                status: status.as_u16(),
                body: String::new(),
            });
        }
        let html = response.text().await?;
        let page = extract_page_text(&html);
        let text: String = page.text.chars().take(self.max_chars).collect();

        Ok(ProviderReply::Ready(json!({
            "text": text,
            "title": page.title,
        })))
    }
}

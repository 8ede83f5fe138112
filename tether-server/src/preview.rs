//! Best-effort link previews.
//!
//! Finds the first URL in a message body and fetches lightweight metadata
//! for it. Every failure collapses into "no preview".

use std::collections::HashMap;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;

use crate::message::{Preview, PreviewImage, PreviewText};

/// Bytes of a page inspected for metadata. Anything past this is not read.
const MAX_BODY: usize = 256 * 1024;

static URL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"https?://[^\s<>"']+"#).expect("static regex"));
static META_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?is)<meta\b[^>]*>").expect("static regex"));
static ATTR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)\b(property|name|content)\s*=\s*(?:"([^"]*)"|'([^']*)')"#).expect("static regex")
});
static TITLE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<title[^>]*>([^<]+)</title>").expect("static regex"));

/// Source of link previews for message bodies.
#[async_trait]
pub trait PreviewFetcher: Send + Sync {
    /// Preview for the first link in `text`, if there is one worth showing.
    async fn preview(&self, text: &str) -> Option<Preview>;
}

/// Fetcher that never produces a preview.
pub struct NoPreview;

#[async_trait]
impl PreviewFetcher for NoPreview {
    async fn preview(&self, _text: &str) -> Option<Preview> {
        None
    }
}

/// Fetches pages over HTTP and reads their OpenGraph tags.
pub struct HttpPreviewer {
    client: reqwest::Client,
}

impl HttpPreviewer {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::limited(3))
            .user_agent("tether/0.1 (link preview)")
            .build()?;
        Ok(Self { client })
    }

    async fn fetch(&self, url: &url::Url) -> anyhow::Result<Option<Preview>> {
        let mut resp = self.client.get(url.as_str()).send().await?.error_for_status()?;
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        if content_type.starts_with("image/") {
            let mime = content_type.split(';').next().unwrap_or("").trim().to_string();
            return Ok(Some(Preview {
                text: None,
                image: Some(PreviewImage {
                    url: url.to_string(),
                    mime,
                    width: 0,
                    height: 0,
                }),
            }));
        }
        if !content_type.contains("text/html") {
            return Ok(None);
        }

        // OpenGraph tags live in <head>, so a prefix is enough.
        let mut body = Vec::new();
        while let Some(chunk) = resp.chunk().await? {
            let room = MAX_BODY - body.len();
            body.extend_from_slice(&chunk[..chunk.len().min(room)]);
            if body.len() == MAX_BODY {
                break;
            }
        }
        Ok(parse_html(&String::from_utf8_lossy(&body), url))
    }
}

#[async_trait]
impl PreviewFetcher for HttpPreviewer {
    async fn preview(&self, text: &str) -> Option<Preview> {
        let url = first_url(text)?;
        match self.fetch(&url).await {
            Ok(preview) => preview,
            Err(e) => {
                tracing::debug!(url = %url, error = %e, "Preview fetch failed");
                None
            }
        }
    }
}

/// First http(s) URL in `text`, with trailing sentence punctuation removed.
pub fn first_url(text: &str) -> Option<url::Url> {
    let found = URL_RE.find(text)?.as_str();
    let trimmed = found.trim_end_matches(['.', ',', ')', '!', '?', ';', ':']);
    url::Url::parse(trimmed).ok()
}

/// Build a preview from an HTML document's OpenGraph tags.
///
/// Falls back to `<title>` for the title. A description equal to the title
/// is dropped. Relative image URLs are resolved against `page`.
pub fn parse_html(html: &str, page: &url::Url) -> Option<Preview> {
    let meta = meta_tags(html);
    let get = |key: &str| meta.get(key).cloned().unwrap_or_default();

    let mut title = get("og:title");
    if title.is_empty() {
        title = TITLE_RE
            .captures(html)
            .and_then(|c| c.get(1))
            .map(|m| decode_html_entities(m.as_str().trim()))
            .unwrap_or_default();
    }
    let mut description = get("og:description");
    if description.is_empty() {
        description = get("description");
    }
    if description == title {
        description.clear();
    }
    let site_name = get("og:site_name");

    let text = (!title.is_empty() || !description.is_empty() || !site_name.is_empty()).then(|| PreviewText {
        title,
        description,
        site_name,
    });

    let image_url = Some(get("og:image:secure_url"))
        .filter(|u| !u.is_empty())
        .unwrap_or_else(|| get("og:image"));
    let image = page.join(&image_url).ok().filter(|_| !image_url.is_empty()).map(|url| PreviewImage {
        url: url.to_string(),
        mime: get("og:image:type"),
        width: get("og:image:width").parse().unwrap_or(0),
        height: get("og:image:height").parse().unwrap_or(0),
    });

    let preview = Preview { text, image };
    (!preview.is_empty()).then_some(preview)
}

/// `property`/`name` → `content` for every `<meta>` tag; first one wins.
fn meta_tags(html: &str) -> HashMap<String, String> {
    let mut tags = HashMap::new();
    for tag in META_RE.find_iter(html) {
        let mut key = None;
        let mut content = None;
        for attr in ATTR_RE.captures_iter(tag.as_str()) {
            let value = attr.get(2).or_else(|| attr.get(3)).map(|m| m.as_str()).unwrap_or("");
            match attr[1].to_ascii_lowercase().as_str() {
                "content" => content = Some(decode_html_entities(value)),
                _ => key = Some(value.to_ascii_lowercase()),
            }
        }
        if let (Some(key), Some(content)) = (key, content) {
            tags.entry(key).or_insert(content);
        }
    }
    tags
}

fn decode_html_entities(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&#x27;", "'")
        .replace("&#x2F;", "/")
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
}

//! Article handler
//!
//! Fetches a captured URL, keeps the raw HTML and writes a markdown rendition.
//! The fetch itself sits behind [`Fetcher`] so the HTTP client, a readability
//! service or a test stub can be swapped in.

use anyhow::{bail, Context, Result};
use htmd::HtmlToMarkdown;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::{
    artifact_dir, existing_result, front_matter, HandlerInput, HandlerOutcome, IngestionHandler,
};
use crate::canonical::{canonicalize, has_scheme, ContentUid};
use crate::config::FetchConfig;
use crate::fsutil;
use crate::store::{ContentMetadata, ContentStore};

#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub final_url: String,
    pub content_type: Option<String>,
    pub body: String,
}

pub trait Fetcher: Send + Sync {
    fn fetch(&self, url: &str) -> Result<FetchedPage>;
}

/// Blocking HTTP fetcher. Must run off the async runtime.
pub struct HttpFetcher {
    timeout: Duration,
    user_agent: String,
}

impl HttpFetcher {
    pub fn new(config: &FetchConfig) -> Self {
        Self {
            timeout: Duration::from_secs(config.timeout_secs),
            user_agent: config.user_agent.clone(),
        }
    }
}

impl Fetcher for HttpFetcher {
    fn fetch(&self, url: &str) -> Result<FetchedPage> {
        // Built per call: a blocking client must not be created or dropped
        // on an async worker thread.
        let client = reqwest::blocking::Client::builder()
            .timeout(self.timeout)
            .user_agent(self.user_agent.as_str())
            .build()
            .context("Failed to build HTTP client")?;

        let target = if has_scheme(url) {
            url.to_string()
        } else {
            format!("http://{}", url)
        };

        let response = client
            .get(&target)
            .send()
            .with_context(|| format!("GET {} failed", target))?;

        let status = response.status();
        if !status.is_success() {
            bail!("GET {} returned {}", target, status);
        }

        let final_url = response.url().to_string();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        let body = response.text().context("Failed to read response body")?;

        Ok(FetchedPage {
            final_url,
            content_type,
            body,
        })
    }
}

pub struct ArticleHandler {
    store: Arc<ContentStore>,
    content_dir: PathBuf,
    fetcher: Box<dyn Fetcher>,
}

impl ArticleHandler {
    pub fn new(store: Arc<ContentStore>, content_dir: PathBuf, fetcher: Box<dyn Fetcher>) -> Self {
        Self {
            store,
            content_dir,
            fetcher,
        }
    }
}

impl IngestionHandler for ArticleHandler {
    fn id(&self) -> &str {
        "article"
    }

    fn item_types(&self) -> &[&str] {
        &["url"]
    }

    fn handle(&self, input: &HandlerInput) -> Result<HandlerOutcome> {
        let canonical = canonicalize(&input.source);
        if canonical.trim().is_empty() {
            return Ok(HandlerOutcome::failed("empty URL"));
        }
        let uid = input
            .content_uid
            .clone()
            .unwrap_or_else(|| ContentUid::from_canonical(&canonical));

        if let Some(paths) = existing_result(&self.store, &uid)? {
            debug!(capture_id = %input.capture_id, uid = %uid, "Already ingested, skipping fetch");
            return Ok(HandlerOutcome::skipped(paths));
        }

        let page = match self.fetcher.fetch(&input.source) {
            Ok(page) => page,
            Err(e) => {
                self.store.record_failure(
                    &uid,
                    &input.item_type,
                    Some(&input.source),
                    Some(&input.capture_id),
                    &format!("{:#}", e),
                )?;
                return Err(e);
            }
        };

        let dir = artifact_dir(&self.content_dir, &uid);
        let html_path = dir.join("page.html");
        let markdown_path = dir.join("article.md");

        let mut meta = ContentMetadata::new(uid.clone(), input.item_type.clone());
        meta.source_url = Some(input.source.clone());
        meta.canonical_url = Some(canonical);
        meta.title = extract_title(&page.body);
        meta.tags = input.user_context.tags.clone();
        meta.capture_id = Some(input.capture_id.clone());
        meta.html_path = Some(html_path.to_string_lossy().to_string());
        meta.content_path = Some(markdown_path.to_string_lossy().to_string());

        fsutil::atomic_write(&html_path, page.body.as_bytes())
            .with_context(|| format!("writing {}", html_path.display()))?;

        let mut markdown = front_matter(&meta, input)?;
        if let Some(title) = &meta.title {
            markdown.push_str(&format!("# {}\n\n", title));
        }
        if page.final_url != input.source {
            markdown.push_str(&format!("<{}>\n\n", page.final_url));
        }
        markdown.push_str(&html_to_markdown(&page.body)?);
        markdown.push('\n');
        fsutil::atomic_write(&markdown_path, markdown.as_bytes())
            .with_context(|| format!("writing {}", markdown_path.display()))?;

        self.store.upsert(&meta)?;
        info!(
            capture_id = %input.capture_id,
            uid = %uid,
            content_type = page.content_type.as_deref().unwrap_or("-"),
            "Article stored"
        );
        Ok(HandlerOutcome::completed(meta.result_paths()))
    }
}

/// Text of the document `<head>`, which is where `<title>` lives and nothing
/// else there renders as text. Comments are dropped and entities decoded by
/// the HTML parser.
pub fn extract_title(html: &str) -> Option<String> {
    let converter = HtmlToMarkdown::builder()
        .skip_tags(vec!["body", "script", "style", "noscript", "template"])
        .build();
    let head = converter.convert(html).ok()?;
    let title = head.split_whitespace().collect::<Vec<_>>().join(" ");
    if title.is_empty() {
        None
    } else {
        Some(title)
    }
}

/// Markdown rendition of the page body
pub fn html_to_markdown(html: &str) -> Result<String> {
    let converter = HtmlToMarkdown::builder()
        .skip_tags(vec!["head", "script", "style", "noscript", "template"])
        .build();
    let markdown = converter
        .convert(html)
        .context("Failed to convert HTML to markdown")?;
    Ok(markdown.trim().to_string())
}

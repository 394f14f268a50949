//! Ingestion handler trait and registry
//!
//! A handler turns one claimed queue item into stored content. The built-in
//! handlers cover the three capture types:
//! - `url`: ArticleHandler (fetch, extract, store markdown + html)
//! - `text`: TextHandler (store the note as markdown)
//! - `file`: FileHandler (copy the payload into the content store)
//!
//! Other item types (podcast episodes, voice memos needing transcription,
//! read-later imports) plug in by registering another handler.

mod article;
mod file;
mod text;

pub use article::{ArticleHandler, FetchedPage, Fetcher, HttpFetcher};
pub use file::FileHandler;
pub use text::TextHandler;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;

use crate::canonical::ContentUid;
use crate::config::Config;
use crate::model::UserContext;
use crate::queue::QueueItem;
use crate::store::{ContentMetadata, ContentStore};

/// What a handler is given for one item
#[derive(Debug, Clone)]
pub struct HandlerInput {
    pub capture_id: String,
    pub item_type: String,
    pub source: String,
    pub user_context: UserContext,
    pub content_uid: Option<ContentUid>,
}

impl HandlerInput {
    pub fn from_item(item: &QueueItem) -> Self {
        Self {
            capture_id: item.capture_id.clone(),
            item_type: item.item_type.clone(),
            source: item.source.clone(),
            user_context: item.user_context.clone(),
            content_uid: item.content_uid.clone(),
        }
    }
}

/// What a handler reports back
#[derive(Debug, Clone, Default, Serialize)]
pub struct HandlerOutcome {
    pub success: bool,
    /// Content already existed; nothing was fetched or written
    pub skipped: bool,
    pub result_paths: BTreeMap<String, String>,
    pub error: Option<String>,
}

impl HandlerOutcome {
    pub fn completed(result_paths: BTreeMap<String, String>) -> Self {
        Self {
            success: true,
            skipped: false,
            result_paths,
            error: None,
        }
    }

    pub fn skipped(result_paths: BTreeMap<String, String>) -> Self {
        Self {
            success: true,
            skipped: true,
            result_paths,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            skipped: false,
            result_paths: BTreeMap::new(),
            error: Some(error.into()),
        }
    }
}

/// Ingestion handler trait
pub trait IngestionHandler: Send + Sync {
    /// Unique identifier, e.g. "article"
    fn id(&self) -> &str;

    /// Queue item types this handler accepts
    fn item_types(&self) -> &[&str];

    /// Fetch, transform and persist one item. Implementations must look the
    /// content UID up in the content store before doing any expensive work.
    fn handle(&self, input: &HandlerInput) -> Result<HandlerOutcome>;
}

/// Registry of available handlers
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: Vec<Box<dyn IngestionHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in url, text and file handlers
    pub fn with_defaults(config: &Config, store: Arc<ContentStore>) -> Self {
        let content_dir = config.storage.content_path();
        let mut registry = Self::new();
        registry.register(Box::new(ArticleHandler::new(
            store.clone(),
            content_dir.clone(),
            Box::new(HttpFetcher::new(&config.fetch)),
        )));
        registry.register(Box::new(TextHandler::new(
            store.clone(),
            content_dir.clone(),
            config.storage.captures_path(),
        )));
        registry.register(Box::new(FileHandler::new(store, content_dir)));
        registry
    }

    /// Later registrations win for an item type already covered
    pub fn register(&mut self, handler: Box<dyn IngestionHandler>) {
        self.handlers.insert(0, handler);
    }

    pub fn get(&self, item_type: &str) -> Option<&dyn IngestionHandler> {
        self.handlers
            .iter()
            .find(|h| h.item_types().contains(&item_type))
            .map(|h| h.as_ref())
    }

    pub fn item_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .handlers
            .iter()
            .flat_map(|h| h.item_types().iter().map(|t| t.to_string()))
            .collect();
        types.sort();
        types.dedup();
        types
    }

    /// Run the matching handler; errors become a failed outcome
    pub fn dispatch(&self, input: &HandlerInput) -> HandlerOutcome {
        let Some(handler) = self.get(&input.item_type) else {
            return HandlerOutcome::failed(format!(
                "no handler for item type '{}'",
                input.item_type
            ));
        };

        match handler.handle(input) {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(
                    capture_id = %input.capture_id,
                    handler = handler.id(),
                    "Handler error: {:#}",
                    e
                );
                HandlerOutcome::failed(format!("{:#}", e))
            }
        }
    }
}

// ============================================
// SHARED HELPERS
// ============================================

/// Directory holding every artifact of one content item
pub(crate) fn artifact_dir(content_dir: &Path, uid: &ContentUid) -> PathBuf {
    content_dir.join(uid.as_str())
}

/// Return the stored result if this UID was already ingested successfully
pub(crate) fn existing_result(
    store: &ContentStore,
    uid: &ContentUid,
) -> Result<Option<BTreeMap<String, String>>> {
    Ok(store
        .get(uid)?
        .filter(|m| m.status == crate::store::ContentStatus::Completed)
        .map(|m| m.result_paths()))
}

#[derive(Serialize)]
struct FrontMatter<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    title: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    source: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    canonical: Option<&'a str>,
    uid: &'a ContentUid,
    capture_id: &'a str,
    ingested_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "<[_]>::is_empty")]
    tags: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    notes: Option<&'a str>,
}

/// YAML front matter for markdown artifacts
pub(crate) fn front_matter(meta: &ContentMetadata, input: &HandlerInput) -> Result<String> {
    let header = FrontMatter {
        title: meta.title.as_deref(),
        source: meta.source_url.as_deref(),
        canonical: meta.canonical_url.as_deref(),
        uid: &meta.uid,
        capture_id: &input.capture_id,
        ingested_at: Utc::now(),
        tags: &meta.tags,
        notes: input.user_context.notes.as_deref(),
    };
    let yaml = serde_yaml::to_string(&header).context("Failed to render front matter")?;
    Ok(format!("---\n{}---\n\n", yaml))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    impl IngestionHandler for Echo {
        fn id(&self) -> &str {
            "echo"
        }

        fn item_types(&self) -> &[&str] {
            &["text", "podcast_episode"]
        }

        fn handle(&self, input: &HandlerInput) -> Result<HandlerOutcome> {
            if input.source == "explode" {
                anyhow::bail!("handler blew up");
            }
            let mut paths = BTreeMap::new();
            paths.insert("echo".to_string(), input.source.clone());
            Ok(HandlerOutcome::completed(paths))
        }
    }

    fn input(item_type: &str, source: &str) -> HandlerInput {
        HandlerInput {
            capture_id: "cap".to_string(),
            item_type: item_type.to_string(),
            source: source.to_string(),
            user_context: UserContext::default(),
            content_uid: None,
        }
    }

    #[test]
    fn test_dispatch_by_item_type() {
        let mut registry = HandlerRegistry::new();
        registry.register(Box::new(Echo));

        let ok = registry.dispatch(&input("podcast_episode", "ep-1"));
        assert!(ok.success);
        assert_eq!(ok.result_paths["echo"], "ep-1");

        let missing = registry.dispatch(&input("video", "x"));
        assert!(!missing.success);
        assert!(missing.error.unwrap().contains("no handler"));

        let failed = registry.dispatch(&input("text", "explode"));
        assert!(!failed.success);
        assert!(failed.error.unwrap().contains("blew up"));

        assert_eq!(registry.item_types(), vec!["podcast_episode", "text"]);
    }

    #[test]
    fn test_defaults_cover_capture_types() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = Config::with_root(dir.path());
        let store = Arc::new(ContentStore::open_in_memory().unwrap());
        let registry = HandlerRegistry::with_defaults(&config, store);
        assert_eq!(registry.get("url").unwrap().id(), "article");
        assert_eq!(registry.get("text").unwrap().id(), "text");
        assert_eq!(registry.get("file").unwrap().id(), "file");

        // a later registration overrides the built-in text handler
        let mut registry = registry;
        registry.register(Box::new(Echo));
        assert_eq!(registry.get("text").unwrap().id(), "echo");
    }

    #[test]
    fn test_front_matter_round_trips_awkward_values() {
        let mut meta = ContentMetadata::new(ContentUid::from_bytes(b"note"), "text");
        meta.title = Some("Re: \"quotes\", colons: and #hashes".to_string());
        meta.tags = vec!["read, later".to_string(), "[draft]".to_string()];
        let input = HandlerInput {
            capture_id: "cap-1".to_string(),
            item_type: "text".to_string(),
            source: "inline".to_string(),
            user_context: UserContext {
                notes: Some("line one\nline two".to_string()),
                ..Default::default()
            },
            content_uid: None,
        };

        let rendered = front_matter(&meta, &input).unwrap();
        assert!(rendered.starts_with("---\n"));
        assert!(rendered.ends_with("---\n\n"));
        let body = rendered
            .trim_start_matches("---\n")
            .trim_end_matches("---\n\n");

        let parsed: serde_yaml::Value = serde_yaml::from_str(body).unwrap();
        assert_eq!(parsed["title"].as_str(), meta.title.as_deref());
        assert_eq!(parsed["uid"].as_str(), Some(meta.uid.as_str()));
        assert_eq!(parsed["capture_id"].as_str(), Some("cap-1"));
        assert_eq!(parsed["notes"].as_str(), Some("line one\nline two"));
        let tags: Vec<String> = serde_yaml::from_value(parsed["tags"].clone()).unwrap();
        assert_eq!(tags, vec!["read, later".to_string(), "[draft]".to_string()]);
        assert!(parsed.get("source").is_none());
    }
}

//! Text note handler

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

use super::{
    artifact_dir, existing_result, front_matter, HandlerInput, HandlerOutcome, IngestionHandler,
};
use crate::canonical::ContentUid;
use crate::fsutil;
use crate::store::{ContentMetadata, ContentStore};

const TITLE_CHARS: usize = 80;

pub struct TextHandler {
    store: Arc<ContentStore>,
    content_dir: PathBuf,
    captures_dir: PathBuf,
}

impl TextHandler {
    pub fn new(store: Arc<ContentStore>, content_dir: PathBuf, captures_dir: PathBuf) -> Self {
        Self {
            store,
            content_dir,
            captures_dir,
        }
    }

    /// Only payloads written by the capture layer are read from disk
    fn captured_payload(&self, source: &str) -> Option<PathBuf> {
        let path = std::fs::canonicalize(source).ok()?;
        let captures = std::fs::canonicalize(&self.captures_dir).ok()?;
        (path.starts_with(&captures) && path.is_file()).then_some(path)
    }
}

impl IngestionHandler for TextHandler {
    fn id(&self) -> &str {
        "text"
    }

    fn item_types(&self) -> &[&str] {
        &["text"]
    }

    fn handle(&self, input: &HandlerInput) -> Result<HandlerOutcome> {
        // Captures hand over the payload path; items queued by hand may carry
        // the note inline
        let text = match self.captured_payload(&input.source) {
            Some(path) => std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?,
            None => input.source.clone(),
        };

        if text.trim().is_empty() {
            return Ok(HandlerOutcome::failed("empty text"));
        }

        let uid = ContentUid::from_bytes(text.as_bytes());
        if let Some(paths) = existing_result(&self.store, &uid)? {
            debug!(capture_id = %input.capture_id, uid = %uid, "Note already stored");
            return Ok(HandlerOutcome::skipped(paths));
        }

        let note_path = artifact_dir(&self.content_dir, &uid).join("note.md");

        let mut meta = ContentMetadata::new(uid.clone(), input.item_type.clone());
        meta.title = title_of(&text);
        meta.tags = input.user_context.tags.clone();
        meta.capture_id = Some(input.capture_id.clone());
        meta.content_path = Some(note_path.to_string_lossy().to_string());

        let mut markdown = front_matter(&meta, input)?;
        markdown.push_str(text.trim_end());
        markdown.push('\n');
        fsutil::atomic_write(&note_path, markdown.as_bytes())
            .with_context(|| format!("writing {}", note_path.display()))?;

        self.store.upsert(&meta)?;
        info!(capture_id = %input.capture_id, uid = %uid, chars = text.chars().count(), "Note stored");
        Ok(HandlerOutcome::completed(meta.result_paths()))
    }
}

/// First non-blank line, cut to a readable length
fn title_of(text: &str) -> Option<String> {
    let line = text.lines().map(str::trim).find(|l| !l.is_empty())?;
    let line = line.trim_start_matches('#').trim();
    if line.chars().count() > TITLE_CHARS {
        let cut: String = line.chars().take(TITLE_CHARS).collect();
        Some(format!("{}...", cut.trim_end()))
    } else {
        Some(line.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::UserContext;
    use tempfile::TempDir;

    fn input(capture_id: &str, source: &str) -> HandlerInput {
        HandlerInput {
            capture_id: capture_id.to_string(),
            item_type: "text".to_string(),
            source: source.to_string(),
            user_context: UserContext {
                tags: vec!["idea".to_string()],
                ..Default::default()
            },
            content_uid: None,
        }
    }

    #[test]
    fn test_title_of() {
        assert_eq!(title_of("\n\n  # Heading\nbody").as_deref(), Some("Heading"));
        assert_eq!(title_of("   \n"), None);
        let long = "x".repeat(200);
        assert_eq!(title_of(&long).unwrap().chars().count(), TITLE_CHARS + 3);
    }

    #[test]
    fn test_note_from_payload_file_then_dedup() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(ContentStore::open_in_memory().unwrap());
        let captures = dir.path().join("captures");
        std::fs::create_dir_all(&captures).unwrap();
        let handler = TextHandler::new(store.clone(), dir.path().join("content"), captures.clone());

        let payload = captures.join("20250101_000000_000_abcd1234.txt");
        std::fs::write(&payload, "Buy milk\nand eggs").unwrap();

        let outcome = handler.handle(&input("c1", payload.to_str().unwrap())).unwrap();
        assert!(outcome.success && !outcome.skipped);
        let note = std::fs::read_to_string(&outcome.result_paths["content"]).unwrap();
        assert!(note.starts_with("---\ntitle: Buy milk\n"));
        assert!(note.contains("tags:\n- idea\n"));
        assert!(note.ends_with("Buy milk\nand eggs\n"));

        // same text captured again, inline this time
        let again = handler.handle(&input("c2", "Buy milk\nand eggs")).unwrap();
        assert!(again.skipped);

        let meta = store
            .get(&ContentUid::from_bytes(b"Buy milk\nand eggs"))
            .unwrap()
            .unwrap();
        assert_eq!(meta.capture_id.as_deref(), Some("c1"));
    }

    #[test]
    fn test_blank_note_fails() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(ContentStore::open_in_memory().unwrap());
        let handler = TextHandler::new(store, dir.path().to_path_buf(), dir.path().join("captures"));
        let outcome = handler.handle(&input("c1", "   ")).unwrap();
        assert!(!outcome.success);
    }

    #[test]
    fn test_path_outside_captures_is_stored_as_text() {
        let dir = TempDir::new().unwrap();
        let captures = dir.path().join("captures");
        std::fs::create_dir_all(&captures).unwrap();
        let store = Arc::new(ContentStore::open_in_memory().unwrap());
        let handler = TextHandler::new(store, dir.path().join("content"), captures);

        let elsewhere = dir.path().join("secrets.txt");
        std::fs::write(&elsewhere, "not for the notes").unwrap();
        let note_text = elsewhere.to_str().unwrap();

        let outcome = handler.handle(&input("c1", note_text)).unwrap();
        assert!(outcome.success);
        let note = std::fs::read_to_string(&outcome.result_paths["content"]).unwrap();
        assert!(note.ends_with(&format!("{}\n", note_text)));
        assert!(!note.contains("not for the notes"));
    }
}

//! File handler: moves a captured file into the content store

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use super::{artifact_dir, existing_result, HandlerInput, HandlerOutcome, IngestionHandler};
use crate::canonical::ContentUid;
use crate::fsutil;
use crate::store::{ContentMetadata, ContentStore};

pub struct FileHandler {
    store: Arc<ContentStore>,
    content_dir: PathBuf,
}

impl FileHandler {
    pub fn new(store: Arc<ContentStore>, content_dir: PathBuf) -> Self {
        Self { store, content_dir }
    }
}

impl IngestionHandler for FileHandler {
    fn id(&self) -> &str {
        "file"
    }

    fn item_types(&self) -> &[&str] {
        &["file"]
    }

    fn handle(&self, input: &HandlerInput) -> Result<HandlerOutcome> {
        let source = Path::new(&input.source);
        if !source.is_file() {
            bail!("captured file missing: {}", source.display());
        }
        let bytes =
            std::fs::read(source).with_context(|| format!("reading {}", source.display()))?;

        let uid = ContentUid::from_bytes(&bytes);
        if let Some(paths) = existing_result(&self.store, &uid)? {
            debug!(capture_id = %input.capture_id, uid = %uid, "File already stored");
            return Ok(HandlerOutcome::skipped(paths));
        }

        let name = original_name(source, &input.capture_id);
        let dest = artifact_dir(&self.content_dir, &uid).join(&name);
        fsutil::atomic_write(&dest, &bytes)
            .with_context(|| format!("writing {}", dest.display()))?;

        let mut meta = ContentMetadata::new(uid.clone(), input.item_type.clone());
        meta.title = Some(name);
        meta.tags = input.user_context.tags.clone();
        meta.capture_id = Some(input.capture_id.clone());
        meta.content_path = Some(dest.to_string_lossy().to_string());
        self.store.upsert(&meta)?;

        info!(capture_id = %input.capture_id, uid = %uid, bytes = bytes.len(), "File stored");
        Ok(HandlerOutcome::completed(meta.result_paths()))
    }
}

/// Payloads are stored as `{capture_id}_{name}`; recover `name`
fn original_name(path: &Path, capture_id: &str) -> String {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "file".to_string());
    match file_name.strip_prefix(&format!("{}_", capture_id)) {
        Some(rest) if !rest.is_empty() => rest.to_string(),
        _ => file_name,
    }
}

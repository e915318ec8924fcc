//! Persistence of finished run bundles.

use crate::errors::StoreError;
use crate::models::FinalResults;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::info;

#[cfg(test)]
use std::collections::HashMap;
#[cfg(test)]
use tokio::sync::RwLock;

const MAX_SLUG_LENGTH: usize = 60;

#[async_trait]
pub trait ResultStore: Send + Sync {
    async fn save(&self, config_id: &str, file_name: &str, results: &FinalResults) -> Result<(), StoreError>;

    /// `Ok(None)` when nothing was stored under that name
    async fn load(&self, config_id: &str, file_name: &str) -> Result<Option<FinalResults>, StoreError>;
}

fn leading_article_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(?:a|an|the)\s+").expect("valid article regex"))
}

fn non_alnum_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^a-z0-9]+").expect("valid slug regex"))
}

/// Filename-safe slug, truncated at a hyphen boundary
pub fn slugify(text: &str) -> String {
    let lower = text.trim().to_lowercase();
    let without_article = leading_article_re().replace(&lower, "");
    let hyphenated = non_alnum_re().replace_all(&without_article, "-");
    let slug = hyphenated.trim_matches('-');
    if slug.len() <= MAX_SLUG_LENGTH {
        return slug.to_string();
    }
    let truncated = &slug[..MAX_SLUG_LENGTH];
    match truncated.rsplit_once('-') {
        Some((head, _)) if !head.is_empty() => head.to_string(),
        _ => truncated.to_string(),
    }
}

/// `{run_label}_{timestamp}_comparison.json`
pub fn result_file_name(run_label: &str, timestamp: DateTime<Utc>) -> String {
    let slug = slugify(run_label);
    let label = if slug.is_empty() { "run" } else { slug.as_str() };
    format!("{}_{}_comparison.json", label, timestamp.format("%Y-%m-%dT%H-%M-%SZ"))
}

/// Stores each bundle as pretty JSON at `{root}/{config_id}/{file_name}`
pub struct FileResultStore {
    root: PathBuf,
}

impl FileResultStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path_for(&self, config_id: &str, file_name: &str) -> PathBuf {
        self.root.join(config_id).join(file_name)
    }

    async fn ensure_directory_exists(path: &Path) -> Result<(), StoreError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl ResultStore for FileResultStore {
    async fn save(&self, config_id: &str, file_name: &str, results: &FinalResults) -> Result<(), StoreError> {
        let json_content = serde_json::to_string_pretty(results)?;
        let path = self.path_for(config_id, file_name);
        Self::ensure_directory_exists(&path).await?;
        tokio::fs::write(&path, json_content).await?;
        info!(path = %path.display(), "Results stored");
        Ok(())
    }

    async fn load(&self, config_id: &str, file_name: &str) -> Result<Option<FinalResults>, StoreError> {
        let path = self.path_for(config_id, file_name);
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Keeps bundles in memory
#[cfg(test)]
#[derive(Default)]
pub struct InMemoryResultStore {
    results: RwLock<HashMap<(String, String), FinalResults>>,
}

#[cfg(test)]
impl InMemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn stored_keys(&self) -> Vec<(String, String)> {
        let mut keys: Vec<_> = self.results.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[cfg(test)]
#[async_trait]
impl ResultStore for InMemoryResultStore {
    async fn save(&self, config_id: &str, file_name: &str, results: &FinalResults) -> Result<(), StoreError> {
        self.results
            .write()
            .await
            .insert((config_id.to_string(), file_name.to_string()), results.clone());
        Ok(())
    }

    async fn load(&self, config_id: &str, file_name: &str) -> Result<Option<FinalResults>, StoreError> {
        Ok(self
            .results
            .read()
            .await
            .get(&(config_id.to_string(), file_name.to_string()))
            .cloned())
    }
}

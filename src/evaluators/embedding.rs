//! Semantic similarity of each response to the prompt's ideal answer.

use super::{EvaluationInput, Evaluator, PartialScores};
use crate::caller::{api_model_name, create_client};
use crate::config::ProviderConfig;
use crate::errors::StoreError;
use anyhow::{Context, Result};
use async_openai::types::CreateEmbeddingRequestArgs;
use async_openai::{Client, config::OpenAIConfig};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

pub const METHOD_NAME: &str = "embedding";

/// Text to vector, one vector per input in input order
#[async_trait]
pub trait Embedder: Send + Sync {
    fn model_id(&self) -> &str;

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

#[async_trait]
pub trait EmbeddingCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<f32>>, StoreError>;
    async fn put(&self, key: &str, embedding: &[f32]) -> Result<(), StoreError>;
}

/// Cache key: SHA-256 over the embedding model id and the text
pub fn cache_key(model_id: &str, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(model_id.as_bytes());
    hasher.update(b"|");
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Process-lifetime cache
#[derive(Default)]
pub struct InMemoryEmbeddingCache {
    entries: RwLock<HashMap<String, Vec<f32>>>,
}

impl InMemoryEmbeddingCache {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub async fn cached_count(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[async_trait]
impl EmbeddingCache for InMemoryEmbeddingCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<f32>>, StoreError> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, embedding: &[f32]) -> Result<(), StoreError> {
        self.entries
            .write()
            .await
            .insert(key.to_string(), embedding.to_vec());
        Ok(())
    }
}

/// One JSON file per key under a directory, shared across runs
pub struct FileEmbeddingCache {
    dir: PathBuf,
}

impl FileEmbeddingCache {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }
}

#[async_trait]
impl EmbeddingCache for FileEmbeddingCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<f32>>, StoreError> {
        let path = self.path_for(key);
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, key: &str, embedding: &[f32]) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let content = serde_json::to_string(embedding)?;
        tokio::fs::write(self.path_for(key), content).await?;
        Ok(())
    }
}

/// [`Embedder`] for OpenAI-compatible embedding endpoints
pub struct OpenAiEmbedder {
    client: Client<OpenAIConfig>,
    model_id: String,
}

impl OpenAiEmbedder {
    pub fn from_config(provider: &ProviderConfig) -> Result<Self> {
        let client = create_client(provider)?;
        Ok(Self::with_client(client, &provider.embedding_model))
    }

    pub fn with_client(client: Client<OpenAIConfig>, model_id: &str) -> Self {
        Self {
            client,
            model_id: model_id.to_string(),
        }
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let request = CreateEmbeddingRequestArgs::default()
            .model(api_model_name(&self.model_id))
            .input(texts.to_vec())
            .build()
            .context("Failed to build embedding request")?;

        let response = self
            .client
            .embeddings()
            .create(request)
            .await
            .with_context(|| format!("Embedding request to {} failed", self.model_id))?;

        let mut data = response.data;
        data.sort_by_key(|e| e.index);
        if data.len() != texts.len() {
            anyhow::bail!(
                "Embedding response had {} vectors for {} inputs",
                data.len(),
                texts.len()
            );
        }
        Ok(data.into_iter().map(|e| e.embedding).collect())
    }
}

/// Cosine similarity; `None` for mismatched lengths or zero vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f64> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (*x as f64, *y as f64);
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return None;
    }
    Some(dot / (norm_a.sqrt() * norm_b.sqrt()))
}

/// Scores each response by cosine similarity between its embedding and the ideal's
pub struct EmbeddingEvaluator {
    embedder: Arc<dyn Embedder>,
    cache: Arc<dyn EmbeddingCache>,
}

impl EmbeddingEvaluator {
    pub fn new(embedder: Arc<dyn Embedder>, cache: Arc<dyn EmbeddingCache>) -> Self {
        Self { embedder, cache }
    }

    /// Embeddings for `texts`, calling the embedder only for cache misses
    async fn embed_cached(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let model_id = self.embedder.model_id();
        let mut vectors: Vec<Option<Vec<f32>>> = Vec::with_capacity(texts.len());
        let mut misses: Vec<usize> = Vec::new();

        for (idx, text) in texts.iter().enumerate() {
            match self.cache.get(&cache_key(model_id, text)).await {
                Ok(Some(vector)) => vectors.push(Some(vector)),
                Ok(None) => {
                    vectors.push(None);
                    misses.push(idx);
                }
                Err(e) => {
                    debug!(error = %e, "Embedding cache read failed, treating as miss");
                    vectors.push(None);
                    misses.push(idx);
                }
            }
        }

        if !misses.is_empty() {
            let missing: Vec<String> = misses.iter().map(|&idx| texts[idx].clone()).collect();
            let fresh = self.embedder.embed(&missing).await?;
            for (idx, vector) in misses.into_iter().zip(fresh) {
                if let Err(e) = self.cache.put(&cache_key(model_id, &texts[idx]), &vector).await {
                    debug!(error = %e, "Embedding cache write failed");
                }
                vectors[idx] = Some(vector);
            }
        }

        vectors
            .into_iter()
            .map(|v| v.context("Embedder returned too few vectors"))
            .collect()
    }
}

#[async_trait]
impl Evaluator for EmbeddingEvaluator {
    fn method_name(&self) -> &str {
        METHOD_NAME
    }

    async fn evaluate(&self, input: &EvaluationInput<'_>) -> Result<PartialScores> {
        let mut partial = PartialScores::default();
        let scorable = input.scorable();

        for prompt in &input.config.prompts {
            let Some(ideal) = prompt.ideal.as_deref().filter(|i| !i.trim().is_empty()) else {
                continue;
            };
            let responses: Vec<_> = scorable.iter().filter(|r| r.prompt.id == prompt.id).collect();
            if responses.is_empty() {
                continue;
            }

            let mut texts = vec![ideal.to_string()];
            texts.extend(responses.iter().map(|r| r.text.to_string()));
            let vectors = self
                .embed_cached(&texts)
                .await
                .with_context(|| format!("Failed to embed responses for prompt {}", prompt.id))?;

            let row = partial.similarities.entry(prompt.id.clone()).or_default();
            for (response, vector) in responses.iter().zip(&vectors[1..]) {
                if let Some(similarity) = cosine_similarity(&vectors[0], vector) {
                    row.insert(response.model_id.to_string(), similarity);
                }
            }
        }

        info!(
            prompts = partial.similarities.len(),
            "Embedding similarity complete"
        );
        Ok(partial)
    }
}

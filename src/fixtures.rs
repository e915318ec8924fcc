//! Pre-recorded responses substituted for live calls, for deterministic replay.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Recorded output for one cell
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct FixtureResponse {
    /// Text for the final generated assistant turn
    #[serde(default)]
    pub final_response: Option<String>,
    /// Text per generation point, in conversation order
    #[serde(default)]
    pub turns: Vec<String>,
}

impl FixtureResponse {
    /// Text for generation point `index` of `total`, if recorded
    pub fn turn(&self, index: usize, total: usize) -> Option<&str> {
        if let Some(turn) = self.turns.get(index) {
            return Some(turn);
        }
        if index + 1 == total {
            return self.final_response.as_deref();
        }
        None
    }
}

pub trait FixtureLookup: Send + Sync {
    fn lookup(
        &self,
        prompt_id: &str,
        model_id: &str,
        effective_model_id: &str,
        run_label: &str,
    ) -> Option<FixtureResponse>;
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
enum FixtureEntry {
    Final(String),
    Detailed(FixtureResponse),
}

impl From<&FixtureEntry> for FixtureResponse {
    fn from(entry: &FixtureEntry) -> Self {
        match entry {
            FixtureEntry::Final(text) => FixtureResponse {
                final_response: Some(text.clone()),
                turns: Vec::new(),
            },
            FixtureEntry::Detailed(response) => response.clone(),
        }
    }
}

/// Fixtures loaded from a JSON file
///
/// ```json
/// { "run_labels": ["replay"],
///   "responses": { "p1": { "openai:gpt-4o": "Paris.",
///                          "openai:gpt-4o[temp:0.7]": { "turns": ["Hi", "Paris."] } } } }
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct FixtureSet {
    /// Labels the fixtures apply to; every run when empty
    #[serde(default)]
    run_labels: Vec<String>,
    /// Prompt id to model id (effective or base) to entry
    #[serde(default)]
    responses: BTreeMap<String, BTreeMap<String, FixtureEntry>>,
}

impl FixtureSet {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read fixtures file: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse fixtures file: {}", path.display()))
    }

    #[cfg(test)]
    pub fn insert(&mut self, prompt_id: &str, model_id: &str, response: FixtureResponse) {
        self.responses
            .entry(prompt_id.to_string())
            .or_default()
            .insert(model_id.to_string(), FixtureEntry::Detailed(response));
    }
}

impl FixtureLookup for FixtureSet {
    fn lookup(
        &self,
        prompt_id: &str,
        model_id: &str,
        effective_model_id: &str,
        run_label: &str,
    ) -> Option<FixtureResponse> {
        if !self.run_labels.is_empty() && !self.run_labels.iter().any(|l| l == run_label) {
            return None;
        }
        let row = self.responses.get(prompt_id)?;
        row.get(effective_model_id)
            .or_else(|| row.get(model_id))
            .map(FixtureResponse::from)
    }
}

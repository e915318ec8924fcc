use crate::aggregate::ScoreCombiner;
use crate::anonymize::SequentialScheme;
use crate::errors::PipelineError;
use crate::models::ConversationMessage;
use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::path::Path;
use tracing::warn;

/// A rubric point the coverage judge checks a response against
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(untagged)]
pub enum PointDefinition {
    /// Plain text point with weight 1
    Text(String),
    Detailed {
        text: String,
        #[serde(default = "default_point_weight")]
        weight: f64,
        /// The response should NOT exhibit this point; the judge score is inverted
        #[serde(default)]
        should_not: bool,
    },
}

impl PointDefinition {
    pub fn text(&self) -> &str {
        match self {
            Self::Text(text) => text,
            Self::Detailed { text, .. } => text,
        }
    }

    pub fn weight(&self) -> f64 {
        match self {
            Self::Text(_) => 1.0,
            Self::Detailed { weight, .. } => *weight,
        }
    }

    pub fn should_not(&self) -> bool {
        matches!(self, Self::Detailed { should_not: true, .. })
    }
}

fn default_point_weight() -> f64 {
    1.0
}

/// A single prompt of the run
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PromptConfig {
    /// Stable identifier used as the key in every result matrix
    pub id: String,
    /// Shorthand for a single user message
    #[serde(default)]
    pub prompt: Option<String>,
    /// Full conversation; assistant messages without content are generation points
    #[serde(default)]
    pub messages: Option<Vec<ConversationMessage>>,
    /// Ideal answer, compared against by the similarity evaluator
    #[serde(default)]
    pub ideal: Option<String>,
    /// Rubric for the coverage evaluator
    #[serde(default)]
    pub points: Vec<PointDefinition>,
    /// Prompt-level system prompt override
    #[serde(default)]
    pub system: Option<String>,
    /// Prompt-level temperature override
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub description: Option<String>,
}

impl PromptConfig {
    /// The conversation to walk, falling back to the single-prompt shorthand
    pub fn conversation(&self) -> Vec<ConversationMessage> {
        match (&self.messages, &self.prompt) {
            (Some(messages), _) if !messages.is_empty() => messages.clone(),
            (_, Some(prompt)) => vec![ConversationMessage::user(prompt)],
            _ => Vec::new(),
        }
    }
}

/// Immutable description of an evaluation run
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RunConfig {
    /// Config identifier; results are stored under it
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Base model ids, e.g. "openai:gpt-4o-mini"
    pub models: Vec<String>,
    pub prompts: Vec<PromptConfig>,
    /// Run-level default system prompt
    #[serde(default)]
    pub system: Option<String>,
    /// System prompt variants; each entry may be null (empty string in TOML)
    #[serde(default, deserialize_with = "deserialize_system_prompts")]
    pub system_prompts: Option<Vec<Option<String>>>,
    /// Run-level default temperature
    #[serde(default)]
    pub temperature: Option<f64>,
    /// Temperature variants
    #[serde(default)]
    pub temperatures: Option<Vec<f64>>,
    /// Maximum number of model calls in flight
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Maximum tokens for response generation
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Per-call timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Evaluators to run, in order
    #[serde(default = "default_evaluation_methods")]
    pub evaluation_methods: Vec<String>,
    /// How similarity and coverage combine into the hybrid score
    #[serde(default)]
    pub score_combiner: ScoreCombiner,
    /// Token numbering used when the run is shown to the summarizer
    #[serde(default)]
    pub anonymization: SequentialScheme,
    #[serde(default)]
    pub provider: ProviderConfig,
}

/// Connection settings for the OpenAI-compatible provider
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProviderConfig {
    /// OpenAI-compatible API endpoint
    #[serde(default = "default_api_endpoint")]
    pub api_endpoint: String,
    /// Environment variable name containing the API key
    #[serde(default = "default_env_var_api_key")]
    pub env_var_api_key: String,
    /// Rate limit for API requests per second
    #[serde(default = "default_rate_limit")]
    pub rate_limit_rps: f64,
    /// Retries inside the caller before a call counts as failed
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// First retry delay in milliseconds; doubles on each further retry
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    /// Model judging rubric coverage
    #[serde(default = "default_judge_model")]
    pub judge_model: String,
    /// Model producing response embeddings
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    /// Model writing the executive summary; no summary when unset
    #[serde(default)]
    pub summarizer_model: Option<String>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            api_endpoint: default_api_endpoint(),
            env_var_api_key: default_env_var_api_key(),
            rate_limit_rps: default_rate_limit(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            judge_model: default_judge_model(),
            embedding_model: default_embedding_model(),
            summarizer_model: None,
        }
    }
}

fn default_concurrency() -> usize {
    20
}

fn default_max_tokens() -> u32 {
    2000
}

fn default_timeout_secs() -> u64 {
    120
}

fn default_evaluation_methods() -> Vec<String> {
    vec!["embedding".to_string(), "llm-coverage".to_string()]
}

fn default_api_endpoint() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_env_var_api_key() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_rate_limit() -> f64 {
    10.0
}

fn default_max_retries() -> u32 {
    2
}

fn default_retry_base_delay_ms() -> u64 {
    2000
}

fn default_judge_model() -> String {
    "openai:gpt-4o-mini".to_string()
}

fn default_embedding_model() -> String {
    "openai:text-embedding-3-small".to_string()
}

/// TOML has no null, so an empty string stands for "no system prompt".
fn deserialize_system_prompts<'de, D>(deserializer: D) -> Result<Option<Vec<Option<String>>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<Vec<Option<String>>> = Option::deserialize(deserializer)?;
    Ok(raw.map(|variants| {
        variants
            .into_iter()
            .map(|v| v.filter(|s| !s.trim().is_empty()))
            .collect()
    }))
}

impl RunConfig {
    /// Load configuration from a TOML or JSON file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        if is_json {
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse JSON config: {}", path.display()))
        } else {
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse TOML config: {}", path.display()))
        }
    }

    /// Check the run can be addressed once finished
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.id.trim().is_empty() {
            return Err(PipelineError::MissingRunIdentity("id"));
        }
        if self.title.trim().is_empty() {
            return Err(PipelineError::MissingRunIdentity("title"));
        }
        if self.models.is_empty() {
            warn!(config_id = %self.id, "Run config lists no models");
        }
        if self.prompts.is_empty() {
            warn!(config_id = %self.id, "Run config lists no prompts");
        }
        if let Some(temps) = &self.temperatures {
            if distinct_temperatures(temps).len() < temps.len() {
                warn!(config_id = %self.id, temperatures = ?temps, "Duplicate temperatures are run once");
            }
        }
        Ok(())
    }

    /// System prompt variants as (variant index, prompt); a single implicit variant when none are declared
    pub fn system_variants(&self) -> Vec<(Option<usize>, Option<Option<String>>)> {
        match &self.system_prompts {
            Some(variants) if variants.len() > 1 => variants
                .iter()
                .enumerate()
                .map(|(idx, sys)| (Some(idx), Some(sys.clone())))
                .collect(),
            Some(variants) if variants.len() == 1 => vec![(None, Some(variants[0].clone()))],
            _ => vec![(None, None)],
        }
    }

    /// Distinct temperature variants in declared order; suffixed in the
    /// effective id only when there are several
    pub fn temperature_variants(&self) -> Vec<(bool, Option<f64>)> {
        let temps = self
            .temperatures
            .as_deref()
            .map(distinct_temperatures)
            .unwrap_or_default();
        match temps.as_slice() {
            [] => vec![(false, None)],
            [single] => vec![(false, Some(*single))],
            several => several.iter().map(|t| (true, Some(*t))).collect(),
        }
    }
}

fn distinct_temperatures(temps: &[f64]) -> Vec<f64> {
    let mut distinct: Vec<f64> = Vec::with_capacity(temps.len());
    for t in temps {
        if !distinct.contains(t) {
            distinct.push(*t);
        }
    }
    distinct
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::Builder;

    #[test]
    fn test_config_parsing() {
        let toml_content = r#"
id = "capitals"
title = "World capitals"
models = ["openai:gpt-4o-mini", "anthropic:claude-3-haiku"]
temperatures = [0.0, 0.7]
system_prompts = ["", "Answer tersely."]
concurrency = 5

[[prompts]]
id = "p1"
prompt = "What is the capital of France?"
ideal = "Paris."
points = ["Names Paris", { text = "Mentions Lyon", should_not = true, weight = 2.0 }]

[provider]
judge_model = "openai:gpt-4o"
summarizer_model = "openai:gpt-4o"
"#;

        let mut temp_file = Builder::new().suffix(".toml").tempfile().unwrap();
        write!(temp_file, "{}", toml_content).unwrap();

        let config = RunConfig::from_file(temp_file.path()).unwrap();
        assert_eq!(config.id, "capitals");
        assert_eq!(config.models.len(), 2);
        assert_eq!(config.concurrency, 5);
        assert_eq!(config.system_prompts, Some(vec![None, Some("Answer tersely.".to_string())]));
        assert_eq!(config.prompts[0].points.len(), 2);
        assert!(config.prompts[0].points[1].should_not());
        assert_eq!(config.prompts[0].points[1].weight(), 2.0);
        assert_eq!(config.provider.judge_model, "openai:gpt-4o");
        assert_eq!(config.provider.summarizer_model.as_deref(), Some("openai:gpt-4o"));
    }

    #[test]
    fn test_config_defaults() {
        let toml_content = r#"
id = "defaults"
title = "Defaults"
models = ["openai:gpt-4o-mini"]

[[prompts]]
id = "p1"
prompt = "Hi"
"#;

        let mut temp_file = Builder::new().suffix(".toml").tempfile().unwrap();
        write!(temp_file, "{}", toml_content).unwrap();

        let config = RunConfig::from_file(temp_file.path()).unwrap();
        assert_eq!(config.concurrency, 20);
        assert_eq!(config.max_tokens, 2000);
        assert_eq!(config.timeout_secs, 120);
        assert_eq!(config.evaluation_methods, vec!["embedding", "llm-coverage"]);
        assert_eq!(config.provider.rate_limit_rps, 10.0);
        assert_eq!(config.provider.env_var_api_key, "OPENAI_API_KEY");
        assert!(config.provider.summarizer_model.is_none());
        assert_eq!(config.provider.retry_base_delay_ms, 2000);
        assert_eq!(config.anonymization, SequentialScheme::default());
    }

    #[test]
    fn test_json_config_accepts_null_system_variant() {
        let json_content = r#"{
            "id": "json-run",
            "title": "JSON run",
            "models": ["openai:gpt-4o-mini"],
            "system_prompts": [null, "Be kind."],
            "prompts": [{"id": "p1", "messages": [
                {"role": "user", "content": "Hello"},
                {"role": "assistant", "content": null}
            ]}]
        }"#;

        let mut temp_file = Builder::new().suffix(".json").tempfile().unwrap();
        write!(temp_file, "{}", json_content).unwrap();

        let config = RunConfig::from_file(temp_file.path()).unwrap();
        assert_eq!(config.system_prompts, Some(vec![None, Some("Be kind.".to_string())]));
        assert_eq!(config.prompts[0].conversation().len(), 2);
        assert!(config.prompts[0].conversation()[1].content.is_none());
    }

    #[test]
    fn test_validate_requires_identity() {
        let mut config: RunConfig = toml::from_str(
            r#"
title = "No id"
models = ["openai:gpt-4o-mini"]
prompts = []
"#,
        )
        .unwrap();
        assert!(matches!(config.validate(), Err(PipelineError::MissingRunIdentity("id"))));

        config.id = "has-id".to_string();
        config.title = "  ".to_string();
        assert!(matches!(config.validate(), Err(PipelineError::MissingRunIdentity("title"))));

        config.title = "Titled".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_variant_expansion() {
        let mut config: RunConfig = toml::from_str(
            r#"
id = "v"
title = "Variants"
models = ["openai:gpt-4o-mini"]
prompts = []
"#,
        )
        .unwrap();
        assert_eq!(config.system_variants(), vec![(None, None)]);
        assert_eq!(config.temperature_variants(), vec![(false, None)]);

        config.temperatures = Some(vec![0.2]);
        assert_eq!(config.temperature_variants(), vec![(false, Some(0.2))]);

        config.temperatures = Some(vec![0.0, 1.0]);
        config.system_prompts = Some(vec![None, Some("x".to_string())]);
        assert_eq!(config.temperature_variants().len(), 2);
        assert_eq!(
            config.system_variants(),
            vec![(Some(0), Some(None)), (Some(1), Some(Some("x".to_string())))]
        );
    }

    #[test]
    fn test_duplicate_temperatures_collapse() {
        let mut config: RunConfig = toml::from_str(
            r#"
id = "v"
title = "Variants"
models = ["openai:gpt-4o-mini"]
prompts = []
temperatures = [0.5, 0.5]
"#,
        )
        .unwrap();
        assert_eq!(config.temperature_variants(), vec![(false, Some(0.5))]);
        assert!(config.validate().is_ok());

        config.temperatures = Some(vec![0.5, 0.7, 0.5]);
        assert_eq!(
            config.temperature_variants(),
            vec![(true, Some(0.5)), (true, Some(0.7))]
        );
    }

    #[test]
    fn test_anonymization_numbering_from_config() {
        let config: RunConfig = toml::from_str(
            r#"
id = "anon"
title = "Anonymized"
models = ["openai:gpt-4o-mini"]
prompts = []

[anonymization]
maker_offset = 100
temperature_offset = 900
"#,
        )
        .unwrap();
        assert_eq!(config.anonymization.maker_offset, 100);
        assert_eq!(config.anonymization.temperature_offset, 900);
        assert_eq!(config.anonymization.model_offset, 6000);
        assert_eq!(config.anonymization.system_offset, 7000);
    }
}

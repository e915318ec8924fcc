use crate::config::RunConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const ERROR_OPEN: &str = "<<error>>";
const ERROR_CLOSE: &str = "<</error>>";

/// Speaker of a conversation turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One conversation turn. An assistant turn with no content is a generation point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub role: Role,
    #[serde(default)]
    pub content: Option<String>,
}

impl ConversationMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: Some(content.into()),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: Some(content.into()),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: Some(content.into()),
        }
    }

    /// An assistant slot to be filled by generation
    pub fn generation_point() -> Self {
        Self {
            role: Role::Assistant,
            content: None,
        }
    }
}

/// A tool invocation found in an assistant turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
}

/// Outcome of one generation cell
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelResponseDetail {
    pub final_assistant_response: String,
    pub full_conversation_history: Vec<ConversationMessage>,
    pub system_prompt_used: Option<String>,
    pub temperature_used: Option<f64>,
    pub has_error: bool,
    pub error_message: Option<String>,
    /// Whether any turn came from a recorded fixture instead of a live call
    pub fixture_used: bool,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
}

/// Per-prompt response set, keyed by effective model id
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptResponseData {
    pub prompt_id: String,
    pub prompt_context: Vec<ConversationMessage>,
    pub ideal_response: Option<String>,
    pub model_responses: BTreeMap<String, ModelResponseDetail>,
}

/// Judge verdict for a single rubric point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointAssessment {
    pub key_point_text: String,
    /// 0.0 to 1.0 after inversion for should-not points
    pub coverage_extent: Option<f64>,
    pub reflection: Option<String>,
    pub weight: f64,
    pub is_inverted: bool,
}

/// Rubric coverage of one (prompt, model) response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoverageResult {
    pub avg_coverage_extent: Option<f64>,
    pub key_point_assessments: Vec<PointAssessment>,
    pub error: Option<String>,
}

impl CoverageResult {
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            avg_coverage_extent: None,
            key_point_assessments: Vec::new(),
            error: Some(error.into()),
        }
    }
}

/// Prompt id to model id to value
pub type ScoreMatrix<T> = BTreeMap<String, BTreeMap<String, T>>;

/// Merged output of every evaluator that ran
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvaluationResults {
    /// Similarity of each response to the prompt's ideal answer
    pub per_prompt_similarities: ScoreMatrix<f64>,
    pub llm_coverage_scores: ScoreMatrix<CoverageResult>,
    pub completed_methods: Vec<String>,
    pub failed_methods: Vec<String>,
}

impl EvaluationResults {
    pub fn similarity(&self, prompt_id: &str, model_id: &str) -> Option<f64> {
        self.per_prompt_similarities
            .get(prompt_id)
            .and_then(|row| row.get(model_id))
            .copied()
    }

    pub fn coverage(&self, prompt_id: &str, model_id: &str) -> Option<f64> {
        self.llm_coverage_scores
            .get(prompt_id)
            .and_then(|row| row.get(model_id))
            .and_then(|result| result.avg_coverage_extent)
    }
}

/// Mean and sample standard deviation; `None` where undefined
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelStatSummary {
    pub average: Option<f64>,
    pub stddev: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelScore {
    pub model_id: String,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptDifferentiation {
    pub prompt_id: String,
    pub stddev: f64,
}

/// Statistics calculated across the whole run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Statistics {
    pub per_model_hybrid: BTreeMap<String, ModelStatSummary>,
    pub per_model_similarity: BTreeMap<String, ModelStatSummary>,
    pub per_model_coverage: BTreeMap<String, ModelStatSummary>,
    pub overall_hybrid: ModelStatSummary,
    pub best_model: Option<ModelScore>,
    pub worst_model: Option<ModelScore>,
    pub most_differentiating_prompt: Option<PromptDifferentiation>,
}

/// Dimensional grades the summarizer assigned to one model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelGrades {
    pub model_id: String,
    /// Dimension name to score on a 0 to 10 scale
    pub grades: BTreeMap<String, f64>,
}

/// Tagged sections extracted from the summarizer's text
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StructuredInsights {
    pub key_findings: Vec<String>,
    pub strengths: Vec<String>,
    pub weaknesses: Vec<String>,
    pub patterns: Vec<String>,
    pub grades: Vec<ModelGrades>,
    pub topics: Vec<String>,
}

impl StructuredInsights {
    pub fn is_empty(&self) -> bool {
        self.key_findings.is_empty()
            && self.strengths.is_empty()
            && self.weaknesses.is_empty()
            && self.patterns.is_empty()
            && self.grades.is_empty()
            && self.topics.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutiveSummary {
    pub model_id: String,
    /// Deanonymized summarizer text
    pub content: String,
    /// `None` when no tagged sections were found; `content` is then plain prose
    pub structured: Option<StructuredInsights>,
}

/// The persisted bundle of one run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalResults {
    pub config_id: String,
    pub config_title: String,
    pub run_label: String,
    pub timestamp: DateTime<Utc>,
    pub config: RunConfig,
    pub effective_models: Vec<String>,
    pub prompt_ids: Vec<String>,
    pub prompt_contexts: BTreeMap<String, Vec<ConversationMessage>>,
    pub all_final_assistant_responses: ScoreMatrix<String>,
    pub full_conversation_histories: ScoreMatrix<Vec<ConversationMessage>>,
    /// Prompt id to model id to error message, for errored cells only
    pub errors: ScoreMatrix<String>,
    pub evaluation_results: EvaluationResults,
    pub executive_summary: Option<ExecutiveSummary>,
    pub statistics: Option<Statistics>,
}

/// Text recorded in place of a response for an errored cell
pub fn error_response_text(message: &str) -> String {
    format!("{}{}{}", ERROR_OPEN, message, ERROR_CLOSE)
}

/// Errored cells and empty payloads alike are unusable downstream
pub fn is_error_response(text: &str) -> bool {
    text.trim().is_empty() || text.contains(ERROR_OPEN)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_response_detection() {
        let text = error_response_text("timeout");
        assert_eq!(text, "<<error>>timeout<</error>>");
        assert!(is_error_response(&text));
        assert!(is_error_response(""));
        assert!(is_error_response("  \n\t"));
        assert!(!is_error_response("Paris is the capital."));
    }

    #[test]
    fn test_message_serialization() {
        let json = serde_json::to_string(&ConversationMessage::generation_point()).unwrap();
        assert_eq!(json, r#"{"role":"assistant","content":null}"#);

        let parsed: ConversationMessage = serde_json::from_str(r#"{"role":"user"}"#).unwrap();
        assert_eq!(parsed.role, Role::User);
        assert!(parsed.content.is_none());
    }

    #[test]
    fn test_structured_insights_is_empty() {
        let mut insights = StructuredInsights::default();
        assert!(insights.is_empty());
        insights.topics.push("geography".to_string());
        assert!(!insights.is_empty());
    }

    #[test]
    fn test_evaluation_results_lookup() {
        let mut results = EvaluationResults::default();
        results
            .per_prompt_similarities
            .entry("p1".to_string())
            .or_default()
            .insert("m1".to_string(), 0.9);
        results
            .llm_coverage_scores
            .entry("p1".to_string())
            .or_default()
            .insert("m1".to_string(), CoverageResult::failed("judge down"));

        assert_eq!(results.similarity("p1", "m1"), Some(0.9));
        assert_eq!(results.similarity("p1", "m2"), None);
        assert_eq!(results.coverage("p1", "m1"), None);
    }
}

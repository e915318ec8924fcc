//! Rubric coverage judged by a language model.

use super::{EvaluationInput, Evaluator, PartialScores, ScorableResponse};
use crate::caller::{CallRequest, ModelCaller};
use crate::config::PointDefinition;
use crate::models::{ConversationMessage, CoverageResult, PointAssessment, Role};
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const METHOD_NAME: &str = "llm-coverage";

const DEFAULT_JUDGE_CONCURRENCY: usize = 8;
const JUDGE_MAX_TOKENS: u32 = 2000;

const JUDGE_SYSTEM_PROMPT: &str = "You are a meticulous evaluator. You judge how fully a \
response covers each rubric point and you reply with JSON only.";

/// Scores each response against its prompt's rubric points
pub struct CoverageEvaluator {
    caller: Arc<dyn ModelCaller>,
    judge_model: String,
    concurrency: usize,
    timeout: Option<Duration>,
}

impl CoverageEvaluator {
    pub fn new(caller: Arc<dyn ModelCaller>, judge_model: impl Into<String>) -> Self {
        Self {
            caller,
            judge_model: judge_model.into(),
            concurrency: DEFAULT_JUDGE_CONCURRENCY,
            timeout: None,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }

    /// Judge one response; failures become a [`CoverageResult`] error
    async fn judge(&self, response: &ScorableResponse<'_>) -> CoverageResult {
        let points = &response.prompt.points;
        let judge_prompt = build_judge_prompt(&response.prompt.conversation(), response.text, points);

        let mut request = CallRequest::new(
            self.judge_model.clone(),
            vec![ConversationMessage::user(judge_prompt)],
        )
        .system_prompt(Some(JUDGE_SYSTEM_PROMPT.to_string()))
        .temperature(Some(0.0))
        .max_tokens(JUDGE_MAX_TOKENS);
        if let Some(timeout) = self.timeout {
            request = request.timeout(timeout);
        }

        let raw = match self.caller.call(request).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(
                    prompt_id = %response.prompt.id,
                    model = %response.model_id,
                    error = %e,
                    "Coverage judge call failed"
                );
                return CoverageResult::failed(e.to_string());
            }
        };

        match parse_json_response(&raw) {
            Ok(parsed) => build_coverage(points, &parsed),
            Err(e) => {
                debug!(prompt_id = %response.prompt.id, model = %response.model_id, raw = %raw, "Unparseable judge output");
                CoverageResult::failed(format!("{:#}", e))
            }
        }
    }

    /// Judge one response, keyed by (prompt id, model id)
    async fn judge_cell(&self, response: ScorableResponse<'_>) -> (String, String, CoverageResult) {
        let result = self.judge(&response).await;
        (response.prompt.id.clone(), response.model_id.to_string(), result)
    }
}

#[async_trait]
impl Evaluator for CoverageEvaluator {
    fn method_name(&self) -> &str {
        METHOD_NAME
    }

    async fn evaluate(&self, input: &EvaluationInput<'_>) -> Result<PartialScores> {
        let scorable: Vec<ScorableResponse<'_>> = input
            .scorable()
            .into_iter()
            .filter(|r| !r.prompt.points.is_empty())
            .collect();
        info!(responses = scorable.len(), judge = %self.judge_model, "Judging rubric coverage");

        let jobs: Vec<_> = scorable
            .into_iter()
            .map(|response| self.judge_cell(response))
            .collect();
        let judged: Vec<(String, String, CoverageResult)> = stream::iter(jobs)
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut partial = PartialScores::default();
        for (prompt_id, model_id, result) in judged {
            partial
                .coverage
                .entry(prompt_id)
                .or_default()
                .insert(model_id, result);
        }
        Ok(partial)
    }
}

fn role_label(role: Role) -> &'static str {
    match role {
        Role::System => "System",
        Role::User => "User",
        Role::Assistant => "Assistant",
    }
}

/// Judge instructions listing the conversation, the response and numbered points
fn build_judge_prompt(
    context: &[ConversationMessage],
    response: &str,
    points: &[PointDefinition],
) -> String {
    let conversation = context
        .iter()
        .filter_map(|m| m.content.as_deref().map(|c| format!("{}: {}", role_label(m.role), c)))
        .collect::<Vec<_>>()
        .join("\n");
    let numbered = points
        .iter()
        .enumerate()
        .map(|(idx, point)| format!("{}. {}", idx + 1, point.text()))
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        "Conversation:\n{}\n\nResponse to evaluate:\n{}\n\nRubric points:\n{}\n\n\
For every rubric point, rate from 0.0 to 1.0 how fully the response exhibits it. \
Return JSON of the form {{\"assessments\": [{{\"point\": 1, \"coverage_extent\": 0.0, \
\"reflection\": \"...\"}}]}} with one entry per point.",
        conversation, response, numbered
    )
}

/// Per-point assessments and their weighted mean, inverting should-not points
fn build_coverage(points: &[PointDefinition], parsed: &Value) -> CoverageResult {
    let Some(assessments) = parsed
        .get("assessments")
        .and_then(|a| a.as_array())
        .or_else(|| parsed.as_array())
    else {
        return CoverageResult::failed("judge output has no assessments array");
    };

    let mut key_point_assessments = Vec::with_capacity(points.len());
    let mut weighted_sum = 0.0;
    let mut total_weight = 0.0;

    for (idx, point) in points.iter().enumerate() {
        let entry = assessments
            .iter()
            .find(|a| a.get("point").and_then(|p| p.as_u64()) == Some(idx as u64 + 1))
            .or_else(|| assessments.get(idx));

        let raw_extent = entry
            .and_then(|a| a.get("coverage_extent").or_else(|| a.get("score")))
            .and_then(|e| e.as_f64())
            .map(|e| e.clamp(0.0, 1.0));
        let coverage_extent = raw_extent.map(|e| if point.should_not() { 1.0 - e } else { e });
        let reflection = entry
            .and_then(|a| a.get("reflection"))
            .and_then(|r| r.as_str())
            .map(str::to_string);

        let weight = point.weight().max(0.0);
        if let Some(extent) = coverage_extent {
            weighted_sum += extent * weight;
            total_weight += weight;
        }

        key_point_assessments.push(PointAssessment {
            key_point_text: point.text().to_string(),
            coverage_extent,
            reflection,
            weight,
            is_inverted: point.should_not(),
        });
    }

    let (avg_coverage_extent, error) = if total_weight > 0.0 {
        (Some(weighted_sum / total_weight), None)
    } else {
        (None, Some("judge returned no usable scores".to_string()))
    };

    CoverageResult {
        avg_coverage_extent,
        key_point_assessments,
        error,
    }
}

/// Remove a surrounding Markdown code fence, if any
fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let body = match rest.find('\n') {
        Some(newline) => &rest[newline + 1..],
        None => rest,
    };
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

/// Parse JSON from the response, handling fences and embedded JSON
fn parse_json_response(response: &str) -> Result<Value> {
    let cleaned = strip_code_fences(response);
    match serde_json::from_str(cleaned) {
        Ok(parsed) => Ok(parsed),
        Err(_) => try_extract_embedded_json(cleaned),
    }
}

/// Try to extract JSON that might be embedded in text
fn try_extract_embedded_json(response: &str) -> Result<Value> {
    match response.find('{') {
        Some(start) => match response.rfind('}') {
            Some(end) if end > start => serde_json::from_str(&response[start..=end])
                .context("Failed to parse extracted JSON"),
            _ => anyhow::bail!("Found opening brace but no closing brace in response"),
        },
        None => anyhow::bail!("No JSON found in response"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunConfig;
    use crate::errors::CallError;
    use crate::models::{ModelResponseDetail, PromptResponseData};
    use std::collections::BTreeMap;

    /// Judge that answers by looking at the response under evaluation
    struct MockJudge;

    #[async_trait]
    impl ModelCaller for MockJudge {
        async fn call(&self, request: CallRequest) -> Result<String, CallError> {
            let prompt = request.messages[0].content.clone().unwrap_or_default();
            if prompt.contains("JUDGE_DOWN") {
                return Err(CallError::provider(&request.model_id, "judge overloaded", true));
            }
            if prompt.contains("GARBLED") {
                return Ok("I cannot comply.".to_string());
            }
            Ok(r#"```json
{"assessments": [
  {"point": 1, "coverage_extent": 1.0, "reflection": "Names Paris"},
  {"point": 2, "coverage_extent": 0.25, "reflection": "Brief mention of Lyon"}
]}
```"#
                .to_string())
        }
    }

    fn detail(text: &str) -> ModelResponseDetail {
        ModelResponseDetail {
            final_assistant_response: text.to_string(),
            full_conversation_history: Vec::new(),
            system_prompt_used: None,
            temperature_used: None,
            has_error: false,
            error_message: None,
            fixture_used: false,
            tool_calls: Vec::new(),
        }
    }

    fn points() -> Vec<PointDefinition> {
        vec![
            PointDefinition::Text("Names Paris".to_string()),
            PointDefinition::Detailed {
                text: "Claims Lyon is the capital".to_string(),
                weight: 3.0,
                should_not: true,
            },
        ]
    }

    #[test]
    fn test_parse_json_response_variants() {
        let fenced = "```json\n{\"a\": 1}\n```";
        assert_eq!(parse_json_response(fenced).unwrap()["a"], 1);

        let embedded = r#"Here is the evaluation: {"a": 2} That's all."#;
        assert_eq!(parse_json_response(embedded).unwrap()["a"], 2);

        assert!(parse_json_response("invalid json content").is_err());
        assert!(parse_json_response(r#"{"a": 0.8"#).is_err());
        assert!(parse_json_response(r#"a": 0.8}}"#).is_err());
    }

    #[test]
    fn test_strip_code_fences() {
        assert_eq!(strip_code_fences("```\n[1]\n```"), "[1]");
        assert_eq!(strip_code_fences("  {\"x\": 1}  "), "{\"x\": 1}");
    }

    #[test]
    fn test_build_coverage_weights_and_inversion() {
        let parsed: Value = serde_json::json!({
            "assessments": [
                {"point": 2, "coverage_extent": 0.25},
                {"point": 1, "coverage_extent": 1.5, "reflection": "clearly"}
            ]
        });

        let result = build_coverage(&points(), &parsed);
        assert!(result.error.is_none());
        assert_eq!(result.key_point_assessments[0].coverage_extent, Some(1.0));
        assert_eq!(result.key_point_assessments[0].reflection.as_deref(), Some("clearly"));
        assert!(result.key_point_assessments[1].is_inverted);
        assert_eq!(result.key_point_assessments[1].coverage_extent, Some(0.75));

        let expected = (1.0 * 1.0 + 0.75 * 3.0) / 4.0;
        assert!((result.avg_coverage_extent.unwrap() - expected).abs() < 1e-9);
    }

    #[test]
    fn test_build_coverage_without_scores() {
        let result = build_coverage(&points(), &serde_json::json!({"assessments": []}));
        assert_eq!(result.avg_coverage_extent, None);
        assert!(result.error.is_some());
        assert_eq!(result.key_point_assessments.len(), 2);

        let result = build_coverage(&points(), &serde_json::json!({"verdict": "good"}));
        assert!(result.error.is_some());
    }

    #[tokio::test]
    async fn test_evaluate_records_per_cell_failures() {
        let mut config: RunConfig = toml::from_str(
            r#"
id = "r"
title = "Run"
models = ["a:m", "b:m", "c:m"]

[[prompts]]
id = "p1"
prompt = "Capital of France?"

[[prompts]]
id = "p2"
prompt = "No rubric"
"#,
        )
        .unwrap();
        config.prompts[0].points = points();

        let mut p1 = BTreeMap::new();
        p1.insert("a:m".to_string(), detail("Paris."));
        p1.insert("b:m".to_string(), detail("JUDGE_DOWN"));
        p1.insert("c:m".to_string(), detail("GARBLED"));
        let mut p2 = BTreeMap::new();
        p2.insert("a:m".to_string(), detail("Anything"));
        let responses = vec![
            PromptResponseData {
                prompt_id: "p1".to_string(),
                prompt_context: Vec::new(),
                ideal_response: None,
                model_responses: p1,
            },
            PromptResponseData {
                prompt_id: "p2".to_string(),
                prompt_context: Vec::new(),
                ideal_response: None,
                model_responses: p2,
            },
        ];

        let evaluator = CoverageEvaluator::new(Arc::new(MockJudge), "openai:gpt-4o-mini").with_concurrency(2);
        let partial = evaluator
            .evaluate(&EvaluationInput::new(&config, &responses))
            .await
            .unwrap();

        let row = &partial.coverage["p1"];
        let expected = (1.0 + 0.75 * 3.0) / 4.0;
        assert!((row["a:m"].avg_coverage_extent.unwrap() - expected).abs() < 1e-9);
        assert!(row["b:m"].error.as_deref().unwrap().contains("judge overloaded"));
        assert!(row["c:m"].error.is_some());
        assert!(!partial.coverage.contains_key("p2"));
    }

    /// Judge that tracks how many calls are in flight at once
    #[derive(Default)]
    struct SlowJudge {
        in_flight: std::sync::atomic::AtomicUsize,
        peak: std::sync::atomic::AtomicUsize,
        calls: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl ModelCaller for SlowJudge {
        async fn call(&self, _request: CallRequest) -> Result<String, CallError> {
            use std::sync::atomic::Ordering;
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(r#"{"assessments": [{"point": 1, "coverage_extent": 1.0}]}"#.to_string())
        }
    }

    #[tokio::test]
    async fn test_judge_calls_run_concurrently_within_limit() {
        use std::sync::atomic::Ordering;

        let mut config: RunConfig = toml::from_str(
            r#"
id = "r"
title = "Run"
models = ["a:m"]

[[prompts]]
id = "p1"
prompt = "Capital of France?"
"#,
        )
        .unwrap();
        config.prompts[0].points = vec![PointDefinition::Text("Names Paris".to_string())];

        let mut row = BTreeMap::new();
        for idx in 0..6 {
            row.insert(format!("m{}:x", idx), detail("Paris."));
        }
        let responses = vec![PromptResponseData {
            prompt_id: "p1".to_string(),
            prompt_context: Vec::new(),
            ideal_response: None,
            model_responses: row,
        }];

        let judge = Arc::new(SlowJudge::default());
        let evaluator = CoverageEvaluator::new(judge.clone(), "openai:gpt-4o-mini").with_concurrency(2);
        let partial = evaluator
            .evaluate(&EvaluationInput::new(&config, &responses))
            .await
            .unwrap();

        assert_eq!(partial.coverage["p1"].len(), 6);
        assert!(partial.coverage["p1"].values().all(|r| r.avg_coverage_extent == Some(1.0)));
        assert_eq!(judge.calls.load(Ordering::SeqCst), 6);
        assert_eq!(judge.peak.load(Ordering::SeqCst), 2);
    }
}

//! Pluggable evaluators and the orchestrator that merges their scores.

pub mod coverage;
pub mod embedding;

use crate::config::{PromptConfig, RunConfig};
use crate::model_id::IDEAL_MODEL_ID;
use crate::models::{CoverageResult, EvaluationResults, PromptResponseData, ScoreMatrix, is_error_response};
use async_trait::async_trait;
use std::collections::BTreeMap;
use tracing::{info, warn};

pub use coverage::CoverageEvaluator;
pub use embedding::EmbeddingEvaluator;

/// Frozen responses of a run, as every evaluator sees them
pub struct EvaluationInput<'a> {
    pub config: &'a RunConfig,
    pub responses: &'a [PromptResponseData],
}

/// One response worth scoring
#[derive(Debug, Clone, Copy)]
pub struct ScorableResponse<'a> {
    pub prompt: &'a PromptConfig,
    pub model_id: &'a str,
    pub text: &'a str,
}

impl<'a> EvaluationInput<'a> {
    pub fn new(config: &'a RunConfig, responses: &'a [PromptResponseData]) -> Self {
        Self { config, responses }
    }

    pub fn prompt(&self, prompt_id: &str) -> Option<&'a PromptConfig> {
        self.config.prompts.iter().find(|p| p.id == prompt_id)
    }

    /// Non-ideal responses that are neither errored nor empty
    pub fn scorable(&self) -> Vec<ScorableResponse<'a>> {
        let mut scorable = Vec::new();
        for data in self.responses {
            let Some(prompt) = self.prompt(&data.prompt_id) else {
                continue;
            };
            for (model_id, detail) in &data.model_responses {
                if model_id == IDEAL_MODEL_ID
                    || detail.has_error
                    || is_error_response(&detail.final_assistant_response)
                {
                    continue;
                }
                scorable.push(ScorableResponse {
                    prompt,
                    model_id,
                    text: &detail.final_assistant_response,
                });
            }
        }
        scorable
    }
}

/// What one evaluator adds to the run's results
#[derive(Debug, Clone, Default)]
pub struct PartialScores {
    pub similarities: ScoreMatrix<f64>,
    pub coverage: ScoreMatrix<CoverageResult>,
}

impl PartialScores {
    pub fn is_empty(&self) -> bool {
        self.similarities.is_empty() && self.coverage.is_empty()
    }
}

#[async_trait]
pub trait Evaluator: Send + Sync {
    /// Name selected by `evaluation_methods` in the run config
    fn method_name(&self) -> &str;

    async fn evaluate(&self, input: &EvaluationInput<'_>) -> anyhow::Result<PartialScores>;
}

/// Insert every cell of `from` that `into` does not have yet
fn merge_missing<T>(into: &mut ScoreMatrix<T>, from: ScoreMatrix<T>) {
    for (prompt_id, row) in from {
        let target: &mut BTreeMap<String, T> = into.entry(prompt_id).or_default();
        for (model_id, value) in row {
            target.entry(model_id).or_insert(value);
        }
    }
}

/// Runs the configured evaluators in order and merges what they produce
pub struct EvaluatorOrchestrator {
    evaluators: Vec<Box<dyn Evaluator>>,
}

impl EvaluatorOrchestrator {
    pub fn new(evaluators: Vec<Box<dyn Evaluator>>) -> Self {
        Self { evaluators }
    }

    fn find(&self, method: &str) -> Option<&dyn Evaluator> {
        self.evaluators
            .iter()
            .find(|e| e.method_name() == method)
            .map(|e| e.as_ref())
    }

    /// Evaluate with each method in `config.evaluation_methods`.
    ///
    /// A failing or unknown method contributes nothing and is listed in `failed_methods`.
    pub async fn evaluate(&self, input: &EvaluationInput<'_>) -> EvaluationResults {
        let mut results = EvaluationResults::default();

        for method in &input.config.evaluation_methods {
            let Some(evaluator) = self.find(method) else {
                warn!(method = %method, "No evaluator registered for method, skipping");
                results.failed_methods.push(method.clone());
                continue;
            };

            info!(method = %method, "Running evaluator");
            match evaluator.evaluate(input).await {
                Ok(partial) => {
                    merge_missing(&mut results.per_prompt_similarities, partial.similarities);
                    merge_missing(&mut results.llm_coverage_scores, partial.coverage);
                    results.completed_methods.push(method.clone());
                }
                Err(e) => {
                    warn!(method = %method, error = %format!("{:#}", e), "Evaluator failed, continuing without it");
                    results.failed_methods.push(method.clone());
                }
            }
        }

        results
    }
}

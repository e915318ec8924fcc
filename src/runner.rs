use crate::aggregate::build_statistics;
use crate::config::RunConfig;
use crate::evaluators::{EvaluationInput, EvaluatorOrchestrator};
use crate::generator::{ResponseGenerator, effective_model_ids};
use crate::model_id::IDEAL_MODEL_ID;
use crate::models::{ConversationMessage, FinalResults, ModelResponseDetail, PromptResponseData, ScoreMatrix};
use crate::store::{ResultStore, result_file_name};
use crate::summary::Summarizer;
use anyhow::{Context, Result};
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Main runner that drives one run config through generation, evaluation,
/// aggregation, the optional summary and storage
pub struct Runner {
    generator: ResponseGenerator,
    orchestrator: EvaluatorOrchestrator,
    summarizer: Option<Summarizer>,
    store: Option<Arc<dyn ResultStore>>,
    run_label: String,
}

impl Runner {
    pub fn new(generator: ResponseGenerator, orchestrator: EvaluatorOrchestrator) -> Self {
        Self {
            generator,
            orchestrator,
            summarizer: None,
            store: None,
            run_label: "default".to_string(),
        }
    }

    pub fn with_summarizer(mut self, summarizer: Summarizer) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn ResultStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_run_label(mut self, run_label: impl Into<String>) -> Self {
        self.run_label = run_label.into();
        self
    }

    /// Run the whole pipeline.
    ///
    /// Only a config without identity or a failed save is an error; call,
    /// evaluator and summary failures are recorded in the returned bundle.
    pub async fn run(&self, config: &RunConfig) -> Result<FinalResults> {
        config.validate()?;
        let timestamp = Utc::now();
        let effective_models = effective_model_ids(config);
        let prompt_ids: Vec<String> = config.prompts.iter().map(|p| p.id.clone()).collect();
        info!(
            config_id = %config.id,
            run_label = %self.run_label,
            models = effective_models.len(),
            prompts = prompt_ids.len(),
            "Starting run"
        );

        let responses = self.generator.generate_all(config).await;

        let evaluation = self
            .orchestrator
            .evaluate(&EvaluationInput::new(config, &responses))
            .await;

        let statistics = if evaluation.completed_methods.is_empty() {
            warn!(config_id = %config.id, "No evaluator completed; skipping statistics");
            None
        } else {
            Some(build_statistics(
                &prompt_ids,
                &effective_models,
                &evaluation,
                &config.score_combiner,
            ))
        };

        let executive_summary = match &self.summarizer {
            Some(summarizer) => {
                summarizer
                    .summarize(config, &effective_models, &responses, &evaluation, statistics.as_ref())
                    .await
            }
            None => None,
        };

        let bundle = assemble_results(&responses);
        let results = FinalResults {
            config_id: config.id.clone(),
            config_title: config.title.clone(),
            run_label: self.run_label.clone(),
            timestamp,
            config: config.clone(),
            effective_models,
            prompt_ids,
            prompt_contexts: bundle.prompt_contexts,
            all_final_assistant_responses: bundle.responses,
            full_conversation_histories: bundle.histories,
            errors: bundle.errors,
            evaluation_results: evaluation,
            executive_summary,
            statistics,
        };

        let error_count: usize = results.errors.values().map(BTreeMap::len).sum();
        info!(config_id = %config.id, errors = error_count, "Run finished");

        if let Some(store) = &self.store {
            let file_name = result_file_name(&self.run_label, timestamp);
            store
                .save(&config.id, &file_name, &results)
                .await
                .with_context(|| format!("Failed to store results for {} as {}", config.id, file_name))?;
        }

        Ok(results)
    }

    /// Write a fresh executive summary for a stored run and store it back under the same name
    pub async fn resummarize(&self, config_id: &str, file_name: &str) -> Result<FinalResults> {
        let store = self.store.as_ref().context("Re-summarizing needs a result store")?;
        let summarizer = self
            .summarizer
            .as_ref()
            .context("Re-summarizing needs a summarizer model")?;

        let mut results = store
            .load(config_id, file_name)
            .await
            .with_context(|| format!("Failed to load stored results {} / {}", config_id, file_name))?
            .with_context(|| format!("No stored results for {} named {}", config_id, file_name))?;

        info!(config_id, file_name, "Re-summarizing stored run");
        let responses = recorded_responses(&results);
        results.executive_summary = summarizer
            .summarize(
                &results.config,
                &results.effective_models,
                &responses,
                &results.evaluation_results,
                results.statistics.as_ref(),
            )
            .await;

        store
            .save(config_id, file_name, &results)
            .await
            .with_context(|| format!("Failed to store results for {} as {}", config_id, file_name))?;
        Ok(results)
    }
}

/// Per-prompt responses rebuilt from a stored bundle
fn recorded_responses(results: &FinalResults) -> Vec<PromptResponseData> {
    results
        .prompt_ids
        .iter()
        .map(|prompt_id| {
            let row = results.all_final_assistant_responses.get(prompt_id);
            let histories = results.full_conversation_histories.get(prompt_id);
            let errors = results.errors.get(prompt_id);

            let model_responses = row
                .into_iter()
                .flatten()
                .map(|(model_id, text)| {
                    let error_message = errors.and_then(|e| e.get(model_id)).cloned();
                    let detail = ModelResponseDetail {
                        final_assistant_response: text.clone(),
                        full_conversation_history: histories
                            .and_then(|h| h.get(model_id))
                            .cloned()
                            .unwrap_or_default(),
                        system_prompt_used: None,
                        temperature_used: None,
                        has_error: error_message.is_some(),
                        error_message,
                        fixture_used: false,
                        tool_calls: Vec::new(),
                    };
                    (model_id.clone(), detail)
                })
                .collect();

            PromptResponseData {
                prompt_id: prompt_id.clone(),
                prompt_context: results.prompt_contexts.get(prompt_id).cloned().unwrap_or_default(),
                ideal_response: row.and_then(|r| r.get(IDEAL_MODEL_ID)).cloned(),
                model_responses,
            }
        })
        .collect()
}

/// Response-derived parts of the persisted bundle
struct AssembledResponses {
    prompt_contexts: BTreeMap<String, Vec<ConversationMessage>>,
    responses: ScoreMatrix<String>,
    histories: ScoreMatrix<Vec<ConversationMessage>>,
    errors: ScoreMatrix<String>,
}

fn assemble_results(responses: &[PromptResponseData]) -> AssembledResponses {
    let mut assembled = AssembledResponses {
        prompt_contexts: BTreeMap::new(),
        responses: BTreeMap::new(),
        histories: BTreeMap::new(),
        errors: BTreeMap::new(),
    };

    for data in responses {
        assembled
            .prompt_contexts
            .insert(data.prompt_id.clone(), data.prompt_context.clone());
        for (model_id, detail) in &data.model_responses {
            assembled
                .responses
                .entry(data.prompt_id.clone())
                .or_default()
                .insert(model_id.clone(), detail.final_assistant_response.clone());
            assembled
                .histories
                .entry(data.prompt_id.clone())
                .or_default()
                .insert(model_id.clone(), detail.full_conversation_history.clone());
            if detail.has_error {
                let message = detail
                    .error_message
                    .clone()
                    .unwrap_or_else(|| "unknown error".to_string());
                assembled
                    .errors
                    .entry(data.prompt_id.clone())
                    .or_default()
                    .insert(model_id.clone(), message);
            }
        }
    }
    assembled
}

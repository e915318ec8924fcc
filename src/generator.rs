//! Generation of candidate responses, one cell per prompt × model × variant.

use crate::caller::{CallRequest, ModelCaller};
use crate::config::{PromptConfig, RunConfig};
use crate::errors::CallError;
use crate::fixtures::{FixtureLookup, FixtureResponse};
use crate::model_id::{IDEAL_MODEL_ID, effective_model_id};
use crate::models::{
    ConversationMessage, ModelResponseDetail, PromptResponseData, Role, ToolCall,
    error_response_text,
};
use crate::scheduler::CircuitBreakerScheduler;
use futures::future::join_all;
use regex::Regex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::{debug, info, warn};

const DEFAULT_TEMPERATURE: f64 = 0.0;

/// One (prompt, model, temperature variant, system variant) tuple
#[derive(Debug, Clone)]
pub struct GenerationCell<'a> {
    pub prompt: &'a PromptConfig,
    pub base_model_id: &'a str,
    pub effective_model_id: String,
    pub system_prompt: Option<String>,
    pub temperature: f64,
}

/// Expand a run into its generation cells, in prompt then model order
pub fn plan_cells(config: &RunConfig) -> Vec<GenerationCell<'_>> {
    let temperatures = config.temperature_variants();
    let systems = config.system_variants();
    let mut cells = Vec::new();

    for prompt in &config.prompts {
        for model in &config.models {
            for (suffixed, variant_temp) in &temperatures {
                for (sys_index, variant_sys) in &systems {
                    let temp_suffix = if *suffixed { *variant_temp } else { None };
                    let system_prompt = match variant_sys {
                        Some(variant) => variant.clone(),
                        None => prompt.system.clone().or_else(|| config.system.clone()),
                    };
                    let temperature = variant_temp
                        .or(prompt.temperature)
                        .or(config.temperature)
                        .unwrap_or(DEFAULT_TEMPERATURE);

                    cells.push(GenerationCell {
                        prompt,
                        base_model_id: model,
                        effective_model_id: effective_model_id(model, *sys_index, temp_suffix),
                        system_prompt,
                        temperature,
                    });
                }
            }
        }
    }
    cells
}

/// Effective ids of every generated model, in run order and without duplicates
pub fn effective_model_ids(config: &RunConfig) -> Vec<String> {
    let mut ids: Vec<String> = Vec::new();
    for cell in plan_cells(config) {
        if !ids.contains(&cell.effective_model_id) {
            ids.push(cell.effective_model_id);
        }
    }
    ids
}

fn is_generation_point(message: &ConversationMessage) -> bool {
    message.role == Role::Assistant && message.content.is_none()
}

fn tool_call_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)<tool_call>\s*(.*?)\s*</tool_call>").expect("valid tool call regex")
    })
}

/// Tool invocations embedded as `<tool_call>{"name": .., "arguments": ..}</tool_call>`.
///
/// Blocks that are not JSON objects with a string `name` are skipped.
pub fn extract_tool_calls(text: &str) -> Vec<ToolCall> {
    tool_call_re()
        .captures_iter(text)
        .filter_map(|caps| {
            let parsed: Value = serde_json::from_str(&caps[1]).ok()?;
            let name = parsed.get("name")?.as_str()?.to_string();
            let arguments = match parsed.get("arguments") {
                Some(Value::String(raw)) => {
                    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.clone()))
                }
                Some(value) => value.clone(),
                None => Value::Null,
            };
            Some(ToolCall { name, arguments })
        })
        .collect()
}

/// Drives every generation cell of a run through the scheduler
pub struct ResponseGenerator {
    caller: Arc<dyn ModelCaller>,
    scheduler: Arc<CircuitBreakerScheduler>,
    fixtures: Option<Arc<dyn FixtureLookup>>,
    run_label: String,
    timeout: Option<Duration>,
}

impl ResponseGenerator {
    pub fn new(caller: Arc<dyn ModelCaller>, scheduler: Arc<CircuitBreakerScheduler>) -> Self {
        Self {
            caller,
            scheduler,
            fixtures: None,
            run_label: String::new(),
            timeout: None,
        }
    }

    pub fn with_fixtures(mut self, fixtures: Arc<dyn FixtureLookup>) -> Self {
        self.fixtures = Some(fixtures);
        self
    }

    pub fn with_run_label(mut self, run_label: impl Into<String>) -> Self {
        self.run_label = run_label.into();
        self
    }

    /// Per-call timeout; a zero duration disables it
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }

    /// Generate every cell of the run. Failures are recorded per cell and never returned.
    pub async fn generate_all(&self, config: &RunConfig) -> Vec<PromptResponseData> {
        let cells = plan_cells(config);
        info!(
            cells = cells.len(),
            prompts = config.prompts.len(),
            models = config.models.len(),
            "Generating responses"
        );

        let details = join_all(cells.iter().map(|cell| self.generate_cell(config, cell))).await;

        let mut by_prompt: BTreeMap<&str, BTreeMap<String, ModelResponseDetail>> = BTreeMap::new();
        for (cell, detail) in cells.iter().zip(details) {
            by_prompt
                .entry(cell.prompt.id.as_str())
                .or_default()
                .insert(cell.effective_model_id.clone(), detail);
        }

        config
            .prompts
            .iter()
            .map(|prompt| {
                let mut model_responses = by_prompt.remove(prompt.id.as_str()).unwrap_or_default();
                if let Some(ideal) = &prompt.ideal {
                    model_responses.insert(IDEAL_MODEL_ID.to_string(), ideal_detail(prompt, ideal));
                }
                PromptResponseData {
                    prompt_id: prompt.id.clone(),
                    prompt_context: prompt.conversation(),
                    ideal_response: prompt.ideal.clone(),
                    model_responses,
                }
            })
            .collect()
    }

    /// Walk one cell's conversation, filling each generation point in turn
    async fn generate_cell(&self, config: &RunConfig, cell: &GenerationCell<'_>) -> ModelResponseDetail {
        let prompt_id = cell.prompt.id.as_str();
        let fixture = self.fixtures.as_ref().and_then(|fixtures| {
            fixtures.lookup(
                prompt_id,
                cell.base_model_id,
                &cell.effective_model_id,
                &self.run_label,
            )
        });

        let mut pending = cell.prompt.conversation();
        if pending.last().is_some_and(|m| m.role == Role::User) {
            pending.push(ConversationMessage::generation_point());
        }
        let total_points = pending.iter().filter(|m| is_generation_point(m)).count();

        let mut history: Vec<ConversationMessage> = Vec::with_capacity(pending.len());
        let mut tool_calls = Vec::new();
        let mut last_generated: Option<String> = None;
        let mut last_fixed: Option<String> = None;
        let mut fixture_used = false;
        let mut point_index = 0;

        for message in pending {
            if !is_generation_point(&message) {
                if message.role == Role::Assistant {
                    last_fixed = message.content.clone();
                }
                history.push(message);
                continue;
            }

            let text = match recorded_turn(fixture.as_ref(), point_index, total_points) {
                Some(text) => {
                    fixture_used = true;
                    text
                }
                None => match self.call_model(config, cell, &history).await {
                    Ok(text) => text,
                    Err(err) => return self.errored_detail(cell, history, fixture_used, err),
                },
            };

            point_index += 1;
            tool_calls.extend(extract_tool_calls(&text));
            history.push(ConversationMessage::assistant(text.clone()));
            last_generated = Some(text);
        }

        let Some(final_response) = last_generated.or(last_fixed) else {
            let err = CallError::EmptyResponse {
                model: cell.effective_model_id.clone(),
            };
            return self.errored_detail(cell, history, fixture_used, err);
        };

        debug!(prompt_id, model = %cell.effective_model_id, fixture_used, "Cell complete");
        ModelResponseDetail {
            final_assistant_response: final_response,
            full_conversation_history: history,
            system_prompt_used: cell.system_prompt.clone(),
            temperature_used: Some(cell.temperature),
            has_error: false,
            error_message: None,
            fixture_used,
            tool_calls,
        }
    }

    /// One live turn through the scheduler; expiry and empty payloads are failures
    async fn call_model(
        &self,
        config: &RunConfig,
        cell: &GenerationCell<'_>,
        history: &[ConversationMessage],
    ) -> Result<String, CallError> {
        let mut request = CallRequest::new(cell.base_model_id, history.to_vec())
            .system_prompt(cell.system_prompt.clone())
            .temperature(Some(cell.temperature))
            .max_tokens(config.max_tokens);
        if let Some(timeout) = self.timeout {
            request = request.timeout(timeout);
        }

        let model = cell.effective_model_id.as_str();
        self.scheduler
            .submit(model, || self.timed_call(model, request))
            .await
    }

    /// The request carries the per-attempt timeout; the outer guard allows
    /// for the caller's own retries
    async fn timed_call(&self, model: &str, request: CallRequest) -> Result<String, CallError> {
        let text = match self.timeout {
            Some(timeout) => {
                let budget = self.caller.call_budget(timeout);
                tokio::time::timeout(budget, self.caller.call(request))
                    .await
                    .map_err(|_| CallError::Timeout {
                        model: model.to_string(),
                        timeout: budget,
                    })??
            }
            None => self.caller.call(request).await?,
        };
        if text.trim().is_empty() {
            return Err(CallError::EmptyResponse {
                model: model.to_string(),
            });
        }
        Ok(text)
    }

    fn errored_detail(
        &self,
        cell: &GenerationCell<'_>,
        history: Vec<ConversationMessage>,
        fixture_used: bool,
        err: CallError,
    ) -> ModelResponseDetail {
        let message = err.to_string();
        if err.is_circuit_open() {
            debug!(prompt_id = %cell.prompt.id, model = %cell.effective_model_id, "Cell skipped by circuit breaker");
        } else {
            warn!(
                prompt_id = %cell.prompt.id,
                model = %cell.effective_model_id,
                code = err.code(),
                error = %message,
                "Generation failed"
            );
        }
        ModelResponseDetail {
            final_assistant_response: error_response_text(&message),
            full_conversation_history: history,
            system_prompt_used: cell.system_prompt.clone(),
            temperature_used: Some(cell.temperature),
            has_error: true,
            error_message: Some(message),
            fixture_used,
            tool_calls: Vec::new(),
        }
    }
}

fn recorded_turn(fixture: Option<&FixtureResponse>, index: usize, total: usize) -> Option<String> {
    fixture
        .and_then(|f| f.turn(index, total))
        .map(str::to_string)
}

/// The ideal answer, recorded alongside real responses for comparison
fn ideal_detail(prompt: &PromptConfig, ideal: &str) -> ModelResponseDetail {
    let mut history = prompt.conversation();
    history.push(ConversationMessage::assistant(ideal));
    ModelResponseDetail {
        final_assistant_response: ideal.to_string(),
        full_conversation_history: history,
        system_prompt_used: None,
        temperature_used: None,
        has_error: false,
        error_message: None,
        fixture_used: false,
        tool_calls: Vec::new(),
    }
}

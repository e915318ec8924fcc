//! Single-call access to language models.
//!
//! The pipeline only sees [`ModelCaller`]; the wire protocol stays behind it.

use crate::config::ProviderConfig;
use crate::errors::CallError;
use crate::model_id::base_model_id;
use crate::models::{ConversationMessage, Role};
use async_openai::error::OpenAIError;
use async_openai::types::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    CreateChatCompletionRequest, CreateChatCompletionRequestArgs,
};
use async_openai::{Client, config::OpenAIConfig};
use async_trait::async_trait;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, warn};

/// One model invocation
#[derive(Debug, Clone)]
pub struct CallRequest {
    pub model_id: String,
    pub messages: Vec<ConversationMessage>,
    pub system_prompt: Option<String>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    pub timeout: Option<Duration>,
}

impl CallRequest {
    pub fn new(model_id: impl Into<String>, messages: Vec<ConversationMessage>) -> Self {
        Self {
            model_id: model_id.into(),
            messages,
            system_prompt: None,
            temperature: None,
            max_tokens: None,
            timeout: None,
        }
    }

    pub fn system_prompt(mut self, system_prompt: Option<String>) -> Self {
        self.system_prompt = system_prompt;
        self
    }

    pub fn temperature(mut self, temperature: Option<f64>) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Request/response access to a model. Implementations own their retries.
#[async_trait]
pub trait ModelCaller: Send + Sync {
    async fn call(&self, request: CallRequest) -> Result<String, CallError>;

    /// Wall-clock bound for one `call` whose attempts are each limited to `per_attempt`
    fn call_budget(&self, per_attempt: Duration) -> Duration {
        per_attempt
    }
}

/// Create an OpenAI-compatible client from the provider settings
pub fn create_client(provider: &ProviderConfig) -> Result<Client<OpenAIConfig>, CallError> {
    let api_key = std::env::var(&provider.env_var_api_key).map_err(|_| {
        CallError::Config(format!(
            "Environment variable {} not found",
            provider.env_var_api_key
        ))
    })?;

    let openai_config = OpenAIConfig::new()
        .with_api_key(api_key)
        .with_api_base(&provider.api_endpoint);

    Ok(Client::with_config(openai_config))
}

/// Model name as the endpoint expects it: the base id without its provider prefix
pub fn api_model_name(model_id: &str) -> String {
    let base = base_model_id(model_id);
    match base.split_once(':') {
        Some((_, name)) => name.to_string(),
        None => base,
    }
}

/// [`ModelCaller`] for OpenAI-compatible chat completion endpoints
pub struct OpenAiCaller {
    client: Client<OpenAIConfig>,
    rate_limit_rps: f64,
    last_request: Mutex<Option<Instant>>,
    max_retries: u32,
    retry_base_delay: Duration,
}

impl OpenAiCaller {
    pub fn from_config(provider: &ProviderConfig) -> Result<Self, CallError> {
        Ok(Self::with_client(
            create_client(provider)?,
            provider.rate_limit_rps,
            provider.max_retries,
        )
        .with_retry_base_delay(Duration::from_millis(provider.retry_base_delay_ms)))
    }

    pub fn with_client(client: Client<OpenAIConfig>, rate_limit_rps: f64, max_retries: u32) -> Self {
        Self {
            client,
            rate_limit_rps,
            last_request: Mutex::new(None),
            max_retries,
            retry_base_delay: Duration::from_secs(2),
        }
    }

    pub fn with_retry_base_delay(mut self, delay: Duration) -> Self {
        self.retry_base_delay = delay;
        self
    }

    /// Enforce rate limiting for API requests
    async fn enforce_rate_limit(last_request: &mut Option<Instant>, rate_limit_rps: f64) {
        if rate_limit_rps <= 0.0 {
            return;
        }

        let min_interval = Duration::from_secs_f64(1.0 / rate_limit_rps);

        if let Some(last_time) = *last_request {
            let elapsed = last_time.elapsed();
            if elapsed < min_interval {
                sleep(min_interval - elapsed).await;
            }
        }

        *last_request = Some(Instant::now());
    }

    /// Build the chat completion request
    fn build_request(&self, request: &CallRequest) -> Result<CreateChatCompletionRequest, CallError> {
        let build_error = |e: OpenAIError| CallError::Config(format!("Failed to build request: {}", e));

        let system = request.system_prompt.clone().map(ConversationMessage::system);
        let mut messages: Vec<ChatCompletionRequestMessage> = Vec::new();
        for message in system.iter().chain(&request.messages) {
            let content = message.content.clone().unwrap_or_default();
            let built: ChatCompletionRequestMessage = match message.role {
                Role::System => ChatCompletionRequestSystemMessageArgs::default()
                    .content(content)
                    .build()
                    .map_err(build_error)?
                    .into(),
                Role::User => ChatCompletionRequestUserMessageArgs::default()
                    .content(content)
                    .build()
                    .map_err(build_error)?
                    .into(),
                Role::Assistant => ChatCompletionRequestAssistantMessageArgs::default()
                    .content(content)
                    .build()
                    .map_err(build_error)?
                    .into(),
            };
            messages.push(built);
        }

        let mut args = CreateChatCompletionRequestArgs::default();
        args.model(api_model_name(&request.model_id)).messages(messages);
        if let Some(temperature) = request.temperature {
            args.temperature(temperature as f32);
        }
        if let Some(max_tokens) = request.max_tokens {
            args.max_tokens(max_tokens.min(u16::MAX as u32) as u16);
        }
        args.build().map_err(build_error)
    }

    /// Execute one attempt, without retries
    async fn call_once(&self, request: &CallRequest) -> Result<String, CallError> {
        {
            let mut last_request = self.last_request.lock().await;
            Self::enforce_rate_limit(&mut last_request, self.rate_limit_rps).await;
        }

        let chat_request = self.build_request(request)?;
        let chat = self.client.chat();
        let pending = chat.create(chat_request);
        let response = match request.timeout {
            Some(timeout) => tokio::time::timeout(timeout, pending).await.map_err(|_| CallError::Timeout {
                model: request.model_id.clone(),
                timeout,
            })?,
            None => pending.await,
        }
        .map_err(|e| classify_openai_error(&request.model_id, e))?;

        let content = match response.choices.first() {
            Some(choice) => choice.message.content.clone().unwrap_or_default(),
            None => String::new(),
        };
        if content.trim().is_empty() {
            return Err(CallError::EmptyResponse {
                model: request.model_id.clone(),
            });
        }
        Ok(content)
    }
}

#[async_trait]
impl ModelCaller for OpenAiCaller {
    async fn call(&self, request: CallRequest) -> Result<String, CallError> {
        let mut attempt = 0;
        loop {
            match self.call_once(&request).await {
                Ok(text) => return Ok(text),
                Err(err) => {
                    if !err.is_retryable() || attempt >= self.max_retries {
                        return Err(err);
                    }
                    let delay = backoff_delay(self.retry_base_delay, attempt);
                    warn!(
                        model = %request.model_id,
                        attempt = attempt + 1,
                        max_retries = self.max_retries,
                        error = %err,
                        "Model call failed, retrying in {:?}",
                        delay
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Every attempt may run to `per_attempt`, with backoff sleeps in between
    fn call_budget(&self, per_attempt: Duration) -> Duration {
        let backoff: Duration = (0..self.max_retries)
            .map(|attempt| backoff_delay(self.retry_base_delay, attempt))
            .sum();
        per_attempt * (self.max_retries + 1) + backoff
    }
}

fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base * 2u32.pow(attempt.min(5))
}

const RETRYABLE_MARKERS: &[&str] = &["429", "500", "502", "503", "rate limit", "overloaded", "server_error"];

fn classify_openai_error(model: &str, err: OpenAIError) -> CallError {
    debug!(model, error = %err, "Provider call failed");
    let retryable = match &err {
        OpenAIError::Reqwest(e) => e.is_timeout() || e.is_connect(),
        OpenAIError::ApiError(api) => {
            let kind = api.r#type.clone().unwrap_or_default().to_lowercase();
            let message = api.message.to_lowercase();
            RETRYABLE_MARKERS
                .iter()
                .any(|marker| kind.contains(marker) || message.contains(marker))
        }
        _ => false,
    };
    CallError::provider(model, err.to_string(), retryable)
}

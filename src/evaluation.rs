use crate::config::ModelSettings;
use anyhow::{Context, Result};
use async_openai::{
    Client,
    config::OpenAIConfig,
    types::{ChatCompletionRequestMessage, CreateChatCompletionRequestArgs},
};
use clap::ValueEnum;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::sleep;

/// Models the evaluator knows how to drive
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SupportedModel {
    #[value(name = "google/gemma-3-1b-it")]
    Gemma3_1b,
    #[value(name = "google/gemma-3n-E2B-it")]
    Gemma3nE2b,
}

impl SupportedModel {
    pub fn id(self) -> &'static str {
        match self {
            SupportedModel::Gemma3_1b => "google/gemma-3-1b-it",
            SupportedModel::Gemma3nE2b => "google/gemma-3n-E2B-it",
        }
    }
}

/// Prompt-to-text capability used to answer the parser's field prompts
pub trait TextGenerator {
    async fn generate(&self, prompt: &str, system_prompt: Option<&str>) -> Result<String>;
}

/// Deterministic generator backed by an OpenAI-compatible chat completion endpoint
pub struct OpenAiGenerator {
    client: Client<OpenAIConfig>,
    model: String,
    max_tokens: u32,
    rate_limit_rps: f64,
    /// Last request time, used for pacing
    last_request: Mutex<Option<Instant>>,
}

impl OpenAiGenerator {
    /// Create a generator for the given model
    pub fn new(settings: &ModelSettings, model: &str) -> Result<Self> {
        let mut openai_config = OpenAIConfig::new().with_api_base(&settings.api_endpoint);
        if let Some(env_var) = &settings.env_var_api_key {
            let api_key = std::env::var(env_var)
                .with_context(|| format!("Environment variable {} not found", env_var))?;
            openai_config = openai_config.with_api_key(api_key);
        }

        let http_client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(settings.connect_timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client: Client::with_config(openai_config).with_http_client(http_client),
            model: model.to_string(),
            max_tokens: settings.max_tokens,
            rate_limit_rps: settings.rate_limit_rps,
            last_request: Mutex::new(None),
        })
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
                let sleep_duration = min_interval - elapsed;
                sleep(sleep_duration).await;
            }
        }

        *last_request = Some(Instant::now());
    }

    /// Build the chat completion request
    fn build_request(
        &self,
        prompt: &str,
        system_prompt: Option<&str>,
    ) -> Result<async_openai::types::CreateChatCompletionRequest> {
        let mut messages: Vec<ChatCompletionRequestMessage> = Vec::with_capacity(2);

        if let Some(system) = system_prompt.filter(|s| !s.trim().is_empty()) {
            let system_message =
                async_openai::types::ChatCompletionRequestSystemMessageArgs::default()
                    .content(system.to_string())
                    .build()
                    .context("Failed to build system message")?;
            messages.push(system_message.into());
        }

        let user_message = async_openai::types::ChatCompletionRequestUserMessageArgs::default()
            .content(prompt.to_string())
            .build()
            .context("Failed to build user message")?;
        messages.push(user_message.into());

        let max_tokens = u16::try_from(self.max_tokens)
            .with_context(|| format!("max_tokens {} exceeds {}", self.max_tokens, u16::MAX))?;

        CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(messages)
            .temperature(0.0_f32)
            .max_tokens(max_tokens)
            .build()
            .context("Failed to build chat completion request")
    }

    /// Extract the generated text from the API response
    fn extract_content(response: async_openai::types::CreateChatCompletionResponse) -> String {
        match response.choices.first() {
            Some(choice) => match &choice.message.content {
                Some(content) => content.trim().to_string(),
                None => String::new(),
            },
            None => String::new(),
        }
    }
}

impl TextGenerator for OpenAiGenerator {
    async fn generate(&self, prompt: &str, system_prompt: Option<&str>) -> Result<String> {
        {
            let mut last_request = self.last_request.lock().await;
            Self::enforce_rate_limit(&mut last_request, self.rate_limit_rps).await;
        }

        let request = self.build_request(prompt, system_prompt)?;
        let response = self
            .client
            .chat()
            .create(request)
            .await
            .context("Failed to generate response")?;

        Ok(Self::extract_content(response))
    }
}

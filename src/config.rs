use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Settings for the text-generation endpoint
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModelSettings {
    /// OpenAI-compatible API endpoint serving the selected model
    #[serde(default = "default_api_endpoint")]
    pub api_endpoint: String,
    /// Environment variable holding the API key; no key is sent when unset
    #[serde(default)]
    pub env_var_api_key: Option<String>,
    /// Maximum tokens generated per prompt
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Rate limit for generation requests per second
    #[serde(default)]
    pub rate_limit_rps: f64,
    /// Optional system instruction sent with every prompt
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Connect timeout for the HTTP client
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

/// Settings for launching the parser process
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ParserSettings {
    /// Upper bound for a single parser invocation
    #[serde(default = "default_parser_timeout")]
    pub timeout_secs: u64,
    /// Directory searched for the newest parser jar
    #[serde(default = "default_artifact_dir")]
    pub artifact_dir: PathBuf,
    /// Command used to launch the jar
    #[serde(default = "default_launch_command")]
    pub launch_command: String,
}

fn default_api_endpoint() -> String {
    "http://localhost:11434/v1".to_string()
}

fn default_max_tokens() -> u32 {
    256
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_parser_timeout() -> u64 {
    30
}

fn default_artifact_dir() -> PathBuf {
    PathBuf::from("cli/build/libs")
}

fn default_launch_command() -> String {
    "java".to_string()
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            api_endpoint: default_api_endpoint(),
            env_var_api_key: None,
            max_tokens: default_max_tokens(),
            rate_limit_rps: 0.0,
            system_prompt: None,
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

impl Default for ParserSettings {
    fn default() -> Self {
        Self {
            timeout_secs: default_parser_timeout(),
            artifact_dir: default_artifact_dir(),
            launch_command: default_launch_command(),
        }
    }
}

/// Root settings document
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Settings {
    #[serde(default)]
    pub model: ModelSettings,
    #[serde(default)]
    pub parser: ParserSettings,
}

impl Settings {
    /// Load settings from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings file: {}", path.display()))?;

        toml::from_str(&content)
            .with_context(|| format!("Failed to parse TOML settings: {}", path.display()))
    }
}

/// Context object sent to the parser with every request
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParserContext {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub allowed_expense_categories: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub allowed_income_categories: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub allowed_accounts: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub allowed_tags: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub recent_categories: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub known_accounts: Vec<String>,
    /// ISO date the parser falls back to when the utterance names none
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_date: Option<String>,
}

/// How many expense categories seed `recentCategories` when none are given
const RECENT_CATEGORY_COUNT: usize = 5;

#[derive(Debug, Deserialize)]
struct ConfigOption {
    #[serde(default)]
    label: Option<String>,
    #[serde(default = "default_active")]
    active: bool,
}

fn default_active() -> bool {
    true
}

impl ParserContext {
    /// Load the context document; a missing or malformed file yields an empty context
    pub fn load(path: &Path) -> Self {
        if !path.exists() {
            warn!("Context file {} not found, using empty context", path.display());
            return Self::default();
        }

        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) => {
                warn!("Failed to read context file {}: {}", path.display(), e);
                return Self::default();
            }
        };

        match serde_json::from_str::<Value>(&content) {
            Ok(document) => Self::from_document(&document),
            Err(e) => {
                warn!("Failed to parse context file {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    /// Build the context from a parsed configuration document
    pub fn from_document(document: &Value) -> Self {
        let allowed_expense_categories = active_labels(document.get("ExpenseCategory"));
        let allowed_income_categories = active_labels(document.get("IncomeCategory"));
        let allowed_accounts = active_labels(document.get("Account"));
        let allowed_tags = active_labels(document.get("Tag"));

        let explicit_recent: Vec<String> = document
            .get("recentCategories")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let recent_categories = if explicit_recent.is_empty() {
            allowed_expense_categories
                .iter()
                .take(RECENT_CATEGORY_COUNT)
                .cloned()
                .collect()
        } else {
            explicit_recent
        };

        Self {
            known_accounts: allowed_accounts.clone(),
            allowed_expense_categories,
            allowed_income_categories,
            allowed_accounts,
            allowed_tags,
            recent_categories,
            default_date: None,
        }
    }

    /// Per-call copy carrying the case's expected date as the default date
    pub fn for_case(&self, expected_date: Option<NaiveDate>) -> Self {
        let mut context = self.clone();
        if let Some(date) = expected_date {
            context.default_date = Some(date.format("%Y-%m-%d").to_string());
        }
        context
    }
}

fn active_labels(value: Option<&Value>) -> Vec<String> {
    let Some(entries) = value.and_then(Value::as_array) else {
        return Vec::new();
    };

    entries
        .iter()
        .filter_map(|entry| serde_json::from_value::<ConfigOption>(entry.clone()).ok())
        .filter(|option| option.active)
        .filter_map(|option| option.label)
        .map(|label| label.trim().to_string())
        .filter(|label| !label.is_empty())
        .collect()
}

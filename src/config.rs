use crate::error::ConfigError;
use crate::llm_extract::{ClientConfig, PromptStyle, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{env, fs};
use toml_edit::{DocumentMut, value};
use tracing::{debug, info};

pub const DEFAULT_CONFIG_PATH: &str = "invoice_extract.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub model: ModelSection,
    pub history: HistorySection,
    pub batch: BatchSection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmBackend {
    /// Google Generative Language API.
    Gemini,
    /// Any OpenAI-compatible `/chat/completions` endpoint.
    OpenAi,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ModelSection {
    pub backend: LlmBackend,
    pub model_name: String,
    pub base_url: String,
    /// Environment variable holding the API key.
    pub api_key_env: String,
    pub api_key: Option<String>,
    pub prompt: PromptStyle,
    /// Replaces the built-in prompt selected by `prompt`.
    pub system_instruction: Option<String>,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub max_input_chars: usize,
}

impl Default for ModelSection {
    fn default() -> Self {
        Self {
            backend: LlmBackend::Gemini,
            model_name: "models/gemini-2.5-flash-lite".to_string(),
            base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            api_key_env: "GOOGLE_API_KEY".to_string(),
            api_key: None,
            prompt: PromptStyle::Universal,
            system_instruction: None,
            timeout_secs: 60,
            max_retries: 3,
            retry_backoff_ms: 500,
            max_input_chars: 50_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HistorySection {
    pub path: PathBuf,
}

impl Default for HistorySection {
    fn default() -> Self {
        Self {
            path: PathBuf::from("invoice_history.csv"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BatchSection {
    pub input_dir: PathBuf,
    pub output_path: PathBuf,
    pub delay_ms: u64,
    pub extensions: Vec<String>,
}

impl Default for BatchSection {
    fn default() -> Self {
        Self {
            input_dir: PathBuf::from("invoices"),
            output_path: PathBuf::from("all_data.json"),
            delay_ms: 1000,
            extensions: vec!["txt".to_string()],
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(toml::from_str(&content)?)
    }

    /// Like [`Config::load`], but a missing file yields the defaults.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if path.exists() {
            info!(path = %path.display(), "Loading config");
            Self::load(path)
        } else {
            debug!(path = %path.display(), "No config file, using defaults");
            Ok(Self::default())
        }
    }

    /// Set a dotted key such as `model.model_name` in the file at `path`,
    /// creating the file if needed. Comments and layout are preserved.
    ///
    /// Values that parse as TOML (`3`, `true`, `["txt", "md"]`) are stored
    /// typed; anything else is stored as a string.
    pub fn set_value(path: impl AsRef<Path>, key: &str, raw: &str) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = if path.exists() {
            fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?
        } else {
            String::new()
        };
        let mut doc = content.parse::<DocumentMut>()?;

        let Some((section, field)) = key.split_once('.') else {
            return Err(ConfigError::InvalidValue {
                key: key.to_string(),
                reason: "expected <section>.<field>".to_string(),
            });
        };

        let item = match raw.parse::<toml_edit::Value>() {
            Ok(v) => toml_edit::Item::Value(v),
            Err(_) => value(raw),
        };
        doc[section][field] = item;

        // Reject edits that would leave the file unloadable, or that name a
        // key no section has
        let updated = doc.to_string();
        toml::from_str::<Config>(&updated).map_err(|e| ConfigError::InvalidValue {
            key: key.to_string(),
            reason: e.message().to_string(),
        })?;

        fs::write(path, updated).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })?;
        info!(path = %path.display(), key = %key, "Config updated");
        Ok(())
    }

    /// Resolve everything a model client needs. Reads `.env` first.
    pub fn client_config(&self) -> ClientConfig {
        let _ = dotenvy::dotenv();
        let api_key = env::var(&self.model.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty())
            .or_else(|| self.model.api_key.clone());

        let system_instruction = self
            .model
            .system_instruction
            .clone()
            .unwrap_or_else(|| self.model.prompt.text().to_string());

        ClientConfig {
            api_key,
            api_key_env: self.model.api_key_env.clone(),
            model_name: self.model.model_name.clone(),
            system_instruction,
            base_url: self.model.base_url.trim_end_matches('/').to_string(),
            timeout: Duration::from_secs(self.model.timeout_secs),
            max_input_chars: self.model.max_input_chars,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.model.max_retries,
            base_delay: Duration::from_millis(self.model.retry_backoff_ms),
        }
    }

    /// The config as TOML with the API key masked.
    pub fn redacted(&self) -> Result<String, ConfigError> {
        let mut shown = self.clone();
        if shown.model.api_key.is_some() {
            shown.model.api_key = Some("********".to_string());
        }
        toml::to_string_pretty(&shown).map_err(|e| ConfigError::InvalidValue {
            key: "*".to_string(),
            reason: e.to_string(),
        })
    }
}

// src/llm_extract.rs

use crate::config::LlmBackend;
use crate::error::{Error, ModelError};
use crate::invoice::Extraction;
use crate::normalize::normalize;
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Accepts input in any language and reports which one it was.
const UNIVERSAL_PROMPT: &str = r#"You are a strict data extraction engine.
1. UNIVERSAL INPUT: The input can be in ANY human language.
2. TRANSLATION: Detect language and translate relevant details to ENGLISH.
3. EXTRACTION: Extract data into Schema A.
4. IF the input is NOT an invoice: Output Schema B (Error).

Schema A (Success):
{
  "status": "success",
  "vendor": string,
  "date": "YYYY-MM-DD",
  "line_items": [{"item": string, "qty": int, "cost": float}],
  "total_amount": float,
  "original_language": string
}

Schema B (Error):
{ "status": "error", "reason": string }

Constraint: Output ONLY the raw JSON. No markdown."#;

/// English-only variant that first decides whether the input is an invoice.
const STRICT_PROMPT: &str = r#"You are a strict data extraction engine. Analyze the input text and determine if it is a valid invoice.

Decision Logic:
1. IF Valid Invoice: Extract data into Schema A. Calculate totals internally. Normalize dates to YYYY-MM-DD.
2. IF NOT Invoice: Output Schema B (Error).

Schema A (Success):
{ "status": "success", "vendor": string, "date": "YYYY-MM-DD", "line_items": [{"item": string, "qty": int, "cost": float}], "total_amount": float }

Schema B (Error):
{ "status": "error", "reason": string }

Constraint: Output ONLY the raw JSON. No markdown formatting. No conversational text."#;

const PING_PROMPT: &str = "Are you online? Answer with only 'Yes'.";

const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptStyle {
    Universal,
    Strict,
}

impl PromptStyle {
    pub fn text(self) -> &'static str {
        match self {
            PromptStyle::Universal => UNIVERSAL_PROMPT,
            PromptStyle::Strict => STRICT_PROMPT,
        }
    }
}

/// What gets sent to the model alongside the system instruction.
#[derive(Debug, Clone, PartialEq)]
pub enum Content {
    Text(String),
    Image { mime_type: String, bytes: Vec<u8> },
}

impl Content {
    pub fn describe(&self) -> String {
        match self {
            Content::Text(t) => format!("text ({} chars)", t.chars().count()),
            Content::Image { mime_type, bytes } => format!("{mime_type} image ({} bytes)", bytes.len()),
        }
    }
}

/// Everything a client needs, resolved from [`crate::config::Config`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub api_key: Option<String>,
    /// Only used to word the missing-key error.
    pub api_key_env: String,
    pub model_name: String,
    pub system_instruction: String,
    pub base_url: String,
    pub timeout: Duration,
    pub max_input_chars: usize,
}

/// A remote model that turns content into raw text.
///
/// The single seam between the pipeline and the network; tests plug in a
/// deterministic implementation.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn generate(&self, content: &Content) -> Result<String, ModelError>;
}

/// Exponential backoff for transient [`ModelError`]s.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(MAX_BACKOFF)
            .min(MAX_BACKOFF)
    }

    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T, ModelError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ModelError>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_transient() && attempt < self.max_retries => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        attempt = attempt + 1,
                        max = self.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient model error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Wraps any client with a [`RetryPolicy`].
pub struct RetryingClient<M> {
    inner: M,
    policy: RetryPolicy,
}

impl<M: ModelClient> RetryingClient<M> {
    pub fn new(inner: M, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl<M: ModelClient> ModelClient for RetryingClient<M> {
    async fn generate(&self, content: &Content) -> Result<String, ModelError> {
        self.policy.run(|| self.inner.generate(content)).await
    }
}

/// Model call plus normalization: content in, [`Extraction`] out.
pub struct Extractor<M> {
    model: M,
}

impl<M: ModelClient> Extractor<M> {
    pub fn new(model: M) -> Self {
        Self { model }
    }

    pub async fn extract(&self, content: &Content) -> Result<Extraction, Error> {
        debug!(content = %content.describe(), "Sending content to model");
        let raw = self.model.generate(content).await?;
        debug!(chars = raw.len(), "Raw model output received");

        let extraction = normalize(&raw)?;
        match &extraction {
            Extraction::Success(record) => info!(
                vendor = %record.vendor,
                date = %record.date,
                total_amount = record.total_amount,
                line_items = record.line_items.len(),
                "Invoice extracted"
            ),
            Extraction::Rejected { reason } => warn!(reason = %reason, "Model rejected input"),
        }
        Ok(extraction)
    }
}

/// The configured HTTP backend.
pub enum RemoteClient {
    Gemini(GeminiClient),
    OpenAi(OpenAiClient),
}

impl RemoteClient {
    pub fn new(backend: LlmBackend, config: ClientConfig) -> Result<Self, ModelError> {
        info!(
            backend = ?backend,
            url = %config.base_url,
            model = %config.model_name,
            "Using model backend"
        );
        Ok(match backend {
            LlmBackend::Gemini => RemoteClient::Gemini(GeminiClient::new(config)?),
            LlmBackend::OpenAi => RemoteClient::OpenAi(OpenAiClient::new(config)?),
        })
    }

    /// Send a short question without the extraction instruction.
    pub async fn ping(&self) -> Result<String, ModelError> {
        let content = Content::Text(PING_PROMPT.to_string());
        match self {
            RemoteClient::Gemini(c) => c.generate_with(None, &content).await,
            RemoteClient::OpenAi(c) => c.generate_with(None, &content).await,
        }
    }

    /// Names of the models that can be used for extraction.
    pub async fn list_models(&self) -> Result<Vec<String>, ModelError> {
        match self {
            RemoteClient::Gemini(c) => c.list_models().await,
            RemoteClient::OpenAi(c) => c.list_models().await,
        }
    }
}

#[async_trait]
impl ModelClient for RemoteClient {
    async fn generate(&self, content: &Content) -> Result<String, ModelError> {
        match self {
            RemoteClient::Gemini(c) => c.generate(content).await,
            RemoteClient::OpenAi(c) => c.generate(content).await,
        }
    }
}

fn build_http(config: &ClientConfig) -> Result<Client, ModelError> {
    Ok(Client::builder().timeout(config.timeout).build()?)
}

/// Truncate on a char boundary to stay within context limits.
fn truncate_chars(text: &str, max_chars: usize) -> &str {
    if max_chars == 0 {
        return text;
    }
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => {
            warn!(max_chars, "Input text truncated");
            &text[..idx]
        }
        None => text,
    }
}

async fn send_json<T: DeserializeOwned>(request: RequestBuilder) -> Result<T, ModelError> {
    let response = request.send().await?;

    if !response.status().is_success() {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        return Err(ModelError::Status { status, body });
    }

    Ok(response.json().await?)
}

// ---------------------------------------------------------------------------
// Gemini
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct GenerateRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiContent>,
    contents: Vec<GeminiContent>,
    #[serde(rename = "generationConfig")]
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
struct GeminiContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'static str>,
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum GeminiPart {
    Text { text: String },
    InlineData { inline_data: InlineData },
}

#[derive(Debug, Serialize)]
struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Serialize)]
struct GenerationConfig {
    temperature: f64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<CandidateContent>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    block_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ModelList {
    #[serde(default)]
    models: Vec<ModelInfo>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ModelInfo {
    name: String,
    #[serde(default)]
    supported_generation_methods: Vec<String>,
}

/// Client for the Google Generative Language REST API.
pub struct GeminiClient {
    http: Client,
    api_key: String,
    config: ClientConfig,
}

impl GeminiClient {
    pub fn new(config: ClientConfig) -> Result<Self, ModelError> {
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| ModelError::MissingApiKey(config.api_key_env.clone()))?;
        Ok(Self {
            http: build_http(&config)?,
            api_key,
            config,
        })
    }

    fn model_path(&self) -> String {
        let name = self.config.model_name.trim();
        if name.starts_with("models/") {
            name.to_string()
        } else {
            format!("models/{name}")
        }
    }

    fn build_request(&self, system: Option<&str>, content: &Content) -> GenerateRequest {
        let part = match content {
            Content::Text(text) => GeminiPart::Text {
                text: truncate_chars(text, self.config.max_input_chars).to_string(),
            },
            Content::Image { mime_type, bytes } => GeminiPart::InlineData {
                inline_data: InlineData {
                    mime_type: mime_type.clone(),
                    data: BASE64.encode(bytes),
                },
            },
        };

        GenerateRequest {
            system_instruction: system.map(|s| GeminiContent {
                role: None,
                parts: vec![GeminiPart::Text { text: s.to_string() }],
            }),
            contents: vec![GeminiContent {
                role: Some("user"),
                parts: vec![part],
            }],
            generation_config: GenerationConfig { temperature: 0.0 },
        }
    }

    async fn generate_with(&self, system: Option<&str>, content: &Content) -> Result<String, ModelError> {
        let url = format!("{}/{}:generateContent", self.config.base_url, self.model_path());
        let request = self.build_request(system, content);

        let response: GenerateResponse = send_json(
            self.http
                .post(&url)
                .header("x-goog-api-key", &self.api_key)
                .json(&request),
        )
        .await?;

        gemini_text(response)
    }

    pub async fn list_models(&self) -> Result<Vec<String>, ModelError> {
        let mut names = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut url = format!("{}/models?pageSize=100", self.config.base_url);
            if let Some(token) = &page_token {
                url.push_str(&format!("&pageToken={}", urlencoding::encode(token)));
            }

            let page: ModelList =
                send_json(self.http.get(&url).header("x-goog-api-key", &self.api_key)).await?;

            names.extend(
                page.models
                    .into_iter()
                    .filter(|m| m.supported_generation_methods.iter().any(|g| g == "generateContent"))
                    .map(|m| m.name),
            );

            match next_page_token(page_token.as_deref(), page.next_page_token) {
                Some(token) => {
                    debug!(next_token = %token, "Fetching next page of models");
                    page_token = Some(token);
                }
                None => break,
            }
        }

        info!(matches = names.len(), "Model listing complete");
        Ok(names)
    }
}

/// The token for the next page, or `None` when listing is done. A server
/// that hands back the token it was just given would otherwise loop forever.
fn next_page_token(previous: Option<&str>, next: Option<String>) -> Option<String> {
    next.filter(|t| !t.is_empty() && Some(t.as_str()) != previous)
}

#[async_trait]
impl ModelClient for GeminiClient {
    async fn generate(&self, content: &Content) -> Result<String, ModelError> {
        self.generate_with(Some(&self.config.system_instruction), content)
            .await
    }
}

/// Concatenate the text parts of the first candidate.
fn gemini_text(response: GenerateResponse) -> Result<String, ModelError> {
    if let Some(reason) = response.prompt_feedback.and_then(|f| f.block_reason) {
        return Err(ModelError::Blocked(reason));
    }

    let candidate = response
        .candidates
        .into_iter()
        .next()
        .ok_or(ModelError::EmptyResponse)?;

    let text: String = candidate
        .content
        .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
        .unwrap_or_default();

    if text.trim().is_empty() {
        let blocked = matches!(
            candidate.finish_reason.as_deref(),
            Some("SAFETY" | "PROHIBITED_CONTENT" | "BLOCKLIST")
        );
        if blocked {
            return Err(ModelError::Blocked(candidate.finish_reason.unwrap_or_default()));
        }
        return Err(ModelError::EmptyResponse);
    }
    Ok(text)
}

// ---------------------------------------------------------------------------
// OpenAI-compatible chat completions
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f64,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: MessageContent,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart {
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Serialize)]
struct ImageUrl {
    url: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiModelList {
    #[serde(default)]
    data: Vec<OpenAiModel>,
}

#[derive(Debug, Deserialize)]
struct OpenAiModel {
    id: String,
}

/// Client for any OpenAI-compatible `/chat/completions` endpoint
/// (OpenAI, Ollama, vLLM, proxies). The API key is optional.
pub struct OpenAiClient {
    http: Client,
    config: ClientConfig,
}

impl OpenAiClient {
    pub fn new(config: ClientConfig) -> Result<Self, ModelError> {
        Ok(Self {
            http: build_http(&config)?,
            config,
        })
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.config.api_key {
            Some(key) => request.header("Authorization", format!("Bearer {key}")),
            None => request,
        }
    }

    fn build_request(&self, system: Option<&str>, content: &Content) -> ChatRequest {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = system {
            messages.push(ChatMessage {
                role: "system".to_string(),
                content: MessageContent::Text(system.to_string()),
            });
        }

        let user = match content {
            Content::Text(text) => {
                MessageContent::Text(truncate_chars(text, self.config.max_input_chars).to_string())
            }
            Content::Image { mime_type, bytes } => MessageContent::Parts(vec![ContentPart::ImageUrl {
                image_url: ImageUrl {
                    url: format!("data:{mime_type};base64,{}", BASE64.encode(bytes)),
                },
            }]),
        };
        messages.push(ChatMessage {
            role: "user".to_string(),
            content: user,
        });

        ChatRequest {
            model: self.config.model_name.clone(),
            messages,
            temperature: 0.0,
        }
    }

    async fn generate_with(&self, system: Option<&str>, content: &Content) -> Result<String, ModelError> {
        let url = format!("{}/chat/completions", self.config.base_url);
        let request = self.build_request(system, content);

        let response: ChatResponse =
            send_json(self.authorize(self.http.post(&url)).json(&request)).await?;

        chat_text(response)
    }

    pub async fn list_models(&self) -> Result<Vec<String>, ModelError> {
        let url = format!("{}/models", self.config.base_url);
        let list: OpenAiModelList = send_json(self.authorize(self.http.get(&url))).await?;
        Ok(list.data.into_iter().map(|m| m.id).collect())
    }
}

#[async_trait]
impl ModelClient for OpenAiClient {
    async fn generate(&self, content: &Content) -> Result<String, ModelError> {
        self.generate_with(Some(&self.config.system_instruction), content)
            .await
    }
}

fn chat_text(response: ChatResponse) -> Result<String, ModelError> {
    response
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .filter(|c| !c.trim().is_empty())
        .ok_or(ModelError::EmptyResponse)
}

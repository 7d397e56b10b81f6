#![allow(dead_code)]
//! OpenRouter API client for generative-model calls.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::Settings;
use crate::error::ModelError;
use crate::storage::InlineMedia;

const OPENROUTER_API_URL: &str = "https://openrouter.ai/api/v1/chat/completions";
const MAX_OUTPUT_TOKENS: u32 = 16384;

/// Token counts reported by the provider. Zero when unavailable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

/// One structured-output request with an inline document.
#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub system: String,
    pub instructions: String,
    pub filename: String,
    pub media: InlineMedia,
    pub schema_name: String,
    pub schema: serde_json::Value,
}

/// Raw provider answer. `output` is `None` when the model produced nothing.
#[derive(Debug, Clone)]
pub struct ModelResponse {
    pub output: Option<String>,
    pub usage: TokenUsage,
    /// Model that actually served the call.
    pub model: String,
}

/// Generative-model collaborator.
#[async_trait]
pub trait GenerativeModel: Send + Sync {
    /// Configured model identifier.
    fn model(&self) -> &str;

    async fn invoke(&self, request: &ModelRequest) -> Result<ModelResponse, ModelError>;
}

/// OpenRouter client for chat completions.
#[derive(Clone)]
pub struct OpenRouterClient {
    client: Client,
    api_key: String,
    model: String,
}

impl OpenRouterClient {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(settings.openrouter_api_key.clone(), settings.model.clone())
    }

    fn build_request(&self, request: &ModelRequest) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: self.model.clone(),
            messages: vec![
                Message::system(request.system.clone()),
                Message::user_with_document(
                    request.instructions.clone(),
                    &request.filename,
                    &request.media,
                ),
            ],
            max_tokens: Some(MAX_OUTPUT_TOKENS),
            temperature: Some(0.0),
            response_format: Some(ResponseFormat::JsonSchema {
                json_schema: JsonSchemaFormat {
                    name: request.schema_name.clone(),
                    strict: false,
                    schema: request.schema.clone(),
                },
            }),
            usage: Some(UsageAccounting { include: true }),
        }
    }
}

#[async_trait]
impl GenerativeModel for OpenRouterClient {
    fn model(&self) -> &str {
        &self.model
    }

    async fn invoke(&self, request: &ModelRequest) -> Result<ModelResponse, ModelError> {
        let body = self.build_request(request);
        debug!(
            "Sending request to OpenRouter: model={} document={} ({} bytes)",
            body.model, request.filename, request.media.byte_len
        );

        let response = self
            .client
            .post(OPENROUTER_API_URL)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| ModelError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(provider_failure(status.as_u16(), &error_text));
        }

        let raw = response
            .text()
            .await
            .map_err(|e| ModelError::Transport(e.to_string()))?;

        let parsed = parse_completion(&raw, &self.model)?;

        info!(
            "OpenRouter response from {}: {} tokens (prompt: {}, completion: {})",
            parsed.model,
            parsed.usage.total_tokens,
            parsed.usage.input_tokens,
            parsed.usage.output_tokens
        );

        Ok(parsed)
    }
}

/// Decode a completion body. Errors embedded in a 200 response are provider errors.
fn parse_completion(raw: &str, requested_model: &str) -> Result<ModelResponse, ModelError> {
    let response: ChatCompletionResponse =
        serde_json::from_str(raw).map_err(|e| ModelError::Provider {
            status: 200,
            message: format!("unreadable completion body: {}", e),
            usage: TokenUsage::default(),
        })?;

    let usage = response.usage.map(TokenUsage::from).unwrap_or_default();

    if let Some(error) = response.error {
        return Err(ModelError::Provider {
            status: error.code.unwrap_or(200),
            message: error.message,
            usage,
        });
    }

    let output = response
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .filter(|text| !text.trim().is_empty());

    Ok(ModelResponse {
        output,
        usage,
        model: response
            .model
            .unwrap_or_else(|| requested_model.to_string()),
    })
}

/// Error for a non-2xx response, keeping the provider's message and any usage it reported.
fn provider_failure(status: u16, body: &str) -> ModelError {
    let parsed = serde_json::from_str::<ChatCompletionResponse>(body).ok();
    let usage = parsed
        .as_ref()
        .and_then(|r| r.usage.as_ref())
        .map(|u| TokenUsage::from(*u))
        .unwrap_or_default();
    let message = parsed
        .and_then(|r| r.error)
        .map(|e| e.message)
        .unwrap_or_else(|| body.to_string());

    ModelError::Provider {
        status,
        message,
        usage,
    }
}

// ============================================================================
// Request/Response types
// ============================================================================

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
    /// Ask OpenRouter to report token usage
    #[serde(skip_serializing_if = "Option::is_none")]
    usage: Option<UsageAccounting>,
}

#[derive(Debug, Serialize)]
struct UsageAccounting {
    include: bool,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ResponseFormat {
    JsonSchema { json_schema: JsonSchemaFormat },
}

#[derive(Debug, Serialize)]
struct JsonSchemaFormat {
    name: String,
    strict: bool,
    schema: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
    #[serde(default)]
    error: Option<ProviderError>,
}

#[derive(Debug, Deserialize)]
struct ProviderError {
    #[serde(default)]
    code: Option<u16>,
    message: String,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    total_tokens: u64,
}

impl From<Usage> for TokenUsage {
    fn from(u: Usage) -> Self {
        Self {
            input_tokens: u.prompt_tokens,
            output_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        }
    }
}

// ============================================================================
// Message types
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: MessageContent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
    File { file: FileData },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileData {
    pub filename: String,
    pub file_data: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: MessageContent::Text(content.into()),
        }
    }

    /// User message with instructions followed by the inline document.
    /// Images go as `image_url`, everything else (PDF, spreadsheets) as a `file` part.
    pub fn user_with_document(text: impl Into<String>, filename: &str, media: &InlineMedia) -> Self {
        let document = if media.is_image() {
            ContentPart::ImageUrl {
                image_url: ImageUrl {
                    url: media.data_url(),
                },
            }
        } else {
            ContentPart::File {
                file: FileData {
                    filename: filename.to_string(),
                    file_data: media.data_url(),
                },
            }
        };

        Self {
            role: Role::User,
            content: MessageContent::Parts(vec![ContentPart::Text { text: text.into() }, document]),
        }
    }
}

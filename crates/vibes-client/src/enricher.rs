use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use vibes_core::analysis::analysis_schema;
use vibes_core::error::AppError;
use vibes_core::traits::{EnrichRequest, Enricher};

use crate::transport_error;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_LLM_TIMEOUT: Duration = Duration::from_secs(120);
const DEFAULT_SYSTEM_PROMPT: &str = "You analyze video transcripts for a media tracker. Identify the core themes, the overall sentiment and summarize the video in one sentence. Respond ONLY with valid JSON matching the requested schema.";
/// Longest slice of item text sent to the model.
const MAX_TEXT_CHARS: usize = 12_000;

/// OpenAI-compatible LLM client producing the item analysis.
///
/// Works with any OpenAI-compatible API, including Gemini through its
/// compatibility layer (`https://generativelanguage.googleapis.com/v1beta/openai`).
#[derive(Clone)]
pub struct OpenAiEnricher {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    timeout_secs: u64,
    system_prompt: String,
}

impl OpenAiEnricher {
    pub fn new(api_key: &str, model: &str) -> Result<Self, AppError> {
        Self::with_base_url(api_key, model, DEFAULT_BASE_URL)
    }

    pub fn with_base_url(api_key: &str, model: &str, base_url: &str) -> Result<Self, AppError> {
        Self::build(api_key, model, base_url, DEFAULT_LLM_TIMEOUT)
    }

    pub fn with_timeout(self, timeout: Duration) -> Result<Self, AppError> {
        Self::build(&self.api_key, &self.model, &self.base_url, timeout)
            .map(|built| built.with_system_prompt(self.system_prompt))
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    fn build(
        api_key: &str,
        model: &str,
        base_url: &str,
        timeout: Duration,
    ) -> Result<Self, AppError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::ConfigError(format!("HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            timeout_secs: timeout.as_secs(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        })
    }

    fn chat_request(&self, request: &EnrichRequest) -> ChatRequest {
        let text: String = request.text.chars().take(MAX_TEXT_CHARS).collect();
        ChatRequest {
            model: self.model.clone(),
            messages: vec![
                Message {
                    role: "system".to_string(),
                    content: self.system_prompt.clone(),
                },
                Message {
                    role: "user".to_string(),
                    content: format!("Title: {}\n\nTranscript:\n{}", request.title, text),
                },
            ],
            response_format: Some(ResponseFormat {
                format_type: "json_schema".to_string(),
                json_schema: Some(JsonSchemaWrapper {
                    name: "video_analysis".to_string(),
                    strict: false,
                    schema: analysis_schema(),
                }),
            }),
        }
    }
}

// ---- OpenAI API types ----

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Serialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    json_schema: Option<JsonSchemaWrapper>,
}

#[derive(Serialize)]
struct JsonSchemaWrapper {
    name: String,
    strict: bool,
    schema: serde_json::Value,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ApiError {
    error: ApiErrorDetail,
}

#[derive(Deserialize)]
struct ApiErrorDetail {
    message: String,
}

/// Pull the JSON object out of a chat completion body.
fn parse_completion(body: &str) -> Result<serde_json::Value, AppError> {
    let chat_response: ChatResponse = serde_json::from_str(body)
        .map_err(|e| AppError::TransientCall(format!("Failed to parse LLM response: {e}")))?;

    let content = chat_response
        .choices
        .first()
        .and_then(|c| c.message.content.as_deref())
        .ok_or_else(|| AppError::ServiceError {
            message: "Empty response from LLM".into(),
            status_code: 200,
            retryable: true,
        })?;

    // Some models wrap the object in a fenced block despite the response format.
    let trimmed = content
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();

    serde_json::from_str(trimmed).map_err(|e| {
        AppError::SchemaValidationError(format!("LLM returned invalid JSON: {e}. Raw: {content}"))
    })
}

impl Enricher for OpenAiEnricher {
    async fn enrich(&self, request: &EnrichRequest) -> Result<serde_json::Value, AppError> {
        let url = format!("{}/chat/completions", self.base_url);

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&self.chat_request(request))
            .send()
            .await
            .map_err(|e| transport_error(e, self.timeout_secs))?;

        let status = response.status();
        if !status.is_success() {
            let status_code = status.as_u16();
            let body = response.text().await.unwrap_or_default();

            if status_code == 429 {
                return Err(AppError::RateLimitExceeded);
            }

            let message = serde_json::from_str::<ApiError>(&body)
                .map(|e| e.error.message)
                .unwrap_or_else(|_| format!("HTTP {}: {}", status_code, body));

            return Err(AppError::ServiceError {
                message,
                status_code,
                retryable: status_code >= 500,
            });
        }

        let body = response
            .text()
            .await
            .map_err(|e| AppError::TransientCall(format!("Failed to read LLM response: {e}")))?;
        let analysis = parse_completion(&body)?;
        tracing::debug!(item = %request.item_id, model = %self.model, "Item analyzed");
        Ok(analysis)
    }
}

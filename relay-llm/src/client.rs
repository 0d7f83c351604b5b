use crate::error::{LlmError, Result};
use crate::traits::CompletionBackend;
use crate::types::{
    Candidate, CompletionRequest, CompletionResponse, GenerationConfig, SafetySetting, Usage,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com";

#[derive(Clone)]
pub struct GeminiClient {
    http: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl std::fmt::Debug for GeminiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeminiClient")
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl GeminiClient {
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn new(api_key: &str, model: &str) -> Result<Self> {
        let api_key = api_key.trim();
        if api_key.is_empty() {
            return Err(LlmError::InvalidInput("gemini api key is required".to_string()));
        }
        let model = model.trim().trim_start_matches("models/");
        if model.is_empty() {
            return Err(LlmError::InvalidInput("gemini model is required".to_string()));
        }
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(%e, "reqwest client build failed; falling back to default client");
                reqwest::Client::new()
            });
        Ok(Self {
            http,
            api_key: api_key.to_string(),
            model: model.to_string(),
            base_url: DEFAULT_GEMINI_BASE_URL.to_string(),
        })
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim().trim_end_matches('/').to_string();
        self
    }

    fn generate_url(&self) -> String {
        format!(
            "{}/v1beta/models/{}:generateContent",
            self.base_url, self.model
        )
    }

    #[tracing::instrument(level = "info", skip_all, fields(model = %self.model))]
    pub async fn generate_content(&self, request: &CompletionRequest) -> Result<CompletionResponse> {
        if request.prompt.trim().is_empty() {
            return Err(LlmError::InvalidInput("prompt is empty".to_string()));
        }
        let body = GeminiRequest::from_request(request);

        let response = self
            .http
            .post(self.generate_url())
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            tracing::warn!(status = status.as_u16(), "gemini generateContent failed");
            return Err(LlmError::Api {
                status: status.as_u16(),
                detail: api_error_detail(&text),
            });
        }

        let parsed: GeminiResponse = serde_json::from_str(&text)?;
        let resp: CompletionResponse = parsed.into();
        tracing::debug!(
            candidates = resp.candidates.len(),
            prompt_block_reason = ?resp.prompt_block_reason,
            prompt_tokens = resp.usage.prompt_tokens,
            completion_tokens = resp.usage.completion_tokens,
            "gemini generateContent completed"
        );
        Ok(resp)
    }
}

#[async_trait::async_trait]
impl CompletionBackend for GeminiClient {
    fn model(&self) -> &str {
        &self.model
    }

    async fn generate(&self, request: &CompletionRequest) -> Result<CompletionResponse> {
        self.generate_content(request).await
    }
}

/// Pull `error.message` and `error.status` out of a Google API error body, keeping
/// the raw body when it is not the usual envelope.
fn api_error_detail(body: &str) -> String {
    match serde_json::from_str::<GeminiErrorEnvelope>(body) {
        Ok(envelope) => match envelope.error.status {
            Some(status) if !status.is_empty() => {
                format!("{} ({status})", envelope.error.message)
            }
            _ => envelope.error.message,
        },
        Err(_) => body.trim().to_string(),
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    safety_settings: Vec<SafetySetting>,
}

impl GeminiRequest {
    fn from_request(request: &CompletionRequest) -> Self {
        Self {
            contents: vec![GeminiContent {
                role: Some("user".to_string()),
                parts: vec![GeminiPart {
                    text: Some(request.prompt.clone()),
                }],
            }],
            generation_config: request.generation_config,
            safety_settings: request.safety_settings.clone(),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct GeminiContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct GeminiPart {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    #[serde(default)]
    prompt_feedback: Option<GeminiPromptFeedback>,
    #[serde(default)]
    usage_metadata: Option<GeminiUsage>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiCandidate {
    #[serde(default)]
    content: Option<GeminiContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiPromptFeedback {
    #[serde(default)]
    block_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiUsage {
    #[serde(default)]
    prompt_token_count: Option<u64>,
    #[serde(default)]
    candidates_token_count: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct GeminiErrorEnvelope {
    error: GeminiErrorBody,
}

#[derive(Debug, Deserialize)]
struct GeminiErrorBody {
    #[serde(default)]
    message: String,
    #[serde(default)]
    status: Option<String>,
}

impl From<GeminiResponse> for CompletionResponse {
    fn from(value: GeminiResponse) -> Self {
        let candidates = value
            .candidates
            .into_iter()
            .map(|c| {
                let text: String = c
                    .content
                    .map(|content| {
                        content
                            .parts
                            .into_iter()
                            .filter_map(|p| p.text)
                            .collect::<Vec<_>>()
                            .join("")
                    })
                    .unwrap_or_default();
                Candidate {
                    text: Some(text).filter(|t| !t.is_empty()),
                    finish_reason: c.finish_reason,
                }
            })
            .collect();
        let usage = value
            .usage_metadata
            .map(|u| Usage {
                prompt_tokens: u.prompt_token_count.unwrap_or(0) as u32,
                completion_tokens: u.candidates_token_count.unwrap_or(0) as u32,
            })
            .unwrap_or_default();
        Self {
            candidates,
            prompt_block_reason: value.prompt_feedback.and_then(|f| f.block_reason),
            usage,
        }
    }
}

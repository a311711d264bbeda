//! Transport to the external reasoning service (OpenAI-compatible chat
//! completions). One call per `complete`; retries live in the client.

use async_trait::async_trait;
use mender_adapters::config::{ReasoningSettings, Secret};
use mender_adapters::util::sanitize_error_body;
use mender_core::{parse_retry_after, DiagnosisReason, RetryDecision};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Everything sent to the service for one diagnosis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReasoningRequest {
    pub system: String,
    pub user: String,
    pub max_tokens: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServiceError {
    #[error("reasoning service unreachable: {0}")]
    Network(String),
    #[error("reasoning service timed out")]
    Timeout,
    #[error("reasoning service rate limited the request: {detail}")]
    RateLimited {
        retry_after: Option<Duration>,
        detail: String,
    },
    #[error("reasoning service quota exhausted: {0}")]
    QuotaExceeded(String),
    #[error("reasoning service rejected the credential: {0}")]
    Unauthorized(String),
    #[error("reasoning service error ({status}): {detail}")]
    Server { status: u16, detail: String },
    #[error("reasoning service refused the request ({status}): {detail}")]
    Rejected { status: u16, detail: String },
    #[error("unusable response: {0}")]
    Malformed(String),
}

impl ServiceError {
    pub fn retry_decision(&self) -> RetryDecision {
        match self {
            ServiceError::Network(_)
            | ServiceError::Timeout
            | ServiceError::Server { .. }
            | ServiceError::Malformed(_) => RetryDecision::Retry,
            ServiceError::RateLimited {
                retry_after: Some(delay),
                ..
            } => RetryDecision::RetryAfter(*delay),
            ServiceError::RateLimited { .. } => RetryDecision::Retry,
            ServiceError::QuotaExceeded(_)
            | ServiceError::Unauthorized(_)
            | ServiceError::Rejected { .. } => RetryDecision::Fatal,
        }
    }

    /// The reason reported once this error ends diagnosis.
    pub fn reason(&self) -> DiagnosisReason {
        match self {
            ServiceError::Network(_)
            | ServiceError::Timeout
            | ServiceError::RateLimited { .. }
            | ServiceError::Server { .. } => DiagnosisReason::Transient,
            ServiceError::Malformed(_) | ServiceError::Rejected { .. } => {
                DiagnosisReason::Malformed
            }
            ServiceError::Unauthorized(_) => DiagnosisReason::Authentication,
            ServiceError::QuotaExceeded(_) => DiagnosisReason::QuotaExceeded,
        }
    }
}

#[async_trait]
pub trait ReasoningService: Send + Sync {
    /// Return the raw text content of the service's answer.
    async fn complete(&self, request: &ReasoningRequest) -> Result<String, ServiceError>;
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<Message<'a>>,
    max_tokens: u32,
    temperature: f32,
    response_format: ResponseFormat,
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: &'static str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
    refusal: Option<String>,
}

#[derive(Deserialize)]
struct ApiErrorEnvelope {
    error: ApiError,
}

#[derive(Deserialize)]
struct ApiError {
    #[serde(default)]
    message: String,
    #[serde(default, rename = "type")]
    error_type: Option<String>,
    #[serde(default)]
    code: Option<serde_json::Value>,
}

impl ApiError {
    fn is_quota(&self) -> bool {
        let code = self
            .code
            .as_ref()
            .and_then(|c| c.as_str())
            .unwrap_or_default();
        let kind = self.error_type.as_deref().unwrap_or_default();
        [code, kind]
            .iter()
            .any(|v| matches!(*v, "insufficient_quota" | "billing_hard_limit_reached"))
    }
}

/// Map a non-success HTTP status (and its body) to a service error.
fn classify_status(status: u16, retry_after: Option<&str>, body: &str) -> ServiceError {
    let api_error = serde_json::from_str::<ApiErrorEnvelope>(body).ok().map(|e| e.error);
    let detail = api_error
        .as_ref()
        .map(|e| sanitize_error_body(&e.message))
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| sanitize_error_body(body));

    if api_error.as_ref().is_some_and(ApiError::is_quota) {
        return ServiceError::QuotaExceeded(detail);
    }
    match status {
        401 | 403 => ServiceError::Unauthorized(detail),
        408 => ServiceError::Timeout,
        429 => ServiceError::RateLimited {
            retry_after: parse_retry_after(retry_after, body),
            detail,
        },
        500..=599 => ServiceError::Server { status, detail },
        _ => ServiceError::Rejected { status, detail },
    }
}

fn map_transport_error(err: reqwest::Error) -> ServiceError {
    if err.is_timeout() {
        ServiceError::Timeout
    } else {
        ServiceError::Network(err.without_url().to_string())
    }
}

/// `POST {api_url}` with a bearer credential and a JSON-object response format.
pub struct ChatCompletionsService {
    http: reqwest::Client,
    api_url: String,
    api_key: Secret,
    model: String,
}

impl ChatCompletionsService {
    pub fn new(settings: &ReasoningSettings) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(settings.request_timeout)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {}", e))?;
        Ok(Self {
            http,
            api_url: settings.api_url.clone(),
            api_key: settings.api_key.clone(),
            model: settings.model.clone(),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl ReasoningService for ChatCompletionsService {
    async fn complete(&self, request: &ReasoningRequest) -> Result<String, ServiceError> {
        let body = ChatRequest {
            model: &self.model,
            messages: vec![
                Message {
                    role: "system",
                    content: &request.system,
                },
                Message {
                    role: "user",
                    content: &request.user,
                },
            ],
            max_tokens: request.max_tokens,
            temperature: 0.0,
            response_format: ResponseFormat {
                format_type: "json_object",
            },
        };

        let response = self
            .http
            .post(&self.api_url)
            .header("Content-Type", "application/json")
            .header("Authorization", format!("Bearer {}", self.api_key.expose()))
            .json(&body)
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let text = response.text().await.map_err(map_transport_error)?;

        if !status.is_success() {
            return Err(classify_status(
                status.as_u16(),
                retry_after.as_deref(),
                &text,
            ));
        }

        // Some gateways answer 200 with an error envelope.
        if let Ok(envelope) = serde_json::from_str::<ApiErrorEnvelope>(&text) {
            if envelope.error.is_quota() {
                return Err(ServiceError::QuotaExceeded(sanitize_error_body(
                    &envelope.error.message,
                )));
            }
            return Err(ServiceError::Server {
                status: status.as_u16(),
                detail: sanitize_error_body(&envelope.error.message),
            });
        }

        let parsed: ChatResponse = serde_json::from_str(&text).map_err(|e| {
            ServiceError::Malformed(format!(
                "invalid response envelope: {} ({})",
                e,
                sanitize_error_body(&text)
            ))
        })?;
        let Some(choice) = parsed.choices.into_iter().next() else {
            return Err(ServiceError::Malformed("response has no choices".to_string()));
        };
        if let Some(refusal) = choice.message.refusal.filter(|r| !r.trim().is_empty()) {
            return Err(ServiceError::Malformed(format!(
                "request was refused: {}",
                sanitize_error_body(&refusal)
            )));
        }
        let content = choice.message.content.unwrap_or_default();
        if content.trim().is_empty() {
            return Err(ServiceError::Malformed("empty response".to_string()));
        }
        Ok(content)
    }
}

use crate::constants::*;
use crate::settings::TranslationSettings;
use crate::specs::openai::{ChatCompletion, ChatMessage, ChatRequest, ModelListResponse};
use crate::streaming::{CompletionSource, CompletionStream, StreamResult};
use crate::types::{LyricistError, Result};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use reqwest::{StatusCode, Url};
use std::time::Duration;

/// Validates the configured endpoint and returns it with exactly one trailing slash,
/// so that relative paths such as `chat/completions` join beneath it.
pub fn endpoint_base(endpoint: &str) -> Result<Url> {
    let trimmed = endpoint.trim();
    if trimmed.is_empty() {
        return Err(LyricistError::Transport(INVALID_ENDPOINT_URL_MESSAGE.to_string()).into());
    }
    let with_slash = if trimmed.ends_with('/') {
        trimmed.to_string()
    } else {
        format!("{}/", trimmed)
    };
    match Url::parse(&with_slash) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => Ok(url),
        _ => Err(LyricistError::Transport(INVALID_ENDPOINT_URL_MESSAGE.to_string()).into()),
    }
}

fn join(base: &Url, path: &str) -> Result<Url> {
    match base.join(path) {
        Ok(url) => Ok(url),
        Err(_) => Err(LyricistError::Transport(INVALID_ENDPOINT_URL_MESSAGE.to_string()).into()),
    }
}

/// Maps a non-success completion response to the error surfaced to the user.
pub fn classify_status(status: StatusCode, body: String) -> LyricistError {
    match status {
        StatusCode::NOT_FOUND | StatusCode::METHOD_NOT_ALLOWED => {
            let body = body.trim();
            if body.is_empty() {
                LyricistError::Transport(ENDPOINT_UNAVAILABLE_MESSAGE.to_string())
            } else {
                LyricistError::Transport(format!("{}\n{}", ENDPOINT_UNAVAILABLE_MESSAGE, body))
            }
        }
        StatusCode::TOO_MANY_REQUESTS if body.contains("insufficient_quota") => {
            LyricistError::Quota(QUOTA_EXCEEDED_MESSAGE.to_string())
        }
        _ => LyricistError::Upstream(status, body),
    }
}

pub fn build_chat_request(prompt: &str, settings: &TranslationSettings) -> ChatRequest {
    ChatRequest {
        model: settings.model.clone(),
        messages: vec![ChatMessage::user(prompt)],
        stream: Some(true),
        temperature: settings.temperature,
        top_p: settings.top_p,
        presence_penalty: Some(0.0),
        max_tokens: None,
    }
}

fn is_event_stream(response: &reqwest::Response) -> bool {
    match response.headers().get(reqwest::header::CONTENT_TYPE) {
        Some(value) => match value.to_str() {
            Ok(v) => v.trim().to_ascii_lowercase().starts_with(EVENT_STREAM_CONTENT_TYPE),
            Err(_) => false,
        },
        None => false,
    }
}

/// Outcome of a settings-page connection check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    Ok,
    Failed(String),
}

impl ConnectionStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, ConnectionStatus::Ok)
    }
}

/// The `error` (or top-level `message`) a JSON body carries, if any.
fn body_error_detail(body: &str) -> Option<String> {
    let value = serde_json::from_str::<serde_json::Value>(body).ok()?;
    let detail = match value.get("error") {
        Some(serde_json::Value::Object(e)) => match e.get("message") {
            Some(m) => m.clone(),
            None => serde_json::Value::Object(e.clone()),
        },
        Some(other) => other.clone(),
        None => value.get("message")?.clone(),
    };
    match detail {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) => Some(s),
        other => Some(other.to_string()),
    }
}

fn connection_failure_for(status: StatusCode) -> String {
    match status {
        StatusCode::UNAUTHORIZED => "API key is invalid or expired".to_string(),
        StatusCode::NOT_FOUND | StatusCode::METHOD_NOT_ALLOWED => {
            "API endpoint does not exist or the service is unavailable".to_string()
        }
        StatusCode::TOO_MANY_REQUESTS => "API rate limit reached".to_string(),
        _ => format!("API connection failed ({})", status),
    }
}

/// Chat-completions client for any OpenAI-compatible endpoint.
#[derive(Clone)]
pub struct OpenAiClient {
    http: reqwest::Client,
}

impl OpenAiClient {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }

    pub fn with_timeouts(connect: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(connect)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Some(Duration::from_secs(60)))
            .build()?;
        Ok(Self::new(http))
    }

    fn authorize(&self, req: reqwest::RequestBuilder, api_key: &str) -> reqwest::RequestBuilder {
        if api_key.trim().is_empty() {
            req
        } else {
            req.header("Authorization", format!("Bearer {}", api_key.trim()))
        }
    }

    pub async fn send_chat(
        &self,
        prompt: &str,
        settings: &TranslationSettings,
    ) -> Result<StreamResult> {
        let url = join(&endpoint_base(&settings.api_endpoint)?, CHAT_COMPLETIONS_PATH)?;
        let body = build_chat_request(prompt, settings);
        tracing::info!(
            "Requesting translation from {} with model {} ({} prompt chars)",
            url,
            settings.model,
            prompt.chars().count()
        );

        let request = self.authorize(self.http.post(url).json(&body), &settings.api_key);
        let response = request.send().await?;
        let status = response.status();

        if !status.is_success() {
            let text = match response.text().await {
                Ok(t) => t,
                Err(e) => format!("<unreadable body: {}>", e),
            };
            tracing::warn!(
                "Completion request failed with {}: {}",
                status,
                crate::str_utils::snippet(&text, 300)
            );
            return Err(classify_status(status, text).into());
        }

        if is_event_stream(&response) {
            Ok(StreamResult::Stream(CompletionStream::from_response(response)))
        } else {
            tracing::debug!("Response is not an event stream, decoding full body");
            let text = response.text().await?;
            match serde_json::from_str::<ChatCompletion>(&text) {
                Ok(completion) => Ok(StreamResult::NonStream(completion)),
                Err(e) => Err(LyricistError::Decode(format!(
                    "unexpected completion body ({}): {}",
                    e,
                    crate::str_utils::snippet(&text, 200)
                ))
                .into()),
            }
        }
    }

    /// Models offered by the endpoint, sorted. Any failure yields an empty list.
    pub async fn list_models(&self, endpoint: &str, api_key: &str) -> Vec<String> {
        let url = match endpoint_base(endpoint).and_then(|base| join(&base, MODELS_PATH)) {
            Ok(u) => u,
            Err(_) => return Vec::new(),
        };
        let response = match self.authorize(self.http.get(url), api_key).send().await {
            Ok(r) => r,
            Err(e) => {
                tracing::debug!("Model list request failed: {}", e);
                return Vec::new();
            }
        };
        if !response.status().is_success() {
            tracing::debug!("Model list request returned {}", response.status());
            return Vec::new();
        }
        match response.json::<ModelListResponse>().await {
            Ok(list) => list.into_sorted_ids(),
            Err(e) => {
                tracing::debug!("Unrecognized model list body: {}", e);
                Vec::new()
            }
        }
    }

    /// Checks the endpoint with a model listing, falling back to a one-token completion.
    pub async fn test_connection(&self, endpoint: &str, api_key: &str, model: &str) -> ConnectionStatus {
        if endpoint.trim().is_empty() {
            return ConnectionStatus::Failed("API endpoint must not be empty".to_string());
        }
        let url = match endpoint_base(endpoint).and_then(|base| join(&base, CHAT_COMPLETIONS_PATH)) {
            Ok(u) => u,
            Err(_) => return ConnectionStatus::Failed(INVALID_ENDPOINT_URL_MESSAGE.to_string()),
        };
        if model.trim().is_empty() {
            return ConnectionStatus::Failed("Model name is not set".to_string());
        }

        if let Ok(models_url) = endpoint_base(endpoint).and_then(|base| join(&base, MODELS_PATH)) {
            match self.authorize(self.http.get(models_url), api_key).send().await {
                Ok(r) if r.status().is_success() => {
                    tracing::info!("Connection test against {} succeeded", endpoint.trim());
                    return ConnectionStatus::Ok;
                }
                Ok(r) => tracing::debug!("Model list answered {}, probing completions", r.status()),
                Err(e) => tracing::debug!("Model list unreachable ({}), probing completions", e),
            }
        }

        let body = ChatRequest {
            model: model.trim().to_string(),
            messages: vec![ChatMessage::user("Hi")],
            stream: Some(false),
            temperature: None,
            top_p: None,
            presence_penalty: None,
            max_tokens: Some(1),
        };

        let response = match self.authorize(self.http.post(url).json(&body), api_key).send().await {
            Ok(r) => r,
            Err(e) if e.is_connect() || e.is_timeout() => {
                return ConnectionStatus::Failed(
                    "Network connection failed, check the API endpoint and your network".to_string(),
                )
            }
            Err(e) => return ConnectionStatus::Failed(format!("Connection test failed: {}", e)),
        };

        let status = response.status();
        if !status.is_success() {
            tracing::debug!("Completion probe answered {}", status);
            return ConnectionStatus::Failed(connection_failure_for(status));
        }
        // Some gateways answer 200 with an error body.
        let text = match response.text().await {
            Ok(t) => t,
            Err(_) => String::new(),
        };
        if let Some(detail) = body_error_detail(&text) {
            tracing::warn!("Connection test against {} failed: {}", endpoint.trim(), detail);
            return ConnectionStatus::Failed(detail);
        }
        tracing::info!("Connection test against {} succeeded", endpoint.trim());
        ConnectionStatus::Ok
    }
}

impl CompletionSource for OpenAiClient {
    fn stream_completion<'a>(
        &'a self,
        prompt: &'a str,
        settings: &'a TranslationSettings,
    ) -> BoxFuture<'a, Result<StreamResult>> {
        self.send_chat(prompt, settings).boxed()
    }
}

use async_trait::async_trait;
use reqwest::StatusCode;

use super::{ChatRequest, Completion, LlmProvider, ProviderUsage};
use crate::config::LlmConfig;
use crate::error::LlmError;

pub fn chat_completions_endpoint(base_url: &str) -> String {
    let base_url = base_url.trim_end_matches('/');
    format!("{base_url}/chat/completions")
}

/// OpenAI-compatible `POST /chat/completions` provider.
pub struct OpenAiProvider {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl std::fmt::Debug for OpenAiProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiProvider")
            .field("endpoint", &self.endpoint)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl OpenAiProvider {
    pub fn new(base_url: &str, api_key: Option<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("webcontent-analyzer/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|err| anyhow::anyhow!("build llm http client: {err}"))?;
        Ok(Self {
            client,
            endpoint: chat_completions_endpoint(base_url),
            api_key: api_key.filter(|k| !k.trim().is_empty()),
        })
    }

    /// Reads the API key from `config.api_key_env`. A missing key is allowed
    /// so local OpenAI-compatible servers work without credentials.
    pub fn from_config(config: &LlmConfig) -> anyhow::Result<Self> {
        let api_key = std::env::var(&config.api_key_env).ok();
        if api_key.is_none() {
            tracing::warn!(
                env = %config.api_key_env,
                "llm api key is not set; sending unauthenticated requests"
            );
        }
        Self::new(&config.base_url, api_key)
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    async fn chat(&self, request: &ChatRequest) -> Result<Completion, LlmError> {
        let mut body = serde_json::json!({
            "model": request.model,
            "messages": request.messages,
            "max_tokens": request.max_tokens,
        });

        // GPT-5 models reject sampling params like `temperature`.
        if !request.model.starts_with("gpt-5")
            && let Some(obj) = body.as_object_mut()
        {
            obj.insert("temperature".to_owned(), serde_json::json!(request.temperature));
        }

        let mut builder = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(|err| {
            if err.is_timeout() {
                LlmError::Unavailable(format!("POST {}: timed out", self.endpoint))
            } else {
                LlmError::Unavailable(format!("POST {}: {}", self.endpoint, err.without_url()))
            }
        })?;

        let status = response.status();
        let raw = response
            .text()
            .await
            .map_err(|err| LlmError::Unavailable(format!("read llm response body: {err}")))?;
        if !status.is_success() {
            let message = parse_error_message(&raw).unwrap_or_else(|| truncate(&raw, 200));
            return Err(classify_status(status, message));
        }

        let value: serde_json::Value = serde_json::from_str(&raw)
            .map_err(|err| LlmError::Unavailable(format!("parse llm response: {err}")))?;
        Ok(Completion {
            text: extract_message_text(&value),
            usage: value
                .get("usage")
                .and_then(|u| serde_json::from_value::<ProviderUsage>(u.clone()).ok()),
        })
    }
}

fn classify_status(status: StatusCode, message: String) -> LlmError {
    let message = format!("{status}: {message}");
    match status {
        StatusCode::TOO_MANY_REQUESTS => LlmError::RateLimited(message),
        StatusCode::REQUEST_TIMEOUT => LlmError::Unavailable(message),
        s if s.is_server_error() => LlmError::Unavailable(message),
        _ => LlmError::InvalidRequest(message),
    }
}

fn parse_error_message(raw_json: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(raw_json).ok()?;
    let message = value.get("error")?.get("message")?.as_str()?.to_owned();
    Some(message)
}

/// Text of the first choice. Content may be a plain string or a list of
/// `{ "type": "text", "text": ... }` parts.
fn extract_message_text(value: &serde_json::Value) -> String {
    let Some(content) = value
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
    else {
        return String::new();
    };

    if let Some(text) = content.as_str() {
        return text.to_owned();
    }
    let mut text = String::new();
    for part in content.as_array().into_iter().flatten() {
        if let Some(part_text) = part.get("text").and_then(|v| v.as_str()) {
            text.push_str(part_text);
        }
    }
    text
}

fn truncate(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_tolerates_trailing_slash() {
        assert_eq!(
            chat_completions_endpoint("http://localhost:8080/v1/"),
            "http://localhost:8080/v1/chat/completions"
        );
    }

    #[test]
    fn statuses_map_to_retry_classes() {
        let e = classify_status(StatusCode::TOO_MANY_REQUESTS, "slow".to_owned());
        assert!(matches!(e, LlmError::RateLimited(_)));
        assert!(classify_status(StatusCode::BAD_GATEWAY, String::new()).is_retryable());
        let e = classify_status(StatusCode::UNAUTHORIZED, "bad key".to_owned());
        assert!(matches!(e, LlmError::InvalidRequest(_)));
        assert!(!e.is_retryable());
    }

    #[test]
    fn extracts_string_and_part_content() {
        let v = serde_json::json!({
            "choices": [{ "message": { "role": "assistant", "content": "hello" } }],
            "usage": { "prompt_tokens": 3, "completion_tokens": 1 }
        });
        assert_eq!(extract_message_text(&v), "hello");

        let v = serde_json::json!({
            "choices": [{ "message": { "content": [
                { "type": "text", "text": "a" },
                { "type": "text", "text": "b" }
            ] } }]
        });
        assert_eq!(extract_message_text(&v), "ab");
        assert_eq!(extract_message_text(&serde_json::json!({ "choices": [] })), "");
    }

    #[test]
    fn debug_redacts_api_key() {
        let provider =
            OpenAiProvider::new("http://localhost/v1", Some("sk-secret".to_owned())).unwrap();
        assert!(!format!("{provider:?}").contains("sk-secret"));
    }
}

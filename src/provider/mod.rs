// src/provider/mod.rs — Model provider layer

pub mod anthropic;
pub mod ollama;
pub mod openai;
pub mod retry;
pub mod tiers;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::infra::errors::ProviderError;

/// Uniform contract every tier's client implements.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    fn id(&self) -> &str;

    async fn invoke(
        &self,
        payload: &PromptPayload,
        timeout: Duration,
    ) -> Result<ProviderResponse, ProviderError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// Provider-agnostic request.
///
/// `system` is the constant, cacheable prefix; `messages` is the per-run
/// delta that follows it. Clients with native prompt caching mark the
/// boundary between the two.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptPayload {
    pub run_id: String,
    pub cache_key: String,
    pub system: String,
    pub messages: Vec<Message>,
    pub max_output_tokens: u32,
}

impl PromptPayload {
    /// Every character that will be billed as input.
    pub fn input_text_len(&self) -> usize {
        self.system.chars().count()
            + self
                .messages
                .iter()
                .map(|m| m.content.chars().count())
                .sum::<usize>()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cache_read_tokens: u32,
    pub cache_write_tokens: u32,
}

impl TokenUsage {
    pub fn total(&self) -> u32 {
        self.input_tokens + self.output_tokens
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProviderResponse {
    pub text: String,
    pub usage: TokenUsage,
}

/// Map a non-success HTTP status to the typed provider error.
pub(crate) fn status_error(
    status: reqwest::StatusCode,
    retry_after: Option<&reqwest::header::HeaderValue>,
    body: &str,
) -> ProviderError {
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        let secs = retry_after
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .unwrap_or(5);
        return ProviderError::RateLimit {
            retry_after_ms: secs * 1000,
        };
    }
    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        return ProviderError::Auth(format!("HTTP {status}"));
    }
    let body = crate::util::truncate_str(body, 300);
    if status.is_server_error() {
        ProviderError::Unavailable(format!("HTTP {status}: {body}"))
    } else {
        ProviderError::Malformed(format!("HTTP {status}: {body}"))
    }
}

pub(crate) fn transport_error(e: reqwest::Error, timeout: Duration) -> ProviderError {
    if e.is_timeout() {
        ProviderError::Timeout(timeout)
    } else {
        ProviderError::Unavailable(e.to_string())
    }
}

pub(crate) fn api_key_from_env(var: Option<&str>) -> Result<String, ProviderError> {
    let var = var.ok_or_else(|| ProviderError::Auth("no api_key_env configured".into()))?;
    std::env::var(var).map_err(|_| ProviderError::Auth(format!("{var} is not set")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;
    use reqwest::StatusCode;

    #[test]
    fn test_status_error_rate_limit_uses_retry_after() {
        let v = HeaderValue::from_static("3");
        assert_eq!(
            status_error(StatusCode::TOO_MANY_REQUESTS, Some(&v), ""),
            ProviderError::RateLimit {
                retry_after_ms: 3000
            }
        );
    }

    #[test]
    fn test_status_error_classes() {
        assert!(matches!(
            status_error(StatusCode::UNAUTHORIZED, None, ""),
            ProviderError::Auth(_)
        ));
        assert!(matches!(
            status_error(StatusCode::BAD_GATEWAY, None, "upstream"),
            ProviderError::Unavailable(_)
        ));
        assert!(matches!(
            status_error(StatusCode::BAD_REQUEST, None, "bad"),
            ProviderError::Malformed(_)
        ));
    }

    #[test]
    fn test_payload_input_len() {
        let payload = PromptPayload {
            run_id: "r".into(),
            cache_key: "k".into(),
            system: "abcd".into(),
            messages: vec![Message::user("ef"), Message::assistant("g")],
            max_output_tokens: 10,
        };
        assert_eq!(payload.input_text_len(), 7);
    }
}

// src/provider/openai.rs — OpenAI-compatible chat completions client (tier 1)

use async_trait::async_trait;
use std::time::Duration;

use super::{
    api_key_from_env, status_error, transport_error, PromptPayload, ProviderClient,
    ProviderResponse, TokenUsage,
};
use crate::infra::config::ProviderConfig;
use crate::infra::errors::ProviderError;

pub struct OpenAiClient {
    base_url: String,
    model: String,
    api_key_env: Option<String>,
    client: reqwest::Client,
}

impl OpenAiClient {
    pub fn new(config: &ProviderConfig) -> Self {
        Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key_env: config.api_key_env.clone(),
            client: reqwest::Client::new(),
        }
    }

    fn build_request_body(&self, payload: &PromptPayload) -> serde_json::Value {
        let mut messages = vec![serde_json::json!({
            "role": "system",
            "content": payload.system,
        })];
        for m in &payload.messages {
            messages.push(serde_json::json!({
                "role": m.role.as_str(),
                "content": m.content,
            }));
        }

        serde_json::json!({
            "model": self.model,
            "messages": messages,
            "max_tokens": payload.max_output_tokens,
        })
    }
}

#[async_trait]
impl ProviderClient for OpenAiClient {
    fn id(&self) -> &str {
        "openai"
    }

    async fn invoke(
        &self,
        payload: &PromptPayload,
        timeout: Duration,
    ) -> Result<ProviderResponse, ProviderError> {
        let api_key = api_key_from_env(self.api_key_env.as_deref())?;
        let body = self.build_request_body(payload);

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {api_key}"))
            .timeout(timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error(e, timeout))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response.headers().get("retry-after").cloned();
            let error_body = response.text().await.unwrap_or_default();
            return Err(status_error(status, retry_after.as_ref(), &error_body));
        }

        let resp: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ProviderError::Malformed(format!("Failed to parse response: {e}")))?;

        let text = resp["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| ProviderError::Malformed("missing choices[0].message.content".into()))?
            .to_string();

        // OpenAI reports cached prompt tokens inside prompt_tokens.
        let prompt_tokens = resp["usage"]["prompt_tokens"].as_u64().unwrap_or(0) as u32;
        let cached = resp["usage"]["prompt_tokens_details"]["cached_tokens"]
            .as_u64()
            .unwrap_or(0) as u32;
        let usage = TokenUsage {
            input_tokens: prompt_tokens.saturating_sub(cached),
            output_tokens: resp["usage"]["completion_tokens"].as_u64().unwrap_or(0) as u32,
            cache_read_tokens: cached,
            cache_write_tokens: 0,
        };

        Ok(ProviderResponse { text, usage })
    }
}

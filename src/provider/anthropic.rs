// src/provider/anthropic.rs — Anthropic Messages API client (tier 2)

use async_trait::async_trait;
use std::time::Duration;

use super::{
    api_key_from_env, status_error, transport_error, PromptPayload, ProviderClient,
    ProviderResponse, TokenUsage,
};
use crate::infra::config::ProviderConfig;
use crate::infra::errors::ProviderError;

pub struct AnthropicClient {
    base_url: String,
    model: String,
    api_key_env: Option<String>,
    client: reqwest::Client,
}

impl AnthropicClient {
    pub fn new(config: &ProviderConfig) -> Self {
        Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key_env: config.api_key_env.clone(),
            client: reqwest::Client::new(),
        }
    }

    /// The system block carries `cache_control`, marking the end of the
    /// constant prefix so the provider can reuse it across calls.
    fn build_request_body(&self, payload: &PromptPayload) -> serde_json::Value {
        let messages: Vec<serde_json::Value> = payload
            .messages
            .iter()
            .map(|m| {
                serde_json::json!({
                    "role": m.role.as_str(),
                    "content": m.content,
                })
            })
            .collect();

        serde_json::json!({
            "model": self.model,
            "max_tokens": payload.max_output_tokens,
            "system": [{
                "type": "text",
                "text": payload.system,
                "cache_control": { "type": "ephemeral" }
            }],
            "messages": messages,
            "metadata": { "user_id": payload.run_id },
        })
    }
}

#[async_trait]
impl ProviderClient for AnthropicClient {
    fn id(&self) -> &str {
        "anthropic"
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
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
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

        let blocks = resp["content"]
            .as_array()
            .ok_or_else(|| ProviderError::Malformed("missing content array".into()))?;
        let text = blocks
            .iter()
            .filter(|c| c["type"] == "text")
            .filter_map(|c| c["text"].as_str())
            .collect::<Vec<_>>()
            .join("");

        let usage = TokenUsage {
            input_tokens: resp["usage"]["input_tokens"].as_u64().unwrap_or(0) as u32,
            output_tokens: resp["usage"]["output_tokens"].as_u64().unwrap_or(0) as u32,
            cache_read_tokens: resp["usage"]["cache_read_input_tokens"]
                .as_u64()
                .unwrap_or(0) as u32,
            cache_write_tokens: resp["usage"]["cache_creation_input_tokens"]
                .as_u64()
                .unwrap_or(0) as u32,
        };

        Ok(ProviderResponse { text, usage })
    }
}

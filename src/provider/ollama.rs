// src/provider/ollama.rs — Ollama local model client (tier 0)

use async_trait::async_trait;
use std::time::Duration;

use super::{status_error, transport_error, PromptPayload, ProviderClient, ProviderResponse, TokenUsage};
use crate::infra::config::ProviderConfig;
use crate::infra::errors::ProviderError;

pub struct OllamaClient {
    base_url: String,
    model: String,
    client: reqwest::Client,
}

impl OllamaClient {
    pub fn new(config: &ProviderConfig) -> Self {
        Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
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
            "stream": false,
            "options": { "num_predict": payload.max_output_tokens },
        })
    }

    /// True when the server answers and has the configured model pulled.
    pub async fn probe(&self) -> bool {
        let resp = self
            .client
            .get(format!("{}/api/tags", self.base_url))
            .timeout(Duration::from_secs(3))
            .send()
            .await;
        let Ok(resp) = resp else {
            return false;
        };
        let Ok(body) = resp.json::<serde_json::Value>().await else {
            return false;
        };
        body["models"]
            .as_array()
            .map(|models| {
                models
                    .iter()
                    .filter_map(|m| m["name"].as_str())
                    .any(|name| name.contains(&self.model))
            })
            .unwrap_or(false)
    }
}

#[async_trait]
impl ProviderClient for OllamaClient {
    fn id(&self) -> &str {
        "ollama"
    }

    async fn invoke(
        &self,
        payload: &PromptPayload,
        timeout: Duration,
    ) -> Result<ProviderResponse, ProviderError> {
        let body = self.build_request_body(payload);

        let response = self
            .client
            .post(format!("{}/api/chat", self.base_url))
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

        let text = resp["message"]["content"]
            .as_str()
            .ok_or_else(|| ProviderError::Malformed("missing message.content".into()))?
            .to_string();

        let usage = TokenUsage {
            input_tokens: resp["prompt_eval_count"].as_u64().unwrap_or(0) as u32,
            output_tokens: resp["eval_count"].as_u64().unwrap_or(0) as u32,
            cache_read_tokens: 0,
            cache_write_tokens: 0,
        };

        Ok(ProviderResponse { text, usage })
    }
}

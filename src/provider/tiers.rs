// src/provider/tiers.rs — Ordered model tiers and escalation paths

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::anthropic::AnthropicClient;
use super::ollama::OllamaClient;
use super::openai::OpenAiClient;
use super::{ProviderClient, TokenUsage};
use crate::infra::config::{Config, ProviderConfig};

pub const LOCAL_RANK: u8 = 0;
pub const STANDARD_RANK: u8 = 1;
pub const PREMIUM_RANK: u8 = 2;

/// One rung of the escalation ladder. Immutable once the registry is built.
#[derive(Clone)]
pub struct ModelTier {
    pub rank: u8,
    pub name: String,
    pub model: String,
    /// Prices per million tokens, in budget currency.
    pub input_price_per_mtok: f64,
    pub output_price_per_mtok: f64,
    pub enabled: bool,
    pub timeout: Duration,
    /// Attempts allowed on this tier before escalating.
    pub max_attempts: u32,
    pub max_output_tokens: u32,
    pub client: Arc<dyn ProviderClient>,
}

impl ModelTier {
    pub fn new(rank: u8, name: &str, model: &str, client: Arc<dyn ProviderClient>) -> Self {
        Self {
            rank,
            name: name.to_string(),
            model: model.to_string(),
            input_price_per_mtok: 0.0,
            output_price_per_mtok: 0.0,
            enabled: true,
            timeout: Duration::from_secs(120),
            max_attempts: 1,
            max_output_tokens: 4096,
            client,
        }
    }

    pub fn with_pricing(mut self, input_per_mtok: f64, output_per_mtok: f64) -> Self {
        self.input_price_per_mtok = input_per_mtok;
        self.output_price_per_mtok = output_per_mtok;
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Cost of a completed call. Cache reads bill at 10%, cache writes at 125%.
    pub fn cost(&self, usage: &TokenUsage) -> f64 {
        let input = (usage.input_tokens as f64 / 1_000_000.0) * self.input_price_per_mtok;
        let output = (usage.output_tokens as f64 / 1_000_000.0) * self.output_price_per_mtok;
        let cache_read =
            (usage.cache_read_tokens as f64 / 1_000_000.0) * (self.input_price_per_mtok * 0.1);
        let cache_write =
            (usage.cache_write_tokens as f64 / 1_000_000.0) * (self.input_price_per_mtok * 1.25);
        input + output + cache_read + cache_write
    }

    /// Worst-case cost of a call that has not been dispatched yet.
    pub fn projected_cost(&self, input_tokens: u32, output_tokens: u32) -> f64 {
        (input_tokens as f64 / 1_000_000.0) * self.input_price_per_mtok
            + (output_tokens as f64 / 1_000_000.0) * self.output_price_per_mtok
    }
}

impl fmt::Debug for ModelTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelTier")
            .field("rank", &self.rank)
            .field("name", &self.name)
            .field("model", &self.model)
            .field("client", &self.client.id())
            .field("enabled", &self.enabled)
            .field("max_attempts", &self.max_attempts)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct TierRegistry {
    tiers: Vec<ModelTier>,
}

impl TierRegistry {
    /// Tiers are kept in ascending rank (cost) order.
    pub fn new(mut tiers: Vec<ModelTier>) -> Self {
        tiers.sort_by_key(|t| t.rank);
        Self { tiers }
    }

    /// Build the standard local / standard / premium ladder.
    pub fn from_config(config: &Config) -> Self {
        let router = &config.router;
        let providers = &config.providers;

        let local = tier_from(
            LOCAL_RANK,
            "local",
            &providers.local,
            Arc::new(OllamaClient::new(&providers.local)),
        )
        .with_attempts(router.max_local_retries);
        let standard = tier_from(
            STANDARD_RANK,
            "standard",
            &providers.standard,
            Arc::new(OpenAiClient::new(&providers.standard)),
        )
        .with_attempts(router.max_escalation_retries);
        let premium = tier_from(
            PREMIUM_RANK,
            "premium",
            &providers.premium,
            Arc::new(AnthropicClient::new(&providers.premium)),
        )
        .with_attempts(router.premium_retries)
        .enabled(router.enable_premium_tier);

        Self::new(vec![local, standard, premium])
    }

    pub fn tiers(&self) -> &[ModelTier] {
        &self.tiers
    }

    pub fn get(&self, rank: u8) -> Option<&ModelTier> {
        self.tiers.iter().find(|t| t.rank == rank)
    }

    pub fn top_enabled_rank(&self) -> Option<u8> {
        self.tiers.iter().filter(|t| t.enabled).map(|t| t.rank).max()
    }

    /// Enabled tiers from `floor` upward. A floor above the highest enabled
    /// tier clamps to that tier so a retried step still gets one rung.
    pub fn escalation_path(&self, floor: u8) -> Vec<&ModelTier> {
        let Some(top) = self.top_enabled_rank() else {
            return Vec::new();
        };
        let floor = floor.min(top);
        self.tiers
            .iter()
            .filter(|t| t.enabled && t.rank >= floor && t.max_attempts > 0)
            .collect()
    }
}

fn tier_from(
    rank: u8,
    name: &str,
    provider: &ProviderConfig,
    client: Arc<dyn ProviderClient>,
) -> ModelTier {
    let mut tier = ModelTier::new(rank, name, &provider.model, client)
        .with_pricing(provider.input_price_per_mtok, provider.output_price_per_mtok)
        .with_timeout(Duration::from_secs(provider.timeout_secs));
    tier.max_output_tokens = provider.max_output_tokens;
    tier
}

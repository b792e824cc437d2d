// src/infra/config.rs — Configuration loading (TOML + environment overrides)

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::infra::paths;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub router: RouterConfig,

    #[serde(default)]
    pub execution: ExecutionConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub budget: BudgetConfig,

    #[serde(default)]
    pub providers: ProvidersConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    pub enable_premium_tier: bool,
    pub max_local_retries: u32,
    pub max_escalation_retries: u32,
    pub premium_retries: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    /// Multiplier applied to the estimated prompt size when projecting cost.
    pub cost_headroom: f64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            enable_premium_tier: false,
            max_local_retries: 3,
            max_escalation_retries: 2,
            premium_retries: 1,
            retry_base_delay_ms: 500,
            retry_max_delay_ms: 8_000,
            cost_headroom: 1.25,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub max_steps_per_run: usize,
    pub max_retries_per_step: u32,
    pub max_plan_revisions: u32,
    pub timeout_seconds: u64,
    pub require_plan_approval: bool,
    pub require_step_approval: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_steps_per_run: 20,
            max_retries_per_step: 3,
            max_plan_revisions: 2,
            timeout_seconds: 1800,
            require_plan_approval: false,
            require_step_approval: false,
        }
    }
}

impl ExecutionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub ttl_hours: u64,
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_hours: 24,
            max_entries: 100,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_hours.saturating_mul(3600))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    /// Per-run ceiling and shared daily ceiling, in the provider price currency.
    pub daily_budget: f64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self { daily_budget: 5.0 }
    }
}

/// One entry per tier. Prices are per million tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub base_url: String,
    pub model: String,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_provider_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub input_price_per_mtok: f64,
    #[serde(default)]
    pub output_price_per_mtok: f64,
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
}

fn default_provider_timeout() -> u64 {
    120
}

fn default_max_output_tokens() -> u32 {
    4096
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvidersConfig {
    pub local: ProviderConfig,
    pub standard: ProviderConfig,
    pub premium: ProviderConfig,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            local: ProviderConfig {
                base_url: "http://localhost:11434".into(),
                model: "qwen2.5-coder:7b".into(),
                api_key_env: None,
                timeout_secs: 120,
                input_price_per_mtok: 0.0,
                output_price_per_mtok: 0.0,
                max_output_tokens: 4096,
            },
            standard: ProviderConfig {
                base_url: "https://api.openai.com/v1".into(),
                model: "gpt-4o-mini".into(),
                api_key_env: Some("OPENAI_API_KEY".into()),
                timeout_secs: 90,
                input_price_per_mtok: 4.25,
                output_price_per_mtok: 12.75,
                max_output_tokens: 4096,
            },
            premium: ProviderConfig {
                base_url: "https://api.anthropic.com".into(),
                model: "claude-3-5-sonnet-20241022".into(),
                api_key_env: Some("ANTHROPIC_API_KEY".into()),
                timeout_secs: 120,
                input_price_per_mtok: 2.55,
                output_price_per_mtok: 12.75,
                max_output_tokens: 4096,
            },
        }
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let path = paths::config_file_path();
        let mut config = if path.exists() {
            Self::load_from(&path)?
        } else {
            Self::default()
        };
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Apply the documented environment overrides. `lookup` is injected so
    /// tests never touch the process environment.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("ENABLE_PREMIUM_TIER") {
            self.router.enable_premium_tier = parse_bool("ENABLE_PREMIUM_TIER", &v)?;
        }
        override_parsed(&lookup, "MAX_LOCAL_RETRIES", &mut self.router.max_local_retries)?;
        override_parsed(
            &lookup,
            "MAX_ESCALATION_RETRIES",
            &mut self.router.max_escalation_retries,
        )?;
        override_parsed(
            &lookup,
            "MAX_STEPS_PER_RUN",
            &mut self.execution.max_steps_per_run,
        )?;
        override_parsed(
            &lookup,
            "MAX_RETRIES_PER_STEP",
            &mut self.execution.max_retries_per_step,
        )?;
        override_parsed(
            &lookup,
            "MAX_PLAN_REVISIONS",
            &mut self.execution.max_plan_revisions,
        )?;
        override_parsed(
            &lookup,
            "EXECUTION_TIMEOUT_SECONDS",
            &mut self.execution.timeout_seconds,
        )?;
        override_parsed(&lookup, "CACHE_TTL_HOURS", &mut self.cache.ttl_hours)?;
        override_parsed(&lookup, "DEFAULT_DAILY_BUDGET", &mut self.budget.daily_budget)?;
        if let Some(url) = lookup("OLLAMA_BASE_URL") {
            self.providers.local.base_url = url;
        }
        if let Some(model) = lookup("OLLAMA_MODEL") {
            self.providers.local.model = model;
        }
        Ok(())
    }
}

fn override_parsed<F, T>(lookup: &F, key: &str, slot: &mut T) -> anyhow::Result<()>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    if let Some(raw) = lookup(key) {
        *slot = raw
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("{key}: cannot parse '{raw}'"))?;
    }
    Ok(())
}

fn parse_bool(key: &str, raw: &str) -> anyhow::Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => anyhow::bail!("{key}: expected a boolean, got '{other}'"),
    }
}

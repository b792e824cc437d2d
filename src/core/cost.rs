// src/core/cost.rs — Per-run cost tracking and breakdowns

use std::collections::HashMap;

use serde::Serialize;

use crate::core::types::AgentRole;
use crate::provider::TokenUsage;

/// One billed provider call, successful or not.
#[derive(Debug, Clone, PartialEq)]
pub struct CallRecord {
    pub agent: AgentRole,
    pub tier: String,
    pub model: String,
    pub usage: TokenUsage,
    pub cost: f64,
}

#[derive(Debug, Default, Clone)]
pub struct CostTracker {
    pub total: f64,
    pub by_tier: HashMap<String, f64>,
    pub by_agent: HashMap<AgentRole, f64>,
    /// (input, output) tokens per tier.
    pub tokens_by_tier: HashMap<String, (u64, u64)>,
    pub calls_by_tier: HashMap<String, u64>,
}

impl CostTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, call: &CallRecord) {
        self.total += call.cost;
        *self.by_tier.entry(call.tier.clone()).or_default() += call.cost;
        *self.by_agent.entry(call.agent).or_default() += call.cost;
        let tokens = self.tokens_by_tier.entry(call.tier.clone()).or_insert((0, 0));
        tokens.0 += call.usage.input_tokens as u64;
        tokens.1 += call.usage.output_tokens as u64;
        *self.calls_by_tier.entry(call.tier.clone()).or_default() += 1;
    }

    pub fn total_calls(&self) -> u64 {
        self.calls_by_tier.values().sum()
    }

    pub fn total_tokens(&self) -> u64 {
        self.tokens_by_tier.values().map(|(i, o)| i + o).sum()
    }

    /// Tier breakdown, most expensive first.
    pub fn tier_breakdown(&self) -> Vec<TierCost> {
        let mut entries: Vec<TierCost> = self
            .calls_by_tier
            .iter()
            .map(|(tier, calls)| {
                let (input, output) = self.tokens_by_tier.get(tier).copied().unwrap_or((0, 0));
                TierCost {
                    tier: tier.clone(),
                    cost: self.by_tier.get(tier).copied().unwrap_or(0.0),
                    calls: *calls,
                    input_tokens: input,
                    output_tokens: output,
                }
            })
            .collect();
        entries.sort_by(|a, b| {
            b.cost
                .partial_cmp(&a.cost)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.tier.cmp(&b.tier))
        });
        entries
    }

    pub fn summary(&self) -> String {
        format!(
            "{:.4} total over {} calls ({} tokens)",
            self.total,
            self.total_calls(),
            self.total_tokens()
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TierCost {
    pub tier: String,
    pub cost: f64,
    pub calls: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

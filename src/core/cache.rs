// src/core/cache.rs — Prompt reuse cache
//
// Keys are the SHA-256 of a constant system-prompt segment. An entry is
// never served once `now - created_at >= ttl`; a TTL of zero disables reuse.
// All state sits behind one mutex, so inserts and evictions for a key are
// serialized across concurrently executing runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use crate::infra::config::CacheConfig;
use crate::provider::{Message, PromptPayload};
use crate::util::estimate_tokens;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
    pub ttl_secs: u64,
    pub usage_count: u32,
}

impl CacheEntry {
    fn new(key: String, content: &str, ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            key,
            content: content.to_string(),
            created_at: now,
            last_used: now,
            ttl_secs: ttl.as_secs(),
            usage_count: 1,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        let age = now
            .signed_duration_since(self.created_at)
            .to_std()
            .unwrap_or(Duration::ZERO);
        age >= Duration::from_secs(self.ttl_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheLookup {
    Hit,
    Miss,
}

/// A payload ready for dispatch plus whether its prefix was reused.
#[derive(Debug, Clone)]
pub struct PreparedPrompt {
    pub payload: PromptPayload,
    pub lookup: CacheLookup,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CleanupReport {
    pub expired: usize,
    pub evicted: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub total_usage: u64,
    pub most_used: Option<(String, u32)>,
    /// Prompt tokens not re-sent thanks to reuse.
    pub tokens_saved: u64,
}

struct CacheState {
    entries: HashMap<String, Slot>,
    hits: u64,
    misses: u64,
    tick: u64,
}

struct Slot {
    entry: CacheEntry,
    // Monotonic recency; wall-clock timestamps can tie.
    last_tick: u64,
}

pub struct PromptCache {
    state: Mutex<CacheState>,
    ttl: Duration,
    max_entries: usize,
}

impl PromptCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                hits: 0,
                misses: 0,
                tick: 0,
            }),
            ttl,
            max_entries,
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.ttl(), config.max_entries)
    }

    pub fn key_for(material: &str) -> String {
        hex::encode(Sha256::digest(material.as_bytes()))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get_or_insert(&self, material: &str) -> (String, CacheLookup) {
        let key = Self::key_for(material);
        let now = Utc::now();
        let mut guard = self.lock();
        let state = &mut *guard;
        state.tick += 1;
        let tick = state.tick;

        if let Some(slot) = state.entries.get_mut(&key) {
            if !slot.entry.is_expired_at(now) {
                slot.entry.usage_count += 1;
                slot.entry.last_used = now;
                slot.last_tick = tick;
                state.hits += 1;
                return (key, CacheLookup::Hit);
            }
        }

        state.entries.insert(
            key.clone(),
            Slot {
                entry: CacheEntry::new(key.clone(), material, self.ttl),
                last_tick: tick,
            },
        );
        state.misses += 1;
        if state.entries.len() > self.max_entries {
            let evicted = evict_lru(state, self.trim_target());
            tracing::debug!(evicted, "prompt cache over capacity");
        }
        (key, CacheLookup::Miss)
    }

    /// Assemble the dispatchable payload: cached constant prefix + run delta.
    pub fn prepare_messages(
        &self,
        system: &str,
        history: &[Message],
        run_id: &str,
    ) -> PreparedPrompt {
        let (cache_key, lookup) = self.get_or_insert(system);
        PreparedPrompt {
            payload: PromptPayload {
                run_id: run_id.to_string(),
                cache_key,
                system: system.to_string(),
                messages: history.to_vec(),
                max_output_tokens: 0,
            },
            lookup,
        }
    }

    /// Drop expired entries, then trim least-recently-used ones if over capacity.
    pub fn cleanup(&self) -> CleanupReport {
        let now = Utc::now();
        let mut state = self.lock();
        let before = state.entries.len();
        state.entries.retain(|_, slot| !slot.entry.is_expired_at(now));
        let expired = before - state.entries.len();

        let evicted = if state.entries.len() > self.max_entries {
            evict_lru(&mut state, self.trim_target())
        } else {
            0
        };
        CleanupReport { expired, evicted }
    }

    /// Remove every entry and reset counters. Returns how many were removed.
    pub fn clear(&self) -> usize {
        let mut state = self.lock();
        let n = state.entries.len();
        state.entries.clear();
        state.hits = 0;
        state.misses = 0;
        n
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        self.lock().entries.get(key).map(|s| s.entry.clone())
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.lock();
        let lookups = state.hits + state.misses;
        let hit_rate = if lookups == 0 {
            0.0
        } else {
            state.hits as f64 / lookups as f64
        };
        let most_used = state
            .entries
            .values()
            .max_by_key(|s| s.entry.usage_count)
            .map(|s| (s.entry.key.clone(), s.entry.usage_count));
        let tokens_saved = state
            .entries
            .values()
            .map(|s| {
                (s.entry.usage_count.saturating_sub(1) as u64)
                    * estimate_tokens(&s.entry.content) as u64
            })
            .sum();
        CacheStats {
            entries: state.entries.len(),
            hits: state.hits,
            misses: state.misses,
            hit_rate,
            total_usage: state.entries.values().map(|s| s.entry.usage_count as u64).sum(),
            most_used,
            tokens_saved,
        }
    }

    /// Cost avoided by reuse, at the given input price per million tokens.
    pub fn estimate_savings(&self, input_price_per_mtok: f64) -> f64 {
        self.stats().tokens_saved as f64 / 1_000_000.0 * input_price_per_mtok
    }

    /// Live entries, for persistence between processes.
    pub fn snapshot(&self) -> Vec<CacheEntry> {
        let now = Utc::now();
        let state = self.lock();
        let mut entries: Vec<CacheEntry> = state
            .entries
            .values()
            .filter(|s| !s.entry.is_expired_at(now))
            .map(|s| s.entry.clone())
            .collect();
        entries.sort_by(|a, b| a.last_used.cmp(&b.last_used));
        entries
    }

    /// Load persisted entries, skipping expired ones. Returns how many were kept.
    pub fn restore(&self, entries: Vec<CacheEntry>) -> usize {
        let now = Utc::now();
        let mut state = self.lock();
        let mut restored = 0;
        let mut live: Vec<CacheEntry> = entries
            .into_iter()
            .filter(|e| !e.is_expired_at(now))
            .collect();
        live.sort_by(|a, b| a.last_used.cmp(&b.last_used));
        for entry in live {
            state.tick += 1;
            let tick = state.tick;
            state.entries.insert(
                entry.key.clone(),
                Slot {
                    entry,
                    last_tick: tick,
                },
            );
            restored += 1;
        }
        if state.entries.len() > self.max_entries {
            evict_lru(&mut state, self.trim_target());
        }
        restored
    }

    fn trim_target(&self) -> usize {
        (self.max_entries * 8 / 10).max(1)
    }
}

fn evict_lru(state: &mut CacheState, target: usize) -> usize {
    if state.entries.len() <= target {
        return 0;
    }
    let mut by_age: Vec<(u64, String)> = state
        .entries
        .iter()
        .map(|(k, s)| (s.last_tick, k.clone()))
        .collect();
    by_age.sort();
    let excess = state.entries.len() - target;
    for (_, key) in by_age.into_iter().take(excess) {
        state.entries.remove(&key);
    }
    excess
}

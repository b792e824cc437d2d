// src/store/mod.rs — Run persistence

pub mod schema;
pub mod sqlite;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::core::cache::CacheEntry;
use crate::core::types::{AgentConversation, Run, RunStatus, Step};
use crate::infra::errors::ForgeError;

pub use sqlite::SqliteStore;

/// One line of `agentforge runs`.
#[derive(Debug, Clone, Serialize)]
pub struct RunListing {
    pub id: String,
    pub goal: String,
    pub stack: String,
    pub status: RunStatus,
    pub cost_used: f64,
    pub step_count: u32,
    pub failure_reason: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Durable state for runs, their steps, the conversation log and the prompt cache.
///
/// Calls are synchronous and short; implementations serialize access
/// internally so one store can be shared by concurrent runs.
pub trait RunStore: Send + Sync {
    /// Insert or replace the run row and all of its steps.
    fn save_run(&self, run: &Run) -> Result<(), ForgeError>;

    fn save_step(&self, run_id: &str, step: &Step) -> Result<(), ForgeError>;

    fn load_run(&self, id: &str) -> Result<Option<Run>, ForgeError>;

    /// Most recent first.
    fn list_runs(&self, limit: usize) -> Result<Vec<RunListing>, ForgeError>;

    fn append_conversation(&self, entry: &AgentConversation) -> Result<(), ForgeError>;

    /// In append order.
    fn conversations(&self, run_id: &str) -> Result<Vec<AgentConversation>, ForgeError>;

    /// Cost recorded by runs started today (UTC).
    fn spent_today(&self) -> Result<f64, ForgeError>;

    /// Replace the persisted cache with `entries`.
    fn save_cache_entries(&self, entries: &[CacheEntry]) -> Result<(), ForgeError>;

    fn load_cache_entries(&self) -> Result<Vec<CacheEntry>, ForgeError>;

    fn clear_cache_entries(&self) -> Result<usize, ForgeError>;
}

// src/core/approval.rs — Human approval gates

use async_trait::async_trait;

use crate::core::types::{Run, Step};

/// Consulted when a run is configured to pause for plan or step approval.
#[async_trait]
pub trait ApprovalGate: Send + Sync {
    async fn approve_plan(&self, run: &Run) -> bool;

    async fn approve_step(&self, run: &Run, step: &Step) -> bool;
}

/// Approves everything. Used when no one is at the terminal.
#[derive(Debug, Default, Clone, Copy)]
pub struct AutoApprove;

#[async_trait]
impl ApprovalGate for AutoApprove {
    async fn approve_plan(&self, _run: &Run) -> bool {
        true
    }

    async fn approve_step(&self, _run: &Run, _step: &Step) -> bool {
        true
    }
}

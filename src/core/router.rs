// src/core/router.rs — Tiered LLM routing with retry, escalation and budget gating
//
// Tiers are tried cheapest first. Provider errors retry on the same tier
// with backoff until the tier's attempts are spent; a response that fails
// its task's structural contract escalates straight to the next tier.
// No call is dispatched unless its projected cost fits the run budget and
// can be reserved against the shared daily ledger.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::core::budget::DailyLedger;
use crate::core::cache::{CacheLookup, PromptCache};
use crate::core::cancel::CancelSignal;
use crate::core::cost::CallRecord;
use crate::core::task::{Task, TaskOutput};
use crate::core::types::{FailureKind, FailureRecord, Run};
use crate::infra::config::RouterConfig;
use crate::infra::errors::{ForgeError, ProviderError};
use crate::provider::retry::BackoffPolicy;
use crate::provider::tiers::{ModelTier, TierRegistry};
use crate::provider::{Message, PromptPayload, TokenUsage};
use crate::util::preview;

/// Per-route mutable state, seeded from the run and synced back by the caller.
#[derive(Debug, Clone)]
pub struct AttemptState {
    pub run_id: String,
    pub cost_used: f64,
    pub daily_budget: f64,
    /// Lowest tier rank to try.
    pub escalation_floor: u8,
    pub history: Vec<FailureRecord>,
    /// Every billed call made during this route.
    pub calls: Vec<CallRecord>,
    /// Every dispatched request with what came back, accepted or not.
    pub exchanges: Vec<Exchange>,
    pub cancel: CancelSignal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Exchange {
    pub tier: String,
    pub request: String,
    /// Response text, or a description of the provider failure.
    pub response: String,
    pub accepted: bool,
}

impl AttemptState {
    pub fn for_run(run: &Run, cancel: CancelSignal) -> Self {
        Self {
            run_id: run.id.clone(),
            cost_used: run.cost_used,
            daily_budget: run.daily_budget,
            escalation_floor: 0,
            history: Vec::new(),
            calls: Vec::new(),
            exchanges: Vec::new(),
            cancel,
        }
    }

    pub fn with_floor(mut self, floor: u8) -> Self {
        self.escalation_floor = floor;
        self
    }

    pub fn remaining(&self) -> f64 {
        (self.daily_budget - self.cost_used).max(0.0)
    }
}

#[derive(Debug, Clone)]
pub struct RoutedResponse {
    pub output: TaskOutput,
    pub text: String,
    pub tier: String,
    pub model: String,
    pub usage: TokenUsage,
    pub cost: f64,
    pub cache: CacheLookup,
}

pub struct LlmRouter {
    tiers: TierRegistry,
    cache: Arc<PromptCache>,
    ledger: Arc<DailyLedger>,
    backoff: BackoffPolicy,
    cost_headroom: f64,
}

impl LlmRouter {
    pub fn new(tiers: TierRegistry, cache: Arc<PromptCache>, ledger: Arc<DailyLedger>) -> Self {
        Self {
            tiers,
            cache,
            ledger,
            backoff: BackoffPolicy::default(),
            cost_headroom: 1.25,
        }
    }

    pub fn with_config(mut self, config: &RouterConfig) -> Self {
        self.backoff = BackoffPolicy::from_config(config);
        self.cost_headroom = config.cost_headroom;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn tiers(&self) -> &TierRegistry {
        &self.tiers
    }

    pub fn cache(&self) -> &Arc<PromptCache> {
        &self.cache
    }

    pub fn ledger(&self) -> &Arc<DailyLedger> {
        &self.ledger
    }

    /// Upper bound on what dispatching `payload` to `tier` can cost.
    pub fn project_cost(&self, tier: &ModelTier, payload: &PromptPayload) -> f64 {
        let estimated = (payload.input_text_len() as f64 / 4.0).ceil();
        let input = (estimated * self.cost_headroom).ceil() as u32;
        tier.projected_cost(input, payload.max_output_tokens)
    }

    pub async fn route(
        &self,
        task: &Task,
        state: &mut AttemptState,
    ) -> Result<RoutedResponse, ForgeError> {
        let kind = task.kind();
        let path = self.tiers.escalation_path(state.escalation_floor);

        for tier in path {
            let mut attempt = 0;
            while attempt < tier.max_attempts {
                attempt += 1;
                if state.cancel.is_cancelled() {
                    return Err(ForgeError::Cancelled);
                }

                let request = task.render_user(&state.history)?;
                let prepared = self.cache.prepare_messages(
                    task.system_prompt(),
                    &[Message::user(request.clone())],
                    &state.run_id,
                );
                let mut payload = prepared.payload;
                payload.max_output_tokens = tier.max_output_tokens;

                let projected = self.project_cost(tier, &payload);
                if state.cost_used + projected > state.daily_budget {
                    warn!(
                        run_id = %state.run_id,
                        tier = %tier.name,
                        projected,
                        remaining = state.remaining(),
                        "call would exceed run budget"
                    );
                    return Err(ForgeError::BudgetExceeded {
                        projected,
                        remaining: state.remaining(),
                    });
                }
                let reservation = self.ledger.reserve(projected)?;

                debug!(
                    run_id = %state.run_id,
                    task = %kind,
                    tier = %tier.name,
                    attempt,
                    cache = ?prepared.lookup,
                    "dispatching"
                );

                let outcome = tokio::select! {
                    biased;
                    r = tokio::time::timeout(tier.timeout, tier.client.invoke(&payload, tier.timeout)) => r,
                    _ = state.cancel.cancelled() => {
                        state.exchanges.push(Exchange {
                            tier: tier.name.clone(),
                            request,
                            response: "cancelled before the provider answered".into(),
                            accepted: false,
                        });
                        return Err(ForgeError::Cancelled);
                    }
                };

                let error = match outcome {
                    Err(_elapsed) => ProviderError::Timeout(tier.timeout),
                    Ok(Err(e)) => e,
                    Ok(Ok(resp)) => {
                        let validated = task.validate(&resp.text);
                        state.exchanges.push(Exchange {
                            tier: tier.name.clone(),
                            request: request.clone(),
                            response: resp.text.clone(),
                            accepted: validated.is_ok(),
                        });
                        let cost = tier.cost(&resp.usage);
                        reservation.settle(cost);
                        state.cost_used += cost;
                        state.calls.push(CallRecord {
                            agent: kind.agent(),
                            tier: tier.name.clone(),
                            model: tier.model.clone(),
                            usage: resp.usage.clone(),
                            cost,
                        });

                        match validated {
                            Ok(output) => {
                                info!(
                                    run_id = %state.run_id,
                                    task = %kind,
                                    tier = %tier.name,
                                    attempt,
                                    cost,
                                    "response accepted"
                                );
                                return Ok(RoutedResponse {
                                    output,
                                    text: resp.text,
                                    tier: tier.name.clone(),
                                    model: tier.model.clone(),
                                    usage: resp.usage,
                                    cost,
                                    cache: prepared.lookup,
                                });
                            }
                            Err(reason) => {
                                warn!(
                                    run_id = %state.run_id,
                                    task = %kind,
                                    tier = %tier.name,
                                    attempt,
                                    %reason,
                                    response = %preview(&resp.text, 80),
                                    "response failed validation, escalating"
                                );
                                state.history.push(FailureRecord::new(
                                    &tier.name,
                                    attempt,
                                    FailureKind::Validation,
                                    reason,
                                ));
                                break;
                            }
                        }
                    }
                };

                warn!(
                    run_id = %state.run_id,
                    task = %kind,
                    tier = %tier.name,
                    attempt,
                    error = %error,
                    "provider call failed"
                );
                state.exchanges.push(Exchange {
                    tier: tier.name.clone(),
                    request: request.clone(),
                    response: format!("provider error: {error}"),
                    accepted: false,
                });
                state.history.push(FailureRecord::new(
                    &tier.name,
                    attempt,
                    error.failure_kind(),
                    error.to_string(),
                ));
                if !error.is_retriable() {
                    break;
                }
                if attempt < tier.max_attempts {
                    self.wait_before_retry(attempt - 1, &error, &state.cancel)
                        .await?;
                }
            }
        }

        Err(ForgeError::EscalationExhausted {
            task: kind,
            history: state.history.clone(),
        })
    }

    async fn wait_before_retry(
        &self,
        retry: u32,
        error: &ProviderError,
        cancel: &CancelSignal,
    ) -> Result<(), ForgeError> {
        let delay = self.backoff.delay_for(retry, error);
        if delay == Duration::ZERO {
            return Ok(());
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => Ok(()),
            _ = cancel.cancelled() => Err(ForgeError::Cancelled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::task::DevelopContext;
    use crate::provider::tiers::ModelTier;
    use crate::provider::{ProviderClient, ProviderResponse};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    const PATCH: &str = "BEGIN_PATCH\n--- a/x\n+++ b/x\n@@ -1 +1 @@\n-a\n+b\nEND_PATCH";

    struct Scripted {
        replies: Mutex<VecDeque<Result<String, ProviderError>>>,
        calls: AtomicU32,
    }

    impl Scripted {
        fn new(replies: Vec<Result<&str, ProviderError>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(
                    replies
                        .into_iter()
                        .map(|r| r.map(str::to_string))
                        .collect(),
                ),
                calls: AtomicU32::new(0),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ProviderClient for Scripted {
        fn id(&self) -> &str {
            "scripted"
        }

        async fn invoke(
            &self,
            _payload: &PromptPayload,
            _timeout: Duration,
        ) -> Result<ProviderResponse, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self
                .replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok("nothing useful here".into()));
            next.map(|text| ProviderResponse {
                text,
                usage: TokenUsage {
                    input_tokens: 1000,
                    output_tokens: 1000,
                    ..Default::default()
                },
            })
        }
    }

    fn task() -> Task {
        Task::Develop(DevelopContext {
            goal: "g".into(),
            stack: "python".into(),
            step_number: 1,
            total_steps: 1,
            instruction: "do it".into(),
            files: vec![],
            completed: vec![],
            feedback: None,
        })
    }

    fn router(local: Arc<Scripted>, standard: Arc<Scripted>) -> LlmRouter {
        let tiers = TierRegistry::new(vec![
            ModelTier::new(0, "local", "small", local).with_attempts(2),
            ModelTier::new(1, "standard", "big", standard)
                .with_attempts(2)
                .with_pricing(1.0, 1.0),
        ]);
        LlmRouter::new(
            tiers,
            Arc::new(PromptCache::new(Duration::from_secs(3600), 10)),
            DailyLedger::new(100.0),
        )
        .with_backoff(BackoffPolicy::immediate())
    }

    fn state(budget: f64) -> AttemptState {
        let run = Run::new("g", "python", budget);
        AttemptState::for_run(&run, CancelSignal::new())
    }

    #[tokio::test]
    async fn test_first_tier_success() {
        let local = Scripted::new(vec![Ok(PATCH)]);
        let standard = Scripted::new(vec![]);
        let r = router(local.clone(), standard.clone());
        let mut st = state(1.0);
        let resp = r.route(&task(), &mut st).await.unwrap();
        assert_eq!(resp.tier, "local");
        assert!(matches!(resp.output, TaskOutput::Patch(_)));
        assert_eq!(local.calls(), 1);
        assert_eq!(standard.calls(), 0);
        assert_eq!(st.cost_used, 0.0);
    }

    #[tokio::test]
    async fn test_validation_failure_escalates_immediately() {
        let local = Scripted::new(vec![Ok("I cannot write patches, sorry.")]);
        let standard = Scripted::new(vec![Ok(PATCH)]);
        let r = router(local.clone(), standard.clone());
        let mut st = state(1.0);
        let resp = r.route(&task(), &mut st).await.unwrap();
        assert_eq!(resp.tier, "standard");
        // One local call only: validation failures are not retried on the same tier.
        assert_eq!(local.calls(), 1);
        assert_eq!(st.history.len(), 1);
        assert_eq!(st.history[0].kind, FailureKind::Validation);
        // 1000 in + 1000 out at 1.0 per million each.
        assert!((st.cost_used - 0.002).abs() < 1e-9);
        assert_eq!(st.calls.len(), 2);
        // The rejected local answer is kept alongside the accepted one.
        assert_eq!(st.exchanges.len(), 2);
        assert_eq!(st.exchanges[0].tier, "local");
        assert_eq!(st.exchanges[0].response, "I cannot write patches, sorry.");
        assert!(!st.exchanges[0].accepted);
        assert!(st.exchanges[1].accepted);
    }

    #[tokio::test]
    async fn test_provider_errors_retry_same_tier() {
        let local = Scripted::new(vec![
            Err(ProviderError::Unavailable("503".into())),
            Ok(PATCH),
        ]);
        let standard = Scripted::new(vec![]);
        let r = router(local.clone(), standard.clone());
        let mut st = state(1.0);
        let resp = r.route(&task(), &mut st).await.unwrap();
        assert_eq!(resp.tier, "local");
        assert_eq!(local.calls(), 2);
        assert_eq!(st.history[0].kind, FailureKind::Unavailable);
        assert_eq!(st.exchanges.len(), 2);
        assert!(st.exchanges[0].response.starts_with("provider error"));
    }

    #[tokio::test]
    async fn test_auth_error_skips_rest_of_tier() {
        let local = Scripted::new(vec![Err(ProviderError::Auth("no key".into()))]);
        let standard = Scripted::new(vec![Ok(PATCH)]);
        let r = router(local.clone(), standard.clone());
        let mut st = state(1.0);
        r.route(&task(), &mut st).await.unwrap();
        assert_eq!(local.calls(), 1);
    }

    #[tokio::test]
    async fn test_exhaustion_returns_history() {
        let local = Scripted::new(vec![]);
        let standard = Scripted::new(vec![]);
        let r = router(local, standard);
        let mut st = state(1.0);
        match r.route(&task(), &mut st).await {
            Err(ForgeError::EscalationExhausted { history, .. }) => {
                let tiers: Vec<&str> = history.iter().map(|f| f.tier.as_str()).collect();
                assert_eq!(tiers, vec!["local", "standard"]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_budget_gate_blocks_paid_tier() {
        let local = Scripted::new(vec![Ok("not a patch at all")]);
        let standard = Scripted::new(vec![Ok(PATCH)]);
        let r = router(local.clone(), standard.clone());
        // Default max_output_tokens is 4096 → projected ≥ 0.004 on the paid tier.
        let mut st = state(0.001);
        let err = r.route(&task(), &mut st).await.unwrap_err();
        assert!(matches!(err, ForgeError::BudgetExceeded { .. }));
        assert_eq!(standard.calls(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_before_dispatch() {
        let local = Scripted::new(vec![Ok(PATCH)]);
        let r = router(local.clone(), Scripted::new(vec![]));
        let mut st = state(1.0);
        st.cancel.cancel();
        let err = r.route(&task(), &mut st).await.unwrap_err();
        assert!(matches!(err, ForgeError::Cancelled));
        assert_eq!(local.calls(), 0);
    }

    #[tokio::test]
    async fn test_floor_skips_lower_tiers() {
        let local = Scripted::new(vec![Ok(PATCH)]);
        let standard = Scripted::new(vec![Ok(PATCH)]);
        let r = router(local.clone(), standard.clone());
        let mut st = state(1.0).with_floor(1);
        let resp = r.route(&task(), &mut st).await.unwrap();
        assert_eq!(resp.tier, "standard");
        assert_eq!(local.calls(), 0);
    }
}

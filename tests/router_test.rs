// tests/router_test.rs — Integration test: tiered routing, caching and budgets

mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use agentforge::core::budget::DailyLedger;
use agentforge::core::cache::{CacheLookup, PromptCache};
use agentforge::core::cancel::CancelSignal;
use agentforge::core::router::{AttemptState, LlmRouter};
use agentforge::core::task::{DevelopContext, PlanContext, Task, TaskOutput};
use agentforge::core::types::{FailureKind, Run};
use agentforge::infra::errors::{ForgeError, ProviderError};
use agentforge::provider::retry::BackoffPolicy;
use agentforge::provider::tiers::{ModelTier, TierRegistry};
use agentforge::provider::{PromptPayload, ProviderClient, ProviderResponse};

use common::*;

fn develop() -> Task {
    Task::Develop(DevelopContext {
        goal: "hello api".into(),
        stack: "python".into(),
        step_number: 1,
        total_steps: 2,
        instruction: "Create main.py".into(),
        files: vec!["main.py".into()],
        completed: vec![],
        feedback: None,
    })
}

fn plan() -> Task {
    Task::Plan(PlanContext {
        goal: "hello api".into(),
        stack: "python".into(),
        existing_files: vec![],
        revision: 0,
        failure_notes: vec![],
    })
}

fn state(budget: f64) -> AttemptState {
    AttemptState::for_run(&Run::new("g", "python", budget), CancelSignal::new())
}

fn three_tiers(
    local: Arc<ScriptedClient>,
    standard: Arc<ScriptedClient>,
    premium: Arc<ScriptedClient>,
    premium_enabled: bool,
) -> TierRegistry {
    TierRegistry::new(vec![
        ModelTier::new(0, "local", "small", local).with_attempts(2),
        ModelTier::new(1, "standard", "medium", standard)
            .with_attempts(2)
            .with_pricing(0.5, 1.5),
        ModelTier::new(2, "premium", "large", premium)
            .with_attempts(1)
            .with_pricing(3.0, 15.0)
            .enabled(premium_enabled),
    ])
}

#[tokio::test]
async fn test_second_identical_prefix_hits_cache() {
    let client = ScriptedClient::new(vec![Ok(PLAN), Ok(PLAN)]);
    let router = router(single_tier(client.clone()));

    let first = router.route(&plan(), &mut state(1.0)).await.unwrap();
    let second = router.route(&plan(), &mut state(1.0)).await.unwrap();

    assert_eq!(first.cache, CacheLookup::Miss);
    assert_eq!(second.cache, CacheLookup::Hit);
    let stats = router.cache().stats();
    assert_eq!(stats.entries, 1);
    assert_eq!(stats.hits, 1);
    assert!((stats.hit_rate - 0.5).abs() < 1e-9);

    // Both payloads carry the same cache key for the shared system prompt.
    let payloads = client.payloads();
    assert_eq!(payloads[0].cache_key, payloads[1].cache_key);
    assert!(matches!(second.output, TaskOutput::Plan(ref steps) if steps.len() == 2));
}

#[tokio::test]
async fn test_zero_ttl_never_hits() {
    let client = ScriptedClient::new(vec![Ok(PLAN), Ok(PLAN), Ok(PLAN)]);
    let router = LlmRouter::new(
        single_tier(client),
        Arc::new(PromptCache::new(Duration::ZERO, 100)),
        DailyLedger::new(10.0),
    )
    .with_backoff(BackoffPolicy::immediate());

    for _ in 0..3 {
        let resp = router.route(&plan(), &mut state(1.0)).await.unwrap();
        assert_eq!(resp.cache, CacheLookup::Miss);
    }
    assert_eq!(router.cache().stats().hit_rate, 0.0);
}

#[tokio::test]
async fn test_retries_are_bounded_per_tier() {
    let local = ScriptedClient::new(vec![
        Err(ProviderError::Unavailable("503".into())),
        Err(ProviderError::Unavailable("503".into())),
        Ok(PATCH),
    ]);
    let router = router(single_tier(local.clone()));
    let mut st = state(1.0);

    let err = router.route(&develop(), &mut st).await.unwrap_err();
    match err {
        ForgeError::EscalationExhausted { history, .. } => {
            assert_eq!(history.len(), 2);
            assert!(history.iter().all(|f| f.kind == FailureKind::Unavailable));
        }
        other => panic!("expected exhaustion, got {other}"),
    }
    // The third scripted reply is never requested.
    assert_eq!(local.calls(), 2);
}

#[tokio::test]
async fn test_disabled_premium_is_never_invoked() {
    let local = ScriptedClient::new(vec![Ok("not a patch at all")]);
    let standard = ScriptedClient::new(vec![Ok("still no patch in here")]);
    let premium = ScriptedClient::new(vec![Ok(PATCH)]);
    let router = router(three_tiers(
        local.clone(),
        standard.clone(),
        premium.clone(),
        false,
    ));
    let mut st = state(5.0);

    let err = router.route(&develop(), &mut st).await.unwrap_err();
    let ForgeError::EscalationExhausted { history, .. } = err else {
        panic!("expected exhaustion");
    };
    let tiers: Vec<&str> = history.iter().map(|f| f.tier.as_str()).collect();
    assert_eq!(tiers, vec!["local", "standard"]);
    assert_eq!(premium.calls(), 0);
}

#[tokio::test]
async fn test_enabled_premium_is_last_resort() {
    let local = ScriptedClient::new(vec![Ok("not a patch at all")]);
    let standard = ScriptedClient::new(vec![Ok("still no patch in here")]);
    let premium = ScriptedClient::new(vec![Ok(PATCH)]);
    let router = router(three_tiers(local, standard, premium.clone(), true));
    let mut st = state(5.0);

    let resp = router.route(&develop(), &mut st).await.unwrap();
    assert_eq!(resp.tier, "premium");
    assert_eq!(premium.calls(), 1);
    // Failed feedback from the lower tiers reaches the premium prompt.
    let prompt = &premium.payloads()[0].messages[0].content;
    assert!(prompt.contains("local attempt 1"));
    assert!(prompt.contains("standard attempt 1"));
    // Rejected answers are still billed.
    assert_eq!(st.calls.len(), 3);
    assert!(st.cost_used > 0.0);
}

#[tokio::test]
async fn test_budget_gate_blocks_dispatch() {
    let client = ScriptedClient::new(vec![Ok(PATCH)]);
    let tiers = TierRegistry::new(vec![
        ModelTier::new(1, "standard", "medium", client.clone()).with_pricing(10.0, 30.0),
    ]);
    let ledger = DailyLedger::new(100.0);
    let router = LlmRouter::new(
        tiers,
        Arc::new(PromptCache::new(Duration::from_secs(60), 10)),
        ledger.clone(),
    );
    let mut st = state(0.001);

    let err = router.route(&develop(), &mut st).await.unwrap_err();
    assert!(matches!(err, ForgeError::BudgetExceeded { .. }));
    assert_eq!(client.calls(), 0);
    assert_eq!(st.cost_used, 0.0);
    assert_eq!(ledger.spent(), 0.0);
}

#[tokio::test]
async fn test_daily_ledger_is_shared_across_runs() {
    let client = ScriptedClient::new(vec![Ok(PATCH)]);
    let tiers = TierRegistry::new(vec![
        ModelTier::new(1, "standard", "medium", client.clone()).with_pricing(10.0, 30.0),
    ]);
    // Earlier runs today already used nearly the whole allowance.
    let router = LlmRouter::new(
        tiers,
        Arc::new(PromptCache::new(Duration::from_secs(60), 10)),
        DailyLedger::with_spent(1.0, 0.99),
    );

    let err = router.route(&develop(), &mut state(1.0)).await.unwrap_err();
    assert!(matches!(err, ForgeError::BudgetExceeded { .. }));
    assert_eq!(client.calls(), 0);
}

/// Never answers within the test's lifetime.
struct Hanging {
    calls: AtomicU32,
}

#[async_trait]
impl ProviderClient for Hanging {
    fn id(&self) -> &str {
        "hanging"
    }

    async fn invoke(
        &self,
        _payload: &PromptPayload,
        _timeout: Duration,
    ) -> Result<ProviderResponse, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Err(ProviderError::Unavailable("unreachable".into()))
    }
}

#[tokio::test]
async fn test_cancel_in_flight_adds_no_cost() {
    let client = Arc::new(Hanging {
        calls: AtomicU32::new(0),
    });
    let tiers = TierRegistry::new(vec![
        ModelTier::new(1, "standard", "medium", client.clone()).with_pricing(1.0, 1.0),
    ]);
    let ledger = DailyLedger::new(10.0);
    let router = LlmRouter::new(
        tiers,
        Arc::new(PromptCache::new(Duration::from_secs(60), 10)),
        ledger.clone(),
    );
    let cancel = CancelSignal::new();
    let mut st = AttemptState::for_run(&Run::new("g", "python", 1.0), cancel.clone());

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let err = router.route(&develop(), &mut st).await.unwrap_err();
    assert!(matches!(err, ForgeError::Cancelled));
    assert_eq!(client.calls.load(Ordering::SeqCst), 1);
    assert_eq!(st.cost_used, 0.0);
    assert!(st.calls.is_empty());
    assert_eq!(st.exchanges.len(), 1);
    assert!(!st.exchanges[0].accepted);
    // The in-flight reservation is released, not billed.
    assert_eq!(ledger.spent(), 0.0);
    assert!((ledger.remaining() - 10.0).abs() < 1e-9);
}

#[tokio::test]
async fn test_escalation_floor_skips_lower_tiers() {
    let local = ScriptedClient::new(vec![Ok(PATCH)]);
    let standard = ScriptedClient::new(vec![Ok(PATCH)]);
    let premium = ScriptedClient::new(vec![]);
    let router = router(three_tiers(local.clone(), standard.clone(), premium, false));
    let mut st = state(5.0).with_floor(1);

    let resp = router.route(&develop(), &mut st).await.unwrap();
    assert_eq!(resp.tier, "standard");
    assert_eq!(local.calls(), 0);
}

//! Order execution behind an idempotency guard and a last-moment kill switch
//! check.

use anyhow::Result as AnyResult;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::{EnvConfig, ExecutionConfig, ExecutionMode};
use crate::error::Result;
use crate::execution::live::{LiveAdapter, SimmerClient};
use crate::execution::persistence::{Claim, Database};
use crate::execution::simulator::DryRunAdapter;
use crate::execution::state::StateTracker;
use crate::execution::types::{OrderIntent, OrderResult, OrderStatus, Position};
use crate::strategies::types::Side;

/// The execution mode, fixed at startup.
pub enum ExecutionAdapter {
    DryRun(DryRunAdapter),
    Live(LiveAdapter),
}

impl ExecutionAdapter {
    pub fn from_config(config: &ExecutionConfig, env: &EnvConfig) -> AnyResult<Self> {
        match config.mode {
            ExecutionMode::DryRun => Ok(ExecutionAdapter::DryRun(DryRunAdapter::new())),
            ExecutionMode::Live => {
                let api_key = env.require_api_key()?;
                let client = SimmerClient::new(
                    env.simmer_api_url.clone(),
                    api_key.to_string(),
                    config.venue.clone(),
                );
                Ok(ExecutionAdapter::Live(LiveAdapter::new(
                    Box::new(client),
                    Duration::from_secs(config.timeout_secs),
                )))
            }
        }
    }

    pub fn mode(&self) -> ExecutionMode {
        match self {
            ExecutionAdapter::DryRun(_) => ExecutionMode::DryRun,
            ExecutionAdapter::Live(_) => ExecutionMode::Live,
        }
    }

    async fn dispatch(&self, intent: &OrderIntent, now: DateTime<Utc>) -> OrderResult {
        match self {
            ExecutionAdapter::DryRun(adapter) => adapter.execute(intent, now),
            ExecutionAdapter::Live(adapter) => adapter.execute(intent, now).await,
        }
    }
}

pub struct Executor {
    db: Arc<Database>,
    adapter: ExecutionAdapter,
}

impl Executor {
    pub fn new(db: Arc<Database>, adapter: ExecutionAdapter) -> Self {
        Self { db, adapter }
    }

    pub fn mode(&self) -> ExecutionMode {
        self.adapter.mode()
    }

    /// Execute one intent, producing exactly one recorded result.
    ///
    /// A key whose earlier attempt is unresolved or non-retryable returns
    /// `DUPLICATE` without dispatching. The kill switch is read from the
    /// store right before dispatch; when set, the intent is recorded with a
    /// retryable `REJECTED` and never reaches the venue. Only a `FILLED` buy
    /// changes exposure.
    pub async fn execute(
        &self,
        intent: &OrderIntent,
        state: &mut StateTracker,
        now: DateTime<Utc>,
    ) -> Result<OrderResult> {
        let key = &intent.idempotency_key;

        match self.db.claim_intent(intent)? {
            Claim::Consumed(prior) => {
                info!("Duplicate intent {} (prior status {}), skipping", key, prior.status);
                let result = OrderResult::new(key, OrderStatus::Duplicate, now)
                    .with_error(format!("Already executed with status {}", prior.status));
                self.db.save_order_result(&intent.run_id, &result)?;
                return Ok(result);
            }
            Claim::Retry(prior) => debug!("Retrying {} after retryable {}", key, prior.status),
            Claim::Fresh => {}
        }

        if self.db.kill_switch_active()? {
            warn!("Kill switch active, blocking {} on {}", key, intent.market_id);
            let result = OrderResult::new(key, OrderStatus::Rejected, now)
                .with_error("Kill switch active")
                .retryable(true);
            self.db.save_order_result(&intent.run_id, &result)?;
            return Ok(result);
        }

        let result = self.adapter.dispatch(intent, now).await;
        self.db.save_order_result(&intent.run_id, &result)?;
        self.apply(intent, &result, state, now)?;
        Ok(result)
    }

    fn apply(
        &self,
        intent: &OrderIntent,
        result: &OrderResult,
        state: &mut StateTracker,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if result.status.counts_as_trade() {
            state.count_trade();
        }
        if intent.side != Side::Buy {
            return Ok(());
        }
        match result.status {
            OrderStatus::Filled => {
                state.record_fill(Position::from_fill(intent, result), now)?;
            }
            OrderStatus::DryRun | OrderStatus::Submitted => {
                state.record_cooldown(&intent.market_id, now)?;
            }
            _ => {}
        }
        Ok(())
    }
}

/// An unresolved attempt (left `PENDING` by a crash mid-dispatch) may already
/// have reached the venue, so it consumes the key just like a terminal one.
#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::idempotency::idempotency_key;
    use crate::execution::live::tests::{intent as live_intent, FakeOutcome, FakeVenue};
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 17, 12, 0, 0).unwrap()
    }

    fn setup(adapter: ExecutionAdapter) -> (Executor, StateTracker) {
        let db = Arc::new(Database::in_memory().unwrap());
        let state = StateTracker::hydrate(db.clone()).unwrap();
        (Executor::new(db, adapter), state)
    }

    fn buy_intent() -> OrderIntent {
        let mut intent = live_intent(Side::Buy);
        intent.idempotency_key = idempotency_key(&intent.run_id, &intent.market_id, intent.side, intent.price);
        intent
    }

    fn live(venue: FakeVenue, timeout_ms: u64) -> ExecutionAdapter {
        ExecutionAdapter::Live(LiveAdapter::new(Box::new(venue), Duration::from_millis(timeout_ms)))
    }

    #[tokio::test]
    async fn test_dry_run_records_intent_and_cooldown_only() {
        let (executor, mut state) = setup(ExecutionAdapter::DryRun(DryRunAdapter::new()));
        let intent = buy_intent();

        let result = executor.execute(&intent, &mut state, now()).await.unwrap();
        assert_eq!(result.status, OrderStatus::DryRun);
        assert_eq!(state.trades_this_run(), 1);
        assert_eq!(state.total_exposure(), 0.0);
        assert_eq!(state.last_trade_at(&intent.market_id), Some(now()));

        let audit = state.database().run_audit(&intent.run_id).unwrap();
        assert_eq!(audit.intents.len(), 1);
        assert_eq!(audit.intents[0].status, OrderStatus::DryRun);
        assert_eq!(audit.results.len(), 1);
    }

    #[tokio::test]
    async fn test_same_key_twice_is_duplicate() {
        let (executor, mut state) = setup(ExecutionAdapter::DryRun(DryRunAdapter::new()));
        let intent = buy_intent();

        let first = executor.execute(&intent, &mut state, now()).await.unwrap();
        let second = executor.execute(&intent, &mut state, now()).await.unwrap();
        assert_eq!(first.status, OrderStatus::DryRun);
        assert_eq!(second.status, OrderStatus::Duplicate);
        assert_eq!(state.trades_this_run(), 1);

        let results = state.database().order_results_for_key(&intent.idempotency_key).unwrap();
        let non_duplicate = results.iter().filter(|r| r.status != OrderStatus::Duplicate).count();
        assert_eq!(non_duplicate, 1);
    }

    #[tokio::test]
    async fn test_fill_updates_exposure_once() {
        let venue = FakeVenue::filled(0.10, 50.0);
        let calls = venue.calls.clone();
        let (executor, mut state) = setup(live(venue, 500));
        let intent = buy_intent();

        let result = executor.execute(&intent, &mut state, now()).await.unwrap();
        assert_eq!(result.status, OrderStatus::Filled);
        assert_eq!(state.total_exposure(), 5.0);
        assert_eq!(state.city_exposure("nyc"), 5.0);
        assert_eq!(state.positions().len(), 1);

        let again = executor.execute(&intent, &mut state, now()).await.unwrap();
        assert_eq!(again.status, OrderStatus::Duplicate);
        assert_eq!(state.total_exposure(), 5.0);
        assert_eq!(calls.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_timeout_then_retry_then_duplicate() {
        let (slow_executor, mut state) = setup(live(FakeVenue::slow(Duration::from_secs(5)), 50));
        let intent = buy_intent();

        let failed = slow_executor.execute(&intent, &mut state, now()).await.unwrap();
        assert_eq!(failed.status, OrderStatus::Failed);
        assert!(failed.retryable);
        assert_eq!(state.total_exposure(), 0.0);
        assert_eq!(state.trades_this_run(), 0);

        // Same intent, same key, healthy venue
        let retry_key = idempotency_key(&intent.run_id, &intent.market_id, intent.side, intent.price);
        assert_eq!(retry_key, intent.idempotency_key);
        let healthy = Executor::new(state.database().clone(), live(FakeVenue::filled(0.10, 50.0), 500));

        let filled = healthy.execute(&intent, &mut state, now()).await.unwrap();
        assert_eq!(filled.status, OrderStatus::Filled);
        assert_eq!(state.total_exposure(), 5.0);

        let dup = healthy.execute(&intent, &mut state, now()).await.unwrap();
        assert_eq!(dup.status, OrderStatus::Duplicate);

        let statuses: Vec<_> = state
            .database()
            .order_results_for_key(&intent.idempotency_key)
            .unwrap()
            .into_iter()
            .map(|r| r.status)
            .collect();
        assert_eq!(statuses, vec![OrderStatus::Failed, OrderStatus::Filled, OrderStatus::Duplicate]);
    }

    #[tokio::test]
    async fn test_rejection_consumes_key() {
        let (executor, mut state) = setup(live(FakeVenue::new(FakeOutcome::Status(400)), 500));
        let intent = buy_intent();

        let rejected = executor.execute(&intent, &mut state, now()).await.unwrap();
        assert_eq!(rejected.status, OrderStatus::Rejected);
        let again = executor.execute(&intent, &mut state, now()).await.unwrap();
        assert_eq!(again.status, OrderStatus::Duplicate);
        assert_eq!(state.total_exposure(), 0.0);
    }

    #[tokio::test]
    async fn test_kill_switch_in_store_blocks_dispatch() {
        let venue = FakeVenue::filled(0.10, 50.0);
        let calls = venue.calls.clone();
        let (executor, mut state) = setup(live(venue, 500));
        let intent = buy_intent();

        // Another process flips the switch after this tracker was hydrated
        let mut operator = StateTracker::hydrate(state.database().clone()).unwrap();
        operator.set_kill_switch(true, "test", now()).unwrap();
        assert!(!state.is_kill_switch_active());

        let blocked = executor.execute(&intent, &mut state, now()).await.unwrap();
        assert_eq!(blocked.status, OrderStatus::Rejected);
        assert!(blocked.retryable);
        assert!(calls.lock().is_empty());
        assert_eq!(state.total_exposure(), 0.0);

        let audit = state.database().run_audit(&intent.run_id).unwrap();
        assert_eq!(audit.intents.len(), 1);
        assert_eq!(audit.results[0].error_message, "Kill switch active");

        // Released: the blocked key may still execute
        operator.set_kill_switch(false, "test", now()).unwrap();
        let filled = executor.execute(&intent, &mut state, now()).await.unwrap();
        assert_eq!(filled.status, OrderStatus::Filled);
    }

    #[tokio::test]
    async fn test_crash_left_pending_is_duplicate() {
        let (executor, mut state) = setup(ExecutionAdapter::DryRun(DryRunAdapter::new()));
        let intent = buy_intent();
        state.database().claim_intent(&intent).unwrap();

        let result = executor.execute(&intent, &mut state, now()).await.unwrap();
        assert_eq!(result.status, OrderStatus::Duplicate);
    }

    #[test]
    fn test_live_mode_requires_api_key() {
        let config = ExecutionConfig {
            mode: ExecutionMode::Live,
            ..ExecutionConfig::default()
        };
        let env = EnvConfig {
            simmer_api_key: None,
            simmer_api_url: "http://localhost".to_string(),
        };
        assert!(ExecutionAdapter::from_config(&config, &env).is_err());

        let env = EnvConfig {
            simmer_api_key: Some("key".to_string()),
            ..env
        };
        let adapter = ExecutionAdapter::from_config(&config, &env).unwrap();
        assert_eq!(adapter.mode(), ExecutionMode::Live);
    }
}

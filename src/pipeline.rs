//! Scan and exit cycles.
//!
//! One cycle at a time: every cycle holds the state tracker lock from start
//! to finish, so transitions from two cycles never interleave. Across
//! processes sharing the database the same holds through the stored cycle
//! lease; a cycle that finds it taken fails with
//! [`EngineError::CycleInProgress`]. Buckets are processed sequentially in a
//! stable order and cancellation is only observed between buckets.

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{Config, ExecutionMode};
use crate::data::slug::{parse_market_slug, SlugError};
use crate::data::types::{BucketMarket, ForecastPoint, MarketEvent, MarketQuote, ScanInput};
use crate::error::{EngineError, Result};
use crate::execution::executor::{ExecutionAdapter, Executor};
use crate::execution::idempotency::idempotency_key;
use crate::execution::persistence::{Database, RunRecord};
use crate::execution::risk::{RiskEngine, RiskVerdict};
use crate::execution::state::{StateTracker, SystemState};
use crate::execution::types::{OrderIntent, OrderResult, OrderStatus, Position};
use crate::monitoring::logger::CsvLogger;
use crate::monitoring::summary::{RunKind, RunStatus, RunSummarizer, RunSummary};
use crate::strategies::types::{EdgeResult, ReasonCode, Side};
use crate::strategies::weather_edge::EdgeCalculator;

/// A cycle that outlives this is assumed dead and its lease can be taken over.
const CYCLE_LEASE_MINUTES: i64 = 60;

/// Everything one cycle produced, in processing order.
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub run_id: String,
    pub status: RunStatus,
    pub summary: RunSummary,
    pub edge_results: Vec<EdgeResult>,
    pub verdicts: Vec<RiskVerdict>,
    pub intents: Vec<OrderIntent>,
    pub results: Vec<OrderResult>,
}

impl CycleReport {
    fn new(run_id: &str, mode: ExecutionMode) -> (Self, RunSummarizer) {
        let report = Self {
            run_id: run_id.to_string(),
            status: RunStatus::Running,
            summary: RunSummary::default(),
            edge_results: Vec::new(),
            verdicts: Vec::new(),
            intents: Vec::new(),
            results: Vec::new(),
        };
        (report, RunSummarizer::new(run_id, mode.as_str()))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub state: SystemState,
    pub open_positions: Vec<Position>,
    pub latest_run: Option<RunRecord>,
}

/// A started cycle: its run row and the lease it holds.
struct RunHandle {
    row: i64,
    lease: String,
    started: Instant,
}

/// A bucket waiting to be priced. Unparseable slugs are kept so they are
/// reported rather than dropped.
enum Candidate<'a> {
    Quoted(MarketQuote),
    Unparsed {
        event: &'a MarketEvent,
        market: &'a BucketMarket,
        error: SlugError,
    },
}

impl Candidate<'_> {
    fn sort_key(&self) -> (String, NaiveDate, (i64, i64), String) {
        match self {
            Candidate::Quoted(q) => (q.city.clone(), q.target_date, q.bucket.sort_key(), q.market_id.clone()),
            Candidate::Unparsed { event, market, .. } => (
                event.city.clone(),
                event.target_date,
                (i64::MAX, i64::MAX),
                market.market_id.clone(),
            ),
        }
    }
}

pub struct DecisionPipeline {
    config: Config,
    fingerprint: String,
    db: Arc<Database>,
    calculator: EdgeCalculator,
    risk: RiskEngine,
    executor: Executor,
    state: Mutex<StateTracker>,
    cancel: Arc<AtomicBool>,
    csv: Option<CsvLogger>,
}

impl DecisionPipeline {
    pub fn new(config: Config, db: Arc<Database>, adapter: ExecutionAdapter) -> Result<Self> {
        config.validate()?;
        let state = StateTracker::hydrate(db.clone())?;
        let csv = if config.monitoring.csv_logging {
            Some(CsvLogger::new(config.monitoring.csv_log_path.clone())?)
        } else {
            None
        };

        Ok(Self {
            fingerprint: config.fingerprint()?,
            calculator: EdgeCalculator::new(config.strategy.clone()),
            risk: RiskEngine::new(config.risk.clone()),
            executor: Executor::new(db.clone(), adapter),
            state: Mutex::new(state),
            cancel: Arc::new(AtomicBool::new(false)),
            csv,
            db,
            config,
        })
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    /// Setting the returned flag stops the running cycle after its current
    /// bucket. The flag is cleared when that cycle finishes.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    /// Run one scan cycle, waiting for any cycle already in progress in this
    /// pipeline. Fails with [`EngineError::CycleInProgress`] if another
    /// process is mid-cycle on the same database.
    pub async fn run_scan(&self, input: &ScanInput, now: DateTime<Utc>) -> Result<CycleReport> {
        let mut state = self.state.lock().await;
        self.scan_locked(&mut *state, input, now).await
    }

    /// Run one scan cycle, or fail with [`EngineError::CycleInProgress`]
    /// if another cycle holds the state.
    pub async fn try_run_scan(&self, input: &ScanInput, now: DateTime<Utc>) -> Result<CycleReport> {
        let mut state = self.state.try_lock().map_err(|_| EngineError::CycleInProgress)?;
        self.scan_locked(&mut *state, input, now).await
    }

    /// Mark open positions to `prices` (market id -> yes price) and sell
    /// those that reached the exit price.
    pub async fn run_exit(&self, run_id: &str, prices: &BTreeMap<String, f64>, now: DateTime<Utc>) -> Result<CycleReport> {
        let mut state = self.state.lock().await;
        let run_id = resolve_run_id(run_id);
        let run = self.start_run(&mut *state, &run_id, RunKind::Exit, now)?;
        let outcome = self.exit_cycle(&mut *state, &run_id, prices, now).await;
        self.finish(&*state, run, outcome, now)
    }

    pub async fn pause(&self, source: &str, now: DateTime<Utc>) -> Result<()> {
        self.with_state(|state| state.set_paused(true, source, now)).await
    }

    pub async fn resume(&self, source: &str, now: DateTime<Utc>) -> Result<()> {
        self.with_state(|state| state.set_paused(false, source, now)).await
    }

    pub async fn set_kill_switch(&self, active: bool, source: &str, now: DateTime<Utc>) -> Result<()> {
        self.with_state(|state| state.set_kill_switch(active, source, now)).await
    }

    pub async fn status(&self) -> Result<StatusReport> {
        let mut state = self.state.lock().await;
        state.reload()?;
        Ok(StatusReport {
            state: state.state().clone(),
            open_positions: state.positions().to_vec(),
            latest_run: self.db.latest_run()?,
        })
    }

    async fn with_state<T>(&self, f: impl FnOnce(&mut StateTracker) -> Result<T>) -> Result<T> {
        let mut state = self.state.lock().await;
        state.reload()?;
        f(&mut *state)
    }

    // ----- cycles -----

    async fn scan_locked(
        &self,
        state: &mut StateTracker,
        input: &ScanInput,
        now: DateTime<Utc>,
    ) -> Result<CycleReport> {
        let run_id = resolve_run_id(&input.run_id);
        let run = self.start_run(state, &run_id, RunKind::Scan, now)?;
        let outcome = self.scan_cycle(state, &run_id, input, now).await;
        self.finish(state, run, outcome, now)
    }

    fn start_run(&self, state: &mut StateTracker, run_id: &str, kind: RunKind, now: DateTime<Utc>) -> Result<RunHandle> {
        let lease = format!("{}/{}", run_id, Uuid::new_v4());
        let expires_at = now + chrono::Duration::minutes(CYCLE_LEASE_MINUTES);
        if !self.db.acquire_cycle_lease(&lease, now, expires_at)? {
            warn!("Cycle {} refused: another process is mid-cycle", run_id);
            return Err(EngineError::CycleInProgress);
        }

        match self.open_run(state, run_id, kind, now) {
            Ok(row) => Ok(RunHandle {
                row,
                lease,
                started: Instant::now(),
            }),
            Err(e) => {
                self.release_lease(&lease);
                Err(e)
            }
        }
    }

    fn open_run(&self, state: &mut StateTracker, run_id: &str, kind: RunKind, now: DateTime<Utc>) -> Result<i64> {
        state.reload()?;
        state.begin_run();
        self.db.save_config_snapshot(&self.fingerprint, &self.config, now)?;
        let row = self
            .db
            .insert_run(run_id, kind, self.executor.mode(), &self.fingerprint, now)?;
        info!(
            "Starting {} cycle {} (mode={}, config={})",
            kind.as_str(),
            run_id,
            self.executor.mode(),
            self.fingerprint
        );
        Ok(row)
    }

    fn finish(
        &self,
        state: &StateTracker,
        run: RunHandle,
        outcome: Result<(CycleReport, RunSummarizer)>,
        now: DateTime<Utc>,
    ) -> Result<CycleReport> {
        self.cancel.store(false, Ordering::SeqCst);

        let finished = match outcome {
            Ok((mut report, mut summarizer)) => {
                summarizer.record_exposure(state.total_exposure(), state.daily_loss(now));
                summarizer.record_duration(run.started.elapsed().as_secs_f64());
                report.summary = summarizer.finalize();
                self.db
                    .finish_run(run.row, report.status, &report.summary, now)
                    .map(|()| {
                        info!(
                            "Cycle {} {} in {:.2}s: {} scanned, {} opportunities, {} blocked, {} executed, {} failed, {} duplicates",
                            report.run_id,
                            report.status.as_str(),
                            report.summary.duration_secs,
                            report.summary.buckets_scanned,
                            report.summary.opportunities,
                            report.summary.blocked,
                            report.summary.executed,
                            report.summary.failed,
                            report.summary.duplicates
                        );
                        report
                    })
            }
            Err(e) => {
                error!("Cycle aborted by error: {}", e);
                let detail = serde_json::json!({ "error": e.to_string() });
                if let Err(mark) = self.db.finish_run(run.row, RunStatus::Failed, &detail, now) {
                    error!("Could not mark run as failed: {}", mark);
                }
                Err(e)
            }
        };

        self.release_lease(&run.lease);
        finished
    }

    fn release_lease(&self, lease: &str) {
        if let Err(e) = self.db.release_cycle_lease(lease) {
            error!("Could not release cycle lease {}: {}", lease, e);
        }
    }

    async fn scan_cycle(
        &self,
        state: &mut StateTracker,
        run_id: &str,
        input: &ScanInput,
        now: DateTime<Utc>,
    ) -> Result<(CycleReport, RunSummarizer)> {
        let (mut report, mut summarizer) = CycleReport::new(run_id, self.executor.mode());

        if state.is_paused() {
            warn!("System paused, aborting scan {}", run_id);
            report.status = RunStatus::Aborted;
            summarizer.record_error("system paused");
            return Ok((report, summarizer));
        }

        summarizer.record_events(input.events.len());
        for forecast in &input.forecasts {
            self.db.save_forecast(run_id, forecast)?;
        }
        let forecasts = latest_forecasts(&input.forecasts);
        let candidates = build_candidates(&input.events);

        report.status = RunStatus::Completed;
        for candidate in candidates {
            if self.cancel.load(Ordering::SeqCst) {
                warn!("Scan {} cancelled", run_id);
                report.status = RunStatus::Cancelled;
                break;
            }

            let quote = match candidate {
                Candidate::Quoted(quote) => quote,
                Candidate::Unparsed { event, market, error } => {
                    warn!("Bucket {} skipped: {}", market.slug, error);
                    let result = unparsed_result(event, market, &error);
                    self.db.save_edge_result(run_id, &result, now)?;
                    summarizer.record_edge_result(&result);
                    summarizer.record_error(format!("{}: {}", market.market_id, error));
                    report.edge_results.push(result);
                    continue;
                }
            };

            self.db.save_quote(run_id, &quote)?;
            let forecast = forecasts.get(&(quote.city.clone(), quote.target_date)).copied();
            let edge = self.calculator.compute(forecast, &quote.bucket, &quote, now);
            self.db.save_edge_result(run_id, &edge, now)?;
            summarizer.record_edge_result(&edge);

            if !edge.is_opportunity() {
                debug!("Skip {} {}: {} ({})", edge.city, edge.bucket_label, edge.reason_code, edge.detail);
                report.edge_results.push(edge);
                continue;
            }

            let intent = build_entry_intent(run_id, &quote, &edge, now);
            report.edge_results.push(edge);

            let verdict = self.risk.evaluate(&intent, &state.snapshot(now), now);
            self.db.save_risk_verdict(run_id, &verdict, now)?;
            summarizer.record_verdict(&verdict);
            let approved = verdict.approved;
            report.verdicts.push(verdict);
            if !approved {
                continue;
            }

            let result = self.executor.execute(&intent, state, now).await?;
            self.record_order(&mut report, &mut summarizer, intent, result);
        }

        Ok((report, summarizer))
    }

    async fn exit_cycle(
        &self,
        state: &mut StateTracker,
        run_id: &str,
        prices: &BTreeMap<String, f64>,
        now: DateTime<Utc>,
    ) -> Result<(CycleReport, RunSummarizer)> {
        let (mut report, mut summarizer) = CycleReport::new(run_id, self.executor.mode());

        if state.is_paused() || state.is_kill_switch_active() {
            warn!(
                "Exit cycle {} skipped (paused={}, kill_switch={})",
                run_id,
                state.is_paused(),
                state.is_kill_switch_active()
            );
            report.status = RunStatus::Aborted;
            summarizer.record_error("system paused or kill switch active");
            return Ok((report, summarizer));
        }

        let min_exit = self.config.strategy.min_exit_price;
        let positions = state.positions().to_vec();
        info!("Checking {} open positions for exit", positions.len());

        report.status = RunStatus::Completed;
        for position in positions {
            if self.cancel.load(Ordering::SeqCst) {
                warn!("Exit cycle {} cancelled", run_id);
                report.status = RunStatus::Cancelled;
                break;
            }
            let Some(id) = position.id else { continue };
            summarizer.record_position_checked();

            let Some(&price) = prices.get(&position.market_id) else {
                debug!("No price for {} ({})", position.market_id, position.bucket_label);
                continue;
            };
            if !price.is_finite() || !(0.0..=1.0).contains(&price) {
                summarizer.record_error(format!("{}: invalid price {}", position.market_id, price));
                continue;
            }

            state.mark_position(id, price)?;
            if price < min_exit {
                debug!(
                    "Hold {} {}: ${:.4} < exit ${:.4}",
                    position.city, position.bucket_label, price, min_exit
                );
                continue;
            }

            info!(
                "EXIT: {} {} entry ${:.4} -> ${:.4}",
                position.city, position.bucket_label, position.entry_price, price
            );
            let intent = build_exit_intent(run_id, &position, price, now);
            let result = self.executor.execute(&intent, state, now).await?;
            if matches!(result.status, OrderStatus::Filled | OrderStatus::DryRun) {
                let exit_price = result.fill_price.unwrap_or(price);
                state.close_position(id, exit_price, now)?;
                summarizer.record_exit();
            }
            self.record_order(&mut report, &mut summarizer, intent, result);
        }

        Ok((report, summarizer))
    }

    fn record_order(
        &self,
        report: &mut CycleReport,
        summarizer: &mut RunSummarizer,
        intent: OrderIntent,
        result: OrderResult,
    ) {
        summarizer.record_order_result(&result);
        if let Some(csv) = &self.csv {
            if let Err(e) = csv.log_order(&intent, &result) {
                warn!("CSV log failed: {}", e);
            }
        }
        report.intents.push(intent);
        report.results.push(result);
    }
}

fn resolve_run_id(run_id: &str) -> String {
    if run_id.trim().is_empty() {
        Uuid::new_v4().to_string()
    } else {
        run_id.to_string()
    }
}

/// Latest forecast per (city, date), by source generation time.
fn latest_forecasts(forecasts: &[ForecastPoint]) -> BTreeMap<(String, NaiveDate), &ForecastPoint> {
    let mut latest: BTreeMap<(String, NaiveDate), &ForecastPoint> = BTreeMap::new();
    for forecast in forecasts {
        let key = (forecast.city.clone(), forecast.target_date);
        match latest.get(&key) {
            Some(existing) if existing.source_generated_at >= forecast.source_generated_at => {}
            _ => {
                latest.insert(key, forecast);
            }
        }
    }
    latest
}

fn build_candidates(events: &[MarketEvent]) -> Vec<Candidate<'_>> {
    let mut candidates: Vec<Candidate<'_>> = events
        .iter()
        .flat_map(|event| {
            event.buckets.iter().map(move |market| match parse_market_slug(&market.slug) {
                Ok(bucket) => Candidate::Quoted(MarketQuote::from_bucket_market(event, market, bucket)),
                Err(error) => Candidate::Unparsed { event, market, error },
            })
        })
        .collect();
    candidates.sort_by_cached_key(|c| c.sort_key());
    candidates
}

fn unparsed_result(event: &MarketEvent, market: &BucketMarket, error: &SlugError) -> EdgeResult {
    EdgeResult {
        event_id: event.event_id.clone(),
        market_id: market.market_id.clone(),
        city: event.city.clone(),
        target_date: event.target_date,
        bucket: None,
        bucket_label: market.slug.clone(),
        bucket_probability: 0.0,
        market_price: market.yes_price,
        gross_edge: 0.0,
        net_edge: 0.0,
        sigma_used: 0.0,
        days_out: 0,
        forecast_stale: false,
        suggested_size_usd: 0.0,
        reason_code: ReasonCode::BucketParseError,
        detail: error.to_string(),
    }
}

fn build_entry_intent(run_id: &str, quote: &MarketQuote, edge: &EdgeResult, now: DateTime<Utc>) -> OrderIntent {
    let price = quote.yes_price;
    OrderIntent {
        run_id: run_id.to_string(),
        idempotency_key: idempotency_key(run_id, &quote.market_id, Side::Buy, price),
        market_id: quote.market_id.clone(),
        city: quote.city.clone(),
        target_date: quote.target_date,
        bucket_label: edge.bucket_label.clone(),
        side: Side::Buy,
        price,
        size_usd: edge.suggested_size_usd,
        net_edge: edge.net_edge,
        best_bid: quote.best_bid,
        best_ask: quote.best_ask,
        end_date: quote.end_date,
        status: OrderStatus::Pending,
        created_at: now,
    }
}

/// Sell the whole position at `price`. `size_usd` is the proceeds so that
/// `shares()` returns the position's share count. The key is scoped to the
/// position's entry key, so two positions on one market exit independently.
fn build_exit_intent(run_id: &str, position: &Position, price: f64, now: DateTime<Utc>) -> OrderIntent {
    let scope = format!("{}#{}", position.market_id, position.idempotency_key);
    OrderIntent {
        run_id: run_id.to_string(),
        idempotency_key: idempotency_key(run_id, &scope, Side::Sell, price),
        market_id: position.market_id.clone(),
        city: position.city.clone(),
        target_date: position.target_date,
        bucket_label: position.bucket_label.clone(),
        side: Side::Sell,
        price,
        size_usd: position.shares * price,
        net_edge: price - position.entry_price,
        best_bid: price,
        best_ask: price,
        end_date: now,
        status: OrderStatus::Pending,
        created_at: now,
    }
}

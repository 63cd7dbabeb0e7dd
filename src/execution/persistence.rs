//! SQLite store for the decision audit trail and the durable system state.
//!
//! Snapshots, edge results, risk checks and order results are append-only.
//! `system_state`, `city_exposure` and `market_cooldowns` are owned by the
//! state tracker. Trading transitions apply deltas to the stored values inside
//! one write transaction, so processes sharing the file never lose each
//! other's updates. `cycle_lease` admits one scan or exit cycle at a time
//! across every process using the file.

use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::config::ExecutionMode;
use crate::data::types::{ForecastPoint, MarketQuote};
use crate::error::Result;
use crate::execution::risk::{RiskCheck, RiskVerdict};
use crate::execution::state::SystemState;
use crate::execution::types::{OrderIntent, OrderResult, OrderStatus, Position, PositionStatus};
use crate::monitoring::summary::{RunKind, RunStatus};
use crate::strategies::types::{EdgeResult, Side};

const SCHEMA_VERSION: i64 = 2;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// City exposure at or below this is treated as released.
const EXPOSURE_EPSILON: f64 = 1e-9;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id TEXT NOT NULL,
    kind TEXT NOT NULL,
    mode TEXT NOT NULL,
    config_fingerprint TEXT NOT NULL,
    status TEXT NOT NULL,
    summary_json TEXT,
    started_at TEXT NOT NULL,
    finished_at TEXT
);

CREATE TABLE IF NOT EXISTS config_snapshots (
    fingerprint TEXT PRIMARY KEY,
    config_json TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS forecast_snapshots (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id TEXT NOT NULL,
    city TEXT NOT NULL,
    target_date TEXT NOT NULL,
    value REAL NOT NULL,
    unit TEXT NOT NULL,
    source_generated_at TEXT NOT NULL,
    fetched_at TEXT NOT NULL,
    payload TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS market_quotes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id TEXT NOT NULL,
    market_id TEXT NOT NULL,
    event_id TEXT NOT NULL,
    city TEXT NOT NULL,
    target_date TEXT NOT NULL,
    bucket_label TEXT NOT NULL,
    yes_price REAL NOT NULL,
    best_bid REAL NOT NULL,
    best_ask REAL NOT NULL,
    accepting_orders INTEGER NOT NULL,
    end_date TEXT NOT NULL,
    fetched_at TEXT NOT NULL,
    payload TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS edge_results (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id TEXT NOT NULL,
    event_id TEXT NOT NULL,
    market_id TEXT NOT NULL,
    city TEXT NOT NULL,
    target_date TEXT NOT NULL,
    bucket_label TEXT NOT NULL,
    bucket_probability REAL NOT NULL,
    market_price REAL NOT NULL,
    gross_edge REAL NOT NULL,
    net_edge REAL NOT NULL,
    sigma_used REAL NOT NULL,
    forecast_stale INTEGER NOT NULL,
    reason_code TEXT NOT NULL,
    detail TEXT NOT NULL,
    payload TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS risk_checks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id TEXT NOT NULL,
    idempotency_key TEXT NOT NULL,
    check_order INTEGER NOT NULL,
    check_name TEXT NOT NULL,
    passed INTEGER NOT NULL,
    detail TEXT NOT NULL,
    approved INTEGER NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS order_intents (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id TEXT NOT NULL,
    idempotency_key TEXT NOT NULL UNIQUE,
    market_id TEXT NOT NULL,
    city TEXT NOT NULL,
    target_date TEXT NOT NULL,
    bucket_label TEXT NOT NULL,
    side TEXT NOT NULL,
    price REAL NOT NULL,
    size_usd REAL NOT NULL,
    net_edge REAL NOT NULL,
    best_bid REAL NOT NULL,
    best_ask REAL NOT NULL,
    end_date TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'PENDING',
    retryable INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS order_results (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id TEXT NOT NULL,
    idempotency_key TEXT NOT NULL REFERENCES order_intents(idempotency_key),
    status TEXT NOT NULL,
    fill_price REAL,
    fill_size REAL,
    venue_order_id TEXT,
    error_message TEXT NOT NULL DEFAULT '',
    retryable INTEGER NOT NULL,
    executed_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS positions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    idempotency_key TEXT NOT NULL,
    market_id TEXT NOT NULL,
    city TEXT NOT NULL,
    target_date TEXT NOT NULL,
    bucket_label TEXT NOT NULL,
    entry_price REAL NOT NULL,
    size_usd REAL NOT NULL,
    shares REAL NOT NULL,
    current_price REAL NOT NULL,
    status TEXT NOT NULL DEFAULT 'open',
    opened_at TEXT NOT NULL,
    closed_at TEXT,
    realized_pnl REAL
);

CREATE TABLE IF NOT EXISTS system_state (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    mode TEXT NOT NULL,
    paused INTEGER NOT NULL,
    kill_switch INTEGER NOT NULL,
    daily_loss REAL NOT NULL,
    daily_loss_date TEXT,
    total_exposure REAL NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS city_exposure (
    city TEXT PRIMARY KEY,
    exposure REAL NOT NULL
);

CREATE TABLE IF NOT EXISTS market_cooldowns (
    market_id TEXT PRIMARY KEY,
    last_trade_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS cycle_lease (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    holder TEXT,
    expires_at INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS operator_commands (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    command TEXT NOT NULL,
    value TEXT NOT NULL,
    source TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_runs_run_id ON runs(run_id);
CREATE INDEX IF NOT EXISTS idx_forecast_run ON forecast_snapshots(run_id);
CREATE INDEX IF NOT EXISTS idx_quotes_run ON market_quotes(run_id);
CREATE INDEX IF NOT EXISTS idx_edge_results_run ON edge_results(run_id);
CREATE INDEX IF NOT EXISTS idx_risk_checks_run ON risk_checks(run_id);
CREATE INDEX IF NOT EXISTS idx_order_intents_run ON order_intents(run_id);
CREATE INDEX IF NOT EXISTS idx_order_results_key ON order_results(idempotency_key);
CREATE INDEX IF NOT EXISTS idx_order_results_run ON order_results(run_id);
CREATE INDEX IF NOT EXISTS idx_positions_status ON positions(status);
"#;

/// One row of the `runs` table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunRecord {
    pub id: i64,
    pub run_id: String,
    pub kind: RunKind,
    pub mode: String,
    pub config_fingerprint: String,
    pub status: RunStatus,
    pub summary_json: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredRiskCheck {
    pub idempotency_key: String,
    pub check: RiskCheck,
    pub passed: bool,
    pub detail: String,
    pub approved: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperatorCommand {
    pub command: String,
    pub value: String,
    pub source: String,
    pub created_at: DateTime<Utc>,
}

/// Every stored row of one run's decision chain.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunAudit {
    pub runs: Vec<RunRecord>,
    pub forecasts: Vec<ForecastPoint>,
    pub quotes: Vec<MarketQuote>,
    pub edge_results: Vec<EdgeResult>,
    pub risk_checks: Vec<StoredRiskCheck>,
    pub intents: Vec<OrderIntent>,
    pub results: Vec<OrderResult>,
}

/// What the store knows about an earlier attempt at an idempotency key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriorAttempt {
    pub status: OrderStatus,
    pub retryable: bool,
}

impl PriorAttempt {
    /// An unresolved attempt (`PENDING`, in flight elsewhere or left by a
    /// crash mid-dispatch) may already have reached the venue, so it
    /// consumes the key just like a non-retryable terminal one.
    pub fn consumes_key(&self) -> bool {
        self.status == OrderStatus::Pending || !self.retryable
    }
}

/// Outcome of claiming an idempotency key for dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// First attempt; the intent row was inserted as `PENDING`.
    Fresh,
    /// An earlier retryable attempt was reset to `PENDING`.
    Retry(PriorAttempt),
    /// The key is taken. Nothing was written.
    Consumed(PriorAttempt),
}

/// Signed change to the trading totals, applied on top of whatever is
/// stored at commit time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TradingDelta {
    /// Added to total exposure and, when `city` is set, to that city.
    pub exposure: f64,
    pub city: Option<String>,
    /// Realized loss to book against the current UTC day.
    pub loss: f64,
    pub cooldown: Option<(String, DateTime<Utc>)>,
}

/// Shared handle to the SQLite store.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn open(db_path: &str) -> Result<Self> {
        if let Some(parent) = Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        info!("Opened database: {}", db_path);
        Self::init(conn)
    }

    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;

        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (?1, ?2)",
            params![SCHEMA_VERSION, now],
        )?;
        conn.execute(
            "INSERT OR IGNORE INTO system_state
             (id, mode, paused, kill_switch, daily_loss, daily_loss_date, total_exposure, updated_at)
             VALUES (1, ?1, 0, 0, 0.0, NULL, 0.0, ?2)",
            params![ExecutionMode::DryRun.as_str(), now],
        )?;
        conn.execute("INSERT OR IGNORE INTO cycle_lease (id, holder, expires_at) VALUES (1, NULL, 0)", [])?;

        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Run `f` inside one SQLite write transaction; commits only if `f`
    /// succeeds. The write lock is taken up front, so reads made inside `f`
    /// cannot go stale before the commit.
    pub fn transaction<T>(
        &self,
        f: impl FnOnce(&Transaction<'_>) -> rusqlite::Result<T>,
    ) -> rusqlite::Result<T> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    #[cfg(test)]
    pub(crate) fn execute_raw(&self, sql: &str) -> rusqlite::Result<()> {
        self.conn.lock().execute_batch(sql)
    }

    // ----- cycle lease -----

    /// Take the cycle lease for `holder` until `expires_at`. Fails (returns
    /// false) while another holder's lease is unexpired; a lease left behind
    /// by a crashed process is taken over once it expires.
    pub fn acquire_cycle_lease(&self, holder: &str, now: DateTime<Utc>, expires_at: DateTime<Utc>) -> Result<bool> {
        let updated = self.conn.lock().execute(
            "UPDATE cycle_lease SET holder = ?1, expires_at = ?2
             WHERE id = 1 AND (holder IS NULL OR holder = ?1 OR expires_at <= ?3)",
            params![holder, expires_at.timestamp(), now.timestamp()],
        )?;
        Ok(updated == 1)
    }

    /// Release the lease if `holder` still owns it.
    pub fn release_cycle_lease(&self, holder: &str) -> Result<()> {
        self.conn.lock().execute(
            "UPDATE cycle_lease SET holder = NULL, expires_at = 0 WHERE id = 1 AND holder = ?1",
            params![holder],
        )?;
        Ok(())
    }

    // ----- runs -----

    pub fn insert_run(
        &self,
        run_id: &str,
        kind: RunKind,
        mode: ExecutionMode,
        config_fingerprint: &str,
        started_at: DateTime<Utc>,
    ) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO runs (run_id, kind, mode, config_fingerprint, status, started_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                run_id,
                kind.as_str(),
                mode.as_str(),
                config_fingerprint,
                RunStatus::Running.as_str(),
                started_at.to_rfc3339(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn finish_run(
        &self,
        id: i64,
        status: RunStatus,
        summary: &impl Serialize,
        finished_at: DateTime<Utc>,
    ) -> Result<()> {
        let summary_json = serde_json::to_string(summary)?;
        self.conn.lock().execute(
            "UPDATE runs SET status = ?1, summary_json = ?2, finished_at = ?3 WHERE id = ?4",
            params![status.as_str(), summary_json, finished_at.to_rfc3339(), id],
        )?;
        Ok(())
    }

    pub fn latest_run(&self) -> Result<Option<RunRecord>> {
        let conn = self.conn.lock();
        let run = conn
            .query_row(
                "SELECT id, run_id, kind, mode, config_fingerprint, status, summary_json, started_at, finished_at
                 FROM runs ORDER BY id DESC LIMIT 1",
                [],
                run_from_row,
            )
            .optional()?;
        Ok(run)
    }

    pub fn save_config_snapshot(&self, fingerprint: &str, config: &impl Serialize, now: DateTime<Utc>) -> Result<()> {
        let json = serde_json::to_string(config)?;
        self.conn.lock().execute(
            "INSERT OR IGNORE INTO config_snapshots (fingerprint, config_json, created_at) VALUES (?1, ?2, ?3)",
            params![fingerprint, json, now.to_rfc3339()],
        )?;
        Ok(())
    }

    // ----- per-cycle snapshots -----

    pub fn save_forecast(&self, run_id: &str, forecast: &ForecastPoint) -> Result<()> {
        let payload = serde_json::to_string(forecast)?;
        self.conn.lock().execute(
            "INSERT INTO forecast_snapshots
             (run_id, city, target_date, value, unit, source_generated_at, fetched_at, payload)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                run_id,
                forecast.city,
                forecast.target_date.to_string(),
                forecast.value,
                forecast.unit.symbol(),
                forecast.source_generated_at.to_rfc3339(),
                forecast.fetched_at.to_rfc3339(),
                payload,
            ],
        )?;
        Ok(())
    }

    pub fn save_quote(&self, run_id: &str, quote: &MarketQuote) -> Result<()> {
        let payload = serde_json::to_string(quote)?;
        self.conn.lock().execute(
            "INSERT INTO market_quotes
             (run_id, market_id, event_id, city, target_date, bucket_label, yes_price, best_bid, best_ask,
              accepting_orders, end_date, fetched_at, payload)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                run_id,
                quote.market_id,
                quote.event_id,
                quote.city,
                quote.target_date.to_string(),
                quote.bucket.label(),
                quote.yes_price,
                quote.best_bid,
                quote.best_ask,
                quote.accepting_orders,
                quote.end_date.to_rfc3339(),
                quote.fetched_at.to_rfc3339(),
                payload,
            ],
        )?;
        Ok(())
    }

    pub fn save_edge_result(&self, run_id: &str, result: &EdgeResult, now: DateTime<Utc>) -> Result<()> {
        let payload = serde_json::to_string(result)?;
        self.conn.lock().execute(
            "INSERT INTO edge_results
             (run_id, event_id, market_id, city, target_date, bucket_label, bucket_probability, market_price,
              gross_edge, net_edge, sigma_used, forecast_stale, reason_code, detail, payload, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            params![
                run_id,
                result.event_id,
                result.market_id,
                result.city,
                result.target_date.to_string(),
                result.bucket_label,
                result.bucket_probability,
                result.market_price,
                result.gross_edge,
                result.net_edge,
                result.sigma_used,
                result.forecast_stale,
                result.reason_code.as_str(),
                result.detail,
                payload,
                now.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// All ten check rows of a verdict, written together.
    pub fn save_risk_verdict(&self, run_id: &str, verdict: &RiskVerdict, now: DateTime<Utc>) -> Result<()> {
        let created_at = now.to_rfc3339();
        self.transaction(|tx| {
            let mut stmt = tx.prepare(
                "INSERT INTO risk_checks
                 (run_id, idempotency_key, check_order, check_name, passed, detail, approved, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )?;
            for (i, check) in verdict.checks.iter().enumerate() {
                stmt.execute(params![
                    run_id,
                    verdict.candidate_key,
                    i as i64 + 1,
                    check.check.name(),
                    check.passed,
                    check.detail,
                    verdict.approved,
                    created_at,
                ])?;
            }
            Ok(())
        })?;
        Ok(())
    }

    // ----- orders -----

    /// Claim `intent.idempotency_key` for dispatch. The lookup and the
    /// write share one write transaction, so two callers racing on the same
    /// key (in this process or another) see exactly one `Fresh` or `Retry`.
    /// A retry keeps the original intent row and resets it to `PENDING`.
    pub fn claim_intent(&self, intent: &OrderIntent) -> Result<Claim> {
        let claim = self.transaction(|tx| {
            match read_prior_attempt(tx, &intent.idempotency_key)? {
                Some(prior) if prior.consumes_key() => Ok(Claim::Consumed(prior)),
                Some(prior) => {
                    tx.execute(
                        "UPDATE order_intents SET status = ?1, retryable = 0, updated_at = ?2
                         WHERE idempotency_key = ?3",
                        params![
                            OrderStatus::Pending.as_str(),
                            intent.created_at.to_rfc3339(),
                            intent.idempotency_key
                        ],
                    )?;
                    Ok(Claim::Retry(prior))
                }
                None => {
                    insert_intent(tx, intent)?;
                    Ok(Claim::Fresh)
                }
            }
        })?;
        Ok(claim)
    }

    /// Append a result. A non-duplicate result also becomes the intent's
    /// current status.
    pub fn save_order_result(&self, run_id: &str, result: &OrderResult) -> Result<()> {
        self.transaction(|tx| {
            tx.execute(
                "INSERT INTO order_results
                 (run_id, idempotency_key, status, fill_price, fill_size, venue_order_id, error_message, retryable, executed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    run_id,
                    result.idempotency_key,
                    result.status.as_str(),
                    result.fill_price,
                    result.fill_size,
                    result.venue_order_id,
                    result.error_message,
                    result.retryable,
                    result.executed_at.to_rfc3339(),
                ],
            )?;
            if result.status != OrderStatus::Duplicate {
                tx.execute(
                    "UPDATE order_intents SET status = ?1, retryable = ?2, updated_at = ?3 WHERE idempotency_key = ?4",
                    params![
                        result.status.as_str(),
                        result.retryable,
                        result.executed_at.to_rfc3339(),
                        result.idempotency_key,
                    ],
                )?;
            }
            Ok(())
        })?;
        Ok(())
    }

    pub fn order_results_for_key(&self, idempotency_key: &str) -> Result<Vec<OrderResult>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT idempotency_key, status, fill_price, fill_size, venue_order_id, error_message, retryable, executed_at
             FROM order_results WHERE idempotency_key = ?1 ORDER BY id",
        )?;
        let results = stmt
            .query_map(params![idempotency_key], result_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(results)
    }

    // ----- state -----

    pub fn load_system_state(&self) -> Result<SystemState> {
        let conn = self.conn.lock();
        Ok(read_system_state(&conn)?)
    }

    /// Current kill switch flag as persisted, bypassing any in-memory copy.
    pub fn kill_switch_active(&self) -> Result<bool> {
        let active = self.conn.lock().query_row(
            "SELECT kill_switch FROM system_state WHERE id = 1",
            [],
            |row| row.get(0),
        )?;
        Ok(active)
    }

    pub fn load_open_positions(&self) -> Result<Vec<Position>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, idempotency_key, market_id, city, target_date, bucket_label, entry_price, size_usd, shares,
                    current_price, status, opened_at, closed_at, realized_pnl
             FROM positions WHERE status = 'open' ORDER BY id",
        )?;
        let positions = stmt
            .query_map([], position_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(positions)
    }

    pub fn operator_commands(&self) -> Result<Vec<OperatorCommand>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT command, value, source, created_at FROM operator_commands ORDER BY id")?;
        let commands = stmt
            .query_map([], |row| {
                Ok(OperatorCommand {
                    command: row.get(0)?,
                    value: row.get(1)?,
                    source: row.get(2)?,
                    created_at: ts(row, 3)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(commands)
    }

    // ----- audit -----

    pub fn run_audit(&self, run_id: &str) -> Result<RunAudit> {
        let conn = self.conn.lock();

        let runs = conn
            .prepare(
                "SELECT id, run_id, kind, mode, config_fingerprint, status, summary_json, started_at, finished_at
                 FROM runs WHERE run_id = ?1 ORDER BY id",
            )?
            .query_map(params![run_id], run_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let forecasts = payloads(&conn, "SELECT payload FROM forecast_snapshots WHERE run_id = ?1 ORDER BY id", run_id)?;
        let quotes = payloads(&conn, "SELECT payload FROM market_quotes WHERE run_id = ?1 ORDER BY id", run_id)?;
        let edge_results = payloads(&conn, "SELECT payload FROM edge_results WHERE run_id = ?1 ORDER BY id", run_id)?;

        let risk_checks = conn
            .prepare(
                "SELECT idempotency_key, check_name, passed, detail, approved
                 FROM risk_checks WHERE run_id = ?1 ORDER BY id",
            )?
            .query_map(params![run_id], |row| {
                Ok(StoredRiskCheck {
                    idempotency_key: row.get(0)?,
                    check: parsed(row, 1, RiskCheck::parse)?,
                    passed: row.get(2)?,
                    detail: row.get(3)?,
                    approved: row.get(4)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let intents = conn
            .prepare(
                "SELECT run_id, idempotency_key, market_id, city, target_date, bucket_label, side, price, size_usd,
                        net_edge, best_bid, best_ask, end_date, status, created_at
                 FROM order_intents WHERE run_id = ?1 ORDER BY id",
            )?
            .query_map(params![run_id], intent_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let results = conn
            .prepare(
                "SELECT idempotency_key, status, fill_price, fill_size, venue_order_id, error_message, retryable, executed_at
                 FROM order_results WHERE run_id = ?1 ORDER BY id",
            )?
            .query_map(params![run_id], result_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(RunAudit {
            runs,
            forecasts,
            quotes,
            edge_results,
            risk_checks,
            intents,
            results,
        })
    }
}

// ----- writes used inside state transitions -----

/// Apply `delta` to the stored exposure, daily loss and cooldowns. Totals
/// are read and updated in place, never overwritten from a caller's copy,
/// and operator flags are left untouched.
pub(crate) fn apply_trading_delta(conn: &Connection, delta: &TradingDelta, now: DateTime<Utc>) -> rusqlite::Result<()> {
    let today = now.date_naive().to_string();
    let loss = delta.loss.abs();
    conn.execute(
        "UPDATE system_state
         SET total_exposure = MAX(total_exposure + ?1, 0.0),
             daily_loss = CASE
                 WHEN ?2 = 0.0 THEN daily_loss
                 WHEN daily_loss_date = ?3 THEN daily_loss + ?2
                 ELSE ?2
             END,
             daily_loss_date = CASE WHEN ?2 = 0.0 THEN daily_loss_date ELSE ?3 END,
             updated_at = ?4
         WHERE id = 1",
        params![delta.exposure, loss, today, now.to_rfc3339()],
    )?;

    if let Some(city) = &delta.city {
        conn.execute(
            "INSERT INTO city_exposure (city, exposure) VALUES (?1, ?2)
             ON CONFLICT(city) DO UPDATE SET exposure = exposure + excluded.exposure",
            params![city, delta.exposure],
        )?;
        conn.execute(
            "DELETE FROM city_exposure WHERE city = ?1 AND exposure <= ?2",
            params![city, EXPOSURE_EPSILON],
        )?;
    }

    if let Some((market_id, at)) = &delta.cooldown {
        conn.execute(
            "INSERT INTO market_cooldowns (market_id, last_trade_at) VALUES (?1, ?2)
             ON CONFLICT(market_id) DO UPDATE SET last_trade_at = excluded.last_trade_at",
            params![market_id, at.to_rfc3339()],
        )?;
    }
    Ok(())
}

pub(crate) fn write_paused(conn: &Connection, paused: bool, now: DateTime<Utc>) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE system_state SET paused = ?1, updated_at = ?2 WHERE id = 1",
        params![paused, now.to_rfc3339()],
    )?;
    Ok(())
}

pub(crate) fn write_kill_switch(conn: &Connection, active: bool, now: DateTime<Utc>) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE system_state SET kill_switch = ?1, updated_at = ?2 WHERE id = 1",
        params![active, now.to_rfc3339()],
    )?;
    Ok(())
}

pub(crate) fn write_mode(conn: &Connection, mode: ExecutionMode, now: DateTime<Utc>) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE system_state SET mode = ?1, updated_at = ?2 WHERE id = 1",
        params![mode.as_str(), now.to_rfc3339()],
    )?;
    Ok(())
}

pub(crate) fn insert_position(conn: &Connection, pos: &Position) -> rusqlite::Result<i64> {
    conn.execute(
        "INSERT INTO positions
         (idempotency_key, market_id, city, target_date, bucket_label, entry_price, size_usd, shares,
          current_price, status, opened_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            pos.idempotency_key,
            pos.market_id,
            pos.city,
            pos.target_date.to_string(),
            pos.bucket_label,
            pos.entry_price,
            pos.size_usd,
            pos.shares,
            pos.current_price,
            pos.status.as_str(),
            pos.opened_at.to_rfc3339(),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub(crate) fn update_position_price(conn: &Connection, id: i64, price: f64) -> rusqlite::Result<()> {
    conn.execute("UPDATE positions SET current_price = ?1 WHERE id = ?2", params![price, id])?;
    Ok(())
}

pub(crate) fn close_position(
    conn: &Connection,
    id: i64,
    exit_price: f64,
    realized_pnl: f64,
    closed_at: DateTime<Utc>,
) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE positions SET status = 'closed', current_price = ?1, realized_pnl = ?2, closed_at = ?3 WHERE id = ?4",
        params![exit_price, realized_pnl, closed_at.to_rfc3339(), id],
    )?;
    Ok(())
}

pub(crate) fn insert_operator_command(
    conn: &Connection,
    command: &str,
    value: &str,
    source: &str,
    now: DateTime<Utc>,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO operator_commands (command, value, source, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![command, value, source, now.to_rfc3339()],
    )?;
    Ok(())
}

fn insert_intent(conn: &Connection, intent: &OrderIntent) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO order_intents
         (run_id, idempotency_key, market_id, city, target_date, bucket_label, side, price, size_usd,
          net_edge, best_bid, best_ask, end_date, status, retryable, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, 0, ?15, ?15)",
        params![
            intent.run_id,
            intent.idempotency_key,
            intent.market_id,
            intent.city,
            intent.target_date.to_string(),
            intent.bucket_label,
            intent.side.as_str(),
            intent.price,
            intent.size_usd,
            intent.net_edge,
            intent.best_bid,
            intent.best_ask,
            intent.end_date.to_rfc3339(),
            OrderStatus::Pending.as_str(),
            intent.created_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

fn read_prior_attempt(conn: &Connection, idempotency_key: &str) -> rusqlite::Result<Option<PriorAttempt>> {
    conn.query_row(
        "SELECT status, retryable FROM order_intents WHERE idempotency_key = ?1",
        params![idempotency_key],
        |row| {
            Ok(PriorAttempt {
                status: parsed(row, 0, OrderStatus::parse)?,
                retryable: row.get(1)?,
            })
        },
    )
    .optional()
}

pub(crate) fn read_system_state(conn: &Connection) -> rusqlite::Result<SystemState> {
    let mut state = conn.query_row(
        "SELECT mode, paused, kill_switch, daily_loss, daily_loss_date, total_exposure FROM system_state WHERE id = 1",
        [],
        |row| {
            Ok(SystemState {
                mode: parsed(row, 0, ExecutionMode::parse)?,
                paused: row.get(1)?,
                kill_switch: row.get(2)?,
                daily_loss: row.get(3)?,
                daily_loss_date: opt_date(row, 4)?,
                total_exposure: row.get(5)?,
                city_exposure: BTreeMap::new(),
                last_trade_at: BTreeMap::new(),
            })
        },
    )?;

    state.city_exposure = conn
        .prepare("SELECT city, exposure FROM city_exposure")?
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?)))?
        .collect::<rusqlite::Result<BTreeMap<_, _>>>()?;

    state.last_trade_at = conn
        .prepare("SELECT market_id, last_trade_at FROM market_cooldowns")?
        .query_map([], |row| Ok((row.get::<_, String>(0)?, ts(row, 1)?)))?
        .collect::<rusqlite::Result<BTreeMap<_, _>>>()?;

    Ok(state)
}

// ----- row decoding -----

fn conversion_error(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, message.into())
}

fn ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, format!("bad timestamp '{}': {}", raw, e)))
}

fn opt_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| conversion_error(idx, format!("bad timestamp '{}': {}", s, e)))
    })
    .transpose()
}

fn date(row: &Row<'_>, idx: usize) -> rusqlite::Result<NaiveDate> {
    let raw: String = row.get(idx)?;
    raw.parse()
        .map_err(|e| conversion_error(idx, format!("bad date '{}': {}", raw, e)))
}

fn opt_date(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<NaiveDate>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| {
        s.parse()
            .map_err(|e| conversion_error(idx, format!("bad date '{}': {}", s, e)))
    })
    .transpose()
}

fn parsed<T>(row: &Row<'_>, idx: usize, parse: fn(&str) -> Option<T>) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    parse(&raw).ok_or_else(|| conversion_error(idx, format!("unknown value '{}'", raw)))
}

fn payloads<T: DeserializeOwned>(conn: &Connection, sql: &str, run_id: &str) -> rusqlite::Result<Vec<T>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params![run_id], |row| {
            let raw: String = row.get(0)?;
            serde_json::from_str(&raw).map_err(|e| conversion_error(0, e.to_string()))
        })?
        .collect::<rusqlite::Result<Vec<T>>>()?;
    Ok(rows)
}

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<RunRecord> {
    Ok(RunRecord {
        id: row.get(0)?,
        run_id: row.get(1)?,
        kind: parsed(row, 2, RunKind::parse)?,
        mode: row.get(3)?,
        config_fingerprint: row.get(4)?,
        status: parsed(row, 5, RunStatus::parse)?,
        summary_json: row.get(6)?,
        started_at: ts(row, 7)?,
        finished_at: opt_ts(row, 8)?,
    })
}

fn intent_from_row(row: &Row<'_>) -> rusqlite::Result<OrderIntent> {
    Ok(OrderIntent {
        run_id: row.get(0)?,
        idempotency_key: row.get(1)?,
        market_id: row.get(2)?,
        city: row.get(3)?,
        target_date: date(row, 4)?,
        bucket_label: row.get(5)?,
        side: parsed(row, 6, Side::parse)?,
        price: row.get(7)?,
        size_usd: row.get(8)?,
        net_edge: row.get(9)?,
        best_bid: row.get(10)?,
        best_ask: row.get(11)?,
        end_date: ts(row, 12)?,
        status: parsed(row, 13, OrderStatus::parse)?,
        created_at: ts(row, 14)?,
    })
}

fn result_from_row(row: &Row<'_>) -> rusqlite::Result<OrderResult> {
    Ok(OrderResult {
        idempotency_key: row.get(0)?,
        status: parsed(row, 1, OrderStatus::parse)?,
        fill_price: row.get(2)?,
        fill_size: row.get(3)?,
        venue_order_id: row.get(4)?,
        error_message: row.get(5)?,
        retryable: row.get(6)?,
        executed_at: ts(row, 7)?,
    })
}

fn position_from_row(row: &Row<'_>) -> rusqlite::Result<Position> {
    Ok(Position {
        id: Some(row.get(0)?),
        idempotency_key: row.get(1)?,
        market_id: row.get(2)?,
        city: row.get(3)?,
        target_date: date(row, 4)?,
        bucket_label: row.get(5)?,
        entry_price: row.get(6)?,
        size_usd: row.get(7)?,
        shares: row.get(8)?,
        current_price: row.get(9)?,
        status: parsed(row, 10, PositionStatus::parse)?,
        opened_at: ts(row, 11)?,
        closed_at: opt_ts(row, 12)?,
        realized_pnl: row.get(13)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 17, 12, 0, 0).unwrap()
    }

    fn intent(key: &str) -> OrderIntent {
        OrderIntent {
            run_id: "run-1".to_string(),
            idempotency_key: key.to_string(),
            market_id: "m-1".to_string(),
            city: "nyc".to_string(),
            target_date: NaiveDate::from_ymd_opt(2026, 2, 18).unwrap(),
            bucket_label: "48°F or higher".to_string(),
            side: Side::Buy,
            price: 0.10,
            size_usd: 5.0,
            net_edge: 0.6,
            best_bid: 0.099,
            best_ask: 0.100,
            end_date: now() + Duration::hours(30),
            status: OrderStatus::Pending,
            created_at: now(),
        }
    }

    #[test]
    fn test_fresh_database_has_safe_defaults() {
        let db = Database::in_memory().unwrap();
        let state = db.load_system_state().unwrap();
        assert_eq!(state, SystemState::default());
        assert!(!db.kill_switch_active().unwrap());
        assert!(db.load_open_positions().unwrap().is_empty());
    }

    fn intent_status(db: &Database, key: &str) -> OrderStatus {
        db.run_audit("run-1")
            .unwrap()
            .intents
            .into_iter()
            .find(|i| i.idempotency_key == key)
            .unwrap()
            .status
    }

    #[test]
    fn test_intent_and_result_lifecycle() {
        let db = Database::in_memory().unwrap();
        assert_eq!(db.claim_intent(&intent("k1")).unwrap(), Claim::Fresh);
        assert_eq!(intent_status(&db, "k1"), OrderStatus::Pending);

        let failed = OrderResult::new("k1", OrderStatus::Failed, now()).with_error("timeout");
        db.save_order_result("run-1", &failed).unwrap();

        // Retrying keeps the original row
        assert_eq!(
            db.claim_intent(&intent("k1")).unwrap(),
            Claim::Retry(PriorAttempt { status: OrderStatus::Failed, retryable: true })
        );
        assert_eq!(intent_status(&db, "k1"), OrderStatus::Pending);

        let filled = OrderResult::new("k1", OrderStatus::Filled, now()).with_fill(0.10, 50.0);
        db.save_order_result("run-1", &filled).unwrap();
        let dup = OrderResult::new("k1", OrderStatus::Duplicate, now());
        db.save_order_result("run-1", &dup).unwrap();

        assert_eq!(
            db.claim_intent(&intent("k1")).unwrap(),
            Claim::Consumed(PriorAttempt { status: OrderStatus::Filled, retryable: false })
        );
        assert_eq!(intent_status(&db, "k1"), OrderStatus::Filled);
        let statuses: Vec<_> = db
            .order_results_for_key("k1")
            .unwrap()
            .into_iter()
            .map(|r| r.status)
            .collect();
        assert_eq!(statuses, vec![OrderStatus::Failed, OrderStatus::Filled, OrderStatus::Duplicate]);
    }

    #[test]
    fn test_unresolved_claim_blocks_other_handles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.db");
        let path = path.to_str().unwrap();
        let first = Database::open(path).unwrap();
        let second = Database::open(path).unwrap();

        assert_eq!(first.claim_intent(&intent("k1")).unwrap(), Claim::Fresh);
        assert_eq!(
            second.claim_intent(&intent("k1")).unwrap(),
            Claim::Consumed(PriorAttempt { status: OrderStatus::Pending, retryable: false })
        );
        assert_eq!(first.run_audit("run-1").unwrap().intents.len(), 1);
    }

    #[test]
    fn test_cycle_lease_is_exclusive_until_released_or_expired() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.db");
        let path = path.to_str().unwrap();
        let cron = Database::open(path).unwrap();
        let operator = Database::open(path).unwrap();
        let expires = now() + Duration::hours(1);

        assert!(cron.acquire_cycle_lease("cron", now(), expires).unwrap());
        assert!(!operator.acquire_cycle_lease("operator", now(), expires).unwrap());

        // Only the holder can release
        operator.release_cycle_lease("operator").unwrap();
        assert!(!operator.acquire_cycle_lease("operator", now(), expires).unwrap());

        cron.release_cycle_lease("cron").unwrap();
        assert!(operator.acquire_cycle_lease("operator", now(), expires).unwrap());

        // A lease abandoned by a crashed holder lapses
        let later = expires + Duration::seconds(1);
        assert!(cron.acquire_cycle_lease("cron", later, later + Duration::hours(1)).unwrap());
    }

    #[test]
    fn test_result_requires_intent() {
        let db = Database::in_memory().unwrap();
        let orphan = OrderResult::new("missing", OrderStatus::Filled, now());
        assert!(db.save_order_result("run-1", &orphan).is_err());
    }

    fn delta(city: &str, exposure: f64, loss: f64) -> TradingDelta {
        TradingDelta {
            exposure,
            city: Some(city.to_string()),
            loss,
            cooldown: None,
        }
    }

    #[test]
    fn test_trading_deltas_accumulate_on_stored_values() {
        let db = Database::in_memory().unwrap();
        db.transaction(|tx| {
            apply_trading_delta(tx, &delta("nyc", 7.5, 0.0), now())?;
            apply_trading_delta(tx, &delta("chicago", 5.0, 3.0), now())?;
            apply_trading_delta(
                tx,
                &TradingDelta {
                    cooldown: Some(("m-1".to_string(), now())),
                    ..TradingDelta::default()
                },
                now(),
            )?;
            write_paused(tx, true, now())
        })
        .unwrap();

        let mut expected = SystemState::default();
        expected.paused = true;
        expected.total_exposure = 12.5;
        expected.daily_loss = 3.0;
        expected.daily_loss_date = Some(now().date_naive());
        expected.city_exposure.insert("nyc".to_string(), 7.5);
        expected.city_exposure.insert("chicago".to_string(), 5.0);
        expected.last_trade_at.insert("m-1".to_string(), now());
        assert_eq!(db.load_system_state().unwrap(), expected);

        // Releasing a city removes its row and keeps the stored flags
        db.transaction(|tx| apply_trading_delta(tx, &delta("chicago", -5.0, 0.0), now()))
            .unwrap();
        let stored = db.load_system_state().unwrap();
        assert_eq!(stored.city_exposure.len(), 1);
        assert_eq!(stored.total_exposure, 7.5);
        assert!(stored.paused);

        // A loss on a new UTC day starts a fresh total
        let tomorrow = now() + Duration::days(1);
        db.transaction(|tx| apply_trading_delta(tx, &delta("nyc", 0.0, 1.5), tomorrow))
            .unwrap();
        let stored = db.load_system_state().unwrap();
        assert_eq!(stored.daily_loss, 1.5);
        assert_eq!(stored.daily_loss_date, Some(tomorrow.date_naive()));
    }

    #[test]
    fn test_run_audit_collects_rows_for_one_run() {
        let db = Database::in_memory().unwrap();
        let id = db
            .insert_run("run-1", RunKind::Scan, ExecutionMode::DryRun, "abc", now())
            .unwrap();
        db.insert_run("run-2", RunKind::Scan, ExecutionMode::DryRun, "abc", now())
            .unwrap();
        db.claim_intent(&intent("k1")).unwrap();
        db.save_order_result("run-1", &OrderResult::new("k1", OrderStatus::DryRun, now()))
            .unwrap();
        db.finish_run(id, RunStatus::Completed, &serde_json::json!({"executed": 1}), now())
            .unwrap();

        let audit = db.run_audit("run-1").unwrap();
        assert_eq!(audit.runs.len(), 1);
        assert_eq!(audit.runs[0].status, RunStatus::Completed);
        assert_eq!(audit.intents.len(), 1);
        assert_eq!(audit.intents[0], {
            let mut expected = intent("k1");
            expected.status = OrderStatus::DryRun;
            expected
        });
        assert_eq!(audit.results.len(), 1);
        assert!(db.run_audit("run-2").unwrap().intents.is_empty());
        assert_eq!(db.latest_run().unwrap().unwrap().run_id, "run-2");
    }

    #[test]
    fn test_open_on_disk_creates_parent_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("engine.db");
        let db = Database::open(path.to_str().unwrap()).unwrap();
        assert!(!db.kill_switch_active().unwrap());
        assert!(path.exists());
    }
}

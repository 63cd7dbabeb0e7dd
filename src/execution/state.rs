//! Process-wide trading state and its only mutator.
//!
//! Each transition applies its change as a delta on the stored values inside
//! one transaction, re-reads the result, and only then replaces the in-memory
//! copy. Trackers in other processes sharing the file never overwrite each
//! other, and a failed write leaves memory exactly as it was.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::config::ExecutionMode;
use crate::error::{EngineError, Result};
use crate::execution::persistence::{self, Database, TradingDelta};
use crate::execution::types::Position;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemState {
    pub mode: ExecutionMode,
    pub paused: bool,
    pub kill_switch: bool,
    /// Realized loss accumulated on `daily_loss_date` (positive number).
    pub daily_loss: f64,
    pub daily_loss_date: Option<NaiveDate>,
    pub total_exposure: f64,
    pub city_exposure: BTreeMap<String, f64>,
    /// Last trade per market, for the cooldown check.
    pub last_trade_at: BTreeMap<String, DateTime<Utc>>,
}

impl Default for SystemState {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::DryRun,
            paused: false,
            kill_switch: false,
            daily_loss: 0.0,
            daily_loss_date: None,
            total_exposure: 0.0,
            city_exposure: BTreeMap::new(),
            last_trade_at: BTreeMap::new(),
        }
    }
}

impl SystemState {
    /// Daily loss as of `now`; a loss booked on an earlier UTC date reads as zero.
    pub fn daily_loss_on(&self, now: DateTime<Utc>) -> f64 {
        match self.daily_loss_date {
            Some(date) if date == now.date_naive() => self.daily_loss,
            _ => 0.0,
        }
    }
}

/// Read-only view handed to the risk engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateSnapshot {
    pub mode: ExecutionMode,
    pub paused: bool,
    pub kill_switch: bool,
    pub trades_this_run: u32,
    pub total_exposure: f64,
    pub city_exposure: BTreeMap<String, f64>,
    pub daily_loss: f64,
    pub last_trade_at: BTreeMap<String, DateTime<Utc>>,
}

impl StateSnapshot {
    pub fn city_exposure(&self, city: &str) -> f64 {
        self.city_exposure.get(city).copied().unwrap_or(0.0)
    }

    pub fn last_trade_at(&self, market_id: &str) -> Option<DateTime<Utc>> {
        self.last_trade_at.get(market_id).copied()
    }
}

pub struct StateTracker {
    db: Arc<Database>,
    state: SystemState,
    positions: Vec<Position>,
    trades_this_run: u32,
}

impl StateTracker {
    /// Load state and open positions from the store. A fresh store yields
    /// the safe defaults.
    pub fn hydrate(db: Arc<Database>) -> Result<Self> {
        let state = db.load_system_state()?;
        let positions = db.load_open_positions()?;
        info!(
            "State hydrated: mode={} paused={} kill_switch={} exposure=${:.2} open_positions={}",
            state.mode,
            state.paused,
            state.kill_switch,
            state.total_exposure,
            positions.len()
        );
        Ok(Self {
            db,
            state,
            positions,
            trades_this_run: 0,
        })
    }

    /// Re-read persisted state, picking up changes made by other processes.
    pub fn reload(&mut self) -> Result<()> {
        self.state = self.db.load_system_state()?;
        self.positions = self.db.load_open_positions()?;
        Ok(())
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn state(&self) -> &SystemState {
        &self.state
    }

    pub fn positions(&self) -> &[Position] {
        &self.positions
    }

    pub fn mode(&self) -> ExecutionMode {
        self.state.mode
    }

    pub fn is_paused(&self) -> bool {
        self.state.paused
    }

    pub fn is_kill_switch_active(&self) -> bool {
        self.state.kill_switch
    }

    pub fn total_exposure(&self) -> f64 {
        self.state.total_exposure
    }

    pub fn city_exposure(&self, city: &str) -> f64 {
        self.state.city_exposure.get(city).copied().unwrap_or(0.0)
    }

    pub fn daily_loss(&self, now: DateTime<Utc>) -> f64 {
        self.state.daily_loss_on(now)
    }

    pub fn last_trade_at(&self, market_id: &str) -> Option<DateTime<Utc>> {
        self.state.last_trade_at.get(market_id).copied()
    }

    pub fn trades_this_run(&self) -> u32 {
        self.trades_this_run
    }

    pub fn begin_run(&mut self) {
        self.trades_this_run = 0;
    }

    pub fn count_trade(&mut self) {
        self.trades_this_run += 1;
    }

    pub fn snapshot(&self, now: DateTime<Utc>) -> StateSnapshot {
        StateSnapshot {
            mode: self.state.mode,
            paused: self.state.paused,
            kill_switch: self.state.kill_switch,
            trades_this_run: self.trades_this_run,
            total_exposure: self.state.total_exposure,
            city_exposure: self.state.city_exposure.clone(),
            daily_loss: self.state.daily_loss_on(now),
            last_trade_at: self.state.last_trade_at.clone(),
        }
    }

    // ----- transitions -----

    /// A buy filled: open the position and add its cost to exposure.
    pub fn record_fill(&mut self, mut position: Position, now: DateTime<Utc>) -> Result<i64> {
        let delta = TradingDelta {
            exposure: position.size_usd,
            city: Some(position.city.clone()),
            loss: 0.0,
            cooldown: Some((position.market_id.clone(), position.opened_at)),
        };
        let id = self.commit("record_fill", &delta, now, |tx| persistence::insert_position(tx, &position))?;
        position.id = Some(id);

        info!(
            "Fill recorded: {} {} ${:.2} (exposure ${:.2})",
            position.city, position.bucket_label, position.size_usd, self.state.total_exposure
        );
        self.positions.push(position);
        Ok(id)
    }

    /// An order that did not fill still consumes the market's cooldown, never exposure.
    pub fn record_cooldown(&mut self, market_id: &str, at: DateTime<Utc>) -> Result<()> {
        let delta = TradingDelta {
            cooldown: Some((market_id.to_string(), at)),
            ..TradingDelta::default()
        };
        self.commit("record_cooldown", &delta, at, |_| Ok(()))
    }

    /// Book a realized loss against today's limit.
    pub fn record_loss(&mut self, amount: f64, now: DateTime<Utc>) -> Result<()> {
        let delta = TradingDelta {
            loss: amount.abs(),
            ..TradingDelta::default()
        };
        self.commit("record_loss", &delta, now, |_| Ok(()))?;
        warn!("Loss recorded: ${:.2} (today ${:.2})", amount.abs(), self.state.daily_loss);
        Ok(())
    }

    pub fn set_paused(&mut self, paused: bool, source: &str, now: DateTime<Utc>) -> Result<()> {
        let command = if paused { "pause" } else { "resume" };
        self.commit_command("set_paused", (command, &paused.to_string(), source), now, |tx| {
            persistence::write_paused(tx, paused, now)
        })?;
        info!("System {} by {}", if paused { "paused" } else { "resumed" }, source);
        self.state.paused = paused;
        Ok(())
    }

    pub fn set_kill_switch(&mut self, active: bool, source: &str, now: DateTime<Utc>) -> Result<()> {
        self.commit_command("set_kill_switch", ("kill_switch", &active.to_string(), source), now, |tx| {
            persistence::write_kill_switch(tx, active, now)
        })?;
        if active {
            warn!("Kill switch ACTIVATED by {}", source);
        } else {
            info!("Kill switch released by {}", source);
        }
        self.state.kill_switch = active;
        Ok(())
    }

    pub fn set_mode(&mut self, mode: ExecutionMode, source: &str, now: DateTime<Utc>) -> Result<()> {
        self.commit_command("set_mode", ("mode", mode.as_str(), source), now, |tx| {
            persistence::write_mode(tx, mode, now)
        })?;
        info!("Mode set to {} by {}", mode, source);
        self.state.mode = mode;
        Ok(())
    }

    /// Mark-to-market refresh of an open position.
    pub fn mark_position(&mut self, position_id: i64, price: f64) -> Result<()> {
        let Some(index) = self.position_index(position_id) else {
            return Ok(());
        };
        self.db
            .transaction(|tx| persistence::update_position_price(tx, position_id, price))
            .map_err(|source| persistence_failure("mark_position", source))?;
        self.positions[index].current_price = price;
        Ok(())
    }

    /// Close an open position at `exit_price`, release its exposure and book
    /// any loss. Returns realized P&L, or `None` if the position is unknown.
    pub fn close_position(&mut self, position_id: i64, exit_price: f64, now: DateTime<Utc>) -> Result<Option<f64>> {
        let Some(index) = self.position_index(position_id) else {
            return Ok(None);
        };
        let position = self.positions[index].clone();
        let pnl = position.shares * exit_price - position.size_usd;

        let delta = TradingDelta {
            exposure: -position.size_usd,
            city: Some(position.city.clone()),
            loss: if pnl < 0.0 { -pnl } else { 0.0 },
            cooldown: Some((position.market_id.clone(), now)),
        };
        self.commit("close_position", &delta, now, |tx| {
            persistence::close_position(tx, position_id, exit_price, pnl, now)
        })?;

        info!(
            "Position closed: {} {} @ ${:.4}, realized P&L ${:.2}",
            position.city, position.bucket_label, exit_price, pnl
        );
        self.positions.remove(index);
        Ok(Some(pnl))
    }

    fn position_index(&self, position_id: i64) -> Option<usize> {
        self.positions.iter().position(|p| p.id == Some(position_id))
    }

    /// Apply `delta` plus `extra` writes, then adopt the stored state.
    fn commit<T>(
        &mut self,
        transition: &'static str,
        delta: &TradingDelta,
        now: DateTime<Utc>,
        extra: impl FnOnce(&rusqlite::Transaction<'_>) -> rusqlite::Result<T>,
    ) -> Result<T> {
        let (out, next) = self
            .db
            .transaction(|tx| {
                let out = extra(tx)?;
                persistence::apply_trading_delta(tx, delta, now)?;
                Ok((out, persistence::read_system_state(tx)?))
            })
            .map_err(|source| persistence_failure(transition, source))?;
        self.state = next;
        Ok(out)
    }

    /// Persist one operator flag together with its command audit row.
    fn commit_command(
        &self,
        transition: &'static str,
        audit: (&str, &str, &str),
        now: DateTime<Utc>,
        write: impl FnOnce(&rusqlite::Transaction<'_>) -> rusqlite::Result<()>,
    ) -> Result<()> {
        let (command, value, source) = audit;
        self.db
            .transaction(|tx| {
                persistence::insert_operator_command(tx, command, value, source, now)?;
                write(tx)
            })
            .map_err(|source| persistence_failure(transition, source))
    }
}

fn persistence_failure(transition: &'static str, source: rusqlite::Error) -> EngineError {
    error!("State transition '{}' failed to persist: {}", transition, source);
    EngineError::StatePersistence { transition, source }
}

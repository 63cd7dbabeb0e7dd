use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::RiskConfig;
use crate::execution::state::StateSnapshot;
use crate::execution::types::OrderIntent;

/// The mandatory checks, in evaluation and reporting order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskCheck {
    KillSwitch,
    Paused,
    PositionSize,
    TradesPerRun,
    TotalExposure,
    PerCityExposure,
    DailyLoss,
    Cooldown,
    TimeToResolution,
    Slippage,
}

impl RiskCheck {
    pub const ALL: [RiskCheck; 10] = [
        RiskCheck::KillSwitch,
        RiskCheck::Paused,
        RiskCheck::PositionSize,
        RiskCheck::TradesPerRun,
        RiskCheck::TotalExposure,
        RiskCheck::PerCityExposure,
        RiskCheck::DailyLoss,
        RiskCheck::Cooldown,
        RiskCheck::TimeToResolution,
        RiskCheck::Slippage,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            RiskCheck::KillSwitch => "kill_switch",
            RiskCheck::Paused => "paused",
            RiskCheck::PositionSize => "position_size",
            RiskCheck::TradesPerRun => "trades_per_run",
            RiskCheck::TotalExposure => "total_exposure",
            RiskCheck::PerCityExposure => "per_city_exposure",
            RiskCheck::DailyLoss => "daily_loss",
            RiskCheck::Cooldown => "cooldown",
            RiskCheck::TimeToResolution => "time_to_resolution",
            RiskCheck::Slippage => "slippage",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.name() == s)
    }
}

impl std::fmt::Display for RiskCheck {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskCheckResult {
    pub check: RiskCheck,
    pub passed: bool,
    pub detail: String,
}

impl RiskCheckResult {
    fn pass(check: RiskCheck, detail: String) -> Self {
        Self { check, passed: true, detail }
    }

    fn fail(check: RiskCheck, detail: String) -> Self {
        Self { check, passed: false, detail }
    }

    fn from_bool(check: RiskCheck, passed: bool, detail: String) -> Self {
        Self { check, passed, detail }
    }
}

/// Complete risk decision for one candidate: always one result per
/// [`RiskCheck`], in [`RiskCheck::ALL`] order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskVerdict {
    pub candidate_key: String,
    pub checks: [RiskCheckResult; 10],
    pub approved: bool,
}

impl RiskVerdict {
    pub fn failed_checks(&self) -> impl Iterator<Item = RiskCheck> + '_ {
        self.checks.iter().filter(|c| !c.passed).map(|c| c.check)
    }

    pub fn failure_summary(&self) -> String {
        self.checks
            .iter()
            .filter(|c| !c.passed)
            .map(|c| format!("{}: {}", c.check, c.detail))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Capital-protection gate. Pure: no I/O, no errors, no short-circuit.
#[derive(Debug, Clone)]
pub struct RiskEngine {
    config: RiskConfig,
}

impl RiskEngine {
    pub fn new(config: RiskConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    /// Run every check against `candidate` and `state`.
    pub fn evaluate(&self, candidate: &OrderIntent, state: &StateSnapshot, now: DateTime<Utc>) -> RiskVerdict {
        let checks = RiskCheck::ALL.map(|check| self.run_check(check, candidate, state, now));
        let approved = checks.iter().all(|c| c.passed);

        let verdict = RiskVerdict {
            candidate_key: candidate.idempotency_key.clone(),
            checks,
            approved,
        };

        if approved {
            info!("Risk approved: {} {}", candidate.city, candidate.bucket_label);
        } else {
            warn!(
                "Risk blocked: {} {} -> {}",
                candidate.city,
                candidate.bucket_label,
                verdict.failure_summary()
            );
        }
        verdict
    }

    fn run_check(
        &self,
        check: RiskCheck,
        candidate: &OrderIntent,
        state: &StateSnapshot,
        now: DateTime<Utc>,
    ) -> RiskCheckResult {
        let cfg = &self.config;
        let size = candidate.size_usd;
        let size_valid = size.is_finite() && size >= 0.0;

        match check {
            RiskCheck::KillSwitch => {
                if state.kill_switch {
                    RiskCheckResult::fail(check, "kill switch is active".to_string())
                } else {
                    RiskCheckResult::pass(check, "ok".to_string())
                }
            }
            RiskCheck::Paused => {
                if state.paused {
                    RiskCheckResult::fail(check, "system is paused".to_string())
                } else {
                    RiskCheckResult::pass(check, "ok".to_string())
                }
            }
            RiskCheck::PositionSize => {
                if !size_valid {
                    RiskCheckResult::fail(check, format!("invalid size {}", size))
                } else {
                    RiskCheckResult::from_bool(
                        check,
                        size <= cfg.max_position_size_usd,
                        format!("${:.2} vs max ${:.2}", size, cfg.max_position_size_usd),
                    )
                }
            }
            RiskCheck::TradesPerRun => RiskCheckResult::from_bool(
                check,
                state.trades_this_run < cfg.max_trades_per_run,
                format!("{} trades this run, max {}", state.trades_this_run, cfg.max_trades_per_run),
            ),
            RiskCheck::TotalExposure => {
                let after = state.total_exposure + size;
                RiskCheckResult::from_bool(
                    check,
                    size_valid && after <= cfg.max_total_exposure_usd,
                    format!(
                        "${:.2} + ${:.2} = ${:.2} vs max ${:.2}",
                        state.total_exposure, size, after, cfg.max_total_exposure_usd
                    ),
                )
            }
            RiskCheck::PerCityExposure => {
                let current = state.city_exposure(&candidate.city);
                let after = current + size;
                RiskCheckResult::from_bool(
                    check,
                    size_valid && after <= cfg.max_per_city_exposure_usd,
                    format!(
                        "{}: ${:.2} + ${:.2} = ${:.2} vs max ${:.2}",
                        candidate.city, current, size, after, cfg.max_per_city_exposure_usd
                    ),
                )
            }
            RiskCheck::DailyLoss => RiskCheckResult::from_bool(
                check,
                state.daily_loss.abs() <= cfg.max_daily_loss_usd,
                format!("${:.2} lost today vs max ${:.2}", state.daily_loss.abs(), cfg.max_daily_loss_usd),
            ),
            RiskCheck::Cooldown => match state.last_trade_at(&candidate.market_id) {
                None => RiskCheckResult::pass(check, "no prior trade on market".to_string()),
                Some(last) => {
                    let elapsed = now - last;
                    RiskCheckResult::from_bool(
                        check,
                        elapsed >= Duration::try_minutes(cfg.cooldown_minutes).unwrap_or(Duration::MAX),
                        format!(
                            "{:.1}min since last trade, cooldown {}min",
                            elapsed.num_seconds() as f64 / 60.0,
                            cfg.cooldown_minutes
                        ),
                    )
                }
            },
            RiskCheck::TimeToResolution => {
                let hours = ((candidate.end_date - now).num_seconds() as f64 / 3600.0).max(0.0);
                RiskCheckResult::from_bool(
                    check,
                    hours >= cfg.min_hours_to_resolution,
                    format!("{:.1}h to resolution, min {:.1}h", hours, cfg.min_hours_to_resolution),
                )
            }
            RiskCheck::Slippage => {
                let (bid, ask) = (candidate.best_bid, candidate.best_ask);
                if !(bid.is_finite() && ask.is_finite()) || bid <= 0.0 {
                    return RiskCheckResult::fail(check, format!("no usable bid ({} / {})", bid, ask));
                }
                let spread = (ask - bid) / bid;
                RiskCheckResult::from_bool(
                    check,
                    spread <= cfg.slippage_ceiling,
                    format!("spread {:.4} vs ceiling {:.4}", spread, cfg.slippage_ceiling),
                )
            }
        }
    }
}

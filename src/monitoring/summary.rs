use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::execution::risk::RiskVerdict;
use crate::execution::types::{OrderResult, OrderStatus};
use crate::strategies::types::EdgeResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Aborted,
    Cancelled,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Aborted => "aborted",
            RunStatus::Cancelled => "cancelled",
            RunStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(RunStatus::Running),
            "completed" => Some(RunStatus::Completed),
            "aborted" => Some(RunStatus::Aborted),
            "cancelled" => Some(RunStatus::Cancelled),
            "failed" => Some(RunStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunKind {
    Scan,
    Exit,
}

impl RunKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunKind::Scan => "scan",
            RunKind::Exit => "exit",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "scan" => Some(RunKind::Scan),
            "exit" => Some(RunKind::Exit),
            _ => None,
        }
    }
}

/// Scalar outcome of one cycle, handed to reporting.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub mode: String,
    pub events_scanned: usize,
    pub buckets_scanned: usize,
    pub opportunities: usize,
    pub blocked: usize,
    /// Failing check name -> number of candidates it blocked.
    pub block_reasons: BTreeMap<String, usize>,
    pub executed: usize,
    pub failed: usize,
    pub duplicates: usize,
    pub best_edge: Option<f64>,
    pub best_edge_label: String,
    pub positions_checked: usize,
    pub exits_executed: usize,
    pub total_exposure_usd: f64,
    pub daily_loss_usd: f64,
    /// Wall-clock time from cycle start to summary, in seconds.
    pub duration_secs: f64,
    pub errors: Vec<String>,
}

/// Accumulates a [`RunSummary`] as a cycle progresses.
#[derive(Debug)]
pub struct RunSummarizer {
    summary: RunSummary,
}

impl RunSummarizer {
    pub fn new(run_id: &str, mode: &str) -> Self {
        Self {
            summary: RunSummary {
                run_id: run_id.to_string(),
                mode: mode.to_string(),
                ..RunSummary::default()
            },
        }
    }

    pub fn record_events(&mut self, count: usize) {
        self.summary.events_scanned = count;
    }

    pub fn record_edge_result(&mut self, result: &EdgeResult) {
        self.summary.buckets_scanned += 1;
        if !result.is_opportunity() {
            return;
        }
        self.summary.opportunities += 1;
        if self.summary.best_edge.map_or(true, |best| result.net_edge > best) {
            self.summary.best_edge = Some(result.net_edge);
            self.summary.best_edge_label =
                format!("{} {} ${:.3}", result.city, result.bucket_label, result.market_price);
        }
    }

    pub fn record_verdict(&mut self, verdict: &RiskVerdict) {
        if verdict.approved {
            return;
        }
        self.summary.blocked += 1;
        for check in verdict.failed_checks() {
            *self.summary.block_reasons.entry(check.name().to_string()).or_insert(0) += 1;
        }
    }

    pub fn record_order_result(&mut self, result: &OrderResult) {
        match result.status {
            OrderStatus::DryRun | OrderStatus::Submitted | OrderStatus::Filled => self.summary.executed += 1,
            OrderStatus::Failed | OrderStatus::Rejected => self.summary.failed += 1,
            OrderStatus::Duplicate => self.summary.duplicates += 1,
            OrderStatus::Pending => {}
        }
    }

    pub fn record_position_checked(&mut self) {
        self.summary.positions_checked += 1;
    }

    pub fn record_exit(&mut self) {
        self.summary.exits_executed += 1;
    }

    pub fn record_exposure(&mut self, total_exposure: f64, daily_loss: f64) {
        self.summary.total_exposure_usd = total_exposure;
        self.summary.daily_loss_usd = daily_loss;
    }

    pub fn record_duration(&mut self, secs: f64) {
        self.summary.duration_secs = secs;
    }

    pub fn record_error(&mut self, error: impl Into<String>) {
        self.summary.errors.push(error.into());
    }

    pub fn summary(&self) -> &RunSummary {
        &self.summary
    }

    pub fn finalize(self) -> RunSummary {
        self.summary
    }
}

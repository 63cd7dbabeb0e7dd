use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::strategies::types::Side;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Pending,
    DryRun,
    Submitted,
    Filled,
    Rejected,
    Failed,
    Duplicate,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::DryRun => "DRY_RUN",
            OrderStatus::Submitted => "SUBMITTED",
            OrderStatus::Filled => "FILLED",
            OrderStatus::Rejected => "REJECTED",
            OrderStatus::Failed => "FAILED",
            OrderStatus::Duplicate => "DUPLICATE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(OrderStatus::Pending),
            "DRY_RUN" => Some(OrderStatus::DryRun),
            "SUBMITTED" => Some(OrderStatus::Submitted),
            "FILLED" => Some(OrderStatus::Filled),
            "REJECTED" => Some(OrderStatus::Rejected),
            "FAILED" => Some(OrderStatus::Failed),
            "DUPLICATE" => Some(OrderStatus::Duplicate),
            _ => None,
        }
    }

    /// Outcomes that count against the per-run trade limit.
    pub fn counts_as_trade(&self) -> bool {
        matches!(self, OrderStatus::DryRun | OrderStatus::Submitted | OrderStatus::Filled)
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A proposed order, plus the market context the risk gate needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderIntent {
    pub run_id: String,
    pub idempotency_key: String,
    pub market_id: String,
    pub city: String,
    pub target_date: NaiveDate,
    pub bucket_label: String,
    pub side: Side,
    pub price: f64,
    pub size_usd: f64,
    pub net_edge: f64,
    pub best_bid: f64,
    pub best_ask: f64,
    pub end_date: DateTime<Utc>,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
}

impl OrderIntent {
    /// Shares bought (or held) for `size_usd` at `price`.
    pub fn shares(&self) -> f64 {
        if self.price > 0.0 {
            self.size_usd / self.price
        } else {
            0.0
        }
    }
}

/// Terminal outcome of one execution attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderResult {
    pub idempotency_key: String,
    pub status: OrderStatus,
    pub fill_price: Option<f64>,
    /// Filled shares.
    pub fill_size: Option<f64>,
    pub venue_order_id: Option<String>,
    pub error_message: String,
    /// A retryable result does not consume the idempotency key: the same
    /// intent may be dispatched again.
    pub retryable: bool,
    pub executed_at: DateTime<Utc>,
}

impl OrderResult {
    pub fn new(idempotency_key: &str, status: OrderStatus, executed_at: DateTime<Utc>) -> Self {
        Self {
            idempotency_key: idempotency_key.to_string(),
            status,
            fill_price: None,
            fill_size: None,
            venue_order_id: None,
            error_message: String::new(),
            retryable: status == OrderStatus::Failed,
            executed_at,
        }
    }

    pub fn with_fill(mut self, price: f64, size: f64) -> Self {
        self.fill_price = Some(price);
        self.fill_size = Some(size);
        self
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = message.into();
        self
    }

    pub fn with_venue_order_id(mut self, id: Option<String>) -> Self {
        self.venue_order_id = id;
        self
    }

    pub fn retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionStatus {
    Open,
    Closed,
}

impl PositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionStatus::Open => "open",
            PositionStatus::Closed => "closed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "open" => Some(PositionStatus::Open),
            "closed" => Some(PositionStatus::Closed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub id: Option<i64>,
    pub idempotency_key: String,
    pub market_id: String,
    pub city: String,
    pub target_date: NaiveDate,
    pub bucket_label: String,
    pub entry_price: f64,
    pub size_usd: f64,
    pub shares: f64,
    pub current_price: f64,
    pub status: PositionStatus,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub realized_pnl: Option<f64>,
}

impl Position {
    /// Open a position from a filled buy.
    pub fn from_fill(intent: &OrderIntent, result: &OrderResult) -> Self {
        let entry_price = result.fill_price.unwrap_or(intent.price);
        let shares = result.fill_size.unwrap_or_else(|| intent.shares());
        Self {
            id: None,
            idempotency_key: intent.idempotency_key.clone(),
            market_id: intent.market_id.clone(),
            city: intent.city.clone(),
            target_date: intent.target_date,
            bucket_label: intent.bucket_label.clone(),
            entry_price,
            size_usd: intent.size_usd,
            shares,
            current_price: entry_price,
            status: PositionStatus::Open,
            opened_at: result.executed_at,
            closed_at: None,
            realized_pnl: None,
        }
    }

    pub fn market_value(&self) -> f64 {
        self.shares * self.current_price
    }

    pub fn unrealized_pnl(&self) -> f64 {
        self.market_value() - self.size_usd
    }
}

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::data::types::TemperatureBucket;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "BUY" => Some(Side::Buy),
            "SELL" => Some(Side::Sell),
            _ => None,
        }
    }
}

/// Classification attached to every edge evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReasonCode {
    Opportunity,
    EdgeBelowThreshold,
    NoForecastAvailable,
    StaleForecastData,
    MarketNotAcceptingOrders,
    PriceAboveMaxEntry,
    NegativeEdge,
    InvalidMarketPrice,
    InvalidSigma,
    BucketParseError,
}

impl ReasonCode {
    pub const ALL: [ReasonCode; 10] = [
        ReasonCode::Opportunity,
        ReasonCode::EdgeBelowThreshold,
        ReasonCode::NoForecastAvailable,
        ReasonCode::StaleForecastData,
        ReasonCode::MarketNotAcceptingOrders,
        ReasonCode::PriceAboveMaxEntry,
        ReasonCode::NegativeEdge,
        ReasonCode::InvalidMarketPrice,
        ReasonCode::InvalidSigma,
        ReasonCode::BucketParseError,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ReasonCode::Opportunity => "OPPORTUNITY",
            ReasonCode::EdgeBelowThreshold => "EDGE_BELOW_THRESHOLD",
            ReasonCode::NoForecastAvailable => "NO_FORECAST_AVAILABLE",
            ReasonCode::StaleForecastData => "STALE_FORECAST_DATA",
            ReasonCode::MarketNotAcceptingOrders => "MARKET_NOT_ACCEPTING_ORDERS",
            ReasonCode::PriceAboveMaxEntry => "PRICE_ABOVE_MAX_ENTRY",
            ReasonCode::NegativeEdge => "NEGATIVE_EDGE",
            ReasonCode::InvalidMarketPrice => "INVALID_MARKET_PRICE",
            ReasonCode::InvalidSigma => "INVALID_SIGMA",
            ReasonCode::BucketParseError => "BUCKET_PARSE_ERROR",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|r| r.as_str() == s)
    }
}

impl std::fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of pricing one bucket against its forecast. Created once per
/// bucket per scan cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeResult {
    pub event_id: String,
    pub market_id: String,
    pub city: String,
    pub target_date: NaiveDate,
    /// `None` only for `BUCKET_PARSE_ERROR`.
    pub bucket: Option<TemperatureBucket>,
    pub bucket_label: String,
    pub bucket_probability: f64,
    pub market_price: f64,
    pub gross_edge: f64,
    pub net_edge: f64,
    pub sigma_used: f64,
    pub days_out: i64,
    pub forecast_stale: bool,
    /// Proposed stake in USD; zero unless this is an opportunity.
    pub suggested_size_usd: f64,
    pub reason_code: ReasonCode,
    pub detail: String,
}

impl EdgeResult {
    pub fn is_opportunity(&self) -> bool {
        self.reason_code == ReasonCode::Opportunity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_code_strings_round_trip() {
        for code in ReasonCode::ALL {
            assert_eq!(ReasonCode::parse(code.as_str()), Some(code));
            let json = serde_json::to_string(&code).unwrap();
            assert_eq!(json, format!("\"{}\"", code.as_str()));
        }
        assert_eq!(ReasonCode::parse("ZERO_LIQUIDITY"), None);
    }
}

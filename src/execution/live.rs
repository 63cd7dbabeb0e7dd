use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::error::VenueError;
use crate::execution::types::{OrderIntent, OrderResult, OrderStatus};
use crate::strategies::types::Side;

const TRADE_SOURCE: &str = "sdk:weatherchannel";

/// Body of a venue trade response. The venue is loose about field names, so
/// every field is optional and read through the accessors below.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct VenueResponse {
    #[serde(default)]
    pub success: bool,
    pub trade_id: Option<String>,
    pub fill_price: Option<f64>,
    pub price: Option<f64>,
    pub shares_bought: Option<f64>,
    pub shares_sold: Option<f64>,
    pub shares: Option<f64>,
    pub error: Option<String>,
    pub message: Option<String>,
}

impl VenueResponse {
    pub fn accepted(&self) -> bool {
        self.success || self.trade_id.as_deref().map_or(false, |id| !id.is_empty())
    }

    pub fn executed_price(&self) -> Option<f64> {
        self.fill_price.or(self.price).filter(|p| *p > 0.0)
    }

    pub fn executed_shares(&self) -> Option<f64> {
        self.shares_bought
            .or(self.shares_sold)
            .or(self.shares)
            .filter(|s| *s > 0.0)
    }

    pub fn error_message(&self) -> String {
        self.error
            .clone()
            .or_else(|| self.message.clone())
            .unwrap_or_else(|| "Unknown venue error".to_string())
    }
}

/// An order venue. Buys spend a USD amount, sells return a share count.
#[async_trait]
pub trait Venue: Send + Sync {
    fn name(&self) -> &str;
    async fn buy(&self, market_id: &str, amount_usd: f64) -> Result<VenueResponse, VenueError>;
    async fn sell(&self, market_id: &str, shares: f64) -> Result<VenueResponse, VenueError>;
}

/// REST client for the Simmer SDK, which routes YES-side orders to
/// Polymarket.
pub struct SimmerClient {
    client: Client,
    base_url: String,
    api_key: String,
    venue: String,
}

impl SimmerClient {
    pub fn new(base_url: String, api_key: String, venue: String) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            venue,
        }
    }

    async fn post_trade(&self, body: serde_json::Value) -> Result<VenueResponse, VenueError> {
        let url = format!("{}/api/sdk/trade", self.base_url);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            error!("Simmer API {}: POST /api/sdk/trade -> {}", status.as_u16(), text);
            return Err(VenueError::Status {
                status: status.as_u16(),
                body: text,
            });
        }

        serde_json::from_str(&text).map_err(|e| VenueError::Decode(e.to_string()))
    }
}

#[async_trait]
impl Venue for SimmerClient {
    fn name(&self) -> &str {
        "simmer"
    }

    async fn buy(&self, market_id: &str, amount_usd: f64) -> Result<VenueResponse, VenueError> {
        self.post_trade(json!({
            "market_id": market_id,
            "side": "yes",
            "amount": amount_usd,
            "venue": self.venue,
            "source": TRADE_SOURCE,
        }))
        .await
    }

    async fn sell(&self, market_id: &str, shares: f64) -> Result<VenueResponse, VenueError> {
        self.post_trade(json!({
            "market_id": market_id,
            "side": "yes",
            "action": "sell",
            "shares": shares,
            "venue": self.venue,
            "source": TRADE_SOURCE,
        }))
        .await
    }
}

/// Live execution. Every venue call is bounded by `timeout` and is never
/// retried here; a timeout or transport error becomes a retryable `FAILED`.
pub struct LiveAdapter {
    venue: Box<dyn Venue>,
    timeout: Duration,
}

impl LiveAdapter {
    pub fn new(venue: Box<dyn Venue>, timeout: Duration) -> Self {
        Self { venue, timeout }
    }

    pub fn venue_name(&self) -> &str {
        self.venue.name()
    }

    pub async fn execute(&self, intent: &OrderIntent, now: DateTime<Utc>) -> OrderResult {
        info!(
            "LIVE: {} {} on {} at ${:.4} (size ${:.2}, edge {:.4})",
            intent.side.as_str(),
            intent.bucket_label,
            intent.market_id,
            intent.price,
            intent.size_usd,
            intent.net_edge
        );

        let call = async {
            match intent.side {
                Side::Buy => self.venue.buy(&intent.market_id, intent.size_usd).await,
                Side::Sell => self.venue.sell(&intent.market_id, intent.shares()).await,
            }
        };

        match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(response)) => classify_response(intent, &response, now),
            Ok(Err(e)) if e.is_rejection() => {
                warn!("LIVE REJECTED: {} -> {}", intent.market_id, e);
                OrderResult::new(&intent.idempotency_key, OrderStatus::Rejected, now).with_error(e.to_string())
            }
            Ok(Err(e)) => {
                error!("LIVE FAILED: {} -> {}", intent.market_id, e);
                OrderResult::new(&intent.idempotency_key, OrderStatus::Failed, now).with_error(e.to_string())
            }
            Err(_) => {
                error!(
                    "LIVE FAILED: {} -> no response within {}s",
                    intent.market_id,
                    self.timeout.as_secs_f64()
                );
                OrderResult::new(&intent.idempotency_key, OrderStatus::Failed, now)
                    .with_error(format!("Venue timeout after {:.1}s", self.timeout.as_secs_f64()))
            }
        }
    }
}

fn classify_response(intent: &OrderIntent, response: &VenueResponse, now: DateTime<Utc>) -> OrderResult {
    if !response.accepted() {
        let message = response.error_message();
        warn!("LIVE REJECTED: {} -> {}", intent.market_id, message);
        return OrderResult::new(&intent.idempotency_key, OrderStatus::Rejected, now).with_error(message);
    }

    let trade_id = response.trade_id.clone();
    match response.executed_shares() {
        Some(shares) => {
            let price = response.executed_price().unwrap_or(intent.price);
            info!(
                "LIVE FILL: {:.2} shares @ ${:.4} (trade_id={})",
                shares,
                price,
                trade_id.as_deref().unwrap_or("")
            );
            OrderResult::new(&intent.idempotency_key, OrderStatus::Filled, now)
                .with_fill(price, shares)
                .with_venue_order_id(trade_id)
        }
        None => {
            info!(
                "LIVE SUBMITTED: {} awaiting fill (trade_id={})",
                intent.market_id,
                trade_id.as_deref().unwrap_or("")
            );
            OrderResult::new(&intent.idempotency_key, OrderStatus::Submitted, now).with_venue_order_id(trade_id)
        }
    }
}

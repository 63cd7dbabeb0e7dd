use chrono::{DateTime, Utc};
use tracing::info;

use crate::execution::types::{OrderIntent, OrderResult, OrderStatus};

/// Dry-run execution: never contacts a venue. The synthesized result fills
/// at the intent price so dry-run and live audit rows line up.
#[derive(Debug, Clone, Default)]
pub struct DryRunAdapter;

impl DryRunAdapter {
    pub fn new() -> Self {
        Self
    }

    pub fn execute(&self, intent: &OrderIntent, now: DateTime<Utc>) -> OrderResult {
        let shares = intent.shares();
        info!(
            "[DRY RUN] {} {} {} ${:.2} @ ${:.4} ({:.2} shares)",
            intent.side.as_str(),
            intent.city,
            intent.bucket_label,
            intent.size_usd,
            intent.price,
            shares
        );
        OrderResult::new(&intent.idempotency_key, OrderStatus::DryRun, now).with_fill(intent.price, shares)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategies::types::Side;
    use chrono::{Duration, NaiveDate, TimeZone};

    #[test]
    fn test_dry_run_fills_at_intent_price() {
        let now = Utc.with_ymd_and_hms(2026, 2, 17, 12, 0, 0).unwrap();
        let intent = OrderIntent {
            run_id: "run-1".to_string(),
            idempotency_key: "k".to_string(),
            market_id: "m".to_string(),
            city: "nyc".to_string(),
            target_date: NaiveDate::from_ymd_opt(2026, 2, 18).unwrap(),
            bucket_label: "48°F or higher".to_string(),
            side: Side::Buy,
            price: 0.08,
            size_usd: 4.0,
            net_edge: 0.3,
            best_bid: 0.079,
            best_ask: 0.08,
            end_date: now + Duration::hours(30),
            status: OrderStatus::Pending,
            created_at: now,
        };

        let result = DryRunAdapter::new().execute(&intent, now);
        assert_eq!(result.status, OrderStatus::DryRun);
        assert_eq!(result.fill_price, Some(0.08));
        assert!((result.fill_size.unwrap() - 50.0).abs() < 1e-9);
        assert!(!result.retryable);
        assert_eq!(result, DryRunAdapter::new().execute(&intent, now));
    }
}

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use crate::config::StrategyConfig;
use crate::data::types::{ForecastPoint, MarketQuote, TemperatureBucket};
use crate::strategies::calibration::{bucket_probability, compute_sigma, days_until, hours_stale_beyond};
use crate::strategies::types::{EdgeResult, ReasonCode};

/// Prices one bucket against its forecast.
///
/// Pure: the same forecast, bucket, quote, config and `now` always produce a
/// bit-identical [`EdgeResult`]. Degenerate inputs become reason codes.
#[derive(Debug, Clone)]
pub struct EdgeCalculator {
    config: StrategyConfig,
}

impl EdgeCalculator {
    pub fn new(config: StrategyConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &StrategyConfig {
        &self.config
    }

    pub fn compute(
        &self,
        forecast: Option<&ForecastPoint>,
        bucket: &TemperatureBucket,
        quote: &MarketQuote,
        now: DateTime<Utc>,
    ) -> EdgeResult {
        let cfg = &self.config;
        let days_out = days_until(quote.target_date, now);
        let mut result = EdgeResult {
            event_id: quote.event_id.clone(),
            market_id: quote.market_id.clone(),
            city: quote.city.clone(),
            target_date: quote.target_date,
            bucket: Some(*bucket),
            bucket_label: bucket.label(),
            bucket_probability: 0.0,
            market_price: quote.yes_price,
            gross_edge: 0.0,
            net_edge: 0.0,
            sigma_used: 0.0,
            days_out,
            forecast_stale: false,
            suggested_size_usd: 0.0,
            reason_code: ReasonCode::NoForecastAvailable,
            detail: String::new(),
        };

        let forecast = match forecast {
            Some(f) if f.value.is_finite() => f,
            Some(f) => {
                result.detail = format!("forecast value for {} {} is not finite", f.city, f.target_date);
                return result;
            }
            None => {
                result.detail = format!("no forecast for {} {}", quote.city, quote.target_date);
                return result;
            }
        };

        if !quote.accepting_orders {
            return result.with_reason(ReasonCode::MarketNotAcceptingOrders, "market is not accepting orders".to_string());
        }

        let price = quote.yes_price;
        if !price.is_finite() || !(0.0..=1.0).contains(&price) {
            return result.with_reason(ReasonCode::InvalidMarketPrice, format!("yes price {} outside [0, 1]", price));
        }

        let hours_stale = hours_stale_beyond(
            forecast.staleness(now),
            Duration::try_minutes(cfg.forecast_max_age_minutes).unwrap_or(Duration::MAX),
        );
        let stale = hours_stale > 0.0;
        let sigma_native = compute_sigma(cfg.sigma_base, cfg.sigma_per_day, days_out, hours_stale);
        let sigma = forecast.unit.convert_delta(sigma_native, bucket.unit());
        result.forecast_stale = stale;

        if !sigma.is_finite() || sigma <= 0.0 {
            return result.with_reason(ReasonCode::InvalidSigma, format!("sigma {} is not positive", sigma));
        }

        let mu = forecast.unit.convert(forecast.value, bucket.unit());
        let probability = bucket_probability(bucket, mu, sigma);
        let gross_edge = probability - price;
        let net_edge = gross_edge - cfg.fee_estimate - cfg.slippage_estimate;

        result.bucket_probability = probability;
        result.gross_edge = gross_edge;
        result.net_edge = net_edge;
        result.sigma_used = sigma;

        debug!(
            "Edge: {} {} mu={:.1} sigma={:.2} p={:.3} price={:.3} net={:.3}",
            quote.city,
            result.bucket_label,
            mu,
            sigma,
            probability,
            price,
            net_edge
        );

        if price > cfg.max_entry_price {
            return result.with_reason(
                ReasonCode::PriceAboveMaxEntry,
                format!("price {:.4} > max entry {:.4}", price, cfg.max_entry_price),
            );
        }
        if net_edge < 0.0 {
            return result.with_reason(ReasonCode::NegativeEdge, format!("net edge {:.4} < 0", net_edge));
        }
        if net_edge >= cfg.min_edge_threshold {
            let size = kelly_stake(probability, price, cfg.kelly_fraction, cfg.bankroll_usd, cfg.stake_usd);
            result.suggested_size_usd = size;
            let mut detail = format!(
                "net edge {:.4} >= threshold {:.4}, stake ${:.2}",
                net_edge, cfg.min_edge_threshold, size
            );
            if stale {
                detail.push_str(&format!(" (stale forecast, +{:.1}h)", hours_stale));
            }
            return result.with_reason(ReasonCode::Opportunity, detail);
        }
        if stale {
            return result.with_reason(
                ReasonCode::StaleForecastData,
                format!(
                    "forecast {:.1}h past max age, net edge {:.4} below threshold",
                    hours_stale, net_edge
                ),
            );
        }

        result.with_reason(
            ReasonCode::EdgeBelowThreshold,
            format!("net edge {:.4} < threshold {:.4}", net_edge, cfg.min_edge_threshold),
        )
    }
}

impl EdgeResult {
    fn with_reason(mut self, reason_code: ReasonCode, detail: String) -> Self {
        self.reason_code = reason_code;
        self.detail = detail;
        self
    }
}

/// Fractional Kelly stake for buying YES at `price`, capped at `max_stake`.
///
/// f* = (b·p - q) / b with b = (1 - price) / price.
pub fn kelly_stake(win_prob: f64, price: f64, fraction: f64, bankroll: f64, max_stake: f64) -> f64 {
    if price >= 1.0 {
        return 0.0;
    }
    let kelly = if price <= 0.0 {
        win_prob
    } else {
        let odds = (1.0 - price) / price;
        let lose_prob = 1.0 - win_prob;
        (odds * win_prob - lose_prob) / odds
    };

    let position = bankroll * (kelly * fraction).max(0.0);
    position.min(max_stake)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::types::TemperatureUnit;
    use chrono::{NaiveDate, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 17, 12, 0, 0).unwrap()
    }

    fn config() -> StrategyConfig {
        StrategyConfig {
            sigma_base: 3.0,
            ..StrategyConfig::default()
        }
    }

    fn forecast(value: f64, generated_hours_ago: i64, target: NaiveDate) -> ForecastPoint {
        ForecastPoint {
            city: "nyc".to_string(),
            target_date: target,
            value,
            unit: TemperatureUnit::Fahrenheit,
            source_generated_at: now() - Duration::hours(generated_hours_ago),
            fetched_at: now(),
        }
    }

    fn quote(bucket: TemperatureBucket, price: f64, target: NaiveDate) -> MarketQuote {
        MarketQuote {
            market_id: "m-48".to_string(),
            event_id: "e-1".to_string(),
            city: "nyc".to_string(),
            target_date: target,
            bucket,
            yes_price: price,
            best_bid: price - 0.005,
            best_ask: price + 0.005,
            accepting_orders: true,
            end_date: now() + Duration::hours(12),
            fetched_at: now(),
        }
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 2, 17).unwrap()
    }

    #[test]
    fn test_same_day_at_or_above_opportunity() {
        let calc = EdgeCalculator::new(config());
        let bucket = TemperatureBucket::at_or_above(48, TemperatureUnit::Fahrenheit);
        let f = forecast(50.0, 1, today());
        let result = calc.compute(Some(&f), &bucket, &quote(bucket, 0.10, today()), now());

        assert_eq!(result.sigma_used, 3.0);
        assert!((result.bucket_probability - 0.798).abs() < 0.005);
        assert!((result.gross_edge - 0.698).abs() < 0.005);
        assert!((result.net_edge - (result.gross_edge - 0.03)).abs() < 1e-12);
        assert_eq!(result.reason_code, ReasonCode::Opportunity);
        assert!(!result.forecast_stale);
        assert_eq!(result.suggested_size_usd, 5.0);
    }

    #[test]
    fn test_unvalidated_max_age_does_not_fault() {
        let calc = EdgeCalculator::new(StrategyConfig {
            forecast_max_age_minutes: i64::MAX,
            ..config()
        });
        let bucket = TemperatureBucket::at_or_above(48, TemperatureUnit::Fahrenheit);
        let f = forecast(50.0, 48, today());
        let result = calc.compute(Some(&f), &bucket, &quote(bucket, 0.10, today()), now());

        assert!(!result.forecast_stale);
        assert_eq!(result.sigma_used, 3.0);
    }

    #[test]
    fn test_missing_forecast_is_reported_not_raised() {
        let calc = EdgeCalculator::new(config());
        let bucket = TemperatureBucket::at_or_above(48, TemperatureUnit::Fahrenheit);
        let result = calc.compute(None, &bucket, &quote(bucket, 0.10, today()), now());

        assert_eq!(result.reason_code, ReasonCode::NoForecastAvailable);
        assert_eq!(result.bucket_probability, 0.0);
        assert_eq!(result.gross_edge, 0.0);
        assert_eq!(result.net_edge, 0.0);
        assert_eq!(result.suggested_size_usd, 0.0);
    }

    #[test]
    fn test_degenerate_inputs_map_to_reason_codes() {
        let calc = EdgeCalculator::new(config());
        let bucket = TemperatureBucket::at_or_above(48, TemperatureUnit::Fahrenheit);
        let f = forecast(50.0, 1, today());

        let mut closed = quote(bucket, 0.10, today());
        closed.accepting_orders = false;
        assert_eq!(
            calc.compute(Some(&f), &bucket, &closed, now()).reason_code,
            ReasonCode::MarketNotAcceptingOrders
        );

        for bad in [1.2, -0.1, f64::NAN] {
            let q = quote(bucket, bad, today());
            assert_eq!(calc.compute(Some(&f), &bucket, &q, now()).reason_code, ReasonCode::InvalidMarketPrice);
        }

        let expensive = quote(bucket, 0.40, today());
        assert_eq!(
            calc.compute(Some(&f), &bucket, &expensive, now()).reason_code,
            ReasonCode::PriceAboveMaxEntry
        );

        let cold = forecast(30.0, 1, today());
        assert_eq!(
            calc.compute(Some(&cold), &bucket, &quote(bucket, 0.10, today()), now()).reason_code,
            ReasonCode::NegativeEdge
        );
    }

    #[test]
    fn test_compute_is_deterministic() {
        let calc = EdgeCalculator::new(config());
        let bucket = TemperatureBucket::range(48, 49, TemperatureUnit::Fahrenheit).unwrap();
        let f = forecast(49.2, 3, today());
        let q = quote(bucket, 0.08, today());

        let a = calc.compute(Some(&f), &bucket, &q, now());
        let b = calc.compute(Some(&f), &bucket, &q, now());
        assert_eq!(a, b);
        assert_eq!(a.bucket_probability.to_bits(), b.bucket_probability.to_bits());
    }

    #[test]
    fn test_sigma_strictly_increases_with_days_out() {
        let calc = EdgeCalculator::new(config());
        let bucket = TemperatureBucket::at_or_above(48, TemperatureUnit::Fahrenheit);

        let mut previous = 0.0;
        for days in 0..5 {
            let target = today() + Duration::days(days);
            let f = forecast(50.0, 1, target);
            let result = calc.compute(Some(&f), &bucket, &quote(bucket, 0.10, target), now());
            assert!(result.sigma_used > previous);
            previous = result.sigma_used;
        }
    }

    #[test]
    fn test_stale_forecast_inflates_sigma_and_shrinks_edge() {
        let calc = EdgeCalculator::new(config());
        let bucket = TemperatureBucket::at_or_above(48, TemperatureUnit::Fahrenheit);
        let q = quote(bucket, 0.10, today());

        let fresh = calc.compute(Some(&forecast(50.0, 2, today())), &bucket, &q, now());
        let stale = calc.compute(Some(&forecast(50.0, 18, today())), &bucket, &q, now());
        let staler = calc.compute(Some(&forecast(50.0, 30, today())), &bucket, &q, now());

        assert!(!fresh.forecast_stale);
        assert!(stale.forecast_stale);
        assert!(stale.sigma_used > fresh.sigma_used);
        assert!(staler.sigma_used > stale.sigma_used);
        // 12 hours beyond the 6 hour threshold adds one degree
        assert!((stale.sigma_used - 4.0).abs() < 1e-9);
        assert!(stale.net_edge < fresh.net_edge);
        assert!(staler.net_edge < stale.net_edge);
    }

    #[test]
    fn test_stale_forecast_below_threshold_is_flagged() {
        let calc = EdgeCalculator::new(config());
        let bucket = TemperatureBucket::exact(50, TemperatureUnit::Fahrenheit);
        let q = quote(bucket, 0.07, today());

        let stale = calc.compute(Some(&forecast(50.0, 12, today())), &bucket, &q, now());
        assert_eq!(stale.reason_code, ReasonCode::StaleForecastData);

        let fresh = calc.compute(Some(&forecast(50.0, 1, today())), &bucket, &q, now());
        assert_eq!(fresh.reason_code, ReasonCode::EdgeBelowThreshold);
    }

    #[test]
    fn test_celsius_bucket_with_fahrenheit_forecast() {
        let calc = EdgeCalculator::new(config());
        let bucket = TemperatureBucket::exact(10, TemperatureUnit::Celsius);
        // 50°F == 10°C
        let f = forecast(50.0, 1, today());
        let result = calc.compute(Some(&f), &bucket, &quote(bucket, 0.05, today()), now());

        assert!((result.sigma_used - 3.0 * 5.0 / 9.0).abs() < 1e-12);
        assert!((result.bucket_probability - 0.236).abs() < 0.005);
    }

    #[test]
    fn test_kelly_stake_is_capped() {
        // b = 9, f* = (9 * 0.8 - 0.2) / 9 = 0.778; quarter Kelly on $100 = $19.4
        let uncapped = kelly_stake(0.8, 0.10, 0.25, 100.0, 1000.0);
        assert!((uncapped - 19.44).abs() < 0.01);
        assert_eq!(kelly_stake(0.8, 0.10, 0.25, 100.0, 5.0), 5.0);
    }

    #[test]
    fn test_kelly_stake_never_negative() {
        assert_eq!(kelly_stake(0.05, 0.10, 0.25, 100.0, 5.0), 0.0);
        assert_eq!(kelly_stake(0.9, 1.0, 0.25, 100.0, 5.0), 0.0);
    }
}

//! Forecast uncertainty and bucket probabilities.
//!
//! The daily high is modelled as N(forecast, sigma²). Sigma grows linearly
//! with whole days until the target date and again with forecast staleness
//! past the allowed age. Bucket edges get a ±0.5 continuity correction because
//! forecasts and resolutions are reported in whole degrees.

use chrono::{DateTime, Duration, NaiveDate, Utc};

use crate::data::types::{BucketKind, TemperatureBucket};

/// Floor applied to the configured base sigma.
pub const MIN_SIGMA: f64 = 1.0;

/// Sigma added per 12 hours of staleness past the threshold, in the
/// forecast's native unit.
pub const STALE_SIGMA_PER_12H: f64 = 1.0;

const CONTINUITY: f64 = 0.5;

/// Whole UTC calendar days from `now` until `target_date` (0 for today or
/// the past).
pub fn days_until(target_date: NaiveDate, now: DateTime<Utc>) -> i64 {
    (target_date - now.date_naive()).num_days().max(0)
}

/// Hours of staleness beyond `max_age`, or 0 when the forecast is fresh.
pub fn hours_stale_beyond(staleness: Duration, max_age: Duration) -> f64 {
    let excess = staleness - max_age;
    if excess <= Duration::zero() {
        0.0
    } else {
        excess.num_milliseconds() as f64 / 3_600_000.0
    }
}

pub fn compute_sigma(base: f64, per_day: f64, days_out: i64, hours_stale: f64) -> f64 {
    base.max(MIN_SIGMA)
        + per_day * days_out.max(0) as f64
        + STALE_SIGMA_PER_12H * hours_stale.max(0.0) / 12.0
}

/// P(T in bucket) for T ~ N(mu, sigma²). `mu` and `sigma` must already be
/// in the bucket's unit. Caller guarantees `sigma > 0`.
pub fn bucket_probability(bucket: &TemperatureBucket, mu: f64, sigma: f64) -> f64 {
    let z = |x: f64| (x - mu) / sigma;
    let low = bucket.low() as f64;
    let high = bucket.high() as f64;

    let p = match bucket.kind() {
        BucketKind::AtOrAbove => 1.0 - normal_cdf(z(low - CONTINUITY)),
        BucketKind::AtOrBelow => normal_cdf(z(low + CONTINUITY)),
        BucketKind::Range | BucketKind::Exact => {
            normal_cdf(z(high + CONTINUITY)) - normal_cdf(z(low - CONTINUITY))
        }
    };

    p.clamp(0.0, 1.0)
}

/// Standard normal cumulative distribution function
pub fn normal_cdf(z: f64) -> f64 {
    0.5 * (1.0 + erf(z / f64::sqrt(2.0)))
}

/// Error function approximation (Abramowitz & Stegun 7.1.26)
fn erf(x: f64) -> f64 {
    let a1 = 0.254829592;
    let a2 = -0.284496736;
    let a3 = 1.421413741;
    let a4 = -1.453152027;
    let a5 = 1.061405429;
    let p = 0.3275911;

    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs();

    let t = 1.0 / (1.0 + p * x);
    let y = 1.0 - (((((a5 * t + a4) * t) + a3) * t + a2) * t + a1) * t * (-x * x).exp();

    sign * y
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::types::TemperatureUnit;
    use chrono::TimeZone;

    const F: TemperatureUnit = TemperatureUnit::Fahrenheit;

    #[test]
    fn test_normal_cdf() {
        assert!((normal_cdf(0.0) - 0.5).abs() < 0.001);
        assert!((normal_cdf(1.0) - 0.8413).abs() < 0.001);
        assert!((normal_cdf(-1.0) - 0.1587).abs() < 0.001);
    }

    #[test]
    fn test_at_or_above_uses_continuity_correction() {
        // P(T >= 48) with mu 50, sigma 3 => Phi((50 - 47.5) / 3) ~ 0.798
        let p = bucket_probability(&TemperatureBucket::at_or_above(48, F), 50.0, 3.0);
        assert!((p - normal_cdf(2.5 / 3.0)).abs() < 1e-12);
        assert!((p - 0.798).abs() < 0.005);
    }

    #[test]
    fn test_exact_bucket_is_one_degree_wide() {
        let p = bucket_probability(&TemperatureBucket::exact(50, F), 50.0, 3.0);
        let expected = normal_cdf(0.5 / 3.0) - normal_cdf(-0.5 / 3.0);
        assert!((p - expected).abs() < 1e-12);
    }

    #[test]
    fn test_adjacent_buckets_partition_the_line() {
        let buckets = [
            TemperatureBucket::at_or_below(45, F),
            TemperatureBucket::range(46, 47, F).unwrap(),
            TemperatureBucket::range(48, 49, F).unwrap(),
            TemperatureBucket::exact(50, F),
            TemperatureBucket::at_or_above(51, F),
        ];
        let total: f64 = buckets.iter().map(|b| bucket_probability(b, 48.3, 2.7)).sum();
        assert!((total - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_sigma_grows_with_days_and_staleness() {
        let same_day = compute_sigma(3.0, 0.5, 0, 0.0);
        let two_days = compute_sigma(3.0, 0.5, 2, 0.0);
        assert_eq!(same_day, 3.0);
        assert_eq!(two_days, 4.0);

        let stale_12h = compute_sigma(3.0, 0.5, 0, 12.0);
        let stale_18h = compute_sigma(3.0, 0.5, 0, 18.0);
        assert_eq!(stale_12h, 4.0);
        assert!(stale_18h > stale_12h);
    }

    #[test]
    fn test_sigma_base_floor() {
        assert_eq!(compute_sigma(0.2, 0.5, 0, 0.0), MIN_SIGMA);
        assert!(compute_sigma(0.2, 0.5, 1, 0.0) > MIN_SIGMA);
    }

    #[test]
    fn test_days_until_counts_calendar_days() {
        let now = Utc.with_ymd_and_hms(2026, 2, 17, 23, 0, 0).unwrap();
        let today = NaiveDate::from_ymd_opt(2026, 2, 17).unwrap();
        let tomorrow = NaiveDate::from_ymd_opt(2026, 2, 18).unwrap();
        let yesterday = NaiveDate::from_ymd_opt(2026, 2, 16).unwrap();
        assert_eq!(days_until(today, now), 0);
        assert_eq!(days_until(tomorrow, now), 1);
        assert_eq!(days_until(yesterday, now), 0);
    }

    #[test]
    fn test_hours_stale_beyond_threshold() {
        let max_age = Duration::minutes(360);
        assert_eq!(hours_stale_beyond(Duration::hours(5), max_age), 0.0);
        assert_eq!(hours_stale_beyond(Duration::hours(6), max_age), 0.0);
        assert!((hours_stale_beyond(Duration::hours(18), max_age) - 12.0).abs() < 1e-9);
    }
}

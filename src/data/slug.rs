use chrono::NaiveDate;
use regex::Regex;
use std::sync::OnceLock;
use thiserror::Error;

use crate::data::types::{TemperatureBucket, TemperatureUnit};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SlugError {
    #[error("Unrecognized bucket suffix: {0}")]
    UnknownBucket(String),

    #[error("Range bucket has low > high: {0}")]
    InvertedRange(String),

    #[error("Unrecognized event slug: {0}")]
    UnknownEvent(String),

    #[error("Invalid date in event slug: {0}")]
    InvalidDate(String),
}

const MONTHS: [&str; 12] = [
    "january", "february", "march", "april", "may", "june",
    "july", "august", "september", "october", "november", "december",
];

const TEMP: &str = r"(?:neg)?-?\d+";

fn or_higher_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(&format!(r"^({TEMP})(f|c)orhigher$")).expect("static regex"))
}

fn or_below_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(&format!(r"^({TEMP})(f|c)orbelow$")).expect("static regex"))
}

fn range_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(&format!(r"^({TEMP})-({TEMP})(f|c)$")).expect("static regex"))
}

fn exact_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(&format!(r"^({TEMP})(f|c)$")).expect("static regex"))
}

fn event_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^highest-temperature-in-([a-z0-9]+)-on-([a-z]+)-(\d{1,2})-(\d{4})")
            .expect("static regex")
    })
}

fn parse_temp(s: &str) -> Result<i32, SlugError> {
    let (negative, digits) = match s.strip_prefix("neg") {
        Some(rest) => (true, rest.trim_start_matches('-')),
        None => (false, s),
    };
    let value: i32 = digits
        .parse()
        .map_err(|_| SlugError::UnknownBucket(s.to_string()))?;
    Ok(if negative { -value.abs() } else { value })
}

fn parse_unit(s: &str) -> TemperatureUnit {
    if s == "c" {
        TemperatureUnit::Celsius
    } else {
        TemperatureUnit::Fahrenheit
    }
}

/// Parse a bucket suffix such as `44forhigher`, `33forbelow`, `42-43f`,
/// `22c` or `neg3-2c`.
pub fn parse_bucket_suffix(suffix: &str) -> Result<TemperatureBucket, SlugError> {
    let suffix = suffix.trim().to_lowercase();

    if let Some(cap) = or_higher_re().captures(&suffix) {
        return Ok(TemperatureBucket::at_or_above(parse_temp(&cap[1])?, parse_unit(&cap[2])));
    }
    if let Some(cap) = or_below_re().captures(&suffix) {
        return Ok(TemperatureBucket::at_or_below(parse_temp(&cap[1])?, parse_unit(&cap[2])));
    }
    if let Some(cap) = range_re().captures(&suffix) {
        let low = parse_temp(&cap[1])?;
        let high = parse_temp(&cap[2])?;
        return TemperatureBucket::range(low, high, parse_unit(&cap[3]))
            .ok_or(SlugError::InvertedRange(suffix.clone()));
    }
    if let Some(cap) = exact_re().captures(&suffix) {
        return Ok(TemperatureBucket::exact(parse_temp(&cap[1])?, parse_unit(&cap[2])));
    }

    Err(SlugError::UnknownBucket(suffix))
}

/// Parse the bucket from a full market slug
/// (`highest-temperature-in-nyc-on-february-17-2026-44forhigher`) or from a
/// bare suffix.
pub fn parse_market_slug(slug: &str) -> Result<TemperatureBucket, SlugError> {
    let slug = slug.trim().to_lowercase();
    let suffix = match event_re().find(&slug) {
        Some(m) => slug[m.end()..].trim_start_matches('-'),
        None => slug.as_str(),
    };
    parse_bucket_suffix(suffix)
}

/// Extract `(city, date)` from an event slug.
pub fn parse_event_slug(slug: &str) -> Result<(String, NaiveDate), SlugError> {
    let slug = slug.trim().to_lowercase();
    let cap = event_re()
        .captures(&slug)
        .ok_or_else(|| SlugError::UnknownEvent(slug.clone()))?;

    let month = MONTHS
        .iter()
        .position(|m| *m == &cap[2])
        .ok_or_else(|| SlugError::InvalidDate(slug.clone()))? as u32
        + 1;
    let day: u32 = cap[3].parse().map_err(|_| SlugError::InvalidDate(slug.clone()))?;
    let year: i32 = cap[4].parse().map_err(|_| SlugError::InvalidDate(slug.clone()))?;

    let date = NaiveDate::from_ymd_opt(year, month, day)
        .ok_or_else(|| SlugError::InvalidDate(slug.clone()))?;
    Ok((cap[1].to_string(), date))
}

pub fn build_event_slug(city: &str, date: NaiveDate) -> String {
    use chrono::Datelike;
    format!(
        "highest-temperature-in-{}-on-{}-{}-{}",
        city,
        MONTHS[date.month0() as usize],
        date.day(),
        date.year()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::types::BucketKind;

    #[test]
    fn test_parse_bucket_suffixes() {
        let b = parse_bucket_suffix("44forhigher").unwrap();
        assert_eq!(b.kind(), BucketKind::AtOrAbove);
        assert_eq!(b.low(), 44);
        assert_eq!(b.unit(), TemperatureUnit::Fahrenheit);

        let b = parse_bucket_suffix("33forbelow").unwrap();
        assert_eq!(b.kind(), BucketKind::AtOrBelow);
        assert_eq!(b.low(), 33);

        let b = parse_bucket_suffix("42-43f").unwrap();
        assert_eq!(b.kind(), BucketKind::Range);
        assert_eq!((b.low(), b.high()), (42, 43));

        let b = parse_bucket_suffix("22c").unwrap();
        assert_eq!(b.kind(), BucketKind::Exact);
        assert_eq!(b.unit(), TemperatureUnit::Celsius);
    }

    #[test]
    fn test_parse_negative_temperatures() {
        let b = parse_bucket_suffix("neg3-2c").unwrap();
        assert_eq!((b.low(), b.high()), (-3, 2));

        let b = parse_bucket_suffix("neg5corbelow").unwrap();
        assert_eq!(b.low(), -5);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(parse_bucket_suffix("warm"), Err(SlugError::UnknownBucket(_))));
        assert!(matches!(parse_bucket_suffix("45-42f"), Err(SlugError::InvertedRange(_))));
    }

    #[test]
    fn test_parse_full_market_slug() {
        let b = parse_market_slug("highest-temperature-in-nyc-on-february-17-2026-42-43f").unwrap();
        assert_eq!(b.kind(), BucketKind::Range);
        assert_eq!((b.low(), b.high()), (42, 43));

        let b = parse_market_slug("highest-temperature-in-chicago-on-march-2-2026-50forhigher").unwrap();
        assert_eq!(b.kind(), BucketKind::AtOrAbove);
        assert_eq!(b.low(), 50);
    }

    #[test]
    fn test_event_slug_round_trip() {
        let date = NaiveDate::from_ymd_opt(2026, 2, 17).unwrap();
        let slug = build_event_slug("nyc", date);
        assert_eq!(slug, "highest-temperature-in-nyc-on-february-17-2026");
        assert_eq!(parse_event_slug(&slug).unwrap(), ("nyc".to_string(), date));
        assert!(parse_event_slug("highest-temperature-in-nyc-on-smarch-1-2026").is_err());
    }
}

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TemperatureUnit {
    #[serde(rename = "F")]
    Fahrenheit,
    #[serde(rename = "C")]
    Celsius,
}

impl TemperatureUnit {
    pub fn symbol(&self) -> &'static str {
        match self {
            TemperatureUnit::Fahrenheit => "F",
            TemperatureUnit::Celsius => "C",
        }
    }

    /// Convert an absolute temperature into `target`.
    pub fn convert(&self, value: f64, target: TemperatureUnit) -> f64 {
        match (self, target) {
            (TemperatureUnit::Fahrenheit, TemperatureUnit::Celsius) => (value - 32.0) * 5.0 / 9.0,
            (TemperatureUnit::Celsius, TemperatureUnit::Fahrenheit) => value * 9.0 / 5.0 + 32.0,
            _ => value,
        }
    }

    /// Convert a temperature difference (no offset) into `target`.
    pub fn convert_delta(&self, delta: f64, target: TemperatureUnit) -> f64 {
        match (self, target) {
            (TemperatureUnit::Fahrenheit, TemperatureUnit::Celsius) => delta * 5.0 / 9.0,
            (TemperatureUnit::Celsius, TemperatureUnit::Fahrenheit) => delta * 9.0 / 5.0,
            _ => delta,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BucketKind {
    AtOrAbove,
    AtOrBelow,
    Range,
    Exact,
}

impl BucketKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BucketKind::AtOrAbove => "AT_OR_ABOVE",
            BucketKind::AtOrBelow => "AT_OR_BELOW",
            BucketKind::Range => "RANGE",
            BucketKind::Exact => "EXACT",
        }
    }
}

/// One temperature outcome of a city/date event.
///
/// Bounds are inclusive integers in `unit`. For one-sided buckets only
/// `low` is meaningful and `high == low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawBucket")]
pub struct TemperatureBucket {
    kind: BucketKind,
    low: i32,
    high: i32,
    unit: TemperatureUnit,
}

#[derive(Deserialize)]
struct RawBucket {
    kind: BucketKind,
    low: i32,
    high: i32,
    unit: TemperatureUnit,
}

impl TryFrom<RawBucket> for TemperatureBucket {
    type Error = String;

    fn try_from(raw: RawBucket) -> Result<Self, Self::Error> {
        match raw.kind {
            BucketKind::Range => TemperatureBucket::range(raw.low, raw.high, raw.unit)
                .ok_or_else(|| format!("range bucket low {} > high {}", raw.low, raw.high)),
            BucketKind::AtOrAbove => Ok(TemperatureBucket::at_or_above(raw.low, raw.unit)),
            BucketKind::AtOrBelow => Ok(TemperatureBucket::at_or_below(raw.low, raw.unit)),
            BucketKind::Exact => Ok(TemperatureBucket::exact(raw.low, raw.unit)),
        }
    }
}

impl TemperatureBucket {
    pub fn at_or_above(threshold: i32, unit: TemperatureUnit) -> Self {
        Self { kind: BucketKind::AtOrAbove, low: threshold, high: threshold, unit }
    }

    pub fn at_or_below(threshold: i32, unit: TemperatureUnit) -> Self {
        Self { kind: BucketKind::AtOrBelow, low: threshold, high: threshold, unit }
    }

    pub fn exact(value: i32, unit: TemperatureUnit) -> Self {
        Self { kind: BucketKind::Exact, low: value, high: value, unit }
    }

    /// Returns `None` when `low > high`.
    pub fn range(low: i32, high: i32, unit: TemperatureUnit) -> Option<Self> {
        (low <= high).then_some(Self { kind: BucketKind::Range, low, high, unit })
    }

    pub fn kind(&self) -> BucketKind {
        self.kind
    }

    pub fn low(&self) -> i32 {
        self.low
    }

    pub fn high(&self) -> i32 {
        self.high
    }

    pub fn unit(&self) -> TemperatureUnit {
        self.unit
    }

    /// Stable ordering key inside one event: lower bound, then upper bound,
    /// with open ends sorting outermost.
    pub fn sort_key(&self) -> (i64, i64) {
        match self.kind {
            BucketKind::AtOrBelow => (i64::MIN, self.low as i64),
            BucketKind::AtOrAbove => (self.low as i64, i64::MAX),
            BucketKind::Range | BucketKind::Exact => (self.low as i64, self.high as i64),
        }
    }

    pub fn label(&self) -> String {
        let u = self.unit.symbol();
        match self.kind {
            BucketKind::AtOrAbove => format!("{}°{} or higher", self.low, u),
            BucketKind::AtOrBelow => format!("{}°{} or below", self.low, u),
            BucketKind::Range => format!("{}-{}°{}", self.low, self.high, u),
            BucketKind::Exact => format!("{}°{}", self.low, u),
        }
    }
}

/// Point forecast for a city's daily high.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastPoint {
    pub city: String,
    pub target_date: NaiveDate,
    pub value: f64,
    pub unit: TemperatureUnit,
    pub source_generated_at: DateTime<Utc>,
    pub fetched_at: DateTime<Utc>,
}

impl ForecastPoint {
    pub fn staleness(&self, now: DateTime<Utc>) -> Duration {
        now - self.source_generated_at
    }
}

/// One bucket contract as delivered by the ingestion collaborator. The
/// bucket itself is still encoded in `slug` and parsed by the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketMarket {
    pub market_id: String,
    pub slug: String,
    pub yes_price: f64,
    pub best_bid: f64,
    pub best_ask: f64,
    pub accepting_orders: bool,
    pub end_date: DateTime<Utc>,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketEvent {
    pub event_id: String,
    pub slug: String,
    pub city: String,
    pub target_date: NaiveDate,
    pub buckets: Vec<BucketMarket>,
}

/// Priced snapshot of a single bucket within one scan cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketQuote {
    pub market_id: String,
    pub event_id: String,
    pub city: String,
    pub target_date: NaiveDate,
    pub bucket: TemperatureBucket,
    pub yes_price: f64,
    pub best_bid: f64,
    pub best_ask: f64,
    pub accepting_orders: bool,
    pub end_date: DateTime<Utc>,
    pub fetched_at: DateTime<Utc>,
}

impl MarketQuote {
    pub fn from_bucket_market(event: &MarketEvent, market: &BucketMarket, bucket: TemperatureBucket) -> Self {
        Self {
            market_id: market.market_id.clone(),
            event_id: event.event_id.clone(),
            city: event.city.clone(),
            target_date: event.target_date,
            bucket,
            yes_price: market.yes_price,
            best_bid: market.best_bid,
            best_ask: market.best_ask,
            accepting_orders: market.accepting_orders,
            end_date: market.end_date,
            fetched_at: market.fetched_at,
        }
    }
}

/// Everything one scan cycle consumes from ingestion.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanInput {
    pub run_id: String,
    pub events: Vec<MarketEvent>,
    pub forecasts: Vec<ForecastPoint>,
}

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// OHLCV bar data at a fixed interval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bar {
    pub timestamp: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: f64,
}

/// Bar interval supported by the data providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "1m")]
    Min1,
    #[serde(rename = "5m")]
    Min5,
    #[serde(rename = "15m")]
    Min15,
    #[serde(rename = "1h")]
    Hour1,
    #[serde(rename = "1d")]
    Day1,
}

impl Timeframe {
    /// Approximate number of bars in one trading year, used to annualize
    /// per-bar return statistics. Intraday counts assume a 6.5-hour
    /// regular session across 252 trading days.
    pub fn bars_per_year(&self) -> f64 {
        match self {
            Timeframe::Min1 => 252.0 * 390.0,
            Timeframe::Min5 => 252.0 * 78.0,
            Timeframe::Min15 => 252.0 * 26.0,
            Timeframe::Hour1 => 252.0 * 6.5,
            Timeframe::Day1 => 252.0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::Min1 => "1m",
            Timeframe::Min5 => "5m",
            Timeframe::Min15 => "15m",
            Timeframe::Hour1 => "1h",
            Timeframe::Day1 => "1d",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "1m" => Some(Timeframe::Min1),
            "5m" => Some(Timeframe::Min5),
            "15m" => Some(Timeframe::Min15),
            "1h" => Some(Timeframe::Hour1),
            "1d" => Some(Timeframe::Day1),
            _ => None,
        }
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{Bar, MarketError, Timeframe};

/// Trait for historical bar providers.
///
/// Implementations must return bars ordered ascending by timestamp and
/// restricted to `[start, end]`. An empty range is not an error.
#[async_trait]
pub trait BarProvider: Send + Sync {
    async fn bars(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Bar>, MarketError>;
}

/// In-memory bar provider backed by pre-loaded series, keyed by symbol.
/// Used in tests and anywhere a series is already materialized.
#[derive(Default)]
pub struct StaticBarProvider {
    series: HashMap<String, Vec<Bar>>,
}

impl StaticBarProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_series(mut self, symbol: &str, mut bars: Vec<Bar>) -> Self {
        bars.sort_by_key(|b| b.timestamp);
        self.series.insert(symbol.to_uppercase(), bars);
        self
    }
}

#[async_trait]
impl BarProvider for StaticBarProvider {
    async fn bars(
        &self,
        symbol: &str,
        _timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Bar>, MarketError> {
        let series = self
            .series
            .get(&symbol.to_uppercase())
            .ok_or_else(|| MarketError::NoData(format!("no bars loaded for {}", symbol)))?;

        Ok(series
            .iter()
            .filter(|b| b.timestamp >= start && b.timestamp <= end)
            .cloned()
            .collect())
    }
}

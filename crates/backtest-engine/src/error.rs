use market_core::MarketError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BacktestError {
    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("Unknown strategy: {0}")]
    UnknownStrategy(String),

    #[error("Market data error: {0}")]
    MarketData(#[from] MarketError),

    #[error("Evaluation error: {0}")]
    Evaluation(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Invalid status transition for run {0}")]
    InvalidTransition(i64),

    #[error("Run {0} cancelled")]
    Cancelled(i64),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

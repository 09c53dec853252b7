use thiserror::Error;

#[derive(Error, Debug)]
pub enum MarketError {
    #[error("No data: {0}")]
    NoData(String),

    #[error("Invalid range: {0}")]
    InvalidRange(String),

    #[error("Provider error: {0}")]
    Provider(String),
}

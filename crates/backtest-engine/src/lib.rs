pub mod controller;
pub mod db;
pub mod engine;
pub mod error;
pub mod events;
pub mod metrics;
pub mod models;
pub mod strategy;

pub use controller::BacktestController;
pub use db::{BacktestStore, MemoryStore, SqlBacktestStore};
pub use engine::{PortfolioEngine, RiskParams, StepOutcome};
pub use error::BacktestError;
pub use events::{BacktestEvent, EventBus, Subscription};
pub use metrics::compute_metrics;
pub use models::*;
pub use strategy::{
    CloseOnlyIndicators, Comparator, IndicatorProvider, IndicatorRef, IndicatorSnapshot,
    MemoryStrategyStore, Operand, RuleExpr, RuleStrategy, SignalAction, StrategyDefinition,
    StrategyEvaluator, StrategyStore,
};

#[cfg(test)]
mod tests;

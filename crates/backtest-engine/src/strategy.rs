use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use market_core::Bar;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};

use crate::error::BacktestError;

/// Action produced by a strategy evaluation for one bar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalAction {
    Buy,
    Sell,
    Hold,
}

/// Trait for strategy evaluators.
///
/// `history` is the causal bar prefix: every bar up to and including the
/// one being evaluated, never anything later. The controller guarantees
/// this slicing, so implementations cannot look ahead even by accident.
#[async_trait]
pub trait StrategyEvaluator: Send + Sync {
    async fn evaluate(&self, history: &[Bar]) -> Result<SignalAction, BacktestError>;
}

/// Reference to a single indicator value computable at the current bar.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "indicator", rename_all = "snake_case")]
pub enum IndicatorRef {
    Close,
    Rsi { period: usize },
    Sma { period: usize },
    Ema { period: usize },
    MacdLine,
    MacdSignal,
    BollingerUpper { period: usize },
    BollingerLower { period: usize },
}

impl IndicatorRef {
    /// Stable lookup key used by [`IndicatorSnapshot`].
    pub fn key(&self) -> String {
        match self {
            IndicatorRef::Close => "close".to_string(),
            IndicatorRef::Rsi { period } => format!("rsi_{}", period),
            IndicatorRef::Sma { period } => format!("sma_{}", period),
            IndicatorRef::Ema { period } => format!("ema_{}", period),
            IndicatorRef::MacdLine => "macd_line".to_string(),
            IndicatorRef::MacdSignal => "macd_signal".to_string(),
            IndicatorRef::BollingerUpper { period } => format!("bb_upper_{}", period),
            IndicatorRef::BollingerLower { period } => format!("bb_lower_{}", period),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparator {
    Gt,
    Gte,
    Lt,
    Lte,
}

impl Comparator {
    fn apply(&self, lhs: f64, rhs: f64) -> bool {
        match self {
            Comparator::Gt => lhs > rhs,
            Comparator::Gte => lhs >= rhs,
            Comparator::Lt => lhs < rhs,
            Comparator::Lte => lhs <= rhs,
        }
    }
}

/// Right-hand side of a condition: a literal or another indicator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Operand {
    Literal(f64),
    Indicator(IndicatorRef),
}

/// Typed entry/exit rule tree. Replaces ad hoc interpretation of
/// JSON-shaped rule structures with an explicit tagged union.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuleExpr {
    Condition {
        indicator: IndicatorRef,
        comparator: Comparator,
        operand: Operand,
    },
    All { rules: Vec<RuleExpr> },
    Any { rules: Vec<RuleExpr> },
}

impl RuleExpr {
    /// Evaluate against the indicator values of the current bar.
    ///
    /// A referenced value missing from the snapshot is an evaluation
    /// error; the controller treats it as a bar-local problem (alert,
    /// hold, continue) rather than a run failure.
    pub fn evaluate(&self, snapshot: &IndicatorSnapshot) -> Result<bool, BacktestError> {
        match self {
            RuleExpr::Condition {
                indicator,
                comparator,
                operand,
            } => {
                let lhs = snapshot.get(indicator)?;
                let rhs = match operand {
                    Operand::Literal(v) => *v,
                    Operand::Indicator(r) => snapshot.get(r)?,
                };
                Ok(comparator.apply(lhs, rhs))
            }
            RuleExpr::All { rules } => {
                for rule in rules {
                    if !rule.evaluate(snapshot)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            RuleExpr::Any { rules } => {
                for rule in rules {
                    if rule.evaluate(snapshot)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
        }
    }

    /// Collect every indicator this expression reads, including operands.
    pub fn collect_refs(&self, out: &mut Vec<IndicatorRef>) {
        match self {
            RuleExpr::Condition {
                indicator, operand, ..
            } => {
                if !out.contains(indicator) {
                    out.push(indicator.clone());
                }
                if let Operand::Indicator(r) = operand {
                    if !out.contains(r) {
                        out.push(r.clone());
                    }
                }
            }
            RuleExpr::All { rules } | RuleExpr::Any { rules } => {
                for rule in rules {
                    rule.collect_refs(out);
                }
            }
        }
    }
}

/// Indicator values for one bar, keyed by [`IndicatorRef::key`].
#[derive(Debug, Clone, Default)]
pub struct IndicatorSnapshot {
    values: HashMap<String, f64>,
}

impl IndicatorSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, indicator: &IndicatorRef, value: f64) {
        self.values.insert(indicator.key(), value);
    }

    pub fn get(&self, indicator: &IndicatorRef) -> Result<f64, BacktestError> {
        self.values
            .get(&indicator.key())
            .copied()
            .ok_or_else(|| BacktestError::Evaluation(format!("missing value for {}", indicator.key())))
    }
}

/// Trait for the indicator-computation collaborator.
///
/// Implementations must derive every value from `history` alone, which
/// only ever contains bars up to the current one.
#[async_trait]
pub trait IndicatorProvider: Send + Sync {
    async fn snapshot(
        &self,
        history: &[Bar],
        refs: &[IndicatorRef],
    ) -> Result<IndicatorSnapshot, BacktestError>;
}

/// Minimal provider resolving only [`IndicatorRef::Close`]. Tests and
/// price-threshold strategies need nothing more; real indicator math
/// lives in the external indicator library.
#[derive(Default)]
pub struct CloseOnlyIndicators;

#[async_trait]
impl IndicatorProvider for CloseOnlyIndicators {
    async fn snapshot(
        &self,
        history: &[Bar],
        refs: &[IndicatorRef],
    ) -> Result<IndicatorSnapshot, BacktestError> {
        let mut snapshot = IndicatorSnapshot::new();
        let bar = history
            .last()
            .ok_or_else(|| BacktestError::Evaluation("empty bar history".to_string()))?;
        for r in refs {
            if matches!(r, IndicatorRef::Close) {
                let close = bar
                    .close
                    .to_f64()
                    .ok_or_else(|| BacktestError::Evaluation("close not representable".to_string()))?;
                snapshot.insert(r, close);
            }
        }
        Ok(snapshot)
    }
}

/// A stored strategy definition: entry/exit rule trees plus risk limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyDefinition {
    pub id: String,
    pub name: String,
    pub entry_rules: RuleExpr,
    pub exit_rules: RuleExpr,
    /// Loss fraction forcing an exit, e.g. 0.05 = exit at -5%.
    pub stop_loss_percent: Option<f64>,
    /// Gain fraction forcing an exit, e.g. 0.10 = exit at +10%.
    pub take_profit_percent: Option<f64>,
}

/// Trait for the strategy-definition store collaborator.
#[async_trait]
pub trait StrategyStore: Send + Sync {
    async fn get(&self, strategy_id: &str) -> Result<Option<StrategyDefinition>, BacktestError>;
}

/// In-memory strategy store for tests and embedding.
#[derive(Default)]
pub struct MemoryStrategyStore {
    strategies: HashMap<String, StrategyDefinition>,
}

impl MemoryStrategyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_strategy(mut self, definition: StrategyDefinition) -> Self {
        self.strategies.insert(definition.id.clone(), definition);
        self
    }
}

#[async_trait]
impl StrategyStore for MemoryStrategyStore {
    async fn get(&self, strategy_id: &str) -> Result<Option<StrategyDefinition>, BacktestError> {
        Ok(self.strategies.get(strategy_id).cloned())
    }
}

/// Evaluates a stored strategy's rule trees against per-bar indicator
/// snapshots. Entry rules are consulted before exit rules; if both fire
/// on the same bar the evaluation holds.
pub struct RuleStrategy {
    definition: StrategyDefinition,
    indicators: Arc<dyn IndicatorProvider>,
    refs: Vec<IndicatorRef>,
}

impl RuleStrategy {
    pub fn new(definition: StrategyDefinition, indicators: Arc<dyn IndicatorProvider>) -> Self {
        let mut refs = Vec::new();
        definition.entry_rules.collect_refs(&mut refs);
        definition.exit_rules.collect_refs(&mut refs);
        Self {
            definition,
            indicators,
            refs,
        }
    }

    pub fn definition(&self) -> &StrategyDefinition {
        &self.definition
    }
}

#[async_trait]
impl StrategyEvaluator for RuleStrategy {
    async fn evaluate(&self, history: &[Bar]) -> Result<SignalAction, BacktestError> {
        let snapshot = self.indicators.snapshot(history, &self.refs).await?;
        let entry = self.definition.entry_rules.evaluate(&snapshot)?;
        let exit = self.definition.exit_rules.evaluate(&snapshot)?;
        Ok(match (entry, exit) {
            (true, false) => SignalAction::Buy,
            (false, true) => SignalAction::Sell,
            _ => SignalAction::Hold,
        })
    }
}

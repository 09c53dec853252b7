use chrono::{DateTime, Utc};
use market_core::Timeframe;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// How the engine sizes a new position on a buy fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionSizing {
    /// Spend a fixed dollar amount: shares = floor(size / fill price).
    FixedDollar,
    /// Buy the literal configured number of shares.
    FixedShares,
    /// Spend a fraction of current total equity (0.0-1.0):
    /// shares = floor(equity * size / fill price).
    PercentEquity,
}

/// Configuration for a backtest run. Immutable once the run starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestConfig {
    pub strategy_id: String,
    pub symbol: String,
    pub timeframe: Timeframe,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    #[serde(default = "default_initial_cash")]
    pub initial_cash: Decimal,
    pub position_sizing: PositionSizing,
    pub position_size: Decimal,
    /// Simulated execution slippage in basis points, applied against the
    /// trader (buys fill above the close, sells below).
    #[serde(default = "default_slippage_bps")]
    pub slippage_bps: u32,
    /// Flat commission charged per fill.
    #[serde(default = "default_commission")]
    pub commission_per_trade: Decimal,
}

fn default_initial_cash() -> Decimal {
    Decimal::new(10_000, 0)
}

fn default_slippage_bps() -> u32 {
    10
}

fn default_commission() -> Decimal {
    Decimal::ONE
}

/// Run lifecycle state. Transitions are one-directional
/// (Pending -> Running -> Completed | Failed) and terminal states are
/// never mutated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(RunStatus::Pending),
            "running" => Some(RunStatus::Running),
            "completed" => Some(RunStatus::Completed),
            "failed" => Some(RunStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeSide {
    Buy,
    Sell,
}

impl TradeSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeSide::Buy => "buy",
            TradeSide::Sell => "sell",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "buy" => Some(TradeSide::Buy),
            "sell" => Some(TradeSide::Sell),
            _ => None,
        }
    }
}

/// Why a position was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    /// The strategy signalled an exit.
    Signal,
    StopLoss,
    TakeProfit,
    /// Forced liquidation at the final bar so the run ends fully realized.
    DataEnd,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::Signal => "signal",
            ExitReason::StopLoss => "stop_loss",
            ExitReason::TakeProfit => "take_profit",
            ExitReason::DataEnd => "data_end",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "signal" => Some(ExitReason::Signal),
            "stop_loss" => Some(ExitReason::StopLoss),
            "take_profit" => Some(ExitReason::TakeProfit),
            "data_end" => Some(ExitReason::DataEnd),
            _ => None,
        }
    }
}

/// One simulated fill. Created only when an order executes; append-only,
/// ordered by execution bar. Buy fills carry no realized P&L; sell fills
/// carry the realized result of the round trip they close.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub id: Option<i64>,
    pub backtest_run_id: i64,
    pub execution_bar: DateTime<Utc>,
    pub side: TradeSide,
    pub quantity: Decimal,
    /// Average entry price of the position this fill belongs to. For buy
    /// fills this equals `executed_price`.
    pub entry_price: Decimal,
    pub executed_price: Decimal,
    pub realized_pl: Option<Decimal>,
    pub realized_pl_percent: Option<f64>,
    /// Bars held between entry and exit. None for buy fills.
    pub holding_period: Option<i64>,
    pub exit_reason: Option<ExitReason>,
    /// Commission charged for this fill.
    pub commission: Decimal,
    /// Dollar cost of slippage on this fill.
    pub slippage: Decimal,
}

/// One portfolio snapshot per processed bar. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EquityPoint {
    pub backtest_run_id: i64,
    pub timestamp: DateTime<Utc>,
    pub cash: Decimal,
    pub stock_value: Decimal,
    pub total_equity: Decimal,
    pub high_water_mark: Decimal,
    /// Always <= 0; exactly 0 when equity sets a new high-water mark.
    pub drawdown_percent: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Low,
    Medium,
    High,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Low => "low",
            AlertSeverity::Medium => "medium",
            AlertSeverity::High => "high",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(AlertSeverity::Low),
            "medium" => Some(AlertSeverity::Medium),
            "high" => Some(AlertSeverity::High),
            _ => None,
        }
    }
}

/// Non-fatal anomaly recorded during a run (e.g. an order skipped for
/// insufficient cash).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub backtest_run_id: i64,
    pub severity: AlertSeverity,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Aggregate statistics computed once a run's bar series is exhausted.
///
/// Every ratio that would divide by zero is None, never NaN or infinity;
/// zero closed trades leaves all trade-derived ratios None so "no data"
/// is distinguishable from flat performance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMetrics {
    pub final_equity: Decimal,
    pub total_return: Decimal,
    pub total_return_percent: f64,
    pub sharpe_ratio: Option<f64>,
    pub sortino_ratio: Option<f64>,
    /// Most negative drawdown across the curve (<= 0).
    pub max_drawdown_percent: f64,
    pub max_drawdown_date: Option<DateTime<Utc>>,
    pub win_rate: Option<f64>,
    pub profit_factor: Option<f64>,
    pub expectancy: Option<Decimal>,
    pub avg_win_percent: Option<f64>,
    pub avg_loss_percent: Option<f64>,
    pub total_trades: i32,
    pub winning_trades: i32,
    pub losing_trades: i32,
}

/// A backtest run record: config snapshot, lifecycle state, and (once
/// completed) the final metrics block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestRun {
    pub id: i64,
    pub strategy_id: String,
    pub symbol: String,
    pub timeframe: Timeframe,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub initial_cash: Decimal,
    pub position_sizing: PositionSizing,
    pub position_size: Decimal,
    pub slippage_bps: u32,
    pub commission_per_trade: Decimal,
    pub status: RunStatus,
    pub error_message: Option<String>,
    pub bars_processed: i64,
    pub execution_time_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<RunMetrics>,
    pub created_at: Option<String>,
}

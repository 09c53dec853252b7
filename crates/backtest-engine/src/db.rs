use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use market_core::Timeframe;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;

use crate::error::BacktestError;
use crate::models::*;

/// Persistence adapter for runs, trades, equity points and alerts.
///
/// Writes for one run always come from its single run task, so rows land
/// in order and downstream readers never observe out-of-order history.
/// Status transitions are guarded one-directional; terminal rows are
/// never mutated.
#[async_trait]
pub trait BacktestStore: Send + Sync {
    /// Create a run record in Pending state. Returns the run id.
    async fn create_run(&self, config: &BacktestConfig) -> Result<i64, BacktestError>;

    async fn mark_running(&self, run_id: i64) -> Result<(), BacktestError>;

    async fn mark_completed(
        &self,
        run_id: i64,
        metrics: &RunMetrics,
        bars_processed: i64,
        execution_time_ms: i64,
    ) -> Result<(), BacktestError>;

    async fn mark_failed(
        &self,
        run_id: i64,
        message: &str,
        bars_processed: i64,
    ) -> Result<(), BacktestError>;

    async fn update_progress(&self, run_id: i64, bars_processed: i64)
        -> Result<(), BacktestError>;

    async fn append_trade(&self, trade: &Trade) -> Result<(), BacktestError>;

    async fn append_equity_point(&self, point: &EquityPoint) -> Result<(), BacktestError>;

    async fn append_alert(&self, alert: &Alert) -> Result<(), BacktestError>;

    async fn get_run(&self, run_id: i64) -> Result<Option<BacktestRun>, BacktestError>;

    /// Trades for a run ordered by execution bar, optionally filtered by
    /// side, paginated.
    async fn get_trades(
        &self,
        run_id: i64,
        side: Option<TradeSide>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Trade>, BacktestError>;

    /// Full-resolution equity curve. Downsampled resolutions (hourly,
    /// daily) are a known gap, not yet implemented.
    async fn get_equity_curve(&self, run_id: i64) -> Result<Vec<EquityPoint>, BacktestError>;

    async fn get_alerts(&self, run_id: i64) -> Result<Vec<Alert>, BacktestError>;
}

// ---------------------------------------------------------------------------
// SQL-backed store
// ---------------------------------------------------------------------------

/// Persists backtest state through sqlx.
pub struct SqlBacktestStore {
    pool: sqlx::AnyPool,
}

impl SqlBacktestStore {
    pub fn new(pool: sqlx::AnyPool) -> Self {
        Self { pool }
    }

    /// Create the backtest tables if they don't exist.
    pub async fn init_schema(&self) -> Result<(), BacktestError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS backtest_runs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                strategy_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                timeframe TEXT NOT NULL,
                start_date TEXT NOT NULL,
                end_date TEXT NOT NULL,
                initial_cash REAL NOT NULL,
                position_sizing TEXT NOT NULL,
                position_size REAL NOT NULL,
                slippage_bps INTEGER NOT NULL,
                commission_per_trade REAL NOT NULL,
                status TEXT NOT NULL,
                error_message TEXT,
                bars_processed INTEGER NOT NULL DEFAULT 0,
                execution_time_ms INTEGER,
                final_equity REAL,
                total_return REAL,
                total_return_percent REAL,
                sharpe_ratio REAL,
                sortino_ratio REAL,
                max_drawdown_percent REAL,
                max_drawdown_date TEXT,
                win_rate REAL,
                profit_factor REAL,
                expectancy REAL,
                avg_win_percent REAL,
                avg_loss_percent REAL,
                total_trades INTEGER,
                winning_trades INTEGER,
                losing_trades INTEGER,
                created_at TEXT DEFAULT CURRENT_TIMESTAMP
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS backtest_trades (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                backtest_run_id INTEGER NOT NULL,
                execution_bar TEXT NOT NULL,
                side TEXT NOT NULL,
                quantity REAL NOT NULL,
                entry_price REAL NOT NULL,
                executed_price REAL NOT NULL,
                realized_pl REAL,
                realized_pl_percent REAL,
                holding_period INTEGER,
                exit_reason TEXT,
                commission REAL NOT NULL,
                slippage REAL NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS equity_points (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                backtest_run_id INTEGER NOT NULL,
                timestamp TEXT NOT NULL,
                cash REAL NOT NULL,
                stock_value REAL NOT NULL,
                total_equity REAL NOT NULL,
                high_water_mark REAL NOT NULL,
                drawdown_percent REAL NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS backtest_alerts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                backtest_run_id INTEGER NOT NULL,
                severity TEXT NOT NULL,
                message TEXT NOT NULL,
                timestamp TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl BacktestStore for SqlBacktestStore {
    async fn create_run(&self, config: &BacktestConfig) -> Result<i64, BacktestError> {
        let (run_id,): (i64,) = sqlx::query_as(
            "INSERT INTO backtest_runs (
                strategy_id, symbol, timeframe, start_date, end_date,
                initial_cash, position_sizing, position_size,
                slippage_bps, commission_per_trade, status
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id",
        )
        .bind(&config.strategy_id)
        .bind(&config.symbol)
        .bind(config.timeframe.as_str())
        .bind(config.start_date.to_rfc3339())
        .bind(config.end_date.to_rfc3339())
        .bind(config.initial_cash.to_f64().unwrap_or(0.0))
        .bind(sizing_str(config.position_sizing))
        .bind(config.position_size.to_f64().unwrap_or(0.0))
        .bind(config.slippage_bps as i64)
        .bind(config.commission_per_trade.to_f64().unwrap_or(0.0))
        .bind(RunStatus::Pending.as_str())
        .fetch_one(&self.pool)
        .await?;

        Ok(run_id)
    }

    async fn mark_running(&self, run_id: i64) -> Result<(), BacktestError> {
        let result = sqlx::query(
            "UPDATE backtest_runs SET status = 'running' WHERE id = ? AND status = 'pending'",
        )
        .bind(run_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BacktestError::InvalidTransition(run_id));
        }
        Ok(())
    }

    async fn mark_completed(
        &self,
        run_id: i64,
        metrics: &RunMetrics,
        bars_processed: i64,
        execution_time_ms: i64,
    ) -> Result<(), BacktestError> {
        let result = sqlx::query(
            "UPDATE backtest_runs SET
                status = 'completed',
                bars_processed = ?,
                execution_time_ms = ?,
                final_equity = ?,
                total_return = ?,
                total_return_percent = ?,
                sharpe_ratio = ?,
                sortino_ratio = ?,
                max_drawdown_percent = ?,
                max_drawdown_date = ?,
                win_rate = ?,
                profit_factor = ?,
                expectancy = ?,
                avg_win_percent = ?,
                avg_loss_percent = ?,
                total_trades = ?,
                winning_trades = ?,
                losing_trades = ?
             WHERE id = ? AND status = 'running'",
        )
        .bind(bars_processed)
        .bind(execution_time_ms)
        .bind(metrics.final_equity.to_f64().unwrap_or(0.0))
        .bind(metrics.total_return.to_f64().unwrap_or(0.0))
        .bind(metrics.total_return_percent)
        .bind(metrics.sharpe_ratio)
        .bind(metrics.sortino_ratio)
        .bind(metrics.max_drawdown_percent)
        .bind(metrics.max_drawdown_date.map(|d| d.to_rfc3339()))
        .bind(metrics.win_rate)
        .bind(metrics.profit_factor)
        .bind(metrics.expectancy.map(|e| e.to_f64().unwrap_or(0.0)))
        .bind(metrics.avg_win_percent)
        .bind(metrics.avg_loss_percent)
        .bind(metrics.total_trades)
        .bind(metrics.winning_trades)
        .bind(metrics.losing_trades)
        .bind(run_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BacktestError::InvalidTransition(run_id));
        }
        Ok(())
    }

    async fn mark_failed(
        &self,
        run_id: i64,
        message: &str,
        bars_processed: i64,
    ) -> Result<(), BacktestError> {
        let result = sqlx::query(
            "UPDATE backtest_runs SET status = 'failed', error_message = ?, bars_processed = ?
             WHERE id = ? AND status IN ('pending', 'running')",
        )
        .bind(message)
        .bind(bars_processed)
        .bind(run_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BacktestError::InvalidTransition(run_id));
        }
        Ok(())
    }

    async fn update_progress(
        &self,
        run_id: i64,
        bars_processed: i64,
    ) -> Result<(), BacktestError> {
        sqlx::query(
            "UPDATE backtest_runs SET bars_processed = ? WHERE id = ? AND status = 'running'",
        )
        .bind(bars_processed)
        .bind(run_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn append_trade(&self, trade: &Trade) -> Result<(), BacktestError> {
        sqlx::query(
            "INSERT INTO backtest_trades (
                backtest_run_id, execution_bar, side, quantity,
                entry_price, executed_price, realized_pl, realized_pl_percent,
                holding_period, exit_reason, commission, slippage
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(trade.backtest_run_id)
        .bind(trade.execution_bar.to_rfc3339())
        .bind(trade.side.as_str())
        .bind(trade.quantity.to_f64().unwrap_or(0.0))
        .bind(trade.entry_price.to_f64().unwrap_or(0.0))
        .bind(trade.executed_price.to_f64().unwrap_or(0.0))
        .bind(trade.realized_pl.map(|v| v.to_f64().unwrap_or(0.0)))
        .bind(trade.realized_pl_percent)
        .bind(trade.holding_period)
        .bind(trade.exit_reason.map(|r| r.as_str()))
        .bind(trade.commission.to_f64().unwrap_or(0.0))
        .bind(trade.slippage.to_f64().unwrap_or(0.0))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn append_equity_point(&self, point: &EquityPoint) -> Result<(), BacktestError> {
        sqlx::query(
            "INSERT INTO equity_points (
                backtest_run_id, timestamp, cash, stock_value,
                total_equity, high_water_mark, drawdown_percent
            ) VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(point.backtest_run_id)
        .bind(point.timestamp.to_rfc3339())
        .bind(point.cash.to_f64().unwrap_or(0.0))
        .bind(point.stock_value.to_f64().unwrap_or(0.0))
        .bind(point.total_equity.to_f64().unwrap_or(0.0))
        .bind(point.high_water_mark.to_f64().unwrap_or(0.0))
        .bind(point.drawdown_percent)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn append_alert(&self, alert: &Alert) -> Result<(), BacktestError> {
        sqlx::query(
            "INSERT INTO backtest_alerts (backtest_run_id, severity, message, timestamp)
             VALUES (?, ?, ?, ?)",
        )
        .bind(alert.backtest_run_id)
        .bind(alert.severity.as_str())
        .bind(&alert.message)
        .bind(alert.timestamp.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_run(&self, run_id: i64) -> Result<Option<BacktestRun>, BacktestError> {
        let row = sqlx::query_as::<_, RunRow>(
            "SELECT id, strategy_id, symbol, timeframe, start_date, end_date,
                    initial_cash, position_sizing, position_size,
                    slippage_bps, commission_per_trade, status, error_message,
                    bars_processed, execution_time_ms,
                    final_equity, total_return, total_return_percent,
                    sharpe_ratio, sortino_ratio,
                    max_drawdown_percent, max_drawdown_date,
                    win_rate, profit_factor, expectancy,
                    avg_win_percent, avg_loss_percent,
                    total_trades, winning_trades, losing_trades, created_at
             FROM backtest_runs WHERE id = ?",
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| r.into_run()).transpose()
    }

    async fn get_trades(
        &self,
        run_id: i64,
        side: Option<TradeSide>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Trade>, BacktestError> {
        let rows = match side {
            Some(side) => {
                sqlx::query_as::<_, TradeRow>(
                    "SELECT id, backtest_run_id, execution_bar, side, quantity,
                            entry_price, executed_price, realized_pl, realized_pl_percent,
                            holding_period, exit_reason, commission, slippage
                     FROM backtest_trades
                     WHERE backtest_run_id = ? AND side = ?
                     ORDER BY execution_bar, id
                     LIMIT ? OFFSET ?",
                )
                .bind(run_id)
                .bind(side.as_str())
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, TradeRow>(
                    "SELECT id, backtest_run_id, execution_bar, side, quantity,
                            entry_price, executed_price, realized_pl, realized_pl_percent,
                            holding_period, exit_reason, commission, slippage
                     FROM backtest_trades
                     WHERE backtest_run_id = ?
                     ORDER BY execution_bar, id
                     LIMIT ? OFFSET ?",
                )
                .bind(run_id)
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.into_iter().map(|r| r.into_trade()).collect()
    }

    async fn get_equity_curve(&self, run_id: i64) -> Result<Vec<EquityPoint>, BacktestError> {
        let rows = sqlx::query_as::<_, EquityRow>(
            "SELECT backtest_run_id, timestamp, cash, stock_value,
                    total_equity, high_water_mark, drawdown_percent
             FROM equity_points WHERE backtest_run_id = ? ORDER BY id",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| r.into_point()).collect()
    }

    async fn get_alerts(&self, run_id: i64) -> Result<Vec<Alert>, BacktestError> {
        let rows = sqlx::query_as::<_, AlertRow>(
            "SELECT backtest_run_id, severity, message, timestamp
             FROM backtest_alerts WHERE backtest_run_id = ? ORDER BY id",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| r.into_alert()).collect()
    }
}

fn sizing_str(sizing: PositionSizing) -> &'static str {
    match sizing {
        PositionSizing::FixedDollar => "fixed_dollar",
        PositionSizing::FixedShares => "fixed_shares",
        PositionSizing::PercentEquity => "percent_equity",
    }
}

fn parse_sizing(s: &str) -> Result<PositionSizing, BacktestError> {
    match s {
        "fixed_dollar" => Ok(PositionSizing::FixedDollar),
        "fixed_shares" => Ok(PositionSizing::FixedShares),
        "percent_equity" => Ok(PositionSizing::PercentEquity),
        other => Err(BacktestError::Storage(format!(
            "unknown position sizing '{}'",
            other
        ))),
    }
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, BacktestError> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| BacktestError::Storage(format!("bad timestamp '{}': {}", s, e)))
}

/// Internal row types for sqlx deserialization.
#[derive(sqlx::FromRow)]
struct RunRow {
    id: i64,
    strategy_id: String,
    symbol: String,
    timeframe: String,
    start_date: String,
    end_date: String,
    initial_cash: f64,
    position_sizing: String,
    position_size: f64,
    slippage_bps: i64,
    commission_per_trade: f64,
    status: String,
    error_message: Option<String>,
    bars_processed: i64,
    execution_time_ms: Option<i64>,
    final_equity: Option<f64>,
    total_return: Option<f64>,
    total_return_percent: Option<f64>,
    sharpe_ratio: Option<f64>,
    sortino_ratio: Option<f64>,
    max_drawdown_percent: Option<f64>,
    max_drawdown_date: Option<String>,
    win_rate: Option<f64>,
    profit_factor: Option<f64>,
    expectancy: Option<f64>,
    avg_win_percent: Option<f64>,
    avg_loss_percent: Option<f64>,
    total_trades: Option<i32>,
    winning_trades: Option<i32>,
    losing_trades: Option<i32>,
    created_at: Option<String>,
}

impl RunRow {
    fn into_run(self) -> Result<BacktestRun, BacktestError> {
        let status = RunStatus::parse(&self.status)
            .ok_or_else(|| BacktestError::Storage(format!("unknown status '{}'", self.status)))?;
        let timeframe = Timeframe::parse(&self.timeframe).ok_or_else(|| {
            BacktestError::Storage(format!("unknown timeframe '{}'", self.timeframe))
        })?;

        // The metrics block exists only once the run has completed.
        let metrics = match (status, self.final_equity) {
            (RunStatus::Completed, Some(final_equity)) => Some(RunMetrics {
                final_equity: Decimal::from_f64(final_equity).unwrap_or_default(),
                total_return: Decimal::from_f64(self.total_return.unwrap_or(0.0))
                    .unwrap_or_default(),
                total_return_percent: self.total_return_percent.unwrap_or(0.0),
                sharpe_ratio: self.sharpe_ratio,
                sortino_ratio: self.sortino_ratio,
                max_drawdown_percent: self.max_drawdown_percent.unwrap_or(0.0),
                max_drawdown_date: self
                    .max_drawdown_date
                    .as_deref()
                    .map(parse_timestamp)
                    .transpose()?,
                win_rate: self.win_rate,
                profit_factor: self.profit_factor,
                expectancy: self.expectancy.and_then(Decimal::from_f64),
                avg_win_percent: self.avg_win_percent,
                avg_loss_percent: self.avg_loss_percent,
                total_trades: self.total_trades.unwrap_or(0),
                winning_trades: self.winning_trades.unwrap_or(0),
                losing_trades: self.losing_trades.unwrap_or(0),
            }),
            _ => None,
        };

        Ok(BacktestRun {
            id: self.id,
            strategy_id: self.strategy_id,
            symbol: self.symbol,
            timeframe,
            start_date: parse_timestamp(&self.start_date)?,
            end_date: parse_timestamp(&self.end_date)?,
            initial_cash: Decimal::from_f64(self.initial_cash).unwrap_or_default(),
            position_sizing: parse_sizing(&self.position_sizing)?,
            position_size: Decimal::from_f64(self.position_size).unwrap_or_default(),
            slippage_bps: self.slippage_bps as u32,
            commission_per_trade: Decimal::from_f64(self.commission_per_trade)
                .unwrap_or_default(),
            status,
            error_message: self.error_message,
            bars_processed: self.bars_processed,
            execution_time_ms: self.execution_time_ms,
            metrics,
            created_at: self.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct TradeRow {
    id: i64,
    backtest_run_id: i64,
    execution_bar: String,
    side: String,
    quantity: f64,
    entry_price: f64,
    executed_price: f64,
    realized_pl: Option<f64>,
    realized_pl_percent: Option<f64>,
    holding_period: Option<i64>,
    exit_reason: Option<String>,
    commission: f64,
    slippage: f64,
}

impl TradeRow {
    fn into_trade(self) -> Result<Trade, BacktestError> {
        let side = TradeSide::parse(&self.side)
            .ok_or_else(|| BacktestError::Storage(format!("unknown side '{}'", self.side)))?;
        let exit_reason = self
            .exit_reason
            .as_deref()
            .map(|s| {
                ExitReason::parse(s)
                    .ok_or_else(|| BacktestError::Storage(format!("unknown exit reason '{}'", s)))
            })
            .transpose()?;

        Ok(Trade {
            id: Some(self.id),
            backtest_run_id: self.backtest_run_id,
            execution_bar: parse_timestamp(&self.execution_bar)?,
            side,
            quantity: Decimal::from_f64(self.quantity).unwrap_or_default(),
            entry_price: Decimal::from_f64(self.entry_price).unwrap_or_default(),
            executed_price: Decimal::from_f64(self.executed_price).unwrap_or_default(),
            realized_pl: self.realized_pl.and_then(Decimal::from_f64),
            realized_pl_percent: self.realized_pl_percent,
            holding_period: self.holding_period,
            exit_reason,
            commission: Decimal::from_f64(self.commission).unwrap_or_default(),
            slippage: Decimal::from_f64(self.slippage).unwrap_or_default(),
        })
    }
}

#[derive(sqlx::FromRow)]
struct EquityRow {
    backtest_run_id: i64,
    timestamp: String,
    cash: f64,
    stock_value: f64,
    total_equity: f64,
    high_water_mark: f64,
    drawdown_percent: f64,
}

impl EquityRow {
    fn into_point(self) -> Result<EquityPoint, BacktestError> {
        Ok(EquityPoint {
            backtest_run_id: self.backtest_run_id,
            timestamp: parse_timestamp(&self.timestamp)?,
            cash: Decimal::from_f64(self.cash).unwrap_or_default(),
            stock_value: Decimal::from_f64(self.stock_value).unwrap_or_default(),
            total_equity: Decimal::from_f64(self.total_equity).unwrap_or_default(),
            high_water_mark: Decimal::from_f64(self.high_water_mark).unwrap_or_default(),
            drawdown_percent: self.drawdown_percent,
        })
    }
}

#[derive(sqlx::FromRow)]
struct AlertRow {
    backtest_run_id: i64,
    severity: String,
    message: String,
    timestamp: String,
}

impl AlertRow {
    fn into_alert(self) -> Result<Alert, BacktestError> {
        let severity = AlertSeverity::parse(&self.severity).ok_or_else(|| {
            BacktestError::Storage(format!("unknown severity '{}'", self.severity))
        })?;
        Ok(Alert {
            backtest_run_id: self.backtest_run_id,
            severity,
            message: self.message,
            timestamp: parse_timestamp(&self.timestamp)?,
        })
    }
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryInner {
    next_id: i64,
    runs: HashMap<i64, BacktestRun>,
    trades: Vec<Trade>,
    equity: Vec<EquityPoint>,
    alerts: Vec<Alert>,
}

/// In-memory store for tests and embedding; enforces the same
/// one-directional status transitions as the SQL store.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BacktestStore for MemoryStore {
    async fn create_run(&self, config: &BacktestConfig) -> Result<i64, BacktestError> {
        let mut inner = self.inner.lock().unwrap();
        inner.next_id += 1;
        let id = inner.next_id;
        inner.runs.insert(
            id,
            BacktestRun {
                id,
                strategy_id: config.strategy_id.clone(),
                symbol: config.symbol.clone(),
                timeframe: config.timeframe,
                start_date: config.start_date,
                end_date: config.end_date,
                initial_cash: config.initial_cash,
                position_sizing: config.position_sizing,
                position_size: config.position_size,
                slippage_bps: config.slippage_bps,
                commission_per_trade: config.commission_per_trade,
                status: RunStatus::Pending,
                error_message: None,
                bars_processed: 0,
                execution_time_ms: None,
                metrics: None,
                created_at: Some(Utc::now().to_rfc3339()),
            },
        );
        Ok(id)
    }

    async fn mark_running(&self, run_id: i64) -> Result<(), BacktestError> {
        let mut inner = self.inner.lock().unwrap();
        let run = inner
            .runs
            .get_mut(&run_id)
            .ok_or(BacktestError::InvalidTransition(run_id))?;
        if run.status != RunStatus::Pending {
            return Err(BacktestError::InvalidTransition(run_id));
        }
        run.status = RunStatus::Running;
        Ok(())
    }

    async fn mark_completed(
        &self,
        run_id: i64,
        metrics: &RunMetrics,
        bars_processed: i64,
        execution_time_ms: i64,
    ) -> Result<(), BacktestError> {
        let mut inner = self.inner.lock().unwrap();
        let run = inner
            .runs
            .get_mut(&run_id)
            .ok_or(BacktestError::InvalidTransition(run_id))?;
        if run.status != RunStatus::Running {
            return Err(BacktestError::InvalidTransition(run_id));
        }
        run.status = RunStatus::Completed;
        run.bars_processed = bars_processed;
        run.execution_time_ms = Some(execution_time_ms);
        run.metrics = Some(metrics.clone());
        Ok(())
    }

    async fn mark_failed(
        &self,
        run_id: i64,
        message: &str,
        bars_processed: i64,
    ) -> Result<(), BacktestError> {
        let mut inner = self.inner.lock().unwrap();
        let run = inner
            .runs
            .get_mut(&run_id)
            .ok_or(BacktestError::InvalidTransition(run_id))?;
        if run.status.is_terminal() {
            return Err(BacktestError::InvalidTransition(run_id));
        }
        run.status = RunStatus::Failed;
        run.error_message = Some(message.to_string());
        run.bars_processed = bars_processed;
        Ok(())
    }

    async fn update_progress(
        &self,
        run_id: i64,
        bars_processed: i64,
    ) -> Result<(), BacktestError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(run) = inner.runs.get_mut(&run_id) {
            if run.status == RunStatus::Running {
                run.bars_processed = bars_processed;
            }
        }
        Ok(())
    }

    async fn append_trade(&self, trade: &Trade) -> Result<(), BacktestError> {
        self.inner.lock().unwrap().trades.push(trade.clone());
        Ok(())
    }

    async fn append_equity_point(&self, point: &EquityPoint) -> Result<(), BacktestError> {
        self.inner.lock().unwrap().equity.push(point.clone());
        Ok(())
    }

    async fn append_alert(&self, alert: &Alert) -> Result<(), BacktestError> {
        self.inner.lock().unwrap().alerts.push(alert.clone());
        Ok(())
    }

    async fn get_run(&self, run_id: i64) -> Result<Option<BacktestRun>, BacktestError> {
        Ok(self.inner.lock().unwrap().runs.get(&run_id).cloned())
    }

    async fn get_trades(
        &self,
        run_id: i64,
        side: Option<TradeSide>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Trade>, BacktestError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .trades
            .iter()
            .filter(|t| t.backtest_run_id == run_id)
            .filter(|t| side.map(|s| t.side == s).unwrap_or(true))
            .skip(offset as usize)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn get_equity_curve(&self, run_id: i64) -> Result<Vec<EquityPoint>, BacktestError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .equity
            .iter()
            .filter(|p| p.backtest_run_id == run_id)
            .cloned()
            .collect())
    }

    async fn get_alerts(&self, run_id: i64) -> Result<Vec<Alert>, BacktestError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .alerts
            .iter()
            .filter(|a| a.backtest_run_id == run_id)
            .cloned()
            .collect())
    }
}

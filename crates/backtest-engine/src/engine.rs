use market_core::Bar;
use rust_decimal::prelude::*;
use rust_decimal::Decimal;

use crate::models::*;
use crate::strategy::{SignalAction, StrategyDefinition};

/// Risk limits applied by the engine before the strategy signal.
#[derive(Debug, Clone, Copy, Default)]
pub struct RiskParams {
    /// Loss fraction forcing an exit, e.g. 0.05 = exit at -5%.
    pub stop_loss_percent: Option<f64>,
    /// Gain fraction forcing an exit, e.g. 0.10 = exit at +10%.
    pub take_profit_percent: Option<f64>,
}

impl From<&StrategyDefinition> for RiskParams {
    fn from(definition: &StrategyDefinition) -> Self {
        Self {
            stop_loss_percent: definition.stop_loss_percent,
            take_profit_percent: definition.take_profit_percent,
        }
    }
}

/// The single open position. Exclusively owned by one engine instance;
/// its effect is only ever visible through Trade and EquityPoint rows.
struct Position {
    quantity: Decimal,
    avg_entry_price: Decimal,
    /// Cost basis excluding commission (quantity * avg_entry_price).
    total_cost: Decimal,
    entry_bar_index: i64,
    entry_commission: Decimal,
}

/// Everything one bar step produced, in the order it must be persisted
/// and emitted: alerts, at most one fill, exactly one equity point.
pub struct StepOutcome {
    pub trade: Option<Trade>,
    pub alerts: Vec<Alert>,
    pub equity: EquityPoint,
}

/// Virtual portfolio engine: per-run mutable state (cash, one open
/// position, trade log, equity curve), advanced one bar at a time.
///
/// Long-only, single-lot average-cost accounting. Stop-loss/take-profit
/// breaches pre-empt the strategy signal; redundant signals (buy while
/// long, sell while flat) are no-ops. Each instance belongs to exactly
/// one run, so no locking is involved.
pub struct PortfolioEngine {
    run_id: i64,
    sizing: PositionSizing,
    position_size: Decimal,
    /// Slippage as a price fraction (config bps / 10_000).
    slippage: Decimal,
    commission: Decimal,
    risk: RiskParams,

    cash: Decimal,
    position: Option<Position>,
    high_water_mark: Decimal,
    bar_index: i64,

    trades: Vec<Trade>,
    equity_curve: Vec<EquityPoint>,
}

impl PortfolioEngine {
    pub fn new(run_id: i64, config: &BacktestConfig, risk: RiskParams) -> Self {
        Self {
            run_id,
            sizing: config.position_sizing,
            position_size: config.position_size,
            slippage: Decimal::from(config.slippage_bps) / Decimal::from(10_000u32),
            commission: config.commission_per_trade,
            risk,
            cash: config.initial_cash,
            position: None,
            high_water_mark: config.initial_cash,
            bar_index: 0,
            trades: Vec::new(),
            equity_curve: Vec::new(),
        }
    }

    /// Process one bar: enforce stop-loss/take-profit, then apply the
    /// strategy signal, then mark to market and append an equity point.
    pub fn step(&mut self, bar: &Bar, signal: SignalAction) -> StepOutcome {
        let mut alerts = Vec::new();
        let mut trade = None;

        // Risk exits pre-empt the signal.
        if let Some(reason) = self.breached_risk_limit(bar) {
            trade = Some(self.close_position(bar, reason));
        } else {
            match signal {
                SignalAction::Buy if self.position.is_none() => {
                    trade = self.open_position(bar, &mut alerts);
                }
                SignalAction::Sell if self.position.is_some() => {
                    trade = Some(self.close_position(bar, ExitReason::Signal));
                }
                // Hold, buy while long, sell while flat: no pyramiding.
                _ => {}
            }
        }

        let equity = self.mark_to_market(bar);
        self.bar_index += 1;

        if let Some(ref t) = trade {
            self.trades.push(t.clone());
        }
        self.equity_curve.push(equity.clone());

        StepOutcome {
            trade,
            alerts,
            equity,
        }
    }

    /// Force-liquidate any open position at the last bar's close so the
    /// run ends with a fully realized book. Returns the closing fill.
    pub fn finish(&mut self, last_bar: &Bar) -> Option<Trade> {
        if self.position.is_none() {
            return None;
        }
        let trade = self.close_position(last_bar, ExitReason::DataEnd);
        self.trades.push(trade.clone());
        Some(trade)
    }

    pub fn cash(&self) -> Decimal {
        self.cash
    }

    /// Portfolio value after the last processed bar. Once `finish` has
    /// run this is pure cash.
    pub fn final_equity(&self) -> Decimal {
        let stock_value = self
            .position
            .as_ref()
            .map(|p| p.quantity * p.avg_entry_price)
            .unwrap_or(Decimal::ZERO);
        self.cash + stock_value
    }

    pub fn position_open(&self) -> bool {
        self.position.is_some()
    }

    pub fn trades(&self) -> &[Trade] {
        &self.trades
    }

    pub fn equity_curve(&self) -> &[EquityPoint] {
        &self.equity_curve
    }

    // --- Internals ---

    /// Unrealized P&L fraction vs the stop-loss/take-profit thresholds.
    fn breached_risk_limit(&self, bar: &Bar) -> Option<ExitReason> {
        let pos = self.position.as_ref()?;
        let entry = pos.avg_entry_price.to_f64()?;
        let close = bar.close.to_f64()?;
        if entry <= 0.0 {
            return None;
        }
        let pnl_fraction = (close - entry) / entry;

        if let Some(sl) = self.risk.stop_loss_percent {
            if pnl_fraction <= -sl {
                return Some(ExitReason::StopLoss);
            }
        }
        if let Some(tp) = self.risk.take_profit_percent {
            if pnl_fraction >= tp {
                return Some(ExitReason::TakeProfit);
            }
        }
        None
    }

    fn open_position(&mut self, bar: &Bar, alerts: &mut Vec<Alert>) -> Option<Trade> {
        // Buy-side slippage: fill above the close.
        let fill_price = bar.close * (Decimal::ONE + self.slippage);
        if fill_price <= Decimal::ZERO {
            return None;
        }

        let quantity = match self.sizing {
            PositionSizing::FixedDollar => (self.position_size / fill_price).floor(),
            PositionSizing::FixedShares => self.position_size,
            PositionSizing::PercentEquity => {
                // No position is open here, so equity is cash.
                (self.cash * self.position_size / fill_price).floor()
            }
        };

        if quantity <= Decimal::ZERO {
            alerts.push(Alert {
                backtest_run_id: self.run_id,
                severity: AlertSeverity::Low,
                message: format!(
                    "buy signal sized to zero shares at {:.2}",
                    fill_price
                ),
                timestamp: bar.timestamp,
            });
            return None;
        }

        let cost = quantity * fill_price + self.commission;
        if cost > self.cash {
            // Not a fatal condition: skip the order and keep going.
            alerts.push(Alert {
                backtest_run_id: self.run_id,
                severity: AlertSeverity::Medium,
                message: format!(
                    "insufficient cash for buy: need {:.2}, have {:.2}",
                    cost, self.cash
                ),
                timestamp: bar.timestamp,
            });
            return None;
        }

        self.cash -= cost;
        self.position = Some(Position {
            quantity,
            avg_entry_price: fill_price,
            total_cost: quantity * fill_price,
            entry_bar_index: self.bar_index,
            entry_commission: self.commission,
        });

        Some(Trade {
            id: None,
            backtest_run_id: self.run_id,
            execution_bar: bar.timestamp,
            side: TradeSide::Buy,
            quantity,
            entry_price: fill_price,
            executed_price: fill_price,
            realized_pl: None,
            realized_pl_percent: None,
            holding_period: None,
            exit_reason: None,
            commission: self.commission,
            slippage: (fill_price - bar.close) * quantity,
        })
    }

    /// Fully liquidate the open position at the bar close with sell-side
    /// slippage. Caller guarantees a position exists.
    fn close_position(&mut self, bar: &Bar, reason: ExitReason) -> Trade {
        let pos = match self.position.take() {
            Some(p) => p,
            None => unreachable!("close_position called with no open position"),
        };

        // Sell-side slippage: fill below the close.
        let fill_price = bar.close * (Decimal::ONE - self.slippage);
        let exit_commission = self.commission;
        let total_commission = pos.entry_commission + exit_commission;

        let realized_pl = (fill_price - pos.avg_entry_price) * pos.quantity - total_commission;
        let realized_pl_percent = if pos.total_cost > Decimal::ZERO {
            (realized_pl / pos.total_cost)
                .to_f64()
                .map(|f| f * 100.0)
        } else {
            None
        };

        self.cash += pos.quantity * fill_price - exit_commission;

        Trade {
            id: None,
            backtest_run_id: self.run_id,
            execution_bar: bar.timestamp,
            side: TradeSide::Sell,
            quantity: pos.quantity,
            entry_price: pos.avg_entry_price,
            executed_price: fill_price,
            realized_pl: Some(realized_pl),
            realized_pl_percent,
            holding_period: Some(self.bar_index - pos.entry_bar_index),
            exit_reason: Some(reason),
            // Round-trip commission: the exit row accounts for both fills.
            commission: total_commission,
            slippage: (bar.close - fill_price) * pos.quantity,
        }
    }

    fn mark_to_market(&mut self, bar: &Bar) -> EquityPoint {
        let stock_value = self
            .position
            .as_ref()
            .map(|p| p.quantity * bar.close)
            .unwrap_or(Decimal::ZERO);
        let total_equity = self.cash + stock_value;

        if total_equity > self.high_water_mark {
            self.high_water_mark = total_equity;
        }

        let hwm = self.high_water_mark.to_f64().unwrap_or(1.0);
        let equity = total_equity.to_f64().unwrap_or(0.0);
        let drawdown_percent = if hwm > 0.0 {
            (equity - hwm) / hwm * 100.0
        } else {
            0.0
        };

        EquityPoint {
            backtest_run_id: self.run_id,
            timestamp: bar.timestamp,
            cash: self.cash,
            stock_value,
            total_equity,
            high_water_mark: self.high_water_mark,
            drawdown_percent,
        }
    }
}

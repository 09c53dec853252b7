use market_core::Timeframe;
use rust_decimal::prelude::*;
use rust_decimal::Decimal;
use statrs::statistics::Statistics;

use crate::models::{EquityPoint, RunMetrics, Trade};

/// Compute the final statistics block for a finished run.
///
/// Pure function of the closed-trade list and equity curve.
/// `final_equity` is the realized book value after the end-of-run forced
/// liquidation, which can differ from the last curve point by that
/// fill's slippage and commission. Every ratio whose denominator is
/// zero comes back None so persisted fields never carry NaN/Infinity.
pub fn compute_metrics(
    trades: &[Trade],
    equity_curve: &[EquityPoint],
    initial_cash: Decimal,
    final_equity: Decimal,
    timeframe: Timeframe,
) -> RunMetrics {
    let total_return = final_equity - initial_cash;
    let total_return_percent = {
        let initial = initial_cash.to_f64().unwrap_or(0.0);
        let ret = total_return.to_f64().unwrap_or(0.0);
        if initial > 0.0 {
            ret / initial * 100.0
        } else {
            0.0
        }
    };

    // Only sell fills close a round trip and carry realized P&L.
    let closed: Vec<&Trade> = trades.iter().filter(|t| t.realized_pl.is_some()).collect();
    let total_trades = closed.len() as i32;

    let winners: Vec<&&Trade> = closed
        .iter()
        .filter(|t| t.realized_pl.unwrap_or(Decimal::ZERO) > Decimal::ZERO)
        .collect();
    let losers: Vec<&&Trade> = closed
        .iter()
        .filter(|t| t.realized_pl.unwrap_or(Decimal::ZERO) < Decimal::ZERO)
        .collect();
    let winning_trades = winners.len() as i32;
    let losing_trades = (closed.len() - winners.len()) as i32;

    let win_rate = if total_trades > 0 {
        Some(winning_trades as f64 / total_trades as f64 * 100.0)
    } else {
        None
    };

    let gross_profit: Decimal = winners
        .iter()
        .filter_map(|t| t.realized_pl)
        .sum();
    let gross_loss: Decimal = losers
        .iter()
        .filter_map(|t| t.realized_pl)
        .map(|p| p.abs())
        .sum();
    // No losing trades is a defined sentinel, never infinity.
    let profit_factor = if gross_loss > Decimal::ZERO {
        let gp = gross_profit.to_f64().unwrap_or(0.0);
        let gl = gross_loss.to_f64().unwrap_or(0.0);
        Some(gp / gl)
    } else {
        None
    };

    let expectancy = if total_trades > 0 {
        let sum: Decimal = closed.iter().filter_map(|t| t.realized_pl).sum();
        Some(sum / Decimal::from(total_trades))
    } else {
        None
    };

    let avg_win_percent = mean_pl_percent(&winners);
    let avg_loss_percent = mean_pl_percent(&losers);

    let (max_drawdown_percent, max_drawdown_date) = max_drawdown(equity_curve);
    let (sharpe_ratio, sortino_ratio) = risk_ratios(equity_curve, timeframe);

    RunMetrics {
        final_equity,
        total_return,
        total_return_percent,
        sharpe_ratio,
        sortino_ratio,
        max_drawdown_percent,
        max_drawdown_date,
        win_rate,
        profit_factor,
        expectancy,
        avg_win_percent,
        avg_loss_percent,
        total_trades,
        winning_trades,
        losing_trades,
    }
}

fn mean_pl_percent(trades: &[&&Trade]) -> Option<f64> {
    if trades.is_empty() {
        return None;
    }
    let percents: Vec<f64> = trades.iter().filter_map(|t| t.realized_pl_percent).collect();
    if percents.is_empty() {
        None
    } else {
        Some(percents.as_slice().mean())
    }
}

/// Most negative drawdown across the curve, with its timestamp.
fn max_drawdown(
    equity_curve: &[EquityPoint],
) -> (f64, Option<chrono::DateTime<chrono::Utc>>) {
    let mut worst = 0.0_f64;
    let mut worst_at = None;
    for point in equity_curve {
        if point.drawdown_percent < worst {
            worst = point.drawdown_percent;
            worst_at = Some(point.timestamp);
        }
    }
    (worst, worst_at)
}

/// Sharpe and Sortino from per-bar equity returns, annualized by the
/// square root of the bar count per year. Sortino restricts the
/// denominator to downside deviation.
fn risk_ratios(equity_curve: &[EquityPoint], timeframe: Timeframe) -> (Option<f64>, Option<f64>) {
    if equity_curve.len() < 3 {
        return (None, None);
    }
    let returns: Vec<f64> = equity_curve
        .windows(2)
        .filter_map(|w| {
            let prev = w[0].total_equity.to_f64()?;
            let curr = w[1].total_equity.to_f64()?;
            if prev > 0.0 {
                Some(curr / prev - 1.0)
            } else {
                None
            }
        })
        .collect();
    if returns.len() < 2 {
        return (None, None);
    }

    let annualize = timeframe.bars_per_year().sqrt();
    let mean = returns.as_slice().mean();
    let std_dev = returns.as_slice().std_dev();

    let sharpe = if std_dev > 0.0 {
        Some(mean / std_dev * annualize)
    } else {
        None
    };

    let downside: Vec<f64> = returns
        .iter()
        .filter(|r| **r < 0.0)
        .map(|r| r * r)
        .collect();
    let sortino = if downside.is_empty() {
        None
    } else {
        let downside_dev = (downside.iter().sum::<f64>() / downside.len() as f64).sqrt();
        if downside_dev > 0.0 {
            Some(mean / downside_dev * annualize)
        } else {
            None
        }
    };

    (sharpe, sortino)
}

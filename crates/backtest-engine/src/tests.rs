use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use market_core::{Bar, StaticBarProvider, Timeframe};
use rust_decimal::prelude::*;
use rust_decimal::Decimal;

use crate::controller::BacktestController;
use crate::db::{BacktestStore, MemoryStore};
use crate::engine::{PortfolioEngine, RiskParams};
use crate::error::BacktestError;
use crate::events::{BacktestEvent, EventBus, Subscription};
use crate::metrics::compute_metrics;
use crate::models::*;
use crate::strategy::*;

/// Helper: timestamp for day `n` of the test series.
fn ts(n: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + chrono::Duration::days(n)
}

fn dec(v: f64) -> Decimal {
    Decimal::from_f64(v).unwrap()
}

/// Helper: a bar at day `n` with the given close (open/high/low derived).
fn bar(n: i64, close: f64) -> Bar {
    Bar {
        timestamp: ts(n),
        open: dec(close),
        high: dec(close * 1.01),
        low: dec(close * 0.99),
        close: dec(close),
        volume: 1_000_000.0,
    }
}

fn bars_from_closes(closes: &[f64]) -> Vec<Bar> {
    closes
        .iter()
        .enumerate()
        .map(|(i, c)| bar(i as i64, *c))
        .collect()
}

/// Helper: config with frictionless defaults; tests override what they probe.
fn test_config(sizing: PositionSizing, size: f64) -> BacktestConfig {
    BacktestConfig {
        strategy_id: "strat-1".to_string(),
        symbol: "AAPL".to_string(),
        timeframe: Timeframe::Day1,
        start_date: ts(0),
        end_date: ts(60),
        initial_cash: Decimal::new(10_000, 0),
        position_sizing: sizing,
        position_size: dec(size),
        slippage_bps: 0,
        commission_per_trade: Decimal::ZERO,
    }
}

fn engine_with(config: &BacktestConfig, risk: RiskParams) -> PortfolioEngine {
    PortfolioEngine::new(1, config, risk)
}

/// Strategy that buys at or below `buy_at` and sells at or above `sell_at`.
fn threshold_strategy(buy_at: f64, sell_at: f64) -> StrategyDefinition {
    StrategyDefinition {
        id: "strat-1".to_string(),
        name: "threshold".to_string(),
        entry_rules: RuleExpr::Condition {
            indicator: IndicatorRef::Close,
            comparator: Comparator::Lte,
            operand: Operand::Literal(buy_at),
        },
        exit_rules: RuleExpr::Condition {
            indicator: IndicatorRef::Close,
            comparator: Comparator::Gte,
            operand: Operand::Literal(sell_at),
        },
        stop_loss_percent: None,
        take_profit_percent: None,
    }
}

/// Strategy whose rules can never fire.
fn inert_strategy() -> StrategyDefinition {
    threshold_strategy(-1.0, f64::MAX / 2.0)
}

fn controller_with(
    store: Arc<dyn BacktestStore>,
    closes: &[f64],
    definition: StrategyDefinition,
) -> BacktestController {
    let provider = StaticBarProvider::new().with_series("AAPL", bars_from_closes(closes));
    let strategies = MemoryStrategyStore::new().with_strategy(definition);
    BacktestController::new(
        store,
        Arc::new(provider),
        Arc::new(strategies),
        Arc::new(CloseOnlyIndicators),
    )
}

/// Drain events for one run until its terminal event, with a timeout.
async fn collect_until_terminal(
    mut rx: tokio::sync::broadcast::Receiver<BacktestEvent>,
) -> Vec<BacktestEvent> {
    let mut events = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for terminal event")
            .expect("event channel closed before terminal event");
        let terminal = event.is_terminal();
        events.push(event);
        if terminal {
            return events;
        }
    }
}

// =============================================================================
// Engine: fills, sizing, risk exits
// =============================================================================

#[test]
fn buy_then_sell_realizes_price_difference_exactly() {
    // Scenario: frictionless round trip => P&L = qty * (sell - buy).
    let config = test_config(PositionSizing::FixedDollar, 1000.0);
    let mut engine = engine_with(&config, RiskParams::default());

    let b0 = bar(0, 100.0);
    let b1 = bar(1, 110.0);

    let out = engine.step(&b0, SignalAction::Buy);
    let entry = out.trade.expect("buy should fill");
    assert_eq!(entry.side, TradeSide::Buy);
    assert_eq!(entry.quantity, dec(10.0)); // floor(1000 / 100)
    assert_eq!(entry.executed_price, dec(100.0));

    let out = engine.step(&b1, SignalAction::Sell);
    let exit = out.trade.expect("sell should fill");
    assert_eq!(exit.side, TradeSide::Sell);
    assert_eq!(exit.exit_reason, Some(ExitReason::Signal));
    assert_eq!(exit.realized_pl, Some(dec(100.0))); // 10 * (110 - 100)
    assert_eq!(exit.holding_period, Some(1));
    assert_eq!(engine.cash(), dec(10_100.0));
}

#[test]
fn buy_slippage_fills_above_close_and_sell_below() {
    let mut config = test_config(PositionSizing::FixedShares, 10.0);
    config.slippage_bps = 100; // 1% to make it obvious
    let mut engine = engine_with(&config, RiskParams::default());

    let out = engine.step(&bar(0, 100.0), SignalAction::Buy);
    let entry = out.trade.unwrap();
    assert_eq!(entry.executed_price, dec(101.0));
    assert_eq!(entry.slippage, dec(10.0)); // (101 - 100) * 10

    let out = engine.step(&bar(1, 100.0), SignalAction::Sell);
    let exit = out.trade.unwrap();
    assert_eq!(exit.executed_price, dec(99.0));
    assert_eq!(exit.slippage, dec(10.0)); // (100 - 99) * 10
}

#[test]
fn percent_equity_sizing_uses_current_equity() {
    let config = test_config(PositionSizing::PercentEquity, 0.5);
    let mut engine = engine_with(&config, RiskParams::default());

    let out = engine.step(&bar(0, 100.0), SignalAction::Buy);
    // floor(10_000 * 0.5 / 100) = 50 shares
    assert_eq!(out.trade.unwrap().quantity, dec(50.0));
}

#[test]
fn commission_is_charged_on_both_fills() {
    let mut config = test_config(PositionSizing::FixedShares, 10.0);
    config.commission_per_trade = dec(1.0);
    let mut engine = engine_with(&config, RiskParams::default());

    engine.step(&bar(0, 100.0), SignalAction::Buy);
    let out = engine.step(&bar(1, 110.0), SignalAction::Sell);
    let exit = out.trade.unwrap();

    // realized = 10 * (110 - 100) - entry commission - exit commission
    assert_eq!(exit.realized_pl, Some(dec(98.0)));
    assert_eq!(exit.commission, dec(2.0)); // round trip on the exit row
}

#[test]
fn insufficient_cash_skips_order_with_medium_alert() {
    let mut config = test_config(PositionSizing::FixedShares, 10.0);
    config.initial_cash = dec(100.0);
    let mut engine = engine_with(&config, RiskParams::default());

    let out = engine.step(&bar(0, 100.0), SignalAction::Buy);
    assert!(out.trade.is_none());
    assert!(!engine.position_open());
    assert_eq!(out.alerts.len(), 1);
    assert_eq!(out.alerts[0].severity, AlertSeverity::Medium);
    assert!(out.alerts[0].message.contains("insufficient cash"));
    // Cash untouched.
    assert_eq!(engine.cash(), dec(100.0));
}

#[test]
fn no_pyramiding_and_no_naked_sells() {
    let config = test_config(PositionSizing::FixedDollar, 1000.0);
    let mut engine = engine_with(&config, RiskParams::default());

    // Sell with no position: no-op.
    let out = engine.step(&bar(0, 100.0), SignalAction::Sell);
    assert!(out.trade.is_none());

    engine.step(&bar(1, 100.0), SignalAction::Buy);
    assert!(engine.position_open());

    // Buy while long: no-op.
    let out = engine.step(&bar(2, 100.0), SignalAction::Buy);
    assert!(out.trade.is_none());
    assert_eq!(engine.trades().len(), 1);
}

#[test]
fn stop_loss_forces_exit_on_breach_bar() {
    // Scenario: 5% stop, 5.1% drop on the bar after entry.
    let config = test_config(PositionSizing::FixedDollar, 1000.0);
    let risk = RiskParams {
        stop_loss_percent: Some(0.05),
        take_profit_percent: None,
    };
    let mut engine = engine_with(&config, risk);

    engine.step(&bar(0, 100.0), SignalAction::Buy);
    let breach = bar(1, 94.9);
    let out = engine.step(&breach, SignalAction::Hold);

    let exit = out.trade.expect("stop loss should force an exit");
    assert_eq!(exit.exit_reason, Some(ExitReason::StopLoss));
    assert_eq!(exit.execution_bar, breach.timestamp);
    assert!(!engine.position_open());
}

#[test]
fn take_profit_preempts_sell_signal() {
    let config = test_config(PositionSizing::FixedDollar, 1000.0);
    let risk = RiskParams {
        stop_loss_percent: None,
        take_profit_percent: Some(0.10),
    };
    let mut engine = engine_with(&config, risk);

    engine.step(&bar(0, 100.0), SignalAction::Buy);
    // Breach and a sell signal on the same bar: the risk exit wins.
    let out = engine.step(&bar(1, 111.0), SignalAction::Sell);
    assert_eq!(
        out.trade.unwrap().exit_reason,
        Some(ExitReason::TakeProfit)
    );
}

#[test]
fn stop_loss_not_triggered_within_threshold() {
    let config = test_config(PositionSizing::FixedDollar, 1000.0);
    let risk = RiskParams {
        stop_loss_percent: Some(0.05),
        take_profit_percent: None,
    };
    let mut engine = engine_with(&config, risk);

    engine.step(&bar(0, 100.0), SignalAction::Buy);
    let out = engine.step(&bar(1, 95.5), SignalAction::Hold); // -4.5%
    assert!(out.trade.is_none());
    assert!(engine.position_open());
}

// =============================================================================
// Engine: equity accounting invariants
// =============================================================================

#[test]
fn equity_identity_holds_at_every_point() {
    let mut config = test_config(PositionSizing::FixedDollar, 5000.0);
    config.slippage_bps = 10;
    config.commission_per_trade = dec(1.0);
    let mut engine = engine_with(&config, RiskParams::default());

    let closes = [100.0, 103.0, 101.0, 99.0, 104.0, 108.0, 102.0];
    let signals = [
        SignalAction::Buy,
        SignalAction::Hold,
        SignalAction::Hold,
        SignalAction::Sell,
        SignalAction::Buy,
        SignalAction::Hold,
        SignalAction::Sell,
    ];
    for (close, signal) in closes.iter().zip(signals) {
        engine.step(&bar(0, *close), signal);
    }

    assert_eq!(engine.equity_curve().len(), closes.len());
    for point in engine.equity_curve() {
        assert_eq!(point.cash + point.stock_value, point.total_equity);
    }
}

#[test]
fn drawdown_is_nonpositive_and_zero_only_at_high_water_mark() {
    let config = test_config(PositionSizing::FixedDollar, 10_000.0);
    let mut engine = engine_with(&config, RiskParams::default());

    let closes = [100.0, 110.0, 99.0, 105.0, 120.0, 118.0];
    engine.step(&bar(0, closes[0]), SignalAction::Buy);
    for (i, close) in closes.iter().enumerate().skip(1) {
        engine.step(&bar(i as i64, *close), SignalAction::Hold);
    }

    let mut prev_hwm = Decimal::ZERO;
    for point in engine.equity_curve() {
        assert!(point.drawdown_percent <= 0.0);
        assert!(point.high_water_mark >= prev_hwm, "HWM must not decrease");
        if point.total_equity == point.high_water_mark {
            assert_eq!(point.drawdown_percent, 0.0);
        } else {
            assert!(point.drawdown_percent < 0.0);
        }
        prev_hwm = point.high_water_mark;
    }
}

#[test]
fn realized_pl_sums_to_equity_change_after_forced_liquidation() {
    let mut config = test_config(PositionSizing::FixedDollar, 4000.0);
    config.slippage_bps = 25;
    config.commission_per_trade = dec(1.5);
    let mut engine = engine_with(&config, RiskParams::default());

    let closes = [100.0, 96.0, 103.0, 107.0, 101.0, 109.0];
    let signals = [
        SignalAction::Buy,
        SignalAction::Hold,
        SignalAction::Sell,
        SignalAction::Buy,
        SignalAction::Hold,
        SignalAction::Hold,
    ];
    let mut last = bar(0, closes[0]);
    for (i, (close, signal)) in closes.iter().zip(signals).enumerate() {
        last = bar(i as i64, *close);
        engine.step(&last, signal);
    }

    // Position still open: force the end-of-data liquidation.
    let final_trade = engine.finish(&last).expect("open position must liquidate");
    assert_eq!(final_trade.exit_reason, Some(ExitReason::DataEnd));
    assert!(!engine.position_open());

    let realized: Decimal = engine
        .trades()
        .iter()
        .filter_map(|t| t.realized_pl)
        .sum();
    assert_eq!(realized, engine.final_equity() - config.initial_cash);
}

// =============================================================================
// Metrics calculator
// =============================================================================

fn closed_trade(pl: f64, pl_pct: f64) -> Trade {
    Trade {
        id: None,
        backtest_run_id: 1,
        execution_bar: ts(0),
        side: TradeSide::Sell,
        quantity: dec(10.0),
        entry_price: dec(100.0),
        executed_price: dec(100.0 + pl / 10.0),
        realized_pl: Some(dec(pl)),
        realized_pl_percent: Some(pl_pct),
        holding_period: Some(1),
        exit_reason: Some(ExitReason::Signal),
        commission: Decimal::ZERO,
        slippage: Decimal::ZERO,
    }
}

fn equity_point(n: i64, equity: f64, hwm: f64) -> EquityPoint {
    EquityPoint {
        backtest_run_id: 1,
        timestamp: ts(n),
        cash: dec(equity),
        stock_value: Decimal::ZERO,
        total_equity: dec(equity),
        high_water_mark: dec(hwm),
        drawdown_percent: if hwm > 0.0 {
            (equity - hwm) / hwm * 100.0
        } else {
            0.0
        },
    }
}

#[test]
fn zero_trades_yields_null_ratios_not_zero() {
    let metrics = compute_metrics(&[], &[], dec(10_000.0), dec(10_000.0), Timeframe::Day1);

    assert_eq!(metrics.total_trades, 0);
    assert_eq!(metrics.total_return, Decimal::ZERO);
    assert_eq!(metrics.total_return_percent, 0.0);
    assert!(metrics.win_rate.is_none());
    assert!(metrics.profit_factor.is_none());
    assert!(metrics.expectancy.is_none());
    assert!(metrics.avg_win_percent.is_none());
    assert!(metrics.avg_loss_percent.is_none());
    assert!(metrics.sharpe_ratio.is_none());
    assert!(metrics.sortino_ratio.is_none());
    assert_eq!(metrics.max_drawdown_percent, 0.0);
    assert!(metrics.max_drawdown_date.is_none());
}

#[test]
fn trade_quality_stats_from_closed_trades() {
    let trades = vec![
        closed_trade(100.0, 10.0),
        closed_trade(-50.0, -5.0),
        closed_trade(60.0, 6.0),
        closed_trade(-30.0, -3.0),
    ];
    let metrics = compute_metrics(&trades, &[], dec(10_000.0), dec(10_080.0), Timeframe::Day1);

    assert_eq!(metrics.total_trades, 4);
    assert_eq!(metrics.winning_trades, 2);
    assert_eq!(metrics.losing_trades, 2);
    assert_eq!(metrics.win_rate, Some(50.0));
    assert_eq!(metrics.profit_factor, Some(2.0)); // 160 / 80
    assert_eq!(metrics.expectancy, Some(dec(20.0))); // 80 / 4
    assert_eq!(metrics.avg_win_percent, Some(8.0));
    assert_eq!(metrics.avg_loss_percent, Some(-4.0));
}

#[test]
fn profit_factor_is_null_without_losers() {
    let trades = vec![closed_trade(100.0, 10.0), closed_trade(40.0, 4.0)];
    let metrics = compute_metrics(&trades, &[], dec(10_000.0), dec(10_140.0), Timeframe::Day1);

    assert!(metrics.profit_factor.is_none(), "never infinity");
    assert_eq!(metrics.win_rate, Some(100.0));
    assert!(metrics.avg_loss_percent.is_none());
}

#[test]
fn max_drawdown_picks_most_negative_point_with_date() {
    let curve = vec![
        equity_point(0, 10_000.0, 10_000.0),
        equity_point(1, 10_500.0, 10_500.0),
        equity_point(2, 9_800.0, 10_500.0),
        equity_point(3, 9_450.0, 10_500.0), // -10%
        equity_point(4, 10_200.0, 10_500.0),
    ];
    let metrics = compute_metrics(&[], &curve, dec(10_000.0), dec(10_200.0), Timeframe::Day1);

    assert!((metrics.max_drawdown_percent - (-10.0)).abs() < 1e-9);
    assert_eq!(metrics.max_drawdown_date, Some(ts(3)));
}

#[test]
fn sharpe_and_sortino_from_equity_returns() {
    let curve = vec![
        equity_point(0, 10_000.0, 10_000.0),
        equity_point(1, 10_100.0, 10_100.0),
        equity_point(2, 10_050.0, 10_100.0),
        equity_point(3, 10_200.0, 10_200.0),
        equity_point(4, 10_150.0, 10_200.0),
    ];
    let metrics = compute_metrics(&[], &curve, dec(10_000.0), dec(10_150.0), Timeframe::Day1);

    let sharpe = metrics.sharpe_ratio.expect("varying returns give a sharpe");
    let sortino = metrics.sortino_ratio.expect("downside exists");
    assert!(sharpe.is_finite());
    assert!(sortino.is_finite());
    // Sortino divides by downside deviation only, which is smaller here.
    assert!(sortino > sharpe);
}

#[test]
fn flat_equity_curve_has_null_risk_ratios() {
    let curve: Vec<EquityPoint> = (0..10).map(|n| equity_point(n, 10_000.0, 10_000.0)).collect();
    let metrics = compute_metrics(&[], &curve, dec(10_000.0), dec(10_000.0), Timeframe::Day1);

    assert!(metrics.sharpe_ratio.is_none());
    assert!(metrics.sortino_ratio.is_none());
}

// =============================================================================
// Rule expressions
// =============================================================================

#[test]
fn rule_conditions_and_combinators() {
    let rsi = IndicatorRef::Rsi { period: 14 };
    let sma = IndicatorRef::Sma { period: 20 };
    let mut snapshot = IndicatorSnapshot::new();
    snapshot.insert(&rsi, 25.0);
    snapshot.insert(&sma, 101.5);
    snapshot.insert(&IndicatorRef::Close, 100.0);

    let oversold = RuleExpr::Condition {
        indicator: rsi.clone(),
        comparator: Comparator::Lt,
        operand: Operand::Literal(30.0),
    };
    let below_sma = RuleExpr::Condition {
        indicator: IndicatorRef::Close,
        comparator: Comparator::Lt,
        operand: Operand::Indicator(sma),
    };

    assert!(oversold.evaluate(&snapshot).unwrap());
    assert!(below_sma.evaluate(&snapshot).unwrap());

    let all = RuleExpr::All {
        rules: vec![oversold.clone(), below_sma.clone()],
    };
    assert!(all.evaluate(&snapshot).unwrap());

    let impossible = RuleExpr::Condition {
        indicator: rsi,
        comparator: Comparator::Gt,
        operand: Operand::Literal(70.0),
    };
    let any = RuleExpr::Any {
        rules: vec![impossible.clone(), below_sma],
    };
    assert!(any.evaluate(&snapshot).unwrap());

    let all_fails = RuleExpr::All {
        rules: vec![oversold, impossible],
    };
    assert!(!all_fails.evaluate(&snapshot).unwrap());
}

#[test]
fn missing_indicator_value_is_an_evaluation_error() {
    let rule = RuleExpr::Condition {
        indicator: IndicatorRef::Ema { period: 9 },
        comparator: Comparator::Gt,
        operand: Operand::Literal(0.0),
    };
    let err = rule.evaluate(&IndicatorSnapshot::new()).unwrap_err();
    assert!(matches!(err, BacktestError::Evaluation(_)));
}

#[test]
fn rule_trees_deserialize_from_tagged_json() {
    let json = r#"{
        "kind": "all",
        "rules": [
            {"kind": "condition",
             "indicator": {"indicator": "rsi", "period": 14},
             "comparator": "lt",
             "operand": 30.0},
            {"kind": "condition",
             "indicator": {"indicator": "close"},
             "comparator": "gt",
             "operand": {"indicator": "sma", "period": 50}}
        ]
    }"#;
    let expr: RuleExpr = serde_json::from_str(json).unwrap();

    let mut refs = Vec::new();
    expr.collect_refs(&mut refs);
    assert_eq!(refs.len(), 3);
    assert!(refs.contains(&IndicatorRef::Rsi { period: 14 }));
    assert!(refs.contains(&IndicatorRef::Sma { period: 50 }));
}

// =============================================================================
// Event bus
// =============================================================================

#[test]
fn late_subscriber_sees_nothing_after_terminal_event() {
    let bus = EventBus::new(16);
    bus.register_run(7);
    bus.publish(BacktestEvent::Failed {
        run_id: 7,
        message: "boom".to_string(),
    });

    let mut rx = bus.subscribe(Subscription::Run(7));
    assert!(rx.try_recv().is_err(), "no retroactive delivery");
}

#[test]
fn events_serialize_as_tagged_frames() {
    let event = BacktestEvent::Progress {
        run_id: 3,
        bars_processed: 50,
        total_bars: 200,
        progress_percent: 25.0,
        current_timestamp: ts(5),
    };
    let frame = serde_json::to_value(&event).unwrap();
    assert_eq!(frame["type"], "progress");
    assert_eq!(frame["run_id"], 3);
    assert_eq!(frame["progress_percent"], 25.0);
}

// =============================================================================
// Store: transitions, pagination
// =============================================================================

#[tokio::test]
async fn status_transitions_are_one_directional() {
    let store = MemoryStore::new();
    let config = test_config(PositionSizing::FixedDollar, 1000.0);
    let run_id = store.create_run(&config).await.unwrap();

    // Completed straight from pending is rejected.
    let metrics = compute_metrics(&[], &[], config.initial_cash, config.initial_cash, Timeframe::Day1);
    assert!(matches!(
        store.mark_completed(run_id, &metrics, 0, 0).await,
        Err(BacktestError::InvalidTransition(_))
    ));

    store.mark_running(run_id).await.unwrap();
    assert!(matches!(
        store.mark_running(run_id).await,
        Err(BacktestError::InvalidTransition(_))
    ));

    store.mark_completed(run_id, &metrics, 0, 0).await.unwrap();
    // Terminal rows are immutable.
    assert!(matches!(
        store.mark_failed(run_id, "late failure", 0).await,
        Err(BacktestError::InvalidTransition(_))
    ));
    let run = store.get_run(run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Completed);
}

#[tokio::test]
async fn trades_paginate_and_filter_by_side() {
    let store = MemoryStore::new();
    let config = test_config(PositionSizing::FixedDollar, 1000.0);
    let run_id = store.create_run(&config).await.unwrap();

    for i in 0..6 {
        let mut trade = closed_trade(10.0, 1.0);
        trade.backtest_run_id = run_id;
        trade.execution_bar = ts(i);
        if i % 2 == 0 {
            trade.side = TradeSide::Buy;
            trade.realized_pl = None;
        }
        store.append_trade(&trade).await.unwrap();
    }

    let sells = store
        .get_trades(run_id, Some(TradeSide::Sell), 100, 0)
        .await
        .unwrap();
    assert_eq!(sells.len(), 3);
    assert!(sells.iter().all(|t| t.side == TradeSide::Sell));

    let page = store.get_trades(run_id, None, 2, 2).await.unwrap();
    assert_eq!(page.len(), 2);
    assert_eq!(page[0].execution_bar, ts(2));
}

// =============================================================================
// Controller: lifecycle, scenarios
// =============================================================================

#[tokio::test]
async fn completed_run_persists_trades_equity_and_metrics() {
    let store = Arc::new(MemoryStore::new());
    let closes = [100.0, 105.0, 110.0, 108.0];
    let controller = controller_with(store.clone(), &closes, threshold_strategy(100.0, 110.0));

    let config = test_config(PositionSizing::FixedDollar, 1000.0);
    let run_id = controller.start(config).await.unwrap();
    let rx = controller.subscribe(Subscription::Run(run_id));
    let events = collect_until_terminal(rx).await;

    assert!(matches!(events.last(), Some(BacktestEvent::Completed { .. })));
    assert!(matches!(events.first(), Some(BacktestEvent::Started { total_bars: 4, .. })));

    let run = store.get_run(run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.bars_processed, 4);
    assert!(run.execution_time_ms.is_some());

    let metrics = run.metrics.expect("completed run carries metrics");
    assert_eq!(metrics.total_trades, 1);
    assert_eq!(metrics.winning_trades, 1);
    assert_eq!(metrics.final_equity, dec(10_100.0)); // 10 shares, +10 each
    assert_eq!(metrics.win_rate, Some(100.0));

    // One buy fill, one signal exit, ordered by execution bar.
    let trades = store.get_trades(run_id, None, 100, 0).await.unwrap();
    assert_eq!(trades.len(), 2);
    assert_eq!(trades[0].side, TradeSide::Buy);
    assert_eq!(trades[1].exit_reason, Some(ExitReason::Signal));
    assert!(trades[0].execution_bar < trades[1].execution_bar);

    let curve = store.get_equity_curve(run_id).await.unwrap();
    assert_eq!(curve.len(), 4);
    for point in &curve {
        assert_eq!(point.cash + point.stock_value, point.total_equity);
    }
}

#[tokio::test]
async fn flat_series_with_inert_strategy_changes_nothing() {
    let store = Arc::new(MemoryStore::new());
    let closes = [100.0; 8];
    let controller = controller_with(store.clone(), &closes, inert_strategy());

    let config = test_config(PositionSizing::FixedDollar, 1000.0);
    let run_id = controller.start(config.clone()).await.unwrap();
    collect_until_terminal(controller.subscribe(Subscription::Run(run_id))).await;

    let run = store.get_run(run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    let metrics = run.metrics.unwrap();
    assert_eq!(metrics.total_trades, 0);
    assert_eq!(metrics.final_equity, config.initial_cash);
    assert_eq!(metrics.max_drawdown_percent, 0.0);
}

#[tokio::test]
async fn zero_bars_in_range_completes_with_null_metrics() {
    let store = Arc::new(MemoryStore::new());
    let controller = controller_with(store.clone(), &[100.0, 101.0], inert_strategy());

    let mut config = test_config(PositionSizing::FixedDollar, 1000.0);
    // A valid window that contains no bars.
    config.start_date = ts(30);
    config.end_date = ts(40);

    let run_id = controller.start(config.clone()).await.unwrap();
    collect_until_terminal(controller.subscribe(Subscription::Run(run_id))).await;

    let run = store.get_run(run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.bars_processed, 0);
    let metrics = run.metrics.unwrap();
    assert_eq!(metrics.total_trades, 0);
    assert_eq!(metrics.final_equity, config.initial_cash);
    assert!(metrics.win_rate.is_none());
    assert!(metrics.sharpe_ratio.is_none());
    assert!(store.get_equity_curve(run_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn open_position_is_liquidated_at_data_end() {
    let store = Arc::new(MemoryStore::new());
    // Entry fires, exit threshold never reached.
    let closes = [100.0, 104.0, 106.0];
    let controller = controller_with(store.clone(), &closes, threshold_strategy(100.0, 500.0));

    let config = test_config(PositionSizing::FixedDollar, 1000.0);
    let run_id = controller.start(config.clone()).await.unwrap();
    collect_until_terminal(controller.subscribe(Subscription::Run(run_id))).await;

    let trades = store.get_trades(run_id, None, 100, 0).await.unwrap();
    let exit = trades.last().unwrap();
    assert_eq!(exit.exit_reason, Some(ExitReason::DataEnd));
    assert_eq!(exit.execution_bar, ts(2));

    // Fully realized book: realized P&L explains the whole equity change.
    let run = store.get_run(run_id).await.unwrap().unwrap();
    let metrics = run.metrics.unwrap();
    let realized: Decimal = trades.iter().filter_map(|t| t.realized_pl).sum();
    assert_eq!(realized, metrics.final_equity - config.initial_cash);
}

#[tokio::test]
async fn identical_configs_produce_identical_results() {
    let store = Arc::new(MemoryStore::new());
    let closes = [100.0, 97.0, 103.0, 111.0, 95.0, 100.0, 112.0, 108.0];
    let controller = controller_with(store.clone(), &closes, threshold_strategy(100.0, 110.0));

    let config = test_config(PositionSizing::PercentEquity, 0.5);
    let first = controller.start(config.clone()).await.unwrap();
    collect_until_terminal(controller.subscribe(Subscription::Run(first))).await;
    let second = controller.start(config).await.unwrap();
    collect_until_terminal(controller.subscribe(Subscription::Run(second))).await;

    let fingerprint = |trades: &[Trade]| -> Vec<(TradeSide, Decimal, Decimal, Option<Decimal>)> {
        trades
            .iter()
            .map(|t| (t.side, t.quantity, t.executed_price, t.realized_pl))
            .collect()
    };
    let trades_a = store.get_trades(first, None, 1000, 0).await.unwrap();
    let trades_b = store.get_trades(second, None, 1000, 0).await.unwrap();
    assert!(!trades_a.is_empty());
    assert_eq!(fingerprint(&trades_a), fingerprint(&trades_b));

    let metrics_a = store.get_run(first).await.unwrap().unwrap().metrics.unwrap();
    let metrics_b = store.get_run(second).await.unwrap().unwrap().metrics.unwrap();
    assert_eq!(
        serde_json::to_value(&metrics_a).unwrap(),
        serde_json::to_value(&metrics_b).unwrap()
    );
}

#[tokio::test]
async fn two_subscribers_receive_the_same_ordered_sequence() {
    let store = Arc::new(MemoryStore::new());
    let closes = [100.0, 105.0, 110.0, 108.0];
    let controller = controller_with(store, &closes, threshold_strategy(100.0, 110.0));

    let config = test_config(PositionSizing::FixedDollar, 1000.0);
    let run_id = controller.start(config).await.unwrap();
    let rx_a = controller.subscribe(Subscription::Run(run_id));
    let rx_b = controller.subscribe(Subscription::Run(run_id));

    let events_a = collect_until_terminal(rx_a).await;
    let events_b = collect_until_terminal(rx_b).await;

    let frames = |events: &[BacktestEvent]| -> Vec<serde_json::Value> {
        events.iter().map(|e| serde_json::to_value(e).unwrap()).collect()
    };
    assert_eq!(frames(&events_a), frames(&events_b));
}

#[tokio::test]
async fn config_errors_are_synchronous() {
    let store = Arc::new(MemoryStore::new());
    let controller = controller_with(store.clone(), &[100.0], inert_strategy());

    let mut config = test_config(PositionSizing::FixedDollar, 1000.0);
    config.start_date = ts(10);
    config.end_date = ts(5);
    assert!(matches!(
        controller.start(config).await,
        Err(BacktestError::InvalidConfig(_))
    ));

    let mut config = test_config(PositionSizing::FixedDollar, 1000.0);
    config.strategy_id = "no-such-strategy".to_string();
    assert!(matches!(
        controller.start(config).await,
        Err(BacktestError::UnknownStrategy(_))
    ));
}

#[tokio::test]
async fn cancellation_terminates_the_run_as_failed() {
    let store = Arc::new(MemoryStore::new());
    let closes: Vec<f64> = (0..50).map(|i| 100.0 + i as f64).collect();
    let controller = controller_with(store.clone(), &closes, inert_strategy());

    let config = test_config(PositionSizing::FixedDollar, 1000.0);
    let run_id = controller.start(config).await.unwrap();
    // Current-thread runtime: the run task has not polled yet, so the
    // flag is guaranteed to be seen on the first bar.
    assert!(controller.cancel(run_id));

    let events = collect_until_terminal(controller.subscribe(Subscription::Run(run_id))).await;
    assert!(matches!(events.last(), Some(BacktestEvent::Failed { .. })));

    let run = store.get_run(run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.error_message.unwrap().contains("cancelled"));
}

/// Store wrapper that fails every equity append after the first N.
struct FailingStore {
    inner: MemoryStore,
    allowed: AtomicUsize,
}

#[async_trait]
impl BacktestStore for FailingStore {
    async fn create_run(&self, config: &BacktestConfig) -> Result<i64, BacktestError> {
        self.inner.create_run(config).await
    }
    async fn mark_running(&self, run_id: i64) -> Result<(), BacktestError> {
        self.inner.mark_running(run_id).await
    }
    async fn mark_completed(
        &self,
        run_id: i64,
        metrics: &RunMetrics,
        bars_processed: i64,
        execution_time_ms: i64,
    ) -> Result<(), BacktestError> {
        self.inner
            .mark_completed(run_id, metrics, bars_processed, execution_time_ms)
            .await
    }
    async fn mark_failed(
        &self,
        run_id: i64,
        message: &str,
        bars_processed: i64,
    ) -> Result<(), BacktestError> {
        self.inner.mark_failed(run_id, message, bars_processed).await
    }
    async fn update_progress(&self, run_id: i64, bars_processed: i64) -> Result<(), BacktestError> {
        self.inner.update_progress(run_id, bars_processed).await
    }
    async fn append_trade(&self, trade: &Trade) -> Result<(), BacktestError> {
        self.inner.append_trade(trade).await
    }
    async fn append_equity_point(&self, point: &EquityPoint) -> Result<(), BacktestError> {
        if self.allowed.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_err()
        {
            return Err(BacktestError::Storage("equity table unavailable".to_string()));
        }
        self.inner.append_equity_point(point).await
    }
    async fn append_alert(&self, alert: &Alert) -> Result<(), BacktestError> {
        self.inner.append_alert(alert).await
    }
    async fn get_run(&self, run_id: i64) -> Result<Option<BacktestRun>, BacktestError> {
        self.inner.get_run(run_id).await
    }
    async fn get_trades(
        &self,
        run_id: i64,
        side: Option<TradeSide>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Trade>, BacktestError> {
        self.inner.get_trades(run_id, side, limit, offset).await
    }
    async fn get_equity_curve(&self, run_id: i64) -> Result<Vec<EquityPoint>, BacktestError> {
        self.inner.get_equity_curve(run_id).await
    }
    async fn get_alerts(&self, run_id: i64) -> Result<Vec<Alert>, BacktestError> {
        self.inner.get_alerts(run_id).await
    }
}

#[tokio::test]
async fn mid_run_storage_failure_lands_in_failed_with_partial_history() {
    let store = Arc::new(FailingStore {
        inner: MemoryStore::new(),
        allowed: AtomicUsize::new(2),
    });
    let closes = [100.0, 101.0, 102.0, 103.0, 104.0];
    let controller = controller_with(store.clone(), &closes, inert_strategy());

    let config = test_config(PositionSizing::FixedDollar, 1000.0);
    let run_id = controller.start(config).await.unwrap();
    let events = collect_until_terminal(controller.subscribe(Subscription::Run(run_id))).await;

    match events.last() {
        Some(BacktestEvent::Failed { message, .. }) => {
            assert!(message.contains("equity table unavailable"))
        }
        other => panic!("expected failed event, got {:?}", other),
    }

    let run = store.get_run(run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert!(!run.error_message.unwrap_or_default().is_empty());
    // The two points persisted before the fault are preserved.
    assert_eq!(store.get_equity_curve(run_id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn evaluator_failure_on_one_bar_is_recovered_with_an_alert() {
    // A provider that never supplies the referenced indicator: every bar
    // logs an alert and holds, and the run still completes.
    struct EmptyIndicators;

    #[async_trait]
    impl IndicatorProvider for EmptyIndicators {
        async fn snapshot(
            &self,
            _history: &[Bar],
            _refs: &[IndicatorRef],
        ) -> Result<IndicatorSnapshot, BacktestError> {
            Ok(IndicatorSnapshot::new())
        }
    }

    let store = Arc::new(MemoryStore::new());
    let provider = StaticBarProvider::new()
        .with_series("AAPL", bars_from_closes(&[100.0, 101.0, 102.0]));
    let strategies = MemoryStrategyStore::new().with_strategy(threshold_strategy(100.0, 110.0));
    let controller = BacktestController::new(
        store.clone(),
        Arc::new(provider),
        Arc::new(strategies),
        Arc::new(EmptyIndicators),
    );

    let config = test_config(PositionSizing::FixedDollar, 1000.0);
    let run_id = controller.start(config).await.unwrap();
    collect_until_terminal(controller.subscribe(Subscription::Run(run_id))).await;

    let run = store.get_run(run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.metrics.unwrap().total_trades, 0);

    let alerts = store.get_alerts(run_id).await.unwrap();
    assert_eq!(alerts.len(), 3);
    assert!(alerts.iter().all(|a| a.severity == AlertSeverity::Medium));
}

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use market_core::BarProvider;
use rust_decimal::Decimal;
use tokio::sync::broadcast;

use crate::db::BacktestStore;
use crate::engine::{PortfolioEngine, RiskParams};
use crate::error::BacktestError;
use crate::events::{BacktestEvent, EventBus, Subscription};
use crate::metrics::compute_metrics;
use crate::models::*;
use crate::strategy::{
    IndicatorProvider, RuleStrategy, SignalAction, StrategyDefinition, StrategyEvaluator,
    StrategyStore,
};

/// Orchestrates backtest runs: validates configs, spawns one task per
/// run, drives the engine bar-by-bar, persists history in order, and
/// broadcasts live events.
///
/// Cheap to clone; every field is shared. Runs never share mutable
/// state with each other — each gets its own engine and evaluator.
#[derive(Clone)]
pub struct BacktestController {
    store: Arc<dyn BacktestStore>,
    bars: Arc<dyn BarProvider>,
    strategies: Arc<dyn StrategyStore>,
    indicators: Arc<dyn IndicatorProvider>,
    events: Arc<EventBus>,
    cancel_flags: Arc<DashMap<i64, Arc<AtomicBool>>>,
    /// Emit a progress event every this many bars (and on the last bar).
    progress_interval: usize,
}

struct RunProgress {
    bars_processed: i64,
}

impl BacktestController {
    pub fn new(
        store: Arc<dyn BacktestStore>,
        bars: Arc<dyn BarProvider>,
        strategies: Arc<dyn StrategyStore>,
        indicators: Arc<dyn IndicatorProvider>,
    ) -> Self {
        Self {
            store,
            bars,
            strategies,
            indicators,
            events: Arc::new(EventBus::default()),
            cancel_flags: Arc::new(DashMap::new()),
            progress_interval: 10,
        }
    }

    pub fn with_progress_interval(mut self, bars: usize) -> Self {
        self.progress_interval = bars.max(1);
        self
    }

    /// Start a backtest. Config errors are reported here, synchronously,
    /// before any run record exists; everything after the returned id is
    /// asynchronous.
    pub async fn start(&self, config: BacktestConfig) -> Result<i64, BacktestError> {
        validate_config(&config)?;

        let definition = self
            .strategies
            .get(&config.strategy_id)
            .await?
            .ok_or_else(|| BacktestError::UnknownStrategy(config.strategy_id.clone()))?;

        let run_id = self.store.create_run(&config).await?;
        self.events.register_run(run_id);
        self.cancel_flags
            .insert(run_id, Arc::new(AtomicBool::new(false)));

        tracing::info!(
            run_id,
            strategy = %config.strategy_id,
            symbol = %config.symbol,
            "backtest run created"
        );

        let controller = self.clone();
        tokio::spawn(async move {
            controller.execute(run_id, config, definition).await;
        });

        Ok(run_id)
    }

    /// Request cancellation of an in-flight run. The run task checks the
    /// flag once per bar and terminates as Failed. Returns false if the
    /// run is not active.
    pub fn cancel(&self, run_id: i64) -> bool {
        match self.cancel_flags.get(&run_id) {
            Some(flag) => {
                flag.store(true, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    pub fn subscribe(&self, subscription: Subscription) -> broadcast::Receiver<BacktestEvent> {
        self.events.subscribe(subscription)
    }

    // --- Query surface (delegates to the store) ---

    pub async fn run(&self, run_id: i64) -> Result<Option<BacktestRun>, BacktestError> {
        self.store.get_run(run_id).await
    }

    pub async fn trades(
        &self,
        run_id: i64,
        side: Option<TradeSide>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Trade>, BacktestError> {
        self.store.get_trades(run_id, side, limit, offset).await
    }

    pub async fn equity_curve(&self, run_id: i64) -> Result<Vec<EquityPoint>, BacktestError> {
        self.store.get_equity_curve(run_id).await
    }

    pub async fn alerts(&self, run_id: i64) -> Result<Vec<Alert>, BacktestError> {
        self.store.get_alerts(run_id).await
    }

    // --- Run execution ---

    /// Top-level run task. Whatever happens inside the loop, the run
    /// lands in a terminal state and a terminal event goes out; partial
    /// trade/equity history is already persisted and stays.
    async fn execute(&self, run_id: i64, config: BacktestConfig, definition: StrategyDefinition) {
        let started = Instant::now();
        let mut progress = RunProgress { bars_processed: 0 };

        match self
            .run_loop(run_id, &config, &definition, started, &mut progress)
            .await
        {
            Ok(run) => {
                tracing::info!(
                    run_id,
                    trades = run.metrics.as_ref().map(|m| m.total_trades).unwrap_or(0),
                    elapsed_ms = started.elapsed().as_millis() as i64,
                    "backtest run completed"
                );
                self.events.publish(BacktestEvent::Completed {
                    run_id,
                    run: Box::new(run),
                });
            }
            Err(err) => {
                let message = err.to_string();
                tracing::error!(run_id, error = %message, "backtest run failed");
                if let Err(store_err) = self
                    .store
                    .mark_failed(run_id, &message, progress.bars_processed)
                    .await
                {
                    tracing::error!(run_id, error = %store_err, "failed to persist run failure");
                }
                self.events
                    .publish(BacktestEvent::Failed { run_id, message });
            }
        }

        self.cancel_flags.remove(&run_id);
    }

    async fn run_loop(
        &self,
        run_id: i64,
        config: &BacktestConfig,
        definition: &StrategyDefinition,
        started: Instant,
        progress: &mut RunProgress,
    ) -> Result<BacktestRun, BacktestError> {
        // Loading the series is the first structural failure point.
        let bars = self
            .bars
            .bars(
                &config.symbol,
                config.timeframe,
                config.start_date,
                config.end_date,
            )
            .await?;

        self.store.mark_running(run_id).await?;
        let total_bars = bars.len() as i64;
        self.events.publish(BacktestEvent::Started { run_id, total_bars });

        let evaluator = RuleStrategy::new(definition.clone(), self.indicators.clone());
        let mut engine = PortfolioEngine::new(run_id, config, RiskParams::from(definition));
        let cancelled = self
            .cancel_flags
            .get(&run_id)
            .map(|f| Arc::clone(f.value()))
            .unwrap_or_else(|| Arc::new(AtomicBool::new(false)));

        for (i, bar) in bars.iter().enumerate() {
            if cancelled.load(Ordering::Relaxed) {
                return Err(BacktestError::Cancelled(run_id));
            }

            // The evaluator only ever sees the causal prefix.
            let signal = match evaluator.evaluate(&bars[..=i]).await {
                Ok(signal) => signal,
                Err(err) => {
                    // Bar-local problem: record it and keep going.
                    tracing::warn!(run_id, bar = i, error = %err, "evaluation failed, holding");
                    let alert = Alert {
                        backtest_run_id: run_id,
                        severity: AlertSeverity::Medium,
                        message: format!("evaluation failed at {}: {}", bar.timestamp, err),
                        timestamp: bar.timestamp,
                    };
                    self.store.append_alert(&alert).await?;
                    self.events.publish(BacktestEvent::Alert { run_id, alert });
                    SignalAction::Hold
                }
            };

            let outcome = engine.step(bar, signal);

            for alert in outcome.alerts {
                self.store.append_alert(&alert).await?;
                self.events.publish(BacktestEvent::Alert { run_id, alert });
            }
            if let Some(trade) = outcome.trade {
                self.store.append_trade(&trade).await?;
                self.events
                    .publish(BacktestEvent::TradeExecuted { run_id, trade });
            }
            self.store.append_equity_point(&outcome.equity).await?;
            self.events.publish(BacktestEvent::EquityUpdate {
                run_id,
                point: outcome.equity,
            });

            progress.bars_processed = (i + 1) as i64;
            let last = i + 1 == bars.len();
            if (i + 1) % self.progress_interval == 0 || last {
                self.store
                    .update_progress(run_id, progress.bars_processed)
                    .await?;
                self.events.publish(BacktestEvent::Progress {
                    run_id,
                    bars_processed: progress.bars_processed,
                    total_bars,
                    progress_percent: if total_bars > 0 {
                        progress.bars_processed as f64 / total_bars as f64 * 100.0
                    } else {
                        100.0
                    },
                    current_timestamp: bar.timestamp,
                });
            }
        }

        // Every run ends with a fully realized book: force-liquidate at
        // the last close so metrics carry no unrealized P&L.
        if let Some(last_bar) = bars.last() {
            if let Some(trade) = engine.finish(last_bar) {
                self.store.append_trade(&trade).await?;
                self.events
                    .publish(BacktestEvent::TradeExecuted { run_id, trade });
            }
        }

        let metrics = compute_metrics(
            engine.trades(),
            engine.equity_curve(),
            config.initial_cash,
            engine.final_equity(),
            config.timeframe,
        );

        self.store
            .mark_completed(
                run_id,
                &metrics,
                progress.bars_processed,
                started.elapsed().as_millis() as i64,
            )
            .await?;

        self.store
            .get_run(run_id)
            .await?
            .ok_or_else(|| BacktestError::Storage(format!("run {} missing after completion", run_id)))
    }
}

fn validate_config(config: &BacktestConfig) -> Result<(), BacktestError> {
    if config.symbol.trim().is_empty() {
        return Err(BacktestError::InvalidConfig("symbol is empty".to_string()));
    }
    if config.start_date >= config.end_date {
        return Err(BacktestError::InvalidConfig(format!(
            "start date {} is not before end date {}",
            config.start_date, config.end_date
        )));
    }
    if config.initial_cash <= Decimal::ZERO {
        return Err(BacktestError::InvalidConfig(
            "initial cash must be positive".to_string(),
        ));
    }
    if config.position_size <= Decimal::ZERO {
        return Err(BacktestError::InvalidConfig(
            "position size must be positive".to_string(),
        ));
    }
    Ok(())
}

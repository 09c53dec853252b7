use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::models::{Alert, BacktestRun, EquityPoint, Trade};

/// Live event emitted while a run executes. The tagged serialization is
/// what a push-style HTTP stream writes out, one discrete text frame
/// per event.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BacktestEvent {
    Started {
        run_id: i64,
        total_bars: i64,
    },
    Progress {
        run_id: i64,
        bars_processed: i64,
        total_bars: i64,
        progress_percent: f64,
        current_timestamp: DateTime<Utc>,
    },
    TradeExecuted {
        run_id: i64,
        trade: Trade,
    },
    EquityUpdate {
        run_id: i64,
        point: EquityPoint,
    },
    Alert {
        run_id: i64,
        alert: Alert,
    },
    Completed {
        run_id: i64,
        run: Box<BacktestRun>,
    },
    Failed {
        run_id: i64,
        message: String,
    },
}

impl BacktestEvent {
    pub fn run_id(&self) -> i64 {
        match self {
            BacktestEvent::Started { run_id, .. }
            | BacktestEvent::Progress { run_id, .. }
            | BacktestEvent::TradeExecuted { run_id, .. }
            | BacktestEvent::EquityUpdate { run_id, .. }
            | BacktestEvent::Alert { run_id, .. }
            | BacktestEvent::Completed { run_id, .. }
            | BacktestEvent::Failed { run_id, .. } => *run_id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BacktestEvent::Completed { .. } | BacktestEvent::Failed { .. }
        )
    }
}

/// What a subscriber wants to observe.
#[derive(Debug, Clone, Copy)]
pub enum Subscription {
    /// Events for a single run.
    Run(i64),
    /// Events for every run.
    All,
}

/// In-process publish/subscribe keyed by run id, with one wildcard
/// channel spanning all runs.
///
/// Delivery is best-effort and never blocks the simulation loop: events
/// go through bounded broadcast channels, so a slow subscriber lags and
/// drops rather than stalling the run, and a panicking subscriber only
/// kills its own task. A subscriber connecting after a run's terminal
/// event receives nothing retroactively and must query persisted state.
pub struct EventBus {
    channels: DashMap<i64, broadcast::Sender<BacktestEvent>>,
    wildcard: broadcast::Sender<BacktestEvent>,
    capacity: usize,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (wildcard, _) = broadcast::channel(capacity);
        Self {
            channels: DashMap::new(),
            wildcard,
            capacity,
        }
    }

    /// Create the per-run channel ahead of execution so subscribers who
    /// attach between `start` returning and the first bar see every event.
    pub fn register_run(&self, run_id: i64) {
        self.channels
            .entry(run_id)
            .or_insert_with(|| broadcast::channel(self.capacity).0);
    }

    pub fn subscribe(&self, subscription: Subscription) -> broadcast::Receiver<BacktestEvent> {
        match subscription {
            Subscription::All => self.wildcard.subscribe(),
            Subscription::Run(run_id) => self
                .channels
                .entry(run_id)
                .or_insert_with(|| broadcast::channel(self.capacity).0)
                .subscribe(),
        }
    }

    /// Fire-and-forget publish. Send errors mean no live subscribers,
    /// which is fine. The per-run channel is retired after its terminal
    /// event.
    pub fn publish(&self, event: BacktestEvent) {
        let run_id = event.run_id();
        let terminal = event.is_terminal();

        if let Some(sender) = self.channels.get(&run_id) {
            let _ = sender.send(event.clone());
        }
        let _ = self.wildcard.send(event);

        if terminal {
            self.channels.remove(&run_id);
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        // Large enough that a briefly busy subscriber does not lag out
        // of a bar-per-event stream.
        Self::new(2048)
    }
}

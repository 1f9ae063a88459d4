//! Internal sweep timer
//!
//! Drives the three sweeps on their configured cadences. Every interval fires
//! once immediately on start, so a freshly started scheduler sweeps right away.
//! Each tick runs its sweep on a separate task; a sweep that outlasts its
//! interval is caught by the scheduler's per-kind lock and the next tick is
//! skipped rather than queued up.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, Interval, MissedTickBehavior};

use super::{Scheduler, SweepKind};
use crate::config::SchedulerConfig;

/// Timer loop for full, priority and retention sweeps
pub struct SweepTicker {
    scheduler: Arc<Scheduler>,
    full_every: Duration,
    priority_every: Duration,
    retention_every: Duration,
    shutdown: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl SweepTicker {
    pub fn new(scheduler: Arc<Scheduler>, config: &SchedulerConfig) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        Self {
            scheduler,
            full_every: Duration::from_secs(config.full_sweep_interval_secs.max(1)),
            priority_every: Duration::from_secs(config.priority_sweep_interval_secs.max(1)),
            retention_every: Duration::from_secs(config.retention_sweep_interval_secs.max(1)),
            shutdown,
            shutdown_rx,
        }
    }

    /// Run until [`stop`](Self::stop) is called
    pub async fn run(&self) {
        let mut shutdown_rx = self.shutdown_rx.clone();
        if *shutdown_rx.borrow() {
            return;
        }

        let mut full = ticker(self.full_every);
        let mut priority = ticker(self.priority_every);
        let mut retention = ticker(self.retention_every);

        tracing::info!(
            full_secs = self.full_every.as_secs(),
            priority_secs = self.priority_every.as_secs(),
            retention_secs = self.retention_every.as_secs(),
            "Sweep ticker started"
        );

        loop {
            tokio::select! {
                _ = full.tick() => self.spawn_sweep(SweepKind::Full),
                _ = priority.tick() => self.spawn_sweep(SweepKind::Priority),
                _ = retention.tick() => self.spawn_sweep(SweepKind::Retention),
                _ = shutdown_rx.changed() => {
                    tracing::info!("Sweep ticker shutting down");
                    break;
                }
            }
        }
    }

    /// Stop the ticker
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }

    fn spawn_sweep(&self, kind: SweepKind) {
        let scheduler = self.scheduler.clone();
        tokio::spawn(async move {
            // Errors are logged and counted inside `run`
            let _ = scheduler.run(kind).await;
        });
    }
}

fn ticker(period: Duration) -> Interval {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::config::{Config, QueueBackend, QueueConfig};
    use crate::queue::{JobQueue, MemoryJobQueue};
    use crate::storage::{ShipmentStore, SqliteStore};

    #[tokio::test(start_paused = true)]
    async fn test_ticker_sweeps_on_start_and_stops() {
        let clock = Arc::new(ManualClock::starting_now());
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let queue = Arc::new(MemoryJobQueue::new(
            &QueueConfig {
                backend: QueueBackend::Memory,
                max_attempts: 3,
                backoff_base_ms: 5_000,
                backoff_max_ms: 300_000,
            },
            clock.clone(),
        ));
        store
            .insert_new(&["AWB1".to_string(), "AWB2".to_string()], clock.now())
            .await
            .unwrap();

        let config = Config::default();
        let scheduler = Arc::new(Scheduler::new(
            store.clone(),
            queue.clone(),
            clock.clone(),
            &config,
        ));
        let ticker = Arc::new(SweepTicker::new(scheduler, &config.scheduler));

        let handle = tokio::spawn({
            let ticker = ticker.clone();
            async move { ticker.run().await }
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(queue.depth().await.unwrap().waiting, 1);

        ticker.stop();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("ticker should stop")
            .unwrap();
    }

    #[tokio::test]
    async fn test_stopped_ticker_returns_immediately() {
        let clock = Arc::new(ManualClock::starting_now());
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let config = Config::default();
        let queue = Arc::new(MemoryJobQueue::new(&config.queue, clock.clone()));
        let scheduler = Arc::new(Scheduler::new(store, queue, clock, &config));
        let ticker = SweepTicker::new(scheduler, &config.scheduler);

        ticker.stop();
        tokio::time::timeout(Duration::from_secs(1), ticker.run())
            .await
            .expect("ticker should not start after stop");
    }
}

//! Crawl statistics
//!
//! A single actor task owns the counters. Callers send lifecycle events over an
//! unbounded channel, so recording never blocks and mutations are applied in
//! arrival order. While the crawl is active the actor logs a snapshot on a
//! fixed interval.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Default period between progress reports
pub const DEFAULT_REPORT_INTERVAL: Duration = Duration::from_secs(10);

/// Point-in-time view of the counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Requests started, retries included
    pub total: u64,
    pub success: u64,
    pub failed: u64,
    /// Started but not yet finished
    pub remaining: u64,
    pub elapsed: Duration,
    /// Periodic reports logged so far
    pub reports: u64,
}

enum StatsCommand {
    Started,
    Succeeded,
    Failed,
    Snapshot(oneshot::Sender<StatsSnapshot>),
    Shutdown(oneshot::Sender<StatsSnapshot>),
}

#[derive(Default)]
struct Counters {
    total: u64,
    success: u64,
    failed: u64,
    remaining: u64,
    reports: u64,
}

impl Counters {
    fn apply(&mut self, command: &StatsCommand) {
        match command {
            StatsCommand::Started => {
                self.total += 1;
                self.remaining += 1;
            }
            StatsCommand::Succeeded => {
                self.success += 1;
                self.remaining = self.remaining.saturating_sub(1);
            }
            StatsCommand::Failed => {
                self.failed += 1;
                self.remaining = self.remaining.saturating_sub(1);
            }
            StatsCommand::Snapshot(_) | StatsCommand::Shutdown(_) => {}
        }
    }

    fn snapshot(&self, start: Instant) -> StatsSnapshot {
        StatsSnapshot {
            total: self.total,
            success: self.success,
            failed: self.failed,
            remaining: self.remaining,
            elapsed: start.elapsed(),
            reports: self.reports,
        }
    }
}

/// Handle to the statistics actor
pub struct StatsTracker {
    tx: mpsc::UnboundedSender<StatsCommand>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl StatsTracker {
    /// Starts the actor
    ///
    /// # Arguments
    ///
    /// * `cancel` - Lifecycle token; periodic reporting stops once it fires
    /// * `interval` - Report period, or `None` to disable periodic reports
    pub fn spawn(cancel: CancellationToken, interval: Option<Duration>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run(rx, cancel, interval));

        Self {
            tx,
            handle: Mutex::new(Some(handle)),
        }
    }

    pub fn record_started(&self) {
        self.send(StatsCommand::Started);
    }

    pub fn record_success(&self) {
        self.send(StatsCommand::Succeeded);
    }

    pub fn record_failure(&self) {
        self.send(StatsCommand::Failed);
    }

    fn send(&self, command: StatsCommand) {
        // After shutdown there is nobody left to count
        let _ = self.tx.send(command);
    }

    /// Current counters, or `None` once the actor has shut down
    pub async fn snapshot(&self) -> Option<StatsSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(StatsCommand::Snapshot(reply)).ok()?;
        rx.await.ok()
    }

    /// Stops the actor and returns the final counters
    ///
    /// Events sent before this call are counted. Safe to call more than once.
    pub async fn shutdown(&self) -> Option<StatsSnapshot> {
        let (reply, rx) = oneshot::channel();
        let final_stats = match self.tx.send(StatsCommand::Shutdown(reply)) {
            Ok(()) => rx.await.ok(),
            Err(_) => None,
        };

        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Stats task panicked");
            }
        }

        final_stats
    }
}

async fn run(
    mut rx: mpsc::UnboundedReceiver<StatsCommand>,
    cancel: CancellationToken,
    interval: Option<Duration>,
) {
    let start = Instant::now();
    let mut counters = Counters::default();

    let period = interval.unwrap_or(DEFAULT_REPORT_INTERVAL);
    let mut ticker = tokio::time::interval_at(start + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut reporting = interval.is_some();

    loop {
        tokio::select! {
            command = rx.recv() => {
                let Some(command) = command else {
                    break;
                };
                counters.apply(&command);
                match command {
                    StatsCommand::Snapshot(reply) => {
                        let _ = reply.send(counters.snapshot(start));
                    }
                    StatsCommand::Shutdown(reply) => {
                        let stats = counters.snapshot(start);
                        tracing::info!(
                            total = stats.total,
                            success = stats.success,
                            failed = stats.failed,
                            remaining = stats.remaining,
                            elapsed_secs = stats.elapsed.as_secs_f64(),
                            "Final crawl statistics"
                        );
                        let _ = reply.send(stats);
                        break;
                    }
                    _ => {}
                }
            }

            _ = ticker.tick(), if reporting => {
                counters.reports += 1;
                let stats = counters.snapshot(start);
                tracing::info!(
                    total = stats.total,
                    success = stats.success,
                    failed = stats.failed,
                    remaining = stats.remaining,
                    elapsed_secs = stats.elapsed.as_secs(),
                    "Crawl progress"
                );
            }

            _ = cancel.cancelled(), if reporting => {
                tracing::debug!("Progress reporting stopped");
                reporting = false;
            }
        }
    }
}

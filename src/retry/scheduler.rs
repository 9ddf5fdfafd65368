//! Delayed resubmission of failed requests
//!
//! A background task owns a [`DelayQueue`] of pending retries and reports each
//! one on the event channel either when its backoff expires or, if the
//! cancellation token fires first, as abandoned. Every retry handed to
//! [`RetryScheduler::schedule`] produces exactly one event.

use crate::engine::{FetchRequest, WorkGuard};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::time::DelayQueue;

/// Longest backoff the delay queue is given; its timer wheel tops out near 2^36 ms
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(1 << 26);

/// A request waiting out its backoff
///
/// The work guard keeps the engine's `wait()` pending until the retry has been
/// resubmitted or abandoned.
#[derive(Debug)]
pub struct ScheduledRetry {
    pub request: FetchRequest,
    pub delay: Duration,
    guard: WorkGuard,
}

impl ScheduledRetry {
    pub fn new(request: FetchRequest, delay: Duration, guard: WorkGuard) -> Self {
        Self {
            request,
            delay,
            guard,
        }
    }

    /// Retry count carried by the resubmission
    pub fn attempt(&self) -> u32 {
        self.request.ctx.retry_count
    }

    /// Splits off the request; drop the guard once the request is resubmitted
    pub fn into_parts(self) -> (FetchRequest, WorkGuard) {
        (self.request, self.guard)
    }
}

/// Outcome of a scheduled retry
#[derive(Debug)]
pub enum RetryEvent {
    /// Backoff elapsed; resubmit the request
    Due(ScheduledRetry),
    /// Cancelled before the backoff elapsed; do not resubmit
    Abandoned(ScheduledRetry),
}

#[derive(Default)]
struct Counters {
    pending: AtomicUsize,
    scheduled: AtomicU64,
    fired: AtomicU64,
    abandoned: AtomicU64,
}

/// Handle to the background retry loop
pub struct RetryScheduler {
    commands: mpsc::UnboundedSender<ScheduledRetry>,
    cancel: CancellationToken,
    counters: Arc<Counters>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl RetryScheduler {
    /// Starts the retry loop; events are delivered on `sink`
    pub fn spawn(cancel: CancellationToken, sink: mpsc::UnboundedSender<RetryEvent>) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        let counters = Arc::new(Counters::default());

        let handle = tokio::spawn(run(rx, sink, cancel.clone(), counters.clone()));

        Self {
            commands,
            cancel,
            counters,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Queues a retry
    ///
    /// Hands the retry back if the scheduler has already been cancelled.
    pub fn schedule(&self, retry: ScheduledRetry) -> Result<(), ScheduledRetry> {
        if self.cancel.is_cancelled() {
            return Err(retry);
        }

        self.counters.pending.fetch_add(1, Ordering::SeqCst);
        match self.commands.send(retry) {
            Ok(()) => {
                self.counters.scheduled.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            Err(mpsc::error::SendError(retry)) => {
                self.counters.pending.fetch_sub(1, Ordering::SeqCst);
                Err(retry)
            }
        }
    }

    /// Retries waiting for their backoff
    pub fn pending(&self) -> usize {
        self.counters.pending.load(Ordering::SeqCst)
    }

    pub fn scheduled(&self) -> u64 {
        self.counters.scheduled.load(Ordering::SeqCst)
    }

    pub fn fired(&self) -> u64 {
        self.counters.fired.load(Ordering::SeqCst)
    }

    pub fn abandoned(&self) -> u64 {
        self.counters.abandoned.load(Ordering::SeqCst)
    }

    /// Waits for the loop to exit; it exits once the token is cancelled
    pub async fn join(&self) {
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Retry loop panicked");
            }
        }
    }
}

async fn run(
    mut rx: mpsc::UnboundedReceiver<ScheduledRetry>,
    sink: mpsc::UnboundedSender<RetryEvent>,
    cancel: CancellationToken,
    counters: Arc<Counters>,
) {
    // The delay queue only orders ids; the retries themselves live in `waiting`
    let mut queue: DelayQueue<u64> = DelayQueue::new();
    let mut waiting: HashMap<u64, ScheduledRetry> = HashMap::new();
    let mut next_id = 0u64;
    let mut accepting = true;

    let emit = |event: RetryEvent| {
        counters.pending.fetch_sub(1, Ordering::SeqCst);
        match &event {
            RetryEvent::Due(_) => counters.fired.fetch_add(1, Ordering::SeqCst),
            RetryEvent::Abandoned(_) => counters.abandoned.fetch_add(1, Ordering::SeqCst),
        };
        if sink.send(event).is_err() {
            tracing::debug!("Retry event receiver dropped");
        }
    };

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            command = rx.recv(), if accepting => match command {
                Some(retry) => {
                    let delay = retry.delay.min(MAX_RETRY_DELAY);
                    if delay < retry.delay {
                        tracing::warn!(
                            url = %retry.request.url,
                            delay_secs = retry.delay.as_secs(),
                            max_secs = MAX_RETRY_DELAY.as_secs(),
                            "Retry delay clamped"
                        );
                    }
                    tracing::debug!(
                        url = %retry.request.url,
                        delay_secs = delay.as_secs(),
                        "Retry queued"
                    );
                    next_id += 1;
                    queue.insert(next_id, delay);
                    waiting.insert(next_id, retry);
                }
                None => {
                    accepting = false;
                    if waiting.is_empty() {
                        break;
                    }
                }
            },

            Some(expired) = queue.next(), if !queue.is_empty() => {
                if let Some(retry) = waiting.remove(expired.get_ref()) {
                    emit(RetryEvent::Due(retry));
                }
                if !accepting && waiting.is_empty() {
                    break;
                }
            }
        }
    }

    // Nothing can be queued once the receiver is closed; flush what remains
    rx.close();
    while let Ok(retry) = rx.try_recv() {
        emit(RetryEvent::Abandoned(retry));
    }
    for (_, retry) in waiting.drain() {
        emit(RetryEvent::Abandoned(retry));
    }
}

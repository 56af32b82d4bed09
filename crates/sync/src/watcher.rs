use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use parley_storage::{ChangeFeed, ConversationId, ConversationLog, LogSnapshot, StorageError};
use snafu::Snafu;

use super::lock;

pub type SnapshotCallback = Arc<dyn Fn(LogSnapshot) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(WatchError) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
pub enum WatchError {
    /// Reading the log failed; the watcher keeps retrying on its own.
    #[snafu(display("conversation watch degraded on `{stage}`: {message}"))]
    Degraded {
        stage: &'static str,
        message: String,
    },
}

impl WatchError {
    fn degraded(stage: &'static str, source: &StorageError) -> Self {
        Self::Degraded {
            stage,
            message: source.to_string(),
        }
    }
}

/// Handle of one live subscription.
///
/// Released exactly once: by [`Subscription::unsubscribe`] or when dropped. Once release
/// returns, no callback of the subscription runs again.
pub struct Subscription {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }

    pub fn unsubscribe(mut self) {
        self.release_now();
    }

    fn release_now(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release_now();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("released", &self.release.is_none())
            .finish()
    }
}

/// Source of durable snapshots for one conversation at a time per subscription.
///
/// Implementations deliver an initial snapshot soon after subscribing (empty for a new
/// conversation) and another after every durable change. A snapshot older than one already
/// delivered is never delivered.
pub trait RemoteLogWatcher: Send + Sync {
    fn subscribe(
        &self,
        conversation_id: &ConversationId,
        on_snapshot: SnapshotCallback,
        on_error: ErrorCallback,
    ) -> Subscription;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatcherConfig {
    /// Re-read interval when no change notification arrives.
    pub poll_interval: Duration,
    pub retry_initial: Duration,
    pub retry_max: Duration,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            retry_initial: Duration::from_millis(250),
            retry_max: Duration::from_secs(8),
        }
    }
}

/// Watches a [`ConversationLog`] through its change feed, polling as a fallback.
///
/// Subscribing spawns a task, so it must happen inside a Tokio runtime.
pub struct StoreWatcher {
    log: Arc<dyn ConversationLog>,
    config: WatcherConfig,
}

impl StoreWatcher {
    pub fn new(log: Arc<dyn ConversationLog>, config: WatcherConfig) -> Self {
        Self { log, config }
    }
}

impl RemoteLogWatcher for StoreWatcher {
    fn subscribe(
        &self,
        conversation_id: &ConversationId,
        on_snapshot: SnapshotCallback,
        on_error: ErrorCallback,
    ) -> Subscription {
        let gate = Arc::new(DeliveryGate::new(on_snapshot, on_error));
        let task = tokio::spawn(run_watch(
            Arc::clone(&self.log),
            conversation_id.clone(),
            self.config,
            Arc::clone(&gate),
        ));
        tracing::debug!(conversation = %conversation_id, "conversation watch started");

        let conversation_id = conversation_id.clone();
        Subscription::new(move || {
            gate.close();
            task.abort();
            tracing::debug!(conversation = %conversation_id, "conversation watch stopped");
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    Delivered,
    Skipped,
    Closed,
}

struct GateState {
    callbacks: Option<(SnapshotCallback, ErrorCallback)>,
    last_revision: Option<u64>,
}

/// Serializes callbacks and shuts them off for good on close.
///
/// Callbacks run while the gate lock is held, so `close` waits out a delivery in progress.
struct DeliveryGate {
    state: Mutex<GateState>,
}

impl DeliveryGate {
    fn new(on_snapshot: SnapshotCallback, on_error: ErrorCallback) -> Self {
        Self {
            state: Mutex::new(GateState {
                callbacks: Some((on_snapshot, on_error)),
                last_revision: None,
            }),
        }
    }

    /// Delivers `snapshot` unless it is older than the last one delivered.
    ///
    /// An equal revision is only redelivered after an outage, so listeners learn of the
    /// recovery even when nothing changed meanwhile.
    fn deliver(&self, snapshot: LogSnapshot, recovered: bool) -> Delivery {
        let mut state = lock(&self.state);
        let Some((on_snapshot, _)) = state.callbacks.clone() else {
            return Delivery::Closed;
        };

        if let Some(last) = state.last_revision {
            if snapshot.revision < last || (snapshot.revision == last && !recovered) {
                return Delivery::Skipped;
            }
        }

        state.last_revision = Some(snapshot.revision);
        on_snapshot(snapshot);
        Delivery::Delivered
    }

    fn report(&self, error: WatchError) -> bool {
        let state = lock(&self.state);
        match &state.callbacks {
            Some((_, on_error)) => {
                on_error(error);
                true
            }
            None => false,
        }
    }

    fn close(&self) {
        lock(&self.state).callbacks = None;
    }

    fn is_open(&self) -> bool {
        lock(&self.state).callbacks.is_some()
    }
}

struct Backoff {
    initial: Duration,
    max: Duration,
    next: Duration,
}

impl Backoff {
    fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            next: initial,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(self.max);
        delay
    }

    fn reset(&mut self) {
        self.next = self.initial;
    }
}

async fn run_watch(
    log: Arc<dyn ConversationLog>,
    conversation_id: ConversationId,
    config: WatcherConfig,
    gate: Arc<DeliveryGate>,
) {
    let mut backoff = Backoff::new(config.retry_initial, config.retry_max);
    let mut feed: Option<ChangeFeed> = None;
    let mut degraded = false;

    while gate.is_open() {
        if feed.is_none() {
            match log.watch(&conversation_id) {
                Ok(opened) => {
                    tracing::debug!(
                        conversation = %opened.conversation_id(),
                        revision = opened.current(),
                        "change feed opened"
                    );
                    feed = Some(opened);
                }
                Err(error) => {
                    degraded = true;
                    if !report_and_wait(&gate, &mut backoff, "watch-open", &error).await {
                        break;
                    }
                    continue;
                }
            }
        }

        match log.snapshot(&conversation_id).await {
            Ok(snapshot) => {
                backoff.reset();
                let recovered = std::mem::take(&mut degraded);
                if recovered {
                    tracing::info!(conversation = %conversation_id, "conversation watch recovered");
                }
                if gate.deliver(snapshot, recovered) == Delivery::Closed {
                    break;
                }
            }
            Err(error) => {
                degraded = true;
                if !report_and_wait(&gate, &mut backoff, "watch-snapshot", &error).await {
                    break;
                }
                continue;
            }
        }

        let Some(active_feed) = feed.as_mut() else {
            continue;
        };
        let feed_closed = tokio::select! {
            changed = active_feed.changed() => changed.is_err(),
            () = tokio::time::sleep(config.poll_interval) => false,
        };
        if feed_closed {
            tracing::debug!(conversation = %conversation_id, "change feed closed, reopening");
            feed = None;
        }
    }
}

async fn report_and_wait(
    gate: &DeliveryGate,
    backoff: &mut Backoff,
    stage: &'static str,
    error: &StorageError,
) -> bool {
    let delay = backoff.next_delay();
    tracing::warn!(
        stage,
        error = %error,
        retry_in_ms = delay.as_millis() as u64,
        "conversation watch degraded"
    );

    if !gate.report(WatchError::degraded(stage, error)) {
        return false;
    }
    tokio::time::sleep(delay).await;
    true
}

#![deny(unsafe_code)]

//! Chat synchronization core.
//!
//! Reconciles optimistic local state, the answer backend, and a durable conversation log that
//! can change underneath the local view, and drives the reveal animation of the newest answer.

/// Engine that owns the per-conversation view and state machine.
pub mod engine;
pub mod error;
/// Change notifications and the UI-facing conversation view.
pub mod events;
/// Ordered in-memory message list and its invariants.
pub mod log;
pub mod message;
/// Typewriter-style reveal of the newest answer.
pub mod reveal;
pub mod state;
/// Subscriptions to durable log snapshots.
pub mod watcher;

pub use engine::{ChatSyncEngine, EngineConfig};
pub use error::{SyncError, SyncResult};
pub use events::{ConversationView, EngineEvent, WatcherStatus};
pub use log::{LogInvariant, MessageLog};
pub use message::{LocalId, Message, MessageKey, MessageStatus, Role};
pub use reveal::{RevealScheduler, RevealSequence, RevealState};
pub use state::{EngineState, Generation, SendId, SendTarget, StateTransition, TransitionRejection};
pub use watcher::{
    ErrorCallback, RemoteLogWatcher, SnapshotCallback, StoreWatcher, Subscription, WatchError,
    WatcherConfig,
};

pub(crate) fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

pub(crate) fn unix_timestamp_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |duration| duration.as_millis() as u64)
}

use std::future::Future;
use std::pin::Pin;

pub mod error;
pub mod ids;
pub mod memory;
pub mod notify;
pub mod sqlite;
pub mod types;

pub use error::{StorageError, StorageResult};
pub use ids::{ConversationId, MessageId};
pub use memory::MemoryLog;
pub use notify::ChangeFeed;
pub use sqlite::SqliteLog;
pub use types::{LogSnapshot, MessagePatch, MessageRecord, MessageRole, NewMessage};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Durable, append-only, ordered message log keyed by conversation.
///
/// Records are never removed. `update` may rewrite text and flags of an existing record but
/// never its position. Every append or update bumps the conversation revision and wakes the
/// conversation's change feeds.
pub trait ConversationLog: Send + Sync {
    fn append<'a>(
        &'a self,
        conversation_id: &'a ConversationId,
        input: NewMessage,
    ) -> BoxFuture<'a, StorageResult<MessageRecord>>;

    /// Appends `inputs` as one contiguous run: no other write lands between them.
    ///
    /// Each record still gets its own `seq` and revision; change feeds wake once, with the
    /// revision of the last record.
    fn append_many<'a>(
        &'a self,
        conversation_id: &'a ConversationId,
        inputs: Vec<NewMessage>,
    ) -> BoxFuture<'a, StorageResult<Vec<MessageRecord>>>;

    fn update<'a>(
        &'a self,
        conversation_id: &'a ConversationId,
        message_id: MessageId,
        patch: MessagePatch,
    ) -> BoxFuture<'a, StorageResult<MessageRecord>>;

    fn snapshot<'a>(
        &'a self,
        conversation_id: &'a ConversationId,
    ) -> BoxFuture<'a, StorageResult<LogSnapshot>>;

    /// Opens a feed that yields the conversation revision after every durable change.
    fn watch(&self, conversation_id: &ConversationId) -> StorageResult<ChangeFeed>;
}

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

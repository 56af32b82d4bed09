use std::fmt;
use std::time::Duration;

use parley_storage::{MessageId, MessageRecord, MessageRole};

/// Text shown for a placeholder whose writer went away before settling it.
pub const INTERRUPTED_ANSWER_TEXT: &str = "The answer was interrupted before it finished.";

/// Engine-allocated identifier for a message that has no durable id yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LocalId(u64);

impl LocalId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

/// Identity of a message as rendered by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKey {
    Local(LocalId),
    Durable(MessageId),
}

impl fmt::Display for MessageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local(id) => write!(f, "local-{}", id.get()),
            Self::Durable(id) => write!(f, "{id}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    User,
    Assistant,
}

impl From<MessageRole> for Role {
    fn from(role: MessageRole) -> Self {
        match role {
            MessageRole::User => Self::User,
            MessageRole::Assistant => Self::Assistant,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageStatus {
    Pending,
    Settled,
    Errored,
}

impl MessageStatus {
    /// Settled and errored messages never move back to pending.
    pub fn is_final(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageKey,
    pub role: Role,
    pub text: String,
    pub status: MessageStatus,
    pub created_at_unix_millis: u64,
}

impl Message {
    pub fn user(id: MessageKey, text: impl Into<String>, created_at_unix_millis: u64) -> Self {
        Self {
            id,
            role: Role::User,
            text: text.into(),
            status: MessageStatus::Settled,
            created_at_unix_millis,
        }
    }

    pub fn assistant_pending(id: MessageKey, created_at_unix_millis: u64) -> Self {
        Self {
            id,
            role: Role::Assistant,
            text: String::new(),
            status: MessageStatus::Pending,
            created_at_unix_millis,
        }
    }

    /// Renders a durable record.
    ///
    /// A placeholder left pending for longer than `stale_after` is shown as errored, so a
    /// writer that crashed mid-answer cannot block the conversation forever.
    pub fn from_record(record: &MessageRecord, now_unix_millis: u64, stale_after: Duration) -> Self {
        let age = now_unix_millis.saturating_sub(record.created_at_unix_millis);
        let stale = record.pending && u128::from(age) > stale_after.as_millis();

        let (status, text) = match (record.pending, record.failed) {
            (true, _) if stale => {
                let text = if record.text.trim().is_empty() {
                    INTERRUPTED_ANSWER_TEXT.to_string()
                } else {
                    record.text.clone()
                };
                (MessageStatus::Errored, text)
            }
            (true, _) => (MessageStatus::Pending, record.text.clone()),
            (false, true) => (MessageStatus::Errored, record.text.clone()),
            (false, false) => (MessageStatus::Settled, record.text.clone()),
        };

        Self {
            id: MessageKey::Durable(record.id),
            role: record.role.into(),
            text,
            status,
            created_at_unix_millis: record.created_at_unix_millis,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == MessageStatus::Pending
    }
}

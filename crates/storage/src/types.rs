use super::ids::{ConversationId, MessageId};

/// Storage-local message role, intentionally decoupled from the sync-layer role enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageRole {
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// One durable entry of a conversation log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    pub id: MessageId,
    /// Append ordinal within the conversation, used to break `created_at` ties.
    pub seq: u64,
    pub role: MessageRole,
    pub text: String,
    pub created_at_unix_millis: u64,
    pub pending: bool,
    pub failed: bool,
    /// Conversation revision at which this record last changed.
    pub revision: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub role: MessageRole,
    pub text: String,
    pub pending: bool,
}

impl NewMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            text: text.into(),
            pending: false,
        }
    }

    pub fn assistant_placeholder() -> Self {
        Self {
            role: MessageRole::Assistant,
            text: String::new(),
            pending: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MessagePatch {
    pub text: Option<String>,
    pub pending: Option<bool>,
    pub failed: Option<bool>,
}

impl MessagePatch {
    /// Patch that settles a placeholder with its final answer.
    pub fn settled(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            pending: Some(false),
            failed: Some(false),
        }
    }

    /// Patch that closes a placeholder with a human-readable failure.
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            text: Some(message.into()),
            pending: Some(false),
            failed: Some(true),
        }
    }

    pub(crate) fn apply_to(&self, record: &mut MessageRecord) {
        if let Some(text) = &self.text {
            record.text = text.clone();
        }
        if let Some(pending) = self.pending {
            record.pending = pending;
        }
        if let Some(failed) = self.failed {
            record.failed = failed;
        }
    }
}

/// Full ordered view of one conversation at a given revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSnapshot {
    pub conversation_id: ConversationId,
    /// Highest revision reflected in `messages`; zero for a conversation never written.
    pub revision: u64,
    /// Ordered by `(created_at_unix_millis, seq)`.
    pub messages: Vec<MessageRecord>,
}

impl LogSnapshot {
    pub fn empty(conversation_id: ConversationId) -> Self {
        Self {
            conversation_id,
            revision: 0,
            messages: Vec::new(),
        }
    }
}

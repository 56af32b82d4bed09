use std::fmt;
use std::str::FromStr;

use snafu::{ResultExt, ensure};
use uuid::Uuid;

use super::error::{InvalidConversationIdSnafu, InvalidIdSnafu, StorageError, StorageResult};

/// Durable message identifier assigned by the store on append.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(pub Uuid);

impl MessageId {
    pub fn new(raw: Uuid) -> Self {
        Self(raw)
    }

    pub fn new_v7() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn parse(raw: &str) -> StorageResult<Self> {
        let parsed = Uuid::parse_str(raw).context(InvalidIdSnafu {
            stage: "parse-message-id",
            id_type: "message-id",
            raw: raw.to_string(),
        })?;
        Ok(Self(parsed))
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}", self.0)
    }
}

impl From<Uuid> for MessageId {
    fn from(value: Uuid) -> Self {
        Self::new(value)
    }
}

impl FromStr for MessageId {
    type Err = StorageError;

    fn from_str(raw: &str) -> StorageResult<Self> {
        Self::parse(raw)
    }
}

/// One conversation is the message log a user keeps for one uploaded document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConversationId {
    user_id: String,
    document_id: String,
}

impl ConversationId {
    pub fn new(user_id: impl Into<String>, document_id: impl Into<String>) -> StorageResult<Self> {
        let user_id = user_id.into().trim().to_string();
        let document_id = document_id.into().trim().to_string();

        ensure!(
            !user_id.is_empty() && !document_id.is_empty(),
            InvalidConversationIdSnafu {
                stage: "conversation-id-new",
                details: "user id and document id must both be non-empty".to_string(),
            }
        );
        // '/' separates the two halves in the display form, so it cannot appear inside either.
        ensure!(
            !user_id.contains('/') && !document_id.contains('/'),
            InvalidConversationIdSnafu {
                stage: "conversation-id-new",
                details: format!("'{user_id}/{document_id}' contains a path separator"),
            }
        );

        Ok(Self {
            user_id,
            document_id,
        })
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}/{}", self.user_id, self.document_id)
    }
}

impl FromStr for ConversationId {
    type Err = StorageError;

    fn from_str(raw: &str) -> StorageResult<Self> {
        match raw.split_once('/') {
            Some((user_id, document_id)) => Self::new(user_id, document_id),
            None => InvalidConversationIdSnafu {
                stage: "conversation-id-parse",
                details: format!("'{raw}' is not of the form user/document"),
            }
            .fail(),
        }
    }
}

use std::collections::HashMap;
use std::sync::Mutex;

use snafu::OptionExt;

use super::error::{InvariantViolationSnafu, NotFoundSnafu, StorageResult};
use super::ids::{ConversationId, MessageId};
use super::notify::{ChangeFeed, ChangeHub};
use super::types::{LogSnapshot, MessagePatch, MessageRecord, NewMessage};
use super::{BoxFuture, ConversationLog, lock, unix_timestamp_millis};

#[derive(Debug, Default)]
struct ConversationEntries {
    records: Vec<MessageRecord>,
    revision: u64,
}

impl ConversationEntries {
    fn push(&mut self, input: NewMessage, now_unix_millis: u64) -> MessageRecord {
        let last_created_at = self
            .records
            .last()
            .map_or(0, |record| record.created_at_unix_millis);

        self.revision += 1;
        let record = MessageRecord {
            id: MessageId::new_v7(),
            seq: self.records.len() as u64 + 1,
            role: input.role,
            text: input.text,
            // Wall clocks can step backwards; the log order must not.
            created_at_unix_millis: now_unix_millis.max(last_created_at),
            pending: input.pending,
            failed: false,
            revision: self.revision,
        };
        self.records.push(record.clone());
        record
    }
}

/// Process-local conversation log.
///
/// Durable for the lifetime of the process; several engines sharing one `MemoryLog`
/// behave like several devices sharing a remote store.
#[derive(Debug, Default)]
pub struct MemoryLog {
    conversations: Mutex<HashMap<ConversationId, ConversationEntries>>,
    changes: ChangeHub,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn append_sync(
        &self,
        conversation_id: &ConversationId,
        inputs: Vec<NewMessage>,
    ) -> Vec<MessageRecord> {
        let records = {
            let mut conversations = lock(&self.conversations);
            let entries = conversations.entry(conversation_id.clone()).or_default();
            let now = unix_timestamp_millis();
            inputs
                .into_iter()
                .map(|input| entries.push(input, now))
                .collect::<Vec<_>>()
        };

        if let Some(last) = records.last() {
            self.changes.publish(conversation_id, last.revision);
        }
        records
    }

    fn update_sync(
        &self,
        conversation_id: &ConversationId,
        message_id: MessageId,
        patch: MessagePatch,
    ) -> StorageResult<MessageRecord> {
        let record = {
            let mut conversations = lock(&self.conversations);
            let entries = conversations
                .get_mut(conversation_id)
                .context(NotFoundSnafu {
                    stage: "memory-update-conversation",
                    entity: "conversation",
                    id: conversation_id.to_string(),
                })?;
            let next_revision = entries.revision + 1;
            let record = entries
                .records
                .iter_mut()
                .find(|record| record.id == message_id)
                .context(NotFoundSnafu {
                    stage: "memory-update-message",
                    entity: "message",
                    id: message_id.to_string(),
                })?;

            patch.apply_to(record);
            record.revision = next_revision;
            entries.revision = next_revision;
            record.clone()
        };

        self.changes.publish(conversation_id, record.revision);
        Ok(record)
    }

    fn snapshot_sync(&self, conversation_id: &ConversationId) -> LogSnapshot {
        let conversations = lock(&self.conversations);
        match conversations.get(conversation_id) {
            Some(entries) => LogSnapshot {
                conversation_id: conversation_id.clone(),
                revision: entries.revision,
                messages: entries.records.clone(),
            },
            None => LogSnapshot::empty(conversation_id.clone()),
        }
    }
}

impl ConversationLog for MemoryLog {
    fn append<'a>(
        &'a self,
        conversation_id: &'a ConversationId,
        input: NewMessage,
    ) -> BoxFuture<'a, StorageResult<MessageRecord>> {
        Box::pin(async move {
            let mut records = self.append_sync(conversation_id, vec![input]);
            records.pop().context(InvariantViolationSnafu {
                stage: "memory-append-single",
                details: "append produced no record".to_string(),
            })
        })
    }

    fn append_many<'a>(
        &'a self,
        conversation_id: &'a ConversationId,
        inputs: Vec<NewMessage>,
    ) -> BoxFuture<'a, StorageResult<Vec<MessageRecord>>> {
        Box::pin(async move { Ok(self.append_sync(conversation_id, inputs)) })
    }

    fn update<'a>(
        &'a self,
        conversation_id: &'a ConversationId,
        message_id: MessageId,
        patch: MessagePatch,
    ) -> BoxFuture<'a, StorageResult<MessageRecord>> {
        Box::pin(async move { self.update_sync(conversation_id, message_id, patch) })
    }

    fn snapshot<'a>(
        &'a self,
        conversation_id: &'a ConversationId,
    ) -> BoxFuture<'a, StorageResult<LogSnapshot>> {
        Box::pin(async move { Ok(self.snapshot_sync(conversation_id)) })
    }

    fn watch(&self, conversation_id: &ConversationId) -> StorageResult<ChangeFeed> {
        Ok(self.changes.subscribe(conversation_id))
    }
}

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::watch;

use super::error::{ChangeFeedClosedSnafu, StorageResult};
use super::ids::ConversationId;
use super::lock;

/// Receiving half of a per-conversation change notification channel.
///
/// Notifications coalesce: a slow reader observes only the latest revision.
#[derive(Debug)]
pub struct ChangeFeed {
    conversation_id: ConversationId,
    revisions: watch::Receiver<u64>,
}

impl ChangeFeed {
    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    /// Last revision seen by this feed.
    pub fn current(&self) -> u64 {
        *self.revisions.borrow()
    }

    /// Waits for the next revision published after the last one observed.
    pub async fn changed(&mut self) -> StorageResult<u64> {
        if self.revisions.changed().await.is_err() {
            return ChangeFeedClosedSnafu {
                stage: "change-feed-changed",
                conversation: self.conversation_id.to_string(),
            }
            .fail();
        }

        Ok(*self.revisions.borrow_and_update())
    }
}

/// In-process fan-out of revision bumps, shared by the log implementations.
#[derive(Debug, Default)]
pub(crate) struct ChangeHub {
    channels: Mutex<HashMap<ConversationId, watch::Sender<u64>>>,
}

impl ChangeHub {
    pub(crate) fn publish(&self, conversation_id: &ConversationId, revision: u64) {
        let mut channels = lock(&self.channels);
        match channels.get(conversation_id) {
            Some(sender) => {
                sender.send_replace(revision);
            }
            None => {
                let (sender, _) = watch::channel(revision);
                channels.insert(conversation_id.clone(), sender);
            }
        }
    }

    pub(crate) fn subscribe(&self, conversation_id: &ConversationId) -> ChangeFeed {
        let mut channels = lock(&self.channels);
        let sender = channels
            .entry(conversation_id.clone())
            .or_insert_with(|| watch::channel(0).0);

        ChangeFeed {
            conversation_id: conversation_id.clone(),
            revisions: sender.subscribe(),
        }
    }
}

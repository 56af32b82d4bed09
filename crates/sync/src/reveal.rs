use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::Stream;

use super::lock;
use super::message::MessageKey;

pub const DEFAULT_STEP_DELAY: Duration = Duration::from_millis(50);

/// One frame of a progressive reveal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevealState {
    pub message_id: MessageKey,
    pub visible_text: String,
    pub is_complete: bool,
}

#[derive(Debug, Default)]
struct RevealSlot {
    epoch: u64,
    message_id: Option<MessageKey>,
}

/// Reveals answers word by word, one reveal at a time.
///
/// Starting a reveal or calling [`RevealScheduler::cancel`] stops every earlier sequence.
#[derive(Debug, Clone)]
pub struct RevealScheduler {
    step_delay: Duration,
    slot: Arc<Mutex<RevealSlot>>,
}

impl Default for RevealScheduler {
    fn default() -> Self {
        Self::new(DEFAULT_STEP_DELAY)
    }
}

impl RevealScheduler {
    pub fn new(step_delay: Duration) -> Self {
        Self {
            step_delay,
            slot: Arc::new(Mutex::new(RevealSlot::default())),
        }
    }

    pub fn reveal(&self, message_id: MessageKey, full_text: impl Into<String>) -> RevealSequence {
        let full_text = full_text.into();
        let epoch = {
            let mut slot = lock(&self.slot);
            slot.epoch += 1;
            slot.message_id = Some(message_id);
            slot.epoch
        };

        RevealSequence {
            slot: Arc::clone(&self.slot),
            epoch,
            step_ends: step_ends(&full_text),
            full_text,
            cursor: 0,
            step_delay: self.step_delay,
        }
    }

    pub fn cancel(&self) {
        let mut slot = lock(&self.slot);
        slot.epoch += 1;
        slot.message_id = None;
    }

    /// Moves the running reveal to a new id once its message is known under a durable one.
    pub fn retarget(&self, from: MessageKey, to: MessageKey) -> bool {
        let mut slot = lock(&self.slot);
        if slot.message_id != Some(from) {
            return false;
        }
        slot.message_id = Some(to);
        true
    }

    pub fn active_message(&self) -> Option<MessageKey> {
        lock(&self.slot).message_id
    }
}

/// Finite, cancellable sequence of reveal frames.
#[derive(Debug)]
pub struct RevealSequence {
    slot: Arc<Mutex<RevealSlot>>,
    epoch: u64,
    full_text: String,
    step_ends: Vec<usize>,
    cursor: usize,
    step_delay: Duration,
}

impl RevealSequence {
    pub fn step_count(&self) -> usize {
        self.step_ends.len()
    }

    pub fn is_cancelled(&self) -> bool {
        self.message_id().is_none()
    }

    /// Id the next frame will carry, or `None` once cancelled.
    pub fn message_id(&self) -> Option<MessageKey> {
        let slot = lock(&self.slot);
        if slot.epoch == self.epoch {
            slot.message_id
        } else {
            None
        }
    }

    /// Rewinds to the first frame; a cancelled sequence stays cancelled.
    pub fn restart(&mut self) {
        self.cursor = 0;
    }

    /// Waits one step and yields the next frame, or `None` once finished or cancelled.
    pub async fn next(&mut self) -> Option<RevealState> {
        let end = *self.step_ends.get(self.cursor)?;
        if self.cursor > 0 {
            tokio::time::sleep(self.step_delay).await;
        }

        let message_id = self.message_id()?;
        self.cursor += 1;
        Some(RevealState {
            message_id,
            visible_text: self.full_text[..end].to_string(),
            is_complete: self.cursor == self.step_ends.len(),
        })
    }

    pub fn into_stream(self) -> impl Stream<Item = RevealState> + Send {
        futures::stream::unfold(self, |mut sequence| async move {
            let state = sequence.next().await?;
            Some((state, sequence))
        })
    }
}

/// Byte offsets ending each frame: one per whitespace-separated word, the last at the end.
fn step_ends(text: &str) -> Vec<usize> {
    let mut ends = Vec::new();
    let mut in_word = false;

    for (index, character) in text.char_indices() {
        if character.is_whitespace() {
            if in_word {
                ends.push(index);
            }
            in_word = false;
        } else {
            in_word = true;
        }
    }

    // The final frame carries trailing whitespace too.
    match ends.last_mut() {
        Some(last) if !in_word => *last = text.len(),
        _ => ends.push(text.len()),
    }
    ends
}

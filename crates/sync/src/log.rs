use std::collections::HashSet;

use snafu::Snafu;

use super::message::{Message, MessageKey, MessageStatus, Role};

/// Broken ordering or pending rules of a [`MessageLog`].
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
pub enum LogInvariant {
    #[snafu(display("message {index} was created before its predecessor"))]
    OutOfOrder { index: usize },
    #[snafu(display("{count} messages are pending at once"))]
    MultiplePending { count: usize },
    #[snafu(display("pending answer at {index} does not follow a question"))]
    OrphanPending { index: usize },
    #[snafu(display("message id {id} appears more than once"))]
    DuplicateId { id: MessageKey },
}

/// Ordered messages of one conversation as the engine renders them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageLog {
    messages: Vec<Message>,
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `message`, raising its timestamp to its predecessor's when a clock stepped back.
    pub fn push(&mut self, mut message: Message) {
        message.created_at_unix_millis = message
            .created_at_unix_millis
            .max(self.last_created_at());
        self.messages.push(message);
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Newest assistant message that settled with an answer.
    pub fn latest_settled_answer(&self) -> Option<&Message> {
        self.messages.iter().rev().find(|message| {
            message.role == Role::Assistant && message.status == MessageStatus::Settled
        })
    }

    pub fn last_created_at(&self) -> u64 {
        self.messages
            .last()
            .map_or(0, |message| message.created_at_unix_millis)
    }

    pub fn pending_count(&self) -> usize {
        self.messages.iter().filter(|message| message.is_pending()).count()
    }

    pub fn has_pending(&self) -> bool {
        self.messages.iter().any(Message::is_pending)
    }

    pub fn to_vec(&self) -> Vec<Message> {
        self.messages.clone()
    }

    pub fn check_invariants(&self) -> Result<(), LogInvariant> {
        let mut seen = HashSet::with_capacity(self.messages.len());
        let mut pending = 0;

        for (index, message) in self.messages.iter().enumerate() {
            if !seen.insert(message.id) {
                return Err(LogInvariant::DuplicateId { id: message.id });
            }

            if index > 0
                && message.created_at_unix_millis
                    < self.messages[index - 1].created_at_unix_millis
            {
                return Err(LogInvariant::OutOfOrder { index });
            }

            if message.is_pending() {
                pending += 1;
                let follows_question = index > 0 && self.messages[index - 1].role == Role::User;
                if message.role != Role::Assistant || !follows_question {
                    return Err(LogInvariant::OrphanPending { index });
                }
            }
        }

        if pending > 1 {
            return Err(LogInvariant::MultiplePending { count: pending });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::LocalId;

    fn local(raw: u64) -> MessageKey {
        MessageKey::Local(LocalId::new(raw))
    }

    #[test]
    fn push_never_lets_time_run_backwards() {
        let mut log = MessageLog::new();
        log.push(Message::user(local(1), "first", 2_000));
        log.push(Message::assistant_pending(local(2), 1_500));

        assert_eq!(log.messages()[1].created_at_unix_millis, 2_000);
        assert_eq!(log.pending_count(), 1);
        assert_eq!(log.check_invariants(), Ok(()));
    }

    #[test]
    fn latest_settled_answer_skips_pending_and_errored() {
        let answer = |raw, text: &str, status| Message {
            text: text.to_string(),
            status,
            ..Message::assistant_pending(local(raw), raw)
        };
        let mut log = MessageLog::new();
        assert_eq!(log.latest_settled_answer(), None);

        log.push(Message::user(local(1), "a", 1));
        log.push(answer(2, "first", MessageStatus::Settled));
        log.push(Message::user(local(3), "b", 3));
        log.push(answer(4, "failed", MessageStatus::Errored));
        log.push(Message::user(local(5), "c", 5));
        log.push(answer(6, "", MessageStatus::Pending));

        assert_eq!(log.latest_settled_answer().map(|message| message.id), Some(local(2)));
    }

    #[test]
    fn invariant_check_reports_each_violation() {
        let mut orphan = MessageLog::new();
        orphan.push(Message::assistant_pending(local(1), 1));
        assert_eq!(
            orphan.check_invariants(),
            Err(LogInvariant::OrphanPending { index: 0 })
        );

        let mut doubled = MessageLog::new();
        doubled.push(Message::user(local(1), "a", 1));
        doubled.push(Message::assistant_pending(local(2), 2));
        doubled.push(Message::user(local(3), "b", 3));
        doubled.push(Message::assistant_pending(local(4), 4));
        assert_eq!(
            doubled.check_invariants(),
            Err(LogInvariant::MultiplePending { count: 2 })
        );

        let mut duplicated = MessageLog::new();
        duplicated.push(Message::user(local(1), "a", 1));
        duplicated.push(Message::user(local(1), "a", 1));
        assert_eq!(
            duplicated.check_invariants(),
            Err(LogInvariant::DuplicateId { id: local(1) })
        );
    }
}

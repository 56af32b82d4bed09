use std::time::Duration;

use parley_storage::{MessageId, MessageRecord, MessageRole};

use crate::log::MessageLog;
use crate::message::{Message, MessageKey, MessageStatus};
use crate::state::SendTarget;

/// Local echo of one question and its answer, kept until the durable log reflects both.
#[derive(Debug, Clone)]
pub(crate) struct OptimisticPair {
    pub(crate) target: SendTarget,
    /// Durable records that existed at send time; the echo cannot appear before them.
    pub(crate) anchor: usize,
    pub(crate) question: Message,
    pub(crate) answer: Message,
    pub(crate) question_durable: Option<MessageId>,
    pub(crate) answer_durable: Option<MessageId>,
    /// A durable write failed, so no echo will ever arrive.
    pub(crate) local_only: bool,
}

impl OptimisticPair {
    pub(crate) fn new(
        target: SendTarget,
        anchor: usize,
        question: Message,
        answer: Message,
    ) -> Self {
        Self {
            target,
            anchor,
            question,
            answer,
            question_durable: None,
            answer_durable: None,
            local_only: false,
        }
    }
}

/// A pair whose final answer is now durable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Reconciled {
    pub(crate) target: SendTarget,
    pub(crate) answer_local: MessageKey,
    pub(crate) answer_durable: MessageId,
}

#[derive(Debug, Clone, Copy, Default)]
struct Placement {
    question: Option<usize>,
    answer: Option<usize>,
}

#[derive(Debug, Clone, Copy)]
enum Slot {
    Remote,
    Question(usize),
    Answer(usize),
}

/// Finds the durable records echoing each pair.
///
/// Known durable ids win. Before the ids are known, a question matches the first unclaimed
/// user record with the same text at or after the pair's anchor, and its answer matches the
/// assistant record right after it.
fn place(records: &[MessageRecord], pairs: &[OptimisticPair]) -> Vec<Placement> {
    let mut claimed = vec![false; records.len()];
    let mut placements = Vec::with_capacity(pairs.len());

    for pair in pairs {
        let question = match pair.question_durable {
            Some(id) => records.iter().position(|record| record.id == id),
            None => records
                .iter()
                .enumerate()
                .skip(pair.anchor)
                .find(|(index, record)| {
                    !claimed[*index]
                        && record.role == MessageRole::User
                        && record.text == pair.question.text
                })
                .map(|(index, _)| index),
        };

        let answer = match (question, pair.answer_durable) {
            (None, _) => None,
            (Some(_), Some(id)) => records.iter().position(|record| record.id == id),
            (Some(_), None) if pair.local_only => None,
            (Some(index), None) => records
                .get(index + 1)
                .filter(|record| record.role == MessageRole::Assistant && !claimed[index + 1])
                .map(|_| index + 1),
        };

        for index in [question, answer].into_iter().flatten() {
            claimed[index] = true;
        }
        placements.push(Placement { question, answer });
    }

    placements
}

/// Removes every pair whose final answer the durable log now reflects.
pub(crate) fn take_reconciled(
    records: &[MessageRecord],
    pairs: &mut Vec<OptimisticPair>,
) -> Vec<Reconciled> {
    let placements = place(records, pairs);
    let mut reconciled = Vec::new();
    let mut kept = Vec::with_capacity(pairs.len());

    for (pair, placement) in pairs.drain(..).zip(placements) {
        let echoed = placement
            .answer
            .map(|index| &records[index])
            .filter(|record| !record.pending && pair.answer.status.is_final());

        match echoed {
            Some(record) => reconciled.push(Reconciled {
                target: pair.target,
                answer_local: pair.answer.id,
                answer_durable: record.id,
            }),
            None => kept.push(pair),
        }
    }

    *pairs = kept;
    reconciled
}

/// Renders durable records with the optimistic pairs laid over them.
pub(crate) fn build_view(
    records: &[MessageRecord],
    pairs: &[OptimisticPair],
    now_unix_millis: u64,
    stale_after: Duration,
) -> MessageLog {
    let placements = place(records, pairs);
    let mut slots = vec![Slot::Remote; records.len()];
    for (pair_index, placement) in placements.iter().enumerate() {
        if let Some(index) = placement.question {
            slots[index] = Slot::Question(pair_index);
        }
        if let Some(index) = placement.answer {
            slots[index] = Slot::Answer(pair_index);
        }
    }

    let mut unplaced = pairs
        .iter()
        .zip(&placements)
        .filter(|(_, placement)| placement.question.is_none())
        .map(|(pair, _)| pair)
        .peekable();

    let mut view = MessageLog::new();
    for (index, (record, slot)) in records.iter().zip(&slots).enumerate() {
        while let Some(pair) = unplaced.next_if(|pair| pair.anchor <= index) {
            view.push(pair.question.clone());
            view.push(pair.answer.clone());
        }

        match *slot {
            Slot::Remote => view.push(Message::from_record(record, now_unix_millis, stale_after)),
            Slot::Question(pair_index) => {
                view.push(pairs[pair_index].question.clone());
                if placements[pair_index].answer.is_none() {
                    view.push(pairs[pair_index].answer.clone());
                }
            }
            Slot::Answer(pair_index) => view.push(overlay_answer(&pairs[pair_index].answer, record)),
        }
    }

    for pair in unplaced {
        view.push(pair.question.clone());
        view.push(pair.answer.clone());
    }
    view
}

/// First instant after `now` at which a pending record crosses `stale_after`.
///
/// Records already past it are rendered stale by [`build_view`] and need no timer.
pub(crate) fn next_stale_deadline(
    records: &[MessageRecord],
    now_unix_millis: u64,
    stale_after: Duration,
) -> Option<u64> {
    let window = u64::try_from(stale_after.as_millis()).unwrap_or(u64::MAX);
    records
        .iter()
        .filter(|record| record.pending)
        .map(|record| {
            record
                .created_at_unix_millis
                .saturating_add(window)
                .saturating_add(1)
        })
        .filter(|deadline| *deadline > now_unix_millis)
        .min()
}

/// Local answers never regress; a pending local answer takes a final remote one.
fn overlay_answer(local: &Message, record: &MessageRecord) -> Message {
    if local.status.is_final() || record.pending {
        return local.clone();
    }

    Message {
        text: record.text.clone(),
        status: if record.failed {
            MessageStatus::Errored
        } else {
            MessageStatus::Settled
        },
        ..local.clone()
    }
}

use std::sync::{Arc, Mutex};
use std::time::Duration;

use parley_llm::{AnswerClient, AnswerError, validate_question};
use parley_storage::{
    ConversationId, ConversationLog, LogSnapshot, MessageId, MessagePatch, MessageRecord,
    NewMessage, StorageError,
};
use snafu::{OptionExt, ensure};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

mod merge;
#[cfg(test)]
mod tests;

use self::merge::{OptimisticPair, build_view, next_stale_deadline, take_reconciled};
use super::error::{BusySnafu, NoConversationSnafu, SyncError, SyncResult};
use super::events::{ConversationView, EngineEvent, WatcherStatus};
use super::log::MessageLog;
use super::message::{LocalId, Message, MessageKey, MessageStatus};
use super::reveal::{DEFAULT_STEP_DELAY, RevealScheduler, RevealSequence, RevealState};
use super::state::{EngineState, Generation, SendId, SendTarget, StateTransition};
use super::watcher::{
    ErrorCallback, RemoteLogWatcher, SnapshotCallback, StoreWatcher, Subscription, WatchError,
    WatcherConfig,
};
use super::{lock, unix_timestamp_millis};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub watcher: WatcherConfig,
    pub reveal_step_delay: Duration,
    /// Age after which a durable placeholder nobody settled renders as interrupted.
    pub stale_pending_after: Duration,
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            watcher: WatcherConfig::default(),
            reveal_step_delay: DEFAULT_STEP_DELAY,
            stale_pending_after: Duration::from_secs(5 * 60),
            event_capacity: 256,
        }
    }
}

/// Keeps one open conversation in sync between the local view, the answer backend and the
/// durable log.
///
/// All operations return without waiting on I/O; answers and durable changes arrive later
/// and are announced through [`ChatSyncEngine::events`]. Must be used inside a Tokio runtime.
pub struct ChatSyncEngine {
    shared: Arc<Shared>,
}

struct Shared {
    log: Arc<dyn ConversationLog>,
    answers: Arc<dyn AnswerClient>,
    watcher: Arc<dyn RemoteLogWatcher>,
    reveal: RevealScheduler,
    stale_pending_after: Duration,
    events: broadcast::Sender<EngineEvent>,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    generation: Generation,
    next_local_id: u64,
    next_send_id: u64,
    active: Option<ActiveConversation>,
}

impl Inner {
    fn current(&mut self, generation: Generation) -> Option<&mut ActiveConversation> {
        self.active
            .as_mut()
            .filter(|active| active.generation == generation)
    }
}

struct ActiveConversation {
    conversation_id: ConversationId,
    generation: Generation,
    subscription: Option<Subscription>,
    /// Latest durable snapshot contents.
    records: Vec<MessageRecord>,
    last_revision: Option<u64>,
    pairs: Vec<OptimisticPair>,
    view: MessageLog,
    state: EngineState,
    watcher_status: WatcherStatus,
    loaded: bool,
    reveal: Option<RevealState>,
    reveal_task: Option<JoinHandle<()>>,
    /// Wakes when the next fresh pending record turns stale.
    stale_task: Option<JoinHandle<()>>,
}

impl ActiveConversation {
    fn new(conversation_id: ConversationId, generation: Generation) -> Self {
        Self {
            conversation_id,
            generation,
            subscription: None,
            records: Vec::new(),
            last_revision: None,
            pairs: Vec::new(),
            view: MessageLog::new(),
            state: EngineState::Idle,
            watcher_status: WatcherStatus::Connecting,
            loaded: false,
            reveal: None,
            reveal_task: None,
            stale_task: None,
        }
    }

    fn pair_mut(&mut self, target: SendTarget) -> Option<&mut OptimisticPair> {
        self.pairs.iter_mut().find(|pair| pair.target == target)
    }

    fn transition(&mut self, transition: StateTransition) -> Option<EngineState> {
        match self.state.apply(transition) {
            Ok(next) if next == self.state => None,
            Ok(next) => {
                self.state = next.clone();
                Some(next)
            }
            Err(rejection) => {
                tracing::debug!(?rejection, "ignored engine state transition");
                None
            }
        }
    }

    fn rebuild_view(&mut self, stale_after: Duration) -> bool {
        let view = build_view(
            &self.records,
            &self.pairs,
            unix_timestamp_millis(),
            stale_after,
        );
        if view == self.view {
            return false;
        }
        self.view = view;
        true
    }

    fn to_view(&self) -> ConversationView {
        ConversationView {
            conversation_id: Some(self.conversation_id.clone()),
            messages: self.view.to_vec(),
            state: self.state.clone(),
            watcher_status: self.watcher_status.clone(),
            loaded: self.loaded,
            reveal: self.reveal.clone(),
        }
    }

    /// Stops everything tied to this conversation. Must run without the engine lock held,
    /// since unsubscribing waits for an in-flight snapshot callback.
    fn teardown(mut self) {
        if let Some(task) = self.reveal_task.take() {
            task.abort();
        }
        if let Some(task) = self.stale_task.take() {
            task.abort();
        }
        if let Some(subscription) = self.subscription.take() {
            subscription.unsubscribe();
        }
    }
}

impl ChatSyncEngine {
    /// Builds an engine that watches `log` itself for durable changes.
    pub fn new(
        log: Arc<dyn ConversationLog>,
        answers: Arc<dyn AnswerClient>,
        config: EngineConfig,
    ) -> Self {
        let watcher = Arc::new(StoreWatcher::new(Arc::clone(&log), config.watcher));
        Self::with_watcher(log, answers, watcher, config)
    }

    pub fn with_watcher(
        log: Arc<dyn ConversationLog>,
        answers: Arc<dyn AnswerClient>,
        watcher: Arc<dyn RemoteLogWatcher>,
        config: EngineConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            shared: Arc::new(Shared {
                log,
                answers,
                watcher,
                reveal: RevealScheduler::new(config.reveal_step_delay),
                stale_pending_after: config.stale_pending_after,
                events,
                inner: Mutex::new(Inner::default()),
            }),
        }
    }

    /// Switches to `conversation_id`, dropping every trace of the previous conversation.
    pub fn open(&self, conversation_id: ConversationId) {
        let shared = &self.shared;
        let (previous, generation) = {
            let mut inner = lock(&shared.inner);
            inner.generation = inner.generation.next();
            let generation = inner.generation;
            let previous = inner
                .active
                .replace(ActiveConversation::new(conversation_id.clone(), generation));
            (previous, generation)
        };

        shared.reveal.cancel();
        if let Some(previous) = previous {
            shared.emit(EngineEvent::Closed(previous.conversation_id.clone()));
            previous.teardown();
        }
        tracing::info!(
            conversation = %conversation_id,
            generation = generation.get(),
            "opened conversation"
        );
        shared.emit(EngineEvent::Opened(conversation_id.clone()));
        shared.emit(EngineEvent::ViewChanged);

        let on_snapshot: SnapshotCallback = {
            let shared = Arc::downgrade(shared);
            Arc::new(move |snapshot: LogSnapshot| {
                if let Some(shared) = shared.upgrade() {
                    shared.apply_snapshot(generation, snapshot);
                }
            })
        };
        let on_error: ErrorCallback = {
            let shared = Arc::downgrade(shared);
            Arc::new(move |error: WatchError| {
                if let Some(shared) = shared.upgrade() {
                    shared.apply_watch_error(generation, &error);
                }
            })
        };
        let subscription = shared
            .watcher
            .subscribe(&conversation_id, on_snapshot, on_error);

        let superseded = {
            let mut inner = lock(&shared.inner);
            match inner.current(generation) {
                Some(active) => {
                    active.subscription = Some(subscription);
                    None
                }
                None => Some(subscription),
            }
        };
        // Another open or close won the race; release outside the lock.
        if let Some(subscription) = superseded {
            subscription.unsubscribe();
        }
    }

    /// Shows the question and a pending answer right away, then asks the backend.
    ///
    /// Fails with `Busy` while an answer is awaited or any answer in the view is pending,
    /// even if `text` is itself invalid.
    pub fn send_question(&self, text: &str) -> SyncResult<SendTarget> {
        let shared = &self.shared;
        let (target, conversation_id, question) = {
            let mut inner = lock(&shared.inner);
            let Inner {
                active,
                next_local_id,
                next_send_id,
                ..
            } = &mut *inner;
            let active = active.as_mut().context(NoConversationSnafu {
                stage: "send-question",
            })?;
            // Pending records may have gone stale since the last rebuild.
            if active.rebuild_view(shared.stale_pending_after) {
                shared.emit(EngineEvent::ViewChanged);
            }

            ensure!(
                !active.state.is_awaiting_answer(),
                BusySnafu {
                    stage: "send-question-awaiting",
                }
            );
            ensure!(
                !active.view.has_pending(),
                BusySnafu {
                    stage: "send-question-pending",
                }
            );
            let question = validate_question(text)
                .map_err(invalid_input)?
                .to_string();

            *next_send_id += 1;
            let target = SendTarget::new(active.generation, SendId::new(*next_send_id));
            let Some(state) = active.transition(StateTransition::Start(target)) else {
                return BusySnafu {
                    stage: "send-question-start",
                }
                .fail();
            };

            let now = unix_timestamp_millis().max(active.view.last_created_at());
            *next_local_id += 1;
            let question_id = MessageKey::Local(LocalId::new(*next_local_id));
            *next_local_id += 1;
            let answer_id = MessageKey::Local(LocalId::new(*next_local_id));
            active.pairs.push(OptimisticPair::new(
                target,
                active.records.len(),
                Message::user(question_id, question.clone(), now),
                Message::assistant_pending(answer_id, now),
            ));

            shared.emit(EngineEvent::StateChanged(state));
            if active.rebuild_view(shared.stale_pending_after) {
                shared.emit(EngineEvent::ViewChanged);
            }
            tracing::info!(
                conversation = %active.conversation_id,
                send_id = target.send_id.get(),
                "question submitted"
            );
            (target, active.conversation_id.clone(), question)
        };

        tokio::spawn(run_send(
            Arc::clone(shared),
            target,
            conversation_id,
            question,
        ));
        Ok(target)
    }

    /// Applies a durable snapshot of the open conversation.
    ///
    /// Snapshots of other conversations and snapshots older than one already applied are
    /// ignored. Applying the same snapshot twice has no further effect.
    pub fn on_remote_snapshot(&self, snapshot: LogSnapshot) {
        let generation = lock(&self.shared.inner)
            .active
            .as_ref()
            .map(|active| active.generation);
        if let Some(generation) = generation {
            self.shared.apply_snapshot(generation, snapshot);
        }
    }

    /// Ordered messages of the open conversation; empty when none is open.
    pub fn current_view(&self) -> Vec<Message> {
        lock(&self.shared.inner)
            .active
            .as_ref()
            .map(|active| active.view.to_vec())
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> ConversationView {
        lock(&self.shared.inner)
            .active
            .as_ref()
            .map(ActiveConversation::to_view)
            .unwrap_or_default()
    }

    pub fn state(&self) -> EngineState {
        lock(&self.shared.inner)
            .active
            .as_ref()
            .map(|active| active.state.clone())
            .unwrap_or_default()
    }

    pub fn conversation_id(&self) -> Option<ConversationId> {
        lock(&self.shared.inner)
            .active
            .as_ref()
            .map(|active| active.conversation_id.clone())
    }

    pub fn answer_backend(&self) -> &str {
        self.shared.answers.name()
    }

    pub fn events(&self) -> broadcast::Receiver<EngineEvent> {
        self.shared.events.subscribe()
    }

    /// Releases the subscription and forgets the open conversation.
    ///
    /// Answers still in flight are dropped from the view, but their durable writes finish.
    pub fn close(&self) {
        let previous = {
            let mut inner = lock(&self.shared.inner);
            inner.generation = inner.generation.next();
            inner.active.take()
        };

        self.shared.reveal.cancel();
        if let Some(previous) = previous {
            tracing::info!(conversation = %previous.conversation_id, "closed conversation");
            self.shared
                .emit(EngineEvent::Closed(previous.conversation_id.clone()));
            previous.teardown();
        }
    }
}

impl Drop for ChatSyncEngine {
    fn drop(&mut self) {
        self.close();
    }
}

impl Shared {
    fn emit(&self, event: EngineEvent) {
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }

    fn apply_snapshot(self: &Arc<Self>, generation: Generation, snapshot: LogSnapshot) {
        let mut inner = lock(&self.inner);
        let Some(active) = inner.current(generation) else {
            tracing::trace!(
                generation = generation.get(),
                "dropping snapshot for a closed conversation"
            );
            return;
        };

        if snapshot.conversation_id != active.conversation_id {
            tracing::debug!(
                expected = %active.conversation_id,
                received = %snapshot.conversation_id,
                "dropping snapshot for another conversation"
            );
            return;
        }
        if let Some(last) = active.last_revision.filter(|last| snapshot.revision < *last) {
            tracing::debug!(
                revision = snapshot.revision,
                last,
                "dropping snapshot older than the applied one"
            );
            return;
        }

        active.last_revision = Some(snapshot.revision);
        active.records = snapshot.messages;
        let first_load = !active.loaded;
        active.loaded = true;

        if active.watcher_status != WatcherStatus::Live {
            active.watcher_status = WatcherStatus::Live;
            self.emit(EngineEvent::WatcherStatusChanged(WatcherStatus::Live));
        }

        for reconciled in take_reconciled(&active.records, &mut active.pairs) {
            tracing::debug!(
                send_id = reconciled.target.send_id.get(),
                "answer reconciled with the durable log"
            );
            if active.state == EngineState::Reconciling(reconciled.target) {
                if let Some(state) =
                    active.transition(StateTransition::Reconciled(reconciled.target))
                {
                    self.emit(EngineEvent::StateChanged(state));
                }
            }

            let durable = MessageKey::Durable(reconciled.answer_durable);
            self.reveal.retarget(reconciled.answer_local, durable);
            if let Some(reveal) = active
                .reveal
                .as_mut()
                .filter(|reveal| reveal.message_id == reconciled.answer_local)
            {
                reveal.message_id = durable;
            }
        }

        if active.rebuild_view(self.stale_pending_after) || first_load {
            self.emit(EngineEvent::ViewChanged);
        }
        self.drop_superseded_reveal(active);
        self.schedule_stale_check(active);
    }

    /// Ends the reveal once a newer answer has settled after it, usually on another device.
    fn drop_superseded_reveal(&self, active: &mut ActiveConversation) {
        let Some(revealing) = active
            .reveal
            .as_ref()
            .map(|reveal| reveal.message_id)
            .or_else(|| self.reveal.active_message())
        else {
            return;
        };
        let Some(latest) = active.view.latest_settled_answer().map(|message| message.id) else {
            return;
        };
        if latest == revealing {
            return;
        }

        tracing::debug!(
            conversation = %active.conversation_id,
            superseded = %revealing,
            latest = %latest,
            "newer answer settled; ending reveal"
        );
        if let Some(task) = active.reveal_task.take() {
            task.abort();
        }
        self.reveal.cancel();
        if active.reveal.take().is_some() {
            self.emit(EngineEvent::ViewChanged);
        }
    }

    /// Arms a timer for the next pending record to cross `stale_pending_after`.
    fn schedule_stale_check(self: &Arc<Self>, active: &mut ActiveConversation) {
        if let Some(task) = active.stale_task.take() {
            task.abort();
        }
        let now = unix_timestamp_millis();
        let Some(deadline) = next_stale_deadline(&active.records, now, self.stale_pending_after)
        else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::debug!("no runtime to time out pending answers; relying on the next send");
            return;
        };

        let delay = Duration::from_millis(deadline.saturating_sub(now));
        let shared = Arc::downgrade(self);
        let generation = active.generation;
        active.stale_task = Some(runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(shared) = shared.upgrade() {
                shared.expire_stale_pending(generation);
            }
        }));
    }

    fn expire_stale_pending(self: &Arc<Self>, generation: Generation) {
        let mut inner = lock(&self.inner);
        let Some(active) = inner.current(generation) else {
            return;
        };
        // The timer calling in is finishing on its own.
        active.stale_task = None;

        if active.rebuild_view(self.stale_pending_after) {
            tracing::info!(
                conversation = %active.conversation_id,
                "pending answer went stale"
            );
            self.emit(EngineEvent::ViewChanged);
        }
        self.schedule_stale_check(active);
    }

    fn apply_watch_error(&self, generation: Generation, error: &WatchError) {
        let mut inner = lock(&self.inner);
        let Some(active) = inner.current(generation) else {
            return;
        };

        tracing::warn!(
            conversation = %active.conversation_id,
            error = %error,
            "durable log unavailable"
        );
        let status = WatcherStatus::Degraded {
            message: error.to_string(),
        };
        if active.watcher_status != status {
            active.watcher_status = status.clone();
            self.emit(EngineEvent::WatcherStatusChanged(status));
        }
    }

    fn update_pair(&self, target: SendTarget, update: impl FnOnce(&mut OptimisticPair)) {
        let mut inner = lock(&self.inner);
        let Some(active) = inner.current(target.generation) else {
            return;
        };
        let Some(pair) = active.pair_mut(target) else {
            return;
        };

        update(pair);
        if active.rebuild_view(self.stale_pending_after) {
            self.emit(EngineEvent::ViewChanged);
        }
    }

    /// Gives up on the durable echo of one send; its messages stay local.
    fn mark_local_only(&self, target: SendTarget, stage: &'static str, error: &StorageError) {
        tracing::warn!(
            stage,
            send_id = target.send_id.get(),
            error = %error,
            "durable write failed; keeping the exchange local"
        );

        let mut inner = lock(&self.inner);
        let Some(active) = inner.current(target.generation) else {
            return;
        };
        if let Some(pair) = active.pair_mut(target) {
            pair.local_only = true;
        }
        if active.state == EngineState::Reconciling(target) {
            if let Some(state) = active.transition(StateTransition::Reconciled(target)) {
                self.emit(EngineEvent::StateChanged(state));
            }
        }
        if active.rebuild_view(self.stale_pending_after) {
            self.emit(EngineEvent::ViewChanged);
        }
    }

    /// Writes the question and its placeholder as one contiguous exchange; returns the
    /// placeholder id.
    async fn persist_question(
        &self,
        target: SendTarget,
        conversation_id: &ConversationId,
        question: &str,
    ) -> Option<MessageId> {
        let exchange = vec![NewMessage::user(question), NewMessage::assistant_placeholder()];
        let records = match self.log.append_many(conversation_id, exchange).await {
            Ok(records) => records,
            Err(error) => {
                self.mark_local_only(target, "append-exchange", &error);
                return None;
            }
        };

        let [question_record, placeholder] = records.as_slice() else {
            let error = StorageError::InvariantViolation {
                stage: "append-exchange-shape",
                details: format!("expected 2 records, store wrote {}", records.len()),
            };
            self.mark_local_only(target, "append-exchange", &error);
            return None;
        };
        let (question_id, placeholder_id) = (question_record.id, placeholder.id);
        self.update_pair(target, |pair| {
            pair.question_durable = Some(question_id);
            pair.answer_durable = Some(placeholder_id);
        });
        Some(placeholder_id)
    }

    fn settle_locally(self: &Arc<Self>, target: SendTarget, answer: &str, durable: bool) {
        let mut inner = lock(&self.inner);
        let Some(active) = inner.current(target.generation) else {
            tracing::debug!(
                send_id = target.send_id.get(),
                "answer arrived after its conversation was closed"
            );
            return;
        };
        let Some(pair) = active.pair_mut(target) else {
            return;
        };

        pair.answer.text = answer.to_string();
        pair.answer.status = MessageStatus::Settled;
        let answer_id = pair.answer.id;
        let awaiting_echo = durable && !pair.local_only;

        if let Some(state) = active.transition(StateTransition::Answered(target)) {
            self.emit(EngineEvent::StateChanged(state));
        }
        if !awaiting_echo {
            if let Some(state) = active.transition(StateTransition::Reconciled(target)) {
                self.emit(EngineEvent::StateChanged(state));
            }
        }
        if active.rebuild_view(self.stale_pending_after) {
            self.emit(EngineEvent::ViewChanged);
        }

        self.start_reveal(active, answer_id, answer);
    }

    fn fail_locally(&self, target: SendTarget, message: &str) {
        let mut inner = lock(&self.inner);
        let Some(active) = inner.current(target.generation) else {
            return;
        };
        let Some(pair) = active.pair_mut(target) else {
            return;
        };

        pair.answer.text = message.to_string();
        pair.answer.status = MessageStatus::Errored;
        if let Some(state) = active.transition(StateTransition::Failed {
            target,
            message: message.to_string(),
        }) {
            self.emit(EngineEvent::StateChanged(state));
        }
        if active.rebuild_view(self.stale_pending_after) {
            self.emit(EngineEvent::ViewChanged);
        }
    }

    fn start_reveal(
        self: &Arc<Self>,
        active: &mut ActiveConversation,
        message_id: MessageKey,
        text: &str,
    ) {
        let mut sequence = self.reveal.reveal(message_id, text);
        tracing::trace!(
            message_id = %message_id,
            steps = sequence.step_count(),
            "revealing answer"
        );
        if let Some(previous) = active.reveal_task.take() {
            previous.abort();
        }
        active.reveal = None;

        let shared = Arc::downgrade(self);
        let generation = active.generation;
        active.reveal_task = Some(tokio::spawn(async move {
            while let Some(frame) = sequence.next().await {
                let Some(shared) = shared.upgrade() else {
                    break;
                };
                if !shared.publish_reveal(generation, &sequence, frame) {
                    break;
                }
            }
        }));
    }

    fn publish_reveal(
        &self,
        generation: Generation,
        sequence: &RevealSequence,
        mut frame: RevealState,
    ) -> bool {
        let mut inner = lock(&self.inner);
        let Some(active) = inner.current(generation) else {
            return false;
        };
        // Retargeting happens under this lock, so the id read here is current.
        let Some(message_id) = sequence.message_id() else {
            return false;
        };
        frame.message_id = message_id;
        active.reveal = Some(frame.clone());
        self.emit(EngineEvent::Reveal(frame));
        true
    }
}

/// Drives one question from durable append to settled (or failed) durable answer.
///
/// View updates are dropped once the conversation is closed; durable writes always finish.
async fn run_send(
    shared: Arc<Shared>,
    target: SendTarget,
    conversation_id: ConversationId,
    question: String,
) {
    let placeholder = shared
        .persist_question(target, &conversation_id, &question)
        .await;

    match shared.answers.ask(&question).await {
        Ok(answer) => {
            tracing::info!(
                backend = shared.answers.name(),
                send_id = target.send_id.get(),
                "answer received"
            );
            shared.settle_locally(target, &answer, placeholder.is_some());
            if let Some(message_id) = placeholder {
                if let Err(error) = shared
                    .log
                    .update(&conversation_id, message_id, MessagePatch::settled(answer))
                    .await
                {
                    shared.mark_local_only(target, "settle-answer", &error);
                }
            }
        }
        Err(error) => {
            tracing::warn!(
                backend = shared.answers.name(),
                send_id = target.send_id.get(),
                transient = error.is_transient(),
                error = %error,
                "answer request failed"
            );
            let message = error.user_message();
            shared.fail_locally(target, &message);
            if let Some(message_id) = placeholder {
                if let Err(error) = shared
                    .log
                    .update(&conversation_id, message_id, MessagePatch::failed(message))
                    .await
                {
                    shared.mark_local_only(target, "fail-answer", &error);
                }
            }
        }
    }
}

fn invalid_input(error: AnswerError) -> SyncError {
    let details = match error {
        AnswerError::InvalidInput { details, .. } => details,
        other => other.to_string(),
    };
    SyncError::InvalidInput {
        stage: "send-question-validate",
        details,
    }
}

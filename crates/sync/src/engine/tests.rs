use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parley_llm::{AnswerResult, BoxFuture};
use parley_storage::{BoxFuture as StoreFuture, ChangeFeed, MemoryLog, StorageResult};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, oneshot};

use super::*;
use crate::log::LogInvariant;
use crate::message::{INTERRUPTED_ANSWER_TEXT, Role};

const WAIT: Duration = Duration::from_secs(5);

struct PendingAsk {
    question: String,
    reply: oneshot::Sender<AnswerResult<String>>,
}

impl PendingAsk {
    fn answer(self, text: &str) {
        let _ = self.reply.send(Ok(text.to_string()));
    }

    fn fail(self, error: AnswerError) {
        let _ = self.reply.send(Err(error));
    }
}

/// Backend whose answers the test hands out one question at a time.
struct ScriptedAnswers {
    asks: mpsc::UnboundedSender<PendingAsk>,
}

impl AnswerClient for ScriptedAnswers {
    fn name(&self) -> &str {
        "scripted"
    }

    fn ask<'a>(&'a self, question: &'a str) -> BoxFuture<'a, AnswerResult<String>> {
        Box::pin(async move {
            let (reply, answer) = oneshot::channel();
            let _ = self.asks.send(PendingAsk {
                question: question.to_string(),
                reply,
            });
            answer.await.unwrap_or_else(|_| {
                Err(AnswerError::Network {
                    stage: "scripted-ask",
                    message: "script dropped the question".to_string(),
                })
            })
        })
    }
}

struct ManualSubscriber {
    conversation_id: ConversationId,
    on_snapshot: SnapshotCallback,
    on_error: ErrorCallback,
    live: Arc<AtomicBool>,
}

/// Watcher that delivers exactly the snapshots the test pushes.
#[derive(Default)]
struct ManualWatcher {
    subscribers: Mutex<Vec<ManualSubscriber>>,
    subscribed: AtomicUsize,
    released: Arc<AtomicUsize>,
}

impl ManualWatcher {
    fn live_subscribers(&self, conversation_id: &ConversationId) -> Vec<(SnapshotCallback, ErrorCallback)> {
        lock(&self.subscribers)
            .iter()
            .filter(|subscriber| {
                subscriber.live.load(Ordering::SeqCst)
                    && subscriber.conversation_id == *conversation_id
            })
            .map(|subscriber| {
                (
                    Arc::clone(&subscriber.on_snapshot),
                    Arc::clone(&subscriber.on_error),
                )
            })
            .collect()
    }

    fn push(&self, snapshot: &LogSnapshot) {
        for (on_snapshot, _) in self.live_subscribers(&snapshot.conversation_id) {
            on_snapshot(snapshot.clone());
        }
    }

    fn fail(&self, conversation_id: &ConversationId, message: &str) {
        for (_, on_error) in self.live_subscribers(conversation_id) {
            on_error(WatchError::Degraded {
                stage: "manual",
                message: message.to_string(),
            });
        }
    }
}

impl RemoteLogWatcher for ManualWatcher {
    fn subscribe(
        &self,
        conversation_id: &ConversationId,
        on_snapshot: SnapshotCallback,
        on_error: ErrorCallback,
    ) -> Subscription {
        self.subscribed.fetch_add(1, Ordering::SeqCst);
        let live = Arc::new(AtomicBool::new(true));
        lock(&self.subscribers).push(ManualSubscriber {
            conversation_id: conversation_id.clone(),
            on_snapshot,
            on_error,
            live: Arc::clone(&live),
        });

        let released = Arc::clone(&self.released);
        Subscription::new(move || {
            live.store(false, Ordering::SeqCst);
            released.fetch_add(1, Ordering::SeqCst);
        })
    }
}

/// Log whose appends always fail while reads keep working.
#[derive(Default)]
struct ReadOnlyLog {
    inner: MemoryLog,
}

impl ConversationLog for ReadOnlyLog {
    fn append<'a>(
        &'a self,
        _conversation_id: &'a ConversationId,
        _input: NewMessage,
    ) -> StoreFuture<'a, StorageResult<MessageRecord>> {
        Box::pin(async {
            Err(StorageError::Unavailable {
                stage: "read-only-append",
                details: "store is read-only".to_string(),
            })
        })
    }

    fn append_many<'a>(
        &'a self,
        _conversation_id: &'a ConversationId,
        _inputs: Vec<NewMessage>,
    ) -> StoreFuture<'a, StorageResult<Vec<MessageRecord>>> {
        Box::pin(async {
            Err(StorageError::Unavailable {
                stage: "read-only-append-many",
                details: "store is read-only".to_string(),
            })
        })
    }

    fn update<'a>(
        &'a self,
        conversation_id: &'a ConversationId,
        message_id: MessageId,
        patch: MessagePatch,
    ) -> StoreFuture<'a, StorageResult<MessageRecord>> {
        self.inner.update(conversation_id, message_id, patch)
    }

    fn snapshot<'a>(
        &'a self,
        conversation_id: &'a ConversationId,
    ) -> StoreFuture<'a, StorageResult<LogSnapshot>> {
        self.inner.snapshot(conversation_id)
    }

    fn watch(&self, conversation_id: &ConversationId) -> StorageResult<ChangeFeed> {
        self.inner.watch(conversation_id)
    }
}

fn test_config() -> EngineConfig {
    EngineConfig {
        watcher: WatcherConfig {
            poll_interval: Duration::from_millis(50),
            retry_initial: Duration::from_millis(5),
            retry_max: Duration::from_millis(20),
        },
        reveal_step_delay: Duration::from_millis(1),
        ..EngineConfig::default()
    }
}

fn conversation(document: &str) -> ConversationId {
    ConversationId::new("alice", document).unwrap()
}

struct Harness {
    engine: ChatSyncEngine,
    asks: mpsc::UnboundedReceiver<PendingAsk>,
    events: broadcast::Receiver<EngineEvent>,
}

impl Harness {
    fn new(log: Arc<dyn ConversationLog>) -> Self {
        Self::with_config(log, test_config())
    }

    fn with_config(log: Arc<dyn ConversationLog>, config: EngineConfig) -> Self {
        let (sender, asks) = mpsc::unbounded_channel();
        let engine = ChatSyncEngine::new(log, Arc::new(ScriptedAnswers { asks: sender }), config);
        Self::from_engine(engine, asks)
    }

    fn with_watcher(log: Arc<dyn ConversationLog>, watcher: Arc<ManualWatcher>) -> Self {
        let (sender, asks) = mpsc::unbounded_channel();
        let engine = ChatSyncEngine::with_watcher(
            log,
            Arc::new(ScriptedAnswers { asks: sender }),
            watcher,
            test_config(),
        );
        Self::from_engine(engine, asks)
    }

    fn from_engine(engine: ChatSyncEngine, asks: mpsc::UnboundedReceiver<PendingAsk>) -> Self {
        let events = engine.events();
        Self {
            engine,
            asks,
            events,
        }
    }

    async fn next_ask(&mut self) -> PendingAsk {
        tokio::time::timeout(WAIT, self.asks.recv())
            .await
            .expect("no question reached the backend")
            .expect("answer script closed")
    }

    async fn wait_for(
        &mut self,
        description: &str,
        predicate: impl Fn(&ConversationView) -> bool,
    ) -> ConversationView {
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            let view = self.engine.snapshot();
            assert_eq!(view_invariants(&self.engine), Ok(()), "view: {view:?}");
            if predicate(&view) {
                return view;
            }

            match tokio::time::timeout_at(deadline, self.events.recv()).await {
                Ok(Ok(_) | Err(RecvError::Lagged(_))) => {}
                Ok(Err(RecvError::Closed)) => panic!("engine events closed"),
                Err(_) => panic!("timed out waiting for {description}; last view: {view:?}"),
            }
        }
    }

    async fn wait_until_loaded(&mut self) -> ConversationView {
        self.wait_for("initial snapshot", |view| {
            view.loaded && view.watcher_status == WatcherStatus::Live
        })
        .await
    }
}

fn view_invariants(engine: &ChatSyncEngine) -> Result<(), LogInvariant> {
    match &lock(&engine.shared.inner).active {
        Some(active) => active.view.check_invariants(),
        None => Ok(()),
    }
}

fn summary(view: &ConversationView) -> Vec<(Role, &str, MessageStatus)> {
    view.messages
        .iter()
        .map(|message| (message.role, message.text.as_str(), message.status))
        .collect()
}

fn all_durable(view: &ConversationView) -> bool {
    view.messages
        .iter()
        .all(|message| matches!(message.id, MessageKey::Durable(_)))
}

async fn wait_for_revision(log: &dyn ConversationLog, conversation_id: &ConversationId, revision: u64) -> LogSnapshot {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let snapshot = log.snapshot(conversation_id).await.unwrap();
        if snapshot.revision >= revision {
            return snapshot;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "log stuck at revision {}",
            snapshot.revision
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn question_round_trips_through_the_durable_log() {
    let log = Arc::new(MemoryLog::new());
    let mut harness = Harness::new(log.clone());
    let conversation_id = conversation("report.pdf");

    harness.engine.open(conversation_id.clone());
    let view = harness.wait_until_loaded().await;
    assert!(view.messages.is_empty());

    harness.engine.send_question("  What is this?  ").unwrap();
    let view = harness.engine.snapshot();
    assert!(view.state.is_awaiting_answer());
    assert_eq!(summary(&view), vec![
        (Role::User, "What is this?", MessageStatus::Settled),
        (Role::Assistant, "", MessageStatus::Pending),
    ]);

    let ask = harness.next_ask().await;
    assert_eq!(ask.question, "What is this?");
    ask.answer("It is a report.");

    let view = harness
        .wait_for("reconciled answer", |view| {
            view.state == EngineState::Idle && view.messages.len() == 2 && all_durable(view)
        })
        .await;
    assert_eq!(summary(&view), vec![
        (Role::User, "What is this?", MessageStatus::Settled),
        (Role::Assistant, "It is a report.", MessageStatus::Settled),
    ]);

    let durable = log.snapshot(&conversation_id).await.unwrap();
    assert_eq!(durable.messages.len(), 2);
    assert_eq!(durable.messages[1].text, "It is a report.");
    assert!(!durable.messages[1].pending && !durable.messages[1].failed);
}

#[tokio::test]
async fn second_question_while_awaiting_is_busy() {
    let mut harness = Harness::new(Arc::new(MemoryLog::new()));
    harness.engine.open(conversation("report.pdf"));
    harness.wait_until_loaded().await;

    harness.engine.send_question("first").unwrap();
    assert!(matches!(
        harness.engine.send_question("second"),
        Err(SyncError::Busy { .. })
    ));
    // Busy wins over validation while awaiting.
    assert!(matches!(
        harness.engine.send_question(""),
        Err(SyncError::Busy { .. })
    ));

    let view = harness.engine.snapshot();
    assert_eq!(view.messages.len(), 2);
    assert_eq!(view.messages.iter().filter(|message| message.is_pending()).count(), 1);

    let ask = harness.next_ask().await;
    assert_eq!(ask.question, "first");
    ask.answer("done");
    harness
        .wait_for("first answer", |view| {
            !view.state.is_awaiting_answer() && view.messages.len() == 2 && !view.messages[1].is_pending()
        })
        .await;

    harness.engine.send_question("second").unwrap();
    assert_eq!(harness.next_ask().await.question, "second");
}

#[tokio::test]
async fn failed_answer_is_shown_and_recorded() {
    let log = Arc::new(MemoryLog::new());
    let mut harness = Harness::new(log.clone());
    let conversation_id = conversation("report.pdf");
    harness.engine.open(conversation_id.clone());
    harness.wait_until_loaded().await;

    harness.engine.send_question("What is this?").unwrap();
    harness.next_ask().await.fail(AnswerError::Server {
        stage: "scripted",
        message: "rate limited".to_string(),
    });

    let view = harness
        .wait_for("errored answer", |view| {
            matches!(view.state, EngineState::Error { .. }) && all_durable(view) && view.messages.len() == 2
        })
        .await;
    assert!(matches!(
        &view.state,
        EngineState::Error { message, .. } if message == "rate limited"
    ));
    assert_eq!(summary(&view)[1], (Role::Assistant, "rate limited", MessageStatus::Errored));

    let durable = log.snapshot(&conversation_id).await.unwrap();
    assert!(durable.messages[1].failed);
    assert!(!durable.messages[1].pending);

    harness.engine.send_question("Try again?").unwrap();
    assert!(harness.engine.state().is_awaiting_answer());
}

#[tokio::test]
async fn network_failure_asks_the_user_to_resend() {
    let mut harness = Harness::new(Arc::new(MemoryLog::new()));
    harness.engine.open(conversation("report.pdf"));
    harness.wait_until_loaded().await;

    harness.engine.send_question("What is this?").unwrap();
    harness.next_ask().await.fail(AnswerError::Network {
        stage: "scripted",
        message: "connection refused".to_string(),
    });

    let view = harness
        .wait_for("errored answer", |view| matches!(view.state, EngineState::Error { .. }))
        .await;
    assert_eq!(view.messages[1].status, MessageStatus::Errored);
    assert!(view.messages[1].text.contains("connection refused"));
    assert!(view.messages[1].text.contains("resend"));
}

#[tokio::test]
async fn stale_snapshots_never_undo_optimistic_messages() {
    let log = Arc::new(MemoryLog::new());
    let watcher = Arc::new(ManualWatcher::default());
    let mut harness = Harness::with_watcher(log.clone(), watcher.clone());
    let conversation_id = conversation("report.pdf");

    harness.engine.open(conversation_id.clone());
    watcher.push(&LogSnapshot::empty(conversation_id.clone()));
    harness.engine.send_question("What is this?").unwrap();
    let ask = harness.next_ask().await;

    // Durable log now holds the question and the placeholder.
    let pending_echo = wait_for_revision(&*log, &conversation_id, 2).await;

    watcher.push(&LogSnapshot::empty(conversation_id.clone()));
    assert_eq!(summary(&harness.engine.snapshot()), vec![
        (Role::User, "What is this?", MessageStatus::Settled),
        (Role::Assistant, "", MessageStatus::Pending),
    ]);

    watcher.push(&pending_echo);
    let view = harness.engine.snapshot();
    assert_eq!(view.messages.len(), 2);
    assert!(view.messages[1].is_pending());

    ask.answer("It is a report.");
    harness
        .wait_for("local answer", |view| {
            matches!(view.state, EngineState::Reconciling(_))
        })
        .await;

    // The placeholder echo arrives late: the settled answer must not regress.
    watcher.push(&pending_echo);
    let view = harness.engine.snapshot();
    assert_eq!(summary(&view)[1], (Role::Assistant, "It is a report.", MessageStatus::Settled));
    assert!(matches!(view.state, EngineState::Reconciling(_)));

    let settled_echo = wait_for_revision(&*log, &conversation_id, 3).await;
    watcher.push(&settled_echo);
    let view = harness.engine.snapshot();
    assert_eq!(view.state, EngineState::Idle);
    assert!(all_durable(&view));
    assert_eq!(summary(&view)[1], (Role::Assistant, "It is a report.", MessageStatus::Settled));

    // A snapshot older than the applied one is ignored outright.
    watcher.push(&pending_echo);
    let after = harness.engine.snapshot();
    assert_eq!(after.messages, view.messages);
    assert_eq!(after.state, EngineState::Idle);
}

#[tokio::test]
async fn switching_conversations_discards_the_late_answer() {
    let log = Arc::new(MemoryLog::new());
    let mut harness = Harness::new(log.clone());
    let first = conversation("a.pdf");
    let second = conversation("b.pdf");

    harness.engine.open(first.clone());
    harness.wait_until_loaded().await;
    harness.engine.send_question("about a").unwrap();
    let ask = harness.next_ask().await;

    harness.engine.open(second.clone());
    harness
        .wait_for("second conversation", |view| {
            view.conversation_id.as_ref() == Some(&second) && view.loaded
        })
        .await;
    ask.answer("answer for a");

    let durable = wait_for_revision(&*log, &first, 3).await;
    assert_eq!(durable.messages[1].text, "answer for a");
    assert!(!durable.messages[1].pending);

    let view = harness.engine.snapshot();
    assert_eq!(view.conversation_id, Some(second));
    assert!(view.messages.is_empty());
    assert_eq!(view.state, EngineState::Idle);
    assert_eq!(view.reveal, None);
}

#[tokio::test]
async fn watcher_outage_keeps_the_view_and_recovers() {
    let log = Arc::new(MemoryLog::new());
    let watcher = Arc::new(ManualWatcher::default());
    let harness = Harness::with_watcher(log.clone(), watcher.clone());
    let conversation_id = conversation("report.pdf");

    log.append(&conversation_id, NewMessage::user("earlier"))
        .await
        .unwrap();
    let snapshot = log.snapshot(&conversation_id).await.unwrap();

    harness.engine.open(conversation_id.clone());
    assert_eq!(harness.engine.snapshot().watcher_status, WatcherStatus::Connecting);
    watcher.push(&snapshot);

    watcher.fail(&conversation_id, "store offline");
    let view = harness.engine.snapshot();
    assert!(view.watcher_status.is_degraded());
    assert_eq!(view.messages.len(), 1);

    watcher.push(&snapshot);
    assert_eq!(harness.engine.snapshot().watcher_status, WatcherStatus::Live);
}

#[tokio::test]
async fn remote_pending_answer_blocks_new_questions() {
    let log = Arc::new(MemoryLog::new());
    let mut harness = Harness::new(log.clone());
    let conversation_id = conversation("report.pdf");
    harness.engine.open(conversation_id.clone());
    harness.wait_until_loaded().await;

    // Another device asks and has not been answered yet.
    log.append(&conversation_id, NewMessage::user("from the phone"))
        .await
        .unwrap();
    let placeholder = log
        .append(&conversation_id, NewMessage::assistant_placeholder())
        .await
        .unwrap();
    harness
        .wait_for("remote pending answer", |view| {
            view.messages.iter().any(Message::is_pending)
        })
        .await;
    assert!(matches!(
        harness.engine.send_question("mine"),
        Err(SyncError::Busy { .. })
    ));

    log.update(&conversation_id, placeholder.id, MessagePatch::settled("phone answer"))
        .await
        .unwrap();
    harness
        .wait_for("remote answer settled", |view| {
            view.messages.len() == 2 && !view.messages[1].is_pending()
        })
        .await;
    harness.engine.send_question("mine").unwrap();
}

#[tokio::test]
async fn abandoned_remote_placeholder_expires_on_its_own() {
    let log = Arc::new(MemoryLog::new());
    let config = EngineConfig {
        stale_pending_after: Duration::from_millis(200),
        ..test_config()
    };
    let mut harness = Harness::with_config(log.clone(), config);
    let conversation_id = conversation("report.pdf");
    harness.engine.open(conversation_id.clone());
    harness.wait_until_loaded().await;

    // Another device asked, then vanished before answering.
    log.append_many(
        &conversation_id,
        vec![NewMessage::user("from the phone"), NewMessage::assistant_placeholder()],
    )
    .await
    .unwrap();
    harness
        .wait_for("remote pending answer", |view| {
            view.messages.iter().any(Message::is_pending)
        })
        .await;
    assert!(matches!(
        harness.engine.send_question("mine"),
        Err(SyncError::Busy { .. })
    ));

    let view = harness
        .wait_for("abandoned placeholder to expire", |view| {
            view.messages.len() == 2 && view.messages[1].status == MessageStatus::Errored
        })
        .await;
    assert_eq!(view.messages[1].text, INTERRUPTED_ANSWER_TEXT);
    assert_eq!(view.state, EngineState::Idle);

    harness.engine.send_question("mine").unwrap();
    assert_eq!(harness.next_ask().await.question, "mine");
}

#[tokio::test]
async fn invalid_questions_and_missing_conversation_are_rejected() {
    let log = Arc::new(MemoryLog::new());
    let mut harness = Harness::new(log.clone());

    assert!(matches!(
        harness.engine.send_question("hello"),
        Err(SyncError::NoConversation { .. })
    ));

    let conversation_id = conversation("report.pdf");
    harness.engine.open(conversation_id.clone());
    harness.wait_until_loaded().await;

    for text in ["", "   \n", "bell\u{7}"] {
        assert!(matches!(
            harness.engine.send_question(text),
            Err(SyncError::InvalidInput { .. })
        ));
    }
    assert!(harness.engine.current_view().is_empty());
    assert_eq!(harness.engine.state(), EngineState::Idle);
    assert_eq!(log.snapshot(&conversation_id).await.unwrap().revision, 0);
}

#[tokio::test]
async fn durable_write_failure_keeps_the_exchange_local() {
    let mut harness = Harness::new(Arc::new(ReadOnlyLog::default()));
    harness.engine.open(conversation("report.pdf"));
    harness.wait_until_loaded().await;

    harness.engine.send_question("What is this?").unwrap();
    harness.next_ask().await.answer("It is a report.");

    let view = harness
        .wait_for("local answer", |view| {
            view.state == EngineState::Idle && view.messages.len() == 2 && !view.messages[1].is_pending()
        })
        .await;
    assert!(view
        .messages
        .iter()
        .all(|message| matches!(message.id, MessageKey::Local(_))));
    assert_eq!(view.messages[1].text, "It is a report.");
}

#[tokio::test]
async fn sequential_questions_keep_every_answer() {
    let log = Arc::new(MemoryLog::new());
    let mut harness = Harness::new(log.clone());
    let conversation_id = conversation("report.pdf");
    harness.engine.open(conversation_id.clone());
    harness.wait_until_loaded().await;

    for round in 0..4 {
        let question = format!("question {round}");
        let answer = format!("answer {round}");
        harness.engine.send_question(&question).unwrap();
        assert_eq!(view_invariants(&harness.engine), Ok(()));

        let ask = harness.next_ask().await;
        assert_eq!(ask.question, question);
        assert!(harness.engine.send_question("interleaved").is_err());
        ask.answer(&answer);

        let expected = 2 * (round + 1);
        let view = harness
            .wait_for("reconciled round", |view| {
                view.state == EngineState::Idle && view.messages.len() == expected && all_durable(view)
            })
            .await;
        assert_eq!(view.messages[expected - 2].text, question);
        assert_eq!(view.messages[expected - 1].text, answer);
    }

    let durable = log.snapshot(&conversation_id).await.unwrap();
    assert!(durable.messages.iter().all(|record| !record.pending));
    assert_eq!(durable.messages.len(), 8);
}

#[tokio::test]
async fn second_device_sees_the_settled_exchange() {
    let log = Arc::new(MemoryLog::new());
    let mut laptop = Harness::new(log.clone());
    let mut phone = Harness::new(log.clone());
    let conversation_id = conversation("report.pdf");

    laptop.engine.open(conversation_id.clone());
    phone.engine.open(conversation_id.clone());
    laptop.wait_until_loaded().await;
    phone.wait_until_loaded().await;

    laptop.engine.send_question("What is this?").unwrap();
    laptop.next_ask().await.answer("It is a report.");

    let view = phone
        .wait_for("remote exchange", |view| {
            view.messages.len() == 2 && !view.messages[1].is_pending()
        })
        .await;
    assert_eq!(summary(&view), vec![
        (Role::User, "What is this?", MessageStatus::Settled),
        (Role::Assistant, "It is a report.", MessageStatus::Settled),
    ]);
    assert_eq!(phone.engine.state(), EngineState::Idle);
}

#[tokio::test]
async fn answer_reveal_ends_on_the_durable_message() {
    let mut harness = Harness::new(Arc::new(MemoryLog::new()));
    harness.engine.open(conversation("report.pdf"));
    harness.wait_until_loaded().await;

    harness.engine.send_question("What is this?").unwrap();
    harness.next_ask().await.answer("It is a quarterly report.");

    let view = harness
        .wait_for("finished reveal", |view| {
            view.state == EngineState::Idle
                && view.messages.len() == 2
                && all_durable(view)
                && view.reveal.as_ref().is_some_and(|reveal| reveal.is_complete)
        })
        .await;
    let reveal = view.reveal.unwrap();
    assert_eq!(reveal.visible_text, "It is a quarterly report.");
    assert_eq!(reveal.message_id, view.messages[1].id);
}

#[tokio::test]
async fn answer_settled_on_another_device_ends_the_reveal() {
    let log = Arc::new(MemoryLog::new());
    let mut phone = Harness::new(log.clone());
    let mut laptop = Harness::new(log.clone());
    let conversation_id = conversation("report.pdf");

    phone.engine.open(conversation_id.clone());
    laptop.engine.open(conversation_id.clone());
    phone.wait_until_loaded().await;
    laptop.wait_until_loaded().await;

    phone.engine.send_question("What is this?").unwrap();
    phone.next_ask().await.answer("It is a report.");
    phone
        .wait_for("phone reveal", |view| {
            view.state == EngineState::Idle
                && view.messages.len() == 2
                && all_durable(view)
                && view.reveal.as_ref().is_some_and(|reveal| reveal.is_complete)
        })
        .await;

    laptop
        .wait_for("phone exchange on the laptop", |view| {
            view.messages.len() == 2 && !view.messages[1].is_pending()
        })
        .await;
    laptop.engine.send_question("Who wrote it?").unwrap();
    laptop.next_ask().await.answer("The finance team.");

    let view = phone
        .wait_for("laptop answer on the phone", |view| {
            view.messages.len() == 4 && view.messages[3].status == MessageStatus::Settled
        })
        .await;
    assert_eq!(view.messages[3].text, "The finance team.");
    assert_eq!(view.reveal, None);

    let view = laptop
        .wait_for("laptop reveal", |view| {
            view.messages.len() == 4
                && all_durable(view)
                && view.reveal.as_ref().is_some_and(|reveal| reveal.is_complete)
        })
        .await;
    assert_eq!(view.reveal.unwrap().message_id, view.messages[3].id);
}

#[tokio::test]
async fn open_and_close_release_each_subscription_once() {
    let log = Arc::new(MemoryLog::new());
    let watcher = Arc::new(ManualWatcher::default());
    let harness = Harness::with_watcher(log.clone(), watcher.clone());
    let first = conversation("a.pdf");

    harness.engine.open(first.clone());
    harness.engine.open(conversation("b.pdf"));
    assert_eq!(watcher.subscribed.load(Ordering::SeqCst), 2);
    assert_eq!(watcher.released.load(Ordering::SeqCst), 1);

    harness.engine.close();
    harness.engine.close();
    assert_eq!(watcher.released.load(Ordering::SeqCst), 2);

    harness.engine.on_remote_snapshot(LogSnapshot::empty(first));
    assert_eq!(harness.engine.snapshot(), ConversationView::default());
    assert_eq!(harness.engine.conversation_id(), None);
}

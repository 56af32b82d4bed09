use parley_storage::ConversationId;

use super::message::Message;
use super::reveal::RevealState;
use super::state::EngineState;

/// Health of the durable log subscription.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum WatcherStatus {
    /// Subscribed, first snapshot not delivered yet.
    #[default]
    Connecting,
    Live,
    /// Retrying; the view keeps showing the last known messages.
    Degraded { message: String },
}

impl WatcherStatus {
    pub fn is_degraded(&self) -> bool {
        matches!(self, Self::Degraded { .. })
    }
}

/// Change notification for re-rendering; read the new values from the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    Opened(ConversationId),
    Closed(ConversationId),
    ViewChanged,
    StateChanged(EngineState),
    Reveal(RevealState),
    WatcherStatusChanged(WatcherStatus),
}

/// Everything a UI needs to render the open conversation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConversationView {
    pub conversation_id: Option<ConversationId>,
    pub messages: Vec<Message>,
    pub state: EngineState,
    pub watcher_status: WatcherStatus,
    /// Whether at least one durable snapshot has been applied.
    pub loaded: bool,
    pub reveal: Option<RevealState>,
}

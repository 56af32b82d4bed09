/// Epoch of the open conversation.
///
/// Bumped on every open and close so results belonging to a closed conversation are rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Generation(u64);

impl Generation {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

/// Identifier for one submitted question.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SendId(u64);

impl SendId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

/// Routing key that ties an answer back to the question and conversation it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SendTarget {
    pub generation: Generation,
    pub send_id: SendId,
}

impl SendTarget {
    pub const fn new(generation: Generation, send_id: SendId) -> Self {
        Self {
            generation,
            send_id,
        }
    }
}

/// Lifecycle of the open conversation's newest question.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum EngineState {
    #[default]
    Idle,
    AwaitingAnswer(SendTarget),
    /// Answered locally, waiting for the durable log to echo it.
    Reconciling(SendTarget),
    Error {
        target: SendTarget,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateTransition {
    Start(SendTarget),
    Answered(SendTarget),
    Failed {
        target: SendTarget,
        message: String,
    },
    /// The durable log caught up, or there is nothing left to wait for.
    Reconciled(SendTarget),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionRejection {
    AlreadyAwaiting {
        active: SendTarget,
        attempted: SendTarget,
    },
    NoActiveSend,
    TargetMismatch {
        active: SendTarget,
        attempted: SendTarget,
    },
}

pub type TransitionResult = Result<EngineState, TransitionRejection>;

impl EngineState {
    pub fn is_awaiting_answer(&self) -> bool {
        matches!(self, Self::AwaitingAnswer(_))
    }

    /// Applies one transition deterministically.
    ///
    /// Only `AwaitingAnswer` refuses a new send. Answer outcomes must match the awaited
    /// target exactly and reconciliation must match the reconciling one.
    pub fn apply(&self, transition: StateTransition) -> TransitionResult {
        match transition {
            StateTransition::Start(target) => self.apply_start(target),
            StateTransition::Answered(target) => self.apply_answered(target),
            StateTransition::Failed { target, message } => self.apply_failed(target, message),
            StateTransition::Reconciled(target) => self.apply_reconciled(target),
        }
    }

    fn apply_start(&self, target: SendTarget) -> TransitionResult {
        match self {
            Self::AwaitingAnswer(active) => Err(TransitionRejection::AlreadyAwaiting {
                active: *active,
                attempted: target,
            }),
            Self::Idle | Self::Reconciling(_) | Self::Error { .. } => {
                Ok(Self::AwaitingAnswer(target))
            }
        }
    }

    fn apply_answered(&self, target: SendTarget) -> TransitionResult {
        match self {
            Self::AwaitingAnswer(active) if *active == target => Ok(Self::Reconciling(target)),
            Self::AwaitingAnswer(active) => Err(TransitionRejection::TargetMismatch {
                active: *active,
                attempted: target,
            }),
            Self::Idle | Self::Reconciling(_) | Self::Error { .. } => {
                Err(TransitionRejection::NoActiveSend)
            }
        }
    }

    fn apply_failed(&self, target: SendTarget, message: String) -> TransitionResult {
        match self {
            Self::AwaitingAnswer(active) if *active == target => {
                Ok(Self::Error { target, message })
            }
            Self::AwaitingAnswer(active) => Err(TransitionRejection::TargetMismatch {
                active: *active,
                attempted: target,
            }),
            Self::Idle | Self::Reconciling(_) | Self::Error { .. } => {
                Err(TransitionRejection::NoActiveSend)
            }
        }
    }

    fn apply_reconciled(&self, target: SendTarget) -> TransitionResult {
        match self {
            Self::Reconciling(active) if *active == target => Ok(Self::Idle),
            Self::Reconciling(active) => Err(TransitionRejection::TargetMismatch {
                active: *active,
                attempted: target,
            }),
            Self::Idle | Self::AwaitingAnswer(_) | Self::Error { .. } => {
                Err(TransitionRejection::NoActiveSend)
            }
        }
    }
}

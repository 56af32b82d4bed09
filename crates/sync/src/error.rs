use snafu::Snafu;

/// Rejections returned synchronously by the engine's public operations.
///
/// Answer failures are not errors here: they surface as an errored assistant message.
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SyncError {
    #[snafu(display("a question is already awaiting its answer"))]
    Busy { stage: &'static str },
    #[snafu(display("invalid question: {details}"))]
    InvalidInput {
        stage: &'static str,
        details: String,
    },
    #[snafu(display("no conversation is open"))]
    NoConversation { stage: &'static str },
}

pub type SyncResult<T> = Result<T, SyncError>;

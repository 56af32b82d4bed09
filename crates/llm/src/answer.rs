use std::future::Future;
use std::pin::Pin;

use snafu::{Snafu, ensure};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type AnswerResult<T> = Result<T, AnswerError>;
pub type SetupResult<T> = Result<T, SetupError>;

/// Longest question, in characters, the backends accept.
pub const MAX_QUESTION_CHARS: usize = 4_000;

/// Failure of one `ask` call.
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum AnswerError {
    /// The backend could not be reached; resending the question is safe.
    #[snafu(display("network error: {message}"))]
    Network {
        stage: &'static str,
        message: String,
    },
    /// The backend understood the request but could not answer it.
    #[snafu(display("{message}"))]
    Server {
        stage: &'static str,
        message: String,
    },
    /// The question was rejected locally and never sent.
    #[snafu(display("invalid question: {details}"))]
    InvalidInput {
        stage: &'static str,
        details: String,
    },
}

impl AnswerError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network { .. })
    }

    /// Text shown to the user in place of the answer.
    pub fn user_message(&self) -> String {
        match self {
            Self::Network { message, .. } => {
                format!("Could not reach the answering service ({message}). Please resend.")
            }
            Self::Server { message, .. } => message.clone(),
            Self::InvalidInput { details, .. } => format!("Invalid question: {details}"),
        }
    }
}

/// Failure while constructing a client from configuration.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SetupError {
    #[snafu(display("missing API key for answer backend '{backend}'"))]
    MissingApiKey {
        stage: &'static str,
        backend: &'static str,
    },
    #[snafu(display("answer endpoint must not be empty"))]
    EmptyEndpoint { stage: &'static str },
    #[snafu(display("failed to build http client on `{stage}`: {source}"))]
    BuildHttpClient {
        stage: &'static str,
        source: reqwest::Error,
    },
}

/// One request/response call per question.
///
/// Callers keep at most one `ask` outstanding per conversation.
pub trait AnswerClient: Send + Sync {
    fn name(&self) -> &str;
    fn ask<'a>(&'a self, question: &'a str) -> BoxFuture<'a, AnswerResult<String>>;
}

/// Returns the trimmed question or the reason it must not be sent.
pub fn validate_question(question: &str) -> AnswerResult<&str> {
    let trimmed = question.trim();
    ensure!(
        !trimmed.is_empty(),
        InvalidInputSnafu {
            stage: "validate-question-empty",
            details: "question is empty".to_string(),
        }
    );

    let length = trimmed.chars().count();
    ensure!(
        length <= MAX_QUESTION_CHARS,
        InvalidInputSnafu {
            stage: "validate-question-length",
            details: format!("question has {length} characters, limit is {MAX_QUESTION_CHARS}"),
        }
    );

    ensure!(
        !trimmed
            .chars()
            .any(|character| character.is_control() && character != '\n' && character != '\t'),
        InvalidInputSnafu {
            stage: "validate-question-control",
            details: "question contains control characters".to_string(),
        }
    );

    Ok(trimmed)
}

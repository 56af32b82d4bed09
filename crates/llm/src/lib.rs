//! Question answering over the currently loaded document.
//!
//! The sync engine only sees [`AnswerClient`]; the adapters here bind it to the HTTP
//! question-answering backend or to an OpenAI-compatible model through rig.

mod answer;
mod context;
mod http;
mod rig_adapter;

pub use answer::{
    AnswerClient, AnswerError, AnswerResult, BoxFuture, MAX_QUESTION_CHARS, SetupError,
    SetupResult, validate_question,
};
pub use context::{CHUNK_WORDS, CONTEXT_CHUNKS, DocumentContext};
pub use http::{DEFAULT_HTTP_ENDPOINT, HttpAnswerClient};
pub use rig_adapter::{DEFAULT_OPENAI_MODEL, RigAnswerClient, RigConfig};

//! Wiring of the chat synchronization engine: configuration, logging, and the concrete
//! store and answer backend it runs against.

pub mod config;
pub mod telemetry;

use std::sync::Arc;

use parley_llm::{AnswerClient, HttpAnswerClient, RigAnswerClient, RigConfig, SetupError};
use parley_storage::{ConversationId, ConversationLog, MemoryLog, SqliteLog, StorageError};
use parley_sync::ChatSyncEngine;
use snafu::{ResultExt, Snafu};

use crate::config::{AnswerBackend, AnswerSettings, ParleyConfig, StorageSettings};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ConnectError {
    #[snafu(display("failed to open conversation store on `{stage}`: {source}"))]
    OpenStore {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("failed to set up answer backend on `{stage}`: {source}"))]
    AnswerSetup {
        stage: &'static str,
        source: SetupError,
    },
    #[snafu(display("invalid conversation on `{stage}`: {source}"))]
    Conversation {
        stage: &'static str,
        source: StorageError,
    },
}

pub type ConnectResult<T> = Result<T, ConnectError>;

/// Answer backend as configured; the OpenAI one needs the document text handed to it.
#[derive(Clone)]
pub enum AnswerHandle {
    Http(Arc<HttpAnswerClient>),
    OpenAi(Arc<RigAnswerClient>),
}

impl AnswerHandle {
    pub fn client(&self) -> Arc<dyn AnswerClient> {
        match self {
            Self::Http(client) => client.clone(),
            Self::OpenAi(client) => client.clone(),
        }
    }
}

pub async fn open_log(settings: &StorageSettings) -> Result<Arc<dyn ConversationLog>, StorageError> {
    if settings.is_memory() {
        tracing::info!("using in-memory conversation store");
        return Ok(Arc::new(MemoryLog::new()));
    }

    let log = SqliteLog::open(&settings.database).await?;
    tracing::info!(database = %settings.database, "opened sqlite conversation store");
    Ok(Arc::new(log))
}

pub fn create_answer_client(settings: &AnswerSettings) -> Result<AnswerHandle, SetupError> {
    match settings.backend {
        AnswerBackend::Http => {
            let client = HttpAnswerClient::new(settings.endpoint.as_str(), settings.timeout())?;
            tracing::info!(endpoint = client.endpoint(), "using http answer backend");
            Ok(AnswerHandle::Http(Arc::new(client)))
        }
        AnswerBackend::Openai => {
            let mut config = RigConfig::new(settings.api_key.as_str(), settings.endpoint.as_str())
                .with_model(settings.model.as_str());
            if let Some(max_tokens) = settings.max_tokens {
                config = config.with_max_tokens(max_tokens);
            }
            Ok(AnswerHandle::OpenAi(Arc::new(RigAnswerClient::new(config)?)))
        }
    }
}

/// A configured engine together with the store and backend it was built from.
pub struct Parley {
    config: ParleyConfig,
    log: Arc<dyn ConversationLog>,
    answers: AnswerHandle,
    engine: ChatSyncEngine,
}

/// Opens the configured store and answer backend and builds an engine over them.
///
/// Must be called inside a Tokio runtime.
pub async fn connect(config: ParleyConfig) -> ConnectResult<Parley> {
    let config = config.normalized();
    let log = open_log(&config.storage).await.context(OpenStoreSnafu {
        stage: "connect-open-store",
    })?;
    let answers = create_answer_client(&config.answer).context(AnswerSetupSnafu {
        stage: "connect-answer-backend",
    })?;

    let engine = ChatSyncEngine::new(Arc::clone(&log), answers.client(), config.engine_config());
    tracing::info!(
        user = %config.user_id,
        backend = engine.answer_backend(),
        "engine ready"
    );

    Ok(Parley {
        config,
        log,
        answers,
        engine,
    })
}

impl Parley {
    pub fn config(&self) -> &ParleyConfig {
        &self.config
    }

    pub fn engine(&self) -> &ChatSyncEngine {
        &self.engine
    }

    pub fn log(&self) -> Arc<dyn ConversationLog> {
        Arc::clone(&self.log)
    }

    pub fn answers(&self) -> &AnswerHandle {
        &self.answers
    }

    pub fn conversation_for(&self, document_id: &str) -> ConnectResult<ConversationId> {
        ConversationId::new(self.config.user_id.as_str(), document_id).context(ConversationSnafu {
            stage: "conversation-for-document",
        })
    }

    /// Opens the configured user's conversation about `document_id`.
    pub fn open_document(&self, document_id: &str) -> ConnectResult<ConversationId> {
        let conversation_id = self.conversation_for(document_id)?;
        self.engine.open(conversation_id.clone());
        Ok(conversation_id)
    }

    /// Hands the document text to backends that answer from it locally.
    ///
    /// Returns `false` for the HTTP backend, which keeps its own copy of the document.
    pub fn load_document_text(&self, text: &str) -> bool {
        match &self.answers {
            AnswerHandle::Http(_) => false,
            AnswerHandle::OpenAi(client) => {
                client.load_document(text);
                true
            }
        }
    }
}

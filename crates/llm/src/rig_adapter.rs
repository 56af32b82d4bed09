use std::sync::Arc;

use arc_swap::ArcSwap;
use futures::StreamExt;
use rig::completion::{CompletionModel, Message as RigMessage};
use rig::prelude::CompletionClient;
use rig::providers::openai;
use rig::streaming::StreamedAssistantContent;
use snafu::ensure;

use super::answer::{
    AnswerClient, AnswerError, AnswerResult, BoxFuture, MissingApiKeySnafu, ServerSnafu,
    SetupResult, validate_question,
};
use super::context::{CONTEXT_CHUNKS, DocumentContext};

pub const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-mini";

#[derive(Debug, Clone, PartialEq)]
pub struct RigConfig {
    pub api_key: String,
    /// Empty selects the provider's default base URL.
    pub endpoint: String,
    pub model: String,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u64>,
}

impl RigConfig {
    pub fn new(api_key: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into().trim().to_string(),
            endpoint: endpoint.into().trim().to_string(),
            model: DEFAULT_OPENAI_MODEL.to_string(),
            temperature: None,
            max_tokens: None,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        let model = model.into().trim().to_string();
        if !model.is_empty() {
            self.model = model;
        }
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u64) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

/// Answers questions with an OpenAI-compatible model, grounded in the loaded document.
pub struct RigAnswerClient {
    config: RigConfig,
    document: ArcSwap<DocumentContext>,
}

impl RigAnswerClient {
    pub fn new(config: RigConfig) -> SetupResult<Self> {
        ensure!(
            !config.api_key.is_empty(),
            MissingApiKeySnafu {
                stage: "rig-answer-client-new",
                backend: "openai",
            }
        );

        Ok(Self {
            config,
            document: ArcSwap::from_pointee(DocumentContext::default()),
        })
    }

    /// Replaces the document questions are answered against.
    pub fn load_document(&self, text: &str) {
        let context = DocumentContext::from_text(text);
        tracing::info!(chunks = context.chunk_count(), "loaded document context");
        self.document.store(Arc::new(context));
    }

    pub fn clear_document(&self) {
        self.document.store(Arc::new(DocumentContext::default()));
    }

    pub fn document(&self) -> Arc<DocumentContext> {
        self.document.load_full()
    }

    fn build_client(config: &RigConfig) -> AnswerResult<openai::Client> {
        let mut builder = openai::Client::builder().api_key(config.api_key.as_str());
        if !config.endpoint.is_empty() {
            builder = builder.base_url(config.endpoint.as_str());
        }
        builder.build().map_err(|source| AnswerError::Network {
            stage: "rig-build-client",
            message: source.to_string(),
        })
    }

    async fn ask_inner(&self, question: &str) -> AnswerResult<String> {
        let question = validate_question(question)?;
        let document = self.document.load_full();
        ensure!(
            !document.is_empty(),
            ServerSnafu {
                stage: "rig-ask-document",
                message: "no document is loaded".to_string(),
            }
        );

        let prompt = build_prompt(question, &document.relevant(question, CONTEXT_CHUNKS));
        let client = Self::build_client(&self.config)?;
        let model = client.completion_model(self.config.model.clone());
        let mut builder = model.completion_request(RigMessage::user(prompt));

        if let Some(temperature) = self.config.temperature {
            builder = builder.temperature(temperature);
        }

        if let Some(max_tokens) = self.config.max_tokens {
            builder = builder.max_tokens(max_tokens);
        }

        let mut stream = builder.stream().await.map_err(|source| AnswerError::Server {
            stage: "rig-open-stream",
            message: source.to_string(),
        })?;

        // The engine renders finished answers only, so deltas are folded here.
        let mut answer = String::new();
        while let Some(item) = stream.next().await {
            match item {
                Ok(StreamedAssistantContent::Text(text)) => answer.push_str(&text.text),
                Ok(_) => {}
                Err(source) => {
                    tracing::warn!(
                        model_id = %self.config.model,
                        error = %source,
                        "answer stream emitted an error chunk"
                    );
                    return Err(AnswerError::Server {
                        stage: "rig-stream-chunk",
                        message: source.to_string(),
                    });
                }
            }
        }

        let answer = answer.trim().to_string();
        ensure!(
            !answer.is_empty(),
            ServerSnafu {
                stage: "rig-empty-answer",
                message: "the model returned an empty answer".to_string(),
            }
        );
        Ok(answer)
    }
}

impl AnswerClient for RigAnswerClient {
    fn name(&self) -> &str {
        "openai"
    }

    fn ask<'a>(&'a self, question: &'a str) -> BoxFuture<'a, AnswerResult<String>> {
        Box::pin(self.ask_inner(question))
    }
}

fn build_prompt(question: &str, chunks: &[&str]) -> String {
    format!(
        "Context:\n{}\n\nQuestion: {question}\nAnswer:",
        chunks.join("\n")
    )
}

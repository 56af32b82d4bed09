use std::time::Duration;

use serde::Deserialize;
use snafu::{ResultExt, ensure};

use super::answer::{
    AnswerClient, AnswerError, AnswerResult, BoxFuture, BuildHttpClientSnafu, EmptyEndpointSnafu,
    SetupResult, validate_question,
};

pub const DEFAULT_HTTP_ENDPOINT: &str = "http://127.0.0.1:8000";

/// Body of the backend's `/query` endpoint: exactly one of the fields is set.
#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    response: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Asks the document question-answering backend over HTTP.
pub struct HttpAnswerClient {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpAnswerClient {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> SetupResult<Self> {
        let endpoint = endpoint.into().trim().trim_end_matches('/').to_string();
        ensure!(
            !endpoint.is_empty(),
            EmptyEndpointSnafu {
                stage: "http-answer-client-new",
            }
        );

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context(BuildHttpClientSnafu {
                stage: "http-answer-client-build",
            })?;

        Ok(Self { client, endpoint })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn ask_inner(&self, question: &str) -> AnswerResult<String> {
        let question = validate_question(question)?;
        let url = format!("{}/query", self.endpoint);

        let response = self
            .client
            .get(&url)
            .query(&[("query", question)])
            .send()
            .await
            .map_err(|source| network_error("http-send-query", &source))?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|source| network_error("http-read-query-body", &source))?;

        let answer = parse_answer_body(status, &body);
        if let Err(error) = &answer {
            tracing::warn!(
                endpoint = %self.endpoint,
                status,
                error = %error,
                "answer backend returned an error"
            );
        }
        answer
    }
}

impl AnswerClient for HttpAnswerClient {
    fn name(&self) -> &str {
        "http"
    }

    fn ask<'a>(&'a self, question: &'a str) -> BoxFuture<'a, AnswerResult<String>> {
        Box::pin(self.ask_inner(question))
    }
}

fn network_error(stage: &'static str, source: &reqwest::Error) -> AnswerError {
    AnswerError::Network {
        stage,
        message: source.to_string(),
    }
}

fn parse_answer_body(status: u16, body: &str) -> AnswerResult<String> {
    let parsed = serde_json::from_str::<QueryResponse>(body).ok();

    if let Some(message) = parsed.as_ref().and_then(|payload| payload.error.clone()) {
        return Err(AnswerError::Server {
            stage: "http-error-payload",
            message,
        });
    }

    // Gateways answering for an unreachable backend are as transient as a refused connection.
    if matches!(status, 502..=504) {
        return Err(AnswerError::Network {
            stage: "http-gateway-status",
            message: format!("backend unavailable (status {status})"),
        });
    }

    if !(200..300).contains(&status) {
        return Err(AnswerError::Server {
            stage: "http-status",
            message: format!("backend returned status {status}"),
        });
    }

    match parsed.and_then(|payload| payload.response) {
        Some(answer) => Ok(answer.trim().to_string()),
        None => Err(AnswerError::Server {
            stage: "http-parse-response",
            message: "backend response did not contain an answer".to_string(),
        }),
    }
}

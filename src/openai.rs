/*!
OpenAI chat-completion client.

Used twice: a 1-token probe that validates the key/model pair at
submission time, and the short rubric completions behind sentiment and
salience scoring.
*/

use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::error::{Error, Result};

const CHAT_COMPLETIONS_URL: &str = "https://api.openai.com/v1/chat/completions";

#[derive(Clone)]
pub struct OpenAiClient {
    client: Client,
    api_key: String,
}

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<Message>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Serialize, Deserialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: Message,
}

impl OpenAiClient {
    /// Build a client around a key carried in a queue payload. Clients
    /// are per-message and never shared across payloads.
    pub fn new(api_key: &str) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap(),
            api_key: api_key.to_string(),
        }
    }

    /// 1-token probe validating the key and model. Provider failures are
    /// mapped to the submission error taxonomy.
    pub async fn validate_key(&self, model: &str) -> Result<()> {
        let request = ChatRequest {
            model: model.to_string(),
            messages: vec![Message {
                role: "user".to_string(),
                content: "ping".to_string(),
            }],
            temperature: 0.0,
            max_tokens: 1,
        };

        let response = self
            .client
            .post(CHAT_COMPLETIONS_URL)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        debug!(%status, body, "key validation probe rejected");

        Err(match status.as_u16() {
            401 => Error::AuthFailed("OpenAI rejected the API key".to_string()),
            403 => Error::ModelForbidden(format!("model {model} is not accessible")),
            404 => Error::ModelNotFound(format!("model {model} does not exist")),
            429 => Error::QuotaExceeded("OpenAI quota exhausted".to_string()),
            _ => Error::UpstreamUnavailable(format!("OpenAI returned {status}")),
        })
    }

    /// One chat completion, returning the first choice's text. Errors
    /// are classified for the backoff helper: 429/5xx are retryable.
    pub async fn completion(
        &self,
        model: &str,
        system: &str,
        user: &str,
        temperature: f32,
        max_tokens: u32,
    ) -> Result<String> {
        let request = ChatRequest {
            model: model.to_string(),
            messages: vec![
                Message {
                    role: "system".to_string(),
                    content: system.to_string(),
                },
                Message {
                    role: "user".to_string(),
                    content: user.to_string(),
                },
            ],
            temperature,
            max_tokens,
        };

        let response = self
            .client
            .post(CHAT_COMPLETIONS_URL)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(if status.as_u16() == 429 || status.is_server_error() {
                Error::RetryableUpstream(format!("OpenAI {status}: {body}"))
            } else {
                Error::AnalysisFailed(format!("OpenAI {status}: {body}"))
            });
        }

        let parsed: ChatResponse = response.json().await?;
        Ok(parsed
            .choices
            .first()
            .map(|c| c.message.content.clone())
            .unwrap_or_default())
    }
}

/// First integer appearing in an LLM reply, if any.
pub fn parse_leading_int(text: &str) -> Option<i32> {
    let digits: String = text
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

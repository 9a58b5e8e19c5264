//! OpenAI-compatible chat completion client.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use log::{debug, warn};
use reqwest::header::{ACCEPT, AUTHORIZATION};
use reqwest_eventsource::{Event, EventSource};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use super::error::{LlmError, LlmResult};
use super::{ChatMessage, CompletionModel, DEFAULT_LIMIT, FragmentStream, build_messages};
use crate::context::ContextWindow;

pub const DEFAULT_URL: &str = "https://api.openai.com/v1";

const AZURE_API_VERSION: &str = "2023-05-15";

/// Fragments buffered between the upstream reader and the consumer.
const FRAGMENT_BUFFER: usize = 100;

/// Connection settings shared by every model on one endpoint.
#[derive(Debug, Clone)]
pub struct OpenAiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    azure: bool,
}

impl OpenAiClient {
    /// An empty `base_url` means the public OpenAI endpoint. Azure endpoints
    /// (`*.openai.azure.com`) are detected from the URL.
    pub fn new(base_url: &str, api_key: &str) -> LlmResult<Self> {
        let base_url = if base_url.is_empty() {
            DEFAULT_URL
        } else {
            base_url
        };

        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            azure: base_url.contains("openai.azure.com"),
        })
    }

    pub fn is_azure(&self) -> bool {
        self.azure
    }

    fn endpoint(&self, model: &str) -> String {
        if self.azure {
            format!(
                "{}/openai/deployments/{}/chat/completions?api-version={}",
                self.base_url,
                azure_deployment(model),
                AZURE_API_VERSION
            )
        } else {
            format!("{}/chat/completions", self.base_url)
        }
    }

    fn post(&self, model: &str, body: &CompletionRequest<'_>) -> reqwest::RequestBuilder {
        let builder = self.http.post(self.endpoint(model)).json(body);
        if self.azure {
            builder.header("api-key", &self.api_key)
        } else {
            builder.header(AUTHORIZATION, format!("Bearer {}", self.api_key))
        }
    }
}

/// Azure deployment names cannot contain dots.
fn azure_deployment(model: &str) -> String {
    model.replace('.', "")
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    user: &'a str,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    content: Option<String>,
}

/// Text carried by one streamed chunk, if any.
fn chunk_content(data: &str) -> Result<Option<String>, serde_json::Error> {
    let chunk: StreamChunk = serde_json::from_str(data)?;
    Ok(chunk
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.delta.content)
        .filter(|c| !c.is_empty()))
}

/// One upstream chat model.
pub struct OpenAiModel {
    client: OpenAiClient,
    model: String,
    limit: usize,
}

impl OpenAiModel {
    pub fn new(client: OpenAiClient, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
            limit: DEFAULT_LIMIT,
        }
    }

    /// Override the character allowance per request.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    fn request<'a>(
        &'a self,
        prompt: &str,
        user: &'a str,
        context: &ContextWindow,
        stream: bool,
    ) -> CompletionRequest<'a> {
        CompletionRequest {
            model: &self.model,
            messages: build_messages(prompt, context, self.limit),
            user,
            stream,
        }
    }
}

#[async_trait]
impl CompletionModel for OpenAiModel {
    fn name(&self) -> &str {
        &self.model
    }

    async fn complete(
        &self,
        prompt: &str,
        user: &str,
        context: &ContextWindow,
    ) -> LlmResult<String> {
        let body = self.request(prompt, user, context, false);
        let response = self.client.post(&self.model, &body).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: CompletionResponse = response.json().await?;
        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or(LlmError::EmptyResponse)
    }

    async fn stream(
        &self,
        prompt: &str,
        user: &str,
        context: &ContextWindow,
    ) -> LlmResult<FragmentStream> {
        let body = self.request(prompt, user, context, true);
        let builder = self
            .client
            .post(&self.model, &body)
            .header(ACCEPT, "text/event-stream");
        let mut es = EventSource::new(builder)?;

        // Surface connection and status failures to the caller.
        match es.next().await {
            Some(Ok(Event::Open)) => {
                debug!("Completion stream opened for {}", self.model);
            }
            Some(Ok(Event::Message(_))) => {
                es.close();
                return Err(LlmError::Stream("message before open".to_string()));
            }
            Some(Err(reqwest_eventsource::Error::InvalidStatusCode(status, response))) => {
                es.close();
                let body = response.text().await.unwrap_or_default();
                return Err(LlmError::Status {
                    status: status.as_u16(),
                    body,
                });
            }
            Some(Err(e)) => {
                es.close();
                return Err(LlmError::Stream(e.to_string()));
            }
            None => return Err(LlmError::Stream("stream ended before open".to_string())),
        }

        let (tx, rx) = mpsc::channel(FRAGMENT_BUFFER);
        let model = self.model.clone();
        tokio::spawn(async move {
            while let Some(event) = es.next().await {
                match event {
                    Ok(Event::Open) => {}
                    Ok(Event::Message(msg)) => {
                        if msg.data.trim() == "[DONE]" {
                            break;
                        }
                        match chunk_content(&msg.data) {
                            Ok(Some(fragment)) => {
                                if tx.send(fragment).await.is_err() {
                                    debug!("Fragment consumer for {} went away", model);
                                    break;
                                }
                            }
                            Ok(None) => {}
                            Err(e) => warn!("Skipping malformed chunk from {}: {}", model, e),
                        }
                    }
                    Err(reqwest_eventsource::Error::StreamEnded) => break,
                    Err(e) => {
                        warn!("Error in completion stream for {}: {}", model, e);
                        break;
                    }
                }
            }
            es.close();
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

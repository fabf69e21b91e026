//! OpenAI-compatible HTTP client for chat completions and embeddings.

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::{CompletionConfig, EmbeddingConfig};
use crate::types::Usage;

use super::{Completion, CompletionClient, CompletionOptions, EmbeddingClient, ServiceError, StreamEvent};

/// Client for any OpenAI-compatible `/chat/completions` and `/embeddings`
/// endpoint.
pub struct OpenAiClient {
    client: reqwest::Client,
    api_key: Option<String>,
    base_url: String,
    model: String,
}

impl OpenAiClient {
    pub fn completion(config: &CompletionConfig) -> Self {
        if config.api_key.is_none() {
            warn!("no completion API key configured, completion calls will fail");
        }
        Self {
            client: reqwest::Client::new(),
            api_key: config.api_key.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
        }
    }

    pub fn embedding(config: &EmbeddingConfig) -> Self {
        if config.api_key.is_none() {
            warn!("no embedding API key configured, embedding calls will fail");
        }
        Self {
            client: reqwest::Client::new(),
            api_key: config.api_key.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
        }
    }

    fn key(&self) -> Result<&str, ServiceError> {
        self.api_key
            .as_deref()
            .ok_or(ServiceError::MissingCredentials("openai"))
    }

    async fn post(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> Result<reqwest::Response, ServiceError> {
        let key = self.key()?;
        let response = self
            .client
            .post(format!("{}{path}", self.base_url))
            .bearer_auth(key)
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ServiceError::Api {
                status: status.as_u16(),
                message,
            });
        }
        Ok(response)
    }
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

#[derive(Deserialize, Default)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

impl From<WireUsage> for Usage {
    fn from(wire: WireUsage) -> Self {
        Usage {
            input_tokens: wire.prompt_tokens,
            output_tokens: wire.completion_tokens,
        }
    }
}

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Deserialize, Default)]
struct StreamDelta {
    content: Option<String>,
}

#[async_trait]
impl CompletionClient for OpenAiClient {
    async fn complete(
        &self,
        prompt: &str,
        options: &CompletionOptions,
    ) -> Result<Completion, ServiceError> {
        let body = json!({
            "model": self.model,
            "messages": [{"role": "user", "content": prompt}],
            "max_tokens": options.max_tokens,
            "temperature": options.temperature,
        });
        let response = self.post("/chat/completions", body).await?;
        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|err| ServiceError::Malformed(err.to_string()))?;
        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ServiceError::Malformed("completion has no choices".to_string()))?;
        Ok(Completion {
            text,
            usage: parsed.usage.unwrap_or_default().into(),
        })
    }

    async fn complete_stream(
        &self,
        prompt: &str,
        options: &CompletionOptions,
    ) -> Result<mpsc::Receiver<StreamEvent>, ServiceError> {
        let body = json!({
            "model": self.model,
            "messages": [{"role": "user", "content": prompt}],
            "max_tokens": options.max_tokens,
            "temperature": options.temperature,
            "stream": true,
            "stream_options": {"include_usage": true},
        });
        let response = self.post("/chat/completions", body).await?;

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            let mut usage = Usage::default();
            let mut buffer = String::new();
            let mut stream = response.bytes_stream();
            'outer: while let Some(chunk) = stream.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(err) => {
                        warn!(%err, "completion stream interrupted");
                        break;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&chunk));
                while let Some(pos) = buffer.find('\n') {
                    let line = buffer[..pos].trim().to_string();
                    buffer.drain(..=pos);
                    let Some(payload) = line.strip_prefix("data: ") else { continue };
                    if payload == "[DONE]" {
                        break 'outer;
                    }
                    match serde_json::from_str::<StreamChunk>(payload) {
                        Ok(parsed) => {
                            if let Some(wire) = parsed.usage {
                                usage = wire.into();
                            }
                            for choice in parsed.choices {
                                if let Some(content) = choice.delta.content {
                                    if !content.is_empty()
                                        && tx.send(StreamEvent::Token(content)).await.is_err()
                                    {
                                        break 'outer;
                                    }
                                }
                            }
                        }
                        Err(err) => debug!(%err, "skipping unparseable stream chunk"),
                    }
                }
            }
            let _ = tx.send(StreamEvent::Done(usage)).await;
        });

        Ok(rx)
    }
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingRow>,
}

#[derive(Deserialize)]
struct EmbeddingRow {
    index: usize,
    embedding: Vec<f32>,
}

#[async_trait]
impl EmbeddingClient for OpenAiClient {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ServiceError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let body = json!({
            "model": self.model,
            "input": texts,
        });
        let response = self.post("/embeddings", body).await?;
        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|err| ServiceError::Malformed(err.to_string()))?;
        if parsed.data.len() != texts.len() {
            return Err(ServiceError::Malformed(format!(
                "embedding count mismatch: sent {}, got {}",
                texts.len(),
                parsed.data.len()
            )));
        }
        let mut rows = parsed.data;
        rows.sort_by_key(|row| row.index);
        Ok(rows.into_iter().map(|row| row.embedding).collect())
    }
}

use async_stream::try_stream;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::warn;

use crate::config::{OpenAiConfig, DEFAULT_MODEL};
use crate::error::{EngineError, Result};
use crate::interfaces::providers::{ChatEvent, ChatOptions, LlmProvider, TokenUsage};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// OpenAI-compatible chat completions client speaking the SSE streaming
/// protocol directly.
#[derive(Clone)]
pub struct OpenAiProvider {
    client: reqwest::Client,
    api_key: String,
    model: String,
    fallback_model: Option<String>,
    base_url: String,
    temperature: Option<f32>,
}

impl OpenAiProvider {
    pub fn new(api_key: String, model: Option<String>, base_url: Option<String>) -> Self {
        let model = model.unwrap_or_else(|| DEFAULT_MODEL.to_string());
        let base_url = base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        Self {
            client: reqwest::Client::new(),
            api_key,
            model,
            fallback_model: None,
            base_url: base_url.trim_end_matches('/').to_string(),
            temperature: None,
        }
    }

    pub fn from_config(config: &OpenAiConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| EngineError::Config("openai.api_key is required".to_string()))?;
        let mut provider = Self::new(api_key, config.model.clone(), config.base_url.clone());
        provider.fallback_model = config.fallback_model.clone();
        provider.temperature = config.temperature;
        Ok(provider)
    }

    pub fn with_fallback_model(mut self, model: impl Into<String>) -> Self {
        self.fallback_model = Some(model.into());
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    async fn send(
        &self,
        model: &str,
        messages: &[Value],
        options: &ChatOptions,
    ) -> Result<reqwest::Response> {
        let mut body = json!({
            "model": model,
            "messages": messages,
            "stream": true,
            "stream_options": { "include_usage": true },
        });
        if let Some(temperature) = self.temperature {
            body["temperature"] = json!(temperature);
        }
        if let Some(max_tokens) = options.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }

        self.client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| EngineError::Upstream(e.to_string()))
    }

    /// Opens the stream on the primary model, retrying once on the fallback
    /// model when the primary answers with a server error. Nothing has been
    /// streamed at that point, so the retry cannot duplicate output.
    async fn open(&self, messages: &[Value], options: &ChatOptions) -> Result<reqwest::Response> {
        let primary = options.model.clone().unwrap_or_else(|| self.model.clone());
        let response = self.send(&primary, messages, options).await?;
        if response.status().is_server_error() {
            if let Some(fallback) = self
                .fallback_model
                .as_deref()
                .filter(|fallback| *fallback != primary)
            {
                warn!(
                    model = %primary,
                    fallback = %fallback,
                    status = %response.status(),
                    "upstream model failed, retrying on fallback model"
                );
                let response = self.send(fallback, messages, options).await?;
                return ensure_success(response).await;
            }
        }
        ensure_success(response).await
    }
}

async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(EngineError::Upstream(format!(
        "status {}: {}",
        status.as_u16(),
        body.trim()
    )))
}

/// Reassembles SSE lines from body chunks. Bytes are held until a newline
/// arrives, so a line or a multi-byte character split across chunks is
/// decoded whole.
#[derive(Default)]
struct SseBuffer {
    pending: Vec<u8>,
}

impl SseBuffer {
    fn push(&mut self, chunk: &[u8]) {
        self.pending.extend_from_slice(chunk);
    }

    fn next_line(&mut self) -> Option<String> {
        let newline = self.pending.iter().position(|b| *b == b'\n')?;
        let raw: Vec<u8> = self.pending.drain(..=newline).collect();
        Some(String::from_utf8_lossy(&raw).trim().to_string())
    }
}

#[derive(Debug, PartialEq)]
enum SseLine {
    Skip,
    Done,
    Data(Value),
}

fn parse_sse_line(line: &str) -> Result<SseLine> {
    let Some(payload) = line.strip_prefix("data:") else {
        return Ok(SseLine::Skip);
    };
    let payload = payload.trim();
    if payload.is_empty() {
        return Ok(SseLine::Skip);
    }
    if payload == "[DONE]" {
        return Ok(SseLine::Done);
    }
    serde_json::from_str(payload)
        .map(SseLine::Data)
        .map_err(|e| EngineError::Upstream(format!("malformed stream chunk: {e}")))
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn chat_stream(
        &self,
        messages: Vec<Value>,
        options: ChatOptions,
    ) -> BoxStream<'static, Result<ChatEvent>> {
        let provider = self.clone();

        Box::pin(try_stream! {
            let response = provider.open(&messages, &options).await?;
            let mut body = response.bytes_stream();
            let mut lines = SseBuffer::default();
            let mut finish_reason: Option<String> = None;
            let mut usage: Option<TokenUsage> = None;
            let mut done = false;

            while let Some(chunk) = body.next().await {
                let chunk = chunk.map_err(|e| EngineError::Upstream(e.to_string()))?;
                lines.push(&chunk);

                while let Some(line) = lines.next_line() {
                    let value = match parse_sse_line(&line)? {
                        SseLine::Skip => continue,
                        SseLine::Done => {
                            done = true;
                            break;
                        }
                        SseLine::Data(value) => value,
                    };

                    if let Some(error) = value.get("error") {
                        let message = error
                            .get("message")
                            .and_then(|m| m.as_str())
                            .unwrap_or("upstream reported an error")
                            .to_string();
                        Err(EngineError::Upstream(message))?;
                    }
                    if let Some(reported) = value.get("usage").filter(|u| u.is_object()) {
                        usage = serde_json::from_value(reported.clone()).ok();
                    }
                    let choice = &value["choices"][0];
                    if let Some(reason) = choice["finish_reason"].as_str() {
                        finish_reason = Some(reason.to_string());
                    }
                    if let Some(text) = choice["delta"]["content"].as_str() {
                        if !text.is_empty() {
                            yield ChatEvent::delta(text);
                        }
                    }
                }
                if done {
                    break;
                }
            }

            if !done && finish_reason.is_none() {
                Err(EngineError::Upstream("stream ended before completion".to_string()))?;
            }
            yield ChatEvent::finished(finish_reason.unwrap_or_else(|| "stop".to_string()), usage);
        })
    }
}

use std::collections::VecDeque;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use reqwest::Client;

use crate::config::Settings;
use crate::error::GenerationError;
use crate::models::{CompletionRequest, CompletionResponse, Message, StreamChunk};

pub type FragmentStream = BoxStream<'static, Result<String, GenerationError>>;

/// Prompt in, text out.
#[async_trait]
pub trait CompletionApi: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String, GenerationError>;

    /// Text fragments in production order, ending when the provider finishes.
    async fn complete_stream(&self, prompt: &str) -> Result<FragmentStream, GenerationError>;
}

/// Client for a LiteLLM (OpenAI-compatible) `/chat/completions` endpoint.
pub struct LiteLLMClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    timeout: Duration,
}

impl LiteLLMClient {
    pub fn new(base_url: String, api_key: Option<String>, model: String, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            model,
            timeout,
        })
    }

    pub fn from_settings(settings: &Settings) -> Result<Self> {
        Self::new(
            settings.litellm_url.clone(),
            settings.litellm_api_key.clone(),
            settings.llm_model.clone(),
            settings.http_timeout(),
        )
    }

    fn request_body(&self, prompt: &str, stream: bool) -> CompletionRequest {
        CompletionRequest {
            model: self.model.clone(),
            messages: vec![Message {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
            temperature: None,
            stream,
        }
    }

    async fn send(&self, body: &CompletionRequest) -> Result<reqwest::Response, GenerationError> {
        let url = format!("{}/chat/completions", self.base_url);

        let mut req = self.client.post(&url).json(body);
        if let Some(ref key) = self.api_key {
            req = req.bearer_auth(key);
        }
        // Streams may legitimately run longer than one request timeout.
        if !body.stream {
            req = req.timeout(self.timeout);
        }

        let response = req.send().await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(GenerationError::Status { status, body });
        }
        Ok(response)
    }

    pub async fn health_check(&self) -> Result<bool> {
        let url = format!("{}/health/liveliness", self.base_url);

        let response = self
            .client
            .get(&url)
            .timeout(Duration::from_secs(5))
            .send()
            .await?;

        Ok(response.status().is_success())
    }
}

#[async_trait]
impl CompletionApi for LiteLLMClient {
    async fn complete(&self, prompt: &str) -> Result<String, GenerationError> {
        let response = self.send(&self.request_body(prompt, false)).await?;
        let completion: CompletionResponse = response
            .json()
            .await
            .map_err(|e| GenerationError::Malformed(e.to_string()))?;

        completion
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| GenerationError::Malformed("response has no choices".to_string()))
    }

    async fn complete_stream(&self, prompt: &str) -> Result<FragmentStream, GenerationError> {
        let response = self.send(&self.request_body(prompt, true)).await?;
        Ok(fragment_stream(response.bytes_stream()))
    }
}

/// Turn an SSE byte stream of chat-completion chunks into text fragments.
pub fn fragment_stream<S, B, E>(bytes: S) -> FragmentStream
where
    S: futures::Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Into<GenerationError> + Send + 'static,
{
    struct State<S> {
        bytes: S,
        decoder: SseDecoder,
        pending: VecDeque<Result<String, GenerationError>>,
        finished: bool,
    }

    let state = State {
        bytes: Box::pin(bytes),
        decoder: SseDecoder::default(),
        pending: VecDeque::new(),
        finished: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.pending.pop_front() {
                return Some((item, state));
            }
            if state.finished {
                return None;
            }
            let frames = match state.bytes.next().await {
                Some(Ok(chunk)) => state.decoder.push(chunk.as_ref()),
                Some(Err(e)) => {
                    state.pending.push_back(Err(e.into()));
                    state.finished = true;
                    continue;
                }
                None => {
                    state.finished = true;
                    state.decoder.finish()
                }
            };
            for frame in frames {
                match frame {
                    SseFrame::Done => {
                        state.finished = true;
                        break;
                    }
                    SseFrame::Data(data) => match parse_delta(&data) {
                        Ok(Some(text)) => state.pending.push_back(Ok(text)),
                        Ok(None) => {}
                        Err(e) => {
                            state.pending.push_back(Err(e));
                            state.finished = true;
                            break;
                        }
                    },
                }
            }
        }
    })
    .boxed()
}

fn parse_delta(data: &str) -> Result<Option<String>, GenerationError> {
    let chunk: StreamChunk =
        serde_json::from_str(data).map_err(|e| GenerationError::Malformed(e.to_string()))?;
    Ok(chunk
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.delta.content)
        .filter(|text| !text.is_empty()))
}

#[derive(Debug, Clone, PartialEq)]
pub enum SseFrame {
    Data(String),
    Done,
}

/// Line-oriented `data:` decoder that tolerates frames split across reads.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn push(&mut self, bytes: &[u8]) -> Vec<SseFrame> {
        self.buffer.extend_from_slice(bytes);
        let mut frames = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(frame) = parse_line(&line) {
                frames.push(frame);
            }
        }
        frames
    }

    /// Flush a trailing line that arrived without a newline.
    pub fn finish(&mut self) -> Vec<SseFrame> {
        let line = std::mem::take(&mut self.buffer);
        parse_line(&line).into_iter().collect()
    }
}

fn parse_line(line: &[u8]) -> Option<SseFrame> {
    let line = String::from_utf8_lossy(line);
    let data = line.trim_end_matches(['\r', '\n']).strip_prefix("data:")?.trim_start();
    if data.is_empty() {
        return None;
    }
    if data == "[DONE]" {
        return Some(SseFrame::Done);
    }
    Some(SseFrame::Data(data.to_string()))
}

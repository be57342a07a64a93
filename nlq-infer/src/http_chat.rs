use std::fmt::Display;

use async_trait::async_trait;
use futures_core::Stream;
use futures_util::{stream, StreamExt};
use serde::{Deserialize, Serialize};

use crate::{CompletionRequest, LlmEngine, LlmError, LlmErrorKind, LlmToken, TokenStream};

#[derive(Serialize)]
struct OpenAIChatRequest {
    model: String,
    messages: Vec<OpenAIMessage>,
    temperature: f32,
    max_tokens: u32,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<u64>,
}

#[derive(Serialize, Deserialize, Clone)]
struct OpenAIMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct ChatCompletionChunk {
    #[serde(default)]
    choices: Vec<ChatChoiceDelta>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct ChatChoiceDelta {
    #[serde(default)]
    delta: Delta,
}

#[derive(Deserialize, Default)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
}

/// Chat-completions client for any OpenAI-compatible endpoint (vLLM, llama.cpp
/// server, hosted APIs). Replies are streamed over SSE and collected by
/// [`LlmEngine::complete`].
pub struct HttpChatEngine {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
    seed: Option<u64>,
}

impl HttpChatEngine {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            api_key: None,
            seed: None,
        }
    }

    pub fn with_api_key(mut self, key: Option<String>) -> Self {
        self.api_key = key;
        self
    }

    /// Fixed sampling seed, for servers that honour it.
    pub fn with_seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }
}

#[async_trait]
impl LlmEngine for HttpChatEngine {
    async fn generate(&self, req: CompletionRequest) -> Result<TokenStream, LlmError> {
        let url = format!("{}/chat/completions", self.base_url);

        let body = OpenAIChatRequest {
            model: self.model.clone(),
            messages: vec![
                OpenAIMessage {
                    role: "system".into(),
                    content: req.system,
                },
                OpenAIMessage {
                    role: "user".into(),
                    content: req.user,
                },
            ],
            temperature: req.temperature,
            max_tokens: req.max_tokens,
            stream: true,
            seed: self.seed,
        };

        let mut request = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let resp = request.send().await.map_err(|e| {
            let kind = if e.is_timeout() || e.is_connect() {
                LlmErrorKind::Transient
            } else {
                LlmErrorKind::Other
            };
            LlmError::new(kind, format!("HTTP error: {e}"))
        })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let err = LlmError::from_status(status.as_u16(), &body);
            tracing::warn!(status = status.as_u16(), kind = %err.kind, "model endpoint refused request");
            return Err(err);
        }

        Ok(Box::pin(sse_tokens(resp.bytes_stream())))
    }
}

/// Turn an SSE byte stream of chat-completion chunks into content tokens.
/// Events may be split across network chunks; partial lines are buffered.
pub fn sse_tokens<S, B, E>(body: S) -> impl Stream<Item = Result<LlmToken, LlmError>> + Send
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]>,
    E: Display,
{
    body.scan((String::new(), 0u32), |(buffer, next_id), chunk| {
        let out: Vec<Result<LlmToken, LlmError>> = match chunk {
            Ok(bytes) => {
                buffer.push_str(&String::from_utf8_lossy(bytes.as_ref()));
                let mut out = Vec::new();
                while let Some(pos) = buffer.find('\n') {
                    let line: String = buffer.drain(..=pos).collect();
                    match parse_sse_line(&line) {
                        Some(Ok(text)) => {
                            out.push(Ok(LlmToken {
                                token_id: *next_id,
                                text,
                            }));
                            *next_id += 1;
                        }
                        Some(Err(e)) => out.push(Err(e)),
                        None => {}
                    }
                }
                out
            }
            Err(e) => vec![Err(LlmError::new(LlmErrorKind::Transient, format!("stream error: {e}")))],
        };
        futures_util::future::ready(Some(stream::iter(out)))
    })
    .flatten()
}

/// One SSE line: `Some(Ok(text))` for content, `Some(Err)` for an in-band
/// error event, `None` for keep-alives, `[DONE]` and empty deltas.
pub fn parse_sse_line(line: &str) -> Option<Result<String, LlmError>> {
    let line = line.trim();
    let data = line.strip_prefix("data:")?.trim_start();
    if data.is_empty() || data == "[DONE]" {
        return None;
    }
    let chunk: ChatCompletionChunk = match serde_json::from_str(data) {
        Ok(chunk) => chunk,
        Err(e) => {
            tracing::debug!(error = %e, "ignoring unparseable SSE event");
            return None;
        }
    };
    if let Some(err) = chunk.error {
        let message = err
            .get("message")
            .and_then(|m| m.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| err.to_string());
        let kind = if message.to_lowercase().contains("quota") {
            LlmErrorKind::Quota
        } else {
            LlmErrorKind::Other
        };
        return Some(Err(LlmError::new(kind, message)));
    }
    let text: String = chunk
        .choices
        .into_iter()
        .filter_map(|c| c.delta.content)
        .collect();
    if text.is_empty() {
        None
    } else {
        Some(Ok(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_content_and_skips_control_lines() {
        let line = r#"data: {"choices":[{"index":0,"delta":{"content":"SELECT"}}]}"#;
        assert_eq!(parse_sse_line(line).unwrap().unwrap(), "SELECT");
        assert!(parse_sse_line("data: [DONE]").is_none());
        assert!(parse_sse_line(": keep-alive").is_none());
        assert!(parse_sse_line(r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#).is_none());
    }

    #[test]
    fn in_band_error_is_surfaced() {
        let line = r#"data: {"error":{"message":"You exceeded your current quota"}}"#;
        let err = parse_sse_line(line).unwrap().unwrap_err();
        assert_eq!(err.kind, LlmErrorKind::Quota);
    }

    #[tokio::test]
    async fn events_split_across_chunks_are_reassembled() {
        let chunks: Vec<Result<Vec<u8>, std::io::Error>> = vec![
            Ok(b"data: {\"choices\":[{\"delta\":{\"content\":\"SELECT \"}}]}\n\ndata: {\"choi".to_vec()),
            Ok(b"ces\":[{\"delta\":{\"content\":\"1\"}}]}\n\ndata: [DONE]\n\n".to_vec()),
        ];
        let tokens: Vec<_> = sse_tokens(stream::iter(chunks)).collect().await;
        let text: String = tokens.into_iter().map(|t| t.unwrap().text).collect();
        assert_eq!(text, "SELECT 1");
    }
}

use std::fmt;
use std::pin::Pin;

use async_trait::async_trait;
use futures_core::Stream;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod http_chat;
pub use http_chat::HttpChatEngine;

pub mod scripted;
pub use scripted::ScriptedLlmEngine;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub system: String,
    pub user: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LlmToken {
    pub token_id: u32,
    pub text: String,
}

pub type TokenStream = Pin<Box<dyn Stream<Item = Result<LlmToken, LlmError>> + Send>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmErrorKind {
    Auth,
    Quota,
    RateLimit,
    Transient,
    Other,
}

impl fmt::Display for LlmErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LlmErrorKind::Auth => "auth",
            LlmErrorKind::Quota => "quota",
            LlmErrorKind::RateLimit => "rate_limit",
            LlmErrorKind::Transient => "transient",
            LlmErrorKind::Other => "other",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("model call failed ({kind}): {message}")]
pub struct LlmError {
    pub kind: LlmErrorKind,
    pub message: String,
}

impl LlmError {
    pub fn new(kind: LlmErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Classify a non-success HTTP reply from an OpenAI-compatible endpoint.
    pub fn from_status(status: u16, body: &str) -> Self {
        let lower = body.to_lowercase();
        let kind = match status {
            401 | 403 => LlmErrorKind::Auth,
            402 => LlmErrorKind::Quota,
            429 if lower.contains("quota") || lower.contains("billing") => LlmErrorKind::Quota,
            429 => LlmErrorKind::RateLimit,
            408 | 500..=599 => LlmErrorKind::Transient,
            _ => LlmErrorKind::Other,
        };
        Self::new(kind, format!("HTTP {status}: {}", body.trim()))
    }
}

#[async_trait]
pub trait LlmEngine: Send + Sync {
    async fn generate(&self, req: CompletionRequest) -> Result<TokenStream, LlmError>;

    /// Collect the whole completion. The first stream error aborts it.
    async fn complete(&self, req: CompletionRequest) -> Result<String, LlmError> {
        let mut stream = self.generate(req).await?;
        let mut out = String::new();
        while let Some(token) = stream.next().await {
            out.push_str(&token?.text);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert_eq!(LlmError::from_status(401, "bad key").kind, LlmErrorKind::Auth);
        assert_eq!(
            LlmError::from_status(429, r#"{"error":{"code":"insufficient_quota"}}"#).kind,
            LlmErrorKind::Quota
        );
        assert_eq!(LlmError::from_status(429, "slow down").kind, LlmErrorKind::RateLimit);
        assert_eq!(LlmError::from_status(503, "").kind, LlmErrorKind::Transient);
        assert_eq!(LlmError::from_status(400, "bad request").kind, LlmErrorKind::Other);
    }

    #[tokio::test]
    async fn complete_joins_tokens() {
        let engine = ScriptedLlmEngine::new(vec![Ok("SELECT 1 FROM DUAL".to_string())]);
        let req = CompletionRequest {
            system: "s".into(),
            user: "u".into(),
            temperature: 0.0,
            max_tokens: 16,
        };
        assert_eq!(engine.complete(req).await.unwrap(), "SELECT 1 FROM DUAL");
    }
}

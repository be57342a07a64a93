use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use futures_util::stream;

use crate::{CompletionRequest, LlmEngine, LlmError, LlmErrorKind, LlmToken, TokenStream};

/// Replays canned replies in order and records every request it receives.
pub struct ScriptedLlmEngine {
    replies: Mutex<VecDeque<Result<String, LlmError>>>,
    seen: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedLlmEngine {
    pub fn new(replies: Vec<Result<String, LlmError>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn reply(text: impl Into<String>) -> Self {
        Self::new(vec![Ok(text.into())])
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.seen.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl LlmEngine for ScriptedLlmEngine {
    async fn generate(&self, req: CompletionRequest) -> Result<TokenStream, LlmError> {
        if let Ok(mut seen) = self.seen.lock() {
            seen.push(req);
        }
        let next = self
            .replies
            .lock()
            .ok()
            .and_then(|mut r| r.pop_front())
            .unwrap_or_else(|| Err(LlmError::new(LlmErrorKind::Other, "script exhausted")))?;

        // Whitespace-delimited tokens, separators kept, so joins are lossless.
        let tokens: Vec<Result<LlmToken, LlmError>> = next
            .split_inclusive(char::is_whitespace)
            .enumerate()
            .map(|(i, piece)| {
                Ok(LlmToken {
                    token_id: i as u32,
                    text: piece.to_string(),
                })
            })
            .collect();
        Ok(Box::pin(stream::iter(tokens)))
    }
}

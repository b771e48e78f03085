//! Scripted backend for tests and offline dry runs
//!
//! Replies are consumed in order; once the script runs out the last reply
//! repeats. Every invocation is recorded so tests can assert call counts
//! and prompt contents.

use super::traits::{Backend, BackendError};
use async_trait::async_trait;
use std::sync::Mutex;

/// One scripted reply.
#[derive(Debug, Clone)]
pub enum MockReply {
    Text(String),
    Error(BackendError),
}

pub struct MockBackend {
    script: Mutex<Vec<MockReply>>,
    prompts: Mutex<Vec<String>>,
}

impl MockBackend {
    /// A backend that plays `replies` in order.
    pub fn scripted(replies: Vec<MockReply>) -> Self {
        Self {
            script: Mutex::new(replies),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// A backend that always answers with `text`.
    pub fn replying(text: impl Into<String>) -> Self {
        Self::scripted(vec![MockReply::Text(text.into())])
    }

    /// A backend that always fails with `message`.
    pub fn failing(message: impl Into<String>) -> Self {
        Self::scripted(vec![MockReply::Error(BackendError::Failed(message.into()))])
    }

    /// Number of times `invoke` was called.
    pub fn calls(&self) -> usize {
        self.prompts.lock().map(|p| p.len()).unwrap_or(0)
    }

    /// Prompts received so far, in order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().map(|p| p.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Backend for MockBackend {
    async fn invoke(&self, prompt: &str) -> Result<String, BackendError> {
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(prompt.to_string());
        }

        let reply = {
            let mut script = self
                .script
                .lock()
                .map_err(|_| BackendError::Unavailable("mock script poisoned".to_string()))?;
            match script.len() {
                0 => None,
                1 => script.first().cloned(),
                _ => Some(script.remove(0)),
            }
        };

        match reply {
            Some(MockReply::Text(text)) => Ok(text),
            Some(MockReply::Error(err)) => Err(err),
            None => Err(BackendError::Unavailable(
                "mock backend has no scripted reply".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_replies_play_in_order_then_repeat() {
        let backend = MockBackend::scripted(vec![
            MockReply::Error(BackendError::Failed("first".to_string())),
            MockReply::Text("second".to_string()),
        ]);

        assert!(backend.invoke("p1").await.is_err());
        assert_eq!(backend.invoke("p2").await.unwrap(), "second");
        assert_eq!(backend.invoke("p3").await.unwrap(), "second");
        assert_eq!(backend.calls(), 3);
        assert_eq!(backend.prompts()[1], "p2");
    }

    #[tokio::test]
    async fn empty_script_is_unavailable() {
        let backend = MockBackend::scripted(Vec::new());
        let err = backend.invoke("p").await.unwrap_err();
        assert!(matches!(err, BackendError::Unavailable(_)));
    }
}

//! Backend trait and descriptor

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

/// Errors from a single backend invocation.
///
/// The display string carries the backend's own message so the dispatcher
/// can recognise quota exhaustion from it.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BackendError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("backend timed out after {seconds}s")]
    Timeout { seconds: u64 },
    #[error("backend failed: {0}")]
    Failed(String),
}

/// A generative text backend.
///
/// Implemented once per concrete service. Each implementation owns its
/// authentication, timeout and raw error formatting.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Send a prompt and return the raw response text.
    async fn invoke(&self, prompt: &str) -> Result<String, BackendError>;
}

/// A named backend with its position in the fallback chain.
///
/// Lower priority values are tried first.
#[derive(Clone)]
pub struct BackendDescriptor {
    pub name: String,
    pub priority: u32,
    backend: Arc<dyn Backend>,
}

impl BackendDescriptor {
    pub fn new(name: impl Into<String>, priority: u32, backend: Arc<dyn Backend>) -> Self {
        Self {
            name: name.into(),
            priority,
            backend,
        }
    }

    pub async fn invoke(&self, prompt: &str) -> Result<String, BackendError> {
        self.backend.invoke(prompt).await
    }

    /// Sort descriptors by ascending priority; ties keep their given order.
    pub fn ordered(mut descriptors: Vec<Self>) -> Vec<Self> {
        descriptors.sort_by_key(|d| d.priority);
        descriptors
    }
}

impl fmt::Debug for BackendDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendDescriptor")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .finish()
    }
}

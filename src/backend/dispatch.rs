//! Backend chain dispatcher
//!
//! Tries backends in ascending priority, each at most once per call. A
//! failure whose message reads as quota or rate-limit exhaustion ends the
//! chain immediately when the caller asks for it; any other failure falls
//! through to the next backend.

use super::traits::BackendDescriptor;
use regex_lite::Regex;
use thiserror::Error;
use tracing::{debug, warn};

/// Patterns recognised as caller-wide quota or rate-limit exhaustion.
pub const DEFAULT_QUOTA_PATTERNS: &[&str] = &[
    r"(?i)quota",
    r"(?i)rate[ _-]?limit",
    r"(?i)resource[ _]exhausted",
    r"(?i)too many requests",
    r"\b429\b",
    r"(?i)usage limit",
];

/// One failed backend attempt within a dispatch call.
#[derive(Debug, Clone, PartialEq)]
pub struct FailedAttempt {
    pub backend: String,
    pub message: String,
    pub quota: bool,
}

#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    #[error("no backends configured")]
    NoBackends,

    #[error("quota exhausted on backend '{backend}': {message}")]
    Quota { backend: String, message: String },

    #[error("all {} backend(s) failed; last: {}", .attempts.len(), last_failure(.attempts))]
    Exhausted { attempts: Vec<FailedAttempt> },
}

fn last_failure(attempts: &[FailedAttempt]) -> String {
    attempts
        .last()
        .map(|a| format!("{}: {}", a.backend, a.message))
        .unwrap_or_else(|| "none".to_string())
}

impl DispatchError {
    /// Whether this error must abort the whole run.
    pub fn is_quota(&self) -> bool {
        matches!(self, Self::Quota { .. })
    }
}

/// Options for a single dispatch call
#[derive(Debug, Clone, Copy)]
pub struct DispatchOptions {
    /// Abort the chain on the first quota error instead of falling through
    pub stop_on_quota: bool,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            stop_on_quota: true,
        }
    }
}

/// Text produced by a backend, and which backend produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct Dispatched {
    pub text: String,
    pub backend: String,
}

/// Classifies backend error messages as quota exhaustion.
#[derive(Debug, Clone)]
pub struct QuotaClassifier {
    patterns: Vec<Regex>,
}

impl QuotaClassifier {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self, regex_lite::Error> {
        let patterns = patterns
            .iter()
            .map(|p| Regex::new(p.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    pub fn is_quota(&self, message: &str) -> bool {
        self.patterns.iter().any(|p| p.is_match(message))
    }
}

impl Default for QuotaClassifier {
    fn default() -> Self {
        let patterns = DEFAULT_QUOTA_PATTERNS
            .iter()
            .filter_map(|p| Regex::new(p).ok())
            .collect();
        Self { patterns }
    }
}

/// Drives an ordered chain of backends for one prompt.
#[derive(Debug, Clone, Default)]
pub struct Dispatcher {
    classifier: QuotaClassifier,
}

impl Dispatcher {
    pub fn new(classifier: QuotaClassifier) -> Self {
        Self { classifier }
    }

    pub async fn dispatch(
        &self,
        prompt: &str,
        backends: &[BackendDescriptor],
        opts: DispatchOptions,
    ) -> Result<Dispatched, DispatchError> {
        if backends.is_empty() {
            return Err(DispatchError::NoBackends);
        }

        let mut chain: Vec<&BackendDescriptor> = backends.iter().collect();
        chain.sort_by_key(|d| d.priority);

        let mut attempts = Vec::new();
        for descriptor in chain {
            debug!(backend = %descriptor.name, prompt_len = prompt.len(), "dispatching");
            match descriptor.invoke(prompt).await {
                Ok(text) => {
                    return Ok(Dispatched {
                        text,
                        backend: descriptor.name.clone(),
                    })
                }
                Err(e) => {
                    let message = e.to_string();
                    let quota = self.classifier.is_quota(&message);
                    if quota && opts.stop_on_quota {
                        warn!(backend = %descriptor.name, error = %message, "quota exhausted, stopping chain");
                        return Err(DispatchError::Quota {
                            backend: descriptor.name.clone(),
                            message,
                        });
                    }
                    warn!(backend = %descriptor.name, error = %message, quota, "backend failed, falling through");
                    attempts.push(FailedAttempt {
                        backend: descriptor.name.clone(),
                        message,
                        quota,
                    });
                }
            }
        }

        Err(DispatchError::Exhausted { attempts })
    }
}

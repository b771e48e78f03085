//! Bounded repair of malformed backend output
//!
//! The broken text is sent back through the dispatcher with a fixed
//! instruction and the expected schema, and the reply is parsed again. The
//! number of attempts is an explicit parameter (default one); there is no
//! recursion.

use super::json::ExtractionError;
use super::payload::{parse_candidates, PAYLOAD_SCHEMA};
use crate::backend::{BackendDescriptor, DispatchError, DispatchOptions, Dispatcher};
use crate::model::MatchCandidate;
use thiserror::Error;
use tracing::{info, warn};

pub const REPAIR_INSTRUCTION: &str = "The text below was supposed to be a single JSON document \
but it is malformed or incomplete. Rewrite it as valid JSON matching exactly this schema. \
Keep every match that can be recovered, invent nothing, and reply with the JSON only, \
inside a ```json fenced block.";

#[derive(Debug, Error)]
pub enum RepairError {
    #[error("repair dispatch failed: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("repaired output is still malformed: {0}")]
    StillMalformed(ExtractionError),
}

impl RepairError {
    pub fn is_quota(&self) -> bool {
        matches!(self, Self::Dispatch(e) if e.is_quota())
    }
}

pub struct Repairer<'a> {
    dispatcher: &'a Dispatcher,
    attempts: usize,
    options: DispatchOptions,
}

impl<'a> Repairer<'a> {
    /// A repairer making a single attempt.
    pub fn new(dispatcher: &'a Dispatcher) -> Self {
        Self {
            dispatcher,
            attempts: 1,
            options: DispatchOptions::default(),
        }
    }

    /// Dispatch options for repair calls, normally the run's own.
    pub fn with_options(mut self, options: DispatchOptions) -> Self {
        self.options = options;
        self
    }

    /// Set the attempt bound. Zero is treated as one.
    pub fn with_attempts(mut self, attempts: usize) -> Self {
        self.attempts = attempts.max(1);
        self
    }

    fn repair_prompt(broken: &str) -> String {
        format!(
            "{}\n\nSchema:\n{}\n\nMalformed text:\n{}",
            REPAIR_INSTRUCTION, PAYLOAD_SCHEMA, broken
        )
    }

    /// Ask a backend to rewrite `broken` into the match schema and parse the reply.
    ///
    /// Dispatch errors end the repair at once. With `stop_on_quota` set, a
    /// quota error among them must abort the run.
    pub async fn repair(
        &self,
        broken: &str,
        backends: &[BackendDescriptor],
    ) -> Result<Vec<MatchCandidate>, RepairError> {
        let prompt = Self::repair_prompt(broken);

        let mut last_error = None;
        for attempt in 1..=self.attempts {
            let reply = self.dispatcher.dispatch(&prompt, backends, self.options).await?;
            match parse_candidates(&reply.text) {
                Ok(candidates) => {
                    info!(backend = %reply.backend, attempt, matches = candidates.len(), "repair succeeded");
                    return Ok(candidates);
                }
                Err(e) => {
                    warn!(backend = %reply.backend, attempt, error = %e, "repair output still malformed");
                    last_error = Some(e);
                }
            }
        }

        Err(RepairError::StillMalformed(
            last_error.unwrap_or(ExtractionError::NoStructuredData),
        ))
    }
}

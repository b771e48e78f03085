//! Generative backends and the chain dispatcher that drives them
//!
//! A backend is anything that turns a prompt into free text. The dispatcher
//! walks an ordered, immutable list of descriptors built once at startup.

mod command;
mod dispatch;
mod mock;
mod traits;

pub use command::{CommandBackend, CommandBackendConfig};
pub use dispatch::{
    DispatchError, DispatchOptions, Dispatched, Dispatcher, FailedAttempt, QuotaClassifier,
    DEFAULT_QUOTA_PATTERNS,
};
pub use mock::{MockBackend, MockReply};
pub use traits::{Backend, BackendDescriptor, BackendError};

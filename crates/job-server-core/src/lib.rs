mod error;
mod handler;
mod job;

pub use error::{JobError, Result};
pub use handler::{HandlerId, HandlerRecord};
pub use job::{Job, JobId, JobStatus, NewJob, ParseStatusError, RetryDecision};

/// Smallest accepted `max_attempts` value
pub const MIN_ATTEMPTS: u32 = 1;

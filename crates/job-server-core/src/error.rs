use crate::{HandlerId, JobId, JobStatus};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JobError {
    #[error("Invalid handler '{0}'")]
    InvalidHandler(String),

    #[error("max_attempts must be at least {min} (got {actual})")]
    InvalidMaxAttempts { min: u32, actual: u32 },

    #[error("Job with id {0} not found")]
    JobNotFound(JobId),

    #[error("Handler with id {0} not found")]
    HandlerNotFound(HandlerId),

    #[error("Job in invalid state: cannot move from {from} to {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    #[error("Attempt budget exhausted ({attempts}/{max_attempts})")]
    AttemptsExhausted { attempts: u32, max_attempts: u32 },

    #[error("Handler execution failed: {0}")]
    HandlerExecutionFailure(String),

    #[error("Persistence failure: {0}")]
    PersistenceFailure(String),

    #[error("Handler registration failed: {0}")]
    RegistrationFailure(String),
}

impl JobError {
    /// True for errors caused by a missing job or handler record
    pub fn is_not_found(&self) -> bool {
        matches!(self, JobError::JobNotFound(_) | JobError::HandlerNotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, JobError>;

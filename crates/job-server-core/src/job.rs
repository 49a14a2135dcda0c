use crate::{JobError, Result, MIN_ATTEMPTS};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Unique identifier for a job, assigned by the store
pub type JobId = i64;

/// Job status in the execution lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Eligible for dispatch
    Ready,
    /// Handler currently in flight
    Running,
    /// Last attempt failed, waiting for the cooldown before the next one
    Timeout,
    /// Handler returned success
    Succeeded,
    /// Attempt budget exhausted (or cancelled)
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Ready => "READY",
            JobStatus::Running => "RUNNING",
            JobStatus::Timeout => "TIMEOUT",
            JobStatus::Succeeded => "SUCCEEDED",
            JobStatus::Failed => "FAILED",
        }
    }

    /// Terminal jobs are never dispatched again
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }

    /// Edges of the execution state machine
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Ready, JobStatus::Running)
                | (JobStatus::Running, JobStatus::Succeeded)
                | (JobStatus::Running, JobStatus::Timeout)
                | (JobStatus::Running, JobStatus::Failed)
                | (JobStatus::Timeout, JobStatus::Ready)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown job status '{0}'")]
pub struct ParseStatusError(pub String);

impl FromStr for JobStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "READY" => Ok(JobStatus::Ready),
            "RUNNING" => Ok(JobStatus::Running),
            "TIMEOUT" => Ok(JobStatus::Timeout),
            "SUCCEEDED" => Ok(JobStatus::Succeeded),
            "FAILED" => Ok(JobStatus::Failed),
            _ => Err(ParseStatusError(s.to_string())),
        }
    }
}

/// What the coordinator should do after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Budget left: the job is in TIMEOUT and goes back to the queue after the cooldown
    Retry,
    /// Budget exhausted: the job is FAILED
    GiveUp,
}

/// A validated job submission that has not been stored yet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewJob {
    pub handler: String,
    pub max_attempts: u32,
}

impl NewJob {
    pub fn new(handler: impl Into<String>, max_attempts: u32) -> Result<Self> {
        if max_attempts < MIN_ATTEMPTS {
            return Err(JobError::InvalidMaxAttempts {
                min: MIN_ATTEMPTS,
                actual: max_attempts,
            });
        }

        Ok(NewJob {
            handler: handler.into(),
            max_attempts,
        })
    }

    /// Materialize the job once the store picked an id
    pub fn into_job(self, id: JobId) -> Job {
        let now = Utc::now();
        Job {
            id,
            handler: self.handler,
            status: JobStatus::Ready,
            attempts: 0,
            max_attempts: self.max_attempts,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A unit of work tracked through the execution state machine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    /// Store-assigned identifier, never 0 once persisted
    pub id: JobId,

    /// Name of the registered handler that runs this job
    pub handler: String,

    pub status: JobStatus,

    /// Number of dispatches so far
    pub attempts: u32,

    /// Ceiling on dispatches
    pub max_attempts: u32,

    /// Last failure reason
    pub error: Option<String>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Check if another attempt fits in the budget
    pub fn has_attempts_left(&self) -> bool {
        self.attempts < self.max_attempts
    }

    /// READY -> RUNNING. Counts the attempt.
    pub fn start_attempt(&mut self) -> Result<()> {
        self.check_transition(JobStatus::Running)?;
        if !self.has_attempts_left() {
            return Err(JobError::AttemptsExhausted {
                attempts: self.attempts,
                max_attempts: self.max_attempts,
            });
        }

        self.attempts += 1;
        self.set_status(JobStatus::Running);
        Ok(())
    }

    /// RUNNING -> SUCCEEDED
    pub fn succeed(&mut self) -> Result<()> {
        self.check_transition(JobStatus::Succeeded)?;
        self.set_status(JobStatus::Succeeded);
        Ok(())
    }

    /// RUNNING -> TIMEOUT or FAILED depending on the remaining budget.
    ///
    /// The attempt was already counted on dispatch, so the comparison uses
    /// the post-increment value: a job gets exactly `max_attempts` runs.
    pub fn record_failure(&mut self, reason: impl Into<String>) -> Result<RetryDecision> {
        if self.status != JobStatus::Running {
            return Err(JobError::InvalidTransition {
                from: self.status,
                to: JobStatus::Failed,
            });
        }

        self.error = Some(reason.into());
        if self.attempts >= self.max_attempts {
            self.set_status(JobStatus::Failed);
            Ok(RetryDecision::GiveUp)
        } else {
            self.set_status(JobStatus::Timeout);
            Ok(RetryDecision::Retry)
        }
    }

    /// TIMEOUT -> READY once the cooldown elapsed
    pub fn make_ready(&mut self) -> Result<()> {
        self.check_transition(JobStatus::Ready)?;
        self.set_status(JobStatus::Ready);
        Ok(())
    }

    /// Force a non-terminal job into FAILED from outside the engine
    pub fn cancel(&mut self, reason: impl Into<String>) -> Result<()> {
        self.force_fail(reason.into())
    }

    /// READY or TIMEOUT -> FAILED when an edit left no room for another dispatch
    pub fn exhaust(&mut self) -> Result<()> {
        if self.status == JobStatus::Running || self.has_attempts_left() {
            return Err(JobError::InvalidTransition {
                from: self.status,
                to: JobStatus::Failed,
            });
        }

        let reason = JobError::AttemptsExhausted {
            attempts: self.attempts,
            max_attempts: self.max_attempts,
        };
        self.force_fail(reason.to_string())
    }

    /// Bring a job interrupted by a restart back to READY.
    ///
    /// A RUNNING job already had its attempt counted; if that used up the
    /// budget it is failed instead. Returns true when the job should be
    /// enqueued.
    pub fn recover(&mut self) -> bool {
        match self.status {
            JobStatus::Ready => true,
            JobStatus::Running | JobStatus::Timeout => {
                if self.has_attempts_left() {
                    self.set_status(JobStatus::Ready);
                    true
                } else {
                    self.error
                        .get_or_insert_with(|| "interrupted by server restart".to_string());
                    self.set_status(JobStatus::Failed);
                    false
                }
            }
            JobStatus::Succeeded | JobStatus::Failed => false,
        }
    }

    fn force_fail(&mut self, reason: String) -> Result<()> {
        if self.is_terminal() {
            return Err(JobError::InvalidTransition {
                from: self.status,
                to: JobStatus::Failed,
            });
        }

        self.error = Some(reason);
        self.set_status(JobStatus::Failed);
        Ok(())
    }

    fn check_transition(&self, to: JobStatus) -> Result<()> {
        if self.status.can_transition_to(to) {
            Ok(())
        } else {
            Err(JobError::InvalidTransition {
                from: self.status,
                to,
            })
        }
    }

    fn set_status(&mut self, status: JobStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }
}

use async_trait::async_trait;
use job_server_core::Job;
use rand::Rng;
use std::time::Duration;
use tracing::info;

/// Result type for job handlers: `Err` carries the failure reason
pub type HandlerResult = Result<(), String>;

/// Trait for job handlers
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Run the job once
    async fn handle(&self, job: &Job) -> HandlerResult;
}

/// Adapter turning a plain function into a handler
pub struct FnHandler<F>(F);

/// Wrap a synchronous function or closure as a [`JobHandler`]
pub fn handler_fn<F>(f: F) -> FnHandler<F>
where
    F: Fn(&Job) -> HandlerResult + Send + Sync,
{
    FnHandler(f)
}

#[async_trait]
impl<F> JobHandler for FnHandler<F>
where
    F: Fn(&Job) -> HandlerResult + Send + Sync,
{
    async fn handle(&self, job: &Job) -> HandlerResult {
        (self.0)(job)
    }
}

/// Example handler that simulates slow, occasionally failing work
pub struct DummyHandler {
    duration: Duration,
    failure_rate: f64,
}

impl DummyHandler {
    pub fn new(duration: Duration, failure_rate: f64) -> Self {
        DummyHandler {
            duration,
            failure_rate: failure_rate.clamp(0.0, 1.0),
        }
    }
}

impl Default for DummyHandler {
    fn default() -> Self {
        DummyHandler::new(Duration::from_secs(10), 0.1)
    }
}

#[async_trait]
impl JobHandler for DummyHandler {
    async fn handle(&self, job: &Job) -> HandlerResult {
        info!(job_id = job.id, "Starting dummy job");
        tokio::time::sleep(self.duration).await;

        if rand::thread_rng().gen_bool(self.failure_rate) {
            info!(job_id = job.id, "Dummy job failed");
            return Err(format!("Job {} failed", job.id));
        }

        info!(job_id = job.id, "Dummy job succeeded");
        Ok(())
    }
}

/// Handler that always succeeds
pub struct AlwaysSucceed;

#[async_trait]
impl JobHandler for AlwaysSucceed {
    async fn handle(&self, _job: &Job) -> HandlerResult {
        Ok(())
    }
}

/// Handler that always fails
pub struct AlwaysFail;

#[async_trait]
impl JobHandler for AlwaysFail {
    async fn handle(&self, job: &Job) -> HandlerResult {
        Err(format!("job {} failed on attempt {}", job.id, job.attempts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use job_server_core::NewJob;

    fn job() -> Job {
        NewJob::new("test", 1).unwrap().into_job(5)
    }

    #[tokio::test]
    async fn test_fn_handler() {
        let handler = handler_fn(|job: &Job| {
            if job.id == 5 {
                Ok(())
            } else {
                Err("wrong job".to_string())
            }
        });
        assert!(handler.handle(&job()).await.is_ok());
    }

    #[tokio::test]
    async fn test_fixed_outcome_handlers() {
        assert!(AlwaysSucceed.handle(&job()).await.is_ok());
        let err = AlwaysFail.handle(&job()).await.unwrap_err();
        assert!(err.contains("job 5"));
    }

    #[tokio::test]
    async fn test_dummy_handler_extremes() {
        let never_fails = DummyHandler::new(Duration::from_millis(1), 0.0);
        assert!(never_fails.handle(&job()).await.is_ok());

        let always_fails = DummyHandler::new(Duration::from_millis(1), 1.0);
        assert_eq!(always_fails.handle(&job()).await, Err("Job 5 failed".to_string()));
    }
}

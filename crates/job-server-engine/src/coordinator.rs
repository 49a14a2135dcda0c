use crate::{metrics::EngineMetrics, queue::DispatchQueue};
use job_server_core::{Job, JobError, JobStatus, RetryDecision};
use job_server_persistence::{JobEdit, JobStore, PersistenceError};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Error stored on jobs cancelled from outside the engine
pub const CANCELLED_REASON: &str = "cancelled by request";

/// Result of one dispatch attempt, consumed exactly once by the coordinator
#[derive(Debug)]
pub struct ExecutionOutcome {
    pub job: Job,
    pub result: Result<(), JobError>,
}

impl ExecutionOutcome {
    pub fn success(job: Job) -> Self {
        ExecutionOutcome { job, result: Ok(()) }
    }

    pub fn failure(job: Job, error: JobError) -> Self {
        ExecutionOutcome {
            job,
            result: Err(error),
        }
    }
}

/// What the coordinator did with an outcome
#[derive(Debug)]
pub enum Resolution {
    Succeeded,
    Failed,
    /// Cooldown running; the handle completes once the job is back in the queue
    RetryScheduled(JoinHandle<()>),
    /// Outcome for a job that was not RUNNING, or that finished elsewhere; nothing changed
    Ignored,
}

/// Applies outcomes to the job state machine, persists every transition and
/// re-enqueues retries after the cooldown.
///
/// Store failures are logged and counted but never undo a transition or stop
/// the retry decision. A stored record that already reached a terminal state
/// (a cancellation) always wins over the engine's copy.
#[derive(Clone)]
pub struct Coordinator {
    store: Arc<dyn JobStore>,
    queue: DispatchQueue,
    metrics: Arc<EngineMetrics>,
    cooldown: Duration,
}

impl Coordinator {
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: DispatchQueue,
        metrics: Arc<EngineMetrics>,
        cooldown: Duration,
    ) -> Self {
        Coordinator {
            store,
            queue,
            metrics,
            cooldown,
        }
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// READY -> RUNNING for a job just taken off the queue.
    ///
    /// Returns `None` when the job must not run: it finished in the meantime,
    /// or an edit left it without budget, in which case it is failed here.
    pub async fn start_attempt(&self, mut job: Job) -> Option<Job> {
        let job_id = job.id;

        if !self.refresh(&mut job).await {
            info!(job_id, "Skipping finished job");
            return None;
        }

        let mut running = job.clone();
        match running.start_attempt() {
            Ok(()) => {}
            Err(JobError::AttemptsExhausted { .. }) => {
                self.exhaust(job).await;
                return None;
            }
            Err(e) => {
                error!(job_id, "Cannot start job: {}", e);
                return None;
            }
        }

        match self.persist(&running).await {
            Ok(()) => Some(running),
            Err(JobError::AttemptsExhausted { .. }) => {
                // Budget lowered between the refresh and the write
                if self.refresh(&mut job).await {
                    self.exhaust(job).await;
                }
                None
            }
            Err(e) => {
                info!(job_id, "Skipping job: {}", e);
                None
            }
        }
    }

    /// Apply one outcome
    pub async fn process(&self, outcome: ExecutionOutcome) -> Resolution {
        let ExecutionOutcome { mut job, result } = outcome;

        if job.status != JobStatus::Running {
            warn!(
                job_id = job.id,
                status = %job.status,
                "Ignoring outcome for job that is not running"
            );
            return Resolution::Ignored;
        }

        if !self.refresh(&mut job).await {
            info!(job_id = job.id, "Job finished while running, dropping outcome");
            return Resolution::Ignored;
        }

        match result {
            Ok(()) => {
                if let Err(e) = job.succeed() {
                    error!(job_id = job.id, "Cannot mark job succeeded: {}", e);
                    return Resolution::Ignored;
                }
                if let Err(e) = self.persist(&job).await {
                    return dropped(&job, e);
                }
                self.metrics.inc_finished(job.status.as_str(), &job.handler);

                info!(job_id = job.id, attempts = job.attempts, "Job succeeded");
                Resolution::Succeeded
            }
            Err(err) => {
                let reason = match err {
                    JobError::HandlerExecutionFailure(reason) => reason,
                    other => other.to_string(),
                };

                match job.record_failure(reason) {
                    Ok(RetryDecision::GiveUp) => {
                        if let Err(e) = self.persist(&job).await {
                            return dropped(&job, e);
                        }
                        self.metrics.inc_finished(job.status.as_str(), &job.handler);

                        warn!(
                            job_id = job.id,
                            attempts = job.attempts,
                            error = job.error.as_deref().unwrap_or_default(),
                            "Job failed, attempt budget exhausted"
                        );
                        Resolution::Failed
                    }
                    Ok(RetryDecision::Retry) => {
                        if let Err(e) = self.persist(&job).await {
                            return dropped(&job, e);
                        }
                        self.metrics.job_retries.inc();

                        info!(
                            job_id = job.id,
                            attempts = job.attempts,
                            max_attempts = job.max_attempts,
                            "Job failed, retrying after {:?}",
                            self.cooldown
                        );
                        Resolution::RetryScheduled(self.schedule_retry(job))
                    }
                    Err(e) => {
                        error!(job_id = job.id, "Cannot record job failure: {}", e);
                        Resolution::Ignored
                    }
                }
            }
        }
    }

    /// Timer continuation: TIMEOUT -> READY after the cooldown, then back on the queue
    fn schedule_retry(&self, mut job: Job) -> JoinHandle<()> {
        let coordinator = self.clone();

        tokio::spawn(async move {
            tokio::time::sleep(coordinator.cooldown).await;

            if !coordinator.refresh(&mut job).await {
                info!(job_id = job.id, "Job finished during cooldown");
                return;
            }
            if !job.has_attempts_left() {
                coordinator.exhaust(job).await;
                return;
            }
            if let Err(e) = job.make_ready() {
                error!(job_id = job.id, "Cannot make job ready: {}", e);
                return;
            }
            if let Err(e) = coordinator.persist(&job).await {
                info!(job_id = job.id, "Not re-enqueueing job: {}", e);
                return;
            }

            let job_id = job.id;
            match coordinator.queue.enqueue(job) {
                Ok(()) => debug!(job_id, "Job re-enqueued"),
                Err(e) => warn!(job_id, "Could not re-enqueue job: {}", e),
            }
        })
    }

    /// FAILED for a job whose budget was lowered to the attempts already made
    async fn exhaust(&self, mut job: Job) {
        if let Err(e) = job.exhaust() {
            error!(job_id = job.id, "Cannot fail job: {}", e);
            return;
        }
        if self.persist(&job).await.is_ok() {
            self.metrics.inc_finished(job.status.as_str(), &job.handler);
            warn!(
                job_id = job.id,
                attempts = job.attempts,
                max_attempts = job.max_attempts,
                "Job failed, budget edited down to the attempts already made"
            );
        }
    }

    /// Pull external edits (handler, max_attempts) into the engine's copy.
    ///
    /// Returns false when the stored job already reached a terminal state.
    /// A failed read keeps the local copy.
    pub async fn refresh(&self, job: &mut Job) -> bool {
        match self.store.get_job(job.id).await {
            Ok(Some(stored)) if stored.is_terminal() => false,
            Ok(Some(stored)) => {
                job.handler = stored.handler;
                job.max_attempts = stored.max_attempts;
                true
            }
            Ok(None) => true,
            Err(e) => {
                warn!(job_id = job.id, "Could not refresh job from store: {}", e);
                true
            }
        }
    }

    /// Write the engine-owned fields of `job` to the stored record.
    ///
    /// Returns the refusal when the stored record does not accept the write;
    /// store failures are logged and counted and return `Ok`.
    pub async fn persist(&self, job: &Job) -> Result<(), JobError> {
        let engine_copy = job.clone();
        let write: JobEdit =
            Box::new(move |stored: &mut Job| write_engine_fields(stored, &engine_copy));

        match self.store.modify_job(job.id, write).await {
            Ok(_) => Ok(()),
            Err(PersistenceError::JobError(refused)) => Err(refused),
            Err(e) => {
                self.metrics.persistence_failures.inc();
                error!(
                    job_id = job.id,
                    status = %job.status,
                    "Error updating job in store: {}",
                    e
                );
                Ok(())
            }
        }
    }
}

/// The engine owns status, attempts and error; handler and max_attempts
/// belong to external edits. Terminal records are final.
fn write_engine_fields(stored: &mut Job, job: &Job) -> Result<(), JobError> {
    if stored.is_terminal() {
        return Err(JobError::InvalidTransition {
            from: stored.status,
            to: job.status,
        });
    }
    if job.attempts > stored.attempts && job.attempts > stored.max_attempts {
        return Err(JobError::AttemptsExhausted {
            attempts: stored.attempts,
            max_attempts: stored.max_attempts,
        });
    }

    stored.status = job.status;
    stored.attempts = job.attempts;
    stored.error = job.error.clone();
    stored.updated_at = job.updated_at;
    Ok(())
}

fn dropped(job: &Job, reason: JobError) -> Resolution {
    info!(job_id = job.id, "Dropping outcome: {}", reason);
    Resolution::Ignored
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::DispatchReceiver;
    use job_server_core::NewJob;
    use job_server_persistence::InMemoryStore;

    async fn setup(cooldown_ms: u64) -> (Coordinator, DispatchReceiver, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        let (queue, receiver) = DispatchQueue::unbounded();
        let metrics = Arc::new(EngineMetrics::new().unwrap());
        let coordinator = Coordinator::new(
            store.clone(),
            queue,
            metrics,
            Duration::from_millis(cooldown_ms),
        );
        (coordinator, receiver, store)
    }

    async fn running_job(store: &InMemoryStore, max_attempts: u32) -> Job {
        let mut job = store
            .create_job(NewJob::new("dummy", max_attempts).unwrap())
            .await
            .unwrap();
        job.start_attempt().unwrap();
        job
    }

    #[tokio::test]
    async fn test_success_is_terminal() {
        let (coordinator, mut receiver, store) = setup(10).await;
        let job = running_job(&store, 3).await;
        let id = job.id;

        let resolution = coordinator.process(ExecutionOutcome::success(job)).await;
        assert!(matches!(resolution, Resolution::Succeeded));

        let stored = store.get_job(id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Succeeded);
        assert!(receiver.try_dequeue().is_none());
    }

    #[tokio::test]
    async fn test_failure_with_budget_is_requeued_after_cooldown() {
        let (coordinator, mut receiver, store) = setup(20).await;
        let job = running_job(&store, 2).await;
        let id = job.id;

        let outcome = ExecutionOutcome::failure(
            job,
            JobError::HandlerExecutionFailure("boom".to_string()),
        );
        let handle = match coordinator.process(outcome).await {
            Resolution::RetryScheduled(handle) => handle,
            other => panic!("Expected retry, got {:?}", other),
        };

        let stored = store.get_job(id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Timeout);
        assert_eq!(stored.error.as_deref(), Some("boom"));
        assert!(receiver.try_dequeue().is_none());

        handle.await.unwrap();
        let requeued = receiver.try_dequeue().unwrap();
        assert_eq!(requeued.id, id);
        assert_eq!(requeued.status, JobStatus::Ready);
        assert_eq!(requeued.attempts, 1);
        assert_eq!(store.get_job(id).await.unwrap().unwrap().status, JobStatus::Ready);
    }

    #[tokio::test]
    async fn test_failure_without_budget_is_terminal() {
        let (coordinator, mut receiver, store) = setup(10).await;
        let job = running_job(&store, 1).await;
        let id = job.id;

        let outcome = ExecutionOutcome::failure(job, JobError::InvalidHandler("gone".to_string()));
        assert!(matches!(coordinator.process(outcome).await, Resolution::Failed));

        let stored = store.get_job(id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.attempts, 1);
        assert_eq!(stored.error.as_deref(), Some("Invalid handler 'gone'"));
        assert!(receiver.try_dequeue().is_none());
    }

    #[tokio::test]
    async fn test_terminal_job_outcome_is_ignored() {
        let (coordinator, mut receiver, store) = setup(10).await;
        let mut job = running_job(&store, 3).await;
        job.succeed().unwrap();

        let outcome = ExecutionOutcome::failure(
            job.clone(),
            JobError::HandlerExecutionFailure("late".to_string()),
        );
        assert!(matches!(coordinator.process(outcome).await, Resolution::Ignored));
        assert!(matches!(
            coordinator.process(ExecutionOutcome::success(job)).await,
            Resolution::Ignored
        ));
        assert!(receiver.try_dequeue().is_none());
    }

    #[tokio::test]
    async fn test_store_failure_does_not_block_decision() {
        let (coordinator, mut receiver, _store) = setup(5).await;
        // Never stored, so every update fails with JobNotFound
        let mut job = NewJob::new("dummy", 2).unwrap().into_job(77);
        job.start_attempt().unwrap();

        let outcome = ExecutionOutcome::failure(
            job,
            JobError::HandlerExecutionFailure("boom".to_string()),
        );
        match coordinator.process(outcome).await {
            Resolution::RetryScheduled(handle) => handle.await.unwrap(),
            other => panic!("Expected retry, got {:?}", other),
        }

        let requeued = receiver.try_dequeue().unwrap();
        assert_eq!(requeued.id, 77);
        assert_eq!(requeued.status, JobStatus::Ready);
        assert_eq!(coordinator.metrics.persistence_failures.get(), 2);
    }

    #[tokio::test]
    async fn test_cancelled_while_running_is_left_alone() {
        let (coordinator, mut receiver, store) = setup(5).await;
        let job = running_job(&store, 3).await;
        let mut cancelled = job.clone();
        cancelled.cancel("cancelled by operator").unwrap();
        store.update_job(&cancelled).await.unwrap();

        let outcome = ExecutionOutcome::failure(
            job,
            JobError::HandlerExecutionFailure("boom".to_string()),
        );
        assert!(matches!(coordinator.process(outcome).await, Resolution::Ignored));

        let stored = store.get_job(cancelled.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.error.as_deref(), Some("cancelled by operator"));
        assert!(receiver.try_dequeue().is_none());
    }

    #[tokio::test]
    async fn test_cancelled_during_cooldown_is_not_requeued() {
        let (coordinator, mut receiver, store) = setup(30).await;
        let job = running_job(&store, 3).await;
        let id = job.id;

        let outcome = ExecutionOutcome::failure(
            job,
            JobError::HandlerExecutionFailure("boom".to_string()),
        );
        let handle = match coordinator.process(outcome).await {
            Resolution::RetryScheduled(handle) => handle,
            other => panic!("Expected retry, got {:?}", other),
        };

        let mut stored = store.get_job(id).await.unwrap().unwrap();
        stored.cancel("cancelled by operator").unwrap();
        store.update_job(&stored).await.unwrap();

        handle.await.unwrap();
        assert!(receiver.try_dequeue().is_none());
        assert_eq!(store.get_job(id).await.unwrap().unwrap().status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn test_refresh_picks_up_edits() {
        let (coordinator, _receiver, store) = setup(5).await;
        let mut job = running_job(&store, 2).await;

        let mut edited = store.get_job(job.id).await.unwrap().unwrap();
        edited.handler = "other".to_string();
        edited.max_attempts = 5;
        store.update_job(&edited).await.unwrap();

        assert!(coordinator.refresh(&mut job).await);
        assert_eq!(job.handler, "other");
        assert_eq!(job.max_attempts, 5);
        assert_eq!(job.status, JobStatus::Running);
    }

    #[tokio::test]
    async fn test_engine_write_never_reopens_finished_job() {
        let (coordinator, _receiver, store) = setup(5).await;
        let job = running_job(&store, 3).await;

        let mut cancelled = job.clone();
        cancelled.cancel(CANCELLED_REASON).unwrap();
        store.update_job(&cancelled).await.unwrap();

        // A RUNNING write that lost the race to the cancellation
        let err = coordinator.persist(&job).await.unwrap_err();
        assert_eq!(
            err,
            JobError::InvalidTransition {
                from: JobStatus::Failed,
                to: JobStatus::Running
            }
        );

        let stored = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.error.as_deref(), Some(CANCELLED_REASON));
        assert_eq!(coordinator.metrics.persistence_failures.get(), 0);
    }

    #[tokio::test]
    async fn test_engine_write_keeps_external_edits() {
        let (coordinator, _receiver, store) = setup(5).await;
        let mut job = running_job(&store, 2).await;

        store
            .modify_job(job.id, Box::new(|job: &mut Job| {
                job.handler = "other".to_string();
                job.max_attempts = 9;
                Ok(())
            }))
            .await
            .unwrap();

        // The engine copy still carries the old handler and budget
        job.record_failure("boom").unwrap();
        coordinator.persist(&job).await.unwrap();

        let stored = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Timeout);
        assert_eq!(stored.attempts, 1);
        assert_eq!(stored.error.as_deref(), Some("boom"));
        assert_eq!(stored.handler, "other");
        assert_eq!(stored.max_attempts, 9);
    }

    #[tokio::test]
    async fn test_budget_lowered_during_cooldown_fails_job() {
        let (coordinator, mut receiver, store) = setup(30).await;
        let job = running_job(&store, 5).await;
        store.update_job(&job).await.unwrap();
        let id = job.id;

        let outcome = ExecutionOutcome::failure(
            job,
            JobError::HandlerExecutionFailure("boom".to_string()),
        );
        let handle = match coordinator.process(outcome).await {
            Resolution::RetryScheduled(handle) => handle,
            other => panic!("Expected retry, got {:?}", other),
        };

        store
            .modify_job(id, Box::new(|job: &mut Job| {
                job.max_attempts = 1;
                Ok(())
            }))
            .await
            .unwrap();

        handle.await.unwrap();
        assert!(receiver.try_dequeue().is_none());

        let stored = store.get_job(id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.attempts, 1);
        assert_eq!(stored.error.as_deref(), Some("Attempt budget exhausted (1/1)"));
        assert_eq!(
            coordinator
                .metrics
                .jobs_finished
                .with_label_values(&["FAILED", "dummy"])
                .get(),
            1
        );
    }

    #[tokio::test]
    async fn test_start_attempt_without_budget_fails_job() {
        let (coordinator, _receiver, store) = setup(5).await;
        let mut job = store
            .create_job(NewJob::new("dummy", 3).unwrap())
            .await
            .unwrap();
        job.attempts = 2;
        store.update_job(&job).await.unwrap();

        // Budget edited down to the attempts already made while queued
        store
            .modify_job(job.id, Box::new(|job: &mut Job| {
                job.max_attempts = 2;
                Ok(())
            }))
            .await
            .unwrap();

        assert!(coordinator.start_attempt(job.clone()).await.is_none());

        let stored = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.attempts, 2);
        assert_eq!(stored.error.as_deref(), Some("Attempt budget exhausted (2/2)"));
    }

    #[tokio::test]
    async fn test_start_attempt_counts_and_persists() {
        let (coordinator, _receiver, store) = setup(5).await;
        let job = store
            .create_job(NewJob::new("dummy", 2).unwrap())
            .await
            .unwrap();

        let running = coordinator.start_attempt(job).await.unwrap();
        assert_eq!(running.status, JobStatus::Running);
        assert_eq!(running.attempts, 1);
        assert_eq!(store.get_job(running.id).await.unwrap().unwrap(), running);
    }

    #[tokio::test]
    async fn test_running_write_checks_stored_budget() {
        let (coordinator, _receiver, store) = setup(5).await;
        let mut job = store
            .create_job(NewJob::new("dummy", 3).unwrap())
            .await
            .unwrap();
        job.attempts = 1;
        store.update_job(&job).await.unwrap();

        // Budget lowered to 1 after the engine refreshed with max 3
        store
            .modify_job(job.id, Box::new(|job: &mut Job| {
                job.max_attempts = 1;
                Ok(())
            }))
            .await
            .unwrap();
        job.start_attempt().unwrap();

        assert!(matches!(
            coordinator.persist(&job).await,
            Err(JobError::AttemptsExhausted { attempts: 1, max_attempts: 1 })
        ));
        assert_eq!(store.get_job(job.id).await.unwrap().unwrap().status, JobStatus::Ready);
    }
}

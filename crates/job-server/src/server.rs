use job_server_core::{
    HandlerId, HandlerRecord, Job, JobError, JobId, JobStatus, NewJob, Result, MIN_ATTEMPTS,
};
use job_server_engine::{
    Coordinator, DispatchQueue, EngineConfig, EngineMetrics, Executor, HandlerRegistry, JobHandler,
    CANCELLED_REASON,
};
use job_server_persistence::JobStore;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Partial edit of a stored job; absent fields are left untouched
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handler: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<JobStatus>,
}

impl JobUpdate {
    pub fn cancel() -> Self {
        JobUpdate {
            status: Some(JobStatus::Failed),
            ..JobUpdate::default()
        }
    }

    /// Apply the edit to the current stored record.
    ///
    /// Runs under the store's lock, so status and attempts are checked
    /// against what is stored now, not against an earlier read.
    fn apply(self, job: &mut Job) -> Result<()> {
        let cancel = match self.status {
            None => false,
            Some(status) if status == job.status => false,
            Some(JobStatus::Failed) if !job.is_terminal() => true,
            Some(status) => {
                return Err(JobError::InvalidTransition {
                    from: job.status,
                    to: status,
                })
            }
        };

        // Finished jobs keep the handler and budget they ran with
        if job.is_terminal() && (self.handler.is_some() || self.max_attempts.is_some()) {
            return Err(JobError::InvalidTransition {
                from: job.status,
                to: job.status,
            });
        }

        if let Some(max_attempts) = self.max_attempts {
            let min = MIN_ATTEMPTS.max(job.attempts);
            if max_attempts < min {
                return Err(JobError::InvalidMaxAttempts {
                    min,
                    actual: max_attempts,
                });
            }
            job.max_attempts = max_attempts;
        }
        if let Some(handler) = self.handler {
            job.handler = handler;
        }
        if cancel {
            job.cancel(CANCELLED_REASON)?;
        }
        Ok(())
    }
}

/// Collects handlers before the engine starts.
///
/// The registry is only reachable through the builder, so once [`start`]
/// consumes it no further registration is possible.
///
/// [`start`]: JobServerBuilder::start
pub struct JobServerBuilder {
    store: Arc<dyn JobStore>,
    config: EngineConfig,
    registry: HandlerRegistry,
    metrics: Arc<EngineMetrics>,
}

impl JobServerBuilder {
    pub fn new(
        store: Arc<dyn JobStore>,
        config: EngineConfig,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        JobServerBuilder {
            store,
            config,
            registry: HandlerRegistry::new(),
            metrics,
        }
    }

    /// Register a handler and write its record to the store.
    ///
    /// A record left by a previous run under the same name is reused.
    pub async fn register_handler<H: JobHandler + 'static>(
        &mut self,
        name: &str,
        handler: H,
    ) -> Result<HandlerRecord> {
        if self.registry.contains(name) {
            return Err(JobError::RegistrationFailure(format!(
                "handler '{}' is already registered",
                name
            )));
        }

        let existing = self
            .store
            .get_handler_by_name(name)
            .await
            .map_err(|e| JobError::RegistrationFailure(e.to_string()))?;
        let record = match existing {
            Some(record) => record,
            None => self
                .store
                .create_handler(name)
                .await
                .map_err(|e| JobError::RegistrationFailure(e.to_string()))?,
        };

        if !record.has_valid_id() {
            return Err(JobError::RegistrationFailure(format!(
                "store returned invalid id {} for handler '{}'",
                record.id, name
            )));
        }

        self.registry
            .register(name, handler)
            .map_err(|e| JobError::RegistrationFailure(e.to_string()))?;

        info!(handler_id = record.id, handler = name, "Registered handler");
        Ok(record)
    }

    /// Freeze the registry, recover unfinished jobs and start dispatching
    pub async fn start(self) -> Result<JobServer> {
        let metrics = self.metrics;
        let registry = Arc::new(self.registry);
        let (queue, receiver) = DispatchQueue::unbounded();

        let coordinator = Coordinator::new(
            self.store.clone(),
            queue.clone(),
            metrics.clone(),
            self.config.retry_cooldown(),
        );
        let executor = Executor::new(&self.config, registry.clone(), coordinator, metrics.clone());

        let recovered = recover_jobs(self.store.as_ref(), &queue).await?;
        if recovered > 0 {
            info!("Re-enqueued {} unfinished jobs", recovered);
        }

        let runner = executor.clone();
        let dispatch = tokio::spawn(async move { runner.run(receiver).await });

        info!(
            handlers = registry.len(),
            cooldown_ms = self.config.retry_cooldown_ms,
            "Job server started"
        );

        Ok(JobServer {
            store: self.store,
            registry,
            queue,
            executor,
            metrics,
            dispatch: Mutex::new(Some(dispatch)),
        })
    }
}

/// Put every non-terminal stored job back on the queue
async fn recover_jobs(store: &dyn JobStore, queue: &DispatchQueue) -> Result<usize> {
    let mut recovered = 0;

    for mut job in store.list_jobs().await? {
        if job.is_terminal() {
            continue;
        }

        let previous = job.status;
        let enqueue = job.recover();
        if job.status != previous {
            if let Err(e) = store.update_job(&job).await {
                warn!(job_id = job.id, "Could not persist recovered job: {}", e);
            }
        }

        if !enqueue {
            warn!(job_id = job.id, "Unfinished job has no attempts left, marked failed");
            continue;
        }
        if queue.enqueue(job).is_ok() {
            recovered += 1;
        }
    }

    Ok(recovered)
}

/// Running job server: submission, query and update paths over the engine
pub struct JobServer {
    store: Arc<dyn JobStore>,
    registry: Arc<HandlerRegistry>,
    queue: DispatchQueue,
    executor: Executor,
    metrics: Arc<EngineMetrics>,
    dispatch: Mutex<Option<JoinHandle<()>>>,
}

impl JobServer {
    /// Validate, store and enqueue a new job
    pub async fn submit_job(&self, handler: &str, max_attempts: u32) -> Result<Job> {
        if !self.registry.contains(handler) {
            return Err(JobError::InvalidHandler(handler.to_string()));
        }
        let new_job = NewJob::new(handler, max_attempts)?;

        let job = self.store.create_job(new_job).await?;
        self.metrics.jobs_submitted.inc();
        info!(job_id = job.id, handler = %job.handler, max_attempts, "Job submitted");

        if let Err(e) = self.queue.enqueue(job.clone()) {
            error!(job_id = job.id, "Job stored but not dispatched: {}", e);
        }
        self.refresh_gauges();

        Ok(job)
    }

    pub async fn get_job(&self, id: JobId) -> Result<Job> {
        self.store
            .get_job(id)
            .await?
            .ok_or(JobError::JobNotFound(id))
    }

    pub async fn list_jobs(&self) -> Result<Vec<Job>> {
        Ok(self.store.list_jobs().await?)
    }

    /// Apply an external edit.
    ///
    /// The only status change accepted is forcing a non-terminal job to
    /// FAILED; a requested status equal to the current one is a no-op. The
    /// engine sees the edit at the job's next step.
    pub async fn update_job(&self, id: JobId, update: JobUpdate) -> Result<Job> {
        if let Some(handler) = &update.handler {
            if !self.registry.contains(handler) {
                return Err(JobError::InvalidHandler(handler.clone()));
            }
        }
        if let Some(max_attempts) = update.max_attempts {
            if max_attempts < MIN_ATTEMPTS {
                return Err(JobError::InvalidMaxAttempts {
                    min: MIN_ATTEMPTS,
                    actual: max_attempts,
                });
            }
        }

        let job = self
            .store
            .modify_job(id, Box::new(move |job: &mut Job| update.apply(job)))
            .await?;

        info!(
            job_id = id,
            status = %job.status,
            max_attempts = job.max_attempts,
            "Job updated"
        );
        Ok(job)
    }

    pub async fn get_handler(&self, id: HandlerId) -> Result<HandlerRecord> {
        self.store
            .get_handler(id)
            .await?
            .ok_or(JobError::HandlerNotFound(id))
    }

    pub async fn list_handlers(&self) -> Result<Vec<HandlerRecord>> {
        Ok(self.store.list_handlers().await?)
    }

    /// Jobs waiting for dispatch
    pub fn queue_depth(&self) -> usize {
        self.queue.len()
    }

    /// Attempts currently executing
    pub fn in_flight(&self) -> usize {
        self.executor.in_flight()
    }

    pub fn metrics(&self) -> &Arc<EngineMetrics> {
        &self.metrics
    }

    /// Sync sampled gauges with the live values
    pub fn refresh_gauges(&self) {
        self.metrics.queue_depth.set(self.queue_depth() as i64);
    }

    /// Stop dispatching and wait for in-flight attempts.
    ///
    /// Jobs still queued or cooling down stay non-terminal in the store and
    /// are picked up again by the next start.
    pub async fn shutdown(&self) {
        self.executor.shutdown();

        let dispatch = self.dispatch.lock().take();
        if let Some(handle) = dispatch {
            if let Err(e) = handle.await {
                error!("Dispatch loop ended abnormally: {}", e);
            }
        }
        info!("Job server stopped");
    }
}

use crate::{
    config::EngineConfig,
    coordinator::{Coordinator, ExecutionOutcome},
    metrics::EngineMetrics,
    queue::DispatchReceiver,
    registry::HandlerRegistry,
};
use job_server_core::{Job, JobError};

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, warn};

/// Pulls jobs off the dispatch queue and runs each one in its own task.
///
/// The dispatch loop itself only spawns, so jobs leave the queue in FIFO
/// order even though their handlers finish in any order.
#[derive(Clone)]
pub struct Executor {
    registry: Arc<HandlerRegistry>,
    coordinator: Coordinator,
    metrics: Arc<EngineMetrics>,
    limiter: Option<Arc<Semaphore>>,
    in_flight: Arc<AtomicUsize>,
    shutdown: Arc<Notify>,
    shutdown_timeout: Duration,
}

impl Executor {
    pub fn new(
        config: &EngineConfig,
        registry: Arc<HandlerRegistry>,
        coordinator: Coordinator,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        Executor {
            registry,
            coordinator,
            metrics,
            limiter: config
                .max_concurrency
                .map(|permits| Arc::new(Semaphore::new(permits.max(1)))),
            in_flight: Arc::new(AtomicUsize::new(0)),
            shutdown: Arc::new(Notify::new()),
            shutdown_timeout: config.graceful_shutdown_timeout(),
        }
    }

    /// Run the dispatch loop until shutdown or until the queue is closed
    pub async fn run(&self, mut receiver: DispatchReceiver) {
        match &self.limiter {
            Some(limiter) => info!(
                "Dispatch loop started (max concurrency: {})",
                limiter.available_permits()
            ),
            None => info!("Dispatch loop started (unbounded concurrency)"),
        }

        loop {
            tokio::select! {
                next = receiver.dequeue() => {
                    match next {
                        Some(job) => self.dispatch(job).await,
                        None => {
                            info!("Dispatch queue closed");
                            break;
                        }
                    }
                }
                _ = self.shutdown.notified() => {
                    info!("Dispatch loop shutting down gracefully");
                    break;
                }
            }
        }

        self.graceful_shutdown().await;
    }

    /// Hand a job to a fresh execution unit
    async fn dispatch(&self, job: Job) {
        let permit = match &self.limiter {
            Some(limiter) => match limiter.clone().acquire_owned().await {
                Ok(permit) => Some(permit),
                Err(e) => {
                    error!(job_id = job.id, "Concurrency limiter closed: {}", e);
                    return;
                }
            },
            None => None,
        };

        debug!(job_id = job.id, handler = %job.handler, "Dispatching job");
        let guard = InFlightGuard::new(self.in_flight.clone(), self.metrics.clone());
        let executor = self.clone();
        tokio::spawn(async move {
            executor.execute_job(job, permit).await;
            drop(guard);
        });
    }

    /// One attempt of one job, start to finish
    async fn execute_job(&self, job: Job, permit: Option<OwnedSemaphorePermit>) {
        let job_id = job.id;

        // Finished or out-of-budget jobs stop here
        let Some(job) = self.coordinator.start_attempt(job).await else {
            return;
        };
        self.metrics.inc_attempts(&job.handler);

        info!(
            job_id,
            handler = %job.handler,
            attempt = job.attempts,
            max_attempts = job.max_attempts,
            "Executing job"
        );

        let started = Instant::now();
        let result = self.run_handler(&job).await;
        self.metrics
            .observe_duration(&job.handler, started.elapsed().as_secs_f64());

        // The cooldown must not hold a concurrency slot
        drop(permit);

        let outcome = match result {
            Ok(()) => ExecutionOutcome::success(job),
            Err(e) => {
                debug!(job_id, "Attempt failed: {}", e);
                ExecutionOutcome::failure(job, e)
            }
        };
        self.coordinator.process(outcome).await;
    }

    /// Resolve and invoke the handler; panics are captured as failures
    async fn run_handler(&self, job: &Job) -> Result<(), JobError> {
        let handler = self
            .registry
            .resolve(&job.handler)
            .map_err(|_| JobError::InvalidHandler(job.handler.clone()))?;

        let snapshot = job.clone();
        match tokio::spawn(async move { handler.handle(&snapshot).await }).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(reason)) => Err(JobError::HandlerExecutionFailure(reason)),
            Err(join_error) => {
                let message = if join_error.is_panic() {
                    let panic = join_error.into_panic();
                    panic
                        .downcast_ref::<String>()
                        .cloned()
                        .or_else(|| panic.downcast_ref::<&str>().map(|s| s.to_string()))
                        .unwrap_or_else(|| "unknown panic".to_string())
                } else {
                    "handler task was cancelled".to_string()
                };
                error!(job_id = job.id, "Handler panicked: {}", message);
                Err(JobError::HandlerExecutionFailure(format!(
                    "handler panicked: {}",
                    message
                )))
            }
        }
    }

    /// Wait for running attempts, bounded by the shutdown timeout
    async fn graceful_shutdown(&self) {
        info!("Waiting for in-flight jobs to complete...");

        let deadline = tokio::time::Instant::now() + self.shutdown_timeout;

        loop {
            let active = self.in_flight();

            if active == 0 {
                info!("All in-flight jobs completed");
                break;
            }

            if tokio::time::Instant::now() > deadline {
                warn!("Shutdown deadline exceeded, {} jobs still running", active);
                break;
            }

            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Number of attempts currently executing
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Stop the dispatch loop; running attempts are allowed to finish
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }
}

/// Tracks one execution unit; decrements the counters even if the unit panics
struct InFlightGuard {
    counter: Arc<AtomicUsize>,
    metrics: Arc<EngineMetrics>,
}

impl InFlightGuard {
    fn new(counter: Arc<AtomicUsize>, metrics: Arc<EngineMetrics>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        metrics.jobs_in_flight.inc();
        InFlightGuard { counter, metrics }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
        self.metrics.jobs_in_flight.dec();
    }
}

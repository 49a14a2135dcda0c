// Shared fixtures for the job server integration tests

#![allow(dead_code)]

use job_server::{JobServer, JobServerBuilder};
use job_server_core::{HandlerId, HandlerRecord, Job, JobId, JobStatus, NewJob};
use job_server_engine::{
    handler_fn, AlwaysFail, AlwaysSucceed, DummyHandler, EngineConfig, EngineMetrics,
};
use job_server_persistence::{InMemoryStore, JobEdit, JobStore, PersistenceError, Result};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// In-memory store that logs every status it is asked to persist
#[derive(Default)]
pub struct RecordingStore {
    inner: InMemoryStore,
    log: Mutex<Vec<(JobId, JobStatus)>>,
}

impl RecordingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Persisted statuses of one job, in write order
    pub fn statuses(&self, id: JobId) -> Vec<JobStatus> {
        self.log
            .lock()
            .iter()
            .filter(|(job_id, _)| *job_id == id)
            .map(|(_, status)| *status)
            .collect()
    }

    pub fn writes(&self) -> usize {
        self.log.lock().len()
    }
}

#[async_trait::async_trait]
impl JobStore for RecordingStore {
    async fn create_job(&self, job: NewJob) -> Result<Job> {
        let job = self.inner.create_job(job).await?;
        self.log.lock().push((job.id, job.status));
        Ok(job)
    }

    async fn update_job(&self, job: &Job) -> Result<Job> {
        self.log.lock().push((job.id, job.status));
        self.inner.update_job(job).await
    }

    async fn modify_job(&self, id: JobId, edit: JobEdit) -> Result<Job> {
        let job = self.inner.modify_job(id, edit).await?;
        self.log.lock().push((job.id, job.status));
        Ok(job)
    }

    async fn get_job(&self, id: JobId) -> Result<Option<Job>> {
        self.inner.get_job(id).await
    }

    async fn list_jobs(&self) -> Result<Vec<Job>> {
        self.inner.list_jobs().await
    }

    async fn create_handler(&self, name: &str) -> Result<HandlerRecord> {
        self.inner.create_handler(name).await
    }

    async fn get_handler(&self, id: HandlerId) -> Result<Option<HandlerRecord>> {
        self.inner.get_handler(id).await
    }

    async fn get_handler_by_name(&self, name: &str) -> Result<Option<HandlerRecord>> {
        self.inner.get_handler_by_name(name).await
    }

    async fn list_handlers(&self) -> Result<Vec<HandlerRecord>> {
        self.inner.list_handlers().await
    }
}

/// Store whose non-terminal job updates always fail
#[derive(Default)]
pub struct FlakyStore {
    inner: InMemoryStore,
    pub failed_writes: AtomicUsize,
}

#[async_trait::async_trait]
impl JobStore for FlakyStore {
    async fn create_job(&self, job: NewJob) -> Result<Job> {
        self.inner.create_job(job).await
    }

    async fn update_job(&self, job: &Job) -> Result<Job> {
        if !job.is_terminal() {
            self.failed_writes.fetch_add(1, Ordering::SeqCst);
            return Err(PersistenceError::Other("disk unavailable".to_string()));
        }
        self.inner.update_job(job).await
    }

    async fn modify_job(&self, id: JobId, edit: JobEdit) -> Result<Job> {
        let mut job = self
            .inner
            .get_job(id)
            .await?
            .ok_or(PersistenceError::JobNotFound(id))?;
        edit(&mut job)?;
        self.update_job(&job).await
    }

    async fn get_job(&self, id: JobId) -> Result<Option<Job>> {
        self.inner.get_job(id).await
    }

    async fn list_jobs(&self) -> Result<Vec<Job>> {
        self.inner.list_jobs().await
    }

    async fn create_handler(&self, name: &str) -> Result<HandlerRecord> {
        self.inner.create_handler(name).await
    }

    async fn get_handler(&self, id: HandlerId) -> Result<Option<HandlerRecord>> {
        self.inner.get_handler(id).await
    }

    async fn get_handler_by_name(&self, name: &str) -> Result<Option<HandlerRecord>> {
        self.inner.get_handler_by_name(name).await
    }

    async fn list_handlers(&self) -> Result<Vec<HandlerRecord>> {
        self.inner.list_handlers().await
    }
}

/// Store that holds back the result of the next `get_job` once armed, so
/// the reader acts on a stale record
pub struct SlowReadStore {
    inner: InMemoryStore,
    armed: AtomicBool,
    delay: Duration,
}

impl SlowReadStore {
    pub fn new(delay: Duration) -> Self {
        SlowReadStore {
            inner: InMemoryStore::new(),
            armed: AtomicBool::new(false),
            delay,
        }
    }

    pub fn arm(&self) {
        self.armed.store(true, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl JobStore for SlowReadStore {
    async fn create_job(&self, job: NewJob) -> Result<Job> {
        self.inner.create_job(job).await
    }

    async fn update_job(&self, job: &Job) -> Result<Job> {
        self.inner.update_job(job).await
    }

    async fn modify_job(&self, id: JobId, edit: JobEdit) -> Result<Job> {
        self.inner.modify_job(id, edit).await
    }

    async fn get_job(&self, id: JobId) -> Result<Option<Job>> {
        let job = self.inner.get_job(id).await?;
        if self.armed.swap(false, Ordering::SeqCst) {
            tokio::time::sleep(self.delay).await;
        }
        Ok(job)
    }

    async fn list_jobs(&self) -> Result<Vec<Job>> {
        self.inner.list_jobs().await
    }

    async fn create_handler(&self, name: &str) -> Result<HandlerRecord> {
        self.inner.create_handler(name).await
    }

    async fn get_handler(&self, id: HandlerId) -> Result<Option<HandlerRecord>> {
        self.inner.get_handler(id).await
    }

    async fn get_handler_by_name(&self, name: &str) -> Result<Option<HandlerRecord>> {
        self.inner.get_handler_by_name(name).await
    }

    async fn list_handlers(&self) -> Result<Vec<HandlerRecord>> {
        self.inner.list_handlers().await
    }
}

/// How [`BadHandlerStore`] answers `create_handler`
#[derive(Clone, Copy)]
pub enum HandlerWrite {
    ZeroId,
    Error,
}

/// Store whose handler writes misbehave; job operations are delegated
pub struct BadHandlerStore {
    inner: InMemoryStore,
    mode: HandlerWrite,
}

impl BadHandlerStore {
    pub fn new(mode: HandlerWrite) -> Self {
        BadHandlerStore {
            inner: InMemoryStore::new(),
            mode,
        }
    }
}

#[async_trait::async_trait]
impl JobStore for BadHandlerStore {
    async fn create_job(&self, job: NewJob) -> Result<Job> {
        self.inner.create_job(job).await
    }

    async fn update_job(&self, job: &Job) -> Result<Job> {
        self.inner.update_job(job).await
    }

    async fn modify_job(&self, id: JobId, edit: JobEdit) -> Result<Job> {
        self.inner.modify_job(id, edit).await
    }

    async fn get_job(&self, id: JobId) -> Result<Option<Job>> {
        self.inner.get_job(id).await
    }

    async fn list_jobs(&self) -> Result<Vec<Job>> {
        self.inner.list_jobs().await
    }

    async fn create_handler(&self, name: &str) -> Result<HandlerRecord> {
        match self.mode {
            HandlerWrite::ZeroId => Ok(HandlerRecord::new(0, name)),
            HandlerWrite::Error => Err(PersistenceError::Other("disk unavailable".to_string())),
        }
    }

    async fn get_handler(&self, id: HandlerId) -> Result<Option<HandlerRecord>> {
        self.inner.get_handler(id).await
    }

    async fn get_handler_by_name(&self, name: &str) -> Result<Option<HandlerRecord>> {
        self.inner.get_handler_by_name(name).await
    }

    async fn list_handlers(&self) -> Result<Vec<HandlerRecord>> {
        self.inner.list_handlers().await
    }
}

pub fn engine_config(cooldown_ms: u64) -> EngineConfig {
    EngineConfig {
        retry_cooldown_ms: cooldown_ms,
        graceful_shutdown_timeout_secs: 5,
        ..EngineConfig::default()
    }
}

/// Start a server with the stock test handlers: `always-succeed`,
/// `always-fail`, `third-time-lucky` (fails attempts 1 and 2) and
/// `slow-succeed` (sleeps 50ms, then succeeds)
pub async fn start_server(store: Arc<dyn JobStore>, config: EngineConfig) -> JobServer {
    let metrics = Arc::new(EngineMetrics::new().unwrap());
    let mut builder = JobServerBuilder::new(store, config, metrics);

    builder
        .register_handler("always-succeed", AlwaysSucceed)
        .await
        .unwrap();
    builder
        .register_handler("always-fail", AlwaysFail)
        .await
        .unwrap();
    builder
        .register_handler(
            "third-time-lucky",
            handler_fn(|job: &Job| {
                if job.attempts < 3 {
                    Err(format!("attempt {} not lucky", job.attempts))
                } else {
                    Ok(())
                }
            }),
        )
        .await
        .unwrap();
    builder
        .register_handler(
            "slow-succeed",
            DummyHandler::new(Duration::from_millis(50), 0.0),
        )
        .await
        .unwrap();

    builder.start().await.unwrap()
}

/// Poll until the job reaches `status`
pub async fn wait_status(server: &JobServer, id: JobId, status: JobStatus) -> Job {
    for _ in 0..500 {
        let job = server.get_job(id).await.unwrap();
        if job.status == status {
            return job;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("job {} never reached {}", id, status);
}

/// Poll until the job is SUCCEEDED or FAILED
pub async fn wait_terminal(server: &JobServer, id: JobId) -> Job {
    for _ in 0..500 {
        let job = server.get_job(id).await.unwrap();
        if job.is_terminal() {
            return job;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {} never reached a terminal state", id);
}

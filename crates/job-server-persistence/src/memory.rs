use crate::{JobEdit, JobStore, PersistenceError, Result};
use dashmap::DashMap;
use job_server_core::{HandlerId, HandlerRecord, Job, JobId, NewJob};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicI64, Ordering};
use tracing::debug;

/// Volatile store; everything is lost when the process exits
pub struct InMemoryStore {
    jobs: DashMap<JobId, Job>,
    handlers: RwLock<Vec<HandlerRecord>>,
    next_job_id: AtomicI64,
    next_handler_id: AtomicI64,
}

impl InMemoryStore {
    pub fn new() -> Self {
        InMemoryStore {
            jobs: DashMap::new(),
            handlers: RwLock::new(Vec::new()),
            next_job_id: AtomicI64::new(1),
            next_handler_id: AtomicI64::new(1),
        }
    }

    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl JobStore for InMemoryStore {
    async fn create_job(&self, job: NewJob) -> Result<Job> {
        let job = job.into_job(self.next_job_id.fetch_add(1, Ordering::SeqCst));
        self.jobs.insert(job.id, job.clone());

        debug!(job_id = job.id, "Stored new job");
        Ok(job)
    }

    async fn update_job(&self, job: &Job) -> Result<Job> {
        match self.jobs.get_mut(&job.id) {
            Some(mut stored) => {
                *stored = job.clone();
                Ok(job.clone())
            }
            None => Err(PersistenceError::JobNotFound(job.id)),
        }
    }

    async fn modify_job(&self, id: JobId, edit: JobEdit) -> Result<Job> {
        // The entry guard serializes writers of this job
        let mut stored = self
            .jobs
            .get_mut(&id)
            .ok_or(PersistenceError::JobNotFound(id))?;

        let mut job = stored.clone();
        edit(&mut job)?;
        *stored = job.clone();
        Ok(job)
    }

    async fn get_job(&self, id: JobId) -> Result<Option<Job>> {
        Ok(self.jobs.get(&id).map(|job| job.clone()))
    }

    async fn list_jobs(&self) -> Result<Vec<Job>> {
        let mut jobs: Vec<Job> = self.jobs.iter().map(|entry| entry.value().clone()).collect();
        jobs.sort_by_key(|job| job.id);
        Ok(jobs)
    }

    async fn create_handler(&self, name: &str) -> Result<HandlerRecord> {
        let mut handlers = self.handlers.write();
        if handlers.iter().any(|h| h.name == name) {
            return Err(PersistenceError::DuplicateHandler(name.to_string()));
        }

        let id = self.next_handler_id.fetch_add(1, Ordering::SeqCst);
        let record = HandlerRecord::new(id, name);
        handlers.push(record.clone());

        debug!(handler_id = record.id, handler = %name, "Stored new handler");
        Ok(record)
    }

    async fn get_handler(&self, id: HandlerId) -> Result<Option<HandlerRecord>> {
        Ok(self.handlers.read().iter().find(|h| h.id == id).cloned())
    }

    async fn get_handler_by_name(&self, name: &str) -> Result<Option<HandlerRecord>> {
        Ok(self.handlers.read().iter().find(|h| h.name == name).cloned())
    }

    async fn list_handlers(&self) -> Result<Vec<HandlerRecord>> {
        Ok(self.handlers.read().clone())
    }
}

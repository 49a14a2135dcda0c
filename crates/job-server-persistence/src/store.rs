use crate::Result;
use job_server_core::{HandlerId, HandlerRecord, Job, JobId, NewJob};

/// In-place edit of a stored job. Returning an error leaves the record as it was.
pub type JobEdit = Box<dyn FnOnce(&mut Job) -> job_server_core::Result<()> + Send>;

/// Persistence boundary used by the job server and the retry coordinator.
///
/// Implementations must tolerate concurrent writes to distinct jobs. Writers
/// that share a job go through [`JobStore::modify_job`], which applies each
/// edit to the current record under the store's own lock.
#[async_trait::async_trait]
pub trait JobStore: Send + Sync {
    /// Store a new job and assign its id
    async fn create_job(&self, job: NewJob) -> Result<Job>;

    /// Overwrite the stored job with the same id
    async fn update_job(&self, job: &Job) -> Result<Job>;

    /// Apply `edit` to the stored job atomically and return the new record.
    ///
    /// An error from `edit` comes back as `PersistenceError::JobError`.
    async fn modify_job(&self, id: JobId, edit: JobEdit) -> Result<Job>;

    /// Get a job by ID
    async fn get_job(&self, id: JobId) -> Result<Option<Job>>;

    /// All jobs ordered by id
    async fn list_jobs(&self) -> Result<Vec<Job>>;

    /// Store a handler name and assign its id
    async fn create_handler(&self, name: &str) -> Result<HandlerRecord>;

    /// Get a handler record by ID
    async fn get_handler(&self, id: HandlerId) -> Result<Option<HandlerRecord>>;

    /// Get a handler record by name
    async fn get_handler_by_name(&self, name: &str) -> Result<Option<HandlerRecord>>;

    /// All handler records ordered by id
    async fn list_handlers(&self) -> Result<Vec<HandlerRecord>>;
}

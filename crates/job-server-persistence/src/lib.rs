mod file;
mod memory;
mod store;
mod wal;

pub use file::{FileStore, FileStoreConfig};
pub use memory::InMemoryStore;
pub use store::{JobEdit, JobStore};
pub use wal::{WalEntry, WriteAheadLog};

use job_server_core::{JobError, JobId};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("RocksDB error: {0}")]
    RocksDbError(#[from] rocksdb::Error),

    /// An edit refused to apply to the stored record
    #[error("Job error: {0}")]
    JobError(#[from] JobError),

    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    #[error("Handler already exists: {0}")]
    DuplicateHandler(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] bincode::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("WAL error: {0}")]
    WalError(String),

    #[error("Other error: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, PersistenceError>;

impl From<PersistenceError> for JobError {
    fn from(err: PersistenceError) -> Self {
        match err {
            PersistenceError::JobNotFound(id) => JobError::JobNotFound(id),
            PersistenceError::JobError(inner) => inner,
            other => JobError::PersistenceFailure(other.to_string()),
        }
    }
}

pub mod api;
pub mod config;
pub mod server;

pub use config::{MonitoringConfig, NetworkConfig, PersistenceConfig, ServerConfig, StorageBackend};
pub use job_server_engine::CANCELLED_REASON;
pub use server::{JobServer, JobServerBuilder, JobUpdate};

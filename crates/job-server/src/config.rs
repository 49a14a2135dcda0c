use job_server_engine::EngineConfig;
use job_server_persistence::{FileStore, FileStoreConfig, InMemoryStore, JobStore, PersistenceError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub server: NetworkConfig,
    pub engine: EngineConfig,
    pub persistence: PersistenceConfig,
    pub monitoring: MonitoringConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub host: String,
    pub port: u16,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Memory,
    File,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub backend: StorageBackend,
    pub data_dir: PathBuf,
    /// WAL entries kept after each compaction (file backend)
    pub wal_retention: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        PersistenceConfig {
            backend: StorageBackend::Memory,
            data_dir: PathBuf::from("./data"),
            wal_retention: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub metrics_port: u16,
    pub log_level: String,
    pub json_logs: bool,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        MonitoringConfig {
            metrics_port: 9091,
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

impl ServerConfig {
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: ServerConfig = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    pub fn metrics_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.monitoring.metrics_port)
    }

    /// Open the configured storage backend
    pub fn open_store(&self) -> Result<Arc<dyn JobStore>, PersistenceError> {
        match self.persistence.backend {
            StorageBackend::Memory => Ok(Arc::new(InMemoryStore::new())),
            StorageBackend::File => {
                let config = FileStoreConfig {
                    data_dir: self.persistence.data_dir.clone(),
                    wal_retention: self.persistence.wal_retention,
                };
                Ok(Arc::new(FileStore::open(config)?))
            }
        }
    }
}

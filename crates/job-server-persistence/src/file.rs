use crate::{JobEdit, JobStore, PersistenceError, Result, WalEntry, WriteAheadLog};
use chrono::Utc;
use job_server_core::{HandlerId, HandlerRecord, Job, JobId, NewJob};
use parking_lot::Mutex;
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, IteratorMode, Options, DB};
use serde::de::DeserializeOwned;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Configuration for the durable store
#[derive(Debug, Clone)]
pub struct FileStoreConfig {
    pub data_dir: PathBuf,
    /// WAL entries kept after each compaction
    pub wal_retention: u64,
}

impl Default for FileStoreConfig {
    fn default() -> Self {
        FileStoreConfig {
            data_dir: PathBuf::from("./data"),
            wal_retention: 1000,
        }
    }
}

/// Column family names
const CF_JOBS: &str = "jobs";
const CF_HANDLERS: &str = "handlers";

struct NextIds {
    job: JobId,
    handler: HandlerId,
}

/// Durable store: job and handler records in RocksDB, each write logged to
/// the WAL first.
///
/// Opening the store replays the retained WAL so a write that was logged but
/// not applied before a crash is not lost.
pub struct FileStore {
    db: Arc<DB>,
    wal: Arc<WriteAheadLog>,
    // Serializes check + log + apply for each mutation
    next_ids: Mutex<NextIds>,
    config: FileStoreConfig,
}

impl FileStore {
    /// Open or create the store under `config.data_dir`
    pub fn open(config: FileStoreConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(CF_JOBS, Options::default()),
            ColumnFamilyDescriptor::new(CF_HANDLERS, Options::default()),
        ];
        let db = DB::open_cf_descriptors(&db_opts, config.data_dir.join("records"), cf_descriptors)?;
        let wal = WriteAheadLog::open(config.data_dir.join("wal"))?;

        let mut store = FileStore {
            db: Arc::new(db),
            wal: Arc::new(wal),
            next_ids: Mutex::new(NextIds { job: 1, handler: 1 }),
            config,
        };

        let replayed = store.replay_wal()?;
        let next_ids = NextIds {
            job: store.last_id(CF_JOBS)? + 1,
            handler: store.last_id(CF_HANDLERS)? + 1,
        };
        *store.next_ids.get_mut() = next_ids;

        info!(
            "Opened file store at {:?} ({} WAL entries replayed)",
            store.config.data_dir, replayed
        );
        Ok(store)
    }

    /// Flush records and WAL to disk
    pub fn sync(&self) -> Result<()> {
        self.wal.sync()?;
        self.db.flush()?;
        Ok(())
    }

    /// Re-apply every retained WAL entry; entries are full records, so this is idempotent
    fn replay_wal(&self) -> Result<usize> {
        let entries = self.wal.all_entries()?;
        for (_, entry) in &entries {
            self.apply(entry)?;
        }
        Ok(entries.len())
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| PersistenceError::Other(format!("CF {} not found", name)))
    }

    fn apply(&self, entry: &WalEntry) -> Result<()> {
        match entry {
            WalEntry::JobCreated { job, .. } | WalEntry::JobUpdated { job, .. } => {
                self.db
                    .put_cf(self.cf(CF_JOBS)?, job.id.to_be_bytes(), bincode::serialize(job)?)?;
            }
            WalEntry::HandlerCreated { handler, .. } => {
                self.db.put_cf(
                    self.cf(CF_HANDLERS)?,
                    handler.id.to_be_bytes(),
                    bincode::serialize(handler)?,
                )?;
            }
        }
        Ok(())
    }

    /// Log to WAL, then apply; compacts the WAL every `wal_retention` entries
    fn log_and_apply(&self, entry: WalEntry) -> Result<()> {
        let seq = self.wal.append(&entry)?;
        self.apply(&entry)?;

        let retention = self.config.wal_retention.max(1);
        if seq > 0 && seq % retention == 0 {
            match self.wal.compact(retention) {
                Ok(removed) => debug!("Compacted WAL, dropped {} entries", removed),
                Err(e) => warn!("WAL compaction failed: {}", e),
            }
        }
        Ok(())
    }

    fn read_job(&self, id: JobId) -> Result<Option<Job>> {
        match self.db.get_cf(self.cf(CF_JOBS)?, id.to_be_bytes())? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    fn read_all<T: DeserializeOwned>(&self, cf_name: &str) -> Result<Vec<T>> {
        let mut records = Vec::new();
        for item in self.db.iterator_cf(self.cf(cf_name)?, IteratorMode::Start) {
            let (_key, value) = item?;
            records.push(bincode::deserialize(&value)?);
        }
        Ok(records)
    }

    /// Largest id in a column family; keys are big-endian so the last one wins
    fn last_id(&self, cf_name: &str) -> Result<i64> {
        let mut iter = self.db.raw_iterator_cf(self.cf(cf_name)?);
        iter.seek_to_last();

        match iter.key() {
            Some(key) => {
                let bytes: [u8; 8] = key
                    .try_into()
                    .map_err(|_| PersistenceError::Other(format!("Invalid key in {}", cf_name)))?;
                Ok(i64::from_be_bytes(bytes))
            }
            None => Ok(0),
        }
    }
}

#[async_trait::async_trait]
impl JobStore for FileStore {
    async fn create_job(&self, job: NewJob) -> Result<Job> {
        let mut next_ids = self.next_ids.lock();

        let job = job.into_job(next_ids.job);
        self.log_and_apply(WalEntry::JobCreated {
            job: job.clone(),
            timestamp: Utc::now(),
        })?;
        next_ids.job += 1;

        debug!(job_id = job.id, "Stored new job");
        Ok(job)
    }

    async fn update_job(&self, job: &Job) -> Result<Job> {
        let _guard = self.next_ids.lock();

        if self.read_job(job.id)?.is_none() {
            return Err(PersistenceError::JobNotFound(job.id));
        }
        self.log_and_apply(WalEntry::JobUpdated {
            job: job.clone(),
            timestamp: Utc::now(),
        })?;
        Ok(job.clone())
    }

    async fn modify_job(&self, id: JobId, edit: JobEdit) -> Result<Job> {
        let _guard = self.next_ids.lock();

        let mut job = self
            .read_job(id)?
            .ok_or(PersistenceError::JobNotFound(id))?;
        edit(&mut job)?;

        self.log_and_apply(WalEntry::JobUpdated {
            job: job.clone(),
            timestamp: Utc::now(),
        })?;
        Ok(job)
    }

    async fn get_job(&self, id: JobId) -> Result<Option<Job>> {
        self.read_job(id)
    }

    async fn list_jobs(&self) -> Result<Vec<Job>> {
        self.read_all(CF_JOBS)
    }

    async fn create_handler(&self, name: &str) -> Result<HandlerRecord> {
        let mut next_ids = self.next_ids.lock();

        let handlers: Vec<HandlerRecord> = self.read_all(CF_HANDLERS)?;
        if handlers.iter().any(|h| h.name == name) {
            return Err(PersistenceError::DuplicateHandler(name.to_string()));
        }

        let record = HandlerRecord::new(next_ids.handler, name);
        self.log_and_apply(WalEntry::HandlerCreated {
            handler: record.clone(),
            timestamp: Utc::now(),
        })?;
        next_ids.handler += 1;

        debug!(handler_id = record.id, handler = %name, "Stored new handler");
        Ok(record)
    }

    async fn get_handler(&self, id: HandlerId) -> Result<Option<HandlerRecord>> {
        match self.db.get_cf(self.cf(CF_HANDLERS)?, id.to_be_bytes())? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    async fn get_handler_by_name(&self, name: &str) -> Result<Option<HandlerRecord>> {
        let handlers: Vec<HandlerRecord> = self.read_all(CF_HANDLERS)?;
        Ok(handlers.into_iter().find(|h| h.name == name))
    }

    async fn list_handlers(&self) -> Result<Vec<HandlerRecord>> {
        self.read_all(CF_HANDLERS)
    }
}

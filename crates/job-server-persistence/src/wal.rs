use crate::{PersistenceError, Result};
use chrono::{DateTime, Utc};
use job_server_core::{HandlerRecord, Job};
use parking_lot::Mutex;
use rocksdb::WriteBatch;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

/// Write-Ahead Log entry types
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WalEntry {
    /// Job stored for the first time
    JobCreated { job: Job, timestamp: DateTime<Utc> },

    /// New full state of a stored job
    JobUpdated { job: Job, timestamp: DateTime<Utc> },

    /// Handler name stored at startup
    HandlerCreated { handler: HandlerRecord, timestamp: DateTime<Utc> },
}

/// Write-Ahead Log for durability
pub struct WriteAheadLog {
    db: Arc<rocksdb::DB>,
    sequence_number: Arc<Mutex<u64>>,
}

impl WriteAheadLog {
    /// Create or open WAL
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut opts = rocksdb::Options::default();
        opts.create_if_missing(true);

        let db = rocksdb::DB::open(&opts, path.as_ref())?;

        // Continue after the last sequence number
        let mut iter = db.raw_iterator();
        iter.seek_to_last();
        let sequence_number = match iter.key() {
            Some(key) => decode_seq(key)? + 1,
            None => 0,
        };
        drop(iter);

        Ok(WriteAheadLog {
            db: Arc::new(db),
            sequence_number: Arc::new(Mutex::new(sequence_number)),
        })
    }

    /// Append entry to WAL
    pub fn append(&self, entry: &WalEntry) -> Result<u64> {
        let mut seq = self.sequence_number.lock();
        let seq_num = *seq;

        let value = bincode::serialize(entry)?;
        self.db.put(seq_num.to_be_bytes(), value)?;

        *seq += 1;
        Ok(seq_num)
    }

    /// Replay all entries from a sequence number
    pub fn replay_from(&self, start_seq: u64) -> Result<Vec<(u64, WalEntry)>> {
        let mut entries = Vec::new();
        let mut iter = self.db.raw_iterator();

        iter.seek(start_seq.to_be_bytes());

        while iter.valid() {
            if let (Some(key), Some(value)) = (iter.key(), iter.value()) {
                let seq = decode_seq(key)?;
                let entry: WalEntry = bincode::deserialize(value)?;
                entries.push((seq, entry));
            }
            iter.next();
        }
        iter.status()?;

        Ok(entries)
    }

    /// Get all entries
    pub fn all_entries(&self) -> Result<Vec<(u64, WalEntry)>> {
        self.replay_from(0)
    }

    /// Next sequence number to be assigned
    pub fn next_sequence(&self) -> u64 {
        *self.sequence_number.lock()
    }

    /// Delete every entry up to sequence number (inclusive); returns how many went
    pub fn truncate(&self, up_to_seq: u64) -> Result<usize> {
        let mut batch = WriteBatch::default();
        let mut removed = 0;

        let mut iter = self.db.raw_iterator();
        iter.seek_to_first();
        while iter.valid() {
            let Some(key) = iter.key() else { break };
            if decode_seq(key)? > up_to_seq {
                break;
            }
            batch.delete(key);
            removed += 1;
            iter.next();
        }
        iter.status()?;
        drop(iter);

        if removed > 0 {
            self.db.write(batch)?;
        }
        Ok(removed)
    }

    /// Compact WAL (remove old entries, keep the last `keep_last_n`)
    pub fn compact(&self, keep_last_n: u64) -> Result<usize> {
        let current_seq = self.next_sequence();

        if current_seq > keep_last_n {
            return self.truncate(current_seq - keep_last_n - 1);
        }
        Ok(0)
    }

    /// Sync WAL to disk
    pub fn sync(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

fn decode_seq(key: &[u8]) -> Result<u64> {
    let bytes: [u8; 8] = key
        .try_into()
        .map_err(|_| PersistenceError::WalError(format!("Invalid key of {} bytes", key.len())))?;
    Ok(u64::from_be_bytes(bytes))
}

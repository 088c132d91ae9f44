//! Job record persistence seam
//!
//! One opaque JSON record per conversion, keyed by the original instance
//! id. The machine only needs get/put plus idempotent creation of the
//! backing table; reads must be strongly consistent so a `load` right
//! after a `save` observes the just-written value.

use crate::error::{ConvertError, Result};
use crate::record::JobRecord;
use async_trait::async_trait;

/// Outcome of `ensure_table`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureTable {
    Created,
    AlreadyExists,
}

/// Record store seam (DynamoDB in production, in-memory in tests)
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Idempotently create the backing table.
    async fn ensure_table(&self) -> Result<EnsureTable>;

    /// Load the record for an instance id, or `None` when absent.
    async fn load(&self, instance_id: &str) -> Result<Option<JobRecord>>;

    /// Overwrite the record.
    async fn save(&self, record: &JobRecord) -> Result<()>;

    /// Delete the record (operator escape hatch: `--reset-step` to the
    /// first step discards the job entirely).
    async fn delete(&self, instance_id: &str) -> Result<()>;
}

/// Helper for store implementations mapping backend errors.
pub fn persistence_error(context: &str, err: impl std::fmt::Display) -> ConvertError {
    ConvertError::Persistence(format!("{context}: {err}"))
}

/// In-memory store used by tests and dry runs.
pub mod memory {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// HashMap-backed `RecordStore`
    #[derive(Default)]
    pub struct MemoryStore {
        records: Mutex<HashMap<String, JobRecord>>,
    }

    impl MemoryStore {
        pub fn new() -> Self {
            Self::default()
        }

        /// Direct snapshot of a stored record, bypassing the trait.
        pub fn get(&self, instance_id: &str) -> Option<JobRecord> {
            self.records.lock().unwrap().get(instance_id).cloned()
        }
    }

    #[async_trait]
    impl RecordStore for MemoryStore {
        async fn ensure_table(&self) -> Result<EnsureTable> {
            Ok(EnsureTable::AlreadyExists)
        }

        async fn load(&self, instance_id: &str) -> Result<Option<JobRecord>> {
            Ok(self.records.lock().unwrap().get(instance_id).cloned())
        }

        async fn save(&self, record: &JobRecord) -> Result<()> {
            self.records
                .lock()
                .unwrap()
                .insert(record.instance_id.clone(), record.clone());
            Ok(())
        }

        async fn delete(&self, instance_id: &str) -> Result<()> {
            self.records.lock().unwrap().remove(instance_id);
            Ok(())
        }
    }
}

use std::sync::Arc;

use tokio::sync::Mutex;

use crate::history::{HistoryRecord, HistoryStore, HistoryStoreError, LastSuccessMap};
use crate::orchestrator::AttemptStatus;

#[derive(Debug, Default)]
struct Inner {
    records: Vec<HistoryRecord>,
}

/// History kept in process memory, used by tests and dry runs.
#[derive(Debug, Clone)]
pub struct MemoryHistoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryHistoryStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    /// Every record in insertion order.
    pub async fn records(&self) -> Vec<HistoryRecord> {
        let inner = self.inner.lock().await;

        inner.records.clone()
    }
}

impl Default for MemoryHistoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl HistoryStore for MemoryHistoryStore {
    async fn record(&self, record: HistoryRecord) -> Result<(), HistoryStoreError> {
        let mut inner = self.inner.lock().await;
        inner.records.push(record);

        Ok(())
    }

    async fn last_success_map(&self) -> Result<LastSuccessMap, HistoryStoreError> {
        let inner = self.inner.lock().await;

        let mut map = LastSuccessMap::new();
        for record in inner
            .records
            .iter()
            .filter(|record| record.status == AttemptStatus::Success)
        {
            let key = (record.namespace.clone(), record.claim_name.clone());
            let entry = map.entry(key).or_insert(record.timestamp);
            if record.timestamp > *entry {
                *entry = record.timestamp;
            }
        }

        Ok(map)
    }

    async fn recent(&self, limit: usize) -> Result<Vec<HistoryRecord>, HistoryStoreError> {
        let inner = self.inner.lock().await;

        // Reverse first so the stable sort keeps newer insertions ahead on ties.
        let mut records: Vec<HistoryRecord> = inner.records.iter().rev().cloned().collect();
        records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        records.truncate(limit);

        Ok(records)
    }

    async fn count(&self) -> Result<u64, HistoryStoreError> {
        let inner = self.inner.lock().await;

        Ok(inner.records.len() as u64)
    }
}

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::time::Instant;

use super::PersistentStore;
use crate::caching::KeyPattern;

#[derive(Debug)]
struct Record {
    value: Vec<u8>,
    expires_at: Instant,
}

/// A [`PersistentStore`] that only lives as long as the process.
///
/// Useful in tests, and to share persisted values between multiple caches of one process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<String, Record>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> MutexGuard<'_, HashMap<String, Record>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The number of stored records, including expired ones.
    pub fn len(&self) -> usize {
        self.records().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl PersistentStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut records = self.records();
        let expired = match records.get(key) {
            None => return Ok(None),
            Some(record) => record.expires_at <= Instant::now(),
        };
        if expired {
            records.remove(key);
            return Ok(None);
        }
        Ok(records.get(key).map(|record| record.value.clone()))
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()> {
        let record = Record {
            value,
            expires_at: Instant::now() + ttl,
        };
        self.records().insert(key.to_owned(), record);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.records().remove(key);
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.records().clear();
        Ok(())
    }

    async fn delete_matching(&self, pattern: &KeyPattern) -> Result<usize> {
        let mut records = self.records();
        let before = records.len();
        records.retain(|key, _| !pattern.matches(key));
        Ok(before - records.len())
    }
}

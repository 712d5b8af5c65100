use std::collections::HashMap;

use tokio::sync::RwLock;

use super::{SampleStore, SettingsStore, WindowSnapshot};
use crate::{domain::Sample, error::StorageError};

#[derive(Default)]
struct Inner {
    /// Kept sorted by (timestamp, insertion order).
    samples: Vec<Sample>,
    settings: HashMap<String, String>,
}

/// Process-local store, used by tests and by tooling that has no database.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.samples.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

fn insert_sorted(samples: &mut Vec<Sample>, sample: Sample) {
    // Equal timestamps keep arrival order.
    let idx = samples.partition_point(|s| s.timestamp <= sample.timestamp);
    samples.insert(idx, sample);
}

fn range(samples: &[Sample], start: i64, end: i64) -> Vec<Sample> {
    samples
        .iter()
        .filter(|s| s.timestamp >= start && s.timestamp < end)
        .copied()
        .collect()
}

fn last_before(samples: &[Sample], ts: i64) -> Option<Sample> {
    let idx = samples.partition_point(|s| s.timestamp < ts);
    idx.checked_sub(1).map(|i| samples[i])
}

#[async_trait::async_trait]
impl SampleStore for MemoryStore {
    async fn append(&self, sample: Sample) -> Result<(), StorageError> {
        insert_sorted(&mut self.inner.write().await.samples, sample);
        Ok(())
    }

    async fn append_batch(&self, samples: &[Sample]) -> Result<(), StorageError> {
        let mut inner = self.inner.write().await;
        for sample in samples {
            insert_sorted(&mut inner.samples, *sample);
        }
        Ok(())
    }

    async fn query_range(&self, start: i64, end: i64) -> Result<Vec<Sample>, StorageError> {
        Ok(range(&self.inner.read().await.samples, start, end))
    }

    async fn most_recent_before(&self, ts: i64) -> Result<Option<Sample>, StorageError> {
        Ok(last_before(&self.inner.read().await.samples, ts))
    }

    async fn most_recent(&self) -> Result<Option<Sample>, StorageError> {
        Ok(self.inner.read().await.samples.last().copied())
    }

    async fn all(&self) -> Result<Vec<Sample>, StorageError> {
        Ok(self.inner.read().await.samples.clone())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<Sample>, StorageError> {
        Ok(self
            .inner
            .read()
            .await
            .samples
            .iter()
            .rev()
            .take(limit)
            .copied()
            .collect())
    }

    async fn window(&self, start: i64, end: i64) -> Result<WindowSnapshot, StorageError> {
        let inner = self.inner.read().await;
        Ok(WindowSnapshot {
            carry_in: last_before(&inner.samples, start).map(|s| s.count),
            samples: range(&inner.samples, start, end),
        })
    }
}

#[async_trait::async_trait]
impl SettingsStore for MemoryStore {
    async fn get(&self, key: &str, default: &str) -> Result<String, StorageError> {
        Ok(self
            .inner
            .read()
            .await
            .settings
            .get(key)
            .cloned()
            .unwrap_or_else(|| default.to_string()))
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.inner
            .write()
            .await
            .settings
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn set_many(&self, entries: &[(String, String)]) -> Result<(), StorageError> {
        let mut inner = self.inner.write().await;
        for (k, v) in entries {
            inner.settings.insert(k.clone(), v.clone());
        }
        Ok(())
    }
}

//! Storage collaborators consulted by the engine.

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::{domain::Sample, error::StorageError};

/// Carry-in count and in-window samples read from one consistent view.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WindowSnapshot {
    /// Count of the most recent sample strictly before the window start.
    pub carry_in: Option<i64>,
    /// Samples with `start <= timestamp < end`, ascending by (timestamp, insertion).
    pub samples: Vec<Sample>,
}

/// Durable, append-only log of counter samples.
#[async_trait::async_trait]
pub trait SampleStore: Send + Sync {
    async fn append(&self, sample: Sample) -> Result<(), StorageError>;

    async fn append_batch(&self, samples: &[Sample]) -> Result<(), StorageError> {
        for sample in samples {
            self.append(*sample).await?;
        }
        Ok(())
    }

    async fn query_range(&self, start: i64, end: i64) -> Result<Vec<Sample>, StorageError>;

    async fn most_recent_before(&self, ts: i64) -> Result<Option<Sample>, StorageError>;

    async fn most_recent(&self) -> Result<Option<Sample>, StorageError>;

    /// Every sample, oldest first.
    async fn all(&self) -> Result<Vec<Sample>, StorageError>;

    /// Up to `limit` samples, newest first.
    async fn recent(&self, limit: usize) -> Result<Vec<Sample>, StorageError>;

    /// Implementations that can should read both halves under one snapshot.
    async fn window(&self, start: i64, end: i64) -> Result<WindowSnapshot, StorageError> {
        let carry_in = self.most_recent_before(start).await?.map(|s| s.count);
        let samples = self.query_range(start, end).await?;
        Ok(WindowSnapshot { carry_in, samples })
    }
}

/// String key/value map for configuration and engine state records.
#[async_trait::async_trait]
pub trait SettingsStore: Send + Sync {
    async fn get(&self, key: &str, default: &str) -> Result<String, StorageError>;

    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;

    /// Writes all entries or none of them.
    async fn set_many(&self, entries: &[(String, String)]) -> Result<(), StorageError>;
}

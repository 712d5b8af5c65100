use serde::{Deserialize, Serialize};

/// One cumulative counter reading as reported by the pulse counter.
///
/// `timestamp` is event time in unix seconds. Samples sharing a timestamp are
/// ordered by insertion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Sample {
    pub timestamp: i64,
    pub count: i64,
}

impl Sample {
    pub fn new(timestamp: i64, count: i64) -> Self {
        Self { timestamp, count }
    }
}

//! Typed client for the shared in-memory store.
//!
//! The store is authoritative for all live matchmaking state (queues,
//! matches, statuses, locks, counters). The [`Store`] trait captures the
//! narrow command set the service needs; [`RedisStore`] is the production
//! adapter and [`MemoryStore`] backs tests and single-instance runs without
//! an external store.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

mod memory;
mod redis;

pub use memory::MemoryStore;
pub use redis::RedisStore;

pub type SharedStore = Arc<dyn Store>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("store backend error: {0}")]
    Backend(String),
}

/// Narrow command surface over the shared store. All values are text;
/// structured data is JSON-encoded by callers.
#[async_trait]
pub trait Store: Send + Sync {
    /// Sorted-set insert; replaces the member's score if it already exists.
    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError>;

    /// All members with scores, ascending by (score, member).
    async fn zrange_withscores(&self, key: &str) -> Result<Vec<(String, f64)>, StoreError>;

    /// Remove a member; `true` if it was present.
    async fn zrem(&self, key: &str, member: &str) -> Result<bool, StoreError>;

    async fn zcard(&self, key: &str) -> Result<u64, StoreError>;

    /// Remove every member with score <= `max_score`; returns removed count.
    async fn zrembyscore(&self, key: &str, max_score: f64) -> Result<u64, StoreError>;

    async fn hset(&self, key: &str, fields: &[(String, String)]) -> Result<(), StoreError>;

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, StoreError>;

    async fn hincrby(&self, key: &str, field: &str, delta: i64) -> Result<i64, StoreError>;

    /// SET if absent with a millisecond expiry; `true` when the key was set.
    async fn set_nx_px(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Atomically delete the key only when its current value equals
    /// `expected`; `true` when a deletion happened.
    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, StoreError>;

    /// Pattern-based key enumeration. Garbage collection only; never on the
    /// pairing hot path.
    async fn keys(&self, pattern: &str) -> Result<Vec<String>, StoreError>;

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Connection liveness, used by readiness probes.
    async fn ping(&self) -> Result<(), StoreError>;

    fn backend_name(&self) -> &'static str;
}

/// Shared-store key layout.
pub mod keys {
    use chrono::NaiveDate;

    pub const ROUND_QUEUE_PATTERN: &str = "queue:round:*";

    pub fn round_queue(round_number: u32) -> String {
        format!("queue:round:{round_number}")
    }

    pub fn match_record(match_id: &str) -> String {
        format!("match:{match_id}")
    }

    pub fn participant_status(participant_id: &str) -> String {
        format!("participant:{participant_id}:status")
    }

    pub fn round_lock(round_number: u32) -> String {
        format!("matchlock:round:{round_number}")
    }

    pub fn daily_stats(date: NaiveDate) -> String {
        format!("stats:{}", date.format("%Y-%m-%d"))
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn key_layout_is_stable() {
            assert_eq!(round_queue(3), "queue:round:3");
            assert_eq!(match_record("abc"), "match:abc");
            assert_eq!(participant_status("p1"), "participant:p1:status");
            assert_eq!(round_lock(7), "matchlock:round:7");
            let date = NaiveDate::from_ymd_opt(2026, 2, 7).unwrap();
            assert_eq!(daily_stats(date), "stats:2026-02-07");
        }
    }
}

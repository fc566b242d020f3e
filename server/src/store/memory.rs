//! In-process store adapter.
//!
//! Implements the same contract as the Redis adapter over a mutex-guarded
//! map, with lazy TTL expiry. Used by the test suite and by single-instance
//! deployments that run without an external store.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{Store, StoreError};

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Hash(HashMap<String, String>),
    Sorted(Vec<(String, f64)>),
}

impl Value {
    fn type_name(&self) -> &'static str {
        match self {
            Self::Str(_) => "string",
            Self::Hash(_) => "hash",
            Self::Sorted(_) => "zset",
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|deadline| deadline <= now)
    }
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn wrong_type(key: &str, found: &Value) -> StoreError {
    StoreError::Backend(format!(
        "key {key} holds a {} value, wrong operation type",
        found.type_name()
    ))
}

/// Ascending by (score, member), matching sorted-set iteration order.
fn sort_members(members: &mut [(String, f64)]) {
    members.sort_by(|a, b| {
        a.1.partial_cmp(&b.1)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
}

#[async_trait]
impl Store for MemoryStore {
    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError> {
        let mut map = self.inner.lock();
        drop_expired(&mut map, key);
        let entry = map.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::Sorted(Vec::new()),
            expires_at: None,
        });
        match &mut entry.value {
            Value::Sorted(members) => {
                members.retain(|(m, _)| m != member);
                members.push((member.to_string(), score));
                sort_members(members);
                Ok(())
            }
            other => Err(wrong_type(key, other)),
        }
    }

    async fn zrange_withscores(&self, key: &str) -> Result<Vec<(String, f64)>, StoreError> {
        let mut map = self.inner.lock();
        drop_expired(&mut map, key);
        match map.get(key).map(|e| &e.value) {
            None => Ok(Vec::new()),
            Some(Value::Sorted(members)) => Ok(members.clone()),
            Some(other) => Err(wrong_type(key, other)),
        }
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let mut map = self.inner.lock();
        drop_expired(&mut map, key);
        match map.get_mut(key).map(|e| &mut e.value) {
            None => Ok(false),
            Some(Value::Sorted(members)) => {
                let before = members.len();
                members.retain(|(m, _)| m != member);
                Ok(members.len() < before)
            }
            Some(other) => Err(wrong_type(key, other)),
        }
    }

    async fn zcard(&self, key: &str) -> Result<u64, StoreError> {
        let mut map = self.inner.lock();
        drop_expired(&mut map, key);
        match map.get(key).map(|e| &e.value) {
            None => Ok(0),
            Some(Value::Sorted(members)) => Ok(members.len() as u64),
            Some(other) => Err(wrong_type(key, other)),
        }
    }

    async fn zrembyscore(&self, key: &str, max_score: f64) -> Result<u64, StoreError> {
        let mut map = self.inner.lock();
        drop_expired(&mut map, key);
        match map.get_mut(key).map(|e| &mut e.value) {
            None => Ok(0),
            Some(Value::Sorted(members)) => {
                let before = members.len();
                members.retain(|(_, score)| *score > max_score);
                Ok((before - members.len()) as u64)
            }
            Some(other) => Err(wrong_type(key, other)),
        }
    }

    async fn hset(&self, key: &str, fields: &[(String, String)]) -> Result<(), StoreError> {
        let mut map = self.inner.lock();
        drop_expired(&mut map, key);
        let entry = map.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::Hash(HashMap::new()),
            expires_at: None,
        });
        match &mut entry.value {
            Value::Hash(hash) => {
                for (field, value) in fields {
                    hash.insert(field.clone(), value.clone());
                }
                Ok(())
            }
            other => Err(wrong_type(key, other)),
        }
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        let mut map = self.inner.lock();
        drop_expired(&mut map, key);
        match map.get(key).map(|e| &e.value) {
            None => Ok(HashMap::new()),
            Some(Value::Hash(hash)) => Ok(hash.clone()),
            Some(other) => Err(wrong_type(key, other)),
        }
    }

    async fn hincrby(&self, key: &str, field: &str, delta: i64) -> Result<i64, StoreError> {
        let mut map = self.inner.lock();
        drop_expired(&mut map, key);
        let entry = map.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::Hash(HashMap::new()),
            expires_at: None,
        });
        match &mut entry.value {
            Value::Hash(hash) => {
                let current = hash
                    .get(field)
                    .and_then(|v| v.parse::<i64>().ok())
                    .unwrap_or(0);
                let next = current + delta;
                hash.insert(field.to_string(), next.to_string());
                Ok(next)
            }
            other => Err(wrong_type(key, other)),
        }
    }

    async fn set_nx_px(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut map = self.inner.lock();
        drop_expired(&mut map, key);
        if map.contains_key(key) {
            return Ok(false);
        }
        map.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        let mut map = self.inner.lock();
        drop_expired(&mut map, key);
        let matches = matches!(
            map.get(key).map(|e| &e.value),
            Some(Value::Str(current)) if current == expected
        );
        if matches {
            map.remove(key);
        }
        Ok(matches)
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let mut map = self.inner.lock();
        let now = Instant::now();
        map.retain(|_, entry| !entry.is_expired(now));
        // Only prefix globs are used by the service (`queue:round:*`).
        let found = match pattern.strip_suffix('*') {
            Some(prefix) => map
                .keys()
                .filter(|k| k.starts_with(prefix))
                .cloned()
                .collect(),
            None => map
                .keys()
                .filter(|k| k.as_str() == pattern)
                .cloned()
                .collect(),
        };
        Ok(found)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut map = self.inner.lock();
        drop_expired(&mut map, key);
        if let Some(entry) = map.get_mut(key) {
            entry.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

fn drop_expired(map: &mut HashMap<String, Entry>, key: &str) {
    let expired = map
        .get(key)
        .is_some_and(|entry| entry.is_expired(Instant::now()));
    if expired {
        map.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_nx_px_only_sets_absent_keys() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(5);
        assert!(store.set_nx_px("lock", "owner-a", ttl).await.unwrap());
        assert!(!store.set_nx_px("lock", "owner-b", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn expired_keys_become_settable_again() {
        let store = MemoryStore::new();
        assert!(store
            .set_nx_px("lock", "owner-a", Duration::from_millis(10))
            .await
            .unwrap());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(store
            .set_nx_px("lock", "owner-b", Duration::from_secs(5))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn compare_and_delete_checks_value() {
        let store = MemoryStore::new();
        store
            .set_nx_px("lock", "owner-a", Duration::from_secs(5))
            .await
            .unwrap();
        assert!(!store.compare_and_delete("lock", "owner-b").await.unwrap());
        assert!(store.compare_and_delete("lock", "owner-a").await.unwrap());
        assert!(!store.compare_and_delete("lock", "owner-a").await.unwrap());
    }

    #[tokio::test]
    async fn sorted_sets_order_by_score_then_member() {
        let store = MemoryStore::new();
        store.zadd("q", "c", 3.0).await.unwrap();
        store.zadd("q", "a", 1.0).await.unwrap();
        store.zadd("q", "b2", 2.0).await.unwrap();
        store.zadd("q", "b1", 2.0).await.unwrap();

        let members: Vec<String> = store
            .zrange_withscores("q")
            .await
            .unwrap()
            .into_iter()
            .map(|(m, _)| m)
            .collect();
        assert_eq!(members, vec!["a", "b1", "b2", "c"]);

        // Re-adding replaces the score instead of duplicating the member.
        store.zadd("q", "a", 9.0).await.unwrap();
        assert_eq!(store.zcard("q").await.unwrap(), 4);
    }

    #[tokio::test]
    async fn zrembyscore_removes_up_to_cutoff() {
        let store = MemoryStore::new();
        store.zadd("q", "old-1", 100.0).await.unwrap();
        store.zadd("q", "old-2", 200.0).await.unwrap();
        store.zadd("q", "fresh", 900.0).await.unwrap();

        let removed = store.zrembyscore("q", 200.0).await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(store.zcard("q").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn hincrby_counts_from_zero() {
        let store = MemoryStore::new();
        assert_eq!(store.hincrby("stats", "joins", 1).await.unwrap(), 1);
        assert_eq!(store.hincrby("stats", "joins", 2).await.unwrap(), 3);
        let all = store.hgetall("stats").await.unwrap();
        assert_eq!(all.get("joins").map(String::as_str), Some("3"));
    }
}

//! Per-round matchmaking queues.
//!
//! Each round has a sorted set in the shared store keyed by join timestamp,
//! so FIFO order comes from the stored score rather than parse order.

use std::time::Duration;

use chrono::Utc;
use tracing::{debug, warn};

use crate::models::{ParticipantStatus, QueueEntry};
use crate::store::{keys, SharedStore, StoreError};

/// Sliding TTL on each round-queue key.
const QUEUE_KEY_TTL: Duration = Duration::from_secs(600);

/// Entries older than this are garbage-collected.
const ENTRY_MAX_AGE: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Added,
    /// The participant's status flipped to "matched" before the insert.
    RejectedAlreadyMatched,
    RejectedQueueFull,
}

#[derive(Clone)]
pub struct QueueService {
    store: SharedStore,
    max_queue_size: usize,
}

impl QueueService {
    pub fn new(store: SharedStore, max_queue_size: usize) -> Self {
        Self {
            store,
            max_queue_size,
        }
    }

    /// Append a participant to a round queue with score = now.
    ///
    /// Guards: a participant whose status is already "matched" is rejected
    /// (idempotence under racing pair attempts), as is a queue at capacity.
    pub async fn add_to_queue(&self, entry: &QueueEntry) -> Result<EnqueueOutcome, StoreError> {
        let status_key = keys::participant_status(&entry.participant_id);
        let status = self
            .store
            .hgetall(&status_key)
            .await?
            .get("status")
            .and_then(|s| ParticipantStatus::parse(s));
        if status == Some(ParticipantStatus::Matched) {
            debug!(
                participant_id = %entry.participant_id,
                "Rejecting enqueue, participant already matched"
            );
            return Ok(EnqueueOutcome::RejectedAlreadyMatched);
        }

        let queue_key = keys::round_queue(entry.round_number);
        if self.store.zcard(&queue_key).await? >= self.max_queue_size as u64 {
            warn!(
                round_number = entry.round_number,
                max_queue_size = self.max_queue_size,
                "Rejecting enqueue, round queue is full"
            );
            return Ok(EnqueueOutcome::RejectedQueueFull);
        }

        let member = serde_json::to_string(entry)
            .map_err(|e| StoreError::Backend(format!("failed to encode queue entry: {e}")))?;
        self.store
            .zadd(&queue_key, &member, entry.joined_at as f64)
            .await?;
        self.store.expire(&queue_key, QUEUE_KEY_TTL).await?;
        Ok(EnqueueOutcome::Added)
    }

    /// Linear scan for the member holding this participant, then remove it.
    /// Returns whether an entry was removed.
    pub async fn remove_from_queue(
        &self,
        round_number: u32,
        participant_id: &str,
    ) -> Result<bool, StoreError> {
        let queue_key = keys::round_queue(round_number);
        for (member, _) in self.store.zrange_withscores(&queue_key).await? {
            let parsed: Option<QueueEntry> = serde_json::from_str(&member).ok();
            if parsed.is_some_and(|e| e.participant_id == participant_id) {
                return self.store.zrem(&queue_key, &member).await;
            }
        }
        Ok(false)
    }

    /// Entries in FIFO order, optionally excluding one participant.
    /// Unparseable members are skipped (and logged) rather than failing the
    /// whole read.
    pub async fn get_queue_entries(
        &self,
        round_number: u32,
        exclude_participant_id: Option<&str>,
    ) -> Result<Vec<QueueEntry>, StoreError> {
        let queue_key = keys::round_queue(round_number);
        let members = self.store.zrange_withscores(&queue_key).await?;
        let mut entries = Vec::with_capacity(members.len());
        for (member, _) in members {
            match serde_json::from_str::<QueueEntry>(&member) {
                Ok(entry) => {
                    if exclude_participant_id != Some(entry.participant_id.as_str()) {
                        entries.push(entry);
                    }
                }
                Err(e) => {
                    warn!(round_number, error = %e, "Skipping malformed queue entry");
                }
            }
        }
        Ok(entries)
    }

    /// 1-based FIFO position, or -1 when the participant is not queued.
    pub async fn get_queue_position(
        &self,
        round_number: u32,
        participant_id: &str,
    ) -> Result<i64, StoreError> {
        let entries = self.get_queue_entries(round_number, None).await?;
        Ok(entries
            .iter()
            .position(|e| e.participant_id == participant_id)
            .map(|idx| idx as i64 + 1)
            .unwrap_or(-1))
    }

    pub async fn get_queue_size(&self, round_number: u32) -> Result<u64, StoreError> {
        self.store.zcard(&keys::round_queue(round_number)).await
    }

    /// Drop entries that have been waiting longer than five minutes across
    /// every round queue. Returns the number of removed entries.
    pub async fn cleanup_expired_queues(&self) -> Result<u64, StoreError> {
        let cutoff = (Utc::now().timestamp_millis() - ENTRY_MAX_AGE.as_millis() as i64) as f64;
        let mut removed = 0;
        for queue_key in self.store.keys(keys::ROUND_QUEUE_PATTERN).await? {
            removed += self.store.zrembyscore(&queue_key, cutoff).await?;
        }
        if removed > 0 {
            debug!(removed, "Expired queue entries cleaned up");
        }
        Ok(removed)
    }
}

/// Rough wait estimate surfaced to searching participants: with company in
/// the queue a pair lands within a couple of scan ticks, alone the AI
/// fallback deadline is the bound.
pub fn estimate_wait_seconds(total_waiting: u64, fallback_timeout: Duration) -> u64 {
    if total_waiting > 1 {
        10
    } else {
        fallback_timeout.as_secs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TreatmentGroup;
    use crate::store::{MemoryStore, Store};
    use std::sync::Arc;

    fn service() -> QueueService {
        QueueService::new(Arc::new(MemoryStore::new()), 1_000)
    }

    fn entry(id: &str, round: u32, skill: f64, joined_at: i64) -> QueueEntry {
        QueueEntry {
            participant_id: id.to_string(),
            participant_name: None,
            round_number: round,
            skill_level: skill,
            treatment_group: TreatmentGroup::Control,
            joined_at,
            status: "waiting".to_string(),
        }
    }

    #[tokio::test]
    async fn add_then_remove_leaves_size_unchanged() {
        let queues = service();
        let baseline = queues.get_queue_size(1).await.unwrap();

        queues
            .add_to_queue(&entry("p1", 1, 5.0, 1_000))
            .await
            .unwrap();
        assert_eq!(queues.get_queue_size(1).await.unwrap(), baseline + 1);

        assert!(queues.remove_from_queue(1, "p1").await.unwrap());
        assert_eq!(queues.get_queue_size(1).await.unwrap(), baseline);
    }

    #[tokio::test]
    async fn fifo_order_follows_score_not_insertion() {
        let queues = service();
        // Insert newest first; the stored score must still win.
        queues
            .add_to_queue(&entry("late", 1, 5.0, 3_000))
            .await
            .unwrap();
        queues
            .add_to_queue(&entry("early", 1, 5.0, 1_000))
            .await
            .unwrap();
        queues
            .add_to_queue(&entry("middle", 1, 5.0, 2_000))
            .await
            .unwrap();

        let order: Vec<String> = queues
            .get_queue_entries(1, None)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.participant_id)
            .collect();
        assert_eq!(order, vec!["early", "middle", "late"]);

        assert_eq!(queues.get_queue_position(1, "early").await.unwrap(), 1);
        assert_eq!(queues.get_queue_position(1, "late").await.unwrap(), 3);
        assert_eq!(queues.get_queue_position(1, "absent").await.unwrap(), -1);
    }

    #[tokio::test]
    async fn matched_participants_are_rejected() {
        let store: SharedStore = Arc::new(MemoryStore::new());
        let queues = QueueService::new(store.clone(), 1_000);
        store
            .hset(
                &keys::participant_status("p1"),
                &[("status".to_string(), "matched".to_string())],
            )
            .await
            .unwrap();

        let outcome = queues
            .add_to_queue(&entry("p1", 1, 5.0, 1_000))
            .await
            .unwrap();
        assert_eq!(outcome, EnqueueOutcome::RejectedAlreadyMatched);
        assert_eq!(queues.get_queue_size(1).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn full_queue_rejects_new_entries() {
        let queues = QueueService::new(Arc::new(MemoryStore::new()), 2);
        queues
            .add_to_queue(&entry("p1", 1, 5.0, 1_000))
            .await
            .unwrap();
        queues
            .add_to_queue(&entry("p2", 1, 5.0, 2_000))
            .await
            .unwrap();

        let outcome = queues
            .add_to_queue(&entry("p3", 1, 5.0, 3_000))
            .await
            .unwrap();
        assert_eq!(outcome, EnqueueOutcome::RejectedQueueFull);
    }

    #[tokio::test]
    async fn cleanup_drops_only_stale_entries() {
        let queues = service();
        let now = Utc::now().timestamp_millis();
        let stale = now - (6 * 60 * 1_000);

        queues.add_to_queue(&entry("old", 1, 5.0, stale)).await.unwrap();
        queues.add_to_queue(&entry("new", 1, 5.0, now)).await.unwrap();
        queues.add_to_queue(&entry("other-round", 2, 5.0, stale)).await.unwrap();

        let removed = queues.cleanup_expired_queues().await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(queues.get_queue_size(1).await.unwrap(), 1);
        assert_eq!(queues.get_queue_size(2).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn exclusion_filters_self() {
        let queues = service();
        queues.add_to_queue(&entry("p1", 1, 5.0, 1_000)).await.unwrap();
        queues.add_to_queue(&entry("p2", 1, 5.0, 2_000)).await.unwrap();

        let others = queues.get_queue_entries(1, Some("p1")).await.unwrap();
        assert_eq!(others.len(), 1);
        assert_eq!(others[0].participant_id, "p2");
    }
}

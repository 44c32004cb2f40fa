//! In-memory stand-ins for PostgreSQL and ClickHouse used by unit tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use idempotent_consumer::MarkerKind;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use transactional_outbox::{OutboxEntry, OutboxError, OutboxRepository, OutboxResult, OutboxStatus};
use uuid::Uuid;

use crate::db::{AnalyticsWriter, DedupStore, DedupTransaction};
use crate::error::{AppError, Result};
use crate::models::{AnalyticsEventRow, Event};

pub fn raw_event(event_id: &str, user_id: &str, occurred_at: &str) -> serde_json::Value {
    serde_json::json!({
        "event_id": event_id,
        "occurred_at": occurred_at,
        "user_id": user_id,
        "event_type": "page_view",
        "properties": {"page": "/home"},
    })
}

#[derive(Default)]
struct State {
    event_markers: HashMap<String, DateTime<Utc>>,
    batch_markers: HashMap<String, DateTime<Utc>>,
    hot_events: HashMap<String, Event>,
    outbox: HashMap<Uuid, OutboxEntry>,
}

/// Committed state shared by every transaction. Implements both the dedup
/// store and the outbox repository, like the single PostgreSQL database.
#[derive(Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
    fail_next_commit: Arc<AtomicBool>,
}

impl MemoryStore {
    pub fn fail_next_commit(&self) {
        self.fail_next_commit.store(true, Ordering::SeqCst);
    }

    pub async fn event_marker_count(&self) -> usize {
        self.state.lock().await.event_markers.len()
    }

    pub async fn batch_marker_count(&self) -> usize {
        self.state.lock().await.batch_markers.len()
    }

    pub async fn hot_event_count(&self) -> usize {
        self.state.lock().await.hot_events.len()
    }

    pub async fn outbox_entries(&self) -> Vec<OutboxEntry> {
        let mut entries: Vec<_> = self.state.lock().await.outbox.values().cloned().collect();
        entries.sort_by_key(|e| e.created_at);
        entries
    }

    pub async fn insert_hot_event(&self, event: Event) {
        self.state
            .lock()
            .await
            .hot_events
            .insert(event.event_id.to_string(), event);
    }

    pub async fn insert_marker(&self, kind: MarkerKind, key: &str, at: DateTime<Utc>) {
        let mut state = self.state.lock().await;
        match kind {
            MarkerKind::Event => state.event_markers.insert(key.to_string(), at),
            MarkerKind::Batch => state.batch_markers.insert(key.to_string(), at),
        };
    }

    pub async fn insert_outbox(&self, entry: OutboxEntry) {
        self.state.lock().await.outbox.insert(entry.id, entry);
    }
}

#[async_trait]
impl DedupStore for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn DedupTransaction>> {
        Ok(Box::new(MemoryTransaction {
            state: self.state.clone(),
            fail_commit: self.fail_next_commit.swap(false, Ordering::SeqCst),
            event_markers: Vec::new(),
            batch_markers: Vec::new(),
            hot_events: Vec::new(),
            outbox: Vec::new(),
        }))
    }

    async fn delete_hot_events_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state.lock().await;
        let before = state.hot_events.len();
        state.hot_events.retain(|_, e| e.occurred_at >= cutoff);
        Ok((before - state.hot_events.len()) as u64)
    }

    async fn compact_markers(&self, kind: MarkerKind, retention: Duration) -> Result<u64> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(retention)
                .map_err(|e| AppError::Validation(e.to_string()))?;
        let mut state = self.state.lock().await;
        let markers = match kind {
            MarkerKind::Event => &mut state.event_markers,
            MarkerKind::Batch => &mut state.batch_markers,
        };
        let before = markers.len();
        markers.retain(|_, at| *at >= cutoff);
        Ok((before - markers.len()) as u64)
    }
}

/// Buffers writes until commit; dropping it discards them.
struct MemoryTransaction {
    state: Arc<Mutex<State>>,
    fail_commit: bool,
    event_markers: Vec<String>,
    batch_markers: Vec<String>,
    hot_events: Vec<Event>,
    outbox: Vec<OutboxEntry>,
}

#[async_trait]
impl DedupTransaction for MemoryTransaction {
    async fn event_seen(&mut self, event_id: &str) -> Result<bool> {
        if self.event_markers.iter().any(|k| k == event_id) {
            return Ok(true);
        }
        Ok(self.state.lock().await.event_markers.contains_key(event_id))
    }

    async fn record_event(&mut self, event: &Event) -> Result<bool> {
        let key = event.event_id.to_string();
        if self.event_seen(&key).await? {
            return Ok(false);
        }
        self.event_markers.push(key);
        self.hot_events.push(event.clone());
        Ok(true)
    }

    async fn claim_batch(&mut self, batch_key: &str) -> Result<bool> {
        if self.batch_markers.iter().any(|k| k == batch_key)
            || self.state.lock().await.batch_markers.contains_key(batch_key)
        {
            return Ok(false);
        }
        self.batch_markers.push(batch_key.to_string());
        Ok(true)
    }

    async fn stage_outbox(&mut self, entry: &OutboxEntry) -> Result<()> {
        self.outbox.push(entry.clone());
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        if self.fail_commit {
            return Err(AppError::Database("connection reset during commit".into()));
        }

        let now = Utc::now();
        let mut state = self.state.lock().await;
        for key in self.event_markers {
            state.event_markers.insert(key, now);
        }
        for key in self.batch_markers {
            state.batch_markers.insert(key, now);
        }
        for event in self.hot_events {
            state.hot_events.insert(event.event_id.to_string(), event);
        }
        for entry in self.outbox {
            state.outbox.insert(entry.id, entry);
        }
        Ok(())
    }
}

#[async_trait]
impl OutboxRepository for MemoryStore {
    async fn claim_due(&self, limit: i64, lease: Duration) -> OutboxResult<Vec<OutboxEntry>> {
        let now = Utc::now();
        let lease = chrono::Duration::from_std(lease)
            .map_err(|e| OutboxError::Other(anyhow::anyhow!(e)))?;
        let mut state = self.state.lock().await;
        let mut due: Vec<&mut OutboxEntry> = state
            .outbox
            .values_mut()
            .filter(|e| e.status == OutboxStatus::Pending && e.next_attempt_at <= now)
            .collect();
        due.sort_by_key(|e| e.created_at);
        Ok(due
            .into_iter()
            .take(limit as usize)
            .map(|e| {
                e.next_attempt_at = now + lease;
                e.clone()
            })
            .collect())
    }

    async fn mark_delivered(&self, id: Uuid) -> OutboxResult<()> {
        let mut state = self.state.lock().await;
        let entry = state.outbox.get_mut(&id).ok_or(OutboxError::EntryNotFound(id))?;
        entry.status = OutboxStatus::Delivered;
        entry.delivered_at = Some(Utc::now());
        Ok(())
    }

    async fn mark_failed(
        &self,
        id: Uuid,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> OutboxResult<()> {
        let mut state = self.state.lock().await;
        let entry = state.outbox.get_mut(&id).ok_or(OutboxError::EntryNotFound(id))?;
        entry.attempts += 1;
        entry.last_error = Some(error.to_string());
        entry.next_attempt_at = next_attempt_at;
        Ok(())
    }

    async fn mark_dead(&self, id: Uuid, error: &str) -> OutboxResult<()> {
        let mut state = self.state.lock().await;
        let entry = state.outbox.get_mut(&id).ok_or(OutboxError::EntryNotFound(id))?;
        entry.attempts += 1;
        entry.status = OutboxStatus::Dead;
        entry.last_error = Some(error.to_string());
        Ok(())
    }

    async fn replay_dead(&self, limit: i64) -> OutboxResult<u64> {
        let mut state = self.state.lock().await;
        let mut count = 0;
        for entry in state
            .outbox
            .values_mut()
            .filter(|e| e.status == OutboxStatus::Dead)
            .take(limit as usize)
        {
            entry.status = OutboxStatus::Pending;
            entry.attempts = 0;
            entry.next_attempt_at = Utc::now();
            count += 1;
        }
        Ok(count)
    }

    async fn replay_undelivered_since(&self, since: DateTime<Utc>) -> OutboxResult<u64> {
        let mut state = self.state.lock().await;
        let mut count = 0;
        for entry in state
            .outbox
            .values_mut()
            .filter(|e| e.status != OutboxStatus::Delivered && e.created_at >= since)
        {
            entry.status = OutboxStatus::Pending;
            entry.attempts = 0;
            entry.last_error = None;
            entry.next_attempt_at = Utc::now();
            count += 1;
        }
        Ok(count)
    }

    async fn purge_delivered_before(&self, cutoff: DateTime<Utc>) -> OutboxResult<u64> {
        let mut state = self.state.lock().await;
        let before = state.outbox.len();
        state
            .outbox
            .retain(|_, e| !(e.status == OutboxStatus::Delivered && e.created_at < cutoff));
        Ok((before - state.outbox.len()) as u64)
    }

    async fn pending_stats(&self) -> OutboxResult<(i64, i64)> {
        let state = self.state.lock().await;
        let pending = state
            .outbox
            .values()
            .filter(|e| e.status == OutboxStatus::Pending)
            .count();
        Ok((pending as i64, 0))
    }
}

/// Analytical writer that records every call and honours dedup tokens the
/// way the store does. The first `failures` calls fail.
#[derive(Default)]
pub struct RecordingWriter {
    writes: Mutex<Vec<(Uuid, Vec<AnalyticsEventRow>)>>,
    calls: AtomicUsize,
    failures: usize,
}

impl RecordingWriter {
    pub fn failing(failures: usize) -> Self {
        Self {
            failures,
            ..Default::default()
        }
    }

    /// Accepted writes, one per distinct token
    pub async fn writes(&self) -> Vec<(Uuid, Vec<AnalyticsEventRow>)> {
        self.writes.lock().await.clone()
    }

    pub async fn rows_written(&self) -> usize {
        self.writes.lock().await.iter().map(|(_, rows)| rows.len()).sum()
    }

    /// All calls, including failed and deduplicated ones
    pub async fn write_calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AnalyticsWriter for RecordingWriter {
    async fn write_events(&self, rows: &[AnalyticsEventRow], dedup_token: Uuid) -> Result<()> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Err(AppError::ClickHouse("connection refused".into()));
        }

        let mut writes = self.writes.lock().await;
        if !writes.iter().any(|(token, _)| *token == dedup_token) {
            writes.push((dedup_token, rows.to_vec()));
        }
        Ok(())
    }
}

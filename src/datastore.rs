//! Archive storage seam
//!
//! The archiver and replay pacer talk to storage through [`Datastore`], so
//! the backing store can be swapped without touching either. The in-memory
//! implementation backs tests and single-process deployments; a SQL-backed
//! implementation would satisfy the same contract.
//!
//! Telemetry inserts are keyed by the frame's dedup id and are idempotent:
//! re-inserting an already archived row is a reported no-op, never an error.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::commands::CommandPayload;
use crate::datagram::TelemetryRecord;
use crate::tags::Tag;

/// Storage contract for archived telemetry, tags, and display commands.
#[async_trait]
pub trait Datastore: Send + Sync {
    /// Archive a record unless a row with the same dedup id exists.
    /// Returns `true` when a new row was written.
    async fn insert_or_ignore(&self, record: &TelemetryRecord) -> Result<bool>;

    /// Records received inside `[start, end)`, oldest first. An open `end`
    /// runs to the newest row.
    async fn query_range(
        &self,
        start: DateTime<Utc>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<TelemetryRecord>>;

    /// Archive a tag; later versions of the same tag id replace the row.
    async fn insert_tag(&self, tag: &Tag) -> Result<()>;

    /// Tags whose tagged moment falls inside `[start, end)`, oldest first.
    async fn query_tags(
        &self,
        start: DateTime<Utc>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<Tag>>;

    async fn get_tag(&self, tag_id: &str) -> Result<Option<Tag>>;

    /// Keep the newest command per command name.
    async fn upsert_command(&self, command: &CommandPayload) -> Result<()>;

    async fn latest_command(&self, name: &str) -> Result<Option<CommandPayload>>;

    async fn count_records(&self) -> Result<u64>;
}

#[derive(Default)]
struct MemoryState {
    records: HashMap<String, TelemetryRecord>,
    tags: HashMap<String, Tag>,
    commands: HashMap<String, CommandPayload>,
}

/// Mutex-guarded in-memory archive.
#[derive(Default)]
pub struct MemoryDatastore {
    state: Mutex<MemoryState>,
}

impl MemoryDatastore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Datastore for MemoryDatastore {
    async fn insert_or_ignore(&self, record: &TelemetryRecord) -> Result<bool> {
        let key = record.dedup_id().to_string();
        let mut state = self.state.lock().expect("datastore mutex poisoned");
        if state.records.contains_key(&key) {
            return Ok(false);
        }
        state.records.insert(key, record.clone());
        Ok(true)
    }

    async fn query_range(
        &self,
        start: DateTime<Utc>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<TelemetryRecord>> {
        let start_ms = start.timestamp_millis();
        let end_ms = end.map(|e| e.timestamp_millis());
        let state = self.state.lock().expect("datastore mutex poisoned");
        let mut hits: Vec<TelemetryRecord> = state
            .records
            .values()
            .filter(|r| {
                r.recv_epoch_ms >= start_ms && end_ms.map_or(true, |e| r.recv_epoch_ms < e)
            })
            .cloned()
            .collect();
        hits.sort_by_key(|r| (r.recv_epoch_ms, r.frame.sensor_id));
        Ok(hits)
    }

    async fn insert_tag(&self, tag: &Tag) -> Result<()> {
        let mut state = self.state.lock().expect("datastore mutex poisoned");
        state.tags.insert(tag.id.clone(), tag.clone());
        Ok(())
    }

    async fn query_tags(
        &self,
        start: DateTime<Utc>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<Tag>> {
        let state = self.state.lock().expect("datastore mutex poisoned");
        let mut hits: Vec<Tag> = state
            .tags
            .values()
            .filter(|t| t.ts >= start && end.map_or(true, |e| t.ts < e))
            .cloned()
            .collect();
        hits.sort_by_key(|t| (t.ts, t.id.clone()));
        Ok(hits)
    }

    async fn get_tag(&self, tag_id: &str) -> Result<Option<Tag>> {
        let state = self.state.lock().expect("datastore mutex poisoned");
        Ok(state.tags.get(tag_id).cloned())
    }

    async fn upsert_command(&self, command: &CommandPayload) -> Result<()> {
        let mut state = self.state.lock().expect("datastore mutex poisoned");
        let keep = match state.commands.get(&command.name) {
            Some(existing) => command.ts >= existing.ts,
            None => true,
        };
        if keep {
            state.commands.insert(command.name.clone(), command.clone());
        }
        Ok(())
    }

    async fn latest_command(&self, name: &str) -> Result<Option<CommandPayload>> {
        let state = self.state.lock().expect("datastore mutex poisoned");
        Ok(state.commands.get(name).cloned())
    }

    async fn count_records(&self) -> Result<u64> {
        let state = self.state.lock().expect("datastore mutex poisoned");
        Ok(state.records.len() as u64)
    }
}

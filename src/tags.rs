//! Range event tags
//!
//! Tags are operator-created annotations pinned to a moment in range time.
//! They ride the broker as JSON on a broadcast subject and are archived next
//! to telemetry so replays can interleave them at the right position.

use std::collections::HashMap;

use anyhow::Result;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::broker::Broker;
use crate::subjects::{MSG_ID_HEADER, TAG_BROADCAST_SUBJECT};

/// Lifecycle state of a tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TagStatus {
    Active,
    Updated,
    Deleted,
}

/// An annotation attached to a point in time on the range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tag {
    pub id: String,
    /// Moment the tag refers to, not the moment it was created.
    pub ts: DateTime<Utc>,
    pub label: String,
    #[serde(default)]
    pub notes: Option<String>,
    pub creator: String,
    pub status: TagStatus,
    pub updated_ts: DateTime<Utc>,
}

impl Tag {
    pub fn new(ts: DateTime<Utc>, label: impl Into<String>, creator: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            ts,
            label: label.into(),
            notes: None,
            creator: creator.into(),
            status: TagStatus::Active,
            updated_ts: Utc::now(),
        }
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }

    /// Epoch milliseconds of the tagged moment, for merge ordering against
    /// telemetry records.
    pub fn epoch_ms(&self) -> i64 {
        self.ts.timestamp_millis()
    }
}

/// Publishes tags onto the broadcast subject.
pub struct TagSender {
    broker: Broker,
}

impl TagSender {
    pub fn new(broker: Broker) -> Self {
        Self { broker }
    }

    /// Broadcast a tag. The broker message id is the tag id, so re-sends of
    /// the same tag are suppressed downstream.
    pub fn send(&self, tag: &Tag) -> Result<()> {
        let payload = Bytes::from(serde_json::to_vec(tag)?);
        let headers = HashMap::from([(MSG_ID_HEADER.to_string(), tag.id.clone())]);
        self.broker.publish(TAG_BROADCAST_SUBJECT, payload, headers);
        info!(tag = %tag.id, label = %tag.label, ts = %tag.ts, "Tag broadcast");
        Ok(())
    }

    /// Create and broadcast a tag in one step.
    pub fn create(
        &self,
        ts: DateTime<Utc>,
        label: impl Into<String>,
        creator: impl Into<String>,
        notes: Option<String>,
    ) -> Result<Tag> {
        let mut tag = Tag::new(ts, label, creator);
        tag.notes = notes;
        self.send(&tag)?;
        Ok(tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[tokio::test]
    async fn send_publishes_json_with_tag_id_as_msg_id() {
        let broker = Broker::new(16);
        let mut sub = broker.subscribe([TAG_BROADCAST_SUBJECT]);
        let sender = TagSender::new(broker.clone());

        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let tag = Tag::new(ts, "missile away", "rso").with_notes("pad 3");
        sender.send(&tag).unwrap();

        let message = sub.recv().await.unwrap();
        assert_eq!(message.msg_id(), Some(tag.id.as_str()));
        let decoded: Tag = serde_json::from_slice(&message.payload).unwrap();
        assert_eq!(decoded, tag);
    }

    #[tokio::test]
    async fn resending_a_tag_is_suppressed() {
        let broker = Broker::new(16);
        let sender = TagSender::new(broker.clone());
        let tag = Tag::new(Utc::now(), "hold", "rso");

        sender.send(&tag).unwrap();
        sender.send(&tag).unwrap();

        assert_eq!(broker.published(), 1);
        assert_eq!(broker.suppressed(), 1);
    }

    #[test]
    fn tags_get_distinct_ids() {
        let ts = Utc::now();
        let a = Tag::new(ts, "a", "rso");
        let b = Tag::new(ts, "b", "rso");
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn epoch_ms_tracks_tagged_moment() {
        let ts = Utc.timestamp_millis_opt(1_700_000_123_456).unwrap();
        let tag = Tag::new(ts, "a", "rso");
        assert_eq!(tag.epoch_ms(), 1_700_000_123_456);
    }
}

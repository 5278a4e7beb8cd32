//! Replay pacer
//!
//! Re-emits archived telemetry on a replay channel at the original
//! inter-message spacing (optionally scaled). Records and tags are merged
//! into one timestamp-ordered sequence, so a consumer sees each annotation
//! at the same point in playback as it occurred live.
//!
//! Replayed records keep their original `recv_*` metadata; only the broker
//! message id changes (suffixed with the replay channel so dedup does not
//! swallow the replay copy) and an origin header marks the message as
//! replayed. Records ride the subject as MessagePack envelopes, tags as
//! JSON, same as their live counterparts.
//!
//! A pacer run is single-shot: cancellation halts any outstanding delay
//! promptly and the run cannot be resumed; a fresh run re-reads storage.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::broker::Broker;
use crate::channel::{Channel, ReplaySource};
use crate::datagram::TelemetryRecord;
use crate::datastore::Datastore;
use crate::subjects::{MSG_ID_HEADER, REPLAY_ORIGIN_HEADER};
use crate::tags::Tag;

/// One element of the merged playback sequence.
#[derive(Debug, Clone)]
enum ReplayItem {
    Record(TelemetryRecord),
    Tag(Tag),
}

impl ReplayItem {
    fn epoch_ms(&self) -> i64 {
        match self {
            ReplayItem::Record(record) => record.recv_epoch_ms,
            ReplayItem::Tag(tag) => tag.epoch_ms(),
        }
    }

    fn time_s(&self) -> Option<f64> {
        match self {
            ReplayItem::Record(record) => Some(record.frame.time_s()),
            ReplayItem::Tag(_) => None,
        }
    }
}

/// How a pacer run ended, with emission counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayOutcome {
    Completed { records: u64, tags: u64 },
    Cancelled { records: u64, tags: u64 },
}

pub struct ReplayPacer<D> {
    datastore: Arc<D>,
    broker: Broker,
}

impl<D: Datastore> ReplayPacer<D> {
    pub fn new(datastore: Arc<D>, broker: Broker) -> Self {
        Self { datastore, broker }
    }

    /// Resolve a source to its concrete time window. A tag source centers
    /// the window on the tagged moment.
    pub async fn resolve_window(
        &self,
        source: &ReplaySource,
    ) -> Result<(DateTime<Utc>, Option<DateTime<Utc>>)> {
        match source {
            ReplaySource::Window { start, end } => Ok((*start, *end)),
            ReplaySource::Tag { tag_id, window_s } => {
                let tag = self
                    .datastore
                    .get_tag(tag_id)
                    .await?
                    .with_context(|| format!("tag not archived: {tag_id}"))?;
                let half = chrono::Duration::milliseconds((window_s * 500.0) as i64);
                Ok((tag.ts - half, Some(tag.ts + half)))
            }
        }
    }

    /// Replay the channel's source window onto its subject. `rate_multiplier`
    /// scales playback speed; 2.0 plays twice as fast.
    pub async fn run(
        &self,
        channel: &Channel,
        rate_multiplier: f64,
        cancel: CancellationToken,
    ) -> Result<ReplayOutcome> {
        if rate_multiplier <= 0.0 {
            bail!("rate multiplier must be positive, got {rate_multiplier}");
        }
        let source = channel
            .source
            .as_ref()
            .with_context(|| format!("channel has no replay source: {}", channel.id))?;
        let (start, end) = self.resolve_window(source).await?;

        let records = self.datastore.query_range(start, end).await?;
        let tags = self.datastore.query_tags(start, end).await?;
        let items = merge_by_timestamp(records, tags);
        info!(
            channel = %channel.id,
            items = items.len(),
            start = %start,
            rate = rate_multiplier,
            "Replay starting"
        );

        let mut emitted_records = 0u64;
        let mut emitted_tags = 0u64;
        let mut last_recv_ms: Option<i64> = None;
        let mut last_time_s: Option<f64> = None;

        for item in items {
            let delay = compute_delay(&item, last_recv_ms, last_time_s);
            let paced = delay.div_f64(rate_multiplier);
            if !paced.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!(channel = %channel.id, emitted_records, emitted_tags, "Replay cancelled");
                        return Ok(ReplayOutcome::Cancelled {
                            records: emitted_records,
                            tags: emitted_tags,
                        });
                    }
                    _ = tokio::time::sleep(paced) => {}
                }
            } else if cancel.is_cancelled() {
                info!(channel = %channel.id, emitted_records, emitted_tags, "Replay cancelled");
                return Ok(ReplayOutcome::Cancelled {
                    records: emitted_records,
                    tags: emitted_tags,
                });
            }

            last_recv_ms = Some(item.epoch_ms());
            if let Some(time_s) = item.time_s() {
                last_time_s = Some(time_s);
            }

            match &item {
                ReplayItem::Record(record) => {
                    self.emit(channel, record.dedup_id().to_string(), rmp_serde::to_vec(record)?)?;
                    emitted_records += 1;
                }
                ReplayItem::Tag(tag) => {
                    self.emit(channel, tag.id.clone(), serde_json::to_vec(tag)?)?;
                    emitted_tags += 1;
                }
            }
        }

        info!(channel = %channel.id, emitted_records, emitted_tags, "Replay completed");
        Ok(ReplayOutcome::Completed {
            records: emitted_records,
            tags: emitted_tags,
        })
    }

    fn emit(&self, channel: &Channel, original_id: String, payload: Vec<u8>) -> Result<()> {
        let headers = HashMap::from([
            (
                MSG_ID_HEADER.to_string(),
                format!("{original_id}:replay:{}", channel.id),
            ),
            (REPLAY_ORIGIN_HEADER.to_string(), "datastore".to_string()),
        ]);
        self.broker.publish(&channel.subject, Bytes::from(payload), headers);
        debug!(channel = %channel.id, id = %original_id, "Replay item emitted");
        Ok(())
    }
}

/// Delay before emitting `item`, from original receive spacing, falling
/// back to range-time spacing when receive stamps do not advance.
fn compute_delay(item: &ReplayItem, last_recv_ms: Option<i64>, last_time_s: Option<f64>) -> Duration {
    if let Some(last) = last_recv_ms {
        let delta_ms = item.epoch_ms() - last;
        if delta_ms > 0 {
            return Duration::from_millis(delta_ms as u64);
        }
    }
    if let (Some(time_s), Some(last)) = (item.time_s(), last_time_s) {
        let delta_s = time_s - last;
        if delta_s > 0.0 {
            return Duration::from_secs_f64(delta_s);
        }
    }
    Duration::ZERO
}

/// Merge records and tags into one ascending sequence. Ties go to the
/// record, so a tag lands after the sample it annotates.
fn merge_by_timestamp(records: Vec<TelemetryRecord>, tags: Vec<Tag>) -> Vec<ReplayItem> {
    let mut items: Vec<ReplayItem> = Vec::with_capacity(records.len() + tags.len());
    items.extend(records.into_iter().map(ReplayItem::Record));
    items.extend(tags.into_iter().map(ReplayItem::Tag));
    // Stable sort keeps records ahead of tags at equal timestamps
    items.sort_by_key(ReplayItem::epoch_ms);
    items
}

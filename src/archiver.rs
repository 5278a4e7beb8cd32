//! Dedup archiver
//!
//! Drains ingest subjects into the datastore. Telemetry inserts are keyed by
//! the frame's dedup id, so replaying the same envelope (broker redelivery,
//! replay copies, upstream repeats) leaves exactly one archived row per
//! sensor-second. Tags and display commands are archived alongside.
//!
//! A bad message never stops the drain: malformed payloads are logged and
//! skipped, and datastore write failures get a short bounded retry before
//! the message is dropped with an error.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::{Broker, BrokerMessage};
use crate::channel::STREAM_FILTERS;
use crate::commands::CommandPayload;
use crate::datagram::TelemetryRecord;
use crate::datastore::Datastore;
use crate::subjects::{self, TAG_BROADCAST_SUBJECT};
use crate::tags::Tag;

const WRITE_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(50);

pub struct Archiver<D> {
    datastore: Arc<D>,
    broker: Broker,
    archived: AtomicU64,
    duplicates: AtomicU64,
    failed: AtomicU64,
}

impl<D: Datastore> Archiver<D> {
    pub fn new(datastore: Arc<D>, broker: Broker) -> Self {
        Self {
            datastore,
            broker,
            archived: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    pub fn archived(&self) -> u64 {
        self.archived.load(Ordering::Relaxed)
    }

    pub fn duplicates(&self) -> u64 {
        self.duplicates.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Archive one record; `true` when a new row was written. Calling this
    /// twice with the same sensor-second persists exactly one row.
    pub async fn ingest_record(&self, record: &TelemetryRecord) -> Result<bool> {
        let inserted = self
            .with_retry(|| self.datastore.insert_or_ignore(record))
            .await?;
        if inserted {
            self.archived.fetch_add(1, Ordering::Relaxed);
        } else {
            self.duplicates.fetch_add(1, Ordering::Relaxed);
            debug!(dedup = %record.dedup_id(), "Duplicate record ignored");
        }
        Ok(inserted)
    }

    pub async fn ingest_tag(&self, tag: &Tag) -> Result<()> {
        self.with_retry(|| self.datastore.insert_tag(tag)).await?;
        self.archived.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub async fn ingest_command(&self, command: &CommandPayload) -> Result<()> {
        self.with_retry(|| self.datastore.upsert_command(command))
            .await?;
        self.archived.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn with_retry<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if attempt + 1 < WRITE_ATTEMPTS => {
                    attempt += 1;
                    let backoff = RETRY_BASE_DELAY * 2u32.pow(attempt - 1);
                    warn!(error = %err, attempt, "Datastore write failed, retrying");
                    tokio::time::sleep(backoff).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn handle(&self, message: &BrokerMessage) -> Result<()> {
        if message.subject == TAG_BROADCAST_SUBJECT {
            let tag: Tag = serde_json::from_slice(&message.payload)?;
            self.ingest_tag(&tag).await
        } else if subjects::matches(&message.subject, "tspi.cmd.display.>") {
            let command: CommandPayload = serde_json::from_slice(&message.payload)?;
            self.ingest_command(&command).await
        } else {
            let record: TelemetryRecord = rmp_serde::from_slice(&message.payload)?;
            self.ingest_record(&record).await.map(|_| ())
        }
    }

    /// Drain ingest subjects until cancelled.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let mut filters: Vec<String> = STREAM_FILTERS.iter().map(|f| f.to_string()).collect();
        filters.push(TAG_BROADCAST_SUBJECT.to_string());
        filters.push("tspi.cmd.display.>".to_string());
        let mut sub = self.broker.subscribe(filters);
        info!("Archiver draining ingest subjects");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(archived = self.archived(), duplicates = self.duplicates(), "Archiver stopping");
                    return Ok(());
                }
                message = sub.recv() => {
                    let Some(message) = message else { return Ok(()) };
                    if let Err(err) = self.handle(&message).await {
                        self.failed.fetch_add(1, Ordering::Relaxed);
                        error!(subject = %message.subject, error = %err, "Message dropped by archiver");
                    }
                }
            }
        }
    }
}

//! Telemetry producer
//!
//! Turns raw datagrams into archived-grade broker messages: decode, stamp
//! the receive time, wrap in a MessagePack envelope, and publish on the
//! per-sensor ingest subject with the frame's dedup id as the broker message
//! id. Upstream senders that repeat a second of data are absorbed here.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Result;
use bytes::Bytes;
use chrono::Utc;
use tracing::debug;

use crate::broker::Broker;
use crate::datagram::{self, TelemetryRecord, TspiFrame};
use crate::subjects::{self, MSG_ID_HEADER};

pub struct TspiProducer {
    broker: Broker,
    published: AtomicU64,
    duplicates: AtomicU64,
}

impl TspiProducer {
    pub fn new(broker: Broker) -> Self {
        Self {
            broker,
            published: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
        }
    }

    /// Decode and publish one raw datagram. Undecodable input is the
    /// caller's problem; duplicate frames are absorbed and counted.
    pub fn ingest(&self, datagram: &[u8]) -> Result<TelemetryRecord> {
        let frame = datagram::decode(datagram)?;
        self.publish_frame(frame)
    }

    /// Publish an already decoded frame, stamping the receive time now.
    pub fn publish_frame(&self, frame: TspiFrame) -> Result<TelemetryRecord> {
        let record = TelemetryRecord::received(frame, Utc::now());
        self.publish_record(&record)?;
        Ok(record)
    }

    /// Publish a record that already carries its receive stamp.
    pub fn publish_record(&self, record: &TelemetryRecord) -> Result<()> {
        let subject = subjects::telemetry_subject(&record.frame);
        let payload = Bytes::from(rmp_serde::to_vec(record)?);
        let headers = HashMap::from([(
            MSG_ID_HEADER.to_string(),
            record.dedup_id().to_string(),
        )]);
        if self.broker.publish(&subject, payload, headers) {
            self.published.fetch_add(1, Ordering::Relaxed);
        } else {
            self.duplicates.fetch_add(1, Ordering::Relaxed);
            debug!(
                sensor = record.frame.sensor_id,
                dedup = %record.dedup_id(),
                "Duplicate frame absorbed at ingest"
            );
        }
        Ok(())
    }

    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    pub fn duplicates(&self) -> u64 {
        self.duplicates.load(Ordering::Relaxed)
    }
}

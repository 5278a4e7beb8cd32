//! In-process broker hub
//!
//! A minimal stand-in for the durable pub/sub broker, honoring the contracts
//! the engine requires of it: subject-addressed publish, wildcard-filtered
//! subscriptions, and message-id based duplicate suppression. Fan-out uses a
//! single broadcast channel; each subscription filters on its own patterns.
//!
//! Binding a [`ConsumerConfig`] spawns a forwarding task that materializes a
//! channel: messages matching the filter subjects are republished on the
//! deliver subject with a delivery-scoped message id, so broker-level dedup
//! does not swallow the delivery copy.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::channel::ConsumerConfig;
use crate::subjects::{self, MSG_ID_HEADER};

/// A message in flight on the hub.
#[derive(Debug, Clone)]
pub struct BrokerMessage {
    pub subject: String,
    pub payload: Bytes,
    pub headers: HashMap<String, String>,
    pub published_at: DateTime<Utc>,
}

impl BrokerMessage {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn msg_id(&self) -> Option<&str> {
        self.header(MSG_ID_HEADER)
    }
}

struct Inner {
    tx: broadcast::Sender<BrokerMessage>,
    /// Message ids seen so far; duplicates are suppressed, not errors.
    dedup: Mutex<HashSet<String>>,
    published: AtomicU64,
    suppressed: AtomicU64,
}

/// Handle to the hub. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Broker {
    inner: Arc<Inner>,
}

impl Broker {
    /// Create a hub with the given fan-out buffer capacity. Slow
    /// subscribers start losing messages once the buffer fills.
    pub fn new(buffer_capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(buffer_capacity);
        Self {
            inner: Arc::new(Inner {
                tx,
                dedup: Mutex::new(HashSet::new()),
                published: AtomicU64::new(0),
                suppressed: AtomicU64::new(0),
            }),
        }
    }

    /// Publish a message. Returns `false` when a message with the same
    /// dedup id was already accepted (the publish is a no-op).
    pub fn publish(
        &self,
        subject: &str,
        payload: Bytes,
        headers: HashMap<String, String>,
    ) -> bool {
        if let Some(id) = headers.get(MSG_ID_HEADER) {
            let mut dedup = self.inner.dedup.lock().expect("broker dedup mutex poisoned");
            if !dedup.insert(id.clone()) {
                self.inner.suppressed.fetch_add(1, Ordering::Relaxed);
                debug!(subject, msg_id = %id, "Duplicate message suppressed");
                return false;
            }
        }

        let message = BrokerMessage {
            subject: subject.to_string(),
            payload,
            headers,
            published_at: Utc::now(),
        };
        self.inner.published.fetch_add(1, Ordering::Relaxed);
        // No subscribers is fine; the message is simply dropped.
        let _ = self.inner.tx.send(message);
        true
    }

    /// Subscribe to subjects matching any of the given patterns.
    pub fn subscribe<I, S>(&self, filters: I) -> Subscription
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Subscription {
            rx: self.inner.tx.subscribe(),
            filters: filters.into_iter().map(Into::into).collect(),
        }
    }

    /// Messages accepted so far (duplicates excluded).
    pub fn published(&self) -> u64 {
        self.inner.published.load(Ordering::Relaxed)
    }

    /// Publishes suppressed by dedup.
    pub fn suppressed(&self) -> u64 {
        self.inner.suppressed.load(Ordering::Relaxed)
    }

    /// Materialize a consumer: forward matching messages to the deliver
    /// subject until cancelled. The delivery copy's message id is suffixed
    /// with the deliver subject so hub dedup does not suppress it.
    pub fn bind_consumer(&self, config: ConsumerConfig, cancel: CancellationToken) -> JoinHandle<()> {
        let broker = self.clone();
        let mut sub = self.subscribe(config.filter_subjects.clone());
        let deliver_subject = config.deliver_subject.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!(deliver = %deliver_subject, "Consumer binding cancelled");
                        break;
                    }
                    message = sub.recv() => {
                        let Some(message) = message else {
                            break;
                        };
                        let mut headers = message.headers.clone();
                        if let Some(id) = message.msg_id() {
                            headers.insert(
                                MSG_ID_HEADER.to_string(),
                                format!("{id}:{deliver_subject}"),
                            );
                        }
                        broker.publish(&deliver_subject, message.payload.clone(), headers);
                    }
                }
            }
        })
    }
}

/// A filtered view of the hub's message flow.
pub struct Subscription {
    rx: broadcast::Receiver<BrokerMessage>,
    filters: Vec<String>,
}

impl Subscription {
    /// Next message matching this subscription's filters. `None` once the
    /// hub is gone. Lagging skips missed messages with a warning and keeps
    /// receiving.
    pub async fn recv(&mut self) -> Option<BrokerMessage> {
        loop {
            match self.rx.recv().await {
                Ok(message) => {
                    if self.matches(&message.subject) {
                        return Some(message);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(missed = n, "Subscription lagged, missed messages");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant; `None` when no matching message is buffered.
    pub fn try_recv(&mut self) -> Option<BrokerMessage> {
        loop {
            match self.rx.try_recv() {
                Ok(message) => {
                    if self.matches(&message.subject) {
                        return Some(message);
                    }
                }
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    warn!(missed = n, "Subscription lagged, missed messages");
                }
                Err(_) => return None,
            }
        }
    }

    fn matches(&self, subject: &str) -> bool {
        self.filters.iter().any(|f| subjects::matches(subject, f))
    }
}

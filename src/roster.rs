//! Operator roster
//!
//! Aggregates client heartbeats into a read-only view keyed by client id.
//! The roster never drives channel membership; the Manager and Directory
//! consult it only for observability and staleness-based cleanup.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broker::Broker;
use crate::client::StatusHeartbeat;
use crate::subjects::STATUS_SUBJECT;

/// Latest known presence of one client.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientPresence {
    pub client_id: String,
    pub session_id: String,
    pub state: String,
    pub channel_id: String,
    pub subject: String,
    pub override_active: bool,
    pub last_seen: DateTime<Utc>,
    pub operator: Option<String>,
    pub source_ip: Option<String>,
    pub ping_ms: Option<f64>,
}

impl From<&StatusHeartbeat> for ClientPresence {
    fn from(beat: &StatusHeartbeat) -> Self {
        Self {
            client_id: beat.client_id.clone(),
            session_id: beat.session_id.clone(),
            state: beat.state.clone(),
            channel_id: beat.channel_id.clone(),
            subject: beat.subject.clone(),
            override_active: beat.override_active,
            last_seen: beat.ts,
            operator: beat.operator.clone(),
            source_ip: beat.source_ip.clone(),
            ping_ms: beat.ping_ms,
        }
    }
}

/// What changed when a heartbeat was folded in.
#[derive(Debug, Clone, PartialEq)]
pub enum RosterEvent {
    Joined(ClientPresence),
    StateChanged {
        client_id: String,
        from: String,
        to: String,
    },
    /// Same state as last time, timestamp refreshed.
    Refreshed,
}

/// Heartbeat aggregate, most recent entry per client.
pub struct ClientRoster {
    entries: Mutex<HashMap<String, ClientPresence>>,
}

impl ClientRoster {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Fold in one heartbeat and report what changed.
    pub fn observe(&self, beat: &StatusHeartbeat) -> RosterEvent {
        let presence = ClientPresence::from(beat);
        let mut entries = self.entries.lock().expect("roster mutex poisoned");
        match entries.insert(beat.client_id.clone(), presence.clone()) {
            None => {
                info!(client = %beat.client_id, state = %beat.state, "Client joined roster");
                RosterEvent::Joined(presence)
            }
            Some(previous) if previous.state != beat.state => {
                info!(
                    client = %beat.client_id,
                    from = %previous.state,
                    to = %beat.state,
                    channel = %beat.channel_id,
                    "Client state changed"
                );
                RosterEvent::StateChanged {
                    client_id: beat.client_id.clone(),
                    from: previous.state,
                    to: beat.state.clone(),
                }
            }
            Some(_) => RosterEvent::Refreshed,
        }
    }

    pub fn get(&self, client_id: &str) -> Option<ClientPresence> {
        let entries = self.entries.lock().expect("roster mutex poisoned");
        entries.get(client_id).cloned()
    }

    /// All entries, sorted by client id for stable display.
    pub fn snapshot(&self) -> Vec<ClientPresence> {
        let entries = self.entries.lock().expect("roster mutex poisoned");
        let mut all: Vec<ClientPresence> = entries.values().cloned().collect();
        all.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        all
    }

    /// Whether the client has beaten within the threshold.
    pub fn is_fresh(&self, client_id: &str, now: DateTime<Utc>, threshold: Duration) -> bool {
        self.get(client_id)
            .map(|p| now.signed_duration_since(p.last_seen).to_std().unwrap_or_default() <= threshold)
            .unwrap_or(false)
    }

    /// Drop entries older than the threshold; returns the ids removed.
    pub fn prune(&self, now: DateTime<Utc>, threshold: Duration) -> Vec<String> {
        let mut entries = self.entries.lock().expect("roster mutex poisoned");
        let stale: Vec<String> = entries
            .values()
            .filter(|p| {
                now.signed_duration_since(p.last_seen)
                    .to_std()
                    .map(|age| age > threshold)
                    .unwrap_or(false)
            })
            .map(|p| p.client_id.clone())
            .collect();
        for id in &stale {
            entries.remove(id);
            debug!(client = %id, "Stale client pruned from roster");
        }
        stale
    }
}

impl Default for ClientRoster {
    fn default() -> Self {
        Self::new()
    }
}

/// Feed the roster from the status subject until cancelled. Unparseable
/// heartbeats are logged and skipped.
pub async fn drain_status(broker: &Broker, roster: &ClientRoster, cancel: CancellationToken) {
    let mut sub = broker.subscribe([STATUS_SUBJECT]);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            message = sub.recv() => {
                let Some(message) = message else { return };
                match serde_json::from_slice::<StatusHeartbeat>(&message.payload) {
                    Ok(beat) => {
                        roster.observe(&beat);
                    }
                    Err(err) => warn!(error = %err, "Unparseable heartbeat, skipping"),
                }
            }
        }
    }
}

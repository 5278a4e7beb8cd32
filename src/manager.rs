//! Channel manager
//!
//! Operator-side orchestration: starts and stops group replays, creates
//! private replays, and keeps the directory and control subject in sync
//! with what is actually running. Each replay runs as its own cancellable
//! pacer task; when a pacer drains its window the manager still broadcasts
//! the stop so clients fall back to live.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::Broker;
use crate::channel::{
    replay_consumer_config, Channel, ChannelKind, ChannelListing, ControlMessage, ReplaySource,
};
use crate::datastore::Datastore;
use crate::directory::{ChannelDirectory, DirectoryError};
use crate::replay::{ReplayOutcome, ReplayPacer};
use crate::roster::ClientRoster;
use crate::subjects::{CONTROL_SUBJECT, LIST_REQUEST_SUBJECT, REPLY_TO_HEADER};

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    /// A replay for the same source is already active.
    #[error("replay already active: {0}")]
    DuplicateReplay(String),
    #[error("no such channel: {0}")]
    NotFound(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

struct ActiveReplay {
    cancel: CancellationToken,
    kind: ChannelKind,
}

struct Inner<D> {
    broker: Broker,
    directory: Arc<ChannelDirectory>,
    datastore: Arc<D>,
    /// Directory auto-expiry window for private replays.
    private_inactive_threshold: Duration,
    active: Mutex<HashMap<String, ActiveReplay>>,
}

/// Cheap-to-clone orchestration handle.
pub struct ChannelManager<D> {
    inner: Arc<Inner<D>>,
}

impl<D> Clone for ChannelManager<D> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<D: Datastore + 'static> ChannelManager<D> {
    pub fn new(
        broker: Broker,
        directory: Arc<ChannelDirectory>,
        datastore: Arc<D>,
        private_inactive_threshold: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                broker,
                directory,
                datastore,
                private_inactive_threshold,
                active: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn directory(&self) -> &ChannelDirectory {
        &self.inner.directory
    }

    /// Start a shared replay every non-overridden client follows. Retrying
    /// the same source while it is active is rejected, not duplicated.
    pub fn start_group_replay(
        &self,
        source: ReplaySource,
        rate_multiplier: f64,
    ) -> Result<Channel, ManagerError> {
        let channel = Channel::group_replay(source);
        self.register(&channel)?;

        let config = replay_consumer_config(&channel, self.inner.private_inactive_threshold);
        debug!(channel = %channel.id, policy = ?config.deliver_policy, "Replay consumer derived");

        self.emit_control(&ControlMessage::start(&channel))?;
        info!(channel = %channel.id, display = %channel.display_name, "Group replay started");
        self.spawn_pacer(channel.clone(), rate_multiplier);
        Ok(channel)
    }

    /// Stop a running group replay and tell every client.
    pub fn stop_group_replay(&self, channel_id: &str) -> Result<(), ManagerError> {
        let channel = self
            .inner
            .directory
            .lookup(channel_id)
            .ok_or_else(|| ManagerError::NotFound(channel_id.to_string()))?;
        if channel.kind != ChannelKind::GroupReplay {
            return Err(ManagerError::NotFound(channel_id.to_string()));
        }
        self.teardown(channel_id);
        self.emit_control(&ControlMessage::stop(channel_id))?;
        info!(channel = %channel_id, "Group replay stopped");
        Ok(())
    }

    /// Start a replay only the requesting client follows. No control
    /// broadcast; the channel is still discoverable.
    pub fn create_private_replay(
        &self,
        client_id: &str,
        source: ReplaySource,
        rate_multiplier: f64,
    ) -> Result<Channel, ManagerError> {
        let session = uuid::Uuid::new_v4().simple().to_string();
        let channel = Channel::private_replay(client_id, &session, source);
        self.register(&channel)?;

        let config = replay_consumer_config(&channel, self.inner.private_inactive_threshold);
        debug!(channel = %channel.id, expiry = ?config.inactive_threshold, "Replay consumer derived");

        info!(channel = %channel.id, client = %client_id, "Private replay created");
        self.spawn_pacer(channel.clone(), rate_multiplier);
        Ok(channel)
    }

    /// Tear down private replays whose owner stopped heartbeating.
    pub fn prune_private_replays(&self, roster: &ClientRoster) -> Vec<String> {
        let now = Utc::now();
        let threshold = self.inner.private_inactive_threshold;
        let mut expired = Vec::new();
        for channel in self.inner.directory.list() {
            if channel.kind != ChannelKind::PrivateReplay {
                continue;
            }
            // id shape is client.<client_id>.<session>
            let Some(owner) = channel
                .id
                .strip_prefix("client.")
                .and_then(|rest| rest.rsplit_once('.'))
                .map(|(owner, _)| owner)
            else {
                continue;
            };
            if !roster.is_fresh(owner, now, threshold) {
                warn!(channel = %channel.id, owner = %owner, "Private replay expired, owner stale");
                self.teardown(&channel.id);
                expired.push(channel.id);
            }
        }
        expired
    }

    /// Active pacer count, for status surfaces.
    pub fn active_replays(&self) -> usize {
        self.inner.active.lock().expect("manager mutex poisoned").len()
    }

    fn register(&self, channel: &Channel) -> Result<(), ManagerError> {
        self.inner.directory.register(channel.clone()).map_err(|err| match err {
            DirectoryError::DuplicateId(id) => ManagerError::DuplicateReplay(id),
        })
    }

    fn emit_control(&self, message: &ControlMessage) -> Result<(), ManagerError> {
        let payload = serde_json::to_vec(message)
            .map_err(|err| ManagerError::Other(err.into()))?;
        self.inner
            .broker
            .publish(CONTROL_SUBJECT, Bytes::from(payload), HashMap::new());
        Ok(())
    }

    fn spawn_pacer(&self, channel: Channel, rate_multiplier: f64) {
        let cancel = CancellationToken::new();
        {
            let mut active = self.inner.active.lock().expect("manager mutex poisoned");
            active.insert(
                channel.id.clone(),
                ActiveReplay {
                    cancel: cancel.clone(),
                    kind: channel.kind,
                },
            );
        }

        let manager = self.clone();
        tokio::spawn(async move {
            let pacer = ReplayPacer::new(manager.inner.datastore.clone(), manager.inner.broker.clone());
            match pacer.run(&channel, rate_multiplier, cancel).await {
                Ok(ReplayOutcome::Completed { records, tags }) => {
                    info!(channel = %channel.id, records, tags, "Replay drained its window");
                    manager.on_replay_complete(&channel);
                }
                // Cancellation means stop/prune already did the teardown
                Ok(ReplayOutcome::Cancelled { .. }) => {}
                Err(err) => {
                    error!(channel = %channel.id, error = %err, "Replay failed");
                    manager.on_replay_complete(&channel);
                }
            }
        });
    }

    /// Natural end of a replay: clean up and, for group replays, broadcast
    /// the stop so clients transition back to live.
    fn on_replay_complete(&self, channel: &Channel) {
        self.teardown(&channel.id);
        if channel.kind == ChannelKind::GroupReplay {
            if let Err(err) = self.emit_control(&ControlMessage::stop(&channel.id)) {
                error!(channel = %channel.id, error = %err, "Stop broadcast failed");
            }
        }
    }

    fn teardown(&self, channel_id: &str) {
        let entry = {
            let mut active = self.inner.active.lock().expect("manager mutex poisoned");
            active.remove(channel_id)
        };
        if let Some(entry) = entry {
            entry.cancel.cancel();
            debug!(channel = %channel_id, kind = ?entry.kind, "Replay torn down");
        }
        self.inner.directory.unregister(channel_id);
    }
}

/// Answers channel discovery requests with the directory listing, ordered
/// live first, then group replays, then private replays.
pub async fn serve_discovery(
    broker: &Broker,
    directory: &ChannelDirectory,
    cancel: CancellationToken,
) -> Result<()> {
    let mut sub = broker.subscribe([LIST_REQUEST_SUBJECT]);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            message = sub.recv() => {
                let Some(message) = message else { return Ok(()) };
                let Some(reply_to) = message.header(REPLY_TO_HEADER) else {
                    warn!("Discovery request without reply subject, ignoring");
                    continue;
                };
                let listings: Vec<ChannelListing> =
                    directory.list().iter().map(Channel::listing).collect();
                let payload = serde_json::to_vec(&listings)?;
                broker.publish(reply_to, Bytes::from(payload), HashMap::new());
                debug!(reply_to = %reply_to, channels = listings.len(), "Discovery answered");
            }
        }
    }
}

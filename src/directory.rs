//! Channel directory
//!
//! Process-local registry of active channels and the single writer-of-record
//! for channel existence. The live channel is always present. A mutex
//! serializes registration against concurrent callers; in a multi-operator
//! deployment this would become broker-backed shared state.

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::debug;

use crate::channel::{Channel, ChannelKind, LIVE_CHANNEL_ID};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DirectoryError {
    #[error("channel id already registered: {0}")]
    DuplicateId(String),
}

struct Entry {
    channel: Channel,
    /// Registration sequence; ties on creation time break deterministically.
    seq: u64,
}

#[derive(Default)]
struct State {
    channels: HashMap<String, Entry>,
    next_seq: u64,
}

/// Registry of discoverable channels.
pub struct ChannelDirectory {
    state: Mutex<State>,
}

impl ChannelDirectory {
    /// Create a directory pre-seeded with the live channel.
    pub fn new() -> Self {
        let directory = Self {
            state: Mutex::new(State::default()),
        };
        directory
            .register(Channel::live())
            .expect("empty directory accepts the live channel");
        directory
    }

    /// Register a channel. Concurrent registration of the same id is
    /// rejected, not merged.
    pub fn register(&self, channel: Channel) -> Result<(), DirectoryError> {
        let mut state = self.state.lock().expect("directory mutex poisoned");
        if state.channels.contains_key(&channel.id) {
            return Err(DirectoryError::DuplicateId(channel.id));
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        debug!(channel = %channel.id, kind = ?channel.kind, "Channel registered");
        state.channels.insert(channel.id.clone(), Entry { channel, seq });
        Ok(())
    }

    /// Remove a channel. Unregistering the live channel or an unknown id is
    /// a no-op; returns whether a channel was actually removed.
    pub fn unregister(&self, id: &str) -> bool {
        if id == LIVE_CHANNEL_ID {
            return false;
        }
        let mut state = self.state.lock().expect("directory mutex poisoned");
        let removed = state.channels.remove(id).is_some();
        if removed {
            debug!(channel = %id, "Channel unregistered");
        }
        removed
    }

    pub fn lookup(&self, id: &str) -> Option<Channel> {
        let state = self.state.lock().expect("directory mutex poisoned");
        state.channels.get(id).map(|entry| entry.channel.clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lookup(id).is_some()
    }

    /// All channels in discovery order: live first, then group replays, then
    /// private replays, each group by registration order.
    pub fn list(&self) -> Vec<Channel> {
        let state = self.state.lock().expect("directory mutex poisoned");
        let mut entries: Vec<(&ChannelKind, u64, &Channel)> = state
            .channels
            .values()
            .map(|entry| (&entry.channel.kind, entry.seq, &entry.channel))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(b.0).then(a.1.cmp(&b.1)));
        entries.into_iter().map(|(_, _, c)| c.clone()).collect()
    }

    /// Replay channels created for a given client (private replay ownership).
    pub fn private_channels_of(&self, client_id: &str) -> Vec<Channel> {
        let prefix = format!("client.{client_id}.");
        let state = self.state.lock().expect("directory mutex poisoned");
        let mut owned: Vec<(u64, Channel)> = state
            .channels
            .values()
            .filter(|entry| {
                entry.channel.kind == ChannelKind::PrivateReplay
                    && entry.channel.id.starts_with(&prefix)
            })
            .map(|entry| (entry.seq, entry.channel.clone()))
            .collect();
        owned.sort_by_key(|(seq, _)| *seq);
        owned.into_iter().map(|(_, c)| c).collect()
    }
}

impl Default for ChannelDirectory {
    fn default() -> Self {
        Self::new()
    }
}

//! Client channel state machine
//!
//! Each connected display runs one of these. The machine decides which
//! channel the client follows given operator control events and local user
//! actions, and announces itself on the status subject on every change and
//! on a fixed heartbeat interval.
//!
//! The transition table is total: an event with no matching row leaves the
//! state untouched and reports [`Transition::Ignored`], so tests can tell a
//! deliberate no-op from a dropped event.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broker::Broker;
use crate::channel::{Channel, ChannelKind, ControlMessage, ReplaySource};
use crate::subjects::{CONTROL_SUBJECT, STATUS_SUBJECT};

/// Default heartbeat cadence.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// What the client is currently following.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientState {
    FollowingLive,
    FollowingGroupReplay(String),
    FollowingPrivateReplay(String),
    /// The user chose live while a group replay is running.
    LiveOverride,
}

impl ClientState {
    /// Wire name carried in heartbeats.
    pub fn name(&self) -> &'static str {
        match self {
            ClientState::FollowingLive => "FollowingLive",
            ClientState::FollowingGroupReplay(_) => "FollowingGroupReplay",
            ClientState::FollowingPrivateReplay(_) => "FollowingPrivateReplay",
            ClientState::LiveOverride => "LiveOverride",
        }
    }
}

/// Inputs the machine reacts to.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    GroupReplayStart(Channel),
    GroupReplayStop { channel_id: String },
    /// Local user action: back to the live feed.
    BackToLive,
    /// Local user action: follow a channel picked from the discovery list.
    Select(Channel),
}

/// Outcome of applying one event.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Changed { from: ClientState, to: ClientState },
    /// No table row matched; state is unchanged.
    Ignored,
    /// Private-replay clients are invited, never switched.
    JoinPrompt { channel: Channel },
}

/// Heartbeat payload published on the status subject.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusHeartbeat {
    pub client_id: String,
    pub session_id: String,
    pub state: String,
    pub channel_id: String,
    pub subject: String,
    #[serde(rename = "override")]
    pub override_active: bool,
    pub ts: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub operator: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub source_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub ping_ms: Option<f64>,
}

/// Per-client channel-following state.
pub struct ClientChannelState {
    pub client_id: String,
    pub session_id: String,
    state: ClientState,
    current_channel: Channel,
    /// Group replays announced but not yet stopped.
    active_groups: HashSet<String>,
    pub operator: Option<String>,
    pub source_ip: Option<String>,
    pub ping_ms: Option<f64>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
}

impl ClientChannelState {
    pub fn new(client_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            session_id: session_id.into(),
            state: ClientState::FollowingLive,
            current_channel: Channel::live(),
            active_groups: HashSet::new(),
            operator: None,
            source_ip: None,
            ping_ms: None,
            last_heartbeat_at: None,
        }
    }

    pub fn state(&self) -> &ClientState {
        &self.state
    }

    pub fn current_channel(&self) -> &Channel {
        &self.current_channel
    }

    /// Apply one event per the transition table.
    pub fn apply(&mut self, event: ChannelEvent) -> Transition {
        match event {
            ChannelEvent::GroupReplayStart(channel) => {
                self.active_groups.insert(channel.id.clone());
                match &self.state {
                    ClientState::FollowingLive | ClientState::LiveOverride => {
                        self.switch(ClientState::FollowingGroupReplay(channel.id.clone()), channel)
                    }
                    ClientState::FollowingPrivateReplay(_) => Transition::JoinPrompt { channel },
                    ClientState::FollowingGroupReplay(_) => Transition::Ignored,
                }
            }
            ChannelEvent::GroupReplayStop { channel_id } => {
                self.active_groups.remove(&channel_id);
                match &self.state {
                    ClientState::FollowingGroupReplay(current) if *current == channel_id => {
                        self.switch(ClientState::FollowingLive, Channel::live())
                    }
                    _ => Transition::Ignored,
                }
            }
            ChannelEvent::BackToLive => {
                let next = if self.active_groups.is_empty() {
                    ClientState::FollowingLive
                } else {
                    ClientState::LiveOverride
                };
                if next == self.state {
                    Transition::Ignored
                } else {
                    self.switch(next, Channel::live())
                }
            }
            ChannelEvent::Select(channel) => {
                let next = match channel.kind {
                    ChannelKind::Livestream => ClientState::FollowingLive,
                    ChannelKind::GroupReplay => {
                        ClientState::FollowingGroupReplay(channel.id.clone())
                    }
                    ChannelKind::PrivateReplay => {
                        ClientState::FollowingPrivateReplay(channel.id.clone())
                    }
                };
                if next == self.state {
                    Transition::Ignored
                } else {
                    self.switch(next, channel)
                }
            }
        }
    }

    fn switch(&mut self, next: ClientState, channel: Channel) -> Transition {
        let from = self.state.clone();
        info!(
            client = %self.client_id,
            from = from.name(),
            to = next.name(),
            channel = %channel.id,
            "Client channel transition"
        );
        self.state = next.clone();
        self.current_channel = channel;
        Transition::Changed { from, to: next }
    }

    /// Build the heartbeat reflecting the current state.
    pub fn heartbeat(&mut self, now: DateTime<Utc>) -> StatusHeartbeat {
        self.last_heartbeat_at = Some(now);
        StatusHeartbeat {
            client_id: self.client_id.clone(),
            session_id: self.session_id.clone(),
            state: self.state.name().to_string(),
            channel_id: self.current_channel.id.clone(),
            subject: self.current_channel.subject.clone(),
            override_active: self.state == ClientState::LiveOverride,
            ts: now,
            operator: self.operator.clone(),
            source_ip: self.source_ip.clone(),
            ping_ms: self.ping_ms,
        }
    }
}

/// Rebuild a channel from a start announcement, for clients that have not
/// seen it in a discovery listing.
fn channel_from_start(message: &ControlMessage) -> Option<Channel> {
    let ControlMessage::GroupReplayStart {
        channel_id,
        display_name,
        subject,
        stream,
        start,
        end,
        ..
    } = message
    else {
        return None;
    };
    let source = start.as_deref().and_then(|s| {
        let start = DateTime::parse_from_rfc3339(s).ok()?.with_timezone(&Utc);
        let end = end
            .as_deref()
            .and_then(|e| DateTime::parse_from_rfc3339(e).ok())
            .map(|e| e.with_timezone(&Utc));
        Some(ReplaySource::Window { start, end })
    });
    Some(Channel {
        id: channel_id.clone(),
        kind: ChannelKind::GroupReplay,
        display_name: display_name.clone(),
        subject: subject.clone(),
        stream: stream.clone(),
        source,
        created_at: Utc::now(),
    })
}

/// A state machine wired to the broker: reacts to control messages,
/// publishes heartbeats, and exposes local user actions.
pub struct ClientRuntime {
    broker: Broker,
    state: Mutex<ClientChannelState>,
    prompts: mpsc::UnboundedSender<Channel>,
}

impl ClientRuntime {
    /// Returns the runtime and the receiving end of join prompts.
    pub fn new(
        broker: Broker,
        client_id: impl Into<String>,
        session_id: impl Into<String>,
    ) -> (Self, mpsc::UnboundedReceiver<Channel>) {
        let (prompts, prompt_rx) = mpsc::unbounded_channel();
        (
            Self {
                broker,
                state: Mutex::new(ClientChannelState::new(client_id, session_id)),
                prompts,
            },
            prompt_rx,
        )
    }

    pub fn state(&self) -> ClientState {
        self.state.lock().expect("client state mutex poisoned").state().clone()
    }

    /// Apply an event; publish a heartbeat when the state changed, surface a
    /// prompt when invited.
    pub fn handle(&self, event: ChannelEvent) -> Result<Transition> {
        let (transition, heartbeat) = {
            let mut state = self.state.lock().expect("client state mutex poisoned");
            let transition = state.apply(event);
            let heartbeat = matches!(transition, Transition::Changed { .. })
                .then(|| state.heartbeat(Utc::now()));
            (transition, heartbeat)
        };
        if let Some(heartbeat) = heartbeat {
            self.publish_heartbeat(&heartbeat)?;
        }
        if let Transition::JoinPrompt { channel } = &transition {
            // The receiver may be gone; the prompt is advisory.
            let _ = self.prompts.send(channel.clone());
        }
        Ok(transition)
    }

    pub fn back_to_live(&self) -> Result<Transition> {
        self.handle(ChannelEvent::BackToLive)
    }

    pub fn select(&self, channel: Channel) -> Result<Transition> {
        self.handle(ChannelEvent::Select(channel))
    }

    fn publish_heartbeat(&self, heartbeat: &StatusHeartbeat) -> Result<()> {
        let payload = Bytes::from(serde_json::to_vec(heartbeat)?);
        self.broker.publish(STATUS_SUBJECT, payload, HashMap::new());
        debug!(
            client = %heartbeat.client_id,
            state = %heartbeat.state,
            channel = %heartbeat.channel_id,
            "Heartbeat published"
        );
        Ok(())
    }

    fn beat_now(&self) -> Result<()> {
        let heartbeat = {
            let mut state = self.state.lock().expect("client state mutex poisoned");
            state.heartbeat(Utc::now())
        };
        self.publish_heartbeat(&heartbeat)
    }

    /// Drive the machine until cancelled: follow the control subject and
    /// beat on the fixed interval. Malformed control payloads are logged
    /// and skipped.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let mut control = self.broker.subscribe([CONTROL_SUBJECT]);
        // The interval's immediate first tick doubles as the startup beat
        let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Client runtime stopping");
                    return Ok(());
                }
                _ = ticker.tick() => {
                    self.beat_now()?;
                }
                message = control.recv() => {
                    let Some(message) = message else { return Ok(()) };
                    let control: ControlMessage = match serde_json::from_slice(&message.payload) {
                        Ok(control) => control,
                        Err(err) => {
                            warn!(error = %err, "Unparseable control message, skipping");
                            continue;
                        }
                    };
                    let event = match &control {
                        ControlMessage::GroupReplayStart { .. } => {
                            match channel_from_start(&control) {
                                Some(channel) => ChannelEvent::GroupReplayStart(channel),
                                None => continue,
                            }
                        }
                        ControlMessage::GroupReplayStop { channel_id } => {
                            ChannelEvent::GroupReplayStop {
                                channel_id: channel_id.clone(),
                            }
                        }
                    };
                    self.handle(event)?;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn window(minute: u32) -> ReplaySource {
        ReplaySource::Window {
            start: Utc.with_ymd_and_hms(2024, 3, 1, 12, minute, 0).unwrap(),
            end: None,
        }
    }

    // ========== transition table ==========

    #[test]
    fn live_client_joins_group_replay() {
        let mut state = ClientChannelState::new("a", "s1");
        let replay = Channel::group_replay(window(0));

        let transition = state.apply(ChannelEvent::GroupReplayStart(replay.clone()));
        assert_eq!(
            transition,
            Transition::Changed {
                from: ClientState::FollowingLive,
                to: ClientState::FollowingGroupReplay(replay.id.clone()),
            }
        );
        assert_eq!(state.current_channel().id, replay.id);
    }

    #[test]
    fn overridden_client_joins_new_group_replay() {
        let mut state = ClientChannelState::new("a", "s1");
        let first = Channel::group_replay(window(0));
        state.apply(ChannelEvent::GroupReplayStart(first));
        state.apply(ChannelEvent::BackToLive);
        assert_eq!(state.state(), &ClientState::LiveOverride);

        let second = Channel::group_replay(window(5));
        let transition = state.apply(ChannelEvent::GroupReplayStart(second.clone()));
        assert!(matches!(transition, Transition::Changed { .. }));
        assert_eq!(
            state.state(),
            &ClientState::FollowingGroupReplay(second.id)
        );
    }

    #[test]
    fn private_replay_client_gets_prompt_not_switch() {
        let mut state = ClientChannelState::new("b", "s1");
        let private = Channel::private_replay("b", "s1", window(0));
        state.apply(ChannelEvent::Select(private.clone()));

        let group = Channel::group_replay(window(5));
        let transition = state.apply(ChannelEvent::GroupReplayStart(group.clone()));
        assert_eq!(transition, Transition::JoinPrompt { channel: group });
        assert_eq!(
            state.state(),
            &ClientState::FollowingPrivateReplay(private.id)
        );
    }

    #[test]
    fn stop_of_current_replay_returns_to_live() {
        let mut state = ClientChannelState::new("a", "s1");
        let replay = Channel::group_replay(window(0));
        state.apply(ChannelEvent::GroupReplayStart(replay.clone()));

        let transition = state.apply(ChannelEvent::GroupReplayStop {
            channel_id: replay.id.clone(),
        });
        assert_eq!(
            transition,
            Transition::Changed {
                from: ClientState::FollowingGroupReplay(replay.id),
                to: ClientState::FollowingLive,
            }
        );
    }

    #[test]
    fn stop_of_other_replay_is_ignored() {
        let mut state = ClientChannelState::new("a", "s1");
        let replay = Channel::group_replay(window(0));
        state.apply(ChannelEvent::GroupReplayStart(replay.clone()));

        let transition = state.apply(ChannelEvent::GroupReplayStop {
            channel_id: "replay.other".to_string(),
        });
        assert_eq!(transition, Transition::Ignored);
        assert_eq!(state.state(), &ClientState::FollowingGroupReplay(replay.id));
    }

    #[test]
    fn back_to_live_during_replay_is_override() {
        let mut state = ClientChannelState::new("a", "s1");
        let replay = Channel::group_replay(window(0));
        state.apply(ChannelEvent::GroupReplayStart(replay.clone()));

        state.apply(ChannelEvent::BackToLive);
        assert_eq!(state.state(), &ClientState::LiveOverride);

        // Once the replay stops, back-to-live means plain live
        state.apply(ChannelEvent::GroupReplayStop { channel_id: replay.id });
        assert_eq!(state.state(), &ClientState::LiveOverride);
        state.apply(ChannelEvent::BackToLive);
        assert_eq!(state.state(), &ClientState::FollowingLive);
    }

    #[test]
    fn unmatched_events_are_observable_noops() {
        let mut state = ClientChannelState::new("a", "s1");
        // Stop with nothing running
        assert_eq!(
            state.apply(ChannelEvent::GroupReplayStop {
                channel_id: "replay.none".to_string()
            }),
            Transition::Ignored
        );
        // Back-to-live while already live
        assert_eq!(state.apply(ChannelEvent::BackToLive), Transition::Ignored);
        // Selecting the channel already followed
        assert_eq!(
            state.apply(ChannelEvent::Select(Channel::live())),
            Transition::Ignored
        );
        assert_eq!(state.state(), &ClientState::FollowingLive);
    }

    #[test]
    fn select_follows_channel_kind() {
        let mut state = ClientChannelState::new("a", "s1");
        let group = Channel::group_replay(window(0));
        state.apply(ChannelEvent::Select(group.clone()));
        assert_eq!(state.state(), &ClientState::FollowingGroupReplay(group.id));

        state.apply(ChannelEvent::Select(Channel::live()));
        assert_eq!(state.state(), &ClientState::FollowingLive);
    }

    // ========== heartbeats ==========

    #[test]
    fn heartbeat_reflects_state_and_override_flag() {
        let mut state = ClientChannelState::new("a", "s1");
        let replay = Channel::group_replay(window(0));
        state.apply(ChannelEvent::GroupReplayStart(replay.clone()));
        state.apply(ChannelEvent::BackToLive);

        let now = Utc.with_ymd_and_hms(2024, 3, 1, 13, 0, 0).unwrap();
        let heartbeat = state.heartbeat(now);
        assert_eq!(heartbeat.state, "LiveOverride");
        assert!(heartbeat.override_active);
        assert_eq!(heartbeat.channel_id, "livestream");
        assert_eq!(state.last_heartbeat_at, Some(now));

        let json = serde_json::to_value(&heartbeat).unwrap();
        assert_eq!(json["override"], true);
        assert!(json.get("ping_ms").is_none());
    }

    #[tokio::test]
    async fn runtime_emits_heartbeat_on_transition() {
        let broker = Broker::new(64);
        let mut status = broker.subscribe([STATUS_SUBJECT]);
        let (runtime, _prompts) = ClientRuntime::new(broker.clone(), "a", "s1");

        let replay = Channel::group_replay(window(0));
        runtime
            .handle(ChannelEvent::GroupReplayStart(replay.clone()))
            .unwrap();

        let message = status.recv().await.unwrap();
        let heartbeat: StatusHeartbeat = serde_json::from_slice(&message.payload).unwrap();
        assert_eq!(heartbeat.client_id, "a");
        assert_eq!(heartbeat.state, "FollowingGroupReplay");
        assert_eq!(heartbeat.channel_id, replay.id);
    }

    #[tokio::test]
    async fn runtime_surfaces_join_prompts() {
        let broker = Broker::new(64);
        let (runtime, mut prompts) = ClientRuntime::new(broker, "b", "s1");
        let private = Channel::private_replay("b", "s1", window(0));
        runtime.select(private).unwrap();

        let group = Channel::group_replay(window(5));
        runtime
            .handle(ChannelEvent::GroupReplayStart(group.clone()))
            .unwrap();

        let prompted = prompts.recv().await.unwrap();
        assert_eq!(prompted.id, group.id);
    }

    #[tokio::test(start_paused = true)]
    async fn run_loop_reacts_to_control_and_ticks() {
        let broker = Broker::new(64);
        let mut status = broker.subscribe([STATUS_SUBJECT]);
        let (runtime, _prompts) = ClientRuntime::new(broker.clone(), "a", "s1");
        let runtime = std::sync::Arc::new(runtime);
        let cancel = CancellationToken::new();
        let task = {
            let runtime = runtime.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { runtime.run(cancel).await })
        };

        // Initial heartbeat on startup
        let first: StatusHeartbeat =
            serde_json::from_slice(&status.recv().await.unwrap().payload).unwrap();
        assert_eq!(first.state, "FollowingLive");

        let replay = Channel::group_replay(window(0));
        let start = serde_json::to_vec(&ControlMessage::start(&replay)).unwrap();
        broker.publish(CONTROL_SUBJECT, Bytes::from(start), HashMap::new());

        // Transition heartbeat follows the control message
        loop {
            let beat: StatusHeartbeat =
                serde_json::from_slice(&status.recv().await.unwrap().payload).unwrap();
            if beat.state == "FollowingGroupReplay" {
                assert_eq!(beat.channel_id, replay.id);
                break;
            }
        }
        assert_eq!(runtime.state(), ClientState::FollowingGroupReplay(replay.id));

        cancel.cancel();
        task.await.unwrap().unwrap();
    }
}

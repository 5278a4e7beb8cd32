//! Channel descriptors, consumer configurations, and control payloads
//!
//! A channel is a named, subscribable destination: the always-on live feed,
//! an operator-driven group replay, or a client's private replay. Channels
//! are materialized against the broker through a [`ConsumerConfig`] derived
//! here and never persisted.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::subjects::{
    CLIENT_SUBJECT_PREFIX, LIVESTREAM_SUBJECT, REPLAY_SUBJECT_PREFIX, TSPI_REPLAY_STREAM,
    TSPI_STREAM,
};

/// Channel id of the always-on live feed.
pub const LIVE_CHANNEL_ID: &str = "livestream";

/// Telemetry ingest subjects backing the `TSPI` stream.
pub const STREAM_FILTERS: [&str; 2] = ["tspi.geocentric.>", "tspi.spherical.>"];

/// Categories of channels exposed to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Livestream,
    GroupReplay,
    PrivateReplay,
}

/// What a replay channel plays back: a time window or a tagged instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplaySource {
    Window {
        start: DateTime<Utc>,
        end: Option<DateTime<Utc>>,
    },
    Tag {
        tag_id: String,
        /// Total width of the window centred on the tag timestamp.
        window_s: f64,
    },
}

impl ReplaySource {
    /// Deterministic identifier used for channel ids and duplicate detection.
    ///
    /// Two operators naming the exact same window (or tag) collide; merely
    /// overlapping windows do not.
    pub fn identifier(&self) -> String {
        match self {
            ReplaySource::Window { start, .. } => start.format("%Y%m%dT%H%M%SZ").to_string(),
            ReplaySource::Tag { tag_id, .. } => format!("tag-{}", slug(tag_id)),
        }
    }

    pub fn display_name(&self) -> String {
        match self {
            ReplaySource::Window { start, .. } => {
                format!("replay {}", start.to_rfc3339_opts(SecondsFormat::Secs, true))
            }
            ReplaySource::Tag { tag_id, .. } => format!("replay tag {}", tag_id),
        }
    }
}

fn slug(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect()
}

/// Description of a discoverable playback channel. Owned by the directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    pub id: String,
    pub kind: ChannelKind,
    pub display_name: String,
    pub subject: String,
    pub stream: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub source: Option<ReplaySource>,
    pub created_at: DateTime<Utc>,
}

impl Channel {
    /// The always-on live feed channel.
    pub fn live() -> Self {
        Self {
            id: LIVE_CHANNEL_ID.to_string(),
            kind: ChannelKind::Livestream,
            display_name: LIVE_CHANNEL_ID.to_string(),
            subject: LIVESTREAM_SUBJECT.to_string(),
            stream: TSPI_STREAM.to_string(),
            source: None,
            created_at: Utc::now(),
        }
    }

    /// An operator-initiated shared replay channel.
    pub fn group_replay(source: ReplaySource) -> Self {
        let identifier = source.identifier();
        Self {
            id: format!("replay.{identifier}"),
            kind: ChannelKind::GroupReplay,
            display_name: source.display_name(),
            subject: format!("{REPLAY_SUBJECT_PREFIX}.{identifier}"),
            stream: TSPI_REPLAY_STREAM.to_string(),
            source: Some(source),
            created_at: Utc::now(),
        }
    }

    /// A client-scoped private replay channel.
    pub fn private_replay(client_id: &str, session_id: &str, source: ReplaySource) -> Self {
        let client_id = client_id.trim();
        let session_id = session_id.trim();
        assert!(
            !client_id.is_empty() && !session_id.is_empty(),
            "client_id and session_id must be non-empty"
        );
        Self {
            id: format!("client.{client_id}.{session_id}"),
            kind: ChannelKind::PrivateReplay,
            display_name: format!("client {client_id}/{session_id}"),
            subject: format!("{CLIENT_SUBJECT_PREFIX}.{client_id}.{session_id}"),
            stream: TSPI_REPLAY_STREAM.to_string(),
            source: Some(source),
            created_at: Utc::now(),
        }
    }

    /// Replay identifier for replay channels, `None` for the live channel.
    pub fn identifier(&self) -> Option<String> {
        self.source.as_ref().map(ReplaySource::identifier)
    }

    /// Entry published in discovery responses.
    pub fn listing(&self) -> ChannelListing {
        ChannelListing {
            channel_id: self.id.clone(),
            display_name: self.display_name.clone(),
            kind: self.kind,
            subject: self.subject.clone(),
        }
    }
}

/// One row of a discovery response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelListing {
    pub channel_id: String,
    pub display_name: String,
    pub kind: ChannelKind,
    pub subject: String,
}

/// Where in the stream a consumer starts delivering.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliverPolicy {
    All,
    New,
    ByStartTime(DateTime<Utc>),
    ByStartSequence(u64),
}

/// Whether the broker expects per-message acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckPolicy {
    None,
    Explicit,
}

/// Replay pacing requested from the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayPolicy {
    Instant,
    /// Reproduce original inter-message spacing.
    Original,
}

/// How a channel is materialized against the broker. Derived from a
/// [`Channel`]; never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumerConfig {
    pub stream: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub durable_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub description: Option<String>,
    pub filter_subjects: Vec<String>,
    pub deliver_subject: String,
    pub deliver_policy: DeliverPolicy,
    pub ack_policy: AckPolicy,
    pub replay_policy: ReplayPolicy,
    pub flow_control: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub idle_heartbeat: Option<Duration>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub inactive_threshold: Option<Duration>,
}

/// Configuration for the shared live fan-out consumer.
pub fn live_consumer_config() -> ConsumerConfig {
    ConsumerConfig {
        stream: TSPI_STREAM.to_string(),
        durable_name: Some("LIVE_MAIN".to_string()),
        description: None,
        filter_subjects: STREAM_FILTERS.iter().map(|s| s.to_string()).collect(),
        deliver_subject: LIVESTREAM_SUBJECT.to_string(),
        deliver_policy: DeliverPolicy::New,
        ack_policy: AckPolicy::None,
        replay_policy: ReplayPolicy::Instant,
        flow_control: true,
        idle_heartbeat: Some(Duration::from_secs(5)),
        inactive_threshold: None,
    }
}

/// Configuration for a replay channel consumer.
///
/// Panics if called with the live channel; replay configs only make sense
/// for replay kinds.
pub fn replay_consumer_config(
    channel: &Channel,
    inactive_threshold: Duration,
) -> ConsumerConfig {
    assert!(
        channel.kind != ChannelKind::Livestream,
        "replay consumer config requires a replay channel"
    );
    let deliver_policy = match channel.source {
        Some(ReplaySource::Window { start, .. }) => DeliverPolicy::ByStartTime(start),
        _ => DeliverPolicy::New,
    };
    ConsumerConfig {
        stream: channel.stream.clone(),
        durable_name: None,
        description: match channel.kind {
            ChannelKind::GroupReplay => Some(format!("Group replay {}", channel.id)),
            _ => None,
        },
        filter_subjects: STREAM_FILTERS.iter().map(|s| s.to_string()).collect(),
        deliver_subject: channel.subject.clone(),
        deliver_policy,
        ack_policy: AckPolicy::None,
        replay_policy: ReplayPolicy::Original,
        flow_control: true,
        idle_heartbeat: Some(Duration::from_secs(5)),
        inactive_threshold: match channel.kind {
            ChannelKind::PrivateReplay => Some(inactive_threshold),
            _ => None,
        },
    }
}

/// Operator control broadcast carried on `tspi.ops.ctrl` as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlMessage {
    GroupReplayStart {
        channel_id: String,
        display_name: String,
        identifier: String,
        subject: String,
        stream: String,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        start: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        end: Option<String>,
    },
    GroupReplayStop {
        channel_id: String,
    },
}

impl ControlMessage {
    /// Start broadcast for a group replay channel.
    pub fn start(channel: &Channel) -> Self {
        let (start, end) = match &channel.source {
            Some(ReplaySource::Window { start, end }) => (
                Some(start.to_rfc3339_opts(SecondsFormat::Secs, true)),
                end.map(|e| e.to_rfc3339_opts(SecondsFormat::Secs, true)),
            ),
            _ => (None, None),
        };
        ControlMessage::GroupReplayStart {
            channel_id: channel.id.clone(),
            display_name: channel.display_name.clone(),
            identifier: channel.identifier().unwrap_or_default(),
            subject: channel.subject.clone(),
            stream: channel.stream.clone(),
            start,
            end,
        }
    }

    pub fn stop(channel_id: &str) -> Self {
        ControlMessage::GroupReplayStop {
            channel_id: channel_id.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn window_source() -> ReplaySource {
        ReplaySource::Window {
            start: Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap(),
            end: Some(Utc.with_ymd_and_hms(2024, 3, 1, 12, 45, 0).unwrap()),
        }
    }

    #[test]
    fn window_identifier_is_compact_timestamp() {
        assert_eq!(window_source().identifier(), "20240301T123000Z");
    }

    #[test]
    fn tag_identifier_is_slugged() {
        let source = ReplaySource::Tag {
            tag_id: "a1b2:c3".to_string(),
            window_s: 10.0,
        };
        assert_eq!(source.identifier(), "tag-a1b2-c3");
    }

    #[test]
    fn group_replay_channel_derives_id_and_subject() {
        let channel = Channel::group_replay(window_source());
        assert_eq!(channel.id, "replay.20240301T123000Z");
        assert_eq!(channel.subject, "tspi.channel.replay.20240301T123000Z");
        assert_eq!(channel.kind, ChannelKind::GroupReplay);
        assert_eq!(channel.display_name, "replay 2024-03-01T12:30:00Z");
        assert_eq!(channel.stream, TSPI_REPLAY_STREAM);
    }

    #[test]
    fn private_channel_is_client_scoped() {
        let channel = Channel::private_replay("alice", "s1", window_source());
        assert_eq!(channel.id, "client.alice.s1");
        assert_eq!(channel.subject, "tspi.channel.client.alice.s1");
        assert_eq!(channel.kind, ChannelKind::PrivateReplay);
    }

    #[test]
    #[should_panic(expected = "non-empty")]
    fn private_channel_rejects_blank_client() {
        Channel::private_replay("  ", "s1", window_source());
    }

    #[test]
    fn live_consumer_delivers_new_to_livestream() {
        let config = live_consumer_config();
        assert_eq!(config.deliver_subject, LIVESTREAM_SUBJECT);
        assert_eq!(config.deliver_policy, DeliverPolicy::New);
        assert_eq!(config.ack_policy, AckPolicy::None);
        assert_eq!(config.replay_policy, ReplayPolicy::Instant);
        assert!(config.flow_control);
    }

    #[test]
    fn group_replay_consumer_starts_by_time_at_original_rate() {
        let channel = Channel::group_replay(window_source());
        let config = replay_consumer_config(&channel, Duration::from_secs(120));

        match config.deliver_policy {
            DeliverPolicy::ByStartTime(start) => {
                assert_eq!(start, Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap());
            }
            other => panic!("expected ByStartTime, got {:?}", other),
        }
        assert_eq!(config.replay_policy, ReplayPolicy::Original);
        assert_eq!(config.inactive_threshold, None);
        assert!(config.description.unwrap().contains(&channel.id));
    }

    #[test]
    fn private_replay_consumer_auto_expires() {
        let channel = Channel::private_replay("bob", "s9", window_source());
        let config = replay_consumer_config(&channel, Duration::from_secs(120));
        assert_eq!(config.inactive_threshold, Some(Duration::from_secs(120)));
        assert_eq!(config.durable_name, None);
    }

    #[test]
    fn control_start_message_serializes_with_type_tag() {
        let channel = Channel::group_replay(window_source());
        let json = serde_json::to_value(ControlMessage::start(&channel)).unwrap();
        assert_eq!(json["type"], "GroupReplayStart");
        assert_eq!(json["channel_id"], "replay.20240301T123000Z");
        assert_eq!(json["identifier"], "20240301T123000Z");
        assert_eq!(json["start"], "2024-03-01T12:30:00Z");
        assert_eq!(json["end"], "2024-03-01T12:45:00Z");
        assert_eq!(json["stream"], "TSPI_REPLAY");
    }

    #[test]
    fn control_messages_roundtrip_through_json() {
        let stop = ControlMessage::stop("replay.x");
        let json = serde_json::to_string(&stop).unwrap();
        let decoded: ControlMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, stop);
    }
}

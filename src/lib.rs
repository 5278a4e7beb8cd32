//! TSPI - Channel and replay orchestration for range telemetry
//!
//! Turns raw TSPI datagrams from range instrumentation into a durable
//! pub/sub telemetry service with shared and private historical replays:
//!
//! - **Codec** ([`datagram`]): 37-byte big-endian TSPI frames, geocentric
//!   and spherical, with sensor-second dedup identity
//! - **Broker plumbing** ([`broker`], [`subjects`], [`producer`],
//!   [`ingest`]): subject-addressed fan-out with message-id dedup, UDP
//!   ingest feeding the per-sensor subjects
//! - **Channels** ([`channel`], [`directory`], [`manager`]): the live
//!   channel, operator-driven group replays, client-scoped private replays
//! - **Clients** ([`client`], [`roster`]): the per-client channel state
//!   machine, status heartbeats, and the operator roster built from them
//! - **History** ([`datastore`], [`archiver`], [`replay`]): idempotent
//!   archiving and original-spacing replay with tags interleaved in place
//! - **Annotations and commands** ([`tags`], [`commands`]): timestamped
//!   range tags and last-write-wins display commands

pub mod archiver;
pub mod broker;
pub mod channel;
pub mod client;
pub mod commands;
pub mod datagram;
pub mod datastore;
pub mod directory;
pub mod generator;
pub mod ingest;
pub mod manager;
pub mod producer;
pub mod replay;
pub mod roster;
pub mod subjects;
pub mod tags;

pub use archiver::Archiver;
pub use broker::{Broker, BrokerMessage, Subscription};
pub use channel::{
    live_consumer_config, replay_consumer_config, Channel, ChannelKind, ChannelListing,
    ConsumerConfig, ControlMessage, ReplaySource, LIVE_CHANNEL_ID,
};
pub use client::{
    ChannelEvent, ClientChannelState, ClientRuntime, ClientState, StatusHeartbeat, Transition,
};
pub use commands::{CommandPayload, CommandSender};
pub use datagram::{
    decode, encode, DecodeError, DedupId, EncodeError, Kinematics, RecordKind, TelemetryRecord,
    TspiFrame, ValidityBits, DATAGRAM_LEN,
};
pub use datastore::{Datastore, MemoryDatastore};
pub use directory::{ChannelDirectory, DirectoryError};
pub use generator::{FlightConfig, FlightGenerator};
pub use ingest::UdpIngest;
pub use manager::{serve_discovery, ChannelManager, ManagerError};
pub use producer::TspiProducer;
pub use replay::{ReplayOutcome, ReplayPacer};
pub use roster::{drain_status, ClientPresence, ClientRoster, RosterEvent};
pub use tags::{Tag, TagSender, TagStatus};

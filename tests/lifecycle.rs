//! End-to-end channel and replay lifecycle tests: ingest through archive,
//! operator control through client state, and paced replay delivery.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{TimeZone, Utc};
use tokio_util::sync::CancellationToken;

use tspi::channel::STREAM_FILTERS;
use tspi::datagram::{decode, TICKS_PER_SECOND};
use tspi::subjects::{
    CONTROL_SUBJECT, LIST_REQUEST_SUBJECT, REPLAY_ORIGIN_HEADER, REPLY_TO_HEADER, STATUS_SUBJECT,
};
use tspi::{
    drain_status, serve_discovery, Archiver, Broker, Channel, ChannelDirectory, ChannelKind,
    ChannelListing, ChannelManager, ClientRuntime, ClientState, ClientRoster, Datastore,
    MemoryDatastore, ReplaySource, StatusHeartbeat, Tag, TagSender, TelemetryRecord, TspiProducer,
    DATAGRAM_LEN,
};

const T0: i64 = 1_700_000_000_000;

fn datagram(sensor_id: u16, time_s: f64) -> [u8; DATAGRAM_LEN] {
    let mut raw = [0u8; DATAGRAM_LEN];
    raw[0] = 0xC1;
    raw[1] = 4;
    raw[2..4].copy_from_slice(&sensor_id.to_be_bytes());
    raw[4..6].copy_from_slice(&120u16.to_be_bytes());
    let ticks = (time_s * TICKS_PER_SECOND as f64).round() as u32;
    raw[6..10].copy_from_slice(&ticks.to_be_bytes());
    raw
}

fn record(sensor_id: u16, time_s: f64, recv_ms: i64) -> TelemetryRecord {
    TelemetryRecord::received(
        decode(&datagram(sensor_id, time_s)).unwrap(),
        Utc.timestamp_millis_opt(recv_ms).unwrap(),
    )
}

fn window(start_ms: i64, end_ms: i64) -> ReplaySource {
    ReplaySource::Window {
        start: Utc.timestamp_millis_opt(start_ms).unwrap(),
        end: Some(Utc.timestamp_millis_opt(end_ms).unwrap()),
    }
}

struct Harness {
    broker: Broker,
    datastore: Arc<MemoryDatastore>,
    directory: Arc<ChannelDirectory>,
    manager: ChannelManager<MemoryDatastore>,
}

fn harness() -> Harness {
    let broker = Broker::new(4096);
    let datastore = Arc::new(MemoryDatastore::new());
    let directory = Arc::new(ChannelDirectory::new());
    let manager = ChannelManager::new(
        broker.clone(),
        directory.clone(),
        datastore.clone(),
        Duration::from_secs(15),
    );
    Harness {
        broker,
        datastore,
        directory,
        manager,
    }
}

async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

// ========== ingest and archive ==========

#[tokio::test]
async fn same_second_readings_archive_as_one_row() {
    let h = harness();
    let archiver = Arc::new(Archiver::new(h.datastore.clone(), h.broker.clone()));
    let cancel = CancellationToken::new();
    let drain = {
        let archiver = archiver.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { archiver.run(cancel).await })
    };
    tokio::task::yield_now().await;

    // Two readings inside the same sensor-second, one in the next
    let producer = TspiProducer::new(h.broker.clone());
    producer.publish_record(&record(7, 123.45, T0)).unwrap();
    producer.publish_record(&record(7, 123.46, T0 + 10)).unwrap();
    producer.publish_record(&record(7, 124.01, T0 + 560)).unwrap();

    settle().await;
    cancel.cancel();
    drain.await.unwrap().unwrap();

    assert_eq!(h.datastore.count_records().await.unwrap(), 2);
}

#[tokio::test]
async fn archiving_a_replayed_copy_is_a_noop() {
    let h = harness();
    let archiver = Archiver::new(h.datastore.clone(), h.broker.clone());

    let original = record(7, 10.0, T0);
    assert!(archiver.ingest_record(&original).await.unwrap());
    // A replay hop preserves recv metadata, so the same row comes back
    assert!(!archiver.ingest_record(&original).await.unwrap());
    assert_eq!(h.datastore.count_records().await.unwrap(), 1);
}

// ========== group replay lifecycle ==========

#[tokio::test]
async fn group_replay_moves_clients_and_returns_them_to_live() {
    let h = harness();
    // Wide spacing keeps the pacer mid-delay until the operator stops it
    h.datastore.insert_or_ignore(&record(7, 1.0, T0)).await.unwrap();
    h.datastore.insert_or_ignore(&record(8, 31.0, T0 + 30_000)).await.unwrap();

    let mut status = h.broker.subscribe([STATUS_SUBJECT]);
    let (client, _prompts) = ClientRuntime::new(h.broker.clone(), "A", "s1");
    let client = Arc::new(client);
    let client_cancel = CancellationToken::new();
    let client_task = {
        let client = client.clone();
        let cancel = client_cancel.clone();
        tokio::spawn(async move { client.run(cancel).await })
    };
    settle().await;

    let channel = h
        .manager
        .start_group_replay(window(T0, T0 + 60_000), 1.0)
        .unwrap();

    // The client follows the announcement and says so
    let mut joined = false;
    for _ in 0..10 {
        let beat: StatusHeartbeat =
            serde_json::from_slice(&status.recv().await.unwrap().payload).unwrap();
        if beat.state == "FollowingGroupReplay" {
            assert_eq!(beat.client_id, "A");
            assert_eq!(beat.channel_id, channel.id);
            joined = true;
            break;
        }
    }
    assert!(joined);
    assert_eq!(
        client.state(),
        ClientState::FollowingGroupReplay(channel.id.clone())
    );

    h.manager.stop_group_replay(&channel.id).unwrap();
    let mut back = false;
    for _ in 0..10 {
        let beat: StatusHeartbeat =
            serde_json::from_slice(&status.recv().await.unwrap().payload).unwrap();
        if beat.state == "FollowingLive" {
            back = true;
            break;
        }
    }
    assert!(back);
    assert_eq!(client.state(), ClientState::FollowingLive);
    assert!(!h.directory.contains(&channel.id));

    client_cancel.cancel();
    client_task.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn drained_replay_returns_clients_to_live_without_operator() {
    let h = harness();
    h.datastore.insert_or_ignore(&record(7, 1.0, T0)).await.unwrap();
    h.datastore.insert_or_ignore(&record(8, 2.0, T0 + 200)).await.unwrap();

    let (client, _prompts) = ClientRuntime::new(h.broker.clone(), "A", "s1");
    let client = Arc::new(client);
    let cancel = CancellationToken::new();
    let task = {
        let client = client.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { client.run(cancel).await })
    };
    settle().await;

    // Tight window: the pacer drains it and the manager broadcasts the stop
    let channel = h
        .manager
        .start_group_replay(window(T0, T0 + 1_000), 1.0)
        .unwrap();
    settle().await;
    assert_eq!(
        client.state(),
        ClientState::FollowingGroupReplay(channel.id.clone())
    );

    tokio::time::sleep(Duration::from_secs(2)).await;
    settle().await;
    assert_eq!(client.state(), ClientState::FollowingLive);
    assert!(!h.directory.contains(&channel.id));

    cancel.cancel();
    task.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn replay_delivery_is_paced_and_marked() {
    let h = harness();
    h.datastore.insert_or_ignore(&record(7, 1.0, T0)).await.unwrap();
    h.datastore.insert_or_ignore(&record(8, 2.0, T0 + 500)).await.unwrap();

    let channel_subject = "tspi.channel.replay.>";
    let mut replay_sub = h.broker.subscribe([channel_subject]);

    let started = tokio::time::Instant::now();
    h.manager
        .start_group_replay(window(T0, T0 + 1_000), 1.0)
        .unwrap();

    let first = replay_sub.recv().await.unwrap();
    assert_eq!(first.header(REPLAY_ORIGIN_HEADER), Some("datastore"));
    let first_record: TelemetryRecord = rmp_serde::from_slice(&first.payload).unwrap();
    assert_eq!(first_record.recv_epoch_ms, T0);

    let second = replay_sub.recv().await.unwrap();
    let second_record: TelemetryRecord = rmp_serde::from_slice(&second.payload).unwrap();
    assert_eq!(second_record.recv_epoch_ms, T0 + 500);
    // Original spacing survives the replay
    assert!(started.elapsed() >= Duration::from_millis(500));
}

// ========== private replay ==========

#[tokio::test(start_paused = true)]
async fn private_replay_isolates_and_prompts() {
    let h = harness();
    h.datastore.insert_or_ignore(&record(7, 1.0, T0)).await.unwrap();

    let (client_b, mut prompts) = ClientRuntime::new(h.broker.clone(), "B", "s1");
    let client_b = Arc::new(client_b);
    let cancel = CancellationToken::new();
    let task = {
        let client = client_b.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { client.run(cancel).await })
    };
    settle().await;

    let private = h
        .manager
        .create_private_replay("B", window(T0, T0 + 60_000), 1.0)
        .unwrap();
    client_b.select(private.clone()).unwrap();
    assert_eq!(
        client_b.state(),
        ClientState::FollowingPrivateReplay(private.id.clone())
    );

    // A group replay starting must not hijack the private viewer
    let group = h
        .manager
        .start_group_replay(window(T0, T0 + 30_000), 1.0)
        .unwrap();
    settle().await;
    assert_eq!(
        client_b.state(),
        ClientState::FollowingPrivateReplay(private.id.clone())
    );
    let prompted = prompts.recv().await.unwrap();
    assert_eq!(prompted.id, group.id);

    cancel.cancel();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn private_replay_expires_with_its_owner() {
    let h = harness();
    let channel = h
        .manager
        .create_private_replay("ghost", window(T0, T0 + 60_000), 1.0)
        .unwrap();

    // Owner never heartbeats, so the first prune sweeps the channel
    let roster = ClientRoster::new();
    let expired = h.manager.prune_private_replays(&roster);
    assert_eq!(expired, vec![channel.id.clone()]);
    assert!(!h.directory.contains(&channel.id));
}

// ========== tags in replay ==========

#[tokio::test(start_paused = true)]
async fn tag_replays_between_the_records_it_annotates() {
    let h = harness();
    h.datastore.insert_or_ignore(&record(7, 1.0, T0)).await.unwrap();
    h.datastore.insert_or_ignore(&record(8, 2.0, T0 + 1_000)).await.unwrap();
    let tag = Tag::new(Utc.timestamp_millis_opt(T0 + 400).unwrap(), "separation", "rso");
    h.datastore.insert_tag(&tag).await.unwrap();

    let mut replay_sub = h.broker.subscribe(["tspi.channel.replay.>"]);
    h.manager
        .start_group_replay(window(T0, T0 + 2_000), 1.0)
        .unwrap();

    let first = replay_sub.recv().await.unwrap();
    assert!(rmp_serde::from_slice::<TelemetryRecord>(&first.payload).is_ok());

    let second = replay_sub.recv().await.unwrap();
    let replayed_tag: Tag = serde_json::from_slice(&second.payload).unwrap();
    assert_eq!(replayed_tag.id, tag.id);

    let third = replay_sub.recv().await.unwrap();
    assert!(rmp_serde::from_slice::<TelemetryRecord>(&third.payload).is_ok());
}

#[tokio::test]
async fn broadcast_tags_reach_the_archive() {
    let h = harness();
    let archiver = Arc::new(Archiver::new(h.datastore.clone(), h.broker.clone()));
    let cancel = CancellationToken::new();
    let drain = {
        let archiver = archiver.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { archiver.run(cancel).await })
    };
    tokio::task::yield_now().await;

    let sender = TagSender::new(h.broker.clone());
    let tag = sender
        .create(Utc::now(), "hold fire", "rso", Some("pad hold".to_string()))
        .unwrap();

    settle().await;
    cancel.cancel();
    drain.await.unwrap().unwrap();

    let stored = h.datastore.get_tag(&tag.id).await.unwrap().unwrap();
    assert_eq!(stored.label, "hold fire");
}

// ========== discovery ==========

#[tokio::test]
async fn discovery_lists_live_then_group_then_private() {
    let h = harness();
    let cancel = CancellationToken::new();
    let task = {
        let broker = h.broker.clone();
        let directory = h.directory.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { serve_discovery(&broker, &directory, cancel).await })
    };
    tokio::task::yield_now().await;

    // Widely spaced records keep both pacers mid-sleep, so the replay
    // channels are still registered when the listing is requested.
    for r in [
        record(7, 10.0, T0),
        record(7, 40.0, T0 + 30_000),
        record(7, 110.0, T0 + 100_000),
        record(7, 140.0, T0 + 130_000),
    ] {
        h.datastore.insert_or_ignore(&r).await.unwrap();
    }

    h.manager
        .create_private_replay("alice", window(T0, T0 + 60_000), 1.0)
        .unwrap();
    h.manager
        .start_group_replay(window(T0 + 100_000, T0 + 160_000), 1.0)
        .unwrap();

    let mut inbox = h.broker.subscribe(["inbox.discovery"]);
    h.broker.publish(
        LIST_REQUEST_SUBJECT,
        Bytes::new(),
        HashMap::from([(REPLY_TO_HEADER.to_string(), "inbox.discovery".to_string())]),
    );

    let listings: Vec<ChannelListing> =
        serde_json::from_slice(&inbox.recv().await.unwrap().payload).unwrap();
    let kinds: Vec<ChannelKind> = listings.iter().map(|l| l.kind).collect();
    assert_eq!(
        kinds,
        vec![
            ChannelKind::Livestream,
            ChannelKind::GroupReplay,
            ChannelKind::PrivateReplay,
        ]
    );
    assert_eq!(listings[0].channel_id, "livestream");

    cancel.cancel();
    task.await.unwrap().unwrap();
}

// ========== operator roster ==========

#[tokio::test]
async fn roster_follows_client_heartbeats() {
    let h = harness();
    let roster = Arc::new(ClientRoster::new());
    let cancel = CancellationToken::new();
    let drain = {
        let broker = h.broker.clone();
        let roster = roster.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { drain_status(&broker, &roster, cancel).await })
    };
    tokio::task::yield_now().await;

    let (client, _prompts) = ClientRuntime::new(h.broker.clone(), "A", "s1");
    let replay = Channel::group_replay(window(T0, T0 + 1_000));
    client
        .handle(tspi::ChannelEvent::GroupReplayStart(replay.clone()))
        .unwrap();

    settle().await;
    cancel.cancel();
    drain.await.unwrap();

    let presence = roster.get("A").unwrap();
    assert_eq!(presence.state, "FollowingGroupReplay");
    assert_eq!(presence.channel_id, replay.id);
}

// ========== live fan-out ==========

#[tokio::test]
async fn live_channel_receives_only_stream_subjects() {
    let h = harness();
    let cancel = CancellationToken::new();
    let _fanout = h.broker.bind_consumer(tspi::live_consumer_config(), cancel.clone());
    let mut live = h.broker.subscribe(["tspi.channel.livestream"]);
    tokio::task::yield_now().await;

    assert!(STREAM_FILTERS.contains(&"tspi.geocentric.>"));
    let producer = TspiProducer::new(h.broker.clone());
    producer.publish_record(&record(7, 1.0, T0)).unwrap();
    // Control traffic must not leak onto the live channel
    h.broker.publish(CONTROL_SUBJECT, Bytes::from_static(b"{}"), HashMap::new());

    let delivered = live.recv().await.unwrap();
    let envelope: TelemetryRecord = rmp_serde::from_slice(&delivered.payload).unwrap();
    assert_eq!(envelope.frame.sensor_id, 7);
    assert!(live.try_recv().is_none());

    cancel.cancel();
}

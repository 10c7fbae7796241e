// tests/stream_test.rs
// Live stream sessions against the SQLite-backed store

mod common;

use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;

use common::Harness;
use log_notifier::stream::{LiveStreamBroker, StreamFrame, StreamSettings};
use log_notifier::{LogLevel, ParsedEntry};

fn short_session() -> StreamSettings {
    StreamSettings {
        session: Duration::from_millis(400),
        heartbeat: Duration::from_millis(150),
        poll: Duration::from_millis(20),
        batch_size: 10,
    }
}

fn record_ids(frames: &[StreamFrame]) -> Vec<i64> {
    frames
        .iter()
        .filter_map(|frame| match frame {
            StreamFrame::Record { id, .. } => Some(*id),
            _ => None,
        })
        .collect()
}

async fn seed(h: &Harness, count: usize) {
    for i in 0..count {
        h.watcher
            .store()
            .store(&ParsedEntry::new(LogLevel::Error, format!("seeded failure {i}")))
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn resume_delivers_only_newer_records_in_order() {
    let h = Harness::new().await;
    seed(&h, 5).await;

    let broker = LiveStreamBroker::new(Arc::new(h.watcher.store().clone()), short_session());
    let frames: Vec<StreamFrame> = broker.open(2).collect().await;

    assert_eq!(record_ids(&frames), vec![3, 4, 5]);
    assert_eq!(frames.first(), Some(&StreamFrame::Comment("Connected".into())));
    assert!(matches!(frames.last(), Some(StreamFrame::Close { .. })));
}

#[tokio::test]
async fn fresh_connection_sees_only_future_records() {
    let h = Harness::new().await;
    seed(&h, 3).await;

    let broker = LiveStreamBroker::new(Arc::new(h.watcher.store().clone()), short_session());
    let session = tokio::spawn({
        let broker = broker.clone();
        async move { broker.open(0).collect::<Vec<_>>().await }
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    h.watcher
        .store()
        .store(&ParsedEntry::new(LogLevel::Critical, "arrived while connected"))
        .await
        .unwrap();

    let frames = session.await.unwrap();
    assert_eq!(record_ids(&frames), vec![4]);
    match frames.iter().find(|f| matches!(f, StreamFrame::Record { .. })) {
        Some(StreamFrame::Record { payload, .. }) => {
            assert_eq!(payload.message, "arrived while connected");
            assert_eq!(payload.level, "critical");
        }
        other => panic!("expected a record frame, got {other:?}"),
    }
}

#[tokio::test]
async fn reconnect_with_last_seen_id_continues_without_gaps() {
    let h = Harness::new().await;
    seed(&h, 2).await;
    let broker = LiveStreamBroker::new(Arc::new(h.watcher.store().clone()), short_session());

    let first = broker.open(1).collect::<Vec<_>>().await;
    let last_seen = *record_ids(&first).last().unwrap();
    assert_eq!(last_seen, 2);

    seed(&h, 2).await;
    let second = broker.open(last_seen).collect::<Vec<_>>().await;
    assert_eq!(record_ids(&second), vec![3, 4]);
}

#[tokio::test]
async fn session_outlives_the_broker_handle() {
    let h = Harness::new().await;
    seed(&h, 1).await;
    let session = {
        let broker = LiveStreamBroker::new(Arc::new(h.watcher.store().clone()), short_session());
        broker.open(0)
    };
    let frames = tokio::spawn(session.collect::<Vec<_>>()).await.unwrap();
    assert!(matches!(frames.last(), Some(StreamFrame::Close { .. })));
}

#[tokio::test]
async fn idle_sessions_send_heartbeats() {
    let h = Harness::new().await;
    let broker = LiveStreamBroker::new(Arc::new(h.watcher.store().clone()), short_session());
    let frames = broker.open(0).collect::<Vec<_>>().await;
    assert!(frames.iter().any(|f| *f == StreamFrame::Heartbeat));
    assert!(record_ids(&frames).is_empty());
}

#[tokio::test]
async fn watcher_output_reaches_memory_backed_stream() {
    let h = Harness::new().await;
    let broker = LiveStreamBroker::new(h.watcher.recent().clone(), short_session());
    let session = tokio::spawn({
        let broker = broker.clone();
        async move { broker.open(0).collect::<Vec<_>>().await }
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    h.append("laravel.log", &h.entry("ERROR", "seen by the tailer"));
    let created = h.watcher.watch().await;

    let frames = session.await.unwrap();
    assert_eq!(record_ids(&frames), vec![created[0].id]);
}

mod common;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use common::assert_silent;
use common::fast_config;
use common::recv;
use common::recv_events;
use common::started_store;
use revwatch::EventType;
use revwatch::WatchConfig;
use revwatch::WatchCreateRequest;
use revwatch::WatchFilters;
use revwatch::WriteOp;
use revwatch::COMPACTED_REASON;

#[tokio::test]
async fn sequential_puts_arrive_in_revision_order() {
    let store = started_store(fast_config());
    let (stream, mut responses) = store.watch_stream();
    stream.create(WatchCreateRequest::key("foo")).unwrap();
    assert!(recv(&mut responses).await.created);

    for _ in 0..3 {
        store.put("foo", "bar").unwrap();
    }

    let events = recv_events(&mut responses, 3).await;
    let revisions: Vec<_> = events.iter().map(|e| e.kv.mod_revision).collect();
    let versions: Vec<_> = events.iter().map(|e| e.kv.version).collect();
    assert_eq!(revisions, vec![2, 3, 4]);
    assert_eq!(versions, vec![1, 2, 3]);
    assert!(events.iter().all(|e| e.kv.create_revision == 2));
}

#[tokio::test]
async fn future_start_revision_delivers_only_from_that_revision() {
    let store = started_store(fast_config());
    let (stream, mut responses) = store.watch_stream();
    stream
        .create(WatchCreateRequest::key("foo").with_start_revision(10))
        .unwrap();
    assert!(recv(&mut responses).await.created);

    while store.current_revision() < 10 {
        store.put("foo", "bar").unwrap();
    }

    let events = recv_events(&mut responses, 1).await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kv.mod_revision, 10);
    assert_silent(&mut responses, Duration::from_millis(100)).await;
}

#[tokio::test]
async fn cancelled_watcher_goes_quiet() {
    let store = started_store(fast_config());
    let (stream, mut responses) = store.watch_stream();
    let (watch_id, _) = stream.create(WatchCreateRequest::key("foo")).unwrap();
    stream.cancel(watch_id).unwrap();

    assert!(recv(&mut responses).await.created);
    let terminal = recv(&mut responses).await;
    assert!(terminal.canceled);
    assert_eq!(terminal.watch_id, watch_id);

    store.put("foo", "bar").unwrap();
    store.put("foo", "baz").unwrap();
    assert_silent(&mut responses, Duration::from_millis(100)).await;
}

#[tokio::test]
async fn stalled_consumer_behind_compaction_is_cancelled() {
    let store = started_store(WatchConfig {
        watcher_buffer_size: 2,
        ..fast_config()
    });
    let (stream, mut responses) = store.watch_stream();
    let (watch_id, _) = stream.create(WatchCreateRequest::key("foo")).unwrap();

    for _ in 0..10 {
        store.put("foo", "bar").unwrap();
    }
    store.compact(11).unwrap();

    assert!(recv(&mut responses).await.created);
    let buffered = recv(&mut responses).await;
    assert_eq!(buffered.events[0].kv.mod_revision, 2);
    let terminal = recv(&mut responses).await;
    assert_eq!(terminal.watch_id, watch_id);
    assert!(terminal.canceled);
    assert_eq!(terminal.compact_revision, 11);
    assert_eq!(terminal.cancel_reason.as_deref(), Some(COMPACTED_REASON));
    assert_eq!(store.engine().stats().active, 0);
}

#[tokio::test]
async fn key_and_prefix_watchers_match_independently() {
    let store = started_store(fast_config());
    let (stream, mut responses) = store.watch_stream();
    let (key_id, _) = stream.create(WatchCreateRequest::key("foo")).unwrap();
    let (prefix_id, _) = stream.create(WatchCreateRequest::range("fo", "fp")).unwrap();
    recv(&mut responses).await;
    recv(&mut responses).await;

    store.put("foo", "1").unwrap();
    let mut first = vec![recv(&mut responses).await, recv(&mut responses).await];
    first.sort_by_key(|r| r.watch_id);
    assert_eq!(first[0].watch_id, key_id);
    assert_eq!(first[1].watch_id, prefix_id);
    assert!(first.iter().all(|r| r.events[0].kv.key == "foo"));

    store.put("fo", "2").unwrap();
    let second = recv(&mut responses).await;
    assert_eq!(second.watch_id, prefix_id);
    assert_eq!(second.events[0].kv.key, "fo");
    assert_silent(&mut responses, Duration::from_millis(100)).await;
}

#[tokio::test]
async fn history_replay_carries_delete_shape_and_prev_kv() {
    let store = started_store(fast_config());
    store.put("foo", "v1").unwrap();
    store.put("foo", "v2").unwrap();
    store.delete_range("foo", "").unwrap();

    let (stream, mut responses) = store.watch_stream();
    stream
        .create(
            WatchCreateRequest::key("foo")
                .with_start_revision(2)
                .with_prev_kv(),
        )
        .unwrap();

    let events = recv_events(&mut responses, 3).await;
    assert_eq!(events[0].event_type, EventType::Put);
    assert!(events[0].prev_kv.is_none());
    assert_eq!(events[1].prev_kv.as_ref().unwrap().value, Bytes::from("v1"));

    let delete = &events[2];
    assert_eq!(delete.event_type, EventType::Delete);
    assert_eq!(delete.kv.key, "foo");
    assert_eq!(delete.kv.mod_revision, 4);
    assert!(delete.kv.value.is_empty());
    assert_eq!(delete.kv.version, 0);
    assert_eq!(delete.kv.create_revision, 0);
    assert_eq!(delete.prev_kv.as_ref().unwrap().value, Bytes::from("v2"));
}

#[tokio::test]
async fn filters_drop_unwanted_event_kinds() {
    let store = started_store(fast_config());
    let (stream, mut responses) = store.watch_stream();
    stream
        .create(WatchCreateRequest::prefix("k").with_filters(WatchFilters::NOPUT))
        .unwrap();
    assert!(recv(&mut responses).await.created);

    store.put("k1", "a").unwrap();
    store.put("k2", "a").unwrap();
    store.delete_range("k1", "").unwrap();

    let events = recv_events(&mut responses, 1).await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, EventType::Delete);
    assert_eq!(events[0].kv.mod_revision, 4);
    assert_silent(&mut responses, Duration::from_millis(50)).await;
}

#[tokio::test]
async fn transaction_is_one_response_at_one_revision() {
    let store = started_store(fast_config());
    store.put("a", "0").unwrap();
    let (stream, mut responses) = store.watch_stream();
    stream.create(WatchCreateRequest::range("a", "\0")).unwrap();
    assert!(recv(&mut responses).await.created);

    store
        .txn(vec![
            WriteOp::put("b", "1"),
            WriteOp::delete("a"),
            WriteOp::put("c", "1"),
        ])
        .unwrap();

    let response = recv(&mut responses).await;
    assert_eq!(response.header_revision, 3);
    assert_eq!(response.events.len(), 3);
    assert!(response.events.iter().all(|e| e.kv.mod_revision == 3));
}

#[tokio::test]
async fn idle_watcher_receives_periodic_progress() {
    let store = started_store(fast_config());
    store.put("other", "1").unwrap();
    let (stream, mut responses) = store.watch_stream();
    let (watch_id, _) = stream
        .create(WatchCreateRequest::key("foo").with_progress_notify())
        .unwrap();
    assert!(recv(&mut responses).await.created);

    let progress = recv(&mut responses).await;
    assert!(progress.is_progress_notify());
    assert_eq!(progress.watch_id, watch_id);
    assert_eq!(progress.header_revision, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn slow_consumer_sees_every_revision_exactly_once() {
    let store = Arc::new(started_store(WatchConfig {
        watcher_buffer_size: 4,
        max_revisions_per_sync: 16,
        ..fast_config()
    }));
    let (stream, mut responses) = store.watch_stream();
    stream.create(WatchCreateRequest::key("hot")).unwrap();

    let writer_store = store.clone();
    let writer = tokio::spawn(async move {
        for i in 0..200 {
            writer_store.put("hot", format!("{i}")).unwrap();
            if i % 25 == 0 {
                tokio::task::yield_now().await;
            }
        }
    });

    let mut seen = Vec::new();
    while seen.len() < 200 {
        let response = recv(&mut responses).await;
        assert!(!response.canceled);
        seen.extend(response.events.iter().map(|e| e.kv.mod_revision));
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    writer.await.unwrap();

    assert_eq!(seen, (2..202).collect::<Vec<u64>>());
    assert_eq!(store.engine().stats().active, 1);
}

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio_stream::StreamExt;

use super::*;
use crate::test_utils::assert_no_response;
use crate::test_utils::next_events;
use crate::test_utils::next_response;
use crate::test_utils::test_config;
use crate::test_utils::test_config_with_buffer;
use crate::Error;
use crate::MemStore;
use crate::MockRevisionSource;
use crate::RevisionBatch;
use crate::StorageError;
use crate::WatchConfig;
use crate::WatchError;
use crate::WatchableStore;
use crate::COMPACTED_REASON;
use crate::INVALID_WATCH_ID;
use crate::WATCH_CATCHUP_DURATION_SECONDS;

fn revisions(response: &WatchResponse) -> Vec<u64> {
    response.events.iter().map(|e| e.kv.mod_revision).collect()
}

fn mock_source(
    current: u64,
    boundary: u64,
) -> MockRevisionSource {
    let mut source = MockRevisionSource::new();
    source.expect_current_revision().return_const(current);
    source.expect_compaction_boundary().return_const(boundary);
    source
}

#[tokio::test]
async fn watcher_from_now_is_synced_and_acknowledged() {
    let store = WatchableStore::new(test_config());
    store.put("a", "1").unwrap();
    let (stream, mut responses) = store.watch_stream();

    let (watch_id, revision) = stream.create(WatchCreateRequest::key("foo")).unwrap();

    assert_eq!(watch_id, 0);
    assert_eq!(revision, 2);
    let stats = store.engine().stats();
    assert_eq!((stats.active, stats.synced, stats.unsynced), (1, 1, 0));

    let ack = next_response(&mut responses).await;
    assert!(ack.created);
    assert!(!ack.canceled);
    assert_eq!(ack.watch_id, 0);
    assert_eq!(ack.header_revision, 2);
}

#[tokio::test]
async fn past_start_revision_is_replayed_then_goes_live() {
    let store = WatchableStore::new(test_config());
    for _ in 0..3 {
        store.put("foo", "bar").unwrap();
    }
    let (stream, mut responses) = store.watch_stream();
    stream
        .create(WatchCreateRequest::key("foo").with_start_revision(2))
        .unwrap();

    let stats = store.engine().stats();
    assert_eq!(stats.unsynced, 1);
    assert_eq!(stats.watchers[0].lag, 3);

    assert!(!store.engine().sync_round().await.unwrap());
    assert_eq!(store.engine().stats().synced, 1);

    assert!(next_response(&mut responses).await.created);
    let replay = next_response(&mut responses).await;
    assert_eq!(revisions(&replay), vec![2, 3, 4]);
    assert_eq!(replay.header_revision, 4);

    store.put("foo", "bar").unwrap();
    let live = next_response(&mut responses).await;
    assert_eq!(revisions(&live), vec![5]);
}

#[tokio::test]
async fn catch_up_window_is_bounded_per_round() {
    let config = WatchConfig {
        max_revisions_per_sync: 2,
        ..test_config()
    };
    let store = WatchableStore::new(config);
    for _ in 0..5 {
        store.put("foo", "bar").unwrap();
    }
    let (stream, mut responses) = store.watch_stream();
    stream
        .create(WatchCreateRequest::key("foo").with_start_revision(2))
        .unwrap();
    assert!(next_response(&mut responses).await.created);

    assert!(store.engine().sync_round().await.unwrap());
    assert_eq!(revisions(&next_response(&mut responses).await), vec![2, 3]);
    assert!(store.engine().sync_round().await.unwrap());
    assert_eq!(revisions(&next_response(&mut responses).await), vec![4, 5]);
    assert!(!store.engine().sync_round().await.unwrap());
    assert_eq!(revisions(&next_response(&mut responses).await), vec![6]);
    assert_eq!(store.engine().stats().synced, 1);
}

#[tokio::test]
async fn future_start_revision_waits_for_the_store() {
    let store = WatchableStore::new(test_config());
    let (stream, mut responses) = store.watch_stream();
    stream
        .create(WatchCreateRequest::key("foo").with_start_revision(4))
        .unwrap();
    assert!(next_response(&mut responses).await.created);

    assert!(!store.engine().sync_round().await.unwrap());
    store.put("foo", "early").unwrap();
    store.put("foo", "early").unwrap();
    assert!(!store.engine().sync_round().await.unwrap());
    assert_eq!(store.engine().stats().synced, 1);

    store.put("foo", "on time").unwrap();
    let response = next_response(&mut responses).await;
    assert_eq!(revisions(&response), vec![4]);
    assert_eq!(response.events[0].kv.value, Bytes::from("on time"));
}

#[tokio::test]
async fn full_buffer_demotes_instead_of_blocking() {
    let store = WatchableStore::new(test_config_with_buffer(2));
    let (stream, mut responses) = store.watch_stream();
    stream.create(WatchCreateRequest::key("foo")).unwrap();

    // ack + revision 2 fill the buffer; revision 3 cannot be enqueued
    store.put("foo", "1").unwrap();
    store.put("foo", "2").unwrap();

    let stats = store.engine().stats();
    assert_eq!(stats.unsynced, 1);
    assert_eq!(stats.watchers[0].lag, 1);

    assert!(next_response(&mut responses).await.created);
    assert_eq!(revisions(&next_response(&mut responses).await), vec![2]);

    assert!(!store.engine().sync_round().await.unwrap());
    assert_eq!(revisions(&next_response(&mut responses).await), vec![3]);
    assert_eq!(store.engine().stats().synced, 1);

    store.put("foo", "3").unwrap();
    assert_eq!(revisions(&next_response(&mut responses).await), vec![4]);
}

#[tokio::test]
async fn stalled_watcher_does_not_hold_back_others() {
    let config = WatchConfig {
        watcher_buffer_size: 1,
        max_revisions_per_sync: 2,
        ..test_config()
    };
    let store = WatchableStore::new(config);
    for _ in 0..10 {
        store.put("foo", "bar").unwrap();
    }
    // its ack fills the buffer and is never read
    let (stalled, mut stalled_responses) = store.watch_stream();
    stalled
        .create(WatchCreateRequest::key("foo").with_start_revision(2))
        .unwrap();
    let (healthy, mut healthy_responses) = store.watch_stream();
    healthy
        .create(WatchCreateRequest::key("foo").with_start_revision(8))
        .unwrap();
    assert!(next_response(&mut healthy_responses).await.created);

    store.engine().sync_round().await.unwrap();
    assert_eq!(revisions(&next_response(&mut healthy_responses).await), vec![8, 9]);
    store.engine().sync_round().await.unwrap();
    assert_eq!(revisions(&next_response(&mut healthy_responses).await), vec![10, 11]);

    let lags: Vec<_> = store
        .engine()
        .stats()
        .watchers
        .iter()
        .map(|w| (w.stream_id, w.state, w.lag))
        .collect();
    assert_eq!(
        lags,
        vec![
            (stalled.id(), WatcherState::Unsynced, 10),
            (healthy.id(), WatcherState::Synced, 0),
        ]
    );

    // resumes from its own cursor once drained
    assert!(next_response(&mut stalled_responses).await.created);
    store.engine().sync_round().await.unwrap();
    assert_eq!(revisions(&next_response(&mut stalled_responses).await), vec![2, 3]);
}

#[tokio::test]
async fn compacted_history_cancels_unsynced_watcher() {
    let store = WatchableStore::new(test_config());
    for _ in 0..5 {
        store.put("foo", "bar").unwrap();
    }
    store.compact(5).unwrap();
    let (stream, mut responses) = store.watch_stream();
    let (watch_id, _) = stream
        .create(WatchCreateRequest::key("foo").with_start_revision(3))
        .unwrap();

    store.engine().sync_round().await.unwrap();

    assert!(next_response(&mut responses).await.created);
    let terminal = next_response(&mut responses).await;
    assert_eq!(terminal.watch_id, watch_id);
    assert!(terminal.canceled);
    assert_eq!(terminal.compact_revision, 5);
    assert_eq!(terminal.cancel_reason.as_deref(), Some(COMPACTED_REASON));
    assert!(terminal.events.is_empty());
    assert_eq!(store.engine().stats().active, 0);
    assert!(stream.watch_ids().is_empty());
}

#[tokio::test]
async fn straddling_compaction_cancels_without_reading() {
    let mut source = mock_source(10, 6);
    source.expect_read_range().times(0);
    let engine = WatchEngine::new(test_config(), Arc::new(source));
    let (stream, mut responses) = engine.new_stream();
    stream
        .create(WatchCreateRequest::prefix("k").with_start_revision(4))
        .unwrap();

    assert!(!engine.sync_round().await.unwrap());

    assert!(next_response(&mut responses).await.created);
    let terminal = next_response(&mut responses).await;
    assert!(terminal.canceled);
    assert_eq!(terminal.compact_revision, 6);
    assert_eq!(terminal.header_revision, 10);
    assert_no_response(&mut responses, Duration::from_millis(50)).await;
}

#[tokio::test]
async fn read_failure_cancels_with_internal_error() {
    let mut source = mock_source(10, 0);
    source
        .expect_read_range()
        .times(1)
        .returning(|_, _, _| Err(StorageError::ReadFailure("disk gone".to_string()).into()));
    let engine = WatchEngine::new(test_config(), Arc::new(source));
    let (stream, mut responses) = engine.new_stream();
    stream
        .create(WatchCreateRequest::key("foo").with_start_revision(3))
        .unwrap();

    assert!(!engine.sync_round().await.unwrap());

    assert!(next_response(&mut responses).await.created);
    let terminal = next_response(&mut responses).await;
    assert!(terminal.canceled);
    assert_eq!(terminal.compact_revision, 0);
    assert!(terminal.cancel_reason.unwrap().contains("disk gone"));
    assert_eq!(engine.stats().active, 0);
}

#[tokio::test]
async fn rounds_ending_on_a_read_error_are_timed() {
    let config = WatchConfig {
        enable_metrics: true,
        ..test_config()
    };
    let before = WATCH_CATCHUP_DURATION_SECONDS.get_sample_count();

    let mut compacted = mock_source(10, 0);
    compacted.expect_read_range().times(1).returning(|from, _, _| {
        Err(StorageError::Compacted {
            requested: from,
            compact_revision: 5,
        }
        .into())
    });
    let engine = WatchEngine::new(config.clone(), Arc::new(compacted));
    let (stream, _responses) = engine.new_stream();
    stream
        .create(WatchCreateRequest::key("foo").with_start_revision(3))
        .unwrap();
    assert!(!engine.sync_round().await.unwrap());

    let mut failing = mock_source(10, 0);
    failing
        .expect_read_range()
        .times(1)
        .returning(|_, _, _| Err(StorageError::ReadFailure("io".to_string()).into()));
    let engine = WatchEngine::new(config, Arc::new(failing));
    let (stream, _responses) = engine.new_stream();
    stream
        .create(WatchCreateRequest::key("foo").with_start_revision(3))
        .unwrap();
    assert!(!engine.sync_round().await.unwrap());

    assert!(WATCH_CATCHUP_DURATION_SECONDS.get_sample_count() >= before + 2);
}

#[tokio::test]
async fn request_progress_skips_unsynced_watchers() {
    let store = WatchableStore::new(test_config());
    store.put("foo", "1").unwrap();
    store.put("foo", "2").unwrap();
    let (stream, mut responses) = store.watch_stream();
    let (synced_id, _) = stream.create(WatchCreateRequest::key("foo")).unwrap();
    let (unsynced_id, _) = stream
        .create(WatchCreateRequest::key("foo").with_start_revision(2))
        .unwrap();

    assert_eq!(stream.request_progress().unwrap(), 1);
    stream.request_watch_progress(unsynced_id).unwrap();

    let mut received = Vec::new();
    for _ in 0..3 {
        received.push(next_response(&mut responses).await);
    }
    let progress: Vec<_> = received.iter().filter(|r| r.is_progress_notify()).collect();
    assert_eq!(progress.len(), 1);
    assert_eq!(progress[0].watch_id, synced_id);
    assert_eq!(progress[0].header_revision, 3);
    assert_no_response(&mut responses, Duration::from_millis(50)).await;

    assert!(matches!(
        stream.request_watch_progress(99),
        Err(Error::Watch(WatchError::InvalidWatchId(99)))
    ));
}

#[tokio::test]
async fn periodic_progress_reaches_only_idle_watchers() {
    let store = WatchableStore::new(test_config());
    let (stream, mut responses) = store.watch_stream();
    stream
        .create(WatchCreateRequest::key("foo").with_progress_notify())
        .unwrap();
    stream
        .create(WatchCreateRequest::key("bar").with_progress_notify())
        .unwrap();
    stream.create(WatchCreateRequest::key("baz")).unwrap();
    let engine = store.engine();

    assert_eq!(engine.notify_idle_progress(), 2);

    store.put("foo", "1").unwrap();
    assert_eq!(engine.notify_idle_progress(), 1);
    assert_eq!(engine.notify_idle_progress(), 2);

    let mut progress = 0;
    for _ in 0..9 {
        let response = next_response(&mut responses).await;
        if response.is_progress_notify() {
            progress += 1;
        }
    }
    assert_eq!(progress, 5);
}

#[tokio::test]
async fn explicit_watch_ids_are_unique_per_stream() {
    let store = WatchableStore::new(test_config());
    let (stream, mut responses) = store.watch_stream();

    assert_eq!(stream.create(WatchCreateRequest::key("a").with_watch_id(1)).unwrap().0, 1);
    assert_eq!(stream.create(WatchCreateRequest::key("a")).unwrap().0, 0);
    assert_eq!(stream.create(WatchCreateRequest::key("a")).unwrap().0, 2);

    let err = stream
        .create(WatchCreateRequest::key("a").with_watch_id(1))
        .unwrap_err();
    assert!(matches!(err, Error::Watch(WatchError::WatchIdExists(1))));

    let (other, _other_responses) = store.watch_stream();
    assert_eq!(other.create(WatchCreateRequest::key("a").with_watch_id(1)).unwrap().0, 1);

    let mut rejected = None;
    for _ in 0..4 {
        let response = next_response(&mut responses).await;
        if response.canceled {
            rejected = Some(response);
        }
    }
    let rejected = rejected.unwrap();
    assert!(rejected.created);
    assert_eq!(rejected.watch_id, INVALID_WATCH_ID);
    assert_eq!(stream.watch_ids(), vec![0, 1, 2]);
}

#[tokio::test]
async fn cancelled_id_can_be_reused() {
    let store = WatchableStore::new(test_config());
    let (stream, mut responses) = store.watch_stream();
    let (watch_id, _) = stream.create(WatchCreateRequest::key("a").with_watch_id(7)).unwrap();
    stream.cancel(watch_id).unwrap();

    assert!(next_response(&mut responses).await.created);
    let terminal = next_response(&mut responses).await;
    assert!(terminal.canceled);
    assert_eq!(terminal.watch_id, 7);
    assert_eq!(terminal.cancel_reason, None);

    assert_eq!(stream.create(WatchCreateRequest::key("a").with_watch_id(7)).unwrap().0, 7);
}

#[tokio::test]
async fn dropped_receiver_cancels_on_next_delivery() {
    let store = WatchableStore::new(test_config());
    let (stream, responses) = store.watch_stream();
    stream.create(WatchCreateRequest::key("foo")).unwrap();
    drop(responses);

    store.put("foo", "bar").unwrap();

    assert_eq!(store.engine().stats().active, 0);
    assert!(stream.watch_ids().is_empty());
}

#[tokio::test]
async fn dropping_the_stream_cancels_its_watchers() {
    let store = WatchableStore::new(test_config());
    let (stream, mut responses) = store.watch_stream();
    stream.create(WatchCreateRequest::key("foo")).unwrap();
    stream.create(WatchCreateRequest::prefix("f")).unwrap();
    assert_eq!(store.engine().stats().streams, 1);

    drop(stream);

    let stats = store.engine().stats();
    assert_eq!((stats.active, stats.streams), (0, 0));
    store.put("foo", "bar").unwrap();

    // both acks drain, then the session ends without terminal responses
    assert!(next_response(&mut responses).await.created);
    assert!(next_response(&mut responses).await.created);
    let end = tokio::time::timeout(Duration::from_secs(1), responses.next())
        .await
        .unwrap();
    assert!(end.is_none());
}

#[test]
fn stale_batches_do_not_move_the_revision() {
    let engine = WatchEngine::new(test_config(), Arc::new(MemStore::new()));
    engine.notify(&RevisionBatch {
        revision: 3,
        events: vec![],
    });
    engine.notify(&RevisionBatch {
        revision: 2,
        events: vec![],
    });

    assert_eq!(engine.current_revision(), 3);
}

#[test]
fn start_requires_a_runtime() {
    let engine = WatchEngine::new(test_config(), Arc::new(MemStore::new()));

    assert!(matches!(engine.start(), Err(Error::Fatal(_))));
}

#[tokio::test]
async fn start_and_stop_are_idempotent() {
    let engine = WatchEngine::new(test_config(), Arc::new(MemStore::new()));

    engine.start().unwrap();
    engine.start().unwrap();
    engine.stop();
    engine.stop();
    engine.start().unwrap();
    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn background_loop_recovers_a_demoted_watcher() {
    let store = WatchableStore::new(test_config_with_buffer(2));
    store.start().unwrap();
    let (stream, mut responses) = store.watch_stream();
    stream.create(WatchCreateRequest::key("foo")).unwrap();

    for i in 0..10 {
        store.put("foo", format!("v{i}")).unwrap();
    }

    let mut seen = Vec::new();
    while seen.len() < 10 {
        let response = next_events(&mut responses).await;
        seen.extend(revisions(&response));
    }
    assert_eq!(seen, (2..12).collect::<Vec<u64>>());

    store.put("foo", "live").unwrap();
    assert_eq!(revisions(&next_events(&mut responses).await), vec![12]);
    store.stop();
}

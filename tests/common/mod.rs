#![allow(dead_code)]

use std::sync::Once;
use std::time::Duration;

use revwatch::Event;
use revwatch::WatchConfig;
use revwatch::WatchResponse;
use revwatch::WatchResponses;
use revwatch::WatchableStore;
use tokio::time::timeout;
use tokio_stream::StreamExt;

pub const RECV_TIMEOUT: Duration = Duration::from_secs(3);

static LOGGER_INIT: Once = Once::new();

pub fn enable_logger() {
    LOGGER_INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub fn fast_config() -> WatchConfig {
    WatchConfig {
        sync_interval_ms: 10,
        progress_notify_interval_ms: 100,
        enable_metrics: false,
        ..Default::default()
    }
}

/// Store with its background tasks running
pub fn started_store(config: WatchConfig) -> WatchableStore {
    enable_logger();
    let store = WatchableStore::new(config);
    store.start().expect("engine should start inside a runtime");
    store
}

pub async fn recv(responses: &mut WatchResponses) -> WatchResponse {
    timeout(RECV_TIMEOUT, responses.next())
        .await
        .expect("timed out waiting for a watch response")
        .expect("watch response stream ended")
        .expect("watch response carried an error")
}

/// Collects events until `count` arrived, skipping acknowledgments and progress
pub async fn recv_events(
    responses: &mut WatchResponses,
    count: usize,
) -> Vec<Event> {
    let mut events = Vec::new();
    while events.len() < count {
        let response = recv(responses).await;
        assert!(!response.canceled, "unexpected cancel: {:?}", response);
        events.extend(response.events);
    }
    events
}

pub async fn assert_silent(
    responses: &mut WatchResponses,
    wait: Duration,
) {
    if let Ok(Some(item)) = timeout(wait, responses.next()).await {
        panic!("expected no watch response, got {:?}", item);
    }
}

//! Helpers shared by the unit tests
use std::time::Duration;

use tokio::time::timeout;
use tokio_stream::StreamExt;

use crate::WatchConfig;
use crate::WatchResponse;
use crate::WatchResponses;

pub(crate) const RECV_TIMEOUT: Duration = Duration::from_secs(2);

/// Short intervals so background tasks react within a test's patience
pub(crate) fn test_config() -> WatchConfig {
    WatchConfig {
        sync_interval_ms: 10,
        progress_notify_interval_ms: 50,
        enable_metrics: false,
        ..Default::default()
    }
}

pub(crate) fn test_config_with_buffer(buffer: usize) -> WatchConfig {
    WatchConfig {
        watcher_buffer_size: buffer,
        ..test_config()
    }
}

/// Next response, failing the test on timeout, end of stream or delivery error
pub(crate) async fn next_response(responses: &mut WatchResponses) -> WatchResponse {
    timeout(RECV_TIMEOUT, responses.next())
        .await
        .expect("timed out waiting for a watch response")
        .expect("watch response stream ended")
        .expect("watch response carried an error")
}

/// Asserts nothing arrives within `wait`
pub(crate) async fn assert_no_response(
    responses: &mut WatchResponses,
    wait: Duration,
) {
    if let Ok(Some(item)) = timeout(wait, responses.next()).await {
        panic!("expected no watch response, got {:?}", item);
    }
}

/// Reads responses until one carries events
pub(crate) async fn next_events(responses: &mut WatchResponses) -> WatchResponse {
    loop {
        let response = next_response(responses).await;
        if !response.events.is_empty() {
            return response;
        }
    }
}

use std::time::Duration;

use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;
use tracing::warn;

use crate::Error;
use crate::Result;

/// Tuning knobs for the watch engine
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct WatchConfig {
    /// Capacity of each watcher's outbound buffer, in responses
    ///
    /// A watcher whose buffer is full when a commit is fanned out is not
    /// blocked on. It is moved to the unsynced group and the catch-up loop
    /// replays the backlog from history once the consumer drains.
    ///
    /// **Tuning Guidelines**:
    /// - Fast consumers: 16-64
    /// - Bursty writers or slow consumers: 128-1024
    ///
    /// **Default**: 128
    #[serde(default = "default_watcher_buffer_size")]
    pub watcher_buffer_size: usize,

    /// Period of the unsynced catch-up loop in milliseconds
    ///
    /// The loop is also woken immediately when a watcher lands in the
    /// unsynced group, so this only bounds the retry delay for watchers
    /// whose buffers were still full on the previous round.
    ///
    /// **Default**: 100
    #[serde(default = "default_sync_interval_ms")]
    pub sync_interval_ms: u64,

    /// Upper bound on the unsynced watchers serviced by one catch-up round
    ///
    /// **Default**: 512
    #[serde(default = "default_max_watchers_per_sync")]
    pub max_watchers_per_sync: usize,

    /// Upper bound on the revision window read from history by one round
    ///
    /// **Default**: 1000
    #[serde(default = "default_max_revisions_per_sync")]
    pub max_revisions_per_sync: u64,

    /// Interval of the periodic progress notification in milliseconds
    ///
    /// **Default**: 600000 (10 minutes)
    #[serde(default = "default_progress_notify_interval_ms")]
    pub progress_notify_interval_ms: u64,

    /// Byte threshold above which a response is split into fragments
    /// for watchers that allow fragmentation
    ///
    /// **Default**: 1.5 MiB
    #[serde(default = "default_max_request_bytes")]
    pub max_request_bytes: usize,

    /// Receive limit of the transport; an unfragmented response larger
    /// than this cancels its watcher with a resource-exhaustion error
    ///
    /// **Default**: i32::MAX
    #[serde(default = "default_max_response_bytes")]
    pub max_response_bytes: usize,

    /// Update prometheus collectors from the engine
    ///
    /// **Default**: true
    #[serde(default = "default_enable_watch_metrics")]
    pub enable_metrics: bool,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            watcher_buffer_size: default_watcher_buffer_size(),
            sync_interval_ms: default_sync_interval_ms(),
            max_watchers_per_sync: default_max_watchers_per_sync(),
            max_revisions_per_sync: default_max_revisions_per_sync(),
            progress_notify_interval_ms: default_progress_notify_interval_ms(),
            max_request_bytes: default_max_request_bytes(),
            max_response_bytes: default_max_response_bytes(),
            enable_metrics: default_enable_watch_metrics(),
        }
    }
}

impl WatchConfig {
    pub fn validate(&self) -> Result<()> {
        if self.watcher_buffer_size == 0 {
            return Err(Error::Config(ConfigError::Message(
                "watch.watcher_buffer_size must be greater than 0".into(),
            )));
        }

        if self.watcher_buffer_size > 10_000 {
            warn!(
                "watch.watcher_buffer_size ({}) is very large; every watcher may hold that many responses",
                self.watcher_buffer_size
            );
        }

        if self.sync_interval_ms == 0 {
            return Err(Error::Config(ConfigError::Message(
                "watch.sync_interval_ms must be at least 1ms".into(),
            )));
        }

        if self.max_watchers_per_sync == 0 {
            return Err(Error::Config(ConfigError::Message(
                "watch.max_watchers_per_sync must be greater than 0".into(),
            )));
        }

        if self.max_revisions_per_sync == 0 {
            return Err(Error::Config(ConfigError::Message(
                "watch.max_revisions_per_sync must be greater than 0".into(),
            )));
        }

        if self.progress_notify_interval_ms == 0 {
            return Err(Error::Config(ConfigError::Message(
                "watch.progress_notify_interval_ms must be at least 1ms".into(),
            )));
        }

        if self.max_request_bytes == 0 {
            return Err(Error::Config(ConfigError::Message(
                "watch.max_request_bytes must be greater than 0".into(),
            )));
        }

        if self.max_response_bytes < self.max_request_bytes {
            return Err(Error::Config(ConfigError::Message(format!(
                "watch.max_response_bytes ({}) must not be smaller than watch.max_request_bytes ({})",
                self.max_response_bytes, self.max_request_bytes
            ))));
        }

        Ok(())
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }

    pub fn progress_notify_interval(&self) -> Duration {
        Duration::from_millis(self.progress_notify_interval_ms)
    }
}

const fn default_watcher_buffer_size() -> usize {
    128
}

const fn default_sync_interval_ms() -> u64 {
    100
}

const fn default_max_watchers_per_sync() -> usize {
    512
}

const fn default_max_revisions_per_sync() -> u64 {
    1000
}

// 10 minutes
const fn default_progress_notify_interval_ms() -> u64 {
    600_000
}

const fn default_max_request_bytes() -> usize {
    3 * 512 * 1024
}

const fn default_max_response_bytes() -> usize {
    i32::MAX as usize
}

const fn default_enable_watch_metrics() -> bool {
    true
}

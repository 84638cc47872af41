//! Watch sessions.
//!
//! A session is split in two halves, like a channel: [`WatchStream`] issues
//! create / cancel / progress requests, [`WatchResponses`] yields every
//! response of every watcher on the session. Responses of one watcher keep
//! their order; responses of different watchers interleave freely.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::Weak;
use std::task::Context;
use std::task::Poll;

use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio_stream::Stream;
use tokio_stream::StreamMap;
use tracing::debug;
use tracing::warn;

use super::engine::Registered;
use super::fragment::fragment;
use crate::CancelReason;
use crate::Result;
use crate::Revision;
use crate::StreamId;
use crate::WatchConfig;
use crate::WatchCreateRequest;
use crate::WatchEngine;
use crate::WatchError;
use crate::WatchId;
use crate::WatchResponse;
use crate::WatcherKey;
use crate::INVALID_WATCH_ID;

pub(crate) enum Registration {
    Outlet(WatcherKey, WatcherOutlet),
    /// Session-level response not tied to a live watcher
    Control(WatchResponse),
}

/// Request half of a watch session
///
/// Dropping it cancels every watcher of the session.
pub struct WatchStream {
    id: StreamId,
    engine: Arc<WatchEngine>,
    control: mpsc::UnboundedSender<Registration>,
}

impl WatchStream {
    pub(crate) fn new(
        id: StreamId,
        engine: Arc<WatchEngine>,
        control: mpsc::UnboundedSender<Registration>,
    ) -> Self {
        Self {
            id,
            engine,
            control,
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Creates a watcher; returns its id and the header revision of the
    /// creation acknowledgment.
    ///
    /// A rejected request also emits a `created = true, canceled = true`
    /// response with watch id -1 on the response half.
    pub fn create(
        &self,
        request: WatchCreateRequest,
    ) -> Result<(WatchId, Revision)> {
        match self.engine.register(self.id, request) {
            Ok(Registered {
                key,
                watch_id,
                revision,
                outlet,
            }) => {
                if self.control.send(Registration::Outlet(key, outlet)).is_err() {
                    debug!(stream_id = self.id, watch_id, "response half already dropped");
                }
                Ok((watch_id, revision))
            }
            Err(e) => {
                debug!(stream_id = self.id, "watch create rejected: {}", e);
                let header = self.engine.current_revision();
                self.send_control(WatchResponse::rejected(INVALID_WATCH_ID, header, e.to_string()));
                Err(e.into())
            }
        }
    }

    /// Cancels `watch_id`. Unknown ids are answered with a watch id -1
    /// cancel response and are not an error.
    pub fn cancel(
        &self,
        watch_id: WatchId,
    ) -> Result<()> {
        if !self.engine.cancel(self.id, watch_id) {
            debug!(stream_id = self.id, watch_id, "cancel for unknown watch id");
            self.send_control(WatchResponse::unknown_watch(self.engine.current_revision()));
        }
        Ok(())
    }

    /// Progress notification for every synced watcher of the session;
    /// returns how many were sent
    pub fn request_progress(&self) -> Result<usize> {
        let sent = self.engine.request_progress(self.id, None)?;
        Ok(sent)
    }

    /// Progress notification for one watcher; a no-op while it is unsynced
    pub fn request_watch_progress(
        &self,
        watch_id: WatchId,
    ) -> Result<()> {
        self.engine.request_progress(self.id, Some(watch_id))?;
        Ok(())
    }

    /// Live watch ids, ascending
    pub fn watch_ids(&self) -> Vec<WatchId> {
        self.engine.watch_ids(self.id)
    }

    fn send_control(
        &self,
        response: WatchResponse,
    ) {
        if self.control.send(Registration::Control(response)).is_err() {
            debug!(stream_id = self.id, "response half already dropped");
        }
    }
}

impl Drop for WatchStream {
    fn drop(&mut self) {
        self.engine.close_stream(self.id);
    }
}

/// Response half of a watch session
///
/// Yields `Err` only for a response that could not be delivered, after which
/// the affected watcher is cancelled. Ends once the request half is dropped and
/// every watcher has drained.
pub struct WatchResponses {
    id: StreamId,
    registrations: mpsc::UnboundedReceiver<Registration>,
    outlets: StreamMap<WatcherKey, WatcherOutlet>,
    pending: VecDeque<std::result::Result<WatchResponse, WatchError>>,
    registrations_closed: bool,
}

impl WatchResponses {
    pub(crate) fn new(
        id: StreamId,
        registrations: mpsc::UnboundedReceiver<Registration>,
    ) -> Self {
        Self {
            id,
            registrations,
            outlets: StreamMap::new(),
            pending: VecDeque::new(),
            registrations_closed: false,
        }
    }

    pub fn stream_id(&self) -> StreamId {
        self.id
    }
}

impl Stream for WatchResponses {
    type Item = std::result::Result<WatchResponse, WatchError>;

    fn poll_next(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if let Some(item) = this.pending.pop_front() {
                return Poll::Ready(Some(item));
            }

            while !this.registrations_closed {
                match this.registrations.poll_recv(cx) {
                    Poll::Ready(Some(Registration::Outlet(key, outlet))) => {
                        this.outlets.insert(key, outlet);
                    }
                    Poll::Ready(Some(Registration::Control(response))) => {
                        this.pending.push_back(Ok(response));
                    }
                    Poll::Ready(None) => this.registrations_closed = true,
                    Poll::Pending => break,
                }
            }
            if !this.pending.is_empty() {
                continue;
            }

            match Pin::new(&mut this.outlets).poll_next(cx) {
                Poll::Ready(Some((_, frames))) => this.pending.extend(frames),
                Poll::Ready(None) if this.registrations_closed => return Poll::Ready(None),
                // no watchers yet; woken by the registration channel
                Poll::Ready(None) => return Poll::Pending,
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// Consumer end of one watcher's buffer
///
/// Each item is one logical response: a single message, or all fragments of
/// an oversized one so they stay contiguous on the session.
pub(crate) struct WatcherOutlet {
    key: WatcherKey,
    watch_id: WatchId,
    events: mpsc::Receiver<WatchResponse>,
    terminal: Option<oneshot::Receiver<WatchResponse>>,
    fragment: bool,
    fragment_bytes: usize,
    response_limit: usize,
    engine: Weak<WatchEngine>,
    exhausted: bool,
}

impl WatcherOutlet {
    pub(crate) fn new(
        key: WatcherKey,
        watch_id: WatchId,
        events: mpsc::Receiver<WatchResponse>,
        terminal: oneshot::Receiver<WatchResponse>,
        fragment: bool,
        config: &WatchConfig,
        engine: Weak<WatchEngine>,
    ) -> Self {
        Self {
            key,
            watch_id,
            events,
            terminal: Some(terminal),
            fragment,
            fragment_bytes: config.max_request_bytes,
            response_limit: config.max_response_bytes,
            engine,
            exhausted: false,
        }
    }

    fn frame(
        &mut self,
        response: WatchResponse,
    ) -> Vec<std::result::Result<WatchResponse, WatchError>> {
        let frames = if self.fragment {
            fragment(response, self.fragment_bytes)
        } else {
            vec![response]
        };

        let oversized = frames
            .iter()
            .map(WatchResponse::encoded_len)
            .find(|len| *len > self.response_limit);
        if let Some(size) = oversized {
            let limit = self.response_limit;
            warn!(
                watch_id = self.watch_id,
                size, limit, "response exceeds receive limit; cancelling watcher"
            );
            self.exhausted = true;
            if let Some(engine) = self.engine.upgrade() {
                engine.cancel_key(self.key, CancelReason::ResourceExhausted { size, limit });
            }
            return vec![Err(WatchError::ResourceExhausted {
                watch_id: self.watch_id,
                size,
                limit,
            })];
        }

        frames.into_iter().map(Ok).collect()
    }
}

impl Stream for WatcherOutlet {
    type Item = Vec<std::result::Result<WatchResponse, WatchError>>;

    fn poll_next(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            match this.events.poll_recv(cx) {
                // nothing after a response that could not be delivered
                Poll::Ready(Some(_)) if this.exhausted => continue,
                Poll::Ready(Some(response)) => return Poll::Ready(Some(this.frame(response))),
                Poll::Ready(None) => {
                    // the engine released the watcher; emit its terminal response, if any
                    let Some(terminal) = this.terminal.as_mut() else {
                        return Poll::Ready(None);
                    };
                    return match Pin::new(terminal).poll(cx) {
                        Poll::Ready(Ok(response)) => {
                            this.terminal = None;
                            Poll::Ready(Some(vec![Ok(response)]))
                        }
                        Poll::Ready(Err(_)) => {
                            this.terminal = None;
                            Poll::Ready(None)
                        }
                        Poll::Pending => Poll::Pending,
                    };
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

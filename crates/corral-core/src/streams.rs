//! Durable per-session event streams.
//!
//! Each stream is an append-only log of `{offset, type, timestamp, data}`
//! events. Offsets are dense (`0,1,2,…`) and assigned under the stream's
//! lock, so concurrent publishers serialize and every subscriber observes
//! the same order. Subscriptions replay the backlog from a requested offset
//! and then follow live publishes.
//!
//! Publishes never block on slow subscribers: each subscription owns a
//! bounded buffer, and a subscriber that falls too far behind is terminated
//! with [`StreamError::SubscriberOverrun`] instead of back-pressuring the
//! agent stdout pipeline upstream.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use chrono::Utc;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{CoreError, ErrorCode};

/// Default per-subscriber buffer (events of live lag tolerated).
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 1024;

/// Options applied at stream creation.
#[derive(Debug, Clone, Copy)]
pub struct StreamOptions {
    pub subscriber_buffer: usize,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            subscriber_buffer: DEFAULT_SUBSCRIBER_BUFFER,
        }
    }
}

/// One event in a stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    pub offset: u64,
    #[serde(rename = "type")]
    pub kind: String,
    /// Milliseconds since the Unix epoch, assigned at publish time.
    pub timestamp: i64,
    pub data: Value,
}

/// Errors surfaced by the stream service.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    #[error("stream not found: {0}")]
    NotFound(String),
    #[error("subscriber overran its buffer on stream {0}")]
    SubscriberOverrun(String),
}

impl From<StreamError> for CoreError {
    fn from(err: StreamError) -> Self {
        let code = match &err {
            StreamError::NotFound(_) => ErrorCode::StreamNotFound,
            StreamError::SubscriberOverrun(_) => ErrorCode::SubscriberOverrun,
        };
        CoreError::new(code, err.to_string())
    }
}

struct Subscriber {
    tx: mpsc::Sender<StreamEvent>,
    overrun: Arc<AtomicBool>,
}

struct StreamState {
    events: Vec<StreamEvent>,
    subscribers: Vec<Subscriber>,
    subscriber_buffer: usize,
}

/// The stream service. Cheap to clone; all clones share state.
#[derive(Clone, Default)]
pub struct StreamService {
    streams: Arc<Mutex<HashMap<String, Arc<Mutex<StreamState>>>>>,
}

impl StreamService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a stream. Creating an existing stream is a no-op success.
    pub fn create_stream(
        &self,
        stream_id: &str,
        options: StreamOptions,
    ) -> Result<(), StreamError> {
        let mut streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
        streams.entry(stream_id.to_string()).or_insert_with(|| {
            Arc::new(Mutex::new(StreamState {
                events: Vec::new(),
                subscribers: Vec::new(),
                subscriber_buffer: options.subscriber_buffer.max(1),
            }))
        });
        Ok(())
    }

    fn stream(&self, stream_id: &str) -> Result<Arc<Mutex<StreamState>>, StreamError> {
        let streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
        streams
            .get(stream_id)
            .cloned()
            .ok_or_else(|| StreamError::NotFound(stream_id.to_string()))
    }

    /// Append an event and fan it out to live subscribers.
    ///
    /// The next offset is assigned under the stream's lock, so concurrent
    /// publishers serialize and offsets stay dense. Returns the assigned
    /// offset.
    pub fn publish(
        &self,
        stream_id: &str,
        kind: &str,
        data: Value,
    ) -> Result<u64, StreamError> {
        let stream = self.stream(stream_id)?;
        let mut state = stream.lock().unwrap_or_else(|e| e.into_inner());

        let event = StreamEvent {
            offset: state.events.len() as u64,
            kind: kind.to_string(),
            timestamp: Utc::now().timestamp_millis(),
            data,
        };
        let offset = event.offset;
        state.events.push(event.clone());

        // Fan out without blocking. A full buffer terminates that
        // subscriber with an overrun marker; a closed channel means the
        // subscription was dropped.
        state.subscribers.retain(|subscriber| {
            match subscriber.tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    subscriber.overrun.store(true, Ordering::SeqCst);
                    debug!(stream_id, offset, "dropping overrun subscriber");
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });

        Ok(offset)
    }

    /// Subscribe from `from_offset`.
    ///
    /// The backlog snapshot and live registration happen under one lock, so
    /// the subscription observes every event with `offset >= from_offset`
    /// exactly once, in offset order.
    pub fn subscribe(
        &self,
        stream_id: &str,
        from_offset: u64,
    ) -> Result<Subscription, StreamError> {
        let stream = self.stream(stream_id)?;
        let mut state = stream.lock().unwrap_or_else(|e| e.into_inner());

        let backlog: Vec<StreamEvent> = state
            .events
            .iter()
            .filter(|event| event.offset >= from_offset)
            .cloned()
            .collect();

        // The channel holds the full replay plus the live-lag allowance.
        let capacity = backlog.len() + state.subscriber_buffer;
        let (tx, rx) = mpsc::channel(capacity);
        for event in backlog {
            // Cannot fail: capacity covers the entire backlog.
            let _ = tx.try_send(event);
        }

        let overrun = Arc::new(AtomicBool::new(false));
        state.subscribers.push(Subscriber {
            tx,
            overrun: Arc::clone(&overrun),
        });

        Ok(Subscription {
            stream_id: stream_id.to_string(),
            rx,
            overrun,
            done: false,
        })
    }

    /// Delete a stream: live subscriptions complete, stored events drop.
    ///
    /// Returns whether the stream existed.
    pub fn delete_stream(&self, stream_id: &str) -> bool {
        let mut streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
        streams.remove(stream_id).is_some()
    }

    /// Whether a stream exists.
    pub fn stream_exists(&self, stream_id: &str) -> bool {
        let streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
        streams.contains_key(stream_id)
    }

    /// Snapshot of all events in a stream. Test/debug aid.
    pub fn get_events(&self, stream_id: &str) -> Result<Vec<StreamEvent>, StreamError> {
        let stream = self.stream(stream_id)?;
        let state = stream.lock().unwrap_or_else(|e| e.into_inner());
        Ok(state.events.clone())
    }
}

/// A live subscription: yields `Ok(event)` in offset order, ends when the
/// stream is deleted, or terminates with `Err(SubscriberOverrun)` if this
/// subscriber fell too far behind.
pub struct Subscription {
    stream_id: String,
    rx: mpsc::Receiver<StreamEvent>,
    overrun: Arc<AtomicBool>,
    done: bool,
}

impl Stream for Subscription {
    type Item = Result<StreamEvent, StreamError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(event)) => Poll::Ready(Some(Ok(event))),
            Poll::Ready(None) => {
                self.done = true;
                if self.overrun.load(Ordering::SeqCst) {
                    Poll::Ready(Some(Err(StreamError::SubscriberOverrun(
                        self.stream_id.clone(),
                    ))))
                } else {
                    Poll::Ready(None)
                }
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

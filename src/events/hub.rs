//! Broadcast hub for cascade lifecycle events.
//!
//! One hub fans every runner event out to the bus sinks and to any number
//! of session-scoped subscribers (the SSE surface). Slow subscribers lag
//! and drop events rather than blocking cell execution; drop totals are
//! surfaced through the diagnostic log.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures_util::stream::{self, BoxStream, StreamExt};
use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::broadcast::{self, Receiver, Sender};

use super::event::Event;

/// Abstract emitter handed to runner components; cloned freely, emits
/// without blocking.
pub trait EventEmitter: Send + Sync + fmt::Debug {
    fn emit(&self, event: Event) -> Result<(), EmitterError>;
}

/// The only way an emit can fail: the hub has shut down.
#[derive(Debug, Error)]
pub enum EmitterError {
    #[error("event hub closed")]
    Closed,
}

/// Emitter that drops everything; components running without a bus use it.
#[derive(Clone, Debug, Default)]
pub struct NullEmitter;

impl EventEmitter for NullEmitter {
    fn emit(&self, _event: Event) -> Result<(), EmitterError> {
        Ok(())
    }
}

/// Fan-out point between the runner and its observers.
#[derive(Debug)]
pub struct EventHub {
    sender: RwLock<Option<Sender<Event>>>,
    dropped_events: AtomicUsize,
    capacity: usize,
}

impl EventHub {
    /// Create a hub backed by a broadcast channel.
    ///
    /// `capacity` is the per-subscriber buffer before lag kicks in; clamped
    /// to at least 1.
    pub fn new(capacity: usize) -> Arc<Self> {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Arc::new(Self {
            sender: RwLock::new(Some(sender)),
            dropped_events: AtomicUsize::new(0),
            capacity,
        })
    }

    /// Publish an event to all subscribers.
    pub fn publish(&self, event: Event) -> Result<(), EmitterError> {
        match self.current_sender() {
            Some(sender) => {
                // A send error only means no subscriber is listening right
                // now; the event is simply unobserved.
                let _ = sender.send(event);
                Ok(())
            }
            None => Err(EmitterError::Closed),
        }
    }

    /// Subscribe to events from this point forward.
    ///
    /// After [`close`](Self::close) this returns an already-ended stream so
    /// downstream code needs no special case.
    pub fn subscribe(self: &Arc<Self>) -> EventStream {
        let receiver = self
            .current_sender()
            .map(|sender| sender.subscribe())
            .unwrap_or_else(|| {
                let (sender, receiver) = broadcast::channel(self.capacity);
                drop(sender);
                receiver
            });
        EventStream {
            receiver,
            hub: Arc::clone(self),
        }
    }

    pub fn emitter(self: &Arc<Self>) -> HubEmitter {
        HubEmitter {
            hub: Arc::clone(self),
        }
    }

    /// Shut the hub down; all subscribers observe end-of-stream.
    pub fn close(&self) {
        let _ = self.sender.write().take();
    }

    fn current_sender(&self) -> Option<Sender<Event>> {
        self.sender.read().clone()
    }

    fn record_lag(&self, missed: u64) {
        if missed == 0 {
            return;
        }
        let increment = usize::try_from(missed).unwrap_or(usize::MAX);
        let total = self
            .dropped_events
            .fetch_add(increment, Ordering::Relaxed)
            .saturating_add(increment);
        tracing::warn!(
            target: "windlass::events",
            missed,
            total_dropped = total,
            "event subscriber lagged; dropped events"
        );
    }
}

/// The emitter runner components actually carry.
#[derive(Clone, Debug)]
pub struct HubEmitter {
    hub: Arc<EventHub>,
}

impl EventEmitter for HubEmitter {
    fn emit(&self, event: Event) -> Result<(), EmitterError> {
        self.hub.publish(event)
    }
}

/// One subscriber's view of the hub.
#[derive(Debug)]
pub struct EventStream {
    receiver: Receiver<Event>,
    hub: Arc<EventHub>,
}

impl EventStream {
    /// Receive the next event. Lag is recorded against the hub and
    /// reported to the caller so it can decide whether to continue.
    pub async fn recv(&mut self) -> Result<Event, broadcast::error::RecvError> {
        match self.receiver.recv().await {
            Ok(event) => Ok(event),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                self.hub.record_lag(missed);
                Err(broadcast::error::RecvError::Lagged(missed))
            }
            Err(err) => Err(err),
        }
    }

    /// Stream only one session's lifecycle events; diagnostics and other
    /// sessions' events are skipped, lag is swallowed after accounting.
    /// This is the shape the SSE surface consumes.
    pub fn into_session_stream(self, session_id: String) -> BoxStream<'static, Event> {
        let EventStream { receiver, hub } = self;
        stream::unfold(
            (receiver, hub, session_id),
            |(mut receiver, hub, session_id)| async move {
                loop {
                    match receiver.recv().await {
                        Ok(event) => {
                            let matches = event
                                .session_id()
                                .map(|s| s == session_id)
                                .unwrap_or(false);
                            if matches {
                                return Some((event, (receiver, hub, session_id)));
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            hub.record_lag(missed);
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            },
        )
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;
    use serde_json::json;

    #[tokio::test]
    async fn publish_reaches_subscribers() {
        let hub = EventHub::new(16);
        let mut stream = hub.subscribe();
        hub.publish(Event::diagnostic("test", "hello")).unwrap();
        let event = stream.recv().await.unwrap();
        assert_eq!(event.scope_label(), "test");
    }

    #[tokio::test]
    async fn closed_hub_rejects_publishes_and_ends_streams() {
        let hub = EventHub::new(16);
        hub.close();
        assert!(matches!(
            hub.publish(Event::diagnostic("x", "y")),
            Err(EmitterError::Closed)
        ));
        let mut stream = hub.subscribe();
        assert!(matches!(
            stream.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
    }

    #[tokio::test]
    async fn session_stream_filters_other_sessions() {
        let hub = EventHub::new(16);
        let stream = hub.subscribe().into_session_stream("mine".to_string());
        for session in ["other", "mine", "other"] {
            hub.publish(Event::lifecycle(
                EventKind::CellStart,
                session,
                None,
                None,
                json!({}),
            ))
            .unwrap();
        }
        hub.close();
        let events: Vec<Event> = stream.collect().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].session_id(), Some("mine"));
    }
}

//! The event bus: one hub, many sinks.
//!
//! Each sink drains a private hub subscription on its own task, so a slow
//! sink lags independently instead of stalling the runner or its sibling
//! sinks. The bus owns the drain tasks; [`stop_listener`](EventBus::stop_listener)
//! is the shutdown method, `Drop` aborts whatever is still running.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::hub::{EventEmitter, EventHub, EventStream};
use super::sink::{EventSink, StdOutSink};

const DEFAULT_BUFFER_CAPACITY: usize = 1024;

struct SinkSlot {
    sink: Arc<Mutex<Box<dyn EventSink>>>,
    drain: Option<DrainTask>,
}

struct DrainTask {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// Owns the hub and the sink drain tasks.
pub struct EventBus {
    sinks: Mutex<Vec<SinkSlot>>,
    hub: Arc<EventHub>,
    started: AtomicBool,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_sink(StdOutSink::default())
    }
}

impl EventBus {
    pub fn with_sink<T>(sink: T) -> Self
    where
        T: EventSink + 'static,
    {
        Self::with_sinks(vec![Box::new(sink)])
    }

    pub fn with_sinks(sinks: Vec<Box<dyn EventSink>>) -> Self {
        Self::with_capacity(sinks, DEFAULT_BUFFER_CAPACITY)
    }

    pub fn with_capacity(sinks: Vec<Box<dyn EventSink>>, buffer_capacity: usize) -> Self {
        let slots = sinks
            .into_iter()
            .map(|sink| SinkSlot {
                sink: Arc::new(Mutex::new(sink)),
                drain: None,
            })
            .collect();
        Self {
            sinks: Mutex::new(slots),
            hub: EventHub::new(buffer_capacity),
            started: AtomicBool::new(false),
        }
    }

    /// Attach a sink; it starts draining immediately when the bus is
    /// already listening.
    pub fn add_sink<T: EventSink + 'static>(&self, sink: T) {
        let mut slot = SinkSlot {
            sink: Arc::new(Mutex::new(Box::new(sink))),
            drain: None,
        };
        if self.started.load(Ordering::SeqCst) {
            slot.drain = Some(spawn_drain(slot.sink.clone(), self.hub.subscribe()));
        }
        self.sinks.lock().unwrap().push(slot);
    }

    pub fn get_emitter(&self) -> Arc<dyn EventEmitter> {
        Arc::new(self.hub.emitter())
    }

    pub fn subscribe(&self) -> EventStream {
        self.hub.subscribe()
    }

    /// Start draining events into every sink. Idempotent.
    pub fn listen_for_events(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut sinks = self.sinks.lock().unwrap();
        for slot in sinks.iter_mut() {
            if slot.drain.is_none() {
                slot.drain = Some(spawn_drain(slot.sink.clone(), self.hub.subscribe()));
            }
        }
    }

    /// Stop the drain tasks and wait for in-flight events to flush.
    pub async fn stop_listener(&self) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }
        let drains: Vec<DrainTask> = {
            let mut sinks = self.sinks.lock().unwrap();
            sinks.iter_mut().filter_map(|slot| slot.drain.take()).collect()
        };
        for drain in drains {
            let _ = drain.stop.send(());
            let _ = drain.handle.await;
        }
    }
}

impl Drop for EventBus {
    fn drop(&mut self) {
        if let Ok(mut sinks) = self.sinks.lock() {
            for slot in sinks.iter_mut() {
                if let Some(drain) = slot.drain.take() {
                    let _ = drain.stop.send(());
                    drain.handle.abort();
                }
            }
        }
    }
}

/// Pump one sink from its own subscription until the hub closes or the bus
/// asks it to stop. Sink write failures are logged and skipped; one broken
/// sink must not silence the others.
fn spawn_drain(sink: Arc<Mutex<Box<dyn EventSink>>>, mut stream: EventStream) -> DrainTask {
    let (stop_tx, mut stop_rx) = oneshot::channel();
    let handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut stop_rx => break,
                event = stream.recv() => match event {
                    Ok(event) => {
                        if let Ok(mut guard) = sink.lock() {
                            if let Err(err) = guard.handle(&event) {
                                tracing::warn!(
                                    sink = %guard.name(),
                                    error = %err,
                                    "event sink write failed"
                                );
                            }
                        }
                    }
                    Err(RecvError::Closed) => break,
                    Err(RecvError::Lagged(_)) => continue,
                }
            }
        }
    });
    DrainTask {
        stop: stop_tx,
        handle,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Event, MemorySink};
    use std::time::Duration;

    #[tokio::test]
    async fn events_reach_sinks_and_stop_flushes() {
        let memory = MemorySink::new();
        let bus = EventBus::with_sink(memory.clone());
        bus.listen_for_events();

        let emitter = bus.get_emitter();
        emitter.emit(Event::diagnostic("test", "one")).unwrap();
        emitter.emit(Event::diagnostic("test", "two")).unwrap();

        // Drains run on their own tasks; give them a beat, then flush.
        tokio::time::sleep(Duration::from_millis(50)).await;
        bus.stop_listener().await;
        let seen = memory.snapshot();
        assert_eq!(seen.len(), 2);
    }

    #[tokio::test]
    async fn sinks_added_after_start_begin_draining() {
        let bus = EventBus::with_sinks(vec![]);
        bus.listen_for_events();
        let memory = MemorySink::new();
        bus.add_sink(memory.clone());

        bus.get_emitter()
            .emit(Event::diagnostic("late", "hello"))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        bus.stop_listener().await;
        assert_eq!(memory.snapshot().len(), 1);
    }
}

//! Lifecycle event transport: a broadcast hub, sink drain tasks, and
//! session-scoped subscriber streams.

pub mod bus;
pub mod event;
pub mod hub;
pub mod sink;

pub use bus::EventBus;
pub use event::{Event, EventKind, LifecycleEvent};
pub use hub::{EmitterError, EventEmitter, EventHub, EventStream, HubEmitter, NullEmitter};
pub use sink::{ChannelSink, EventSink, JsonLinesSink, MemorySink, StdOutSink};

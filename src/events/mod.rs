//! Engine progress events, fan-out, and sinks.
//!
//! Producers hold a cheap `flume::Sender<Event>` cloned from the bus; a
//! background listener broadcasts each event to every configured
//! [`EventSink`]. Deterministic single-threaded runs can skip the listener
//! and call [`EventBus::drain_to_sinks`] instead.

pub mod bus;
pub mod event;
pub mod sink;

pub use bus::EventBus;
pub use event::{
    DiagnosticEvent, Event, InterruptLifecycleEvent, NodeStatusEvent, PlanStatusEvent,
    TaskDispatchedEvent, TimeoutFiredEvent,
};
pub use sink::{EventSink, MemorySink, StdOutSink};

//! Lifecycle event emission.
//!
//! The engine and the scheduler report every stack and resource transition
//! to an [`EventSink`]. Sinks are passed explicitly; there is no global sink.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

//! Telemetry and structured logging for Agora.
//!
//! Handles subscriber setup (console plus rolling NDJSON file) and the
//! tracing-backed runtime event sink.

pub mod event_logger;
pub mod logger;

pub use event_logger::{TracingEventSink, EVENT_TARGET};
pub use logger::{init_from_config, init_logger};

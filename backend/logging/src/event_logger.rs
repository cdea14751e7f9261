//! Runtime event sink backed by `tracing`.
//!
//! Events land in the same NDJSON file as the rest of the logs, under a
//! dedicated target so they can be filtered (`RUST_LOG=agora_events=info`).

use agora_core::{EventKind, EventSink, RuntimeEvent};
use tracing::{info, warn};

/// Target every runtime event is logged under.
pub const EVENT_TARGET: &str = "agora_events";

/// Writes each [`RuntimeEvent`] as one structured tracing event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl TracingEventSink {
    pub fn new() -> Self {
        Self
    }

    fn is_warning(kind: &EventKind) -> bool {
        matches!(
            kind,
            EventKind::TurnFailed
                | EventKind::ToolFailed
                | EventKind::ToolDenied
                | EventKind::LoopWarning
                | EventKind::LoopHalted
                | EventKind::DistillationFailed
                | EventKind::CircuitBreaker
        )
    }
}

impl EventSink for TracingEventSink {
    fn emit(&self, event: RuntimeEvent) {
        let payload = event.payload.to_string();
        let session_id = event.session_id.as_deref().unwrap_or("-");
        if Self::is_warning(&event.kind) {
            warn!(
                target: "agora_events",
                event_id = %event.id,
                kind = %event.kind,
                agent_id = %event.agent_id,
                session_id = %session_id,
                payload = %payload,
                "Runtime event"
            );
        } else {
            info!(
                target: "agora_events",
                event_id = %event.id,
                kind = %event.kind,
                agent_id = %event.agent_id,
                session_id = %session_id,
                payload = %payload,
                "Runtime event"
            );
        }
    }
}

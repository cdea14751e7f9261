pub mod error;
pub mod event;
pub mod message;
pub mod store;
pub mod tokens;
pub mod tools;
pub mod traits;
pub mod types;

pub use error::AgoraError;
pub use event::{EventKind, EventSink, NullEventSink, RuntimeEvent};
pub use message::{InboundMessage, ToolCallRecord, TurnOutcome, TurnStreamEvent, ABORTED};
pub use store::{
    BlackboardEntry, CallKind, CallStatus, CrossAgentCall, DistillationRecord, InteractionSignal,
    NewMessage, Note, SessionSeed, SessionStore,
};
pub use tokens::estimate_tokens;
pub use tools::{ToolFilter, ToolRegistry};
pub use traits::{
    CompletionRequest, CompletionResponse, DependencyHealth, HealthBoard, HealthMonitor,
    LongTermMemory, ModelBackend, RecalledMemory, Reversibility, StopReason, StreamDelta,
    SystemBlock, Tool, ToolContext, ToolDefinition, Usage, MEMORY_DEPENDENCY,
};
pub use types::{
    lock_key, ChatRole, ContentBlock, ConversationMessage, MediaAttachment, MessageContent,
    Session, SessionStatus, StoredMessage, StoredRole, WorkingState,
};

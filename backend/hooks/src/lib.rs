//! `agora-hooks` : lifecycle callbacks around turns and distillation.

pub mod pipeline;
pub mod registry;
pub mod types;

pub use pipeline::HookPipeline;
pub use registry::{DEFAULT_HOOK_TIMEOUT, Hook, HookRegistry};
pub use types::{DistillPayload, HookPayload, HookPhase, HookResult, TurnCompletePayload, TurnPayload};

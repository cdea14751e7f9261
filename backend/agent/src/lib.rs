//! Agora turn engine.
//!
//! The [`TurnCoordinator`] turns inbound messages into completed turns:
//! per-session serialization, context assembly, history repair, the tool
//! loop with approvals and loop detection, and distillation of long
//! sessions. The [`Dispatcher`] lets agents call each other through the
//! same coordinator.

pub mod bootstrap;
pub mod context;
pub mod coordinator;
pub mod deliberate;
pub mod dispatcher;
pub mod distill;
pub mod history;
pub mod lock;
pub mod runtime;
pub mod signals;
pub mod tool_loop;

#[cfg(test)]
pub(crate) mod testing;

pub use bootstrap::{Bootstrap, BootstrapCache};
pub use context::{AssembledContext, ContextAssembler};
pub use coordinator::{CoordinatorBuilder, TurnCoordinator};
pub use dispatcher::Dispatcher;
pub use distill::{DistillTrigger, DistillationPipeline, Extraction};
pub use history::{HistoryBuilder, SUMMARY_MARKER};
pub use lock::SessionLockManager;
pub use runtime::{Runtime, RuntimeParts};
pub use signals::{CircuitBreaker, DisagreementDetector};
pub use tool_loop::{LoopExit, LoopOutput, LoopRequest, ToolLoop, TurnScope};

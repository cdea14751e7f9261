pub mod batching;
pub mod file;
pub mod loop_detection;
pub mod session_tools;
pub mod shell;
pub mod state_tools;

pub use batching::{plan_batches, ToolBatch};
pub use file::{FileReadTool, FileWriteTool};
pub use loop_detection::{stable_input_hash, LoopDetector, LoopDetectorConfig, LoopVerdict};
pub use session_tools::{
    session_tools, AskReply, CallOrigin, CrossAgentBackend, DeliberationPhase, DeliberationReport,
    DeliberationRequest, DeliberationStage, DispatchReport, DispatchTask, DispatchTaskResult,
    PhaseStatus, SendReceipt,
};
pub use shell::{ExecTool, EXEC_TOOL};
pub use state_tools::{state_tools, BlackboardTool, NoteTool, WorkingStateTool, BROADCAST_PREFIX};

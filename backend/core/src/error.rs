use thiserror::Error;

/// Top-level error type for the Agora turn engine.
#[derive(Debug, Error)]
pub enum AgoraError {
    #[error("runtime is shutting down")]
    ShuttingDown,

    #[error("cross-agent depth {depth} reached the ceiling of {max}")]
    DepthExceeded { depth: u32, max: u32 },

    #[error("unknown agent: {0}")]
    UnknownAgent(String),

    #[error("agent {0} cannot target itself")]
    SelfTarget(String),

    #[error("distillation already in progress for session {0}")]
    DistillationInProgress(String),

    #[error("nothing to distill: {available} eligible messages, minimum is {minimum}")]
    NothingToDistill { available: usize, minimum: usize },

    #[error("approval cancelled for tool call {0}")]
    ApprovalCancelled(String),

    #[error("approval expired for tool call {0}")]
    ApprovalExpired(String),

    #[error("tool {tool} timed out after {secs}s")]
    ToolTimeout { tool: String, secs: u64 },

    #[error("cross-agent call to {agent} timed out after {secs}s")]
    CrossAgentTimeout { agent: String, secs: u64 },

    #[error("too many dispatch tasks: {requested} (max {max})")]
    TooManyTasks { requested: usize, max: usize },

    #[error("turn aborted")]
    Aborted,

    #[error("model backend error: {0}")]
    Model(String),

    #[error("storage error: {0}")]
    Store(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl AgoraError {
    /// True for rejections raised before any pipeline stage ran.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            AgoraError::ShuttingDown
                | AgoraError::DepthExceeded { .. }
                | AgoraError::UnknownAgent(_)
                | AgoraError::SelfTarget(_)
        )
    }
}

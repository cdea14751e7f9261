pub mod gate;
pub mod policy;

pub use gate::{ApprovalDecision, ApprovalGate, ApprovalOutcome, ApprovalRequest};
pub use policy::{ApprovalPolicy, ApprovalRequirement, EXEC_TOOL};

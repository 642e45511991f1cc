//! Domain model: pure types and the task state machine.
//!
//! このモジュールは I/O を持ちません。ストアやバスは `ports` 側の trait 越しに扱います。

pub mod approval;
pub mod audit;
pub mod decision;
pub mod envelope;
pub mod errors;
pub mod events;
pub mod ids;
pub mod outcome;
pub mod principal;
pub mod retry;
pub mod risk;
pub mod state;
pub mod task;
pub mod task_type;

pub use approval::{Approval, ApprovalDecision, ApprovalGrant, CancelScope, Resolution, Verdict};
pub use audit::{AuditLogEntry, AuditRecord};
pub use decision::{Decider, Decision, DefaultDecider};
pub use envelope::{Dispatch, TaskEnvelope};
pub use errors::{ErrorKind, IllegalTransition, ValidationError};
pub use events::TaskEvent;
pub use ids::{ApprovalId, AuditId, EventId, GrantId, Id, IdMarker, TaskId};
pub use outcome::ExecutionOutcome;
pub use principal::{TenantId, UserId};
pub use retry::RetryPolicy;
pub use risk::{
    BypassMode, BypassPolicy, PolicyTable, RiskTier, TenantBypass, TierPolicy, UserPolicyOverride,
};
pub use state::{TaskStatus, Transition};
pub use task::{NewTask, Task};
pub use task_type::TaskType;

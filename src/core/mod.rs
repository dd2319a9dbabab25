//! 核心层：错误分类、恢复管理、紧急停止信号、终态报告

pub mod error;
pub mod recovery;
pub mod report;
pub mod shutdown;

pub use error::{ContextError, ErrorKind, MemoryError, PlanError, StepError, ToolErrorKind};
pub use recovery::{
    ErrorAnalysis, FixContext, FixPlan, FixProposer, NoFixProposer, RecoveryManager,
    RecoveryPolicy, RollbackResult,
};
pub use report::{PlanReport, StepReport};
pub use shutdown::{StopReason, StopSignal};

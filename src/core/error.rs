//! 编排错误类型
//!
//! StepError 是单步执行的错误分类（校验 / 风险拒绝 / 瞬时 / 致命 / 无可用工具 / 取消），
//! 由 RecoveryManager 分析后决定重试、插入修复链还是直接失败；PlanError 是计划构建与变更时的结构性错误。

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::plan::{StepId, StepState};

/// 工具上报的失败类别（工具目录契约中的 errorKind）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolErrorKind {
    Network,
    Timeout,
    RateLimited,
    Validation,
    Permission,
    NotFound,
    Other(String),
}

impl ToolErrorKind {
    /// 默认分类：网络 / 超时 / 限流为瞬时，其余（含未识别）一律致命
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ToolErrorKind::Network | ToolErrorKind::Timeout | ToolErrorKind::RateLimited
        )
    }
}

impl std::fmt::Display for ToolErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ToolErrorKind::Network => write!(f, "network"),
            ToolErrorKind::Timeout => write!(f, "timeout"),
            ToolErrorKind::RateLimited => write!(f, "rate_limited"),
            ToolErrorKind::Validation => write!(f, "validation"),
            ToolErrorKind::Permission => write!(f, "permission"),
            ToolErrorKind::NotFound => write!(f, "not_found"),
            ToolErrorKind::Other(kind) => write!(f, "{kind}"),
        }
    }
}

/// 单步执行错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StepError {
    /// 步骤/工具绑定不合法；路由层内部消化（换下一个候选），不重试
    #[error("Validation error: {0}")]
    Validation(String),

    /// 安全闸门拒绝授权；对该步骤是终态
    #[error("Risk denied: {0}")]
    RiskDenied(String),

    #[error("Transient execution error ({kind}): {message}")]
    TransientExecution { kind: ToolErrorKind, message: String },

    #[error("Fatal execution error ({kind}): {message}")]
    FatalExecution { kind: ToolErrorKind, message: String },

    /// 所有候选工具均无法通过校验
    #[error("No viable tool: {0}")]
    NoViableTool(String),

    /// 紧急停止或依赖失败导致的级联取消；不计入重试次数
    #[error("Cancelled: {0}")]
    Cancelled(String),
}

impl StepError {
    /// 按工具上报的类别映射为瞬时或致命错误
    pub fn from_tool_failure(kind: ToolErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        if kind.is_transient() {
            StepError::TransientExecution { kind, message }
        } else {
            StepError::FatalExecution { kind, message }
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            StepError::Validation(_) => ErrorKind::Validation,
            StepError::RiskDenied(_) => ErrorKind::RiskDenied,
            StepError::TransientExecution { .. } => ErrorKind::TransientExecution,
            StepError::FatalExecution { .. } => ErrorKind::FatalExecution,
            StepError::NoViableTool(_) => ErrorKind::NoViableTool,
            StepError::Cancelled(_) => ErrorKind::Cancelled,
        }
    }

    /// 错误正文（不含类别前缀），用于报告与长期记忆
    pub fn message(&self) -> &str {
        match self {
            StepError::Validation(m)
            | StepError::RiskDenied(m)
            | StepError::NoViableTool(m)
            | StepError::Cancelled(m) => m,
            StepError::TransientExecution { message, .. }
            | StepError::FatalExecution { message, .. } => message,
        }
    }
}

/// StepError 的可序列化类别（报告、上下文记录使用）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Validation,
    RiskDenied,
    TransientExecution,
    FatalExecution,
    NoViableTool,
    Cancelled,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::Validation => "ValidationError",
            ErrorKind::RiskDenied => "RiskDeniedError",
            ErrorKind::TransientExecution => "TransientExecutionError",
            ErrorKind::FatalExecution => "FatalExecutionError",
            ErrorKind::NoViableTool => "NoViableTool",
            ErrorKind::Cancelled => "CancelledError",
        };
        write!(f, "{name}")
    }
}

/// 计划构建 / 结构变更错误（快速失败，不返回部分计划）
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlanError {
    #[error("Decomposition failed: {0}")]
    DecompositionFailed(String),

    #[error("Decomposition returned no steps")]
    EmptyPlan,

    #[error("Duplicate step id: {0}")]
    DuplicateStep(StepId),

    #[error("Step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency { step: StepId, dependency: StepId },

    #[error("Step '{0}' depends on itself")]
    SelfDependency(StepId),

    /// 拓扑排序后的残余集合
    #[error("Cyclic dependency detected among: {0:?}")]
    CyclicDependency(Vec<StepId>),

    #[error("Step not found: {0}")]
    StepNotFound(StepId),

    #[error("Illegal transition for step '{step}': {from:?} -> {to:?}")]
    InvalidTransition {
        step: StepId,
        from: StepState,
        to: StepState,
    },
}

/// 上下文存储错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ContextError {
    /// clear() 只允许在两次运行之间调用
    #[error("Context store cannot be cleared while a run is in progress")]
    RunInProgress,
}

/// 长期记忆协作方错误（尽力而为，不影响计划结果）
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    #[error("Memory store failed: {0}")]
    Store(String),

    #[error("Memory retrieve failed: {0}")]
    Retrieve(String),

    #[error("Memory operation timed out")]
    Timeout,
}

//! 计划类型定义
//!
//! 定义步骤、步骤状态机、计划状态等核心数据类型

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::{PlanError, StepError};
use crate::plan::complexity::ComplexityScore;
use crate::safety::RiskLevel;
use crate::tools::Capability;

pub type PlanId = String;
pub type StepId = String;

/// 计划状态（由步骤状态聚合而来，不单独存储）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlanStatus {
    /// 仍有非终态步骤
    Running,
    /// 全部成功（被修复链取代的失败步骤视为已恢复）
    Succeeded,
    /// 存在无恢复路径的失败步骤
    Failed,
    /// 紧急停止
    Cancelled,
}

/// 步骤状态机
///
/// `Pending → Ready → Authorizing → Running → {Succeeded | Retrying → Running | Failed | Cancelled}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StepState {
    /// 等待依赖满足
    Pending,
    /// 依赖全部成功，等待调度槽位
    Ready,
    /// 等待安全闸门授权
    Authorizing,
    /// 正在执行
    Running,
    /// 瞬时失败后等待退避重试
    Retrying,
    Succeeded,
    Failed,
    Cancelled,
}

impl StepState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StepState::Succeeded | StepState::Failed | StepState::Cancelled
        )
    }

    /// 只允许沿状态机前进；Cancelled 可从任意非终态到达
    pub fn can_transition_to(self, next: StepState) -> bool {
        use StepState::{Authorizing, Cancelled, Failed, Pending, Ready, Retrying, Running, Succeeded};
        if self.is_terminal() {
            return false;
        }
        if next == Cancelled {
            return true;
        }
        match (self, next) {
            (Pending, Ready) => true,
            // 路由失败（NoViableTool）时从 Ready 直接失败
            (Ready, Authorizing) | (Ready, Failed) => true,
            (Authorizing, Running) | (Authorizing, Failed) => true,
            (Running, Succeeded) | (Running, Retrying) | (Running, Failed) => true,
            // 重试时若换绑了工具需要重新授权
            (Retrying, Running) | (Retrying, Authorizing) | (Retrying, Failed) => true,
            _ => false,
        }
    }
}

/// 步骤来源：规划器产出，或由恢复管理器插入的修复步骤
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepOrigin {
    Planned,
    Fix { for_step: StepId, depth: u32 },
}

impl StepOrigin {
    pub fn fix_depth(&self) -> u32 {
        match self {
            StepOrigin::Planned => 0,
            StepOrigin::Fix { depth, .. } => *depth,
        }
    }
}

/// 执行结果与错误互斥
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Success(String),
    Error(StepError),
}

/// 步骤产生的外部副作用，回滚时交给工具的逆操作
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SideEffect {
    pub tool: String,
    pub payload: Value,
    pub rolled_back: bool,
}

/// 计划中的一个步骤
#[derive(Debug, Clone)]
pub struct TaskStep {
    pub id: StepId,
    pub description: String,
    pub depends_on: BTreeSet<StepId>,
    /// 显式优先级（越大越先调度）；None 时按提出顺序
    pub priority: Option<i32>,
    /// 提出顺序，决定同优先级下的调度次序
    pub seq: u64,
    pub capability: Option<Capability>,
    pub tool_hint: Option<String>,
    pub params: Value,
    pub justification: Option<String>,
    /// 路由后绑定的工具名
    pub bound_tool: Option<String>,
    /// 由安全闸门惰性赋值，规划器从不设置
    pub risk_level: Option<RiskLevel>,
    pub state: StepState,
    pub attempt: u32,
    pub outcome: Option<StepOutcome>,
    pub complexity: Option<ComplexityScore>,
    pub origin: StepOrigin,
    pub side_effects: Vec<SideEffect>,
    /// 逆操作失败的副作用（工具名: 错误），去重
    pub rollback_failures: Vec<String>,
    /// 失败后被修复链接替时，指向修复链末端步骤
    pub superseded_by: Option<StepId>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskStep {
    pub fn new(id: impl Into<StepId>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            depends_on: BTreeSet::new(),
            priority: None,
            seq: 0,
            capability: None,
            tool_hint: None,
            params: Value::Object(Default::default()),
            justification: None,
            bound_tool: None,
            risk_level: None,
            state: StepState::Pending,
            attempt: 0,
            outcome: None,
            complexity: None,
            origin: StepOrigin::Planned,
            side_effects: Vec::new(),
            rollback_failures: Vec::new(),
            superseded_by: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    /// 按状态机推进；非法转换返回 InvalidTransition 且不修改状态
    pub fn transition(&mut self, to: StepState) -> Result<StepState, PlanError> {
        let from = self.state;
        if !from.can_transition_to(to) {
            return Err(PlanError::InvalidTransition {
                step: self.id.clone(),
                from,
                to,
            });
        }
        self.state = to;
        if to.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        tracing::debug!(step_id = %self.id, from = ?from, to = ?to, "step transition");
        Ok(from)
    }

    pub fn succeed(&mut self, output: String) -> Result<(), PlanError> {
        self.transition(StepState::Succeeded)?;
        self.outcome = Some(StepOutcome::Success(output));
        Ok(())
    }

    pub fn fail(&mut self, error: StepError) -> Result<(), PlanError> {
        self.transition(StepState::Failed)?;
        self.outcome = Some(StepOutcome::Error(error));
        Ok(())
    }

    pub fn cancel(&mut self, reason: impl Into<String>) -> Result<(), PlanError> {
        self.transition(StepState::Cancelled)?;
        self.outcome = Some(StepOutcome::Error(StepError::Cancelled(reason.into())));
        Ok(())
    }

    pub fn result(&self) -> Option<&str> {
        match &self.outcome {
            Some(StepOutcome::Success(output)) => Some(output),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&StepError> {
        match &self.outcome {
            Some(StepOutcome::Error(err)) => Some(err),
            _ => None,
        }
    }

    /// 尚未回滚的副作用
    pub fn pending_side_effects(&self) -> impl Iterator<Item = &SideEffect> {
        self.side_effects.iter().filter(|e| !e.rolled_back)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_transitions() {
        let mut step = TaskStep::new("s1", "do it");
        step.transition(StepState::Ready).unwrap();
        step.transition(StepState::Authorizing).unwrap();
        step.transition(StepState::Running).unwrap();
        step.transition(StepState::Retrying).unwrap();
        step.transition(StepState::Running).unwrap();
        step.succeed("ok".to_string()).unwrap();
        assert_eq!(step.state, StepState::Succeeded);
        assert_eq!(step.result(), Some("ok"));
        assert!(step.error().is_none());
        assert!(step.completed_at.is_some());
    }

    #[test]
    fn test_regression_rejected() {
        let mut step = TaskStep::new("s1", "do it");
        step.transition(StepState::Ready).unwrap();
        let err = step.transition(StepState::Pending).unwrap_err();
        assert!(matches!(err, PlanError::InvalidTransition { .. }));
        assert_eq!(step.state, StepState::Ready);
    }

    #[test]
    fn test_pending_cannot_skip_ready() {
        let step = TaskStep::new("s1", "do it");
        assert!(!step.state.can_transition_to(StepState::Running));
        assert!(!step.state.can_transition_to(StepState::Failed));
    }

    #[test]
    fn test_cancel_from_any_non_terminal() {
        for state in [
            StepState::Pending,
            StepState::Ready,
            StepState::Authorizing,
            StepState::Running,
            StepState::Retrying,
        ] {
            assert!(state.can_transition_to(StepState::Cancelled));
        }
        assert!(!StepState::Succeeded.can_transition_to(StepState::Cancelled));
    }

    #[test]
    fn test_terminal_is_final() {
        let mut step = TaskStep::new("s1", "x");
        step.cancel("stop").unwrap();
        assert!(step.cancel("again").is_err());
        assert!(matches!(step.error(), Some(StepError::Cancelled(_))));
    }
}

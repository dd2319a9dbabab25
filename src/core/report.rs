//! 计划终态报告
//!
//! 列出每个步骤的终态、尝试次数、绑定工具；非成功步骤附错误类别与消息。
//! 紧急停止的计划额外区分「被取消」与「停止前已成功」的步骤。

use serde::{Deserialize, Serialize};

use crate::core::ErrorKind;
use crate::plan::{recovered_steps, PlanId, PlanStatus, StepId, StepState, TaskStep};
use crate::safety::RiskLevel;

/// 单步报告
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepReport {
    pub id: StepId,
    pub description: String,
    pub state: StepState,
    pub attempts: u32,
    pub tool: Option<String>,
    pub risk_level: Option<RiskLevel>,
    pub depends_on: Vec<StepId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// 失败后被修复链接替
    #[serde(skip_serializing_if = "Option::is_none")]
    pub superseded_by: Option<StepId>,
    /// 修复链最终成功，失败不计入计划结果
    #[serde(default)]
    pub recovered: bool,
    /// 未能撤销的副作用
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rollback_failures: Vec<String>,
}

impl From<&TaskStep> for StepReport {
    fn from(step: &TaskStep) -> Self {
        let error = if step.state == StepState::Succeeded {
            None
        } else {
            step.error()
        };
        Self {
            id: step.id.clone(),
            description: step.description.clone(),
            state: step.state,
            attempts: step.attempt,
            tool: step.bound_tool.clone(),
            risk_level: step.risk_level,
            depends_on: step.depends_on.iter().cloned().collect(),
            output: step.result().map(str::to_string),
            error_kind: error.map(|e| e.kind()),
            error_message: error.map(|e| e.message().to_string()),
            superseded_by: step.superseded_by.clone(),
            recovered: false,
            rollback_failures: step.rollback_failures.clone(),
        }
    }
}

/// 计划报告
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanReport {
    pub plan_id: PlanId,
    pub goal: String,
    pub status: PlanStatus,
    pub steps: Vec<StepReport>,
    /// 紧急停止时被取消的步骤
    pub cancelled: Vec<StepId>,
    /// 紧急停止前已成功的步骤
    pub succeeded_before_stop: Vec<StepId>,
    pub duration_ms: u64,
}

impl PlanReport {
    pub fn new(
        plan_id: impl Into<PlanId>,
        goal: impl Into<String>,
        status: PlanStatus,
        steps: &[TaskStep],
        duration_ms: u64,
    ) -> Self {
        let (cancelled, succeeded_before_stop) = if status == PlanStatus::Cancelled {
            (
                ids_in_state(steps, StepState::Cancelled),
                ids_in_state(steps, StepState::Succeeded),
            )
        } else {
            (Vec::new(), Vec::new())
        };
        let recovered = recovered_steps(steps);
        let steps = steps
            .iter()
            .map(|step| StepReport {
                recovered: recovered.contains(&step.id),
                ..StepReport::from(step)
            })
            .collect();
        Self {
            plan_id: plan_id.into(),
            goal: goal.into(),
            status,
            steps,
            cancelled,
            succeeded_before_stop,
            duration_ms,
        }
    }

    pub fn step(&self, id: &str) -> Option<&StepReport> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn is_success(&self) -> bool {
        self.status == PlanStatus::Succeeded
    }
}

fn ids_in_state(steps: &[TaskStep], state: StepState) -> Vec<StepId> {
    steps
        .iter()
        .filter(|s| s.state == state)
        .map(|s| s.id.clone())
        .collect()
}

impl std::fmt::Display for PlanReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Plan {} [{:?}] ({} ms)", self.plan_id, self.status, self.duration_ms)?;
        writeln!(f, "Goal: {}", self.goal)?;
        for step in &self.steps {
            write!(
                f,
                "  {:<16} {:<10} attempts={} tool={}",
                step.id,
                format!("{:?}", step.state),
                step.attempts,
                step.tool.as_deref().unwrap_or("-"),
            )?;
            if let (Some(kind), Some(message)) = (&step.error_kind, &step.error_message) {
                write!(f, "  {kind}: {message}")?;
            }
            match (&step.superseded_by, step.recovered) {
                (Some(fix), true) => write!(f, "  (recovered by {fix})")?,
                (Some(fix), false) => write!(f, "  (fix chain {fix} did not succeed)")?,
                (None, _) => {}
            }
            if !step.rollback_failures.is_empty() {
                write!(f, "  rollback failed: {}", step.rollback_failures.join("; "))?;
            }
            writeln!(f)?;
        }
        if self.status == PlanStatus::Cancelled {
            writeln!(f, "Cancelled: {}", self.cancelled.join(", "))?;
            writeln!(f, "Succeeded before stop: {}", self.succeeded_before_stop.join(", "))?;
        }
        Ok(())
    }
}

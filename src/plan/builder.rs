//! 计划构建器
//!
//! 委托 Decomposer 拆分目标，校验后产出 ExecutionPlan；任何校验失败都不会返回部分计划。

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::core::PlanError;
use crate::plan::complexity::estimate_complexity;
use crate::plan::decomposer::{Decomposer, StepProposal};
use crate::plan::execution::{step_from_proposal, ExecutionPlan};
use crate::plan::graph::validate_acyclic;
use crate::plan::types::{StepId, TaskStep};

/// 计划构建器
pub struct PlanBuilder {
    decomposer: Arc<dyn Decomposer>,
}

impl PlanBuilder {
    pub fn new(decomposer: Arc<dyn Decomposer>) -> Self {
        Self { decomposer }
    }

    /// 目标 → 已校验的执行计划
    pub async fn build(&self, goal: &str) -> Result<ExecutionPlan, PlanError> {
        let proposals = self.decomposer.propose(goal).await?;
        let plan = Self::from_proposals(goal, proposals)?;
        let steps = plan.len().await;
        let estimated_minutes = plan.estimated_duration_minutes().await;
        tracing::info!(
            plan_id = %plan.id(),
            steps,
            estimated_minutes,
            "plan built"
        );
        Ok(plan)
    }

    /// 提案 → 计划
    ///
    /// - 缺省 ID 按位置生成 `step-N`
    /// - 所有提案都没有依赖提示时，退化为顺序链（stepN 依赖 stepN-1）；只要有一个提案给出提示，就严格按提示构图
    /// - 依赖必须存在、不能自引用、整体无环
    pub fn from_proposals(
        goal: &str,
        proposals: Vec<StepProposal>,
    ) -> Result<ExecutionPlan, PlanError> {
        if proposals.is_empty() {
            return Err(PlanError::EmptyPlan);
        }

        let sequential = proposals.iter().all(|p| p.depends_on.is_none());
        let mut steps: Vec<TaskStep> = Vec::with_capacity(proposals.len());
        let mut previous: Option<StepId> = None;

        for (index, mut proposal) in proposals.into_iter().enumerate() {
            let id = proposal
                .id
                .take()
                .filter(|id| !id.trim().is_empty())
                .unwrap_or_else(|| format!("step-{}", index + 1));
            let hints = proposal.depends_on.take();
            let mut step = step_from_proposal(id.clone(), proposal);

            step.depends_on = if sequential {
                previous.iter().cloned().collect()
            } else {
                hints.unwrap_or_default().into_iter().collect::<BTreeSet<_>>()
            };
            step.complexity = Some(estimate_complexity(&step.description));

            previous = Some(id);
            steps.push(step);
        }

        validate_acyclic(steps.iter().map(|s| (&s.id, &s.depends_on)))?;
        Ok(ExecutionPlan::new(goal, steps))
    }
}

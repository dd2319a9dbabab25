//! 恢复管理器
//!
//! 失败分类（瞬时 / 致命）、指数退避、修复链提案、副作用回滚，以及写入长期记忆的修复经验。
//! 经验写入是后台任务，失败只记日志，不影响计划结果。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::{ErrorKind, PlanError, StepError};
use crate::memory::{ContextRecord, ContextStore, LongTermMemory, MemoryRecord};
use crate::plan::{ExecutionPlan, StepProposal, TaskStep};
use crate::tools::ToolRegistry;

/// 错误分析结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorAnalysis {
    pub kind: ErrorKind,
    pub is_transient: bool,
    pub root_cause: String,
    pub suggested_fixes: Vec<String>,
}

/// 修复计划：插入到计划中的修复步骤
#[derive(Debug, Clone, PartialEq)]
pub struct FixPlan {
    pub steps: Vec<StepProposal>,
    pub confidence: f64,
}

/// 提交给修复提案能力的上下文
#[derive(Debug, Clone)]
pub struct FixContext {
    pub goal: String,
    pub step: TaskStep,
    pub analysis: ErrorAnalysis,
    /// 当前运行最近的上下文记录
    pub recent: Vec<ContextRecord>,
    /// 长期记忆中相似的历史修复（仅供参考）
    pub similar_fixes: Vec<MemoryRecord>,
}

/// 修复提案能力（通常由 LLM 提供）
#[async_trait]
pub trait FixProposer: Send + Sync {
    async fn propose_fix(&self, error: &StepError, context: &FixContext) -> Option<FixPlan>;
}

/// 不提供修复：致命错误直接失败
#[derive(Debug, Default, Clone)]
pub struct NoFixProposer;

#[async_trait]
impl FixProposer for NoFixProposer {
    async fn propose_fix(&self, _error: &StepError, _context: &FixContext) -> Option<FixPlan> {
        None
    }
}

/// 回滚结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RollbackResult {
    /// 没有未回滚的副作用（含重复调用）
    NothingToRollBack,
    RolledBack { reverted: usize },
    /// 部分逆操作失败；失败的副作用保持未回滚，可再次尝试
    Partial { reverted: usize, failures: Vec<String> },
}

/// 恢复参数
#[derive(Debug, Clone)]
pub struct RecoveryPolicy {
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub max_fix_depth: u32,
    pub memory_top_k: usize,
    pub learn_timeout: Duration,
    /// 等待修复提案的上限；超时视为没有修复
    pub fix_timeout: Duration,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base: Duration::from_millis(1000),
            backoff_max: Duration::from_millis(30_000),
            max_fix_depth: 1,
            memory_top_k: 3,
            learn_timeout: Duration::from_millis(2000),
            fix_timeout: Duration::from_millis(30_000),
        }
    }
}

/// 恢复管理器
pub struct RecoveryManager {
    policy: RecoveryPolicy,
    proposer: Arc<dyn FixProposer>,
    memory: Arc<dyn LongTermMemory>,
    registry: Arc<ToolRegistry>,
}

impl RecoveryManager {
    pub fn new(
        policy: RecoveryPolicy,
        proposer: Arc<dyn FixProposer>,
        memory: Arc<dyn LongTermMemory>,
        registry: Arc<ToolRegistry>,
    ) -> Self {
        Self {
            policy,
            proposer,
            memory,
            registry,
        }
    }

    pub fn policy(&self) -> &RecoveryPolicy {
        &self.policy
    }

    /// 分类错误并给出根因与建议
    pub fn analyze(&self, error: &StepError) -> ErrorAnalysis {
        let is_transient = matches!(error, StepError::TransientExecution { .. });
        let (root_cause, suggested_fixes) = diagnose(error);
        ErrorAnalysis {
            kind: error.kind(),
            is_transient,
            root_cause,
            suggested_fixes,
        }
    }

    /// 第 attempt 次执行失败后是否还能重试（共 max_retries + 1 次执行）
    pub fn should_retry(&self, error: &StepError, attempt: u32) -> bool {
        self.analyze(error).is_transient && attempt <= self.policy.max_retries
    }

    /// 第 attempt 次执行失败后的退避：base * 2^(attempt-1)，不超过上限
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let base_ms = self.policy.backoff_base.as_millis();
        if base_ms == 0 {
            return Duration::ZERO;
        }
        let max_ms = self.policy.backoff_max.as_millis().max(base_ms);
        let shift = attempt.saturating_sub(1).min(20);
        let backoff_ms = base_ms.saturating_mul(1u128 << shift).min(max_ms);
        Duration::from_millis(u64::try_from(backoff_ms).unwrap_or(u64::MAX))
    }

    /// 为致命错误请求修复计划；修复步骤自身再失败时不再递归超过 max_fix_depth
    pub async fn plan_fix(
        &self,
        error: &StepError,
        step: &TaskStep,
        goal: &str,
        context: &ContextStore,
    ) -> Option<FixPlan> {
        if !matches!(error, StepError::FatalExecution { .. }) {
            return None;
        }
        if step.origin.fix_depth() >= self.policy.max_fix_depth {
            tracing::info!(step_id = %step.id, depth = step.origin.fix_depth(), "fix depth exhausted");
            return None;
        }

        let analysis = self.analyze(error);
        let query = format!("{} {} {}", error.kind(), error.message(), step.description);
        let similar_fixes = match tokio::time::timeout(
            self.policy.learn_timeout,
            self.memory.retrieve(&query, self.policy.memory_top_k),
        )
        .await
        {
            Ok(Ok(records)) => records,
            Ok(Err(e)) => {
                tracing::debug!(error = %e, "similar fix lookup failed");
                Vec::new()
            }
            Err(_) => {
                tracing::debug!("similar fix lookup timed out");
                Vec::new()
            }
        };

        let fix_context = FixContext {
            goal: goal.to_string(),
            step: step.clone(),
            analysis,
            recent: context.recent(20),
            similar_fixes,
        };
        let proposed = tokio::time::timeout(
            self.policy.fix_timeout,
            self.proposer.propose_fix(error, &fix_context),
        )
        .await;
        let plan = match proposed {
            Ok(plan) => plan?,
            Err(_) => {
                tracing::warn!(
                    step_id = %step.id,
                    timeout_ms = self.policy.fix_timeout.as_millis() as u64,
                    "fix proposal timed out"
                );
                return None;
            }
        };
        if plan.steps.is_empty() {
            return None;
        }
        tracing::info!(
            step_id = %step.id,
            fix_steps = plan.steps.len(),
            confidence = plan.confidence,
            "fix plan proposed"
        );
        Some(plan)
    }

    /// 逆序回滚步骤尚未回滚的副作用；重复调用是无操作
    pub async fn rollback(
        &self,
        plan: &ExecutionPlan,
        step_id: &str,
    ) -> Result<RollbackResult, PlanError> {
        let pending: Vec<(usize, String, serde_json::Value)> = plan
            .update(step_id, |step| {
                step.side_effects
                    .iter()
                    .enumerate()
                    .filter(|(_, e)| !e.rolled_back)
                    .map(|(i, e)| (i, e.tool.clone(), e.payload.clone()))
                    .collect()
            })
            .await?;
        if pending.is_empty() {
            return Ok(RollbackResult::NothingToRollBack);
        }

        let mut reverted = Vec::new();
        let mut failures = Vec::new();
        for (index, tool_name, payload) in pending.into_iter().rev() {
            let outcome = match self.registry.get(&tool_name) {
                Some(tool) => tool.revert(&payload).await,
                None => Err(format!("tool '{tool_name}' is no longer registered")),
            };
            match outcome {
                Ok(()) => reverted.push(index),
                Err(e) => {
                    tracing::warn!(step_id = %step_id, tool = %tool_name, error = %e, "rollback failed");
                    failures.push(format!("{tool_name}: {e}"));
                }
            }
        }

        plan.update(step_id, |step| {
            for index in &reverted {
                if let Some(effect) = step.side_effects.get_mut(*index) {
                    effect.rolled_back = true;
                }
            }
            for failure in &failures {
                if !step.rollback_failures.contains(failure) {
                    step.rollback_failures.push(failure.clone());
                }
            }
        })
        .await?;

        tracing::info!(step_id = %step_id, reverted = reverted.len(), failed = failures.len(), "rollback finished");
        if failures.is_empty() {
            Ok(RollbackResult::RolledBack {
                reverted: reverted.len(),
            })
        } else {
            Ok(RollbackResult::Partial {
                reverted: reverted.len(),
                failures,
            })
        }
    }

    /// 把错误与修复结果写入长期记忆（后台、有超时、失败忽略）
    pub fn learn_from_error(&self, error: &StepError, fix: Option<&FixPlan>, success: bool) {
        if !self.memory.enabled() {
            return;
        }
        let fix_steps: Vec<String> = fix
            .map(|f| f.steps.iter().map(|s| s.description.clone()).collect())
            .unwrap_or_default();
        let text = if fix_steps.is_empty() {
            format!("{}: {}", error.kind(), error.message())
        } else {
            format!("{}: {} | fix: {}", error.kind(), error.message(), fix_steps.join("; "))
        };
        let record = MemoryRecord::new(text).with_metadata(serde_json::json!({
            "error_kind": error.kind(),
            "error_message": error.message(),
            "fix_steps": fix_steps,
            "success": success,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        }));

        let memory = Arc::clone(&self.memory);
        let timeout = self.policy.learn_timeout;
        tokio::spawn(async move {
            match tokio::time::timeout(timeout, memory.store(record)).await {
                Ok(Ok(reference)) => {
                    tracing::debug!(reference = %reference.as_str(), "learned from error");
                }
                Ok(Err(e)) => tracing::debug!(error = %e, "learn_from_error store failed"),
                Err(_) => tracing::debug!("learn_from_error timed out"),
            }
        });
    }
}

/// 根据消息模式推断根因与建议
fn diagnose(error: &StepError) -> (String, Vec<String>) {
    let message = error.message().to_lowercase();
    let fixes = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<Vec<_>>();

    match error {
        StepError::RiskDenied(_) => {
            return (
                "Action was not authorized".to_string(),
                fixes(&["Provide a justification", "Request approval from an operator"]),
            )
        }
        StepError::NoViableTool(_) | StepError::Validation(_) => {
            return (
                "No registered tool accepts the step parameters".to_string(),
                fixes(&["Register a tool for this capability", "Check the step parameters"]),
            )
        }
        StepError::Cancelled(_) => {
            return ("Execution was cancelled".to_string(), Vec::new());
        }
        _ => {}
    }

    if message.contains("command not found") {
        (
            "Missing or incompatible dependency".to_string(),
            fixes(&[
                "Install the missing package",
                "Check that the program is on PATH",
                "Verify the environment is activated",
            ]),
        )
    } else if message.contains("no such file") || message.contains("not found") {
        (
            "File or directory does not exist".to_string(),
            fixes(&[
                "Check if the file path is correct",
                "Ensure the file exists before accessing",
                "Create the file or directory if needed",
            ]),
        )
    } else if message.contains("permission denied") || message.contains("read-only") {
        (
            "Insufficient permissions to access resource".to_string(),
            fixes(&[
                "Check file/directory permissions",
                "Run with appropriate privileges",
                "Verify ownership of the resource",
            ]),
        )
    } else if message.contains("connection") || message.contains("timeout") || message.contains("timed out") {
        (
            "Network connectivity or timeout issue".to_string(),
            fixes(&[
                "Check network connectivity",
                "Verify the service is running",
                "Increase timeout value",
                "Retry the operation",
            ]),
        )
    } else if message.contains("module") || message.contains("import") {
        (
            "Missing or incompatible dependency".to_string(),
            fixes(&[
                "Install the missing package",
                "Check the import statement",
                "Verify the environment is activated",
            ]),
        )
    } else if message.contains("syntax") {
        (
            "Invalid syntax in code".to_string(),
            fixes(&[
                "Check for missing brackets, quotes, or colons",
                "Review the syntax of the statement",
            ]),
        )
    } else {
        let excerpt: String = error.message().chars().take(100).collect();
        (
            format!("{}: {}", error.kind(), excerpt),
            fixes(&[
                "Check the error message for details",
                "Add error handling around the operation",
            ]),
        )
    }
}

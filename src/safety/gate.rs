//! 安全闸门
//!
//! 对每次执行尝试构造的 Action 分级并授权：
//! - low：自动批准
//! - medium：自动批准，并在上下文存储中留下敏感操作记录
//! - high：挂起等待确认协作方，超时即拒绝
//! - critical：同 high，但理由为空时直接拒绝，不询问协作方
//!
//! 等待确认期间监听紧急停止信号，一旦触发立即返回取消。

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::{StepError, StopReason, StopSignal};
use crate::memory::{ContextStore, RecordKind};
use crate::plan::{StepId, TaskStep};
use crate::safety::confirm::{Confirmer, Verdict};
use crate::safety::risk::{EffectClass, RiskClassifier, RiskLevel};
use crate::tools::BoundTool;

/// 授权状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApprovalState {
    Pending,
    Approved,
    Denied,
    AutoApproved,
}

impl ApprovalState {
    pub fn is_approved(self) -> bool {
        matches!(self, ApprovalState::Approved | ApprovalState::AutoApproved)
    }
}

/// 即将执行的具体副作用操作；每次尝试重新构造，不跨越步骤生命周期
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    pub id: String,
    pub step_id: StepId,
    pub tool: String,
    pub description: String,
    pub command: Option<String>,
    pub effect_class: EffectClass,
    pub risk_level: Option<RiskLevel>,
    pub approval_state: ApprovalState,
    pub justification: Option<String>,
}

impl Action {
    /// 由已路由的步骤构造
    pub fn from_bound(step: &TaskStep, bound: &BoundTool) -> Self {
        Self {
            id: format!("act_{}", uuid::Uuid::new_v4()),
            step_id: step.id.clone(),
            tool: bound.name().to_string(),
            description: step.description.clone(),
            command: bound.tool.command_preview(&bound.params),
            effect_class: bound.effect_class,
            risk_level: None,
            approval_state: ApprovalState::Pending,
            justification: step.justification.clone(),
        }
    }
}

/// 安全闸门
pub struct SafetyGate {
    classifier: RiskClassifier,
    confirmer: Arc<dyn Confirmer>,
    confirmation_timeout: Duration,
    stop: StopSignal,
    context: Arc<ContextStore>,
}

impl SafetyGate {
    pub fn new(
        classifier: RiskClassifier,
        confirmer: Arc<dyn Confirmer>,
        confirmation_timeout: Duration,
        stop: StopSignal,
        context: Arc<ContextStore>,
    ) -> Self {
        Self {
            classifier,
            confirmer,
            confirmation_timeout,
            stop,
            context,
        }
    }

    pub fn stop_signal(&self) -> &StopSignal {
        &self.stop
    }

    /// 确定性分级：效果类别策略表 + 命令模式提级
    pub fn classify_risk(&self, action: &Action) -> RiskLevel {
        self.classifier
            .classify(action.effect_class, action.command.as_deref())
    }

    /// 授权；返回最终的 ApprovalState（Approved / AutoApproved / Denied），
    /// 紧急停止时返回 Err(Cancelled)
    pub async fn authorize(&self, action: &mut Action) -> Result<ApprovalState, StepError> {
        if self.stop.is_stopped() {
            return Err(StepError::Cancelled("emergency stop before authorization".into()));
        }

        let risk = self.classify_risk(action);
        action.risk_level = Some(risk);

        let state = match risk {
            RiskLevel::Low => ApprovalState::AutoApproved,
            RiskLevel::Medium => {
                self.context.append(
                    RecordKind::Decision,
                    Some(&action.step_id),
                    format!(
                        "sensitive action: {} via {} ({})",
                        action.command.as_deref().unwrap_or(&action.description),
                        action.tool,
                        action.effect_class
                    ),
                );
                ApprovalState::AutoApproved
            }
            RiskLevel::Critical
                if action
                    .justification
                    .as_deref()
                    .map_or(true, |j| j.trim().is_empty()) =>
            {
                tracing::warn!(
                    step_id = %action.step_id,
                    tool = %action.tool,
                    "critical action without justification denied"
                );
                ApprovalState::Denied
            }
            RiskLevel::High | RiskLevel::Critical => self.await_confirmation(action, risk).await?,
        };

        action.approval_state = state;
        tracing::info!(
            step_id = %action.step_id,
            tool = %action.tool,
            risk = %risk,
            verdict = ?state,
            "authorization verdict"
        );
        Ok(state)
    }

    async fn await_confirmation(
        &self,
        action: &Action,
        risk: RiskLevel,
    ) -> Result<ApprovalState, StepError> {
        let token = self.stop.token();
        let request = self
            .confirmer
            .request(action, risk, action.justification.as_deref());

        tokio::select! {
            biased;
            _ = token.cancelled() => {
                Err(StepError::Cancelled("emergency stop during authorization".into()))
            }
            verdict = tokio::time::timeout(self.confirmation_timeout, request) => {
                match verdict {
                    Ok(Verdict::Approved) => Ok(ApprovalState::Approved),
                    Ok(Verdict::Denied) => Ok(ApprovalState::Denied),
                    Err(_) => {
                        tracing::warn!(
                            step_id = %action.step_id,
                            timeout_secs = self.confirmation_timeout.as_secs(),
                            "confirmation timed out, denying"
                        );
                        Ok(ApprovalState::Denied)
                    }
                }
            }
        }
    }

    /// 紧急停止：进程级单次信号；重复调用无副作用
    pub fn emergency_stop(&self, reason: impl Into<String>) -> bool {
        self.stop_for(StopReason::Requested(reason.into()))
    }

    /// 按给定原因触发停止；只有第一次生效并写入一条 Decision 记录
    pub fn stop_for(&self, reason: StopReason) -> bool {
        let text = match &reason {
            StopReason::Requested(text) => text.clone(),
            other => other.to_string(),
        };
        let fired = self.stop.trigger(reason);
        if fired {
            self.context
                .append(RecordKind::Decision, None, format!("emergency stop: {text}"));
        }
        fired
    }

    /// 安装系统信号处理器 (Ctrl+C, SIGTERM)，信号经闸门触发紧急停止
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let gate = Arc::clone(self);
        tokio::spawn(async move {
            if let Ok(()) = tokio::signal::ctrl_c().await {
                tracing::info!("Received Ctrl+C, stopping plan execution...");
                gate.stop_for(StopReason::UserInterrupt);
            }
        });

        #[cfg(unix)]
        {
            let gate = Arc::clone(self);
            tokio::spawn(async move {
                use tokio::signal::unix::{signal as unix_signal, SignalKind};
                if let Ok(mut sigterm) = unix_signal(SignalKind::terminate()) {
                    sigterm.recv().await;
                    tracing::info!("Received SIGTERM, stopping plan execution...");
                    gate.stop_for(StopReason::Signal);
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{Capability, Tool, ToolFailure, ToolOutput};
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        calls: AtomicUsize,
        verdict: Verdict,
        delay: Duration,
    }

    impl Counting {
        fn new(verdict: Verdict) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                verdict,
                delay: Duration::ZERO,
            })
        }
    }

    #[async_trait]
    impl Confirmer for Counting {
        async fn request(&self, _action: &Action, _risk: RiskLevel, _j: Option<&str>) -> Verdict {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.verdict
        }
    }

    struct Noop;

    #[async_trait]
    impl Tool for Noop {
        fn name(&self) -> &str {
            "noop"
        }
        fn description(&self) -> &str {
            "noop"
        }
        fn capability(&self) -> Capability {
            Capability::Core
        }
        async fn invoke(&self, _params: Value) -> Result<ToolOutput, ToolFailure> {
            Ok(ToolOutput::text(""))
        }
    }

    fn action(effect: EffectClass, justification: Option<&str>) -> Action {
        let mut step = TaskStep::new("s1", "do it");
        step.justification = justification.map(str::to_string);
        let bound = BoundTool {
            tool: Arc::new(Noop),
            params: Value::Null,
            score: 0.0,
            estimated_cost: 0.0,
            effect_class: effect,
        };
        Action::from_bound(&step, &bound)
    }

    fn gate(confirmer: Arc<dyn Confirmer>, timeout: Duration) -> (SafetyGate, Arc<ContextStore>) {
        let context = Arc::new(ContextStore::new(10_000));
        let gate = SafetyGate::new(
            RiskClassifier::new(),
            confirmer,
            timeout,
            StopSignal::new(),
            Arc::clone(&context),
        );
        (gate, context)
    }

    #[tokio::test]
    async fn test_low_and_medium_auto_approved() {
        let confirmer = Counting::new(Verdict::Denied);
        let (gate, context) = gate(confirmer.clone(), Duration::from_secs(1));

        let mut low = action(EffectClass::ReadOnly, None);
        assert_eq!(gate.authorize(&mut low).await.unwrap(), ApprovalState::AutoApproved);
        assert!(context.is_empty());

        let mut medium = action(EffectClass::LocalWrite, None);
        assert_eq!(gate.authorize(&mut medium).await.unwrap(), ApprovalState::AutoApproved);
        assert_eq!(medium.risk_level, Some(RiskLevel::Medium));
        let records = context.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind, RecordKind::Decision);
        assert!(records[0].content.starts_with("sensitive action"));
        assert_eq!(confirmer.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_critical_without_justification_never_asks() {
        let confirmer = Counting::new(Verdict::Approved);
        let (gate, _) = gate(confirmer.clone(), Duration::from_secs(1));
        for justification in [None, Some(""), Some("   ")] {
            let mut act = action(EffectClass::DestructiveRemote, justification);
            assert_eq!(gate.authorize(&mut act).await.unwrap(), ApprovalState::Denied);
        }
        assert_eq!(confirmer.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_critical_with_justification_asks_once() {
        let confirmer = Counting::new(Verdict::Approved);
        let (gate, _) = gate(confirmer.clone(), Duration::from_secs(1));
        let mut act = action(EffectClass::DestructiveRemote, Some("cleanup approved by ops"));
        assert_eq!(gate.authorize(&mut act).await.unwrap(), ApprovalState::Approved);
        assert_eq!(confirmer.calls.load(Ordering::SeqCst), 1);
        assert_eq!(act.approval_state, ApprovalState::Approved);
    }

    #[tokio::test]
    async fn test_high_timeout_is_denied() {
        let confirmer = Arc::new(Counting {
            calls: AtomicUsize::new(0),
            verdict: Verdict::Approved,
            delay: Duration::from_secs(10),
        });
        let (gate, _) = gate(confirmer, Duration::from_millis(20));
        let mut act = action(EffectClass::RemoteWrite, None);
        assert_eq!(gate.authorize(&mut act).await.unwrap(), ApprovalState::Denied);
    }

    #[tokio::test]
    async fn test_emergency_stop_cancels_wait_and_is_idempotent() {
        let confirmer = Arc::new(Counting {
            calls: AtomicUsize::new(0),
            verdict: Verdict::Approved,
            delay: Duration::from_secs(30),
        });
        let (gate, context) = gate(confirmer, Duration::from_secs(60));
        let gate = Arc::new(gate);

        let waiter = {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move {
                let mut act = action(EffectClass::RemoteWrite, None);
                gate.authorize(&mut act).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(gate.emergency_stop("operator"));
        assert!(!gate.emergency_stop("again"));

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(StepError::Cancelled(_))));
        assert_eq!(
            context
                .records()
                .iter()
                .filter(|r| r.content.starts_with("emergency stop"))
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn test_signal_stop_is_recorded_once() {
        let (gate, context) = gate(Counting::new(Verdict::Approved), Duration::from_secs(1));
        let mut reasons = gate.stop.subscribe();

        assert!(gate.stop_for(StopReason::Signal));
        assert!(!gate.stop_for(StopReason::UserInterrupt));
        assert!(!gate.emergency_stop("late"));

        assert_eq!(reasons.try_recv().unwrap(), StopReason::Signal);
        let decisions: Vec<String> = context
            .records()
            .into_iter()
            .filter(|r| r.kind == RecordKind::Decision)
            .map(|r| r.content)
            .collect();
        assert_eq!(decisions, vec!["emergency stop: termination signal".to_string()]);
    }
}

//! 调度器：中心协调者 + 有界 worker 池
//!
//! 协调者循环：推进就绪步骤 → 按优先级取 Ready 步骤 → 路由（同步、不挂起）→ 占用并发许可后派发 worker。
//! worker 负责授权、执行、瞬时错误的退避重试（每次重试重新路由）；致命错误由 worker 向
//! RecoveryManager 请求修复计划，协调者只负责把修复链插入计划，没有修复时依赖方级联取消。
//!
//! 授权等待、工具执行、退避休眠、修复提案四个挂起点都监听紧急停止令牌；停止后不再推进任何 Pending/Ready 步骤。

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::{BoxFuture, FutureExt};
use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinError;

use crate::core::{
    FixPlan, PlanError, PlanReport, RecoveryManager, RollbackResult, StepError, StopSignal, ToolErrorKind,
};
use crate::memory::{ContextStore, RecordKind};
use crate::plan::{ExecutionPlan, SideEffect, StepId, StepState};
use crate::safety::{Action, RiskLevel, SafetyGate};
use crate::tools::{BoundTool, ToolExecutor, ToolRouter};

/// 调度参数
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub max_concurrent: usize,
    pub step_timeout: Duration,
    /// overall 复杂度达到该值视为重型步骤
    pub heavy_step_threshold: f64,
    pub max_heavy_in_flight: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            step_timeout: Duration::from_secs(300),
            heavy_step_threshold: 7.0,
            max_heavy_in_flight: 2,
        }
    }
}

/// worker 的终态
#[derive(Debug)]
struct WorkerOutcome {
    state: StepState,
    error: Option<StepError>,
    /// 致命失败时 worker 取得的修复计划
    fix: Option<FixPlan>,
}

impl WorkerOutcome {
    fn new(state: StepState, error: Option<StepError>) -> Self {
        Self { state, error, fix: None }
    }
}

type InFlight = FuturesUnordered<BoxFuture<'static, (StepId, bool, Result<WorkerOutcome, JoinError>)>>;

/// 调度器
pub struct Scheduler {
    config: SchedulerConfig,
    router: Arc<ToolRouter>,
    gate: Arc<SafetyGate>,
    executor: Arc<ToolExecutor>,
    recovery: Arc<RecoveryManager>,
    context: Arc<ContextStore>,
    stop: StopSignal,
    /// worker 提前归还并发许可时唤醒协调者
    slot_released: Notify,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        router: Arc<ToolRouter>,
        gate: Arc<SafetyGate>,
        recovery: Arc<RecoveryManager>,
        context: Arc<ContextStore>,
        stop: StopSignal,
    ) -> Self {
        let executor = Arc::new(ToolExecutor::new(config.step_timeout));
        Self {
            config,
            router,
            gate,
            executor,
            recovery,
            context,
            stop,
            slot_released: Notify::new(),
        }
    }

    pub fn stop_signal(&self) -> &StopSignal {
        &self.stop
    }

    pub fn gate(&self) -> &Arc<SafetyGate> {
        &self.gate
    }

    /// 运行计划直到没有 Pending / Ready / Authorizing / Running 步骤，返回终态报告
    pub async fn run(self: &Arc<Self>, plan: Arc<ExecutionPlan>) -> PlanReport {
        let started = Instant::now();
        let token = self.stop.token();
        let slots = Arc::new(Semaphore::new(self.config.max_concurrent.max(1)));
        let max_heavy = self.config.max_heavy_in_flight.max(1);

        self.context.begin_run();
        self.context.append(
            RecordKind::Note,
            None,
            format!("plan {} started: {}", plan.id(), plan.goal()),
        );
        let total = plan.len().await;
        tracing::info!(plan_id = %plan.id(), steps = total, "plan execution started");

        let mut in_flight: InFlight = FuturesUnordered::new();
        let mut running: HashMap<StepId, bool> = HashMap::new();
        let mut fixes: Vec<(StepId, StepError, FixPlan)> = Vec::new();

        loop {
            if token.is_cancelled() {
                break;
            }

            for (id, state) in plan.promote_ready().await {
                if state == StepState::Cancelled {
                    self.context.append(
                        RecordKind::Note,
                        Some(&id),
                        "skipped: a dependency did not succeed",
                    );
                }
            }

            let mut progressed = false;
            for step in plan.ready_steps().await {
                let heavy = step
                    .complexity
                    .is_some_and(|c| c.is_heavy(self.config.heavy_step_threshold));
                let heavy_running = running.values().filter(|h| **h).count();
                if heavy && heavy_running >= max_heavy {
                    continue;
                }
                let Ok(permit) = Arc::clone(&slots).try_acquire_owned() else {
                    break;
                };

                match self.router.route_step(&step) {
                    Err(error) => {
                        self.finish_failed(&plan, &step.id, error).await;
                        progressed = true;
                    }
                    Ok(bound) => {
                        let name = bound.name().to_string();
                        let routed = plan
                            .update(&step.id, |s| {
                                s.bound_tool = Some(name);
                                s.transition(StepState::Authorizing)
                            })
                            .await;
                        if let Err(e) | Ok(Err(e)) = routed {
                            tracing::warn!(step_id = %step.id, error = %e, "dispatch transition rejected");
                            continue;
                        }
                        running.insert(step.id.clone(), heavy);
                        in_flight.push(self.spawn_worker(Arc::clone(&plan), step.id.clone(), bound, heavy, permit));
                    }
                }
            }

            if in_flight.is_empty() {
                if progressed {
                    continue;
                }
                break;
            }

            let finished = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                next = in_flight.next() => next,
                _ = self.slot_released.notified() => continue,
            };
            let Some((id, _heavy, joined)) = finished else {
                continue;
            };
            running.remove(&id);

            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::error!(step_id = %id, error = %e, "step worker panicked");
                    let error = StepError::FatalExecution {
                        kind: ToolErrorKind::Other("panic".to_string()),
                        message: e.to_string(),
                    };
                    self.finish_failed(&plan, &id, error).await
                }
            };
            self.handle_outcome(&plan, &id, outcome, &mut fixes).await;
            let status = plan.status().await;
            tracing::debug!(plan_id = %plan.id(), status = ?status, "plan status");
        }

        if token.is_cancelled() {
            // 在途 worker 会在挂起点观察到停止信号并自行取消
            while let Some((id, _, joined)) = in_flight.next().await {
                if let Err(e) = joined {
                    tracing::error!(step_id = %id, error = %e, "step worker panicked during stop");
                    if let Err(e) | Ok(Err(e)) = plan.update(&id, |s| s.cancel("emergency stop")).await {
                        tracing::warn!(step_id = %id, error = %e, "cancel transition rejected");
                    }
                }
            }
            let cancelled = plan
                .cancel_non_terminal(&HashSet::new(), "emergency stop")
                .await;
            plan.mark_stopped();
            tracing::warn!(plan_id = %plan.id(), cancelled = ?cancelled, "plan stopped");
        }

        for (terminal, error, fix) in &fixes {
            let success = plan
                .step(terminal)
                .await
                .is_some_and(|s| s.state == StepState::Succeeded);
            self.recovery.learn_from_error(error, Some(fix), success);
        }

        let status = plan.status().await;
        let steps = plan.snapshot().await;
        let report = PlanReport::new(
            plan.id(),
            plan.goal(),
            status,
            &steps,
            started.elapsed().as_millis() as u64,
        );
        self.context.append(
            RecordKind::Decision,
            None,
            format!("plan {} finished: {:?}", plan.id(), status),
        );
        self.context.end_run();
        tracing::info!(plan_id = %plan.id(), status = ?status, duration_ms = report.duration_ms, "plan execution finished");
        report
    }

    fn spawn_worker(
        self: &Arc<Self>,
        plan: Arc<ExecutionPlan>,
        step_id: StepId,
        bound: BoundTool,
        heavy: bool,
        permit: OwnedSemaphorePermit,
    ) -> BoxFuture<'static, (StepId, bool, Result<WorkerOutcome, JoinError>)> {
        let this = Arc::clone(self);
        let id = step_id.clone();
        let handle = tokio::spawn(async move { this.run_step(&plan, &id, bound, permit).await });
        async move { (step_id, heavy, handle.await) }.boxed()
    }

    /// 失败步骤：插入 worker 取得的修复链；没有修复时依赖方将在下一轮推进时级联取消
    async fn handle_outcome(
        &self,
        plan: &ExecutionPlan,
        step_id: &str,
        outcome: WorkerOutcome,
        fixes: &mut Vec<(StepId, StepError, FixPlan)>,
    ) {
        if outcome.state != StepState::Failed {
            return;
        }
        let Some(error) = outcome.error else { return };
        let Some(fix) = outcome.fix else {
            self.recovery.learn_from_error(&error, None, false);
            return;
        };

        match plan.insert_fix_chain(step_id, fix.steps.clone()).await {
            Ok(inserted) => {
                self.context.append(
                    RecordKind::Decision,
                    Some(step_id),
                    format!("fix chain inserted: {}", inserted.join(" -> ")),
                );
                if let Some(terminal) = inserted.last() {
                    fixes.push((terminal.clone(), error, fix));
                }
            }
            Err(e) => {
                tracing::warn!(step_id = %step_id, error = %e, "fix chain rejected");
                self.recovery.learn_from_error(&error, None, false);
            }
        }
    }

    /// 单步生命周期：授权 → 执行 → {成功 | 退避重试 | 失败 | 取消}
    async fn run_step(
        &self,
        plan: &ExecutionPlan,
        step_id: &str,
        mut bound: BoundTool,
        permit: OwnedSemaphorePermit,
    ) -> WorkerOutcome {
        let token = self.stop.token();
        let mut authorized_tool: Option<String> = None;

        loop {
            let Some(step) = plan.step(step_id).await else {
                return WorkerOutcome::new(StepState::Failed, None);
            };

            if authorized_tool.as_deref() != Some(bound.name()) {
                if step.state == StepState::Retrying {
                    if let Err(e) = plan.transition(step_id, StepState::Authorizing).await {
                        tracing::warn!(step_id = %step_id, error = %e, "re-authorization transition rejected");
                    }
                }
                let mut action = Action::from_bound(&step, &bound);
                match self.gate.authorize(&mut action).await {
                    Err(error) => return self.finish_cancelled(plan, step_id, error).await,
                    Ok(state) if !state.is_approved() => {
                        let error = StepError::RiskDenied(format!(
                            "{} action via '{}' was denied",
                            action.risk_level.map_or_else(|| "unclassified".to_string(), |r| r.to_string()),
                            action.tool
                        ));
                        self.record_risk(plan, step_id, action.risk_level).await;
                        return self.finish_failed(plan, step_id, error).await;
                    }
                    Ok(_) => {
                        self.record_risk(plan, step_id, action.risk_level).await;
                        authorized_tool = Some(bound.name().to_string());
                    }
                }
            }

            let attempt = match plan
                .update(step_id, |s| {
                    s.transition(StepState::Running)?;
                    s.attempt += 1;
                    s.bound_tool = Some(bound.name().to_string());
                    Ok::<u32, PlanError>(s.attempt)
                })
                .await
            {
                Ok(Ok(attempt)) => attempt,
                Ok(Err(e)) | Err(e) => {
                    // 停止信号可能已经把步骤置为终态
                    tracing::warn!(step_id = %step_id, error = %e, "run transition rejected");
                    let state = plan.step(step_id).await.map_or(StepState::Failed, |s| s.state);
                    return WorkerOutcome::new(state, None);
                }
            };
            tracing::info!(step_id = %step_id, tool = %bound.name(), attempt, "step running");

            let class = step.capability.unwrap_or_else(|| bound.tool.capability());
            match self.executor.execute(step_id, &bound, &token).await {
                Ok(output) => {
                    self.router.record_outcome(bound.name(), class, true);
                    let effect = output.effect.clone();
                    let tool = bound.name().to_string();
                    let text = output.output;
                    let result = plan
                        .update(step_id, |s| {
                            if let Some(payload) = effect {
                                s.side_effects.push(SideEffect {
                                    tool,
                                    payload,
                                    rolled_back: false,
                                });
                            }
                            s.succeed(text.clone())
                        })
                        .await;
                    if let Err(e) | Ok(Err(e)) = result {
                        tracing::warn!(step_id = %step_id, error = %e, "success transition rejected");
                    }
                    self.context.append(RecordKind::Output, Some(step_id), text);
                    tracing::info!(step_id = %step_id, attempt, "step succeeded");
                    return WorkerOutcome::new(StepState::Succeeded, None);
                }
                Err(failure) => {
                    if let Some(payload) = failure.partial_effect {
                        let tool = bound.name().to_string();
                        let recorded = plan
                            .update(step_id, |s| {
                                s.side_effects.push(SideEffect {
                                    tool,
                                    payload,
                                    rolled_back: false,
                                })
                            })
                            .await;
                        if let Err(e) = recorded {
                            tracing::warn!(step_id = %step_id, error = %e, "partial effect not recorded");
                        }
                    }
                    let error = failure.error;
                    if matches!(error, StepError::Cancelled(_)) {
                        return self.finish_cancelled(plan, step_id, error).await;
                    }
                    self.router.record_outcome(bound.name(), class, false);

                    if !self.recovery.should_retry(&error, attempt) {
                        self.rollback_effects(plan, step_id).await;
                        // 提案不占并发许可；步骤保持 Running，依赖方不会在修复链插入前被级联取消
                        drop(permit);
                        self.slot_released.notify_one();
                        let fix = self.propose_fix(plan, step_id, &error).await;
                        let mut outcome = self.finish_failed(plan, step_id, error).await;
                        if outcome.state == StepState::Failed {
                            outcome.fix = fix;
                        }
                        return outcome;
                    }

                    // 重试前先撤销本次尝试的部分副作用
                    self.rollback_effects(plan, step_id).await;
                    if let Err(e) = plan.transition(step_id, StepState::Retrying).await {
                        tracing::warn!(step_id = %step_id, error = %e, "retry transition rejected");
                    }
                    let delay = self.recovery.backoff_delay(attempt);
                    tracing::warn!(
                        step_id = %step_id,
                        tool = %bound.name(),
                        attempt,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %error,
                        "retrying step after transient error"
                    );
                    self.context.append(
                        RecordKind::Error,
                        Some(step_id),
                        format!("attempt {attempt} failed, retrying: {error}"),
                    );

                    tokio::select! {
                        biased;
                        _ = token.cancelled() => {
                            return self
                                .finish_cancelled(plan, step_id, StepError::Cancelled("emergency stop during backoff".into()))
                                .await;
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }

                    // 重新路由：出错的可能是工具本身
                    let current = plan.step(step_id).await.unwrap_or(step);
                    match self.router.route_step(&current) {
                        Ok(next) => {
                            if next.name() != bound.name() {
                                tracing::info!(step_id = %step_id, from = %bound.name(), to = %next.name(), "step re-routed");
                            }
                            bound = next;
                        }
                        Err(route_error) => return self.finish_failed(plan, step_id, route_error).await,
                    }
                }
            }
        }
    }

    /// 请求修复计划；紧急停止时立即放弃
    async fn propose_fix(&self, plan: &ExecutionPlan, step_id: &str, error: &StepError) -> Option<FixPlan> {
        let step = plan.step(step_id).await?;
        let token = self.stop.token();
        tokio::select! {
            biased;
            _ = token.cancelled() => {
                tracing::info!(step_id = %step_id, "fix proposal abandoned by emergency stop");
                None
            }
            fix = self.recovery.plan_fix(error, &step, plan.goal(), &self.context) => fix,
        }
    }

    /// 回滚未撤销的副作用；逆操作失败记入上下文，并保留在步骤报告中
    async fn rollback_effects(&self, plan: &ExecutionPlan, step_id: &str) {
        match self.recovery.rollback(plan, step_id).await {
            Ok(RollbackResult::Partial { reverted, failures }) => {
                tracing::warn!(step_id = %step_id, reverted, failed = failures.len(), "rollback incomplete");
                self.context.append(
                    RecordKind::Error,
                    Some(step_id),
                    format!("rollback failed: {}", failures.join("; ")),
                );
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(step_id = %step_id, error = %e, "rollback skipped"),
        }
    }

    async fn record_risk(&self, plan: &ExecutionPlan, step_id: &str, risk: Option<RiskLevel>) {
        if let Err(e) = plan.update(step_id, |s| s.risk_level = risk).await {
            tracing::warn!(step_id = %step_id, error = %e, "risk level not recorded");
        }
    }

    async fn finish_failed(&self, plan: &ExecutionPlan, step_id: &str, error: StepError) -> WorkerOutcome {
        let message = error.to_string();
        match plan.update(step_id, |s| s.fail(error.clone())).await {
            Ok(Ok(())) => {
                tracing::warn!(step_id = %step_id, error = %message, "step failed");
                self.context.append(RecordKind::Error, Some(step_id), message);
                WorkerOutcome::new(StepState::Failed, Some(error))
            }
            Ok(Err(e)) | Err(e) => {
                tracing::warn!(step_id = %step_id, error = %e, "fail transition rejected");
                let state = plan.step(step_id).await.map_or(StepState::Failed, |s| s.state);
                WorkerOutcome::new(state, None)
            }
        }
    }

    async fn finish_cancelled(&self, plan: &ExecutionPlan, step_id: &str, error: StepError) -> WorkerOutcome {
        let reason = error.message().to_string();
        if let Err(e) | Ok(Err(e)) = plan.update(step_id, |s| s.cancel(reason.clone())).await {
            tracing::debug!(step_id = %step_id, error = %e, "cancel transition rejected");
        }
        tracing::info!(step_id = %step_id, reason = %reason, "step cancelled");
        WorkerOutcome::new(StepState::Cancelled, Some(error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

    use async_trait::async_trait;
    use serde_json::Value;

    use crate::core::{ErrorKind, NoFixProposer, RecoveryPolicy};
    use crate::memory::NoopLongTerm;
    use crate::plan::{PlanBuilder, PlanStatus, StepProposal};
    use crate::safety::{AutoApprove, RiskClassifier};
    use crate::tools::{Capability, Tool, ToolFailure, ToolOutput, ToolRegistry};

    struct Flaky {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl Tool for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }
        fn description(&self) -> &str {
            "fails a few times before succeeding"
        }
        fn capability(&self) -> Capability {
            Capability::Core
        }
        async fn invoke(&self, _params: Value) -> Result<ToolOutput, ToolFailure> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.failures {
                Err(ToolFailure::new(ToolErrorKind::Network, "connection reset"))
            } else {
                Ok(ToolOutput::text("ok"))
            }
        }
    }

    #[derive(Default)]
    struct Slow {
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl Tool for Slow {
        fn name(&self) -> &str {
            "slow"
        }
        fn description(&self) -> &str {
            "sleeps briefly"
        }
        fn capability(&self) -> Capability {
            Capability::Core
        }
        async fn invoke(&self, _params: Value) -> Result<ToolOutput, ToolFailure> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(30)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(ToolOutput::text("slept"))
        }
    }

    fn scheduler(registry: ToolRegistry, max_concurrent: usize, max_retries: u32) -> Arc<Scheduler> {
        let registry = Arc::new(registry);
        let stop = StopSignal::new();
        let context = Arc::new(ContextStore::new(10_000));
        let gate = Arc::new(SafetyGate::new(
            RiskClassifier::default(),
            Arc::new(AutoApprove),
            Duration::from_secs(1),
            stop.clone(),
            Arc::clone(&context),
        ));
        let policy = RecoveryPolicy {
            max_retries,
            backoff_base: Duration::from_millis(1),
            backoff_max: Duration::from_millis(5),
            ..RecoveryPolicy::default()
        };
        let recovery = Arc::new(RecoveryManager::new(
            policy,
            Arc::new(NoFixProposer),
            Arc::new(NoopLongTerm),
            Arc::clone(&registry),
        ));
        let config = SchedulerConfig {
            max_concurrent,
            step_timeout: Duration::from_secs(5),
            ..SchedulerConfig::default()
        };
        Arc::new(Scheduler::new(
            config,
            Arc::new(ToolRouter::new(registry)),
            gate,
            recovery,
            context,
            stop,
        ))
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let flaky = Arc::new(Flaky {
            failures: 2,
            calls: AtomicU32::new(0),
        });
        let mut registry = ToolRegistry::new();
        registry.register_arc(flaky.clone());
        let scheduler = scheduler(registry, 2, 3);

        let plan = PlanBuilder::from_proposals(
            "retry",
            vec![StepProposal::new("call the flaky service").with_id("s1").with_tool("flaky", Value::Null)],
        )
        .unwrap();
        let report = scheduler.run(Arc::new(plan)).await;

        assert_eq!(report.status, PlanStatus::Succeeded);
        assert_eq!(report.step("s1").unwrap().attempts, 3);
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retries_exhausted_after_n_plus_one_attempts() {
        let flaky = Arc::new(Flaky {
            failures: 100,
            calls: AtomicU32::new(0),
        });
        let mut registry = ToolRegistry::new();
        registry.register_arc(flaky.clone());
        let scheduler = scheduler(registry, 2, 2);

        let plan = PlanBuilder::from_proposals(
            "retry",
            vec![
                StepProposal::new("call the flaky service").with_id("s1").with_tool("flaky", Value::Null),
                StepProposal::new("never runs").with_id("s2").with_tool("flaky", Value::Null),
            ],
        )
        .unwrap();
        let report = scheduler.run(Arc::new(plan)).await;

        assert_eq!(report.status, PlanStatus::Failed);
        let s1 = report.step("s1").unwrap();
        assert_eq!(s1.state, StepState::Failed);
        assert_eq!(s1.attempts, 3);
        assert_eq!(s1.error_kind, Some(ErrorKind::TransientExecution));
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
        assert_eq!(report.step("s2").unwrap().state, StepState::Cancelled);
    }

    #[tokio::test]
    async fn test_concurrency_cap_is_respected() {
        let slow = Arc::new(Slow::default());
        let mut registry = ToolRegistry::new();
        registry.register_arc(slow.clone());
        let scheduler = scheduler(registry, 2, 0);

        let proposals = (1..=5)
            .map(|i| {
                StepProposal::new(format!("independent step {i}"))
                    .with_id(format!("s{i}"))
                    .depends_on(Vec::<String>::new())
                    .with_tool("slow", Value::Null)
            })
            .collect();
        let plan = PlanBuilder::from_proposals("parallel", proposals).unwrap();
        let report = scheduler.run(Arc::new(plan)).await;

        assert_eq!(report.status, PlanStatus::Succeeded);
        assert!(slow.peak.load(Ordering::SeqCst) <= 2);
        assert!(slow.peak.load(Ordering::SeqCst) >= 1);
        assert!(!scheduler.context.is_run_active());
    }
}

//! 集成测试共用的脚本化工具、计数确认方与组件装配

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use taskforge::core::{
    FixContext, FixPlan, FixProposer, NoFixProposer, RecoveryManager, RecoveryPolicy, StepError,
    StopSignal, ToolErrorKind,
};
use taskforge::memory::{ContextStore, NoopLongTerm};
use taskforge::plan::StepProposal;
use taskforge::safety::{Action, AutoApprove, Confirmer, EffectClass, RiskClassifier, RiskLevel, SafetyGate, Verdict};
use taskforge::scheduler::{Scheduler, SchedulerConfig};
use taskforge::tools::{Capability, EchoTool, Tool, ToolFailure, ToolOutput, ToolRegistry, ToolRouter};

/// 脚本化工具的单次行为
#[derive(Debug, Clone)]
pub enum Scripted {
    Succeed(String),
    Transient,
    Fatal,
    /// 失败但留下需要回滚的部分副作用
    FatalWithPartialEffect,
    Hang,
}

/// 按脚本依次返回结果；脚本耗尽后使用 fallback
pub struct ScriptedTool {
    name: String,
    capability: Capability,
    effect: EffectClass,
    script: Mutex<VecDeque<Scripted>>,
    fallback: Scripted,
    revert_fails: bool,
    pub calls: AtomicU32,
    pub reverts: AtomicU32,
}

impl ScriptedTool {
    pub fn new(name: &str, script: Vec<Scripted>, fallback: Scripted) -> Self {
        Self {
            name: name.to_string(),
            capability: Capability::Core,
            effect: EffectClass::ReadOnly,
            script: Mutex::new(script.into()),
            fallback,
            revert_fails: false,
            calls: AtomicU32::new(0),
            reverts: AtomicU32::new(0),
        }
    }

    pub fn always(name: &str, behaviour: Scripted) -> Self {
        Self::new(name, Vec::new(), behaviour)
    }

    pub fn with_effect(mut self, effect: EffectClass) -> Self {
        self.effect = effect;
        self
    }

    /// 逆操作总是失败
    pub fn with_failing_revert(mut self) -> Self {
        self.revert_fails = true;
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn reverts(&self) -> u32 {
        self.reverts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Tool for ScriptedTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "scripted test tool"
    }

    fn capability(&self) -> Capability {
        self.capability
    }

    fn effect_class(&self, _params: &Value) -> EffectClass {
        self.effect
    }

    async fn invoke(&self, _params: Value) -> Result<ToolOutput, ToolFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = {
            let mut script = self.script.lock().unwrap();
            script.pop_front().unwrap_or_else(|| self.fallback.clone())
        };
        match next {
            Scripted::Succeed(output) => Ok(ToolOutput::text(output)),
            Scripted::Transient => Err(ToolFailure::new(ToolErrorKind::RateLimited, "slow down")),
            Scripted::Fatal => Err(ToolFailure::new(
                ToolErrorKind::NotFound,
                "No such file or directory: build.rs",
            )),
            Scripted::FatalWithPartialEffect => Err(ToolFailure::new(
                ToolErrorKind::Permission,
                "permission denied halfway",
            )
            .with_partial_effect(serde_json::json!({"written": 1}))),
            Scripted::Hang => {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(ToolOutput::text("finally"))
            }
        }
    }

    async fn revert(&self, _effect: &Value) -> Result<(), String> {
        self.reverts.fetch_add(1, Ordering::SeqCst);
        if self.revert_fails {
            return Err("revert refused".to_string());
        }
        Ok(())
    }
}

/// 计数确认方
pub struct CountingConfirmer {
    pub verdict: Verdict,
    pub delay: Duration,
    pub calls: AtomicUsize,
}

impl CountingConfirmer {
    pub fn new(verdict: Verdict) -> Self {
        Self {
            verdict,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn slow(verdict: Verdict, delay: Duration) -> Self {
        Self {
            delay,
            ..Self::new(verdict)
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Confirmer for CountingConfirmer {
    async fn request(&self, _action: &Action, _risk: RiskLevel, _justification: Option<&str>) -> Verdict {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.verdict
    }
}

/// 固定返回两步修复（均路由到 echo）
pub struct TwoStepFix;

#[async_trait]
impl FixProposer for TwoStepFix {
    async fn propose_fix(&self, _error: &StepError, _context: &FixContext) -> Option<FixPlan> {
        Some(FixPlan {
            steps: vec![
                StepProposal::new("restore the missing build script")
                    .with_tool("echo", serde_json::json!({"text": "restored"})),
                StepProposal::new("verify the build script")
                    .with_tool("echo", serde_json::json!({"text": "verified"})),
            ],
            confidence: 0.8,
        })
    }
}

/// 两步修复，步骤路由到指定工具；可模拟耗时的提案
pub struct DelayedFix {
    tool: String,
    delay: Duration,
    finished: AtomicBool,
}

impl DelayedFix {
    pub fn new(tool: &str, delay: Duration) -> Self {
        Self {
            tool: tool.to_string(),
            delay,
            finished: AtomicBool::new(false),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FixProposer for DelayedFix {
    async fn propose_fix(&self, _error: &StepError, _context: &FixContext) -> Option<FixPlan> {
        tokio::time::sleep(self.delay).await;
        self.finished.store(true, Ordering::SeqCst);
        Some(FixPlan {
            steps: vec![
                StepProposal::new("repair the failing step").with_tool(&self.tool, Value::Null),
                StepProposal::new("check the repair").with_tool(&self.tool, Value::Null),
            ],
            confidence: 0.5,
        })
    }
}

pub struct HarnessOptions {
    pub confirmer: Arc<dyn Confirmer>,
    pub proposer: Arc<dyn FixProposer>,
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub fix_timeout: Duration,
    pub confirmation_timeout: Duration,
    pub step_timeout: Duration,
    pub max_concurrent: usize,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            confirmer: Arc::new(AutoApprove),
            proposer: Arc::new(NoFixProposer),
            max_retries: 3,
            backoff_base: Duration::from_millis(1),
            fix_timeout: Duration::from_secs(30),
            confirmation_timeout: Duration::from_secs(2),
            step_timeout: Duration::from_secs(5),
            max_concurrent: 4,
        }
    }
}

pub struct Harness {
    pub scheduler: Arc<Scheduler>,
    pub gate: Arc<SafetyGate>,
    pub recovery: Arc<RecoveryManager>,
    pub context: Arc<ContextStore>,
    pub stop: StopSignal,
}

/// echo 总是注册在最前，其余工具按给定顺序注册
pub fn harness(tools: Vec<Arc<dyn Tool>>, options: HarnessOptions) -> Harness {
    let mut registry = ToolRegistry::new();
    registry.register(EchoTool);
    for tool in tools {
        registry.register_arc(tool);
    }
    let registry = Arc::new(registry);

    let stop = StopSignal::new();
    let context = Arc::new(ContextStore::new(50_000));
    let gate = Arc::new(SafetyGate::new(
        RiskClassifier::default(),
        options.confirmer,
        options.confirmation_timeout,
        stop.clone(),
        Arc::clone(&context),
    ));
    let recovery = Arc::new(RecoveryManager::new(
        RecoveryPolicy {
            max_retries: options.max_retries,
            backoff_base: options.backoff_base,
            backoff_max: options.backoff_base * 8,
            fix_timeout: options.fix_timeout,
            ..RecoveryPolicy::default()
        },
        options.proposer,
        Arc::new(NoopLongTerm),
        Arc::clone(&registry),
    ));
    let scheduler = Arc::new(Scheduler::new(
        SchedulerConfig {
            max_concurrent: options.max_concurrent,
            step_timeout: options.step_timeout,
            ..SchedulerConfig::default()
        },
        Arc::new(ToolRouter::new(registry)),
        Arc::clone(&gate),
        Arc::clone(&recovery),
        Arc::clone(&context),
        stop.clone(),
    ));

    Harness {
        scheduler,
        gate,
        recovery,
        context,
        stop,
    }
}

/// 指向某个工具、无依赖提示的提案
pub fn step(id: &str, tool: &str) -> StepProposal {
    StepProposal::new(format!("run {tool} for {id}"))
        .with_id(id)
        .with_tool(tool, Value::Null)
}

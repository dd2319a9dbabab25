//! Headless 运行时：按配置装配全部组件并执行单个目标
//!
//! create_agent_components 构建 ToolRegistry / Router / SafetyGate / RecoveryManager / ContextStore / Scheduler，
//! 外部协作方（确认、修复提议、长期记忆）由调用方注入；run_goal 分解目标、构建计划并运行到终态。

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::config::AppConfig;
use crate::core::{FixProposer, PlanError, PlanReport, RecoveryManager, RecoveryPolicy, StopSignal};
use crate::memory::{ContextStore, InMemoryLongTerm, LongTermMemory, NoopLongTerm};
use crate::plan::{Decomposer, PlanBuilder, StepProposal};
use crate::safety::{Confirmer, RiskClassifier, SafetyGate};
use crate::scheduler::{Scheduler, SchedulerConfig};
use crate::tools::{EchoTool, ReadFileTool, ShellTool, ToolRegistry, ToolRouter, WriteFileTool};

/// 外部协作方
pub struct Collaborators {
    pub confirmer: Arc<dyn Confirmer>,
    pub fix_proposer: Arc<dyn FixProposer>,
    /// None 时按 [memory] 配置决定用进程内记忆还是关闭
    pub memory: Option<Arc<dyn LongTermMemory>>,
}

/// 装配好的组件，可跨多个计划复用（同一时间只运行一个计划）
pub struct AgentComponents {
    pub registry: Arc<ToolRegistry>,
    pub context: Arc<ContextStore>,
    pub gate: Arc<SafetyGate>,
    pub recovery: Arc<RecoveryManager>,
    pub scheduler: Arc<Scheduler>,
    pub stop: StopSignal,
}

/// 内置工具：echo、read_file、write_file、shell，全部限定在 workspace 内
pub fn default_registry(cfg: &AppConfig, workspace: &Path) -> ToolRegistry {
    let mut tools = ToolRegistry::new();
    tools.register(EchoTool);
    tools.register(ReadFileTool::new(workspace));
    tools.register(WriteFileTool::new(workspace));
    tools.register(
        ShellTool::new(cfg.tools.shell.allowed_commands.clone()).with_working_dir(workspace),
    );
    tools
}

/// 按配置与给定工具表装配组件
pub fn create_agent_components(
    cfg: &AppConfig,
    registry: ToolRegistry,
    collaborators: Collaborators,
) -> AgentComponents {
    let registry = Arc::new(registry);
    let stop = StopSignal::new();
    let context = Arc::new(ContextStore::new(cfg.context.budget_tokens));

    let classifier = RiskClassifier::default()
        .with_overrides(cfg.safety.parsed_overrides())
        .with_patterns(
            &cfg.safety.critical_patterns,
            &cfg.safety.high_patterns,
            &cfg.safety.medium_patterns,
        );
    let gate = Arc::new(SafetyGate::new(
        classifier,
        collaborators.confirmer,
        Duration::from_secs(cfg.safety.confirmation_timeout_secs),
        stop.clone(),
        Arc::clone(&context),
    ));

    let memory: Arc<dyn LongTermMemory> = match collaborators.memory {
        Some(memory) => memory,
        None if cfg.memory.enabled => Arc::new(InMemoryLongTerm::new(cfg.memory.max_entries)),
        None => Arc::new(NoopLongTerm),
    };
    let recovery = Arc::new(RecoveryManager::new(
        RecoveryPolicy::from(&cfg.recovery),
        collaborators.fix_proposer,
        memory,
        Arc::clone(&registry),
    ));

    let scheduler = Arc::new(Scheduler::new(
        SchedulerConfig::from(&cfg.scheduler),
        Arc::new(ToolRouter::new(Arc::clone(&registry))),
        Arc::clone(&gate),
        Arc::clone(&recovery),
        Arc::clone(&context),
        stop.clone(),
    ));

    tracing::info!(
        tools = registry.len(),
        max_concurrent = cfg.scheduler.max_concurrent,
        max_retries = cfg.recovery.max_retries,
        "agent components ready"
    );

    AgentComponents {
        registry,
        context,
        gate,
        recovery,
        scheduler,
        stop,
    }
}

impl AgentComponents {
    /// 目标 → 计划 → 执行；分解或校验失败时不执行任何步骤
    pub async fn run_goal(
        &self,
        decomposer: Arc<dyn Decomposer>,
        goal: &str,
    ) -> Result<PlanReport, PlanError> {
        let plan = PlanBuilder::new(decomposer).build(goal).await?;
        Ok(self.scheduler.run(Arc::new(plan)).await)
    }

    /// 直接运行给定的步骤提案（如 --plan 文件）
    pub async fn run_proposals(
        &self,
        goal: &str,
        proposals: Vec<StepProposal>,
    ) -> Result<PlanReport, PlanError> {
        let plan = PlanBuilder::from_proposals(goal, proposals)?;
        Ok(self.scheduler.run(Arc::new(plan)).await)
    }

    /// 紧急停止；只有第一次调用生效
    pub fn emergency_stop(&self, reason: impl Into<String>) -> bool {
        self.gate.emergency_stop(reason)
    }
}

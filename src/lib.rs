//! Taskforge - 自主任务编排器
//!
//! 模块划分：
//! - **plan**: 目标分解、依赖 DAG 校验、步骤状态机、修复链插入
//! - **tools**: 工具注册表、路由打分、带超时与审计的执行器、内置工具
//! - **safety**: 风险分级、授权策略、人工确认协作方、紧急停止
//! - **scheduler**: 协调者循环 + 有界并发 worker
//! - **core**: 错误分类、恢复管理（重试 / 修复 / 回滚）、停止信号、终态报告
//! - **memory**: 带预算与自动摘要的上下文存储、长期记忆
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **agent**: 按配置装配组件并运行单个目标

pub mod agent;
pub mod config;
pub mod core;
pub mod memory;
pub mod observability;
pub mod plan;
pub mod safety;
pub mod scheduler;
pub mod tools;

pub use agent::{create_agent_components, default_registry, AgentComponents, Collaborators};
pub use core::{PlanReport, StepError, StopSignal};
pub use plan::{ExecutionPlan, PlanBuilder};
pub use scheduler::{Scheduler, SchedulerConfig};

//! 计划图
//!
//! 步骤依赖 DAG、状态机、构建与校验，以及运行期唯一可变的执行计划。

pub mod builder;
pub mod complexity;
pub mod decomposer;
pub mod execution;
pub mod graph;
pub mod types;

pub use builder::PlanBuilder;
pub use complexity::{estimate_complexity, ComplexityScore};
pub use decomposer::{
    parse_step_proposals, Decomposer, LineDecomposer, StaticDecomposer, StepProposal,
};
pub use execution::{aggregate_status, recovered_steps, ExecutionPlan};
pub use graph::{validate_acyclic, DependencyGraph};
pub use types::*;

//! 目标分解能力
//!
//! Decomposer 是不透明的外部能力（通常由 LLM 提供）：propose(goal) 返回有序的步骤提案。
//! parse_step_proposals 从文本中提取 JSON 数组（```json ... ``` 或纯 JSON），便于接入文本型后端。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::PlanError;
use crate::tools::Capability;

/// 分解能力产出的单个步骤提案
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StepProposal {
    /// 可选的显式 ID；缺省时按位置生成 step-N
    pub id: Option<String>,
    pub description: String,
    /// 显式依赖提示；所有提案都省略时退化为顺序链
    pub depends_on: Option<Vec<String>>,
    pub priority: Option<i32>,
    pub capability: Option<Capability>,
    /// 建议使用的工具名
    pub tool: Option<String>,
    pub params: Value,
    /// critical 级操作必须提供的理由
    pub justification: Option<String>,
}

impl StepProposal {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            ..Self::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = Some(deps.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_capability(mut self, capability: Capability) -> Self {
        self.capability = Some(capability);
        self
    }

    pub fn with_tool(mut self, tool: impl Into<String>, params: Value) -> Self {
        self.tool = Some(tool.into());
        self.params = params;
        self
    }

    pub fn with_justification(mut self, justification: impl Into<String>) -> Self {
        self.justification = Some(justification.into());
        self
    }
}

/// 目标分解能力 trait
#[async_trait]
pub trait Decomposer: Send + Sync {
    /// 将目标拆分为有序步骤提案；失败视为计划构建的致命错误
    async fn propose(&self, goal: &str) -> Result<Vec<StepProposal>, PlanError>;
}

/// 从文本中解析步骤提案数组
pub fn parse_step_proposals(output: &str) -> Result<Vec<StepProposal>, PlanError> {
    let trimmed = output.trim();

    let json_str = if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        rest.find("```")
            .map(|end| rest[..end].trim())
            .unwrap_or(rest.trim())
    } else if let (Some(start), Some(end)) = (trimmed.find('['), trimmed.rfind(']')) {
        &trimmed[start..=end]
    } else {
        return Err(PlanError::DecompositionFailed(
            "no JSON array in decomposition output".to_string(),
        ));
    };

    serde_json::from_str(json_str)
        .map_err(|e| PlanError::DecompositionFailed(format!("{}: {}", e, json_str)))
}

/// 按行 / 分号切分目标，每段一个步骤（无依赖提示 → 顺序链）
#[derive(Debug, Default)]
pub struct LineDecomposer;

#[async_trait]
impl Decomposer for LineDecomposer {
    async fn propose(&self, goal: &str) -> Result<Vec<StepProposal>, PlanError> {
        let steps: Vec<StepProposal> = goal
            .split(['\n', ';'])
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(StepProposal::new)
            .collect();
        if steps.is_empty() {
            return Err(PlanError::DecompositionFailed("empty goal".to_string()));
        }
        Ok(steps)
    }
}

/// 返回预先给定的提案（来自计划文件或测试）
#[derive(Debug, Clone)]
pub struct StaticDecomposer {
    proposals: Vec<StepProposal>,
}

impl StaticDecomposer {
    pub fn new(proposals: Vec<StepProposal>) -> Self {
        Self { proposals }
    }

    /// 从 JSON 文本构造（计划文件）
    pub fn from_json(text: &str) -> Result<Self, PlanError> {
        parse_step_proposals(text).map(Self::new)
    }
}

#[async_trait]
impl Decomposer for StaticDecomposer {
    async fn propose(&self, _goal: &str) -> Result<Vec<StepProposal>, PlanError> {
        Ok(self.proposals.clone())
    }
}

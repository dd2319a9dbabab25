//! 工具路由
//!
//! 对候选工具做确定性打分（能力匹配、名称提示、关键词重合、成本、历史失败率），
//! 得分最高者优先，同分按声明顺序；校验失败直接换下一个候选，全部失败即 NoViableTool。

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use serde_json::Value;

use crate::core::StepError;
use crate::plan::TaskStep;
use crate::safety::EffectClass;
use crate::tools::registry::{Capability, Tool, ToolRegistry, ValidationResult};

const CAPABILITY_WEIGHT: f64 = 10.0;
const HINT_WEIGHT: f64 = 20.0;
const KEYWORD_WEIGHT: f64 = 1.0;
const COST_WEIGHT: f64 = 0.1;
const FAILURE_WEIGHT: f64 = 5.0;

/// 路由结果：已通过校验的工具绑定
#[derive(Clone)]
pub struct BoundTool {
    pub tool: Arc<dyn Tool>,
    pub params: Value,
    pub score: f64,
    pub estimated_cost: f64,
    pub effect_class: EffectClass,
}

impl BoundTool {
    pub fn name(&self) -> &str {
        self.tool.name()
    }
}

impl std::fmt::Debug for BoundTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundTool")
            .field("tool", &self.tool.name())
            .field("score", &self.score)
            .field("estimated_cost", &self.estimated_cost)
            .field("effect_class", &self.effect_class)
            .finish()
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct UsageStats {
    attempts: u32,
    failures: u32,
}

impl UsageStats {
    fn failure_rate(&self) -> f64 {
        if self.attempts == 0 {
            0.0
        } else {
            f64::from(self.failures) / f64::from(self.attempts)
        }
    }
}

/// 工具路由器
pub struct ToolRouter {
    registry: Arc<ToolRegistry>,
    /// (工具名, 步骤能力类别) → 执行统计
    stats: RwLock<HashMap<(String, Capability), UsageStats>>,
}

impl ToolRouter {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self {
            registry,
            stats: RwLock::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// 以注册表全部工具为候选进行路由
    pub fn route_step(&self, step: &TaskStep) -> Result<BoundTool, StepError> {
        self.route(step, self.registry.tools())
    }

    /// 在给定候选中为步骤选择工具
    pub fn route(
        &self,
        step: &TaskStep,
        candidates: &[Arc<dyn Tool>],
    ) -> Result<BoundTool, StepError> {
        let mut ranked: Vec<(f64, Arc<dyn Tool>)> = candidates
            .iter()
            .filter_map(|tool| self.score(step, tool.as_ref()).map(|s| (s, Arc::clone(tool))))
            .collect();
        // 稳定排序：同分保持声明顺序
        ranked.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

        let Some((_, primary)) = ranked.first().cloned() else {
            tracing::warn!(step_id = %step.id, "no candidate tool matches step");
            return Err(StepError::NoViableTool(format!(
                "no tool matches step '{}'",
                step.id
            )));
        };

        // 尝试顺序：首选 → 同能力的替代工具 → 其余按得分
        let mut order: Vec<Arc<dyn Tool>> = vec![Arc::clone(&primary)];
        for alt in self.alternatives(primary.name()) {
            if candidates.iter().any(|c| c.name() == alt.name()) {
                order.push(alt);
            }
        }
        for (_, tool) in &ranked {
            if !order.iter().any(|t| t.name() == tool.name()) {
                order.push(Arc::clone(tool));
            }
        }

        let mut rejections = Vec::new();
        for tool in order {
            let validation = self.validate(tool.as_ref(), &step.params);
            if !validation.valid {
                let reason = validation.reason.unwrap_or_else(|| "invalid parameters".into());
                tracing::debug!(step_id = %step.id, tool = %tool.name(), reason = %reason, "tool rejected by validation");
                rejections.push(format!("{}: {}", tool.name(), reason));
                continue;
            }
            let score = self.score(step, tool.as_ref()).unwrap_or_default();
            let bound = BoundTool {
                effect_class: tool.effect_class(&step.params),
                estimated_cost: tool.estimate_cost(&step.params),
                params: step.params.clone(),
                score,
                tool,
            };
            tracing::info!(
                step_id = %step.id,
                tool = %bound.name(),
                score = bound.score,
                "step routed"
            );
            return Ok(bound);
        }

        Err(StepError::NoViableTool(format!(
            "all candidates failed validation for step '{}': {}",
            step.id,
            rejections.join("; ")
        )))
    }

    /// 参数校验（在构造 Action 之前必须通过）
    pub fn validate(&self, tool: &dyn Tool, params: &Value) -> ValidationResult {
        tool.validate_params(params)
    }

    /// 同能力类别的替代工具（声明顺序）
    pub fn alternatives(&self, tool: &str) -> Vec<Arc<dyn Tool>> {
        self.registry.alternatives(tool)
    }

    /// 记录一次执行结果，影响后续路由的失败率惩罚
    pub fn record_outcome(&self, tool: &str, class: Capability, success: bool) {
        let mut stats = self.stats.write().unwrap_or_else(PoisonError::into_inner);
        let entry = stats.entry((tool.to_string(), class)).or_default();
        entry.attempts += 1;
        if !success {
            entry.failures += 1;
        }
    }

    pub fn failure_rate(&self, tool: &str, class: Capability) -> f64 {
        let stats = self.stats.read().unwrap_or_else(PoisonError::into_inner);
        stats
            .get(&(tool.to_string(), class))
            .map_or(0.0, UsageStats::failure_rate)
    }

    /// 打分；没有任何匹配信号（能力 / 名称 / 关键词）时返回 None
    fn score(&self, step: &TaskStep, tool: &dyn Tool) -> Option<f64> {
        let mut signal = false;
        let mut score = 0.0;

        if step.capability == Some(tool.capability()) {
            score += CAPABILITY_WEIGHT;
            signal = true;
        }
        if step.tool_hint.as_deref() == Some(tool.name()) {
            score += HINT_WEIGHT;
            signal = true;
        }
        let overlap = keyword_overlap(&step.description, tool);
        if overlap > 0 {
            score += KEYWORD_WEIGHT * overlap as f64;
            signal = true;
        }
        if !signal {
            return None;
        }

        score -= COST_WEIGHT * tool.estimate_cost(&step.params);
        let class = step.capability.unwrap_or_else(|| tool.capability());
        score -= FAILURE_WEIGHT * self.failure_rate(tool.name(), class);
        Some(score)
    }
}

fn keyword_overlap(description: &str, tool: &dyn Tool) -> usize {
    let haystack = format!(
        "{} {}",
        tool.name().replace('_', " "),
        tool.description()
    )
    .to_lowercase();
    let tool_words: Vec<&str> = haystack
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 2)
        .collect();

    let mut seen: Vec<String> = Vec::new();
    for word in description
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 2)
    {
        if tool_words.contains(&word) && !seen.iter().any(|s| s == word) {
            seen.push(word.to_string());
        }
    }
    seen.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::registry::{ToolFailure, ToolOutput};
    use async_trait::async_trait;

    struct Stub {
        name: &'static str,
        description: &'static str,
        capability: Capability,
        required: &'static [&'static str],
    }

    #[async_trait]
    impl Tool for Stub {
        fn name(&self) -> &str {
            self.name
        }
        fn description(&self) -> &str {
            self.description
        }
        fn capability(&self) -> Capability {
            self.capability
        }
        fn parameters_schema(&self) -> Value {
            serde_json::json!({"type": "object", "required": self.required})
        }
        async fn invoke(&self, _params: Value) -> Result<ToolOutput, ToolFailure> {
            Ok(ToolOutput::text("ok"))
        }
    }

    fn stub(name: &'static str, capability: Capability, required: &'static [&'static str]) -> Stub {
        Stub {
            name,
            description: "generic tool",
            capability,
            required,
        }
    }

    fn router(tools: Vec<Stub>) -> ToolRouter {
        let mut registry = ToolRegistry::new();
        for t in tools {
            registry.register(t);
        }
        ToolRouter::new(Arc::new(registry))
    }

    fn step_with(capability: Capability) -> TaskStep {
        let mut step = TaskStep::new("s1", "do something");
        step.capability = Some(capability);
        step
    }

    #[test]
    fn test_tie_broken_by_declaration_order() {
        let r = router(vec![
            stub("first", Capability::FileRead, &[]),
            stub("second", Capability::FileRead, &[]),
        ]);
        let bound = r.route_step(&step_with(Capability::FileRead)).unwrap();
        assert_eq!(bound.name(), "first");
    }

    #[test]
    fn test_hint_beats_capability() {
        let r = router(vec![
            stub("first", Capability::FileRead, &[]),
            stub("second", Capability::FileRead, &[]),
        ]);
        let mut step = step_with(Capability::FileRead);
        step.tool_hint = Some("second".into());
        assert_eq!(r.route_step(&step).unwrap().name(), "second");
    }

    #[test]
    fn test_validation_failure_falls_through_to_alternative() {
        let r = router(vec![
            stub("strict", Capability::FileRead, &["path"]),
            stub("lenient", Capability::FileRead, &[]),
        ]);
        let mut step = step_with(Capability::FileRead);
        step.tool_hint = Some("strict".into());
        assert_eq!(r.route_step(&step).unwrap().name(), "lenient");
    }

    #[test]
    fn test_all_invalid_is_no_viable_tool() {
        let r = router(vec![
            stub("a", Capability::FileRead, &["path"]),
            stub("b", Capability::FileRead, &["path"]),
        ]);
        let err = r.route_step(&step_with(Capability::FileRead)).unwrap_err();
        assert!(matches!(err, StepError::NoViableTool(_)));
    }

    #[test]
    fn test_no_signal_is_no_viable_tool() {
        let r = router(vec![stub("a", Capability::Cloud, &[])]);
        let step = TaskStep::new("s1", "zzz");
        assert!(matches!(r.route_step(&step), Err(StepError::NoViableTool(_))));
    }

    #[test]
    fn test_failure_rate_demotes_tool() {
        let r = router(vec![
            stub("flaky", Capability::Data, &[]),
            stub("steady", Capability::Data, &[]),
        ]);
        let step = step_with(Capability::Data);
        assert_eq!(r.route_step(&step).unwrap().name(), "flaky");

        r.record_outcome("flaky", Capability::Data, false);
        assert_eq!(r.failure_rate("flaky", Capability::Data), 1.0);
        assert_eq!(r.route_step(&step).unwrap().name(), "steady");
    }

    #[test]
    fn test_keyword_overlap_routes_plain_text() {
        let r = router(vec![
            Stub {
                name: "echo",
                description: "Echo the input text back",
                capability: Capability::Core,
                required: &[],
            },
            Stub {
                name: "read_file",
                description: "Read file contents",
                capability: Capability::FileRead,
                required: &[],
            },
        ]);
        let step = TaskStep::new("s1", "read the config file");
        assert_eq!(r.route_step(&step).unwrap().name(), "read_file");
    }
}

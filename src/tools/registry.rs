//! 工具注册表
//!
//! 所有工具实现 Tool trait（name / capability / validate_params / estimate_cost / invoke / revert），
//! 由 ToolRegistry 按名注册与查找；注册顺序即候选的声明顺序（路由打分相同时按此顺序决胜）。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::ToolErrorKind;
use crate::safety::EffectClass;

/// 工具能力类别（封闭集合，新工具通过注册新实现加入）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Core,
    Shell,
    FileRead,
    FileWrite,
    VersionControl,
    WebResearch,
    Cloud,
    Data,
    Communication,
    Debugging,
}

impl Capability {
    /// 基础耗时估算（秒）
    pub fn base_cost(self) -> f64 {
        match self {
            Capability::Core | Capability::FileRead | Capability::FileWrite => 1.0,
            Capability::Shell => 2.0,
            Capability::VersionControl => 3.0,
            Capability::WebResearch | Capability::Communication | Capability::Debugging => 5.0,
            Capability::Data => 10.0,
            Capability::Cloud => 30.0,
        }
    }

    /// 未声明时的默认效果类别
    pub fn default_effect(self) -> EffectClass {
        match self {
            Capability::Core | Capability::FileRead | Capability::Debugging => {
                EffectClass::ReadOnly
            }
            Capability::WebResearch => EffectClass::NetworkEgress,
            Capability::FileWrite | Capability::VersionControl | Capability::Data => {
                EffectClass::LocalWrite
            }
            Capability::Shell => EffectClass::ProcessSpawn,
            Capability::Cloud | Capability::Communication => EffectClass::RemoteWrite,
        }
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Capability::Core => "core",
            Capability::Shell => "shell",
            Capability::FileRead => "file_read",
            Capability::FileWrite => "file_write",
            Capability::VersionControl => "version_control",
            Capability::WebResearch => "web_research",
            Capability::Cloud => "cloud",
            Capability::Data => "data",
            Capability::Communication => "communication",
            Capability::Debugging => "debugging",
        };
        write!(f, "{name}")
    }
}

/// 参数校验结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationResult {
    pub valid: bool,
    pub reason: Option<String>,
}

impl ValidationResult {
    pub fn ok() -> Self {
        Self {
            valid: true,
            reason: None,
        }
    }

    pub fn reject(reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            reason: Some(reason.into()),
        }
    }
}

/// 调用成功：输出文本，以及可回滚的副作用描述
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    pub output: String,
    pub effect: Option<Value>,
}

impl ToolOutput {
    pub fn text(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            effect: None,
        }
    }

    pub fn with_effect(mut self, effect: Value) -> Self {
        self.effect = Some(effect);
        self
    }
}

/// 调用失败：类别、消息，以及失败前已部分生效的副作用
#[derive(Debug, Clone, PartialEq)]
pub struct ToolFailure {
    pub kind: ToolErrorKind,
    pub message: String,
    pub partial_effect: Option<Value>,
}

impl ToolFailure {
    pub fn new(kind: ToolErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            partial_effect: None,
        }
    }

    pub fn with_partial_effect(mut self, effect: Value) -> Self {
        self.partial_effect = Some(effect);
        self
    }
}

/// 工具 trait：统一的 invoke / validate 契约
#[async_trait]
pub trait Tool: Send + Sync {
    /// 工具名称（步骤 tool 提示匹配此名）
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    fn capability(&self) -> Capability;

    /// 本次调用的效果类别；默认取能力类别的默认值，可按参数细化（如 shell 命令）
    fn effect_class(&self, _params: &Value) -> EffectClass {
        self.capability().default_effect()
    }

    /// 参数 JSON Schema；`required` 字段被默认校验使用
    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    /// 参数校验；默认检查 schema 中的必填字段
    fn validate_params(&self, params: &Value) -> ValidationResult {
        let schema = self.parameters_schema();
        let required = schema
            .get("required")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for field in required.iter().filter_map(Value::as_str) {
            if params.get(field).map_or(true, Value::is_null) {
                return ValidationResult::reject(format!("missing required parameter '{field}'"));
            }
        }
        ValidationResult::ok()
    }

    /// 估算成本（秒）；参数中的 timeout 会抬高估算
    fn estimate_cost(&self, params: &Value) -> f64 {
        let base = self.capability().base_cost();
        params
            .get("timeout")
            .and_then(Value::as_f64)
            .map_or(base, |t| base.max(t))
    }

    /// 可展示的命令文本（用于风险模式匹配与确认提示）
    fn command_preview(&self, _params: &Value) -> Option<String> {
        None
    }

    async fn invoke(&self, params: Value) -> Result<ToolOutput, ToolFailure>;

    /// 副作用的逆操作；默认不可逆
    async fn revert(&self, _effect: &Value) -> Result<(), String> {
        Err(format!("tool '{}' has no inverse operation", self.name()))
    }
}

/// 工具注册表：按注册顺序保存 Arc<dyn Tool>
#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
    index: HashMap<String, usize>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册工具；同名工具替换原实现但保留原声明位置
    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.register_arc(Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        match self.index.get(&name) {
            Some(&pos) => self.tools[pos] = tool,
            None => {
                self.index.insert(name, self.tools.len());
                self.tools.push(tool);
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.index.get(name).map(|&pos| Arc::clone(&self.tools[pos]))
    }

    /// 按声明顺序的全部工具
    pub fn tools(&self) -> &[Arc<dyn Tool>] {
        &self.tools
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.tools.iter().map(|t| t.name().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// 同能力类别的其他工具（声明顺序）
    pub fn alternatives(&self, tool: &str) -> Vec<Arc<dyn Tool>> {
        let Some(primary) = self.get(tool) else {
            return Vec::new();
        };
        let capability = primary.capability();
        self.tools
            .iter()
            .filter(|t| t.name() != tool && t.capability() == capability)
            .cloned()
            .collect()
    }

    /// 工具清单 JSON（供分解能力了解可用工具）
    pub fn to_schema_json(&self) -> String {
        let tools: Vec<Value> = self
            .tools
            .iter()
            .map(|tool| {
                serde_json::json!({
                    "name": tool.name(),
                    "description": tool.description(),
                    "capability": tool.capability(),
                    "parameters": tool.parameters_schema()
                })
            })
            .collect();
        serde_json::to_string_pretty(&tools).unwrap_or_else(|_| "[]".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed {
        name: &'static str,
        capability: Capability,
    }

    #[async_trait]
    impl Tool for Fixed {
        fn name(&self) -> &str {
            self.name
        }
        fn description(&self) -> &str {
            "fixed"
        }
        fn capability(&self) -> Capability {
            self.capability
        }
        fn parameters_schema(&self) -> Value {
            serde_json::json!({"type": "object", "required": ["path"]})
        }
        async fn invoke(&self, _params: Value) -> Result<ToolOutput, ToolFailure> {
            Ok(ToolOutput::text(self.name))
        }
    }

    fn registry() -> ToolRegistry {
        let mut r = ToolRegistry::new();
        r.register(Fixed { name: "a", capability: Capability::FileRead });
        r.register(Fixed { name: "b", capability: Capability::Shell });
        r.register(Fixed { name: "c", capability: Capability::FileRead });
        r.register(Fixed { name: "d", capability: Capability::FileRead });
        r
    }

    #[test]
    fn test_alternatives_same_capability_in_order() {
        let r = registry();
        let names: Vec<_> = r.alternatives("a").iter().map(|t| t.name().to_string()).collect();
        assert_eq!(names, vec!["c", "d"]);
        assert!(r.alternatives("b").is_empty());
        assert!(r.alternatives("ghost").is_empty());
    }

    #[test]
    fn test_reregister_keeps_position() {
        let mut r = registry();
        r.register(Fixed { name: "a", capability: Capability::FileRead });
        assert_eq!(r.tool_names(), vec!["a", "b", "c", "d"]);
        assert_eq!(r.len(), 4);
    }

    #[test]
    fn test_default_validation_and_cost() {
        let r = registry();
        let tool = r.get("a").unwrap();
        assert!(!tool.validate_params(&serde_json::json!({})).valid);
        assert!(tool.validate_params(&serde_json::json!({"path": "x"})).valid);
        assert_eq!(tool.estimate_cost(&serde_json::json!({})), 1.0);
        assert_eq!(tool.estimate_cost(&serde_json::json!({"timeout": 12})), 12.0);
        assert_eq!(tool.effect_class(&Value::Null), EffectClass::ReadOnly);
    }
}

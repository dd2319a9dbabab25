//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `TASKFORGE__*` 覆盖（双下划线表示嵌套，如 `TASKFORGE__SCHEDULER__MAX_CONCURRENT=8`）。
//! 退避上限、重试次数、并发上限、各类超时都是配置项，不写死在代码里。

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::core::RecoveryPolicy;
use crate::safety::{EffectClass, RiskLevel};
use crate::scheduler::SchedulerConfig;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub scheduler: SchedulerSection,
    pub recovery: RecoverySection,
    pub safety: SafetySection,
    pub context: ContextSection,
    pub tools: ToolsSection,
    pub memory: MemorySection,
}

/// [scheduler] 段：并发上限、单步超时、重型步骤限流
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    pub max_concurrent: usize,
    /// 单次工具调用超时（秒）
    pub step_timeout_secs: u64,
    pub heavy_step_threshold: f64,
    pub max_heavy_in_flight: usize,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            step_timeout_secs: 300,
            heavy_step_threshold: 7.0,
            max_heavy_in_flight: 2,
        }
    }
}

impl From<&SchedulerSection> for SchedulerConfig {
    fn from(section: &SchedulerSection) -> Self {
        Self {
            max_concurrent: section.max_concurrent.max(1),
            step_timeout: Duration::from_secs(section.step_timeout_secs),
            heavy_step_threshold: section.heavy_step_threshold,
            max_heavy_in_flight: section.max_heavy_in_flight.max(1),
        }
    }
}

/// [recovery] 段：重试、退避、修复链深度与提案超时、长期记忆检索
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecoverySection {
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub max_fix_depth: u32,
    pub memory_top_k: usize,
    pub learn_timeout_ms: u64,
    pub fix_timeout_ms: u64,
}

impl Default for RecoverySection {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base_ms: 1000,
            backoff_max_ms: 30_000,
            max_fix_depth: 1,
            memory_top_k: 3,
            learn_timeout_ms: 2000,
            fix_timeout_ms: 30_000,
        }
    }
}

impl From<&RecoverySection> for RecoveryPolicy {
    fn from(section: &RecoverySection) -> Self {
        Self {
            max_retries: section.max_retries,
            backoff_base: Duration::from_millis(section.backoff_base_ms),
            backoff_max: Duration::from_millis(section.backoff_max_ms),
            max_fix_depth: section.max_fix_depth,
            memory_top_k: section.memory_top_k,
            learn_timeout: Duration::from_millis(section.learn_timeout_ms),
            fix_timeout: Duration::from_millis(section.fix_timeout_ms),
        }
    }
}

/// [safety] 段：人工确认超时、效果类别的风险覆盖、额外的命令提级模式
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SafetySection {
    pub confirmation_timeout_secs: u64,
    /// 效果类别（如 `process-spawn`）→ 风险等级（如 `high`）
    pub risk_overrides: HashMap<String, String>,
    pub critical_patterns: Vec<String>,
    pub high_patterns: Vec<String>,
    pub medium_patterns: Vec<String>,
}

impl Default for SafetySection {
    fn default() -> Self {
        Self {
            confirmation_timeout_secs: 60,
            risk_overrides: HashMap::new(),
            critical_patterns: Vec::new(),
            high_patterns: Vec::new(),
            medium_patterns: Vec::new(),
        }
    }
}

impl SafetySection {
    /// 解析 risk_overrides；无法识别的键或值跳过并告警
    pub fn parsed_overrides(&self) -> HashMap<EffectClass, RiskLevel> {
        let mut parsed = HashMap::new();
        for (class, level) in &self.risk_overrides {
            let class_value = serde_json::Value::String(class.to_lowercase());
            let level_value = serde_json::Value::String(level.to_lowercase());
            match (
                serde_json::from_value::<EffectClass>(class_value),
                serde_json::from_value::<RiskLevel>(level_value),
            ) {
                (Ok(class), Ok(level)) => {
                    parsed.insert(class, level);
                }
                _ => tracing::warn!(effect_class = %class, risk = %level, "ignoring invalid risk override"),
            }
        }
        parsed
    }
}

/// [context] 段：上下文预算（估算 token）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ContextSection {
    pub budget_tokens: usize,
}

impl Default for ContextSection {
    fn default() -> Self {
        Self {
            budget_tokens: 100_000,
        }
    }
}

/// [tools] 段：文件工具的沙箱根、Shell 白名单
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ToolsSection {
    /// 未设置时用 ./workspace
    pub workspace_root: Option<PathBuf>,
    pub shell: ShellSection,
}

impl ToolsSection {
    pub fn workspace_root(&self) -> PathBuf {
        self.workspace_root
            .clone()
            .unwrap_or_else(|| PathBuf::from("workspace"))
    }
}

/// [tools.shell] 段：允许执行的命令名（仅首词，如 ls、grep、cargo）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ShellSection {
    pub allowed_commands: Vec<String>,
}

impl Default for ShellSection {
    fn default() -> Self {
        Self {
            allowed_commands: default_allowed_commands(),
        }
    }
}

fn default_allowed_commands() -> Vec<String> {
    ["ls", "grep", "cat", "head", "tail", "wc", "find", "echo", "cargo", "git"]
        .into_iter()
        .map(String::from)
        .collect()
}

/// [memory] 段：进程内长期记忆
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MemorySection {
    pub enabled: bool,
    pub max_entries: usize,
}

impl Default for MemorySection {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: 1000,
        }
    }
}

/// 加载配置，环境变量 TASKFORGE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 TASKFORGE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    for name in ["config/default", "../config/default"] {
        if std::path::Path::new(&format!("{name}.toml")).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path).required(false));
        } else {
            tracing::warn!(path = %path.display(), "config file not found, using defaults");
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("TASKFORGE")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.scheduler.max_concurrent, 4);
        assert_eq!(config.recovery.max_retries, 3);
        assert_eq!(config.recovery.backoff_max_ms, 30_000);
        assert_eq!(config.safety.confirmation_timeout_secs, 60);
        assert_eq!(config.context.budget_tokens, 100_000);
        assert!(config.memory.enabled);
        assert!(config.tools.shell.allowed_commands.contains(&"ls".to_string()));
        assert_eq!(config.tools.workspace_root(), PathBuf::from("workspace"));
    }

    #[test]
    fn test_explicit_file_overrides() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[scheduler]
max_concurrent = 8

[recovery]
backoff_base_ms = 10
backoff_max_ms = 500
fix_timeout_ms = 1500

[safety]
high_patterns = ["terraform apply"]

[safety.risk_overrides]
process-spawn = "high"
bogus = "low"

[tools.shell]
allowed_commands = ["ls"]
"#
        )
        .unwrap();

        let config = load_config(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(config.scheduler.max_concurrent, 8);
        // 未出现的键保持默认
        assert_eq!(config.scheduler.step_timeout_secs, 300);
        assert_eq!(config.tools.shell.allowed_commands, vec!["ls".to_string()]);
        assert_eq!(config.safety.high_patterns, vec!["terraform apply".to_string()]);

        let policy = RecoveryPolicy::from(&config.recovery);
        assert_eq!(policy.backoff_base, Duration::from_millis(10));
        assert_eq!(policy.backoff_max, Duration::from_millis(500));
        assert_eq!(policy.fix_timeout, Duration::from_millis(1500));

        let overrides = config.safety.parsed_overrides();
        assert_eq!(overrides.len(), 1);
        assert_eq!(overrides.get(&EffectClass::ProcessSpawn), Some(&RiskLevel::High));
    }

    #[test]
    fn test_scheduler_section_clamps_zero() {
        let section = SchedulerSection {
            max_concurrent: 0,
            max_heavy_in_flight: 0,
            ..SchedulerSection::default()
        };
        let config = SchedulerConfig::from(&section);
        assert_eq!(config.max_concurrent, 1);
        assert_eq!(config.max_heavy_in_flight, 1);
    }
}

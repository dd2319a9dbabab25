//! Shell 工具：白名单命令，禁止危险操作
//!
//! 仅允许配置中的命令名（首词，如 ls、grep、cargo）；禁止 rm -rf、wget、chmod 777 等子串。
//! 效果类别按命令推断，供安全闸门分级；子进程随调用 future 一起取消（kill_on_drop）。

use std::collections::HashSet;

use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;

use crate::core::ToolErrorKind;
use crate::safety::EffectClass;
use crate::tools::registry::{Capability, Tool, ToolFailure, ToolOutput, ValidationResult};

/// 禁止的命令/子串（即使白名单中有同名，也不允许带这些参数）
const FORBIDDEN_SUBSTR: &[&str] = &[
    "rm -rf /",
    "rm -fr /",
    "wget ",
    "curl | sh",
    "chmod 777",
    "chmod +s",
    "mkfs",
    "dd if=",
    "> /dev/sd",
    ":(){ :|:& };:",
];

/// 效果推断按词匹配：每个子命令（以 ; && || | 换行分隔，去掉前导 sudo）的开头几个词
const INSTALL_MARKERS: &[&[&str]] = &[
    &["pip", "install"],
    &["npm", "install"],
    &["cargo", "install"],
    &["apt", "install"],
    &["apt-get", "install"],
];
const DESTRUCTIVE_MARKERS: &[&[&str]] = &[&["rm"], &["rmdir"], &["git", "reset", "--hard"], &["git", "clean"]];
const REMOTE_MARKERS: &[&[&str]] = &[
    &["git", "push"],
    &["docker", "push"],
    &["kubectl", "apply"],
    &["kubectl", "delete"],
];

/// Shell 工具
pub struct ShellTool {
    allowed_commands: HashSet<String>,
    working_dir: Option<std::path::PathBuf>,
}

impl ShellTool {
    pub fn new(allowed_commands: Vec<String>) -> Self {
        let allowed_commands = allowed_commands
            .into_iter()
            .map(|s| s.to_lowercase())
            .collect();
        Self {
            allowed_commands,
            working_dir: None,
        }
    }

    pub fn with_working_dir(mut self, dir: impl Into<std::path::PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    fn command_name(raw: &str) -> &str {
        raw.split_whitespace().next().unwrap_or("")
    }

    fn is_allowed(&self, raw: &str) -> Result<(), String> {
        let raw_lower = raw.to_lowercase();
        for forbidden in FORBIDDEN_SUBSTR {
            if raw_lower.contains(forbidden) {
                return Err(format!("Forbidden pattern: {}", forbidden));
            }
        }
        let name = Self::command_name(&raw_lower);
        if name.is_empty() {
            return Err("Empty command".to_string());
        }
        if self.allowed_commands.contains(name) {
            return Ok(());
        }
        Err(format!("Command '{}' not in allowlist", name))
    }
}

/// 拆成子命令的词序列
fn subcommands(command: &str) -> Vec<Vec<&str>> {
    command
        .split(|c: char| matches!(c, ';' | '|' | '&' | '\n'))
        .map(|segment| {
            let words: Vec<&str> = segment.split_whitespace().collect();
            let start = words.iter().take_while(|w| **w == "sudo").count();
            words[start..].to_vec()
        })
        .filter(|words| !words.is_empty())
        .collect()
}

fn starts_with_marker(words: &[&str], markers: &[&[&str]]) -> bool {
    markers.iter().any(|marker| words.starts_with(marker))
}

fn command_param(params: &Value) -> &str {
    params
        .get("command")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .trim()
}

#[async_trait]
impl Tool for ShellTool {
    fn name(&self) -> &str {
        "shell"
    }

    fn description(&self) -> &str {
        "Run a whitelisted shell command. Args: {\"command\": \"...\"}"
    }

    fn capability(&self) -> Capability {
        Capability::Shell
    }

    fn effect_class(&self, params: &Value) -> EffectClass {
        let command = command_param(params).to_lowercase();
        let segments = subcommands(&command);
        let has = |markers: &[&[&str]]| segments.iter().any(|words| starts_with_marker(words, markers));
        if has(REMOTE_MARKERS) {
            EffectClass::RemoteWrite
        } else if has(DESTRUCTIVE_MARKERS) {
            EffectClass::DestructiveLocal
        } else if has(INSTALL_MARKERS) {
            EffectClass::PackageInstall
        } else {
            EffectClass::ProcessSpawn
        }
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The shell command to execute (must be in allowlist)"
                }
            },
            "required": ["command"]
        })
    }

    fn validate_params(&self, params: &Value) -> ValidationResult {
        match self.is_allowed(command_param(params)) {
            Ok(()) => ValidationResult::ok(),
            Err(reason) => ValidationResult::reject(reason),
        }
    }

    fn command_preview(&self, params: &Value) -> Option<String> {
        Some(command_param(params).to_string())
    }

    async fn invoke(&self, params: Value) -> Result<ToolOutput, ToolFailure> {
        let command = command_param(&params);
        self.is_allowed(command)
            .map_err(|e| ToolFailure::new(ToolErrorKind::Validation, e))?;

        tracing::info!(command = %command, "shell tool invoke");

        let mut cmd = if cfg!(target_os = "windows") {
            let mut c = Command::new("cmd");
            c.args(["/C", command]);
            c
        } else {
            let mut c = Command::new("sh");
            c.args(["-c", command]);
            c
        };
        cmd.kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        let output = cmd.output().await.map_err(|e| {
            ToolFailure::new(ToolErrorKind::Other("spawn".to_string()), format!("Execution failed: {e}"))
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        if !output.status.success() {
            return Err(ToolFailure::new(
                ToolErrorKind::Other("exit_status".to_string()),
                format!("Exit {:?}\nstderr: {}", output.status.code(), stderr.trim()),
            ));
        }
        Ok(ToolOutput::text(if stderr.is_empty() {
            stdout
        } else {
            format!("{}\nstderr: {}", stdout.trim(), stderr.trim())
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shell() -> ShellTool {
        ShellTool::new(vec!["echo".into(), "git".into(), "pip".into(), "rm".into(), "false".into()])
    }

    #[test]
    fn test_allowlist_validation() {
        let tool = shell();
        assert!(tool.validate_params(&serde_json::json!({"command": "echo hi"})).valid);
        assert!(!tool.validate_params(&serde_json::json!({"command": "curl x"})).valid);
        assert!(!tool.validate_params(&serde_json::json!({"command": "rm -rf /"})).valid);
        assert!(!tool.validate_params(&serde_json::json!({})).valid);
    }

    #[test]
    fn test_effect_class_inference() {
        let tool = shell();
        let effect = |c: &str| tool.effect_class(&serde_json::json!({"command": c}));
        assert_eq!(effect("git push origin main"), EffectClass::RemoteWrite);
        assert_eq!(effect("rm build.log"), EffectClass::DestructiveLocal);
        assert_eq!(effect("pip install requests"), EffectClass::PackageInstall);
        assert_eq!(effect("echo hi"), EffectClass::ProcessSpawn);
    }

    #[test]
    fn test_effect_class_matches_whole_words() {
        let tool = shell();
        let effect = |c: &str| tool.effect_class(&serde_json::json!({"command": c}));
        assert_eq!(effect("grep -n form src/main.rs"), EffectClass::ProcessSpawn);
        assert_eq!(effect("echo transform complete"), EffectClass::ProcessSpawn);
        assert_eq!(effect("echo git push"), EffectClass::ProcessSpawn);
        assert_eq!(effect("rm -rf build"), EffectClass::DestructiveLocal);
        assert_eq!(effect("ls && rm -f out.txt"), EffectClass::DestructiveLocal);
        assert_eq!(effect("sudo apt-get install jq"), EffectClass::PackageInstall);
        assert_eq!(effect("git status; git push"), EffectClass::RemoteWrite);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_invoke_and_exit_failure() {
        let tool = shell();
        let out = tool
            .invoke(serde_json::json!({"command": "echo hello"}))
            .await
            .unwrap();
        assert_eq!(out.output.trim(), "hello");

        let err = tool
            .invoke(serde_json::json!({"command": "false"}))
            .await
            .unwrap_err();
        assert!(!err.kind.is_transient());
    }
}

//! 沙箱文件系统工具
//!
//! SafeFs 绑定 root_dir，所有路径经 resolve 校验必须在 root 下（禁止 ../ 逃逸）；
//! ReadFileTool 只读，WriteFileTool 记录写入前的内容作为副作用，revert 时恢复或删除。

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;

use crate::core::ToolErrorKind;
use crate::safety::EffectClass;
use crate::tools::registry::{Capability, Tool, ToolFailure, ToolOutput, ValidationResult};

/// 沙箱文件系统
#[derive(Debug, Clone)]
pub struct SafeFs {
    root_dir: PathBuf,
}

impl SafeFs {
    pub fn new(root_dir: impl AsRef<Path>) -> Self {
        let root = root_dir.as_ref().to_path_buf();
        let root_dir = root.canonicalize().unwrap_or(root);
        Self { root_dir }
    }

    pub fn root(&self) -> &Path {
        &self.root_dir
    }

    /// 解析相对路径；目标可以尚不存在，但不得逃出根目录
    pub fn resolve(&self, path: &str) -> Result<PathBuf, ToolFailure> {
        let relative = Path::new(path.trim_start_matches("./"));
        if relative.is_absolute()
            || relative
                .components()
                .any(|c| matches!(c, Component::ParentDir))
        {
            return Err(ToolFailure::new(
                ToolErrorKind::Permission,
                format!("Path escapes workspace: {path}"),
            ));
        }
        let full = self.root_dir.join(relative);
        let escape = || {
            ToolFailure::new(
                ToolErrorKind::Permission,
                format!("Path escapes workspace: {path}"),
            )
        };

        let Ok(root) = self.root_dir.canonicalize() else {
            // 根目录尚未创建，其下不可能有符号链接
            return Ok(full);
        };

        // 对最近的已存在祖先做 canonicalize，新建文件也不能借符号链接目录逃逸
        let mut existing = full.as_path();
        let mut missing = Vec::new();
        let canonical = loop {
            match existing.canonicalize() {
                Ok(canonical) => break canonical,
                Err(_) => {
                    // 悬空符号链接：目标不可知，拒绝
                    if existing.symlink_metadata().is_ok() {
                        return Err(escape());
                    }
                    let (Some(parent), Some(name)) = (existing.parent(), existing.file_name()) else {
                        return Err(escape());
                    };
                    missing.push(name.to_os_string());
                    existing = parent;
                }
            }
        };
        if !canonical.starts_with(&root) {
            return Err(escape());
        }
        Ok(missing.into_iter().rev().fold(canonical, |acc, name| acc.join(name)))
    }

    pub async fn read_file(&self, path: &str) -> Result<String, ToolFailure> {
        let resolved = self.resolve(path)?;
        tokio::fs::read_to_string(&resolved)
            .await
            .map_err(|e| io_failure("Read failed", e))
    }

    /// 写入文件，返回写入前的内容（None 表示文件原本不存在）
    pub async fn write_file(&self, path: &str, content: &str) -> Result<Option<String>, ToolFailure> {
        let resolved = self.resolve(path)?;
        let previous = match tokio::fs::read_to_string(&resolved).await {
            Ok(text) => Some(text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(io_failure("Read before write failed", e)),
        };
        if let Some(parent) = resolved.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_failure("Create dir failed", e))?;
        }
        tokio::fs::write(&resolved, content)
            .await
            .map_err(|e| io_failure("Write failed", e))?;
        Ok(previous)
    }
}

fn io_failure(context: &str, e: std::io::Error) -> ToolFailure {
    let kind = match e.kind() {
        std::io::ErrorKind::NotFound => ToolErrorKind::NotFound,
        std::io::ErrorKind::PermissionDenied => ToolErrorKind::Permission,
        std::io::ErrorKind::TimedOut => ToolErrorKind::Timeout,
        _ => ToolErrorKind::Other("io".to_string()),
    };
    ToolFailure::new(kind, format!("{context}: {e}"))
}

fn path_param(params: &Value) -> &str {
    params.get("path").and_then(|v| v.as_str()).unwrap_or("")
}

/// 读取文件内容
pub struct ReadFileTool {
    fs: SafeFs,
}

impl ReadFileTool {
    pub fn new(root_dir: impl AsRef<Path>) -> Self {
        Self {
            fs: SafeFs::new(root_dir),
        }
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read file contents. Args: {\"path\": \"file path relative to workspace\"}"
    }

    fn capability(&self) -> Capability {
        Capability::FileRead
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "File path relative to workspace"}
            },
            "required": ["path"]
        })
    }

    fn validate_params(&self, params: &Value) -> ValidationResult {
        match self.fs.resolve(path_param(params)) {
            Ok(_) if !path_param(params).is_empty() => ValidationResult::ok(),
            Ok(_) => ValidationResult::reject("missing required parameter 'path'"),
            Err(e) => ValidationResult::reject(e.message),
        }
    }

    async fn invoke(&self, params: Value) -> Result<ToolOutput, ToolFailure> {
        let path = path_param(&params);
        tracing::info!(path = %path, "read_file tool invoke");
        self.fs.read_file(path).await.map(ToolOutput::text)
    }
}

/// 写入文件（可回滚）
pub struct WriteFileTool {
    fs: SafeFs,
}

impl WriteFileTool {
    pub fn new(root_dir: impl AsRef<Path>) -> Self {
        Self {
            fs: SafeFs::new(root_dir),
        }
    }
}

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write content to a file, creating it if needed. Args: {\"path\": \"...\", \"content\": \"...\"}"
    }

    fn capability(&self) -> Capability {
        Capability::FileWrite
    }

    fn effect_class(&self, _params: &Value) -> EffectClass {
        EffectClass::LocalWrite
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {"type": "string"},
                "content": {"type": "string"}
            },
            "required": ["path", "content"]
        })
    }

    fn validate_params(&self, params: &Value) -> ValidationResult {
        if path_param(params).is_empty() {
            return ValidationResult::reject("missing required parameter 'path'");
        }
        if params.get("content").and_then(Value::as_str).is_none() {
            return ValidationResult::reject("missing required parameter 'content'");
        }
        match self.fs.resolve(path_param(params)) {
            Ok(_) => ValidationResult::ok(),
            Err(e) => ValidationResult::reject(e.message),
        }
    }

    fn command_preview(&self, params: &Value) -> Option<String> {
        Some(format!("write {}", path_param(params)))
    }

    async fn invoke(&self, params: Value) -> Result<ToolOutput, ToolFailure> {
        let path = path_param(&params);
        let content = params.get("content").and_then(Value::as_str).unwrap_or("");
        tracing::info!(path = %path, bytes = content.len(), "write_file tool invoke");
        let previous = self.fs.write_file(path, content).await?;
        Ok(
            ToolOutput::text(format!("wrote {} bytes to {}", content.len(), path)).with_effect(
                serde_json::json!({
                    "path": path,
                    "previous": previous,
                }),
            ),
        )
    }

    /// 恢复写入前的内容；原本不存在的文件被删除。重复调用结果相同。
    async fn revert(&self, effect: &Value) -> Result<(), String> {
        let path = effect
            .get("path")
            .and_then(Value::as_str)
            .ok_or_else(|| "effect has no path".to_string())?;
        let resolved = self.fs.resolve(path).map_err(|e| e.message)?;
        match effect.get("previous").and_then(Value::as_str) {
            Some(previous) => tokio::fs::write(&resolved, previous)
                .await
                .map_err(|e| format!("Restore failed: {e}")),
            None => match tokio::fs::remove_file(&resolved).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(format!("Remove failed: {e}")),
            },
        }
    }
}

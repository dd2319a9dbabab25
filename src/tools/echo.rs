//! Echo 工具：回显文本，无副作用

use async_trait::async_trait;
use serde_json::Value;

use crate::tools::registry::{Capability, Tool, ToolFailure, ToolOutput};

/// Echo 工具
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo text back. Args: {\"text\": \"message\"}"
    }

    fn capability(&self) -> Capability {
        Capability::Core
    }

    async fn invoke(&self, params: Value) -> Result<ToolOutput, ToolFailure> {
        let text = params
            .get("text")
            .and_then(|v| v.as_str())
            .unwrap_or("(empty)");
        Ok(ToolOutput::text(text))
    }
}

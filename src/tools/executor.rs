//! 工具执行器
//!
//! 对每次调用施加单步超时并监听紧急停止令牌，结果映射为 StepError（超时 → 瞬时错误，停止 → 取消）；
//! 每次调用输出结构化审计日志（JSON）。

use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::core::{StepError, ToolErrorKind};
use crate::tools::registry::ToolOutput;
use crate::tools::router::BoundTool;

/// 执行失败：错误与失败前已生效的部分副作用
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionFailure {
    pub error: StepError,
    pub partial_effect: Option<Value>,
}

impl From<StepError> for ExecutionFailure {
    fn from(error: StepError) -> Self {
        Self {
            error,
            partial_effect: None,
        }
    }
}

/// 工具执行器
pub struct ToolExecutor {
    timeout: Duration,
}

impl ToolExecutor {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// 执行已绑定的工具；超时、失败或停止都转为 ExecutionFailure
    pub async fn execute(
        &self,
        step_id: &str,
        bound: &BoundTool,
        stop: &CancellationToken,
    ) -> Result<ToolOutput, ExecutionFailure> {
        let start = Instant::now();
        let tool_name = bound.name().to_string();
        let args_preview = args_preview(&bound.params);

        let result = tokio::select! {
            biased;
            _ = stop.cancelled() => None,
            r = timeout(self.timeout, bound.tool.invoke(bound.params.clone())) => Some(r),
        };

        let outcome = match &result {
            Some(Ok(Ok(_))) => "ok",
            Some(Ok(Err(_))) => "error",
            Some(Err(_)) => "timeout",
            None => "cancelled",
        };
        let duration_ms = start.elapsed().as_millis() as u64;
        let audit = serde_json::json!({
            "event": "tool_audit",
            "step_id": step_id,
            "tool": tool_name,
            "ok": outcome == "ok",
            "outcome": outcome,
            "duration_ms": duration_ms,
            "args_preview": args_preview,
        });
        tracing::info!(audit = %audit.to_string(), "tool");

        match result {
            Some(Ok(Ok(output))) => Ok(output),
            Some(Ok(Err(failure))) => Err(ExecutionFailure {
                error: StepError::from_tool_failure(failure.kind, failure.message),
                partial_effect: failure.partial_effect,
            }),
            Some(Err(_)) => Err(StepError::TransientExecution {
                kind: ToolErrorKind::Timeout,
                message: format!("tool '{}' timed out after {:?}", tool_name, self.timeout),
            }
            .into()),
            None => Err(StepError::Cancelled("emergency stop during execution".to_string()).into()),
        }
    }
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.len() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::safety::EffectClass;
    use crate::tools::registry::{Capability, Tool, ToolFailure};
    use async_trait::async_trait;
    use std::sync::Arc;

    struct Sleepy(Duration);

    #[async_trait]
    impl Tool for Sleepy {
        fn name(&self) -> &str {
            "sleepy"
        }
        fn description(&self) -> &str {
            "sleeps"
        }
        fn capability(&self) -> Capability {
            Capability::Core
        }
        async fn invoke(&self, _params: Value) -> Result<ToolOutput, ToolFailure> {
            tokio::time::sleep(self.0).await;
            Ok(ToolOutput::text("woke"))
        }
    }

    struct Broken;

    #[async_trait]
    impl Tool for Broken {
        fn name(&self) -> &str {
            "broken"
        }
        fn description(&self) -> &str {
            "fails after partial work"
        }
        fn capability(&self) -> Capability {
            Capability::FileWrite
        }
        async fn invoke(&self, _params: Value) -> Result<ToolOutput, ToolFailure> {
            Err(ToolFailure::new(ToolErrorKind::Permission, "read-only fs")
                .with_partial_effect(serde_json::json!({"path": "a.txt"})))
        }
    }

    fn bind(tool: impl Tool + 'static) -> BoundTool {
        BoundTool {
            tool: Arc::new(tool),
            params: serde_json::json!({}),
            score: 0.0,
            estimated_cost: 0.0,
            effect_class: EffectClass::ReadOnly,
        }
    }

    #[tokio::test]
    async fn test_success() {
        let exec = ToolExecutor::new(Duration::from_secs(1));
        let out = exec
            .execute("s1", &bind(Sleepy(Duration::from_millis(1))), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out.output, "woke");
    }

    #[tokio::test]
    async fn test_timeout_is_transient() {
        let exec = ToolExecutor::new(Duration::from_millis(20));
        let err = exec
            .execute("s1", &bind(Sleepy(Duration::from_secs(5))), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err.error,
            StepError::TransientExecution { kind: ToolErrorKind::Timeout, .. }
        ));
    }

    #[tokio::test]
    async fn test_stop_preempts_execution() {
        let exec = ToolExecutor::new(Duration::from_secs(30));
        let stop = CancellationToken::new();
        let trigger = stop.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let started = Instant::now();
        let err = exec
            .execute("s1", &bind(Sleepy(Duration::from_secs(30))), &stop)
            .await
            .unwrap_err();
        assert!(matches!(err.error, StepError::Cancelled(_)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_failure_keeps_partial_effect() {
        let exec = ToolExecutor::new(Duration::from_secs(1));
        let err = exec
            .execute("s1", &bind(Broken), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err.error, StepError::FatalExecution { .. }));
        assert_eq!(err.partial_effect, Some(serde_json::json!({"path": "a.txt"})));
    }
}

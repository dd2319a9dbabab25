//! 确认协作方
//!
//! 高风险与关键动作在 Authorizing 阶段挂起，等待外部确认；超时由 SafetyGate 视为拒绝。

use std::io::Write;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::Mutex;

use crate::safety::gate::Action;
use crate::safety::risk::RiskLevel;

/// 确认结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    Approved,
    Denied,
}

/// 确认协作方 trait
#[async_trait]
pub trait Confirmer: Send + Sync {
    async fn request(&self, action: &Action, risk: RiskLevel, justification: Option<&str>) -> Verdict;
}

/// 一律拒绝（非交互环境的安全默认）
#[derive(Debug, Default, Clone)]
pub struct DenyAll;

#[async_trait]
impl Confirmer for DenyAll {
    async fn request(&self, action: &Action, risk: RiskLevel, _justification: Option<&str>) -> Verdict {
        tracing::info!(action_id = %action.id, risk = %risk, "confirmation denied by policy");
        Verdict::Denied
    }
}

/// 一律批准（--approve-high-risk）
#[derive(Debug, Default, Clone)]
pub struct AutoApprove;

#[async_trait]
impl Confirmer for AutoApprove {
    async fn request(&self, action: &Action, risk: RiskLevel, _justification: Option<&str>) -> Verdict {
        tracing::info!(action_id = %action.id, risk = %risk, "confirmation auto-approved");
        Verdict::Approved
    }
}

/// 交互式确认：提示写到 stderr，逐行读取 y/yes；并发请求串行化
///
/// 所有请求共享同一个行读取器，被超时放弃的请求不会丢掉已缓冲的后续输入。
pub struct LineConfirmer<R> {
    lines: Mutex<Lines<R>>,
}

/// 从 stdin 读取回答
pub type StdinConfirmer = LineConfirmer<BufReader<Stdin>>;

impl<R: AsyncBufRead + Unpin> LineConfirmer<R> {
    pub fn from_reader(reader: R) -> Self {
        Self {
            lines: Mutex::new(reader.lines()),
        }
    }
}

impl StdinConfirmer {
    pub fn new() -> Self {
        Self::from_reader(BufReader::new(tokio::io::stdin()))
    }
}

impl Default for StdinConfirmer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<R: AsyncBufRead + Unpin + Send> Confirmer for LineConfirmer<R> {
    async fn request(&self, action: &Action, risk: RiskLevel, justification: Option<&str>) -> Verdict {
        let mut lines = self.lines.lock().await;

        let mut prompt = format!(
            "\n[{}] step {} wants to run {} ({})\n  {}\n",
            risk.to_string().to_uppercase(),
            action.step_id,
            action.tool,
            action.effect_class,
            action.command.as_deref().unwrap_or(&action.description),
        );
        if let Some(reason) = justification {
            prompt.push_str(&format!("  justification: {reason}\n"));
        }
        prompt.push_str("Approve? [y/N] ");
        {
            let mut stderr = std::io::stderr();
            let _ = stderr.write_all(prompt.as_bytes());
            let _ = stderr.flush();
        }

        // next_line 可安全取消：超时丢弃本次请求时，已读入缓冲的行留给下一次
        match lines.next_line().await {
            Ok(Some(line)) if matches!(line.trim().to_lowercase().as_str(), "y" | "yes") => Verdict::Approved,
            Ok(_) => Verdict::Denied,
            Err(e) => {
                tracing::warn!(action_id = %action.id, error = %e, "failed to read confirmation");
                Verdict::Denied
            }
        }
    }
}

//! 紧急停止信号
//!
//! 进程级、单次触发、不可撤销的取消信号；构造时显式传给 Scheduler 与 SafetyGate，
//! 所有挂起点（授权等待、工具执行、退避休眠、修复提案）都监听同一个 CancellationToken。
//! 系统信号由 SafetyGate::install_signal_handlers 接入。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// 停止原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// 调用方显式请求（SafetyGate::emergency_stop）
    Requested(String),
    /// Ctrl+C
    UserInterrupt,
    /// SIGTERM
    Signal,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopReason::Requested(reason) => write!(f, "requested: {reason}"),
            StopReason::UserInterrupt => write!(f, "user interrupt"),
            StopReason::Signal => write!(f, "termination signal"),
        }
    }
}

/// 紧急停止信号
#[derive(Clone)]
pub struct StopSignal {
    token: CancellationToken,
    fired: Arc<AtomicBool>,
    reason_tx: broadcast::Sender<StopReason>,
}

impl StopSignal {
    pub fn new() -> Self {
        let (reason_tx, _) = broadcast::channel(1);
        Self {
            token: CancellationToken::new(),
            fired: Arc::new(AtomicBool::new(false)),
            reason_tx,
        }
    }

    /// 取消 token（挂起点 select 此 token）
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// 触发停止；只有第一次调用生效并返回 true，重复调用是无操作
    pub fn trigger(&self, reason: StopReason) -> bool {
        if self
            .fired
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        tracing::warn!(reason = %reason, "emergency stop triggered");
        let _ = self.reason_tx.send(reason);
        self.token.cancel();
        true
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    /// 订阅停止原因
    pub fn subscribe(&self) -> broadcast::Receiver<StopReason> {
        self.reason_tx.subscribe()
    }

    pub async fn stopped(&self) {
        self.token.cancelled().await;
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

//! 安全闸门：风险分级、授权策略、确认协作方与紧急停止

pub mod confirm;
pub mod gate;
pub mod risk;

pub use confirm::{AutoApprove, Confirmer, DenyAll, LineConfirmer, StdinConfirmer, Verdict};
pub use gate::{Action, ApprovalState, SafetyGate};
pub use risk::{EffectClass, RiskClassifier, RiskLevel};

//! 风险分级
//!
//! 效果类别 → 默认风险等级的策略表（可由配置覆盖），再按命令子串模式向上提级（只升不降）。
//! 分级是纯函数：同样的效果类别与命令总是得到同样的等级。

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// 风险等级（可比较：Low < Medium < High < Critical）
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        };
        write!(f, "{name}")
    }
}

/// 动作声明的效果类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EffectClass {
    ReadOnly,
    NetworkEgress,
    LocalWrite,
    ProcessSpawn,
    PackageInstall,
    RemoteWrite,
    DestructiveLocal,
    DestructiveRemote,
}

impl EffectClass {
    /// 策略表中的默认等级
    pub fn default_risk(self) -> RiskLevel {
        match self {
            EffectClass::ReadOnly | EffectClass::NetworkEgress => RiskLevel::Low,
            EffectClass::LocalWrite | EffectClass::ProcessSpawn | EffectClass::PackageInstall => {
                RiskLevel::Medium
            }
            EffectClass::RemoteWrite | EffectClass::DestructiveLocal => RiskLevel::High,
            EffectClass::DestructiveRemote => RiskLevel::Critical,
        }
    }
}

impl std::fmt::Display for EffectClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            EffectClass::ReadOnly => "read-only",
            EffectClass::NetworkEgress => "network-egress",
            EffectClass::LocalWrite => "local-write",
            EffectClass::ProcessSpawn => "process-spawn",
            EffectClass::PackageInstall => "package-install",
            EffectClass::RemoteWrite => "remote-write",
            EffectClass::DestructiveLocal => "destructive-local",
            EffectClass::DestructiveRemote => "destructive-remote",
        };
        write!(f, "{name}")
    }
}

const CRITICAL_PATTERNS: &[&str] = &[
    "rm -rf /",
    "mkfs.",
    "dd if=",
    ":(){:|:&};:",
    "chmod -r 777 /",
    "> /dev/sd",
    "git push --force origin main",
    "git push --force origin master",
    "drop database",
    "delete from",
];

const HIGH_PATTERNS: &[&str] = &[
    "rm -rf",
    "rm -r",
    "git push",
    "git reset --hard",
    "git checkout --",
    "sudo ",
    "pip install",
    "npm install -g",
    "docker rm",
    "kubectl delete",
];

const MEDIUM_PATTERNS: &[&str] = &[
    "mv ",
    "cp ",
    "git commit",
    "git merge",
    "chmod",
    "chown",
    "pip",
    "npm",
    "apt install",
];

/// 风险分级器
#[derive(Debug, Clone)]
pub struct RiskClassifier {
    overrides: HashMap<EffectClass, RiskLevel>,
    critical: Vec<String>,
    high: Vec<String>,
    medium: Vec<String>,
}

impl Default for RiskClassifier {
    fn default() -> Self {
        let owned = |p: &[&str]| p.iter().map(|s| s.to_string()).collect();
        Self {
            overrides: HashMap::new(),
            critical: owned(CRITICAL_PATTERNS),
            high: owned(HIGH_PATTERNS),
            medium: owned(MEDIUM_PATTERNS),
        }
    }
}

impl RiskClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// 覆盖某个效果类别的默认等级
    pub fn with_overrides(mut self, overrides: HashMap<EffectClass, RiskLevel>) -> Self {
        self.overrides.extend(overrides);
        self
    }

    /// 追加命令模式（大小写不敏感）
    pub fn with_patterns(
        mut self,
        critical: &[String],
        high: &[String],
        medium: &[String],
    ) -> Self {
        let lower = |v: &[String]| v.iter().map(|s| s.to_lowercase()).collect::<Vec<_>>();
        self.critical.extend(lower(critical));
        self.high.extend(lower(high));
        self.medium.extend(lower(medium));
        self
    }

    /// 效果类别的基础等级（含覆盖）
    pub fn base_level(&self, effect: EffectClass) -> RiskLevel {
        self.overrides
            .get(&effect)
            .copied()
            .unwrap_or_else(|| effect.default_risk())
    }

    /// 命令模式命中的等级
    pub fn command_level(&self, command: &str) -> Option<RiskLevel> {
        let command = command.to_lowercase();
        let hit = |patterns: &[String]| patterns.iter().any(|p| command.contains(p.as_str()));
        if hit(&self.critical) {
            Some(RiskLevel::Critical)
        } else if hit(&self.high) {
            Some(RiskLevel::High)
        } else if hit(&self.medium) {
            Some(RiskLevel::Medium)
        } else {
            None
        }
    }

    /// 最终等级 = max(效果类别等级, 命令模式等级)
    pub fn classify(&self, effect: EffectClass, command: Option<&str>) -> RiskLevel {
        let base = self.base_level(effect);
        match command.and_then(|c| self.command_level(c)) {
            Some(level) => base.max(level),
            None => base,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_taxonomy_defaults() {
        let c = RiskClassifier::new();
        assert_eq!(c.classify(EffectClass::DestructiveRemote, None), RiskLevel::Critical);
        assert_eq!(c.classify(EffectClass::DestructiveLocal, None), RiskLevel::High);
        assert_eq!(c.classify(EffectClass::RemoteWrite, None), RiskLevel::High);
        assert_eq!(c.classify(EffectClass::LocalWrite, None), RiskLevel::Medium);
        assert_eq!(c.classify(EffectClass::PackageInstall, None), RiskLevel::Medium);
        assert_eq!(c.classify(EffectClass::ReadOnly, None), RiskLevel::Low);
    }

    #[test]
    fn test_command_patterns_only_escalate() {
        let c = RiskClassifier::new();
        assert_eq!(
            c.classify(EffectClass::ProcessSpawn, Some("git push origin feature")),
            RiskLevel::High
        );
        assert_eq!(
            c.classify(EffectClass::ProcessSpawn, Some("psql -c 'DROP DATABASE prod'")),
            RiskLevel::Critical
        );
        // 模式只升不降
        assert_eq!(
            c.classify(EffectClass::DestructiveRemote, Some("ls")),
            RiskLevel::Critical
        );
        assert_eq!(c.classify(EffectClass::ReadOnly, Some("ls -la")), RiskLevel::Low);
    }

    #[test]
    fn test_overrides_and_custom_patterns() {
        let c = RiskClassifier::new()
            .with_overrides(HashMap::from([(EffectClass::LocalWrite, RiskLevel::High)]))
            .with_patterns(&["Terraform Destroy".to_string()], &[], &[]);
        assert_eq!(c.classify(EffectClass::LocalWrite, None), RiskLevel::High);
        assert_eq!(
            c.classify(EffectClass::ProcessSpawn, Some("terraform destroy -auto-approve")),
            RiskLevel::Critical
        );
    }

    #[test]
    fn test_effect_class_serde_names() {
        let json = serde_json::to_string(&EffectClass::DestructiveRemote).unwrap();
        assert_eq!(json, "\"destructive-remote\"");
        let level: RiskLevel = serde_json::from_str("\"critical\"").unwrap();
        assert_eq!(level, RiskLevel::Critical);
        assert!(RiskLevel::Medium < RiskLevel::High);
    }
}

//! 复杂度估算（仅供参考，不阻塞计划构建）
//!
//! 基于描述长度和关键词的启发式评分；Scheduler 用 overall 限制同时运行的重型步骤数。

use serde::{Deserialize, Serialize};

const COMPLEX_KEYWORDS: &[&str] = &["integrate", "optimize", "refactor", "architect", "design", "migrate"];
const SIMPLE_KEYWORDS: &[&str] = &["add", "update", "fix", "change", "rename", "print"];

/// 复杂度评分（0-10）
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ComplexityScore {
    pub overall: f64,
    pub cognitive: f64,
    pub technical: f64,
    /// 预估耗时（分钟）
    pub time_estimate_minutes: u32,
}

impl ComplexityScore {
    pub fn is_heavy(&self, threshold: f64) -> bool {
        self.overall >= threshold
    }
}

/// 估算单个步骤描述的复杂度
pub fn estimate_complexity(description: &str) -> ComplexityScore {
    let lower = description.to_lowercase();
    let words: Vec<&str> = lower.split_whitespace().collect();

    let mut cognitive = (words.len() as f64 / 10.0).min(10.0);
    let mut technical: f64 = 5.0;

    if COMPLEX_KEYWORDS.iter().any(|kw| lower.contains(kw)) {
        technical += 2.0;
        cognitive += 1.0;
    }
    if SIMPLE_KEYWORDS.iter().any(|kw| words.contains(kw)) {
        technical -= 1.0;
    }

    let cognitive = cognitive.clamp(0.0, 10.0);
    let technical = technical.clamp(0.0, 10.0);
    let overall = (cognitive + technical) / 2.0;

    ComplexityScore {
        overall,
        cognitive,
        technical,
        time_estimate_minutes: (overall * 10.0) as u32,
    }
}

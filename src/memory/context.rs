//! 上下文存储：运行期的有界工作记忆
//!
//! 记录只追加、按插入顺序排列；累计大小超过预算时自动 summarize()，
//! 把最旧的一段连续记录替换为一条合成的 Decision 摘要。多个 worker 可并发追加，
//! 全序由锁内分配的 seq 决定。

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::ContextError;
use crate::memory::token_budget::{truncate_to_tokens, TokenEstimator};
use crate::plan::StepId;

/// 记录类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordKind {
    Output,
    Error,
    Decision,
    Note,
}

/// 上下文记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextRecord {
    pub seq: u64,
    pub kind: RecordKind,
    pub step_id: Option<StepId>,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    /// 估算 token 数
    pub size: usize,
    /// 由 summarize 生成的摘要记录
    pub synthetic: bool,
}

#[derive(Debug, Default)]
struct Inner {
    records: VecDeque<ContextRecord>,
    total: usize,
    next_seq: u64,
    run_active: bool,
    summaries: usize,
}

/// 上下文存储
#[derive(Debug)]
pub struct ContextStore {
    budget: usize,
    inner: Mutex<Inner>,
}

impl ContextStore {
    pub fn new(budget_tokens: usize) -> Self {
        Self {
            budget: budget_tokens.max(1),
            inner: Mutex::new(Inner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn budget(&self) -> usize {
        self.budget
    }

    /// 追加记录，返回其 seq；超出预算时在同一临界区内完成摘要
    pub fn append(
        &self,
        kind: RecordKind,
        step_id: Option<&str>,
        content: impl Into<String>,
    ) -> u64 {
        let content = content.into();
        let size = TokenEstimator::estimate(&content);
        let mut inner = self.lock();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.records.push_back(ContextRecord {
            seq,
            kind,
            step_id: step_id.map(str::to_string),
            content,
            timestamp: Utc::now(),
            size,
            synthetic: false,
        });
        inner.total += size;

        if inner.total > self.budget {
            self.summarize_locked(&mut inner);
        }
        seq
    }

    /// 手动触发摘要（未超预算时无操作），返回被合并的记录数
    pub fn summarize(&self) -> usize {
        let mut inner = self.lock();
        if inner.total <= self.budget {
            return 0;
        }
        self.summarize_locked(&mut inner)
    }

    /// 取最短的最旧前缀，使 剩余记录 + 摘要 不超过预算
    fn summarize_locked(&self, inner: &mut Inner) -> usize {
        let len = inner.records.len();
        let mut prefix_size = 0;
        let mut take = len;
        for (i, record) in inner.records.iter().enumerate() {
            prefix_size += record.size;
            let remaining = inner.total - prefix_size;
            // 摘要至少需要 2 个 token（文本 + 截断标记）
            if remaining + 2 <= self.budget {
                take = i + 1;
                break;
            }
        }

        let removed: Vec<ContextRecord> = inner.records.drain(..take).collect();
        let removed_size: usize = removed.iter().map(|r| r.size).sum();
        let remaining = inner.total - removed_size;
        let allowed = self.budget.saturating_sub(remaining).max(1);

        let first_seq = removed.first().map_or(inner.next_seq, |r| r.seq);
        let mut text = format!("[summary of {} earlier records]", removed.len());
        for record in &removed {
            let first_line = record.content.lines().next().unwrap_or("");
            match &record.step_id {
                Some(step) => text.push_str(&format!("\n- {:?} {}: {}", record.kind, step, first_line)),
                None => text.push_str(&format!("\n- {:?}: {}", record.kind, first_line)),
            }
        }
        let content = truncate_to_tokens(&text, allowed);
        let size = TokenEstimator::estimate(&content);

        inner.records.push_front(ContextRecord {
            seq: first_seq,
            kind: RecordKind::Decision,
            step_id: None,
            content,
            timestamp: Utc::now(),
            size,
            synthetic: true,
        });
        inner.total = remaining + size;
        inner.summaries += 1;

        tracing::debug!(
            merged = removed.len(),
            total = inner.total,
            budget = self.budget,
            "context summarized"
        );
        removed.len()
    }

    /// 标记运行开始（期间禁止 clear）
    pub fn begin_run(&self) {
        self.lock().run_active = true;
    }

    pub fn end_run(&self) {
        self.lock().run_active = false;
    }

    pub fn is_run_active(&self) -> bool {
        self.lock().run_active
    }

    /// 清空记录；运行中调用返回 RunInProgress
    pub fn clear(&self) -> Result<(), ContextError> {
        let mut inner = self.lock();
        if inner.run_active {
            return Err(ContextError::RunInProgress);
        }
        inner.records.clear();
        inner.total = 0;
        inner.summaries = 0;
        Ok(())
    }

    /// 按插入顺序的全部记录
    pub fn records(&self) -> Vec<ContextRecord> {
        self.lock().records.iter().cloned().collect()
    }

    /// 最近 n 条记录（按插入顺序）
    pub fn recent(&self, n: usize) -> Vec<ContextRecord> {
        let inner = self.lock();
        let skip = inner.records.len().saturating_sub(n);
        inner.records.iter().skip(skip).cloned().collect()
    }

    /// 某个步骤的记录
    pub fn records_for_step(&self, step_id: &str) -> Vec<ContextRecord> {
        self.lock()
            .records
            .iter()
            .filter(|r| r.step_id.as_deref() == Some(step_id))
            .cloned()
            .collect()
    }

    pub fn total_size(&self) -> usize {
        self.lock().total
    }

    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().records.is_empty()
    }

    pub fn summary_count(&self) -> usize {
        self.lock().summaries
    }
}

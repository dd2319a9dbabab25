//! 长期记忆协作方
//!
//! store(record) 尽力写入并返回不透明引用，retrieve(query, k) 返回排序后的相关记录；
//! 仅用于修复建议的参考上下文，从不影响正确性。InMemoryLongTerm 按关键词重叠检索，
//! 后续可接真实向量库。

use std::collections::HashSet;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::MemoryError;

/// 写入长期记忆的记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub text: String,
    #[serde(default)]
    pub metadata: Value,
}

impl MemoryRecord {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            metadata: Value::Null,
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// 不透明的记忆句柄
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemoryReference(String);

impl MemoryReference {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// 长期记忆 trait
#[async_trait]
pub trait LongTermMemory: Send + Sync {
    async fn store(&self, record: MemoryRecord) -> Result<MemoryReference, MemoryError>;

    /// 按查询检索最相关的 top_k 条
    async fn retrieve(&self, query: &str, top_k: usize) -> Result<Vec<MemoryRecord>, MemoryError>;

    /// 是否启用（Noop 实现返回 false）
    fn enabled(&self) -> bool {
        true
    }
}

/// 空实现：未启用长期记忆时使用
#[derive(Clone, Default)]
pub struct NoopLongTerm;

#[async_trait]
impl LongTermMemory for NoopLongTerm {
    async fn store(&self, _record: MemoryRecord) -> Result<MemoryReference, MemoryError> {
        Ok(MemoryReference::new("noop"))
    }

    async fn retrieve(&self, _query: &str, _top_k: usize) -> Result<Vec<MemoryRecord>, MemoryError> {
        Ok(Vec::new())
    }

    fn enabled(&self) -> bool {
        false
    }
}

struct Entry {
    reference: MemoryReference,
    record: MemoryRecord,
    tokens: HashSet<String>,
}

/// 简单内存实现：按关键词重叠检索
#[derive(Clone)]
pub struct InMemoryLongTerm {
    store: Arc<RwLock<Vec<Entry>>>,
    max_entries: usize,
}

/// 将文本切分为小写词集合，用于简单相似度（词重叠数）
fn tokenize_lower(s: &str) -> HashSet<String> {
    s.split(|c: char| !c.is_alphanumeric())
        .map(|w| w.to_lowercase())
        .filter(|w| w.len() > 1)
        .collect()
}

impl InMemoryLongTerm {
    pub fn new(max_entries: usize) -> Self {
        Self {
            store: Arc::new(RwLock::new(Vec::new())),
            max_entries: max_entries.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.store.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryLongTerm {
    fn default() -> Self {
        Self::new(1000)
    }
}

#[async_trait]
impl LongTermMemory for InMemoryLongTerm {
    async fn store(&self, record: MemoryRecord) -> Result<MemoryReference, MemoryError> {
        let text = record.text.trim();
        if text.is_empty() {
            return Err(MemoryError::Store("empty record".to_string()));
        }
        let tokens = tokenize_lower(text);
        let reference = MemoryReference::new(format!("mem_{}", uuid::Uuid::new_v4()));
        let mut store = self.store.write().unwrap_or_else(PoisonError::into_inner);
        store.push(Entry {
            reference: reference.clone(),
            record,
            tokens,
        });
        let n = store.len();
        if n > self.max_entries {
            store.drain(0..n - self.max_entries);
        }
        Ok(reference)
    }

    async fn retrieve(&self, query: &str, top_k: usize) -> Result<Vec<MemoryRecord>, MemoryError> {
        let query_tokens = tokenize_lower(query);
        if query_tokens.is_empty() {
            return Ok(Vec::new());
        }
        let store = self.store.read().unwrap_or_else(PoisonError::into_inner);
        let mut scored: Vec<(usize, &Entry)> = store
            .iter()
            .map(|entry| (query_tokens.intersection(&entry.tokens).count(), entry))
            .filter(|(s, _)| *s > 0)
            .collect();
        // 稳定排序：同分时较早写入的在前
        scored.sort_by(|a, b| b.0.cmp(&a.0));
        tracing::debug!(
            query = %query,
            hits = scored.len(),
            top = ?scored.first().map(|(_, e)| e.reference.as_str()),
            "long-term retrieve"
        );
        Ok(scored
            .into_iter()
            .take(top_k)
            .map(|(_, e)| e.record.clone())
            .collect())
    }
}

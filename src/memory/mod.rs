//! 记忆层：运行期上下文存储（有界、自动摘要）与跨运行的长期记忆协作方

pub mod context;
pub mod long_term;
pub mod token_budget;

pub use context::{ContextRecord, ContextStore, RecordKind};
pub use long_term::{InMemoryLongTerm, LongTermMemory, MemoryRecord, MemoryReference, NoopLongTerm};
pub use token_budget::TokenEstimator;

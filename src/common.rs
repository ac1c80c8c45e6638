//! 全局基础类型与错误定义

use std::sync::Arc;
use thiserror::Error;

// ── ID 类型别名 ───────────────────────────────────────────────────────────────

/// 64 位 cell 标识：高 32 位为 cell part，对象索引部分恒为零
pub type CellId = u64;
/// 完整的 64 位行主键：高 32 位 cell part + 低 32 位对象索引
pub type ObjId = u64;
/// 有符号 BLOB 引用：正 → main，负 → cached（取 `-ref`），0 → 哨兵
pub type BlobRef = i64;

/// BLOB 值。`None` 为哨兵；多行共享同一个 `Arc` 即表示"同一个值"，
/// 写入时按该标识去重。
pub type Blob = Option<Arc<Vec<u8>>>;

// ── 行组 ──────────────────────────────────────────────────────────────────────

/// Tablet 内的行组：`main` 存真正属于该 cell 的行，`cached` 存邻居缓存
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum RowGroup {
    #[default]
    Main,
    Cached,
}

impl RowGroup {
    pub fn name(self) -> &'static str {
        match self {
            Self::Main   => "main",
            Self::Cached => "cached",
        }
    }
}

impl std::fmt::Display for RowGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// ── 错误 ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum TableError {
    #[error("schema violation: {0}")]
    Schema(String),
    #[error("key contract violated: {0}")]
    KeyContract(String),
    #[error("lock contention: {0}")]
    LockContention(String),
    #[error("cannot access table: {0}")]
    TableNotFound(String),
    #[error("column not found: {0}")]
    ColumnNotFound(String),
    #[error("unknown file-group filter \"{0}\"")]
    UnknownFilter(String),
    #[error("tablet corrupt: {0}")]
    TabletCorrupt(String),
    #[error("checksum mismatch")]
    ChecksumMismatch,
    #[error("compression error: {0}")]
    Compression(String),
    #[error("time {0} outside the pixelization epoch range")]
    TimeOutOfRange(f64),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("schema encoding error: {0}")]
    SchemaJson(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, TableError>;

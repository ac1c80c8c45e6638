//! BLOB 存储：变长值数组（VLArray）与标识去重
//!
//! 每个 BLOB 列对应一个只追加的值序列。索引 0 保留给哨兵——对象类为
//! `None`，类型化类为空数组。行内引用为有符号 64 位：正数指向
//! `main/blobs/<col>`，负数按 `-ref` 指向 `cached/blobs/<col>`。
//!
//! 写入去重只看值的**标识**（同一个 `Arc`），不做内容哈希；读取同样
//! 按引用去重，相同引用共享同一个实例。

use std::collections::HashMap;
use std::io::{Cursor, Read};
use std::sync::Arc;

use byteorder::{LittleEndian as LE, ReadBytesExt};

use crate::common::{Blob, BlobRef, Result, TableError};
use crate::schema::BlobKind;

// ── VLArray ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct VlArray {
    kind: BlobKind,
    /// 值序列；`entries[0]` 恒为哨兵
    entries: Vec<Option<Vec<u8>>>,
}

impl VlArray {
    pub fn new(kind: BlobKind) -> Self {
        let sentinel = match kind {
            BlobKind::Object => None,
            BlobKind::Typed(_) => Some(Vec::new()),
        };
        Self { kind, entries: vec![sentinel] }
    }

    pub fn kind(&self) -> BlobKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 截断到 n 个元素；哨兵永远保留
    pub fn truncate(&mut self, n: usize) {
        self.entries.truncate(n.max(1));
    }

    /// 取第 i 个值。对象类哨兵为 `None`，类型化哨兵为空值。
    pub fn get(&self, i: usize) -> Result<Blob> {
        let e = self.entries.get(i).ok_or_else(|| {
            TableError::TabletCorrupt(format!("blob ref {i} out of range (len {})", self.entries.len()))
        })?;
        Ok(e.as_ref().map(|b| Arc::new(b.clone())))
    }

    /// 按标识去重后追加一批值，返回每行的引用。
    ///
    /// `None` 映射为引用 0，不会追加；唯一的非哨兵值按首次出现的顺序
    /// 追加，引用 = 追加前长度 + 批内序号。
    pub fn append_unique(&mut self, values: &[Blob]) -> Vec<BlobRef> {
        let mut seen: HashMap<usize, BlobRef> = HashMap::new();
        let mut refs = Vec::with_capacity(values.len());
        for v in values {
            match v {
                None => refs.push(0),
                Some(arc) => {
                    let ident = Arc::as_ptr(arc) as usize;
                    let r = match seen.get(&ident) {
                        Some(&r) => r,
                        None => {
                            let r = self.entries.len() as BlobRef;
                            self.entries.push(Some(arc.as_ref().clone()));
                            seen.insert(ident, r);
                            r
                        }
                    };
                    refs.push(r);
                }
            }
        }
        refs
    }

    /// 按引用加载一批值（引用必须非负）。每个唯一引用只实例化一次，
    /// 相同引用共享同一个 `Arc`。
    pub fn load_refs(&self, refs: &[BlobRef]) -> Result<Vec<Blob>> {
        let mut cache: HashMap<BlobRef, Blob> = HashMap::new();
        let mut out = Vec::with_capacity(refs.len());
        for &r in refs {
            if r < 0 {
                return Err(TableError::TabletCorrupt(format!(
                    "negative blob ref {r} outside a cached-read context"
                )));
            }
            let b = match cache.get(&r) {
                Some(b) => b.clone(),
                None => {
                    let b = self.get(r as usize)?;
                    cache.insert(r, b.clone());
                    b
                }
            };
            out.push(b);
        }
        Ok(out)
    }

    // ── 磁盘编解码（tablet 负责压缩外框）──────────────────────────────────────

    pub(crate) fn encode_entries(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&(self.entries.len() as u64).to_le_bytes());
        for e in &self.entries {
            match e {
                None => out.push(0),
                Some(b) => {
                    out.push(1);
                    out.extend_from_slice(&(b.len() as u32).to_le_bytes());
                    out.extend_from_slice(b);
                }
            }
        }
    }

    pub(crate) fn decode_entries(kind: BlobKind, data: &[u8]) -> Result<Self> {
        let mut c = Cursor::new(data);
        let n = c.read_u64::<LE>()? as usize;
        let mut entries = Vec::with_capacity(n);
        for _ in 0..n {
            match c.read_u8()? {
                0 => entries.push(None),
                _ => {
                    let len = c.read_u32::<LE>()? as usize;
                    let mut buf = vec![0u8; len];
                    c.read_exact(&mut buf)?;
                    entries.push(Some(buf));
                }
            }
        }
        if entries.is_empty() {
            return Err(TableError::TabletCorrupt("blob array lacks the sentinel entry".into()));
        }
        Ok(Self { kind, entries })
    }
}

// ── 有符号引用加载 ────────────────────────────────────────────────────────────

/// 混合正负引用的加载：正数走 `main`，负数按 `-ref` 走 `cached`，
/// 两侧各自按唯一引用去重。
pub fn load_refs_signed(
    main:   &VlArray,
    cached: Option<&VlArray>,
    refs:   &[BlobRef],
) -> Result<Vec<Blob>> {
    let mut pos_cache: HashMap<BlobRef, Blob> = HashMap::new();
    let mut neg_cache: HashMap<BlobRef, Blob> = HashMap::new();
    let mut out = Vec::with_capacity(refs.len());
    for &r in refs {
        let b = if r >= 0 {
            match pos_cache.get(&r) {
                Some(b) => b.clone(),
                None => {
                    let b = main.get(r as usize)?;
                    pos_cache.insert(r, b.clone());
                    b
                }
            }
        } else {
            let ca = cached.ok_or_else(|| {
                TableError::TabletCorrupt("negative blob ref but the tablet has no cached group".into())
            })?;
            match neg_cache.get(&r) {
                Some(b) => b.clone(),
                None => {
                    let b = ca.get((-r) as usize)?;
                    neg_cache.insert(r, b.clone());
                    b
                }
            }
        };
        out.push(b);
    }
    Ok(out)
}

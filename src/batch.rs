//! 类型化列数据与列批（行表的内存表示）

use std::io::{Cursor, Read};

use byteorder::{LittleEndian as LE, ReadBytesExt};

use crate::common::{Blob, Result, TableError};

// ── 标量类型码 ────────────────────────────────────────────────────────────────

/// 定宽标量类型。类型码沿用 schema 中的字符串写法（`"u8"` = 64 位无符号）。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    Bool,
    I1, I2, I4, I8,
    U1, U2, U4, U8,
    F4, F8,
}

impl DataType {
    pub fn parse(code: &str) -> Result<Self> {
        Ok(match code {
            "bool" => Self::Bool,
            "i1" => Self::I1, "i2" => Self::I2, "i4" => Self::I4, "i8" => Self::I8,
            "u1" => Self::U1, "u2" => Self::U2, "u4" => Self::U4, "u8" => Self::U8,
            "f4" => Self::F4, "f8" => Self::F8,
            other => return Err(TableError::Schema(format!("unknown dtype code \"{other}\""))),
        })
    }

    pub fn code(self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::I1 => "i1", Self::I2 => "i2", Self::I4 => "i4", Self::I8 => "i8",
            Self::U1 => "u1", Self::U2 => "u2", Self::U4 => "u4", Self::U8 => "u8",
            Self::F4 => "f4", Self::F8 => "f8",
        }
    }

    /// 磁盘编码用的单字节标记
    pub fn tag(self) -> u8 {
        match self {
            Self::Bool => 0,
            Self::I1 => 1, Self::I2 => 2, Self::I4 => 3, Self::I8 => 4,
            Self::U1 => 5, Self::U2 => 6, Self::U4 => 7, Self::U8 => 8,
            Self::F4 => 9, Self::F8 => 10,
        }
    }

    pub fn from_tag(tag: u8) -> Result<Self> {
        Ok(match tag {
            0 => Self::Bool,
            1 => Self::I1, 2 => Self::I2, 3 => Self::I4, 4 => Self::I8,
            5 => Self::U1, 6 => Self::U2, 7 => Self::U4, 8 => Self::U8,
            9 => Self::F4, 10 => Self::F8,
            t => return Err(TableError::TabletCorrupt(format!("unknown dtype tag {t}"))),
        })
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

// ── 列数据 ────────────────────────────────────────────────────────────────────

/// 一列定宽标量，每个 `DataType` 一个变体
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnData {
    Bool(Vec<bool>),
    I1(Vec<i8>), I2(Vec<i16>), I4(Vec<i32>), I8(Vec<i64>),
    U1(Vec<u8>), U2(Vec<u16>), U4(Vec<u32>), U8(Vec<u64>),
    F4(Vec<f32>), F8(Vec<f64>),
}

macro_rules! with_data {
    ($self:expr, $v:ident => $e:expr) => {
        match $self {
            ColumnData::Bool($v) => $e,
            ColumnData::I1($v) => $e, ColumnData::I2($v) => $e,
            ColumnData::I4($v) => $e, ColumnData::I8($v) => $e,
            ColumnData::U1($v) => $e, ColumnData::U2($v) => $e,
            ColumnData::U4($v) => $e, ColumnData::U8($v) => $e,
            ColumnData::F4($v) => $e, ColumnData::F8($v) => $e,
        }
    };
}

macro_rules! map_data {
    ($self:expr, $v:ident => $e:expr) => {
        match $self {
            ColumnData::Bool($v) => ColumnData::Bool($e),
            ColumnData::I1($v) => ColumnData::I1($e), ColumnData::I2($v) => ColumnData::I2($e),
            ColumnData::I4($v) => ColumnData::I4($e), ColumnData::I8($v) => ColumnData::I8($e),
            ColumnData::U1($v) => ColumnData::U1($e), ColumnData::U2($v) => ColumnData::U2($e),
            ColumnData::U4($v) => ColumnData::U4($e), ColumnData::U8($v) => ColumnData::U8($e),
            ColumnData::F4($v) => ColumnData::F4($e), ColumnData::F8($v) => ColumnData::F8($e),
        }
    };
}

macro_rules! zip_data {
    ($a:expr, $b:expr, $va:ident, $vb:ident => $e:expr) => {
        match ($a, $b) {
            (ColumnData::Bool($va), ColumnData::Bool($vb)) => Some($e),
            (ColumnData::I1($va), ColumnData::I1($vb)) => Some($e),
            (ColumnData::I2($va), ColumnData::I2($vb)) => Some($e),
            (ColumnData::I4($va), ColumnData::I4($vb)) => Some($e),
            (ColumnData::I8($va), ColumnData::I8($vb)) => Some($e),
            (ColumnData::U1($va), ColumnData::U1($vb)) => Some($e),
            (ColumnData::U2($va), ColumnData::U2($vb)) => Some($e),
            (ColumnData::U4($va), ColumnData::U4($vb)) => Some($e),
            (ColumnData::U8($va), ColumnData::U8($vb)) => Some($e),
            (ColumnData::F4($va), ColumnData::F4($vb)) => Some($e),
            (ColumnData::F8($va), ColumnData::F8($vb)) => Some($e),
            _ => None,
        }
    };
}

impl ColumnData {
    pub fn dtype(&self) -> DataType {
        match self {
            Self::Bool(_) => DataType::Bool,
            Self::I1(_) => DataType::I1, Self::I2(_) => DataType::I2,
            Self::I4(_) => DataType::I4, Self::I8(_) => DataType::I8,
            Self::U1(_) => DataType::U1, Self::U2(_) => DataType::U2,
            Self::U4(_) => DataType::U4, Self::U8(_) => DataType::U8,
            Self::F4(_) => DataType::F4, Self::F8(_) => DataType::F8,
        }
    }

    /// 全零列
    pub fn zeros(dtype: DataType, n: usize) -> Self {
        match dtype {
            DataType::Bool => Self::Bool(vec![false; n]),
            DataType::I1 => Self::I1(vec![0; n]), DataType::I2 => Self::I2(vec![0; n]),
            DataType::I4 => Self::I4(vec![0; n]), DataType::I8 => Self::I8(vec![0; n]),
            DataType::U1 => Self::U1(vec![0; n]), DataType::U2 => Self::U2(vec![0; n]),
            DataType::U4 => Self::U4(vec![0; n]), DataType::U8 => Self::U8(vec![0; n]),
            DataType::F4 => Self::F4(vec![0.0; n]), DataType::F8 => Self::F8(vec![0.0; n]),
        }
    }

    pub fn len(&self) -> usize {
        with_data!(self, v => v.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn truncate(&mut self, n: usize) {
        with_data!(self, v => v.truncate(n));
    }

    /// 零填充或截断到 n 行
    pub fn resize(&mut self, n: usize) {
        with_data!(self, v => v.resize(n, Default::default()));
    }

    /// 保留 `keep[i]` 为真的行
    pub fn mask(&self, keep: &[bool]) -> Self {
        map_data!(self, v => v.iter().zip(keep.iter()).filter(|(_, k)| **k).map(|(x, _)| *x).collect())
    }

    /// 同类型列拼接
    pub fn append(&mut self, other: &Self) -> Result<()> {
        let (dst, src) = (self.dtype(), other.dtype());
        zip_data!(&mut *self, other, a, b => a.extend_from_slice(b)).ok_or_else(|| {
            TableError::Schema(format!("column dtype mismatch: {dst} vs {src}"))
        })
    }

    /// 散射写入：`self[idx[k]] = src[k]`
    pub fn overlay(&mut self, idx: &[usize], src: &Self) -> Result<()> {
        if idx.len() != src.len() || idx.iter().any(|&j| j >= self.len()) {
            return Err(TableError::Schema("overlay shape mismatch".into()));
        }
        let (dst, srcdt) = (self.dtype(), src.dtype());
        zip_data!(&mut *self, src, a, b => for (k, &j) in idx.iter().enumerate() { a[j] = b[k]; })
            .ok_or_else(|| {
                TableError::Schema(format!("column dtype mismatch: {dst} vs {srcdt}"))
            })
    }

    // ── 类型化访问 ────────────────────────────────────────────────────────────

    pub fn as_u64(&self) -> Option<&[u64]> {
        match self { Self::U8(v) => Some(v), _ => None }
    }

    pub fn as_u64_mut(&mut self) -> Option<&mut Vec<u64>> {
        match self { Self::U8(v) => Some(v), _ => None }
    }

    pub fn as_i64(&self) -> Option<&[i64]> {
        match self { Self::I8(v) => Some(v), _ => None }
    }

    /// BLOB 引用列取负（邻居缓存读取路径）
    pub fn negate_refs(&mut self) -> bool {
        match self {
            Self::I8(v) => {
                for x in v.iter_mut() {
                    *x = -*x;
                }
                true
            }
            _ => false,
        }
    }

    /// 数值列转 f64（bool 列不可转）
    pub fn to_f64(&self) -> Option<Vec<f64>> {
        Some(match self {
            Self::Bool(_) => return None,
            Self::I1(v) => v.iter().map(|&x| x as f64).collect(),
            Self::I2(v) => v.iter().map(|&x| x as f64).collect(),
            Self::I4(v) => v.iter().map(|&x| x as f64).collect(),
            Self::I8(v) => v.iter().map(|&x| x as f64).collect(),
            Self::U1(v) => v.iter().map(|&x| x as f64).collect(),
            Self::U2(v) => v.iter().map(|&x| x as f64).collect(),
            Self::U4(v) => v.iter().map(|&x| x as f64).collect(),
            Self::U8(v) => v.iter().map(|&x| x as f64).collect(),
            Self::F4(v) => v.iter().map(|&x| x as f64).collect(),
            Self::F8(v) => v.clone(),
        })
    }

    // ── 磁盘编解码（LE）──────────────────────────────────────────────────────

    pub(crate) fn encode(&self, out: &mut Vec<u8>) {
        match self {
            Self::Bool(v) => out.extend(v.iter().map(|&x| x as u8)),
            Self::I1(v) => out.extend(v.iter().map(|&x| x as u8)),
            Self::I2(v) => for x in v { out.extend_from_slice(&x.to_le_bytes()); },
            Self::I4(v) => for x in v { out.extend_from_slice(&x.to_le_bytes()); },
            Self::I8(v) => for x in v { out.extend_from_slice(&x.to_le_bytes()); },
            Self::U1(v) => out.extend_from_slice(v),
            Self::U2(v) => for x in v { out.extend_from_slice(&x.to_le_bytes()); },
            Self::U4(v) => for x in v { out.extend_from_slice(&x.to_le_bytes()); },
            Self::U8(v) => for x in v { out.extend_from_slice(&x.to_le_bytes()); },
            Self::F4(v) => for x in v { out.extend_from_slice(&x.to_le_bytes()); },
            Self::F8(v) => for x in v { out.extend_from_slice(&x.to_le_bytes()); },
        }
    }

    pub(crate) fn decode(dtype: DataType, n: usize, data: &[u8]) -> Result<Self> {
        let mut c = Cursor::new(data);
        macro_rules! read_n {
            ($variant:ident, $read:expr) => {{
                let mut v = Vec::with_capacity(n);
                for _ in 0..n {
                    #[allow(clippy::redundant_closure_call)]
                    v.push($read(&mut c)?);
                }
                Self::$variant(v)
            }};
        }
        Ok(match dtype {
            DataType::Bool => read_n!(Bool, |c: &mut Cursor<&[u8]>| c.read_u8().map(|x| x != 0)),
            DataType::I1 => read_n!(I1, |c: &mut Cursor<&[u8]>| c.read_i8()),
            DataType::I2 => read_n!(I2, |c: &mut Cursor<&[u8]>| c.read_i16::<LE>()),
            DataType::I4 => read_n!(I4, |c: &mut Cursor<&[u8]>| c.read_i32::<LE>()),
            DataType::I8 => read_n!(I8, |c: &mut Cursor<&[u8]>| c.read_i64::<LE>()),
            DataType::U1 => {
                let mut v = vec![0u8; n];
                c.read_exact(&mut v)?;
                Self::U1(v)
            }
            DataType::U2 => read_n!(U2, |c: &mut Cursor<&[u8]>| c.read_u16::<LE>()),
            DataType::U4 => read_n!(U4, |c: &mut Cursor<&[u8]>| c.read_u32::<LE>()),
            DataType::U8 => read_n!(U8, |c: &mut Cursor<&[u8]>| c.read_u64::<LE>()),
            DataType::F4 => read_n!(F4, |c: &mut Cursor<&[u8]>| c.read_f32::<LE>()),
            DataType::F8 => read_n!(F8, |c: &mut Cursor<&[u8]>| c.read_f64::<LE>()),
        })
    }
}

// ── 列批 ──────────────────────────────────────────────────────────────────────

/// 有序的同长度列集合（行表的内存形式；BLOB 列以 i8 引用形式出现）
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ColumnBatch {
    cols: Vec<(String, ColumnData)>,
}

impl ColumnBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// 按列规格构造 n 行全零批
    pub fn zeros_with(cols: &[(String, DataType)], n: usize) -> Self {
        Self {
            cols: cols.iter()
                .map(|(name, dt)| (name.clone(), ColumnData::zeros(*dt, n)))
                .collect(),
        }
    }

    /// 按列规格构造零行空批
    pub fn empty_with(cols: &[(String, DataType)]) -> Self {
        Self::zeros_with(cols, 0)
    }

    /// 行数（无列时为 0）
    pub fn len(&self) -> usize {
        self.cols.first().map(|(_, c)| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ncols(&self) -> usize {
        self.cols.len()
    }

    pub fn columns(&self) -> &[(String, ColumnData)] {
        &self.cols
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.cols.iter().map(|(n, _)| n.as_str())
    }

    pub fn add_column(&mut self, name: &str, data: ColumnData) -> Result<()> {
        if self.cols.iter().any(|(n, _)| n == name) {
            return Err(TableError::Schema(format!("duplicate column \"{name}\"")));
        }
        if !self.cols.is_empty() && data.len() != self.len() {
            return Err(TableError::Schema(format!(
                "column \"{name}\" has {} rows, batch has {}", data.len(), self.len()
            )));
        }
        self.cols.push((name.to_string(), data));
        Ok(())
    }

    pub fn column(&self, name: &str) -> Option<&ColumnData> {
        self.cols.iter().find(|(n, _)| n == name).map(|(_, c)| c)
    }

    pub fn column_mut(&mut self, name: &str) -> Option<&mut ColumnData> {
        self.cols.iter_mut().find(|(n, _)| n == name).map(|(_, c)| c)
    }

    /// 保留 `keep[i]` 为真的行
    pub fn mask(&self, keep: &[bool]) -> Self {
        Self {
            cols: self.cols.iter()
                .map(|(n, c)| (n.clone(), c.mask(keep)))
                .collect(),
        }
    }

    /// 同构批拼接（列名与类型逐一对应）
    pub fn append(&mut self, other: &Self) -> Result<()> {
        if self.ncols() != other.ncols()
            || !self.cols.iter().zip(&other.cols).all(|((a, _), (b, _))| a == b)
        {
            return Err(TableError::Schema("incompatible batch layout".into()));
        }
        for ((_, dst), (_, src)) in self.cols.iter_mut().zip(&other.cols) {
            dst.append(src)?;
        }
        Ok(())
    }

    /// 清空所有行（保留列结构）
    pub fn clear(&mut self) {
        for (_, c) in &mut self.cols {
            c.truncate(0);
        }
    }

    /// 零填充或截断到 n 行
    pub fn resize(&mut self, n: usize) {
        for (_, c) in &mut self.cols {
            c.resize(n);
        }
    }
}

// ── 写入批 ────────────────────────────────────────────────────────────────────

/// 写入列：普通标量数据，或 BLOB 值（按 `Arc` 标识去重）
#[derive(Debug, Clone)]
pub enum InsertColumn {
    Data(ColumnData),
    Blobs(Vec<Blob>),
}

impl InsertColumn {
    pub fn len(&self) -> usize {
        match self {
            Self::Data(d) => d.len(),
            Self::Blobs(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// `Table::append` 的规范化入参：有序 (列名, 列) 序列
#[derive(Debug, Clone, Default)]
pub struct InsertBatch {
    cols: Vec<(String, InsertColumn)>,
}

impl InsertBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// 链式添加标量列
    pub fn col(mut self, name: &str, data: ColumnData) -> Self {
        self.cols.push((name.to_string(), InsertColumn::Data(data)));
        self
    }

    /// 链式添加 BLOB 列
    pub fn blobs(mut self, name: &str, values: Vec<Blob>) -> Self {
        self.cols.push((name.to_string(), InsertColumn::Blobs(values)));
        self
    }

    pub fn from_pairs(pairs: Vec<(String, InsertColumn)>) -> Self {
        Self { cols: pairs }
    }

    pub fn into_cols(self) -> Vec<(String, InsertColumn)> {
        self.cols
    }
}

//! Tablet 文件读写
//!
//! 每个 (cell, cgroup) 至多一个 tablet 文件（`<table>.<cgroup>.h5`），
//! 在 cell 锁的保护下整体读入、改写、整体落盘；提交用"写临时文件 +
//! 原子 rename"，读取方因此总能看到一致的快照。
//!
//! 文件格式：
//! ```text
//! ┌────────────────────────────────────┐
//! │  MAGIC  (8 bytes) "SVTABLT\0"      │
//! │  Version(4 bytes) = 1              │
//! ├────────────────────────────────────┤
//! │  ngroups (u8)，每个行组：           │
//! │    tag (u8)  0=main 1=cached       │
//! │    nrows (u64)                     │
//! │    seq flag (u8) [+ seq (u64)]     │ ← 仅主 cgroup 的 main
//! │    ncols (u16)，每列：              │
//! │      name | dtype | codec          │
//! │      raw_len | stored_len | bytes  │ ← 按 filters 做 LZ4
//! │    nblobs (u16)，每个 VLArray：     │
//! │      name | kind | codec | payload │
//! ├────────────────────────────────────┤
//! │  Body CRC32 (4 bytes)              │
//! │  MAGIC      (8 bytes)              │
//! └────────────────────────────────────┘
//! ```

use std::fs;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian as LE, ReadBytesExt};
use log::debug;

use crate::batch::{ColumnBatch, ColumnData, DataType};
use crate::blob::VlArray;
use crate::common::{Result, RowGroup, TableError};
use crate::compression::{self, CompLib};
use crate::schema::{BlobKind, Filters};

const MAGIC: &[u8; 8] = b"SVTABLT\0";
const VERSION: u32 = 1;

// ── Tablet 规格（由 schema 推导，建组时使用）──────────────────────────────────

#[derive(Debug, Clone)]
pub struct TabletSpec {
    /// cgroup 的 (列名, 类型) 有序表；BLOB 列以 i8 引用列出现
    pub columns: Vec<(String, DataType)>,
    /// (BLOB 列名, 元素种类, 生效过滤器)
    pub blobs: Vec<(String, BlobKind, Filters)>,
    /// 行表与序列的生效过滤器
    pub filters: Filters,
    /// 主 cgroup 的主键名；Some 时 main 行组带 `_seq_<pk>` 序列
    pub seq_column: Option<String>,
}

impl TabletSpec {
    fn blob_filters(&self, name: &str) -> CompLib {
        self.blobs.iter()
            .find(|(n, _, _)| n == name)
            .map(|(_, _, f)| f.complib)
            .unwrap_or(self.filters.complib)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    Write,
}

// ── 行组数据 ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct RowGroupData {
    pub table: ColumnBatch,
    /// 下一个可用对象索引（`_seq_<pk>`）；仅主 cgroup 的 main 行组持有
    pub seq: Option<u64>,
    /// BLOB VLArray，按 schema 声明顺序
    pub blobs: Vec<(String, VlArray)>,
}

impl RowGroupData {
    /// 按规格急切分配：空行表 + 序列 + 带哨兵的 VLArray
    fn new_empty(spec: &TabletSpec, group: RowGroup) -> Self {
        Self {
            table: ColumnBatch::empty_with(&spec.columns),
            seq: (group == RowGroup::Main && spec.seq_column.is_some()).then_some(1),
            blobs: spec.blobs.iter()
                .map(|(name, kind, _)| (name.clone(), VlArray::new(*kind)))
                .collect(),
        }
    }

    pub fn nrows(&self) -> usize {
        self.table.len()
    }

    pub fn blob_array(&self, name: &str) -> Option<&VlArray> {
        self.blobs.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn blob_array_mut(&mut self, name: &str) -> Option<&mut VlArray> {
        self.blobs.iter_mut().find(|(n, _)| n == name).map(|(_, v)| v)
    }
}

// ── Tablet ────────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct Tablet {
    path: PathBuf,
    mode: OpenMode,
    spec: TabletSpec,
    main: Option<RowGroupData>,
    cached: Option<RowGroupData>,
}

impl Tablet {
    /// 打开（写模式下自动创建）一个 tablet。
    ///
    /// 写模式：目录不存在则递归创建；文件不存在则按规格急切分配
    /// `main` 行组。读模式要求文件存在。
    pub fn open(path: &Path, mode: OpenMode, spec: &TabletSpec) -> Result<Self> {
        debug!("opening tablet {} (mode {:?})", path.display(), mode);
        match mode {
            OpenMode::Read => {
                let data = fs::read(path)?;
                Self::parse(path, mode, spec.clone(), &data)
            }
            OpenMode::Write => {
                if let Some(dir) = path.parent() {
                    fs::create_dir_all(dir)?;
                }
                if path.is_file() {
                    let data = fs::read(path)?;
                    Self::parse(path, mode, spec.clone(), &data)
                } else {
                    debug!("creating tablet {}", path.display());
                    Ok(Self {
                        path: path.to_path_buf(),
                        mode,
                        spec: spec.clone(),
                        main: Some(RowGroupData::new_empty(spec, RowGroup::Main)),
                        cached: None,
                    })
                }
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn group(&self, g: RowGroup) -> Option<&RowGroupData> {
        match g {
            RowGroup::Main => self.main.as_ref(),
            RowGroup::Cached => self.cached.as_ref(),
        }
    }

    pub fn has_group(&self, g: RowGroup) -> bool {
        self.group(g).is_some()
    }

    /// 取行组句柄，缺失时按规格急切创建
    pub fn group_mut(&mut self, g: RowGroup) -> &mut RowGroupData {
        let slot = match g {
            RowGroup::Main => &mut self.main,
            RowGroup::Cached => &mut self.cached,
        };
        slot.get_or_insert_with(|| RowGroupData::new_empty(&self.spec, g))
    }

    /// 整组删除（main 或 cached）
    pub fn drop_group(&mut self, g: RowGroup) {
        match g {
            RowGroup::Main => self.main = None,
            RowGroup::Cached => self.cached = None,
        }
    }

    /// 关闭：写模式下序列化并以"临时文件 + rename"提交；读模式为空操作
    pub fn close(self) -> Result<()> {
        if self.mode == OpenMode::Read {
            return Ok(());
        }
        let mut body = Vec::new();
        let groups: Vec<(u8, &RowGroupData)> = [(0u8, self.main.as_ref()), (1u8, self.cached.as_ref())]
            .into_iter()
            .filter_map(|(tag, g)| g.map(|g| (tag, g)))
            .collect();
        body.push(groups.len() as u8);
        for (tag, g) in groups {
            encode_group(&mut body, tag, g, &self.spec)?;
        }

        let mut out = Vec::with_capacity(body.len() + 24);
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&VERSION.to_le_bytes());
        out.extend_from_slice(&body);
        out.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
        out.extend_from_slice(MAGIC);

        let fname = self.path.file_name().and_then(|s| s.to_str()).unwrap_or("tablet");
        let tmp = self.path.with_file_name(format!("{fname}.tmp"));
        fs::write(&tmp, &out)?;
        fs::rename(&tmp, &self.path)?;
        debug!("closing tablet {} ({} bytes)", self.path.display(), out.len());
        Ok(())
    }

    // ── 解析 ──────────────────────────────────────────────────────────────────

    fn parse(path: &Path, mode: OpenMode, spec: TabletSpec, data: &[u8]) -> Result<Self> {
        let n = data.len();
        if n < 24 || &data[..8] != MAGIC || &data[n - 8..] != MAGIC {
            return Err(TableError::TabletCorrupt(format!(
                "{}: bad magic", path.display()
            )));
        }
        let version = u32::from_le_bytes(data[8..12].try_into().unwrap());
        if version != VERSION {
            return Err(TableError::TabletCorrupt(format!(
                "{}: unsupported version {version}", path.display()
            )));
        }
        let body = &data[12..n - 12];
        let stored_crc = u32::from_le_bytes(data[n - 12..n - 8].try_into().unwrap());
        if crc32fast::hash(body) != stored_crc {
            return Err(TableError::ChecksumMismatch);
        }

        let mut c = Cursor::new(body);
        let ngroups = c.read_u8()?;
        let mut main = None;
        let mut cached = None;
        for _ in 0..ngroups {
            let (tag, g) = decode_group(&mut c)?;
            match tag {
                0 => main = Some(g),
                1 => cached = Some(g),
                t => {
                    return Err(TableError::TabletCorrupt(format!(
                        "{}: unknown row-group tag {t}", path.display()
                    )))
                }
            }
        }
        Ok(Self { path: path.to_path_buf(), mode, spec, main, cached })
    }
}

// ── 组编解码 ──────────────────────────────────────────────────────────────────

fn write_name(out: &mut Vec<u8>, name: &str) {
    out.extend_from_slice(&(name.len() as u16).to_le_bytes());
    out.extend_from_slice(name.as_bytes());
}

fn read_name(c: &mut Cursor<&[u8]>) -> Result<String> {
    let len = c.read_u16::<LE>()? as usize;
    let mut buf = vec![0u8; len];
    c.read_exact(&mut buf)?;
    String::from_utf8(buf)
        .map_err(|_| TableError::TabletCorrupt("non-utf8 column name".into()))
}

fn write_payload(out: &mut Vec<u8>, raw: &[u8], codec: CompLib) -> Result<()> {
    let stored = compression::compress(raw, codec)?;
    out.push(codec.tag());
    out.extend_from_slice(&(raw.len() as u32).to_le_bytes());
    out.extend_from_slice(&(stored.len() as u32).to_le_bytes());
    out.extend_from_slice(&stored);
    Ok(())
}

fn read_payload(c: &mut Cursor<&[u8]>) -> Result<Vec<u8>> {
    let codec = CompLib::from_tag(c.read_u8()?)?;
    let raw_len = c.read_u32::<LE>()? as usize;
    let stored_len = c.read_u32::<LE>()? as usize;
    let mut buf = vec![0u8; stored_len];
    c.read_exact(&mut buf)?;
    compression::decompress(&buf, codec, raw_len)
}

fn encode_group(out: &mut Vec<u8>, tag: u8, g: &RowGroupData, spec: &TabletSpec) -> Result<()> {
    out.push(tag);
    out.extend_from_slice(&(g.table.len() as u64).to_le_bytes());
    match g.seq {
        Some(s) => {
            out.push(1);
            out.extend_from_slice(&s.to_le_bytes());
        }
        None => out.push(0),
    }

    out.extend_from_slice(&(g.table.ncols() as u16).to_le_bytes());
    for (name, col) in g.table.columns() {
        write_name(out, name);
        out.push(col.dtype().tag());
        let mut raw = Vec::new();
        col.encode(&mut raw);
        write_payload(out, &raw, spec.filters.complib)?;
    }

    out.extend_from_slice(&(g.blobs.len() as u16).to_le_bytes());
    for (name, va) in &g.blobs {
        write_name(out, name);
        match va.kind() {
            BlobKind::Object => out.push(0),
            BlobKind::Typed(dt) => {
                out.push(1);
                out.push(dt.tag());
            }
        }
        let mut raw = Vec::new();
        va.encode_entries(&mut raw);
        write_payload(out, &raw, spec.blob_filters(name))?;
    }
    Ok(())
}

fn decode_group(c: &mut Cursor<&[u8]>) -> Result<(u8, RowGroupData)> {
    let tag = c.read_u8()?;
    let nrows = c.read_u64::<LE>()? as usize;
    let seq = match c.read_u8()? {
        0 => None,
        _ => Some(c.read_u64::<LE>()?),
    };

    let ncols = c.read_u16::<LE>()?;
    let mut table = ColumnBatch::new();
    for _ in 0..ncols {
        let name = read_name(c)?;
        let dtype = DataType::from_tag(c.read_u8()?)?;
        let raw = read_payload(c)?;
        let col = ColumnData::decode(dtype, nrows, &raw)?;
        table.add_column(&name, col)?;
    }
    if table.ncols() > 0 && table.len() != nrows {
        return Err(TableError::TabletCorrupt("row-count mismatch in row group".into()));
    }

    let nblobs = c.read_u16::<LE>()?;
    let mut blobs = Vec::with_capacity(nblobs as usize);
    for _ in 0..nblobs {
        let name = read_name(c)?;
        let kind = match c.read_u8()? {
            0 => BlobKind::Object,
            _ => BlobKind::Typed(DataType::from_tag(c.read_u8()?)?),
        };
        let raw = read_payload(c)?;
        blobs.push((name, VlArray::decode_entries(kind, &raw)?));
    }

    Ok((tag, RowGroupData { table, seq, blobs }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::tempdir;
    use crate::common::Blob;

    fn spec() -> TabletSpec {
        TabletSpec {
            columns: vec![
                ("id".into(), DataType::U8),
                ("ra".into(), DataType::F8),
                ("hdr".into(), DataType::I8),
            ],
            blobs: vec![("hdr".into(), BlobKind::Object, Filters::default())],
            filters: Filters { complib: CompLib::Lz4, complevel: None },
            seq_column: Some("id".into()),
        }
    }

    #[test]
    fn write_open_allocates_main_eagerly() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("042/064/static/stars.astrometry.h5");

        let tab = Tablet::open(&path, OpenMode::Write, &spec()).unwrap();
        let g = tab.group(RowGroup::Main).unwrap();
        assert_eq!(g.nrows(), 0);
        assert_eq!(g.seq, Some(1));
        assert_eq!(g.blob_array("hdr").unwrap().len(), 1);
        assert!(!tab.has_group(RowGroup::Cached));
        tab.close().unwrap();
        assert!(path.is_file());
    }

    #[test]
    fn file_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("stars.astrometry.h5");

        let mut tab = Tablet::open(&path, OpenMode::Write, &spec()).unwrap();
        {
            let g = tab.group_mut(RowGroup::Main);
            g.seq = Some(3);
            let shared: Blob = Some(Arc::new(b"header".to_vec()));
            let refs = g.blob_array_mut("hdr").unwrap().append_unique(&[shared.clone(), shared]);
            let mut rows = ColumnBatch::new();
            rows.add_column("id", ColumnData::U8(vec![1, 2])).unwrap();
            rows.add_column("ra", ColumnData::F8(vec![0.5, 1.5])).unwrap();
            rows.add_column("hdr", ColumnData::I8(refs)).unwrap();
            g.table.append(&rows).unwrap();
        }
        {
            let g = tab.group_mut(RowGroup::Cached);
            assert_eq!(g.seq, None); // cached 行组没有序列
            g.table.resize(1);
        }
        tab.close().unwrap();

        let back = Tablet::open(&path, OpenMode::Read, &spec()).unwrap();
        let g = back.group(RowGroup::Main).unwrap();
        assert_eq!(g.nrows(), 2);
        assert_eq!(g.seq, Some(3));
        assert_eq!(g.table.column("id").unwrap().as_u64().unwrap(), &[1, 2]);
        assert_eq!(g.table.column("hdr").unwrap().as_i64().unwrap(), &[1, 1]);
        assert_eq!(g.blob_array("hdr").unwrap().len(), 2);
        assert_eq!(back.group(RowGroup::Cached).unwrap().nrows(), 1);
    }

    #[test]
    fn read_missing_file_is_an_error() {
        let dir = tempdir().unwrap();
        assert!(Tablet::open(&dir.path().join("nope.h5"), OpenMode::Read, &spec()).is_err());
    }

    #[test]
    fn corrupt_body_is_detected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("stars.astrometry.h5");
        Tablet::open(&path, OpenMode::Write, &spec()).unwrap().close().unwrap();

        let mut data = fs::read(&path).unwrap();
        let mid = data.len() / 2;
        data[mid] ^= 0xFF;
        fs::write(&path, &data).unwrap();
        assert!(matches!(
            Tablet::open(&path, OpenMode::Read, &spec()),
            Err(TableError::ChecksumMismatch) | Err(TableError::TabletCorrupt(_))
        ));
    }

    #[test]
    fn drop_group_removes_it() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("stars.astrometry.h5");

        let mut tab = Tablet::open(&path, OpenMode::Write, &spec()).unwrap();
        tab.group_mut(RowGroup::Cached).table.resize(2);
        tab.close().unwrap();

        let mut tab = Tablet::open(&path, OpenMode::Write, &spec()).unwrap();
        tab.drop_group(RowGroup::Cached);
        tab.close().unwrap();

        let back = Tablet::open(&path, OpenMode::Read, &spec()).unwrap();
        assert!(!back.has_group(RowGroup::Cached));
        assert!(back.has_group(RowGroup::Main));
    }
}

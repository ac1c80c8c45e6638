//! Cell 树缓存：哪些 cell 拥有主 cgroup tablet，以及范围查询
//!
//! 缓存持久化在表根目录的 `tablet_tree.pkl`；仅当其 mtime 比
//! `schema.cfg` 新时才作为权威加载，否则由表层扫描 tablet 目录重建。

use std::collections::BTreeMap;
use std::fs;
use std::io::Cursor;
use std::path::Path;

use byteorder::{LittleEndian as LE, ReadBytesExt};

use crate::common::{CellId, Result, TableError};
use crate::pixelization::Pixelization;

/// 缓存文件名
pub const TREE_FILE: &str = "tablet_tree.pkl";

const MAGIC: &[u8; 8] = b"SVTTREE\0";
const VERSION: u32 = 1;

// ── 查询边界 ──────────────────────────────────────────────────────────────────

/// 经纬度轴对齐矩形（度）
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SkyRect {
    pub lon: (f64, f64),
    pub lat: (f64, f64),
}

impl SkyRect {
    pub fn new(lon: (f64, f64), lat: (f64, f64)) -> Self {
        Self { lon, lat }
    }

    pub fn all_sky() -> Self {
        Self { lon: (0.0, 360.0), lat: (-90.0, 90.0) }
    }

    fn intersect(&self, o: &SkyRect) -> Option<SkyRect> {
        let lon = (self.lon.0.max(o.lon.0), self.lon.1.min(o.lon.1));
        let lat = (self.lat.0.max(o.lat.0), self.lat.1.min(o.lat.1));
        (lon.0 < lon.1 && lat.0 < lat.1).then_some(SkyRect { lon, lat })
    }

    fn contains(&self, o: &SkyRect) -> bool {
        self.lon.0 <= o.lon.0 && o.lon.1 <= self.lon.1
            && self.lat.0 <= o.lat.0 && o.lat.1 <= self.lat.1
    }
}

/// MJD 半开区间 `[t0, t1)` 的集合
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IntervalSet(pub Vec<(f64, f64)>);

impl IntervalSet {
    pub fn new(intervals: Vec<(f64, f64)>) -> Self {
        Self(intervals)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// 与单个区间求交
    fn clip(&self, iv: (f64, f64)) -> IntervalSet {
        IntervalSet(
            self.0.iter()
                .filter_map(|&(a, b)| {
                    let lo = a.max(iv.0);
                    let hi = b.min(iv.1);
                    (lo < hi).then_some((lo, hi))
                })
                .collect(),
        )
    }

    /// 某个区间是否被完整覆盖（单区间包含即可）
    fn covers(&self, iv: (f64, f64)) -> bool {
        self.0.iter().any(|&(a, b)| a <= iv.0 && iv.1 <= b)
    }
}

/// 一组空间/时间约束；None 表示该轴不限
#[derive(Debug, Clone, Default)]
pub struct QueryBounds {
    pub region: Option<SkyRect>,
    pub times: Option<IntervalSet>,
}

/// 查询结果里 cell 与边界的关系
#[derive(Debug, Clone, PartialEq)]
pub enum CellCoverage {
    /// cell 完全落在边界内，无需再裁剪
    Full,
    /// 相交部分（裁剪后的矩形与时间区间）
    Partial(SkyRect, Option<IntervalSet>),
}

// ── 缓存本体 ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CellEntry {
    pub n_main: u64,
    pub n_cached: u64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TabletTree {
    cells: BTreeMap<CellId, CellEntry>,
}

impl TabletTree {
    pub fn from_entries(entries: impl IntoIterator<Item = (CellId, CellEntry)>) -> Self {
        Self { cells: entries.into_iter().collect() }
    }

    pub fn insert(&mut self, cell: CellId, entry: CellEntry) {
        self.cells.insert(cell, entry);
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn entry(&self, cell: CellId) -> Option<CellEntry> {
        self.cells.get(&cell).copied()
    }

    // ── 持久化 ────────────────────────────────────────────────────────────────

    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read(path)?;
        let n = data.len();
        if n < 24 || &data[..8] != MAGIC || &data[n - 8..] != MAGIC {
            return Err(TableError::TabletCorrupt(format!("{}: bad magic", path.display())));
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
        let count = c.read_u64::<LE>()? as usize;
        let mut cells = BTreeMap::new();
        for _ in 0..count {
            let cell = c.read_u64::<LE>()?;
            let n_main = c.read_u64::<LE>()?;
            let n_cached = c.read_u64::<LE>()?;
            cells.insert(cell, CellEntry { n_main, n_cached });
        }
        Ok(Self { cells })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let mut body = Vec::with_capacity(8 + self.cells.len() * 24);
        body.extend_from_slice(&(self.cells.len() as u64).to_le_bytes());
        for (cell, e) in &self.cells {
            body.extend_from_slice(&cell.to_le_bytes());
            body.extend_from_slice(&e.n_main.to_le_bytes());
            body.extend_from_slice(&e.n_cached.to_le_bytes());
        }
        let mut out = Vec::with_capacity(body.len() + 24);
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&VERSION.to_le_bytes());
        out.extend_from_slice(&body);
        out.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
        out.extend_from_slice(MAGIC);
        fs::write(path, out)?;
        Ok(())
    }

    // ── 范围查询 ──────────────────────────────────────────────────────────────

    /// 与边界相交的 cell 列表。`include_cached` 为假时只保留
    /// 拥有 main 行的 cell（排除仅有邻居缓存的）。
    pub fn get_cells(
        &self,
        pix: &Pixelization,
        bounds: Option<&[QueryBounds]>,
        include_cached: bool,
    ) -> Vec<CellId> {
        self.get_cells_with_bounds(pix, bounds, include_cached)
            .into_iter()
            .map(|(cell, _)| cell)
            .collect()
    }

    /// 同 `get_cells`，但带上每个 cell 被裁剪后的边界
    pub fn get_cells_with_bounds(
        &self,
        pix: &Pixelization,
        bounds: Option<&[QueryBounds]>,
        include_cached: bool,
    ) -> Vec<(CellId, CellCoverage)> {
        self.cells.iter()
            .filter(|(_, e)| include_cached || e.n_main > 0)
            .filter_map(|(&cell, _)| {
                coverage(pix, cell, bounds).map(|cov| (cell, cov))
            })
            .collect()
    }
}

fn coverage(
    pix: &Pixelization,
    cell: CellId,
    bounds: Option<&[QueryBounds]>,
) -> Option<CellCoverage> {
    let Some(bounds) = bounds else {
        return Some(CellCoverage::Full);
    };
    let (lon, lat) = pix.cell_rect(cell);
    let rect = SkyRect { lon, lat };
    let cell_iv = pix.cell_interval(cell);

    let mut partial = None;
    for qb in bounds {
        let (clip, full_sky) = match &qb.region {
            None => (rect, true),
            Some(r) => match r.intersect(&rect) {
                None => continue,
                Some(c) => (c, r.contains(&rect)),
            },
        };
        // 静态 cell 汇聚所有历元，不受时间约束限制
        let (tclip, full_time) = match (&qb.times, cell_iv) {
            (None, _) | (_, None) => (None, true),
            (Some(ts), Some(iv)) => {
                let c = ts.clip(iv);
                if c.is_empty() {
                    continue;
                }
                let full = ts.covers(iv);
                (Some(c), full)
            }
        };
        if full_sky && full_time {
            return Some(CellCoverage::Full);
        }
        if partial.is_none() {
            partial = Some(CellCoverage::Partial(clip, tclip));
        }
    }
    partial
}

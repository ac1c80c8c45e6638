//! 天区/时间格网像素化
//!
//! 64 位键布局：
//! ```text
//! ┌──────────────────── cell part (u32) ────────────────────┬─ obj part (u32) ─┐
//! │  x (8 bit)  │  y (8 bit)  │        tidx (16 bit)        │   对象索引 i      │
//! └─────────────┴─────────────┴─────────────────────────────┴──────────────────┘
//! ```
//!
//! - `x`/`y`：经度 [0,360) / 纬度 [-90,90] 上 `2^level` 等分格网的坐标
//! - `tidx`：时间槽，0 = 静态天区，否则 `1 + floor((t - t0) / dt)`
//! - `i`：cell 内对象索引，0 表示"仅指向 cell"

use crate::common::{CellId, ObjId, Result, TableError};

/// 键的 cell part 掩码（高 32 位）
pub const CELL_MASK: u64 = 0xFFFF_FFFF_0000_0000;
/// 键的对象索引掩码（低 32 位）
pub const OBJ_MASK: u64 = 0x0000_0000_FFFF_FFFF;

/// 格网细分层级上限（x/y 各占 8 bit）
pub const MAX_LEVEL: u32 = 8;

/// 默认构造参数：level 7，t0 = MJD 54335（首夜），dt = 1 天
pub const DEFAULT_LEVEL: u32 = 7;
pub const DEFAULT_T0: f64 = 54335.0;
pub const DEFAULT_DT: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pixelization {
    pub level: u32,
    pub t0:    f64,
    pub dt:    f64,
}

impl Default for Pixelization {
    fn default() -> Self {
        Self { level: DEFAULT_LEVEL, t0: DEFAULT_T0, dt: DEFAULT_DT }
    }
}

impl Pixelization {
    pub fn new(level: u32, t0: f64, dt: f64) -> Result<Self> {
        if level == 0 || level > MAX_LEVEL {
            return Err(TableError::Schema(format!(
                "pixelization level must be in 1..={MAX_LEVEL}, got {level}"
            )));
        }
        if !(dt > 0.0) {
            return Err(TableError::Schema(format!("temporal resolution dt must be positive, got {dt}")));
        }
        Ok(Self { level, t0, dt })
    }

    /// 每个轴向的格网数
    pub fn nside(&self) -> u32 { 1 << self.level }

    // ── 键的组装与拆解 ────────────────────────────────────────────────────────

    fn pack(&self, x: u32, y: u32, tidx: u32) -> CellId {
        (((x << 24) | (y << 16) | tidx) as u64) << 32
    }

    /// 拆出 (x, y, tidx, 对象索引)
    pub fn xyti_from_id(&self, id: ObjId) -> (u32, u32, u32, u32) {
        let cell = (id >> 32) as u32;
        (cell >> 24, (cell >> 16) & 0xFF, cell & 0xFFFF, (id & OBJ_MASK) as u32)
    }

    /// 键所属的 cell（对象索引清零）
    pub fn cell_for_id(&self, id: ObjId) -> CellId { id & CELL_MASK }

    /// cell 内第 i 个对象的完整键
    pub fn id_for_cell_i(&self, cell_id: CellId, i: u32) -> ObjId {
        (cell_id & CELL_MASK) | i as u64
    }

    /// 是否为"裸 cell 标识"：对象索引为零且格网坐标合法
    pub fn is_cell_id(&self, id: ObjId) -> bool {
        let (x, y, _, i) = self.xyti_from_id(id);
        i == 0 && x < self.nside() && y < self.nside()
    }

    // ── 位置 → 键 ─────────────────────────────────────────────────────────────

    fn time_slot(&self, t: Option<f64>) -> Result<u32> {
        match t {
            None => Ok(0),
            Some(t) => {
                let slot = ((t - self.t0) / self.dt).floor() as i64 + 1;
                if !(1..=0xFFFF).contains(&slot) {
                    return Err(TableError::TimeOutOfRange(t));
                }
                Ok(slot as u32)
            }
        }
    }

    /// 从 (lon, lat, t?) 计算裸 cell 键（对象索引为零）。
    /// 经度按 360° 回卷，纬度钳到两极。
    pub fn obj_id_from_pos(&self, lon: f64, lat: f64, t: Option<f64>) -> Result<ObjId> {
        let n = self.nside();
        let lon = lon.rem_euclid(360.0);
        let lat = lat.clamp(-90.0, 90.0);
        let x = ((lon / 360.0 * n as f64) as u32).min(n - 1);
        let y = (((lat + 90.0) / 180.0 * n as f64) as u32).min(n - 1);
        Ok(self.pack(x, y, self.time_slot(t)?))
    }

    // ── 时间轴 ────────────────────────────────────────────────────────────────

    pub fn is_temporal_cell(&self, cell_id: CellId) -> bool {
        let (_, _, t, _) = self.xyti_from_id(cell_id);
        t != 0
    }

    /// 对应的静态天区 cell（tidx 清零）
    pub fn static_cell_for_cell(&self, cell_id: CellId) -> CellId {
        cell_id & !0xFFFF_0000_0000u64
    }

    // ── 磁盘路径 ──────────────────────────────────────────────────────────────

    /// cell 的磁盘路径片段：`<x>/<y>/static` 或 `<x>/<y>/t<tidx>`
    pub fn path_to_cell(&self, cell_id: CellId) -> String {
        let (x, y, t, _) = self.xyti_from_id(cell_id);
        if t == 0 {
            format!("{x:03}/{y:03}/static")
        } else {
            format!("{x:03}/{y:03}/t{t}")
        }
    }

    /// `path_to_cell` 的逆映射（cell 树重建扫描用）
    pub fn cell_from_path(&self, rel: &str) -> Option<CellId> {
        let mut parts = rel.split('/');
        let x: u32 = parts.next()?.parse().ok()?;
        let y: u32 = parts.next()?.parse().ok()?;
        let tpart = parts.next()?;
        if parts.next().is_some() {
            return None;
        }
        let t: u32 = if tpart == "static" {
            0
        } else {
            tpart.strip_prefix('t')?.parse().ok()?
        };
        if x >= self.nside() || y >= self.nside() || t > 0xFFFF {
            return None;
        }
        Some(self.pack(x, y, t))
    }

    // ── cell 几何（范围查询用）──────────────────────────────────────────────

    /// cell 的经纬度矩形 `((lon0, lon1), (lat0, lat1))`
    pub fn cell_rect(&self, cell_id: CellId) -> ((f64, f64), (f64, f64)) {
        let (x, y, _, _) = self.xyti_from_id(cell_id);
        let n = self.nside() as f64;
        let dlon = 360.0 / n;
        let dlat = 180.0 / n;
        (
            (x as f64 * dlon, (x + 1) as f64 * dlon),
            (y as f64 * dlat - 90.0, (y + 1) as f64 * dlat - 90.0),
        )
    }

    /// 时态 cell 的 MJD 区间 `[t0, t1)`；静态 cell 返回 None
    pub fn cell_interval(&self, cell_id: CellId) -> Option<(f64, f64)> {
        let (_, _, t, _) = self.xyti_from_id(cell_id);
        if t == 0 {
            return None;
        }
        let lo = self.t0 + (t - 1) as f64 * self.dt;
        Some((lo, lo + self.dt))
    }
}

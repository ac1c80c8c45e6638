//! Table：建表、schema 变更、写入流水线与读取流水线
//!
//! 调用方以列批驱动 `append`：别名解析 → cell 指派 → 轮询加锁 →
//! 逐 cgroup 落盘（含 BLOB 去重与更新合并）→ 释放。读取不加锁，
//! 直接从 tablet 的一致快照取列页，BLOB 按需实例化。

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use log::warn;

use crate::batch::{ColumnBatch, ColumnData, DataType, InsertBatch, InsertColumn};
use crate::blob;
use crate::common::{Blob, CellId, ObjId, Result, RowGroup, TableError};
use crate::lock::{self, CellLock};
use crate::pixelization::{Pixelization, CELL_MASK, OBJ_MASK};
use crate::schema::{self, CGroupDef, FgroupDef, Filters, TableSchema, SCHEMA_FILE};
use crate::tablet::{OpenMode, Tablet, TabletSpec};
use crate::tree::{CellCoverage, QueryBounds, TabletTree, TREE_FILE};

/// 轮询加锁的探测上限；超过视为死锁
const LOCK_SCAN_CAP: usize = 3600;

// ── 追加选项 ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default)]
pub struct AppendOptions {
    pub group: RowGroup,
    /// 强制写入的目标 cell（仅允许与 `group = Cached` 组合，邻居缓存构建用）
    pub cell_id: Option<CellId>,
    /// 按主键合并（仅允许与 `group = Main` 组合）
    pub update: bool,
}

impl AppendOptions {
    /// 邻居缓存写入：全部行强制进指定 cell
    pub fn cached_into(cell_id: CellId) -> Self {
        Self { group: RowGroup::Cached, cell_id: Some(cell_id), update: false }
    }

    /// 按主键 upsert
    pub fn update() -> Self {
        Self { update: true, ..Self::default() }
    }
}

// ── 更新计划 ──────────────────────────────────────────────────────────────────

// 在主 cgroup（schema 序首位）上算出，同一 cell 的其余 cgroup 复用
enum WritePlan {
    /// 纯追加 nnew 行
    Append { nnew: usize },
    /// 混合覆盖：idx[k] 为第 k 个输入行的目标行号，nnew 为其中的新增数
    Overlay { idx: Vec<usize>, nnew: usize, nrows: usize },
}

impl WritePlan {
    fn nnew(&self) -> usize {
        match self {
            Self::Append { nnew } => *nnew,
            Self::Overlay { nnew, .. } => *nnew,
        }
    }
}

// ── Table ─────────────────────────────────────────────────────────────────────

/// 一张按天区（可选时间轴）分片的表
pub struct Table {
    path: PathBuf,
    pub schema: TableSchema,
    pix: Pixelization,
    tree: Option<TabletTree>,
}

impl Table {
    // ── 构造 ──────────────────────────────────────────────────────────────────

    /// 建一张空表并写出初始 schema.cfg。目标目录已有表时报错。
    pub fn create(path: impl AsRef<Path>, name: &str, pix: Pixelization) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        fs::create_dir_all(&path)?;
        let cfg = path.join(SCHEMA_FILE);
        if cfg.is_file() {
            return Err(TableError::Schema(format!(
                "creating a table in {} would overwrite an existing one", path.display()
            )));
        }
        let schema = TableSchema::new(name, pix.level, pix.t0, pix.dt);
        schema.store(&cfg)?;
        Self::open(path)
    }

    /// 打开既有表（目录必须存在且含 schema.cfg）
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if !path.is_dir() {
            return Err(TableError::TableNotFound(format!(
                "\"{}\" is inexistent or not readable", path.display()
            )));
        }
        let cfg = path.join(SCHEMA_FILE);
        let schema = TableSchema::load(&cfg)?;
        let pix = Pixelization::new(schema.level, schema.t0, schema.dt)?;

        // cell 树缓存仅当比 schema.cfg 新时才加载
        let treep = path.join(TREE_FILE);
        let tree = match (fs::metadata(&treep), fs::metadata(&cfg)) {
            (Ok(mt), Ok(ms)) => match (mt.modified(), ms.modified()) {
                (Ok(t), Ok(s)) if t > s => TabletTree::load(&treep).ok(),
                _ => None,
            },
            _ => None,
        };

        Ok(Self { path, schema, pix, tree })
    }

    pub fn name(&self) -> &str {
        &self.schema.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn pixelization(&self) -> &Pixelization {
        &self.pix
    }

    /// 行计数缓存（append 在内存中推进）
    pub fn nrows(&self) -> u64 {
        self.schema.nrows
    }

    // ── 路径 ──────────────────────────────────────────────────────────────────

    fn tablets_root(&self) -> PathBuf {
        self.path.join("tablets")
    }

    fn tablet_filename(&self, cgroup: &str) -> String {
        format!("{}.{}.h5", self.schema.name, cgroup)
    }

    fn tablet_file(&self, cell_id: CellId, cgroup: &str) -> PathBuf {
        self.tablets_root()
            .join(self.pix.path_to_cell(cell_id))
            .join(self.tablet_filename(cgroup))
    }

    // cell 的唯一前缀：锁文件名由此派生
    fn lock_path(&self, cell_id: CellId) -> PathBuf {
        self.tablets_root()
            .join(self.pix.path_to_cell(cell_id))
            .join(format!("{}.lock", self.schema.name))
    }

    /// tablet 是否存在。伪 cgroup 或 None 回落到主 cgroup。
    pub fn tablet_exists(&self, cell_id: CellId, cgroup: Option<&str>) -> bool {
        let cg = match cgroup {
            Some(c) if !schema::is_pseudo_cgroup(c) => c.to_string(),
            _ => match &self.schema.primary_cgroup {
                Some(p) => p.clone(),
                None => return false,
            },
        };
        self.tablet_file(cell_id, &cg).is_file()
    }

    /// 时态 cell 无数据时回落到对应的静态 cell（静态-时态 JOIN 用）
    pub fn static_if_no_temporal(&self, cell_id: CellId) -> CellId {
        if !self.pix.is_temporal_cell(cell_id) || self.tablet_exists(cell_id, None) {
            return cell_id;
        }
        self.pix.static_cell_for_cell(cell_id)
    }

    fn tablet_spec(&self, cgroup: &str) -> Result<TabletSpec> {
        let def = self.schema.cgroup(cgroup).ok_or_else(|| {
            TableError::Schema(format!("unknown cgroup \"{cgroup}\""))
        })?;
        let filters = self.schema.effective_filters(cgroup);
        let blobs = def.blobs.as_ref()
            .map(|m| {
                m.iter()
                    .map(|(name, bd)| {
                        (name.clone(), bd.kind, bd.filters.clone().unwrap_or_else(|| filters.clone()))
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(TabletSpec {
            columns: self.schema.cgroup_columns(cgroup)?,
            blobs,
            filters,
            seq_column: def.primary_key.clone(),
        })
    }

    // ── schema 变更（立即落盘）────────────────────────────────────────────────

    fn store_schema(&self) -> Result<()> {
        self.schema.store(&self.path.join(SCHEMA_FILE))
    }

    pub fn create_cgroup(&mut self, name: &str, def: CGroupDef, ignore_if_exists: bool) -> Result<()> {
        self.schema.create_cgroup(name, def, ignore_if_exists)?;
        self.store_schema()
    }

    pub fn define_alias(&mut self, alias: &str, colname: &str) -> Result<()> {
        self.schema.define_alias(alias, colname)?;
        self.store_schema()
    }

    pub fn define_fgroup(&mut self, fgroup: &str, def: FgroupDef) -> Result<()> {
        self.schema.define_fgroup(fgroup, def);
        self.store_schema()
    }

    pub fn set_default_filters(&mut self, filters: Filters) -> Result<()> {
        self.schema.set_default_filters(filters);
        self.store_schema()
    }

    pub fn resolve_alias(&self, name: &str) -> String {
        self.schema.resolve_alias(name)
    }

    // ── 文件组 / URI ─────────────────────────────────────────────────────────

    /// 文件组的落盘目录；组或其 `path` 项缺失时回落到 `files/<fgroup>`
    pub fn fgroup_path(&self, fgroup: &str) -> PathBuf {
        match self.schema.fgroups.get(fgroup).and_then(|d| d.path.as_ref()) {
            Some(p) => PathBuf::from(p),
            None => self.path.join("files").join(fgroup),
        }
    }

    /// 解析 `lsd:<table>:<fgroup>:<path>` URI 为磁盘路径（按过滤器加后缀）
    pub fn resolve_uri(&self, uri: &str) -> Result<PathBuf> {
        let rest = uri.strip_prefix("lsd:").ok_or_else(|| {
            TableError::Schema(format!("not an lsd: URI: \"{uri}\""))
        })?;
        let mut parts = rest.splitn(3, ':');
        let (_tabname, fgroup, fname) = match (parts.next(), parts.next(), parts.next()) {
            (Some(t), Some(g), Some(f)) => (t, g, f),
            _ => return Err(TableError::Schema(format!("malformed lsd: URI: \"{uri}\""))),
        };
        let filter = schema::fgroup_filter(self.schema.fgroups.get(fgroup))?;
        Ok(self.fgroup_path(fgroup).join(format!("{fname}{}", filter.suffix())))
    }

    // ── 锁 ────────────────────────────────────────────────────────────────────

    fn lock_cell(&self, cell_id: CellId, retries: i32) -> Result<CellLock> {
        lock::acquire(&self.lock_path(cell_id), retries)
    }

    /// 从全部非伪 cgroup 的 tablet 里删除指定行组（写锁内）
    pub fn drop_row_group(&mut self, cell_id: CellId, group: RowGroup) -> Result<()> {
        let lock = self.lock_cell(cell_id, -1)?;
        let res = (|| -> Result<()> {
            for cg in self.schema.storage_cgroups() {
                let spec = self.tablet_spec(&cg)?;
                let mut tab = Tablet::open(&self.tablet_file(cell_id, &cg), OpenMode::Write, &spec)?;
                tab.drop_group(group);
                tab.close()?;
            }
            Ok(())
        })();
        let unlocked = lock.release();
        res?;
        unlocked
    }

    // ── 写入流水线 ────────────────────────────────────────────────────────────

    /// 追加（或按主键合并）一批行，返回整批的主键。
    ///
    /// 主键列缺省时自动生成；给定时每个键要么是裸 cell 标识，要么
    /// 需要 `update` 或显式 `cell_id`。多写者通过 cell 锁串行化；
    /// 单个 cell 写失败不回滚已写完的 cell。
    pub fn append(&mut self, batch: InsertBatch, opts: AppendOptions) -> Result<Vec<ObjId>> {
        if opts.update && opts.group == RowGroup::Cached {
            return Err(TableError::KeyContract(
                "update applies to the main row group only".into(),
            ));
        }
        if opts.cell_id.is_some() && opts.group == RowGroup::Main {
            return Err(TableError::KeyContract(
                "an explicit cell_id is allowed only for neighbor-cache writes".into(),
            ));
        }

        // ── 别名解析与入参校验 ──
        let mut cols: Vec<(String, InsertColumn)> = Vec::new();
        for (name, col) in batch.into_cols() {
            let name = self.schema.resolve_alias(&name);
            if cols.iter().any(|(n, _)| *n == name) {
                return Err(TableError::KeyContract(format!(
                    "duplicate input column \"{name}\""
                )));
            }
            cols.push((name, col));
        }
        if cols.is_empty() {
            return Err(TableError::KeyContract("the input batch has no columns".into()));
        }
        let n = cols[0].1.len();
        if cols.iter().any(|(_, c)| c.len() != n) {
            return Err(TableError::KeyContract("input columns differ in length".into()));
        }

        // ── 主键列准备 ──
        let key_name = self.schema.primary_key.clone().ok_or_else(|| {
            TableError::Schema("the table has no primary cgroup / primary key".into())
        })?;
        let kpos = match cols.iter().position(|(cn, _)| *cn == key_name) {
            Some(p) => p,
            None => {
                cols.push((key_name.clone(), InsertColumn::Data(ColumnData::zeros(DataType::U8, n))));
                cols.len() - 1
            }
        };
        {
            let pix = self.pix;
            let keys = key_column_mut(&mut cols, kpos)?;
            let bare: Vec<bool> = keys.iter().map(|&k| pix.is_cell_id(k)).collect();
            if !(bare.iter().all(|&b| b) || opts.update || opts.cell_id.is_some()) {
                return Err(TableError::KeyContract(
                    "if keys are given, they must refer to cells only".into(),
                ));
            }
            // 裸 cell 标识统一清零对象索引
            for (k, is_bare) in keys.iter_mut().zip(bare) {
                if is_bare {
                    *k &= CELL_MASK;
                }
            }
        }

        // ── cell 指派 ──
        let cells: Vec<CellId> = if let Some(cell_id) = opts.cell_id {
            vec![cell_id; n] // 标量广播
        } else {
            let need_any = key_column_mut(&mut cols, kpos)?.iter().any(|&k| k == 0);
            if need_any {
                if opts.group != RowGroup::Main {
                    return Err(TableError::KeyContract(
                        "neighbor-cache writes may not autogenerate keys".into(),
                    ));
                }
                let (lon_name, lat_name) = self.schema.spatial_keys.clone().ok_or_else(|| {
                    TableError::Schema("the table must have spatial keys".into())
                })?;
                let lon = f64_column(&cols, &lon_name)?;
                let lat = f64_column(&cols, &lat_name)?;
                let t = match self.schema.temporal_key.clone() {
                    Some(tn) => Some(f64_column(&cols, &tn)?),
                    None => None,
                };
                let keys = key_column_mut(&mut cols, kpos)?;
                for i in 0..n {
                    if keys[i] == 0 {
                        keys[i] = self.pix.obj_id_from_pos(lon[i], lat[i], t.as_ref().map(|t| t[i]))?;
                    }
                }
            }
            let keys = key_column_mut(&mut cols, kpos)?;
            keys.iter().map(|&k| self.pix.cell_for_id(k)).collect()
        };

        // ── 轮询加锁，逐 cell 写入 ──
        let mut unique: Vec<CellId> = Vec::new();
        for &c in &cells {
            if !unique.contains(&c) {
                unique.push(c);
            }
        }
        let mut ntot = 0usize;
        while !unique.is_empty() {
            let mut locked = None;
            for k in 0..LOCK_SCAN_CAP {
                let i = k % unique.len();
                match self.lock_cell(unique[i], 0) {
                    Ok(l) => {
                        locked = Some((i, l));
                        break;
                    }
                    Err(TableError::LockContention(_)) => {
                        thread::sleep(Duration::from_millis(1));
                    }
                    Err(e) => return Err(e),
                }
            }
            let (i, lock) = locked.ok_or_else(|| {
                TableError::LockContention("appear to be stuck on a lock file".into())
            })?;
            let cell = unique.remove(i);

            let incell: Vec<bool> = cells.iter().map(|&c| c == cell).collect();
            let res = self.write_cell(cell, &incell, &mut cols, kpos, &opts);
            let unlocked = lock.release();
            let nnew = res?; // 失败即止：已写完的 cell 保持已写状态
            unlocked?;
            self.schema.nrows += nnew as u64;
            ntot += nnew;
        }

        // ── 后置校验 ──
        let keys = key_column_mut(&mut cols, kpos)?.clone();
        if !opts.update && ntot != n {
            return Err(TableError::KeyContract(format!(
                "appended {ntot} rows out of {n}"
            )));
        }
        let mut sorted = keys.clone();
        sorted.sort_unstable();
        sorted.dedup();
        if sorted.len() != keys.len() {
            return Err(TableError::KeyContract(
                "duplicate primary keys within the batch".into(),
            ));
        }
        Ok(keys)
    }

    /// 当前已加锁 cell 的写入：逐 cgroup 投影、补键、合并、落盘
    fn write_cell(
        &self,
        cell: CellId,
        incell: &[bool],
        cols: &mut [(String, InsertColumn)],
        kpos: usize,
        opts: &AppendOptions,
    ) -> Result<usize> {
        let rowidx: Vec<usize> = incell.iter().enumerate()
            .filter(|(_, m)| **m)
            .map(|(i, _)| i)
            .collect();
        let key_name = cols[kpos].0.clone();
        let cgroups = self.schema.storage_cgroups();
        let mut plan = WritePlan::Append { nnew: rowidx.len() };

        for (gi, cg) in cgroups.iter().enumerate() {
            let spec = self.tablet_spec(cg)?;
            let fname = self.tablet_file(cell, cg);
            let mut tab = Tablet::open(&fname, OpenMode::Write, &spec)?;

            // ── 投影：本 cell 的行 × 本 cgroup 的列 ──
            let mut cols_t: Vec<(String, ColumnData)> = Vec::new();
            let mut cols_b: Vec<(String, Vec<Blob>)> = Vec::new();
            for (cname, dtype) in &spec.columns {
                let Some((_, input)) = cols.iter().find(|(cn, _)| cn == cname) else {
                    continue;
                };
                let is_blob = spec.blobs.iter().any(|(bn, _, _)| bn == cname);
                match (input, is_blob) {
                    (InsertColumn::Data(d), false) => {
                        if d.dtype() != *dtype {
                            return Err(TableError::KeyContract(format!(
                                "column \"{cname}\": expected {dtype}, got {}", d.dtype()
                            )));
                        }
                        cols_t.push((cname.clone(), d.mask(incell)));
                    }
                    (InsertColumn::Blobs(v), true) => {
                        let masked = v.iter().zip(incell)
                            .filter(|(_, m)| **m)
                            .map(|(b, _)| b.clone())
                            .collect();
                        cols_b.push((cname.clone(), masked));
                    }
                    (InsertColumn::Blobs(_), false) => {
                        return Err(TableError::KeyContract(format!(
                            "column \"{cname}\" is not a BLOB column"
                        )))
                    }
                    (InsertColumn::Data(_), true) => {
                        return Err(TableError::KeyContract(format!(
                            "BLOB column \"{cname}\" must be passed as blob values"
                        )))
                    }
                }
            }

            // ── 主 cgroup：序列推进、键补全、更新计划 ──
            if gi == 0 {
                {
                    let g = tab.group_mut(opts.group);
                    let nrows = g.table.len();
                    let kt = cols_t.iter_mut()
                        .find(|(cn, _)| *cn == key_name)
                        .and_then(|(_, c)| c.as_u64_mut())
                        .ok_or_else(|| {
                            TableError::Schema("the primary key column is missing from the primary cgroup".into())
                        })?;

                    if opts.group == RowGroup::Main {
                        // 序列永远领先于任何已有或本批写入的对象索引
                        let maxi = kt.iter().map(|&k| k & OBJ_MASK).max().unwrap_or(0);
                        let mut seq = g.seq.unwrap_or(1).max(maxi + 1);
                        if kt.iter().any(|&k| k & OBJ_MASK == 0) {
                            if opts.cell_id.is_some() {
                                return Err(TableError::KeyContract(
                                    "autogenerated keys cannot be combined with an explicit cell_id".into(),
                                ));
                            }
                            for k in kt.iter_mut() {
                                if *k & OBJ_MASK == 0 {
                                    *k = (cell & CELL_MASK) | seq;
                                    seq += 1;
                                }
                            }
                        }
                        g.seq = Some(seq);
                    } else if kt.iter().any(|&k| k & OBJ_MASK == 0) {
                        return Err(TableError::KeyContract(
                            "neighbor-cache rows must carry fully formed keys".into(),
                        ));
                    }

                    plan = if opts.update {
                        let existing = g.table.column(&key_name)
                            .and_then(|c| c.as_u64())
                            .unwrap_or(&[]);
                        compute_plan(existing, kt, nrows)
                    } else {
                        WritePlan::Append { nnew: kt.len() }
                    };
                }
                // 补全后的键写回调用方的主键列
                let kt: Vec<u64> = cols_t.iter()
                    .find(|(cn, _)| *cn == key_name)
                    .and_then(|(_, c)| c.as_u64())
                    .unwrap_or(&[])
                    .to_vec();
                let caller_keys = key_column_mut(cols, kpos)?;
                for (k, &orig) in rowidx.iter().enumerate() {
                    caller_keys[orig] = kt[k];
                }
            }

            // ── 行缓冲构造 ──
            let overlay = matches!(&plan, WritePlan::Overlay { .. }) && opts.update;
            let mut rows;
            let mut idx_opt: Option<Vec<usize>> = None;
            if overlay {
                let WritePlan::Overlay { idx, nnew, nrows } = &plan else { unreachable!() };
                {
                    let g = tab.group_mut(opts.group);
                    if g.table.len() != *nrows {
                        return Err(TableError::TabletCorrupt(format!(
                            "row-count skew between cgroups in cell {cell:#018x}"
                        )));
                    }
                    // 读旧行并清空行表；BLOB 列整体取回、合并、截断到哨兵
                    rows = g.table.clone();
                    g.table.clear();
                    for (bname, bvals) in cols_b.iter_mut() {
                        let refs = rows.column(bname)
                            .and_then(|c| c.as_i64())
                            .ok_or_else(|| {
                                TableError::TabletCorrupt(format!("blob column \"{bname}\" missing"))
                            })?
                            .to_vec();
                        let va = g.blob_array_mut(bname).ok_or_else(|| {
                            TableError::TabletCorrupt(format!("blob array \"{bname}\" missing"))
                        })?;
                        let mut bb = va.load_refs(&refs)?;
                        bb.resize(nrows + nnew, None);
                        for (k, &j) in idx.iter().enumerate() {
                            bb[j] = bvals[k].clone();
                        }
                        *bvals = bb;
                        va.truncate(1);
                    }
                    rows.resize(nrows + nnew);
                }
                // 截断之后必须换一个新句柄再填回
                tab.close()?;
                tab = Tablet::open(&fname, OpenMode::Write, &spec)?;
                idx_opt = Some(idx.clone());
            } else {
                rows = ColumnBatch::zeros_with(&spec.columns, rowidx.len());
            }

            // ── 列拷贝与 BLOB 落盘 ──
            {
                let g = tab.group_mut(opts.group);
                for (cname, data) in &cols_t {
                    let dst = rows.column_mut(cname).ok_or_else(|| {
                        TableError::Schema(format!("column \"{cname}\" absent from the row buffer"))
                    })?;
                    match &idx_opt {
                        Some(idx) => dst.overlay(idx, data)?,
                        None => *dst = data.clone(),
                    }
                }
                for (bname, bvals) in &cols_b {
                    let va = g.blob_array_mut(bname).ok_or_else(|| {
                        TableError::TabletCorrupt(format!("blob array \"{bname}\" missing"))
                    })?;
                    let refs = va.append_unique(bvals);
                    let dst = rows.column_mut(bname).ok_or_else(|| {
                        TableError::Schema(format!("column \"{bname}\" absent from the row buffer"))
                    })?;
                    *dst = ColumnData::I8(refs);
                }
                g.table.append(&rows)?;
            }
            tab.close()?;
        }

        Ok(plan.nnew())
    }

    // ── 读取流水线 ────────────────────────────────────────────────────────────

    /// 读取一个 tablet 的全部行。`cgroup = None` 取主 cgroup；
    /// 伪 cgroup 走合成路径；tablet 不存在时返回同构空批。
    /// `include_cached` 时把邻居缓存行拼在 main 之后，其 BLOB 引用取负。
    pub fn fetch_tablet(
        &self,
        cell_id: CellId,
        cgroup: Option<&str>,
        include_cached: bool,
    ) -> Result<ColumnBatch> {
        let cg = match cgroup {
            Some(c) => c.to_string(),
            None => self.schema.primary_cgroup.clone().ok_or_else(|| {
                TableError::Schema("the table has no primary cgroup".into())
            })?,
        };
        let cell_id = self.static_if_no_temporal(cell_id);

        if schema::is_pseudo_cgroup(&cg) {
            return self.fetch_pseudotablet(cell_id, &cg, include_cached);
        }

        let spec = self.tablet_spec(&cg)?;
        if !self.tablet_exists(cell_id, Some(&cg)) {
            return Ok(ColumnBatch::empty_with(&spec.columns));
        }

        let tab = Tablet::open(&self.tablet_file(cell_id, &cg), OpenMode::Read, &spec)?;
        let mut rows = match tab.group(RowGroup::Main) {
            Some(g) => g.table.clone(),
            None => ColumnBatch::empty_with(&spec.columns),
        };
        if include_cached {
            if let Some(g) = tab.group(RowGroup::Cached) {
                let mut cached_rows = g.table.clone();
                for (bname, _, _) in &spec.blobs {
                    if let Some(col) = cached_rows.column_mut(bname) {
                        col.negate_refs();
                    }
                }
                rows.append(&cached_rows)?;
            }
        }
        Ok(rows)
    }

    /// 按引用实例化 BLOB。负引用走 `cached/blobs/<col>`（取 `-ref`）。
    pub fn fetch_blobs(
        &self,
        cell_id: CellId,
        column: &str,
        refs: &[i64],
        include_cached: bool,
    ) -> Result<Vec<Blob>> {
        if refs.is_empty() {
            return Ok(Vec::new());
        }
        let colname = self.schema.resolve_alias(column);
        let col = self.schema.column(&colname).ok_or_else(|| {
            TableError::ColumnNotFound(colname.clone())
        })?;
        if !col.is_blob {
            return Err(TableError::Schema(format!(
                "column \"{colname}\" is not a BLOB column"
            )));
        }
        let cg = col.cgroup.clone();
        let cell_id = self.static_if_no_temporal(cell_id);

        let spec = self.tablet_spec(&cg)?;
        let tab = Tablet::open(&self.tablet_file(cell_id, &cg), OpenMode::Read, &spec)?;
        let main = tab.group(RowGroup::Main)
            .and_then(|g| g.blob_array(&colname))
            .ok_or_else(|| {
                TableError::TabletCorrupt(format!("blob array \"{colname}\" missing"))
            })?;
        if include_cached {
            let cached = tab.group(RowGroup::Cached).and_then(|g| g.blob_array(&colname));
            blob::load_refs_signed(main, cached, refs)
        } else {
            main.load_refs(refs)
        }
    }

    /// 伪 tablet 合成：`_CACHED` / `_ROWIDX` / `_ROWID`
    fn fetch_pseudotablet(
        &self,
        cell_id: CellId,
        cgroup: &str,
        include_cached: bool,
    ) -> Result<ColumnBatch> {
        if cgroup != schema::PSEUDO_CGROUP {
            return Err(TableError::Schema(format!("unknown pseudo-cgroup \"{cgroup}\"")));
        }
        let (n_main, n_cached) = match &self.schema.primary_cgroup {
            Some(primary) if self.tablet_exists(cell_id, Some(primary)) => {
                let spec = self.tablet_spec(primary)?;
                let tab = Tablet::open(&self.tablet_file(cell_id, primary), OpenMode::Read, &spec)?;
                (
                    tab.group(RowGroup::Main).map(|g| g.nrows()).unwrap_or(0),
                    if include_cached {
                        tab.group(RowGroup::Cached).map(|g| g.nrows()).unwrap_or(0)
                    } else {
                        0
                    },
                )
            }
            _ => (0, 0),
        };
        let n = n_main + n_cached;

        let mut cached = vec![false; n];
        cached[n_main..].fill(true);
        let rowidx: Vec<u64> = (0..n as u64).collect();
        let rowid: Vec<u64> = rowidx.iter()
            .map(|&i| self.pix.id_for_cell_i(cell_id, i as u32))
            .collect();

        let mut batch = ColumnBatch::new();
        batch.add_column("_CACHED", ColumnData::Bool(cached))?;
        batch.add_column("_ROWIDX", ColumnData::U8(rowidx))?;
        batch.add_column("_ROWID", ColumnData::U8(rowid))?;
        Ok(batch)
    }

    // ── cell 枚举 ─────────────────────────────────────────────────────────────

    /// 与边界相交的 cell 列表（cell 树缓存加速，必要时重建）
    pub fn get_cells(
        &mut self,
        bounds: Option<&[QueryBounds]>,
        include_cached: bool,
    ) -> Result<Vec<CellId>> {
        let pix = self.pix;
        Ok(self.ensure_tree()?.get_cells(&pix, bounds, include_cached))
    }

    /// 同 `get_cells`，带每个 cell 裁剪后的边界
    pub fn get_cells_with_bounds(
        &mut self,
        bounds: Option<&[QueryBounds]>,
        include_cached: bool,
    ) -> Result<Vec<(CellId, CellCoverage)>> {
        let pix = self.pix;
        Ok(self.ensure_tree()?.get_cells_with_bounds(&pix, bounds, include_cached))
    }

    fn ensure_tree(&mut self) -> Result<&TabletTree> {
        if self.tree.is_none() {
            warn!("no up-to-date tablet tree cache for table {}; rebuilding", self.schema.name);
            let tree = self.rebuild_tree()?;
            tree.save(&self.path.join(TREE_FILE))?;
            self.tree = Some(tree);
        }
        Ok(self.tree.as_ref().unwrap())
    }

    /// 扫描主 cgroup 的 tablet 目录重建 cell 树
    fn rebuild_tree(&self) -> Result<TabletTree> {
        let mut tree = TabletTree::default();
        let Some(primary) = self.schema.primary_cgroup.clone() else {
            return Ok(tree);
        };
        let root = self.tablets_root();
        if !root.is_dir() {
            return Ok(tree);
        }
        let pattern = self.tablet_filename(&primary);
        let spec = self.tablet_spec(&primary)?;

        let mut stack = vec![root.clone()];
        while let Some(dir) = stack.pop() {
            for entry in fs::read_dir(&dir)? {
                let entry = entry?;
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                    continue;
                }
                if path.file_name().and_then(|s| s.to_str()) != Some(pattern.as_str()) {
                    continue;
                }
                let rel = dir.strip_prefix(&root)
                    .ok()
                    .and_then(|p| p.to_str())
                    .map(|s| s.replace('\\', "/"));
                let Some(cell) = rel.and_then(|r| self.pix.cell_from_path(&r)) else {
                    continue;
                };
                let tab = Tablet::open(&path, OpenMode::Read, &spec)?;
                tree.insert(cell, crate::tree::CellEntry {
                    n_main: tab.group(RowGroup::Main).map(|g| g.nrows() as u64).unwrap_or(0),
                    n_cached: tab.group(RowGroup::Cached).map(|g| g.nrows() as u64).unwrap_or(0),
                });
            }
        }
        Ok(tree)
    }
}

// ── 辅助 ──────────────────────────────────────────────────────────────────────

fn key_column_mut<'a>(
    cols: &'a mut [(String, InsertColumn)],
    kpos: usize,
) -> Result<&'a mut Vec<u64>> {
    match &mut cols[kpos].1 {
        InsertColumn::Data(d) => d.as_u64_mut().ok_or_else(|| {
            TableError::KeyContract("the primary key column must be u8".into())
        }),
        InsertColumn::Blobs(_) => Err(TableError::KeyContract(
            "the primary key column must be a scalar column".into(),
        )),
    }
}

fn f64_column(cols: &[(String, InsertColumn)], name: &str) -> Result<Vec<f64>> {
    let (_, col) = cols.iter().find(|(cn, _)| cn == name).ok_or_else(|| {
        TableError::KeyContract(format!("the input must contain the key column \"{name}\""))
    })?;
    match col {
        InsertColumn::Data(d) => d.to_f64().ok_or_else(|| {
            TableError::KeyContract(format!("key column \"{name}\" is not numeric"))
        }),
        InsertColumn::Blobs(_) => Err(TableError::KeyContract(format!(
            "key column \"{name}\" is not a scalar column"
        ))),
    }
}

/// 更新时的"查插入点"：按已有主键分类每个输入行是覆盖还是追加
fn compute_plan(existing: &[u64], incoming: &[u64], nrows: usize) -> WritePlan {
    let mut perm: Vec<usize> = (0..existing.len()).collect();
    perm.sort_by_key(|&i| existing[i]);
    let sorted: Vec<u64> = perm.iter().map(|&i| existing[i]).collect();

    // 全部落在已有键之后：纯追加快速路径
    if incoming.iter().all(|k| sorted.partition_point(|x| x < k) == sorted.len()) {
        return WritePlan::Append { nnew: incoming.len() };
    }

    let mut idx = Vec::with_capacity(incoming.len());
    let mut nnew = 0usize;
    for k in incoming {
        let p = sorted.partition_point(|x| x < k);
        if p < sorted.len() && sorted[p] == *k {
            idx.push(perm[p]); // 覆盖：回到未排序的原始行号
        } else {
            idx.push(nrows + nnew); // 追加：依次排在表尾
            nnew += 1;
        }
    }
    WritePlan::Overlay { idx, nnew, nrows }
}

// ── 摘要输出 ──────────────────────────────────────────────────────────────────

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Path:          {}", self.path.display())?;
        writeln!(f, "Partitioning:  level={}", self.pix.level)?;
        writeln!(f, "(t0, dt):      {}, {}", self.pix.t0, self.pix.dt)?;
        writeln!(f, "Objects:       {}", self.schema.nrows)?;
        let names: Vec<&str> = self.schema.cgroup_names().collect();
        writeln!(f, "Column groups: {names:?}")?;
        for cg in names {
            let Some(def) = self.schema.cgroup(cg) else { continue };
            writeln!(f, "{}", "-".repeat(31))?;
            writeln!(f, "Column group '{cg}':")?;
            writeln!(f, "{:>20} {:>10}", "Column", "Type")?;
            for (name, code) in &def.columns {
                writeln!(f, "{name:>20} {code:>10}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::sync::{Arc, Barrier};
    use tempfile::{tempdir, TempDir};
    use crate::pixelization::OBJ_MASK;
    use crate::schema::PSEUDO_CGROUP;
    use crate::tree::{IntervalSet, SkyRect};

    fn astrometry_def() -> CGroupDef {
        CGroupDef {
            columns: vec![
                ("id".into(), "u8".into()),
                ("ra".into(), "f8".into()),
                ("dec".into(), "f8".into()),
                ("hdr".into(), "O8".into()),
            ],
            primary_key: Some("id".into()),
            spatial_keys: Some(("ra".into(), "dec".into())),
            ..Default::default()
        }
    }

    fn stars_table() -> (TempDir, Table) {
        let dir = tempdir().unwrap();
        let mut t = Table::create(dir.path().join("stars"), "stars", Pixelization::default()).unwrap();
        t.create_cgroup("astrometry", astrometry_def(), false).unwrap();
        t.create_cgroup(
            "photometry",
            CGroupDef {
                columns: vec![("mag".into(), "f4".into())],
                ..Default::default()
            },
            false,
        )
        .unwrap();
        (dir, t)
    }

    fn blob(bytes: &[u8]) -> Blob {
        Some(Arc::new(bytes.to_vec()))
    }

    #[test]
    fn create_append_read() {
        let (_dir, mut t) = stars_table();
        let batch = InsertBatch::new()
            .col("ra", ColumnData::F8(vec![0.0, 180.0]))
            .col("dec", ColumnData::F8(vec![0.0, 45.0]))
            .col("mag", ColumnData::F4(vec![17.5, 12.25]));
        let keys = t.append(batch, AppendOptions::default()).unwrap();
        assert_eq!(keys.len(), 2);
        assert_eq!(t.nrows(), 2);

        // 自动生成的键：cell part 与落点一致，对象索引从 1 起
        for (i, &k) in keys.iter().enumerate() {
            assert_eq!(k & OBJ_MASK, 1, "row {i}");
            let cell = t.pixelization().cell_for_id(k);
            let rows = t.fetch_tablet(cell, None, false).unwrap();
            assert_eq!(rows.len(), 1);
            assert_eq!(rows.column("id").unwrap().as_u64().unwrap(), &[k]);
            let mags = t.fetch_tablet(cell, Some("photometry"), false).unwrap();
            assert_eq!(mags.len(), 1);
        }
        let cell0 = t.pixelization().cell_for_id(keys[0]);
        let rows = t.fetch_tablet(cell0, None, false).unwrap();
        assert_eq!(rows.column("ra").unwrap(), &ColumnData::F8(vec![0.0]));
        assert_eq!(rows.column("dec").unwrap(), &ColumnData::F8(vec![0.0]));
    }

    #[test]
    fn sequence_exceeds_stored_obj_parts() {
        let (_dir, mut t) = stars_table();
        let batch = InsertBatch::new()
            .col("ra", ColumnData::F8(vec![5.0, 5.0, 5.0]))
            .col("dec", ColumnData::F8(vec![5.0, 5.0, 5.0]));
        let keys = t.append(batch, AppendOptions::default()).unwrap();
        let cell = t.pixelization().cell_for_id(keys[0]);

        let spec = t.tablet_spec("astrometry").unwrap();
        let tab = Tablet::open(&t.tablet_file(cell, "astrometry"), OpenMode::Read, &spec).unwrap();
        let g = tab.group(RowGroup::Main).unwrap();
        let max_i = g.table.column("id").unwrap().as_u64().unwrap()
            .iter().map(|k| k & OBJ_MASK).max().unwrap();
        assert!(g.seq.unwrap() > max_i);
    }

    #[test]
    fn missing_tablet_reads_empty() {
        let (_dir, t) = stars_table();
        let cell = t.pixelization().obj_id_from_pos(77.0, -50.0, None).unwrap();
        let rows = t.fetch_tablet(cell, None, true).unwrap();
        assert_eq!(rows.len(), 0);
        assert!(rows.column("ra").is_some());
    }

    #[test]
    fn update_overlays_existing_rows() {
        let (_dir, mut t) = stars_table();
        let keys = t.append(
            InsertBatch::new()
                .col("ra", ColumnData::F8(vec![1.0, 1.2]))
                .col("dec", ColumnData::F8(vec![1.0, 1.2])),
            AppendOptions::default(),
        ).unwrap();
        assert_eq!(t.nrows(), 2);

        // 覆盖 k0，同批再新增一行
        let keys2 = t.append(
            InsertBatch::new()
                .col("id", ColumnData::U8(vec![keys[0], 0]))
                .col("ra", ColumnData::F8(vec![10.0, 1.4]))
                .col("dec", ColumnData::F8(vec![10.0, 1.4])),
            AppendOptions::update(),
        ).unwrap();
        assert_eq!(keys2[0], keys[0]);
        assert_eq!(t.nrows(), 3);

        let cell = t.pixelization().cell_for_id(keys[0]);
        let rows = t.fetch_tablet(cell, None, false).unwrap();
        assert_eq!(rows.len(), 3);
        let ids = rows.column("id").unwrap().as_u64().unwrap().to_vec();
        let ras = match rows.column("ra").unwrap() { ColumnData::F8(v) => v.clone(), _ => panic!() };
        let at = ids.iter().position(|&k| k == keys[0]).unwrap();
        assert_eq!(ras[at], 10.0);
        let at1 = ids.iter().position(|&k| k == keys[1]).unwrap();
        assert_eq!(ras[at1], 1.2); // 未触及的行保持原值
    }

    #[test]
    fn update_merges_blob_refs() {
        let (_dir, mut t) = stars_table();
        let keys = t.append(
            InsertBatch::new()
                .col("ra", ColumnData::F8(vec![2.0, 2.1]))
                .col("dec", ColumnData::F8(vec![2.0, 2.1]))
                .blobs("hdr", vec![blob(b"old-a"), blob(b"old-b")]),
            AppendOptions::default(),
        ).unwrap();
        let cell = t.pixelization().cell_for_id(keys[0]);

        t.append(
            InsertBatch::new()
                .col("id", ColumnData::U8(vec![keys[0]]))
                .col("ra", ColumnData::F8(vec![2.05]))
                .col("dec", ColumnData::F8(vec![2.05]))
                .blobs("hdr", vec![blob(b"new-a")]),
            AppendOptions::update(),
        ).unwrap();

        let rows = t.fetch_tablet(cell, None, false).unwrap();
        assert_eq!(rows.len(), 2);
        let ids = rows.column("id").unwrap().as_u64().unwrap().to_vec();
        let refs = rows.column("hdr").unwrap().as_i64().unwrap().to_vec();
        let blobs = t.fetch_blobs(cell, "hdr", &refs, false).unwrap();
        let at0 = ids.iter().position(|&k| k == keys[0]).unwrap();
        let at1 = ids.iter().position(|&k| k == keys[1]).unwrap();
        assert_eq!(blobs[at0].as_ref().unwrap().as_slice(), b"new-a");
        assert_eq!(blobs[at1].as_ref().unwrap().as_slice(), b"old-b");
    }

    #[test]
    fn blob_identity_dedup_across_rows() {
        let (_dir, mut t) = stars_table();
        let shared = blob(b"shared spectrum");
        let keys = t.append(
            InsertBatch::new()
                .col("ra", ColumnData::F8(vec![3.0, 3.0, 3.0]))
                .col("dec", ColumnData::F8(vec![3.0, 3.0, 3.0]))
                .blobs("hdr", vec![shared.clone(), shared.clone(), shared]),
            AppendOptions::default(),
        ).unwrap();
        let cell = t.pixelization().cell_for_id(keys[0]);

        let rows = t.fetch_tablet(cell, None, false).unwrap();
        let refs = rows.column("hdr").unwrap().as_i64().unwrap().to_vec();
        assert_eq!(refs, vec![1, 1, 1]); // 同一标识 → 同一个非哨兵引用

        let spec = t.tablet_spec("astrometry").unwrap();
        let tab = Tablet::open(&t.tablet_file(cell, "astrometry"), OpenMode::Read, &spec).unwrap();
        let va = tab.group(RowGroup::Main).unwrap().blob_array("hdr").unwrap();
        assert_eq!(va.len(), 2); // 哨兵 + 1 个唯一值
    }

    #[test]
    fn cached_rows_read_with_negated_refs() {
        let (_dir, mut t) = stars_table();
        let keys = t.append(
            InsertBatch::new()
                .col("ra", ColumnData::F8(vec![4.0]))
                .col("dec", ColumnData::F8(vec![4.0]))
                .blobs("hdr", vec![blob(b"own")]),
            AppendOptions::default(),
        ).unwrap();
        let cell = t.pixelization().cell_for_id(keys[0]);

        // 邻居 cell 的两行复制进本 cell 的缓存组
        let neighbor = t.pixelization().obj_id_from_pos(40.0, 40.0, None).unwrap();
        let nkeys: Vec<u64> = (1..=2).map(|i| t.pixelization().id_for_cell_i(neighbor, i)).collect();
        t.append(
            InsertBatch::new()
                .col("id", ColumnData::U8(nkeys.clone()))
                .col("ra", ColumnData::F8(vec![40.0, 40.1]))
                .col("dec", ColumnData::F8(vec![40.0, 40.1]))
                .blobs("hdr", vec![blob(b"cache-a"), blob(b"cache-b")]),
            AppendOptions::cached_into(cell),
        ).unwrap();
        assert_eq!(t.nrows(), 3);

        let rows = t.fetch_tablet(cell, None, true).unwrap();
        assert_eq!(rows.len(), 3);
        let refs = rows.column("hdr").unwrap().as_i64().unwrap().to_vec();
        assert!(refs[0] > 0 && refs[1] < 0 && refs[2] < 0);

        let blobs = t.fetch_blobs(cell, "hdr", &refs, true).unwrap();
        assert_eq!(blobs[0].as_ref().unwrap().as_slice(), b"own");
        assert_eq!(blobs[1].as_ref().unwrap().as_slice(), b"cache-a");
        assert_eq!(blobs[2].as_ref().unwrap().as_slice(), b"cache-b");

        // 不带缓存读：只有 main 行
        let rows = t.fetch_tablet(cell, None, false).unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn pseudotablet_synthesis() {
        let (_dir, mut t) = stars_table();
        let keys = t.append(
            InsertBatch::new()
                .col("ra", ColumnData::F8(vec![6.0, 6.0]))
                .col("dec", ColumnData::F8(vec![6.0, 6.0])),
            AppendOptions::default(),
        ).unwrap();
        let cell = t.pixelization().cell_for_id(keys[0]);
        let neighbor = t.pixelization().obj_id_from_pos(60.0, 60.0, None).unwrap();
        t.append(
            InsertBatch::new()
                .col("id", ColumnData::U8(vec![t.pixelization().id_for_cell_i(neighbor, 1)]))
                .col("ra", ColumnData::F8(vec![60.0]))
                .col("dec", ColumnData::F8(vec![60.0])),
            AppendOptions::cached_into(cell),
        ).unwrap();

        let p = t.fetch_tablet(cell, Some(PSEUDO_CGROUP), true).unwrap();
        assert_eq!(p.len(), 3);
        assert_eq!(
            p.column("_CACHED").unwrap(),
            &ColumnData::Bool(vec![false, false, true])
        );
        assert_eq!(p.column("_ROWIDX").unwrap().as_u64().unwrap(), &[0, 1, 2]);
        let rowid = p.column("_ROWID").unwrap().as_u64().unwrap();
        assert_eq!(rowid[2], t.pixelization().id_for_cell_i(cell, 2));

        // 不含缓存：只合成 main 行
        let p = t.fetch_tablet(cell, Some(PSEUDO_CGROUP), false).unwrap();
        assert_eq!(p.len(), 2);
    }

    #[test]
    fn static_fallback_for_empty_temporal_cell() {
        let dir = tempdir().unwrap();
        let mut t = Table::create(dir.path().join("det"), "det", Pixelization::default()).unwrap();
        t.create_cgroup(
            "astrometry",
            CGroupDef {
                columns: vec![
                    ("id".into(), "u8".into()),
                    ("ra".into(), "f8".into()),
                    ("dec".into(), "f8".into()),
                    ("mjd".into(), "f8".into()),
                    ("hdr".into(), "O8".into()),
                ],
                primary_key: Some("id".into()),
                spatial_keys: Some(("ra".into(), "dec".into())),
                temporal_key: Some("mjd".into()),
                ..Default::default()
            },
            false,
        ).unwrap();

        // 把行写进静态 cell（显式裸静态键）
        let pix = *t.pixelization();
        let sc_key = pix.obj_id_from_pos(20.0, 20.0, None).unwrap();
        t.append(
            InsertBatch::new()
                .col("id", ColumnData::U8(vec![sc_key]))
                .col("ra", ColumnData::F8(vec![20.0]))
                .col("dec", ColumnData::F8(vec![20.0]))
                .col("mjd", ColumnData::F8(vec![54340.5]))
                .blobs("hdr", vec![blob(b"static")]),
            AppendOptions::default(),
        ).unwrap();

        // 空的时态 cell 回落到静态 cell
        let tc = pix.cell_for_id(pix.obj_id_from_pos(20.0, 20.0, Some(54340.5)).unwrap());
        assert!(pix.is_temporal_cell(tc));
        assert!(!t.tablet_exists(tc, None));
        let rows = t.fetch_tablet(tc, None, false).unwrap();
        assert_eq!(rows.len(), 1);
        let refs = rows.column("hdr").unwrap().as_i64().unwrap().to_vec();
        let blobs = t.fetch_blobs(tc, "hdr", &refs, false).unwrap();
        assert_eq!(blobs[0].as_ref().unwrap().as_slice(), b"static");
    }

    #[test]
    fn alias_resolution_in_append() {
        let (_dir, mut t) = stars_table();
        let keys = t.append(
            InsertBatch::new()
                .col("_LON", ColumnData::F8(vec![7.0]))
                .col("_LAT", ColumnData::F8(vec![7.0])),
            AppendOptions::default(),
        ).unwrap();
        let cell = t.pixelization().cell_for_id(keys[0]);
        let rows = t.fetch_tablet(cell, None, false).unwrap();
        assert_eq!(rows.column("ra").unwrap(), &ColumnData::F8(vec![7.0]));
    }

    #[test]
    fn key_contract_violations() {
        let (_dir, mut t) = stars_table();
        let pix = *t.pixelization();
        let cell = pix.obj_id_from_pos(8.0, 8.0, None).unwrap();

        // 完整键既无 update 也无 cell_id
        let full = pix.id_for_cell_i(cell, 5);
        let res = t.append(
            InsertBatch::new()
                .col("id", ColumnData::U8(vec![full]))
                .col("ra", ColumnData::F8(vec![8.0]))
                .col("dec", ColumnData::F8(vec![8.0])),
            AppendOptions::default(),
        );
        assert!(matches!(res, Err(TableError::KeyContract(_))));

        // cell_id 只允许配合 cached 组
        let res = t.append(
            InsertBatch::new().col("ra", ColumnData::F8(vec![8.0])).col("dec", ColumnData::F8(vec![8.0])),
            AppendOptions { group: RowGroup::Main, cell_id: Some(cell), update: false },
        );
        assert!(matches!(res, Err(TableError::KeyContract(_))));

        // update 不允许配合 cached 组
        let res = t.append(
            InsertBatch::new().col("ra", ColumnData::F8(vec![8.0])).col("dec", ColumnData::F8(vec![8.0])),
            AppendOptions { group: RowGroup::Cached, cell_id: Some(cell), update: true },
        );
        assert!(matches!(res, Err(TableError::KeyContract(_))));

        // 缓存写入必须带完整键
        let res = t.append(
            InsertBatch::new()
                .col("id", ColumnData::U8(vec![cell]))
                .col("ra", ColumnData::F8(vec![8.0]))
                .col("dec", ColumnData::F8(vec![8.0])),
            AppendOptions::cached_into(cell),
        );
        assert!(matches!(res, Err(TableError::KeyContract(_))));

        // 批内主键重复（update 路径）在写后报错
        let keys = t.append(
            InsertBatch::new().col("ra", ColumnData::F8(vec![8.5])).col("dec", ColumnData::F8(vec![8.5])),
            AppendOptions::default(),
        ).unwrap();
        let res = t.append(
            InsertBatch::new()
                .col("id", ColumnData::U8(vec![keys[0], keys[0]]))
                .col("ra", ColumnData::F8(vec![9.0, 9.1]))
                .col("dec", ColumnData::F8(vec![9.0, 9.1])),
            AppendOptions::update(),
        );
        assert!(matches!(res, Err(TableError::KeyContract(_))));
    }

    #[test]
    fn concurrent_writers_serialize_on_one_cell() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("stars");
        {
            let mut t = Table::create(&path, "stars", Pixelization::default()).unwrap();
            t.create_cgroup("astrometry", astrometry_def(), false).unwrap();
        }

        let barrier = Arc::new(Barrier::new(2));
        let per_thread = 250usize;
        let mut handles = Vec::new();
        for _ in 0..2 {
            let path = path.clone();
            let barrier = barrier.clone();
            handles.push(std::thread::spawn(move || {
                let mut t = Table::open(&path).unwrap();
                barrier.wait();
                t.append(
                    InsertBatch::new()
                        .col("ra", ColumnData::F8(vec![11.0; per_thread]))
                        .col("dec", ColumnData::F8(vec![11.0; per_thread])),
                    AppendOptions::default(),
                ).unwrap()
            }));
        }
        let mut all: Vec<u64> = Vec::new();
        for h in handles {
            all.extend(h.join().unwrap());
        }
        assert_eq!(all.len(), 2 * per_thread);

        let t = Table::open(&path).unwrap();
        let cell = t.pixelization().cell_for_id(all[0]);
        let rows = t.fetch_tablet(cell, None, false).unwrap();
        assert_eq!(rows.len(), 2 * per_thread);
        let distinct: BTreeSet<u64> =
            rows.column("id").unwrap().as_u64().unwrap().iter().copied().collect();
        assert_eq!(distinct.len(), 2 * per_thread);
    }

    #[test]
    fn get_cells_uses_tree_cache() {
        let (_dir, mut t) = stars_table();
        let keys = t.append(
            InsertBatch::new()
                .col("ra", ColumnData::F8(vec![0.5, 200.0]))
                .col("dec", ColumnData::F8(vec![0.5, -40.0])),
            AppendOptions::default(),
        ).unwrap();
        let c1 = t.pixelization().cell_for_id(keys[0]);
        let c2 = t.pixelization().cell_for_id(keys[1]);

        // 只有邻居缓存数据的 cell
        let c3 = t.pixelization().obj_id_from_pos(100.0, 5.0, None).unwrap();
        let neighbor = t.pixelization().obj_id_from_pos(101.0, 5.0, None).unwrap();
        t.append(
            InsertBatch::new()
                .col("id", ColumnData::U8(vec![t.pixelization().id_for_cell_i(neighbor, 1)]))
                .col("ra", ColumnData::F8(vec![101.0]))
                .col("dec", ColumnData::F8(vec![5.0])),
            AppendOptions::cached_into(c3),
        ).unwrap();

        let mut all = t.get_cells(None, true).unwrap();
        all.sort_unstable();
        let mut expect = vec![c1, c2, c3];
        expect.sort_unstable();
        assert_eq!(all, expect);

        // 排除仅缓存的 cell
        let owned = t.get_cells(None, false).unwrap();
        assert!(owned.contains(&c1) && owned.contains(&c2) && !owned.contains(&c3));

        // 空间约束只命中 c1
        let (lon, lat) = t.pixelization().cell_rect(c1);
        let qb = QueryBounds {
            region: Some(SkyRect::new(lon, lat)),
            times: Some(IntervalSet::new(vec![(54335.0, 54336.0)])),
        };
        let hits = t.get_cells_with_bounds(Some(&[qb]), true).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, c1);
        assert_eq!(hits[0].1, CellCoverage::Full);

        // 缓存文件已生成；重新打开后直接使用
        assert!(t.path().join(TREE_FILE).is_file());
        let mut reopened = Table::open(t.path()).unwrap();
        assert!(reopened.tree.is_some());
        let mut again = reopened.get_cells(None, true).unwrap();
        again.sort_unstable();
        assert_eq!(again, expect);
    }

    #[test]
    fn drop_row_group_clears_cached() {
        let (_dir, mut t) = stars_table();
        let keys = t.append(
            InsertBatch::new()
                .col("ra", ColumnData::F8(vec![12.0]))
                .col("dec", ColumnData::F8(vec![12.0])),
            AppendOptions::default(),
        ).unwrap();
        let cell = t.pixelization().cell_for_id(keys[0]);
        let neighbor = t.pixelization().obj_id_from_pos(13.0, 12.0, None).unwrap();
        t.append(
            InsertBatch::new()
                .col("id", ColumnData::U8(vec![t.pixelization().id_for_cell_i(neighbor, 1)]))
                .col("ra", ColumnData::F8(vec![13.0]))
                .col("dec", ColumnData::F8(vec![12.0])),
            AppendOptions::cached_into(cell),
        ).unwrap();
        assert_eq!(t.fetch_tablet(cell, None, true).unwrap().len(), 2);

        t.drop_row_group(cell, RowGroup::Cached).unwrap();
        assert_eq!(t.fetch_tablet(cell, None, true).unwrap().len(), 1);
        // 锁文件已释放
        assert!(!t.lock_path(cell).exists());
    }

    #[test]
    fn create_refuses_to_clobber() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("stars");
        Table::create(&path, "stars", Pixelization::default()).unwrap();
        assert!(matches!(
            Table::create(&path, "other", Pixelization::default()),
            Err(TableError::Schema(_))
        ));
        assert!(matches!(
            Table::open(dir.path().join("missing")),
            Err(TableError::TableNotFound(_))
        ));
    }

    #[test]
    fn uri_resolution_uses_fgroup_filters() {
        let (_dir, mut t) = stars_table();
        let mut kwargs = std::collections::BTreeMap::new();
        kwargs.insert("compresslevel".to_string(), 5i64);
        t.define_fgroup("images", FgroupDef { path: None, filter: Some(("gzip".into(), kwargs)) })
            .unwrap();

        let p = t.resolve_uri("lsd:stars:images:exp/0001.fits").unwrap();
        assert!(p.ends_with("files/images/exp/0001.fits.gz"));

        let p = t.resolve_uri("lsd:stars:catalog:readme.txt").unwrap();
        assert!(p.ends_with("files/catalog/readme.txt"));

        t.define_fgroup("bad", FgroupDef { path: None, filter: Some(("xz".into(), Default::default())) })
            .unwrap();
        assert!(matches!(
            t.resolve_uri("lsd:stars:bad:x"),
            Err(TableError::UnknownFilter(_))
        ));
        assert!(t.resolve_uri("http://example.com").is_err());
    }
}

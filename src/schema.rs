//! Schema 持久化（schema.cfg）与内存列索引
//!
//! `schema.cfg` 是一份 JSON 文档（键按字母序、4 空格缩进），内容：
//! `name` / `nrows` / `level` / `t0` / `dt` / `cgroups`（有序 `[名字, 定义]`
//! 序列，伪 cgroup 不落盘）/ `fgroups` / `filters` / `aliases`。
//! 每次加载都会从头重建列索引：首个非伪 cgroup 即主 cgroup，主键、
//! 空间键、时间键只能声明在其中。

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::batch::DataType;
use crate::common::{Result, TableError};
use crate::compression::CompLib;

/// schema 文件名
pub const SCHEMA_FILE: &str = "schema.cfg";
/// 读取时合成的伪 cgroup
pub const PSEUDO_CGROUP: &str = "_PSEUDOCOLS";
/// 行表预期行数缺省值（建 tablet 时写入的分配提示）
pub const DEFAULT_EXPECTED_ROWS: u64 = 20_000_000;

/// 伪 cgroup / 伪列的命名约定：下划线开头
pub fn is_pseudo_cgroup(name: &str) -> bool {
    name.starts_with('_')
}

// ── 过滤器（压缩设置）────────────────────────────────────────────────────────

/// 叶子数据的压缩设置；表级缺省可被 cgroup、BLOB 逐层覆盖
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Filters {
    #[serde(default)]
    pub complib: CompLib,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub complevel: Option<u32>,
}

// ── BLOB 定义 ─────────────────────────────────────────────────────────────────

/// BLOB 列的元素种类：不透明对象，或定宽标量数组。
/// 哨兵（引用 0）对象类解析为 `None`，类型化类解析为空数组。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobKind {
    Object,
    Typed(DataType),
}

impl Default for BlobKind {
    fn default() -> Self {
        Self::Object
    }
}

impl Serialize for BlobKind {
    fn serialize<S: Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Self::Object => s.serialize_str("object"),
            Self::Typed(dt) => s.serialize_str(dt.code()),
        }
    }
}

impl<'de> Deserialize<'de> for BlobKind {
    fn deserialize<D: Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        if s == "object" {
            return Ok(Self::Object);
        }
        DataType::parse(&s)
            .map(Self::Typed)
            .map_err(|_| serde::de::Error::custom(format!("unknown blob element type \"{s}\"")))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlobDef {
    #[serde(rename = "type", default)]
    pub kind: BlobKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filters: Option<Filters>,
    #[serde(rename = "expectedsizeinMB", default, skip_serializing_if = "Option::is_none")]
    pub expected_size_mb: Option<f64>,
}

// ── Column group 定义 ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CGroupDef {
    /// (列名, 类型码) 有序表。类型码 `O8` 会被改写为 `i8` 并自动注册为 BLOB。
    pub columns: Vec<(String, String)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spatial_keys: Option<(String, String)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temporal_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exposure_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blobs: Option<BTreeMap<String, BlobDef>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filters: Option<Filters>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expectedrows: Option<u64>,
}

// ── 文件组 ────────────────────────────────────────────────────────────────────

/// 外部文件组：BLOB 大文件树的落盘位置与 I/O 过滤器
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FgroupDef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// (过滤器名, 关键字参数)，如 `("gzip", {"compresslevel": 5})`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<(String, BTreeMap<String, i64>)>,
}

/// 文件组 I/O 过滤器注册表的解析结果
#[derive(Debug, Clone, PartialEq)]
pub enum FgroupFilter {
    Plain,
    Gzip { compresslevel: Option<i64> },
    Bzip2,
}

impl FgroupFilter {
    /// 磁盘文件名应追加的后缀
    pub fn suffix(&self) -> &'static str {
        match self {
            Self::Plain => "",
            Self::Gzip { .. } => ".gz",
            Self::Bzip2 => ".bz2",
        }
    }
}

/// 解析文件组过滤器；未注册的过滤器名报错
pub fn fgroup_filter(def: Option<&FgroupDef>) -> Result<FgroupFilter> {
    match def.and_then(|d| d.filter.as_ref()) {
        None => Ok(FgroupFilter::Plain),
        Some((name, kwargs)) => match name.as_str() {
            "gzip" => Ok(FgroupFilter::Gzip {
                compresslevel: kwargs.get("compresslevel").copied(),
            }),
            "bzip2" => Ok(FgroupFilter::Bzip2),
            other => Err(TableError::UnknownFilter(other.to_string())),
        },
    }
}

// ── 列索引 ────────────────────────────────────────────────────────────────────

/// 由 cgroup 定义推导出的列记录
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub cgroup: String,
    pub dtype: DataType,
    pub is_blob: bool,
}

// ── 持久化文档 ────────────────────────────────────────────────────────────────

#[derive(Serialize, Deserialize)]
struct SchemaDoc {
    name: String,
    #[serde(default)]
    nrows: u64,
    level: u32,
    t0: f64,
    dt: f64,
    cgroups: Vec<(String, CGroupDef)>,
    #[serde(default)]
    fgroups: BTreeMap<String, FgroupDef>,
    #[serde(default)]
    filters: Filters,
    #[serde(default)]
    aliases: BTreeMap<String, String>,
}

// ── TableSchema ───────────────────────────────────────────────────────────────

/// 表的全部元数据：持久化部分 + 每次加载重建的列索引
#[derive(Debug, Clone, PartialEq)]
pub struct TableSchema {
    pub name: String,
    /// 行计数缓存（append 在内存中推进；仅随下一次 schema 落盘持久化）
    pub nrows: u64,
    pub level: u32,
    pub t0: f64,
    pub dt: f64,
    /// 有序 cgroup 表；内存态总是以 `_PSEUDOCOLS` 结尾
    cgroups: Vec<(String, CGroupDef)>,
    pub fgroups: BTreeMap<String, FgroupDef>,
    pub filters: Filters,
    aliases: BTreeMap<String, String>,

    // ── 重建索引 ──
    columns: Vec<Column>,
    by_name: BTreeMap<String, usize>,
    pub primary_cgroup: Option<String>,
    pub primary_key: Option<String>,
    pub spatial_keys: Option<(String, String)>,
    pub temporal_key: Option<String>,
    pub exposure_key: Option<String>,
}

fn pseudocols_def() -> CGroupDef {
    CGroupDef {
        columns: vec![
            ("_CACHED".into(), "bool".into()),
            ("_ROWIDX".into(), "u8".into()),
            ("_ROWID".into(), "u8".into()),
        ],
        ..Default::default()
    }
}

impl TableSchema {
    pub fn new(name: &str, level: u32, t0: f64, dt: f64) -> Self {
        let mut s = Self {
            name: name.to_string(),
            nrows: 0,
            level,
            t0,
            dt,
            cgroups: vec![(PSEUDO_CGROUP.to_string(), pseudocols_def())],
            fgroups: BTreeMap::new(),
            filters: Filters::default(),
            aliases: BTreeMap::new(),
            columns: Vec::new(),
            by_name: BTreeMap::new(),
            primary_cgroup: None,
            primary_key: None,
            spatial_keys: None,
            temporal_key: None,
            exposure_key: None,
        };
        // 空表的重建不会失败
        s.rebuild().unwrap();
        s
    }

    // ── 持久化 ────────────────────────────────────────────────────────────────

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let doc: SchemaDoc = serde_json::from_str(&text)?;
        let mut cgroups = doc.cgroups;
        cgroups.push((PSEUDO_CGROUP.to_string(), pseudocols_def()));
        let mut s = Self {
            name: doc.name,
            nrows: doc.nrows,
            level: doc.level,
            t0: doc.t0,
            dt: doc.dt,
            cgroups,
            fgroups: doc.fgroups,
            filters: doc.filters,
            aliases: doc.aliases,
            columns: Vec::new(),
            by_name: BTreeMap::new(),
            primary_cgroup: None,
            primary_key: None,
            spatial_keys: None,
            temporal_key: None,
            exposure_key: None,
        };
        s.rebuild()?;
        Ok(s)
    }

    /// 写出 schema.cfg：键按字母序，4 空格缩进，伪 cgroup 不落盘
    pub fn store(&self, path: &Path) -> Result<()> {
        let doc = SchemaDoc {
            name: self.name.clone(),
            nrows: self.nrows,
            level: self.level,
            t0: self.t0,
            dt: self.dt,
            cgroups: self.cgroups.iter()
                .filter(|(n, _)| !is_pseudo_cgroup(n))
                .cloned()
                .collect(),
            fgroups: self.fgroups.clone(),
            filters: self.filters.clone(),
            aliases: self.aliases.clone(),
        };
        // serde_json 的 Value 对象键有序，配合 4 空格缩进输出
        let value = serde_json::to_value(&doc)?;
        let mut buf = Vec::new();
        let fmt = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut ser = serde_json::Serializer::with_formatter(&mut buf, fmt);
        value.serialize(&mut ser)?;
        fs::write(path, buf)?;
        Ok(())
    }

    // ── 索引重建 ──────────────────────────────────────────────────────────────

    fn rebuild(&mut self) -> Result<()> {
        self.columns.clear();
        self.by_name.clear();
        self.primary_cgroup = None;
        self.primary_key = None;
        self.spatial_keys = None;
        self.temporal_key = None;
        self.exposure_key = None;

        let cgroups = std::mem::take(&mut self.cgroups);
        let result = self.rebuild_from(&cgroups);
        self.cgroups = cgroups;
        result
    }

    fn rebuild_from(&mut self, cgroups: &[(String, CGroupDef)]) -> Result<()> {
        for (cgroup, def) in cgroups {
            let mut local: BTreeMap<&str, DataType> = BTreeMap::new();
            for (cname, code) in &def.columns {
                let dtype = DataType::parse(code).map_err(|_| {
                    TableError::Schema(format!("column \"{cname}\": unknown dtype code \"{code}\""))
                })?;
                if self.by_name.contains_key(cname) {
                    return Err(TableError::Schema(format!("duplicate column \"{cname}\"")));
                }
                self.by_name.insert(cname.clone(), self.columns.len());
                self.columns.push(Column {
                    name: cname.clone(),
                    cgroup: cgroup.clone(),
                    dtype,
                    is_blob: false,
                });
                local.insert(cname, dtype);
            }

            let pseudo = is_pseudo_cgroup(cgroup);
            if self.primary_cgroup.is_none() && !pseudo {
                self.primary_cgroup = Some(cgroup.clone());
                if let Some(pk) = &def.primary_key {
                    match local.get(pk.as_str()) {
                        Some(DataType::U8) => self.primary_key = Some(pk.clone()),
                        Some(dt) => {
                            return Err(TableError::Schema(format!(
                                "primary key \"{pk}\" must be u8, found {dt}"
                            )))
                        }
                        None => {
                            return Err(TableError::Schema(format!(
                                "primary key \"{pk}\" is not a column of cgroup \"{cgroup}\""
                            )))
                        }
                    }
                }
                if let Some((lon, lat)) = &def.spatial_keys {
                    if !local.contains_key(lon.as_str()) || !local.contains_key(lat.as_str()) {
                        return Err(TableError::Schema(format!(
                            "spatial keys ({lon}, {lat}) must be columns of cgroup \"{cgroup}\""
                        )));
                    }
                    self.spatial_keys = Some((lon.clone(), lat.clone()));
                }
                if let Some(tk) = &def.temporal_key {
                    if !local.contains_key(tk.as_str()) {
                        return Err(TableError::Schema(format!(
                            "temporal key \"{tk}\" is not a column of cgroup \"{cgroup}\""
                        )));
                    }
                    self.temporal_key = Some(tk.clone());
                }
                if let Some(ek) = &def.exposure_key {
                    if !local.contains_key(ek.as_str()) {
                        return Err(TableError::Schema(format!(
                            "exposure key \"{ek}\" is not a column of cgroup \"{cgroup}\""
                        )));
                    }
                    self.exposure_key = Some(ek.clone());
                }
            } else if !pseudo
                && (def.primary_key.is_some()
                    || def.spatial_keys.is_some()
                    || def.temporal_key.is_some()
                    || def.exposure_key.is_some())
            {
                return Err(TableError::Schema(format!(
                    "keys may only be declared in the primary cgroup, not in \"{cgroup}\""
                )));
            }

            if let Some(blobs) = &def.blobs {
                for bname in blobs.keys() {
                    match local.get(bname.as_str()) {
                        Some(DataType::I8) => {}
                        Some(dt) => {
                            return Err(TableError::Schema(format!(
                                "blob reference column \"{bname}\" must be i8, found {dt}"
                            )))
                        }
                        None => {
                            return Err(TableError::Schema(format!(
                                "blob column \"{bname}\" is not a column of cgroup \"{cgroup}\""
                            )))
                        }
                    }
                    let idx = self.by_name[bname.as_str()];
                    self.columns[idx].is_blob = true;
                }
            }
        }
        Ok(())
    }

    // ── 变更（调用方负责落盘）────────────────────────────────────────────────

    /// 新建 column group。已存在时：`ignore_if_exists` 为真则跳过，否则报错。
    pub fn create_cgroup(&mut self, name: &str, mut def: CGroupDef, ignore_if_exists: bool) -> Result<()> {
        if self.cgroup(name).is_some() {
            if ignore_if_exists {
                return Ok(());
            }
            return Err(TableError::Schema(format!("cgroup \"{name}\" already exists")));
        }
        if is_pseudo_cgroup(name) {
            return Err(TableError::Schema(
                "cgroup names beginning with '_' are reserved for system use".into(),
            ));
        }

        // O8 → i8 改写并自动注册 BLOB
        let mut auto_blobs = Vec::new();
        for (cname, code) in def.columns.iter_mut() {
            if code == "O8" {
                *code = "i8".to_string();
                auto_blobs.push(cname.clone());
            }
        }
        for bname in auto_blobs {
            def.blobs
                .get_or_insert_with(BTreeMap::new)
                .entry(bname)
                .or_default();
        }

        // 行表分配提示：未给出时按缺省值持久化
        if def.expectedrows.is_none() {
            def.expectedrows = Some(DEFAULT_EXPECTED_ROWS);
        }

        if def.spatial_keys.is_some() && def.primary_key.is_none() {
            return Err(TableError::Schema(
                "cannot declare spatial keys in a non-primary cgroup".into(),
            ));
        }
        if def.primary_key.is_some() {
            if let Some(primary) = &self.primary_cgroup {
                return Err(TableError::Schema(format!(
                    "cannot create a primary cgroup \"{name}\" while \"{primary}\" already exists"
                )));
            }
        }

        // 在试验副本上重建，成功才提交
        let mut trial = self.clone();
        let pos = trial.cgroups.iter()
            .position(|(n, _)| is_pseudo_cgroup(n))
            .unwrap_or(trial.cgroups.len());
        trial.cgroups.insert(pos, (name.to_string(), def));
        trial.rebuild()?;
        *self = trial;
        Ok(())
    }

    pub fn define_alias(&mut self, alias: &str, colname: &str) -> Result<()> {
        if !self.by_name.contains_key(colname) {
            return Err(TableError::ColumnNotFound(colname.to_string()));
        }
        self.aliases.insert(alias.to_string(), colname.to_string());
        Ok(())
    }

    pub fn define_fgroup(&mut self, fgroup: &str, def: FgroupDef) {
        self.fgroups.insert(fgroup.to_string(), def);
    }

    pub fn set_default_filters(&mut self, filters: Filters) {
        self.filters = filters;
    }

    // ── 查询 ──────────────────────────────────────────────────────────────────

    /// 别名解析：五个内置别名（仅当对应键存在）→ 用户别名 → 原名
    pub fn resolve_alias(&self, name: &str) -> String {
        let builtin = match name {
            "_ID" => self.primary_key.clone(),
            "_LON" => self.spatial_keys.as_ref().map(|(lon, _)| lon.clone()),
            "_LAT" => self.spatial_keys.as_ref().map(|(_, lat)| lat.clone()),
            "_TIME" => self.temporal_key.clone(),
            "_EXP" => self.exposure_key.clone(),
            _ => None,
        };
        if let Some(resolved) = builtin {
            return resolved;
        }
        self.aliases.get(name).cloned().unwrap_or_else(|| name.to_string())
    }

    pub fn cgroup(&self, name: &str) -> Option<&CGroupDef> {
        self.cgroups.iter().find(|(n, _)| n == name).map(|(_, d)| d)
    }

    /// 全部 cgroup 名（含伪 cgroup），声明顺序
    pub fn cgroup_names(&self) -> impl Iterator<Item = &str> {
        self.cgroups.iter().map(|(n, _)| n.as_str())
    }

    /// 落盘的（非伪）cgroup 名，声明顺序；首个即主 cgroup
    pub fn storage_cgroups(&self) -> Vec<String> {
        self.cgroups.iter()
            .filter(|(n, _)| !is_pseudo_cgroup(n))
            .map(|(n, _)| n.clone())
            .collect()
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.by_name.get(name).map(|&i| &self.columns[i])
    }

    /// cgroup 的 (列名, 解析后类型) 有序表
    pub fn cgroup_columns(&self, cgroup: &str) -> Result<Vec<(String, DataType)>> {
        let def = self.cgroup(cgroup).ok_or_else(|| {
            TableError::Schema(format!("unknown cgroup \"{cgroup}\""))
        })?;
        def.columns.iter()
            .map(|(n, code)| Ok((n.clone(), DataType::parse(code)?)))
            .collect()
    }

    /// cgroup 生效的过滤器（cgroup 覆盖表级缺省）
    pub fn effective_filters(&self, cgroup: &str) -> Filters {
        self.cgroup(cgroup)
            .and_then(|d| d.filters.clone())
            .unwrap_or_else(|| self.filters.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn star_cgroup() -> CGroupDef {
        CGroupDef {
            columns: vec![
                ("id".into(), "u8".into()),
                ("ra".into(), "f8".into()),
                ("dec".into(), "f8".into()),
            ],
            primary_key: Some("id".into()),
            spatial_keys: Some(("ra".into(), "dec".into())),
            ..Default::default()
        }
    }

    #[test]
    fn create_and_reload_is_idempotent() {
        let dir = tempdir().unwrap();
        let cfg = dir.path().join(SCHEMA_FILE);

        let mut s = TableSchema::new("stars", 7, 54335.0, 1.0);
        s.create_cgroup("astrometry", star_cgroup(), false).unwrap();
        s.create_cgroup(
            "photometry",
            CGroupDef {
                columns: vec![("mag".into(), "f4".into())],
                ..Default::default()
            },
            false,
        )
        .unwrap();
        s.store(&cfg).unwrap();

        let loaded = TableSchema::load(&cfg).unwrap();
        assert_eq!(loaded, s);

        // load → store → load 不变
        loaded.store(&cfg).unwrap();
        let again = TableSchema::load(&cfg).unwrap();
        assert_eq!(again, loaded);
    }

    #[test]
    fn primary_cgroup_is_first_nonpseudo() {
        let mut s = TableSchema::new("t", 7, 54335.0, 1.0);
        s.create_cgroup("a", star_cgroup(), false).unwrap();
        assert_eq!(s.primary_cgroup.as_deref(), Some("a"));
        assert_eq!(s.primary_key.as_deref(), Some("id"));
        assert_eq!(s.storage_cgroups(), vec!["a".to_string()]);
        // 伪 cgroup 殿后且不落盘
        assert_eq!(s.cgroup_names().last(), Some(PSEUDO_CGROUP));
    }

    #[test]
    fn o8_columns_become_blob_refs() {
        let mut s = TableSchema::new("t", 7, 54335.0, 1.0);
        s.create_cgroup("a", star_cgroup(), false).unwrap();
        s.create_cgroup(
            "spectra",
            CGroupDef {
                columns: vec![("spectrum".into(), "O8".into())],
                ..Default::default()
            },
            false,
        )
        .unwrap();
        let col = s.column("spectrum").unwrap();
        assert!(col.is_blob);
        assert_eq!(col.dtype, DataType::I8);
        assert_eq!(
            s.cgroup("spectra").unwrap().blobs.as_ref().unwrap()["spectrum"].kind,
            BlobKind::Object
        );
    }

    #[test]
    fn schema_violations() {
        let mut s = TableSchema::new("t", 7, 54335.0, 1.0);
        s.create_cgroup("a", star_cgroup(), false).unwrap();

        // 重复创建
        assert!(s.create_cgroup("a", star_cgroup(), false).is_err());
        s.create_cgroup("a", star_cgroup(), true).unwrap();
        // 伪 cgroup 名
        assert!(s.create_cgroup("_x", CGroupDef::default(), false).is_err());
        // 第二个主 cgroup
        assert!(s.create_cgroup("b", star_cgroup(), false).is_err());
        // 非主 cgroup 声明空间键
        let bad = CGroupDef {
            columns: vec![("u".into(), "f8".into()), ("v".into(), "f8".into())],
            spatial_keys: Some(("u".into(), "v".into())),
            ..Default::default()
        };
        assert!(s.create_cgroup("c", bad, false).is_err());
        // 非 i8 的 BLOB 列
        let mut blobs = BTreeMap::new();
        blobs.insert("x".to_string(), BlobDef::default());
        let bad = CGroupDef {
            columns: vec![("x".into(), "f8".into())],
            blobs: Some(blobs),
            ..Default::default()
        };
        assert!(s.create_cgroup("d", bad, false).is_err());
        // 跨 cgroup 重名列
        let dup = CGroupDef {
            columns: vec![("ra".into(), "f8".into())],
            ..Default::default()
        };
        assert!(s.create_cgroup("e", dup, false).is_err());
    }

    #[test]
    fn alias_resolution() {
        let mut s = TableSchema::new("t", 7, 54335.0, 1.0);
        s.create_cgroup("a", star_cgroup(), false).unwrap();
        s.define_alias("right_ascension", "ra").unwrap();
        assert!(s.define_alias("nope", "missing").is_err());

        assert_eq!(s.resolve_alias("_ID"), "id");
        assert_eq!(s.resolve_alias("_LON"), "ra");
        assert_eq!(s.resolve_alias("_LAT"), "dec");
        // 无时间键时 _TIME 原样返回
        assert_eq!(s.resolve_alias("_TIME"), "_TIME");
        assert_eq!(s.resolve_alias("right_ascension"), "ra");
        assert_eq!(s.resolve_alias("ra"), "ra");
        assert_eq!(s.resolve_alias("unknown"), "unknown");
    }

    #[test]
    fn fgroup_filter_registry() {
        let mut kwargs = BTreeMap::new();
        kwargs.insert("compresslevel".to_string(), 5i64);
        let gz = FgroupDef { path: None, filter: Some(("gzip".into(), kwargs)) };
        assert_eq!(
            fgroup_filter(Some(&gz)).unwrap(),
            FgroupFilter::Gzip { compresslevel: Some(5) }
        );
        assert_eq!(fgroup_filter(Some(&gz)).unwrap().suffix(), ".gz");
        assert_eq!(fgroup_filter(None).unwrap(), FgroupFilter::Plain);

        let bad = FgroupDef { path: None, filter: Some(("xz".into(), BTreeMap::new())) };
        assert!(matches!(fgroup_filter(Some(&bad)), Err(TableError::UnknownFilter(_))));
    }

    #[test]
    fn sorted_four_space_json() {
        let dir = tempdir().unwrap();
        let cfg = dir.path().join(SCHEMA_FILE);
        let mut s = TableSchema::new("stars", 7, 54335.0, 1.0);
        s.create_cgroup("a", star_cgroup(), false).unwrap();
        s.store(&cfg).unwrap();

        let text = std::fs::read_to_string(&cfg).unwrap();
        assert!(text.contains("    \"aliases\""));
        let top: Vec<&str> = text.lines()
            .filter(|l| l.starts_with("    \""))
            .map(|l| l.trim())
            .collect();
        // 顶层键按字母序
        let aliases_pos = top.iter().position(|l| l.starts_with("\"aliases\"")).unwrap();
        let name_pos = top.iter().position(|l| l.starts_with("\"name\"")).unwrap();
        let t0_pos = top.iter().position(|l| l.starts_with("\"t0\"")).unwrap();
        assert!(aliases_pos < name_pos && name_pos < t0_pos);
    }
}

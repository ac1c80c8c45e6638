//! # survey-table-engine
//!
//! 巡天数据集仓库的核心表引擎：按天区（HEALPix 风格格网，可选时间轴
//! 细分）分片的追加型表，含写入流水线与配套数据模型。
//!
//! ## 整体架构
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                        Table                             │
//! │   ┌────────────────┐      ┌───────────────────────────┐  │
//! │   │  TableSchema   │      │       Pixelization        │  │
//! │   │  (schema.cfg)  │      │  (lon,lat,t?) → cell_id   │  │
//! │   └───────┬────────┘      └──────────────┬────────────┘  │
//! │           │      append / fetch          │               │
//! │           ▼                              ▼               │
//! │   ┌──────────────────────────────────────────────────┐   │
//! │   │  写入流水线：别名 → cell 指派 → 轮询加锁 →        │   │
//! │   │  逐 cgroup upsert（序列补键 + BLOB 标识去重）     │   │
//! │   └───────┬──────────────────┬───────────────────────┘   │
//! │           │                  │                           │
//! │        CellLock           Tablet (<table>.<cgroup>.h5)   │
//! │      (<table>.lock)       ┌──────────────────────────┐   │
//! │                           │ main / cached 行组        │   │
//! │                           │  ├─ 行表（列式 + LZ4）    │   │
//! │                           │  ├─ _seq_<pk> 序列        │   │
//! │                           │  └─ blobs/<col> VLArray   │   │
//! │                           └──────────────────────────┘   │
//! │   TabletTree (tablet_tree.pkl) ← 范围查询的 cell 枚举    │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod common;
pub mod pixelization;
pub mod batch;
pub mod compression;
pub mod schema;
pub mod blob;
pub mod tablet;
pub mod lock;
pub mod tree;
pub mod table;

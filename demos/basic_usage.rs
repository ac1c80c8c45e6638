//! # survey-table-engine 完整使用案例
//!
//! 演示核心功能：
//!
//! 1. 建表与 column group 定义（主键 / 空间键 / BLOB 列）
//! 2. 追加行（主键自动生成）
//! 3. 按主键 upsert
//! 4. BLOB 标识去重
//! 5. 邻居缓存行组与负引用
//! 6. cell 树缓存与范围查询

use std::sync::Arc;

use survey_table_engine::{
    batch::{ColumnData, InsertBatch},
    common::Blob,
    pixelization::Pixelization,
    schema::CGroupDef,
    table::{AppendOptions, Table},
    tree::{QueryBounds, SkyRect},
};

fn main() -> survey_table_engine::common::Result<()> {
    println!("═══════════════════════════════════════════════════════════");
    println!("   survey-table-engine 演示");
    println!("═══════════════════════════════════════════════════════════\n");

    let dir = tempfile::tempdir().expect("demo workspace");

    // =========================================================================
    // 1. 建表
    // =========================================================================
    println!("【1】建表 `stars` ...");
    let mut table = Table::create(dir.path().join("stars"), "stars", Pixelization::default())?;
    table.create_cgroup(
        "astrometry",
        CGroupDef {
            columns: vec![
                ("id".into(), "u8".into()),
                ("ra".into(), "f8".into()),
                ("dec".into(), "f8".into()),
                ("spectrum".into(), "O8".into()), // O8 → i8 BLOB 引用
            ],
            primary_key: Some("id".into()),
            spatial_keys: Some(("ra".into(), "dec".into())),
            ..Default::default()
        },
        false,
    )?;
    println!("{table}");

    // =========================================================================
    // 2. 追加行
    // =========================================================================
    println!("【2】追加 4 行（主键自动生成）...");
    let shared: Blob = Some(Arc::new(b"shared spectrum bytes".to_vec()));
    let keys = table.append(
        InsertBatch::new()
            .col("ra", ColumnData::F8(vec![10.0, 10.1, 180.0, 180.2]))
            .col("dec", ColumnData::F8(vec![-5.0, -5.1, 42.0, 42.2]))
            .blobs("spectrum", vec![shared.clone(), shared, None, Some(Arc::new(vec![7u8; 16]))]),
        AppendOptions::default(),
    )?;
    for k in &keys {
        println!("    id = {k:#018x}  cell = {:#018x}", table.pixelization().cell_for_id(*k));
    }
    println!("    nrows = {}\n", table.nrows());

    // =========================================================================
    // 3. upsert
    // =========================================================================
    println!("【3】按主键覆盖第一行 ...");
    table.append(
        InsertBatch::new()
            .col("id", ColumnData::U8(vec![keys[0]]))
            .col("ra", ColumnData::F8(vec![10.05]))
            .col("dec", ColumnData::F8(vec![-5.05])),
        AppendOptions::update(),
    )?;
    println!("    nrows = {}（更新不增行）\n", table.nrows());

    // =========================================================================
    // 4. 读回与 BLOB
    // =========================================================================
    println!("【4】读回第一个 cell ...");
    let cell = table.pixelization().cell_for_id(keys[0]);
    let rows = table.fetch_tablet(cell, None, false)?;
    println!("    行数 = {}", rows.len());
    let refs = rows.column("spectrum").unwrap().as_i64().unwrap().to_vec();
    println!("    spectrum 引用 = {refs:?}（前两行共享同一条目）");
    let blobs = table.fetch_blobs(cell, "spectrum", &refs, false)?;
    println!("    首条 BLOB 字节数 = {}\n", blobs[0].as_ref().map(|b| b.len()).unwrap_or(0));

    // =========================================================================
    // 5. 邻居缓存
    // =========================================================================
    println!("【5】往第一个 cell 写邻居缓存行 ...");
    table.append(
        InsertBatch::new()
            .col("id", ColumnData::U8(vec![keys[2]]))
            .col("ra", ColumnData::F8(vec![180.0]))
            .col("dec", ColumnData::F8(vec![42.0])),
        AppendOptions::cached_into(cell),
    )?;
    let with_cache = table.fetch_tablet(cell, None, true)?;
    println!("    含缓存读 = {} 行\n", with_cache.len());

    // =========================================================================
    // 6. cell 枚举
    // =========================================================================
    println!("【6】范围查询 ...");
    let all = table.get_cells(None, true)?;
    println!("    全部 cell = {}", all.len());
    let qb = QueryBounds {
        region: Some(SkyRect::new((0.0, 90.0), (-30.0, 30.0))),
        times: None,
    };
    let hits = table.get_cells(Some(&[qb]), true)?;
    println!("    区域命中 = {} 个 cell", hits.len());

    println!("\n═══════════════════════════════════════════════════════════");
    println!("   演示完成 ✓");
    println!("═══════════════════════════════════════════════════════════");
    Ok(())
}

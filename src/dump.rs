//! # 转储序列化器
//!
//! 遍历数据存储的结构与行数据，生成可回放的文本转储。
//!
//! ## 输出格式
//!
//! ```text
//! -- ----------------------------------------------------
//! -- billing-backup vX.Y.Z 数据库转储
//! -- 生成时间: <rfc3339> (所有时间均为 UTC)
//! -- 模式: full | incremental
//! -- ----------------------------------------------------
//! PRAGMA foreign_keys=OFF;
//! BEGIN TRANSACTION;
//! DROP TABLE IF EXISTS "t";
//! CREATE TABLE "t" (...);
//! INSERT INTO "t" VALUES (...),(...);
//! ...
//! COMMIT;
//! ```
//!
//! 头部注释仅作文档用途，恢复引擎不依赖它。空表只输出结构块。
//! 任何一张表读取失败即整体中止，调用方只在完全成功后才落盘。

use crate::store::{quote_ident, DataStore, StoreError};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// 增量转储跳过行数据的表（仅保留结构）
///
/// 会话与操作日志属于运行期/审计历史，重建业务状态不需要它们。
/// 列表固定为这两张表，除非需求明确扩大，不得增删。
pub const INCREMENTAL_SKIP_TABLES: &[&str] = &["sessions", crate::catalog::OPERATION_LOG_TABLE];

/// 单条多行 INSERT 最多携带的行数
const INSERT_BATCH_ROWS: usize = 64;

/// 转储模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DumpMode {
    /// 全量：所有表的结构与数据
    Full,
    /// 增量：跳过 [`INCREMENTAL_SKIP_TABLES`] 的行数据
    Incremental,
}

impl DumpMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DumpMode::Full => "full",
            DumpMode::Incremental => "incremental",
        }
    }
}

/// 转储错误
#[derive(Debug, thiserror::Error)]
pub enum DumpError {
    #[error("Serialization failed for table {table}: {source}")]
    Serialization {
        table: String,
        #[source]
        source: StoreError,
    },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// 序列化整个数据存储为转储文本
///
/// 只读操作，不修改存储。表按存储报告的顺序枚举（单次调用内稳定）。
pub fn serialize(store: &DataStore, mode: DumpMode) -> Result<String, DumpError> {
    let tables = store.list_tables()?;
    info!(
        "[Dump] 开始序列化: mode={}, tables={}",
        mode.as_str(),
        tables.len()
    );

    let mut out = String::new();
    write_header(&mut out, mode);

    for table in &tables {
        write_table(store, &mut out, table, mode).map_err(|source| DumpError::Serialization {
            table: table.clone(),
            source,
        })?;
    }

    out.push_str("COMMIT;\n");
    info!("[Dump] 序列化完成: {} bytes", out.len());
    Ok(out)
}

fn write_header(out: &mut String, mode: DumpMode) {
    let now = chrono::Utc::now();
    out.push_str("-- ----------------------------------------------------\n");
    out.push_str(&format!(
        "-- billing-backup v{} 数据库转储\n",
        env!("CARGO_PKG_VERSION")
    ));
    out.push_str(&format!(
        "-- 生成时间: {} (所有时间均为 UTC)\n",
        now.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
    ));
    out.push_str(&format!("-- 模式: {}\n", mode.as_str()));
    out.push_str("-- ----------------------------------------------------\n");
    out.push_str("PRAGMA foreign_keys=OFF;\n");
    out.push_str("BEGIN TRANSACTION;\n");
}

fn write_table(
    store: &DataStore,
    out: &mut String,
    table: &str,
    mode: DumpMode,
) -> Result<(), StoreError> {
    let create_sql = store.table_create_sql(table)?;

    out.push_str(&format!("DROP TABLE IF EXISTS {};\n", quote_ident(table)));
    out.push_str(create_sql.trim_end_matches(';'));
    out.push_str(";\n");

    if mode == DumpMode::Incremental && is_incremental_skipped(table) {
        debug!("[Dump] 增量模式跳过表数据: {}", table);
        return Ok(());
    }

    let rows = store.read_rows_as_literals(table)?;
    if rows.is_empty() {
        return Ok(());
    }

    for batch in rows.chunks(INSERT_BATCH_ROWS) {
        out.push_str(&format!("INSERT INTO {} VALUES\n", quote_ident(table)));
        for (i, row) in batch.iter().enumerate() {
            out.push('(');
            out.push_str(&row.join(","));
            out.push(')');
            out.push_str(if i + 1 == batch.len() { ";\n" } else { ",\n" });
        }
    }

    debug!("[Dump] 表 {} 序列化完成: {} 行", table, rows.len());
    Ok(())
}

/// 表是否在增量跳过列表中（大小写不敏感）
pub fn is_incremental_skipped(table: &str) -> bool {
    INCREMENTAL_SKIP_TABLES
        .iter()
        .any(|t| t.eq_ignore_ascii_case(table))
}

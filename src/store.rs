//! # 数据存储句柄
//!
//! 对单个 SQLite 连接的轻量封装，为备份/恢复组件提供：
//!
//! - 表枚举（单次调用内顺序稳定）
//! - 表结构与行数据读取（行值直接渲染为 SQL 字面量）
//! - 语句执行
//! - [`ForeignKeyGuard`]：作用域内放宽外键约束，Drop 时恢复原状态
//!
//! 句柄由调用方显式传入每个组件，任何组件都不得在请求生命周期之外
//! 持有它（依赖注入，避免全局可变连接）。

use rusqlite::types::ValueRef;
use rusqlite::Connection;
use std::path::Path;
use tracing::{error, warn};

/// 存储层错误
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Table not found: {0}")]
    TableNotFound(String),
}

/// 数据存储句柄
pub struct DataStore {
    conn: Connection,
}

impl DataStore {
    /// 打开指定路径的数据库
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Ok(Self { conn })
    }

    /// 打开内存数据库（测试用）
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Ok(Self { conn })
    }

    /// 从已有连接构造
    pub fn from_connection(conn: Connection) -> Self {
        Self { conn }
    }

    /// 底层连接
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// 枚举用户表名
    ///
    /// 按 `sqlite_master` 的 rowid 顺序返回（单次调用内稳定），
    /// 跳过 `sqlite_` 前缀的内部表。
    pub fn list_tables(&self) -> Result<Vec<String>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT name FROM sqlite_master
             WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
             ORDER BY rowid",
        )?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(names)
    }

    /// 读取表的原始 CREATE TABLE 语句
    pub fn table_create_sql(&self, table: &str) -> Result<String, StoreError> {
        let sql: Option<String> = self
            .conn
            .query_row(
                "SELECT sql FROM sqlite_master WHERE type = 'table' AND name = ?1",
                [table],
                |row| row.get(0),
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => {
                    StoreError::TableNotFound(table.to_string())
                }
                other => StoreError::Database(other),
            })?;
        sql.ok_or_else(|| StoreError::TableNotFound(table.to_string()))
    }

    /// 读取整表行数据，每个标量值渲染为 SQL 字面量
    ///
    /// - `NULL` → 字面量 `NULL`（不作为字符串转义，保证往返保真）
    /// - 整数/浮点 → 十进制文本
    /// - 文本 → 单引号转义（`'` 双写）
    /// - BLOB → `X'..'` 十六进制（二进制安全）
    pub fn read_rows_as_literals(&self, table: &str) -> Result<Vec<Vec<String>>, StoreError> {
        let sql = format!("SELECT * FROM {}", quote_ident(table));
        let mut stmt = self.conn.prepare(&sql)?;
        let column_count = stmt.column_count();

        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let mut values = Vec::with_capacity(column_count);
            for i in 0..column_count {
                values.push(render_literal(row.get_ref(i)?));
            }
            out.push(values);
        }
        Ok(out)
    }

    /// 执行单条语句，返回受影响行数
    pub fn execute_statement(&self, sql: &str) -> Result<usize, StoreError> {
        Ok(self.conn.execute(sql, [])?)
    }

    /// 批量执行
    pub fn execute_batch(&self, sql: &str) -> Result<(), StoreError> {
        Ok(self.conn.execute_batch(sql)?)
    }

    /// 当前外键约束是否启用
    pub fn foreign_keys_enabled(&self) -> Result<bool, StoreError> {
        let enabled: i64 = self
            .conn
            .query_row("PRAGMA foreign_keys", [], |row| row.get(0))?;
        Ok(enabled != 0)
    }

    /// 设置外键约束开关
    pub fn set_foreign_keys(&self, enabled: bool) -> Result<(), StoreError> {
        self.conn
            .pragma_update(None, "foreign_keys", enabled)
            .map_err(StoreError::Database)
    }

    /// 是否处于自动提交状态（即没有未完成的事务）
    pub fn is_autocommit(&self) -> bool {
        self.conn.is_autocommit()
    }
}

/// SQL 标识符引用（`"` 双写）
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// 将一个列值渲染为可回放的 SQL 字面量
///
/// `f64::to_string` 对非有限值产生 `inf`/`NaN`，不是合法 SQL；
/// 无穷渲染为 SQLite 接受的 `9e999`/`-9e999`，NaN 渲染为 `NULL`。
/// 非 UTF-8 文本退化为十六进制字面量，避免有损转码破坏往返保真。
fn render_literal(value: ValueRef<'_>) -> String {
    match value {
        ValueRef::Null => "NULL".to_string(),
        ValueRef::Integer(i) => i.to_string(),
        ValueRef::Real(f) if f.is_nan() => {
            warn!("[Store] NaN REAL 值渲染为 NULL");
            "NULL".to_string()
        }
        ValueRef::Real(f) if f.is_infinite() => {
            if f.is_sign_positive() { "9e999" } else { "-9e999" }.to_string()
        }
        ValueRef::Real(f) => f.to_string(),
        ValueRef::Text(bytes) => match std::str::from_utf8(bytes) {
            Ok(text) => format!("'{}'", text.replace('\'', "''")),
            Err(_) => format!("X'{}'", hex::encode(bytes)),
        },
        ValueRef::Blob(bytes) => format!("X'{}'", hex::encode(bytes)),
    }
}

// ============================================================================
// 外键约束 RAII Guard
// ============================================================================

/// 外键约束守卫：放宽约束，Drop 时恢复原状态
///
/// 恢复回放期间按文件顺序重建表，无需独立求解依赖拓扑排序；
/// 守卫保证即使回放中途出错，约束状态也会在作用域结束时复原。
pub struct ForeignKeyGuard<'a> {
    store: &'a DataStore,
    was_enabled: bool,
    restored: bool,
}

impl<'a> ForeignKeyGuard<'a> {
    /// 放宽外键约束，记录先前状态
    pub fn relax(store: &'a DataStore) -> Result<Self, StoreError> {
        let was_enabled = store.foreign_keys_enabled()?;
        store.set_foreign_keys(false)?;
        Ok(Self {
            store,
            was_enabled,
            restored: false,
        })
    }

    /// 手动恢复（通常不需要调用，Drop 会自动处理）
    pub fn restore(&mut self) {
        if !self.restored {
            if let Err(e) = self.store.set_foreign_keys(self.was_enabled) {
                error!("[Store] 恢复外键约束状态失败: {}", e);
            }
            self.restored = true;
        }
    }
}

impl Drop for ForeignKeyGuard<'_> {
    fn drop(&mut self) {
        if !self.restored {
            // PRAGMA 在未完成的事务内不生效，先确保事务已结束
            if !self.store.is_autocommit() {
                warn!("[Store] Guard drop 时仍有未提交事务，执行 COMMIT");
                if let Err(e) = self.store.execute_batch("COMMIT") {
                    error!("[Store] COMMIT 失败: {}", e);
                }
            }
            self.restore();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_store() -> DataStore {
        let store = DataStore::open_in_memory().unwrap();
        store
            .execute_batch(
                "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT);
                 INSERT INTO users VALUES (1, 'Ama'), (2, NULL);
                 CREATE TABLE empty_t (id INTEGER);",
            )
            .unwrap();
        store
    }

    #[test]
    fn list_tables_skips_internal_tables() {
        let store = sample_store();
        let tables = store.list_tables().unwrap();
        assert_eq!(tables, vec!["users".to_string(), "empty_t".to_string()]);
    }

    #[test]
    fn read_rows_renders_null_and_text_literals() {
        let store = sample_store();
        let rows = store.read_rows_as_literals("users").unwrap();
        assert_eq!(rows[0], vec!["1".to_string(), "'Ama'".to_string()]);
        assert_eq!(rows[1], vec!["2".to_string(), "NULL".to_string()]);
    }

    #[test]
    fn read_rows_escapes_embedded_quotes() {
        let store = sample_store();
        store
            .execute_statement("INSERT INTO users VALUES (3, 'O''Brien; DROP')")
            .unwrap();
        let rows = store.read_rows_as_literals("users").unwrap();
        assert_eq!(rows[2][1], "'O''Brien; DROP'");
    }

    #[test]
    fn blob_values_render_as_hex() {
        let store = sample_store();
        store
            .conn()
            .execute(
                "INSERT INTO users VALUES (4, ?1)",
                [rusqlite::types::Value::Blob(vec![0x00, 0xff, 0x3b])],
            )
            .unwrap();
        let rows = store.read_rows_as_literals("users").unwrap();
        assert_eq!(rows[2][1], "X'00ff3b'");
    }

    #[test]
    fn infinite_reals_render_replayable() {
        let store = DataStore::open_in_memory().unwrap();
        store
            .execute_batch("CREATE TABLE readings (v REAL)")
            .unwrap();
        store
            .conn()
            .execute("INSERT INTO readings VALUES (?1)", [f64::INFINITY])
            .unwrap();
        store
            .conn()
            .execute("INSERT INTO readings VALUES (?1)", [f64::NEG_INFINITY])
            .unwrap();

        let rows = store.read_rows_as_literals("readings").unwrap();
        assert_eq!(rows[0][0], "9e999");
        assert_eq!(rows[1][0], "-9e999");

        // 渲染结果本身可回放，且再次读取得到同样的字面量
        store
            .execute_statement("INSERT INTO readings VALUES (9e999)")
            .unwrap();
        let rows = store.read_rows_as_literals("readings").unwrap();
        assert_eq!(rows[2][0], "9e999");
    }

    #[test]
    fn non_utf8_text_renders_as_hex_literal() {
        let store = DataStore::open_in_memory().unwrap();
        store.execute_batch("CREATE TABLE notes (v TEXT)").unwrap();
        // CAST 保留原始字节，得到一个非 UTF-8 的 TEXT 值
        store
            .execute_statement("INSERT INTO notes VALUES (CAST(X'fffe' AS TEXT))")
            .unwrap();

        let rows = store.read_rows_as_literals("notes").unwrap();
        assert_eq!(rows[0][0], "X'fffe'");
    }

    #[test]
    fn table_create_sql_missing_table() {
        let store = sample_store();
        let err = store.table_create_sql("nope").unwrap_err();
        assert!(matches!(err, StoreError::TableNotFound(_)));
    }

    #[test]
    fn foreign_key_guard_restores_prior_state() {
        let store = sample_store();
        store.set_foreign_keys(true).unwrap();
        {
            let _guard = ForeignKeyGuard::relax(&store).unwrap();
            assert!(!store.foreign_keys_enabled().unwrap());
        }
        assert!(store.foreign_keys_enabled().unwrap());
    }

    #[test]
    fn foreign_key_guard_keeps_disabled_state() {
        let store = sample_store();
        store.set_foreign_keys(false).unwrap();
        {
            let _guard = ForeignKeyGuard::relax(&store).unwrap();
        }
        assert!(!store.foreign_keys_enabled().unwrap());
    }
}

//! # 操作日志
//!
//! 持久化每次备份/恢复尝试的元数据（类型、状态、大小、操作者、
//! 时间戳、错误），供审计与状态展示使用。
//!
//! ## 不变量
//!
//! - 每次尝试（包括失败的）恰好一条记录
//! - 状态只能 InProgress → Completed 或 InProgress → Failed，不可逆转
//! - 记录只追加、在操作结束时更新一次，永不删除（审计轨迹）
//!
//! 表直接建在业务存储中。全量转储会包含这张表本身，但恢复引擎
//! 跳过针对它的语句（见 [`crate::restore`]）：活动日志是权威记录，
//! 不会被回放覆盖。

use crate::store::{DataStore, StoreError};
use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// 操作类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Backup,
    Restore,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Backup => "backup",
            OperationKind::Restore => "restore",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "restore" => OperationKind::Restore,
            _ => OperationKind::Backup,
        }
    }
}

/// 操作子类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationSubtype {
    /// 全量备份 / 全量恢复
    Full,
    /// 增量备份
    Incremental,
    /// 资产归档相关
    Assets,
    /// 外部上传接收
    Upload,
}

impl OperationSubtype {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationSubtype::Full => "full",
            OperationSubtype::Incremental => "incremental",
            OperationSubtype::Assets => "assets",
            OperationSubtype::Upload => "upload",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "incremental" => OperationSubtype::Incremental,
            "assets" => OperationSubtype::Assets,
            "upload" => OperationSubtype::Upload,
            _ => OperationSubtype::Full,
        }
    }
}

/// 操作状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    InProgress,
    Completed,
    Failed,
}

impl OperationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::InProgress => "in_progress",
            OperationStatus::Completed => "completed",
            OperationStatus::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "completed" => OperationStatus::Completed,
            "failed" => OperationStatus::Failed,
            _ => OperationStatus::InProgress,
        }
    }
}

/// 一条操作日志记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationLogEntry {
    pub operation_id: String,
    pub kind: OperationKind,
    pub subtype: OperationSubtype,
    pub artifact_path: Option<String>,
    pub status: OperationStatus,
    pub byte_size: Option<u64>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub actor_id: String,
    pub statements_applied: Option<u64>,
    pub statements_failed: Option<u64>,
}

impl OperationLogEntry {
    /// 恢复是否"完成但有警告"
    pub fn completed_with_warnings(&self) -> bool {
        self.status == OperationStatus::Completed && self.statements_failed.unwrap_or(0) > 0
    }
}

/// 日志错误
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Operation not found: {0}")]
    NotFound(String),

    #[error("Invalid status transition for operation {0}")]
    InvalidTransition(String),
}

impl From<rusqlite::Error> for CatalogError {
    fn from(err: rusqlite::Error) -> Self {
        CatalogError::Database(err.to_string())
    }
}

impl From<StoreError> for CatalogError {
    fn from(err: StoreError) -> Self {
        CatalogError::Database(err.to_string())
    }
}

/// 日志表名；回放引擎据此跳过针对本表的语句
///
/// 与 [`OperationLog::CREATE_TABLE_SQL`] 中的表名保持一致。
pub const OPERATION_LOG_TABLE: &str = "operation_log";

/// 操作日志仓库（无状态，作用于传入的存储句柄）
pub struct OperationLog;

impl OperationLog {
    /// 建表 SQL
    pub const CREATE_TABLE_SQL: &'static str = r#"
        CREATE TABLE IF NOT EXISTS operation_log (
            operation_id TEXT PRIMARY KEY NOT NULL,
            kind TEXT NOT NULL,
            subtype TEXT NOT NULL,
            artifact_path TEXT,
            status TEXT NOT NULL,
            byte_size INTEGER,
            started_at TEXT NOT NULL,
            completed_at TEXT,
            error_message TEXT,
            actor_id TEXT NOT NULL,
            statements_applied INTEGER,
            statements_failed INTEGER
        );

        CREATE INDEX IF NOT EXISTS idx_operation_log_started_at ON operation_log(started_at);
        CREATE INDEX IF NOT EXISTS idx_operation_log_status ON operation_log(status);
    "#;

    /// 初始化日志表
    pub fn init(store: &DataStore) -> Result<(), CatalogError> {
        store.execute_batch(Self::CREATE_TABLE_SQL)?;
        Ok(())
    }

    /// 记录操作开始，返回操作 ID
    pub fn begin(
        store: &DataStore,
        kind: OperationKind,
        subtype: OperationSubtype,
        actor: &str,
    ) -> Result<String, CatalogError> {
        Self::init(store)?;
        let operation_id = uuid::Uuid::new_v4().to_string();
        store.conn().execute(
            "INSERT INTO operation_log
                 (operation_id, kind, subtype, status, started_at, actor_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                operation_id,
                kind.as_str(),
                subtype.as_str(),
                OperationStatus::InProgress.as_str(),
                Utc::now().to_rfc3339(),
                actor,
            ],
        )?;
        info!(
            "[OperationLog] 操作开始: id={}, kind={}, subtype={}, actor={}",
            operation_id,
            kind.as_str(),
            subtype.as_str(),
            actor
        );
        Ok(operation_id)
    }

    /// 记录操作成功结束
    pub fn complete(
        store: &DataStore,
        operation_id: &str,
        byte_size: Option<u64>,
        artifact_path: Option<&str>,
        statements_applied: Option<u64>,
        statements_failed: Option<u64>,
        warning: Option<&str>,
    ) -> Result<(), CatalogError> {
        Self::finish(
            store,
            operation_id,
            OperationStatus::Completed,
            byte_size,
            artifact_path,
            statements_applied,
            statements_failed,
            warning,
        )
    }

    /// 记录操作失败结束
    pub fn fail(store: &DataStore, operation_id: &str, error: &str) -> Result<(), CatalogError> {
        Self::finish(
            store,
            operation_id,
            OperationStatus::Failed,
            None,
            None,
            None,
            None,
            Some(error),
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn finish(
        store: &DataStore,
        operation_id: &str,
        status: OperationStatus,
        byte_size: Option<u64>,
        artifact_path: Option<&str>,
        statements_applied: Option<u64>,
        statements_failed: Option<u64>,
        message: Option<&str>,
    ) -> Result<(), CatalogError> {
        // 恢复回放可能重建了日志表，先确保表存在
        Self::init(store)?;
        let completed_at = Utc::now().to_rfc3339();

        let updated = store.conn().execute(
            "UPDATE operation_log
             SET status = ?2, byte_size = ?3, artifact_path = COALESCE(?4, artifact_path),
                 completed_at = ?5, error_message = ?6,
                 statements_applied = ?7, statements_failed = ?8
             WHERE operation_id = ?1 AND status = 'in_progress'",
            params![
                operation_id,
                status.as_str(),
                byte_size.map(|v| v as i64),
                artifact_path,
                completed_at,
                message,
                statements_applied.map(|v| v as i64),
                statements_failed.map(|v| v as i64),
            ],
        )?;

        if updated == 0 {
            let existing: Option<String> = store
                .conn()
                .query_row(
                    "SELECT status FROM operation_log WHERE operation_id = ?1",
                    [operation_id],
                    |row| row.get(0),
                )
                .map(Some)
                .or_else(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    other => Err(other),
                })?;

            match existing {
                Some(_) => return Err(CatalogError::InvalidTransition(operation_id.to_string())),
                None => {
                    warn!("[OperationLog] 终态写入找不到记录: {}", operation_id);
                    return Err(CatalogError::NotFound(operation_id.to_string()));
                }
            }
        }
        Ok(())
    }

    /// 最近的操作记录，按开始时间降序
    pub fn list_recent(store: &DataStore, limit: usize) -> Result<Vec<OperationLogEntry>, CatalogError> {
        Self::init(store)?;
        let mut stmt = store.conn().prepare(
            "SELECT operation_id, kind, subtype, artifact_path, status, byte_size,
                    started_at, completed_at, error_message, actor_id,
                    statements_applied, statements_failed
             FROM operation_log
             ORDER BY started_at DESC
             LIMIT ?1",
        )?;
        let entries = stmt
            .query_map([limit as i64], Self::map_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    /// 最近一次成功完成的备份（状态面板用）
    pub fn last_completed_backup(
        store: &DataStore,
    ) -> Result<Option<OperationLogEntry>, CatalogError> {
        Self::init(store)?;
        let mut stmt = store.conn().prepare(
            "SELECT operation_id, kind, subtype, artifact_path, status, byte_size,
                    started_at, completed_at, error_message, actor_id,
                    statements_applied, statements_failed
             FROM operation_log
             WHERE kind = 'backup' AND status = 'completed'
             ORDER BY started_at DESC
             LIMIT 1",
        )?;
        let mut rows = stmt.query_map([], Self::map_row)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    fn map_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<OperationLogEntry> {
        let kind: String = row.get(1)?;
        let subtype: String = row.get(2)?;
        let status: String = row.get(4)?;
        let started_at: String = row.get(6)?;
        let completed_at: Option<String> = row.get(7)?;
        Ok(OperationLogEntry {
            operation_id: row.get(0)?,
            kind: OperationKind::parse(&kind),
            subtype: OperationSubtype::parse(&subtype),
            artifact_path: row.get(3)?,
            status: OperationStatus::parse(&status),
            byte_size: row.get::<_, Option<i64>>(5)?.map(|v| v as u64),
            started_at: parse_timestamp(&started_at),
            completed_at: completed_at.as_deref().map(parse_timestamp),
            error_message: row.get(8)?,
            actor_id: row.get(9)?,
            statements_applied: row.get::<_, Option<i64>>(10)?.map(|v| v as u64),
            statements_failed: row.get::<_, Option<i64>>(11)?.map(|v| v as u64),
        })
    }
}

fn parse_timestamp(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn store() -> DataStore {
        DataStore::open_in_memory().unwrap()
    }

    #[test]
    fn begin_then_complete_records_one_entry() {
        let store = store();
        let id = OperationLog::begin(
            &store,
            OperationKind::Backup,
            OperationSubtype::Full,
            "admin",
        )
        .unwrap();
        OperationLog::complete(&store, &id, Some(1024), Some("a.sql"), None, None, None).unwrap();

        let entries = OperationLog::list_recent(&store, 10).unwrap();
        assert_eq!(entries.len(), 1);
        let entry = &entries[0];
        assert_eq!(entry.operation_id, id);
        assert_eq!(entry.status, OperationStatus::Completed);
        assert_eq!(entry.byte_size, Some(1024));
        assert_eq!(entry.artifact_path.as_deref(), Some("a.sql"));
        assert!(entry.completed_at.is_some());
    }

    #[test]
    fn failed_attempt_keeps_entry() {
        let store = store();
        let id = OperationLog::begin(
            &store,
            OperationKind::Restore,
            OperationSubtype::Full,
            "admin",
        )
        .unwrap();
        OperationLog::fail(&store, &id, "备份文件不存在或无效").unwrap();

        let entries = OperationLog::list_recent(&store, 10).unwrap();
        assert_eq!(entries[0].status, OperationStatus::Failed);
        assert_eq!(
            entries[0].error_message.as_deref(),
            Some("备份文件不存在或无效")
        );
    }

    #[test]
    fn terminal_status_cannot_transition_again() {
        let store = store();
        let id = OperationLog::begin(
            &store,
            OperationKind::Backup,
            OperationSubtype::Full,
            "admin",
        )
        .unwrap();
        OperationLog::complete(&store, &id, None, None, None, None, None).unwrap();

        let err = OperationLog::fail(&store, &id, "late failure").unwrap_err();
        assert_matches!(err, CatalogError::InvalidTransition(_));

        let entries = OperationLog::list_recent(&store, 10).unwrap();
        assert_eq!(entries[0].status, OperationStatus::Completed);
    }

    #[test]
    fn finishing_missing_entry_is_not_found() {
        let store = store();
        OperationLog::init(&store).unwrap();
        let err =
            OperationLog::complete(&store, "ghost-op", Some(7), Some("b.sql"), None, None, None)
                .unwrap_err();
        assert_matches!(err, CatalogError::NotFound(_));
        assert!(OperationLog::list_recent(&store, 10).unwrap().is_empty());
    }

    #[test]
    fn partial_failure_restore_reads_as_completed_with_warnings() {
        let store = store();
        let id = OperationLog::begin(
            &store,
            OperationKind::Restore,
            OperationSubtype::Full,
            "admin",
        )
        .unwrap();
        OperationLog::complete(&store, &id, None, None, Some(9), Some(1), Some("#10 失败")).unwrap();

        let entries = OperationLog::list_recent(&store, 10).unwrap();
        assert_eq!(entries[0].status, OperationStatus::Completed);
        assert!(entries[0].completed_with_warnings());
        assert_eq!(entries[0].error_message.as_deref(), Some("#10 失败"));
    }

    #[test]
    fn last_completed_backup_ignores_restores_and_failures() {
        let store = store();
        let b1 = OperationLog::begin(
            &store,
            OperationKind::Backup,
            OperationSubtype::Full,
            "admin",
        )
        .unwrap();
        OperationLog::fail(&store, &b1, "boom").unwrap();
        let r1 = OperationLog::begin(
            &store,
            OperationKind::Restore,
            OperationSubtype::Full,
            "admin",
        )
        .unwrap();
        OperationLog::complete(&store, &r1, None, None, Some(3), Some(0), None).unwrap();

        assert!(OperationLog::last_completed_backup(&store).unwrap().is_none());

        let b2 = OperationLog::begin(
            &store,
            OperationKind::Backup,
            OperationSubtype::Incremental,
            "admin",
        )
        .unwrap();
        OperationLog::complete(&store, &b2, Some(10), Some("c.sql"), None, None, None).unwrap();

        let last = OperationLog::last_completed_backup(&store).unwrap().unwrap();
        assert_eq!(last.operation_id, b2);
        assert_eq!(last.subtype, OperationSubtype::Incremental);
    }
}

//! # 恢复引擎
//!
//! 将转储文本回放到在线数据存储。
//!
//! ## 回放策略
//!
//! 1. 切分语句（词法切分，见 [`crate::statement`]，不是盲目按 `;` 扫描）
//! 2. [`ForeignKeyGuard`] 放宽外键约束，表可按文件顺序重建
//! 3. 逐条执行；单条失败记录上下文后继续，最大化数据找回
//! 4. 针对操作日志表的语句整体跳过：转储里快照的日志是历史状态
//!    （含转储时刻的 in_progress 行），活动日志才是权威审计记录，
//!    回放不得删除或倒退其中的条目
//! 5. 守卫在所有路径上恢复约束状态
//!
//! 存在失败语句时操作是"完成但有警告"，既不是静默成功也不是硬失败，
//! 如何呈现由调用方决定。致命错误（转储不可读、存储不可达、空转储）
//! 在任何语句执行之前中止，存储保持原状。
//!
//! 调用方负责恢复门禁（显式确认、恢复点），引擎自身不做确认检查。

use crate::catalog::OPERATION_LOG_TABLE;
use crate::statement::{leading_table_name, split_statements};
use crate::store::{DataStore, ForeignKeyGuard, StoreError};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// 恢复错误（均为致命类，发生在任何语句执行之前）
#[derive(Debug, thiserror::Error)]
pub enum RestoreError {
    #[error("Dump contains no statements")]
    EmptyDump,

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// 单条语句的回放失败记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayFailure {
    /// 语句序号（1 起始）
    pub index: usize,
    /// 语句在转储中的起始行
    pub line: usize,
    /// 尽力提取的目标表名
    pub table: Option<String>,
    /// 错误消息
    pub message: String,
}

/// 回放结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplaySummary {
    /// 成功执行的语句数
    pub applied: usize,
    /// 失败的语句数
    pub failed: usize,
    /// 被跳过的操作日志语句数
    pub skipped: usize,
    /// 失败明细
    pub failures: Vec<ReplayFailure>,
}

impl ReplaySummary {
    /// 是否"完成但有警告"
    pub fn has_warnings(&self) -> bool {
        self.failed > 0
    }

    /// 用于日志/用户消息的失败摘要
    pub fn failure_digest(&self) -> Option<String> {
        if self.failures.is_empty() {
            return None;
        }
        let lines: Vec<String> = self
            .failures
            .iter()
            .map(|f| {
                format!(
                    "#{} (行 {}, 表 {}): {}",
                    f.index,
                    f.line,
                    f.table.as_deref().unwrap_or("?"),
                    f.message
                )
            })
            .collect();
        Some(lines.join("; "))
    }
}

/// 回放转储文本
pub fn replay(store: &DataStore, dump_text: &str) -> Result<ReplaySummary, RestoreError> {
    let statements = split_statements(dump_text);
    if statements.is_empty() {
        return Err(RestoreError::EmptyDump);
    }

    info!("[Restore] 开始回放: {} 条语句", statements.len());

    let mut guard = ForeignKeyGuard::relax(store)?;

    let mut applied = 0usize;
    let mut skipped = 0usize;
    let mut failures = Vec::new();
    for (i, stmt) in statements.iter().enumerate() {
        let table = leading_table_name(&stmt.text);
        if table
            .as_deref()
            .is_some_and(|t| t.eq_ignore_ascii_case(OPERATION_LOG_TABLE))
        {
            debug!("[Restore] 跳过操作日志语句 #{} (行 {})", i + 1, stmt.line);
            skipped += 1;
            continue;
        }
        match store.execute_statement(&stmt.text) {
            Ok(_) => applied += 1,
            Err(e) => {
                warn!(
                    "[Restore] 语句 #{} 失败 (行 {}, 表 {:?}): {}",
                    i + 1,
                    stmt.line,
                    table,
                    e
                );
                failures.push(ReplayFailure {
                    index: i + 1,
                    line: stmt.line,
                    table,
                    message: e.to_string(),
                });
            }
        }
    }

    // 回放中途失败可能留下未提交事务（如 COMMIT 语句本身失败），
    // 提交已成功的部分，再恢复约束状态
    if !store.is_autocommit() {
        warn!("[Restore] 回放结束时仍有未提交事务，执行 COMMIT");
        if let Err(e) = store.execute_batch("COMMIT") {
            warn!("[Restore] 收尾 COMMIT 失败: {}", e);
        }
    }
    guard.restore();

    let summary = ReplaySummary {
        applied,
        failed: failures.len(),
        skipped,
        failures,
    };
    if summary.has_warnings() {
        warn!(
            "[Restore] 回放完成但有警告: applied={}, failed={}, skipped={}",
            summary.applied, summary.failed, summary.skipped
        );
    } else {
        info!(
            "[Restore] 回放完成: applied={}, skipped={}",
            summary.applied, summary.skipped
        );
    }
    Ok(summary)
}

//! # 备份管理器
//!
//! 操作边界的编排层，对外暴露六个逻辑动作：
//!
//! - 创建备份（可选打包资产归档）
//! - 下载 / 删除 / 上传制品
//! - 从制品恢复（强制显式确认 + 自动恢复点）
//! - 从归档恢复资产
//!
//! ## 门禁
//!
//! 每个变更动作先询问权限预言机；恢复额外要求输入与固定字面量
//! 完全一致的确认短语（勾选框不足以承担不可逆操作）。校验失败在
//! 任何副作用之前拒绝。
//!
//! ## 审计
//!
//! 每次备份/恢复尝试（含失败）恰好对应一条操作日志记录。组件级
//! 错误在此边界被捕获，转换为一条可执行的用户消息（不泄露内部
//! 路径）写入日志；诊断细节只进运维日志。
//!
//! 数据存储句柄由调用方按请求传入，本层不跨请求持有它。

use crate::archive::{self, ArchiveError};
use crate::artifact::{
    ArtifactError, ArtifactKind, ArtifactMetadata, ArtifactStore, ARCHIVE_EXTENSION,
    DUMP_EXTENSION,
};
use crate::catalog::{
    CatalogError, OperationKind, OperationLog, OperationLogEntry, OperationSubtype,
};
use crate::dump::{self, DumpError, DumpMode};
use crate::restore::{self, ReplaySummary, RestoreError};
use crate::store::{DataStore, StoreError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

/// 恢复确认短语（必须逐字输入，大小写敏感）
pub const CONFIRM_PHRASE: &str = "RESTORE";

/// 恢复点文件名前缀，使其可作为回滚目标被识别
pub const RESTORE_POINT_PREFIX: &str = "pre_restore_";

/// 常规备份文件名词干
const BACKUP_STEM: &str = "billing_backup";

/// 权限预言机：当前操作者是否允许备份/恢复
///
/// 认证与会话属于外部协作者，这里只消费其结论。
pub trait PermissionOracle: Send + Sync {
    fn can_backup(&self, actor: &str) -> bool;
    fn can_restore(&self, actor: &str) -> bool;
}

/// 全放行实现（测试与单机部署用）
pub struct AllowAll;

impl PermissionOracle for AllowAll {
    fn can_backup(&self, _actor: &str) -> bool {
        true
    }
    fn can_restore(&self, _actor: &str) -> bool {
        true
    }
}

/// 操作边界错误
#[derive(Debug, thiserror::Error)]
pub enum OpError {
    #[error("Permission denied for actor {0}")]
    PermissionDenied(String),

    #[error("Restore confirmation phrase mismatch")]
    ConfirmationRequired,

    #[error("Artifact error: {0}")]
    Artifact(#[from] ArtifactError),

    #[error("Dump error: {0}")]
    Dump(#[from] DumpError),

    #[error("Archive error: {0}")]
    Archive(#[from] ArchiveError),

    #[error("Restore error: {0}")]
    Restore(#[from] RestoreError),

    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Restoration point creation failed: {0}")]
    RestorationPoint(String),
}

impl OpError {
    /// 面向操作者的一条可执行消息（不含内部路径/凭据）
    pub fn user_message(&self) -> String {
        match self {
            OpError::PermissionDenied(_) => "当前账号没有执行此操作的权限".to_string(),
            OpError::ConfirmationRequired => {
                format!("请输入 {} 以确认恢复操作", CONFIRM_PHRASE)
            }
            OpError::Artifact(ArtifactError::InvalidPath(_)) => "备份文件名无效".to_string(),
            OpError::Artifact(ArtifactError::NotFound(_)) => {
                "备份文件不存在或无效".to_string()
            }
            OpError::Artifact(ArtifactError::TooLarge { max, .. }) => {
                format!("上传文件超过大小限制（{} MiB）", max / 1024 / 1024)
            }
            OpError::Artifact(ArtifactError::UnsupportedExtension(_)) => {
                format!("仅支持 .{} 与 .{} 备份文件", DUMP_EXTENSION, ARCHIVE_EXTENSION)
            }
            OpError::Dump(_) => "备份生成失败，未写入任何制品".to_string(),
            OpError::Archive(_) => "资产归档打包失败，已写入的转储备份已保留".to_string(),
            OpError::Restore(_) => "备份文件不存在或无效".to_string(),
            OpError::RestorationPoint(_) => {
                "创建恢复点失败，恢复操作未执行".to_string()
            }
            OpError::Catalog(_) | OpError::Artifact(_) | OpError::Store(_) => {
                "操作失败，请查看运维日志".to_string()
            }
        }
    }
}

/// 备份结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupOutcome {
    pub operation_id: String,
    pub artifact: ArtifactMetadata,
}

/// 恢复结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreOutcome {
    pub operation_id: String,
    pub restoration_point: ArtifactMetadata,
    pub summary: ReplaySummary,
}

/// 状态面板数据
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub last_backup: Option<OperationLogEntry>,
    pub artifact_count: usize,
    pub storage_used_bytes: u64,
}

/// 备份管理器
pub struct BackupManager {
    artifacts: ArtifactStore,
    asset_root: PathBuf,
    permissions: Arc<dyn PermissionOracle>,
}

impl BackupManager {
    pub fn new(
        artifact_dir: PathBuf,
        asset_root: PathBuf,
        permissions: Arc<dyn PermissionOracle>,
    ) -> Result<Self, OpError> {
        Ok(Self {
            artifacts: ArtifactStore::new(artifact_dir)?,
            asset_root,
            permissions,
        })
    }

    /// 制品存储（列举/下载直接复用）
    pub fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    // ========================================================================
    // 备份
    // ========================================================================

    /// 创建备份
    ///
    /// 转储序列化 →（可选）资产归档打包 → 制品写入 → 日志记录。
    /// 打包失败时已写入的转储制品保留，操作记为失败。
    pub fn create_backup(
        &self,
        store: &DataStore,
        mode: DumpMode,
        include_assets: bool,
        actor: &str,
    ) -> Result<BackupOutcome, OpError> {
        if !self.permissions.can_backup(actor) {
            return Err(OpError::PermissionDenied(actor.to_string()));
        }

        let subtype = match mode {
            DumpMode::Full => OperationSubtype::Full,
            DumpMode::Incremental => OperationSubtype::Incremental,
        };
        let operation_id = OperationLog::begin(store, OperationKind::Backup, subtype, actor)?;

        match self.create_backup_inner(store, mode, include_assets) {
            Ok(artifact) => {
                OperationLog::complete(
                    store,
                    &operation_id,
                    Some(artifact.size_bytes),
                    Some(&artifact.filename),
                    None,
                    None,
                    None,
                )?;
                info!(
                    "[Backup] 备份完成: {} ({} bytes)",
                    artifact.filename, artifact.size_bytes
                );
                Ok(BackupOutcome {
                    operation_id,
                    artifact,
                })
            }
            Err(e) => {
                error!("[Backup] 备份失败: {}", e);
                if let Err(log_err) = OperationLog::fail(store, &operation_id, &e.user_message()) {
                    warn!("[Backup] 失败日志写入失败: {}", log_err);
                }
                Err(e)
            }
        }
    }

    fn create_backup_inner(
        &self,
        store: &DataStore,
        mode: DumpMode,
        include_assets: bool,
    ) -> Result<ArtifactMetadata, OpError> {
        // 转储完全成功后才落盘
        let text = dump::serialize(store, mode)?;
        let stem = artifact_stem();
        let dump_filename = format!("{}.{}", stem, DUMP_EXTENSION);
        let dump_meta = self.artifacts.write(&dump_filename, text.as_bytes())?;

        if !include_assets {
            return Ok(dump_meta);
        }

        // 打包成功后归档替换纯转储制品；失败则保留转储
        let archive_filename = format!("{}.{}", stem, ARCHIVE_EXTENSION);
        let dump_path = self.artifacts.resolve(&dump_filename)?;
        let archive_path = self.artifacts.resolve(&archive_filename)?;
        match archive::pack(&dump_path, &self.asset_root, &archive_path) {
            Ok(summary) => {
                if let Err(e) = self.artifacts.delete(&dump_filename) {
                    warn!("[Backup] 归档后删除转储制品失败: {}", e);
                }
                Ok(ArtifactMetadata {
                    filename: archive_filename,
                    size_bytes: summary.byte_size,
                    modified_at: chrono::Utc::now(),
                    kind: ArtifactKind::DumpWithAssets,
                    sha256: None,
                })
            }
            Err(e) => {
                warn!(
                    "[Backup] 资产打包失败，保留转储制品 {}: {}",
                    dump_filename, e
                );
                Err(OpError::Archive(e))
            }
        }
    }

    // ========================================================================
    // 恢复点
    // ========================================================================

    /// 创建恢复点：恢复执行前的全量安全快照
    ///
    /// 失败时恢复不得继续——没有安全快照的恢复是不可逆的。
    pub fn create_restoration_point(
        &self,
        store: &DataStore,
        actor: &str,
    ) -> Result<ArtifactMetadata, OpError> {
        let operation_id =
            OperationLog::begin(store, OperationKind::Backup, OperationSubtype::Full, actor)?;

        let result = (|| -> Result<ArtifactMetadata, OpError> {
            let text = dump::serialize(store, DumpMode::Full)?;
            let filename = format!("{}{}.{}", RESTORE_POINT_PREFIX, artifact_stem(), DUMP_EXTENSION);
            Ok(self.artifacts.write(&filename, text.as_bytes())?)
        })();

        match result {
            Ok(meta) => {
                OperationLog::complete(
                    store,
                    &operation_id,
                    Some(meta.size_bytes),
                    Some(&meta.filename),
                    None,
                    None,
                    None,
                )?;
                info!("[Backup] 恢复点已创建: {}", meta.filename);
                Ok(meta)
            }
            Err(e) => {
                if let Err(log_err) = OperationLog::fail(store, &operation_id, &e.user_message()) {
                    warn!("[Backup] 失败日志写入失败: {}", log_err);
                }
                Err(OpError::RestorationPoint(e.to_string()))
            }
        }
    }

    // ========================================================================
    // 恢复
    // ========================================================================

    /// 从制品恢复
    ///
    /// 顺序：权限 → 确认短语 → 读取转储（致命错误在此拦截）→
    /// 恢复点 → 回放 → 日志。确认短语不匹配时恢复引擎与恢复点
    /// 均不会被触及。
    pub fn restore_from_artifact(
        &self,
        store: &DataStore,
        filename: &str,
        confirmation: &str,
        actor: &str,
    ) -> Result<RestoreOutcome, OpError> {
        if !self.permissions.can_restore(actor) {
            return Err(OpError::PermissionDenied(actor.to_string()));
        }
        if confirmation != CONFIRM_PHRASE {
            warn!("[Restore] 确认短语不匹配，拒绝恢复（制品 {}）", filename);
            return Err(OpError::ConfirmationRequired);
        }
        // 纯校验（文件名、扩展名）不留日志；从这里往后每次尝试
        // 恰好一条日志记录，包括制品不可读的致命失败
        self.artifacts.resolve(filename)?;
        if ArtifactKind::from_filename(filename).is_none() {
            return Err(OpError::Artifact(ArtifactError::UnsupportedExtension(
                filename.to_string(),
            )));
        }

        let operation_id =
            OperationLog::begin(store, OperationKind::Restore, OperationSubtype::Full, actor)?;

        // 读取转储文本；不可读属于致命错误，记 Failed 后中止
        let text = match self.read_dump_text(filename) {
            Ok(text) => text,
            Err(e) => {
                error!("[Restore] 转储读取失败，中止恢复: {}", e);
                if let Err(log_err) = OperationLog::fail(store, &operation_id, &e.user_message()) {
                    warn!("[Restore] 失败日志写入失败: {}", log_err);
                }
                return Err(e);
            }
        };

        // 安全快照先行
        let restoration_point = match self.create_restoration_point(store, actor) {
            Ok(meta) => meta,
            Err(e) => {
                error!("[Restore] 恢复点创建失败，中止恢复: {}", e);
                if let Err(log_err) = OperationLog::fail(store, &operation_id, &e.user_message()) {
                    warn!("[Restore] 失败日志写入失败: {}", log_err);
                }
                return Err(e);
            }
        };

        match restore::replay(store, &text) {
            Ok(summary) => {
                let warning = summary.failure_digest();
                OperationLog::complete(
                    store,
                    &operation_id,
                    Some(text.len() as u64),
                    Some(filename),
                    Some(summary.applied as u64),
                    Some(summary.failed as u64),
                    warning.as_deref(),
                )?;
                if summary.has_warnings() {
                    warn!(
                        "[Restore] 恢复完成但有警告: applied={}, failed={}",
                        summary.applied, summary.failed
                    );
                }
                Ok(RestoreOutcome {
                    operation_id,
                    restoration_point,
                    summary,
                })
            }
            Err(e) => {
                error!("[Restore] 恢复失败: {}", e);
                let op_err = OpError::Restore(e);
                if let Err(log_err) =
                    OperationLog::fail(store, &operation_id, &op_err.user_message())
                {
                    warn!("[Restore] 失败日志写入失败: {}", log_err);
                }
                Err(op_err)
            }
        }
    }

    /// 读取制品中的转储文本：`.sql` 直接读取，`.zip` 取固定转储条目
    fn read_dump_text(&self, filename: &str) -> Result<String, OpError> {
        let path = self.artifacts.resolve(filename)?;
        if !path.is_file() {
            return Err(OpError::Artifact(ArtifactError::NotFound(
                filename.to_string(),
            )));
        }
        match artifact_extension(&path) {
            Some(ext) if ext.eq_ignore_ascii_case(ARCHIVE_EXTENSION) => {
                Ok(archive::read_dump_entry(&path)?)
            }
            Some(ext) if ext.eq_ignore_ascii_case(DUMP_EXTENSION) => {
                Ok(self.artifacts.read_to_string(filename)?)
            }
            _ => Err(OpError::Artifact(ArtifactError::UnsupportedExtension(
                filename.to_string(),
            ))),
        }
    }

    /// 从归档制品恢复资产树到资产根目录
    pub fn restore_assets_from_archive(
        &self,
        store: &DataStore,
        filename: &str,
        actor: &str,
    ) -> Result<usize, OpError> {
        if !self.permissions.can_restore(actor) {
            return Err(OpError::PermissionDenied(actor.to_string()));
        }
        let path = self.artifacts.resolve(filename)?;
        if !path.is_file() {
            return Err(OpError::Artifact(ArtifactError::NotFound(
                filename.to_string(),
            )));
        }

        let operation_id = OperationLog::begin(
            store,
            OperationKind::Restore,
            OperationSubtype::Assets,
            actor,
        )?;
        match archive::unpack_assets(&path, &self.asset_root) {
            Ok(count) => {
                OperationLog::complete(
                    store,
                    &operation_id,
                    None,
                    Some(filename),
                    None,
                    None,
                    None,
                )?;
                Ok(count)
            }
            Err(e) => {
                let op_err = OpError::Archive(e);
                if let Err(log_err) =
                    OperationLog::fail(store, &operation_id, &op_err.user_message())
                {
                    warn!("[Restore] 失败日志写入失败: {}", log_err);
                }
                Err(op_err)
            }
        }
    }

    // ========================================================================
    // 制品管理
    // ========================================================================

    /// 上传制品
    pub fn upload_artifact(
        &self,
        store: &DataStore,
        original_name: &str,
        declared_size: u64,
        reader: &mut dyn Read,
        actor: &str,
    ) -> Result<BackupOutcome, OpError> {
        if !self.permissions.can_backup(actor) {
            return Err(OpError::PermissionDenied(actor.to_string()));
        }
        // 大小/扩展名校验在任何字节持久化之前完成
        let operation_id =
            OperationLog::begin(store, OperationKind::Backup, OperationSubtype::Upload, actor)?;
        match self.artifacts.ingest_upload(original_name, declared_size, reader) {
            Ok(artifact) => {
                OperationLog::complete(
                    store,
                    &operation_id,
                    Some(artifact.size_bytes),
                    Some(&artifact.filename),
                    None,
                    None,
                    None,
                )?;
                Ok(BackupOutcome {
                    operation_id,
                    artifact,
                })
            }
            Err(e) => {
                let op_err = OpError::Artifact(e);
                if let Err(log_err) =
                    OperationLog::fail(store, &operation_id, &op_err.user_message())
                {
                    warn!("[Backup] 失败日志写入失败: {}", log_err);
                }
                Err(op_err)
            }
        }
    }

    /// 打开制品用于下载
    pub fn download_artifact(&self, filename: &str) -> Result<fs::File, OpError> {
        Ok(self.artifacts.open(filename)?)
    }

    /// 删除制品
    pub fn delete_artifact(&self, filename: &str, actor: &str) -> Result<(), OpError> {
        if !self.permissions.can_backup(actor) {
            return Err(OpError::PermissionDenied(actor.to_string()));
        }
        Ok(self.artifacts.delete(filename)?)
    }

    /// 状态面板：最近备份 + 存储占用
    pub fn status(&self, store: &DataStore) -> Result<StatusReport, OpError> {
        let artifacts = self.artifacts.list()?;
        Ok(StatusReport {
            last_backup: OperationLog::last_completed_backup(store)?,
            artifact_count: artifacts.len(),
            storage_used_bytes: artifacts.iter().map(|a| a.size_bytes).sum(),
        })
    }
}

/// 生成制品文件名词干：`billing_backup_<时间戳>_<8位随机>`
///
/// 时间戳粒度为秒，同一时钟滴答内的并发请求靠随机后缀避免碰撞。
fn artifact_stem() -> String {
    let timestamp = chrono::Utc::now().format("%Y-%m-%d_%H-%M-%S");
    let rand8 = &uuid::Uuid::new_v4().simple().to_string()[..8];
    format!("{}_{}_{}", BACKUP_STEM, timestamp, rand8)
}

fn artifact_extension(path: &Path) -> Option<&str> {
    path.extension().and_then(|e| e.to_str())
}

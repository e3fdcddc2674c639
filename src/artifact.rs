//! # 制品存储
//!
//! 管理备份制品目录（扁平，无子目录）：列举、读取、写入、删除，
//! 以及上传接收与重命名。
//!
//! ## 路径安全
//!
//! 每次操作都重新校验文件名，任何操作都不信任此前校验过的路径
//! （防御 TOCTOU 及同类缺陷）。含 `..`、路径分隔符、NUL 或以点
//! 开头的文件名一律拒绝。
//!
//! ## 写入
//!
//! 统一走"临时文件 + sync + 原子重命名"，同时计算 SHA256。
//! 上传在持久化任何字节之前先按申报大小拒绝超限文件。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// 转储制品扩展名
pub const DUMP_EXTENSION: &str = "sql";

/// 归档制品扩展名
pub const ARCHIVE_EXTENSION: &str = "zip";

/// 上传大小上限（100 MiB）
pub const MAX_UPLOAD_BYTES: u64 = 100 * 1024 * 1024;

/// 制品错误
#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("Invalid artifact path: {0}")]
    InvalidPath(String),

    #[error("Artifact not found: {0}")]
    NotFound(String),

    #[error("Upload too large: {declared} bytes (max {max})")]
    TooLarge { declared: u64, max: u64 },

    #[error("Unsupported artifact extension: {0}")]
    UnsupportedExtension(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// 制品类型，由扩展名推断
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    /// 纯转储（`.sql`）
    DumpOnly,
    /// 转储 + 资产归档（`.zip`）
    DumpWithAssets,
}

impl ArtifactKind {
    /// 由文件扩展名推断制品类型；未知扩展名返回 `None`
    pub fn from_filename(name: &str) -> Option<Self> {
        let ext = Path::new(name).extension()?.to_str()?;
        if ext.eq_ignore_ascii_case(DUMP_EXTENSION) {
            Some(ArtifactKind::DumpOnly)
        } else if ext.eq_ignore_ascii_case(ARCHIVE_EXTENSION) {
            Some(ArtifactKind::DumpWithAssets)
        } else {
            None
        }
    }
}

/// 制品元数据
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactMetadata {
    pub filename: String,
    pub size_bytes: u64,
    pub modified_at: DateTime<Utc>,
    pub kind: ArtifactKind,
    /// 写入时计算的校验和；列举已有文件时不重算
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

/// 制品存储
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    /// 打开（必要时创建）制品目录
    pub fn new(root: PathBuf) -> Result<Self, ArtifactError> {
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// 制品目录根路径
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// 校验文件名并解析为目录内路径
    ///
    /// 每次调用都完整校验，绝不复用旧结论。
    pub fn resolve(&self, filename: &str) -> Result<PathBuf, ArtifactError> {
        validate_filename(filename)?;
        Ok(self.root.join(filename))
    }

    /// 列举全部制品，按修改时间降序
    ///
    /// 扩展名不属于两种已知类型的文件不会出现在列表中。
    pub fn list(&self) -> Result<Vec<ArtifactMetadata>, ArtifactError> {
        let mut out = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!("[ArtifactStore] 目录项读取错误（已跳过）: {}", e);
                    continue;
                }
            };
            let meta = entry.metadata()?;
            if !meta.is_file() {
                continue;
            }
            let filename = entry.file_name().to_string_lossy().to_string();
            let Some(kind) = ArtifactKind::from_filename(&filename) else {
                continue;
            };
            let modified_at = meta
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());
            out.push(ArtifactMetadata {
                filename,
                size_bytes: meta.len(),
                modified_at,
                kind,
                sha256: None,
            });
        }
        out.sort_by(|a, b| b.modified_at.cmp(&a.modified_at));
        Ok(out)
    }

    /// 打开制品用于下载或恢复
    pub fn open(&self, filename: &str) -> Result<File, ArtifactError> {
        let path = self.resolve(filename)?;
        if !path.is_file() {
            return Err(ArtifactError::NotFound(filename.to_string()));
        }
        Ok(File::open(path)?)
    }

    /// 读取制品全文（转储文本）
    pub fn read_to_string(&self, filename: &str) -> Result<String, ArtifactError> {
        let mut file = self.open(filename)?;
        let mut text = String::new();
        file.read_to_string(&mut text)?;
        Ok(text)
    }

    /// 删除制品
    pub fn delete(&self, filename: &str) -> Result<(), ArtifactError> {
        let path = self.resolve(filename)?;
        if !path.is_file() {
            return Err(ArtifactError::NotFound(filename.to_string()));
        }
        fs::remove_file(path)?;
        info!("[ArtifactStore] 已删除制品: {}", filename);
        Ok(())
    }

    /// 写入制品（临时文件 + 原子重命名）
    pub fn write(&self, filename: &str, bytes: &[u8]) -> Result<ArtifactMetadata, ArtifactError> {
        let path = self.resolve(filename)?;
        let kind = ArtifactKind::from_filename(filename)
            .ok_or_else(|| ArtifactError::UnsupportedExtension(filename.to_string()))?;

        let temp_path = self.root.join(format!("{}.tmp", filename));
        let result = (|| -> Result<(), ArtifactError> {
            let mut file = File::create(&temp_path)?;
            file.write_all(bytes)?;
            file.sync_all()?;
            Ok(())
        })();
        if let Err(e) = result {
            let _ = fs::remove_file(&temp_path);
            return Err(e);
        }
        fs::rename(&temp_path, &path).map_err(|e| {
            let _ = fs::remove_file(&temp_path);
            ArtifactError::Io(e)
        })?;

        let sha256 = hex::encode(Sha256::digest(bytes));
        info!(
            "[ArtifactStore] 已写入制品: {} ({} bytes)",
            filename,
            bytes.len()
        );
        Ok(ArtifactMetadata {
            filename: filename.to_string(),
            size_bytes: bytes.len() as u64,
            modified_at: Utc::now(),
            kind,
            sha256: Some(sha256),
        })
    }

    /// 接收上传：校验申报大小与扩展名，重命名后落盘
    ///
    /// 生成文件名 `uploaded_<时间戳>_<净化原名>`；净化只保留
    /// 字母数字、`.`、`_`、`-`。申报大小超限时不持久化任何字节。
    pub fn ingest_upload(
        &self,
        original_name: &str,
        declared_size: u64,
        reader: &mut dyn Read,
    ) -> Result<ArtifactMetadata, ArtifactError> {
        if declared_size > MAX_UPLOAD_BYTES {
            return Err(ArtifactError::TooLarge {
                declared: declared_size,
                max: MAX_UPLOAD_BYTES,
            });
        }

        let sanitized = sanitize_upload_name(original_name);
        if ArtifactKind::from_filename(&sanitized).is_none() {
            return Err(ArtifactError::UnsupportedExtension(
                original_name.to_string(),
            ));
        }

        let timestamp = Utc::now().format("%Y-%m-%d_%H-%M-%S");
        let filename = format!("uploaded_{}_{}", timestamp, sanitized);

        // 申报大小可能谎报，复制时再设硬上限
        let mut bytes = Vec::new();
        let read = reader
            .take(MAX_UPLOAD_BYTES + 1)
            .read_to_end(&mut bytes)? as u64;
        if read > MAX_UPLOAD_BYTES {
            return Err(ArtifactError::TooLarge {
                declared: read,
                max: MAX_UPLOAD_BYTES,
            });
        }

        self.write(&filename, &bytes)
    }

    /// 制品目录当前占用的总字节数
    pub fn storage_used(&self) -> Result<u64, ArtifactError> {
        Ok(self.list()?.iter().map(|a| a.size_bytes).sum())
    }
}

/// 文件名安全校验
///
/// 拒绝：空名、路径分隔符、`..` 子串、NUL、以点开头。
pub fn validate_filename(filename: &str) -> Result<(), ArtifactError> {
    let reject = |why: &str| {
        Err(ArtifactError::InvalidPath(format!(
            "{} ({})",
            filename, why
        )))
    };

    if filename.is_empty() {
        return reject("empty");
    }
    if filename.contains("..") {
        return reject("parent reference");
    }
    if filename.contains('/') || filename.contains('\\') {
        return reject("path separator");
    }
    if filename.contains('\0') {
        return reject("NUL byte");
    }
    if filename.starts_with('.') {
        return reject("hidden file");
    }
    Ok(())
}

/// 上传原名净化：保留 `[A-Za-z0-9._-]`，其余字符剥除
pub fn sanitize_upload_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        .collect();
    let cleaned = cleaned.trim_start_matches('.').to_string();
    if cleaned.is_empty() {
        "backup".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use tempfile::TempDir;

    fn store() -> (TempDir, ArtifactStore) {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path().join("artifacts")).unwrap();
        (dir, store)
    }

    #[test]
    fn rejects_parent_traversal() {
        let (_dir, store) = store();
        assert_matches!(
            store.open("../../etc/passwd"),
            Err(ArtifactError::InvalidPath(_))
        );
        assert_matches!(
            store.delete("..%2fsecrets"),
            Err(ArtifactError::InvalidPath(_))
        );
        assert_matches!(
            store.resolve("a/b.sql"),
            Err(ArtifactError::InvalidPath(_))
        );
        assert_matches!(
            store.resolve("C:\\evil.sql"),
            Err(ArtifactError::InvalidPath(_))
        );
    }

    #[test]
    fn write_and_list_infers_kind() {
        let (_dir, store) = store();
        store.write("billing_backup_a.sql", b"-- dump").unwrap();
        store.write("billing_backup_b.zip", b"PK fake").unwrap();
        fs::write(store.root().join("notes.txt"), b"ignored").unwrap();

        let listed = store.list().unwrap();
        assert_eq!(listed.len(), 2);
        let kinds: Vec<_> = listed
            .iter()
            .map(|a| (a.filename.as_str(), a.kind))
            .collect();
        assert!(kinds.contains(&("billing_backup_a.sql", ArtifactKind::DumpOnly)));
        assert!(kinds.contains(&("billing_backup_b.zip", ArtifactKind::DumpWithAssets)));
    }

    #[test]
    fn write_computes_checksum_and_no_temp_left() {
        let (_dir, store) = store();
        let meta = store.write("x.sql", b"hello").unwrap();
        assert_eq!(
            meta.sha256.as_deref(),
            Some("2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824")
        );
        assert!(!store.root().join("x.sql.tmp").exists());
    }

    #[test]
    fn delete_missing_is_not_found() {
        let (_dir, store) = store();
        assert_matches!(store.delete("missing.sql"), Err(ArtifactError::NotFound(_)));
    }

    #[test]
    fn upload_over_ceiling_rejected_before_persisting() {
        let (_dir, store) = store();
        let declared = 101 * 1024 * 1024;
        let mut reader: &[u8] = b"small body";
        let err = store
            .ingest_upload("big.sql", declared, &mut reader)
            .unwrap_err();
        assert_matches!(err, ArtifactError::TooLarge { .. });
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn upload_rejects_unknown_extension() {
        let (_dir, store) = store();
        let mut reader: &[u8] = b"#!/bin/sh";
        let err = store.ingest_upload("evil.sh", 9, &mut reader).unwrap_err();
        assert_matches!(err, ArtifactError::UnsupportedExtension(_));
    }

    #[test]
    fn upload_sanitizes_and_renames() {
        let (_dir, store) = store();
        let mut reader: &[u8] = b"-- dump";
        let meta = store
            .ingest_upload("../貴重 data (1).sql", 7, &mut reader)
            .unwrap();
        assert!(meta.filename.starts_with("uploaded_"));
        assert!(meta.filename.ends_with("data1.sql"));
        assert_eq!(meta.kind, ArtifactKind::DumpOnly);
    }

    #[test]
    fn sanitize_keeps_allowlist_only() {
        assert_eq!(sanitize_upload_name("a b/c\\d.sql"), "abcd.sql");
        assert_eq!(sanitize_upload_name("日本語"), "backup");
        assert_eq!(sanitize_upload_name("..hidden.sql"), "hidden.sql");
    }

    #[test]
    fn storage_used_sums_artifacts() {
        let (_dir, store) = store();
        store.write("a.sql", b"12345").unwrap();
        store.write("b.zip", b"123").unwrap();
        assert_eq!(store.storage_used().unwrap(), 8);
    }
}

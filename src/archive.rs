//! # 归档打包器
//!
//! 将转储与上传资产目录打包为单个 ZIP 容器，并提供反向的资产解包。
//!
//! ## 容器布局
//!
//! - `database_backup.sql` — 固定条目名的转储文件
//! - `uploads/<相对路径>` — 资产目录下的每个普通文件
//!
//! ## 原子性
//!
//! 先写入同目录临时文件，`finish()` 成功后原子重命名到目标路径；
//! 任何一步失败都不会在目标位置留下半成品容器。
//!
//! ## 安全
//!
//! - 枚举资产时跳过符号链接（防跟随攻击），遍历错误记录后跳过
//! - 解包时校验条目数量、解压总量与压缩比（zip bomb 防护），
//!   并用 `mangled_name` + 包含性检查防御 ZipSlip

use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;
use zip::write::FileOptions;
use zip::CompressionMethod;
use zip::ZipWriter;

/// 容器内转储条目的固定名称
pub const DUMP_ENTRY_NAME: &str = "database_backup.sql";

/// 容器内资产树的固定前缀
pub const ASSET_ENTRY_PREFIX: &str = "uploads/";

/// 解包安全阈值（防止 zip bomb）
const MAX_UNPACK_FILES: usize = 100_000;
const MAX_UNPACK_UNCOMPRESSED_BYTES: u64 = 10 * 1024 * 1024 * 1024; // 10 GiB
const MAX_UNPACK_COMPRESSION_RATIO: f64 = 200.0;

/// 记录并跳过遍历中的错误，避免静默丢弃
fn log_and_skip_walk_err(
    result: Result<walkdir::DirEntry, walkdir::Error>,
) -> Option<walkdir::DirEntry> {
    match result {
        Ok(v) => Some(v),
        Err(e) => {
            warn!("[Archive] 目录遍历错误（已跳过）: {}", e);
            None
        }
    }
}

/// 归档错误
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ZIP error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("Cannot open container for writing: {0}")]
    ContainerOpen(String),

    #[error("Cannot read asset: {path}")]
    AssetRead { path: PathBuf },

    #[error("Container has no {DUMP_ENTRY_NAME} entry")]
    MissingDump,

    #[error("Unsafe archive rejected: {0}")]
    UnsafeArchive(String),
}

/// 打包结果统计
#[derive(Debug, Clone)]
pub struct PackSummary {
    /// 打包的资产文件数（不含转储条目）
    pub asset_count: usize,
    /// 容器最终字节数
    pub byte_size: u64,
}

/// 将转储与资产目录打包为一个 ZIP 容器
///
/// `asset_root` 不存在或为空时只打包转储条目。失败时不留下半成品。
pub fn pack(dump_path: &Path, asset_root: &Path, dest: &Path) -> Result<PackSummary, ArchiveError> {
    let temp_path = temp_sibling(dest);
    let result = pack_to_temp(dump_path, asset_root, &temp_path);

    match result {
        Ok(asset_count) => {
            fs::rename(&temp_path, dest).map_err(|e| {
                let _ = fs::remove_file(&temp_path);
                ArchiveError::Io(e)
            })?;
            let byte_size = fs::metadata(dest)?.len();
            info!(
                "[Archive] 打包完成: {:?}, 资产 {} 个, {} bytes",
                dest, asset_count, byte_size
            );
            Ok(PackSummary {
                asset_count,
                byte_size,
            })
        }
        Err(e) => {
            let _ = fs::remove_file(&temp_path);
            Err(e)
        }
    }
}

fn pack_to_temp(
    dump_path: &Path,
    asset_root: &Path,
    temp_path: &Path,
) -> Result<usize, ArchiveError> {
    let file = File::create(temp_path)
        .map_err(|e| ArchiveError::ContainerOpen(format!("{:?}: {}", temp_path, e)))?;
    let mut writer = ZipWriter::new(file);
    let options = FileOptions::default().compression_method(CompressionMethod::Deflated);

    // 1. 转储条目（固定名称）
    let mut dump_file = File::open(dump_path).map_err(|_| ArchiveError::AssetRead {
        path: dump_path.to_path_buf(),
    })?;
    writer.start_file(DUMP_ENTRY_NAME, options)?;
    std::io::copy(&mut dump_file, &mut writer).map_err(|_| ArchiveError::AssetRead {
        path: dump_path.to_path_buf(),
    })?;

    // 2. 资产树
    let mut asset_count = 0usize;
    if asset_root.is_dir() {
        for entry in WalkDir::new(asset_root)
            .into_iter()
            .filter_map(log_and_skip_walk_err)
        {
            let path = entry.path();
            if entry.path_is_symlink() {
                warn!("[Archive] 跳过符号链接: {:?}", path);
                continue;
            }
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = match path.strip_prefix(asset_root) {
                Ok(r) => r,
                Err(_) => continue,
            };
            let entry_name = format!(
                "{}{}",
                ASSET_ENTRY_PREFIX,
                relative.to_string_lossy().replace('\\', "/")
            );

            debug!("[Archive] 添加资产: {}", entry_name);
            let mut f = File::open(path).map_err(|_| ArchiveError::AssetRead {
                path: path.to_path_buf(),
            })?;
            writer.start_file(&entry_name, options)?;
            // 流式写入，避免大文件 read_to_end 导致内存峰值
            std::io::copy(&mut f, &mut writer).map_err(|_| ArchiveError::AssetRead {
                path: path.to_path_buf(),
            })?;
            asset_count += 1;
        }
    }

    writer.finish()?;
    Ok(asset_count)
}

/// 读取容器内的转储条目文本
pub fn read_dump_entry(archive_path: &Path) -> Result<String, ArchiveError> {
    let file = File::open(archive_path)?;
    let mut archive = zip::ZipArchive::new(file)?;
    let mut entry = archive.by_name(DUMP_ENTRY_NAME).map_err(|e| match e {
        zip::result::ZipError::FileNotFound => ArchiveError::MissingDump,
        other => ArchiveError::Zip(other),
    })?;
    let mut text = String::new();
    entry.read_to_string(&mut text)?;
    Ok(text)
}

/// 从容器解包 `uploads/` 资产树到目标根目录
///
/// 只提取资产条目，转储条目不落盘。返回解出的文件数。
pub fn unpack_assets(archive_path: &Path, target_root: &Path) -> Result<usize, ArchiveError> {
    info!(
        "[Archive] 开始解包资产: {:?} -> {:?}",
        archive_path, target_root
    );

    let file = File::open(archive_path)?;
    let mut archive = zip::ZipArchive::new(file)?;
    validate_archive(&mut archive)?;

    fs::create_dir_all(target_root)?;

    let mut file_count = 0usize;
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let mangled = entry.mangled_name();
        let Ok(relative) = mangled.strip_prefix(ASSET_ENTRY_PREFIX.trim_end_matches('/')) else {
            continue;
        };
        if relative.as_os_str().is_empty() {
            continue;
        }

        let outpath = target_root.join(relative);
        // ZipSlip 防御：目标必须仍在资产根目录内
        if !outpath.starts_with(target_root) {
            return Err(ArchiveError::UnsafeArchive(format!(
                "条目逃逸目标目录: {:?}",
                mangled
            )));
        }

        if entry.is_dir() {
            fs::create_dir_all(&outpath)?;
        } else {
            if let Some(parent) = outpath.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut outfile = File::create(&outpath)?;
            std::io::copy(&mut entry, &mut outfile)?;
            file_count += 1;
        }
    }

    info!("[Archive] 资产解包完成: {} 个文件", file_count);
    Ok(file_count)
}

/// 解包前的容器安全校验
fn validate_archive(archive: &mut zip::ZipArchive<File>) -> Result<(), ArchiveError> {
    if archive.len() > MAX_UNPACK_FILES {
        return Err(ArchiveError::UnsafeArchive(format!(
            "条目数量超限: {} > {}",
            archive.len(),
            MAX_UNPACK_FILES
        )));
    }

    let mut total_uncompressed: u64 = 0;
    for i in 0..archive.len() {
        let entry = archive.by_index(i)?;
        let size = entry.size();
        let compressed = entry.compressed_size();
        total_uncompressed = total_uncompressed.saturating_add(size);

        if total_uncompressed > MAX_UNPACK_UNCOMPRESSED_BYTES {
            return Err(ArchiveError::UnsafeArchive(format!(
                "解压总量超限: {} bytes",
                total_uncompressed
            )));
        }
        if compressed > 0 {
            let ratio = size as f64 / compressed as f64;
            if ratio > MAX_UNPACK_COMPRESSION_RATIO {
                return Err(ArchiveError::UnsafeArchive(format!(
                    "压缩比异常: {:.1} > {:.1}",
                    ratio, MAX_UNPACK_COMPRESSION_RATIO
                )));
            }
        }
    }

    Ok(())
}

fn temp_sibling(dest: &Path) -> PathBuf {
    let mut name = dest
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "archive.zip".to_string());
    name.push_str(".tmp");
    dest.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_fixture(dir: &Path) -> (PathBuf, PathBuf) {
        let dump_path = dir.join("dump.sql");
        fs::write(&dump_path, "CREATE TABLE a (x);\nCOMMIT;\n").unwrap();

        let asset_root = dir.join("uploads");
        fs::create_dir_all(asset_root.join("logos")).unwrap();
        fs::write(asset_root.join("logos/assembly.png"), b"\x89PNG fake").unwrap();
        fs::write(asset_root.join("receipt.pdf"), b"%PDF fake").unwrap();
        (dump_path, asset_root)
    }

    #[test]
    fn pack_bundles_dump_and_assets() {
        let dir = TempDir::new().unwrap();
        let (dump_path, asset_root) = write_fixture(dir.path());
        let dest = dir.path().join("bundle.zip");

        let summary = pack(&dump_path, &asset_root, &dest).unwrap();
        assert_eq!(summary.asset_count, 2);
        assert!(dest.exists());
        assert!(!temp_sibling(&dest).exists());

        let text = read_dump_entry(&dest).unwrap();
        assert!(text.contains("CREATE TABLE a"));
    }

    #[test]
    fn pack_without_asset_root_still_produces_container() {
        let dir = TempDir::new().unwrap();
        let (dump_path, _) = write_fixture(dir.path());
        let dest = dir.path().join("bundle.zip");

        let summary = pack(&dump_path, &dir.path().join("missing"), &dest).unwrap();
        assert_eq!(summary.asset_count, 0);
        assert!(read_dump_entry(&dest).is_ok());
    }

    #[test]
    fn pack_with_unreadable_dump_leaves_no_partial_container() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("bundle.zip");

        let err = pack(&dir.path().join("missing.sql"), dir.path(), &dest).unwrap_err();
        assert!(matches!(err, ArchiveError::AssetRead { .. }));
        assert!(!dest.exists());
        assert!(!temp_sibling(&dest).exists());
    }

    #[test]
    fn unpack_restores_asset_tree_only() {
        let dir = TempDir::new().unwrap();
        let (dump_path, asset_root) = write_fixture(dir.path());
        let dest = dir.path().join("bundle.zip");
        pack(&dump_path, &asset_root, &dest).unwrap();

        let target = dir.path().join("restored");
        let count = unpack_assets(&dest, &target).unwrap();
        assert_eq!(count, 2);
        assert!(target.join("logos/assembly.png").exists());
        assert!(target.join("receipt.pdf").exists());
        // 转储条目不应被解包到资产目录
        assert!(!target.join(DUMP_ENTRY_NAME).exists());
    }

    #[test]
    fn read_dump_entry_missing_entry() {
        let dir = TempDir::new().unwrap();
        let zip_path = dir.path().join("odd.zip");
        let f = File::create(&zip_path).unwrap();
        let mut w = ZipWriter::new(f);
        w.start_file("other.txt", FileOptions::default()).unwrap();
        w.write_all(b"hello").unwrap();
        w.finish().unwrap();

        let err = read_dump_entry(&zip_path).unwrap_err();
        assert!(matches!(err, ArchiveError::MissingDump));
    }
}

//! # billing-backup
//!
//! 市政收费管理系统的备份与恢复引擎。
//!
//! ## 架构概览
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                        备份/恢复引擎                            │
//! ├────────────────────────────────────────────────────────────────┤
//! │                                                                │
//! │  ┌──────────┐   ┌──────────┐   ┌───────────────┐              │
//! │  │   dump   │──▶│ archive  │──▶│   artifact    │              │
//! │  │ (转储序列化)│   │ (资产打包) │   │  (制品存储)    │              │
//! │  └──────────┘   └──────────┘   └───────────────┘              │
//! │        ▲                              │                       │
//! │        │ 恢复点                        ▼                       │
//! │  ┌───────────────────────┐   ┌───────────────┐                │
//! │  │       manager         │──▶│    restore    │                │
//! │  │ (编排/门禁/恢复点)       │   │  (回放引擎)     │                │
//! │  └───────────────────────┘   └───────────────┘                │
//! │        │                              │                       │
//! │        ▼                              ▼                       │
//! │  ┌──────────┐                 ┌───────────────┐               │
//! │  │   job    │                 │    catalog    │               │
//! │  │ (后台任务) │                 │  (操作日志)     │               │
//! │  └──────────┘                 └───────────────┘               │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! 数据存储句柄（[`store::DataStore`]）由调用方显式传入各组件，
//! 认证、权限判定、HTML 渲染等属于外部协作者，本 crate 只消费
//! 其接口（[`manager::PermissionOracle`]）。

pub mod archive;
pub mod artifact;
pub mod catalog;
pub mod dump;
pub mod job;
pub mod manager;
pub mod restore;
pub mod statement;
pub mod store;

pub use artifact::{ArtifactKind, ArtifactMetadata, ArtifactStore};
pub use catalog::{OperationKind, OperationLog, OperationLogEntry, OperationStatus};
pub use dump::DumpMode;
pub use job::{JobKind, JobManager, JobStatus};
pub use manager::{AllowAll, BackupManager, OpError, PermissionOracle, CONFIRM_PHRASE};
pub use restore::ReplaySummary;
pub use store::DataStore;

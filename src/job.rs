//! # 后台任务运行器
//!
//! 备份/恢复在源设计中随请求同步执行到完成，大库可能阻塞数分钟。
//! 这里把操作边界建模为可提交的工作单元：提交后立即返回任务句柄，
//! 工作在阻塞线程池上执行，调用方轮询任务快照或操作日志获知结果
//! （操作日志仍是最终结论的权威来源）。
//!
//! ## 互斥
//!
//! 全局单许可信号量串行化所有备份/恢复/上传任务；恢复持有许可的
//! 期间，任何其他数据变更任务都无法启动（§ 维护窗口的进程内建议锁）。
//!
//! ## 取消
//!
//! 取消标志只在安全点生效：排队阶段与任何破坏性阶段开始之前。
//! 回放一旦开始便运行到完成，产生的制品与日志记录保持有效，
//! 不做补偿动作。
//!
//! ## 保留
//!
//! 注册表只保留最近 [`MAX_TERMINAL_JOBS`] 条终态快照，更旧的在
//! 任务结束时清除；操作日志（[`crate::catalog`]）才是长期记录。

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// 全局单许可限流器：备份/恢复/上传互斥
///
/// 使用 OwnedSemaphorePermit 可跨 .await 持有
pub static BACKUP_GLOBAL_LIMITER: LazyLock<Arc<tokio::sync::Semaphore>> =
    LazyLock::new(|| Arc::new(tokio::sync::Semaphore::new(1)));

/// 注册表中保留的终态任务快照上限
pub const MAX_TERMINAL_JOBS: usize = 256;

/// 安全地获取 Mutex 锁，中毒时恢复锁
fn safe_lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            error!(
                "[JobManager] Mutex poisoned! Attempting recovery for type: {:?}",
                std::any::type_name::<T>()
            );
            poisoned.into_inner()
        }
    }
}

/// 任务类型
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Backup,
    Restore,
    Upload,
}

/// 任务状态机：排队、运行、完成、失败、已取消
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// 是否为终态
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// 状态转换是否合法（单调性）
    ///
    /// - Queued → Running / Failed / Cancelled
    /// - Running → Completed / Failed / Cancelled
    /// - 终态不允许转换
    pub fn can_transition_to(&self, target: JobStatus) -> bool {
        if *self == target {
            return true; // 同状态幂等更新
        }
        match self {
            JobStatus::Queued => matches!(
                target,
                JobStatus::Running | JobStatus::Failed | JobStatus::Cancelled
            ),
            JobStatus::Running => matches!(
                target,
                JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
            ),
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled => false,
        }
    }
}

/// 任务执行结果
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct JobResult {
    pub success: bool,
    /// 对应的操作日志 ID（权威结论以日志为准）
    pub operation_id: Option<String>,
    pub message: Option<String>,
    pub error: Option<String>,
    pub duration_ms: Option<u64>,
}

/// 任务快照（对外查询用）
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub job_id: String,
    pub kind: JobKind,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub result: Option<JobResult>,
}

struct JobRecord {
    snapshot: Mutex<JobSnapshot>,
    cancelled: Arc<AtomicBool>,
}

/// 提交任务时传给工作闭包的上下文
#[derive(Clone)]
pub struct JobContext {
    pub job_id: String,
    cancelled: Arc<AtomicBool>,
}

impl JobContext {
    /// 是否已请求取消（工作闭包应在安全点检查）
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// 任务管理器
#[derive(Clone, Default)]
pub struct JobManager {
    jobs: Arc<DashMap<String, Arc<JobRecord>>>,
}

impl JobManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// 提交一个工作单元，立即返回任务快照
    ///
    /// 闭包在获得全局许可后于阻塞线程池上执行；返回
    /// `Ok(operation_id)` 记为完成，`Err(消息)` 记为失败。
    /// 若在获得许可前任务已被取消，则工作不执行。
    pub fn submit<F>(&self, kind: JobKind, work: F) -> JobSnapshot
    where
        F: FnOnce(JobContext) -> Result<String, String> + Send + 'static,
    {
        let job_id = Uuid::new_v4().to_string();
        let cancelled = Arc::new(AtomicBool::new(false));
        let snapshot = JobSnapshot {
            job_id: job_id.clone(),
            kind,
            status: JobStatus::Queued,
            created_at: Utc::now(),
            finished_at: None,
            result: None,
        };
        let record = Arc::new(JobRecord {
            snapshot: Mutex::new(snapshot.clone()),
            cancelled: cancelled.clone(),
        });
        self.jobs.insert(job_id.clone(), record.clone());

        info!("[JobManager] 任务入队: id={}, kind={:?}", job_id, kind);

        let manager = self.clone();
        let ctx = JobContext {
            job_id: job_id.clone(),
            cancelled,
        };
        tokio::spawn(async move {
            let started = std::time::Instant::now();

            // 全局互斥：备份/恢复/上传不并发
            let _permit = match BACKUP_GLOBAL_LIMITER.clone().acquire_owned().await {
                Ok(p) => p,
                Err(e) => {
                    manager.finish(
                        &ctx.job_id,
                        JobStatus::Failed,
                        JobResult {
                            success: false,
                            error: Some(format!("获取全局许可失败: {}", e)),
                            duration_ms: Some(started.elapsed().as_millis() as u64),
                            ..Default::default()
                        },
                    );
                    return;
                }
            };

            // 排队期间的取消在此生效（破坏性工作尚未开始）
            if ctx.is_cancelled() {
                manager.finish(
                    &ctx.job_id,
                    JobStatus::Cancelled,
                    JobResult {
                        success: false,
                        message: Some("任务在排队阶段被取消".to_string()),
                        duration_ms: Some(started.elapsed().as_millis() as u64),
                        ..Default::default()
                    },
                );
                return;
            }

            manager.transition(&ctx.job_id, JobStatus::Running);

            let work_ctx = ctx.clone();
            let outcome = tokio::task::spawn_blocking(move || work(work_ctx)).await;

            let duration_ms = Some(started.elapsed().as_millis() as u64);
            match outcome {
                Ok(Ok(operation_id)) => manager.finish(
                    &ctx.job_id,
                    JobStatus::Completed,
                    JobResult {
                        success: true,
                        operation_id: Some(operation_id),
                        duration_ms,
                        ..Default::default()
                    },
                ),
                Ok(Err(message)) => manager.finish(
                    &ctx.job_id,
                    JobStatus::Failed,
                    JobResult {
                        success: false,
                        error: Some(message),
                        duration_ms,
                        ..Default::default()
                    },
                ),
                Err(join_err) => manager.finish(
                    &ctx.job_id,
                    JobStatus::Failed,
                    JobResult {
                        success: false,
                        error: Some(format!("任务执行线程异常: {}", join_err)),
                        duration_ms,
                        ..Default::default()
                    },
                ),
            }
        });

        snapshot
    }

    /// 请求取消任务
    ///
    /// 排队中的任务立即转入 Cancelled；运行中的任务只设置标志，
    /// 由工作闭包在安全点自行检查。
    pub fn cancel(&self, job_id: &str) -> bool {
        let Some(record) = self.jobs.get(job_id).map(|r| r.clone()) else {
            return false;
        };
        record.cancelled.store(true, Ordering::SeqCst);
        let mut snap = safe_lock(&record.snapshot);
        if snap.status == JobStatus::Queued {
            snap.status = JobStatus::Cancelled;
            snap.finished_at = Some(Utc::now());
        }
        info!("[JobManager] 已请求取消任务: {}", job_id);
        true
    }

    /// 查询任务快照
    pub fn snapshot(&self, job_id: &str) -> Option<JobSnapshot> {
        self.jobs
            .get(job_id)
            .map(|r| safe_lock(&r.snapshot).clone())
    }

    /// 全部任务快照（按创建时间降序）
    pub fn list(&self) -> Vec<JobSnapshot> {
        let mut out: Vec<JobSnapshot> = self
            .jobs
            .iter()
            .map(|r| safe_lock(&r.snapshot).clone())
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        out
    }

    fn transition(&self, job_id: &str, target: JobStatus) {
        if let Some(record) = self.jobs.get(job_id) {
            let mut snap = safe_lock(&record.snapshot);
            if snap.status.can_transition_to(target) {
                snap.status = target;
            } else {
                warn!(
                    "[JobManager] 非法状态转换被忽略: {} {:?} -> {:?}",
                    job_id, snap.status, target
                );
            }
        }
    }

    fn finish(&self, job_id: &str, target: JobStatus, result: JobResult) {
        if let Some(record) = self.jobs.get(job_id) {
            let mut snap = safe_lock(&record.snapshot);
            if snap.status.can_transition_to(target) {
                snap.status = target;
                snap.finished_at = Some(Utc::now());
                snap.result = Some(result);
            } else {
                warn!(
                    "[JobManager] 终态写入被忽略（当前 {:?}，目标 {:?}）: {}",
                    snap.status, target, job_id
                );
            }
        }
        self.prune_terminal(MAX_TERMINAL_JOBS);
    }

    /// 清除最旧的终态快照，最多保留 `keep` 条；非终态任务不受影响
    fn prune_terminal(&self, keep: usize) {
        let mut terminal: Vec<(String, DateTime<Utc>)> = self
            .jobs
            .iter()
            .filter_map(|r| {
                let snap = safe_lock(&r.snapshot);
                snap.status
                    .is_terminal()
                    .then(|| (snap.job_id.clone(), snap.finished_at.unwrap_or(snap.created_at)))
            })
            .collect();
        if terminal.len() <= keep {
            return;
        }
        terminal.sort_by(|a, b| a.1.cmp(&b.1));
        let excess = terminal.len() - keep;
        for (job_id, _) in terminal.into_iter().take(excess) {
            debug!("[JobManager] 清除终态任务快照: {}", job_id);
            self.jobs.remove(&job_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn status_machine_is_monotonic() {
        assert!(JobStatus::Queued.can_transition_to(JobStatus::Running));
        assert!(JobStatus::Queued.can_transition_to(JobStatus::Cancelled));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Completed));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Failed));
        assert!(!JobStatus::Completed.can_transition_to(JobStatus::Running));
        assert!(!JobStatus::Failed.can_transition_to(JobStatus::Completed));
        assert!(!JobStatus::Cancelled.can_transition_to(JobStatus::Running));
        // 同状态幂等
        assert!(JobStatus::Running.can_transition_to(JobStatus::Running));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn submitted_job_completes_with_operation_id() {
        let manager = JobManager::new();
        let snap = manager.submit(JobKind::Backup, |_ctx| Ok("op-123".to_string()));
        assert_eq!(snap.status, JobStatus::Queued);

        let final_snap = wait_terminal(&manager, &snap.job_id).await;
        assert_eq!(final_snap.status, JobStatus::Completed);
        let result = final_snap.result.unwrap();
        assert!(result.success);
        assert_eq!(result.operation_id.as_deref(), Some("op-123"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failing_job_records_error() {
        let manager = JobManager::new();
        let snap = manager.submit(JobKind::Restore, |_ctx| Err("备份文件不存在或无效".to_string()));

        let final_snap = wait_terminal(&manager, &snap.job_id).await;
        assert_eq!(final_snap.status, JobStatus::Failed);
        assert_eq!(
            final_snap.result.unwrap().error.as_deref(),
            Some("备份文件不存在或无效")
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn jobs_serialize_over_the_global_permit() {
        let manager = JobManager::new();
        let first = manager.submit(JobKind::Backup, |_ctx| {
            std::thread::sleep(Duration::from_millis(100));
            Ok("op-a".to_string())
        });
        let second = manager.submit(JobKind::Restore, |_ctx| Ok("op-b".to_string()));

        let a = wait_terminal(&manager, &first.job_id).await;
        let b = wait_terminal(&manager, &second.job_id).await;
        assert_eq!(a.status, JobStatus::Completed);
        assert_eq!(b.status, JobStatus::Completed);
        // 第二个任务必须等第一个释放许可后才开始
        assert!(b.finished_at.unwrap() >= a.finished_at.unwrap() || b.result.is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancelled_while_queued_never_runs() {
        let manager = JobManager::new();
        // 占住全局许可，让后续任务停在排队阶段
        let running = Arc::new(AtomicBool::new(false));
        let running_flag = running.clone();
        let blocker = manager.submit(JobKind::Backup, move |_ctx| {
            running_flag.store(true, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(200));
            Ok("op-block".to_string())
        });
        // 确认 blocker 已持有许可，victim 必然排队
        while !running.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let victim = manager.submit(JobKind::Restore, |_ctx| {
            panic!("cancelled job must not run");
        });
        assert!(manager.cancel(&victim.job_id));

        let v = wait_terminal(&manager, &victim.job_id).await;
        assert_eq!(v.status, JobStatus::Cancelled);
        let b = wait_terminal(&manager, &blocker.job_id).await;
        assert_eq!(b.status, JobStatus::Completed);
    }

    #[test]
    fn terminal_snapshots_are_pruned_oldest_first() {
        let manager = JobManager::new();
        let base = Utc::now();
        for i in 0..5i64 {
            let terminal = i < 4;
            let snap = JobSnapshot {
                job_id: format!("job-{}", i),
                kind: JobKind::Backup,
                status: if terminal {
                    JobStatus::Completed
                } else {
                    JobStatus::Running
                },
                created_at: base,
                finished_at: terminal.then(|| base + chrono::Duration::seconds(i)),
                result: None,
            };
            manager.jobs.insert(
                snap.job_id.clone(),
                Arc::new(JobRecord {
                    snapshot: Mutex::new(snap),
                    cancelled: Arc::new(AtomicBool::new(false)),
                }),
            );
        }

        manager.prune_terminal(2);

        // 最旧的两个终态快照被清除，运行中的任务不受影响
        assert!(manager.snapshot("job-0").is_none());
        assert!(manager.snapshot("job-1").is_none());
        assert!(manager.snapshot("job-2").is_some());
        assert!(manager.snapshot("job-3").is_some());
        assert!(manager.snapshot("job-4").is_some());
    }

    async fn wait_terminal(manager: &JobManager, job_id: &str) -> JobSnapshot {
        for _ in 0..200 {
            if let Some(snap) = manager.snapshot(job_id) {
                if snap.status.is_terminal() {
                    return snap;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {} did not reach a terminal state", job_id);
    }
}

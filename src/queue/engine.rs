//! 阶段队列引擎
//!
//! 三个主阶段队列（下载 / 处理 / 上传），每个队列：
//! - 内存 `VecDeque` 镜像 + 行追加式日志（崩溃后可完整重建）
//! - 默认单飞行槽（可配置并发数），同一任务 ID 不会被两个
//!   工作线程同时持有
//! - 任务先落盘再通知工作线程；成功终态原子移除并追加后继任务
//!
//! 可重试失败转入重试日志（由泵定时搬回），不可重试失败进入隔离区。

use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use super::journal::Journal;
use super::regroup;
use super::retry::RetryQueue;
use crate::config::RetryConfig;
use crate::context::StorageLayout;
use crate::error::TaskError;
use crate::fsutil;
use crate::task::{MediaKind, Stage, Task, TaskPayload};

// ============================================================================
// 隔离区
// ============================================================================

/// 隔离记录：永久失败的任务及其终态分类
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuarantineRecord {
    /// 任务原始记录
    pub task: Task,
    /// 终态失败分类名
    pub class: String,
    /// 失败详情
    pub detail: String,
    /// 进入隔离区的时间
    pub quarantined_at: DateTime<Utc>,
    /// 被保留到隔离目录的输入文件
    #[serde(default)]
    pub preserved: Vec<PathBuf>,
}

/// 隔离区索引（state/failed.json）
struct QuarantineStore {
    path: PathBuf,
    records: Vec<QuarantineRecord>,
}

impl QuarantineStore {
    fn load(path: PathBuf) -> Self {
        let records = match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(records) => records,
                Err(e) => {
                    error!("隔离区索引解析失败，使用空索引: {}", e);
                    Vec::new()
                }
            },
            Err(_) => Vec::new(),
        };
        Self { path, records }
    }

    fn save(&self) -> std::io::Result<()> {
        let tmp = self.path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(&self.records)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, &self.path)
    }

    fn push(&mut self, record: QuarantineRecord) {
        self.records.push(record);
        if let Err(e) = self.save() {
            error!("保存隔离区索引失败: {}", e);
        }
    }
}

// ============================================================================
// 单阶段队列
// ============================================================================

struct StageState {
    /// 待执行任务（插入顺序）
    pending: VecDeque<Task>,
    /// 飞行中任务（保留在日志中，崩溃后随回放回到队首）
    in_flight: Vec<Task>,
}

/// 单个阶段队列
pub struct StageQueue {
    stage: Stage,
    journal: Mutex<Journal>,
    state: Mutex<StageState>,
    /// 新任务到达 / 任务归还的唤醒信号
    pub notify: Notify,
    compact_threshold: usize,
}

impl StageQueue {
    fn open(stage: Stage, path: &std::path::Path, compact_threshold: usize) -> Result<Self> {
        let (journal, tasks) = Journal::open(path)
            .with_context(|| format!("打开阶段日志失败: {:?}", path))?;
        info!("阶段 {} 日志回放: {} 个任务", stage, tasks.len());
        Ok(Self {
            stage,
            journal: Mutex::new(journal),
            state: Mutex::new(StageState {
                pending: tasks.into(),
                in_flight: Vec::new(),
            }),
            notify: Notify::new(),
            compact_threshold,
        })
    }

    /// 队列长度（不含飞行中）
    pub fn len(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// 是否没有任何待执行或飞行中的任务
    pub fn is_idle(&self) -> bool {
        let state = self.state.lock();
        state.pending.is_empty() && state.in_flight.is_empty()
    }

    /// 头部任务（只读）
    pub fn peek(&self) -> Option<Task> {
        self.state.lock().pending.front().cloned()
    }

    /// 飞行中任务摘要
    pub fn in_flight_summaries(&self) -> Vec<String> {
        self.state
            .lock()
            .in_flight
            .iter()
            .map(|t| t.describe())
            .collect()
    }

    /// 压实条件满足时重写日志
    ///
    /// 存活任务 = 飞行中 + 待执行（按该顺序，飞行中的任务原本在队首）
    fn maybe_compact(&self) {
        let mut journal = self.journal.lock();
        if journal.op_count() <= self.compact_threshold {
            return;
        }
        let state = self.state.lock();
        let live: Vec<&Task> = state
            .in_flight
            .iter()
            .chain(state.pending.iter())
            .collect();
        if let Err(e) = journal.compact(&live) {
            error!("阶段 {} 日志压实失败: {}", self.stage, e);
        }
    }
}

/// 取任务的结果
#[derive(Debug)]
pub enum Acquired {
    /// 取到任务，工作线程开始执行
    Task(Task),
    /// 队列非空但头部任务未到执行时间
    Wait(Duration),
    /// 队列为空
    Empty,
}

/// 失败处理结果
#[derive(Debug, PartialEq, Eq)]
pub enum FailOutcome {
    /// 已转入重试日志
    Scheduled {
        attempt: u32,
        max_attempts: u32,
        delay: Duration,
    },
    /// 已进入隔离区
    Quarantined,
}

// ============================================================================
// 引擎
// ============================================================================

/// 阶段队列引擎
pub struct QueueEngine {
    download: StageQueue,
    process: StageQueue,
    upload: StageQueue,
    /// 重试队列（失败任务的延迟停留区）
    pub retry: RetryQueue,
    quarantine: Mutex<QuarantineStore>,
    quarantine_dir: PathBuf,
    /// 单调任务 ID 分配器，恢复时从已存在的最大 ID 续接
    next_id: AtomicU64,
}

impl QueueEngine {
    /// 打开引擎：回放所有阶段日志与重试日志，并对上传队列执行
    /// 相册重组
    pub fn open(layout: &StorageLayout, compact_threshold: usize, album_cap: usize) -> Result<Self> {
        let download = StageQueue::open(
            Stage::Download,
            &layout.journal_path(Stage::Download),
            compact_threshold,
        )?;
        let process = StageQueue::open(
            Stage::Process,
            &layout.journal_path(Stage::Process),
            compact_threshold,
        )?;
        let upload = StageQueue::open(
            Stage::Upload,
            &layout.journal_path(Stage::Upload),
            compact_threshold,
        )?;
        let retry = RetryQueue::open(&layout.retry_log_path())?;
        let quarantine = QuarantineStore::load(layout.failed_path());

        // ID 分配器从所有已恢复任务的最大 ID 续接
        let max_id = download
            .state
            .lock()
            .pending
            .iter()
            .chain(process.state.lock().pending.iter())
            .chain(upload.state.lock().pending.iter())
            .map(|t| t.id)
            .chain(retry.task_ids())
            .max()
            .unwrap_or(0);

        let engine = Self {
            download,
            process,
            upload,
            retry,
            quarantine: Mutex::new(quarantine),
            quarantine_dir: layout.quarantine_dir(),
            next_id: AtomicU64::new(max_id + 1),
        };

        engine.regroup_uploads(album_cap);
        Ok(engine)
    }

    /// 分配任务 ID
    pub fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// 创建新任务
    pub fn new_task(&self, kind: MediaKind, payload: TaskPayload) -> Task {
        Task::new(self.allocate_id(), kind, payload)
    }

    fn queue(&self, stage: Stage) -> &StageQueue {
        match stage {
            Stage::Download => &self.download,
            Stage::Process => &self.process,
            Stage::Upload => &self.upload,
        }
    }

    /// 阶段队列引用（工作线程等待唤醒用）
    pub fn stage_queue(&self, stage: Stage) -> &StageQueue {
        self.queue(stage)
    }

    /// 任务入队
    ///
    /// 先持久化后通知：工作线程开始执行前任务必定已在磁盘上
    pub fn enqueue(&self, task: Task) -> Result<u64> {
        let stage = task.stage();
        let id = task.id;
        let queue = self.queue(stage);

        {
            let mut journal = queue.journal.lock();
            journal
                .append_push(&task)
                .with_context(|| format!("任务 {} 持久化失败", id))?;
            journal.sync().context("阶段日志落盘失败")?;
        }
        queue.state.lock().pending.push_back(task);
        queue.notify.notify_one();

        debug!("任务 {} 已入队到阶段 {}", id, stage);
        Ok(id)
    }

    /// 头部任务（只读，不出队）
    pub fn peek(&self, stage: Stage) -> Option<Task> {
        self.queue(stage).peek()
    }

    /// 取出下一个可执行任务
    ///
    /// 按插入顺序扫描，跳过未到 `next_attempt_at` 的任务（延迟任务为
    /// 就绪任务让路）。取到的任务转入飞行中集合但保留在日志里。
    pub fn acquire(&self, stage: Stage) -> Acquired {
        let queue = self.queue(stage);
        let now = Utc::now();
        let mut state = queue.state.lock();

        let in_flight_ids: HashSet<u64> = state.in_flight.iter().map(|t| t.id).collect();

        let pos = state
            .pending
            .iter()
            .position(|t| t.is_due(now) && !in_flight_ids.contains(&t.id));

        match pos {
            Some(pos) => {
                let task = state.pending.remove(pos).expect("position 有效");
                state.in_flight.push(task.clone());
                Acquired::Task(task)
            }
            None if state.pending.is_empty() => Acquired::Empty,
            None => {
                // 全部未到时间：告知最近的等待时长
                let wait = state
                    .pending
                    .iter()
                    .filter_map(|t| t.next_attempt_at)
                    .map(|at| (at - now).to_std().unwrap_or(Duration::ZERO))
                    .min()
                    .unwrap_or(Duration::from_secs(1));
                Acquired::Wait(wait.max(Duration::from_millis(200)))
            }
        }
    }

    /// 成功终态：原子移除任务并追加后继任务
    ///
    /// 后继任务先落盘再移除前驱，两者都 fsync；崩溃窗口内的重复
    /// 执行由内容指纹去重兜底
    pub fn complete(&self, task: &Task, followups: Vec<Task>) -> Result<()> {
        for followup in followups {
            self.enqueue(followup)?;
        }

        let stage = task.stage();
        let queue = self.queue(stage);
        {
            let mut journal = queue.journal.lock();
            journal.append_remove(task.id).context("移除记录写入失败")?;
            journal.sync().context("阶段日志落盘失败")?;
        }
        {
            let mut state = queue.state.lock();
            state.in_flight.retain(|t| t.id != task.id);
        }
        queue.maybe_compact();

        debug!("任务 {} 在阶段 {} 成功完成", task.id, stage);
        Ok(())
    }

    /// 失败终态处理
    ///
    /// - 可重试且预算未耗尽：更新重试计数与下次执行时间，转入重试日志
    /// - 限流 / 认证失效：不消耗预算，等待时间严格按分类计算
    /// - 不可重试或预算耗尽：进入隔离区，输入文件移动到隔离目录
    pub fn fail(&self, task: &Task, err: &TaskError, retry: &RetryConfig) -> Result<FailOutcome> {
        let stage = task.stage();

        let budget_exhausted = err.consumes_budget() && task.retry_count + 1 >= retry.max_attempts;
        if !err.is_retryable() || budget_exhausted {
            self.quarantine_task(task, err)?;
            return Ok(FailOutcome::Quarantined);
        }

        let mut updated = task.clone();
        if err.consumes_budget() {
            updated.retry_count += 1;
        }
        let attempt = updated.retry_count.max(1);
        let delay = err.backoff(attempt, retry.base_seconds);
        updated.next_attempt_at =
            Some(Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default());
        updated.last_error_class = Some(err.class_name().to_string());

        // 先写重试日志，再从阶段日志移除
        self.retry.push(updated)?;
        let queue = self.queue(stage);
        {
            let mut journal = queue.journal.lock();
            journal.append_remove(task.id).context("移除记录写入失败")?;
            journal.sync().context("阶段日志落盘失败")?;
        }
        {
            let mut state = queue.state.lock();
            state.in_flight.retain(|t| t.id != task.id);
        }
        queue.maybe_compact();

        warn!(
            "任务 {} 失败 ({})，{} 秒后重试 (第 {}/{} 次)",
            task.id,
            err,
            delay.as_secs(),
            attempt,
            retry.max_attempts
        );
        Ok(FailOutcome::Scheduled {
            attempt,
            max_attempts: retry.max_attempts,
            delay,
        })
    }

    /// 将任务移入隔离区
    fn quarantine_task(&self, task: &Task, err: &TaskError) -> Result<()> {
        let stage = task.stage();
        error!("任务 {} 永久失败，进入隔离区: {}", task.id, err);

        // 保留输入文件供运维排查
        let mut preserved = Vec::new();
        for path in task_input_files(task) {
            if path.exists() {
                match fsutil::move_into_dir(&path, &self.quarantine_dir) {
                    Ok(new_path) => preserved.push(new_path),
                    Err(e) => warn!("移动文件到隔离区失败 {:?}: {}", path, e),
                }
            }
        }

        let mut record_task = task.clone();
        record_task.last_error_class = Some(err.class_name().to_string());
        self.quarantine.lock().push(QuarantineRecord {
            task: record_task,
            class: err.class_name().to_string(),
            detail: err.to_string(),
            quarantined_at: Utc::now(),
            preserved,
        });

        let queue = self.queue(stage);
        {
            let mut journal = queue.journal.lock();
            journal.append_remove(task.id).context("移除记录写入失败")?;
            journal.sync().context("阶段日志落盘失败")?;
        }
        {
            let mut state = queue.state.lock();
            state.in_flight.retain(|t| t.id != task.id);
        }
        queue.maybe_compact();
        Ok(())
    }

    /// 执行被进程关停打断时归还任务
    ///
    /// 任务仍在日志中，只需撤销飞行中标记
    pub fn release(&self, task: &Task) {
        let queue = self.queue(task.stage());
        let mut state = queue.state.lock();
        if let Some(pos) = state.in_flight.iter().position(|t| t.id == task.id) {
            let task = state.in_flight.remove(pos);
            state.pending.push_front(task);
        }
        drop(state);
        queue.notify.notify_one();
    }

    /// 将到期的重试任务搬回目标阶段
    ///
    /// 由重试泵周期调用；返回搬运数量
    pub fn promote_due_retries(&self) -> Result<usize> {
        let due = self.retry.take_due(Utc::now())?;
        let count = due.len();
        for task in due {
            debug!("重试任务 {} 到期，重新入队", task.id);
            self.enqueue(task)?;
        }
        Ok(count)
    }

    /// 恢复后的上传队列重组
    ///
    /// 将共享 (压缩包, 解压根, 类别) 的 ≥2 个单文件上传任务合并为
    /// 相册任务，保持磁盘顺序，跳过文件已不存在的条目
    fn regroup_uploads(&self, album_cap: usize) {
        let mut state = self.upload.state.lock();
        let before = state.pending.len();
        if before == 0 {
            return;
        }

        let tasks: Vec<Task> = state.pending.drain(..).collect();
        let regrouped = regroup::regroup_upload_tasks(tasks, album_cap, || self.allocate_id());
        let after = regrouped.len();
        state.pending = regrouped.into();

        // 重组结果整体重写上传日志
        let live: Vec<&Task> = state
            .in_flight
            .iter()
            .chain(state.pending.iter())
            .collect();
        if let Err(e) = self.upload.journal.lock().compact(&live) {
            error!("重组后上传日志重写失败: {}", e);
        }

        if after != before {
            info!("上传队列重组: {} 个任务 -> {} 个任务", before, after);
        }
    }

    /// 各阶段是否全部空闲（延迟转换工作线程的排水条件）
    pub fn all_stages_idle(&self) -> bool {
        self.download.is_idle()
            && self.process.is_idle()
            && self.upload.is_idle()
            && self.retry.is_empty()
    }

    /// 队列状态摘要
    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            download_pending: self.download.len(),
            process_pending: self.process.len(),
            upload_pending: self.upload.len(),
            retry_pending: self.retry.len(),
            in_flight: Stage::ALL
                .iter()
                .flat_map(|s| self.queue(*s).in_flight_summaries())
                .collect(),
        }
    }

    /// 遍历全部待执行任务（清理注册表重建用）
    pub fn for_each_pending<F: FnMut(&Task)>(&self, mut f: F) {
        for stage in Stage::ALL {
            let state = self.queue(stage).state.lock();
            for task in state.in_flight.iter().chain(state.pending.iter()) {
                f(task);
            }
        }
        self.retry.for_each(|t| f(t));
    }
}

/// 队列状态摘要
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub download_pending: usize,
    pub process_pending: usize,
    pub upload_pending: usize,
    pub retry_pending: usize,
    pub in_flight: Vec<String>,
}

/// 任务的输入文件（隔离保留用）
fn task_input_files(task: &Task) -> Vec<PathBuf> {
    let mut files = match &task.payload {
        TaskPayload::Extract { archive_path } | TaskPayload::ExpandEntry { archive_path } => {
            vec![archive_path.clone()]
        }
        TaskPayload::Normalize { input, .. } | TaskPayload::DeferredConvert { input, .. } => {
            vec![input.clone()]
        }
        TaskPayload::AlbumDispatch { files, .. } => files.clone(),
        TaskPayload::DirectUpload { file, .. } => vec![file.clone()],
        TaskPayload::Download { .. }
        | TaskPayload::WebdavCrawl { .. }
        | TaskPayload::WebdavFile { .. } => Vec::new(),
    };
    files.retain(|f| !task.cleanup_refs.contains(f));
    files.extend(task.cleanup_refs.iter().cloned());
    files
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::DownloadSource;
    use tempfile::TempDir;

    fn layout(temp: &TempDir) -> StorageLayout {
        let layout = StorageLayout::new(
            temp.path().join("data"),
            temp.path().join("data/work"),
        );
        layout.prepare().unwrap();
        layout
    }

    fn engine(temp: &TempDir) -> QueueEngine {
        QueueEngine::open(&layout(temp), 512, 10).unwrap()
    }

    fn download_task(engine: &QueueEngine, name: &str) -> Task {
        engine.new_task(
            MediaKind::Archive,
            TaskPayload::Download {
                source: DownloadSource::Http {
                    url: format!("https://cdn.example/{}", name),
                },
                dest_dir: PathBuf::from("/tmp/work"),
                file_name: name.to_string(),
                expected_size: None,
            },
        )
    }

    fn retry_config() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            base_seconds: 5,
        }
    }

    #[test]
    fn test_enqueue_persisted_before_acquire() {
        let temp = TempDir::new().unwrap();
        let e = engine(&temp);
        let task = download_task(&e, "a.zip");
        let id = e.enqueue(task).unwrap();

        // 入队即落盘：不重启引擎直接重新打开日志应能看到任务
        let (_, on_disk) =
            Journal::open(&layout(&temp).journal_path(Stage::Download)).unwrap();
        assert_eq!(on_disk.len(), 1);
        assert_eq!(on_disk[0].id, id);
    }

    #[test]
    fn test_fifo_order_and_restore() {
        let temp = TempDir::new().unwrap();
        {
            let e = engine(&temp);
            for name in ["a.zip", "b.zip", "c.zip"] {
                let task = download_task(&e, name);
                e.enqueue(task).unwrap();
            }
        }

        // 模拟崩溃重启：恢复后队首是最早入队的任务
        let e = engine(&temp);
        match e.acquire(Stage::Download) {
            Acquired::Task(t) => {
                assert!(matches!(
                    &t.payload,
                    TaskPayload::Download { file_name, .. } if file_name == "a.zip"
                ));
            }
            other => panic!("期望取到任务，实际: {:?}", other),
        }
    }

    #[test]
    fn test_in_flight_survives_crash() {
        let temp = TempDir::new().unwrap();
        let first_id;
        {
            let e = engine(&temp);
            let task = download_task(&e, "a.zip");
            first_id = e.enqueue(task).unwrap();
            // 工作线程取走任务但尚未完成
            let acquired = match e.acquire(Stage::Download) {
                Acquired::Task(t) => t,
                _ => panic!("应取到任务"),
            };
            assert_eq!(acquired.id, first_id);
            // 崩溃：不调用 complete
        }

        let e = engine(&temp);
        match e.acquire(Stage::Download) {
            Acquired::Task(t) => assert_eq!(t.id, first_id),
            other => panic!("飞行中任务应在恢复后回到队首: {:?}", other),
        }
    }

    #[test]
    fn test_complete_removes_and_chains_followup() {
        let temp = TempDir::new().unwrap();
        let e = engine(&temp);
        let task = download_task(&e, "a.zip");
        e.enqueue(task.clone()).unwrap();

        let acquired = match e.acquire(Stage::Download) {
            Acquired::Task(t) => t,
            _ => panic!(),
        };

        let followup = e.new_task(
            MediaKind::Archive,
            TaskPayload::Extract {
                archive_path: PathBuf::from("/tmp/work/a.zip"),
            },
        );
        e.complete(&acquired, vec![followup]).unwrap();

        // 下载队列空，处理队列有后继
        assert!(matches!(e.acquire(Stage::Download), Acquired::Empty));
        assert_eq!(e.stage_queue(Stage::Process).len(), 1);

        // 落盘验证
        let (_, dl) = Journal::open(&layout(&temp).journal_path(Stage::Download)).unwrap();
        assert!(dl.is_empty());
        let (_, pr) = Journal::open(&layout(&temp).journal_path(Stage::Process)).unwrap();
        assert_eq!(pr.len(), 1);
    }

    #[test]
    fn test_fail_retryable_goes_to_retry_queue() {
        let temp = TempDir::new().unwrap();
        let e = engine(&temp);
        let task = download_task(&e, "a.zip");
        e.enqueue(task).unwrap();
        let acquired = match e.acquire(Stage::Download) {
            Acquired::Task(t) => t,
            _ => panic!(),
        };

        let err = TaskError::Network {
            detail: "connection reset".into(),
        };
        let outcome = e.fail(&acquired, &err, &retry_config()).unwrap();
        match outcome {
            FailOutcome::Scheduled { attempt, delay, .. } => {
                assert_eq!(attempt, 1);
                assert_eq!(delay, Duration::from_secs(10));
            }
            other => panic!("应转入重试: {:?}", other),
        }
        assert_eq!(e.retry.len(), 1);
        assert!(matches!(e.acquire(Stage::Download), Acquired::Empty));
    }

    #[test]
    fn test_rate_limit_does_not_consume_budget() {
        let temp = TempDir::new().unwrap();
        let e = engine(&temp);
        let task = download_task(&e, "a.zip");
        e.enqueue(task).unwrap();
        let acquired = match e.acquire(Stage::Download) {
            Acquired::Task(t) => t,
            _ => panic!(),
        };

        let err = TaskError::RateLimit { wait_secs: 1678 };
        let outcome = e.fail(&acquired, &err, &retry_config()).unwrap();
        match outcome {
            FailOutcome::Scheduled { attempt, delay, .. } => {
                // 等待严格等于服务端秒数，重试计数不变
                assert_eq!(delay, Duration::from_secs(1678));
                assert_eq!(attempt, 1);
            }
            other => panic!("限流应重试: {:?}", other),
        }

        let mut retried = Vec::new();
        e.retry.for_each(|t| retried.push(t.clone()));
        assert_eq!(retried[0].retry_count, 0);
        assert_eq!(
            retried[0].last_error_class.as_deref(),
            Some("rate_limit")
        );
    }

    #[test]
    fn test_budget_exhaustion_quarantines() {
        let temp = TempDir::new().unwrap();
        let e = engine(&temp);
        let mut task = download_task(&e, "a.zip");
        task.retry_count = 2; // 预算 3，本次失败耗尽
        e.enqueue(task).unwrap();
        let acquired = match e.acquire(Stage::Download) {
            Acquired::Task(t) => t,
            _ => panic!(),
        };

        let err = TaskError::Network {
            detail: "unreachable".into(),
        };
        let outcome = e.fail(&acquired, &err, &retry_config()).unwrap();
        assert_eq!(outcome, FailOutcome::Quarantined);

        // 隔离区索引已落盘
        let content =
            std::fs::read_to_string(layout(&temp).failed_path()).unwrap();
        let records: Vec<QuarantineRecord> = serde_json::from_str(&content).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].class, "network");
    }

    #[test]
    fn test_permanent_error_quarantines_immediately() {
        let temp = TempDir::new().unwrap();
        let e = engine(&temp);
        let task = download_task(&e, "a.zip");
        e.enqueue(task).unwrap();
        let acquired = match e.acquire(Stage::Download) {
            Acquired::Task(t) => t,
            _ => panic!(),
        };

        let err = TaskError::Permanent {
            detail: "unsupported".into(),
        };
        assert_eq!(
            e.fail(&acquired, &err, &retry_config()).unwrap(),
            FailOutcome::Quarantined
        );
    }

    #[test]
    fn test_promote_due_retries() {
        let temp = TempDir::new().unwrap();
        let e = engine(&temp);
        let task = download_task(&e, "a.zip");
        e.enqueue(task).unwrap();
        let acquired = match e.acquire(Stage::Download) {
            Acquired::Task(t) => t,
            _ => panic!(),
        };

        // 完整性失败立即重试（退避为零）
        let err = TaskError::Integrity {
            detail: "size mismatch".into(),
        };
        e.fail(&acquired, &err, &retry_config()).unwrap();
        assert_eq!(e.retry.len(), 1);

        let promoted = e.promote_due_retries().unwrap();
        assert_eq!(promoted, 1);
        assert_eq!(e.retry.len(), 0);
        assert!(matches!(e.acquire(Stage::Download), Acquired::Task(_)));
    }

    #[test]
    fn test_delayed_task_yields_to_ready() {
        let temp = TempDir::new().unwrap();
        let e = engine(&temp);

        let mut delayed = download_task(&e, "delayed.zip");
        delayed.next_attempt_at = Some(Utc::now() + chrono::Duration::seconds(3600));
        e.enqueue(delayed).unwrap();

        let ready = download_task(&e, "ready.zip");
        let ready_id = ready.id;
        e.enqueue(ready).unwrap();

        // 延迟任务在队首，但就绪任务先被取走
        match e.acquire(Stage::Download) {
            Acquired::Task(t) => assert_eq!(t.id, ready_id),
            other => panic!("应取到就绪任务: {:?}", other),
        }
        // 只剩延迟任务时返回等待时长
        assert!(matches!(e.acquire(Stage::Download), Acquired::Wait(_)));
    }

    #[test]
    fn test_id_monotone_across_restart() {
        let temp = TempDir::new().unwrap();
        let max_before;
        {
            let e = engine(&temp);
            let t1 = download_task(&e, "a.zip");
            let t2 = download_task(&e, "b.zip");
            max_before = t2.id;
            e.enqueue(t1).unwrap();
            e.enqueue(t2).unwrap();
        }

        let e = engine(&temp);
        let t3 = download_task(&e, "c.zip");
        assert!(t3.id > max_before, "重启后 ID 必须继续单调递增");
    }

    #[test]
    fn test_release_returns_task_to_front() {
        let temp = TempDir::new().unwrap();
        let e = engine(&temp);
        let task = download_task(&e, "a.zip");
        let id = e.enqueue(task).unwrap();

        let acquired = match e.acquire(Stage::Download) {
            Acquired::Task(t) => t,
            _ => panic!(),
        };
        e.release(&acquired);

        match e.acquire(Stage::Download) {
            Acquired::Task(t) => assert_eq!(t.id, id),
            other => panic!("归还的任务应回到队首: {:?}", other),
        }
    }

    #[test]
    fn test_no_duplicate_acquire_same_id() {
        let temp = TempDir::new().unwrap();
        let e = engine(&temp);
        let task = download_task(&e, "a.zip");
        e.enqueue(task).unwrap();

        assert!(matches!(e.acquire(Stage::Download), Acquired::Task(_)));
        // 同一任务不会被第二个工作线程取到
        assert!(matches!(e.acquire(Stage::Download), Acquired::Empty));
    }
}

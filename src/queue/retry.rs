//! 重试队列
//!
//! 可重试失败的任务带着 `next_attempt_at` 在这里停留，由重试泵
//! 周期性把到期任务搬回目标阶段。持久化复用阶段日志格式
//! （queue/retry.log），限流等待因此可以跨越进程重启。

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{error, info};

use super::journal::Journal;
use crate::task::Task;

/// 压实阈值（重试队列流量低，固定即可）
const COMPACT_THRESHOLD: usize = 256;

/// 重试队列
pub struct RetryQueue {
    journal: Mutex<Journal>,
    tasks: Mutex<Vec<Task>>,
}

impl RetryQueue {
    /// 打开并回放重试日志
    pub fn open(path: &Path) -> Result<Self> {
        let (journal, tasks) = Journal::open(path)
            .with_context(|| format!("打开重试日志失败: {:?}", path))?;
        if !tasks.is_empty() {
            info!("重试日志回放: {} 个任务", tasks.len());
        }
        Ok(Self {
            journal: Mutex::new(journal),
            tasks: Mutex::new(tasks),
        })
    }

    /// 任务进入重试停留区（先落盘）
    pub fn push(&self, task: Task) -> Result<()> {
        {
            let mut journal = self.journal.lock();
            journal
                .append_push(&task)
                .context("重试任务持久化失败")?;
            journal.sync().context("重试日志落盘失败")?;
        }
        self.tasks.lock().push(task);
        Ok(())
    }

    /// 取出全部到期任务
    ///
    /// 返回顺序：先按 `next_attempt_at`，再按停留顺序
    pub fn take_due(&self, now: DateTime<Utc>) -> Result<Vec<Task>> {
        let mut tasks = self.tasks.lock();
        let mut due: Vec<Task> = Vec::new();
        let mut remaining: Vec<Task> = Vec::new();

        for task in tasks.drain(..) {
            if task.is_due(now) {
                due.push(task);
            } else {
                remaining.push(task);
            }
        }
        *tasks = remaining;

        if !due.is_empty() {
            due.sort_by_key(|t| t.next_attempt_at);

            let mut journal = self.journal.lock();
            for task in &due {
                journal
                    .append_remove(task.id)
                    .context("重试任务移除记录写入失败")?;
            }
            journal.sync().context("重试日志落盘失败")?;

            if journal.op_count() > COMPACT_THRESHOLD {
                let live: Vec<&Task> = tasks.iter().collect();
                if let Err(e) = journal.compact(&live) {
                    error!("重试日志压实失败: {}", e);
                }
            }
        }
        Ok(due)
    }

    /// 最近一个到期时间
    pub fn earliest(&self) -> Option<DateTime<Utc>> {
        self.tasks.lock().iter().filter_map(|t| t.next_attempt_at).min()
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.lock().is_empty()
    }

    /// 停留中任务的 ID 列表（恢复时计算最大 ID 用）
    pub fn task_ids(&self) -> Vec<u64> {
        self.tasks.lock().iter().map(|t| t.id).collect()
    }

    /// 遍历停留中的任务
    pub fn for_each<F: FnMut(&Task)>(&self, mut f: F) {
        for task in self.tasks.lock().iter() {
            f(task);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{MediaKind, TaskPayload};
    use chrono::Duration;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn task_with_delay(id: u64, delay_secs: i64) -> Task {
        let mut task = Task::new(
            id,
            MediaKind::Image,
            TaskPayload::DirectUpload {
                file: PathBuf::from("/tmp/x.jpg"),
                kind: MediaKind::Image,
                file_name: "x.jpg".to_string(),
            },
        );
        task.next_attempt_at = Some(Utc::now() + Duration::seconds(delay_secs));
        task
    }

    #[test]
    fn test_take_due_respects_schedule() {
        let temp = TempDir::new().unwrap();
        let queue = RetryQueue::open(&temp.path().join("retry.log")).unwrap();

        queue.push(task_with_delay(1, -10)).unwrap(); // 已到期
        queue.push(task_with_delay(2, 3600)).unwrap(); // 未到期
        queue.push(task_with_delay(3, -5)).unwrap(); // 已到期

        let due = queue.take_due(Utc::now()).unwrap();
        assert_eq!(due.len(), 2);
        // 按到期时间排序
        assert_eq!(due[0].id, 1);
        assert_eq!(due[1].id, 3);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_survives_restart() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("retry.log");
        {
            let queue = RetryQueue::open(&path).unwrap();
            queue.push(task_with_delay(1, 1000)).unwrap();
            queue.push(task_with_delay(2, 2000)).unwrap();
        }

        // 重启后停留中的任务与等待时间保持不变
        let queue = RetryQueue::open(&path).unwrap();
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.task_ids(), vec![1, 2]);

        let earliest = queue.earliest().unwrap();
        assert!(earliest > Utc::now() + Duration::seconds(900));
    }

    #[test]
    fn test_taken_tasks_removed_from_disk() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("retry.log");
        {
            let queue = RetryQueue::open(&path).unwrap();
            queue.push(task_with_delay(1, -10)).unwrap();
            let due = queue.take_due(Utc::now()).unwrap();
            assert_eq!(due.len(), 1);
        }

        let queue = RetryQueue::open(&path).unwrap();
        assert!(queue.is_empty());
    }
}

//! 延迟转换账本
//!
//! 长耗时或不可靠的视频转换不允许阻塞相册上传：不兼容视频从
//! 活跃批次摘除后记入账本，由延迟工作线程在下载与上传队列全部
//! 空闲时排水。
//!
//! 账本写入者只有延迟工作线程；转换运行期间每隔固定节奏落盘一次
//! 进度，崩溃后 `in_progress` 条目按源文件是否存在决定重排或标失败
//! （编码器不支持断点，重排即从零重转）。

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

/// 转换状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversionStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

/// 账本条目
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionEntry {
    /// 源文件路径（账本主键）
    pub input_path: PathBuf,
    /// 转换输出路径
    pub output_path: PathBuf,
    /// 展示文件名
    pub file_name: String,
    pub status: ConversionStatus,
    /// 进度百分比（0-100）
    pub progress_pct: u8,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub retry_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// 原始事件引用（尽力而为的用户回复）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_ref: Option<i64>,
}

/// 延迟转换账本
pub struct ConversionLedger {
    path: PathBuf,
    entries: Mutex<HashMap<PathBuf, ConversionEntry>>,
    /// 进度落盘节奏
    save_interval: std::time::Duration,
    last_save: Mutex<Instant>,
    max_retries: u32,
}

impl ConversionLedger {
    /// 加载账本（解析失败以空账本启动）
    pub fn load(path: PathBuf, save_interval_secs: u64, max_retries: u32) -> Self {
        let entries = match std::fs::read_to_string(&path) {
            Ok(content) => {
                match serde_json::from_str::<HashMap<PathBuf, ConversionEntry>>(&content) {
                    Ok(map) => {
                        if !map.is_empty() {
                            info!("已加载 {} 条延迟转换记录", map.len());
                        }
                        map
                    }
                    Err(e) => {
                        error!("延迟转换账本解析失败，以空账本启动: {}", e);
                        HashMap::new()
                    }
                }
            }
            Err(_) => HashMap::new(),
        };
        Self {
            path,
            entries: Mutex::new(entries),
            save_interval: std::time::Duration::from_secs(save_interval_secs),
            last_save: Mutex::new(Instant::now()),
            max_retries,
        }
    }

    /// 登记待转换条目
    pub fn enlist(
        &self,
        input: &Path,
        output: &Path,
        file_name: &str,
        source_ref: Option<i64>,
    ) -> Result<()> {
        let now = Utc::now();
        {
            let mut entries = self.entries.lock();
            entries
                .entry(input.to_path_buf())
                .and_modify(|e| {
                    // 已有条目回到 pending，保留重试计数
                    e.status = ConversionStatus::Pending;
                    e.updated_at = now;
                })
                .or_insert_with(|| ConversionEntry {
                    input_path: input.to_path_buf(),
                    output_path: output.to_path_buf(),
                    file_name: file_name.to_string(),
                    status: ConversionStatus::Pending,
                    progress_pct: 0,
                    started_at: now,
                    updated_at: now,
                    retry_count: 0,
                    last_error: None,
                    source_ref,
                });
        }
        self.save()?;
        info!("延迟转换已登记: {}", file_name);
        Ok(())
    }

    /// 取出下一个待转换条目（按登记时间）
    pub fn next_pending(&self) -> Option<ConversionEntry> {
        let entries = self.entries.lock();
        entries
            .values()
            .filter(|e| e.status == ConversionStatus::Pending)
            .min_by_key(|e| e.started_at)
            .cloned()
    }

    /// 是否还有待转换条目
    pub fn has_pending(&self) -> bool {
        self.entries
            .lock()
            .values()
            .any(|e| e.status == ConversionStatus::Pending)
    }

    /// 标记转换开始
    pub fn mark_in_progress(&self, input: &Path) -> Result<()> {
        self.update(input, |e| {
            e.status = ConversionStatus::InProgress;
            e.progress_pct = 0;
        })?;
        self.save()
    }

    /// 更新进度
    ///
    /// 按配置节奏落盘，两次落盘之间的进度只保留在内存
    pub fn update_progress(&self, input: &Path, pct: u8) {
        if self
            .update(input, |e| {
                e.progress_pct = pct.min(100);
            })
            .is_err()
        {
            return;
        }
        let should_save = {
            let mut last = self.last_save.lock();
            if last.elapsed() >= self.save_interval {
                *last = Instant::now();
                true
            } else {
                false
            }
        };
        if should_save {
            if let Err(e) = self.save() {
                warn!("进度落盘失败: {}", e);
            }
        }
    }

    /// 标记转换完成
    pub fn mark_completed(&self, input: &Path) -> Result<()> {
        self.update(input, |e| {
            e.status = ConversionStatus::Completed;
            e.progress_pct = 100;
        })?;
        self.save()
    }

    /// 记录一次失败；返回是否仍可重试
    pub fn record_failure(&self, input: &Path, error: &str) -> Result<bool> {
        let mut retryable = false;
        self.update(input, |e| {
            e.retry_count += 1;
            e.last_error = Some(error.to_string());
            if e.retry_count < self.max_retries {
                e.status = ConversionStatus::Pending;
                retryable = true;
            } else {
                e.status = ConversionStatus::Failed;
            }
        })?;
        self.save()?;
        Ok(retryable)
    }

    /// 启动扫描
    ///
    /// `in_progress` 条目：源文件仍在则重排为 pending（从零重转），
    /// 源文件已消失则标 failed。返回重排条数。
    pub fn startup_scan(&self) -> Result<usize> {
        let mut requeued = 0usize;
        {
            let mut entries = self.entries.lock();
            for entry in entries.values_mut() {
                if entry.status != ConversionStatus::InProgress {
                    continue;
                }
                if entry.input_path.exists() {
                    warn!(
                        "转换被中断，重排: {} (进度 {}%)",
                        entry.file_name, entry.progress_pct
                    );
                    entry.status = ConversionStatus::Pending;
                    entry.progress_pct = 0;
                    entry.updated_at = Utc::now();
                    requeued += 1;
                } else {
                    warn!("转换源文件已消失，标记失败: {}", entry.file_name);
                    entry.status = ConversionStatus::Failed;
                    entry.last_error = Some("源文件在重启后缺失".to_string());
                    entry.updated_at = Utc::now();
                }
            }
        }
        self.save()?;
        Ok(requeued)
    }

    /// 清扫超过 TTL 的已完成条目
    pub fn sweep_completed(&self, ttl_hours: u64) -> Result<usize> {
        let cutoff = Utc::now() - ChronoDuration::hours(ttl_hours as i64);
        let removed = {
            let mut entries = self.entries.lock();
            let before = entries.len();
            entries.retain(|_, e| {
                !(e.status == ConversionStatus::Completed && e.updated_at < cutoff)
            });
            before - entries.len()
        };
        if removed > 0 {
            info!("清扫 {} 条过期的已完成转换记录", removed);
            self.save()?;
        }
        Ok(removed)
    }

    /// 查询条目
    pub fn get(&self, input: &Path) -> Option<ConversionEntry> {
        self.entries.lock().get(input).cloned()
    }

    fn update<F: FnOnce(&mut ConversionEntry)>(&self, input: &Path, f: F) -> Result<()> {
        let mut entries = self.entries.lock();
        let entry = entries
            .get_mut(input)
            .with_context(|| format!("账本中不存在条目: {:?}", input))?;
        f(entry);
        entry.updated_at = Utc::now();
        Ok(())
    }

    /// 原子保存
    fn save(&self) -> Result<()> {
        let content = {
            let entries = self.entries.lock();
            serde_json::to_string_pretty(&*entries).context("序列化账本失败")?
        };
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, content).context("写入账本临时文件失败")?;
        std::fs::rename(&tmp, &self.path).context("账本原子替换失败")?;
        Ok(())
    }
}

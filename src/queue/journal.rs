//! 阶段日志文件操作
//!
//! 每个阶段队列对应一个行追加式日志文件，记录任务的入队与终态移除。
//!
//! ## 文件格式
//!
//! 纯文本，每行一条 JSON 操作记录：
//! ```text
//! {"op":"push","task":{...}}
//! {"op":"remove","id":42}
//! ```
//!
//! 回放时按顺序应用操作即可重建队列。工作线程执行中的任务不产生
//! 额外记录：任务在日志中保留到终态（成功移除或转入重试/隔离），
//! 因此崩溃后执行中的任务会随回放回到队首。
//!
//! 操作条数超过压实阈值后，日志被重写为仅含存活任务的 push 序列
//! （先写临时文件再原子重命名）。

use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::task::Task;

/// 日志操作记录
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum JournalOp {
    /// 任务入队
    Push { task: serde_json::Value },
    /// 任务终态移除
    Remove { id: u64 },
}

/// 阶段日志
///
/// 单写入者：只有拥有该阶段的引擎可以写入
pub struct Journal {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    /// 自上次压实以来的操作条数
    op_count: usize,
}

impl Journal {
    /// 打开日志并回放，返回按插入顺序排列的存活任务
    ///
    /// 容错处理：
    /// - 无法解析的行跳过并告警
    /// - 载荷判别符未知的任务跳过并告警（向前兼容）
    pub fn open(path: &Path) -> io::Result<(Self, Vec<Task>)> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut tasks: Vec<Task> = Vec::new();
        let mut op_count = 0usize;

        if path.exists() {
            let file = File::open(path)?;
            let reader = BufReader::new(file);
            let mut line_number = 0usize;
            let mut skipped = 0usize;

            for line_result in reader.lines() {
                line_number += 1;
                let line = match line_result {
                    Ok(l) => l,
                    Err(e) => {
                        warn!("日志读取失败 (行 {}): {} in {:?}", line_number, e, path);
                        skipped += 1;
                        continue;
                    }
                };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                op_count += 1;
                match serde_json::from_str::<JournalOp>(line) {
                    Ok(JournalOp::Push { task }) => {
                        match serde_json::from_value::<Task>(task) {
                            Ok(t) => tasks.push(t),
                            Err(e) => {
                                // 未知判别符或旧版异常记录：跳过，不中断恢复
                                warn!(
                                    "任务记录解析失败，已跳过 (行 {}): {} in {:?}",
                                    line_number, e, path
                                );
                                skipped += 1;
                            }
                        }
                    }
                    Ok(JournalOp::Remove { id }) => {
                        if let Some(pos) = tasks.iter().position(|t| t.id == id) {
                            tasks.remove(pos);
                        }
                    }
                    Err(e) => {
                        warn!(
                            "日志解析失败 (行 {}): {} in {:?}",
                            line_number, e, path
                        );
                        skipped += 1;
                    }
                }
            }

            if skipped > 0 {
                warn!(
                    "日志回放完成，跳过 {} 行无效记录 (共 {} 行) in {:?}",
                    skipped, line_number, path
                );
            }
            debug!("日志回放完成: {} 个存活任务 from {:?}", tasks.len(), path);
        }

        let file = OpenOptions::new().create(true).append(true).open(path)?;

        Ok((
            Self {
                path: path.to_path_buf(),
                writer: Some(BufWriter::new(file)),
                op_count,
            },
            tasks,
        ))
    }

    /// 追加入队记录并刷写
    pub fn append_push(&mut self, task: &Task) -> io::Result<()> {
        let op = JournalOp::Push {
            task: serde_json::to_value(task)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?,
        };
        self.append(&op)
    }

    /// 追加终态移除记录并刷写
    pub fn append_remove(&mut self, id: u64) -> io::Result<()> {
        self.append(&JournalOp::Remove { id })
    }

    fn append(&mut self, op: &JournalOp) -> io::Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "journal already closed"))?;
        let line = serde_json::to_string(op)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        writeln!(writer, "{}", line)?;
        writer.flush()?;
        self.op_count += 1;
        Ok(())
    }

    /// 将缓冲与页缓存落盘
    ///
    /// 终态转换（complete / fail）必须调用
    pub fn sync(&mut self) -> io::Result<()> {
        if let Some(writer) = self.writer.as_mut() {
            writer.flush()?;
            writer.get_ref().sync_data()?;
        }
        Ok(())
    }

    /// 自上次压实以来的操作条数
    pub fn op_count(&self) -> usize {
        self.op_count
    }

    /// 压实：用存活任务重写日志
    ///
    /// 先写临时文件并落盘，再原子重命名覆盖原日志
    pub fn compact(&mut self, live: &[&Task]) -> io::Result<()> {
        let tmp_path = self.path.with_extension("log.tmp");
        {
            let tmp = File::create(&tmp_path)?;
            let mut writer = BufWriter::new(tmp);
            for task in live {
                let op = JournalOp::Push {
                    task: serde_json::to_value(task)
                        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?,
                };
                let line = serde_json::to_string(&op)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                writeln!(writer, "{}", line)?;
            }
            writer.flush()?;
            writer.get_ref().sync_data()?;
        }

        // 关闭旧句柄后原子替换
        self.writer = None;
        std::fs::rename(&tmp_path, &self.path)?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.writer = Some(BufWriter::new(file));
        self.op_count = live.len();

        debug!(
            "日志压实完成: {} 个存活任务 in {:?}",
            live.len(),
            self.path
        );
        Ok(())
    }

    /// 日志文件路径
    pub fn path(&self) -> &Path {
        &self.path
    }
}

//! 可续传下载器
//!
//! 流式下载 URL 到 `.part` 文件，成功后原子重命名。
//!
//! ## 续传规则
//!
//! - `.part` 大小为 0：删除，从零开始
//! - `.part` 大小 > 0：发送 `Range: bytes=<size>-`
//!   - `206 Partial Content`：追加写入
//!   - `416` 且已知总大小等于 `.part` 大小：直接重命名视为完成
//!   - `200 OK`（服务器忽略 Range）：删除 `.part`，本次从零重下
//! - 除 Range 被忽略的重置外，任何错误都保留 `.part`
//!
//! ## 静默看门狗
//!
//! 超过静默阈值没有新字节到达即取消流并抛出 STALL；
//! 一次尝试内 `.part` 大小单调不减。

pub mod throttle;

use std::path::{Path, PathBuf};
use std::time::Duration;

use futures::StreamExt;
use reqwest::{Client, StatusCode};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use throttle::ProgressThrottle;

use crate::config::FetchConfig;
use crate::error::{classify_reqwest_error, TaskError, TaskResult};
use crate::fsutil;

/// 下载结果
#[derive(Debug)]
pub struct FetchOutcome {
    /// 最终文件路径
    pub path: PathBuf,
    /// 最终文件大小
    pub bytes: u64,
}

/// 响应处理决策（纯函数便于测试）
#[derive(Debug, PartialEq, Eq)]
enum ResumeDecision {
    /// 从 offset 追加写入
    Append { offset: u64 },
    /// 服务器忽略 Range：删除 `.part` 后从零写入
    RestartFromZero,
    /// 从零写入（全新下载）
    WriteFromZero,
    /// `.part` 已经是完整文件，重命名即可
    AlreadyComplete,
    /// 失败
    Fail(TaskError),
}

/// 根据响应状态与续传偏移决定写入方式
fn decide_resume(
    status: StatusCode,
    resume_from: u64,
    content_range_total: Option<u64>,
) -> ResumeDecision {
    match status {
        StatusCode::PARTIAL_CONTENT => ResumeDecision::Append {
            offset: resume_from,
        },
        StatusCode::RANGE_NOT_SATISFIABLE if resume_from > 0 => {
            match content_range_total {
                // 已知总大小等于现有 .part：下载其实已完成
                Some(total) if total == resume_from => ResumeDecision::AlreadyComplete,
                // 大小不符：.part 不可信，按完整性失败处理（保留待删）
                Some(total) => ResumeDecision::Fail(TaskError::Integrity {
                    detail: format!(
                        "服务器报告总大小 {} 与 .part 大小 {} 不符",
                        total, resume_from
                    ),
                }),
                None => ResumeDecision::Fail(TaskError::HttpStatus { code: 416 }),
            }
        }
        StatusCode::OK if resume_from > 0 => ResumeDecision::RestartFromZero,
        s if s.is_success() => ResumeDecision::WriteFromZero,
        s => ResumeDecision::Fail(TaskError::HttpStatus { code: s.as_u16() }),
    }
}

/// 解析 `Content-Range: bytes <from>-<to>/<total>` 或 `bytes */<total>` 中的总大小
fn parse_content_range_total(value: &str) -> Option<u64> {
    value.split('/').nth(1)?.trim().parse().ok()
}

/// 预检 `.part` 文件，返回续传偏移
///
/// 大小为 0 的 `.part` 直接删除
fn prepare_part(part_path: &Path) -> u64 {
    match std::fs::metadata(part_path) {
        Ok(meta) if meta.len() == 0 => {
            debug!("删除 0 字节 .part 文件: {:?}", part_path);
            fsutil::remove_file_quiet(part_path);
            0
        }
        Ok(meta) => meta.len(),
        Err(_) => 0,
    }
}

/// 可续传下载器
pub struct Fetcher {
    client: Client,
    chunk_size: usize,
    inactivity_timeout: Duration,
}

impl Fetcher {
    /// 创建下载器
    ///
    /// 连接超时独立于静默超时；总超时不设（大文件）
    pub fn new(config: &FetchConfig) -> Self {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .tcp_keepalive(Duration::from_secs(60))
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .expect("构建下载 HTTP 客户端失败");
        Self {
            client,
            chunk_size: config.chunk_size(),
            inactivity_timeout: Duration::from_secs(config.inactivity_timeout_secs),
        }
    }

    /// 下载 URL 到目标路径
    ///
    /// # Arguments
    /// * `url` - 下载地址
    /// * `destination` - 最终文件路径（中间态写入 `<destination>.part`）
    /// * `basic_auth` - 可选的 Basic 认证 (用户名, 密码)
    /// * `cancel` - 取消令牌
    /// * `progress` - 进度回调 (已写字节, 已知总大小)
    pub async fn fetch<F>(
        &self,
        url: &str,
        destination: &Path,
        basic_auth: Option<(&str, &str)>,
        cancel: &CancellationToken,
        mut progress: F,
    ) -> TaskResult<FetchOutcome>
    where
        F: FnMut(u64, Option<u64>),
    {
        let part_path = part_path_of(destination);
        if let Some(parent) = destination.parent() {
            fsutil::ensure_dir(parent).map_err(|e| TaskError::Permanent {
                detail: format!("创建下载目录失败: {}", e),
            })?;
        }

        let resume_from = prepare_part(&part_path);
        if resume_from > 0 {
            info!("发现 .part 文件，从偏移 {} 续传: {:?}", resume_from, part_path);
        }

        let mut request = self.client.get(url);
        if resume_from > 0 {
            request = request.header("Range", format!("bytes={}-", resume_from));
        }
        if let Some((user, pass)) = basic_auth {
            request = request.basic_auth(user, Some(pass));
        }

        let response = request
            .send()
            .await
            .map_err(|e| classify_reqwest_error(&e))?;

        let status = response.status();
        let content_range_total = response
            .headers()
            .get("content-range")
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_range_total);
        let content_length = response.content_length();

        let (offset, total) = match decide_resume(status, resume_from, content_range_total) {
            ResumeDecision::Append { offset } => {
                let total = content_range_total.or(content_length.map(|l| offset + l));
                (offset, total)
            }
            ResumeDecision::RestartFromZero => {
                warn!("服务器忽略 Range 请求，删除 .part 从零重下: {}", url);
                fsutil::remove_file_quiet(&part_path);
                (0, content_length)
            }
            ResumeDecision::WriteFromZero => (0, content_length),
            ResumeDecision::AlreadyComplete => {
                info!("416 且 .part 已是完整文件，直接提交: {:?}", part_path);
                fsutil::atomic_rename(&part_path, destination).map_err(|e| {
                    TaskError::Permanent {
                        detail: format!("重命名失败: {}", e),
                    }
                })?;
                return Ok(FetchOutcome {
                    path: destination.to_path_buf(),
                    bytes: resume_from,
                });
            }
            ResumeDecision::Fail(err) => {
                if matches!(err, TaskError::Integrity { .. }) {
                    // .part 与服务器声明矛盾：删除后按完整性错误重试
                    fsutil::remove_file_quiet(&part_path);
                }
                return Err(err);
            }
        };

        // 打开 .part：追加或截断
        let mut file = if offset > 0 {
            OpenOptions::new()
                .append(true)
                .open(&part_path)
                .await
                .map_err(io_permanent)?
        } else {
            File::create(&part_path).await.map_err(io_permanent)?
        };

        let mut written = offset;
        let mut stream = response.bytes_stream();
        let mut buffered = 0usize;

        loop {
            // 静默看门狗：一个块的等待时间超过阈值即 STALL
            let next = tokio::select! {
                _ = cancel.cancelled() => {
                    file.flush().await.ok();
                    return Err(TaskError::Canceled);
                }
                next = tokio::time::timeout(self.inactivity_timeout, stream.next()) => next,
            };

            let chunk = match next {
                Err(_) => {
                    // 看门狗触发：保留 .part，拆除流
                    file.flush().await.ok();
                    warn!(
                        "下载静默超过 {:?}，触发 STALL: {} (已写 {} 字节)",
                        self.inactivity_timeout, url, written
                    );
                    return Err(TaskError::Stall);
                }
                Ok(None) => break,
                Ok(Some(Ok(chunk))) => chunk,
                Ok(Some(Err(e))) => {
                    file.flush().await.ok();
                    return Err(classify_reqwest_error(&e));
                }
            };

            // 逐块写盘，不整体缓冲
            file.write_all(&chunk).await.map_err(io_permanent)?;
            written += chunk.len() as u64;
            buffered += chunk.len();
            if buffered >= self.chunk_size {
                file.flush().await.map_err(io_permanent)?;
                buffered = 0;
            }
            progress(written, total);
        }

        file.flush().await.map_err(io_permanent)?;
        file.sync_all().await.map_err(io_permanent)?;
        drop(file);

        // 完成校验：已知总大小时最终大小必须一致
        if let Some(expected) = total {
            if written != expected {
                if written > expected {
                    // .part 超过服务器声明大小即不可信，删除
                    fsutil::remove_file_quiet(&part_path);
                    return Err(TaskError::Integrity {
                        detail: format!(".part 大小 {} 超过声明大小 {}", written, expected),
                    });
                }
                return Err(TaskError::Incomplete {
                    expected,
                    actual: written,
                });
            }
        }

        fsutil::atomic_rename(&part_path, destination).map_err(|e| TaskError::Permanent {
            detail: format!("重命名失败: {}", e),
        })?;

        info!(
            "下载完成: {:?} ({})",
            destination,
            fsutil::format_size(written)
        );
        Ok(FetchOutcome {
            path: destination.to_path_buf(),
            bytes: written,
        })
    }
}

/// 目标路径对应的 `.part` 路径
pub fn part_path_of(destination: &Path) -> PathBuf {
    let mut name = destination
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.push_str(".part");
    destination.with_file_name(name)
}

fn io_permanent(e: std::io::Error) -> TaskError {
    TaskError::Permanent {
        detail: format!("文件写入失败: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_part_path() {
        assert_eq!(
            part_path_of(Path::new("/work/a.zip")),
            PathBuf::from("/work/a.zip.part")
        );
    }

    #[test]
    fn test_zero_byte_part_deleted() {
        let temp = TempDir::new().unwrap();
        let part = temp.path().join("a.zip.part");
        fs::write(&part, b"").unwrap();

        // 0 字节 .part 删除并从零开始
        assert_eq!(prepare_part(&part), 0);
        assert!(!part.exists());
    }

    #[test]
    fn test_nonzero_part_kept() {
        let temp = TempDir::new().unwrap();
        let part = temp.path().join("a.zip.part");
        fs::write(&part, b"12345").unwrap();

        assert_eq!(prepare_part(&part), 5);
        assert!(part.exists());
    }

    #[test]
    fn test_decide_206_appends() {
        let d = decide_resume(StatusCode::PARTIAL_CONTENT, 5 * 1024 * 1024, Some(10 * 1024 * 1024));
        assert_eq!(
            d,
            ResumeDecision::Append {
                offset: 5 * 1024 * 1024
            }
        );
    }

    #[test]
    fn test_decide_200_with_offset_restarts() {
        // 服务器忽略 Range：删 .part 从零重下
        let d = decide_resume(StatusCode::OK, 5 * 1024 * 1024, None);
        assert_eq!(d, ResumeDecision::RestartFromZero);
    }

    #[test]
    fn test_decide_200_fresh_writes_from_zero() {
        let d = decide_resume(StatusCode::OK, 0, None);
        assert_eq!(d, ResumeDecision::WriteFromZero);
    }

    #[test]
    fn test_decide_416_complete() {
        // 416 且总大小等于 .part：视为已完成
        let d = decide_resume(StatusCode::RANGE_NOT_SATISFIABLE, 1024, Some(1024));
        assert_eq!(d, ResumeDecision::AlreadyComplete);
    }

    #[test]
    fn test_decide_416_mismatch_is_integrity() {
        let d = decide_resume(StatusCode::RANGE_NOT_SATISFIABLE, 2048, Some(1024));
        assert!(matches!(
            d,
            ResumeDecision::Fail(TaskError::Integrity { .. })
        ));
    }

    #[test]
    fn test_decide_server_error() {
        let d = decide_resume(StatusCode::BAD_GATEWAY, 0, None);
        assert_eq!(d, ResumeDecision::Fail(TaskError::HttpStatus { code: 502 }));
    }

    #[test]
    fn test_parse_content_range() {
        assert_eq!(
            parse_content_range_total("bytes 0-1023/146515"),
            Some(146515)
        );
        assert_eq!(parse_content_range_total("bytes */1024"), Some(1024));
        assert_eq!(parse_content_range_total("bytes 0-1023"), None);
        assert_eq!(parse_content_range_total("garbage"), None);
    }
}

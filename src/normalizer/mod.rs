//! 媒体归一化
//!
//! 判定视频是否需要重编码，并驱动 ffmpeg/ffprobe 子进程执行。
//! 三种结果：
//! - 直通：容器/编码已可接受（`.ts` 无条件直通）
//! - 内联转换：阈值以下的快路径，同步执行并受运行时上限约束
//! - 延迟：超过阈值的转换交给延迟转换账本，不阻塞上传阶段
//!
//! 超时处理：杀掉编码器、删除残留输出、抛 NORMALIZE_TIMEOUT。

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::TranscodeConfig;
use crate::error::{TaskError, TaskResult};
use crate::fsutil;

/// 归一化判定结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NormalizeDecision {
    /// 无需处理
    Passthrough,
    /// 内联转换
    Inline,
    /// 交给延迟转换账本
    Defer,
}

/// 视频属性（上传时附带）
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VideoAttributes {
    pub duration_secs: u32,
    pub width: u32,
    pub height: u32,
}

/// 媒体归一化器
#[derive(Debug, Clone)]
pub struct Normalizer {
    enabled: bool,
    timeout: Duration,
    threshold_bytes: u64,
}

impl Normalizer {
    pub fn new(config: &TranscodeConfig) -> Self {
        Self {
            enabled: config.enabled,
            timeout: Duration::from_secs(config.timeout_secs),
            threshold_bytes: config.threshold_mb * 1024 * 1024,
        }
    }

    /// 判定文件的处理方式
    pub async fn decide(&self, path: &Path) -> NormalizeDecision {
        // .ts 可直接流式播放，无条件直通
        if path
            .extension()
            .map(|e| e.eq_ignore_ascii_case("ts"))
            .unwrap_or(false)
        {
            debug!("跳过 .ts 文件转换（可流式播放）: {:?}", path);
            return NormalizeDecision::Passthrough;
        }

        if !self.enabled {
            return NormalizeDecision::Passthrough;
        }

        match self.probe(path).await {
            Some(probe) if is_compatible(&probe) => {
                debug!("容器/编码已兼容，直通: {:?}", path);
                NormalizeDecision::Passthrough
            }
            Some(_) => self.inline_or_defer(path),
            // 探测失败：按不兼容处理
            None => self.inline_or_defer(path),
        }
    }

    fn inline_or_defer(&self, path: &Path) -> NormalizeDecision {
        let size = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
        if self.threshold_bytes > 0 && size > self.threshold_bytes {
            info!(
                "视频超过内联阈值 ({} > {})，转入延迟转换: {:?}",
                fsutil::format_size(size),
                fsutil::format_size(self.threshold_bytes),
                path
            );
            NormalizeDecision::Defer
        } else {
            NormalizeDecision::Inline
        }
    }

    /// 执行转码
    ///
    /// # Arguments
    /// * `progress` - 进度回调（0-100）；None 表示不需要进度
    pub async fn normalize<F>(
        &self,
        input: &Path,
        output: &Path,
        cancel: &CancellationToken,
        mut progress: Option<F>,
    ) -> TaskResult<PathBuf>
    where
        F: FnMut(u8),
    {
        let duration = self
            .probe(input)
            .await
            .map(|p| parse_attributes(&p).duration_secs)
            .unwrap_or(0);

        let mut cmd = Command::new("ffmpeg");
        cmd.args(transcode_args(input, output))
            .args(["-progress", "pipe:1", "-nostats"])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        info!("开始转码: {:?} -> {:?}", input, output);
        let mut child = cmd.spawn().map_err(|e| TaskError::Permanent {
            detail: format!("启动 ffmpeg 失败: {}", e),
        })?;

        let stdout = child.stdout.take();
        let wait = async {
            // 读取 -progress 输出推进进度
            if let Some(stdout) = stdout {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if let Some(pct) = parse_progress_line(&line, duration) {
                        if let Some(ref mut cb) = progress {
                            cb(pct);
                        }
                    }
                }
            }
            child.wait().await
        };

        let status = tokio::select! {
            _ = cancel.cancelled() => {
                child.kill().await.ok();
                fsutil::remove_file_quiet(output);
                return Err(TaskError::Canceled);
            }
            result = tokio::time::timeout(self.timeout, wait) => match result {
                Ok(status) => status,
                Err(_) => {
                    // 超时：杀进程并清理残留输出
                    warn!("转码超过 {:?}，终止: {:?}", self.timeout, input);
                    child.kill().await.ok();
                    fsutil::remove_file_quiet(output);
                    return Err(TaskError::NormalizeTimeout);
                }
            },
        };

        let status = status.map_err(|e| TaskError::Permanent {
            detail: format!("等待 ffmpeg 失败: {}", e),
        })?;

        if !status.success() {
            fsutil::remove_file_quiet(output);
            return Err(TaskError::Permanent {
                detail: format!("ffmpeg 退出码异常: {:?}", status.code()),
            });
        }

        let out_size = std::fs::metadata(output).map(|m| m.len()).unwrap_or(0);
        if out_size == 0 {
            fsutil::remove_file_quiet(output);
            return Err(TaskError::Permanent {
                detail: "ffmpeg 报告成功但输出为空".to_string(),
            });
        }

        info!(
            "转码完成: {:?} ({})",
            output,
            fsutil::format_size(out_size)
        );
        Ok(output.to_path_buf())
    }

    /// 提取视频属性
    pub async fn attributes(&self, path: &Path) -> VideoAttributes {
        match self.probe(path).await {
            Some(probe) => parse_attributes(&probe),
            None => VideoAttributes::default(),
        }
    }

    /// 生成缩略图（视频第 1 秒取一帧）
    pub async fn make_thumbnail(&self, path: &Path) -> Option<PathBuf> {
        let thumb_path = PathBuf::from(format!("{}.thumb.jpg", path.display()));
        let status = Command::new("ffmpeg")
            .args([
                "-i",
                &path.display().to_string(),
                "-ss",
                "00:00:01",
                "-vframes",
                "1",
                "-f",
                "mjpeg",
                &thumb_path.display().to_string(),
                "-y",
            ])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status()
            .await;

        match status {
            Ok(s) if s.success() && thumb_path.exists() => Some(thumb_path),
            _ => {
                warn!("缩略图生成失败: {:?}", path);
                fsutil::remove_file_quiet(&thumb_path);
                None
            }
        }
    }

    /// ffprobe 元数据探测
    async fn probe(&self, path: &Path) -> Option<Value> {
        let output = Command::new("ffprobe")
            .args([
                "-v",
                "quiet",
                "-print_format",
                "json",
                "-show_format",
                "-show_streams",
                &path.display().to_string(),
            ])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .ok()?;

        if !output.status.success() {
            warn!("ffprobe 探测失败: {:?}", path);
            return None;
        }
        serde_json::from_slice(&output.stdout).ok()
    }
}

/// 转码参数
///
/// 偶数尺寸缩放、faststart moov、保留时间戳与元数据、
/// GOP 设置保证缩略图可取
fn transcode_args(input: &Path, output: &Path) -> Vec<String> {
    [
        "-i",
        &input.display().to_string(),
        "-c:v",
        "libx264",
        "-preset",
        "medium",
        "-crf",
        "23",
        "-c:a",
        "aac",
        "-b:a",
        "128k",
        "-ar",
        "48000",
        "-movflags",
        "+faststart+use_metadata_tags",
        "-pix_fmt",
        "yuv420p",
        "-profile:v",
        "main",
        "-level",
        "4.0",
        "-vf",
        "scale=trunc(iw/2)*2:trunc(ih/2)*2",
        "-copyts",
        "-start_at_zero",
        "-fflags",
        "+genpts+igndts",
        "-map_metadata",
        "0",
        "-g",
        "48",
        "-keyint_min",
        "24",
        "-sc_threshold",
        "40",
        "-r",
        "24",
        "-y",
        &output.display().to_string(),
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// 容器与编码是否已可接受（mp4 容器 + h264 视频流）
fn is_compatible(probe: &Value) -> bool {
    let format_ok = probe
        .pointer("/format/format_name")
        .and_then(Value::as_str)
        .map(|f| f.split(',').any(|name| name.trim() == "mp4"))
        .unwrap_or(false);

    let codec_ok = probe
        .get("streams")
        .and_then(Value::as_array)
        .map(|streams| {
            streams.iter().any(|s| {
                s.get("codec_type").and_then(Value::as_str) == Some("video")
                    && matches!(
                        s.get("codec_name").and_then(Value::as_str),
                        Some("h264") | Some("avc1")
                    )
            })
        })
        .unwrap_or(false);

    format_ok && codec_ok
}

/// 从探测结果提取属性
fn parse_attributes(probe: &Value) -> VideoAttributes {
    let video_stream = probe
        .get("streams")
        .and_then(Value::as_array)
        .and_then(|streams| {
            streams
                .iter()
                .find(|s| s.get("codec_type").and_then(Value::as_str) == Some("video"))
        });

    let duration = video_stream
        .and_then(|s| s.get("duration"))
        .and_then(Value::as_str)
        .and_then(|d| d.parse::<f64>().ok())
        .or_else(|| {
            probe
                .pointer("/format/duration")
                .and_then(Value::as_str)
                .and_then(|d| d.parse::<f64>().ok())
        })
        .unwrap_or(0.0);

    VideoAttributes {
        duration_secs: duration as u32,
        width: video_stream
            .and_then(|s| s.get("width"))
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32,
        height: video_stream
            .and_then(|s| s.get("height"))
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32,
    }
}

/// 解析 `-progress pipe:1` 输出行，返回百分比
fn parse_progress_line(line: &str, duration_secs: u32) -> Option<u8> {
    if duration_secs == 0 {
        return None;
    }
    let value = line.strip_prefix("out_time_ms=")?;
    let out_us: u64 = value.trim().parse().ok()?;
    let pct = (out_us / 1_000_000) * 100 / duration_secs as u64;
    Some(pct.min(100) as u8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn normalizer(enabled: bool, threshold_mb: u64) -> Normalizer {
        Normalizer::new(&TranscodeConfig {
            enabled,
            timeout_secs: 300,
            threshold_mb,
        })
    }

    #[tokio::test]
    async fn test_ts_always_passthrough() {
        // 开关打开也不转换 .ts
        let n = normalizer(true, 100);
        assert_eq!(
            n.decide(Path::new("/tmp/stream.ts")).await,
            NormalizeDecision::Passthrough
        );
    }

    #[tokio::test]
    async fn test_disabled_passthrough() {
        let n = normalizer(false, 100);
        assert_eq!(
            n.decide(Path::new("/tmp/clip.avi")).await,
            NormalizeDecision::Passthrough
        );
    }

    #[tokio::test]
    async fn test_large_file_defers() {
        let temp = TempDir::new().unwrap();
        let big = temp.path().join("big.avi");
        std::fs::write(&big, vec![0u8; 2 * 1024 * 1024]).unwrap();

        // 阈值 1MB，2MB 文件延迟（探测失败按不兼容处理）
        let n = normalizer(true, 1);
        assert_eq!(n.decide(&big).await, NormalizeDecision::Defer);
    }

    #[test]
    fn test_is_compatible() {
        let compatible: Value = serde_json::json!({
            "format": {"format_name": "mov,mp4,m4a,3gp,3g2,mj2"},
            "streams": [
                {"codec_type": "audio", "codec_name": "aac"},
                {"codec_type": "video", "codec_name": "h264", "width": 1920, "height": 1080}
            ]
        });
        assert!(is_compatible(&compatible));

        let wrong_codec: Value = serde_json::json!({
            "format": {"format_name": "mov,mp4,m4a,3gp,3g2,mj2"},
            "streams": [{"codec_type": "video", "codec_name": "hevc"}]
        });
        assert!(!is_compatible(&wrong_codec));

        let wrong_container: Value = serde_json::json!({
            "format": {"format_name": "matroska,webm"},
            "streams": [{"codec_type": "video", "codec_name": "h264"}]
        });
        assert!(!is_compatible(&wrong_container));
    }

    #[test]
    fn test_parse_attributes() {
        let probe: Value = serde_json::json!({
            "format": {"duration": "63.5"},
            "streams": [
                {"codec_type": "video", "codec_name": "h264",
                 "width": 1280, "height": 720, "duration": "62.88"}
            ]
        });
        let attrs = parse_attributes(&probe);
        assert_eq!(attrs.duration_secs, 62);
        assert_eq!(attrs.width, 1280);
        assert_eq!(attrs.height, 720);
    }

    #[test]
    fn test_parse_progress_line() {
        // out_time_ms 实为微秒
        assert_eq!(parse_progress_line("out_time_ms=30000000", 60), Some(50));
        assert_eq!(parse_progress_line("out_time_ms=90000000", 60), Some(100));
        assert_eq!(parse_progress_line("fps=25.0", 60), None);
        assert_eq!(parse_progress_line("out_time_ms=1000", 0), None);
    }

    #[test]
    fn test_transcode_args_even_dims_and_faststart() {
        let args = transcode_args(Path::new("/a.avi"), Path::new("/b.mp4"));
        assert!(args.iter().any(|a| a.contains("faststart")));
        assert!(args.iter().any(|a| a.contains("trunc(iw/2)*2")));
        assert!(args.iter().any(|a| a == "yuv420p"));
    }
}

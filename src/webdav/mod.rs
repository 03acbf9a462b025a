//! WebDAV 抓取
//!
//! 递归列举分享目录（PROPFIND Depth:1 迭代下钻），文件下载复用
//! 可续传下载器（Basic 认证 + Range 续传 + 静默看门狗）。
//! 响应解析只依赖对 href / getcontentlength / collection 标签的
//! 文本扫描，不引入 XML 解析依赖。

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use reqwest::{Client, Method, StatusCode};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{FetchConfig, WebdavConfig};
use crate::error::{classify_reqwest_error, TaskError, TaskResult};
use crate::fetcher::{FetchOutcome, Fetcher};

/// 目录列举重试次数
const LIST_RETRIES: u32 = 3;

/// PROPFIND 请求体（只要三个属性）
const PROPFIND_BODY: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<d:propfind xmlns:d="DAV:">
  <d:prop>
    <d:resourcetype/>
    <d:getcontentlength/>
  </d:prop>
</d:propfind>"#;

/// 目录条目
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebdavItem {
    /// 服务器返回的路径（已编码）
    pub href: String,
    /// 展示名
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
}

/// WebDAV 客户端
pub struct WebdavClient {
    client: Client,
    base_url: String,
    username: String,
    password: String,
    fetcher: Fetcher,
}

impl WebdavClient {
    pub fn new(config: &WebdavConfig, fetch: &FetchConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(30))
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .expect("构建 WebDAV HTTP 客户端失败");
        Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            username: config.username.clone(),
            password: config.password.clone(),
            fetcher: Fetcher::new(fetch),
        }
    }

    /// 列举目录（超时重试，间隔 5s·attempt）
    pub async fn list_dir(&self, path: &str) -> TaskResult<Vec<WebdavItem>> {
        let url = self.url_for(path);
        debug!("列举 WebDAV 目录: {}", url);

        let mut last_err = None;
        for attempt in 1..=LIST_RETRIES {
            match self.propfind(&url).await {
                Ok(items) => return Ok(items),
                Err(err @ (TaskError::Stall | TaskError::Network { .. })) => {
                    if attempt < LIST_RETRIES {
                        let delay = Duration::from_secs(5 * attempt as u64);
                        warn!(
                            "WebDAV 列举第 {} 次失败: {}，{:?} 后重试",
                            attempt, err, delay
                        );
                        tokio::time::sleep(delay).await;
                    }
                    last_err = Some(err);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or(TaskError::Network {
            detail: "WebDAV 列举失败".to_string(),
        }))
    }

    async fn propfind(&self, url: &str) -> TaskResult<Vec<WebdavItem>> {
        let response = self
            .client
            .request(Method::from_bytes(b"PROPFIND").expect("合法方法名"), url)
            .basic_auth(&self.username, Some(&self.password))
            .header("Depth", "1")
            .header("Content-Type", "application/xml")
            .body(PROPFIND_BODY)
            .send()
            .await
            .map_err(|e| classify_reqwest_error(&e))?;

        let status = response.status();
        if status != StatusCode::MULTI_STATUS && !status.is_success() {
            return Err(TaskError::HttpStatus {
                code: status.as_u16(),
            });
        }

        let body = response.text().await.map_err(|e| TaskError::Network {
            detail: format!("读取 PROPFIND 响应失败: {}", e),
        })?;
        Ok(parse_propfind(&body))
    }

    /// 递归列举文件（迭代下钻，循环防护）
    pub async fn walk_files(&self, root: &str) -> TaskResult<Vec<WebdavItem>> {
        let mut stack = vec![normalize_path(root)];
        let mut seen: HashSet<String> = HashSet::new();
        let mut files = Vec::new();

        while let Some(current) = stack.pop() {
            if !seen.insert(current.clone()) {
                continue;
            }
            let items = self.list_dir(&current).await?;
            for item in items {
                // 自引用条目（目录自身）跳过
                if normalize_path(&item.href) == current {
                    continue;
                }
                if item.is_dir {
                    stack.push(normalize_path(&item.href));
                } else {
                    files.push(item);
                }
            }
        }

        info!("WebDAV 递归列举完成: {} 个文件", files.len());
        Ok(files)
    }

    /// 下载单个文件（续传语义由下载器保证）
    pub async fn download<F>(
        &self,
        href: &str,
        dest: &Path,
        cancel: &CancellationToken,
        progress: F,
    ) -> TaskResult<FetchOutcome>
    where
        F: FnMut(u64, Option<u64>),
    {
        let url = self.url_for(href);
        self.fetcher
            .fetch(
                &url,
                dest,
                Some((&self.username, &self.password)),
                cancel,
                progress,
            )
            .await
    }

    fn url_for(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }
}

/// 归一化路径：去掉首尾斜杠差异
fn normalize_path(path: &str) -> String {
    let trimmed = path.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

/// 从 PROPFIND 响应中提取条目
///
/// 按 `<response>` 段切分，段内扫描 href、getcontentlength 与
/// collection 标记；标签前缀（d:/D:/lp1: 等）不做假设
fn parse_propfind(body: &str) -> Vec<WebdavItem> {
    let lower = body.to_lowercase();
    let mut items = Vec::new();

    let mut search_from = 0usize;
    while let Some(rel_start) = lower[search_from..].find(":response") {
        let seg_start = search_from + rel_start;
        let seg_end = lower[seg_start + 1..]
            .find(":response>")
            .map(|p| seg_start + 1 + p)
            .unwrap_or(lower.len());

        let segment = &body[seg_start..seg_end];
        let segment_lower = &lower[seg_start..seg_end];

        if let Some(href) = extract_tag_text(segment, segment_lower, "href") {
            let is_dir = segment_lower.contains(":collection");
            let size = extract_tag_text(segment, segment_lower, "getcontentlength")
                .and_then(|s| s.trim().parse().ok())
                .unwrap_or(0);
            let decoded = percent_decode(&href);
            let name = decoded
                .trim_end_matches('/')
                .rsplit('/')
                .next()
                .unwrap_or("")
                .to_string();
            if !name.is_empty() || is_dir {
                items.push(WebdavItem {
                    href: href.trim().to_string(),
                    name,
                    is_dir,
                    size,
                });
            }
        }
        search_from = seg_end.min(lower.len().saturating_sub(1)).max(seg_start + 1);
        if seg_end >= lower.len() {
            break;
        }
    }
    items
}

/// 提取 `<prefix:tag>文本</prefix:tag>` 中的文本
fn extract_tag_text(segment: &str, segment_lower: &str, tag: &str) -> Option<String> {
    let open_marker = format!(":{}>", tag);
    let open_pos = segment_lower.find(&open_marker)? + open_marker.len();
    let close_rel = segment_lower[open_pos..].find('<')?;
    Some(segment[open_pos..open_pos + close_rel].to_string())
}

/// 最小化的百分号解码（路径展示用）
fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Ok(v) = u8::from_str_radix(&input[i + 1..i + 3], 16) {
                out.push(v);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

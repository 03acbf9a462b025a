//! 相册分批器
//!
//! 以流式构建器消费解压器产出的媒体序列：每个
//! (压缩包, 解压根) 组合最多持有两个未封口的缓冲（图片、视频），
//! 缓冲达到相册上限即封口产出一批。图片与视频永不混装。
//!
//! 批次总数在发现更多条目时只增不减，标注为近似值。

use std::path::PathBuf;

use crate::task::MediaKind;

/// 封口产出的一批
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlbumBatch {
    pub files: Vec<PathBuf>,
    pub kind: MediaKind,
    pub archive_name: String,
    /// 批次序号（每个类别独立计数，从 1 开始）
    pub batch_index: usize,
    /// 批次总数估计（随发现更新）
    pub total_batches: usize,
}

impl AlbumBatch {
    /// 批次标题
    pub fn caption(&self) -> String {
        format!(
            "{} – {} (Batch {}/{}: {} files)",
            self.archive_name,
            self.kind.album_label(),
            self.batch_index,
            self.total_batches,
            self.files.len()
        )
    }
}

/// 单类别缓冲
struct KindBuffer {
    kind: MediaKind,
    pending: Vec<PathBuf>,
    emitted_batches: usize,
    /// 预计条目总数（清单扫描提供；0 表示未知）
    expected_items: usize,
    /// 已经进入缓冲的条目总数
    seen_items: usize,
}

impl KindBuffer {
    fn new(kind: MediaKind) -> Self {
        Self {
            kind,
            pending: Vec::new(),
            emitted_batches: 0,
            expected_items: 0,
            seen_items: 0,
        }
    }

    /// 批次总数估计：基于预计条目数，下限为已封口数加未封口缓冲
    fn total_estimate(&self, cap: usize) -> usize {
        let known = self.seen_items.max(self.expected_items);
        let by_items = known.div_ceil(cap);
        let floor = self.emitted_batches + usize::from(!self.pending.is_empty());
        by_items.max(floor).max(1)
    }
}

/// 单个 (压缩包, 解压根) 的相册分批器
pub struct AlbumBatcher {
    cap: usize,
    archive_name: String,
    images: KindBuffer,
    videos: KindBuffer,
}

impl AlbumBatcher {
    pub fn new(archive_name: String, cap: usize) -> Self {
        assert!(cap >= 1, "相册上限必须 >= 1");
        Self {
            cap,
            archive_name,
            images: KindBuffer::new(MediaKind::Image),
            videos: KindBuffer::new(MediaKind::Video),
        }
    }

    /// 设置各类别预计条目总数（来自清单扫描）
    pub fn set_expected(&mut self, images: usize, videos: usize) {
        self.images.expected_items = images;
        self.videos.expected_items = videos;
    }

    fn buffer_mut(&mut self, kind: MediaKind) -> Option<&mut KindBuffer> {
        match kind {
            MediaKind::Image => Some(&mut self.images),
            MediaKind::Video => Some(&mut self.videos),
            _ => None,
        }
    }

    /// 放入一个媒体文件；目标缓冲达到上限时返回封口的批
    pub fn push(&mut self, path: PathBuf, kind: MediaKind) -> Option<AlbumBatch> {
        let cap = self.cap;
        let archive_name = self.archive_name.clone();
        let buffer = self.buffer_mut(kind)?;

        buffer.seen_items += 1;
        buffer.pending.push(path);

        if buffer.pending.len() >= cap {
            buffer.emitted_batches += 1;
            let files = std::mem::take(&mut buffer.pending);
            let batch = AlbumBatch {
                files,
                kind: buffer.kind,
                archive_name,
                batch_index: buffer.emitted_batches,
                total_batches: buffer.total_estimate(cap),
            };
            return Some(batch);
        }
        None
    }

    /// 流结束：封口所有非空缓冲为尾批
    pub fn flush(&mut self) -> Vec<AlbumBatch> {
        let cap = self.cap;
        let archive_name = self.archive_name.clone();
        let mut batches = Vec::new();

        for buffer in [&mut self.images, &mut self.videos] {
            if buffer.pending.is_empty() {
                continue;
            }
            buffer.emitted_batches += 1;
            let files = std::mem::take(&mut buffer.pending);
            batches.push(AlbumBatch {
                files,
                kind: buffer.kind,
                archive_name: archive_name.clone(),
                batch_index: buffer.emitted_batches,
                total_batches: buffer.total_estimate(cap),
            });
        }
        batches
    }

    /// 未封口的缓冲是否为空
    pub fn is_empty(&self) -> bool {
        self.images.pending.is_empty() && self.videos.pending.is_empty()
    }
}

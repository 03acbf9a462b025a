//! 文件系统协作层
//!
//! 统一封装内核依赖的文件系统原语：原子重命名、唯一临时文件名、
//! 剩余空间探测、空目录清理、批量删除

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use sysinfo::Disks;
use tracing::{debug, warn};
use uuid::Uuid;

/// 确保目录存在
pub fn ensure_dir(dir: &Path) -> io::Result<()> {
    if !dir.exists() {
        fs::create_dir_all(dir)?;
        debug!("已创建目录: {:?}", dir);
    }
    Ok(())
}

/// 原子重命名（同一文件系统内）
///
/// 用于 `.part` -> 最终文件、`.tmp` -> 正式状态文件等提交点
pub fn atomic_rename(from: &Path, to: &Path) -> io::Result<()> {
    fs::rename(from, to)
}

/// 在指定目录生成唯一临时文件路径（不创建文件）
///
/// # Arguments
/// * `dir` - 目标目录
/// * `suffix` - 文件后缀（含点，如 ".jpg"；空串则用 ".tmp"）
pub fn unique_temp_path(dir: &Path, suffix: &str) -> PathBuf {
    let suffix = if suffix.is_empty() { ".tmp" } else { suffix };
    dir.join(format!("{}{}", Uuid::new_v4().simple(), suffix))
}

/// 探测包含指定路径的磁盘剩余空间（字节）
///
/// 通过挂载点最长前缀匹配定位磁盘；找不到时返回 None
pub fn available_space(path: &Path) -> Option<u64> {
    let disks = Disks::new_with_refreshed_list();
    let path_str = path.to_string_lossy();

    let mut best: Option<(u64, usize)> = None;
    for disk in disks.list() {
        let mount = disk.mount_point().to_string_lossy();
        if path_str.starts_with(mount.as_ref()) {
            let len = mount.len();
            if best.map(|(_, l)| len > l).unwrap_or(true) {
                best = Some((disk.available_space(), len));
            }
        }
    }
    best.map(|(space, _)| space)
}

/// 删除单个文件（容错，不存在视为成功）
pub fn remove_file_quiet(path: &Path) {
    match fs::remove_file(path) {
        Ok(_) => debug!("已删除文件: {:?}", path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("删除文件失败 {:?}: {}", path, e),
    }
}

/// 批量删除清理引用列表中的文件
pub fn remove_all_quiet<P: AsRef<Path>>(paths: &[P]) {
    for p in paths {
        remove_file_quiet(p.as_ref());
    }
}

/// 删除目录树（容错）
pub fn remove_dir_all_quiet(path: &Path) {
    match fs::remove_dir_all(path) {
        Ok(_) => debug!("已删除目录: {:?}", path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("删除目录失败 {:?}: {}", path, e),
    }
}

/// 若目录为空则删除，返回是否删除
pub fn remove_dir_if_empty(path: &Path) -> bool {
    match fs::read_dir(path) {
        Ok(mut entries) => {
            if entries.next().is_none() {
                if let Err(e) = fs::remove_dir(path) {
                    warn!("删除空目录失败 {:?}: {}", path, e);
                    return false;
                }
                debug!("已删除空目录: {:?}", path);
                return true;
            }
            false
        }
        Err(_) => false,
    }
}

/// 将文件移动到隔离目录，返回新路径
///
/// 跨文件系统时退化为复制 + 删除
pub fn move_into_dir(src: &Path, dest_dir: &Path) -> io::Result<PathBuf> {
    ensure_dir(dest_dir)?;
    let file_name = src
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "路径缺少文件名"))?;
    let mut dest = dest_dir.join(file_name);
    // 避免同名覆盖
    if dest.exists() {
        let stem = dest
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let ext = dest
            .extension()
            .map(|s| format!(".{}", s.to_string_lossy()))
            .unwrap_or_default();
        dest = dest_dir.join(format!("{}_{}{}", stem, Uuid::new_v4().simple(), ext));
    }

    match fs::rename(src, &dest) {
        Ok(_) => Ok(dest),
        Err(_) => {
            fs::copy(src, &dest)?;
            fs::remove_file(src)?;
            Ok(dest)
        }
    }
}

/// 格式化文件大小为人类可读格式
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// 格式化剩余时间（秒）
pub fn format_eta(secs: f64) -> String {
    if !secs.is_finite() || secs < 0.0 {
        return "--:--".to_string();
    }
    let secs = secs as u64;
    if secs >= 3600 {
        format!("{}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
    } else {
        format!("{:02}:{:02}", secs / 60, secs % 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_unique_temp_path() {
        let dir = Path::new("/tmp");
        let a = unique_temp_path(dir, ".jpg");
        let b = unique_temp_path(dir, ".jpg");
        assert_ne!(a, b);
        assert!(a.to_string_lossy().ends_with(".jpg"));

        let c = unique_temp_path(dir, "");
        assert!(c.to_string_lossy().ends_with(".tmp"));
    }

    #[test]
    fn test_remove_dir_if_empty() {
        let temp = TempDir::new().unwrap();
        let sub = temp.path().join("sub");
        fs::create_dir(&sub).unwrap();

        // 空目录应被删除
        assert!(remove_dir_if_empty(&sub));
        assert!(!sub.exists());

        // 非空目录保留
        let sub2 = temp.path().join("sub2");
        fs::create_dir(&sub2).unwrap();
        fs::write(sub2.join("f.txt"), b"x").unwrap();
        assert!(!remove_dir_if_empty(&sub2));
        assert!(sub2.exists());
    }

    #[test]
    fn test_move_into_dir() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("a.bin");
        fs::write(&src, b"data").unwrap();

        let dest_dir = temp.path().join("quarantine");
        let moved = move_into_dir(&src, &dest_dir).unwrap();

        assert!(!src.exists());
        assert!(moved.exists());
        assert_eq!(fs::read(&moved).unwrap(), b"data");
    }

    #[test]
    fn test_move_into_dir_name_collision() {
        let temp = TempDir::new().unwrap();
        let dest_dir = temp.path().join("q");
        fs::create_dir(&dest_dir).unwrap();
        fs::write(dest_dir.join("a.bin"), b"old").unwrap();

        let src = temp.path().join("a.bin");
        fs::write(&src, b"new").unwrap();

        let moved = move_into_dir(&src, &dest_dir).unwrap();
        // 同名文件不被覆盖
        assert_ne!(moved, dest_dir.join("a.bin"));
        assert_eq!(fs::read(dest_dir.join("a.bin")).unwrap(), b"old");
        assert_eq!(fs::read(&moved).unwrap(), b"new");
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(2048), "2.00 KB");
        assert_eq!(format_size(5 * 1024 * 1024), "5.00 MB");
    }

    #[test]
    fn test_format_eta() {
        assert_eq!(format_eta(75.0), "01:15");
        assert_eq!(format_eta(3725.0), "1:02:05");
        assert_eq!(format_eta(f64::INFINITY), "--:--");
    }
}

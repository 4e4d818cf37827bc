//! 图片缓存、下载锁与临时目录

use crate::error::MediaError;
use crate::gateway::{Gateway, api};
use crate::message::ImageMeta;
use rand::distr::Alphanumeric;
use rand::{Rng, rng};
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::fs;
use tracing::{debug, info, warn};

/// 引用图片查找时尝试的扩展名
pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif"];

/// CDN 图片下载超时
pub const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(90);

/// 下载锁超过该时长视为遗留
pub const LOCK_STALE_AFTER: Duration = Duration::from_secs(300);

/// aeskey 仅保留文件名安全的字符
fn file_stem(aeskey: &str) -> String {
    aeskey
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect()
}

/// 在缓存目录中按 aeskey 查找已下载的图片
pub fn find_cached(dir: &Path, aeskey: &str) -> Option<PathBuf> {
    let stem = file_stem(aeskey);
    if stem.is_empty() {
        return None;
    }
    IMAGE_EXTENSIONS
        .iter()
        .map(|ext| dir.join(format!("{}.{}", stem, ext)))
        .find(|p| p.is_file())
}

// ================== 临时目录 ==================

/// 自动清理的临时工作目录
/// 目录名为 `<prefix>_<时间>_<随机串>`，释放时删除整个目录。
pub struct ScratchDir {
    pub path: PathBuf,
}

impl ScratchDir {
    pub fn new(base: &Path, prefix: &str) -> io::Result<Self> {
        std::fs::create_dir_all(base)?;
        let name = format!(
            "{}_{}_{}",
            prefix,
            chrono::Local::now().format("%Y%m%d_%H%M%S"),
            rng()
                .sample_iter(&Alphanumeric)
                .take(6)
                .map(char::from)
                .collect::<String>()
        );
        let path = base.join(name);
        std::fs::create_dir(&path)?;
        Ok(Self { path })
    }

    pub fn file(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if std::fs::remove_dir_all(&self.path).is_ok() || !self.path.exists() {
            return;
        }
        // 文件仍被占用时在阻塞线程池上重试，不占用异步工作线程
        let path = self.path.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || remove_with_retry(&path));
            }
            Err(_) => warn!(target: "Media", "临时目录清理失败: {}", path.display()),
        }
    }
}

fn remove_with_retry(path: &Path) -> bool {
    for i in 0..5u64 {
        if std::fs::remove_dir_all(path).is_ok() || !path.exists() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(50 * (i + 1)));
    }
    warn!(target: "Media", "临时目录清理失败: {}", path.display());
    false
}

// ================== 下载锁 ==================

/// 基于锁文件的跨任务下载互斥，释放时删除锁文件
#[derive(Debug)]
pub struct DownloadLock {
    path: PathBuf,
}

impl DownloadLock {
    /// 尝试获取锁；已有未过期的锁时返回 `None`
    pub fn acquire(lock_dir: &Path, msg_id: &str, stale_after: Duration) -> io::Result<Option<Self>> {
        std::fs::create_dir_all(lock_dir)?;
        let path = lock_dir.join(format!("img_{}.lock", file_stem(msg_id)));

        if let Ok(meta) = std::fs::metadata(&path) {
            let age = meta
                .modified()
                .ok()
                .and_then(|t| SystemTime::now().duration_since(t).ok())
                .unwrap_or_default();
            if age < stale_after {
                return Ok(None);
            }
            warn!(target: "Media", "图片 {} 的下载锁已过期，重新下载", msg_id);
            let _ = std::fs::remove_file(&path);
        }

        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                let now = chrono::Utc::now().timestamp();
                let _ = write!(file, "{}", now);
                Ok(Some(Self { path }))
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DownloadLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path)
            && e.kind() != io::ErrorKind::NotFound
        {
            warn!(target: "Media", "删除下载锁失败 {}: {}", self.path.display(), e);
        }
    }
}

// ================== 图片缓存 ==================

/// 入站图片的本地缓存
/// 文件以 `<aeskey>.<扩展名>` 命名，引用图片时可直接按 aeskey 查找。
pub struct ImageStore {
    dir: PathBuf,
    lock_dir: PathBuf,
    gateway: Arc<dyn Gateway>,
}

impl ImageStore {
    pub fn new(dir: PathBuf, gateway: Arc<dyn Gateway>) -> Self {
        let lock_dir = dir
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(|p| p.join("img_locks"))
            .unwrap_or_else(|| PathBuf::from("img_locks"));
        Self {
            dir,
            lock_dir,
            gateway,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn lock_dir(&self) -> &Path {
        &self.lock_dir
    }

    pub async fn ensure_dirs(&self) -> io::Result<()> {
        fs::create_dir_all(&self.dir).await?;
        fs::create_dir_all(&self.lock_dir).await
    }

    /// 下载图片到缓存目录
    /// 返回 `Ok(None)` 表示另一个任务正在下载同一条消息的图片。
    pub async fn fetch(&self, msg_id: &str, meta: &ImageMeta) -> Result<Option<PathBuf>, MediaError> {
        if meta.aeskey.is_empty() {
            return Err(MediaError::Unsupported("图片缺少 aeskey".to_string()));
        }
        if let Some(path) = find_cached(&self.dir, &meta.aeskey) {
            debug!(target: "Media", "图片已在缓存中: {}", path.display());
            return Ok(Some(path));
        }

        let Some(_lock) = DownloadLock::acquire(&self.lock_dir, msg_id, LOCK_STALE_AFTER)? else {
            info!(target: "Media", "图片 {} 正在由其他任务下载，跳过", msg_id);
            return Ok(None);
        };

        let bytes = api::cdn_download(
            self.gateway.as_ref(),
            &meta.aeskey,
            meta.file_type,
            &meta.cdn_url,
            DOWNLOAD_TIMEOUT,
        )
        .await?;
        if bytes.is_empty() {
            return Err(MediaError::Download("CDN 返回空文件".to_string()));
        }

        let ext = match image::guess_format(&bytes) {
            Ok(format) => format.extensions_str().first().copied().unwrap_or("jpg"),
            Err(_) => {
                warn!(target: "Media", "无法识别图片格式 (ID: {})，按 jpg 保存", msg_id);
                "jpg"
            }
        };

        fs::create_dir_all(&self.dir).await?;
        let path = self
            .dir
            .join(format!("{}.{}", file_stem(&meta.aeskey), ext));
        fs::write(&path, &bytes).await?;
        info!(
            target: "Media",
            "图片下载完成 (ID: {}, {} 字节): {}",
            msg_id,
            bytes.len(),
            path.display()
        );
        Ok(Some(path))
    }
}

/// 删除缓存目录中超过保留期的图片，返回 (文件数, 字节数)
pub async fn sweep(dir: &Path, retention: Duration) -> io::Result<(usize, u64)> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((0, 0)),
        Err(e) => return Err(e),
    };

    let now = SystemTime::now();
    let (mut count, mut bytes) = (0usize, 0u64);
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let is_image = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()));
        if !is_image {
            continue;
        }
        let Ok(meta) = entry.metadata().await else {
            continue;
        };
        let expired = meta
            .modified()
            .ok()
            .and_then(|t| now.duration_since(t).ok())
            .is_some_and(|age| age > retention);
        if expired && fs::remove_file(&path).await.is_ok() {
            count += 1;
            bytes += meta.len();
        }
    }

    if count > 0 {
        info!(
            target: "Media",
            "图片缓存清理完成: {} 个文件, {:.2} MB",
            count,
            bytes as f64 / 1024.0 / 1024.0
        );
    }
    Ok((count, bytes))
}

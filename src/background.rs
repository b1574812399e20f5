//! 清理上传目录中残留暂存文件的后台任务。

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::fs;
use tracing::{info, warn};

use crate::atomic::is_staging_name;
use crate::config::STAGING_SWEEP_INTERVAL_SECS;
use crate::storage::UploadLayout;

/// 启动暂存文件清理任务；`ttl` 为零时不启动。
pub fn spawn_background_tasks(layout: Arc<UploadLayout>, ttl: Duration) {
    if ttl.is_zero() {
        return;
    }

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(STAGING_SWEEP_INTERVAL_SECS));
        loop {
            interval.tick().await;
            sweep_staging_files(&layout, ttl).await;
        }
    });
}

/// 删除所有上传目录中超过 `ttl` 的暂存文件，返回删除数量。
pub async fn sweep_staging_files(layout: &UploadLayout, ttl: Duration) -> usize {
    let mut removed = 0;
    for dir in layout.upload_dirs() {
        match sweep_dir(&dir, ttl).await {
            Ok(count) => removed += count,
            Err(err) => warn!(dir = ?dir, error = %err, "staging sweep failed"),
        }
    }
    removed
}

async fn sweep_dir(dir: &Path, ttl: Duration) -> std::io::Result<usize> {
    let now = SystemTime::now();
    let mut removed = 0;
    let mut entries = fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        if !is_staging_name(&name.to_string_lossy()) {
            continue;
        }
        let metadata = entry.metadata().await?;
        let Ok(modified) = metadata.modified() else {
            continue;
        };
        let Ok(age) = now.duration_since(modified) else {
            continue;
        };
        if age < ttl {
            continue;
        }
        let path = entry.path();
        if let Err(err) = fs::remove_file(&path).await {
            warn!(path = ?path, error = %err, "failed to remove stale staging file");
        } else {
            info!(path = ?path, "removed stale staging file");
            removed += 1;
        }
    }
    Ok(removed)
}

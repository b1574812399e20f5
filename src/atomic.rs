//! 上传暂存文件：写入临时文件，校验通过后原子重命名。

use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// 暂存文件名中的标记，后台清理据此识别残留文件。
pub const STAGING_MARKER: &str = ".part.";

/// 与目标文件同目录的暂存文件。
#[derive(Debug)]
pub struct StagedFile {
    target: PathBuf,
    staging_path: PathBuf,
    file: File,
    written: u64,
}

impl StagedFile {
    /// 在目标路径同目录创建暂存文件。
    pub async fn create(target: &Path) -> io::Result<Self> {
        let parent = target
            .parent()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "target has no parent"))?;
        let base = target
            .file_name()
            .map(|name| name.to_string_lossy())
            .unwrap_or_else(|| "upload".into());
        let staging_path = parent.join(format!(".{base}{STAGING_MARKER}{}", Uuid::new_v4()));
        let file = File::create(&staging_path).await?;
        Ok(Self {
            target: target.to_path_buf(),
            staging_path,
            file,
            written: 0,
        })
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub async fn write_chunk(&mut self, chunk: &[u8]) -> io::Result<()> {
        self.file.write_all(chunk).await?;
        self.written += chunk.len() as u64;
        Ok(())
    }

    /// 放弃并删除暂存文件。
    pub async fn discard(self) {
        drop(self.file);
        let _ = fs::remove_file(&self.staging_path).await;
    }

    /// 落盘并重命名为最终文件名，失败时清理暂存文件。
    pub async fn commit(self) -> io::Result<PathBuf> {
        if let Err(err) = self.file.sync_all().await {
            let _ = fs::remove_file(&self.staging_path).await;
            return Err(err);
        }
        drop(self.file);

        if let Err(err) = fs::rename(&self.staging_path, &self.target).await {
            let _ = fs::remove_file(&self.staging_path).await;
            return Err(err);
        }

        if let Some(parent) = self.target.parent() {
            let _ = sync_dir(parent).await;
        }
        Ok(self.target)
    }
}

/// 判断文件名是否为暂存文件。
pub fn is_staging_name(name: &str) -> bool {
    name.starts_with('.')
        && name
            .rsplit_once(STAGING_MARKER)
            .is_some_and(|(_, suffix)| Uuid::parse_str(suffix).is_ok())
}

async fn sync_dir(path: &Path) -> io::Result<()> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let dir = std::fs::File::open(path)?;
        dir.sync_all()
    })
    .await
    .map_err(|err| io::Error::other(err.to_string()))?
}

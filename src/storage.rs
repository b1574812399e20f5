//! 上传目录布局、目录初始化与路径包含校验。

use std::io;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::io::ErrorKind;
use tracing::{debug, warn};

const LOGO_DIR: [&str; 3] = ["uploads", "institutes", "logos"];
const DOCUMENT_DIR: [&str; 3] = ["uploads", "institutes", "documents"];
const PHOTO_DIR: [&str; 3] = ["uploads", "students", "photos"];
const CV_DIR: [&str; 3] = ["uploads", "students", "cvs"];

/// 公共目录下的上传目录布局。
#[derive(Clone, Debug)]
pub struct UploadLayout {
    public_root: PathBuf,
}

impl UploadLayout {
    pub fn new(public_root: PathBuf) -> Self {
        Self { public_root }
    }

    pub fn public_root(&self) -> &Path {
        &self.public_root
    }

    pub fn logos(&self) -> PathBuf {
        self.public_root.join(PathBuf::from_iter(LOGO_DIR))
    }

    pub fn documents(&self) -> PathBuf {
        self.public_root.join(PathBuf::from_iter(DOCUMENT_DIR))
    }

    pub fn photos(&self) -> PathBuf {
        self.public_root.join(PathBuf::from_iter(PHOTO_DIR))
    }

    pub fn cvs(&self) -> PathBuf {
        self.public_root.join(PathBuf::from_iter(CV_DIR))
    }

    /// 学生上传（照片与简历）的公共父目录。
    pub fn students(&self) -> PathBuf {
        self.public_root.join("uploads").join("students")
    }

    pub fn upload_dirs(&self) -> [PathBuf; 4] {
        [self.logos(), self.documents(), self.photos(), self.cvs()]
    }

    /// 创建全部上传目录；已存在视为成功，可重复调用。
    pub async fn ensure_dirs(&self) -> io::Result<()> {
        for dir in self.upload_dirs() {
            fs::create_dir_all(&dir).await?;
            debug!(dir = ?dir, "upload directory ready");
        }
        Ok(())
    }

    /// 把公共目录下的文件路径转换为对外 URL 路径。
    pub fn public_url(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.public_root).ok()?;
        let segments = relative
            .components()
            .map(|component| match component {
                Component::Normal(segment) => segment.to_str(),
                _ => None,
            })
            .collect::<Option<Vec<_>>>()?;
        Some(format!("/{}", segments.join("/")))
    }
}

/// 在 `root` 内解析不可信的文件名，越界一律拒绝。
///
/// 先做词法检查（`..` 不得越过根），再规范化真实路径（解析符号链接）
/// 并按路径组件比较前缀。越界优先于文件是否存在。
pub async fn resolve_within(root: &Path, name: &str) -> Result<PathBuf, StorageError> {
    let lexical = lexical_join(root, name)?;
    if lexical == root {
        return Err(StorageError::NotFound);
    }

    let canonical_root = fs::canonicalize(root).await.map_err(not_found_or_io)?;
    let canonical = fs::canonicalize(&lexical).await.map_err(not_found_or_io)?;
    if canonical == canonical_root || !canonical.starts_with(&canonical_root) {
        warn!(requested = name, resolved = ?canonical, "path escapes allowed root");
        return Err(StorageError::AccessDenied);
    }

    let metadata = fs::metadata(&canonical).await?;
    if !metadata.is_file() {
        return Err(StorageError::NotFound);
    }
    Ok(canonical)
}

fn lexical_join(root: &Path, name: &str) -> Result<PathBuf, StorageError> {
    let mut normalized: Vec<&std::ffi::OsStr> = Vec::new();
    for component in Path::new(name).components() {
        match component {
            Component::Normal(segment) => normalized.push(segment),
            Component::CurDir => continue,
            Component::ParentDir => {
                if normalized.pop().is_none() {
                    warn!(requested = name, "path traversal rejected");
                    return Err(StorageError::AccessDenied);
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                warn!(requested = name, "absolute path rejected");
                return Err(StorageError::AccessDenied);
            }
        }
    }
    Ok(normalized
        .into_iter()
        .fold(root.to_path_buf(), |path, segment| path.join(segment)))
}

fn not_found_or_io(err: io::Error) -> StorageError {
    if err.kind() == ErrorKind::NotFound {
        StorageError::NotFound
    } else {
        StorageError::Io(err)
    }
}

#[derive(Debug)]
pub enum StorageError {
    AccessDenied,
    NotFound,
    Io(io::Error),
}

impl From<io::Error> for StorageError {
    fn from(err: io::Error) -> Self {
        StorageError::Io(err)
    }
}

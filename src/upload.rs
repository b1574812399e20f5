//! 表单文件上传：按字段选择目录、校验 MIME 与大小、生成文件名，整请求原子提交。

use axum::extract::Multipart;
use axum::extract::multipart::{Field, MultipartError};
use chrono::Utc;
use rand::Rng;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, warn};

use crate::atomic::StagedFile;
use crate::config::UnknownFieldMode;
use crate::storage::UploadLayout;

const BASE36: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const TOKEN_LEN: usize = 8;

pub const DOCUMENT_FIELD: &str = "verification_doc";

pub const IMAGE_TYPES: &[&str] = &[
    "image/png",
    "image/jpeg",
    "image/jpg",
    "image/webp",
    "image/gif",
];
pub const DOCUMENT_TYPES: &[&str] = &[
    "application/pdf",
    "image/png",
    "image/jpeg",
    "image/jpg",
    "image/webp",
];
pub const CV_TYPES: &[&str] = &[
    "application/pdf",
    "application/msword",
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
];

#[derive(Debug)]
pub enum UploadError {
    UnexpectedField(String),
    UnrecognizedField(String),
    InvalidFileType(String),
    FileTooLarge { field: String, limit: u64 },
    Multipart(MultipartError),
    Io(io::Error),
}

impl From<io::Error> for UploadError {
    fn from(err: io::Error) -> Self {
        UploadError::Io(err)
    }
}

impl From<MultipartError> for UploadError {
    fn from(err: MultipartError) -> Self {
        UploadError::Multipart(err)
    }
}

#[derive(Clone, Debug)]
pub struct FieldRule {
    pub directory: PathBuf,
    pub allowed_types: Vec<String>,
}

/// 未登记字段的处理方式。
#[derive(Clone, Debug)]
pub enum UnknownField {
    Reject,
    Fallback(PathBuf),
}

/// 字段名到目录与 MIME 白名单的映射。
#[derive(Clone, Debug)]
pub struct UploadPolicy {
    rules: HashMap<String, FieldRule>,
    unknown: UnknownField,
    max_file_size: u64,
}

impl UploadPolicy {
    pub fn new(max_file_size: u64, unknown: UnknownField) -> Self {
        Self {
            rules: HashMap::new(),
            unknown,
            max_file_size,
        }
    }

    /// 平台默认的四个上传字段。
    pub fn standard(layout: &UploadLayout, max_file_size: u64, mode: UnknownFieldMode) -> Self {
        let unknown = match mode {
            UnknownFieldMode::Reject => UnknownField::Reject,
            UnknownFieldMode::Fallback => UnknownField::Fallback(layout.logos()),
        };
        Self::new(max_file_size, unknown)
            .with_field("logo", layout.logos(), IMAGE_TYPES)
            .with_field(DOCUMENT_FIELD, layout.documents(), DOCUMENT_TYPES)
            .with_field("profile_photo", layout.photos(), IMAGE_TYPES)
            .with_field("cv", layout.cvs(), CV_TYPES)
    }

    pub fn with_field(mut self, name: &str, directory: PathBuf, allowed_types: &[&str]) -> Self {
        self.rules.insert(
            name.to_string(),
            FieldRule {
                directory,
                allowed_types: allowed_types.iter().map(|ty| ty.to_string()).collect(),
            },
        );
        self
    }

    pub fn max_file_size(&self) -> u64 {
        self.max_file_size
    }

    /// 选择字段的落盘目录。
    pub fn destination(&self, field: &str) -> Result<&Path, UploadError> {
        if let Some(rule) = self.rules.get(field) {
            return Ok(rule.directory.as_path());
        }
        match &self.unknown {
            UnknownField::Reject => {
                warn!(field, "upload field has no policy entry");
                Err(UploadError::UnrecognizedField(field.to_string()))
            }
            UnknownField::Fallback(directory) => {
                warn!(field, directory = ?directory, "upload field routed to fallback directory");
                Ok(directory.as_path())
            }
        }
    }

    fn allowed_types(&self, field: &str) -> &[String] {
        self.rules
            .get(field)
            .map(|rule| rule.allowed_types.as_slice())
            .unwrap_or_default()
    }

    /// 字段白名单是否包含该 MIME。
    pub fn allows(&self, field: &str, content_type: &str) -> bool {
        let declared = mime_essence(content_type);
        self.allowed_types(field)
            .iter()
            .any(|ty| ty.eq_ignore_ascii_case(declared))
    }

    /// 校验声明的 MIME；`Ok(false)` 表示白名单为空，文件被静默丢弃。
    pub fn check_content_type(
        &self,
        field: &str,
        content_type: Option<&str>,
    ) -> Result<bool, UploadError> {
        if self.allowed_types(field).is_empty() {
            return Ok(false);
        }
        if content_type.is_some_and(|ty| self.allows(field, ty)) {
            Ok(true)
        } else {
            Err(UploadError::InvalidFileType(field.to_string()))
        }
    }
}

fn mime_essence(content_type: &str) -> &str {
    content_type
        .split(';')
        .next()
        .map(str::trim)
        .unwrap_or(content_type)
}

/// 落盘扩展名跟随已通过校验的 MIME：原扩展名与之相符才保留，否则取该 MIME 的标准扩展名。
fn stored_extension(original_name: Option<&str>, content_type: Option<&str>) -> String {
    let Some(declared) = content_type.map(mime_essence).map(str::to_ascii_lowercase) else {
        return String::new();
    };
    let declared = match declared.as_str() {
        "image/jpg" => "image/jpeg".to_string(),
        _ => declared,
    };

    let original = original_name
        .and_then(|name| Path::new(name).extension())
        .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
        .filter(|ext| {
            mime_guess::from_ext(ext)
                .iter()
                .any(|mime| mime.essence_str() == declared)
        });
    original
        .or_else(|| {
            mime_guess::get_mime_extensions_str(&declared)
                .and_then(|exts| exts.first())
                .map(|ext| ext.to_string())
        })
        .map(|ext| format!(".{ext}"))
        .unwrap_or_default()
}

/// 生成 `<字段>-<毫秒时间戳>-<base36 随机串><扩展名>`。
pub fn generate_filename(
    field: &str,
    original_name: Option<&str>,
    content_type: Option<&str>,
) -> String {
    let ext = stored_extension(original_name, content_type);
    let mut rng = rand::rng();
    let token: String = (0..TOKEN_LEN)
        .map(|_| BASE36[rng.random_range(0..BASE36.len())] as char)
        .collect();
    format!("{field}-{}-{token}{ext}", Utc::now().timestamp_millis())
}

#[derive(Clone, Copy, Debug)]
pub struct FieldLimit {
    pub name: &'static str,
    pub max_count: usize,
}

/// 路由允许出现的文件字段。
#[derive(Clone, Copy, Debug)]
pub enum AcceptFields<'a> {
    Any,
    Only(&'a [FieldLimit]),
}

impl AcceptFields<'_> {
    fn admit(&self, field: &str, seen: usize) -> bool {
        match self {
            AcceptFields::Any => true,
            AcceptFields::Only(limits) => limits
                .iter()
                .any(|limit| limit.name == field && seen < limit.max_count),
        }
    }

    /// 路由请求体上限：每个文件的上限乘以文件总数。
    pub fn body_limit(&self, max_file_size: u64, overhead: usize) -> Option<usize> {
        let AcceptFields::Only(limits) = self else {
            return None;
        };
        let files: usize = limits.iter().map(|limit| limit.max_count).sum();
        usize::try_from(max_file_size)
            .ok()
            .and_then(|size| size.checked_mul(files))
            .and_then(|total| total.checked_add(overhead))
    }
}

/// 已落盘的上传文件。
#[derive(Clone, Debug)]
pub struct StoredFile {
    pub field: String,
    pub original_name: Option<String>,
    pub content_type: Option<String>,
    pub file_name: String,
    pub path: PathBuf,
    pub size: u64,
}

#[derive(Debug, Default)]
pub struct UploadOutcome {
    pub files: Vec<StoredFile>,
    pub fields: HashMap<String, String>,
    /// 因白名单为空被静默丢弃的文件字段。
    pub rejected: Vec<String>,
}

impl UploadOutcome {
    pub fn file(&self, field: &str) -> Option<&StoredFile> {
        self.files.iter().find(|file| file.field == field)
    }

    /// 删除已提交的文件（后续业务失败时调用）。
    pub async fn discard(self) {
        remove_stored(&self.files).await;
    }
}

async fn remove_stored(files: &[StoredFile]) {
    for file in files {
        if let Err(err) = fs::remove_file(&file.path).await {
            warn!(path = ?file.path, error = %err, "failed to remove uploaded file");
        }
    }
}

struct Staged {
    staged: StagedFile,
    record: StoredFile,
}

/// 读取整个表单；任一文件失败则所有文件都不落盘。
pub async fn receive_upload(
    multipart: &mut Multipart,
    policy: &UploadPolicy,
    accept: AcceptFields<'_>,
) -> Result<UploadOutcome, UploadError> {
    let mut staged = Vec::new();
    let mut outcome = UploadOutcome::default();

    if let Err(err) = stage_fields(multipart, policy, accept, &mut staged, &mut outcome).await {
        for entry in staged {
            entry.staged.discard().await;
        }
        return Err(err);
    }

    let mut pending = staged.into_iter();
    while let Some(Staged { staged, mut record }) = pending.next() {
        match staged.commit().await {
            Ok(path) => {
                record.path = path;
                outcome.files.push(record);
            }
            Err(err) => {
                for rest in pending.by_ref() {
                    rest.staged.discard().await;
                }
                remove_stored(&outcome.files).await;
                return Err(UploadError::Io(err));
            }
        }
    }

    for file in &outcome.files {
        info!(
            field = file.field,
            name = file.file_name,
            size = file.size,
            "upload stored"
        );
    }
    Ok(outcome)
}

async fn stage_fields(
    multipart: &mut Multipart,
    policy: &UploadPolicy,
    accept: AcceptFields<'_>,
    staged: &mut Vec<Staged>,
    outcome: &mut UploadOutcome,
) -> Result<(), UploadError> {
    let mut counts: HashMap<String, usize> = HashMap::new();

    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_string();
        match field.file_name() {
            None => {
                let value = field.text().await?;
                outcome.fields.insert(name, value);
                continue;
            }
            // 浏览器对未选择文件的 file input 发送空文件名
            Some("") => {
                debug!(field = name, "empty file input skipped");
                continue;
            }
            Some(_) => {}
        }

        let seen = counts.entry(name.clone()).or_default();
        if !accept.admit(&name, *seen) {
            return Err(UploadError::UnexpectedField(name));
        }
        *seen += 1;

        let directory = policy.destination(&name)?.to_path_buf();
        let content_type = field.content_type().map(str::to_string);
        if !policy.check_content_type(&name, content_type.as_deref())? {
            warn!(field = name, "upload dropped, field accepts no file types");
            outcome.rejected.push(name);
            continue;
        }

        let original_name = field.file_name().map(str::to_string);
        let file_name = generate_filename(&name, original_name.as_deref(), content_type.as_deref());
        let mut file = StagedFile::create(&directory.join(&file_name)).await?;
        if let Err(err) = copy_field(field, &mut file, &name, policy.max_file_size()).await {
            file.discard().await;
            return Err(err);
        }
        debug!(field = name, target = ?file.target(), bytes = file.written(), "upload staged");

        staged.push(Staged {
            record: StoredFile {
                field: name,
                original_name,
                content_type,
                file_name,
                path: file.target().to_path_buf(),
                size: file.written(),
            },
            staged: file,
        });
    }
    Ok(())
}

async fn copy_field(
    mut field: Field<'_>,
    file: &mut StagedFile,
    name: &str,
    limit: u64,
) -> Result<(), UploadError> {
    while let Some(chunk) = field.chunk().await? {
        if file.written() + chunk.len() as u64 > limit {
            warn!(field = name, limit, "upload exceeds size limit");
            return Err(UploadError::FileTooLarge {
                field: name.to_string(),
                limit,
            });
        }
        file.write_chunk(&chunk).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{MultipartBuilder, multipart_from};
    use std::collections::HashSet;
    use tempfile::tempdir;

    const PROFILE: &[FieldLimit] = &[
        FieldLimit {
            name: "profile_photo",
            max_count: 1,
        },
        FieldLimit {
            name: "cv",
            max_count: 1,
        },
    ];

    fn make_layout() -> (tempfile::TempDir, UploadLayout) {
        let temp = tempdir().expect("tempdir");
        let layout = UploadLayout::new(temp.path().join("public"));
        for dir in layout.upload_dirs() {
            std::fs::create_dir_all(dir).expect("create upload dir");
        }
        (temp, layout)
    }

    fn dir_entries(dir: &Path) -> Vec<String> {
        std::fs::read_dir(dir)
            .expect("read dir")
            .map(|entry| entry.expect("entry").file_name().to_string_lossy().to_string())
            .collect()
    }

    fn all_empty(layout: &UploadLayout) -> bool {
        layout
            .upload_dirs()
            .iter()
            .all(|dir| dir_entries(dir).is_empty())
    }

    /// `<field>-<digits>-<alnum>[.ext]`
    fn matches_generated(name: &str, field: &str, ext: &str) -> bool {
        let Some(rest) = name.strip_prefix(&format!("{field}-")) else {
            return false;
        };
        let Some(rest) = rest.strip_suffix(ext) else {
            return false;
        };
        let Some((millis, token)) = rest.split_once('-') else {
            return false;
        };
        !millis.is_empty()
            && millis.chars().all(|c| c.is_ascii_digit())
            && !token.is_empty()
            && token.chars().all(|c| c.is_ascii_alphanumeric())
    }

    #[test]
    fn filename_keeps_matching_extension() {
        let name = generate_filename("cv", Some("My Resume.final.PDF"), Some("application/pdf"));
        assert!(matches_generated(&name, "cv", ".pdf"), "{name}");

        let name = generate_filename("profile_photo", Some("me.JPG"), Some("image/jpg"));
        assert!(matches_generated(&name, "profile_photo", ".jpg"), "{name}");

        let name = generate_filename("logo", Some("noext"), Some("image/png"));
        assert!(matches_generated(&name, "logo", ".png"), "{name}");

        let name = generate_filename("logo", None, None);
        assert!(matches_generated(&name, "logo", ""), "{name}");
    }

    #[test]
    fn filename_extension_follows_accepted_type() {
        let name = generate_filename("profile_photo", Some("x.html"), Some("image/png"));
        assert!(matches_generated(&name, "profile_photo", ".png"), "{name}");

        let name = generate_filename("verification_doc", Some("doc.svg"), Some("application/pdf"));
        assert!(matches_generated(&name, "verification_doc", ".pdf"), "{name}");
    }

    #[test]
    fn generated_names_do_not_collide() {
        let names: HashSet<String> = (0..10_000)
            .map(|_| generate_filename("profile_photo", Some("me.png"), Some("image/png")))
            .collect();
        assert_eq!(names.len(), 10_000);
    }

    #[test]
    fn content_type_gate_is_independent_of_destination() {
        let (_temp, layout) = make_layout();
        let policy = UploadPolicy::standard(&layout, 1024, UnknownFieldMode::Fallback);

        assert_eq!(policy.destination("avatar").expect("fallback"), layout.logos());
        assert!(!policy.check_content_type("avatar", Some("image/png")).expect("silent"));

        assert!(policy.check_content_type("cv", Some("Application/PDF")).expect("pdf"));
        assert!(
            policy
                .check_content_type("logo", Some("image/png; charset=binary"))
                .expect("png")
        );
        assert!(matches!(
            policy.check_content_type("logo", Some("application/pdf")),
            Err(UploadError::InvalidFileType(field)) if field == "logo"
        ));
        assert!(matches!(
            policy.check_content_type("cv", None),
            Err(UploadError::InvalidFileType(_))
        ));
    }

    #[test]
    fn standard_policy_uses_five_mebibytes() {
        let (_temp, layout) = make_layout();
        let policy = UploadPolicy::standard(
            &layout,
            crate::config::DEFAULT_UPLOAD_MAX_FILE_SIZE,
            UnknownFieldMode::Reject,
        );
        assert_eq!(policy.max_file_size(), 5 * 1024 * 1024);
        assert!(matches!(
            policy.destination("avatar"),
            Err(UploadError::UnrecognizedField(_))
        ));
    }

    #[tokio::test]
    async fn each_field_lands_in_its_directory() {
        let (_temp, layout) = make_layout();
        let policy = UploadPolicy::standard(&layout, 1024, UnknownFieldMode::Reject);
        let cases = [
            ("logo", "uni.png", "image/png", layout.logos(), ".png"),
            (
                "verification_doc",
                "charter.pdf",
                "application/pdf",
                layout.documents(),
                ".pdf",
            ),
            ("profile_photo", "me.webp", "image/webp", layout.photos(), ".webp"),
            (
                "cv",
                "cv.docx",
                "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
                layout.cvs(),
                ".docx",
            ),
        ];

        for (field, original, content_type, dir, ext) in cases {
            let mut multipart = multipart_from(
                MultipartBuilder::new().file(field, original, content_type, b"payload"),
            )
            .await;
            let outcome = receive_upload(&mut multipart, &policy, AcceptFields::Any)
                .await
                .unwrap_or_else(|err| panic!("{field} upload failed: {err:?}"));

            let stored = outcome.file(field).expect("stored file");
            assert_eq!(stored.path.parent(), Some(dir.as_path()));
            assert!(matches_generated(&stored.file_name, field, ext), "{}", stored.file_name);
            assert_eq!(std::fs::read(&stored.path).expect("read"), b"payload");
            assert_eq!(dir_entries(&dir), vec![stored.file_name.clone()]);
        }
    }

    #[tokio::test]
    async fn disallowed_type_writes_nothing() {
        let (_temp, layout) = make_layout();
        let policy = UploadPolicy::standard(&layout, 1024, UnknownFieldMode::Reject);
        let cases = [
            ("logo", "application/pdf"),
            ("verification_doc", "image/gif"),
            ("profile_photo", "text/html"),
            ("cv", "image/png"),
        ];

        for (field, content_type) in cases {
            let mut multipart = multipart_from(
                MultipartBuilder::new().file(field, "x.bin", content_type, b"payload"),
            )
            .await;
            let result = receive_upload(&mut multipart, &policy, AcceptFields::Any).await;
            assert!(
                matches!(&result, Err(UploadError::InvalidFileType(name)) if name == field),
                "{field}: {result:?}"
            );
        }
        assert!(all_empty(&layout));
    }

    #[tokio::test]
    async fn unrecognized_field_never_stores() {
        let (_temp, layout) = make_layout();

        let policy = UploadPolicy::standard(&layout, 1024, UnknownFieldMode::Reject);
        let mut multipart = multipart_from(
            MultipartBuilder::new().file("avatar", "a.png", "image/png", b"img"),
        )
        .await;
        let result = receive_upload(&mut multipart, &policy, AcceptFields::Any).await;
        assert!(matches!(result, Err(UploadError::UnrecognizedField(_))));

        let policy = UploadPolicy::standard(&layout, 1024, UnknownFieldMode::Fallback);
        let mut multipart = multipart_from(
            MultipartBuilder::new().file("avatar", "a.png", "image/png", b"img"),
        )
        .await;
        let outcome = receive_upload(&mut multipart, &policy, AcceptFields::Any)
            .await
            .expect("fallback drops silently");
        assert!(outcome.files.is_empty());
        assert_eq!(outcome.rejected, vec!["avatar".to_string()]);
        assert!(all_empty(&layout));
    }

    #[tokio::test]
    async fn oversized_file_is_rejected_for_any_field() {
        let (_temp, layout) = make_layout();
        let policy = UploadPolicy::standard(&layout, 16, UnknownFieldMode::Reject);
        let payload = [7u8; 17];

        for (field, content_type) in [("logo", "image/png"), ("cv", "application/pdf")] {
            let mut multipart = multipart_from(
                MultipartBuilder::new().file(field, "big.bin", content_type, &payload),
            )
            .await;
            let result = receive_upload(&mut multipart, &policy, AcceptFields::Any).await;
            assert!(
                matches!(result, Err(UploadError::FileTooLarge { limit: 16, .. })),
                "{field}"
            );
        }
        assert!(all_empty(&layout));

        let mut multipart = multipart_from(
            MultipartBuilder::new().file("logo", "edge.png", "image/png", &payload[..16]),
        )
        .await;
        receive_upload(&mut multipart, &policy, AcceptFields::Any)
            .await
            .expect("file at the limit is accepted");
    }

    #[tokio::test]
    async fn one_bad_field_fails_the_whole_request() {
        let (_temp, layout) = make_layout();
        let policy = UploadPolicy::standard(&layout, 1024, UnknownFieldMode::Reject);
        let mut multipart = multipart_from(
            MultipartBuilder::new()
                .file("profile_photo", "me.png", "image/png", b"png")
                .file("cv", "cv.exe", "application/x-msdownload", b"exe"),
        )
        .await;

        let result = receive_upload(&mut multipart, &policy, AcceptFields::Only(PROFILE)).await;
        assert!(matches!(result, Err(UploadError::InvalidFileType(field)) if field == "cv"));
        assert!(all_empty(&layout), "staged photo must be discarded");
    }

    #[tokio::test]
    async fn route_limits_reject_extra_and_unlisted_fields() {
        let (_temp, layout) = make_layout();
        let policy = UploadPolicy::standard(&layout, 1024, UnknownFieldMode::Reject);

        let mut multipart = multipart_from(
            MultipartBuilder::new()
                .file("cv", "a.pdf", "application/pdf", b"a")
                .file("cv", "b.pdf", "application/pdf", b"b"),
        )
        .await;
        let result = receive_upload(&mut multipart, &policy, AcceptFields::Only(PROFILE)).await;
        assert!(matches!(result, Err(UploadError::UnexpectedField(field)) if field == "cv"));

        let mut multipart = multipart_from(
            MultipartBuilder::new().file("logo", "l.png", "image/png", b"l"),
        )
        .await;
        let result = receive_upload(&mut multipart, &policy, AcceptFields::Only(PROFILE)).await;
        assert!(matches!(result, Err(UploadError::UnexpectedField(field)) if field == "logo"));
        assert!(all_empty(&layout));
    }

    #[tokio::test]
    async fn text_fields_are_collected_and_discard_removes_files() {
        let (_temp, layout) = make_layout();
        let policy = UploadPolicy::standard(&layout, 1024, UnknownFieldMode::Reject);
        let mut multipart = multipart_from(
            MultipartBuilder::new()
                .text("headline", "Graduate engineer")
                .file("profile_photo", "me.png", "image/png", b"png"),
        )
        .await;

        let outcome = receive_upload(&mut multipart, &policy, AcceptFields::Only(PROFILE))
            .await
            .expect("upload");
        assert_eq!(
            outcome.fields.get("headline").map(String::as_str),
            Some("Graduate engineer")
        );
        assert_eq!(dir_entries(&layout.photos()).len(), 1);

        outcome.discard().await;
        assert!(all_empty(&layout));
    }

    #[tokio::test]
    async fn empty_file_inputs_are_skipped() {
        let (_temp, layout) = make_layout();
        let policy = UploadPolicy::standard(&layout, 1024, UnknownFieldMode::Reject);
        let mut multipart = multipart_from(
            MultipartBuilder::new()
                .text("bio", "Chemistry graduate")
                .file("cv", "", "application/octet-stream", b"")
                .file("cv", "", "application/octet-stream", b"")
                .file("cv", "resume.pdf", "application/pdf", b"%PDF")
                .file("profile_photo", "", "application/octet-stream", b""),
        )
        .await;

        let outcome = receive_upload(&mut multipart, &policy, AcceptFields::Only(PROFILE))
            .await
            .expect("empty inputs are ignored");
        assert_eq!(outcome.files.len(), 1);
        assert!(outcome.file("cv").is_some());
        assert!(outcome.file("profile_photo").is_none());
        assert!(outcome.rejected.is_empty());
        assert_eq!(outcome.fields.get("bio").map(String::as_str), Some("Chemistry graduate"));
        assert!(dir_entries(&layout.photos()).is_empty());
    }

    #[test]
    fn body_limit_covers_every_listed_file() {
        let limit = AcceptFields::Only(PROFILE).body_limit(5, 100);
        assert_eq!(limit, Some(110));
        assert_eq!(AcceptFields::Any.body_limit(5, 100), None);
    }
}

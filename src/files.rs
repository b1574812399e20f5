//! 受保护文档下载与上传目录的静态服务。

use axum::Router;
use axum::body::Body as AxumBody;
use axum::extract::{Extension, Path};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::middleware;
use axum::response::{IntoResponse, Response};
use httpdate::fmt_http_date;
use std::sync::Arc;
use tokio::fs::{self, File};
use tokio_util::io::ReaderStream;
use tower_http::services::ServeDir;
use tracing::info;

use crate::auth::{AuthUser, require_auth};
use crate::error::ApiError;
use crate::storage::{UploadLayout, resolve_within};
use crate::upload::{DOCUMENT_FIELD, UploadPolicy};

/// 认证后按文件名返回机构验证文件，路径必须位于文档目录内。
///
/// 只有推断出的 MIME 在验证文件白名单内时才内联展示，其余一律按附件下载。
pub async fn serve_document(
    Extension(layout): Extension<Arc<UploadLayout>>,
    Extension(policy): Extension<Arc<UploadPolicy>>,
    Extension(user): Extension<AuthUser>,
    Path(filename): Path<String>,
) -> Result<Response, ApiError> {
    let target = resolve_within(&layout.documents(), &filename).await?;
    let metadata = fs::metadata(&target)
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))?;
    let guessed = mime_guess::from_path(&target).first_or_octet_stream();
    let (mime, disposition) = if policy.allows(DOCUMENT_FIELD, guessed.essence_str()) {
        (guessed, "inline")
    } else {
        (mime_guess::mime::APPLICATION_OCTET_STREAM, "attachment")
    };
    let base_name = target
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(mime.essence_str())
            .map_err(|_| ApiError::Internal("invalid mime type".into()))?,
    );
    headers.insert(
        header::CONTENT_DISPOSITION,
        HeaderValue::from_str(&format!("{disposition}; filename=\"{base_name}\""))
            .unwrap_or_else(|_| HeaderValue::from_static("attachment")),
    );
    headers.insert(
        header::CONTENT_LENGTH,
        HeaderValue::from_str(&metadata.len().to_string())
            .map_err(|_| ApiError::Internal("invalid content length".into()))?,
    );
    if let Ok(modified) = metadata.modified()
        && let Ok(value) = HeaderValue::from_str(&fmt_http_date(modified))
    {
        headers.insert(header::LAST_MODIFIED, value);
    }

    let file = File::open(&target)
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))?;
    info!(
        user_id = user.id(),
        file = base_name,
        size = metadata.len(),
        "serve document"
    );
    Ok((
        StatusCode::OK,
        headers,
        AxumBody::from_stream(ReaderStream::new(file)),
    )
        .into_response())
}

/// 上传目录的静态挂载：机构 logo 公开，验证文件与学生文件需认证。
pub fn upload_mounts(layout: &UploadLayout) -> Router {
    let protected = Router::new()
        .nest_service("/uploads/institutes/documents", ServeDir::new(layout.documents()))
        .nest_service("/uploads/students", ServeDir::new(layout.students()))
        .route_layer(middleware::from_fn(require_auth));

    Router::new()
        .nest_service("/uploads/institutes/logos", ServeDir::new(layout.logos()))
        .merge(protected)
}

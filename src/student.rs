//! 学生端接口：认证后转交业务服务处理，资料更新负责文件上传。

use async_trait::async_trait;
use axum::Router;
use axum::extract::{DefaultBodyLimit, Extension, Json, Multipart, Path};
use axum::middleware;
use axum::response::Json as JsonResponse;
use axum::routing::{get, patch, post};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use crate::auth::{AuthUser, require_student};
use crate::config::UPLOAD_BODY_OVERHEAD;
use crate::error::ApiError;
use crate::storage::UploadLayout;
use crate::upload::{AcceptFields, FieldLimit, StoredFile, UploadPolicy, receive_upload};

pub const PROFILE_FIELDS: &[FieldLimit] = &[
    FieldLimit {
        name: "profile_photo",
        max_count: 1,
    },
    FieldLimit {
        name: "cv",
        max_count: 1,
    },
];

/// 资料更新中已保存的文件。
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileFile {
    pub file_name: String,
    #[serde(skip)]
    pub path: PathBuf,
    pub url: Option<String>,
    pub size: u64,
    pub content_type: Option<String>,
    pub original_name: Option<String>,
}

impl ProfileFile {
    fn from_stored(layout: &UploadLayout, stored: &StoredFile) -> Self {
        Self {
            file_name: stored.file_name.clone(),
            path: stored.path.clone(),
            url: layout.public_url(&stored.path),
            size: stored.size,
            content_type: stored.content_type.clone(),
            original_name: stored.original_name.clone(),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct ProfileUpdate {
    pub fields: HashMap<String, String>,
    pub profile_photo: Option<ProfileFile>,
    pub cv: Option<ProfileFile>,
}

/// 学生业务逻辑（证书、档案、链上校验）由外部服务实现。
#[async_trait]
pub trait StudentService: Send + Sync {
    async fn dashboard(&self, student: &AuthUser) -> Result<Value, ApiError>;
    async fn certificates(&self, student: &AuthUser) -> Result<Value, ApiError>;
    async fn certificate_details(
        &self,
        student: &AuthUser,
        certificate_id: &str,
    ) -> Result<Value, ApiError>;
    async fn verify_certificate(
        &self,
        student: &AuthUser,
        certificate_id: &str,
    ) -> Result<Value, ApiError>;
    async fn career_insights(&self, student: &AuthUser, request: Value) -> Result<Value, ApiError>;
    async fn update_portfolio_visibility(
        &self,
        student: &AuthUser,
        request: Value,
    ) -> Result<Value, ApiError>;
    async fn update_profile(
        &self,
        student: &AuthUser,
        update: ProfileUpdate,
    ) -> Result<Value, ApiError>;
    async fn is_available(&self) -> bool;
}

/// 未接入业务服务时的占位实现，所有请求返回 503。
pub struct DetachedStudentService;

impl DetachedStudentService {
    fn unavailable() -> ApiError {
        ApiError::ServiceUnavailable("Student service unavailable".into())
    }
}

#[async_trait]
impl StudentService for DetachedStudentService {
    async fn dashboard(&self, _student: &AuthUser) -> Result<Value, ApiError> {
        Err(Self::unavailable())
    }

    async fn certificates(&self, _student: &AuthUser) -> Result<Value, ApiError> {
        Err(Self::unavailable())
    }

    async fn certificate_details(
        &self,
        _student: &AuthUser,
        _certificate_id: &str,
    ) -> Result<Value, ApiError> {
        Err(Self::unavailable())
    }

    async fn verify_certificate(
        &self,
        _student: &AuthUser,
        _certificate_id: &str,
    ) -> Result<Value, ApiError> {
        Err(Self::unavailable())
    }

    async fn career_insights(&self, _student: &AuthUser, _request: Value) -> Result<Value, ApiError> {
        Err(Self::unavailable())
    }

    async fn update_portfolio_visibility(
        &self,
        _student: &AuthUser,
        _request: Value,
    ) -> Result<Value, ApiError> {
        Err(Self::unavailable())
    }

    async fn update_profile(
        &self,
        _student: &AuthUser,
        _update: ProfileUpdate,
    ) -> Result<Value, ApiError> {
        Err(Self::unavailable())
    }

    async fn is_available(&self) -> bool {
        false
    }
}

pub type SharedStudentService = Arc<dyn StudentService>;

pub async fn dashboard(
    Extension(service): Extension<SharedStudentService>,
    Extension(student): Extension<AuthUser>,
) -> Result<JsonResponse<Value>, ApiError> {
    service.dashboard(&student).await.map(JsonResponse)
}

pub async fn certificates(
    Extension(service): Extension<SharedStudentService>,
    Extension(student): Extension<AuthUser>,
) -> Result<JsonResponse<Value>, ApiError> {
    service.certificates(&student).await.map(JsonResponse)
}

pub async fn certificate_details(
    Extension(service): Extension<SharedStudentService>,
    Extension(student): Extension<AuthUser>,
    Path(certificate_id): Path<String>,
) -> Result<JsonResponse<Value>, ApiError> {
    service
        .certificate_details(&student, &certificate_id)
        .await
        .map(JsonResponse)
}

pub async fn verify_certificate(
    Extension(service): Extension<SharedStudentService>,
    Extension(student): Extension<AuthUser>,
    Path(certificate_id): Path<String>,
) -> Result<JsonResponse<Value>, ApiError> {
    service
        .verify_certificate(&student, &certificate_id)
        .await
        .map(JsonResponse)
}

pub async fn career_insights(
    Extension(service): Extension<SharedStudentService>,
    Extension(student): Extension<AuthUser>,
    Json(request): Json<Value>,
) -> Result<JsonResponse<Value>, ApiError> {
    service
        .career_insights(&student, request)
        .await
        .map(JsonResponse)
}

pub async fn portfolio_visibility(
    Extension(service): Extension<SharedStudentService>,
    Extension(student): Extension<AuthUser>,
    Json(request): Json<Value>,
) -> Result<JsonResponse<Value>, ApiError> {
    service
        .update_portfolio_visibility(&student, request)
        .await
        .map(JsonResponse)
}

/// 更新资料：先完整接收照片与简历，业务失败时删除已保存文件。
pub async fn update_profile(
    Extension(service): Extension<SharedStudentService>,
    Extension(policy): Extension<Arc<UploadPolicy>>,
    Extension(layout): Extension<Arc<UploadLayout>>,
    Extension(student): Extension<AuthUser>,
    mut multipart: Multipart,
) -> Result<JsonResponse<Value>, ApiError> {
    let outcome =
        receive_upload(&mut multipart, &policy, AcceptFields::Only(PROFILE_FIELDS)).await?;
    let update = ProfileUpdate {
        fields: outcome.fields.clone(),
        profile_photo: outcome
            .file("profile_photo")
            .map(|file| ProfileFile::from_stored(&layout, file)),
        cv: outcome
            .file("cv")
            .map(|file| ProfileFile::from_stored(&layout, file)),
    };
    info!(
        user_id = student.id(),
        photo = update.profile_photo.is_some(),
        cv = update.cv.is_some(),
        rejected = ?outcome.rejected,
        "profile update"
    );

    match service.update_profile(&student, update).await {
        Ok(value) => Ok(JsonResponse(value)),
        Err(err) => {
            outcome.discard().await;
            Err(err)
        }
    }
}

/// `/api/student` 下的全部路由，统一经过学生认证。
pub fn routes(max_file_size: u64) -> Router {
    let profile_limit = AcceptFields::Only(PROFILE_FIELDS)
        .body_limit(max_file_size, UPLOAD_BODY_OVERHEAD)
        .map(DefaultBodyLimit::max)
        .unwrap_or_else(DefaultBodyLimit::disable);

    Router::new()
        .route("/dashboard", get(dashboard))
        .route("/certificates", get(certificates))
        .route("/certificates/{certificate_id}", get(certificate_details))
        .route(
            "/certificates/{certificate_id}/verify",
            get(verify_certificate),
        )
        .route("/career-insights", post(career_insights))
        .route("/portfolio/visibility", patch(portfolio_visibility))
        .route("/profile", patch(update_profile).layer(profile_limit))
        .route_layer(middleware::from_fn(require_student))
}

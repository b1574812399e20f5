//! Bearer 令牌校验与路由认证中间件。

use axum::body::Body as AxumBody;
use axum::extract::{Extension, Json};
use axum::http::Request;
use axum::middleware;
use axum::response::Response;
use axum_extra::extract::{CookieJar, TypedHeader};
use axum_extra::headers::{Authorization, authorization::Bearer};
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::TOKEN_COOKIE_NAME;
use crate::error::ApiError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Student,
    University,
    Admin,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: i64,
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub exp: usize,
}

/// 已认证的调用方，由认证中间件写入请求扩展。
#[derive(Clone, Debug)]
pub struct AuthUser(pub Claims);

impl AuthUser {
    pub fn id(&self) -> i64 {
        self.0.sub
    }

    pub fn role(&self) -> Role {
        self.0.role
    }
}

pub struct AuthConfig {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl AuthConfig {
    pub fn new(secret: &str) -> Self {
        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }

    pub fn verify(&self, token: &str) -> Result<AuthUser, ApiError> {
        decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map(|data| AuthUser(data.claims))
            .map_err(|err| {
                debug!(error = %err, "token rejected");
                ApiError::Unauthorized("Invalid or expired token".into())
            })
    }
}

fn authenticate(
    auth: &AuthConfig,
    jar: &CookieJar,
    bearer: Option<TypedHeader<Authorization<Bearer>>>,
) -> Result<AuthUser, ApiError> {
    if let Some(TypedHeader(Authorization(bearer))) = bearer {
        return auth.verify(bearer.token());
    }
    if let Some(cookie) = jar.get(TOKEN_COOKIE_NAME) {
        return auth.verify(cookie.value());
    }
    Err(ApiError::Unauthorized("Authentication required".into()))
}

/// 任意已认证身份均可通过。
pub async fn require_auth(
    Extension(auth): Extension<Arc<AuthConfig>>,
    jar: CookieJar,
    bearer: Option<TypedHeader<Authorization<Bearer>>>,
    mut req: Request<AxumBody>,
    next: middleware::Next,
) -> Result<Response, ApiError> {
    let user = authenticate(&auth, &jar, bearer)?;
    req.extensions_mut().insert(user);
    Ok(next.run(req).await)
}

/// 仅允许学生身份。
pub async fn require_student(
    Extension(auth): Extension<Arc<AuthConfig>>,
    jar: CookieJar,
    bearer: Option<TypedHeader<Authorization<Bearer>>>,
    mut req: Request<AxumBody>,
    next: middleware::Next,
) -> Result<Response, ApiError> {
    let user = authenticate(&auth, &jar, bearer)?;
    if user.role() != Role::Student {
        warn!(user_id = user.id(), role = ?user.role(), "student route denied");
        return Err(ApiError::Forbidden("Student access required".into()));
    }
    req.extensions_mut().insert(user);
    Ok(next.run(req).await)
}

#[derive(Serialize)]
pub struct Principal {
    id: i64,
    role: Role,
    #[serde(skip_serializing_if = "Option::is_none")]
    email: Option<String>,
}

/// 返回当前认证身份。
pub async fn current_principal(Extension(user): Extension<AuthUser>) -> Json<Principal> {
    let AuthUser(claims) = user;
    Json(Principal {
        id: claims.sub,
        role: claims.role,
        email: claims.email,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{TEST_SECRET, token_for};
    use axum::Router;
    use axum::http::{StatusCode, header};
    use axum::routing::get;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn gated_app() -> Router {
        let auth = Arc::new(AuthConfig::new(TEST_SECRET));
        let any = Router::new()
            .route("/me", get(current_principal))
            .route_layer(middleware::from_fn(require_auth));
        let students = Router::new()
            .route("/student/me", get(current_principal))
            .route_layer(middleware::from_fn(require_student));
        any.merge(students).layer(Extension(auth))
    }

    async fn call(app: Router, path: &str, authorization: Option<String>) -> (StatusCode, String) {
        let mut builder = Request::builder().uri(path);
        if let Some(value) = authorization {
            builder = builder.header(header::AUTHORIZATION, value);
        }
        let response = app
            .oneshot(builder.body(AxumBody::empty()).expect("request"))
            .await
            .expect("response");
        let status = response.status();
        let body = response
            .into_body()
            .collect()
            .await
            .expect("body")
            .to_bytes();
        (status, String::from_utf8_lossy(&body).to_string())
    }

    #[test]
    fn verify_accepts_valid_token() {
        let auth = AuthConfig::new(TEST_SECRET);
        let token = token_for(7, Role::University, TEST_SECRET, 3600);
        let user = auth.verify(&token).expect("valid token");
        assert_eq!(user.id(), 7);
        assert_eq!(user.role(), Role::University);
    }

    #[test]
    fn verify_rejects_wrong_secret_and_expired() {
        let auth = AuthConfig::new(TEST_SECRET);
        let forged = token_for(7, Role::Admin, "other-secret", 3600);
        assert!(matches!(auth.verify(&forged), Err(ApiError::Unauthorized(_))));
        let expired = token_for(7, Role::Admin, TEST_SECRET, -3600);
        assert!(matches!(auth.verify(&expired), Err(ApiError::Unauthorized(_))));
    }

    #[tokio::test]
    async fn generic_gate_requires_a_token() {
        let (status, body) = call(gated_app(), "/me", None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(body.contains("Authentication required"));

        let token = token_for(3, Role::Admin, TEST_SECRET, 3600);
        let (status, body) = call(gated_app(), "/me", Some(format!("Bearer {token}"))).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("\"role\":\"admin\""));
    }

    #[tokio::test]
    async fn student_gate_checks_role() {
        let token = token_for(3, Role::University, TEST_SECRET, 3600);
        let (status, _) = call(gated_app(), "/student/me", Some(format!("Bearer {token}"))).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let token = token_for(4, Role::Student, TEST_SECRET, 3600);
        let (status, body) =
            call(gated_app(), "/student/me", Some(format!("Bearer {token}"))).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("\"id\":4"));
    }

    #[tokio::test]
    async fn token_cookie_is_accepted() {
        let token = token_for(5, Role::Student, TEST_SECRET, 3600);
        let response = gated_app()
            .oneshot(
                Request::builder()
                    .uri("/me")
                    .header(header::COOKIE, format!("{TOKEN_COOKIE_NAME}={token}"))
                    .body(AxumBody::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
    }
}

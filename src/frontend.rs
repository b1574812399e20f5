//! 前端页面与公共目录静态资源，未匹配的路由返回 JSON 404。

use axum::Router;
use axum::extract::Request;
use axum::handler::HandlerWithoutStateExt;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use percent_encoding::percent_decode_str;
use std::path::Path;
use tower::ServiceExt;
use tower_http::services::{ServeDir, ServeFile};
use tracing::warn;

use crate::error::ApiError;

/// 页面路由与公共目录下 HTML 文件的对应关系。
const PAGES: &[(&str, &str)] = &[
    ("/", "index.html"),
    ("/student/register", "student/register.html"),
    ("/student/login", "student/login.html"),
    ("/student/dashboard", "student/dashboard.html"),
    ("/university/register", "university/register.html"),
    ("/university/login", "university/login.html"),
    ("/university/dashboard", "university/dashboard.html"),
    ("/admin/login", "admin/login.html"),
    ("/admin/dashboard", "admin/dashboard.html"),
    ("/verify", "verify.html"),
];

/// 上传文件只经 `files::upload_mounts` 提供，公共目录兜底不得解析到该目录。
const UPLOADS_SEGMENT: &str = "uploads";

pub async fn route_not_found() -> ApiError {
    ApiError::RouteNotFound
}

/// 按 `ServeDir` 的方式解码并折叠路径，判断首段是否为上传目录。
fn targets_uploads(path: &str) -> bool {
    let decoded = percent_decode_str(path).decode_utf8_lossy();
    let mut segments: Vec<&str> = Vec::new();
    for segment in decoded.split(['/', '\\']) {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    segments
        .first()
        .is_some_and(|first| first.eq_ignore_ascii_case(UPLOADS_SEGMENT))
}

async fn serve_page(page: ServeFile, request: Request) -> Response {
    let response = match page.oneshot(request).await {
        Ok(response) => response,
        Err(err) => match err {},
    };
    if response.status() == StatusCode::NOT_FOUND {
        return ApiError::RouteNotFound.into_response();
    }
    response.into_response()
}

/// 页面路由，以及兜底的公共目录静态服务。
pub fn routes(public_root: &Path) -> Router {
    let mut router = Router::new();
    for (route, file) in PAGES {
        let page = ServeFile::new(public_root.join(file));
        router = router.route(
            route,
            get(move |request: Request| serve_page(page.clone(), request)),
        );
    }

    let assets = ServeDir::new(public_root)
        .append_index_html_on_directories(false)
        .call_fallback_on_method_not_allowed(true)
        .not_found_service(route_not_found.into_service());
    router.fallback(move |request: Request| {
        let assets = assets.clone();
        async move {
            if targets_uploads(request.uri().path()) {
                warn!(path = request.uri().path(), "upload path outside upload mounts");
                return ApiError::RouteNotFound.into_response();
            }
            match assets.oneshot(request).await {
                Ok(response) => response.into_response(),
                Err(err) => match err {},
            }
        }
    })
}

//! 健康检查与版本信息。

use axum::extract::Extension;
use axum::response::Json as JsonResponse;
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use std::sync::Arc;

use crate::student::SharedStudentService;

/// 健康检查上报的链上合约信息。
#[derive(Clone, Debug, Default)]
pub struct ChainInfo {
    pub contract_address: Option<String>,
}

#[derive(Serialize)]
pub struct HealthReport {
    status: &'static str,
    timestamp: String,
    database: &'static str,
    blockchain: Option<String>,
}

pub async fn health(
    Extension(chain): Extension<Arc<ChainInfo>>,
    Extension(service): Extension<SharedStudentService>,
) -> JsonResponse<HealthReport> {
    let database = if service.is_available().await {
        "Connected"
    } else {
        "Unavailable"
    };
    JsonResponse(HealthReport {
        status: "OK",
        timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        database,
        blockchain: chain.contract_address.clone(),
    })
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionInfo {
    version: &'static str,
    build_time: &'static str,
    build_env: String,
}

/// 返回当前版本信息。
pub async fn version() -> JsonResponse<VersionInfo> {
    JsonResponse(VersionInfo {
        version: crate::build::PKG_VERSION,
        build_time: crate::build::BUILD_TIME,
        build_env: format!(
            "{},{}",
            crate::build::RUST_VERSION,
            crate::build::RUST_CHANNEL
        ),
    })
}

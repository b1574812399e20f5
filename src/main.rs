//! Certificate portal server binary.
//!
//! This crate wires together bearer-token gates, form upload handling,
//! protected document delivery, the student API surface, and the static
//! frontend pages. The main entry point prepares the upload directories,
//! builds the Axum router, and starts the HTTP listener.

mod atomic;
mod auth;
mod background;
mod config;
mod error;
mod files;
mod frontend;
mod health;
mod http;
mod logging;
mod storage;
mod student;
mod upload;

#[cfg(test)]
mod test_support;

use axum::extract::{Extension, connect_info::ConnectInfo};
use axum::http::Request;
use axum::routing::get;
use axum::{Router, middleware};
use axum_server::Handle;
use clap::Parser;
use shadow_rs::shadow;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, debug, info, info_span};

use crate::auth::AuthConfig;
use crate::background::{spawn_background_tasks, sweep_staging_files};
use crate::config::Args;
use crate::health::ChainInfo;
use crate::http::{build_cors_layer, resolve_client_ip};
use crate::storage::UploadLayout;
use crate::student::{DetachedStudentService, SharedStudentService};
use crate::upload::UploadPolicy;

shadow!(build);

/// Shared components handed to every request through extensions.
#[derive(Clone)]
struct AppParts {
    layout: Arc<UploadLayout>,
    policy: Arc<UploadPolicy>,
    auth: Arc<AuthConfig>,
    chain: Arc<ChainInfo>,
    students: SharedStudentService,
}

fn build_app(parts: AppParts) -> Router {
    let authenticated = Router::new()
        .route("/api/files/{filename}", get(files::serve_document))
        .route("/api/auth/me", get(auth::current_principal))
        .route_layer(middleware::from_fn(auth::require_auth));

    Router::new()
        .route("/api/health", get(health::health))
        .route("/api/version", get(health::version))
        .merge(authenticated)
        .nest("/api/student", student::routes(parts.policy.max_file_size()))
        .merge(files::upload_mounts(&parts.layout))
        .merge(frontend::routes(parts.layout.public_root()))
        .layer(middleware::from_fn(http::add_security_headers))
        .layer(CatchPanicLayer::custom(error::panic_response))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &Request<_>| {
                    let connect_ip = request
                        .extensions()
                        .get::<ConnectInfo<SocketAddr>>()
                        .map(|ConnectInfo(addr)| addr.ip());
                    let client_ip = resolve_client_ip(request.headers(), connect_ip)
                        .map(|ip| ip.to_string())
                        .unwrap_or_else(|| "unknown".to_string());

                    info_span!(
                        env!("CARGO_CRATE_NAME"),
                        client_ip,
                        method = ?request.method(),
                        path = ?request.uri().path(),
                    )
                })
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
        )
        .layer(Extension(parts.layout))
        .layer(Extension(parts.policy))
        .layer(Extension(parts.auth))
        .layer(Extension(parts.chain))
        .layer(Extension(parts.students))
}

/// Starts the server and blocks until shutdown.
#[tokio::main]
async fn main() -> Result<(), std::io::Error> {
    let dotenv = dotenvy::dotenv();
    logging::init_logging();
    match dotenv {
        Ok(path) => info!(path = ?path, "loaded environment file"),
        Err(err) => debug!(error = %err, "no environment file loaded"),
    }

    let args = Args::parse();
    let layout = Arc::new(UploadLayout::new(PathBuf::from(&args.public_dir)));
    layout.ensure_dirs().await?;
    info!(public_dir = args.public_dir, "upload directories ready");

    let staging_ttl = Duration::from_secs(args.upload_staging_ttl_secs);
    if !staging_ttl.is_zero() {
        let removed = sweep_staging_files(&layout, staging_ttl).await;
        if removed > 0 {
            info!(removed, "removed stale staging files");
        }
    }

    let policy = Arc::new(UploadPolicy::standard(
        &layout,
        args.upload_max_file_size,
        args.upload_unknown_field,
    ));
    let parts = AppParts {
        layout: layout.clone(),
        policy,
        auth: Arc::new(AuthConfig::new(&args.jwt_secret)),
        chain: Arc::new(ChainInfo {
            contract_address: args.contract_address.clone(),
        }),
        students: Arc::new(DetachedStudentService),
    };

    let mut app = build_app(parts);
    if let Some(cors_layer) = build_cors_layer(&args.cors_origins) {
        app = app.layer(cors_layer);
    }

    let host = args
        .host
        .parse::<IpAddr>()
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err.to_string()))?;
    let addr = SocketAddr::new(host, args.port);
    let handle = Handle::new();

    info!("🎓 Starting certificate portal at http://{}", addr);
    info!(
        contract = args.contract_address.as_deref().unwrap_or("unset"),
        "blockchain registry"
    );
    info!(
        "Student portal: /student/login, University portal: /university/login, Admin panel: /admin/login, Public verify: /verify, Health: /api/health"
    );

    spawn_background_tasks(layout, staging_ttl);
    tokio::spawn(shutdown_signal(handle.clone()));
    axum_server::bind(addr)
        .handle(handle)
        .serve(app.into_make_service_with_connect_info::<SocketAddr>())
        .await
}

async fn shutdown_signal(handle: Handle) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Received termination signal shutting down");
    handle.graceful_shutdown(Some(Duration::from_secs(10)));
}

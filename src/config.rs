//! CLI arguments and server configuration defaults.

use clap::{Parser, ValueEnum};
use shadow_rs::formatcp;

use crate::build;

const VERSION_INFO: &str = formatcp!(
    r#"{}\ncommit_hash: {}\nbuild_time: {}\nbuild_env: {},{}"#,
    build::PKG_VERSION,
    build::SHORT_COMMIT,
    build::BUILD_TIME,
    build::RUST_VERSION,
    build::RUST_CHANNEL
);

pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_PUBLIC_DIR: &str = "public";
pub const DEFAULT_UPLOAD_MAX_FILE_SIZE: u64 = 5 * 1024 * 1024;
pub const DEFAULT_UPLOAD_STAGING_TTL_SECS: u64 = 60 * 60;
pub const STAGING_SWEEP_INTERVAL_SECS: u64 = 900;
pub const TOKEN_COOKIE_NAME: &str = "token";
/// Extra room for multipart framing and text fields on upload routes.
pub const UPLOAD_BODY_OVERHEAD: usize = 1024 * 1024;

/// What to do with an uploaded file whose field name has no policy entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum UnknownFieldMode {
    /// Refuse the request and log the field name.
    Reject,
    /// Route the file to the logo directory; the empty allow-list still drops it.
    Fallback,
}

/// CLI arguments and environment configuration for the server.
#[derive(Parser, Debug)]
#[command(
    name = "certportal-server",
    version = VERSION_INFO,
    about = "Certificate portal backend"
)]
pub struct Args {
    #[arg(
        short = 'b',
        long,
        env = "HOST",
        default_value = "0.0.0.0",
        help = "Bind address"
    )]
    pub host: String,
    #[arg(
        short = 'p',
        long,
        env = "PORT",
        default_value_t = DEFAULT_PORT,
        help = "HTTP port"
    )]
    pub port: u16,
    #[arg(
        short = 'd',
        long,
        env = "PUBLIC_DIR",
        default_value = DEFAULT_PUBLIC_DIR,
        help = "Public directory holding frontend pages and uploads"
    )]
    pub public_dir: String,
    #[arg(
        long,
        env = "CONTRACT_ADDRESS",
        help = "Certificate registry contract address"
    )]
    pub contract_address: Option<String>,
    #[arg(
        long,
        env = "JWT_SECRET",
        hide_env_values = true,
        help = "HS256 secret for bearer tokens"
    )]
    pub jwt_secret: String,
    #[arg(
        long,
        env = "CORS_ORIGINS",
        default_value = "*",
        help = "Comma separated CORS origins, * for any"
    )]
    pub cors_origins: String,
    #[arg(
        long,
        env = "UPLOAD_MAX_FILE_SIZE",
        default_value_t = DEFAULT_UPLOAD_MAX_FILE_SIZE,
        help = "Max size of a single uploaded file in bytes"
    )]
    pub upload_max_file_size: u64,
    #[arg(
        long,
        env = "UPLOAD_UNKNOWN_FIELD",
        value_enum,
        default_value_t = UnknownFieldMode::Reject,
        help = "Handling of upload fields without a policy entry"
    )]
    pub upload_unknown_field: UnknownFieldMode,
    #[arg(
        long,
        env = "UPLOAD_STAGING_TTL_SECS",
        default_value_t = DEFAULT_UPLOAD_STAGING_TTL_SECS,
        help = "Age in seconds after which orphaned staging files are removed (0 to disable)"
    )]
    pub upload_staging_ttl_secs: u64,
}

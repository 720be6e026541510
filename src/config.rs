//! CLI 参数、环境变量与默认配置。

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

pub const DEFAULT_REDIRECT_URL: &str = "http://localhost:8080/callback";
pub const DEFAULT_TOKEN_PATH: &str = "token.json";
pub const DEFAULT_OAUTH_STATE: &str = "state-token";
pub const GOOGLE_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/auth";
pub const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
pub const DRIVE_FILE_SCOPE: &str = "https://www.googleapis.com/auth/drive.file";
pub const DRIVE_API_BASE: &str = "https://www.googleapis.com/drive/v3";
pub const DRIVE_UPLOAD_BASE: &str = "https://www.googleapis.com/upload/drive/v3";
pub const DEFAULT_JPEG_QUALITY: u8 = 90;
pub const DEFAULT_UPLOAD_MAX_CONCURRENT: u64 = 8;
pub const DEFAULT_UPLOAD_MAX_SIZE: usize = 512 * 1024 * 1024;
pub const DEFAULT_REMOTE_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_REMOTE_MAX_ATTEMPTS: u32 = 3;
pub const MAX_REMOTE_ATTEMPTS: i64 = 10;
pub const REMOTE_BACKOFF_BASE_MS: u64 = 200;
pub const TOKEN_EXPIRY_SKEW_SECS: i64 = 10;

/// 上传前是否对图片重新编码。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum ImagePolicy {
    /// 仅对内容识别为图片的文件重新压缩为 JPEG，其余原样上传。
    #[default]
    Compress,
    /// 所有文件原样上传。
    Passthrough,
}

/// CLI arguments and environment configuration for the relay.
#[derive(Parser, Debug)]
#[command(name = "drive-relay", version = VERSION_INFO, about = "Google Drive upload relay")]
pub struct Args {
    #[arg(long, env = "GOOGLE_CLIENT_ID", help = "OAuth client id")]
    pub client_id: String,
    #[arg(
        long,
        env = "GOOGLE_CLIENT_SECRET",
        hide_env_values = true,
        help = "OAuth client secret"
    )]
    pub client_secret: String,
    #[arg(
        short = 'b',
        long,
        env = "DRIVE_RELAY_BIND",
        default_value = "0.0.0.0",
        help = "Bind address"
    )]
    pub host: String,
    #[arg(
        short = 'p',
        long,
        env = "DRIVE_RELAY_PORT",
        default_value_t = 8080,
        help = "HTTP port"
    )]
    pub port: u16,
    #[arg(
        long,
        env = "DRIVE_RELAY_REDIRECT_URL",
        default_value = DEFAULT_REDIRECT_URL,
        help = "OAuth redirect url registered with the provider"
    )]
    pub redirect_url: String,
    #[arg(
        short = 't',
        long,
        env = "DRIVE_RELAY_TOKEN_PATH",
        default_value = DEFAULT_TOKEN_PATH,
        help = "Path of the cached OAuth token"
    )]
    pub token_path: String,
    #[arg(
        long,
        env = "DRIVE_RELAY_OAUTH_STATE",
        default_value = DEFAULT_OAUTH_STATE,
        help = "State value sent with the consent url"
    )]
    pub oauth_state: String,
    #[arg(
        long,
        env = "GOOGLE_AUTH_URL",
        default_value = GOOGLE_AUTH_URL,
        help = "OAuth authorization endpoint"
    )]
    pub auth_url: String,
    #[arg(
        long,
        env = "GOOGLE_TOKEN_URL",
        default_value = GOOGLE_TOKEN_URL,
        help = "OAuth token endpoint"
    )]
    pub token_url: String,
    #[arg(
        long,
        env = "GOOGLE_DRIVE_API_BASE",
        default_value = DRIVE_API_BASE,
        help = "Drive metadata API base url"
    )]
    pub drive_api_base: String,
    #[arg(
        long,
        env = "GOOGLE_DRIVE_UPLOAD_BASE",
        default_value = DRIVE_UPLOAD_BASE,
        help = "Drive media upload API base url"
    )]
    pub drive_upload_base: String,
    #[arg(
        long,
        env = "DRIVE_RELAY_IMAGE_POLICY",
        value_enum,
        default_value_t = ImagePolicy::Compress,
        help = "Whether images are re-encoded before upload"
    )]
    pub image_policy: ImagePolicy,
    #[arg(
        long,
        env = "DRIVE_RELAY_JPEG_QUALITY",
        default_value_t = DEFAULT_JPEG_QUALITY,
        value_parser = clap::value_parser!(u8).range(1..=100),
        help = "JPEG quality used when re-encoding images"
    )]
    pub jpeg_quality: u8,
    #[arg(
        long,
        env = "DRIVE_RELAY_UPLOAD_MAX_CONCURRENT",
        default_value_t = DEFAULT_UPLOAD_MAX_CONCURRENT,
        value_parser = clap::value_parser!(u64).range(1..),
        help = "Max files uploaded concurrently across all requests"
    )]
    pub upload_max_concurrent: u64,
    #[arg(
        long,
        env = "DRIVE_RELAY_UPLOAD_MAX_SIZE",
        default_value_t = DEFAULT_UPLOAD_MAX_SIZE,
        help = "Max upload request body in bytes"
    )]
    pub upload_max_size: usize,
    #[arg(
        long,
        env = "DRIVE_RELAY_REMOTE_TIMEOUT_SECS",
        default_value_t = DEFAULT_REMOTE_TIMEOUT_SECS,
        help = "Deadline for each remote API call in seconds"
    )]
    pub remote_timeout_secs: u64,
    #[arg(
        long,
        env = "DRIVE_RELAY_REMOTE_MAX_ATTEMPTS",
        default_value_t = DEFAULT_REMOTE_MAX_ATTEMPTS,
        value_parser = clap::value_parser!(u32).range(1..=MAX_REMOTE_ATTEMPTS),
        help = "Attempts per remote call for transient failures"
    )]
    pub remote_max_attempts: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_client_credentials_is_rejected() {
        let result = Args::try_parse_from(["drive-relay", "--client-id", "id"]);
        assert!(result.is_err());
    }

    #[test]
    fn defaults_are_applied() {
        let args = Args::try_parse_from([
            "drive-relay",
            "--client-id",
            "id",
            "--client-secret",
            "secret",
        ])
        .expect("parse args");
        assert_eq!(args.port, 8080);
        assert_eq!(args.jpeg_quality, DEFAULT_JPEG_QUALITY);
        assert_eq!(args.image_policy, ImagePolicy::Compress);
        assert_eq!(args.token_path, DEFAULT_TOKEN_PATH);
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let result = Args::try_parse_from([
            "drive-relay",
            "--client-id",
            "id",
            "--client-secret",
            "secret",
            "--upload-max-concurrent",
            "0",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn remote_attempts_are_bounded() {
        let parse = |attempts: &str| {
            Args::try_parse_from([
                "drive-relay",
                "--client-id",
                "id",
                "--client-secret",
                "secret",
                "--remote-max-attempts",
                attempts,
            ])
        };
        assert_eq!(parse("10").expect("upper bound").remote_max_attempts, 10);
        assert!(parse("11").is_err());
        assert!(parse("0").is_err());
    }
}

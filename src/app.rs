//! 应用上下文与路由装配。

use axum::extract::{DefaultBodyLimit, Extension};
use axum::http::Request;
use axum::routing::{get, post};
use axum::{Router, middleware};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, info_span};

use crate::config::{Args, DRIVE_FILE_SCOPE, REMOTE_BACKOFF_BASE_MS};
use crate::drive::DriveSettings;
use crate::normalize::ImageNormalizer;
use crate::oauth::{Authorizer, OAuthConfig, OAuthError};
use crate::token_store::TokenStore;
use crate::upload::UploadConfig;
use crate::{auth, folders, http, pages, upload};

/// Shared services built once at startup and handed to every handler.
#[derive(Clone)]
pub struct AppContext {
    pub authorizer: Arc<Authorizer>,
    pub store: Arc<TokenStore>,
    pub drive: Arc<DriveSettings>,
    pub upload: Arc<UploadConfig>,
}

impl AppContext {
    /// 由命令行参数构建全部共享服务。
    pub fn from_args(args: &Args) -> Result<Self, OAuthError> {
        let timeout = Duration::from_secs(args.remote_timeout_secs);
        let authorizer = Authorizer::new(
            OAuthConfig {
                client_id: args.client_id.clone(),
                client_secret: args.client_secret.clone(),
                redirect_url: args.redirect_url.clone(),
                auth_url: args.auth_url.clone(),
                token_url: args.token_url.clone(),
                scopes: vec![DRIVE_FILE_SCOPE.to_string()],
                state: args.oauth_state.clone(),
            },
            timeout,
        )?;
        Ok(Self {
            authorizer: Arc::new(authorizer),
            store: Arc::new(TokenStore::new(PathBuf::from(&args.token_path))),
            drive: Arc::new(DriveSettings {
                api_base: args.drive_api_base.clone(),
                upload_base: args.drive_upload_base.clone(),
                timeout,
                max_attempts: args.remote_max_attempts,
                backoff_base: Duration::from_millis(REMOTE_BACKOFF_BASE_MS),
            }),
            upload: Arc::new(UploadConfig::new(
                ImageNormalizer::new(args.image_policy, args.jpeg_quality),
                args.upload_max_concurrent as usize,
                args.upload_max_size,
            )),
        })
    }
}

/// 装配路由、中间件与共享状态。
pub fn build_router(ctx: AppContext) -> Router {
    Router::new()
        .route("/", get(pages::index))
        .route("/callback", get(auth::oauth_callback))
        .route("/create_folder", post(folders::create_folder))
        .route(
            "/upload_file",
            post(upload::upload_files).layer(DefaultBodyLimit::max(ctx.upload.max_body_size)),
        )
        .layer(middleware::from_fn(http::add_security_headers))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &Request<_>| {
                    info_span!(
                        env!("CARGO_CRATE_NAME"),
                        client_ip = %http::client_ip(request),
                        method = ?request.method(),
                        path = ?request.uri().path(),
                    )
                })
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(Extension(ctx.authorizer))
        .layer(Extension(ctx.store))
        .layer(Extension(ctx.drive))
        .layer(Extension(ctx.upload))
}

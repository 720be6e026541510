//! drive-relay 服务入口。
//!
//! 组装 OAuth 授权、令牌存储、图片规范化与 Google Drive 客户端，
//! 构建 Axum 路由并启动 HTTP 监听。

mod app;
mod atomic;
mod auth;
mod config;
mod drive;
mod error;
mod folders;
mod http;
mod logging;
mod normalize;
mod oauth;
mod pages;
mod token_store;
mod upload;

use axum_server::Handle;
use clap::Parser;
use shadow_rs::shadow;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::signal;
use tracing::info;

use crate::app::{AppContext, build_router};
use crate::config::Args;

shadow!(build);

/// 启动服务并阻塞直到收到退出信号。
#[tokio::main]
async fn main() -> Result<(), std::io::Error> {
    dotenvy::dotenv().ok();
    logging::init_logging();

    let args = Args::parse();
    let ctx = AppContext::from_args(&args)
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err.to_string()))?;
    info!(
        "Token store at {}, redirect url {}",
        ctx.store.path().display(),
        args.redirect_url
    );
    let app = build_router(ctx);

    let host = args
        .host
        .parse::<IpAddr>()
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err.to_string()))?;
    let addr = SocketAddr::new(host, args.port);
    let handle = Handle::new();

    info!("🚀 Starting HTTP server at {}", addr);

    let server = axum_server::bind(addr)
        .handle(handle.clone())
        .serve(app.into_make_service_with_connect_info::<SocketAddr>());

    tokio::select! {
        result = server => result?,
        _ = shutdown_signal(handle) => {}
    }

    Ok(())
}

async fn shutdown_signal(handle: Handle) {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                tracing::error!("Failed to install SIGTERM handler: {}", err);
                std::future::pending::<()>().await;
            }
        }
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

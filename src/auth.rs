//! OAuth 回调处理与按请求加载令牌构建 Drive 客户端。

use axum::extract::{Extension, Query};
use axum::response::Redirect;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, warn};

use crate::drive::{DriveClient, DriveSettings};
use crate::error::ApiError;
use crate::oauth::Authorizer;
use crate::token_store::TokenStore;

#[derive(Deserialize)]
pub(crate) struct CallbackQuery {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
}

/// 授权回调：换取令牌并写入令牌文件，成功后重定向回首页。
pub async fn oauth_callback(
    Extension(authorizer): Extension<Arc<Authorizer>>,
    Extension(store): Extension<Arc<TokenStore>>,
    Query(query): Query<CallbackQuery>,
) -> Result<Redirect, ApiError> {
    if let Some(error) = query.error {
        warn!(error = %error, "provider denied authorization");
        return Err(ApiError::ExchangeFailed(format!(
            "authorization denied by provider: {error}"
        )));
    }
    if let Some(state) = query.state.as_deref()
        && state != authorizer.config().state
    {
        warn!("oauth callback state mismatch");
        return Err(ApiError::BadRequest("state mismatch".into()));
    }
    let code = query
        .code
        .filter(|code| !code.is_empty())
        .ok_or_else(|| ApiError::BadRequest("code is required".into()))?;

    let token = authorizer.exchange_code(&code).await?;
    store.save(&token).await?;
    info!("authorization completed");
    Ok(Redirect::temporary("/"))
}

/// 读取当前令牌并构建 Drive 客户端；令牌缺失或无法续期时要求重新授权。
pub async fn drive_client(
    authorizer: &Arc<Authorizer>,
    store: &Arc<TokenStore>,
    settings: &DriveSettings,
) -> Result<DriveClient, ApiError> {
    let token = store.load().await?;
    if !token.is_access_valid() && !token.can_refresh() {
        return Err(ApiError::AuthorizationRequired(
            "stored token expired and cannot be refreshed".into(),
        ));
    }
    let auth = authorizer.authenticated_client(token, Some(Arc::clone(store)));
    Ok(DriveClient::new(auth, settings.clone()))
}

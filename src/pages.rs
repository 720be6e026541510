//! 嵌入式页面模板：首页展示授权链接。

use axum::extract::Extension;
use axum::response::Html;
use rust_embed::RustEmbed;
use std::sync::Arc;

use crate::error::ApiError;
use crate::oauth::Authorizer;

const AUTH_URL_PLACEHOLDER: &str = "{{auth_url}}";

#[derive(RustEmbed)]
#[folder = "templates"]
/// 编译期嵌入的 HTML 模板。
pub struct Templates;

/// 首页：渲染包含授权链接的页面。
pub async fn index(
    Extension(authorizer): Extension<Arc<Authorizer>>,
) -> Result<Html<String>, ApiError> {
    let consent_url = authorizer.consent_url(&authorizer.config().state);
    render_index(consent_url.as_str()).map(Html)
}

fn render_index(auth_url: &str) -> Result<String, ApiError> {
    let template = Templates::get("index.html")
        .ok_or_else(|| ApiError::Internal("index template missing".into()))?;
    let template = std::str::from_utf8(&template.data)
        .map_err(|_| ApiError::Internal("index template is not utf-8".into()))?;
    Ok(template.replace(AUTH_URL_PLACEHOLDER, &escape_attr(auth_url)))
}

fn escape_attr(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(ch),
        }
    }
    escaped
}

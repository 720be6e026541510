//! OAuth2 授权码流程：生成授权链接、换取令牌、构建自动续期的认证客户端。

use chrono::{Duration as ChronoDuration, Utc};
use reqwest::{Client, RequestBuilder};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use url::Url;

use crate::token_store::{StoredToken, TokenStore};

#[derive(Clone, Debug)]
pub struct OAuthConfig {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_url: String,
    pub auth_url: String,
    pub token_url: String,
    pub scopes: Vec<String>,
    /// 授权链接中携带的固定 state。
    pub state: String,
}

#[derive(Debug, Error)]
pub enum OAuthError {
    #[error("invalid oauth endpoint {url}: {source}")]
    InvalidEndpoint {
        url: String,
        source: url::ParseError,
    },
    #[error("http client setup failed: {0}")]
    Client(#[from] reqwest::Error),
    #[error("authorization code exchange failed: {0}")]
    Exchange(String),
    #[error("token refresh failed: {0}")]
    Refresh(String),
    #[error("access token expired and no refresh token is available")]
    AuthExpired,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    token_type: Option<String>,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
    scope: Option<String>,
}

#[derive(Deserialize)]
struct TokenErrorResponse {
    error: String,
    error_description: Option<String>,
}

/// Builds consent urls and talks to the provider's token endpoint.
#[derive(Debug)]
pub struct Authorizer {
    config: OAuthConfig,
    auth_url: Url,
    http: Client,
    timeout: Duration,
}

impl Authorizer {
    /// 校验端点并创建共享的 HTTP 客户端。
    pub fn new(config: OAuthConfig, timeout: Duration) -> Result<Self, OAuthError> {
        let auth_url = Url::parse(&config.auth_url).map_err(|source| OAuthError::InvalidEndpoint {
            url: config.auth_url.clone(),
            source,
        })?;
        Url::parse(&config.token_url).map_err(|source| OAuthError::InvalidEndpoint {
            url: config.token_url.clone(),
            source,
        })?;
        let http = Client::builder()
            .user_agent(concat!("drive-relay/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            config,
            auth_url,
            http,
            timeout,
        })
    }

    pub fn config(&self) -> &OAuthConfig {
        &self.config
    }

    pub fn http(&self) -> &Client {
        &self.http
    }

    /// 生成请求离线访问的授权链接。
    pub fn consent_url(&self, state: &str) -> Url {
        let mut url = self.auth_url.clone();
        url.query_pairs_mut()
            .append_pair("access_type", "offline")
            .append_pair("client_id", &self.config.client_id)
            .append_pair("redirect_uri", &self.config.redirect_url)
            .append_pair("response_type", "code")
            .append_pair("scope", &self.config.scopes.join(" "))
            .append_pair("state", state);
        url
    }

    /// 用授权码换取令牌；调用方负责持久化。
    pub async fn exchange_code(&self, code: &str) -> Result<StoredToken, OAuthError> {
        let response = self
            .token_request(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", self.config.redirect_url.as_str()),
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
            ])
            .await
            .map_err(OAuthError::Exchange)?;
        let token = into_stored_token(response, None, &self.config.scopes)
            .map_err(OAuthError::Exchange)?;
        info!(
            has_refresh_token = token.refresh_token.is_some(),
            "authorization code exchanged"
        );
        Ok(token)
    }

    /// 使用刷新令牌获取新的访问令牌，保留旧的刷新令牌与授权范围作为回退。
    pub async fn refresh(&self, previous: &StoredToken) -> Result<StoredToken, OAuthError> {
        let refresh_token = previous
            .refresh_token
            .as_deref()
            .filter(|value| !value.is_empty())
            .ok_or(OAuthError::AuthExpired)?;
        let response = self
            .token_request(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
            ])
            .await
            .map_err(OAuthError::Refresh)?;
        let token = into_stored_token(response, Some(refresh_token), &previous.scope)
            .map_err(OAuthError::Refresh)?;
        info!("access token refreshed");
        Ok(token)
    }

    /// 构建认证客户端；不做任何网络请求，过期在调用时才暴露。
    pub fn authenticated_client(
        self: &Arc<Self>,
        token: StoredToken,
        store: Option<Arc<TokenStore>>,
    ) -> AuthorizedClient {
        AuthorizedClient {
            authorizer: Arc::clone(self),
            store,
            token: Mutex::new(token),
        }
    }

    async fn token_request(&self, form: &[(&str, &str)]) -> Result<TokenResponse, String> {
        let response = self
            .http
            .post(&self.config.token_url)
            .timeout(self.timeout)
            .header(reqwest::header::ACCEPT, "application/json")
            .form(form)
            .send()
            .await
            .map_err(|err| format!("token endpoint unreachable: {err}"))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| format!("failed to read token response: {err}"))?;

        if !status.is_success() {
            return Err(match serde_json::from_str::<TokenErrorResponse>(&body) {
                Ok(TokenErrorResponse {
                    error,
                    error_description: Some(description),
                }) => format!("{status}: {error}: {description}"),
                Ok(TokenErrorResponse { error, .. }) => format!("{status}: {error}"),
                Err(_) => format!("{status}: {}", body.trim()),
            });
        }

        serde_json::from_str(&body).map_err(|err| format!("malformed token response: {err}"))
    }
}

fn into_stored_token(
    response: TokenResponse,
    fallback_refresh: Option<&str>,
    fallback_scope: &[String],
) -> Result<StoredToken, String> {
    let access_token = response
        .access_token
        .filter(|value| !value.is_empty())
        .ok_or_else(|| "malformed token response: missing access_token".to_string())?;
    let scope = match response.scope {
        Some(scope) => scope.split_whitespace().map(str::to_string).collect(),
        None => fallback_scope.to_vec(),
    };
    Ok(StoredToken {
        access_token,
        token_type: response.token_type.unwrap_or_else(|| "Bearer".to_string()),
        refresh_token: response
            .refresh_token
            .filter(|value| !value.is_empty())
            .or_else(|| fallback_refresh.map(str::to_string)),
        expiry: response
            .expires_in
            .filter(|secs| *secs > 0)
            .map(|secs| Utc::now() + ChronoDuration::seconds(secs)),
        scope,
    })
}

/// HTTP transport bound to one stored token. Sibling calls share a lock so an
/// expired access token is refreshed once.
pub struct AuthorizedClient {
    authorizer: Arc<Authorizer>,
    store: Option<Arc<TokenStore>>,
    token: Mutex<StoredToken>,
}

impl AuthorizedClient {
    pub fn http(&self) -> &Client {
        self.authorizer.http()
    }

    /// 返回可用的访问令牌，必要时刷新并写回令牌文件。
    pub async fn access_token(&self) -> Result<String, OAuthError> {
        let mut token = self.token.lock().await;
        if token.is_access_valid() {
            return Ok(token.access_token.clone());
        }
        if !token.can_refresh() {
            return Err(OAuthError::AuthExpired);
        }

        debug!("access token expired, refreshing");
        let refreshed = self.authorizer.refresh(&token).await?;
        if let Some(store) = &self.store
            && let Err(err) = store.save(&refreshed).await
        {
            warn!(error = %err, "failed to persist refreshed token");
        }
        *token = refreshed;
        Ok(token.access_token.clone())
    }

    /// 为请求附加 Bearer 凭据。
    pub async fn authorize(&self, request: RequestBuilder) -> Result<RequestBuilder, OAuthError> {
        let access_token = self.access_token().await?;
        Ok(request.bearer_auth(access_token))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use httptest::matchers::{all_of, contains, request, url_decoded};
    use httptest::responders::{json_encoded, status_code};
    use httptest::{Expectation, Server};
    use serde_json::json;
    use tempfile::tempdir;

    pub(crate) fn test_config(server: Option<&Server>) -> OAuthConfig {
        let token_url = server
            .map(|server| server.url("/token").to_string())
            .unwrap_or_else(|| "http://127.0.0.1:9/token".to_string());
        OAuthConfig {
            client_id: "client-id".to_string(),
            client_secret: "client-secret".to_string(),
            redirect_url: "http://localhost:8080/callback".to_string(),
            auth_url: "https://accounts.example.com/o/oauth2/auth".to_string(),
            token_url,
            scopes: vec!["https://www.googleapis.com/auth/drive.file".to_string()],
            state: "state-token".to_string(),
        }
    }

    pub(crate) fn test_authorizer(server: Option<&Server>) -> Arc<Authorizer> {
        Arc::new(
            Authorizer::new(test_config(server), Duration::from_secs(5)).expect("authorizer"),
        )
    }

    fn token(access: &str, refresh: Option<&str>, expires_in_secs: i64) -> StoredToken {
        StoredToken {
            access_token: access.to_string(),
            token_type: "Bearer".to_string(),
            refresh_token: refresh.map(str::to_string),
            expiry: Some(Utc::now() + ChronoDuration::seconds(expires_in_secs)),
            scope: vec![],
        }
    }

    #[test]
    fn consent_url_requests_offline_access() {
        let authorizer = test_authorizer(None);
        let url = authorizer.consent_url("state-token");
        let pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();

        assert_eq!(url.host_str(), Some("accounts.example.com"));
        assert!(pairs.contains(&("access_type".into(), "offline".into())));
        assert!(pairs.contains(&("state".into(), "state-token".into())));
        assert!(pairs.contains(&("client_id".into(), "client-id".into())));
        assert!(pairs.contains(&("response_type".into(), "code".into())));
        assert!(pairs.contains(&(
            "scope".into(),
            "https://www.googleapis.com/auth/drive.file".into()
        )));
        assert_eq!(url, authorizer.consent_url("state-token"));
    }

    #[test]
    fn invalid_auth_endpoint_is_rejected() {
        let mut config = test_config(None);
        config.auth_url = "not a url".to_string();
        let result = Authorizer::new(config, Duration::from_secs(1));
        assert!(matches!(result, Err(OAuthError::InvalidEndpoint { .. })));
    }

    #[tokio::test]
    async fn exchange_code_returns_token() {
        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method_path("POST", "/token"),
                request::body(url_decoded(contains(("grant_type", "authorization_code")))),
                request::body(url_decoded(contains(("code", "good-code"))))
            ])
            .respond_with(json_encoded(json!({
                "access_token": "ya29.access",
                "refresh_token": "1//refresh",
                "expires_in": 3600,
                "scope": "https://www.googleapis.com/auth/drive.file",
                "token_type": "Bearer"
            }))),
        );

        let authorizer = test_authorizer(Some(&server));
        let token = authorizer.exchange_code("good-code").await.expect("exchange");

        assert_eq!(token.access_token, "ya29.access");
        assert_eq!(token.refresh_token.as_deref(), Some("1//refresh"));
        assert_eq!(
            token.scope,
            vec!["https://www.googleapis.com/auth/drive.file".to_string()]
        );
        assert!(token.is_access_valid());
    }

    #[tokio::test]
    async fn exchange_code_surfaces_provider_rejection() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("POST", "/token")).respond_with(
                status_code(400)
                    .append_header("Content-Type", "application/json")
                    .body(r#"{"error":"invalid_grant","error_description":"Bad Request"}"#),
            ),
        );

        let authorizer = test_authorizer(Some(&server));
        let err = authorizer
            .exchange_code("bad")
            .await
            .expect_err("exchange should fail");

        match err {
            OAuthError::Exchange(message) => {
                assert!(message.contains("invalid_grant"), "{message}");
                assert!(message.contains("Bad Request"), "{message}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn exchange_code_rejects_response_without_access_token() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("POST", "/token"))
                .respond_with(json_encoded(json!({ "token_type": "Bearer" }))),
        );

        let authorizer = test_authorizer(Some(&server));
        let result = authorizer.exchange_code("code").await;
        assert!(matches!(result, Err(OAuthError::Exchange(_))));
    }

    #[tokio::test]
    async fn valid_token_is_used_without_network() {
        let server = Server::run();
        let authorizer = test_authorizer(Some(&server));
        let client = authorizer.authenticated_client(token("ya29.valid", None, 3600), None);

        assert_eq!(client.access_token().await.expect("token"), "ya29.valid");
    }

    #[tokio::test]
    async fn expired_token_without_refresh_fails_without_network() {
        let server = Server::run();
        let authorizer = test_authorizer(Some(&server));
        let client = authorizer.authenticated_client(token("ya29.old", None, -60), None);

        let result = client.access_token().await;
        assert!(matches!(result, Err(OAuthError::AuthExpired)));
    }

    #[tokio::test]
    async fn expired_token_is_refreshed_once_and_persisted() {
        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method_path("POST", "/token"),
                request::body(url_decoded(contains(("grant_type", "refresh_token")))),
                request::body(url_decoded(contains(("refresh_token", "1//refresh"))))
            ])
            .times(1)
            .respond_with(json_encoded(json!({
                "access_token": "ya29.fresh",
                "expires_in": 3600,
                "token_type": "Bearer"
            }))),
        );

        let temp = tempdir().expect("tempdir");
        let store = Arc::new(TokenStore::new(temp.path().join("token.json")));
        let authorizer = test_authorizer(Some(&server));
        let client = authorizer.authenticated_client(
            token("ya29.old", Some("1//refresh"), -60),
            Some(store.clone()),
        );

        let (first, second) = tokio::join!(client.access_token(), client.access_token());
        assert_eq!(first.expect("first"), "ya29.fresh");
        assert_eq!(second.expect("second"), "ya29.fresh");

        let persisted = store.load().await.expect("persisted token");
        assert_eq!(persisted.access_token, "ya29.fresh");
        assert_eq!(persisted.refresh_token.as_deref(), Some("1//refresh"));
    }

    #[tokio::test]
    async fn rejected_refresh_is_reported() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("POST", "/token")).respond_with(
                status_code(400).body(r#"{"error":"invalid_grant","error_description":"Token has been expired or revoked."}"#),
            ),
        );

        let authorizer = test_authorizer(Some(&server));
        let client =
            authorizer.authenticated_client(token("ya29.old", Some("1//revoked"), -60), None);

        let result = client.access_token().await;
        assert!(matches!(result, Err(OAuthError::Refresh(_))));
    }
}

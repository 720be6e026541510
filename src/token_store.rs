//! 单用户 OAuth 令牌的本地 JSON 缓存。

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tracing::info;

use crate::atomic::AtomicFile;
use crate::config::TOKEN_EXPIRY_SKEW_SECS;

/// Credential record issued by the provider and persisted between requests.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredToken {
    pub access_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry: Option<DateTime<Utc>>,
    #[serde(default)]
    pub scope: Vec<String>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl StoredToken {
    /// 访问凭据是否在给定时刻仍可用（预留少量时钟偏差）。
    pub fn is_access_valid_at(&self, now: DateTime<Utc>) -> bool {
        if self.access_token.is_empty() {
            return false;
        }
        match self.expiry {
            Some(expiry) => expiry - Duration::seconds(TOKEN_EXPIRY_SKEW_SECS) > now,
            None => true,
        }
    }

    pub fn is_access_valid(&self) -> bool {
        self.is_access_valid_at(Utc::now())
    }

    pub fn can_refresh(&self) -> bool {
        self.refresh_token
            .as_deref()
            .is_some_and(|value| !value.is_empty())
    }
}

#[derive(Debug, Error)]
pub enum TokenStoreError {
    #[error("no stored token at {0}")]
    NotFound(PathBuf),
    #[error("stored token is malformed: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("token file io failed: {0}")]
    Io(#[from] io::Error),
}

/// Single fixed-path token file. Not locked across requests: concurrent
/// authorization flows race and the last writer wins.
#[derive(Clone, Debug)]
pub struct TokenStore {
    path: PathBuf,
}

impl TokenStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 读取并反序列化令牌文件。
    pub async fn load(&self) -> Result<StoredToken, TokenStoreError> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(TokenStoreError::NotFound(self.path.clone()));
            }
            Err(err) => return Err(err.into()),
        };
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// 序列化并原子覆盖令牌文件。
    pub async fn save(&self, token: &StoredToken) -> Result<(), TokenStoreError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).await?;
        }
        let payload = serde_json::to_vec_pretty(token)?;
        AtomicFile::create(&self.path)
            .await?
            .write_all(&payload)
            .await?;
        info!(path = ?self.path, "saved oauth token");
        Ok(())
    }
}

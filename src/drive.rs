//! Google Drive v3 调用：创建文件夹、multipart 媒体上传，带超时与有限重试。

use bytes::{BufMut, Bytes, BytesMut};
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::oauth::{AuthorizedClient, OAuthError};

pub const FOLDER_MIME: &str = "application/vnd.google-apps.folder";
const FILE_FIELDS: &str = "id,name,mimeType,parents";

#[derive(Clone, Debug)]
pub struct DriveSettings {
    pub api_base: String,
    pub upload_base: String,
    /// 单次远程调用的超时时间。
    pub timeout: Duration,
    pub max_attempts: u32,
    pub backoff_base: Duration,
}

/// Identifier record returned by Drive for a created file or folder.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteFile {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parents: Vec<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FileMetadata<'a> {
    name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    mime_type: Option<&'a str>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    parents: Vec<&'a str>,
}

#[derive(Deserialize)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(Deserialize)]
struct ApiErrorDetail {
    message: String,
}

#[derive(Debug, Error)]
pub enum DriveError {
    #[error(transparent)]
    Auth(#[from] OAuthError),
    #[error("drive api returned {status}: {message}")]
    Api { status: u16, message: String },
    #[error("drive request timed out after {0:?}")]
    Timeout(Duration),
    #[error("drive request failed: {0}")]
    Transport(String),
    #[error("malformed drive response: {0}")]
    Decode(String),
}

impl DriveError {
    /// 网络超时、连接失败、限流与 5xx 可重试；认证与校验错误不重试。
    fn is_transient(&self) -> bool {
        match self {
            DriveError::Timeout(_) | DriveError::Transport(_) => true,
            DriveError::Api { status, .. } => *status == 429 || *status >= 500,
            DriveError::Auth(_) | DriveError::Decode(_) => false,
        }
    }
}

/// Drive API client bound to one authorized transport.
pub struct DriveClient {
    auth: AuthorizedClient,
    settings: DriveSettings,
}

impl DriveClient {
    pub fn new(auth: AuthorizedClient, settings: DriveSettings) -> Self {
        Self { auth, settings }
    }

    /// 创建文件夹；parent 为空时落在根目录。
    pub async fn create_folder(&self, name: &str, parent: &str) -> Result<RemoteFile, DriveError> {
        let metadata = FileMetadata {
            name,
            mime_type: Some(FOLDER_MIME),
            parents: parents_of(parent),
        };
        let url = format!("{}/files", self.settings.api_base.trim_end_matches('/'));
        let folder = self
            .send_with_retry("create_folder", |http| {
                http.post(&url)
                    .query(&[("fields", FILE_FIELDS)])
                    .json(&metadata)
            })
            .await?;
        info!(folder_id = %folder.id, name, "folder created");
        Ok(folder)
    }

    /// 以 multipart/related 方式同时提交元数据与文件内容。
    pub async fn upload_file(
        &self,
        name: &str,
        parent: &str,
        mime_type: &str,
        content: Bytes,
    ) -> Result<RemoteFile, DriveError> {
        let metadata = FileMetadata {
            name,
            mime_type: None,
            parents: parents_of(parent),
        };
        let metadata =
            serde_json::to_vec(&metadata).map_err(|err| DriveError::Decode(err.to_string()))?;
        let boundary = format!("drive-relay-{}", Uuid::new_v4().simple());
        let body = multipart_related_body(&boundary, &metadata, mime_type, &content);
        let content_type = format!("multipart/related; boundary={boundary}");
        let url = format!("{}/files", self.settings.upload_base.trim_end_matches('/'));

        let file = self
            .send_with_retry("upload_file", |http| {
                http.post(&url)
                    .query(&[("uploadType", "multipart"), ("fields", FILE_FIELDS)])
                    .header(CONTENT_TYPE, content_type.as_str())
                    .body(body.clone())
            })
            .await?;
        debug!(file_id = %file.id, name, bytes = content.len(), "file uploaded");
        Ok(file)
    }

    async fn send_with_retry<F>(&self, op: &'static str, build: F) -> Result<RemoteFile, DriveError>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let max_attempts = self.settings.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.send_once(&build).await {
                Ok(file) => return Ok(file),
                Err(err) if err.is_transient() && attempt < max_attempts => {
                    let backoff = backoff_delay(self.settings.backoff_base, attempt);
                    warn!(
                        op,
                        attempt,
                        max_attempts,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %err,
                        "transient drive failure, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn send_once<F>(&self, build: &F) -> Result<RemoteFile, DriveError>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let request = self
            .auth
            .authorize(build(self.auth.http()))
            .await?
            .timeout(self.settings.timeout);
        let response = request.send().await.map_err(|err| self.transport_error(err))?;
        self.decode_response(response).await
    }

    async fn decode_response(&self, response: Response) -> Result<RemoteFile, DriveError> {
        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|err| self.transport_error(err))?;
        if status.is_success() {
            return serde_json::from_slice(&body).map_err(|err| DriveError::Decode(err.to_string()));
        }
        Err(api_error(status, &body))
    }

    fn transport_error(&self, err: reqwest::Error) -> DriveError {
        if err.is_timeout() {
            DriveError::Timeout(self.settings.timeout)
        } else {
            DriveError::Transport(err.to_string())
        }
    }
}

/// 第 `attempt` 次失败后的等待时间：基数按 2 的幂增长，溢出时饱和。
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let factor = 2u32
        .checked_pow(attempt.saturating_sub(1))
        .unwrap_or(u32::MAX);
    base.saturating_mul(factor)
}

fn parents_of(parent: &str) -> Vec<&str> {
    let parent = parent.trim();
    if parent.is_empty() {
        Vec::new()
    } else {
        vec![parent]
    }
}

fn api_error(status: StatusCode, body: &[u8]) -> DriveError {
    let message = match serde_json::from_slice::<ApiErrorBody>(body) {
        Ok(parsed) => parsed.error.message,
        Err(_) => String::from_utf8_lossy(body).trim().to_string(),
    };
    DriveError::Api {
        status: status.as_u16(),
        message,
    }
}

fn multipart_related_body(
    boundary: &str,
    metadata: &[u8],
    mime_type: &str,
    content: &[u8],
) -> Bytes {
    let mut buf = BytesMut::with_capacity(metadata.len() + content.len() + 256);
    buf.put_slice(format!("--{boundary}\r\n").as_bytes());
    buf.put_slice(b"Content-Type: application/json; charset=UTF-8\r\n\r\n");
    buf.put_slice(metadata);
    buf.put_slice(format!("\r\n--{boundary}\r\n").as_bytes());
    buf.put_slice(format!("Content-Type: {mime_type}\r\n\r\n").as_bytes());
    buf.put_slice(content);
    buf.put_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
    buf.freeze()
}

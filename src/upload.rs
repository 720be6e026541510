//! 多文件上传：每个文件一个任务，全局信号量限流，全部完成后汇总结果再响应。

use axum::extract::{Extension, Multipart};
use axum::extract::multipart::MultipartError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json as JsonResponse, Response};
use bytes::Bytes;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::auth::drive_client;
use crate::drive::{DriveClient, DriveError, DriveSettings};
use crate::error::ApiError;
use crate::normalize::{ImageNormalizer, NORMALIZED_MIME, NormalizeError};
use crate::oauth::Authorizer;
use crate::token_store::TokenStore;

const FOLDER_FIELD: &str = "folder_id";
const FILES_FIELD: &str = "files";

#[derive(Debug)]
pub struct UploadConfig {
    pub normalizer: ImageNormalizer,
    /// 进程级的并发上传许可，所有请求共享。
    pub permits: Arc<Semaphore>,
    pub max_body_size: usize,
}

impl UploadConfig {
    pub fn new(normalizer: ImageNormalizer, max_concurrent: usize, max_body_size: usize) -> Self {
        Self {
            normalizer,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            max_body_size,
        }
    }
}

/// One file of an upload request, fully buffered.
#[derive(Debug)]
pub struct UploadTask {
    pub name: String,
    pub content_type: Option<String>,
    pub data: Bytes,
}

#[derive(Debug, Serialize)]
pub struct FileOutcome {
    pub name: String,
    #[serde(flatten)]
    pub status: UploadStatus,
}

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UploadStatus {
    Uploaded {
        id: String,
        mime_type: String,
        normalized: bool,
    },
    Failed {
        kind: &'static str,
        message: String,
    },
}

impl FileOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self.status, UploadStatus::Failed { .. })
    }
}

#[derive(Debug, Serialize)]
pub struct UploadSummary {
    pub folder_id: String,
    pub uploaded: usize,
    pub failed: usize,
    pub files: Vec<FileOutcome>,
}

enum FileError {
    Normalize(NormalizeError),
    Drive(DriveError),
    Internal(String),
}

impl FileError {
    fn kind(&self) -> &'static str {
        match self {
            FileError::Normalize(NormalizeError::Decode(_)) => "decode_error",
            FileError::Normalize(NormalizeError::Encode(_)) => "internal",
            FileError::Drive(DriveError::Auth(_)) => "authorization_required",
            FileError::Drive(_) => "remote_api_error",
            FileError::Internal(_) => "internal",
        }
    }

    fn message(&self) -> String {
        match self {
            FileError::Normalize(err) => err.to_string(),
            FileError::Drive(err) => err.to_string(),
            FileError::Internal(msg) => msg.clone(),
        }
    }
}

/// 接收 multipart 表单，上传全部文件后返回逐文件结果。
pub async fn upload_files(
    Extension(authorizer): Extension<Arc<Authorizer>>,
    Extension(store): Extension<Arc<TokenStore>>,
    Extension(settings): Extension<Arc<DriveSettings>>,
    Extension(upload): Extension<Arc<UploadConfig>>,
    mut multipart: Multipart,
) -> Result<Response, ApiError> {
    let mut folder_id = String::new();
    let mut tasks = Vec::new();

    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let field_name = field.name().map(str::to_string);
        match field_name.as_deref() {
            Some(FOLDER_FIELD) => {
                folder_id = field.text().await.map_err(multipart_error)?.trim().to_string();
            }
            Some(FILES_FIELD) => {
                let name = field
                    .file_name()
                    .filter(|name| !name.is_empty())
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("file-{}", tasks.len() + 1));
                let content_type = field.content_type().map(str::to_string);
                let data = field.bytes().await.map_err(multipart_error)?;
                tasks.push(UploadTask {
                    name,
                    content_type,
                    data,
                });
            }
            other => debug!(field = ?other, "ignoring multipart field"),
        }
    }

    if tasks.is_empty() {
        return Err(ApiError::BadRequest("no files found in request".into()));
    }
    if folder_id.is_empty() {
        return Err(ApiError::BadRequest("folder_id is required".into()));
    }

    let drive = Arc::new(drive_client(&authorizer, &store, &settings).await?);
    let file_count = tasks.len();
    let files = upload_all(drive, &upload, tasks, &folder_id).await;

    let failed = files.iter().filter(|outcome| outcome.is_failed()).count();
    let summary = UploadSummary {
        folder_id,
        uploaded: files.len() - failed,
        failed,
        files,
    };
    info!(
        folder_id = %summary.folder_id,
        files = file_count,
        uploaded = summary.uploaded,
        failed = summary.failed,
        "upload request finished"
    );

    let status = if failed == 0 {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    Ok((status, JsonResponse(summary)).into_response())
}

/// 为每个文件启动独立任务，等待全部结束并逐一收集结果。
///
/// Outcomes are in completion order. Dropping the returned future aborts every
/// in-flight task.
pub async fn upload_all(
    drive: Arc<DriveClient>,
    config: &UploadConfig,
    tasks: Vec<UploadTask>,
    folder_id: &str,
) -> Vec<FileOutcome> {
    let mut set = JoinSet::new();
    let mut names = HashMap::with_capacity(tasks.len());

    for task in tasks {
        let name = task.name.clone();
        let drive = Arc::clone(&drive);
        let permits = Arc::clone(&config.permits);
        let normalizer = config.normalizer;
        let folder_id = folder_id.to_string();
        let handle = set.spawn(async move {
            let name = task.name.clone();
            let result = process_file(drive, permits, normalizer, task, folder_id).await;
            (name, result)
        });
        names.insert(handle.id(), name);
    }

    let mut outcomes = Vec::with_capacity(names.len());
    while let Some(joined) = set.join_next_with_id().await {
        let outcome = match joined {
            Ok((id, (name, result))) => {
                names.remove(&id);
                match result {
                    Ok(status) => FileOutcome { name, status },
                    Err(err) => {
                        warn!(
                            file = %name,
                            kind = err.kind(),
                            error = %err.message(),
                            "file upload failed"
                        );
                        FileOutcome {
                            name,
                            status: UploadStatus::Failed {
                                kind: err.kind(),
                                message: err.message(),
                            },
                        }
                    }
                }
            }
            Err(join_err) => {
                let name = names.remove(&join_err.id()).unwrap_or_default();
                warn!(file = %name, error = %join_err, "upload worker terminated");
                FileOutcome {
                    name,
                    status: UploadStatus::Failed {
                        kind: "internal",
                        message: format!("upload worker terminated: {join_err}"),
                    },
                }
            }
        };
        outcomes.push(outcome);
    }
    outcomes
}

async fn process_file(
    drive: Arc<DriveClient>,
    permits: Arc<Semaphore>,
    normalizer: ImageNormalizer,
    task: UploadTask,
    folder_id: String,
) -> Result<UploadStatus, FileError> {
    let _permit = permits
        .acquire_owned()
        .await
        .map_err(|_| FileError::Internal("upload pool closed".into()))?;

    let (content, mime_type, normalized) = if normalizer.applies_to(&task.data) {
        let data = task.data.clone();
        let encoded = tokio::task::spawn_blocking(move || normalizer.normalize(&data))
            .await
            .map_err(|err| FileError::Internal(format!("image worker failed: {err}")))?
            .map_err(FileError::Normalize)?;
        debug!(
            file = %task.name,
            before = task.data.len(),
            after = encoded.len(),
            "image normalized"
        );
        (encoded, NORMALIZED_MIME.to_string(), true)
    } else {
        let mime_type = mime_for(&task);
        (task.data.clone(), mime_type, false)
    };

    let file = drive
        .upload_file(&task.name, &folder_id, &mime_type, content)
        .await
        .map_err(FileError::Drive)?;
    Ok(UploadStatus::Uploaded {
        id: file.id,
        mime_type,
        normalized,
    })
}

/// 优先使用客户端声明的类型，缺失或为通用二进制时按文件名推断。
fn mime_for(task: &UploadTask) -> String {
    match task.content_type.as_deref() {
        Some(value) if !value.is_empty() && value != "application/octet-stream" => {
            value.to_string()
        }
        _ => mime_guess::from_path(&task.name)
            .first_or_octet_stream()
            .essence_str()
            .to_string(),
    }
}

fn multipart_error(err: MultipartError) -> ApiError {
    let message = format!("invalid multipart body: {}", err.body_text());
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        ApiError::PayloadTooLarge(message)
    } else {
        ApiError::BadRequest(message)
    }
}

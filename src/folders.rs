//! 远程文件夹创建处理器。

use axum::extract::{Extension, Form};
use axum::response::Json as JsonResponse;
use serde::Deserialize;
use std::sync::Arc;

use crate::auth::drive_client;
use crate::drive::{DriveSettings, RemoteFile};
use crate::error::ApiError;
use crate::oauth::Authorizer;
use crate::token_store::TokenStore;

#[derive(Deserialize)]
pub(crate) struct CreateFolderForm {
    #[serde(default)]
    parent_folder_id: String,
    #[serde(default)]
    folder_name: String,
}

/// 在指定父目录下创建文件夹。
pub async fn create_folder(
    Extension(authorizer): Extension<Arc<Authorizer>>,
    Extension(store): Extension<Arc<TokenStore>>,
    Extension(settings): Extension<Arc<DriveSettings>>,
    Form(form): Form<CreateFolderForm>,
) -> Result<JsonResponse<RemoteFile>, ApiError> {
    let folder_name = form.folder_name.trim();
    if folder_name.is_empty() {
        return Err(ApiError::BadRequest("folder_name is required".into()));
    }

    let drive = drive_client(&authorizer, &store, &settings).await?;
    let folder = drive
        .create_folder(folder_name, &form.parent_folder_id)
        .await?;
    Ok(JsonResponse(folder))
}

//! multipart 上传处理器。

use axum::extract::multipart::Field;
use axum::extract::{Extension, Multipart};
use axum::http::{HeaderMap, header};
use axum::response::{IntoResponse, Response};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error};

use crate::api::{UploadApi, UploadAttempt};
use crate::atomic::SpoolFile;
use crate::error::ApiError;

/// 表单中文件部分的字段名。
pub const FILE_FIELD: &str = "file";
/// 表单中一次性口令的字段名。
pub const KEY_FIELD: &str = "key";

/// 接收上传：解析表单后交给准入流水线，按结果映射响应。
///
/// 文件内容逐块写入暂存文件，内存占用与上传大小无关。
pub async fn upload_file(
    Extension(api): Extension<Arc<UploadApi>>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Response, ApiError> {
    let mut file = None;
    let mut otp_code = None;

    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_ascii_lowercase();
        if name == FILE_FIELD {
            let file_name = field.file_name().unwrap_or_default().to_string();
            let mut spool = api.spool().await.map_err(internal)?;
            let length = spool_field(field, &mut spool).await?;
            file = Some((file_name, length, spool));
        } else if name == KEY_FIELD {
            let value = field.text().await?;
            otp_code = Some(value.trim().to_string());
        }
    }

    let Some((file_name, length, mut spool)) = file else {
        return Err(ApiError::BadRequest("File is null".into()));
    };

    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    debug!(
        user_agent = user_agent.as_deref().unwrap_or("[null]"),
        file_name,
        bytes = length,
        "upload request"
    );

    spool.rewind().await.map_err(internal)?;
    let status = api
        .try_upload(UploadAttempt {
            file_name,
            length,
            reader: spool.file_mut().map_err(internal)?,
            user_agent,
            otp_code,
        })
        .await?;
    Ok(status.into_response())
}

/// 将文件字段逐块写入暂存文件，返回写入的字节数。
async fn spool_field(mut field: Field<'_>, spool: &mut SpoolFile) -> Result<u64, ApiError> {
    let mut length = 0u64;
    let file = spool.file_mut().map_err(internal)?;
    while let Some(chunk) = field.chunk().await? {
        length += chunk.len() as u64;
        file.write_all(&chunk).await.map_err(internal)?;
    }
    Ok(length)
}

fn internal(err: std::io::Error) -> ApiError {
    error!(error = %err, "failed to spool upload");
    ApiError::Internal("failed to receive upload".into())
}

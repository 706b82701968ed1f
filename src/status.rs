//! 上传准入结果：封闭的结果集合、固定提示语与 HTTP 状态映射。

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// 一次上传尝试的最终结果。
///
/// 这些都是正常的业务判定而不是故障；存储 I/O 失败走 `UploadError`。
/// 变体顺序即准入检查的先后顺序。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum UploadStatus {
    Success,
    DownForMaintenance,
    MissingKey,
    InvalidKey,
    InvalidUserAgent,
    FileTooSmall,
    FileTooBig,
    InvalidFileExtension,
    InvalidFileType,
    InvalidFileName,
}

impl UploadStatus {
    /// 返回给客户端的固定提示语。
    pub fn message(self) -> &'static str {
        match self {
            UploadStatus::Success => "File Uploaded Successfully!",
            UploadStatus::DownForMaintenance => {
                "Site is down for maintenance.  Please try again later."
            }
            UploadStatus::MissingKey => "Key Not Found.",
            UploadStatus::InvalidKey => {
                "Invalid Key. Check your PC's clock and make sure its set correctly."
            }
            UploadStatus::InvalidUserAgent => "Invalid User Agent.",
            UploadStatus::FileTooSmall => "File is too small.",
            UploadStatus::FileTooBig => "File is too big.",
            UploadStatus::InvalidFileExtension => "Invalid File.",
            UploadStatus::InvalidFileType => "Invalid File Type.",
            UploadStatus::InvalidFileName => "Invalid File Name.",
        }
    }

    pub fn status_code(self) -> StatusCode {
        match self {
            UploadStatus::Success => StatusCode::OK,
            UploadStatus::DownForMaintenance => StatusCode::SERVICE_UNAVAILABLE,
            UploadStatus::MissingKey
            | UploadStatus::InvalidKey
            | UploadStatus::InvalidUserAgent
            | UploadStatus::FileTooSmall
            | UploadStatus::FileTooBig
            | UploadStatus::InvalidFileExtension
            | UploadStatus::InvalidFileType
            | UploadStatus::InvalidFileName => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for UploadStatus {
    fn into_response(self) -> Response {
        (self.status_code(), self.message()).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::UploadStatus;
    use axum::http::StatusCode;

    #[test]
    fn only_success_and_maintenance_escape_bad_request() {
        let all = [
            UploadStatus::Success,
            UploadStatus::DownForMaintenance,
            UploadStatus::MissingKey,
            UploadStatus::InvalidKey,
            UploadStatus::InvalidUserAgent,
            UploadStatus::FileTooSmall,
            UploadStatus::FileTooBig,
            UploadStatus::InvalidFileExtension,
            UploadStatus::InvalidFileType,
            UploadStatus::InvalidFileName,
        ];
        for status in all {
            let expected = match status {
                UploadStatus::Success => StatusCode::OK,
                UploadStatus::DownForMaintenance => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::BAD_REQUEST,
            };
            assert_eq!(status.status_code(), expected, "{status:?}");
            assert!(!status.message().is_empty());
        }
    }
}

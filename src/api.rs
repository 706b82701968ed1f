//! 上传准入流水线。
//!
//! 检查按固定顺序进行，遇到第一个失败立即返回：
//! 维护模式 → 一次性口令 → User-Agent → 大小下限 → 大小上限 →
//! 哨兵扩展名 → 内层类型 → 文件名安全 → 落盘。

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncRead;
use tracing::{debug, info};

use crate::atomic::SpoolFile;
use crate::config::{ALLOWED_INNER_EXTENSIONS, SENTINEL_EXTENSION, UploadPolicy};
use crate::maintenance::MaintenanceGate;
use crate::otp::{OtpError, OtpVerifier, unix_now};
use crate::status::UploadStatus;
use crate::storage::UploadStore;
use crate::timestamp::{MonotonicClock, TimestampSource};

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("failed to write upload: {0}")]
    Storage(#[from] io::Error),
}

/// 一次上传尝试，由 HTTP 层构造并只被消费一次。
pub struct UploadAttempt<R> {
    pub file_name: String,
    pub length: u64,
    pub reader: R,
    pub user_agent: Option<String>,
    pub otp_code: Option<String>,
}

pub struct UploadApi {
    policy: Arc<UploadPolicy>,
    otp: OtpVerifier,
    maintenance: MaintenanceGate,
    store: UploadStore,
    clock: Arc<dyn TimestampSource>,
}

impl UploadApi {
    pub fn new(policy: UploadPolicy) -> Self {
        Self::with_clock(policy, Arc::new(MonotonicClock::new()))
    }

    pub fn with_clock(policy: UploadPolicy, clock: Arc<dyn TimestampSource>) -> Self {
        let otp = OtpVerifier::new(policy.otp_key_file.clone());
        let store = UploadStore::new(policy.staging_dir.clone());
        Self {
            policy: Arc::new(policy),
            otp,
            maintenance: MaintenanceGate::new(),
            store,
            clock,
        }
    }

    pub fn staging_dir(&self) -> &std::path::Path {
        self.store.root_path()
    }

    /// 为一次请求创建暂存文件，请求结束时随之删除。
    pub async fn spool(&self) -> io::Result<SpoolFile> {
        self.store.spool().await
    }

    /// 确保暂存目录存在并首次加载口令密钥。可重复调用。
    pub async fn init(&self) -> Result<(), InitError> {
        info!("initializing upload api");
        self.store.ensure_root().await.map_err(InitError::Staging)?;
        if self.otp.is_configured() {
            self.otp.reload().await?;
        } else {
            info!("no otp key file configured, uploads do not require a key");
        }
        Ok(())
    }

    pub async fn reload_key(&self) -> Result<(), OtpError> {
        self.otp.reload().await
    }

    pub fn set_maintenance_mode(&self, enabled: bool) -> bool {
        self.maintenance.set(enabled)
    }

    /// 执行一次上传准入。
    pub async fn try_upload<R>(&self, attempt: UploadAttempt<R>) -> Result<UploadStatus, UploadError>
    where
        R: AsyncRead + Unpin,
    {
        let token = self.clock.next_token();
        self.try_upload_at(attempt, token, unix_now()).await
    }

    /// 以给定的时间戳令牌与 Unix 时间执行准入。
    pub async fn try_upload_at<R>(
        &self,
        attempt: UploadAttempt<R>,
        token: u64,
        now_unix: u64,
    ) -> Result<UploadStatus, UploadError>
    where
        R: AsyncRead + Unpin,
    {
        let UploadAttempt {
            file_name,
            length,
            mut reader,
            user_agent,
            otp_code,
        } = attempt;

        let rejection = self.check(
            &file_name,
            length,
            user_agent.as_deref(),
            otp_code.as_deref(),
            now_unix,
        );
        if let Some(status) = rejection {
            debug!(file_name, ?status, "upload rejected");
            return Ok(status);
        }

        let new_name = staged_name(token, &file_name);
        if has_path_separator(&new_name) {
            debug!(file_name, "upload rejected, unsafe file name");
            return Ok(UploadStatus::InvalidFileName);
        }

        let path: PathBuf = self.store.persist(&new_name, &mut reader).await?;
        info!(
            target: "notification",
            original = file_name,
            stored = new_name,
            path = ?path,
            "{file_name} has been uploaded as {new_name}!"
        );
        Ok(UploadStatus::Success)
    }

    fn check(
        &self,
        file_name: &str,
        length: u64,
        user_agent: Option<&str>,
        otp_code: Option<&str>,
        now_unix: u64,
    ) -> Option<UploadStatus> {
        if self.maintenance.is_closed() {
            return Some(UploadStatus::DownForMaintenance);
        }

        if let Some(totp) = self.otp.snapshot() {
            let Some(code) = otp_code else {
                return Some(UploadStatus::MissingKey);
            };
            if !totp.verify(code, now_unix) {
                return Some(UploadStatus::InvalidKey);
            }
        }

        if let Some(required) = self.policy.required_user_agent.as_deref()
            && user_agent != Some(required)
        {
            return Some(UploadStatus::InvalidUserAgent);
        }

        if let Some(min) = self.policy.min_bytes()
            && length < min
        {
            return Some(UploadStatus::FileTooSmall);
        }

        if let Some(max) = self.policy.max_bytes()
            && length > max
        {
            return Some(UploadStatus::FileTooBig);
        }

        let Some((inner_name, extension)) = file_name.rsplit_once('.') else {
            return Some(UploadStatus::InvalidFileExtension);
        };
        if extension != SENTINEL_EXTENSION {
            return Some(UploadStatus::InvalidFileExtension);
        }

        let inner_extension = inner_name.rsplit_once('.').map(|(_, ext)| ext);
        if !inner_extension.is_some_and(|ext| ALLOWED_INNER_EXTENSIONS.contains(&ext)) {
            return Some(UploadStatus::InvalidFileType);
        }

        None
    }
}

#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error("failed to create staging directory: {0}")]
    Staging(#[source] io::Error),
    #[error(transparent)]
    Otp(#[from] OtpError),
}

/// 落盘文件名：`{时间戳令牌}_{原始文件名}`。
pub fn staged_name(token: u64, file_name: &str) -> String {
    format!("{token}_{file_name}")
}

fn has_path_separator(name: &str) -> bool {
    name.contains(['/', '\\'])
}

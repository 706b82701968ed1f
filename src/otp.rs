//! 基于时间的一次性密码（RFC 6238）与可热重载的校验器。
//!
//! 密钥文件内容为 base64 编码的原始密钥。校验器只有两种状态：
//! 未配置密钥时为 Disabled，成功加载后为 Armed，此后每次重载整体替换密钥。

use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha512;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};
use subtle::ConstantTimeEq;
use tokio::fs;
use tracing::info;

pub const OTP_STEP_SECS: u64 = 30;
pub const OTP_DIGITS: u32 = 8;
/// 允许前后各偏移一个时间步，吸收客户端时钟误差。
pub const OTP_WINDOW_STEPS: u64 = 1;

type HmacSha512 = Hmac<Sha512>;

#[derive(Debug, thiserror::Error)]
pub enum OtpError {
    #[error("failed to read otp key file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("otp key file {path} is not valid base64: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: base64::DecodeError,
    },
    #[error("otp key is empty")]
    EmptyKey,
}

/// TOTP 生成器：HMAC-SHA512，30 秒步长，8 位数字。
#[derive(Clone)]
pub struct Totp {
    mac: HmacSha512,
}

impl Totp {
    pub fn new(key: &[u8]) -> Result<Self, OtpError> {
        if key.is_empty() {
            return Err(OtpError::EmptyKey);
        }
        let mac = HmacSha512::new_from_slice(key).map_err(|_| OtpError::EmptyKey)?;
        Ok(Self { mac })
    }

    /// 生成指定 Unix 时间（秒）所在时间步的口令。
    pub fn generate(&self, unix_secs: u64) -> String {
        self.code_for_step(unix_secs / OTP_STEP_SECS)
    }

    /// 在 `±OTP_WINDOW_STEPS` 的窗口内校验口令。
    pub fn verify(&self, code: &str, unix_secs: u64) -> bool {
        let supplied = code.trim().as_bytes();
        let current = unix_secs / OTP_STEP_SECS;
        let first = current.saturating_sub(OTP_WINDOW_STEPS);
        let last = current.saturating_add(OTP_WINDOW_STEPS);
        let mut matched = false;
        for step in first..=last {
            let expected = self.code_for_step(step);
            matched |= bool::from(expected.as_bytes().ct_eq(supplied));
        }
        matched
    }

    fn code_for_step(&self, step: u64) -> String {
        let mut mac = self.mac.clone();
        mac.update(&step.to_be_bytes());
        let digest = mac.finalize().into_bytes();
        let offset = (digest[digest.len() - 1] & 0x0f) as usize;
        let binary = (u32::from(digest[offset] & 0x7f) << 24)
            | (u32::from(digest[offset + 1]) << 16)
            | (u32::from(digest[offset + 2]) << 8)
            | u32::from(digest[offset + 3]);
        let code = binary % 10u32.pow(OTP_DIGITS);
        format!("{code:0width$}", width = OTP_DIGITS as usize)
    }
}

impl std::fmt::Debug for Totp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Totp").finish_non_exhaustive()
    }
}

/// 可重载的口令校验器。
///
/// 读取方只克隆当前 `Arc<Totp>` 后即释放锁，校验计算不持有锁；
/// 重载时以一次赋值整体替换。
#[derive(Debug)]
pub struct OtpVerifier {
    key_file: Option<PathBuf>,
    current: RwLock<Option<Arc<Totp>>>,
}

impl OtpVerifier {
    pub fn new(key_file: Option<PathBuf>) -> Self {
        Self {
            key_file,
            current: RwLock::new(None),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.key_file.is_some()
    }

    /// 当前生效的生成器快照；`None` 表示无需口令。
    pub fn snapshot(&self) -> Option<Arc<Totp>> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// 从密钥文件重新加载。未配置密钥文件时为空操作。
    ///
    /// 失败时保留原有密钥。
    pub async fn reload(&self) -> Result<(), OtpError> {
        let Some(path) = self.key_file.as_deref() else {
            return Ok(());
        };
        let totp = load_key_file(path).await?;
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(totp));
        info!(path = ?path, "otp key loaded");
        Ok(())
    }
}

async fn load_key_file(path: &Path) -> Result<Totp, OtpError> {
    let content = fs::read_to_string(path)
        .await
        .map_err(|source| OtpError::Read {
            path: path.to_path_buf(),
            source,
        })?;
    let key = base64::engine::general_purpose::STANDARD
        .decode(content.trim())
        .map_err(|source| OtpError::Decode {
            path: path.to_path_buf(),
            source,
        })?;
    Totp::new(&key)
}

/// 当前 Unix 时间（秒）。
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

//! CLI arguments, environment configuration and validation.

use clap::{ArgAction, Parser};
use shadow_rs::formatcp;
use std::net::IpAddr;
use std::path::PathBuf;

use crate::background::DailySchedule;
use crate::build;

const VERSION_INFO: &str = formatcp!(
    r#"{}\ncommit_hash: {}\nbuild_time: {}\nbuild_env: {},{}"#,
    build::PKG_VERSION,
    build::SHORT_COMMIT,
    build::BUILD_TIME,
    build::RUST_VERSION,
    build::RUST_CHANNEL
);

pub const DEFAULT_STAGING_DIR: &str = "t53files";
pub const DEFAULT_HTTP_PORT: u16 = 9253;
/// 默认允许的跨域来源：本机调试与在线编辑器。
pub const DEFAULT_CORS_ORIGINS: &str = "http://localhost,http://127.0.0.1,https://edit.bsatroop53.com";
/// 文件名外层的哨兵扩展名（不含点）。
pub const SENTINEL_EXTENSION: &str = "bsat53";
/// 去掉哨兵扩展名后允许的内层扩展名：压缩包与文档。
pub const ALLOWED_INNER_EXTENSIONS: [&str; 2] = ["zip", "md"];
/// multipart 表单在文件内容之外的额外开销上限。
pub const MULTIPART_OVERHEAD_BYTES: u64 = 64 * 1024;
/// 未配置文件大小上限时的请求体上限（约 30 MB）。
pub const DEFAULT_BODY_LIMIT_BYTES: u64 = 30_000_000;

/// CLI arguments and environment configuration for the server.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "bsat53-upload-server",
    version = VERSION_INFO,
    about = "BSA Troop 53 upload server"
)]
pub struct Args {
    #[arg(
        long = "env",
        help = "The .env file that contains the environment variable settings"
    )]
    pub env_file: Option<PathBuf>,
    #[arg(
        short = 's',
        long,
        env = "T53_FILE_STAGING_DIRECTORY",
        default_value = DEFAULT_STAGING_DIR,
        help = "Directory uploaded files are staged in"
    )]
    pub staging_dir: String,
    #[arg(
        long,
        env = "T53_UPLOAD_USER_AGENT",
        help = "User agent required to upload (unset to allow any)"
    )]
    pub upload_user_agent: Option<String>,
    #[arg(
        long,
        env = "T53_MIN_FILE_SIZE",
        default_value_t = 0,
        allow_negative_numbers = true,
        help = "Minimum upload size in bytes (0 or less to disable)"
    )]
    pub min_file_size: i64,
    #[arg(
        long,
        env = "T53_MAX_FILE_SIZE",
        default_value_t = 0,
        allow_negative_numbers = true,
        help = "Maximum upload size in bytes (0 or less to disable)"
    )]
    pub max_file_size: i64,
    #[arg(
        long,
        env = "T53_OTP_KEY_FILE",
        help = "File containing the base64 OTP key (unset to disable)"
    )]
    pub otp_key_file: Option<PathBuf>,
    #[arg(
        long,
        env = "T53_START_MAINTENANCE",
        help = "Daily UTC time (HH:MM) the maintenance window starts"
    )]
    pub start_maintenance: Option<String>,
    #[arg(
        long,
        env = "T53_END_MAINTENANCE",
        help = "Daily UTC time (HH:MM) the maintenance window ends"
    )]
    pub end_maintenance: Option<String>,
    #[arg(
        long,
        env = "T53_RELOAD_KEY",
        help = "Daily UTC time (HH:MM) the OTP key file is re-read"
    )]
    pub reload_key: Option<String>,
    #[arg(
        short = 'b',
        long,
        env = "T53_BIND",
        default_value = "0.0.0.0",
        help = "Bind address"
    )]
    pub host: String,
    #[arg(
        short = 'p',
        long,
        env = "T53_HTTP_PORT",
        default_value_t = DEFAULT_HTTP_PORT,
        help = "HTTP port"
    )]
    pub port: u16,
    #[arg(
        long,
        env = "T53_CORS_ORIGINS",
        default_value = DEFAULT_CORS_ORIGINS,
        help = "Comma separated CORS origins (empty to disable CORS)"
    )]
    pub cors_origins: String,
    #[arg(
        long,
        env = "WEB_METRICS_URL",
        help = "Path Prometheus metrics are served from (unset to disable)"
    )]
    pub metrics_url: Option<String>,
    #[arg(long, env = "LOG_FILE", help = "File logs are also appended to")]
    pub log_file: Option<PathBuf>,
    #[arg(
        long,
        env = "WEB_BASE_PATH",
        help = "Path prefix when not served from the URL root"
    )]
    pub base_path: Option<String>,
    #[arg(
        long,
        env = "WEB_ALLOW_PORTS",
        default_value_t = true,
        action = ArgAction::Set,
        help = "Process requests whose Host header carries a port"
    )]
    pub allow_ports: bool,
    #[arg(
        long,
        env = "WEB_STRIP_DOUBLE_SLASH",
        default_value_t = false,
        action = ArgAction::Set,
        help = "Rewrite a leading '//' in request paths to '/'"
    )]
    pub strip_double_slash: bool,
}

/// 上传准入策略快照，每次请求只读。
///
/// 约定沿用“缺省即关闭”：未设置 User-Agent 表示不校验，
/// 大小上下限 `<= 0` 表示不限制，未设置密钥文件表示无需口令。
#[derive(Clone, Debug)]
pub struct UploadPolicy {
    pub staging_dir: PathBuf,
    pub required_user_agent: Option<String>,
    pub min_file_size: i64,
    pub max_file_size: i64,
    pub otp_key_file: Option<PathBuf>,
}

impl Default for UploadPolicy {
    fn default() -> Self {
        Self {
            staging_dir: PathBuf::from(DEFAULT_STAGING_DIR),
            required_user_agent: None,
            min_file_size: 0,
            max_file_size: 0,
            otp_key_file: None,
        }
    }
}

impl UploadPolicy {
    pub fn min_bytes(&self) -> Option<u64> {
        u64::try_from(self.min_file_size).ok().filter(|v| *v > 0)
    }

    pub fn max_bytes(&self) -> Option<u64> {
        u64::try_from(self.max_file_size).ok().filter(|v| *v > 0)
    }

    /// 请求体上限：文件上限加上 multipart 开销；未配置上限时使用默认值。
    pub fn body_limit(&self) -> usize {
        let limit = self
            .max_bytes()
            .map_or(DEFAULT_BODY_LIMIT_BYTES, |max| {
                max.saturating_add(MULTIPART_OVERHEAD_BYTES)
            });
        usize::try_from(limit).unwrap_or(usize::MAX)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid server configuration:\n  - {}", .0.join("\n  - "))]
    Invalid(Vec<String>),
}

/// 经过校验的完整服务配置。
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub policy: UploadPolicy,
    pub maintenance_start: Option<DailySchedule>,
    pub maintenance_end: Option<DailySchedule>,
    pub reload_key: Option<DailySchedule>,
    pub host: IpAddr,
    pub port: u16,
    pub cors_origins: Option<String>,
    pub metrics_url: Option<String>,
    pub base_path: String,
    pub allow_ports: bool,
    pub strip_double_slash: bool,
}

impl ServerConfig {
    /// 由命令行参数构建配置，并一次性收集所有校验错误。
    pub fn from_args(args: &Args) -> Result<Self, ConfigError> {
        let mut errors = Vec::new();

        let policy = UploadPolicy {
            staging_dir: PathBuf::from(args.staging_dir.trim()),
            required_user_agent: non_blank(args.upload_user_agent.as_deref()),
            min_file_size: args.min_file_size,
            max_file_size: args.max_file_size,
            otp_key_file: args
                .otp_key_file
                .clone()
                .filter(|path| !path.as_os_str().is_empty()),
        };

        if args.staging_dir.trim().is_empty() {
            errors.push("staging directory must not be empty".to_string());
        }
        if let (Some(min), Some(max)) = (policy.min_bytes(), policy.max_bytes())
            && min > max
        {
            errors.push(format!(
                "minimum file size ({min}) must not exceed maximum file size ({max})"
            ));
        }
        if let Some(path) = &policy.otp_key_file
            && !path.is_file()
        {
            errors.push(format!("{} file does not exist", path.display()));
        }

        let maintenance_start =
            parse_schedule("start maintenance", args.start_maintenance.as_deref(), &mut errors);
        let maintenance_end =
            parse_schedule("end maintenance", args.end_maintenance.as_deref(), &mut errors);
        let reload_key = parse_schedule("reload key", args.reload_key.as_deref(), &mut errors);

        let start_set = non_blank(args.start_maintenance.as_deref()).is_some();
        let end_set = non_blank(args.end_maintenance.as_deref()).is_some();
        if start_set != end_set {
            errors.push(
                "maintenance window needs both a start and an end time".to_string(),
            );
        }
        if reload_key.is_some() && policy.otp_key_file.is_none() {
            errors.push("reload key time is set but no otp key file is configured".to_string());
        }

        let host = match args.host.trim().parse::<IpAddr>() {
            Ok(host) => Some(host),
            Err(err) => {
                errors.push(format!("invalid bind address {}: {err}", args.host));
                None
            }
        };

        let base_path = non_blank(args.base_path.as_deref())
            .map(|path| path.trim_end_matches('/').to_string())
            .unwrap_or_default();
        if !base_path.is_empty() && !base_path.starts_with('/') {
            errors.push(format!("base path must start with a '/'. Got: {base_path}"));
        }

        let metrics_url = non_blank(args.metrics_url.as_deref());
        if let Some(url) = &metrics_url {
            if !url.starts_with('/') {
                errors.push(format!("metrics url must start with a '/'. Got: {url}"));
            } else if url.len() <= 1 {
                errors.push(format!("metrics url must be 2 or more characters. Got: {url}"));
            }
        }

        match host {
            Some(host) if errors.is_empty() => Ok(Self {
                policy,
                maintenance_start,
                maintenance_end,
                reload_key,
                host,
                port: args.port,
                cors_origins: non_blank(Some(args.cors_origins.as_str())),
                metrics_url,
                base_path,
                allow_ports: args.allow_ports,
                strip_double_slash: args.strip_double_slash,
            }),
            _ => Err(ConfigError::Invalid(errors)),
        }
    }
}

fn non_blank(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn parse_schedule(
    name: &str,
    value: Option<&str>,
    errors: &mut Vec<String>,
) -> Option<DailySchedule> {
    let value = non_blank(value)?;
    match value.parse::<DailySchedule>() {
        Ok(schedule) => Some(schedule),
        Err(err) => {
            errors.push(format!("{name} time is invalid: {err}"));
            None
        }
    }
}

//! BSA Troop 53 upload server binary.
//!
//! Accepts `.bsat53` uploads from a small set of trusted clients and stages
//! them on disk. The main entry point loads configuration, initializes the
//! upload pipeline, schedules maintenance windows and key reloads, and starts
//! the HTTP listener.

mod api;
mod atomic;
mod background;
mod config;
mod error;
mod home;
mod http;
mod logging;
mod maintenance;
mod metrics;
mod otp;
mod status;
mod storage;
mod timestamp;
mod upload;
mod version;

use axum::extract::{DefaultBodyLimit, Extension, Request, connect_info::ConnectInfo};
use axum::routing::{get, post};
use axum::{Router, middleware};
use axum_server::Handle;
use chrono::Utc;
use clap::Parser;
use shadow_rs::shadow;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower::Layer;
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, error, info, info_span};

use crate::api::UploadApi;
use crate::background::{apply_initial_window, spawn_background_tasks};
use crate::config::{Args, ServerConfig};
use crate::http::build_cors_layer;
use crate::metrics::LogMetrics;

shadow!(build);

/// Starts the upload server and blocks until shutdown.
#[tokio::main]
async fn main() -> Result<(), io::Error> {
    let mut args = Args::parse();
    let env_file = args.env_file.clone();
    if let Some(env_file) = &env_file {
        dotenvy::from_path(env_file)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err.to_string()))?;
        args = Args::parse();
    }

    let log_metrics = match args.metrics_url.as_deref().map(str::trim) {
        Some(url) if !url.is_empty() => Some(Arc::new(
            LogMetrics::new().map_err(|err| io::Error::other(err.to_string()))?,
        )),
        _ => None,
    };
    logging::init_logging(args.log_file.as_deref(), log_metrics.as_deref())?;
    if let Some(env_file) = &env_file {
        info!(path = ?env_file, "using .env file");
    }
    info!(
        log_file = ?args.log_file,
        metrics = log_metrics.is_some(),
        "logging initialized"
    );

    let config = ServerConfig::from_args(&args).map_err(|err| {
        error!("{err}");
        io::Error::new(io::ErrorKind::InvalidInput, err.to_string())
    })?;

    let api = Arc::new(UploadApi::new(config.policy.clone()));
    api.init().await.map_err(|err| {
        error!(error = %err, "failed to initialize upload api");
        io::Error::other(err)
    })?;
    info!(staging_dir = ?api.staging_dir(), "upload api ready");
    apply_initial_window(&api, &config, Utc::now());

    let app = build_service(api.clone(), &config, log_metrics);

    let addr = SocketAddr::new(config.host, config.port);
    let handle = Handle::new();

    info!("🚀 Starting HTTP server at {}", addr);

    let server = axum_server::bind(addr)
        .handle(handle.clone())
        .serve(app.into_make_service_with_connect_info::<SocketAddr>());

    spawn_background_tasks(api, &config);
    tokio::select! {
        result = server => result?,
        _ = shutdown_signal(handle) => {}
    }

    info!("application exiting");
    Ok(())
}

/// 交给 axum-server 的完整服务。
///
/// 路径改写包裹在路由之外，外层 Router 只负责把连接层的请求体
/// 转成 axum 的 `Body` 后交给它。
fn build_service(
    api: Arc<UploadApi>,
    config: &ServerConfig,
    log_metrics: Option<Arc<LogMetrics>>,
) -> Router {
    let app = build_app(api, config, log_metrics);
    Router::new().fallback_service(
        middleware::from_fn_with_state(config.strip_double_slash, http::strip_double_slash)
            .layer(app),
    )
}

/// 组装路由与中间件（不含路径改写）。
fn build_app(
    api: Arc<UploadApi>,
    config: &ServerConfig,
    log_metrics: Option<Arc<LogMetrics>>,
) -> Router {
    let body_limit = DefaultBodyLimit::max(config.policy.body_limit());

    let mut routes = Router::new()
        .route("/", get(home::index))
        .route("/robots.txt", get(home::robots_txt))
        .route("/datetime.txt", get(home::datetime_txt))
        .route("/privacy.html", get(home::privacy))
        .route("/license.html", get(home::license))
        .route("/credits.html", get(home::credits))
        .route("/api/version", get(version::get_version_info))
        .route("/upload", post(upload::upload_file).layer(body_limit))
        .fallback(home::not_found);

    if let (Some(url), Some(log_metrics)) = (config.metrics_url.as_deref(), log_metrics) {
        routes = routes.route(url, get(metrics::serve_metrics).layer(Extension(log_metrics)));
    }

    let mut app = if config.base_path.is_empty() {
        routes
    } else {
        Router::new()
            .nest(&config.base_path, routes)
            .fallback(home::not_found)
    };

    if !config.allow_ports {
        app = app.layer(middleware::from_fn(http::reject_ported_hosts));
    }

    app = app
        .layer(middleware::from_fn(http::add_security_headers))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &Request<_>| {
                    let forwarded_ip =
                        http::extract_forwarded_ip(request.headers()).map(|ip| ip.to_string());
                    let connect_ip = request
                        .extensions()
                        .get::<ConnectInfo<SocketAddr>>()
                        .map(|ConnectInfo(addr)| addr.to_string());
                    let client_ip = forwarded_ip
                        .or(connect_ip)
                        .unwrap_or_else(|| "unknown".to_string());

                    info_span!(
                        env!("CARGO_CRATE_NAME"),
                        client_ip,
                        method = ?request.method(),
                        path = ?request.uri().path(),
                    )
                })
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
        )
        .layer(Extension(api));

    if let Some(cors_layer) = build_cors_layer(config.cors_origins.as_deref()) {
        app = app.layer(cors_layer);
    }

    app
}

async fn shutdown_signal(handle: Handle) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Received termination signal shutting down");
    handle.graceful_shutdown(Some(Duration::from_secs(10)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{StatusCode, header};
    use http_body_util::BodyExt;
    use std::path::Path;
    use tempfile::{TempDir, tempdir};
    use tower::ServiceExt as _;

    use crate::status::UploadStatus;

    const BOUNDARY: &str = "t53boundary";

    fn make_config(temp: &TempDir, extra: &[&str]) -> ServerConfig {
        let staging = temp.path().join("staging");
        let mut argv = vec![
            "bsat53-upload-server".to_string(),
            "--staging-dir".to_string(),
            staging.to_string_lossy().to_string(),
        ];
        argv.extend(extra.iter().map(|arg| arg.to_string()));
        ServerConfig::from_args(&Args::try_parse_from(argv).expect("args")).expect("config")
    }

    async fn make_app(config: &ServerConfig) -> (Arc<UploadApi>, Router) {
        let api = Arc::new(UploadApi::new(config.policy.clone()));
        api.init().await.expect("init");
        let app = build_app(api.clone(), config, None);
        (api, app)
    }

    fn multipart_body(file: Option<(&str, &[u8])>, key: Option<&str>) -> Vec<u8> {
        let mut body = Vec::new();
        if let Some((name, data)) = file {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{name}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
                )
                .as_bytes(),
            );
            body.extend_from_slice(data);
            body.extend_from_slice(b"\r\n");
        }
        if let Some(key) = key {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"key\"\r\n\r\n{key}\r\n"
                )
                .as_bytes(),
            );
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
        body
    }

    fn upload_request(path: &str, user_agent: Option<&str>, body: Vec<u8>) -> axum::http::Request<Body> {
        let mut builder = axum::http::Request::builder()
            .method("POST")
            .uri(path)
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            );
        if let Some(agent) = user_agent {
            builder = builder.header(header::USER_AGENT, agent);
        }
        builder.body(Body::from(body)).expect("request")
    }

    async fn body_text(response: axum::response::Response) -> String {
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("collect body")
            .to_bytes();
        String::from_utf8(bytes.to_vec()).expect("utf8 body")
    }

    fn staged_count(dir: &Path) -> usize {
        std::fs::read_dir(dir).expect("read staging").count()
    }

    #[tokio::test]
    async fn upload_route_stores_file() {
        let temp = tempdir().expect("tempdir");
        let config = make_config(&temp, &[]);
        let (api, app) = make_app(&config).await;

        let body = multipart_body(Some(("notes.md.bsat53", b"# hello")), None);
        let response = app
            .oneshot(upload_request("/upload", Some("curl"), body))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::X_FRAME_OPTIONS).expect("header"),
            "DENY"
        );
        assert_eq!(body_text(response).await, UploadStatus::Success.message());

        let entries = std::fs::read_dir(api.staging_dir())
            .expect("read staging")
            .map(|entry| entry.expect("entry").path())
            .collect::<Vec<_>>();
        assert_eq!(entries.len(), 1);
        let name = entries[0].file_name().expect("name").to_string_lossy().to_string();
        assert!(name.ends_with("_notes.md.bsat53"), "{name}");
        assert_eq!(std::fs::read(&entries[0]).expect("read"), b"# hello");
    }

    #[tokio::test]
    async fn upload_route_maps_rejections_to_bad_request() {
        let temp = tempdir().expect("tempdir");
        let config = make_config(&temp, &["--upload-user-agent", "Some Agent"]);
        let (api, app) = make_app(&config).await;

        let body = multipart_body(Some(("notes.md.bsat53", b"x")), None);
        let response = app
            .oneshot(upload_request("/upload", Some("A different agent"), body))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            body_text(response).await,
            UploadStatus::InvalidUserAgent.message()
        );
        assert_eq!(staged_count(api.staging_dir()), 0);
    }

    #[tokio::test]
    async fn upload_route_reports_maintenance() {
        let temp = tempdir().expect("tempdir");
        let config = make_config(&temp, &[]);
        let (api, app) = make_app(&config).await;
        api.set_maintenance_mode(true);

        let body = multipart_body(Some(("notes.md.bsat53", b"x")), None);
        let response = app
            .oneshot(upload_request("/upload", None, body))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(staged_count(api.staging_dir()), 0);
    }

    #[tokio::test]
    async fn upload_route_requires_file_part() {
        let temp = tempdir().expect("tempdir");
        let config = make_config(&temp, &[]);
        let (_api, app) = make_app(&config).await;

        let response = app
            .oneshot(upload_request("/upload", None, multipart_body(None, Some("12345678"))))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_text(response).await, "File is null");
    }

    #[tokio::test]
    async fn upload_route_reads_key_field() {
        let temp = tempdir().expect("tempdir");
        let key_path = temp.path().join("otp.key");
        std::fs::write(&key_path, "dHJvb3AgNTMga2V5").expect("write key");
        let config = make_config(&temp, &["--otp-key-file", key_path.to_str().expect("utf8")]);
        let (_api, app) = make_app(&config).await;

        let response = app
            .clone()
            .oneshot(upload_request(
                "/upload",
                None,
                multipart_body(Some(("a.zip.bsat53", b"x")), None),
            ))
            .await
            .expect("response");
        assert_eq!(body_text(response).await, UploadStatus::MissingKey.message());

        let totp = otp::Totp::new(b"troop 53 key").expect("totp");
        let code = totp.generate(otp::unix_now());
        let response = app
            .oneshot(upload_request(
                "/upload",
                None,
                multipart_body(Some(("a.zip.bsat53", b"x")), Some(&code)),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn oversized_body_is_rejected_before_staging() {
        let temp = tempdir().expect("tempdir");
        let config = make_config(&temp, &["--max-file-size", "3"]);
        let (api, app) = make_app(&config).await;

        let payload = vec![b'x'; 256 * 1024];
        let body = multipart_body(Some(("big.zip.bsat53", &payload)), None);
        let response = app
            .oneshot(upload_request("/upload", None, body))
            .await
            .expect("response");

        assert!(response.status().is_client_error(), "{}", response.status());
        assert_eq!(staged_count(api.staging_dir()), 0);
    }

    #[tokio::test]
    async fn unbounded_config_still_caps_request_body() {
        let temp = tempdir().expect("tempdir");
        let config = make_config(&temp, &[]);
        let (api, app) = make_app(&config).await;

        let limit = usize::try_from(crate::config::DEFAULT_BODY_LIMIT_BYTES).expect("limit");
        let payload = vec![b'x'; limit + 1];
        let body = multipart_body(Some(("huge.zip.bsat53", &payload)), None);
        let response = app
            .oneshot(upload_request("/upload", None, body))
            .await
            .expect("response");

        assert!(response.status().is_client_error(), "{}", response.status());
        assert_eq!(staged_count(api.staging_dir()), 0);
    }

    #[tokio::test]
    async fn streamed_length_drives_size_checks() {
        let temp = tempdir().expect("tempdir");
        let config = make_config(&temp, &["--min-file-size", "4", "--max-file-size", "6"]);
        let (api, app) = make_app(&config).await;

        for (contents, expected) in [
            (&b"abc"[..], UploadStatus::FileTooSmall),
            (&b"abcdefg"[..], UploadStatus::FileTooBig),
            (&b"abcd"[..], UploadStatus::Success),
        ] {
            let body = multipart_body(Some(("notes.md.bsat53", contents)), None);
            let response = app
                .clone()
                .oneshot(upload_request("/upload", None, body))
                .await
                .expect("response");
            assert_eq!(body_text(response).await, expected.message());
        }
        assert_eq!(staged_count(api.staging_dir()), 1);
    }

    #[tokio::test]
    async fn base_path_prefixes_routes() {
        let temp = tempdir().expect("tempdir");
        let config = make_config(&temp, &["--base-path", "/t53"]);
        let (_api, app) = make_app(&config).await;

        let response = app
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .uri("/t53/robots.txt")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_text(response).await.contains("Disallow: /"));

        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/robots.txt")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn ported_hosts_are_rejected_when_disallowed() {
        let temp = tempdir().expect("tempdir");
        let config = make_config(&temp, &["--allow-ports", "false"]);
        let (_api, app) = make_app(&config).await;

        let response = app
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .uri("/")
                    .header(header::HOST, "uploads.example.com:9253")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/")
                    .header(header::HOST, "uploads.example.com")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
    }

    fn get_request(path: &str) -> axum::http::Request<Body> {
        axum::http::Request::builder()
            .uri(path)
            .body(Body::empty())
            .expect("request")
    }

    #[tokio::test]
    async fn double_slash_is_rewritten_before_routing() {
        let temp = tempdir().expect("tempdir");
        let config = make_config(&temp, &["--strip-double-slash", "true"]);
        let api = Arc::new(UploadApi::new(config.policy.clone()));
        api.init().await.expect("init");
        let app = build_service(api, &config, None);

        let response = app
            .oneshot(get_request("//robots.txt"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn service_answers_over_tcp() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let temp = tempdir().expect("tempdir");
        let config = make_config(&temp, &["--strip-double-slash", "true"]);
        let api = Arc::new(UploadApi::new(config.policy.clone()));
        api.init().await.expect("init");
        let app = build_service(api, &config, None);

        let handle = Handle::new();
        let server = axum_server::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
            .handle(handle.clone())
            .serve(app.into_make_service_with_connect_info::<SocketAddr>());
        tokio::spawn(server);
        let addr = handle.listening().await.expect("listening");

        let mut stream = tokio::net::TcpStream::connect(addr).await.expect("connect");
        stream
            .write_all(b"GET //robots.txt HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .expect("write request");
        let mut raw = Vec::new();
        stream.read_to_end(&mut raw).await.expect("read response");
        let text = String::from_utf8_lossy(&raw);

        assert!(text.starts_with("HTTP/1.1 200"), "{text}");
        assert!(text.contains("Disallow: /"), "{text}");
        handle.shutdown();
    }

    #[tokio::test]
    async fn datetime_reports_utc_ticks() {
        let temp = tempdir().expect("tempdir");
        let config = make_config(&temp, &[]);
        let (_api, app) = make_app(&config).await;

        let response = app
            .oneshot(get_request("/datetime.txt"))
            .await
            .expect("response");
        let text = body_text(response).await;
        assert_eq!(text.len(), 18, "{text}");
        let reported: i64 = text.parse().expect("ticks");
        let expected = home::utc_ticks(Utc::now());
        assert!((expected - reported).abs() <= 5 * 10_000_000, "{reported} vs {expected}");
    }

    #[tokio::test]
    async fn default_cors_allows_editor_preflight() {
        let temp = tempdir().expect("tempdir");
        let config = make_config(&temp, &[]);
        let (_api, app) = make_app(&config).await;

        let preflight = |origin: &str| {
            axum::http::Request::builder()
                .method("OPTIONS")
                .uri("/upload")
                .header(header::ORIGIN, origin)
                .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
                .body(Body::empty())
                .expect("request")
        };

        let response = app
            .clone()
            .oneshot(preflight("https://edit.bsatroop53.com"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response
                .headers()
                .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
                .expect("allow origin"),
            "https://edit.bsatroop53.com"
        );

        let response = app
            .oneshot(preflight("https://elsewhere.example"))
            .await
            .expect("response");
        assert!(
            response
                .headers()
                .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
                .is_none()
        );
    }

    #[tokio::test]
    async fn empty_key_field_is_an_invalid_key() {
        let temp = tempdir().expect("tempdir");
        let key_path = temp.path().join("otp.key");
        std::fs::write(&key_path, "dHJvb3AgNTMga2V5").expect("write key");
        let config = make_config(&temp, &["--otp-key-file", key_path.to_str().expect("utf8")]);
        let (api, app) = make_app(&config).await;

        let response = app
            .oneshot(upload_request(
                "/upload",
                None,
                multipart_body(Some(("a.zip.bsat53", b"x")), Some("  ")),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_text(response).await, UploadStatus::InvalidKey.message());
        assert_eq!(staged_count(api.staging_dir()), 0);
    }

    #[tokio::test]
    async fn info_pages_and_privacy_redirect() {
        let temp = tempdir().expect("tempdir");
        let config = make_config(&temp, &[]);
        let (_api, app) = make_app(&config).await;

        let response = app
            .clone()
            .oneshot(get_request("/privacy.html"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(
            response.headers().get(header::LOCATION).expect("location"),
            "https://edit.bsatroop53.com/privacy"
        );

        let response = app
            .clone()
            .oneshot(get_request("/license.html"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_text(response).await.contains("GNU Affero General Public License"));

        let response = app
            .oneshot(get_request("/credits.html"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn metrics_route_only_when_configured() {
        let temp = tempdir().expect("tempdir");
        let config = make_config(&temp, &[]);
        let (_api, app) = make_app(&config).await;
        let response = app
            .oneshot(get_request("/metrics"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let config = make_config(&temp, &["--metrics-url", "/metrics"]);
        let api = Arc::new(UploadApi::new(config.policy.clone()));
        api.init().await.expect("init");
        let log_metrics = Arc::new(LogMetrics::new().expect("metrics"));
        let app = build_app(api, &config, Some(log_metrics));

        let response = app
            .oneshot(get_request("/metrics"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let text = body_text(response).await;
        assert!(text.contains(metrics::WARNINGS_LOGGED), "{text}");
        assert!(text.contains(metrics::ERRORS_LOGGED), "{text}");
    }
}

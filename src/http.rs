//! HTTP 辅助工具：CORS、安全头、端口过滤与路径改写。

use axum::body::Body as AxumBody;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, Uri, header};
use axum::{middleware, response::Response};
use std::net::IpAddr;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::warn;

/// 构建 CORS Layer（支持逗号分隔的来源列表）。
pub fn build_cors_layer(cors_origins: Option<&str>) -> Option<CorsLayer> {
    let origins = cors_origins?
        .split(',')
        .map(|origin| origin.trim())
        .filter(|origin| !origin.is_empty())
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin, "invalid cors origin");
                None
            }
        })
        .collect::<Vec<_>>();

    if origins.is_empty() {
        return None;
    }

    Some(
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
            .allow_headers(Any),
    )
}

/// 从 `x-forwarded-for` 解析客户端 IP。
pub fn extract_forwarded_ip(headers: &HeaderMap) -> Option<IpAddr> {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .and_then(|value| value.parse::<IpAddr>().ok())
}

/// 添加基础安全响应头。
pub async fn add_security_headers(
    request: Request<AxumBody>,
    next: middleware::Next,
) -> Result<Response, StatusCode> {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    Ok(response)
}

/// 拒绝 Host 头中带端口的请求（服务应只经由反向代理的默认端口访问）。
pub async fn reject_ported_hosts(
    request: Request<AxumBody>,
    next: middleware::Next,
) -> Result<Response, StatusCode> {
    if host_has_port(request.headers(), request.uri()) {
        return Err(StatusCode::BAD_REQUEST);
    }
    Ok(next.run(request).await)
}

fn host_has_port(headers: &HeaderMap, uri: &Uri) -> bool {
    if uri.port().is_some() {
        return true;
    }
    let Some(host) = headers.get(header::HOST).and_then(|v| v.to_str().ok()) else {
        return false;
    };
    // IPv6 字面量形如 `[::1]:8080`，端口在右括号之后。
    let after_bracket = host.rsplit_once(']').map_or(host, |(_, rest)| rest);
    after_bracket.contains(':')
}

/// 启用时把以 `//` 开头的请求路径中的 `//` 替换为 `/`。
///
/// 需包裹在整个 Router 之外，才能在路由匹配之前生效。
pub async fn strip_double_slash(
    State(enabled): State<bool>,
    mut request: Request<AxumBody>,
    next: middleware::Next,
) -> Response {
    if enabled && let Some(rewritten) = rewrite_double_slash(request.uri()) {
        *request.uri_mut() = rewritten;
    }
    next.run(request).await
}

fn rewrite_double_slash(uri: &Uri) -> Option<Uri> {
    let path = uri.path();
    if !path.starts_with("//") {
        return None;
    }
    let mut path = path.to_string();
    while path.contains("//") {
        path = path.replace("//", "/");
    }
    let path_and_query = match uri.query() {
        Some(query) => format!("{path}?{query}"),
        None => path,
    };
    let mut parts = uri.clone().into_parts();
    parts.path_and_query = path_and_query.parse().ok();
    Uri::from_parts(parts).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cors_layer_requires_origins() {
        assert!(build_cors_layer(None).is_none());
        assert!(build_cors_layer(Some(" , ")).is_none());
        assert!(build_cors_layer(Some("https://edit.bsatroop53.com")).is_some());
    }

    #[test]
    fn forwarded_ip_uses_first_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("10.0.0.1, 192.168.0.1"),
        );
        assert_eq!(
            extract_forwarded_ip(&headers),
            Some("10.0.0.1".parse().expect("ip"))
        );
    }

    #[test]
    fn detects_ports_in_host() {
        let uri: Uri = "/upload".parse().expect("uri");
        let mut headers = HeaderMap::new();
        assert!(!host_has_port(&headers, &uri));
        headers.insert(header::HOST, HeaderValue::from_static("example.com"));
        assert!(!host_has_port(&headers, &uri));
        headers.insert(header::HOST, HeaderValue::from_static("[::1]"));
        assert!(!host_has_port(&headers, &uri));
        headers.insert(header::HOST, HeaderValue::from_static("example.com:8080"));
        assert!(host_has_port(&headers, &uri));
        headers.insert(header::HOST, HeaderValue::from_static("[::1]:8080"));
        assert!(host_has_port(&headers, &uri));
    }

    #[test]
    fn rewrites_only_leading_double_slash() {
        let uri: Uri = "//upload?x=1".parse().expect("uri");
        assert_eq!(
            rewrite_double_slash(&uri).expect("rewritten").to_string(),
            "/upload?x=1"
        );
        let uri: Uri = "/upload//x".parse().expect("uri");
        assert!(rewrite_double_slash(&uri).is_none());
    }
}

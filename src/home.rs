//! 首页、robots.txt、服务器时间与说明页面。

use axum::http::{StatusCode, header};
use axum::response::{Html, IntoResponse};
use chrono::{DateTime, Utc};

use crate::error::ApiError;

const BANNER: &str = "BSA Troop 53 upload server.\n";

const ROBOTS_TXT: &str = "User-agent: *\nDisallow: /\n";

const PRIVACY_URL: &str = "https://edit.bsatroop53.com/privacy";

/// 0001-01-01T00:00:00Z 到 Unix 纪元的 100 纳秒刻度数。
pub const TICKS_AT_UNIX_EPOCH: i64 = 621_355_968_000_000_000;
const TICKS_PER_SECOND: i64 = 10_000_000;

const LICENSE_HTML: &str = r#"<!DOCTYPE html>
<html lang="en">
<head><meta charset="utf-8"><title>License - BSA Troop 53 Upload Server</title></head>
<body>
<h1>License</h1>
<p>BSA Troop 53 Upload Server<br>Copyright (C) 2024 Seth Hendrick</p>
<p>This program is free software: you can redistribute it and/or modify
it under the terms of the GNU Affero General Public License as published
by the Free Software Foundation, either version 3 of the License, or
any later version.</p>
<p>This program is distributed in the hope that it will be useful,
but WITHOUT ANY WARRANTY; without even the implied warranty of
MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
GNU Affero General Public License for more details.</p>
<p>You should have received a copy of the GNU Affero General Public License
along with this program. If not, see
<a href="https://www.gnu.org/licenses/">https://www.gnu.org/licenses/</a>.</p>
</body>
</html>
"#;

const CREDITS_HTML: &str = r#"<!DOCTYPE html>
<html lang="en">
<head><meta charset="utf-8"><title>Credits - BSA Troop 53 Upload Server</title></head>
<body>
<h1>Credits</h1>
<p>This server is built on the following open source projects:</p>
<ul>
<li>axum, axum-server, tower and tower-http (MIT)</li>
<li>tokio (MIT)</li>
<li>tracing and tracing-subscriber (MIT)</li>
<li>prometheus (Apache-2.0)</li>
<li>clap, dotenvy, chrono, serde, uuid and thiserror (MIT / Apache-2.0)</li>
<li>hmac, sha2, subtle and base64 (MIT / Apache-2.0 / BSD-3-Clause)</li>
<li>shadow-rs (MIT)</li>
</ul>
</body>
</html>
"#;

/// 首页横幅。
pub async fn index() -> impl IntoResponse {
    BANNER
}

/// 禁止所有爬虫，这里没有可索引的内容。
pub async fn robots_txt() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "text/plain")], ROBOTS_TXT)
}

pub async fn license() -> Html<&'static str> {
    Html(LICENSE_HTML)
}

pub async fn credits() -> Html<&'static str> {
    Html(CREDITS_HTML)
}

/// 隐私说明由在线编辑器站点维护。
pub async fn privacy() -> impl IntoResponse {
    (StatusCode::FOUND, [(header::LOCATION, PRIVACY_URL)])
}

/// 返回服务器当前 UTC 时间的刻度数（自 0001-01-01 起的 100 纳秒数），
/// 客户端据此检查口令时钟偏差。
pub async fn datetime_txt() -> impl IntoResponse {
    (
        [(header::CACHE_CONTROL, "no-store")],
        utc_ticks(Utc::now()).to_string(),
    )
}

pub fn utc_ticks(now: DateTime<Utc>) -> i64 {
    TICKS_AT_UNIX_EPOCH
        + now.timestamp() * TICKS_PER_SECOND
        + i64::from(now.timestamp_subsec_nanos() / 100)
}

pub async fn not_found() -> ApiError {
    ApiError::NotFound("not found".into())
}

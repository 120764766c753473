//! Outbound media uploads: `POST /upload` (configured uploader) and `POST /expose` (public paste
//! hosts).

use crate::error::GatewayError;
use crate::http::AppState;
use anyhow::{Context as _, bail};
use axum::{
    Json,
    extract::{State, rejection::JsonRejection},
};
use base64::Engine as _;
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;

/// Public paste hosts tried by `/expose`, in order.
#[derive(Debug, Clone)]
pub(crate) struct PasteHosts {
    pub zero_x0: String,
    pub transfer_sh: String,
    pub file_io: String,
}

impl Default for PasteHosts {
    fn default() -> Self {
        Self {
            zero_x0: "https://0x0.st".to_string(),
            transfer_sh: "https://transfer.sh".to_string(),
            file_io: "https://file.io".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct UrlRequest {
    #[serde(default)]
    url: Option<String>,
}

impl UrlRequest {
    fn source(self) -> Result<String, GatewayError> {
        self.url
            .map(|u| u.trim().to_string())
            .filter(|u| !u.is_empty())
            .ok_or_else(|| GatewayError::bad_request("url_required", "url is required"))
    }
}

fn is_data_url(s: &str) -> bool {
    s.get(..5).is_some_and(|p| p.eq_ignore_ascii_case("data:"))
}

/// Decode a `data:<mime>;base64,<payload>` URL.
pub(crate) fn decode_data_url(url: &str) -> anyhow::Result<Vec<u8>> {
    if !is_data_url(url) {
        bail!("not a data URL");
    }
    let (meta, payload) = url[5..]
        .split_once(',')
        .context("unsupported data URL")?;
    let is_base64 = meta
        .len()
        .checked_sub(";base64".len())
        .and_then(|cut| meta.get(cut..))
        .is_some_and(|t| t.eq_ignore_ascii_case(";base64"));
    if !is_base64 || payload.is_empty() {
        bail!("unsupported data URL");
    }
    base64::engine::general_purpose::STANDARD
        .decode(payload.trim())
        .context("decode base64 payload")
}

/// Media type of a data URL (`""` when omitted).
fn data_url_mime(src: &str) -> &str {
    src.get(5..)
        .and_then(|rest| rest.split([';', ',']).next())
        .unwrap_or_default()
}

/// Load a source URL into memory. `data:` URLs are decoded locally.
pub(crate) async fn fetch_bytes(http: &reqwest::Client, url: &str) -> anyhow::Result<Vec<u8>> {
    if is_data_url(url) {
        return decode_data_url(url);
    }
    let resp = http
        .get(url)
        .send()
        .await
        .with_context(|| format!("download {url}"))?;
    let status = resp.status();
    if status.as_u16() >= 400 {
        bail!("download failed: {}", status.as_u16());
    }
    let bytes = resp.bytes().await.context("read download body")?;
    Ok(bytes.to_vec())
}

/// Content type from magic bytes, then from the file extension.
pub(crate) fn sniff_content_type(name: &str, bytes: &[u8]) -> &'static str {
    if bytes.starts_with(&[0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a]) {
        return "image/png";
    }
    if bytes.starts_with(&[0xff, 0xd8]) {
        return "image/jpeg";
    }
    if bytes.starts_with(b"GIF8") {
        return "image/gif";
    }
    if bytes.starts_with(b"RIFF") && bytes.get(8..12) == Some(b"WEBP".as_slice()) {
        return "image/webp";
    }

    let ext = name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "mov" => "video/quicktime",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        _ => "application/octet-stream",
    }
}

/// Replace anything outside `[A-Za-z0-9._-]` with `_`.
pub(crate) fn sanitize_filename(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn last_path_segment(url: &reqwest::Url) -> String {
    url.path().rsplit('/').next().unwrap_or_default().to_string()
}

fn parse_source_url(src: &str) -> Result<reqwest::Url, GatewayError> {
    reqwest::Url::parse(src)
        .map_err(|e| GatewayError::bad_request("invalid_url", format!("invalid url: {e}")))
}

fn data_url_filename(src: &str) -> String {
    let mime = data_url_mime(src).to_ascii_lowercase();
    let ext = if mime.contains("png") {
        "png"
    } else if mime.contains("jpeg") || mime.contains("jpg") {
        "jpg"
    } else if mime.contains("webp") {
        "webp"
    } else if mime.contains("gif") {
        "gif"
    } else {
        "bin"
    };
    format!("image_{}.{ext}", chrono::Utc::now().timestamp_millis())
}

pub(crate) struct UploadReply {
    pub status: u16,
    pub body: String,
}

/// Multipart POST with `Authorization: Bearer <key>`.
pub(crate) async fn upload_with_bearer(
    http: &reqwest::Client,
    endpoint: &str,
    api_key: &str,
    field: &str,
    filename: &str,
    bytes: &[u8],
) -> anyhow::Result<UploadReply> {
    let part = reqwest::multipart::Part::bytes(bytes.to_vec())
        .file_name(filename.to_string())
        .mime_str(sniff_content_type(filename, bytes))
        .context("build multipart part")?;
    let form = reqwest::multipart::Form::new().part(field.to_string(), part);
    let resp = http
        .post(endpoint)
        .bearer_auth(api_key)
        .multipart(form)
        .send()
        .await
        .with_context(|| format!("POST {endpoint}"))?;
    let status = resp.status().as_u16();
    let body = resp.text().await.context("read uploader response")?;
    Ok(UploadReply { status, body })
}

fn first_http_url(text: &str) -> Option<String> {
    let mut from = 0;
    while let Some(pos) = text[from..].find("http") {
        let start = from + pos;
        let rest = &text[start..];
        let after = rest
            .strip_prefix("https://")
            .or_else(|| rest.strip_prefix("http://"));
        if let Some(after) = after
            && after.chars().next().is_some_and(|c| !c.is_whitespace())
        {
            let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
            return Some(rest[..end].to_string());
        }
        from = start + 4;
    }
    None
}

/// Pull the uploaded URL out of an uploader response (JSON fields first, then plain text).
pub(crate) fn extract_upload_url(body: &str) -> Option<String> {
    if let Ok(v) = serde_json::from_str::<Value>(body) {
        let found = ["/url", "/uploaded_url", "/data/url", "/result/url", "/file/url", "/files/0/url"]
            .iter()
            .filter_map(|ptr| v.pointer(ptr).and_then(Value::as_str))
            .find(|s| !s.is_empty());
        if let Some(url) = found {
            return Some(url.to_string());
        }
    }
    first_http_url(body)
}

/// `POST /upload {url}`: fetch the source and hand it to the configured uploader.
pub(crate) async fn post_upload(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<UrlRequest>, JsonRejection>,
) -> Result<Json<Value>, GatewayError> {
    let Json(req) = payload?;
    let src = req.source()?;
    let upload = &state.config.upload;
    let (Some(endpoint), Some(api_key)) = (upload.url.as_deref(), upload.api_key.as_deref()) else {
        return Err(GatewayError::internal(
            "upload_not_configured",
            "UPLOAD_URL / UPLOAD_API_KEY not set",
        ));
    };

    let filename = if is_data_url(&src) {
        data_url_filename(&src)
    } else {
        let url = parse_source_url(&src)?;
        let segment = last_path_segment(&url);
        sanitize_filename(if segment.is_empty() { "image.png" } else { &segment })
    };

    let bytes = fetch_bytes(&state.media_http, &src)
        .await
        .map_err(crate::error::internal_error("upload_failed"))?;

    let field = upload.field_name.as_str();
    let mut reply = upload_with_bearer(&state.media_http, endpoint, api_key, field, &filename, &bytes)
        .await
        .map_err(crate::error::internal_error("upload_failed"))?;
    let mut uploaded = (reply.status < 400)
        .then(|| extract_upload_url(&reply.body))
        .flatten();

    if uploaded.is_none() && field != "file" {
        tracing::debug!(field, status = reply.status, "uploader rejected field; retrying as 'file'");
        let retry = upload_with_bearer(&state.media_http, endpoint, api_key, "file", &filename, &bytes)
            .await
            .map_err(crate::error::internal_error("upload_failed"))?;
        if retry.status < 400
            && let Some(url) = extract_upload_url(&retry.body)
        {
            uploaded = Some(url);
            reply = retry;
        }
    }

    if reply.status >= 400 {
        return Err(GatewayError::upstream("uploader_error", "uploader returned an error")
            .with_detail("status", reply.status)
            .with_detail("body", reply.body));
    }
    let Some(uploaded_url) = uploaded else {
        return Err(
            GatewayError::upstream("no_url_in_response", "uploader response carried no URL")
                .with_detail("body", reply.body),
        );
    };
    tracing::info!(%filename, "uploaded media");
    Ok(Json(json!({ "uploaded_url": uploaded_url })))
}

fn require_http_url(host: &str, text: &str) -> anyhow::Result<String> {
    let text = text.trim();
    if text.starts_with("http://") || text.starts_with("https://") {
        Ok(text.to_string())
    } else {
        bail!("invalid response from {host}: {text}")
    }
}

fn octet_stream_form(filename: &str, bytes: &[u8]) -> anyhow::Result<reqwest::multipart::Form> {
    let part = reqwest::multipart::Part::bytes(bytes.to_vec())
        .file_name(filename.to_string())
        .mime_str("application/octet-stream")
        .context("build multipart part")?;
    Ok(reqwest::multipart::Form::new().part("file", part))
}

async fn upload_to_0x0(
    http: &reqwest::Client,
    base: &str,
    filename: &str,
    bytes: &[u8],
) -> anyhow::Result<String> {
    let text = http
        .post(format!("{}/", base.trim_end_matches('/')))
        .multipart(octet_stream_form(filename, bytes)?)
        .send()
        .await?
        .text()
        .await?;
    require_http_url("0x0.st", &text)
}

async fn upload_to_transfer_sh(
    http: &reqwest::Client,
    base: &str,
    filename: &str,
    bytes: &[u8],
) -> anyhow::Result<String> {
    let text = http
        .put(format!("{}/{filename}", base.trim_end_matches('/')))
        .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
        .body(bytes.to_vec())
        .send()
        .await?
        .text()
        .await?;
    require_http_url("transfer.sh", &text)
}

async fn upload_to_file_io(
    http: &reqwest::Client,
    base: &str,
    filename: &str,
    bytes: &[u8],
) -> anyhow::Result<String> {
    let v: Value = http
        .post(format!("{}/", base.trim_end_matches('/')))
        .multipart(octet_stream_form(filename, bytes)?)
        .send()
        .await?
        .json()
        .await?;
    ["link", "url"]
        .iter()
        .filter_map(|k| v.get(*k).and_then(Value::as_str))
        .find(|s| !s.is_empty())
        .map(str::to_string)
        .context("invalid response from file.io")
}

/// `POST /expose {url}`: re-host a (typically local) URL on the first paste host that accepts it.
pub(crate) async fn post_expose(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<UrlRequest>, JsonRejection>,
) -> Result<Json<Value>, GatewayError> {
    let Json(req) = payload?;
    let src = req.source()?;
    let url = parse_source_url(&src)?;
    let segment = sanitize_filename(&last_path_segment(&url));
    let filename = if segment.is_empty() {
        "image".to_string()
    } else {
        segment
    };

    let bytes = fetch_bytes(&state.media_http, &src)
        .await
        .map_err(|e| GatewayError::internal("failed_to_expose", format!("{e:#}")))?;

    let http = &state.media_http;
    let hosts = &state.paste_hosts;
    let mut errors: Vec<String> = Vec::new();

    match upload_to_0x0(http, &hosts.zero_x0, &filename, &bytes).await {
        Ok(public_url) => return Ok(Json(json!({ "public_url": public_url }))),
        Err(e) => errors.push(format!("0x0.st: {e:#}")),
    }
    match upload_to_transfer_sh(http, &hosts.transfer_sh, &filename, &bytes).await {
        Ok(public_url) => return Ok(Json(json!({ "public_url": public_url }))),
        Err(e) => errors.push(format!("transfer.sh: {e:#}")),
    }
    match upload_to_file_io(http, &hosts.file_io, &filename, &bytes).await {
        Ok(public_url) => return Ok(Json(json!({ "public_url": public_url }))),
        Err(e) => errors.push(format!("file.io: {e:#}")),
    }

    tracing::warn!(errors = ?errors, "every paste host rejected the upload");
    Err(GatewayError::internal(
        "failed_to_expose",
        format!("all uploads failed: {}", errors.join(" | ")),
    ))
}

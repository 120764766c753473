use crate::error::{GatewayError, internal_error};
use crate::http::AppState;
use anyhow::Context as _;
use axum::{
    Json,
    body::Body,
    extract::State,
    http::{HeaderValue, header},
    response::{IntoResponse as _, Response},
};
use serde_json::{Value, json};
use std::path::Path;
use std::sync::Arc;
use tokio_util::io::ReaderStream;

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "webp", "svg"];
const IMAGES_LIST_FILE: &str = "data/images_list.json";

fn is_image(name: &str) -> bool {
    name.rsplit_once('.')
        .is_some_and(|(_, ext)| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
}

async fn image_names(dir: &Path) -> anyhow::Result<Vec<String>> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("read {}", dir.display()))?;
    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if is_image(&name) {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}

async fn write_listing(root: &Path, pretty: &str) -> anyhow::Result<()> {
    let path = root.join(IMAGES_LIST_FILE);
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("create {}", parent.display()))?;
    }
    tokio::fs::write(&path, pretty)
        .await
        .with_context(|| format!("write {}", path.display()))
}

/// `GET /api/images`: list `static/images` and refresh the cached listing files.
pub(crate) async fn list_images(State(state): State<Arc<AppState>>) -> Result<Json<Value>, GatewayError> {
    let config = &state.config;
    let images = image_names(&config.static_dir.join("images"))
        .await
        .map_err(internal_error("images_unavailable"))?;
    let listing = json!({ "images": images });

    let pretty = serde_json::to_string_pretty(&listing)
        .context("serialize image listing")
        .map_err(internal_error("images_unavailable"))?;
    for root in [&config.public_dir, &config.static_dir] {
        write_listing(root, &pretty)
            .await
            .map_err(internal_error("images_unavailable"))?;
    }
    Ok(Json(listing))
}

/// `GET /mcp/config.json`: stream the MCP client config file.
pub(crate) async fn mcp_config(State(state): State<Arc<AppState>>) -> Result<Response, GatewayError> {
    let path = &state.config.mcp_config_path;
    let file = match tokio::fs::File::open(path).await {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(
                GatewayError::not_found("mcp_config_not_found", "MCP config file not found")
                    .with_detail("path", path.display().to_string()),
            );
        }
        Err(e) => {
            return Err(internal_error("mcp_config_error")(
                anyhow::Error::new(e).context(format!("open {}", path.display())),
            ));
        }
    };

    let mut resp = Body::from_stream(ReaderStream::new(file)).into_response();
    resp.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    Ok(resp)
}

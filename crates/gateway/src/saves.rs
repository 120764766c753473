//! Story save/load.
//!
//! A save lives in `<saves_dir>/<id>/content.yaml`, with referenced media copied into
//! `<saves_dir>/<id>/media/`.

use crate::error::{GatewayError, internal_error};
use crate::http::AppState;
use anyhow::Context as _;
use axum::{
    Json,
    extract::{Path as UrlPath, State, rejection::JsonRejection},
};
use serde::Deserialize;
use serde_json::{Value, json};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

const CONTENT_FILE: &str = "content.yaml";
const MEDIA_DIR: &str = "media";
/// Scene fields that may reference media.
const MEDIA_FIELDS: [&str; 2] = ["mediaSrc", "endImageSrc"];

fn validate_save_id(id: &str) -> Result<(), GatewayError> {
    if id.is_empty() || id.contains("..") || id.contains('/') || id.contains('\\') {
        return Err(GatewayError::bad_request(
            "invalid_save_id",
            "Invalid save ID.",
        ));
    }
    Ok(())
}

/// `GET /api/story-gen/list`
pub(crate) async fn list(State(state): State<Arc<AppState>>) -> Result<Json<Vec<String>>, GatewayError> {
    list_saves(&state.config.saves_dir)
        .await
        .map(Json)
        .map_err(internal_error("list_failed"))
}

async fn list_saves(root: &Path) -> anyhow::Result<Vec<String>> {
    tokio::fs::create_dir_all(root)
        .await
        .with_context(|| format!("create {}", root.display()))?;
    let mut entries = tokio::fs::read_dir(root)
        .await
        .with_context(|| format!("read {}", root.display()))?;
    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_dir() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort();
    Ok(names)
}

/// `GET /api/story-gen/load/{id}`
pub(crate) async fn load(
    State(state): State<Arc<AppState>>,
    UrlPath(id): UrlPath<String>,
) -> Result<Json<Vec<Value>>, GatewayError> {
    validate_save_id(&id)?;
    let content_path = state.config.saves_dir.join(&id).join(CONTENT_FILE);
    if !tokio::fs::try_exists(&content_path).await.unwrap_or(false) {
        return Err(GatewayError::not_found("save_not_found", "Save not found."));
    }

    let text = tokio::fs::read_to_string(&content_path)
        .await
        .with_context(|| format!("read {}", content_path.display()))
        .map_err(internal_error("load_failed"))?;
    let mut scenes: Vec<Value> = serde_yaml::from_str(&text)
        .with_context(|| format!("parse {}", content_path.display()))
        .map_err(internal_error("load_failed"))?;

    let prefix = format!("{}/saves/{id}", state.config.public_base_url);
    for scene in &mut scenes {
        rewrite_media_for_client(scene, &prefix);
    }
    Ok(Json(scenes))
}

/// Saved media paths are relative to the save directory; hand them out as absolute URLs.
fn rewrite_media_for_client(scene: &mut Value, prefix: &str) {
    let Some(obj) = scene.as_object_mut() else {
        return;
    };
    for field in MEDIA_FIELDS {
        if let Some(Value::String(src)) = obj.get_mut(field)
            && !src.is_empty()
            && !src.starts_with("http")
            && !src.starts_with("data:")
        {
            *src = format!("{prefix}/{src}");
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SaveRequest {
    #[serde(default)]
    save_id: Option<String>,
    #[serde(default)]
    scenes: Option<Vec<Value>>,
}

/// `POST /api/story-gen/save`
pub(crate) async fn save(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<SaveRequest>, JsonRejection>,
) -> Result<Json<Value>, GatewayError> {
    let Json(req) = payload?;
    let (Some(save_id), Some(mut scenes)) = (req.save_id, req.scenes) else {
        return Err(GatewayError::bad_request(
            "invalid_request",
            "Invalid request body. `saveId` and `scenes` are required.",
        ));
    };
    validate_save_id(&save_id)?;

    let save_dir = state.config.saves_dir.join(&save_id);
    let media = MediaLocalizer {
        http: &state.media_http,
        static_dir: &state.config.static_dir,
        media_dir: save_dir.join(MEDIA_DIR),
    };
    tokio::fs::create_dir_all(&media.media_dir)
        .await
        .with_context(|| format!("create {}", media.media_dir.display()))
        .map_err(internal_error("save_failed"))?;

    for scene in &mut scenes {
        let Some(obj) = scene.as_object_mut() else {
            continue;
        };
        for field in MEDIA_FIELDS {
            if let Some(Value::String(src)) = obj.get_mut(field) {
                *src = media.localize(src).await;
            }
        }
    }

    let yaml = serde_yaml::to_string(&scenes)
        .context("serialize scenes")
        .map_err(internal_error("save_failed"))?;
    let content_path = save_dir.join(CONTENT_FILE);
    tokio::fs::write(&content_path, yaml)
        .await
        .with_context(|| format!("write {}", content_path.display()))
        .map_err(internal_error("save_failed"))?;

    tracing::info!(save_id = %save_id, scenes = scenes.len(), "story saved");
    Ok(Json(json!({
        "success": true,
        "message": format!("Story saved as {save_id}"),
    })))
}

struct MediaLocalizer<'a> {
    http: &'a reqwest::Client,
    static_dir: &'a Path,
    media_dir: PathBuf,
}

impl MediaLocalizer<'_> {
    /// Copy or download one media reference into the save; returns the value to store.
    ///
    /// Anything that cannot be localized is kept as given.
    async fn localize(&self, src: &str) -> String {
        if src.is_empty() || src.starts_with("data:") {
            return src.to_string();
        }
        let Some(name) = media_basename(src) else {
            return src.to_string();
        };
        let dest = self.media_dir.join(&name);

        if src.starts_with("http") {
            let copied = async {
                let bytes = crate::upload::fetch_bytes(self.http, src).await?;
                tokio::fs::write(&dest, bytes)
                    .await
                    .with_context(|| format!("write {}", dest.display()))
            }
            .await;
            return match copied {
                Ok(()) => format!("{MEDIA_DIR}/{name}"),
                Err(e) => {
                    let error = format!("{e:#}");
                    tracing::warn!(src, %error, "failed to fetch media; keeping URL");
                    src.to_string()
                }
            };
        }

        let Some(source) = static_source(self.static_dir, src) else {
            return src.to_string();
        };
        if !tokio::fs::metadata(&source)
            .await
            .is_ok_and(|m| m.is_file())
        {
            return src.to_string();
        }
        match tokio::fs::copy(&source, &dest).await {
            Ok(_) => format!("{MEDIA_DIR}/{name}"),
            Err(e) => {
                tracing::warn!(src, error = %e, "failed to copy media; keeping path");
                src.to_string()
            }
        }
    }
}

/// Last path segment of `src`, resolved like a URL relative to `http://localhost/`.
fn media_basename(src: &str) -> Option<String> {
    let base = reqwest::Url::parse("http://localhost/").ok()?;
    let url = base.join(src).ok()?;
    let name = url.path().rsplit('/').next()?;
    (!name.is_empty() && name != "..").then(|| name.to_string())
}

/// Path of a static asset, refusing anything that would climb out of `static_dir`.
fn static_source(static_dir: &Path, src: &str) -> Option<PathBuf> {
    let path_part = src.split(['?', '#']).next().unwrap_or_default();
    let rel = Path::new(path_part.trim_start_matches('/'));
    rel.components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
        .then(|| static_dir.join(rel))
}

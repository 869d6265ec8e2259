//! HTTP handlers for uploads and stream control.

use std::{collections::HashMap, path::PathBuf};

use axum::{
    Json,
    extract::{Multipart, Path, Query, State, rejection::JsonRejection},
};
use loopcast_agent::StartRequest;
use loopcast_session::{Destination, SessionStatus, SlotId};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::state::AppState;
use crate::storage::{VideoEntry, VideoStore, save_field};

#[derive(Debug, Serialize)]
pub struct EncoderHealth {
    pub program: String,
    pub available: bool,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub encoder: EncoderHealth,
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        encoder: EncoderHealth {
            program: state.registry.controller().program().to_string(),
            available: state.encoder_available,
        },
    })
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: String,
    #[serde(rename = "slotID", skip_serializing_if = "Option::is_none")]
    pub slot_id: Option<SlotId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

/// A video part already written to the sessions dir while the rest of the
/// form is still being read.
struct StagedUpload {
    path: PathBuf,
    original_name: String,
}

impl StagedUpload {
    async fn discard(self) {
        if let Err(err) = tokio::fs::remove_file(&self.path).await {
            tracing::warn!(path = %self.path.display(), %err, "failed to discard staged upload");
        }
    }
}

#[derive(Default)]
struct UploadForm {
    fields: HashMap<String, String>,
    video: Option<StagedUpload>,
}

impl UploadForm {
    /// First non-empty value among `names`.
    fn text(&self, names: &[&str]) -> Option<&str> {
        names
            .iter()
            .filter_map(|n| self.fields.get(*n))
            .map(|v| v.trim())
            .find(|v| !v.is_empty())
    }

    async fn discard(self) {
        if let Some(video) = self.video {
            video.discard().await;
        }
    }
}

async fn read_form(store: &VideoStore, mut multipart: Multipart) -> Result<UploadForm, ApiError> {
    let mut form = UploadForm::default();
    let res: Result<(), ApiError> = async {
        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(|e| ApiError::bad_request(format!("invalid multipart body: {e}")))?
        {
            let Some(name) = field.name().map(str::to_string) else {
                continue;
            };
            if name == "video" {
                if form.video.is_some() {
                    return Err(ApiError::bad_request("only one video file is allowed"));
                }
                let original_name = field.file_name().unwrap_or_default().to_string();
                let path = store.session_path(&original_name)?;
                let bytes = save_field(field, &path).await?;
                tracing::info!(path = %path.display(), bytes, "video part stored");
                form.video = Some(StagedUpload {
                    path,
                    original_name,
                });
            } else {
                let value = field
                    .text()
                    .await
                    .map_err(|e| ApiError::bad_request(format!("invalid field {name}: {e}")))?;
                form.fields.insert(name, value);
            }
        }
        Ok(())
    }
    .await;

    match res {
        Ok(()) => Ok(form),
        Err(err) => {
            form.discard().await;
            Err(err)
        }
    }
}

/// POST /upload
pub async fn upload(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<MessageResponse>, ApiError> {
    let mut form = read_form(&state.store, multipart).await?;

    let Some(uid) = form.text(&["uid"]).map(str::to_string) else {
        form.discard().await;
        return Err(ApiError::bad_request("Missing video file or user ID."));
    };
    let Some(video) = form.video.take() else {
        return Err(ApiError::bad_request("Missing video file or user ID."));
    };

    let filename = match VideoStore::library_name(&uid, &video.original_name) {
        Ok(v) => v,
        Err(err) => {
            video.discard().await;
            return Err(err);
        }
    };
    let dest = state.store.videos_dir().join(&filename);
    if let Err(err) = tokio::fs::rename(&video.path, &dest).await {
        tracing::error!(%uid, path = %dest.display(), %err, "failed to move upload into library");
        video.discard().await;
        return Err(ApiError::internal("failed to store upload"));
    }

    tracing::info!(%uid, %filename, "video uploaded");
    Ok(Json(MessageResponse {
        message: "Video uploaded successfully!".to_string(),
        slot_id: None,
        filename: Some(filename),
    }))
}

/// GET /videos/:uid
pub async fn list_videos(
    State(state): State<AppState>,
    Path(uid): Path<String>,
) -> Result<Json<Vec<VideoEntry>>, ApiError> {
    let videos = state.store.list(&uid).await.map_err(|err| {
        tracing::error!(%uid, err = %format!("{err:#}"), "failed to list videos");
        ApiError::internal("Could not list videos")
    })?;
    Ok(Json(videos))
}

/// POST /stream/start
pub async fn start_stream(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<MessageResponse>, ApiError> {
    let mut form = read_form(&state.store, multipart).await?;

    let slot_id = form.text(&["slotID", "slot_id"]).and_then(SlotId::parse);
    let url = form.text(&["streamURL", "stream_url"]).map(str::to_string);
    let key = form.text(&["streamKey", "stream_key"]).map(str::to_string);
    let (Some(slot_id), Some(url), Some(key)) = (slot_id, url, key) else {
        form.discard().await;
        return Err(ApiError::bad_request("Missing required streaming parameters.")
            .with_hint("slotID, streamURL and streamKey are required"));
    };
    let Some(destination) = Destination::resolve(&url, &key) else {
        form.discard().await;
        return Err(ApiError::bad_request("Invalid streamURL or streamKey.")
            .with_hint("control characters are not allowed"));
    };

    let (source, label, staged) = if let Some(video) = form.video.take() {
        (video.path.clone(), video.original_name.clone(), Some(video))
    } else if let Some(filename) = form.text(&["filename"]) {
        (state.store.library_path(filename)?, filename.to_string(), None)
    } else {
        return Err(ApiError::bad_request("No video file or filename provided."));
    };

    let req = StartRequest {
        slot_id: slot_id.clone(),
        source,
        destination,
        cleanup_source: staged.is_some(),
    };
    match state.registry.start(req).await {
        Ok(status) => {
            tracing::info!(%slot_id, pid = ?status.pid, source = %label, "start request served");
            Ok(Json(MessageResponse {
                message: format!("Stream for '{label}' has started!"),
                slot_id: Some(slot_id),
                filename: None,
            }))
        }
        Err(err) => {
            tracing::warn!(%slot_id, op = "start", %err, "start request failed");
            if let Some(video) = staged {
                video.discard().await;
            }
            Err(err.into())
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct StopRequest {
    #[serde(default, rename = "slotID", alias = "slot_id")]
    pub slot_id: Option<String>,
}

/// POST /stream/stop
pub async fn stop_stream(
    State(state): State<AppState>,
    body: Result<Json<StopRequest>, JsonRejection>,
) -> Result<Json<MessageResponse>, ApiError> {
    let Json(req) = body.map_err(|e| ApiError::bad_request(format!("invalid body: {e}")))?;
    let slot_id = req
        .slot_id
        .as_deref()
        .and_then(SlotId::parse)
        .ok_or_else(|| ApiError::bad_request("Missing slotID."))?;

    state.registry.stop(&slot_id).await.map_err(|err| {
        tracing::warn!(%slot_id, op = "stop", %err, "stop request failed");
        ApiError::from(err)
    })?;

    Ok(Json(MessageResponse {
        message: format!("Stream for slot '{slot_id}' has stopped."),
        slot_id: Some(slot_id),
        filename: None,
    }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub active_slots: Vec<SlotId>,
}

/// GET /stream/status
pub async fn stream_status(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        active_slots: state.registry.status().await,
    })
}

#[derive(Debug, Serialize)]
pub struct SessionsResponse {
    pub sessions: Vec<SessionStatus>,
}

/// GET /stream/sessions
pub async fn list_sessions(State(state): State<AppState>) -> Json<SessionsResponse> {
    Json(SessionsResponse {
        sessions: state.registry.sessions().await,
    })
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    #[serde(default)]
    pub cursor: u64,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct LogsResponse {
    pub lines: Vec<String>,
    pub cursor: u64,
}

/// GET /stream/logs/:slot_id
pub async fn stream_logs(
    State(state): State<AppState>,
    Path(slot_id): Path<String>,
    Query(q): Query<LogsQuery>,
) -> Result<Json<LogsResponse>, ApiError> {
    let slot_id = SlotId::parse(&slot_id).ok_or_else(|| ApiError::bad_request("Missing slotID."))?;
    let (lines, cursor) = state
        .registry
        .logs(&slot_id, q.cursor, q.limit.unwrap_or(200))
        .await?;
    Ok(Json(LogsResponse { lines, cursor }))
}

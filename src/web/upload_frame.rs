use std::sync::Arc;

use axum::{
    extract::{Multipart, Query, State},
    response::{IntoResponse, Response},
    Json,
};
use axum_util::errors::{ApiError, ApiResult};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::{config::CONFIG, pipeline::PipelineError, pushover::alert_event};

use super::AppState;

#[derive(Deserialize)]
pub struct UploadQuery {
    pub token: Option<String>,
}

#[derive(Serialize, Debug, PartialEq)]
pub struct UploadResponse {
    pub ok: bool,
    pub motion_score: f64,
    pub person: bool,
    pub person_score: f64,
    pub intrusion_saved: bool,
}

fn round4(x: f64) -> f64 {
    (x * 10_000.0).round() / 10_000.0
}

fn bad_request(e: impl ToString) -> ApiError {
    ApiError::BadRequest(e.to_string())
}

/// Accepts `token` plus either a `frame` file or a `frame_b64` field.
pub async fn upload_frame(
    State(state): State<Arc<AppState>>,
    Query(query): Query<UploadQuery>,
    mut multipart: Multipart,
) -> ApiResult<Response> {
    let mut token = query.token;
    let mut frame = None;
    while let Some(field) = multipart.next_field().await.map_err(bad_request)? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "token" => token = Some(field.text().await.map_err(bad_request)?),
            "frame" | "frame_b64" => frame = Some(field.bytes().await.map_err(bad_request)?),
            _ => debug!("ignoring upload field {name}"),
        }
    }
    let Some(token) = token.filter(|x| !x.is_empty()) else {
        return Err(bad_request("missing token"));
    };
    let Some(frame) = frame.filter(|x| !x.is_empty()) else {
        return Err(bad_request("no frame"));
    };

    let pipeline = state.pipeline.clone();
    let verdict = tokio::task::spawn_blocking(move || pipeline.process_frame(&token, &frame))
        .await
        .map_err(|e| ApiError::Other(e.into()))?;
    let verdict = match verdict {
        Ok(verdict) => verdict,
        Err(PipelineError::UnknownStream | PipelineError::InactiveStream(_)) => {
            return Err(bad_request("invalid token"))
        }
        Err(PipelineError::Decode(e)) => return Err(bad_request(format!("bad image: {e}"))),
    };

    if let (Some(event), Some(pushover)) = (&verdict.event, &CONFIG.pushover) {
        let event = event.clone();
        let priority = verdict.device.alert_priority;
        let snapshot = state.events.snapshot_path(event.id);
        tokio::spawn(async move {
            alert_event(pushover, &event, priority, &snapshot).await;
        });
    }

    Ok(Json(UploadResponse {
        ok: true,
        motion_score: round4(verdict.motion_score),
        person: verdict.person_detected,
        person_score: round4(verdict.person_score),
        intrusion_saved: verdict.event_created(),
    })
    .into_response())
}

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    response::Response,
};
use axum_util::errors::{ApiError, ApiResult};
use uuid::Uuid;

use super::{jpeg_response, AppState};

pub async fn get_event(
    State(state): State<Arc<AppState>>,
    Path(filename): Path<String>,
) -> ApiResult<Response> {
    let Some(id) = filename
        .strip_suffix(".jpg")
        .and_then(|x| x.parse::<Uuid>().ok())
    else {
        return Err(ApiError::NotFound);
    };
    let path = state.events.snapshot_path(id);
    if !tokio::fs::try_exists(&path).await? {
        return Err(ApiError::NotFound);
    }
    jpeg_response(tokio::fs::read(&path).await?)
}

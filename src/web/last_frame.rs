use std::sync::Arc;

use axum::{
    extract::{Path, State},
    response::Response,
};
use axum_util::errors::{ApiError, ApiResult};


use super::{jpeg_response, AppState};

pub async fn last_frame(
    State(state): State<Arc<AppState>>,
    Path(filename): Path<String>,
) -> ApiResult<Response> {
    let Some(token) = filename.strip_suffix(".jpg") else {
        return Err(ApiError::NotFound);
    };
    if state.pipeline.registry().lookup(token).is_none() {
        return Err(ApiError::NotFound);
    }
    let Some(path) = state.last_frames.image_path(token) else {
        return Err(ApiError::NotFound);
    };
    if !tokio::fs::try_exists(&path).await? {
        return Err(ApiError::NotFound);
    }
    jpeg_response(tokio::fs::read(&path).await?)
}

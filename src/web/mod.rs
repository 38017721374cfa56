use std::sync::Arc;

use axum::{
    body::{BoxBody, Bytes, Full, HttpBody},
    response::Response,
    routing, Router,
};
use axum_util::{
    errors::ApiResult,
    logger::{LoggerConfig, LoggerLayer},
};
use log::Level;

use crate::{
    pipeline::Pipeline,
    storage::{FileEventLog, FileLastFrameStore},
};

mod get_event;
mod last_frame;
mod list_camera;
mod list_events;
mod upload_frame;

pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    pub last_frames: Arc<FileLastFrameStore>,
    pub events: Arc<FileEventLog>,
}

async fn health() {}

fn jpeg_response(bytes: Vec<u8>) -> ApiResult<Response> {
    Ok(Response::builder()
        .header("content-type", "image/jpeg")
        .header("cache-control", "no-store")
        .body(BoxBody::new::<_>(
            Full::new(Bytes::from(bytes)).map_err(|_| unreachable!()),
        ))?)
}

fn html_response(body: String) -> ApiResult<Response> {
    Ok(Response::builder()
        .header("content-type", "text/html")
        .body(BoxBody::new::<_>(
            Full::new(Bytes::from(body)).map_err(|_| unreachable!()),
        ))?)
}

pub fn route(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", routing::get(list_camera::list_camera))
        .route("/events", routing::get(list_events::list_events))
        .route("/events/:filename", routing::get(get_event::get_event))
        .route(
            "/api/upload_frame",
            routing::post(upload_frame::upload_frame),
        )
        .route(
            "/api/last_frame/:filename",
            routing::get(last_frame::last_frame),
        )
        .route("/health", routing::get(health))
        .layer(LoggerLayer::new(LoggerConfig {
            log_level_filter: Arc::new(|x| {
                // devices upload several frames a second
                if x == "/health" || x == "/api/upload_frame" || x.starts_with("/api/last_frame/") {
                    Level::Debug
                } else {
                    Level::Info
                }
            }),
            honor_xff: true,
            metric_name: "watchpost_web_responses".to_string(),
        }))
        .with_state(state)
}

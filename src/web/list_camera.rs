use std::sync::Arc;

use axum::{extract::State, response::Response};
use axum_util::errors::ApiResult;
use typed_html::elements::FlowContent;
use typed_html::{dom::DOMTree, html, text};

use crate::{config::CONFIG, pipeline::LastFrameStore};

use super::{html_response, AppState};

#[allow(unused_braces)]
pub async fn list_camera(State(state): State<Arc<AppState>>) -> ApiResult<Response> {
    let mut out = Vec::<Box<dyn FlowContent<String>>>::new();

    out.push(html! {
        <div>
            <a href={format!("{}events", CONFIG.web_base)}>{ text!("Events") }</a>
        </div>
    });
    for (name, device) in &CONFIG.devices {
        if !device.active {
            continue;
        }
        let status = match state.last_frames.get(&device.token) {
            Some(record) => format!(
                "{}x{} @ {:.01} fps, last seen {}",
                record.width,
                record.height,
                record.fps,
                record.updated_at.format("%Y-%m-%d %H:%M:%S")
            ),
            None => "no frames yet".to_string(),
        };
        out.push(html! {
            <div>
                <div>{text!("{}: {}", name, status)}</div>
                <img src={format!("{}api/last_frame/{}.jpg", CONFIG.web_base, device.token)} alt={name.clone()} style="max-width: 640px"/>
            </div>
        });
    }
    let total: DOMTree<String> = html! {
        <html>
        <head>
            <title>"Watchpost"</title>
        </head>
        <body>
            {out.into_iter()}
        </body>
        </html>
    };

    html_response(total.to_string())
}

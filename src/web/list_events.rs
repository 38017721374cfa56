use std::sync::Arc;

use axum::{
    extract::{Query, State},
    response::Response,
};
use axum_util::errors::{ApiError, ApiResult};
use serde::Deserialize;
use typed_html::elements::FlowContent;
use typed_html::{dom::DOMTree, html, text};

use crate::config::CONFIG;

use super::{html_response, AppState};

const EVENTS_PER_PAGE: usize = 40;

#[derive(Deserialize)]
pub struct EventsQuery {
    #[serde(default)]
    pub page: usize,
}

#[allow(unused_braces)]
pub async fn list_events(
    State(state): State<Arc<AppState>>,
    Query(query): Query<EventsQuery>,
) -> ApiResult<Response> {
    let mut out = Vec::<Box<dyn FlowContent<String>>>::new();

    out.push(html! {
        <div>
            "Events"
        </div>
    });
    out.push(html! {
        <div>
            <a href={&CONFIG.web_base}>{ text!("Home") }</a>
        </div>
    });
    let entries = state.events.list().await.map_err(ApiError::Other)?;
    let pages = ((entries.len() + EVENTS_PER_PAGE - 1) / EVENTS_PER_PAGE).max(1);
    let page = query.page.min(pages - 1);
    for event in entries
        .iter()
        .skip(page * EVENTS_PER_PAGE)
        .take(EVENTS_PER_PAGE)
    {
        out.push(html! {
            <div>
                <a href={format!("{}events/{}", CONFIG.web_base, event.snapshot_name())}>{ text!("{}", event.when.format("%Y-%m-%d %H:%M:%S")) }</a>
                {text!(": {} on {}, {:.03} score", event.kind.as_str(), event.device, event.score) }
            </div>
        });
    }
    if page + 1 < pages {
        out.push(html! {
            <div>
                <a href={format!("{}events?page={}", CONFIG.web_base, page + 1)}>{ text!("Older") }</a>
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

use log::error;
use reqwest::{
    multipart::{Form, Part},
    Client,
};
use serde::{Deserialize, Serialize};
use serde_with::{base64::Base64, serde_as};

use crate::config::{PushoverConfig, PushoverPriority};
use crate::event::{EventKind, IntrusionEvent};

lazy_static::lazy_static! {
    static ref CLIENT: Client = Client::new();
}

const MAX_ALERT_ATTACHMENT_SIZE: usize = (1024 * 1024 * 5) / 2;

#[serde_as]
#[derive(Serialize, Deserialize, Default, Debug)]
pub struct PushoverAlert {
    pub user: String,
    pub token: String,
    pub message: String,
    #[serde_as(as = "Base64")]
    #[serde(skip_serializing_if = "Vec::is_empty", rename = "attachment_base64")]
    pub attachment: Vec<u8>,
    #[serde(skip)]
    pub filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachment_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

impl PushoverAlert {
    pub fn new(config: &PushoverConfig) -> Self {
        PushoverAlert {
            token: config.token.clone(),
            user: config.user_key.clone(),
            priority: Some(config.priority as i32),
            ..Default::default()
        }
    }

    pub async fn push(&self, config: &PushoverConfig) {
        let mut body = Form::new()
            .text("user", self.user.clone())
            .text("token", self.token.clone())
            .text("message", self.message.clone())
            .text("html", "1");
        if let Some(attachment_type) = &self.attachment_type {
            body = body.text("attachment_type", attachment_type.clone());
        }
        if let Some(priority) = &self.priority {
            body = body.text("priority", priority.to_string());
        }
        if let Some(timestamp) = &self.timestamp {
            body = body.text("timestamp", timestamp.to_string());
        }
        if let Some(title) = &self.title {
            body = body.text("title", title.to_string());
        }
        if !self.attachment.is_empty() {
            let mut part = Part::bytes(self.attachment.clone());
            if let Some(filename) = &self.filename {
                part = part.file_name(filename.clone());
            }
            if let Some(attachment_type) = &self.attachment_type {
                part = match part.mime_str(attachment_type) {
                    Ok(part) => part,
                    Err(e) => {
                        error!("invalid attachment type {attachment_type}: {e}");
                        return;
                    }
                };
            }
            body = body.part("attachment", part);
        }
        match CLIENT.post(config.url.clone()).multipart(body).send().await {
            Ok(response) => {
                if !response.status().is_success() {
                    error!(
                        "failed to send alert: HTTP status {}:\n{}",
                        response.status(),
                        response.text().await.unwrap_or_default()
                    );
                }
            }
            Err(e) => {
                error!("failed to send alert: {e}");
            }
        }
    }
}

/// Builds the alert for `event`, or `None` when the effective priority is
/// `ignore`.
pub fn build_alert(
    config: &PushoverConfig,
    event: &IntrusionEvent,
    device_priority: Option<PushoverPriority>,
    snapshot: Option<Vec<u8>>,
) -> Option<PushoverAlert> {
    let mut alert = PushoverAlert::new(config);
    if let Some(priority) = device_priority {
        alert.priority = Some(priority as i32);
    }
    if alert.priority == Some(PushoverPriority::Ignore as i32) {
        return None;
    }
    alert.timestamp = Some(event.when.timestamp() as u64);
    alert.title = Some(match event.kind {
        EventKind::Human => format!("Human @ {}", event.device),
        EventKind::Motion => format!("Motion @ {}", event.device),
    });
    alert.message = format!(
        r"Score: {:.03}<br>Event: {}",
        event.score, event.id
    );
    if let Some(snapshot) = snapshot {
        if snapshot.len() <= MAX_ALERT_ATTACHMENT_SIZE {
            alert.attachment = snapshot;
            alert.attachment_type = Some("image/jpeg".to_string());
            alert.filename = Some(event.snapshot_name());
        } else {
            error!(
                "snapshot too large to attach: {} bytes, expected <= {MAX_ALERT_ATTACHMENT_SIZE}",
                snapshot.len()
            );
        }
    }
    Some(alert)
}

pub async fn alert_event(
    config: &PushoverConfig,
    event: &IntrusionEvent,
    device_priority: Option<PushoverPriority>,
    snapshot_path: &std::path::Path,
) {
    let snapshot = if config.attach_snapshot {
        match tokio::fs::read(snapshot_path).await {
            Ok(x) => Some(x),
            Err(e) => {
                error!("failed to read snapshot {}: {e}", snapshot_path.display());
                None
            }
        }
    } else {
        None
    };
    if let Some(alert) = build_alert(config, event, device_priority, snapshot) {
        alert.push(config).await;
    }
}

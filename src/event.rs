use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Motion,
    Human,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Motion => "motion",
            EventKind::Human => "human",
        }
    }
}

/// Persisted alongside each event snapshot.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct IntrusionEvent {
    pub id: Uuid,
    pub stream: String,
    pub device: String,
    pub kind: EventKind,
    /// Person confidence for `human` events, motion fraction otherwise.
    pub score: f64,
    pub when: DateTime<Utc>,
}

impl IntrusionEvent {
    pub fn snapshot_name(&self) -> String {
        format!("{}.jpg", self.id)
    }
}

/// Persisted alongside the latest frame of a device.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct LastFrameMetadata {
    pub stream: String,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub updated_at: DateTime<Utc>,
}

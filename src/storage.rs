use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::RwLock,
};

use anyhow::{Context, Result};
use indexmap::IndexMap;
use log::warn;
use uuid::Uuid;

use crate::{
    config::DeviceConfig,
    event::{IntrusionEvent, LastFrameMetadata},
    frame::encode_jpeg,
    pipeline::{Device, DeviceRegistry, EventLog, LastFrame, LastFrameStore, NewEvent},
};

/// Devices declared in the config file, keyed by token.
pub struct ConfigRegistry {
    devices: HashMap<String, Device>,
}

impl ConfigRegistry {
    pub fn new(devices: &IndexMap<String, DeviceConfig>) -> Self {
        Self {
            devices: devices
                .iter()
                .map(|(name, device)| {
                    (
                        device.token.clone(),
                        Device {
                            name: name.clone(),
                            token: device.token.clone(),
                            sensitivity: device.sensitivity,
                            active: device.active,
                            alert_priority: device.alert_priority,
                        },
                    )
                })
                .collect(),
        }
    }
}

impl DeviceRegistry for ConfigRegistry {
    fn lookup(&self, token: &str) -> Option<Device> {
        self.devices.get(token).cloned()
    }
}

// tokens are opaque; keep them from escaping the storage directory
fn file_stem(token: &str) -> Option<&str> {
    if token.is_empty() || token.contains('/') || token.contains('\\') || token.contains("..") {
        return None;
    }
    Some(token)
}

/// Writes `bytes` next to `path` and renames it into place so readers never
/// observe a partial file.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut temp = path.as_os_str().to_owned();
    temp.push(format!(".{}.tmp", Uuid::new_v4().simple()));
    let temp = PathBuf::from(temp);
    std::fs::write(&temp, bytes).with_context(|| format!("writing {}", temp.display()))?;
    std::fs::rename(&temp, path).with_context(|| format!("renaming to {}", path.display()))?;
    Ok(())
}

/// Latest JPEG of each stream in `dir`, with a JSON metadata sidecar.
pub struct FileLastFrameStore {
    dir: PathBuf,
    quality: u8,
    records: RwLock<HashMap<String, LastFrameMetadata>>,
}

impl FileLastFrameStore {
    /// Picks up metadata left by a previous run.
    pub fn open(dir: impl Into<PathBuf>, quality: u8) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
        let mut records = HashMap::new();
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|x| x.to_str()) != Some("json") {
                continue;
            }
            match std::fs::read_to_string(&path)
                .map_err(anyhow::Error::from)
                .and_then(|x| Ok(serde_json::from_str::<LastFrameMetadata>(&x)?))
            {
                Ok(record) => {
                    records.insert(record.stream.clone(), record);
                }
                Err(e) => warn!("skipping last frame metadata {}: {e:#}", path.display()),
            }
        }
        Ok(Self {
            dir,
            quality,
            records: RwLock::new(records),
        })
    }

    pub fn image_path(&self, stream: &str) -> Option<PathBuf> {
        Some(self.dir.join(format!("{}.jpg", file_stem(stream)?)))
    }
}

impl LastFrameStore for FileLastFrameStore {
    fn get(&self, stream: &str) -> Option<LastFrameMetadata> {
        self.records
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(stream)
            .cloned()
    }

    fn upsert(&self, frame: LastFrame<'_>) -> Result<()> {
        let stem = file_stem(frame.stream).context("stream token is not a valid file name")?;
        let record = LastFrameMetadata {
            stream: frame.stream.to_string(),
            width: frame.image.width(),
            height: frame.image.height(),
            fps: frame.fps,
            updated_at: frame.updated_at,
        };
        let jpeg = encode_jpeg(frame.image, self.quality)?;
        write_atomic(&self.dir.join(format!("{stem}.jpg")), &jpeg)?;
        write_atomic(
            &self.dir.join(format!("{stem}.json")),
            serde_json::to_string(&record)?.as_bytes(),
        )?;
        self.records
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(record.stream.clone(), record);
        Ok(())
    }
}

/// Intrusion events as `{id}.jpg` snapshots with `{id}.json` metadata.
pub struct FileEventLog {
    dir: PathBuf,
    quality: u8,
}

impl FileEventLog {
    pub fn open(dir: impl Into<PathBuf>, quality: u8) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
        Ok(Self { dir, quality })
    }

    pub fn snapshot_path(&self, id: Uuid) -> PathBuf {
        self.dir.join(format!("{id}.jpg"))
    }

    /// All recorded events, newest first.
    pub async fn list(&self) -> Result<Vec<IntrusionEvent>> {
        let mut read_dir = tokio::fs::read_dir(&self.dir).await?;
        let mut entries = vec![];
        while let Some(entry) = read_dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|x| x.to_str()) != Some("json") {
                continue;
            }
            let parsed: IntrusionEvent =
                match serde_json::from_str(&tokio::fs::read_to_string(&path).await?) {
                    Ok(x) => x,
                    Err(e) => {
                        warn!("skipping event metadata {}: {e}", path.display());
                        continue;
                    }
                };
            entries.push(parsed);
        }
        entries.sort_by(|a, b| b.when.cmp(&a.when));
        Ok(entries)
    }
}

impl EventLog for FileEventLog {
    fn record(&self, event: NewEvent<'_>) -> Result<IntrusionEvent> {
        let record = IntrusionEvent {
            id: Uuid::new_v4(),
            stream: event.device.token.clone(),
            device: event.device.name.clone(),
            kind: event.kind,
            score: event.score,
            when: event.when,
        };
        let jpeg = encode_jpeg(event.snapshot, self.quality)?;
        write_atomic(&self.snapshot_path(record.id), &jpeg)?;
        // metadata last: an event is only listed once its snapshot exists
        write_atomic(
            &self.dir.join(format!("{}.json", record.id)),
            serde_json::to_string(&record)?.as_bytes(),
        )?;
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use image::{Rgb, RgbImage};

    use super::*;
    use crate::event::EventKind;

    fn device() -> Device {
        Device {
            name: "porch".to_string(),
            token: "abc123".to_string(),
            sensitivity: 0.2,
            active: true,
            alert_priority: None,
        }
    }

    fn frame() -> RgbImage {
        RgbImage::from_pixel(32, 24, Rgb([40, 80, 120]))
    }

    #[test]
    fn registry_resolves_tokens() {
        let mut devices = IndexMap::new();
        devices.insert(
            "porch".to_string(),
            DeviceConfig {
                token: "abc123".to_string(),
                sensitivity: 0.2,
                active: false,
                alert_priority: None,
            },
        );
        let registry = ConfigRegistry::new(&devices);
        let device = registry.lookup("abc123").unwrap();
        assert_eq!(device.name, "porch");
        assert!(!device.active);
        assert!(registry.lookup("porch").is_none());
    }

    #[test]
    fn last_frame_overwrites_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileLastFrameStore::open(dir.path(), 75).unwrap();
        assert!(store.get("abc123").is_none());

        let first = Utc::now();
        for (fps, when) in [(0.0, first), (2.0, first + Duration::milliseconds(500))] {
            store
                .upsert(LastFrame {
                    stream: "abc123",
                    image: &frame(),
                    fps,
                    updated_at: when,
                })
                .unwrap();
        }
        let record = store.get("abc123").unwrap();
        assert_eq!((record.width, record.height, record.fps), (32, 24, 2.0));

        let jpeg = std::fs::read(store.image_path("abc123").unwrap()).unwrap();
        assert_eq!(image::load_from_memory(&jpeg).unwrap().width(), 32);

        let reopened = FileLastFrameStore::open(dir.path(), 75).unwrap();
        assert_eq!(reopened.get("abc123"), Some(record));
    }

    #[test]
    fn last_frame_rejects_path_tokens() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileLastFrameStore::open(dir.path(), 75).unwrap();
        assert!(store.image_path("../etc").is_none());
        assert!(store
            .upsert(LastFrame {
                stream: "../etc",
                image: &frame(),
                fps: 0.0,
                updated_at: Utc::now(),
            })
            .is_err());
    }

    #[tokio::test]
    async fn events_are_listed_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let log = FileEventLog::open(dir.path(), 85).unwrap();
        let device = device();
        let now = Utc::now();
        let older = log
            .record(NewEvent {
                device: &device,
                kind: EventKind::Motion,
                score: 0.31,
                snapshot: &frame(),
                when: now - Duration::seconds(10),
            })
            .unwrap();
        let newer = log
            .record(NewEvent {
                device: &device,
                kind: EventKind::Human,
                score: 1.7,
                snapshot: &frame(),
                when: now,
            })
            .unwrap();
        assert!(log.snapshot_path(older.id).exists());

        let listed = log.list().await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, newer.id);
        assert_eq!(listed[0].kind, EventKind::Human);
        assert_eq!(listed[1].score, 0.31);
        assert_eq!(listed[1].device, "porch");
    }
}

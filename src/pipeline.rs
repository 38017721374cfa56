use std::sync::Arc;

use chrono::{DateTime, Utc};
use image::RgbImage;
use log::{debug, error, info, warn};
use prometheus::{
    register_histogram_vec, register_int_counter_vec, HistogramVec, IntCounterVec,
};
use thiserror::Error;

use crate::{
    config::PushoverPriority,
    event::{EventKind, IntrusionEvent, LastFrameMetadata},
    frame::{decode_frame, DecodeError},
    modect::MotionDetector,
    person::PersonDetect,
};

lazy_static::lazy_static! {
    static ref FRAME_COUNTER: IntCounterVec = register_int_counter_vec!("watchpost_frames", "decoded frames processed", &["camera"]).unwrap();
    static ref DECODE_REJECT: IntCounterVec = register_int_counter_vec!("watchpost_decode_reject", "frames rejected as undecodable", &["camera"]).unwrap();
    static ref MOTION_SCORE: HistogramVec = register_histogram_vec!("watchpost_motion_score", "fraction of changed pixels per frame", &["camera"], vec![0.0, 0.01, 0.05, 0.1, 0.2, 0.3, 0.5, 0.75, 1.0]).unwrap();
    static ref PERSON_CHECKS: IntCounterVec = register_int_counter_vec!("watchpost_person_checks", "person classifier invocations", &["camera"]).unwrap();
    static ref EVENTS: IntCounterVec = register_int_counter_vec!("watchpost_events", "intrusion events recorded", &["camera", "kind"]).unwrap();
}

const FPS_MIN: f64 = 0.1;
const FPS_MAX: f64 = 30.0;
// weight of the newest interval in the reported rate
const FPS_SMOOTHING: f64 = 0.5;

#[derive(Clone, Debug)]
pub struct Device {
    pub name: String,
    pub token: String,
    pub sensitivity: f64,
    pub active: bool,
    pub alert_priority: Option<PushoverPriority>,
}

pub trait DeviceRegistry: Send + Sync {
    fn lookup(&self, token: &str) -> Option<Device>;
}

pub struct LastFrame<'a> {
    pub stream: &'a str,
    pub image: &'a RgbImage,
    pub fps: f64,
    pub updated_at: DateTime<Utc>,
}

pub trait LastFrameStore: Send + Sync {
    fn get(&self, stream: &str) -> Option<LastFrameMetadata>;

    fn upsert(&self, frame: LastFrame<'_>) -> anyhow::Result<()>;
}

pub struct NewEvent<'a> {
    pub device: &'a Device,
    pub kind: EventKind,
    pub score: f64,
    pub snapshot: &'a RgbImage,
    pub when: DateTime<Utc>,
}

pub trait EventLog: Send + Sync {
    fn record(&self, event: NewEvent<'_>) -> anyhow::Result<IntrusionEvent>;
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("unknown stream token")]
    UnknownStream,
    #[error("device '{0}' is inactive")]
    InactiveStream(String),
    #[error("{0}")]
    Decode(#[from] DecodeError),
}

#[derive(Debug)]
pub struct FrameVerdict {
    pub device: Device,
    pub motion_score: f64,
    pub person_detected: bool,
    pub person_score: f64,
    pub event: Option<IntrusionEvent>,
}

impl FrameVerdict {
    pub fn event_created(&self) -> bool {
        self.event.is_some()
    }
}

/// Smoothed frame rate from the time since the previous last-frame update.
pub fn update_fps(previous: Option<&LastFrameMetadata>, now: DateTime<Utc>) -> f64 {
    let Some(previous) = previous else {
        return 0.0;
    };
    let mut seconds = (now - previous.updated_at).num_milliseconds() as f64 / 1000.0;
    if seconds == 0.0 {
        seconds = 1.0;
    }
    let instant = (1.0 / seconds).clamp(FPS_MIN, FPS_MAX);
    if previous.fps <= 0.0 {
        return instant;
    }
    (FPS_SMOOTHING * instant + (1.0 - FPS_SMOOTHING) * previous.fps).clamp(FPS_MIN, FPS_MAX)
}

/// Decode, motion check, gated person check, event and last-frame updates
/// for one inbound frame.
pub struct Pipeline {
    motion: MotionDetector,
    person: Arc<dyn PersonDetect>,
    registry: Arc<dyn DeviceRegistry>,
    last_frames: Arc<dyn LastFrameStore>,
    events: Arc<dyn EventLog>,
}

impl Pipeline {
    pub fn new(
        motion: MotionDetector,
        person: Arc<dyn PersonDetect>,
        registry: Arc<dyn DeviceRegistry>,
        last_frames: Arc<dyn LastFrameStore>,
        events: Arc<dyn EventLog>,
    ) -> Self {
        Self {
            motion,
            person,
            registry,
            last_frames,
            events,
        }
    }

    pub fn motion(&self) -> &MotionDetector {
        &self.motion
    }

    pub fn registry(&self) -> &dyn DeviceRegistry {
        &*self.registry
    }

    /// Resolves `token` to an active device. Inactive devices lose their
    /// motion reference so a later reactivation starts cold.
    pub fn device(&self, token: &str) -> Result<Device, PipelineError> {
        let device = self
            .registry
            .lookup(token)
            .ok_or(PipelineError::UnknownStream)?;
        if !device.active {
            self.motion.evict(token);
            return Err(PipelineError::InactiveStream(device.name));
        }
        Ok(device)
    }

    pub fn process_frame(&self, token: &str, bytes: &[u8]) -> Result<FrameVerdict, PipelineError> {
        self.process_frame_at(token, bytes, Utc::now())
    }

    pub fn process_frame_at(
        &self,
        token: &str,
        bytes: &[u8],
        now: DateTime<Utc>,
    ) -> Result<FrameVerdict, PipelineError> {
        let device = self.device(token)?;
        let frame = match decode_frame(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                DECODE_REJECT.with_label_values(&[&device.name]).inc();
                warn!("{}: rejected frame: {e}", device.name);
                return Err(e.into());
            }
        };
        Ok(self.analyze(device, &frame, now))
    }

    /// Runs detection on an already decoded frame.
    ///
    /// Frames of one stream are handled one at a time from the motion
    /// comparison through the last-frame update.
    pub fn analyze(&self, device: Device, frame: &RgbImage, now: DateTime<Utc>) -> FrameVerdict {
        FRAME_COUNTER.with_label_values(&[&device.name]).inc();
        self.motion
            .detect_motion_then(&device.token, frame, device.sensitivity, |motion| {
                self.after_motion(&device, frame, now, motion.score)
            })
    }

    fn after_motion(
        &self,
        device: &Device,
        frame: &RgbImage,
        now: DateTime<Utc>,
        motion_score: f64,
    ) -> FrameVerdict {
        MOTION_SCORE
            .with_label_values(&[&device.name])
            .observe(motion_score);
        let motion_triggered = motion_score > device.sensitivity;

        // the classifier is the expensive step and only runs behind a motion trigger
        let person = if motion_triggered {
            PERSON_CHECKS.with_label_values(&[&device.name]).inc();
            self.person.detect_person(frame)
        } else {
            Default::default()
        };
        let person_triggered = motion_triggered && person.detected;

        debug!(
            "{}: motion={:.04} (> {:.02}: {motion_triggered}), person={person_triggered} ({:.03})",
            device.name, motion_score, device.sensitivity, person.score
        );

        let event = if motion_triggered {
            let (kind, score) = if person_triggered {
                (EventKind::Human, person.score)
            } else {
                (EventKind::Motion, motion_score)
            };
            match self.events.record(NewEvent {
                device,
                kind,
                score,
                snapshot: frame,
                when: now,
            }) {
                Ok(event) => {
                    EVENTS
                        .with_label_values(&[&device.name, kind.as_str()])
                        .inc();
                    info!("{}: {} event {} ({score:.03})", device.name, kind.as_str(), event.id);
                    Some(event)
                }
                Err(e) => {
                    error!("{}: failed to record event: {e:#}", device.name);
                    None
                }
            }
        } else {
            None
        };

        let fps = update_fps(self.last_frames.get(&device.token).as_ref(), now);
        if let Err(e) = self.last_frames.upsert(LastFrame {
            stream: &device.token,
            image: frame,
            fps,
            updated_at: now,
        }) {
            error!("{}: failed to store last frame: {e:#}", device.name);
        }

        FrameVerdict {
            device: device.clone(),
            motion_score,
            person_detected: person_triggered,
            person_score: if person_triggered { person.score } else { 0.0 },
            event,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        io::Cursor,
        sync::{
            atomic::{AtomicBool, AtomicUsize, Ordering},
            Mutex,
        },
    };

    use chrono::Duration;
    use image::{ImageOutputFormat, Rgb};

    use super::*;
    use crate::{modect::MotionDetectorConfig, person::PersonDetection};

    struct Registry(HashMap<String, Device>);

    impl DeviceRegistry for Registry {
        fn lookup(&self, token: &str) -> Option<Device> {
            self.0.get(token).cloned()
        }
    }

    #[derive(Default)]
    struct MemoryLastFrames {
        records: Mutex<HashMap<String, LastFrameMetadata>>,
        writes: AtomicUsize,
    }

    impl LastFrameStore for MemoryLastFrames {
        fn get(&self, stream: &str) -> Option<LastFrameMetadata> {
            self.records.lock().unwrap().get(stream).cloned()
        }

        fn upsert(&self, frame: LastFrame<'_>) -> anyhow::Result<()> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            self.records.lock().unwrap().insert(
                frame.stream.to_string(),
                LastFrameMetadata {
                    stream: frame.stream.to_string(),
                    width: frame.image.width(),
                    height: frame.image.height(),
                    fps: frame.fps,
                    updated_at: frame.updated_at,
                },
            );
            Ok(())
        }
    }

    #[derive(Default)]
    struct MemoryEvents {
        events: Mutex<Vec<IntrusionEvent>>,
        fail: bool,
    }

    impl EventLog for MemoryEvents {
        fn record(&self, event: NewEvent<'_>) -> anyhow::Result<IntrusionEvent> {
            if self.fail {
                anyhow::bail!("disk full");
            }
            let event = IntrusionEvent {
                id: uuid::Uuid::new_v4(),
                stream: event.device.token.clone(),
                device: event.device.name.clone(),
                kind: event.kind,
                score: event.score,
                when: event.when,
            };
            self.events.lock().unwrap().push(event.clone());
            Ok(event)
        }
    }

    struct FakePerson {
        result: PersonDetection,
        calls: AtomicUsize,
    }

    impl FakePerson {
        fn new(detected: bool, score: f64) -> Self {
            Self {
                result: PersonDetection { detected, score },
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl PersonDetect for FakePerson {
        fn detect_person(&self, _frame: &RgbImage) -> PersonDetection {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.result
        }
    }

    struct Harness {
        pipeline: Pipeline,
        person: Arc<FakePerson>,
        last_frames: Arc<MemoryLastFrames>,
        events: Arc<MemoryEvents>,
    }

    fn device(token: &str, active: bool) -> Device {
        Device {
            name: format!("{token}-name"),
            token: token.to_string(),
            sensitivity: 0.15,
            active,
            alert_priority: None,
        }
    }

    fn harness(person: FakePerson, events: MemoryEvents) -> Harness {
        let person = Arc::new(person);
        let last_frames = Arc::new(MemoryLastFrames::default());
        let events = Arc::new(events);
        let registry = Registry(
            [device("dev1", true), device("dev2", true), device("off", false)]
                .into_iter()
                .map(|x| (x.token.clone(), x))
                .collect(),
        );
        Harness {
            pipeline: Pipeline::new(
                MotionDetector::new(MotionDetectorConfig::default()),
                person.clone(),
                Arc::new(registry),
                last_frames.clone(),
                events.clone(),
            ),
            person,
            last_frames,
            events,
        }
    }

    fn gray() -> RgbImage {
        RgbImage::from_pixel(100, 100, Rgb([128, 128, 128]))
    }

    fn thirty_percent_white() -> RgbImage {
        let mut frame = gray();
        for y in 0..30 {
            for x in 0..100 {
                frame.put_pixel(x, y, Rgb([255, 255, 255]));
            }
        }
        frame
    }

    fn png(frame: &RgbImage) -> Vec<u8> {
        let mut out = Cursor::new(Vec::new());
        frame.write_to(&mut out, ImageOutputFormat::Png).unwrap();
        out.into_inner()
    }

    #[test]
    fn motion_scenario_without_person() {
        let h = harness(FakePerson::new(false, 0.0), MemoryEvents::default());
        let now = Utc::now();

        let first = h.pipeline.process_frame_at("dev1", &png(&gray()), now).unwrap();
        assert_eq!(first.motion_score, 0.0);
        assert!(!first.event_created());

        let second = h.pipeline.process_frame_at("dev1", &png(&gray()), now).unwrap();
        assert_eq!(second.motion_score, 0.0);
        assert!(!second.event_created());
        assert_eq!(h.person.calls.load(Ordering::SeqCst), 0);

        let third = h
            .pipeline
            .process_frame_at("dev1", &png(&thirty_percent_white()), now)
            .unwrap();
        assert!((third.motion_score - 0.30).abs() < 0.05);
        assert_eq!(h.person.calls.load(Ordering::SeqCst), 1);
        assert!(!third.person_detected);
        let event = third.event.unwrap();
        assert_eq!(event.kind, EventKind::Motion);
        assert_eq!(event.score, third.motion_score);

        let fourth = h
            .pipeline
            .process_frame_at("dev1", &png(&thirty_percent_white()), now)
            .unwrap();
        assert_eq!(fourth.motion_score, 0.0);
        assert!(!fourth.event_created());
        assert_eq!(h.events.events.lock().unwrap().len(), 1);
    }

    #[test]
    fn person_score_drives_human_event() {
        let h = harness(FakePerson::new(true, 2.75), MemoryEvents::default());
        let now = Utc::now();
        h.pipeline.analyze(device("dev1", true), &gray(), now);
        let verdict = h.pipeline.analyze(device("dev1", true), &thirty_percent_white(), now);
        assert!(verdict.person_detected);
        assert_eq!(verdict.person_score, 2.75);
        let event = verdict.event.unwrap();
        assert_eq!(event.kind, EventKind::Human);
        assert_eq!(event.score, 2.75);
    }

    #[test]
    fn person_check_gated_by_sensitivity() {
        let h = harness(FakePerson::new(true, 1.0), MemoryEvents::default());
        let now = Utc::now();
        let mut insensitive = device("dev1", true);
        insensitive.sensitivity = 0.9;
        h.pipeline.analyze(insensitive.clone(), &gray(), now);
        let verdict = h.pipeline.analyze(insensitive, &thirty_percent_white(), now);
        assert!(verdict.motion_score > 0.0);
        assert_eq!(h.person.calls.load(Ordering::SeqCst), 0);
        assert!(!verdict.person_detected);
        assert_eq!(verdict.person_score, 0.0);
        assert!(!verdict.event_created());
    }

    #[test]
    fn every_decoded_frame_updates_last_frame_once() {
        let h = harness(FakePerson::new(false, 0.0), MemoryEvents::default());
        let now = Utc::now();
        for (i, frame) in [gray(), gray(), thirty_percent_white()].iter().enumerate() {
            h.pipeline
                .process_frame_at("dev1", &png(frame), now + Duration::milliseconds(500 * i as i64))
                .unwrap();
            assert_eq!(h.last_frames.writes.load(Ordering::SeqCst), i + 1);
        }
        let record = h.last_frames.get("dev1").unwrap();
        assert_eq!((record.width, record.height), (100, 100));
        assert!(record.fps > 0.0);
    }

    #[test]
    fn decode_failure_mutates_nothing() {
        let h = harness(FakePerson::new(false, 0.0), MemoryEvents::default());
        let err = h.pipeline.process_frame("dev1", b"garbage!").unwrap_err();
        assert!(matches!(err, PipelineError::Decode(_)));
        assert_eq!(h.last_frames.writes.load(Ordering::SeqCst), 0);
        assert_eq!(h.pipeline.motion().stream_count(), 0);
    }

    #[test]
    fn unknown_and_inactive_streams_are_rejected() {
        let h = harness(FakePerson::new(false, 0.0), MemoryEvents::default());
        assert!(matches!(
            h.pipeline.process_frame("nope", &png(&gray())),
            Err(PipelineError::UnknownStream)
        ));
        assert!(matches!(
            h.pipeline.process_frame("off", &png(&gray())),
            Err(PipelineError::InactiveStream(name)) if name == "off-name"
        ));
        assert_eq!(h.last_frames.writes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn event_log_failure_is_not_fatal() {
        let h = harness(
            FakePerson::new(false, 0.0),
            MemoryEvents {
                fail: true,
                ..Default::default()
            },
        );
        let now = Utc::now();
        h.pipeline.analyze(device("dev1", true), &gray(), now);
        let verdict = h.pipeline.analyze(device("dev1", true), &thirty_percent_white(), now);
        assert!(verdict.motion_score > 0.15);
        assert!(!verdict.event_created());
        assert_eq!(h.last_frames.writes.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn streams_do_not_share_reference_frames() {
        let h = harness(FakePerson::new(false, 0.0), MemoryEvents::default());
        let now = Utc::now();
        h.pipeline.analyze(device("dev1", true), &gray(), now);
        let other = h.pipeline.analyze(device("dev2", true), &thirty_percent_white(), now);
        assert_eq!(other.motion_score, 0.0);
        assert!(!other.event_created());
    }

    /// Flags a `get` that starts before the previous `upsert` of the same
    /// stream finished.
    #[derive(Default)]
    struct OverlapLastFrames {
        inner: MemoryLastFrames,
        busy: AtomicBool,
        overlaps: AtomicUsize,
    }

    impl LastFrameStore for OverlapLastFrames {
        fn get(&self, stream: &str) -> Option<LastFrameMetadata> {
            if self.busy.swap(true, Ordering::SeqCst) {
                self.overlaps.fetch_add(1, Ordering::SeqCst);
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
            self.inner.get(stream)
        }

        fn upsert(&self, frame: LastFrame<'_>) -> anyhow::Result<()> {
            std::thread::sleep(std::time::Duration::from_millis(5));
            let out = self.inner.upsert(frame);
            self.busy.store(false, Ordering::SeqCst);
            out
        }
    }

    #[test]
    fn last_frame_updates_of_one_stream_do_not_interleave() {
        let last_frames = Arc::new(OverlapLastFrames::default());
        let registry = Registry([("dev1".to_string(), device("dev1", true))].into_iter().collect());
        let pipeline = Pipeline::new(
            MotionDetector::new(MotionDetectorConfig::default()),
            Arc::new(FakePerson::new(false, 0.0)),
            Arc::new(registry),
            last_frames.clone(),
            Arc::new(MemoryEvents::default()),
        );
        let now = Utc::now();
        std::thread::scope(|scope| {
            for i in 0..8 {
                let pipeline = &pipeline;
                scope.spawn(move || {
                    pipeline.analyze(device("dev1", true), &gray(), now + Duration::milliseconds(i));
                });
            }
        });
        assert_eq!(last_frames.overlaps.load(Ordering::SeqCst), 0);
        assert_eq!(last_frames.inner.writes.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn fps_is_clamped_and_smoothed() {
        let now = Utc::now();
        assert_eq!(update_fps(None, now), 0.0);

        let previous = |fps: f64, ago_ms: i64| LastFrameMetadata {
            stream: "dev1".to_string(),
            width: 1,
            height: 1,
            fps,
            updated_at: now - Duration::milliseconds(ago_ms),
        };
        assert_eq!(update_fps(Some(&previous(0.0, 500)), now), 2.0);
        assert_eq!(update_fps(Some(&previous(0.0, 0)), now), 1.0);
        assert_eq!(update_fps(Some(&previous(0.0, 1)), now), 30.0);
        assert_eq!(update_fps(Some(&previous(0.0, 60_000)), now), 0.1);
        assert_eq!(update_fps(Some(&previous(4.0, 500)), now), 3.0);
    }
}

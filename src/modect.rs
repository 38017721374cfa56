use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
    time::{Duration, Instant},
};

use image::{GrayImage, Luma, RgbImage};
use imageproc::filter::gaussian_blur_f32;
use log::{trace, warn};
use serde::{Deserialize, Serialize};

fn default_pixel_threshold() -> u8 {
    25
}

fn default_blur_sigma() -> f32 {
    1.1
}

fn default_idle_timeout_secs() -> u64 {
    600
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct MotionDetectorConfig {
    /// Per-pixel intensity change (0-255) above which a pixel counts as moving.
    #[serde(default = "default_pixel_threshold")]
    pub pixel_threshold: u8,
    /// Gaussian sigma, roughly a 5x5 kernel at the default.
    #[serde(default = "default_blur_sigma")]
    pub blur_sigma: f32,
    /// Streams without a frame for this long lose their reference frame.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
}

impl Default for MotionDetectorConfig {
    fn default() -> Self {
        Self {
            pixel_threshold: default_pixel_threshold(),
            blur_sigma: default_blur_sigma(),
            idle_timeout_secs: default_idle_timeout_secs(),
        }
    }
}

impl MotionDetectorConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

pub struct MotionResult {
    /// Fraction of changed pixels, in [0, 1].
    pub score: f64,
    /// 255 where a pixel changed. Absent on a cold start.
    pub mask: Option<GrayImage>,
}

impl MotionResult {
    fn cold_start() -> Self {
        Self {
            score: 0.0,
            mask: None,
        }
    }
}

struct ReferenceFrame {
    image: GrayImage,
    last_seen: Instant,
}

#[derive(Default)]
struct StreamSlot {
    reference: Option<ReferenceFrame>,
    // set once the slot is unlinked from the map; holders of a stale Arc retry
    evicted: bool,
}

/// Reference frames keyed by stream token.
///
/// The outer map is only locked long enough to find or create a slot. Each
/// slot has its own lock, held for the whole compare-and-replace, so frames
/// of one stream are processed strictly one after another while different
/// streams never wait on each other. Lock order is map, then slot.
#[derive(Default)]
struct StreamStore {
    slots: Mutex<HashMap<String, Arc<Mutex<StreamSlot>>>>,
}

fn lock_slot(slot: &Mutex<StreamSlot>) -> MutexGuard<'_, StreamSlot> {
    slot.lock().unwrap_or_else(|e| e.into_inner())
}

impl StreamStore {
    fn slots(&self) -> MutexGuard<'_, HashMap<String, Arc<Mutex<StreamSlot>>>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn slot(&self, stream: &str) -> Arc<Mutex<StreamSlot>> {
        self.slots()
            .entry(stream.to_string())
            .or_default()
            .clone()
    }
}

pub struct MotionDetector {
    config: MotionDetectorConfig,
    streams: StreamStore,
}

impl MotionDetector {
    pub fn new(config: MotionDetectorConfig) -> Self {
        Self {
            config,
            streams: StreamStore::default(),
        }
    }

    pub fn config(&self) -> &MotionDetectorConfig {
        &self.config
    }

    fn prepare(&self, frame: &RgbImage) -> GrayImage {
        let gray = image::imageops::grayscale(frame);
        gaussian_blur_f32(&gray, self.config.blur_sigma)
    }

    /// Compares `frame` against the previous frame of `stream` and makes it
    /// the new reference.
    ///
    /// `sensitivity` does not influence the score; it is only used to annotate
    /// the trace output.
    pub fn detect_motion(&self, stream: &str, frame: &RgbImage, sensitivity: f64) -> MotionResult {
        self.detect_motion_then(stream, frame, sensitivity, |result| result)
    }

    /// Like [`MotionDetector::detect_motion`], then runs `then` on the result
    /// before the stream is released, so follow-up work for a frame is
    /// ordered the same way as the motion comparison.
    pub fn detect_motion_then<R>(
        &self,
        stream: &str,
        frame: &RgbImage,
        sensitivity: f64,
        then: impl FnOnce(MotionResult) -> R,
    ) -> R {
        let current = self.prepare(frame);
        loop {
            let slot = self.streams.slot(stream);
            let mut slot = lock_slot(&slot);
            if slot.evicted {
                continue;
            }
            let result = self.compare_and_replace(stream, &mut slot, current, sensitivity);
            return then(result);
        }
    }

    fn compare_and_replace(
        &self,
        stream: &str,
        slot: &mut StreamSlot,
        current: GrayImage,
        sensitivity: f64,
    ) -> MotionResult {
        let result = match slot.reference.take() {
            None => {
                trace!("{stream}: cold start");
                MotionResult::cold_start()
            }
            Some(previous) if previous.image.dimensions() != current.dimensions() => {
                warn!(
                    "{stream}: frame size changed from {:?} to {:?}, resetting reference",
                    previous.image.dimensions(),
                    current.dimensions()
                );
                MotionResult::cold_start()
            }
            Some(previous) => {
                let (score, mask) =
                    frame_diff(&previous.image, &current, self.config.pixel_threshold);
                trace!(
                    "{stream}: motion {score:.04} (sensitivity {sensitivity:.02}, triggered = {})",
                    score > sensitivity
                );
                MotionResult {
                    score,
                    mask: Some(mask),
                }
            }
        };
        // always the frame just seen, moving or not
        slot.reference = Some(ReferenceFrame {
            image: current,
            last_seen: Instant::now(),
        });
        result
    }

    /// Drops the reference frame of `stream`; its next frame is a cold start.
    pub fn evict(&self, stream: &str) -> bool {
        let mut slots = self.streams.slots();
        let Some(slot) = slots.remove(stream) else {
            return false;
        };
        // waits out a frame in flight, which then counts as before the eviction
        let mut slot = lock_slot(&slot);
        slot.evicted = true;
        slot.reference = None;
        true
    }

    /// Drops every stream that has not delivered a frame within `ttl`.
    pub fn evict_idle(&self, ttl: Duration) -> usize {
        let mut slots = self.streams.slots();
        let before = slots.len();
        slots.retain(|_, slot| {
            // a busy slot is being fed right now
            let Ok(mut slot) = slot.try_lock() else {
                return true;
            };
            let fresh = slot
                .reference
                .as_ref()
                .map(|x| x.last_seen.elapsed() < ttl)
                .unwrap_or(false);
            if !fresh {
                slot.evicted = true;
                slot.reference = None;
            }
            fresh
        });
        before - slots.len()
    }

    pub fn stream_count(&self) -> usize {
        self.streams.slots().len()
    }
}

/// Binarized absolute difference of two equally sized grayscale frames.
pub fn frame_diff(previous: &GrayImage, current: &GrayImage, threshold: u8) -> (f64, GrayImage) {
    assert_eq!(previous.dimensions(), current.dimensions());
    let (width, height) = current.dimensions();
    let mut mask = GrayImage::new(width, height);
    let mut changed = 0u64;
    for ((pixel1, pixel2), out) in previous.pixels().zip(current.pixels()).zip(mask.pixels_mut()) {
        if pixel1.0[0].abs_diff(pixel2.0[0]) > threshold {
            changed += 1;
            *out = Luma([255]);
        }
    }
    let total = width as u64 * height as u64;
    if total == 0 {
        return (0.0, mask);
    }
    (changed as f64 / total as f64, mask)
}

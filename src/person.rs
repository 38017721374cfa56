use std::path::PathBuf;

use image::{imageops, imageops::FilterType, GrayImage, RgbImage};
use imageproc::hog::{hog, HogOptions, HogSpec};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct PersonDetection {
    pub detected: bool,
    /// Highest confidence among accepted windows, 0.0 when none.
    pub score: f64,
}

/// Human-shape classifier run over a whole frame.
pub trait PersonDetect: Send + Sync {
    fn detect_person(&self, frame: &RgbImage) -> PersonDetection;
}

/// Used when no classifier model is configured.
pub struct NoPersonDetector;

impl PersonDetect for NoPersonDetector {
    fn detect_person(&self, _frame: &RgbImage) -> PersonDetection {
        PersonDetection::default()
    }
}

fn default_hit_threshold() -> f64 {
    0.0
}

fn default_window_stride() -> u32 {
    8
}

fn default_scale_step() -> f64 {
    1.05
}

fn default_max_levels() -> usize {
    64
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct PersonDetectorConfig {
    /// JSON file holding a [`HogSvmModel`].
    pub model: PathBuf,
    #[serde(default = "default_hit_threshold")]
    pub hit_threshold: f64,
    #[serde(default = "default_window_stride")]
    pub window_stride: u32,
    #[serde(default = "default_scale_step")]
    pub scale_step: f64,
    /// Upper bound on pyramid levels; scanning otherwise continues until the
    /// scaled frame no longer fits one window.
    #[serde(default = "default_max_levels")]
    pub max_levels: usize,
}

fn default_window_width() -> u32 {
    64
}

fn default_window_height() -> u32 {
    128
}

fn default_orientations() -> usize {
    9
}

fn default_cell_side() -> usize {
    8
}

fn default_block_side() -> usize {
    2
}

fn default_block_stride() -> usize {
    1
}

/// Linear SVM over HOG descriptors of a fixed detection window.
///
/// Stored as JSON. Only `weights` and `bias` are required; the layout fields
/// default to the 64x128 pedestrian window with 8px cells, 2x2 blocks at a one
/// cell stride and 9 unsigned bins, for which `weights` holds 3780 values.
/// A window is accepted when `weights · hog(window) + bias` exceeds the
/// configured hit threshold.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct HogSvmModel {
    #[serde(default = "default_window_width")]
    pub window_width: u32,
    #[serde(default = "default_window_height")]
    pub window_height: u32,
    #[serde(default = "default_orientations")]
    pub orientations: usize,
    #[serde(default)]
    pub signed: bool,
    #[serde(default = "default_cell_side")]
    pub cell_side: usize,
    #[serde(default = "default_block_side")]
    pub block_side: usize,
    #[serde(default = "default_block_stride")]
    pub block_stride: usize,
    pub weights: Vec<f32>,
    pub bias: f32,
}

impl HogSvmModel {
    fn options(&self) -> HogOptions {
        HogOptions::new(
            self.orientations,
            self.signed,
            self.cell_side,
            self.block_side,
            self.block_stride,
        )
    }
}

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("failed to read model: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse model: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid HOG layout: {0}")]
    Layout(String),
    #[error("model has {actual} weights, HOG descriptor has {expected}")]
    WeightCount { expected: usize, actual: usize },
    #[error("window stride must be positive")]
    Stride,
    #[error("scale step must be greater than 1, got {0}")]
    ScaleStep(f64),
}

pub struct HogPersonDetector {
    model: HogSvmModel,
    hit_threshold: f64,
    window_stride: u32,
    scale_step: f64,
    max_levels: usize,
}

impl HogPersonDetector {
    pub fn new(model: HogSvmModel, config: &PersonDetectorConfig) -> Result<Self, ModelError> {
        let layout = HogSpec::from_options(model.window_width, model.window_height, model.options())
            .map_err(ModelError::Layout)?;
        if layout.descriptor_length() != model.weights.len() {
            return Err(ModelError::WeightCount {
                expected: layout.descriptor_length(),
                actual: model.weights.len(),
            });
        }
        if config.window_stride == 0 {
            return Err(ModelError::Stride);
        }
        if !(config.scale_step > 1.0) {
            return Err(ModelError::ScaleStep(config.scale_step));
        }
        Ok(Self {
            model,
            hit_threshold: config.hit_threshold,
            window_stride: config.window_stride,
            scale_step: config.scale_step,
            max_levels: config.max_levels,
        })
    }

    pub fn load(config: &PersonDetectorConfig) -> Result<Self, ModelError> {
        let model: HogSvmModel = serde_json::from_str(&std::fs::read_to_string(&config.model)?)?;
        info!(
            "loaded person model {} ({}x{} window, {} weights)",
            config.model.display(),
            model.window_width,
            model.window_height,
            model.weights.len()
        );
        Self::new(model, config)
    }

    fn classify(&self, window: &GrayImage) -> Option<f64> {
        // layout was validated against the window size in `new`
        let descriptor = hog(window, self.model.options()).ok()?;
        let dot = descriptor
            .iter()
            .zip(self.model.weights.iter())
            .map(|(x, w)| (*x as f64) * (*w as f64))
            .sum::<f64>();
        Some(dot + self.model.bias as f64)
    }

    /// Scale and size of every pyramid level that still fits one window.
    fn levels(&self, width: u32, height: u32) -> Vec<(f64, u32, u32)> {
        let mut levels = vec![];
        for level in 0..self.max_levels {
            let scale = self.scale_step.powi(level as i32);
            let level_width = (width as f64 / scale).round() as u32;
            let level_height = (height as f64 / scale).round() as u32;
            if level_width < self.model.window_width || level_height < self.model.window_height {
                break;
            }
            levels.push((scale, level_width, level_height));
        }
        levels
    }

    /// Best window confidence at one pyramid level.
    fn scan(&self, level: &GrayImage) -> Option<f64> {
        let (width, height) = level.dimensions();
        let (window_width, window_height) = (self.model.window_width, self.model.window_height);
        let mut best: Option<f64> = None;
        for y in (0..=height - window_height).step_by(self.window_stride as usize) {
            for x in (0..=width - window_width).step_by(self.window_stride as usize) {
                let window = imageops::crop_imm(level, x, y, window_width, window_height).to_image();
                let Some(confidence) = self.classify(&window) else {
                    continue;
                };
                if confidence > self.hit_threshold && best.map(|b| confidence > b).unwrap_or(true) {
                    best = Some(confidence);
                }
            }
        }
        best
    }
}

impl PersonDetect for HogPersonDetector {
    fn detect_person(&self, frame: &RgbImage) -> PersonDetection {
        let gray = imageops::grayscale(frame);
        let mut best: Option<f64> = None;
        for (level, (scale, width, height)) in self.levels(gray.width(), gray.height()).into_iter().enumerate() {
            let scaled;
            let image = if level == 0 {
                &gray
            } else {
                scaled = imageops::resize(&gray, width, height, FilterType::Triangle);
                &scaled
            };
            if let Some(confidence) = self.scan(image) {
                debug!("person candidate at scale {scale:.02}: {confidence:.03}");
                if best.map(|b| confidence > b).unwrap_or(true) {
                    best = Some(confidence);
                }
            }
        }
        match best {
            Some(score) => PersonDetection {
                detected: true,
                score,
            },
            None => PersonDetection::default(),
        }
    }
}

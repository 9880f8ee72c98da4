//! Runtime configuration for a scan session.
//!
//! The configuration is a [ScanConfig], which can be loaded from a [ron]
//! file. Every field has a default, so a config file only needs to mention
//! the values it wants to change:
//!
//! ```text
//! (
//!     tracking: (auto_reset: true, failure_threshold: 20),
//!     audio: (sample_rate: 48000),
//! )
//! ```

use serde::{Deserialize, Serialize};
use std::{borrow::Cow, fmt, fs, path::Path};

/// The complete set of tunables for a [ScanSession](crate::session::ScanSession).
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Reconstruction volume and depth conversion settings
    pub volume: VolumeConfig,
    /// Tracking state machine settings
    pub tracking: TrackingConfig,
    /// Volume recentering settings
    pub recenter: RecenterConfig,
    /// Pool and queue sizes
    pub pipeline: PipelineConfig,
    /// Feedback synthesizer settings
    pub audio: AudioConfig,
}

/// Settings for the reconstruction volume and depth conversion.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct VolumeConfig {
    /// Voxels per metre along each axis
    pub voxels_per_meter: f32,
    /// Voxel count along x
    pub resolution_x: u32,
    /// Voxel count along y
    pub resolution_y: u32,
    /// Voxel count along z
    pub resolution_z: u32,
    /// Temporal smoothing weight cap used during integration
    pub integration_weight: u16,
    /// Depth samples closer than this (metres) are invalid
    pub min_depth_clip: f32,
    /// Depth samples beyond this (metres) are clamped to the far sentinel
    pub max_depth_clip: f32,
    /// Upper bound on iterations spent aligning one frame
    pub max_align_iterations: u32,
    /// Whether mapped color is integrated alongside depth
    pub integrate_color: bool,
    /// Step between voxels when extracting a mesh
    pub mesh_voxel_step: u32,
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            voxels_per_meter: 512.0,
            resolution_x: 256,
            resolution_y: 256,
            resolution_z: 256,
            integration_weight: 150,
            min_depth_clip: 0.35,
            max_depth_clip: 1.2,
            max_align_iterations: 7,
            integrate_color: true,
            mesh_voxel_step: 1,
        }
    }
}

impl VolumeConfig {
    /// Physical depth extent of the volume along z, in metres.
    pub fn depth_extent(&self) -> f32 {
        self.resolution_z as f32 / self.voxels_per_meter
    }
}

/// Settings for the tracking state machine.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct TrackingConfig {
    /// Reset the volume automatically after sustained tracking loss
    pub auto_reset: bool,
    /// Consecutive alignment failures that trigger an automatic reset
    pub failure_threshold: u32,
    /// Raycast for display every `render_interval` processed frames
    pub render_interval: u32,
    /// Mirror depth horizontally before conversion
    pub mirror_depth: bool,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            auto_reset: false,
            failure_threshold: 100,
            render_interval: 2,
            mirror_depth: false,
        }
    }
}

/// Settings for the volume recentering controller.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RecenterConfig {
    /// Position of the center between neck (0.0) and head (1.0)
    pub head_neck_blend: f32,
    /// Consecutive frames without the subject before the anchor is cleared
    pub miss_threshold: u32,
    /// Fraction of the remaining distance the anchor covers each frame
    pub smoothing: f32,
    /// Angular rate (radians per frame) of the render orbit while paused
    pub orbit_rate: f32,
    /// Center used when no joints are tracked
    pub default_center: [f32; 3],
}

impl Default for RecenterConfig {
    fn default() -> Self {
        Self {
            head_neck_blend: 0.5,
            miss_threshold: 30,
            smoothing: 0.2,
            orbit_rate: 0.02,
            default_center: [0.0, 0.0, 0.7],
        }
    }
}

/// Pool and queue capacities for the two pipeline stages.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Slots in the raw-frame pool
    pub raw_pool_capacity: usize,
    /// Slots in the fusion pool
    pub fusion_pool_capacity: usize,
    /// Maximum pending jobs in the raw stage
    pub raw_queue_depth: usize,
    /// Maximum pending jobs in the fusion stage
    pub fusion_queue_depth: usize,
    /// Undelivered snapshots kept for the presentation layer
    pub snapshot_backlog: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            raw_pool_capacity: 5,
            fusion_pool_capacity: 5,
            raw_queue_depth: 1,
            fusion_queue_depth: 2,
            snapshot_backlog: 4,
        }
    }
}

/// Longest error cue [AudioConfig::error_decay_ms] may ask for.
pub const MAX_ERROR_DECAY_MS: u64 = 60_000;

/// Settings for the feedback synthesizer and its output device.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Output sample rate in Hz
    pub sample_rate: u32,
    /// Frames rendered per device callback
    pub buffer_size: usize,
    /// MIDI semitone of the base tone
    pub base_semitone: f32,
    /// Master gain applied after mixing
    pub gain: f32,
    /// Milliseconds without a new error before the error cue falls silent
    pub error_decay_ms: u64,
    /// Whether the audio device thread runs at all
    pub enabled: bool,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44100,
            buffer_size: 512,
            base_semitone: 60.0,
            gain: 0.25,
            error_decay_ms: 500,
            enabled: true,
        }
    }
}

/// Things that can go wrong while loading or saving a [ScanConfig].
#[derive(Debug)]
pub enum ConfigError {
    /// Reading or writing the file failed
    IoError(std::io::Error),
    /// The file is not valid RON for a [ScanConfig]
    RonSpannedError(ron::de::SpannedError),
    /// Serializing the config failed
    RonError(ron::Error),
    /// A value is out of its allowed range
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let msg = match self {
            ConfigError::IoError(error) => Cow::from(format!("io error: {}", error)),
            ConfigError::RonSpannedError(error) => Cow::from(format!("ron parse error: {}", error)),
            ConfigError::RonError(error) => Cow::from(format!("ron error: {}", error)),
            ConfigError::Invalid(what) => Cow::from(format!("invalid config: {}", what)),
        };

        write!(f, "{}", msg)
    }
}

impl std::error::Error for ConfigError {}

impl ScanConfig {
    /// Read a [ScanConfig] from a RON file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(ConfigError::IoError)?;
        Self::from_ron(&text)
    }

    /// Parse a [ScanConfig] from RON text and validate it.
    pub fn from_ron(text: &str) -> Result<Self, ConfigError> {
        let config: ScanConfig = ron::de::from_str(text).map_err(ConfigError::RonSpannedError)?;
        config.validate()?;
        Ok(config)
    }

    /// Render the config as pretty RON.
    pub fn to_ron(&self) -> Result<String, ConfigError> {
        ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())
            .map_err(ConfigError::RonError)
    }

    /// Check the values that would make the pipeline misbehave.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |what: &str| Err(ConfigError::Invalid(what.to_string()));

        // Written as negated comparisons so NaN is rejected too.
        if !(self.volume.min_depth_clip >= 0.0 && self.volume.max_depth_clip > self.volume.min_depth_clip) {
            return invalid("depth clip range must satisfy 0 <= min < max");
        }
        if !(self.volume.voxels_per_meter > 0.0 && self.volume.voxels_per_meter.is_finite()) {
            return invalid("voxels_per_meter must be positive and finite");
        }
        if self.volume.mesh_voxel_step == 0 {
            return invalid("mesh_voxel_step must be at least 1");
        }
        if self.tracking.failure_threshold == 0 {
            return invalid("failure_threshold must be at least 1");
        }
        if self.pipeline.raw_pool_capacity == 0 || self.pipeline.fusion_pool_capacity == 0 {
            return invalid("pool capacities must be at least 1");
        }
        if self.pipeline.raw_queue_depth == 0 || self.pipeline.fusion_queue_depth == 0 {
            return invalid("queue depths must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.recenter.head_neck_blend) {
            return invalid("head_neck_blend must lie in [0, 1]");
        }
        if !(0.0..=1.0).contains(&self.recenter.smoothing) {
            return invalid("recenter smoothing must lie in [0, 1]");
        }
        if self.audio.sample_rate == 0 || self.audio.buffer_size == 0 {
            return invalid("audio sample_rate and buffer_size must be positive");
        }
        if self.audio.error_decay_ms > MAX_ERROR_DECAY_MS {
            return invalid("audio error_decay_ms must be at most 60000");
        }

        Ok(())
    }
}

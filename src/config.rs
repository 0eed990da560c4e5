use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

/// Top-level configuration for the coopcam system
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CoopcamConfig {
    /// Upstream camera sources; exactly one must be the default
    pub sources: Vec<SourceConfig>,

    #[serde(default)]
    pub motion: MotionConfig,

    #[serde(default)]
    pub recording: RecordingConfig,

    #[serde(default)]
    pub server: ServerConfig,

    /// Password required by the stream pause endpoint
    #[serde(default = "default_pause_password")]
    pub stream_pause_password: String,

    /// How long a pause request suspends a stream
    #[serde(default = "default_pause_duration_secs")]
    pub pause_duration_secs: u64,
}

/// A single upstream camera source
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SourceConfig {
    /// Short canonical id ("coop", "run", ...); "default" is reserved as an alias
    pub id: String,

    /// Human-readable name
    pub name: String,

    /// Upstream MJPEG URL
    pub url: String,

    /// Whether this source is the default; exactly one source must set this
    #[serde(default)]
    pub is_default: bool,

    /// Nominal source frame rate, used to size the pre-motion buffer
    #[serde(default = "default_source_fps")]
    pub fps: u32,
}

/// Motion detection pipeline configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct MotionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Sampling rate fed to the detector, frames per second
    #[serde(default = "default_motion_fps")]
    pub fps: u32,

    /// Normalized-difference decision threshold (0.0 - 1.0)
    #[serde(default = "default_motion_threshold")]
    pub threshold: f64,

    /// Minimum time between motion events for one source
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,

    /// Detection frame width after downscale
    #[serde(default = "default_motion_width")]
    pub width: u32,

    /// Detection frame height after downscale
    #[serde(default = "default_motion_height")]
    pub height: u32,

    /// Inclusive y-ranges (in detection-frame coordinates) excluded from comparison
    #[serde(default)]
    pub ignored_y_ranges: Vec<YRange>,

    #[serde(default)]
    pub shadow_removal: ShadowRemovalConfig,

    #[serde(default)]
    pub color_detection: ColorDetectionConfig,

    #[serde(default)]
    pub detection_mode: DetectionMode,

    #[serde(default)]
    pub color_first: ColorFirstConfig,

    #[serde(default)]
    pub worker_pool: WorkerPoolConfig,
}

/// An inclusive vertical pixel band
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
pub struct YRange {
    pub start: u32,
    pub end: u32,
}

impl YRange {
    pub fn contains(&self, y: u32) -> bool {
        y >= self.start && y <= self.end
    }
}

/// Which comparison strategy drives the motion decision
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMode {
    #[default]
    Traditional,
    ColorFilter,
    ColorFirst,
}

/// Shadow suppression configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ShadowRemovalConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Strength of illumination normalization applied by workers (0.0 - 1.0)
    #[serde(default = "default_shadow_intensity")]
    pub intensity: f64,

    /// Enable the temporal shadow detector (5-frame history)
    #[serde(default)]
    pub temporal_enabled: bool,

    /// Enable the regional voter
    #[serde(default)]
    pub regional_enabled: bool,

    /// Regional voter grid dimension (g x g regions)
    #[serde(default = "default_grid_size")]
    pub grid_size: u32,

    /// Non-shadow active regions needed for a regional motion vote
    #[serde(default = "default_min_active_regions")]
    pub min_active_regions: u32,
}

impl Default for ShadowRemovalConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            intensity: default_shadow_intensity(),
            temporal_enabled: false,
            regional_enabled: false,
            grid_size: default_grid_size(),
            min_active_regions: default_min_active_regions(),
        }
    }
}

/// Color-based validation of motion decisions
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ColorDetectionConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Minimum blob area in detection-frame pixels
    #[serde(default = "default_min_blob_size")]
    pub min_blob_size: u32,

    /// Per-channel difference threshold for the color comparison
    #[serde(default = "default_color_threshold")]
    pub color_threshold: f64,
}

impl Default for ColorDetectionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min_blob_size: default_min_blob_size(),
            color_threshold: default_color_threshold(),
        }
    }
}

/// Blob tracker configuration for color_first mode
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ColorFirstConfig {
    #[serde(default = "default_min_blob_size")]
    pub min_blob_size: u32,

    /// Maximum centroid distance (px) for matching a blob between frames
    #[serde(default = "default_max_match_distance")]
    pub max_match_distance: f64,

    /// Minimum centroid displacement (px) that counts as movement
    #[serde(default = "default_min_blob_movement")]
    pub min_blob_movement: f64,

    /// Minimum matched lifetime before a blob may report movement
    #[serde(default = "default_min_blob_lifetime")]
    pub min_blob_lifetime: u32,
}

impl Default for ColorFirstConfig {
    fn default() -> Self {
        Self {
            min_blob_size: default_min_blob_size(),
            max_match_distance: default_max_match_distance(),
            min_blob_movement: default_min_blob_movement(),
            min_blob_lifetime: default_min_blob_lifetime(),
        }
    }
}

/// Motion worker pool configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct WorkerPoolConfig {
    /// Worker thread count; defaults to max(1, cpus - 1)
    #[serde(default)]
    pub pool_size: Option<usize>,

    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,

    #[serde(default = "default_task_timeout_ms")]
    pub task_timeout_ms: u64,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            pool_size: None,
            max_queue_size: default_max_queue_size(),
            task_timeout_ms: default_task_timeout_ms(),
        }
    }
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            fps: default_motion_fps(),
            threshold: default_motion_threshold(),
            cooldown_ms: default_cooldown_ms(),
            width: default_motion_width(),
            height: default_motion_height(),
            ignored_y_ranges: Vec::new(),
            shadow_removal: ShadowRemovalConfig::default(),
            color_detection: ColorDetectionConfig::default(),
            detection_mode: DetectionMode::Traditional,
            color_first: ColorFirstConfig::default(),
            worker_pool: WorkerPoolConfig::default(),
        }
    }
}

/// Motion-triggered clip recording configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RecordingConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Seconds of pre-motion context included in a clip
    #[serde(default = "default_pre_buffer_seconds")]
    pub pre_buffer_seconds: u32,

    /// Seconds the clip keeps extending after the last motion
    #[serde(default = "default_post_motion_seconds")]
    pub post_motion_seconds: u32,

    #[serde(default = "default_output_dir")]
    pub output_dir: String,

    #[serde(default)]
    pub video_quality: VideoQuality,

    /// Encodes allowed in flight at once; capture never blocks on this
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Day-directories older than this are swept
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    /// Seconds after a finalized recording before a new one may start
    #[serde(default = "default_recording_cooldown_seconds")]
    pub cooldown_seconds: u32,

    #[serde(default = "default_video_codec")]
    pub video_codec: String,

    #[serde(default = "default_video_preset")]
    pub video_preset: String,

    /// Playback frame rate of encoded clips
    #[serde(default = "default_recording_fps")]
    pub fps: u32,

    /// Write a .json sidecar next to each clip
    #[serde(default = "default_true")]
    pub save_metadata: bool,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            pre_buffer_seconds: default_pre_buffer_seconds(),
            post_motion_seconds: default_post_motion_seconds(),
            output_dir: default_output_dir(),
            video_quality: VideoQuality::default(),
            max_concurrent: default_max_concurrent(),
            retention_days: default_retention_days(),
            cooldown_seconds: default_recording_cooldown_seconds(),
            video_codec: default_video_codec(),
            video_preset: default_video_preset(),
            fps: default_recording_fps(),
            save_metadata: true,
        }
    }
}

/// Encoder quality preset
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum VideoQuality {
    Low,
    #[default]
    Medium,
    High,
}

impl VideoQuality {
    /// Constant rate factor handed to the encoder
    pub fn crf(&self) -> u32 {
        match self {
            VideoQuality::Low => 30,
            VideoQuality::Medium => 23,
            VideoQuality::High => 18,
        }
    }
}

/// HTTP listener configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_server_host")]
    pub host: String,

    #[serde(default = "default_server_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_server_host(),
            port: default_server_port(),
        }
    }
}

impl CoopcamConfig {
    /// Load configuration from the default file location
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_file("coopcam.toml")
    }

    /// Load configuration from a specific file, with COOPCAM_* environment overrides
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_str = path.as_ref().to_string_lossy();
        debug!("Loading configuration from: {}", path_str);

        let settings = Config::builder()
            .add_source(File::with_name(&path_str))
            .add_source(Environment::with_prefix("COOPCAM").separator("__"))
            .build()?;

        settings.try_deserialize()
    }

    /// Validate invariants the type system cannot express.
    ///
    /// Configuration errors are fatal at startup: the caller aborts on Err.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sources.is_empty() {
            return Err(ConfigError::Message(
                "at least one stream source must be configured".into(),
            ));
        }

        let defaults = self.sources.iter().filter(|s| s.is_default).count();
        if defaults != 1 {
            return Err(ConfigError::Message(format!(
                "exactly one source must be the default, found {}",
                defaults
            )));
        }

        let mut seen = std::collections::HashSet::new();
        for source in &self.sources {
            if source.id == "default" {
                return Err(ConfigError::Message(
                    "source id \"default\" is reserved as an alias".into(),
                ));
            }
            if source.id.is_empty() || source.url.is_empty() {
                return Err(ConfigError::Message(format!(
                    "source \"{}\" must have a non-empty id and url",
                    source.id
                )));
            }
            if !seen.insert(source.id.as_str()) {
                return Err(ConfigError::Message(format!(
                    "duplicate source id: {}",
                    source.id
                )));
            }
            if source.fps == 0 {
                return Err(ConfigError::Message(format!(
                    "source \"{}\" fps must be greater than 0",
                    source.id
                )));
            }
        }

        if self.motion.width == 0 || self.motion.height == 0 {
            return Err(ConfigError::Message(
                "motion detection dimensions must be greater than 0".into(),
            ));
        }
        if self.motion.fps == 0 {
            return Err(ConfigError::Message(
                "motion detection fps must be greater than 0".into(),
            ));
        }
        for range in &self.motion.ignored_y_ranges {
            if range.start > range.end {
                return Err(ConfigError::Message(format!(
                    "ignored y-range {}..{} is inverted",
                    range.start, range.end
                )));
            }
        }
        if self.motion.shadow_removal.grid_size == 0 {
            return Err(ConfigError::Message(
                "regional voter grid size must be greater than 0".into(),
            ));
        }

        if self.recording.max_concurrent == 0 {
            return Err(ConfigError::Message(
                "recording.max_concurrent must be greater than 0".into(),
            ));
        }
        if self.recording.fps == 0 {
            return Err(ConfigError::Message(
                "recording.fps must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    /// Id of the configured default source
    pub fn default_source_id(&self) -> &str {
        self.sources
            .iter()
            .find(|s| s.is_default)
            .map(|s| s.id.as_str())
            .unwrap_or("")
    }

    /// Serialize the built-in defaults as a TOML document
    pub fn default_toml() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }
}

impl Default for CoopcamConfig {
    fn default() -> Self {
        Self {
            sources: vec![SourceConfig {
                id: "coop".to_string(),
                name: "Coop".to_string(),
                url: "http://127.0.0.1:4747/video".to_string(),
                is_default: true,
                fps: default_source_fps(),
            }],
            motion: MotionConfig::default(),
            recording: RecordingConfig::default(),
            server: ServerConfig::default(),
            stream_pause_password: default_pause_password(),
            pause_duration_secs: default_pause_duration_secs(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_source_fps() -> u32 {
    30
}

fn default_motion_fps() -> u32 {
    5
}

fn default_motion_threshold() -> f64 {
    0.02
}

fn default_cooldown_ms() -> u64 {
    5_000
}

fn default_motion_width() -> u32 {
    160
}

fn default_motion_height() -> u32 {
    120
}

fn default_shadow_intensity() -> f64 {
    0.7
}

fn default_grid_size() -> u32 {
    4
}

fn default_min_active_regions() -> u32 {
    2
}

fn default_min_blob_size() -> u32 {
    50
}

fn default_color_threshold() -> f64 {
    30.0
}

fn default_max_match_distance() -> f64 {
    40.0
}

fn default_min_blob_movement() -> f64 {
    5.0
}

fn default_min_blob_lifetime() -> u32 {
    2
}

fn default_max_queue_size() -> usize {
    50
}

fn default_task_timeout_ms() -> u64 {
    5_000
}

fn default_pre_buffer_seconds() -> u32 {
    3
}

fn default_post_motion_seconds() -> u32 {
    15
}

fn default_output_dir() -> String {
    "recordings".to_string()
}

fn default_max_concurrent() -> usize {
    3
}

fn default_retention_days() -> u32 {
    7
}

fn default_recording_cooldown_seconds() -> u32 {
    10
}

fn default_video_codec() -> String {
    "libx264".to_string()
}

fn default_video_preset() -> String {
    "veryfast".to_string()
}

fn default_recording_fps() -> u32 {
    15
}

fn default_server_host() -> String {
    "0.0.0.0".to_string()
}

fn default_server_port() -> u16 {
    8080
}

fn default_pause_password() -> String {
    String::new()
}

fn default_pause_duration_secs() -> u64 {
    300
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn valid_config() -> CoopcamConfig {
        CoopcamConfig::default()
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_missing_default_source_rejected() {
        let mut config = valid_config();
        config.sources[0].is_default = false;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_two_default_sources_rejected() {
        let mut config = valid_config();
        let mut second = config.sources[0].clone();
        second.id = "run".to_string();
        config.sources.push(second);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_reserved_default_id_rejected() {
        let mut config = valid_config();
        config.sources[0].id = "default".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let mut config = valid_config();
        let mut second = config.sources[0].clone();
        second.is_default = false;
        config.sources.push(second);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_inverted_ignored_range_rejected() {
        let mut config = valid_config();
        config.motion.ignored_y_ranges.push(YRange { start: 50, end: 10 });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_toml_file() {
        let mut file = tempfile::NamedTempFile::with_suffix(".toml").unwrap();
        write!(
            file,
            r#"
stream_pause_password = "hunter2"

[[sources]]
id = "coop"
name = "Coop Door"
url = "http://10.0.0.5:4747/video"
is_default = true

[motion]
fps = 10
detection_mode = "color_first"

[motion.shadow_removal]
enabled = true
regional_enabled = true

[recording]
pre_buffer_seconds = 5
"#
        )
        .unwrap();

        let config = CoopcamConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.sources.len(), 1);
        assert_eq!(config.sources[0].fps, 30);
        assert_eq!(config.motion.fps, 10);
        assert_eq!(config.motion.detection_mode, DetectionMode::ColorFirst);
        assert!(config.motion.shadow_removal.enabled);
        assert_eq!(config.motion.shadow_removal.grid_size, 4);
        assert_eq!(config.recording.pre_buffer_seconds, 5);
        assert_eq!(config.recording.post_motion_seconds, 15);
        assert_eq!(config.stream_pause_password, "hunter2");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_source_id() {
        let config = valid_config();
        assert_eq!(config.default_source_id(), "coop");
    }

    #[test]
    fn test_print_defaults_round_trips() {
        let toml = CoopcamConfig::default_toml();
        let parsed: CoopcamConfig = toml::from_str(&toml).unwrap();
        assert!(parsed.validate().is_ok());
    }
}

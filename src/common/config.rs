use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::common::error::{FaceGateError, Result};
use crate::core::auth::AuthSettings;
use crate::core::classifier::LbphParams;
use crate::core::detector::DetectorParams;
use crate::core::enroll::{EnrollSettings, IdentityCreation};
use crate::storage::IdPolicy;

pub const DEFAULT_CONFIG_PATH: &str = "configs/facegate.toml";

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub camera: CameraConfig,
    #[serde(default)]
    pub detector: DetectorConfig,
    #[serde(default)]
    pub normalizer: NormalizerConfig,
    #[serde(default)]
    pub recognizer: RecognizerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub enrollment: EnrollmentConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CameraConfig {
    /// 999 selects the first grayscale (IR) device found.
    #[serde(default)]
    pub device_index: u32,
    #[serde(default = "default_camera_width")]
    pub width: u32,
    #[serde(default = "default_camera_height")]
    pub height: u32,
    #[serde(default = "default_warmup_frames")]
    pub warmup_frames: u32,
    #[serde(default = "default_warmup_delay")]
    pub warmup_delay_ms: u64,
}

fn default_camera_width() -> u32 { 640 }
fn default_camera_height() -> u32 { 480 }
fn default_warmup_frames() -> u32 { 5 }
fn default_warmup_delay() -> u64 { 50 }

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            device_index: 0,
            width: default_camera_width(),
            height: default_camera_height(),
            warmup_frames: default_warmup_frames(),
            warmup_delay_ms: default_warmup_delay(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DetectorConfig {
    #[serde(default = "default_cascade_path")]
    pub cascade_path: PathBuf,
    #[serde(default = "default_scale_factor")]
    pub scale_factor: f32,
    #[serde(default = "default_min_neighbors")]
    pub min_neighbors: u32,
    #[serde(default = "default_min_face_size")]
    pub min_face_size: u32,
}

fn default_cascade_path() -> PathBuf { PathBuf::from("/usr/share/opencv4/haarcascades/haarcascade_frontalface_default.xml") }
fn default_scale_factor() -> f32 { 1.3 }
fn default_min_neighbors() -> u32 { 5 }
fn default_min_face_size() -> u32 { 30 }

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            cascade_path: default_cascade_path(),
            scale_factor: default_scale_factor(),
            min_neighbors: default_min_neighbors(),
            min_face_size: default_min_face_size(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct NormalizerConfig {
    #[serde(default = "default_sample_size")]
    pub sample_width: u32,
    #[serde(default = "default_sample_size")]
    pub sample_height: u32,
}

fn default_sample_size() -> u32 { 200 }

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            sample_width: default_sample_size(),
            sample_height: default_sample_size(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RecognizerConfig {
    #[serde(default = "default_radius")]
    pub radius: u32,
    #[serde(default = "default_neighbors")]
    pub neighbors: u32,
    #[serde(default = "default_grid")]
    pub grid_x: u32,
    #[serde(default = "default_grid")]
    pub grid_y: u32,
}

fn default_radius() -> u32 { 1 }
fn default_neighbors() -> u32 { 8 }
fn default_grid() -> u32 { 8 }

impl Default for RecognizerConfig {
    fn default() -> Self {
        Self {
            radius: default_radius(),
            neighbors: default_neighbors(),
            grid_x: default_grid(),
            grid_y: default_grid(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AuthConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_attempt_interval")]
    pub attempt_interval_ms: u64,
    /// Distance ceiling; lower is stricter.
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,
    #[serde(default = "default_max_frame_failures")]
    pub max_consecutive_frame_failures: u32,
}

fn default_max_attempts() -> u32 { 10 }
fn default_attempt_interval() -> u64 { 1000 }
fn default_confidence_threshold() -> f64 { 60.0 }
fn default_max_frame_failures() -> u32 { 50 }

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            attempt_interval_ms: default_attempt_interval(),
            confidence_threshold: default_confidence_threshold(),
            max_consecutive_frame_failures: default_max_frame_failures(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct EnrollmentConfig {
    #[serde(default = "default_target_samples")]
    pub target_sample_count: usize,
    #[serde(default = "default_capture_interval")]
    pub capture_interval_ms: u64,
    #[serde(default)]
    pub identity_creation: IdentityCreation,
    #[serde(default)]
    pub id_policy: IdPolicy,
}

fn default_target_samples() -> usize { 30 }
fn default_capture_interval() -> u64 { 100 }

impl Default for EnrollmentConfig {
    fn default() -> Self {
        Self {
            target_sample_count: default_target_samples(),
            capture_interval_ms: default_capture_interval(),
            identity_creation: IdentityCreation::default(),
            id_policy: IdPolicy::default(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct StorageConfig {
    /// Overrides the dev/platform data directory.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    #[serde(default)]
    pub audit_log: Option<PathBuf>,
}

impl Config {
    /// Loads `configs/facegate.toml` when present, built-in defaults otherwise.
    pub fn load() -> Result<Self> {
        let path = Path::new(DEFAULT_CONFIG_PATH);
        if path.exists() {
            Self::load_from_path(path)
        } else {
            tracing::info!("No config at {}, using defaults", path.display());
            let config = Self::default();
            config.validate()?;
            Ok(config)
        }
    }

    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(FaceGateError::Config(format!(
                "Config file not found: {}", path.display()
            )));
        }

        tracing::info!("Loading config from: {}", path.display());
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)
            .map_err(|e| FaceGateError::Config(format!("Config parse error: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.camera.width == 0 || self.camera.width > 4096 {
            return Err(FaceGateError::Config(format!(
                "Camera width must be between 1 and 4096, got {}", self.camera.width
            )));
        }
        if self.camera.height == 0 || self.camera.height > 4096 {
            return Err(FaceGateError::Config(format!(
                "Camera height must be between 1 and 4096, got {}", self.camera.height
            )));
        }

        if !(self.detector.scale_factor > 1.0) {
            return Err(FaceGateError::Config(format!(
                "Detector scale factor must be greater than 1.0, got {}", self.detector.scale_factor
            )));
        }
        if self.detector.min_face_size == 0 {
            return Err(FaceGateError::Config("Detector min face size must be positive".into()));
        }

        if self.normalizer.sample_width == 0 || self.normalizer.sample_width > 1024
            || self.normalizer.sample_height == 0 || self.normalizer.sample_height > 1024
        {
            return Err(FaceGateError::Config(format!(
                "Sample size must be between 1 and 1024, got {}x{}",
                self.normalizer.sample_width, self.normalizer.sample_height
            )));
        }

        self.lbph_params().validate()?;
        let (width, height) = self.sample_size();
        let margin = 2 * self.recognizer.radius;
        if width <= margin + self.recognizer.grid_x || height <= margin + self.recognizer.grid_y {
            return Err(FaceGateError::Config(format!(
                "Sample size {}x{} is too small for radius {} and a {}x{} grid",
                width, height, self.recognizer.radius, self.recognizer.grid_x, self.recognizer.grid_y
            )));
        }

        if self.auth.max_attempts == 0 {
            return Err(FaceGateError::Config("max_attempts must be at least 1".into()));
        }
        if !(self.auth.confidence_threshold > 0.0) {
            return Err(FaceGateError::Config(format!(
                "Confidence threshold must be positive, got {}", self.auth.confidence_threshold
            )));
        }
        if self.auth.max_consecutive_frame_failures == 0 {
            return Err(FaceGateError::Config(
                "max_consecutive_frame_failures must be at least 1".into()
            ));
        }

        if self.enrollment.target_sample_count == 0 {
            return Err(FaceGateError::Config("target_sample_count must be at least 1".into()));
        }

        Ok(())
    }

    pub fn sample_size(&self) -> (u32, u32) {
        (self.normalizer.sample_width, self.normalizer.sample_height)
    }

    pub fn detector_params(&self) -> DetectorParams {
        DetectorParams {
            scale_factor: self.detector.scale_factor,
            min_neighbors: self.detector.min_neighbors,
            min_face_size: self.detector.min_face_size,
        }
    }

    pub fn lbph_params(&self) -> LbphParams {
        LbphParams {
            radius: self.recognizer.radius,
            neighbors: self.recognizer.neighbors,
            grid_x: self.recognizer.grid_x,
            grid_y: self.recognizer.grid_y,
        }
    }

    pub fn auth_settings(&self) -> AuthSettings {
        AuthSettings {
            max_attempts: self.auth.max_attempts,
            confidence_threshold: self.auth.confidence_threshold,
        }
    }

    pub fn enroll_settings(&self) -> EnrollSettings {
        EnrollSettings {
            target_sample_count: self.enrollment.target_sample_count,
            identity_creation: self.enrollment.identity_creation,
        }
    }

    pub fn attempt_interval(&self) -> Duration {
        Duration::from_millis(self.auth.attempt_interval_ms)
    }

    pub fn capture_interval(&self) -> Duration {
        Duration::from_millis(self.enrollment.capture_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.auth.max_attempts, 10);
        assert_eq!(config.enrollment.target_sample_count, 30);
        assert_eq!(config.sample_size(), (200, 200));
        assert_eq!(config.enrollment.id_policy, IdPolicy::MaxPlusOne);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [auth]
            max_attempts = 3
            confidence_threshold = 45.5

            [enrollment]
            identity_creation = "after_capture"
            id_policy = "count_plus_one"
            "#,
        )
        .unwrap();

        assert_eq!(config.auth.max_attempts, 3);
        assert_eq!(config.auth.attempt_interval_ms, 1000);
        assert_eq!(config.auth.confidence_threshold, 45.5);
        assert_eq!(config.enrollment.identity_creation, IdentityCreation::AfterCapture);
        assert_eq!(config.enrollment.id_policy, IdPolicy::CountPlusOne);
        assert_eq!(config.detector.min_neighbors, 5);
        config.validate().unwrap();
    }

    #[test]
    fn rejects_bad_scale_factor() {
        let mut config = Config::default();
        config.detector.scale_factor = 1.0;
        assert!(matches!(config.validate(), Err(FaceGateError::Config(_))));
    }

    #[test]
    fn rejects_zero_attempts() {
        let mut config = Config::default();
        config.auth.max_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn shipped_config_matches_defaults() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join(DEFAULT_CONFIG_PATH);
        let shipped = Config::load_from_path(&path).unwrap();
        let defaults = Config::default();

        assert_eq!(shipped.detector.cascade_path, defaults.detector.cascade_path);
        assert_eq!(shipped.sample_size(), defaults.sample_size());
        assert_eq!(shipped.lbph_params(), defaults.lbph_params());
        assert_eq!(shipped.auth.confidence_threshold, defaults.auth.confidence_threshold);
        assert_eq!(shipped.enrollment.id_policy, defaults.enrollment.id_policy);
        assert!(shipped.storage.data_dir.is_none());
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let err = Config::load_from_path(Path::new("/definitely/not/here.toml")).unwrap_err();
        assert!(matches!(err, FaceGateError::Config(_)));
    }
}

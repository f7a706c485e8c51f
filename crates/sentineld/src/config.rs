use sentinel_core::DistanceMetric;
use sentinel_hw::CameraSettings;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::engine::EngineSettings;

const DEFAULT_CONFIG_PATH: &str = "/etc/sentinel/sentinel.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid configuration: {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

/// Which message bus the status interface is published on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DbusMode {
    System,
    Session,
    Off,
}

/// Buzzer driven through a sysfs PWM channel instead of a plain GPIO line.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PwmSettings {
    pub chip: u32,
    pub channel: u32,
    #[serde(default = "default_pwm_frequency")]
    pub frequency_hz: u32,
    #[serde(default = "default_pwm_duty")]
    pub duty: f32,
}

fn default_pwm_frequency() -> u32 {
    2000
}

fn default_pwm_duty() -> f32 {
    0.5
}

/// Daemon configuration: defaults, then the TOML file, then `SENTINEL_*` variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Raw PIR must stay active this long before motion starts.
    pub motion_confirm_ms: u64,
    /// Raw PIR must stay inactive this long before motion ends.
    pub motion_release_ms: u64,
    pub sensor_poll_ms: u64,
    /// Ceiling for the read-retry backoff after a sensor fault.
    pub sensor_backoff_max_ms: u64,
    pub motion_queue_capacity: usize,
    pub session_timeout_ms: u64,
    /// Frames with a detected face needed before evaluating without a match.
    pub max_frames_per_session: u32,
    pub capture_batch_size: usize,
    pub frame_timeout_ms: u64,
    pub inference_timeout_ms: u64,
    pub authorization_threshold: f32,
    pub distance_metric: DistanceMetric,
    pub detection_confidence_floor: f32,
    pub cooldown_ms: u64,
    pub alert_duration_ms: u64,
    /// Failed inferences absorbed per session before it gives up.
    pub inference_retry_budget: u32,
    /// Consecutive failed sessions (camera or model) before the engine faults.
    pub max_consecutive_failed_sessions: u32,
    pub fault_probe_interval_ms: u64,
    pub camera_device: String,
    pub camera_width: u32,
    pub camera_height: u32,
    pub camera_open_retries: u32,
    pub camera_retry_delay_ms: u64,
    /// Rotate frames 180° for an upside-down camera.
    pub camera_flip: bool,
    pub pir_gpio: u32,
    pub pir_active_low: bool,
    pub buzzer_gpio: u32,
    pub buzzer_pwm: Option<PwmSettings>,
    pub model_dir: PathBuf,
    /// Required embedding length; 0 accepts whatever the model produces.
    pub embedding_dim: usize,
    pub enrollment_path: PathBuf,
    /// Poll interval for enrollment file changes; 0 disables hot reload.
    pub enrollment_reload_secs: u64,
    pub dbus: DbusMode,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            motion_confirm_ms: 300,
            motion_release_ms: 2000,
            sensor_poll_ms: 50,
            sensor_backoff_max_ms: 5000,
            motion_queue_capacity: 16,
            session_timeout_ms: 8000,
            max_frames_per_session: 15,
            capture_batch_size: 3,
            frame_timeout_ms: 1000,
            inference_timeout_ms: 2000,
            authorization_threshold: 0.6,
            distance_metric: DistanceMetric::Euclidean,
            detection_confidence_floor: 0.5,
            cooldown_ms: 10_000,
            alert_duration_ms: 3000,
            inference_retry_budget: 2,
            max_consecutive_failed_sessions: 3,
            fault_probe_interval_ms: 5000,
            camera_device: "/dev/video0".to_string(),
            camera_width: 640,
            camera_height: 480,
            camera_open_retries: 3,
            camera_retry_delay_ms: 2000,
            camera_flip: false,
            pir_gpio: 17,
            pir_active_low: false,
            buzzer_gpio: 18,
            buzzer_pwm: None,
            model_dir: sentinel_core::default_model_dir(),
            embedding_dim: 512,
            enrollment_path: sentinel_core::default_enrollment_path(),
            enrollment_reload_secs: 0,
            dbus: DbusMode::System,
        }
    }
}

impl Config {
    /// Load from `SENTINEL_CONFIG` (or the default path), apply environment
    /// overrides and validate.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var("SENTINEL_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));

        let mut config = Self::from_file(&path)?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML file. A missing file yields the defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(text) => toml::from_str(&text).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                Ok(Self::default())
            }
            Err(source) => Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    /// Apply `SENTINEL_*` overrides read through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(
            lookup: &dyn Fn(&str) -> Option<String>,
            key: &'static str,
            slot: &mut T,
        ) -> Result<(), ConfigError>
        where
            T::Err: std::fmt::Display,
        {
            if let Some(raw) = lookup(key) {
                *slot = raw
                    .trim()
                    .parse()
                    .map_err(|e: T::Err| invalid(key, format!("{raw:?}: {e}")))?;
            }
            Ok(())
        }

        let l: &dyn Fn(&str) -> Option<String> = &lookup;
        parse(l, "SENTINEL_MOTION_CONFIRM_MS", &mut self.motion_confirm_ms)?;
        parse(l, "SENTINEL_MOTION_RELEASE_MS", &mut self.motion_release_ms)?;
        parse(l, "SENTINEL_SENSOR_POLL_MS", &mut self.sensor_poll_ms)?;
        parse(l, "SENTINEL_SENSOR_BACKOFF_MAX_MS", &mut self.sensor_backoff_max_ms)?;
        parse(l, "SENTINEL_MOTION_QUEUE_CAPACITY", &mut self.motion_queue_capacity)?;
        parse(l, "SENTINEL_SESSION_TIMEOUT_MS", &mut self.session_timeout_ms)?;
        parse(l, "SENTINEL_MAX_FRAMES_PER_SESSION", &mut self.max_frames_per_session)?;
        parse(l, "SENTINEL_CAPTURE_BATCH_SIZE", &mut self.capture_batch_size)?;
        parse(l, "SENTINEL_FRAME_TIMEOUT_MS", &mut self.frame_timeout_ms)?;
        parse(l, "SENTINEL_INFERENCE_TIMEOUT_MS", &mut self.inference_timeout_ms)?;
        parse(l, "SENTINEL_AUTHORIZATION_THRESHOLD", &mut self.authorization_threshold)?;
        parse(l, "SENTINEL_DISTANCE_METRIC", &mut self.distance_metric)?;
        parse(l, "SENTINEL_DETECTION_CONFIDENCE_FLOOR", &mut self.detection_confidence_floor)?;
        parse(l, "SENTINEL_COOLDOWN_MS", &mut self.cooldown_ms)?;
        parse(l, "SENTINEL_ALERT_DURATION_MS", &mut self.alert_duration_ms)?;
        parse(l, "SENTINEL_INFERENCE_RETRY_BUDGET", &mut self.inference_retry_budget)?;
        parse(
            l,
            "SENTINEL_MAX_CONSECUTIVE_FAILED_SESSIONS",
            &mut self.max_consecutive_failed_sessions,
        )?;
        parse(l, "SENTINEL_FAULT_PROBE_INTERVAL_MS", &mut self.fault_probe_interval_ms)?;
        parse(l, "SENTINEL_CAMERA_DEVICE", &mut self.camera_device)?;
        parse(l, "SENTINEL_CAMERA_WIDTH", &mut self.camera_width)?;
        parse(l, "SENTINEL_CAMERA_HEIGHT", &mut self.camera_height)?;
        parse(l, "SENTINEL_CAMERA_OPEN_RETRIES", &mut self.camera_open_retries)?;
        parse(l, "SENTINEL_CAMERA_RETRY_DELAY_MS", &mut self.camera_retry_delay_ms)?;
        parse(l, "SENTINEL_CAMERA_FLIP", &mut self.camera_flip)?;
        parse(l, "SENTINEL_PIR_GPIO", &mut self.pir_gpio)?;
        parse(l, "SENTINEL_PIR_ACTIVE_LOW", &mut self.pir_active_low)?;
        parse(l, "SENTINEL_BUZZER_GPIO", &mut self.buzzer_gpio)?;
        parse(l, "SENTINEL_MODEL_DIR", &mut self.model_dir)?;
        parse(l, "SENTINEL_EMBEDDING_DIM", &mut self.embedding_dim)?;
        parse(l, "SENTINEL_ENROLLMENT_PATH", &mut self.enrollment_path)?;
        parse(l, "SENTINEL_ENROLLMENT_RELOAD_SECS", &mut self.enrollment_reload_secs)?;

        if let Some(raw) = lookup("SENTINEL_DBUS") {
            self.dbus = match raw.trim() {
                "system" => DbusMode::System,
                "session" => DbusMode::Session,
                "off" | "0" => DbusMode::Off,
                other => return Err(invalid("SENTINEL_DBUS", format!("{other:?}"))),
            };
        }
        Ok(())
    }

    /// Reject out-of-range values before anything touches hardware.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let non_zero = [
            ("motion_confirm_ms", self.motion_confirm_ms),
            ("motion_release_ms", self.motion_release_ms),
            ("sensor_poll_ms", self.sensor_poll_ms),
            ("session_timeout_ms", self.session_timeout_ms),
            ("frame_timeout_ms", self.frame_timeout_ms),
            ("inference_timeout_ms", self.inference_timeout_ms),
            ("alert_duration_ms", self.alert_duration_ms),
            ("fault_probe_interval_ms", self.fault_probe_interval_ms),
        ];
        for (field, value) in non_zero {
            if value == 0 {
                return Err(invalid(field, "must be greater than zero"));
            }
        }

        if self.sensor_poll_ms > self.motion_confirm_ms {
            return Err(invalid(
                "sensor_poll_ms",
                "must not exceed motion_confirm_ms or short pulses cannot be resolved",
            ));
        }
        if self.sensor_backoff_max_ms < self.sensor_poll_ms {
            return Err(invalid("sensor_backoff_max_ms", "must be at least sensor_poll_ms"));
        }
        if self.max_frames_per_session == 0 {
            return Err(invalid("max_frames_per_session", "must be greater than zero"));
        }
        if self.capture_batch_size == 0 {
            return Err(invalid("capture_batch_size", "must be greater than zero"));
        }
        if self.motion_queue_capacity == 0 {
            return Err(invalid("motion_queue_capacity", "must be greater than zero"));
        }
        if self.max_consecutive_failed_sessions == 0 {
            return Err(invalid("max_consecutive_failed_sessions", "must be greater than zero"));
        }
        if !self.authorization_threshold.is_finite() || self.authorization_threshold <= 0.0 {
            return Err(invalid("authorization_threshold", "must be a positive finite number"));
        }
        if !(0.0..=1.0).contains(&self.detection_confidence_floor) {
            return Err(invalid("detection_confidence_floor", "must lie in [0, 1]"));
        }
        if let Some(pwm) = &self.buzzer_pwm {
            if !(pwm.duty > 0.0 && pwm.duty <= 1.0) {
                return Err(invalid("buzzer_pwm.duty", "must lie in (0, 1]"));
            }
            if pwm.frequency_hz == 0 {
                return Err(invalid("buzzer_pwm.frequency_hz", "must be greater than zero"));
            }
        }
        if self.camera_device.is_empty() {
            return Err(invalid("camera_device", "must not be empty"));
        }
        if self.camera_width == 0 {
            return Err(invalid("camera_width", "must be greater than zero"));
        }
        if self.camera_height == 0 {
            return Err(invalid("camera_height", "must be greater than zero"));
        }
        Ok(())
    }

    /// Embedding length enrolled references must have, `None` when unchecked.
    pub fn expected_embedding_dim(&self) -> Option<usize> {
        (self.embedding_dim > 0).then_some(self.embedding_dim)
    }

    pub fn camera_settings(&self) -> CameraSettings {
        CameraSettings {
            device_path: self.camera_device.clone(),
            width: self.camera_width,
            height: self.camera_height,
            open_retries: self.camera_open_retries,
            retry_delay: Duration::from_millis(self.camera_retry_delay_ms),
            flip: self.camera_flip,
        }
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            session_timeout: Duration::from_millis(self.session_timeout_ms),
            max_frames_per_session: self.max_frames_per_session,
            capture_batch_size: self.capture_batch_size,
            frame_timeout: Duration::from_millis(self.frame_timeout_ms),
            inference_timeout: Duration::from_millis(self.inference_timeout_ms),
            authorization_threshold: self.authorization_threshold,
            distance_metric: self.distance_metric,
            cooldown: Duration::from_millis(self.cooldown_ms),
            inference_retry_budget: self.inference_retry_budget,
            max_consecutive_failed_sessions: self.max_consecutive_failed_sessions,
            fault_probe_interval: Duration::from_millis(self.fault_probe_interval_ms),
        }
    }

    pub fn motion_confirm(&self) -> Duration {
        Duration::from_millis(self.motion_confirm_ms)
    }

    pub fn motion_release(&self) -> Duration {
        Duration::from_millis(self.motion_release_ms)
    }

    pub fn sensor_poll(&self) -> Duration {
        Duration::from_millis(self.sensor_poll_ms)
    }

    pub fn sensor_backoff_max(&self) -> Duration {
        Duration::from_millis(self.sensor_backoff_max_ms)
    }

    pub fn alert_duration(&self) -> Duration {
        Duration::from_millis(self.alert_duration_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.motion_confirm_ms, 300);
        assert_eq!(config.max_frames_per_session, 15);
        assert_eq!(config.cooldown_ms, 10_000);
        assert_eq!(config.alert_duration_ms, 3000);
    }

    #[test]
    fn test_toml_overrides_defaults() {
        let config: Config = toml::from_str(
            r#"
            authorization_threshold = 0.45
            distance_metric = "cosine"
            camera_flip = true

            [buzzer_pwm]
            chip = 0
            channel = 1
            "#,
        )
        .unwrap();
        assert_eq!(config.authorization_threshold, 0.45);
        assert_eq!(config.distance_metric, DistanceMetric::Cosine);
        assert!(config.camera_flip);
        let pwm = config.buzzer_pwm.unwrap();
        assert_eq!((pwm.chip, pwm.channel, pwm.frequency_hz), (0, 1, 2000));
        assert_eq!(pwm.duty, 0.5);
        // Untouched keys keep their defaults.
        assert_eq!(config.session_timeout_ms, 8000);
    }

    #[test]
    fn test_unknown_key_rejected() {
        assert!(toml::from_str::<Config>("no_such_option = 1").is_err());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config
            .apply_overrides(lookup(&[
                ("SENTINEL_COOLDOWN_MS", "2500"),
                ("SENTINEL_DISTANCE_METRIC", "cosine"),
                ("SENTINEL_DBUS", "off"),
            ]))
            .unwrap();
        assert_eq!(config.cooldown_ms, 2500);
        assert_eq!(config.distance_metric, DistanceMetric::Cosine);
        assert_eq!(config.dbus, DbusMode::Off);
    }

    #[test]
    fn test_env_overrides_cover_fault_and_hardware_options() {
        let mut config = Config::default();
        config
            .apply_overrides(lookup(&[
                ("SENTINEL_INFERENCE_RETRY_BUDGET", "5"),
                ("SENTINEL_MAX_CONSECUTIVE_FAILED_SESSIONS", "7"),
                ("SENTINEL_FAULT_PROBE_INTERVAL_MS", "1500"),
                ("SENTINEL_EMBEDDING_DIM", "128"),
                ("SENTINEL_PIR_ACTIVE_LOW", "true"),
                ("SENTINEL_MOTION_QUEUE_CAPACITY", "4"),
                ("SENTINEL_CAMERA_OPEN_RETRIES", "1"),
                ("SENTINEL_CAMERA_WIDTH", "320"),
                ("SENTINEL_CAMERA_HEIGHT", "240"),
            ]))
            .unwrap();
        assert_eq!(config.inference_retry_budget, 5);
        assert_eq!(config.max_consecutive_failed_sessions, 7);
        assert_eq!(config.fault_probe_interval_ms, 1500);
        assert_eq!(config.expected_embedding_dim(), Some(128));
        assert!(config.pir_active_low);
        assert_eq!(config.motion_queue_capacity, 4);
        assert_eq!(config.camera_open_retries, 1);
        assert_eq!((config.camera_width, config.camera_height), (320, 240));
        config.validate().unwrap();

        config.apply_overrides(lookup(&[("SENTINEL_EMBEDDING_DIM", "0")])).unwrap();
        assert_eq!(config.expected_embedding_dim(), None);
    }

    #[test]
    fn test_unparsable_env_is_invalid() {
        let mut config = Config::default();
        let err = config
            .apply_overrides(lookup(&[("SENTINEL_SESSION_TIMEOUT_MS", "soon")]))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid { field: "SENTINEL_SESSION_TIMEOUT_MS", .. }
        ));
    }

    #[test]
    fn test_validate_rejects_out_of_range() {
        let cases: Vec<(&str, Box<dyn Fn(&mut Config)>)> = vec![
            ("session_timeout_ms", Box::new(|c| c.session_timeout_ms = 0)),
            ("authorization_threshold", Box::new(|c| c.authorization_threshold = -0.1)),
            ("authorization_threshold", Box::new(|c| c.authorization_threshold = f32::NAN)),
            ("detection_confidence_floor", Box::new(|c| c.detection_confidence_floor = 1.5)),
            ("max_frames_per_session", Box::new(|c| c.max_frames_per_session = 0)),
            ("capture_batch_size", Box::new(|c| c.capture_batch_size = 0)),
            ("alert_duration_ms", Box::new(|c| c.alert_duration_ms = 0)),
            ("sensor_poll_ms", Box::new(|c| c.sensor_poll_ms = 500)),
            ("camera_width", Box::new(|c| c.camera_width = 0)),
            ("camera_height", Box::new(|c| c.camera_height = 0)),
            (
                "buzzer_pwm.duty",
                Box::new(|c| {
                    c.buzzer_pwm = Some(PwmSettings { chip: 0, channel: 0, frequency_hz: 2000, duty: 0.0 })
                }),
            ),
        ];

        for (expected, mutate) in cases {
            let mut config = Config::default();
            mutate(&mut config);
            match config.validate() {
                Err(ConfigError::Invalid { field, .. }) => assert_eq!(field, expected),
                other => panic!("{expected}: expected Invalid, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let config = Config::from_file(Path::new("/nonexistent/sentinel.toml")).unwrap();
        assert_eq!(config.cooldown_ms, Config::default().cooldown_ms);
    }
}

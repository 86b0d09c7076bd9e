use log::info;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::assets::{
    DETECTION_TIMEOUT_MS, DEVICE_PIXEL_RATIO, PROCESSING_LONG_EDGE, TICK_RATE_HZ,
};
use crate::detection::MatchKernel;
use crate::filter::FilterParams;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Tracking session settings, read from a JSON file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Camera calibration reference handed to the detection engine
    pub camera_calibration: String,
    /// Marker references, in index order
    pub markers: Vec<String>,
    pub filter: FilterParams,
    pub tick_rate_hz: u32,
    /// Detection deadline; `null` waits forever
    pub detection_timeout_ms: Option<u64>,
    pub processing_long_edge: u32,
    pub device_pixel_ratio: f64,
    /// Force the matching kernel; detected from the CPU when absent
    pub simd: Option<bool>,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            camera_calibration: String::new(),
            markers: Vec::new(),
            filter: FilterParams::default(),
            tick_rate_hz: TICK_RATE_HZ,
            detection_timeout_ms: Some(DETECTION_TIMEOUT_MS),
            processing_long_edge: PROCESSING_LONG_EDGE,
            device_pixel_ratio: DEVICE_PIXEL_RATIO,
            simd: None,
        }
    }
}

impl TrackerConfig {
    /// Read and validate a config file. Marker and calibration paths are
    /// resolved against the file's directory.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: TrackerConfig =
            serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        if let Some(base) = path.parent() {
            config.resolve_paths(base);
        }
        config.validate()?;
        info!(
            "Config: {} markers, {} Hz, detection timeout {:?}",
            config.markers.len(),
            config.tick_rate_hz,
            config.detection_timeout()
        );
        Ok(config)
    }

    fn resolve_paths(&mut self, base: &Path) {
        let resolve = |reference: &mut String| {
            if !reference.is_empty() && Path::new(reference.as_str()).is_relative() {
                *reference = base.join(reference.as_str()).to_string_lossy().into_owned();
            }
        };
        resolve(&mut self.camera_calibration);
        self.markers.iter_mut().for_each(resolve);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.camera_calibration.is_empty() {
            return Err(ConfigError::Invalid("camera_calibration is required".into()));
        }
        if self.markers.is_empty() {
            return Err(ConfigError::Invalid("at least one marker is required".into()));
        }
        if self.tick_rate_hz == 0 {
            return Err(ConfigError::Invalid("tick_rate_hz must be positive".into()));
        }
        if self.processing_long_edge < 16 {
            return Err(ConfigError::Invalid(format!(
                "processing_long_edge {} is too small",
                self.processing_long_edge
            )));
        }
        if !(self.device_pixel_ratio.is_finite() && self.device_pixel_ratio > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "device_pixel_ratio must be positive, got {}",
                self.device_pixel_ratio
            )));
        }
        let filter = &self.filter;
        if !(filter.min_cut_off > 0.0 && filter.beta >= 0.0) {
            return Err(ConfigError::Invalid(format!(
                "filter needs min_cut_off > 0 and beta >= 0, got {} / {}",
                filter.min_cut_off, filter.beta
            )));
        }
        if self.detection_timeout_ms == Some(0) {
            return Err(ConfigError::Invalid(
                "detection_timeout_ms must be positive or null".into(),
            ));
        }
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.tick_rate_hz.max(1)))
    }

    pub fn detection_timeout(&self) -> Option<Duration> {
        self.detection_timeout_ms.map(Duration::from_millis)
    }

    /// Kernel capability flag sent to the detection worker
    pub fn simd_capable(&self) -> bool {
        self.simd.unwrap_or_else(MatchKernel::detect_capability)
    }
}

/// Returns a version as specified in Cargo.toml
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

pub fn app_name() -> &'static str {
    env!("CARGO_PKG_NAME")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> TrackerConfig {
        TrackerConfig {
            camera_calibration: "camera.json".into(),
            markers: vec!["markers/a".into()],
            ..TrackerConfig::default()
        }
    }

    #[test]
    fn test_defaults() {
        let config: TrackerConfig =
            serde_json::from_str(r#"{"camera_calibration": "c", "markers": ["m"]}"#).unwrap();
        assert_eq!(config.tick_rate_hz, 60);
        assert_eq!(config.detection_timeout(), Some(Duration::from_millis(2000)));
        assert_eq!(config.processing_long_edge, 640);
        assert_eq!(config.filter, FilterParams::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_null_timeout_disables_deadline() {
        let config: TrackerConfig = serde_json::from_str(
            r#"{"camera_calibration": "c", "markers": ["m"], "detection_timeout_ms": null}"#,
        )
        .unwrap();
        assert_eq!(config.detection_timeout(), None);
    }

    #[test]
    fn test_validation() {
        assert!(valid().validate().is_ok());

        let no_markers = TrackerConfig {
            markers: Vec::new(),
            ..valid()
        };
        assert!(matches!(no_markers.validate(), Err(ConfigError::Invalid(_))));

        let zero_rate = TrackerConfig {
            tick_rate_hz: 0,
            ..valid()
        };
        assert!(zero_rate.validate().is_err());

        let bad_dpr = TrackerConfig {
            device_pixel_ratio: 0.0,
            ..valid()
        };
        assert!(bad_dpr.validate().is_err());

        let zero_timeout = TrackerConfig {
            detection_timeout_ms: Some(0),
            ..valid()
        };
        assert!(zero_timeout.validate().is_err());
    }

    #[test]
    fn test_load_resolves_relative_paths() {
        let dir = std::env::temp_dir().join(format!("markertrack-{}-config", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("tracker.json");
        std::fs::write(
            &path,
            r#"{"camera_calibration": "camera.json", "markers": ["m/a", "/abs/b"], "simd": false}"#,
        )
        .unwrap();

        let config = TrackerConfig::load(&path).unwrap();
        assert_eq!(
            Path::new(&config.camera_calibration),
            dir.join("camera.json").as_path()
        );
        assert_eq!(Path::new(&config.markers[0]), dir.join("m/a").as_path());
        assert_eq!(config.markers[1], "/abs/b");
        assert!(!config.simd_capable());
    }

    #[test]
    fn test_load_errors() {
        assert!(matches!(
            TrackerConfig::load("/nonexistent/tracker.json"),
            Err(ConfigError::Io { .. })
        ));

        let dir = std::env::temp_dir().join(format!("markertrack-{}-config-bad", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("tracker.json");
        std::fs::write(&path, "{").unwrap();
        assert!(matches!(
            TrackerConfig::load(&path),
            Err(ConfigError::Parse { .. })
        ));
    }
}

use std::env;
use std::time::Duration;

use runtime::QualityTier;
use serde::{Deserialize, Serialize};
use streaming::DEFAULT_CACHE_CAPACITY;

/// Settings for one [`crate::VolumeLayer`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeLayerConfig {
    /// Backend URL. Empty means streaming is unconfigured and the layer stays
    /// in fallback.
    #[serde(default)]
    pub endpoint: String,

    /// Pressure levels (hPa) to request; normalized before every request.
    #[serde(default = "default_levels")]
    pub levels: Vec<f64>,

    /// Opaque time token forwarded to the backend.
    #[serde(default)]
    pub valid_time: Option<String>,

    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,

    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    #[serde(default = "default_quality")]
    pub quality: QualityTier,

    #[serde(default = "default_auto_downgrade")]
    pub auto_downgrade: bool,

    /// Ray-march step as a multiple of the smallest voxel edge.
    #[serde(default = "default_step_voxels")]
    pub step_voxels: f64,
}

fn default_levels() -> Vec<f64> {
    vec![1000.0, 850.0, 700.0, 500.0, 300.0]
}

fn default_cache_capacity() -> usize {
    DEFAULT_CACHE_CAPACITY
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_quality() -> QualityTier {
    QualityTier::Medium
}

fn default_auto_downgrade() -> bool {
    true
}

fn default_step_voxels() -> f64 {
    1.0
}

impl Default for VolumeLayerConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            levels: default_levels(),
            valid_time: None,
            cache_capacity: default_cache_capacity(),
            request_timeout_ms: default_request_timeout_ms(),
            quality: default_quality(),
            auto_downgrade: default_auto_downgrade(),
            step_voxels: default_step_voxels(),
        }
    }
}

impl VolumeLayerConfig {
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// Read `VOLUME_*` environment variables over the defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Like [`Self::from_env`] with a custom variable source. Unparseable
    /// values fall back to the default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        let levels = lookup("VOLUME_LEVELS")
            .map(|v| {
                v.split(',')
                    .filter_map(|s| s.trim().parse::<f64>().ok())
                    .collect::<Vec<_>>()
            })
            .filter(|l| !l.is_empty())
            .unwrap_or(defaults.levels);

        Self {
            endpoint: lookup("VOLUME_ENDPOINT")
                .map(|v| v.trim().to_string())
                .unwrap_or(defaults.endpoint),
            levels,
            valid_time: lookup("VOLUME_VALID_TIME").filter(|v| !v.trim().is_empty()),
            cache_capacity: lookup("VOLUME_CACHE_CAPACITY")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(defaults.cache_capacity),
            request_timeout_ms: lookup("VOLUME_REQUEST_TIMEOUT_MS")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(defaults.request_timeout_ms),
            quality: lookup("VOLUME_QUALITY")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.quality),
            auto_downgrade: lookup("VOLUME_AUTO_DOWNGRADE")
                .and_then(|v| parse_bool(&v))
                .unwrap_or(defaults.auto_downgrade),
            step_voxels: defaults.step_voxels,
        }
    }

    pub fn is_streaming_configured(&self) -> bool {
        !self.endpoint.trim().is_empty()
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms.max(1))
    }
}

fn parse_bool(v: &str) -> Option<bool> {
    match v.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::VolumeLayerConfig;
    use pretty_assertions::assert_eq;
    use runtime::QualityTier;
    use std::collections::HashMap;

    #[test]
    fn json_fills_missing_fields_with_defaults() {
        let cfg: VolumeLayerConfig =
            serde_json::from_str(r#"{"endpoint":"http://localhost:8080/volume","quality":"high"}"#)
                .unwrap();
        assert_eq!(
            cfg,
            VolumeLayerConfig {
                endpoint: "http://localhost:8080/volume".to_string(),
                quality: QualityTier::High,
                ..VolumeLayerConfig::default()
            }
        );
        assert!(cfg.is_streaming_configured());
        assert_eq!(cfg.cache_capacity, 4);
        assert_eq!(cfg.request_timeout_ms, 30_000);
    }

    #[test]
    fn env_lookup_overrides_and_ignores_garbage() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("VOLUME_ENDPOINT", " https://wx.example/volume "),
            ("VOLUME_LEVELS", "850, 500,abc"),
            ("VOLUME_VALID_TIME", "2024-06-01T06Z"),
            ("VOLUME_QUALITY", "LOW"),
            ("VOLUME_CACHE_CAPACITY", "many"),
            ("VOLUME_AUTO_DOWNGRADE", "off"),
        ]);
        let cfg = VolumeLayerConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string()));

        assert_eq!(cfg.endpoint, "https://wx.example/volume");
        assert_eq!(cfg.levels, vec![850.0, 500.0]);
        assert_eq!(cfg.valid_time.as_deref(), Some("2024-06-01T06Z"));
        assert_eq!(cfg.quality, QualityTier::Low);
        assert_eq!(cfg.cache_capacity, 4);
        assert!(!cfg.auto_downgrade);
    }

    #[test]
    fn empty_environment_is_unconfigured() {
        let cfg = VolumeLayerConfig::from_lookup(|_| None);
        assert_eq!(cfg, VolumeLayerConfig::default());
        assert!(!cfg.is_streaming_configured());
    }
}

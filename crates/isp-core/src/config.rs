//! TOML-backed pipeline configuration.
//!
//! Every field has a sensible default so an empty table is a valid config;
//! `validate()` rejects the values that would wedge the pipeline (zero
//! timeouts, zero channels, zero buffer depth).

use std::time::Duration;

use serde::Deserialize;

use crate::error::{IspError, IspResult};

fn default_channels() -> u8 {
    4
}
fn default_cameras() -> u8 {
    2
}
fn default_true() -> bool {
    true
}
fn default_sync_timeout_ms() -> u64 {
    1000
}
fn default_stop_timeout_ms() -> u64 {
    300
}
fn default_poll_interval_ms() -> u64 {
    20
}
fn default_sensor_idle_ms() -> u64 {
    2000
}
fn default_core_idle_ms() -> u64 {
    5000
}
fn default_idle_scan_ms() -> u64 {
    500
}
fn default_buffer_depth() -> usize {
    8
}

/// Queryable 3A capability ranges, answered from configuration.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct CapabilityRanges {
    pub gain_min: u32,
    pub gain_max: u32,
    pub exposure_us_min: u64,
    pub exposure_us_max: u64,
    pub iso: Vec<u32>,
    /// EV compensation range in third-stop steps.
    pub ev_min: i32,
    pub ev_max: i32,
}

impl Default for CapabilityRanges {
    fn default() -> Self {
        CapabilityRanges {
            gain_min: 0,
            gain_max: 100,
            exposure_us_min: 100,
            exposure_us_max: 1_000_000,
            iso: vec![100, 200, 400, 800, 1600, 3200],
            ev_min: -6,
            ev_max: 6,
        }
    }
}

/// Pipeline configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct IspConfig {
    /// Number of logical response channels (and dispatch workers).
    #[serde(default = "default_channels")]
    pub channels: u8,

    /// Number of physical camera slots.
    #[serde(default = "default_cameras")]
    pub cameras: u8,

    /// Whether the virtual/loopback camera slot exists after the physical ones.
    #[serde(default = "default_true")]
    pub virtual_camera: bool,

    /// Deadline for synchronous commands.
    #[serde(default = "default_sync_timeout_ms")]
    pub sync_timeout_ms: u64,

    /// Shorter best-effort deadline used for stream-off during stop.
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,

    /// Dispatch worker polling fallback interval.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Idle delay before an unused sensor domain powers down.
    #[serde(default = "default_sensor_idle_ms")]
    pub sensor_idle_ms: u64,

    /// Idle delay before the shared ISP core powers down once all sensors are off.
    #[serde(default = "default_core_idle_ms")]
    pub core_idle_ms: u64,

    /// Period of the idle-scan sweep.
    #[serde(default = "default_idle_scan_ms")]
    pub idle_scan_ms: u64,

    /// Maximum buffers a stream may hold in firmware at once.
    #[serde(default = "default_buffer_depth")]
    pub stream_buffer_depth: usize,

    #[serde(default)]
    pub capabilities: CapabilityRanges,
}

impl Default for IspConfig {
    fn default() -> Self {
        IspConfig {
            channels: default_channels(),
            cameras: default_cameras(),
            virtual_camera: default_true(),
            sync_timeout_ms: default_sync_timeout_ms(),
            stop_timeout_ms: default_stop_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            sensor_idle_ms: default_sensor_idle_ms(),
            core_idle_ms: default_core_idle_ms(),
            idle_scan_ms: default_idle_scan_ms(),
            stream_buffer_depth: default_buffer_depth(),
            capabilities: CapabilityRanges::default(),
        }
    }
}

impl IspConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(text: &str) -> IspResult<Self> {
        let config: IspConfig =
            toml::from_str(text).map_err(|e| IspError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> IspResult<()> {
        if self.channels == 0 {
            return Err(IspError::Config("channels must be non-zero".into()));
        }
        if self.cameras == 0 && !self.virtual_camera {
            return Err(IspError::Config(
                "at least one camera slot is required".into(),
            ));
        }
        if self.sync_timeout_ms == 0 || self.stop_timeout_ms == 0 {
            return Err(IspError::Config("timeouts must be non-zero".into()));
        }
        if self.poll_interval_ms == 0 || self.idle_scan_ms == 0 {
            return Err(IspError::Config("scan intervals must be non-zero".into()));
        }
        if self.stream_buffer_depth == 0 {
            return Err(IspError::Config(
                "stream_buffer_depth must be non-zero".into(),
            ));
        }
        if self.capabilities.gain_min > self.capabilities.gain_max
            || self.capabilities.exposure_us_min > self.capabilities.exposure_us_max
            || self.capabilities.ev_min > self.capabilities.ev_max
        {
            return Err(IspError::Config("capability range is inverted".into()));
        }
        Ok(())
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_timeout_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn sensor_idle(&self) -> Duration {
        Duration::from_millis(self.sensor_idle_ms)
    }

    pub fn core_idle(&self) -> Duration {
        Duration::from_millis(self.core_idle_ms)
    }

    pub fn idle_scan_interval(&self) -> Duration {
        Duration::from_millis(self.idle_scan_ms)
    }

    /// Total camera slots including the virtual one.
    pub fn camera_slots(&self) -> usize {
        self.cameras as usize + usize::from(self.virtual_camera)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config = IspConfig::from_toml_str("").unwrap();
        assert_eq!(config.channels, 4);
        assert_eq!(config.stream_buffer_depth, 8);
        assert_eq!(config.camera_slots(), 3);
        assert_eq!(config.capabilities.gain_max, 100);
    }

    #[test]
    fn overrides_apply() {
        let config = IspConfig::from_toml_str(
            r#"
            channels = 2
            cameras = 1
            virtual_camera = false
            sync_timeout_ms = 250

            [capabilities]
            gain_min = 10
            gain_max = 50
            exposure_us_min = 1000
            exposure_us_max = 30000
            iso = [100, 200]
            ev_min = -3
            ev_max = 3
            "#,
        )
        .unwrap();
        assert_eq!(config.channels, 2);
        assert_eq!(config.camera_slots(), 1);
        assert_eq!(config.sync_timeout(), Duration::from_millis(250));
        assert_eq!(config.capabilities.iso, vec![100, 200]);
    }

    #[test]
    fn zero_timeout_rejected() {
        assert!(IspConfig::from_toml_str("sync_timeout_ms = 0").is_err());
    }

    #[test]
    fn zero_depth_rejected() {
        assert!(IspConfig::from_toml_str("stream_buffer_depth = 0").is_err());
    }

    #[test]
    fn inverted_capability_range_rejected() {
        let text = r#"
            [capabilities]
            gain_min = 80
            gain_max = 20
            exposure_us_min = 100
            exposure_us_max = 200
            iso = [100]
            ev_min = 0
            ev_max = 0
        "#;
        assert!(IspConfig::from_toml_str(text).is_err());
    }
}

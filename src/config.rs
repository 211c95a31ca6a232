use anyhow::{Context, Result};
use log::warn;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;

/// Grating appearance, fixed for the lifetime of a session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StimulusConfig {
    /// Number of black/white stripes across the surface
    pub stripe_count: u32,
    /// Cycles per second, the sign picks the drift direction
    pub drift_speed: f64,
    pub orientation_deg: f64,
    /// 0 = flat gray, 1 = full black/white
    pub contrast: f64,
}

impl Default for StimulusConfig {
    fn default() -> Self {
        Self {
            stripe_count: 8,
            drift_speed: 0.25,
            orientation_deg: 0.0,
            contrast: 1.0,
        }
    }
}

impl StimulusConfig {
    /// Clamps out-of-range values instead of rejecting them.
    pub fn normalized(mut self) -> Self {
        if self.stripe_count == 0 {
            warn!("stripe_count must be at least 1, using 1");
            self.stripe_count = 1;
        }
        if !(0.0..=1.0).contains(&self.contrast) {
            let clamped = if self.contrast.is_nan() {
                0.0
            } else {
                self.contrast.clamp(0.0, 1.0)
            };
            warn!("contrast {} outside [0, 1], using {}", self.contrast, clamped);
            self.contrast = clamped;
        }
        self
    }

    pub fn orientation_rad(&self) -> f64 {
        self.orientation_deg.to_radians()
    }
}

/// Serial channel to the trial controller
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub port: String,
    pub baud_rate: u32,
    /// Bounds every blocking read so cancellation is seen promptly
    pub read_timeout_ms: u64,
    /// Wait after opening before the boot noise is discarded
    pub settle_ms: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            port: if cfg!(windows) {
                "COM7".to_string()
            } else {
                "/dev/ttyACM0".to_string()
            },
            baud_rate: 115_200,
            read_timeout_ms: 200,
            settle_ms: 1000,
        }
    }
}

impl LinkConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms.max(1))
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
}

/// Parameters of the outbound `START` line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StartCommand {
    pub fps: u32,
    pub duration_sec: f64,
    pub duty_cycle_t1: f64,
    pub duty_cycle_t2: f64,
    pub prescaler_t1: u32,
    pub prescaler_t2: u32,
}

impl Default for StartCommand {
    fn default() -> Self {
        Self {
            fps: 30,
            duration_sec: 7.0,
            duty_cycle_t1: 0.1,
            duty_cycle_t2: 0.2,
            prescaler_t1: 1024,
            prescaler_t2: 128,
        }
    }
}

impl fmt::Display for StartCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "START {} {} {} {} {} {}",
            self.fps,
            self.duration_sec,
            self.duty_cycle_t1,
            self.duty_cycle_t2,
            self.prescaler_t1,
            self.prescaler_t2
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    /// Monitor to go fullscreen on, the primary one is used if it does not exist
    pub monitor_index: usize,
    /// How long `preview` shows the grating
    pub preview_duration_sec: f64,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            // second output is the projector on the rig
            monitor_index: 1,
            preview_duration_sec: 2.0,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RigConfig {
    pub stimulus: StimulusConfig,
    pub link: LinkConfig,
    pub start: StartCommand,
    pub display: DisplayConfig,
}

impl RigConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_json(&text).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let mut config: RigConfig = serde_json::from_str(text)?;
        config.stimulus = config.stimulus.normalized();
        Ok(config)
    }
}

use std::path::Path;

use serde::{Deserialize, Serialize};

/// Runtime knobs persisted next to the binary. Missing fields fall back to
/// defaults, so an old settings file keeps loading.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub last_preset: Option<String>,
    pub capture: CaptureSettings,
    pub engine: EngineSettings,
    pub input: InputSettings,
    pub sim: SimSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSettings {
    /// Snapshot reuse window.
    pub ttl_ms: u64,
    /// ROI area / screen area above which the whole monitor is grabbed.
    pub roi_threshold: f64,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self { ttl_ms: 30, roi_threshold: 0.4, backoff_base_ms: 50, backoff_cap_ms: 2000 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Signal polling interval while waiting on start/completion.
    pub poll_ms: u64,
    /// Delay before a skipped or failed node comes due again.
    pub skip_retry_ms: u64,
    /// Delay after a gateway node that has no gap of its own.
    pub gateway_delay_ms: u64,
    /// Longest idle sleep when nothing is due.
    pub idle_wait_ms: u64,
    pub recent_attempts: usize,
    pub attempt_events: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            poll_ms: 15,
            skip_retry_ms: 100,
            gateway_delay_ms: 20,
            idle_wait_ms: 250,
            recent_attempts: 20,
            attempt_events: 64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InputSettings {
    /// Pause after each key tap.
    pub key_settle_ms: u64,
    /// Random +/- ratio applied to the settle pause.
    pub key_jitter: f64,
}

impl Default for InputSettings {
    fn default() -> Self {
        Self { key_settle_ms: 40, key_jitter: 0.25 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimSettings {
    pub max_ms: u64,
    pub max_nodes: usize,
}

impl Default for SimSettings {
    fn default() -> Self {
        Self { max_ms: 600_000, max_nodes: 2_000 }
    }
}

impl Settings {
    pub fn load(path: &Path) -> Self {
        std::fs::read_to_string(path)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default()
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

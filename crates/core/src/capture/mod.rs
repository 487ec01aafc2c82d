pub mod manager;
pub mod plan;
pub mod sampler;

#[cfg(feature = "debug-capture")]
pub mod debug;

use std::collections::BTreeMap;
use std::time::Instant;

use crate::types::{Frame, MonitorId, Rgb, Unavailable};

pub use manager::{backoff_ms, CaptureManager, CaptureStatus};
pub use plan::{build_plan, CapturePlan, MonitorRegion, RegionMode};
pub use sampler::{BaselineStore, LiveSampler};

/// Frames grabbed together for one plan version. Sampling a snapshot twice
/// yields the same colour.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub frames: BTreeMap<MonitorId, Frame>,
    pub taken_at: Instant,
    pub plan_version: u64,
}

impl Snapshot {
    pub fn sample(&self, monitor: MonitorId, x: i32, y: i32, radius: u32) -> Result<Rgb, Unavailable> {
        let frame = self
            .frames
            .get(&monitor)
            .ok_or_else(|| Unavailable::new("monitor_not_captured", format!("monitor {}", monitor)))?;
        frame
            .average(x, y, radius)
            .ok_or_else(|| Unavailable::new("outside_capture", format!("({}, {}) on monitor {}", x, y, monitor)))
    }
}

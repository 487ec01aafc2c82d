use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::expr::{BaselineProvider, PixelSampler, SampleSpec};
use crate::types::{MonitorId, Rgb, Unavailable};

use super::manager::CaptureManager;

/// Pixel sampler backed by the capture manager's cached snapshot.
pub struct LiveSampler {
    manager: Arc<CaptureManager>,
}

impl LiveSampler {
    pub fn new(manager: Arc<CaptureManager>) -> Self {
        Self { manager }
    }
}

impl PixelSampler for LiveSampler {
    fn sample(&self, monitor: MonitorId, x: i32, y: i32, spec: SampleSpec) -> Result<Rgb, Unavailable> {
        self.manager.snapshot()?.sample(monitor, x, y, spec.radius)
    }
}

/// Colours recorded just before a key press, per point id. Cast-bar start
/// detection compares the live colour against these.
#[derive(Debug, Default)]
pub struct BaselineStore {
    inner: Mutex<HashMap<String, Rgb>>,
}

impl BaselineStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, point_id: &str, color: Rgb) {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(point_id.to_string(), color);
    }

    pub fn clear(&self, point_id: &str) {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).remove(point_id);
    }
}

impl BaselineProvider for BaselineStore {
    fn get_baseline(&self, point_id: &str) -> Result<Rgb, Unavailable> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(point_id)
            .copied()
            .ok_or_else(|| Unavailable::new("baseline_missing", point_id.to_string()))
    }
}

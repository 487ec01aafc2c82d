use std::sync::Arc;

use crate::error::{CaptureError, DispatchError};
use crate::types::*;

use super::keys::KeyChord;
use super::{KeySender, Platform, ScreenSource};

/// Headless backend: one 1920x1080 black monitor, keys are only logged.
pub struct StubPlatform {
    screen: Arc<StubScreen>,
    keys: Arc<StubKeys>,
}

impl StubPlatform {
    pub fn new() -> Self {
        Self {
            screen: Arc::new(StubScreen { size: (1920, 1080), fill: Rgb(0, 0, 0) }),
            keys: Arc::new(StubKeys),
        }
    }
}

impl Default for StubPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl Platform for StubPlatform {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn screen(&self) -> Arc<dyn ScreenSource> {
        self.screen.clone()
    }

    fn keys(&self) -> Arc<dyn KeySender> {
        self.keys.clone()
    }
}

struct StubScreen {
    size: (i32, i32),
    fill: Rgb,
}

impl ScreenSource for StubScreen {
    fn screens(&self) -> Vec<Screen> {
        vec![Screen { id: 0, rect: Rect::new(0, 0, self.size.0, self.size.1) }]
    }

    fn grab(&self, monitor: MonitorId, rect: Rect) -> Result<Frame, CaptureError> {
        if monitor != 0 {
            return Err(CaptureError::NoSuchMonitor(monitor));
        }
        let bounds = Rect::new(0, 0, self.size.0, self.size.1);
        let clipped = bounds.intersect(&rect).ok_or(CaptureError::EmptyRegion)?;
        tracing::trace!(target: "stub", "grab({}, {:?})", monitor, clipped);
        Ok(Frame::solid(clipped, self.fill))
    }
}

struct StubKeys;

impl KeySender for StubKeys {
    fn send(&self, key: &KeyChord) -> Result<(), DispatchError> {
        tracing::info!(target: "stub", "tap(\"{}\")", key);
        Ok(())
    }
}

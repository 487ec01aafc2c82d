pub mod hotkey;
pub mod keys;
pub mod stub;

#[cfg(target_os = "macos")]
pub mod darwin;

use std::sync::Arc;

use crate::error::{CaptureError, DispatchError};
use crate::logger;
use crate::settings::InputSettings;
use crate::types::*;

use keys::KeyChord;

/// Grabs pixels from physical displays. Coordinates are monitor-local.
pub trait ScreenSource: Send + Sync {
    fn screens(&self) -> Vec<Screen>;
    fn grab(&self, monitor: MonitorId, rect: Rect) -> Result<Frame, CaptureError>;
}

/// Delivers key chords to the focused application.
pub trait KeySender: Send + Sync {
    fn send(&self, key: &KeyChord) -> Result<(), DispatchError>;
}

/// OS backend: a screen source and a key sender.
pub trait Platform: Send + Sync {
    fn name(&self) -> &'static str;
    fn screen(&self) -> Arc<dyn ScreenSource>;
    fn keys(&self) -> Arc<dyn KeySender>;
}

/// Create the platform appropriate for the current OS.
pub fn create_platform(force_stub: bool, input: &InputSettings) -> Box<dyn Platform> {
    if force_stub {
        logger::register_prefix("stub", logger::COLOR_GRAY);
        return Box::new(stub::StubPlatform::new());
    }
    #[cfg(target_os = "macos")]
    {
        logger::register_prefix("darwin", logger::COLOR_GRAY);
        Box::new(darwin::DarwinPlatform::new(input.clone()))
    }
    #[cfg(not(target_os = "macos"))]
    {
        let _ = input;
        logger::register_prefix("stub", logger::COLOR_GRAY);
        tracing::warn!(target: "stub", "no native backend for this OS, using the stub platform");
        Box::new(stub::StubPlatform::new())
    }
}

//! Scripted capabilities for unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::error::{CaptureError, DispatchError};
use crate::expr::{PixelSampler, SampleSpec};
use crate::platform::keys::KeyChord;
use crate::platform::{KeySender, ScreenSource};
use crate::types::{Frame, MonitorId, Rect, Rgb, Screen, Unavailable};

/// Single-monitor screen backed by one mutable frame.
pub struct ScriptedScreen {
    frame: Mutex<Frame>,
    grabs: AtomicUsize,
    failures: AtomicU32,
}

impl ScriptedScreen {
    pub fn new(w: i32, h: i32, fill: Rgb) -> Self {
        Self {
            frame: Mutex::new(Frame::solid(Rect::new(0, 0, w, h), fill)),
            grabs: AtomicUsize::new(0),
            failures: AtomicU32::new(0),
        }
    }

    pub fn paint(&self, _monitor: MonitorId, x: i32, y: i32, radius: i32, color: Rgb) {
        let mut f = self.frame.lock().unwrap();
        for yy in (y - radius)..=(y + radius) {
            for xx in (x - radius)..=(x + radius) {
                f.put(xx, yy, color);
            }
        }
    }

    /// Make the next `n` grabs fail.
    pub fn fail_next(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    pub fn grabs(&self) -> usize {
        self.grabs.load(Ordering::SeqCst)
    }
}

impl ScreenSource for ScriptedScreen {
    fn screens(&self) -> Vec<Screen> {
        vec![Screen { id: 0, rect: self.frame.lock().unwrap().origin }]
    }

    fn grab(&self, monitor: MonitorId, _rect: Rect) -> Result<Frame, CaptureError> {
        self.grabs.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(CaptureError::Backend("scripted failure".into()));
        }
        if monitor != 0 {
            return Err(CaptureError::NoSuchMonitor(monitor));
        }
        Ok(self.frame.lock().unwrap().clone())
    }
}

type SendHook = Box<dyn FnMut(usize) + Send>;

/// Records every chord; can fail on demand or run a hook after each press.
#[derive(Default)]
pub struct ScriptedKeys {
    sent: Mutex<Vec<String>>,
    failing: AtomicBool,
    hook: Mutex<Option<SendHook>>,
}

impl ScriptedKeys {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail(&self, on: bool) {
        self.failing.store(on, Ordering::SeqCst);
    }

    /// `hook(n)` runs after the n-th successful press (1-based).
    pub fn on_send(&self, hook: impl FnMut(usize) + Send + 'static) {
        *self.hook.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }
}

impl KeySender for ScriptedKeys {
    fn send(&self, key: &KeyChord) -> Result<(), DispatchError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(DispatchError::Backend("scripted failure".into()));
        }
        let n = {
            let mut sent = self.sent.lock().unwrap();
            sent.push(key.to_string());
            sent.len()
        };
        if let Some(hook) = self.hook.lock().unwrap().as_mut() {
            hook(n);
        }
        Ok(())
    }
}

/// Sampler over explicitly set coordinates on monitor 0.
#[derive(Default)]
pub struct MapSampler {
    pixels: Mutex<HashMap<(i32, i32), Rgb>>,
}

impl MapSampler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, x: i32, y: i32, color: Rgb) {
        self.pixels.lock().unwrap().insert((x, y), color);
    }
}

impl PixelSampler for MapSampler {
    fn sample(&self, _monitor: MonitorId, x: i32, y: i32, _spec: SampleSpec) -> Result<Rgb, Unavailable> {
        self.pixels
            .lock()
            .unwrap()
            .get(&(x, y))
            .copied()
            .ok_or_else(|| Unavailable::new("no_pixel", format!("({}, {})", x, y)))
    }
}

use std::process::Command as ProcessCommand;
use std::sync::Arc;

use core_graphics::display::CGDisplay;
use core_graphics::geometry::*;
use core_graphics::window::*;

use crate::error::{CaptureError, DispatchError};
use crate::settings::InputSettings;
use crate::sleep::jittered;
use crate::types::*;

use super::keys::{KeyChord, Modifier};
use super::{KeySender, Platform, ScreenSource};

// AppleScript key codes for keys `keystroke` cannot express
fn applescript_key_code(key: &str) -> Option<u16> {
    match key {
        "enter" | "return" => Some(36),
        "escape" | "esc" => Some(53),
        "delete" | "backspace" => Some(51),
        "tab" => Some(48),
        "space" => Some(49),
        "up" => Some(126),
        "down" => Some(125),
        "left" => Some(123),
        "right" => Some(124),
        "home" => Some(115),
        "end" => Some(119),
        "pageup" => Some(116),
        "pagedown" => Some(121),
        "f1" => Some(122),
        "f2" => Some(120),
        "f3" => Some(99),
        "f4" => Some(118),
        "f5" => Some(96),
        "f6" => Some(97),
        "f7" => Some(98),
        "f8" => Some(100),
        "f9" => Some(101),
        "f10" => Some(109),
        "f11" => Some(103),
        "f12" => Some(111),
        "num0" => Some(82),
        "num1" => Some(83),
        "num2" => Some(84),
        "num3" => Some(85),
        "num4" => Some(86),
        "num5" => Some(87),
        "num6" => Some(88),
        "num7" => Some(89),
        "num8" => Some(91),
        "num9" => Some(92),
        _ => None,
    }
}

pub struct DarwinPlatform {
    screen: Arc<DarwinScreen>,
    keys: Arc<DarwinKeys>,
}

impl DarwinPlatform {
    pub fn new(input: InputSettings) -> Self {
        DarwinPlatform { screen: Arc::new(DarwinScreen), keys: Arc::new(DarwinKeys { input }) }
    }
}

impl Platform for DarwinPlatform {
    fn name(&self) -> &'static str {
        "darwin"
    }

    fn screen(&self) -> Arc<dyn ScreenSource> {
        self.screen.clone()
    }

    fn keys(&self) -> Arc<dyn KeySender> {
        self.keys.clone()
    }
}

struct DarwinScreen;

impl DarwinScreen {
    fn display(&self, monitor: MonitorId) -> Result<CGDisplay, CaptureError> {
        let ids = CGDisplay::active_displays()
            .map_err(|e| CaptureError::Backend(format!("CGGetActiveDisplayList error {}", e)))?;
        ids.get(monitor as usize)
            .map(|id| CGDisplay::new(*id))
            .ok_or(CaptureError::NoSuchMonitor(monitor))
    }
}

impl ScreenSource for DarwinScreen {
    fn screens(&self) -> Vec<Screen> {
        let ids = match CGDisplay::active_displays() {
            Ok(ids) => ids,
            Err(e) => {
                tracing::warn!(target: "darwin", "failed to list displays: {}", e);
                return Vec::new();
            }
        };
        ids.iter()
            .enumerate()
            .map(|(i, id)| {
                let b = CGDisplay::new(*id).bounds();
                Screen {
                    id: i as MonitorId,
                    rect: Rect::new(0, 0, b.size.width as i32, b.size.height as i32),
                }
            })
            .collect()
    }

    fn grab(&self, monitor: MonitorId, rect: Rect) -> Result<Frame, CaptureError> {
        if rect.is_empty() {
            return Err(CaptureError::EmptyRegion);
        }
        let bounds = self.display(monitor)?.bounds();
        let cg_rect = CGRect::new(
            &CGPoint::new(bounds.origin.x + rect.x as f64, bounds.origin.y + rect.y as f64),
            &CGSize::new(rect.w as f64, rect.h as f64),
        );

        let image = create_image(
            cg_rect,
            kCGWindowListOptionOnScreenOnly,
            kCGNullWindowID,
            kCGWindowImageNominalResolution,
        )
        .ok_or_else(|| CaptureError::Backend("CGWindowListCreateImage returned null".into()))?;

        let bpr = image.bytes_per_row() as u32;
        let width = image.width() as u32;
        let height = image.height() as u32;
        let cf_data = image.data();

        Ok(Frame {
            origin: Rect::new(rect.x, rect.y, width as i32, height as i32),
            data: cf_data.bytes().to_vec(),
            width,
            height,
            bytes_per_row: bpr,
        })
    }
}

struct DarwinKeys {
    input: InputSettings,
}

impl KeySender for DarwinKeys {
    fn send(&self, key: &KeyChord) -> Result<(), DispatchError> {
        let mut modifiers = Vec::new();
        for (m, name) in [
            (Modifier::Cmd, "command down"),
            (Modifier::Shift, "shift down"),
            (Modifier::Ctrl, "control down"),
            (Modifier::Alt, "option down"),
        ] {
            if key.has(m) {
                modifiers.push(name);
            }
        }

        let key_part = if let Some(code) = applescript_key_code(&key.key) {
            format!("key code {}", code)
        } else if key.key.chars().count() == 1 {
            let escaped = key.key.replace('\\', "\\\\").replace('"', "\\\"");
            format!("keystroke \"{}\"", escaped)
        } else {
            return Err(DispatchError::Backend(format!("no AppleScript mapping for `{}`", key.key)));
        };

        let modifier_str = if modifiers.is_empty() {
            String::new()
        } else {
            format!(" using {{{}}}", modifiers.join(", "))
        };

        // keys go to whatever process is frontmost
        let script = format!("tell application \"System Events\" to {}{}", key_part, modifier_str);

        let status = ProcessCommand::new("osascript")
            .arg("-e")
            .arg(&script)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .map_err(|e| DispatchError::Backend(format!("osascript: {}", e)))?;
        if !status.success() {
            return Err(DispatchError::Backend(format!("osascript exited with {}", status)));
        }
        tracing::debug!(target: "darwin", "tap(\"{}\")", key);

        std::thread::sleep(jittered(self.input.key_settle_ms, self.input.key_jitter));
        Ok(())
    }
}

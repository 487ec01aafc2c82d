use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Display index as reported by the platform (0 = primary)
pub type MonitorId = u32;

/// Milliseconds since the start of a run. The scheduler works exclusively in
/// this unit so the simulator and the live engine share its arithmetic.
pub type Millis = u64;

/// Screen-coordinate rectangle (monitor-local)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
}

impl Rect {
    pub fn new(x: i32, y: i32, w: i32, h: i32) -> Self {
        Self { x, y, w, h }
    }

    pub fn right(&self) -> i32 {
        self.x + self.w
    }

    pub fn bottom(&self) -> i32 {
        self.y + self.h
    }

    pub fn area(&self) -> i64 {
        if self.is_empty() {
            0
        } else {
            self.w as i64 * self.h as i64
        }
    }

    pub fn is_empty(&self) -> bool {
        self.w <= 0 || self.h <= 0
    }

    pub fn contains(&self, x: i32, y: i32) -> bool {
        x >= self.x && x < self.right() && y >= self.y && y < self.bottom()
    }

    /// Smallest rectangle covering both.
    pub fn union(&self, other: &Rect) -> Rect {
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }
        let x = self.x.min(other.x);
        let y = self.y.min(other.y);
        let r = self.right().max(other.right());
        let b = self.bottom().max(other.bottom());
        Rect::new(x, y, r - x, b - y)
    }

    /// Overlap of both, or `None` when they are disjoint.
    pub fn intersect(&self, other: &Rect) -> Option<Rect> {
        let x = self.x.max(other.x);
        let y = self.y.max(other.y);
        let r = self.right().min(other.right());
        let b = self.bottom().min(other.bottom());
        if r <= x || b <= y {
            None
        } else {
            Some(Rect::new(x, y, r - x, b - y))
        }
    }
}

/// 8-bit RGB colour. Serialized as `[r, g, b]`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rgb(pub u8, pub u8, pub u8);

impl Rgb {
    /// Largest per-channel absolute difference.
    pub fn max_delta(&self, other: &Rgb) -> u8 {
        let dr = self.0.abs_diff(other.0);
        let dg = self.1.abs_diff(other.1);
        let db = self.2.abs_diff(other.2);
        dr.max(dg).max(db)
    }

    pub fn within(&self, other: &Rgb, tolerance: u8) -> bool {
        self.max_delta(other) <= tolerance
    }
}

impl fmt::Display for Rgb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:02x}{:02x}{:02x}", self.0, self.1, self.2)
    }
}

/// One physical display
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Screen {
    pub id: MonitorId,
    pub rect: Rect,
}

/// Raw pixel data (BGRA) covering `origin` on one monitor.
#[derive(Debug, Clone)]
pub struct Frame {
    pub origin: Rect,
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub bytes_per_row: u32,
}

impl Frame {
    /// Build a frame filled with a single colour. Used by the stub platform
    /// and tests.
    pub fn solid(origin: Rect, color: Rgb) -> Self {
        let width = origin.w.max(0) as u32;
        let height = origin.h.max(0) as u32;
        let bytes_per_row = width * 4;
        let mut data = Vec::with_capacity((bytes_per_row * height) as usize);
        for _ in 0..(width * height) {
            data.extend_from_slice(&[color.2, color.1, color.0, 0xff]);
        }
        Self { origin, data, width, height, bytes_per_row }
    }

    /// Overwrite one pixel (monitor coordinates). Out-of-frame writes are ignored.
    pub fn put(&mut self, x: i32, y: i32, color: Rgb) {
        if let Some(idx) = self.index(x, y) {
            self.data[idx] = color.2;
            self.data[idx + 1] = color.1;
            self.data[idx + 2] = color.0;
        }
    }

    fn index(&self, x: i32, y: i32) -> Option<usize> {
        if !self.origin.contains(x, y) {
            return None;
        }
        let lx = (x - self.origin.x) as u32;
        let ly = (y - self.origin.y) as u32;
        if lx >= self.width || ly >= self.height {
            return None;
        }
        let idx = (ly * self.bytes_per_row + lx * 4) as usize;
        if idx + 3 >= self.data.len() {
            return None;
        }
        Some(idx)
    }

    /// Colour at a monitor coordinate.
    pub fn pixel(&self, x: i32, y: i32) -> Option<Rgb> {
        let idx = self.index(x, y)?;
        Some(Rgb(self.data[idx + 2], self.data[idx + 1], self.data[idx]))
    }

    /// Mean colour of the `(2r+1)²` square centred on `(x, y)`, clipped to the
    /// frame. `None` only when the centre itself is outside the frame.
    pub fn average(&self, x: i32, y: i32, radius: u32) -> Option<Rgb> {
        self.pixel(x, y)?;
        let r = radius as i32;
        let (mut sr, mut sg, mut sb, mut n) = (0u64, 0u64, 0u64, 0u64);
        for yy in (y - r)..=(y + r) {
            for xx in (x - r)..=(x + r) {
                if let Some(c) = self.pixel(xx, yy) {
                    sr += c.0 as u64;
                    sg += c.1 as u64;
                    sb += c.2 as u64;
                    n += 1;
                }
            }
        }
        Some(Rgb((sr / n) as u8, (sg / n) as u8, (sb / n) as u8))
    }
}

/// Tagged "could not observe" result shared by every capability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unavailable {
    pub code: &'static str,
    pub detail: String,
    pub retry_after: Option<Instant>,
}

impl Unavailable {
    pub fn new(code: &'static str, detail: impl Into<String>) -> Self {
        Self { code, detail: detail.into(), retry_after: None }
    }

    pub fn retry_after(mut self, at: Instant) -> Self {
        self.retry_after = Some(at);
        self
    }
}

impl fmt::Display for Unavailable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.detail.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{}: {}", self.code, self.detail)
        }
    }
}

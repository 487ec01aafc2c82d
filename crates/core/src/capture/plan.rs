//! Turn probe requirements into per-monitor capture regions.

use std::collections::BTreeMap;

use crate::catalogue::Catalogue;
use crate::expr::ProbeRequirements;
use crate::types::{MonitorId, Rect, Screen};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionMode {
    /// Only the bounding box of the probes.
    Roi,
    /// The whole monitor; cheaper than many large ROI grabs.
    Full,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorRegion {
    pub monitor: MonitorId,
    pub mode: RegionMode,
    pub rect: Rect,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CapturePlan {
    pub version: u64,
    pub regions: Vec<MonitorRegion>,
    /// Probe ids that could not be placed on any region.
    pub unresolved: Vec<String>,
}

impl CapturePlan {
    pub fn region(&self, monitor: MonitorId) -> Option<&MonitorRegion> {
        self.regions.iter().find(|r| r.monitor == monitor)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbePoint {
    pub monitor: MonitorId,
    pub x: i32,
    pub y: i32,
    pub radius: u32,
}

impl ProbePoint {
    fn bounds(&self) -> Rect {
        let r = self.radius as i32;
        Rect::new(self.x - r, self.y - r, 2 * r + 1, 2 * r + 1)
    }
}

/// Resolve every pixel-bearing id to a screen coordinate. Ids missing from
/// the catalogue (or skills without a pixel) come back in the second list.
pub fn resolve_probes(req: &ProbeRequirements, catalogue: &Catalogue) -> (Vec<ProbePoint>, Vec<String>) {
    let mut points = Vec::new();
    let mut unresolved = Vec::new();
    for id in &req.point_ids {
        match catalogue.point(id) {
            Some(p) => points.push(ProbePoint { monitor: p.monitor, x: p.x, y: p.y, radius: p.sample_radius }),
            None => unresolved.push(format!("point:{}", id)),
        }
    }
    for id in &req.skill_pixel_ids {
        match catalogue.skill(id).and_then(|s| s.pixel.as_ref()) {
            Some(p) => points.push(ProbePoint { monitor: p.monitor, x: p.x, y: p.y, radius: p.sample_radius }),
            None => unresolved.push(format!("skill:{}", id)),
        }
    }
    (points, unresolved)
}

/// One region per monitor: the probes' bounding box clipped to the screen,
/// promoted to a full-monitor grab when it covers at least `threshold` of it.
pub fn build_plan(
    req: &ProbeRequirements,
    catalogue: &Catalogue,
    screens: &[Screen],
    threshold: f64,
    version: u64,
) -> CapturePlan {
    let (points, mut unresolved) = resolve_probes(req, catalogue);

    let mut boxes: BTreeMap<MonitorId, Rect> = BTreeMap::new();
    for p in &points {
        let b = p.bounds();
        boxes
            .entry(p.monitor)
            .and_modify(|acc| *acc = acc.union(&b))
            .or_insert(b);
    }

    let mut regions = Vec::new();
    for (monitor, bbox) in boxes {
        let Some(screen) = screens.iter().find(|s| s.id == monitor) else {
            unresolved.push(format!("monitor:{}", monitor));
            continue;
        };
        let Some(clipped) = bbox.intersect(&screen.rect) else {
            unresolved.push(format!("monitor:{}:offscreen", monitor));
            continue;
        };
        let ratio = clipped.area() as f64 / screen.rect.area().max(1) as f64;
        let region = if ratio >= threshold {
            MonitorRegion { monitor, mode: RegionMode::Full, rect: screen.rect }
        } else {
            MonitorRegion { monitor, mode: RegionMode::Roi, rect: clipped }
        };
        regions.push(region);
    }

    CapturePlan { version, regions, unresolved }
}

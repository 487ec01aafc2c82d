use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use crate::catalogue::Catalogue;
use crate::expr::ProbeRequirements;
use crate::platform::ScreenSource;
use crate::settings::CaptureSettings;
use crate::store::events::{EngineEvent, EventBus};
use crate::types::Unavailable;

use super::plan::{build_plan, CapturePlan};
use super::Snapshot;

/// Delay before the next capture after `failures` consecutive failures:
/// `base * 2^(failures-1)`, capped. Zero failures means no delay.
pub fn backoff_ms(failures: u32, base_ms: u64, cap_ms: u64) -> u64 {
    if failures == 0 {
        return 0;
    }
    let factor = 1u64.checked_shl(failures - 1).unwrap_or(u64::MAX);
    base_ms.saturating_mul(factor).min(cap_ms)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureStatus {
    pub plan_version: u64,
    pub regions: usize,
    pub failures: u32,
    pub backoff_ms: u64,
    pub last_error: Option<String>,
    pub captures: u64,
}

struct CaptureState {
    probes: ProbeRequirements,
    plan: Arc<CapturePlan>,
    failures: u32,
    backoff_until: Option<Instant>,
    last_error: Option<Unavailable>,
    captures: u64,
}

/// Owns the capture plan and a short-lived snapshot cache.
///
/// Readers take the `RwLock` fast path while the cached snapshot is fresh.
/// A real grab re-validates backoff under the state mutex, then captures
/// with no lock held.
pub struct CaptureManager {
    source: Arc<dyn ScreenSource>,
    catalogue: Arc<Catalogue>,
    settings: CaptureSettings,
    bus: Option<Arc<EventBus>>,
    version: AtomicU64,
    cache: RwLock<Option<Arc<Snapshot>>>,
    state: Mutex<CaptureState>,
}

impl CaptureManager {
    pub fn new(source: Arc<dyn ScreenSource>, catalogue: Arc<Catalogue>, settings: CaptureSettings) -> Self {
        Self {
            source,
            catalogue,
            settings,
            bus: None,
            version: AtomicU64::new(0),
            cache: RwLock::new(None),
            state: Mutex::new(CaptureState {
                probes: ProbeRequirements::new(),
                plan: Arc::new(CapturePlan::default()),
                failures: 0,
                backoff_until: None,
                last_error: None,
                captures: 0,
            }),
        }
    }

    pub fn with_events(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, CaptureState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish(&self, event: EngineEvent) {
        if let Some(bus) = &self.bus {
            bus.publish(event);
        }
    }

    fn clear_cache(&self) {
        *self.cache.write().unwrap_or_else(|e| e.into_inner()) = None;
    }

    /// Rebuild the plan when the pixel requirements changed. Returns `true`
    /// when a new plan was installed; identical requirements are a no-op.
    pub fn update_probes(&self, probes: &ProbeRequirements) -> bool {
        let plan = {
            let mut st = self.lock_state();
            let fresh = st.plan.version == 0;
            if !fresh && st.probes.same_pixels(probes) {
                st.probes = probes.clone();
                return false;
            }
            let version = self.version.load(Ordering::Acquire) + 1;
            let screens = self.source.screens();
            let plan = Arc::new(build_plan(probes, &self.catalogue, &screens, self.settings.roi_threshold, version));
            st.probes = probes.clone();
            st.plan = plan.clone();
            self.version.store(version, Ordering::Release);
            self.clear_cache();
            plan
        };
        if !plan.unresolved.is_empty() {
            tracing::warn!("capture plan v{} could not place: {}", plan.version, plan.unresolved.join(", "));
        }
        tracing::debug!("capture plan v{} with {} region(s)", plan.version, plan.regions.len());
        self.publish(EngineEvent::CapturePlanChanged { version: plan.version, regions: plan.regions.len() });
        true
    }

    pub fn plan(&self) -> Arc<CapturePlan> {
        self.lock_state().plan.clone()
    }

    /// Drop the cached snapshot so the next read grabs fresh pixels.
    pub fn invalidate(&self) {
        self.clear_cache();
    }

    pub fn status(&self) -> CaptureStatus {
        let st = self.lock_state();
        CaptureStatus {
            plan_version: st.plan.version,
            regions: st.plan.regions.len(),
            failures: st.failures,
            backoff_ms: backoff_ms(st.failures, self.settings.backoff_base_ms, self.settings.backoff_cap_ms),
            last_error: st.last_error.as_ref().map(|e| e.to_string()),
            captures: st.captures,
        }
    }

    fn cached(&self) -> Option<Arc<Snapshot>> {
        let cache = self.cache.read().unwrap_or_else(|e| e.into_inner());
        let snap = cache.as_ref()?;
        let ttl = Duration::from_millis(self.settings.ttl_ms);
        if snap.taken_at.elapsed() < ttl && snap.plan_version == self.version.load(Ordering::Acquire) {
            Some(snap.clone())
        } else {
            None
        }
    }

    /// A snapshot no older than the TTL, or why none is available.
    pub fn snapshot(&self) -> Result<Arc<Snapshot>, Unavailable> {
        if let Some(snap) = self.cached() {
            return Ok(snap);
        }

        let plan = {
            let st = self.lock_state();
            if let Some(until) = st.backoff_until {
                if Instant::now() < until {
                    return Err(Unavailable::new(
                        "capture_backoff",
                        format!("{} consecutive failure(s)", st.failures),
                    )
                    .retry_after(until));
                }
            }
            st.plan.clone()
        };
        // another reader may have refreshed while we waited for the lock
        if let Some(snap) = self.cached() {
            return Ok(snap);
        }
        if plan.regions.is_empty() {
            return Err(Unavailable::new("capture_no_plan", "no probes to capture"));
        }

        let mut frames = BTreeMap::new();
        let mut failure = None;
        for region in &plan.regions {
            match self.source.grab(region.monitor, region.rect) {
                Ok(frame) => {
                    frames.insert(region.monitor, frame);
                }
                Err(e) => {
                    failure = Some(Unavailable::new(e.code(), e.to_string()));
                    break;
                }
            }
        }

        match failure {
            Some(err) => Err(self.record_failure(err)),
            None => {
                let snap = Arc::new(Snapshot { frames, taken_at: Instant::now(), plan_version: plan.version });
                self.record_success(&snap);
                Ok(snap)
            }
        }
    }

    fn record_failure(&self, err: Unavailable) -> Unavailable {
        let (failures, delay, until) = {
            let mut st = self.lock_state();
            st.failures = st.failures.saturating_add(1);
            let delay = backoff_ms(st.failures, self.settings.backoff_base_ms, self.settings.backoff_cap_ms);
            let until = Instant::now() + Duration::from_millis(delay);
            st.backoff_until = Some(until);
            st.last_error = Some(err.clone());
            (st.failures, delay, until)
        };
        tracing::warn!("capture failed ({} in a row), backing off {}ms: {}", failures, delay, err);
        self.publish(EngineEvent::CaptureFailed {
            code: err.code.to_string(),
            detail: err.detail.clone(),
            backoff_ms: delay,
        });
        err.retry_after(until)
    }

    fn record_success(&self, snap: &Arc<Snapshot>) {
        let recovered = {
            let mut st = self.lock_state();
            st.captures += 1;
            let prior = st.failures;
            st.failures = 0;
            st.backoff_until = None;
            st.last_error = None;
            // a plan change while we were grabbing makes this snapshot stale
            if st.plan.version == snap.plan_version {
                *self.cache.write().unwrap_or_else(|e| e.into_inner()) = Some(snap.clone());
            }
            prior
        };
        if recovered > 0 {
            tracing::info!("capture recovered after {} failure(s)", recovered);
            self.publish(EngineEvent::CaptureRecovered { after_failures: recovered });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalogue::PointDef;
    use crate::test_support::ScriptedScreen;
    use crate::types::Rgb;

    fn catalogue() -> Arc<Catalogue> {
        Arc::new(
            Catalogue::new()
                .with_point(PointDef {
                    id: "p".into(),
                    monitor: 0,
                    x: 5,
                    y: 5,
                    color: Rgb(200, 0, 0),
                    tolerance: 10,
                    sample_radius: 0,
                })
                .with_point(PointDef {
                    id: "q".into(),
                    monitor: 0,
                    x: 8,
                    y: 8,
                    color: Rgb(0, 0, 0),
                    tolerance: 10,
                    sample_radius: 0,
                }),
        )
    }

    fn probes(ids: &[&str]) -> ProbeRequirements {
        let mut r = ProbeRequirements::new();
        r.point_ids.extend(ids.iter().map(|s| s.to_string()));
        r
    }

    fn settings(ttl_ms: u64) -> CaptureSettings {
        CaptureSettings { ttl_ms, roi_threshold: 0.4, backoff_base_ms: 50, backoff_cap_ms: 2000 }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(backoff_ms(0, 50, 2000), 0);
        assert_eq!(backoff_ms(1, 50, 2000), 50);
        assert_eq!(backoff_ms(2, 50, 2000), 100);
        assert_eq!(backoff_ms(3, 50, 2000), 200);
        assert_eq!(backoff_ms(7, 50, 2000), 2000);
        assert_eq!(backoff_ms(200, 50, 2000), 2000);
        assert_eq!(backoff_ms(64, u64::MAX, u64::MAX), u64::MAX);
    }

    #[test]
    fn snapshot_is_reused_within_ttl() {
        let screen = Arc::new(ScriptedScreen::new(100, 100, Rgb(200, 0, 0)));
        let mgr = CaptureManager::new(screen.clone(), catalogue(), settings(60_000));
        assert!(mgr.update_probes(&probes(&["p"])));
        let a = mgr.snapshot().unwrap();
        let b = mgr.snapshot().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(screen.grabs(), 1);
        assert_eq!(a.sample(0, 5, 5, 0).unwrap(), Rgb(200, 0, 0));

        mgr.invalidate();
        mgr.snapshot().unwrap();
        assert_eq!(screen.grabs(), 2);
    }

    #[test]
    fn identical_probes_keep_the_plan() {
        let screen = Arc::new(ScriptedScreen::new(100, 100, Rgb(0, 0, 0)));
        let mgr = CaptureManager::new(screen, catalogue(), settings(60_000));
        assert!(mgr.update_probes(&probes(&["p"])));
        let v1 = mgr.plan().version;
        let mut with_metric = probes(&["p"]);
        with_metric.skill_metric_ids.insert("s".into());
        assert!(!mgr.update_probes(&with_metric));
        assert_eq!(mgr.plan().version, v1);

        assert!(mgr.update_probes(&probes(&["p", "q"])));
        assert_eq!(mgr.plan().version, v1 + 1);
    }

    #[test]
    fn plan_change_invalidates_cache() {
        let screen = Arc::new(ScriptedScreen::new(100, 100, Rgb(0, 0, 0)));
        let mgr = CaptureManager::new(screen.clone(), catalogue(), settings(60_000));
        mgr.update_probes(&probes(&["p"]));
        mgr.snapshot().unwrap();
        mgr.update_probes(&probes(&["q"]));
        let snap = mgr.snapshot().unwrap();
        assert_eq!(screen.grabs(), 2);
        assert_eq!(snap.plan_version, mgr.plan().version);
    }

    #[test]
    fn failures_back_off_then_recover() {
        let screen = Arc::new(ScriptedScreen::new(100, 100, Rgb(0, 0, 0)));
        let bus = Arc::new(EventBus::new());
        let rx = bus.subscribe();
        let mgr = CaptureManager::new(screen.clone(), catalogue(), settings(0)).with_events(bus);
        mgr.update_probes(&probes(&["p"]));

        screen.fail_next(1);
        let err = mgr.snapshot().unwrap_err();
        assert_eq!(err.code, "capture_failed");
        assert!(err.retry_after.is_some());
        assert_eq!(mgr.status().failures, 1);

        // inside the backoff window no grab is attempted
        let err = mgr.snapshot().unwrap_err();
        assert_eq!(err.code, "capture_backoff");
        assert_eq!(screen.grabs(), 1);

        std::thread::sleep(Duration::from_millis(60));
        assert!(mgr.snapshot().is_ok());
        assert_eq!(mgr.status().failures, 0);

        let events: Vec<EngineEvent> = rx.try_iter().collect();
        assert!(events.iter().any(|e| matches!(e, EngineEvent::CaptureFailed { backoff_ms: 50, .. })));
        assert!(events.iter().any(|e| matches!(e, EngineEvent::CaptureRecovered { after_failures: 1 })));
    }

    #[test]
    fn plan_change_keeps_the_backoff_window() {
        let screen = Arc::new(ScriptedScreen::new(100, 100, Rgb(0, 0, 0)));
        let slow = CaptureSettings { backoff_base_ms: 10_000, backoff_cap_ms: 60_000, ..settings(0) };
        let mgr = CaptureManager::new(screen.clone(), catalogue(), slow);
        mgr.update_probes(&probes(&["p"]));

        screen.fail_next(1);
        assert_eq!(mgr.snapshot().unwrap_err().code, "capture_failed");
        assert!(mgr.update_probes(&probes(&["q"])));

        let err = mgr.snapshot().unwrap_err();
        assert_eq!(err.code, "capture_backoff");
        assert_eq!(screen.grabs(), 1);
        assert_eq!(mgr.status().failures, 1);
    }

    #[test]
    fn empty_plan_is_unavailable() {
        let screen = Arc::new(ScriptedScreen::new(100, 100, Rgb(0, 0, 0)));
        let mgr = CaptureManager::new(screen, catalogue(), settings(30));
        mgr.update_probes(&ProbeRequirements::new());
        assert_eq!(mgr.snapshot().unwrap_err().code, "capture_no_plan");
    }
}

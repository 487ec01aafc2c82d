//! One attempt at one skill node:
//! readiness, cast lock, key dispatch, start detection, completion.

pub mod lock;

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::capture::BaselineStore;
use crate::catalogue::{Catalogue, SkillDef};
use crate::error::DispatchError;
use crate::expr::{Evaluation, Evaluator, Expr, PixelSampler, SampleSpec, Tri};
use crate::platform::keys::KeyChord;
use crate::platform::KeySender;
use crate::preset::{CompletionPolicy, CompletionSpec, LockOptions, LockPolicy, SkillNode, StartMode, StartSpec};
use crate::settings::EngineSettings;
use crate::sleep::{CancelToken, RunClock};
use crate::store::events::EngineEvent;
use crate::store::{StateStore, Stage};

pub use lock::{CastGuard, CastLock, Contended};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptResult {
    Success,
    Failed,
    /// Never started: not ready, disabled, or lock contention.
    Skipped,
    /// Cancelled by a stop request.
    Stopped,
}

/// What the scheduler should do with the node after an attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptOutcome {
    pub result: AttemptResult,
    pub advance: bool,
    pub delay_ms: u64,
    pub attempt_id: Option<String>,
    pub reason: Option<String>,
}

enum Poll {
    Signaled,
    TimedOut { observed: bool },
    Cancelled,
}

pub struct AttemptExecutor {
    catalogue: Arc<Catalogue>,
    pixels: Arc<dyn PixelSampler>,
    keys: Arc<dyn KeySender>,
    store: Arc<StateStore>,
    baselines: Arc<BaselineStore>,
    lock: Arc<CastLock>,
    cancel: CancelToken,
    clock: RunClock,
    settings: EngineSettings,
}

impl AttemptExecutor {
    pub fn new(
        catalogue: Arc<Catalogue>,
        pixels: Arc<dyn PixelSampler>,
        keys: Arc<dyn KeySender>,
        store: Arc<StateStore>,
    ) -> Self {
        Self {
            catalogue,
            pixels,
            keys,
            store,
            baselines: Arc::new(BaselineStore::new()),
            lock: Arc::new(CastLock::new()),
            cancel: CancelToken::new(),
            clock: RunClock::start(),
            settings: EngineSettings::default(),
        }
    }

    pub fn with_lock(mut self, lock: Arc<CastLock>) -> Self {
        self.lock = lock;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_clock(mut self, clock: RunClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn baselines(&self) -> &Arc<BaselineStore> {
        &self.baselines
    }

    /// Evaluate against live pixels, the store's metrics and cast-bar baselines.
    pub fn eval(&self, expr: &Expr) -> Evaluation {
        Evaluator::new(&self.catalogue, &*self.pixels)
            .with_metrics(&*self.store)
            .with_baselines(&*self.baselines)
            .eval(expr)
    }

    fn now(&self) -> u64 {
        self.clock.now_ms()
    }

    fn skipped(&self, node: &SkillNode, reason: &str, advance: bool) -> AttemptOutcome {
        tracing::debug!("skip {} ({}): {}", node.id, node.skill_id, reason);
        self.store.publish(EngineEvent::SkillSkipped {
            skill_id: node.skill_id.clone(),
            node_id: node.id.clone(),
            reason: reason.to_string(),
            at_ms: self.now(),
        });
        AttemptOutcome {
            result: AttemptResult::Skipped,
            advance,
            delay_ms: self.settings.skip_retry_ms,
            attempt_id: None,
            reason: Some(reason.to_string()),
        }
    }

    /// Run the node's skill once. Never panics on capability failures; every
    /// problem ends up as a terminal stage with a reason.
    pub fn run(&self, node: &SkillNode) -> AttemptOutcome {
        let Some(skill) = self.catalogue.skill(&node.skill_id) else {
            return self.skipped(node, "skill_not_found", true);
        };
        if !skill.enabled {
            return self.skipped(node, "skill_disabled", true);
        }

        let ready = self.eval(&node.ready);
        match ready.value {
            Tri::True => {}
            Tri::False => return self.skipped(node, "not_ready", true),
            Tri::Unknown => {
                let reason = ready.reason.unwrap_or_else(|| "unknown".into());
                return self.skipped(node, &reason, true);
            }
        }

        let owner = format!("{}:{}", node.id, node.skill_id);
        let acquired = match node.lock.policy {
            LockPolicy::SkipAndAdvance | LockPolicy::SkipButHold => self.lock.try_acquire(&owner),
            LockPolicy::Wait => self.lock.acquire_within(
                &owner,
                Duration::from_millis(node.lock.timeout_ms),
                Duration::from_millis(self.settings.poll_ms),
                &self.cancel,
            ),
        };
        let _guard = match acquired {
            Ok(g) => g,
            Err(Contended::Cancelled) => {
                return AttemptOutcome {
                    result: AttemptResult::Stopped,
                    advance: false,
                    delay_ms: 0,
                    attempt_id: None,
                    reason: Some("stopped".into()),
                };
            }
            Err(c) => {
                let advance = node.lock.policy != LockPolicy::SkipButHold;
                return self.skipped(node, c.reason(), advance);
            }
        };

        let id = self.store.begin_attempt(&skill.id, &node.id, self.now());
        let (stage, reason) = self.drive(&id, node, skill);
        self.store.finish(&id, stage, reason.clone(), self.now());
        match stage {
            Stage::Success => tracing::info!("{} -> SUCCESS", id),
            Stage::Stopped => tracing::info!("{} -> STOPPED", id),
            _ => tracing::warn!("{} -> {} ({})", id, stage, reason.as_deref().unwrap_or("-")),
        }

        let (result, advance, delay_ms) = match stage {
            Stage::Success => (AttemptResult::Success, true, node.gap_ms),
            Stage::Stopped => (AttemptResult::Stopped, false, 0),
            _ => (AttemptResult::Failed, true, node.gap_ms),
        };
        AttemptOutcome { result, advance, delay_ms, attempt_id: Some(id), reason }
    }

    /// Cast a skill outside of any track, for `exec_skill` gateways.
    pub fn fire(&self, skill_id: &str) -> AttemptOutcome {
        let observable = self.catalogue.skill(skill_id).is_some_and(|s| s.pixel.is_some());
        let node = SkillNode {
            id: format!("exec:{}", skill_id),
            skill_id: skill_id.to_string(),
            step: 0,
            gap_ms: 0,
            ready: if observable { Expr::skill_ready(skill_id) } else { Expr::Const(true) },
            start: StartSpec { mode: StartMode::None, expr: None, timeout_ms: 0, retries: 0 },
            completion: CompletionSpec { policy: CompletionPolicy::AssumeSuccess, expr: None, factor: 1.0 },
            lock: LockOptions::default(),
        };
        self.run(&node)
    }

    fn dispatch(&self, id: &str, key: &KeyChord) -> Result<(), DispatchError> {
        self.keys.send(key)?;
        self.store.key_sent(id, self.now());
        Ok(())
    }

    fn record_baseline(&self, id: &str, point_id: &str) {
        let Some(point) = self.catalogue.point(point_id) else { return };
        let spec = SampleSpec { radius: point.sample_radius };
        match self.pixels.sample(point.monitor, point.x, point.y, spec) {
            Ok(color) => self.baselines.record(point_id, color),
            Err(u) => {
                self.baselines.clear(point_id);
                self.store.note(id, "BASELINE_UNAVAILABLE", Some(u.to_string()), self.now());
            }
        }
    }

    fn drive(&self, id: &str, node: &SkillNode, skill: &SkillDef) -> (Stage, Option<String>) {
        if self.cancel.is_cancelled() {
            return (Stage::Stopped, Some("stopped".into()));
        }
        let key = match skill.key.as_deref().filter(|k| !k.is_empty()) {
            Some(k) => KeyChord::parse(k).map_err(DispatchError::from),
            None => Err(DispatchError::Unbound),
        };
        let key = match key {
            Ok(k) => k,
            Err(e) => return (Stage::Failed, Some(e.code().into())),
        };

        let bar_points = baseline_points(node, skill);
        for p in &bar_points {
            self.record_baseline(id, p);
        }
        if let Err(e) = self.dispatch(id, &key) {
            tracing::warn!("{}: key `{}` failed: {}", id, key, e);
            return (Stage::Failed, Some(e.code().into()));
        }

        self.store.transition(id, Stage::StartWait, self.now());
        if let Some(expr) = &node.start.expr {
            let mut retries = 0;
            loop {
                match self.poll_until(expr, node.start.timeout_ms) {
                    Poll::Signaled => break,
                    Poll::Cancelled => return (Stage::Stopped, Some("stopped".into())),
                    Poll::TimedOut { .. } => {
                        if retries >= node.start.retries {
                            return (Stage::Failed, Some("start_timeout".into()));
                        }
                        retries += 1;
                        self.store.retry(id, self.now());
                        for p in &bar_points {
                            self.record_baseline(id, p);
                        }
                        if let Err(e) = self.dispatch(id, &key) {
                            return (Stage::Failed, Some(e.code().into()));
                        }
                    }
                }
            }
        }

        self.store.transition(id, Stage::Casting, self.now());
        self.store.transition(id, Stage::CompleteWait, self.now());

        let budget = ((skill.cast_ms as f64) * node.completion.factor).ceil() as u64;
        let budget = budget.max(self.settings.poll_ms);
        match (node.completion.policy, &node.completion.expr) {
            (CompletionPolicy::AssumeSuccess, _) | (_, None) => {
                if self.cancel.wait_ms(skill.cast_ms) {
                    (Stage::Stopped, Some("stopped".into()))
                } else {
                    (Stage::Success, None)
                }
            }
            (policy, Some(expr)) => match self.poll_until(expr, budget) {
                Poll::Signaled => (Stage::Success, None),
                Poll::Cancelled => (Stage::Stopped, Some("stopped".into())),
                Poll::TimedOut { observed } => {
                    let strict = match policy {
                        CompletionPolicy::RequireSignal => true,
                        CompletionPolicy::HybridIfObservable => observed,
                        _ => false,
                    };
                    if strict {
                        (Stage::Failed, Some("completion_timeout".into()))
                    } else {
                        self.store.note(id, "COMPLETION_ASSUMED", None, self.now());
                        (Stage::Success, None)
                    }
                }
            },
        }
    }

    /// Poll `expr` every `poll_ms` until it is true, `budget_ms` passes or
    /// the run is cancelled. `observed` reports whether any poll was known.
    fn poll_until(&self, expr: &Expr, budget_ms: u64) -> Poll {
        let deadline = Instant::now() + Duration::from_millis(budget_ms);
        let poll = Duration::from_millis(self.settings.poll_ms.max(1));
        let mut observed = false;
        loop {
            if self.cancel.is_cancelled() {
                return Poll::Cancelled;
            }
            let ev = self.eval(expr);
            if ev.is_true() {
                return Poll::Signaled;
            }
            observed |= ev.value.is_known();
            let now = Instant::now();
            if now >= deadline {
                return Poll::TimedOut { observed };
            }
            if self.cancel.wait(poll.min(deadline - now)) {
                return Poll::Cancelled;
            }
        }
    }
}

/// Points whose colour must be captured right before the key goes out: the
/// skill's cast bar for cast-bar starts, plus every `CastBarChanged` point
/// of the start and completion signals.
fn baseline_points(node: &SkillNode, skill: &SkillDef) -> Vec<String> {
    let mut points: Vec<String> = Vec::new();
    if node.start.mode == StartMode::CastBar {
        points.extend(skill.cast_bar_point.iter().cloned());
    }
    let exprs = node.start.expr.iter().chain(node.completion.expr.iter());
    for p in exprs.flat_map(Expr::bar_points) {
        if !points.contains(&p) {
            points.push(p);
        }
    }
    points
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalogue::{PixelProbe, PointDef};
    use crate::expr::{BaselineProvider, Metric};
    use crate::store::events::EventBus;
    use crate::store::StoreLimits;
    use crate::test_support::{MapSampler, ScriptedKeys};
    use crate::types::Rgb;

    const GREEN: Rgb = Rgb(0, 200, 0);
    const DARK: Rgb = Rgb(10, 10, 10);

    fn catalogue() -> Arc<Catalogue> {
        let mut fb = SkillDef::new("fb");
        fb.key = Some("1".into());
        fb.cast_ms = 20;
        fb.pixel = Some(PixelProbe { monitor: 0, x: 1, y: 1, color: GREEN, tolerance: 10, sample_radius: 0 });
        fb.cast_bar_point = Some("bar".into());
        let mut nokey = SkillDef::new("nokey");
        nokey.cast_ms = 5;
        let mut ice = SkillDef::new("ice");
        ice.key = Some("2".into());
        ice.cast_ms = 10;
        Arc::new(
            Catalogue::new()
                .with_skill(fb)
                .with_skill(nokey)
                .with_skill(ice)
                .with_point(PointDef {
                    id: "flare".into(),
                    monitor: 0,
                    x: 7,
                    y: 7,
                    color: DARK,
                    tolerance: 10,
                    sample_radius: 0,
                })
                .with_point(PointDef {
                    id: "bar".into(),
                    monitor: 0,
                    x: 5,
                    y: 5,
                    color: DARK,
                    tolerance: 10,
                    sample_radius: 0,
                })
                .with_point(PointDef {
                    id: "done".into(),
                    monitor: 0,
                    x: 9,
                    y: 9,
                    color: GREEN,
                    tolerance: 10,
                    sample_radius: 0,
                }),
        )
    }

    fn node(skill: &str) -> SkillNode {
        SkillNode {
            id: "n1".into(),
            skill_id: skill.into(),
            step: 0,
            gap_ms: 100,
            ready: Expr::skill_ready(skill),
            start: StartSpec { mode: StartMode::None, expr: None, timeout_ms: 40, retries: 0 },
            completion: CompletionSpec { policy: CompletionPolicy::AssumeSuccess, expr: None, factor: 1.5 },
            lock: LockOptions::default(),
        }
    }

    struct Rig {
        exec: AttemptExecutor,
        store: Arc<StateStore>,
        pixels: Arc<MapSampler>,
        keys: Arc<ScriptedKeys>,
        lock: Arc<CastLock>,
    }

    fn rig() -> Rig {
        let store = Arc::new(StateStore::new(StoreLimits::default(), Arc::new(EventBus::new())));
        let pixels = Arc::new(MapSampler::new());
        pixels.set(1, 1, GREEN);
        pixels.set(5, 5, DARK);
        let keys = Arc::new(ScriptedKeys::new());
        let lock = Arc::new(CastLock::new());
        let settings = EngineSettings { poll_ms: 2, ..EngineSettings::default() };
        let exec = AttemptExecutor::new(catalogue(), pixels.clone(), keys.clone(), store.clone())
            .with_lock(lock.clone())
            .with_settings(settings);
        Rig { exec, store, pixels, keys, lock }
    }

    #[test]
    fn not_ready_skips_without_an_attempt() {
        let r = rig();
        r.pixels.set(1, 1, DARK);
        let out = r.exec.run(&node("fb"));
        assert_eq!(out.result, AttemptResult::Skipped);
        assert!(out.advance);
        assert_eq!(out.reason.as_deref(), Some("not_ready"));
        assert_eq!(r.store.count("fb", Metric::AttemptStarted), 0);
        assert!(r.keys.sent().is_empty());
    }

    #[test]
    fn unknown_readiness_reports_its_cause() {
        let r = rig();
        let mut n = node("fb");
        n.ready = Expr::point("ghost");
        let out = r.exec.run(&n);
        assert_eq!(out.reason.as_deref(), Some("point_not_found"));
    }

    #[test]
    fn assume_success_walks_every_stage() {
        let r = rig();
        let rx = r.store.bus().subscribe();
        let out = r.exec.run(&node("fb"));
        assert_eq!(out.result, AttemptResult::Success);
        assert_eq!((out.advance, out.delay_ms), (true, 100));
        assert_eq!(r.keys.sent(), vec!["1".to_string()]);

        let c = r.store.skill("fb").counters;
        assert_eq!((c.attempt_started, c.key_sent_ok, c.cast_started, c.success), (1, 1, 1, 1));

        let stages: Vec<Stage> = rx
            .try_iter()
            .filter_map(|e| match e {
                EngineEvent::AttemptStage { stage, .. } | EngineEvent::AttemptFinished { stage, .. } => Some(stage),
                _ => None,
            })
            .collect();
        assert_eq!(stages, vec![Stage::StartWait, Stage::Casting, Stage::CompleteWait, Stage::Success]);
        assert_eq!(r.lock.holder(), None);
    }

    #[test]
    fn pixel_start_retries_the_key() {
        let r = rig();
        let px = r.pixels.clone();
        // the first press is swallowed, the second one lands
        r.keys.on_send(move |n| {
            if n == 2 {
                px.set(1, 1, DARK);
            }
        });
        let mut n = node("fb");
        n.start = StartSpec { mode: StartMode::Pixel, expr: Some(Expr::not(Expr::skill_ready("fb"))), timeout_ms: 20, retries: 1 };
        let out = r.exec.run(&n);
        assert_eq!(out.result, AttemptResult::Success);
        let attempt = r.store.attempt(out.attempt_id.as_deref().unwrap()).unwrap();
        assert_eq!(attempt.retries, 1);
        assert_eq!(r.store.count("fb", Metric::KeySentOk), 2);
    }

    #[test]
    fn start_timeout_fails_after_retries() {
        let r = rig();
        let mut n = node("fb");
        n.start = StartSpec { mode: StartMode::Pixel, expr: Some(Expr::not(Expr::skill_ready("fb"))), timeout_ms: 10, retries: 0 };
        let out = r.exec.run(&n);
        assert_eq!(out.result, AttemptResult::Failed);
        assert_eq!(out.reason.as_deref(), Some("start_timeout"));
        let c = r.store.skill("fb").counters;
        assert_eq!(c.cast_started, 0);
        assert_eq!(c.fail_reasons.get("start_timeout"), Some(&1));
    }

    #[test]
    fn cast_bar_start_compares_against_the_pre_press_colour() {
        let r = rig();
        let px = r.pixels.clone();
        r.keys.on_send(move |_| px.set(5, 5, Rgb(200, 150, 0)));
        let mut n = node("fb");
        n.start = StartSpec { mode: StartMode::CastBar, expr: Some(Expr::bar_changed("bar")), timeout_ms: 30, retries: 0 };
        let out = r.exec.run(&n);
        assert_eq!(out.result, AttemptResult::Success);
        assert_eq!(r.exec.baselines().get_baseline("bar").unwrap(), DARK);
    }

    #[test]
    fn cast_bar_atoms_get_a_baseline_without_a_skill_bar_point() {
        let r = rig();
        r.pixels.set(7, 7, DARK);
        let px = r.pixels.clone();
        r.keys.on_send(move |_| px.set(7, 7, Rgb(200, 150, 0)));
        let mut n = node("ice");
        n.ready = Expr::Const(true);
        n.start = StartSpec { mode: StartMode::CastBar, expr: Some(Expr::bar_changed("flare")), timeout_ms: 30, retries: 0 };
        let out = r.exec.run(&n);
        assert_eq!(out.result, AttemptResult::Success, "{:?}", out.reason);
        assert_eq!(r.exec.baselines().get_baseline("flare").unwrap(), DARK);
        assert!(r.exec.baselines().get_baseline("bar").is_err());
    }

    #[test]
    fn completion_bar_points_are_baselined_too() {
        let r = rig();
        r.pixels.set(7, 7, DARK);
        let mut n = node("ice");
        n.ready = Expr::Const(true);
        n.completion = CompletionSpec {
            policy: CompletionPolicy::RequireSignal,
            expr: Some(Expr::not(Expr::bar_changed("flare"))),
            factor: 1.0,
        };
        assert_eq!(r.exec.run(&n).result, AttemptResult::Success);
        assert_eq!(r.exec.baselines().get_baseline("flare").unwrap(), DARK);
    }

    #[test]
    fn require_signal_fails_but_hybrid_assumes() {
        let r = rig();
        let mut n = node("fb");
        n.completion = CompletionSpec { policy: CompletionPolicy::RequireSignal, expr: Some(Expr::point("done")), factor: 1.0 };
        r.pixels.set(9, 9, DARK);
        assert_eq!(r.exec.run(&n).reason.as_deref(), Some("completion_timeout"));

        n.completion.policy = CompletionPolicy::Hybrid;
        assert_eq!(r.exec.run(&n).result, AttemptResult::Success);

        // never observable: hybrid_if_observable falls back to success
        n.completion = CompletionSpec { policy: CompletionPolicy::HybridIfObservable, expr: Some(Expr::point("ghost")), factor: 1.0 };
        assert_eq!(r.exec.run(&n).result, AttemptResult::Success);
        // observable but never signalled: strict
        n.completion.expr = Some(Expr::point("done"));
        assert_eq!(r.exec.run(&n).reason.as_deref(), Some("completion_timeout"));

        r.pixels.set(9, 9, GREEN);
        n.completion.policy = CompletionPolicy::RequireSignal;
        assert_eq!(r.exec.run(&n).result, AttemptResult::Success);
    }

    #[test]
    fn lock_contention_follows_policy() {
        let r = rig();
        let _held = r.lock.try_acquire("someone").unwrap();
        let mut n = node("fb");
        let out = r.exec.run(&n);
        assert_eq!((out.result, out.advance), (AttemptResult::Skipped, true));
        assert_eq!(out.reason.as_deref(), Some("lock_busy"));

        n.lock.policy = LockPolicy::SkipButHold;
        assert!(!r.exec.run(&n).advance);

        n.lock = LockOptions { policy: LockPolicy::Wait, timeout_ms: 10 };
        let out = r.exec.run(&n);
        assert_eq!(out.reason.as_deref(), Some("lock_timeout"));
        assert!(out.advance);
        assert!(r.keys.sent().is_empty());
    }

    #[test]
    fn dispatch_failures_terminate_the_attempt() {
        let r = rig();
        r.keys.fail(true);
        let out = r.exec.run(&node("fb"));
        assert_eq!(out.result, AttemptResult::Failed);
        assert_eq!(out.reason.as_deref(), Some("dispatch_failed"));

        let mut n = node("nokey");
        n.ready = Expr::Const(true);
        assert_eq!(r.exec.run(&n).reason.as_deref(), Some("key_unresolved"));
        assert_eq!(r.store.count("nokey", Metric::Fail), 1);
    }

    #[test]
    fn cancel_stops_a_long_cast() {
        let r = rig();
        let cancel = CancelToken::new();
        let exec = AttemptExecutor::new(catalogue(), r.pixels.clone(), r.keys.clone(), r.store.clone())
            .with_cancel(cancel.clone());
        let mut n = node("fb");
        n.ready = Expr::Const(true);
        let c2 = cancel.clone();
        let h = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(5));
            c2.cancel();
        });
        let mut slow = (*catalogue()).clone();
        if let Some(s) = slow.skill("fb").cloned() {
            slow.insert_skill(SkillDef { cast_ms: 10_000, ..s });
        }
        let exec = AttemptExecutor { catalogue: Arc::new(slow), ..exec };
        let started = Instant::now();
        let out = exec.run(&n);
        h.join().unwrap();
        assert_eq!(out.result, AttemptResult::Stopped);
        assert!(!out.advance);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(r.store.attempt(out.attempt_id.as_deref().unwrap()).unwrap().stage, Stage::Stopped);
    }

    #[test]
    fn fire_runs_a_bare_skill() {
        let r = rig();
        let out = r.exec.fire("fb");
        assert_eq!(out.result, AttemptResult::Success);
        assert_eq!(r.store.attempt(out.attempt_id.as_deref().unwrap()).unwrap().node_id, "exec:fb");
    }
}

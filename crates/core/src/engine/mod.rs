//! Engine control handle. One run at a time; each run owns a fresh state
//! store, capture manager and scheduler on its own thread. The event bus
//! and the cast lock live as long as the engine.

pub mod gateway;
mod runner;

use std::fmt;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use crate::capture::{CaptureManager, CaptureStatus, LiveSampler};
use crate::catalogue::Catalogue;
use crate::error::EngineError;
use crate::executor::{AttemptExecutor, CastLock};
use crate::platform::{KeySender, Platform, ScreenSource};
use crate::preset::{validate_preset, PresetDoc, ValidationReport};
use crate::runtime::Scheduler;
use crate::settings::Settings;
use crate::sleep::{CancelToken, RunClock};
use crate::store::events::{EngineEvent, EventBus};
use crate::store::{AttemptState, SkillSnapshot, StateStore, StoreLimits};

use runner::Runner;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCommand {
    Pause,
    Resume,
    /// Pause (if running) and let exactly one more node execute.
    Step,
    Stop(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RunState {
    #[default]
    Idle,
    Running,
    Paused,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RunState::Idle => "IDLE",
            RunState::Running => "RUNNING",
            RunState::Paused => "PAUSED",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    Requested(String),
    /// An `end` gateway fired.
    Ended { node_id: String },
    Fault(String),
    /// The control handle went away.
    Disconnected,
}

impl StopReason {
    pub fn code(&self) -> &'static str {
        match self {
            StopReason::Requested(_) => "stopped",
            StopReason::Ended { .. } => "ended",
            StopReason::Fault(_) => "fault",
            StopReason::Disconnected => "disconnected",
        }
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Requested(r) => write!(f, "stopped ({})", r),
            StopReason::Ended { node_id } => write!(f, "ended by gateway `{}`", node_id),
            StopReason::Fault(msg) => write!(f, "fault: {}", msg),
            StopReason::Disconnected => f.write_str("control handle dropped"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineStatus {
    pub state: RunState,
    pub preset_id: Option<String>,
    pub mode_id: Option<String>,
    pub step: Option<i32>,
    pub nodes_executed: u64,
    pub last_stop: Option<StopReason>,
    pub last_error: Option<String>,
    /// Local wall-clock time the current (or last) run started.
    pub started_at: Option<String>,
    pub capture: Option<CaptureStatus>,
}

struct ActiveRun {
    tx: Sender<EngineCommand>,
    cancel: CancelToken,
    store: Arc<StateStore>,
    capture: Arc<CaptureManager>,
    handle: Option<JoinHandle<()>>,
}

pub struct Engine {
    catalogue: Arc<Catalogue>,
    screen: Arc<dyn ScreenSource>,
    keys: Arc<dyn KeySender>,
    settings: Settings,
    bus: Arc<EventBus>,
    lock: Arc<CastLock>,
    status: Arc<Mutex<EngineStatus>>,
    run: Mutex<Option<ActiveRun>>,
}

impl Engine {
    pub fn new(
        catalogue: Arc<Catalogue>,
        screen: Arc<dyn ScreenSource>,
        keys: Arc<dyn KeySender>,
        settings: Settings,
    ) -> Self {
        Self {
            catalogue,
            screen,
            keys,
            settings,
            bus: Arc::new(EventBus::new()),
            lock: Arc::new(CastLock::new()),
            status: Arc::new(Mutex::new(EngineStatus::default())),
            run: Mutex::new(None),
        }
    }

    pub fn from_platform(catalogue: Arc<Catalogue>, platform: &dyn Platform, settings: Settings) -> Self {
        Self::new(catalogue, platform.screen(), platform.keys(), settings)
    }

    fn active(&self) -> MutexGuard<'_, Option<ActiveRun>> {
        self.run.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn status_lock(&self) -> MutexGuard<'_, EngineStatus> {
        self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn catalogue(&self) -> &Arc<Catalogue> {
        &self.catalogue
    }

    /// Full validation without starting anything.
    pub fn validate(&self, doc: &PresetDoc) -> ValidationReport {
        validate_preset(doc, &self.catalogue)
    }

    /// Validate `doc` and, if it has no errors, start running it on a new
    /// engine thread.
    pub fn start(&self, doc: &PresetDoc) -> Result<ValidationReport, EngineError> {
        let mut active = self.active();
        {
            let st = self.status_lock();
            if st.state != RunState::Idle {
                return Err(EngineError::AlreadyRunning(st.preset_id.clone().unwrap_or_default()));
            }
        }
        if let Some(handle) = active.as_mut().and_then(|r| r.handle.take()) {
            let _ = handle.join();
        }

        let report = self.validate(doc);
        let Some(preset) = report.preset.clone() else {
            for d in report.diagnostics.errors() {
                tracing::warn!("{}", d);
            }
            return Err(EngineError::Invalid(report.diagnostics));
        };
        let preset = Arc::new(preset);

        let store = Arc::new(StateStore::new(StoreLimits::from(&self.settings.engine), self.bus.clone()));
        let capture = Arc::new(
            CaptureManager::new(self.screen.clone(), self.catalogue.clone(), self.settings.capture.clone())
                .with_events(self.bus.clone()),
        );

        let clock = RunClock::start();
        let cancel = CancelToken::new();
        let exec = AttemptExecutor::new(
            self.catalogue.clone(),
            Arc::new(LiveSampler::new(capture.clone())),
            self.keys.clone(),
            store.clone(),
        )
        .with_lock(self.lock.clone())
        .with_cancel(cancel.clone())
        .with_clock(clock)
        .with_settings(self.settings.engine.clone());

        let (tx, rx) = mpsc::channel();
        let runner = Runner {
            sched: Scheduler::new(&preset, 0),
            preset: preset.clone(),
            catalogue: self.catalogue.clone(),
            exec,
            capture: capture.clone(),
            store: store.clone(),
            clock,
            cancel: cancel.clone(),
            rx,
            status: self.status.clone(),
            settings: self.settings.engine.clone(),
            paused: false,
            steps: 0,
        };

        {
            let mut st = self.status_lock();
            *st = EngineStatus {
                state: RunState::Running,
                preset_id: Some(preset.id.clone()),
                mode_id: preset.entry_mode.and_then(|m| preset.modes.get(m)).map(|m| m.id.clone()),
                started_at: Some(chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string()),
                ..EngineStatus::default()
            };
        }
        store.publish(EngineEvent::EngineStarted { preset_id: preset.id.clone(), at_ms: 0 });
        capture.update_probes(&preset.probes(&self.catalogue, preset.entry_mode));

        let handle = match thread::Builder::new()
            .name("cadence-engine".into())
            .spawn(move || runner.run_guarded())
        {
            Ok(h) => h,
            Err(e) => {
                self.status_lock().state = RunState::Idle;
                return Err(EngineError::Spawn(e));
            }
        };
        tracing::info!("started preset `{}` ({} nodes)", preset.id, preset.node_count());

        *active = Some(ActiveRun { tx, cancel, store, capture, handle: Some(handle) });
        Ok(report)
    }

    fn send(&self, cmd: EngineCommand) -> Result<(), EngineError> {
        if !self.is_running() {
            return Err(EngineError::NotRunning);
        }
        let active = self.active();
        let run = active.as_ref().ok_or(EngineError::NotRunning)?;
        run.tx.send(cmd).map_err(|_| EngineError::NotRunning)
    }

    /// Stop the run and wait for the engine thread. An in-flight attempt is
    /// cancelled and closed as `STOPPED`.
    pub fn stop(&self, reason: &str) -> Result<(), EngineError> {
        let handle = {
            let mut active = self.active();
            let Some(run) = active.as_mut() else {
                return Err(EngineError::NotRunning);
            };
            let _ = run.tx.send(EngineCommand::Stop(reason.to_string()));
            run.cancel.cancel();
            run.handle.take()
        };
        match handle {
            Some(h) => {
                if h.join().is_err() {
                    return Err(EngineError::Internal("engine thread panicked".into()));
                }
                Ok(())
            }
            None => Err(EngineError::NotRunning),
        }
    }

    pub fn pause(&self) -> Result<(), EngineError> {
        self.send(EngineCommand::Pause)
    }

    pub fn resume(&self) -> Result<(), EngineError> {
        self.send(EngineCommand::Resume)
    }

    pub fn step(&self) -> Result<(), EngineError> {
        self.send(EngineCommand::Step)
    }

    /// Hotkey helper: pause a running engine, resume a paused one.
    pub fn toggle_pause(&self) -> Result<RunState, EngineError> {
        let state = self.status_lock().state;
        match state {
            RunState::Idle => return Err(EngineError::NotRunning),
            RunState::Running => {}
            RunState::Paused => {
                self.resume()?;
                return Ok(RunState::Running);
            }
        }
        self.pause()?;
        Ok(RunState::Paused)
    }

    /// Wait for the current run to end on its own.
    pub fn join(&self) {
        let handle = self.active().as_mut().and_then(|r| r.handle.take());
        if let Some(h) = handle {
            let _ = h.join();
        }
    }

    pub fn status(&self) -> EngineStatus {
        let mut st = self.status_lock().clone();
        st.capture = self.active().as_ref().map(|r| r.capture.status());
        st
    }

    pub fn is_running(&self) -> bool {
        self.status_lock().state != RunState::Idle
    }

    /// Counters and recent attempts of the current (or last) run.
    pub fn skill(&self, skill_id: &str) -> Option<SkillSnapshot> {
        self.active().as_ref().map(|r| r.store.skill(skill_id))
    }

    pub fn skills(&self) -> Vec<SkillSnapshot> {
        self.active().as_ref().map(|r| r.store.skills()).unwrap_or_default()
    }

    pub fn attempt(&self, attempt_id: &str) -> Option<AttemptState> {
        self.active().as_ref().and_then(|r| r.store.attempt(attempt_id))
    }

    pub fn subscribe(&self) -> Receiver<EngineEvent> {
        self.bus.subscribe()
    }

    pub fn on<F>(&self, callback: F) -> u64
    where
        F: Fn(&EngineEvent) + Send + Sync + 'static,
    {
        self.bus.on(callback)
    }

    pub fn unsubscribe(&self, id: u64) {
        self.bus.unsubscribe(id);
    }

    pub fn cast_lock(&self) -> &Arc<CastLock> {
        &self.lock
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if self.is_running() {
            let _ = self.stop("engine dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalogue::{PixelProbe, SkillDef};
    use crate::expr::Metric;
    use crate::store::Stage;
    use crate::test_support::{ScriptedKeys, ScriptedScreen};
    use crate::types::Rgb;
    use serde_json::json;
    use std::time::{Duration, Instant};

    const GREEN: Rgb = Rgb(0, 200, 0);

    fn skill(id: &str, key: &str, x: i32) -> SkillDef {
        let mut s = SkillDef::new(id);
        s.key = Some(key.into());
        s.cast_ms = 5;
        s.pixel = Some(PixelProbe { monitor: 0, x, y: 10, color: GREEN, tolerance: 10, sample_radius: 0 });
        s
    }

    fn engine() -> (Engine, Arc<ScriptedKeys>) {
        let catalogue = Catalogue::new().with_skill(skill("a", "1", 10)).with_skill(skill("b", "2", 20));
        let screen = Arc::new(ScriptedScreen::new(100, 100, GREEN));
        let keys = Arc::new(ScriptedKeys::new());
        let mut settings = Settings::default();
        settings.engine.poll_ms = 2;
        settings.engine.idle_wait_ms = 20;
        settings.capture.ttl_ms = 0;
        let engine = Engine::new(Arc::new(catalogue), screen, keys.clone(), settings);
        (engine, keys)
    }

    fn doc(v: serde_json::Value) -> PresetDoc {
        serde_json::from_value(v).unwrap()
    }

    fn rotation() -> PresetDoc {
        doc(json!({
            "id": "rot",
            "global_tracks": [{ "id": "g", "nodes": [
                { "kind": "skill", "id": "n1", "skill_id": "a", "gap_ms": 5 },
                { "kind": "skill", "id": "n2", "skill_id": "b", "gap_ms": 5 }
            ]}]
        }))
    }

    fn wait_for(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn start_runs_until_stopped() {
        let (engine, keys) = engine();
        let rx = engine.subscribe();
        engine.start(&rotation()).unwrap();
        wait_for(|| keys.sent().len() >= 3);
        engine.stop("user").unwrap();

        let st = engine.status();
        assert_eq!(st.state, RunState::Idle);
        assert_eq!(st.last_stop, Some(StopReason::Requested("user".into())));
        assert!(st.nodes_executed >= 2);
        assert_eq!(&keys.sent()[..2], ["1", "2"]);

        let events: Vec<EngineEvent> = rx.try_iter().collect();
        assert!(matches!(events.first(), Some(EngineEvent::EngineStarted { .. })));
        assert!(matches!(events.get(1), Some(EngineEvent::CapturePlanChanged { .. })));
        assert!(matches!(events.last(), Some(EngineEvent::EngineStopped { .. })));
        assert!(engine.stop("again").is_err());
    }

    #[test]
    fn second_start_is_rejected() {
        let (engine, _) = engine();
        engine.start(&rotation()).unwrap();
        assert!(matches!(engine.start(&rotation()), Err(EngineError::AlreadyRunning(id)) if id == "rot"));
        engine.stop("done").unwrap();
        // idle again: a new run is allowed
        engine.start(&rotation()).unwrap();
        engine.stop("done").unwrap();
    }

    #[test]
    fn invalid_preset_blocks_start() {
        let (engine, keys) = engine();
        let bad = doc(json!({
            "id": "bad",
            "global_tracks": [{ "id": "g", "nodes": [
                { "kind": "skill", "id": "n1", "skill_id": "ghost" }
            ]}]
        }));
        match engine.start(&bad) {
            Err(EngineError::Invalid(d)) => assert!(d.has_errors()),
            other => panic!("unexpected {:?}", other.map(|r| r.diagnostics)),
        }
        assert!(!engine.is_running());
        assert!(keys.sent().is_empty());
    }

    #[test]
    fn pause_halts_dispatch_and_step_runs_one_node() {
        let (engine, keys) = engine();
        engine.start(&rotation()).unwrap();
        wait_for(|| !keys.sent().is_empty());
        engine.pause().unwrap();
        wait_for(|| engine.status().state == RunState::Paused);
        thread::sleep(Duration::from_millis(40));
        let frozen = keys.sent().len();
        thread::sleep(Duration::from_millis(60));
        assert_eq!(keys.sent().len(), frozen);

        engine.step().unwrap();
        wait_for(|| keys.sent().len() == frozen + 1);
        thread::sleep(Duration::from_millis(60));
        assert_eq!(keys.sent().len(), frozen + 1);
        assert_eq!(engine.status().state, RunState::Paused);

        assert_eq!(engine.toggle_pause().unwrap(), RunState::Running);
        wait_for(|| keys.sent().len() > frozen + 2);
        engine.stop("done").unwrap();
    }

    #[test]
    fn end_gateway_stops_after_metric_threshold() {
        let (engine, keys) = engine();
        let preset = doc(json!({
            "id": "twice",
            "global_tracks": [{ "id": "g", "nodes": [
                { "kind": "skill", "id": "n1", "skill_id": "a", "gap_ms": 1 },
                { "kind": "gateway", "id": "gw", "gap_ms": 1,
                  "condition": { "type": "skill_metric_ge", "skill_id": "a", "metric": "success", "count": 2 },
                  "action": { "type": "end" } }
            ]}]
        }));
        engine.start(&preset).unwrap();
        engine.join();

        let st = engine.status();
        assert_eq!(st.state, RunState::Idle);
        assert_eq!(st.last_stop, Some(StopReason::Ended { node_id: "gw".into() }));
        assert_eq!(keys.sent().len(), 2);
        let a = engine.skill("a").unwrap();
        assert_eq!(a.counters.metric(Metric::Success), 2);
    }

    #[test]
    fn panic_in_the_loop_becomes_a_fault() {
        let (engine, keys) = engine();
        keys.on_send(|_| panic!("driver exploded"));
        engine.start(&rotation()).unwrap();
        engine.join();

        let st = engine.status();
        assert_eq!(st.state, RunState::Idle);
        assert!(matches!(&st.last_stop, Some(StopReason::Fault(m)) if m.contains("driver exploded")));
        assert!(st.last_error.is_some());
        assert_eq!(engine.cast_lock().holder(), None);

        let a = engine.skill("a").unwrap();
        assert_eq!(a.counters.in_flight, None);
        assert_eq!(a.recent.last().map(|r| r.stage), Some(Stage::Stopped));
    }

    #[test]
    fn controls_need_a_run() {
        let (engine, _) = engine();
        assert!(matches!(engine.pause(), Err(EngineError::NotRunning)));
        assert!(matches!(engine.step(), Err(EngineError::NotRunning)));
        assert!(engine.skill("a").is_none());
    }
}

//! The engine thread: drains commands between nodes, picks the next due
//! node and runs it.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc::{Receiver, RecvTimeoutError, TryRecvError};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::capture::CaptureManager;
use crate::catalogue::Catalogue;
use crate::error::EngineError;
use crate::executor::{AttemptExecutor, AttemptResult};
use crate::preset::{GatewayNode, Node, Preset, TrackLoc};
use crate::runtime::{Candidate, Scheduler};
use crate::settings::EngineSettings;
use crate::sleep::{CancelToken, RunClock};
use crate::store::events::EngineEvent;
use crate::store::StateStore;
use crate::types::Millis;

use super::gateway::{self, GatewayEffect};
use super::{EngineCommand, EngineStatus, RunState, StopReason};

pub(super) struct Runner {
    pub preset: Arc<Preset>,
    pub catalogue: Arc<Catalogue>,
    pub sched: Scheduler,
    pub exec: AttemptExecutor,
    pub capture: Arc<CaptureManager>,
    pub store: Arc<StateStore>,
    pub clock: RunClock,
    pub cancel: CancelToken,
    pub rx: Receiver<EngineCommand>,
    pub status: Arc<Mutex<EngineStatus>>,
    pub settings: EngineSettings,
    pub paused: bool,
    /// Nodes still allowed to run while paused.
    pub steps: u32,
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    }
}

impl Runner {
    fn status(&self) -> std::sync::MutexGuard<'_, EngineStatus> {
        self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Thread body. Whatever ends the loop, live attempts are closed, the
    /// status goes back to idle and `engine_stopped` is published.
    pub fn run_guarded(mut self) {
        let result = catch_unwind(AssertUnwindSafe(|| self.run()));
        let reason = match result {
            Ok(Ok(reason)) => reason,
            Ok(Err(e)) => StopReason::Fault(e.to_string()),
            Err(payload) => StopReason::Fault(panic_message(payload.as_ref())),
        };
        match &reason {
            StopReason::Fault(msg) => tracing::error!("engine fault: {}", msg),
            other => tracing::info!("engine stopped: {}", other),
        }

        let now = self.clock.now_ms();
        self.store.stop_all(reason.code(), now);
        {
            let mut st = self.status();
            st.state = RunState::Idle;
            if let StopReason::Fault(msg) = &reason {
                st.last_error = Some(msg.clone());
            }
            st.last_stop = Some(reason.clone());
        }
        self.store.publish(EngineEvent::EngineStopped { reason: reason.to_string(), at_ms: now });
    }

    fn run(&mut self) -> Result<StopReason, EngineError> {
        let idle = self.settings.idle_wait_ms.max(1);
        loop {
            if let Some(reason) = self.drain() {
                return Ok(reason);
            }
            if self.cancel.is_cancelled() {
                return Ok(StopReason::Requested("cancelled".into()));
            }

            if self.paused && self.steps == 0 {
                if let Some(reason) = self.wait_command(idle) {
                    return Ok(reason);
                }
                continue;
            }

            let now = self.clock.now_ms();
            match self.sched.pick(now) {
                Some(candidate) => {
                    if self.paused {
                        self.steps -= 1;
                    }
                    if let Some(reason) = self.execute(candidate)? {
                        return Ok(reason);
                    }
                    self.sync_status();
                }
                None => {
                    let wait = self
                        .sched
                        .next_wakeup()
                        .map(|due| due.saturating_sub(now))
                        .unwrap_or(idle)
                        .clamp(1, idle);
                    if let Some(reason) = self.wait_command(wait) {
                        return Ok(reason);
                    }
                }
            }
        }
    }

    fn drain(&mut self) -> Option<StopReason> {
        loop {
            match self.rx.try_recv() {
                Ok(cmd) => {
                    if let Some(reason) = self.apply(cmd) {
                        return Some(reason);
                    }
                }
                Err(TryRecvError::Empty) => return None,
                Err(TryRecvError::Disconnected) => return Some(StopReason::Disconnected),
            }
        }
    }

    fn wait_command(&mut self, ms: Millis) -> Option<StopReason> {
        match self.rx.recv_timeout(Duration::from_millis(ms)) {
            Ok(cmd) => self.apply(cmd),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(StopReason::Disconnected),
        }
    }

    fn set_paused(&mut self, paused: bool) {
        if self.paused == paused {
            return;
        }
        self.paused = paused;
        let at_ms = self.clock.now_ms();
        if paused {
            tracing::info!("paused");
            self.store.publish(EngineEvent::EnginePaused { at_ms });
        } else {
            tracing::info!("resumed");
            self.store.publish(EngineEvent::EngineResumed { at_ms });
        }
        self.status().state = if paused { RunState::Paused } else { RunState::Running };
    }

    fn apply(&mut self, cmd: EngineCommand) -> Option<StopReason> {
        match cmd {
            EngineCommand::Pause => {
                self.steps = 0;
                self.set_paused(true);
            }
            EngineCommand::Resume => {
                self.steps = 0;
                self.set_paused(false);
            }
            EngineCommand::Step => {
                self.set_paused(true);
                self.steps += 1;
            }
            EngineCommand::Stop(reason) => return Some(StopReason::Requested(reason)),
        }
        None
    }

    fn sync_status(&self) {
        let mode = self.sched.mode_id().map(str::to_string);
        let step = self.sched.current_step();
        let mut st = self.status();
        st.mode_id = mode;
        st.step = step;
        st.nodes_executed += 1;
    }

    fn advance(&mut self, loc: TrackLoc, next_at: Millis) {
        if let Some(mode_id) = self.sched.advance(loc, next_at) {
            self.looped(mode_id);
        }
    }

    fn looped(&self, mode_id: String) {
        tracing::debug!(mode = %mode_id, "mode exhausted, looping");
        self.store.publish(EngineEvent::ModeLooped { mode_id, at_ms: self.clock.now_ms() });
    }

    fn execute(&mut self, candidate: Candidate) -> Result<Option<StopReason>, EngineError> {
        let preset = Arc::clone(&self.preset);
        let node = preset
            .track(candidate.loc)
            .and_then(|t| t.nodes.get(candidate.node))
            .ok_or_else(|| EngineError::Internal(format!("cursor {:?}/{} out of range", candidate.loc, candidate.node)))?;

        match node {
            Node::Skill(skill) => {
                let out = self.exec.run(skill);
                if out.result == AttemptResult::Stopped {
                    return Ok(None);
                }
                let next_at = self.clock.now_ms() + out.delay_ms;
                if out.advance {
                    self.advance(candidate.loc, next_at);
                } else {
                    self.sched.hold(candidate.loc, next_at);
                }
                Ok(None)
            }
            Node::Gateway(gw) => self.gateway(&preset, &candidate, gw),
        }
    }

    fn gateway(
        &mut self,
        preset: &Preset,
        candidate: &Candidate,
        gw: &GatewayNode,
    ) -> Result<Option<StopReason>, EngineError> {
        let ev = self.exec.eval(&gw.condition);
        let now = self.clock.now_ms();
        let delay = gw.gap_ms.unwrap_or(self.settings.gateway_delay_ms);
        let fired = ev.is_true();
        self.store.publish(EngineEvent::Gateway {
            node_id: gw.id.clone(),
            track_id: candidate.track_id.clone(),
            action: gw.action.name().to_string(),
            fired,
            reason: ev.reason.clone(),
            at_ms: now,
        });
        if !fired {
            tracing::trace!(node = %gw.id, "gateway held: {}", ev.value);
            self.advance(candidate.loc, now + delay);
            return Ok(None);
        }

        tracing::info!(node = %gw.id, track = %candidate.track_id, "gateway fired: {}", gw.action.name());
        if gw.reset_metrics {
            for (skill_id, metric) in gw.condition.metric_atoms() {
                self.store.reset_metric(&skill_id, metric, now);
            }
        }

        let dispatched = gateway::dispatch(&mut self.sched, preset, candidate.loc, gw, now, delay)?;
        if let Some(mode_id) = dispatched.looped {
            self.looped(mode_id);
        }
        match dispatched.effect {
            GatewayEffect::Ended => return Ok(Some(StopReason::Ended { node_id: gw.id.clone() })),
            GatewayEffect::ModeSwitched { from, to } => {
                let probes = preset.probes(&self.catalogue, self.sched.active_mode());
                self.capture.update_probes(&probes);
                self.store.publish(EngineEvent::ModeSwitched { from, to, at_ms: now });
            }
            GatewayEffect::Jumped { target, node } => {
                tracing::debug!(node = %gw.id, "cursor of {:?} moved to node {}", target, node);
            }
            GatewayEffect::ExecSkill(skill_id) => {
                let out = self.exec.fire(&skill_id);
                if out.result != AttemptResult::Stopped {
                    let next_at = self.clock.now_ms() + delay;
                    self.advance(candidate.loc, next_at);
                }
            }
        }
        Ok(None)
    }
}

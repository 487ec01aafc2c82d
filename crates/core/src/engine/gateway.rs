//! Scheduler effects of a fired gateway, shared by the live engine and the
//! simulator. Side effects that need capabilities (running a skill,
//! resetting metrics) stay with the caller.

use crate::error::EngineError;
use crate::preset::{GatewayAction, GatewayNode, Preset, TrackLoc};
use crate::runtime::Scheduler;
use crate::types::Millis;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayEffect {
    /// Stop the run.
    Ended,
    ModeSwitched { from: Option<String>, to: String },
    Jumped { target: TrackLoc, node: usize },
    /// The caller runs the skill, then advances the gateway's own track.
    ExecSkill(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatched {
    pub effect: GatewayEffect,
    /// Mode that looped because the gateway's own advance exhausted it.
    pub looped: Option<String>,
}

fn node_index(preset: &Preset, loc: TrackLoc, node_id: Option<&str>) -> Result<usize, EngineError> {
    let track = preset
        .track(loc)
        .ok_or_else(|| EngineError::Internal(format!("track {:?} not in preset", loc)))?;
    match node_id {
        None => Ok(0),
        Some(id) => track
            .position_of(id)
            .ok_or_else(|| EngineError::Internal(format!("node `{}` not in track `{}`", id, track.id))),
    }
}

/// When a jump lands back on the gateway itself it waits out the gateway's
/// gap, otherwise the same gateway would fire again on the same tick.
fn landing(preset: &Preset, target: TrackLoc, idx: usize, gateway: &GatewayNode, now: Millis, delay: Millis) -> Millis {
    let own = preset.track(target).and_then(|t| t.position_of(&gateway.id));
    if own == Some(idx) {
        now + delay
    } else {
        now
    }
}

/// Apply a fired gateway at `loc` to the scheduler. `delay` is how long the
/// gateway's own track waits before its next node.
pub fn dispatch(
    sched: &mut Scheduler,
    preset: &Preset,
    loc: TrackLoc,
    gateway: &GatewayNode,
    now: Millis,
    delay: Millis,
) -> Result<Dispatched, EngineError> {
    let mut looped = None;
    let effect = match &gateway.action {
        GatewayAction::End => GatewayEffect::Ended,

        GatewayAction::SwitchMode { mode_id, track_id, node_id } => {
            let mode = preset
                .mode_index(mode_id)
                .ok_or_else(|| EngineError::Internal(format!("mode `{}` not in preset", mode_id)))?;
            let from = sched.mode_id().map(str::to_string);
            if matches!(loc, TrackLoc::Global(_)) {
                looped = sched.advance(loc, now + delay);
            }
            sched.switch_mode(preset, mode, now);
            if let Some(t) = track_id {
                let target = preset
                    .locate_track(t)
                    .filter(|l| matches!(l, TrackLoc::Mode(m, _) if *m == mode))
                    .ok_or_else(|| EngineError::Internal(format!("track `{}` not in mode `{}`", t, mode_id)))?;
                let idx = node_index(preset, target, node_id.as_deref())?;
                sched.relocate(target, idx, now);
            }
            GatewayEffect::ModeSwitched { from, to: mode_id.clone() }
        }

        GatewayAction::JumpNode { node_id } => {
            let idx = node_index(preset, loc, Some(node_id))?;
            sched.relocate(loc, idx, landing(preset, loc, idx, gateway, now, delay));
            GatewayEffect::Jumped { target: loc, node: idx }
        }

        GatewayAction::JumpTrack { track_id, node_id } => {
            let target = preset
                .locate_track(track_id)
                .ok_or_else(|| EngineError::Internal(format!("track `{}` not in preset", track_id)))?;
            if !sched.is_active(target) {
                return Err(EngineError::Internal(format!("track `{}` is not active", track_id)));
            }
            let idx = node_index(preset, target, node_id.as_deref())?;
            if target != loc {
                looped = sched.advance(loc, now + delay);
            }
            sched.relocate(target, idx, landing(preset, target, idx, gateway, now, delay));
            GatewayEffect::Jumped { target, node: idx }
        }

        GatewayAction::ExecSkill { skill_id } => GatewayEffect::ExecSkill(skill_id.clone()),
    };
    Ok(Dispatched { effect, looped })
}

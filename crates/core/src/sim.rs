//! Offline dry run of a preset.
//!
//! The simulator drives the same [`Scheduler`] and gateway dispatch as the
//! live engine, on a virtual clock. Skills always succeed and take exactly
//! their cast time; cooldowns are tracked per skill. Pixel atoms have no
//! source and evaluate to unknown, metric atoms read a real [`StateStore`].

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::catalogue::Catalogue;
use crate::engine::gateway::{self, GatewayEffect};
use crate::error::EngineError;
use crate::expr::{Evaluator, NullSampler};
use crate::preset::{GatewayNode, Node, Preset, SkillNode};
use crate::runtime::{Candidate, Scheduler};
use crate::settings::Settings;
use crate::store::events::EventBus;
use crate::store::{SkillAggregate, Stage, StateStore, StoreLimits};
use crate::types::Millis;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SimOutcome {
    Cast,
    SkippedCd,
    SkippedDisabled,
    GwPass,
    GwEnd,
    GwSwitchMode,
    GwJumpNode,
    GwJumpTrack,
    GwExecSkill,
    ModeLoop,
}

impl SimOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            SimOutcome::Cast => "CAST",
            SimOutcome::SkippedCd => "SKIPPED_CD",
            SimOutcome::SkippedDisabled => "SKIPPED_DISABLED",
            SimOutcome::GwPass => "GW_PASS",
            SimOutcome::GwEnd => "GW_END",
            SimOutcome::GwSwitchMode => "GW_SWITCH_MODE",
            SimOutcome::GwJumpNode => "GW_JUMP_NODE",
            SimOutcome::GwJumpTrack => "GW_JUMP_TRACK",
            SimOutcome::GwExecSkill => "GW_EXEC_SKILL",
            SimOutcome::ModeLoop => "MODE_LOOP",
        }
    }
}

impl fmt::Display for SimOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SimEvent {
    pub index: usize,
    pub at_ms: Millis,
    pub track_id: String,
    pub node_id: String,
    pub skill_id: Option<String>,
    pub outcome: SimOutcome,
    pub reason: Option<String>,
}

impl fmt::Display for SimEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:<4} {:>8}ms  {:<16} {:<12} {:<16}", self.index, self.at_ms, self.outcome, self.track_id, self.node_id)?;
        if let Some(s) = &self.skill_id {
            write!(f, " {}", s)?;
        }
        if let Some(r) = &self.reason {
            write!(f, " ({})", r)?;
        }
        Ok(())
    }
}

/// Why the simulation stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SimEnd {
    Gateway { node_id: String },
    MaxDuration,
    MaxNodes,
    /// No track has anything left to run.
    Idle,
}

#[derive(Debug, Clone, Serialize)]
pub struct SimReport {
    pub preset_id: String,
    pub events: Vec<SimEvent>,
    pub end: SimEnd,
    pub final_ms: Millis,
    /// Next time each cast skill is off cooldown.
    pub ready_at: BTreeMap<String, Millis>,
    pub metrics: BTreeMap<String, SkillAggregate>,
}

impl SimReport {
    pub fn count(&self, outcome: SimOutcome) -> usize {
        self.events.iter().filter(|e| e.outcome == outcome).count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimOptions {
    pub max_ms: Millis,
    pub max_nodes: usize,
    pub skip_retry_ms: u64,
    pub gateway_delay_ms: u64,
}

impl Default for SimOptions {
    fn default() -> Self {
        Self::from(&Settings::default())
    }
}

impl From<&Settings> for SimOptions {
    fn from(s: &Settings) -> Self {
        Self {
            max_ms: s.sim.max_ms,
            max_nodes: s.sim.max_nodes,
            skip_retry_ms: s.engine.skip_retry_ms,
            gateway_delay_ms: s.engine.gateway_delay_ms,
        }
    }
}

pub struct Simulator<'a> {
    preset: &'a Preset,
    catalogue: &'a Catalogue,
    opts: SimOptions,
    sched: Scheduler,
    store: StateStore,
    ready_at: BTreeMap<String, Millis>,
    events: Vec<SimEvent>,
    now: Millis,
}

impl<'a> Simulator<'a> {
    pub fn new(preset: &'a Preset, catalogue: &'a Catalogue, opts: SimOptions) -> Self {
        Self {
            preset,
            catalogue,
            opts,
            sched: Scheduler::new(preset, 0),
            store: StateStore::new(StoreLimits::default(), Arc::new(EventBus::new())),
            ready_at: BTreeMap::new(),
            events: Vec::new(),
            now: 0,
        }
    }

    fn record(&mut self, c: &Candidate, node_id: &str, skill_id: Option<&str>, outcome: SimOutcome, reason: Option<String>) {
        self.events.push(SimEvent {
            index: self.events.len(),
            at_ms: self.now,
            track_id: c.track_id.clone(),
            node_id: node_id.to_string(),
            skill_id: skill_id.map(str::to_string),
            outcome,
            reason,
        });
    }

    fn advance(&mut self, c: &Candidate, next_at: Millis) {
        if let Some(mode_id) = self.sched.advance(c.loc, next_at) {
            self.record(c, "", None, SimOutcome::ModeLoop, Some(mode_id));
        }
    }

    pub fn run(mut self) -> Result<SimReport, EngineError> {
        let end = loop {
            if self.events.len() >= self.opts.max_nodes {
                break SimEnd::MaxNodes;
            }
            let Some(due) = self.sched.next_wakeup() else { break SimEnd::Idle };
            self.now = self.now.max(due);
            if self.now > self.opts.max_ms {
                break SimEnd::MaxDuration;
            }
            let Some(c) = self.sched.pick(self.now) else { break SimEnd::Idle };
            if let Some(end) = self.step(&c)? {
                break end;
            }
        };

        let metrics = self.store.skills().into_iter().map(|s| (s.skill_id, s.counters)).collect();
        tracing::debug!("simulated `{}`: {} events, ended {:?} at {}ms", self.preset.id, self.events.len(), end, self.now);
        Ok(SimReport {
            preset_id: self.preset.id.clone(),
            events: self.events,
            end,
            final_ms: self.now,
            ready_at: self.ready_at,
            metrics,
        })
    }

    fn step(&mut self, c: &Candidate) -> Result<Option<SimEnd>, EngineError> {
        let preset = self.preset;
        let node = preset
            .track(c.loc)
            .and_then(|t| t.nodes.get(c.node))
            .ok_or_else(|| EngineError::Internal(format!("cursor {:?}/{} out of range", c.loc, c.node)))?;
        match node {
            Node::Skill(skill) => {
                let next_at = match self.cast(c, &skill.id, &skill.skill_id) {
                    Some(cast_ms) => self.now + cast_ms + skill.gap_ms,
                    None => self.now + self.opts.skip_retry_ms,
                };
                self.advance(c, next_at);
                Ok(None)
            }
            Node::Gateway(gw) => self.gateway(c, gw),
        }
    }

    /// Idealised attempt. Returns the cast time on success.
    fn cast(&mut self, c: &Candidate, node_id: &str, skill_id: &str) -> Option<u64> {
        let catalogue = self.catalogue;
        let Some(skill) = catalogue.skill(skill_id) else {
            self.record(c, node_id, Some(skill_id), SimOutcome::SkippedDisabled, Some("skill_not_found".into()));
            return None;
        };
        if !skill.enabled {
            self.record(c, node_id, Some(skill_id), SimOutcome::SkippedDisabled, Some("skill_disabled".into()));
            return None;
        }
        if self.ready_at.get(skill_id).is_some_and(|at| *at > self.now) {
            self.record(c, node_id, Some(skill_id), SimOutcome::SkippedCd, Some("cd_not_ready".into()));
            return None;
        }

        let start = self.now;
        let done = start + skill.cast_ms;
        let id = self.store.begin_attempt(skill_id, node_id, start);
        self.store.key_sent(&id, start);
        self.store.transition(&id, Stage::StartWait, start);
        self.store.transition(&id, Stage::Casting, start);
        self.store.transition(&id, Stage::CompleteWait, start);
        self.store.finish(&id, Stage::Success, None, done);
        self.ready_at.insert(skill_id.to_string(), done + skill.cooldown_ms);
        self.record(c, node_id, Some(skill_id), SimOutcome::Cast, None);
        Some(skill.cast_ms)
    }

    fn gateway(&mut self, c: &Candidate, gw: &GatewayNode) -> Result<Option<SimEnd>, EngineError> {
        let ev = Evaluator::new(self.catalogue, &NullSampler).with_metrics(&self.store).eval(&gw.condition);
        let delay = gw.gap_ms.unwrap_or(self.opts.gateway_delay_ms);
        if !ev.is_true() {
            let reason = ev.reason.unwrap_or_else(|| ev.value.to_string());
            self.record(c, &gw.id, None, SimOutcome::GwPass, Some(reason));
            self.advance(c, self.now + delay);
            return Ok(None);
        }

        if gw.reset_metrics {
            for (skill_id, metric) in gw.condition.metric_atoms() {
                self.store.reset_metric(&skill_id, metric, self.now);
            }
        }
        let dispatched = gateway::dispatch(&mut self.sched, self.preset, c.loc, gw, self.now, delay)?;
        let (outcome, reason) = match &dispatched.effect {
            GatewayEffect::Ended => (SimOutcome::GwEnd, None),
            GatewayEffect::ModeSwitched { to, .. } => (SimOutcome::GwSwitchMode, Some(to.clone())),
            GatewayEffect::Jumped { target, node } => {
                let outcome = if *target == c.loc { SimOutcome::GwJumpNode } else { SimOutcome::GwJumpTrack };
                let label = self.preset.track(*target).and_then(|t| t.nodes.get(*node)).map(|n| n.id().to_string());
                (outcome, label)
            }
            GatewayEffect::ExecSkill(skill_id) => (SimOutcome::GwExecSkill, Some(skill_id.clone())),
        };
        self.record(c, &gw.id, None, outcome, reason);
        if let Some(mode_id) = dispatched.looped {
            self.record(c, "", None, SimOutcome::ModeLoop, Some(mode_id));
        }

        match dispatched.effect {
            GatewayEffect::Ended => return Ok(Some(SimEnd::Gateway { node_id: gw.id.clone() })),
            GatewayEffect::ExecSkill(skill_id) => {
                let node_id = format!("exec:{}", skill_id);
                let spent = self.cast(c, &node_id, &skill_id).unwrap_or(0);
                self.advance(c, self.now + spent + delay);
            }
            _ => {}
        }
        Ok(None)
    }
}

/// Run `preset` offline with `opts`.
pub fn simulate(preset: &Preset, catalogue: &Catalogue, opts: SimOptions) -> Result<SimReport, EngineError> {
    Simulator::new(preset, catalogue, opts).run()
}

/// Skill ids that a simulated run never reached, in track order.
pub fn unreached_skills(preset: &Preset, report: &SimReport) -> Vec<String> {
    let mut ids: Vec<String> = Vec::new();
    let tracks = preset.global_tracks.iter().chain(preset.modes.iter().flat_map(|m| m.tracks.iter()));
    for node in tracks.flat_map(|t| t.nodes.iter()) {
        if let Node::Skill(SkillNode { skill_id, .. }) = node {
            let seen = report.events.iter().any(|e| e.skill_id.as_deref() == Some(skill_id.as_str()));
            if !seen && !ids.contains(skill_id) {
                ids.push(skill_id.clone());
            }
        }
    }
    ids
}

//! Per-skill counters and attempt history. The store is the engine's
//! [`MetricProvider`]: gateway conditions read the counters it keeps.

pub mod events;

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;

use crate::expr::{Metric, MetricProvider};
use crate::settings::EngineSettings;
use crate::types::{Millis, Unavailable};

use events::{EngineEvent, EventBus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    Preparing,
    StartWait,
    Casting,
    CompleteWait,
    Success,
    Failed,
    Stopped,
}

impl Stage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Success | Stage::Failed | Stage::Stopped)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Preparing => "PREPARING",
            Stage::StartWait => "START_WAIT",
            Stage::Casting => "CASTING",
            Stage::CompleteWait => "COMPLETE_WAIT",
            Stage::Success => "SUCCESS",
            Stage::Failed => "FAILED",
            Stage::Stopped => "STOPPED",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttemptEvent {
    pub at_ms: Millis,
    pub kind: String,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttemptState {
    pub id: String,
    pub skill_id: String,
    pub node_id: String,
    pub stage: Stage,
    pub retries: u32,
    pub started_at_ms: Millis,
    pub finished_at_ms: Option<Millis>,
    pub reason: Option<String>,
    pub events: VecDeque<AttemptEvent>,
    /// Events evicted from the front of `events` once the cap was hit.
    pub dropped_events: u32,
}

/// Monotonic per-skill counters. Only [`StateStore::reset_metric`] lowers them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SkillAggregate {
    pub attempt_started: u64,
    pub key_sent_ok: u64,
    pub cast_started: u64,
    pub success: u64,
    pub fail: u64,
    pub fail_reasons: BTreeMap<String, u64>,
    pub last_stage: Option<Stage>,
    pub in_flight: Option<String>,
}

impl SkillAggregate {
    pub fn metric(&self, metric: Metric) -> u64 {
        match metric {
            Metric::AttemptStarted => self.attempt_started,
            Metric::KeySentOk => self.key_sent_ok,
            Metric::CastStarted => self.cast_started,
            Metric::Success => self.success,
            Metric::Fail => self.fail,
        }
    }

    fn metric_mut(&mut self, metric: Metric) -> &mut u64 {
        match metric {
            Metric::AttemptStarted => &mut self.attempt_started,
            Metric::KeySentOk => &mut self.key_sent_ok,
            Metric::CastStarted => &mut self.cast_started,
            Metric::Success => &mut self.success,
            Metric::Fail => &mut self.fail,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkillSnapshot {
    pub skill_id: String,
    pub counters: SkillAggregate,
    pub recent: Vec<AttemptState>,
}

#[derive(Debug, Clone, Copy)]
pub struct StoreLimits {
    pub recent_attempts: usize,
    pub attempt_events: usize,
}

impl From<&EngineSettings> for StoreLimits {
    fn from(s: &EngineSettings) -> Self {
        Self { recent_attempts: s.recent_attempts, attempt_events: s.attempt_events }
    }
}

impl Default for StoreLimits {
    fn default() -> Self {
        StoreLimits::from(&EngineSettings::default())
    }
}

#[derive(Default)]
struct StoreInner {
    skills: HashMap<String, SkillAggregate>,
    live: HashMap<String, AttemptState>,
    recent: HashMap<String, VecDeque<AttemptState>>,
    seq: u64,
}

pub struct StateStore {
    inner: Mutex<StoreInner>,
    bus: Arc<EventBus>,
    limits: StoreLimits,
}

fn push_capped(attempt: &mut AttemptState, cap: usize, event: AttemptEvent) {
    if cap == 0 {
        attempt.dropped_events += 1;
        return;
    }
    while attempt.events.len() >= cap {
        attempt.events.pop_front();
        attempt.dropped_events += 1;
    }
    attempt.events.push_back(event);
}

impl StateStore {
    pub fn new(limits: StoreLimits, bus: Arc<EventBus>) -> Self {
        Self { inner: Mutex::new(StoreInner::default()), bus, limits }
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn publish(&self, event: EngineEvent) {
        self.bus.publish(event);
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Open an attempt in `PREPARING` and return its id. A still-open attempt
    /// for the same skill is closed as `STOPPED` first.
    pub fn begin_attempt(&self, skill_id: &str, node_id: &str, at_ms: Millis) -> String {
        let superseded = self.lock().skills.get(skill_id).and_then(|s| s.in_flight.clone());
        if let Some(old) = superseded {
            self.finish(&old, Stage::Stopped, Some("superseded".into()), at_ms);
        }

        let id = {
            let mut inner = self.lock();
            inner.seq += 1;
            let id = format!("{}#{}", skill_id, inner.seq);
            let mut attempt = AttemptState {
                id: id.clone(),
                skill_id: skill_id.to_string(),
                node_id: node_id.to_string(),
                stage: Stage::Preparing,
                retries: 0,
                started_at_ms: at_ms,
                finished_at_ms: None,
                reason: None,
                events: VecDeque::new(),
                dropped_events: 0,
            };
            push_capped(
                &mut attempt,
                self.limits.attempt_events,
                AttemptEvent { at_ms, kind: "PREPARING".into(), detail: None },
            );
            inner.live.insert(id.clone(), attempt);
            let agg = inner.skills.entry(skill_id.to_string()).or_default();
            agg.attempt_started += 1;
            agg.in_flight = Some(id.clone());
            agg.last_stage = Some(Stage::Preparing);
            id
        };
        self.bus.publish(EngineEvent::AttemptStarted {
            attempt_id: id.clone(),
            skill_id: skill_id.to_string(),
            node_id: node_id.to_string(),
            at_ms,
        });
        id
    }

    /// Move a live attempt to a non-terminal stage. Entering `CASTING`
    /// counts a cast start. Returns `false` for unknown or finished attempts.
    pub fn transition(&self, attempt_id: &str, stage: Stage, at_ms: Millis) -> bool {
        if stage.is_terminal() {
            return false;
        }
        let skill_id = {
            let mut inner = self.lock();
            let cap = self.limits.attempt_events;
            let Some(attempt) = inner.live.get_mut(attempt_id) else { return false };
            attempt.stage = stage;
            push_capped(attempt, cap, AttemptEvent { at_ms, kind: stage.as_str().into(), detail: None });
            let skill_id = attempt.skill_id.clone();
            let agg = inner.skills.entry(skill_id.clone()).or_default();
            agg.last_stage = Some(stage);
            if stage == Stage::Casting {
                agg.cast_started += 1;
            }
            skill_id
        };
        self.bus.publish(EngineEvent::AttemptStage {
            attempt_id: attempt_id.to_string(),
            skill_id,
            stage,
            at_ms,
        });
        true
    }

    /// Count one successful key dispatch.
    pub fn key_sent(&self, attempt_id: &str, at_ms: Millis) -> bool {
        let mut inner = self.lock();
        let cap = self.limits.attempt_events;
        let Some(attempt) = inner.live.get_mut(attempt_id) else { return false };
        push_capped(attempt, cap, AttemptEvent { at_ms, kind: "KEY_SENT".into(), detail: None });
        let skill_id = attempt.skill_id.clone();
        inner.skills.entry(skill_id).or_default().key_sent_ok += 1;
        true
    }

    pub fn retry(&self, attempt_id: &str, at_ms: Millis) -> bool {
        let (skill_id, retry) = {
            let mut inner = self.lock();
            let cap = self.limits.attempt_events;
            let Some(attempt) = inner.live.get_mut(attempt_id) else { return false };
            attempt.retries += 1;
            let retry = attempt.retries;
            push_capped(attempt, cap, AttemptEvent { at_ms, kind: "RETRY".into(), detail: Some(retry.to_string()) });
            (attempt.skill_id.clone(), retry)
        };
        self.bus.publish(EngineEvent::AttemptRetry {
            attempt_id: attempt_id.to_string(),
            skill_id,
            retry,
            at_ms,
        });
        true
    }

    /// Free-form annotation on a live attempt.
    pub fn note(&self, attempt_id: &str, kind: &str, detail: Option<String>, at_ms: Millis) -> bool {
        let mut inner = self.lock();
        let cap = self.limits.attempt_events;
        let Some(attempt) = inner.live.get_mut(attempt_id) else { return false };
        push_capped(attempt, cap, AttemptEvent { at_ms, kind: kind.to_string(), detail });
        true
    }

    /// Close an attempt with a terminal stage. Each attempt is finalized
    /// exactly once; later calls return `false` and change nothing.
    pub fn finish(&self, attempt_id: &str, stage: Stage, reason: Option<String>, at_ms: Millis) -> bool {
        if !stage.is_terminal() {
            return false;
        }
        let skill_id = {
            let mut inner = self.lock();
            let Some(mut attempt) = inner.live.remove(attempt_id) else { return false };
            attempt.stage = stage;
            attempt.finished_at_ms = Some(at_ms);
            attempt.reason = reason.clone();
            push_capped(
                &mut attempt,
                self.limits.attempt_events,
                AttemptEvent { at_ms, kind: stage.as_str().into(), detail: reason.clone() },
            );
            let skill_id = attempt.skill_id.clone();

            let agg = inner.skills.entry(skill_id.clone()).or_default();
            match stage {
                Stage::Success => agg.success += 1,
                Stage::Failed => {
                    agg.fail += 1;
                    let key = reason.clone().unwrap_or_else(|| "unknown".into());
                    *agg.fail_reasons.entry(key).or_default() += 1;
                }
                _ => {}
            }
            agg.last_stage = Some(stage);
            if agg.in_flight.as_deref() == Some(attempt_id) {
                agg.in_flight = None;
            }

            let cap = self.limits.recent_attempts;
            let ring = inner.recent.entry(skill_id.clone()).or_default();
            if cap > 0 {
                while ring.len() >= cap {
                    ring.pop_front();
                }
                ring.push_back(attempt);
            }
            skill_id
        };
        self.bus.publish(EngineEvent::AttemptFinished {
            attempt_id: attempt_id.to_string(),
            skill_id,
            stage,
            reason,
            at_ms,
        });
        true
    }

    /// Zero one counter. The only operation that lowers a metric.
    pub fn reset_metric(&self, skill_id: &str, metric: Metric, at_ms: Millis) {
        {
            let mut inner = self.lock();
            if let Some(agg) = inner.skills.get_mut(skill_id) {
                *agg.metric_mut(metric) = 0;
            }
        }
        self.bus.publish(EngineEvent::MetricReset { skill_id: skill_id.to_string(), metric, at_ms });
    }

    pub fn count(&self, skill_id: &str, metric: Metric) -> u64 {
        self.lock().skills.get(skill_id).map(|a| a.metric(metric)).unwrap_or(0)
    }

    pub fn skill(&self, skill_id: &str) -> SkillSnapshot {
        let inner = self.lock();
        SkillSnapshot {
            skill_id: skill_id.to_string(),
            counters: inner.skills.get(skill_id).cloned().unwrap_or_default(),
            recent: inner
                .recent
                .get(skill_id)
                .map(|r| r.iter().cloned().collect())
                .unwrap_or_default(),
        }
    }

    /// Snapshots for every skill seen so far, sorted by id.
    pub fn skills(&self) -> Vec<SkillSnapshot> {
        let mut ids: Vec<String> = self.lock().skills.keys().cloned().collect();
        ids.sort();
        ids.iter().map(|id| self.skill(id)).collect()
    }

    pub fn attempt(&self, attempt_id: &str) -> Option<AttemptState> {
        let inner = self.lock();
        if let Some(a) = inner.live.get(attempt_id) {
            return Some(a.clone());
        }
        inner
            .recent
            .values()
            .flat_map(|r| r.iter())
            .find(|a| a.id == attempt_id)
            .cloned()
    }

    /// Close every live attempt as `STOPPED`. Used on engine shutdown.
    pub fn stop_all(&self, reason: &str, at_ms: Millis) {
        let ids: Vec<String> = self.lock().live.keys().cloned().collect();
        for id in ids {
            self.finish(&id, Stage::Stopped, Some(reason.to_string()), at_ms);
        }
    }
}

impl MetricProvider for StateStore {
    fn get_metric(&self, skill_id: &str, metric: Metric) -> Result<u64, Unavailable> {
        Ok(self.count(skill_id, metric))
    }
}

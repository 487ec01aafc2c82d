//! Engine event stream. Subscribers are channels or callbacks; a callback
//! that panics or a channel whose receiver is gone is dropped from the bus.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{mpsc, Arc, Mutex};

use serde::Serialize;

use crate::expr::Metric;
use crate::types::Millis;

use super::Stage;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    EngineStarted { preset_id: String, at_ms: Millis },
    EngineStopped { reason: String, at_ms: Millis },
    EnginePaused { at_ms: Millis },
    EngineResumed { at_ms: Millis },
    AttemptStarted { attempt_id: String, skill_id: String, node_id: String, at_ms: Millis },
    AttemptStage { attempt_id: String, skill_id: String, stage: Stage, at_ms: Millis },
    AttemptRetry { attempt_id: String, skill_id: String, retry: u32, at_ms: Millis },
    AttemptFinished { attempt_id: String, skill_id: String, stage: Stage, reason: Option<String>, at_ms: Millis },
    SkillSkipped { skill_id: String, node_id: String, reason: String, at_ms: Millis },
    Gateway { node_id: String, track_id: String, action: String, fired: bool, reason: Option<String>, at_ms: Millis },
    ModeSwitched { from: Option<String>, to: String, at_ms: Millis },
    ModeLooped { mode_id: String, at_ms: Millis },
    MetricReset { skill_id: String, metric: Metric, at_ms: Millis },
    CapturePlanChanged { version: u64, regions: usize },
    CaptureFailed { code: String, detail: String, backoff_ms: u64 },
    CaptureRecovered { after_failures: u32 },
}

impl EngineEvent {
    pub fn skill_id(&self) -> Option<&str> {
        match self {
            EngineEvent::AttemptStarted { skill_id, .. }
            | EngineEvent::AttemptStage { skill_id, .. }
            | EngineEvent::AttemptRetry { skill_id, .. }
            | EngineEvent::AttemptFinished { skill_id, .. }
            | EngineEvent::SkillSkipped { skill_id, .. }
            | EngineEvent::MetricReset { skill_id, .. } => Some(skill_id),
            _ => None,
        }
    }
}

type Callback = Arc<dyn Fn(&EngineEvent) + Send + Sync>;

#[derive(Clone)]
enum Sink {
    Channel(mpsc::Sender<EngineEvent>),
    Callback(Callback),
}

#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<(u64, Sink)>>,
    next_id: Mutex<u64>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn add(&self, sink: Sink) -> u64 {
        let id = {
            let mut n = self.next_id.lock().unwrap_or_else(|e| e.into_inner());
            *n += 1;
            *n
        };
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, sink));
        id
    }

    pub fn subscribe(&self) -> mpsc::Receiver<EngineEvent> {
        let (tx, rx) = mpsc::channel();
        self.add(Sink::Channel(tx));
        rx
    }

    /// Register a callback. It runs on the publishing thread.
    pub fn on<F>(&self, callback: F) -> u64
    where
        F: Fn(&EngineEvent) + Send + Sync + 'static,
    {
        self.add(Sink::Callback(Arc::new(callback)))
    }

    pub fn unsubscribe(&self, id: u64) {
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|(sid, _)| *sid != id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Deliver to every subscriber. The subscriber list is not locked while
    /// callbacks run, so a callback may publish or subscribe.
    pub fn publish(&self, event: EngineEvent) {
        let sinks: Vec<(u64, Sink)> = self.subscribers.lock().unwrap_or_else(|e| e.into_inner()).clone();
        let mut dead = Vec::new();
        for (id, sink) in sinks {
            match sink {
                Sink::Channel(tx) => {
                    if tx.send(event.clone()).is_err() {
                        dead.push(id);
                    }
                }
                Sink::Callback(cb) => {
                    if catch_unwind(AssertUnwindSafe(|| cb(&event))).is_err() {
                        tracing::warn!("event subscriber {} panicked and was removed", id);
                        dead.push(id);
                    }
                }
            }
        }
        if !dead.is_empty() {
            self.subscribers
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .retain(|(id, _)| !dead.contains(id));
        }
    }
}

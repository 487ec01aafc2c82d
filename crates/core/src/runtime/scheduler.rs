//! Decides which node runs next. Pure bookkeeping over run-relative time;
//! the live engine and the simulator drive the same scheduler.

use crate::preset::{Preset, TrackLoc};
use crate::types::Millis;

use super::track::{GlobalTrack, ModeTrack};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub loc: TrackLoc,
    pub track_id: String,
    pub node: usize,
    pub due_at: Millis,
}

impl Candidate {
    fn sort_key(&self) -> (Millis, u8, &str) {
        let scope = match self.loc {
            TrackLoc::Global(_) => 0,
            TrackLoc::Mode(..) => 1,
        };
        (self.due_at, scope, self.track_id.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct ActiveMode {
    pub index: usize,
    pub id: String,
    tracks: Vec<ModeTrack>,
    step: Option<i32>,
}

impl ActiveMode {
    fn new(preset: &Preset, index: usize, at: Millis) -> Option<Self> {
        let mode = preset.modes.get(index)?;
        let mut m = Self {
            index,
            id: mode.id.clone(),
            tracks: mode.tracks.iter().map(|t| ModeTrack::new(t, at)).collect(),
            step: None,
        };
        m.refresh_step();
        Some(m)
    }

    /// The step floor is the lowest pending step across unfinished tracks.
    fn refresh_step(&mut self) {
        self.step = self
            .tracks
            .iter()
            .filter(|t| !t.is_done())
            .filter_map(|t| t.current_step())
            .min();
    }

    fn exhausted(&self) -> bool {
        self.tracks.iter().any(|t| !t.is_empty()) && self.tracks.iter().all(|t| t.is_done())
    }

    fn reset(&mut self, at: Millis) {
        for t in &mut self.tracks {
            t.reset(at);
        }
        self.refresh_step();
    }
}

#[derive(Debug, Clone)]
pub struct Scheduler {
    globals: Vec<GlobalTrack>,
    mode: Option<ActiveMode>,
}

impl Scheduler {
    pub fn new(preset: &Preset, at: Millis) -> Self {
        Self {
            globals: preset.global_tracks.iter().map(|t| GlobalTrack::new(t, at)).collect(),
            mode: preset.entry_mode.and_then(|m| ActiveMode::new(preset, m, at)),
        }
    }

    pub fn active_mode(&self) -> Option<usize> {
        self.mode.as_ref().map(|m| m.index)
    }

    pub fn mode_id(&self) -> Option<&str> {
        self.mode.as_ref().map(|m| m.id.as_str())
    }

    pub fn current_step(&self) -> Option<i32> {
        self.mode.as_ref().and_then(|m| m.step)
    }

    /// Replace the active mode; its tracks restart at their lowest step.
    pub fn switch_mode(&mut self, preset: &Preset, mode: usize, at: Millis) -> bool {
        match ActiveMode::new(preset, mode, at) {
            Some(m) => {
                self.mode = Some(m);
                true
            }
            None => false,
        }
    }

    /// Every node currently under a cursor, in execution priority order:
    /// earliest due first, global before mode, then track id. Mode tracks
    /// only contribute when their node sits on the step floor.
    pub fn candidates(&self) -> Vec<Candidate> {
        let mut out: Vec<Candidate> = self
            .globals
            .iter()
            .enumerate()
            .filter_map(|(i, g)| {
                g.current().map(|node| Candidate {
                    loc: TrackLoc::Global(i),
                    track_id: g.id.clone(),
                    node,
                    due_at: g.next_at,
                })
            })
            .collect();

        if let Some(mode) = &self.mode {
            for (i, t) in mode.tracks.iter().enumerate() {
                if t.is_done() || t.current_step() != mode.step {
                    continue;
                }
                if let Some(node) = t.current() {
                    out.push(Candidate {
                        loc: TrackLoc::Mode(mode.index, i),
                        track_id: t.id.clone(),
                        node,
                        due_at: t.next_at,
                    });
                }
            }
        }

        out.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
        out
    }

    /// The node to run at `now`, if any is due.
    pub fn pick(&self, now: Millis) -> Option<Candidate> {
        self.candidates().into_iter().find(|c| c.due_at <= now)
    }

    /// Earliest time any eligible node comes due.
    pub fn next_wakeup(&self) -> Option<Millis> {
        self.candidates().first().map(|c| c.due_at)
    }

    /// Move the cursor of `loc` past its current node. Returns the mode id
    /// when this exhausted the active mode and it looped back to its start.
    pub fn advance(&mut self, loc: TrackLoc, next_at: Millis) -> Option<String> {
        match loc {
            TrackLoc::Global(i) => {
                if let Some(g) = self.globals.get_mut(i) {
                    g.advance(next_at);
                }
                None
            }
            TrackLoc::Mode(m, t) => {
                let mode = self.mode.as_mut().filter(|a| a.index == m)?;
                mode.tracks.get_mut(t)?.advance(next_at);
                mode.refresh_step();
                if mode.exhausted() {
                    mode.reset(next_at);
                    return Some(mode.id.clone());
                }
                None
            }
        }
    }

    /// Keep the cursor in place and retry the same node at `next_at`.
    pub fn hold(&mut self, loc: TrackLoc, next_at: Millis) {
        match loc {
            TrackLoc::Global(i) => {
                if let Some(g) = self.globals.get_mut(i) {
                    g.next_at = next_at;
                }
            }
            TrackLoc::Mode(m, t) => {
                if let Some(track) = self.mode.as_mut().filter(|a| a.index == m).and_then(|a| a.tracks.get_mut(t)) {
                    track.next_at = next_at;
                }
            }
        }
    }

    /// Put the cursor of `loc` on `node`, due at `at`. Fails when the track
    /// is not active or has no such node.
    pub fn relocate(&mut self, loc: TrackLoc, node: usize, at: Millis) -> bool {
        match loc {
            TrackLoc::Global(i) => self.globals.get_mut(i).is_some_and(|g| g.jump(node, at)),
            TrackLoc::Mode(m, t) => {
                let Some(mode) = self.mode.as_mut().filter(|a| a.index == m) else { return false };
                let moved = mode.tracks.get_mut(t).is_some_and(|track| track.jump(node, at));
                mode.refresh_step();
                moved
            }
        }
    }

    pub fn is_active(&self, loc: TrackLoc) -> bool {
        match loc {
            TrackLoc::Global(i) => i < self.globals.len(),
            TrackLoc::Mode(m, t) => self.mode.as_ref().is_some_and(|a| a.index == m && t < a.tracks.len()),
        }
    }
}

//! Preset documents and their validated, executable form.
//!
//! A [`PresetDoc`] is what the host loads (serde). [`validate_preset`] walks
//! the whole document, decodes every embedded expression, checks every
//! reference and produces either a [`Preset`] or the full list of problems.
//! Nothing is started from a document with errors.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::catalogue::{Catalogue, SkillDef};
use crate::diag::{pointer, Diagnostics};
use crate::expr::{decode_at, validate_expr, Expr, ProbeRequirements};
use crate::platform::keys::KeyChord;

// ---------------------------------------------------------------------------
// Policies shared by documents and compiled presets

/// What counts as "the action started".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartMode {
    /// Started as soon as the key went out.
    #[default]
    None,
    /// The ready indicator went dark.
    Pixel,
    /// The cast bar moved away from its pre-dispatch baseline.
    CastBar,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionPolicy {
    /// Wait out the declared cast time.
    #[default]
    AssumeSuccess,
    /// Poll the completion signal; fail on timeout.
    RequireSignal,
    /// Poll the completion signal; succeed on timeout.
    Hybrid,
    /// Like `RequireSignal` once the signal has been observed at all,
    /// otherwise like `AssumeSuccess`.
    HybridIfObservable,
}

/// What to do when another attempt holds the cast lock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockPolicy {
    #[default]
    SkipAndAdvance,
    SkipButHold,
    Wait,
}

fn default_start_timeout() -> u64 {
    600
}

fn default_start_retries() -> u32 {
    1
}

fn default_factor() -> f64 {
    1.5
}

fn default_lock_timeout() -> u64 {
    500
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockOptions {
    #[serde(default)]
    pub policy: LockPolicy,
    #[serde(default = "default_lock_timeout")]
    pub timeout_ms: u64,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self { policy: LockPolicy::default(), timeout_ms: default_lock_timeout() }
    }
}

// ---------------------------------------------------------------------------
// Documents

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartDoc {
    #[serde(default)]
    pub mode: StartMode,
    #[serde(default)]
    pub expr: Option<Value>,
    #[serde(default = "default_start_timeout")]
    pub timeout_ms: u64,
    #[serde(default = "default_start_retries")]
    pub retries: u32,
}

impl Default for StartDoc {
    fn default() -> Self {
        Self { mode: StartMode::default(), expr: None, timeout_ms: default_start_timeout(), retries: default_start_retries() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionDoc {
    #[serde(default)]
    pub policy: CompletionPolicy,
    #[serde(default)]
    pub expr: Option<Value>,
    #[serde(default = "default_factor")]
    pub factor: f64,
}

impl Default for CompletionDoc {
    fn default() -> Self {
        Self { policy: CompletionPolicy::default(), expr: None, factor: default_factor() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkillNodeDoc {
    pub id: String,
    pub skill_id: String,
    #[serde(default)]
    pub step: i32,
    #[serde(default)]
    pub gap_ms: Option<u64>,
    #[serde(default)]
    pub ready: Option<Value>,
    #[serde(default)]
    pub start: StartDoc,
    #[serde(default)]
    pub completion: CompletionDoc,
    #[serde(default)]
    pub lock: LockOptions,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayAction {
    End,
    SwitchMode {
        mode_id: String,
        #[serde(default)]
        track_id: Option<String>,
        #[serde(default)]
        node_id: Option<String>,
    },
    JumpNode {
        node_id: String,
    },
    JumpTrack {
        track_id: String,
        #[serde(default)]
        node_id: Option<String>,
    },
    ExecSkill {
        skill_id: String,
    },
}

impl GatewayAction {
    pub fn name(&self) -> &'static str {
        match self {
            GatewayAction::End => "end",
            GatewayAction::SwitchMode { .. } => "switch_mode",
            GatewayAction::JumpNode { .. } => "jump_node",
            GatewayAction::JumpTrack { .. } => "jump_track",
            GatewayAction::ExecSkill { .. } => "exec_skill",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayNodeDoc {
    pub id: String,
    #[serde(default)]
    pub step: i32,
    #[serde(default)]
    pub gap_ms: Option<u64>,
    pub condition: Value,
    pub action: GatewayAction,
    #[serde(default)]
    pub reset_metrics: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeDoc {
    Skill(SkillNodeDoc),
    Gateway(GatewayNodeDoc),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackDoc {
    pub id: String,
    #[serde(default)]
    pub nodes: Vec<NodeDoc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModeDoc {
    pub id: String,
    #[serde(default)]
    pub tracks: Vec<TrackDoc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresetDoc {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub entry_mode: Option<String>,
    #[serde(default)]
    pub default_gap_ms: u64,
    #[serde(default)]
    pub global_tracks: Vec<TrackDoc>,
    #[serde(default)]
    pub modes: Vec<ModeDoc>,
}

// ---------------------------------------------------------------------------
// Compiled preset

#[derive(Debug, Clone, PartialEq)]
pub struct StartSpec {
    pub mode: StartMode,
    /// `None` means "started on dispatch".
    pub expr: Option<Expr>,
    pub timeout_ms: u64,
    pub retries: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompletionSpec {
    pub policy: CompletionPolicy,
    pub expr: Option<Expr>,
    pub factor: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SkillNode {
    pub id: String,
    pub skill_id: String,
    pub step: i32,
    pub gap_ms: u64,
    pub ready: Expr,
    pub start: StartSpec,
    pub completion: CompletionSpec,
    pub lock: LockOptions,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GatewayNode {
    pub id: String,
    pub step: i32,
    pub gap_ms: Option<u64>,
    pub condition: Expr,
    pub action: GatewayAction,
    pub reset_metrics: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Skill(SkillNode),
    Gateway(GatewayNode),
}

impl Node {
    pub fn id(&self) -> &str {
        match self {
            Node::Skill(s) => &s.id,
            Node::Gateway(g) => &g.id,
        }
    }

    pub fn step(&self) -> i32 {
        match self {
            Node::Skill(s) => s.step,
            Node::Gateway(g) => g.step,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Track {
    pub id: String,
    pub nodes: Vec<Node>,
}

impl Track {
    pub fn position_of(&self, node_id: &str) -> Option<usize> {
        self.nodes.iter().position(|n| n.id() == node_id)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Mode {
    pub id: String,
    pub tracks: Vec<Track>,
}

/// Where a track lives inside a preset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackLoc {
    Global(usize),
    Mode(usize, usize),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Preset {
    pub id: String,
    pub name: String,
    pub entry_mode: Option<usize>,
    pub global_tracks: Vec<Track>,
    pub modes: Vec<Mode>,
}

impl Preset {
    pub fn mode_index(&self, id: &str) -> Option<usize> {
        self.modes.iter().position(|m| m.id == id)
    }

    pub fn locate_track(&self, id: &str) -> Option<TrackLoc> {
        if let Some(i) = self.global_tracks.iter().position(|t| t.id == id) {
            return Some(TrackLoc::Global(i));
        }
        self.modes.iter().enumerate().find_map(|(m, mode)| {
            mode.tracks.iter().position(|t| t.id == id).map(|t| TrackLoc::Mode(m, t))
        })
    }

    pub fn track(&self, loc: TrackLoc) -> Option<&Track> {
        match loc {
            TrackLoc::Global(i) => self.global_tracks.get(i),
            TrackLoc::Mode(m, t) => self.modes.get(m).and_then(|mode| mode.tracks.get(t)),
        }
    }

    /// Pixel/metric dependencies of every expression reachable while
    /// `active_mode` is active (global tracks always count).
    pub fn probes(&self, catalogue: &Catalogue, active_mode: Option<usize>) -> ProbeRequirements {
        let mut req = ProbeRequirements::new();
        let mode_tracks = active_mode
            .and_then(|m| self.modes.get(m))
            .map(|m| m.tracks.as_slice())
            .unwrap_or(&[]);
        for track in self.global_tracks.iter().chain(mode_tracks) {
            for node in &track.nodes {
                match node {
                    Node::Skill(s) => {
                        req.add(&s.ready);
                        if let Some(e) = &s.start.expr {
                            req.add(e);
                        }
                        if let Some(e) = &s.completion.expr {
                            req.add(e);
                        }
                    }
                    Node::Gateway(g) => {
                        req.add(&g.condition);
                        if let GatewayAction::ExecSkill { skill_id } = &g.action {
                            if catalogue.skill(skill_id).is_some_and(|s| s.pixel.is_some()) {
                                req.add(&Expr::skill_ready(skill_id.clone()));
                            }
                        }
                    }
                }
            }
        }
        req
    }

    pub fn node_count(&self) -> usize {
        self.global_tracks
            .iter()
            .chain(self.modes.iter().flat_map(|m| m.tracks.iter()))
            .map(|t| t.nodes.len())
            .sum()
    }
}

// ---------------------------------------------------------------------------
// Validation

/// Outcome of validating a preset document.
#[derive(Debug, Clone)]
pub struct ValidationReport {
    pub diagnostics: Diagnostics,
    /// Union of every expression's dependencies across all scopes.
    pub probes: ProbeRequirements,
    /// Present only when there are no errors.
    pub preset: Option<Preset>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.preset.is_some()
    }
}

pub fn validate_preset(doc: &PresetDoc, catalogue: &Catalogue) -> ValidationReport {
    let mut diags = Diagnostics::new();

    if doc.id.trim().is_empty() {
        diags.error("preset.missing_id", "/id", "preset id must not be empty");
    }
    if doc.global_tracks.is_empty() && doc.modes.iter().all(|m| m.tracks.is_empty()) {
        diags.error("preset.empty", "", "preset has no tracks");
    }

    let mut seen_tracks = HashSet::new();
    for (i, t) in doc.global_tracks.iter().enumerate() {
        check_track_id(t, &pointer("/global_tracks", i), &mut seen_tracks, &mut diags);
    }
    let mut seen_modes = HashSet::new();
    for (m, mode) in doc.modes.iter().enumerate() {
        let mpath = pointer("/modes", m);
        if !seen_modes.insert(mode.id.as_str()) {
            diags.error("preset.duplicate_mode", &pointer(&mpath, "id"), format!("mode `{}` declared twice", mode.id));
        }
        if mode.tracks.is_empty() {
            diags.warning("preset.empty_mode", &mpath, format!("mode `{}` has no tracks", mode.id));
        }
        for (t, track) in mode.tracks.iter().enumerate() {
            check_track_id(track, &pointer(&pointer(&mpath, "tracks"), t), &mut seen_tracks, &mut diags);
        }
    }

    let entry_mode = match &doc.entry_mode {
        Some(id) => {
            let idx = doc.modes.iter().position(|m| &m.id == id);
            if idx.is_none() {
                diags.error("preset.unknown_entry_mode", "/entry_mode", format!("entry mode `{}` is not declared", id));
            }
            idx
        }
        None if !doc.modes.is_empty() => {
            diags.info("preset.implicit_entry_mode", "/entry_mode", format!("starting in first mode `{}`", doc.modes[0].id));
            Some(0)
        }
        None => None,
    };

    let cx = Compiler { doc, catalogue };
    let global_tracks: Vec<Track> = doc
        .global_tracks
        .iter()
        .enumerate()
        .map(|(i, t)| cx.track(t, None, &pointer("/global_tracks", i), &mut diags))
        .collect();
    let modes: Vec<Mode> = doc
        .modes
        .iter()
        .enumerate()
        .map(|(m, mode)| Mode {
            id: mode.id.clone(),
            tracks: mode
                .tracks
                .iter()
                .enumerate()
                .map(|(t, track)| cx.track(track, Some(m), &pointer(&pointer(&pointer("/modes", m), "tracks"), t), &mut diags))
                .collect(),
        })
        .collect();

    let compiled = Preset {
        id: doc.id.clone(),
        name: if doc.name.is_empty() { doc.id.clone() } else { doc.name.clone() },
        entry_mode,
        global_tracks,
        modes,
    };

    let mut probes = ProbeRequirements::new();
    for m in 0..compiled.modes.len() {
        probes.merge(&compiled.probes(catalogue, Some(m)));
    }
    probes.merge(&compiled.probes(catalogue, None));

    let preset = if diags.has_errors() { None } else { Some(compiled) };
    ValidationReport { diagnostics: diags, probes, preset }
}

fn check_track_id<'a>(track: &'a TrackDoc, path: &str, seen: &mut HashSet<&'a str>, diags: &mut Diagnostics) {
    if track.id.trim().is_empty() {
        diags.error("preset.missing_id", &pointer(path, "id"), "track id must not be empty");
    } else if !seen.insert(track.id.as_str()) {
        diags.error("preset.duplicate_track", &pointer(path, "id"), format!("track `{}` declared twice", track.id));
    }
    if track.nodes.is_empty() {
        diags.warning("preset.empty_track", path, format!("track `{}` has no nodes", track.id));
    }
    let mut nodes = HashSet::new();
    for (i, n) in track.nodes.iter().enumerate() {
        let id = match n {
            NodeDoc::Skill(s) => &s.id,
            NodeDoc::Gateway(g) => &g.id,
        };
        let npath = pointer(&pointer(path, "nodes"), i);
        if id.trim().is_empty() {
            diags.error("preset.missing_id", &pointer(&npath, "id"), "node id must not be empty");
        } else if !nodes.insert(id.as_str()) {
            diags.error("preset.duplicate_node", &pointer(&npath, "id"), format!("node `{}` declared twice in track `{}`", id, track.id));
        }
    }
}

struct Compiler<'a> {
    doc: &'a PresetDoc,
    catalogue: &'a Catalogue,
}

impl Compiler<'_> {
    fn track(&self, track: &TrackDoc, mode: Option<usize>, path: &str, diags: &mut Diagnostics) -> Track {
        let nodes = track
            .nodes
            .iter()
            .enumerate()
            .map(|(i, n)| {
                let npath = pointer(&pointer(path, "nodes"), i);
                match n {
                    NodeDoc::Skill(s) => Node::Skill(self.skill_node(s, &npath, diags)),
                    NodeDoc::Gateway(g) => Node::Gateway(self.gateway_node(g, track, mode, &npath, diags)),
                }
            })
            .collect();
        Track { id: track.id.clone(), nodes }
    }

    fn expr(&self, value: &Value, path: &str, diags: &mut Diagnostics) -> Option<Expr> {
        let e = decode_at(value, path, diags)?;
        validate_expr(&e, self.catalogue, path, diags);
        Some(e)
    }

    fn skill_node(&self, doc: &SkillNodeDoc, path: &str, diags: &mut Diagnostics) -> SkillNode {
        let skill = self.check_skill(&doc.skill_id, &pointer(path, "skill_id"), diags);

        let ready = match &doc.ready {
            Some(v) => self.expr(v, &pointer(path, "ready"), diags).unwrap_or(Expr::Const(false)),
            None if skill.is_some_and(|s| s.pixel.is_none()) => {
                diags.info(
                    "skill.ready_assumed",
                    path,
                    format!("skill `{}` has no pixel and no `ready` expression; it is always treated as ready", doc.skill_id),
                );
                Expr::Const(true)
            }
            None => Expr::skill_ready(doc.skill_id.clone()),
        };
        if doc.ready.is_none() && doc.start.expr.is_none() && doc.start.mode == StartMode::Pixel && ready == Expr::Const(true) {
            diags.warning(
                "start.pixel_unobservable",
                &pointer(path, "start"),
                format!("skill `{}` has no pixel to go dark; pixel start can only time out", doc.skill_id),
            );
        }

        let spath = pointer(path, "start");
        let start_expr = match (&doc.start.expr, doc.start.mode) {
            (Some(v), _) => self.expr(v, &pointer(&spath, "expr"), diags),
            (None, StartMode::None) => None,
            (None, StartMode::Pixel) => Some(Expr::not(ready.clone())),
            (None, StartMode::CastBar) => self.cast_bar(skill, &spath, diags).map(Expr::bar_changed),
        };
        if doc.start.mode != StartMode::None && doc.start.timeout_ms == 0 {
            diags.error("start.timeout_range", &pointer(&spath, "timeout_ms"), "start timeout must be positive");
        }

        let cpath = pointer(path, "completion");
        let completion_expr = match &doc.completion.expr {
            Some(v) => self.expr(v, &pointer(&cpath, "expr"), diags),
            None if doc.completion.policy == CompletionPolicy::AssumeSuccess => None,
            None if doc.start.mode == StartMode::CastBar => {
                self.cast_bar(skill, &spath, &mut Diagnostics::new()).map(|p| Expr::not(Expr::bar_changed(p)))
            }
            None => {
                if doc.completion.policy == CompletionPolicy::RequireSignal {
                    diags.error(
                        "completion.signal_missing",
                        &cpath,
                        "`require_signal` needs `expr` (or a cast-bar start to derive one)",
                    );
                } else {
                    diags.warning(
                        "completion.signal_missing",
                        &cpath,
                        "no completion signal; this node always falls back to assume-success",
                    );
                }
                None
            }
        };
        if doc.completion.factor.is_nan() || doc.completion.factor <= 0.0 {
            diags.error("completion.factor_range", &pointer(&cpath, "factor"), "factor must be positive");
        } else if doc.completion.factor < 1.0 && doc.completion.policy != CompletionPolicy::AssumeSuccess {
            diags.warning(
                "completion.factor_short",
                &pointer(&cpath, "factor"),
                "factor below 1 waits less than the declared cast time",
            );
        }

        if doc.lock.policy == LockPolicy::Wait && doc.lock.timeout_ms == 0 {
            diags.warning("lock.zero_wait", &pointer(path, "lock"), "`wait` with timeout 0 behaves like skip_and_advance");
        }

        SkillNode {
            id: doc.id.clone(),
            skill_id: doc.skill_id.clone(),
            step: doc.step,
            gap_ms: doc.gap_ms.unwrap_or(self.doc.default_gap_ms),
            ready,
            start: StartSpec {
                mode: doc.start.mode,
                expr: start_expr,
                timeout_ms: doc.start.timeout_ms,
                retries: doc.start.retries,
            },
            completion: CompletionSpec {
                policy: doc.completion.policy,
                expr: completion_expr,
                factor: doc.completion.factor,
            },
            lock: doc.lock,
        }
    }

    fn cast_bar(&self, skill: Option<&SkillDef>, path: &str, diags: &mut Diagnostics) -> Option<String> {
        let skill = skill?;
        match &skill.cast_bar_point {
            Some(p) if self.catalogue.point(p).is_some() => Some(p.clone()),
            Some(p) => {
                diags.error("ref.unknown_point", path, format!("cast bar point `{}` of skill `{}` is not defined", p, skill.id));
                None
            }
            None => {
                diags.error(
                    "skill.cast_bar_point_missing",
                    path,
                    format!("cast-bar start needs `cast_bar_point` on skill `{}`", skill.id),
                );
                None
            }
        }
    }

    /// Resolve a skill reference, reporting unknown/disabled/unkeyed skills.
    fn check_skill(&self, skill_id: &str, path: &str, diags: &mut Diagnostics) -> Option<&SkillDef> {
        let Some(skill) = self.catalogue.skill(skill_id) else {
            diags.error("ref.unknown_skill", path, format!("skill `{}` is not defined", skill_id));
            return None;
        };
        if !skill.enabled {
            diags.warning("skill.disabled", path, format!("skill `{}` is disabled and will be skipped", skill_id));
        }
        match skill.key.as_deref() {
            None | Some("") => diags.error("skill.key_missing", path, format!("skill `{}` has no key", skill_id)),
            Some(k) => {
                if let Err(e) = KeyChord::parse(k) {
                    diags.error("skill.key_invalid", path, format!("skill `{}`: {}", skill_id, e));
                }
            }
        }
        Some(skill)
    }

    fn gateway_node(
        &self,
        doc: &GatewayNodeDoc,
        own_track: &TrackDoc,
        mode: Option<usize>,
        path: &str,
        diags: &mut Diagnostics,
    ) -> GatewayNode {
        let condition = self
            .expr(&doc.condition, &pointer(path, "condition"), diags)
            .unwrap_or(Expr::Const(false));
        let apath = pointer(path, "action");

        match &doc.action {
            GatewayAction::End => {}
            GatewayAction::SwitchMode { mode_id, track_id, node_id } => {
                match self.doc.modes.iter().find(|m| &m.id == mode_id) {
                    None => diags.error(
                        "gateway.unknown_mode",
                        &pointer(&apath, "mode_id"),
                        format!("mode `{}` is not declared", mode_id),
                    ),
                    Some(target) => match (track_id, node_id) {
                        (Some(t), n) => match target.tracks.iter().find(|tr| &tr.id == t) {
                            None => diags.error(
                                "gateway.unknown_track",
                                &pointer(&apath, "track_id"),
                                format!("track `{}` is not part of mode `{}`", t, mode_id),
                            ),
                            Some(tr) => {
                                if let Some(n) = n {
                                    check_node(tr, n, &pointer(&apath, "node_id"), diags);
                                }
                            }
                        },
                        (None, Some(_)) => diags.error(
                            "gateway.node_without_track",
                            &pointer(&apath, "node_id"),
                            "`node_id` requires `track_id`",
                        ),
                        (None, None) => {}
                    },
                }
                if mode.is_some_and(|m| self.doc.modes[m].id == *mode_id) {
                    diags.info("gateway.switch_to_self", &apath, "switching to the active mode restarts it");
                }
            }
            GatewayAction::JumpNode { node_id } => {
                check_node(own_track, node_id, &pointer(&apath, "node_id"), diags);
                if node_id == &doc.id {
                    diags.warning(
                        "gateway.self_jump",
                        &pointer(&apath, "node_id"),
                        "jumping to itself re-evaluates this gateway every gap until its condition turns false",
                    );
                }
            }
            GatewayAction::JumpTrack { track_id, node_id } => {
                let target = self
                    .doc
                    .global_tracks
                    .iter()
                    .find(|t| &t.id == track_id)
                    .or_else(|| mode.and_then(|m| self.doc.modes[m].tracks.iter().find(|t| &t.id == track_id)));
                match target {
                    Some(t) => {
                        if let Some(n) = node_id {
                            check_node(t, n, &pointer(&apath, "node_id"), diags);
                        }
                    }
                    None => {
                        let exists = self.doc.modes.iter().flat_map(|m| m.tracks.iter()).any(|t| &t.id == track_id);
                        let msg = if exists {
                            format!("track `{}` belongs to another mode and is never active alongside this one", track_id)
                        } else {
                            format!("track `{}` is not declared", track_id)
                        };
                        let code = if exists { "gateway.unreachable_track" } else { "gateway.unknown_track" };
                        diags.error(code, &pointer(&apath, "track_id"), msg);
                    }
                }
            }
            GatewayAction::ExecSkill { skill_id } => {
                self.check_skill(skill_id, &pointer(&apath, "skill_id"), diags);
            }
        }

        if doc.reset_metrics && condition.metric_atoms().is_empty() {
            diags.warning(
                "gateway.reset_nothing",
                &pointer(path, "reset_metrics"),
                "`reset_metrics` is set but the condition has no metric atoms",
            );
        }

        GatewayNode {
            id: doc.id.clone(),
            step: doc.step,
            gap_ms: doc.gap_ms,
            condition,
            action: doc.action.clone(),
            reset_metrics: doc.reset_metrics,
        }
    }
}

fn check_node(track: &TrackDoc, node_id: &str, path: &str, diags: &mut Diagnostics) {
    let found = track.nodes.iter().any(|n| match n {
        NodeDoc::Skill(s) => s.id == node_id,
        NodeDoc::Gateway(g) => g.id == node_id,
    });
    if !found {
        diags.error(
            "gateway.unknown_node",
            path,
            format!("node `{}` is not part of track `{}`", node_id, track.id),
        );
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::catalogue::{PixelProbe, PointDef};
    use crate::types::Rgb;

    fn catalogue() -> Catalogue {
        Catalogue::new()
            .with_skill(SkillDef {
                key: Some("1".into()),
                cast_ms: 1000,
                pixel: Some(PixelProbe { monitor: 0, x: 10, y: 10, color: Rgb(0, 200, 0), tolerance: 10, sample_radius: 1 }),
                cast_bar_point: Some("bar".into()),
                ..SkillDef::new("a")
            })
            .with_skill(SkillDef { key: Some("shift+2".into()), ..SkillDef::new("b") })
            .with_skill(SkillDef { key: None, ..SkillDef::new("keyless") })
            .with_point(PointDef {
                id: "bar".into(),
                monitor: 0,
                x: 500,
                y: 700,
                color: Rgb(0, 0, 0),
                tolerance: 20,
                sample_radius: 2,
            })
    }

    fn doc(v: Value) -> PresetDoc {
        serde_json::from_value(v).expect("preset doc")
    }

    #[test]
    fn compiles_defaults_and_collects_probes() {
        let d = doc(json!({
            "id": "p",
            "default_gap_ms": 250,
            "global_tracks": [{"id": "g", "nodes": [
                {"kind": "skill", "id": "n1", "skill_id": "a", "start": {"mode": "cast_bar"},
                 "completion": {"policy": "require_signal"}},
                {"kind": "skill", "id": "n2", "skill_id": "b", "gap_ms": 10,
                 "ready": {"type": "const", "value": true}}
            ]}]
        }));
        let r = validate_preset(&d, &catalogue());
        assert!(r.is_ok(), "{:?}", r.diagnostics);
        let p = r.preset.unwrap();
        let Node::Skill(n1) = &p.global_tracks[0].nodes[0] else { panic!("skill") };
        assert_eq!(n1.gap_ms, 250);
        assert_eq!(n1.ready, Expr::skill_ready("a"));
        assert_eq!(n1.start.expr, Some(Expr::bar_changed("bar")));
        assert_eq!(n1.completion.expr, Some(Expr::not(Expr::bar_changed("bar"))));
        let Node::Skill(n2) = &p.global_tracks[0].nodes[1] else { panic!("skill") };
        assert_eq!(n2.gap_ms, 10);
        assert_eq!(n2.start.expr, None);
        assert!(r.probes.point_ids.contains("bar"));
        assert!(r.probes.skill_pixel_ids.contains("a"));
        assert!(p.entry_mode.is_none());
    }

    #[test]
    fn every_problem_is_reported_and_blocks_the_preset() {
        let d = doc(json!({
            "id": "p",
            "entry_mode": "nope",
            "global_tracks": [{"id": "g", "nodes": [
                {"kind": "skill", "id": "n1", "skill_id": "ghost"},
                {"kind": "skill", "id": "n1", "skill_id": "keyless"},
                {"kind": "gateway", "id": "gw", "condition": {"type": "pixel_point", "point_id": "zz"},
                 "action": {"type": "jump_node", "node_id": "missing"}}
            ]}],
            "modes": [{"id": "m", "tracks": [{"id": "g", "nodes": []}]}]
        }));
        let r = validate_preset(&d, &catalogue());
        assert!(r.preset.is_none());
        let codes: HashSet<&str> = r.diagnostics.errors().map(|d| d.code).collect();
        for want in [
            "preset.unknown_entry_mode",
            "preset.duplicate_node",
            "preset.duplicate_track",
            "ref.unknown_skill",
            "skill.key_missing",
            "ref.unknown_point",
            "gateway.unknown_node",
        ] {
            assert!(codes.contains(want), "missing {want}: {:?}", r.diagnostics);
        }
    }

    #[test]
    fn gateway_targets_are_checked_per_scope() {
        let d = doc(json!({
            "id": "p",
            "global_tracks": [{"id": "g", "nodes": [
                {"kind": "gateway", "id": "to_mode_track", "condition": {"type": "const", "value": true},
                 "action": {"type": "jump_track", "track_id": "m1t"}},
                {"kind": "gateway", "id": "switch", "condition": {"type": "const", "value": true},
                 "action": {"type": "switch_mode", "mode_id": "m2", "track_id": "m2t", "node_id": "x"}}
            ]}],
            "modes": [
                {"id": "m1", "tracks": [{"id": "m1t", "nodes": [{"kind": "skill", "id": "s", "skill_id": "b"}]}]},
                {"id": "m2", "tracks": [{"id": "m2t", "nodes": [{"kind": "skill", "id": "s", "skill_id": "b"}]}]}
            ]
        }));
        let r = validate_preset(&d, &catalogue());
        let codes: Vec<&str> = r.diagnostics.errors().map(|d| d.code).collect();
        assert_eq!(codes, vec!["gateway.unreachable_track", "gateway.unknown_node"]);
    }

    #[test]
    fn signal_requirements() {
        let d = doc(json!({
            "id": "p",
            "global_tracks": [{"id": "g", "nodes": [
                {"kind": "skill", "id": "n1", "skill_id": "b", "completion": {"policy": "require_signal"}},
                {"kind": "skill", "id": "n2", "skill_id": "b", "start": {"mode": "cast_bar"}},
                {"kind": "skill", "id": "n3", "skill_id": "b", "completion": {"policy": "hybrid", "factor": 0}},
                {"kind": "gateway", "id": "gw", "reset_metrics": true,
                 "condition": {"type": "const", "value": true}, "action": {"type": "end"}}
            ]}]
        }));
        let r = validate_preset(&d, &catalogue());
        let errors: Vec<&str> = r.diagnostics.errors().map(|d| d.code).collect();
        assert_eq!(
            errors,
            vec!["completion.signal_missing", "skill.cast_bar_point_missing", "completion.factor_range"]
        );
        assert_eq!(r.diagnostics.with_code("gateway.reset_nothing").count(), 1);
        assert_eq!(r.diagnostics.with_code("skill.ready_assumed").count(), 3);
    }

    #[test]
    fn pixelless_skills_default_to_ready() {
        let d = doc(json!({
            "id": "p",
            "global_tracks": [{"id": "g", "nodes": [
                {"kind": "skill", "id": "n1", "skill_id": "b"},
                {"kind": "skill", "id": "n2", "skill_id": "b", "start": {"mode": "pixel", "timeout_ms": 200}},
                {"kind": "skill", "id": "n3", "skill_id": "a"}
            ]}]
        }));
        let r = validate_preset(&d, &catalogue());
        assert!(!r.diagnostics.has_errors());
        let preset = r.preset.expect("valid preset");
        let nodes = &preset.global_tracks[0].nodes;
        let ready: Vec<&Expr> = nodes
            .iter()
            .map(|n| match n {
                Node::Skill(s) => &s.ready,
                _ => panic!("expected a skill node"),
            })
            .collect();
        assert_eq!(ready, vec![&Expr::Const(true), &Expr::Const(true), &Expr::skill_ready("a")]);
        assert_eq!(r.diagnostics.with_code("start.pixel_unobservable").count(), 1);
        assert!(!r.probes.skill_pixel_ids.contains("b"));
    }

    #[test]
    fn implicit_entry_mode_and_per_mode_probes() {
        let d = doc(json!({
            "id": "p",
            "global_tracks": [{"id": "g", "nodes": [
                {"kind": "gateway", "id": "gw", "condition": {"type": "pixel_point", "point_id": "bar"},
                 "action": {"type": "switch_mode", "mode_id": "m2"}}
            ]}],
            "modes": [
                {"id": "m1", "tracks": [{"id": "t1", "nodes": [{"kind": "skill", "id": "s", "skill_id": "a"}]}]},
                {"id": "m2", "tracks": [{"id": "t2", "nodes": [{"kind": "skill", "id": "s", "skill_id": "b",
                    "ready": {"type": "const", "value": true}}]}]}
            ]
        }));
        let r = validate_preset(&d, &catalogue());
        let p = r.preset.expect("valid");
        assert_eq!(p.entry_mode, Some(0));
        let m1 = p.probes(&catalogue(), Some(0));
        assert!(m1.skill_pixel_ids.contains("a"));
        let m2 = p.probes(&catalogue(), Some(1));
        assert!(m2.skill_pixel_ids.is_empty());
        assert!(m2.point_ids.contains("bar"));
        assert_eq!(p.locate_track("t2"), Some(TrackLoc::Mode(1, 0)));
        assert_eq!(p.locate_track("g"), Some(TrackLoc::Global(0)));
        assert_eq!(p.node_count(), 3);
    }
}

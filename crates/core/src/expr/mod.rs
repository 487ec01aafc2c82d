//! Condition expressions over screen pixels and execution metrics.
//!
//! An [`Expr`] is decoded from a declarative document ([`codec`]), checked
//! against the catalogue ([`validate`]), mined for capture dependencies
//! ([`probe`]) and evaluated with Kleene three-valued logic ([`eval`]).

pub mod codec;
pub mod eval;
pub mod probe;
pub mod validate;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use codec::{decode, decode_at, encode, Decoded};
pub use eval::{
    BaselineProvider, Evaluation, Evaluator, MetricProvider, NullSampler, PixelSampler, SampleSpec,
};
pub use probe::ProbeRequirements;
pub use validate::validate_expr;

/// Execution counters an expression can threshold on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    AttemptStarted,
    KeySentOk,
    CastStarted,
    Success,
    Fail,
}

impl Metric {
    pub const ALL: [Metric; 5] = [
        Metric::AttemptStarted,
        Metric::KeySentOk,
        Metric::CastStarted,
        Metric::Success,
        Metric::Fail,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::AttemptStarted => "attempt_started",
            Metric::KeySentOk => "key_sent_ok",
            Metric::CastStarted => "cast_started",
            Metric::Success => "success",
            Metric::Fail => "fail",
        }
    }

    pub fn parse(s: &str) -> Option<Metric> {
        Metric::ALL.into_iter().find(|m| m.as_str() == s)
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Boolean condition tree. Immutable once decoded.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Expr {
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Not(Box<Expr>),
    Const(bool),
    /// Sampled colour at a catalogue point matches its target colour.
    PixelMatchPoint { point_id: String, tolerance: Option<u8> },
    /// Sampled colour at a skill's ready indicator matches its target colour.
    PixelMatchSkill { skill_id: String, tolerance: Option<u8> },
    /// Sampled colour at a point moved away from its recorded baseline.
    CastBarChanged { point_id: String, tolerance: Option<u8> },
    SkillMetricGe { skill_id: String, metric: Metric, count: u32 },
}

impl Expr {
    pub fn and(children: Vec<Expr>) -> Expr {
        Expr::And(children)
    }

    pub fn or(children: Vec<Expr>) -> Expr {
        Expr::Or(children)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(child: Expr) -> Expr {
        Expr::Not(Box::new(child))
    }

    pub fn point(point_id: impl Into<String>) -> Expr {
        Expr::PixelMatchPoint { point_id: point_id.into(), tolerance: None }
    }

    pub fn skill_ready(skill_id: impl Into<String>) -> Expr {
        Expr::PixelMatchSkill { skill_id: skill_id.into(), tolerance: None }
    }

    pub fn bar_changed(point_id: impl Into<String>) -> Expr {
        Expr::CastBarChanged { point_id: point_id.into(), tolerance: None }
    }

    pub fn metric_ge(skill_id: impl Into<String>, metric: Metric, count: u32) -> Expr {
        Expr::SkillMetricGe { skill_id: skill_id.into(), metric, count }
    }

    pub fn is_atom(&self) -> bool {
        !matches!(self, Expr::And(_) | Expr::Or(_) | Expr::Not(_) | Expr::Const(_))
    }

    /// Every `(skill, metric)` pair thresholded anywhere in the tree, in
    /// first-seen order without duplicates.
    pub fn metric_atoms(&self) -> Vec<(String, Metric)> {
        let mut out = Vec::new();
        self.collect_metric_atoms(&mut out);
        out
    }

    /// Points read by `CastBarChanged` atoms, in first-seen order without
    /// duplicates. Each needs a baseline before it can be evaluated.
    pub fn bar_points(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_bar_points(&mut out);
        out
    }

    fn collect_bar_points(&self, out: &mut Vec<String>) {
        match self {
            Expr::And(children) | Expr::Or(children) => {
                for c in children {
                    c.collect_bar_points(out);
                }
            }
            Expr::Not(child) => child.collect_bar_points(out),
            Expr::CastBarChanged { point_id, .. } => {
                if !out.contains(point_id) {
                    out.push(point_id.clone());
                }
            }
            Expr::Const(_)
            | Expr::PixelMatchPoint { .. }
            | Expr::PixelMatchSkill { .. }
            | Expr::SkillMetricGe { .. } => {}
        }
    }

    fn collect_metric_atoms(&self, out: &mut Vec<(String, Metric)>) {
        match self {
            Expr::And(children) | Expr::Or(children) => {
                for c in children {
                    c.collect_metric_atoms(out);
                }
            }
            Expr::Not(child) => child.collect_metric_atoms(out),
            Expr::SkillMetricGe { skill_id, metric, .. } => {
                if !out.iter().any(|(s, m)| s == skill_id && m == metric) {
                    out.push((skill_id.clone(), *metric));
                }
            }
            Expr::Const(_)
            | Expr::PixelMatchPoint { .. }
            | Expr::PixelMatchSkill { .. }
            | Expr::CastBarChanged { .. } => {}
        }
    }
}

/// Three-valued truth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tri {
    True,
    False,
    Unknown,
}

impl Tri {
    pub fn from_bool(b: bool) -> Tri {
        if b {
            Tri::True
        } else {
            Tri::False
        }
    }

    pub fn and(self, other: Tri) -> Tri {
        match (self, other) {
            (Tri::False, _) | (_, Tri::False) => Tri::False,
            (Tri::Unknown, _) | (_, Tri::Unknown) => Tri::Unknown,
            _ => Tri::True,
        }
    }

    pub fn or(self, other: Tri) -> Tri {
        match (self, other) {
            (Tri::True, _) | (_, Tri::True) => Tri::True,
            (Tri::Unknown, _) | (_, Tri::Unknown) => Tri::Unknown,
            _ => Tri::False,
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(self) -> Tri {
        match self {
            Tri::True => Tri::False,
            Tri::False => Tri::True,
            Tri::Unknown => Tri::Unknown,
        }
    }

    pub fn is_true(self) -> bool {
        self == Tri::True
    }

    pub fn is_known(self) -> bool {
        self != Tri::Unknown
    }
}

impl fmt::Display for Tri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Tri::True => "true",
            Tri::False => "false",
            Tri::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

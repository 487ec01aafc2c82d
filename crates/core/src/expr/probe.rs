use std::collections::BTreeSet;

use super::Expr;

/// Identifiers an expression depends on. Pixel-bearing sets drive capture
/// planning; metric ids only document the feedback dependency.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeRequirements {
    pub point_ids: BTreeSet<String>,
    pub skill_pixel_ids: BTreeSet<String>,
    pub skill_metric_ids: BTreeSet<String>,
}

impl ProbeRequirements {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn of(expr: &Expr) -> Self {
        let mut req = Self::default();
        req.add(expr);
        req
    }

    /// Fold the dependencies of `expr` into `self`.
    pub fn add(&mut self, expr: &Expr) {
        match expr {
            Expr::And(children) | Expr::Or(children) => {
                for c in children {
                    self.add(c);
                }
            }
            Expr::Not(child) => self.add(child),
            Expr::Const(_) => {}
            Expr::PixelMatchPoint { point_id, .. } | Expr::CastBarChanged { point_id, .. } => {
                self.point_ids.insert(point_id.clone());
            }
            Expr::PixelMatchSkill { skill_id, .. } => {
                self.skill_pixel_ids.insert(skill_id.clone());
            }
            Expr::SkillMetricGe { skill_id, .. } => {
                self.skill_metric_ids.insert(skill_id.clone());
            }
        }
    }

    pub fn merge(&mut self, other: &ProbeRequirements) {
        self.point_ids.extend(other.point_ids.iter().cloned());
        self.skill_pixel_ids.extend(other.skill_pixel_ids.iter().cloned());
        self.skill_metric_ids.extend(other.skill_metric_ids.iter().cloned());
    }

    pub fn is_empty(&self) -> bool {
        self.point_ids.is_empty() && self.skill_pixel_ids.is_empty() && self.skill_metric_ids.is_empty()
    }

    /// True when both require the same screen samples. Metric ids do not
    /// influence capture.
    pub fn same_pixels(&self, other: &ProbeRequirements) -> bool {
        self.point_ids == other.point_ids && self.skill_pixel_ids == other.skill_pixel_ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::Metric;

    fn set(ids: &[&str]) -> BTreeSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn pixel_and_metric_atoms_land_in_their_sets() {
        let e = Expr::and(vec![Expr::point("p1"), Expr::metric_ge("s1", Metric::Success, 1)]);
        let p = ProbeRequirements::of(&e);
        assert_eq!(p.point_ids, set(&["p1"]));
        assert!(p.skill_pixel_ids.is_empty());
        assert_eq!(p.skill_metric_ids, set(&["s1"]));
    }

    #[test]
    fn nested_atoms_and_merge() {
        let e = Expr::or(vec![
            Expr::not(Expr::skill_ready("s2")),
            Expr::and(vec![Expr::bar_changed("bar"), Expr::Const(true)]),
        ]);
        let mut p = ProbeRequirements::of(&e);
        assert_eq!(p.point_ids, set(&["bar"]));
        assert_eq!(p.skill_pixel_ids, set(&["s2"]));

        let other = ProbeRequirements::of(&Expr::and(vec![Expr::point("p9"), Expr::skill_ready("s2")]));
        p.merge(&other);
        assert_eq!(p.point_ids, set(&["bar", "p9"]));
        assert_eq!(p.skill_pixel_ids, set(&["s2"]));
    }

    #[test]
    fn metric_only_changes_do_not_affect_pixels() {
        let a = ProbeRequirements::of(&Expr::point("p"));
        let b = ProbeRequirements::of(&Expr::and(vec![Expr::point("p"), Expr::metric_ge("x", Metric::Fail, 1)]));
        assert!(a.same_pixels(&b));
        assert_ne!(a, b);
        assert!(ProbeRequirements::of(&Expr::Const(true)).is_empty());
    }
}

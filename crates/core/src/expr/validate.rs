use super::Expr;
use crate::catalogue::Catalogue;
use crate::diag::{pointer, Diagnostics};

/// Check a decoded expression against the catalogue.
///
/// Errors: blank or dangling identifiers, `count < 1`. Warnings: atoms that can never
/// evaluate to a known value and groups that can never be satisfied.
/// Tolerance range and metric names are already enforced by decoding.
pub fn validate_expr(expr: &Expr, catalogue: &Catalogue, path: &str, diags: &mut Diagnostics) {
    match expr {
        Expr::And(children) => {
            if children.iter().any(|c| matches!(c, Expr::Const(false))) {
                diags.warning("expr.unsatisfiable", path, "`and` contains `const false`; it can never be true");
            }
            validate_children(children, catalogue, path, diags);
        }
        Expr::Or(children) => {
            if children.iter().any(|c| matches!(c, Expr::Const(true))) {
                diags.warning("expr.tautology", path, "`or` contains `const true`; it is always true");
            }
            validate_children(children, catalogue, path, diags);
        }
        Expr::Not(child) => validate_expr(child, catalogue, &pointer(path, "child"), diags),
        Expr::Const(_) => {}
        Expr::PixelMatchPoint { point_id, .. } | Expr::CastBarChanged { point_id, .. } => {
            if blank_id(point_id, "point_id", path, diags) {
                return;
            }
            if catalogue.point(point_id).is_none() {
                diags.error(
                    "ref.unknown_point",
                    &pointer(path, "point_id"),
                    format!("point `{}` is not defined", point_id),
                );
            }
        }
        Expr::PixelMatchSkill { skill_id, .. } if blank_id(skill_id, "skill_id", path, diags) => {}
        Expr::PixelMatchSkill { skill_id, .. } => match catalogue.skill(skill_id) {
            None => diags.error(
                "ref.unknown_skill",
                &pointer(path, "skill_id"),
                format!("skill `{}` is not defined", skill_id),
            ),
            Some(skill) if skill.pixel.is_none() => diags.warning(
                "expr.skill_pixel_missing",
                &pointer(path, "skill_id"),
                format!("skill `{}` has no pixel definition; this atom is always unknown", skill_id),
            ),
            Some(_) => {}
        },
        Expr::SkillMetricGe { skill_id, count, .. } => {
            if !blank_id(skill_id, "skill_id", path, diags) && catalogue.skill(skill_id).is_none() {
                diags.error(
                    "ref.unknown_skill",
                    &pointer(path, "skill_id"),
                    format!("skill `{}` is not defined", skill_id),
                );
            }
            if *count < 1 {
                diags.error("expr.count_range", &pointer(path, "count"), "count must be at least 1");
            }
        }
    }
}

fn blank_id(id: &str, key: &str, path: &str, diags: &mut Diagnostics) -> bool {
    let blank = id.trim().is_empty();
    if blank {
        diags.error("expr.blank_id", &pointer(path, key), format!("`{}` must not be empty", key));
    }
    blank
}

fn validate_children(children: &[Expr], catalogue: &Catalogue, path: &str, diags: &mut Diagnostics) {
    let base = pointer(path, "children");
    for (i, c) in children.iter().enumerate() {
        validate_expr(c, catalogue, &pointer(&base, i), diags);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalogue::{PixelProbe, PointDef, SkillDef};
    use crate::expr::Metric;
    use crate::types::Rgb;

    fn catalogue() -> Catalogue {
        Catalogue::new()
            .with_skill(SkillDef {
                pixel: Some(PixelProbe { monitor: 0, x: 1, y: 1, color: Rgb(1, 2, 3), tolerance: 5, sample_radius: 0 }),
                ..SkillDef::new("bolt")
            })
            .with_skill(SkillDef::new("blind"))
            .with_point(PointDef {
                id: "bar".into(),
                monitor: 0,
                x: 5,
                y: 5,
                color: Rgb(0, 0, 0),
                tolerance: 10,
                sample_radius: 1,
            })
    }

    fn run(e: &Expr) -> Diagnostics {
        let mut d = Diagnostics::new();
        validate_expr(e, &catalogue(), "", &mut d);
        d
    }

    #[test]
    fn valid_expression_is_clean() {
        let e = Expr::and(vec![Expr::skill_ready("bolt"), Expr::bar_changed("bar"), Expr::metric_ge("bolt", Metric::Success, 1)]);
        assert!(run(&e).is_empty());
    }

    #[test]
    fn dangling_references_are_errors_with_paths() {
        let e = Expr::or(vec![Expr::point("nope"), Expr::not(Expr::metric_ge("ghost", Metric::Fail, 0))]);
        let d = run(&e);
        let found: Vec<(&str, &str)> = d.errors().map(|x| (x.code, x.path.as_str())).collect();
        assert_eq!(
            found,
            vec![
                ("ref.unknown_point", "/children/0/point_id"),
                ("ref.unknown_skill", "/children/1/child/skill_id"),
                ("expr.count_range", "/children/1/child/count"),
            ]
        );
    }

    #[test]
    fn unsatisfiable_configurations_warn() {
        let d = run(&Expr::and(vec![Expr::skill_ready("blind"), Expr::Const(false)]));
        assert!(!d.has_errors());
        assert_eq!(d.with_code("expr.skill_pixel_missing").count(), 1);
        assert_eq!(d.with_code("expr.unsatisfiable").count(), 1);
    }

    #[test]
    fn blank_ids_are_reported_once() {
        let e = Expr::and(vec![Expr::point(" "), Expr::skill_ready(""), Expr::metric_ge("", Metric::Success, 1)]);
        let d = run(&e);
        let found: Vec<(&str, &str)> = d.errors().map(|x| (x.code, x.path.as_str())).collect();
        assert_eq!(
            found,
            vec![
                ("expr.blank_id", "/children/0/point_id"),
                ("expr.blank_id", "/children/1/skill_id"),
                ("expr.blank_id", "/children/2/skill_id"),
            ]
        );
    }
}

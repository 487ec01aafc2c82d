//! Three-valued evaluation against injected capabilities.

use super::{Expr, Metric, Tri};
use crate::catalogue::Catalogue;
use crate::types::{MonitorId, Rgb, Unavailable};

/// How many pixels to average around a coordinate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SampleSpec {
    pub radius: u32,
}

pub trait PixelSampler: Send + Sync {
    fn sample(&self, monitor: MonitorId, x: i32, y: i32, spec: SampleSpec) -> Result<Rgb, Unavailable>;
}

pub trait MetricProvider: Send + Sync {
    fn get_metric(&self, skill_id: &str, metric: Metric) -> Result<u64, Unavailable>;
}

pub trait BaselineProvider: Send + Sync {
    fn get_baseline(&self, point_id: &str) -> Result<Rgb, Unavailable>;
}

/// Sampler that never sees anything. Every pixel atom is `Unknown`.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSampler;

impl PixelSampler for NullSampler {
    fn sample(&self, _monitor: MonitorId, _x: i32, _y: i32, _spec: SampleSpec) -> Result<Rgb, Unavailable> {
        Err(Unavailable::new("sampler_offline", "no pixel source attached"))
    }
}

/// Truth value plus, for `Unknown`, the first machine-readable cause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evaluation {
    pub value: Tri,
    pub reason: Option<String>,
}

impl Evaluation {
    fn known(value: bool) -> Self {
        Self { value: Tri::from_bool(value), reason: None }
    }

    fn unknown(reason: impl Into<String>) -> Self {
        Self { value: Tri::Unknown, reason: Some(reason.into()) }
    }

    pub fn is_true(&self) -> bool {
        self.value.is_true()
    }
}

pub struct Evaluator<'a> {
    catalogue: &'a Catalogue,
    pixels: &'a dyn PixelSampler,
    metrics: Option<&'a dyn MetricProvider>,
    baselines: Option<&'a dyn BaselineProvider>,
}

impl<'a> Evaluator<'a> {
    pub fn new(catalogue: &'a Catalogue, pixels: &'a dyn PixelSampler) -> Self {
        Self { catalogue, pixels, metrics: None, baselines: None }
    }

    pub fn with_metrics(mut self, metrics: &'a dyn MetricProvider) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_baselines(mut self, baselines: &'a dyn BaselineProvider) -> Self {
        self.baselines = Some(baselines);
        self
    }

    pub fn eval(&self, expr: &Expr) -> Evaluation {
        match expr {
            Expr::Const(b) => Evaluation::known(*b),
            Expr::Not(child) => {
                let inner = self.eval(child);
                Evaluation { value: inner.value.not(), reason: inner.reason }
            }
            Expr::And(children) => self.fold(children, Tri::False),
            Expr::Or(children) => self.fold(children, Tri::True),
            Expr::PixelMatchPoint { point_id, tolerance } => {
                let Some(point) = self.catalogue.point(point_id) else {
                    return Evaluation::unknown("point_not_found");
                };
                let spec = SampleSpec { radius: point.sample_radius };
                match self.pixels.sample(point.monitor, point.x, point.y, spec) {
                    Ok(c) => Evaluation::known(c.within(&point.color, tolerance.unwrap_or(point.tolerance))),
                    Err(u) => Evaluation::unknown(u.code),
                }
            }
            Expr::PixelMatchSkill { skill_id, tolerance } => {
                let Some(skill) = self.catalogue.skill(skill_id) else {
                    return Evaluation::unknown("skill_not_found");
                };
                let Some(px) = skill.pixel.as_ref() else {
                    return Evaluation::unknown("skill_pixel_missing");
                };
                let spec = SampleSpec { radius: px.sample_radius };
                match self.pixels.sample(px.monitor, px.x, px.y, spec) {
                    Ok(c) => Evaluation::known(c.within(&px.color, tolerance.unwrap_or(px.tolerance))),
                    Err(u) => Evaluation::unknown(u.code),
                }
            }
            Expr::CastBarChanged { point_id, tolerance } => {
                let Some(point) = self.catalogue.point(point_id) else {
                    return Evaluation::unknown("point_not_found");
                };
                let Some(baselines) = self.baselines else {
                    return Evaluation::unknown("baseline_provider_missing");
                };
                let base = match baselines.get_baseline(point_id) {
                    Ok(b) => b,
                    Err(u) => return Evaluation::unknown(u.code),
                };
                let spec = SampleSpec { radius: point.sample_radius };
                match self.pixels.sample(point.monitor, point.x, point.y, spec) {
                    Ok(c) => Evaluation::known(!c.within(&base, tolerance.unwrap_or(point.tolerance))),
                    Err(u) => Evaluation::unknown(u.code),
                }
            }
            Expr::SkillMetricGe { skill_id, metric, count } => {
                let Some(metrics) = self.metrics else {
                    return Evaluation::unknown("metric_provider_missing");
                };
                match metrics.get_metric(skill_id, *metric) {
                    Ok(n) => Evaluation::known(n >= *count as u64),
                    Err(u) => Evaluation::unknown(u.code),
                }
            }
        }
    }

    /// Kleene fold. `dominant` is the value that decides the group on sight
    /// (`False` for AND, `True` for OR).
    fn fold(&self, children: &[Expr], dominant: Tri) -> Evaluation {
        let mut first_unknown: Option<Option<String>> = None;
        for c in children {
            let r = self.eval(c);
            if r.value == dominant {
                return Evaluation { value: dominant, reason: None };
            }
            if r.value == Tri::Unknown && first_unknown.is_none() {
                first_unknown = Some(r.reason);
            }
        }
        match first_unknown {
            Some(reason) => Evaluation { value: Tri::Unknown, reason },
            None => Evaluation { value: dominant.not(), reason: None },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::catalogue::{PixelProbe, PointDef, SkillDef};

    struct FixedSampler {
        colors: HashMap<(i32, i32), Rgb>,
        calls: AtomicUsize,
    }

    impl FixedSampler {
        fn new(colors: &[((i32, i32), Rgb)]) -> Self {
            Self { colors: colors.iter().cloned().collect(), calls: AtomicUsize::new(0) }
        }
    }

    impl PixelSampler for FixedSampler {
        fn sample(&self, _m: MonitorId, x: i32, y: i32, _s: SampleSpec) -> Result<Rgb, Unavailable> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.colors.get(&(x, y)).copied().ok_or_else(|| Unavailable::new("out_of_region", ""))
        }
    }

    struct Counts(HashMap<(String, Metric), u64>);

    impl MetricProvider for Counts {
        fn get_metric(&self, skill_id: &str, metric: Metric) -> Result<u64, Unavailable> {
            Ok(self.0.get(&(skill_id.to_string(), metric)).copied().unwrap_or(0))
        }
    }

    struct Baselines(HashMap<String, Rgb>);

    impl BaselineProvider for Baselines {
        fn get_baseline(&self, point_id: &str) -> Result<Rgb, Unavailable> {
            self.0.get(point_id).copied().ok_or_else(|| Unavailable::new("baseline_missing", point_id))
        }
    }

    fn catalogue() -> Catalogue {
        Catalogue::new()
            .with_point(PointDef {
                id: "hp".into(),
                monitor: 0,
                x: 1,
                y: 1,
                color: Rgb(200, 0, 0),
                tolerance: 10,
                sample_radius: 0,
            })
            .with_point(PointDef {
                id: "bar".into(),
                monitor: 0,
                x: 2,
                y: 2,
                color: Rgb(0, 0, 0),
                tolerance: 10,
                sample_radius: 0,
            })
            .with_skill(SkillDef {
                pixel: Some(PixelProbe { monitor: 0, x: 3, y: 3, color: Rgb(0, 255, 0), tolerance: 4, sample_radius: 0 }),
                ..SkillDef::new("bolt")
            })
            .with_skill(SkillDef::new("blind"))
    }

    #[test]
    fn pixel_atoms_use_catalogue_tolerance_unless_overridden() {
        let cat = catalogue();
        let px = FixedSampler::new(&[((1, 1), Rgb(195, 5, 0)), ((3, 3), Rgb(0, 250, 0))]);
        let ev = Evaluator::new(&cat, &px);
        assert!(ev.eval(&Expr::point("hp")).is_true());
        let strict = Expr::PixelMatchPoint { point_id: "hp".into(), tolerance: Some(2) };
        assert_eq!(ev.eval(&strict).value, Tri::False);
        assert_eq!(ev.eval(&Expr::skill_ready("bolt")).value, Tri::False);
        let loose = Expr::PixelMatchSkill { skill_id: "bolt".into(), tolerance: Some(5) };
        assert!(ev.eval(&loose).is_true());
    }

    #[test]
    fn unavailable_sources_become_unknown_with_reason() {
        let cat = catalogue();
        let px = FixedSampler::new(&[]);
        let ev = Evaluator::new(&cat, &px);
        let r = ev.eval(&Expr::point("hp"));
        assert_eq!(r.value, Tri::Unknown);
        assert_eq!(r.reason.as_deref(), Some("out_of_region"));
        assert_eq!(ev.eval(&Expr::skill_ready("blind")).reason.as_deref(), Some("skill_pixel_missing"));
        assert_eq!(ev.eval(&Expr::point("nope")).reason.as_deref(), Some("point_not_found"));
        assert_eq!(
            ev.eval(&Expr::metric_ge("bolt", Metric::Success, 1)).reason.as_deref(),
            Some("metric_provider_missing")
        );
        assert_eq!(ev.eval(&Expr::bar_changed("bar")).reason.as_deref(), Some("baseline_provider_missing"));
    }

    #[test]
    fn and_short_circuits_on_false() {
        let cat = catalogue();
        let px = FixedSampler::new(&[((1, 1), Rgb(200, 0, 0))]);
        let ev = Evaluator::new(&cat, &px);
        let e = Expr::and(vec![Expr::Const(false), Expr::point("hp"), Expr::point("hp")]);
        assert_eq!(ev.eval(&e).value, Tri::False);
        assert_eq!(px.calls.load(Ordering::SeqCst), 0);

        // unknown does not stop evaluation; a later false still wins
        let e = Expr::and(vec![Expr::point("bar"), Expr::Const(false)]);
        assert_eq!(ev.eval(&e), Evaluation { value: Tri::False, reason: None });
    }

    #[test]
    fn groups_report_first_unknown_reason() {
        let cat = catalogue();
        let px = FixedSampler::new(&[((1, 1), Rgb(200, 0, 0))]);
        let ev = Evaluator::new(&cat, &px);
        let e = Expr::or(vec![Expr::Const(false), Expr::skill_ready("blind"), Expr::point("bar")]);
        let r = ev.eval(&e);
        assert_eq!(r.value, Tri::Unknown);
        assert_eq!(r.reason.as_deref(), Some("skill_pixel_missing"));
        assert!(ev.eval(&Expr::or(vec![Expr::point("bar"), Expr::point("hp")])).is_true());
        assert!(ev.eval(&Expr::and(vec![])).is_true());
        assert_eq!(ev.eval(&Expr::or(vec![])).value, Tri::False);
        assert_eq!(ev.eval(&Expr::not(Expr::point("bar"))).value, Tri::Unknown);
    }

    #[test]
    fn metric_and_baseline_atoms() {
        let cat = catalogue();
        let px = FixedSampler::new(&[((2, 2), Rgb(90, 90, 90))]);
        let counts = Counts([(("bolt".to_string(), Metric::Success), 2)].into_iter().collect());
        let bases = Baselines([("bar".to_string(), Rgb(0, 0, 0))].into_iter().collect());
        let ev = Evaluator::new(&cat, &px).with_metrics(&counts).with_baselines(&bases);
        assert!(ev.eval(&Expr::metric_ge("bolt", Metric::Success, 2)).is_true());
        assert_eq!(ev.eval(&Expr::metric_ge("bolt", Metric::Success, 3)).value, Tri::False);
        assert_eq!(ev.eval(&Expr::metric_ge("other", Metric::Fail, 1)).value, Tri::False);
        assert!(ev.eval(&Expr::bar_changed("bar")).is_true());

        let still = Baselines([("bar".to_string(), Rgb(88, 92, 90))].into_iter().collect());
        let ev = Evaluator::new(&cat, &px).with_baselines(&still);
        assert_eq!(ev.eval(&Expr::bar_changed("bar")).value, Tri::False);
    }

    #[test]
    fn null_sampler_is_always_unknown() {
        let cat = catalogue();
        let ev = Evaluator::new(&cat, &NullSampler);
        let r = ev.eval(&Expr::skill_ready("bolt"));
        assert_eq!(r.value, Tri::Unknown);
        assert_eq!(r.reason.as_deref(), Some("sampler_offline"));
    }
}

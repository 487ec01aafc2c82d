//! Wire form of [`Expr`]: a JSON tree with a `type` discriminator.
//!
//! ```json
//! {"type": "and", "children": [
//!     {"type": "pixel_skill", "skill_id": "fireball"},
//!     {"type": "not", "child": {"type": "skill_metric_ge",
//!                               "skill_id": "fireball", "metric": "success", "count": 2}}
//! ]}
//! ```

use serde_json::{json, Map, Value};

use super::{Expr, Metric};
use crate::diag::{pointer, Diagnostics};

/// Result of decoding one expression document.
///
/// `expr` is `None` only when the root itself could not be decoded. Group
/// nodes drop children that failed to decode; the matching errors are in
/// `diagnostics`, so a partially decoded tree never reaches execution.
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded {
    pub expr: Option<Expr>,
    pub diagnostics: Diagnostics,
}

impl Decoded {
    pub fn is_ok(&self) -> bool {
        self.expr.is_some() && !self.diagnostics.has_errors()
    }
}

pub fn decode(value: &Value) -> Decoded {
    let mut diagnostics = Diagnostics::new();
    let expr = decode_at(value, "", &mut diagnostics);
    Decoded { expr, diagnostics }
}

/// Decode a subtree located at `path`, appending findings to `diags`.
pub fn decode_at(value: &Value, path: &str, diags: &mut Diagnostics) -> Option<Expr> {
    let Some(obj) = value.as_object() else {
        diags.error("expr.not_object", path, format!("expected an object, found {}", kind_of(value)));
        return None;
    };
    let kind = match obj.get("type") {
        Some(Value::String(s)) => s.to_ascii_lowercase(),
        Some(other) => {
            diags.error(
                "expr.missing_type",
                &pointer(path, "type"),
                format!("`type` must be a string, found {}", kind_of(other)),
            );
            return None;
        }
        None => {
            diags.error("expr.missing_type", path, "missing `type`");
            return None;
        }
    };

    let expr = match kind.as_str() {
        "and" | "or" => {
            check_fields(obj, path, &["children"], diags);
            let children = decode_children(obj, path, diags)?;
            if children.is_empty() && !had_children(obj) {
                let meaning = if kind == "and" { "always true" } else { "always false" };
                diags.warning("expr.empty_group", path, format!("empty `{}` is {}", kind, meaning));
            }
            if kind == "and" {
                Expr::And(children)
            } else {
                Expr::Or(children)
            }
        }
        "not" => {
            check_fields(obj, path, &["child"], diags);
            let Some(child) = obj.get("child") else {
                diags.error("expr.missing_field", path, "`not` requires `child`");
                return None;
            };
            Expr::Not(Box::new(decode_at(child, &pointer(path, "child"), diags)?))
        }
        "const" => {
            check_fields(obj, path, &["value"], diags);
            match obj.get("value") {
                Some(Value::Bool(b)) => Expr::Const(*b),
                Some(other) => {
                    diags.error(
                        "expr.invalid_field",
                        &pointer(path, "value"),
                        format!("`value` must be a boolean, found {}", kind_of(other)),
                    );
                    return None;
                }
                None => {
                    diags.error("expr.missing_field", path, "`const` requires `value`");
                    return None;
                }
            }
        }
        "pixel_point" => {
            check_fields(obj, path, &["point_id", "tolerance"], diags);
            let point_id = id_field(obj, "point_id", path, diags);
            let tolerance = tolerance_field(obj, path, diags);
            Expr::PixelMatchPoint { point_id: point_id?, tolerance: tolerance? }
        }
        "pixel_skill" => {
            check_fields(obj, path, &["skill_id", "tolerance"], diags);
            let skill_id = id_field(obj, "skill_id", path, diags);
            let tolerance = tolerance_field(obj, path, diags);
            Expr::PixelMatchSkill { skill_id: skill_id?, tolerance: tolerance? }
        }
        "cast_bar_changed" => {
            check_fields(obj, path, &["point_id", "tolerance"], diags);
            let point_id = id_field(obj, "point_id", path, diags);
            let tolerance = tolerance_field(obj, path, diags);
            Expr::CastBarChanged { point_id: point_id?, tolerance: tolerance? }
        }
        "skill_metric_ge" => {
            check_fields(obj, path, &["skill_id", "metric", "count"], diags);
            let skill_id = id_field(obj, "skill_id", path, diags);
            let metric = metric_field(obj, path, diags);
            let count = count_field(obj, path, diags);
            Expr::SkillMetricGe { skill_id: skill_id?, metric: metric?, count: count? }
        }
        other => {
            diags.error(
                "expr.unknown_type",
                &pointer(path, "type"),
                format!("unknown expression type `{}`", other),
            );
            return None;
        }
    };
    Some(expr)
}

pub fn encode(expr: &Expr) -> Value {
    match expr {
        Expr::And(children) => json!({"type": "and", "children": children.iter().map(encode).collect::<Vec<_>>()}),
        Expr::Or(children) => json!({"type": "or", "children": children.iter().map(encode).collect::<Vec<_>>()}),
        Expr::Not(child) => json!({"type": "not", "child": encode(child)}),
        Expr::Const(b) => json!({"type": "const", "value": b}),
        Expr::PixelMatchPoint { point_id, tolerance } => {
            with_tolerance(json!({"type": "pixel_point", "point_id": point_id}), *tolerance)
        }
        Expr::PixelMatchSkill { skill_id, tolerance } => {
            with_tolerance(json!({"type": "pixel_skill", "skill_id": skill_id}), *tolerance)
        }
        Expr::CastBarChanged { point_id, tolerance } => {
            with_tolerance(json!({"type": "cast_bar_changed", "point_id": point_id}), *tolerance)
        }
        Expr::SkillMetricGe { skill_id, metric, count } => json!({
            "type": "skill_metric_ge",
            "skill_id": skill_id,
            "metric": metric.as_str(),
            "count": count,
        }),
    }
}

fn with_tolerance(mut v: Value, tolerance: Option<u8>) -> Value {
    if let (Some(t), Some(obj)) = (tolerance, v.as_object_mut()) {
        obj.insert("tolerance".into(), json!(t));
    }
    v
}

fn decode_children(obj: &Map<String, Value>, path: &str, diags: &mut Diagnostics) -> Option<Vec<Expr>> {
    let list_path = pointer(path, "children");
    match obj.get("children") {
        Some(Value::Array(items)) => Some(
            items
                .iter()
                .enumerate()
                .filter_map(|(i, item)| decode_at(item, &pointer(&list_path, i), diags))
                .collect(),
        ),
        Some(other) => {
            diags.error(
                "expr.invalid_field",
                &list_path,
                format!("`children` must be an array, found {}", kind_of(other)),
            );
            None
        }
        None => {
            diags.error("expr.missing_field", path, "group requires `children`");
            None
        }
    }
}

fn had_children(obj: &Map<String, Value>) -> bool {
    matches!(obj.get("children"), Some(Value::Array(items)) if !items.is_empty())
}

fn check_fields(obj: &Map<String, Value>, path: &str, known: &[&str], diags: &mut Diagnostics) {
    for key in obj.keys() {
        if key != "type" && !known.contains(&key.as_str()) {
            diags.info("expr.unknown_field", &pointer(path, key), format!("ignoring unknown field `{}`", key));
        }
    }
}

fn id_field(obj: &Map<String, Value>, key: &str, path: &str, diags: &mut Diagnostics) -> Option<String> {
    match obj.get(key) {
        // blank ids decode; validation reports them against the catalogue
        Some(Value::String(s)) => Some(s.clone()),
        Some(other) => {
            diags.error(
                "expr.invalid_field",
                &pointer(path, key),
                format!("`{}` must be a string, found {}", key, kind_of(other)),
            );
            None
        }
        None => {
            diags.error("expr.missing_field", path, format!("missing `{}`", key));
            None
        }
    }
}

/// `Some(None)` when the field is absent (catalogue tolerance applies).
fn tolerance_field(obj: &Map<String, Value>, path: &str, diags: &mut Diagnostics) -> Option<Option<u8>> {
    let Some(v) = obj.get("tolerance") else {
        return Some(None);
    };
    if v.is_null() {
        return Some(None);
    }
    match v.as_i64() {
        Some(t) if (0..=255).contains(&t) => Some(Some(t as u8)),
        Some(t) => {
            diags.error(
                "expr.tolerance_range",
                &pointer(path, "tolerance"),
                format!("tolerance {} outside [0, 255]", t),
            );
            None
        }
        None => {
            diags.error(
                "expr.invalid_field",
                &pointer(path, "tolerance"),
                format!("tolerance must be an integer, found {}", kind_of(v)),
            );
            None
        }
    }
}

fn metric_field(obj: &Map<String, Value>, path: &str, diags: &mut Diagnostics) -> Option<Metric> {
    match obj.get("metric") {
        Some(Value::String(s)) => match Metric::parse(s) {
            Some(m) => Some(m),
            None => {
                let allowed: Vec<&str> = Metric::ALL.iter().map(|m| m.as_str()).collect();
                diags.error(
                    "expr.unknown_metric",
                    &pointer(path, "metric"),
                    format!("unknown metric `{}` (expected one of {})", s, allowed.join(", ")),
                );
                None
            }
        },
        Some(other) => {
            diags.error(
                "expr.invalid_field",
                &pointer(path, "metric"),
                format!("`metric` must be a string, found {}", kind_of(other)),
            );
            None
        }
        None => {
            diags.error("expr.missing_field", path, "missing `metric`");
            None
        }
    }
}

fn count_field(obj: &Map<String, Value>, path: &str, diags: &mut Diagnostics) -> Option<u32> {
    let Some(v) = obj.get("count") else {
        diags.error("expr.missing_field", path, "missing `count`");
        return None;
    };
    match v.as_i64() {
        Some(n) if n >= 0 && n <= u32::MAX as i64 => Some(n as u32),
        Some(n) => {
            diags.error("expr.count_range", &pointer(path, "count"), format!("count {} out of range", n));
            None
        }
        None => {
            diags.error(
                "expr.invalid_field",
                &pointer(path, "count"),
                format!("`count` must be an integer, found {}", kind_of(v)),
            );
            None
        }
    }
}

fn kind_of(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

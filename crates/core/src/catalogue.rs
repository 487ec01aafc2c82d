use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::{MonitorId, Rgb};

pub const DEFAULT_TOLERANCE: u8 = 12;

fn default_tolerance() -> u8 {
    DEFAULT_TOLERANCE
}

fn default_true() -> bool {
    true
}

/// A named screen sample point with its expected colour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointDef {
    pub id: String,
    #[serde(default)]
    pub monitor: MonitorId,
    pub x: i32,
    pub y: i32,
    pub color: Rgb,
    #[serde(default = "default_tolerance")]
    pub tolerance: u8,
    #[serde(default)]
    pub sample_radius: u32,
}

/// Where a skill's "ready" indicator lives on screen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PixelProbe {
    #[serde(default)]
    pub monitor: MonitorId,
    pub x: i32,
    pub y: i32,
    pub color: Rgb,
    #[serde(default = "default_tolerance")]
    pub tolerance: u8,
    #[serde(default)]
    pub sample_radius: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkillDef {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Key chord sent to trigger the skill, e.g. `"shift+2"`.
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub cast_ms: u64,
    #[serde(default)]
    pub cooldown_ms: u64,
    #[serde(default)]
    pub pixel: Option<PixelProbe>,
    /// Point watched for cast-bar start detection.
    #[serde(default)]
    pub cast_bar_point: Option<String>,
}

impl SkillDef {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            enabled: true,
            key: None,
            cast_ms: 0,
            cooldown_ms: 0,
            pixel: None,
            cast_bar_point: None,
        }
    }

    pub fn label(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CatalogueDoc {
    #[serde(default)]
    skills: Vec<SkillDef>,
    #[serde(default)]
    points: Vec<PointDef>,
}

/// Read-only lookup of skills and points by identifier.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "CatalogueDoc", into = "CatalogueDoc")]
pub struct Catalogue {
    skills: BTreeMap<String, SkillDef>,
    points: BTreeMap<String, PointDef>,
}

impl From<CatalogueDoc> for Catalogue {
    fn from(doc: CatalogueDoc) -> Self {
        let mut cat = Catalogue::default();
        for s in doc.skills {
            cat.insert_skill(s);
        }
        for p in doc.points {
            cat.insert_point(p);
        }
        cat
    }
}

impl From<Catalogue> for CatalogueDoc {
    fn from(cat: Catalogue) -> Self {
        CatalogueDoc {
            skills: cat.skills.into_values().collect(),
            points: cat.points.into_values().collect(),
        }
    }
}

impl Catalogue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_skill(&mut self, skill: SkillDef) {
        self.skills.insert(skill.id.clone(), skill);
    }

    pub fn insert_point(&mut self, point: PointDef) {
        self.points.insert(point.id.clone(), point);
    }

    pub fn with_skill(mut self, skill: SkillDef) -> Self {
        self.insert_skill(skill);
        self
    }

    pub fn with_point(mut self, point: PointDef) -> Self {
        self.insert_point(point);
        self
    }

    pub fn skill(&self, id: &str) -> Option<&SkillDef> {
        self.skills.get(id)
    }

    pub fn point(&self, id: &str) -> Option<&PointDef> {
        self.points.get(id)
    }

    pub fn skills(&self) -> impl Iterator<Item = &SkillDef> {
        self.skills.values()
    }

    pub fn points(&self) -> impl Iterator<Item = &PointDef> {
        self.points.values()
    }
}

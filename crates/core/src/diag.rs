//! Structured validation diagnostics.
//!
//! Decoders and validators push into a [`Diagnostics`] collection instead of
//! returning on the first problem, so a single pass surfaces everything that
//! is wrong with a document.

use std::fmt;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
        };
        f.write_str(s)
    }
}

/// One finding. `path` is a JSON-pointer-like location inside the document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub code: &'static str,
    pub path: String,
    pub message: String,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let path = if self.path.is_empty() { "/" } else { &self.path };
        write!(f, "{} [{}] {}: {}", self.severity, self.code, path, self.message)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Diagnostics {
    items: Vec<Diagnostic>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, severity: Severity, code: &'static str, path: &str, message: impl Into<String>) {
        self.items.push(Diagnostic {
            severity,
            code,
            path: path.to_string(),
            message: message.into(),
        });
    }

    pub fn error(&mut self, code: &'static str, path: &str, message: impl Into<String>) {
        self.push(Severity::Error, code, path, message);
    }

    pub fn warning(&mut self, code: &'static str, path: &str, message: impl Into<String>) {
        self.push(Severity::Warning, code, path, message);
    }

    pub fn info(&mut self, code: &'static str, path: &str, message: impl Into<String>) {
        self.push(Severity::Info, code, path, message);
    }

    pub fn extend(&mut self, other: Diagnostics) {
        self.items.extend(other.items);
    }

    pub fn has_errors(&self) -> bool {
        self.items.iter().any(|d| d.severity == Severity::Error)
    }

    pub fn errors(&self) -> impl Iterator<Item = &Diagnostic> {
        self.items.iter().filter(|d| d.severity == Severity::Error)
    }

    pub fn with_code<'a>(&'a self, code: &'a str) -> impl Iterator<Item = &'a Diagnostic> + 'a {
        self.items.iter().filter(move |d| d.code == code)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn into_vec(self) -> Vec<Diagnostic> {
        self.items
    }
}

/// Append one segment to a JSON pointer, escaping `~` and `/`.
pub fn pointer(base: &str, segment: impl fmt::Display) -> String {
    let seg = segment.to_string().replace('~', "~0").replace('/', "~1");
    format!("{}/{}", base, seg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pointer_escapes_segments() {
        assert_eq!(pointer("", "tracks"), "/tracks");
        assert_eq!(pointer("/tracks", 0), "/tracks/0");
        assert_eq!(pointer("/a", "x/y~z"), "/a/x~1y~0z");
    }

    #[test]
    fn errors_are_counted_separately_from_warnings() {
        let mut d = Diagnostics::new();
        d.warning("w", "/a", "careful");
        assert!(!d.has_errors());
        d.error("e", "/b", "broken");
        assert!(d.has_errors());
        assert_eq!(d.errors().count(), 1);
        assert_eq!(d.len(), 2);
        assert_eq!(d.with_code("w").count(), 1);
    }
}

//! Key chord parsing: `"shift+f3"`, `"ctrl+alt+q"`, `"2"`.

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Modifier {
    Ctrl,
    Alt,
    Shift,
    Cmd,
}

impl Modifier {
    fn parse(s: &str) -> Option<Modifier> {
        match s {
            "ctrl" | "control" => Some(Modifier::Ctrl),
            "alt" | "option" => Some(Modifier::Alt),
            "shift" => Some(Modifier::Shift),
            "cmd" | "command" | "super" | "win" => Some(Modifier::Cmd),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Modifier::Ctrl => "ctrl",
            Modifier::Alt => "alt",
            Modifier::Shift => "shift",
            Modifier::Cmd => "cmd",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("empty key")]
    Empty,
    #[error("unknown modifier `{0}`")]
    UnknownModifier(String),
    #[error("unknown key `{0}`")]
    UnknownKey(String),
    #[error("modifier `{0}` given twice")]
    DuplicateModifier(String),
}

/// A main key plus modifiers, normalized to lowercase.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyChord {
    pub modifiers: Vec<Modifier>,
    pub key: String,
}

fn key_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^(?:[a-z0-9`\-=\[\];',./\\]|f(?:[1-9]|1[0-9]|2[0-4])|num[0-9]|space|enter|return|tab|escape|esc|backspace|delete|up|down|left|right|home|end|pageup|pagedown|insert)$",
        )
        .expect("static key pattern")
    })
}

impl KeyChord {
    pub fn parse(s: &str) -> Result<KeyChord, KeyError> {
        let s = s.trim().to_lowercase();
        if s.is_empty() {
            return Err(KeyError::Empty);
        }
        // "+" alone, or a trailing "++", names the plus key itself
        let (head, key) = match s.strip_suffix("++") {
            Some(rest) => (rest, "+".to_string()),
            None if s == "+" => ("", "+".to_string()),
            None => match s.rsplit_once('+') {
                Some((h, k)) => (h, k.to_string()),
                None => ("", s.clone()),
            },
        };
        if key.is_empty() {
            return Err(KeyError::Empty);
        }
        if key != "+" && !key_pattern().is_match(&key) {
            return Err(KeyError::UnknownKey(key));
        }
        let mut modifiers = Vec::new();
        for part in head.split('+').filter(|p| !p.is_empty()) {
            let m = Modifier::parse(part).ok_or_else(|| KeyError::UnknownModifier(part.to_string()))?;
            if modifiers.contains(&m) {
                return Err(KeyError::DuplicateModifier(part.to_string()));
            }
            modifiers.push(m);
        }
        modifiers.sort();
        Ok(KeyChord { modifiers, key })
    }

    pub fn has(&self, m: Modifier) -> bool {
        self.modifiers.contains(&m)
    }
}

impl fmt::Display for KeyChord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for m in &self.modifiers {
            write!(f, "{}+", m.as_str())?;
        }
        f.write_str(&self.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_normalizes() {
        let k = KeyChord::parse(" Shift+Ctrl+F3 ").unwrap();
        assert_eq!(k.modifiers, vec![Modifier::Ctrl, Modifier::Shift]);
        assert_eq!(k.key, "f3");
        assert_eq!(k.to_string(), "ctrl+shift+f3");
        assert_eq!(KeyChord::parse("2").unwrap().to_string(), "2");
        assert_eq!(KeyChord::parse("option+space").unwrap().to_string(), "alt+space");
        assert_eq!(KeyChord::parse("ctrl++").unwrap().key, "+");
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(KeyChord::parse(""), Err(KeyError::Empty));
        assert_eq!(KeyChord::parse("shift+"), Err(KeyError::Empty));
        assert_eq!(KeyChord::parse("hyper+a"), Err(KeyError::UnknownModifier("hyper".into())));
        assert_eq!(KeyChord::parse("f25"), Err(KeyError::UnknownKey("f25".into())));
        assert_eq!(KeyChord::parse("shift+shift+a"), Err(KeyError::DuplicateModifier("shift".into())));
    }
}

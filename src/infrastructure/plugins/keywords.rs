//! Declarative keyword tables and coercion
//!
//! Each plugin type declares a static table of the keywords it accepts. The
//! loader checks every configured keyword against that table before the
//! plugin's factory runs, so a factory only ever sees well-typed values.

use std::collections::HashMap;
use serde_yaml::Value;
use crate::application::errors::ConfigError;
use crate::infrastructure::config::ConfigValue;

/// Expected type of a keyword
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeywordKind {
    /// Leaf string, checked but not converted
    Str,
    /// Structured node, passed through
    Node,
    Int,
    Float,
    Bool,
}

impl KeywordKind {
    pub fn as_str(&self) -> &str {
        match self {
            KeywordKind::Str => "string",
            KeywordKind::Node => "node",
            KeywordKind::Int => "integer",
            KeywordKind::Float => "float",
            KeywordKind::Bool => "bool",
        }
    }
}

/// One entry of a plugin's keyword table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeywordSpec {
    pub name: &'static str,
    pub kind: KeywordKind,
    pub required: bool,
}

impl KeywordSpec {
    pub const fn optional(name: &'static str, kind: KeywordKind) -> Self {
        Self { name, kind, required: false }
    }

    pub const fn required(name: &'static str, kind: KeywordKind) -> Self {
        Self { name, kind, required: true }
    }
}

/// A coerced keyword value
#[derive(Debug, Clone, PartialEq)]
pub enum Keyword {
    Str(String),
    Node(Value),
    Int(i64),
    Float(f64),
    Bool(bool),
}

/// Coerced constructor keywords handed to a plugin factory
#[derive(Debug, Clone, Default)]
pub struct Keywords {
    values: HashMap<String, Keyword>,
}

impl Keywords {
    pub fn get(&self, name: &str) -> Option<&Keyword> {
        self.values.get(name)
    }

    pub fn str(&self, name: &str) -> Option<&str> {
        match self.values.get(name) {
            Some(Keyword::Str(s)) => Some(s),
            _ => None,
        }
    }

    pub fn node(&self, name: &str) -> Option<&Value> {
        match self.values.get(name) {
            Some(Keyword::Node(v)) => Some(v),
            _ => None,
        }
    }

    pub fn int(&self, name: &str) -> Option<i64> {
        match self.values.get(name) {
            Some(Keyword::Int(i)) => Some(*i),
            _ => None,
        }
    }

    pub fn float(&self, name: &str) -> Option<f64> {
        match self.values.get(name) {
            Some(Keyword::Float(f)) => Some(*f),
            _ => None,
        }
    }

    pub fn bool(&self, name: &str) -> Option<bool> {
        match self.values.get(name) {
            Some(Keyword::Bool(b)) => Some(*b),
            _ => None,
        }
    }

    /// String keyword that the factory cannot do without
    pub fn require_str(&self, name: &str) -> Result<&str, ConfigError> {
        self.str(name)
            .ok_or_else(|| ConfigError::MissingKeyword(name.to_string()))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Check and convert raw keywords against a plugin's table.
///
/// Undeclared keywords, type mismatches and missing required keywords are
/// all configuration errors naming the offending keyword.
pub fn coerce(specs: &[KeywordSpec], raw: Vec<(String, ConfigValue)>) -> Result<Keywords, ConfigError> {
    let mut values = HashMap::with_capacity(raw.len());

    for (name, value) in raw {
        let spec = specs
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| ConfigError::UnexpectedKeyword(name.clone()))?;
        let coerced = coerce_one(spec, value)?;
        values.insert(name, coerced);
    }

    if let Some(missing) = specs.iter().find(|s| s.required && !values.contains_key(s.name)) {
        return Err(ConfigError::MissingKeyword(missing.name.to_string()));
    }

    Ok(Keywords { values })
}

fn coerce_one(spec: &KeywordSpec, value: ConfigValue) -> Result<Keyword, ConfigError> {
    let text = match value {
        ConfigValue::Node(node) if spec.kind == KeywordKind::Node => return Ok(Keyword::Node(node)),
        ConfigValue::Node(_) if spec.kind == KeywordKind::Str => {
            return Err(ConfigError::invalid(spec.name, "is not a string"));
        }
        ConfigValue::Node(_) => {
            return Err(ConfigError::invalid(spec.name, format!("expected {}", spec.kind.as_str())));
        }
        ConfigValue::Text(text) => text,
    };

    let parsed = match spec.kind {
        KeywordKind::Str => return Ok(Keyword::Str(text)),
        KeywordKind::Node => None,
        KeywordKind::Int => text.trim().parse().ok().map(Keyword::Int),
        KeywordKind::Float => text.trim().parse().ok().map(Keyword::Float),
        KeywordKind::Bool => parse_bool(&text).map(Keyword::Bool),
    };

    parsed.ok_or_else(|| {
        let reason = match spec.kind {
            KeywordKind::Node => "expected a structured node".to_string(),
            kind => format!("expected {}, got \"{}\"", kind.as_str(), text),
        };
        ConfigError::invalid(spec.name, reason)
    })
}

fn parse_bool(text: &str) -> Option<bool> {
    match text.trim().to_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Some(true),
        "false" | "no" | "off" | "0" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE: &[KeywordSpec] = &[
        KeywordSpec::required("url", KeywordKind::Str),
        KeywordSpec::optional("max_state_duration", KeywordKind::Int),
        KeywordSpec::optional("ratio", KeywordKind::Float),
        KeywordSpec::optional("verbose", KeywordKind::Bool),
        KeywordSpec::optional("headers", KeywordKind::Node),
    ];

    fn text(name: &str, value: &str) -> (String, ConfigValue) {
        (name.to_string(), ConfigValue::Text(value.to_string()))
    }

    fn node(name: &str) -> (String, ConfigValue) {
        (name.to_string(), ConfigValue::Node(Value::Sequence(vec![])))
    }

    #[test]
    fn converts_declared_types() {
        let kw = coerce(
            TABLE,
            vec![
                text("url", "http://ops"),
                text("max_state_duration", " 43200 "),
                text("ratio", "0.5"),
                text("verbose", "Yes"),
                node("headers"),
            ],
        )
        .unwrap();

        assert_eq!(kw.str("url"), Some("http://ops"));
        assert_eq!(kw.int("max_state_duration"), Some(43200));
        assert_eq!(kw.float("ratio"), Some(0.5));
        assert_eq!(kw.bool("verbose"), Some(true));
        assert!(kw.node("headers").is_some());
    }

    #[test]
    fn bad_integer_names_keyword() {
        let err = coerce(TABLE, vec![text("url", "x"), text("max_state_duration", "soon")]).unwrap_err();
        match err {
            ConfigError::InvalidKeyword { keyword, .. } => assert_eq!(keyword, "max_state_duration"),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn strings_are_checked_not_converted() {
        let err = coerce(TABLE, vec![node("url")]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidKeyword { ref keyword, .. } if keyword == "url"));
    }

    #[test]
    fn node_keyword_rejects_leaf() {
        let err = coerce(TABLE, vec![text("url", "x"), text("headers", "flat")]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidKeyword { ref keyword, .. } if keyword == "headers"));
    }

    #[test]
    fn missing_required_keyword() {
        let err = coerce(TABLE, vec![text("verbose", "no")]).unwrap_err();
        assert_eq!(err, ConfigError::MissingKeyword("url".into()));
    }

    #[test]
    fn undeclared_keyword_is_rejected() {
        let err = coerce(TABLE, vec![text("url", "x"), text("password", "hunter2")]).unwrap_err();
        assert_eq!(err, ConfigError::UnexpectedKeyword("password".into()));
    }

    #[test]
    fn empty_table_accepts_no_keywords() {
        assert!(coerce(&[], vec![]).unwrap().is_empty());
        assert!(coerce(&[], vec![text("threshold", "5")]).is_err());
    }
}

//! Field paths over JSON documents.
//!
//! Syntax:
//! - `resource.status.phase` - object keys separated by dots
//! - `items[0]` - array index
//! - `adapters[adapter=dns].observed_generation` - first array element whose
//!   `adapter` equals `dns` (`==` and quoted values are accepted too)
//! - `conditions[type="Available"].status` - filter keys may be dotted paths

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::compare::values_equal;

/// Errors while parsing a field path.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    #[error("empty field path")]
    Empty,
    #[error("empty segment in field path '{0}'")]
    EmptySegment(String),
    #[error("unclosed '[' in field path '{0}'")]
    UnclosedBracket(String),
    #[error("unexpected '{found}' in field path '{path}'")]
    Unexpected { path: String, found: char },
    #[error("invalid selector '[{selector}]' in field path '{path}'")]
    InvalidSelector { path: String, selector: String },
}

/// One step of a path.
#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Key(String),
    Index(usize),
    Filter { key: Vec<String>, value: Value },
}

/// A parsed field path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FieldPath {
    raw: String,
    segments: Vec<Segment>,
}

impl FieldPath {
    pub fn parse(raw: &str) -> Result<Self, PathError> {
        let raw = raw.trim();
        Ok(Self {
            raw: raw.to_string(),
            segments: parse_segments(raw)?,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Resolve the path against a document. `null` counts as missing.
    pub fn resolve<'a>(&self, doc: &'a Value) -> Option<&'a Value> {
        let mut current = doc;
        for segment in &self.segments {
            current = match segment {
                Segment::Key(key) => current.as_object()?.get(key)?,
                Segment::Index(idx) => current.as_array()?.get(*idx)?,
                Segment::Filter { key, value } => current
                    .as_array()?
                    .iter()
                    .find(|item| lookup(item, key).is_some_and(|v| filter_matches(v, value)))?,
            };
        }
        if current.is_null() {
            None
        } else {
            Some(current)
        }
    }
}

impl FromStr for FieldPath {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FieldPath::parse(s)
    }
}

impl TryFrom<String> for FieldPath {
    type Error = PathError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        FieldPath::parse(&value)
    }
}

impl From<FieldPath> for String {
    fn from(path: FieldPath) -> Self {
        path.raw
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

fn lookup<'a>(doc: &'a Value, keys: &[String]) -> Option<&'a Value> {
    keys.iter()
        .try_fold(doc, |current, key| current.as_object()?.get(key))
}

/// Filter literals are written without types, so a string field also matches
/// the textual form of a number or boolean literal.
fn filter_matches(candidate: &Value, literal: &Value) -> bool {
    if values_equal(candidate, literal) {
        return true;
    }
    match (candidate, literal) {
        (Value::String(s), Value::Number(n)) => *s == n.to_string(),
        (Value::String(s), Value::Bool(b)) => *s == b.to_string(),
        _ => false,
    }
}

fn parse_segments(raw: &str) -> Result<Vec<Segment>, PathError> {
    if raw.is_empty() {
        return Err(PathError::Empty);
    }

    let mut segments = Vec::new();
    let mut key = String::new();
    let mut after_bracket = false;
    let mut chars = raw.chars();

    while let Some(c) = chars.next() {
        match c {
            '.' => {
                if key.is_empty() && !after_bracket {
                    return Err(PathError::EmptySegment(raw.to_string()));
                }
                if !key.is_empty() {
                    segments.push(Segment::Key(std::mem::take(&mut key)));
                }
                after_bracket = false;
            }
            '[' => {
                if !key.is_empty() {
                    segments.push(Segment::Key(std::mem::take(&mut key)));
                } else if segments.is_empty() {
                    return Err(PathError::Unexpected {
                        path: raw.to_string(),
                        found: '[',
                    });
                }
                let mut inner = String::new();
                let mut quote: Option<char> = None;
                let mut closed = false;
                for c in chars.by_ref() {
                    match quote {
                        Some(q) if c == q => {
                            quote = None;
                            inner.push(c);
                        }
                        Some(_) => inner.push(c),
                        None if c == '"' || c == '\'' => {
                            quote = Some(c);
                            inner.push(c);
                        }
                        None if c == ']' => {
                            closed = true;
                            break;
                        }
                        None => inner.push(c),
                    }
                }
                if !closed {
                    return Err(PathError::UnclosedBracket(raw.to_string()));
                }
                segments.push(parse_bracket(raw, &inner)?);
                after_bracket = true;
            }
            ']' => {
                return Err(PathError::Unexpected {
                    path: raw.to_string(),
                    found: ']',
                });
            }
            c => {
                if after_bracket {
                    return Err(PathError::Unexpected {
                        path: raw.to_string(),
                        found: c,
                    });
                }
                key.push(c);
            }
        }
    }

    if !key.is_empty() {
        segments.push(Segment::Key(key));
    } else if !after_bracket {
        // trailing dot
        return Err(PathError::EmptySegment(raw.to_string()));
    }
    Ok(segments)
}

fn parse_bracket(raw: &str, inner: &str) -> Result<Segment, PathError> {
    let inner = inner.trim();
    let invalid = || PathError::InvalidSelector {
        path: raw.to_string(),
        selector: inner.to_string(),
    };

    if let Ok(idx) = inner.parse::<usize>() {
        return Ok(Segment::Index(idx));
    }

    let (key, value) = inner.split_once('=').ok_or_else(invalid)?;
    let value = value.strip_prefix('=').unwrap_or(value).trim();
    let key: Vec<String> = key.trim().split('.').map(|k| k.trim().to_string()).collect();
    if key.iter().any(String::is_empty) || value.is_empty() {
        return Err(invalid());
    }

    Ok(Segment::Filter {
        key,
        value: parse_literal(value),
    })
}

fn parse_literal(text: &str) -> Value {
    for quote in ['"', '\''] {
        if text.len() >= 2 && text.starts_with(quote) && text.ends_with(quote) {
            return Value::String(text[1..text.len() - 1].to_string());
        }
    }
    match text {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        "null" => return Value::Null,
        _ => {}
    }
    if let Ok(n) = text.parse::<i64>() {
        return Value::from(n);
    }
    text.parse::<f64>()
        .ok()
        .and_then(serde_json::Number::from_f64)
        .map(Value::Number)
        .unwrap_or_else(|| Value::String(text.to_string()))
}

//! `{{ path }}` substitution in JSON documents.

use serde_json::{Map, Value};
use thiserror::Error;

use super::path::{FieldPath, PathError};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TemplateError {
    #[error("unterminated placeholder in '{0}'")]
    Unterminated(String),
    #[error("invalid placeholder: {0}")]
    InvalidPath(#[from] PathError),
    #[error("placeholder '{{{{ {0} }}}}' does not resolve")]
    Unresolved(String),
}

/// Render a template document against `context`.
///
/// Every string leaf may contain `{{ path }}` placeholders. A string that is
/// exactly one placeholder is replaced by the resolved value with its JSON
/// type intact; otherwise each placeholder is replaced by the value's text
/// (strings unquoted, everything else as JSON). Object keys are not rendered.
pub fn render_template(template: &Value, context: &Value) -> Result<Value, TemplateError> {
    match template {
        Value::String(text) => render_string(text, context),
        Value::Array(items) => items
            .iter()
            .map(|item| render_template(item, context))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut rendered = Map::with_capacity(map.len());
            for (key, value) in map {
                rendered.insert(key.clone(), render_template(value, context)?);
            }
            Ok(Value::Object(rendered))
        }
        other => Ok(other.clone()),
    }
}

fn render_string(text: &str, context: &Value) -> Result<Value, TemplateError> {
    if let Some(inner) = whole_placeholder(text) {
        return resolve(inner, context).cloned();
    }

    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find("}}")
            .ok_or_else(|| TemplateError::Unterminated(text.to_string()))?;
        match resolve(&after[..end], context)? {
            Value::String(s) => out.push_str(s),
            other => out.push_str(&other.to_string()),
        }
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Ok(Value::String(out))
}

fn whole_placeholder(text: &str) -> Option<&str> {
    let inner = text.trim().strip_prefix("{{")?.strip_suffix("}}")?;
    if inner.contains("{{") || inner.contains("}}") {
        None
    } else {
        Some(inner)
    }
}

fn resolve<'a>(expr: &str, context: &'a Value) -> Result<&'a Value, TemplateError> {
    let path = FieldPath::parse(expr)?;
    path.resolve(context)
        .ok_or_else(|| TemplateError::Unresolved(path.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context() -> Value {
        json!({
            "resource": {"id": "c1", "generation": 4, "spec": {"region": "eu", "replicas": 3}},
            "env": {"image": "validator:1.2"}
        })
    }

    #[test]
    fn test_whole_placeholder_keeps_type() {
        let rendered = render_template(&json!({"replicas": "{{ resource.spec.replicas }}"}), &context()).unwrap();
        assert_eq!(rendered, json!({"replicas": 3}));
    }

    #[test]
    fn test_interpolation() {
        let template = json!({
            "command": ["validate", "--cluster={{resource.id}}", "--gen={{ resource.generation }}"],
            "image": "{{ env.image }}",
            "fixed": true
        });
        let rendered = render_template(&template, &context()).unwrap();
        assert_eq!(
            rendered,
            json!({
                "command": ["validate", "--cluster=c1", "--gen=4"],
                "image": "validator:1.2",
                "fixed": true
            })
        );
    }

    #[test]
    fn test_errors() {
        assert_eq!(
            render_template(&json!("{{ resource.nope }}"), &context()),
            Err(TemplateError::Unresolved("resource.nope".to_string()))
        );
        assert!(matches!(
            render_template(&json!("x {{ resource.id"), &context()),
            Err(TemplateError::Unterminated(_))
        ));
        assert!(matches!(
            render_template(&json!("{{ }}"), &context()),
            Err(TemplateError::InvalidPath(PathError::Empty))
        ));
    }
}

//! Parameter mapping templates.
//!
//! Step configs reference session-context values with `{key}` placeholders;
//! dotted paths (`{form.amount}`) descend into nested objects. An
//! unresolved variable is a ValidationError surfaced before any side
//! effect, never a silently-empty string.

use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::EngineError;
use crate::session::ContextMap;

/// Look up a dotted path in the context.
fn lookup<'a>(context: &'a ContextMap, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let first = parts.next()?;
    let mut current = context.get(first)?;
    for part in parts {
        current = current.get(part)?;
    }
    Some(current)
}

/// Render a JSON value into a template string.
fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Resolve every `{placeholder}` in `template` against the context.
pub fn resolve_template(template: &str, context: &ContextMap) -> Result<String, EngineError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let end = after.find('}').ok_or_else(|| {
            EngineError::Validation(format!("unterminated placeholder in template '{}'", template))
        })?;
        let path = &after[..end];
        let value = lookup(context, path).ok_or_else(|| {
            EngineError::Validation(format!("unresolved template variable '{}'", path))
        })?;
        out.push_str(&render(value));
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Resolve a parameter map. A value that is exactly one placeholder keeps
/// the referenced JSON value's type; anything else interpolates to a string.
pub fn resolve_params(
    params: &BTreeMap<String, String>,
    context: &ContextMap,
) -> Result<ContextMap, EngineError> {
    let mut resolved = ContextMap::new();
    for (name, template) in params {
        let trimmed = template.trim();
        let value = if trimmed.starts_with('{')
            && trimmed.ends_with('}')
            && !trimmed[1..trimmed.len() - 1].contains(['{', '}'])
        {
            let path = &trimmed[1..trimmed.len() - 1];
            lookup(context, path)
                .cloned()
                .ok_or_else(|| {
                    EngineError::Validation(format!("unresolved template variable '{}'", path))
                })?
        } else {
            Value::String(resolve_template(template, context)?)
        };
        resolved.insert(name.clone(), value);
    }
    Ok(resolved)
}

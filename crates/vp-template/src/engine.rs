// SPDX-License-Identifier: MIT OR Apache-2.0
//! Deterministic text templating over a JSON context.
//!
//! Grammar: `{{path.to.value}}` substitution and
//! `{{#each path}}…{{/each}}` iteration. Inside an `each` body the element's
//! fields resolve first, then the enclosing scopes; `{{this}}` is the element
//! itself and `{{@index}}` the zero-based position. Missing paths render as
//! the empty string so optional context (e.g. historical fields) degrades
//! cleanly. Nested `each` blocks are not supported.

use serde_json::Value;

/// Errors produced by the rendering engine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TemplateError {
    /// A `{{` had no matching `}}`.
    #[error("unterminated '{{{{' at byte {at}")]
    Unterminated {
        /// Byte offset of the opening braces.
        at: usize,
    },

    /// A `{{/each}}` without an opening block, or an `{{#each}}` without a
    /// closing one.
    #[error("unbalanced each block")]
    UnbalancedEach,

    /// `{{#each}}` was applied to a non-array value.
    #[error("each target '{path}' is not an array")]
    NotAnArray {
        /// The offending path.
        path: String,
    },
}

const OPEN: &str = "{{";
const CLOSE: &str = "}}";
const EACH_CLOSE: &str = "{{/each}}";

/// Render `template` against `context`.
pub fn render(template: &str, context: &Value) -> Result<String, TemplateError> {
    render_scoped(template, &[context])
}

fn render_scoped(template: &str, scopes: &[&Value]) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    let mut offset = 0usize;

    while let Some(start) = rest.find(OPEN) {
        out.push_str(&rest[..start]);
        let after = &rest[start + OPEN.len()..];
        let end = after
            .find(CLOSE)
            .ok_or(TemplateError::Unterminated { at: offset + start })?;
        let token = after[..end].trim();
        let tail = &after[end + CLOSE.len()..];

        if let Some(path) = token.strip_prefix("#each") {
            let path = path.trim().to_string();
            let close = tail.find(EACH_CLOSE).ok_or(TemplateError::UnbalancedEach)?;
            let body = &tail[..close];
            let after_each = &tail[close + EACH_CLOSE.len()..];

            match lookup(scopes, &path) {
                Some(Value::Array(items)) => {
                    for (index, item) in items.iter().enumerate() {
                        let index_scope = serde_json::json!({ "@index": index });
                        let mut inner: Vec<&Value> = vec![item, &index_scope];
                        inner.extend_from_slice(scopes);
                        out.push_str(&render_scoped(body, &inner)?);
                    }
                }
                // An absent list iterates zero times.
                None | Some(Value::Null) => {}
                Some(_) => return Err(TemplateError::NotAnArray { path }),
            }

            offset += rest.len() - after_each.len();
            rest = after_each;
            continue;
        }

        if token == "/each" {
            return Err(TemplateError::UnbalancedEach);
        }

        out.push_str(&stringify(lookup(scopes, token)));
        offset += rest.len() - tail.len();
        rest = tail;
    }

    out.push_str(rest);
    Ok(out)
}

/// Resolve a dot path against the scope chain: the first scope that contains
/// the path's head wins.
fn lookup<'a>(scopes: &[&'a Value], path: &str) -> Option<&'a Value> {
    if path == "this" {
        return scopes.first().copied();
    }
    for scope in scopes {
        let mut current = *scope;
        let mut matched = true;
        for segment in path.split('.') {
            match current.get(segment) {
                Some(next) => current = next,
                None => {
                    matched = false;
                    break;
                }
            }
        }
        if matched {
            return Some(current);
        }
    }
    None
}

fn stringify(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::Bool(b)) => b.to_string(),
        Some(other) => serde_json::to_string(other).unwrap_or_default(),
    }
}

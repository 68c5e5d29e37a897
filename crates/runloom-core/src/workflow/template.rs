//! Argument template rendering.
//!
//! Walks a JSON template and substitutes `{{ expr }}` placeholders in every
//! string. Placeholders are JEXL expressions, so transforms apply with `|`
//! (`{{ inputs.from|email_address }}`).
//!
//! - A string that is exactly one placeholder yields the expression's raw
//!   value, keeping its JSON type.
//! - Mixed strings interpolate the string form of each value.
//! - Strings without markers and non-string values pass through unchanged.

use serde_json::{Map, Value};

use super::expression::{value_to_string, ExpressionError, ExpressionEvaluator};

const OPEN: &str = "{{";
const CLOSE: &str = "}}";

#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("template placeholder '{{{{ {placeholder} }}}}' failed: {source}")]
    Placeholder {
        placeholder: String,
        #[source]
        source: ExpressionError,
    },
}

/// Renders templates against an expression context.
pub struct TemplateRenderer<'a> {
    evaluator: &'a ExpressionEvaluator,
}

impl<'a> TemplateRenderer<'a> {
    pub fn new(evaluator: &'a ExpressionEvaluator) -> Self {
        Self { evaluator }
    }

    /// Render `template` (scalar, object or array, recursively).
    pub fn render(&self, template: &Value, context: &Value) -> Result<Value, TemplateError> {
        match template {
            Value::String(s) => self.render_str(s, context),
            Value::Array(items) => items
                .iter()
                .map(|item| self.render(item, context))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Value::Object(fields) => {
                let mut rendered = Map::with_capacity(fields.len());
                for (key, value) in fields {
                    rendered.insert(key.clone(), self.render(value, context)?);
                }
                Ok(Value::Object(rendered))
            }
            other => Ok(other.clone()),
        }
    }

    fn render_str(&self, s: &str, context: &Value) -> Result<Value, TemplateError> {
        if !s.contains(OPEN) {
            return Ok(Value::String(s.to_string()));
        }

        if let Some(expr) = sole_placeholder(s) {
            return self.eval(expr, context);
        }

        let mut out = String::with_capacity(s.len());
        let mut rest = s;
        while let Some(start) = rest.find(OPEN) {
            let Some(len) = rest[start + OPEN.len()..].find(CLOSE) else {
                break;
            };
            out.push_str(&rest[..start]);
            let expr = &rest[start + OPEN.len()..start + OPEN.len() + len];
            out.push_str(&value_to_string(&self.eval(expr.trim(), context)?));
            rest = &rest[start + OPEN.len() + len + CLOSE.len()..];
        }
        out.push_str(rest);
        Ok(Value::String(out))
    }

    fn eval(&self, expr: &str, context: &Value) -> Result<Value, TemplateError> {
        self.evaluator
            .evaluate_value(expr, context)
            .map_err(|source| TemplateError::Placeholder {
                placeholder: expr.to_string(),
                source,
            })
    }
}

/// The inner expression when `s` is exactly one `{{ ... }}` placeholder.
fn sole_placeholder(s: &str) -> Option<&str> {
    let inner = s.trim().strip_prefix(OPEN)?.strip_suffix(CLOSE)?;
    if inner.contains(OPEN) || inner.contains(CLOSE) {
        return None;
    }
    Some(inner.trim())
}

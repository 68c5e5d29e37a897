//! JEXL expression evaluator for gateway branches, switch selectors, edge
//! conditions, loop conditions and template placeholders.
//!
//! Wraps `jexl_eval::Evaluator` with pre-registered transforms. The grammar
//! covers comparisons, `&&`/`||`, `in`, arithmetic, ternaries and dotted or
//! indexed access; nothing in it reaches host code.
//!
//! **Security note:** run data is always passed as the context object, never
//! interpolated into expression strings.

use serde_json::{json, Value};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur during expression evaluation.
#[derive(Debug, thiserror::Error)]
pub enum ExpressionError {
    #[error("Expression evaluation failed: {0}")]
    EvalFailed(String),

    #[error("Invalid context: {0}")]
    InvalidContext(String),
}

// ---------------------------------------------------------------------------
// ExpressionEvaluator
// ---------------------------------------------------------------------------

/// JEXL evaluator with the standard transform library registered.
pub struct ExpressionEvaluator {
    evaluator: jexl_eval::Evaluator<'static>,
}

impl ExpressionEvaluator {
    pub fn new() -> Self {
        let evaluator = jexl_eval::Evaluator::new()
            // String transforms
            .with_transform("lower", |args: &[Value]| {
                Ok(json!(str_arg(args, 0).to_lowercase()))
            })
            .with_transform("upper", |args: &[Value]| {
                Ok(json!(str_arg(args, 0).to_uppercase()))
            })
            .with_transform("trim", |args: &[Value]| Ok(json!(str_arg(args, 0).trim())))
            .with_transform("split", |args: &[Value]| {
                let delimiter = args.get(1).and_then(|v| v.as_str()).unwrap_or(",");
                let parts: Vec<&str> = str_arg(args, 0).split(delimiter).collect();
                Ok(json!(parts))
            })
            .with_transform("email_address", |args: &[Value]| {
                Ok(json!(email_address(str_arg(args, 0))))
            })
            // Boolean transforms
            .with_transform("not", |args: &[Value]| {
                Ok(json!(!is_truthy(args.first().unwrap_or(&Value::Null))))
            })
            // String search transforms
            .with_transform("contains", |args: &[Value]| {
                let found = match args.first() {
                    Some(Value::Array(items)) => {
                        let needle = args.get(1).unwrap_or(&Value::Null);
                        items.iter().any(|item| item == needle)
                    }
                    _ => str_arg(args, 0).contains(str_arg(args, 1)),
                };
                Ok(json!(found))
            })
            .with_transform("startsWith", |args: &[Value]| {
                Ok(json!(str_arg(args, 0).starts_with(str_arg(args, 1))))
            })
            .with_transform("endsWith", |args: &[Value]| {
                Ok(json!(str_arg(args, 0).ends_with(str_arg(args, 1))))
            })
            .with_transform("match", |args: &[Value]| {
                // Substring match, not regex
                Ok(json!(str_arg(args, 0).contains(str_arg(args, 1))))
            })
            // Collection transforms
            .with_transform("length", |args: &[Value]| {
                let len = match args.first().unwrap_or(&Value::Null) {
                    Value::String(s) => s.chars().count(),
                    Value::Array(a) => a.len(),
                    Value::Object(o) => o.len(),
                    _ => 0,
                };
                Ok(json!(len as f64))
            })
            .with_transform("first", |args: &[Value]| {
                let first = match args.first() {
                    Some(Value::Array(items)) => items.first().cloned().unwrap_or(Value::Null),
                    Some(other) => other.clone(),
                    None => Value::Null,
                };
                Ok(first)
            })
            .with_transform("join", |args: &[Value]| {
                let delimiter = args.get(1).and_then(|v| v.as_str()).unwrap_or(",");
                let joined = match args.first() {
                    Some(Value::Array(items)) => items
                        .iter()
                        .map(value_to_string)
                        .collect::<Vec<_>>()
                        .join(delimiter),
                    Some(other) => value_to_string(other),
                    None => String::new(),
                };
                Ok(json!(joined))
            })
            // Value transforms
            .with_transform("default", |args: &[Value]| {
                let value = args.first().cloned().unwrap_or(Value::Null);
                let missing = match &value {
                    Value::Null => true,
                    Value::String(s) => s.is_empty(),
                    _ => false,
                };
                if missing {
                    Ok(args.get(1).cloned().unwrap_or(Value::Null))
                } else {
                    Ok(value)
                }
            })
            .with_transform("json", |args: &[Value]| {
                let value = args.first().unwrap_or(&Value::Null);
                Ok(json!(value.to_string()))
            });

        Self { evaluator }
    }

    /// Evaluate an expression and return the raw JSON value.
    ///
    /// The `context` must be a JSON object.
    pub fn evaluate_value(&self, expression: &str, context: &Value) -> Result<Value, ExpressionError> {
        if !context.is_object() {
            return Err(ExpressionError::InvalidContext(
                "context must be a JSON object".to_string(),
            ));
        }

        self.evaluator
            .eval_in_context(expression, context)
            .map_err(|e| ExpressionError::EvalFailed(format!("'{expression}': {e}")))
    }

    /// Evaluate an expression and coerce the result with [`is_truthy`].
    pub fn evaluate_bool(&self, expression: &str, context: &Value) -> Result<bool, ExpressionError> {
        self.evaluate_value(expression, context)
            .map(|value| is_truthy(&value))
    }
}

impl Default for ExpressionEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// JavaScript-like truthiness.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0 && !f.is_nan()).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// String form used when interpolating a value into text: strings are
/// inserted bare, null as empty, integral floats without a fraction, and
/// everything else as compact JSON.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Number(n) => match n.as_f64() {
            Some(f) if n.is_f64() && f.fract() == 0.0 && f.abs() < 1e15 => format!("{}", f as i64),
            _ => n.to_string(),
        },
        other => other.to_string(),
    }
}

fn str_arg(args: &[Value], index: usize) -> &str {
    args.get(index).and_then(|v| v.as_str()).unwrap_or("")
}

/// Extract the bare address from `"Display Name <addr@example.com>"`.
fn email_address(raw: &str) -> String {
    match (raw.rfind('<'), raw.rfind('>')) {
        (Some(open), Some(close)) if open < close => raw[open + 1..close].trim().to_string(),
        _ => raw.trim().to_string(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

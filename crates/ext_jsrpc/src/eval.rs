//! Evaluation of `code` calls.
//!
//! The embedding decides how much of the page language it can run; this
//! crate only needs an [`Evaluator`]. [`ExpressionEvaluator`] covers the
//! forms a controller actually sends against a native realm:
//!
//! ```text
//! 42 / "text" / {"a": 1}        JSON literal
//! window.app.version            path read
//! app.sign("payload", 3)        path call with JSON arguments
//! ```

use serde_json::Value as Json;

use ext_intercept::{resolve, resolve_callable, Exception, Object, Value};

/// Runs a code string against the global scope.
pub trait Evaluator: Send + Sync {
    fn evaluate(&self, root: &Object, code: &str) -> Result<Value, Exception>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ExpressionEvaluator;

impl Evaluator for ExpressionEvaluator {
    fn evaluate(&self, root: &Object, code: &str) -> Result<Value, Exception> {
        let code = code.trim();
        let code = code.strip_suffix(';').unwrap_or(code).trim();
        if code.is_empty() {
            return Err(Exception::new("empty expression"));
        }

        if let Ok(literal) = serde_json::from_str::<Json>(code) {
            return Ok(Value::from(literal));
        }

        if let Some(open) = code.find('(') {
            let path = code[..open].trim();
            let inner = code[open + 1..]
                .strip_suffix(')')
                .ok_or_else(|| Exception::new(format!("unterminated call: {}", code)))?;
            if !is_path(path) {
                return Err(Exception::new(format!("unsupported expression: {}", code)));
            }
            let args: Vec<Json> = serde_json::from_str(&format!("[{}]", inner))
                .map_err(|e| Exception::new(format!("invalid arguments to {}: {}", path, e)))?;
            let function = resolve_callable(root, path)
                .ok_or_else(|| Exception::new(format!("{} is not a function", path)))?;
            let args: Vec<Value> = args.into_iter().map(Value::from).collect();
            return function.call(&Value::Object(root.clone()), &args);
        }

        if is_path(code) {
            return resolve(root, code).ok_or_else(|| Exception::new(format!("{} is not defined", code)));
        }

        Err(Exception::new(format!("unsupported expression: {}", code)))
    }
}

fn is_path(text: &str) -> bool {
    !text.is_empty()
        && text.split('.').all(|segment| {
            let mut chars = segment.chars();
            match chars.next() {
                Some(first) if first.is_alphabetic() || first == '_' || first == '$' => {
                    chars.all(|c| c.is_alphanumeric() || c == '_' || c == '$')
                }
                _ => false,
            }
        })
}

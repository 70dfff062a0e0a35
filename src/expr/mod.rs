//! Expression evaluation for workflow nodes
//!
//! Two grammars over a shared lexer: condition expressions (boolean
//! algebra over typed comparisons) and transform expressions (JSONPath
//! when the text starts with `$`, string templates otherwise). The
//! evaluators are pure: they see the variable context only through the
//! read-only [`VariableResolver`] view.

use crate::error::Result;
use serde_json::Value;

pub mod condition;
pub mod jsonpath;
pub mod lexer;
pub mod template;

/// Read-only view of variable bindings.
pub trait VariableResolver {
    fn resolve(&self, name: &str) -> Option<Value>;
}

impl VariableResolver for std::collections::HashMap<String, Value> {
    fn resolve(&self, name: &str) -> Option<Value> {
        self.get(name).cloned()
    }
}

impl VariableResolver for serde_json::Map<String, Value> {
    fn resolve(&self, name: &str) -> Option<Value> {
        self.get(name).cloned()
    }
}

/// How undefined variables are handled during template rendering.
#[derive(Debug, Clone)]
pub struct EvalOptions {
    /// Strict mode makes an undefined variable fatal.
    pub strict: bool,
    /// What an undefined variable renders as in lenient mode.
    pub missing_placeholder: String,
}

impl Default for EvalOptions {
    fn default() -> Self {
        Self {
            strict: false,
            missing_placeholder: String::new(),
        }
    }
}

impl EvalOptions {
    pub fn strict() -> Self {
        Self { strict: true, ..Self::default() }
    }
}

/// Evaluate a condition expression to a boolean.
pub fn evaluate_condition(expr: &str, vars: &dyn VariableResolver) -> Result<bool> {
    condition::evaluate(expr, vars)
}

/// Evaluate a transform expression against an input value.
///
/// Leading `$` selects JSONPath over the input; anything else is a
/// template rendered against the variable context.
pub fn evaluate_transform(
    expr: &str,
    input: &Value,
    vars: &dyn VariableResolver,
    options: &EvalOptions,
) -> Result<Value> {
    if expr.trim_start().starts_with('$') && !expr.trim_start().starts_with("${") {
        jsonpath::query(expr.trim(), input)
    } else {
        template::evaluate_value(expr, vars, options)
    }
}

//! Sandboxed scaling-equation evaluator
//!
//! Device parameters may carry a scaling equation in one variable `x`
//! (the value after the scaling factor has been applied). The evaluator
//! accepts arithmetic, parentheses, unary minus, the power operator and a
//! fixed set of math functions; nothing else. Equations are compiled once
//! per parameter and evaluated per reading.
//!
//! The evaluator is total: parse and evaluation failures are reported as
//! [`CalcError`], never panics, and a non-finite result is an error the
//! caller can use to fall back to the pre-equation value.

mod error;

pub use error::{CalcError, Result};

use evalexpr::{
    build_operator_tree, Context, ContextWithMutableFunctions, ContextWithMutableVariables,
    Function, HashMapContext, Node, Value,
};

/// Functions an equation is allowed to call
const ALLOWED_FUNCTIONS: &[&str] = &["sin", "cos", "exp", "ln", "sqrt", "abs"];

/// The only variable an equation may reference
const VARIABLE: &str = "x";

/// A compiled scaling equation over the single variable `x`
#[derive(Debug, Clone)]
pub struct ScalingEquation {
    source: String,
    tree: Node,
}

impl ScalingEquation {
    /// Compile an equation, rejecting identifiers outside the sandbox
    pub fn parse(source: &str) -> Result<Self> {
        let trimmed = source.trim();
        if trimmed.is_empty() {
            return Err(CalcError::Parse("empty equation".to_string()));
        }

        let tree = build_operator_tree(trimmed).map_err(|e| CalcError::Parse(e.to_string()))?;

        for identifier in tree.iter_variable_identifiers() {
            if identifier != VARIABLE {
                return Err(CalcError::ForbiddenIdentifier(identifier.to_string()));
            }
        }
        for identifier in tree.iter_function_identifiers() {
            if !ALLOWED_FUNCTIONS.contains(&identifier) {
                return Err(CalcError::ForbiddenIdentifier(identifier.to_string()));
            }
        }

        Ok(Self {
            source: trimmed.to_string(),
            tree,
        })
    }

    /// The equation text as supplied
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate the equation at `x`
    ///
    /// Returns [`CalcError::NonFinite`] if the result is NaN or infinite so
    /// callers can keep the pre-equation value.
    pub fn apply(&self, x: f64) -> Result<f64> {
        let context = build_context(x)?;

        let value = self
            .tree
            .eval_with_context(&context)
            .map_err(|e| CalcError::Evaluation(e.to_string()))?;

        let result = match value {
            Value::Float(f) => f,
            Value::Int(i) => i as f64,
            other => {
                return Err(CalcError::Evaluation(format!(
                    "equation produced a non-numeric value: {other:?}"
                )))
            },
        };

        if !result.is_finite() {
            return Err(CalcError::NonFinite);
        }

        Ok(result)
    }
}

/// Convenience one-shot evaluation for callers that do not cache the tree
pub fn evaluate(source: &str, x: f64) -> Result<f64> {
    ScalingEquation::parse(source)?.apply(x)
}

fn build_context(x: f64) -> Result<HashMapContext> {
    let mut context = HashMapContext::new();

    context
        .set_value(VARIABLE.to_string(), Value::Float(x))
        .map_err(|e| CalcError::Evaluation(e.to_string()))?;

    register_unary(&mut context, "sin", f64::sin)?;
    register_unary(&mut context, "cos", f64::cos)?;
    register_unary(&mut context, "exp", f64::exp)?;
    register_unary(&mut context, "ln", f64::ln)?;
    register_unary(&mut context, "sqrt", f64::sqrt)?;
    register_unary(&mut context, "abs", f64::abs)?;

    // Only the functions registered above are callable
    context.set_builtin_functions_disabled(true).ok();

    Ok(context)
}

fn register_unary(
    context: &mut HashMapContext,
    name: &str,
    f: fn(f64) -> f64,
) -> Result<()> {
    context
        .set_function(
            name.to_string(),
            Function::new(move |argument| {
                let x = argument.as_number()?;
                Ok(Value::Float(f(x)))
            }),
        )
        .map_err(|e| CalcError::Evaluation(e.to_string()))
}

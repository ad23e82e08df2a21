//! Error types for the scaling expression evaluator.

use thiserror::Error;

/// Errors produced while parsing or evaluating a scaling equation
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CalcError {
    /// The equation text could not be parsed
    #[error("Invalid equation: {0}")]
    Parse(String),

    /// The equation references an identifier outside the sandbox
    #[error("Forbidden identifier in equation: {0}")]
    ForbiddenIdentifier(String),

    /// Evaluation failed (type error, division shape, unknown function)
    #[error("Evaluation failed: {0}")]
    Evaluation(String),

    /// Evaluation succeeded but produced NaN or infinity
    #[error("Equation produced a non-finite result")]
    NonFinite,
}

/// Result type alias for the calc crate
pub type Result<T> = std::result::Result<T, CalcError>;

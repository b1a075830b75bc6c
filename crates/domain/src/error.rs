//! Unified error types for the domain layer
//!
//! Evaluation errors are values, not panics: a field that cannot be computed
//! is surfaced to callers as an explicit unavailable state, never silently
//! defaulted to null.

use thiserror::Error;

use crate::refs::FieldRef;

/// Errors produced by expression evaluation and dependency registration.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EvalError {
    /// Registering the dependency would close a cycle in the graph. The
    /// offending edge is rejected and the graph is left unchanged.
    #[error("Cycle detected: {source_field} already depends on {dependent}")]
    CycleDetected {
        source_field: FieldRef,
        dependent: FieldRef,
    },

    /// The expression references a field the evaluation context does not
    /// hold a value for.
    #[error("Missing dependency: {0}")]
    MissingDependency(String),

    /// Operand types are incompatible for the operator. Comparing a string
    /// to a number is an error, not `false`.
    #[error("Type mismatch: cannot apply {op} to {lhs} and {rhs}")]
    TypeMismatch {
        op: &'static str,
        lhs: &'static str,
        rhs: &'static str,
    },

    /// Division or modulo by zero.
    #[error("Division by zero")]
    DivisionByZero,

    /// Integer arithmetic left the i64 range. Wrapping silently would cache
    /// a wrong value, which is worse than refusing to compute one.
    #[error("Integer overflow in '{op}'")]
    Overflow { op: &'static str },
}

impl EvalError {
    pub fn missing(field: impl Into<String>) -> Self {
        Self::MissingDependency(field.into())
    }

    pub fn type_mismatch(op: &'static str, lhs: &'static str, rhs: &'static str) -> Self {
        Self::TypeMismatch { op, lhs, rhs }
    }
}

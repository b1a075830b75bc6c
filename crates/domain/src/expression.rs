//! Declarative rule expressions and their evaluator.
//!
//! Computed fields are defined as expression trees evaluated against an
//! [`EvalContext`] of already-resolved field values. The evaluator is a pure
//! function of (tree, context): no wall-clock reads, no randomness, no I/O.
//! Results are cached by the engine and must reproduce identically from the
//! same inputs.
//!
//! # Type coercion policy
//!
//! There is none. Comparing a string to a number is a [`EvalError::TypeMismatch`],
//! not `false` - a silent wrong answer here would propagate into cached
//! results and survive until the next invalidation.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::EvalError;

/// Runtime value produced by evaluation or supplied by entity state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Date(DateTime<Utc>),
    List(Vec<Value>),
}

impl Value {
    /// Type name used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Text(_) => "text",
            Value::Date(_) => "date",
            Value::List(_) => "list",
        }
    }

    fn as_bool(&self, op: &'static str) -> Result<bool, EvalError> {
        match self {
            Value::Bool(b) => Ok(*b),
            other => Err(EvalError::type_mismatch(op, other.type_name(), "bool")),
        }
    }
}

/// Comparison operators over numbers, strings, and dates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    fn name(&self) -> &'static str {
        match self {
            CompareOp::Eq => "==",
            CompareOp::Ne => "!=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
        }
    }
}

/// Arithmetic operators. Division and modulo by zero are evaluation errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

impl ArithOp {
    fn name(&self) -> &'static str {
        match self {
            ArithOp::Add => "+",
            ArithOp::Sub => "-",
            ArithOp::Mul => "*",
            ArithOp::Div => "/",
            ArithOp::Mod => "%",
        }
    }
}

/// A rule expression tree. Immutable once parsed; the closed variant set is
/// evaluated by structural recursion so every operator is statically covered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Expr {
    /// A literal value.
    Literal { value: Value },

    /// Reference to a field in the evaluation context.
    Field { name: String },

    /// Comparison between two sub-expressions.
    Compare {
        op: CompareOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },

    /// Logical AND with short-circuit: `rhs` is not evaluated when `lhs`
    /// is false.
    And { lhs: Box<Expr>, rhs: Box<Expr> },

    /// Logical OR with short-circuit: `rhs` is not evaluated when `lhs`
    /// is true.
    Or { lhs: Box<Expr>, rhs: Box<Expr> },

    /// Logical negation.
    Not { expr: Box<Expr> },

    /// Arithmetic over ints and floats.
    Arith {
        op: ArithOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },

    /// Membership test: `value` appears in `set`.
    In { value: Box<Expr>, set: Vec<Expr> },

    /// Ternary conditional. Only the taken branch is evaluated.
    If {
        condition: Box<Expr>,
        then_branch: Box<Expr>,
        else_branch: Box<Expr>,
    },
}

impl Expr {
    pub fn literal(value: Value) -> Self {
        Expr::Literal { value }
    }

    pub fn int(value: i64) -> Self {
        Expr::Literal {
            value: Value::Int(value),
        }
    }

    pub fn field(name: impl Into<String>) -> Self {
        Expr::Field { name: name.into() }
    }

    pub fn compare(op: CompareOp, lhs: Expr, rhs: Expr) -> Self {
        Expr::Compare {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    pub fn and(lhs: Expr, rhs: Expr) -> Self {
        Expr::And {
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    pub fn or(lhs: Expr, rhs: Expr) -> Self {
        Expr::Or {
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    pub fn not(expr: Expr) -> Self {
        Expr::Not {
            expr: Box::new(expr),
        }
    }

    pub fn arith(op: ArithOp, lhs: Expr, rhs: Expr) -> Self {
        Expr::Arith {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    pub fn is_in(value: Expr, set: Vec<Expr>) -> Self {
        Expr::In {
            value: Box::new(value),
            set,
        }
    }

    pub fn if_else(condition: Expr, then_branch: Expr, else_branch: Expr) -> Self {
        Expr::If {
            condition: Box::new(condition),
            then_branch: Box::new(then_branch),
            else_branch: Box::new(else_branch),
        }
    }

    /// All field names this expression may read, in first-appearance order,
    /// deduplicated. The engine turns these into dependency edges.
    ///
    /// This is the static over-approximation: a field behind an untaken
    /// conditional branch still counts as a dependency, because a change to
    /// it can flip which branch is taken on the next evaluation.
    pub fn referenced_fields(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_fields(&mut out);
        out
    }

    fn collect_fields(&self, out: &mut Vec<String>) {
        match self {
            Expr::Literal { .. } => {}
            Expr::Field { name } => {
                if !out.contains(name) {
                    out.push(name.clone());
                }
            }
            Expr::Compare { lhs, rhs, .. } | Expr::Arith { lhs, rhs, .. } => {
                lhs.collect_fields(out);
                rhs.collect_fields(out);
            }
            Expr::And { lhs, rhs } | Expr::Or { lhs, rhs } => {
                lhs.collect_fields(out);
                rhs.collect_fields(out);
            }
            Expr::Not { expr } => expr.collect_fields(out),
            Expr::In { value, set } => {
                value.collect_fields(out);
                for member in set {
                    member.collect_fields(out);
                }
            }
            Expr::If {
                condition,
                then_branch,
                else_branch,
            } => {
                condition.collect_fields(out);
                then_branch.collect_fields(out);
                else_branch.collect_fields(out);
            }
        }
    }

    /// Evaluate against a context of resolved field values.
    pub fn evaluate(&self, ctx: &EvalContext) -> Result<Value, EvalError> {
        match self {
            Expr::Literal { value } => Ok(value.clone()),

            Expr::Field { name } => ctx
                .get(name)
                .cloned()
                .ok_or_else(|| EvalError::missing(name.clone())),

            Expr::Compare { op, lhs, rhs } => {
                let lhs = lhs.evaluate(ctx)?;
                let rhs = rhs.evaluate(ctx)?;
                compare(*op, &lhs, &rhs).map(Value::Bool)
            }

            Expr::And { lhs, rhs } => {
                if !lhs.evaluate(ctx)?.as_bool("and")? {
                    return Ok(Value::Bool(false));
                }
                Ok(Value::Bool(rhs.evaluate(ctx)?.as_bool("and")?))
            }

            Expr::Or { lhs, rhs } => {
                if lhs.evaluate(ctx)?.as_bool("or")? {
                    return Ok(Value::Bool(true));
                }
                Ok(Value::Bool(rhs.evaluate(ctx)?.as_bool("or")?))
            }

            Expr::Not { expr } => Ok(Value::Bool(!expr.evaluate(ctx)?.as_bool("not")?)),

            Expr::Arith { op, lhs, rhs } => {
                let lhs = lhs.evaluate(ctx)?;
                let rhs = rhs.evaluate(ctx)?;
                arithmetic(*op, &lhs, &rhs)
            }

            Expr::In { value, set } => {
                let needle = value.evaluate(ctx)?;
                for member in set {
                    let member = member.evaluate(ctx)?;
                    if compare(CompareOp::Eq, &needle, &member)? {
                        return Ok(Value::Bool(true));
                    }
                }
                Ok(Value::Bool(false))
            }

            Expr::If {
                condition,
                then_branch,
                else_branch,
            } => {
                if condition.evaluate(ctx)?.as_bool("if")? {
                    then_branch.evaluate(ctx)
                } else {
                    else_branch.evaluate(ctx)
                }
            }
        }
    }
}

/// Resolved field values an expression may reference. Supplied by the
/// orchestrator; the evaluator itself never fetches anything.
#[derive(Debug, Clone, Default)]
pub struct EvalContext {
    values: HashMap<String, Value>,
}

impl EvalContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: Value) {
        self.values.insert(name.into(), value);
    }

    pub fn with(mut self, name: impl Into<String>, value: Value) -> Self {
        self.insert(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }
}

impl From<HashMap<String, Value>> for EvalContext {
    fn from(values: HashMap<String, Value>) -> Self {
        Self { values }
    }
}

fn compare(op: CompareOp, lhs: &Value, rhs: &Value) -> Result<bool, EvalError> {
    use std::cmp::Ordering;

    let ordering: Option<Ordering> = match (lhs, rhs) {
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        (Value::Bool(a), Value::Bool(b)) => {
            // Booleans support equality only; ordering booleans is a rule bug.
            return match op {
                CompareOp::Eq => Ok(a == b),
                CompareOp::Ne => Ok(a != b),
                _ => Err(EvalError::type_mismatch(op.name(), "bool", "bool")),
            };
        }
        (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
        (Value::Float(a), Value::Float(b)) => a.partial_cmp(b),
        (Value::Int(a), Value::Float(b)) => (*a as f64).partial_cmp(b),
        (Value::Float(a), Value::Int(b)) => a.partial_cmp(&(*b as f64)),
        (Value::Text(a), Value::Text(b)) => Some(a.cmp(b)),
        (Value::Date(a), Value::Date(b)) => Some(a.cmp(b)),
        _ => {
            return Err(EvalError::type_mismatch(
                op.name(),
                lhs.type_name(),
                rhs.type_name(),
            ))
        }
    };

    // NaN comparisons have no ordering; reject rather than guess.
    let ordering = ordering.ok_or_else(|| {
        EvalError::type_mismatch(op.name(), lhs.type_name(), rhs.type_name())
    })?;

    Ok(match op {
        CompareOp::Eq => ordering == Ordering::Equal,
        CompareOp::Ne => ordering != Ordering::Equal,
        CompareOp::Lt => ordering == Ordering::Less,
        CompareOp::Le => ordering != Ordering::Greater,
        CompareOp::Gt => ordering == Ordering::Greater,
        CompareOp::Ge => ordering != Ordering::Less,
    })
}

fn arithmetic(op: ArithOp, lhs: &Value, rhs: &Value) -> Result<Value, EvalError> {
    match (lhs, rhs) {
        (Value::Int(a), Value::Int(b)) => int_arithmetic(op, *a, *b),
        (Value::Float(a), Value::Float(b)) => float_arithmetic(op, *a, *b),
        (Value::Int(a), Value::Float(b)) => float_arithmetic(op, *a as f64, *b),
        (Value::Float(a), Value::Int(b)) => float_arithmetic(op, *a, *b as f64),
        _ => Err(EvalError::type_mismatch(
            op.name(),
            lhs.type_name(),
            rhs.type_name(),
        )),
    }
}

fn int_arithmetic(op: ArithOp, a: i64, b: i64) -> Result<Value, EvalError> {
    let result = match op {
        ArithOp::Add => a.checked_add(b),
        ArithOp::Sub => a.checked_sub(b),
        ArithOp::Mul => a.checked_mul(b),
        ArithOp::Div => {
            if b == 0 {
                return Err(EvalError::DivisionByZero);
            }
            a.checked_div(b)
        }
        ArithOp::Mod => {
            if b == 0 {
                return Err(EvalError::DivisionByZero);
            }
            a.checked_rem(b)
        }
    };
    result
        .map(Value::Int)
        .ok_or(EvalError::Overflow { op: op.name() })
}

fn float_arithmetic(op: ArithOp, a: f64, b: f64) -> Result<Value, EvalError> {
    let result = match op {
        ArithOp::Add => a + b,
        ArithOp::Sub => a - b,
        ArithOp::Mul => a * b,
        ArithOp::Div => {
            if b == 0.0 {
                return Err(EvalError::DivisionByZero);
            }
            a / b
        }
        ArithOp::Mod => {
            if b == 0.0 {
                return Err(EvalError::DivisionByZero);
            }
            a % b
        }
    };
    Ok(Value::Float(result))
}

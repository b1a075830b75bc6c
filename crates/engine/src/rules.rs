//! Computed-field rule definitions.
//!
//! A rule binds a field name on an entity kind to an expression tree, a TTL
//! class, and any child aggregations its context needs. The registry is
//! immutable once the engine is built; rules change by redeploying, not at
//! runtime.

use std::collections::HashMap;

use loreforge_domain::{EntityKind, EvalError, Expr, Value};

/// TTL class of a computed field's cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtlClass {
    /// Ordinary computed field.
    Computed,
    /// Derived expressions over slow-moving inputs; cached longer.
    LowVolatility,
}

/// How child field values are folded into one aggregate value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateOp {
    Sum,
    Count,
    Min,
    Max,
    Avg,
}

/// A child-entity aggregation feeding the rule's evaluation context, e.g.
/// `totalDefense = sum(Structure.defenseBonus for children)`.
#[derive(Debug, Clone)]
pub struct ChildAggregate {
    /// Context key the aggregated value is bound to.
    pub context_key: String,
    pub child_kind: EntityKind,
    pub child_field: String,
    pub op: AggregateOp,
}

/// One computed field's declarative definition.
#[derive(Debug, Clone)]
pub struct ComputedRule {
    pub field: String,
    pub expr: Expr,
    pub ttl: TtlClass,
    pub aggregates: Vec<ChildAggregate>,
}

impl ComputedRule {
    pub fn new(field: impl Into<String>, expr: Expr) -> Self {
        Self {
            field: field.into(),
            expr,
            ttl: TtlClass::Computed,
            aggregates: Vec::new(),
        }
    }

    pub fn low_volatility(mut self) -> Self {
        self.ttl = TtlClass::LowVolatility;
        self
    }

    pub fn with_aggregate(
        mut self,
        context_key: impl Into<String>,
        child_kind: EntityKind,
        child_field: impl Into<String>,
        op: AggregateOp,
    ) -> Self {
        self.aggregates.push(ChildAggregate {
            context_key: context_key.into(),
            child_kind,
            child_field: child_field.into(),
            op,
        });
        self
    }
}

/// All computed-field rules, keyed by entity kind and field name.
#[derive(Debug, Clone, Default)]
pub struct RuleRegistry {
    rules: HashMap<(EntityKind, String), ComputedRule>,
}

impl RuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, kind: EntityKind, rule: ComputedRule) -> Self {
        self.rules.insert((kind, rule.field.clone()), rule);
        self
    }

    pub fn get(&self, kind: EntityKind, field: &str) -> Option<&ComputedRule> {
        self.rules.get(&(kind, field.to_string()))
    }

    /// Whether a field is computed (rule-defined) rather than stored.
    pub fn is_computed(&self, kind: EntityKind, field: &str) -> bool {
        self.rules.contains_key(&(kind, field.to_string()))
    }
}

/// Fold child values per the aggregate operator.
///
/// Sum over an empty set is zero; Min/Max/Avg over an empty set are `Null`
/// (there is no value to report, which is distinct from a failure).
pub fn aggregate(op: AggregateOp, values: &[Value]) -> Result<Value, EvalError> {
    if op == AggregateOp::Count {
        return Ok(Value::Int(values.len() as i64));
    }
    if values.is_empty() {
        return Ok(match op {
            AggregateOp::Sum => Value::Int(0),
            _ => Value::Null,
        });
    }

    let mut ints: Vec<i64> = Vec::with_capacity(values.len());
    let mut numbers: Vec<f64> = Vec::with_capacity(values.len());
    for value in values {
        match value {
            Value::Int(n) => {
                ints.push(*n);
                numbers.push(*n as f64);
            }
            Value::Float(f) => numbers.push(*f),
            other => {
                return Err(EvalError::type_mismatch(
                    "aggregate",
                    other.type_name(),
                    "number",
                ))
            }
        }
    }

    // All-integer inputs fold in integer arithmetic: a detour through f64
    // silently rounds sums past 2^53. Averages always promote.
    if ints.len() == values.len() && op != AggregateOp::Avg {
        return match op {
            AggregateOp::Sum => {
                let mut total: i64 = 0;
                for n in &ints {
                    total = total
                        .checked_add(*n)
                        .ok_or(EvalError::Overflow { op: "sum" })?;
                }
                Ok(Value::Int(total))
            }
            AggregateOp::Min => Ok(Value::Int(ints.iter().copied().fold(i64::MAX, i64::min))),
            AggregateOp::Max => Ok(Value::Int(ints.iter().copied().fold(i64::MIN, i64::max))),
            AggregateOp::Avg | AggregateOp::Count => unreachable!("handled above"),
        };
    }

    let result = match op {
        AggregateOp::Sum => numbers.iter().sum(),
        AggregateOp::Min => numbers.iter().copied().fold(f64::INFINITY, f64::min),
        AggregateOp::Max => numbers.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        AggregateOp::Avg => numbers.iter().sum::<f64>() / numbers.len() as f64,
        AggregateOp::Count => unreachable!("handled above"),
    };
    Ok(Value::Float(result))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sum_of_ints_stays_int() {
        let values = vec![Value::Int(5), Value::Int(10)];
        assert_eq!(aggregate(AggregateOp::Sum, &values), Ok(Value::Int(15)));
    }

    #[test]
    fn int_sum_is_exact_past_float_precision() {
        // (2^53 + 1) + 2 is not representable through an f64 round trip.
        let big = (1_i64 << 53) + 1;
        let values = vec![Value::Int(big), Value::Int(2)];
        assert_eq!(aggregate(AggregateOp::Sum, &values), Ok(Value::Int(big + 2)));
        assert_eq!(
            aggregate(AggregateOp::Max, &[Value::Int(big), Value::Int(2)]),
            Ok(Value::Int(big))
        );
    }

    #[test]
    fn int_sum_overflow_is_an_error() {
        let values = vec![Value::Int(i64::MAX), Value::Int(1)];
        assert!(matches!(
            aggregate(AggregateOp::Sum, &values),
            Err(EvalError::Overflow { .. })
        ));
    }

    #[test]
    fn mixed_int_float_inputs_promote_to_float() {
        let values = vec![Value::Int(1), Value::Float(2.5)];
        assert_eq!(aggregate(AggregateOp::Sum, &values), Ok(Value::Float(3.5)));
    }

    #[test]
    fn sum_of_empty_set_is_zero() {
        assert_eq!(aggregate(AggregateOp::Sum, &[]), Ok(Value::Int(0)));
    }

    #[test]
    fn count_ignores_value_types() {
        let values = vec![Value::Text("a".to_string()), Value::Int(1)];
        assert_eq!(aggregate(AggregateOp::Count, &values), Ok(Value::Int(2)));
    }

    #[test]
    fn min_max_over_empty_set_is_null() {
        assert_eq!(aggregate(AggregateOp::Min, &[]), Ok(Value::Null));
        assert_eq!(aggregate(AggregateOp::Max, &[]), Ok(Value::Null));
    }

    #[test]
    fn avg_is_always_float() {
        let values = vec![Value::Int(1), Value::Int(2)];
        assert_eq!(aggregate(AggregateOp::Avg, &values), Ok(Value::Float(1.5)));
        let values = vec![Value::Int(2), Value::Int(2)];
        assert_eq!(aggregate(AggregateOp::Avg, &values), Ok(Value::Float(2.0)));
    }

    #[test]
    fn non_numeric_aggregate_input_is_type_mismatch() {
        let values = vec![Value::Text("tower".to_string())];
        assert!(matches!(
            aggregate(AggregateOp::Sum, &values),
            Err(EvalError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn registry_distinguishes_computed_from_stored_fields() {
        let registry = RuleRegistry::new().register(
            EntityKind::Settlement,
            ComputedRule::new("totalDefense", Expr::field("defenseSum")),
        );
        assert!(registry.is_computed(EntityKind::Settlement, "totalDefense"));
        assert!(!registry.is_computed(EntityKind::Settlement, "population"));
        assert!(!registry.is_computed(EntityKind::Structure, "totalDefense"));
    }
}

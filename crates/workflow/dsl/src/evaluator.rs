//! Condition evaluation against a [`ConditionContext`]
//!
//! Comparison rules:
//!
//! - An undefined operand makes every comparison false, except explicit
//!   `NULL` / `UNDEFINED` checks. `NULL` matches null, empty text and
//!   undefined values; `UNDEFINED` matches only undefined values.
//! - Equality is numeric when both sides are numbers (or numeric text with
//!   at least one real number), otherwise case-sensitive text. `~=` compares
//!   text case-insensitively.
//! - Ordering operators require numeric operands.
//! - `IN` tests membership of the left value (or of every left list item)
//!   in the right list; `CONTAINS` tests substrings on text and membership
//!   on lists.

use crate::context::{ConditionContext, Value};
use crate::errors::{DslError, DslResult};
use crate::parser::{CompareOp, Comparison, Expression, Operand, Parser};

/// Evaluates parsed or textual conditions
#[derive(Clone, Copy, Debug, Default)]
pub struct ConditionEvaluator;

impl ConditionEvaluator {
    pub fn new() -> Self {
        Self
    }

    /// Parse and evaluate a single condition
    pub fn evaluate_str(&self, condition: &str, ctx: &dyn ConditionContext) -> DslResult<bool> {
        let expr = Parser::parse(condition)?;
        self.evaluate(&expr, ctx)
    }

    /// Evaluate several conditions combined with AND; blank entries are
    /// skipped and an empty list holds
    pub fn evaluate_all(
        &self,
        conditions: &[String],
        ctx: &dyn ConditionContext,
    ) -> DslResult<bool> {
        for condition in conditions.iter().filter(|c| !c.trim().is_empty()) {
            if !self.evaluate_str(condition, ctx)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    pub fn evaluate(&self, expr: &Expression, ctx: &dyn ConditionContext) -> DslResult<bool> {
        match expr {
            Expression::Or(l, r) => Ok(self.evaluate(l, ctx)? || self.evaluate(r, ctx)?),
            Expression::And(l, r) => Ok(self.evaluate(l, ctx)? && self.evaluate(r, ctx)?),
            Expression::Not(inner) => Ok(!self.evaluate(inner, ctx)?),
            Expression::Compare(cmp) => self.compare(cmp, ctx),
        }
    }

    fn compare(&self, cmp: &Comparison, ctx: &dyn ConditionContext) -> DslResult<bool> {
        if let Some(result) = null_check(cmp, ctx) {
            return Ok(result);
        }

        let left = resolve(&cmp.left, ctx);
        let right = resolve(&cmp.right, ctx);
        if left.is_undefined() || right.is_undefined() {
            return Ok(false);
        }

        match cmp.op {
            CompareOp::Eq => Ok(values_equal(&left, &right, false)),
            CompareOp::NotEq => Ok(!values_equal(&left, &right, false)),
            CompareOp::EqIgnoreCase => Ok(values_equal(&left, &right, true)),
            CompareOp::Gt | CompareOp::Lt | CompareOp::Ge | CompareOp::Le => {
                let (l, r) = match (left.as_number(), right.as_number()) {
                    (Some(l), Some(r)) => (l, r),
                    _ => {
                        return Err(DslError::TypeMismatch {
                            op: cmp.op.to_string(),
                            left: left.to_string(),
                            right: right.to_string(),
                        })
                    }
                };
                Ok(match cmp.op {
                    CompareOp::Gt => l > r,
                    CompareOp::Lt => l < r,
                    CompareOp::Ge => l >= r,
                    _ => l <= r,
                })
            }
            CompareOp::In => Ok(is_in(&left, &right)),
            CompareOp::NotIn => Ok(!is_in(&left, &right)),
            CompareOp::Contains => Ok(contains(&left, &right)),
            CompareOp::NotContains => Ok(!contains(&left, &right)),
        }
    }
}

/// Handles comparisons with a `NULL` or `UNDEFINED` keyword operand
fn null_check(cmp: &Comparison, ctx: &dyn ConditionContext) -> Option<bool> {
    let (keyword, other) = match (&cmp.left, &cmp.right) {
        (k @ (Operand::Null | Operand::Undefined), other) => (k, other),
        (other, k @ (Operand::Null | Operand::Undefined)) => (k, other),
        _ => return None,
    };
    let value = resolve(other, ctx);
    let matches = match keyword {
        Operand::Undefined => value.is_undefined(),
        _ => match &value {
            Value::Undefined | Value::Null => true,
            Value::Text(s) => s.is_empty(),
            _ => false,
        },
    };
    Some(match cmp.op {
        CompareOp::Eq | CompareOp::EqIgnoreCase => matches,
        CompareOp::NotEq => !matches,
        _ => false,
    })
}

fn resolve(operand: &Operand, ctx: &dyn ConditionContext) -> Value {
    match operand {
        Operand::Literal(s) => Value::Text(s.clone()),
        Operand::Number(n) => Value::Number(*n),
        Operand::Null => Value::Null,
        Operand::Undefined => Value::Undefined,
        Operand::Param(r) => ctx.resolve(r),
        Operand::List(items) => Value::List(items.iter().map(|i| resolve(i, ctx)).collect()),
    }
}

fn values_equal(left: &Value, right: &Value, ignore_case: bool) -> bool {
    match (left, right) {
        (Value::Undefined, _) | (_, Value::Undefined) => false,
        (Value::Null, Value::Null) => true,
        (Value::Null, _) | (_, Value::Null) => false,
        (Value::List(l), Value::List(r)) => {
            l.len() == r.len()
                && l
                    .iter()
                    .zip(r.iter())
                    .all(|(a, b)| values_equal(a, b, ignore_case))
        }
        (Value::Number(_), _) | (_, Value::Number(_)) => {
            match (left.as_number(), right.as_number()) {
                (Some(l), Some(r)) => l == r,
                _ => text_equal(left, right, ignore_case),
            }
        }
        _ => text_equal(left, right, ignore_case),
    }
}

fn text_equal(left: &Value, right: &Value, ignore_case: bool) -> bool {
    let (l, r) = (left.to_string(), right.to_string());
    if ignore_case {
        l.to_lowercase() == r.to_lowercase()
    } else {
        l == r
    }
}

fn is_in(needle: &Value, haystack: &Value) -> bool {
    let items: &[Value] = match haystack {
        Value::List(items) => items,
        single => std::slice::from_ref(single),
    };
    match needle {
        Value::List(needles) => needles
            .iter()
            .all(|n| items.iter().any(|i| values_equal(n, i, false))),
        single => items.iter().any(|i| values_equal(single, i, false)),
    }
}

fn contains(haystack: &Value, needle: &Value) -> bool {
    match haystack {
        Value::List(_) => is_in(needle, haystack),
        Value::Text(text) => text.contains(&needle.to_string()),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::StaticContext;
    use proptest::prelude::*;

    fn ctx() -> StaticContext {
        StaticContext::new()
            .with("context.executions.seg.result.score", Value::Number(0.93))
            .unwrap()
            .with("context.executions.seg.result.finding", Value::text("Positive"))
            .unwrap()
            .with("context.executions.seg.result.note", Value::Null)
            .unwrap()
            .with("context.executions.seg.status", Value::text("Succeeded"))
            .unwrap()
            .with("context.dicom.series.any('0010','0040')", Value::text("F"))
            .unwrap()
            .with("context.dicom.series.all('0008','0060')", Value::text("CT"))
            .unwrap()
            .with(
                "context.executions.seg.result.labels",
                Value::List(vec![Value::text("liver"), Value::text("spleen")]),
            )
            .unwrap()
    }

    fn eval(condition: &str) -> bool {
        ConditionEvaluator::new()
            .evaluate_str(condition, &ctx())
            .unwrap()
    }

    #[test]
    fn test_literal_equality() {
        assert!(eval("'true' == 'true'"));
        assert!(!eval("'false' == 'true'"));
        assert!(eval("'false' != 'true'"));
    }

    #[test]
    fn test_equality_is_case_sensitive() {
        assert!(!eval("{{ context.executions.seg.result.finding }} == 'positive'"));
        assert!(eval("{{ context.executions.seg.result.finding }} ~= 'positive'"));
    }

    #[test]
    fn test_numeric_comparisons() {
        assert!(eval("{{ context.executions.seg.result.score }} > 0.8"));
        assert!(eval("{{ context.executions.seg.result.score }} => 0.93"));
        assert!(!eval("{{ context.executions.seg.result.score }} < '0.5'"));
        assert!(eval("{{ context.executions.seg.result.score }} == '0.930'"));
    }

    #[test]
    fn test_ordering_on_text_is_a_type_mismatch() {
        let err = ConditionEvaluator::new()
            .evaluate_str("{{ context.executions.seg.result.finding }} > 1", &ctx())
            .unwrap_err();
        assert!(matches!(err, DslError::TypeMismatch { .. }));
    }

    #[test]
    fn test_undefined_comparisons_are_false() {
        assert!(!eval("{{ context.executions.other.status }} == 'Succeeded'"));
        assert!(!eval("{{ context.executions.other.status }} != 'Succeeded'"));
        assert!(!eval("{{ context.executions.other.result.x }} > 1"));
        assert!(!eval("{{ context.executions.other.status }} IN ['a']"));
        assert!(!eval("{{ context.executions.other.status }} NOT IN ['a']"));
    }

    #[test]
    fn test_null_and_undefined_checks() {
        assert!(eval("{{ context.executions.other.status }} == NULL"));
        assert!(eval("{{ context.executions.other.status }} == UNDEFINED"));
        assert!(eval("{{ context.executions.seg.result.note }} == NULL"));
        assert!(!eval("{{ context.executions.seg.result.note }} == UNDEFINED"));
        assert!(eval("{{ context.executions.seg.status }} != NULL"));
        assert!(eval("NULL == {{ context.executions.other.status }}"));
    }

    #[test]
    fn test_in_and_contains() {
        assert!(eval("{{ context.dicom.series.all('0008','0060') }} IN ['CT', 'MR']"));
        assert!(eval("{{ context.dicom.series.any('0010','0040') }} NOT IN ['M']"));
        assert!(eval("{{ context.executions.seg.result.labels }} CONTAINS 'liver'"));
        assert!(eval("['liver'] IN {{ context.executions.seg.result.labels }}"));
        assert!(eval("{{ context.executions.seg.result.finding }} CONTAINS 'osit'"));
        assert!(eval("{{ context.executions.seg.result.finding }} NOT CONTAINS 'neg'"));
    }

    #[test]
    fn test_boolean_operators() {
        assert!(eval("'a' == 'b' OR ('c' == 'c' AND NOT 'd' == 'e')"));
        assert!(!eval("'a' == 'a' AND 'b' == 'c'"));
        assert!(eval("'a' == 'a' and 'b' == 'b'"));
    }

    #[test]
    fn test_evaluate_all() {
        let evaluator = ConditionEvaluator::new();
        let c = ctx();
        assert!(evaluator.evaluate_all(&[], &c).unwrap());
        assert!(evaluator
            .evaluate_all(&["'a' == 'a'".into(), "  ".into()], &c)
            .unwrap());
        assert!(!evaluator
            .evaluate_all(&["'a' == 'a'".into(), "'a' == 'b'".into()], &c)
            .unwrap());
        assert!(evaluator
            .evaluate_all(&["'a' == ".into()], &c)
            .is_err());
    }

    proptest! {
        #[test]
        fn prop_eq_and_not_eq_are_complementary(a in "[a-z0-9]{0,8}", b in "[a-z0-9]{0,8}") {
            let evaluator = ConditionEvaluator::new();
            let empty = StaticContext::new();
            let eq = evaluator.evaluate_str(&format!("'{}' == '{}'", a, b), &empty).unwrap();
            let ne = evaluator.evaluate_str(&format!("'{}' != '{}'", a, b), &empty).unwrap();
            prop_assert_ne!(eq, ne);
        }

        #[test]
        fn prop_undefined_never_satisfies_equality(v in "[a-zA-Z]{1,8}") {
            let evaluator = ConditionEvaluator::new();
            let empty = StaticContext::new();
            let cond = format!("{{{{ context.executions.t.result.k }}}} == '{}'", v);
            prop_assert!(!evaluator.evaluate_str(&cond, &empty).unwrap());
        }
    }
}

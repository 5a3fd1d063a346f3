//! Postcondition rule-sets to the Applied/Available/Health triad.

use serde_json::Value;

use crate::model::{Condition, ConditionStatus, ConditionType};
use crate::rules::{EvaluationError, Rule};

/// Conditions produced by [`aggregate`].
#[derive(Debug, Clone, PartialEq)]
pub struct AggregatedConditions {
    pub applied: Condition,
    pub available: Condition,
    pub health: Condition,
}

impl AggregatedConditions {
    pub fn into_vec(self) -> Vec<Condition> {
        vec![self.applied, self.available, self.health]
    }
}

/// Evaluate postconditions against the action's sub-status.
///
/// `Applied` and `Available` need every rule of their set to pass (an empty
/// set passes). `Health` is False as soon as any rule in `health_failure`
/// passes. The first evaluation error aborts the whole aggregation.
pub fn aggregate(
    applied: &[Rule],
    available: &[Rule],
    health_failure: &[Rule],
    context: &Value,
) -> Result<AggregatedConditions, EvaluationError> {
    Ok(AggregatedConditions {
        applied: all_pass(ConditionType::Applied, applied, context)?,
        available: all_pass(ConditionType::Available, available, context)?,
        health: health(health_failure, context)?,
    })
}

fn all_pass(kind: ConditionType, rules: &[Rule], context: &Value) -> Result<Condition, EvaluationError> {
    for (idx, rule) in rules.iter().enumerate() {
        if !rule.evaluate(context)? {
            return Ok(Condition::new(
                kind,
                ConditionStatus::False,
                "RuleFailed",
                format!("rule {idx} failed: {rule}"),
            ));
        }
    }
    Ok(Condition::new(
        kind,
        ConditionStatus::True,
        "AllRulesPassed",
        format!("{} rule(s) passed", rules.len()),
    ))
}

fn health(failure: &[Rule], context: &Value) -> Result<Condition, EvaluationError> {
    for (idx, rule) in failure.iter().enumerate() {
        if rule.evaluate(context)? {
            return Ok(Condition::new(
                ConditionType::Health,
                ConditionStatus::False,
                "FailureDetected",
                format!("failure rule {idx} matched: {rule}"),
            ));
        }
    }
    Ok(Condition::new(
        ConditionType::Health,
        ConditionStatus::True,
        "Healthy",
        "no failure rule matched",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::Operator;
    use serde_json::json;

    fn flag(name: &str) -> Rule {
        Rule::field(&format!("action.{name}"), Operator::Eq, json!(true)).unwrap()
    }

    fn ctx(a: bool, b: bool, f: bool) -> Value {
        json!({"action": {"a": a, "b": b, "f": f}})
    }

    #[test]
    fn test_available_is_and_health_is_or() {
        let available = [flag("a"), flag("b")];
        let failure = [flag("f")];

        for a in [false, true] {
            for b in [false, true] {
                for f in [false, true] {
                    let result = aggregate(&[], &available, &failure, &ctx(a, b, f)).unwrap();
                    assert_eq!(result.available.status.is_true(), a && b, "a={a} b={b} f={f}");
                    assert_eq!(result.health.status.is_true(), !f, "a={a} b={b} f={f}");
                    assert!(result.applied.status.is_true());
                }
            }
        }
    }

    #[test]
    fn test_reasons() {
        let result = aggregate(&[flag("a")], &[flag("b")], &[flag("f")], &ctx(true, false, true)).unwrap();
        assert_eq!(result.applied.reason, "AllRulesPassed");
        assert_eq!(result.available.reason, "RuleFailed");
        assert!(result.available.message.starts_with("rule 0 failed"));
        assert_eq!(result.health.reason, "FailureDetected");

        let conditions = result.into_vec();
        assert_eq!(
            conditions.iter().map(|c| c.kind).collect::<Vec<_>>(),
            vec![ConditionType::Applied, ConditionType::Available, ConditionType::Health]
        );
    }

    #[test]
    fn test_errors_propagate() {
        let broken = Rule::field("action.missing", Operator::Gt, json!(1)).unwrap();
        let err = aggregate(&[], &[broken], &[], &ctx(true, true, false)).unwrap_err();
        assert!(matches!(err, EvaluationError::MissingField { .. }));
    }
}

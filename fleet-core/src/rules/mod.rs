//! Declarative rule evaluation.
//!
//! Rules are expression trees evaluated against a JSON document. A field rule
//! compares the value at a path with a literal or with the value at another
//! path; groups combine rules with `and`/`or`. A slice of rules is an implicit
//! `and`.
//!
//! ```yaml
//! - field: resource.status.phase
//!   operator: ne
//!   value: Terminated
//! - operator: or
//!   operands:
//!     - field: adapters[adapter=validation].observed_generation
//!       operator: eq
//!       field_ref: resource.generation
//!     - field: resource.labels.skip-validation
//!       operator: exists
//! ```
//!
//! Evaluation is a pure function of its inputs.

mod compare;
mod path;
mod template;

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub use path::{FieldPath, PathError};
pub use template::{TemplateError, render_template};

use compare::{order, type_name, values_equal};

/// Errors raised while evaluating rules.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvaluationError {
    /// A value comparison referenced a path that does not resolve.
    #[error("field '{path}' is missing")]
    MissingField { path: String },

    /// The rule itself is malformed.
    #[error("rule on '{field}' is invalid: {reason}")]
    InvalidRule { field: String, reason: String },

    /// The operand has the wrong shape for the operator.
    #[error("operator {operator} on '{field}' expects {expected}, got {actual}")]
    InvalidOperand {
        field: String,
        operator: Operator,
        expected: &'static str,
        actual: &'static str,
    },

    /// The field value and the operand cannot be compared.
    #[error("cannot apply {operator} to '{field}': {actual} vs {expected}")]
    TypeMismatch {
        field: String,
        operator: Operator,
        actual: &'static str,
        expected: &'static str,
    },
}

/// Comparison operators for field rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Operator {
    Eq,
    Ne,
    In,
    #[serde(alias = "not_in")]
    NotIn,
    Contains,
    Exists,
    #[serde(alias = "not_exists")]
    NotExists,
    Gt,
    Lt,
    Gte,
    Lte,
}

impl Operator {
    /// Whether the operator compares against a value or `field_ref`.
    pub fn needs_operand(self) -> bool {
        !matches!(self, Operator::Exists | Operator::NotExists)
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operator::Eq => "eq",
            Operator::Ne => "ne",
            Operator::In => "in",
            Operator::NotIn => "notIn",
            Operator::Contains => "contains",
            Operator::Exists => "exists",
            Operator::NotExists => "notExists",
            Operator::Gt => "gt",
            Operator::Lt => "lt",
            Operator::Gte => "gte",
            Operator::Lte => "lte",
        };
        f.write_str(name)
    }
}

/// Logical operator of a rule group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupOperator {
    And,
    Or,
}

/// A rule: either a field comparison or a logical group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Rule {
    Group(GroupRule),
    Field(FieldRule),
}

/// Explicit `and`/`or` over nested rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GroupRule {
    pub operator: GroupOperator,
    pub operands: Vec<Rule>,
}

/// Comparison of the value at `field` with `value` or with the value at `field_ref`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FieldRule {
    pub field: FieldPath,
    pub operator: Operator,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, alias = "fieldRef", skip_serializing_if = "Option::is_none")]
    pub field_ref: Option<FieldPath>,
}

/// AND-combine a rule-set.
pub fn evaluate(rules: &[Rule], context: &Value) -> Result<bool, EvaluationError> {
    for rule in rules {
        if !rule.evaluate(context)? {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Check a rule-set for malformed rules without evaluating it.
pub fn validate(rules: &[Rule]) -> Result<(), EvaluationError> {
    rules.iter().try_for_each(Rule::validate)
}

impl Rule {
    pub fn field(field: &str, operator: Operator, value: Value) -> Result<Self, PathError> {
        Ok(Rule::Field(FieldRule {
            field: FieldPath::parse(field)?,
            operator,
            value: Some(value),
            field_ref: None,
        }))
    }

    pub fn field_ref(field: &str, operator: Operator, other: &str) -> Result<Self, PathError> {
        Ok(Rule::Field(FieldRule {
            field: FieldPath::parse(field)?,
            operator,
            value: None,
            field_ref: Some(FieldPath::parse(other)?),
        }))
    }

    pub fn exists(field: &str) -> Result<Self, PathError> {
        Ok(Rule::Field(FieldRule {
            field: FieldPath::parse(field)?,
            operator: Operator::Exists,
            value: None,
            field_ref: None,
        }))
    }

    pub fn any(operands: Vec<Rule>) -> Self {
        Rule::Group(GroupRule {
            operator: GroupOperator::Or,
            operands,
        })
    }

    pub fn all(operands: Vec<Rule>) -> Self {
        Rule::Group(GroupRule {
            operator: GroupOperator::And,
            operands,
        })
    }

    /// Evaluate this rule. An empty `or` group is false, an empty `and` group true.
    pub fn evaluate(&self, context: &Value) -> Result<bool, EvaluationError> {
        match self {
            Rule::Field(rule) => rule.evaluate(context),
            Rule::Group(group) => match group.operator {
                GroupOperator::And => evaluate(&group.operands, context),
                GroupOperator::Or => {
                    for operand in &group.operands {
                        if operand.evaluate(context)? {
                            return Ok(true);
                        }
                    }
                    Ok(false)
                }
            },
        }
    }

    pub fn validate(&self) -> Result<(), EvaluationError> {
        match self {
            Rule::Field(rule) => rule.validate(),
            Rule::Group(group) => validate(&group.operands),
        }
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rule::Field(rule) => match (&rule.value, &rule.field_ref) {
                (_, Some(other)) => write!(f, "{} {} {}", rule.field, rule.operator, other),
                (Some(value), None) => write!(f, "{} {} {}", rule.field, rule.operator, value),
                (None, None) => write!(f, "{} {}", rule.field, rule.operator),
            },
            Rule::Group(group) => {
                let op = match group.operator {
                    GroupOperator::And => "and",
                    GroupOperator::Or => "or",
                };
                write!(f, "{op}(")?;
                for (i, operand) in group.operands.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{operand}")?;
                }
                write!(f, ")")
            }
        }
    }
}

impl FieldRule {
    fn validate(&self) -> Result<(), EvaluationError> {
        let invalid = |reason: &str| EvaluationError::InvalidRule {
            field: self.field.to_string(),
            reason: reason.to_string(),
        };
        match (self.operator.needs_operand(), &self.value, &self.field_ref) {
            (_, Some(_), Some(_)) => Err(invalid("value and field_ref are mutually exclusive")),
            (true, None, None) => Err(invalid(&format!(
                "operator {} requires a value or field_ref",
                self.operator
            ))),
            (false, Some(_), _) | (false, _, Some(_)) => Err(invalid(&format!(
                "operator {} takes no operand",
                self.operator
            ))),
            _ => Ok(()),
        }
    }

    pub fn evaluate(&self, context: &Value) -> Result<bool, EvaluationError> {
        self.validate()?;
        let actual = self.field.resolve(context);

        match self.operator {
            Operator::Exists => return Ok(actual.is_some()),
            Operator::NotExists => return Ok(actual.is_none()),
            _ => {}
        }

        let expected = match (&self.value, &self.field_ref) {
            (_, Some(other)) => match other.resolve(context) {
                Some(value) => value,
                None if self.operator == Operator::Ne => return Ok(true),
                None => {
                    return Err(EvaluationError::MissingField {
                        path: other.to_string(),
                    });
                }
            },
            (Some(value), None) => value,
            // rejected by validate()
            (None, None) => return Ok(false),
        };

        let Some(actual) = actual else {
            if self.operator == Operator::Ne {
                return Ok(true);
            }
            return Err(EvaluationError::MissingField {
                path: self.field.to_string(),
            });
        };

        self.compare(actual, expected)
    }

    fn compare(&self, actual: &Value, expected: &Value) -> Result<bool, EvaluationError> {
        let mismatch = || EvaluationError::TypeMismatch {
            field: self.field.to_string(),
            operator: self.operator,
            actual: type_name(actual),
            expected: type_name(expected),
        };

        match self.operator {
            Operator::Eq => Ok(values_equal(actual, expected)),
            Operator::Ne => Ok(!values_equal(actual, expected)),
            Operator::In | Operator::NotIn => {
                let candidates = expected
                    .as_array()
                    .ok_or_else(|| EvaluationError::InvalidOperand {
                        field: self.field.to_string(),
                        operator: self.operator,
                        expected: "array",
                        actual: type_name(expected),
                    })?;
                let found = candidates.iter().any(|c| values_equal(actual, c));
                Ok(found == (self.operator == Operator::In))
            }
            Operator::Contains => match actual {
                Value::String(haystack) => expected
                    .as_str()
                    .map(|needle| haystack.contains(needle))
                    .ok_or_else(mismatch),
                Value::Array(items) => Ok(items.iter().any(|item| values_equal(item, expected))),
                Value::Object(map) => expected
                    .as_str()
                    .map(|key| map.contains_key(key))
                    .ok_or_else(mismatch),
                _ => Err(mismatch()),
            },
            Operator::Gt | Operator::Lt | Operator::Gte | Operator::Lte => {
                let ordering = order(actual, expected).ok_or_else(mismatch)?;
                Ok(match self.operator {
                    Operator::Gt => ordering.is_gt(),
                    Operator::Lt => ordering.is_lt(),
                    Operator::Gte => ordering.is_ge(),
                    _ => ordering.is_le(),
                })
            }
            Operator::Exists | Operator::NotExists => Ok(false),
        }
    }
}

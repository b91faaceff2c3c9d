//! Structural validation of LLM payloads against named contracts.
//!
//! Validation is pure: the same `(schema, payload)` pair always yields the same
//! result, and errors come back in schema declaration order so that corrective
//! prompts built from them are reproducible.

use crate::schema::contracts;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemaName {
    IdeaEnrichment,
    BusinessModel,
    IndustryMoat,
    FinancialForensics,
    CapitalAllocation,
    ManagementQuality,
    Valuation,
    RiskStress,
    Scenarios,
}

impl SchemaName {
    pub fn as_str(&self) -> &'static str {
        match self {
            SchemaName::IdeaEnrichment => "idea_enrichment",
            SchemaName::BusinessModel => "business_model",
            SchemaName::IndustryMoat => "industry_moat",
            SchemaName::FinancialForensics => "financial_forensics",
            SchemaName::CapitalAllocation => "capital_allocation",
            SchemaName::ManagementQuality => "management_quality",
            SchemaName::Valuation => "valuation",
            SchemaName::RiskStress => "risk_stress",
            SchemaName::Scenarios => "scenarios",
        }
    }
}

impl fmt::Display for SchemaName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub enum Shape {
    String { min_len: usize },
    Number { min: Option<f64>, max: Option<f64> },
    Integer { min: Option<i64>, max: Option<i64> },
    Boolean,
    Enum(&'static [&'static str]),
    Array { items: Box<Shape>, min_items: usize },
    Object(Vec<Field>),
    Nullable(Box<Shape>),
}

#[derive(Debug, Clone)]
pub struct Field {
    pub name: &'static str,
    pub shape: Shape,
    pub required: bool,
}

// Small constructors so contracts read like declarations.
impl Shape {
    pub fn text() -> Self {
        Shape::String { min_len: 1 }
    }

    pub fn number() -> Self {
        Shape::Number {
            min: None,
            max: None,
        }
    }

    pub fn ranged(min: f64, max: f64) -> Self {
        Shape::Number {
            min: Some(min),
            max: Some(max),
        }
    }

    pub fn array_of(items: Shape) -> Self {
        Shape::Array {
            items: Box::new(items),
            min_items: 0,
        }
    }

    pub fn non_empty_array_of(items: Shape) -> Self {
        Shape::Array {
            items: Box::new(items),
            min_items: 1,
        }
    }

    pub fn nullable(inner: Shape) -> Self {
        Shape::Nullable(Box::new(inner))
    }

    /// Human description used as the `expected` side of a field error.
    pub fn describe(&self) -> String {
        match self {
            Shape::String { min_len } if *min_len > 0 => "non-empty string".to_string(),
            Shape::String { .. } => "string".to_string(),
            Shape::Number { min, max } => match (min, max) {
                (Some(lo), Some(hi)) => format!("number in [{lo}, {hi}]"),
                (Some(lo), None) => format!("number >= {lo}"),
                (None, Some(hi)) => format!("number <= {hi}"),
                (None, None) => "number".to_string(),
            },
            Shape::Integer { min, max } => match (min, max) {
                (Some(lo), Some(hi)) => format!("integer in [{lo}, {hi}]"),
                (Some(lo), None) => format!("integer >= {lo}"),
                (None, Some(hi)) => format!("integer <= {hi}"),
                (None, None) => "integer".to_string(),
            },
            Shape::Boolean => "boolean".to_string(),
            Shape::Enum(values) => format!("one of [{}]", values.join(", ")),
            Shape::Array { items, min_items } if *min_items > 0 => {
                format!("array of {} with at least {min_items} item(s)", items.describe())
            }
            Shape::Array { items, .. } => format!("array of {}", items.describe()),
            Shape::Object(_) => "object".to_string(),
            Shape::Nullable(inner) => format!("{} or null", inner.describe()),
        }
    }
}

impl Field {
    pub fn required(name: &'static str, shape: Shape) -> Self {
        Self {
            name,
            shape,
            required: true,
        }
    }

    pub fn optional(name: &'static str, shape: Shape) -> Self {
        Self {
            name,
            shape,
            required: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    pub path: String,
    pub expected: String,
    pub actual: String,
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "`{}`: expected {}, found {}",
            self.path, self.expected, self.actual
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Validation {
    Valid(Value),
    Invalid(Vec<FieldError>),
}

impl Validation {
    pub fn is_valid(&self) -> bool {
        matches!(self, Validation::Valid(_))
    }
}

/// Validate `payload` against the named contract.
pub fn validate(schema: SchemaName, payload: &Value) -> Validation {
    validate_shape(contracts::shape(schema), payload)
}

pub fn validate_shape(shape: &Shape, payload: &Value) -> Validation {
    let mut errors = Vec::new();
    check(shape, payload, "$", &mut errors);
    if errors.is_empty() {
        Validation::Valid(payload.clone())
    } else {
        Validation::Invalid(errors)
    }
}

pub fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn mismatch(path: &str, shape: &Shape, actual: impl Into<String>, errors: &mut Vec<FieldError>) {
    errors.push(FieldError {
        path: path.to_string(),
        expected: shape.describe(),
        actual: actual.into(),
    });
}

fn check(shape: &Shape, value: &Value, path: &str, errors: &mut Vec<FieldError>) {
    match shape {
        Shape::Nullable(inner) => {
            if !value.is_null() {
                check(inner, value, path, errors);
            }
        }
        Shape::String { min_len } => match value.as_str() {
            Some(s) if s.trim().chars().count() >= *min_len => {}
            Some(_) => mismatch(path, shape, "empty string", errors),
            None => mismatch(path, shape, kind_of(value), errors),
        },
        Shape::Number { min, max } => match value.as_f64() {
            Some(n) => {
                let below = min.is_some_and(|lo| n < lo);
                let above = max.is_some_and(|hi| n > hi);
                if below || above {
                    mismatch(path, shape, format!("{} {n}", kind_of(value)), errors);
                }
            }
            None => mismatch(path, shape, kind_of(value), errors),
        },
        Shape::Integer { min, max } => match value.as_i64() {
            Some(n) => {
                let below = min.is_some_and(|lo| n < lo);
                let above = max.is_some_and(|hi| n > hi);
                if below || above {
                    mismatch(path, shape, format!("integer {n}"), errors);
                }
            }
            None => mismatch(path, shape, kind_of(value), errors),
        },
        Shape::Boolean => {
            if !value.is_boolean() {
                mismatch(path, shape, kind_of(value), errors);
            }
        }
        Shape::Enum(allowed) => match value.as_str() {
            Some(s) if allowed.contains(&s) => {}
            Some(s) => mismatch(path, shape, format!("string \"{s}\""), errors),
            None => mismatch(path, shape, kind_of(value), errors),
        },
        Shape::Array { items, min_items } => match value.as_array() {
            Some(arr) => {
                if arr.len() < *min_items {
                    mismatch(path, shape, format!("array of {} item(s)", arr.len()), errors);
                }
                for (i, item) in arr.iter().enumerate() {
                    check(items, item, &format!("{path}[{i}]"), errors);
                }
            }
            None => mismatch(path, shape, kind_of(value), errors),
        },
        Shape::Object(fields) => match value.as_object() {
            Some(map) => {
                for field in fields {
                    let child = format!("{path}.{}", field.name);
                    match map.get(field.name) {
                        Some(v) => check(&field.shape, v, &child, errors),
                        None if field.required => mismatch(&child, &field.shape, "missing", errors),
                        None => {}
                    }
                }
            }
            None => mismatch(path, shape, kind_of(value), errors),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn position_shape() -> Shape {
        Shape::Object(vec![
            Field::required("ticker", Shape::text()),
            Field::required("weight", Shape::ranged(0.0, 1.0)),
            Field::optional("notes", Shape::nullable(Shape::text())),
            Field::required(
                "legs",
                Shape::non_empty_array_of(Shape::Object(vec![
                    Field::required("side", Shape::Enum(&["long", "short"])),
                    Field::required(
                        "size",
                        Shape::Integer {
                            min: Some(1),
                            max: None,
                        },
                    ),
                ])),
            ),
        ])
    }

    #[test]
    fn accepts_valid_nested_payload() {
        let payload = json!({
            "ticker": "ACME",
            "weight": 0.25,
            "notes": null,
            "legs": [{"side": "long", "size": 10}],
            "extra": "ignored"
        });
        assert_eq!(
            validate_shape(&position_shape(), &payload),
            Validation::Valid(payload.clone())
        );
    }

    #[test]
    fn reports_paths_expected_and_actual_kinds() {
        let payload = json!({
            "weight": "high",
            "legs": [{"side": "sideways", "size": 2.5}]
        });
        let Validation::Invalid(errors) = validate_shape(&position_shape(), &payload) else {
            panic!("expected invalid payload");
        };

        assert_eq!(errors.len(), 4);
        assert_eq!(errors[0].path, "$.ticker");
        assert_eq!(errors[0].actual, "missing");
        assert_eq!(errors[1].path, "$.weight");
        assert_eq!(errors[1].expected, "number in [0, 1]");
        assert_eq!(errors[1].actual, "string");
        assert_eq!(errors[2].path, "$.legs[0].side");
        assert_eq!(errors[2].actual, "string \"sideways\"");
        assert_eq!(errors[3].path, "$.legs[0].size");
        assert_eq!(errors[3].actual, "number");
    }

    #[test]
    fn empty_array_below_minimum_is_rejected() {
        let payload = json!({"ticker": "ACME", "weight": 0.1, "legs": []});
        let Validation::Invalid(errors) = validate_shape(&position_shape(), &payload) else {
            panic!("expected invalid payload");
        };
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].path, "$.legs");
        assert_eq!(errors[0].actual, "array of 0 item(s)");
    }

    #[test]
    fn out_of_range_number_names_the_value() {
        let payload = json!({"ticker": "ACME", "weight": 1.5, "legs": [{"side": "short", "size": 1}]});
        let Validation::Invalid(errors) = validate_shape(&position_shape(), &payload) else {
            panic!("expected invalid payload");
        };
        assert_eq!(errors[0].actual, "number 1.5");
    }

    #[test]
    fn validation_is_deterministic() {
        let payload = json!({"legs": "nope"});
        let a = validate_shape(&position_shape(), &payload);
        let b = validate_shape(&position_shape(), &payload);
        assert_eq!(a, b);
    }

    #[test]
    fn non_object_root_is_a_single_error() {
        let Validation::Invalid(errors) = validate(SchemaName::Valuation, &json!([1, 2])) else {
            panic!("expected invalid payload");
        };
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].path, "$");
        assert_eq!(errors[0].actual, "array");
    }
}

// Workflow Conditions - Field/operator/value predicates evaluated against event payloads

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Comparison operators understood by the evaluator.
///
/// Anything else parses to `Unknown` and never matches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConditionOperator {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    Contains,
    In,
    Exists,
    NotExists,
    Regex,
    Unknown,
}

impl ConditionOperator {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "eq" => Self::Eq,
            "neq" | "ne" => Self::Neq,
            "gt" => Self::Gt,
            "gte" => Self::Gte,
            "lt" => Self::Lt,
            "lte" => Self::Lte,
            "contains" => Self::Contains,
            "in" => Self::In,
            "exists" => Self::Exists,
            "not_exists" => Self::NotExists,
            "regex" => Self::Regex,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Eq => "eq",
            Self::Neq => "neq",
            Self::Gt => "gt",
            Self::Gte => "gte",
            Self::Lt => "lt",
            Self::Lte => "lte",
            Self::Contains => "contains",
            Self::In => "in",
            Self::Exists => "exists",
            Self::NotExists => "not_exists",
            Self::Regex => "regex",
            Self::Unknown => "unknown",
        }
    }
}

impl Serialize for ConditionOperator {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ConditionOperator {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::parse(&raw))
    }
}

/// A single condition to evaluate
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Condition {
    /// Dotted path into the payload (`lead.score`, `items.0.sku`)
    pub field_path: String,
    pub operator: ConditionOperator,
    #[serde(default)]
    pub value: serde_json::Value,
}

impl Condition {
    pub fn new(field_path: &str, operator: ConditionOperator, value: serde_json::Value) -> Self {
        Self {
            field_path: field_path.to_string(),
            operator,
            value,
        }
    }

    pub fn eq(field_path: &str, value: serde_json::Value) -> Self {
        Self::new(field_path, ConditionOperator::Eq, value)
    }

    pub fn neq(field_path: &str, value: serde_json::Value) -> Self {
        Self::new(field_path, ConditionOperator::Neq, value)
    }

    pub fn gt(field_path: &str, value: serde_json::Value) -> Self {
        Self::new(field_path, ConditionOperator::Gt, value)
    }

    pub fn lt(field_path: &str, value: serde_json::Value) -> Self {
        Self::new(field_path, ConditionOperator::Lt, value)
    }

    pub fn contains(field_path: &str, value: serde_json::Value) -> Self {
        Self::new(field_path, ConditionOperator::Contains, value)
    }

    pub fn in_list(field_path: &str, values: Vec<serde_json::Value>) -> Self {
        Self::new(field_path, ConditionOperator::In, serde_json::Value::Array(values))
    }

    pub fn exists(field_path: &str) -> Self {
        Self::new(field_path, ConditionOperator::Exists, serde_json::Value::Bool(true))
    }

    /// Parse the builder shorthand `{"score": {"operator": "gt", "value": 50}}`.
    /// A bare value (`{"status": "new"}`) means equality.
    pub fn from_shorthand(field_path: &str, shorthand: &serde_json::Value) -> Self {
        match shorthand {
            serde_json::Value::Object(map) if map.contains_key("operator") => {
                let operator = map
                    .get("operator")
                    .and_then(|v| v.as_str())
                    .map(ConditionOperator::parse)
                    .unwrap_or(ConditionOperator::Unknown);
                let value = map.get("value").cloned().unwrap_or(serde_json::Value::Null);
                Self::new(field_path, operator, value)
            }
            other => Self::eq(field_path, other.clone()),
        }
    }

    /// Evaluate against a JSON document. Pure: same inputs, same answer.
    pub fn evaluate(&self, document: &serde_json::Value) -> bool {
        let actual = resolve_path(document, &self.field_path);

        match self.operator {
            ConditionOperator::Exists => {
                let present = actual.map(|v| !v.is_null()).unwrap_or(false);
                present == self.value.as_bool().unwrap_or(true)
            }
            ConditionOperator::NotExists => actual.map(|v| v.is_null()).unwrap_or(true),
            _ => match actual {
                Some(actual) => compare(&self.operator, actual, &self.value),
                None => false,
            },
        }
    }
}

/// AND-combined condition list. There is no OR combinator.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct ConditionSet {
    pub conditions: Vec<Condition>,
}

impl ConditionSet {
    pub fn new(conditions: Vec<Condition>) -> Self {
        Self { conditions }
    }

    /// Parse the `{field: shorthand}` map form used by trigger nodes.
    pub fn from_map(map: &serde_json::Map<String, serde_json::Value>) -> Self {
        Self {
            conditions: map
                .iter()
                .map(|(field, shorthand)| Condition::from_shorthand(field, shorthand))
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.conditions.len()
    }

    /// Empty set matches unconditionally.
    pub fn matches(&self, document: &serde_json::Value) -> bool {
        self.conditions.iter().all(|c| c.evaluate(document))
    }
}

/// Dotted lookup. Object keys by name, array elements by numeric segment.
pub fn resolve_path<'a>(document: &'a serde_json::Value, path: &str) -> Option<&'a serde_json::Value> {
    let mut current = document;

    for segment in path.split('.').filter(|s| !s.is_empty()) {
        current = match current {
            serde_json::Value::Object(map) => map.get(segment)?,
            serde_json::Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }

    Some(current)
}

/// Compare two values with numeric coercion and string fallback.
pub fn compare(operator: &ConditionOperator, actual: &serde_json::Value, expected: &serde_json::Value) -> bool {
    match operator {
        ConditionOperator::Eq => loosely_equal(actual, expected),
        ConditionOperator::Neq => !loosely_equal(actual, expected),
        ConditionOperator::Gt => ordering(actual, expected) == Some(Ordering::Greater),
        ConditionOperator::Gte => matches!(ordering(actual, expected), Some(Ordering::Greater | Ordering::Equal)),
        ConditionOperator::Lt => ordering(actual, expected) == Some(Ordering::Less),
        ConditionOperator::Lte => matches!(ordering(actual, expected), Some(Ordering::Less | Ordering::Equal)),
        ConditionOperator::Contains => match actual {
            serde_json::Value::Array(items) => items.iter().any(|item| loosely_equal(item, expected)),
            serde_json::Value::Object(map) => expected.as_str().map(|k| map.contains_key(k)).unwrap_or(false),
            other => as_text(other).contains(&as_text(expected)),
        },
        ConditionOperator::In => match expected {
            serde_json::Value::Array(items) => items.iter().any(|item| loosely_equal(actual, item)),
            serde_json::Value::String(haystack) => haystack.contains(&as_text(actual)),
            _ => false,
        },
        ConditionOperator::Regex => match expected.as_str().map(regex::Regex::new) {
            Some(Ok(re)) => re.is_match(&as_text(actual)),
            _ => false,
        },
        ConditionOperator::Exists | ConditionOperator::NotExists => false,
        ConditionOperator::Unknown => false,
    }
}

fn loosely_equal(a: &serde_json::Value, b: &serde_json::Value) -> bool {
    match (as_number(a), as_number(b)) {
        (Some(x), Some(y)) => x == y,
        _ => as_text(a) == as_text(b),
    }
}

fn ordering(a: &serde_json::Value, b: &serde_json::Value) -> Option<Ordering> {
    if a.is_null() || b.is_null() {
        return None;
    }
    match (as_number(a), as_number(b)) {
        (Some(x), Some(y)) => x.partial_cmp(&y),
        _ => Some(as_text(a).cmp(&as_text(b))),
    }
}

fn as_number(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse::<f64>().ok().filter(|n| n.is_finite()),
        _ => None,
    }
}

/// Text form used for lexical comparison and template rendering.
pub fn as_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

//! Conditions over transaction documents
//!
//! Supports:
//! - Field path navigation (e.g., "request.path", "server.port")
//! - Comparison operators (equals, not_equals, contains, etc.)
//! - List membership (in, not_in)
//! - Pattern matching (matches regex)
//! - Numeric comparisons (gt, lt, gte, lte)
//! - Boolean logic (all, any, not)

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// A dotted path into a transaction document
/// e.g., "protocol", "request.method", "response.status_code"
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldPath(pub String);

impl FieldPath {
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    /// Resolve the path against a JSON document
    pub fn extract(&self, doc: &Value) -> Option<FieldValue> {
        let mut current = doc;

        for segment in self.0.split('.') {
            match current {
                Value::Object(map) => {
                    current = map.get(segment)?;
                }
                Value::Array(arr) => {
                    // "response.answers.0"
                    let idx = segment.parse::<usize>().ok()?;
                    current = arr.get(idx)?;
                }
                _ => return None,
            }
        }

        Some(FieldValue::from_json(current))
    }
}

impl From<&str> for FieldPath {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for FieldPath {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A value extracted from a document field
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    String(String),
    Number(f64),
    Bool(bool),
    Array(Vec<FieldValue>),
    Null,
}

impl FieldValue {
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::String(s) => FieldValue::String(s.clone()),
            Value::Number(n) => FieldValue::Number(n.as_f64().unwrap_or(0.0)),
            Value::Bool(b) => FieldValue::Bool(*b),
            Value::Array(arr) => FieldValue::Array(arr.iter().map(Self::from_json).collect()),
            Value::Null => FieldValue::Null,
            Value::Object(_) => FieldValue::String(value.to_string()),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Numbers, or strings that parse as numbers
    pub fn as_number(&self) -> Option<f64> {
        match self {
            FieldValue::Number(n) => Some(*n),
            FieldValue::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    fn eq_with_case(&self, other: &FieldValue, ignore_case: bool) -> bool {
        match (self, other) {
            (FieldValue::String(a), FieldValue::String(b)) if ignore_case => {
                a.eq_ignore_ascii_case(b)
            }
            (FieldValue::Number(a), FieldValue::Number(b)) => (a - b).abs() < f64::EPSILON,
            _ => self == other,
        }
    }
}

/// Comparison operators for conditions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOp {
    Equals,
    NotEquals,
    /// String contains substring
    Contains,
    NotContains,
    StartsWith,
    EndsWith,
    /// Regex match
    Matches,
    /// Value is in list
    In,
    NotIn,
    Gt,
    Gte,
    Lt,
    Lte,
    /// Field present and not null
    Exists,
    NotExists,
}

impl ConditionOp {
    fn needs_value(self) -> bool {
        !matches!(self, ConditionOp::Exists | ConditionOp::NotExists)
    }
}

/// A predicate over a transaction document
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Condition {
    /// Simple field comparison
    Simple {
        field: FieldPath,
        op: ConditionOp,
        #[serde(default)]
        value: Option<Value>,
        /// Case-insensitive comparison (for string ops)
        #[serde(default)]
        ignore_case: bool,
    },
    /// All conditions must match (AND)
    All { all: Vec<Condition> },
    /// Any condition must match (OR)
    Any { any: Vec<Condition> },
    /// Negate a condition (NOT)
    Not { not: Box<Condition> },
}

impl Condition {
    pub fn simple(field: impl Into<FieldPath>, op: ConditionOp, value: impl Into<Value>) -> Self {
        Condition::Simple {
            field: field.into(),
            op,
            value: Some(value.into()),
            ignore_case: false,
        }
    }

    pub fn equals(field: impl Into<FieldPath>, value: impl Into<Value>) -> Self {
        Self::simple(field, ConditionOp::Equals, value)
    }

    pub fn is_in(field: impl Into<FieldPath>, values: Vec<Value>) -> Self {
        Self::simple(field, ConditionOp::In, Value::Array(values))
    }

    pub fn exists(field: impl Into<FieldPath>) -> Self {
        Condition::Simple {
            field: field.into(),
            op: ConditionOp::Exists,
            value: None,
            ignore_case: false,
        }
    }

    pub fn all(conditions: Vec<Condition>) -> Self {
        Condition::All { all: conditions }
    }

    pub fn any(conditions: Vec<Condition>) -> Self {
        Condition::Any { any: conditions }
    }

    pub fn negate(condition: Condition) -> Self {
        Condition::Not {
            not: Box::new(condition),
        }
    }

    /// Check operands and compile every regex the condition uses
    pub fn compile(&self, patterns: &mut Patterns) -> Result<(), String> {
        match self {
            Condition::Simple {
                field,
                op,
                value,
                ignore_case,
            } => {
                if op.needs_value() && value.is_none() {
                    return Err(format!("condition on '{}' is missing a value", field.0));
                }
                if matches!(op, ConditionOp::In | ConditionOp::NotIn)
                    && !value.as_ref().is_some_and(Value::is_array)
                {
                    return Err(format!("'{:?}' on '{}' expects a list", op, field.0));
                }
                if *op == ConditionOp::Matches {
                    let pattern = value
                        .as_ref()
                        .and_then(Value::as_str)
                        .ok_or_else(|| format!("'matches' on '{}' expects a string", field.0))?;
                    patterns.insert(pattern, *ignore_case)?;
                }
                Ok(())
            }
            Condition::All { all: list } | Condition::Any { any: list } => {
                list.iter().try_for_each(|c| c.compile(patterns))
            }
            Condition::Not { not } => not.compile(patterns),
        }
    }

    /// Evaluate against a document
    pub fn evaluate(&self, doc: &Value, patterns: &Patterns) -> bool {
        match self {
            Condition::Simple {
                field,
                op,
                value,
                ignore_case,
            } => evaluate_simple(field, *op, value.as_ref(), *ignore_case, doc, patterns),
            Condition::All { all } => all.iter().all(|c| c.evaluate(doc, patterns)),
            Condition::Any { any } => any.iter().any(|c| c.evaluate(doc, patterns)),
            Condition::Not { not } => !not.evaluate(doc, patterns),
        }
    }
}

/// Compiled regexes keyed by pattern and case mode
#[derive(Debug, Default)]
pub struct Patterns {
    compiled: HashMap<(String, bool), Regex>,
}

impl Patterns {
    fn insert(&mut self, pattern: &str, ignore_case: bool) -> Result<(), String> {
        let key = (pattern.to_string(), ignore_case);
        if self.compiled.contains_key(&key) {
            return Ok(());
        }
        let source = if ignore_case {
            format!("(?i){}", pattern)
        } else {
            pattern.to_string()
        };
        let regex = Regex::new(&source).map_err(|e| format!("invalid pattern '{}': {}", pattern, e))?;
        self.compiled.insert(key, regex);
        Ok(())
    }

    fn get(&self, pattern: &str, ignore_case: bool) -> Option<&Regex> {
        self.compiled.get(&(pattern.to_string(), ignore_case))
    }
}

fn evaluate_simple(
    field: &FieldPath,
    op: ConditionOp,
    expected: Option<&Value>,
    ignore_case: bool,
    doc: &Value,
    patterns: &Patterns,
) -> bool {
    let actual = field.extract(doc).filter(|v| !v.is_null());

    match op {
        ConditionOp::Exists => actual.is_some(),
        ConditionOp::NotExists => actual.is_none(),
        // Negative string/list operators hold for absent fields
        ConditionOp::NotContains | ConditionOp::NotIn | ConditionOp::NotEquals
            if actual.is_none() =>
        {
            true
        }
        _ => match (actual, expected) {
            (Some(actual), Some(expected)) => {
                evaluate_comparison(&actual, op, expected, ignore_case, patterns)
            }
            _ => false,
        },
    }
}

fn evaluate_comparison(
    actual: &FieldValue,
    op: ConditionOp,
    expected: &Value,
    ignore_case: bool,
    patterns: &Patterns,
) -> bool {
    let fold = |s: &str| {
        if ignore_case {
            s.to_lowercase()
        } else {
            s.to_string()
        }
    };
    let strings = || match (actual.as_str(), expected.as_str()) {
        (Some(a), Some(e)) => Some((fold(a), fold(e))),
        _ => None,
    };
    let numbers = || match (actual.as_number(), expected.as_f64()) {
        (Some(a), Some(e)) => Some((a, e)),
        _ => None,
    };
    let member = || {
        expected.as_array().is_some_and(|list| {
            list.iter()
                .any(|v| actual.eq_with_case(&FieldValue::from_json(v), ignore_case))
        })
    };

    match op {
        ConditionOp::Equals => actual.eq_with_case(&FieldValue::from_json(expected), ignore_case),
        ConditionOp::NotEquals => {
            !actual.eq_with_case(&FieldValue::from_json(expected), ignore_case)
        }
        ConditionOp::Contains => strings().is_some_and(|(a, e)| a.contains(&e)),
        ConditionOp::NotContains => strings().map_or(true, |(a, e)| !a.contains(&e)),
        ConditionOp::StartsWith => strings().is_some_and(|(a, e)| a.starts_with(&e)),
        ConditionOp::EndsWith => strings().is_some_and(|(a, e)| a.ends_with(&e)),
        ConditionOp::Matches => match (actual.as_str(), expected.as_str()) {
            (Some(a), Some(pattern)) => patterns
                .get(pattern, ignore_case)
                .is_some_and(|re| re.is_match(a)),
            _ => false,
        },
        ConditionOp::In => member(),
        ConditionOp::NotIn => !member(),
        ConditionOp::Gt => numbers().is_some_and(|(a, e)| a > e),
        ConditionOp::Gte => numbers().is_some_and(|(a, e)| a >= e),
        ConditionOp::Lt => numbers().is_some_and(|(a, e)| a < e),
        ConditionOp::Lte => numbers().is_some_and(|(a, e)| a <= e),
        ConditionOp::Exists => true,
        ConditionOp::NotExists => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc() -> Value {
        json!({
            "protocol": "http",
            "status": "ok",
            "server": { "ip": "10.0.0.2", "port": 8080 },
            "request": { "method": "GET", "path": "/healthz", "user_agent": "kube-probe/1.29" },
            "response": { "status_code": 200, "answers": ["a", "b"] }
        })
    }

    fn eval(condition: &Condition) -> bool {
        let mut patterns = Patterns::default();
        condition.compile(&mut patterns).unwrap();
        condition.evaluate(&doc(), &patterns)
    }

    #[test]
    fn test_field_extraction() {
        let d = doc();
        assert_eq!(
            FieldPath::new("request.method").extract(&d),
            Some(FieldValue::String("GET".into()))
        );
        assert_eq!(
            FieldPath::new("server.port").extract(&d),
            Some(FieldValue::Number(8080.0))
        );
        assert_eq!(
            FieldPath::new("response.answers.1").extract(&d),
            Some(FieldValue::String("b".into()))
        );
        assert_eq!(FieldPath::new("request.missing").extract(&d), None);
    }

    #[test]
    fn test_string_ops() {
        assert!(eval(&Condition::equals("request.method", "GET")));
        assert!(!eval(&Condition::equals("request.method", "get")));
        assert!(eval(&Condition::Simple {
            field: "request.method".into(),
            op: ConditionOp::Equals,
            value: Some("get".into()),
            ignore_case: true,
        }));
        assert!(eval(&Condition::simple(
            "request.path",
            ConditionOp::StartsWith,
            "/health"
        )));
        assert!(eval(&Condition::simple(
            "request.user_agent",
            ConditionOp::Contains,
            "probe"
        )));
        assert!(eval(&Condition::simple(
            "request.user_agent",
            ConditionOp::Matches,
            r"^kube-probe/\d+"
        )));
    }

    #[test]
    fn test_numeric_and_membership() {
        assert!(eval(&Condition::simple(
            "response.status_code",
            ConditionOp::Lt,
            400
        )));
        assert!(eval(&Condition::is_in(
            "server.port",
            vec![80.into(), 8080.into()]
        )));
        assert!(eval(&Condition::simple(
            "protocol",
            ConditionOp::NotIn,
            json!(["dns", "tls"])
        )));
    }

    #[test]
    fn test_boolean_logic() {
        let cond = Condition::all(vec![
            Condition::equals("protocol", "http"),
            Condition::negate(Condition::equals("status", "error")),
            Condition::any(vec![
                Condition::equals("request.method", "POST"),
                Condition::equals("request.method", "GET"),
            ]),
        ]);
        assert!(eval(&cond));
    }

    #[test]
    fn test_existence() {
        assert!(eval(&Condition::exists("response")));
        assert!(!eval(&Condition::exists("latency_ms")));
        // Negative operators hold on absent fields
        assert!(eval(&Condition::simple(
            "request.host",
            ConditionOp::NotEquals,
            "example.com"
        )));
    }

    #[test]
    fn test_compile_errors() {
        let mut patterns = Patterns::default();
        let bad_regex = Condition::simple("request.path", ConditionOp::Matches, "(");
        assert!(bad_regex.compile(&mut patterns).is_err());

        let missing_value = Condition::Simple {
            field: "protocol".into(),
            op: ConditionOp::Equals,
            value: None,
            ignore_case: false,
        };
        assert!(missing_value.compile(&mut patterns).is_err());

        let in_scalar = Condition::simple("protocol", ConditionOp::In, "http");
        assert!(in_scalar.compile(&mut patterns).is_err());
    }

    #[test]
    fn test_deserialize_nested() {
        let cond: Condition = serde_json::from_value(json!({
            "any": [
                { "field": "protocol", "op": "equals", "value": "dns" },
                { "not": { "field": "response", "op": "exists" } }
            ]
        }))
        .unwrap();
        assert!(!eval(&cond));
    }
}

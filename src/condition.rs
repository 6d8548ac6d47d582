//! Targeting conditions.
//!
//! A condition is a JSON document in a MongoDB-like query language: `{"country": "US",
//! "age": {"$gte": 18}}`. Evaluation is total: malformed conditions, unknown operators and type
//! mismatches evaluate to `false` instead of failing.
use std::{cmp::Ordering, collections::HashMap};

use derive_more::From;
use regex::Regex;
use semver::{BuildMetadata, Version};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{attributes::get_path, Attributes};

/// Saved groups by id, referenced by `$inGroup` and `$notInGroup`.
pub(crate) type SavedGroups = HashMap<String, Vec<Value>>;

/// A targeting condition.
///
/// ```
/// # use splitkit::{Attributes, Condition};
/// # use serde_json::json;
/// let condition = Condition::from(json!({ "age": { "$gte": 18 } }));
/// let attributes: Attributes = serde_json::from_value(json!({ "age": 17 })).unwrap();
/// assert!(!condition.matches(&attributes));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, From)]
#[serde(transparent)]
pub struct Condition(Value);

impl Condition {
    /// Return `true` if `attributes` satisfy the condition.
    pub fn matches(&self, attributes: &Attributes) -> bool {
        self.matches_with_groups(attributes, &SavedGroups::new())
    }

    pub(crate) fn matches_with_groups(
        &self,
        attributes: &Attributes,
        saved_groups: &SavedGroups,
    ) -> bool {
        match &self.0 {
            Value::Object(condition) => eval_condition(attributes, condition, saved_groups),
            _ => false,
        }
    }
}

/// Evaluate `condition` against `attributes`. Shorthand for [`Condition::matches`].
pub fn matches(condition: &Condition, attributes: &Attributes) -> bool {
    condition.matches(attributes)
}

/// Top-level keys form a conjunction.
fn eval_condition(
    attributes: &Attributes,
    condition: &Map<String, Value>,
    groups: &SavedGroups,
) -> bool {
    condition.iter().all(|(key, value)| match key.as_str() {
        "$or" => eval_or(attributes, value, groups).unwrap_or(false),
        "$nor" => eval_or(attributes, value, groups).map_or(false, |any| !any),
        "$and" => eval_and(attributes, value, groups).unwrap_or(false),
        "$not" => match value {
            Value::Object(inner) => !eval_condition(attributes, inner, groups),
            _ => false,
        },
        path => eval_condition_value(value, get_path(attributes, path), groups),
    })
}

fn eval_or(attributes: &Attributes, conditions: &Value, groups: &SavedGroups) -> Option<bool> {
    let conditions = conditions.as_array()?;
    if conditions.is_empty() {
        return Some(true);
    }
    Some(conditions.iter().any(|condition| {
        condition
            .as_object()
            .is_some_and(|condition| eval_condition(attributes, condition, groups))
    }))
}

fn eval_and(attributes: &Attributes, conditions: &Value, groups: &SavedGroups) -> Option<bool> {
    let conditions = conditions.as_array()?;
    Some(conditions.iter().all(|condition| {
        condition
            .as_object()
            .is_some_and(|condition| eval_condition(attributes, condition, groups))
    }))
}

/// An object is an operator object if it's non-empty and all its keys start with `$`.
fn is_operator_object(object: &Map<String, Value>) -> bool {
    !object.is_empty() && object.keys().all(|key| key.starts_with('$'))
}

fn eval_condition_value(expected: &Value, actual: Option<&Value>, groups: &SavedGroups) -> bool {
    if let Value::Object(operators) = expected {
        if is_operator_object(operators) {
            return operators.iter().all(|(operator, operand)| {
                Operator::parse(operator).is_some_and(|op| op.eval(actual, operand, groups))
            });
        }
    }

    match actual {
        Some(actual) => json_eq(actual, expected),
        None => expected.is_null(),
    }
}

/// JSON equality with numbers compared by value (`1 == 1.0`).
fn json_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(x, y)| json_eq(x, y))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x.iter()
                    .all(|(key, x)| y.get(key).is_some_and(|y| json_eq(x, y)))
        }
        _ => a == b,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operator {
    Eq,
    Ne,
    Lt,
    Lte,
    Gt,
    Gte,
    In,
    Nin,
    Exists,
    Type,
    Regex,
    Size,
    ElemMatch,
    All,
    Not,
    Veq,
    Vne,
    Vgt,
    Vgte,
    Vlt,
    Vlte,
    InGroup,
    NotInGroup,
}

impl Operator {
    fn parse(s: &str) -> Option<Operator> {
        Some(match s {
            "$eq" => Self::Eq,
            "$ne" => Self::Ne,
            "$lt" => Self::Lt,
            "$lte" => Self::Lte,
            "$gt" => Self::Gt,
            "$gte" => Self::Gte,
            "$in" => Self::In,
            "$nin" => Self::Nin,
            "$exists" => Self::Exists,
            "$type" => Self::Type,
            "$regex" => Self::Regex,
            "$size" => Self::Size,
            "$elemMatch" => Self::ElemMatch,
            "$all" => Self::All,
            "$not" => Self::Not,
            "$veq" => Self::Veq,
            "$vne" => Self::Vne,
            "$vgt" => Self::Vgt,
            "$vgte" => Self::Vgte,
            "$vlt" => Self::Vlt,
            "$vlte" => Self::Vlte,
            "$inGroup" => Self::InGroup,
            "$notInGroup" => Self::NotInGroup,
            _ => {
                log::debug!(target: "splitkit", operator = s; "unknown condition operator");
                return None;
            }
        })
    }

    /// Applying `Operator` to the values. Returns `false` if the operator cannot be applied or
    /// there's a misconfiguration.
    fn eval(self, actual: Option<&Value>, operand: &Value, groups: &SavedGroups) -> bool {
        self.try_eval(actual, operand, groups).unwrap_or(false)
    }

    /// Try applying `Operator` to the values, returning `None` if the operator cannot be applied.
    fn try_eval(
        self,
        actual: Option<&Value>,
        operand: &Value,
        groups: &SavedGroups,
    ) -> Option<bool> {
        // Null attributes are treated the same as missing ones.
        let actual = actual.filter(|value| !value.is_null());

        match self {
            Self::Exists => {
                let expected = operand.as_bool()?;
                return Some(actual.is_some() == expected);
            }
            Self::Type => return Some(type_name(actual) == operand.as_str()?),
            Self::Not => return Some(!eval_condition_value(operand, actual, groups)),
            _ => {}
        }

        // Every other operator requires the attribute to be present.
        let actual = actual?;

        match self {
            Self::Eq => Some(json_eq(actual, operand)),
            Self::Ne => Some(!json_eq(actual, operand)),

            Self::Lt | Self::Lte | Self::Gt | Self::Gte => {
                let ordering = compare(actual, operand)?;
                Some(match self {
                    Self::Lt => ordering == Ordering::Less,
                    Self::Lte => ordering != Ordering::Greater,
                    Self::Gt => ordering == Ordering::Greater,
                    Self::Gte => ordering != Ordering::Less,
                    _ => {
                        // unreachable
                        return None;
                    }
                })
            }

            Self::In => Some(is_in(actual, operand.as_array()?)),
            Self::Nin => Some(!is_in(actual, operand.as_array()?)),

            Self::Regex => {
                let regex = Regex::new(operand.as_str()?).ok()?;
                Some(regex.is_match(actual.as_str()?))
            }

            Self::Size => {
                let len = actual.as_array()?.len();
                Some(eval_condition_value(operand, Some(&Value::from(len)), groups))
            }

            Self::ElemMatch => {
                let items = actual.as_array()?;
                let condition = operand.as_object()?;
                Some(if is_operator_object(condition) {
                    items
                        .iter()
                        .any(|item| eval_condition_value(operand, Some(item), groups))
                } else {
                    let empty = Attributes::new();
                    items.iter().any(|item| {
                        let item = item.as_object().unwrap_or(&empty);
                        eval_condition(item, condition, groups)
                    })
                })
            }

            Self::All => {
                let items = actual.as_array()?;
                let expected = operand.as_array()?;
                Some(expected.iter().all(|condition| {
                    items
                        .iter()
                        .any(|item| eval_condition_value(condition, Some(item), groups))
                }))
            }

            Self::Veq | Self::Vne | Self::Vgt | Self::Vgte | Self::Vlt | Self::Vlte => {
                let ordering = compare_versions(actual, operand)?;
                Some(match self {
                    Self::Veq => ordering == Ordering::Equal,
                    Self::Vne => ordering != Ordering::Equal,
                    Self::Vgt => ordering == Ordering::Greater,
                    Self::Vgte => ordering != Ordering::Less,
                    Self::Vlt => ordering == Ordering::Less,
                    Self::Vlte => ordering != Ordering::Greater,
                    _ => {
                        // unreachable
                        return None;
                    }
                })
            }

            Self::InGroup | Self::NotInGroup => {
                let group = groups
                    .get(operand.as_str()?)
                    .map(Vec::as_slice)
                    .unwrap_or_default();
                let is_member = is_in(actual, group);
                Some(if self == Self::InGroup {
                    is_member
                } else {
                    !is_member
                })
            }

            Self::Exists | Self::Type | Self::Not => {
                // handled above
                None
            }
        }
    }
}

/// Membership test. Array attributes match if any element is a member.
fn is_in(actual: &Value, candidates: &[Value]) -> bool {
    match actual {
        Value::Array(items) => items
            .iter()
            .any(|item| candidates.iter().any(|c| json_eq(item, c))),
        _ => candidates.iter().any(|c| json_eq(actual, c)),
    }
}

/// Compare numbers numerically and strings lexically. Mixed types are not comparable.
fn compare(actual: &Value, operand: &Value) -> Option<Ordering> {
    match (actual, operand) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn type_name(value: Option<&Value>) -> &'static str {
    match value {
        None | Some(Value::Null) => "null",
        Some(Value::Bool(_)) => "boolean",
        Some(Value::Number(_)) => "number",
        Some(Value::String(_)) => "string",
        Some(Value::Array(_)) => "array",
        Some(Value::Object(_)) => "object",
    }
}

fn version_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Compare two version strings.
///
/// Strict semantic versions (optionally prefixed with `v`) are compared with semver precedence.
/// Anything else (`"1.2"`, `"2024.1.1.7"`) falls back to [`padded_version`] comparison.
fn compare_versions(actual: &Value, operand: &Value) -> Option<Ordering> {
    let actual = version_string(actual)?;
    let operand = version_string(operand)?;

    let parse = |s: &str| {
        Version::parse(s.strip_prefix('v').unwrap_or(s)).map(|mut version| {
            version.build = BuildMetadata::EMPTY;
            version
        })
    };

    match (parse(&actual), parse(&operand)) {
        (Ok(a), Ok(b)) => Some(a.cmp(&b)),
        _ => Some(padded_version(&actual).cmp(&padded_version(&operand))),
    }
}

/// Normalize a version so that plain string comparison orders versions correctly.
///
/// Build metadata and a leading `v` are dropped, numeric parts are left-padded to a fixed width,
/// and release versions get a `~` suffix so they sort after their pre-releases.
fn padded_version(input: &str) -> String {
    let input = input.strip_prefix('v').unwrap_or(input);
    let input = input.split('+').next().unwrap_or_default();

    let mut parts: Vec<&str> = input.split(|c| c == '-' || c == '.').collect();
    if parts.len() == 3 {
        parts.push("~");
    }

    parts
        .into_iter()
        .map(|part| {
            if !part.is_empty() && part.chars().all(|c| c.is_ascii_digit()) {
                format!("{part:>5}")
            } else {
                part.to_owned()
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}

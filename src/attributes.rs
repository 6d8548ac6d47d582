use serde_json::Value;

/// User attributes used for targeting and bucketing.
///
/// Values are arbitrary JSON, so nested objects and arrays can be targeted with dot-paths
/// (`"company.plan"`, `"devices.0.os"`).
///
/// # Examples
/// ```
/// # use splitkit::Attributes;
/// let attributes: Attributes = serde_json::from_value(serde_json::json!({
///     "id": "user-123",
///     "country": "US",
///     "company": { "plan": "enterprise" },
/// })).unwrap();
/// ```
pub type Attributes = serde_json::Map<String, Value>;

/// Resolve a dot-separated `path` against `attributes`. Numeric segments index into arrays.
///
/// Returns `None` if any segment is missing.
pub(crate) fn get_path<'a>(attributes: &'a Attributes, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = attributes.get(segments.next()?)?;
    for segment in segments {
        current = lookup(current, segment)?;
    }
    Some(current)
}

/// Same as [`get_path`] but starting from an arbitrary JSON value.
pub(crate) fn get_value_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(value, |current, segment| lookup(current, segment))
}

fn lookup<'a>(value: &'a Value, segment: &str) -> Option<&'a Value> {
    match value {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => items.get(segment.parse::<usize>().ok()?),
        _ => None,
    }
}

/// Return the string form of attribute `name` suitable for hashing.
///
/// Returns `None` when the attribute is missing, null, not a scalar, or an empty string. Such users
/// cannot be bucketed.
pub(crate) fn hash_value(attributes: &Attributes, name: &str) -> Option<String> {
    let s = match attributes.get(name)? {
        Value::String(s) => s.clone(),
        Value::Number(n) => match n.as_i64() {
            Some(i) => i.to_string(),
            None => n.to_string(),
        },
        Value::Bool(b) => b.to_string(),
        Value::Null | Value::Array(_) | Value::Object(_) => return None,
    };
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

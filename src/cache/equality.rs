//! Structural comparison used to gate cache writes.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::transport::{ClientResponse, Outcome};

/// Values nested deeper than this compare as unequal.
pub const MAX_COMPARE_DEPTH: usize = 128;

/// Pluggable payload comparator.
pub type DeepEqual = Arc<dyn Fn(&Value, &Value) -> bool + Send + Sync>;

/// Default comparator: recursive structural equality over JSON values.
///
/// Numbers compare by value (`1` equals `1.0`), object key order is
/// ignored, and anything past [`MAX_COMPARE_DEPTH`] is treated as changed
/// so a pathological payload costs at most one redundant write.
pub fn deep_equal(left: &Value, right: &Value) -> bool {
    equal_at(left, right, 0)
}

pub fn default_comparator() -> DeepEqual {
    Arc::new(deep_equal)
}

/// Comparator carried by a single command in place of the store default.
///
/// Two handles are equal when they wrap the same closure.
#[derive(Clone)]
pub struct Comparator(DeepEqual);

impl Comparator {
    pub fn new<F>(compare: F) -> Self
    where
        F: Fn(&Value, &Value) -> bool + Send + Sync + 'static,
    {
        Self(Arc::new(compare))
    }

    pub fn as_deep_equal(&self) -> &DeepEqual {
        &self.0
    }
}

impl From<DeepEqual> for Comparator {
    fn from(compare: DeepEqual) -> Self {
        Self(compare)
    }
}

impl fmt::Debug for Comparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Comparator(..)")
    }
}

impl PartialEq for Comparator {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

fn equal_at(left: &Value, right: &Value, depth: usize) -> bool {
    if depth > MAX_COMPARE_DEPTH {
        return false;
    }
    match (left, right) {
        (Value::Null, Value::Null) => true,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::Number(a), Value::Number(b)) => {
            a == b
                || matches!((a.as_f64(), b.as_f64()), (Some(x), Some(y)) if x == y)
        }
        (Value::String(a), Value::String(b)) => a == b,
        (Value::Array(a), Value::Array(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| equal_at(x, y, depth + 1))
        }
        (Value::Object(a), Value::Object(b)) => {
            a.len() == b.len()
                && a.iter().all(|(key, x)| {
                    b.get(key).is_some_and(|y| equal_at(x, y, depth + 1))
                })
        }
        _ => false,
    }
}

/// Two responses are equal when they settled the same way with the same
/// status and equal payloads. Timing is ignored.
pub(crate) fn responses_equal(
    comparator: &DeepEqual,
    left: &ClientResponse,
    right: &ClientResponse,
) -> bool {
    if left.status != right.status {
        return false;
    }
    match (&left.outcome, &right.outcome) {
        (Outcome::Success(a), Outcome::Success(b)) | (Outcome::Failure(a), Outcome::Failure(b)) => {
            comparator(a, b)
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn ignores_key_order_and_number_repr() {
        let a = json!({"id": 1, "tags": ["a", "b"], "score": 2.0});
        let b = json!({"score": 2, "tags": ["a", "b"], "id": 1});
        assert!(deep_equal(&a, &b));
    }

    #[test]
    fn detects_nested_change() {
        let a = json!({"user": {"name": "Ada", "roles": ["admin"]}});
        let b = json!({"user": {"name": "Ada", "roles": ["viewer"]}});
        assert!(!deep_equal(&a, &b));
        assert!(!deep_equal(&json!([1, 2]), &json!([1, 2, 3])));
        assert!(!deep_equal(&json!(null), &json!(false)));
    }

    #[test]
    fn depth_limit_counts_as_changed() {
        let mut value = json!(0);
        for _ in 0..(MAX_COMPARE_DEPTH + 2) {
            value = json!([value]);
        }
        assert!(!deep_equal(&value, &value.clone()));
    }

    #[test]
    fn responses_ignore_timing() {
        let comparator = default_comparator();
        let first = ClientResponse::success(json!({"id": 1}));
        let mut second = first.clone();
        second.timing.duration = std::time::Duration::from_secs(3);

        assert!(responses_equal(&comparator, &first, &second));
        assert!(!responses_equal(
            &comparator,
            &first,
            &ClientResponse::failure(json!({"id": 1})).with_status(200)
        ));
        assert!(!responses_equal(&comparator, &first, &first.clone().with_status(201)));
    }
}

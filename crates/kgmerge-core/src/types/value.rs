//! Attribute values carried by extracted and stored records.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A single attribute value: text, a list of strings, or a number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Text(String),
    List(Vec<String>),
    Number(f64),
}

/// Attribute bag keyed by field name. Ordered so that writes are deterministic.
pub type Attributes = BTreeMap<String, AttributeValue>;

/// Case-fold and trim a value for comparison.
pub fn normalize(value: &str) -> String {
    value.trim().to_lowercase()
}

impl AttributeValue {
    /// Convert an extracted JSON value.
    ///
    /// Booleans become text; nulls, nested objects and empty arrays are dropped.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        use serde_json::Value;
        match value {
            Value::String(s) => Some(Self::Text(s.clone())),
            Value::Number(n) => n.as_f64().map(Self::Number),
            Value::Bool(b) => Some(Self::Text(b.to_string())),
            Value::Array(items) => {
                let list: Vec<String> = items
                    .iter()
                    .filter_map(|item| match item {
                        Value::String(s) => Some(s.clone()),
                        Value::Number(n) => Some(n.to_string()),
                        Value::Bool(b) => Some(b.to_string()),
                        _ => None,
                    })
                    .collect();
                Some(Self::List(list))
            }
            Value::Null | Value::Object(_) => None,
        }
    }

    /// Convert back to JSON for store payloads.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Text(s) => serde_json::Value::String(s.clone()),
            Self::List(items) => serde_json::Value::Array(
                items
                    .iter()
                    .map(|s| serde_json::Value::String(s.clone()))
                    .collect(),
            ),
            Self::Number(n) => serde_json::Number::from_f64(*n)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
        }
    }

    /// Whether the value carries no information.
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Text(s) => s.trim().is_empty(),
            Self::List(items) => items.iter().all(|s| s.trim().is_empty()),
            Self::Number(_) => false,
        }
    }

    /// Scalar rendering; lists have none.
    pub fn as_text(&self) -> Option<String> {
        match self {
            Self::Text(s) => Some(s.clone()),
            Self::Number(n) => Some(n.to_string()),
            Self::List(_) => None,
        }
    }

    /// Borrow the list, if this is one.
    pub fn as_list(&self) -> Option<&[String]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    /// Borrow the number, if this is one.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// View the value as a list, wrapping scalars. Empty entries are dropped.
    pub fn to_list(&self) -> Vec<String> {
        match self {
            Self::List(items) => items
                .iter()
                .filter(|s| !s.trim().is_empty())
                .cloned()
                .collect(),
            Self::Text(s) if s.trim().is_empty() => Vec::new(),
            Self::Text(s) => vec![s.clone()],
            Self::Number(n) => vec![n.to_string()],
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<Vec<String>> for AttributeValue {
    fn from(value: Vec<String>) -> Self {
        Self::List(value)
    }
}

impl From<Vec<&str>> for AttributeValue {
    fn from(value: Vec<&str>) -> Self {
        Self::List(value.into_iter().map(String::from).collect())
    }
}

impl From<f64> for AttributeValue {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

/// Append `values` to `target`, skipping empties and exact duplicates.
///
/// Returns whether anything was added. Insertion order is preserved.
pub fn append_unique<I, S>(target: &mut Vec<String>, values: I) -> bool
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut added = false;
    for value in values {
        let value = value.as_ref();
        if value.trim().is_empty() || target.iter().any(|v| v == value) {
            continue;
        }
        target.push(value.to_string());
        added = true;
    }
    added
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_json_variants() {
        assert_eq!(
            AttributeValue::from_json(&json!("Acme")),
            Some(AttributeValue::Text("Acme".to_string()))
        );
        assert_eq!(
            AttributeValue::from_json(&json!(true)),
            Some(AttributeValue::Text("true".to_string()))
        );
        assert_eq!(
            AttributeValue::from_json(&json!(["a", 1, {"x": 1}])),
            Some(AttributeValue::List(vec!["a".to_string(), "1".to_string()]))
        );
        assert_eq!(AttributeValue::from_json(&json!(7.5)), Some(AttributeValue::Number(7.5)));
        assert_eq!(AttributeValue::from_json(&json!(null)), None);
        assert_eq!(AttributeValue::from_json(&json!({"nested": 1})), None);
    }

    #[test]
    fn test_to_list_wraps_scalars() {
        assert_eq!(AttributeValue::from("x").to_list(), vec!["x".to_string()]);
        assert!(AttributeValue::from("  ").to_list().is_empty());
        assert_eq!(
            AttributeValue::from(vec!["a", "", "b"]).to_list(),
            vec!["a".to_string(), "b".to_string()]
        );
    }

    #[test]
    fn test_append_unique_preserves_order() {
        let mut target = vec!["d1".to_string(), "d2".to_string()];
        assert!(append_unique(&mut target, ["d2", "d3", "", "d1"]));
        assert_eq!(target, vec!["d1", "d2", "d3"]);
        assert!(!append_unique(&mut target, ["d3"]));
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("  J@X.com "), "j@x.com");
    }
}

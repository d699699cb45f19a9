//! Query key definitions and canonical encoding.
//!
//! A [`QueryKey`] is an ordered list of segments. Its canonical form is a JSON
//! array in which every object has its property names sorted, so two keys that
//! differ only in property order index the same store entry.

use std::fmt;

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::warn;

/// One segment of a query key.
#[derive(Debug, Clone, PartialEq)]
pub enum KeySegment {
    /// A segment that serialized cleanly.
    Value(Value),
    /// A segment whose `Serialize` impl failed. Holds the `Debug` text of the
    /// original value, which is encoded as a plain JSON string. Distinct values
    /// with identical debug output collide.
    Opaque(String),
}

/// Structured identifier of one cacheable resource.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryKey {
    segments: Vec<KeySegment>,
}

impl QueryKey {
    /// Create an empty key. As an invalidation prefix it matches every entry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a segment, builder style.
    pub fn with<S>(mut self, segment: &S) -> Self
    where
        S: Serialize + fmt::Debug + ?Sized,
    {
        self.push(segment);
        self
    }

    /// Append a segment.
    ///
    /// Segments that fail to serialize degrade to their debug text instead of
    /// failing the caller.
    pub fn push<S>(&mut self, segment: &S)
    where
        S: Serialize + fmt::Debug + ?Sized,
    {
        let segment = match serde_json::to_value(segment) {
            Ok(value) => KeySegment::Value(value),
            Err(err) => {
                let text = format!("{segment:?}");
                warn!(
                    error = %err,
                    segment = %text,
                    "Query key segment is not serializable; using lossy debug text"
                );
                KeySegment::Opaque(text)
            }
        };
        self.segments.push(segment);
    }

    pub fn segments(&self) -> &[KeySegment] {
        &self.segments
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Canonical string form used as the store index.
    pub fn canonical(&self) -> CanonicalKey {
        CanonicalKey(serialize(self))
    }

    /// Whether `self` lies under `prefix`, segment by segment.
    pub fn starts_with(&self, prefix: &QueryKey) -> bool {
        self.canonical().matches_prefix(&prefix.canonical())
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&serialize(self))
    }
}

/// Build a [`QueryKey`] from a list of serializable segments.
///
/// ```
/// let key = leadcache::query_key!["leads", "byType", "CONSTRUCTION"];
/// assert_eq!(key.to_string(), r#"["leads","byType","CONSTRUCTION"]"#);
/// ```
#[macro_export]
macro_rules! query_key {
    () => {
        $crate::cache::QueryKey::new()
    };
    ($($segment:expr),+ $(,)?) => {
        $crate::cache::QueryKey::new()$(.with(&$segment))+
    };
}

/// Canonical, order-independent string form of a [`QueryKey`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CanonicalKey(String);

impl CanonicalKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Prefix match on the serialized form.
    ///
    /// The prefix array is compared without its closing bracket, and the next
    /// character of `self` must end a segment, so `["lead"]` never matches
    /// `["leads"]` and `[1]` never matches `[12]`.
    pub fn matches_prefix(&self, prefix: &CanonicalKey) -> bool {
        let Some(open) = prefix.0.strip_suffix(']') else {
            return false;
        };
        if open == "[" {
            return true;
        }
        match self.0.strip_prefix(open) {
            Some(rest) => rest.starts_with(',') || rest == "]",
            None => false,
        }
    }
}

impl fmt::Display for CanonicalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Serialize a key into its canonical string.
///
/// Pure and deterministic: object properties are re-emitted in sorted order at
/// every depth, arrays keep their order.
pub fn serialize(key: &QueryKey) -> String {
    let segments = key
        .segments
        .iter()
        .map(|segment| match segment {
            KeySegment::Value(value) => normalize(value),
            KeySegment::Opaque(text) => Value::String(text.clone()),
        })
        .collect();
    Value::Array(segments).to_string()
}

fn normalize(value: &Value) -> Value {
    match value {
        Value::Array(items) => Value::Array(items.iter().map(normalize).collect()),
        Value::Object(fields) => {
            let mut names: Vec<&String> = fields.keys().collect();
            names.sort();
            let mut sorted = Map::with_capacity(fields.len());
            for name in names {
                sorted.insert(name.clone(), normalize(&fields[name]));
            }
            Value::Object(sorted)
        }
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use serde::Serializer;
    use serde::ser::Error as _;
    use serde_json::json;

    use super::*;

    #[derive(Debug)]
    struct Unserializable;

    impl Serialize for Unserializable {
        fn serialize<S: Serializer>(&self, _serializer: S) -> Result<S::Ok, S::Error> {
            Err(S::Error::custom("not representable"))
        }
    }

    #[test]
    fn property_order_does_not_matter() {
        let a = query_key!["contacts", json!({"page": 2, "filter": {"b": 1, "a": 2}})];
        let b = query_key!["contacts", json!({"filter": {"a": 2, "b": 1}, "page": 2})];

        assert_eq!(a.canonical(), b.canonical());
        assert_eq!(
            a.to_string(),
            r#"["contacts",{"filter":{"a":2,"b":1},"page":2}]"#
        );
    }

    #[test]
    fn array_order_is_preserved() {
        let a = query_key!["leads", [1, 2]];
        let b = query_key!["leads", [2, 1]];
        assert_ne!(a.canonical(), b.canonical());
    }

    #[test]
    fn null_and_scalars_pass_through() {
        let key = query_key!["leads", Option::<u32>::None, 7, true, 1.5];
        assert_eq!(key.to_string(), r#"["leads",null,7,true,1.5]"#);
    }

    #[test]
    fn unserializable_segment_falls_back_to_debug_text() {
        let key = query_key!["leads", Unserializable];

        assert!(matches!(&key.segments()[1], KeySegment::Opaque(text) if text == "Unserializable"));
        assert_eq!(key.to_string(), r#"["leads","Unserializable"]"#);

        // Lossy: collides with a genuine string segment of the same text.
        assert_eq!(key.canonical(), query_key!["leads", "Unserializable"].canonical());
    }

    #[test]
    fn prefix_matches_on_segment_boundaries() {
        let key = query_key!["leads", "byType", "CONSTRUCTION"];

        assert!(key.starts_with(&query_key!["leads"]));
        assert!(key.starts_with(&query_key!["leads", "byType"]));
        assert!(key.starts_with(&key.clone()));
        assert!(key.starts_with(&QueryKey::new()));

        assert!(!key.starts_with(&query_key!["lead"]));
        assert!(!key.starts_with(&query_key!["contacts"]));
        assert!(!query_key![12, "x"].starts_with(&query_key![1]));
        assert!(!query_key!["leads"].starts_with(&key));
    }

    #[test]
    fn empty_key_serializes_to_empty_array() {
        assert_eq!(query_key![].to_string(), "[]");
        assert!(query_key![].is_empty());
    }
}

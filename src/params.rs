//! Typed job parameters.
//!
//! Job parameters arrive as arbitrary JSON and travel through Redis in
//! several places where byte-identical encodings matter (periodic-policy
//! deduplication, the unique-job digest). `ParamValue` restricts them to a
//! scalar/sequence/map tree backed by `BTreeMap`, so serialising the same
//! logical value always produces the same bytes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A string-keyed parameter map, ordered for canonical encoding.
pub type Parameters = BTreeMap<String, ParamValue>;

/// One node of a parameter tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    /// JSON null.
    Null,
    /// Boolean scalar.
    Bool(bool),
    /// Integer scalar.
    Int(i64),
    /// Floating point scalar.
    Float(f64),
    /// String scalar.
    Str(String),
    /// Ordered sequence of values.
    Seq(Vec<ParamValue>),
    /// Nested map with sorted keys.
    Map(BTreeMap<String, ParamValue>),
}

impl ParamValue {
    /// Returns the contained string, if this is a string scalar.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the contained integer, if this is an integer scalar.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            ParamValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Returns true for `Null`.
    pub fn is_null(&self) -> bool {
        matches!(self, ParamValue::Null)
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        ParamValue::Str(value.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(value: String) -> Self {
        ParamValue::Str(value)
    }
}

impl From<i64> for ParamValue {
    fn from(value: i64) -> Self {
        ParamValue::Int(value)
    }
}

impl From<bool> for ParamValue {
    fn from(value: bool) -> Self {
        ParamValue::Bool(value)
    }
}

/// Encodes parameters to their canonical JSON form.
///
/// Map keys are emitted in sorted order, so two equal parameter maps
/// always serialise to the same bytes.
pub fn to_canonical_json(params: &Parameters) -> Result<String, serde_json::Error> {
    serde_json::to_string(params)
}

/// Builds a single-entry parameter map; handy in tests and examples.
pub fn single(key: impl Into<String>, value: impl Into<ParamValue>) -> Parameters {
    let mut map = BTreeMap::new();
    map.insert(key.into(), value.into());
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_roundtrip() {
        let mut params = Parameters::new();
        params.insert("flag".into(), ParamValue::Bool(true));
        params.insert("count".into(), ParamValue::Int(7));
        params.insert("ratio".into(), ParamValue::Float(0.5));
        params.insert("image".into(), ParamValue::Str("testing:v1".into()));
        params.insert("none".into(), ParamValue::Null);

        let json = serde_json::to_string(&params).expect("serialize");
        let parsed: Parameters = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parsed, params);
    }

    #[test]
    fn test_nested_roundtrip() {
        let mut inner = BTreeMap::new();
        inner.insert("host".to_string(), ParamValue::from("redis"));
        inner.insert("port".to_string(), ParamValue::Int(6379));

        let mut params = Parameters::new();
        params.insert("endpoint".into(), ParamValue::Map(inner));
        params.insert(
            "tags".into(),
            ParamValue::Seq(vec![ParamValue::from("a"), ParamValue::from("b")]),
        );

        let json = serde_json::to_string(&params).expect("serialize");
        let parsed: Parameters = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parsed, params);
    }

    #[test]
    fn test_canonical_encoding_is_order_independent() {
        let mut a = Parameters::new();
        a.insert("zebra".into(), ParamValue::Int(1));
        a.insert("alpha".into(), ParamValue::Int(2));

        let mut b = Parameters::new();
        b.insert("alpha".into(), ParamValue::Int(2));
        b.insert("zebra".into(), ParamValue::Int(1));

        assert_eq!(
            to_canonical_json(&a).expect("encode a"),
            to_canonical_json(&b).expect("encode b")
        );
    }

    #[test]
    fn test_untagged_json_input() {
        // The shape clients actually send.
        let parsed: Parameters =
            serde_json::from_str(r#"{"image":"testing:v1","replicas":3,"opts":{"force":true}}"#)
                .expect("parse");

        assert_eq!(parsed["image"].as_str(), Some("testing:v1"));
        assert_eq!(parsed["replicas"].as_int(), Some(3));
        match &parsed["opts"] {
            ParamValue::Map(m) => assert_eq!(m["force"], ParamValue::Bool(true)),
            other => panic!("expected map, got {:?}", other),
        }
    }
}

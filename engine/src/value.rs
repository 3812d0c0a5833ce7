//! The value type stored under keys, and its on-disk encoding.
//!
//! Values are a closed tagged union. The encoding is externally tagged JSON:
//! every variant other than `null` is written as a single-field object naming
//! its type, so a reader never has to guess whether `1` was an integer or a
//! float, or whether a string was really binary data.
//!
//! ```text
//! "null"
//! {"bool": true}
//! {"int": -3}
//! {"float": 2.5}
//! {"string": "hello"}
//! {"bytes": "00ff10"}
//! {"array": [{"int": 1}, "null"]}
//! {"map": {"a": {"bool": false}}}
//! ```

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Version of the value encoding. Bumped whenever a variant's encoding changes.
pub const VALUE_ENCODING_VERSION: u32 = 1;

/// A value stored in the key-value store.
///
/// Maps use `BTreeMap` so encoding is deterministic: the same value always
/// produces the same bytes on every device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(#[serde(with = "hex::serde")] Vec<u8>),
    Array(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// Name of the variant, used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::Array(_) => "array",
            Value::Map(_) => "map",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Numeric view; integers are widened.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Check that the value can be encoded and read back unchanged.
    ///
    /// Non-finite floats are rejected: JSON has no representation for them,
    /// and a journal line that cannot be parsed again would poison the
    /// whole journal for every device.
    pub fn validate(&self) -> Result<()> {
        match self {
            Value::Float(f) if !f.is_finite() => Err(Error::InvalidValue(format!(
                "non-finite float {f} cannot be stored"
            ))),
            Value::Array(items) => items.iter().try_for_each(Value::validate),
            Value::Map(map) => map.values().try_for_each(Value::validate),
            _ => Ok(()),
        }
    }

    /// Encode to the versioned on-disk representation.
    pub fn encode(&self) -> Result<Vec<u8>> {
        self.validate()?;
        serde_json::to_vec(self).map_err(|e| Error::InvalidValue(e.to_string()))
    }

    /// Decode from the on-disk representation.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let value: Self =
            serde_json::from_slice(bytes).map_err(|e| Error::InvalidValue(e.to_string()))?;
        value.validate()?;
        Ok(value)
    }

    /// Convert to plain JSON for display.
    ///
    /// This is lossy: bytes become a hex string and the int/float distinction
    /// follows serde_json's number model.
    pub fn to_plain_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Bytes(b) => serde_json::Value::String(hex::encode(b)),
            Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_plain_json).collect())
            }
            Value::Map(map) => serde_json::Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_plain_json()))
                    .collect(),
            ),
        }
    }
}

/// Plain JSON maps onto the value model directly. Numbers that fit in `i64`
/// become `Int`, everything else becomes `Float`.
impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::Array(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(map) => {
                Value::Map(map.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i.into())
    }
}

impl From<u32> for Value {
    fn from(i: u32) -> Self {
        Value::Int(i.into())
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(b)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(items)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(map: BTreeMap<String, Value>) -> Self {
        Value::Map(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn encoding_format() {
        assert_eq!(Value::Null.encode().unwrap(), br#""null""#.to_vec());
        assert_eq!(Value::Int(-3).encode().unwrap(), br#"{"int":-3}"#.to_vec());
        assert_eq!(
            Value::Bytes(vec![0x00, 0xff, 0x10]).encode().unwrap(),
            br#"{"bytes":"00ff10"}"#.to_vec()
        );
        assert_eq!(
            Value::Array(vec![Value::Bool(true), Value::Null])
                .encode()
                .unwrap(),
            br#"{"array":[{"bool":true},"null"]}"#.to_vec()
        );
    }

    #[test]
    fn int_and_float_stay_distinct() {
        let int = Value::decode(br#"{"int":1}"#).unwrap();
        let float = Value::decode(br#"{"float":1.0}"#).unwrap();
        assert_eq!(int, Value::Int(1));
        assert_eq!(float, Value::Float(1.0));
        assert_ne!(int, float);
    }

    #[test]
    fn nested_value_survives_encoding() {
        let mut inner = BTreeMap::new();
        inner.insert("blob".to_string(), Value::Bytes(vec![1, 2, 3]));
        inner.insert("pi".to_string(), Value::Float(3.25));
        let value = Value::Array(vec![
            Value::Map(inner),
            Value::String("Ωmega\n".into()),
            Value::Int(i64::MIN),
        ]);

        let bytes = value.encode().unwrap();
        assert_eq!(Value::decode(&bytes).unwrap(), value);
    }

    #[test]
    fn map_encoding_is_deterministic() {
        let mut a = BTreeMap::new();
        a.insert("z".to_string(), Value::Int(1));
        a.insert("a".to_string(), Value::Int(2));
        let mut b = BTreeMap::new();
        b.insert("a".to_string(), Value::Int(2));
        b.insert("z".to_string(), Value::Int(1));

        assert_eq!(
            Value::Map(a).encode().unwrap(),
            Value::Map(b).encode().unwrap()
        );
    }

    #[test]
    fn rejects_non_finite_floats() {
        assert!(matches!(
            Value::Float(f64::NAN).validate(),
            Err(Error::InvalidValue(_))
        ));
        let nested = Value::Array(vec![Value::Map(BTreeMap::from([(
            "x".to_string(),
            Value::Float(f64::INFINITY),
        )]))]);
        assert!(nested.encode().is_err());
    }

    #[test]
    fn rejects_unknown_tag() {
        assert!(matches!(
            Value::decode(br#"{"decimal":"1.0"}"#),
            Err(Error::InvalidValue(_))
        ));
        assert!(Value::decode(br#"{"bytes":"zz"}"#).is_err());
    }

    #[test]
    fn from_plain_json() {
        let value = Value::from(json!({"n": 3, "f": 0.5, "list": [null, "s"], "ok": true}));
        let map = value.as_map().unwrap();
        assert_eq!(map["n"], Value::Int(3));
        assert_eq!(map["f"], Value::Float(0.5));
        assert_eq!(
            map["list"],
            Value::Array(vec![Value::Null, Value::String("s".into())])
        );
        assert_eq!(map["ok"].as_bool(), Some(true));
    }

    #[test]
    fn to_plain_json_renders_bytes_as_hex() {
        let value = Value::Map(BTreeMap::from([
            ("b".to_string(), Value::Bytes(vec![0xab, 0xcd])),
            ("i".to_string(), Value::Int(7)),
        ]));
        assert_eq!(value.to_plain_json(), json!({"b": "abcd", "i": 7}));
    }

    #[test]
    fn accessors() {
        assert_eq!(Value::from("x").as_str(), Some("x"));
        assert_eq!(Value::from(4i64).as_f64(), Some(4.0));
        assert_eq!(Value::from(vec![9u8]).as_bytes(), Some(&[9u8][..]));
        assert!(Value::Null.is_null());
        assert_eq!(Value::Null.as_i64(), None);
        assert_eq!(Value::from(1.5).type_name(), "float");
    }
}

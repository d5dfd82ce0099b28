//! Runtime value representation.
//!
//! Every datum the kernel touches (procedure arguments, heap slots, stack
//! entries, stored documents) is a [`Value`]: a tagged union over the seven
//! shapes the wire format can express. Values are cloneable and compare
//! structurally; equality never coerces across tags, so `Int(1)` and
//! `Double(1.0)` are distinct.

use std::collections::BTreeMap;
use std::fmt;

use serde::de::{self, Deserializer, MapAccess, SeqAccess, Visitor};
use serde::ser::{SerializeMap, SerializeSeq, Serializer};
use serde::{Deserialize, Serialize};

/// Field map used by [`Value::Object`]. Ordered so that canonical hashing
/// and printed output are deterministic.
pub type ValueMap = BTreeMap<String, Value>;

/// A runtime value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Absence of a value. Also the result of a procedure with no return.
    None,
    /// Boolean.
    Bool(bool),
    /// 64-bit signed integer. Declared before `Double`: the wire format
    /// spells whole numbers the same way regardless of intent, and decoding
    /// prefers the integer reading.
    Int(i64),
    /// 64-bit float.
    Double(f64),
    /// UTF-8 string.
    String(String),
    /// Ordered sequence of values.
    Array(Vec<Value>),
    /// String-keyed record.
    Object(ValueMap),
}

impl Value {
    // ==== Constructors ====

    /// Build a string value.
    #[inline]
    pub fn string(s: impl Into<String>) -> Self {
        Value::String(s.into())
    }

    /// Build a numeric value, preferring `Int` when the number is whole.
    ///
    /// This mirrors wire decoding: `12.0` and `12` are the same number to
    /// the serializer, so both become `Int(12)`.
    #[inline]
    pub fn number(n: f64) -> Self {
        if n.fract() == 0.0 && n >= i64::MIN as f64 && n <= i64::MAX as f64 {
            Value::Int(n as i64)
        } else {
            Value::Double(n)
        }
    }

    /// Build an object from key/value pairs.
    pub fn object(fields: impl IntoIterator<Item = (String, Value)>) -> Self {
        Value::Object(fields.into_iter().collect())
    }

    // ==== Accessors ====

    /// `true` if this is `Value::None`.
    #[inline]
    pub fn is_none(&self) -> bool {
        matches!(self, Value::None)
    }

    /// The bool inside, when this is one.
    #[inline]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// The int inside, when this is one.
    #[inline]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// The string inside, when this is one.
    #[inline]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// The array inside, when this is one.
    #[inline]
    pub fn as_array(&self) -> Option<&Vec<Value>> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }

    /// Mutable view of the array inside, when this is one.
    #[inline]
    pub fn as_array_mut(&mut self) -> Option<&mut Vec<Value>> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }

    /// The field map inside, when this is an object.
    #[inline]
    pub fn as_object(&self) -> Option<&ValueMap> {
        match self {
            Value::Object(o) => Some(o),
            _ => None,
        }
    }

    /// Mutable view of the field map inside, when this is an object.
    #[inline]
    pub fn as_object_mut(&mut self) -> Option<&mut ValueMap> {
        match self {
            Value::Object(o) => Some(o),
            _ => None,
        }
    }

    /// Numeric view, promoting nothing. `None` for non-numeric tags.
    #[inline]
    pub fn as_numeric(&self) -> Option<Numeric> {
        match self {
            Value::Int(i) => Some(Numeric::Int(*i)),
            Value::Double(d) => Some(Numeric::Double(*d)),
            _ => None,
        }
    }

    /// Type name as seen by programs (`getType` op, error messages).
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::None => "none",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Double(_) => "double",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
        }
    }
}

// ==== Numeric promotion ====

/// A value known to be numeric. Arithmetic and ordering promote `Int` to
/// `Double` only when the two operands disagree.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Numeric {
    /// An integer operand.
    Int(i64),
    /// A double operand.
    Double(f64),
}

impl Numeric {
    /// Both operands as doubles.
    #[inline]
    pub fn widen(self) -> f64 {
        match self {
            Numeric::Int(i) => i as f64,
            Numeric::Double(d) => d,
        }
    }

    /// `true` when either side is a double.
    #[inline]
    pub fn is_double(self) -> bool {
        matches!(self, Numeric::Double(_))
    }

    /// Decimal text form, used when `plus` concatenates onto a string.
    pub fn render(self) -> String {
        match self {
            Numeric::Int(i) => i.to_string(),
            Numeric::Double(d) => d.to_string(),
        }
    }
}

// ==== Conversions ====

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

impl From<f64> for Value {
    fn from(d: f64) -> Self {
        Value::Double(d)
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

impl From<Vec<Value>> for Value {
    fn from(a: Vec<Value>) -> Self {
        Value::Array(a)
    }
}

// ==== Serde ====

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::None => serializer.serialize_unit(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Int(i) => serializer.serialize_i64(*i),
            Value::Double(d) => serializer.serialize_f64(*d),
            Value::String(s) => serializer.serialize_str(s),
            Value::Array(a) => {
                let mut seq = serializer.serialize_seq(Some(a.len()))?;
                for v in a {
                    seq.serialize_element(v)?;
                }
                seq.end()
            }
            Value::Object(o) => {
                let mut map = serializer.serialize_map(Some(o.len()))?;
                for (k, v) in o {
                    map.serialize_entry(k, v)?;
                }
                map.end()
            }
        }
    }
}

struct ValueVisitor;

impl<'de> Visitor<'de> for ValueVisitor {
    type Value = Value;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a runtime value")
    }

    fn visit_unit<E: de::Error>(self) -> Result<Value, E> {
        Ok(Value::None)
    }

    fn visit_none<E: de::Error>(self) -> Result<Value, E> {
        Ok(Value::None)
    }

    fn visit_some<D: Deserializer<'de>>(self, d: D) -> Result<Value, D::Error> {
        d.deserialize_any(ValueVisitor)
    }

    fn visit_bool<E: de::Error>(self, b: bool) -> Result<Value, E> {
        Ok(Value::Bool(b))
    }

    fn visit_i64<E: de::Error>(self, i: i64) -> Result<Value, E> {
        Ok(Value::Int(i))
    }

    fn visit_u64<E: de::Error>(self, u: u64) -> Result<Value, E> {
        if u <= i64::MAX as u64 {
            Ok(Value::Int(u as i64))
        } else {
            Ok(Value::Double(u as f64))
        }
    }

    fn visit_f64<E: de::Error>(self, d: f64) -> Result<Value, E> {
        Ok(Value::number(d))
    }

    fn visit_str<E: de::Error>(self, s: &str) -> Result<Value, E> {
        Ok(Value::String(s.to_string()))
    }

    fn visit_string<E: de::Error>(self, s: String) -> Result<Value, E> {
        Ok(Value::String(s))
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Value, A::Error> {
        let mut out = Vec::with_capacity(seq.size_hint().unwrap_or(0));
        while let Some(v) = seq.next_element()? {
            out.push(v);
        }
        Ok(Value::Array(out))
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Value, A::Error> {
        let mut out = ValueMap::new();
        while let Some((k, v)) = map.next_entry::<String, Value>()? {
            out.insert(k, v);
        }
        Ok(Value::Object(out))
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Value, D::Error> {
        deserializer.deserialize_any(ValueVisitor)
    }
}

// ==== Display ====

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::None => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Double(d) => write!(f, "{}", d),
            Value::String(s) => write!(f, "{:?}", s),
            Value::Array(a) => {
                write!(f, "[")?;
                for (i, v) in a.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", v)?;
                }
                write!(f, "]")
            }
            Value::Object(o) => {
                write!(f, "{{")?;
                for (i, (k, v)) in o.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{:?}: {}", k, v)?;
                }
                write!(f, "}}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_number_prefers_int() {
        assert_eq!(Value::number(12.0), Value::Int(12));
        assert_eq!(Value::number(12.5), Value::Double(12.5));
        assert_eq!(Value::number(-3.0), Value::Int(-3));
    }

    #[test]
    fn test_equality_is_same_tag_only() {
        assert_ne!(Value::Int(1), Value::Double(1.0));
        assert_ne!(Value::Bool(false), Value::None);
        assert_eq!(Value::Int(7), Value::Int(7));
        assert_eq!(
            Value::Array(vec![Value::Int(1)]),
            Value::Array(vec![Value::Int(1)])
        );
    }

    #[test]
    fn test_json_whole_floats_decode_as_int() {
        let v: Value = serde_json::from_str("12.0").unwrap();
        assert_eq!(v, Value::Int(12));
        let v: Value = serde_json::from_str("12.5").unwrap();
        assert_eq!(v, Value::Double(12.5));
    }

    #[test]
    fn test_json_round_trip() {
        let v = Value::object([
            ("a".to_string(), Value::Array(vec![Value::Int(1), Value::None])),
            ("b".to_string(), Value::string("x")),
        ]);
        let text = serde_json::to_string(&v).unwrap();
        let back: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(v, back);
    }

    #[test]
    fn test_null_decodes_as_none() {
        let v: Value = serde_json::from_str("null").unwrap();
        assert_eq!(v, Value::None);
    }

    #[test]
    fn test_type_names() {
        assert_eq!(Value::None.type_name(), "none");
        assert_eq!(Value::Int(1).type_name(), "int");
        assert_eq!(Value::Double(0.5).type_name(), "double");
        assert_eq!(Value::string("s").type_name(), "string");
        assert_eq!(Value::Array(vec![]).type_name(), "array");
        assert_eq!(Value::Object(ValueMap::new()).type_name(), "object");
    }

    #[test]
    fn test_numeric_render() {
        assert_eq!(Numeric::Int(42).render(), "42");
        assert_eq!(Numeric::Double(0.5).render(), "0.5");
    }
}

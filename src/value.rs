//! Value types that records can hold.
//!
//! Values cover the primitive types exchanged between participants:
//! integers, doubles, strings, opaque binary blobs and numeric arrays.

use serde::de::{self, Unexpected, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::record::RecordType;

/// Possible values a record can hold.
///
/// # Examples
///
/// ```
/// use kyromesh::Value;
///
/// let int_val = Value::Integer(42);
/// let string_val = Value::String("hello".to_string());
///
/// assert!(int_val.is_integer());
/// assert!(string_val.is_string());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    /// Signed 64-bit integer.
    Integer(i64),
    /// Non-finite doubles travel as `"NaN"`, `"inf"` and `"-inf"`.
    Double(#[serde(with = "double")] f64),
    /// UTF-8 text.
    String(String),
    /// Opaque bytes.
    Binary(Vec<u8>),
    /// Integer sequence.
    IntegerArray(Vec<i64>),
    /// Double sequence, with the same non-finite encoding as [`Value::Double`].
    DoubleArray(#[serde(with = "double_array")] Vec<f64>),
}

/// An `f64` that survives formats without NaN or infinities.
struct WireF64(f64);

impl Serialize for WireF64 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let v = self.0;
        if v.is_nan() {
            serializer.serialize_str("NaN")
        } else if v.is_infinite() {
            serializer.serialize_str(if v > 0.0 { "inf" } else { "-inf" })
        } else {
            serializer.serialize_f64(v)
        }
    }
}

impl<'de> Deserialize<'de> for WireF64 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct WireF64Visitor;

        impl Visitor<'_> for WireF64Visitor {
            type Value = WireF64;

            fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("a number, \"NaN\", \"inf\" or \"-inf\"")
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> Result<WireF64, E> {
                Ok(WireF64(v))
            }

            #[allow(clippy::cast_precision_loss)]
            fn visit_i64<E: de::Error>(self, v: i64) -> Result<WireF64, E> {
                Ok(WireF64(v as f64))
            }

            #[allow(clippy::cast_precision_loss)]
            fn visit_u64<E: de::Error>(self, v: u64) -> Result<WireF64, E> {
                Ok(WireF64(v as f64))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<WireF64, E> {
                match v {
                    "NaN" => Ok(WireF64(f64::NAN)),
                    "inf" => Ok(WireF64(f64::INFINITY)),
                    "-inf" => Ok(WireF64(f64::NEG_INFINITY)),
                    other => Err(E::invalid_value(Unexpected::Str(other), &self)),
                }
            }
        }

        deserializer.deserialize_any(WireF64Visitor)
    }
}

mod double {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use super::WireF64;

    #[allow(clippy::trivially_copy_pass_by_ref)]
    pub(super) fn serialize<S: Serializer>(v: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        WireF64(*v).serialize(serializer)
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        WireF64::deserialize(deserializer).map(|w| w.0)
    }
}

mod double_array {
    use serde::{Deserialize, Deserializer, Serializer};

    use super::WireF64;

    #[allow(clippy::ptr_arg)]
    pub(super) fn serialize<S: Serializer>(v: &Vec<f64>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(v.iter().map(|x| WireF64(*x)))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<f64>, D::Error> {
        let wire: Vec<WireF64> = Vec::deserialize(deserializer)?;
        Ok(wire.into_iter().map(|w| w.0).collect())
    }
}

impl Value {
    /// True for [`Value::Integer`].
    #[must_use]
    pub const fn is_integer(&self) -> bool {
        matches!(self, Self::Integer(_))
    }

    /// True for [`Value::Double`].
    #[must_use]
    pub const fn is_double(&self) -> bool {
        matches!(self, Self::Double(_))
    }

    /// True for [`Value::String`].
    #[must_use]
    pub const fn is_string(&self) -> bool {
        matches!(self, Self::String(_))
    }

    /// True for [`Value::Binary`].
    #[must_use]
    pub const fn is_binary(&self) -> bool {
        matches!(self, Self::Binary(_))
    }

    /// True for either array variant.
    #[must_use]
    pub const fn is_array(&self) -> bool {
        matches!(self, Self::IntegerArray(_) | Self::DoubleArray(_))
    }

    /// Inner integer, if this is one.
    #[must_use]
    pub const fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(v) => Some(*v),
            _ => None,
        }
    }

    /// Integers widen to doubles.
    #[must_use]
    pub const fn as_double(&self) -> Option<f64> {
        match self {
            Self::Double(v) => Some(*v),
            Self::Integer(v) => Some(*v as f64),
            _ => None,
        }
    }

    /// Inner text, if this is a string.
    #[must_use]
    pub fn as_string(&self) -> Option<&str> {
        match self {
            Self::String(v) => Some(v),
            _ => None,
        }
    }

    /// Inner bytes, if this is binary.
    #[must_use]
    pub fn as_binary(&self) -> Option<&[u8]> {
        match self {
            Self::Binary(v) => Some(v),
            _ => None,
        }
    }

    /// Inner integers, if this is an integer array.
    #[must_use]
    pub fn as_integer_array(&self) -> Option<&[i64]> {
        match self {
            Self::IntegerArray(v) => Some(v),
            _ => None,
        }
    }

    /// Inner doubles, if this is a double array.
    #[must_use]
    pub fn as_double_array(&self) -> Option<&[f64]> {
        match self {
            Self::DoubleArray(v) => Some(v),
            _ => None,
        }
    }

    /// Returns the type tag used to select record filters.
    #[must_use]
    pub const fn record_type(&self) -> RecordType {
        match self {
            Self::Integer(_) => RecordType::Integer,
            Self::Double(_) => RecordType::Double,
            Self::String(_) => RecordType::String,
            Self::Binary(_) => RecordType::Binary,
            Self::IntegerArray(_) => RecordType::IntegerArray,
            Self::DoubleArray(_) => RecordType::DoubleArray,
        }
    }

    /// Approximate payload size in bytes, used for bandwidth accounting.
    #[must_use]
    pub fn payload_size(&self) -> usize {
        match self {
            Self::Integer(_) | Self::Double(_) => 8,
            Self::String(v) => v.len(),
            Self::Binary(v) => v.len(),
            Self::IntegerArray(v) => v.len() * 8,
            Self::DoubleArray(v) => v.len() * 8,
        }
    }

    /// Returns a human-readable type name.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        self.record_type().name()
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Integer(v) => write!(f, "{v}"),
            Self::Double(v) => write!(f, "{v}"),
            Self::String(v) => write!(f, "{v:?}"),
            Self::Binary(v) => write!(f, "binary[{}]", v.len()),
            Self::IntegerArray(v) => write!(f, "{v:?}"),
            Self::DoubleArray(v) => write!(f, "{v:?}"),
        }
    }
}

// Convenient From implementations
impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Integer(i64::from(v))
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Double(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Self::Binary(v)
    }
}

impl From<Vec<i64>> for Value {
    fn from(v: Vec<i64>) -> Self {
        Self::IntegerArray(v)
    }
}

impl From<Vec<f64>> for Value {
    fn from(v: Vec<f64>) -> Self {
        Self::DoubleArray(v)
    }
}

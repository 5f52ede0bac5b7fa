use crate::entity::Handle;
use crate::{Error, Key, Result};

use indexmap::IndexMap;
use std::rc::Rc;

/// The per-row value bag: scanned column values keyed by field name.
pub type ValueBag = IndexMap<String, Value>;

/// A column value in transit between an entity field, a bound SQL parameter
/// and a scanned result cell. The variants are exactly what the converter
/// set produces.
#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    I16(i16),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Str(String),
    Bytes(Vec<u8>),
    /// A civil datetime, stored without time zone.
    DateTime(jiff::civil::DateTime),
    /// An instant, stored with time zone.
    Timestamp(jiff::Timestamp),
    Key(Key),
    /// A scanned, not-yet-populated entity produced by a reference column.
    Entity(Handle),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::I16(v) => Some(*v as i64),
            Value::I32(v) => Some(*v as i64),
            Value::I64(v) => Some(*v),
            _ => None,
        }
    }
}

impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => f.write_str("Null"),
            Value::Bool(v) => write!(f, "Bool({v})"),
            Value::I16(v) => write!(f, "I16({v})"),
            Value::I32(v) => write!(f, "I32({v})"),
            Value::I64(v) => write!(f, "I64({v})"),
            Value::F32(v) => write!(f, "F32({v})"),
            Value::F64(v) => write!(f, "F64({v})"),
            Value::Str(v) => write!(f, "Str({v:?})"),
            Value::Bytes(v) => write!(f, "Bytes({} bytes)", v.len()),
            Value::DateTime(v) => write!(f, "DateTime({v})"),
            Value::Timestamp(v) => write!(f, "Timestamp({v})"),
            Value::Key(v) => write!(f, "Key({v})"),
            Value::Entity(v) => write!(f, "Entity({})", v.borrow().meta().key()),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::I16(a), Value::I16(b)) => a == b,
            (Value::I32(a), Value::I32(b)) => a == b,
            (Value::I64(a), Value::I64(b)) => a == b,
            (Value::F32(a), Value::F32(b)) => a == b,
            (Value::F64(a), Value::F64(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::DateTime(a), Value::DateTime(b)) => a == b,
            (Value::Timestamp(a), Value::Timestamp(b)) => a == b,
            (Value::Key(a), Value::Key(b)) => a == b,
            (Value::Entity(a), Value::Entity(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::Bool(v) => write!(f, "{v}"),
            Value::I16(v) => write!(f, "{v}"),
            Value::I32(v) => write!(f, "{v}"),
            Value::I64(v) => write!(f, "{v}"),
            Value::F32(v) => write!(f, "{v}"),
            Value::F64(v) => write!(f, "{v}"),
            Value::Str(v) => f.write_str(v),
            Value::Bytes(v) => write!(f, "{} bytes", v.len()),
            Value::DateTime(v) => write!(f, "{v}"),
            Value::Timestamp(v) => write!(f, "{v}"),
            Value::Key(v) => write!(f, "{v}"),
            Value::Entity(v) => write!(f, "{}", v.borrow().meta().key()),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Value {
        Value::Bool(v)
    }
}

impl From<i16> for Value {
    fn from(v: i16) -> Value {
        Value::I16(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Value {
        Value::I32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Value {
        Value::I64(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Value {
        Value::F32(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Value {
        Value::F64(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Value {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Value {
        Value::Str(v)
    }
}

impl From<Key> for Value {
    fn from(v: Key) -> Value {
        Value::Key(v)
    }
}

impl From<&Key> for Value {
    fn from(v: &Key) -> Value {
        Value::Key(v.clone())
    }
}

/// Maps a field type to its SQL column type and converts it to and from
/// [`Value`]. Conversions coerce where a best-effort interpretation exists,
/// so string values decoded from forms can populate typed fields.
pub trait FieldCodec: Clone + 'static {
    const SQL_TYPE: &'static str;

    fn to_value(&self) -> Value;
    fn from_value(value: Value) -> Result<Self>;
}

fn bad(value: &Value, target: &str) -> Error {
    Error::type_mismatch(format!("cannot convert {value:?} to {target}"))
}

impl FieldCodec for bool {
    const SQL_TYPE: &'static str = "boolean";

    fn to_value(&self) -> Value {
        Value::Bool(*self)
    }

    fn from_value(value: Value) -> Result<bool> {
        match value {
            Value::Bool(v) => Ok(v),
            Value::I16(v) => Ok(v != 0),
            Value::I32(v) => Ok(v != 0),
            Value::I64(v) => Ok(v != 0),
            Value::Str(s) => match s.trim() {
                "1" => Ok(true),
                "0" => Ok(false),
                other => other
                    .to_ascii_lowercase()
                    .parse()
                    .map_err(|_| bad(&Value::Str(s.clone()), "bool")),
            },
            other => Err(bad(&other, "bool")),
        }
    }
}

macro_rules! integer_codec {
    ($ty:ty, $sql:expr) => {
        impl FieldCodec for $ty {
            const SQL_TYPE: &'static str = $sql;

            fn to_value(&self) -> Value {
                Value::from(*self)
            }

            fn from_value(value: Value) -> Result<$ty> {
                match value {
                    Value::I16(v) => <$ty>::try_from(v).map_err(|_| bad(&Value::I16(v), stringify!($ty))),
                    Value::I32(v) => <$ty>::try_from(v).map_err(|_| bad(&Value::I32(v), stringify!($ty))),
                    Value::I64(v) => <$ty>::try_from(v).map_err(|_| bad(&Value::I64(v), stringify!($ty))),
                    Value::F32(v) => Ok(v.round() as $ty),
                    Value::F64(v) => Ok(v.round() as $ty),
                    Value::Bool(v) => Ok(v as $ty),
                    Value::Str(s) => s
                        .trim()
                        .parse()
                        .map_err(|_| bad(&Value::Str(s.clone()), stringify!($ty))),
                    other => Err(bad(&other, stringify!($ty))),
                }
            }
        }
    };
}

integer_codec!(i16, "integer");
integer_codec!(i32, "integer");
integer_codec!(i64, "bigint");

macro_rules! float_codec {
    ($ty:ty) => {
        impl FieldCodec for $ty {
            const SQL_TYPE: &'static str = "double precision";

            fn to_value(&self) -> Value {
                Value::from(*self)
            }

            fn from_value(value: Value) -> Result<$ty> {
                match value {
                    Value::I16(v) => Ok(v as $ty),
                    Value::I32(v) => Ok(v as $ty),
                    Value::I64(v) => Ok(v as $ty),
                    Value::F32(v) => Ok(v as $ty),
                    Value::F64(v) => Ok(v as $ty),
                    Value::Str(s) => s
                        .trim()
                        .parse()
                        .map_err(|_| bad(&Value::Str(s.clone()), stringify!($ty))),
                    other => Err(bad(&other, stringify!($ty))),
                }
            }
        }
    };
}

float_codec!(f32);
float_codec!(f64);

impl FieldCodec for String {
    const SQL_TYPE: &'static str = "text";

    fn to_value(&self) -> Value {
        Value::Str(self.clone())
    }

    fn from_value(value: Value) -> Result<String> {
        match value {
            Value::Str(v) => Ok(v),
            Value::Bool(v) => Ok(v.to_string()),
            Value::I16(v) => Ok(v.to_string()),
            Value::I32(v) => Ok(v.to_string()),
            Value::I64(v) => Ok(v.to_string()),
            Value::F32(v) => Ok(v.to_string()),
            Value::F64(v) => Ok(v.to_string()),
            other => Err(bad(&other, "String")),
        }
    }
}

impl FieldCodec for Vec<u8> {
    const SQL_TYPE: &'static str = "bytea";

    fn to_value(&self) -> Value {
        Value::Bytes(self.clone())
    }

    fn from_value(value: Value) -> Result<Vec<u8>> {
        match value {
            Value::Bytes(v) => Ok(v),
            Value::Str(v) => Ok(v.into_bytes()),
            other => Err(bad(&other, "Vec<u8>")),
        }
    }
}

impl FieldCodec for jiff::civil::DateTime {
    const SQL_TYPE: &'static str = "timestamp without time zone";

    fn to_value(&self) -> Value {
        Value::DateTime(*self)
    }

    fn from_value(value: Value) -> Result<jiff::civil::DateTime> {
        match value {
            Value::DateTime(v) => Ok(v),
            Value::Str(s) => {
                let trimmed = s.trim();
                if let Ok(v) = trimmed.parse::<jiff::civil::DateTime>() {
                    return Ok(v);
                }
                trimmed
                    .parse::<jiff::civil::Date>()
                    .map(|d| d.to_datetime(jiff::civil::Time::midnight()))
                    .map_err(|_| bad(&Value::Str(s.clone()), "DateTime"))
            }
            other => Err(bad(&other, "DateTime")),
        }
    }
}

impl FieldCodec for jiff::Timestamp {
    const SQL_TYPE: &'static str = "timestamp with time zone";

    fn to_value(&self) -> Value {
        Value::Timestamp(*self)
    }

    fn from_value(value: Value) -> Result<jiff::Timestamp> {
        match value {
            Value::Timestamp(v) => Ok(v),
            Value::Str(s) => s
                .trim()
                .parse()
                .map_err(|_| bad(&Value::Str(s.clone()), "Timestamp")),
            other => Err(bad(&other, "Timestamp")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_coercions() {
        assert_eq!(i32::from_value(Value::Str(" 42 ".into())).unwrap(), 42);
        assert_eq!(i64::from_value(Value::Str("42".into())).unwrap(), 42);
        assert_eq!(f64::from_value(Value::Str("1.25".into())).unwrap(), 1.25);
        assert!(bool::from_value(Value::Str("true".into())).unwrap());
        assert!(bool::from_value(Value::Str("1".into())).unwrap());
        assert!(i32::from_value(Value::Str("forty".into())).is_err());
    }

    #[test]
    fn numeric_widening_and_narrowing() {
        assert_eq!(i32::from_value(Value::I64(7)).unwrap(), 7);
        assert_eq!(i64::from_value(Value::I32(7)).unwrap(), 7);
        assert_eq!(i32::from_value(Value::F64(6.6)).unwrap(), 7);
        assert!(i16::from_value(Value::I64(1 << 40)).is_err());
        assert_eq!(f64::from_value(Value::I64(2)).unwrap(), 2.0);
    }

    #[test]
    fn datetime_from_date_only_string() {
        let dt = jiff::civil::DateTime::from_value(Value::Str("2019-06-01".into())).unwrap();
        assert_eq!(dt.date().year(), 2019);
        assert_eq!(dt.time(), jiff::civil::Time::midnight());
    }

    #[test]
    fn display_is_bare() {
        assert_eq!(Value::Str("x".into()).to_string(), "x");
        assert_eq!(Value::I64(3).to_string(), "3");
        assert_eq!(Value::Null.to_string(), "");
    }
}

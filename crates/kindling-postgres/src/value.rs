use kindling_core::{Error, Result, Value};

use postgres_types::{private::BytesMut, to_sql_checked, IsNull, ToSql, Type};
use tokio_postgres::Row;

/// A bound parameter. Only wire-safe variants exist here; entity values
/// never reach the driver.
#[derive(Debug)]
pub(crate) enum PgValue {
    Null,
    Bool(bool),
    I16(i16),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Text(String),
    Bytes(Vec<u8>),
    DateTime(jiff::civil::DateTime),
    Timestamp(jiff::Timestamp),
}

impl TryFrom<&Value> for PgValue {
    type Error = Error;

    fn try_from(value: &Value) -> Result<PgValue> {
        Ok(match value {
            Value::Null => PgValue::Null,
            Value::Bool(v) => PgValue::Bool(*v),
            Value::I16(v) => PgValue::I16(*v),
            Value::I32(v) => PgValue::I32(*v),
            Value::I64(v) => PgValue::I64(*v),
            Value::F32(v) => PgValue::F32(*v),
            Value::F64(v) => PgValue::F64(*v),
            Value::Str(v) => PgValue::Text(v.clone()),
            Value::Bytes(v) => PgValue::Bytes(v.clone()),
            Value::DateTime(v) => PgValue::DateTime(*v),
            Value::Timestamp(v) => PgValue::Timestamp(*v),
            Value::Key(v) => PgValue::Text(v.to_string()),
            Value::Entity(_) => {
                return Err(Error::type_mismatch(
                    "entity values cannot be bound as parameters",
                ))
            }
        })
    }
}

/// The parameter type declared when preparing a statement for this value.
/// Composite and array casts happen in the SQL text, so everything binds as
/// a plain wire type.
pub(crate) fn pg_type_for_value(value: &Value) -> Type {
    match value {
        Value::Null => Type::TEXT,
        Value::Bool(_) => Type::BOOL,
        Value::I16(_) => Type::INT2,
        Value::I32(_) => Type::INT4,
        Value::I64(_) => Type::INT8,
        Value::F32(_) => Type::FLOAT4,
        Value::F64(_) => Type::FLOAT8,
        Value::Str(_) => Type::TEXT,
        Value::Bytes(_) => Type::BYTEA,
        Value::DateTime(_) => Type::TIMESTAMP,
        Value::Timestamp(_) => Type::TIMESTAMPTZ,
        Value::Key(_) => Type::TEXT,
        Value::Entity(_) => Type::TEXT,
    }
}

impl ToSql for PgValue {
    fn to_sql(
        &self,
        ty: &Type,
        out: &mut BytesMut,
    ) -> std::result::Result<IsNull, Box<dyn std::error::Error + Sync + Send>> {
        match self {
            PgValue::Null => Ok(IsNull::Yes),
            PgValue::Bool(v) => v.to_sql(ty, out),
            PgValue::I16(v) => {
                if *ty == Type::INT4 {
                    (*v as i32).to_sql(ty, out)
                } else if *ty == Type::INT8 {
                    (*v as i64).to_sql(ty, out)
                } else {
                    v.to_sql(ty, out)
                }
            }
            PgValue::I32(v) => {
                if *ty == Type::INT8 {
                    (*v as i64).to_sql(ty, out)
                } else {
                    v.to_sql(ty, out)
                }
            }
            PgValue::I64(v) => {
                if *ty == Type::INT4 {
                    (*v as i32).to_sql(ty, out)
                } else {
                    v.to_sql(ty, out)
                }
            }
            PgValue::F32(v) => {
                if *ty == Type::FLOAT8 {
                    (*v as f64).to_sql(ty, out)
                } else {
                    v.to_sql(ty, out)
                }
            }
            PgValue::F64(v) => v.to_sql(ty, out),
            PgValue::Text(v) => v.to_sql(ty, out),
            PgValue::Bytes(v) => v.to_sql(ty, out),
            PgValue::DateTime(v) => v.to_sql(ty, out),
            PgValue::Timestamp(v) => v.to_sql(ty, out),
        }
    }

    fn accepts(ty: &Type) -> bool {
        *ty == Type::BOOL
            || *ty == Type::INT2
            || *ty == Type::INT4
            || *ty == Type::INT8
            || *ty == Type::FLOAT4
            || *ty == Type::FLOAT8
            || *ty == Type::TEXT
            || *ty == Type::VARCHAR
            || *ty == Type::BYTEA
            || *ty == Type::TIMESTAMP
            || *ty == Type::TIMESTAMPTZ
    }

    to_sql_checked!();
}

/// Converts one result row into core values, by column type.
pub(crate) fn row_to_values(row: &Row) -> Result<Vec<Value>> {
    let mut values = Vec::with_capacity(row.len());
    for (ix, column) in row.columns().iter().enumerate() {
        values.push(cell_to_value(row, ix, column.type_())?);
    }
    Ok(values)
}

fn cell_to_value(row: &Row, ix: usize, ty: &Type) -> Result<Value> {
    fn sql_err(e: tokio_postgres::Error) -> Error {
        Error::sql(format!("cannot decode result column: {e}"))
    }

    let value = if *ty == Type::TEXT || *ty == Type::VARCHAR || *ty == Type::NAME {
        row.try_get::<usize, Option<String>>(ix)
            .map_err(sql_err)?
            .map(Value::Str)
    } else if *ty == Type::BOOL {
        row.try_get::<usize, Option<bool>>(ix)
            .map_err(sql_err)?
            .map(Value::Bool)
    } else if *ty == Type::INT2 {
        row.try_get::<usize, Option<i16>>(ix)
            .map_err(sql_err)?
            .map(Value::I16)
    } else if *ty == Type::INT4 {
        row.try_get::<usize, Option<i32>>(ix)
            .map_err(sql_err)?
            .map(Value::I32)
    } else if *ty == Type::INT8 {
        row.try_get::<usize, Option<i64>>(ix)
            .map_err(sql_err)?
            .map(Value::I64)
    } else if *ty == Type::FLOAT4 {
        row.try_get::<usize, Option<f32>>(ix)
            .map_err(sql_err)?
            .map(Value::F32)
    } else if *ty == Type::FLOAT8 {
        row.try_get::<usize, Option<f64>>(ix)
            .map_err(sql_err)?
            .map(Value::F64)
    } else if *ty == Type::BYTEA {
        row.try_get::<usize, Option<Vec<u8>>>(ix)
            .map_err(sql_err)?
            .map(Value::Bytes)
    } else if *ty == Type::TIMESTAMP {
        row.try_get::<usize, Option<jiff::civil::DateTime>>(ix)
            .map_err(sql_err)?
            .map(Value::DateTime)
    } else if *ty == Type::TIMESTAMPTZ {
        row.try_get::<usize, Option<jiff::Timestamp>>(ix)
            .map_err(sql_err)?
            .map(Value::Timestamp)
    } else {
        return Err(Error::sql(format!(
            "unsupported result column type '{}'",
            ty.name()
        )));
    };
    Ok(value.unwrap_or(Value::Null))
}

#[cfg(test)]
mod tests {
    use super::*;

    use kindling_core::{EntityMeta, ErrorKind, Handle};

    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Default)]
    struct Stub {
        meta: EntityMeta,
    }

    kindling_core::impl_entity!(Stub { meta: meta });

    #[test]
    fn declared_types() {
        assert_eq!(pg_type_for_value(&Value::I64(1)), Type::INT8);
        assert_eq!(pg_type_for_value(&Value::Str("x".into())), Type::TEXT);
        assert_eq!(pg_type_for_value(&Value::Null), Type::TEXT);
        assert_eq!(pg_type_for_value(&Value::F64(0.5)), Type::FLOAT8);
    }

    #[test]
    fn scalar_values_convert() {
        assert!(PgValue::try_from(&Value::I32(1)).is_ok());
        assert!(PgValue::try_from(&Value::Str("x".into())).is_ok());
        assert!(PgValue::try_from(&Value::Null).is_ok());
    }

    #[test]
    fn entity_values_are_rejected() {
        let handle: Handle = Rc::new(RefCell::new(Stub::default()));
        let err = PgValue::try_from(&Value::Entity(handle)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TypeMismatch);
    }
}

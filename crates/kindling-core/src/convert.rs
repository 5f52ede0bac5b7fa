use crate::entity::{cast_mut, cast_ref, Entity, Handle, Ref};
use crate::kind::{Column, Persist};
use crate::value::FieldCodec;
use crate::{registry, Error, Result, Value};

use std::any::Any;

/// Describes the scanners a column contributes to a result row.
#[derive(Debug, Clone)]
pub enum ColumnScan {
    /// One result column, deposited under the field name.
    Basic { field: String },
    /// Two result columns (kind name, id) materialized into an empty entity
    /// of the scanned kind.
    Reference { field: String, expects: String },
}

impl ColumnScan {
    /// How many result columns this scanner consumes.
    pub fn width(&self) -> usize {
        match self {
            ColumnScan::Basic { .. } => 1,
            ColumnScan::Reference { .. } => 2,
        }
    }
}

/// Encodes how one column moves between the entity field, SQL text and the
/// scanned result row.
pub trait Converter: std::fmt::Debug + Send + Sync {
    /// The SQL column type declaration.
    fn sql_type(&self, col: &Column, schema: &str) -> String;

    /// The placeholder expression in INSERT/UPDATE value lists.
    fn sql_text_out(&self, col: &Column, schema: &str) -> String;

    /// The parameter values to bind for this column.
    fn bind(&self, entity: &dyn Entity, col: &Column) -> Result<Vec<Value>>;

    /// The SELECT expression(s) for this column. `in_with` is true inside
    /// the WITH clause, where the physical column is in scope; outside it
    /// the expression refers to the clause's output columns.
    fn sql_text_in(&self, col: &Column, alias: &str, in_with: bool) -> String;

    /// Appends this column's scanner descriptors.
    fn scan_columns(&self, col: &Column, out: &mut Vec<ColumnScan>);

    /// Deposits a scanned or user-supplied value into the field, coercing
    /// where possible.
    fn set_value(&self, entity: &mut dyn Entity, col: &Column, value: Value) -> Result<()>;

    /// Copies the field from `src` to `dst`.
    fn copy_field(&self, src: &dyn Entity, dst: &mut dyn Entity, col: &Column) -> Result<()>;

    /// The referenced kind name, for reference columns.
    fn reference_kind(&self) -> Option<&str> {
        None
    }

    /// The referenced kind descriptor, for reference columns.
    fn reference_target(&self) -> Option<std::sync::Arc<crate::Kind>> {
        None
    }

    /// Wires a resolved entity into a reference field.
    fn set_reference(
        &self,
        _entity: &mut dyn Entity,
        col: &Column,
        _target: Option<Handle>,
    ) -> Result<()> {
        Err(Error::column_bind(format!(
            "column '{}' is not a reference",
            col.field_name
        )))
    }
}

/// Walks `depth` base links and narrows to the column's declaring type.
fn locate<'a, E: Any>(mut entity: &'a dyn Entity, depth: usize, field: &str) -> Result<&'a E> {
    for _ in 0..depth {
        entity = entity.base().ok_or_else(|| {
            Error::type_mismatch(format!("entity base chain too short for field '{field}'"))
        })?;
    }
    cast_ref::<E>(entity)
        .ok_or_else(|| Error::type_mismatch(format!("entity does not declare field '{field}'")))
}

fn locate_mut<'a, E: Any>(
    mut entity: &'a mut dyn Entity,
    depth: usize,
    field: &str,
) -> Result<&'a mut E> {
    for _ in 0..depth {
        entity = entity.base_mut().ok_or_else(|| {
            Error::type_mismatch(format!("entity base chain too short for field '{field}'"))
        })?;
    }
    cast_mut::<E>(entity)
        .ok_or_else(|| Error::type_mismatch(format!("entity does not declare field '{field}'")))
}

fn quoted(alias: &str, column: &str) -> String {
    if alias.is_empty() {
        format!("\"{column}\"")
    } else {
        format!("{alias}.\"{column}\"")
    }
}

/// One-to-one mapping between a field type and a SQL column type.
pub struct BasicConverter<E, F> {
    sql_type: &'static str,
    get: fn(&E) -> &F,
    get_mut: fn(&mut E) -> &mut F,
}

impl<E, F: FieldCodec> BasicConverter<E, F> {
    pub fn new(get: fn(&E) -> &F, get_mut: fn(&mut E) -> &mut F) -> Self {
        BasicConverter {
            sql_type: F::SQL_TYPE,
            get,
            get_mut,
        }
    }
}

impl<E, F> std::fmt::Debug for BasicConverter<E, F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BasicConverter({})", self.sql_type)
    }
}

impl<E: Persist, F: FieldCodec> Converter for BasicConverter<E, F> {
    fn sql_type(&self, col: &Column, _schema: &str) -> String {
        // The `type` tag overrides the declared SQL type.
        col.tags
            .get("type")
            .unwrap_or(self.sql_type)
            .to_string()
    }

    fn sql_text_out(&self, _col: &Column, _schema: &str) -> String {
        "__count__".to_string()
    }

    fn bind(&self, entity: &dyn Entity, col: &Column) -> Result<Vec<Value>> {
        let entity = locate::<E>(entity, col.base_depth, &col.field_name)?;
        Ok(vec![(self.get)(entity).to_value()])
    }

    fn sql_text_in(&self, col: &Column, alias: &str, _in_with: bool) -> String {
        quoted(alias, &col.column_name)
    }

    fn scan_columns(&self, col: &Column, out: &mut Vec<ColumnScan>) {
        out.push(ColumnScan::Basic {
            field: col.field_name.clone(),
        });
    }

    fn set_value(&self, entity: &mut dyn Entity, col: &Column, value: Value) -> Result<()> {
        let entity = locate_mut::<E>(entity, col.base_depth, &col.field_name)?;
        *(self.get_mut)(entity) = F::from_value(value)?;
        Ok(())
    }

    fn copy_field(&self, src: &dyn Entity, dst: &mut dyn Entity, col: &Column) -> Result<()> {
        let value = (self.get)(locate::<E>(src, col.base_depth, &col.field_name)?).clone();
        *(self.get_mut)(locate_mut::<E>(dst, col.base_depth, &col.field_name)?) = value;
        Ok(())
    }
}

/// A column that stores another entity's `(kind, id)` pair.
pub struct ReferenceConverter<E, T: Persist> {
    kind_name: String,
    // Resolved lazily so that mutually-referencing kinds can register.
    resolve: fn() -> std::sync::Arc<crate::Kind>,
    get: fn(&E) -> &Ref<T>,
    get_mut: fn(&mut E) -> &mut Ref<T>,
}

impl<E, T: Persist> ReferenceConverter<E, T> {
    pub fn new(get: fn(&E) -> &Ref<T>, get_mut: fn(&mut E) -> &mut Ref<T>) -> Self {
        ReferenceConverter {
            kind_name: T::kind_name(),
            resolve: registry::kind_of::<T>,
            get,
            get_mut,
        }
    }
}

impl<E, T: Persist> std::fmt::Debug for ReferenceConverter<E, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ReferenceConverter({})", self.kind_name)
    }
}

impl<E: Persist, T: Persist> Converter for ReferenceConverter<E, T> {
    fn sql_type(&self, _col: &Column, schema: &str) -> String {
        format!("\"{schema}\".\"Reference\"")
    }

    fn sql_text_out(&self, _col: &Column, schema: &str) -> String {
        format!("__count__::\"{schema}\".\"Reference\"")
    }

    fn bind(&self, entity: &dyn Entity, col: &Column) -> Result<Vec<Value>> {
        let reference = (self.get)(locate::<E>(entity, col.base_depth, &col.field_name)?);
        if reference.is_null() {
            return Ok(vec![Value::Null]);
        }
        let key = reference.key();
        let kind_name = key.kind().unwrap_or("");
        let kind = registry::kind_named(kind_name).ok_or_else(|| {
            Error::type_mismatch(format!("kind '{kind_name}' is not registered"))
        })?;
        if !kind.derives_from(&self.kind_name) {
            return Err(Error::type_mismatch(format!(
                "kind '{}' does not derive from '{}'",
                kind.name(),
                self.kind_name
            )));
        }
        Ok(vec![Value::Str(key.reference_literal())])
    }

    fn sql_text_in(&self, col: &Column, alias: &str, in_with: bool) -> String {
        let name = &col.column_name;
        if in_with {
            let colref = quoted(alias, name);
            format!("({colref}).\"kind\" \"{name}.kind\", ({colref}).\"id\" \"{name}.id\"")
        } else {
            format!(
                "{}, {}",
                quoted(alias, &format!("{name}.kind")),
                quoted(alias, &format!("{name}.id"))
            )
        }
    }

    fn scan_columns(&self, col: &Column, out: &mut Vec<ColumnScan>) {
        out.push(ColumnScan::Reference {
            field: col.field_name.clone(),
            expects: self.kind_name.clone(),
        });
    }

    fn set_value(&self, entity: &mut dyn Entity, col: &Column, value: Value) -> Result<()> {
        match value {
            Value::Entity(handle) => self.set_reference(entity, col, Some(handle)),
            Value::Null => self.set_reference(entity, col, None),
            Value::Key(key) => {
                let reference =
                    (self.get_mut)(locate_mut::<E>(entity, col.base_depth, &col.field_name)?);
                *reference = Ref::to_key(key);
                Ok(())
            }
            Value::Str(text) => {
                let key = crate::Key::parse(&text)?;
                self.set_value(entity, col, Value::Key(key))
            }
            other => Err(Error::type_mismatch(format!(
                "cannot assign {other:?} to reference column '{}'",
                col.field_name
            ))),
        }
    }

    fn copy_field(&self, src: &dyn Entity, dst: &mut dyn Entity, col: &Column) -> Result<()> {
        let value = (self.get)(locate::<E>(src, col.base_depth, &col.field_name)?).clone();
        *(self.get_mut)(locate_mut::<E>(dst, col.base_depth, &col.field_name)?) = value;
        Ok(())
    }

    fn reference_kind(&self) -> Option<&str> {
        Some(&self.kind_name)
    }

    fn reference_target(&self) -> Option<std::sync::Arc<crate::Kind>> {
        Some((self.resolve)())
    }

    fn set_reference(
        &self,
        entity: &mut dyn Entity,
        col: &Column,
        target: Option<Handle>,
    ) -> Result<()> {
        if let Some(handle) = &target {
            let key = handle.borrow().meta().key().clone();
            let kind_name = key.kind().unwrap_or("").to_string();
            let kind = registry::kind_named(&kind_name).ok_or_else(|| {
                Error::type_mismatch(format!("kind '{kind_name}' is not registered"))
            })?;
            if !kind.derives_from(&self.kind_name) {
                return Err(Error::type_mismatch(format!(
                    "kind '{}' does not derive from '{}'",
                    kind.name(),
                    self.kind_name
                )));
            }
        }
        let reference = (self.get_mut)(locate_mut::<E>(entity, col.base_depth, &col.field_name)?);
        reference.assign(target);
        Ok(())
    }
}

use crate::convert::{BasicConverter, Converter, ReferenceConverter};
use crate::entity::{Entity, Handle, Ref};
use crate::query::{Params, Query};
use crate::value::FieldCodec;
use crate::{registry, Key, Tags};

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// An entity type that can be described to the registry.
///
/// The kind name defaults to the lower-cased module path of the type with
/// `::` replaced by `.`; override [`Persist::kind_name`] to pin a different
/// name.
pub trait Persist: Entity + Default {
    fn kind_name() -> String
    where
        Self: Sized,
    {
        std::any::type_name::<Self>()
            .replace("::", ".")
            .to_ascii_lowercase()
    }

    /// Declares the persistable shape of the type. A derived kind declares
    /// its base first, then its own fields.
    fn describe(builder: &mut KindBuilder<Self>)
    where
        Self: Sized;
}

/// One persisted column of a kind.
#[derive(Debug, Clone)]
pub struct Column {
    /// Name of the kind that declared this column.
    pub owner: String,
    pub field_name: String,
    /// How many base links to walk from the owning entity to the declaring
    /// type. Inherited columns are clones of the base's with this bumped.
    pub base_depth: usize,
    pub column_name: String,
    /// Synthesized in SELECT expressions, never written on insert/update.
    pub formula: Option<String>,
    pub verbose_name: String,
    /// Constrained by a unique index, optionally scoped by `_parent`.
    pub is_key: bool,
    pub scoped: bool,
    pub required: bool,
    pub converter: Arc<dyn Converter>,
    pub tags: Tags,
}

/// Per-kind query hooks.
#[derive(Debug, Clone, Copy, Default)]
pub struct KindHooks {
    pub prepare_get: Option<fn(&mut Query)>,
    pub prepare_query: Option<fn(&mut Query, &Params)>,
}

/// The registered description of one entity type.
pub struct Kind {
    name: String,
    basename: String,
    table_name: String,
    verbose_name: String,
    label_col: Option<String>,
    pub columns: Vec<Column>,
    by_field: HashMap<String, usize>,
    pub tags: Tags,
    pub parent_kind: Option<String>,
    /// Fields kept in memory and copied around, never persisted.
    pub transient: Vec<Column>,
    pub hooks: KindHooks,
    type_id: TypeId,
    base: Option<Arc<Kind>>,
    derived: RwLock<Vec<Arc<Kind>>>,
    make_handle: fn() -> Handle,
}

impl std::fmt::Debug for Kind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kind")
            .field("name", &self.name)
            .field("table_name", &self.table_name)
            .field("columns", &self.columns)
            .field("base", &self.base.as_ref().map(|b| b.name()))
            .field(
                "derived",
                &self
                    .derived
                    .read()
                    .unwrap()
                    .iter()
                    .map(|d| d.name().to_string())
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl Kind {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn basename(&self) -> &str {
        &self.basename
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn qualified_table(&self, schema: &str) -> String {
        format!("\"{}\".\"{}\"", schema, self.table_name)
    }

    pub fn verbose_name(&self) -> &str {
        &self.verbose_name
    }

    /// The field name of the label column, if one is tagged.
    pub fn label_col(&self) -> Option<&str> {
        self.label_col.as_deref()
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn column(&self, field_name: &str) -> Option<&Column> {
        self.by_field.get(field_name).map(|ix| &self.columns[*ix])
    }

    pub fn column_by_column_name(&self, column_name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.column_name == column_name)
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.column_name.as_str()).collect()
    }

    pub fn field_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.field_name.as_str()).collect()
    }

    pub fn base(&self) -> Option<&Arc<Kind>> {
        self.base.as_ref()
    }

    /// All kinds deriving from this one, transitively.
    pub fn derived_kinds(&self) -> Vec<Arc<Kind>> {
        let mut ret: Vec<Arc<Kind>> = self.derived.read().unwrap().clone();
        let mut ix = 0;
        while ix < ret.len() {
            let more: Vec<Arc<Kind>> = ret[ix].derived.read().unwrap().clone();
            ret.extend(more);
            ix += 1;
        }
        ret
    }

    pub(crate) fn add_derived(&self, kind: Arc<Kind>) {
        let mut derived = self.derived.write().unwrap();
        if derived.iter().all(|d| d.name() != kind.name()) {
            derived.push(kind);
        }
    }

    /// True when this kind is `base` or transitively derives from it.
    pub fn derives_from(&self, base: &str) -> bool {
        let mut current = Some(self);
        while let Some(kind) = current {
            if kind.name == base {
                return true;
            }
            current = kind.base.as_deref();
        }
        false
    }

    pub fn derives_from_kind(&self, base: &Kind) -> bool {
        self.derives_from(base.name())
    }

    /// Allocates an in-memory entity bound to `(kind, id)` under `parent`.
    /// Does not hit the database.
    pub fn make(&self, parent: &Key, id: i64) -> Handle {
        let handle = (self.make_handle)();
        handle.borrow_mut().meta_mut().initialize(parent, &self.name, id);
        handle
    }

    /// Allocates a fresh in-memory entity with id 0.
    pub fn new_entity(&self, parent: &Key) -> Handle {
        self.make(parent, 0)
    }
}

/// Builder-style registration of a kind. Obtained through
/// [`registry::kind_of`], which drives [`Persist::describe`].
pub struct KindBuilder<E: Persist> {
    name: String,
    table_name: String,
    verbose_name: String,
    label_col: Option<String>,
    parent_kind: Option<String>,
    tags: Tags,
    columns: Vec<Column>,
    by_field: HashMap<String, usize>,
    transient: Vec<Column>,
    base: Option<Arc<Kind>>,
    hooks: KindHooks,
    _marker: std::marker::PhantomData<fn(E)>,
}

impl<E: Persist> KindBuilder<E> {
    pub(crate) fn new() -> KindBuilder<E> {
        let name = E::kind_name();
        let basename = basename_of(&name).to_string();
        KindBuilder {
            verbose_name: basename.clone(),
            table_name: basename,
            name,
            label_col: None,
            parent_kind: None,
            tags: Tags::new(),
            columns: Vec::new(),
            by_field: HashMap::new(),
            transient: Vec::new(),
            base: None,
            hooks: KindHooks::default(),
            _marker: std::marker::PhantomData,
        }
    }

    /// Applies entity-level tags: `tablename`, `verbosename`, `parentkind`.
    pub fn kind_tags(&mut self, source: &str) -> &mut Self {
        let tags = Tags::parse(source);
        if let Some(v) = tags.get("tablename") {
            self.table_name = v.to_string();
        }
        if let Some(v) = tags.get("verbosename") {
            self.verbose_name = v.to_string();
        }
        if let Some(v) = tags.get("parentkind") {
            self.parent_kind = Some(v.to_string());
        }
        self.tags.merge(&tags);
        self
    }

    pub fn table_name(&mut self, name: &str) -> &mut Self {
        self.table_name = name.to_string();
        self
    }

    pub fn verbose_name(&mut self, name: &str) -> &mut Self {
        self.verbose_name = name.to_string();
        self
    }

    /// The logical parent kind for hierarchy queries.
    pub fn parent_kind(&mut self, kind_name: &str) -> &mut Self {
        self.parent_kind = Some(kind_name.to_string());
        self
    }

    /// Declares the base kind. Must come before any field declarations so
    /// that the base's columns stay the leading columns of this kind.
    pub fn base<B: Persist>(&mut self) -> &mut Self {
        if self.base.is_some() {
            panic!("kind '{}': multiple inheritance is not supported", self.name);
        }
        if !self.columns.is_empty() {
            panic!(
                "kind '{}': the base kind must be declared before any fields",
                self.name
            );
        }
        let base = registry::kind_of::<B>();
        for column in &base.columns {
            let mut inherited = column.clone();
            inherited.base_depth += 1;
            self.add_column(inherited);
        }
        for column in &base.transient {
            let mut inherited = column.clone();
            inherited.base_depth += 1;
            self.transient.push(inherited);
        }
        self.base = Some(base);
        self
    }

    /// Declares a persisted scalar column.
    pub fn field<F: FieldCodec>(
        &mut self,
        name: &str,
        get: fn(&E) -> &F,
        get_mut: fn(&mut E) -> &mut F,
    ) -> ColumnConf<'_, E> {
        let converter = Arc::new(BasicConverter::new(get, get_mut));
        self.push_field(name, converter)
    }

    /// Declares a reference column pointing at entities of kind `T` (or any
    /// kind derived from it).
    pub fn reference<T: Persist>(
        &mut self,
        name: &str,
        get: fn(&E) -> &Ref<T>,
        get_mut: fn(&mut E) -> &mut Ref<T>,
    ) -> ColumnConf<'_, E> {
        let converter = Arc::new(ReferenceConverter::new(get, get_mut));
        self.push_field(name, converter)
    }

    fn push_field(&mut self, name: &str, converter: Arc<dyn Converter>) -> ColumnConf<'_, E> {
        let column = Column {
            owner: self.name.clone(),
            field_name: name.to_string(),
            base_depth: 0,
            column_name: name.to_string(),
            formula: None,
            verbose_name: default_verbose_name(name),
            is_key: false,
            scoped: false,
            required: false,
            converter,
            tags: Tags::new(),
        };
        self.add_column(column);
        ColumnConf {
            index: self.columns.len() - 1,
            builder: self,
        }
    }

    /// Declares a field that is kept in memory (and receives matching
    /// synthetic result columns) but is never persisted.
    pub fn transient<F: FieldCodec>(
        &mut self,
        name: &str,
        get: fn(&E) -> &F,
        get_mut: fn(&mut E) -> &mut F,
    ) -> &mut Self {
        self.transient.push(Column {
            owner: self.name.clone(),
            field_name: name.to_string(),
            base_depth: 0,
            column_name: name.to_string(),
            formula: None,
            verbose_name: default_verbose_name(name),
            is_key: false,
            scoped: false,
            required: false,
            converter: Arc::new(BasicConverter::new(get, get_mut)),
            tags: Tags::new(),
        });
        self
    }

    pub fn prepare_get(&mut self, hook: fn(&mut Query)) -> &mut Self {
        self.hooks.prepare_get = Some(hook);
        self
    }

    pub fn prepare_query(&mut self, hook: fn(&mut Query, &Params)) -> &mut Self {
        self.hooks.prepare_query = Some(hook);
        self
    }

    fn add_column(&mut self, column: Column) {
        if self.by_field.contains_key(&column.field_name) {
            panic!(
                "kind '{}' cannot have two columns with the same name '{}'",
                self.name, column.column_name
            );
        }
        self.by_field
            .insert(column.field_name.clone(), self.columns.len());
        self.columns.push(column);
    }

    pub(crate) fn finish(self, type_id: TypeId, make_handle: fn() -> Handle) -> Kind {
        Kind {
            basename: basename_of(&self.name).to_string(),
            name: self.name,
            table_name: self.table_name,
            verbose_name: self.verbose_name,
            label_col: self.label_col,
            columns: self.columns,
            by_field: self.by_field,
            tags: self.tags,
            parent_kind: self.parent_kind,
            transient: self.transient,
            hooks: self.hooks,
            type_id,
            base: self.base,
            derived: RwLock::new(Vec::new()),
            make_handle,
        }
    }
}

/// Per-column configuration, chained off a field declaration.
pub struct ColumnConf<'a, E: Persist> {
    builder: &'a mut KindBuilder<E>,
    index: usize,
}

impl<E: Persist> ColumnConf<'_, E> {
    fn column(&mut self) -> &mut Column {
        &mut self.builder.columns[self.index]
    }

    /// Applies a configuration tag string to this column. Recognized names:
    /// `key`, `scoped`, `required`, `label`, `columnname`, `verbosename`,
    /// `formula`, `type`.
    pub fn tags(&mut self, source: &str) -> &mut Self {
        let tags = Tags::parse(source);
        if tags.get_bool("key").unwrap_or(false) {
            self.column().is_key = true;
            self.column().scoped = tags.get_bool("scoped").unwrap_or(true);
        }
        if tags.get_bool("required").unwrap_or(false) {
            self.column().required = true;
        }
        if tags.get_bool("label").unwrap_or(false) {
            let field = self.column().field_name.clone();
            self.builder.label_col = Some(field);
        }
        if let Some(v) = tags.get("columnname") {
            self.column().column_name = v.to_string();
        }
        if let Some(v) = tags.get("verbosename") {
            self.column().verbose_name = v.to_string();
        }
        if let Some(v) = tags.get("formula") {
            self.column().formula = Some(v.to_string());
        }
        self.column().tags.merge(&tags);
        self
    }

    /// Marks this column as a key: constrained by a unique index, scoped by
    /// `_parent` unless `scoped(false)` follows.
    pub fn key(&mut self) -> &mut Self {
        self.column().is_key = true;
        self.column().scoped = true;
        self
    }

    pub fn scoped(&mut self, scoped: bool) -> &mut Self {
        self.column().scoped = scoped;
        self
    }

    pub fn required(&mut self) -> &mut Self {
        self.column().required = true;
        self
    }

    /// Marks this column as the kind's label column.
    pub fn label(&mut self) -> &mut Self {
        let field = self.column().field_name.clone();
        self.builder.label_col = Some(field);
        self
    }

    pub fn column_name(&mut self, name: &str) -> &mut Self {
        self.column().column_name = name.to_string();
        self
    }

    pub fn verbose_name(&mut self, name: &str) -> &mut Self {
        self.column().verbose_name = name.to_string();
        self
    }

    /// Declares the column as computed by a SQL formula; it is synthesized
    /// in SELECT expressions and never written.
    pub fn formula(&mut self, formula: &str) -> &mut Self {
        self.column().formula = Some(formula.to_string());
        self
    }
}

fn basename_of(name: &str) -> &str {
    name.rsplit('.').next().unwrap_or(name)
}

/// `TotalQuantity` becomes `Total Quantity`, `unit_price` becomes
/// `Unit price`.
fn default_verbose_name(field: &str) -> String {
    let mut out = String::new();
    let mut prev_lower = false;
    for c in field.chars() {
        if c == '_' {
            out.push(' ');
            prev_lower = false;
            continue;
        }
        if c.is_uppercase() && prev_lower {
            out.push(' ');
        }
        prev_lower = c.is_lowercase();
        if out.is_empty() {
            out.extend(c.to_uppercase());
        } else {
            out.push(c);
        }
    }
    out
}

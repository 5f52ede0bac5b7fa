use crate::scanner::{ResultRow, ScannerSet};
use crate::EntityCache;

use kindling_core::{
    kind_for_type_id, kind_named, kind_of, Condition, Entity, Error, Handle, Key, Kind, Params,
    Persist, Query, Result, Sort, SortOrder, Value,
};
use kindling_postgres::{reconcile_kind, Adapter, AdapterConfig, Connection};
use kindling_sql::{delete_sql, insert_sql, render_query, update_sql};

use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;
use std::sync::{Arc, Mutex, OnceLock};
use tracing::debug;

/// Kinds whose tables this process has already reconciled, keyed on
/// database, schema and kind name.
fn reconciled() -> &'static Mutex<HashSet<String>> {
    static RECONCILED: OnceLock<Mutex<HashSet<String>>> = OnceLock::new();
    RECONCILED.get_or_init(Default::default)
}

/// The public facade of the engine.
///
/// A manager owns one logical session: a database connection with
/// structurally nested transactions, plus a per-manager entity cache.
/// Entities are shared [`Handle`]s; within one manager, loading the same
/// `(kind, id)` twice yields the same handle until it is deleted or
/// unstashed.
pub struct EntityManager {
    adapter: Adapter,
    conn: Connection,
    cache: RefCell<EntityCache>,
}

impl EntityManager {
    /// Opens a manager on the process-wide default adapter.
    pub async fn open() -> Result<EntityManager> {
        Self::with_adapter(Adapter::acquire().await?).await
    }

    pub async fn with_adapter(adapter: Adapter) -> Result<EntityManager> {
        let conn = adapter.connect().await?;
        Ok(EntityManager {
            adapter,
            conn,
            cache: RefCell::new(EntityCache::new()),
        })
    }

    /// Builds and initializes a dedicated adapter, then opens a manager on
    /// it.
    pub async fn with_config(config: AdapterConfig) -> Result<EntityManager> {
        Self::with_adapter(Adapter::with_config(config).await?).await
    }

    pub fn schema(&self) -> &str {
        self.adapter.schema()
    }

    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    /// The underlying connection, for callers that need to iterate raw
    /// results themselves.
    pub fn connection(&mut self) -> &mut Connection {
        &mut self.conn
    }

    /// Registers `T`'s kind and brings its table into conformance the
    /// first time this process sees it.
    pub async fn register<T: Persist>(&mut self) -> Result<Arc<Kind>> {
        let kind = kind_of::<T>();
        self.ensure_reconciled(&kind).await?;
        Ok(kind)
    }

    async fn ensure_reconciled(&mut self, kind: &Arc<Kind>) -> Result<()> {
        let key = format!(
            "{}/{}/{}",
            self.adapter.config.database_name,
            self.schema(),
            kind.name()
        );
        if reconciled().lock().unwrap().contains(&key) {
            return Ok(());
        }
        let schema = self.schema().to_string();
        reconcile_kind(&mut self.conn, kind, &schema, self.adapter.config.reconcile).await?;
        reconciled().lock().unwrap().insert(key);
        Ok(())
    }

    fn kind_of_handle(handle: &Handle) -> Result<Arc<Kind>> {
        let borrowed = handle.borrow();
        let any: &dyn std::any::Any = borrowed.as_any();
        kind_for_type_id(any.type_id())
            .ok_or_else(|| Error::invalid_identifier("entity kind is not registered"))
    }

    /// Allocates an in-memory entity bound to `(kind, id)`; no database
    /// round-trip.
    pub fn make(&self, kind: &Arc<Kind>, parent: &Key, id: i64) -> Handle {
        kind.make(parent, id)
    }

    /// Allocates a fresh in-memory entity with id 0.
    pub fn new_entity(&self, kind: &Arc<Kind>, parent: &Key) -> Handle {
        kind.new_entity(parent)
    }

    pub fn query_for(&self, kind: &Arc<Kind>) -> Query {
        Query::new(kind.clone(), self.schema())
    }

    pub fn stash(&self, handle: Handle) {
        self.cache.borrow_mut().stash(handle);
    }

    pub fn unstash(&self, handle: &Handle) {
        self.cache.borrow_mut().evict(handle);
    }

    /// Loads an entity by id, with reference fields wired to their joined
    /// entities. A cache hit short-circuits the database entirely.
    pub async fn get(&mut self, kind: &Arc<Kind>, id: i64) -> Result<Option<Handle>> {
        if id <= 0 {
            return Err(Error::invalid_identifier(
                "cannot get an entity with id less than or equal to zero",
            ));
        }
        if let Some(hit) = self.cache.borrow().get(kind.name(), id) {
            return Ok(Some(hit));
        }
        self.ensure_reconciled(kind).await?;
        let mut query = self.query_for(kind);
        query.add_condition(Condition::HasId(id));
        query.add_reference_joins();
        if let Some(hook) = kind.hooks.prepare_get {
            hook(&mut query);
        }
        let found = self.execute_single(&query, None).await?;
        if let Some(handle) = &found {
            handle.borrow_mut().on_get()?;
        }
        Ok(found)
    }

    /// Typed convenience over [`EntityManager::get`].
    pub async fn get_as<T: Persist>(&mut self, id: i64) -> Result<Option<Handle>> {
        let kind = self.register::<T>().await?;
        self.get(&kind, id).await
    }

    /// Materializes the entity a key denotes.
    pub async fn fetch(&mut self, key: &Key) -> Result<Option<Handle>> {
        let Some(name) = key.kind() else {
            return Ok(None);
        };
        let kind = kind_named(name)
            .ok_or_else(|| Error::invalid_identifier(format!("kind '{name}' is not registered")))?;
        self.get(&kind, key.id()).await
    }

    /// Looks up a single entity by one column's value.
    pub async fn by(
        &mut self,
        kind: &Arc<Kind>,
        field: &str,
        value: impl Into<Value>,
    ) -> Result<Option<Handle>> {
        self.by_column_and_parent(kind, None, field, value).await
    }

    pub async fn by_column_and_parent(
        &mut self,
        kind: &Arc<Kind>,
        parent: Option<&Key>,
        field: &str,
        value: impl Into<Value>,
    ) -> Result<Option<Handle>> {
        self.ensure_reconciled(kind).await?;
        let mut query = self.query_for(kind);
        if let Some(parent) = parent {
            query.add_condition(Condition::HasParent(parent.clone()));
        }
        query.add_filter(field, value);
        self.execute_single(&query, None).await
    }

    /// Fetches by column and parent, creating and persisting the entity
    /// when nothing matches.
    pub async fn find_or_create(
        &mut self,
        kind: &Arc<Kind>,
        parent: &Key,
        field: &str,
        value: &str,
    ) -> Result<Handle> {
        if let Some(found) = self
            .by_column_and_parent(kind, Some(parent), field, value.to_string())
            .await?
        {
            return Ok(found);
        }
        let handle = self.new_entity(kind, parent);
        {
            let column = kind.column(field).ok_or_else(|| {
                Error::column_bind(format!(
                    "could not set field '{field}' on entity of kind '{}'",
                    kind.name()
                ))
            })?;
            let mut borrowed = handle.borrow_mut();
            column
                .converter
                .set_value(&mut *borrowed, column, Value::Str(value.to_string()))?;
        }
        self.put(&handle).await?;
        Ok(handle)
    }

    /// Re-loads the entity and copies the stored columns into the provided
    /// handle, preserving its storage.
    pub async fn inflate(&mut self, handle: &Handle) -> Result<()> {
        let kind = Self::kind_of_handle(handle)?;
        let id = handle.borrow().meta().id();
        if let Some(found) = self.get(&kind, id).await? {
            Self::copy_into(&found, handle)?;
        }
        Ok(())
    }

    /// Runs a query and rebuilds one entity vector per result row.
    pub async fn execute(&mut self, query: &Query) -> Result<Vec<ResultRow>> {
        let (sql, values) = render_query(query);
        let guard = self.conn.begin().await?;
        let result = self.conn.query(&sql, &values).await;
        let raw = self.conn.finish(guard, result).await?;
        let mut scanners = ScannerSet::for_query(query);
        let mut rows = Vec::with_capacity(raw.len());
        for row in raw {
            rows.push(scanners.scan_row(row, &self.cache)?);
        }
        debug!(kind = query.kind().name(), rows = rows.len(), "query executed");
        Ok(rows)
    }

    /// Runs a query expected to match at most one entity. With a target
    /// handle, the found entity's columns are copied into it when the
    /// dynamic kinds agree.
    pub async fn execute_single(
        &mut self,
        query: &Query,
        into: Option<&Handle>,
    ) -> Result<Option<Handle>> {
        let mut rows = self.execute(query).await?;
        match rows.len() {
            0 => Ok(None),
            1 => {
                let row = rows.swap_remove(0);
                let found = row.into_iter().next().flatten();
                if let (Some(found), Some(target)) = (&found, into) {
                    Self::copy_into(found, target)?;
                }
                Ok(found)
            }
            _ => Err(Error::multiple_rows(
                "call to execute_single returned more than one result",
            )),
        }
    }

    /// Builds and runs a query from a key/value parameter bag: per-column
    /// filters (regex matching when `_re` is set), `_parent`, `_sort`,
    /// `joinparent`, plus reference joins.
    pub async fn query(&mut self, kind: &Arc<Kind>, params: &Params) -> Result<Vec<ResultRow>> {
        self.ensure_reconciled(kind).await?;
        let mut query = self.query_for(kind);
        let operator = if params.truthy("_re") { "~*" } else { "=" };
        for column in &kind.columns {
            let Some(value) = params.get(&column.field_name) else {
                continue;
            };
            if let Some(target) = column.converter.reference_target() {
                let id: i64 = value.trim().parse().map_err(|_| {
                    Error::invalid_identifier(format!(
                        "reference filter value '{value}' is not an id"
                    ))
                })?;
                let key = Key::new(&Key::zero(), target.name(), id);
                query.add_condition(Condition::references(&column.column_name, key, false));
            } else {
                // Values arrive as text; compare against the column's text
                // form so typed columns stay filterable.
                query.add_condition(Condition::Predicate {
                    expression: format!("__alias__.\"{}\"::text", column.column_name),
                    operator: operator.to_string(),
                    value: Value::Str(value.to_string()),
                });
            }
        }
        if let Some(parent) = params.get("_parent") {
            query.add_condition(Condition::HasParent(Key::parse(parent)?));
        }
        if let Some(sorts) = params.get("_sort") {
            for entry in sorts.split(';').filter(|s| !s.is_empty()) {
                let mut parts = entry.splitn(2, ':');
                let column = parts.next().unwrap_or_default().to_string();
                let direction = match parts.next().map(str::to_ascii_uppercase).as_deref() {
                    Some("DESC") => SortOrder::Descending,
                    _ => SortOrder::Ascending,
                };
                query.add_sort(Sort {
                    alias: None,
                    column,
                    direction,
                });
            }
        }
        if let Some(parent_name) = params.get("joinparent").map(str::to_string) {
            if let Some(parent_kind) = kind_named(&parent_name) {
                query.add_parent_join(parent_kind.clone());
                if let Some(id_text) = params.get(&parent_name).map(str::to_string) {
                    let id: i64 = id_text.trim().parse().map_err(|_| {
                        Error::invalid_identifier(format!(
                            "parent filter value '{id_text}' is not an id"
                        ))
                    })?;
                    if let Some(parent) = self.get(&parent_kind, id).await? {
                        let key = parent.borrow().meta().key().clone();
                        query.add_condition(Condition::HasParent(key));
                    }
                }
            }
        } else if let Some(parent_name) = &kind.parent_kind {
            if let Some(parent_kind) = kind_named(parent_name) {
                query.add_parent_join(parent_kind);
            }
        }
        query.add_reference_joins();
        if let Some(hook) = kind.hooks.prepare_query {
            hook(&mut query, params);
        }
        self.execute(&query).await
    }

    /// Persists an entity: id 0 inserts and assigns the returned id,
    /// otherwise updates. Runs inside a transaction with the entity's
    /// lifecycle hooks.
    pub async fn put(&mut self, handle: &Handle) -> Result<()> {
        let kind = Self::kind_of_handle(handle)?;
        self.ensure_reconciled(&kind).await?;
        {
            let mut borrowed = handle.borrow_mut();
            let meta = borrowed.meta_mut();
            if meta.kind_name().is_none() {
                let parent = meta.parent();
                let id = meta.id();
                meta.initialize(&parent, kind.name(), id);
            }
        }
        let guard = self.conn.begin().await?;
        let result = self.put_inner(&kind, handle).await;
        self.conn.finish(guard, result).await
    }

    async fn put_inner(&mut self, kind: &Arc<Kind>, handle: &Handle) -> Result<()> {
        handle.borrow_mut().on_put()?;
        let id = handle.borrow().meta().id();
        if id > 0 {
            self.update_entity(kind, handle).await?;
        } else {
            handle.borrow_mut().on_insert()?;
            self.insert_entity(kind, handle).await?;
            handle.borrow_mut().after_insert()?;
            self.stash(handle.clone());
        }
        handle.borrow_mut().after_put()?;
        Ok(())
    }

    async fn insert_entity(&mut self, kind: &Arc<Kind>, handle: &Handle) -> Result<()> {
        let sql = insert_sql(kind, self.schema());
        let parent = handle.borrow().meta().parent();
        let mut values = vec![Value::Str(parent.array_literal())];
        {
            let borrowed = handle.borrow();
            let entity: &dyn Entity = &*borrowed;
            for column in kind.columns.iter().filter(|c| c.formula.is_none()) {
                values.extend(column.converter.bind(entity, column)?);
            }
        }
        let row = self
            .conn
            .query_row(&sql, &values)
            .await?
            .ok_or_else(|| Error::no_row("insert did not return assigned key"))?;
        let id = row
            .first()
            .and_then(Value::as_i64)
            .ok_or_else(|| Error::sql("insert returned a non-integer id"))?;
        let mut borrowed = handle.borrow_mut();
        let meta = borrowed.meta_mut();
        meta.initialize(&parent, kind.name(), id);
        meta.set_populated(true);
        Ok(())
    }

    async fn update_entity(&mut self, kind: &Arc<Kind>, handle: &Handle) -> Result<()> {
        if !handle.borrow().meta().populated() {
            return Err(Error::invalid_identifier(
                "cannot update entity: it is not loaded",
            ));
        }
        let sql = update_sql(kind, self.schema());
        let mut values = Vec::new();
        {
            let borrowed = handle.borrow();
            let entity: &dyn Entity = &*borrowed;
            for column in kind.columns.iter().filter(|c| c.formula.is_none()) {
                values.extend(column.converter.bind(entity, column)?);
            }
        }
        values.push(Value::I64(handle.borrow().meta().id()));
        self.conn.execute(&sql, &values).await?;
        Ok(())
    }

    /// Deletes a persisted entity and evicts it from the cache. The
    /// in-memory entity drops back to id 0; only re-insertion is legal
    /// afterwards.
    pub async fn delete(&mut self, handle: &Handle) -> Result<()> {
        let kind = Self::kind_of_handle(handle)?;
        let id = handle.borrow().meta().id();
        if id <= 0 {
            return Ok(());
        }
        let guard = self.conn.begin().await?;
        let result = self.delete_inner(&kind, handle, id).await;
        self.conn.finish(guard, result).await
    }

    async fn delete_inner(&mut self, kind: &Arc<Kind>, handle: &Handle, id: i64) -> Result<()> {
        handle.borrow_mut().on_delete()?;
        let sql = delete_sql(kind, self.schema());
        self.conn.execute(&sql, &[Value::I64(id)]).await?;
        self.unstash(handle);
        let mut borrowed = handle.borrow_mut();
        let parent = borrowed.meta().parent();
        let meta = borrowed.meta_mut();
        meta.initialize(&parent, kind.name(), 0);
        meta.set_populated(false);
        Ok(())
    }

    /// Rebinds each child's parent and persists it.
    pub async fn adopt(&mut self, parent: &Key, children: &[Handle]) -> Result<()> {
        for child in children {
            {
                let mut borrowed = child.borrow_mut();
                let meta = borrowed.meta_mut();
                let kind_name = meta
                    .kind_name()
                    .map(str::to_string)
                    .ok_or_else(|| Error::invalid_identifier("cannot adopt an entity with no kind"))?;
                let id = meta.id();
                meta.initialize(parent, &kind_name, id);
            }
            self.put(child).await?;
        }
        Ok(())
    }

    /// The entity's label: the label column's value when one is tagged,
    /// the key string otherwise.
    pub fn label(&self, handle: &Handle) -> String {
        if let Ok(kind) = Self::kind_of_handle(handle) {
            if let Some(column) = kind.label_col().and_then(|field| kind.column(field)) {
                let borrowed = handle.borrow();
                if let Ok(values) = column.converter.bind(&*borrowed, column) {
                    if let Some(value) = values.first() {
                        if !value.is_null() {
                            return value.to_string();
                        }
                    }
                }
            }
        }
        handle.borrow().meta().key().to_string()
    }

    /// Copies key, populated flag and (for matching concrete types) every
    /// column and transient field from `src` into `dst`.
    fn copy_into(src: &Handle, dst: &Handle) -> Result<()> {
        if Rc::ptr_eq(src, dst) {
            return Ok(());
        }
        let kind = Self::kind_of_handle(src)?;
        {
            let key = src.borrow().meta().key().clone();
            let populated = src.borrow().meta().populated();
            let mut borrowed = dst.borrow_mut();
            borrowed.meta_mut().set_key(key);
            borrowed.meta_mut().set_populated(populated);
        }
        let same_type = {
            let src_borrow = src.borrow();
            let dst_borrow = dst.borrow();
            let src_any: &dyn std::any::Any = src_borrow.as_any();
            let dst_any: &dyn std::any::Any = dst_borrow.as_any();
            src_any.type_id() == dst_any.type_id()
        };
        if !same_type {
            return Ok(());
        }
        let src_borrow = src.borrow();
        let mut dst_borrow = dst.borrow_mut();
        for column in kind.columns.iter().chain(kind.transient.iter()) {
            column
                .converter
                .copy_field(&*src_borrow, &mut *dst_borrow, column)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for EntityManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityManager")
            .field("schema", &self.schema())
            .field("conn", &self.conn)
            .finish()
    }
}

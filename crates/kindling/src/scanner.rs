use crate::EntityCache;

use kindling_core::{
    kind_named, ColumnScan, Entity, Error, Handle, Key, Kind, Query, QueryTable, Result, Value,
    ValueBag,
};

use std::cell::RefCell;
use std::sync::Arc;

/// One scanned result row: one entity per query table, in query order.
/// `None` marks an outer-join slot with no match.
pub type ResultRow = Vec<Option<Handle>>;

/// Consumes the columns belonging to one query table and rebuilds the
/// entity they describe.
struct EntityScanner {
    kind: Arc<Kind>,
    scans: Vec<ColumnScan>,
    synthetic: Vec<String>,
    scanned_kind: Option<Arc<Kind>>,
    parent: Key,
    id: i64,
    values: ValueBag,
}

impl EntityScanner {
    fn new(table: &QueryTable, synthetic: Vec<String>) -> EntityScanner {
        let mut scans = Vec::new();
        for column in &table.kind.columns {
            column.converter.scan_columns(column, &mut scans);
        }
        EntityScanner {
            kind: table.kind.clone(),
            scans,
            synthetic,
            scanned_kind: None,
            parent: Key::zero(),
            id: 0,
            values: ValueBag::new(),
        }
    }

    /// Consumes this scanner's prefix of the row: `_kind`, `_parent`,
    /// `_id`, the user columns, then the synthetic columns.
    fn consume(&mut self, row: &mut std::vec::IntoIter<Value>) -> Result<()> {
        let mut next = || {
            row.next()
                .ok_or_else(|| Error::sql("result row is narrower than the scanner set"))
        };

        self.scanned_kind = match next()? {
            Value::Str(name) if !name.is_empty() => {
                let kind = kind_named(&name)
                    .ok_or_else(|| Error::sql(format!("unknown kind '{name}'")))?;
                if !kind.derives_from(self.kind.name()) {
                    return Err(Error::type_mismatch(format!(
                        "kind '{}' does not derive from '{}'",
                        kind.name(),
                        self.kind.name()
                    )));
                }
                Some(kind)
            }
            _ => None,
        };

        self.parent = match next()? {
            Value::Str(chain) => Key::parse_array_literal(&chain)?,
            _ => Key::zero(),
        };

        self.id = match next()? {
            Value::Null => 0,
            value => value
                .as_i64()
                .ok_or_else(|| Error::sql(format!("expected an id, got {value:?}")))?,
        };

        for scan in &self.scans {
            match scan {
                ColumnScan::Basic { field } => {
                    let value = next()?;
                    self.values.insert(field.clone(), value);
                }
                ColumnScan::Reference { field, expects } => {
                    let kind_value = next()?;
                    let id_value = next()?;
                    let deposited = match kind_value {
                        Value::Str(name) if !name.is_empty() => {
                            let kind = kind_named(&name)
                                .ok_or_else(|| Error::sql(format!("unknown kind '{name}'")))?;
                            if !kind.derives_from(expects) {
                                return Err(Error::type_mismatch(format!(
                                    "kind '{}' does not derive from '{}'",
                                    kind.name(),
                                    expects
                                )));
                            }
                            let id = id_value.as_i64().unwrap_or(0);
                            Value::Entity(kind.make(&Key::zero(), id))
                        }
                        _ => Value::Null,
                    };
                    self.values.insert(field.clone(), deposited);
                }
            }
        }

        for name in &self.synthetic {
            let value = next()?;
            self.values.insert(name.clone(), value);
        }
        Ok(())
    }

    /// Materializes the consumed row: a placeholder when nothing was
    /// joined, otherwise a populated entity of the scanned (possibly
    /// derived) kind.
    fn build(&mut self, cache: &RefCell<EntityCache>) -> Result<Option<Handle>> {
        let Some(kind) = self.scanned_kind.take() else {
            self.values.clear();
            return Ok(None);
        };
        let handle = kind.make(&self.parent, self.id);
        populate(cache, &kind, &handle, &mut self.values)?;
        Ok(Some(handle))
    }
}

/// Routes a value bag into an entity: declared columns go through their
/// converters, transient fields coerce likewise, anything else becomes a
/// synthetic field. The populated entity is stashed.
pub(crate) fn populate(
    cache: &RefCell<EntityCache>,
    kind: &Kind,
    handle: &Handle,
    values: &mut ValueBag,
) -> Result<()> {
    {
        let mut borrowed = handle.borrow_mut();
        let entity: &mut dyn Entity = &mut *borrowed;
        for (name, value) in values.drain(..) {
            if let Some(column) = kind.column(&name) {
                if !value.is_null() {
                    column.converter.set_value(entity, column, value)?;
                }
            } else if let Some(transient) =
                kind.transient.iter().find(|t| t.field_name == name)
            {
                if !value.is_null() {
                    transient.converter.set_value(entity, transient, value)?;
                }
            } else {
                entity.meta_mut().set_synthetic_field(&name, value);
            }
        }
        entity.meta_mut().set_populated(true);
    }
    cache.borrow_mut().stash(handle.clone());
    Ok(())
}

/// The scanner pipeline for one query: one entity scanner per result
/// table, plus the reference wiring map.
pub struct ScannerSet {
    scanners: Vec<EntityScanner>,
    references: Vec<(String, usize)>,
}

impl ScannerSet {
    pub fn for_query(query: &Query) -> ScannerSet {
        let mut scanners = Vec::new();
        let mut references = Vec::new();
        match query.grouped_by() {
            Some(grouped) => {
                let mut synthetic: Vec<String> =
                    grouped.computed.iter().map(|c| c.name.clone()).collect();
                for table in query.aggregated_tables() {
                    for aggregate in &table.aggregates {
                        synthetic.push(aggregate.name.clone());
                    }
                }
                collect_query_synthetics(query, &mut synthetic);
                scanners.push(EntityScanner::new(grouped, synthetic));
            }
            None => {
                let mut synthetic: Vec<String> =
                    query.table.computed.iter().map(|c| c.name.clone()).collect();
                collect_query_synthetics(query, &mut synthetic);
                scanners.push(EntityScanner::new(&query.table, synthetic));
                for join in query.active_joins() {
                    let synthetic = join.table.computed.iter().map(|c| c.name.clone()).collect();
                    scanners.push(EntityScanner::new(&join.table, synthetic));
                    if join.reference {
                        references.push((join.field_name.clone(), scanners.len() - 1));
                    }
                }
            }
        }
        ScannerSet {
            scanners,
            references,
        }
    }

    /// Consumes one raw row, builds one entity per scanner and wires
    /// reference fields to their joined entities.
    pub fn scan_row(&mut self, raw: Vec<Value>, cache: &RefCell<EntityCache>) -> Result<ResultRow> {
        let mut iter = raw.into_iter();
        for scanner in &mut self.scanners {
            scanner.consume(&mut iter)?;
        }
        if iter.next().is_some() {
            return Err(Error::sql("result row is wider than the scanner set"));
        }

        let mut row = Vec::with_capacity(self.scanners.len());
        for scanner in &mut self.scanners {
            row.push(scanner.build(cache)?);
        }

        if let Some(root) = row[0].clone() {
            let root_kind = root
                .borrow()
                .meta()
                .kind_name()
                .and_then(kind_named);
            if let Some(root_kind) = root_kind {
                for (field_name, index) in &self.references {
                    let Some(joined) = row[*index].clone() else {
                        continue;
                    };
                    if let Some(column) = root_kind.column(field_name) {
                        let mut borrowed = root.borrow_mut();
                        column
                            .converter
                            .set_reference(&mut *borrowed, column, Some(joined))?;
                    }
                }
            }
        }
        Ok(row)
    }
}

fn collect_query_synthetics(query: &Query, synthetic: &mut Vec<String>) {
    for sub_query in &query.sub_queries {
        for sub_select in &sub_query.sub_selects {
            synthetic.push(sub_select.name.clone());
        }
    }
    for computed in &query.global_computed {
        synthetic.push(computed.name.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use kindling_core::{
        cast_ref, kind_of, Aggregate, Computed, EntityMeta, ErrorKind, Join, JoinDirection,
        JoinType, KindBuilder, Persist, Ref,
    };

    #[derive(Default)]
    struct Product {
        meta: EntityMeta,
        name: String,
        category: String,
        price: f64,
        total_quantity: i32,
    }

    kindling_core::impl_entity!(Product { meta: meta });

    impl Persist for Product {
        fn kind_name() -> String {
            "demo.product".to_string()
        }

        fn describe(b: &mut KindBuilder<Self>) {
            b.field("Name", |e: &Product| &e.name, |e: &mut Product| &mut e.name)
                .tags("label");
            b.field(
                "Category",
                |e: &Product| &e.category,
                |e: &mut Product| &mut e.category,
            );
            b.field("Price", |e: &Product| &e.price, |e: &mut Product| &mut e.price);
            b.transient(
                "TotalQuantity",
                |e: &Product| &e.total_quantity,
                |e: &mut Product| &mut e.total_quantity,
            );
        }
    }

    #[derive(Default)]
    struct Fruit {
        product: Product,
        color: String,
    }

    kindling_core::impl_entity!(Fruit { base: product });

    impl Persist for Fruit {
        fn kind_name() -> String {
            "demo.fruit".to_string()
        }

        fn describe(b: &mut KindBuilder<Self>) {
            b.base::<Product>();
            b.field("Color", |e: &Fruit| &e.color, |e: &mut Fruit| &mut e.color);
        }
    }

    #[derive(Default)]
    struct Sale {
        meta: EntityMeta,
        quantity: i32,
        product: Ref<Product>,
    }

    kindling_core::impl_entity!(Sale { meta: meta });

    impl Persist for Sale {
        fn kind_name() -> String {
            "demo.sale".to_string()
        }

        fn describe(b: &mut KindBuilder<Self>) {
            b.field(
                "Quantity",
                |e: &Sale| &e.quantity,
                |e: &mut Sale| &mut e.quantity,
            );
            b.reference(
                "Product",
                |e: &Sale| &e.product,
                |e: &mut Sale| &mut e.product,
            );
        }
    }

    fn cache() -> RefCell<EntityCache> {
        RefCell::new(EntityCache::new())
    }

    #[test]
    fn scans_a_plain_row() {
        let query = Query::new(kind_of::<Product>(), "grumble");
        let mut set = ScannerSet::for_query(&query);
        let cache = cache();
        let row = set
            .scan_row(
                vec![
                    Value::Str("demo.product".into()),
                    Value::Str("{}".into()),
                    Value::I32(1),
                    Value::Str("Squash".into()),
                    Value::Str("Vegetable".into()),
                    Value::F64(1.25),
                ],
                &cache,
            )
            .unwrap();
        assert_eq!(row.len(), 1);
        let entity = row[0].clone().unwrap();
        let entity = entity.borrow();
        assert!(entity.meta().populated());
        assert_eq!(entity.meta().id(), 1);
        let product = cast_ref::<Product>(&*entity).unwrap();
        assert_eq!(product.name, "Squash");
        assert_eq!(product.price, 1.25);
        // Built entities land in the cache.
        assert!(cache.borrow().has("demo.product", 1));
    }

    #[test]
    fn derived_rows_materialize_as_the_derived_kind() {
        kind_of::<Fruit>();
        let mut query = Query::new(kind_of::<Product>(), "grumble");
        query.with_derived(true);
        let mut set = ScannerSet::for_query(&query);
        let cache = cache();
        let row = set
            .scan_row(
                vec![
                    Value::Str("demo.fruit".into()),
                    Value::Str("{}".into()),
                    Value::I32(3),
                    Value::Str("Apple".into()),
                    Value::Str("Fruit".into()),
                    Value::F64(0.69),
                ],
                &cache,
            )
            .unwrap();
        let entity = row[0].clone().unwrap();
        let entity = entity.borrow();
        let fruit = cast_ref::<Fruit>(&*entity).unwrap();
        assert_eq!(fruit.product.name, "Apple");
        // Narrowing to the base still works.
        assert_eq!(cast_ref::<Product>(&*entity).unwrap().category, "Fruit");
    }

    #[test]
    fn rejects_a_kind_outside_the_hierarchy() {
        kind_of::<Sale>();
        let query = Query::new(kind_of::<Product>(), "grumble");
        let mut set = ScannerSet::for_query(&query);
        let result = set.scan_row(
            vec![
                Value::Str("demo.sale".into()),
                Value::Str("{}".into()),
                Value::I32(3),
                Value::Str("x".into()),
                Value::Str("y".into()),
                Value::F64(0.0),
            ],
            &cache(),
        );
        let err = match result {
            Ok(_) => panic!("expected an error"),
            Err(e) => e,
        };
        assert_eq!(err.kind(), ErrorKind::TypeMismatch);
    }

    #[test]
    fn wires_reference_joins() {
        kind_of::<Fruit>();
        let mut query = Query::new(kind_of::<Sale>(), "grumble");
        query.add_reference_joins();
        let mut set = ScannerSet::for_query(&query);
        let row = set
            .scan_row(
                vec![
                    // Sale: _kind, _parent, _id, Quantity, Product.kind, Product.id
                    Value::Str("demo.sale".into()),
                    Value::Str("{}".into()),
                    Value::I32(1),
                    Value::I32(12),
                    Value::Str("demo.fruit".into()),
                    Value::I64(3),
                    // Joined product (a fruit)
                    Value::Str("demo.fruit".into()),
                    Value::Str("{}".into()),
                    Value::I32(3),
                    Value::Str("Apple".into()),
                    Value::Str("Fruit".into()),
                    Value::F64(0.69),
                ],
                &cache(),
            )
            .unwrap();
        assert_eq!(row.len(), 2);
        let sale_handle = row[0].clone().unwrap();
        let sale = sale_handle.borrow();
        let sale = cast_ref::<Sale>(&*sale).unwrap();
        assert_eq!(sale.quantity, 12);
        assert!(!sale.product.is_null());
        assert_eq!(sale.product.id(), 3);
        assert_eq!(sale.product.key().kind(), Some("demo.fruit"));
        // The wired entity is the joined one, fully populated and derived.
        assert_eq!(
            sale.product.with(|p| p.name.clone()).unwrap(),
            "Apple"
        );
    }

    #[test]
    fn outer_join_without_match_yields_a_placeholder() {
        kind_of::<Fruit>();
        let mut query = Query::new(kind_of::<Product>(), "grumble");
        let mut join = Join::new(kind_of::<Sale>(), "Product");
        join.direction = JoinDirection::ReferredBy;
        join.join_type = JoinType::Left;
        query.add_join(join);
        let mut set = ScannerSet::for_query(&query);
        let row = set
            .scan_row(
                vec![
                    Value::Str("demo.product".into()),
                    Value::Str("{}".into()),
                    Value::I32(1),
                    Value::Str("Squash".into()),
                    Value::Str("Vegetable".into()),
                    Value::F64(1.25),
                    // No joined sale.
                    Value::Null,
                    Value::Null,
                    Value::Null,
                    Value::Null,
                    Value::Null,
                    Value::Null,
                ],
                &cache(),
            )
            .unwrap();
        assert_eq!(row.len(), 2);
        assert!(row[0].is_some());
        assert!(row[1].is_none());
    }

    #[test]
    fn grouped_rows_scan_synthetics_into_transients() {
        kind_of::<Fruit>();
        let mut query = Query::new(kind_of::<Product>(), "grumble");
        query.with_derived(true);
        query.table.group_by = true;
        let mut join = Join::new(kind_of::<Sale>(), "Product");
        join.direction = JoinDirection::ReferredBy;
        join.join_type = JoinType::Left;
        join.table.add_aggregate(Aggregate {
            function: "SUM".to_string(),
            column: "Quantity".to_string(),
            name: "TotalQuantity".to_string(),
            default: Some("0".to_string()),
        });
        query.add_join(join);

        let mut set = ScannerSet::for_query(&query);
        let row = set
            .scan_row(
                vec![
                    Value::Str("demo.fruit".into()),
                    Value::Str("{}".into()),
                    Value::I32(3),
                    Value::Str("Apple".into()),
                    Value::Str("Fruit".into()),
                    Value::F64(0.69),
                    Value::I64(25),
                ],
                &cache(),
            )
            .unwrap();
        // Grouped queries produce a single scanner.
        assert_eq!(row.len(), 1);
        let entity = row[0].clone().unwrap();
        let entity = entity.borrow();
        let product = cast_ref::<Product>(&*entity).unwrap();
        assert_eq!(product.total_quantity, 25);
    }

    #[test]
    fn unmatched_synthetic_names_land_on_the_meta() {
        let mut query = Query::new(kind_of::<Product>(), "grumble");
        query.add_global_computed_column(Computed {
            formula: "1 + 1".to_string(),
            name: "Extra".to_string(),
        });
        let mut set = ScannerSet::for_query(&query);
        let row = set
            .scan_row(
                vec![
                    Value::Str("demo.product".into()),
                    Value::Str("{}".into()),
                    Value::I32(1),
                    Value::Str("Squash".into()),
                    Value::Str("Vegetable".into()),
                    Value::F64(1.25),
                    Value::I32(2),
                ],
                &cache(),
            )
            .unwrap();
        let entity = row[0].clone().unwrap();
        let entity = entity.borrow();
        assert_eq!(
            entity.meta().synthetic_field("Extra"),
            Some(&Value::I32(2))
        );
    }
}

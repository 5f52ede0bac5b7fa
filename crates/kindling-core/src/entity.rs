use crate::kind::Persist;
use crate::value::ValueBag;
use crate::{registry, Error, Key, Result, Value};

use std::any::Any;
use std::cell::RefCell;
use std::marker::PhantomData;
use std::rc::Rc;

/// A shared, session-local entity handle. Query results, the entity cache
/// and reference fields all hand out clones of the same handle, so an
/// entity loaded twice within one manager is the same object.
pub type Handle = Rc<RefCell<dyn Entity>>;

/// Per-entity bookkeeping: the identifying key, the populated flag and any
/// synthetic fields carried along with query results.
#[derive(Debug, Clone, Default)]
pub struct EntityMeta {
    key: Key,
    populated: bool,
    synthetic: ValueBag,
}

impl EntityMeta {
    pub fn key(&self) -> &Key {
        &self.key
    }

    pub fn set_key(&mut self, key: Key) {
        self.key = key;
    }

    /// Binds the entity to `(kind, id)` under `parent`.
    pub fn initialize(&mut self, parent: &Key, kind: &str, id: i64) {
        self.key = Key::new(parent, kind, id);
    }

    pub fn id(&self) -> i64 {
        self.key.id()
    }

    pub fn parent(&self) -> Key {
        self.key.parent()
    }

    pub fn kind_name(&self) -> Option<&str> {
        self.key.kind()
    }

    pub fn populated(&self) -> bool {
        self.populated
    }

    pub fn set_populated(&mut self, populated: bool) {
        self.populated = populated;
    }

    pub fn synthetic_field(&self, name: &str) -> Option<&Value> {
        self.synthetic.get(name)
    }

    pub fn set_synthetic_field(&mut self, name: &str, value: Value) {
        self.synthetic.insert(name.to_string(), value);
    }

    pub fn synthetic_fields(&self) -> &ValueBag {
        &self.synthetic
    }
}

/// The in-memory entity contract.
///
/// Concrete types hold an [`EntityMeta`] (directly, or through their base
/// type) and report their base link for single inheritance. Lifecycle hooks
/// default to no-ops; implementations override the ones they care about.
pub trait Entity: Any {
    fn meta(&self) -> &EntityMeta;
    fn meta_mut(&mut self) -> &mut EntityMeta;

    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;

    /// The embedded base entity, when this type derives from another kind.
    fn base(&self) -> Option<&dyn Entity> {
        None
    }

    fn base_mut(&mut self) -> Option<&mut dyn Entity> {
        None
    }

    fn on_get(&mut self) -> Result<()> {
        Ok(())
    }

    fn on_put(&mut self) -> Result<()> {
        Ok(())
    }

    fn after_put(&mut self) -> Result<()> {
        Ok(())
    }

    fn on_insert(&mut self) -> Result<()> {
        Ok(())
    }

    fn after_insert(&mut self) -> Result<()> {
        Ok(())
    }

    fn on_delete(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Narrows an entity to `T` by walking the embedded-base chain.
pub fn cast_ref<T: Any>(mut entity: &dyn Entity) -> Option<&T> {
    loop {
        if let Some(hit) = entity.as_any().downcast_ref::<T>() {
            return Some(hit);
        }
        entity = entity.base()?;
    }
}

pub fn cast_mut<T: Any>(mut entity: &mut dyn Entity) -> Option<&mut T> {
    loop {
        // Two-phase probe keeps the borrow checker satisfied.
        if entity.as_any().downcast_ref::<T>().is_some() {
            return entity.as_any_mut().downcast_mut::<T>();
        }
        entity = entity.base_mut()?;
    }
}

/// A reference field: the referenced entity's key, plus the resolved entity
/// once a query has wired it up. The resolved entity's kind may derive from
/// `T`.
pub struct Ref<T: Persist> {
    key: Key,
    target: Option<Handle>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Persist> Default for Ref<T> {
    fn default() -> Self {
        Ref::null()
    }
}

impl<T: Persist> Clone for Ref<T> {
    fn clone(&self) -> Self {
        Ref {
            key: self.key.clone(),
            target: self.target.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T: Persist> std::fmt::Debug for Ref<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Ref({})", self.key)
    }
}

impl<T: Persist> Ref<T> {
    pub fn null() -> Self {
        Ref {
            key: Key::zero(),
            target: None,
            _marker: PhantomData,
        }
    }

    /// A reference by key only, with no resolved entity.
    pub fn to_key(key: Key) -> Self {
        Ref {
            key,
            target: None,
            _marker: PhantomData,
        }
    }

    /// A resolved reference. Fails if the entity's kind does not derive from
    /// `T`'s kind.
    pub fn to(handle: Handle) -> Result<Self> {
        let expected = registry::kind_of::<T>();
        let key = handle.borrow().meta().key().clone();
        let kind_name = key
            .kind()
            .ok_or_else(|| Error::invalid_identifier("reference target has no kind"))?
            .to_string();
        let kind = registry::kind_named(&kind_name).ok_or_else(|| {
            Error::type_mismatch(format!("kind '{kind_name}' is not registered"))
        })?;
        if !kind.derives_from(expected.name()) {
            return Err(Error::type_mismatch(format!(
                "kind '{}' does not derive from '{}'",
                kind.name(),
                expected.name()
            )));
        }
        Ok(Ref {
            key,
            target: Some(handle),
            _marker: PhantomData,
        })
    }

    pub fn is_null(&self) -> bool {
        self.key.is_zero()
    }

    pub fn key(&self) -> &Key {
        &self.key
    }

    pub fn id(&self) -> i64 {
        self.key.id()
    }

    pub fn handle(&self) -> Option<Handle> {
        self.target.clone()
    }

    /// Runs `f` against the target narrowed to `T`, if resolved.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        let handle = self.target.as_ref()?;
        let borrowed = handle.borrow();
        let narrowed = cast_ref::<T>(&*borrowed)?;
        Some(f(narrowed))
    }

    pub fn with_mut<R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let handle = self.target.as_ref()?;
        let mut borrowed = handle.borrow_mut();
        let narrowed = cast_mut::<T>(&mut *borrowed)?;
        Some(f(narrowed))
    }

    pub(crate) fn assign(&mut self, target: Option<Handle>) {
        match target {
            Some(handle) => {
                self.key = handle.borrow().meta().key().clone();
                self.target = Some(handle);
            }
            None => {
                self.key = Key::zero();
                self.target = None;
            }
        }
    }
}

/// Implements [`Entity`] for a concrete type.
///
/// `impl_entity!(Product { meta: meta })` wires the metadata accessors for a
/// root kind; `impl_entity!(Fruit { base: product })` delegates metadata to
/// the embedded base and reports the base link. Types that override
/// lifecycle hooks implement the trait by hand instead.
#[macro_export]
macro_rules! impl_entity {
    ($ty:ty { meta: $meta:ident }) => {
        impl $crate::Entity for $ty {
            fn meta(&self) -> &$crate::EntityMeta {
                &self.$meta
            }

            fn meta_mut(&mut self) -> &mut $crate::EntityMeta {
                &mut self.$meta
            }

            fn as_any(&self) -> &dyn ::std::any::Any {
                self
            }

            fn as_any_mut(&mut self) -> &mut dyn ::std::any::Any {
                self
            }
        }
    };
    ($ty:ty { base: $base:ident }) => {
        impl $crate::Entity for $ty {
            fn meta(&self) -> &$crate::EntityMeta {
                $crate::Entity::meta(&self.$base)
            }

            fn meta_mut(&mut self) -> &mut $crate::EntityMeta {
                $crate::Entity::meta_mut(&mut self.$base)
            }

            fn as_any(&self) -> &dyn ::std::any::Any {
                self
            }

            fn as_any_mut(&mut self) -> &mut dyn ::std::any::Any {
                self
            }

            fn base(&self) -> Option<&dyn $crate::Entity> {
                Some(&self.$base)
            }

            fn base_mut(&mut self) -> Option<&mut dyn $crate::Entity> {
                Some(&mut self.$base)
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{KindBuilder, Value};

    #[derive(Default)]
    struct Node {
        meta: EntityMeta,
        tag: String,
    }

    crate::impl_entity!(Node { meta: meta });

    impl Persist for Node {
        fn kind_name() -> String {
            "edemo.node".to_string()
        }

        fn describe(b: &mut KindBuilder<Self>) {
            b.field("Tag", |e: &Node| &e.tag, |e: &mut Node| &mut e.tag);
        }
    }

    #[derive(Default)]
    struct Leaf {
        node: Node,
        depth: i32,
    }

    crate::impl_entity!(Leaf { base: node });

    impl Persist for Leaf {
        fn kind_name() -> String {
            "edemo.leaf".to_string()
        }

        fn describe(b: &mut KindBuilder<Self>) {
            b.base::<Node>();
            b.field("Depth", |e: &Leaf| &e.depth, |e: &mut Leaf| &mut e.depth);
        }
    }

    #[test]
    fn meta_delegates_to_the_base() {
        let mut leaf = Leaf::default();
        leaf.meta_mut()
            .initialize(&Key::zero(), "edemo.leaf", 4);
        assert_eq!(leaf.meta().id(), 4);
        assert_eq!(leaf.node.meta().id(), 4);
        assert!(leaf.base().is_some());
        assert!(Node::default().base().is_none());
    }

    #[test]
    fn synthetic_fields_round_trip() {
        let mut node = Node::default();
        assert!(node.meta().synthetic_field("Extra").is_none());
        node.meta_mut()
            .set_synthetic_field("Extra", Value::I64(9));
        assert_eq!(
            node.meta().synthetic_field("Extra"),
            Some(&Value::I64(9))
        );
        assert_eq!(node.meta().synthetic_fields().len(), 1);
    }

    #[test]
    fn ref_narrowing_and_nulls() {
        let null: Ref<Node> = Ref::null();
        assert!(null.is_null());
        assert_eq!(null.id(), 0);
        assert!(null.with(|_: &Node| ()).is_none());

        let kind = crate::registry::kind_of::<Leaf>();
        let handle = kind.make(&Key::zero(), 7);
        handle
            .borrow_mut()
            .as_any_mut()
            .downcast_mut::<Leaf>()
            .unwrap()
            .node
            .tag = "green".to_string();

        // A Ref<Node> happily points at a Leaf.
        let reference = Ref::<Node>::to(handle).unwrap();
        assert!(!reference.is_null());
        assert_eq!(reference.id(), 7);
        assert_eq!(reference.key().kind(), Some("edemo.leaf"));
        assert_eq!(reference.with(|n| n.tag.clone()).unwrap(), "green");
    }

    #[test]
    fn ref_rejects_unrelated_kinds() {
        crate::registry::kind_of::<Node>();
        let leaf_kind = crate::registry::kind_of::<Leaf>();
        let leaf = leaf_kind.make(&Key::zero(), 1);
        // Leaf derives from Node, but Node does not derive from Leaf.
        let node = crate::registry::kind_of::<Node>().make(&Key::zero(), 2);
        assert!(Ref::<Node>::to(leaf).is_ok());
        assert!(Ref::<Leaf>::to(node).is_err());
    }

    #[test]
    fn cast_walks_the_chain() {
        let kind = crate::registry::kind_of::<Leaf>();
        let handle = kind.make(&Key::zero(), 1);
        let mut borrowed = handle.borrow_mut();
        assert!(cast_ref::<Leaf>(&*borrowed).is_some());
        assert!(cast_ref::<Node>(&*borrowed).is_some());
        cast_mut::<Node>(&mut *borrowed).unwrap().tag = "t".to_string();
        assert_eq!(cast_ref::<Leaf>(&*borrowed).unwrap().node.tag, "t");
    }
}

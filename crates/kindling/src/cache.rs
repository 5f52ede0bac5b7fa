use kindling_core::Handle;

use std::collections::HashMap;

/// Per-manager entity cache keyed on `(kind, id)`.
///
/// A stashed entity is handed back on repeat gets until it is deleted or
/// unstashed, so one manager sees one handle per row.
#[derive(Default)]
pub struct EntityCache {
    map: HashMap<(String, i64), Handle>,
}

impl EntityCache {
    pub fn new() -> EntityCache {
        EntityCache::default()
    }

    fn key_of(handle: &Handle) -> Option<(String, i64)> {
        let entity = handle.borrow();
        let meta = entity.meta();
        let kind = meta.kind_name()?.to_string();
        if meta.id() <= 0 {
            return None;
        }
        Some((kind, meta.id()))
    }

    pub fn stash(&mut self, handle: Handle) {
        if let Some(key) = Self::key_of(&handle) {
            self.map.insert(key, handle);
        }
    }

    pub fn get(&self, kind_name: &str, id: i64) -> Option<Handle> {
        self.map.get(&(kind_name.to_string(), id)).cloned()
    }

    pub fn has(&self, kind_name: &str, id: i64) -> bool {
        self.map.contains_key(&(kind_name.to_string(), id))
    }

    pub fn evict(&mut self, handle: &Handle) {
        if let Some(key) = Self::key_of(handle) {
            self.map.remove(&key);
        }
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use kindling_core::{kind_of, EntityMeta, Key, KindBuilder, Persist};

    #[derive(Default)]
    struct Token {
        meta: EntityMeta,
        word: String,
    }

    kindling_core::impl_entity!(Token { meta: meta });

    impl Persist for Token {
        fn kind_name() -> String {
            "cdemo.token".to_string()
        }

        fn describe(b: &mut KindBuilder<Self>) {
            b.field("Word", |e: &Token| &e.word, |e: &mut Token| &mut e.word);
        }
    }

    #[test]
    fn stash_and_evict() {
        let kind = kind_of::<Token>();
        let mut cache = EntityCache::new();
        let handle = kind.make(&Key::zero(), 5);
        cache.stash(handle.clone());
        assert!(cache.has("cdemo.token", 5));
        let hit = cache.get("cdemo.token", 5).unwrap();
        assert!(std::rc::Rc::ptr_eq(&handle, &hit));
        assert!(cache.get("cdemo.token", 6).is_none());
        cache.evict(&handle);
        assert!(!cache.has("cdemo.token", 5));
    }

    #[test]
    fn unsaved_entities_are_not_cached() {
        let kind = kind_of::<Token>();
        let mut cache = EntityCache::new();
        cache.stash(kind.make(&Key::zero(), 0));
        assert!(!cache.has("cdemo.token", 0));
    }
}

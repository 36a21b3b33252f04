use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    io,
};

use bytes::Bytes;

use super::{ListableStore, ReadableStore, Store, WriteableStore};
use crate::keys::ObjectKey;

/// Ephemeral in-memory backend, mainly for tests and staging.
#[derive(Default)]
pub struct MemoryStore {
    // this locks the whole map for access to a single key
    map: RefCell<HashMap<ObjectKey, Bytes>>,
    readonly: Cell<bool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flip the readonly flag, e.g. to freeze a populated store.
    pub fn set_readonly(&self, readonly: bool) {
        self.readonly.set(readonly);
    }
}

impl Store for MemoryStore {
    fn is_readonly(&self) -> bool {
        self.readonly.get()
    }
}

impl ReadableStore for MemoryStore {
    fn get(&self, key: &ObjectKey) -> io::Result<Option<Bytes>> {
        let map = self.map.borrow();
        Ok(map.get(key).cloned())
    }

    fn has_key(&self, key: &ObjectKey) -> io::Result<bool> {
        let map = self.map.borrow();
        Ok(map.contains_key(key))
    }
}

impl ListableStore for MemoryStore {
    fn list_prefix(&self, prefix: &ObjectKey) -> io::Result<Vec<ObjectKey>> {
        let map = self.map.borrow();
        Ok(map
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

impl WriteableStore for MemoryStore {
    fn set(&self, key: &ObjectKey, value: Bytes) -> io::Result<()> {
        let mut map = self.map.borrow_mut();
        map.insert(key.clone(), value);
        Ok(())
    }

    fn erase(&self, key: &ObjectKey) -> io::Result<bool> {
        let mut map = self.map.borrow_mut();
        map.remove(key);
        Ok(false)
    }

    fn erase_prefix(&self, key_prefix: &ObjectKey) -> io::Result<bool> {
        let mut map = self.map.borrow_mut();
        map.retain(|k, _v| !k.starts_with(key_prefix));
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_get_erase() {
        let store = MemoryStore::new();
        let key = ObjectKey::tensor_meta("t");

        assert!(store.get(&key).unwrap().is_none());
        store.set(&key, Bytes::from_static(b"abc")).unwrap();
        assert_eq!(store.get(&key).unwrap().unwrap().as_ref(), b"abc");
        assert!(store.has_key(&key).unwrap());

        store.erase(&key).unwrap();
        assert!(!store.has_key(&key).unwrap());
    }

    #[test]
    fn list_and_erase_prefix() {
        let store = MemoryStore::new();
        store
            .set(&ObjectKey::tensor_meta("a"), Bytes::from_static(b"1"))
            .unwrap();
        store
            .set(&ObjectKey::chunk("a", "00"), Bytes::from_static(b"2"))
            .unwrap();
        store
            .set(&ObjectKey::tensor_meta("b"), Bytes::from_static(b"3"))
            .unwrap();

        let listed = store.list_prefix(&ObjectKey::tensor_prefix("a")).unwrap();
        assert_eq!(listed.len(), 2);

        store.erase_prefix(&ObjectKey::tensor_prefix("a")).unwrap();
        assert!(store
            .list_prefix(&ObjectKey::tensor_prefix("a"))
            .unwrap()
            .is_empty());
        assert!(store.has_key(&ObjectKey::tensor_meta("b")).unwrap());
    }
}

use std::io;

use bytes::Bytes;

mod memory;
pub use memory::MemoryStore;

#[cfg(feature = "filesystem")]
pub mod filesystem;
#[cfg(feature = "filesystem")]
pub use filesystem::FileSystemStore;

use crate::keys::ObjectKey;

/// Marker for keyed byte backends.
pub trait Store {
    /// Whether mutation should be rejected up front.
    fn is_readonly(&self) -> bool {
        false
    }
}

pub trait ReadableStore: Store {
    /// Get the full contents of the key, if present.
    fn get(&self, key: &ObjectKey) -> io::Result<Option<Bytes>>;

    fn has_key(&self, key: &ObjectKey) -> io::Result<bool> {
        self.get(key).map(|o| o.is_some())
    }
}

pub trait ListableStore: Store {
    /// Retrieve all keys with a given prefix.
    fn list_prefix(&self, prefix: &ObjectKey) -> io::Result<Vec<ObjectKey>>;
}

pub trait WriteableStore: ReadableStore + ListableStore {
    /// Write the contents of a key's entire value.
    fn set(&self, key: &ObjectKey, value: Bytes) -> io::Result<()>;

    /// Delete an object at a given key.
    ///
    /// Returns whether the key exists at the end of the operation.
    fn erase(&self, key: &ObjectKey) -> io::Result<bool>;

    /// Delete all objects whose keys start with the given key.
    ///
    /// The trait's default implementation may be inefficient.
    fn erase_prefix(&self, key_prefix: &ObjectKey) -> io::Result<bool> {
        for key in self.list_prefix(key_prefix)? {
            self.erase(&key)?;
        }
        Ok(false)
    }
}

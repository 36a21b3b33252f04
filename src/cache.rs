use std::{
    cell::{Cell, RefCell},
    collections::{HashMap, HashSet},
    rc::Rc,
};

use bytes::Bytes;

use crate::{
    chunk::Chunk,
    encode::chunk_id::ChunkIdEncoder,
    error::{Result, TensorError},
    keys::ObjectKey,
    meta::TensorMeta,
    store::{ReadableStore, WriteableStore},
};

pub const DEFAULT_CACHE_CAPACITY: usize = 256 * 1024 * 1024;

/// The closed set of object types the cache holds in deserialized form.
///
/// Chunks are shared out as `Rc<RefCell<_>>` handles so the engine can
/// mutate them in place; a live handle pins its entry against eviction.
#[derive(Clone)]
pub enum CacheValue {
    Meta(TensorMeta),
    ChunkIds(ChunkIdEncoder),
    Chunk(Rc<RefCell<Chunk>>),
}

impl CacheValue {
    fn to_bytes(&self) -> Result<Bytes> {
        match self {
            Self::Meta(meta) => Ok(meta.to_bytes()?.into()),
            Self::ChunkIds(enc) => {
                let mut buf = Vec::with_capacity(enc.nbytes());
                enc.write(&mut buf)?;
                Ok(buf.into())
            }
            Self::Chunk(chunk) => {
                let chunk = chunk.borrow();
                let mut buf = Vec::with_capacity(chunk.nbytes() as usize);
                chunk.write(&mut buf)?;
                Ok(buf.into())
            }
        }
    }

    fn nbytes(&self) -> usize {
        match self {
            Self::Meta(meta) => meta.nbytes(),
            Self::ChunkIds(enc) => enc.nbytes(),
            Self::Chunk(chunk) => chunk.borrow().nbytes() as usize,
        }
    }
}

struct Slot {
    value: CacheValue,
    /// Size at the time the slot was last accounted.
    nbytes: usize,
}

/// Write-through LRU cache between the engine and a backing store.
///
/// Values stay deserialized while resident; dirty entries are serialized
/// out on [ChunkCache::flush] (metadata blobs before chunk blobs, so a
/// crash mid-flush can only leave metadata describing a missing sample,
/// never unindexed data) or when evicted to make room.
pub struct ChunkCache<S> {
    store: S,
    capacity: usize,
    autoflush: Cell<bool>,
    slots: RefCell<HashMap<ObjectKey, Slot>>,
    lru: RefCell<Vec<ObjectKey>>,
    dirty: RefCell<HashSet<ObjectKey>>,
    used: Cell<usize>,
}

impl<S: WriteableStore> ChunkCache<S> {
    pub fn new(store: S) -> Self {
        Self::with_capacity(store, DEFAULT_CACHE_CAPACITY)
    }

    pub fn with_capacity(store: S, capacity: usize) -> Self {
        Self {
            store,
            capacity,
            autoflush: Cell::new(true),
            slots: RefCell::new(HashMap::new()),
            lru: RefCell::new(Vec::new()),
            dirty: RefCell::new(HashSet::new()),
            used: Cell::new(0),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Tear down the cache, dropping unflushed state, and hand back the
    /// store. Call [ChunkCache::flush] first to keep dirty entries.
    pub fn into_store(self) -> S {
        self.store
    }

    /// Bytes of deserialized state currently resident.
    pub fn used(&self) -> usize {
        self.used.get()
    }

    pub fn autoflush(&self) -> bool {
        self.autoflush.get()
    }

    /// Disable to batch many mutations between explicit flushes.
    pub fn set_autoflush(&self, autoflush: bool) {
        self.autoflush.set(autoflush);
    }

    pub fn check_readonly(&self) -> Result<()> {
        if self.store.is_readonly() {
            return Err(TensorError::ReadOnly);
        }
        Ok(())
    }

    /// Whether the key is resident or present in the backing store.
    pub fn exists(&self, key: &ObjectKey) -> Result<bool> {
        if self.slots.borrow().contains_key(key) {
            return Ok(true);
        }
        Ok(self.store.has_key(key)?)
    }

    pub fn get_meta(&self, key: &ObjectKey) -> Result<Option<TensorMeta>> {
        if let Some(slot) = self.slots.borrow().get(key) {
            return match &slot.value {
                CacheValue::Meta(meta) => {
                    self.touch(key);
                    Ok(Some(meta.clone()))
                }
                _ => Err(variant_mismatch(key)),
            };
        }
        match self.store.get(key)? {
            Some(bytes) => {
                let meta = TensorMeta::from_bytes(&bytes)
                    .map_err(|e| decode_failure(key, &e.to_string()))?;
                self.insert_clean(key.clone(), CacheValue::Meta(meta.clone()))?;
                Ok(Some(meta))
            }
            None => Ok(None),
        }
    }

    pub fn get_chunk_ids(&self, key: &ObjectKey) -> Result<Option<ChunkIdEncoder>> {
        if let Some(slot) = self.slots.borrow().get(key) {
            return match &slot.value {
                CacheValue::ChunkIds(enc) => {
                    self.touch(key);
                    Ok(Some(enc.clone()))
                }
                _ => Err(variant_mismatch(key)),
            };
        }
        match self.store.get(key)? {
            Some(bytes) => {
                let enc = ChunkIdEncoder::from_reader(&mut bytes.as_ref())
                    .map_err(|e| decode_failure(key, &e.to_string()))?;
                self.insert_clean(key.clone(), CacheValue::ChunkIds(enc.clone()))?;
                Ok(Some(enc))
            }
            None => Ok(None),
        }
    }

    /// Get a live handle to a chunk, deserializing it from the store on a
    /// cache miss. The handle keeps the entry resident until dropped.
    pub fn get_chunk(&self, key: &ObjectKey) -> Result<Option<Rc<RefCell<Chunk>>>> {
        if let Some(slot) = self.slots.borrow().get(key) {
            return match &slot.value {
                CacheValue::Chunk(chunk) => {
                    self.touch(key);
                    Ok(Some(chunk.clone()))
                }
                _ => Err(variant_mismatch(key)),
            };
        }
        match self.store.get(key)? {
            Some(bytes) => {
                let chunk = Chunk::from_reader(&mut bytes.as_ref())
                    .map_err(|e| decode_failure(key, &e.to_string()))?;
                let handle = Rc::new(RefCell::new(chunk));
                self.insert_clean(key.clone(), CacheValue::Chunk(handle.clone()))?;
                Ok(Some(handle))
            }
            None => Ok(None),
        }
    }

    /// Insert or replace a value, marking it dirty.
    pub fn insert(&self, key: ObjectKey, value: CacheValue) -> Result<()> {
        self.dirty.borrow_mut().insert(key.clone());
        self.insert_slot(key, value)
    }

    fn insert_clean(&self, key: ObjectKey, value: CacheValue) -> Result<()> {
        self.insert_slot(key, value)
    }

    fn insert_slot(&self, key: ObjectKey, value: CacheValue) -> Result<()> {
        let nbytes = value.nbytes();
        let old_nbytes = {
            let mut slots = self.slots.borrow_mut();
            slots
                .insert(key.clone(), Slot { value, nbytes })
                .map(|s| s.nbytes)
                .unwrap_or(0)
        };
        self.used
            .set(self.used.get().saturating_sub(old_nbytes) + nbytes);
        self.touch(&key);
        self.evict_to_capacity()
    }

    /// Re-account and mark dirty an entry mutated through its handle.
    pub fn mark_dirty(&self, key: &ObjectKey) -> Result<()> {
        let (old_nbytes, new_nbytes) = {
            let mut slots = self.slots.borrow_mut();
            let slot = slots.get_mut(key).ok_or_else(|| {
                TensorError::Corrupted(format!("no cached entry under '{}'", key))
            })?;
            let old = slot.nbytes;
            slot.nbytes = slot.value.nbytes();
            (old, slot.nbytes)
        };
        self.used
            .set(self.used.get().saturating_sub(old_nbytes) + new_nbytes);
        self.dirty.borrow_mut().insert(key.clone());
        self.touch(key);
        self.evict_to_capacity()
    }

    /// Write all dirty entries to the store, metadata blobs first.
    pub fn flush(&self) -> Result<()> {
        let mut keys: Vec<ObjectKey> = self.dirty.borrow().iter().cloned().collect();
        keys.sort_by(|a, b| a.is_chunk().cmp(&b.is_chunk()).then_with(|| a.cmp(b)));
        for key in keys {
            self.write_back(&key)?;
        }
        Ok(())
    }

    /// Flush if autoflush is enabled. Called by the engine at the end of
    /// every completed batch.
    pub fn maybe_flush(&self) -> Result<()> {
        if self.autoflush.get() {
            self.flush()?;
        }
        Ok(())
    }

    /// Drop a key from the cache and the backing store.
    pub fn erase(&self, key: &ObjectKey) -> Result<()> {
        self.remove_slot(key);
        self.dirty.borrow_mut().remove(key);
        self.store.erase(key)?;
        Ok(())
    }

    fn touch(&self, key: &ObjectKey) {
        let mut lru = self.lru.borrow_mut();
        if let Some(pos) = lru.iter().position(|k| k == key) {
            lru.remove(pos);
        }
        lru.push(key.clone());
    }

    fn write_back(&self, key: &ObjectKey) -> Result<()> {
        if !self.dirty.borrow().contains(key) {
            return Ok(());
        }
        let bytes = {
            let slots = self.slots.borrow();
            match slots.get(key) {
                Some(slot) => slot.value.to_bytes()?,
                None => return Ok(()),
            }
        };
        self.store.set(key, bytes)?;
        self.dirty.borrow_mut().remove(key);
        Ok(())
    }

    fn remove_slot(&self, key: &ObjectKey) {
        let removed = self.slots.borrow_mut().remove(key);
        if let Some(slot) = removed {
            self.used.set(self.used.get().saturating_sub(slot.nbytes));
        }
        let mut lru = self.lru.borrow_mut();
        if let Some(pos) = lru.iter().position(|k| k == key) {
            lru.remove(pos);
        }
    }

    fn evict_to_capacity(&self) -> Result<()> {
        while self.used.get() > self.capacity {
            let Some(victim) = self.pick_victim() else {
                break;
            };
            self.write_back(&victim)?;
            self.remove_slot(&victim);
        }
        Ok(())
    }

    /// Least recently used entry without live external handles.
    fn pick_victim(&self) -> Option<ObjectKey> {
        let slots = self.slots.borrow();
        let lru = self.lru.borrow();
        lru.iter()
            .find(|key| match slots.get(*key) {
                Some(Slot {
                    value: CacheValue::Chunk(handle),
                    ..
                }) => Rc::strong_count(handle) == 1,
                Some(_) => true,
                None => false,
            })
            .cloned()
    }
}

fn variant_mismatch(key: &ObjectKey) -> TensorError {
    TensorError::Corrupted(format!("cached entry under '{}' has the wrong type", key))
}

fn decode_failure(key: &ObjectKey, detail: &str) -> TensorError {
    TensorError::Corrupted(format!("could not decode '{}': {}", key, detail))
}

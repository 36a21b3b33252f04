use std::{cell::RefCell, collections::HashSet, rc::Rc};

use log::warn;
use ndarray::{ArrayD, IxDyn};

use crate::{
    cache::{CacheValue, ChunkCache},
    chunk::Chunk,
    dtype::ReflectedType,
    encode::chunk_id::ChunkIdEncoder,
    error::{Result, TensorError},
    index::Index,
    keys::ObjectKey,
    meta::TensorMeta,
    sample::{decode_sample, serialize_input_samples, SampleCompression},
    store::WriteableStore,
    SampleShape,
};

/// Portion beyond the nominal size bounds an updated chunk may stray
/// before a warning is emitted.
const CHUNK_UPDATE_WARN_PORTION: f64 = 0.2;

/// Coordinator routing samples into chunks and fulfilling reads.
///
/// All samples live inside chunks; no chunk contains a partial sample and
/// no sample spans two chunks. The engine is the sole mutator of the
/// tensor's meta and chunk index, which it keeps synchronized with the
/// cache after every placed sample.
///
/// With `max_chunk_size = 32` and `min_chunk_size = 16`, appending samples
/// of sizes `[1, 1, 14, 15, 15]` packs as:
///
/// ```text
/// chunk 0: 1 + 1 + 14      = 16   (reaches min, stops growing)
/// chunk 1: 15 + 15         = 30
/// ```
///
/// A chunk keeps accepting samples while under `min_chunk_size`, provided
/// the merge does not increase the number of chunks a reader would visit.
pub struct ChunkEngine<'s, S> {
    key: String,
    cache: &'s ChunkCache<S>,
    meta_key: ObjectKey,
    ids_key: ObjectKey,
}

impl<'s, S: WriteableStore> ChunkEngine<'s, S> {
    /// Create a fresh tensor under `key` and return its engine.
    ///
    /// The dtype is left unset until the first extend.
    pub fn create(
        key: &str,
        cache: &'s ChunkCache<S>,
        max_chunk_size: Option<u64>,
        sample_compression: SampleCompression,
    ) -> Result<Self> {
        cache.check_readonly()?;
        let engine = Self::with_keys(key, cache);
        if cache.exists(&engine.meta_key)? {
            return Err(TensorError::AlreadyExists(key.to_owned()));
        }
        let meta = TensorMeta::new(max_chunk_size, sample_compression);
        cache.insert(engine.meta_key.clone(), CacheValue::Meta(meta))?;
        cache.maybe_flush()?;
        Ok(engine)
    }

    /// Open an existing tensor under `key`.
    ///
    /// Fails with [TensorError::NotFound] when no tensor meta exists.
    /// A meta recording more samples than the chunk index (the expected
    /// state after a crash between meta and chunk writes) is truncated to
    /// the indexed count; the inverse is unrecoverable.
    pub fn open(key: &str, cache: &'s ChunkCache<S>) -> Result<Self> {
        let engine = Self::with_keys(key, cache);
        let Some(mut meta) = cache.get_meta(&engine.meta_key)? else {
            return Err(TensorError::NotFound(key.to_owned()));
        };

        let indexed = match cache.get_chunk_ids(&engine.ids_key)? {
            Some(ids) => ids.num_samples(),
            None if meta.length() > 1 => {
                return Err(TensorError::Corrupted(format!(
                    "'{}' records {} samples but '{}' is missing",
                    engine.meta_key,
                    meta.length(),
                    engine.ids_key
                )));
            }
            None => 0,
        };
        if meta.length() < indexed {
            return Err(TensorError::Corrupted(format!(
                "'{}' records {} samples but '{}' indexes {}",
                engine.meta_key,
                meta.length(),
                engine.ids_key,
                indexed
            )));
        }
        if meta.length() > indexed {
            warn!(
                "Tensor '{}' meta records {} samples but only {} are indexed; truncating",
                key,
                meta.length(),
                indexed
            );
            meta.length = indexed;
            cache.insert(engine.meta_key.clone(), CacheValue::Meta(meta))?;
        }
        Ok(engine)
    }

    fn with_keys(key: &str, cache: &'s ChunkCache<S>) -> Self {
        Self {
            key: key.to_owned(),
            cache,
            meta_key: ObjectKey::tensor_meta(key),
            ids_key: ObjectKey::chunk_id_encoder(key),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn tensor_meta(&self) -> Result<TensorMeta> {
        self.cache
            .get_meta(&self.meta_key)?
            .ok_or_else(|| TensorError::NotFound(self.key.clone()))
    }

    /// The chunk id encoder, created blank on first use.
    ///
    /// A missing encoder is only legal while the tensor holds at most one
    /// sample (the meta is written before the sample it describes).
    pub fn chunk_id_encoder(&self) -> Result<ChunkIdEncoder> {
        match self.cache.get_chunk_ids(&self.ids_key)? {
            Some(ids) => Ok(ids),
            None => {
                let meta = self.tensor_meta()?;
                if meta.length() > 1 {
                    return Err(TensorError::Corrupted(format!(
                        "tensor length is {} but '{}' is missing",
                        meta.length(),
                        self.ids_key
                    )));
                }
                let ids = ChunkIdEncoder::default();
                self.cache
                    .insert(self.ids_key.clone(), CacheValue::ChunkIds(ids.clone()))?;
                Ok(ids)
            }
        }
    }

    pub fn num_samples(&self) -> Result<u64> {
        Ok(self
            .cache
            .get_chunk_ids(&self.ids_key)?
            .map(|ids| ids.num_samples())
            .unwrap_or(0))
    }

    pub fn num_chunks(&self) -> Result<usize> {
        Ok(self
            .cache
            .get_chunk_ids(&self.ids_key)?
            .map(|ids| ids.num_chunks())
            .unwrap_or(0))
    }

    pub fn max_chunk_size(&self) -> Result<u64> {
        Ok(self.tensor_meta()?.max_chunk_size())
    }

    /// Only the last chunk may hold fewer data bytes than this.
    pub fn min_chunk_size(&self) -> Result<u64> {
        Ok(self.max_chunk_size()? / 2)
    }

    pub fn last_chunk(&self) -> Result<Option<Rc<RefCell<Chunk>>>> {
        let Some(ids) = self.cache.get_chunk_ids(&self.ids_key)? else {
            return Ok(None);
        };
        let Some(name) = ids.get_name_for_chunk(-1) else {
            return Ok(None);
        };
        let chunk_key = ObjectKey::chunk(&self.key, &name);
        Ok(Some(self.require_chunk(&chunk_key)?))
    }

    /// Append a single sample.
    pub fn append<T: ReflectedType>(&mut self, sample: ArrayD<T>) -> Result<()> {
        self.extend(std::slice::from_ref(&sample))
    }

    /// Append a batch of samples in order.
    ///
    /// The tensor dtype is inferred from the first batch. The meta is
    /// updated ahead of each sample's bytes: erroneous meta information
    /// is better than unaccounted-for data.
    pub fn extend<T: ReflectedType>(&mut self, samples: &[ArrayD<T>]) -> Result<()> {
        self.cache.check_readonly()?;

        let mut meta = self.tensor_meta()?;
        if meta.dtype().is_none() {
            meta.set_dtype(T::DTYPE);
        }
        let mut ids = self.chunk_id_encoder()?;

        let serialized = serialize_input_samples(samples, &meta)?;
        for (buffer, shape) in serialized {
            meta.update_shape_interval(&shape)?;
            meta.length += 1;
            self.append_bytes(&meta, &mut ids, &buffer, &shape)?;
        }
        self.cache.maybe_flush()?;
        Ok(())
    }

    /// Place one serialized sample into the last chunk or a new one, then
    /// synchronize meta, index and the touched chunk with the cache.
    fn append_bytes(
        &self,
        meta: &TensorMeta,
        ids: &mut ChunkIdEncoder,
        buffer: &[u8],
        shape: &SampleShape,
    ) -> Result<()> {
        let consumed = self.try_appending_to_last_chunk(meta, ids, buffer, shape)?;
        if !consumed {
            self.append_to_new_chunk(meta, ids, buffer, shape)?;
        }
        ids.register_samples(1);

        let last_key = self.last_chunk_key(ids)?;
        self.synchronize(meta, ids, Some(&last_key))
    }

    /// Store the sample in the last chunk if that does not increase the
    /// number of chunks a reader spanning the new data would visit.
    ///
    /// Returns whether the buffer was consumed.
    fn try_appending_to_last_chunk(
        &self,
        meta: &TensorMeta,
        ids: &ChunkIdEncoder,
        buffer: &[u8],
        shape: &SampleShape,
    ) -> Result<bool> {
        let Some(name) = ids.get_name_for_chunk(-1) else {
            return Ok(false);
        };
        let chunk_key = ObjectKey::chunk(&self.key, &name);
        let chunk = self.require_chunk(&chunk_key)?;
        let mut chunk = chunk.borrow_mut();

        let max_chunk_size = meta.max_chunk_size();
        let incoming_num_bytes = buffer.len() as u64;

        if chunk.is_under_min_space(max_chunk_size / 2) {
            let last_chunk_size = chunk.num_data_bytes();
            let chunk_ct_content = min_chunk_ct_for_data_size(max_chunk_size, incoming_num_bytes);

            let extra_bytes = incoming_num_bytes.min(max_chunk_size - last_chunk_size);
            let combined_chunk_ct =
                min_chunk_ct_for_data_size(max_chunk_size, incoming_num_bytes + last_chunk_size);

            // combine if the count stays the same
            if combined_chunk_ct == chunk_ct_content {
                chunk.append_sample(&buffer[..extra_bytes as usize], max_chunk_size, shape);
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn append_to_new_chunk(
        &self,
        meta: &TensorMeta,
        ids: &mut ChunkIdEncoder,
        buffer: &[u8],
        shape: &SampleShape,
    ) -> Result<()> {
        let chunk_id = ids.generate_chunk_id();
        let mut chunk = Chunk::new();
        chunk.append_sample(buffer, meta.max_chunk_size(), shape);

        let chunk_key = ObjectKey::chunk(&self.key, &chunk_id.name());
        self.cache
            .insert(chunk_key, CacheValue::Chunk(Rc::new(RefCell::new(chunk))))
    }

    /// Push the working meta and index into the cache, optionally
    /// re-accounting one touched chunk.
    fn synchronize(
        &self,
        meta: &TensorMeta,
        ids: &ChunkIdEncoder,
        chunk_key: Option<&ObjectKey>,
    ) -> Result<()> {
        if let Some(key) = chunk_key {
            self.cache.mark_dirty(key)?;
        }
        self.cache
            .insert(self.meta_key.clone(), CacheValue::Meta(meta.clone()))?;
        self.cache
            .insert(self.ids_key.clone(), CacheValue::ChunkIds(ids.clone()))?;
        Ok(())
    }

    /// Replace the samples addressed by `index` (primary axis only).
    ///
    /// Chunks are rewritten in place and may drift outside their nominal
    /// size bounds; a warning is emitted once per batch when any non-tail
    /// chunk ends up outside `[0.8 * min, 1.2 * max]`.
    pub fn update<T: ReflectedType>(&mut self, index: &Index, samples: &[ArrayD<T>]) -> Result<()> {
        self.cache.check_readonly()?;
        if !index.is_single_dim_effective() {
            return Err(TensorError::Unsupported(
                "updates addressing non-primary axes are not supported",
            ));
        }

        let mut meta = self.tensor_meta()?;
        let ids = self.chunk_id_encoder()?;
        let globals = index.resolve_primary(ids.num_samples())?;
        if globals.len() != samples.len() {
            return Err(TensorError::LengthMismatch {
                index: globals.len(),
                samples: samples.len(),
            });
        }

        let serialized = serialize_input_samples(samples, &meta)?;
        let last_key = ids
            .get_name_for_chunk(-1)
            .map(|name| ObjectKey::chunk(&self.key, &name));

        let mut chunks_nbytes_after_updates = Vec::new();
        for (&global, (buffer, shape)) in globals.iter().zip(serialized) {
            let chunk_key = self.chunk_key_for_sample(global, &ids)?;
            let chunk = self.require_chunk(&chunk_key)?;
            let local = self.translate_index(global, &ids)?;

            meta.update_shape_interval(&shape)?;
            chunk.borrow_mut().update_sample(local, &buffer, &shape)?;
            self.cache.mark_dirty(&chunk_key)?;

            // only non-tail chunks are held to the size bounds
            if Some(&chunk_key) != last_key.as_ref() {
                chunks_nbytes_after_updates.push(chunk.borrow().nbytes());
            }
        }

        self.synchronize(&meta, &ids, None)?;
        self.cache.maybe_flush()?;

        let max_chunk_size = meta.max_chunk_size();
        warn_if_suboptimal_chunks(
            &chunks_nbytes_after_updates,
            max_chunk_size / 2,
            max_chunk_size,
        );
        Ok(())
    }

    /// Materialize the addressed samples one array each.
    ///
    /// Trailing index entries are applied to each sample before it is
    /// returned.
    pub fn read<T: ReflectedType>(&self, index: &Index) -> Result<Vec<ArrayD<T>>> {
        let meta = self.tensor_meta()?;
        let ids = self.chunk_id_encoder()?;

        let mut out = Vec::new();
        for global in index.resolve_primary(ids.num_samples())? {
            let sample = self.read_sample(global, &ids, &meta)?;
            out.push(index.apply_trailing(sample)?);
        }
        Ok(out)
    }

    /// Materialize the addressed samples as one dense array with a leading
    /// sample axis (squeezed away for single-sample indices).
    ///
    /// Fails with [TensorError::DynamicShape] when the addressed samples
    /// do not share a shape.
    pub fn read_dense<T: ReflectedType>(&self, index: &Index) -> Result<ArrayD<T>> {
        let meta = self.tensor_meta()?;
        let ids = self.chunk_id_encoder()?;

        let mut samples = Vec::new();
        let mut last_shape: Option<SampleShape> = None;
        for global in index.resolve_primary(ids.num_samples())? {
            let sample = self.read_sample(global, &ids, &meta)?;
            let shape: SampleShape = sample.shape().iter().map(|&d| d as u64).collect();
            if let Some(prev) = &last_shape {
                if prev != &shape {
                    return Err(TensorError::DynamicShape(format!(
                        "'{}' holds samples of shapes {:?} and {:?}; read them sample-wise instead",
                        self.key, prev, shape
                    )));
                }
            }
            last_shape = Some(shape);
            samples.push(index.apply_trailing(sample)?);
        }

        if index.primary_is_single() {
            return samples
                .into_iter()
                .next()
                .ok_or_else(|| TensorError::OutOfBounds { index: 0, length: 0 });
        }
        stack_samples(samples)
    }

    fn read_sample<T: ReflectedType>(
        &self,
        global: u64,
        ids: &ChunkIdEncoder,
        meta: &TensorMeta,
    ) -> Result<ArrayD<T>> {
        let chunk_key = self.chunk_key_for_sample(global, ids)?;
        let chunk = self.require_chunk(&chunk_key)?;
        let chunk = chunk.borrow();
        self.decode_local(global, &chunk, ids, meta)
    }

    /// Read one sample out of a chunk already in hand, decompressing if
    /// the tensor is compressed.
    pub fn read_sample_from_chunk<T: ReflectedType>(
        &self,
        global: u64,
        chunk: &Chunk,
    ) -> Result<ArrayD<T>> {
        let meta = self.tensor_meta()?;
        let ids = self.chunk_id_encoder()?;
        self.decode_local(global, chunk, &ids, &meta)
    }

    fn decode_local<T: ReflectedType>(
        &self,
        global: u64,
        chunk: &Chunk,
        ids: &ChunkIdEncoder,
        meta: &TensorMeta,
    ) -> Result<ArrayD<T>> {
        let local = self.translate_index(global, ids)?;
        let shape = chunk
            .shapes()
            .get(local)
            .ok_or_else(|| self.out_of_bounds(global, ids))?
            .clone();
        let buffer = chunk
            .sample_bytes(local)
            .ok_or_else(|| self.out_of_bounds(global, ids))?;
        decode_sample(buffer, &shape, meta)
    }

    /// The chunk holding the sample at `global`.
    pub fn get_chunk_for_sample(
        &self,
        global: u64,
        ids: &ChunkIdEncoder,
    ) -> Result<Rc<RefCell<Chunk>>> {
        let chunk_key = self.chunk_key_for_sample(global, ids)?;
        self.require_chunk(&chunk_key)
    }

    /// Names of chunks covering samples from `sample_index` up to
    /// `last_index`, for prefetchers.
    ///
    /// Stops early once `target_chunk_count` names are collected, and
    /// returns fewer when the tensor ends first.
    pub fn get_chunk_names(
        &self,
        sample_index: u64,
        last_index: u64,
        target_chunk_count: usize,
    ) -> Result<HashSet<String>> {
        let ids = self.chunk_id_encoder()?;
        let last_index = last_index.min(ids.num_samples());

        let mut chunk_names = HashSet::new();
        let mut sample_index = sample_index;
        while chunk_names.len() < target_chunk_count && sample_index < last_index {
            let id = ids
                .chunk_id(sample_index)
                .ok_or_else(|| self.out_of_bounds(sample_index, &ids))?;
            chunk_names.insert(id.name());
            sample_index += 1;
        }
        Ok(chunk_names)
    }

    /// Check that the meta and the chunk index agree on the number of
    /// stored samples, e.g. after external tampering or partial writes.
    pub fn validate_num_samples_is_synchronized(&self) -> Result<()> {
        let meta = self.tensor_meta()?;
        let indexed = self
            .cache
            .get_chunk_ids(&self.ids_key)?
            .map(|ids| ids.num_samples())
            .unwrap_or(0);
        if meta.length() != indexed {
            return Err(TensorError::Corrupted(format!(
                "'{}' and '{}' record different numbers of samples: {} and {}",
                self.meta_key,
                self.ids_key,
                meta.length(),
                indexed
            )));
        }
        Ok(())
    }

    fn chunk_key_for_sample(&self, global: u64, ids: &ChunkIdEncoder) -> Result<ObjectKey> {
        let id = ids
            .chunk_id(global)
            .ok_or_else(|| self.out_of_bounds(global, ids))?;
        Ok(ObjectKey::chunk(&self.key, &id.name()))
    }

    fn translate_index(&self, global: u64, ids: &ChunkIdEncoder) -> Result<u64> {
        ids.translate_index_relative_to_chunks(global)
            .ok_or_else(|| self.out_of_bounds(global, ids))
    }

    fn last_chunk_key(&self, ids: &ChunkIdEncoder) -> Result<ObjectKey> {
        let name = ids.get_name_for_chunk(-1).ok_or_else(|| {
            TensorError::Corrupted(format!("'{}' indexes no chunks", self.ids_key))
        })?;
        Ok(ObjectKey::chunk(&self.key, &name))
    }

    /// A chunk registered in the index must exist in the cache or store.
    fn require_chunk(&self, chunk_key: &ObjectKey) -> Result<Rc<RefCell<Chunk>>> {
        self.cache.get_chunk(chunk_key)?.ok_or_else(|| {
            TensorError::Corrupted(format!("indexed chunk '{}' is missing", chunk_key))
        })
    }

    fn out_of_bounds(&self, global: u64, ids: &ChunkIdEncoder) -> TensorError {
        TensorError::OutOfBounds {
            index: global as i64,
            length: ids.num_samples(),
        }
    }
}

/// Minimum number of chunks that data of the given size can occupy.
fn min_chunk_ct_for_data_size(max_chunk_size: u64, size: u64) -> u64 {
    (size + max_chunk_size - 1) / max_chunk_size
}

pub(crate) fn has_suboptimal_chunks(
    chunks_nbytes: &[u64],
    min_chunk_size: u64,
    max_chunk_size: u64,
) -> bool {
    let upper = max_chunk_size as f64 * (1.0 + CHUNK_UPDATE_WARN_PORTION);
    let lower = min_chunk_size as f64 * (1.0 - CHUNK_UPDATE_WARN_PORTION);
    chunks_nbytes
        .iter()
        .any(|&nbytes| (nbytes as f64) > upper || (nbytes as f64) < lower)
}

fn warn_if_suboptimal_chunks(chunks_nbytes: &[u64], min_chunk_size: u64, max_chunk_size: u64) {
    if has_suboptimal_chunks(chunks_nbytes, min_chunk_size, max_chunk_size) {
        warn!(
            "After update, some chunks have suboptimal sizes. Many updates that change \
             sample sizes by large amounts can heavily impact read performance."
        );
    }
}

fn stack_samples<T: ReflectedType>(samples: Vec<ArrayD<T>>) -> Result<ArrayD<T>> {
    let sample_shape: Vec<usize> = samples
        .first()
        .map(|s| s.shape().to_vec())
        .unwrap_or_default();
    let mut out_shape = Vec::with_capacity(sample_shape.len() + 1);
    out_shape.push(samples.len());
    out_shape.extend(sample_shape);

    let mut elements = Vec::new();
    for sample in samples {
        elements.extend(sample.into_iter());
    }
    ArrayD::from_shape_vec(IxDyn(&out_shape), elements)
        .map_err(|e| TensorError::InvalidShape(e.to_string()))
}

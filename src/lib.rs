use smallvec::SmallVec;

pub mod cache;
mod chunk;
pub mod dtype;
pub mod encode;
mod engine;
mod error;
pub mod index;
pub mod keys;
pub mod meta;
pub mod sample;
pub mod store;

pub use cache::ChunkCache;
pub use chunk::Chunk;
pub use dtype::{DataType, ReflectedType};
pub use encode::chunk_id::{ChunkId, ChunkIdEncoder};
pub use engine::ChunkEngine;
pub use error::TensorError;
pub use index::{Index, IndexEntry};
pub use meta::{ShapeInterval, TensorMeta};
pub use sample::SampleCompression;

const COORD_SMALLVEC_SIZE: usize = 6;

/// Format version written at the head of every serialized chunk and encoder blob.
pub const FORMAT_VERSION: u8 = 1;

/// Ceiling on chunk payload size when the tensor meta does not override it.
pub const DEFAULT_MAX_CHUNK_SIZE: u64 = 32 * 1024 * 1024;

pub type CoordVec<T> = SmallVec<[T; COORD_SMALLVEC_SIZE]>;

/// Shape of a single sample, primary (sample) axis excluded.
///
/// Zero-length for scalar samples.
pub type SampleShape = CoordVec<u64>;

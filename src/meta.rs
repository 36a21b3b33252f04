use std::fmt::Display;

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::{
    dtype::DataType,
    error::{Result, TensorError},
    sample::SampleCompression,
    CoordVec, SampleShape, DEFAULT_MAX_CHUNK_SIZE,
};

/// Durable per-tensor header.
///
/// Created blank when the tensor is created; the dtype is inferred from the
/// first extend, and the shape interval widens as samples arrive. Persisted
/// as JSON under `T/tensor_meta.json`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct TensorMeta {
    pub(crate) dtype: Option<DataType>,
    pub(crate) length: u64,
    pub(crate) min_shape: SampleShape,
    pub(crate) max_shape: SampleShape,
    pub(crate) max_chunk_size: u64,
    pub(crate) sample_compression: SampleCompression,
}

impl Default for TensorMeta {
    fn default() -> Self {
        Self::new(None, SampleCompression::default())
    }
}

impl TensorMeta {
    pub fn new(max_chunk_size: Option<u64>, sample_compression: SampleCompression) -> Self {
        Self {
            dtype: None,
            length: 0,
            min_shape: SampleShape::new(),
            max_shape: SampleShape::new(),
            max_chunk_size: max_chunk_size.unwrap_or(DEFAULT_MAX_CHUNK_SIZE),
            sample_compression,
        }
    }

    pub fn dtype(&self) -> Option<DataType> {
        self.dtype
    }

    /// Total number of samples across all chunks.
    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn min_shape(&self) -> &SampleShape {
        &self.min_shape
    }

    pub fn max_shape(&self) -> &SampleShape {
        &self.max_shape
    }

    pub fn max_chunk_size(&self) -> u64 {
        self.max_chunk_size
    }

    pub fn sample_compression(&self) -> SampleCompression {
        self.sample_compression
    }

    /// Fix the element type; a no-op once set.
    pub fn set_dtype(&mut self, dtype: DataType) {
        self.dtype.get_or_insert(dtype);
    }

    /// Widen the observed shape interval element-wise.
    ///
    /// All samples must share a dimensionality; fails with
    /// [TensorError::InvalidShape] otherwise.
    pub fn update_shape_interval(&mut self, shape: &SampleShape) -> Result<()> {
        if self.length == 0 {
            self.min_shape = shape.clone();
            self.max_shape = shape.clone();
            return Ok(());
        }
        if shape.len() != self.min_shape.len() {
            return Err(TensorError::InvalidShape(format!(
                "sample has {} dimensions, tensor has {}",
                shape.len(),
                self.min_shape.len()
            )));
        }
        for (m, s) in self.min_shape.iter_mut().zip(shape.iter()) {
            *m = (*m).min(*s);
        }
        for (m, s) in self.max_shape.iter_mut().zip(shape.iter()) {
            *m = (*m).max(*s);
        }
        Ok(())
    }

    /// Shape bounds with the tensor's length prepended.
    pub fn shape_interval(&self) -> ShapeInterval {
        let mut lower: CoordVec<u64> = CoordVec::new();
        let mut upper: CoordVec<u64> = CoordVec::new();
        lower.push(self.length);
        upper.push(self.length);
        lower.extend(self.min_shape.iter().copied());
        upper.extend(self.max_shape.iter().copied());
        ShapeInterval { lower, upper }
    }

    pub fn is_dynamic(&self) -> bool {
        self.min_shape != self.max_shape
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Approximate in-memory footprint, used for cache accounting.
    pub fn nbytes(&self) -> usize {
        std::mem::size_of::<Self>() + (self.min_shape.len() + self.max_shape.len()) * 8
    }
}

/// Element-wise lower and upper bounds over all sample shapes,
/// length included as the leading axis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShapeInterval {
    lower: CoordVec<u64>,
    upper: CoordVec<u64>,
}

impl ShapeInterval {
    pub fn lower(&self) -> &[u64] {
        &self.lower
    }

    pub fn upper(&self) -> &[u64] {
        &self.upper
    }

    /// True when any axis varies across samples.
    pub fn is_dynamic(&self) -> bool {
        self.lower != self.upper
    }
}

impl Display for ShapeInterval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let body = self
            .lower
            .iter()
            .zip(self.upper.iter())
            .map(|(lo, up)| {
                if lo == up {
                    lo.to_string()
                } else {
                    format!("{}:{}", lo, up)
                }
            })
            .join(", ");
        write!(f, "({})", body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::FloatSize;

    fn sh(dims: &[u64]) -> SampleShape {
        dims.iter().copied().collect()
    }

    #[test]
    fn dtype_is_set_once() {
        let mut meta = TensorMeta::default();
        assert_eq!(meta.dtype(), None);
        meta.set_dtype(DataType::Float(FloatSize::b32));
        meta.set_dtype(DataType::Bool);
        assert_eq!(meta.dtype(), Some(DataType::Float(FloatSize::b32)));
    }

    #[test]
    fn shape_interval_widens() {
        let mut meta = TensorMeta::default();
        meta.update_shape_interval(&sh(&[10, 10])).unwrap();
        meta.length = 1;
        meta.update_shape_interval(&sh(&[10, 15])).unwrap();
        meta.length = 2;
        meta.update_shape_interval(&sh(&[8, 12])).unwrap();
        meta.length = 3;

        assert_eq!(meta.min_shape(), &sh(&[8, 10]));
        assert_eq!(meta.max_shape(), &sh(&[10, 15]));
        assert!(meta.is_dynamic());

        let interval = meta.shape_interval();
        assert_eq!(interval.lower(), &[3, 8, 10]);
        assert_eq!(interval.upper(), &[3, 10, 15]);
        assert!(interval.is_dynamic());
    }

    #[test]
    fn ndim_mismatch_is_rejected() {
        let mut meta = TensorMeta::default();
        meta.update_shape_interval(&sh(&[10, 10])).unwrap();
        meta.length = 1;
        assert!(matches!(
            meta.update_shape_interval(&sh(&[10])),
            Err(TensorError::InvalidShape(_))
        ));
    }

    #[test]
    fn interval_display() {
        let mut meta = TensorMeta::default();
        meta.update_shape_interval(&sh(&[10, 10])).unwrap();
        meta.length = 1;
        meta.update_shape_interval(&sh(&[10, 15])).unwrap();
        meta.length = 2;

        assert_eq!(meta.shape_interval().to_string(), "(2, 10, 10:15)");
    }

    #[test]
    fn json_roundtrip() {
        let mut meta = TensorMeta::new(Some(1 << 20), SampleCompression::default());
        meta.set_dtype(DataType::Float(FloatSize::b64));
        meta.update_shape_interval(&sh(&[28, 28, 1])).unwrap();
        meta.length = 7;

        let bytes = meta.to_bytes().unwrap();
        let back = TensorMeta::from_bytes(&bytes).unwrap();
        assert_eq!(back, meta);
    }

    #[test]
    fn blank_meta_has_no_shape() {
        let meta = TensorMeta::default();
        assert_eq!(meta.length(), 0);
        assert!(meta.min_shape().is_empty());
        assert!(!meta.is_dynamic());
        assert_eq!(meta.max_chunk_size(), DEFAULT_MAX_CHUNK_SIZE);
    }
}

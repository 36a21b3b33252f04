use ndarray::{ArrayD, IxDyn};
use serde::{Deserialize, Serialize};

use crate::{
    dtype::ReflectedType,
    error::{Result, TensorError},
    meta::TensorMeta,
    SampleShape,
};

#[cfg(feature = "gzip")]
const GZIP_LEVEL: u32 = 6;

/// Whole-sample compression applied before bytes are placed into a chunk.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SampleCompression {
    #[default]
    None,
    #[cfg(feature = "gzip")]
    Gzip,
}

/// Convert a batch of arrays into the `(buffer, shape)` pairs the engine
/// places into chunks.
///
/// Element bytes are written little-endian in logical order, then
/// compressed per the tensor's `sample_compression`. Buffers longer than
/// the tensor's max chunk size are rejected: a sample never spans chunks.
pub fn serialize_input_samples<T: ReflectedType>(
    samples: &[ArrayD<T>],
    meta: &TensorMeta,
) -> Result<Vec<(Vec<u8>, SampleShape)>> {
    check_dtype::<T>(meta)?;

    let mut out = Vec::with_capacity(samples.len());
    for arr in samples {
        let shape: SampleShape = arr.shape().iter().map(|&d| d as u64).collect();
        let mut buf = Vec::with_capacity(arr.len() * T::DTYPE.nbytes());
        for v in arr.iter() {
            v.write_to(&mut buf)?;
        }

        // empty samples stay empty so reads can zero-fill them
        let buf = match meta.sample_compression() {
            SampleCompression::None => buf,
            #[cfg(feature = "gzip")]
            SampleCompression::Gzip if buf.is_empty() => buf,
            #[cfg(feature = "gzip")]
            SampleCompression::Gzip => gzip_compress(&buf)?,
        };

        if buf.len() as u64 > meta.max_chunk_size() {
            return Err(TensorError::SampleTooLarge {
                nbytes: buf.len() as u64,
                max: meta.max_chunk_size(),
            });
        }
        out.push((buf, shape));
    }
    Ok(out)
}

/// Reconstruct one sample from its chunk bytes and recorded shape.
///
/// An empty byte range yields a zero-filled array of the recorded shape.
pub fn decode_sample<T: ReflectedType>(
    buffer: &[u8],
    shape: &SampleShape,
    meta: &TensorMeta,
) -> Result<ArrayD<T>> {
    check_dtype::<T>(meta)?;

    let dims: Vec<usize> = shape.iter().map(|&d| d as usize).collect();
    if buffer.is_empty() {
        return Ok(ArrayD::from_elem(IxDyn(&dims), T::default()));
    }

    let raw = match meta.sample_compression() {
        SampleCompression::None => buffer.to_vec(),
        #[cfg(feature = "gzip")]
        SampleCompression::Gzip => gzip_decompress(buffer)?,
    };

    let numel: usize = dims.iter().product();
    if raw.len() != numel * T::DTYPE.nbytes() {
        return Err(TensorError::Corrupted(format!(
            "sample of shape {:?} should occupy {} bytes, found {}",
            shape,
            numel * T::DTYPE.nbytes(),
            raw.len()
        )));
    }

    let mut elements = Vec::with_capacity(numel);
    let mut r = raw.as_slice();
    for _ in 0..numel {
        elements.push(T::read_from(&mut r)?);
    }
    ArrayD::from_shape_vec(IxDyn(&dims), elements)
        .map_err(|e| TensorError::InvalidShape(e.to_string()))
}

fn check_dtype<T: ReflectedType>(meta: &TensorMeta) -> Result<()> {
    let expected = meta.dtype().unwrap_or(T::DTYPE);
    if expected != T::DTYPE {
        return Err(TensorError::InvalidDtype {
            expected,
            got: T::DTYPE,
        });
    }
    Ok(())
}

#[cfg(feature = "gzip")]
fn gzip_compress(raw: &[u8]) -> std::io::Result<Vec<u8>> {
    use flate2::{write::GzEncoder, Compression as GzCompression};
    use std::io::Write;

    let mut encoder = GzEncoder::new(Vec::default(), GzCompression::new(GZIP_LEVEL));
    encoder.write_all(raw)?;
    encoder.finish()
}

#[cfg(feature = "gzip")]
fn gzip_decompress(encoded: &[u8]) -> std::io::Result<Vec<u8>> {
    use flate2::read::GzDecoder;
    use std::io::{Cursor, Read};

    let mut decoder = GzDecoder::new(Cursor::new(encoded));
    let mut out = Vec::default();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

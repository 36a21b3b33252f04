use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::{
    encode::{byte_positions::BytePositionsEncoder, check_version, shape::ShapeEncoder},
    error::{Result, TensorError},
    SampleShape, FORMAT_VERSION,
};

// version byte + two u32 blob length prefixes
const HEADER_NBYTES: usize = 9;

/// One bounded-size blob of whole samples.
///
/// A chunk owns an append-only data buffer and the two local encoders
/// describing it: sample shapes and sample byte ranges. No chunk contains a
/// partial sample, and no sample spans two chunks; the engine pre-decides
/// placement so that [Chunk::append_sample] is only called with payloads
/// the chunk can hold.
///
/// Serialized layout:
/// `version | shapes blob | byte positions blob | data bytes`
/// with each encoder blob prefixed by its length.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Chunk {
    shapes: ShapeEncoder,
    byte_positions: BytePositionsEncoder,
    data: Vec<u8>,
}

impl Chunk {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn num_samples(&self) -> u64 {
        self.byte_positions.num_samples()
    }

    /// Bytes of sample data held, excluding encoder and header overhead.
    pub fn num_data_bytes(&self) -> u64 {
        self.data.len() as u64
    }

    /// Full serialized size.
    pub fn nbytes(&self) -> u64 {
        (HEADER_NBYTES + self.shapes.nbytes() + self.byte_positions.nbytes() + self.data.len())
            as u64
    }

    /// Whether the chunk is still allowed to take on more samples.
    pub fn is_under_min_space(&self, min_data_bytes_target: u64) -> bool {
        self.num_data_bytes() < min_data_bytes_target
    }

    pub fn has_space_for(&self, nbytes: u64, max_data_bytes: u64) -> bool {
        self.num_data_bytes() + nbytes <= max_data_bytes
    }

    pub fn shapes(&self) -> &ShapeEncoder {
        &self.shapes
    }

    pub fn byte_positions(&self) -> &BytePositionsEncoder {
        &self.byte_positions
    }

    /// Read-only view of the chunk's sample data.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Bytes of the sample at a local index.
    pub fn sample_bytes(&self, local: u64) -> Option<&[u8]> {
        let (start, end) = self.byte_positions.get(local)?;
        self.data.get(start as usize..end as usize)
    }

    /// Append one whole sample.
    ///
    /// The caller must have established via [Chunk::has_space_for] that the
    /// payload fits under `max_data_bytes`.
    pub fn append_sample(&mut self, buffer: &[u8], max_data_bytes: u64, shape: &SampleShape) {
        debug_assert!(self.has_space_for(buffer.len() as u64, max_data_bytes));
        self.data.extend_from_slice(buffer);
        self.byte_positions.push(buffer.len() as u64);
        self.shapes.push(shape);
    }

    /// Replace the sample at a local index, splicing the data buffer and
    /// shifting later byte ranges.
    ///
    /// May push the chunk outside its nominal size bounds; the engine warns
    /// about that but does not re-pack.
    pub fn update_sample(
        &mut self,
        local: u64,
        buffer: &[u8],
        shape: &SampleShape,
    ) -> Result<()> {
        let (start, end) = self
            .byte_positions
            .get(local)
            .ok_or_else(|| out_of_bounds(local, self.num_samples()))?;
        self.data
            .splice(start as usize..end as usize, buffer.iter().copied());
        self.byte_positions
            .set(local, buffer.len() as u64)
            .ok_or_else(|| out_of_bounds(local, self.num_samples()))?;
        self.shapes
            .set(local, shape)
            .ok_or_else(|| out_of_bounds(local, self.num_samples()))?;
        Ok(())
    }

    pub fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_u8(FORMAT_VERSION)?;

        let mut shapes_blob = Vec::with_capacity(self.shapes.nbytes());
        self.shapes.write(&mut shapes_blob)?;
        let mut positions_blob = Vec::with_capacity(self.byte_positions.nbytes());
        self.byte_positions.write(&mut positions_blob)?;

        w.write_u32::<LittleEndian>(shapes_blob.len() as u32)?;
        w.write_u32::<LittleEndian>(positions_blob.len() as u32)?;
        w.write_all(&shapes_blob)?;
        w.write_all(&positions_blob)?;
        w.write_all(&self.data)?;
        Ok(())
    }

    pub fn from_reader<R: Read>(r: &mut R) -> io::Result<Self> {
        check_version(r.read_u8()?)?;
        let shapes_len = r.read_u32::<LittleEndian>()? as u64;
        let positions_len = r.read_u32::<LittleEndian>()? as u64;

        let mut shapes_blob = (&mut *r).take(shapes_len);
        let shapes = ShapeEncoder::from_reader(&mut shapes_blob)?;
        io::copy(&mut shapes_blob, &mut io::sink())?;

        let mut positions_blob = (&mut *r).take(positions_len);
        let byte_positions = BytePositionsEncoder::from_reader(&mut positions_blob)?;
        io::copy(&mut positions_blob, &mut io::sink())?;

        let mut data = Vec::new();
        r.read_to_end(&mut data)?;

        if byte_positions.num_bytes() != data.len() as u64
            || byte_positions.num_samples() != shapes.num_samples()
        {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "Chunk encoders disagree with data length",
            ));
        }

        Ok(Self {
            shapes,
            byte_positions,
            data,
        })
    }
}

fn out_of_bounds(local: u64, length: u64) -> TensorError {
    TensorError::OutOfBounds {
        index: local as i64,
        length,
    }
}

use std::{
    fmt::Display,
    io::{self, Read, Write},
};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use rand::Rng;

use super::check_version;
use crate::FORMAT_VERSION;

/// Identity of one stored chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkId(u64);

impl ChunkId {
    pub fn random() -> Self {
        Self(rand::thread_rng().gen())
    }

    /// The chunk's stable storage name: lowercase hex, zero-padded to
    /// 16 digits. Must never change across versions.
    pub fn name(&self) -> String {
        format!("{:016x}", self.0)
    }
}

impl From<u64> for ChunkId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl Display for ChunkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct IdRow {
    id: ChunkId,
    /// Exclusive end of the chunk's global sample index range.
    sample_end: u64,
}

/// Run-length mapping between global sample indices and chunk ids.
///
/// One row per chunk, sorted by sample range; a lookup is a binary search
/// over the range ends.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChunkIdEncoder {
    rows: Vec<IdRow>,
}

impl ChunkIdEncoder {
    pub fn num_samples(&self) -> u64 {
        self.rows.last().map(|r| r.sample_end).unwrap_or(0)
    }

    pub fn num_chunks(&self) -> usize {
        self.rows.len()
    }

    /// Mint an id for a new chunk and append its (initially empty) row.
    ///
    /// Must be followed by [ChunkIdEncoder::register_samples] before the
    /// encoder is persisted.
    pub fn generate_chunk_id(&mut self) -> ChunkId {
        let id = ChunkId::random();
        self.rows.push(IdRow {
            id,
            sample_end: self.num_samples(),
        });
        id
    }

    /// Account `num` freshly appended samples to the newest chunk.
    ///
    /// Panics if no chunk id has been generated yet.
    pub fn register_samples(&mut self, num: u64) {
        let last = self
            .rows
            .last_mut()
            .expect("no chunk to register samples into");
        last.sample_end += num;
    }

    fn row_index(&self, global: u64) -> Option<usize> {
        let idx = self.rows.partition_point(|r| r.sample_end <= global);
        (idx < self.rows.len()).then_some(idx)
    }

    /// Id of the chunk holding the sample at `global`.
    pub fn chunk_id(&self, global: u64) -> Option<ChunkId> {
        self.row_index(global).map(|i| self.rows[i].id)
    }

    /// Index of the sample within its owning chunk.
    pub fn translate_index_relative_to_chunks(&self, global: u64) -> Option<u64> {
        let idx = self.row_index(global)?;
        let start = if idx == 0 {
            0
        } else {
            self.rows[idx - 1].sample_end
        };
        Some(global - start)
    }

    /// Storage name of the `i`th chunk; negative `i` counts from the end.
    pub fn get_name_for_chunk(&self, i: isize) -> Option<String> {
        let n = self.rows.len() as isize;
        let idx = if i < 0 { n + i } else { i };
        if idx < 0 || idx >= n {
            return None;
        }
        Some(self.rows[idx as usize].id.name())
    }

    /// Visit every sample as `(chunk_id, local_sample_index)`,
    /// in ascending global order.
    pub fn iter(&self) -> impl Iterator<Item = (ChunkId, u64)> + '_ {
        self.rows
            .iter()
            .scan(0u64, |start, row| {
                let count = row.sample_end - *start;
                *start = row.sample_end;
                Some((row.id, count))
            })
            .flat_map(|(id, count)| (0..count).map(move |local| (id, local)))
    }

    /// Serialized size in bytes.
    pub fn nbytes(&self) -> usize {
        5 + self.rows.len() * 16
    }

    pub fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_u8(FORMAT_VERSION)?;
        w.write_u32::<LittleEndian>(self.rows.len() as u32)?;
        for row in self.rows.iter() {
            w.write_u64::<LittleEndian>(row.id.0)?;
            w.write_u64::<LittleEndian>(row.sample_end)?;
        }
        Ok(())
    }

    pub fn from_reader<R: Read>(r: &mut R) -> io::Result<Self> {
        check_version(r.read_u8()?)?;
        let nrows = r.read_u32::<LittleEndian>()?;
        let mut rows = Vec::with_capacity(nrows as usize);
        let mut prev_end = 0u64;
        for _ in 0..nrows {
            let id = ChunkId(r.read_u64::<LittleEndian>()?);
            let sample_end = r.read_u64::<LittleEndian>()?;
            if sample_end <= prev_end {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "Chunk index rows are not sorted",
                ));
            }
            prev_end = sample_end;
            rows.push(IdRow { id, sample_end });
        }
        Ok(Self { rows })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoder_with(counts: &[u64]) -> (ChunkIdEncoder, Vec<ChunkId>) {
        let mut enc = ChunkIdEncoder::default();
        let mut ids = Vec::new();
        for &n in counts {
            ids.push(enc.generate_chunk_id());
            enc.register_samples(n);
        }
        (enc, ids)
    }

    #[test]
    fn register_and_lookup() {
        let (enc, ids) = encoder_with(&[3, 1, 4]);

        assert_eq!(enc.num_samples(), 8);
        assert_eq!(enc.num_chunks(), 3);

        for (global, expected) in [(0, 0), (2, 0), (3, 1), (4, 2), (7, 2)] {
            assert_eq!(enc.chunk_id(global), Some(ids[expected]));
        }
        assert_eq!(enc.chunk_id(8), None);
    }

    #[test]
    fn translates_to_local_indices() {
        let (enc, _) = encoder_with(&[3, 1, 4]);

        let locals: Vec<_> = (0..8)
            .map(|g| enc.translate_index_relative_to_chunks(g).unwrap())
            .collect();
        assert_eq!(locals, vec![0, 1, 2, 0, 0, 1, 2, 3]);
        assert_eq!(enc.translate_index_relative_to_chunks(8), None);
    }

    #[test]
    fn growing_the_last_chunk() {
        let (mut enc, ids) = encoder_with(&[2]);
        enc.register_samples(1);

        assert_eq!(enc.num_samples(), 3);
        assert_eq!(enc.num_chunks(), 1);
        assert_eq!(enc.chunk_id(2), Some(ids[0]));
    }

    #[test]
    fn chunk_names() {
        let (enc, ids) = encoder_with(&[1, 1]);

        assert_eq!(enc.get_name_for_chunk(0), Some(ids[0].name()));
        assert_eq!(enc.get_name_for_chunk(-1), Some(ids[1].name()));
        assert_eq!(enc.get_name_for_chunk(-2), Some(ids[0].name()));
        assert_eq!(enc.get_name_for_chunk(2), None);
        assert_eq!(enc.get_name_for_chunk(-3), None);
    }

    #[test]
    fn name_is_padded_hex() {
        let id = ChunkId::from(0xbeefu64);
        assert_eq!(id.name(), "000000000000beef");
    }

    #[test]
    fn iterates_in_global_order() {
        let (enc, ids) = encoder_with(&[2, 3]);

        let visited: Vec<_> = enc.iter().collect();
        assert_eq!(
            visited,
            vec![
                (ids[0], 0),
                (ids[0], 1),
                (ids[1], 0),
                (ids[1], 1),
                (ids[1], 2),
            ]
        );
    }

    #[test]
    fn serialization_roundtrip() {
        let (enc, _) = encoder_with(&[3, 1, 4]);

        let mut buf = Vec::new();
        enc.write(&mut buf).unwrap();
        assert_eq!(buf.len(), enc.nbytes());

        let back = ChunkIdEncoder::from_reader(&mut buf.as_slice()).unwrap();
        assert_eq!(back, enc);
    }

    #[test]
    fn rejects_unsorted_rows() {
        let (enc, _) = encoder_with(&[3, 1]);
        let mut buf = Vec::new();
        enc.write(&mut buf).unwrap();
        // swap the two rows' range ends
        buf.copy_within(13..21, 29);
        assert!(ChunkIdEncoder::from_reader(&mut buf.as_slice()).is_err());
    }
}

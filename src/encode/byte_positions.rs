use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use super::check_version;
use crate::FORMAT_VERSION;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PositionRow {
    /// Byte offset of the first sample in this run.
    start_byte: u64,
    /// Byte width shared by every sample in this run.
    sample_nbytes: u64,
    /// Exclusive end of the run's local sample index range.
    sample_end: u64,
}

/// Run-length mapping from local sample index to the sample's byte range
/// within a chunk's data buffer.
///
/// Ranges are contiguous and sorted; the encoder compresses runs of
/// equal-width samples into single rows.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BytePositionsEncoder {
    rows: Vec<PositionRow>,
}

impl BytePositionsEncoder {
    pub fn num_samples(&self) -> u64 {
        self.rows.last().map(|r| r.sample_end).unwrap_or(0)
    }

    /// Total bytes covered, equal to the owning chunk's data length.
    pub fn num_bytes(&self) -> u64 {
        match self.rows.len() {
            0 => 0,
            n => {
                let last = &self.rows[n - 1];
                let first = if n == 1 { 0 } else { self.rows[n - 2].sample_end };
                last.start_byte + (last.sample_end - first) * last.sample_nbytes
            }
        }
    }

    /// Record the byte width of the next appended sample.
    pub fn push(&mut self, nbytes: u64) {
        let total = self.num_bytes();
        let num = self.num_samples();
        match self.rows.last_mut() {
            Some(last) if last.sample_nbytes == nbytes => last.sample_end += 1,
            _ => self.rows.push(PositionRow {
                start_byte: total,
                sample_nbytes: nbytes,
                sample_end: num + 1,
            }),
        }
    }

    /// Byte range `(start, end)` of the sample at the local index.
    pub fn get(&self, local: u64) -> Option<(u64, u64)> {
        let idx = self.rows.partition_point(|r| r.sample_end <= local);
        if idx == self.rows.len() {
            return None;
        }
        let row = &self.rows[idx];
        let first = if idx == 0 {
            0
        } else {
            self.rows[idx - 1].sample_end
        };
        let start = row.start_byte + (local - first) * row.sample_nbytes;
        Some((start, start + row.sample_nbytes))
    }

    /// Resize the sample at one local index, shifting every later range by
    /// the width delta.
    pub fn set(&mut self, local: u64, nbytes: u64) -> Option<()> {
        let idx = self.rows.partition_point(|r| r.sample_end <= local);
        if idx == self.rows.len() {
            return None;
        }
        let row = self.rows[idx];
        if row.sample_nbytes == nbytes {
            return Some(());
        }
        let first = if idx == 0 {
            0
        } else {
            self.rows[idx - 1].sample_end
        };
        let delta = nbytes as i64 - row.sample_nbytes as i64;
        let target_start = row.start_byte + (local - first) * row.sample_nbytes;

        let mut replacement = Vec::with_capacity(3);
        if local > first {
            replacement.push(PositionRow {
                start_byte: row.start_byte,
                sample_nbytes: row.sample_nbytes,
                sample_end: local,
            });
        }
        replacement.push(PositionRow {
            start_byte: target_start,
            sample_nbytes: nbytes,
            sample_end: local + 1,
        });
        if local + 1 < row.sample_end {
            replacement.push(PositionRow {
                start_byte: target_start + nbytes,
                sample_nbytes: row.sample_nbytes,
                sample_end: row.sample_end,
            });
        }

        let shift_from = idx + replacement.len();
        self.rows.splice(idx..=idx, replacement);
        for r in self.rows[shift_from..].iter_mut() {
            r.start_byte = (r.start_byte as i64 + delta) as u64;
        }
        self.normalize();
        Some(())
    }

    /// Merge adjacent runs of equal width; contiguity is maintained by
    /// construction.
    fn normalize(&mut self) {
        self.rows.dedup_by(|a, b| {
            if a.sample_nbytes == b.sample_nbytes {
                b.sample_end = a.sample_end;
                true
            } else {
                false
            }
        });
    }

    /// Serialized size in bytes.
    pub fn nbytes(&self) -> usize {
        5 + self.rows.len() * 24
    }

    pub fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_u8(FORMAT_VERSION)?;
        w.write_u32::<LittleEndian>(self.rows.len() as u32)?;
        for row in self.rows.iter() {
            w.write_u64::<LittleEndian>(row.start_byte)?;
            w.write_u64::<LittleEndian>(row.sample_nbytes)?;
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
            let start_byte = r.read_u64::<LittleEndian>()?;
            let sample_nbytes = r.read_u64::<LittleEndian>()?;
            let sample_end = r.read_u64::<LittleEndian>()?;
            if sample_end <= prev_end {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "Byte position rows are not sorted",
                ));
            }
            prev_end = sample_end;
            rows.push(PositionRow {
                start_byte,
                sample_nbytes,
                sample_end,
            });
        }
        Ok(Self { rows })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranges_are_contiguous() {
        let mut enc = BytePositionsEncoder::default();
        enc.push(100);
        enc.push(100);
        enc.push(50);
        enc.push(0);
        enc.push(25);

        assert_eq!(enc.num_samples(), 5);
        assert_eq!(enc.num_bytes(), 275);
        assert_eq!(enc.rows.len(), 4);

        let expected = [(0, 100), (100, 200), (200, 250), (250, 250), (250, 275)];
        for (i, exp) in expected.iter().enumerate() {
            assert_eq!(enc.get(i as u64), Some(*exp));
        }
        assert_eq!(enc.get(5), None);
    }

    #[test]
    fn set_same_width_is_a_noop() {
        let mut enc = BytePositionsEncoder::default();
        enc.push(10);
        enc.push(10);
        enc.set(0, 10).unwrap();
        assert_eq!(enc.rows.len(), 1);
        assert_eq!(enc.num_bytes(), 20);
    }

    #[test]
    fn set_grows_a_sample_and_shifts_later_ranges() {
        let mut enc = BytePositionsEncoder::default();
        for _ in 0..4 {
            enc.push(10);
        }
        enc.push(7);

        enc.set(1, 25).unwrap();

        assert_eq!(enc.num_samples(), 5);
        assert_eq!(enc.num_bytes(), 62);
        let expected = [(0, 10), (10, 35), (35, 45), (45, 55), (55, 62)];
        for (i, exp) in expected.iter().enumerate() {
            assert_eq!(enc.get(i as u64), Some(*exp), "sample {}", i);
        }
    }

    #[test]
    fn set_shrinks_a_sample() {
        let mut enc = BytePositionsEncoder::default();
        for _ in 0..3 {
            enc.push(10);
        }

        enc.set(2, 4).unwrap();
        assert_eq!(enc.num_bytes(), 24);
        assert_eq!(enc.get(2), Some((20, 24)));

        enc.set(0, 0).unwrap();
        assert_eq!(enc.num_bytes(), 14);
        let expected = [(0, 0), (0, 10), (10, 14)];
        for (i, exp) in expected.iter().enumerate() {
            assert_eq!(enc.get(i as u64), Some(*exp), "sample {}", i);
        }
    }

    #[test]
    fn set_merges_equal_width_neighbours() {
        let mut enc = BytePositionsEncoder::default();
        enc.push(10);
        enc.push(4);
        enc.push(10);

        enc.set(1, 10).unwrap();
        assert_eq!(enc.rows.len(), 1);
        assert_eq!(enc.num_bytes(), 30);
        assert_eq!(enc.get(2), Some((20, 30)));
    }

    #[test]
    fn set_out_of_range() {
        let mut enc = BytePositionsEncoder::default();
        enc.push(10);
        assert!(enc.set(1, 4).is_none());
    }

    #[test]
    fn serialization_roundtrip() {
        let mut enc = BytePositionsEncoder::default();
        enc.push(100);
        enc.push(100);
        enc.push(30);

        let mut buf = Vec::new();
        enc.write(&mut buf).unwrap();
        assert_eq!(buf.len(), enc.nbytes());

        let back = BytePositionsEncoder::from_reader(&mut buf.as_slice()).unwrap();
        assert_eq!(back, enc);
    }
}

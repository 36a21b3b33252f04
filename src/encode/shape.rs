use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use super::check_version;
use crate::{SampleShape, FORMAT_VERSION};

#[derive(Debug, Clone, PartialEq, Eq)]
struct ShapeRow {
    shape: SampleShape,
    /// Exclusive end of the local sample index range sharing this shape.
    sample_end: u64,
}

/// Run-length mapping from local sample index to sample shape.
///
/// Fixed-shape tensors collapse to a single row; dynamic tensors grow one
/// row per shape change.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ShapeEncoder {
    rows: Vec<ShapeRow>,
}

impl ShapeEncoder {
    pub fn num_samples(&self) -> u64 {
        self.rows.last().map(|r| r.sample_end).unwrap_or(0)
    }

    /// Record the shape of the next appended sample.
    pub fn push(&mut self, shape: &SampleShape) {
        let num = self.num_samples();
        match self.rows.last_mut() {
            Some(last) if last.shape == *shape => last.sample_end += 1,
            _ => self.rows.push(ShapeRow {
                shape: shape.clone(),
                sample_end: num + 1,
            }),
        }
    }

    pub fn get(&self, local: u64) -> Option<&SampleShape> {
        let idx = self.rows.partition_point(|r| r.sample_end <= local);
        (idx < self.rows.len()).then(|| &self.rows[idx].shape)
    }

    /// Overwrite the shape at one local index, splitting its run if needed.
    pub fn set(&mut self, local: u64, shape: &SampleShape) -> Option<()> {
        let idx = self.rows.partition_point(|r| r.sample_end <= local);
        if idx == self.rows.len() {
            return None;
        }
        if self.rows[idx].shape == *shape {
            return Some(());
        }

        let row_start = if idx == 0 {
            0
        } else {
            self.rows[idx - 1].sample_end
        };
        let row_end = self.rows[idx].sample_end;
        let old = self.rows[idx].shape.clone();

        let mut replacement = Vec::with_capacity(3);
        if local > row_start {
            replacement.push(ShapeRow {
                shape: old.clone(),
                sample_end: local,
            });
        }
        replacement.push(ShapeRow {
            shape: shape.clone(),
            sample_end: local + 1,
        });
        if local + 1 < row_end {
            replacement.push(ShapeRow {
                shape: old,
                sample_end: row_end,
            });
        }
        self.rows.splice(idx..=idx, replacement);
        self.normalize();
        Some(())
    }

    /// Merge adjacent runs that ended up with equal shapes.
    fn normalize(&mut self) {
        self.rows.dedup_by(|a, b| {
            if a.shape == b.shape {
                b.sample_end = a.sample_end;
                true
            } else {
                false
            }
        });
    }

    fn ndim(&self) -> usize {
        self.rows.first().map(|r| r.shape.len()).unwrap_or(0)
    }

    /// Serialized size in bytes.
    pub fn nbytes(&self) -> usize {
        6 + self.rows.len() * (self.ndim() * 8 + 8)
    }

    pub fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_u8(FORMAT_VERSION)?;
        w.write_u32::<LittleEndian>(self.rows.len() as u32)?;
        w.write_u8(self.ndim() as u8)?;
        for row in self.rows.iter() {
            for dim in row.shape.iter() {
                w.write_u64::<LittleEndian>(*dim)?;
            }
            w.write_u64::<LittleEndian>(row.sample_end)?;
        }
        Ok(())
    }

    pub fn from_reader<R: Read>(r: &mut R) -> io::Result<Self> {
        check_version(r.read_u8()?)?;
        let nrows = r.read_u32::<LittleEndian>()?;
        let ndim = r.read_u8()?;
        let mut rows = Vec::with_capacity(nrows as usize);
        let mut prev_end = 0u64;
        for _ in 0..nrows {
            let mut shape = SampleShape::new();
            for _ in 0..ndim {
                shape.push(r.read_u64::<LittleEndian>()?);
            }
            let sample_end = r.read_u64::<LittleEndian>()?;
            if sample_end <= prev_end {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "Shape rows are not sorted",
                ));
            }
            prev_end = sample_end;
            rows.push(ShapeRow { shape, sample_end });
        }
        Ok(Self { rows })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;

    fn sh(dims: &[u64]) -> SampleShape {
        dims.iter().copied().collect()
    }

    #[test]
    fn equal_shapes_share_a_run() {
        let mut enc = ShapeEncoder::default();
        for _ in 0..5 {
            enc.push(&sh(&[10, 10]));
        }
        enc.push(&sh(&[10, 15]));

        assert_eq!(enc.num_samples(), 6);
        assert_eq!(enc.rows.len(), 2);
        assert_eq!(enc.get(4), Some(&sh(&[10, 10])));
        assert_eq!(enc.get(5), Some(&sh(&[10, 15])));
        assert_eq!(enc.get(6), None);
    }

    #[test]
    fn scalar_shapes() {
        let mut enc = ShapeEncoder::default();
        enc.push(&smallvec![]);
        enc.push(&smallvec![]);
        assert_eq!(enc.num_samples(), 2);
        assert_eq!(enc.get(1), Some(&sh(&[])));
    }

    #[test]
    fn set_splits_a_run() {
        let mut enc = ShapeEncoder::default();
        for _ in 0..5 {
            enc.push(&sh(&[4]));
        }

        enc.set(2, &sh(&[9])).unwrap();
        assert_eq!(enc.rows.len(), 3);
        let shapes: Vec<_> = (0..5).map(|i| enc.get(i).unwrap()[0]).collect();
        assert_eq!(shapes, vec![4, 4, 9, 4, 4]);
    }

    #[test]
    fn set_at_run_edges() {
        let mut enc = ShapeEncoder::default();
        for _ in 0..3 {
            enc.push(&sh(&[4]));
        }

        enc.set(0, &sh(&[9])).unwrap();
        enc.set(2, &sh(&[9])).unwrap();
        let shapes: Vec<_> = (0..3).map(|i| enc.get(i).unwrap()[0]).collect();
        assert_eq!(shapes, vec![9, 4, 9]);
        assert_eq!(enc.rows.len(), 3);
    }

    #[test]
    fn set_merges_equal_neighbours() {
        let mut enc = ShapeEncoder::default();
        enc.push(&sh(&[4]));
        enc.push(&sh(&[9]));
        enc.push(&sh(&[4]));

        enc.set(1, &sh(&[4])).unwrap();
        assert_eq!(enc.rows.len(), 1);
        assert_eq!(enc.num_samples(), 3);
    }

    #[test]
    fn set_out_of_range() {
        let mut enc = ShapeEncoder::default();
        enc.push(&sh(&[4]));
        assert!(enc.set(1, &sh(&[9])).is_none());
    }

    #[test]
    fn serialization_roundtrip() {
        let mut enc = ShapeEncoder::default();
        for _ in 0..3 {
            enc.push(&sh(&[28, 28, 1]));
        }
        enc.push(&sh(&[32, 32, 1]));

        let mut buf = Vec::new();
        enc.write(&mut buf).unwrap();
        assert_eq!(buf.len(), enc.nbytes());

        let back = ShapeEncoder::from_reader(&mut buf.as_slice()).unwrap();
        assert_eq!(back, enc);
    }

    #[test]
    fn empty_roundtrip() {
        let enc = ShapeEncoder::default();
        let mut buf = Vec::new();
        enc.write(&mut buf).unwrap();
        let back = ShapeEncoder::from_reader(&mut buf.as_slice()).unwrap();
        assert_eq!(back, enc);
    }
}

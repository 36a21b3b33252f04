use ndarray::{ArrayD, IxDyn, SliceInfo, SliceInfoElem};

use crate::error::{Result, TensorError};

/// Addressing along one axis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexEntry {
    /// Single position; negative values count from the end.
    /// Squeezes the axis on read, like a bare integer index.
    Single(i64),
    /// Half-open range with step and optional bounds; negative values
    /// count from the end.
    Range {
        start: Option<i64>,
        stop: Option<i64>,
        step: i64,
    },
    /// Explicit positions. Only supported on the primary axis.
    List(Vec<i64>),
}

impl IndexEntry {
    pub fn full() -> Self {
        Self::Range {
            start: None,
            stop: None,
            step: 1,
        }
    }

    fn is_trivial(&self) -> bool {
        matches!(
            self,
            Self::Range {
                start: None,
                stop: None,
                step: 1
            }
        )
    }

    fn resolve(&self, length: u64) -> Result<Vec<u64>> {
        match self {
            Self::Single(i) => Ok(vec![wrap_index(*i, length)?]),
            Self::List(positions) => positions
                .iter()
                .map(|&i| wrap_index(i, length))
                .collect(),
            Self::Range { start, stop, step } => {
                if *step == 0 {
                    return Err(TensorError::Unsupported("index step cannot be zero"));
                }
                let len = length as i64;
                let mut out = Vec::new();
                if *step > 0 {
                    let lo = clamp_bound(start.unwrap_or(0), len, 0);
                    let hi = clamp_bound(stop.unwrap_or(len), len, 0);
                    let mut i = lo;
                    while i < hi {
                        out.push(i as u64);
                        i += step;
                    }
                } else {
                    let lo = clamp_bound(start.unwrap_or(len - 1), len, -1);
                    let hi = match stop {
                        Some(s) => clamp_bound(*s, len, -1),
                        None => -1,
                    };
                    let mut i = lo.min(len - 1);
                    while i > hi {
                        out.push(i as u64);
                        i += step;
                    }
                }
                Ok(out)
            }
        }
    }
}

fn wrap_index(i: i64, length: u64) -> Result<u64> {
    let len = length as i64;
    let wrapped = if i < 0 { i + len } else { i };
    if wrapped < 0 || wrapped >= len {
        return Err(TensorError::OutOfBounds { index: i, length });
    }
    Ok(wrapped as u64)
}

/// Clamp a range bound to `[floor, len]`, wrapping negatives first.
fn clamp_bound(bound: i64, len: i64, floor: i64) -> i64 {
    let wrapped = if bound < 0 { bound + len } else { bound };
    wrapped.clamp(floor, len)
}

/// A view selection: the first entry addresses the primary (sample) axis,
/// later entries slice within each sample at read time.
///
/// An empty index addresses every sample whole.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Index {
    entries: Vec<IndexEntry>,
}

impl Index {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn single(i: i64) -> Self {
        Self {
            entries: vec![IndexEntry::Single(i)],
        }
    }

    pub fn range(start: i64, stop: i64) -> Self {
        Self {
            entries: vec![IndexEntry::Range {
                start: Some(start),
                stop: Some(stop),
                step: 1,
            }],
        }
    }

    pub fn list(positions: Vec<i64>) -> Self {
        Self {
            entries: vec![IndexEntry::List(positions)],
        }
    }

    /// Add an entry for the next (trailing) axis.
    pub fn with(mut self, entry: IndexEntry) -> Self {
        if self.entries.is_empty() {
            self.entries.push(IndexEntry::full());
        }
        self.entries.push(entry);
        self
    }

    fn primary(&self) -> IndexEntry {
        self.entries.first().cloned().unwrap_or_else(IndexEntry::full)
    }

    /// Whether this selection takes whole samples, i.e. every trailing
    /// entry is trivial.
    pub fn is_single_dim_effective(&self) -> bool {
        self.entries.iter().skip(1).all(|e| e.is_trivial())
    }

    /// Whether the primary entry squeezes the sample axis.
    pub fn primary_is_single(&self) -> bool {
        matches!(self.entries.first(), Some(IndexEntry::Single(_)))
    }

    /// Global sample indices addressed against a tensor of `length` samples.
    pub fn resolve_primary(&self, length: u64) -> Result<Vec<u64>> {
        self.primary().resolve(length)
    }

    /// Number of samples addressed.
    pub fn length(&self, num_samples: u64) -> Result<u64> {
        Ok(self.resolve_primary(num_samples)?.len() as u64)
    }

    /// Slice one materialized sample by the trailing entries.
    ///
    /// [IndexEntry::Single] entries squeeze their axis; list entries on
    /// trailing axes are not supported.
    pub fn apply_trailing<T>(&self, sample: ArrayD<T>) -> Result<ArrayD<T>> {
        if self.is_single_dim_effective() {
            return Ok(sample);
        }
        if self.entries.len() - 1 > sample.ndim() {
            return Err(TensorError::InvalidShape(format!(
                "index has {} sample axes, sample has {}",
                self.entries.len() - 1,
                sample.ndim()
            )));
        }

        let mut elems = Vec::with_capacity(sample.ndim());
        for axis in 0..sample.ndim() {
            let dim = sample.shape()[axis] as i64;
            let elem = match self.entries.get(axis + 1) {
                None => SliceInfoElem::Slice {
                    start: 0,
                    end: None,
                    step: 1,
                },
                Some(IndexEntry::Single(i)) => {
                    let wrapped = wrap_index(*i, dim as u64)?;
                    SliceInfoElem::Index(wrapped as isize)
                }
                Some(IndexEntry::Range { start, stop, step }) => {
                    if *step <= 0 {
                        return Err(TensorError::Unsupported(
                            "trailing ranges must have a positive step",
                        ));
                    }
                    let lo = clamp_bound(start.unwrap_or(0), dim, 0);
                    let hi = clamp_bound(stop.unwrap_or(dim), dim, 0).max(lo);
                    SliceInfoElem::Slice {
                        start: lo as isize,
                        end: Some(hi as isize),
                        step: *step as isize,
                    }
                }
                Some(IndexEntry::List(_)) => {
                    return Err(TensorError::Unsupported(
                        "list indexing is only supported on the primary axis",
                    ))
                }
            };
            elems.push(elem);
        }

        let info: SliceInfo<Vec<SliceInfoElem>, IxDyn, IxDyn> = elems
            .try_into()
            .map_err(|_| TensorError::Unsupported("could not build slice"))?;
        Ok(sample.slice_move(info))
    }
}

impl From<i64> for Index {
    fn from(i: i64) -> Self {
        Self::single(i)
    }
}

impl From<std::ops::Range<i64>> for Index {
    fn from(r: std::ops::Range<i64>) -> Self {
        Self::range(r.start, r.end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn trivial_index_addresses_everything() {
        let idx = Index::all();
        assert_eq!(idx.resolve_primary(4).unwrap(), vec![0, 1, 2, 3]);
        assert_eq!(idx.length(4).unwrap(), 4);
        assert!(idx.is_single_dim_effective());
        assert!(!idx.primary_is_single());
    }

    #[test]
    fn single_wraps_negatives() {
        assert_eq!(Index::single(2).resolve_primary(4).unwrap(), vec![2]);
        assert_eq!(Index::single(-1).resolve_primary(4).unwrap(), vec![3]);
        assert!(Index::single(4).resolve_primary(4).is_err());
        assert!(Index::single(-5).resolve_primary(4).is_err());
    }

    #[test]
    fn ranges_clamp_like_slices() {
        assert_eq!(Index::range(1, 3).resolve_primary(4).unwrap(), vec![1, 2]);
        assert_eq!(Index::range(0, 99).resolve_primary(4).unwrap(), vec![0, 1, 2, 3]);
        assert_eq!(Index::range(-2, 99).resolve_primary(4).unwrap(), vec![2, 3]);
        assert!(Index::range(3, 1).resolve_primary(4).unwrap().is_empty());
    }

    #[test]
    fn stepped_and_reversed_ranges() {
        let every_other = Index {
            entries: vec![IndexEntry::Range {
                start: None,
                stop: None,
                step: 2,
            }],
        };
        assert_eq!(every_other.resolve_primary(5).unwrap(), vec![0, 2, 4]);

        let reversed = Index {
            entries: vec![IndexEntry::Range {
                start: None,
                stop: None,
                step: -1,
            }],
        };
        assert_eq!(reversed.resolve_primary(3).unwrap(), vec![2, 1, 0]);
    }

    #[test]
    fn list_entries_resolve_in_order() {
        let idx = Index::list(vec![3, 0, -1]);
        assert_eq!(idx.resolve_primary(4).unwrap(), vec![3, 0, 3]);
        assert!(Index::list(vec![9]).resolve_primary(4).is_err());
    }

    #[test]
    fn trailing_entries_are_detected() {
        let idx = Index::all().with(IndexEntry::Single(0));
        assert!(!idx.is_single_dim_effective());
        let idx = Index::all().with(IndexEntry::full());
        assert!(idx.is_single_dim_effective());
    }

    #[test]
    fn trailing_slice_applies_to_samples() {
        let sample = array![[1, 2, 3], [4, 5, 6]].into_dyn();

        let idx = Index::all().with(IndexEntry::Range {
            start: Some(1),
            stop: None,
            step: 1,
        });
        let sliced = idx.apply_trailing(sample.clone()).unwrap();
        assert_eq!(sliced, array![[4, 5, 6]].into_dyn());

        let idx = Index::all()
            .with(IndexEntry::Single(1))
            .with(IndexEntry::Single(-1));
        let picked = idx.apply_trailing(sample).unwrap();
        assert_eq!(picked.ndim(), 0);
        assert_eq!(picked.iter().next(), Some(&6));
    }

    #[test]
    fn trailing_bounds_are_checked() {
        let sample = array![[1, 2, 3], [4, 5, 6]].into_dyn();

        let idx = Index::all().with(IndexEntry::Single(5));
        assert!(matches!(
            idx.apply_trailing(sample.clone()),
            Err(TensorError::OutOfBounds { .. })
        ));

        // range bounds clamp instead of failing
        let idx = Index::all().with(IndexEntry::full()).with(IndexEntry::Range {
            start: Some(1),
            stop: Some(99),
            step: 1,
        });
        let sliced = idx.apply_trailing(sample).unwrap();
        assert_eq!(sliced, array![[2, 3], [5, 6]].into_dyn());
    }

    #[test]
    fn trailing_list_is_unsupported() {
        let sample = array![[1, 2], [3, 4]].into_dyn();
        let idx = Index::all().with(IndexEntry::List(vec![0]));
        assert!(matches!(
            idx.apply_trailing(sample),
            Err(TensorError::Unsupported(_))
        ));
    }

    #[test]
    fn too_many_axes_is_rejected() {
        let sample = array![1, 2].into_dyn();
        let idx = Index::all()
            .with(IndexEntry::Single(0))
            .with(IndexEntry::Single(0));
        assert!(matches!(
            idx.apply_trailing(sample),
            Err(TensorError::InvalidShape(_))
        ));
    }
}

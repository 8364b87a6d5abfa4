//! Data partitions: disjoint views of a data set for concurrent evaluation.
//!
//! A partition covers a contiguous block, an interleaved weave (every
//! `spacing`-th point from an offset) or an explicit index list, and owns a
//! copy of the data set's [`StatusManager`]. Partitions never own points; the
//! points are lent out by [`DataSet::partition_views`].

use crate::data::DataSet;
use crate::status::{StatusManager, VariableStatus};
use pwa_core::{Error, Result};
use std::collections::BTreeSet;

/// Points covered by a partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Coverage {
    /// `begin..end`
    Block {
        /// First covered index
        begin: usize,
        /// One past the last covered index
        end: usize,
    },
    /// `begin, begin + spacing, ...` below `end`
    Weave {
        /// First covered index
        begin: usize,
        /// Upper bound (exclusive)
        end: usize,
        /// Step between covered indices
        spacing: usize,
    },
    /// Explicit ascending index list
    Indices(Vec<usize>),
}

impl Coverage {
    fn size(&self) -> usize {
        match *self {
            Coverage::Block { begin, end } => end.saturating_sub(begin),
            Coverage::Weave { begin, end, spacing } => {
                if end <= begin {
                    0
                } else {
                    (end - begin).div_ceil(spacing)
                }
            }
            Coverage::Indices(ref v) => v.len(),
        }
    }

    #[inline]
    fn index_at(&self, ordinal: usize) -> usize {
        match *self {
            Coverage::Block { begin, .. } => begin + ordinal,
            Coverage::Weave { begin, spacing, .. } => begin + ordinal * spacing,
            Coverage::Indices(ref v) => v[ordinal],
        }
    }

    fn contains(&self, index: usize) -> bool {
        match *self {
            Coverage::Block { begin, end } => (begin..end).contains(&index),
            Coverage::Weave { begin, end, spacing } => {
                (begin..end).contains(&index) && (index - begin) % spacing == 0
            }
            Coverage::Indices(ref v) => v.binary_search(&index).is_ok(),
        }
    }
}

/// Forward iterator over the indices covered by a partition.
///
/// Restart by calling [`DataPartition::iter`] again.
#[derive(Debug, Clone)]
pub struct DataIterator<'a> {
    coverage: &'a Coverage,
    ordinal: usize,
    size: usize,
}

impl DataIterator<'_> {
    /// Number of steps from `self` to `later`.
    pub fn distance(&self, later: &DataIterator<'_>) -> isize {
        later.ordinal as isize - self.ordinal as isize
    }
}

impl Iterator for DataIterator<'_> {
    type Item = usize;

    #[inline]
    fn next(&mut self) -> Option<usize> {
        if self.ordinal >= self.size {
            return None;
        }
        let i = self.coverage.index_at(self.ordinal);
        self.ordinal += 1;
        Some(i)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.size - self.ordinal;
        (n, Some(n))
    }
}

impl ExactSizeIterator for DataIterator<'_> {}

/// A view over part of a data set with its own status manager.
#[derive(Debug, Clone)]
pub struct DataPartition {
    coverage: Coverage,
    status: StatusManager,
}

fn snapshot(data: &DataSet) -> StatusManager {
    let mut status = data.status().clone();
    status.set_all_variable(VariableStatus::Unchanged);
    status
}

impl DataPartition {
    fn new(coverage: Coverage, status: StatusManager) -> Self {
        Self { coverage, status }
    }

    /// One partition covering the whole data set.
    pub fn whole(data: &DataSet) -> Self {
        Self::new(Coverage::Block { begin: 0, end: data.len() }, snapshot(data))
    }

    /// `n` contiguous blocks; the last block takes the remainder.
    ///
    /// More blocks than points are clamped to one block per point.
    pub fn create_block(data: &DataSet, n: usize) -> Result<Vec<Self>> {
        if n == 0 {
            return Err(Error::Validation("number of partitions must be positive".to_string()));
        }
        let len = data.len();
        let n = if n > len && len > 0 {
            log::warn!("requested {n} block partitions for {len} data points; using {len}");
            len
        } else {
            n.min(len.max(1))
        };
        let size = len / n;
        let status = snapshot(data);
        let parts: Vec<Self> = (0..n)
            .map(|i| {
                let begin = i * size;
                let end = if i + 1 == n { len } else { begin + size };
                Self::new(Coverage::Block { begin, end }, status.clone())
            })
            .collect();
        log::debug!("created {} block partitions of {len} data points", parts.len());
        Ok(parts)
    }

    /// Contiguous blocks of `size` points; the last block may be shorter.
    pub fn create_block_by_size(data: &DataSet, size: usize) -> Result<Vec<Self>> {
        if size == 0 {
            return Err(Error::Validation("partition size must be positive".to_string()));
        }
        let len = data.len();
        let n = len.div_ceil(size).max(1);
        let status = snapshot(data);
        let parts: Vec<Self> = (0..n)
            .map(|i| {
                let begin = (i * size).min(len);
                let end = (begin + size).min(len);
                Self::new(Coverage::Block { begin, end }, status.clone())
            })
            .collect();
        log::debug!("created {} block partitions of at most {size} data points", parts.len());
        Ok(parts)
    }

    /// `n` interleaved partitions: partition `k` covers every point whose
    /// index is `k` modulo `n`.
    pub fn create_weave(data: &DataSet, n: usize) -> Result<Vec<Self>> {
        if n == 0 {
            return Err(Error::Validation("number of partitions must be positive".to_string()));
        }
        let len = data.len();
        let status = snapshot(data);
        let parts: Vec<Self> = (0..n)
            .map(|k| Self::new(Coverage::Weave { begin: k, end: len, spacing: n }, status.clone()))
            .collect();
        log::debug!("created {n} weave partitions of {len} data points");
        Ok(parts)
    }

    /// Covered indices.
    pub fn coverage(&self) -> &Coverage {
        &self.coverage
    }

    /// Iterator over covered indices, ascending.
    pub fn iter(&self) -> DataIterator<'_> {
        DataIterator { coverage: &self.coverage, ordinal: 0, size: self.coverage.size() }
    }

    /// Number of covered points.
    pub fn size(&self) -> usize {
        self.coverage.size()
    }

    /// `true` if no point is covered.
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// `true` if point `index` is covered.
    pub fn contains(&self, index: usize) -> bool {
        self.coverage.contains(index)
    }

    /// Partition of the points covered by `self` and not by `other`.
    ///
    /// The result carries a copy of `self`'s status manager.
    pub fn difference(&self, other: &DataPartition) -> DataPartition {
        let indices: Vec<usize> = match &other.coverage {
            Coverage::Indices(v) => {
                let theirs: BTreeSet<usize> = v.iter().copied().collect();
                self.iter().filter(|i| !theirs.contains(i)).collect()
            }
            c => self.iter().filter(|&i| !c.contains(i)).collect(),
        };
        Self::new(Coverage::Indices(indices), self.status.clone())
    }

    /// Status manager of the partition.
    pub fn status(&self) -> &StatusManager {
        &self.status
    }

    /// Mutable status manager of the partition.
    pub fn status_mut(&mut self) -> &mut StatusManager {
        &mut self.status
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(n: usize) -> DataSet {
        let mut d = DataSet::new(Default::default(), StatusManager::default(), 0);
        d.add_empty_data_points(n);
        d
    }

    fn covered(parts: &[DataPartition]) -> Vec<usize> {
        let mut all: Vec<usize> = parts.iter().flat_map(|p| p.iter()).collect();
        all.sort_unstable();
        all
    }

    #[test]
    fn test_block_last_takes_remainder() {
        let d = data(10);
        let parts = DataPartition::create_block(&d, 3).unwrap();
        let sizes: Vec<usize> = parts.iter().map(DataPartition::size).collect();
        assert_eq!(sizes, vec![3, 3, 4]);
        assert_eq!(covered(&parts), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_block_clamped_to_data_size() {
        let d = data(2);
        let parts = DataPartition::create_block(&d, 5).unwrap();
        assert_eq!(parts.len(), 2);
        assert!(DataPartition::create_block(&d, 0).is_err());
        let empty = DataPartition::create_block(&data(0), 4).unwrap();
        assert_eq!(empty.len(), 1);
        assert!(empty[0].is_empty());
    }

    #[test]
    fn test_block_by_size_does_not_overrun() {
        let d = data(7);
        let parts = DataPartition::create_block_by_size(&d, 3).unwrap();
        let sizes: Vec<usize> = parts.iter().map(DataPartition::size).collect();
        assert_eq!(sizes, vec![3, 3, 1]);
        assert_eq!(covered(&parts), (0..7).collect::<Vec<_>>());
    }

    #[test]
    fn test_weave_residue_classes() {
        let d = data(8);
        let parts = DataPartition::create_weave(&d, 3).unwrap();
        assert_eq!(parts[0].iter().collect::<Vec<_>>(), vec![0, 3, 6]);
        assert_eq!(parts[1].iter().collect::<Vec<_>>(), vec![1, 4, 7]);
        assert_eq!(parts[2].iter().collect::<Vec<_>>(), vec![2, 5]);
        assert!(parts[1].contains(4));
        assert!(!parts[1].contains(5));
    }

    #[test]
    fn test_iterator_is_restartable_and_measures_distance() {
        let d = data(5);
        let p = DataPartition::whole(&d);
        let start = p.iter();
        let mut it = p.iter();
        it.next();
        it.next();
        assert_eq!(start.distance(&it), 2);
        assert_eq!(it.len(), 3);
        assert_eq!(p.iter().count(), 5);
    }

    #[test]
    fn test_difference() {
        let d = data(10);
        let whole = DataPartition::whole(&d);
        let weave = DataPartition::create_weave(&d, 2).unwrap();
        let odd = whole.difference(&weave[0]);
        assert_eq!(odd.iter().collect::<Vec<_>>(), vec![1, 3, 5, 7, 9]);
        let none = odd.difference(&weave[1]);
        assert!(none.is_empty());
    }

    #[test]
    fn test_overlapping_views_rejected() {
        let mut d = data(4);
        let mut parts = vec![DataPartition::whole(&d), DataPartition::whole(&d)];
        let err = d.partition_views(&mut parts).unwrap_err();
        assert!(err.is_contract_violation());

        let mut parts = DataPartition::create_weave(&d, 2).unwrap();
        let views = d.partition_views(&mut parts).unwrap();
        assert_eq!(views.iter().map(|v| v.len()).collect::<Vec<_>>(), vec![2, 2]);
    }
}

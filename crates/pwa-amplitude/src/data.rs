//! Data points and data sets.
//!
//! A [`DataPoint`] is the flat cache storage of one event, laid out as
//! `[accessor][symmetrization index][position]`. A [`DataSet`] owns its points
//! and one [`StatusManager`] that holds the validity of every static value.

use crate::data_accessor::AccessorId;
use crate::four_vector::FourVector;
use crate::model::Model;
use crate::partition::DataPartition;
use crate::status::StatusManager;
use pwa_core::{Error, Result};

/// Cache storage of one event.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DataPoint {
    data: Vec<Vec<Vec<f64>>>,
}

impl DataPoint {
    pub(crate) fn with_layout(data: Vec<Vec<Vec<f64>>>) -> Self {
        Self { data }
    }

    /// Row of `accessor` at symmetrization index `sym`.
    #[inline]
    pub fn row(&self, accessor: AccessorId, sym: usize) -> Option<&[f64]> {
        self.data.get(accessor.index())?.get(sym).map(Vec::as_slice)
    }

    /// Mutable row of `accessor` at symmetrization index `sym`.
    #[inline]
    pub fn row_mut(&mut self, accessor: AccessorId, sym: usize) -> Option<&mut [f64]> {
        self.data.get_mut(accessor.index())?.get_mut(sym).map(Vec::as_mut_slice)
    }

    /// Total number of stored doubles.
    pub fn n_doubles(&self) -> usize {
        self.data.iter().flatten().map(Vec::len).sum()
    }
}

/// Mutable access to the points of one partition, with that partition's
/// status manager.
#[derive(Debug)]
pub struct PartitionView<'a> {
    pub(crate) points: Vec<&'a mut DataPoint>,
    pub(crate) status: &'a mut StatusManager,
}

impl PartitionView<'_> {
    /// Number of covered points.
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// `true` if the partition covers no points.
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Status manager of the partition.
    pub fn status(&self) -> &StatusManager {
        self.status
    }
}

/// Ordered, randomly indexable collection of data points of one model.
#[derive(Debug, Clone)]
pub struct DataSet {
    points: Vec<DataPoint>,
    status: StatusManager,
    template: DataPoint,
    n_final_state: usize,
}

impl DataSet {
    pub(crate) fn new(template: DataPoint, status: StatusManager, n_final_state: usize) -> Self {
        Self { points: Vec::new(), status, template, n_final_state }
    }

    /// Number of points.
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// `true` if the set holds no points.
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Number of final-state momenta each point takes.
    pub fn n_final_state(&self) -> usize {
        self.n_final_state
    }

    /// Point at `index`.
    pub fn point(&self, index: usize) -> Option<&DataPoint> {
        self.points.get(index)
    }

    /// All points in order.
    pub fn points(&self) -> &[DataPoint] {
        &self.points
    }

    /// Status manager of the static values.
    pub fn status(&self) -> &StatusManager {
        &self.status
    }

    /// Append `n` zero-filled points.
    pub fn add_empty_data_points(&mut self, n: usize) {
        self.points.reserve(n);
        self.points.extend(std::iter::repeat_n(self.template.clone(), n));
    }

    /// Append a point and fill its static values from `momenta`.
    ///
    /// Returns the index of the new point. On failure nothing is appended and
    /// the statuses of the points already in the set are untouched.
    pub fn add(&mut self, model: &Model, momenta: &[FourVector]) -> Result<usize> {
        let (point, status) = self.compute_static(model, self.template.clone(), momenta)?;
        self.points.push(point);
        self.status = status;
        Ok(self.points.len() - 1)
    }

    /// Set the final-state momenta of point `index` and recompute its static
    /// values. On failure the point and the statuses are left as they were.
    pub fn set_final_state_momenta(
        &mut self,
        model: &Model,
        index: usize,
        momenta: &[FourVector],
    ) -> Result<()> {
        let n = self.points.len();
        let point = self
            .points
            .get(index)
            .cloned()
            .ok_or_else(|| Error::Validation(format!("data point {index} out of range ({n})")))?;
        let (point, status) = self.compute_static(model, point, momenta)?;
        self.points[index] = point;
        self.status = status;
        Ok(())
    }

    /// Static pass over a scratch point and a scratch copy of the statuses.
    fn compute_static(
        &self,
        model: &Model,
        mut point: DataPoint,
        momenta: &[FourVector],
    ) -> Result<(DataPoint, StatusManager)> {
        if momenta.len() != self.n_final_state {
            return Err(Error::Validation(format!(
                "expected {} final-state momenta, got {}",
                self.n_final_state,
                momenta.len()
            )));
        }
        let mut status = self.status.clone();
        model.calculate_static(&mut point, momenta, &mut status)?;
        Ok((point, status))
    }

    /// Remove and return point `index`.
    pub fn remove(&mut self, index: usize) -> Result<DataPoint> {
        if index >= self.points.len() {
            return Err(Error::Validation(format!(
                "data point {index} out of range ({})",
                self.points.len()
            )));
        }
        Ok(self.points.remove(index))
    }

    /// Remove every point.
    pub fn clear(&mut self) {
        self.points.clear();
    }

    /// Release spare capacity.
    pub fn shrink_to_fit(&mut self) {
        self.points.shrink_to_fit();
    }

    /// Split the points among `partitions`.
    ///
    /// The partitions must be pairwise disjoint and lie inside the set; two
    /// views never alias a point. Points of each view keep ascending order.
    pub fn partition_views<'a>(
        &'a mut self,
        partitions: &'a mut [DataPartition],
    ) -> Result<Vec<PartitionView<'a>>> {
        let n = self.points.len();
        let mut owner: Vec<Option<usize>> = vec![None; n];
        for (p, partition) in partitions.iter().enumerate() {
            for i in partition.iter() {
                let slot = owner.get_mut(i).ok_or_else(|| {
                    Error::CacheContract(format!(
                        "partition {p} covers point {i} outside the data set ({n} points)"
                    ))
                })?;
                if let Some(q) = slot.replace(p) {
                    return Err(Error::CacheContract(format!(
                        "partitions {q} and {p} both cover point {i}"
                    )));
                }
            }
        }

        let mut points: Vec<Vec<&'a mut DataPoint>> =
            partitions.iter().map(|p| Vec::with_capacity(p.size())).collect();
        for (point, o) in self.points.iter_mut().zip(owner) {
            if let Some(p) = o {
                points[p].push(point);
            }
        }
        Ok(points
            .into_iter()
            .zip(partitions.iter_mut())
            .map(|(points, partition)| PartitionView { points, status: partition.status_mut() })
            .collect())
    }
}

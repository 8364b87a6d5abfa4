//! Cache-cell validity tracking.
//!
//! A [`StatusManager`] holds one cell per (data accessor, cached value,
//! symmetrization index). Each cell carries a [`VariableStatus`] and a
//! generation stamp; a column (one cached value across all its symmetrization
//! indices) carries the current generation. A cell is
//! [`CalculationStatus::Calculated`] iff its stamp equals its column's
//! generation, so invalidating a whole column is a single increment.
//!
//! Statuses are shared by all data points covered by one manager: a data set
//! owns one, and every partition owns its own copy.

use crate::cached_value::{CachedValueDependency, CachedValueId};
use crate::data_accessor::{AccessorId, AccessorRegistry};
use crate::parameter::{ParameterId, ParameterSet};
use crate::particle_combination::{ParticleCombinationCache, PcId};
use pwa_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Whether a cell holds a value computed under the current inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalculationStatus {
    /// Value is valid and may be read
    Calculated,
    /// Value must be recomputed before it is read
    Uncalculated,
}

/// Whether a value (or parameter) changed since it was last consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariableStatus {
    /// Changed since flags were last reset
    Changed,
    /// Same as when flags were last reset
    Unchanged,
    /// Never changes; assigning another status is a no-op
    Fixed,
}

impl VariableStatus {
    /// Assign `new` unless `self` is [`VariableStatus::Fixed`].
    #[inline]
    pub fn assign(&mut self, new: VariableStatus) {
        if *self != VariableStatus::Fixed {
            *self = new;
        }
    }
}

/// Status of one cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status {
    /// Calculation state
    pub calculation: CalculationStatus,
    /// Change state
    pub variable: VariableStatus,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}, {:?}", self.calculation, self.variable)
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Cell {
    stamp: u64,
    variable: VariableStatus,
}

#[derive(Debug, Clone, PartialEq)]
struct Column {
    generation: u64,
    cells: Vec<Cell>,
}

impl Column {
    fn new(n_symmetrizations: usize) -> Self {
        // generation starts above every initial stamp: all cells uncalculated
        Self {
            generation: 1,
            cells: vec![Cell { stamp: 0, variable: VariableStatus::Changed }; n_symmetrizations],
        }
    }

    #[inline]
    fn invalidate(&mut self) {
        self.generation += 1;
    }

    fn validate_all(&mut self) {
        let g = self.generation;
        self.cells.iter_mut().for_each(|c| c.stamp = g);
    }

    fn set(&mut self, status: CalculationStatus) {
        match status {
            CalculationStatus::Uncalculated => self.invalidate(),
            CalculationStatus::Calculated => self.validate_all(),
        }
    }
}

/// Validity matrix indexed by (accessor, cached value, symmetrization index).
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StatusManager {
    columns: Vec<Vec<Column>>,
}

impl StatusManager {
    /// Manager for accessors of the given shape.
    ///
    /// `shape[a] = (number of cached values, number of symmetrization indices)`.
    pub fn from_shape(shape: &[(usize, usize)]) -> Self {
        Self {
            columns: shape
                .iter()
                .map(|&(n_values, n_sym)| (0..n_values).map(|_| Column::new(n_sym)).collect())
                .collect(),
        }
    }

    fn column(&self, id: CachedValueId) -> Option<&Column> {
        self.columns.get(id.accessor().index()).and_then(|a| a.get(id.index()))
    }

    fn column_mut(&mut self, id: CachedValueId) -> Option<&mut Column> {
        self.columns.get_mut(id.accessor().index()).and_then(|a| a.get_mut(id.index()))
    }

    /// Full status of one cell.
    pub fn status(&self, id: CachedValueId, sym: usize) -> Result<Status> {
        let col = self.column(id).ok_or_else(|| {
            Error::CacheContract(format!("cached value {id} is unknown to this status manager"))
        })?;
        let cell = col.cells.get(sym).ok_or_else(|| {
            Error::CacheContract(format!(
                "symmetrization index {sym} out of range for cached value {id} ({} indices)",
                col.cells.len()
            ))
        })?;
        let calculation = if cell.stamp == col.generation {
            CalculationStatus::Calculated
        } else {
            CalculationStatus::Uncalculated
        };
        Ok(Status { calculation, variable: cell.variable })
    }

    /// Calculation status; cells outside the matrix read as uncalculated.
    #[inline]
    pub fn calculation(&self, id: CachedValueId, sym: usize) -> CalculationStatus {
        match self.column(id) {
            Some(col) if col.cells.get(sym).is_some_and(|c| c.stamp == col.generation) => {
                CalculationStatus::Calculated
            }
            _ => CalculationStatus::Uncalculated,
        }
    }

    /// Variable status; cells outside the matrix read as changed.
    #[inline]
    pub fn variable(&self, id: CachedValueId, sym: usize) -> VariableStatus {
        self.column(id)
            .and_then(|col| col.cells.get(sym))
            .map_or(VariableStatus::Changed, |c| c.variable)
    }

    /// Current generation of a column.
    pub fn generation(&self, id: CachedValueId) -> Option<u64> {
        self.column(id).map(|c| c.generation)
    }

    /// Mark one cell calculated.
    #[inline]
    pub fn mark_calculated(&mut self, id: CachedValueId, sym: usize) {
        if let Some(col) = self.column_mut(id) {
            let g = col.generation;
            if let Some(cell) = col.cells.get_mut(sym) {
                cell.stamp = g;
            }
        }
    }

    /// Mark one cell uncalculated.
    #[inline]
    pub fn mark_uncalculated(&mut self, id: CachedValueId, sym: usize) {
        if let Some(cell) = self.column_mut(id).and_then(|col| col.cells.get_mut(sym)) {
            cell.stamp = 0;
        }
    }

    /// Set the variable status of one cell (fixed cells stay fixed).
    #[inline]
    pub fn set_variable(&mut self, id: CachedValueId, sym: usize, status: VariableStatus) {
        if let Some(cell) = self.column_mut(id).and_then(|col| col.cells.get_mut(sym)) {
            cell.variable.assign(status);
        }
    }

    /// Set the calculation status of every cell of one cached value.
    ///
    /// Marking uncalculated is O(1).
    pub fn set_calculation(&mut self, id: CachedValueId, status: CalculationStatus) {
        if let Some(col) = self.column_mut(id) {
            col.set(status);
        }
    }

    /// Set the calculation status of every cell of one accessor.
    pub fn set_accessor_calculation(&mut self, accessor: AccessorId, status: CalculationStatus) {
        if let Some(cols) = self.columns.get_mut(accessor.index()) {
            cols.iter_mut().for_each(|c| c.set(status));
        }
    }

    /// Set the variable status of every cell of one accessor.
    pub fn set_accessor_variable(&mut self, accessor: AccessorId, status: VariableStatus) {
        if let Some(cols) = self.columns.get_mut(accessor.index()) {
            cols.iter_mut()
                .flat_map(|c| c.cells.iter_mut())
                .for_each(|cell| cell.variable.assign(status));
        }
    }

    /// Set the calculation status of every cell.
    pub fn set_all_calculation(&mut self, status: CalculationStatus) {
        self.columns.iter_mut().flatten().for_each(|c| c.set(status));
    }

    /// Set the variable status of every cell (fixed cells stay fixed).
    pub fn set_all_variable(&mut self, status: VariableStatus) {
        self.columns
            .iter_mut()
            .flatten()
            .flat_map(|c| c.cells.iter_mut())
            .for_each(|cell| cell.variable.assign(status));
    }

    /// Copy calculation statuses (not variable statuses) from `other`.
    ///
    /// Both managers must have the same shape.
    pub fn copy_calculation_statuses(&mut self, other: &StatusManager) -> Result<()> {
        let mismatch = || Error::CacheContract("status manager size mismatch".to_string());
        if self.columns.len() != other.columns.len() {
            return Err(mismatch());
        }
        for (mine, theirs) in self.columns.iter().zip(&other.columns) {
            if mine.len() != theirs.len()
                || mine.iter().zip(theirs).any(|(a, b)| a.cells.len() != b.cells.len())
            {
                return Err(mismatch());
            }
        }
        for (mine, theirs) in self.columns.iter_mut().flatten().zip(other.columns.iter().flatten())
        {
            let g = mine.generation;
            for (cell, src) in mine.cells.iter_mut().zip(&theirs.cells) {
                cell.stamp = if src.stamp == theirs.generation { g } else { 0 };
            }
        }
        Ok(())
    }

    /// Propagate parameter changes and cached-value dependencies into cells.
    ///
    /// For every cached value of every accessor in `accessors`: a changed
    /// parameter dependency invalidates the whole column at once; otherwise
    /// each cell is invalidated if any cached value it depends on (for the
    /// same combination, or for one of its daughters) is uncalculated or
    /// changed.
    pub fn update_calculation_statuses(
        &mut self,
        registry: &AccessorRegistry,
        cache: &ParticleCombinationCache,
        parameters: &ParameterSet,
        accessors: impl IntoIterator<Item = AccessorId>,
    ) {
        for a in accessors {
            let accessor = &registry[a];
            for cv in accessor.values() {
                let changed =
                    |p: &ParameterId| parameters.status(*p) == Some(VariableStatus::Changed);
                if cv.parameter_dependencies().iter().any(changed) {
                    self.set_calculation(cv.id(), CalculationStatus::Uncalculated);
                    continue;
                }
                for (pc, sym) in accessor.symmetrization_indices() {
                    self.update_cell(registry, cache, cv.id(), pc, sym);
                }
            }
        }
    }

    fn update_cell(
        &mut self,
        registry: &AccessorRegistry,
        cache: &ParticleCombinationCache,
        id: CachedValueId,
        pc: PcId,
        sym: usize,
    ) {
        if self.calculation(id, sym) == CalculationStatus::Uncalculated {
            return;
        }
        let Some(cv) = registry.value(id) else { return };
        for dep in cv.dependencies() {
            let (dep_id, dep_pc) = match *dep {
                CachedValueDependency::SameCombination(c) => (c, pc),
                CachedValueDependency::Daughter { value, daughter } => {
                    let Some(dpc) = cache.find(pc).and_then(|p| p.daughters().get(daughter))
                    else {
                        continue;
                    };
                    (value, *dpc)
                }
            };
            let dep_sym = if dep_id.accessor() == id.accessor() && dep_pc == pc {
                sym
            } else {
                match registry[dep_id.accessor()].symmetrization_index(dep_pc) {
                    Some(s) => s,
                    None => continue,
                }
            };
            self.update_cell(registry, cache, dep_id, dep_pc, dep_sym);
            if self.calculation(dep_id, dep_sym) == CalculationStatus::Uncalculated
                || self.variable(dep_id, dep_sym) == VariableStatus::Changed
            {
                self.mark_uncalculated(id, sym);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cached_value::CachedValueId;
    use crate::data_accessor::AccessorId;

    fn id(a: usize, v: usize) -> CachedValueId {
        CachedValueId::new(AccessorId::new(a), v)
    }

    #[test]
    fn test_new_cells_are_uncalculated_and_changed() {
        let sm = StatusManager::from_shape(&[(2, 3)]);
        let s = sm.status(id(0, 1), 2).unwrap();
        assert_eq!(s.calculation, CalculationStatus::Uncalculated);
        assert_eq!(s.variable, VariableStatus::Changed);
        assert!(sm.status(id(0, 2), 0).is_err());
        assert!(sm.status(id(0, 0), 3).is_err());
    }

    #[test]
    fn test_column_invalidation_is_a_generation_bump() {
        let mut sm = StatusManager::from_shape(&[(1, 4)]);
        for s in 0..4 {
            sm.mark_calculated(id(0, 0), s);
        }
        let g = sm.generation(id(0, 0)).unwrap();
        sm.set_calculation(id(0, 0), CalculationStatus::Uncalculated);
        assert_eq!(sm.generation(id(0, 0)), Some(g + 1));
        assert!((0..4).all(|s| sm.calculation(id(0, 0), s) == CalculationStatus::Uncalculated));
        sm.mark_calculated(id(0, 0), 1);
        assert_eq!(sm.calculation(id(0, 0), 1), CalculationStatus::Calculated);
        assert_eq!(sm.calculation(id(0, 0), 0), CalculationStatus::Uncalculated);
    }

    #[test]
    fn test_fixed_cells_stay_fixed() {
        let mut sm = StatusManager::from_shape(&[(1, 2)]);
        sm.set_variable(id(0, 0), 0, VariableStatus::Fixed);
        sm.set_all_variable(VariableStatus::Unchanged);
        assert_eq!(sm.variable(id(0, 0), 0), VariableStatus::Fixed);
        assert_eq!(sm.variable(id(0, 0), 1), VariableStatus::Unchanged);
    }

    #[test]
    fn test_copy_calculation_statuses() {
        let mut a = StatusManager::from_shape(&[(1, 2), (2, 1)]);
        let mut b = a.clone();
        b.set_calculation(id(1, 1), CalculationStatus::Uncalculated);
        b.mark_calculated(id(0, 0), 1);
        b.mark_calculated(id(1, 0), 0);
        a.copy_calculation_statuses(&b).unwrap();
        assert_eq!(a.calculation(id(0, 0), 0), CalculationStatus::Uncalculated);
        assert_eq!(a.calculation(id(0, 0), 1), CalculationStatus::Calculated);
        assert_eq!(a.calculation(id(1, 0), 0), CalculationStatus::Calculated);
        assert_eq!(a.calculation(id(1, 1), 0), CalculationStatus::Uncalculated);

        let c = StatusManager::from_shape(&[(1, 3), (2, 1)]);
        assert!(a.copy_calculation_statuses(&c).unwrap_err().is_contract_violation());
    }
}

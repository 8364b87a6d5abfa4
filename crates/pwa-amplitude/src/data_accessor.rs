//! Data accessors: computation units owning cached values.
//!
//! Each accessor maps the particle combinations it applies to onto dense
//! symmetrization indices. Combinations that are equivalent under the
//! accessor's [`Equivalence`] share an index, and therefore share storage and
//! computation.

use crate::cached_value::{
    CachedRepr, CachedValue, CachedValueDependency, CachedValueId, FourVectorValue, RealValue,
    TypedValue,
};
use crate::data::DataPoint;
use crate::four_vector::FourVector;
use crate::parameter::{ParameterId, ParameterSet};
use crate::particle_combination::{Equivalence, ParticleCombinationCache, PcId};
use crate::status::StatusManager;
use pwa_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::Index;

/// Stable index of an accessor within its registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AccessorId(usize);

impl AccessorId {
    pub(crate) fn new(index: usize) -> Self {
        Self(index)
    }

    /// Position in the registry.
    #[inline]
    pub fn index(self) -> usize {
        self.0
    }
}

/// When an accessor computes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessorKind {
    /// Once per data point, when its momenta are set
    Static,
    /// On every evaluation pass whose inputs changed
    Recalculable,
}

/// A registered computation unit.
#[derive(Debug, Clone)]
pub struct DataAccessor {
    id: AccessorId,
    name: String,
    kind: AccessorKind,
    equivalence: Equivalence,
    symmetrization: BTreeMap<PcId, usize>,
    n_symmetrizations: usize,
    values: Vec<CachedValue>,
    size: usize,
}

impl DataAccessor {
    fn new(id: AccessorId, name: &str, kind: AccessorKind, equivalence: Equivalence) -> Self {
        Self {
            id,
            name: name.to_string(),
            kind,
            equivalence,
            symmetrization: BTreeMap::new(),
            n_symmetrizations: 0,
            values: Vec::new(),
            size: 0,
        }
    }

    /// Registry index.
    pub fn id(&self) -> AccessorId {
        self.id
    }

    /// Name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Static or recalculable.
    pub fn kind(&self) -> AccessorKind {
        self.kind
    }

    /// Rule for sharing symmetrization indices.
    pub fn equivalence(&self) -> Equivalence {
        self.equivalence
    }

    /// Number of doubles per symmetrization index.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of distinct symmetrization indices.
    pub fn n_symmetrizations(&self) -> usize {
        self.n_symmetrizations
    }

    /// Registered cached values, in position order.
    pub fn values(&self) -> &[CachedValue] {
        &self.values
    }

    /// Symmetrization index of `pc`, if registered.
    #[inline]
    pub fn symmetrization_index(&self, pc: PcId) -> Option<usize> {
        self.symmetrization.get(&pc).copied()
    }

    /// `true` if `pc` is registered.
    pub fn has_particle_combination(&self, pc: PcId) -> bool {
        self.symmetrization.contains_key(&pc)
    }

    /// `(combination, symmetrization index)` pairs in id order.
    pub fn symmetrization_indices(&self) -> impl Iterator<Item = (PcId, usize)> + '_ {
        self.symmetrization.iter().map(|(&pc, &s)| (pc, s))
    }

    /// One representative combination per symmetrization index.
    pub fn representatives(&self) -> Vec<PcId> {
        let mut reps: Vec<Option<PcId>> = vec![None; self.n_symmetrizations];
        for (&pc, &s) in &self.symmetrization {
            reps[s].get_or_insert(pc);
        }
        reps.into_iter().flatten().collect()
    }

    /// Register `pc`, reusing the index of an already registered equivalent
    /// combination. Returns the symmetrization index.
    pub fn add_particle_combination(
        &mut self,
        cache: &ParticleCombinationCache,
        pc: PcId,
    ) -> Result<usize> {
        cache.get(pc)?;
        if let Some(s) = self.symmetrization_index(pc) {
            return Ok(s);
        }
        let shared = self
            .symmetrization
            .iter()
            .find(|(other, _)| cache.equivalent(self.equivalence, pc, **other))
            .map(|(_, &s)| s);
        let s = shared.unwrap_or_else(|| {
            self.n_symmetrizations += 1;
            self.n_symmetrizations - 1
        });
        self.symmetrization.insert(pc, s);
        Ok(s)
    }

    pub(crate) fn push_value<T: CachedRepr>(
        &mut self,
        name: &str,
        parameters: Vec<ParameterId>,
        dependencies: Vec<CachedValueDependency>,
    ) -> TypedValue<T> {
        let id = CachedValueId::new(self.id, self.values.len());
        let position = self.size;
        self.values.push(CachedValue {
            id,
            name: name.to_string(),
            kind: T::KIND,
            position,
            parameters,
            dependencies,
        });
        self.size += T::KIND.components();
        TypedValue::new(id, position)
    }

    /// Drop combinations that have expired or do not trace back to a
    /// combination of all `n_final_state` particles, then renumber the
    /// remaining indices densely in their original order.
    ///
    /// Returns the number of combinations removed.
    pub fn prune_symmetrization_indices(
        &mut self,
        cache: &ParticleCombinationCache,
        n_final_state: usize,
    ) -> usize {
        let before = self.symmetrization.len();
        self.symmetrization.retain(|&pc, _| {
            cache.is_live(pc)
                && cache.find(cache.origin(pc)).is_some_and(|o| o.indices().len() == n_final_state)
        });

        let mut used: Vec<usize> = self.symmetrization.values().copied().collect();
        used.sort_unstable();
        used.dedup();
        let renumber: BTreeMap<usize, usize> =
            used.iter().enumerate().map(|(new, &old)| (old, new)).collect();
        for s in self.symmetrization.values_mut() {
            *s = renumber[&*s];
        }
        self.n_symmetrizations = used.len();

        let removed = before - self.symmetrization.len();
        if removed > 0 {
            log::debug!("{}: pruned {removed} particle combinations", self.name);
        }
        removed
    }
}

/// Model state visible to an [`AccessorCalculation`].
#[derive(Debug, Clone, Copy)]
pub struct AccessorContext<'a> {
    /// Accessor being computed
    pub accessor: &'a DataAccessor,
    /// Every accessor of the model
    pub registry: &'a AccessorRegistry,
    /// Particle combinations of the model
    pub cache: &'a ParticleCombinationCache,
    /// Current parameter values
    pub parameters: &'a ParameterSet,
    four_momenta: AccessorId,
    momentum: FourVectorValue,
    mass: RealValue,
}

impl<'a> AccessorContext<'a> {
    pub(crate) fn new(
        accessor: &'a DataAccessor,
        registry: &'a AccessorRegistry,
        cache: &'a ParticleCombinationCache,
        parameters: &'a ParameterSet,
        momentum: FourVectorValue,
        mass: RealValue,
    ) -> Self {
        let four_momenta = momentum.id().accessor();
        Self { accessor, registry, cache, parameters, four_momenta, momentum, mass }
    }

    fn four_momentum_sym(&self, pc: PcId) -> Result<usize> {
        self.registry[self.four_momenta].symmetrization_index(pc).ok_or_else(|| {
            Error::CacheContract(format!("{pc} has no four-momentum registered"))
        })
    }

    /// Cached four-momentum of `pc`.
    pub fn four_momentum(
        &self,
        point: &DataPoint,
        pc: PcId,
        status: &StatusManager,
    ) -> Result<FourVector> {
        self.momentum.read(point, self.four_momentum_sym(pc)?, status)
    }

    /// Cached invariant mass of `pc`.
    pub fn mass(&self, point: &DataPoint, pc: PcId, status: &StatusManager) -> Result<f64> {
        self.mass.read(point, self.four_momentum_sym(pc)?, status)
    }
}

/// Computation of a user-registered accessor.
///
/// Static accessors run once per data point when its momenta are set.
/// Recalculable accessors run for every symmetrization index with an
/// uncalculated value, over all points of a partition. Each call must
/// store every value of the accessor through [`TypedValue::set_value`].
pub trait AccessorCalculation: Send + Sync {
    /// Compute the values of `pc` at symmetrization index `sym` of `point`.
    fn calculate(
        &self,
        ctx: &AccessorContext<'_>,
        point: &mut DataPoint,
        pc: PcId,
        sym: usize,
        status: &mut StatusManager,
    ) -> Result<()>;
}

/// All accessors of one model.
#[derive(Debug, Clone, Default)]
pub struct AccessorRegistry {
    accessors: Vec<DataAccessor>,
    locked: bool,
}

impl AccessorRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new accessor.
    pub fn add(&mut self, name: &str, kind: AccessorKind, equivalence: Equivalence) -> AccessorId {
        self.push(name, kind, equivalence).id
    }

    pub(crate) fn push(
        &mut self,
        name: &str,
        kind: AccessorKind,
        equivalence: Equivalence,
    ) -> &mut DataAccessor {
        let id = AccessorId(self.accessors.len());
        self.accessors.push(DataAccessor::new(id, name, kind, equivalence));
        let last = self.accessors.len() - 1;
        &mut self.accessors[last]
    }

    /// Accessor by id.
    pub fn get(&self, id: AccessorId) -> Option<&DataAccessor> {
        self.accessors.get(id.0)
    }

    fn get_mut(&mut self, id: AccessorId) -> Result<&mut DataAccessor> {
        self.accessors
            .get_mut(id.0)
            .ok_or_else(|| Error::Configuration(format!("unknown data accessor {}", id.0)))
    }

    /// Number of accessors.
    pub fn len(&self) -> usize {
        self.accessors.len()
    }

    /// `true` if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.accessors.is_empty()
    }

    /// Accessors in index order.
    pub fn iter(&self) -> impl Iterator<Item = &DataAccessor> + '_ {
        self.accessors.iter()
    }

    /// Registration record of a cached value.
    pub fn value(&self, id: CachedValueId) -> Option<&CachedValue> {
        self.accessors.get(id.accessor().0).and_then(|a| a.values.get(id.index()))
    }

    /// `true` once storage layout is frozen.
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Register a cached value under `accessor`, at the next free position.
    pub fn add_cached_value<T: CachedRepr>(
        &mut self,
        accessor: AccessorId,
        name: &str,
        parameters: Vec<ParameterId>,
        dependencies: Vec<CachedValueDependency>,
    ) -> Result<TypedValue<T>> {
        if self.locked {
            return Err(Error::Configuration(format!(
                "cannot add cached value {name}: storage layout is locked"
            )));
        }
        let n_existing = self
            .get(accessor)
            .ok_or_else(|| Error::Configuration(format!("unknown data accessor {}", accessor.0)))?
            .values
            .len();
        for dep in &dependencies {
            let upstream = dep.value();
            let known = if upstream.accessor() == accessor {
                upstream.index() < n_existing
            } else {
                self.value(upstream).is_some()
            };
            if !known {
                return Err(Error::Configuration(format!(
                    "cached value {name} depends on unknown cached value {upstream}"
                )));
            }
        }
        Ok(self.get_mut(accessor)?.push_value(name, parameters, dependencies))
    }

    /// Register `pc` with `accessor`.
    pub fn add_particle_combination(
        &mut self,
        accessor: AccessorId,
        cache: &ParticleCombinationCache,
        pc: PcId,
    ) -> Result<usize> {
        if self.locked {
            return Err(Error::Configuration(
                "cannot add particle combination: storage layout is locked".to_string(),
            ));
        }
        self.get_mut(accessor)?.add_particle_combination(cache, pc)
    }

    /// Prune every accessor; see [`DataAccessor::prune_symmetrization_indices`].
    pub fn prune(&mut self, cache: &ParticleCombinationCache, n_final_state: usize) -> usize {
        self.accessors
            .iter_mut()
            .map(|a| a.prune_symmetrization_indices(cache, n_final_state))
            .sum()
    }

    /// Freeze the storage layout.
    pub fn lock(&mut self) {
        self.locked = true;
    }

    /// Status manager matching the current layout, all cells uncalculated.
    pub fn status_manager(&self) -> StatusManager {
        let shape: Vec<(usize, usize)> =
            self.accessors.iter().map(|a| (a.values.len(), a.n_symmetrizations)).collect();
        StatusManager::from_shape(&shape)
    }

    /// Zero-filled data point matching the current layout.
    pub fn empty_data_point(&self) -> DataPoint {
        DataPoint::with_layout(
            self.accessors.iter().map(|a| vec![vec![0.0; a.size]; a.n_symmetrizations]).collect(),
        )
    }

    /// Ids of all accessors of `kind`.
    pub fn of_kind(&self, kind: AccessorKind) -> Vec<AccessorId> {
        self.accessors.iter().filter(|a| a.kind == kind).map(|a| a.id).collect()
    }
}

impl Index<AccessorId> for AccessorRegistry {
    type Output = DataAccessor;

    fn index(&self, id: AccessorId) -> &DataAccessor {
        &self.accessors[id.0]
    }
}

//! Typed, positioned storage slots inside a [`DataPoint`].
//!
//! A cached value occupies `kind.components()` consecutive doubles at a fixed
//! position within its accessor's per-symmetrization row of every data point.
//! Reads through a [`StatusManager`] fail on uncalculated cells; writes through
//! one record whether the stored number actually changed.

use crate::data::DataPoint;
use crate::data_accessor::AccessorId;
use crate::four_vector::FourVector;
use crate::parameter::ParameterId;
use crate::status::{CalculationStatus, StatusManager, VariableStatus};
use num_complex::Complex64;
use pwa_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;

/// Address of a cached value: owning accessor and index within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CachedValueId {
    accessor: AccessorId,
    index: usize,
}

impl CachedValueId {
    /// Address the `index`-th value of `accessor`.
    pub fn new(accessor: AccessorId, index: usize) -> Self {
        Self { accessor, index }
    }

    /// Owning accessor.
    #[inline]
    pub fn accessor(&self) -> AccessorId {
        self.accessor
    }

    /// Index within the owning accessor.
    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }
}

impl fmt::Display for CachedValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.accessor.index(), self.index)
    }
}

/// Scalar layout of a cached value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    /// One double
    Real,
    /// Real and imaginary part
    Complex,
    /// `(E, px, py, pz)`
    FourVector,
}

impl ValueKind {
    /// Number of doubles occupied.
    pub fn components(self) -> usize {
        match self {
            ValueKind::Real => 1,
            ValueKind::Complex => 2,
            ValueKind::FourVector => 4,
        }
    }
}

/// Upstream cached value a value is computed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachedValueDependency {
    /// Same particle combination
    SameCombination(CachedValueId),
    /// The given daughter of the particle combination
    Daughter {
        /// Upstream value
        value: CachedValueId,
        /// Daughter position
        daughter: usize,
    },
}

impl CachedValueDependency {
    /// Upstream value.
    pub fn value(&self) -> CachedValueId {
        match *self {
            CachedValueDependency::SameCombination(v) => v,
            CachedValueDependency::Daughter { value, .. } => value,
        }
    }
}

/// Registration record of a cached value.
#[derive(Debug, Clone)]
pub struct CachedValue {
    pub(crate) id: CachedValueId,
    pub(crate) name: String,
    pub(crate) kind: ValueKind,
    pub(crate) position: usize,
    pub(crate) parameters: Vec<ParameterId>,
    pub(crate) dependencies: Vec<CachedValueDependency>,
}

impl CachedValue {
    /// Address.
    pub fn id(&self) -> CachedValueId {
        self.id
    }

    /// Name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Scalar layout.
    pub fn kind(&self) -> ValueKind {
        self.kind
    }

    /// Offset of the first component within the accessor row.
    pub fn position(&self) -> usize {
        self.position
    }

    /// Parameters whose change invalidates this value.
    pub fn parameter_dependencies(&self) -> &[ParameterId] {
        &self.parameters
    }

    /// Cached values this value is computed from.
    pub fn dependencies(&self) -> &[CachedValueDependency] {
        &self.dependencies
    }

    /// Typed handle; `T` must match the registered layout.
    pub fn typed<T: CachedRepr>(&self) -> Result<TypedValue<T>> {
        if T::KIND != self.kind {
            return Err(Error::Configuration(format!(
                "cached value {} is {:?}, not {:?}",
                self.name,
                self.kind,
                T::KIND
            )));
        }
        Ok(TypedValue::new(self.id, self.position))
    }
}

/// Rust type stored by a cached value.
pub trait CachedRepr: Copy + PartialEq + Send + Sync + 'static {
    /// Matching layout
    const KIND: ValueKind;

    /// Decode from `KIND.components()` doubles.
    fn read(slot: &[f64]) -> Self;

    /// Encode into `slot`; returns `true` if any component changed.
    fn write(&self, slot: &mut [f64]) -> bool;
}

impl CachedRepr for f64 {
    const KIND: ValueKind = ValueKind::Real;

    #[inline]
    fn read(slot: &[f64]) -> Self {
        slot[0]
    }

    #[inline]
    fn write(&self, slot: &mut [f64]) -> bool {
        let changed = slot[0] != *self;
        slot[0] = *self;
        changed
    }
}

impl CachedRepr for Complex64 {
    const KIND: ValueKind = ValueKind::Complex;

    #[inline]
    fn read(slot: &[f64]) -> Self {
        Complex64::new(slot[0], slot[1])
    }

    #[inline]
    fn write(&self, slot: &mut [f64]) -> bool {
        let changed = slot[0] != self.re || slot[1] != self.im;
        slot[0] = self.re;
        slot[1] = self.im;
        changed
    }
}

impl CachedRepr for FourVector {
    const KIND: ValueKind = ValueKind::FourVector;

    #[inline]
    fn read(slot: &[f64]) -> Self {
        FourVector::new(slot[0], slot[1], slot[2], slot[3])
    }

    #[inline]
    fn write(&self, slot: &mut [f64]) -> bool {
        let mut changed = false;
        for (s, v) in slot.iter_mut().zip(self.iter()) {
            changed |= *s != *v;
            *s = *v;
        }
        changed
    }
}

/// Typed handle to a registered cached value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypedValue<T> {
    id: CachedValueId,
    position: usize,
    _repr: PhantomData<fn() -> T>,
}

/// Real cached value
pub type RealValue = TypedValue<f64>;
/// Complex cached value
pub type ComplexValue = TypedValue<Complex64>;
/// Four-vector cached value
pub type FourVectorValue = TypedValue<FourVector>;

impl<T: CachedRepr> TypedValue<T> {
    pub(crate) fn new(id: CachedValueId, position: usize) -> Self {
        Self { id, position, _repr: PhantomData }
    }

    /// Address.
    #[inline]
    pub fn id(&self) -> CachedValueId {
        self.id
    }

    fn slot<'a>(&self, point: &'a DataPoint, sym: usize) -> Result<&'a [f64]> {
        point
            .row(self.id.accessor(), sym)
            .and_then(|row| row.get(self.position..self.position + T::KIND.components()))
            .ok_or_else(|| self.out_of_layout(sym))
    }

    fn slot_mut<'a>(&self, point: &'a mut DataPoint, sym: usize) -> Result<&'a mut [f64]> {
        let n = T::KIND.components();
        let position = self.position;
        let err = self.out_of_layout(sym);
        point
            .row_mut(self.id.accessor(), sym)
            .and_then(|row| row.get_mut(position..position + n))
            .ok_or(err)
    }

    fn out_of_layout(&self, sym: usize) -> Error {
        Error::CacheContract(format!(
            "cached value {} at symmetrization index {sym} lies outside the data point layout",
            self.id
        ))
    }

    /// Stored value, without a status check.
    pub fn value(&self, point: &DataPoint, sym: usize) -> Result<T> {
        self.slot(point, sym).map(T::read)
    }

    /// Stored value; reading an uncalculated cell is a contract violation.
    #[inline]
    pub fn read(&self, point: &DataPoint, sym: usize, status: &StatusManager) -> Result<T> {
        if status.calculation(self.id, sym) == CalculationStatus::Uncalculated {
            return Err(Error::CacheContract(format!(
                "read of uncalculated cached value {} at symmetrization index {sym}",
                self.id
            )));
        }
        self.value(point, sym)
    }

    /// Store without touching any status.
    pub fn store(&self, val: T, point: &mut DataPoint, sym: usize) -> Result<()> {
        val.write(self.slot_mut(point, sym)?);
        Ok(())
    }

    /// Store, flag the cell changed if the number differs, then mark it calculated.
    #[inline]
    pub fn set_value(
        &self,
        val: T,
        point: &mut DataPoint,
        sym: usize,
        status: &mut StatusManager,
    ) -> Result<()> {
        if val.write(self.slot_mut(point, sym)?) {
            status.set_variable(self.id, sym, VariableStatus::Changed);
        }
        status.mark_calculated(self.id, sym);
        Ok(())
    }
}

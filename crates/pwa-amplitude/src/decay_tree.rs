//! Decay trees: one interfering decay path of a model.
//!
//! For a particle combination `pc` a tree evaluates
//!
//! ```text
//! A(pc) = free amplitude · Π free amplitudes of daughter trees
//!       · spin amplitude(pc) · Π line shapes(pc) · Π daughter A'(pc.daughters[k])
//! ```
//!
//! where the free amplitudes form the data-independent factor and the rest is
//! read from cached values. Daughter trees are shared between parent trees.

use crate::cached_value::ComplexValue;
use crate::data::DataPoint;
use crate::data_accessor::{AccessorId, AccessorRegistry};
use crate::model::{ChannelId, ParticleId};
use crate::parameter::{ParameterId, ParameterSet};
use crate::particle_combination::{ParticleCombinationCache, PcId};
use crate::spin::SpinProjection;
use crate::status::{StatusManager, VariableStatus};
use num_complex::Complex64;
use pwa_core::{Error, Result};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Read-only state an amplitude is evaluated against.
#[derive(Clone, Copy)]
pub struct AmplitudeContext<'a> {
    /// Accessors of the model
    pub registry: &'a AccessorRegistry,
    /// Particle combinations of the model
    pub cache: &'a ParticleCombinationCache,
    /// Validity of the cached values being read
    pub status: &'a StatusManager,
}

impl AmplitudeContext<'_> {
    fn symmetrization_index(&self, accessor: AccessorId, pc: PcId) -> Result<usize> {
        self.registry.get(accessor).and_then(|a| a.symmetrization_index(pc)).ok_or_else(|| {
            Error::CacheContract(format!("{pc} is not registered with data accessor {accessor:?}"))
        })
    }

    fn read(&self, factor: &CachedFactor, point: &DataPoint, pc: PcId) -> Result<Complex64> {
        let sym = self.symmetrization_index(factor.accessor, pc)?;
        factor.value.read(point, sym, self.status)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct CachedFactor {
    pub(crate) accessor: AccessorId,
    pub(crate) value: ComplexValue,
    pub(crate) parameters: Vec<ParameterId>,
}

/// Daughter of a decay tree node.
#[derive(Debug, Clone)]
pub enum Daughter {
    /// Final-state particle with a fixed spin projection
    Final {
        /// Particle
        particle: ParticleId,
        /// Particle name
        name: String,
        /// `2M`
        two_m: i32,
    },
    /// Decaying particle
    Decay(Arc<DecayTree>),
}

/// One decay path with fixed spin projections at every node.
#[derive(Debug, Clone)]
pub struct DecayTree {
    pub(crate) particle: ParticleId,
    pub(crate) name: String,
    pub(crate) channel: ChannelId,
    pub(crate) projection: SpinProjection,
    pub(crate) free_amplitude: ParameterId,
    pub(crate) spin: CachedFactor,
    pub(crate) line_shapes: Vec<CachedFactor>,
    pub(crate) daughters: Vec<Daughter>,
}

impl DecayTree {
    /// Decaying particle at the root.
    pub fn particle(&self) -> ParticleId {
        self.particle
    }

    /// Channel at the root.
    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    /// Spin projection of the root and its daughters.
    pub fn projection(&self) -> &SpinProjection {
        &self.projection
    }

    /// Root free amplitude.
    pub fn free_amplitude(&self) -> ParameterId {
        self.free_amplitude
    }

    /// Daughters in channel order.
    pub fn daughters(&self) -> &[Daughter] {
        &self.daughters
    }

    /// Product of cached spin amplitudes, line shapes and daughter
    /// amplitudes for `pc`.
    pub fn data_dependent_amplitude(
        &self,
        point: &DataPoint,
        pc: PcId,
        ctx: &AmplitudeContext<'_>,
    ) -> Result<Complex64> {
        let mut a = ctx.read(&self.spin, point, pc)?;
        for ls in &self.line_shapes {
            a *= ctx.read(ls, point, pc)?;
        }
        let combination = ctx.cache.get(pc)?;
        for (k, d) in self.daughters.iter().enumerate() {
            if let Daughter::Decay(tree) = d {
                let dpc = combination.daughters().get(k).copied().ok_or_else(|| {
                    Error::CacheContract(format!("{pc} has no daughter {k} for {}", self.name))
                })?;
                a *= tree.data_dependent_amplitude(point, dpc, ctx)?;
            }
        }
        Ok(a)
    }

    /// Product of the free amplitudes of the tree.
    pub fn data_independent_amplitude(&self, parameters: &ParameterSet) -> Complex64 {
        self.decaying_daughters()
            .fold(parameters.complex(self.free_amplitude), |a, t| {
                a * t.data_independent_amplitude(parameters)
            })
    }

    /// Data-dependent amplitude summed over `pcs`.
    pub fn summed_data_dependent_amplitude(
        &self,
        point: &DataPoint,
        pcs: &[PcId],
        ctx: &AmplitudeContext<'_>,
    ) -> Result<Complex64> {
        let mut sum = Complex64::new(0.0, 0.0);
        for &pc in pcs {
            sum += self.data_dependent_amplitude(point, pc, ctx)?;
        }
        Ok(sum)
    }

    /// Full amplitude: data-independent factor times the data-dependent
    /// amplitude summed over `pcs`.
    pub fn amplitude(
        &self,
        point: &DataPoint,
        pcs: &[PcId],
        parameters: &ParameterSet,
        ctx: &AmplitudeContext<'_>,
    ) -> Result<Complex64> {
        Ok(self.data_independent_amplitude(parameters)
            * self.summed_data_dependent_amplitude(point, pcs, ctx)?)
    }

    fn decaying_daughters(&self) -> impl Iterator<Item = &Arc<DecayTree>> + '_ {
        self.daughters.iter().filter_map(|d| match d {
            Daughter::Decay(t) => Some(t),
            Daughter::Final { .. } => None,
        })
    }

    /// `true` if a parameter of any line shape in the tree changed.
    ///
    /// Free amplitudes do not count: they only enter the data-independent
    /// factor.
    pub fn has_changed(&self, parameters: &ParameterSet) -> bool {
        let changed = |p: &ParameterId| parameters.status(*p) == Some(VariableStatus::Changed);
        self.line_shapes.iter().any(|ls| ls.parameters.iter().any(changed))
            || self.decaying_daughters().any(|t| t.has_changed(parameters))
    }

    /// Free amplitudes of the tree and its daughter trees.
    pub fn free_amplitudes(&self) -> BTreeSet<ParameterId> {
        let mut out = BTreeSet::new();
        self.collect_free_amplitudes(&mut out);
        out
    }

    fn collect_free_amplitudes(&self, out: &mut BTreeSet<ParameterId>) {
        out.insert(self.free_amplitude);
        for t in self.decaying_daughters() {
            t.collect_free_amplitudes(out);
        }
    }

    /// Number of decay levels.
    pub fn depth(&self) -> usize {
        1 + self.decaying_daughters().map(|t| t.depth()).max().unwrap_or(0)
    }

    /// `(particle, 2M)` of every final-state leaf, sorted.
    pub fn final_state_projections(&self) -> Vec<(ParticleId, i32)> {
        let mut out = Vec::new();
        self.collect_final_state_projections(&mut out);
        out.sort_unstable();
        out
    }

    fn collect_final_state_projections(&self, out: &mut Vec<(ParticleId, i32)>) {
        for d in &self.daughters {
            match d {
                Daughter::Final { particle, two_m, .. } => out.push((*particle, *two_m)),
                Daughter::Decay(t) => t.collect_final_state_projections(out),
            }
        }
    }

    /// Human-readable form, e.g. `D [0] -> (rho0 [0] -> pi+ [0] pi- [0]) pi+ [0]`.
    pub fn describe(&self) -> String {
        let daughters: Vec<String> = self
            .daughters
            .iter()
            .map(|d| match d {
                Daughter::Final { name, two_m, .. } => format!("{name} [{two_m}]"),
                Daughter::Decay(t) => format!("({})", t.describe()),
            })
            .collect();
        format!("{} [{}] -> {}", self.name, self.projection.two_m, daughters.join(" "))
    }
}

/// Indices of the trees whose data-dependent amplitude must be recomputed.
pub fn select_changed(trees: &[Arc<DecayTree>], parameters: &ParameterSet) -> Vec<usize> {
    trees
        .iter()
        .enumerate()
        .filter(|(_, t)| t.has_changed(parameters))
        .map(|(i, _)| i)
        .collect()
}

/// Union of the free amplitudes of `trees`.
pub fn free_amplitudes(trees: &[Arc<DecayTree>]) -> BTreeSet<ParameterId> {
    trees.iter().flat_map(|t| t.free_amplitudes()).collect()
}

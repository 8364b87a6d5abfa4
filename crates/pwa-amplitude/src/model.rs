//! Amplitude model: particles, channels, decay trees and their evaluation.
//!
//! A model is built in two phases. While unlocked, particles, channels and
//! line shapes are added. [`Model::lock`] then expands every initial-state
//! channel into the particle combinations it covers, registers them with the
//! data accessors, builds the decay trees, groups them into
//! [`ModelComponent`]s and freezes the storage layout. Only a locked model
//! creates data sets and evaluates.
//!
//! Evaluation state is split by ownership: the model (trees, accessors,
//! parameters) is shared read-only across partitions, each partition owns its
//! [`StatusManager`], and each data point is lent to exactly one partition.

use crate::cached_value::{
    CachedRepr, CachedValueDependency, ComplexValue, FourVectorValue, RealValue, TypedValue,
};
use crate::compensated_sum::CompensatedSum;
use crate::data::{DataPoint, DataSet, PartitionView};
use crate::data_accessor::{
    AccessorCalculation, AccessorContext, AccessorId, AccessorKind, AccessorRegistry, DataAccessor,
};
use crate::decay_tree::{AmplitudeContext, CachedFactor, Daughter, DecayTree};
use crate::four_vector::{self, FourVector};
use crate::kinematics::{self, CoordinateSystem, HelicityAngles};
use crate::line_shape::{LineShape, MassInput};
use crate::parameter::{ParameterId, ParameterSet};
use crate::partition::DataPartition;
use crate::particle_combination::{Equivalence, Grouping, ParticleCombinationCache, PcId};
use crate::spin::{self, DecayKinematics, SpinAmplitudeFormula, SpinProjection};
use crate::status::{CalculationStatus, StatusManager, VariableStatus};
use nalgebra::Matrix4;
use num_complex::Complex64;
use pwa_core::{Error, Result};
use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

/// Index of a particle within its model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParticleId(usize);

impl ParticleId {
    /// Position in the model.
    pub fn index(self) -> usize {
        self.0
    }
}

/// Index of a decay channel within its model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(usize);

impl ChannelId {
    /// Position in the model.
    pub fn index(self) -> usize {
        self.0
    }
}

/// Role of a particle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParticleKind {
    /// Final-state particle occupying the given final-state indices
    FinalState(Vec<usize>),
    /// Intermediate resonance
    Decaying,
    /// Decaying particle at the top of the model
    InitialState,
}

struct LineShapeSlot {
    shape: Arc<dyn LineShape>,
    factor: CachedFactor,
}

/// A particle of the model.
pub struct Particle {
    name: String,
    two_j: u32,
    kind: ParticleKind,
    channels: Vec<ChannelId>,
    line_shapes: Vec<LineShapeSlot>,
}

impl Particle {
    /// Name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Spin, doubled.
    pub fn two_j(&self) -> u32 {
        self.two_j
    }

    /// Role.
    pub fn kind(&self) -> &ParticleKind {
        &self.kind
    }

    /// Decay channels.
    pub fn channels(&self) -> &[ChannelId] {
        &self.channels
    }

    /// `true` for final-state particles.
    pub fn is_final_state(&self) -> bool {
        matches!(self.kind, ParticleKind::FinalState(_))
    }
}

/// A two- or more-body decay of a particle.
#[derive(Debug, Clone)]
pub struct Channel {
    parent: ParticleId,
    daughters: Vec<ParticleId>,
    spin: usize,
    free_amplitude: ParameterId,
}

impl Channel {
    /// Decaying particle.
    pub fn parent(&self) -> ParticleId {
        self.parent
    }

    /// Daughters in order.
    pub fn daughters(&self) -> &[ParticleId] {
        &self.daughters
    }

    /// Complex fit parameter of the channel.
    pub fn free_amplitude(&self) -> ParameterId {
        self.free_amplitude
    }
}

struct SpinAmplitudeSlot {
    formula: Arc<dyn SpinAmplitudeFormula>,
    accessor: AccessorId,
    values: Vec<(SpinProjection, ComplexValue)>,
}

struct FourMomenta {
    accessor: AccessorId,
    momentum: FourVectorValue,
    mass: RealValue,
}

struct HelicityAngleValues {
    accessor: AccessorId,
    phi: RealValue,
    theta: RealValue,
}

struct BreakupMomenta {
    accessor: AccessorId,
    q2: RealValue,
}

struct UserAccessor {
    accessor: AccessorId,
    calculation: Arc<dyn AccessorCalculation>,
}

/// Decay trees of one initial-state spin configuration, summed coherently
/// and weighted by an admixture.
#[derive(Debug, Clone)]
pub struct ModelComponent {
    initial_state: ParticleId,
    two_m: i32,
    trees: Vec<Arc<DecayTree>>,
    admixture: ParameterId,
}

impl ModelComponent {
    /// Initial-state particle.
    pub fn initial_state(&self) -> ParticleId {
        self.initial_state
    }

    /// Initial-state spin projection, doubled.
    pub fn two_m(&self) -> i32 {
        self.two_m
    }

    /// Interfering decay trees.
    pub fn trees(&self) -> &[Arc<DecayTree>] {
        &self.trees
    }

    /// Non-negative real weight of the component.
    pub fn admixture(&self) -> ParameterId {
        self.admixture
    }
}

/// One node of the expansion of a channel into particle combinations.
#[derive(Debug, Clone)]
struct Expansion {
    grouping: Grouping,
    indices: Vec<usize>,
    channel: Option<ChannelId>,
    daughters: Vec<Expansion>,
}

fn check_finite(z: Complex64, what: impl FnOnce() -> String) -> Result<Complex64> {
    if z.re.is_finite() && z.im.is_finite() {
        Ok(z)
    } else {
        Err(Error::Computation(format!("{} returned {z}", what())))
    }
}

/// Every value of `accessor` at `sym` must have been stored by its calculation.
fn check_stored(accessor: &DataAccessor, sym: usize, status: &StatusManager) -> Result<()> {
    let missing = accessor
        .values()
        .iter()
        .find(|v| status.calculation(v.id(), sym) == CalculationStatus::Uncalculated);
    match missing {
        Some(v) => Err(Error::CacheContract(format!(
            "{} left cached value {} uncalculated at symmetrization index {sym}",
            accessor.name(),
            v.name()
        ))),
        None => Ok(()),
    }
}

/// A partial-wave-analysis amplitude model.
pub struct Model {
    particles: Vec<Particle>,
    channels: Vec<Channel>,
    spin_amplitudes: Vec<SpinAmplitudeSlot>,
    final_state: Vec<ParticleId>,
    cache: ParticleCombinationCache,
    registry: AccessorRegistry,
    parameters: ParameterSet,
    four_momenta: FourMomenta,
    helicity_angles: HelicityAngleValues,
    breakup_momenta: BreakupMomenta,
    user_accessors: Vec<UserAccessor>,
    roots: Vec<Vec<PcId>>,
    components: Vec<ModelComponent>,
    locked: bool,
}

impl fmt::Debug for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Model")
            .field("particles", &self.particles.len())
            .field("channels", &self.channels.len())
            .field("final_state", &self.final_state.len())
            .field("components", &self.components.len())
            .field("locked", &self.locked)
            .finish()
    }
}

impl Default for Model {
    fn default() -> Self {
        Self::new()
    }
}

impl Model {
    /// Empty, unlocked model.
    pub fn new() -> Self {
        let mut registry = AccessorRegistry::new();
        let fm = registry.push("four_momenta", AccessorKind::Static, Equivalence::OrderlessContent);
        let accessor = fm.id();
        let momentum: FourVectorValue = fm.push_value("p", vec![], vec![]);
        let from_momentum = vec![CachedValueDependency::SameCombination(momentum.id())];
        let mass: RealValue = fm.push_value("m", vec![], from_momentum.clone());

        let ha = registry.push("helicity_angles", AccessorKind::Static, Equivalence::UpAndDown);
        let helicity_angles = HelicityAngleValues {
            accessor: ha.id(),
            phi: ha.push_value("phi", vec![], from_momentum.clone()),
            theta: ha.push_value("theta", vec![], from_momentum),
        };

        let bm = registry.push(
            "breakup_momenta",
            AccessorKind::Static,
            Equivalence::DownByOrderlessContent,
        );
        let from_mass = vec![CachedValueDependency::SameCombination(mass.id())];
        let breakup_momenta =
            BreakupMomenta { accessor: bm.id(), q2: bm.push_value("q2", vec![], from_mass) };

        Self {
            particles: Vec::new(),
            channels: Vec::new(),
            spin_amplitudes: Vec::new(),
            final_state: Vec::new(),
            cache: ParticleCombinationCache::new(),
            registry,
            parameters: ParameterSet::new(),
            four_momenta: FourMomenta { accessor, momentum, mass },
            helicity_angles,
            breakup_momenta,
            user_accessors: Vec::new(),
            roots: Vec::new(),
            components: Vec::new(),
            locked: false,
        }
    }

    fn ensure_unlocked(&self, what: &str) -> Result<()> {
        if self.locked {
            return Err(Error::Configuration(format!("cannot {what}: model is locked")));
        }
        Ok(())
    }

    fn ensure_locked(&self) -> Result<()> {
        if !self.locked {
            return Err(Error::Configuration("model must be locked first".to_string()));
        }
        Ok(())
    }

    /// `true` once [`Model::lock`] succeeded.
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    fn particle_ref(&self, id: ParticleId) -> Result<&Particle> {
        self.particles
            .get(id.0)
            .ok_or_else(|| Error::Configuration(format!("unknown particle {}", id.0)))
    }

    fn push_particle(&mut self, name: &str, two_j: u32, kind: ParticleKind) -> Result<ParticleId> {
        if self.find_particle(name).is_some() {
            return Err(Error::Configuration(format!("particle {name} already exists")));
        }
        self.particles.push(Particle {
            name: name.to_string(),
            two_j,
            kind,
            channels: Vec::new(),
            line_shapes: Vec::new(),
        });
        Ok(ParticleId(self.particles.len() - 1))
    }

    /// Declare the final state as `(name, 2J)` per final-state index.
    ///
    /// Repeated names denote identical particles: they share one
    /// [`Particle`], so their indices symmetrize. Returns the particle of
    /// every index.
    pub fn set_final_state(&mut self, particles: &[(&str, u32)]) -> Result<Vec<ParticleId>> {
        self.ensure_unlocked("set the final state")?;
        if !self.final_state.is_empty() {
            return Err(Error::Configuration("final state is already set".to_string()));
        }
        if particles.is_empty() {
            return Err(Error::Configuration("final state must not be empty".to_string()));
        }
        let mut ids = Vec::with_capacity(particles.len());
        for (index, &(name, two_j)) in particles.iter().enumerate() {
            let existing =
                ids.iter().copied().find(|id: &ParticleId| self.particles[id.0].name == name);
            let id = match existing {
                Some(id) => {
                    let p = &mut self.particles[id.0];
                    if p.two_j != two_j {
                        return Err(Error::Configuration(format!(
                            "identical final-state particles {name} with 2J={} and 2J={two_j}",
                            p.two_j
                        )));
                    }
                    if let ParticleKind::FinalState(indices) = &mut p.kind {
                        indices.push(index);
                    }
                    id
                }
                None => self.push_particle(name, two_j, ParticleKind::FinalState(vec![index]))?,
            };
            ids.push(id);
        }
        self.final_state = ids.clone();
        Ok(ids)
    }

    /// Add an intermediate resonance.
    pub fn add_decaying_particle(&mut self, name: &str, two_j: u32) -> Result<ParticleId> {
        self.ensure_unlocked("add a particle")?;
        self.push_particle(name, two_j, ParticleKind::Decaying)
    }

    /// Add a particle at the top of the model.
    pub fn add_initial_state_particle(&mut self, name: &str, two_j: u32) -> Result<ParticleId> {
        self.ensure_unlocked("add a particle")?;
        self.push_particle(name, two_j, ParticleKind::InitialState)
    }

    /// Add the decay `parent -> daughters` with the given spin amplitude.
    ///
    /// Channels supplied with the same formula instance share its cached
    /// values. Each channel gets a complex free amplitude initialised to 1.
    pub fn add_channel(
        &mut self,
        parent: ParticleId,
        daughters: &[ParticleId],
        formula: Arc<dyn SpinAmplitudeFormula>,
    ) -> Result<ChannelId> {
        self.ensure_unlocked("add a channel")?;
        let p = self.particle_ref(parent)?;
        if p.is_final_state() {
            let msg = format!("final-state particle {} cannot decay", p.name);
            return Err(Error::Configuration(msg));
        }
        let parent_two_j = p.two_j;
        let mut names = Vec::with_capacity(daughters.len());
        let mut two_j = Vec::with_capacity(daughters.len());
        for &d in daughters {
            let dp = self.particle_ref(d)?;
            if dp.kind == ParticleKind::InitialState {
                return Err(Error::Configuration(format!(
                    "initial-state particle {} cannot be a daughter",
                    dp.name
                )));
            }
            names.push(dp.name.clone());
            two_j.push(dp.two_j);
        }
        let label = format!("{} -> {}", self.particles[parent.0].name, names.join(" "));
        spin::check_channel(formula.as_ref(), parent_two_j, &two_j)
            .map_err(|e| Error::Configuration(format!("{label}: {e}")))?;

        let shared = self.spin_amplitudes.iter().position(|s| Arc::ptr_eq(&s.formula, &formula));
        let spin = match shared {
            Some(s) => s,
            None => self.add_spin_amplitude(formula.clone())?,
        };
        let free_amplitude = self.parameters.add_complex(
            &format!("{label} (L={}, 2S={})", formula.l(), formula.two_s()),
            Complex64::new(1.0, 0.0),
        );
        let id = ChannelId(self.channels.len());
        self.channels.push(Channel { parent, daughters: daughters.to_vec(), spin, free_amplitude });
        self.roots.push(Vec::new());
        self.particles[parent.0].channels.push(id);
        log::debug!("added channel {label}");
        Ok(id)
    }

    fn add_spin_amplitude(&mut self, formula: Arc<dyn SpinAmplitudeFormula>) -> Result<usize> {
        let name = format!("spin_amplitude:{}", formula.formalism());
        let accessor = self.registry.add(&name, AccessorKind::Static, Equivalence::UpAndDown);
        let mut values = Vec::new();
        for projection in formula.projections() {
            let label = format!("2M={} -> {:?}", projection.two_m, projection.daughters);
            let value: ComplexValue =
                self.registry.add_cached_value(accessor, &label, vec![], vec![])?;
            values.push((projection, value));
        }
        self.spin_amplitudes.push(SpinAmplitudeSlot { formula, accessor, values });
        Ok(self.spin_amplitudes.len() - 1)
    }

    /// Attach a line shape to a decaying particle.
    ///
    /// Returns the line-shape parameters, in the shape's order.
    pub fn add_amplitude_component(
        &mut self,
        particle: ParticleId,
        shape: Arc<dyn LineShape>,
    ) -> Result<Vec<ParameterId>> {
        self.ensure_unlocked("add an amplitude component")?;
        let p = self.particle_ref(particle)?;
        if p.is_final_state() {
            return Err(Error::Configuration(format!(
                "final-state particle {} cannot carry a line shape",
                p.name
            )));
        }
        let names = shape.parameter_names();
        let init = shape.parameter_init();
        if names.len() != init.len() {
            return Err(Error::Configuration(format!(
                "line shape {} declares {} parameters but {} initial values",
                shape.name(),
                names.len(),
                init.len()
            )));
        }
        let prefix = format!("{}.{}", p.name, shape.name());
        let parameters: Vec<ParameterId> = names
            .iter()
            .zip(init)
            .map(|(n, v)| self.parameters.add_real(&format!("{prefix}.{n}"), v))
            .collect();
        let accessor = self.registry.add(&prefix, AccessorKind::Recalculable, Equivalence::Down);
        let dep = vec![CachedValueDependency::SameCombination(self.four_momenta.mass.id())];
        let value = self.registry.add_cached_value(accessor, "value", parameters.clone(), dep)?;
        self.particles[particle.0].line_shapes.push(LineShapeSlot {
            shape,
            factor: CachedFactor { accessor, value, parameters: parameters.clone() },
        });
        Ok(parameters)
    }

    /// Register a particle combination with the cache.
    pub fn add_particle_combination(&mut self, grouping: &Grouping) -> Result<PcId> {
        self.ensure_unlocked("add a particle combination")?;
        if let Some(&i) = grouping.indices().iter().find(|&&i| i >= self.final_state.len()) {
            return Err(Error::Configuration(format!(
                "final-state index {i} out of range ({} particles)",
                self.final_state.len()
            )));
        }
        self.cache.add_to_cache(grouping)
    }

    /// Register a user data accessor computed by `calculation`.
    ///
    /// Static accessors are computed when a point's momenta are set, after
    /// the built-in kinematics. Recalculable ones are computed during
    /// evaluation, after the line shapes.
    pub fn add_data_accessor(
        &mut self,
        name: &str,
        kind: AccessorKind,
        equivalence: Equivalence,
        calculation: Arc<dyn AccessorCalculation>,
    ) -> Result<AccessorId> {
        self.ensure_unlocked("add a data accessor")?;
        let accessor = self.registry.add(name, kind, equivalence);
        self.user_accessors.push(UserAccessor { accessor, calculation });
        Ok(accessor)
    }

    /// Register a cached value with an accessor.
    pub fn add_cached_value<T: CachedRepr>(
        &mut self,
        accessor: AccessorId,
        name: &str,
        parameters: Vec<ParameterId>,
        dependencies: Vec<CachedValueDependency>,
    ) -> Result<TypedValue<T>> {
        self.registry.add_cached_value(accessor, name, parameters, dependencies)
    }

    /// Register a particle combination with an accessor.
    ///
    /// The combination and its daughters also get cached four-momenta.
    pub fn register_particle_combination(
        &mut self,
        accessor: AccessorId,
        pc: PcId,
    ) -> Result<usize> {
        self.ensure_unlocked("register a particle combination")?;
        self.register_four_momenta(pc)?;
        self.registry.add_particle_combination(accessor, &self.cache, pc)
    }

    fn register_four_momenta(&mut self, pc: PcId) -> Result<()> {
        self.registry.add_particle_combination(self.four_momenta.accessor, &self.cache, pc)?;
        for d in self.cache.get(pc)?.daughters().to_vec() {
            self.register_four_momenta(d)?;
        }
        Ok(())
    }

    fn expand_particle(
        &self,
        id: ParticleId,
        stack: &mut Vec<ParticleId>,
    ) -> Result<Vec<Expansion>> {
        let p = self.particle_ref(id)?;
        if let ParticleKind::FinalState(indices) = &p.kind {
            return Ok(indices
                .iter()
                .map(|&i| Expansion {
                    grouping: Grouping::Final(i),
                    indices: vec![i],
                    channel: None,
                    daughters: Vec::new(),
                })
                .collect());
        }
        if stack.contains(&id) {
            return Err(Error::Configuration(format!("decay of {} is cyclic", p.name)));
        }
        stack.push(id);
        let mut out = Vec::new();
        for &c in &p.channels {
            out.extend(self.expand_channel(c, stack)?);
        }
        stack.pop();
        Ok(out)
    }

    /// Every assignment of disjoint final-state content to the daughters of
    /// `c`; swapping identical daughters does not yield a new assignment.
    fn expand_channel(&self, c: ChannelId, stack: &mut Vec<ParticleId>) -> Result<Vec<Expansion>> {
        let channel = &self.channels[c.0];
        let mut partial: Vec<Vec<Expansion>> = vec![Vec::new()];
        for &d in &channel.daughters {
            let options = self.expand_particle(d, stack)?;
            let mut next = Vec::new();
            for prefix in &partial {
                for o in &options {
                    let overlaps =
                        prefix.iter().any(|e| e.indices.iter().any(|i| o.indices.contains(i)));
                    if !overlaps {
                        let mut v = prefix.clone();
                        v.push(o.clone());
                        next.push(v);
                    }
                }
            }
            partial = next;
        }

        let mut seen = BTreeSet::new();
        let mut out = Vec::new();
        for daughters in partial {
            let mut key: Vec<(ParticleId, Grouping)> = channel
                .daughters
                .iter()
                .copied()
                .zip(daughters.iter().map(|e| e.grouping.clone()))
                .collect();
            key.sort();
            if !seen.insert(key) {
                continue;
            }
            let mut indices: Vec<usize> =
                daughters.iter().flat_map(|e| e.indices.iter().copied()).collect();
            indices.sort_unstable();
            let grouping =
                Grouping::Composite(daughters.iter().map(|e| e.grouping.clone()).collect());
            out.push(Expansion {
                grouping,
                indices,
                channel: Some(c),
                daughters,
            });
        }
        Ok(out)
    }

    fn register_node(&mut self, pc: PcId, e: &Expansion) -> Result<()> {
        self.registry.add_particle_combination(self.four_momenta.accessor, &self.cache, pc)?;
        let Some(c) = e.channel else { return Ok(()) };
        let channel = &self.channels[c.0];
        let mut accessors = vec![self.spin_amplitudes[channel.spin].accessor];
        if self.cache.get(pc)?.daughters().len() == 2 {
            accessors.extend([self.helicity_angles.accessor, self.breakup_momenta.accessor]);
        }
        accessors.extend(
            self.particles[channel.parent.0].line_shapes.iter().map(|ls| ls.factor.accessor),
        );
        for a in accessors {
            self.registry.add_particle_combination(a, &self.cache, pc)?;
        }
        let daughters = self.cache.get(pc)?.daughters().to_vec();
        for (dpc, de) in daughters.into_iter().zip(&e.daughters) {
            self.register_node(dpc, de)?;
        }
        Ok(())
    }

    fn trees_of(
        &self,
        particle: ParticleId,
        two_m: i32,
        memo: &mut HashMap<(ParticleId, i32), Vec<Arc<DecayTree>>>,
    ) -> Result<Vec<Arc<DecayTree>>> {
        if let Some(t) = memo.get(&(particle, two_m)) {
            return Ok(t.clone());
        }
        let p = self.particle_ref(particle)?;
        let line_shapes: Vec<CachedFactor> =
            p.line_shapes.iter().map(|ls| ls.factor.clone()).collect();
        let mut out = Vec::new();
        for &c in &p.channels {
            let channel = &self.channels[c.0];
            let slot = &self.spin_amplitudes[channel.spin];
            for (projection, value) in slot.values.iter().filter(|(pr, _)| pr.two_m == two_m) {
                let mut combos: Vec<Vec<Daughter>> = vec![Vec::new()];
                for (&d, &d_two_m) in channel.daughters.iter().zip(&projection.daughters) {
                    let dp = self.particle_ref(d)?;
                    let options: Vec<Daughter> = if dp.is_final_state() {
                        vec![Daughter::Final { particle: d, name: dp.name.clone(), two_m: d_two_m }]
                    } else {
                        self.trees_of(d, d_two_m, memo)?.into_iter().map(Daughter::Decay).collect()
                    };
                    combos = combos
                        .iter()
                        .flat_map(|prefix| {
                            options.iter().map(move |o| {
                                let mut v = prefix.clone();
                                v.push(o.clone());
                                v
                            })
                        })
                        .collect();
                }
                for daughters in combos {
                    out.push(Arc::new(DecayTree {
                        particle,
                        name: p.name.clone(),
                        channel: c,
                        projection: projection.clone(),
                        free_amplitude: channel.free_amplitude,
                        spin: CachedFactor {
                            accessor: slot.accessor,
                            value: *value,
                            parameters: Vec::new(),
                        },
                        line_shapes: line_shapes.clone(),
                        daughters,
                    }));
                }
            }
        }
        memo.insert((particle, two_m), out.clone());
        Ok(out)
    }

    /// Freeze the model structure.
    ///
    /// Registers the particle combinations of every initial-state channel,
    /// builds the decay trees, groups them into components, fixes free
    /// amplitudes and admixtures that carry no information, prunes unused
    /// combinations and locks the storage layout. On failure the model is
    /// left as it was before the call.
    pub fn lock(&mut self) -> Result<()> {
        self.ensure_unlocked("lock")?;
        let cache = self.cache.clone();
        let registry = self.registry.clone();
        let parameters = self.parameters.clone();
        let roots = self.roots.clone();
        let components = match self.lock_structure() {
            Ok(components) => components,
            Err(e) => {
                self.cache = cache;
                self.registry = registry;
                self.parameters = parameters;
                self.roots = roots;
                return Err(e);
            }
        };

        self.components = components;
        self.registry.lock();
        self.locked = true;
        log::info!(
            "locked model: {} combinations, {} accessors, {} decay trees, {} components",
            self.cache.len(),
            self.registry.len(),
            self.components.iter().map(|c| c.trees.len()).sum::<usize>(),
            self.components.len()
        );
        Ok(())
    }

    fn lock_structure(&mut self) -> Result<Vec<ModelComponent>> {
        let n_fs = self.final_state.len();
        if n_fs == 0 {
            return Err(Error::Configuration("final state is not set".to_string()));
        }
        let initial: Vec<ParticleId> = (0..self.particles.len())
            .map(ParticleId)
            .filter(|&id| self.particles[id.0].kind == ParticleKind::InitialState)
            .collect();
        if initial.is_empty() {
            return Err(Error::Configuration("model has no initial-state particle".to_string()));
        }

        for &isp in &initial {
            let channels = self.particles[isp.0].channels.clone();
            if channels.is_empty() {
                return Err(Error::Configuration(format!(
                    "initial-state particle {} has no decay channel",
                    self.particles[isp.0].name
                )));
            }
            for c in channels {
                let expansions = self.expand_channel(c, &mut vec![isp])?;
                let full: Vec<&Expansion> =
                    expansions.iter().filter(|e| e.indices.len() == n_fs).collect();
                if full.is_empty() {
                    let ch = &self.channels[c.0];
                    let names: Vec<&str> =
                        ch.daughters.iter().map(|d| self.particles[d.0].name.as_str()).collect();
                    return Err(Error::Configuration(format!(
                        "channel {} -> {} does not reach the final state",
                        self.particles[isp.0].name,
                        names.join(" ")
                    )));
                }
                for e in full {
                    let root = self.cache.add_to_cache(&e.grouping)?;
                    if !self.roots[c.0].contains(&root) {
                        self.roots[c.0].push(root);
                    }
                    self.register_node(root, e)?;
                }
            }
        }

        let mut memo = HashMap::new();
        let mut groups: BTreeMap<(ParticleId, i32, Vec<(ParticleId, i32)>), Vec<Arc<DecayTree>>> =
            BTreeMap::new();
        for &isp in &initial {
            for two_m in spin::projections_of(self.particles[isp.0].two_j) {
                for tree in self.trees_of(isp, two_m, &mut memo)? {
                    groups
                        .entry((isp, two_m, tree.final_state_projections()))
                        .or_default()
                        .push(tree);
                }
            }
        }
        if groups.is_empty() {
            return Err(Error::Configuration("model has no decay trees".to_string()));
        }
        let mut components = Vec::with_capacity(groups.len());
        for ((isp, two_m, fs), trees) in groups {
            let name = format!("{} [2M={two_m}] {fs:?} admixture", self.particles[isp.0].name);
            let admixture = self.parameters.add_non_negative(&name, 1.0)?;
            components.push(ModelComponent { initial_state: isp, two_m, trees, admixture });
        }

        self.fix_solitary_free_amplitudes(&components)?;
        if let [only] = components.as_slice() {
            self.parameters.fix(only.admixture)?;
            log::debug!("fixed the admixture of the only model component");
        }

        let expired = self.cache.remove_expired();
        let pruned = self.registry.prune(&self.cache, n_fs);
        if expired + pruned > 0 {
            log::debug!("removed {expired} expired combinations, pruned {pruned} registrations");
        }
        self.cache.check_consistency()?;
        Ok(components)
    }

    /// Fix every free amplitude that is the only one of its decaying particle.
    fn fix_solitary_free_amplitudes(&mut self, components: &[ModelComponent]) -> Result<()> {
        let used: BTreeSet<ParameterId> =
            components.iter().flat_map(|c| crate::decay_tree::free_amplitudes(&c.trees)).collect();
        let mut by_particle: BTreeMap<ParticleId, Vec<ParameterId>> = BTreeMap::new();
        for ch in &self.channels {
            if used.contains(&ch.free_amplitude) {
                by_particle.entry(ch.parent).or_default().push(ch.free_amplitude);
            }
        }
        for (particle, amps) in by_particle {
            if let [only] = amps.as_slice() {
                self.parameters.fix(*only)?;
                log::debug!("fixed solitary free amplitude of {}", self.particles[particle.0].name);
            }
        }
        Ok(())
    }

    /// Number of final-state particles.
    pub fn n_final_state(&self) -> usize {
        self.final_state.len()
    }

    /// Particle of every final-state index.
    pub fn final_state(&self) -> &[ParticleId] {
        &self.final_state
    }

    /// Particle by id.
    pub fn particle(&self, id: ParticleId) -> Option<&Particle> {
        self.particles.get(id.0)
    }

    /// Particle by name.
    pub fn find_particle(&self, name: &str) -> Option<ParticleId> {
        self.particles.iter().position(|p| p.name == name).map(ParticleId)
    }

    /// Channel by id.
    pub fn channel(&self, id: ChannelId) -> Option<&Channel> {
        self.channels.get(id.0)
    }

    /// Root combinations of an initial-state channel.
    pub fn roots(&self, channel: ChannelId) -> &[PcId] {
        self.roots.get(channel.0).map_or(&[], Vec::as_slice)
    }

    /// Model components; empty until locked.
    pub fn components(&self) -> &[ModelComponent] {
        &self.components
    }

    /// Free amplitudes used by any decay tree.
    pub fn free_amplitudes(&self) -> BTreeSet<ParameterId> {
        self.components.iter().flat_map(|c| crate::decay_tree::free_amplitudes(&c.trees)).collect()
    }

    /// Parameters.
    pub fn parameters(&self) -> &ParameterSet {
        &self.parameters
    }

    /// Mutable parameters.
    pub fn parameters_mut(&mut self) -> &mut ParameterSet {
        &mut self.parameters
    }

    /// Flag every parameter unchanged; call after a full evaluation.
    pub fn set_parameter_flags_to_unchanged(&mut self) {
        self.parameters.set_flags_to_unchanged();
    }

    /// Data accessors.
    pub fn registry(&self) -> &AccessorRegistry {
        &self.registry
    }

    /// Particle combinations.
    pub fn cache(&self) -> &ParticleCombinationCache {
        &self.cache
    }

    /// Cached four-momentum of a combination.
    pub fn four_momentum_value(&self) -> FourVectorValue {
        self.four_momenta.momentum
    }

    /// Cached invariant mass of a combination.
    pub fn mass_value(&self) -> RealValue {
        self.four_momenta.mass
    }

    /// Empty data set matching the storage layout, with `n` zero points.
    pub fn create_data_set(&self, n: usize) -> Result<DataSet> {
        self.ensure_locked()?;
        let mut data = DataSet::new(
            self.registry.empty_data_point(),
            self.registry.status_manager(),
            self.n_final_state(),
        );
        data.add_empty_data_points(n);
        Ok(data)
    }

    fn four_momentum_sym(&self, pc: PcId) -> Result<usize> {
        self.registry[self.four_momenta.accessor].symmetrization_index(pc).ok_or_else(|| {
            Error::CacheContract(format!("{pc} has no four-momentum registered"))
        })
    }

    fn momentum(&self, point: &DataPoint, pc: PcId, status: &StatusManager) -> Result<FourVector> {
        self.four_momenta.momentum.read(point, self.four_momentum_sym(pc)?, status)
    }

    fn mass_of(&self, point: &DataPoint, pc: PcId, status: &StatusManager) -> Result<f64> {
        self.four_momenta.mass.read(point, self.four_momentum_sym(pc)?, status)
    }

    /// Cached helicity angles of the first daughter of `pc`.
    pub fn helicity_angles(
        &self,
        point: &DataPoint,
        pc: PcId,
        status: &StatusManager,
    ) -> Result<HelicityAngles> {
        self.cached_helicity_angles(point, pc, status)?.ok_or_else(|| {
            Error::CacheContract(format!("{pc} has no helicity angles registered"))
        })
    }

    fn cached_helicity_angles(
        &self,
        point: &DataPoint,
        pc: PcId,
        status: &StatusManager,
    ) -> Result<Option<HelicityAngles>> {
        let ha = &self.helicity_angles;
        let Some(sym) = self.registry[ha.accessor].symmetrization_index(pc) else {
            return Ok(None);
        };
        let phi = ha.phi.read(point, sym, status)?;
        let theta = ha.theta.read(point, sym, status)?;
        Ok(Some(HelicityAngles { phi, theta }))
    }

    /// Cached squared breakup momentum of the two-body decay of `pc`.
    pub fn breakup_momentum_squared(
        &self,
        point: &DataPoint,
        pc: PcId,
        status: &StatusManager,
    ) -> Result<f64> {
        self.cached_breakup_momentum(point, pc, status)?.ok_or_else(|| {
            Error::CacheContract(format!("{pc} has no breakup momentum registered"))
        })
    }

    fn cached_breakup_momentum(
        &self,
        point: &DataPoint,
        pc: PcId,
        status: &StatusManager,
    ) -> Result<Option<f64>> {
        let bm = &self.breakup_momenta;
        match self.registry[bm.accessor].symmetrization_index(pc) {
            Some(sym) => bm.q2.read(point, sym, status).map(Some),
            None => Ok(None),
        }
    }

    fn accessor_context<'a>(&'a self, accessor: &'a DataAccessor) -> AccessorContext<'a> {
        AccessorContext::new(
            accessor,
            &self.registry,
            &self.cache,
            &self.parameters,
            self.four_momenta.momentum,
            self.four_momenta.mass,
        )
    }

    /// Fill the static values of `point` from its final-state momenta.
    ///
    /// Static statuses are shared by every point of a data set, so callers
    /// must run this on scratch copies and keep them only on success.
    pub(crate) fn calculate_static(
        &self,
        point: &mut DataPoint,
        momenta: &[FourVector],
        status: &mut StatusManager,
    ) -> Result<()> {
        self.ensure_locked()?;
        self.calculate_four_momenta(point, momenta, status)?;
        self.calculate_helicity_angles(point, status)?;
        self.calculate_breakup_momenta(point, status)?;
        self.calculate_spin_amplitudes(point, status)?;
        for ua in &self.user_accessors {
            let accessor = &self.registry[ua.accessor];
            if accessor.kind() != AccessorKind::Static {
                continue;
            }
            status.set_accessor_calculation(ua.accessor, CalculationStatus::Uncalculated);
            let ctx = self.accessor_context(accessor);
            for (sym, pc) in accessor.representatives().into_iter().enumerate() {
                ua.calculation.calculate(&ctx, point, pc, sym, status)?;
                check_stored(accessor, sym, status)?;
            }
        }
        Ok(())
    }

    fn calculate_four_momenta(
        &self,
        point: &mut DataPoint,
        momenta: &[FourVector],
        status: &mut StatusManager,
    ) -> Result<()> {
        let fm = &self.four_momenta;
        status.set_accessor_calculation(fm.accessor, CalculationStatus::Uncalculated);
        for (sym, pc) in self.registry[fm.accessor].representatives().into_iter().enumerate() {
            let p = self
                .cache
                .get(pc)?
                .indices()
                .iter()
                .fold(FourVector::zeros(), |acc, &i| acc + momenta[i]);
            fm.momentum.set_value(p, point, sym, status)?;
            fm.mass.set_value(four_vector::mass(&p), point, sym, status)?;
        }
        Ok(())
    }

    /// Angles of every registered two-body decay, walking down from each
    /// top-level combination through the chain of helicity frames.
    fn calculate_helicity_angles(
        &self,
        point: &mut DataPoint,
        status: &mut StatusManager,
    ) -> Result<()> {
        let ha = self.helicity_angles.accessor;
        status.set_accessor_calculation(ha, CalculationStatus::Uncalculated);
        let tops: Vec<PcId> = self.registry[self.four_momenta.accessor]
            .symmetrization_indices()
            .map(|(pc, _)| pc)
            .filter(|&pc| self.cache.find(pc).is_some_and(|c| c.parent().is_none()))
            .collect();
        let lab = kinematics::lab_frame();
        for pc in tops {
            self.helicity_angles_below(point, pc, &lab, Matrix4::identity(), status)?;
        }
        Ok(())
    }

    fn helicity_angles_below(
        &self,
        point: &mut DataPoint,
        pc: PcId,
        axes: &CoordinateSystem,
        boost: Matrix4<f64>,
        status: &mut StatusManager,
    ) -> Result<()> {
        let c = self.cache.get(pc)?;
        if c.is_final_state() {
            return Ok(());
        }
        let p = boost * self.momentum(point, pc, status)?;
        let frame = kinematics::helicity_frame(&four_vector::vect(&p), axes);
        let boost = four_vector::rest_frame_boost(&p) * boost;

        let ha = &self.helicity_angles;
        let sym = self.registry[ha.accessor].symmetrization_index(pc);
        if let Some(sym) = sym
            && status.calculation(ha.phi.id(), sym) == CalculationStatus::Uncalculated
        {
            let first = boost * self.momentum(point, c.daughters()[0], status)?;
            let a = kinematics::angles(&four_vector::vect(&first), &frame);
            ha.phi.set_value(a.phi, point, sym, status)?;
            ha.theta.set_value(a.theta, point, sym, status)?;
        }
        for &d in c.daughters() {
            self.helicity_angles_below(point, d, &frame, boost, status)?;
        }
        Ok(())
    }

    fn calculate_breakup_momenta(
        &self,
        point: &mut DataPoint,
        status: &mut StatusManager,
    ) -> Result<()> {
        let bm = &self.breakup_momenta;
        status.set_accessor_calculation(bm.accessor, CalculationStatus::Uncalculated);
        for (sym, pc) in self.registry[bm.accessor].representatives().into_iter().enumerate() {
            let &[a, b] = self.cache.get(pc)?.daughters() else {
                return Err(Error::CacheContract(format!("{pc} is not a two-body decay")));
            };
            let m2 = four_vector::mass_squared(&self.momentum(point, pc, status)?);
            let q2 = kinematics::breakup_momentum_squared(
                m2,
                self.mass_of(point, a, status)?,
                self.mass_of(point, b, status)?,
            );
            if !q2.is_finite() {
                return Err(Error::Computation(format!("breakup momentum of {pc} is {q2}")));
            }
            bm.q2.set_value(q2, point, sym, status)?;
        }
        Ok(())
    }

    fn calculate_spin_amplitudes(
        &self,
        point: &mut DataPoint,
        status: &mut StatusManager,
    ) -> Result<()> {
        for slot in &self.spin_amplitudes {
            status.set_accessor_calculation(slot.accessor, CalculationStatus::Uncalculated);
            let representatives = self.registry[slot.accessor].representatives();
            for (sym, pc) in representatives.into_iter().enumerate() {
                let c = self.cache.get(pc)?;
                let parent = self.momentum(point, pc, status)?;
                let daughters = c
                    .daughters()
                    .iter()
                    .map(|&d| self.momentum(point, d, status))
                    .collect::<Result<Vec<_>>>()?;
                let frame = c.parent().map(|g| self.momentum(point, g, status)).transpose()?;
                let kin = DecayKinematics {
                    parent,
                    daughters: &daughters,
                    frame,
                    angles: self.cached_helicity_angles(point, pc, status)?,
                    breakup_momentum_squared: self.cached_breakup_momentum(point, pc, status)?,
                };
                for (projection, value) in &slot.values {
                    let a = check_finite(slot.formula.amplitude(projection, &kin)?, || {
                        format!("{} spin amplitude for {pc}", slot.formula.formalism())
                    })?;
                    value.set_value(a, point, sym, status)?;
                }
            }
        }
        Ok(())
    }

    /// Recompute the recalculable values of a partition whose inputs changed.
    pub fn calculate(&self, view: &mut PartitionView<'_>) -> Result<()> {
        self.ensure_locked()?;
        view.status.update_calculation_statuses(
            &self.registry,
            &self.cache,
            &self.parameters,
            self.registry.of_kind(AccessorKind::Recalculable),
        );
        for ls in self.particles.iter().flat_map(|p| &p.line_shapes) {
            self.calculate_line_shape(ls, view)?;
        }
        for ua in &self.user_accessors {
            if self.registry[ua.accessor].kind() == AccessorKind::Recalculable {
                self.calculate_user_accessor(ua, view)?;
            }
        }
        Ok(())
    }

    fn calculate_user_accessor(
        &self,
        ua: &UserAccessor,
        view: &mut PartitionView<'_>,
    ) -> Result<()> {
        let accessor = &self.registry[ua.accessor];
        let status: &StatusManager = view.status;
        let stale = |sym: usize| {
            accessor
                .values()
                .iter()
                .any(|v| status.calculation(v.id(), sym) == CalculationStatus::Uncalculated)
        };
        let pending: Vec<(usize, PcId)> = accessor
            .representatives()
            .into_iter()
            .enumerate()
            .filter(|&(sym, _)| stale(sym))
            .collect();
        if pending.is_empty() {
            return Ok(());
        }
        log::debug!("recalculating {} for {} symmetrizations", accessor.name(), pending.len());

        let ctx = self.accessor_context(accessor);
        for point in view.points.iter_mut() {
            let point: &mut DataPoint = point;
            for &(sym, pc) in &pending {
                ua.calculation.calculate(&ctx, point, pc, sym, view.status)?;
            }
        }
        for &(sym, _) in &pending {
            check_stored(accessor, sym, view.status)?;
        }
        Ok(())
    }

    fn calculate_line_shape(&self, ls: &LineShapeSlot, view: &mut PartitionView<'_>) -> Result<()> {
        let value = ls.factor.value;
        let mut pending = Vec::new();
        let representatives = self.registry[ls.factor.accessor].representatives();
        for (sym, pc) in representatives.into_iter().enumerate() {
            if view.status.calculation(value.id(), sym) == CalculationStatus::Calculated {
                continue;
            }
            let daughters = self
                .cache
                .get(pc)?
                .daughters()
                .iter()
                .map(|&d| self.four_momentum_sym(d))
                .collect::<Result<Vec<_>>>()?;
            pending.push((sym, pc, self.four_momentum_sym(pc)?, daughters));
        }
        if pending.is_empty() {
            return Ok(());
        }
        log::debug!("recalculating {} for {} symmetrizations", ls.shape.name(), pending.len());

        let params: Vec<f64> =
            ls.factor.parameters.iter().map(|&p| self.parameters.real(p)).collect();
        let mass = self.four_momenta.mass;
        let mut daughter_masses = Vec::new();
        for point in view.points.iter_mut() {
            let point: &mut DataPoint = point;
            for (sym, pc, m_sym, d_syms) in &pending {
                let m = mass.read(point, *m_sym, view.status)?;
                daughter_masses.clear();
                for &s in d_syms {
                    daughter_masses.push(mass.read(point, s, view.status)?);
                }
                let input = MassInput { mass: m, daughter_masses: &daughter_masses };
                let v = check_finite(ls.shape.value(&input, &params)?, || {
                    format!("line shape {} for {pc}", ls.shape.name())
                })?;
                value.set_value(v, point, *sym, view.status)?;
            }
        }
        Ok(())
    }

    fn context<'a>(&'a self, status: &'a StatusManager) -> AmplitudeContext<'a> {
        AmplitudeContext { registry: &self.registry, cache: &self.cache, status }
    }

    /// Coherent amplitude of one component at `point`.
    pub fn amplitude(
        &self,
        component: &ModelComponent,
        point: &DataPoint,
        status: &StatusManager,
    ) -> Result<Complex64> {
        let ctx = self.context(status);
        let mut sum = Complex64::new(0.0, 0.0);
        for tree in &component.trees {
            sum += tree.amplitude(point, self.roots(tree.channel()), &self.parameters, &ctx)?;
        }
        Ok(sum)
    }

    /// Data-dependent amplitude of `tree`, summed over its root combinations.
    pub fn data_dependent_amplitude(
        &self,
        tree: &DecayTree,
        point: &DataPoint,
        status: &StatusManager,
    ) -> Result<Complex64> {
        let ctx = self.context(status);
        tree.summed_data_dependent_amplitude(point, self.roots(tree.channel()), &ctx)
    }

    /// `Σ_components admixture · |Σ_trees amplitude|²` at `point`.
    pub fn intensity(&self, point: &DataPoint, status: &StatusManager) -> Result<f64> {
        let mut sum = 0.0;
        for c in &self.components {
            sum += self.parameters.real(c.admixture) * self.amplitude(c, point, status)?.norm_sqr();
        }
        Ok(sum)
    }

    fn partial_sum_of_log_intensity(
        &self,
        view: &mut PartitionView<'_>,
        pedestal: f64,
    ) -> Result<f64> {
        self.calculate(view)?;
        let mut sum = CompensatedSum::default();
        for point in &view.points {
            let l = self.intensity(point, view.status)?.ln() - pedestal;
            if l.is_nan() {
                return Err(Error::Computation("log intensity is NaN".to_string()));
            }
            sum += l;
        }
        view.status.set_all_variable(VariableStatus::Unchanged);
        Ok(sum.value())
    }

    /// `Σ (ln I(x) - pedestal)` over every point covered by `partitions`.
    ///
    /// Partitions are evaluated in parallel; their partial sums are combined
    /// in partition order, so the result does not depend on scheduling.
    pub fn sum_of_log_intensity(
        &self,
        data: &mut DataSet,
        partitions: &mut [DataPartition],
        pedestal: f64,
    ) -> Result<f64> {
        self.ensure_locked()?;
        if partitions.is_empty() {
            return Err(Error::Validation("no data partitions to evaluate".to_string()));
        }
        if self.components.is_empty() {
            return Err(Error::Configuration("model has no components".to_string()));
        }
        let mut views = data.partition_views(partitions)?;
        let partials: Vec<Result<f64>> = views
            .par_iter_mut()
            .map(|view| self.partial_sum_of_log_intensity(view, pedestal))
            .collect();
        let mut total = CompensatedSum::default();
        for p in partials {
            total += p?;
        }
        Ok(total.value())
    }
}

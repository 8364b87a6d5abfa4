//! # pwa-amplitude
//!
//! Amplitude caching and partitioned evaluation for partial-wave analysis.
//!
//! A [`Model`] is declared from final-state particles, decay channels with
//! spin amplitudes and line shapes, then locked. Locking enumerates every
//! decay tree over the interned particle combinations and fixes the layout
//! of the per-point cache. Data points carry that cache; a [`DataPartition`]
//! carries the status of each cached cell, so only cells whose inputs
//! changed are recomputed between evaluations.
//!
//! This crate provides:
//! - [`ParticleCombinationCache`]: interned, deduplicated particle groupings.
//! - [`AccessorRegistry`] and [`StatusManager`]: cache layout and cell status.
//! - [`AccessorCalculation`]: computation plug-in for user data accessors.
//! - [`Model::sum_of_log_intensity`]: parallel evaluation over partitions.
//! - [`ImportanceSampler`] and [`ModelIntegral`]: incremental normalisation.
//! - [`UnbinnedLikelihood`]: a [`pwa_core::traits::Objective`] for minimizers.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cached_value;
pub mod compensated_sum;
pub mod config;
pub mod data;
pub mod data_accessor;
pub mod decay_tree;
pub mod four_vector;
pub mod integral;
pub mod integrator;
pub mod kinematics;
pub mod likelihood;
pub mod line_shape;
pub mod model;
pub mod parameter;
pub mod partition;
pub mod particle_combination;
pub mod spin;
pub mod status;

pub use cached_value::{
    CachedRepr, CachedValueDependency, ComplexValue, FourVectorValue, RealValue, TypedValue,
    ValueKind,
};
pub use compensated_sum::CompensatedSum;
pub use config::{EvaluationConfig, Partitioning};
pub use data::{DataPoint, DataSet, PartitionView};
pub use data_accessor::{
    AccessorCalculation, AccessorContext, AccessorId, AccessorKind, AccessorRegistry, DataAccessor,
};
pub use decay_tree::{Daughter, DecayTree};
pub use four_vector::FourVector;
pub use integral::{DecayTreeVectorIntegral, ModelIntegral};
pub use integrator::ImportanceSampler;
pub use kinematics::HelicityAngles;
pub use likelihood::UnbinnedLikelihood;
pub use line_shape::{ConstantLineShape, LineShape, MassInput, RelativisticBreitWigner};
pub use model::{ChannelId, Model, ModelComponent, ParticleId};
pub use parameter::{ParameterId, ParameterSet, ParameterValue};
pub use partition::{Coverage, DataPartition};
pub use particle_combination::{Equivalence, Grouping, ParticleCombinationCache, PcId};
pub use spin::{DecayKinematics, SpinAmplitudeFormula, SpinProjection, UnitSpinAmplitude};
pub use status::{CalculationStatus, StatusManager, VariableStatus};

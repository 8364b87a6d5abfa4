//! Spin-amplitude plug-in contract.
//!
//! All spins are stored doubled (`2J`, `2M`) so half-integer values stay
//! integral. The phase convention (helicity, canonical, ...) belongs to the
//! formula; the engine only caches what [`SpinAmplitudeFormula::amplitude`]
//! returns for each [`SpinProjection`].

use crate::four_vector::FourVector;
use crate::kinematics::HelicityAngles;
use num_complex::Complex64;
use pwa_core::{Error, Result};

/// Parent and daughter spin projections of one spin-amplitude term.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SpinProjection {
    /// Parent `2M`
    pub two_m: i32,
    /// Daughter `2M`, one per daughter
    pub daughters: Vec<i32>,
}

/// Kinematic input of a spin amplitude for one particle combination.
#[derive(Debug, Clone, Copy)]
pub struct DecayKinematics<'a> {
    /// Four-momentum of the decaying combination
    pub parent: FourVector,
    /// Four-momenta of its daughters
    pub daughters: &'a [FourVector],
    /// Four-momentum of the grand-parent combination, if any
    pub frame: Option<FourVector>,
    /// Cached helicity angles of the first daughter, for two-body decays
    pub angles: Option<HelicityAngles>,
    /// Cached squared breakup momentum, for two-body decays
    pub breakup_momentum_squared: Option<f64>,
}

/// A spin-amplitude formula for one decay channel.
pub trait SpinAmplitudeFormula: Send + Sync {
    /// Formalism tag, e.g. `"helicity"`.
    fn formalism(&self) -> &str;

    /// Parent `2J`.
    fn initial_two_j(&self) -> u32;

    /// Daughter `2J`, in channel order.
    fn final_two_j(&self) -> Vec<u32>;

    /// Orbital angular momentum `L`.
    fn l(&self) -> u32;

    /// Total daughter spin, doubled.
    fn two_s(&self) -> u32;

    /// Projections for which the amplitude can be non-zero.
    fn projections(&self) -> Vec<SpinProjection>;

    /// Amplitude of one projection.
    fn amplitude(
        &self,
        projection: &SpinProjection,
        kin: &DecayKinematics<'_>,
    ) -> Result<Complex64>;
}

#[inline]
fn triangle(a: u32, b: u32, c: u32) -> bool {
    // doubled spins: |a-b| <= c <= a+b with matching parity
    a.abs_diff(b) <= c && c <= a + b && (a + b + c) % 2 == 0
}

/// Check `formula` against the spins of the channel it is attached to.
pub fn check_channel(
    formula: &dyn SpinAmplitudeFormula,
    parent_two_j: u32,
    daughter_two_j: &[u32],
) -> Result<()> {
    if daughter_two_j.len() < 2 {
        return Err(Error::Configuration(format!(
            "decay channel needs at least two daughters, got {}",
            daughter_two_j.len()
        )));
    }
    if formula.initial_two_j() != parent_two_j {
        return Err(Error::Configuration(format!(
            "{} spin amplitude has 2J={} but the parent has 2J={parent_two_j}",
            formula.formalism(),
            formula.initial_two_j()
        )));
    }
    if formula.final_two_j() != daughter_two_j {
        return Err(Error::Configuration(format!(
            "{} spin amplitude daughters have 2J={:?} but the channel has {daughter_two_j:?}",
            formula.formalism(),
            formula.final_two_j()
        )));
    }
    let two_l = 2 * formula.l();
    let two_s = formula.two_s();
    if !triangle(parent_two_j, two_l, two_s) {
        return Err(Error::Configuration(format!(
            "angular momentum not conserved: 2J={parent_two_j}, L={}, 2S={two_s}",
            formula.l()
        )));
    }
    if daughter_two_j.len() == 2 && !triangle(daughter_two_j[0], daughter_two_j[1], two_s) {
        return Err(Error::Configuration(format!(
            "daughter spins {daughter_two_j:?} cannot couple to 2S={two_s}"
        )));
    }
    for p in formula.projections() {
        if p.daughters.len() != daughter_two_j.len() {
            return Err(Error::Configuration(format!(
                "spin projection {p:?} does not match {} daughters",
                daughter_two_j.len()
            )));
        }
    }
    Ok(())
}

/// Every `2M` of a particle with spin `2J`.
pub fn projections_of(two_j: u32) -> impl Iterator<Item = i32> {
    let two_j = two_j as i32;
    (0..=two_j).map(move |k| -two_j + 2 * k)
}

/// Spin-independent amplitude `1` for a decay into spin-zero daughters with
/// `L = J`.
#[derive(Debug, Clone)]
pub struct UnitSpinAmplitude {
    two_j: u32,
    n_daughters: usize,
}

impl UnitSpinAmplitude {
    /// Parent with spin `2J` decaying to `n_daughters` spin-zero particles.
    pub fn new(two_j: u32, n_daughters: usize) -> Self {
        Self { two_j, n_daughters }
    }

    /// Spin-zero parent decaying to two spin-zero daughters.
    pub fn scalar() -> Self {
        Self::new(0, 2)
    }
}

impl SpinAmplitudeFormula for UnitSpinAmplitude {
    fn formalism(&self) -> &str {
        "unit"
    }

    fn initial_two_j(&self) -> u32 {
        self.two_j
    }

    fn final_two_j(&self) -> Vec<u32> {
        vec![0; self.n_daughters]
    }

    fn l(&self) -> u32 {
        self.two_j / 2
    }

    fn two_s(&self) -> u32 {
        0
    }

    fn projections(&self) -> Vec<SpinProjection> {
        projections_of(self.two_j)
            .map(|two_m| SpinProjection { two_m, daughters: vec![0; self.n_daughters] })
            .collect()
    }

    fn amplitude(&self, _: &SpinProjection, _: &DecayKinematics<'_>) -> Result<Complex64> {
        Ok(Complex64::new(1.0, 0.0))
    }
}

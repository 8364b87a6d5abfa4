//! Shared model builders and event generators for the integration tests.

#![allow(dead_code)]

use nalgebra::Vector3;
use pwa_amplitude::four_vector::{self, FourVector};
use pwa_amplitude::{
    ChannelId, DataSet, Model, ParticleId, RelativisticBreitWigner, SpinAmplitudeFormula,
    UnitSpinAmplitude,
};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};
use std::sync::Arc;

pub const PION_MASS: f64 = 0.139_57;
pub const KAON_MASS: f64 = 0.493_68;

/// `X -> R c`, `R -> a b` over three distinct particles, unlocked.
pub fn single_resonance_model(mass: f64, width: f64) -> Model {
    let mut m = Model::new();
    let fs = m.set_final_state(&[("a", 0), ("b", 0), ("c", 0)]).unwrap();
    let x = m.add_initial_state_particle("X", 0).unwrap();
    let r = m.add_decaying_particle("R", 0).unwrap();
    let bw = RelativisticBreitWigner::new(mass, width).unwrap();
    m.add_amplitude_component(r, Arc::new(bw)).unwrap();
    let scalar: Arc<dyn SpinAmplitudeFormula> = Arc::new(UnitSpinAmplitude::scalar());
    m.add_channel(r, &[fs[0], fs[1]], scalar.clone()).unwrap();
    m.add_channel(x, &[r, fs[2]], scalar).unwrap();
    m
}

/// Handles into [`two_resonance_model`].
pub struct TwoResonances {
    pub model: Model,
    pub f0_980: ParticleId,
    pub f0_1370: ParticleId,
    pub d_to_f0_980: ChannelId,
    pub d_to_f0_1370: ChannelId,
}

/// `D+ -> f0 pi+` through two interfering scalar resonances, each decaying to
/// `pi+ pi-`, with two identical pi+ in the final state. Unlocked.
pub fn two_resonance_model() -> TwoResonances {
    let mut m = Model::new();
    let fs = m.set_final_state(&[("pi+", 0), ("pi-", 0), ("pi+", 0)]).unwrap();
    let d = m.add_initial_state_particle("D+", 0).unwrap();
    let f0_980 = m.add_decaying_particle("f0(980)", 0).unwrap();
    let f0_1370 = m.add_decaying_particle("f0(1370)", 0).unwrap();
    let scalar: Arc<dyn SpinAmplitudeFormula> = Arc::new(UnitSpinAmplitude::scalar());
    let narrow = RelativisticBreitWigner::new(0.98, 0.07).unwrap();
    let broad = RelativisticBreitWigner::new(1.37, 0.35).unwrap();
    m.add_amplitude_component(f0_980, Arc::new(narrow)).unwrap();
    m.add_amplitude_component(f0_1370, Arc::new(broad)).unwrap();
    m.add_channel(f0_980, &[fs[0], fs[1]], scalar.clone()).unwrap();
    m.add_channel(f0_1370, &[fs[0], fs[1]], scalar.clone()).unwrap();
    let d_to_f0_980 = m.add_channel(d, &[f0_980, fs[0]], scalar.clone()).unwrap();
    let d_to_f0_1370 = m.add_channel(d, &[f0_1370, fs[0]], scalar).unwrap();
    TwoResonances { model: m, f0_980, f0_1370, d_to_f0_980, d_to_f0_1370 }
}

/// Three-body events in the rest frame of their parent: two momenta drawn
/// from a Gaussian, the third balancing them.
pub fn generate_events(n: usize, masses: [f64; 3], seed: u64) -> Vec<Vec<FourVector>> {
    let mut rng = StdRng::seed_from_u64(seed);
    let normal = Normal::new(0.0, 0.4).unwrap();
    (0..n)
        .map(|_| {
            let mut draw = || {
                Vector3::new(
                    normal.sample(&mut rng),
                    normal.sample(&mut rng),
                    normal.sample(&mut rng),
                )
            };
            let p1 = draw();
            let p2 = draw();
            let p3 = -(p1 + p2);
            vec![
                four_vector::from_mass_and_momentum(masses[0], p1),
                four_vector::from_mass_and_momentum(masses[1], p2),
                four_vector::from_mass_and_momentum(masses[2], p3),
            ]
        })
        .collect()
}

/// Data set of a locked model filled with `events`.
pub fn fill(model: &Model, events: &[Vec<FourVector>]) -> DataSet {
    let mut data = model.create_data_set(0).unwrap();
    for e in events {
        data.add(model, e).unwrap();
    }
    data
}

/// Locked two-resonance model with `n` pion events.
pub fn locked_two_resonances(n: usize, seed: u64) -> (TwoResonances, DataSet) {
    let mut t = two_resonance_model();
    t.model.lock().unwrap();
    let events = generate_events(n, [PION_MASS; 3], seed);
    let data = fill(&t.model, &events);
    (t, data)
}

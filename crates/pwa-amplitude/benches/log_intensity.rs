//! Criterion benchmarks for partitioned log-intensity evaluation.
//!
//! Measures `sum_of_log_intensity` over a three-pion sample for several
//! partition layouts, and the cost of a pass that reuses every cached line
//! shape against one that recomputes them.

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use nalgebra::Vector3;
use pwa_amplitude::four_vector::from_mass_and_momentum;
use pwa_amplitude::{
    DataPartition, DataSet, Model, ParameterId, ParameterValue, RelativisticBreitWigner,
    SpinAmplitudeFormula, UnitSpinAmplitude,
};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};
use std::hint::black_box;
use std::sync::Arc;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const PION_MASS: f64 = 0.139_57;

/// Locked `D+ -> f0 pi+` model with two scalar resonances; returns the mass
/// parameter of the first one.
fn make_model() -> (Model, ParameterId) {
    let mut m = Model::new();
    let fs = m.set_final_state(&[("pi+", 0), ("pi-", 0), ("pi+", 0)]).unwrap();
    let d = m.add_initial_state_particle("D+", 0).unwrap();
    let scalar: Arc<dyn SpinAmplitudeFormula> = Arc::new(UnitSpinAmplitude::scalar());
    let mut mass = None;
    for (name, m0, w) in [("f0(980)", 0.98, 0.07), ("f0(1370)", 1.37, 0.35)] {
        let f0 = m.add_decaying_particle(name, 0).unwrap();
        let bw = RelativisticBreitWigner::new(m0, w).unwrap();
        let params = m.add_amplitude_component(f0, Arc::new(bw)).unwrap();
        mass.get_or_insert(params[0]);
        m.add_channel(f0, &[fs[0], fs[1]], scalar.clone()).unwrap();
        m.add_channel(d, &[f0, fs[0]], scalar.clone()).unwrap();
    }
    m.lock().unwrap();
    (m, mass.unwrap())
}

fn make_data_set(model: &Model, n_events: usize, seed: u64) -> DataSet {
    let mut rng = StdRng::seed_from_u64(seed);
    let normal = Normal::new(0.0, 0.4).unwrap();
    let mut data = model.create_data_set(0).unwrap();
    for _ in 0..n_events {
        let mut draw = || {
            Vector3::new(normal.sample(&mut rng), normal.sample(&mut rng), normal.sample(&mut rng))
        };
        let p1 = draw();
        let p2 = draw();
        let momenta = [
            from_mass_and_momentum(PION_MASS, p1),
            from_mass_and_momentum(PION_MASS, p2),
            from_mass_and_momentum(PION_MASS, -(p1 + p2)),
        ];
        data.add(model, &momenta).unwrap();
    }
    data
}

// ---------------------------------------------------------------------------
// Benchmarks
// ---------------------------------------------------------------------------

fn bench_partitions(c: &mut Criterion) {
    let mut group = c.benchmark_group("sum_of_log_intensity");
    group.sample_size(30);

    let (mut model, mass) = make_model();
    let mut data = make_data_set(&model, 20_000, 42);

    for &k in &[1, 2, 4, 8] {
        let mut blocks = DataPartition::create_block(&data, k).unwrap();
        let mut toggle = false;
        group.bench_with_input(BenchmarkId::new("block_mass_changed", k), &k, |b, _| {
            b.iter(|| {
                toggle = !toggle;
                let m0 = ParameterValue::Real(if toggle { 0.98 } else { 0.99 });
                model.parameters_mut().set_value(mass, m0).unwrap();
                let v = model.sum_of_log_intensity(&mut data, &mut blocks, 0.0).unwrap();
                model.set_parameter_flags_to_unchanged();
                black_box(v)
            })
        });

        let mut weave = DataPartition::create_weave(&data, k).unwrap();
        model.sum_of_log_intensity(&mut data, &mut weave, 0.0).unwrap();
        model.set_parameter_flags_to_unchanged();
        group.bench_with_input(BenchmarkId::new("weave_cached", k), &k, |b, _| {
            b.iter(|| black_box(model.sum_of_log_intensity(&mut data, &mut weave, 0.0).unwrap()))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_partitions);
criterion_main!(benches);

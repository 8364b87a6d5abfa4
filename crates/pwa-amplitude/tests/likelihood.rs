//! Integration tests: Monte-Carlo integrals and the unbinned likelihood.

mod common;

use approx::assert_relative_eq;
use common::{KAON_MASS, PION_MASS};
use num_complex::Complex64;
use pwa_amplitude::{
    DataPartition, EvaluationConfig, ImportanceSampler, ModelIntegral, ParameterValue,
    Partitioning, UnbinnedLikelihood,
};
use pwa_core::Error;
use pwa_core::traits::Objective;

fn config(partitioning: Partitioning) -> EvaluationConfig {
    EvaluationConfig { partitioning, ..EvaluationConfig::default() }
}

fn two_resonance_likelihood(partitioning: Partitioning) -> UnbinnedLikelihood {
    let (t, data) = common::locked_two_resonances(120, 1);
    let phase_space = common::fill(&t.model, &common::generate_events(600, [PION_MASS; 3], 2));
    UnbinnedLikelihood::new(t.model, data, phase_space, config(partitioning)).unwrap()
}

#[test]
fn test_nll_matches_direct_evaluation() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut likelihood = two_resonance_likelihood(Partitioning::Block { n: 3 });
    let init = likelihood.parameter_init();
    let nll = likelihood.nll(&init).unwrap();

    let (t, mut data) = common::locked_two_resonances(120, 1);
    let mut mc = common::fill(&t.model, &common::generate_events(600, [PION_MASS; 3], 2));
    let mut data_parts = vec![DataPartition::whole(&data)];
    let mut mc_parts = vec![DataPartition::whole(&mc)];
    let mut integral = ModelIntegral::new(&t.model).unwrap();
    ImportanceSampler::calculate(&t.model, &mut integral, &mut mc, &mut mc_parts).unwrap();
    let norm = integral.integral(t.model.parameters());
    let sli = t.model.sum_of_log_intensity(&mut data, &mut data_parts, 0.0).unwrap();
    assert_relative_eq!(nll, -(sli - 120.0 * norm.ln()), max_relative = 1e-10);

    let summary = likelihood.summary().unwrap();
    assert_eq!(summary.n_data, 120);
    assert_eq!(summary.n_integration, 600);
    assert_eq!(summary.n_evaluations, 1);
    assert_relative_eq!(summary.integral, norm, max_relative = 1e-10);
}

#[test]
fn test_objective_exposes_free_parameters() {
    let likelihood = two_resonance_likelihood(Partitioning::Weave { n: 2 });
    // two complex D+ amplitudes, mass and width of both resonances
    assert_eq!(likelihood.n_parameters(), 8);
    let names = likelihood.parameter_names();
    assert_eq!(names.len(), 8);
    assert!(names.iter().any(|n| n == "f0(1370).breit_wigner.width"));
    assert_eq!(likelihood.parameter_bounds().len(), 8);
}

#[test]
fn test_wrong_parameter_count_rejected() {
    let mut likelihood = two_resonance_likelihood(Partitioning::Block { n: 1 });
    assert!(matches!(likelihood.nll(&[1.0, 2.0]), Err(Error::Validation(_))));
    assert_eq!(likelihood.n_evaluations(), 0);
    assert!(likelihood.summary().is_err());
}

#[test]
fn test_free_amplitude_change_reuses_integrals() {
    let mut likelihood = two_resonance_likelihood(Partitioning::Block { n: 4 });
    likelihood.evaluate().unwrap();

    let a = likelihood.model().components()[0].trees()[1].free_amplitude();
    let z = ParameterValue::Complex(Complex64::new(0.4, 0.9));
    likelihood.model_mut().parameters_mut().set_value(a, z).unwrap();
    let changed =
        ImportanceSampler::select_changed(likelihood.integral(), likelihood.model().parameters());
    assert!(changed.iter().all(Vec::is_empty));
    let nll = likelihood.evaluate().unwrap();

    let mut fresh = two_resonance_likelihood(Partitioning::Block { n: 4 });
    fresh.model_mut().parameters_mut().set_value(a, z).unwrap();
    assert_relative_eq!(nll, fresh.evaluate().unwrap(), max_relative = 1e-10);
}

#[test]
fn test_line_shape_change_reintegrates_affected_trees() {
    let mut likelihood = two_resonance_likelihood(Partitioning::Weave { n: 3 });
    likelihood.evaluate().unwrap();

    let model = likelihood.model();
    let (width, _) = model
        .parameters()
        .iter()
        .find(|(_, p)| p.name() == "f0(980).breit_wigner.width")
        .unwrap();
    likelihood.model_mut().parameters_mut().set_value(width, ParameterValue::Real(0.1)).unwrap();
    let changed =
        ImportanceSampler::select_changed(likelihood.integral(), likelihood.model().parameters());
    assert_eq!(changed, vec![vec![0]]);
    let nll = likelihood.evaluate().unwrap();

    let mut fresh = two_resonance_likelihood(Partitioning::Weave { n: 3 });
    fresh.model_mut().parameters_mut().set_value(width, ParameterValue::Real(0.1)).unwrap();
    assert_relative_eq!(nll, fresh.evaluate().unwrap(), max_relative = 1e-10);
}

#[test]
fn test_fit_fraction_of_single_tree_is_one() {
    let mut model = common::single_resonance_model(0.9, 0.1);
    model.lock().unwrap();
    let masses = [PION_MASS, PION_MASS, KAON_MASS];
    let data = common::fill(&model, &common::generate_events(50, masses, 3));
    let mc = common::fill(&model, &common::generate_events(400, masses, 4));
    let mut likelihood =
        UnbinnedLikelihood::new(model, data, mc, config(Partitioning::BlockSize { size: 64 }))
            .unwrap();
    likelihood.evaluate().unwrap();
    let summary = likelihood.summary().unwrap();
    assert_eq!(summary.fit_fractions.len(), 1);
    assert_relative_eq!(summary.total_fit_fraction(), 1.0, max_relative = 1e-12);
    assert!(summary.to_json().unwrap().contains("\"fit_fractions\""));
}

#[test]
fn test_dedicated_thread_pool_matches_global_pool() {
    let mut global = two_resonance_likelihood(Partitioning::Block { n: 4 });
    let (t, data) = common::locked_two_resonances(120, 1);
    let phase_space = common::fill(&t.model, &common::generate_events(600, [PION_MASS; 3], 2));
    let cfg = EvaluationConfig { threads: Some(2), ..config(Partitioning::Block { n: 4 }) };
    let mut pooled = UnbinnedLikelihood::new(t.model, data, phase_space, cfg).unwrap();
    assert_eq!(global.evaluate().unwrap().to_bits(), pooled.evaluate().unwrap().to_bits());
}

#[test]
fn test_generated_integral_matches_stored_sample() {
    let (t, _) = common::locked_two_resonances(0, 0);
    let events = common::generate_events(250, [PION_MASS; 3], 8);

    let mut mc = common::fill(&t.model, &events);
    let mut parts = DataPartition::create_block(&mc, 3).unwrap();
    let mut stored = ModelIntegral::new(&t.model).unwrap();
    ImportanceSampler::calculate(&t.model, &mut stored, &mut mc, &mut parts).unwrap();

    let mut generated = ModelIntegral::new(&t.model).unwrap();
    let mut source = events.into_iter();
    ImportanceSampler::calculate_with_generator(&t.model, &mut generated, 250, 64, || {
        source.next().ok_or_else(|| Error::Validation("generator exhausted".to_string()))
    })
    .unwrap();

    assert_eq!(generated.components()[0].n_points(), 250);
    let p = t.model.parameters();
    assert_relative_eq!(generated.integral(p), stored.integral(p), max_relative = 1e-10);
    let g = generated.components()[0].cached_integrals();
    let s = stored.components()[0].cached_integrals();
    assert_relative_eq!(g[(0, 1)].re, s[(0, 1)].re, epsilon = 1e-12, max_relative = 1e-9);
    assert_relative_eq!(g[(0, 1)].im, s[(0, 1)].im, epsilon = 1e-12, max_relative = 1e-9);
}

#[test]
fn test_empty_samples_rejected() {
    let (t, data) = common::locked_two_resonances(5, 1);
    let mc = t.model.create_data_set(0).unwrap();
    let err = UnbinnedLikelihood::new(t.model, data, mc, EvaluationConfig::default()).unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
}

//! Integration tests: data set lifecycle.

mod common;

use common::PION_MASS;
use pwa_amplitude::{DataPartition, DataSet, Model};
use pwa_core::Error;

fn locked_model() -> Model {
    let mut t = common::two_resonance_model();
    t.model.lock().unwrap();
    t.model
}

fn sum(model: &Model, data: &mut DataSet) -> f64 {
    let mut partitions = DataPartition::create_block(data, 2).unwrap();
    model.sum_of_log_intensity(data, &mut partitions, 0.0).unwrap()
}

#[test]
fn test_preallocated_set_matches_appended_set() {
    let model = locked_model();
    let events = common::generate_events(6, [PION_MASS; 3], 21);
    let mut appended = common::fill(&model, &events);

    let mut indexed = model.create_data_set(events.len()).unwrap();
    assert_eq!(indexed.len(), events.len());
    for (i, e) in events.iter().enumerate() {
        indexed.set_final_state_momenta(&model, i, e).unwrap();
    }
    indexed.shrink_to_fit();

    assert_eq!(indexed.points(), appended.points());
    assert_eq!(indexed.status(), appended.status());
    assert_eq!(sum(&model, &mut indexed).to_bits(), sum(&model, &mut appended).to_bits());
}

#[test]
fn test_set_momenta_rejects_bad_index_and_count() {
    let model = locked_model();
    let events = common::generate_events(3, [PION_MASS; 3], 4);
    let mut data = common::fill(&model, &events);
    let points = data.points().to_vec();
    let status = data.status().clone();

    let err = data.set_final_state_momenta(&model, 3, &events[0]).unwrap_err();
    assert!(matches!(err, Error::Validation(_)), "{err}");
    let err = data.set_final_state_momenta(&model, 1, &events[0][..2]).unwrap_err();
    assert!(matches!(err, Error::Validation(_)), "{err}");

    assert_eq!(data.points(), &points[..]);
    assert_eq!(data.status(), &status);
}

#[test]
fn test_remove_and_clear() {
    let model = locked_model();
    let events = common::generate_events(5, [PION_MASS; 3], 8);
    let mut data = common::fill(&model, &events);
    let second = data.point(1).unwrap().clone();
    let first = data.point(0).unwrap().clone();

    assert_eq!(data.remove(0).unwrap(), first);
    assert_eq!(data.len(), 4);
    assert_eq!(data.point(0), Some(&second));
    let err = data.remove(4).unwrap_err();
    assert!(matches!(err, Error::Validation(_)), "{err}");
    assert_eq!(data.len(), 4);

    let mut rest = common::fill(&model, &events[1..]);
    assert_eq!(sum(&model, &mut data).to_bits(), sum(&model, &mut rest).to_bits());

    data.clear();
    assert!(data.is_empty());
    assert!(data.point(0).is_none());
    assert!(data.remove(0).is_err());
    assert_eq!(data.add(&model, &events[0]).unwrap(), 0);
    assert_eq!(data.len(), 1);
}

#[test]
fn test_data_set_requires_locked_model() {
    let t = common::two_resonance_model();
    assert!(t.model.create_data_set(4).is_err());
}

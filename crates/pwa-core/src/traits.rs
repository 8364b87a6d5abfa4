//! Core traits for pwa-engine
//!
//! External fitting drivers only see an [`Objective`]; the amplitude engine
//! behind it stays an implementation detail.

use crate::Result;

/// Scalar objective exposed to minimizers.
///
/// Evaluation is `&mut self` because implementations keep incremental caches
/// that are refreshed on every call.
pub trait Objective: Send {
    /// Number of free parameters
    fn n_parameters(&self) -> usize;

    /// Parameter names, in the order used by [`Objective::nll`]
    fn parameter_names(&self) -> Vec<String>;

    /// Parameter bounds (min, max)
    fn parameter_bounds(&self) -> Vec<(f64, f64)>;

    /// Initial parameter values
    fn parameter_init(&self) -> Vec<f64>;

    /// Negative log-likelihood at `params`
    fn nll(&mut self, params: &[f64]) -> Result<f64>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    struct Parabola {
        calls: usize,
    }

    impl Objective for Parabola {
        fn n_parameters(&self) -> usize {
            1
        }

        fn parameter_names(&self) -> Vec<String> {
            vec!["x".into()]
        }

        fn parameter_bounds(&self) -> Vec<(f64, f64)> {
            vec![(f64::NEG_INFINITY, f64::INFINITY)]
        }

        fn parameter_init(&self) -> Vec<f64> {
            vec![0.0]
        }

        fn nll(&mut self, params: &[f64]) -> Result<f64> {
            let [x] = params else {
                let msg = format!("expected 1 parameter, got {}", params.len());
                return Err(Error::Validation(msg));
            };
            self.calls += 1;
            Ok((x - 2.0).powi(2))
        }
    }

    #[test]
    fn test_objective_is_object_safe() {
        let mut obj: Box<dyn Objective> = Box::new(Parabola { calls: 0 });
        assert_eq!(obj.n_parameters(), 1);
        assert_eq!(obj.nll(&[2.0]).unwrap(), 0.0);
        assert!(obj.nll(&[1.0, 2.0]).is_err());
    }
}

//! Line-shape plug-in contract and reference shapes.

use num_complex::Complex64;
use pwa_core::{Error, Result};

/// Invariant masses a line shape is evaluated at.
#[derive(Debug, Clone, Copy)]
pub struct MassInput<'a> {
    /// Invariant mass of the decaying combination
    pub mass: f64,
    /// Invariant masses of its daughters
    pub daughter_masses: &'a [f64],
}

/// A mass-dependent complex amplitude factor of a decaying particle.
///
/// Parameter values arrive in the order of [`LineShape::parameter_names`].
/// Near thresholds and poles an implementation must return a finite value or
/// an error; a non-finite value is rejected by the engine.
pub trait LineShape: Send + Sync {
    /// Short name.
    fn name(&self) -> &str;

    /// Names of the shape parameters.
    fn parameter_names(&self) -> Vec<String>;

    /// Initial parameter values.
    fn parameter_init(&self) -> Vec<f64>;

    /// Value at `input`.
    fn value(&self, input: &MassInput<'_>, params: &[f64]) -> Result<Complex64>;
}

/// Mass-independent line shape.
#[derive(Debug, Clone, Copy)]
pub struct ConstantLineShape {
    value: Complex64,
}

impl ConstantLineShape {
    /// Shape returning `value` everywhere.
    pub fn new(value: Complex64) -> Self {
        Self { value }
    }
}

impl LineShape for ConstantLineShape {
    fn name(&self) -> &str {
        "constant"
    }

    fn parameter_names(&self) -> Vec<String> {
        Vec::new()
    }

    fn parameter_init(&self) -> Vec<f64> {
        Vec::new()
    }

    fn value(&self, _input: &MassInput<'_>, _params: &[f64]) -> Result<Complex64> {
        Ok(self.value)
    }
}

/// Relativistic Breit-Wigner with constant width:
/// `1 / (m0² - m² - i m0 Γ)`.
#[derive(Debug, Clone, Copy)]
pub struct RelativisticBreitWigner {
    mass: f64,
    width: f64,
}

impl RelativisticBreitWigner {
    /// Shape with initial pole `mass` and `width`.
    pub fn new(mass: f64, width: f64) -> Result<Self> {
        if !(mass > 0.0 && width > 0.0) {
            return Err(Error::Configuration(format!(
                "Breit-Wigner needs positive mass and width, got m={mass}, w={width}"
            )));
        }
        Ok(Self { mass, width })
    }
}

impl LineShape for RelativisticBreitWigner {
    fn name(&self) -> &str {
        "breit_wigner"
    }

    fn parameter_names(&self) -> Vec<String> {
        vec!["mass".to_string(), "width".to_string()]
    }

    fn parameter_init(&self) -> Vec<f64> {
        vec![self.mass, self.width]
    }

    fn value(&self, input: &MassInput<'_>, params: &[f64]) -> Result<Complex64> {
        let [m0, w] = params else {
            return Err(Error::Validation(format!(
                "Breit-Wigner takes 2 parameters, got {}",
                params.len()
            )));
        };
        let denom = Complex64::new(m0 * m0 - input.mass * input.mass, -m0 * w);
        if denom.norm_sqr() == 0.0 {
            return Err(Error::Computation(format!("Breit-Wigner pole hit at m={}", input.mass)));
        }
        Ok(denom.inv())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_breit_wigner_peak() {
        let bw = RelativisticBreitWigner::new(0.775, 0.149).unwrap();
        let p = bw.parameter_init();
        let at_pole = bw.value(&MassInput { mass: 0.775, daughter_masses: &[] }, &p).unwrap();
        // purely imaginary on the pole
        assert_relative_eq!(at_pole.re, 0.0, epsilon = 1e-12);
        assert_relative_eq!(at_pole.im, 1.0 / (0.775 * 0.149), epsilon = 1e-9);
        let off = bw.value(&MassInput { mass: 1.1, daughter_masses: &[] }, &p).unwrap();
        assert!(off.norm() < at_pole.norm());
    }

    #[test]
    fn test_breit_wigner_rejects_bad_input() {
        assert!(RelativisticBreitWigner::new(-1.0, 0.1).is_err());
        let bw = RelativisticBreitWigner::new(1.0, 0.1).unwrap();
        assert!(bw.value(&MassInput { mass: 1.0, daughter_masses: &[] }, &[1.0]).is_err());
        let err = bw.value(&MassInput { mass: 1.0, daughter_masses: &[] }, &[1.0, 0.0]);
        assert!(matches!(err, Err(Error::Computation(_))));
    }
}

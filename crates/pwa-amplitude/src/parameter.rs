//! Model parameters: free amplitudes, admixtures and line-shape parameters.

use crate::status::VariableStatus;
use num_complex::Complex64;
use pwa_core::{Error, Result};

/// Index of a parameter within a [`ParameterSet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParameterId(usize);

impl ParameterId {
    /// Position in the set.
    pub fn index(self) -> usize {
        self.0
    }
}

/// Value of a parameter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ParameterValue {
    /// Real parameter
    Real(f64),
    /// Complex parameter; occupies two free slots `(re, im)`
    Complex(Complex64),
}

impl ParameterValue {
    /// Number of free slots.
    pub fn width(&self) -> usize {
        match self {
            ParameterValue::Real(_) => 1,
            ParameterValue::Complex(_) => 2,
        }
    }
}

/// A named parameter with change tracking.
#[derive(Debug, Clone)]
pub struct Parameter {
    name: String,
    value: ParameterValue,
    status: VariableStatus,
    bounds: (f64, f64),
}

impl Parameter {
    /// Name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current value.
    pub fn value(&self) -> ParameterValue {
        self.value
    }

    /// Change status.
    pub fn status(&self) -> VariableStatus {
        self.status
    }

    /// Bounds applied to every free slot.
    pub fn bounds(&self) -> (f64, f64) {
        self.bounds
    }
}

/// All parameters of a model.
#[derive(Debug, Clone, Default)]
pub struct ParameterSet {
    params: Vec<Parameter>,
}

const UNBOUNDED: (f64, f64) = (f64::NEG_INFINITY, f64::INFINITY);

impl ParameterSet {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, name: &str, value: ParameterValue, bounds: (f64, f64)) -> ParameterId {
        self.params.push(Parameter {
            name: name.to_string(),
            value,
            status: VariableStatus::Changed,
            bounds,
        });
        ParameterId(self.params.len() - 1)
    }

    /// Add an unbounded real parameter.
    pub fn add_real(&mut self, name: &str, value: f64) -> ParameterId {
        self.push(name, ParameterValue::Real(value), UNBOUNDED)
    }

    /// Add a real parameter restricted to `[0, inf)`.
    pub fn add_non_negative(&mut self, name: &str, value: f64) -> Result<ParameterId> {
        if !(value >= 0.0) {
            return Err(Error::Validation(format!("{name}: initial value {value} is negative")));
        }
        Ok(self.push(name, ParameterValue::Real(value), (0.0, f64::INFINITY)))
    }

    /// Add a complex parameter.
    pub fn add_complex(&mut self, name: &str, value: Complex64) -> ParameterId {
        self.push(name, ParameterValue::Complex(value), UNBOUNDED)
    }

    /// Parameter by id.
    pub fn get(&self, id: ParameterId) -> Option<&Parameter> {
        self.params.get(id.0)
    }

    /// Number of parameters.
    pub fn len(&self) -> usize {
        self.params.len()
    }

    /// `true` if the set is empty.
    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Parameters in id order.
    pub fn iter(&self) -> impl Iterator<Item = (ParameterId, &Parameter)> + '_ {
        self.params.iter().enumerate().map(|(i, p)| (ParameterId(i), p))
    }

    /// Change status of `id`.
    #[inline]
    pub fn status(&self, id: ParameterId) -> Option<VariableStatus> {
        self.params.get(id.0).map(|p| p.status)
    }

    /// Real value of `id`; complex parameters report their real part.
    #[inline]
    pub fn real(&self, id: ParameterId) -> f64 {
        match self.params.get(id.0).map(|p| p.value) {
            Some(ParameterValue::Real(v)) => v,
            Some(ParameterValue::Complex(z)) => z.re,
            None => f64::NAN,
        }
    }

    /// Complex value of `id`; real parameters are promoted.
    #[inline]
    pub fn complex(&self, id: ParameterId) -> Complex64 {
        match self.params.get(id.0).map(|p| p.value) {
            Some(ParameterValue::Real(v)) => Complex64::new(v, 0.0),
            Some(ParameterValue::Complex(z)) => z,
            None => Complex64::new(f64::NAN, f64::NAN),
        }
    }

    fn param_mut(&mut self, id: ParameterId) -> Result<&mut Parameter> {
        self.params
            .get_mut(id.0)
            .ok_or_else(|| Error::Validation(format!("unknown parameter {}", id.0)))
    }

    /// Assign a value; flags the parameter changed only if the value differs.
    ///
    /// Writing to a fixed parameter is rejected.
    pub fn set_value(&mut self, id: ParameterId, value: ParameterValue) -> Result<()> {
        let p = self.param_mut(id)?;
        if p.status == VariableStatus::Fixed {
            return Err(Error::Validation(format!("parameter {} is fixed", p.name)));
        }
        if std::mem::discriminant(&p.value) != std::mem::discriminant(&value) {
            return Err(Error::Validation(format!("parameter {}: value kind mismatch", p.name)));
        }
        let slots: &[f64] = match &value {
            ParameterValue::Real(v) => std::slice::from_ref(v),
            ParameterValue::Complex(z) => &[z.re, z.im],
        };
        if let Some(x) = slots.iter().find(|&&x| x < p.bounds.0 || x > p.bounds.1) {
            return Err(Error::Validation(format!(
                "parameter {}: value {x} outside [{}, {}]",
                p.name, p.bounds.0, p.bounds.1
            )));
        }
        if p.value != value {
            p.value = value;
            p.status = VariableStatus::Changed;
        }
        Ok(())
    }

    /// Fix `id` at its current value.
    pub fn fix(&mut self, id: ParameterId) -> Result<()> {
        self.param_mut(id)?.status = VariableStatus::Fixed;
        Ok(())
    }

    /// Release a fixed parameter; it is flagged changed.
    pub fn release(&mut self, id: ParameterId) -> Result<()> {
        self.param_mut(id)?.status = VariableStatus::Changed;
        Ok(())
    }

    /// `true` if `id` is fixed.
    pub fn is_fixed(&self, id: ParameterId) -> bool {
        self.status(id) == Some(VariableStatus::Fixed)
    }

    /// Flag every changed parameter unchanged.
    pub fn set_flags_to_unchanged(&mut self) {
        for p in &mut self.params {
            if p.status == VariableStatus::Changed {
                p.status = VariableStatus::Unchanged;
            }
        }
    }

    /// Non-fixed parameters in id order.
    pub fn free(&self) -> impl Iterator<Item = (ParameterId, &Parameter)> + '_ {
        self.iter().filter(|(_, p)| p.status != VariableStatus::Fixed)
    }

    /// Length of the flat free-parameter vector.
    pub fn n_free(&self) -> usize {
        self.free().map(|(_, p)| p.value.width()).sum()
    }

    /// Names of the flat free-parameter slots; complex parameters expand to
    /// `name.re`, `name.im`.
    pub fn free_names(&self) -> Vec<String> {
        let mut names = Vec::with_capacity(self.n_free());
        for (_, p) in self.free() {
            match p.value {
                ParameterValue::Real(_) => names.push(p.name.clone()),
                ParameterValue::Complex(_) => {
                    names.push(format!("{}.re", p.name));
                    names.push(format!("{}.im", p.name));
                }
            }
        }
        names
    }

    /// Flat free-parameter values.
    pub fn free_values(&self) -> Vec<f64> {
        let mut out = Vec::with_capacity(self.n_free());
        for (_, p) in self.free() {
            match p.value {
                ParameterValue::Real(v) => out.push(v),
                ParameterValue::Complex(z) => out.extend([z.re, z.im]),
            }
        }
        out
    }

    /// Bounds of the flat free-parameter slots.
    pub fn free_bounds(&self) -> Vec<(f64, f64)> {
        self.free().flat_map(|(_, p)| std::iter::repeat_n(p.bounds, p.value.width())).collect()
    }

    /// Assign the flat free-parameter vector.
    pub fn set_free_values(&mut self, values: &[f64]) -> Result<()> {
        let n = self.n_free();
        if values.len() != n {
            return Err(Error::Validation(format!(
                "expected {n} free parameter values, got {}",
                values.len()
            )));
        }
        let free: Vec<(ParameterId, ParameterValue)> =
            self.free().map(|(id, p)| (id, p.value)).collect();
        let mut offset = 0;
        for (id, current) in free {
            let value = match current {
                ParameterValue::Real(_) => ParameterValue::Real(values[offset]),
                ParameterValue::Complex(_) => {
                    ParameterValue::Complex(Complex64::new(values[offset], values[offset + 1]))
                }
            };
            offset += current.width();
            self.set_value(id, value)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_change_flag_only_on_new_value() {
        let mut ps = ParameterSet::new();
        let m = ps.add_real("mass", 0.775);
        ps.set_flags_to_unchanged();
        ps.set_value(m, ParameterValue::Real(0.775)).unwrap();
        assert_eq!(ps.status(m), Some(VariableStatus::Unchanged));
        ps.set_value(m, ParameterValue::Real(0.780)).unwrap();
        assert_eq!(ps.status(m), Some(VariableStatus::Changed));
    }

    #[test]
    fn test_free_vector_skips_fixed() {
        let mut ps = ParameterSet::new();
        let a = ps.add_complex("a", Complex64::new(1.0, 0.0));
        let b = ps.add_complex("b", Complex64::new(0.5, 0.5));
        let w = ps.add_non_negative("w", 2.0).unwrap();
        ps.fix(a).unwrap();
        assert_eq!(ps.n_free(), 3);
        assert_eq!(ps.free_names(), vec!["b.re", "b.im", "w"]);
        assert_eq!(ps.free_values(), vec![0.5, 0.5, 2.0]);

        ps.set_free_values(&[0.1, 0.2, 3.0]).unwrap();
        assert_eq!(ps.complex(b), Complex64::new(0.1, 0.2));
        assert_eq!(ps.real(w), 3.0);
        assert!(ps.set_free_values(&[0.0]).is_err());
        assert!(ps.set_value(a, ParameterValue::Complex(Complex64::new(2.0, 0.0))).is_err());
    }

    #[test]
    fn test_non_negative_bound_enforced() {
        let mut ps = ParameterSet::new();
        let w = ps.add_non_negative("w", 1.0).unwrap();
        assert!(ps.set_value(w, ParameterValue::Real(-0.1)).is_err());
        assert!(ps.add_non_negative("v", -1.0).is_err());
    }
}

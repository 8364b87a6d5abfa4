//! Monte-Carlo integrals of model components.
//!
//! For the decay trees `t_i` of one component, with data-independent factors
//! `a_i` and data-dependent amplitudes `A_i(x)`, the component integral is
//!
//! ```text
//! ∫ |Σ a_i A_i|² = Σ |a_i|² D_i + Σ_{i<j} 2 Re(conj(a_i) a_j O_ij)
//! D_i  = <|A_i|²>
//! O_ij = <conj(A_i) A_j>
//! ```
//!
//! Only the data-dependent means are accumulated, so a change of free
//! amplitudes needs no new pass over the sample. Sums from several
//! partitions combine by plain addition.

use crate::decay_tree::DecayTree;
use crate::model::Model;
use crate::parameter::{ParameterId, ParameterSet};
use nalgebra::DMatrix;
use num_complex::Complex64;
use pwa_core::{Error, FitFraction, Result};
use std::ops::{Add, AddAssign, Mul};
use std::sync::Arc;

/// One accumulated integral entry.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct IntegralElement<T> {
    value: T,
}

impl<T: Copy> IntegralElement<T> {
    /// Element holding `value`.
    pub fn new(value: T) -> Self {
        Self { value }
    }

    /// Held value.
    #[inline]
    pub fn value(&self) -> T {
        self.value
    }
}

impl<T: AddAssign> AddAssign for IntegralElement<T> {
    #[inline]
    fn add_assign(&mut self, rhs: Self) {
        self.value += rhs.value;
    }
}

impl<T: AddAssign> AddAssign<T> for IntegralElement<T> {
    #[inline]
    fn add_assign(&mut self, rhs: T) {
        self.value += rhs;
    }
}

impl<T: Add<Output = T>> Add for IntegralElement<T> {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self { value: self.value + rhs.value }
    }
}

impl<T: Mul<f64, Output = T>> Mul<f64> for IntegralElement<T> {
    type Output = Self;

    fn mul(self, rhs: f64) -> Self {
        Self { value: self.value * rhs }
    }
}

/// Integral accumulator for the decay trees of one model component.
#[derive(Debug, Clone)]
pub struct DecayTreeVectorIntegral {
    trees: Vec<Arc<DecayTree>>,
    diagonals: Vec<IntegralElement<f64>>,
    // off_diagonals[i][j - i - 1] holds Σ conj(A_i) A_j for j > i
    off_diagonals: Vec<Vec<IntegralElement<Complex64>>>,
    pub(crate) n_points: usize,
}

impl DecayTreeVectorIntegral {
    /// Empty accumulator for `trees`.
    pub fn new(trees: Vec<Arc<DecayTree>>) -> Self {
        let n = trees.len();
        Self {
            trees,
            diagonals: vec![IntegralElement::default(); n],
            off_diagonals: (0..n).map(|i| vec![IntegralElement::default(); n - i - 1]).collect(),
            n_points: 0,
        }
    }

    /// Same trees, all sums zero.
    pub(crate) fn zeroed(&self) -> Self {
        Self::new(self.trees.clone())
    }

    /// Decay trees, in matrix order.
    pub fn trees(&self) -> &[Arc<DecayTree>] {
        &self.trees
    }

    /// Number of accumulated points.
    pub fn n_points(&self) -> usize {
        self.n_points
    }

    fn mean_scale(&self) -> f64 {
        if self.n_points == 0 { 0.0 } else { 1.0 / self.n_points as f64 }
    }

    /// Mean `|A_i|²` per tree.
    pub fn diagonals(&self) -> Vec<f64> {
        let s = self.mean_scale();
        self.diagonals.iter().map(|d| d.value() * s).collect()
    }

    /// Mean `conj(A_i) A_j`.
    pub fn off_diagonal(&self, i: usize, j: usize) -> Complex64 {
        let s = self.mean_scale();
        match i.cmp(&j) {
            std::cmp::Ordering::Less => self.off_diagonals[i][j - i - 1].value() * s,
            std::cmp::Ordering::Greater => self.off_diagonals[j][i - j - 1].value().conj() * s,
            std::cmp::Ordering::Equal => Complex64::new(self.diagonals[i].value() * s, 0.0),
        }
    }

    /// Hermitian matrix of mean `conj(A_i) A_j`.
    pub fn cached_integrals(&self) -> DMatrix<Complex64> {
        let n = self.trees.len();
        DMatrix::from_fn(n, n, |i, j| self.off_diagonal(i, j))
    }

    fn factors(&self, parameters: &ParameterSet) -> Vec<Complex64> {
        self.trees.iter().map(|t| t.data_independent_amplitude(parameters)).collect()
    }

    /// Hermitian matrix of `conj(a_i) a_j <conj(A_i) A_j>`; its elements sum
    /// to [`DecayTreeVectorIntegral::integral`].
    pub fn integrals(&self, parameters: &ParameterSet) -> DMatrix<Complex64> {
        let a = self.factors(parameters);
        let c = self.cached_integrals();
        DMatrix::from_fn(a.len(), a.len(), |i, j| a[i].conj() * a[j] * c[(i, j)])
    }

    /// Integral of the component amplitude squared.
    pub fn integral(&self, parameters: &ParameterSet) -> f64 {
        let a = self.factors(parameters);
        let d = self.diagonals();
        let mut sum = 0.0;
        for i in 0..a.len() {
            sum += a[i].norm_sqr() * d[i];
            for j in i + 1..a.len() {
                sum += 2.0 * (a[i].conj() * a[j] * self.off_diagonal(i, j)).re;
            }
        }
        sum
    }

    /// Diagonal integral of every tree.
    pub fn diagonal_integrals(&self, parameters: &ParameterSet) -> Vec<f64> {
        let d = self.diagonals();
        self.factors(parameters).iter().zip(d).map(|(a, d)| a.norm_sqr() * d).collect()
    }

    /// Zero every sum involving one of the trees in `changed`.
    pub fn reset(&mut self, changed: &[usize]) {
        for &i in changed {
            self.diagonals[i] = IntegralElement::default();
            for (k, row) in self.off_diagonals.iter_mut().enumerate() {
                if k == i {
                    row.iter_mut().for_each(|e| *e = IntegralElement::default());
                } else if k < i {
                    row[i - k - 1] = IntegralElement::default();
                }
            }
        }
    }

    /// Add one point's data-dependent amplitudes to every sum involving a
    /// tree flagged in `changed`.
    pub(crate) fn accumulate(&mut self, amplitudes: &[Complex64], changed: &[bool]) {
        for (i, a) in amplitudes.iter().enumerate() {
            if changed[i] {
                self.diagonals[i] += a.norm_sqr();
            }
            for (k, b) in amplitudes[i + 1..].iter().enumerate() {
                if changed[i] || changed[i + 1 + k] {
                    self.off_diagonals[i][k] += a.conj() * b;
                }
            }
        }
        self.n_points += 1;
    }

    /// Add the sums of `other` over the same trees.
    pub(crate) fn merge(&mut self, other: &DecayTreeVectorIntegral) {
        for (d, o) in self.diagonals.iter_mut().zip(&other.diagonals) {
            *d += *o;
        }
        for (row, orow) in self.off_diagonals.iter_mut().zip(&other.off_diagonals) {
            for (e, o) in row.iter_mut().zip(orow) {
                *e += *o;
            }
        }
    }
}

/// Integrals of every component of a model.
#[derive(Debug, Clone)]
pub struct ModelIntegral {
    components: Vec<DecayTreeVectorIntegral>,
    admixtures: Vec<ParameterId>,
}

impl ModelIntegral {
    /// Empty integral of a locked model.
    pub fn new(model: &Model) -> Result<Self> {
        if !model.is_locked() {
            return Err(Error::Configuration("model must be locked first".to_string()));
        }
        Ok(Self {
            components: model
                .components()
                .iter()
                .map(|c| DecayTreeVectorIntegral::new(c.trees().to_vec()))
                .collect(),
            admixtures: model.components().iter().map(|c| c.admixture()).collect(),
        })
    }

    /// Per-component accumulators, in model component order.
    pub fn components(&self) -> &[DecayTreeVectorIntegral] {
        &self.components
    }

    pub(crate) fn components_mut(&mut self) -> &mut [DecayTreeVectorIntegral] {
        &mut self.components
    }

    /// Admixture-weighted sum of the component integrals.
    pub fn integral(&self, parameters: &ParameterSet) -> f64 {
        self.components
            .iter()
            .zip(&self.admixtures)
            .map(|(c, &w)| parameters.real(w) * c.integral(parameters))
            .sum()
    }

    /// Diagonal integral of every decay tree over the total integral.
    pub fn fit_fractions(&self, parameters: &ParameterSet) -> Vec<FitFraction> {
        let total = self.integral(parameters);
        let mut out = Vec::new();
        for (k, (c, &w)) in self.components.iter().zip(&self.admixtures).enumerate() {
            let weight = parameters.real(w);
            for (tree, d) in c.trees().iter().zip(c.diagonal_integrals(parameters)) {
                out.push(FitFraction {
                    component: k,
                    decay_tree: tree.describe(),
                    fraction: if total > 0.0 { weight * d / total } else { 0.0 },
                });
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(amps: &[Vec<Complex64>]) -> DecayTreeVectorIntegral {
        let n = amps[0].len();
        let mut vi = DecayTreeVectorIntegral {
            trees: Vec::new(),
            diagonals: vec![IntegralElement::default(); n],
            off_diagonals: (0..n).map(|i| vec![IntegralElement::default(); n - i - 1]).collect(),
            n_points: 0,
        };
        let all = vec![true; n];
        for a in amps {
            vi.accumulate(a, &all);
        }
        vi
    }

    fn c(re: f64, im: f64) -> Complex64 {
        Complex64::new(re, im)
    }

    #[test]
    fn test_means_and_hermitian_matrix() {
        let vi = filled(&[vec![c(1.0, 0.0), c(0.0, 1.0)], vec![c(2.0, 0.0), c(1.0, 1.0)]]);
        assert_eq!(vi.n_points(), 2);
        assert_eq!(vi.diagonals(), vec![2.5, 1.5]);
        // (1·i + 2·(1+i)) / 2
        assert_eq!(vi.off_diagonal(0, 1), c(1.0, 1.5));
        assert_eq!(vi.off_diagonal(1, 0), c(1.0, -1.5));
        let m = vi.cached_integrals();
        assert_eq!(m[(1, 0)], m[(0, 1)].conj());
    }

    #[test]
    fn test_merge_equals_single_pass() {
        let points = [vec![c(1.0, 0.5), c(0.2, 1.0)], vec![c(-0.5, 0.0), c(0.3, -0.7)]];
        let whole = filled(&points);
        let mut left = filled(&points[..1]);
        let right = filled(&points[1..]);
        left.merge(&right);
        left.n_points = 2;
        assert_eq!(left.diagonals(), whole.diagonals());
        assert_eq!(left.off_diagonal(0, 1), whole.off_diagonal(0, 1));
    }

    #[test]
    fn test_reset_clears_row_and_column() {
        let mut vi = filled(&[vec![c(1.0, 0.0), c(1.0, 0.0), c(1.0, 0.0)]]);
        vi.reset(&[1]);
        assert_eq!(vi.diagonals(), vec![1.0, 0.0, 1.0]);
        assert_eq!(vi.off_diagonal(0, 1), c(0.0, 0.0));
        assert_eq!(vi.off_diagonal(1, 2), c(0.0, 0.0));
        assert_eq!(vi.off_diagonal(0, 2), c(1.0, 0.0));
    }
}

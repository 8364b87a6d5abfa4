//! Compensated (Kahan-Babuška) summation.

use std::iter::Sum;
use std::ops::{Add, AddAssign};

/// Running sum with a separate compensation term for lost low-order bits.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CompensatedSum {
    sum: f64,
    compensation: f64,
}

impl CompensatedSum {
    /// Start from `value`.
    pub fn new(value: f64) -> Self {
        Self { sum: value, compensation: 0.0 }
    }

    /// Compensated total.
    #[inline]
    pub fn value(&self) -> f64 {
        self.sum + self.compensation
    }
}

impl AddAssign<f64> for CompensatedSum {
    #[inline]
    fn add_assign(&mut self, x: f64) {
        let t = self.sum + x;
        if self.sum.abs() >= x.abs() {
            self.compensation += (self.sum - t) + x;
        } else {
            self.compensation += (x - t) + self.sum;
        }
        self.sum = t;
    }
}

impl AddAssign for CompensatedSum {
    fn add_assign(&mut self, other: CompensatedSum) {
        *self += other.sum;
        self.compensation += other.compensation;
    }
}

impl Add<f64> for CompensatedSum {
    type Output = CompensatedSum;

    fn add(mut self, x: f64) -> CompensatedSum {
        self += x;
        self
    }
}

impl Sum<f64> for CompensatedSum {
    fn sum<I: Iterator<Item = f64>>(iter: I) -> Self {
        iter.fold(CompensatedSum::default(), |acc, x| acc + x)
    }
}

impl<'a> Sum<&'a f64> for CompensatedSum {
    fn sum<I: Iterator<Item = &'a f64>>(iter: I) -> Self {
        iter.copied().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compensated_sum_recovers_small_terms() {
        let mut s = CompensatedSum::new(1e16);
        for _ in 0..1000 {
            s += 1.0;
        }
        s += -1e16;
        assert_eq!(s.value(), 1000.0);
    }

    #[test]
    fn test_sum_of_pieces_matches_whole() {
        let xs: Vec<f64> = (0..10_000).map(|i| 1.0 / (1.0 + i as f64)).collect();
        let whole: CompensatedSum = xs.iter().sum();
        let mut merged = CompensatedSum::default();
        for chunk in xs.chunks(777) {
            merged += chunk.iter().sum::<CompensatedSum>();
        }
        assert!((whole.value() - merged.value()).abs() <= 1e-14 * whole.value());
    }
}

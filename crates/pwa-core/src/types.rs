//! Common data types for pwa-engine

use serde::{Deserialize, Serialize};

/// Fit fraction of one decay tree within one model component
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitFraction {
    /// Model component (initial-state spin projection group)
    pub component: usize,
    /// Human-readable decay tree label
    pub decay_tree: String,
    /// Diagonal integral over total integral
    pub fraction: f64,
}

/// Snapshot of one likelihood evaluation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationSummary {
    /// Sum of log intensities over the data sample
    pub sum_of_log_intensity: f64,
    /// Monte-Carlo estimate of the model integral
    pub integral: f64,
    /// Negative log-likelihood `-(Σ ln I - N ln ∫I)`
    pub nll: f64,
    /// Number of data points
    pub n_data: usize,
    /// Number of Monte-Carlo points used for normalization
    pub n_integration: usize,
    /// Number of objective evaluations performed so far
    pub n_evaluations: usize,
    /// Fit fractions per decay tree
    pub fit_fractions: Vec<FitFraction>,
}

impl EvaluationSummary {
    /// Sum of all fit fractions.
    ///
    /// Differs from one by the interference contribution.
    pub fn total_fit_fraction(&self) -> f64 {
        self.fit_fractions.iter().map(|f| f.fraction).sum()
    }

    /// Serialize to pretty JSON
    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_summary_json_roundtrip() {
        let s = EvaluationSummary {
            sum_of_log_intensity: -12.5,
            integral: 3.0,
            nll: 25.0,
            n_data: 10,
            n_integration: 1000,
            n_evaluations: 4,
            fit_fractions: vec![
                FitFraction { component: 0, decay_tree: "a".into(), fraction: 0.75 },
                FitFraction { component: 0, decay_tree: "b".into(), fraction: 0.5 },
            ],
        };
        let back: EvaluationSummary = serde_json::from_str(&s.to_json().unwrap()).unwrap();
        assert_eq!(back.n_integration, 1000);
        assert_eq!(back.fit_fractions, s.fit_fractions);
        assert_relative_eq!(back.total_fit_fraction(), 1.25, epsilon = 1e-15);
    }
}

//! Extended-free unbinned likelihood of a model.

use crate::config::EvaluationConfig;
use crate::data::DataSet;
use crate::integral::ModelIntegral;
use crate::integrator::ImportanceSampler;
use crate::model::Model;
use crate::partition::DataPartition;
use pwa_core::traits::Objective;
use pwa_core::{Error, EvaluationSummary, Result};
use std::sync::Arc;

#[derive(Debug, Clone, Copy)]
struct LastEvaluation {
    sum_of_log_intensity: f64,
    integral: f64,
    nll: f64,
}

/// `-(Σ_i (ln I(x_i) - pedestal) - N ln ∫I)` over a data sample, normalised
/// by a phase-space Monte-Carlo sample.
///
/// The pedestal shifts the value by a constant `N · pedestal`.
#[derive(Debug)]
pub struct UnbinnedLikelihood {
    model: Model,
    data: DataSet,
    data_partitions: Vec<DataPartition>,
    phase_space: DataSet,
    phase_space_partitions: Vec<DataPartition>,
    integral: ModelIntegral,
    config: EvaluationConfig,
    pool: Option<Arc<rayon::ThreadPool>>,
    n_evaluations: usize,
    last: Option<LastEvaluation>,
}

impl UnbinnedLikelihood {
    /// Bundle a locked model with its data and phase-space samples.
    pub fn new(
        model: Model,
        data: DataSet,
        phase_space: DataSet,
        config: EvaluationConfig,
    ) -> Result<Self> {
        config.validate()?;
        if data.is_empty() {
            return Err(Error::Validation("data sample is empty".to_string()));
        }
        if phase_space.is_empty() {
            return Err(Error::Validation("phase-space sample is empty".to_string()));
        }
        let integral = ModelIntegral::new(&model)?;
        let data_partitions = config.partitions(&data)?;
        let phase_space_partitions = config.partitions(&phase_space)?;
        let pool = match config.threads {
            Some(n) => Some(Arc::new(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(n)
                    .build()
                    .map_err(|e| Error::Computation(format!("failed to create thread pool: {e}")))?,
            )),
            None => None,
        };
        log::info!(
            "likelihood over {} data points ({} partitions), {} phase-space points ({} partitions)",
            data.len(),
            data_partitions.len(),
            phase_space.len(),
            phase_space_partitions.len()
        );
        Ok(Self {
            model,
            data,
            data_partitions,
            phase_space,
            phase_space_partitions,
            integral,
            config,
            pool,
            n_evaluations: 0,
            last: None,
        })
    }

    /// The model.
    pub fn model(&self) -> &Model {
        &self.model
    }

    /// The model, for parameter edits between evaluations.
    pub fn model_mut(&mut self) -> &mut Model {
        &mut self.model
    }

    /// Current integral accumulators.
    pub fn integral(&self) -> &ModelIntegral {
        &self.integral
    }

    /// Number of evaluations so far.
    pub fn n_evaluations(&self) -> usize {
        self.n_evaluations
    }

    /// Evaluate at the model's current parameters.
    pub fn evaluate(&mut self) -> Result<f64> {
        match self.pool.clone() {
            Some(pool) => pool.install(|| self.evaluate_here()),
            None => self.evaluate_here(),
        }
    }

    fn evaluate_here(&mut self) -> Result<f64> {
        ImportanceSampler::calculate(
            &self.model,
            &mut self.integral,
            &mut self.phase_space,
            &mut self.phase_space_partitions,
        )?;
        let integral = self.integral.integral(self.model.parameters());
        if !(integral > 0.0 && integral.is_finite()) {
            return Err(Error::Computation(format!("model integral is {integral}")));
        }
        let sum_of_log_intensity = self.model.sum_of_log_intensity(
            &mut self.data,
            &mut self.data_partitions,
            self.config.pedestal,
        )?;
        let nll = -(sum_of_log_intensity - self.data.len() as f64 * integral.ln());
        self.model.set_parameter_flags_to_unchanged();
        self.n_evaluations += 1;
        self.last = Some(LastEvaluation { sum_of_log_intensity, integral, nll });
        log::debug!("evaluation {}: nll = {nll}", self.n_evaluations);
        Ok(nll)
    }

    /// Summary of the last evaluation.
    pub fn summary(&self) -> Result<EvaluationSummary> {
        let last = self
            .last
            .ok_or_else(|| Error::Validation("likelihood has not been evaluated".to_string()))?;
        Ok(EvaluationSummary {
            sum_of_log_intensity: last.sum_of_log_intensity,
            integral: last.integral,
            nll: last.nll,
            n_data: self.data.len(),
            n_integration: self.phase_space.len(),
            n_evaluations: self.n_evaluations,
            fit_fractions: self.integral.fit_fractions(self.model.parameters()),
        })
    }
}

impl Objective for UnbinnedLikelihood {
    fn n_parameters(&self) -> usize {
        self.model.parameters().n_free()
    }

    fn parameter_names(&self) -> Vec<String> {
        self.model.parameters().free_names()
    }

    fn parameter_bounds(&self) -> Vec<(f64, f64)> {
        self.model.parameters().free_bounds()
    }

    fn parameter_init(&self) -> Vec<f64> {
        self.model.parameters().free_values()
    }

    fn nll(&mut self, params: &[f64]) -> Result<f64> {
        self.model.parameters_mut().set_free_values(params)?;
        self.evaluate()
    }
}

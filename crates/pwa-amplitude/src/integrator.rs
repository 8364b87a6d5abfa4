//! Importance-sampling integration of a model over a phase-space sample.

use crate::data::{DataSet, PartitionView};
use crate::decay_tree::select_changed;
use crate::four_vector::FourVector;
use crate::integral::{DecayTreeVectorIntegral, ModelIntegral};
use crate::model::Model;
use crate::parameter::ParameterSet;
use crate::partition::DataPartition;
use crate::status::VariableStatus;
use num_complex::Complex64;
use pwa_core::{Error, Result};
use rayon::prelude::*;

/// Fills a [`ModelIntegral`] from Monte-Carlo points distributed like the
/// phase space of the model.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImportanceSampler;

impl ImportanceSampler {
    /// Trees per component whose sums must be recomputed: those with a
    /// changed line-shape parameter, or every tree of a component that was
    /// never integrated.
    pub fn select_changed(integral: &ModelIntegral, parameters: &ParameterSet) -> Vec<Vec<usize>> {
        integral
            .components()
            .iter()
            .map(|c| {
                if c.n_points() == 0 {
                    (0..c.trees().len()).collect()
                } else {
                    select_changed(c.trees(), parameters)
                }
            })
            .collect()
    }

    fn masks(integral: &ModelIntegral, changed: &[Vec<usize>]) -> Vec<Vec<bool>> {
        integral
            .components()
            .iter()
            .zip(changed)
            .map(|(c, ch)| {
                let mut mask = vec![false; c.trees().len()];
                ch.iter().for_each(|&i| mask[i] = true);
                mask
            })
            .collect()
    }

    fn partial(
        model: &Model,
        integral: &ModelIntegral,
        masks: &[Vec<bool>],
        view: &mut PartitionView<'_>,
    ) -> Result<Vec<DecayTreeVectorIntegral>> {
        model.calculate(view)?;
        let mut out: Vec<DecayTreeVectorIntegral> =
            integral.components().iter().map(DecayTreeVectorIntegral::zeroed).collect();
        let mut amplitudes: Vec<Complex64> = Vec::new();
        for point in &view.points {
            for ((c, acc), mask) in integral.components().iter().zip(&mut out).zip(masks) {
                if !mask.iter().any(|&m| m) {
                    continue;
                }
                amplitudes.clear();
                for tree in c.trees() {
                    amplitudes.push(model.data_dependent_amplitude(tree, point, view.status)?);
                }
                acc.accumulate(&amplitudes, mask);
            }
        }
        view.status.set_all_variable(VariableStatus::Unchanged);
        Ok(out)
    }

    fn accumulate(
        model: &Model,
        integral: &mut ModelIntegral,
        masks: &[Vec<bool>],
        data: &mut DataSet,
        partitions: &mut [DataPartition],
    ) -> Result<usize> {
        let shared: &ModelIntegral = integral;
        let mut views = data.partition_views(partitions)?;
        let n: usize = views.iter().map(PartitionView::len).sum();
        let partials: Vec<Result<Vec<DecayTreeVectorIntegral>>> = views
            .par_iter_mut()
            .map(|view| Self::partial(model, shared, masks, view))
            .collect();
        for p in partials {
            for (c, part) in integral.components_mut().iter_mut().zip(p?) {
                c.merge(&part);
            }
        }
        Ok(n)
    }

    /// Recompute the sums of every changed tree over `partitions` of `data`.
    ///
    /// Partial sums are computed per partition in parallel and merged in
    /// partition order.
    pub fn calculate(
        model: &Model,
        integral: &mut ModelIntegral,
        data: &mut DataSet,
        partitions: &mut [DataPartition],
    ) -> Result<()> {
        if partitions.is_empty() {
            return Err(Error::Validation("no integration partitions".to_string()));
        }
        let changed = Self::select_changed(integral, model.parameters());
        if changed.iter().all(Vec::is_empty) {
            return Ok(());
        }
        log::debug!(
            "integrating changed decay trees: {:?}",
            changed.iter().map(Vec::len).collect::<Vec<_>>()
        );
        for (c, ch) in integral.components_mut().iter_mut().zip(&changed) {
            c.reset(ch);
        }
        let masks = Self::masks(integral, &changed);
        let n = Self::accumulate(model, integral, &masks, data, partitions)?;
        for c in integral.components_mut() {
            c.n_points = n;
        }
        Ok(())
    }

    /// Integrate from scratch over `n_points` points drawn from `generate`,
    /// held in memory at most `batch_size` at a time.
    pub fn calculate_with_generator(
        model: &Model,
        integral: &mut ModelIntegral,
        n_points: usize,
        batch_size: usize,
        mut generate: impl FnMut() -> Result<Vec<FourVector>>,
    ) -> Result<()> {
        if batch_size == 0 {
            return Err(Error::Validation("batch size must be positive".to_string()));
        }
        let all: Vec<Vec<usize>> =
            integral.components().iter().map(|c| (0..c.trees().len()).collect()).collect();
        for (c, ch) in integral.components_mut().iter_mut().zip(&all) {
            c.reset(ch);
        }
        let masks = Self::masks(integral, &all);
        let mut done = 0;
        while done < n_points {
            let n = batch_size.min(n_points - done);
            let mut batch = model.create_data_set(0)?;
            for _ in 0..n {
                batch.add(model, &generate()?)?;
            }
            let mut partitions = vec![DataPartition::whole(&batch)];
            done += Self::accumulate(model, integral, &masks, &mut batch, &mut partitions)?;
        }
        for c in integral.components_mut() {
            c.n_points = done;
        }
        log::debug!("integrated {done} generated points in batches of {batch_size}");
        Ok(())
    }
}

//! # Training Harness
//!
//! Mini-batch maximum-likelihood training for flow models. The models expose
//! a loss and a flat parameter vector through
//! [`DensityEstimator`](crate::flow::DensityEstimator); the harness estimates
//! gradients with central finite differences and applies them through an
//! [`Optimizer`]. Running means of the loss terms are kept in separate
//! trackers for diagnostics.

mod optimizer;

pub use optimizer::{Adam, Optimizer, Sgd};

use ndarray::Array2;
use rand::seq::SliceRandom;

use crate::config;
use crate::error::Result;
use crate::flow::{DensityEstimator, LossTerms};

/// Running mean of a scalar metric
#[derive(Debug, Clone, Default)]
pub struct MetricTracker {
    sum: f64,
    count: usize,
}

impl MetricTracker {
    /// Fold one observation into the mean
    pub fn update(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
    }

    /// Current mean, 0 when nothing was observed
    pub fn result(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }

    /// Forget all observations
    pub fn reset(&mut self) {
        self.sum = 0.0;
        self.count = 0;
    }
}

/// Central finite-difference gradient of the loss with respect to the flat
/// parameter vector
///
/// The model is restored to its original parameters before returning. Costs
/// two loss evaluations per parameter; intended for moderate network sizes
/// or as a reference for exact-gradient backends.
pub fn numeric_gradient<M: DensityEstimator>(
    model: &mut M,
    x: &Array2<f64>,
    epsilon: f64,
) -> Result<Vec<f64>> {
    let params = model.parameters();
    let mut probe = params.clone();
    let mut gradients = vec![0.0; params.len()];

    for i in 0..params.len() {
        probe[i] = params[i] + epsilon;
        model.set_parameters(&probe)?;
        let plus = model.log_loss(x)?.loss;

        probe[i] = params[i] - epsilon;
        model.set_parameters(&probe)?;
        let minus = model.log_loss(x)?.loss;

        probe[i] = params[i];
        gradients[i] = (plus - minus) / (2.0 * epsilon);
    }

    model.set_parameters(&params)?;
    Ok(gradients)
}

/// Mini-batch training harness with best-parameter tracking
pub struct Trainer {
    grad_epsilon: f64,
    loss_tracker: MetricTracker,
    logprob_tracker: MetricTracker,
    logdet_tracker: MetricTracker,
    best_val_loss: f64,
    best_params: Option<Vec<f64>>,
}

impl Default for Trainer {
    fn default() -> Self {
        Self::new()
    }
}

impl Trainer {
    /// Create a trainer with the default gradient perturbation
    pub fn new() -> Self {
        Self {
            grad_epsilon: config::DEFAULT_GRAD_EPSILON,
            loss_tracker: MetricTracker::default(),
            logprob_tracker: MetricTracker::default(),
            logdet_tracker: MetricTracker::default(),
            best_val_loss: f64::INFINITY,
            best_params: None,
        }
    }

    /// Override the finite-difference perturbation
    pub fn with_grad_epsilon(mut self, epsilon: f64) -> Self {
        self.grad_epsilon = epsilon;
        self
    }

    /// One gradient step on a batch
    ///
    /// Computes gradients, applies them through the optimizer, folds the
    /// pre-update loss terms into the trackers and returns the running
    /// metrics.
    pub fn train_step<M, O>(
        &mut self,
        model: &mut M,
        optimizer: &mut O,
        batch: &Array2<f64>,
    ) -> Result<LossTerms>
    where
        M: DensityEstimator,
        O: Optimizer + ?Sized,
    {
        let terms = model.log_loss(batch)?;
        let gradients = numeric_gradient(model, batch, self.grad_epsilon)?;
        let mut params = model.parameters();
        optimizer.step(&mut params, &gradients);
        model.set_parameters(&params)?;

        self.track(terms);
        Ok(self.metrics())
    }

    /// Metric update on a batch without a parameter update
    pub fn test_step<M: DensityEstimator>(
        &mut self,
        model: &M,
        batch: &Array2<f64>,
    ) -> Result<LossTerms> {
        let terms = model.log_loss(batch)?;
        self.track(terms);
        Ok(self.metrics())
    }

    /// One pass over the data in shuffled mini-batches; returns the mean
    /// training loss of the epoch
    pub fn train_epoch<M, O>(
        &mut self,
        model: &mut M,
        optimizer: &mut O,
        data: &Array2<f64>,
        batch_size: usize,
    ) -> Result<f64>
    where
        M: DensityEstimator,
        O: Optimizer + ?Sized,
    {
        let n = data.nrows();
        let batch_size = batch_size.clamp(1, n.max(1));

        let mut indices: Vec<usize> = (0..n).collect();
        indices.shuffle(&mut rand::thread_rng());

        self.reset_metrics();
        for chunk in indices.chunks(batch_size) {
            let mut batch = Array2::zeros((chunk.len(), data.ncols()));
            for (r, &idx) in chunk.iter().enumerate() {
                batch.row_mut(r).assign(&data.row(idx));
            }
            self.train_step(model, optimizer, &batch)?;
        }

        let mean_loss = self.loss_tracker.result();
        log::debug!("epoch finished: loss = {:.6}", mean_loss);
        Ok(mean_loss)
    }

    /// Evaluate on validation data, remembering the best parameters seen
    pub fn validate<M: DensityEstimator>(
        &mut self,
        model: &M,
        data: &Array2<f64>,
    ) -> Result<f64> {
        let loss = model.log_loss(data)?.loss;
        if loss < self.best_val_loss {
            self.best_val_loss = loss;
            self.best_params = Some(model.parameters());
        }
        Ok(loss)
    }

    /// Restore the best parameters remembered by `validate`
    pub fn restore_best<M: DensityEstimator>(&self, model: &mut M) -> Result<()> {
        if let Some(ref params) = self.best_params {
            model.set_parameters(params)?;
        }
        Ok(())
    }

    /// Best validation loss seen so far
    pub fn best_loss(&self) -> f64 {
        self.best_val_loss
    }

    /// Current running means of loss, logprob and logdet
    pub fn metrics(&self) -> LossTerms {
        LossTerms {
            loss: self.loss_tracker.result(),
            logprob: self.logprob_tracker.result(),
            logdet: self.logdet_tracker.result(),
        }
    }

    /// Reset the metric trackers
    pub fn reset_metrics(&mut self) {
        self.loss_tracker.reset();
        self.logprob_tracker.reset();
        self.logdet_tracker.reset();
    }

    fn track(&mut self, terms: LossTerms) {
        self.loss_tracker.update(terms.loss);
        self.logprob_tracker.update(terms.logprob);
        self.logdet_tracker.update(terms.logdet);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{FlowConfig, FlowModel};
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn tiny_model() -> FlowModel {
        let cfg = FlowConfig::new(2)
            .with_n_coupling(1)
            .with_num_nodes(3)
            .with_seed(23);
        FlowModel::new(&cfg).unwrap()
    }

    #[test]
    fn test_metric_tracker() {
        let mut tracker = MetricTracker::default();
        assert_eq!(tracker.result(), 0.0);

        tracker.update(2.0);
        tracker.update(4.0);
        assert_abs_diff_eq!(tracker.result(), 3.0, epsilon = 1e-12);

        tracker.reset();
        assert_eq!(tracker.result(), 0.0);
    }

    #[test]
    fn test_numeric_gradient_restores_params() {
        let mut model = tiny_model();
        let before = model.parameters();

        let batch = array![[0.2, -0.3], [0.4, 0.1]];
        let gradients = numeric_gradient(&mut model, &batch, 1e-5).unwrap();

        assert_eq!(gradients.len(), before.len());
        assert_eq!(model.parameters(), before);
        assert!(gradients.iter().all(|g| g.is_finite()));
    }

    #[test]
    fn test_train_step_updates_params_and_metrics() {
        let mut model = tiny_model();
        let mut optimizer = Sgd::new(0.05);
        let mut trainer = Trainer::new();

        let batch = array![[0.5, -0.5], [0.1, 0.9], [-0.7, 0.3]];
        let before = model.parameters();
        let metrics = trainer.train_step(&mut model, &mut optimizer, &batch).unwrap();

        assert!(metrics.loss.is_finite());
        assert_abs_diff_eq!(
            metrics.loss,
            metrics.logprob + metrics.logdet,
            epsilon = 1e-12
        );
        assert_ne!(model.parameters(), before);
    }

    #[test]
    fn test_test_step_leaves_params_unchanged() {
        let model = tiny_model();
        let mut trainer = Trainer::new();

        let batch = array![[0.5, -0.5]];
        let before = model.parameters();
        let metrics = trainer.test_step(&model, &batch).unwrap();

        assert!(metrics.loss.is_finite());
        assert_eq!(model.parameters(), before);
    }

    #[test]
    fn test_training_reduces_loss() {
        let mut model = tiny_model();
        let mut optimizer = Adam::new(0.01);
        let mut trainer = Trainer::new();

        // narrow gaussian blob away from the origin
        let data = array![
            [1.0, 1.1],
            [0.9, 1.0],
            [1.1, 0.9],
            [1.0, 0.95],
            [0.95, 1.05],
            [1.05, 1.0]
        ];

        let initial = model.log_loss(&data).unwrap().loss;
        for _ in 0..30 {
            trainer.train_epoch(&mut model, &mut optimizer, &data, 6).unwrap();
        }
        let trained = model.log_loss(&data).unwrap().loss;

        assert!(trained < initial);
    }

    #[test]
    fn test_validate_and_restore_best() {
        let mut model = tiny_model();
        let mut trainer = Trainer::new();
        let data = array![[0.2, 0.1], [-0.1, 0.3]];

        trainer.validate(&model, &data).unwrap();
        let best = model.parameters();

        // degrade the model, then restore
        let worse: Vec<f64> = best.iter().map(|p| p + 10.0).collect();
        model.set_parameters(&worse).unwrap();
        trainer.restore_best(&mut model).unwrap();

        assert_eq!(model.parameters(), best);
        assert!(trainer.best_loss().is_finite());
    }
}

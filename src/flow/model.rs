//! # Masked Autoregressive Flow Model
//!
//! Full flow model (MAF, arXiv:1705.07057): a chain of coupling stacks
//! interleaved with fixed permutations, transforming data into a standard
//! Gaussian latent space and back.
//!
//! The data-to-latent direction is a single pass per coupling layer with a
//! cheap triangular log-determinant. The latent-to-data direction inverts
//! each layer one feature at a time, re-evaluating the coupling stack per
//! feature, so it costs `in_shape` forward evaluations per layer.

use ndarray::{Array1, Array2, ArrayView1};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

use super::coupling::{CouplingStack, Permutation};
use super::made::Activation;
use crate::config;
use crate::error::{Error, Result};

/// Configuration for flow models
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowConfig {
    /// Number of coupling layers
    pub n_coupling: usize,
    /// Number of inputs (excluding conditioning parameters)
    pub in_shape: usize,
    /// Number of hidden layers per MADE network
    pub num_hidden_layers: usize,
    /// Number of nodes per hidden layer
    pub num_nodes: usize,
    /// Seed for construction-time randomness
    pub seed: u64,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            n_coupling: config::DEFAULT_NUM_COUPLING,
            in_shape: 2,
            num_hidden_layers: config::DEFAULT_NUM_HIDDEN_LAYERS,
            num_nodes: config::DEFAULT_NUM_NODES,
            seed: config::DEFAULT_SEED,
        }
    }
}

impl FlowConfig {
    /// Create a configuration for the given input dimensionality
    pub fn new(in_shape: usize) -> Self {
        Self {
            in_shape,
            ..Default::default()
        }
    }

    /// Set the number of coupling layers
    pub fn with_n_coupling(mut self, n_coupling: usize) -> Self {
        self.n_coupling = n_coupling;
        self
    }

    /// Set the number of hidden layers per MADE network
    pub fn with_num_hidden_layers(mut self, num_hidden_layers: usize) -> Self {
        self.num_hidden_layers = num_hidden_layers;
        self
    }

    /// Set the number of nodes per hidden layer
    pub fn with_num_nodes(mut self, num_nodes: usize) -> Self {
        self.num_nodes = num_nodes;
        self
    }

    /// Set the construction seed
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}

/// Multivariate standard normal reference distribution
#[derive(Debug, Clone)]
pub struct StandardGaussian {
    dim: usize,
}

impl StandardGaussian {
    /// Zero-mean unit-diagonal Gaussian over `dim` dimensions
    pub fn new(dim: usize) -> Self {
        Self { dim }
    }

    /// Dimensionality
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Log-density of a latent vector
    pub fn log_prob(&self, z: &ArrayView1<f64>) -> f64 {
        z.iter().map(|&zi| -0.5 * (zi * zi + (2.0 * PI).ln())).sum()
    }

    /// Draw `n_points` vectors, shape (n_points, dim)
    pub fn sample(&self, n_points: usize) -> Array2<f64> {
        let mut rng = rand::thread_rng();
        let normal = Normal::new(0.0, 1.0).unwrap();
        Array2::from_shape_fn((n_points, self.dim), |_| normal.sample(&mut rng))
    }
}

/// Loss decomposed into its base log-probability and log-determinant terms
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LossTerms {
    /// Negative mean log-likelihood
    pub loss: f64,
    /// Negative mean latent log-probability
    pub logprob: f64,
    /// Negative mean log-determinant
    pub logdet: f64,
}

/// Interface shared by the flow models, narrow enough for a generic
/// training harness: a loss over a batch and a flat parameter vector.
pub trait DensityEstimator {
    /// Width of the vectors the model consumes
    fn input_width(&self) -> usize;

    /// Negative log-likelihood terms over a batch
    fn log_loss(&self, x: &Array2<f64>) -> Result<LossTerms>;

    /// All trainable parameters as a flat vector
    fn parameters(&self) -> Vec<f64>;

    /// Load parameters from a flat vector
    fn set_parameters(&mut self, params: &[f64]) -> Result<()>;
}

/// Masked autoregressive normalizing flow
///
/// `encode` maps data space to latent space (the direction used during
/// training), `decode` maps latent space to data space (used for sampling).
#[derive(Debug, Clone)]
pub struct FlowModel {
    in_shape: usize,
    layers: Vec<CouplingStack>,
    permutations: Vec<Permutation>,
    latent: StandardGaussian,
}

impl FlowModel {
    /// Create a flow with internally generated permutations
    pub fn new(cfg: &FlowConfig) -> Result<Self> {
        let mut rng = StdRng::seed_from_u64(cfg.seed);
        let permutations = (0..cfg.n_coupling.saturating_sub(1))
            .map(|_| Permutation::random(cfg.in_shape, &mut rng))
            .collect();
        Self::build(cfg, permutations, &mut rng)
    }

    /// Create a flow with user-supplied permutations
    ///
    /// The table must hold `n_coupling - 1` permutations of [0, in_shape).
    pub fn with_permutations(cfg: &FlowConfig, permutations: &[Vec<usize>]) -> Result<Self> {
        let mut rng = StdRng::seed_from_u64(cfg.seed);
        let perms = validate_permutations(cfg, permutations)?;
        Self::build(cfg, perms, &mut rng)
    }

    fn build(
        cfg: &FlowConfig,
        permutations: Vec<Permutation>,
        rng: &mut StdRng,
    ) -> Result<Self> {
        let mut layers = Vec::with_capacity(cfg.n_coupling);
        for _ in 0..cfg.n_coupling {
            layers.push(CouplingStack::new(
                cfg.in_shape,
                0,
                2,
                &[Activation::Tanh, Activation::Linear],
                cfg.num_hidden_layers,
                cfg.num_nodes,
                rng,
            )?);
        }
        Ok(Self {
            in_shape: cfg.in_shape,
            layers,
            permutations,
            latent: StandardGaussian::new(cfg.in_shape),
        })
    }

    /// Transform a data-space vector into the latent space
    ///
    /// Returns (z, log_det) where log_det is the log-determinant of the
    /// Jacobian, the per-layer sum of the log-scale outputs.
    pub fn encode(&self, x: &ArrayView1<f64>) -> Result<(Array1<f64>, f64)> {
        let mut z = x.to_owned();
        let mut log_det = 0.0;
        for (i, layer) in self.layers.iter().enumerate() {
            let (s, t) = layer.scale_shift(&z.view())?;
            z = &z * &s.mapv(f64::exp) + &t;
            log_det += s.sum();
            if i + 1 < self.layers.len() {
                z = self.permutations[i].forward(&z.view());
            }
        }
        Ok((z, log_det))
    }

    /// Transform a batch of data-space vectors into the latent space
    pub fn encode_batch(&self, x: &Array2<f64>) -> Result<(Array2<f64>, Array1<f64>)> {
        let n = x.nrows();
        let mut z = Array2::zeros((n, self.in_shape));
        let mut log_dets = Array1::zeros(n);
        for i in 0..n {
            let (zi, ld) = self.encode(&x.row(i))?;
            z.row_mut(i).assign(&zi);
            log_dets[i] = ld;
        }
        Ok((z, log_dets))
    }

    /// Transform a latent vector back into the data space
    ///
    /// Each coupling layer is inverted one feature at a time: output k of a
    /// MADE stack depends on the already-inverted features before k, so the
    /// stack is re-evaluated for every feature.
    pub fn decode(&self, z: &ArrayView1<f64>) -> Result<Array1<f64>> {
        let mut x = z.to_owned();
        for i in (0..self.layers.len()).rev() {
            for k in 0..self.in_shape {
                let (s, t) = self.layers[i].scale_shift(&x.view())?;
                x[k] = (-s[k]).exp() * (x[k] - t[k]);
            }
            if i > 0 {
                x = self.permutations[i - 1].inverse(&x.view());
            }
        }
        Ok(x)
    }

    /// Transform a batch of latent vectors back into the data space
    pub fn decode_batch(&self, z: &Array2<f64>) -> Result<Array2<f64>> {
        let n = z.nrows();
        let mut x = Array2::zeros((n, self.in_shape));
        for i in 0..n {
            x.row_mut(i).assign(&self.decode(&z.row(i))?);
        }
        Ok(x)
    }

    /// Sample `n_points` from the learned distribution
    pub fn sample(&self, n_points: usize) -> Result<Array2<f64>> {
        let z = self.latent.sample(n_points);
        self.decode_batch(&z)
    }

    /// Log-density of one data-space vector
    pub fn log_prob(&self, x: &ArrayView1<f64>) -> Result<f64> {
        let (z, log_det) = self.encode(x)?;
        Ok(self.latent.log_prob(&z.view()) + log_det)
    }

    /// Density of one data-space vector
    pub fn density(&self, x: &ArrayView1<f64>) -> Result<f64> {
        Ok(self.log_prob(x)?.exp())
    }

    /// Estimated probability density for every row of a batch
    pub fn infer(&self, x: &Array2<f64>) -> Result<Array1<f64>> {
        let (z, log_dets) = self.encode_batch(x)?;
        Ok(Array1::from_shape_fn(x.nrows(), |i| {
            (self.latent.log_prob(&z.row(i)) + log_dets[i]).exp()
        }))
    }

    /// Number of inputs
    pub fn in_shape(&self) -> usize {
        self.in_shape
    }

    /// Number of coupling layers
    pub fn n_coupling(&self) -> usize {
        self.layers.len()
    }

    /// The permutation schedule between coupling layers
    pub fn permutations(&self) -> &[Permutation] {
        &self.permutations
    }
}

impl DensityEstimator for FlowModel {
    fn input_width(&self) -> usize {
        self.in_shape
    }

    fn log_loss(&self, x: &Array2<f64>) -> Result<LossTerms> {
        let (z, log_dets) = self.encode_batch(x)?;
        let n = x.nrows() as f64;
        let logprob_sum: f64 = (0..x.nrows())
            .map(|i| self.latent.log_prob(&z.row(i)))
            .sum();
        let logprob = -logprob_sum / n;
        let logdet = -log_dets.sum() / n;
        Ok(LossTerms {
            loss: logprob + logdet,
            logprob,
            logdet,
        })
    }

    fn parameters(&self) -> Vec<f64> {
        let mut params = Vec::new();
        for layer in &self.layers {
            params.extend(layer.parameters());
        }
        params
    }

    fn set_parameters(&mut self, params: &[f64]) -> Result<()> {
        let expected: usize = self.layers.iter().map(CouplingStack::num_parameters).sum();
        if params.len() != expected {
            return Err(Error::ParameterCount {
                expected,
                got: params.len(),
            });
        }
        let mut idx = 0;
        for layer in &mut self.layers {
            let n = layer.num_parameters();
            layer.set_parameters(&params[idx..idx + n])?;
            idx += n;
        }
        Ok(())
    }
}

/// Check a user-supplied permutation table against (n_coupling - 1, in_shape)
pub(crate) fn validate_permutations(
    cfg: &FlowConfig,
    permutations: &[Vec<usize>],
) -> Result<Vec<Permutation>> {
    let rows = cfg.n_coupling.saturating_sub(1);
    if permutations.len() != rows {
        return Err(Error::PermutationShape {
            rows,
            cols: cfg.in_shape,
            got_rows: permutations.len(),
            got_cols: permutations.first().map_or(cfg.in_shape, Vec::len),
        });
    }
    let mut perms = Vec::with_capacity(rows);
    for table in permutations {
        if table.len() != cfg.in_shape {
            return Err(Error::PermutationShape {
                rows,
                cols: cfg.in_shape,
                got_rows: permutations.len(),
                got_cols: table.len(),
            });
        }
        perms.push(Permutation::from_indices(table)?);
    }
    Ok(perms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn small_config() -> FlowConfig {
        FlowConfig::new(3)
            .with_n_coupling(2)
            .with_num_nodes(8)
            .with_seed(3)
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let cfg = FlowConfig::new(4)
            .with_n_coupling(3)
            .with_num_nodes(16)
            .with_seed(5);
        let model = FlowModel::new(&cfg).unwrap();

        let x = array![0.3, -1.2, 0.7, 2.1];
        let (z, _) = model.encode(&x.view()).unwrap();
        let back = model.decode(&z.view()).unwrap();

        for i in 0..4 {
            assert_abs_diff_eq!(x[i], back[i], epsilon = 1e-8);
        }
    }

    #[test]
    fn test_log_det_matches_scale_sums() {
        let model = FlowModel::new(&small_config()).unwrap();
        let x = array![0.5, -0.5, 1.5];

        let (_, log_det) = model.encode(&x.view()).unwrap();

        // replay the pass and sum the raw scale outputs directly
        let mut z = x.clone();
        let mut expected = 0.0;
        for (i, layer) in model.layers.iter().enumerate() {
            let (s, t) = layer.scale_shift(&z.view()).unwrap();
            z = &z * &s.mapv(f64::exp) + &t;
            expected += s.sum();
            if i + 1 < model.layers.len() {
                z = model.permutations[i].forward(&z.view());
            }
        }

        assert_eq!(log_det, expected);
    }

    #[test]
    fn test_pure_permutation_flow() {
        let mut model =
            FlowModel::with_permutations(&small_config(), &[vec![2, 0, 1]]).unwrap();

        // zero every weight and bias so each layer is the identity map
        let zeros = vec![0.0; model.parameters().len()];
        model.set_parameters(&zeros).unwrap();

        let x = array![0.5, -1.0, 2.0];
        let (z, log_det) = model.encode(&x.view()).unwrap();
        assert_eq!(z, array![2.0, 0.5, -1.0]);
        assert_eq!(log_det, 0.0);

        let back = model.decode(&z.view()).unwrap();
        assert_eq!(back, x);
    }

    #[test]
    fn test_permutation_shape_is_fatal() {
        let cfg = small_config();
        assert!(matches!(
            FlowModel::with_permutations(&cfg, &[]),
            Err(Error::PermutationShape { .. })
        ));
        assert!(matches!(
            FlowModel::with_permutations(&cfg, &[vec![0, 1]]),
            Err(Error::PermutationShape { .. })
        ));
        assert!(FlowModel::with_permutations(&cfg, &[vec![1, 1, 0]]).is_err());
    }

    #[test]
    fn test_sample_shape() {
        let model = FlowModel::new(&small_config()).unwrap();
        let samples = model.sample(10).unwrap();
        assert_eq!(samples.dim(), (10, 3));
        assert!(samples.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_infer_non_negative() {
        let model = FlowModel::new(&small_config()).unwrap();
        let x = array![
            [0.0, 0.0, 0.0],
            [1.0, -2.0, 3.0],
            [-5.0, 5.0, 0.5],
            [10.0, -10.0, 10.0]
        ];

        let densities = model.infer(&x).unwrap();
        assert_eq!(densities.len(), 4);
        assert!(densities.iter().all(|&d| d >= 0.0 && d.is_finite()));
    }

    #[test]
    fn test_log_loss_terms() {
        let model = FlowModel::new(&small_config()).unwrap();
        let x = array![[0.1, 0.2, 0.3], [-0.4, 0.5, -0.6]];

        let terms = model.log_loss(&x).unwrap();
        assert_abs_diff_eq!(
            terms.loss,
            terms.logprob + terms.logdet,
            epsilon = 1e-12
        );
        assert!(terms.loss.is_finite());
    }

    #[test]
    fn test_latent_log_prob() {
        let latent = StandardGaussian::new(2);
        let z = array![0.0, 0.0];
        // log N(0; 0, I) in two dimensions
        assert_abs_diff_eq!(
            latent.log_prob(&z.view()),
            -(2.0 * PI).ln(),
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_input_width_checked_at_call_time() {
        let model = FlowModel::new(&small_config()).unwrap();
        let x = array![1.0, 2.0];
        assert!(matches!(
            model.encode(&x.view()),
            Err(Error::InputWidth { expected: 3, got: 2 })
        ));
    }
}

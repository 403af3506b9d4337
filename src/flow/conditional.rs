//! # Conditional Masked Autoregressive Flow
//!
//! Extension of the flow model with conditioning parameters. The parameters
//! occupy the first slots of every vector flowing through the model, pass
//! through each coupling layer unchanged, and their marginal distributions
//! are reconstructed from empirical histograms via inverse-transform
//! sampling.

use ndarray::{s, Array1, Array2, ArrayView1};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::coupling::{CouplingStack, Permutation};
use super::made::Activation;
use super::model::{validate_permutations, DensityEstimator, FlowConfig, LossTerms, StandardGaussian};
use crate::error::{Error, Result};

/// Left insertion point of `v` in the sorted slice `a`
fn searchsorted(a: &[f64], v: f64) -> usize {
    a.partition_point(|&e| e < v)
}

/// Empirical distribution of one conditioning parameter
///
/// Derived once from a `(values, bin_edges)` histogram: the cumulative
/// distribution gets a leading 0 and a duplicated final entry so lookups
/// stay defined outside the original range, and is normalized to end at 1.
/// Immutable after construction.
#[derive(Debug, Clone)]
pub struct ParamHistogram {
    cdf: Vec<f64>,
    upper_edges: Vec<f64>,
}

impl ParamHistogram {
    /// Build from histogram values and bin edges
    ///
    /// Requires `values.len() == bin_edges.len() - 1`.
    pub fn from_histogram(values: &[f64], bin_edges: &[f64]) -> Result<Self> {
        if values.len() + 1 != bin_edges.len() {
            return Err(Error::HistogramShape {
                values: values.len(),
                edges: bin_edges.len(),
            });
        }

        let mut cdf = Vec::with_capacity(values.len() + 2);
        cdf.push(0.0);
        let mut acc = 0.0;
        for &v in values {
            acc += v;
            cdf.push(acc);
        }
        cdf.push(acc);
        for c in &mut cdf {
            *c /= acc;
        }

        Ok(Self {
            cdf,
            upper_edges: bin_edges[1..].to_vec(),
        })
    }

    /// Padded cumulative distribution, non-decreasing from 0 to 1
    pub fn cdf(&self) -> &[f64] {
        &self.cdf
    }

    /// Upper edge of each histogram bin
    pub fn upper_edges(&self) -> &[f64] {
        &self.upper_edges
    }

    /// Map a uniform draw in [0, 1) to the upper edge of the bin whose CDF
    /// interval contains it
    pub fn quantile(&self, u: f64) -> f64 {
        let idx = searchsorted(&self.cdf, u).saturating_sub(1);
        self.upper_edges[idx]
    }

    /// Empirical density at `v`: the CDF difference across the containing bin
    ///
    /// Values outside the histogram range hit the padding entries (zero mass
    /// above the last edge, first-bin mass below the first).
    pub fn density(&self, v: f64) -> f64 {
        let idx = searchsorted(&self.upper_edges, v) + 1;
        self.cdf[idx] - self.cdf[idx - 1]
    }
}

/// Conditional masked autoregressive normalizing flow
///
/// The first `n_params` entries of every vector are conditioning parameters:
/// the affine update is forced to the identity on those slots, permutations
/// act on the data block only, and the inverse pass never targets them.
#[derive(Debug, Clone)]
pub struct ConditionalFlowModel {
    in_shape: usize,
    n_params: usize,
    layers: Vec<CouplingStack>,
    /// Data-block permutations, and the same tables lifted past the
    /// parameter slots
    permutations: Vec<Permutation>,
    extended: Vec<Permutation>,
    param_hists: Vec<ParamHistogram>,
    latent: StandardGaussian,
}

impl ConditionalFlowModel {
    /// Create a conditional flow with internally generated permutations
    ///
    /// The number of conditioning parameters is the number of histograms;
    /// an empty histogram list is an error (use `FlowModel` instead).
    pub fn new(cfg: &FlowConfig, param_hists: &[(Vec<f64>, Vec<f64>)]) -> Result<Self> {
        let mut rng = StdRng::seed_from_u64(cfg.seed);
        let permutations = (0..cfg.n_coupling.saturating_sub(1))
            .map(|_| Permutation::random(cfg.in_shape, &mut rng))
            .collect();
        Self::build(cfg, param_hists, permutations, &mut rng)
    }

    /// Create a conditional flow with user-supplied data-block permutations
    pub fn with_permutations(
        cfg: &FlowConfig,
        param_hists: &[(Vec<f64>, Vec<f64>)],
        permutations: &[Vec<usize>],
    ) -> Result<Self> {
        let mut rng = StdRng::seed_from_u64(cfg.seed);
        let perms = validate_permutations(cfg, permutations)?;
        Self::build(cfg, param_hists, perms, &mut rng)
    }

    fn build(
        cfg: &FlowConfig,
        param_hists: &[(Vec<f64>, Vec<f64>)],
        permutations: Vec<Permutation>,
        rng: &mut StdRng,
    ) -> Result<Self> {
        if param_hists.is_empty() {
            return Err(Error::NoParameterHistograms);
        }
        let hists = param_hists
            .iter()
            .map(|(values, edges)| ParamHistogram::from_histogram(values, edges))
            .collect::<Result<Vec<_>>>()?;
        let n_params = hists.len();

        let mut layers = Vec::with_capacity(cfg.n_coupling);
        for _ in 0..cfg.n_coupling {
            layers.push(CouplingStack::new(
                cfg.in_shape,
                n_params,
                2,
                &[Activation::Tanh, Activation::Linear],
                cfg.num_hidden_layers,
                cfg.num_nodes,
                rng,
            )?);
        }

        let extended = permutations
            .iter()
            .map(|p| p.with_offset(n_params))
            .collect();

        Ok(Self {
            in_shape: cfg.in_shape,
            n_params,
            layers,
            permutations,
            extended,
            param_hists: hists,
            latent: StandardGaussian::new(cfg.in_shape),
        })
    }

    /// Expand a data-width vector to full width with zeros in the parameter
    /// slots, so the affine update passes parameters through unchanged
    fn pad(&self, v: &Array1<f64>) -> Array1<f64> {
        let mut full = Array1::zeros(self.n_params + self.in_shape);
        full.slice_mut(s![self.n_params..]).assign(v);
        full
    }

    /// Transform a parameter-plus-data vector into the latent space
    ///
    /// Returns (z, log_det); the parameter slots of z equal those of the
    /// input.
    pub fn encode(&self, x: &ArrayView1<f64>) -> Result<(Array1<f64>, f64)> {
        let mut z = x.to_owned();
        let mut log_det = 0.0;
        for (i, layer) in self.layers.iter().enumerate() {
            let (s, t) = layer.scale_shift(&z.view())?;
            let s_full = self.pad(&s);
            let t_full = self.pad(&t);
            z = &z * &s_full.mapv(f64::exp) + &t_full;
            log_det += s.sum();
            if i + 1 < self.layers.len() {
                z = self.extended[i].forward(&z.view());
            }
        }
        Ok((z, log_det))
    }

    /// Transform a batch into the latent space
    pub fn encode_batch(&self, x: &Array2<f64>) -> Result<(Array2<f64>, Array1<f64>)> {
        let n = x.nrows();
        let width = self.n_params + self.in_shape;
        let mut z = Array2::zeros((n, width));
        let mut log_dets = Array1::zeros(n);
        for i in 0..n {
            let (zi, ld) = self.encode(&x.row(i))?;
            z.row_mut(i).assign(&zi);
            log_dets[i] = ld;
        }
        Ok((z, log_dets))
    }

    /// Transform a latent vector (parameters prepended) back into data space
    ///
    /// Only the data features are inverted, one at a time; parameter slots
    /// are never targeted.
    pub fn decode(&self, z: &ArrayView1<f64>) -> Result<Array1<f64>> {
        let mut x = z.to_owned();
        for i in (0..self.layers.len()).rev() {
            for k in 0..self.in_shape {
                let (s, t) = self.layers[i].scale_shift(&x.view())?;
                let j = self.n_params + k;
                x[j] = (-s[k]).exp() * (x[j] - t[k]);
            }
            if i > 0 {
                x = self.extended[i - 1].inverse(&x.view());
            }
        }
        Ok(x)
    }

    /// Transform a batch of latent vectors back into data space
    pub fn decode_batch(&self, z: &Array2<f64>) -> Result<Array2<f64>> {
        let n = z.nrows();
        let mut x = Array2::zeros((n, self.n_params + self.in_shape));
        for i in 0..n {
            x.row_mut(i).assign(&self.decode(&z.row(i))?);
        }
        Ok(x)
    }

    /// Inverse-transform sampling of conditioning parameters from their
    /// histograms: one uniform draw per point per parameter, mapped through
    /// the empirical CDF
    pub fn its(&self, n_points: usize) -> Array2<f64> {
        let mut rng = rand::thread_rng();
        let mut params = Array2::zeros((n_points, self.n_params));
        for (p, hist) in self.param_hists.iter().enumerate() {
            for i in 0..n_points {
                params[[i, p]] = hist.quantile(rng.gen::<f64>());
            }
        }
        params
    }

    /// Sample `n_points` from the learned conditional distribution
    ///
    /// Conditioning parameters are taken from `params` (shape must be
    /// (n_points, n_params)) or drawn from the histograms when absent.
    /// Returns the full (n_points, n_params + in_shape) matrix, parameters
    /// first.
    pub fn sample(&self, n_points: usize, params: Option<&Array2<f64>>) -> Result<Array2<f64>> {
        let params = match params {
            Some(p) => {
                if p.nrows() != n_points || p.ncols() != self.n_params {
                    return Err(Error::ParamShape {
                        rows: n_points,
                        cols: self.n_params,
                        got_rows: p.nrows(),
                        got_cols: p.ncols(),
                    });
                }
                p.clone()
            }
            None => self.its(n_points),
        };

        let z = self.latent.sample(n_points);
        let width = self.n_params + self.in_shape;
        let mut out = Array2::zeros((n_points, width));
        for i in 0..n_points {
            let mut full = Array1::zeros(width);
            full.slice_mut(s![..self.n_params]).assign(&params.row(i));
            full.slice_mut(s![self.n_params..]).assign(&z.row(i));
            out.row_mut(i).assign(&self.decode(&full.view())?);
        }
        Ok(out)
    }

    /// Joint empirical density of each row's conditioning parameters,
    /// assuming independence across parameters
    pub fn param_density(&self, x: &Array2<f64>) -> Array1<f64> {
        Array1::from_shape_fn(x.nrows(), |i| {
            self.param_hists
                .iter()
                .enumerate()
                .map(|(p, hist)| hist.density(x[[i, p]]))
                .product()
        })
    }

    /// Log-density of one parameter-plus-data vector, over the data block
    pub fn log_prob(&self, x: &ArrayView1<f64>) -> Result<f64> {
        let (z, log_det) = self.encode(x)?;
        Ok(self.latent.log_prob(&z.slice(s![self.n_params..])) + log_det)
    }

    /// Estimated probability density for every row of a batch
    pub fn infer(&self, x: &Array2<f64>) -> Result<Array1<f64>> {
        let (z, log_dets) = self.encode_batch(x)?;
        Ok(Array1::from_shape_fn(x.nrows(), |i| {
            let zi = z.row(i);
            (self.latent.log_prob(&zi.slice(s![self.n_params..])) + log_dets[i]).exp()
        }))
    }

    /// Number of data inputs
    pub fn in_shape(&self) -> usize {
        self.in_shape
    }

    /// Number of conditioning parameters
    pub fn n_params(&self) -> usize {
        self.n_params
    }

    /// Number of coupling layers
    pub fn n_coupling(&self) -> usize {
        self.layers.len()
    }

    /// The per-parameter empirical histograms
    pub fn param_histograms(&self) -> &[ParamHistogram] {
        &self.param_hists
    }

    /// The data-block permutation schedule
    pub fn permutations(&self) -> &[Permutation] {
        &self.permutations
    }
}

impl DensityEstimator for ConditionalFlowModel {
    fn input_width(&self) -> usize {
        self.n_params + self.in_shape
    }

    fn log_loss(&self, x: &Array2<f64>) -> Result<LossTerms> {
        let (z, log_dets) = self.encode_batch(x)?;
        let n = x.nrows() as f64;
        let logprob_sum: f64 = (0..x.nrows())
            .map(|i| {
                let zi = z.row(i);
                self.latent.log_prob(&zi.slice(s![self.n_params..]))
            })
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

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn unit_hist() -> (Vec<f64>, Vec<f64>) {
        (vec![1.0, 1.0], vec![0.0, 1.0, 2.0])
    }

    fn small_model(n_params: usize) -> ConditionalFlowModel {
        let hists: Vec<_> = (0..n_params).map(|_| unit_hist()).collect();
        let cfg = FlowConfig::new(3)
            .with_n_coupling(2)
            .with_num_nodes(8)
            .with_seed(17);
        ConditionalFlowModel::new(&cfg, &hists).unwrap()
    }

    #[test]
    fn test_cdf_construction() {
        let (values, edges) = unit_hist();
        let hist = ParamHistogram::from_histogram(&values, &edges).unwrap();

        assert_eq!(hist.cdf(), &[0.0, 0.5, 1.0, 1.0]);
        assert_eq!(hist.upper_edges(), &[1.0, 2.0]);
    }

    #[test]
    fn test_cdf_monotone_and_normalized() {
        let hist =
            ParamHistogram::from_histogram(&[3.0, 0.0, 1.0, 4.0], &[0.0, 0.5, 1.0, 1.5, 2.0])
                .unwrap();

        let cdf = hist.cdf();
        assert_eq!(cdf[0], 0.0);
        assert_eq!(*cdf.last().unwrap(), 1.0);
        assert!(cdf.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_quantile_selects_bin_edge() {
        let (values, edges) = unit_hist();
        let hist = ParamHistogram::from_histogram(&values, &edges).unwrap();

        // 0.6 falls past the first half of the mass: upper-edge index 1,
        // the second bin's upper edge
        assert_eq!(hist.quantile(0.6), 2.0);
        assert_eq!(hist.quantile(0.4), 1.0);
        assert_eq!(hist.quantile(0.0), 1.0);
    }

    #[test]
    fn test_histogram_density() {
        let (values, edges) = unit_hist();
        let hist = ParamHistogram::from_histogram(&values, &edges).unwrap();

        assert_abs_diff_eq!(hist.density(0.5), 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(hist.density(1.5), 0.5, epsilon = 1e-12);
        // above the histogram range the padded final entry gives zero mass
        assert_abs_diff_eq!(hist.density(2.5), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_histogram_shape_errors() {
        assert!(matches!(
            ParamHistogram::from_histogram(&[1.0, 2.0], &[0.0, 1.0]),
            Err(Error::HistogramShape { values: 2, edges: 2 })
        ));

        let cfg = FlowConfig::new(3).with_num_nodes(8);
        assert!(matches!(
            ConditionalFlowModel::new(&cfg, &[]),
            Err(Error::NoParameterHistograms)
        ));
    }

    #[test]
    fn test_parameters_pass_through_encode() {
        let model = small_model(2);
        let x = array![0.7, 1.3, 0.1, -0.4, 0.9];

        let (z, _) = model.encode(&x.view()).unwrap();
        assert_eq!(z[0], 0.7);
        assert_eq!(z[1], 1.3);
    }

    #[test]
    fn test_conditional_roundtrip() {
        let model = small_model(1);
        let x = array![1.5, 0.2, -0.8, 0.4];

        let (z, _) = model.encode(&x.view()).unwrap();
        let back = model.decode(&z.view()).unwrap();

        for i in 0..4 {
            assert_abs_diff_eq!(x[i], back[i], epsilon = 1e-8);
        }
    }

    #[test]
    fn test_sample_shapes_and_params() {
        let model = small_model(2);

        // internally drawn parameters
        let samples = model.sample(6, None).unwrap();
        assert_eq!(samples.dim(), (6, 5));

        // externally supplied parameters ride along unchanged
        let params = Array2::from_elem((4, 2), 1.0);
        let samples = model.sample(4, Some(&params)).unwrap();
        assert_eq!(samples.dim(), (4, 5));
        for i in 0..4 {
            assert_eq!(samples[[i, 0]], 1.0);
            assert_eq!(samples[[i, 1]], 1.0);
        }

        // wrong parameter shape is fatal
        let bad = Array2::from_elem((4, 3), 1.0);
        assert!(matches!(
            model.sample(4, Some(&bad)),
            Err(Error::ParamShape { .. })
        ));
    }

    #[test]
    fn test_its_draws_bin_edges() {
        let model = small_model(1);
        let params = model.its(50);

        assert_eq!(params.dim(), (50, 1));
        // every draw is one of the histogram's upper edges
        assert!(params.iter().all(|&v| v == 1.0 || v == 2.0));
    }

    #[test]
    fn test_param_density_product() {
        let model = small_model(2);
        let x = array![[0.5, 1.5, 0.0, 0.0, 0.0], [0.5, 2.5, 0.0, 0.0, 0.0]];

        let densities = model.param_density(&x);
        assert_abs_diff_eq!(densities[0], 0.25, epsilon = 1e-12);
        assert_abs_diff_eq!(densities[1], 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_infer_non_negative() {
        let model = small_model(1);
        let x = array![[1.0, 0.3, -0.2, 0.8], [2.0, -1.0, 0.0, 1.0]];

        let densities = model.infer(&x).unwrap();
        assert_eq!(densities.len(), 2);
        assert!(densities.iter().all(|&d| d >= 0.0 && d.is_finite()));
    }

    #[test]
    fn test_log_loss_uses_data_block() {
        let mut model = small_model(1);

        // zero the networks so the transform is the identity; the latent
        // term then depends on the data block alone and two inputs that only
        // differ in their parameter value lose identically
        let zeros = vec![0.0; model.parameters().len()];
        model.set_parameters(&zeros).unwrap();

        let a = array![[1.0, 0.3, -0.2, 0.8]];
        let b = array![[2.0, 0.3, -0.2, 0.8]];

        let la = model.log_loss(&a).unwrap();
        let lb = model.log_loss(&b).unwrap();
        assert_eq!(la.loss, lb.loss);
        assert_eq!(la.logdet, 0.0);
    }
}

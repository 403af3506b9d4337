//! # Coupling stack and permutation schedule
//!
//! A coupling layer of a masked autoregressive flow groups several MADE
//! networks over the identical input, one per transformation parameter
//! (typically a log-scale and a shift). The siblings share one order
//! assignment so that scale and shift at each dimension are conditioned on
//! the same prefix of inputs. Fixed permutations between coupling layers vary
//! the autoregressive order from layer to layer.

use ndarray::{Array1, Array2, ArrayView1};
use rand::rngs::StdRng;
use rand::Rng;

use super::made::{Activation, Made};
use crate::error::{Error, Result};

/// Stack of MADE networks sharing one input and one autoregressive order
#[derive(Debug, Clone)]
pub struct CouplingStack {
    in_shape: usize,
    n_params: usize,
    networks: Vec<Made>,
}

impl CouplingStack {
    /// Build `n_models` MADE networks over a shared order assignment
    ///
    /// An empty `activations` slice defaults every network to relu; otherwise
    /// one activation per network is required.
    pub fn new(
        in_shape: usize,
        n_params: usize,
        n_models: usize,
        activations: &[Activation],
        num_layers: usize,
        num_nodes: usize,
        rng: &mut StdRng,
    ) -> Result<Self> {
        let activations: Vec<Activation> = if activations.is_empty() {
            vec![Activation::Relu; n_models]
        } else if activations.len() != n_models {
            return Err(Error::ActivationCount {
                expected: n_models,
                got: activations.len(),
            });
        } else {
            activations.to_vec()
        };

        // One draw shared by every sibling. With two inputs the degenerate
        // all-ones assignment each network generates is identical anyway.
        let shared = if in_shape > 2 {
            Some(Array2::from_shape_fn((num_layers, num_nodes), |_| {
                rng.gen_range(1..in_shape)
            }))
        } else {
            None
        };

        let mut networks = Vec::with_capacity(n_models);
        for activation in activations {
            networks.push(Made::with_options(
                in_shape,
                num_layers,
                num_nodes,
                activation,
                n_params,
                shared.as_ref(),
                rng,
            )?);
        }

        Ok(Self {
            in_shape,
            n_params,
            networks,
        })
    }

    /// Evaluate every network on the identical input
    pub fn forward(&self, x: &ArrayView1<f64>) -> Result<Vec<Array1<f64>>> {
        self.networks.iter().map(|net| net.forward(x)).collect()
    }

    /// Log-scale and shift pair of a two-network stack
    pub fn scale_shift(&self, x: &ArrayView1<f64>) -> Result<(Array1<f64>, Array1<f64>)> {
        debug_assert_eq!(self.networks.len(), 2);
        let s = self.networks[0].forward(x)?;
        let t = self.networks[1].forward(x)?;
        Ok((s, t))
    }

    /// Number of autoregressive inputs
    pub fn in_shape(&self) -> usize {
        self.in_shape
    }

    /// Number of conditioning inputs
    pub fn n_params(&self) -> usize {
        self.n_params
    }

    /// The sibling networks
    pub fn networks(&self) -> &[Made] {
        &self.networks
    }

    /// Total number of trainable parameters across the siblings
    pub fn num_parameters(&self) -> usize {
        self.networks.iter().map(Made::num_parameters).sum()
    }

    /// All trainable parameters as a flat vector
    pub fn parameters(&self) -> Vec<f64> {
        let mut params = Vec::with_capacity(self.num_parameters());
        for net in &self.networks {
            params.extend(net.parameters());
        }
        params
    }

    /// Load parameters from a flat vector
    pub fn set_parameters(&mut self, params: &[f64]) -> Result<()> {
        if params.len() != self.num_parameters() {
            return Err(Error::ParameterCount {
                expected: self.num_parameters(),
                got: params.len(),
            });
        }
        let mut idx = 0;
        for net in &mut self.networks {
            let n = net.num_parameters();
            net.set_parameters(&params[idx..idx + n])?;
            idx += n;
        }
        Ok(())
    }
}

/// Fixed feature permutation applied between coupling layers
#[derive(Debug, Clone)]
pub struct Permutation {
    /// Forward permutation indices
    perm: Vec<usize>,
    /// Inverse permutation indices
    inv_perm: Vec<usize>,
}

impl Permutation {
    /// Draw a random permutation of [0, dim) by Fisher-Yates shuffle
    pub fn random(dim: usize, rng: &mut StdRng) -> Self {
        let mut perm: Vec<usize> = (0..dim).collect();
        for i in (1..dim).rev() {
            let j = rng.gen_range(0..=i);
            perm.swap(i, j);
        }
        Self::from_table(perm)
    }

    /// Identity permutation
    pub fn identity(dim: usize) -> Self {
        Self::from_table((0..dim).collect())
    }

    /// Build from explicit indices, validating a proper permutation of [0, dim)
    pub fn from_indices(indices: &[usize]) -> Result<Self> {
        let dim = indices.len();
        let mut seen = vec![false; dim];
        for &p in indices {
            if p >= dim || seen[p] {
                return Err(Error::InvalidPermutation(format!(
                    "indices {:?} are not a permutation of 0..{}",
                    indices, dim
                )));
            }
            seen[p] = true;
        }
        Ok(Self::from_table(indices.to_vec()))
    }

    /// Same permutation acting on the trailing block after `offset` fixed
    /// leading slots
    pub fn with_offset(&self, offset: usize) -> Permutation {
        let mut table: Vec<usize> = (0..offset).collect();
        table.extend(self.perm.iter().map(|&p| p + offset));
        Self::from_table(table)
    }

    fn from_table(perm: Vec<usize>) -> Self {
        let mut inv_perm = vec![0; perm.len()];
        for (i, &p) in perm.iter().enumerate() {
            inv_perm[p] = i;
        }
        Self { perm, inv_perm }
    }

    /// Apply the permutation: y[i] = x[perm[i]]
    pub fn forward(&self, x: &ArrayView1<f64>) -> Array1<f64> {
        Array1::from_shape_fn(self.perm.len(), |i| x[self.perm[i]])
    }

    /// Undo the permutation
    pub fn inverse(&self, y: &ArrayView1<f64>) -> Array1<f64> {
        Array1::from_shape_fn(self.inv_perm.len(), |i| y[self.inv_perm[i]])
    }

    /// Forward index table
    pub fn indices(&self) -> &[usize] {
        &self.perm
    }

    /// Number of permuted positions
    pub fn len(&self) -> usize {
        self.perm.len()
    }

    /// Whether the permutation is over zero positions
    pub fn is_empty(&self) -> bool {
        self.perm.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array1};
    use rand::SeedableRng;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(11)
    }

    #[test]
    fn test_siblings_share_orders() {
        let mut rng = rng();
        let stack = CouplingStack::new(
            6,
            0,
            2,
            &[Activation::Tanh, Activation::Linear],
            2,
            16,
            &mut rng,
        )
        .unwrap();

        assert_eq!(stack.networks()[0].orders(), stack.networks()[1].orders());
    }

    #[test]
    fn test_activation_count_mismatch() {
        let mut rng = rng();
        assert!(matches!(
            CouplingStack::new(4, 0, 2, &[Activation::Tanh], 1, 8, &mut rng),
            Err(Error::ActivationCount {
                expected: 2,
                got: 1
            })
        ));
    }

    #[test]
    fn test_empty_activations_default_to_relu() {
        let mut rng = rng();
        let stack = CouplingStack::new(4, 0, 3, &[], 1, 8, &mut rng).unwrap();

        assert_eq!(stack.networks().len(), 3);
        let x = array![0.1, -0.2, 0.3, 0.4];
        let outputs = stack.forward(&x.view()).unwrap();
        assert_eq!(outputs.len(), 3);
        for out in &outputs {
            assert_eq!(out.len(), 4);
            assert!(out.iter().all(|&v| v >= 0.0));
        }
    }

    #[test]
    fn test_scale_shift_widths() {
        let mut rng = rng();
        let stack = CouplingStack::new(
            5,
            2,
            2,
            &[Activation::Tanh, Activation::Linear],
            1,
            8,
            &mut rng,
        )
        .unwrap();

        let x = Array1::linspace(-1.0, 1.0, 7);
        let (s, t) = stack.scale_shift(&x.view()).unwrap();
        assert_eq!(s.len(), 5);
        assert_eq!(t.len(), 5);
        assert!(s.iter().all(|&v| (-1.0..=1.0).contains(&v)));
    }

    #[test]
    fn test_permutation_roundtrip() {
        let mut rng = rng();
        let perm = Permutation::random(8, &mut rng);
        let x = Array1::linspace(0.0, 7.0, 8);

        let y = perm.forward(&x.view());
        let back = perm.inverse(&y.view());
        for i in 0..8 {
            assert_abs_diff_eq!(x[i], back[i], epsilon = 1e-12);
        }
    }

    #[test]
    fn test_permutation_from_indices() {
        let perm = Permutation::from_indices(&[2, 0, 1]).unwrap();
        let x = array![10.0, 20.0, 30.0];
        assert_eq!(perm.forward(&x.view()), array![30.0, 10.0, 20.0]);

        assert!(Permutation::from_indices(&[0, 0, 1]).is_err());
        assert!(Permutation::from_indices(&[0, 3, 1]).is_err());
    }

    #[test]
    fn test_permutation_with_offset() {
        let perm = Permutation::from_indices(&[1, 2, 0]).unwrap();
        let lifted = perm.with_offset(2);

        let x = array![100.0, 200.0, 1.0, 2.0, 3.0];
        let y = lifted.forward(&x.view());
        assert_eq!(y, array![100.0, 200.0, 2.0, 3.0, 1.0]);
    }
}

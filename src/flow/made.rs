//! # Masked Autoregressive Network (MADE)
//!
//! Dense feed-forward network whose kernels are elementwise-multiplied by
//! fixed binary masks (Masked Autoencoder for Distribution Estimation,
//! arXiv:1502.03509). The masks encode a total order over the inputs so that
//! output d depends only on inputs strictly before d, which makes the
//! Jacobian of an autoregressive flow built from these networks triangular.

use ndarray::{Array1, Array2, ArrayView1};
use ndarray_rand::rand_distr::Normal;
use ndarray_rand::RandomExt;
use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Output activation of a MADE network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Activation {
    /// Identity
    Linear,
    /// max(x, 0)
    Relu,
    /// Hyperbolic tangent
    Tanh,
    /// Logistic sigmoid
    Sigmoid,
}

impl Activation {
    /// Apply the activation elementwise in place
    pub fn apply(&self, x: &mut Array1<f64>) {
        match self {
            Activation::Linear => {}
            Activation::Relu => x.mapv_inplace(|v| v.max(0.0)),
            Activation::Tanh => x.mapv_inplace(f64::tanh),
            Activation::Sigmoid => x.mapv_inplace(|v| 1.0 / (1.0 + (-v).exp())),
        }
    }
}

/// Xavier-initialized weight matrix
fn xavier(rows: usize, cols: usize, rng: &mut StdRng) -> Array2<f64> {
    let std = (2.0 / (rows + cols) as f64).sqrt();
    let normal = Normal::new(0.0, std).unwrap();
    Array2::random_using((rows, cols), normal, rng)
}

/// Masked autoregressive dense network
///
/// Built eagerly: all kernel, bias and mask arrays are allocated at their
/// exact final size during construction. Only kernels and biases are
/// trainable; masks and order assignments are fixed for the network's
/// lifetime.
#[derive(Debug, Clone)]
pub struct Made {
    in_shape: usize,
    n_params: usize,
    num_layers: usize,
    hidden_width: usize,
    activation: Activation,
    /// Order label per hidden unit per layer, conditioning offset applied
    orders: Array2<usize>,
    /// One fixed binary mask per affine layer, shape (outputs, inputs)
    masks: Vec<Array2<f64>>,
    kernels: Vec<Array2<f64>>,
    biases: Vec<Array1<f64>>,
}

impl Made {
    /// Create a MADE network without conditioning inputs
    ///
    /// `in_shape` is the number of autoregressive inputs (at least 2),
    /// `num_layers` the number of hidden layers (at least 1) and `num_nodes`
    /// the width of each hidden layer.
    pub fn new(
        in_shape: usize,
        num_layers: usize,
        num_nodes: usize,
        activation: Activation,
        rng: &mut StdRng,
    ) -> Result<Self> {
        Self::with_options(in_shape, num_layers, num_nodes, activation, 0, None, rng)
    }

    /// Create a MADE network with conditioning inputs and optional precomputed
    /// order assignments
    ///
    /// `n_params` conditioning inputs are prepended to the input vector and
    /// visible to every unit. `orders`, if given, must have shape
    /// (num_layers, num_nodes); a mismatched shape falls back to internally
    /// generated orders with a warning.
    pub fn with_options(
        in_shape: usize,
        num_layers: usize,
        num_nodes: usize,
        activation: Activation,
        n_params: usize,
        orders: Option<&Array2<usize>>,
        rng: &mut StdRng,
    ) -> Result<Self> {
        if in_shape < 2 {
            return Err(Error::TooFewInputs(in_shape));
        }

        let base = match orders {
            Some(o) if o.dim() == (num_layers, num_nodes) => o.clone(),
            Some(o) => {
                log::warn!(
                    "order assignment shape mismatch: expected ({}, {}), got {:?}; \
                     using internal rng instead",
                    num_layers,
                    num_nodes,
                    o.dim()
                );
                Self::generate_orders(in_shape, num_layers, num_nodes, rng)
            }
            None => Self::generate_orders(in_shape, num_layers, num_nodes, rng),
        };

        // Conditioning inputs get one dedicated zero-order slot per layer and
        // every label shifts by n_params, so parameters sort before all data
        // positions and are visible to every unit.
        let extra = usize::from(n_params > 0);
        let hidden_width = num_nodes + extra;
        let mut shifted = Array2::zeros((num_layers, hidden_width));
        for l in 0..num_layers {
            if extra == 1 {
                shifted[[l, 0]] = n_params;
            }
            for j in 0..num_nodes {
                shifted[[l, j + extra]] = base[[l, j]] + n_params;
            }
        }
        let orders = shifted;

        let total_inputs = in_shape + n_params;
        let mut masks = Vec::with_capacity(num_layers + 1);
        let mut kernels = Vec::with_capacity(num_layers + 1);
        let mut biases = Vec::with_capacity(num_layers + 1);

        // Input to first hidden layer: unit k is connected to input position
        // p iff its label is at least p's 1-indexed position.
        masks.push(Array2::from_shape_fn(
            (hidden_width, total_inputs),
            |(k, p)| {
                if orders[[0, k]] >= p + 1 {
                    1.0
                } else {
                    0.0
                }
            },
        ));
        kernels.push(xavier(hidden_width, total_inputs, rng));
        biases.push(Array1::zeros(hidden_width));

        // Hidden to hidden
        for l in 1..num_layers {
            masks.push(Array2::from_shape_fn(
                (hidden_width, hidden_width),
                |(k, j)| {
                    if orders[[l, k]] >= orders[[l - 1, j]] {
                        1.0
                    } else {
                        0.0
                    }
                },
            ));
            kernels.push(xavier(hidden_width, hidden_width, rng));
            biases.push(Array1::zeros(hidden_width));
        }

        // Last hidden layer to output: the strict comparison excludes the
        // current and all later dimensions from output d.
        masks.push(Array2::from_shape_fn(
            (in_shape, hidden_width),
            |(d, k)| {
                if orders[[num_layers - 1, k]] < d + 1 + n_params {
                    1.0
                } else {
                    0.0
                }
            },
        ));
        kernels.push(xavier(in_shape, hidden_width, rng));
        biases.push(Array1::zeros(in_shape));

        Ok(Self {
            in_shape,
            n_params,
            num_layers,
            hidden_width,
            activation,
            orders,
            masks,
            kernels,
            biases,
        })
    }

    /// Order labels drawn uniformly from [1, in_shape); with two inputs no
    /// hidden unit may see both, so every unit gets the single admissible
    /// label.
    fn generate_orders(
        in_shape: usize,
        num_layers: usize,
        num_nodes: usize,
        rng: &mut StdRng,
    ) -> Array2<usize> {
        if in_shape > 2 {
            Array2::from_shape_fn((num_layers, num_nodes), |_| rng.gen_range(1..in_shape))
        } else {
            Array2::ones((num_layers, num_nodes))
        }
    }

    /// Evaluate the network on one input vector
    ///
    /// Hidden layers use relu; the final layer uses the configured output
    /// activation. The mask is multiplied into the kernel on every call, so
    /// masked kernel entries never contribute to the output and receive zero
    /// gradient.
    pub fn forward(&self, x: &ArrayView1<f64>) -> Result<Array1<f64>> {
        let expected = self.in_shape + self.n_params;
        if x.len() != expected {
            return Err(Error::InputWidth {
                expected,
                got: x.len(),
            });
        }

        let mut h = x.to_owned();
        for l in 0..self.num_layers {
            let masked = &self.masks[l] * &self.kernels[l];
            h = masked.dot(&h) + &self.biases[l];
            h.mapv_inplace(|v| v.max(0.0));
        }
        let masked = &self.masks[self.num_layers] * &self.kernels[self.num_layers];
        let mut out = masked.dot(&h) + &self.biases[self.num_layers];
        self.activation.apply(&mut out);
        Ok(out)
    }

    /// Number of autoregressive inputs (and outputs)
    pub fn in_shape(&self) -> usize {
        self.in_shape
    }

    /// Number of conditioning inputs
    pub fn n_params(&self) -> usize {
        self.n_params
    }

    /// Fixed binary masks, one per affine layer, shape (outputs, inputs)
    pub fn masks(&self) -> &[Array2<f64>] {
        &self.masks
    }

    /// Order labels per hidden unit per layer, conditioning offset applied
    pub fn orders(&self) -> &Array2<usize> {
        &self.orders
    }

    /// Total number of trainable parameters
    pub fn num_parameters(&self) -> usize {
        self.kernels.iter().map(|w| w.len()).sum::<usize>()
            + self.biases.iter().map(|b| b.len()).sum::<usize>()
    }

    /// All trainable parameters as a flat vector
    pub fn parameters(&self) -> Vec<f64> {
        let mut params = Vec::with_capacity(self.num_parameters());
        for (w, b) in self.kernels.iter().zip(self.biases.iter()) {
            params.extend(w.iter().cloned());
            params.extend(b.iter().cloned());
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
        for (w, b) in self.kernels.iter_mut().zip(self.biases.iter_mut()) {
            for val in w.iter_mut() {
                *val = params[idx];
                idx += 1;
            }
            for val in b.iter_mut() {
                *val = params[idx];
                idx += 1;
            }
        }
        Ok(())
    }
}

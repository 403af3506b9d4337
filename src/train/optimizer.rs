//! # Optimization Algorithms
//!
//! Gradient-based update rules over the flat parameter vector exposed by
//! [`crate::flow::DensityEstimator::parameters`]:
//! - SGD (with optional momentum)
//! - Adam (Adaptive Moment Estimation)

use serde::{Deserialize, Serialize};

/// Optimizer over a flat parameter vector
pub trait Optimizer {
    /// Apply one update step in place
    fn step(&mut self, params: &mut [f64], gradients: &[f64]);

    /// Reset internal state for a new training run
    fn reset(&mut self);
}

/// Stochastic gradient descent with optional momentum
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sgd {
    pub learning_rate: f64,
    pub momentum: f64,
    #[serde(skip)]
    velocity: Option<Vec<f64>>,
}

impl Sgd {
    /// Plain SGD with the given learning rate
    pub fn new(learning_rate: f64) -> Self {
        Self {
            learning_rate,
            momentum: 0.0,
            velocity: None,
        }
    }

    /// Enable momentum
    pub fn with_momentum(mut self, momentum: f64) -> Self {
        self.momentum = momentum;
        self
    }
}

impl Optimizer for Sgd {
    fn step(&mut self, params: &mut [f64], gradients: &[f64]) {
        if self.momentum > 0.0 {
            let v = self
                .velocity
                .get_or_insert_with(|| vec![0.0; params.len()]);
            for ((p, &g), v) in params.iter_mut().zip(gradients).zip(v.iter_mut()) {
                *v = *v * self.momentum - self.learning_rate * g;
                *p += *v;
            }
        } else {
            for (p, &g) in params.iter_mut().zip(gradients) {
                *p -= self.learning_rate * g;
            }
        }
    }

    fn reset(&mut self) {
        self.velocity = None;
    }
}

/// Adam optimizer (Adaptive Moment Estimation)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Adam {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    #[serde(skip)]
    t: usize,
    #[serde(skip)]
    m: Option<Vec<f64>>,
    #[serde(skip)]
    v: Option<Vec<f64>>,
}

impl Adam {
    /// Adam with the given learning rate and standard betas
    pub fn new(learning_rate: f64) -> Self {
        Self {
            learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            t: 0,
            m: None,
            v: None,
        }
    }

    /// Override the moment decay rates
    pub fn with_betas(mut self, beta1: f64, beta2: f64) -> Self {
        self.beta1 = beta1;
        self.beta2 = beta2;
        self
    }
}

impl Optimizer for Adam {
    fn step(&mut self, params: &mut [f64], gradients: &[f64]) {
        self.t += 1;
        let m = self.m.get_or_insert_with(|| vec![0.0; params.len()]);
        let v = self.v.get_or_insert_with(|| vec![0.0; params.len()]);

        // bias-corrected moment scaling
        let b1c = 1.0 - self.beta1.powi(self.t as i32);
        let b2c = 1.0 - self.beta2.powi(self.t as i32);

        for i in 0..params.len() {
            m[i] = self.beta1 * m[i] + (1.0 - self.beta1) * gradients[i];
            v[i] = self.beta2 * v[i] + (1.0 - self.beta2) * gradients[i] * gradients[i];
            let m_hat = m[i] / b1c;
            let v_hat = v[i] / b2c;
            params[i] -= self.learning_rate * m_hat / (v_hat.sqrt() + self.epsilon);
        }
    }

    fn reset(&mut self) {
        self.t = 0;
        self.m = None;
        self.v = None;
    }
}

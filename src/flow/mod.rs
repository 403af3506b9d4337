//! Flow module for masked autoregressive normalizing flows

mod conditional;
mod coupling;
mod made;
mod model;

pub use conditional::{ConditionalFlowModel, ParamHistogram};
pub use coupling::{CouplingStack, Permutation};
pub use made::{Activation, Made};
pub use model::{DensityEstimator, FlowConfig, FlowModel, LossTerms, StandardGaussian};

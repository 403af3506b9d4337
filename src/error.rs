//! Error types for the masked autoregressive flow library

use thiserror::Error;

/// Result type alias for this crate
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the library
#[derive(Error, Debug)]
pub enum Error {
    /// Masked networks need at least two autoregressive inputs
    #[error("masked networks support at least two inputs, got {0}")]
    TooFewInputs(usize),

    /// Input vector width does not match the declared network width
    #[error("input width mismatch: network expects {expected} inputs, got {got}")]
    InputWidth { expected: usize, got: usize },

    /// Activation list does not cover every network in a coupling stack
    #[error("either give no activations or one per network: expected {expected}, got {got}")]
    ActivationCount { expected: usize, got: usize },

    /// Supplied indices are not a permutation of [0, dim)
    #[error("invalid permutation: {0}")]
    InvalidPermutation(String),

    /// Supplied permutation table has the wrong shape
    #[error("permutation table must have shape ({rows}, {cols}), got ({got_rows}, {got_cols})")]
    PermutationShape {
        rows: usize,
        cols: usize,
        got_rows: usize,
        got_cols: usize,
    },

    /// Histogram values and bin edges are inconsistent
    #[error(
        "parameter histograms must satisfy values.len() == bin_edges.len() - 1, \
         got {values} values and {edges} edges"
    )]
    HistogramShape { values: usize, edges: usize },

    /// A conditional model was requested without any parameter histograms
    #[error("conditional models need at least one parameter histogram; use FlowModel instead")]
    NoParameterHistograms,

    /// Externally supplied conditioning parameters have the wrong shape
    #[error("conditioning parameters must have shape ({rows}, {cols}), got ({got_rows}, {got_cols})")]
    ParamShape {
        rows: usize,
        cols: usize,
        got_rows: usize,
        got_cols: usize,
    },

    /// A flat parameter vector does not match the model's parameter count
    #[error("parameter vector length mismatch: expected {expected}, got {got}")]
    ParameterCount { expected: usize, got: usize },
}

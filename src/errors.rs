use num_dual::linalg::LinAlgError;
use std::io;
use thiserror::Error;

/// Error type for improperly configured flash calculations and convergence problems.
#[derive(Error, Debug)]
pub enum FlashError {
    // errors related to algorithms
    #[error("`{0}` did not converge within the maximum number of iterations.")]
    NotConverged(String),
    #[error("`{0}` encountered illegal values during the iteration.")]
    IterationFailed(String),

    // errors related to the configuration of the flash
    #[error("Unknown two-phase flash method `{0}`. Expected one of 'newton', 'ssi', 'ssi+newton'.")]
    UnknownMethod(String),
    #[error(
        "Fluid system is initialized for {0} components while the input specifies {1} components."
    )]
    IncompatibleComponents(usize, usize),

    // errors related to parameter handling
    #[error("The following component(s) were not found: {0}")]
    ComponentsNotFound(String),
    #[error("Incompatible parameters: {0}")]
    IncompatibleParameters(String),

    // errors related to file handling
    #[error(transparent)]
    FileIO(#[from] io::Error),

    // json errors
    #[error(transparent)]
    Serde(#[from] serde_json::Error),

    // other errors
    #[error(transparent)]
    LinAlgError(#[from] LinAlgError),
}

impl FlashError {
    /// Returns `true` if the error signals that one of the iterative
    /// solvers failed to find a solution.
    pub fn is_convergence_failure(&self) -> bool {
        matches!(
            self,
            Self::NotConverged(_) | Self::IterationFailed(_) | Self::LinAlgError(_)
        )
    }
}

/// Convenience type for `Result<T, FlashError>`.
pub type FlashResult<T> = Result<T, FlashError>;

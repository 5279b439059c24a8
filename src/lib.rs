#![warn(clippy::all)]
#![allow(clippy::many_single_char_names)]
#![allow(clippy::too_many_arguments)]
#![allow(clippy::needless_range_loop)]
//! Isothermal-isobaric two-phase flash calculations.
//!
//! For a mixture of `N` components at given pressure, temperature and feed
//! composition, the flash determines whether the fluid is single-phase or
//! splits into a liquid and a vapor phase, and in the latter case the liquid
//! fraction L and the compositions of both phases.
//!
//! The calculation combines
//! + the Rachford-Rice equation for L,
//! + Michelsen's stability test,
//! + successive substitution and a Newton solver with exact derivatives
//!   from forward-mode automatic differentiation ([num_dual]).
//!
//! The fugacity model is provided through the [FluidSystem] trait, with
//! [cubic::PengRobinson] as implementation.

#[doc(hidden)]
pub use tracing;

/// Log messages with level `Verbosity::Iter` or higher.
#[macro_export]
macro_rules! log_iter {
    ($verbosity:expr, $($arg:tt)*) => {
        if $verbosity >= $crate::Verbosity::Iter {
            $crate::tracing::debug!($($arg)*);
        }
    }
}

/// Log messages with level `Verbosity::Result` or higher.
#[macro_export]
macro_rules! log_result {
    ($verbosity:expr, $($arg:tt)*) => {
        if $verbosity >= $crate::Verbosity::Result {
            $crate::tracing::info!($($arg)*);
        }
    }
}

pub mod cubic;
mod errors;
mod flash;
mod fluid_system;
mod state;
pub use errors::{FlashError, FlashResult};
pub use flash::{
    check_stability, compute_liquid_vapor, flash_cells, li_single_phase_label, limit_step,
    newton_composition_update, phase_stability_test, rachford_rice, rachford_rice_dg_dl,
    rachford_rice_g, solve_composition, successive_substitution, Components, CompositionResidual,
    FlashOptions, FlashOutcome, NewtonDimension, NewtonStep, PhaseState, ProbeResult,
    SolverOptions, StabilityTest, TwoPhaseMethod, Verbosity,
};
#[cfg(feature = "rayon")]
pub use flash::par_flash_cells;
pub use fluid_system::{FluidSystem, Phase};
pub use num_dual::DualNum;
pub use state::FluidState;

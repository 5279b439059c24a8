use crate::errors::{FlashError, FlashResult};
use crate::fluid_system::{FluidSystem, Phase};
use crate::state::FluidState;
use num_dual::DualNum;
use std::fmt;
use std::str::FromStr;

mod composition;
mod rachford_rice;
mod stability_analysis;
pub use composition::{
    compute_liquid_vapor, limit_step, newton_composition_update, successive_substitution,
    CompositionResidual,
};
pub use rachford_rice::{rachford_rice, rachford_rice_dg_dl, rachford_rice_g};
pub use stability_analysis::{check_stability, phase_stability_test, ProbeResult, StabilityTest};

/// Number of successive substitution steps ahead of the Newton solver.
const SSI_STEPS_BEFORE_NEWTON: usize = 3;

/// Level of detail in the iteration output.
#[derive(Copy, Clone, Debug, PartialOrd, PartialEq, Eq, Default)]
pub enum Verbosity {
    /// Do not print output.
    #[default]
    None,
    /// Print information about the success or failure of the iteration.
    Result,
    /// Print a detailed output for every iteration.
    Iter,
}

impl Verbosity {
    /// Map an integer verbosity level (0, 1, 2 and above) to a [Verbosity].
    pub fn from_level(level: i32) -> Self {
        match level {
            i32::MIN..=0 => Self::None,
            1 => Self::Result,
            _ => Self::Iter,
        }
    }
}

/// Options for the iterative solvers.
///
/// If the values are [None], solver specific default
/// values are used.
#[derive(Copy, Clone, Debug, Default)]
pub struct SolverOptions {
    /// Maximum number of iterations.
    pub max_iter: Option<usize>,
    /// Tolerance.
    pub tol: Option<f64>,
    /// Iteration output indicated by the [Verbosity] enum.
    pub verbosity: Verbosity,
}

impl SolverOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_iter(mut self, max_iter: usize) -> Self {
        self.max_iter = Some(max_iter);
        self
    }

    pub fn tol(mut self, tol: f64) -> Self {
        self.tol = Some(tol);
        self
    }

    pub fn verbosity(mut self, verbosity: Verbosity) -> Self {
        self.verbosity = verbosity;
        self
    }

    pub fn unwrap_or(self, max_iter: usize, tol: f64) -> (usize, f64, Verbosity) {
        (
            self.max_iter.unwrap_or(max_iter),
            self.tol.unwrap_or(tol),
            self.verbosity,
        )
    }
}

/// Solver for the compositions of a two-phase fluid.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum TwoPhaseMethod {
    /// Newton iteration on compositions and L.
    Newton,
    /// Successive substitution of the K-values.
    SuccessiveSubstitution,
    /// A few steps of successive substitution followed by Newton iterations.
    #[default]
    SsiNewton,
}

impl FromStr for TwoPhaseMethod {
    type Err = FlashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "newton" => Ok(Self::Newton),
            "ssi" => Ok(Self::SuccessiveSubstitution),
            "ssi+newton" => Ok(Self::SsiNewton),
            _ => Err(FlashError::UnknownMethod(s.to_owned())),
        }
    }
}

impl fmt::Display for TwoPhaseMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Newton => write!(f, "newton"),
            Self::SuccessiveSubstitution => write!(f, "ssi"),
            Self::SsiNewton => write!(f, "ssi+newton"),
        }
    }
}

/// Update of the unknowns after solving the Newton system.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum NewtonStep {
    /// Apply the step scaled by a constant factor.
    Damped(f64),
    /// Shorten the step so that all unknowns stay within [0, 1].
    Limited,
}

impl Default for NewtonStep {
    fn default() -> Self {
        Self::Damped(1.0)
    }
}

/// Options of a flash calculation.
#[derive(Copy, Clone, Debug, Default)]
pub struct FlashOptions {
    pub method: TwoPhaseMethod,
    /// Tolerance of the validity check of the results. Values ≤ 0
    /// select the default tolerance.
    pub tolerance: f64,
    pub verbosity: Verbosity,
    pub newton_step: NewtonStep,
    /// Maximum number of successive substitution steps if used as
    /// stand-alone solver.
    pub max_iter_ssi: Option<usize>,
}

impl FlashOptions {
    pub fn new(method: TwoPhaseMethod) -> Self {
        Self {
            method,
            ..Default::default()
        }
    }

    pub fn tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn verbosity(mut self, verbosity: Verbosity) -> Self {
        self.verbosity = verbosity;
        self
    }

    pub fn newton_step(mut self, newton_step: NewtonStep) -> Self {
        self.newton_step = newton_step;
        self
    }

    pub fn max_iter_ssi(mut self, max_iter: usize) -> Self {
        self.max_iter_ssi = Some(max_iter);
        self
    }

    /// The tolerance, or min(1e-3, 1e8 ε) if the tolerance is not positive.
    pub fn resolved_tolerance(&self) -> f64 {
        if self.tolerance <= 0.0 {
            f64::min(1e-3, 1e8 * f64::EPSILON)
        } else {
            self.tolerance
        }
    }
}

/// Phase state determined by a flash.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PhaseState {
    TwoPhase,
    Liquid,
    Vapor,
}

impl fmt::Display for PhaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TwoPhase => write!(f, "two-phase"),
            Self::Liquid => write!(f, "liquid"),
            Self::Vapor => write!(f, "vapor"),
        }
    }
}

/// Diagnostics of a successful flash calculation.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct FlashOutcome {
    pub phase_state: PhaseState,
    /// The stability test was performed.
    pub stability_tested: bool,
    /// L from the Rachford-Rice equation with the initial K-values.
    ///
    /// [None] if Rachford-Rice failed for these K-values (e.g. a single
    /// component) and the stability test made its result unnecessary.
    pub baseline_l: Option<f64>,
    /// Iterations of the composition solver.
    pub composition_iterations: usize,
}

/// Marker type for the number of components of a fluid.
pub struct Components<const N: usize>;

/// Newton solver for a fluid with `N` components.
///
/// The Newton iteration works with 2N + 1 unknowns, which have to be known at
/// compile time. The trait is implemented for up to 16 components.
pub trait NewtonDimension<const N: usize> {
    /// Number of unknowns of the Newton iteration.
    const UNKNOWNS: usize;

    fn newton<F: FluidSystem<N>>(
        system: &F,
        state: &mut FluidState<f64, N>,
        feed: &[f64; N],
        step: NewtonStep,
        verbosity: Verbosity,
    ) -> FlashResult<usize>;
}

macro_rules! impl_newton_dimension {
    ($($n:literal => $m:literal),+) => {
        $(
            impl NewtonDimension<$n> for Components<$n> {
                const UNKNOWNS: usize = $m;

                fn newton<F: FluidSystem<$n>>(
                    system: &F,
                    state: &mut FluidState<f64, $n>,
                    feed: &[f64; $n],
                    step: NewtonStep,
                    verbosity: Verbosity,
                ) -> FlashResult<usize> {
                    newton_composition_update::<F, $n, $m>(system, state, feed, step, verbosity)
                }
            }
        )+
    };
}

impl_newton_dimension!(
    1 => 3, 2 => 5, 3 => 7, 4 => 9, 5 => 11, 6 => 13, 7 => 15, 8 => 17,
    9 => 19, 10 => 21, 11 => 23, 12 => 25, 13 => 27, 14 => 29, 15 => 31, 16 => 33
);

/// Run the composition solver selected in the options on a two-phase state.
///
/// Returns the total number of iterations.
pub fn solve_composition<F: FluidSystem<N>, const N: usize>(
    system: &F,
    state: &mut FluidState<f64, N>,
    feed: &[f64; N],
    options: &FlashOptions,
) -> FlashResult<usize>
where
    Components<N>: NewtonDimension<N>,
{
    let verbosity = options.verbosity;
    log_result!(
        verbosity,
        "Two-phase flash ({}) with K = {:?}",
        options.method,
        state.k_values()
    );
    let ssi_options = |max_iter| SolverOptions::new().max_iter(max_iter).verbosity(verbosity);
    match options.method {
        TwoPhaseMethod::Newton => {
            Components::<N>::newton(system, state, feed, options.newton_step, verbosity)
        }
        TwoPhaseMethod::SuccessiveSubstitution => {
            let max_iter = options.max_iter_ssi.unwrap_or(10);
            let (_, iter) = successive_substitution(system, state, feed, ssi_options(max_iter))?;
            Ok(iter)
        }
        TwoPhaseMethod::SsiNewton => {
            let (_, ssi_iter) = successive_substitution(
                system,
                state,
                feed,
                ssi_options(SSI_STEPS_BEFORE_NEWTON),
            )?;
            let newton_iter =
                Components::<N>::newton(system, state, feed, options.newton_step, verbosity)?;
            Ok(ssi_iter + newton_iter)
        }
    }
}

/// Classify a stable fluid as liquid (L = 1) or vapor (L = 0) with Li's
/// method.
///
/// The pseudo-critical temperature of the mixture is the average of the
/// critical temperatures weighted with critical volume and mole fraction.
pub fn li_single_phase_label<F: FluidSystem<N>, const N: usize>(
    system: &F,
    temperature: f64,
    feed: &[f64; N],
    verbosity: Verbosity,
) -> f64 {
    let mut sum_vz = 0.0;
    let mut sum_vzt = 0.0;
    for (i, &z) in feed.iter().enumerate() {
        let vz = system.critical_volume(i) * z;
        sum_vz += vz;
        sum_vzt += vz * system.critical_temperature(i);
    }
    let tc_est = sum_vzt / sum_vz;

    let l = if temperature < tc_est { 1.0 } else { 0.0 };
    log_result!(
        verbosity,
        "Li's phase labeling: T = {} K, Tc = {} K -> {}",
        temperature,
        tc_est,
        if l == 1.0 { "liquid" } else { "vapor" }
    );
    l
}

fn check_results<const N: usize>(state: &FluidState<f64, N>, tol: f64) -> FlashResult<()> {
    let l = state.l();
    let compositions = state
        .mole_fractions(Phase::Liquid)
        .iter()
        .chain(state.mole_fractions(Phase::Vapor));
    let valid = l.is_finite()
        && (-tol..=1.0 + tol).contains(&l)
        && compositions.into_iter().all(|&x| x.is_finite() && x >= -tol);
    if valid {
        Ok(())
    } else {
        Err(FlashError::IterationFailed(format!(
            "Two-phase flash (unphysical result: {state})"
        )))
    }
}

/// # Flash calculations
impl<D: DualNum<f64> + Copy, const N: usize> FluidState<D, N> {
    /// Perform an isothermal-isobaric flash of the given feed.
    ///
    /// The K-values and L stored in the state are used as initial values. A
    /// stability test is performed if the stored L marks a fluid without a
    /// two-phase solution (L ≤ 0 or L = 1, including the initial value -1).
    /// Stable fluids are labeled liquid or vapor, otherwise the compositions
    /// are determined with the two-phase method specified in the options,
    /// starting from the Rachford-Rice solution for the K-values.
    ///
    /// K-values, L, phase compositions and fugacity coefficients are written
    /// back to the state only if the flash succeeds.
    pub fn flash<F: FluidSystem<N>>(
        &mut self,
        system: &F,
        feed: &[D; N],
        options: FlashOptions,
    ) -> FlashResult<FlashOutcome>
    where
        Components<N>: NewtonDimension<N>,
    {
        let verbosity = options.verbosity;
        let feed = feed.map(|z| z.re());
        let mut state = self.to_scalar();
        log_result!(verbosity, "Flash with z = {:?}: {}", feed, state);

        let l_in = state.l();
        let stability_tested = l_in <= 0.0 || l_in == 1.0;
        let baseline = rachford_rice(state.k_values(), &feed, verbosity);

        let mut stable = false;
        let baseline_l = if stability_tested {
            log_result!(verbosity, "Flash: stability test (L = {})", l_in);
            let test = phase_stability_test(system, &state, &feed, verbosity)?;
            if test.is_stable {
                stable = true;
                state.set_mole_fractions(Phase::Liquid, &feed);
                state.set_mole_fractions(Phase::Vapor, &feed);
            } else {
                let k = test.k_values();
                for (i, &k) in k.iter().enumerate() {
                    state.set_k(i, k);
                }
                state.set_l(rachford_rice(&k, &feed, verbosity)?);
            }
            baseline.ok()
        } else {
            let l = baseline?;
            state.set_l(l);
            Some(l)
        };

        let (phase_state, composition_iterations) = if stable {
            let l = li_single_phase_label(system, state.temperature(), &feed, verbosity);
            state.set_l(l);
            let phase_state = if l == 1.0 {
                PhaseState::Liquid
            } else {
                PhaseState::Vapor
            };
            (phase_state, 0)
        } else {
            let iterations = solve_composition(system, &mut state, &feed, &options)?;
            check_results(&state, options.resolved_tolerance())?;
            (PhaseState::TwoPhase, iterations)
        };

        self.commit(&state);
        log_result!(verbosity, "Flash: {} fluid\n{}", phase_state, state);
        Ok(FlashOutcome {
            phase_state,
            stability_tested,
            baseline_l,
            composition_iterations,
        })
    }

    /// Perform a flash with the two-phase method given by its name
    /// ("newton", "ssi" or "ssi+newton") and an integer verbosity level.
    pub fn flash_with_method<F: FluidSystem<N>>(
        &mut self,
        system: &F,
        feed: &[D; N],
        method: &str,
        tolerance: f64,
        verbosity: i32,
    ) -> FlashResult<FlashOutcome>
    where
        Components<N>: NewtonDimension<N>,
    {
        let options = FlashOptions::new(method.parse()?)
            .tolerance(tolerance)
            .verbosity(Verbosity::from_level(verbosity));
        self.flash(system, feed, options)
    }

    fn commit(&mut self, state: &FluidState<f64, N>) {
        for i in 0..N {
            self.set_k(i, D::from(state.k(i)));
            for phase in [Phase::Liquid, Phase::Vapor] {
                self.set_mole_fraction(phase, i, D::from(state.mole_fraction(phase, i)));
                self.set_fugacity_coefficient(
                    phase,
                    i,
                    D::from(state.fugacity_coefficient(phase, i)),
                );
            }
        }
        self.set_l(D::from(state.l()));
    }
}

/// Flash a set of independent fluids (e.g. the cells of a grid).
///
/// Every fluid is flashed with its own state; failures are reported per fluid.
pub fn flash_cells<F: FluidSystem<N>, D: DualNum<f64> + Copy, const N: usize>(
    system: &F,
    cells: &mut [(FluidState<D, N>, [D; N])],
    options: FlashOptions,
) -> Vec<FlashResult<FlashOutcome>>
where
    Components<N>: NewtonDimension<N>,
{
    cells
        .iter_mut()
        .map(|(state, feed)| state.flash(system, feed, options))
        .collect()
}

/// Flash a set of independent fluids in parallel.
#[cfg(feature = "rayon")]
pub fn par_flash_cells<F, D, const N: usize>(
    system: &F,
    cells: &mut [(FluidState<D, N>, [D; N])],
    options: FlashOptions,
) -> Vec<FlashResult<FlashOutcome>>
where
    F: FluidSystem<N> + Sync,
    D: DualNum<f64> + Copy + Send,
    Components<N>: NewtonDimension<N>,
{
    use rayon::prelude::*;
    cells
        .par_iter_mut()
        .map(|(state, feed)| state.flash(system, feed, options))
        .collect()
}

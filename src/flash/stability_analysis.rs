use crate::errors::{FlashError, FlashResult};
use crate::fluid_system::{FluidSystem, Phase};
use crate::state::FluidState;
use crate::Verbosity;

const MAX_ITER_STABILITY: usize = 20000;
const TOL_RESIDUAL: f64 = 1e-10;
const TOL_TRIVIAL_K: f64 = 1e-5;
const TOL_TRIVIAL_COMPOSITION: f64 = 1e-12;
const MAX_SUM: f64 = 1.0 + 1e-5;

/// Result of a single Michelsen test for an incipient phase.
#[derive(Clone, Copy, Debug)]
pub struct ProbeResult<const N: usize> {
    /// Normalized composition of the trial phase.
    pub composition: [f64; N],
    /// Sum of the unnormalized trial mole fractions.
    pub sum: f64,
    /// The trial phase collapsed onto the feed.
    pub trivial: bool,
    pub iterations: usize,
}

impl<const N: usize> ProbeResult<N> {
    /// The trial phase does not grow, i.e. no phase with lower Gibbs
    /// energy was found.
    pub fn trial_phase_unstable(&self) -> bool {
        self.sum < MAX_SUM || self.trivial
    }
}

/// Outcome of the stability test of a feed composition.
#[derive(Clone, Copy, Debug)]
pub struct StabilityTest<const N: usize> {
    pub is_stable: bool,
    /// Michelsen test for an incipient vapor phase.
    pub vapor: ProbeResult<N>,
    /// Michelsen test for an incipient liquid phase.
    pub liquid: ProbeResult<N>,
    /// Wilson K-values both tests were started from.
    pub seed: [f64; N],
}

impl<const N: usize> StabilityTest<N> {
    /// K-values from the trial compositions of both tests.
    ///
    /// Components that are absent from both trial phases keep their
    /// initial K-value.
    pub fn k_values(&self) -> [f64; N] {
        std::array::from_fn(|i| {
            let (y, x) = (self.vapor.composition[i], self.liquid.composition[i]);
            if x > 0.0 && y > 0.0 {
                y / x
            } else {
                self.seed[i]
            }
        })
    }
}

/// # Stability analysis
///
/// Decide whether the feed is stable as a single phase. Two Michelsen tests
/// are run, seeded with K-values from Wilson's correlation: one for an
/// incipient vapor phase and one for an incipient liquid phase.
///
/// The feed is stable if the liquid test is stable and the vapor trial
/// phase is unstable, i.e. it collapses or shrinks.
pub fn phase_stability_test<F: FluidSystem<N>, const N: usize>(
    system: &F,
    state: &FluidState<f64, N>,
    feed: &[f64; N],
    verbosity: Verbosity,
) -> FlashResult<StabilityTest<N>> {
    let p = state.pressure(Phase::Liquid);
    let t = state.temperature();
    let seed = std::array::from_fn(|i| system.wilson_k(i, p, t));

    log_iter!(verbosity, "Stability test for the vapor phase:");
    let vapor = check_stability(system, state, feed, seed, Phase::Vapor, verbosity)?;
    let vapor_unstable = vapor.trial_phase_unstable();

    log_iter!(verbosity, "Stability test for the liquid phase:");
    let liquid = check_stability(system, state, feed, seed, Phase::Liquid, verbosity)?;
    let liquid_stable = liquid.sum < MAX_SUM || liquid.trivial;

    let is_stable = liquid_stable && vapor_unstable;
    log_result!(
        verbosity,
        "Stability test: S_v = {} (trivial: {}), S_l = {} (trivial: {}) -> {}",
        vapor.sum,
        vapor.trivial,
        liquid.sum,
        liquid.trivial,
        if is_stable { "stable" } else { "unstable" }
    );

    Ok(StabilityTest {
        is_stable,
        vapor,
        liquid,
        seed,
    })
}

/// Michelsen's successive substitution test for an incipient phase.
///
/// The trial phase (`trial_phase`) is formed from the K-values and the
/// feed, the feed itself is evaluated as the respective other phase.
/// The iteration stops as soon as the trial phase is trivial or the
/// fugacity ratios are converged.
pub fn check_stability<F: FluidSystem<N>, const N: usize>(
    system: &F,
    state: &FluidState<f64, N>,
    feed: &[f64; N],
    mut k: [f64; N],
    trial_phase: Phase,
    verbosity: Verbosity,
) -> FlashResult<ProbeResult<N>> {
    let reference_phase = trial_phase.other();
    let mut cache = system.parameter_cache();

    let mut reference = *state;
    reference.set_mole_fractions(reference_phase, feed);
    system.update_fugacity_coefficients(&mut cache, &mut reference, reference_phase);
    let mut trial = *state;

    log_iter!(verbosity, "  iter |     K-norm     |     R-norm");
    log_iter!(verbosity, "{:-<40}", "");

    for iter in 1..=MAX_ITER_STABILITY {
        let w: [f64; N] = std::array::from_fn(|i| match trial_phase {
            Phase::Vapor => k[i] * feed[i],
            Phase::Liquid => feed[i] / k[i],
        });
        let sum: f64 = w.iter().sum();
        let w = w.map(|w| w / sum);
        trial.set_mole_fractions(trial_phase, &w);
        system.update_fugacity_coefficients(&mut cache, &mut trial, trial_phase);

        let mut r_norm = 0.0;
        let mut k_norm = 0.0;
        for i in 0..N {
            if feed[i] == 0.0 {
                continue;
            }
            let f_trial = trial.fugacity(trial_phase, i);
            let f_reference = reference.fugacity(reference_phase, i);
            let r = match trial_phase {
                Phase::Vapor => f_reference / f_trial / sum,
                Phase::Liquid => f_trial / f_reference * sum,
            };
            k[i] *= r;
            r_norm += (r - 1.0).powi(2);
            k_norm += k[i].ln().powi(2);
        }
        log_iter!(verbosity, " {:5} | {:14.8e} | {:14.8e}", iter, k_norm, r_norm);

        let distance: f64 = w.iter().zip(feed).map(|(w, z)| (w - z).powi(2)).sum();
        let trivial = k_norm < TOL_TRIVIAL_K || distance < TOL_TRIVIAL_COMPOSITION;
        if trivial || r_norm < TOL_RESIDUAL {
            log_result!(
                verbosity,
                "Stability test ({} phase): {} in {} step(s)",
                trial_phase,
                if trivial {
                    "found trivial solution"
                } else {
                    "converged"
                },
                iter
            );
            return Ok(ProbeResult {
                composition: w,
                sum,
                trivial,
                iterations: iter,
            });
        }
        if !r_norm.is_finite() {
            return Err(FlashError::IterationFailed(format!(
                "Stability test ({trial_phase} phase)"
            )));
        }
    }
    Err(FlashError::NotConverged(format!(
        "Stability test ({trial_phase} phase)"
    )))
}

use super::{rachford_rice, NewtonStep};
use crate::errors::{FlashError, FlashResult};
use crate::fluid_system::{FluidSystem, Phase};
use crate::state::FluidState;
use crate::{SolverOptions, Verbosity};
use nalgebra::SVector;
use ndarray::{Array1, Array2};
use num_dual::linalg::LU;
use num_dual::{jacobian, DualNum, DualSVec64};

const MAX_ITER_SSI: usize = 10;
const TOL_SSI: f64 = 1e-6;
const MAX_ITER_NEWTON: usize = 1000;
const TOL_NEWTON: f64 = 1e-8;

/// Normalized liquid and vapor compositions from K-values, liquid
/// fraction and feed composition.
///
/// Components absent from the feed are absent from both phases.
pub fn compute_liquid_vapor<const N: usize>(
    k: &[f64; N],
    l: f64,
    feed: &[f64; N],
) -> ([f64; N], [f64; N]) {
    let x: [f64; N] = std::array::from_fn(|i| {
        if feed[i] == 0.0 {
            0.0
        } else {
            feed[i] / (l + (1.0 - l) * k[i])
        }
    });
    let y: [f64; N] = std::array::from_fn(|i| k[i] * x[i]);
    let sum_x: f64 = x.iter().sum();
    let sum_y: f64 = y.iter().sum();
    (x.map(|x| x / sum_x), y.map(|y| y / sum_y))
}

/// Evaluate the fugacity coefficients of both phases of the fluid state.
fn update_phases<F: FluidSystem<N>, D: DualNum<f64> + Copy, const N: usize>(
    system: &F,
    cache: &mut F::ParameterCache<D>,
    state: &mut FluidState<D, N>,
) {
    system.update_fugacity_coefficients(cache, state, Phase::Liquid);
    system.update_fugacity_coefficients(cache, state, Phase::Vapor);
}

/// z_i - L x_i - (1 - L) y_i
fn mass_balance<D: DualNum<f64> + Copy, const N: usize>(
    state: &FluidState<D, N>,
    feed: &[f64; N],
    i: usize,
) -> D {
    let l = state.l();
    -(state.mole_fraction(Phase::Liquid, i) * l)
        + state.mole_fraction(Phase::Vapor, i) * (l - 1.0)
        + feed[i]
}

/// f_L,i / f_V,i - 1, or x_i - y_i for a component that is absent from the feed.
///
/// Both compositions of an absent component vanish at the solution, where
/// the fugacity ratio is 0/0.
fn phase_equilibrium<D: DualNum<f64> + Copy, const N: usize>(
    state: &FluidState<D, N>,
    feed: &[f64; N],
    i: usize,
) -> D {
    if feed[i] > 0.0 {
        state.fugacity(Phase::Liquid, i) / state.fugacity(Phase::Vapor, i) - 1.0
    } else {
        state.mole_fraction(Phase::Liquid, i) - state.mole_fraction(Phase::Vapor, i)
    }
}

/// Σ x_i - Σ y_i
fn closure<D: DualNum<f64> + Copy, const N: usize>(state: &FluidState<D, N>) -> D {
    (0..N).fold(D::zero(), |acc, i| {
        acc + state.mole_fraction(Phase::Liquid, i) - state.mole_fraction(Phase::Vapor, i)
    })
}

/// Successive substitution of the K-values.
///
/// Starting from the K-values and L stored in `state`, the phase compositions
/// are recomputed and the K-values are updated with the ratio of liquid and
/// vapor fugacities until that ratio is one within the tolerance. After every
/// update of the K-values, L is recomputed with Rachford-Rice.
///
/// Returns whether the iteration converged and the number of iterations.
/// Reaching the maximum number of iterations is not an error.
pub fn successive_substitution<F: FluidSystem<N>, const N: usize>(
    system: &F,
    state: &mut FluidState<f64, N>,
    feed: &[f64; N],
    options: SolverOptions,
) -> FlashResult<(bool, usize)> {
    let (max_iter, tol, verbosity) = options.unwrap_or(MAX_ITER_SSI, TOL_SSI);
    let mut cache = system.parameter_cache();

    log_result!(
        verbosity,
        "Successive substitution: initial K = {:?}, L = {}",
        state.k_values(),
        state.l()
    );
    log_iter!(verbosity, " iter | norm2(fL/fV - 1) | fL/fV");
    log_iter!(verbosity, "{:-<60}", "");

    for iter in 1..=max_iter {
        let (x, y) = compute_liquid_vapor(state.k_values(), state.l(), feed);
        state.set_mole_fractions(Phase::Liquid, &x);
        state.set_mole_fractions(Phase::Vapor, &y);
        update_phases(system, &mut cache, state);

        // absent components keep their K-value
        let ratio: [f64; N] = std::array::from_fn(|i| {
            if feed[i] > 0.0 {
                state.fugacity(Phase::Liquid, i) / state.fugacity(Phase::Vapor, i)
            } else {
                1.0
            }
        });
        let norm = ratio.iter().map(|r| (r - 1.0).powi(2)).sum::<f64>().sqrt();
        log_iter!(verbosity, " {:4} | {:16.8e} | {:.5?}", iter, norm, ratio);

        if norm < tol {
            log_result!(
                verbosity,
                "Successive substitution: converged in {} step(s)\n{}",
                iter,
                state
            );
            return Ok((true, iter));
        }

        for (i, r) in ratio.into_iter().enumerate() {
            state.set_k(i, state.k(i) * r);
        }
        let l = rachford_rice(state.k_values(), feed, verbosity)?;
        state.set_l(l);
    }
    log_result!(
        verbosity,
        "Successive substitution: not converged after {} step(s)",
        max_iter
    );
    Ok((false, max_iter))
}

/// Scale the step so that no unknown leaves [0, 1].
///
/// The factor is the smallest fraction of the full step that keeps
/// every unknown inside the interval.
pub fn limit_step<const M: usize>(unknowns: &mut SVector<f64, M>, step: &SVector<f64, M>) {
    let w = unknowns
        .iter()
        .zip(step.iter())
        .filter(|&(_, &d)| d != 0.0)
        .map(|(&x, &d)| ((x + d).clamp(0.0, 1.0) - x) / d)
        .fold(1.0, f64::min);
    *unknowns += step * w;
}

/// Newton iteration on the liquid and vapor compositions and L.
///
/// The residuals
///
/// + z_i - L x_i - (1 - L) y_i = 0
/// + f_L,i / f_V,i - 1 = 0 (x_i - y_i = 0 for components absent from the feed)
/// + Σ x_i - Σ y_i = 0
///
/// are evaluated with the 2N + 1 unknowns (x, y, L) as dual numbers,
/// which provides the exact Jacobian. The const parameter `M` has to
/// equal 2N + 1.
///
/// On success, the compositions, L, the K-values and the fugacity coefficients
/// are stored in `state` and the number of iterations is returned.
pub fn newton_composition_update<F: FluidSystem<N>, const N: usize, const M: usize>(
    system: &F,
    state: &mut FluidState<f64, N>,
    feed: &[f64; N],
    step: NewtonStep,
    verbosity: Verbosity,
) -> FlashResult<usize> {
    if M != 2 * N + 1 {
        return Err(FlashError::IncompatibleComponents(2 * N + 1, M));
    }

    let (x, y) = compute_liquid_vapor(state.k_values(), state.l(), feed);
    let mut unknowns = SVector::<f64, M>::zeros();
    for i in 0..N {
        unknowns[i] = x[i];
        unknowns[N + i] = y[i];
    }
    unknowns[2 * N] = state.l();
    log_result!(
        verbosity,
        "Newton: initial guess x = {:?}, y = {:?}, L = {}",
        x,
        y,
        state.l()
    );

    let (p_liquid, p_vapor) = (state.pressure(Phase::Liquid), state.pressure(Phase::Vapor));
    let t = state.temperature();

    log_iter!(verbosity, " iter |  norm2(res)  ");
    log_iter!(verbosity, "{:-<24}", "");

    for iter in 1..=MAX_ITER_NEWTON {
        let (residual, jac) = jacobian(
            |u: SVector<DualSVec64<M>, M>| {
                let mut dual_state = FluidState::<_, N>::new(
                    DualSVec64::<M>::from(p_liquid),
                    DualSVec64::<M>::from(t),
                );
                dual_state.set_pressure(Phase::Vapor, DualSVec64::<M>::from(p_vapor));
                for i in 0..N {
                    dual_state.set_mole_fraction(Phase::Liquid, i, u[i]);
                    dual_state.set_mole_fraction(Phase::Vapor, i, u[N + i]);
                }
                dual_state.set_l(u[2 * N]);
                let mut cache = system.parameter_cache();
                update_phases(system, &mut cache, &mut dual_state);

                SVector::<DualSVec64<M>, M>::from_fn(|row, _| {
                    if row < N {
                        mass_balance(&dual_state, feed, row)
                    } else if row < 2 * N {
                        phase_equilibrium(&dual_state, feed, row - N)
                    } else {
                        closure(&dual_state)
                    }
                })
            },
            unknowns,
        );

        let norm = residual.norm();
        log_iter!(verbosity, " {:4} | {:12.6e}", iter, norm);
        if !norm.is_finite() {
            return Err(FlashError::IterationFailed(
                "Newton composition update".to_owned(),
            ));
        }

        if norm < TOL_NEWTON {
            for i in 0..N {
                state.set_mole_fraction(Phase::Liquid, i, unknowns[i]);
                state.set_mole_fraction(Phase::Vapor, i, unknowns[N + i]);
                if feed[i] > 0.0 {
                    state.set_k(i, unknowns[N + i] / unknowns[i]);
                }
            }
            state.set_l(unknowns[2 * N]);
            let mut cache = system.parameter_cache();
            update_phases(system, &mut cache, state);
            log_result!(
                verbosity,
                "Newton: converged in {} step(s)\n{}",
                iter,
                state
            );
            return Ok(iter);
        }

        let jac = Array2::from_shape_fn((M, M), |(i, j)| jac[(i, j)]);
        let res = Array1::from_shape_fn(M, |i| residual[i]);
        let delta = LU::new(jac)?.solve(&res);
        let delta = SVector::<f64, M>::from_fn(|i, _| delta[i]);
        match step {
            NewtonStep::Damped(damping) => unknowns -= delta * damping,
            NewtonStep::Limited => limit_step(&mut unknowns, &(-delta)),
        }
    }
    Err(FlashError::NotConverged(
        "Newton composition update".to_owned(),
    ))
}

/// Residuals of the two-phase equilibrium conditions of a fluid state.
#[derive(Clone, Copy, Debug)]
pub struct CompositionResidual<const N: usize> {
    /// z_i - L x_i - (1 - L) y_i
    pub mass_balance: [f64; N],
    /// f_L,i / f_V,i - 1 (x_i - y_i for components absent from the feed)
    pub fugacity: [f64; N],
    /// Σ x_i - Σ y_i
    pub closure: f64,
}

impl<const N: usize> CompositionResidual<N> {
    /// Evaluate the residuals for the compositions and L stored in `state`.
    pub fn evaluate<F: FluidSystem<N>>(
        system: &F,
        state: &FluidState<f64, N>,
        feed: &[f64; N],
    ) -> Self {
        let mut state = *state;
        let mut cache = system.parameter_cache();
        update_phases(system, &mut cache, &mut state);

        Self {
            mass_balance: std::array::from_fn(|i| mass_balance(&state, feed, i)),
            fugacity: std::array::from_fn(|i| phase_equilibrium(&state, feed, i)),
            closure: closure(&state),
        }
    }

    /// Euclidean norm of all residuals.
    pub fn norm(&self) -> f64 {
        (self.mass_balance.iter().map(|r| r * r).sum::<f64>()
            + self.fugacity.iter().map(|r| r * r).sum::<f64>()
            + self.closure * self.closure)
            .sqrt()
    }

    /// Euclidean norm of the fugacity residuals only.
    pub fn fugacity_norm(&self) -> f64 {
        self.fugacity.iter().map(|r| r * r).sum::<f64>().sqrt()
    }

    pub fn is_fugacity_equilibrium(&self, tol: f64) -> bool {
        self.fugacity_norm() < tol
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cubic::{PengRobinson, PengRobinsonParameters, PengRobinsonRecord, PureRecord};
    use approx::assert_relative_eq;
    use nalgebra::Vector3;
    use std::sync::Arc;

    fn propane_butane() -> PengRobinson<2> {
        let records = vec![
            PureRecord::new(
                "propane",
                44.0962,
                PengRobinsonRecord::new(369.83, 4.248e6, 2.0e-4, 0.152),
            ),
            PureRecord::new(
                "n-butane",
                58.123,
                PengRobinsonRecord::new(425.12, 3.796e6, 2.55e-4, 0.2),
            ),
        ];
        PengRobinson::new(Arc::new(
            PengRobinsonParameters::from_records(records, None).unwrap(),
        ))
    }

    fn initial_state(pr: &PengRobinson<2>, feed: &[f64; 2]) -> FlashResult<FluidState<f64, 2>> {
        let mut state = FluidState::new(5e5, 300.0).with_wilson_k(pr);
        let l = rachford_rice(state.k_values(), feed, Verbosity::None)?;
        state.set_l(l);
        Ok(state)
    }

    #[test]
    fn liquid_vapor_compositions() {
        let (x, y) = compute_liquid_vapor(&[3.0, 0.1], 1.25 / 1.8, &[0.5, 0.5]);
        assert_relative_eq!(x.iter().sum::<f64>(), 1.0, epsilon = 1e-14);
        assert_relative_eq!(y.iter().sum::<f64>(), 1.0, epsilon = 1e-14);
        assert_relative_eq!(y[0] / x[0], 3.0, max_relative = 1e-12);
        assert_relative_eq!(y[1] / x[1], 0.1, max_relative = 1e-12);
    }

    #[test]
    fn absent_component_in_compositions() {
        // L + (1 - L) K vanishes for the third component
        let (x, y) = compute_liquid_vapor(&[3.0, 0.1, -1.0], 0.5, &[0.5, 0.5, 0.0]);
        assert_eq!((x[2], y[2]), (0.0, 0.0));
        assert_relative_eq!(x.iter().sum::<f64>(), 1.0, epsilon = 1e-14);
        assert_relative_eq!(y[0] / x[0], 3.0, max_relative = 1e-12);
    }

    #[test]
    fn step_limitation() {
        let mut unknowns = Vector3::new(0.5, 0.9, 0.2);
        limit_step(&mut unknowns, &Vector3::new(0.1, 0.2, -0.1));
        // the second unknown limits the step to one half
        assert_relative_eq!(unknowns, Vector3::new(0.55, 1.0, 0.15), epsilon = 1e-14);

        let mut unknowns = Vector3::new(0.5, 0.5, 0.5);
        limit_step(&mut unknowns, &Vector3::new(0.1, 0.0, -0.1));
        assert_relative_eq!(unknowns, Vector3::new(0.6, 0.5, 0.4), epsilon = 1e-14);
    }

    #[test]
    fn successive_substitution_converges() -> FlashResult<()> {
        let pr = propane_butane();
        let feed = [0.5, 0.5];
        let mut state = initial_state(&pr, &feed)?;
        let options = SolverOptions::new().max_iter(100);
        let (converged, _) = successive_substitution(&pr, &mut state, &feed, options)?;
        assert!(converged);
        let residual = CompositionResidual::evaluate(&pr, &state, &feed);
        assert!(residual.is_fugacity_equilibrium(1e-6));
        assert!(residual.mass_balance.iter().all(|r| r.abs() < 1e-8));
        Ok(())
    }

    #[test]
    fn newton_converges() -> FlashResult<()> {
        let pr = propane_butane();
        let feed = [0.5, 0.5];
        let mut state = initial_state(&pr, &feed)?;
        newton_composition_update::<_, 2, 5>(
            &pr,
            &mut state,
            &feed,
            NewtonStep::Damped(1.0),
            Verbosity::None,
        )?;
        let x = state.mole_fractions(Phase::Liquid);
        let y = state.mole_fractions(Phase::Vapor);
        assert_relative_eq!(x.iter().sum::<f64>(), 1.0, epsilon = 1e-6);
        assert_relative_eq!(y.iter().sum::<f64>(), 1.0, epsilon = 1e-6);
        assert!(y[0] > x[0]);
        assert!(state.l() > 0.0 && state.l() < 1.0);
        let residual = CompositionResidual::evaluate(&pr, &state, &feed);
        assert!(residual.norm() < 1e-7);
        assert_relative_eq!(state.k(0), y[0] / x[0], max_relative = 1e-12);
        Ok(())
    }

    #[test]
    fn newton_fixed_point() -> FlashResult<()> {
        let pr = propane_butane();
        let feed = [0.5, 0.5];
        let mut state = initial_state(&pr, &feed)?;
        let options = SolverOptions::new().max_iter(500).tol(1e-11);
        let (converged, _) = successive_substitution(&pr, &mut state, &feed, options)?;
        assert!(converged);
        let (x, y, l) = (
            *state.mole_fractions(Phase::Liquid),
            *state.mole_fractions(Phase::Vapor),
            state.l(),
        );

        let iter = newton_composition_update::<_, 2, 5>(
            &pr,
            &mut state,
            &feed,
            NewtonStep::Damped(1.0),
            Verbosity::None,
        )?;
        assert_eq!(iter, 1);
        assert!((state.l() - l).abs() < TOL_NEWTON);
        for i in 0..2 {
            assert!((state.mole_fraction(Phase::Liquid, i) - x[i]).abs() < TOL_NEWTON);
            assert!((state.mole_fraction(Phase::Vapor, i) - y[i]).abs() < TOL_NEWTON);
        }
        Ok(())
    }

    #[test]
    fn degenerate_newton_seed() {
        // both phases collapse onto pure propane, where L is undetermined
        let pr = propane_butane();
        let feed = [1.0, 0.0];
        let mut state = FluidState::new(5e5, 300.0);
        state.set_k(0, 2.0);
        state.set_k(1, 0.5);
        state.set_l(-0.5);
        let err = newton_composition_update::<_, 2, 5>(
            &pr,
            &mut state,
            &feed,
            NewtonStep::Damped(1.0),
            Verbosity::None,
        )
        .unwrap_err();
        assert!(err.is_convergence_failure());
        assert!(state.mole_fractions(Phase::Liquid).iter().all(|&x| x >= 0.0));
    }

    #[test]
    fn wrong_number_of_unknowns() {
        let pr = propane_butane();
        let mut state = FluidState::new(5e5, 300.0);
        let err = newton_composition_update::<_, 2, 4>(
            &pr,
            &mut state,
            &[0.5, 0.5],
            NewtonStep::Damped(1.0),
            Verbosity::None,
        )
        .unwrap_err();
        assert!(matches!(err, FlashError::IncompatibleComponents(5, 4)));
    }
}

use crate::errors::{FlashError, FlashResult};
use crate::Verbosity;

const MAX_ITER_RR: usize = 100;
const TOL_RR: f64 = 1e-10;

/// Rachford-Rice function g(L) = Σ z_i (K_i - 1) / (K_i - L (K_i - 1)).
pub fn rachford_rice_g(k: &[f64], z: &[f64], l: f64) -> f64 {
    k.iter()
        .zip(z)
        .map(|(&k, &z)| z * (k - 1.0) / (k - l * (k - 1.0)))
        .sum()
}

/// Derivative of the Rachford-Rice function with respect to L.
pub fn rachford_rice_dg_dl(k: &[f64], z: &[f64], l: f64) -> f64 {
    k.iter()
        .zip(z)
        .map(|(&k, &z)| z * (k - 1.0).powi(2) / (k - l * (k - 1.0)).powi(2))
        .sum()
}

/// Solve the Rachford-Rice equation for the liquid fraction L.
///
/// Newton's method is started in the middle of the interval spanned by the
/// poles of the smallest and largest K-value. As soon as an iterate leaves
/// that interval, the solver switches to bisection for good. The result
/// is clamped to [0, 1].
///
/// Components with K ≤ 0 (inert components) and components absent from
/// the feed do not take part in the search for the bounds.
pub fn rachford_rice(k: &[f64], z: &[f64], verbosity: Verbosity) -> FlashResult<f64> {
    let mut tracked = k
        .iter()
        .zip(z)
        .filter(|&(&k, &z)| z > 0.0 && k > 0.0 && k.is_finite())
        .map(|(&k, _)| k);
    let Some(k0) = tracked.next() else {
        return Err(FlashError::IterationFailed(
            "Rachford-Rice: no component with positive K-value in the feed".to_owned(),
        ));
    };
    let (mut k_min, mut k_max) = (k0, k0);
    for k in tracked {
        if k < k_min {
            k_min = k;
        } else if k >= k_max {
            k_max = k;
        }
    }

    let mut l_min = k_min / (k_min - 1.0);
    let mut l_max = k_max / (k_max - 1.0);
    if l_min > l_max {
        std::mem::swap(&mut l_min, &mut l_max);
    }

    let mut l = 0.5 * (l_min + l_max);
    log_iter!(
        verbosity,
        "Rachford-Rice: initial guess L = {} in [{}, {}]",
        l,
        l_min,
        l_max
    );
    log_iter!(verbosity, " iter |   abs(step)    |       L");
    log_iter!(verbosity, "{:-<38}", "");

    for i in 1..=MAX_ITER_RR {
        let delta = rachford_rice_g(k, z, l) / rachford_rice_dg_dl(k, z, l);
        l -= delta;

        if l < l_min || l > l_max {
            log_iter!(
                verbosity,
                "Rachford-Rice: L = {} left [{}, {}], continue with bisection",
                l,
                l_min,
                l_max
            );
            let l = bisection(k, z, l_min, l_max, verbosity)?.clamp(0.0, 1.0);
            log_result!(verbosity, "Rachford-Rice (bisection): converged to L = {}", l);
            return Ok(l);
        }

        log_iter!(verbosity, " {:4} | {:14.8e} | {:14.8}", i, delta.abs(), l);
        if delta.abs() < TOL_RR {
            let l = l.clamp(0.0, 1.0);
            log_result!(
                verbosity,
                "Rachford-Rice: converged to L = {} in {} step(s)",
                l,
                i
            );
            return Ok(l);
        }
    }
    Err(FlashError::NotConverged("Rachford-Rice".to_owned()))
}

fn bisection(
    k: &[f64],
    z: &[f64],
    mut l_min: f64,
    mut l_max: f64,
    verbosity: Verbosity,
) -> FlashResult<f64> {
    // g increases monotonically on the bracket and diverges to -inf at its
    // lower end, which is a pole of g.
    let mut g_min = f64::NEG_INFINITY;

    log_iter!(verbosity, " iter |    g(Lmid)     |       L");
    log_iter!(verbosity, "{:-<38}", "");
    for i in 1..=MAX_ITER_RR {
        let l = 0.5 * (l_min + l_max);
        let g_mid = rachford_rice_g(k, z, l);
        log_iter!(verbosity, " {:4} | {:14.8e} | {:14.8}", i, g_mid, l);

        if g_mid.abs() < TOL_RR || (0.5 * (l_max - l_min)).abs() < TOL_RR {
            return Ok(l);
        }
        if g_mid.signum() != g_min.signum() {
            l_max = l;
        } else {
            l_min = l;
            g_min = g_mid;
        }
    }
    Err(FlashError::NotConverged("Rachford-Rice (bisection)".to_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use proptest::prelude::*;

    #[test]
    fn binary_split() -> FlashResult<()> {
        let k = [3.0, 0.1];
        let z = [0.5, 0.5];
        let l = rachford_rice(&k, &z, Verbosity::None)?;
        assert!(l > 0.0 && l < 1.0);
        assert_relative_eq!(l, 1.25 / 1.8, max_relative = 1e-10);
        assert!(rachford_rice_g(&k, &z, l).abs() < 1e-10);
        Ok(())
    }

    #[test]
    fn bisection_on_bracket() -> FlashResult<()> {
        let k = [3.0, 0.1];
        let z = [0.6, 0.4];
        let l = bisection(&k, &z, 0.1 / (0.1 - 1.0), 1.5, Verbosity::None)?;
        assert_relative_eq!(l, 0.96 / 1.8, max_relative = 1e-8);
        Ok(())
    }

    #[test]
    fn clamped_to_physical_range() -> FlashResult<()> {
        // all K < 1: the bracketed root lies below zero
        let l = rachford_rice(&[0.5, 0.1], &[0.5, 0.5], Verbosity::None)?;
        assert_eq!(l, 0.0);
        // bracketed root at L = 5
        let l = rachford_rice(&[1.1, 0.5], &[0.5, 0.5], Verbosity::None)?;
        assert_eq!(l, 1.0);
        Ok(())
    }

    #[test]
    fn inert_component_is_ignored_in_bounds() -> FlashResult<()> {
        let k = [3.0, 0.1, 0.0];
        let z = [0.45, 0.45, 0.1];
        let l = rachford_rice(&k, &z, Verbosity::None)?;
        assert!(l > 0.0 && l < 1.0);
        Ok(())
    }

    #[test]
    fn absent_component_is_ignored_in_bounds() -> FlashResult<()> {
        // without the third component the bracket is [-1, 1.5] and the root is 0.25
        let k = [3.0, 0.5, 0.2];
        let l = rachford_rice(&k, &[0.5, 0.5, 0.0], Verbosity::None)?;
        assert_relative_eq!(l, 0.25, max_relative = 1e-10);
        let l_binary = rachford_rice(&k[..2], &[0.5, 0.5], Verbosity::None)?;
        assert_relative_eq!(l, l_binary, max_relative = 1e-10);
        Ok(())
    }

    #[test]
    fn no_tracked_component() {
        let err = rachford_rice(&[0.0, 0.0], &[0.5, 0.5], Verbosity::None).unwrap_err();
        assert!(err.is_convergence_failure());
    }

    fn composition(n: usize) -> impl Strategy<Value = Vec<f64>> {
        prop::collection::vec(0.01f64..1.0, n).prop_map(|z| {
            let s: f64 = z.iter().sum();
            z.into_iter().map(|z| z / s).collect()
        })
    }

    proptest! {
        #[test]
        fn root_or_boundary(
            (k_low, k_high, k, z) in (2usize..8).prop_flat_map(|n| {
                (
                    0.01f64..0.99,
                    1.01f64..20.0,
                    prop::collection::vec(0.01f64..20.0, n),
                    composition(n),
                )
            })
        ) {
            // K-values that bracket one
            let mut k = k;
            k[0] = k_low;
            k[1] = k_high;

            let l = rachford_rice(&k, &z, Verbosity::None).unwrap();
            prop_assert!((0.0..=1.0).contains(&l));
            let g = rachford_rice_g(&k, &z, l);
            if l > 0.0 && l < 1.0 {
                // both solvers stop on a step |ΔL| < 1e-10, which bounds g only
                // relative to its slope: |g| ≈ g' |ΔL|
                let scale = rachford_rice_dg_dl(&k, &z, l).max(1.0);
                prop_assert!(g.abs() < 1e-8 * scale, "g({}) = {}", l, g);
            } else if l == 0.0 {
                prop_assert!(g > -1e-8);
            } else {
                prop_assert!(g < 1e-8);
            }
        }

        #[test]
        fn all_equal_k_values(
            k in 0.05f64..20.0,
            z in (1usize..6).prop_flat_map(composition),
        ) {
            prop_assume!((k - 1.0).abs() > 1e-6);
            let k = vec![k; z.len()];
            // the bracket collapses onto the pole of g: depending on rounding the
            // Newton step is NaN or the pole itself is returned and clamped
            match rachford_rice(&k, &z, Verbosity::None) {
                Err(e) => {
                    prop_assert!(matches!(e, FlashError::NotConverged(_)));
                }
                Ok(l) => {
                    prop_assert_eq!(l, if k[0] < 1.0 { 0.0 } else { 1.0 });
                }
            }
        }
    }
}

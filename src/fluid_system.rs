use num_dual::DualNum;
use crate::state::FluidState;
use std::fmt;

/// The two fluid phases that take part in the flash.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Liquid (oil) phase
    Liquid,
    /// Vapor (gas) phase
    Vapor,
}

impl Phase {
    /// Index of the phase in per-phase storage.
    pub fn index(self) -> usize {
        match self {
            Self::Liquid => 0,
            Self::Vapor => 1,
        }
    }

    /// The respective other phase.
    pub fn other(self) -> Self {
        match self {
            Self::Liquid => Self::Vapor,
            Self::Vapor => Self::Liquid,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Liquid => write!(f, "liquid"),
            Self::Vapor => write!(f, "vapor"),
        }
    }
}

/// Component properties and fugacity model of a fluid with `N` components.
///
/// Fugacity coefficients are evaluated through a per-phase parameter cache:
/// [FluidSystem::update_phase] has to be called for a phase every time its
/// composition, pressure or temperature changes and before
/// [FluidSystem::fugacity_coefficient] is queried for that phase.
///
/// All evaluations are generic over [DualNum], so that the same model
/// provides plain values (`f64`) and exact derivatives (e.g. `DualSVec64`).
pub trait FluidSystem<const N: usize> {
    /// Phase-wise intermediate results of the fugacity model.
    type ParameterCache<D: DualNum<f64> + Copy>;

    /// Critical temperature of component `i` in K.
    fn critical_temperature(&self, i: usize) -> f64;

    /// Critical pressure of component `i` in Pa.
    fn critical_pressure(&self, i: usize) -> f64;

    /// Critical molar volume of component `i`.
    fn critical_volume(&self, i: usize) -> f64;

    /// Acentric factor of component `i`.
    fn acentric_factor(&self, i: usize) -> f64;

    /// Create an empty parameter cache.
    fn parameter_cache<D: DualNum<f64> + Copy>(&self) -> Self::ParameterCache<D>;

    /// Refresh the cache for `phase` from the current fluid state.
    fn update_phase<D: DualNum<f64> + Copy>(
        &self,
        cache: &mut Self::ParameterCache<D>,
        state: &FluidState<D, N>,
        phase: Phase,
    );

    /// Fugacity coefficient of component `i` in `phase`.
    fn fugacity_coefficient<D: DualNum<f64> + Copy>(
        &self,
        state: &FluidState<D, N>,
        cache: &Self::ParameterCache<D>,
        phase: Phase,
        i: usize,
    ) -> D;

    /// Refresh the cache for `phase` and store the fugacity coefficients
    /// of all components in the fluid state.
    fn update_fugacity_coefficients<D: DualNum<f64> + Copy>(
        &self,
        cache: &mut Self::ParameterCache<D>,
        state: &mut FluidState<D, N>,
        phase: Phase,
    ) {
        self.update_phase(cache, state, phase);
        let phi: [D; N] =
            std::array::from_fn(|i| self.fugacity_coefficient(state, cache, phase, i));
        for (i, phi) in phi.into_iter().enumerate() {
            state.set_fugacity_coefficient(phase, i, phi);
        }
    }

    /// Wilson's correlation for the K-value of component `i`.
    fn wilson_k(&self, i: usize, pressure: f64, temperature: f64) -> f64 {
        let omega = self.acentric_factor(i);
        let tc = self.critical_temperature(i);
        let pc = self.critical_pressure(i);
        (5.3727 * (1.0 + omega) * (1.0 - tc / temperature)).exp() * pc / pressure
    }
}

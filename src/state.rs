use num_dual::DualNum;
use crate::fluid_system::{FluidSystem, Phase};
use std::fmt;

/// Thermodynamic state of a two-phase fluid with `N` components.
///
/// The state is owned by the caller (e.g. one per grid cell). Besides pressure,
/// temperature, saturations and the phase compositions it stores the K-values
/// and the liquid fraction L of the last flash, which are used to warm-start
/// the next flash of the same fluid.
#[derive(Clone, Copy, Debug)]
pub struct FluidState<D, const N: usize> {
    pressure: [D; 2],
    temperature: D,
    saturation: [D; 2],
    mole_fractions: [[D; N]; 2],
    fugacity_coefficients: [[D; N]; 2],
    k: [D; N],
    l: D,
}

impl<D: DualNum<f64> + Copy, const N: usize> FluidState<D, N> {
    /// Create a state at given pressure (both phases) and temperature.
    ///
    /// K-values are initialized to one and L to -1, the value used
    /// for fluids without a previous flash.
    pub fn new(pressure: D, temperature: D) -> Self {
        Self {
            pressure: [pressure; 2],
            temperature,
            saturation: [D::zero(); 2],
            mole_fractions: [[D::zero(); N]; 2],
            fugacity_coefficients: [[D::one(); N]; 2],
            k: [D::one(); N],
            l: D::from(-1.0),
        }
    }

    /// Initialize the K-values with Wilson's correlation and set L to -1.
    pub fn with_wilson_k<F: FluidSystem<N>>(mut self, system: &F) -> Self {
        let p = self.pressure(Phase::Liquid).re();
        let t = self.temperature.re();
        for i in 0..N {
            self.k[i] = D::from(system.wilson_k(i, p, t));
        }
        self.l = D::from(-1.0);
        self
    }

    pub fn pressure(&self, phase: Phase) -> D {
        self.pressure[phase.index()]
    }

    pub fn set_pressure(&mut self, phase: Phase, pressure: D) {
        self.pressure[phase.index()] = pressure;
    }

    pub fn temperature(&self) -> D {
        self.temperature
    }

    pub fn set_temperature(&mut self, temperature: D) {
        self.temperature = temperature;
    }

    pub fn saturation(&self, phase: Phase) -> D {
        self.saturation[phase.index()]
    }

    pub fn set_saturation(&mut self, phase: Phase, saturation: D) {
        self.saturation[phase.index()] = saturation;
    }

    pub fn mole_fraction(&self, phase: Phase, i: usize) -> D {
        self.mole_fractions[phase.index()][i]
    }

    pub fn set_mole_fraction(&mut self, phase: Phase, i: usize, x: D) {
        self.mole_fractions[phase.index()][i] = x;
    }

    /// Composition of `phase`.
    pub fn mole_fractions(&self, phase: Phase) -> &[D; N] {
        &self.mole_fractions[phase.index()]
    }

    pub fn set_mole_fractions(&mut self, phase: Phase, x: &[D; N]) {
        self.mole_fractions[phase.index()] = *x;
    }

    /// Equilibrium ratio y_i/x_i of component `i`.
    pub fn k(&self, i: usize) -> D {
        self.k[i]
    }

    pub fn set_k(&mut self, i: usize, k: D) {
        self.k[i] = k;
    }

    pub fn k_values(&self) -> &[D; N] {
        &self.k
    }

    /// Liquid mole fraction of the two-phase mixture.
    pub fn l(&self) -> D {
        self.l
    }

    pub fn set_l(&mut self, l: D) {
        self.l = l;
    }

    pub fn fugacity_coefficient(&self, phase: Phase, i: usize) -> D {
        self.fugacity_coefficients[phase.index()][i]
    }

    pub fn set_fugacity_coefficient(&mut self, phase: Phase, i: usize, phi: D) {
        self.fugacity_coefficients[phase.index()][i] = phi;
    }

    /// Fugacity of component `i` in `phase`: `x_i * phi_i * p`.
    pub fn fugacity(&self, phase: Phase, i: usize) -> D {
        self.mole_fraction(phase, i) * self.fugacity_coefficient(phase, i) * self.pressure(phase)
    }

    /// Copy of the state without derivative information.
    pub fn to_scalar(&self) -> FluidState<f64, N> {
        let re = |v: &[D; N]| v.map(|v| v.re());
        FluidState {
            pressure: self.pressure.map(|p| p.re()),
            temperature: self.temperature.re(),
            saturation: self.saturation.map(|s| s.re()),
            mole_fractions: [re(&self.mole_fractions[0]), re(&self.mole_fractions[1])],
            fugacity_coefficients: [
                re(&self.fugacity_coefficients[0]),
                re(&self.fugacity_coefficients[1]),
            ],
            k: re(&self.k),
            l: self.l.re(),
        }
    }
}

impl<D: DualNum<f64> + Copy, const N: usize> fmt::Display for FluidState<D, N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let re = |v: &[D; N]| v.map(|v| v.re());
        write!(
            f,
            "p = {} Pa, T = {} K, L = {}, K = {:?}, x = {:?}, y = {:?}",
            self.pressure[0].re(),
            self.temperature.re(),
            self.l.re(),
            re(&self.k),
            re(&self.mole_fractions[0]),
            re(&self.mole_fractions[1])
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use num_dual::Dual64;

    #[test]
    fn fugacity_from_coefficient() {
        let mut state = FluidState::<f64, 2>::new(2e6, 300.0);
        state.set_mole_fractions(Phase::Vapor, &[0.25, 0.75]);
        state.set_fugacity_coefficient(Phase::Vapor, 1, 0.8);
        state.set_pressure(Phase::Vapor, 1e6);
        assert_relative_eq!(state.fugacity(Phase::Vapor, 0), 0.25e6);
        assert_relative_eq!(state.fugacity(Phase::Vapor, 1), 0.6e6);
        assert_relative_eq!(state.pressure(Phase::Liquid), 2e6);
        assert_eq!(state.l(), -1.0);
    }

    #[test]
    fn scalar_snapshot_drops_derivatives() {
        let mut state =
            FluidState::<Dual64, 2>::new(Dual64::from(1e5).derivative(), Dual64::from(350.0));
        state.set_k(1, Dual64::new(3.0, 2.0));
        state.set_l(Dual64::from(0.4).derivative());
        assert_eq!(state.l().eps, 1.0);
        let scalar = state.to_scalar();
        assert_eq!(scalar.pressure(Phase::Vapor), 1e5);
        assert_eq!(scalar.temperature(), 350.0);
        assert_eq!(scalar.k_values(), &[1.0, 3.0]);
        assert_eq!(scalar.l(), 0.4);
    }
}

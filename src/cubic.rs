//! Implementation of the Peng-Robinson equation of state as a [FluidSystem].
//!
//! The implementation closely follows the form of the equations given in
//! [this wikipedia article](https://en.wikipedia.org/wiki/Cubic_equations_of_state#Peng%E2%80%93Robinson_equation_of_state).
//! Fugacity coefficients are available for plain values and for dual numbers, which
//! is what the Newton composition update relies on.
use crate::errors::{FlashError, FlashResult};
use crate::fluid_system::{FluidSystem, Phase};
use crate::state::FluidState;
use num_dual::DualNum;
use serde::{Deserialize, Serialize};
use std::f64::consts::{FRAC_PI_3, SQRT_2};
use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

/// Ideal gas constant in J/(mol K).
pub const RGAS: f64 = 8.314462618;

/// Peng-Robinson parameters for a single substance.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct PengRobinsonRecord {
    /// critical temperature in Kelvin
    tc: f64,
    /// critical pressure in Pascal
    pc: f64,
    /// critical molar volume in m³/mol
    vc: f64,
    /// acentric factor
    acentric_factor: f64,
}

impl PengRobinsonRecord {
    /// Create a new pure substance record for the Peng-Robinson equation of state.
    pub fn new(tc: f64, pc: f64, vc: f64, acentric_factor: f64) -> Self {
        Self {
            tc,
            pc,
            vc,
            acentric_factor,
        }
    }
}

impl fmt::Display for PengRobinsonRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PengRobinsonRecord(tc={} K", self.tc)?;
        write!(f, ", pc={} Pa", self.pc)?;
        write!(f, ", vc={} m³/mol", self.vc)?;
        write!(f, ", acentric factor={})", self.acentric_factor)
    }
}

/// A pure component record as stored in parameter files.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PureRecord {
    pub name: String,
    /// Molar weight in g/mol
    pub molarweight: f64,
    pub model_record: PengRobinsonRecord,
}

impl PureRecord {
    pub fn new(name: &str, molarweight: f64, model_record: PengRobinsonRecord) -> Self {
        Self {
            name: name.into(),
            molarweight,
            model_record,
        }
    }
}

/// Peng-Robinson parameters for a mixture of `N` substances.
#[derive(Debug, Clone)]
pub struct PengRobinsonParameters<const N: usize> {
    tc: [f64; N],
    pc: [f64; N],
    vc: [f64; N],
    acentric_factor: [f64; N],
    a: [f64; N],
    b: [f64; N],
    kappa: [f64; N],
    /// Binary interaction parameter
    k_ij: [[f64; N]; N],
    /// List of pure component records
    pure_records: Vec<PureRecord>,
}

impl<const N: usize> fmt::Display for PengRobinsonParameters<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.pure_records
            .iter()
            .try_for_each(|pr| writeln!(f, "{}: {}", pr.name, pr.model_record))?;
        writeln!(f, "\nk_ij:\n{:?}", self.k_ij)
    }
}

impl<const N: usize> PengRobinsonParameters<N> {
    /// Creates parameters from pure component records and (optional)
    /// binary interaction parameters.
    pub fn from_records(
        pure_records: Vec<PureRecord>,
        k_ij: Option<[[f64; N]; N]>,
    ) -> FlashResult<Self> {
        if pure_records.len() != N {
            return Err(FlashError::IncompatibleComponents(N, pure_records.len()));
        }

        let mut tc = [0.0; N];
        let mut pc = [0.0; N];
        let mut vc = [0.0; N];
        let mut acentric_factor = [0.0; N];
        let mut a = [0.0; N];
        let mut b = [0.0; N];
        let mut kappa = [0.0; N];
        for (i, record) in pure_records.iter().enumerate() {
            let r = &record.model_record;
            if r.tc <= 0.0 || r.pc <= 0.0 {
                return Err(FlashError::IncompatibleParameters(format!(
                    "critical temperature and pressure of '{}' have to be positive",
                    record.name
                )));
            }
            tc[i] = r.tc;
            pc[i] = r.pc;
            vc[i] = r.vc;
            acentric_factor[i] = r.acentric_factor;
            a[i] = 0.45724 * (RGAS * r.tc).powi(2) / r.pc;
            b[i] = 0.07780 * RGAS * r.tc / r.pc;
            let w = r.acentric_factor;
            kappa[i] = if w <= 0.49 {
                0.37464 + (1.54226 - 0.26992 * w) * w
            } else {
                0.379642 + (1.48503 + (-0.164423 + 0.016666 * w) * w) * w
            };
        }

        Ok(Self {
            tc,
            pc,
            vc,
            acentric_factor,
            a,
            b,
            kappa,
            k_ij: k_ij.unwrap_or([[0.0; N]; N]),
            pure_records,
        })
    }

    /// Read the pure component records of the given substances from a json file.
    pub fn from_json<P: AsRef<Path>>(
        substances: [&str; N],
        file: P,
        k_ij: Option<[[f64; N]; N]>,
    ) -> FlashResult<Self> {
        let reader = BufReader::new(File::open(file)?);
        let records: Vec<PureRecord> = serde_json::from_reader(reader)?;

        let mut missing = Vec::new();
        let mut pure_records = Vec::with_capacity(N);
        for s in substances {
            match records.iter().find(|r| r.name == s) {
                Some(r) => pure_records.push(r.clone()),
                None => missing.push(s),
            }
        }
        if !missing.is_empty() {
            return Err(FlashError::ComponentsNotFound(missing.join(", ")));
        }
        Self::from_records(pure_records, k_ij)
    }

    pub fn pure_records(&self) -> &[PureRecord] {
        &self.pure_records
    }
}

/// Phase-wise mixture parameters and compressibility factor.
#[derive(Clone, Copy, Debug)]
struct PhaseParameters<D, const N: usize> {
    a_mix: D,
    b_mix: D,
    a: D,
    b: D,
    z: D,
    sum_xa: [D; N],
}

/// Parameter cache of the Peng-Robinson fluid system.
#[derive(Clone, Copy, Debug)]
pub struct PengRobinsonCache<D, const N: usize> {
    phases: [PhaseParameters<D, N>; 2],
}

impl<D: DualNum<f64> + Copy, const N: usize> PengRobinsonCache<D, N> {
    fn new() -> Self {
        let empty = PhaseParameters {
            a_mix: D::zero(),
            b_mix: D::zero(),
            a: D::zero(),
            b: D::zero(),
            z: D::zero(),
            sum_xa: [D::zero(); N],
        };
        Self {
            phases: [empty; 2],
        }
    }

    /// Compressibility factor of `phase` at the last update.
    pub fn compressibility_factor(&self, phase: Phase) -> D {
        self.phases[phase.index()].z
    }
}

/// The Peng-Robinson equation of state for `N` components.
#[derive(Debug, Clone)]
pub struct PengRobinson<const N: usize> {
    parameters: Arc<PengRobinsonParameters<N>>,
}

impl<const N: usize> PengRobinson<N> {
    /// Create a new equation of state from a set of parameters.
    pub fn new(parameters: Arc<PengRobinsonParameters<N>>) -> Self {
        Self { parameters }
    }

    pub fn parameters(&self) -> &PengRobinsonParameters<N> {
        &self.parameters
    }
}

impl<const N: usize> fmt::Display for PengRobinson<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Peng Robinson")
    }
}

impl<const N: usize> FluidSystem<N> for PengRobinson<N> {
    type ParameterCache<D: DualNum<f64> + Copy> = PengRobinsonCache<D, N>;

    fn critical_temperature(&self, i: usize) -> f64 {
        self.parameters.tc[i]
    }

    fn critical_pressure(&self, i: usize) -> f64 {
        self.parameters.pc[i]
    }

    fn critical_volume(&self, i: usize) -> f64 {
        self.parameters.vc[i]
    }

    fn acentric_factor(&self, i: usize) -> f64 {
        self.parameters.acentric_factor[i]
    }

    fn parameter_cache<D: DualNum<f64> + Copy>(&self) -> PengRobinsonCache<D, N> {
        PengRobinsonCache::new()
    }

    fn update_phase<D: DualNum<f64> + Copy>(
        &self,
        cache: &mut PengRobinsonCache<D, N>,
        state: &FluidState<D, N>,
        phase: Phase,
    ) {
        let p = &self.parameters;
        let t = state.temperature();
        let pressure = state.pressure(phase);
        let x = state.mole_fractions(phase);

        // temperature dependent a parameter
        let ak: [D; N] = std::array::from_fn(|i| {
            let alpha = (D::one() - (t / p.tc[i]).sqrt()) * p.kappa[i] + 1.0;
            alpha.powi(2) * p.a[i]
        });

        // Mixing rules
        let mut sum_xa = [D::zero(); N];
        for i in 0..N {
            for j in 0..N {
                sum_xa[i] += x[j] * (ak[i] * ak[j]).sqrt() * (1.0 - p.k_ij[i][j]);
            }
        }
        let a_mix = (0..N).fold(D::zero(), |acc, i| acc + x[i] * sum_xa[i]);
        let b_mix = (0..N).fold(D::zero(), |acc, i| acc + x[i] * p.b[i]);

        let rt = t * RGAS;
        let a = a_mix * pressure / (rt * rt);
        let b = b_mix * pressure / rt;
        let z = compressibility_factor(a, b, phase);

        cache.phases[phase.index()] = PhaseParameters {
            a_mix,
            b_mix,
            a,
            b,
            z,
            sum_xa,
        };
    }

    fn fugacity_coefficient<D: DualNum<f64> + Copy>(
        &self,
        _: &FluidState<D, N>,
        cache: &PengRobinsonCache<D, N>,
        phase: Phase,
        i: usize,
    ) -> D {
        let pp = &cache.phases[phase.index()];
        let bi_b = pp.b_mix.recip() * self.parameters.b[i];
        let ln_phi = bi_b * (pp.z - 1.0)
            - (pp.z - pp.b).ln()
            - pp.a / (pp.b * (2.0 * SQRT_2))
                * (pp.sum_xa[i] * 2.0 / pp.a_mix - bi_b)
                * ((pp.z + pp.b * (1.0 + SQRT_2)) / (pp.z + pp.b * (1.0 - SQRT_2))).ln();
        ln_phi.exp()
    }
}

/// Compressibility factor of the phase from the reduced
/// attraction (`a`) and covolume (`b`) parameters.
///
/// The cubic is solved for the real parts. The liquid uses the smallest
/// root above `b`, the vapor the largest root. A single Newton step in
/// `D` arithmetic supplies the derivatives of the root.
fn compressibility_factor<D: DualNum<f64> + Copy>(a: D, b: D, phase: Phase) -> D {
    let c2 = b - 1.0;
    let c1 = a - b * b * 3.0 - b * 2.0;
    let c0 = -(a * b - b * b - b * b * b);

    let (roots, n) = real_roots(c2.re(), c1.re(), c0.re());
    let roots = &roots[..n];
    let z_max = roots.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let z0 = match phase {
        Phase::Vapor => z_max,
        Phase::Liquid => {
            let z_min = roots
                .iter()
                .copied()
                .filter(|&z| z > b.re())
                .fold(f64::INFINITY, f64::min);
            if z_min.is_finite() {
                z_min
            } else {
                z_max
            }
        }
    };

    let z = D::from(z0);
    let f = ((z + c2) * z + c1) * z + c0;
    let df = (z * 3.0 + c2 * 2.0) * z + c1;
    if df.re().abs() < f64::EPSILON {
        return z;
    }
    z - f / df
}

/// Real roots of `z³ + c2 z² + c1 z + c0`.
fn real_roots(c2: f64, c1: f64, c0: f64) -> ([f64; 3], usize) {
    let shift = c2 / 3.0;
    let p = c1 - c2 * shift;
    let q = 2.0 * shift.powi(3) - shift * c1 + c0;
    let disc = 0.25 * q * q + p.powi(3) / 27.0;

    if disc > 0.0 {
        let sd = disc.sqrt();
        let t = (-0.5 * q + sd).cbrt() + (-0.5 * q - sd).cbrt();
        ([t - shift, 0.0, 0.0], 1)
    } else if p == 0.0 {
        ([(-q).cbrt() - shift, 0.0, 0.0], 1)
    } else {
        let r = 2.0 * (-p / 3.0).sqrt();
        let phi = (1.5 * q / p * (-3.0 / p).sqrt()).clamp(-1.0, 1.0).acos() / 3.0;
        (
            [
                r * phi.cos() - shift,
                r * (phi - 2.0 * FRAC_PI_3).cos() - shift,
                r * (phi - 4.0 * FRAC_PI_3).cos() - shift,
            ],
            3,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use num_dual::Dual64;

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

    #[test]
    fn cubic_roots() {
        // (z - 1)(z - 2)(z - 3)
        let (roots, n) = real_roots(-6.0, 11.0, -6.0);
        assert_eq!(n, 3);
        let mut roots = roots;
        roots.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_relative_eq!(roots[0], 1.0, max_relative = 1e-12);
        assert_relative_eq!(roots[1], 2.0, max_relative = 1e-12);
        assert_relative_eq!(roots[2], 3.0, max_relative = 1e-12);

        // (z - 2)(z² + 1)
        let (roots, n) = real_roots(-2.0, 1.0, -2.0);
        assert_eq!(n, 1);
        assert_relative_eq!(roots[0], 2.0, max_relative = 1e-12);
    }

    #[test]
    fn ideal_gas_limit() {
        let pr = propane_butane();
        let mut state = FluidState::<f64, 2>::new(1.0, 300.0);
        state.set_mole_fractions(Phase::Vapor, &[0.5, 0.5]);
        let mut cache = pr.parameter_cache();
        pr.update_fugacity_coefficients(&mut cache, &mut state, Phase::Vapor);
        assert_relative_eq!(
            cache.compressibility_factor(Phase::Vapor),
            1.0,
            max_relative = 1e-4
        );
        assert_relative_eq!(
            state.fugacity_coefficient(Phase::Vapor, 0),
            1.0,
            max_relative = 1e-4
        );
    }

    #[test]
    fn liquid_and_vapor_roots() {
        let pr = propane_butane();
        let mut state = FluidState::<f64, 2>::new(5e5, 300.0);
        state.set_mole_fractions(Phase::Liquid, &[0.5, 0.5]);
        state.set_mole_fractions(Phase::Vapor, &[0.5, 0.5]);
        let mut cache = pr.parameter_cache();
        pr.update_phase(&mut cache, &state, Phase::Liquid);
        pr.update_phase(&mut cache, &state, Phase::Vapor);
        let z_l = cache.compressibility_factor(Phase::Liquid);
        let z_v = cache.compressibility_factor(Phase::Vapor);
        assert!(z_l < 0.1);
        assert!(z_v > 0.8);
    }

    #[test]
    fn supercritical_single_root() {
        let pr = propane_butane();
        let mut state = FluidState::<f64, 2>::new(1e5, 600.0);
        state.set_mole_fractions(Phase::Liquid, &[0.3, 0.7]);
        state.set_mole_fractions(Phase::Vapor, &[0.3, 0.7]);
        let mut cache = pr.parameter_cache();
        pr.update_fugacity_coefficients(&mut cache, &mut state, Phase::Liquid);
        pr.update_fugacity_coefficients(&mut cache, &mut state, Phase::Vapor);
        for i in 0..2 {
            assert_relative_eq!(
                state.fugacity_coefficient(Phase::Liquid, i),
                state.fugacity_coefficient(Phase::Vapor, i),
                max_relative = 1e-12
            );
        }
    }

    #[test]
    fn fugacity_coefficient_derivatives() {
        let pr = propane_butane();
        let x = [0.3, 0.7];
        let phi = |x: [f64; 2]| {
            let mut state = FluidState::<f64, 2>::new(5e5, 300.0);
            state.set_mole_fractions(Phase::Liquid, &x);
            let mut cache = pr.parameter_cache();
            pr.update_phase(&mut cache, &state, Phase::Liquid);
            [0, 1].map(|i| pr.fugacity_coefficient(&state, &cache, Phase::Liquid, i))
        };

        let h = 1e-6;
        for j in 0..2 {
            let xd: [Dual64; 2] = std::array::from_fn(|i| {
                let xi = Dual64::from(x[i]);
                if i == j {
                    xi.derivative()
                } else {
                    xi
                }
            });
            let mut state = FluidState::new(Dual64::from(5e5), Dual64::from(300.0));
            state.set_mole_fractions(Phase::Liquid, &xd);
            let mut cache = pr.parameter_cache();
            pr.update_phase(&mut cache, &state, Phase::Liquid);

            let mut xp = x;
            let mut xm = x;
            xp[j] += h;
            xm[j] -= h;
            let (fp, fm) = (phi(xp), phi(xm));
            for i in 0..2 {
                let dual = pr.fugacity_coefficient(&state, &cache, Phase::Liquid, i);
                assert_relative_eq!(dual.re, phi(x)[i], max_relative = 1e-12);
                assert_relative_eq!(dual.eps, (fp[i] - fm[i]) / (2.0 * h), max_relative = 1e-5);
            }
        }
    }
}

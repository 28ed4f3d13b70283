//! Lumped-parameter (R1C1 / R2C2) thermal model of the dwelling.
//!
//! The model is integrated with explicit Euler. A step is accepted only when
//! `Δt <= MAX_DT_OVER_TAU * τ_min`, where `τ_min` is the smallest nodal time
//! constant `C_i / Σ_j (1 / R_ij)`. Below that bound the scheme is stable and
//! non-oscillating.

use serde::{Deserialize, Serialize};

use crate::error::{TwinError, ensure_finite};

use super::types::{ActuatorCommand, ExternalConditions, ThermalState};

/// Upper bound on `Δt / τ_min` accepted by [`ThermalModel::step`].
pub const MAX_DT_OVER_TAU: f64 = 0.5;

/// Second capacitance node representing the envelope / thermal mass.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnvelopeParams {
    /// Resistance between interior air and the mass node (K/W).
    pub r_interior_k_per_w: f64,
    /// Resistance between the mass node and the exterior (K/W).
    pub r_exterior_k_per_w: f64,
    /// Capacitance of the mass node (J/K).
    pub c_j_per_k: f64,
}

/// Physical parameters of the building.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BuildingParams {
    /// Direct heat-loss resistance from interior air to exterior (K/W).
    pub r_k_per_w: f64,
    /// Interior capacitance (J/K).
    pub c_j_per_k: f64,
    /// Heater power at 100% command (W).
    pub heater_max_w: f64,
    /// Glazing area receiving solar irradiance (m²).
    pub glazing_area_m2: f64,
    /// Solar transmittance of the glazing (g-value, 0-1).
    pub transmittance: f64,
    /// Optional envelope node.
    pub envelope: Option<EnvelopeParams>,
}

impl Default for BuildingParams {
    fn default() -> Self {
        Self {
            r_k_per_w: 0.006,
            c_j_per_k: 1.2e7,
            heater_max_w: 4000.0,
            glazing_area_m2: 4.0,
            transmittance: 0.7,
            envelope: None,
        }
    }
}

impl BuildingParams {
    /// Single-node building with the given heat-loss resistance and capacitance.
    pub fn r1c1(r_k_per_w: f64, c_j_per_k: f64, heater_max_w: f64) -> Self {
        Self {
            r_k_per_w,
            c_j_per_k,
            heater_max_w,
            ..Self::default()
        }
    }

    /// Two-node building: light interior air node coupled to a heavy envelope.
    pub fn two_node() -> Self {
        Self {
            r_k_per_w: 0.02,
            c_j_per_k: 2.0e6,
            envelope: Some(EnvelopeParams {
                r_interior_k_per_w: 0.002,
                r_exterior_k_per_w: 0.008,
                c_j_per_k: 2.0e7,
            }),
            ..Self::default()
        }
    }
}

/// Equivalent-circuit thermal model.
///
/// `step` is a pure function of its arguments: the model holds parameters
/// only, never state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThermalModel {
    params: BuildingParams,
}

impl ThermalModel {
    /// Builds a model after validating every parameter.
    ///
    /// # Errors
    ///
    /// Returns [`TwinError::InvalidInput`] if a resistance, capacitance, power
    /// or area is non-finite or non-positive, or if the transmittance is
    /// outside `[0, 1]`.
    pub fn new(params: BuildingParams) -> Result<Self, TwinError> {
        positive("building.r_k_per_w", params.r_k_per_w)?;
        positive("building.c_j_per_k", params.c_j_per_k)?;
        positive("building.heater_max_w", params.heater_max_w)?;
        ensure_finite("building.glazing_area_m2", params.glazing_area_m2)?;
        if params.glazing_area_m2 < 0.0 {
            return Err(TwinError::InvalidInput(
                "building.glazing_area_m2 must be >= 0".into(),
            ));
        }
        ensure_finite("building.transmittance", params.transmittance)?;
        if !(0.0..=1.0).contains(&params.transmittance) {
            return Err(TwinError::InvalidInput(
                "building.transmittance must be in [0, 1]".into(),
            ));
        }
        if let Some(env) = params.envelope {
            positive("building.envelope.r_interior_k_per_w", env.r_interior_k_per_w)?;
            positive("building.envelope.r_exterior_k_per_w", env.r_exterior_k_per_w)?;
            positive("building.envelope.c_j_per_k", env.c_j_per_k)?;
        }
        Ok(Self { params })
    }

    /// Model parameters.
    pub fn params(&self) -> &BuildingParams {
        &self.params
    }

    /// Returns `true` when the envelope node is modeled.
    pub fn has_envelope(&self) -> bool {
        self.params.envelope.is_some()
    }

    /// Initial state with every node at `temp_c`.
    pub fn uniform_state(&self, temp_c: f64) -> ThermalState {
        match self.params.envelope {
            Some(_) => ThermalState::with_envelope(temp_c, temp_c),
            None => ThermalState::new(temp_c),
        }
    }

    /// Smallest nodal time constant (s).
    pub fn min_time_constant_s(&self) -> f64 {
        let p = &self.params;
        match p.envelope {
            None => p.r_k_per_w * p.c_j_per_k,
            Some(env) => {
                let air = p.c_j_per_k / (1.0 / p.r_k_per_w + 1.0 / env.r_interior_k_per_w);
                let mass =
                    env.c_j_per_k / (1.0 / env.r_interior_k_per_w + 1.0 / env.r_exterior_k_per_w);
                air.min(mass)
            }
        }
    }

    /// Largest step (s) accepted by [`ThermalModel::step`].
    pub fn max_stable_dt_s(&self) -> f64 {
        MAX_DT_OVER_TAU * self.min_time_constant_s()
    }

    /// Heater power delivered for `command` (W).
    pub fn heater_w(&self, command: ActuatorCommand) -> f64 {
        command.fraction() * self.params.heater_max_w
    }

    /// Solar heat gain entering the interior for `solar_w_m2` irradiance (W).
    pub fn solar_gain_w(&self, solar_w_m2: f64) -> f64 {
        solar_w_m2 * self.params.glazing_area_m2 * self.params.transmittance
    }

    /// Single-node equivalent of this model.
    ///
    /// The envelope path becomes a series resistance in parallel with the
    /// direct loss path, and both capacitances are summed.
    pub fn lumped(&self) -> ThermalModel {
        let p = self.params;
        match p.envelope {
            None => *self,
            Some(env) => {
                let ua = 1.0 / p.r_k_per_w + 1.0 / (env.r_interior_k_per_w + env.r_exterior_k_per_w);
                ThermalModel {
                    params: BuildingParams {
                        r_k_per_w: 1.0 / ua,
                        c_j_per_k: p.c_j_per_k + env.c_j_per_k,
                        envelope: None,
                        ..p
                    },
                }
            }
        }
    }

    /// Advances `state` by one explicit-Euler step of `dt_s` seconds.
    ///
    /// # Errors
    ///
    /// Returns [`TwinError::InvalidInput`] if the state or conditions carry
    /// non-finite values, if the state shape does not match the model, or if
    /// `dt_s` is non-positive or above [`ThermalModel::max_stable_dt_s`].
    pub fn step(
        &self,
        state: &ThermalState,
        external: &ExternalConditions,
        command: ActuatorCommand,
        dt_s: f64,
    ) -> Result<ThermalState, TwinError> {
        ensure_finite("interior_c", state.interior_c)?;
        external.validate()?;
        ensure_finite("dt_s", dt_s)?;
        if dt_s <= 0.0 {
            return Err(TwinError::InvalidInput(format!("dt_s must be > 0, got {dt_s}")));
        }
        let max_dt = self.max_stable_dt_s();
        if dt_s > max_dt {
            return Err(TwinError::InvalidInput(format!(
                "dt_s={dt_s} exceeds the explicit-Euler bound {max_dt:.1} s"
            )));
        }

        let p = &self.params;
        let gains_w = self.solar_gain_w(external.solar_w_m2) + self.heater_w(command);
        let loss_w = (external.exterior_c - state.interior_c) / p.r_k_per_w;

        match (p.envelope, state.envelope_c) {
            (None, None) => Ok(ThermalState::new(
                state.interior_c + (loss_w + gains_w) * dt_s / p.c_j_per_k,
            )),
            (Some(env), Some(mass_c)) => {
                ensure_finite("envelope_c", mass_c)?;
                let air_to_mass_w = (mass_c - state.interior_c) / env.r_interior_k_per_w;
                let mass_loss_w = (external.exterior_c - mass_c) / env.r_exterior_k_per_w;
                let interior =
                    state.interior_c + (loss_w + air_to_mass_w + gains_w) * dt_s / p.c_j_per_k;
                let mass = mass_c + (mass_loss_w - air_to_mass_w) * dt_s / env.c_j_per_k;
                Ok(ThermalState::with_envelope(interior, mass))
            }
            (Some(_), None) => Err(TwinError::InvalidInput(
                "state lacks the envelope temperature required by the model".into(),
            )),
            (None, Some(_)) => Err(TwinError::InvalidInput(
                "state carries an envelope temperature but the model has no envelope".into(),
            )),
        }
    }

    /// Interior temperature after one step of the single-node dynamics.
    ///
    /// Unchecked fast path for the optimizer's inner loop: the caller
    /// guarantees finite inputs, a stable `dt_s`, and a model without envelope.
    pub(crate) fn predict_interior(
        &self,
        interior_c: f64,
        exterior_c: f64,
        solar_gain_w: f64,
        fraction: f64,
        dt_s: f64,
    ) -> f64 {
        let p = &self.params;
        let gains_w = solar_gain_w + fraction * p.heater_max_w;
        let loss_w = (exterior_c - interior_c) / p.r_k_per_w;
        interior_c + (loss_w + gains_w) * dt_s / p.c_j_per_k
    }
}

fn positive(field: &str, value: f64) -> Result<(), TwinError> {
    ensure_finite(field, value)?;
    if value <= 0.0 {
        return Err(TwinError::InvalidInput(format!("{field} must be > 0, got {value}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tariff::TariffTier;

    const DT: f64 = 60.0;

    fn r1c1() -> ThermalModel {
        ThermalModel::new(BuildingParams::r1c1(0.005, 1.0e6, 3000.0)).expect("valid params")
    }

    fn two_node() -> ThermalModel {
        ThermalModel::new(BuildingParams::two_node()).expect("valid params")
    }

    fn outside(exterior_c: f64, solar_w_m2: f64) -> ExternalConditions {
        ExternalConditions {
            exterior_c,
            solar_w_m2,
            tariff: TariffTier::Low,
        }
    }

    #[test]
    fn step_is_deterministic() {
        for model in [r1c1(), two_node()] {
            let state = model.uniform_state(19.3);
            let ext = outside(-2.5, 120.0);
            let cmd = ActuatorCommand::from_fraction(0.37).expect("valid");
            let a = model.step(&state, &ext, cmd, DT).expect("step");
            let b = model.step(&state, &ext, cmd, DT).expect("step");
            assert_eq!(a.interior_c.to_bits(), b.interior_c.to_bits());
            assert_eq!(a.envelope_c.map(f64::to_bits), b.envelope_c.map(f64::to_bits));
        }
    }

    #[test]
    fn equilibrium_without_heating_is_preserved() {
        for model in [r1c1(), two_node()] {
            let mut state = model.uniform_state(18.0);
            let ext = outside(18.0, 0.0);
            for _ in 0..50 {
                state = model
                    .step(&state, &ext, ActuatorCommand::OFF, DT)
                    .expect("step");
            }
            assert_eq!(state, model.uniform_state(18.0));
        }
    }

    #[test]
    fn more_command_never_cools() {
        for model in [r1c1(), two_node()] {
            let state = model.uniform_state(19.0);
            let ext = outside(0.0, 50.0);
            let mut last = f64::NEG_INFINITY;
            for pct in (0..=100).step_by(10) {
                let cmd = ActuatorCommand::from_percent(pct as f64).expect("valid");
                let next = model.step(&state, &ext, cmd, DT).expect("step");
                assert!(next.interior_c >= last, "non-monotone at {pct}%");
                last = next.interior_c;
            }
        }
    }

    #[test]
    fn half_steps_approximate_full_step() {
        for model in [r1c1(), two_node()] {
            let state = model.uniform_state(19.0);
            let ext = outside(-5.0, 300.0);
            let cmd = ActuatorCommand::from_fraction(0.6).expect("valid");
            let dt = 600.0;
            let full = model.step(&state, &ext, cmd, dt).expect("step");
            let half = model.step(&state, &ext, cmd, dt / 2.0).expect("step");
            let two_halves = model.step(&half, &ext, cmd, dt / 2.0).expect("step");
            assert!(
                (full.interior_c - two_halves.interior_c).abs() < 0.1,
                "full={} halves={}",
                full.interior_c,
                two_halves.interior_c
            );
        }
    }

    #[test]
    fn rejects_malformed_inputs() {
        let model = r1c1();
        let state = model.uniform_state(19.0);
        assert!(model.step(&state, &outside(f64::NAN, 0.0), ActuatorCommand::OFF, DT).is_err());
        assert!(model.step(&state, &outside(0.0, -3.0), ActuatorCommand::OFF, DT).is_err());
        assert!(
            model
                .step(&ThermalState::new(f64::NAN), &outside(0.0, 0.0), ActuatorCommand::OFF, DT)
                .is_err()
        );
        assert!(model.step(&state, &outside(0.0, 0.0), ActuatorCommand::OFF, 0.0).is_err());
    }

    #[test]
    fn rejects_unstable_step() {
        let model = r1c1();
        let state = model.uniform_state(19.0);
        let too_long = model.max_stable_dt_s() * 1.01;
        let err = model
            .step(&state, &outside(0.0, 0.0), ActuatorCommand::OFF, too_long)
            .unwrap_err();
        assert!(err.to_string().contains("explicit-Euler"));
    }

    #[test]
    fn rejects_state_shape_mismatch() {
        let ext = outside(0.0, 0.0);
        assert!(two_node().step(&ThermalState::new(19.0), &ext, ActuatorCommand::OFF, DT).is_err());
        assert!(
            r1c1()
                .step(&ThermalState::with_envelope(19.0, 19.0), &ext, ActuatorCommand::OFF, DT)
                .is_err()
        );
    }

    #[test]
    fn rejects_bad_parameters() {
        assert!(ThermalModel::new(BuildingParams::r1c1(0.0, 1.0e6, 1000.0)).is_err());
        assert!(ThermalModel::new(BuildingParams::r1c1(0.01, f64::NAN, 1000.0)).is_err());
        let mut p = BuildingParams::two_node();
        p.transmittance = 1.5;
        assert!(ThermalModel::new(p).is_err());
    }

    #[test]
    fn solar_gain_uses_glazing_and_transmittance() {
        let model = two_node();
        assert!((model.solar_gain_w(500.0) - 500.0 * 4.0 * 0.7).abs() < 1e-9);
    }

    #[test]
    fn lumped_model_keeps_total_conductance_and_mass() {
        let model = two_node();
        let lumped = model.lumped();
        assert!(!lumped.has_envelope());
        let p = lumped.params();
        assert!((1.0 / p.r_k_per_w - (50.0 + 100.0)).abs() < 1e-6);
        assert!((p.c_j_per_k - 2.2e7).abs() < 1e-3);
    }

    #[test]
    fn predict_interior_matches_checked_step() {
        let model = r1c1();
        let ext = outside(3.0, 200.0);
        let cmd = ActuatorCommand::from_fraction(0.25).expect("valid");
        let checked = model
            .step(&ThermalState::new(20.0), &ext, cmd, DT)
            .expect("step")
            .interior_c;
        let fast = model.predict_interior(20.0, 3.0, model.solar_gain_w(200.0), 0.25, DT);
        assert_eq!(checked.to_bits(), fast.to_bits());
    }
}

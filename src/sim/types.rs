//! Core simulation types: thermal state, external conditions, commands, and tick records.

use std::fmt;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::error::{TwinError, ensure_finite};
use crate::tariff::TariffTier;

/// Text format used on the time-sync channel (ISO-8601, lexically sortable).
pub const TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Formats a virtual timestamp for the time-sync channel.
///
/// # Examples
///
/// ```
/// use chrono::NaiveDate;
/// use thermal_twin::sim::types::format_time;
///
/// let t = NaiveDate::from_ymd_opt(2026, 2, 1)
///     .and_then(|d| d.and_hms_opt(6, 15, 0))
///     .unwrap();
/// assert_eq!(format_time(t), "2026-02-01T06:15:00");
/// ```
pub fn format_time(time: NaiveDateTime) -> String {
    time.format(TIME_FORMAT).to_string()
}

/// Thermal state of the dwelling.
///
/// Mutated only by the engine, once per tick, through the thermal model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ThermalState {
    /// Interior air temperature (°C).
    pub interior_c: f64,
    /// Envelope / thermal-mass temperature (°C) when a second node is modeled.
    pub envelope_c: Option<f64>,
}

impl ThermalState {
    /// Single-node state at `interior_c`.
    pub fn new(interior_c: f64) -> Self {
        Self {
            interior_c,
            envelope_c: None,
        }
    }

    /// Two-node state with interior and envelope temperatures.
    pub fn with_envelope(interior_c: f64, envelope_c: f64) -> Self {
        Self {
            interior_c,
            envelope_c: Some(envelope_c),
        }
    }
}

/// Weather and tariff at one virtual timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ExternalConditions {
    /// Exterior air temperature (°C).
    pub exterior_c: f64,
    /// Global solar irradiance on the glazing (W/m², >= 0).
    pub solar_w_m2: f64,
    /// Active tariff tier.
    pub tariff: TariffTier,
}

impl ExternalConditions {
    /// Validates the physical fields.
    ///
    /// # Errors
    ///
    /// Returns [`TwinError::InvalidInput`] for non-finite values or negative irradiance.
    pub fn validate(&self) -> Result<(), TwinError> {
        ensure_finite("exterior_c", self.exterior_c)?;
        ensure_finite("solar_w_m2", self.solar_w_m2)?;
        if self.solar_w_m2 < 0.0 {
            return Err(TwinError::InvalidInput(format!(
                "solar_w_m2 must be >= 0, got {}",
                self.solar_w_m2
            )));
        }
        Ok(())
    }
}

/// Heater/valve opening, stored as a fraction in `[0, 1]`.
///
/// Construction validates the range, so a value of this type never carries
/// NaN or an out-of-range opening into the thermal model.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default)]
pub struct ActuatorCommand(f64);

impl ActuatorCommand {
    /// Valve closed.
    pub const OFF: Self = Self(0.0);
    /// Valve fully open.
    pub const FULL: Self = Self(1.0);

    /// Builds a command from a fraction in `[0, 1]`.
    ///
    /// # Errors
    ///
    /// Returns [`TwinError::InvalidInput`] for NaN or values outside `[0, 1]`.
    pub fn from_fraction(fraction: f64) -> Result<Self, TwinError> {
        if fraction.is_finite() && (0.0..=1.0).contains(&fraction) {
            Ok(Self(fraction))
        } else {
            Err(TwinError::InvalidInput(format!(
                "command fraction must be in [0, 1], got {fraction}"
            )))
        }
    }

    /// Builds a command from a percentage in `[0, 100]`.
    ///
    /// # Errors
    ///
    /// Returns [`TwinError::InvalidInput`] for NaN or values outside `[0, 100]`.
    pub fn from_percent(percent: f64) -> Result<Self, TwinError> {
        if percent.is_finite() && (0.0..=100.0).contains(&percent) {
            Ok(Self(percent / 100.0))
        } else {
            Err(TwinError::InvalidInput(format!(
                "command percent must be in [0, 100], got {percent}"
            )))
        }
    }

    /// Opening as a fraction in `[0, 1]`.
    pub fn fraction(self) -> f64 {
        self.0
    }

    /// Opening as a percentage in `[0, 100]`.
    pub fn percent(self) -> f64 {
        self.0 * 100.0
    }
}

/// Command arriving on the command channel, addressed to a zone's actuator.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ZoneCommand {
    /// Zone identifier.
    pub zone: String,
    /// Valve opening percentage (0-100).
    #[serde(alias = "valve_position")]
    pub percent: f64,
    /// Virtual time the command is meant for; `None` means the next tick.
    #[serde(default, alias = "sim_time")]
    pub target: Option<NaiveDateTime>,
}

/// Where the command applied at a tick came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandSource {
    /// Finite-horizon predictive controller.
    Predictive,
    /// Hysteresis baseline controller.
    Baseline,
    /// Command channel override.
    External,
}

impl fmt::Display for CommandSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CommandSource::Predictive => "predictive",
            CommandSource::Baseline => "baseline",
            CommandSource::External => "external",
        };
        f.write_str(name)
    }
}

/// Observable event attached to a tick record.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TickEvent {
    /// Predictive solve failed and the fallback command was applied.
    SolverFallback {
        /// Solver failure description.
        reason: String,
    },
    /// Thermal model rejected its inputs; state was held.
    InvalidInput {
        /// Validation failure description.
        reason: String,
    },
    /// Scenario was queried past its end and the last sample was held.
    ScenarioClamped,
    /// External command discarded because its tick had passed.
    StaleCommand {
        /// Zone the command was addressed to.
        zone: String,
        /// Virtual time the command was meant for.
        target: NaiveDateTime,
    },
}

impl TickEvent {
    /// Short snake-case name of the event.
    pub fn kind(&self) -> &'static str {
        match self {
            TickEvent::SolverFallback { .. } => "solver_fallback",
            TickEvent::InvalidInput { .. } => "invalid_input",
            TickEvent::ScenarioClamped => "scenario_clamped",
            TickEvent::StaleCommand { .. } => "stale_command",
        }
    }

    /// Returns `true` for events that put the tick in degraded mode.
    pub fn is_degraded(&self) -> bool {
        matches!(
            self,
            TickEvent::SolverFallback { .. }
                | TickEvent::InvalidInput { .. }
                | TickEvent::ScenarioClamped
        )
    }
}

/// Complete record of one simulation tick, as published to observers.
#[derive(Debug, Clone, Serialize)]
pub struct TickRecord {
    /// Tick index, starting at 0.
    pub tick: u64,
    /// Virtual time at which the tick was computed.
    pub time: NaiveDateTime,
    /// Virtual time the new thermal state belongs to (`time + Δt`).
    pub state_at: NaiveDateTime,
    /// Zone identifier.
    pub zone: String,
    /// Interior temperature after the step (°C).
    pub interior_c: f64,
    /// Envelope temperature after the step (°C), if modeled.
    pub envelope_c: Option<f64>,
    /// Interior temperature as a sensor would report it (°C).
    pub measured_c: f64,
    /// Exterior temperature used for the step (°C).
    pub exterior_c: f64,
    /// Solar irradiance used for the step (W/m²).
    pub solar_w_m2: f64,
    /// Solar heat gain entering the interior (W).
    pub solar_gain_w: f64,
    /// Tariff tier active during the step.
    pub tariff: TariffTier,
    /// Price of the active tier (per kWh).
    pub price_per_kwh: f64,
    /// Applied command (percent).
    pub command_pct: f64,
    /// Heater power delivered (W).
    pub heater_w: f64,
    /// Energy consumed during the step (kWh).
    pub energy_kwh: f64,
    /// Cost of the step.
    pub cost: f64,
    /// Cost accumulated since the run started.
    pub cumulative_cost: f64,
    /// Origin of the applied command.
    pub source: CommandSource,
    /// Events raised during the tick.
    pub events: Vec<TickEvent>,
}

impl TickRecord {
    /// Returns `true` when the tick ran in degraded mode.
    pub fn degraded(&self) -> bool {
        self.events.iter().any(TickEvent::is_degraded)
    }
}

impl fmt::Display for TickRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "t={:>4} {} | T_int={:>6.2} °C  T_ext={:>6.2} °C  sun={:>5.0} W/m² | \
             {}={:>5.1}%  heat={:>6.0} W | {} @ {:.3}  cost={:.4} (Σ {:.2})",
            self.tick,
            format_time(self.time),
            self.interior_c,
            self.exterior_c,
            self.solar_w_m2,
            self.source,
            self.command_pct,
            self.heater_w,
            self.tariff,
            self.price_per_kwh,
            self.cost,
            self.cumulative_cost,
        )?;
        if self.degraded() {
            write!(f, " [degraded]")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;

    fn at(hour: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 2, 1)
            .and_then(|d| d.and_hms_opt(hour, 0, 0))
            .expect("valid timestamp")
    }

    #[test]
    fn command_rejects_out_of_range() {
        assert!(ActuatorCommand::from_fraction(1.2).is_err());
        assert!(ActuatorCommand::from_fraction(-0.1).is_err());
        assert!(ActuatorCommand::from_fraction(f64::NAN).is_err());
        assert!(ActuatorCommand::from_percent(100.5).is_err());
        assert!(ActuatorCommand::from_percent(f64::INFINITY).is_err());
    }

    #[test]
    fn command_percent_and_fraction_agree() {
        let cmd = ActuatorCommand::from_percent(40.0).expect("40% is valid");
        assert!((cmd.fraction() - 0.4).abs() < 1e-12);
        assert!((cmd.percent() - 40.0).abs() < 1e-9);
        assert_eq!(ActuatorCommand::FULL.percent(), 100.0);
    }

    #[test]
    fn conditions_reject_nan_and_negative_sun() {
        let mut c = ExternalConditions {
            exterior_c: 5.0,
            solar_w_m2: 100.0,
            tariff: TariffTier::Low,
        };
        assert!(c.validate().is_ok());
        c.solar_w_m2 = -1.0;
        assert!(c.validate().is_err());
        c.solar_w_m2 = 0.0;
        c.exterior_c = f64::NAN;
        assert!(c.validate().is_err());
    }

    #[test]
    fn zone_command_accepts_channel_field_names() {
        let cmd: ZoneCommand = serde_json::from_str(
            r#"{"zone":"living_room","valve_position":35,"sim_time":"2026-02-01T03:00:00"}"#,
        )
        .expect("channel payload should parse");
        assert_eq!(cmd.zone, "living_room");
        assert_eq!(cmd.percent, 35.0);
        assert_eq!(cmd.target, Some(at(3)));
    }

    #[test]
    fn degraded_only_for_degrading_events() {
        let mut record = TickRecord {
            tick: 0,
            time: at(0),
            state_at: at(1),
            zone: "z".into(),
            interior_c: 20.0,
            envelope_c: None,
            measured_c: 20.0,
            exterior_c: 5.0,
            solar_w_m2: 0.0,
            solar_gain_w: 0.0,
            tariff: TariffTier::Low,
            price_per_kwh: 0.13,
            command_pct: 0.0,
            heater_w: 0.0,
            energy_kwh: 0.0,
            cost: 0.0,
            cumulative_cost: 0.0,
            source: CommandSource::Baseline,
            events: vec![TickEvent::StaleCommand {
                zone: "z".into(),
                target: at(0),
            }],
        };
        assert!(!record.degraded());
        record.events.push(TickEvent::ScenarioClamped);
        assert!(record.degraded());
        assert!(format!("{record}").contains("[degraded]"));
    }
}

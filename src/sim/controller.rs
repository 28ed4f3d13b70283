//! Controller interface and the hysteresis baseline.

use chrono::NaiveDateTime;

use crate::error::{TwinError, ensure_finite};

use super::predictive::PredictiveController;
use super::types::{ActuatorCommand, CommandSource, ExternalConditions, ThermalState};

/// Read-only snapshot handed to a controller once per tick.
#[derive(Debug, Clone)]
pub struct ControlInput {
    /// Virtual time of the tick.
    pub time: NaiveDateTime,
    /// Thermal state at `time`.
    pub state: ThermalState,
    /// Conditions at `time`.
    pub current: ExternalConditions,
    /// Conditions at `time, time + Δt, …`; `forecast[0]` equals `current`.
    pub forecast: Vec<ExternalConditions>,
    /// Command applied during the previous tick.
    pub previous: ActuatorCommand,
    /// Tick length (s).
    pub dt_s: f64,
}

/// A controller's answer for one tick.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    /// Command to apply.
    pub command: ActuatorCommand,
    /// Policy that produced the command.
    pub source: CommandSource,
    /// Reason, when the command is a fallback.
    pub fallback: Option<String>,
}

/// Interface shared by every controller so the engine can swap them freely.
pub trait Controller: Send {
    /// Controller name for logs.
    fn name(&self) -> &'static str;

    /// Number of forecast steps the controller wants.
    fn horizon(&self) -> usize;

    /// Chooses the command for the tick described by `input`.
    ///
    /// Never fails: a controller that cannot compute its preferred command
    /// returns a fallback and says so in [`Decision::fallback`].
    fn decide(&mut self, input: &ControlInput) -> Decision;
}

/// Two-threshold hysteresis policy.
///
/// Full command strictly below `low_c`, zero strictly above `high_c`, and the
/// previous command inside the band. Holds no state of its own.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BaselineController {
    low_c: f64,
    high_c: f64,
}

impl BaselineController {
    /// Creates a baseline with explicit thresholds.
    ///
    /// # Errors
    ///
    /// Returns [`TwinError::InvalidInput`] unless both thresholds are finite
    /// and `low_c < high_c`.
    pub fn new(low_c: f64, high_c: f64) -> Result<Self, TwinError> {
        ensure_finite("baseline.low_c", low_c)?;
        ensure_finite("baseline.high_c", high_c)?;
        if low_c >= high_c {
            return Err(TwinError::InvalidInput(format!(
                "baseline low threshold {low_c} must be below high threshold {high_c}"
            )));
        }
        Ok(Self { low_c, high_c })
    }

    /// Thresholds `target ± delta`.
    ///
    /// # Errors
    ///
    /// See [`BaselineController::new`].
    pub fn around(target_c: f64, delta_c: f64) -> Result<Self, TwinError> {
        Self::new(target_c - delta_c, target_c + delta_c)
    }

    /// Lower threshold (°C).
    pub fn low_c(&self) -> f64 {
        self.low_c
    }

    /// Upper threshold (°C).
    pub fn high_c(&self) -> f64 {
        self.high_c
    }

    /// Command for `interior_c` given the previously applied command.
    pub fn command_for(&self, interior_c: f64, previous: ActuatorCommand) -> ActuatorCommand {
        if interior_c < self.low_c {
            ActuatorCommand::FULL
        } else if interior_c > self.high_c {
            ActuatorCommand::OFF
        } else {
            previous
        }
    }
}

impl Controller for BaselineController {
    fn name(&self) -> &'static str {
        "baseline"
    }

    fn horizon(&self) -> usize {
        1
    }

    fn decide(&mut self, input: &ControlInput) -> Decision {
        Decision {
            command: self.command_for(input.state.interior_c, input.previous),
            source: CommandSource::Baseline,
            fallback: None,
        }
    }
}

/// Controller selected at run time.
#[derive(Debug)]
pub enum AnyController {
    /// Finite-horizon predictive controller.
    Predictive(Box<PredictiveController>),
    /// Hysteresis baseline.
    Baseline(BaselineController),
}

impl Controller for AnyController {
    fn name(&self) -> &'static str {
        match self {
            AnyController::Predictive(c) => c.name(),
            AnyController::Baseline(c) => c.name(),
        }
    }

    fn horizon(&self) -> usize {
        match self {
            AnyController::Predictive(c) => c.horizon(),
            AnyController::Baseline(c) => c.horizon(),
        }
    }

    fn decide(&mut self, input: &ControlInput) -> Decision {
        match self {
            AnyController::Predictive(c) => c.decide(input),
            AnyController::Baseline(c) => c.decide(input),
        }
    }
}

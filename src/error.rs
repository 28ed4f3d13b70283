//! Error taxonomy shared by the twin, the clock, and the controllers.

use chrono::NaiveDateTime;
use thiserror::Error;

use crate::config::ConfigError;
use crate::sim::clock::ClockState;
use crate::sim::optimizer::SolveError;

/// Errors raised while building or running a thermal twin.
///
/// Only [`TwinError::Timeline`] and [`TwinError::Worker`] are fatal for a
/// running simulation; the engine recovers every other per-tick error locally
/// and reports it as a tick event.
#[derive(Debug, Error)]
pub enum TwinError {
    /// Malformed physical input (NaN, out-of-range command, unstable step).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Scenario queried outside `[start, end)`.
    #[error("virtual time {requested} is outside the scenario range [{start}, {end})")]
    OutOfRange {
        /// Requested virtual time.
        requested: NaiveDateTime,
        /// First valid timestamp.
        start: NaiveDateTime,
        /// First invalid timestamp after the scenario.
        end: NaiveDateTime,
    },

    /// Predictive solve failed or ran over its time budget.
    #[error("solver did not converge: {0}")]
    SolverNonConvergence(#[from] SolveError),

    /// External command addressed to a tick the clock has already passed.
    #[error("stale command for zone `{zone}`: targeted {target}, clock already at {now}")]
    StaleCommand {
        /// Zone the command was addressed to.
        zone: String,
        /// Virtual time the command was meant for.
        target: NaiveDateTime,
        /// Virtual time of the tick being computed.
        now: NaiveDateTime,
    },

    /// Virtual time went backward or a tick was duplicated.
    #[error("timeline violation: {0}")]
    Timeline(String),

    /// The controller worker panicked or was cancelled.
    #[error("controller worker failed: {0}")]
    Worker(String),

    /// Clock state machine transition that is not allowed.
    #[error("clock cannot {action} while {from:?}")]
    InvalidTransition {
        /// State the clock was in.
        from: ClockState,
        /// Requested transition.
        action: &'static str,
    },

    /// Invalid configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Scenario or telemetry file I/O.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Scenario or telemetry CSV error.
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
}

impl TwinError {
    /// Returns `true` for errors that must stop the run.
    pub fn is_fatal(&self) -> bool {
        matches!(self, TwinError::Timeline(_) | TwinError::Worker(_))
    }
}

/// Rejects non-finite values with an [`TwinError::InvalidInput`] naming the field.
pub(crate) fn ensure_finite(field: &str, value: f64) -> Result<f64, TwinError> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(TwinError::InvalidInput(format!(
            "{field} must be finite, got {value}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_timeline_and_worker_are_fatal() {
        assert!(TwinError::Timeline("duplicate tick".into()).is_fatal());
        assert!(TwinError::Worker("panicked".into()).is_fatal());
        assert!(!TwinError::InvalidInput("nan".into()).is_fatal());
        assert!(!TwinError::SolverNonConvergence(SolveError::EmptyHorizon).is_fatal());
    }

    #[test]
    fn ensure_finite_names_field() {
        let err = ensure_finite("exterior_c", f64::NAN).unwrap_err();
        assert!(err.to_string().contains("exterior_c"));
        assert_eq!(ensure_finite("x", 1.5).ok(), Some(1.5));
    }
}

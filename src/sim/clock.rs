//! Virtual clock: the single time authority of a run.

use std::time::Duration;

use chrono::{NaiveDateTime, TimeDelta};

use crate::error::TwinError;

/// Lifecycle of a [`VirtualClock`].
///
/// `Initialized → Running → (Paused ⇄ Running) → Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockState {
    /// Created, not started yet.
    Initialized,
    /// Ticking.
    Running,
    /// Suspended; time does not advance.
    Paused,
    /// Terminal state.
    Stopped,
}

/// A virtual clock advancing by a fixed step over `[start, end)`.
///
/// Virtual time is an explicit value owned by the clock and handed to every
/// collaborator that needs it.
///
/// # Examples
///
/// ```
/// use chrono::{NaiveDate, TimeDelta};
/// use thermal_twin::sim::clock::{ClockState, VirtualClock};
///
/// let start = NaiveDate::from_ymd_opt(2026, 1, 1)
///     .and_then(|d| d.and_hms_opt(0, 0, 0))
///     .unwrap();
/// let mut clock = VirtualClock::new(start, start + TimeDelta::minutes(30), TimeDelta::minutes(15)).unwrap();
/// clock.start().unwrap();
/// clock.advance().unwrap();
/// clock.advance().unwrap();
/// assert_eq!(clock.ticks(), 2);
/// assert_eq!(clock.state(), ClockState::Stopped);
/// ```
#[derive(Debug, Clone)]
pub struct VirtualClock {
    start: NaiveDateTime,
    end: NaiveDateTime,
    step: TimeDelta,
    now: NaiveDateTime,
    ticks: u64,
    state: ClockState,
}

impl VirtualClock {
    /// Creates a clock positioned at `start`.
    ///
    /// # Arguments
    ///
    /// * `start` - First tick's virtual time
    /// * `end` - First virtual time that is not simulated
    /// * `step` - Virtual time advanced per tick
    ///
    /// # Errors
    ///
    /// Returns [`TwinError::InvalidInput`] if `step` is shorter than one
    /// millisecond or `end` is not after `start`.
    pub fn new(start: NaiveDateTime, end: NaiveDateTime, step: TimeDelta) -> Result<Self, TwinError> {
        if step < TimeDelta::milliseconds(1) {
            return Err(TwinError::InvalidInput(format!(
                "clock step must be at least 1 ms, got {step}"
            )));
        }
        if end <= start {
            return Err(TwinError::InvalidInput(format!(
                "clock end {end} must be after start {start}"
            )));
        }
        Ok(Self {
            start,
            end,
            step,
            now: start,
            ticks: 0,
            state: ClockState::Initialized,
        })
    }

    /// Current virtual time.
    pub fn now(&self) -> NaiveDateTime {
        self.now
    }

    /// Virtual time of the first tick.
    pub fn start_time(&self) -> NaiveDateTime {
        self.start
    }

    /// End of the run (exclusive).
    pub fn end(&self) -> NaiveDateTime {
        self.end
    }

    /// Step size.
    pub fn step(&self) -> TimeDelta {
        self.step
    }

    /// Step size in seconds.
    pub fn step_seconds(&self) -> f64 {
        self.step.num_milliseconds() as f64 / 1000.0
    }

    /// Ticks completed so far.
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Number of ticks between start and end.
    pub fn total_ticks(&self) -> u64 {
        let span = (self.end - self.start).num_milliseconds();
        let step = self.step.num_milliseconds();
        ((span + step - 1) / step) as u64
    }

    /// Lifecycle state.
    pub fn state(&self) -> ClockState {
        self.state
    }

    /// `Initialized → Running`.
    ///
    /// # Errors
    ///
    /// Returns [`TwinError::InvalidTransition`] from any other state.
    pub fn start(&mut self) -> Result<(), TwinError> {
        self.transition(ClockState::Initialized, ClockState::Running, "start")
    }

    /// `Running → Paused`.
    ///
    /// # Errors
    ///
    /// Returns [`TwinError::InvalidTransition`] unless running.
    pub fn pause(&mut self) -> Result<(), TwinError> {
        self.transition(ClockState::Running, ClockState::Paused, "pause")
    }

    /// `Paused → Running`.
    ///
    /// # Errors
    ///
    /// Returns [`TwinError::InvalidTransition`] unless paused.
    pub fn resume(&mut self) -> Result<(), TwinError> {
        self.transition(ClockState::Paused, ClockState::Running, "resume")
    }

    /// Moves to `Stopped` from any state. Idempotent.
    pub fn stop(&mut self) {
        self.state = ClockState::Stopped;
    }

    /// Advances virtual time by exactly one step.
    ///
    /// Reaching `end` moves the clock to `Stopped`.
    ///
    /// # Errors
    ///
    /// Returns [`TwinError::InvalidTransition`] unless running, and the fatal
    /// [`TwinError::Timeline`] if the addition overflows or does not move time
    /// forward.
    pub fn advance(&mut self) -> Result<NaiveDateTime, TwinError> {
        if self.state != ClockState::Running {
            return Err(TwinError::InvalidTransition {
                from: self.state,
                action: "advance",
            });
        }
        let next = self
            .now
            .checked_add_signed(self.step)
            .ok_or_else(|| TwinError::Timeline(format!("virtual time overflow after {}", self.now)))?;
        if next <= self.now {
            return Err(TwinError::Timeline(format!(
                "virtual time would move from {} to {next}",
                self.now
            )));
        }
        self.now = next;
        self.ticks += 1;
        if self.now >= self.end {
            self.state = ClockState::Stopped;
        }
        Ok(self.now)
    }

    fn transition(
        &mut self,
        from: ClockState,
        to: ClockState,
        action: &'static str,
    ) -> Result<(), TwinError> {
        if self.state != from {
            return Err(TwinError::InvalidTransition {
                from: self.state,
                action,
            });
        }
        self.state = to;
        Ok(())
    }
}

/// How ticks are paced against wall-clock time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pacing {
    /// As fast as computation allows.
    Batch,
    /// One tick every `tick_interval` of wall-clock time.
    Accelerated {
        /// Wall-clock time between ticks.
        tick_interval: Duration,
    },
}

impl Pacing {
    /// Pacing for a scenario speed factor (virtual seconds per wall-clock second).
    ///
    /// A factor of zero means batch mode.
    ///
    /// # Errors
    ///
    /// Returns [`TwinError::InvalidInput`] for a negative or non-finite
    /// factor, or one so small or so large that the tick interval is not a
    /// representable, non-zero [`Duration`].
    pub fn from_speed_factor(step: TimeDelta, speed_factor: f64) -> Result<Self, TwinError> {
        if !speed_factor.is_finite() || speed_factor < 0.0 {
            return Err(TwinError::InvalidInput(format!(
                "speed factor must be finite and >= 0, got {speed_factor}"
            )));
        }
        if speed_factor == 0.0 {
            return Ok(Pacing::Batch);
        }
        let step_s = step.num_milliseconds() as f64 / 1000.0;
        let tick_interval = Duration::try_from_secs_f64(step_s / speed_factor).map_err(|e| {
            TwinError::InvalidInput(format!("speed factor {speed_factor} is out of range: {e}"))
        })?;
        if tick_interval.is_zero() {
            return Err(TwinError::InvalidInput(format!(
                "speed factor {speed_factor} makes the tick interval zero"
            )));
        }
        Ok(Pacing::Accelerated { tick_interval })
    }
}

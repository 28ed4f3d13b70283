//! Time-indexed weather and tariff scenarios.
//!
//! A [`Scenario`] is loaded once and never mutated. Between samples the
//! exterior temperature and solar irradiance are linearly interpolated, while
//! the tariff tier is a step function (tier of the sample at or before `t`).
//! The last sample is held for one sample step, so the valid range is
//! `[first_sample, last_sample + sample_step)`.

use std::f64::consts::PI;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use chrono::{NaiveDate, NaiveDateTime, TimeDelta, Timelike};
use serde::Deserialize;

use crate::error::{TwinError, ensure_finite};
use crate::sim::types::ExternalConditions;
use crate::tariff::TariffTier;

/// Peak irradiance of a clear-sky day profile at solar noon (W/m²).
const CLEAR_SKY_PEAK_W_M2: f64 = 800.0;

/// One time-indexed row of external conditions.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct ScenarioSample {
    /// Sample timestamp.
    #[serde(alias = "timestamp")]
    pub time: NaiveDateTime,
    /// Exterior air temperature (°C).
    pub exterior_c: f64,
    /// Solar irradiance on the glazing (W/m²).
    pub solar_w_m2: f64,
    /// Active tariff tier from this sample on.
    pub tariff: TariffTier,
}

/// What the engine does when virtual time leaves the scenario range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutOfRangePolicy {
    /// Stop the clock.
    #[default]
    Terminate,
    /// Hold the last sample and flag each tick as degraded.
    Clamp,
}

/// Weather and tariff description of one day.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DayProfile {
    /// Calendar day.
    pub date: NaiveDate,
    /// Minimum exterior temperature, reached at 04:00 (°C).
    pub t_min_c: f64,
    /// Maximum exterior temperature, reached at 16:00 (°C).
    pub t_max_c: f64,
    /// Cloud cover in `[0, 1]`; scales the clear-sky irradiance by `1 - cloud_cover`.
    #[serde(default)]
    pub cloud_cover: f64,
    /// Tariff tier during the peak window.
    pub tier: TariffTier,
    /// Tariff tier outside the peak window; defaults to `tier`.
    #[serde(default)]
    pub off_peak_tier: Option<TariffTier>,
}

impl DayProfile {
    /// Exterior temperature at `hour` (fractional, 0-24).
    pub fn exterior_c(&self, hour: f64) -> f64 {
        let avg = (self.t_max_c + self.t_min_c) / 2.0;
        let amp = (self.t_max_c - self.t_min_c) / 2.0;
        avg - amp * (PI * (hour - 4.0) / 12.0).cos()
    }

    /// Solar irradiance at `hour` (fractional, 0-24); zero outside 06:00-18:00.
    pub fn solar_w_m2(&self, hour: f64) -> f64 {
        if !(6.0..=18.0).contains(&hour) {
            return 0.0;
        }
        let clear = CLEAR_SKY_PEAK_W_M2 * (PI * (hour - 6.0) / 12.0).sin();
        (clear * (1.0 - self.cloud_cover)).max(0.0)
    }

    /// Tariff tier at `hour`, given the peak window `[peak_start, peak_end)`.
    pub fn tier_at(&self, hour: f64, peak_start: u32, peak_end: u32) -> TariffTier {
        let peak = hour >= f64::from(peak_start) && hour < f64::from(peak_end);
        if peak {
            self.tier
        } else {
            self.off_peak_tier.unwrap_or(self.tier)
        }
    }
}

/// Run metadata carried by a scenario.
#[derive(Debug, Clone, PartialEq)]
pub struct ScenarioMeta {
    /// Scenario name, used in logs.
    pub name: String,
    /// Spacing of the samples; the last sample is valid for this long.
    pub sample_step: TimeDelta,
    /// Acceleration factor (virtual seconds per wall-clock second); 0 = batch.
    pub speed_factor: f64,
}

/// Immutable, time-indexed sequence of external conditions.
#[derive(Debug, Clone)]
pub struct Scenario {
    meta: ScenarioMeta,
    samples: Vec<ScenarioSample>,
}

impl Scenario {
    /// Builds a scenario from samples sorted by time.
    ///
    /// # Errors
    ///
    /// Returns [`TwinError::InvalidInput`] if there are no samples, if
    /// timestamps are not strictly increasing, if a value is non-finite or an
    /// irradiance is negative, or if the sample step is not positive.
    pub fn new(meta: ScenarioMeta, samples: Vec<ScenarioSample>) -> Result<Self, TwinError> {
        if samples.is_empty() {
            return Err(TwinError::InvalidInput(format!(
                "scenario `{}` has no samples",
                meta.name
            )));
        }
        if meta.sample_step <= TimeDelta::zero() {
            return Err(TwinError::InvalidInput(format!(
                "scenario `{}` sample step must be positive",
                meta.name
            )));
        }
        for pair in samples.windows(2) {
            if pair[1].time <= pair[0].time {
                return Err(TwinError::InvalidInput(format!(
                    "scenario `{}` timestamps must strictly increase ({} then {})",
                    meta.name, pair[0].time, pair[1].time
                )));
            }
        }
        for s in &samples {
            ensure_finite("scenario.exterior_c", s.exterior_c)?;
            ensure_finite("scenario.solar_w_m2", s.solar_w_m2)?;
            if s.solar_w_m2 < 0.0 {
                return Err(TwinError::InvalidInput(format!(
                    "scenario irradiance at {} is negative",
                    s.time
                )));
            }
        }
        Ok(Self { meta, samples })
    }

    /// Reads a `timestamp,exterior_c,solar_w_m2,tariff` CSV table.
    ///
    /// The sample step is the smallest gap between consecutive rows (one hour
    /// for a single-row table).
    ///
    /// # Errors
    ///
    /// Returns [`TwinError::Csv`] for malformed rows, and the errors of
    /// [`Scenario::new`].
    pub fn from_csv_reader(name: &str, reader: impl Read, speed_factor: f64) -> Result<Self, TwinError> {
        let mut rdr = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
        let samples = rdr
            .deserialize::<ScenarioSample>()
            .collect::<Result<Vec<_>, _>>()?;
        let sample_step = samples
            .windows(2)
            .map(|pair| pair[1].time - pair[0].time)
            .min()
            .unwrap_or_else(|| TimeDelta::hours(1));
        Self::new(
            ScenarioMeta {
                name: name.to_string(),
                sample_step,
                speed_factor,
            },
            samples,
        )
    }

    /// Reads a CSV scenario file; see [`Scenario::from_csv_reader`].
    ///
    /// # Errors
    ///
    /// Returns [`TwinError::Io`] if the file cannot be opened.
    pub fn from_csv_path(path: &Path, speed_factor: f64) -> Result<Self, TwinError> {
        let file = File::open(path)?;
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "scenario".to_string());
        Self::from_csv_reader(&name, file, speed_factor)
    }

    /// Samples a sequence of consecutive day profiles every `sample_step`.
    ///
    /// # Errors
    ///
    /// Returns [`TwinError::InvalidInput`] if the days are not consecutive, a
    /// cloud cover is outside `[0, 1]`, `t_min_c > t_max_c`, or the peak window
    /// is empty or past 24 h.
    pub fn from_day_profiles(
        meta: ScenarioMeta,
        days: &[DayProfile],
        peak_window: (u32, u32),
    ) -> Result<Self, TwinError> {
        let (peak_start, peak_end) = peak_window;
        if peak_start >= peak_end || peak_end > 24 {
            return Err(TwinError::InvalidInput(format!(
                "peak window [{peak_start}, {peak_end}) is not within a day"
            )));
        }
        for pair in days.windows(2) {
            if pair[0].date.succ_opt() != Some(pair[1].date) {
                return Err(TwinError::InvalidInput(format!(
                    "day profiles must be consecutive ({} then {})",
                    pair[0].date, pair[1].date
                )));
            }
        }
        if meta.sample_step <= TimeDelta::zero() {
            return Err(TwinError::InvalidInput("sample step must be positive".into()));
        }

        let mut samples = Vec::new();
        for day in days {
            if !(0.0..=1.0).contains(&day.cloud_cover) {
                return Err(TwinError::InvalidInput(format!(
                    "cloud_cover on {} must be in [0, 1]",
                    day.date
                )));
            }
            if day.t_min_c > day.t_max_c {
                return Err(TwinError::InvalidInput(format!(
                    "t_min_c above t_max_c on {}",
                    day.date
                )));
            }
            let midnight = day.date.and_time(chrono::NaiveTime::MIN);
            let next_midnight = midnight + TimeDelta::days(1);
            let mut time = midnight;
            while time < next_midnight {
                let hour = fractional_hour(time);
                samples.push(ScenarioSample {
                    time,
                    exterior_c: day.exterior_c(hour),
                    solar_w_m2: day.solar_w_m2(hour),
                    tariff: day.tier_at(hour, peak_start, peak_end),
                });
                time += meta.sample_step;
            }
        }
        Self::new(meta, samples)
    }

    /// Run metadata.
    pub fn meta(&self) -> &ScenarioMeta {
        &self.meta
    }

    /// Samples in time order.
    pub fn samples(&self) -> &[ScenarioSample] {
        &self.samples
    }

    /// First valid timestamp.
    pub fn start(&self) -> NaiveDateTime {
        self.samples[0].time
    }

    /// First invalid timestamp after the scenario.
    pub fn end(&self) -> NaiveDateTime {
        self.last().time + self.meta.sample_step
    }

    /// Returns `true` if `t` lies in `[start, end)`.
    pub fn contains(&self, t: NaiveDateTime) -> bool {
        t >= self.start() && t < self.end()
    }

    /// Conditions at `t`.
    ///
    /// # Errors
    ///
    /// Returns [`TwinError::OutOfRange`] if `t` is outside `[start, end)`.
    pub fn conditions_at(&self, t: NaiveDateTime) -> Result<ExternalConditions, TwinError> {
        self.check_range(t)?;
        Ok(self.interpolate(t))
    }

    /// Conditions at `t`, holding the last sample past the end.
    ///
    /// The flag is `true` when the last sample was held.
    ///
    /// # Errors
    ///
    /// Returns [`TwinError::OutOfRange`] only if `t` is before the start.
    pub fn conditions_at_clamped(
        &self,
        t: NaiveDateTime,
    ) -> Result<(ExternalConditions, bool), TwinError> {
        if t < self.start() {
            return Err(self.out_of_range(t));
        }
        Ok((self.interpolate(t), t >= self.end()))
    }

    fn check_range(&self, t: NaiveDateTime) -> Result<(), TwinError> {
        if self.contains(t) {
            Ok(())
        } else {
            Err(self.out_of_range(t))
        }
    }

    fn out_of_range(&self, t: NaiveDateTime) -> TwinError {
        TwinError::OutOfRange {
            requested: t,
            start: self.start(),
            end: self.end(),
        }
    }

    fn last(&self) -> &ScenarioSample {
        &self.samples[self.samples.len() - 1]
    }

    /// Interpolated conditions; `t` is clamped to `[start, last sample]`.
    fn interpolate(&self, t: NaiveDateTime) -> ExternalConditions {
        let idx = self.samples.partition_point(|s| s.time <= t).max(1) - 1;
        let a = &self.samples[idx];
        let Some(b) = self.samples.get(idx + 1).filter(|_| t > a.time) else {
            return ExternalConditions {
                exterior_c: a.exterior_c,
                solar_w_m2: a.solar_w_m2,
                tariff: a.tariff,
            };
        };
        let span = (b.time - a.time).num_milliseconds() as f64;
        let w = (t - a.time).num_milliseconds() as f64 / span;
        ExternalConditions {
            exterior_c: a.exterior_c + w * (b.exterior_c - a.exterior_c),
            solar_w_m2: a.solar_w_m2 + w * (b.solar_w_m2 - a.solar_w_m2),
            tariff: a.tariff,
        }
    }
}

/// A scenario queried at the simulation step.
#[derive(Debug, Clone)]
pub struct ScenarioProvider {
    scenario: Scenario,
    step: TimeDelta,
}

impl ScenarioProvider {
    /// Wraps `scenario` for a simulation advancing by `step`.
    ///
    /// # Errors
    ///
    /// Returns [`TwinError::InvalidInput`] if `step` is not positive.
    pub fn new(scenario: Scenario, step: TimeDelta) -> Result<Self, TwinError> {
        if step <= TimeDelta::zero() {
            return Err(TwinError::InvalidInput("simulation step must be positive".into()));
        }
        Ok(Self { scenario, step })
    }

    /// Underlying scenario.
    pub fn scenario(&self) -> &Scenario {
        &self.scenario
    }

    /// Simulation step.
    pub fn step(&self) -> TimeDelta {
        self.step
    }

    /// See [`Scenario::conditions_at`].
    ///
    /// # Errors
    ///
    /// Returns [`TwinError::OutOfRange`] outside `[start, end)`.
    pub fn conditions_at(&self, t: NaiveDateTime) -> Result<ExternalConditions, TwinError> {
        self.scenario.conditions_at(t)
    }

    /// See [`Scenario::conditions_at_clamped`].
    ///
    /// # Errors
    ///
    /// Returns [`TwinError::OutOfRange`] before the start.
    pub fn conditions_at_clamped(
        &self,
        t: NaiveDateTime,
    ) -> Result<(ExternalConditions, bool), TwinError> {
        self.scenario.conditions_at_clamped(t)
    }

    /// Conditions at `t, t + step, …` for `horizon` steps.
    ///
    /// Items past the scenario end hold the last sample. The returned
    /// iterator is lazy and `Clone`; the same arguments always yield the
    /// same sequence.
    ///
    /// # Errors
    ///
    /// Returns [`TwinError::OutOfRange`] if `t` itself is outside `[start, end)`.
    pub fn forecast(&self, t: NaiveDateTime, horizon: usize) -> Result<Forecast<'_>, TwinError> {
        self.scenario.check_range(t)?;
        Ok(self.forecast_from(t, horizon))
    }

    /// Like [`ScenarioProvider::forecast`] but accepts any `t` after the start.
    ///
    /// # Errors
    ///
    /// Returns [`TwinError::OutOfRange`] if `t` is before the start.
    pub fn forecast_clamped(
        &self,
        t: NaiveDateTime,
        horizon: usize,
    ) -> Result<Forecast<'_>, TwinError> {
        if t < self.scenario.start() {
            return Err(self.scenario.out_of_range(t));
        }
        Ok(self.forecast_from(t, horizon))
    }

    fn forecast_from(&self, t: NaiveDateTime, horizon: usize) -> Forecast<'_> {
        Forecast {
            scenario: &self.scenario,
            next: t,
            step: self.step,
            remaining: horizon,
        }
    }
}

/// Lazy, finite forecast window.
#[derive(Debug, Clone)]
pub struct Forecast<'a> {
    scenario: &'a Scenario,
    next: NaiveDateTime,
    step: TimeDelta,
    remaining: usize,
}

impl Iterator for Forecast<'_> {
    type Item = ExternalConditions;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let conditions = self.scenario.interpolate(self.next);
        self.remaining -= 1;
        self.next += self.step;
        Some(conditions)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl ExactSizeIterator for Forecast<'_> {}

fn fractional_hour(time: NaiveDateTime) -> f64 {
    f64::from(time.hour()) + f64::from(time.minute()) / 60.0 + f64::from(time.second()) / 3600.0
}

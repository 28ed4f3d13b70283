//! TOML-based twin configuration and preset definitions.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{NaiveDate, NaiveDateTime, TimeDelta};
use serde::Deserialize;
use thiserror::Error;
use tracing::info;

use crate::error::TwinError;
use crate::scenario::{DayProfile, OutOfRangePolicy, Scenario, ScenarioMeta, ScenarioProvider};
use crate::sim::clock::{Pacing, VirtualClock};
use crate::sim::controller::{AnyController, BaselineController};
use crate::sim::engine::Engine;
use crate::sim::optimizer::{
    ComfortBand, ComfortPenalty, CoordinateDescentOptimizer, DynamicProgrammingOptimizer,
    HorizonOptimizer,
};
use crate::sim::predictive::{FallbackPolicy, PredictiveController, PredictiveSettings};
use crate::sim::sensor::SensorNoise;
use crate::sim::thermal::{BuildingParams, ThermalModel};
use crate::sim::types::TIME_FORMAT;
use crate::tariff::{TariffTable, TariffTier};

/// Top-level twin configuration parsed from TOML.
///
/// All fields have defaults matching the `baseline` preset. Load from TOML
/// with [`TwinConfig::from_toml_file`] or pick a preset with
/// [`TwinConfig::from_preset`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TwinConfig {
    /// Run timing, zone and controller selection.
    pub simulation: SimulationConfig,
    /// Building physics.
    pub building: BuildingParams,
    /// Comfort band used by the predictive controller and the KPI report.
    pub comfort: ComfortBand,
    /// Predictive controller tuning.
    pub predictive: PredictiveConfig,
    /// Hysteresis baseline thresholds.
    pub baseline: BaselineConfig,
    /// Price per tariff tier.
    pub tariff: TariffTable,
    /// Weather and tariff source.
    pub scenario: ScenarioConfig,
}

/// Controller driving the heater.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControllerKind {
    /// Finite-horizon predictive controller.
    #[default]
    Predictive,
    /// Two-threshold hysteresis controller.
    Baseline,
}

/// Horizon solver used by the predictive controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SolverKind {
    /// Backward dynamic programming on a temperature grid.
    #[default]
    Dp,
    /// Warm-started coordinate descent over the command levels.
    Coordinate,
}

/// Run timing, zone and controller selection.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SimulationConfig {
    /// Zone identifier used on the command and sensor channels.
    pub zone: String,
    /// First tick (`%Y-%m-%dT%H:%M:%S`); defaults to the scenario start.
    pub start: Option<String>,
    /// End of the run, exclusive; defaults to the scenario end.
    pub end: Option<String>,
    /// Tick length in minutes (must be > 0).
    pub step_minutes: u32,
    /// Interior (and envelope) temperature at the first tick (°C).
    pub initial_temp_c: f64,
    /// Controller driving the heater.
    pub controller: ControllerKind,
    /// Virtual seconds per wall-clock second in paced mode; 0 runs flat out.
    pub speed_factor: f64,
    /// Behaviour when virtual time leaves the scenario.
    pub out_of_range: OutOfRangePolicy,
    /// Standard deviation of the temperature sensor noise (°C); 0 = exact.
    pub sensor_noise_std_c: f64,
    /// Seed of the sensor noise generator.
    pub seed: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            zone: "living_room".to_string(),
            start: None,
            end: None,
            step_minutes: 15,
            initial_temp_c: 19.0,
            controller: ControllerKind::default(),
            speed_factor: 0.0,
            out_of_range: OutOfRangePolicy::default(),
            sensor_noise_std_c: 0.0,
            seed: 42,
        }
    }
}

/// Predictive controller tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PredictiveConfig {
    /// Horizon length in ticks (must be > 0).
    pub horizon_steps: usize,
    /// Number of evenly spaced command levels between 0% and 100% (must be >= 2).
    pub levels: usize,
    /// Horizon solver.
    pub solver: SolverKind,
    /// Temperature grid resolution of the DP solver (K).
    pub grid_step_c: f64,
    /// Pass limit of the coordinate-descent solver.
    pub max_iterations: usize,
    /// Wall-clock budget of one solve (ms); 0 disables the budget.
    pub time_budget_ms: u64,
    /// Command applied when a solve fails.
    pub fallback: FallbackPolicy,
    /// Comfort penalty weights and exponents.
    pub penalty: ComfortPenalty,
}

impl Default for PredictiveConfig {
    fn default() -> Self {
        Self {
            horizon_steps: 96,
            levels: 11,
            solver: SolverKind::default(),
            grid_step_c: 0.05,
            max_iterations: 50,
            time_budget_ms: 5_000,
            fallback: FallbackPolicy::default(),
            penalty: ComfortPenalty::default(),
        }
    }
}

/// Hysteresis baseline thresholds, `target_c ± delta_c`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BaselineConfig {
    /// Target temperature (°C).
    pub target_c: f64,
    /// Half-width of the hysteresis band (K, must be > 0).
    pub delta_c: f64,
}

impl Default for BaselineConfig {
    fn default() -> Self {
        Self {
            target_c: 20.0,
            delta_c: 0.5,
        }
    }
}

/// Weather and tariff source.
///
/// When `csv` is set the table is loaded from that file; otherwise the
/// scenario is sampled from `days`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScenarioConfig {
    /// Scenario name for logs.
    pub name: String,
    /// CSV table `timestamp,exterior_c,solar_w_m2,tariff`.
    pub csv: Option<PathBuf>,
    /// Sampling step of the day profiles (minutes).
    pub sample_step_minutes: u32,
    /// First hour of the peak tariff window.
    pub peak_start_hour: u32,
    /// End of the peak tariff window, exclusive.
    pub peak_end_hour: u32,
    /// Consecutive day profiles.
    pub days: Vec<DayProfile>,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            name: "winter_week".to_string(),
            csv: None,
            sample_step_minutes: 15,
            peak_start_hour: 6,
            peak_end_hour: 22,
            days: default_days(),
        }
    }
}

fn day(date: NaiveDate, t_min_c: f64, t_max_c: f64, cloud_cover: f64, tier: TariffTier) -> DayProfile {
    DayProfile {
        date,
        t_min_c,
        t_max_c,
        cloud_cover,
        tier,
        off_peak_tier: Some(TariffTier::Low),
    }
}

fn dates() -> impl Iterator<Item = NaiveDate> {
    NaiveDate::from_ymd_opt(2026, 1, 15)
        .into_iter()
        .flat_map(|d| d.iter_days())
}

fn default_days() -> Vec<DayProfile> {
    let weather = [
        (2.0, 9.0, 0.3, TariffTier::Low),
        (0.0, 6.0, 0.6, TariffTier::Medium),
        (-2.0, 4.0, 0.8, TariffTier::High),
    ];
    dates()
        .zip(weather)
        .map(|(date, (lo, hi, cloud, tier))| day(date, lo, hi, cloud, tier))
        .collect()
}

/// A configuration validation error.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("config error: {field}: {message}")]
pub struct ConfigError {
    /// Dotted path of the offending field.
    pub field: String,
    /// What is wrong with it.
    pub message: String,
}

impl ConfigError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Parses a `%Y-%m-%dT%H:%M:%S` timestamp.
///
/// # Errors
///
/// Returns a [`ConfigError`] naming `field` if `value` does not parse.
pub fn parse_time(field: &str, value: &str) -> Result<NaiveDateTime, ConfigError> {
    NaiveDateTime::parse_from_str(value, TIME_FORMAT).map_err(|e| {
        ConfigError::new(field, format!("\"{value}\" is not a {TIME_FORMAT} timestamp: {e}"))
    })
}

impl TwinConfig {
    /// Returns the baseline configuration: a two-node dwelling over three
    /// winter days, driven by the predictive controller.
    pub fn baseline() -> Self {
        Self {
            building: BuildingParams::two_node(),
            ..Self::default()
        }
    }

    /// Returns a cold-snap configuration: freezing days on the expensive tier
    /// and a dwelling that starts cold.
    pub fn cold_snap() -> Self {
        let weather = [
            (-6.0, 0.0, 0.9, TariffTier::Medium),
            (-10.0, -3.0, 0.9, TariffTier::High),
            (-8.0, -1.0, 0.7, TariffTier::High),
        ];
        Self {
            simulation: SimulationConfig {
                initial_temp_c: 17.0,
                ..SimulationConfig::default()
            },
            building: BuildingParams::two_node(),
            scenario: ScenarioConfig {
                name: "cold_snap".to_string(),
                days: dates()
                    .zip(weather)
                    .map(|(date, (lo, hi, cloud, tier))| day(date, lo, hi, cloud, tier))
                    .collect(),
                ..ScenarioConfig::default()
            },
            ..Self::default()
        }
    }

    /// Returns a single-node (R1C1) configuration.
    pub fn r1c1() -> Self {
        Self {
            building: BuildingParams::r1c1(0.006, 1.2e7, 4000.0),
            ..Self::default()
        }
    }

    /// Available preset names.
    pub const PRESETS: &[&str] = &["baseline", "cold_snap", "r1c1"];

    /// Loads a named preset.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if the preset name is not recognized.
    pub fn from_preset(name: &str) -> Result<Self, ConfigError> {
        match name {
            "baseline" => Ok(Self::baseline()),
            "cold_snap" => Ok(Self::cold_snap()),
            "r1c1" => Ok(Self::r1c1()),
            _ => Err(ConfigError::new(
                "preset",
                format!(
                    "unknown preset \"{name}\", available: {}",
                    Self::PRESETS.join(", ")
                ),
            )),
        }
    }

    /// Loads a configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if the file cannot be read or parsed.
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| {
            ConfigError::new("scenario", format!("cannot read \"{}\": {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
    }

    /// Parses a configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if the TOML is malformed or contains unknown fields.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        toml::from_str(s).map_err(|e| ConfigError::new("toml", e.to_string()))
    }

    /// Validates semantic constraints across all sections.
    ///
    /// # Returns
    ///
    /// A vector of all validation errors found (empty if valid).
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut errors = Vec::new();
        let mut check = |ok: bool, field: &str, message: &str| {
            if !ok {
                errors.push(ConfigError::new(field, message));
            }
        };

        let s = &self.simulation;
        check(!s.zone.trim().is_empty(), "simulation.zone", "must not be empty");
        check(s.step_minutes > 0, "simulation.step_minutes", "must be > 0");
        check(s.initial_temp_c.is_finite(), "simulation.initial_temp_c", "must be finite");
        check(
            s.speed_factor.is_finite() && s.speed_factor >= 0.0,
            "simulation.speed_factor",
            "must be finite and >= 0",
        );
        if s.step_minutes > 0 && s.speed_factor.is_finite() && s.speed_factor > 0.0 {
            let step = TimeDelta::minutes(i64::from(s.step_minutes));
            check(
                Pacing::from_speed_factor(step, s.speed_factor).is_ok(),
                "simulation.speed_factor",
                "must give a representable, non-zero tick interval",
            );
        }
        check(
            s.sensor_noise_std_c.is_finite() && s.sensor_noise_std_c >= 0.0,
            "simulation.sensor_noise_std_c",
            "must be finite and >= 0",
        );

        let b = &self.building;
        check(b.r_k_per_w > 0.0, "building.r_k_per_w", "must be > 0");
        check(b.c_j_per_k > 0.0, "building.c_j_per_k", "must be > 0");
        check(b.heater_max_w > 0.0, "building.heater_max_w", "must be > 0");
        check(b.glazing_area_m2 >= 0.0, "building.glazing_area_m2", "must be >= 0");
        check(
            (0.0..=1.0).contains(&b.transmittance),
            "building.transmittance",
            "must be in [0.0, 1.0]",
        );
        if let Some(env) = &b.envelope {
            check(
                env.r_interior_k_per_w > 0.0 && env.r_exterior_k_per_w > 0.0,
                "building.envelope",
                "resistances must be > 0",
            );
            check(env.c_j_per_k > 0.0, "building.envelope.c_j_per_k", "must be > 0");
        }

        check(
            self.comfort.min_c < self.comfort.max_c,
            "comfort.min_c",
            "must be < comfort.max_c",
        );

        let p = &self.predictive;
        check(p.horizon_steps > 0, "predictive.horizon_steps", "must be > 0");
        check(p.levels >= 2, "predictive.levels", "must be >= 2");
        check(p.grid_step_c > 0.0, "predictive.grid_step_c", "must be > 0");
        check(p.max_iterations > 0, "predictive.max_iterations", "must be > 0");
        let pen = &p.penalty;
        check(
            pen.under_weight >= 0.0 && pen.over_weight >= 0.0,
            "predictive.penalty",
            "weights must be >= 0",
        );
        check(
            pen.under_exponent >= 1.0 && pen.over_exponent >= 1.0,
            "predictive.penalty",
            "exponents must be >= 1",
        );

        check(self.baseline.delta_c > 0.0, "baseline.delta_c", "must be > 0");

        let t = &self.tariff;
        check(
            t.low >= 0.0 && t.medium >= 0.0 && t.high >= 0.0,
            "tariff",
            "prices must be >= 0",
        );

        let sc = &self.scenario;
        check(sc.sample_step_minutes > 0, "scenario.sample_step_minutes", "must be > 0");
        check(
            sc.peak_start_hour < sc.peak_end_hour && sc.peak_end_hour <= 24,
            "scenario.peak_start_hour",
            "must be < scenario.peak_end_hour <= 24",
        );
        check(
            sc.csv.is_some() || !sc.days.is_empty(),
            "scenario.days",
            "must not be empty when scenario.csv is not set",
        );

        let start = s.start.as_deref().map(|v| parse_time("simulation.start", v));
        let end = s.end.as_deref().map(|v| parse_time("simulation.end", v));
        if let (Some(Ok(start)), Some(Ok(end))) = (&start, &end) {
            check(start < end, "simulation.start", "must be before simulation.end");
        }
        errors.extend(start.into_iter().chain(end).filter_map(Result::err));

        errors
    }

    /// Loads the configured scenario.
    ///
    /// # Errors
    ///
    /// Returns an error if the CSV file cannot be read or the samples are invalid.
    pub fn load_scenario(&self) -> Result<Scenario, TwinError> {
        let sc = &self.scenario;
        let speed_factor = self.simulation.speed_factor;
        match &sc.csv {
            Some(path) => Scenario::from_csv_path(path, speed_factor),
            None => Scenario::from_day_profiles(
                ScenarioMeta {
                    name: sc.name.clone(),
                    sample_step: TimeDelta::minutes(i64::from(sc.sample_step_minutes)),
                    speed_factor,
                },
                &sc.days,
                (sc.peak_start_hour, sc.peak_end_hour),
            ),
        }
    }

    fn optimizer(&self) -> Box<dyn HorizonOptimizer> {
        let p = &self.predictive;
        let time_budget = (p.time_budget_ms > 0).then(|| Duration::from_millis(p.time_budget_ms));
        match p.solver {
            SolverKind::Dp => Box::new(DynamicProgrammingOptimizer {
                grid_step_c: p.grid_step_c,
                time_budget,
                ..DynamicProgrammingOptimizer::default()
            }),
            SolverKind::Coordinate => Box::new(CoordinateDescentOptimizer {
                max_iterations: p.max_iterations,
                time_budget,
            }),
        }
    }

    fn controller(
        &self,
        model: &ThermalModel,
        baseline: BaselineController,
    ) -> Result<AnyController, TwinError> {
        match self.simulation.controller {
            ControllerKind::Baseline => Ok(AnyController::Baseline(baseline)),
            ControllerKind::Predictive => {
                let p = &self.predictive;
                let settings = PredictiveController::settings_with_levels(
                    PredictiveSettings {
                        band: self.comfort,
                        penalty: p.penalty,
                        horizon: p.horizon_steps,
                        fallback: p.fallback,
                        ..PredictiveSettings::default()
                    },
                    p.levels,
                )?;
                let controller = PredictiveController::new(
                    model,
                    self.optimizer(),
                    self.tariff,
                    baseline,
                    settings,
                )?;
                Ok(AnyController::Predictive(Box::new(controller)))
            }
        }
    }

    /// Builds a ready-to-start engine from this configuration.
    ///
    /// # Errors
    ///
    /// Returns the first validation error as [`TwinError::Config`], or the
    /// error raised while loading the scenario or assembling the engine.
    pub fn build_engine(&self) -> Result<Engine<AnyController>, TwinError> {
        if let Some(err) = self.validate().into_iter().next() {
            return Err(err.into());
        }
        let s = &self.simulation;

        let scenario = self.load_scenario()?;
        let step = TimeDelta::minutes(i64::from(s.step_minutes));
        let start = match &s.start {
            Some(v) => parse_time("simulation.start", v)?,
            None => scenario.start(),
        };
        let end = match &s.end {
            Some(v) => parse_time("simulation.end", v)?,
            None => scenario.end(),
        };
        info!(
            scenario = %scenario.meta().name,
            samples = scenario.samples().len(),
            start = %start,
            end = %end,
            step_minutes = s.step_minutes,
            "scenario loaded"
        );

        let clock = VirtualClock::new(start, end, step)?;
        let provider = ScenarioProvider::new(scenario, step)?;
        let model = ThermalModel::new(self.building)?;
        let initial = model.uniform_state(s.initial_temp_c);
        let baseline = BaselineController::around(self.baseline.target_c, self.baseline.delta_c)?;
        let controller = self.controller(&model, baseline)?;

        let sensor = if s.sensor_noise_std_c > 0.0 {
            SensorNoise::new(s.sensor_noise_std_c, s.seed)
        } else {
            SensorNoise::exact()
        };

        Ok(
            Engine::new(&s.zone, clock, provider, model, self.tariff, initial, controller)?
                .with_out_of_range_policy(s.out_of_range)
                .with_sensor(sensor),
        )
    }
}

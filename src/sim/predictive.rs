//! Receding-horizon predictive controller.
//!
//! Every tick the controller builds a [`HorizonProblem`] from the current
//! interior temperature and the forecast window, hands it to the configured
//! [`HorizonOptimizer`], and applies only the first command of the plan.
//! The rest of the plan survives only as the next solve's warm start.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::TwinError;
use crate::tariff::TariffTable;

use super::controller::{BaselineController, ControlInput, Controller, Decision};
use super::optimizer::{
    ComfortBand, ComfortPenalty, HorizonOptimizer, HorizonProblem, HorizonSolution, HorizonStep,
    SolveError, uniform_levels,
};
use super::thermal::ThermalModel;
use super::types::{ActuatorCommand, CommandSource, format_time};

/// Command applied when a solve fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FallbackPolicy {
    /// Keep the previous tick's command.
    #[default]
    Hold,
    /// Use the hysteresis baseline for this tick.
    Baseline,
}

/// Tuning of the predictive controller.
#[derive(Debug, Clone, PartialEq)]
pub struct PredictiveSettings {
    /// Comfort band.
    pub band: ComfortBand,
    /// Comfort penalty.
    pub penalty: ComfortPenalty,
    /// Horizon length in ticks.
    pub horizon: usize,
    /// Admissible heater fractions, ascending.
    pub levels: Vec<f64>,
    /// Fallback on solver failure.
    pub fallback: FallbackPolicy,
}

impl Default for PredictiveSettings {
    fn default() -> Self {
        Self {
            band: ComfortBand::default(),
            penalty: ComfortPenalty::default(),
            horizon: 96,
            levels: (0..=10).map(|i| f64::from(i) / 10.0).collect(),
            fallback: FallbackPolicy::default(),
        }
    }
}

/// Predictive heating controller.
#[derive(Debug)]
pub struct PredictiveController {
    model: ThermalModel,
    optimizer: Box<dyn HorizonOptimizer>,
    tariff: TariffTable,
    baseline: BaselineController,
    settings: PredictiveSettings,
    last_plan: Option<Vec<f64>>,
}

impl PredictiveController {
    /// Creates a controller planning on the single-node equivalent of `model`.
    ///
    /// # Arguments
    ///
    /// * `model` - Building model; two-node models are reduced with [`ThermalModel::lumped`]
    /// * `optimizer` - Horizon solver
    /// * `tariff` - Prices used to cost the plan
    /// * `baseline` - Policy used by [`FallbackPolicy::Baseline`]
    /// * `settings` - Comfort band, penalty, horizon, levels and fallback
    ///
    /// # Errors
    ///
    /// Returns [`TwinError::InvalidInput`] for an empty horizon, an inverted
    /// comfort band, or invalid command levels.
    pub fn new(
        model: &ThermalModel,
        optimizer: Box<dyn HorizonOptimizer>,
        tariff: TariffTable,
        baseline: BaselineController,
        settings: PredictiveSettings,
    ) -> Result<Self, TwinError> {
        if settings.horizon == 0 {
            return Err(TwinError::InvalidInput("predictive horizon must be > 0".into()));
        }
        let band = settings.band;
        if !(band.min_c.is_finite() && band.max_c.is_finite() && band.min_c < band.max_c) {
            return Err(TwinError::InvalidInput(format!(
                "comfort band [{}, {}] is not a valid interval",
                band.min_c, band.max_c
            )));
        }
        let levels = &settings.levels;
        if levels.is_empty()
            || levels.iter().any(|l| !(0.0..=1.0).contains(l))
            || levels.windows(2).any(|w| w[1] <= w[0])
        {
            return Err(TwinError::InvalidInput(
                "command levels must be strictly ascending fractions in [0, 1]".into(),
            ));
        }
        Ok(Self {
            model: model.lumped(),
            optimizer,
            tariff,
            baseline,
            settings,
            last_plan: None,
        })
    }

    /// Settings with `count` evenly spaced levels.
    ///
    /// # Errors
    ///
    /// Returns [`TwinError::InvalidInput`] if `count < 2`.
    pub fn settings_with_levels(
        settings: PredictiveSettings,
        count: usize,
    ) -> Result<PredictiveSettings, TwinError> {
        Ok(PredictiveSettings {
            levels: uniform_levels(count).map_err(|e| TwinError::InvalidInput(e.to_string()))?,
            ..settings
        })
    }

    fn problem(&self, input: &ControlInput) -> HorizonProblem {
        let steps = input
            .forecast
            .iter()
            .take(self.settings.horizon)
            .map(|c| HorizonStep {
                exterior_c: c.exterior_c,
                solar_gain_w: self.model.solar_gain_w(c.solar_w_m2),
                price_per_kwh: self.tariff.price_per_kwh(c.tariff),
            })
            .collect();
        HorizonProblem {
            initial_c: input.state.interior_c,
            steps,
            dt_s: input.dt_s,
            model: self.model,
            band: self.settings.band,
            penalty: self.settings.penalty,
            levels: self.settings.levels.clone(),
        }
    }

    /// Previous plan shifted by one step, padded with its last command.
    fn warm_start(&self, len: usize) -> Option<Vec<f64>> {
        let plan = self.last_plan.as_ref()?;
        let last = *plan.last()?;
        let mut guess: Vec<f64> = plan.iter().skip(1).copied().collect();
        guess.resize(len, last);
        Some(guess)
    }

    fn solve(&self, input: &ControlInput) -> Result<HorizonSolution, SolveError> {
        let problem = self.problem(input);
        let guess = self.warm_start(problem.len());
        self.optimizer.solve(&problem, guess.as_deref())
    }

    fn fall_back(&mut self, input: &ControlInput, error: SolveError) -> Decision {
        self.last_plan = None;
        let reason = TwinError::SolverNonConvergence(error).to_string();
        let (command, source) = match self.settings.fallback {
            FallbackPolicy::Hold => (input.previous, CommandSource::Predictive),
            FallbackPolicy::Baseline => (
                self.baseline
                    .command_for(input.state.interior_c, input.previous),
                CommandSource::Baseline,
            ),
        };
        warn!(
            time = %format_time(input.time),
            solver = self.optimizer.name(),
            policy = ?self.settings.fallback,
            command_pct = command.percent(),
            %reason,
            "predictive solve failed, applying fallback"
        );
        Decision {
            command,
            source,
            fallback: Some(reason),
        }
    }
}

impl Controller for PredictiveController {
    fn name(&self) -> &'static str {
        "predictive"
    }

    fn horizon(&self) -> usize {
        self.settings.horizon
    }

    fn decide(&mut self, input: &ControlInput) -> Decision {
        let solution = match self.solve(input) {
            Ok(solution) => solution,
            Err(e) => return self.fall_back(input, e),
        };
        let first = solution.commands.first().copied().unwrap_or(f64::NAN);
        let Ok(command) = ActuatorCommand::from_fraction(first) else {
            return self.fall_back(
                input,
                SolveError::InvalidProblem(format!("solver returned first command {first}")),
            );
        };
        debug!(
            time = %format_time(input.time),
            solver = self.optimizer.name(),
            command_pct = command.percent(),
            planned_cost = solution.cost,
            next_c = solution.temperatures.first().copied().unwrap_or(f64::NAN),
            iterations = solution.iterations,
            "predictive plan"
        );
        self.last_plan = Some(solution.commands);
        Decision {
            command,
            source: CommandSource::Predictive,
            fallback: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;
    use crate::sim::optimizer::DynamicProgrammingOptimizer;
    use crate::sim::thermal::BuildingParams;
    use crate::sim::types::{ExternalConditions, ThermalState};
    use crate::tariff::TariffTier;

    #[derive(Debug)]
    struct Failing;

    impl HorizonOptimizer for Failing {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn solve(
            &self,
            _problem: &HorizonProblem,
            _guess: Option<&[f64]>,
        ) -> Result<HorizonSolution, SolveError> {
            Err(SolveError::NotConverged { iterations: 3 })
        }
    }

    fn controller(optimizer: Box<dyn HorizonOptimizer>, fallback: FallbackPolicy) -> PredictiveController {
        let model =
            ThermalModel::new(BuildingParams::r1c1(0.01, 5.0e6, 6000.0)).expect("valid params");
        let settings = PredictiveSettings {
            band: ComfortBand {
                min_c: 20.0,
                max_c: 23.0,
            },
            horizon: 12,
            fallback,
            ..PredictiveSettings::default()
        };
        PredictiveController::new(
            &model,
            optimizer,
            TariffTable::default(),
            BaselineController::around(21.5, 0.5).expect("valid"),
            settings,
        )
        .expect("valid controller")
    }

    fn input(interior_c: f64, exterior_c: f64, tiers: &[TariffTier]) -> ControlInput {
        let forecast: Vec<_> = tiers
            .iter()
            .map(|&tariff| ExternalConditions {
                exterior_c,
                solar_w_m2: 0.0,
                tariff,
            })
            .collect();
        ControlInput {
            time: NaiveDate::from_ymd_opt(2026, 1, 15)
                .and_then(|d| d.and_hms_opt(4, 0, 0))
                .expect("valid timestamp"),
            state: ThermalState::new(interior_c),
            current: forecast[0],
            forecast,
            previous: ActuatorCommand::from_percent(30.0).expect("valid"),
            dt_s: 900.0,
        }
    }

    fn dp() -> Box<dyn HorizonOptimizer> {
        Box::new(DynamicProgrammingOptimizer::default())
    }

    #[test]
    fn no_heating_when_outside_is_above_band() {
        let mut c = controller(dp(), FallbackPolicy::Hold);
        let d = c.decide(&input(22.0, 26.0, &[TariffTier::Low; 12]));
        assert_eq!(d.command, ActuatorCommand::OFF);
        assert_eq!(d.source, CommandSource::Predictive);
        assert!(d.fallback.is_none());
    }

    #[test]
    fn pre_heats_before_price_spike() {
        let mut spike = [TariffTier::High; 12];
        spike[0] = TariffTier::Low;
        spike[1] = TariffTier::Low;

        let mut c = controller(dp(), FallbackPolicy::Hold);
        let before_spike = c.decide(&input(20.0, 5.0, &spike)).command;
        let plan = c.last_plan.clone().expect("plan kept");
        assert!(plan[2] < plan[0], "plan {plan:?}");

        let mut c = controller(dp(), FallbackPolicy::Hold);
        let flat = c.decide(&input(20.0, 5.0, &[TariffTier::Low; 12])).command;
        assert!(before_spike > flat, "spike={before_spike:?} flat={flat:?}");
    }

    #[test]
    fn failed_solve_holds_previous_command() {
        let mut c = controller(Box::new(Failing), FallbackPolicy::Hold);
        let d = c.decide(&input(20.0, 5.0, &[TariffTier::Low; 12]));
        assert_eq!(d.command.percent(), 30.0);
        let reason = d.fallback.expect("fallback must be reported");
        assert!(reason.contains("did not converge"), "{reason}");
        assert!(c.last_plan.is_none());
    }

    #[test]
    fn failed_solve_can_use_baseline() {
        let mut c = controller(Box::new(Failing), FallbackPolicy::Baseline);
        let d = c.decide(&input(18.0, 5.0, &[TariffTier::Low; 12]));
        assert_eq!(d.command, ActuatorCommand::FULL);
        assert_eq!(d.source, CommandSource::Baseline);
        assert!(d.fallback.is_some());
    }

    #[test]
    fn warm_start_shifts_previous_plan() {
        let mut c = controller(dp(), FallbackPolicy::Hold);
        c.decide(&input(20.0, 5.0, &[TariffTier::Low; 12]));
        let plan = c.last_plan.clone().expect("plan kept");
        let guess = c.warm_start(12).expect("guess");
        assert_eq!(guess.len(), 12);
        assert_eq!(&guess[..11], &plan[1..]);
        assert_eq!(guess[11], plan[11]);
    }

    #[test]
    fn rejects_empty_horizon() {
        let model = ThermalModel::new(BuildingParams::default()).expect("valid params");
        let settings = PredictiveSettings {
            horizon: 0,
            ..PredictiveSettings::default()
        };
        assert!(
            PredictiveController::new(
                &model,
                dp(),
                TariffTable::default(),
                BaselineController::around(20.0, 0.5).expect("valid"),
                settings,
            )
            .is_err()
        );
    }
}

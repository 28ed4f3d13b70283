//! Finite-horizon optimizers for the predictive controller.
//!
//! A [`HorizonProblem`] describes N future steps of a single-node thermal
//! model. The decision variable at each step is a heater fraction taken from
//! a fixed set of admissible levels; the temperature trajectory is implied by
//! applying the model step equation recursively. Comfort bounds are soft:
//! excursions are charged through a [`ComfortPenalty`].
//!
//! Solvers implement [`HorizonOptimizer`] and are interchangeable.

use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::thermal::ThermalModel;

/// Failure of a horizon solve.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SolveError {
    /// The problem has no steps.
    #[error("horizon is empty")]
    EmptyHorizon,
    /// No finite-cost trajectory exists.
    #[error("no admissible command sequence has a finite cost")]
    Infeasible,
    /// Iterative search stopped before converging.
    #[error("no convergence after {iterations} iterations")]
    NotConverged {
        /// Completed iterations.
        iterations: usize,
    },
    /// Wall-clock budget exhausted.
    #[error("solve exceeded its {0:?} time budget")]
    Timeout(Duration),
    /// Malformed problem data.
    #[error("invalid problem: {0}")]
    InvalidProblem(String),
}

/// Comfort band `[min_c, max_c]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ComfortBand {
    /// Lower comfort bound (°C).
    pub min_c: f64,
    /// Upper comfort bound (°C).
    pub max_c: f64,
}

impl Default for ComfortBand {
    fn default() -> Self {
        Self {
            min_c: 19.0,
            max_c: 22.0,
        }
    }
}

impl ComfortBand {
    /// Returns `true` if `temp_c` lies inside the band.
    pub fn contains(&self, temp_c: f64) -> bool {
        temp_c >= self.min_c && temp_c <= self.max_c
    }
}

/// Asymmetric soft-constraint penalty for comfort excursions.
///
/// Below the band the rate is `under_weight · (min − T)^under_exponent`,
/// above it `over_weight · (T − max)^over_exponent`, in cost units per hour.
/// Overheating is weighted more heavily by default.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ComfortPenalty {
    /// Weight below the band (cost per K^p per hour).
    pub under_weight: f64,
    /// Weight above the band (cost per K^p per hour).
    pub over_weight: f64,
    /// Exponent below the band.
    pub under_exponent: f64,
    /// Exponent above the band.
    pub over_exponent: f64,
}

impl Default for ComfortPenalty {
    fn default() -> Self {
        Self {
            under_weight: 2.0,
            over_weight: 8.0,
            under_exponent: 2.0,
            over_exponent: 2.0,
        }
    }
}

impl ComfortPenalty {
    /// Penalty rate (cost per hour) of sitting at `temp_c`.
    pub fn rate(&self, band: &ComfortBand, temp_c: f64) -> f64 {
        if temp_c < band.min_c {
            self.under_weight * (band.min_c - temp_c).powf(self.under_exponent)
        } else if temp_c > band.max_c {
            self.over_weight * (temp_c - band.max_c).powf(self.over_exponent)
        } else {
            0.0
        }
    }
}

/// Forecast data of one horizon step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HorizonStep {
    /// Exterior temperature (°C).
    pub exterior_c: f64,
    /// Solar gain entering the interior (W).
    pub solar_gain_w: f64,
    /// Electricity price (per kWh).
    pub price_per_kwh: f64,
}

/// Finite-horizon control problem.
#[derive(Debug, Clone)]
pub struct HorizonProblem {
    /// Interior temperature at the start of the horizon (°C).
    pub initial_c: f64,
    /// One entry per horizon step.
    pub steps: Vec<HorizonStep>,
    /// Step length (s).
    pub dt_s: f64,
    /// Single-node model used as the equality constraint.
    pub model: ThermalModel,
    /// Comfort band.
    pub band: ComfortBand,
    /// Comfort penalty.
    pub penalty: ComfortPenalty,
    /// Admissible heater fractions, ascending.
    pub levels: Vec<f64>,
}

impl HorizonProblem {
    /// Checks the problem before solving.
    ///
    /// # Errors
    ///
    /// [`SolveError::EmptyHorizon`] for zero steps, [`SolveError::InvalidProblem`]
    /// for non-finite data, unsorted or out-of-range levels, a two-node model,
    /// or an unstable step.
    pub fn validate(&self) -> Result<(), SolveError> {
        if self.steps.is_empty() {
            return Err(SolveError::EmptyHorizon);
        }
        if !self.initial_c.is_finite() {
            return Err(SolveError::InvalidProblem("initial temperature is not finite".into()));
        }
        if self.model.has_envelope() {
            return Err(SolveError::InvalidProblem(
                "horizon model must be single-node".into(),
            ));
        }
        if !(self.dt_s > 0.0 && self.dt_s <= self.model.max_stable_dt_s()) {
            return Err(SolveError::InvalidProblem(format!(
                "step of {} s is outside (0, {:.1}]",
                self.dt_s,
                self.model.max_stable_dt_s()
            )));
        }
        if self.levels.is_empty()
            || self.levels.iter().any(|l| !(0.0..=1.0).contains(l))
            || self.levels.windows(2).any(|w| w[1] <= w[0])
        {
            return Err(SolveError::InvalidProblem(
                "levels must be strictly ascending fractions in [0, 1]".into(),
            ));
        }
        let finite = self.steps.iter().all(|s| {
            s.exterior_c.is_finite() && s.solar_gain_w.is_finite() && s.price_per_kwh.is_finite()
        });
        if !finite {
            return Err(SolveError::InvalidProblem("forecast contains non-finite values".into()));
        }
        Ok(())
    }

    /// Number of horizon steps.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Returns `true` if the horizon has no steps.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Temperature after step `k` from `temp_c` with heater `fraction`.
    pub fn advance(&self, k: usize, temp_c: f64, fraction: f64) -> f64 {
        let s = &self.steps[k];
        self.model
            .predict_interior(temp_c, s.exterior_c, s.solar_gain_w, fraction, self.dt_s)
    }

    /// Cost of step `k`: energy bill plus comfort penalty at the reached temperature.
    pub fn stage_cost(&self, k: usize, fraction: f64, next_c: f64) -> f64 {
        let dt_h = self.dt_s / 3600.0;
        let heater_kw = self.model.params().heater_max_w / 1000.0;
        let energy = self.steps[k].price_per_kwh * heater_kw * dt_h * fraction;
        energy + dt_h * self.penalty.rate(&self.band, next_c)
    }

    /// Rolls out `commands` from the initial temperature.
    ///
    /// Returns the predicted temperatures after each step and the total cost.
    pub fn evaluate(&self, commands: &[f64]) -> (Vec<f64>, f64) {
        let mut temps = Vec::with_capacity(commands.len());
        let mut temp = self.initial_c;
        let mut cost = 0.0;
        for (k, &u) in commands.iter().enumerate().take(self.steps.len()) {
            let next = self.advance(k, temp, u);
            cost += self.stage_cost(k, u, next);
            temps.push(next);
            temp = next;
        }
        (temps, cost)
    }
}

/// Optimal (or best found) command trajectory.
#[derive(Debug, Clone, PartialEq)]
pub struct HorizonSolution {
    /// Heater fraction per step.
    pub commands: Vec<f64>,
    /// Predicted interior temperature after each step (°C).
    pub temperatures: Vec<f64>,
    /// Objective value.
    pub cost: f64,
    /// Solver iterations (passes or stages).
    pub iterations: usize,
}

/// Black-box solver seam of the predictive controller.
pub trait HorizonOptimizer: Send + Sync + fmt::Debug {
    /// Short solver name for logs.
    fn name(&self) -> &'static str;

    /// Solves `problem`, optionally starting from `guess`.
    ///
    /// # Errors
    ///
    /// Returns a [`SolveError`] if the problem is invalid, infeasible, or the
    /// solver runs out of iterations or time.
    fn solve(
        &self,
        problem: &HorizonProblem,
        guess: Option<&[f64]>,
    ) -> Result<HorizonSolution, SolveError>;
}

/// Backward dynamic programming over a discretized temperature grid.
///
/// The value function is tabulated on a uniform grid and interpolated
/// linearly; the returned plan is then rolled forward on the exact dynamics.
/// Ties between levels go to the lowest level.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DynamicProgrammingOptimizer {
    /// Grid resolution (K).
    pub grid_step_c: f64,
    /// Grid extension beyond the comfort band and the initial temperature (K).
    pub margin_c: f64,
    /// Wall-clock budget of one solve.
    pub time_budget: Option<Duration>,
}

impl Default for DynamicProgrammingOptimizer {
    fn default() -> Self {
        Self {
            grid_step_c: 0.05,
            margin_c: 10.0,
            time_budget: Some(Duration::from_secs(5)),
        }
    }
}

struct Grid {
    lo: f64,
    step: f64,
    len: usize,
}

impl Grid {
    fn temp(&self, i: usize) -> f64 {
        self.lo + i as f64 * self.step
    }

    fn interpolate(&self, values: &[f64], temp_c: f64) -> f64 {
        let x = ((temp_c - self.lo) / self.step).clamp(0.0, (self.len - 1) as f64);
        let i = (x.floor() as usize).min(self.len - 2);
        let w = x - i as f64;
        values[i] + w * (values[i + 1] - values[i])
    }
}

impl HorizonOptimizer for DynamicProgrammingOptimizer {
    fn name(&self) -> &'static str {
        "dp"
    }

    fn solve(
        &self,
        problem: &HorizonProblem,
        _guess: Option<&[f64]>,
    ) -> Result<HorizonSolution, SolveError> {
        problem.validate()?;
        if !(self.grid_step_c > 0.0 && self.margin_c >= 0.0) {
            return Err(SolveError::InvalidProblem("grid step must be positive".into()));
        }
        let started = Instant::now();
        let n = problem.len();

        let lo = problem.initial_c.min(problem.band.min_c) - self.margin_c;
        let hi = problem.initial_c.max(problem.band.max_c) + self.margin_c;
        let grid = Grid {
            lo,
            step: self.grid_step_c,
            len: (((hi - lo) / self.grid_step_c).ceil() as usize + 1).max(2),
        };

        // values[k] is the cost-to-go from step k; the terminal row is zero.
        let mut values = vec![vec![0.0; grid.len]; n + 1];
        for k in (0..n).rev() {
            if let Some(budget) = self.time_budget {
                if started.elapsed() > budget {
                    return Err(SolveError::Timeout(budget));
                }
            }
            let (head, tail) = values.split_at_mut(k + 1);
            let next = &tail[0];
            for (i, slot) in head[k].iter_mut().enumerate() {
                let temp = grid.temp(i);
                *slot = problem
                    .levels
                    .iter()
                    .map(|&u| {
                        let reached = problem.advance(k, temp, u);
                        problem.stage_cost(k, u, reached) + grid.interpolate(next, reached)
                    })
                    .fold(f64::INFINITY, f64::min);
            }
            if head[k].iter().any(|v| !v.is_finite()) {
                return Err(SolveError::Infeasible);
            }
        }

        let mut commands = Vec::with_capacity(n);
        let mut temp = problem.initial_c;
        for k in 0..n {
            let mut best = (f64::INFINITY, problem.levels[0]);
            for &u in &problem.levels {
                let reached = problem.advance(k, temp, u);
                let q = problem.stage_cost(k, u, reached) + grid.interpolate(&values[k + 1], reached);
                if q < best.0 {
                    best = (q, u);
                }
            }
            commands.push(best.1);
            temp = problem.advance(k, temp, best.1);
        }

        let (temperatures, cost) = problem.evaluate(&commands);
        if !cost.is_finite() {
            return Err(SolveError::Infeasible);
        }
        Ok(HorizonSolution {
            commands,
            temperatures,
            cost,
            iterations: n,
        })
    }
}

/// Warm-started coordinate descent over the command levels.
///
/// Each pass tries every level at every step and keeps strict improvements.
/// The search converges when a full pass changes nothing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CoordinateDescentOptimizer {
    /// Maximum number of passes.
    pub max_iterations: usize,
    /// Wall-clock budget of one solve.
    pub time_budget: Option<Duration>,
}

impl Default for CoordinateDescentOptimizer {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            time_budget: Some(Duration::from_secs(5)),
        }
    }
}

impl HorizonOptimizer for CoordinateDescentOptimizer {
    fn name(&self) -> &'static str {
        "coordinate-descent"
    }

    fn solve(
        &self,
        problem: &HorizonProblem,
        guess: Option<&[f64]>,
    ) -> Result<HorizonSolution, SolveError> {
        problem.validate()?;
        let started = Instant::now();
        let n = problem.len();

        let mut commands: Vec<f64> = match guess {
            Some(g) if g.len() == n && g.iter().all(|u| (0.0..=1.0).contains(u)) => g.to_vec(),
            _ => vec![problem.levels[0]; n],
        };
        let (_, mut best_cost) = problem.evaluate(&commands);

        for pass in 1..=self.max_iterations {
            if let Some(budget) = self.time_budget {
                if started.elapsed() > budget {
                    return Err(SolveError::Timeout(budget));
                }
            }
            let mut improved = false;
            for k in 0..n {
                let current = commands[k];
                for &u in &problem.levels {
                    if u == current {
                        continue;
                    }
                    commands[k] = u;
                    let (_, cost) = problem.evaluate(&commands);
                    if cost < best_cost {
                        best_cost = cost;
                        improved = true;
                    } else {
                        commands[k] = current;
                    }
                }
            }
            if !improved {
                if !best_cost.is_finite() {
                    return Err(SolveError::Infeasible);
                }
                let (temperatures, cost) = problem.evaluate(&commands);
                return Ok(HorizonSolution {
                    commands,
                    temperatures,
                    cost,
                    iterations: pass,
                });
            }
        }
        Err(SolveError::NotConverged {
            iterations: self.max_iterations,
        })
    }
}

/// Evenly spaced levels `0, 1/(count-1), …, 1`.
///
/// # Errors
///
/// Returns [`SolveError::InvalidProblem`] if `count < 2`.
pub fn uniform_levels(count: usize) -> Result<Vec<f64>, SolveError> {
    if count < 2 {
        return Err(SolveError::InvalidProblem(
            "at least two command levels are required".into(),
        ));
    }
    let last = (count - 1) as f64;
    Ok((0..count).map(|i| i as f64 / last).collect())
}

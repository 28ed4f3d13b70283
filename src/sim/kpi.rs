//! Post-hoc KPI computation from tick records.

use std::fmt;

use super::optimizer::ComfortBand;
use super::types::{CommandSource, TickEvent, TickRecord};

/// Aggregate key performance indicators derived from a complete run.
///
/// Computed post-hoc from `&[TickRecord]` so the report always agrees with
/// the published telemetry. Comfort is judged on the state each tick produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KpiReport {
    /// Number of ticks in the run.
    pub ticks: usize,
    /// Heater energy over the run (kWh).
    pub total_energy_kwh: f64,
    /// Heating cost over the run.
    pub total_cost: f64,
    /// Mean interior temperature (°C).
    pub mean_interior_c: f64,
    /// Lowest interior temperature (°C).
    pub min_interior_c: f64,
    /// Highest interior temperature (°C).
    pub max_interior_c: f64,
    /// Integral of the shortfall below the comfort minimum (K·h).
    pub degree_hours_below: f64,
    /// Integral of the excess above the comfort maximum (K·h).
    pub degree_hours_above: f64,
    /// Ticks whose resulting temperature left the comfort band.
    pub ticks_outside_band: usize,
    /// Ticks flagged as degraded.
    pub degraded_ticks: usize,
    /// Ticks where the predictive solve fell back.
    pub solver_fallbacks: usize,
    /// External commands discarded as stale.
    pub stale_commands: usize,
    /// Ticks driven by an external command.
    pub external_ticks: usize,
}

impl KpiReport {
    /// Computes all KPIs from the complete record slice.
    ///
    /// # Arguments
    ///
    /// * `records` - Tick records of a run, in order
    /// * `band` - Comfort band the run is judged against
    ///
    /// # Returns
    ///
    /// A `KpiReport`; every field is zero for an empty run.
    pub fn from_records(records: &[TickRecord], band: &ComfortBand) -> Self {
        if records.is_empty() {
            return Self::default();
        }

        let mut report = Self {
            ticks: records.len(),
            min_interior_c: f64::INFINITY,
            max_interior_c: f64::NEG_INFINITY,
            ..Self::default()
        };
        let mut temp_sum = 0.0;

        for r in records {
            let dt_h = (r.state_at - r.time).num_milliseconds() as f64 / 3_600_000.0;
            let t = r.interior_c;

            report.total_energy_kwh += r.energy_kwh;
            report.total_cost += r.cost;
            temp_sum += t;
            report.min_interior_c = report.min_interior_c.min(t);
            report.max_interior_c = report.max_interior_c.max(t);

            if t < band.min_c {
                report.degree_hours_below += (band.min_c - t) * dt_h;
            }
            if t > band.max_c {
                report.degree_hours_above += (t - band.max_c) * dt_h;
            }
            if !band.contains(t) {
                report.ticks_outside_band += 1;
            }
            if r.degraded() {
                report.degraded_ticks += 1;
            }
            if r.source == CommandSource::External {
                report.external_ticks += 1;
            }
            for event in &r.events {
                match event {
                    TickEvent::SolverFallback { .. } => report.solver_fallbacks += 1,
                    TickEvent::StaleCommand { .. } => report.stale_commands += 1,
                    TickEvent::InvalidInput { .. } | TickEvent::ScenarioClamped => {}
                }
            }
        }

        report.mean_interior_c = temp_sum / records.len() as f64;
        report
    }
}

impl fmt::Display for KpiReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "--- KPI Report ---")?;
        writeln!(f, "Ticks:                 {}", self.ticks)?;
        writeln!(f, "Heating energy:        {:.3} kWh", self.total_energy_kwh)?;
        writeln!(f, "Heating cost:          {:.3}", self.total_cost)?;
        writeln!(
            f,
            "Interior temperature:  mean {:.2} °C (min {:.2}, max {:.2})",
            self.mean_interior_c, self.min_interior_c, self.max_interior_c
        )?;
        writeln!(
            f,
            "Discomfort:            {:.2} K·h below, {:.2} K·h above ({} ticks outside band)",
            self.degree_hours_below, self.degree_hours_above, self.ticks_outside_band
        )?;
        writeln!(
            f,
            "Degraded ticks:        {} ({} solver fallbacks)",
            self.degraded_ticks, self.solver_fallbacks
        )?;
        write!(
            f,
            "External commands:     {} applied, {} stale",
            self.external_ticks, self.stale_commands
        )
    }
}

//! Shared test fixtures for integration tests.
#![allow(dead_code)]

use chrono::{NaiveDate, NaiveDateTime, TimeDelta};

use thermal_twin::scenario::{Scenario, ScenarioMeta, ScenarioProvider, ScenarioSample};
use thermal_twin::sim::clock::VirtualClock;
use thermal_twin::sim::controller::Controller;
use thermal_twin::sim::engine::Engine;
use thermal_twin::sim::thermal::{BuildingParams, ThermalModel};
use thermal_twin::tariff::{TariffTable, TariffTier};

/// Zone used by every fixture.
pub const ZONE: &str = "living_room";

/// Midnight, 15 January 2026.
pub fn t0() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2026, 1, 15)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .expect("valid timestamp")
}

/// `count` samples `step` apart starting at [`t0`], built by `f(index)`.
pub fn samples(
    count: usize,
    step: TimeDelta,
    f: impl Fn(usize) -> (f64, f64, TariffTier),
) -> Vec<ScenarioSample> {
    (0..count)
        .map(|i| {
            let (exterior_c, solar_w_m2, tariff) = f(i);
            ScenarioSample {
                time: t0() + step * i as i32,
                exterior_c,
                solar_w_m2,
                tariff,
            }
        })
        .collect()
}

/// Scenario of `count` constant samples: dark, low tier, at `exterior_c`.
pub fn flat_scenario(count: usize, step: TimeDelta, exterior_c: f64) -> Scenario {
    scenario(samples(count, step, |_| (exterior_c, 0.0, TariffTier::Low)), step)
}

/// Wraps samples into a scenario whose sample step is `step`.
pub fn scenario(samples: Vec<ScenarioSample>, step: TimeDelta) -> Scenario {
    Scenario::new(
        ScenarioMeta {
            name: "fixture".into(),
            sample_step: step,
            speed_factor: 0.0,
        },
        samples,
    )
    .expect("valid fixture scenario")
}

/// Single-node building: R = 0.01 K/W, C = 1 MJ/K, 2 kW heater (τ = 10⁴ s).
pub fn small_r1c1() -> ThermalModel {
    ThermalModel::new(BuildingParams::r1c1(0.01, 1.0e6, 2000.0)).expect("valid model")
}

/// Engine over `scenario` running `ticks` ticks of `step` from [`t0`].
pub fn engine<C: Controller>(
    scenario: Scenario,
    model: ThermalModel,
    step: TimeDelta,
    ticks: i32,
    initial_c: f64,
    controller: C,
) -> Engine<C> {
    let clock = VirtualClock::new(t0(), t0() + step * ticks, step).expect("valid clock");
    let provider = ScenarioProvider::new(scenario, step).expect("valid provider");
    let initial = model.uniform_state(initial_c);
    Engine::new(
        ZONE,
        clock,
        provider,
        model,
        TariffTable::default(),
        initial,
        controller,
    )
    .expect("valid engine")
}

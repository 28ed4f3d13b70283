//! Integration tests for paced runs driven through the control channel.

mod common;

use std::time::Duration;

use chrono::TimeDelta;
use tokio::sync::mpsc;

use thermal_twin::sim::clock::{ClockState, Pacing};
use thermal_twin::sim::controller::BaselineController;
use thermal_twin::sim::engine::{ControlMessage, Engine};
use thermal_twin::sim::optimizer::{
    HorizonOptimizer, HorizonProblem, HorizonSolution, SolveError,
};
use thermal_twin::sim::predictive::{PredictiveController, PredictiveSettings};
use thermal_twin::sim::types::{CommandSource, ZoneCommand};
use thermal_twin::tariff::TariffTable;
use thermal_twin::telemetry::{ProgressLogger, forward_records};

const STEP_MINUTES: i64 = 15;

fn paced_engine(ticks: i32) -> Engine<BaselineController> {
    let step = TimeDelta::minutes(STEP_MINUTES);
    common::engine(
        common::flat_scenario(ticks as usize, step, 0.0),
        thermal_twin::sim::thermal::ThermalModel::new(
            thermal_twin::sim::thermal::BuildingParams::default(),
        )
        .expect("valid model"),
        step,
        ticks,
        19.0,
        BaselineController::around(20.0, 0.5).expect("valid"),
    )
}

/// Plans full heat, but only after sleeping for `delay`.
#[derive(Debug)]
struct SlowFullHeat {
    delay: Duration,
}

impl HorizonOptimizer for SlowFullHeat {
    fn name(&self) -> &'static str {
        "slow-full-heat"
    }

    fn solve(
        &self,
        problem: &HorizonProblem,
        _guess: Option<&[f64]>,
    ) -> Result<HorizonSolution, SolveError> {
        std::thread::sleep(self.delay);
        Ok(HorizonSolution {
            commands: vec![1.0; problem.len()],
            temperatures: vec![problem.initial_c; problem.len()],
            cost: 0.0,
            iterations: 1,
        })
    }
}

fn fast() -> Pacing {
    Pacing::Accelerated {
        tick_interval: Duration::from_millis(1),
    }
}

#[tokio::test]
async fn accelerated_run_forwards_every_record() {
    let (_control_tx, control_rx) = mpsc::channel(8);
    let (record_tx, record_rx) = mpsc::channel(4);
    let forwarder = tokio::spawn(forward_records(
        record_rx,
        vec![Box::new(ProgressLogger::new())],
    ));

    let engine = paced_engine(12)
        .run_paced(fast(), control_rx, record_tx)
        .await
        .expect("paced run completes");
    let records = forwarder.await.expect("forwarder joins");

    assert_eq!(engine.clock().state(), ClockState::Stopped);
    assert_eq!(records.len(), 12);
    for (k, r) in records.iter().enumerate() {
        assert_eq!(r.tick, k as u64);
    }
}

#[tokio::test]
async fn commands_sent_over_the_channel_apply_at_their_tick() {
    let (control_tx, control_rx) = mpsc::channel(8);
    let (record_tx, mut record_rx) = mpsc::channel(16);
    let target = common::t0() + TimeDelta::minutes(3 * STEP_MINUTES);
    control_tx
        .send(ControlMessage::Command(ZoneCommand {
            zone: common::ZONE.into(),
            percent: 35.0,
            target: Some(target),
        }))
        .await
        .expect("send");

    paced_engine(6)
        .run_paced(Pacing::Batch, control_rx, record_tx)
        .await
        .expect("paced run completes");

    let mut records = Vec::new();
    while let Ok(r) = record_rx.try_recv() {
        records.push(r);
    }
    assert_eq!(records.len(), 6);
    assert_eq!(records[3].source, CommandSource::External);
    assert!((records[3].command_pct - 35.0).abs() < 1e-9);
    assert!(records.iter().filter(|r| r.source == CommandSource::External).count() == 1);
}

#[tokio::test]
async fn pause_then_resume_still_completes() {
    let (control_tx, control_rx) = mpsc::channel(8);
    let (record_tx, mut record_rx) = mpsc::channel(16);
    control_tx.send(ControlMessage::Pause).await.expect("send");
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        let _ = control_tx.send(ControlMessage::Resume).await;
    });

    let engine = paced_engine(8)
        .run_paced(fast(), control_rx, record_tx)
        .await
        .expect("paced run completes");

    let mut count = 0;
    while record_rx.try_recv().is_ok() {
        count += 1;
    }
    assert_eq!(count, 8);
    assert_eq!(engine.clock().ticks(), 8);
}

#[tokio::test]
async fn stop_ends_a_slow_run_early() {
    let (control_tx, control_rx) = mpsc::channel(8);
    let (record_tx, mut record_rx) = mpsc::channel(128);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let _ = control_tx.send(ControlMessage::Stop).await;
    });
    let slow = Pacing::Accelerated {
        tick_interval: Duration::from_millis(20),
    };

    let engine = paced_engine(100)
        .run_paced(slow, control_rx, record_tx)
        .await
        .expect("stopped run is not an error");

    let mut count = 0;
    while record_rx.try_recv().is_ok() {
        count += 1;
    }
    assert!(count < 100, "stop should cut the run short, saw {count} ticks");
    assert_eq!(engine.clock().state(), ClockState::Stopped);
}

#[tokio::test]
async fn command_received_during_a_solve_applies_on_the_next_tick() {
    let step = TimeDelta::minutes(STEP_MINUTES);
    let model = common::small_r1c1();
    let controller = PredictiveController::new(
        &model,
        Box::new(SlowFullHeat {
            delay: Duration::from_millis(200),
        }),
        TariffTable::default(),
        BaselineController::around(20.0, 0.5).expect("valid"),
        PredictiveSettings {
            horizon: 4,
            ..PredictiveSettings::default()
        },
    )
    .expect("valid controller");
    let engine = common::engine(
        common::flat_scenario(3, step, 0.0),
        model,
        step,
        3,
        18.0,
        controller,
    );

    let (control_tx, control_rx) = mpsc::channel(8);
    let (record_tx, mut record_rx) = mpsc::channel(8);
    // Lands while the first tick's solve is still sleeping.
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let _ = control_tx
            .send(ControlMessage::Command(ZoneCommand {
                zone: common::ZONE.into(),
                percent: 25.0,
                target: None,
            }))
            .await;
    });

    let engine = engine
        .run_paced(Pacing::Batch, control_rx, record_tx)
        .await
        .expect("paced run completes");

    let mut records = Vec::new();
    while let Ok(r) = record_rx.try_recv() {
        records.push(r);
    }
    assert_eq!(records.len(), 3);
    assert_eq!(engine.clock().ticks(), 3);

    // The first tick keeps the decision it was waiting for.
    assert_eq!(records[0].source, CommandSource::Predictive);
    assert_eq!(records[0].command_pct, 100.0);
    // The buffered command wins the next tick and the solve result does not replace it.
    assert_eq!(records[1].source, CommandSource::External);
    assert!((records[1].command_pct - 25.0).abs() < 1e-9);
    assert_eq!(records[2].source, CommandSource::Predictive);
    assert_eq!(records[2].command_pct, 100.0);
}

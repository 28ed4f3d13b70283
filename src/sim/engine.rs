//! Simulation engine: the per-tick protocol and its batch and paced drivers.
//!
//! Every tick runs the same five steps, in this order:
//!
//! 1. resolve the external conditions at the current virtual time;
//! 2. obtain a command from the active controller (or the command channel);
//! 3. advance the thermal state by one step;
//! 4. publish the new state and virtual time;
//! 5. advance the virtual clock.
//!
//! Batch and paced runs share this protocol and differ only in pacing.

use chrono::NaiveDateTime;
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::error::{TwinError, ensure_finite};
use crate::scenario::{OutOfRangePolicy, ScenarioProvider};
use crate::tariff::TariffTable;
use crate::telemetry::Publisher;

use super::clock::{ClockState, Pacing, VirtualClock};
use super::controller::{ControlInput, Controller, Decision};
use super::sensor::SensorNoise;
use super::thermal::ThermalModel;
use super::types::{
    ActuatorCommand, CommandSource, ExternalConditions, ThermalState, TickEvent, TickRecord,
    ZoneCommand, format_time,
};

/// Message accepted by a paced run while it is running.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    /// Suspend ticking.
    Pause,
    /// Resume ticking.
    Resume,
    /// Stop the run after the current tick.
    Stop,
    /// External actuator command.
    Command(ZoneCommand),
}

#[derive(Debug, Clone, Copy)]
struct PendingCommand {
    command: ActuatorCommand,
    target: Option<NaiveDateTime>,
}

/// Output of protocol steps 1 and 2a, before a command is chosen.
struct Prepared {
    time: NaiveDateTime,
    conditions: ExternalConditions,
    input: ControlInput,
    external: Option<ActuatorCommand>,
    events: Vec<TickEvent>,
}

/// Everything a tick touches except the controller.
///
/// Kept apart from the controller so that a paced run can hand the
/// controller to a blocking worker while the core keeps serving messages.
struct TickCore {
    zone: String,
    clock: VirtualClock,
    provider: ScenarioProvider,
    model: ThermalModel,
    tariff: TariffTable,
    state: ThermalState,
    last_command: ActuatorCommand,
    cumulative_cost: f64,
    policy: OutOfRangePolicy,
    sensor: SensorNoise,
    inbox: Vec<PendingCommand>,
    pending_events: Vec<TickEvent>,
    publishers: Vec<Box<dyn Publisher>>,
}

impl TickCore {
    fn prepare(&mut self, horizon: usize) -> Result<Option<Prepared>, TwinError> {
        if self.clock.state() != ClockState::Running {
            return Err(TwinError::InvalidTransition {
                from: self.clock.state(),
                action: "tick",
            });
        }
        let time = self.clock.now();
        let mut events = std::mem::take(&mut self.pending_events);

        // 1. external conditions
        let conditions = match self.policy {
            OutOfRangePolicy::Terminate => match self.provider.conditions_at(time) {
                Ok(c) => c,
                Err(e @ TwinError::OutOfRange { .. }) => {
                    warn!(zone = %self.zone, time = %format_time(time), error = %e, "scenario exhausted, stopping clock");
                    self.clock.stop();
                    self.pending_events = events;
                    return Ok(None);
                }
                Err(e) => return Err(e),
            },
            OutOfRangePolicy::Clamp => {
                let (c, clamped) = self.provider.conditions_at_clamped(time)?;
                if clamped {
                    debug!(zone = %self.zone, time = %format_time(time), "scenario clamped to last sample");
                    events.push(TickEvent::ScenarioClamped);
                }
                c
            }
        };

        // 2a. controller input
        let forecast: Vec<_> = self
            .provider
            .forecast_clamped(time, horizon.max(1))?
            .collect();
        let external = self.take_external(time);
        let input = ControlInput {
            time,
            state: self.state,
            current: conditions,
            forecast,
            previous: self.last_command,
            dt_s: self.clock.step_seconds(),
        };
        Ok(Some(Prepared {
            time,
            conditions,
            input,
            external,
            events,
        }))
    }

    /// Removes the commands due at `time`; the last one submitted wins.
    fn take_external(&mut self, time: NaiveDateTime) -> Option<ActuatorCommand> {
        let mut applied = None;
        self.inbox.retain(|p| {
            if p.target.is_none_or(|t| t <= time) {
                applied = Some(p.command);
                false
            } else {
                true
            }
        });
        applied
    }

    fn complete(&mut self, prepared: Prepared, decision: Decision) -> Result<TickRecord, TwinError> {
        let Prepared {
            time,
            conditions,
            mut events,
            ..
        } = prepared;
        if let Some(reason) = decision.fallback {
            events.push(TickEvent::SolverFallback { reason });
        }
        let dt_s = self.clock.step_seconds();

        // 3. thermal step; a rejected step holds the state with the heater off
        let (next, command) = match self.model.step(&self.state, &conditions, decision.command, dt_s) {
            Ok(next) => (next, decision.command),
            Err(e) if !e.is_fatal() => {
                warn!(
                    zone = %self.zone,
                    time = %format_time(time),
                    requested_pct = decision.command.percent(),
                    error = %e,
                    "thermal step rejected, holding state"
                );
                events.push(TickEvent::InvalidInput {
                    reason: e.to_string(),
                });
                (self.state, ActuatorCommand::OFF)
            }
            Err(e) => return Err(e),
        };
        let heater_w = self.model.heater_w(command);
        let energy_kwh = heater_w * dt_s / 3.6e6;
        let price_per_kwh = self.tariff.price_per_kwh(conditions.tariff);
        let cost = energy_kwh * price_per_kwh;
        self.cumulative_cost += cost;

        let record = TickRecord {
            tick: self.clock.ticks(),
            time,
            state_at: time + self.clock.step(),
            zone: self.zone.clone(),
            interior_c: next.interior_c,
            envelope_c: next.envelope_c,
            measured_c: self.sensor.measure(next.interior_c),
            exterior_c: conditions.exterior_c,
            solar_w_m2: conditions.solar_w_m2,
            solar_gain_w: self.model.solar_gain_w(conditions.solar_w_m2),
            tariff: conditions.tariff,
            price_per_kwh,
            command_pct: command.percent(),
            heater_w,
            energy_kwh,
            cost,
            cumulative_cost: self.cumulative_cost,
            source: decision.source,
            events,
        };
        self.state = next;
        self.last_command = command;

        // 4. publish
        for publisher in &mut self.publishers {
            if let Err(e) = publisher.publish(&record) {
                warn!(zone = %self.zone, tick = record.tick, error = %e, "publisher failed");
            }
        }

        // 5. advance virtual time
        self.clock.advance()?;
        Ok(record)
    }

    fn submit_command(&mut self, cmd: ZoneCommand) -> Result<(), TwinError> {
        if cmd.zone != self.zone {
            return Err(TwinError::InvalidInput(format!(
                "command addressed to unknown zone `{}` (this twin is `{}`)",
                cmd.zone, self.zone
            )));
        }
        let command = ActuatorCommand::from_percent(cmd.percent)?;
        let now = self.clock.now();
        if let Some(target) = cmd.target {
            if target < now {
                warn!(
                    zone = %cmd.zone,
                    target = %format_time(target),
                    now = %format_time(now),
                    "discarding stale command"
                );
                self.pending_events.push(TickEvent::StaleCommand {
                    zone: cmd.zone.clone(),
                    target,
                });
                return Err(TwinError::StaleCommand {
                    zone: cmd.zone,
                    target,
                    now,
                });
            }
        }
        debug!(zone = %self.zone, percent = cmd.percent, target = ?cmd.target, "external command queued");
        self.inbox.push(PendingCommand {
            command,
            target: cmd.target,
        });
        Ok(())
    }

    fn handle_control(&mut self, msg: ControlMessage) {
        let now = format_time(self.clock.now());
        match msg {
            ControlMessage::Pause => match self.clock.pause() {
                Ok(()) => info!(zone = %self.zone, time = %now, "clock paused"),
                Err(e) => warn!(error = %e, "pause ignored"),
            },
            ControlMessage::Resume => match self.clock.resume() {
                Ok(()) => info!(zone = %self.zone, time = %now, "clock resumed"),
                Err(e) => warn!(error = %e, "resume ignored"),
            },
            ControlMessage::Stop => {
                self.clock.stop();
                info!(zone = %self.zone, time = %now, "stop requested");
            }
            ControlMessage::Command(cmd) => {
                if let Err(e) = self.submit_command(cmd) {
                    debug!(error = %e, "external command rejected");
                }
            }
        }
    }

    fn flush_publishers(&mut self) {
        for publisher in &mut self.publishers {
            if let Err(e) = publisher.flush() {
                warn!(zone = %self.zone, error = %e, "publisher flush failed");
            }
        }
    }
}

fn external_decision(command: ActuatorCommand) -> Decision {
    Decision {
        command,
        source: CommandSource::External,
        fallback: None,
    }
}

/// Thermal twin of one zone driven by a controller.
///
/// Generic over `C: Controller` for static dispatch; use
/// [`AnyController`](super::controller::AnyController) to choose at run time.
pub struct Engine<C: Controller> {
    core: TickCore,
    controller: C,
}

impl<C: Controller> Engine<C> {
    /// Creates an engine in the `Initialized` state.
    ///
    /// # Arguments
    ///
    /// * `zone` - Zone identifier used on the command and sensor channels
    /// * `clock` - Virtual clock; its step is the thermal step
    /// * `provider` - Scenario queried at the clock's step
    /// * `model` - Thermal model of the zone
    /// * `tariff` - Prices used for the cost bookkeeping
    /// * `initial` - Initial thermal state
    /// * `controller` - Active controller
    ///
    /// # Errors
    ///
    /// Returns [`TwinError::InvalidInput`] if the clock and provider steps
    /// differ, the step breaks the model's stability bound, or the initial
    /// state is malformed; [`TwinError::OutOfRange`] if the clock starts
    /// before the scenario.
    pub fn new(
        zone: impl Into<String>,
        clock: VirtualClock,
        provider: ScenarioProvider,
        model: ThermalModel,
        tariff: TariffTable,
        initial: ThermalState,
        controller: C,
    ) -> Result<Self, TwinError> {
        if provider.step() != clock.step() {
            return Err(TwinError::InvalidInput(format!(
                "scenario provider step {} differs from clock step {}",
                provider.step(),
                clock.step()
            )));
        }
        let dt_s = clock.step_seconds();
        if dt_s > model.max_stable_dt_s() {
            return Err(TwinError::InvalidInput(format!(
                "step of {dt_s} s exceeds the explicit-Euler bound {:.1} s",
                model.max_stable_dt_s()
            )));
        }
        check_state(&model, &initial)?;
        let scenario = provider.scenario();
        if clock.start_time() < scenario.start() {
            return Err(TwinError::OutOfRange {
                requested: clock.start_time(),
                start: scenario.start(),
                end: scenario.end(),
            });
        }
        Ok(Self {
            core: TickCore {
                zone: zone.into(),
                clock,
                provider,
                model,
                tariff,
                state: initial,
                last_command: ActuatorCommand::OFF,
                cumulative_cost: 0.0,
                policy: OutOfRangePolicy::default(),
                sensor: SensorNoise::exact(),
                inbox: Vec::new(),
                pending_events: Vec::new(),
                publishers: Vec::new(),
            },
            controller,
        })
    }

    /// Sets what happens when the clock outruns the scenario.
    pub fn with_out_of_range_policy(mut self, policy: OutOfRangePolicy) -> Self {
        self.core.policy = policy;
        self
    }

    /// Replaces the exact sensor with a noisy one.
    pub fn with_sensor(mut self, sensor: SensorNoise) -> Self {
        self.core.sensor = sensor;
        self
    }

    /// Adds a publisher called at step 4 of every tick.
    pub fn add_publisher(&mut self, publisher: Box<dyn Publisher>) {
        self.core.publishers.push(publisher);
    }

    /// Zone identifier.
    pub fn zone(&self) -> &str {
        &self.core.zone
    }

    /// Virtual clock.
    pub fn clock(&self) -> &VirtualClock {
        &self.core.clock
    }

    /// Current thermal state (read-only snapshot).
    pub fn state(&self) -> ThermalState {
        self.core.state
    }

    /// Command applied during the last tick.
    pub fn last_command(&self) -> ActuatorCommand {
        self.core.last_command
    }

    /// Cost accumulated so far.
    pub fn cumulative_cost(&self) -> f64 {
        self.core.cumulative_cost
    }

    /// Starts the clock.
    ///
    /// # Errors
    ///
    /// Returns [`TwinError::InvalidTransition`] unless `Initialized`.
    pub fn start(&mut self) -> Result<(), TwinError> {
        self.core.clock.start()
    }

    /// Pauses the clock.
    ///
    /// # Errors
    ///
    /// Returns [`TwinError::InvalidTransition`] unless running.
    pub fn pause(&mut self) -> Result<(), TwinError> {
        self.core.clock.pause()
    }

    /// Resumes the clock.
    ///
    /// # Errors
    ///
    /// Returns [`TwinError::InvalidTransition`] unless paused.
    pub fn resume(&mut self) -> Result<(), TwinError> {
        self.core.clock.resume()
    }

    /// Stops the clock.
    pub fn stop(&mut self) {
        self.core.clock.stop();
    }

    /// Queues an external command for this zone.
    ///
    /// A command without a target applies at the next tick; with a target it
    /// applies at the first tick at or after the target. It overrides the
    /// controller for that tick.
    ///
    /// # Errors
    ///
    /// [`TwinError::InvalidInput`] for another zone or a percentage outside
    /// `[0, 100]`; [`TwinError::StaleCommand`] if the target is already past.
    /// A stale command is also reported as an event of the next tick.
    pub fn submit_command(&mut self, cmd: ZoneCommand) -> Result<(), TwinError> {
        self.core.submit_command(cmd)
    }

    /// Replaces the thermal state outside the tick protocol.
    ///
    /// # Errors
    ///
    /// Returns [`TwinError::InvalidInput`] if the state is malformed or does
    /// not match the model's node count.
    pub fn reset_state(&mut self, state: ThermalState) -> Result<(), TwinError> {
        check_state(&self.core.model, &state)?;
        info!(zone = %self.core.zone, interior_c = state.interior_c, "thermal state reset");
        self.core.state = state;
        Ok(())
    }

    /// Runs one tick of the protocol.
    ///
    /// Returns `Ok(None)` if the scenario ran out and the clock stopped instead.
    ///
    /// # Errors
    ///
    /// [`TwinError::InvalidTransition`] unless the clock is running, and the
    /// fatal [`TwinError::Timeline`] from the clock.
    pub fn tick(&mut self) -> Result<Option<TickRecord>, TwinError> {
        let Some(prepared) = self.core.prepare(self.controller.horizon())? else {
            return Ok(None);
        };
        // 2b. command
        let decision = match prepared.external {
            Some(command) => external_decision(command),
            None => self.controller.decide(&prepared.input),
        };
        self.core.complete(prepared, decision).map(Some)
    }

    /// Runs to completion without wall-clock pacing.
    ///
    /// Starts the clock if needed and returns every tick record.
    ///
    /// # Errors
    ///
    /// Propagates fatal errors from [`Engine::tick`].
    pub fn run(&mut self) -> Result<Vec<TickRecord>, TwinError> {
        if self.core.clock.state() == ClockState::Initialized {
            self.core.clock.start()?;
        }
        info!(
            zone = %self.core.zone,
            controller = self.controller.name(),
            start = %format_time(self.core.clock.now()),
            end = %format_time(self.core.clock.end()),
            ticks = self.core.clock.total_ticks(),
            "batch run started"
        );
        let mut records = Vec::with_capacity(self.core.clock.total_ticks() as usize);
        while self.core.clock.state() == ClockState::Running {
            if let Some(record) = self.tick()? {
                records.push(record);
            }
        }
        self.core.flush_publishers();
        info!(
            zone = %self.core.zone,
            ticks = records.len(),
            cost = self.core.cumulative_cost,
            "batch run finished"
        );
        Ok(records)
    }
}

impl<C: Controller + 'static> Engine<C> {
    /// Runs with wall-clock pacing, serving control messages between ticks.
    ///
    /// The controller decides on a blocking worker thread. The tick waits
    /// for that decision; control messages arriving meanwhile are buffered
    /// and applied once the tick completes. Each record is sent to
    /// `observer` after the tick; a dropped observer is not an error.
    ///
    /// Returns the engine once the clock stops.
    ///
    /// # Errors
    ///
    /// Fatal errors: [`TwinError::Timeline`], or [`TwinError::Worker`] if the
    /// controller worker panics.
    pub async fn run_paced(
        self,
        pacing: Pacing,
        mut control: mpsc::Receiver<ControlMessage>,
        observer: mpsc::Sender<TickRecord>,
    ) -> Result<Self, TwinError> {
        let Engine {
            mut core,
            mut controller,
        } = self;
        if core.clock.state() == ClockState::Initialized {
            core.clock.start()?;
        }
        let mut interval = match pacing {
            Pacing::Batch => None,
            Pacing::Accelerated { tick_interval } => {
                let mut iv = time::interval(tick_interval);
                iv.set_missed_tick_behavior(MissedTickBehavior::Delay);
                Some(iv)
            }
        };
        info!(
            zone = %core.zone,
            controller = controller.name(),
            pacing = ?pacing,
            start = %format_time(core.clock.now()),
            end = %format_time(core.clock.end()),
            "paced run started"
        );

        let mut control_open = true;
        let mut buffered = Vec::new();
        loop {
            match core.clock.state() {
                ClockState::Stopped => break,
                ClockState::Paused => {
                    if !control_open {
                        warn!(zone = %core.zone, "control channel closed while paused, stopping");
                        core.clock.stop();
                        continue;
                    }
                    match control.recv().await {
                        Some(msg) => core.handle_control(msg),
                        None => control_open = false,
                    }
                    if core.clock.state() == ClockState::Running {
                        if let Some(iv) = interval.as_mut() {
                            iv.reset();
                        }
                    }
                    continue;
                }
                ClockState::Initialized | ClockState::Running => {}
            }

            match interval.as_mut() {
                Some(iv) => {
                    tokio::select! {
                        _ = iv.tick() => {}
                        msg = control.recv(), if control_open => {
                            match msg {
                                Some(msg) => core.handle_control(msg),
                                None => control_open = false,
                            }
                            continue;
                        }
                    }
                }
                None => {
                    while control_open {
                        match control.try_recv() {
                            Ok(msg) => core.handle_control(msg),
                            Err(TryRecvError::Empty) => break,
                            Err(TryRecvError::Disconnected) => control_open = false,
                        }
                    }
                    tokio::task::yield_now().await;
                    if core.clock.state() != ClockState::Running {
                        continue;
                    }
                }
            }

            let Some(prepared) = core.prepare(controller.horizon())? else {
                continue;
            };
            let decision = match prepared.external {
                Some(command) => external_decision(command),
                None => {
                    let input = prepared.input.clone();
                    let mut worker = tokio::task::spawn_blocking(move || {
                        let decision = controller.decide(&input);
                        (controller, decision)
                    });
                    let joined = loop {
                        tokio::select! {
                            joined = &mut worker => break joined,
                            msg = control.recv(), if control_open => match msg {
                                Some(msg) => buffered.push(msg),
                                None => control_open = false,
                            },
                        }
                    };
                    let (returned, decision) = joined.map_err(|e| TwinError::Worker(e.to_string()))?;
                    controller = returned;
                    decision
                }
            };
            let record = core.complete(prepared, decision)?;
            for msg in buffered.drain(..) {
                core.handle_control(msg);
            }
            if observer.send(record).await.is_err() {
                debug!(zone = %core.zone, "observer dropped, records are no longer forwarded");
            }
        }

        core.flush_publishers();
        info!(
            zone = %core.zone,
            ticks = core.clock.ticks(),
            cost = core.cumulative_cost,
            "paced run finished"
        );
        Ok(Engine { core, controller })
    }
}

fn check_state(model: &ThermalModel, state: &ThermalState) -> Result<(), TwinError> {
    ensure_finite("interior_c", state.interior_c)?;
    match (model.has_envelope(), state.envelope_c) {
        (true, Some(envelope_c)) => {
            ensure_finite("envelope_c", envelope_c)?;
            Ok(())
        }
        (false, None) => Ok(()),
        (true, None) => Err(TwinError::InvalidInput(
            "the model has an envelope node but the state has no envelope temperature".into(),
        )),
        (false, Some(_)) => Err(TwinError::InvalidInput(
            "the state has an envelope temperature but the model has no envelope node".into(),
        )),
    }
}

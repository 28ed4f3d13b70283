//! Logging setup and the boundary publishers of the twin.
//!
//! Publishers stand in for the message-bus transport: they receive every tick
//! record and render it for a channel (time sync, sensor readings, progress).

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use chrono::NaiveDate;
use serde::Serialize;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use crate::error::TwinError;
use crate::io::export::{WriteMode, open_for_write};
use crate::sim::types::{TickRecord, format_time};

/// Installs the global `tracing` subscriber.
///
/// The filter comes from `RUST_LOG` (default `info`). Logs go to stderr, as
/// JSON when `json` is set. A second call is a no-op.
pub fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    let json_layer = json.then(|| fmt::layer().json().with_writer(std::io::stderr));
    let text_layer = (!json).then(|| fmt::layer().with_writer(std::io::stderr));
    // try_init fails only when a subscriber is already installed.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .try_init();
}

/// Consumer of tick records.
pub trait Publisher: Send {
    /// Publishes one tick.
    ///
    /// # Errors
    ///
    /// Returns an I/O or serialization error; the engine logs it and carries on.
    fn publish(&mut self, record: &TickRecord) -> Result<(), TwinError>;

    /// Flushes buffered output at the end of a run.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if flushing fails.
    fn flush(&mut self) -> Result<(), TwinError> {
        Ok(())
    }
}

#[derive(Serialize)]
#[serde(tag = "channel", rename_all = "snake_case")]
enum ChannelMessage<'a> {
    Clock {
        time: String,
    },
    Sensor {
        zone: &'a str,
        time: String,
        temperature_c: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        envelope_c: Option<f64>,
        measured_c: f64,
        exterior_c: f64,
        solar_gain_w: f64,
        heater_w: f64,
        valve_pct: f64,
        energy_kwh: f64,
        price_per_kwh: f64,
        cost: f64,
        cumulative_cost: f64,
        degraded: bool,
    },
}

/// Writes a `clock` line and a `sensor` line per tick as JSON.
///
/// The clock line carries the tick's virtual time in the sortable
/// `%Y-%m-%dT%H:%M:%S` format; the sensor line is tagged with the zone and
/// stamped with the time the new state belongs to.
#[derive(Debug)]
pub struct JsonLinesPublisher<W: Write + Send> {
    out: W,
}

impl<W: Write + Send> JsonLinesPublisher<W> {
    /// Wraps a writer.
    pub fn new(out: W) -> Self {
        Self { out }
    }
}

impl JsonLinesPublisher<BufWriter<File>> {
    /// Opens a JSON lines file; `mode` decides whether earlier lines are kept.
    ///
    /// # Errors
    ///
    /// Returns [`TwinError::Io`] if the file cannot be opened.
    pub fn open(path: &Path, mode: WriteMode) -> Result<Self, TwinError> {
        let (file, _) = open_for_write(path, mode)?;
        Ok(Self::new(BufWriter::new(file)))
    }
}

impl<W: Write + Send> Publisher for JsonLinesPublisher<W> {
    fn publish(&mut self, record: &TickRecord) -> Result<(), TwinError> {
        let clock = ChannelMessage::Clock {
            time: format_time(record.time),
        };
        let sensor = ChannelMessage::Sensor {
            zone: &record.zone,
            time: format_time(record.state_at),
            temperature_c: record.interior_c,
            envelope_c: record.envelope_c,
            measured_c: record.measured_c,
            exterior_c: record.exterior_c,
            solar_gain_w: record.solar_gain_w,
            heater_w: record.heater_w,
            valve_pct: record.command_pct,
            energy_kwh: record.energy_kwh,
            price_per_kwh: record.price_per_kwh,
            cost: record.cost,
            cumulative_cost: record.cumulative_cost,
            degraded: record.degraded(),
        };
        for message in [clock, sensor] {
            serde_json::to_writer(&mut self.out, &message)
                .map_err(|e| TwinError::Io(e.into()))?;
            self.out.write_all(b"\n")?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), TwinError> {
        self.out.flush()?;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct DaySummary {
    date: Option<NaiveDate>,
    ticks: usize,
    energy_kwh: f64,
    cost: f64,
    temp_sum_c: f64,
    degraded: usize,
}

/// Logs one `info` line per simulated day.
#[derive(Debug, Default)]
pub struct ProgressLogger {
    day: DaySummary,
}

impl ProgressLogger {
    /// Creates a logger with no day in progress.
    pub fn new() -> Self {
        Self::default()
    }

    fn log_day(&mut self) {
        let day = std::mem::take(&mut self.day);
        if let Some(date) = day.date {
            info!(
                day = %date,
                ticks = day.ticks,
                energy_kwh = day.energy_kwh,
                cost = day.cost,
                mean_interior_c = day.temp_sum_c / day.ticks.max(1) as f64,
                degraded_ticks = day.degraded,
                "simulated day complete"
            );
        }
    }
}

impl Publisher for ProgressLogger {
    fn publish(&mut self, record: &TickRecord) -> Result<(), TwinError> {
        let date = record.time.date();
        if self.day.date != Some(date) {
            self.log_day();
            self.day.date = Some(date);
        }
        self.day.ticks += 1;
        self.day.energy_kwh += record.energy_kwh;
        self.day.cost += record.cost;
        self.day.temp_sum_c += record.interior_c;
        if record.degraded() {
            self.day.degraded += 1;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), TwinError> {
        self.log_day();
        Ok(())
    }
}

/// Feeds records from a paced run's observer channel to `publishers`.
///
/// Returns every record received once the channel closes.
pub async fn forward_records(
    mut records: mpsc::Receiver<TickRecord>,
    mut publishers: Vec<Box<dyn Publisher>>,
) -> Vec<TickRecord> {
    let mut seen = Vec::new();
    while let Some(record) = records.recv().await {
        for publisher in &mut publishers {
            if let Err(e) = publisher.publish(&record) {
                warn!(tick = record.tick, error = %e, "publisher failed");
            }
        }
        seen.push(record);
    }
    for publisher in &mut publishers {
        if let Err(e) = publisher.flush() {
            warn!(error = %e, "publisher flush failed");
        }
    }
    seen
}

/// Resolves on Ctrl-C, or on SIGTERM on unix.
///
/// If a handler cannot be installed the failure is logged and that signal is
/// never observed.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! { _ = ctrl_c => {}, _ = terminate => {}, }
    info!("shutdown signal received");
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDateTime;

    use super::*;
    use crate::sim::types::{CommandSource, TickEvent};
    use crate::tariff::TariffTier;

    fn record(tick: u64, time: NaiveDateTime) -> TickRecord {
        TickRecord {
            tick,
            time,
            state_at: time + chrono::TimeDelta::minutes(15),
            zone: "living_room".into(),
            interior_c: 20.0,
            envelope_c: None,
            measured_c: 20.1,
            exterior_c: 3.0,
            solar_w_m2: 0.0,
            solar_gain_w: 0.0,
            tariff: TariffTier::Low,
            price_per_kwh: 0.13,
            command_pct: 50.0,
            heater_w: 2000.0,
            energy_kwh: 0.5,
            cost: 0.065,
            cumulative_cost: 0.065,
            source: CommandSource::Predictive,
            events: vec![TickEvent::ScenarioClamped],
        }
    }

    fn at(hour: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 1, 15)
            .and_then(|d| d.and_hms_opt(hour, 0, 0))
            .expect("valid timestamp")
    }

    #[test]
    fn json_lines_emit_clock_then_sensor() {
        let mut buf = Vec::new();
        JsonLinesPublisher::new(&mut buf)
            .publish(&record(0, at(6)))
            .expect("publish");
        let text = String::from_utf8(buf).expect("utf8");
        let lines: Vec<serde_json::Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).expect("json line"))
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["channel"], "clock");
        assert_eq!(lines[0]["time"], "2026-01-15T06:00:00");
        assert_eq!(lines[1]["channel"], "sensor");
        assert_eq!(lines[1]["zone"], "living_room");
        assert_eq!(lines[1]["time"], "2026-01-15T06:15:00");
        assert_eq!(lines[1]["degraded"], true);
        assert!(lines[1].get("envelope_c").is_none());
    }

    #[test]
    fn json_lines_file_appends_unless_reset() {
        let path = std::env::temp_dir().join(format!("thermal-twin-sensor-{}.jsonl", std::process::id()));
        let write_one = |mode| {
            let mut p = JsonLinesPublisher::open(&path, mode).expect("open");
            p.publish(&record(0, at(6))).expect("publish");
            p.flush().expect("flush");
        };
        write_one(WriteMode::Reset);
        write_one(WriteMode::Append);
        let lines = std::fs::read_to_string(&path).expect("read").lines().count();
        assert_eq!(lines, 4);
        write_one(WriteMode::Reset);
        let lines = std::fs::read_to_string(&path).expect("read").lines().count();
        assert_eq!(lines, 2);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn progress_logger_tracks_days() {
        let mut p = ProgressLogger::new();
        p.publish(&record(0, at(22))).expect("publish");
        p.publish(&record(1, at(23))).expect("publish");
        assert_eq!(p.day.ticks, 2);
        let next_day = at(0) + chrono::TimeDelta::days(1);
        p.publish(&record(2, next_day)).expect("publish");
        assert_eq!(p.day.ticks, 1);
        assert_eq!(p.day.date, Some(next_day.date()));
        p.flush().expect("flush");
        assert_eq!(p.day.date, None);
    }

    #[tokio::test]
    async fn forward_records_drains_channel() {
        let (tx, rx) = mpsc::channel(4);
        tx.send(record(0, at(1))).await.expect("send");
        tx.send(record(1, at(2))).await.expect("send");
        drop(tx);
        let seen = forward_records(rx, vec![Box::new(ProgressLogger::new())]).await;
        assert_eq!(seen.len(), 2);
    }
}

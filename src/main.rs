//! Thermal twin entry point: CLI wiring, batch and real-time runs.

use std::io::BufRead;
use std::path::PathBuf;
use std::process;
use std::thread;

use tokio::sync::mpsc;
use tracing::{info, warn};

use thermal_twin::config::{ControllerKind, TwinConfig};
use thermal_twin::error::TwinError;
use thermal_twin::io::export::{CsvPublisher, WriteMode, export_csv};
use thermal_twin::sim::clock::Pacing;
use thermal_twin::sim::controller::AnyController;
use thermal_twin::sim::engine::{ControlMessage, Engine};
use thermal_twin::sim::kpi::KpiReport;
use thermal_twin::sim::types::{TickRecord, ZoneCommand};
use thermal_twin::telemetry::{
    JsonLinesPublisher, ProgressLogger, Publisher, forward_records, init_tracing,
    shutdown_signal,
};

/// Parsed CLI arguments.
#[derive(Debug, Default, PartialEq)]
struct CliArgs {
    scenario_path: Option<PathBuf>,
    preset: Option<String>,
    start: Option<String>,
    end: Option<String>,
    mode: Option<ControllerKind>,
    reset: bool,
    telemetry_out: Option<PathBuf>,
    sensor_out: Option<PathBuf>,
    realtime: bool,
    speed: Option<f64>,
    log_json: bool,
}

fn print_help() {
    eprintln!("thermal-twin: thermal digital twin with predictive heating control");
    eprintln!();
    eprintln!("Usage: thermal-twin [OPTIONS]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --scenario <path>        Load configuration from a TOML file");
    eprintln!(
        "  --preset <name>          Use a built-in preset ({})",
        TwinConfig::PRESETS.join(", ")
    );
    eprintln!("  --start <time>           First tick, %Y-%m-%dT%H:%M:%S");
    eprintln!("  --end <time>             End of the run (exclusive)");
    eprintln!("  --mode <controller>      predictive or baseline");
    eprintln!("  --reset                  Truncate output files instead of appending");
    eprintln!("  --telemetry-out <path>   Write tick records to CSV");
    eprintln!("  --sensor-out <path>      Write clock and sensor records as JSON lines");
    eprintln!("  --realtime               Pace ticks and read commands from stdin");
    eprintln!("  --speed <factor>         Virtual seconds per wall-clock second (0 = flat out)");
    eprintln!("  --log-json               Emit logs as JSON");
    eprintln!("  --help                   Show this help message");
    eprintln!();
    eprintln!("If no --scenario or --preset is given, the baseline preset is used.");
    eprintln!("In real-time mode each stdin line is `pause`, `resume`, `stop`, or a command");
    eprintln!("such as {{\"zone\": \"living_room\", \"valve_position\": 40}}.");
}

fn parse_args_from(args: &[String]) -> Result<CliArgs, String> {
    let mut cli = CliArgs::default();
    let mut i = 0;
    while i < args.len() {
        let flag = args[i].as_str();
        let mut value = || {
            i += 1;
            args.get(i)
                .cloned()
                .ok_or_else(|| format!("{flag} requires an argument"))
        };
        match flag {
            "--scenario" => cli.scenario_path = Some(PathBuf::from(value()?)),
            "--preset" => cli.preset = Some(value()?),
            "--start" => cli.start = Some(value()?),
            "--end" => cli.end = Some(value()?),
            "--mode" => {
                let mode = value()?;
                cli.mode = Some(match mode.as_str() {
                    "predictive" => ControllerKind::Predictive,
                    "baseline" => ControllerKind::Baseline,
                    _ => {
                        return Err(format!(
                            "--mode value \"{mode}\" must be \"predictive\" or \"baseline\""
                        ));
                    }
                });
            }
            "--reset" => cli.reset = true,
            "--telemetry-out" => cli.telemetry_out = Some(PathBuf::from(value()?)),
            "--sensor-out" => cli.sensor_out = Some(PathBuf::from(value()?)),
            "--realtime" => cli.realtime = true,
            "--speed" => {
                let raw = value()?;
                match raw.parse::<f64>() {
                    Ok(s) if s.is_finite() && s >= 0.0 => cli.speed = Some(s),
                    _ => return Err(format!("--speed value \"{raw}\" is not a factor >= 0")),
                }
            }
            "--log-json" => cli.log_json = true,
            other => return Err(format!("unknown argument \"{other}\"")),
        }
        i += 1;
    }

    if cli.scenario_path.is_some() && cli.preset.is_some() {
        return Err("--scenario and --preset are mutually exclusive".to_string());
    }
    Ok(cli)
}

fn parse_args() -> CliArgs {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_help();
        process::exit(0);
    }
    match parse_args_from(&args) {
        Ok(cli) => cli,
        Err(e) => {
            eprintln!("error: {e}");
            print_help();
            process::exit(1);
        }
    }
}

fn load_config(cli: &CliArgs) -> Result<TwinConfig, TwinError> {
    let mut cfg = match (&cli.scenario_path, &cli.preset) {
        (Some(path), _) => TwinConfig::from_toml_file(path)?,
        (None, Some(name)) => TwinConfig::from_preset(name)?,
        (None, None) => TwinConfig::baseline(),
    };
    let s = &mut cfg.simulation;
    if let Some(start) = &cli.start {
        s.start = Some(start.clone());
    }
    if let Some(end) = &cli.end {
        s.end = Some(end.clone());
    }
    if let Some(mode) = cli.mode {
        s.controller = mode;
    }
    if let Some(speed) = cli.speed {
        s.speed_factor = speed;
    }
    Ok(cfg)
}

/// Parses one stdin line into a control message.
fn parse_control_line(line: &str) -> Result<ControlMessage, String> {
    match line.trim() {
        "pause" => Ok(ControlMessage::Pause),
        "resume" => Ok(ControlMessage::Resume),
        "stop" => Ok(ControlMessage::Stop),
        json => serde_json::from_str::<ZoneCommand>(json)
            .map(ControlMessage::Command)
            .map_err(|e| format!("not a control word or command: {e}")),
    }
}

/// Forwards stdin lines to the control channel from a dedicated thread.
///
/// The thread is detached so a pending read never holds the process open.
fn spawn_stdin_reader(control: mpsc::Sender<ControlMessage>) {
    thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    warn!(error = %e, "stdin read failed");
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            match parse_control_line(&line) {
                Ok(msg) => {
                    if control.blocking_send(msg).is_err() {
                        break;
                    }
                }
                Err(e) => warn!(input = %line.trim(), error = %e, "ignoring stdin line"),
            }
        }
    });
}

async fn run_realtime(
    engine: Engine<AnyController>,
    speed_factor: f64,
    telemetry: Vec<Box<dyn Publisher>>,
) -> Result<Vec<TickRecord>, TwinError> {
    let pacing = Pacing::from_speed_factor(engine.clock().step(), speed_factor)?;
    let (control_tx, control_rx) = mpsc::channel(64);
    let (record_tx, record_rx) = mpsc::channel(256);

    spawn_stdin_reader(control_tx.clone());
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = control_tx.send(ControlMessage::Stop).await;
    });
    let forwarder = tokio::spawn(forward_records(record_rx, telemetry));

    let engine = engine.run_paced(pacing, control_rx, record_tx).await?;
    info!(
        zone = engine.zone(),
        ticks = engine.clock().ticks(),
        cost = engine.cumulative_cost(),
        last_command_pct = engine.last_command().percent(),
        "real-time run ended"
    );
    forwarder
        .await
        .map_err(|e| TwinError::Worker(format!("record forwarder: {e}")))
}

async fn run(cfg: &TwinConfig, cli: &CliArgs) -> Result<Vec<TickRecord>, TwinError> {
    let mode = if cli.reset {
        WriteMode::Reset
    } else {
        WriteMode::Append
    };
    let mut engine = cfg.build_engine()?;
    engine.add_publisher(Box::new(ProgressLogger::new()));
    if let Some(path) = &cli.sensor_out {
        engine.add_publisher(Box::new(JsonLinesPublisher::open(path, mode)?));
    }

    if !cli.realtime {
        let records = engine.run()?;
        if let Some(path) = &cli.telemetry_out {
            export_csv(&records, path, mode)?;
            info!(path = %path.display(), "telemetry written");
        }
        return Ok(records);
    }

    let mut telemetry: Vec<Box<dyn Publisher>> = Vec::new();
    if let Some(path) = &cli.telemetry_out {
        telemetry.push(Box::new(CsvPublisher::open(path, mode)?));
    }
    run_realtime(engine, cfg.simulation.speed_factor, telemetry).await
}

#[tokio::main]
async fn main() {
    let cli = parse_args();
    init_tracing(cli.log_json);

    let cfg = match load_config(&cli) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("{e}");
            process::exit(1);
        }
    };
    let errors = cfg.validate();
    if !errors.is_empty() {
        for e in &errors {
            eprintln!("{e}");
        }
        process::exit(1);
    }

    let records = match run(&cfg, &cli).await {
        Ok(records) => records,
        Err(e) => {
            eprintln!("error: {e}");
            process::exit(1);
        }
    };

    if !cli.realtime {
        for r in &records {
            println!("{r}");
        }
    }
    let kpi = KpiReport::from_records(&records, &cfg.comfort);
    println!("\n{kpi}");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parses_every_flag() {
        let cli = parse_args_from(&args(&[
            "--preset",
            "cold_snap",
            "--start",
            "2026-01-15T06:00:00",
            "--end",
            "2026-01-16T06:00:00",
            "--mode",
            "baseline",
            "--reset",
            "--telemetry-out",
            "out.csv",
            "--sensor-out",
            "sensor.jsonl",
            "--realtime",
            "--speed",
            "3600",
            "--log-json",
        ]))
        .expect("parse should succeed");
        assert_eq!(cli.preset.as_deref(), Some("cold_snap"));
        assert_eq!(cli.mode, Some(ControllerKind::Baseline));
        assert!(cli.reset && cli.realtime && cli.log_json);
        assert_eq!(cli.speed, Some(3600.0));
        assert_eq!(cli.telemetry_out, Some(PathBuf::from("out.csv")));
    }

    #[test]
    fn rejects_bad_arguments() {
        assert!(parse_args_from(&args(&["--mode", "bang-bang"])).is_err());
        assert!(parse_args_from(&args(&["--speed", "-1"])).is_err());
        assert!(parse_args_from(&args(&["--preset"])).is_err());
        assert!(parse_args_from(&args(&["--frobnicate"])).is_err());
        assert!(
            parse_args_from(&args(&["--scenario", "a.toml", "--preset", "baseline"])).is_err()
        );
    }

    #[test]
    fn overrides_apply_to_preset() {
        let cli = parse_args_from(&args(&["--mode", "baseline", "--speed", "60"]))
            .expect("parse should succeed");
        let cfg = load_config(&cli).expect("baseline preset");
        assert_eq!(cfg.simulation.controller, ControllerKind::Baseline);
        assert_eq!(cfg.simulation.speed_factor, 60.0);
    }

    #[test]
    fn control_lines() {
        assert_eq!(parse_control_line(" pause "), Ok(ControlMessage::Pause));
        assert_eq!(parse_control_line("stop"), Ok(ControlMessage::Stop));
        let msg = parse_control_line(
            r#"{"zone": "living_room", "valve_position": 40, "sim_time": "2026-01-15T06:00:00"}"#,
        )
        .expect("command parses");
        let ControlMessage::Command(cmd) = msg else {
            panic!("expected a command");
        };
        assert_eq!(cmd.zone, "living_room");
        assert_eq!(cmd.percent, 40.0);
        assert!(cmd.target.is_some());
        assert!(parse_control_line("open the window").is_err());
    }
}

//! End-to-end tests of the command-line entry point.

use std::process::Command;

fn run_cli(args: &[&str]) -> String {
    let output = Command::new(env!("CARGO_BIN_EXE_thermal-twin"))
        .args(args)
        .output()
        .expect("thermal-twin process should run");
    assert!(
        output.status.success(),
        "run failed for {args:?}: stderr={}",
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8(output.stdout).expect("stdout should be valid UTF-8")
}

fn parse_metric(stdout: &str, label: &str, unit: &str) -> f64 {
    let line = stdout
        .lines()
        .find(|line| line.trim_start().starts_with(label))
        .unwrap_or_else(|| panic!("missing KPI line `{label}` in output: {stdout}"));
    let raw = line
        .split_once(':')
        .map(|(_, right)| right.trim())
        .unwrap_or_else(|| panic!("invalid KPI format for line `{line}`"));
    let numeric = raw.strip_suffix(unit).unwrap_or(raw).trim();
    numeric
        .parse::<f64>()
        .unwrap_or_else(|_| panic!("failed parsing `{numeric}` from KPI line `{line}`"))
}

#[test]
fn presets_run_with_distinct_costs() {
    let common = ["--mode", "baseline", "--end", "2026-01-16T00:00:00"];
    let r1c1 = run_cli(&[&["--preset", "r1c1"][..], &common[..]].concat());
    let cold = run_cli(&[&["--preset", "cold_snap"][..], &common[..]].concat());

    let ticks = parse_metric(&r1c1, "Ticks:", "");
    assert_eq!(ticks, 96.0);
    let r1c1_cost = parse_metric(&r1c1, "Heating cost:", "");
    let cold_cost = parse_metric(&cold, "Heating cost:", "");
    assert!(
        cold_cost > r1c1_cost,
        "cold snap should cost more: cold_snap={cold_cost:.3}, r1c1={r1c1_cost:.3}"
    );
}

#[test]
fn scenario_file_and_csv_weather() {
    let stdout = run_cli(&["--scenario", "scenarios/csv_weather.toml"]);
    // Twelve hourly samples at a 15-minute step.
    assert_eq!(parse_metric(&stdout, "Ticks:", ""), 48.0);
}

#[test]
fn telemetry_reset_then_append() {
    let dir = std::env::temp_dir();
    let csv = dir.join(format!("thermal-twin-cli-{}.csv", std::process::id()));
    let jsonl = dir.join(format!("thermal-twin-cli-{}.jsonl", std::process::id()));
    let csv_arg = csv.to_str().expect("utf-8 temp path");
    let jsonl_arg = jsonl.to_str().expect("utf-8 temp path");
    let window = [
        "--preset",
        "r1c1",
        "--mode",
        "baseline",
        "--start",
        "2026-01-15T06:00:00",
        "--end",
        "2026-01-15T08:00:00",
    ];

    let outputs = ["--telemetry-out", csv_arg, "--sensor-out", jsonl_arg];
    run_cli(&[&window[..], &["--reset"][..], &outputs[..]].concat());
    run_cli(&[&window[..], &outputs[..]].concat());

    let text = std::fs::read_to_string(&csv).expect("telemetry written");
    assert_eq!(text.lines().filter(|l| l.starts_with("tick,")).count(), 1);
    assert_eq!(text.lines().count(), 1 + 2 * 8);

    let sensor = std::fs::read_to_string(&jsonl).expect("sensor stream written");
    assert_eq!(sensor.lines().count(), 2 * 2 * 8);
    assert!(sensor.lines().next().is_some_and(|l| l.contains("\"channel\":\"clock\"")));

    run_cli(&[&window[..], &["--reset", "--sensor-out", jsonl_arg][..]].concat());
    let sensor = std::fs::read_to_string(&jsonl).expect("sensor stream rewritten");
    assert_eq!(sensor.lines().count(), 2 * 8);

    let _ = std::fs::remove_file(&csv);
    let _ = std::fs::remove_file(&jsonl);
}

#[test]
fn invalid_arguments_fail() {
    let output = Command::new(env!("CARGO_BIN_EXE_thermal-twin"))
        .args(["--preset", "tropical"])
        .output()
        .expect("thermal-twin process should run");
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("unknown preset"));
}

#[test]
fn unusable_speed_factor_is_a_config_error() {
    let output = Command::new(env!("CARGO_BIN_EXE_thermal-twin"))
        .args(["--preset", "r1c1", "--realtime", "--speed", "1e-300"])
        .output()
        .expect("thermal-twin process should run");
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("simulation.speed_factor"));
}

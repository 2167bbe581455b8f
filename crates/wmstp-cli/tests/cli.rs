use std::fs;
use std::path::Path;
use std::process::{Command, Output};
use tempfile::TempDir;

fn wmstp(data: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_wmstp"))
        .arg("--data")
        .arg(data)
        .args(args)
        .output()
        .expect("failed to run wmstp")
}

fn dataset() -> TempDir {
    let dir = TempDir::new().unwrap();
    fs::write(
        dir.path().join("network_params.json"),
        r#"{
            "N_exc": 100, "f": 0.1, "p": 2,
            "item_loading": {"nstim": 1, "pop_id": [0], "origin": [100.0]},
            "nonspecific_readout_signals": {"nstim": 1, "origin": [1500.0]}
        }"#,
    )
    .unwrap();
    fs::write(
        dir.path().join("simulation_params.json"),
        r#"{"t_sim": 2000.0, "eta_end_origin": 1800.0}"#,
    )
    .unwrap();

    let mut burst = String::new();
    for id in 1..=10 {
        burst.push_str(&format!("{}.0 {}\n", id, 500.0 + id as f64));
    }
    burst.push_str("3.0 1900.0\n");
    fs::write(dir.path().join("spikedata0.dat"), burst).unwrap();
    fs::write(dir.path().join("spikedata1.dat"), "11.0 300.0\n15.0 1200.5\n").unwrap();
    dir
}

#[test]
fn stp_writes_cache() {
    let dir = dataset();
    let out = wmstp(dir.path(), &["--set", "analysis.dt=10", "stp"]);
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));

    let cache = dir.path().join("stp_params");
    for stem in ["std_x_avg", "std_u_avg", "std_x_std", "std_u_std", "stp_time", "stp_key"] {
        assert!(cache.join(format!("{}_0.dat", stem)).exists(), "{}", stem);
        assert!(cache.join(format!("{}_1.dat", stem)).exists(), "{}", stem);
    }
    let times = fs::read_to_string(cache.join("stp_time_0.dat")).unwrap();
    assert_eq!(times.lines().count(), 200);

    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("Population 0 (10 units)"));
}

#[test]
fn ps_writes_report() {
    let dir = dataset();
    let out = wmstp(dir.path(), &["ps", "--panel", "A"]);
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));

    let report: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(dir.path().join("PS_data.json")).unwrap()).unwrap();
    assert_eq!(report["panel"], "A");
    assert_eq!(report["targeted_pop"], 0);
    assert_eq!(report["pop_0"]["ps"], 1);
    assert_eq!(report["pop_0"]["ps_before_test"], 1);
    assert_eq!(report["pop_1"]["ps"], 0);
}

#[test]
fn unknown_override_is_rejected() {
    let dir = dataset();
    let out = wmstp(dir.path(), &["--set", "network.bogus=1", "params"]);
    assert!(!out.status.success());

    let out = wmstp(dir.path(), &["--set", "analysis.decimals=2", "params"]);
    assert!(out.status.success());
    let resolved: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(resolved["analysis"]["decimals"], 2);
    assert_eq!(resolved["network"]["N_exc"], 100);
}

#[test]
fn rates_write_delay_rate_change() {
    let dir = dataset();
    fs::write(
        dir.path().join("simulation_params.json"),
        r#"{
            "t_sim": 2000.0, "eta_end_origin": 1800.0,
            "recording_params": {"fraction_pop_recorded": 1.0, "spike_recording_params": {"start": 50.0}}
        }"#,
    )
    .unwrap();
    let out_dir = dir.path().join("rates");
    let out = wmstp(dir.path(), &["rates", "--output", out_dir.to_str().unwrap()]);
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    assert!(String::from_utf8_lossy(&out.stdout).contains("delay vs spontaneous"));

    // Every recorded neuron of pop 0 fires once in the 1050 ms delay period
    let table = fs::read_to_string(out_dir.join("delta_fr_0.dat")).unwrap();
    let rows: Vec<Vec<f64>> = table
        .lines()
        .map(|line| line.split_whitespace().map(|v| v.parse().unwrap()).collect())
        .collect();
    assert_eq!(rows.len(), 10);
    assert_eq!(rows[0][0], 1.0);
    for row in &rows {
        assert!((row[1] - 1000.0 / 1050.0).abs() < 1e-9);
    }
    assert!(out_dir.join("delta_fr_1.dat").exists());
}

use std::process::Command;

use serde_json::Value;

fn run_and_capture(args: &[&str]) -> Value {
    let output = Command::new(env!("CARGO_BIN_EXE_sbw-cli"))
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .expect("run sbw-cli");
    if !output.status.success() {
        panic!(
            "CLI command {:?} failed: status={:?}\nstdout={}\nstderr={}",
            args,
            output.status,
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
    }
    serde_json::from_slice(&output.stdout).expect("theme output is JSON")
}

#[test]
fn theme_without_overrides_prints_defaults() {
    let report = run_and_capture(&["theme"]);
    assert_eq!(report["version"], 1);
    assert_eq!(report["variables"]["--sbw-width"], "380px");
    assert_eq!(report["variables"]["--sbw-primary-color"], "#6366f1");
    assert_eq!(report["position"], "bottom-right");
    assert!(report["fallbacks"].as_array().unwrap().is_empty());
}

#[test]
fn theme_reports_fields_that_fell_back() {
    let report = run_and_capture(&[
        "theme",
        "--overrides",
        r##"{"width": 9000, "primaryColor": "#112233", "position": "bottom-left"}"##,
    ]);
    assert_eq!(report["variables"]["--sbw-width"], "380px");
    assert_eq!(report["variables"]["--sbw-primary-color"], "#112233");
    assert_eq!(report["position"], "bottom-left");
    let fields: Vec<&str> = report["fallbacks"]
        .as_array()
        .unwrap()
        .iter()
        .map(|entry| entry["field"].as_str().unwrap())
        .collect();
    assert_eq!(fields, vec!["width"]);
}

#[test]
fn invalid_json_overrides_fail() {
    let output = Command::new(env!("CARGO_BIN_EXE_sbw-cli"))
        .args(["theme", "--overrides", "{not json"])
        .output()
        .expect("run sbw-cli");
    assert!(!output.status.success());
}

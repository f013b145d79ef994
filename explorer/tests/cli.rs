//! CLI tests: spawn the explorer binary and check output and exit codes.

use std::process::Command;

use explorer::exit_codes;
use explorer::io::config::load_config;

fn explorer() -> Command {
    Command::new(env!("CARGO_BIN_EXE_explorer"))
}

#[test]
fn steps_prints_steps_and_opening_hint() {
    let output = explorer()
        .args([
            "steps",
            "[Login Flow]\n1. Tap email field\n2. Tap password field\n3. Tap submit",
        ])
        .output()
        .expect("explorer steps");

    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(
        stdout,
        "Login Flow\n1. Tap email field\n2. Tap password field\n3. Tap submit\nStart by tap email field\n"
    );
}

#[test]
fn init_writes_config_and_refuses_to_overwrite() {
    let temp = tempfile::tempdir().expect("tempdir");

    let status = explorer()
        .current_dir(temp.path())
        .args(["init", "--app", "com.example"])
        .status()
        .expect("explorer init");
    assert_eq!(status.code(), Some(exit_codes::OK));
    let cfg = load_config(&temp.path().join("explorer.toml")).expect("load");
    assert_eq!(cfg.exploration.app_id, "com.example");

    let status = explorer()
        .current_dir(temp.path())
        .arg("init")
        .status()
        .expect("explorer init again");
    assert_eq!(status.code(), Some(exit_codes::INVALID));

    let status = explorer()
        .current_dir(temp.path())
        .args(["init", "--force"])
        .status()
        .expect("explorer init --force");
    assert_eq!(status.code(), Some(exit_codes::OK));
}

#[test]
fn run_without_target_app_is_invalid() {
    let temp = tempfile::tempdir().expect("tempdir");
    let output = explorer()
        .current_dir(temp.path())
        .arg("run")
        .output()
        .expect("explorer run");

    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    assert!(String::from_utf8_lossy(&output.stderr).contains("app_id"));
}

#[test]
fn oracle_mode_requires_an_oracle_command() {
    let temp = tempfile::tempdir().expect("tempdir");
    let output = explorer()
        .current_dir(temp.path())
        .args(["run", "--app", "com.example", "--mode", "oracle-guided"])
        .output()
        .expect("explorer run");

    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    assert!(String::from_utf8_lossy(&output.stderr).contains("oracle.command"));
}

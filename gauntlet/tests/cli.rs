//! CLI tests: spawn the binary and check exit codes and report output.

use std::process::Command;

use gauntlet::exit_codes;
use serde_json::Value;

#[test]
fn missing_target_exits_aborted_with_json_report() {
    let temp = tempfile::tempdir().expect("tempdir");
    let source = temp.path().join("app.py");
    std::fs::write(&source, "x = 1\n").expect("source");

    let output = Command::new(env!("CARGO_BIN_EXE_gauntlet"))
        .current_dir(temp.path())
        .env_remove("RUST_LOG")
        .arg(temp.path().join("missing"))
        .arg("--source")
        .arg(&source)
        .args(["--dest", "app.py", "--mode", "apply", "--format", "json"])
        .output()
        .expect("run gauntlet");

    assert_eq!(output.status.code(), Some(exit_codes::ABORTED));
    let report: Value = serde_json::from_slice(&output.stdout).expect("json report");
    assert_eq!(report["status"], "FAILURE");
    assert_eq!(report["error"]["kind"], "input");
    assert_eq!(report["steps"], Value::Array(Vec::new()));
}

#[test]
fn report_is_also_written_to_output_file() {
    let temp = tempfile::tempdir().expect("tempdir");
    let report_path = temp.path().join("out").join("report.txt");

    let status = Command::new(env!("CARGO_BIN_EXE_gauntlet"))
        .current_dir(temp.path())
        .arg(temp.path())
        .args(["--source", "nope.py", "--dest", "app.py", "--mode", "apply"])
        .arg("--output")
        .arg(&report_path)
        .status()
        .expect("run gauntlet");

    assert_eq!(status.code(), Some(exit_codes::ABORTED));
    let text = std::fs::read_to_string(&report_path).expect("report file");
    assert!(text.contains("status: FAILURE"), "{text}");
}

#[test]
fn unknown_mode_is_rejected_by_argument_parsing() {
    let status = Command::new(env!("CARGO_BIN_EXE_gauntlet"))
        .args([".", "--source", "a.py", "--dest", "a.py", "--mode", "yolo"])
        .status()
        .expect("run gauntlet");
    assert_eq!(status.code(), Some(2));
}

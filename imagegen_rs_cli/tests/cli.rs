use std::{fs, path::Path};

use assert_cmd::Command;
use predicates::prelude::*;

fn imagegen() -> Command {
    let mut cmd = Command::cargo_bin("imagegen").unwrap();
    cmd.env_remove("RUST_LOG").arg("--cpu").arg("--silent");
    cmd
}

/// The final stderr line must be `{"error": "..."}`; returns the message.
fn error_message(stderr: &[u8]) -> String {
    let stderr = String::from_utf8_lossy(stderr);
    let last = stderr.lines().last().expect("stderr is empty");
    let value: serde_json::Value = serde_json::from_str(last).expect("last line is not JSON");
    let message = value["error"].as_str().expect("no `error` field").to_string();
    assert!(!message.is_empty());
    message
}

#[test]
fn missing_prompt_is_a_usage_error() {
    imagegen()
        .args(["--model_path", "somewhere"])
        .assert()
        .code(2)
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("--prompt"));
}

#[test]
fn missing_model_path_is_a_usage_error() {
    imagegen()
        .args(["--prompt", "a cat"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("--model_path"));
}

#[test]
fn missing_overlay_reports_json_error() {
    let dir = tempfile::tempdir().unwrap();
    let output = imagegen()
        .arg("--model_path")
        .arg(dir.path())
        .args(["--prompt", "a cat"])
        .assert()
        .code(1)
        .stdout(predicate::str::is_empty())
        .get_output()
        .clone();

    let message = error_message(&output.stderr);
    assert!(message.contains("pytorch_lora_weights.safetensors"), "{message}");
}

#[test]
fn malformed_overlay_reports_json_error() {
    let dir = tempfile::tempdir().unwrap();
    let overlay = dir.path().join("model/pytorch_lora_weights.safetensors");
    fs::create_dir_all(overlay.parent().unwrap()).unwrap();
    fs::write(&overlay, b"\x00\x01garbage").unwrap();

    let output = imagegen()
        .arg("--model-path")
        .arg(dir.path())
        .args(["--prompt", "a cat"])
        .assert()
        .code(1)
        .stdout(predicate::str::is_empty())
        .get_output()
        .clone();

    let message = error_message(&output.stderr);
    assert!(message.contains("failed to load weight overlay"), "{message}");
}

#[test]
fn zero_steps_is_rejected() {
    let output = imagegen()
        .arg("--model_path")
        .arg(Path::new("unused"))
        .args(["--prompt", "a cat", "--steps", "0"])
        .assert()
        .code(1)
        .stdout(predicate::str::is_empty())
        .get_output()
        .clone();

    let message = error_message(&output.stderr);
    assert!(message.contains("steps"), "{message}");
}

use std::process::Command;

use crate::common::init_test_logging;

fn phonehomed() -> Command {
    Command::new(env!("CARGO_BIN_EXE_phonehomed"))
}

#[test]
fn test_phonehomed_help_includes_usage() {
    init_test_logging();
    crate::test_log!("TEST START: test_phonehomed_help_includes_usage");

    let output = phonehomed()
        .arg("--help")
        .output()
        .expect("Failed to run phonehomed --help");

    assert!(output.status.success(), "phonehomed --help failed");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("phonehomed"), "unexpected help: {stdout}");
    assert!(stdout.contains("--once"), "unexpected help: {stdout}");

    crate::test_log!("TEST PASS: test_phonehomed_help_includes_usage");
}

#[test]
fn test_print_config_layers_env_and_flags() {
    init_test_logging();
    let output = phonehomed()
        .args(["--print-config", "--port", "9123", "--once"])
        .env("PHONEHOME_READ_TIMEOUT", "3s")
        .env("PHONEHOME_PORT", "9000")
        .output()
        .expect("Failed to run phonehomed --print-config");

    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("port = 9123"), "flags should win: {stdout}");
    assert!(stdout.contains("mode = \"single_shot\""), "{stdout}");
    assert!(stdout.contains("read_timeout = \"3s\""), "{stdout}");
}

#[test]
fn test_invalid_environment_is_fatal() {
    init_test_logging();
    let output = phonehomed()
        .arg("--print-config")
        .env("PHONEHOME_WAIT_TIMEOUT", "soon")
        .output()
        .expect("Failed to run phonehomed");

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("PHONEHOME_WAIT_TIMEOUT"), "stderr: {stderr}");
}

#[test]
fn test_config_file_is_loaded() {
    init_test_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("phonehome.toml");
    std::fs::write(
        &path,
        "callback_endpoint = \"http://10.0.0.1:8555/phonehome\"\nwait_timeout = \"2m\"\n",
    )
    .unwrap();

    let output = phonehomed()
        .arg("--config")
        .arg(&path)
        .arg("--print-config")
        .output()
        .expect("Failed to run phonehomed");

    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("http://10.0.0.1:8555/phonehome"), "{stdout}");
    assert!(stdout.contains("wait_timeout = \"2m\""), "{stdout}");
}

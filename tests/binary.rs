// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `veil` binary exits non-zero when it cannot start.

mod common;

use serial_test::serial;
use std::process::{Command, Output};

fn run_veil(configure: impl FnOnce(&mut Command)) -> Output {
    let mut command = Command::new(env!("CARGO_BIN_EXE_veil"));
    command.env_remove("VEIL_CONFIG_FILE");
    configure(&mut command);
    command.output().expect("failed to run veil binary")
}

#[test]
#[serial]
fn test_missing_config_file_from_env() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("absent.toml");

    let output = run_veil(|cmd| {
        cmd.env("VEIL_CONFIG_FILE", &missing);
    });

    assert!(!output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stdout.contains(missing.to_str().unwrap()), "{stdout}");
    assert!(stderr.contains("Failed to build proxy"), "{stderr}");
}

#[test]
#[serial]
fn test_config_path_from_argument() {
    let output = run_veil(|cmd| {
        cmd.arg("/definitely/not/here.yaml");
    });

    assert!(!output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("/definitely/not/here.yaml"), "{stdout}");
}

#[test]
#[serial]
fn test_invalid_target_exits_non_zero() {
    let file = common::write_config("[proxy]\ntarget_url = \"not a url\"\n");

    let output = run_veil(|cmd| {
        cmd.env("VEIL_CONFIG_FILE", file.path());
    });

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("proxy.target_url"), "{stderr}");
}

// Veriboard - Embedded Board Emulation Platform
// Copyright (C) 2026 The Veriboard Authors
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use std::io::Write;
use std::process::Command;

fn veriboard() -> Command {
    Command::new(env!("CARGO_BIN_EXE_veriboard"))
}

#[test]
fn test_missing_config_file_exits_with_config_error() {
    let output = veriboard()
        .arg("/nonexistent/board.cfg")
        .output()
        .expect("binary runs");
    assert_eq!(output.status.code(), Some(2));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("/nonexistent/board.cfg"), "stderr: {stderr}");
}

#[test]
fn test_bad_device_type_exits_with_config_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("board.cfg");
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(b"[devices]\norder: x0\n[x0]\ntype: warpdrive\nbase: 0\n")
        .unwrap();
    let output = veriboard().arg(&path).output().expect("binary runs");
    assert_eq!(output.status.code(), Some(2));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("warpdrive"), "stderr: {stderr}");
}

#[test]
fn test_no_arguments_is_a_usage_error() {
    let output = veriboard().output().expect("binary runs");
    assert_ne!(output.status.code(), Some(0));
}

// Veriboard - Embedded Board Emulation Platform
// Copyright (C) 2026 The Veriboard Authors
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use std::io::Write;
use veriboard_config::{Config, ConfigError};

#[test]
fn test_read_file_merges_with_first_seen_priority() {
    let dir = tempfile::tempdir().unwrap();
    let user = dir.path().join("user.cfg");
    let board = dir.path().join("board.cfg");
    std::fs::File::create(&user)
        .unwrap()
        .write_all(b"[gdebug]\nhost: 127.0.0.1\nport: 2159\n")
        .unwrap();
    std::fs::File::create(&board)
        .unwrap()
        .write_all(b"[gdebug]\nport: 4711\n[dram0]\nsize: 16M\n")
        .unwrap();

    let mut cfg = Config::new();
    cfg.read_file(&user).unwrap();
    cfg.read_file(&board).unwrap();

    // User file loaded first, so its port wins.
    assert_eq!(cfg.read_int32("gdebug", "port").unwrap(), 2159);
    assert_eq!(cfg.read_var("gdebug", "host"), Some("127.0.0.1"));
    assert_eq!(cfg.read_var("dram0", "size"), Some("16M"));
}

#[test]
fn test_missing_file_is_an_error() {
    let mut cfg = Config::new();
    let err = cfg.read_file("/nonexistent/veriboard.cfg").unwrap_err();
    assert!(matches!(err, ConfigError::Read { .. }));
}

#[test]
fn test_section_state_carries_across_add_string_calls() {
    let mut cfg = Config::new();
    cfg.add_string("[poll_detector]\n");
    cfg.add_string("sensivity: 10\n");
    assert_eq!(cfg.read_uint32("poll_detector", "sensivity").unwrap(), 10);
}

#[test]
fn test_example_configuration_shape() {
    let mut cfg = Config::new();
    cfg.add_string(
        "[global]\n\
         imagedir: /var/lib/emu\n\
         libpath:  /opt/emu/lib:/usr/local/lib/emu\n\
         libs:     libflash.so libeth.so\n\
         [gdebug]\n\
         host: 127.0.0.1\n\
         port: 2159\n\
         [poll_detector]\n\
         sensivity: 10\n\
         jump_width: 0\n\
         threshold: 0\n",
    );
    assert_eq!(
        cfg.read_list("global", "libs"),
        vec!["libflash.so", "libeth.so"]
    );
    assert_eq!(
        cfg.read_var("global", "libpath"),
        Some("/opt/emu/lib:/usr/local/lib/emu")
    );
    assert_eq!(cfg.read_uint32("poll_detector", "jump_width").unwrap(), 0);
}

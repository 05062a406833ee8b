//! Common test utilities and fixtures
//!
//! Every command runs in an isolated home and working directory so that no
//! configuration file or container variable of the host leaks in.

#![allow(dead_code)]

use std::path::Path;

use assert_cmd::Command;

pub const BINARY: &str = "v6-diagnostics";

/// Variables read by the binary that must not come from the host
const HOST_VARIABLES: &[&str] = &[
    "HOST",
    "PORT",
    "TOKEN_FILE",
    "INPUT_FILE",
    "OUTPUT_FILE",
    "TEMPORARY_FOLDER",
    "DATABASE_URI",
    "V6DIAG_CONFIG",
    "RUST_LOG",
];

/// A command for the binary, isolated under `home`
pub fn diag_cmd(home: &Path) -> Command {
    let mut cmd = Command::cargo_bin(BINARY).unwrap();
    for var in HOST_VARIABLES {
        cmd.env_remove(var);
    }
    cmd.env("HOME", home)
        .env("XDG_CONFIG_HOME", home.join(".config"))
        .current_dir(home);
    cmd
}

/// A port on localhost with nothing listening
pub fn closed_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

//! Echo endpoint tests against the real binary
//!
//! The binary is spawned as a child process; the listening address is read
//! from its first line of output.

mod common;

use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpStream;
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use tempfile::TempDir;

const PROBE_MESSAGE: &[u8] = b"Hello vantage6!\n";

fn spawn_echo(home: &TempDir, lifetime_ms: u64) -> (Child, BufReader<std::process::ChildStdout>, String) {
    let mut child = Command::new(assert_cmd::cargo::cargo_bin(common::BINARY))
        .args(["echo", "--bind", "127.0.0.1", "--port", "0", "--lifetime-ms"])
        .arg(lifetime_ms.to_string())
        .env_remove("HOST")
        .env_remove("PORT")
        .env_remove("V6DIAG_CONFIG")
        .env("HOME", home.path())
        .env("XDG_CONFIG_HOME", home.path().join(".config"))
        .current_dir(home.path())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();

    let mut stdout = BufReader::new(child.stdout.take().unwrap());
    let mut line = String::new();
    stdout.read_line(&mut line).unwrap();
    let addr = line
        .trim()
        .strip_prefix("Echo server listening on ")
        .unwrap_or_else(|| panic!("unexpected first line: {line:?}"))
        .to_string();

    (child, stdout, addr)
}

#[test]
fn test_echo_binary_round_trip() {
    let home = TempDir::new().unwrap();
    let (mut child, mut stdout, addr) = spawn_echo(&home, 3_000);

    let mut stream = TcpStream::connect(&addr).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    stream.write_all(PROBE_MESSAGE).unwrap();

    let mut echoed = vec![0u8; PROBE_MESSAGE.len()];
    stream.read_exact(&mut echoed).unwrap();
    assert_eq!(echoed, PROBE_MESSAGE);
    drop(stream);

    let status = child.wait().unwrap();
    assert!(status.success());

    let mut rest = String::new();
    stdout.read_to_string(&mut rest).unwrap();
    assert!(rest.contains("Echo server stopped (Expired)"), "got {rest:?}");
    assert!(rest.contains("1 echoed"), "got {rest:?}");
}

#[test]
fn test_echo_binary_stops_listening_after_lifetime() {
    let home = TempDir::new().unwrap();
    let (mut child, _stdout, addr) = spawn_echo(&home, 300);

    let status = child.wait().unwrap();
    assert!(status.success());
    assert!(TcpStream::connect(&addr).is_err());
}

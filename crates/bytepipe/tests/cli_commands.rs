#![cfg(all(unix, feature = "cli"))]

use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Output, Stdio};
use std::thread;
use std::time::{Duration, Instant};

fn unique_temp_dir(tag: &str) -> PathBuf {
    let dir = PathBuf::from(format!(
        "/tmp/bytepipe-cli-{tag}-{}-{}",
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("time should be after epoch")
            .as_nanos()
    ));
    std::fs::create_dir_all(&dir).expect("temp dir should be creatable");
    dir
}

fn bytepipe() -> Command {
    let mut command = Command::new(env!("CARGO_BIN_EXE_bytepipe"));
    command.args(["--log-level", "error"]);
    command
}

fn wait_for_socket(path: &Path, timeout: Duration) {
    let start = Instant::now();
    loop {
        if UnixStream::connect(path).is_ok() {
            return;
        }
        if start.elapsed() >= timeout {
            panic!("server never came up at {}", path.display());
        }
        thread::sleep(Duration::from_millis(25));
    }
}

fn stop(mut child: Child) {
    let _ = child.kill();
    let _ = child.wait();
}

fn send(endpoint: &str, args: &[&str]) -> Output {
    bytepipe()
        .arg("send")
        .arg(endpoint)
        .args(args)
        .output()
        .expect("send should run")
}

#[test]
fn send_wait_against_echo_server_prints_reply() {
    let dir = unique_temp_dir("echo");
    let sock = dir.join("echo.sock");
    let endpoint = format!("unix:{}", sock.display());

    let server = bytepipe()
        .args(["echo", &endpoint, "--poll", "0.1"])
        .stdout(Stdio::null())
        .spawn()
        .expect("echo should start");
    wait_for_socket(&sock, Duration::from_secs(3));

    let output = send(
        &endpoint,
        &["--data", "hello there", "--wait", "--deadline", "5"],
    );
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    assert!(stdout.contains("\"payload\":\"hello there\""), "stdout: {stdout}");
    assert!(stdout.contains("\"size\":11"));

    stop(server);
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn raw_format_prints_payload_bytes() {
    let dir = unique_temp_dir("raw");
    let sock = dir.join("echo.sock");
    let payload = dir.join("payload.bin");
    std::fs::write(&payload, b"from a file\n").unwrap();
    let endpoint = sock.display().to_string();

    let server = bytepipe()
        .args(["echo", &endpoint])
        .stdout(Stdio::null())
        .spawn()
        .expect("echo should start");
    wait_for_socket(&sock, Duration::from_secs(3));

    let output = bytepipe()
        .args(["--format", "raw", "send", &endpoint, "--wait", "--file"])
        .arg(&payload)
        .output()
        .expect("send should run");
    assert!(output.status.success());
    assert_eq!(output.stdout, b"from a file\n");

    stop(server);
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn listen_prints_received_messages_and_exits_after_count() {
    let dir = unique_temp_dir("listen");
    let sock = dir.join("listen.sock");
    let endpoint = format!("unix:{}", sock.display());

    let listener = bytepipe()
        .args(["--format", "json", "listen", &endpoint, "--count", "2"])
        .stdout(Stdio::piped())
        .spawn()
        .expect("listen should start");
    wait_for_socket(&sock, Duration::from_secs(3));

    assert!(send(&endpoint, &["--data", "first"]).status.success());
    assert!(send(&endpoint, &["--data", "second"]).status.success());

    let output = listener.wait_with_output().expect("listen should exit");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    let lines: Vec<&str> = stdout.lines().collect();
    assert_eq!(lines.len(), 2, "stdout: {stdout}");
    assert!(lines[0].contains("\"payload\":\"first\""));
    assert!(lines[1].contains("\"payload\":\"second\""));
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn send_to_missing_endpoint_is_transport_error() {
    let dir = unique_temp_dir("missing");
    let endpoint = format!("unix:{}", dir.join("absent.sock").display());

    let output = send(&endpoint, &["--data", "x", "--deadline", "1"]);
    assert_eq!(output.status.code(), Some(3));
    assert!(String::from_utf8_lossy(&output.stderr).contains("connect failed"));
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn wait_without_reply_times_out_with_124() {
    let dir = unique_temp_dir("silent");
    let sock = dir.join("silent.sock");
    let endpoint = format!("unix:{}", sock.display());

    // listen never answers
    let listener = bytepipe()
        .args(["listen", &endpoint])
        .stdout(Stdio::null())
        .spawn()
        .expect("listen should start");
    wait_for_socket(&sock, Duration::from_secs(3));

    let start = Instant::now();
    let output = send(&endpoint, &["--data", "anyone?", "--wait", "--deadline", "0.3"]);
    assert_eq!(output.status.code(), Some(124));
    assert!(start.elapsed() < Duration::from_secs(5));

    stop(listener);
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn pipe_feeds_input_and_relays_output() {
    let dir = unique_temp_dir("pipe");
    let input = dir.join("input.txt");
    let lines: String = (0..5000).map(|i| format!("line {i}\n")).collect();
    std::fs::write(&input, &lines).unwrap();

    let output = bytepipe()
        .arg("pipe")
        .arg("--input")
        .arg(&input)
        .args(["--", "cat"])
        .output()
        .expect("pipe should run");

    assert!(output.status.success());
    assert_eq!(output.stdout, lines.as_bytes());
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn pipe_returns_child_exit_code() {
    let output = bytepipe()
        .args(["pipe", "--", "sh", "-c", "printf partial; exit 7"])
        .output()
        .expect("pipe should run");
    assert_eq!(output.status.code(), Some(7));
    assert_eq!(output.stdout, b"partial");
}

#[test]
fn pipe_reports_unknown_program() {
    let output = bytepipe()
        .args(["pipe", "--", "/nonexistent/bytepipe-no-such-program"])
        .output()
        .expect("pipe should run");
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("failed to start"));
}

#[test]
fn version_and_doctor_run() {
    let output = bytepipe().arg("version").output().expect("version should run");
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).starts_with("bytepipe "));

    let output = bytepipe()
        .args(["--format", "json", "doctor"])
        .output()
        .expect("doctor should run");
    assert!(output.status.success());
    let report: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("doctor output should be json");
    assert_eq!(report["overall"], "pass");
}

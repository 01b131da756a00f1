use std::io::{self, Write};
use std::os::unix::net::UnixStream;
use std::time::{Duration, Instant};

use bytepipe_socket::{FramedSocket, SocketError};
use bytepipe_stream::{ChunkedBuffer, Multiplexer, MuxConfig, NotifierKind};
use bytepipe_transport::{Deadline, PipeDescriptor};
use serde::Serialize;

use crate::cmd::DoctorArgs;
use crate::exit::{CliResult, HEALTH_CHECK_FAILED, SUCCESS};
use crate::output::OutputFormat;

const SAMPLE: &[u8] = b"bytepipe doctor sample";
const CHECK_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Clone, Copy, Debug, Serialize)]
#[serde(rename_all = "lowercase")]
enum CheckStatus {
    Pass,
    Fail,
    Info,
    Skip,
}

#[derive(Debug, Serialize)]
struct CheckResult {
    name: String,
    status: CheckStatus,
    detail: String,
}

#[derive(Debug, Serialize)]
struct DoctorOutput {
    schema_id: &'static str,
    checks: Vec<CheckResult>,
    overall: &'static str,
}

pub fn run(_args: DoctorArgs, format: OutputFormat) -> CliResult<i32> {
    let mut checks = vec![platform_check()];
    checks.extend(notifier_checks());
    checks.push(multiplexer_check());
    checks.push(framing_check());
    checks.push(compiled_features_check());

    let has_fail = checks.iter().any(|c| matches!(c.status, CheckStatus::Fail));
    let overall = if has_fail { "fail" } else { "pass" };

    let output = DoctorOutput {
        schema_id: "bytepipe/cli/v1/doctor-report",
        checks,
        overall,
    };

    print_doctor(&output, format);

    if has_fail {
        Ok(HEALTH_CHECK_FAILED)
    } else {
        Ok(SUCCESS)
    }
}

fn print_doctor(output: &DoctorOutput, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string(output).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table | OutputFormat::Pretty => {
            println!("bytepipe doctor\n");
            for c in &output.checks {
                println!(
                    "  [{:>4}] {:<22} {}",
                    status_text(c.status),
                    c.name,
                    c.detail
                );
            }
            if output.overall == "pass" {
                println!("\n  Result: all checks passed");
            } else {
                println!("\n  Result: one or more checks failed");
            }
        }
        OutputFormat::Raw => {
            println!("{}", output.overall);
        }
    }
}

fn status_text(status: CheckStatus) -> &'static str {
    match status {
        CheckStatus::Pass => "PASS",
        CheckStatus::Fail => "FAIL",
        CheckStatus::Info => "INFO",
        CheckStatus::Skip => "SKIP",
    }
}

fn platform_check() -> CheckResult {
    CheckResult {
        name: "platform".to_string(),
        status: CheckStatus::Info,
        detail: format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH),
    }
}

fn notifier_checks() -> Vec<CheckResult> {
    let mut results = Vec::new();
    for kind in [NotifierKind::Poll, NotifierKind::Epoll] {
        let name = format!("notifier_{kind}");
        let result = match kind.build() {
            Ok(_) => CheckResult {
                name,
                status: CheckStatus::Pass,
                detail: "available".to_string(),
            },
            Err(err) if err.kind() == io::ErrorKind::Unsupported => CheckResult {
                name,
                status: CheckStatus::Skip,
                detail: err.to_string(),
            },
            Err(err) => CheckResult {
                name,
                status: CheckStatus::Fail,
                detail: err.to_string(),
            },
        };
        results.push(result);
    }
    results.push(CheckResult {
        name: "notifier_default".to_string(),
        status: CheckStatus::Info,
        detail: NotifierKind::Auto.resolve().to_string(),
    });
    results
}

/// Start a private multiplexer, push a few bytes through it, shut it down.
fn multiplexer_check() -> CheckResult {
    let name = "multiplexer".to_string();
    match relay_through_multiplexer() {
        Ok(elapsed) => CheckResult {
            name,
            status: CheckStatus::Pass,
            detail: format!("relay round trip in {} ms", elapsed.as_millis()),
        },
        Err(detail) => CheckResult {
            name,
            status: CheckStatus::Fail,
            detail,
        },
    }
}

fn relay_through_multiplexer() -> Result<Duration, String> {
    let mux = Multiplexer::with_config(MuxConfig {
        tick: Duration::from_millis(10),
        idle_timeout: Duration::from_millis(100),
        ..MuxConfig::default()
    });
    let (local, mut remote) = UnixStream::pair().map_err(|err| err.to_string())?;
    let descriptor = PipeDescriptor::new(local).map_err(|err| err.to_string())?;

    let start = Instant::now();
    let buffer = ChunkedBuffer::new();
    buffer
        .attach_input_with(&mux, descriptor)
        .map_err(|err| err.to_string())?;
    remote.write_all(SAMPLE).map_err(|err| err.to_string())?;

    while buffer.len() < SAMPLE.len() {
        if start.elapsed() > CHECK_TIMEOUT {
            mux.shutdown();
            return Err("no data relayed within 2 s".to_string());
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    let elapsed = start.elapsed();
    let got = buffer.read(None);
    mux.shutdown();

    if got.as_ref() == SAMPLE {
        Ok(elapsed)
    } else {
        Err(format!("relayed {} unexpected bytes", got.len()))
    }
}

fn framing_check() -> CheckResult {
    let name = "framed_socket".to_string();
    let exchange = || -> Result<(), SocketError> {
        let (mut left, mut right) = FramedSocket::pair()?;
        left.send_message(SAMPLE)?;
        match right.receive_message(Some(Deadline::after(CHECK_TIMEOUT)))? {
            Some(message) if message.as_ref() == SAMPLE => Ok(()),
            Some(_) => Err(SocketError::MalformedHeader("payload mismatch".to_string())),
            None => Err(SocketError::Io(io::ErrorKind::TimedOut.into())),
        }
    };
    match exchange() {
        Ok(()) => CheckResult {
            name,
            status: CheckStatus::Pass,
            detail: "message round trip over socket pair".to_string(),
        },
        Err(err) => CheckResult {
            name,
            status: CheckStatus::Fail,
            detail: err.to_string(),
        },
    }
}

fn compiled_features_check() -> CheckResult {
    let mut features = Vec::new();
    if cfg!(feature = "async") {
        features.push("async");
    }
    if cfg!(feature = "cli") {
        features.push("cli");
    }

    CheckResult {
        name: "compiled_features".to_string(),
        status: CheckStatus::Info,
        detail: features.join(", "),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doctor_output_has_overall_status() {
        let checks = vec![CheckResult {
            name: "x".to_string(),
            status: CheckStatus::Pass,
            detail: "ok".to_string(),
        }];
        let output = DoctorOutput {
            schema_id: "x",
            checks,
            overall: "pass",
        };
        let json = serde_json::to_string(&output).expect("doctor output should serialize");
        assert!(json.contains("\"overall\":\"pass\""));
    }

    #[test]
    fn checks_pass_on_a_healthy_host() {
        assert!(matches!(multiplexer_check().status, CheckStatus::Pass));
        assert!(matches!(framing_check().status, CheckStatus::Pass));
        let poll = notifier_checks().remove(0);
        assert_eq!(poll.name, "notifier_poll");
        assert!(matches!(poll.status, CheckStatus::Pass));
    }
}

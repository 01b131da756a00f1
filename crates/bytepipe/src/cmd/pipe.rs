use std::fs;
use std::io::{self, Write};
use std::os::unix::process::ExitStatusExt;
use std::process::{Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytepipe_stream::ChunkedBuffer;
use bytepipe_transport::PipeDescriptor;
use tracing::{debug, info};

use crate::cmd::{install_ctrlc_handler, PipeArgs};
use crate::exit::{io_error, stream_error, transport_error, CliError, CliResult, FAILURE, USAGE};

const DRAIN_INTERVAL: Duration = Duration::from_millis(10);

/// Run a child process with its stdout (and optionally stdin) serviced by
/// the global multiplexer, copying output to our stdout as it arrives.
pub fn run(args: PipeArgs) -> CliResult<i32> {
    let (program, rest) = args
        .command
        .split_first()
        .ok_or_else(|| CliError::new(USAGE, "no command given"))?;

    let feed = match &args.input {
        Some(path) => Some(
            fs::read(path)
                .map_err(|err| io_error(&format!("failed reading {}", path.display()), err))?,
        ),
        None => None,
    };

    let mut command = Command::new(program);
    command.args(rest).stdout(Stdio::piped());
    if feed.is_some() {
        command.stdin(Stdio::piped());
    }
    let mut child = command
        .spawn()
        .map_err(|err| io_error(&format!("failed to start {program}"), err))?;
    info!(pid = child.id(), %program, "child started");

    let output = ChunkedBuffer::with_block_capacity(args.block_size);
    if let Some(stdout) = child.stdout.take() {
        let descriptor =
            PipeDescriptor::new(stdout).map_err(|err| transport_error("child stdout", err))?;
        output
            .attach_input(descriptor)
            .map_err(|err| stream_error("attach stdout", err))?;
    }

    // Held until the child exits; dropping it would cut the feed short.
    let _input = match (feed, child.stdin.take()) {
        (Some(data), Some(stdin)) => {
            let input = ChunkedBuffer::new_with(&data);
            let descriptor =
                PipeDescriptor::new(stdin).map_err(|err| transport_error("child stdin", err))?;
            input
                .attach_output(descriptor)
                .map_err(|err| stream_error("attach stdin", err))?;
            input.finish();
            debug!(bytes = data.len(), "feeding child stdin");
            Some(input)
        }
        _ => None,
    };

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone())?;

    if let Err(err) = copy_to_stdout(&output, &running) {
        let _ = child.kill();
        let _ = child.wait();
        return Err(io_error("writing output failed", err));
    }
    if !running.load(Ordering::SeqCst) {
        debug!("interrupted; killing child");
        let _ = child.kill();
    }

    let status = child
        .wait()
        .map_err(|err| io_error("waiting for child failed", err))?;
    info!(%status, "child exited");
    Ok(exit_code(status))
}

fn copy_to_stdout(output: &ChunkedBuffer, running: &AtomicBool) -> io::Result<()> {
    let mut stdout = io::stdout().lock();
    while running.load(Ordering::SeqCst) {
        // Sample `closed` before reading so the final bytes are never skipped.
        let ended = output.is_closed();
        let chunk = output.read(None);
        if !chunk.is_empty() {
            stdout.write_all(&chunk)?;
            stdout.flush()?;
            continue;
        }
        if ended {
            break;
        }
        std::thread::sleep(DRAIN_INTERVAL);
    }
    Ok(())
}

// Shell convention: killed by signal N exits with 128 + N.
fn exit_code(status: ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => 128 + signal,
        (None, None) => FAILURE,
    }
}

//! Feed a file through `sort` with both ends serviced by the multiplexer.
//!
//! Run with:
//!   cargo run --example pipe-subprocess -- Cargo.toml

use std::process::{Command, Stdio};
use std::time::Duration;

use bytepipe::transport::PipeDescriptor;
use bytepipe::ChunkedBuffer;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let path = std::env::args().nth(1).unwrap_or_else(|| "Cargo.toml".to_string());
    let data = std::fs::read(&path)?;
    let input = ChunkedBuffer::new_with(&data);

    let mut child = Command::new("sort")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()?;

    let output = ChunkedBuffer::new();
    if let Some(stdout) = child.stdout.take() {
        output.attach_input(PipeDescriptor::new(stdout)?)?;
    }
    if let Some(stdin) = child.stdin.take() {
        input.attach_output(PipeDescriptor::new(stdin)?)?;
        // close sort's stdin once everything is written
        input.finish();
    }

    let mut sorted = Vec::new();
    loop {
        let ended = output.is_closed();
        let chunk = output.read(None);
        sorted.extend_from_slice(&chunk);
        if ended && chunk.is_empty() {
            break;
        }
        std::thread::sleep(Duration::from_millis(10));
    }

    child.wait()?;
    print!("{}", String::from_utf8_lossy(&sorted));
    eprintln!(
        "{} bytes in, {} bytes out, {} blocks pooled",
        data.len(),
        sorted.len(),
        output.pool_len()
    );
    Ok(())
}

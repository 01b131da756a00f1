//! Minimal echo server: accepts one client and echoes its messages back.
//!
//! Run with:
//!   cargo run --example echo-server
//!
//! In another terminal:
//!   cargo run --features cli -- send unix:/tmp/bytepipe-echo-<pid>/echo.sock \
//!     --data hello --wait --deadline 3

use std::fs;

use bytepipe::{Deadline, FramedListener, SocketError};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let sock_dir = std::env::temp_dir().join(format!("bytepipe-echo-{}", std::process::id()));
    fs::create_dir_all(&sock_dir)?;
    let sock_path = sock_dir.join("echo.sock");

    let listener = FramedListener::bind_unix(&sock_path)?;
    eprintln!("Listening on unix:{}", sock_path.display());

    let mut socket = listener.accept()?;
    eprintln!("Client connected: {}", socket.peer_label());

    loop {
        match socket.receive_message(Some(Deadline::from_secs_f64(30.0))) {
            Ok(Some(message)) => {
                eprintln!("Received {} bytes", message.len());
                socket.send_message(&message)?;
            }
            Ok(None) => eprintln!("Nothing for 30 s, still waiting"),
            Err(SocketError::Closed) => {
                eprintln!("Client disconnected");
                break;
            }
            Err(e) => return Err(e.into()),
        }
    }

    drop(listener);
    let _ = fs::remove_dir_all(&sock_dir);
    Ok(())
}

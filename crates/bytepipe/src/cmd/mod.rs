use clap::{Args, Subcommand};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytepipe_socket::Endpoint;

use crate::exit::{CliError, CliResult};
use crate::output::OutputFormat;

pub mod doctor;
pub mod echo;
pub mod listen;
pub mod pipe;
pub mod send;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start an echo server.
    Echo(EchoArgs),
    /// Send a single message.
    Send(SendArgs),
    /// Listen and print received messages.
    Listen(ListenArgs),
    /// Run a command with its output shuttled through the multiplexer.
    Pipe(PipeArgs),
    /// Show version information.
    Version(VersionArgs),
    /// Run local environment health checks.
    Doctor(DoctorArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Echo(args) => echo::run(args, format),
        Command::Send(args) => send::run(args, format),
        Command::Listen(args) => listen::run(args, format),
        Command::Pipe(args) => pipe::run(args),
        Command::Version(args) => version::run(args),
        Command::Doctor(args) => doctor::run(args, format),
    }
}

#[derive(Args, Debug)]
pub struct EchoArgs {
    /// Address to bind: host:port, or a socket path (unix:PATH).
    pub endpoint: Endpoint,
    /// Seconds to wait for each message before checking for shutdown.
    #[arg(long, default_value = "1")]
    pub poll: f64,
}

#[derive(Args, Debug)]
pub struct SendArgs {
    /// Address to connect to: host:port, or a socket path (unix:PATH).
    pub endpoint: Endpoint,
    /// Raw string payload.
    #[arg(long, conflicts_with = "file")]
    pub data: Option<String>,
    /// Read payload from file.
    #[arg(long, conflicts_with = "data")]
    pub file: Option<PathBuf>,
    /// Wait for one response message and print it.
    #[arg(long)]
    pub wait: bool,
    /// Deadline in seconds; values of 1000 or more are a UNIX timestamp.
    #[arg(long, default_value = "10")]
    pub deadline: f64,
}

#[derive(Args, Debug)]
pub struct ListenArgs {
    /// Address to bind: host:port, or a socket path (unix:PATH).
    pub endpoint: Endpoint,
    /// Exit after receiving N messages.
    #[arg(long)]
    pub count: Option<usize>,
    /// Seconds to wait for each message before checking for shutdown.
    #[arg(long, default_value = "1")]
    pub poll: f64,
}

#[derive(Args, Debug)]
pub struct PipeArgs {
    /// Feed this file to the command's stdin.
    #[arg(long, value_name = "FILE")]
    pub input: Option<PathBuf>,
    /// Block size for the output buffer, in bytes.
    #[arg(long, default_value_t = bytepipe_stream::Block::DEFAULT_CAPACITY)]
    pub block_size: usize,
    /// Command and arguments to run.
    #[arg(last = true, required = true, num_args = 1..)]
    pub command: Vec<String>,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

#[derive(Args, Debug, Default)]
pub struct DoctorArgs {}

/// First Ctrl-C clears `running`; a second one exits immediately.
pub(crate) fn install_ctrlc_handler(running: Arc<AtomicBool>) -> CliResult<()> {
    ctrlc::set_handler(move || {
        if !running.swap(false, Ordering::SeqCst) {
            std::process::exit(130);
        }
    })
    .map_err(|err| {
        CliError::new(
            crate::exit::INTERNAL,
            format!("signal handler setup failed: {err}"),
        )
    })
}

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytepipe_socket::{FramedListener, FramedSocket, SocketError};
use bytepipe_transport::Deadline;
use tracing::{debug, info, warn};

use crate::cmd::{install_ctrlc_handler, EchoArgs};
use crate::exit::{socket_error, CliResult, SUCCESS};
use crate::output::OutputFormat;

pub fn run(args: EchoArgs, _format: OutputFormat) -> CliResult<i32> {
    let listener =
        FramedListener::bind_endpoint(&args.endpoint).map_err(|err| socket_error("bind failed", err))?;
    info!(endpoint = %args.endpoint, "echo server listening");

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone())?;

    let poll = Deadline::from_secs_f64(args.poll);

    while running.load(Ordering::SeqCst) {
        let mut socket = listener
            .accept()
            .map_err(|err| socket_error("accept failed", err))?;
        let peer = socket.peer_label();
        info!(%peer, "client connected");

        // A misbehaving client only ends its own session.
        if let Err(err) = serve(&mut socket, poll, &running) {
            warn!(%peer, error = %err, "session ended with error");
        }
    }

    Ok(SUCCESS)
}

fn serve(socket: &mut FramedSocket, poll: Deadline, running: &AtomicBool) -> Result<(), SocketError> {
    while running.load(Ordering::SeqCst) {
        match socket.receive_message(Some(poll)) {
            Ok(Some(payload)) => socket.send_message(&payload)?,
            Ok(None) => continue,
            Err(SocketError::Closed) => {
                debug!("client disconnected");
                return Ok(());
            }
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

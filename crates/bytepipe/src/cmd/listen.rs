use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytepipe_socket::{FramedListener, FramedSocket, SocketError};
use bytepipe_transport::Deadline;
use tracing::{debug, info, warn};

use crate::cmd::{install_ctrlc_handler, ListenArgs};
use crate::exit::{socket_error, CliResult, SUCCESS};
use crate::output::{print_message, OutputFormat};

pub fn run(args: ListenArgs, format: OutputFormat) -> CliResult<i32> {
    let listener =
        FramedListener::bind_endpoint(&args.endpoint).map_err(|err| socket_error("bind failed", err))?;
    info!(endpoint = %args.endpoint, "listening");

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone())?;

    let poll = Deadline::from_secs_f64(args.poll);
    let mut printed = 0usize;

    while running.load(Ordering::SeqCst) {
        let mut socket = listener
            .accept()
            .map_err(|err| socket_error("accept failed", err))?;
        let peer = socket.peer_label();

        let limit = args.count;
        let print = |payload: &[u8]| print_message(payload, &peer, format);
        match receive_session(&mut socket, poll, &running, limit, &mut printed, print) {
            Ok(SessionEnd::LimitReached) => return Ok(SUCCESS),
            Ok(SessionEnd::Disconnected) => {}
            // A misbehaving client only ends its own session.
            Err(err) => warn!(%peer, error = %err, "session ended with error"),
        }
    }

    Ok(SUCCESS)
}

#[derive(Debug, PartialEq, Eq)]
enum SessionEnd {
    Disconnected,
    LimitReached,
}

/// Hand each message from one client to `on_message` until the client goes
/// away, the shutdown flag clears, or `printed` reaches `limit`.
fn receive_session<F>(
    socket: &mut FramedSocket,
    poll: Deadline,
    running: &AtomicBool,
    limit: Option<usize>,
    printed: &mut usize,
    mut on_message: F,
) -> Result<SessionEnd, SocketError>
where
    F: FnMut(&[u8]),
{
    while running.load(Ordering::SeqCst) {
        let payload = match socket.receive_message(Some(poll)) {
            Ok(Some(payload)) => payload,
            Ok(None) => continue,
            Err(SocketError::Closed) => {
                debug!("peer disconnected");
                return Ok(SessionEnd::Disconnected);
            }
            Err(err) => return Err(err),
        };

        on_message(&payload);
        *printed = printed.saturating_add(1);
        if limit.is_some_and(|count| *printed >= count) {
            return Ok(SessionEnd::LimitReached);
        }
    }
    Ok(SessionEnd::Disconnected)
}

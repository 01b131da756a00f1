use std::fs;

use bytepipe_socket::FramedSocket;
use bytepipe_transport::Deadline;

use crate::cmd::SendArgs;
use crate::exit::{io_error, socket_error, timed_out, CliResult, SUCCESS};
use crate::output::{print_message, OutputFormat};

pub fn run(args: SendArgs, format: OutputFormat) -> CliResult<i32> {
    let payload = resolve_payload(&args)?;

    let mut socket = FramedSocket::connect_endpoint(&args.endpoint, deadline(&args))
        .map_err(|err| socket_error("connect failed", err))?;
    socket.set_deadline(deadline(&args));

    socket
        .send_message(&payload)
        .map_err(|err| socket_error("send failed", err))?;

    if args.wait {
        let reply = socket
            .receive_message(None)
            .map_err(|err| socket_error("receive failed", err))?
            .ok_or_else(|| timed_out("receive failed"))?;
        print_message(&reply, &socket.peer_label(), format);
    }

    Ok(SUCCESS)
}

// Relative deadlines restart for each phase; absolute ones are shared.
fn deadline(args: &SendArgs) -> Deadline {
    Deadline::from_secs_f64(args.deadline)
}

fn resolve_payload(args: &SendArgs) -> CliResult<Vec<u8>> {
    if let Some(data) = &args.data {
        return Ok(data.as_bytes().to_vec());
    }
    if let Some(path) = &args.file {
        return fs::read(path)
            .map_err(|err| io_error(&format!("failed reading {}", path.display()), err));
    }
    Ok(Vec::new())
}

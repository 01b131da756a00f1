use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use bytepipe_transport::Descriptor;
use tracing::{debug, error, info, trace, warn};

use crate::buffer::{ChunkedBuffer, WeakBuffer};
use crate::multiplexer::{Direction, Registration, Shared};
use crate::notifier::{Interest, Readiness, ReadinessNotifier};

/// A descriptor owned by the worker thread.
struct Entry {
    fd: RawFd,
    token: u64,
    buffer: WeakBuffer,
    descriptor: Box<dyn Descriptor>,
    direction: Direction,
    interest: Interest,
}

impl Entry {
    fn new(registration: Registration) -> Self {
        let interest = match registration.direction {
            Direction::Read => Interest::READABLE,
            // armed once the buffer has something to drain
            Direction::Write => Interest::NONE,
        };
        Self {
            fd: registration.descriptor.raw_fd(),
            token: registration.token,
            buffer: registration.buffer,
            descriptor: registration.descriptor,
            direction: registration.direction,
            interest,
        }
    }

    /// The bound buffer, if someone still owns it and it has not been closed.
    fn live_buffer(&self) -> Option<ChunkedBuffer> {
        self.buffer.upgrade().filter(|buffer| !buffer.is_closed())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Keep,
    Remove(&'static str),
}

/// Body of the multiplexer thread.
pub(crate) fn run(shared: Arc<Shared>) {
    let config = shared.config.clone();
    let mut notifier = match config.notifier.build() {
        Ok(notifier) => notifier,
        Err(err) => {
            error!(notifier = %config.notifier, error = %err, "failed to create readiness notifier");
            finish(&shared);
            return;
        }
    };
    info!(notifier = notifier.name(), "multiplexer thread running");

    let mut entries: HashMap<u64, Entry> = HashMap::new();
    let mut events: Vec<Readiness> = Vec::new();
    let mut scratch = vec![0u8; config.chunk_size.max(1)];
    let mut idle_since: Option<Instant> = None;

    loop {
        let (incoming, stopping) = {
            let mut control = shared.control.lock();
            (std::mem::take(&mut control.pending), control.shutdown)
        };
        for registration in incoming {
            let entry = Entry::new(registration);
            if let Err(err) = notifier.register(entry.fd, entry.token, entry.interest) {
                warn!(fd = entry.fd, error = %err, "descriptor rejected by readiness notifier");
                retire(&shared, notifier.as_mut(), entry, "rejected");
                continue;
            }
            debug!(fd = entry.fd, token = entry.token, direction = %entry.direction, "descriptor registered");
            entries.insert(entry.token, entry);
        }
        if stopping {
            shutdown_all(&shared, notifier.as_mut(), entries);
            info!("multiplexer thread stopped");
            return;
        }

        let dead: Vec<(u64, &'static str)> = entries
            .values()
            .filter_map(|entry| match entry.live_buffer() {
                None => Some((entry.token, "buffer released")),
                Some(buffer) if entry.direction == Direction::Write && drained(&buffer) => {
                    Some((entry.token, "drained"))
                }
                Some(_) => None,
            })
            .collect();
        for (token, reason) in dead {
            if let Some(entry) = entries.remove(&token) {
                retire(&shared, notifier.as_mut(), entry, reason);
            }
        }
        shared.active.store(entries.len(), Ordering::Release);

        if entries.is_empty() {
            let since = *idle_since.get_or_insert_with(Instant::now);
            if since.elapsed() >= config.idle_timeout {
                let mut control = shared.control.lock();
                if control.pending.is_empty() && !control.shutdown {
                    control.running = false;
                    info!(idle = ?config.idle_timeout, "multiplexer thread idle, exiting");
                    return;
                }
                continue;
            }
        } else {
            idle_since = None;
        }

        arm_write_interest(notifier.as_mut(), &mut entries);

        events.clear();
        if let Err(err) = notifier.wait(&mut events, config.tick) {
            error!(error = %err, "readiness wait failed");
            std::thread::sleep(config.tick);
            continue;
        }

        for ready in &events {
            let Some(entry) = entries.get_mut(&ready.token) else {
                continue;
            };
            let outcome = match entry.direction {
                Direction::Read => service_read(entry, *ready, &mut scratch),
                Direction::Write => service_write(entry, *ready, config.chunk_size),
            };
            if let Outcome::Remove(reason) = outcome {
                if let Some(entry) = entries.remove(&ready.token) {
                    retire(&shared, notifier.as_mut(), entry, reason);
                }
            }
        }
        shared.active.store(entries.len(), Ordering::Release);
    }
}

fn arm_write_interest(notifier: &mut dyn ReadinessNotifier, entries: &mut HashMap<u64, Entry>) {
    for entry in entries.values_mut() {
        if entry.direction != Direction::Write {
            continue;
        }
        let wanted = match entry.buffer.upgrade() {
            Some(buffer) if !buffer.is_empty() => Interest::WRITABLE,
            _ => Interest::NONE,
        };
        if wanted == entry.interest {
            continue;
        }
        match notifier.modify(entry.fd, entry.token, wanted) {
            Ok(()) => entry.interest = wanted,
            Err(err) => warn!(fd = entry.fd, error = %err, "failed to update write interest"),
        }
    }
}

/// Move at most one chunk from the descriptor into its buffer.
fn service_read(entry: &mut Entry, ready: Readiness, scratch: &mut [u8]) -> Outcome {
    if !(ready.readable || ready.hangup || ready.error) {
        return Outcome::Keep;
    }
    let Some(buffer) = entry.live_buffer() else {
        return Outcome::Remove("buffer released");
    };

    match entry.descriptor.read_some(scratch) {
        Ok(0) => Outcome::Remove("end of stream"),
        Ok(n) => {
            buffer.write(&scratch[..n]);
            trace!(fd = entry.fd, bytes = n, "read <-- descriptor");
            Outcome::Keep
        }
        Err(err) if is_transient(&err) => Outcome::Keep,
        Err(err) => {
            warn!(fd = entry.fd, error = %err, "descriptor read failed");
            Outcome::Remove("read error")
        }
    }
}

/// Move at most one chunk from the buffer into the descriptor, rolling back
/// whatever the descriptor did not accept.
fn service_write(entry: &mut Entry, ready: Readiness, chunk_size: usize) -> Outcome {
    let Some(buffer) = entry.live_buffer() else {
        return Outcome::Remove("buffer released");
    };

    if ready.writable {
        let chunk = buffer.read(Some(chunk_size));
        if !chunk.is_empty() {
            let accepted = match entry.descriptor.write_some(&chunk) {
                Ok(n) => n.min(chunk.len()),
                Err(err) if is_transient(&err) => 0,
                Err(err) => {
                    restore(&buffer, entry.fd, chunk.len());
                    warn!(fd = entry.fd, error = %err, "descriptor write failed");
                    return Outcome::Remove("write error");
                }
            };
            trace!(fd = entry.fd, bytes = accepted, "write --> descriptor");
            restore(&buffer, entry.fd, chunk.len() - accepted);
        }
    }

    if ready.hangup || ready.error {
        Outcome::Remove("hang-up")
    } else if drained(&buffer) {
        Outcome::Remove("drained")
    } else {
        Outcome::Keep
    }
}

/// A finished buffer with nothing left to hand to its output descriptor.
fn drained(buffer: &ChunkedBuffer) -> bool {
    buffer.is_finished() && buffer.is_empty()
}

fn restore(buffer: &ChunkedBuffer, fd: RawFd, unsent: usize) {
    if let Err(err) = buffer.rollback(unsent) {
        error!(fd, error = %err, "failed to roll back unsent bytes");
    }
}

fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

/// Deregister, drop the claim, then close the descriptor and its buffer.
///
/// The claim goes first: once the descriptor is closed the OS may hand the
/// same number to a new pipe.
fn retire(
    shared: &Shared,
    notifier: &mut dyn ReadinessNotifier,
    mut entry: Entry,
    reason: &'static str,
) {
    if let Err(err) = notifier.deregister(entry.fd) {
        trace!(fd = entry.fd, error = %err, "deregister failed");
    }
    shared.control.lock().claimed.remove(&entry.fd);
    release(&mut entry);
    debug!(fd = entry.fd, token = entry.token, direction = %entry.direction, reason, "descriptor released");
}

fn release(entry: &mut Entry) {
    entry.descriptor.close();
    if let Some(buffer) = entry.buffer.upgrade() {
        buffer.close();
    }
}

fn shutdown_all(
    shared: &Shared,
    notifier: &mut dyn ReadinessNotifier,
    entries: HashMap<u64, Entry>,
) {
    for (_, entry) in entries {
        retire(shared, notifier, entry, "shutdown");
    }
    finish(shared);
}

/// Close anything still queued and mark the thread as stopped.
///
/// Queued entries are released after the control lock is dropped: closing a
/// buffer takes its attachment lock, which `attach` holds while registering.
fn finish(shared: &Shared) {
    let pending = {
        let mut control = shared.control.lock();
        let pending = std::mem::take(&mut control.pending);
        for registration in &pending {
            control.claimed.remove(&registration.descriptor.raw_fd());
        }
        control.running = false;
        control.shutdown = false;
        pending
    };
    shared.active.store(0, Ordering::Release);
    for registration in pending {
        let mut entry = Entry::new(registration);
        release(&mut entry);
    }
}

use std::collections::HashSet;
use std::fmt;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;
use std::time::Duration;

use bytepipe_transport::Descriptor;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::buffer::WeakBuffer;
use crate::error::{Result, StreamError};
use crate::notifier::NotifierKind;
use crate::worker;

/// Default wait per tick.
pub const DEFAULT_TICK: Duration = Duration::from_millis(100);
/// Default time without registrations before the thread exits.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(20);
/// Default bytes moved per descriptor per tick.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Which way bytes flow between a descriptor and its buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Descriptor -> buffer.
    Read,
    /// Buffer -> descriptor.
    Write,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Read => f.write_str("input"),
            Direction::Write => f.write_str("output"),
        }
    }
}

/// Configuration for a [`Multiplexer`].
#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// Upper bound on each readiness wait. Default: 100 ms.
    pub tick: Duration,
    /// How long the thread survives with nothing registered. Default: 20 s.
    pub idle_timeout: Duration,
    /// Maximum bytes moved per descriptor per tick. Default: 64 KiB.
    pub chunk_size: usize,
    /// Readiness mechanism. Default: [`NotifierKind::Auto`].
    pub notifier: NotifierKind,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            tick: DEFAULT_TICK,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            chunk_size: DEFAULT_CHUNK_SIZE,
            notifier: NotifierKind::Auto,
        }
    }
}

/// Shuttles bytes between descriptors and their [`ChunkedBuffer`]s on one
/// background thread.
///
/// The thread is started by the first registration and exits on its own
/// after [`MuxConfig::idle_timeout`] with nothing registered; the next
/// registration starts a fresh one. [`Multiplexer::global`] is the
/// process-wide instance used by [`ChunkedBuffer::attach_input`] and
/// [`ChunkedBuffer::attach_output`]; it lives until process exit or an
/// explicit [`Multiplexer::shutdown`].
///
/// The multiplexer never reports errors to the threads that feed it. A
/// descriptor that fails, hangs up or outlives its buffer is closed and
/// dropped, and its buffer is closed.
///
/// [`ChunkedBuffer`]: crate::ChunkedBuffer
/// [`ChunkedBuffer::attach_input`]: crate::ChunkedBuffer::attach_input
/// [`ChunkedBuffer::attach_output`]: crate::ChunkedBuffer::attach_output
#[derive(Clone)]
pub struct Multiplexer {
    shared: Arc<Shared>,
}

pub(crate) struct Shared {
    pub(crate) config: MuxConfig,
    pub(crate) control: Mutex<Control>,
    pub(crate) active: AtomicUsize,
    next_token: AtomicU64,
    starts: AtomicU64,
}

/// State shared between callers and the worker thread.
pub(crate) struct Control {
    pub(crate) pending: Vec<Registration>,
    // descriptor numbers currently owned by a registration
    pub(crate) claimed: HashSet<RawFd>,
    pub(crate) running: bool,
    pub(crate) shutdown: bool,
    worker: Option<JoinHandle<()>>,
}

/// A descriptor waiting to be picked up by the worker thread.
pub(crate) struct Registration {
    pub(crate) token: u64,
    pub(crate) buffer: WeakBuffer,
    pub(crate) descriptor: Box<dyn Descriptor>,
    pub(crate) direction: Direction,
}

static GLOBAL: OnceLock<Multiplexer> = OnceLock::new();

impl Multiplexer {
    /// Create a multiplexer with default configuration. No thread is started yet.
    pub fn new() -> Self {
        Self::with_config(MuxConfig::default())
    }

    /// Create a multiplexer with explicit configuration.
    pub fn with_config(config: MuxConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                control: Mutex::new(Control {
                    pending: Vec::new(),
                    claimed: HashSet::new(),
                    running: false,
                    shutdown: false,
                    worker: None,
                }),
                active: AtomicUsize::new(0),
                next_token: AtomicU64::new(1),
                starts: AtomicU64::new(0),
            }),
        }
    }

    /// The process-wide multiplexer.
    pub fn global() -> &'static Multiplexer {
        GLOBAL.get_or_init(Multiplexer::new)
    }

    pub fn config(&self) -> &MuxConfig {
        &self.shared.config
    }

    #[cfg(test)]
    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    /// Hand `descriptor` to the worker thread, bound to `buffer`.
    ///
    /// Starts (or restarts) the worker thread if it is not running. A
    /// descriptor number can only be registered once at a time.
    pub(crate) fn register(
        &self,
        buffer: WeakBuffer,
        descriptor: Box<dyn Descriptor>,
        direction: Direction,
    ) -> Result<u64> {
        let fd = descriptor.raw_fd();
        let token = self.shared.next_token.fetch_add(1, Ordering::Relaxed);

        let mut control = self.shared.control.lock();
        if !control.claimed.insert(fd) {
            return Err(StreamError::DescriptorInUse { fd });
        }
        control.pending.push(Registration {
            token,
            buffer,
            descriptor,
            direction,
        });
        debug!(fd, token, %direction, "descriptor queued for multiplexer");

        if !control.running {
            let shared = Arc::clone(&self.shared);
            let spawned = std::thread::Builder::new()
                .name("bytepipe-mux".to_string())
                .spawn(move || worker::run(shared));
            match spawned {
                Ok(handle) => {
                    control.running = true;
                    control.worker = Some(handle);
                    let starts = self.shared.starts.fetch_add(1, Ordering::Relaxed) + 1;
                    info!(starts, "multiplexer thread started");
                }
                Err(err) => {
                    control.claimed.remove(&fd);
                    control.pending.pop();
                    return Err(StreamError::Spawn(err));
                }
            }
        }

        Ok(token)
    }

    /// True while the worker thread is alive.
    pub fn is_running(&self) -> bool {
        self.shared.control.lock().running
    }

    /// Descriptors registered or waiting to be picked up.
    pub fn registered(&self) -> usize {
        let pending = self.shared.control.lock().pending.len();
        self.shared.active.load(Ordering::Acquire) + pending
    }

    /// How many times a worker thread has been started.
    pub fn thread_starts(&self) -> u64 {
        self.shared.starts.load(Ordering::Relaxed)
    }

    /// Stop the worker thread and wait for it to exit.
    ///
    /// Every registered descriptor is closed and every bound buffer is
    /// closed. Registrations that race with the shutdown are closed too. The
    /// next registration starts a fresh thread.
    pub fn shutdown(&self) {
        let handle = {
            let mut control = self.shared.control.lock();
            if !control.running {
                return;
            }
            control.shutdown = true;
            control.worker.take()
        };

        // The worker clears `running` and `shutdown` itself on the way out.
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::error!("multiplexer thread panicked");
                let mut control = self.shared.control.lock();
                control.shutdown = false;
                control.running = false;
            }
        }
    }
}

impl Default for Multiplexer {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Multiplexer")
            .field("config", &self.shared.config)
            .field("running", &self.is_running())
            .field("registered", &self.registered())
            .finish()
    }
}
